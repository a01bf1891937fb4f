//! The persisted local replica.

use serde::{Deserialize, Serialize};

use crate::{serde_b64, PublicKey, WalletHash};

/// Everything the client persists about its wallet.
///
/// After every successful sync `remote_hash == sha256(encrypted_wallet)` and
/// both describe the version last observed on (or pushed to) the remote.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalReplicaState {
    /// Backup server address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Whether the user wants a remote copy (`None` = never decided).
    #[serde(
        rename = "remoteCopyDesired",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_copy: Option<bool>,
    /// One-time code authorizing the first upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_token: Option<String>,
    /// Public key the wallet is encrypted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_public_key: Option<PublicKey>,
    /// Envelope bytes of the current local wallet.
    #[serde(
        default,
        with = "serde_b64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_wallet: Option<Vec<u8>>,
    /// Last hash known to be in sync with the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_hash: Option<WalletHash>,
    /// Server creation timestamp of the remote record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_created_at: Option<String>,
    /// Server update timestamp of the remote record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<String>,
}

impl LocalReplicaState {
    /// Hash of the local encrypted wallet, if any.
    pub fn local_hash(&self) -> Option<WalletHash> {
        self.encrypted_wallet.as_deref().map(WalletHash::of)
    }

    /// Whether local holds edits the remote has not seen.
    ///
    /// True when the local blob's hash differs from the last synced hash.
    pub fn is_dirty(&self) -> bool {
        self.local_hash() != self.remote_hash
    }

    /// Whether a local wallet exists.
    pub fn has_wallet(&self) -> bool {
        self.encrypted_wallet.is_some()
    }

    /// Apply a patch in place (merge-on-write).
    pub fn apply(&mut self, patch: ReplicaPatch) {
        fn set<T>(field: &mut Option<T>, update: Option<Option<T>>) {
            if let Some(value) = update {
                *field = value;
            }
        }
        set(&mut self.remote_url, patch.remote_url);
        set(&mut self.remote_copy, patch.remote_copy);
        set(&mut self.remote_token, patch.remote_token);
        set(&mut self.encryption_public_key, patch.encryption_public_key);
        set(&mut self.encrypted_wallet, patch.encrypted_wallet);
        set(&mut self.remote_hash, patch.remote_hash);
        set(&mut self.remote_created_at, patch.remote_created_at);
        set(&mut self.remote_updated_at, patch.remote_updated_at);
    }
}

impl std::fmt::Debug for LocalReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalReplicaState")
            .field("remote_url", &self.remote_url)
            .field("remote_copy", &self.remote_copy)
            .field(
                "remote_token",
                &self.remote_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("encryption_public_key", &self.encryption_public_key)
            .field(
                "encrypted_wallet",
                &self
                    .encrypted_wallet
                    .as_ref()
                    .map(|w| format!("[{} bytes]", w.len())),
            )
            .field("remote_hash", &self.remote_hash)
            .field("remote_created_at", &self.remote_created_at)
            .field("remote_updated_at", &self.remote_updated_at)
            .finish()
    }
}

/// A partial update to [`LocalReplicaState`].
///
/// Each field is `None` to leave the stored value alone, `Some(None)` to
/// clear it, or `Some(Some(v))` to set it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaPatch {
    /// Update for `remote_url`.
    pub remote_url: Option<Option<String>>,
    /// Update for `remote_copy`.
    pub remote_copy: Option<Option<bool>>,
    /// Update for `remote_token`.
    pub remote_token: Option<Option<String>>,
    /// Update for `encryption_public_key`.
    pub encryption_public_key: Option<Option<PublicKey>>,
    /// Update for `encrypted_wallet`.
    pub encrypted_wallet: Option<Option<Vec<u8>>>,
    /// Update for `remote_hash`.
    pub remote_hash: Option<Option<WalletHash>>,
    /// Update for `remote_created_at`.
    pub remote_created_at: Option<Option<String>>,
    /// Update for `remote_updated_at`.
    pub remote_updated_at: Option<Option<String>>,
}

impl ReplicaPatch {
    /// An empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear the backup server address.
    pub fn remote_url(mut self, value: Option<String>) -> Self {
        self.remote_url = Some(value);
        self
    }

    /// Set or clear the remote copy preference.
    pub fn remote_copy(mut self, value: Option<bool>) -> Self {
        self.remote_copy = Some(value);
        self
    }

    /// Set or clear the one-time upload code.
    pub fn remote_token(mut self, value: Option<String>) -> Self {
        self.remote_token = Some(value);
        self
    }

    /// Set or clear the encryption public key.
    pub fn encryption_public_key(mut self, value: Option<PublicKey>) -> Self {
        self.encryption_public_key = Some(value);
        self
    }

    /// Set or clear the encrypted wallet.
    pub fn encrypted_wallet(mut self, value: Option<Vec<u8>>) -> Self {
        self.encrypted_wallet = Some(value);
        self
    }

    /// Set or clear the last synced hash.
    pub fn remote_hash(mut self, value: Option<WalletHash>) -> Self {
        self.remote_hash = Some(value);
        self
    }

    /// Set or clear the remote creation timestamp.
    pub fn remote_created_at(mut self, value: Option<String>) -> Self {
        self.remote_created_at = Some(value);
        self
    }

    /// Set or clear the remote update timestamp.
    pub fn remote_updated_at(mut self, value: Option<String>) -> Self {
        self.remote_updated_at = Some(value);
        self
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_is_clean() {
        let state = LocalReplicaState::default();
        assert!(!state.has_wallet());
        assert!(!state.is_dirty());
    }

    #[test]
    fn new_local_wallet_is_dirty() {
        let state = LocalReplicaState {
            encrypted_wallet: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        assert!(state.is_dirty());
    }

    #[test]
    fn synced_wallet_is_clean() {
        let blob = vec![1, 2, 3];
        let state = LocalReplicaState {
            remote_hash: Some(WalletHash::of(&blob)),
            encrypted_wallet: Some(blob),
            ..Default::default()
        };
        assert!(!state.is_dirty());
    }

    #[test]
    fn patch_sets_clears_and_leaves_fields() {
        let mut state = LocalReplicaState {
            remote_url: Some("tcp://old".into()),
            remote_token: Some("CODE".into()),
            remote_copy: Some(true),
            ..Default::default()
        };

        state.apply(
            ReplicaPatch::new()
                .remote_url(Some("tcp://new".into()))
                .remote_token(None),
        );

        assert_eq!(state.remote_url.as_deref(), Some("tcp://new"));
        assert!(state.remote_token.is_none());
        assert_eq!(state.remote_copy, Some(true));
    }

    #[test]
    fn empty_patch_is_empty() {
        assert!(ReplicaPatch::new().is_empty());
        assert!(!ReplicaPatch::new().remote_copy(None).is_empty());
    }

    #[test]
    fn state_json_uses_camel_case_and_skips_unset() {
        let state = LocalReplicaState {
            remote_copy: Some(false),
            encrypted_wallet: Some(vec![0xFF]),
            ..Default::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"remoteCopyDesired": false, "encryptedWallet": "/w=="})
        );
        let restored: LocalReplicaState = serde_json::from_value(value).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn debug_redacts_token_and_wallet() {
        let state = LocalReplicaState {
            remote_token: Some("SECRET-CODE".into()),
            encrypted_wallet: Some(vec![0xDE, 0xAD]),
            ..Default::default()
        };
        let debug = format!("{:?}", state);
        assert!(!debug.contains("SECRET-CODE"));
        assert!(debug.contains("[2 bytes]"));
    }
}
