//! RemoteStore method payloads.
//!
//! These are the `params` / `result` bodies of the backup service's RPC
//! methods. Binary values travel as standard base64, keys use camelCase.

use serde::{Deserialize, Serialize};

use crate::{serde_b64, PublicKey, Signature, WalletHash};

/// Remote method names.
pub mod methods {
    /// Email a one-time authorization code.
    pub const REQUEST_CODE: &str = "requestCode";
    /// Create the first remote copy of a wallet.
    pub const CREATE_WALLET: &str = "createWallet";
    /// Fetch (or subscribe to) a wallet by public key.
    pub const FETCH_WALLET: &str = "fetchWallet";
    /// Replace a wallet, guarded by its previous hash.
    pub const SAVE_WALLET: &str = "saveWallet";
    /// Re-key a wallet under a new public key.
    pub const CHANGE_PASSWORD: &str = "changePassword";
    /// Delete a wallet.
    pub const DELETE_WALLET: &str = "deleteWallet";
}

/// `requestCode` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCodeParams {
    /// Address the code is mailed to
    pub email: String,
}

/// `requestCode` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCodeResult {
    /// Minutes until the code expires
    pub expire_min: u32,
}

/// `createWallet` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletParams {
    /// One-time authorization code
    pub code: String,
    /// Envelope bytes
    #[serde(with = "serde_b64")]
    pub encrypted_data: Vec<u8>,
    /// Signature over sha256(encrypted_data)
    pub signature: Signature,
}

/// `createWallet` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletResult {
    /// Hash the server recorded
    pub local_hash: WalletHash,
    /// Server creation timestamp
    pub created_at: String,
}

/// `fetchWallet` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchWalletParams {
    /// Key the wallet is filed under
    pub public_key: PublicKey,
    /// Hash the client believes is current, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<WalletHash>,
}

/// Remote status of a fetched wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    /// No record for this public key.
    NoContent,
    /// Stored hash equals the supplied hash.
    NotModified,
    /// Stored hash differs; the record is included.
    Ok,
}

impl FetchStatus {
    /// Whether the server holds a record.
    pub fn has_wallet(self) -> bool {
        matches!(self, FetchStatus::NotModified | FetchStatus::Ok)
    }
}

/// `fetchWallet` result (also the payload of wallet change notices).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchWalletResult {
    /// Remote status
    pub status: FetchStatus,
    /// Envelope bytes, present when `status == Ok`
    #[serde(default, with = "serde_b64::option", skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<Vec<u8>>,
    /// Server-side hash of the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<WalletHash>,
    /// Server creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Server update timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl FetchWalletResult {
    /// A result with only a status.
    pub fn status(status: FetchStatus) -> Self {
        Self {
            status,
            encrypted_data: None,
            local_hash: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// `saveWallet` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveWalletParams {
    /// Hash the update is based on (optimistic concurrency precondition)
    pub original_local_hash: WalletHash,
    /// Envelope bytes
    #[serde(with = "serde_b64")]
    pub encrypted_data: Vec<u8>,
    /// Signature over sha256(encrypted_data)
    pub signature: Signature,
}

/// `saveWallet` / `changePassword` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveWalletResult {
    /// Hash the server now stores
    pub local_hash: WalletHash,
    /// Server update timestamp
    pub updated_at: String,
}

/// `changePassword` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordParams {
    /// Hash of the record being replaced
    pub original_local_hash: WalletHash,
    /// Old key's signature over the original hash
    pub original_signature: Signature,
    /// Envelope bytes addressed to the new key
    #[serde(with = "serde_b64")]
    pub new_encrypted_data: Vec<u8>,
    /// New key's signature over sha256(new_encrypted_data)
    pub new_signature: Signature,
}

/// `deleteWallet` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteWalletParams {
    /// Hash of the record being deleted
    pub local_hash: WalletHash,
    /// Signature over the hash bytes
    pub signature: Signature,
}
