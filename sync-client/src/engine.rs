//! SyncEngine - keeps one encrypted wallet in sync with a backup server.
//!
//! The engine owns the unlocked session (keypair + decrypted wallet) and
//! runs the reconcile algorithm:
//!
//! 1. fetch the server's view, conditional on the last synced hash
//! 2. decide with [`walletsync_core::decide`]
//! 3. push, pull, delete, or stop with a conflict
//!
//! Local state is written only after the remote call it depends on has
//! succeeded, and a conflict never mutates anything. `sync()` is
//! single-flight per engine.

use crate::config::EngineOptions;
use crate::envelope::{Envelope, EnvelopeError};
use crate::keys::{KeyError, KeyProvider, PrivateKey, Secp256k1Provider};
use crate::remote::{RemoteError, RemoteStore, WalletNotifier};
use crate::store::{FileReplicaStore, LocalReplicaStore, StoreError};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use walletsync_core::{decide, SyncAction};
use walletsync_types::{
    ChangePasswordParams, CreateWalletParams, DeleteWalletParams, FetchStatus, FetchWalletParams,
    FetchWalletResult, LocalReplicaState, PublicKey, ReplicaPatch, RequestCodeResult,
    SaveWalletParams, WalletHash,
};
use zeroize::Zeroizing;

/// Capacity of the channel returned by [`SyncEngine::watch_remote`].
const WATCH_CHANNEL_SIZE: usize = 16;

/// Errors surfaced to the engine's caller.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Email missing.
    #[error("email is required")]
    EmailRequired,

    /// Username missing.
    #[error("username is required")]
    UsernameRequired,

    /// Password missing.
    #[error("password is required")]
    PasswordRequired,

    /// Email is not an address.
    #[error("invalid email address")]
    InvalidEmail,

    /// Derived key does not match the one on record.
    #[error("invalid password")]
    InvalidPassword,

    /// Operation needs an unlocked wallet.
    #[error("login required")]
    LoginRequired,

    /// Operation needs a backup server.
    #[error("no backup server configured")]
    RemoteUrlRequired,

    /// First upload needs the one-time code from `request_code`.
    #[error("one-time code required to create the remote wallet")]
    RemoteTokenRequired,

    /// Local and remote both changed since the last sync.
    #[error("wallet changed locally and remotely (local: {local_hash:?}, remote: {remote_hash:?})")]
    Conflict {
        /// Hash of the local wallet.
        local_hash: Option<WalletHash>,
        /// Hash the server holds.
        remote_hash: Option<WalletHash>,
    },

    /// Encryption or decryption failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The server refused or could not be reached.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Key operation failed.
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl WalletError {
    /// Check if this is a concurrency conflict (as opposed to a transport
    /// failure worth retrying).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            WalletError::Conflict { .. } | WalletError::Remote(RemoteError::Conflict)
        )
    }
}

/// Outcome of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No backup server configured; nothing was sent.
    NoRemote,
    /// Neither side holds a wallet.
    NoContent,
    /// Local and remote agree.
    InSync,
    /// Local changes were uploaded.
    Pushed,
    /// Remote changes were applied locally.
    Pulled,
    /// The remote copy was deleted (remote copy switched off).
    Deleted,
    /// Local changes stay local (remote copy never enabled).
    LocalOnly,
}

/// Login credentials.
#[derive(Clone)]
pub struct Credentials {
    /// Account email.
    pub email: String,
    /// Account username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Bundle credentials.
    pub fn new(
        email: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Reject incomplete credentials before any I/O.
    pub fn validate(&self) -> Result<(), WalletError> {
        if self.email.trim().is_empty() {
            return Err(WalletError::EmailRequired);
        }
        if self.username.trim().is_empty() {
            return Err(WalletError::UsernameRequired);
        }
        if self.password.is_empty() {
            return Err(WalletError::PasswordRequired);
        }
        validate_email(&self.email)
    }

    /// Key derivation seed: normalized email, normalized username, password.
    fn seed(&self) -> Zeroizing<Vec<u8>> {
        let email = normalize(&self.email);
        let username = normalize(&self.username);
        let mut seed = Zeroizing::new(Vec::with_capacity(
            email.len() + username.len() + self.password.len(),
        ));
        seed.extend_from_slice(email.as_bytes());
        seed.extend_from_slice(username.as_bytes());
        seed.extend_from_slice(self.password.as_bytes());
        seed
    }
}

// Don't leak the password in debug output
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Snapshot of the engine for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// No session.
    pub locked: bool,
    /// Public key on record.
    pub public_key: Option<PublicKey>,
    /// Backup server in use.
    pub remote_url: Option<String>,
    /// Remote copy preference.
    pub remote_copy: Option<bool>,
    /// A local wallet exists.
    pub has_wallet: bool,
    /// Local changes not yet on the server.
    pub dirty: bool,
    /// Last synced hash.
    pub remote_hash: Option<WalletHash>,
    /// Server creation timestamp.
    pub remote_created_at: Option<String>,
    /// Server update timestamp.
    pub remote_updated_at: Option<String>,
}

struct Session {
    private: PrivateKey,
    public: PublicKey,
    wallet: Option<Value>,
}

/// The wallet sync engine.
pub struct SyncEngine<S, R> {
    store: S,
    remote: R,
    keys: Arc<dyn KeyProvider>,
    envelope: Envelope,
    options: EngineOptions,
    session: Mutex<Option<Session>>,
    sync_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RemoteStore> SyncEngine<FileReplicaStore, R> {
    /// Open an engine on the replica file named by `options`, with the
    /// secp256k1 key provider.
    pub async fn open(remote: R, options: EngineOptions) -> Result<Self, WalletError> {
        let store =
            FileReplicaStore::open(&options.state_path, &options.namespace, options.persist)
                .await?;
        Ok(Self::new(
            store,
            remote,
            Arc::new(Secp256k1Provider::new()),
            options,
        ))
    }
}

impl<S: LocalReplicaStore, R: RemoteStore> SyncEngine<S, R> {
    /// Create an engine.
    pub fn new(store: S, remote: R, keys: Arc<dyn KeyProvider>, options: EngineOptions) -> Self {
        Self {
            store,
            remote,
            envelope: Envelope::new(keys.clone()),
            keys,
            options,
            session: Mutex::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(None),
        }
    }

    /// The replica store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The remote store.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Unlock the wallet and sync.
    ///
    /// The first login records the derived public key; later logins must
    /// derive the same key.
    pub async fn login(&self, credentials: &Credentials) -> Result<SyncStatus, WalletError> {
        credentials.validate()?;
        let (private, public) = self.keys.derive_key_pair(&credentials.seed())?;

        let state = self.store.get().await?;
        match state.encryption_public_key {
            Some(recorded) if recorded != public => return Err(WalletError::InvalidPassword),
            Some(_) => {}
            None => {
                self.store
                    .merge(ReplicaPatch::new().encryption_public_key(Some(public)))
                    .await?;
            }
        }

        let wallet = match &state.encrypted_wallet {
            Some(blob) => Some(self.envelope.decrypt(blob, &private).await?),
            None => None,
        };

        *self.session.lock().unwrap() = Some(Session {
            private,
            public,
            wallet,
        });
        tracing::info!("Wallet unlocked for {}", public);

        self.sync().await
    }

    /// Drop the session.
    pub fn logout(&self) {
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            handle.abort();
        }
        if self.session.lock().unwrap().take().is_some() {
            tracing::info!("Wallet locked");
        }
    }

    /// Check if no session is active.
    pub fn is_locked(&self) -> bool {
        self.session.lock().unwrap().is_none()
    }

    /// The decrypted wallet (`None` when there is none yet).
    pub fn get_state(&self) -> Result<Option<Value>, WalletError> {
        let session = self.session.lock().unwrap();
        let session = session.as_ref().ok_or(WalletError::LoginRequired)?;
        Ok(session.wallet.clone())
    }

    /// Replace the wallet: encrypt, persist, then sync.
    pub async fn set_state(&self, wallet: Value) -> Result<SyncStatus, WalletError> {
        let _guard = self.sync_lock.lock().await;
        let (_, public) = self.session_keys()?;

        let blob = self.envelope.encrypt(&wallet, &public).await?;
        self.store
            .merge(ReplicaPatch::new().encrypted_wallet(Some(blob)))
            .await?;
        self.replace_wallet(&public, wallet);

        self.sync_locked().await
    }

    /// Reconcile with the backup server.
    pub async fn sync(&self) -> Result<SyncStatus, WalletError> {
        let _guard = self.sync_lock.lock().await;
        self.sync_locked().await
    }

    /// Point the engine at a backup server.
    ///
    /// Switching servers forgets what the previous one held.
    pub async fn use_backup_server(&self, url: impl Into<String>) -> Result<(), WalletError> {
        let url = url.into();
        let _guard = self.sync_lock.lock().await;
        let state = self.store.get().await?;

        let mut patch = ReplicaPatch::new().remote_url(Some(url.clone()));
        if self.remote_url(&state).is_some_and(|current| current != url) {
            patch = patch
                .remote_hash(None)
                .remote_created_at(None)
                .remote_updated_at(None);
        }
        self.store.merge(patch).await?;
        tracing::info!("Backup server set to {}", url);
        Ok(())
    }

    /// Enable or disable the remote copy.
    ///
    /// `token` is the one-time code authorizing the first upload. Takes
    /// effect at the next sync.
    pub async fn keep_remote_copy(
        &self,
        enabled: bool,
        token: Option<String>,
    ) -> Result<(), WalletError> {
        let _guard = self.sync_lock.lock().await;
        let state = self.store.get().await?;
        if enabled && self.remote_url(&state).is_none() {
            return Err(WalletError::RemoteUrlRequired);
        }

        let mut patch = ReplicaPatch::new().remote_copy(Some(enabled));
        if token.is_some() {
            patch = patch.remote_token(token);
        }
        self.store.merge(patch).await?;
        Ok(())
    }

    /// Ask the server to mail a one-time code to `email`.
    pub async fn request_code(&self, email: &str) -> Result<RequestCodeResult, WalletError> {
        if email.trim().is_empty() {
            return Err(WalletError::EmailRequired);
        }
        validate_email(email)?;

        let state = self.store.get().await?;
        if self.remote_url(&state).is_none() {
            return Err(WalletError::RemoteUrlRequired);
        }
        Ok(self.remote.request_code(&normalize(email)).await?)
    }

    /// Re-key the wallet under new credentials.
    ///
    /// Syncs first; a remote record is moved to the new key with
    /// `changePassword`.
    pub async fn change_password(&self, credentials: &Credentials) -> Result<(), WalletError> {
        credentials.validate()?;
        let _guard = self.sync_lock.lock().await;
        self.sync_locked().await?;

        let (old_private, old_public) = self.session_keys()?;
        let wallet = self.get_state()?;
        let (new_private, new_public) = self.keys.derive_key_pair(&credentials.seed())?;
        if new_public == old_public {
            return Ok(());
        }

        let new_blob = match &wallet {
            Some(wallet) => Some(self.envelope.encrypt(wallet, &new_public).await?),
            None => None,
        };

        let state = self.store.get().await?;
        let mut patch = ReplicaPatch::new()
            .encryption_public_key(Some(new_public))
            .encrypted_wallet(new_blob.clone());

        if let (Some(blob), Some(remote_hash)) = (&new_blob, state.remote_hash) {
            if self.remote_url(&state).is_some() {
                let params = ChangePasswordParams {
                    original_local_hash: remote_hash,
                    original_signature: self.keys.sign(remote_hash.as_bytes(), &old_private)?,
                    new_encrypted_data: blob.clone(),
                    new_signature: self.keys.sign_data(blob, &new_private)?,
                };
                let result = self
                    .remote
                    .change_password(params)
                    .await
                    .map_err(|e| conflict_or(e, &state))?;
                let local_hash = WalletHash::of(blob);
                check_hash(local_hash, result.local_hash)?;
                patch = patch
                    .remote_hash(Some(local_hash))
                    .remote_updated_at(Some(result.updated_at));
            }
        }

        self.store.merge(patch).await?;
        *self.session.lock().unwrap() = Some(Session {
            private: new_private,
            public: new_public,
            wallet,
        });
        tracing::info!("Wallet re-keyed to {}", new_public);
        Ok(())
    }

    /// Snapshot of the local replica and lock state.
    pub async fn status(&self) -> Result<EngineStatus, WalletError> {
        let state = self.store.get().await?;
        Ok(EngineStatus {
            locked: self.is_locked(),
            public_key: state.encryption_public_key,
            remote_url: self.remote_url(&state),
            remote_copy: state.remote_copy,
            has_wallet: state.has_wallet(),
            dirty: state.has_wallet() && state.is_dirty(),
            remote_hash: state.remote_hash,
            remote_created_at: state.remote_created_at,
            remote_updated_at: state.remote_updated_at,
        })
    }

    fn session_keys(&self) -> Result<(PrivateKey, PublicKey), WalletError> {
        let session = self.session.lock().unwrap();
        session
            .as_ref()
            .map(|s| (s.private.clone(), s.public))
            .ok_or(WalletError::LoginRequired)
    }

    /// Swap the in-memory wallet if the session is still the one that
    /// produced it.
    fn replace_wallet(&self, public: &PublicKey, wallet: Value) {
        let mut session = self.session.lock().unwrap();
        if let Some(session) = session.as_mut().filter(|s| s.public == *public) {
            session.wallet = Some(wallet);
        }
    }

    fn remote_url(&self, state: &LocalReplicaState) -> Option<String> {
        state
            .remote_url
            .clone()
            .or_else(|| self.options.remote_url.clone())
    }

    async fn sync_locked(&self) -> Result<SyncStatus, WalletError> {
        let (private, public) = self.session_keys()?;
        let state = self.store.get().await?;
        if self.remote_url(&state).is_none() {
            return Ok(SyncStatus::NoRemote);
        }

        let fetched = self
            .remote
            .fetch_wallet(FetchWalletParams {
                public_key: public,
                local_hash: state.remote_hash,
            })
            .await?;
        let action = decide(fetched.status, state.has_wallet(), state.is_dirty());
        tracing::debug!(
            "Sync decision for {}: {:?} (remote {:?}, local {}, dirty {})",
            public,
            action,
            fetched.status,
            state.has_wallet(),
            state.is_dirty()
        );

        match action {
            SyncAction::None if fetched.status.has_wallet() => {
                if state.remote_copy == Some(false) {
                    self.delete_remote(&state, &fetched, &private).await
                } else {
                    Ok(SyncStatus::InSync)
                }
            }
            SyncAction::None => Ok(SyncStatus::NoContent),
            SyncAction::Push => self.push(&state, fetched.status, &private).await,
            SyncAction::Pull => self.pull(&state, fetched, &private, &public).await,
            SyncAction::Conflict => {
                tracing::warn!("Sync conflict for {}", public);
                Err(WalletError::Conflict {
                    local_hash: state.local_hash(),
                    remote_hash: fetched.local_hash,
                })
            }
        }
    }

    async fn push(
        &self,
        state: &LocalReplicaState,
        status: FetchStatus,
        private: &PrivateKey,
    ) -> Result<SyncStatus, WalletError> {
        let data = match (state.remote_copy, &state.encrypted_wallet) {
            (Some(false), _) if status.has_wallet() => {
                let fetched = FetchWalletResult::status(status);
                return self.delete_remote(state, &fetched, private).await;
            }
            (Some(true), Some(data)) => data.clone(),
            _ => return Ok(SyncStatus::LocalOnly),
        };

        let local_hash = WalletHash::of(&data);
        let signature = self.keys.sign_data(&data, private)?;

        // No record was ever created on this server
        let patch = if state.remote_created_at.is_none() {
            let code = state
                .remote_token
                .clone()
                .ok_or(WalletError::RemoteTokenRequired)?;
            let created = self
                .remote
                .create_wallet(CreateWalletParams {
                    code,
                    encrypted_data: data,
                    signature,
                })
                .await?;
            check_hash(local_hash, created.local_hash)?;
            tracing::info!("Created remote wallet {}", local_hash);

            // The code is single-use
            ReplicaPatch::new()
                .remote_token(None)
                .remote_created_at(Some(created.created_at.clone()))
                .remote_updated_at(Some(created.created_at))
        } else {
            let original = state.remote_hash.ok_or(WalletError::Conflict {
                local_hash: Some(local_hash),
                remote_hash: None,
            })?;
            let saved = self
                .remote
                .save_wallet(SaveWalletParams {
                    original_local_hash: original,
                    encrypted_data: data,
                    signature,
                })
                .await
                .map_err(|e| conflict_or(e, state))?;
            check_hash(local_hash, saved.local_hash)?;
            tracing::info!("Saved remote wallet {}", local_hash);

            ReplicaPatch::new().remote_updated_at(Some(saved.updated_at))
        };

        self.store
            .merge(patch.remote_hash(Some(local_hash)))
            .await?;
        Ok(SyncStatus::Pushed)
    }

    async fn pull(
        &self,
        state: &LocalReplicaState,
        fetched: FetchWalletResult,
        private: &PrivateKey,
        public: &PublicKey,
    ) -> Result<SyncStatus, WalletError> {
        if state.remote_copy == Some(false) {
            return self.delete_remote(state, &fetched, private).await;
        }

        let data = fetched.encrypted_data.ok_or_else(|| {
            RemoteError::InvalidResponse("fetchWallet returned Ok without data".into())
        })?;
        let remote_hash = WalletHash::of(&data);
        if let Some(reported) = fetched.local_hash {
            check_hash(remote_hash, reported)?;
        }

        // Nothing is written unless the blob decrypts
        let wallet = self.envelope.decrypt(&data, private).await?;

        let mut patch = ReplicaPatch::new()
            .encrypted_wallet(Some(data))
            .remote_hash(Some(remote_hash))
            .remote_created_at(fetched.created_at)
            .remote_updated_at(fetched.updated_at);
        if state.remote_copy.is_none() {
            patch = patch.remote_copy(Some(true));
        }
        self.store.merge(patch).await?;
        self.replace_wallet(public, wallet);

        tracing::info!("Pulled remote wallet {}", remote_hash);
        Ok(SyncStatus::Pulled)
    }

    async fn delete_remote(
        &self,
        state: &LocalReplicaState,
        fetched: &FetchWalletResult,
        private: &PrivateKey,
    ) -> Result<SyncStatus, WalletError> {
        let hash = fetched.local_hash.or(state.remote_hash).ok_or_else(|| {
            RemoteError::InvalidResponse("remote wallet has no hash to delete".into())
        })?;
        let signature = self.keys.sign(hash.as_bytes(), private)?;

        self.remote
            .delete_wallet(DeleteWalletParams {
                local_hash: hash,
                signature,
            })
            .await
            .map_err(|e| conflict_or(e, state))?;

        self.store
            .merge(
                ReplicaPatch::new()
                    .remote_hash(None)
                    .remote_created_at(None)
                    .remote_updated_at(None),
            )
            .await?;
        tracing::info!("Deleted remote wallet {}", hash);
        Ok(SyncStatus::Deleted)
    }
}

impl<S, R> SyncEngine<S, R>
where
    S: LocalReplicaStore + 'static,
    R: RemoteStore + 'static,
{
    /// Re-sync whenever the server reports a change to this wallet.
    ///
    /// Each sync outcome is sent on the returned channel. Bursts of
    /// notifications collapse into one sync.
    pub async fn watch_remote(
        self: &Arc<Self>,
    ) -> Result<mpsc::Receiver<Result<SyncStatus, WalletError>>, WalletError> {
        let (_, public) = self.session_keys()?;
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<()>();
        let notifier: WalletNotifier = Arc::new(move |_: FetchWalletResult| {
            wake_tx.send(()).ok();
        });
        self.remote.watch_wallet(public, notifier).await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let engine: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while wake_rx.recv().await.is_some() {
                while wake_rx.try_recv().is_ok() {}
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let outcome = engine.sync().await;
                if tx.send(outcome).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.watcher.lock().unwrap().replace(handle) {
            previous.abort();
        }
        tracing::debug!("Watching remote wallet {}", public);
        Ok(rx)
    }

    /// Stop watching the server.
    pub async fn unwatch_remote(&self) -> Result<(), WalletError> {
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            handle.abort();
        }
        let (_, public) = self.session_keys()?;
        self.remote.unwatch_wallet(public).await?;
        Ok(())
    }
}

impl<S, R> std::fmt::Debug for SyncEngine<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("namespace", &self.options.namespace)
            .field("locked", &self.session.lock().map(|s| s.is_none()).unwrap_or(true))
            .finish_non_exhaustive()
    }
}

impl<S, R> Drop for SyncEngine<S, R> {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }
    }
}

/// Map a server precondition failure to a conflict carrying both hashes.
fn conflict_or(error: RemoteError, state: &LocalReplicaState) -> WalletError {
    if error.is_conflict() {
        WalletError::Conflict {
            local_hash: state.local_hash(),
            remote_hash: state.remote_hash,
        }
    } else {
        WalletError::Remote(error)
    }
}

fn check_hash(expected: WalletHash, reported: WalletHash) -> Result<(), WalletError> {
    if expected == reported {
        return Ok(());
    }
    Err(RemoteError::InvalidResponse(format!(
        "server hash {reported} does not match {expected}"
    ))
    .into())
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<(), WalletError> {
    let email = normalize(email);
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(WalletError::InvalidEmail)
    }
}
