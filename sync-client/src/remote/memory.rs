//! In-memory RemoteStore for testing and local development.
//!
//! Implements the server side of the wallet API: one-time codes, one record
//! per email and per signer, hash preconditions on save/delete, and change
//! notifications. Records are owned by whoever signed them, recovered from
//! the signature.

use super::{RemoteError, RemoteStore, WalletNotifier};
use crate::keys::{KeyProvider, Secp256k1Provider};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use walletsync_types::{
    methods, ChangePasswordParams, CreateWalletParams, CreateWalletResult, DeleteWalletParams,
    FetchStatus, FetchWalletParams, FetchWalletResult, Notice, PublicKey, Request,
    RequestCodeParams, RequestCodeResult, Response, SaveWalletParams, SaveWalletResult,
    Signature, SubscribeParams, UnsubscribeParams, WalletHash,
};

/// Minutes a one-time code is advertised as valid.
const CODE_EXPIRE_MIN: u32 = 10;

/// Delivers notices to the client a request came from.
pub type NoticeSink = Arc<dyn Fn(Notice) + Send + Sync>;

/// In-memory wallet server.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<Inner>>,
    keys: Arc<dyn KeyProvider>,
}

#[derive(Default)]
struct Inner {
    /// Outstanding one-time codes: code -> email.
    codes: HashMap<String, String>,
    /// Owner of each registered email.
    emails: HashMap<String, PublicKey>,
    records: HashMap<PublicKey, Record>,
    watchers: HashMap<PublicKey, WalletNotifier>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Clone)]
struct Record {
    email: String,
    data: Vec<u8>,
    hash: WalletHash,
    created_at: String,
    updated_at: String,
}

impl Record {
    fn to_result(&self) -> FetchWalletResult {
        FetchWalletResult {
            status: FetchStatus::Ok,
            encrypted_data: Some(self.data.clone()),
            local_hash: Some(self.hash),
            created_at: Some(self.created_at.clone()),
            updated_at: Some(self.updated_at.clone()),
        }
    }
}

impl MemoryRemoteStore {
    /// Create an empty store verifying secp256k1 signatures.
    pub fn new() -> Self {
        Self::with_keys(Arc::new(Secp256k1Provider::new()))
    }

    /// Create an empty store verifying signatures with `keys`.
    pub fn with_keys(keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            keys,
        }
    }

    /// Register a known one-time code for `email`.
    pub fn issue_code(&self, email: &str, code: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.codes.insert(code.to_string(), normalize(email));
    }

    /// The outstanding code for `email`, as the mail would deliver it.
    pub fn code_for(&self, email: &str) -> Option<String> {
        let email = normalize(email);
        let inner = self.inner.lock().unwrap();
        inner
            .codes
            .iter()
            .find(|(_, owner)| **owner == email)
            .map(|(code, _)| code.clone())
    }

    /// How many times `method` was called.
    pub fn calls(&self, method: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.calls.get(method).copied().unwrap_or(0)
    }

    /// Current record for `public_key`, if any.
    pub fn record(&self, public_key: &PublicKey) -> Option<FetchWalletResult> {
        let inner = self.inner.lock().unwrap();
        inner.records.get(public_key).map(Record::to_result)
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    /// Check if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().records.is_empty()
    }

    /// Answer one JSON-RPC request the way a server would.
    ///
    /// Subscribe and unsubscribe wrappers of `fetchWallet` register watches
    /// whose notices go to `push`.
    pub async fn serve_request(&self, request: Request, push: NoticeSink) -> Response {
        let id = request.id;
        match self.route(request, push).await {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                tracing::debug!("Request {} rejected: {}", id, e);
                Response::err(id, e.to_payload())
            }
        }
    }

    async fn route(&self, request: Request, push: NoticeSink) -> Result<Value, RemoteError> {
        let Request { method, params, .. } = request;

        if params.get("subscribeId").is_some() {
            let subscribe: SubscribeParams = parse(params)?;
            expect_watchable(&method)?;
            let target: FetchWalletParams = parse(subscribe.params)?;
            let subscribe_id = subscribe.subscribe_id;
            let notifier: WalletNotifier = Arc::new(move |result: FetchWalletResult| {
                if let Ok(payload) = serde_json::to_value(result) {
                    push(Notice {
                        subscribe_id,
                        payload,
                    });
                }
            });
            self.watch_wallet(target.public_key, notifier).await?;
            return Ok(json!(true));
        }

        if params.get("unsubscribeId").is_some() {
            let unsubscribe: UnsubscribeParams = parse(params)?;
            expect_watchable(&method)?;
            let target: FetchWalletParams = parse(unsubscribe.params)?;
            self.unwatch_wallet(target.public_key).await?;
            return Ok(json!(true));
        }

        match method.as_str() {
            methods::REQUEST_CODE => {
                let params: RequestCodeParams = parse(params)?;
                reply(self.request_code(&params.email).await?)
            }
            methods::CREATE_WALLET => reply(self.create_wallet(parse(params)?).await?),
            methods::FETCH_WALLET => reply(self.fetch_wallet(parse(params)?).await?),
            methods::SAVE_WALLET => reply(self.save_wallet(parse(params)?).await?),
            methods::CHANGE_PASSWORD => reply(self.change_password(parse(params)?).await?),
            methods::DELETE_WALLET => {
                self.delete_wallet(parse(params)?).await?;
                Ok(json!(true))
            }
            other => Err(RemoteError::Rejected(format!("UnknownMethod: {other}"))),
        }
    }

    fn count(&self, method: &'static str) {
        let mut inner = self.inner.lock().unwrap();
        *inner.calls.entry(method).or_default() += 1;
    }

    /// Signer of a signature over `SHA-256(data)`.
    fn data_signer(&self, signature: &Signature, data: &[u8]) -> Result<PublicKey, RemoteError> {
        self.keys
            .recover_data_signer(signature, data)
            .map_err(|_| RemoteError::Rejected("InvalidSignature".into()))
    }

    /// Signer of a signature made directly over a record hash.
    fn hash_signer(
        &self,
        signature: &Signature,
        hash: &WalletHash,
    ) -> Result<PublicKey, RemoteError> {
        self.keys
            .recover_public_key(signature, hash.as_bytes())
            .map_err(|_| RemoteError::Rejected("InvalidSignature".into()))
    }

    fn notify(&self, public_key: &PublicKey, result: FetchWalletResult) {
        let watcher = self.inner.lock().unwrap().watchers.get(public_key).cloned();
        if let Some(watcher) = watcher {
            watcher(result);
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MemoryRemoteStore")
            .field("records", &inner.records.len())
            .field("codes", &inner.codes.len())
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn request_code(&self, email: &str) -> Result<RequestCodeResult, RemoteError> {
        self.count(methods::REQUEST_CODE);

        let mut bytes = [0u8; 4];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| RemoteError::Rejected(format!("code generation failed: {e}")))?;
        let code = hex::encode_upper(bytes);

        let mut inner = self.inner.lock().unwrap();
        inner.codes.insert(code, normalize(email));
        Ok(RequestCodeResult {
            expire_min: CODE_EXPIRE_MIN,
        })
    }

    async fn create_wallet(
        &self,
        params: CreateWalletParams,
    ) -> Result<CreateWalletResult, RemoteError> {
        self.count(methods::CREATE_WALLET);
        let signer = self.data_signer(&params.signature, &params.encrypted_data)?;

        let (result, record) = {
            let mut inner = self.inner.lock().unwrap();
            let email = inner
                .codes
                .get(&params.code)
                .cloned()
                .ok_or(RemoteError::InvalidCode)?;
            if inner.emails.contains_key(&email) || inner.records.contains_key(&signer) {
                return Err(RemoteError::DuplicateEmail);
            }

            inner.codes.remove(&params.code);
            let now = timestamp();
            let record = Record {
                email: email.clone(),
                hash: WalletHash::of(&params.encrypted_data),
                data: params.encrypted_data,
                created_at: now.clone(),
                updated_at: now,
            };
            inner.emails.insert(email, signer);
            inner.records.insert(signer, record.clone());

            let result = CreateWalletResult {
                local_hash: record.hash,
                created_at: record.created_at.clone(),
            };
            (result, record)
        };

        tracing::debug!("Created wallet for {}", signer);
        self.notify(&signer, record.to_result());
        Ok(result)
    }

    async fn fetch_wallet(
        &self,
        params: FetchWalletParams,
    ) -> Result<FetchWalletResult, RemoteError> {
        self.count(methods::FETCH_WALLET);

        let inner = self.inner.lock().unwrap();
        let result = match inner.records.get(&params.public_key) {
            None => FetchWalletResult::status(FetchStatus::NoContent),
            Some(record) if params.local_hash == Some(record.hash) => {
                FetchWalletResult::status(FetchStatus::NotModified)
            }
            Some(record) => record.to_result(),
        };
        Ok(result)
    }

    async fn save_wallet(&self, params: SaveWalletParams) -> Result<SaveWalletResult, RemoteError> {
        self.count(methods::SAVE_WALLET);
        let signer = self.data_signer(&params.signature, &params.encrypted_data)?;

        let record = {
            let mut inner = self.inner.lock().unwrap();
            let record = inner
                .records
                .get_mut(&signer)
                .ok_or(RemoteError::NotFound)?;
            if record.hash != params.original_local_hash {
                return Err(RemoteError::Conflict);
            }

            record.hash = WalletHash::of(&params.encrypted_data);
            record.data = params.encrypted_data;
            record.updated_at = timestamp();
            record.clone()
        };

        self.notify(&signer, record.to_result());
        Ok(SaveWalletResult {
            local_hash: record.hash,
            updated_at: record.updated_at,
        })
    }

    async fn change_password(
        &self,
        params: ChangePasswordParams,
    ) -> Result<SaveWalletResult, RemoteError> {
        self.count(methods::CHANGE_PASSWORD);
        let old_signer = self.hash_signer(&params.original_signature, &params.original_local_hash)?;
        let new_signer = self.data_signer(&params.new_signature, &params.new_encrypted_data)?;

        let record = {
            let mut inner = self.inner.lock().unwrap();
            let current = inner
                .records
                .get(&old_signer)
                .ok_or(RemoteError::NotFound)?;
            if current.hash != params.original_local_hash {
                return Err(RemoteError::Conflict);
            }
            if new_signer != old_signer && inner.records.contains_key(&new_signer) {
                return Err(RemoteError::DuplicateEmail);
            }

            let mut record = inner
                .records
                .remove(&old_signer)
                .ok_or(RemoteError::NotFound)?;
            record.hash = WalletHash::of(&params.new_encrypted_data);
            record.data = params.new_encrypted_data;
            record.updated_at = timestamp();
            inner.emails.insert(record.email.clone(), new_signer);
            inner.records.insert(new_signer, record.clone());
            record
        };

        tracing::debug!("Moved wallet from {} to {}", old_signer, new_signer);
        if new_signer != old_signer {
            self.notify(&old_signer, FetchWalletResult::status(FetchStatus::NoContent));
        }
        self.notify(&new_signer, record.to_result());
        Ok(SaveWalletResult {
            local_hash: record.hash,
            updated_at: record.updated_at,
        })
    }

    async fn delete_wallet(&self, params: DeleteWalletParams) -> Result<(), RemoteError> {
        self.count(methods::DELETE_WALLET);
        let signer = self.hash_signer(&params.signature, &params.local_hash)?;

        {
            let mut inner = self.inner.lock().unwrap();
            let record = inner.records.get(&signer).ok_or(RemoteError::NotFound)?;
            if record.hash != params.local_hash {
                return Err(RemoteError::Conflict);
            }
            if let Some(record) = inner.records.remove(&signer) {
                inner.emails.remove(&record.email);
            }
        }

        tracing::debug!("Deleted wallet for {}", signer);
        self.notify(&signer, FetchWalletResult::status(FetchStatus::NoContent));
        Ok(())
    }

    async fn watch_wallet(
        &self,
        public_key: PublicKey,
        notifier: WalletNotifier,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.insert(public_key, notifier);
        Ok(())
    }

    async fn unwatch_wallet(&self, public_key: PublicKey) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.remove(&public_key);
        Ok(())
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Server timestamps: unix milliseconds, opaque to clients.
fn timestamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    millis.to_string()
}

fn expect_watchable(method: &str) -> Result<(), RemoteError> {
    if method == methods::FETCH_WALLET {
        Ok(())
    } else {
        Err(RemoteError::Rejected(format!("NotSubscribable: {method}")))
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RemoteError> {
    serde_json::from_value(params).map_err(|e| RemoteError::Rejected(format!("InvalidParams: {e}")))
}

fn reply<T: Serialize>(result: T) -> Result<Value, RemoteError> {
    serde_json::to_value(result).map_err(|e| RemoteError::Rejected(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;

    struct Device {
        keys: Secp256k1Provider,
        private: PrivateKey,
        public: PublicKey,
    }

    impl Device {
        fn new(seed: &[u8]) -> Self {
            let keys = Secp256k1Provider::new();
            let (private, public) = keys.derive_key_pair(seed).unwrap();
            Self {
                keys,
                private,
                public,
            }
        }

        fn sign_data(&self, data: &[u8]) -> Signature {
            self.keys.sign_data(data, &self.private).unwrap()
        }

        fn sign_hash(&self, hash: &WalletHash) -> Signature {
            self.keys.sign(hash.as_bytes(), &self.private).unwrap()
        }

        fn create(&self, code: &str, data: &[u8]) -> CreateWalletParams {
            CreateWalletParams {
                code: code.to_string(),
                encrypted_data: data.to_vec(),
                signature: self.sign_data(data),
            }
        }

        fn save(&self, original: WalletHash, data: &[u8]) -> SaveWalletParams {
            SaveWalletParams {
                original_local_hash: original,
                encrypted_data: data.to_vec(),
                signature: self.sign_data(data),
            }
        }

        fn fetch(&self, local_hash: Option<WalletHash>) -> FetchWalletParams {
            FetchWalletParams {
                public_key: self.public,
                local_hash,
            }
        }
    }

    async fn created(store: &MemoryRemoteStore, device: &Device, data: &[u8]) -> WalletHash {
        store.issue_code("user@example.com", "CODE");
        store
            .create_wallet(device.create("CODE", data))
            .await
            .unwrap()
            .local_hash
    }

    // ===========================================
    // Code Tests
    // ===========================================

    #[tokio::test]
    async fn request_code_issues_code_for_email() {
        let store = MemoryRemoteStore::new();
        let result = store.request_code(" User@Example.com ").await.unwrap();

        assert_eq!(result.expire_min, 10);
        let code = store.code_for("user@example.com").unwrap();
        assert_eq!(code.len(), 8);
    }

    #[tokio::test]
    async fn create_with_unknown_code_fails() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");

        let result = store.create_wallet(device.create("NOPE", b"data")).await;
        assert!(matches!(result, Err(RemoteError::InvalidCode)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        created(&store, &device, b"data").await;

        let other = Device::new(b"b");
        let result = store.create_wallet(other.create("CODE", b"data")).await;
        assert!(matches!(result, Err(RemoteError::InvalidCode)));
    }

    // ===========================================
    // Create / Fetch Tests
    // ===========================================

    #[tokio::test]
    async fn create_then_fetch() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        let hash = created(&store, &device, b"wallet").await;
        assert_eq!(hash, WalletHash::of(b"wallet"));

        let result = store.fetch_wallet(device.fetch(None)).await.unwrap();
        assert_eq!(result.status, FetchStatus::Ok);
        assert_eq!(result.encrypted_data.as_deref(), Some(&b"wallet"[..]));
        assert_eq!(result.local_hash, Some(hash));
        assert!(result.created_at.is_some());

        let result = store.fetch_wallet(device.fetch(Some(hash))).await.unwrap();
        assert_eq!(result.status, FetchStatus::NotModified);
        assert!(result.encrypted_data.is_none());
    }

    #[tokio::test]
    async fn fetch_unknown_key_is_no_content() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");

        let result = store.fetch_wallet(device.fetch(None)).await.unwrap();
        assert_eq!(result.status, FetchStatus::NoContent);
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let store = MemoryRemoteStore::new();
        created(&store, &Device::new(b"a"), b"one").await;

        store.issue_code("user@example.com", "CODE2");
        let result = store
            .create_wallet(Device::new(b"b").create("CODE2", b"two"))
            .await;
        assert!(matches!(result, Err(RemoteError::DuplicateEmail)));
    }

    // ===========================================
    // Save Tests
    // ===========================================

    #[tokio::test]
    async fn save_with_current_hash_succeeds() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        let hash = created(&store, &device, b"v1").await;

        let result = store.save_wallet(device.save(hash, b"v2")).await.unwrap();
        assert_eq!(result.local_hash, WalletHash::of(b"v2"));
        assert_eq!(store.calls(methods::SAVE_WALLET), 1);
    }

    #[tokio::test]
    async fn save_with_stale_hash_conflicts() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        let hash = created(&store, &device, b"v1").await;
        store.save_wallet(device.save(hash, b"v2")).await.unwrap();

        let result = store.save_wallet(device.save(hash, b"v3")).await;
        assert!(matches!(result, Err(RemoteError::Conflict)));
        let record = store.record(&device.public).unwrap();
        assert_eq!(record.encrypted_data.as_deref(), Some(&b"v2"[..]));
    }

    #[tokio::test]
    async fn save_without_record_is_not_found() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");

        let result = store
            .save_wallet(device.save(WalletHash::of(b"x"), b"v1"))
            .await;
        assert!(matches!(result, Err(RemoteError::NotFound)));
    }

    // ===========================================
    // Change Password / Delete Tests
    // ===========================================

    #[tokio::test]
    async fn change_password_moves_record() {
        let store = MemoryRemoteStore::new();
        let old = Device::new(b"old");
        let new = Device::new(b"new");
        let hash = created(&store, &old, b"v1").await;

        let result = store
            .change_password(ChangePasswordParams {
                original_local_hash: hash,
                original_signature: old.sign_hash(&hash),
                new_encrypted_data: b"v2".to_vec(),
                new_signature: new.sign_data(b"v2"),
            })
            .await
            .unwrap();

        assert_eq!(result.local_hash, WalletHash::of(b"v2"));
        assert!(store.record(&old.public).is_none());
        assert!(store.record(&new.public).is_some());
    }

    #[tokio::test]
    async fn delete_requires_current_hash() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        let hash = created(&store, &device, b"v1").await;

        let stale = WalletHash::of(b"stale");
        let result = store
            .delete_wallet(DeleteWalletParams {
                local_hash: stale,
                signature: device.sign_hash(&stale),
            })
            .await;
        assert!(matches!(result, Err(RemoteError::Conflict)));

        store
            .delete_wallet(DeleteWalletParams {
                local_hash: hash,
                signature: device.sign_hash(&hash),
            })
            .await
            .unwrap();
        assert!(store.is_empty());

        // Email is free again
        store.issue_code("user@example.com", "AGAIN");
        store
            .create_wallet(device.create("AGAIN", b"v1"))
            .await
            .unwrap();
    }

    // ===========================================
    // Watch Tests
    // ===========================================

    #[tokio::test]
    async fn watchers_see_changes() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let notifier: WalletNotifier = {
            let seen = seen.clone();
            Arc::new(move |result: FetchWalletResult| seen.lock().unwrap().push(result.status))
        };
        store.watch_wallet(device.public, notifier).await.unwrap();

        let hash = created(&store, &device, b"v1").await;
        store.save_wallet(device.save(hash, b"v2")).await.unwrap();
        store.unwatch_wallet(device.public).await.unwrap();
        store
            .save_wallet(device.save(WalletHash::of(b"v2"), b"v3"))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![FetchStatus::Ok, FetchStatus::Ok]);
    }

    // ===========================================
    // Request Routing Tests
    // ===========================================

    #[tokio::test]
    async fn serve_request_routes_methods_and_errors() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        let push: NoticeSink = Arc::new(|_| {});

        let request = Request {
            id: 1,
            method: methods::FETCH_WALLET.into(),
            params: serde_json::to_value(device.fetch(None)).unwrap(),
        };
        let response = store.serve_request(request, push.clone()).await;
        assert_eq!(response, Response::ok(1, json!({"status": "NoContent"})));

        let request = Request {
            id: 2,
            method: methods::SAVE_WALLET.into(),
            params: serde_json::to_value(device.save(WalletHash::of(b"x"), b"v")).unwrap(),
        };
        let response = store.serve_request(request, push.clone()).await;
        assert_eq!(response, Response::err(2, json!({"message": "NotFound"})));

        let request = Request {
            id: 3,
            method: "bogus".into(),
            params: Value::Null,
        };
        let response = store.serve_request(request, push).await;
        assert!(response.outcome.is_err());
    }

    #[tokio::test]
    async fn serve_request_subscription_pushes_notices() {
        let store = MemoryRemoteStore::new();
        let device = Device::new(b"a");
        let notices = Arc::new(Mutex::new(Vec::new()));
        let push: NoticeSink = {
            let notices = notices.clone();
            Arc::new(move |notice: Notice| notices.lock().unwrap().push(notice))
        };

        let request = Request {
            id: 1,
            method: methods::FETCH_WALLET.into(),
            params: serde_json::to_value(SubscribeParams {
                subscribe_id: 7,
                subscribe_key: device.public.to_string(),
                params: serde_json::to_value(device.fetch(None)).unwrap(),
            })
            .unwrap(),
        };
        let response = store.serve_request(request, push).await;
        assert_eq!(response, Response::ok(1, json!(true)));

        created(&store, &device, b"v1").await;

        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].subscribe_id, 7);
        assert_eq!(notices[0].payload["status"], json!("Ok"));
    }
}
