//! RemoteStore - the backup server's wallet API.
//!
//! [`RpcRemoteStore`] speaks the JSON-RPC methods over an [`RpcChannel`];
//! [`MemoryRemoteStore`] implements the same server contract in memory.

mod memory;

pub use memory::{MemoryRemoteStore, NoticeSink};

use crate::channel::{RpcChannel, RpcError};
use crate::transport::Transport;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use walletsync_types::{
    methods, ChangePasswordParams, CreateWalletParams, CreateWalletResult, DeleteWalletParams,
    FetchWalletParams, FetchWalletResult, PublicKey, RequestCodeParams, RequestCodeResult,
    SaveWalletParams, SaveWalletResult,
};

/// Errors from the backup server.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The optimistic precondition (`originalLocalHash`) did not hold.
    #[error("remote wallet changed concurrently")]
    Conflict,

    /// No record for the signer.
    #[error("remote wallet not found")]
    NotFound,

    /// A wallet is already registered for this email or key.
    #[error("email already registered")]
    DuplicateEmail,

    /// One-time code unknown or already used.
    #[error("invalid one-time code")]
    InvalidCode,

    /// Any other server-side rejection.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The server's answer could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The call itself failed.
    #[error(transparent)]
    Rpc(RpcError),
}

impl RemoteError {
    /// Map a server error payload (a string, or an object with a `message`
    /// string) to an error.
    pub fn from_payload(payload: &Value) -> Self {
        let message = match payload {
            Value::String(message) => message.clone(),
            Value::Object(map) => match map.get("message").and_then(Value::as_str) {
                Some(message) => message.to_string(),
                None => payload.to_string(),
            },
            other => other.to_string(),
        };

        match message.as_str() {
            "Conflict" => RemoteError::Conflict,
            "NotFound" => RemoteError::NotFound,
            "DuplicateEmail" => RemoteError::DuplicateEmail,
            "InvalidCode" => RemoteError::InvalidCode,
            _ => RemoteError::Rejected(message),
        }
    }

    /// The error payload a server sends for this error.
    pub fn to_payload(&self) -> Value {
        let message = match self {
            RemoteError::Conflict => "Conflict".to_string(),
            RemoteError::NotFound => "NotFound".to_string(),
            RemoteError::DuplicateEmail => "DuplicateEmail".to_string(),
            RemoteError::InvalidCode => "InvalidCode".to_string(),
            RemoteError::Rejected(message) => message.clone(),
            other => other.to_string(),
        };
        json!({ "message": message })
    }

    /// Check if this is an optimistic-concurrency rejection.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict)
    }
}

impl From<RpcError> for RemoteError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Remote(payload) => RemoteError::from_payload(&payload),
            other => RemoteError::Rpc(other),
        }
    }
}

/// Receives the server's view of a watched wallet whenever it changes.
pub type WalletNotifier = Arc<dyn Fn(FetchWalletResult) + Send + Sync>;

/// The backup server's wallet API.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Ask the server to mail a one-time code authorizing wallet creation.
    async fn request_code(&self, email: &str) -> Result<RequestCodeResult, RemoteError>;

    /// Create the remote record; the signer becomes its owner.
    async fn create_wallet(
        &self,
        params: CreateWalletParams,
    ) -> Result<CreateWalletResult, RemoteError>;

    /// Fetch the record for a public key, conditional on `local_hash`.
    async fn fetch_wallet(&self, params: FetchWalletParams)
        -> Result<FetchWalletResult, RemoteError>;

    /// Replace the record if it still has `original_local_hash`.
    async fn save_wallet(&self, params: SaveWalletParams) -> Result<SaveWalletResult, RemoteError>;

    /// Move the record to a new key.
    async fn change_password(
        &self,
        params: ChangePasswordParams,
    ) -> Result<SaveWalletResult, RemoteError>;

    /// Delete the record.
    async fn delete_wallet(&self, params: DeleteWalletParams) -> Result<(), RemoteError>;

    /// Get notified when the record for `public_key` changes.
    async fn watch_wallet(
        &self,
        public_key: PublicKey,
        notifier: WalletNotifier,
    ) -> Result<(), RemoteError>;

    /// Stop notifications for `public_key`.
    async fn unwatch_wallet(&self, public_key: PublicKey) -> Result<(), RemoteError>;
}

/// RemoteStore over a JSON-RPC channel.
pub struct RpcRemoteStore<T: Transport + 'static> {
    channel: RpcChannel<T>,
}

impl<T: Transport + 'static> RpcRemoteStore<T> {
    /// Wrap a channel.
    pub fn new(channel: RpcChannel<T>) -> Self {
        Self { channel }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &RpcChannel<T> {
        &self.channel
    }

    async fn invoke<P, R>(&self, method: &str, params: &P) -> Result<R, RemoteError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = to_params(params)?;
        let result = self.channel.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| RemoteError::InvalidResponse(format!("{method}: {e}")))
    }

    fn watch_params(public_key: PublicKey) -> Result<Value, RemoteError> {
        to_params(&FetchWalletParams {
            public_key,
            local_hash: None,
        })
    }
}

impl<T: Transport + 'static> std::fmt::Debug for RpcRemoteStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRemoteStore")
            .field("channel", &self.channel)
            .finish()
    }
}

fn to_params<P: Serialize>(params: &P) -> Result<Value, RemoteError> {
    serde_json::to_value(params)
        .map_err(|e| RemoteError::Rpc(RpcError::Serialization(e.to_string())))
}

#[async_trait]
impl<T: Transport + 'static> RemoteStore for RpcRemoteStore<T> {
    async fn request_code(&self, email: &str) -> Result<RequestCodeResult, RemoteError> {
        let params = RequestCodeParams {
            email: email.to_string(),
        };
        self.invoke(methods::REQUEST_CODE, &params).await
    }

    async fn create_wallet(
        &self,
        params: CreateWalletParams,
    ) -> Result<CreateWalletResult, RemoteError> {
        self.invoke(methods::CREATE_WALLET, &params).await
    }

    async fn fetch_wallet(
        &self,
        params: FetchWalletParams,
    ) -> Result<FetchWalletResult, RemoteError> {
        self.invoke(methods::FETCH_WALLET, &params).await
    }

    async fn save_wallet(&self, params: SaveWalletParams) -> Result<SaveWalletResult, RemoteError> {
        self.invoke(methods::SAVE_WALLET, &params).await
    }

    async fn change_password(
        &self,
        params: ChangePasswordParams,
    ) -> Result<SaveWalletResult, RemoteError> {
        self.invoke(methods::CHANGE_PASSWORD, &params).await
    }

    async fn delete_wallet(&self, params: DeleteWalletParams) -> Result<(), RemoteError> {
        // Any ack payload is accepted
        let _: Value = self.invoke(methods::DELETE_WALLET, &params).await?;
        Ok(())
    }

    async fn watch_wallet(
        &self,
        public_key: PublicKey,
        notifier: WalletNotifier,
    ) -> Result<(), RemoteError> {
        let params = Self::watch_params(public_key)?;
        self.channel
            .subscribe(
                methods::FETCH_WALLET,
                params,
                &public_key.to_string(),
                move |payload| match serde_json::from_value::<FetchWalletResult>(payload) {
                    Ok(result) => notifier(result),
                    Err(e) => tracing::warn!("Ignoring malformed wallet notice: {}", e),
                },
            )
            .await?;
        Ok(())
    }

    async fn unwatch_wallet(&self, public_key: PublicKey) -> Result<(), RemoteError> {
        let params = Self::watch_params(public_key)?;
        self.channel
            .unsubscribe(methods::FETCH_WALLET, params, &public_key.to_string())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::transport::{MockPeer, MockTransport};
    use walletsync_types::{FetchStatus, SubscribeParams, WalletHash};

    async fn store() -> (Arc<RpcRemoteStore<MockTransport>>, MockPeer) {
        let transport = MockTransport::new();
        let peer = transport.peer();
        let channel = RpcChannel::new(transport, ChannelConfig::new("mock://server"));
        channel.wait_open().await.unwrap();
        (Arc::new(RpcRemoteStore::new(channel)), peer)
    }

    fn public_key() -> PublicKey {
        let mut bytes = [0x11u8; 33];
        bytes[0] = 0x02;
        PublicKey::from_bytes(&bytes).unwrap()
    }

    // ===========================================
    // Error Payload Tests
    // ===========================================

    #[test]
    fn payload_string_maps_to_variant() {
        assert!(matches!(
            RemoteError::from_payload(&json!("Conflict")),
            RemoteError::Conflict
        ));
        assert!(matches!(
            RemoteError::from_payload(&json!("NotFound")),
            RemoteError::NotFound
        ));
    }

    #[test]
    fn payload_object_message_maps_to_variant() {
        assert!(matches!(
            RemoteError::from_payload(&json!({"message": "DuplicateEmail"})),
            RemoteError::DuplicateEmail
        ));
        assert!(matches!(
            RemoteError::from_payload(&json!({"message": "InvalidCode", "code": 4})),
            RemoteError::InvalidCode
        ));
    }

    #[test]
    fn unknown_payload_is_rejected() {
        match RemoteError::from_payload(&json!({"message": "RateLimited"})) {
            RemoteError::Rejected(message) => assert_eq!(message, "RateLimited"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            RemoteError::from_payload(&json!(42)),
            RemoteError::Rejected(_)
        ));
    }

    #[test]
    fn payload_round_trips() {
        for error in [
            RemoteError::Conflict,
            RemoteError::NotFound,
            RemoteError::DuplicateEmail,
            RemoteError::InvalidCode,
        ] {
            let back = RemoteError::from_payload(&error.to_payload());
            assert_eq!(back.to_string(), error.to_string());
        }
    }

    #[test]
    fn rpc_remote_error_is_decoded() {
        let error: RemoteError = RpcError::Remote(json!("Conflict")).into();
        assert!(error.is_conflict());

        let error: RemoteError = RpcError::Closed("gone".into()).into();
        assert!(matches!(error, RemoteError::Rpc(RpcError::Closed(_))));
    }

    // ===========================================
    // Method Tests
    // ===========================================

    #[tokio::test]
    async fn fetch_wallet_speaks_camel_case() {
        let (store, peer) = store().await;
        let hash = WalletHash::of(b"blob");

        let fetch = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .fetch_wallet(FetchWalletParams {
                        public_key: public_key(),
                        local_hash: Some(hash),
                    })
                    .await
            }
        });

        let request = peer.next_request().await.unwrap();
        assert_eq!(request.method, "fetchWallet");
        assert_eq!(request.params["publicKey"], json!(public_key().to_string()));
        assert_eq!(request.params["localHash"], json!(hash.to_base64()));
        peer.respond(request.id, json!({"status": "NotModified"}));

        let result = fetch.await.unwrap().unwrap();
        assert_eq!(result.status, FetchStatus::NotModified);
    }

    #[tokio::test]
    async fn remote_conflict_surfaces_as_conflict() {
        let (store, peer) = store().await;

        let delete = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .delete_wallet(DeleteWalletParams {
                        local_hash: WalletHash::of(b"x"),
                        signature: walletsync_types::Signature::from_bytes(&[0u8; 65]).unwrap(),
                    })
                    .await
            }
        });

        let request = peer.next_request().await.unwrap();
        assert_eq!(request.method, "deleteWallet");
        peer.respond_error(request.id, json!({"message": "Conflict"}));

        assert!(delete.await.unwrap().unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn undecodable_result_is_invalid_response() {
        let (store, peer) = store().await;

        let request_code = tokio::spawn({
            let store = store.clone();
            async move { store.request_code("a@b.c").await }
        });

        let request = peer.next_request().await.unwrap();
        assert_eq!(request.params, json!({"email": "a@b.c"}));
        peer.respond(request.id, json!("not an object"));

        let result = request_code.await.unwrap();
        assert!(matches!(result, Err(RemoteError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn watch_wallet_subscribes_by_public_key() {
        let (store, peer) = store().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let watch = tokio::spawn({
            let store = store.clone();
            async move {
                let notifier: WalletNotifier = Arc::new(move |result: FetchWalletResult| {
                    tx.send(result).ok();
                });
                store.watch_wallet(public_key(), notifier).await
            }
        });

        let request = peer.next_request().await.unwrap();
        assert_eq!(request.method, "fetchWallet");
        let params: SubscribeParams = serde_json::from_value(request.params).unwrap();
        assert_eq!(params.subscribe_key, public_key().to_string());
        peer.respond(request.id, json!(true));
        watch.await.unwrap().unwrap();

        peer.notify(params.subscribe_id, json!({"status": "NoContent"}));
        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, FetchStatus::NoContent);
    }
}
