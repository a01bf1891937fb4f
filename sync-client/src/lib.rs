//! # sync-client
//!
//! Client library for walletsync encrypted wallet backup and sync.
//!
//! This is the main library that applications use to keep a wallet backed
//! up on a server that never sees the plaintext.
//!
//! ## Features
//!
//! - **Envelope Encryption**: one-time secp256k1 ECDH, AES-256-CBC, LZMA
//! - **Signed Requests**: every write is signed by the wallet's key
//! - **Optimistic Concurrency**: saves are guarded by the last synced hash
//! - **Multiplexed JSON-RPC**: one connection, correlated requests, replayed
//!   subscriptions after reconnect
//! - **Pure State Machine**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use walletsync_client::{
//!     ChannelConfig, Credentials, EngineOptions, RpcChannel, RpcRemoteStore, SyncEngine,
//!     TcpTransport,
//! };
//!
//! let channel = RpcChannel::new(
//!     TcpTransport::new(),
//!     ChannelConfig::new("tcp://backup.example:9000"),
//! );
//! let engine = SyncEngine::open(RpcRemoteStore::new(channel), EngineOptions::default()).await?;
//!
//! engine.login(&Credentials::new("me@example.com", "me", "hunter2")).await?;
//! engine.set_state(serde_json::json!({ "accounts": [] })).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod keys;
pub mod remote;
pub mod store;
pub mod transport;

pub use channel::{NoticeCallback, RpcChannel, RpcError};
pub use config::{ChannelConfig, ClientConfig, ConfigError, EngineOptions};
pub use engine::{Credentials, EngineStatus, SyncEngine, SyncStatus, WalletError};
pub use envelope::{Envelope, EnvelopeError};
pub use keys::{KeyError, KeyProvider, PrivateKey, Secp256k1Provider};
pub use remote::{
    MemoryRemoteStore, NoticeSink, RemoteError, RemoteStore, RpcRemoteStore, WalletNotifier,
};
pub use store::{FileReplicaStore, LocalReplicaStore, MemoryReplicaStore, StoreError};
pub use transport::{
    MockPeer, MockTransport, TcpTransport, TcpTransportConfig, Transport, TransportError,
    MAX_MESSAGE_SIZE,
};
