//! Transport abstraction for walletsync.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (TCP, mock for testing).
//!
//! # Design
//!
//! The transport trait is async, connection-oriented and message-framed:
//! - `connect()` establishes a connection (again, after a loss)
//! - `send()` transmits one JSON-RPC frame
//! - `recv()` receives one frame
//! - `close()` gracefully terminates and wakes a blocked `recv()`
//!
//! `send()` and `recv()` may run concurrently: the RPC channel keeps one
//! reader task in `recv()` while callers send.
//!
//! # Example
//!
//! ```ignore
//! let transport = TcpTransport::new();
//! transport.connect("127.0.0.1:9000").await?;
//! transport.send(br#"{"id":1,"method":"fetchWallet","params":{}}"#).await?;
//! let response = transport.recv().await?;
//! ```

mod mock;
mod tcp;

pub use mock::{MockPeer, MockTransport};
pub use tcp::{TcpTransport, TcpTransportConfig, MAX_MESSAGE_SIZE};

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Transport trait for sending and receiving JSON-RPC frames.
///
/// Implementations handle the underlying connection mechanism
/// (TCP, WebSocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the server at the given address.
    ///
    /// Called again by the channel after a connection is lost.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame.
    ///
    /// Blocks until data is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
