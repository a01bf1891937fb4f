//! TcpTransport - JSON-RPC frames over a plain TCP stream.
//!
//! Frames are length-prefixed (4 bytes, big-endian). TLS, if any, is the
//! deployment's concern.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Maximum frame size (4MB; wallets are compressed but may hold many keys).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for TcpTransport.
#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}

/// TcpTransport implements the Transport trait over tokio TCP.
///
/// The stream is split so the channel's reader can block in `recv()` while
/// callers `send()`.
///
/// # Example
///
/// ```ignore
/// let transport = TcpTransport::new();
/// transport.connect("127.0.0.1:9000").await?;
/// transport.send(b"{...}").await?;
/// let response = transport.recv().await?;
/// ```
pub struct TcpTransport {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// `true` while a connection is open; flipping to `false` wakes `recv()`.
    open: watch::Sender<bool>,
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Create a new TcpTransport.
    pub fn new() -> Self {
        Self::with_config(TcpTransportConfig::default())
    }

    /// Create a new TcpTransport with custom configuration.
    pub fn with_config(config: TcpTransportConfig) -> Self {
        let (open, _) = watch::channel(false);
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open,
            config,
        }
    }

    /// Strip a `tcp://` scheme if present.
    fn parse_address(address: &str) -> Result<&str, TransportError> {
        let host = address.strip_prefix("tcp://").unwrap_or(address);
        if host.is_empty() {
            return Err(TransportError::ConnectionFailed("empty address".into()));
        }
        Ok(host)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connected", &*self.open.borrow())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let host = Self::parse_address(address)?;

        // Close existing connection if any
        self.close().await.ok();

        // Connect with timeout
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{host}: {e}")))?;
        stream
            .set_nodelay(self.config.nodelay)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.open.send_replace(true);

        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        // Validate message size
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::SendFailed(format!(
                "Message too large: {} > {}",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        // Length prefix and payload in one write so frames never interleave
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to write frame: {e}")))?;

        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut open = self.open.subscribe();
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        tokio::select! {
            frame = read_frame(reader) => frame,
            _ = open.wait_for(|open| !*open) => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        *self.open.borrow()
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Wake a blocked reader before taking its lock
        self.open.send_replace(false);

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        self.reader.lock().await.take();
        Ok(())
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, TransportError> {
    // Read length prefix (4 bytes, big-endian)
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::ConnectionClosed
        } else {
            TransportError::ReceiveFailed(format!("Failed to read length: {e}"))
        }
    })?;

    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate length
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::ReceiveFailed(format!(
            "Message too large: {} > {}",
            len, MAX_MESSAGE_SIZE
        )));
    }

    // Read payload
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| TransportError::ReceiveFailed(format!("Failed to read data: {e}")))?;

    Ok(data)
}
