//! Mock transport for testing.
//!
//! A [`MockTransport`] is one end of an in-memory connection; the other end is
//! a [`MockPeer`] that plays the server: it sees every frame the client sent
//! and injects responses and notices. Each `connect()` opens a fresh inbound
//! pipe, so the peer can drop a connection and watch the client reconnect.

use super::{Transport, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use walletsync_types::{Notice, Request, Response};

/// Mock transport for testing.
///
/// Captures sent messages for verification; inbound frames come from the
/// paired [`MockPeer`].
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

/// The server side of a [`MockTransport`].
#[derive(Clone)]
pub struct MockPeer {
    shared: Arc<MockShared>,
}

struct MockShared {
    inner: Mutex<MockTransportInner>,
    /// Inbound pipe of the current connection.
    incoming: AsyncMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    /// Every frame the client sent, across connections.
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    outgoing_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    connect_count: u32,
    sent_messages: Vec<Vec<u8>>,
    to_client: Option<mpsc::UnboundedSender<Vec<u8>>>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(MockShared {
                inner: Mutex::new(MockTransportInner::default()),
                incoming: AsyncMutex::new(None),
                outgoing_tx,
                outgoing_rx: AsyncMutex::new(outgoing_rx),
            }),
        }
    }

    /// Get the server side of this transport.
    pub fn peer(&self) -> MockPeer {
        MockPeer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        let inner = self.shared.inner.lock().unwrap();
        inner.sent_messages.clone()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        let inner = self.shared.inner.lock().unwrap();
        inner.sent_messages.last().cloned()
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        let inner = self.shared.inner.lock().unwrap();
        inner.connected_address.clone()
    }

    /// Number of successful `connect()` calls.
    pub fn connect_count(&self) -> u32 {
        let inner = self.shared.inner.lock().unwrap();
        inner.connect_count
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock().unwrap();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("connect_count", &inner.connect_count)
            .field("sent", &inner.sent_messages.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let rx = {
            let mut inner = self.shared.inner.lock().unwrap();

            // Check for forced failure
            if let Some(error) = inner.fail_next_connect.take() {
                return Err(TransportError::ConnectionFailed(error));
            }

            // Replacing the sender ends any previous connection's pipe
            let (tx, rx) = mpsc::unbounded_channel();
            inner.to_client = Some(tx);
            inner.connected = true;
            inner.connected_address = Some(address.to_string());
            inner.connect_count += 1;
            rx
        };

        *self.shared.incoming.lock().await = Some(rx);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.shared.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(data.to_vec());
        self.shared
            .outgoing_tx
            .send(data.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut incoming = self.shared.incoming.lock().await;
        let rx = incoming.as_mut().ok_or(TransportError::NotConnected)?;

        match rx.recv().await {
            Some(frame) => Ok(frame),
            None => {
                *incoming = None;
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.connected = false;
        inner.to_client = None;
        Ok(())
    }
}

impl MockPeer {
    /// Deliver a raw frame to the client.
    ///
    /// Returns false when the client is not connected.
    pub fn inject(&self, frame: Vec<u8>) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        match &inner.to_client {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Answer request `id` with a result.
    pub fn respond(&self, id: u64, result: Value) -> bool {
        self.send_response(Response::ok(id, result))
    }

    /// Answer request `id` with an error.
    pub fn respond_error(&self, id: u64, error: Value) -> bool {
        self.send_response(Response::err(id, error))
    }

    /// Send a response frame.
    pub fn send_response(&self, response: Response) -> bool {
        response
            .to_bytes()
            .map(|frame| self.inject(frame))
            .unwrap_or(false)
    }

    /// Push a notice for `subscribe_id`.
    pub fn notify(&self, subscribe_id: u64, payload: Value) -> bool {
        self.send_notice(Notice {
            subscribe_id,
            payload,
        })
    }

    /// Send a notice frame.
    pub fn send_notice(&self, notice: Notice) -> bool {
        notice
            .to_bytes()
            .map(|frame| self.inject(frame))
            .unwrap_or(false)
    }

    /// Wait for the next frame the client sends.
    pub async fn next_sent(&self) -> Option<Vec<u8>> {
        self.shared.outgoing_rx.lock().await.recv().await
    }

    /// Wait for the next request the client sends, skipping frames that do
    /// not parse as requests.
    pub async fn next_request(&self) -> Option<Request> {
        loop {
            let frame = self.next_sent().await?;
            if let Ok(request) = Request::from_bytes(&frame) {
                return Some(request);
            }
        }
    }

    /// Drop the current connection, as a server crash would.
    pub fn drop_connection(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.connected = false;
        inner.to_client = None;
    }

    /// Check if the client is connected.
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.connected
    }

    /// Number of times the client connected.
    pub fn connect_count(&self) -> u32 {
        let inner = self.shared.inner.lock().unwrap();
        inner.connect_count
    }
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("backup.example:9000").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(
            transport.connected_address(),
            Some("backup.example:9000".to_string())
        );
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_transport_sends_messages() {
        let transport = MockTransport::new();
        let peer = transport.peer();
        transport.connect("server").await.unwrap();

        transport.send(b"message 1").await.unwrap();
        transport.send(b"message 2").await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"message 1");
        assert_eq!(peer.next_sent().await.unwrap(), b"message 1");
        assert_eq!(peer.next_sent().await.unwrap(), b"message 2");
    }

    #[tokio::test]
    async fn mock_transport_receives_injected_frames() {
        let transport = MockTransport::new();
        let peer = transport.peer();
        transport.connect("server").await.unwrap();

        assert!(peer.inject(b"response 1".to_vec()));
        assert!(peer.inject(b"response 2".to_vec()));

        assert_eq!(transport.recv().await.unwrap(), b"response 1");
        assert_eq!(transport.recv().await.unwrap(), b"response 2");
    }

    #[tokio::test]
    async fn peer_parses_requests_and_responds() {
        let transport = MockTransport::new();
        let peer = transport.peer();
        transport.connect("server").await.unwrap();

        let request = Request {
            id: 4,
            method: "fetchWallet".into(),
            params: json!({}),
        };
        transport.send(&request.to_bytes().unwrap()).await.unwrap();

        let seen = peer.next_request().await.unwrap();
        assert_eq!(seen, request);

        peer.respond(4, json!({"status": "NoContent"}));
        let frame = transport.recv().await.unwrap();
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value, json!({"id": 4, "result": {"status": "NoContent"}}));
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Connection Loss Tests
    // ===========================================

    #[tokio::test]
    async fn dropped_connection_ends_recv() {
        let transport = MockTransport::new();
        let peer = transport.peer();
        transport.connect("server").await.unwrap();

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.recv().await })
        };
        tokio::task::yield_now().await;
        peer.drop_connection();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert!(!peer.inject(b"late".to_vec()));
    }

    #[tokio::test]
    async fn close_wakes_blocked_recv() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.recv().await })
        };
        tokio::task::yield_now().await;
        transport.close().await.unwrap();

        assert!(matches!(
            reader.await.unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn reconnect_opens_fresh_pipe() {
        let transport = MockTransport::new();
        let peer = transport.peer();
        transport.connect("server").await.unwrap();
        peer.drop_connection();
        assert!(transport.recv().await.is_err());

        transport.connect("server").await.unwrap();
        assert!(peer.inject(b"hello again".to_vec()));
        assert_eq!(transport.recv().await.unwrap(), b"hello again");
        assert_eq!(peer.connect_count(), 2);
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn recv_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new();
        transport.fail_next_connect("network unreachable");

        let result = transport.connect("server").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());

        // Next connect should work
        transport.connect("server").await.unwrap();
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        transport.send(b"data").await.unwrap();
        assert_eq!(transport.last_sent(), Some(b"data".to_vec()));
    }
}
