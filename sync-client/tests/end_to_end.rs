//! End-to-end tests: engine -> RPC remote store -> channel -> transport ->
//! in-memory backup server.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use walletsync_client::{
    ChannelConfig, Credentials, EngineOptions, MemoryRemoteStore, MemoryReplicaStore,
    MockTransport, NoticeSink, RpcChannel, RpcRemoteStore, Secp256k1Provider, SyncEngine,
    SyncStatus, TcpTransport, Transport, WalletError,
};
use walletsync_types::{methods, Notice, Request};

const EMAIL: &str = "user@example.com";

type Engine<T> = SyncEngine<MemoryReplicaStore, RpcRemoteStore<T>>;

fn credentials() -> Credentials {
    Credentials::new(EMAIL, "alice", "correct horse")
}

/// Serve `store` over TCP with 4-byte length-prefixed JSON frames.
async fn serve_tcp(store: MemoryRemoteStore) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_connection(store.clone(), socket));
        }
    });
    format!("tcp://{addr}")
}

async fn serve_connection(store: MemoryRemoteStore, socket: TcpStream) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let len = (frame.len() as u32).to_be_bytes();
            if writer.write_all(&len).await.is_err() || writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let mut len = [0u8; 4];
        if reader.read_exact(&mut len).await.is_err() {
            break;
        }
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        if reader.read_exact(&mut frame).await.is_err() {
            break;
        }
        let Ok(request) = Request::from_bytes(&frame) else {
            continue;
        };

        let notices = tx.clone();
        let push: NoticeSink = Arc::new(move |notice: Notice| {
            if let Ok(frame) = notice.to_bytes() {
                notices.send(frame).ok();
            }
        });
        let response = store.serve_request(request, push).await;
        if let Ok(frame) = response.to_bytes() {
            tx.send(frame).ok();
        }
    }
}

/// Serve `store` through the peer end of a mock transport.
fn serve_mock(store: MemoryRemoteStore, transport: &MockTransport) {
    let peer = transport.peer();
    tokio::spawn(async move {
        while let Some(request) = peer.next_request().await {
            let notices = peer.clone();
            let push: NoticeSink = Arc::new(move |notice: Notice| {
                notices.send_notice(notice);
            });
            let response = store.serve_request(request, push).await;
            peer.send_response(response);
        }
    });
}

fn device<T: Transport + 'static>(transport: T, url: &str) -> Engine<T> {
    let config = ChannelConfig::new(url)
        .with_request_timeout(Duration::from_secs(5))
        .with_reconnect(0, 0, 0);
    SyncEngine::new(
        MemoryReplicaStore::new(),
        RpcRemoteStore::new(RpcChannel::new(transport, config)),
        Arc::new(Secp256k1Provider::new()),
        EngineOptions::default().in_memory(),
    )
}

/// Register the backup server, get a code and opt in, then log in.
async fn enroll<T: Transport + 'static>(
    engine: &Engine<T>,
    server: &MemoryRemoteStore,
    url: &str,
) -> SyncStatus {
    engine.use_backup_server(url).await.unwrap();
    let code = engine.request_code(EMAIL).await.unwrap();
    assert_eq!(code.expire_min, 10);

    let token = server.code_for(EMAIL).unwrap();
    engine.keep_remote_copy(true, Some(token)).await.unwrap();
    engine.login(&credentials()).await.unwrap()
}

// ===========================================
// TCP Tests
// ===========================================

#[tokio::test]
async fn tcp_backup_and_restore_on_second_device() {
    let server = MemoryRemoteStore::new();
    let url = serve_tcp(server.clone()).await;

    let first = device(TcpTransport::new(), &url);
    assert_eq!(enroll(&first, &server, &url).await, SyncStatus::NoContent);
    let status = first.set_state(json!({"accounts": ["main"]})).await.unwrap();
    assert_eq!(status, SyncStatus::Pushed);
    assert_eq!(server.calls(methods::CREATE_WALLET), 1);
    assert_eq!(first.sync().await.unwrap(), SyncStatus::InSync);

    let second = device(TcpTransport::new(), &url);
    second.use_backup_server(&url).await.unwrap();
    assert_eq!(second.login(&credentials()).await.unwrap(), SyncStatus::Pulled);
    assert_eq!(
        second.get_state().unwrap(),
        Some(json!({"accounts": ["main"]}))
    );

    // Edits flow back the other way
    second.set_state(json!({"accounts": ["main", "savings"]})).await.unwrap();
    assert_eq!(first.sync().await.unwrap(), SyncStatus::Pulled);
    assert_eq!(
        first.get_state().unwrap(),
        Some(json!({"accounts": ["main", "savings"]}))
    );
}

#[tokio::test]
async fn tcp_concurrent_edits_conflict() {
    let server = MemoryRemoteStore::new();
    let url = serve_tcp(server.clone()).await;

    let first = device(TcpTransport::new(), &url);
    enroll(&first, &server, &url).await;
    first.set_state(json!({"v": 1})).await.unwrap();

    let second = device(TcpTransport::new(), &url);
    second.use_backup_server(&url).await.unwrap();
    second.login(&credentials()).await.unwrap();

    first.set_state(json!({"v": 2})).await.unwrap();
    let error = second.set_state(json!({"v": 3})).await.unwrap_err();
    assert!(matches!(error, WalletError::Conflict { .. }));
    assert_eq!(server.calls(methods::SAVE_WALLET), 1);
}

#[tokio::test]
async fn tcp_watch_delivers_remote_changes() {
    let server = MemoryRemoteStore::new();
    let url = serve_tcp(server.clone()).await;

    let first = device(TcpTransport::new(), &url);
    enroll(&first, &server, &url).await;
    first.set_state(json!({"v": 1})).await.unwrap();

    let second = Arc::new(device(TcpTransport::new(), &url));
    second.use_backup_server(&url).await.unwrap();
    second.login(&credentials()).await.unwrap();
    let mut outcomes = second.watch_remote().await.unwrap();
    assert_eq!(second.remote().channel().subscription_count(), 1);

    first.set_state(json!({"v": 2})).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap(), SyncStatus::Pulled);
    assert_eq!(second.get_state().unwrap(), Some(json!({"v": 2})));

    second.unwatch_remote().await.unwrap();
    assert_eq!(second.remote().channel().subscription_count(), 0);
}

#[tokio::test]
async fn tcp_opt_out_deletes_remote_copy() {
    let server = MemoryRemoteStore::new();
    let url = serve_tcp(server.clone()).await;

    let engine = device(TcpTransport::new(), &url);
    enroll(&engine, &server, &url).await;
    engine.set_state(json!({"v": 1})).await.unwrap();
    assert_eq!(server.len(), 1);

    engine.keep_remote_copy(false, None).await.unwrap();
    assert_eq!(engine.sync().await.unwrap(), SyncStatus::Deleted);
    assert!(server.is_empty());
    assert_eq!(engine.get_state().unwrap(), Some(json!({"v": 1})));
}

// ===========================================
// Mock Transport Tests
// ===========================================

#[tokio::test]
async fn sync_survives_dropped_connection() {
    let server = MemoryRemoteStore::new();
    let transport = MockTransport::new();
    serve_mock(server.clone(), &transport);
    let peer = transport.peer();

    let engine = device(transport, "mock://backup");
    enroll(&engine, &server, "mock://backup").await;
    engine.set_state(json!({"v": 1})).await.unwrap();

    peer.drop_connection();
    tokio::time::timeout(Duration::from_secs(5), async {
        while peer.connect_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.remote().channel().wait_open().await
    })
    .await
    .unwrap()
    .unwrap();

    engine.set_state(json!({"v": 2})).await.unwrap();
    assert_eq!(server.calls(methods::SAVE_WALLET), 1);
    assert_eq!(engine.sync().await.unwrap(), SyncStatus::InSync);
}

#[tokio::test]
async fn change_password_end_to_end() {
    let server = MemoryRemoteStore::new();
    let transport = MockTransport::new();
    serve_mock(server.clone(), &transport);

    let engine = device(transport, "mock://backup");
    enroll(&engine, &server, "mock://backup").await;
    engine.set_state(json!({"v": 1})).await.unwrap();

    let renewed = Credentials::new(EMAIL, "alice", "battery staple");
    engine.change_password(&renewed).await.unwrap();
    assert_eq!(server.calls(methods::CHANGE_PASSWORD), 1);

    // A fresh device only gets in with the new password
    let other = MockTransport::new();
    serve_mock(server.clone(), &other);
    let fresh = device(other, "mock://backup");
    fresh.use_backup_server("mock://backup").await.unwrap();
    assert_eq!(fresh.login(&credentials()).await.unwrap(), SyncStatus::NoContent);
    fresh.logout();

    let transport = MockTransport::new();
    serve_mock(server.clone(), &transport);
    let restored = device(transport, "mock://backup");
    restored.use_backup_server("mock://backup").await.unwrap();
    assert_eq!(restored.login(&renewed).await.unwrap(), SyncStatus::Pulled);
    assert_eq!(restored.get_state().unwrap(), Some(json!({"v": 1})));
}

// ===========================================
// Persistence Tests
// ===========================================

#[tokio::test]
async fn file_replica_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryRemoteStore::new();
    let options = EngineOptions::default().with_state_path(dir.path().join("walletsync.json"));

    {
        let engine = SyncEngine::open(server.clone(), options.clone()).await.unwrap();
        engine.login(&credentials()).await.unwrap();
        engine.set_state(json!({"v": 1})).await.unwrap();
    }

    let engine = SyncEngine::open(server, options).await.unwrap();
    assert!(engine.is_locked());
    let wrong = Credentials::new(EMAIL, "alice", "wrong");
    assert!(matches!(
        engine.login(&wrong).await,
        Err(WalletError::InvalidPassword)
    ));
    engine.login(&credentials()).await.unwrap();
    assert_eq!(engine.get_state().unwrap(), Some(json!({"v": 1})));
}
