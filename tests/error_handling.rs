//! Error handling tests: refused connections, lost hosts, malformed diffs
//! and damaged credential files.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tablesync::client::notices;
use tablesync::protocol::{ClientMessage, RowOp, ServerMessage, TableSnapshot, TableUpdate, TransactionUpdate};
use tablesync::schema::{encode, User};
use tablesync::{
    command_queue, registry, CancellationToken, Command, ConnectionId, Connector,
    CredentialStore, DbConnection, Host, HostConfig, Identity, ProcessingLoop, ReducerArgs,
    ReducerKind, Status, SubscriptionState, SyncError, Timestamp, Transport, TransportEvent,
};
use tempfile::TempDir;

// --- Helpers ---

fn host() -> Arc<Host> {
    Host::tank(&HostConfig::default())
}

fn builder(host: &Arc<Host>) -> tablesync::DbConnectionBuilder {
    DbConnection::builder().with_module_name(host.module_name())
}

fn user(token: &str) -> User {
    User {
        identity: Identity::from_token(token),
        name: None,
        online: true,
        last_seen: Timestamp(1),
    }
}

struct FakeTransport {
    events: Receiver<TransportEvent>,
    sent: Sender<ClientMessage>,
}

impl Transport for FakeTransport {
    fn send(&mut self, message: ClientMessage) -> tablesync::Result<()> {
        let _ = self.sent.send(message);
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.events.try_iter().collect()
    }

    fn close(&mut self) {}
}

/// Connector handing out a transport that replays whatever the test pushes.
struct FakeConnector {
    transport: Mutex<Option<FakeTransport>>,
}

impl Connector for FakeConnector {
    fn connect(&self, _module: &str, _token: Option<&str>) -> tablesync::Result<Box<dyn Transport>> {
        self.transport
            .lock()
            .take()
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .ok_or_else(|| SyncError::Connection("already connected".into()))
    }
}

fn fake() -> (FakeConnector, Sender<TransportEvent>) {
    let (tx, events) = unbounded();
    let (sent, _) = unbounded();
    let connector = FakeConnector {
        transport: Mutex::new(Some(FakeTransport {
            events,
            sent,
        })),
    };
    (connector, tx)
}

fn greet(tx: &Sender<TransportEvent>, identity: Identity) {
    tx.send(TransportEvent::Message(ServerMessage::IdentityToken {
        identity,
        token: "f".repeat(64),
        connection_id: ConnectionId(7),
    }))
    .unwrap();
}

// --- Connection Errors ---

#[test]
fn test_unknown_module_reports_connect_error() {
    let host = host();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let connected = Arc::new(Mutex::new(false));
    let e = errors.clone();
    let c = connected.clone();

    let result = DbConnection::builder()
        .with_module_name("chat")
        .on_connect(move |_, _, _| *c.lock() = true)
        .on_connect_error(move |err| e.lock().push(notices::connect_error_notice(err)))
        .build_with(&host);

    assert!(matches!(result, Err(SyncError::UnknownModule(m)) if m == "chat"));
    assert!(!*connected.lock());
    assert_eq!(*errors.lock(), vec!["Error while connecting: Unknown module: chat"]);
    assert_eq!(host.session_count(), 0);
}

#[test]
fn test_malformed_token_rejected() {
    let host = host();
    let result = builder(&host)
        .with_token(Some("not-a-token".into()))
        .build_with(&host);
    assert!(matches!(result, Err(SyncError::InvalidToken(_))));
    assert!(host.rows::<User>().is_empty());
}

#[test]
fn test_missing_module_name() {
    let host = host();
    let result = DbConnection::builder().build_with(&host);
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[test]
fn test_build_requires_tcp_uri() {
    let fired = Arc::new(Mutex::new(0));
    let f = fired.clone();
    let result = DbConnection::builder()
        .with_module_name("quickstart-tanks")
        .on_connect_error(move |_| *f.lock() += 1)
        .build();
    assert!(matches!(result, Err(SyncError::Config(_))));

    let result = DbConnection::builder()
        .with_uri("ws://127.0.0.1:3000")
        .with_module_name("quickstart-tanks")
        .build();
    assert!(matches!(result, Err(SyncError::Config(_))));
    assert_eq!(*fired.lock(), 1);
}

#[test]
fn test_connect_refused_during_handshake() {
    let (connector, tx) = fake();
    tx.send(TransportEvent::Message(ServerMessage::ConnectRefused {
        reason: "module is shutting down".into(),
    }))
    .unwrap();

    let result = DbConnection::builder()
        .with_module_name("quickstart-tanks")
        .build_with(&connector);
    assert!(matches!(result, Err(SyncError::Connection(r)) if r == "module is shutting down"));
}

#[test]
fn test_handshake_times_out() {
    let (connector, _tx) = fake();
    let result = DbConnection::builder()
        .with_module_name("quickstart-tanks")
        .with_handshake_timeout(Duration::from_millis(30))
        .build_with(&connector);
    assert!(matches!(result, Err(SyncError::Connection(r)) if r.contains("timed out")));
}

#[test]
fn test_closed_before_identity() {
    let (connector, tx) = fake();
    tx.send(TransportEvent::Closed(None)).unwrap();
    let result = DbConnection::builder()
        .with_module_name("quickstart-tanks")
        .build_with(&connector);
    assert!(matches!(result, Err(SyncError::Connection(_))));
}

// --- Disconnects ---

#[test]
fn test_disconnect_is_idempotent() {
    let host = host();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let c = calls.clone();
    let mut conn = builder(&host)
        .on_disconnect(move |_, err| c.lock().push(notices::disconnect_notice(err)))
        .build_with(&host)
        .unwrap();

    conn.disconnect();
    conn.disconnect();
    drop(conn);

    assert_eq!(*calls.lock(), vec!["Disconnected normally."]);
    assert_eq!(host.session_count(), 0);
}

#[test]
fn test_calls_after_disconnect_fail() {
    let host = host();
    let mut conn = builder(&host).build_with(&host).unwrap();
    conn.disconnect();

    assert!(!conn.is_connected());
    assert!(matches!(conn.set_user_name("Alice"), Err(SyncError::NotConnected)));
    assert!(matches!(
        conn.subscription_builder().subscribe_to_all_tables(),
        Err(SyncError::NotConnected)
    ));
    assert_eq!(conn.frame_tick().unwrap(), 0);
}

#[test]
fn test_host_shutdown_is_abnormal_disconnect() {
    let host = host();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let c = calls.clone();
    let mut conn = builder(&host)
        .on_disconnect(move |_, err| c.lock().push(notices::disconnect_notice(err)))
        .build_with(&host)
        .unwrap();
    let me = conn.identity().unwrap();

    host.shutdown();
    conn.frame_tick().unwrap();

    assert!(!conn.is_connected());
    assert_eq!(calls.lock().len(), 1);
    assert!(calls.lock()[0].starts_with("Disconnected abnormally:"));
    assert!(!host.find::<User>(&me).unwrap().online);

    // No second notification on explicit disconnect.
    conn.disconnect();
    assert_eq!(calls.lock().len(), 1);
}

// --- Protocol Violations ---

#[test]
fn test_invalid_diffs_are_skipped() {
    let me = Identity::from_token("me");
    let (connector, tx) = fake();
    greet(&tx, me);
    let mut conn = DbConnection::builder()
        .with_module_name("quickstart-tanks")
        .build_with(&connector)
        .unwrap();
    conn.subscription_builder().subscribe_to_all_tables().unwrap();

    let alice = user("alice");
    tx.send(TransportEvent::Message(ServerMessage::InitialSubscription {
        tables: vec![TableSnapshot {
            table: "users".into(),
            rows: vec![encode(&alice).unwrap()],
        }],
    }))
    .unwrap();
    conn.frame_tick().unwrap();

    let ghost = user("ghost");
    let carol = user("carol");
    let ops = vec![
        RowOp::Delete(encode(&ghost).unwrap()),
        RowOp::Insert(encode(&alice).unwrap()),
        RowOp::Insert(encode(&carol).unwrap()),
    ];
    tx.send(TransportEvent::Message(ServerMessage::TransactionUpdate(TransactionUpdate {
        status: Status::Committed,
        caller_identity: me,
        caller_connection_id: None,
        reducer: "client_connected".into(),
        args: Vec::new(),
        request_id: None,
        timestamp: Timestamp(2),
        tables: vec![
            TableUpdate {
                table: "messages".into(),
                ops: vec![RowOp::Insert(vec![0xc0])],
            },
            TableUpdate {
                table: "users".into(),
                ops,
            },
        ],
    })))
    .unwrap();

    let inserted = Arc::new(Mutex::new(Vec::new()));
    let i = inserted.clone();
    conn.on_insert::<User>(move |_, u| i.lock().push(u.identity));
    conn.frame_tick().unwrap();

    assert!(conn.is_connected());
    assert_eq!(conn.db().count::<User>(), 2);
    assert_eq!(*inserted.lock(), vec![carol.identity]);
}

#[test]
fn test_undecodable_snapshot_leaves_cache_untouched() {
    let (connector, tx) = fake();
    greet(&tx, Identity::from_token("me"));
    let mut conn = DbConnection::builder()
        .with_module_name("quickstart-tanks")
        .build_with(&connector)
        .unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    conn.subscription_builder()
        .on_error(move |reason| e.lock().push(reason.to_string()))
        .subscribe_to_all_tables()
        .unwrap();

    tx.send(TransportEvent::Message(ServerMessage::InitialSubscription {
        tables: vec![TableSnapshot {
            table: "users".into(),
            rows: vec![vec![0xff, 0x00]],
        }],
    }))
    .unwrap();

    assert!(conn.frame_tick().is_err());
    assert_eq!(conn.subscription_state(), SubscriptionState::Unsubscribed);
    assert_eq!(errors.lock().len(), 1);
    assert_eq!(conn.db().total_rows(), 0);
}

// --- Rejected Requests ---

#[test]
fn test_subscription_to_unknown_table_rejected() {
    let host = host();
    let mut conn = builder(&host).build_with(&host).unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    conn.subscription_builder()
        .on_error(move |reason| e.lock().push(reason.to_string()))
        .subscribe(vec!["users".into(), "messages".into()])
        .unwrap();

    conn.frame_tick().unwrap();
    assert_eq!(conn.subscription_state(), SubscriptionState::Unsubscribed);
    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].contains("messages"));
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SendMessage {
    text: String,
}

impl ReducerArgs for SendMessage {
    const NAME: &'static str = "send_message";
}

#[test]
fn test_unknown_reducer_fails_for_caller() {
    let host = host();
    let mut conn = builder(&host)
        .with_schema(registry().with_reducer(SendMessage::NAME, ReducerKind::User))
        .build_with(&host)
        .unwrap();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let f = failures.clone();
    conn.on_own_reducer_failure::<SendMessage>(move |_, args, reason| {
        f.lock().push(format!("{}: {}", args.text, reason))
    });

    let request = conn
        .call_reducer(&SendMessage {
            text: "hello".into(),
        })
        .unwrap();
    conn.frame_tick().unwrap();

    assert_eq!(*failures.lock(), vec!["hello: no such reducer: send_message"]);
    assert_eq!(request.0, 1);
}

#[test]
fn test_unknown_command_is_dropped() {
    let host = host();
    let conn = builder(&host).build_with(&host).unwrap();
    let me = conn.identity().unwrap();
    let (commands, queue) = command_queue();
    commands.enqueue(Command::new("shout", "hi"));

    let cancel = CancellationToken::new();
    let worker = ProcessingLoop::new(conn, queue, cancel.clone(), Duration::from_millis(5))
        .spawn()
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    let exit = worker.join().unwrap();

    assert_eq!(exit.commands, 0);
    assert!(exit.iterations >= 1);
    assert_eq!(host.find::<User>(&me).unwrap().name, None);
}

// --- Credential Files ---

#[test]
fn test_corrupted_credentials_detected() {
    let dir = TempDir::new().unwrap();
    let store = CredentialStore::new(dir.path().join("token"));
    store.save(&"a".repeat(64)).unwrap();

    let mut bytes = fs::read(store.path()).unwrap();
    let last = bytes.len() - 5;
    bytes[last] ^= 0x01;
    fs::write(store.path(), &bytes).unwrap();

    assert!(matches!(store.load(), Err(SyncError::ChecksumMismatch { .. })));
}

#[test]
fn test_foreign_file_is_not_a_token() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("token");
    fs::write(&path, b"just some text").unwrap();

    let store = CredentialStore::new(&path);
    assert!(matches!(store.load(), Err(SyncError::InvalidFormat(_))));
}

#[test]
fn test_truncated_credentials_file() {
    let dir = TempDir::new().unwrap();
    let store = CredentialStore::new(dir.path().join("token"));
    store.save("abc").unwrap();

    let bytes = fs::read(store.path()).unwrap();
    fs::write(store.path(), &bytes[..bytes.len() - 2]).unwrap();
    assert!(store.load().is_err());
}
