//! The authoritative host: tables, reducers, sessions and broadcast.
//!
//! Every reducer runs as one transaction under the database lock. The
//! resulting [`TransactionUpdate`] is broadcast while the lock is still
//! held, so every session observes commits in the same order.
//!
//! Routing of a transaction outcome:
//! - The calling connection always receives the outcome of its own reducer
//!   call, even on failure
//! - Any other session receives it only if it touched a subscribed table,
//!   with table updates filtered to that session's subscription

pub mod module;
mod procedures;
mod transaction;

pub use procedures::{ProcedureRegistry, ReducerContext, ReducerResult};
pub use transaction::{AnyServerTable, Commit, Database, ServerTable, TableHandle, Transaction};

use crate::config::HostConfig;
use crate::error::{Result, SyncError};
use crate::protocol::{ClientMessage, ReducerCall, ServerMessage, TransactionUpdate};
use crate::schema::{encode, ReducerArgs, ReducerKind, Row, SchemaRegistry};
use crate::schema::{CLIENT_CONNECTED, CLIENT_DISCONNECTED, INIT};
use crate::types::{ConnectionId, Identity, RequestId, Status, Timestamp};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Length of a bearer token in hex characters.
const TOKEN_HEX_LEN: usize = 64;

struct Session {
    identity: Identity,
    /// Subscribed table names; None until the client subscribes.
    subscribed: Option<HashSet<String>>,
    outbox: Sender<ServerMessage>,
}

/// An authoritative module instance.
pub struct Host {
    module_name: String,
    schema: Arc<SchemaRegistry>,
    procedures: ProcedureRegistry,
    db: Mutex<Database>,
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    next_connection: AtomicU64,
    minted_tokens: AtomicU64,
}

impl Host {
    /// Create a host. Runs the `init` reducer when `config.seed_parts` is set.
    pub fn new(config: &HostConfig, schema: SchemaRegistry, procedures: ProcedureRegistry) -> Self {
        let db = Database::new(&schema);
        let host = Self {
            module_name: config.module_name.clone(),
            schema: Arc::new(schema),
            procedures,
            db: Mutex::new(db),
            sessions: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            minted_tokens: AtomicU64::new(0),
        };

        if config.seed_parts && host.procedures.kind(INIT) == Some(ReducerKind::Init) {
            let status = host.run_transaction(INIT, Vec::new(), host.identity(), None, None);
            if let Status::Failed(reason) = status {
                warn!(target: "tablesync::host", %reason, "init reducer failed");
            }
        }

        host
    }

    /// Host running the tank module.
    pub fn tank(config: &HostConfig) -> Arc<Self> {
        Arc::new(Self::new(
            config,
            crate::schema::registry(),
            module::procedures(),
        ))
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn schema(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.schema)
    }

    /// Identity the host acts as for reducers it invokes itself.
    pub fn identity(&self) -> Identity {
        Identity::from_token(&format!("host:{}", self.module_name))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    // --- Sessions ---

    /// Authenticate a new connection and run `client_connected` for it.
    ///
    /// The identity message is queued on `outbox` before anything else, so
    /// it is always the first message the client sees.
    pub fn open_session(
        &self,
        token: Option<&str>,
        outbox: Sender<ServerMessage>,
    ) -> Result<(ConnectionId, Identity)> {
        let token = match token {
            Some(token) => {
                validate_token(token)?;
                token.to_string()
            }
            None => self.mint_token(),
        };
        let identity = Identity::from_token(&token);
        let connection_id = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));

        outbox
            .send(ServerMessage::IdentityToken {
                identity,
                token,
                connection_id,
            })
            .map_err(|_| SyncError::Connection("client went away during handshake".into()))?;

        self.sessions.write().insert(
            connection_id,
            Session {
                identity,
                subscribed: None,
                outbox,
            },
        );
        info!(target: "tablesync::host", connection = connection_id.0, identity = %identity.short(), "session opened");

        self.invoke_lifecycle(CLIENT_CONNECTED, identity, Some(connection_id));
        Ok((connection_id, identity))
    }

    /// Close a session and run `client_disconnected` once the identity has no
    /// live session left. Returns false if the session was already gone.
    pub fn close_session(&self, connection_id: ConnectionId) -> bool {
        let Some(session) = self.sessions.write().remove(&connection_id) else {
            return false;
        };
        info!(target: "tablesync::host", connection = connection_id.0, identity = %session.identity.short(), "session closed");
        drop(session.outbox);

        let still_live = self
            .sessions
            .read()
            .values()
            .any(|s| s.identity == session.identity);
        if still_live {
            debug!(target: "tablesync::host", identity = %session.identity.short(), "identity has another live session");
        } else {
            self.invoke_lifecycle(CLIENT_DISCONNECTED, session.identity, Some(connection_id));
        }
        true
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.sessions.read().keys().copied().collect();
        for id in ids {
            self.close_session(id);
        }
    }

    /// Handle one message from a connected client.
    pub fn handle_message(&self, connection_id: ConnectionId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Connect { .. } => {
                warn!(target: "tablesync::host", connection = connection_id.0, "duplicate handshake ignored");
                Ok(())
            }
            ClientMessage::Subscribe { tables } => self.subscribe(connection_id, tables),
            ClientMessage::CallReducer(call) => self.call_reducer(connection_id, call),
            ClientMessage::Disconnect => {
                self.close_session(connection_id);
                Ok(())
            }
        }
    }

    fn subscribe(&self, connection_id: ConnectionId, tables: Vec<String>) -> Result<()> {
        let db = self.db.lock();
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&connection_id)
            .ok_or(SyncError::NotConnected)?;

        let message = match db.snapshot(&tables) {
            Ok(snapshot) => {
                debug!(target: "tablesync::host", connection = connection_id.0, tables = ?tables, "subscription applied");
                session.subscribed = Some(tables.into_iter().collect());
                ServerMessage::InitialSubscription { tables: snapshot }
            }
            Err(e) => {
                warn!(target: "tablesync::host", connection = connection_id.0, error = %e, "subscription rejected");
                ServerMessage::SubscriptionError {
                    reason: e.to_string(),
                }
            }
        };

        if session.outbox.send(message).is_err() {
            debug!(target: "tablesync::host", connection = connection_id.0, "outbox closed");
        }
        Ok(())
    }

    fn call_reducer(&self, connection_id: ConnectionId, call: ReducerCall) -> Result<()> {
        let identity = self
            .sessions
            .read()
            .get(&connection_id)
            .map(|s| s.identity)
            .ok_or(SyncError::NotConnected)?;

        match self.procedures.kind(&call.reducer) {
            Some(ReducerKind::User) => {
                self.run_transaction(
                    &call.reducer,
                    call.args,
                    identity,
                    Some(connection_id),
                    Some(call.request_id),
                );
            }
            kind => {
                let reason = match kind {
                    None => format!("no such reducer: {}", call.reducer),
                    Some(_) => format!("reducer {} is not client-callable", call.reducer),
                };
                warn!(target: "tablesync::host", connection = connection_id.0, %reason, "reducer call rejected");
                let _db = self.db.lock();
                self.broadcast(
                    TransactionUpdate {
                        status: Status::Failed(reason),
                        caller_identity: identity,
                        caller_connection_id: Some(connection_id),
                        reducer: call.reducer,
                        args: call.args,
                        request_id: None,
                        timestamp: Timestamp::now(),
                        tables: Vec::new(),
                    },
                    Some(call.request_id),
                );
            }
        }
        Ok(())
    }

    // --- Reducers ---

    /// Run a lifecycle reducer on behalf of `caller`.
    pub fn invoke_lifecycle(
        &self,
        reducer: &str,
        caller: Identity,
        connection_id: Option<ConnectionId>,
    ) -> Status {
        self.run_transaction(reducer, Vec::new(), caller, connection_id, None)
    }

    /// Run a client-callable reducer as `caller` without a connection.
    pub fn call_as<A: ReducerArgs>(&self, caller: Identity, args: &A) -> Result<Status> {
        if self.procedures.kind(A::NAME) != Some(ReducerKind::User) {
            return Err(SyncError::UnknownReducer(A::NAME.to_string()));
        }
        Ok(self.run_transaction(A::NAME, encode(args)?, caller, None, None))
    }

    fn run_transaction(
        &self,
        reducer: &str,
        args: Vec<u8>,
        caller: Identity,
        connection_id: Option<ConnectionId>,
        request_id: Option<RequestId>,
    ) -> Status {
        let mut db = self.db.lock();
        let timestamp = Timestamp::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = ReducerContext::new(&db, caller, connection_id, timestamp);
            self.procedures
                .invoke(reducer, &mut ctx, &args)
                .map(|()| ctx.into_commit())
        }))
        .unwrap_or_else(|payload| Err(panic_reason(reducer, payload.as_ref())));

        let (status, tables) = match outcome {
            Ok(commit) => (Status::Committed, db.commit(commit)),
            Err(reason) => {
                warn!(target: "tablesync::host", reducer, caller = %caller.short(), %reason, "reducer failed");
                (Status::Failed(reason), Vec::new())
            }
        };
        debug!(target: "tablesync::host", reducer, status = ?status, tables = tables.len(), "transaction finished");

        self.broadcast(
            TransactionUpdate {
                status: status.clone(),
                caller_identity: caller,
                caller_connection_id: connection_id,
                reducer: reducer.to_string(),
                args,
                request_id: None,
                timestamp,
                tables,
            },
            request_id,
        );
        status
    }

    /// Send a transaction outcome to every interested session. Callers must
    /// hold the database lock.
    fn broadcast(&self, update: TransactionUpdate, request_id: Option<RequestId>) {
        let sessions = self.sessions.read();
        for (id, session) in sessions.iter() {
            let is_caller = request_id.is_some() && update.caller_connection_id == Some(*id);
            let tables: Vec<_> = match &session.subscribed {
                Some(subscribed) => update
                    .tables
                    .iter()
                    .filter(|t| subscribed.contains(&t.table))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            if !is_caller && tables.is_empty() {
                continue;
            }

            let message = ServerMessage::TransactionUpdate(TransactionUpdate {
                status: update.status.clone(),
                caller_identity: update.caller_identity,
                caller_connection_id: update.caller_connection_id,
                reducer: update.reducer.clone(),
                args: update.args.clone(),
                request_id: if is_caller { request_id } else { None },
                timestamp: update.timestamp,
                tables,
            });
            if session.outbox.send(message).is_err() {
                debug!(target: "tablesync::host", connection = id.0, "outbox closed");
            }
        }
    }

    // --- Inspection ---

    /// Committed rows of `R`'s table.
    pub fn rows<R: Row>(&self) -> Vec<R> {
        self.db
            .lock()
            .table::<R>()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find<R: Row>(&self, key: &R::Key) -> Option<R> {
        self.db.lock().table::<R>().and_then(|t| t.find(key)).cloned()
    }

    fn mint_token(&self) -> String {
        let counter = self.minted_tokens.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(self.module_name.as_bytes());
        hasher.update(Timestamp::now().0.to_le_bytes());
        hasher.update(counter.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Failure reason for a reducer that panicked. Staged writes die with the
/// unwound transaction.
fn panic_reason(reducer: &str, payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("reducer {} panicked: {}", reducer, message)
}

/// Tokens are 64 lower-case hex characters.
fn validate_token(token: &str) -> Result<()> {
    let well_formed = token.len() == TOKEN_HEX_LEN
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if well_formed {
        Ok(())
    } else {
        Err(SyncError::InvalidToken(format!(
            "expected {} lower-case hex characters",
            TOKEN_HEX_LEN
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SetUserName, Turret, TurretStats, User};
    use crossbeam_channel::{unbounded, Receiver};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct FireAt {
        slot: usize,
    }

    impl ReducerArgs for FireAt {
        const NAME: &'static str = "fire_at";
    }

    /// Stages a turret, then indexes past the end of an empty list.
    fn fire_at(ctx: &mut ReducerContext<'_>, args: FireAt) -> ReducerResult {
        ctx.table::<Turret>()
            .insert(Turret::new("Doomed", 1, TurretStats { attack_percentage: 1 }))?;
        let slots: Vec<u32> = Vec::new();
        let _ = slots[args.slot];
        Ok(())
    }

    fn call(slot: usize, request: u32) -> ClientMessage {
        ClientMessage::CallReducer(ReducerCall {
            reducer: FireAt::NAME.into(),
            args: encode(&FireAt { slot }).unwrap(),
            request_id: RequestId(request),
        })
    }

    fn host() -> Host {
        Host::new(
            &HostConfig::default(),
            crate::schema::registry(),
            module::procedures(),
        )
    }

    fn drain(rx: &Receiver<ServerMessage>) -> Vec<ServerMessage> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_open_session_sends_identity_first_and_creates_user() {
        let host = host();
        let (tx, rx) = unbounded();
        let (conn, identity) = host.open_session(None, tx).unwrap();

        let messages = drain(&rx);
        assert!(matches!(
            &messages[0],
            ServerMessage::IdentityToken { connection_id, identity: id, .. }
                if *connection_id == conn && *id == identity
        ));
        assert!(host.find::<User>(&identity).unwrap().online);
    }

    #[test]
    fn test_supplied_token_maps_to_same_identity() {
        let host = host();
        let token = "ab".repeat(32);
        let (tx, _rx) = unbounded();
        let (_, identity) = host.open_session(Some(&token), tx).unwrap();
        assert_eq!(identity, Identity::from_token(&token));
    }

    #[test]
    fn test_malformed_token_rejected() {
        let host = host();
        let (tx, _rx) = unbounded();
        let result = host.open_session(Some("not-a-token"), tx);
        assert!(matches!(result, Err(SyncError::InvalidToken(_))));
        assert_eq!(host.session_count(), 0);
    }

    #[test]
    fn test_seeded_host_has_parts() {
        let host = Host::tank(&HostConfig {
            seed_parts: true,
            ..Default::default()
        });
        assert_eq!(host.rows::<Turret>().len(), 2);
    }

    #[test]
    fn test_unsubscribed_peer_does_not_receive_others_updates() {
        let host = host();
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        let (conn_a, _) = host.open_session(None, tx_a).unwrap();
        host.open_session(None, tx_b).unwrap();
        drain(&rx_a);
        drain(&rx_b);

        host.handle_message(
            conn_a,
            ClientMessage::CallReducer(ReducerCall {
                reducer: SetUserName::NAME.into(),
                args: encode(&SetUserName { name: "A".into() }).unwrap(),
                request_id: RequestId(1),
            }),
        )
        .unwrap();

        let to_a = drain(&rx_a);
        assert_eq!(to_a.len(), 1);
        match &to_a[0] {
            ServerMessage::TransactionUpdate(update) => {
                assert_eq!(update.request_id, Some(RequestId(1)));
                assert!(update.tables.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(drain(&rx_b).is_empty());
    }

    #[test]
    fn test_lifecycle_reducer_not_client_callable() {
        let host = host();
        let (tx, rx) = unbounded();
        let (conn, _) = host.open_session(None, tx).unwrap();
        drain(&rx);

        host.handle_message(
            conn,
            ClientMessage::CallReducer(ReducerCall {
                reducer: CLIENT_DISCONNECTED.into(),
                args: Vec::new(),
                request_id: RequestId(4),
            }),
        )
        .unwrap();

        match drain(&rx).as_slice() {
            [ServerMessage::TransactionUpdate(update)] => {
                assert!(matches!(&update.status, Status::Failed(r) if r.contains("not client-callable")));
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    #[test]
    fn test_close_session_is_idempotent() {
        let host = host();
        let (tx, _rx) = unbounded();
        let (conn, identity) = host.open_session(None, tx).unwrap();

        assert!(host.close_session(conn));
        assert!(!host.close_session(conn));
        assert!(!host.find::<User>(&identity).unwrap().online);
        assert!(host.handle_message(conn, ClientMessage::Subscribe { tables: vec![] }).is_err());
    }

    #[test]
    fn test_panicking_reducer_fails_and_rolls_back() {
        let host = Host::new(
            &HostConfig::default(),
            crate::schema::registry(),
            module::procedures().reducer::<FireAt>(fire_at),
        );
        let (tx, rx) = unbounded();
        let (conn, identity) = host.open_session(None, tx).unwrap();
        drain(&rx);

        host.handle_message(conn, call(3, 9)).unwrap();
        match drain(&rx).as_slice() {
            [ServerMessage::TransactionUpdate(update)] => {
                assert_eq!(update.request_id, Some(RequestId(9)));
                assert!(matches!(&update.status, Status::Failed(r) if r.contains("fire_at panicked")));
                assert!(update.tables.is_empty());
            }
            other => panic!("unexpected messages {:?}", other),
        }
        assert!(host.rows::<Turret>().is_empty());

        // The database lock was released and the session survives.
        host.handle_message(conn, call(0, 10)).unwrap();
        assert_eq!(drain(&rx).len(), 1);
        assert!(host.close_session(conn));
        assert_eq!(host.session_count(), 0);
        assert!(!host.find::<User>(&identity).unwrap().online);
    }

    #[test]
    fn test_shared_identity_stays_online_until_last_session_closes() {
        let host = host();
        let token = "cd".repeat(32);
        let (tx_a, _rx_a) = unbounded();
        let (tx_b, _rx_b) = unbounded();
        let (conn_a, identity) = host.open_session(Some(&token), tx_a).unwrap();
        let (conn_b, _) = host.open_session(Some(&token), tx_b).unwrap();
        assert_eq!(host.rows::<User>().len(), 1);

        assert!(host.close_session(conn_a));
        assert!(host.find::<User>(&identity).unwrap().online);

        assert!(host.close_session(conn_b));
        assert!(!host.find::<User>(&identity).unwrap().online);
    }

    #[test]
    fn test_validate_token() {
        assert!(validate_token(&"0".repeat(64)).is_ok());
        assert!(validate_token(&"A".repeat(64)).is_err());
        assert!(validate_token("abc").is_err());
    }
}
