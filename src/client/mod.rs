//! Client connection: replicated cache, callbacks and reducer calls.
//!
//! A [`DbConnection`] is owned by one thread, normally the
//! [`ProcessingLoop`](crate::processing::ProcessingLoop). Each
//! [`frame_tick`](DbConnection::frame_tick) drains the transport, applies
//! snapshots and diffs to the cache in delivery order, and runs callbacks
//! synchronously. The only state other threads see is the identity in
//! [`ConnectionContext`].
//!
//! # Example
//!
//! ```ignore
//! let mut conn = DbConnection::builder()
//!     .with_uri("tcp://127.0.0.1:3000")
//!     .with_module_name("quickstart-tanks")
//!     .on_connect(|conn, identity, token| {
//!         let _ = conn.subscription_builder().subscribe_to_all_tables();
//!     })
//!     .build()?;
//!
//! conn.on_insert::<User>(|_, user| println!("{} joined", user.name_or_identity()));
//! loop {
//!     conn.frame_tick()?;
//! }
//! ```

mod callbacks;
mod context;
pub mod notices;
mod reducers;
mod subscription;

pub use callbacks::{CallbackId, EventDispatcher};
pub use context::{
    ConnectionContext, Event, EventContext, ReducerEvent, ReducerEventContext,
    SubscriptionEventContext,
};
pub use subscription::{SubscriptionBuilder, SubscriptionState};

use crate::cache::{CacheDelta, ClientCache};
use crate::error::{Result, SyncError};
use crate::protocol::{ClientMessage, ReducerCall, ServerMessage, TableSnapshot, TransactionUpdate};
use crate::schema::{encode, ReducerArgs, Row, SchemaRegistry};
use crate::transport::{Connector, TcpConnector, Transport, TransportEvent};
use crate::types::{ConnectionId, Identity, RequestId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long `build` waits for the host to confirm the identity.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const HANDSHAKE_POLL: Duration = Duration::from_millis(5);

type ConnectCallback = dyn FnOnce(&mut DbConnection, Identity, &str) + Send;
type ConnectErrorCallback = dyn FnOnce(&SyncError) + Send;
type DisconnectCallback = dyn FnOnce(&DbConnection, Option<&SyncError>) + Send;

/// Configures and opens a [`DbConnection`].
pub struct DbConnectionBuilder {
    uri: Option<String>,
    module_name: Option<String>,
    token: Option<String>,
    schema: Option<SchemaRegistry>,
    handshake_timeout: Duration,
    on_connect: Option<Box<ConnectCallback>>,
    on_connect_error: Option<Box<ConnectErrorCallback>>,
    on_disconnect: Option<Box<DisconnectCallback>>,
}

impl DbConnectionBuilder {
    fn new() -> Self {
        Self {
            uri: None,
            module_name: None,
            token: None,
            schema: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            on_connect: None,
            on_connect_error: None,
            on_disconnect: None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_module_name(mut self, name: impl Into<String>) -> Self {
        self.module_name = Some(name.into());
        self
    }

    /// Bearer token from a previous session. Without one the host mints a
    /// fresh identity.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Schema to decode rows with; defaults to [`schema::registry`](crate::schema::registry).
    pub fn with_schema(mut self, schema: SchemaRegistry) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Runs exactly once, after the identity is published.
    pub fn on_connect(
        mut self,
        f: impl FnOnce(&mut DbConnection, Identity, &str) + Send + 'static,
    ) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn on_connect_error(mut self, f: impl FnOnce(&SyncError) + Send + 'static) -> Self {
        self.on_connect_error = Some(Box::new(f));
        self
    }

    /// Runs once when the connection ends. The error is `None` for a
    /// normal disconnect.
    pub fn on_disconnect(
        mut self,
        f: impl FnOnce(&DbConnection, Option<&SyncError>) + Send + 'static,
    ) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// Connect to the `tcp://` URI given by [`with_uri`](Self::with_uri).
    pub fn build(mut self) -> Result<DbConnection> {
        let connector = match self.uri.as_deref() {
            Some(uri) => TcpConnector::from_uri(uri),
            None => Err(SyncError::Config("no host URI given".into())),
        };
        match connector {
            Ok(connector) => self.build_with(&connector),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Connect through `connector`, e.g. an in-process host.
    pub fn build_with(mut self, connector: &dyn Connector) -> Result<DbConnection> {
        let Some(module) = self.module_name.clone() else {
            let e = SyncError::Config("no module name given".into());
            self.fail(&e);
            return Err(e);
        };

        let outcome = connector
            .connect(&module, self.token.as_deref())
            .and_then(|transport| handshake(transport, self.handshake_timeout));
        let (transport, identity, connection_id, token, pending) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let context = ConnectionContext::new();
        context.publish(identity, connection_id);
        info!(target: "tablesync::client", module = %module, identity = %identity.short(), connection = connection_id.0, "connected");

        let schema = self.schema.take().unwrap_or_else(crate::schema::registry);
        let mut conn = DbConnection {
            transport,
            cache: ClientCache::new(&schema),
            schema: Arc::new(schema),
            context,
            dispatcher: EventDispatcher::new(),
            subscription: SubscriptionState::Unsubscribed,
            pending,
            on_disconnect: self.on_disconnect.take(),
            next_request: 1,
            connected: true,
        };

        if let Some(on_connect) = self.on_connect.take() {
            on_connect(&mut conn, identity, &token);
        }
        Ok(conn)
    }

    fn fail(&mut self, e: &SyncError) {
        error!(target: "tablesync::client", error = %e, "connection failed");
        if let Some(f) = self.on_connect_error.take() {
            f(e);
        }
    }
}

type Handshake = (
    Box<dyn Transport>,
    Identity,
    ConnectionId,
    String,
    VecDeque<TransportEvent>,
);

/// Wait for the host to confirm our identity. Events that arrive after the
/// confirmation are kept for the first tick.
fn handshake(mut transport: Box<dyn Transport>, timeout: Duration) -> Result<Handshake> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut events: VecDeque<_> = transport.poll().into();
        while let Some(event) = events.pop_front() {
            match event {
                TransportEvent::Message(ServerMessage::IdentityToken {
                    identity,
                    token,
                    connection_id,
                }) => return Ok((transport, identity, connection_id, token, events)),
                TransportEvent::Message(ServerMessage::ConnectRefused { reason }) => {
                    transport.close();
                    return Err(SyncError::Connection(reason));
                }
                TransportEvent::Closed(reason) => {
                    return Err(SyncError::Connection(
                        reason.unwrap_or_else(|| "closed during handshake".into()),
                    ));
                }
                TransportEvent::Message(other) => {
                    warn!(target: "tablesync::client", message = ?other, "message before handshake dropped");
                }
            }
        }
        if Instant::now() >= deadline {
            transport.close();
            return Err(SyncError::Connection("handshake timed out".into()));
        }
        thread::sleep(HANDSHAKE_POLL);
    }
}

/// A live connection to a host module.
pub struct DbConnection {
    transport: Box<dyn Transport>,
    schema: Arc<SchemaRegistry>,
    context: ConnectionContext,
    cache: ClientCache,
    dispatcher: EventDispatcher,
    subscription: SubscriptionState,
    pending: VecDeque<TransportEvent>,
    on_disconnect: Option<Box<DisconnectCallback>>,
    next_request: u32,
    connected: bool,
}

impl DbConnection {
    pub fn builder() -> DbConnectionBuilder {
        DbConnectionBuilder::new()
    }

    /// The replicated tables.
    pub fn db(&self) -> &ClientCache {
        &self.cache
    }

    /// Shareable handle to this client's identity.
    pub fn context(&self) -> ConnectionContext {
        self.context.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.context.identity()
    }

    pub fn schema(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.schema)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription
    }

    pub fn subscription_builder(&mut self) -> SubscriptionBuilder<'_> {
        SubscriptionBuilder::new(self)
    }

    pub(crate) fn request_subscription(&mut self, tables: Vec<String>) -> Result<()> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        debug!(target: "tablesync::client", tables = ?tables, "requesting subscription");
        self.transport.send(ClientMessage::Subscribe { tables })?;
        self.subscription = SubscriptionState::Requested;
        Ok(())
    }

    /// Ask the host to run a reducer. The outcome arrives later as a
    /// reducer event.
    pub fn call_reducer<A: ReducerArgs>(&mut self, args: &A) -> Result<RequestId> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        let request_id = RequestId(self.next_request);
        self.next_request = self.next_request.wrapping_add(1);
        self.transport.send(ClientMessage::CallReducer(ReducerCall {
            reducer: A::NAME.to_string(),
            args: encode(args)?,
            request_id,
        }))?;
        debug!(target: "tablesync::client", reducer = A::NAME, request = request_id.0, "reducer call sent");
        Ok(request_id)
    }

    /// Process everything the transport has received, returning the number
    /// of messages handled.
    ///
    /// A snapshot that fails to apply is reported to subscription error
    /// callbacks and returned as the error, after the remaining messages of
    /// this tick have been handled.
    pub fn frame_tick(&mut self) -> Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        let mut events: Vec<_> = self.pending.drain(..).collect();
        events.extend(self.transport.poll());

        let mut handled = 0;
        let mut first_error = None;
        for event in events {
            match event {
                TransportEvent::Message(message) => {
                    handled += 1;
                    if let Err(e) = self.handle_message(message) {
                        first_error.get_or_insert(e);
                    }
                }
                TransportEvent::Closed(reason) => {
                    self.handle_closed(reason.map(SyncError::Transport));
                    break;
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    /// End the connection. Safe to call repeatedly; only the first call
    /// has an effect.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.transport.send(ClientMessage::Disconnect) {
            debug!(target: "tablesync::client", error = %e, "disconnect notice not delivered");
        }
        self.transport.close();
        self.connected = false;
        info!(target: "tablesync::client", "disconnected");
        if let Some(f) = self.on_disconnect.take() {
            f(self, None);
        }
    }

    fn handle_closed(&mut self, error: Option<SyncError>) {
        self.transport.close();
        self.connected = false;
        match &error {
            Some(e) => warn!(target: "tablesync::client", error = %e, "connection lost"),
            None => info!(target: "tablesync::client", "connection closed"),
        }
        if let Some(f) = self.on_disconnect.take() {
            f(self, error.as_ref());
        }
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::IdentityToken { .. } => {
                warn!(target: "tablesync::client", "repeated identity message ignored");
            }
            ServerMessage::ConnectRefused { reason } => {
                self.handle_closed(Some(SyncError::Connection(reason)));
            }
            ServerMessage::InitialSubscription { tables } => return self.apply_snapshot(&tables),
            ServerMessage::SubscriptionError { reason } => {
                warn!(target: "tablesync::client", %reason, "subscription rejected");
                self.subscription = SubscriptionState::Unsubscribed;
                self.dispatcher.dispatch_subscription_error(&reason);
            }
            ServerMessage::TransactionUpdate(update) => self.apply_transaction(update),
        }
        Ok(())
    }

    fn apply_snapshot(&mut self, tables: &[TableSnapshot]) -> Result<()> {
        let delta = match self.cache.apply_snapshot(tables) {
            Ok(delta) => delta,
            Err(e) => {
                error!(target: "tablesync::client", error = %e, "snapshot rejected");
                self.subscription = SubscriptionState::Unsubscribed;
                self.dispatcher.dispatch_subscription_error(&e.to_string());
                return Err(e);
            }
        };
        self.subscription = SubscriptionState::Applied;
        info!(target: "tablesync::client", tables = tables.len(), rows = delta.len(), "subscription applied");

        let identity = self.context.identity();
        let event = Event::SubscribeApplied;
        let ctx = EventContext {
            db: &self.cache,
            event: &event,
            identity,
        };
        self.dispatcher.dispatch_rows(&ctx, &delta);
        self.dispatcher.dispatch_applied(&SubscriptionEventContext {
            db: &self.cache,
            identity,
        });
        Ok(())
    }

    fn apply_transaction(&mut self, update: TransactionUpdate) {
        let delta = if self.subscription == SubscriptionState::Applied {
            self.cache.apply_updates(&update.tables)
        } else {
            if !update.tables.is_empty() {
                debug!(target: "tablesync::client", reducer = %update.reducer, "diffs before subscription dropped");
            }
            CacheDelta::default()
        };
        for violation in &delta.violations {
            error!(target: "tablesync::cache", reducer = %update.reducer, error = %violation, "diff skipped");
        }

        let event = if self.schema.reducer(&update.reducer).is_some() {
            Event::Reducer(ReducerEvent {
                reducer: update.reducer,
                args: update.args,
                caller_identity: update.caller_identity,
                caller_connection_id: update.caller_connection_id,
                status: update.status,
                timestamp: update.timestamp,
                request_id: update.request_id,
            })
        } else {
            debug!(target: "tablesync::client", reducer = %update.reducer, "transaction from unknown reducer");
            Event::UnknownTransaction
        };

        let identity = self.context.identity();
        let ctx = EventContext {
            db: &self.cache,
            event: &event,
            identity,
        };
        self.dispatcher.dispatch_rows(&ctx, &delta);

        if let Event::Reducer(reducer_event) = &event {
            self.dispatcher.dispatch_reducer(&ReducerEventContext {
                db: &self.cache,
                event: reducer_event,
                identity,
            });
        }
    }

    // --- Callbacks ---

    pub fn on_insert<R: Row>(
        &mut self,
        f: impl FnMut(&EventContext<'_>, &R) + Send + 'static,
    ) -> CallbackId {
        self.dispatcher.on_insert(f)
    }

    pub fn on_update<R: Row>(
        &mut self,
        f: impl FnMut(&EventContext<'_>, &R, &R) + Send + 'static,
    ) -> CallbackId {
        self.dispatcher.on_update(f)
    }

    pub fn on_delete<R: Row>(
        &mut self,
        f: impl FnMut(&EventContext<'_>, &R) + Send + 'static,
    ) -> CallbackId {
        self.dispatcher.on_delete(f)
    }

    /// Runs for every outcome of reducer `A`, whoever called it.
    pub fn on_reducer<A: ReducerArgs>(
        &mut self,
        f: impl FnMut(&ReducerEventContext<'_>, &A) + Send + 'static,
    ) -> CallbackId {
        self.dispatcher.on_reducer(f)
    }

    /// Runs only when a call to `A` made by this identity failed.
    pub fn on_own_reducer_failure<A: ReducerArgs>(
        &mut self,
        mut f: impl FnMut(&ReducerEventContext<'_>, &A, &str) + Send + 'static,
    ) -> CallbackId {
        self.dispatcher.on_reducer::<A>(move |ctx, args| {
            if !ctx.is_own_call() {
                return;
            }
            if let Some(reason) = ctx.event.status.failure() {
                f(ctx, args, reason);
            }
        })
    }

    pub fn remove_callback(&mut self, id: CallbackId) -> bool {
        self.dispatcher.remove(id)
    }
}

impl Drop for DbConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
