//! Connection identity and the contexts handed to callbacks.

use crate::cache::ClientCache;
use crate::types::{ConnectionId, Identity, RequestId, Status, Timestamp};
use std::sync::{Arc, OnceLock};

/// The client's own identity, published once after connecting and readable
/// from any thread without locking.
#[derive(Clone, Debug, Default)]
pub struct ConnectionContext {
    published: Arc<OnceLock<(Identity, ConnectionId)>>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the identity. Only the first call has an effect; returns
    /// whether this call published.
    pub(crate) fn publish(&self, identity: Identity, connection_id: ConnectionId) -> bool {
        self.published.set((identity, connection_id)).is_ok()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.published.get().map(|(identity, _)| *identity)
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.published.get().map(|(_, id)| *id)
    }

    pub fn is_published(&self) -> bool {
        self.published.get().is_some()
    }
}

/// Outcome of a reducer call as seen by subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct ReducerEvent {
    pub reducer: String,
    /// Encoded arguments.
    pub args: Vec<u8>,
    pub caller_identity: Identity,
    pub caller_connection_id: Option<ConnectionId>,
    pub status: Status,
    pub timestamp: Timestamp,
    /// Set only when this client made the call.
    pub request_id: Option<RequestId>,
}

/// What caused a row callback to fire.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The initial subscription snapshot was applied.
    SubscribeApplied,
    /// A reducer committed.
    Reducer(ReducerEvent),
    /// A transaction from a reducer this client has no schema entry for.
    UnknownTransaction,
}

/// Passed to row callbacks.
pub struct EventContext<'a> {
    /// The cache after the whole transaction or snapshot was applied.
    pub db: &'a ClientCache,
    pub event: &'a Event,
    pub identity: Option<Identity>,
}

/// Passed to reducer callbacks.
pub struct ReducerEventContext<'a> {
    pub db: &'a ClientCache,
    pub event: &'a ReducerEvent,
    pub identity: Option<Identity>,
}

impl ReducerEventContext<'_> {
    /// Whether this client's identity made the call.
    pub fn is_own_call(&self) -> bool {
        self.identity == Some(self.event.caller_identity)
    }
}

/// Passed to subscription callbacks.
pub struct SubscriptionEventContext<'a> {
    pub db: &'a ClientCache,
    pub identity: Option<Identity>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry;
    use std::thread;

    #[test]
    fn test_publish_once() {
        let context = ConnectionContext::new();
        assert_eq!(context.identity(), None);

        let first = Identity::from_token("first");
        assert!(context.publish(first, ConnectionId(1)));
        assert!(!context.publish(Identity::from_token("second"), ConnectionId(2)));
        assert_eq!(context.identity(), Some(first));
        assert_eq!(context.connection_id(), Some(ConnectionId(1)));
    }

    #[test]
    fn test_published_identity_visible_across_threads() {
        let context = ConnectionContext::new();
        let reader = context.clone();
        let identity = Identity::from_token("me");
        context.publish(identity, ConnectionId(3));

        let seen = thread::spawn(move || reader.identity()).join().unwrap();
        assert_eq!(seen, Some(identity));
    }

    #[test]
    fn test_is_own_call() {
        let cache = ClientCache::new(&registry());
        let me = Identity::from_token("me");
        let event = ReducerEvent {
            reducer: "set_user_name".into(),
            args: Vec::new(),
            caller_identity: me,
            caller_connection_id: None,
            status: Status::Committed,
            timestamp: Timestamp(0),
            request_id: None,
        };

        let mine = ReducerEventContext {
            db: &cache,
            event: &event,
            identity: Some(me),
        };
        assert!(mine.is_own_call());

        let theirs = ReducerEventContext {
            db: &cache,
            event: &event,
            identity: Some(Identity::from_token("other")),
        };
        assert!(!theirs.is_own_call());
    }
}
