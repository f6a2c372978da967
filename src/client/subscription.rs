//! Subscription lifecycle.

use super::context::SubscriptionEventContext;
use super::DbConnection;
use crate::error::Result;
use std::collections::HashSet;

/// `Unsubscribed -> Requested -> Applied`. A rejected request goes back to
/// `Unsubscribed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Requested,
    /// The snapshot is in the cache and diffs are being applied.
    Applied,
}

/// Collects subscription callbacks, then sends the request.
pub struct SubscriptionBuilder<'c> {
    conn: &'c mut DbConnection,
    on_applied: Vec<Box<dyn FnMut(&SubscriptionEventContext<'_>) + Send>>,
    on_error: Vec<Box<dyn FnMut(&str) + Send>>,
}

impl<'c> SubscriptionBuilder<'c> {
    pub(crate) fn new(conn: &'c mut DbConnection) -> Self {
        Self {
            conn,
            on_applied: Vec::new(),
            on_error: Vec::new(),
        }
    }

    /// Runs once the snapshot is in the cache, after its insert callbacks.
    pub fn on_applied(
        mut self,
        f: impl FnMut(&SubscriptionEventContext<'_>) + Send + 'static,
    ) -> Self {
        self.on_applied.push(Box::new(f));
        self
    }

    /// Runs if the host rejects the subscription.
    pub fn on_error(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_error.push(Box::new(f));
        self
    }

    /// Subscribe to `tables`. Repeated names are requested once.
    pub fn subscribe(self, mut tables: Vec<String>) -> Result<()> {
        let mut seen = HashSet::new();
        tables.retain(|t| seen.insert(t.clone()));
        let Self {
            conn,
            on_applied,
            on_error,
        } = self;
        for f in on_applied {
            conn.dispatcher.on_applied(f);
        }
        for f in on_error {
            conn.dispatcher.on_subscription_error(f);
        }
        conn.request_subscription(tables)
    }

    /// Subscribe to every table in the connection's schema.
    pub fn subscribe_to_all_tables(self) -> Result<()> {
        let tables = self.conn.schema.table_names();
        self.subscribe(tables)
    }
}
