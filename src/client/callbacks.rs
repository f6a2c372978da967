//! Ordered callback registries, invoked on the processing loop's thread.

use super::context::{EventContext, ReducerEventContext, SubscriptionEventContext};
use crate::cache::{AppliedOps, CacheDelta, RowDiff};
use crate::error::Result;
use crate::schema::{decode, ReducerArgs, Row};
use std::any::Any;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Handle for removing a registered callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

pub type InsertCallback<R> = dyn FnMut(&EventContext<'_>, &R) + Send;
pub type UpdateCallback<R> = dyn FnMut(&EventContext<'_>, &R, &R) + Send;
pub type DeleteCallback<R> = dyn FnMut(&EventContext<'_>, &R) + Send;
pub type ReducerCallback<A> = dyn FnMut(&ReducerEventContext<'_>, &A) + Send;
pub type AppliedCallback = dyn FnMut(&SubscriptionEventContext<'_>) + Send;
pub type SubscriptionErrorCallback = dyn FnMut(&str) + Send;

/// Callbacks in registration order.
struct CallbackList<F: ?Sized> {
    entries: Vec<(CallbackId, Box<F>)>,
}

impl<F: ?Sized> CallbackList<F> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push(&mut self, id: CallbackId, f: Box<F>) {
        self.entries.push((id, f));
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<F>> {
        self.entries.iter_mut().map(|(_, f)| f)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct TableCallbacks<R: Row> {
    on_insert: CallbackList<InsertCallback<R>>,
    on_update: CallbackList<UpdateCallback<R>>,
    on_delete: CallbackList<DeleteCallback<R>>,
}

impl<R: Row> TableCallbacks<R> {
    fn new() -> Self {
        Self {
            on_insert: CallbackList::new(),
            on_update: CallbackList::new(),
            on_delete: CallbackList::new(),
        }
    }
}

trait AnyTableCallbacks: Send {
    fn dispatch(&mut self, ctx: &EventContext<'_>, applied: &AppliedOps);

    fn remove(&mut self, id: CallbackId) -> bool;

    fn len(&self) -> usize;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<R: Row> AnyTableCallbacks for TableCallbacks<R> {
    fn dispatch(&mut self, ctx: &EventContext<'_>, applied: &AppliedOps) {
        let Some(diffs) = applied.diffs::<R>() else {
            warn!(target: "tablesync::dispatch", table = R::TABLE, "row type mismatch, skipping callbacks");
            return;
        };
        for diff in diffs {
            match diff {
                RowDiff::Insert(row) => self.on_insert.iter_mut().for_each(|f| f(ctx, row)),
                RowDiff::Update { old, new } => {
                    self.on_update.iter_mut().for_each(|f| f(ctx, old, new))
                }
                RowDiff::Delete(row) => self.on_delete.iter_mut().for_each(|f| f(ctx, row)),
            }
        }
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        self.on_insert.remove(id) || self.on_update.remove(id) || self.on_delete.remove(id)
    }

    fn len(&self) -> usize {
        self.on_insert.len() + self.on_update.len() + self.on_delete.len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct ReducerCallbacks<A: ReducerArgs> {
    list: CallbackList<ReducerCallback<A>>,
}

trait AnyReducerCallbacks: Send {
    /// Decode the event's arguments and run every callback.
    fn dispatch(&mut self, ctx: &ReducerEventContext<'_>) -> Result<()>;

    fn remove(&mut self, id: CallbackId) -> bool;

    fn len(&self) -> usize;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<A: ReducerArgs> AnyReducerCallbacks for ReducerCallbacks<A> {
    fn dispatch(&mut self, ctx: &ReducerEventContext<'_>) -> Result<()> {
        if self.list.entries.is_empty() {
            return Ok(());
        }
        let args: A = decode(&ctx.event.args)?;
        self.list.iter_mut().for_each(|f| f(ctx, &args));
        Ok(())
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        self.list.remove(id)
    }

    fn len(&self) -> usize {
        self.list.len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Row, reducer and subscription callbacks of one connection.
pub struct EventDispatcher {
    next_id: u64,
    tables: HashMap<&'static str, Box<dyn AnyTableCallbacks>>,
    reducers: HashMap<&'static str, Box<dyn AnyReducerCallbacks>>,
    on_applied: CallbackList<AppliedCallback>,
    on_subscription_error: CallbackList<SubscriptionErrorCallback>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            tables: HashMap::new(),
            reducers: HashMap::new(),
            on_applied: CallbackList::new(),
            on_subscription_error: CallbackList::new(),
        }
    }

    fn next_id(&mut self) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        id
    }

    fn table<R: Row>(&mut self) -> Option<&mut TableCallbacks<R>> {
        self.tables
            .entry(R::TABLE)
            .or_insert_with(|| Box::new(TableCallbacks::<R>::new()))
            .as_any_mut()
            .downcast_mut::<TableCallbacks<R>>()
    }

    fn reducer<A: ReducerArgs>(&mut self) -> Option<&mut ReducerCallbacks<A>> {
        self.reducers
            .entry(A::NAME)
            .or_insert_with(|| {
                Box::new(ReducerCallbacks::<A> {
                    list: CallbackList::new(),
                })
            })
            .as_any_mut()
            .downcast_mut::<ReducerCallbacks<A>>()
    }

    pub fn on_insert<R: Row>(
        &mut self,
        f: impl FnMut(&EventContext<'_>, &R) + Send + 'static,
    ) -> CallbackId {
        let id = self.next_id();
        if let Some(table) = self.table::<R>() {
            table.on_insert.push(id, Box::new(f));
        }
        id
    }

    pub fn on_update<R: Row>(
        &mut self,
        f: impl FnMut(&EventContext<'_>, &R, &R) + Send + 'static,
    ) -> CallbackId {
        let id = self.next_id();
        if let Some(table) = self.table::<R>() {
            table.on_update.push(id, Box::new(f));
        }
        id
    }

    pub fn on_delete<R: Row>(
        &mut self,
        f: impl FnMut(&EventContext<'_>, &R) + Send + 'static,
    ) -> CallbackId {
        let id = self.next_id();
        if let Some(table) = self.table::<R>() {
            table.on_delete.push(id, Box::new(f));
        }
        id
    }

    pub fn on_reducer<A: ReducerArgs>(
        &mut self,
        f: impl FnMut(&ReducerEventContext<'_>, &A) + Send + 'static,
    ) -> CallbackId {
        let id = self.next_id();
        if let Some(reducer) = self.reducer::<A>() {
            reducer.list.push(id, Box::new(f));
        }
        id
    }

    pub fn on_applied(
        &mut self,
        f: impl FnMut(&SubscriptionEventContext<'_>) + Send + 'static,
    ) -> CallbackId {
        let id = self.next_id();
        self.on_applied.push(id, Box::new(f));
        id
    }

    pub fn on_subscription_error(&mut self, f: impl FnMut(&str) + Send + 'static) -> CallbackId {
        let id = self.next_id();
        self.on_subscription_error.push(id, Box::new(f));
        id
    }

    /// Remove a callback of any kind. Returns false if it was not registered.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        self.tables.values_mut().any(|t| t.remove(id))
            || self.reducers.values_mut().any(|r| r.remove(id))
            || self.on_applied.remove(id)
            || self.on_subscription_error.remove(id)
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum::<usize>()
            + self.reducers.values().map(|r| r.len()).sum::<usize>()
            + self.on_applied.len()
            + self.on_subscription_error.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run row callbacks for every applied diff, table by table.
    pub fn dispatch_rows(&mut self, ctx: &EventContext<'_>, delta: &CacheDelta) {
        for applied in delta.tables() {
            if let Some(callbacks) = self.tables.get_mut(applied.table()) {
                callbacks.dispatch(ctx, applied);
            }
        }
    }

    pub fn dispatch_reducer(&mut self, ctx: &ReducerEventContext<'_>) {
        let Some(callbacks) = self.reducers.get_mut(ctx.event.reducer.as_str()) else {
            return;
        };
        if let Err(e) = callbacks.dispatch(ctx) {
            warn!(target: "tablesync::dispatch", reducer = %ctx.event.reducer, error = %e, "could not decode reducer arguments");
        }
    }

    pub fn dispatch_applied(&mut self, ctx: &SubscriptionEventContext<'_>) {
        debug!(target: "tablesync::dispatch", callbacks = self.on_applied.len(), "subscription applied");
        self.on_applied.iter_mut().for_each(|f| f(ctx));
    }

    pub fn dispatch_subscription_error(&mut self, reason: &str) {
        self.on_subscription_error.iter_mut().for_each(|f| f(reason));
    }
}
