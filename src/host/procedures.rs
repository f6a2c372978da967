//! Reducer registry and the context reducers run in.

use super::transaction::{Commit, Database, TableHandle, Transaction};
use crate::schema::{decode, ReducerArgs, ReducerKind, Row};
use crate::types::{ConnectionId, Identity, Timestamp};
use std::collections::HashMap;

/// Reducer outcome; the error string becomes `Status::Failed`.
pub type ReducerResult<T = ()> = std::result::Result<T, String>;

/// Everything a reducer can see: who called, when, and the open transaction.
pub struct ReducerContext<'a> {
    pub sender: Identity,
    pub connection_id: Option<ConnectionId>,
    pub timestamp: Timestamp,
    tx: Transaction<'a>,
}

impl<'a> ReducerContext<'a> {
    pub(crate) fn new(
        db: &'a Database,
        sender: Identity,
        connection_id: Option<ConnectionId>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            sender,
            connection_id,
            timestamp,
            tx: db.begin(),
        }
    }

    pub fn table<R: Row>(&mut self) -> TableHandle<'_, 'a, R> {
        self.tx.table::<R>()
    }

    pub(crate) fn into_commit(self) -> Commit {
        self.tx.into_commit()
    }
}

type Handler = Box<dyn Fn(&mut ReducerContext<'_>, &[u8]) -> ReducerResult + Send + Sync>;

struct Procedure {
    kind: ReducerKind,
    handler: Handler,
}

/// Reducer handlers by name.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<&'static str, Procedure>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client-callable reducer.
    pub fn reducer<A: ReducerArgs>(
        mut self,
        f: fn(&mut ReducerContext<'_>, A) -> ReducerResult,
    ) -> Self {
        let handler: Handler = Box::new(move |ctx: &mut ReducerContext<'_>, bytes: &[u8]| {
            let args: A =
                decode(bytes).map_err(|e| format!("invalid arguments for {}: {}", A::NAME, e))?;
            f(ctx, args)
        });
        self.procedures.insert(
            A::NAME,
            Procedure {
                kind: ReducerKind::User,
                handler,
            },
        );
        self
    }

    /// Register a host-invoked reducer that takes no arguments.
    pub fn lifecycle(
        mut self,
        name: &'static str,
        kind: ReducerKind,
        f: fn(&mut ReducerContext<'_>) -> ReducerResult,
    ) -> Self {
        let handler: Handler =
            Box::new(move |ctx: &mut ReducerContext<'_>, _bytes: &[u8]| f(ctx));
        self.procedures.insert(name, Procedure { kind, handler });
        self
    }

    pub fn kind(&self, name: &str) -> Option<ReducerKind> {
        self.procedures.get(name).map(|p| p.kind)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub(crate) fn invoke(
        &self,
        name: &str,
        ctx: &mut ReducerContext<'_>,
        args: &[u8],
    ) -> ReducerResult {
        match self.procedures.get(name) {
            Some(procedure) => (procedure.handler)(ctx, args),
            None => Err(format!("no such reducer: {}", name)),
        }
    }
}
