//! Typed reducer stubs for the tank module.

use super::context::ReducerEventContext;
use super::{CallbackId, DbConnection};
use crate::error::Result;
use crate::schema::{CreateTank, SetUserName};
use crate::types::RequestId;

impl DbConnection {
    /// Request a rename of this client's user.
    pub fn set_user_name(&mut self, name: impl Into<String>) -> Result<RequestId> {
        self.call_reducer(&SetUserName { name: name.into() })
    }

    pub fn create_tank(&mut self, chassis_id: u32, turret_id: u32, engine_id: u32) -> Result<RequestId> {
        self.call_reducer(&CreateTank {
            chassis_id,
            turret_id,
            engine_id,
        })
    }

    /// Runs for every `set_user_name` outcome, from any caller.
    pub fn on_set_user_name(
        &mut self,
        mut f: impl FnMut(&ReducerEventContext<'_>, &str) + Send + 'static,
    ) -> CallbackId {
        self.on_reducer::<SetUserName>(move |ctx, args| f(ctx, &args.name))
    }

    pub fn on_create_tank(
        &mut self,
        f: impl FnMut(&ReducerEventContext<'_>, &CreateTank) + Send + 'static,
    ) -> CallbackId {
        self.on_reducer::<CreateTank>(f)
    }
}
