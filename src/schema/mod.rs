//! Schema registry for replicated tables and reducers.
//!
//! Tables and reducers are registered explicitly at startup. Each table is
//! a Rust type implementing [`Row`]; the registry keeps type-erased
//! constructors so the client cache and the host database can be built
//! from a table name alone.
//!
//! # Example
//!
//! ```ignore
//! let schema = SchemaRegistry::new()
//!     .with_table::<User>()
//!     .with_reducer(SetUserName::NAME, ReducerKind::User);
//!
//! assert!(schema.table("users").is_some());
//! ```

mod reducers;
mod tables;

pub use reducers::{CreateTank, SetUserName, CLIENT_CONNECTED, CLIENT_DISCONNECTED, INIT};
pub use tables::{
    Chassis, ChassisStats, Engine, EngineStats, Part, PartKind, PartStats, Tank, Turret,
    TurretStats, User,
};

use crate::cache::{AnyTableCache, TableCache};
use crate::error::Result;
use crate::host::{AnyServerTable, ServerTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// A replicated table row.
pub trait Row:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Primary key type.
    type Key: Ord + Clone + Debug + Send + Sync + 'static;

    /// Wire-visible table name.
    const TABLE: &'static str;

    /// Whether the host assigns the key on insert.
    const AUTO_INC: bool = false;

    fn primary_key(&self) -> Self::Key;

    /// The row's auto-increment key, or None while it is unassigned.
    fn auto_inc_key(&self) -> Option<u64> {
        None
    }

    /// Assign an auto-increment key. Returns false if `next` does not fit
    /// the key type.
    fn set_auto_inc(&mut self, _next: u64) -> bool {
        false
    }
}

/// Arguments of a named reducer.
pub trait ReducerArgs: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// How a reducer gets invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReducerKind {
    /// Called by the host once when the module is created.
    Init,
    /// Called by the host when a client connects.
    ClientConnected,
    /// Called by the host when a client disconnects.
    ClientDisconnected,
    /// Callable by clients.
    User,
}

/// Encode a row or reducer payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode a row or reducer payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Registered table.
pub struct TableDef {
    pub name: &'static str,
    /// Rust type name of the primary key (diagnostics only).
    pub key_type: &'static str,
    new_cache: fn() -> Box<dyn AnyTableCache>,
    new_store: fn() -> Box<dyn AnyServerTable>,
}

impl TableDef {
    pub fn of<R: Row>() -> Self {
        fn cache<R: Row>() -> Box<dyn AnyTableCache> {
            Box::new(TableCache::<R>::new())
        }
        fn store<R: Row>() -> Box<dyn AnyServerTable> {
            Box::new(ServerTable::<R>::new())
        }

        Self {
            name: R::TABLE,
            key_type: std::any::type_name::<R::Key>(),
            new_cache: cache::<R>,
            new_store: store::<R>,
        }
    }

    /// Empty client-side cache for this table.
    pub fn new_cache(&self) -> Box<dyn AnyTableCache> {
        (self.new_cache)()
    }

    /// Empty authoritative table for this table.
    pub fn new_store(&self) -> Box<dyn AnyServerTable> {
        (self.new_store)()
    }
}

impl Debug for TableDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDef")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .finish()
    }
}

/// Registered reducer.
#[derive(Clone, Debug)]
pub struct ReducerDef {
    pub name: &'static str,
    pub kind: ReducerKind,
}

/// Table and reducer definitions, built at startup.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: Vec<TableDef>,
    reducers: Vec<ReducerDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table. Re-registering a name replaces the earlier entry.
    pub fn with_table<R: Row>(mut self) -> Self {
        self.tables.retain(|t| t.name != R::TABLE);
        self.tables.push(TableDef::of::<R>());
        self
    }

    pub fn with_reducer(mut self, name: &'static str, kind: ReducerKind) -> Self {
        self.reducers.retain(|r| r.name != name);
        self.reducers.push(ReducerDef { name, kind });
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables in registration order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.iter()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.to_string()).collect()
    }

    pub fn reducer(&self, name: &str) -> Option<&ReducerDef> {
        self.reducers.iter().find(|r| r.name == name)
    }

    pub fn reducers(&self) -> impl Iterator<Item = &ReducerDef> {
        self.reducers.iter()
    }
}

/// Schema of the tank module.
pub fn registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .with_table::<User>()
        .with_table::<Turret>()
        .with_table::<Chassis>()
        .with_table::<Engine>()
        .with_table::<Tank>()
        .with_reducer(INIT, ReducerKind::Init)
        .with_reducer(CLIENT_CONNECTED, ReducerKind::ClientConnected)
        .with_reducer(CLIENT_DISCONNECTED, ReducerKind::ClientDisconnected)
        .with_reducer(SetUserName::NAME, ReducerKind::User)
        .with_reducer(CreateTank::NAME, ReducerKind::User)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Identity, Timestamp};

    #[test]
    fn test_registry_lists_module_tables_in_order() {
        let schema = registry();
        assert_eq!(
            schema.table_names(),
            vec!["users", "turrets", "chassis", "engines", "tanks"]
        );
        assert!(schema.table("nope").is_none());
    }

    #[test]
    fn test_registry_reducer_kinds() {
        let schema = registry();
        assert_eq!(
            schema.reducer("set_user_name").unwrap().kind,
            ReducerKind::User
        );
        assert_eq!(
            schema.reducer(CLIENT_CONNECTED).unwrap().kind,
            ReducerKind::ClientConnected
        );
        assert!(schema.reducer("send_message").is_none());
    }

    #[test]
    fn test_reregistering_replaces() {
        let schema = SchemaRegistry::new()
            .with_table::<User>()
            .with_table::<User>()
            .with_reducer("x", ReducerKind::User)
            .with_reducer("x", ReducerKind::Init);
        assert_eq!(schema.tables().count(), 1);
        assert_eq!(schema.reducer("x").unwrap().kind, ReducerKind::Init);
    }

    #[test]
    fn test_row_codec() {
        let user = User {
            identity: Identity::from_token("t"),
            name: None,
            online: true,
            last_seen: Timestamp(7),
        };
        let bytes = encode(&user).unwrap();
        let back: User = decode(&bytes).unwrap();
        assert_eq!(back, user);
        assert!(decode::<User>(b"\x01\x02").is_err());
    }
}
