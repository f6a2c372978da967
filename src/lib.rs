//! # tablesync
//!
//! Replicated tables with reducer-style procedures. A host owns the
//! authoritative tables and runs named reducers as atomic transactions;
//! clients subscribe, mirror the tables in a local cache, and observe every
//! change through ordered callbacks.
//!
//! ## Core Concepts
//!
//! - **Schema**: tables and reducers registered explicitly at startup
//! - **Host**: transactions, lifecycle reducers, per-session outcome routing
//! - **Cache**: the client's mirror, fed by a snapshot and then ordered diffs
//! - **Processing loop**: pumps the connection and drains the command queue
//!
//! ## Example
//!
//! ```ignore
//! use tablesync::{command_queue, CancellationToken, DbConnection, Host, HostConfig, ProcessingLoop};
//!
//! let host = Host::tank(&HostConfig::default());
//! let conn = DbConnection::builder()
//!     .with_module_name(host.module_name())
//!     .on_connect(|conn, _identity, _token| {
//!         let _ = conn.subscription_builder().subscribe_to_all_tables();
//!     })
//!     .build_with(&host)?;
//!
//! let (commands, queue) = command_queue();
//! let cancel = CancellationToken::new();
//! let worker = ProcessingLoop::new(conn, queue, cancel.clone(), Duration::from_millis(100)).spawn()?;
//!
//! commands.enqueue(Command::new("name", "Alice"));
//! cancel.cancel();
//! worker.join();
//! ```

pub mod cache;
pub mod client;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod error;
pub mod host;
pub mod processing;
pub mod protocol;
pub mod schema;
pub mod transport;
pub mod types;

// Re-exports
pub use cache::{ClientCache, RowDiff, TableCache};
pub use client::{
    CallbackId, ConnectionContext, DbConnection, DbConnectionBuilder, Event, EventContext,
    ReducerEvent, ReducerEventContext, SubscriptionState,
};
pub use commands::{command_queue, parse_input_line, Command, CommandReceiver, CommandSender};
pub use config::{ClientConfig, HostConfig};
pub use credentials::CredentialStore;
pub use error::{Result, SyncError};
pub use host::{Host, ReducerContext, ReducerResult};
pub use processing::{LoopExit, ProcessingLoop};
pub use schema::{registry, ReducerArgs, ReducerKind, Row, SchemaRegistry};
pub use transport::{Connector, Transport, TransportEvent};
pub use types::*;
