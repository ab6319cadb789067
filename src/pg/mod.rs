//! PostgreSQL wire-protocol client core.
//!
//! This module provides a client session that:
//! - Speaks protocol v3 with binary parameters and results where the type allows
//! - Rewrites `?` placeholders and `{fn ...}` escapes into native SQL
//! - Caches parsed text, statement descriptions and prepared statements
//! - Streams large results through suspended portals
//! - Maps `{call ...}` procedure parameters onto function arguments and outputs
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `session`: Startup, framing, transactions, notifications and close
//! - `engine`: Describe/prepare/bind/execute/fetch over `Session`
//! - `types`, `registry`, `catalog`, `codec`, `coerce`: the type graph and value conversion
//! - `sql_text`, `escapes`: SQL text model and rewriter
//! - `cache`, `statement`, `portal`: statement and portal state
//! - `callable`: procedure call parameter mapping

pub mod cache;
pub mod callable;
pub mod catalog;
pub mod codec;
pub mod coerce;
pub mod config;
pub mod engine;
pub mod error;
pub mod escapes;
pub mod notify;
pub mod portal;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sql_text;
pub mod statement;
pub mod types;

#[cfg(test)]
mod mock_server;

pub use callable::{CallableStatement, ParameterMapper, ParameterMode};
pub use coerce::{CompositeMappings, FromValue, ToValue};
pub use config::PgConfig;
pub use engine::{FetchDirection, ServerCursor};
pub use error::{ErrorClass, PgError, PgResult};
pub use notify::{ListenerError, Notification};
pub use portal::{CursorOptions, ResultBatch, ResultCursor, Row};
pub use protocol::{Notice, TransactionStatus};
pub use registry::{Registry, SharedRegistry, Type};
pub use session::{CancelKey, ServerVersion, Session, Transport};
pub use sql_text::SqlText;
pub use statement::{ColumnDesc, StatementCacheKey, StatementId};
pub use types::{Interval, Kind, Oid, PgArray, PgValue, Record};
