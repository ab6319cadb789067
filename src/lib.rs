//! pgwire-core - a PostgreSQL wire-protocol client core.
//!
//! A [`Session`] owns one server connection. Statements go through the
//! extended query protocol with described and prepared statements cached
//! per session; the type registry and parsed SQL cache are shared.
//!
//! ```no_run
//! use pgwire_core::{PgValue, Session};
//!
//! # async fn run() -> pgwire_core::PgResult<()> {
//! let mut session = Session::connect("postgresql://postgres@localhost/postgres").await?;
//! let batch = session
//!     .query("SELECT ?::int + ?::int", &[PgValue::Int4(2), PgValue::Int4(3)])
//!     .await?;
//! let sum: i32 = batch.rows[0].get(0)?;
//! assert_eq!(sum, 5);
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod pg;

pub use pg::{
    CallableStatement, ColumnDesc, CursorOptions, FetchDirection, FromValue, Notification,
    PgConfig, PgError, PgResult, PgValue, ResultBatch, ResultCursor, Row, ServerCursor, Session,
    SqlText, StatementCacheKey, StatementId, ToValue, TransactionStatus, Type,
};
