//! A pooled PostgreSQL client built around seized-connection sessions.
//!
//! Architecture:
//! - `protocol`: wire protocol encoding/decoding, including COPY
//! - `connection`: connection state machine and the execute primitive
//! - `types`: PostgreSQL value encoding/decoding
//! - `statement`: prepared statement cache
//! - `pool`: bounded connection pool
//! - `session`: the session execution engine over a seized connection
//! - `sqlwriter`: SQL text generation
//!
//! A session binds one physical connection to one consumer task for its
//! whole lifetime. Producers submit work from any task and read results
//! from per-submission streams:
//!
//! ```no_run
//! use futures::StreamExt;
//! use pglane::{PgConfig, PgPool, PoolOptions};
//!
//! # async fn demo() -> Result<(), pglane::Error> {
//! let pool = PgPool::connect(PoolOptions::new(
//!     PgConfig::new("app", "appdb").password("secret"),
//! ))
//! .await?;
//!
//! let session = pool.session().await?;
//! let mut rows = session.submit("SELECT 1", Vec::new())?;
//! while let Some(event) = rows.next().await {
//!     println!("{:?}", event?);
//! }
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
mod scram;
pub mod session;
pub mod sqlwriter;
pub mod statement;
pub mod types;

pub use connection::{PgConfig, PgConnection};
pub use error::{Error, Result, ServerError};
pub use pool::{PgPool, PooledConnection, PoolOptions};
pub use protocol::TransactionStatus;
pub use session::{
    CommandStatus, CopyRows, CopySource, ExecuteFlags, NotifyMessage, NotifyStream, PgSession,
    Query, QueryEvent, QueryStream, ResultSink, SessionConnection, SessionTxnState,
    BINARY_PREAMBLE,
};
pub use statement::{PreparedStatement, SharedColumns, StatementCache};
pub use types::{Oid, PgValue};
