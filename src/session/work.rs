//! Work submitted to a session.

use std::io;

use bytes::Bytes;
use futures::stream::BoxStream;
use smallvec::{smallvec, SmallVec};

use crate::error::Error;
use crate::types::PgValue;

use super::sink::ResultSink;

/// SQL to run as one unit of work. Almost always a single statement, but
/// several statements can be combined and executed in submission order as a
/// single simple-protocol batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    statements: SmallVec<[String; 1]>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            statements: smallvec![sql.into()],
        }
    }

    /// Combine several queries into one batch.
    pub fn combine(queries: impl IntoIterator<Item = Query>) -> Self {
        Self {
            statements: queries
                .into_iter()
                .flat_map(|q| q.statements)
                .collect(),
        }
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// The statement at `index`, if present.
    pub fn statement(&self, index: usize) -> Option<&str> {
        self.statements.get(index).map(String::as_str)
    }

    /// The only statement of a non-batch query.
    pub fn as_single(&self) -> Option<&str> {
        match self.statements.as_slice() {
            [sql] => Some(sql),
            _ => None,
        }
    }

    /// All statements joined for the simple query protocol.
    pub fn joined(&self) -> String {
        self.statements.join("; ")
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::new(sql)
    }
}

/// The payload of a COPY submission.
pub enum CopySource {
    /// A fully buffered payload, streamed to the server in chunks.
    Buffered(Bytes),
    /// A lazy sequence of buffers. Each buffer is written out completely and
    /// dropped before the next one is requested.
    Streaming(BoxStream<'static, io::Result<Bytes>>),
}

impl std::fmt::Debug for CopySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopySource::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            CopySource::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

/// One entry in the session's work queue.
pub(crate) enum WorkItem {
    /// Graceful termination request.
    Poison,
    /// Roll back whatever is open, then terminate.
    Rollback,
    /// Ordinary statement execution.
    Query {
        query: Query,
        params: Vec<PgValue>,
        sink: ResultSink,
    },
    /// Bulk COPY FROM STDIN ingest.
    Copy {
        sql: String,
        source: CopySource,
        sink: ResultSink,
    },
}

impl WorkItem {
    /// Variant name for logging.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            WorkItem::Poison => "poison",
            WorkItem::Rollback => "rollback",
            WorkItem::Query { .. } => "query",
            WorkItem::Copy { .. } => "copy",
        }
    }

    /// Deliver `err` to the item's sink, if it has one. Used when the
    /// session terminates with work still queued.
    pub(crate) fn fail(self, err: Error) {
        match self {
            WorkItem::Poison | WorkItem::Rollback => {}
            WorkItem::Query { sink, .. } | WorkItem::Copy { sink, .. } => sink.error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_statement_query() {
        let q = Query::new("SELECT 1");
        assert_eq!(q.as_single(), Some("SELECT 1"));
        assert_eq!(q.statement(0), Some("SELECT 1"));
        assert_eq!(q.statement(1), None);
    }

    #[test]
    fn combined_queries_keep_order() {
        let q = Query::combine([Query::new("SELECT 1"), Query::new("SELECT 2")]);
        assert_eq!(q.as_single(), None);
        assert_eq!(q.statements().len(), 2);
        assert_eq!(q.joined(), "SELECT 1; SELECT 2");
    }

    #[test]
    fn copy_source_debug_hides_stream_internals() {
        let buffered = CopySource::Buffered(Bytes::from_static(b"abcd"));
        assert_eq!(format!("{:?}", buffered), "Buffered(4 bytes)");
    }
}
