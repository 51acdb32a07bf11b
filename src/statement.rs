//! Prepared statements and the per-connection statement cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::protocol::FieldDescription;
use crate::types::Oid;

/// Column descriptions shared between a prepared statement and every result
/// produced from it.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// A statement parsed by the server, executable repeatedly via Bind/Execute.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side statement name (e.g. `__pglane_3`).
    pub name: String,
    /// The SQL text.
    pub sql: String,
    /// Parameter type OIDs from ParameterDescription.
    pub param_types: Vec<Oid>,
    /// Result columns from RowDescription; empty for row-less statements.
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, sql: String) -> Self {
        Self {
            name,
            sql,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    pub fn set_columns(&mut self, columns: Vec<FieldDescription>) {
        self.columns = Arc::new(columns);
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// LRU cache of prepared statements, one per connection.
///
/// Statements are `Arc`-wrapped so a cache hit is a refcount bump, not a
/// clone of the column descriptions.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
    next_id: u32,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1")),
            next_id: 0,
        }
    }

    /// Look up by SQL text without disturbing the LRU order.
    pub fn get(&self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(sql).map(Arc::clone)
    }

    /// Look up by SQL text and mark the entry recently used.
    pub fn get_and_touch(&mut self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(sql).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, sql: &str) -> bool {
        self.cache.contains(sql)
    }

    /// Insert a statement, returning the name of the statement evicted to
    /// make room, if any.
    pub fn insert(&mut self, sql: String, statement: Arc<PreparedStatement>) -> Option<String> {
        let evicting = self.cache.len() >= self.cache.cap().get() && !self.cache.contains(&sql);
        let evicted = if evicting {
            self.cache.peek_lru().map(|(_, stmt)| stmt.name.clone())
        } else {
            None
        };
        self.cache.put(sql, statement);
        evicted
    }

    pub fn remove(&mut self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.pop(sql)
    }

    /// A statement name unique within this connection.
    pub fn next_statement_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("__pglane_{}", id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(name: &str, sql: &str) -> Arc<PreparedStatement> {
        Arc::new(PreparedStatement::new(name.to_string(), sql.to_string()))
    }

    #[test]
    fn insert_and_get() {
        let mut cache = StatementCache::new(10);
        assert!(cache.is_empty());

        cache.insert("SELECT 1".to_string(), stmt("s1", "SELECT 1"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("SELECT 1").unwrap().name, "s1");
        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn lru_eviction_reports_victim() {
        let mut cache = StatementCache::new(2);
        cache.insert("q1".to_string(), stmt("s1", "q1"));
        cache.insert("q2".to_string(), stmt("s2", "q2"));

        // touch q1 so q2 becomes the eviction candidate
        cache.get_and_touch("q1");

        let evicted = cache.insert("q3".to_string(), stmt("s3", "q3"));
        assert_eq!(evicted, Some("s2".to_string()));
        assert!(cache.get("q1").is_some());
        assert!(cache.get("q2").is_none());
        assert!(cache.get("q3").is_some());
    }

    #[test]
    fn statement_names_are_unique() {
        let mut cache = StatementCache::new(4);
        let a = cache.next_statement_name();
        let b = cache.next_statement_name();
        assert_ne!(a, b);
        assert!(a.starts_with("__pglane_"));
    }

    #[test]
    fn returns_rows_follows_columns() {
        let mut s = PreparedStatement::new("s".into(), "SELECT 1".into());
        assert!(!s.returns_rows());
        s.set_columns(vec![FieldDescription {
            name: "c".into(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: crate::protocol::Format::Binary,
        }]);
        assert!(s.returns_rows());
    }
}
