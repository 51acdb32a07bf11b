//! SQL text generation.
//!
//! A small writer over keywords, identifiers and expressions, used by the
//! session layer for LISTEN/NOTIFY statements and available to callers for
//! DDL. Generators are stateless: anything implementing [`SqlGenerator`]
//! (including closures) can be rendered to a string or a [`Query`].

use std::fmt::Write as _;

use smallvec::SmallVec;

use crate::session::Query;

/// SQL keywords known to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlKeyword {
    Create,
    Table,
    If,
    Not,
    Exists,
    Unlogged,
    Local,
    Temp,
    Of,
    Like,
    With,
    On,
    Commit,
    Drop,
    Listen,
    Unlisten,
    Notify,
    Null,
    Default,
}

impl SqlKeyword {
    pub fn as_str(self) -> &'static str {
        match self {
            SqlKeyword::Create => "CREATE",
            SqlKeyword::Table => "TABLE",
            SqlKeyword::If => "IF",
            SqlKeyword::Not => "NOT",
            SqlKeyword::Exists => "EXISTS",
            SqlKeyword::Unlogged => "UNLOGGED",
            SqlKeyword::Local => "LOCAL",
            SqlKeyword::Temp => "TEMP",
            SqlKeyword::Of => "OF",
            SqlKeyword::Like => "LIKE",
            SqlKeyword::With => "WITH",
            SqlKeyword::On => "ON",
            SqlKeyword::Commit => "COMMIT",
            SqlKeyword::Drop => "DROP",
            SqlKeyword::Listen => "LISTEN",
            SqlKeyword::Unlisten => "UNLISTEN",
            SqlKeyword::Notify => "NOTIFY",
            SqlKeyword::Null => "NULL",
            SqlKeyword::Default => "DEFAULT",
        }
    }
}

/// A possibly qualified database identifier, quoted on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbIdent {
    parts: SmallVec<[String; 2]>,
}

impl DbIdent {
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            parts: SmallVec::from_iter([name.into()]),
        }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parts: SmallVec::from_iter([schema.into(), name.into()]),
        }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    fn render(&self, out: &mut String) {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            if needs_quoting(part) {
                out.push('"');
                for ch in part.chars() {
                    if ch == '"' {
                        out.push('"');
                    }
                    out.push(ch);
                }
                out.push('"');
            } else {
                out.push_str(part);
            }
        }
    }
}

fn needs_quoting(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return true,
    }
    !ident
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Anything that can emit SQL through a writer.
pub trait SqlGenerator {
    fn write_sql(&self, w: &mut SqlWriter);
}

impl<F: Fn(&mut SqlWriter)> SqlGenerator for F {
    fn write_sql(&self, w: &mut SqlWriter) {
        self(w)
    }
}

/// The stateless SQL emitter.
#[derive(Debug, Default)]
pub struct SqlWriter {
    buf: String,
}

impl SqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render a generator to a SQL string.
    pub fn render(gen: &impl SqlGenerator) -> String {
        let mut w = SqlWriter::new();
        gen.write_sql(&mut w);
        w.finish()
    }

    pub fn finish(self) -> String {
        self.buf
    }

    fn pad(&mut self) {
        match self.buf.chars().last() {
            None | Some('(') | Some('\n') => {}
            _ => self.buf.push(' '),
        }
    }

    pub fn write_keyword(&mut self, keyword: SqlKeyword) {
        self.pad();
        self.buf.push_str(keyword.as_str());
    }

    pub fn write_keywords(&mut self, keywords: &[SqlKeyword]) {
        for k in keywords {
            self.write_keyword(*k);
        }
    }

    pub fn write_ident(&mut self, ident: &DbIdent) {
        self.pad();
        ident.render(&mut self.buf);
    }

    /// A raw token, padded like any other.
    pub fn write_raw(&mut self, raw: &str) {
        self.pad();
        self.buf.push_str(raw);
    }

    /// An operator, attached without leading padding.
    pub fn write_operator(&mut self, op: &str) {
        self.buf.push_str(op);
    }

    /// A single-quoted string literal.
    pub fn write_literal(&mut self, value: &str) {
        self.pad();
        self.buf.push('\'');
        for ch in value.chars() {
            if ch == '\'' {
                self.buf.push('\'');
            }
            self.buf.push(ch);
        }
        self.buf.push('\'');
    }

    pub fn write_start_expr(&mut self) {
        self.pad();
        self.buf.push('(');
    }

    pub fn write_end_expr(&mut self) {
        self.buf.push(')');
    }

    pub fn write_comma(&mut self) {
        self.buf.push(',');
    }

    pub fn write_newline(&mut self) {
        self.buf.push('\n');
    }

    /// Emit a comma-separated list of generators.
    pub fn write_list<G: SqlGenerator>(&mut self, items: &[G]) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.write_comma();
            }
            item.write_sql(self);
        }
    }
}

fn query_of(gen: impl SqlGenerator) -> Query {
    Query::new(SqlWriter::render(&gen))
}

/// `LISTEN <channel>`.
pub fn listen(channel: &str) -> Query {
    let ident = DbIdent::simple(channel);
    query_of(move |w: &mut SqlWriter| {
        w.write_keyword(SqlKeyword::Listen);
        w.write_ident(&ident);
    })
}

/// `UNLISTEN <channel>`.
pub fn unlisten(channel: &str) -> Query {
    let ident = DbIdent::simple(channel);
    query_of(move |w: &mut SqlWriter| {
        w.write_keyword(SqlKeyword::Unlisten);
        w.write_ident(&ident);
    })
}

/// `NOTIFY <channel>[, '<payload>']`.
pub fn notify(channel: &str, payload: Option<&str>) -> Query {
    let ident = DbIdent::simple(channel);
    let payload = payload.map(str::to_owned);
    query_of(move |w: &mut SqlWriter| {
        w.write_keyword(SqlKeyword::Notify);
        w.write_ident(&ident);
        if let Some(p) = &payload {
            w.write_comma();
            w.write_literal(p);
        }
    })
}

// ============================================================================
// CREATE TABLE builder
// ============================================================================

#[derive(Debug, Clone)]
struct ColumnDef {
    name: DbIdent,
    sql_type: String,
    not_null: bool,
    default: Option<String>,
}

/// Builder for CREATE TABLE statements.
#[derive(Debug, Clone)]
pub struct TableBuilder {
    name: DbIdent,
    of_type: Option<DbIdent>,
    like: Option<DbIdent>,
    columns: Vec<ColumnDef>,
    storage_parameters: Vec<(String, String)>,
    if_not_exists: bool,
    unlogged: bool,
    drop_on_commit: bool,
}

impl TableBuilder {
    pub fn new(name: DbIdent) -> Self {
        Self {
            name,
            of_type: None,
            like: None,
            columns: Vec::new(),
            storage_parameters: Vec::new(),
            if_not_exists: true,
            unlogged: false,
            drop_on_commit: false,
        }
    }

    pub fn of_type(mut self, ident: DbIdent) -> Self {
        self.of_type = Some(ident);
        self
    }

    pub fn like(mut self, ident: DbIdent) -> Self {
        self.like = Some(ident);
        self
    }

    pub fn column(mut self, name: &str, sql_type: &str) -> Self {
        self.columns.push(ColumnDef {
            name: DbIdent::simple(name),
            sql_type: sql_type.to_string(),
            not_null: false,
            default: None,
        });
        self
    }

    /// Add a column with NOT NULL and an optional default expression.
    pub fn required_column(mut self, name: &str, sql_type: &str, default: Option<&str>) -> Self {
        self.columns.push(ColumnDef {
            name: DbIdent::simple(name),
            sql_type: sql_type.to_string(),
            not_null: true,
            default: default.map(str::to_owned),
        });
        self
    }

    pub fn text_column(self, name: &str) -> Self {
        self.column(name, "text")
    }

    pub fn int_column(self, name: &str) -> Self {
        self.column(name, "int")
    }

    pub fn bool_column(self, name: &str) -> Self {
        self.column(name, "bool")
    }

    pub fn jsonb_column(self, name: &str) -> Self {
        self.column(name, "jsonb")
    }

    pub fn timestamptz_column(self, name: &str) -> Self {
        self.column(name, "timestamptz")
    }

    pub fn if_not_exists(mut self, yes: bool) -> Self {
        self.if_not_exists = yes;
        self
    }

    pub fn unlogged(mut self) -> Self {
        self.unlogged = true;
        self
    }

    /// A local temporary table dropped at commit.
    pub fn temporary(mut self) -> Self {
        self.drop_on_commit = true;
        self
    }

    pub fn storage_parameter(mut self, key: &str, value: &str) -> Self {
        self.storage_parameters
            .push((key.to_string(), value.to_string()));
        self
    }

    pub fn to_sql(&self) -> String {
        SqlWriter::render(self)
    }

    pub fn to_query(&self) -> Query {
        Query::new(self.to_sql())
    }
}

impl SqlGenerator for TableBuilder {
    fn write_sql(&self, w: &mut SqlWriter) {
        w.write_keyword(SqlKeyword::Create);
        if self.unlogged {
            w.write_keyword(SqlKeyword::Unlogged);
        } else if self.drop_on_commit {
            w.write_keywords(&[SqlKeyword::Local, SqlKeyword::Temp]);
        }
        w.write_keyword(SqlKeyword::Table);
        if self.if_not_exists {
            w.write_keywords(&[SqlKeyword::If, SqlKeyword::Not, SqlKeyword::Exists]);
        }
        w.write_ident(&self.name);

        if let Some(of_type) = &self.of_type {
            w.write_keyword(SqlKeyword::Of);
            w.write_ident(of_type);
        }

        w.write_start_expr();
        let mut first = true;
        if let Some(like) = &self.like {
            w.write_keyword(SqlKeyword::Like);
            w.write_ident(like);
            first = false;
        }
        for column in &self.columns {
            if !first {
                w.write_comma();
            }
            first = false;
            w.write_ident(&column.name);
            w.write_raw(&column.sql_type);
            if column.not_null {
                w.write_keywords(&[SqlKeyword::Not, SqlKeyword::Null]);
            }
            if let Some(default) = &column.default {
                w.write_keyword(SqlKeyword::Default);
                w.write_raw(default);
            }
        }
        w.write_end_expr();

        if !self.storage_parameters.is_empty() {
            w.write_keyword(SqlKeyword::With);
            w.write_start_expr();
            for (i, (key, value)) in self.storage_parameters.iter().enumerate() {
                if i > 0 {
                    w.write_comma();
                }
                w.write_raw(key);
                w.write_operator("=");
                let _ = write!(w.buf, "{}", value);
            }
            w.write_end_expr();
        }

        if self.drop_on_commit {
            w.write_keywords(&[SqlKeyword::On, SqlKeyword::Commit, SqlKeyword::Drop]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_statement() {
        assert_eq!(listen("events").statement(0), Some("LISTEN events"));
    }

    #[test]
    fn listen_quotes_unsafe_channel_names() {
        assert_eq!(
            listen("Camel Case").statement(0),
            Some("LISTEN \"Camel Case\"")
        );
    }

    #[test]
    fn notify_with_payload() {
        assert_eq!(
            notify("events", Some("it's done")).statement(0),
            Some("NOTIFY events, 'it''s done'")
        );
        assert_eq!(notify("events", None).statement(0), Some("NOTIFY events"));
    }

    #[test]
    fn unlisten_statement() {
        assert_eq!(unlisten("events").statement(0), Some("UNLISTEN events"));
    }

    #[test]
    fn create_table_basic() {
        let sql = TableBuilder::new(DbIdent::simple("logs"))
            .text_column("message")
            .timestamptz_column("at")
            .to_sql();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS logs (message text, at timestamptz)"
        );
    }

    #[test]
    fn create_unlogged_table_with_storage_parameters() {
        let sql = TableBuilder::new(DbIdent::qualified("staging", "rows"))
            .unlogged()
            .if_not_exists(false)
            .jsonb_column("doc")
            .storage_parameter("fillfactor", "70")
            .to_sql();
        assert_eq!(
            sql,
            "CREATE UNLOGGED TABLE staging.rows (doc jsonb) WITH (fillfactor=70)"
        );
    }

    #[test]
    fn create_temp_table_drops_on_commit() {
        let sql = TableBuilder::new(DbIdent::simple("scratch"))
            .temporary()
            .int_column("n")
            .to_sql();
        assert_eq!(
            sql,
            "CREATE LOCAL TEMP TABLE IF NOT EXISTS scratch (n int) ON COMMIT DROP"
        );
    }

    #[test]
    fn required_column_with_default() {
        let sql = TableBuilder::new(DbIdent::simple("t"))
            .required_column("id", "bigint", Some("0"))
            .to_sql();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS t (id bigint NOT NULL DEFAULT 0)"
        );
    }

    #[test]
    fn like_clause_comes_first() {
        let sql = TableBuilder::new(DbIdent::simple("copy"))
            .like(DbIdent::simple("original"))
            .text_column("extra")
            .to_sql();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS copy (LIKE original, extra text)"
        );
    }

    #[test]
    fn ident_quoting() {
        let mut out = String::new();
        DbIdent::simple("select").render(&mut out);
        assert_eq!(out, "select"); // keywords are the caller's problem

        let mut out = String::new();
        DbIdent::simple("weird\"name").render(&mut out);
        assert_eq!(out, "\"weird\"\"name\"");
    }
}
