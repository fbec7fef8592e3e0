//! Thin façade over the SQL parser: statement splitting, query-type
//! classification and nothing else. The binder consumes the typed AST.

use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::QueryError;

/// Output of the parser: one or more SQL statements.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub statements: Vec<Statement>,
}

impl ParseResult {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Parse a query string with the Postgres dialect.
pub fn parse(sql: &str) -> Result<ParseResult, QueryError> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| QueryError::Parse(e.to_string()))?;
    Ok(ParseResult { statements })
}

/// Coarse statement classification driving wire-protocol dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Copy,
    CreateTable,
    CreateIndex,
    CreateDatabase,
    CreateSchema,
    DropTable,
    DropIndex,
    DropDatabase,
    DropSchema,
    Begin,
    Commit,
    Rollback,
    Set,
    Show,
    Explain,
    Empty,
    Unsupported,
}

impl QueryType {
    /// Transactional statements bypass binder, optimizer and codegen.
    pub fn is_transactional(&self) -> bool {
        matches!(self, QueryType::Begin | QueryType::Commit | QueryType::Rollback)
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            QueryType::CreateTable
                | QueryType::CreateIndex
                | QueryType::CreateDatabase
                | QueryType::CreateSchema
                | QueryType::DropTable
                | QueryType::DropIndex
                | QueryType::DropDatabase
                | QueryType::DropSchema
        )
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            QueryType::Insert | QueryType::Update | QueryType::Delete | QueryType::Copy
        )
    }

    /// Command tag reported in CommandComplete.
    pub fn command_tag(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Copy => "COPY",
            QueryType::CreateTable => "CREATE TABLE",
            QueryType::CreateIndex => "CREATE INDEX",
            QueryType::CreateDatabase => "CREATE DATABASE",
            QueryType::CreateSchema => "CREATE SCHEMA",
            QueryType::DropTable | QueryType::DropIndex | QueryType::DropSchema => "DROP",
            QueryType::DropDatabase => "DROP DATABASE",
            QueryType::Begin => "BEGIN",
            QueryType::Commit => "COMMIT",
            QueryType::Rollback => "ROLLBACK",
            QueryType::Set => "SET",
            QueryType::Show => "SHOW",
            QueryType::Explain => "EXPLAIN",
            QueryType::Empty | QueryType::Unsupported => "",
        }
    }
}

pub fn classify(statement: &Statement) -> QueryType {
    match statement {
        Statement::Query(_) => QueryType::Select,
        Statement::Insert(_) => QueryType::Insert,
        Statement::Update { .. } => QueryType::Update,
        Statement::Delete(_) => QueryType::Delete,
        Statement::Copy { .. } => QueryType::Copy,
        Statement::CreateTable(_) => QueryType::CreateTable,
        Statement::CreateIndex(_) => QueryType::CreateIndex,
        Statement::CreateDatabase { .. } => QueryType::CreateDatabase,
        Statement::CreateSchema { .. } => QueryType::CreateSchema,
        Statement::Drop { object_type, .. } => match object_type {
            sqlparser::ast::ObjectType::Table => QueryType::DropTable,
            sqlparser::ast::ObjectType::Index => QueryType::DropIndex,
            sqlparser::ast::ObjectType::Database => QueryType::DropDatabase,
            sqlparser::ast::ObjectType::Schema => QueryType::DropSchema,
            _ => QueryType::Unsupported,
        },
        Statement::StartTransaction { .. } => QueryType::Begin,
        Statement::Commit { .. } => QueryType::Commit,
        Statement::Rollback { .. } => QueryType::Rollback,
        Statement::SetVariable { .. } | Statement::SetTimeZone { .. } => QueryType::Set,
        Statement::ShowVariable { .. } => QueryType::Show,
        Statement::Explain { .. } => QueryType::Explain,
        _ => QueryType::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_statement_lists() {
        let result = parse("SELECT 1; SELECT 2;").unwrap();
        assert_eq!(result.statements.len(), 2);
    }

    #[test]
    fn classifies_common_statements() {
        let cases = [
            ("SELECT * FROM t", QueryType::Select),
            ("INSERT INTO t VALUES (1)", QueryType::Insert),
            ("UPDATE t SET a = 1", QueryType::Update),
            ("DELETE FROM t", QueryType::Delete),
            ("CREATE TABLE t (a INT)", QueryType::CreateTable),
            ("CREATE UNIQUE INDEX i ON t (a)", QueryType::CreateIndex),
            ("DROP TABLE t", QueryType::DropTable),
            ("BEGIN", QueryType::Begin),
            ("COMMIT", QueryType::Commit),
            ("ROLLBACK", QueryType::Rollback),
            ("EXPLAIN SELECT 1", QueryType::Explain),
        ];
        for (sql, expected) in cases {
            let parsed = parse(sql).unwrap();
            assert_eq!(classify(&parsed.statements[0]), expected, "{sql}");
        }
    }

    #[test]
    fn malformed_sql_is_a_parse_error() {
        let err = parse("SELEC 1").unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
        assert_eq!(err.sqlstate(), "42601");
    }
}
