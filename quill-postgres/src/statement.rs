//! Prepared statements and the per-connection statement cache.
//!
//! A `Statement` owns the original query text and the parser output, and
//! caches the bound plan and the compiled executable for reuse across
//! bindings of the same fingerprint. Any DDL that moves the database's DDL
//! epoch invalidates the cached plan and executable but keeps the parse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quill_engine::binder::statement::BoundStatement;
use quill_engine::exec::ExecutableQuery;
use quill_engine::plan::PhysicalPlan;
use quill_engine::{ParseResult, QueryType};
use quill_storage::SqlTypeId;

/// Compiled artifacts cached on a statement, valid for one DDL epoch.
#[derive(Default)]
pub(crate) struct CachedPlan {
    pub ddl_epoch: u64,
    pub bound: Option<Arc<BoundStatement>>,
    pub physical: Option<Arc<PhysicalPlan>>,
    pub executable: Option<Arc<ExecutableQuery>>,
    pub desired_param_types: Vec<SqlTypeId>,
    pub output_schema: Vec<(String, SqlTypeId)>,
    pub visible_columns: usize,
}

pub struct Statement {
    query_text: String,
    parse_result: ParseResult,
    query_type: QueryType,
    param_types: Vec<SqlTypeId>,
    pub(crate) cached: Mutex<CachedPlan>,
}

impl Statement {
    pub fn new(
        query_text: String,
        parse_result: ParseResult,
        query_type: QueryType,
        param_types: Vec<SqlTypeId>,
    ) -> Self {
        Statement {
            query_text,
            parse_result,
            query_type,
            param_types,
            cached: Mutex::new(CachedPlan::default()),
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    pub fn parse_result(&self) -> &ParseResult {
        &self.parse_result
    }

    pub fn root_statement(&self) -> Option<&sqlparser::ast::Statement> {
        self.parse_result.statements.first()
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn is_empty(&self) -> bool {
        self.parse_result.is_empty()
    }

    /// Parameter types declared by the client at Parse time.
    pub fn param_types(&self) -> &[SqlTypeId] {
        &self.param_types
    }

    /// Parameter types the binder resolved; falls back to the declared
    /// types before the first bind.
    pub fn desired_param_types(&self) -> Vec<SqlTypeId> {
        let cached = self.cached.lock().unwrap();
        if cached.desired_param_types.is_empty() {
            self.param_types.clone()
        } else {
            cached.desired_param_types.clone()
        }
    }

    pub fn output_schema(&self) -> Vec<(String, SqlTypeId)> {
        self.cached.lock().unwrap().output_schema.clone()
    }

    /// Drop the cached plan and executable, keeping the parse result. Called
    /// when DDL invalidates objects the plan references.
    pub fn clear_cached_objects(&self) {
        let mut cached = self.cached.lock().unwrap();
        cached.bound = None;
        cached.physical = None;
        cached.executable = None;
        cached.desired_param_types.clear();
    }

    /// True when a compiled plan valid at `epoch` is cached.
    pub fn has_plan_for_epoch(&self, epoch: u64) -> bool {
        self.cached_executable(epoch).is_some()
    }

    pub(crate) fn cached_executable(&self, current_epoch: u64) -> Option<Arc<ExecutableQuery>> {
        let cached = self.cached.lock().unwrap();
        if cached.ddl_epoch == current_epoch {
            cached.executable.clone()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("query_text", &self.query_text)
            .field("query_type", &self.query_type)
            .finish()
    }
}

const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Per-connection map from query text to prepared statement, with
/// least-recently-used eviction at a small bounded capacity.
pub struct StatementCache {
    capacity: usize,
    entries: HashMap<String, Arc<Statement>>,
    // Most recently used last.
    order: Vec<String>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        StatementCache {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup by exact (bitwise) query text.
    pub fn get(&mut self, query_text: &str) -> Option<Arc<Statement>> {
        let statement = self.entries.get(query_text).cloned()?;
        self.touch(query_text);
        Some(statement)
    }

    pub fn insert(&mut self, statement: Arc<Statement>) {
        let key = statement.query_text().to_string();
        if self.entries.insert(key.clone(), statement).is_none()
            && self.entries.len() > self.capacity
        {
            if let Some(evicted) = self.order.first().cloned() {
                self.entries.remove(&evicted);
                self.order.remove(0);
            }
        }
        self.touch(&key);
    }

    fn touch(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
        self.order.push(key.to_string());
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_engine::parse;

    fn statement(text: &str) -> Arc<Statement> {
        let parsed = parse(text).unwrap();
        let query_type = quill_engine::classify(&parsed.statements[0]);
        Arc::new(Statement::new(
            text.to_string(),
            parsed,
            query_type,
            Vec::new(),
        ))
    }

    #[test]
    fn cache_is_keyed_bitwise_on_query_text() {
        let mut cache = StatementCache::new();
        cache.insert(statement("SELECT 1"));
        assert!(cache.get("SELECT 1").is_some());
        // Different byte sequence, different entry.
        assert!(cache.get("select 1").is_none());
    }

    #[test]
    fn eviction_is_lru_at_capacity() {
        let mut cache = StatementCache::with_capacity(2);
        cache.insert(statement("SELECT 1"));
        cache.insert(statement("SELECT 2"));
        // Touch the first so the second becomes the eviction victim.
        cache.get("SELECT 1");
        cache.insert(statement("SELECT 3"));
        assert!(cache.get("SELECT 1").is_some());
        assert!(cache.get("SELECT 2").is_none());
        assert!(cache.get("SELECT 3").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clearing_cached_objects_keeps_the_parse() {
        let stmt = statement("SELECT 1");
        {
            let mut cached = stmt.cached.lock().unwrap();
            cached.ddl_epoch = 1;
            cached.desired_param_types = vec![quill_storage::SqlTypeId::Integer];
        }
        stmt.clear_cached_objects();
        assert!(stmt.cached_executable(1).is_none());
        assert!(stmt.desired_param_types().is_empty());
        assert!(!stmt.parse_result().is_empty());
    }
}
