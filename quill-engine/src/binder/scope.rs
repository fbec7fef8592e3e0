//! Lexical scopes for name resolution. The binder pushes a scope per SELECT
//! nesting level; column references resolve against the innermost scope
//! first and record the depth of the scope they resolved at.

use std::sync::Arc;

use quill_catalog::{DatabaseOid, Schema, TableOid};
use quill_storage::SqlTypeId;

use crate::binder::expr::{BoundExpr, ColumnValueExpr};
use crate::error::BinderError;

/// What a table alias in a scope resolves to.
#[derive(Debug, Clone)]
pub enum ScopeTarget {
    /// A base table in the catalog.
    Base {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        schema: Arc<Schema>,
    },
    /// A derived table: subquery in FROM or a CTE reference. Columns are
    /// virtual, identified by name and type only.
    Derived { columns: Vec<(String, SqlTypeId)> },
}

#[derive(Debug, Clone)]
pub struct ScopeTableRef {
    pub alias: String,
    pub target: ScopeTarget,
}

#[derive(Debug)]
pub struct LexicalScope {
    pub id: usize,
    pub depth: u32,
    pub table_refs: Vec<ScopeTableRef>,
}

impl LexicalScope {
    fn find_alias(&self, alias: &str) -> Option<&ScopeTableRef> {
        self.table_refs
            .iter()
            .find(|r| r.alias.eq_ignore_ascii_case(alias))
    }
}

/// The binder's scope stack.
#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<LexicalScope>,
    next_id: usize,
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            scopes: Vec::new(),
            next_id: 0,
        }
    }

    pub fn push(&mut self) -> u32 {
        let depth = self.scopes.len() as u32;
        self.scopes.push(LexicalScope {
            id: self.next_id,
            depth,
            table_refs: Vec::new(),
        });
        self.next_id += 1;
        depth
    }

    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    pub fn current_depth(&self) -> u32 {
        self.scopes.len().saturating_sub(1) as u32
    }

    /// Register an alias in the current scope. Duplicate aliases at the same
    /// level are an error.
    pub fn add_table_ref(
        &mut self,
        alias: String,
        target: ScopeTarget,
    ) -> Result<(), BinderError> {
        let scope = self
            .scopes
            .last_mut()
            .expect("add_table_ref outside any scope");
        if scope.find_alias(&alias).is_some() {
            return Err(BinderError::DuplicateAlias(alias));
        }
        scope.table_refs.push(ScopeTableRef { alias, target });
        Ok(())
    }

    /// Resolve `alias.column` or a bare `column` against the scope stack,
    /// innermost first.
    pub fn resolve_column(
        &self,
        alias: Option<&str>,
        column: &str,
    ) -> Result<BoundExpr, BinderError> {
        for scope in self.scopes.iter().rev() {
            let mut found: Option<ColumnValueExpr> = None;
            for table_ref in &scope.table_refs {
                if let Some(alias) = alias {
                    if !table_ref.alias.eq_ignore_ascii_case(alias) {
                        continue;
                    }
                }
                if let Some(resolved) = Self::resolve_in_target(table_ref, column, scope.depth) {
                    if found.is_some() {
                        return Err(BinderError::AmbiguousColumn(column.to_string()));
                    }
                    found = Some(resolved);
                }
            }
            if let Some(resolved) = found {
                return Ok(BoundExpr::ColumnValue(resolved));
            }
            // A qualified reference whose alias exists at this level but has
            // no such column should not leak to the outer scope.
            if let Some(alias) = alias {
                if scope.find_alias(alias).is_some() {
                    return Err(BinderError::UnknownColumn(format!("{alias}.{column}")));
                }
            }
        }
        match alias {
            Some(alias) => Err(BinderError::UnknownTable(alias.to_string())),
            None => Err(BinderError::UnknownColumn(column.to_string())),
        }
    }

    fn resolve_in_target(
        table_ref: &ScopeTableRef,
        column: &str,
        depth: u32,
    ) -> Option<ColumnValueExpr> {
        match &table_ref.target {
            ScopeTarget::Base {
                db_oid,
                table_oid,
                schema,
            } => schema.find_column(column).map(|(_, col)| ColumnValueExpr {
                db_oid: *db_oid,
                table_oid: *table_oid,
                column_oid: col.oid(),
                type_id: col.type_id(),
                depth,
                table_alias: table_ref.alias.clone(),
                column_name: col.name().to_string(),
            }),
            ScopeTarget::Derived { columns } => columns
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(column))
                .map(|(name, type_id)| ColumnValueExpr {
                    db_oid: DatabaseOid::INVALID,
                    table_oid: TableOid::INVALID,
                    column_oid: quill_catalog::ColumnOid::INVALID,
                    type_id: *type_id,
                    depth,
                    table_alias: table_ref.alias.clone(),
                    column_name: name.clone(),
                }),
        }
    }

    /// Every `(alias, column, type)` visible in the current scope, in
    /// declaration order; drives `*` expansion.
    pub fn visible_columns(&self) -> Vec<(String, String, SqlTypeId)> {
        let mut out = Vec::new();
        if let Some(scope) = self.scopes.last() {
            for table_ref in &scope.table_refs {
                match &table_ref.target {
                    ScopeTarget::Base { schema, .. } => {
                        for col in schema.columns() {
                            out.push((
                                table_ref.alias.clone(),
                                col.name().to_string(),
                                col.type_id(),
                            ));
                        }
                    }
                    ScopeTarget::Derived { columns } => {
                        for (name, type_id) in columns {
                            out.push((table_ref.alias.clone(), name.clone(), *type_id));
                        }
                    }
                }
            }
        }
        out
    }

    /// `*` expansion restricted to one alias.
    pub fn visible_columns_of(&self, alias: &str) -> Vec<(String, String, SqlTypeId)> {
        self.visible_columns()
            .into_iter()
            .filter(|(a, _, _)| a.eq_ignore_ascii_case(alias))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_catalog::Column;

    fn base_target() -> ScopeTarget {
        let schema = Schema::new(vec![
            Column::new("a1", SqlTypeId::Integer, false),
            Column::new("a2", SqlTypeId::Varchar, true),
        ]);
        ScopeTarget::Base {
            db_oid: DatabaseOid(1),
            table_oid: TableOid(10),
            schema: Arc::new(schema),
        }
    }

    #[test]
    fn duplicate_alias_in_one_scope_is_rejected() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_table_ref("a".into(), base_target()).unwrap();
        let err = scopes.add_table_ref("A".into(), base_target()).unwrap_err();
        assert!(matches!(err, BinderError::DuplicateAlias(_)));
    }

    #[test]
    fn inner_scope_shadows_outer_and_depth_reflects_resolution() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_table_ref("a".into(), base_target()).unwrap();
        scopes.push();
        scopes
            .add_table_ref(
                "d".into(),
                ScopeTarget::Derived {
                    columns: vec![("a1".into(), SqlTypeId::BigInt)],
                },
            )
            .unwrap();

        // Unqualified a1 resolves in the inner scope at depth 1.
        let inner = scopes.resolve_column(None, "a1").unwrap();
        if let BoundExpr::ColumnValue(c) = &inner {
            assert_eq!(c.depth, 1);
            assert_eq!(c.type_id, SqlTypeId::BigInt);
        } else {
            panic!("expected column value");
        }
        // Qualified by the outer alias it climbs to depth 0.
        let outer = scopes.resolve_column(Some("a"), "a1").unwrap();
        if let BoundExpr::ColumnValue(c) = &outer {
            assert_eq!(c.depth, 0);
            assert_eq!(c.table_oid, TableOid(10));
        } else {
            panic!("expected column value");
        }
    }

    #[test]
    fn unresolvable_names_fail() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_table_ref("a".into(), base_target()).unwrap();
        assert!(matches!(
            scopes.resolve_column(None, "zz"),
            Err(BinderError::UnknownColumn(_))
        ));
        assert!(matches!(
            scopes.resolve_column(Some("b"), "a1"),
            Err(BinderError::UnknownTable(_))
        ));
    }
}
