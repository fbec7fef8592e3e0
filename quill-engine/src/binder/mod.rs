//! The binder: depth-first resolution of parse trees against the catalog.
//! Every name becomes an OID triple, every expression gets a type, and each
//! SELECT nesting level gets a lexical scope whose depth is recorded on the
//! column references that resolve in it.

pub mod expr;
pub mod params;
pub mod scope;
pub mod statement;

use std::sync::Arc;

use sqlparser::ast;

use quill_catalog::{CatalogAccessor, Column, IndexColumn, NamespaceOid};
use quill_storage::{SqlTypeId, SqlValue};

use crate::error::{BinderError, QueryError};

use self::expr::{
    AggKind, AggregateExpr, ArithmeticOp, BoundExpr, ComparisonOp, ConjunctionOp, FunctionExpr,
    UnaryOp,
};
use self::scope::{ScopeStack, ScopeTarget};
use self::statement::{
    BoundBaseTable, BoundCreateIndex, BoundCreateTable, BoundCte, BoundDelete, BoundDropIndex,
    BoundDropTable, BoundInsert, BoundOrderBy, BoundSelect, BoundStatement, BoundTableRef,
    BoundUpdate, InsertSource, JoinKind,
};

/// Stateful binder over one statement. Parameter types discovered during
/// binding are retained for the prepared-statement fast path.
pub struct Binder<'a> {
    accessor: &'a CatalogAccessor,
    scopes: ScopeStack,
    ctes: Vec<BoundCte>,
    cte_visible: Vec<(String, usize)>,
    param_types: Vec<SqlTypeId>,
}

impl<'a> Binder<'a> {
    pub fn new(accessor: &'a CatalogAccessor) -> Self {
        Binder {
            accessor,
            scopes: ScopeStack::new(),
            ctes: Vec::new(),
            cte_visible: Vec::new(),
            param_types: Vec::new(),
        }
    }

    /// Binder seeded with parameter types from an extended-protocol Parse.
    pub fn with_param_types(accessor: &'a CatalogAccessor, declared: Vec<SqlTypeId>) -> Self {
        let mut binder = Binder::new(accessor);
        binder.param_types = declared;
        binder
    }

    /// Desired parameter types recorded during binding.
    pub fn desired_param_types(&self) -> Vec<SqlTypeId> {
        self.param_types.clone()
    }

    pub fn bind(&mut self, statement: &ast::Statement) -> Result<BoundStatement, QueryError> {
        match statement {
            ast::Statement::Query(query) => {
                let mut select = self.bind_query(query)?;
                // The statement-level CTE list lands on the root select.
                select.ctes = std::mem::take(&mut self.ctes);
                Ok(BoundStatement::Select(select))
            }
            ast::Statement::Insert(insert) => self.bind_insert(insert),
            ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => self.bind_update(table, assignments, selection.as_ref()),
            ast::Statement::Delete(delete) => self.bind_delete(delete),
            ast::Statement::CreateTable(create) => self.bind_create_table(create),
            ast::Statement::CreateIndex(create) => self.bind_create_index(create),
            ast::Statement::Drop {
                object_type,
                if_exists,
                names,
                ..
            } => self.bind_drop(object_type, *if_exists, names),
            ast::Statement::Copy {
                source,
                to,
                target,
                ..
            } => self.bind_copy(source, *to, target),
            ast::Statement::Explain {
                statement: inner, ..
            } => Ok(BoundStatement::Explain(Box::new(self.bind(inner)?))),
            other => Err(QueryError::NotImplemented(format!(
                "statement {other}"
            ))),
        }
    }

    // ---- SELECT ----

    pub fn bind_query(&mut self, query: &ast::Query) -> Result<BoundSelect, QueryError> {
        let visible_before = self.cte_visible.len();
        if let Some(with) = &query.with {
            if with.recursive {
                return Err(QueryError::NotImplemented(
                    "recursive common table expressions".to_string(),
                ));
            }
            for cte in &with.cte_tables {
                // The body binds in its own child scope; the alias becomes
                // visible to the remainder of this query only.
                let select = self.bind_query(&cte.query)?;
                let columns = select
                    .output_names
                    .iter()
                    .cloned()
                    .zip(select.output_types())
                    .collect();
                let index = self.ctes.len();
                let name = cte.alias.name.value.clone();
                self.ctes.push(BoundCte {
                    name: name.clone(),
                    select,
                    columns,
                });
                self.cte_visible.push((name, index));
            }
        }

        let select = match query.body.as_ref() {
            ast::SetExpr::Select(select) => self.bind_select_body(select, query)?,
            other => {
                return Err(QueryError::NotImplemented(format!(
                    "query body {other}"
                )))
            }
        };
        self.cte_visible.truncate(visible_before);
        Ok(select)
    }

    fn bind_select_body(
        &mut self,
        select: &ast::Select,
        query: &ast::Query,
    ) -> Result<BoundSelect, QueryError> {
        let depth = self.scopes.push();
        let result = self.bind_select_inner(select, query, depth);
        self.scopes.pop();
        result
    }

    fn bind_select_inner(
        &mut self,
        select: &ast::Select,
        query: &ast::Query,
        depth: u32,
    ) -> Result<BoundSelect, QueryError> {
        // FROM clause first so the select list can resolve against it.
        let mut table: Option<BoundTableRef> = None;
        for twj in &select.from {
            let bound = self.bind_table_with_joins(twj)?;
            table = Some(match table {
                None => bound,
                Some(left) => BoundTableRef::Join {
                    kind: JoinKind::Cross,
                    left: Box::new(left),
                    right: Box::new(bound),
                    condition: None,
                },
            });
        }

        let mut select_list = Vec::new();
        let mut output_names = Vec::new();
        for item in &select.projection {
            match item {
                ast::SelectItem::Wildcard(_) => {
                    for (alias, column, _) in self.scopes.visible_columns() {
                        select_list.push(self.scopes.resolve_column(Some(&alias), &column)?);
                        output_names.push(column);
                    }
                }
                ast::SelectItem::QualifiedWildcard(name, _) => {
                    let alias = object_name_tail(name);
                    let columns = self.scopes.visible_columns_of(&alias);
                    if columns.is_empty() {
                        return Err(BinderError::UnknownTable(alias).into());
                    }
                    for (alias, column, _) in columns {
                        select_list.push(self.scopes.resolve_column(Some(&alias), &column)?);
                        output_names.push(column);
                    }
                }
                ast::SelectItem::UnnamedExpr(expr) => {
                    let bound = self.bind_expr(expr)?;
                    output_names.push(output_name_for(expr, &bound));
                    select_list.push(bound);
                }
                ast::SelectItem::ExprWithAlias { expr, alias } => {
                    let bound = self.bind_expr(expr)?;
                    output_names.push(alias.value.clone());
                    select_list.push(bound);
                }
            }
        }

        let predicate = match &select.selection {
            Some(expr) => {
                let bound = self.bind_expr(expr)?;
                self.validate_where_clause(&bound)?;
                Some(bound)
            }
            None => None,
        };

        let mut group_by = Vec::new();
        if let ast::GroupByExpr::Expressions(exprs, _) = &select.group_by {
            for expr in exprs {
                group_by.push(self.bind_expr(expr)?);
            }
        }

        let having = match &select.having {
            Some(expr) => Some(self.bind_expr(expr)?),
            None => None,
        };

        let distinct = match &select.distinct {
            None => false,
            Some(ast::Distinct::Distinct) => true,
            Some(ast::Distinct::On(_)) => {
                return Err(QueryError::NotImplemented("DISTINCT ON".to_string()))
            }
        };

        validate_aggregate_select(&select_list, &output_names, &group_by, &having)?;

        let mut order_by = Vec::new();
        if let Some(order) = &query.order_by {
            for item in &order.exprs {
                let bound = self.bind_order_by_expr(&item.expr, &select_list, &output_names)?;
                order_by.push(BoundOrderBy {
                    expr: bound,
                    descending: item.asc == Some(false),
                });
            }
        }

        let limit = match &query.limit {
            Some(expr) => Some(self.bind_limit_value(expr)?),
            None => None,
        };
        let offset = match &query.offset {
            Some(offset) => self.bind_limit_value(&offset.value)?,
            None => 0,
        };

        Ok(BoundSelect {
            ctes: Vec::new(),
            table,
            select_list,
            output_names,
            predicate,
            group_by,
            having,
            order_by,
            limit,
            offset,
            distinct,
            depth,
        })
    }

    fn bind_order_by_expr(
        &mut self,
        expr: &ast::Expr,
        select_list: &[BoundExpr],
        output_names: &[String],
    ) -> Result<BoundExpr, QueryError> {
        // Ordinals and select-list aliases resolve to derived references.
        if let ast::Expr::Value(ast::Value::Number(n, _)) = expr {
            let ordinal: usize = n
                .parse()
                .map_err(|_| QueryError::Parse(format!("invalid ORDER BY position {n}")))?;
            if ordinal == 0 || ordinal > select_list.len() {
                return Err(QueryError::Parse(format!(
                    "ORDER BY position {ordinal} is not in select list"
                )));
            }
            return Ok(select_list[ordinal - 1].clone());
        }
        if let ast::Expr::Identifier(ident) = expr {
            if self.scopes.resolve_column(None, &ident.value).is_err() {
                if let Some(pos) = output_names
                    .iter()
                    .position(|n| n.eq_ignore_ascii_case(&ident.value))
                {
                    return Ok(select_list[pos].clone());
                }
            }
        }
        self.bind_expr(expr)
    }

    fn bind_limit_value(&mut self, expr: &ast::Expr) -> Result<u64, QueryError> {
        match self.bind_expr(expr)? {
            BoundExpr::Constant { value, .. } => value
                .as_i64()
                .filter(|v| *v >= 0)
                .map(|v| v as u64)
                .ok_or_else(|| QueryError::Parse("LIMIT must be a non-negative integer".into())),
            _ => Err(QueryError::NotImplemented(
                "non-constant LIMIT/OFFSET".to_string(),
            )),
        }
    }

    // ---- FROM ----

    fn bind_table_with_joins(
        &mut self,
        twj: &ast::TableWithJoins,
    ) -> Result<BoundTableRef, QueryError> {
        let mut left = self.bind_table_factor(&twj.relation)?;
        for join in &twj.joins {
            let right = self.bind_table_factor(&join.relation)?;
            let (kind, constraint) = match &join.join_operator {
                ast::JoinOperator::Inner(c) => (JoinKind::Inner, Some(c)),
                ast::JoinOperator::LeftOuter(c) => (JoinKind::Left, Some(c)),
                ast::JoinOperator::RightOuter(c) => (JoinKind::Right, Some(c)),
                ast::JoinOperator::FullOuter(c) => (JoinKind::Full, Some(c)),
                ast::JoinOperator::CrossJoin => (JoinKind::Cross, None),
                other => {
                    return Err(QueryError::NotImplemented(format!(
                        "join operator {other:?}"
                    )))
                }
            };
            let condition = match constraint {
                Some(ast::JoinConstraint::On(expr)) => Some(self.bind_expr(expr)?),
                Some(ast::JoinConstraint::None) | None => None,
                Some(other) => {
                    return Err(QueryError::NotImplemented(format!(
                        "join constraint {other:?}"
                    )))
                }
            };
            left = BoundTableRef::Join {
                kind,
                left: Box::new(left),
                right: Box::new(right),
                condition,
            };
        }
        Ok(left)
    }

    fn bind_table_factor(&mut self, factor: &ast::TableFactor) -> Result<BoundTableRef, QueryError> {
        match factor {
            ast::TableFactor::Table { name, alias, .. } => {
                let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
                let table_name = parts.last().cloned().unwrap_or_default();
                let alias_name = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table_name.clone());

                // CTE names shadow base tables for unqualified references.
                if parts.len() == 1 {
                    if let Some((_, cte_index)) = self
                        .cte_visible
                        .iter()
                        .rev()
                        .find(|(n, _)| n.eq_ignore_ascii_case(&table_name))
                        .cloned()
                    {
                        let columns = self.ctes[cte_index].columns.clone();
                        self.scopes.add_table_ref(
                            alias_name.clone(),
                            ScopeTarget::Derived {
                                columns: columns.clone(),
                            },
                        )?;
                        return Ok(BoundTableRef::CteReference {
                            cte_index,
                            alias: alias_name,
                            columns,
                        });
                    }
                }

                let table_oid = if parts.len() >= 2 {
                    let namespace = self
                        .accessor
                        .get_namespace_oid(&parts[parts.len() - 2])
                        .ok_or_else(|| {
                            BinderError::UnknownTable(format!(
                                "{}.{}",
                                parts[parts.len() - 2],
                                table_name
                            ))
                        })?;
                    self.accessor.get_table_oid_in(namespace, &table_name)
                } else {
                    self.accessor.get_table_oid(&table_name)
                }
                .ok_or_else(|| BinderError::UnknownTable(table_name.clone()))?;

                let schema = self
                    .accessor
                    .get_schema(table_oid)
                    .ok_or_else(|| BinderError::UnknownTable(table_name.clone()))?;
                self.scopes.add_table_ref(
                    alias_name.clone(),
                    ScopeTarget::Base {
                        db_oid: self.accessor.db_oid(),
                        table_oid,
                        schema: Arc::clone(&schema),
                    },
                )?;
                Ok(BoundTableRef::Base(BoundBaseTable {
                    db_oid: self.accessor.db_oid(),
                    table_oid,
                    alias: alias_name,
                    schema,
                }))
            }
            ast::TableFactor::Derived {
                subquery, alias, ..
            } => {
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .ok_or_else(|| {
                        QueryError::Parse("subquery in FROM must have an alias".to_string())
                    })?;
                let select = self.bind_query(subquery)?;
                let columns: Vec<(String, SqlTypeId)> = select
                    .output_names
                    .iter()
                    .cloned()
                    .zip(select.output_types())
                    .collect();
                self.scopes.add_table_ref(
                    alias.clone(),
                    ScopeTarget::Derived {
                        columns: columns.clone(),
                    },
                )?;
                Ok(BoundTableRef::Subquery {
                    select: Box::new(select),
                    alias,
                    columns,
                })
            }
            ast::TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.bind_table_with_joins(table_with_joins),
            other => Err(QueryError::NotImplemented(format!(
                "table factor {other}"
            ))),
        }
    }

    // ---- expressions ----

    pub fn bind_expr(&mut self, expr: &ast::Expr) -> Result<BoundExpr, QueryError> {
        match expr {
            ast::Expr::Identifier(ident) => {
                Ok(self.scopes.resolve_column(None, &ident.value)?)
            }
            ast::Expr::CompoundIdentifier(parts) => {
                if parts.len() < 2 {
                    return Err(BinderError::UnknownColumn(format!("{expr}")).into());
                }
                let column = &parts[parts.len() - 1].value;
                let alias = &parts[parts.len() - 2].value;
                Ok(self.scopes.resolve_column(Some(alias), column)?)
            }
            ast::Expr::Value(value) => self.bind_value(value),
            ast::Expr::Nested(inner) => self.bind_expr(inner),
            ast::Expr::BinaryOp { left, op, right } => self.bind_binary_op(left, op, right),
            ast::Expr::UnaryOp { op, expr } => self.bind_unary_op(op, expr),
            ast::Expr::IsNull(child) => Ok(BoundExpr::NullCheck {
                negated: false,
                child: Box::new(self.bind_expr(child)?),
            }),
            ast::Expr::IsNotNull(child) => Ok(BoundExpr::NullCheck {
                negated: true,
                child: Box::new(self.bind_expr(child)?),
            }),
            ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let value = self.bind_expr(expr)?;
                let low = self.bind_comparison(ComparisonOp::GtEq, value.clone(), low)?;
                let high = self.bind_comparison(ComparisonOp::LtEq, value, high)?;
                let both = BoundExpr::Conjunction {
                    op: ConjunctionOp::And,
                    children: vec![low, high],
                };
                Ok(if *negated {
                    BoundExpr::Unary {
                        op: UnaryOp::Not,
                        child: Box::new(both),
                        type_id: SqlTypeId::Boolean,
                    }
                } else {
                    both
                })
            }
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let value = self.bind_expr(expr)?;
                let mut children = Vec::with_capacity(list.len());
                for item in list {
                    children.push(self.bind_comparison(ComparisonOp::Eq, value.clone(), item)?);
                }
                let any = BoundExpr::Conjunction {
                    op: ConjunctionOp::Or,
                    children,
                };
                Ok(if *negated {
                    BoundExpr::Unary {
                        op: UnaryOp::Not,
                        child: Box::new(any),
                        type_id: SqlTypeId::Boolean,
                    }
                } else {
                    any
                })
            }
            ast::Expr::Function(function) => self.bind_function(function),
            ast::Expr::Subquery(_) | ast::Expr::InSubquery { .. } | ast::Expr::Exists { .. } => {
                Err(QueryError::NotImplemented(
                    "subqueries in expressions".to_string(),
                ))
            }
            other => Err(QueryError::NotImplemented(format!("expression {other}"))),
        }
    }

    fn bind_value(&mut self, value: &ast::Value) -> Result<BoundExpr, QueryError> {
        let constant = match value {
            ast::Value::Number(text, _) => {
                if text.contains('.') || text.contains('e') || text.contains('E') {
                    let parsed: f64 = text
                        .parse()
                        .map_err(|_| QueryError::Parse(format!("invalid number {text}")))?;
                    SqlValue::Real(parsed)
                } else {
                    let parsed: i64 = text
                        .parse()
                        .map_err(|_| QueryError::Parse(format!("invalid number {text}")))?;
                    if i32::try_from(parsed).is_ok() {
                        SqlValue::Integer(parsed as i32)
                    } else {
                        SqlValue::BigInt(parsed)
                    }
                }
            }
            ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                SqlValue::Varchar(s.clone())
            }
            ast::Value::Boolean(b) => SqlValue::Boolean(*b),
            ast::Value::Null => SqlValue::Null,
            ast::Value::Placeholder(text) => {
                let index: usize = text
                    .trim_start_matches('$')
                    .parse::<usize>()
                    .map_err(|_| QueryError::Parse(format!("invalid parameter {text}")))?
                    .saturating_sub(1);
                if self.param_types.len() <= index {
                    self.param_types.resize(index + 1, SqlTypeId::Invalid);
                }
                return Ok(BoundExpr::Parameter {
                    index,
                    type_id: self.param_types[index],
                });
            }
            other => {
                return Err(QueryError::NotImplemented(format!("literal {other}")))
            }
        };
        let type_id = constant.type_id();
        Ok(BoundExpr::Constant {
            value: constant,
            type_id,
        })
    }

    fn bind_binary_op(
        &mut self,
        left: &ast::Expr,
        op: &ast::BinaryOperator,
        right: &ast::Expr,
    ) -> Result<BoundExpr, QueryError> {
        use ast::BinaryOperator as B;
        match op {
            B::And | B::Or => {
                let conj_op = if matches!(op, B::And) {
                    ConjunctionOp::And
                } else {
                    ConjunctionOp::Or
                };
                let left = self.bind_expr(left)?;
                let right = self.bind_expr(right)?;
                let mut children = Vec::new();
                for side in [left, right] {
                    match side {
                        BoundExpr::Conjunction { op, children: c } if op == conj_op => {
                            children.extend(c)
                        }
                        other => children.push(other),
                    }
                }
                Ok(BoundExpr::Conjunction {
                    op: conj_op,
                    children,
                })
            }
            B::Eq | B::NotEq | B::Lt | B::LtEq | B::Gt | B::GtEq => {
                let cmp = match op {
                    B::Eq => ComparisonOp::Eq,
                    B::NotEq => ComparisonOp::NotEq,
                    B::Lt => ComparisonOp::Lt,
                    B::LtEq => ComparisonOp::LtEq,
                    B::Gt => ComparisonOp::Gt,
                    _ => ComparisonOp::GtEq,
                };
                let left = self.bind_expr(left)?;
                self.bind_comparison(cmp, left, right)
            }
            B::Plus | B::Minus | B::Multiply | B::Divide | B::Modulo => {
                let arith = match op {
                    B::Plus => ArithmeticOp::Add,
                    B::Minus => ArithmeticOp::Subtract,
                    B::Multiply => ArithmeticOp::Multiply,
                    B::Divide => ArithmeticOp::Divide,
                    _ => ArithmeticOp::Modulo,
                };
                let mut left = self.bind_expr(left)?;
                let mut right = self.bind_expr(right)?;
                self.unify_parameter(&mut left, &mut right);
                let lt = left.type_id();
                let rt = right.type_id();
                if !(numeric_or_unknown(lt) && numeric_or_unknown(rt)) {
                    return Err(BinderError::ComparisonTypeMismatch(
                        lt,
                        format!("{op}"),
                        rt,
                    )
                    .into());
                }
                let type_id = wider_numeric(lt, rt);
                Ok(BoundExpr::Arithmetic {
                    op: arith,
                    left: Box::new(left),
                    right: Box::new(right),
                    type_id,
                })
            }
            other => Err(QueryError::NotImplemented(format!("operator {other}"))),
        }
    }

    fn bind_comparison(
        &mut self,
        op: ComparisonOp,
        left: BoundExpr,
        right_ast: &ast::Expr,
    ) -> Result<BoundExpr, QueryError> {
        let mut left = left;
        let mut right = self.bind_expr(right_ast)?;
        self.unify_parameter(&mut left, &mut right);
        let lt = left.type_id();
        let rt = right.type_id();
        if !comparable(lt, rt) {
            return Err(BinderError::ComparisonTypeMismatch(lt, op.symbol().to_string(), rt).into());
        }
        Ok(BoundExpr::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// Propagate a concrete type onto an untyped parameter (or untyped null)
    /// on the other side of a binary expression, and record the desired
    /// parameter type for re-binding.
    fn unify_parameter(&mut self, left: &mut BoundExpr, right: &mut BoundExpr) {
        let lt = left.type_id();
        let rt = right.type_id();
        if lt != SqlTypeId::Invalid && rt == SqlTypeId::Invalid {
            self.assign_parameter_type(right, lt);
        } else if rt != SqlTypeId::Invalid && lt == SqlTypeId::Invalid {
            self.assign_parameter_type(left, rt);
        }
    }

    fn assign_parameter_type(&mut self, expr: &mut BoundExpr, new_type: SqlTypeId) {
        if let BoundExpr::Parameter { index, type_id } = expr {
            *type_id = new_type;
            if self.param_types.len() <= *index {
                self.param_types.resize(*index + 1, SqlTypeId::Invalid);
            }
            self.param_types[*index] = new_type;
        }
    }

    fn bind_unary_op(
        &mut self,
        op: &ast::UnaryOperator,
        expr: &ast::Expr,
    ) -> Result<BoundExpr, QueryError> {
        let child = self.bind_expr(expr)?;
        match op {
            ast::UnaryOperator::Plus => Ok(child),
            ast::UnaryOperator::Minus => {
                let type_id = child.type_id();
                if !numeric_or_unknown(type_id) {
                    return Err(BinderError::ComparisonTypeMismatch(
                        type_id,
                        "-".to_string(),
                        type_id,
                    )
                    .into());
                }
                Ok(BoundExpr::Unary {
                    op: UnaryOp::Minus,
                    child: Box::new(child),
                    type_id,
                })
            }
            ast::UnaryOperator::Not => Ok(BoundExpr::Unary {
                op: UnaryOp::Not,
                child: Box::new(child),
                type_id: SqlTypeId::Boolean,
            }),
            other => Err(QueryError::NotImplemented(format!("operator {other}"))),
        }
    }

    fn bind_function(&mut self, function: &ast::Function) -> Result<BoundExpr, QueryError> {
        let name = function
            .name
            .0
            .last()
            .map(|i| i.value.to_lowercase())
            .unwrap_or_default();

        let mut args = Vec::new();
        let mut star = false;
        let mut distinct = false;
        if let ast::FunctionArguments::List(list) = &function.args {
            distinct = matches!(
                list.duplicate_treatment,
                Some(ast::DuplicateTreatment::Distinct)
            );
            for arg in &list.args {
                match arg {
                    ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(expr)) => {
                        args.push(self.bind_expr(expr)?)
                    }
                    ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard) => star = true,
                    other => {
                        return Err(QueryError::NotImplemented(format!(
                            "function argument {other}"
                        )))
                    }
                }
            }
        }

        if let Some(kind) = aggregate_kind(&name, star) {
            let type_id = aggregate_type(kind, args.first());
            return Ok(BoundExpr::Aggregate(AggregateExpr {
                kind,
                arg: args.into_iter().next().map(Box::new),
                distinct,
                type_id,
            }));
        }

        let proc = self
            .accessor
            .get_proc(&name)
            .ok_or_else(|| BinderError::UnknownFunction(name.clone()))?;
        Ok(BoundExpr::Function(FunctionExpr {
            name,
            proc_oid: proc.oid,
            args,
            type_id: quill_catalog::postgres::sql_type_for(proc.ret_type),
        }))
    }

    /// WHERE must evaluate to boolean and may not contain aggregates.
    fn validate_where_clause(&mut self, predicate: &BoundExpr) -> Result<(), QueryError> {
        if predicate.has_aggregate() {
            return Err(BinderError::AggregateInWhere.into());
        }
        match predicate.type_id() {
            SqlTypeId::Boolean => Ok(()),
            SqlTypeId::Invalid => Ok(()), // untyped parameter, checked at bind
            other => Err(BinderError::WhereNotBoolean(other).into()),
        }
    }

    // ---- INSERT / UPDATE / DELETE ----

    fn bind_insert(&mut self, insert: &ast::Insert) -> Result<BoundStatement, QueryError> {
        let table = self.bind_target_table(&insert.table_name)?;
        let schema = Arc::clone(&table.schema);

        let column_indexes: Vec<usize> = if insert.columns.is_empty() {
            (0..schema.columns().len()).collect()
        } else {
            insert
                .columns
                .iter()
                .map(|ident| {
                    schema
                        .find_column(&ident.value)
                        .map(|(i, _)| i)
                        .ok_or_else(|| BinderError::UnknownColumn(ident.value.clone()))
                })
                .collect::<Result<_, _>>()?
        };

        let source = insert
            .source
            .as_ref()
            .ok_or_else(|| QueryError::NotImplemented("INSERT DEFAULT VALUES".to_string()))?;
        if source.with.is_some() {
            // Dependency analysis of WITH attached to DML is unsupported.
            return Err(QueryError::NotImplemented(
                "WITH clause on INSERT".to_string(),
            ));
        }

        let bound_source = match source.body.as_ref() {
            ast::SetExpr::Values(values) => {
                let mut rows = Vec::with_capacity(values.rows.len());
                for row in &values.rows {
                    if row.len() != column_indexes.len() {
                        return Err(BinderError::InsertArityMismatch.into());
                    }
                    let mut bound_row = Vec::with_capacity(row.len());
                    for (expr, column_index) in row.iter().zip(&column_indexes) {
                        let mut bound = self.bind_expr(expr)?;
                        let target = schema.column(*column_index).type_id();
                        let mut anchor = BoundExpr::Constant {
                            value: SqlValue::Null,
                            type_id: target,
                        };
                        self.unify_parameter(&mut anchor, &mut bound);
                        bound_row.push(bound);
                    }
                    rows.push(bound_row);
                }
                InsertSource::Values(rows)
            }
            ast::SetExpr::Select(_) => {
                let select = self.bind_query(source)?;
                if select.select_list.len() != column_indexes.len() {
                    return Err(BinderError::InsertArityMismatch.into());
                }
                InsertSource::Select(Box::new(select))
            }
            other => {
                return Err(QueryError::NotImplemented(format!(
                    "INSERT source {other}"
                )))
            }
        };

        Ok(BoundStatement::Insert(BoundInsert {
            table,
            column_indexes,
            source: bound_source,
        }))
    }

    fn bind_update(
        &mut self,
        table: &ast::TableWithJoins,
        assignments: &[ast::Assignment],
        selection: Option<&ast::Expr>,
    ) -> Result<BoundStatement, QueryError> {
        let ast::TableFactor::Table { name, .. } = &table.relation else {
            return Err(QueryError::NotImplemented(
                "UPDATE of a non-base table".to_string(),
            ));
        };
        let target = self.bind_target_table(name)?;
        let schema = Arc::clone(&target.schema);

        self.scopes.push();
        self.scopes.add_table_ref(
            target.alias.clone(),
            ScopeTarget::Base {
                db_oid: target.db_oid,
                table_oid: target.table_oid,
                schema: Arc::clone(&schema),
            },
        )?;

        let mut bound_assignments = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let ast::AssignmentTarget::ColumnName(column) = &assignment.target else {
                return Err(QueryError::NotImplemented(
                    "tuple assignment in UPDATE".to_string(),
                ));
            };
            let column_name = object_name_tail(column);
            let (index, column_def) = schema
                .find_column(&column_name)
                .ok_or_else(|| BinderError::UnknownColumn(column_name.clone()))?;
            let mut value = self.bind_expr(&assignment.value)?;
            let mut anchor = BoundExpr::Constant {
                value: SqlValue::Null,
                type_id: column_def.type_id(),
            };
            self.unify_parameter(&mut anchor, &mut value);
            bound_assignments.push((index, value));
        }

        let predicate = match selection {
            Some(expr) => {
                let bound = self.bind_expr(expr)?;
                self.validate_where_clause(&bound)?;
                Some(bound)
            }
            None => None,
        };
        self.scopes.pop();

        Ok(BoundStatement::Update(BoundUpdate {
            table: target,
            assignments: bound_assignments,
            predicate,
        }))
    }

    fn bind_delete(&mut self, delete: &ast::Delete) -> Result<BoundStatement, QueryError> {
        let from = match &delete.from {
            ast::FromTable::WithFromKeyword(tables) | ast::FromTable::WithoutKeyword(tables) => {
                tables
            }
        };
        let Some(first) = from.first() else {
            return Err(QueryError::Parse("DELETE requires a table".to_string()));
        };
        let ast::TableFactor::Table { name, .. } = &first.relation else {
            return Err(QueryError::NotImplemented(
                "DELETE from a non-base table".to_string(),
            ));
        };
        let target = self.bind_target_table(name)?;

        self.scopes.push();
        self.scopes.add_table_ref(
            target.alias.clone(),
            ScopeTarget::Base {
                db_oid: target.db_oid,
                table_oid: target.table_oid,
                schema: Arc::clone(&target.schema),
            },
        )?;
        let predicate = match &delete.selection {
            Some(expr) => {
                let bound = self.bind_expr(expr)?;
                self.validate_where_clause(&bound)?;
                Some(bound)
            }
            None => None,
        };
        self.scopes.pop();

        Ok(BoundStatement::Delete(BoundDelete {
            table: target,
            predicate,
        }))
    }

    fn bind_copy(
        &mut self,
        source: &ast::CopySource,
        to: bool,
        target: &ast::CopyTarget,
    ) -> Result<BoundStatement, QueryError> {
        if to {
            return Err(QueryError::NotImplemented("COPY TO".to_string()));
        }
        let ast::CopySource::Table { table_name, columns } = source else {
            return Err(QueryError::NotImplemented("COPY from a query".to_string()));
        };
        if !columns.is_empty() {
            return Err(QueryError::NotImplemented(
                "COPY with a column list".to_string(),
            ));
        }
        let ast::CopyTarget::File { filename } = target else {
            return Err(QueryError::NotImplemented(
                "COPY from a non-file source".to_string(),
            ));
        };
        let table = self.bind_target_table(table_name)?;
        Ok(BoundStatement::Copy(statement::BoundCopy {
            table,
            path: filename.clone(),
        }))
    }

    fn bind_target_table(&mut self, name: &ast::ObjectName) -> Result<BoundBaseTable, QueryError> {
        let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
        let table_name = parts.last().cloned().unwrap_or_default();
        let table_oid = if parts.len() >= 2 {
            let namespace = self
                .accessor
                .get_namespace_oid(&parts[parts.len() - 2])
                .ok_or_else(|| BinderError::UnknownTable(table_name.clone()))?;
            self.accessor.get_table_oid_in(namespace, &table_name)
        } else {
            self.accessor.get_table_oid(&table_name)
        }
        .ok_or_else(|| BinderError::UnknownTable(table_name.clone()))?;
        let schema = self
            .accessor
            .get_schema(table_oid)
            .ok_or_else(|| BinderError::UnknownTable(table_name.clone()))?;
        Ok(BoundBaseTable {
            db_oid: self.accessor.db_oid(),
            table_oid,
            alias: table_name,
            schema,
        })
    }

    // ---- DDL ----

    fn bind_create_table(
        &mut self,
        create: &ast::CreateTable,
    ) -> Result<BoundStatement, QueryError> {
        let (namespace, name) = self.resolve_ddl_target(&create.name)?;
        let mut columns = Vec::with_capacity(create.columns.len());
        for def in &create.columns {
            if columns
                .iter()
                .any(|c: &Column| c.name().eq_ignore_ascii_case(&def.name.value))
            {
                return Err(BinderError::DuplicateAlias(def.name.value.clone()).into());
            }
            let type_id = map_data_type(&def.data_type)?;
            let mut nullable = true;
            let mut default = None;
            for option in &def.options {
                match &option.option {
                    ast::ColumnOption::NotNull => nullable = false,
                    ast::ColumnOption::Null => nullable = true,
                    ast::ColumnOption::Default(expr) => {
                        let bound = self.bind_expr(expr)?;
                        match bound {
                            BoundExpr::Constant { value, .. } => default = Some(value),
                            _ => {
                                return Err(QueryError::NotImplemented(
                                    "non-constant column defaults".to_string(),
                                ))
                            }
                        }
                    }
                    _ => {}
                }
            }
            let mut column = Column::new(def.name.value.clone(), type_id, nullable);
            if let Some(value) = default {
                column = column.with_default(value);
            }
            columns.push(column);
        }
        Ok(BoundStatement::CreateTable(BoundCreateTable {
            namespace,
            name,
            columns,
            if_not_exists: create.if_not_exists,
        }))
    }

    fn bind_create_index(
        &mut self,
        create: &ast::CreateIndex,
    ) -> Result<BoundStatement, QueryError> {
        let name = create
            .name
            .as_ref()
            .map(|n| object_name_tail(n))
            .ok_or_else(|| QueryError::Parse("CREATE INDEX requires a name".to_string()))?;
        let target = self.bind_target_table(&create.table_name)?;
        let namespace = self.accessor.default_namespace();

        let mut key_columns = Vec::with_capacity(create.columns.len());
        for column in &create.columns {
            let ast::Expr::Identifier(ident) = &column.expr else {
                return Err(QueryError::NotImplemented(
                    "expression index keys".to_string(),
                ));
            };
            let (_, column_def) = target
                .schema
                .find_column(&ident.value)
                .ok_or_else(|| BinderError::UnknownColumn(ident.value.clone()))?;
            key_columns.push(IndexColumn {
                column_oid: column_def.oid(),
                descending: column.asc == Some(false),
            });
        }

        Ok(BoundStatement::CreateIndex(BoundCreateIndex {
            namespace,
            name,
            table_oid: target.table_oid,
            key_columns,
            unique: create.unique,
            if_not_exists: create.if_not_exists,
        }))
    }

    fn bind_drop(
        &mut self,
        object_type: &ast::ObjectType,
        if_exists: bool,
        names: &[ast::ObjectName],
    ) -> Result<BoundStatement, QueryError> {
        let name = names
            .first()
            .map(object_name_tail)
            .ok_or_else(|| QueryError::Parse("DROP requires a name".to_string()))?;
        match object_type {
            ast::ObjectType::Table => {
                let table_oid = self.accessor.get_table_oid(&name);
                if table_oid.is_none() && !if_exists {
                    return Err(BinderError::UnknownTable(name).into());
                }
                Ok(BoundStatement::DropTable(BoundDropTable {
                    name,
                    table_oid,
                    if_exists,
                }))
            }
            ast::ObjectType::Index => {
                let index_oid = self.accessor.get_index_oid(&name);
                if index_oid.is_none() && !if_exists {
                    return Err(BinderError::UnknownTable(name).into());
                }
                Ok(BoundStatement::DropIndex(BoundDropIndex {
                    name,
                    index_oid,
                    if_exists,
                }))
            }
            other => Err(QueryError::NotImplemented(format!("DROP {other}"))),
        }
    }

    fn resolve_ddl_target(
        &self,
        name: &ast::ObjectName,
    ) -> Result<(NamespaceOid, String), QueryError> {
        let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
        let object = parts.last().cloned().unwrap_or_default();
        let namespace = if parts.len() >= 2 {
            self.accessor
                .get_namespace_oid(&parts[parts.len() - 2])
                .ok_or_else(|| {
                    QueryError::Catalog(quill_catalog::CatalogError::UnknownNamespace(
                        parts[parts.len() - 2].clone(),
                    ))
                })?
        } else {
            self.accessor.default_namespace()
        };
        Ok((namespace, object))
    }
}

// ---- helpers ----

fn object_name_tail(name: &ast::ObjectName) -> String {
    name.0.last().map(|i| i.value.clone()).unwrap_or_default()
}

fn output_name_for(expr: &ast::Expr, bound: &BoundExpr) -> String {
    match expr {
        ast::Expr::Identifier(ident) => ident.value.clone(),
        ast::Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default(),
        ast::Expr::Function(function) => function
            .name
            .0
            .last()
            .map(|i| i.value.to_lowercase())
            .unwrap_or_default(),
        _ => bound.display(),
    }
}

fn aggregate_kind(name: &str, star: bool) -> Option<AggKind> {
    match name {
        "count" if star => Some(AggKind::CountStar),
        "count" => Some(AggKind::Count),
        "sum" => Some(AggKind::Sum),
        "min" => Some(AggKind::Min),
        "max" => Some(AggKind::Max),
        "avg" => Some(AggKind::Avg),
        _ => None,
    }
}

fn aggregate_type(kind: AggKind, arg: Option<&BoundExpr>) -> SqlTypeId {
    match kind {
        AggKind::CountStar | AggKind::Count => SqlTypeId::BigInt,
        AggKind::Avg => SqlTypeId::Real,
        AggKind::Sum => match arg.map(|a| a.type_id()) {
            Some(SqlTypeId::Real) => SqlTypeId::Real,
            _ => SqlTypeId::BigInt,
        },
        AggKind::Min | AggKind::Max => arg.map(|a| a.type_id()).unwrap_or(SqlTypeId::Invalid),
    }
}

fn numeric_or_unknown(type_id: SqlTypeId) -> bool {
    type_id.is_numeric() || type_id == SqlTypeId::Invalid
}

fn comparable(left: SqlTypeId, right: SqlTypeId) -> bool {
    use SqlTypeId::*;
    if left == Invalid || right == Invalid {
        return true;
    }
    if left.is_numeric() && right.is_numeric() {
        return true;
    }
    matches!(
        (left, right),
        (Varchar, Varchar) | (Boolean, Boolean) | (Date, Date) | (Timestamp, Timestamp)
    )
}

fn wider_numeric(left: SqlTypeId, right: SqlTypeId) -> SqlTypeId {
    use SqlTypeId::*;
    if left == Real || right == Real {
        return Real;
    }
    let rank = |t: SqlTypeId| match t {
        TinyInt => 1,
        SmallInt => 2,
        Integer => 3,
        BigInt => 4,
        _ => 3,
    };
    if rank(left) >= rank(right) {
        if left == Invalid {
            right
        } else {
            left
        }
    } else {
        right
    }
}

fn map_data_type(data_type: &ast::DataType) -> Result<SqlTypeId, QueryError> {
    use ast::DataType as D;
    match data_type {
        D::Boolean => Ok(SqlTypeId::Boolean),
        D::TinyInt(_) => Ok(SqlTypeId::TinyInt),
        D::SmallInt(_) | D::Int2(_) => Ok(SqlTypeId::SmallInt),
        D::Int(_) | D::Integer(_) | D::Int4(_) => Ok(SqlTypeId::Integer),
        D::BigInt(_) | D::Int8(_) => Ok(SqlTypeId::BigInt),
        D::Real | D::Float4 | D::Float(_) | D::Float8 | D::DoublePrecision => Ok(SqlTypeId::Real),
        D::Varchar(_) | D::CharacterVarying(_) | D::Text | D::Char(_) | D::Character(_) => {
            Ok(SqlTypeId::Varchar)
        }
        D::Date => Ok(SqlTypeId::Date),
        D::Timestamp(_, _) => Ok(SqlTypeId::Timestamp),
        other => Err(QueryError::NotImplemented(format!("type {other}"))),
    }
}

/// In an aggregate query every select item must either contain an aggregate
/// or appear in the GROUP BY list; HAVING may reference both.
fn validate_aggregate_select(
    select_list: &[BoundExpr],
    output_names: &[String],
    group_by: &[BoundExpr],
    having: &Option<BoundExpr>,
) -> Result<(), QueryError> {
    let is_aggregate_query = !group_by.is_empty()
        || having.is_some()
        || select_list.iter().any(|e| e.has_aggregate());
    if !is_aggregate_query {
        return Ok(());
    }
    for (item, name) in select_list.iter().zip(output_names) {
        if item.has_aggregate() || item.is_constant() {
            continue;
        }
        if !group_by.iter().any(|g| g == item) {
            return Err(BinderError::NotInGroupBy(name.clone()).into());
        }
    }
    Ok(())
}
