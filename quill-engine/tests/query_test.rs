//! End-to-end engine tests: parse → bind → transform → optimize → compile →
//! interpret, over a catalog seeded with A(a1 int, a2 varchar(20)) and
//! B(b1 int, b2 varchar(20)).

use std::sync::Arc;

use quill_catalog::{Catalog, Column, DatabaseOid, Schema};
use quill_engine::binder::params::promote_parameters;
use quill_engine::binder::statement::{BoundStatement, BoundTableRef};
use quill_engine::binder::Binder;
use quill_engine::compiler::CompilationContext;
use quill_engine::exec::ExecutionContext;
use quill_engine::optimizer::{Optimizer, TrivialCostModel};
use quill_engine::plan::{self, PhysicalOp, PlanNode};
use quill_engine::{parse, ExecutionMode, ExecutionSettings, QueryError};
use quill_storage::{SqlTypeId, SqlValue, TransactionContext, TransactionManager};

struct Harness {
    txn_manager: Arc<TransactionManager>,
    catalog: Arc<Catalog>,
    db: DatabaseOid,
}

impl Harness {
    fn new() -> Self {
        let txn_manager = Arc::new(TransactionManager::new());
        let catalog = Arc::new(Catalog::new(Arc::clone(&txn_manager)));
        let boot = txn_manager.begin();
        let db = catalog.create_database(&boot, "quill_test").unwrap();
        txn_manager.commit(&boot);

        let harness = Harness {
            txn_manager,
            catalog,
            db,
        };
        for name in ["a", "b"] {
            let prefix = name.chars().next().unwrap();
            harness
                .execute(
                    &format!(
                        "CREATE TABLE {name} ({prefix}1 INT, {prefix}2 VARCHAR(20))"
                    ),
                    vec![],
                )
                .unwrap();
        }
        harness
    }

    fn bind(
        &self,
        txn: &Arc<TransactionContext>,
        sql: &str,
    ) -> Result<BoundStatement, QueryError> {
        let parsed = parse(sql)?;
        let accessor = self.catalog.accessor(self.db, Arc::clone(txn)).unwrap();
        let mut binder = Binder::new(&accessor);
        binder.bind(&parsed.statements[0])
    }

    fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult, QueryError> {
        let txn = self.txn_manager.begin();
        let result = self.execute_in(&txn, sql, params);
        if result.is_ok() {
            self.txn_manager.commit(&txn);
        } else {
            self.txn_manager.abort(&txn);
        }
        result
    }

    fn execute_in(
        &self,
        txn: &Arc<TransactionContext>,
        sql: &str,
        mut params: Vec<SqlValue>,
    ) -> Result<QueryResult, QueryError> {
        let parsed = parse(sql)?;
        let accessor = self.catalog.accessor(self.db, Arc::clone(txn)).unwrap();
        let mut binder = Binder::new(&accessor);
        let bound = binder.bind(&parsed.statements[0])?;
        promote_parameters(&mut params, &binder.desired_param_types())?;

        let transformed = plan::transform(&bound)?;
        let optimizer = Optimizer::new(Box::<TrivialCostModel>::default(), 5000);
        let physical = optimizer.optimize(&accessor, &transformed)?;

        let settings = ExecutionSettings::default();
        let executable = CompilationContext::compile(
            Arc::new(physical.clone()),
            &accessor,
            settings.clone(),
            transformed.visible_columns,
        )?;
        let ctx = ExecutionContext::new(&accessor, params, settings);
        executable.run(&ctx, ExecutionMode::Interpret)?;
        Ok(QueryResult {
            rows: ctx.take_output(),
            rows_affected: ctx.rows_affected(),
            plan: physical.root,
        })
    }
}

struct QueryResult {
    rows: Vec<Vec<SqlValue>>,
    rows_affected: u64,
    plan: PlanNode,
}

fn seed_rows(harness: &Harness) {
    for (a1, a2) in [(1, "one"), (2, "two"), (3, "three"), (60, "sixty"), (99, "ninety")] {
        harness
            .execute(&format!("INSERT INTO a VALUES ({a1}, '{a2}')"), vec![])
            .unwrap();
    }
    for (b1, b2) in [(1, "uno"), (3, "tres"), (99, "noventa")] {
        harness
            .execute(&format!("INSERT INTO b VALUES ({b1}, '{b2}')"), vec![])
            .unwrap();
    }
}

#[test]
fn unknown_table_fails_in_the_binder() {
    let harness = Harness::new();
    let err = harness.execute("SELECT a1 FROM c", vec![]).unwrap_err();
    assert!(matches!(err, QueryError::Binder(_)), "{err}");
    assert_eq!(err.sqlstate(), "42P01");
}

#[test]
fn join_query_resolves_every_column_triple_at_depth_zero() {
    let harness = Harness::new();
    let txn = harness.txn_manager.begin();
    let bound = harness
        .bind(
            &txn,
            "SELECT A.A1, B.B2 FROM A INNER JOIN b ON a.a1=b.b1 \
             WHERE a1<100 GROUP BY A.a1,B.b2 HAVING a1>50 ORDER BY a1",
        )
        .unwrap();
    let BoundStatement::Select(select) = &bound else {
        panic!("expected a select");
    };

    let accessor = harness
        .catalog
        .accessor(harness.db, Arc::clone(&txn))
        .unwrap();
    let a_oid = accessor.get_table_oid("a").unwrap();
    let b_oid = accessor.get_table_oid("b").unwrap();
    let a_schema = accessor.get_schema(a_oid).unwrap();
    let b_schema = accessor.get_schema(b_oid).unwrap();

    let mut columns = Vec::new();
    for expr in select
        .select_list
        .iter()
        .chain(select.group_by.iter())
        .chain(select.predicate.iter())
        .chain(select.having.iter())
    {
        expr.collect_columns(&mut columns);
    }
    assert!(!columns.is_empty());
    for column in columns {
        assert_eq!(column.depth, 0, "column {} depth", column.column_name);
        assert_eq!(column.db_oid, harness.db);
        let expected = if column.table_oid == a_oid {
            a_schema.find_column(&column.column_name).unwrap().1.oid()
        } else {
            assert_eq!(column.table_oid, b_oid);
            b_schema.find_column(&column.column_name).unwrap().1.oid()
        };
        assert_eq!(column.column_oid, expected);
    }
    harness.txn_manager.abort(&txn);
}

#[test]
fn subquery_columns_bind_one_scope_deeper() {
    let harness = Harness::new();
    let txn = harness.txn_manager.begin();
    let bound = harness
        .bind(
            &txn,
            "SELECT * FROM A LEFT OUTER JOIN \
             (SELECT * FROM B INNER JOIN A ON B1=A1) AS C ON C.B1=a.A1",
        )
        .unwrap();
    let BoundStatement::Select(select) = &bound else {
        panic!("expected a select");
    };

    // Outer references (select list and join condition) are at depth 0.
    let mut outer_columns = Vec::new();
    for expr in &select.select_list {
        expr.collect_columns(&mut outer_columns);
    }
    let Some(BoundTableRef::Join { right, condition, .. }) = &select.table else {
        panic!("expected a join");
    };
    for expr in condition.iter() {
        expr.collect_columns(&mut outer_columns);
    }
    assert!(outer_columns.iter().all(|c| c.depth == 0));

    // The subquery's own select list binds at depth 1.
    let BoundTableRef::Subquery { select: inner, .. } = right.as_ref() else {
        panic!("expected a subquery");
    };
    let mut inner_columns = Vec::new();
    for expr in &inner.select_list {
        expr.collect_columns(&mut inner_columns);
    }
    assert!(!inner_columns.is_empty());
    assert!(inner_columns.iter().all(|c| c.depth == 1));
    harness.txn_manager.abort(&txn);
}

#[test]
fn binder_output_is_deterministic() {
    let harness = Harness::new();
    let txn = harness.txn_manager.begin();
    let sql = "SELECT a.a1, count(*) FROM a INNER JOIN b ON a.a1 = b.b1 \
               WHERE a.a1 < 10 GROUP BY a.a1";
    let first = format!("{:?}", harness.bind(&txn, sql).unwrap());
    let second = format!("{:?}", harness.bind(&txn, sql).unwrap());
    assert_eq!(first, second);
    harness.txn_manager.abort(&txn);
}

#[test]
fn cte_alias_resolves_as_virtual_table() {
    let harness = Harness::new();
    seed_rows(&harness);
    let result = harness
        .execute("WITH c AS (SELECT a1 FROM a) SELECT c1.a1 FROM c AS c1 ORDER BY 1", vec![])
        .unwrap();
    let values: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r[0].as_i64().unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3, 60, 99]);
}

#[test]
fn recursive_cte_is_rejected() {
    let harness = Harness::new();
    let err = harness
        .execute(
            "WITH RECURSIVE c AS (SELECT a1 FROM a) SELECT * FROM c",
            vec![],
        )
        .unwrap_err();
    assert!(matches!(err, QueryError::NotImplemented(_)));
    assert_eq!(err.sqlstate(), "0A000");
}

#[test]
fn aggregates_are_forbidden_in_where() {
    let harness = Harness::new();
    let err = harness
        .execute("SELECT a1 FROM a WHERE count(*) > 1", vec![])
        .unwrap_err();
    assert_eq!(err.sqlstate(), "42803");
}

#[test]
fn where_clause_must_be_boolean() {
    let harness = Harness::new();
    let err = harness.execute("SELECT a1 FROM a WHERE 1", vec![]).unwrap_err();
    assert_eq!(err.sqlstate(), "42804");
}

#[test]
fn filtered_select_round_trips_through_storage() {
    let harness = Harness::new();
    seed_rows(&harness);
    let result = harness
        .execute(
            "SELECT a2, a1 FROM a WHERE a1 > 2 ORDER BY a1 DESC LIMIT 2",
            vec![],
        )
        .unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0][0], SqlValue::Varchar("ninety".into()));
    assert_eq!(result.rows[0][1], SqlValue::Integer(99));
    assert_eq!(result.rows[1][1], SqlValue::Integer(60));
}

#[test]
fn inner_join_group_by_having_order_by_end_to_end() {
    let harness = Harness::new();
    seed_rows(&harness);
    let result = harness
        .execute(
            "SELECT a.a1, count(*) FROM a INNER JOIN b ON a.a1 = b.b1 \
             WHERE a.a1 < 100 GROUP BY a.a1 HAVING a.a1 > 0 ORDER BY a.a1",
            vec![],
        )
        .unwrap();
    let keys: Vec<i64> = result.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(keys, vec![1, 3, 99]);
    assert!(result
        .rows
        .iter()
        .all(|r| r[1] == SqlValue::BigInt(1)));
}

#[test]
fn left_outer_join_emits_unmatched_rows() {
    let harness = Harness::new();
    seed_rows(&harness);
    let result = harness
        .execute(
            "SELECT a.a1, b.b2 FROM a LEFT OUTER JOIN b ON a.a1 = b.b1 ORDER BY a.a1",
            vec![],
        )
        .unwrap();
    assert_eq!(result.rows.len(), 5);
    let unmatched: Vec<i64> = result
        .rows
        .iter()
        .filter(|r| r[1].is_null())
        .map(|r| r[0].as_i64().unwrap())
        .collect();
    assert_eq!(unmatched, vec![2, 60]);
}

#[test]
fn static_aggregate_over_empty_input() {
    let harness = Harness::new();
    let result = harness
        .execute("SELECT count(*), sum(a1), min(a2) FROM a", vec![])
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0][0], SqlValue::BigInt(0));
    assert!(result.rows[0][1].is_null());
    assert!(result.rows[0][2].is_null());
}

#[test]
fn distinct_collapses_duplicates() {
    let harness = Harness::new();
    seed_rows(&harness);
    harness
        .execute("INSERT INTO a VALUES (1, 'one')", vec![])
        .unwrap();
    let result = harness
        .execute("SELECT DISTINCT a1 FROM a ORDER BY a1", vec![])
        .unwrap();
    let keys: Vec<i64> = result.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(keys, vec![1, 2, 3, 60, 99]);
}

#[test]
fn parameters_promote_on_the_fast_path() {
    let harness = Harness::new();
    seed_rows(&harness);
    // The binder wants an INT parameter; a bigint constant narrows.
    let result = harness
        .execute(
            "SELECT a2 FROM a WHERE a1 = $1",
            vec![SqlValue::BigInt(3)],
        )
        .unwrap();
    assert_eq!(result.rows, vec![vec![SqlValue::Varchar("three".into())]]);

    let err = harness
        .execute(
            "SELECT a2 FROM a WHERE a1 = $1",
            vec![SqlValue::Varchar("3".into())],
        )
        .unwrap_err();
    assert_eq!(err.sqlstate(), "22003");
}

#[test]
fn unique_index_creation_and_enforcement() {
    let harness = Harness::new();
    seed_rows(&harness);
    harness
        .execute("CREATE UNIQUE INDEX idx_d ON A (A2, A1)", vec![])
        .unwrap();

    let txn = harness.txn_manager.begin();
    let accessor = harness
        .catalog
        .accessor(harness.db, Arc::clone(&txn))
        .unwrap();
    let table = accessor.get_table_oid("a").unwrap();
    assert_eq!(accessor.get_index_oids(table).len(), 1);
    harness.txn_manager.abort(&txn);

    let err = harness
        .execute("INSERT INTO a VALUES (60, 'sixty')", vec![])
        .unwrap_err();
    assert_eq!(err.sqlstate(), "23505");
}

#[test]
fn index_provides_order_without_an_explicit_sort() {
    let harness = Harness::new();
    seed_rows(&harness);
    harness
        .execute("CREATE INDEX idx_a1 ON a (a1)", vec![])
        .unwrap();
    // Statistics make the seq-scan-plus-sort path pay for the enforcer.
    let result = harness
        .execute("SELECT a1 FROM a ORDER BY a1", vec![])
        .unwrap();
    let keys: Vec<i64> = result.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(keys, vec![1, 2, 3, 60, 99]);

    // Optimizer soundness: the plan must carry the required order, either
    // by an order-providing index scan or an explicit sort enforcer.
    fn provides_sort(node: &PlanNode) -> bool {
        match &node.op {
            PhysicalOp::Sort { .. } => true,
            PhysicalOp::IndexScan { .. } => true,
            PhysicalOp::Limit { sort_keys, .. } => !sort_keys.is_empty(),
            _ => node.children.iter().any(provides_sort),
        }
    }
    assert!(provides_sort(&result.plan), "{:?}", result.plan);
}

#[test]
fn update_and_delete_report_rows_affected() {
    let harness = Harness::new();
    seed_rows(&harness);
    let update = harness
        .execute("UPDATE a SET a2 = 'updated' WHERE a1 < 3", vec![])
        .unwrap();
    assert_eq!(update.rows_affected, 2);

    let check = harness
        .execute("SELECT a2 FROM a WHERE a1 = 1", vec![])
        .unwrap();
    assert_eq!(check.rows, vec![vec![SqlValue::Varchar("updated".into())]]);

    let delete = harness.execute("DELETE FROM a WHERE a1 > 50", vec![]).unwrap();
    assert_eq!(delete.rows_affected, 2);
    let remaining = harness.execute("SELECT count(*) FROM a", vec![]).unwrap();
    assert_eq!(remaining.rows[0][0], SqlValue::BigInt(3));
}

#[test]
fn insert_select_copies_between_tables() {
    let harness = Harness::new();
    seed_rows(&harness);
    let result = harness
        .execute("INSERT INTO b (b1, b2) SELECT a1, a2 FROM a WHERE a1 > 50", vec![])
        .unwrap();
    assert_eq!(result.rows_affected, 2);
    let count = harness.execute("SELECT count(*) FROM b", vec![]).unwrap();
    assert_eq!(count.rows[0][0], SqlValue::BigInt(5));
}

#[test]
fn copy_loads_a_csv_file() {
    let harness = Harness::new();
    let path = std::env::temp_dir().join(format!(
        "quill_copy_test_{}.csv",
        std::process::id()
    ));
    std::fs::write(&path, "7,seven\n8,eight\n").unwrap();

    let result = harness
        .execute(&format!("COPY a FROM '{}'", path.display()), vec![])
        .unwrap();
    assert_eq!(result.rows_affected, 2);
    let rows = harness
        .execute("SELECT a2 FROM a ORDER BY a1", vec![])
        .unwrap();
    assert_eq!(rows.rows.len(), 2);
    assert_eq!(rows.rows[0][0], SqlValue::Varchar("seven".into()));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn explain_produces_a_plan_rendering() {
    let harness = Harness::new();
    seed_rows(&harness);
    let txn = harness.txn_manager.begin();
    let bound = harness
        .bind(&txn, "EXPLAIN SELECT a1 FROM a WHERE a1 < 5")
        .unwrap();
    let BoundStatement::Explain(inner) = bound else {
        panic!("expected explain");
    };
    let accessor = harness
        .catalog
        .accessor(harness.db, Arc::clone(&txn))
        .unwrap();
    let transformed = plan::transform(&inner).unwrap();
    let optimizer = Optimizer::new(Box::<TrivialCostModel>::default(), 5000);
    let physical = optimizer.optimize(&accessor, &transformed).unwrap();
    let lines = physical.explain_lines();
    assert!(lines.iter().any(|l| l.contains("SeqScan")), "{lines:?}");
    assert!(lines.iter().any(|l| l.contains("Projection")), "{lines:?}");
    harness.txn_manager.abort(&txn);
}

#[test]
fn physical_plans_round_trip_through_json() {
    let harness = Harness::new();
    seed_rows(&harness);
    let result = harness
        .execute("SELECT a1 FROM a WHERE a1 < 5 ORDER BY a1", vec![])
        .unwrap();
    let json = result.plan.to_json();
    let back = PlanNode::from_json(&json).unwrap();
    assert_eq!(back, result.plan);
}

#[test]
fn uncommitted_ddl_is_private_to_its_transaction() {
    let harness = Harness::new();
    let txn = harness.txn_manager.begin();
    harness
        .execute_in(&txn, "CREATE TABLE private_t (x INT)", vec![])
        .unwrap();
    // Visible inside the transaction.
    harness
        .execute_in(&txn, "SELECT x FROM private_t", vec![])
        .unwrap();
    // Invisible to a concurrent snapshot.
    let other = harness.txn_manager.begin();
    let err = harness
        .execute_in(&other, "SELECT x FROM private_t", vec![])
        .unwrap_err();
    assert_eq!(err.sqlstate(), "42P01");
    harness.txn_manager.abort(&other);
    harness.txn_manager.abort(&txn);
}

#[test]
fn schema_objects_support_layouts() {
    // Guard against drift between catalog schemas and storage layouts.
    let schema = Schema::new(vec![
        Column::new("k", SqlTypeId::Integer, false),
        Column::new("v", SqlTypeId::Varchar, true),
    ]);
    assert!(schema.full_layout().is_ok());
}
