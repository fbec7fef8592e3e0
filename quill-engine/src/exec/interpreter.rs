//! The IR interpreter: executes fragment functions against the query state.
//! Pipelines run row-at-a-time in a push model; a parallel pipeline
//! partitions its scan range across workers joined by a barrier.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, warn};

use quill_catalog::{ColumnOid, IndexSchema, Schema, TableOid};
use quill_storage::{
    encode_sort_key, Index, SqlValue, SqlTypeId, TransactionContext, TupleSlot,
};

use crate::error::{QueryError, RuntimeError};
use crate::exec::context::ExecutionContext;
use crate::exec::ir::{AggState, IrExpr};
use crate::exec::pipeline::{
    DdlOp, FunctionBody, IrFunction, PipelineProgram, PipelineStep, SourceStep, StateInit,
};
use crate::exec::state::{
    AggGroup, AggregationHashTable, GroupRun, JoinHashTable, QueryState, RowBuffer, Sorter,
    StateObject, StaticAggPayload, StorageWriter,
};

const PARALLEL_WORKERS: u32 = 4;

/// A row in flight: the value vector plus the tuple slot when the row still
/// identifies a base-table tuple (required by update/delete sinks).
#[derive(Debug, Clone)]
pub struct Row {
    pub values: Vec<SqlValue>,
    pub slot: Option<TupleSlot>,
}

pub fn run_function(
    function: &IrFunction,
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
) -> Result<(), QueryError> {
    match &function.body {
        FunctionBody::InitState(inits) => {
            for init in inits {
                install_state(init, ctx, qs)?;
            }
            Ok(())
        }
        FunctionBody::TearDown(slots) => {
            for slot in slots {
                qs.clear(*slot);
            }
            Ok(())
        }
        FunctionBody::Ddl(op) => run_ddl(op, ctx),
        FunctionBody::PipelineWork(program) => run_pipeline(program, ctx, qs),
    }
}

fn install_state(
    init: &StateInit,
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
) -> Result<(), QueryError> {
    match init {
        StateInit::JoinTable { slot } => {
            qs.install(*slot, StateObject::JoinTable(JoinHashTable::default()))
        }
        StateInit::AggTable { slot } => {
            qs.install(*slot, StateObject::AggTable(AggregationHashTable::default()))
        }
        StateInit::StaticAgg { slot, aggs } => {
            let payload = StaticAggPayload::default();
            *payload.states.lock().unwrap() = aggs.iter().map(AggState::new).collect();
            qs.install(*slot, StateObject::StaticAgg(payload));
        }
        StateInit::Sorter { slot, limit } => {
            let sorter = Sorter {
                limit: *limit,
                ..Sorter::default()
            };
            qs.install(*slot, StateObject::Sorter(sorter));
        }
        StateInit::Buffer { slot } => qs.install(*slot, StateObject::Buffer(RowBuffer::default())),
        StateInit::Run { slot } => qs.install(*slot, StateObject::Run(GroupRun::default())),
        StateInit::Writer {
            slot, table_oid, ..
        } => {
            let accessor = ctx.accessor();
            let table = accessor
                .get_table(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("table {table_oid} vanished")))?;
            let schema = accessor
                .get_schema(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("schema for {table_oid} vanished")))?;
            let mut indexes = Vec::new();
            for index_oid in accessor.get_index_oids(*table_oid) {
                if let (Some(index), Some(index_schema)) = (
                    accessor.get_index(index_oid),
                    accessor.get_index_schema(index_oid),
                ) {
                    indexes.push((index_oid, index, index_schema));
                }
            }
            qs.install(
                *slot,
                StateObject::Writer(StorageWriter {
                    table_oid: *table_oid,
                    table,
                    schema,
                    indexes,
                }),
            );
        }
    }
    Ok(())
}

fn run_ddl(op: &DdlOp, ctx: &ExecutionContext<'_>) -> Result<(), QueryError> {
    let accessor = ctx.accessor();
    match op {
        DdlOp::CreateTable {
            namespace,
            name,
            columns,
            if_not_exists,
        } => {
            if accessor.get_table_oid_in(*namespace, name).is_some() {
                if *if_not_exists {
                    debug!("relation \"{name}\" already exists, skipping");
                    return Ok(());
                }
                return Err(quill_catalog::CatalogError::DuplicateRelation(name.clone()).into());
            }
            accessor.create_table(*namespace, name, quill_catalog::Schema::new(columns.clone()))?;
            Ok(())
        }
        DdlOp::CreateIndex {
            namespace,
            name,
            table_oid,
            key_columns,
            unique,
            if_not_exists,
        } => {
            if accessor.get_index_oid(name).is_some() {
                if *if_not_exists {
                    debug!("index \"{name}\" already exists, skipping");
                    return Ok(());
                }
                return Err(quill_catalog::CatalogError::DuplicateRelation(name.clone()).into());
            }
            accessor.create_index(*namespace, name, *table_oid, key_columns.clone(), *unique)?;
            Ok(())
        }
        DdlOp::DropTable {
            table_oid,
            if_exists,
        } => match table_oid {
            Some(oid) => {
                accessor.delete_table(*oid)?;
                Ok(())
            }
            None if *if_exists => Ok(()),
            None => Err(QueryError::Codegen("unresolved DROP TABLE target".into())),
        },
        DdlOp::DropIndex {
            index_oid,
            if_exists,
        } => match index_oid {
            Some(oid) => {
                accessor.delete_index(*oid)?;
                Ok(())
            }
            None if *if_exists => Ok(()),
            None => Err(QueryError::Codegen("unresolved DROP INDEX target".into())),
        },
    }
}

fn run_pipeline(
    program: &PipelineProgram,
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
) -> Result<(), QueryError> {
    if program.parallel && ctx.settings().parallel_execution() {
        if program.steps.iter().any(|s| s.is_serial_only()) {
            unreachable!("serial-only pipeline compiled for parallel execution");
        }
        if let SourceStep::SeqScan { table_oid, .. } = &program.source {
            return launch_work(program, *table_oid, ctx, qs);
        }
    }
    run_partition(program, ctx, qs, None)
}

/// Dispatch one worker per scan partition and join at the barrier.
fn launch_work(
    program: &PipelineProgram,
    table_oid: TableOid,
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
) -> Result<(), QueryError> {
    let table = ctx
        .accessor()
        .get_table(table_oid)
        .ok_or_else(|| QueryError::Codegen(format!("table {table_oid} vanished")))?;
    let total = table.num_slots();
    let workers = PARALLEL_WORKERS.min(total.max(1));
    let chunk = total.div_ceil(workers).max(1);

    let mut first_error = None;
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for worker in 0..workers {
            let begin = worker * chunk;
            let end = (begin + chunk).min(total);
            if begin >= end {
                continue;
            }
            handles.push(scope.spawn(move || run_partition(program, ctx, qs, Some((begin, end)))));
        }
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(QueryError::Codegen("worker panicked".into()));
                }
            }
        }
    });
    match first_error {
        Some(e) => Err(e),
        None => finish_steps(&program.steps, ctx, qs),
    }
}

fn run_partition(
    program: &PipelineProgram,
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
    partition: Option<(u32, u32)>,
) -> Result<(), QueryError> {
    let rows = source_rows(&program.source, ctx, qs, partition)?;
    for row in rows {
        push_row(row, &program.steps, ctx, qs)?;
    }
    if partition.is_none() {
        finish_steps(&program.steps, ctx, qs)?;
    }
    Ok(())
}

fn scan_projection(
    schema: &Schema,
    column_oids: &[ColumnOid],
) -> Result<quill_storage::ProjectedRowInitializer, QueryError> {
    Ok(schema.layout_for(column_oids)?)
}

fn source_rows(
    source: &SourceStep,
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
    partition: Option<(u32, u32)>,
) -> Result<Vec<Row>, QueryError> {
    let accessor = ctx.accessor();
    match source {
        SourceStep::SeqScan {
            table_oid,
            column_oids,
            filter,
            ..
        } => {
            let table = accessor
                .get_table(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("table {table_oid} vanished")))?;
            let schema = accessor
                .get_schema(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("schema for {table_oid} vanished")))?;
            let layout = scan_projection(&schema, column_oids)?;
            let (begin, end) = partition.unwrap_or((0, u32::MAX));
            let mut rows = Vec::new();
            for (slot, prow) in table.scan_partition(accessor.txn(), &layout, begin, end) {
                let values = project_values(&schema, column_oids, &prow);
                if let Some(filter) = filter {
                    if !filter.matches(&values, ctx.params())? {
                        continue;
                    }
                }
                rows.push(Row {
                    values,
                    slot: Some(slot),
                });
            }
            Ok(rows)
        }

        SourceStep::IndexScan {
            table_oid,
            index_oid,
            column_oids,
            lo,
            hi,
            descending,
            filter,
            ..
        } => {
            let table = accessor
                .get_table(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("table {table_oid} vanished")))?;
            let schema = accessor
                .get_schema(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("schema for {table_oid} vanished")))?;
            let index = accessor
                .get_index(*index_oid)
                .ok_or_else(|| QueryError::Codegen(format!("index {index_oid} vanished")))?;
            let layout = scan_projection(&schema, column_oids)?;

            let encode_bound = |exprs: &Option<Vec<IrExpr>>| -> Result<Option<Vec<u8>>, QueryError> {
                match exprs {
                    None => Ok(None),
                    Some(exprs) => {
                        let mut key = Vec::new();
                        for expr in exprs {
                            let value = expr.eval(&[], ctx.params())?;
                            encode_sort_key(&value, &mut key);
                        }
                        Ok(Some(key))
                    }
                }
            };
            let lo_key = encode_bound(lo)?;
            let hi_key = encode_bound(hi)?;

            let mut rows = Vec::new();
            for (_, slot) in index.scan_range(
                accessor.txn(),
                lo_key.as_deref(),
                hi_key.as_deref(),
                *descending,
            ) {
                // The index may hold entries from other snapshots; tuple
                // visibility is decided by the table.
                let Some(prow) = table.select(accessor.txn(), slot, &layout) else {
                    continue;
                };
                let values = project_values(&schema, column_oids, &prow);
                if let Some(filter) = filter {
                    if !filter.matches(&values, ctx.params())? {
                        continue;
                    }
                }
                rows.push(Row {
                    values,
                    slot: Some(slot),
                });
            }
            Ok(rows)
        }

        SourceStep::AggIter { slot, having } => {
            let object = qs.object(*slot)?;
            let StateObject::AggTable(table) = &*object else {
                return Err(QueryError::Codegen("slot is not an aggregation table".into()));
            };
            let map = table.map.lock().unwrap();
            let mut rows = Vec::new();
            for group in map.values() {
                let mut values = group.keys.clone();
                values.extend(group.states.iter().map(|s| s.finalize()));
                if let Some(having) = having {
                    if !having.eval_predicate(&values, ctx.params())? {
                        continue;
                    }
                }
                rows.push(Row { values, slot: None });
            }
            Ok(rows)
        }

        SourceStep::StaticAggRead { slot, having } => {
            let object = qs.object(*slot)?;
            let StateObject::StaticAgg(payload) = &*object else {
                return Err(QueryError::Codegen("slot is not a static aggregate".into()));
            };
            let values: Vec<SqlValue> = payload
                .states
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.finalize())
                .collect();
            if let Some(having) = having {
                if !having.eval_predicate(&values, ctx.params())? {
                    return Ok(Vec::new());
                }
            }
            Ok(vec![Row { values, slot: None }])
        }

        SourceStep::SorterIter { slot } => {
            let object = qs.object(*slot)?;
            let StateObject::Sorter(sorter) = &*object else {
                return Err(QueryError::Codegen("slot is not a sorter".into()));
            };
            Ok(sorter
                .finish()
                .into_iter()
                .map(|values| Row { values, slot: None })
                .collect())
        }

        SourceStep::BufferIter { slot } => {
            let object = qs.object(*slot)?;
            let StateObject::Buffer(buffer) = &*object else {
                return Err(QueryError::Codegen("slot is not a row buffer".into()));
            };
            let rows = buffer
                .rows
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .map(|values| Row { values, slot: None })
                .collect();
            Ok(rows)
        }

        SourceStep::UnmatchedBuildIter { slot, probe_arity } => {
            let object = qs.object(*slot)?;
            let StateObject::JoinTable(table) = &*object else {
                return Err(QueryError::Codegen("slot is not a join table".into()));
            };
            let map = table.map.lock().unwrap();
            let mut rows = Vec::new();
            for build_rows in map.values() {
                for build_row in build_rows {
                    if !build_row.matched.load(std::sync::atomic::Ordering::Acquire) {
                        let mut values = build_row.values.clone();
                        values.extend(std::iter::repeat(SqlValue::Null).take(*probe_arity));
                        rows.push(Row { values, slot: None });
                    }
                }
            }
            Ok(rows)
        }

        SourceStep::Values { rows } => {
            let mut out = Vec::with_capacity(rows.len());
            for exprs in rows {
                let mut values = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    values.push(expr.eval(&[], ctx.params())?);
                }
                out.push(Row { values, slot: None });
            }
            Ok(out)
        }

        SourceStep::CsvScan { path, types } => read_csv(path, types),
    }
}

fn project_values(
    schema: &Schema,
    column_oids: &[ColumnOid],
    prow: &quill_storage::ProjectedRow,
) -> Vec<SqlValue> {
    column_oids
        .iter()
        .map(|oid| {
            schema
                .column_by_oid(*oid)
                .map(|c| prow.value_by_col_id(c.col_id()))
                .unwrap_or(SqlValue::Null)
        })
        .collect()
}

fn read_csv(path: &str, types: &[SqlTypeId]) -> Result<Vec<Row>, QueryError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| RuntimeError::FileRead(path.to_string(), e.to_string()))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| RuntimeError::FileRead(path.to_string(), e.to_string()))?;
        let mut values = Vec::with_capacity(types.len());
        for (index, type_id) in types.iter().enumerate() {
            let field = record.get(index).unwrap_or("").trim();
            values.push(parse_csv_field(field, *type_id)?);
        }
        rows.push(Row { values, slot: None });
    }
    Ok(rows)
}

fn parse_csv_field(field: &str, type_id: SqlTypeId) -> Result<SqlValue, QueryError> {
    if field.is_empty() {
        return Ok(SqlValue::Null);
    }
    let bad = || RuntimeError::InvalidCast(SqlTypeId::Varchar, type_id);
    Ok(match type_id {
        SqlTypeId::Boolean => SqlValue::Boolean(matches!(field, "t" | "true" | "1" | "T")),
        SqlTypeId::TinyInt => SqlValue::TinyInt(field.parse().map_err(|_| bad())?),
        SqlTypeId::SmallInt => SqlValue::SmallInt(field.parse().map_err(|_| bad())?),
        SqlTypeId::Integer => SqlValue::Integer(field.parse().map_err(|_| bad())?),
        SqlTypeId::BigInt => SqlValue::BigInt(field.parse().map_err(|_| bad())?),
        SqlTypeId::Real => SqlValue::Real(field.parse().map_err(|_| bad())?),
        SqlTypeId::Varchar | SqlTypeId::Invalid => SqlValue::Varchar(field.to_string()),
        SqlTypeId::Date => SqlValue::Date(
            NaiveDate::parse_from_str(field, "%Y-%m-%d").map_err(|_| bad())?,
        ),
        SqlTypeId::Timestamp => SqlValue::Timestamp(
            NaiveDateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S"))
                .map_err(|_| bad())?,
        ),
    })
}

fn encode_key(exprs: &[IrExpr], row: &[SqlValue], params: &[SqlValue]) -> Result<Vec<u8>, QueryError> {
    let mut key = Vec::new();
    for expr in exprs {
        let value = expr.eval(row, params)?;
        encode_sort_key(&value, &mut key);
    }
    Ok(key)
}

fn push_row(
    row: Row,
    steps: &[PipelineStep],
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
) -> Result<(), QueryError> {
    let Some((step, rest)) = steps.split_first() else {
        return Ok(());
    };
    match step {
        PipelineStep::Filter { predicate } => {
            if predicate.eval_predicate(&row.values, ctx.params())? {
                push_row(row, rest, ctx, qs)?;
            }
            Ok(())
        }

        PipelineStep::Project { exprs } => {
            let mut values = Vec::with_capacity(exprs.len());
            for expr in exprs {
                values.push(expr.eval(&row.values, ctx.params())?);
            }
            push_row(
                Row {
                    values,
                    slot: row.slot,
                },
                rest,
                ctx,
                qs,
            )
        }

        PipelineStep::HashJoinBuild { slot, keys } => {
            let key = encode_key(keys, &row.values, ctx.params())?;
            let object = qs.object(*slot)?;
            let StateObject::JoinTable(table) = &*object else {
                return Err(QueryError::Codegen("slot is not a join table".into()));
            };
            table.insert(key, row.values);
            Ok(())
        }

        PipelineStep::HashJoinProbe {
            slot,
            keys,
            kind: _,
            build_arity: _,
            residual,
        } => {
            let key = encode_key(keys, &row.values, ctx.params())?;
            let object = qs.object(*slot)?;
            let StateObject::JoinTable(table) = &*object else {
                return Err(QueryError::Codegen("slot is not a join table".into()));
            };
            // Collect matches under the lock, emit after releasing it.
            let mut combined_rows = Vec::new();
            {
                let map = table.map.lock().unwrap();
                if let Some(build_rows) = map.get(&key) {
                    for build_row in build_rows {
                        let mut combined = build_row.values.clone();
                        combined.extend(row.values.iter().cloned());
                        if let Some(residual) = residual {
                            if !residual.eval_predicate(&combined, ctx.params())? {
                                continue;
                            }
                        }
                        build_row
                            .matched
                            .store(true, std::sync::atomic::Ordering::Release);
                        combined_rows.push(combined);
                    }
                }
            }
            for values in combined_rows {
                push_row(Row { values, slot: None }, rest, ctx, qs)?;
            }
            Ok(())
        }

        PipelineStep::NestedLoop {
            buffer_slot,
            kind,
            condition,
            inner_arity,
        } => {
            let object = qs.object(*buffer_slot)?;
            let StateObject::Buffer(buffer) = &*object else {
                return Err(QueryError::Codegen("slot is not a row buffer".into()));
            };
            let inner_rows = buffer.rows.lock().unwrap().clone();
            let mut matched = false;
            for inner in inner_rows {
                let mut combined = row.values.clone();
                combined.extend(inner);
                let passes = match condition {
                    Some(condition) => condition.eval_predicate(&combined, ctx.params())?,
                    None => true,
                };
                if passes {
                    matched = true;
                    push_row(
                        Row {
                            values: combined,
                            slot: None,
                        },
                        rest,
                        ctx,
                        qs,
                    )?;
                }
            }
            if !matched && *kind == crate::binder::statement::JoinKind::Left {
                let mut values = row.values;
                values.extend(std::iter::repeat(SqlValue::Null).take(*inner_arity));
                push_row(Row { values, slot: None }, rest, ctx, qs)?;
            }
            Ok(())
        }

        PipelineStep::IndexJoin {
            table_oid,
            index_oid,
            keys,
            column_oids,
            ..
        } => {
            let accessor = ctx.accessor();
            let index = accessor
                .get_index(*index_oid)
                .ok_or_else(|| QueryError::Codegen(format!("index {index_oid} vanished")))?;
            let table = accessor
                .get_table(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("table {table_oid} vanished")))?;
            let schema = accessor
                .get_schema(*table_oid)
                .ok_or_else(|| QueryError::Codegen(format!("schema for {table_oid} vanished")))?;
            let layout = scan_projection(&schema, column_oids)?;

            let key = encode_key(keys, &row.values, ctx.params())?;
            for slot in index.scan_key(accessor.txn(), &key) {
                let Some(prow) = table.select(accessor.txn(), slot, &layout) else {
                    continue;
                };
                let mut values = row.values.clone();
                values.extend(project_values(&schema, column_oids, &prow));
                push_row(Row { values, slot: None }, rest, ctx, qs)?;
            }
            Ok(())
        }

        PipelineStep::AggBuild { slot, group, aggs } => {
            let key = encode_key(group, &row.values, ctx.params())?;
            let object = qs.object(*slot)?;
            let StateObject::AggTable(table) = &*object else {
                return Err(QueryError::Codegen("slot is not an aggregation table".into()));
            };
            let mut map = table.map.lock().unwrap();
            let entry = match map.entry(key) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let mut keys = Vec::with_capacity(group.len());
                    for expr in group {
                        keys.push(expr.eval(&row.values, ctx.params())?);
                    }
                    e.insert(AggGroup {
                        keys,
                        states: aggs.iter().map(AggState::new).collect(),
                    })
                }
            };
            update_agg_states(&mut entry.states, aggs, &row.values, ctx)?;
            Ok(())
        }

        PipelineStep::SortedAgg {
            slot,
            group,
            aggs,
            having,
        } => {
            let key = encode_key(group, &row.values, ctx.params())?;
            let object = qs.object(*slot)?;
            let StateObject::Run(run) = &*object else {
                return Err(QueryError::Codegen("slot is not a group run".into()));
            };
            let flushed = {
                let mut current = run.current.lock().unwrap();
                match current.take() {
                    Some((prev_key, prev_values, mut states)) if prev_key == key => {
                        update_agg_states(&mut states, aggs, &row.values, ctx)?;
                        *current = Some((prev_key, prev_values, states));
                        None
                    }
                    other => {
                        let mut keys = Vec::with_capacity(group.len());
                        for expr in group {
                            keys.push(expr.eval(&row.values, ctx.params())?);
                        }
                        let mut states: Vec<AggState> = aggs.iter().map(AggState::new).collect();
                        update_agg_states(&mut states, aggs, &row.values, ctx)?;
                        *current = Some((key, keys, states));
                        other
                    }
                }
            };
            if let Some((_, keys, states)) = flushed {
                emit_group(keys, &states, having, rest, ctx, qs)?;
            }
            Ok(())
        }

        PipelineStep::StaticAggBuild { slot, aggs } => {
            let object = qs.object(*slot)?;
            let StateObject::StaticAgg(payload) = &*object else {
                return Err(QueryError::Codegen("slot is not a static aggregate".into()));
            };
            let mut states = payload.states.lock().unwrap();
            update_agg_states(&mut states, aggs, &row.values, ctx)?;
            Ok(())
        }

        PipelineStep::SortBuild { slot, keys } => {
            let mut key = Vec::new();
            for (expr, descending) in keys {
                let value = expr.eval(&row.values, ctx.params())?;
                let start = key.len();
                encode_sort_key(&value, &mut key);
                if *descending {
                    for byte in &mut key[start..] {
                        *byte = !*byte;
                    }
                }
            }
            let object = qs.object(*slot)?;
            let StateObject::Sorter(sorter) = &*object else {
                return Err(QueryError::Codegen("slot is not a sorter".into()));
            };
            sorter.rows.lock().unwrap().push((key, row.values));
            Ok(())
        }

        PipelineStep::BufferFill { slot } => {
            let object = qs.object(*slot)?;
            let StateObject::Buffer(buffer) = &*object else {
                return Err(QueryError::Codegen("slot is not a row buffer".into()));
            };
            buffer.rows.lock().unwrap().push(row.values);
            Ok(())
        }

        PipelineStep::Limit {
            counter_offset,
            limit,
            offset,
        } => {
            let seen = qs.bump_u64(*counter_offset);
            if seen <= *offset {
                return Ok(());
            }
            if *limit != u64::MAX && seen - offset > *limit {
                return Ok(());
            }
            push_row(row, rest, ctx, qs)
        }

        PipelineStep::Output { arity } => {
            let mut values = row.values;
            values.truncate(*arity);
            ctx.push_output(values);
            Ok(())
        }

        PipelineStep::InsertSink { writer_slot } => {
            let object = qs.object(*writer_slot)?;
            let StateObject::Writer(writer) = &*object else {
                return Err(QueryError::Codegen("slot is not a storage writer".into()));
            };
            insert_row(writer, &row.values, ctx)?;
            ctx.add_rows_affected(1);
            Ok(())
        }

        PipelineStep::UpdateSink {
            writer_slot,
            assignments,
        } => {
            let object = qs.object(*writer_slot)?;
            let StateObject::Writer(writer) = &*object else {
                return Err(QueryError::Codegen("slot is not a storage writer".into()));
            };
            let slot = row
                .slot
                .ok_or_else(|| QueryError::Codegen("update input lost its tuple slot".into()))?;
            update_row(writer, slot, &row.values, assignments, ctx)?;
            ctx.add_rows_affected(1);
            Ok(())
        }

        PipelineStep::DeleteSink { writer_slot } => {
            let object = qs.object(*writer_slot)?;
            let StateObject::Writer(writer) = &*object else {
                return Err(QueryError::Codegen("slot is not a storage writer".into()));
            };
            let slot = row
                .slot
                .ok_or_else(|| QueryError::Codegen("delete input lost its tuple slot".into()))?;
            delete_row(writer, slot, &row.values, ctx)?;
            ctx.add_rows_affected(1);
            Ok(())
        }
    }
}

fn update_agg_states(
    states: &mut [AggState],
    aggs: &[crate::exec::ir::AggSpec],
    row: &[SqlValue],
    ctx: &ExecutionContext<'_>,
) -> Result<(), QueryError> {
    for (state, spec) in states.iter_mut().zip(aggs) {
        let value = match &spec.arg {
            Some(arg) => arg.eval(row, ctx.params())?,
            None => SqlValue::Boolean(true), // count(*) counts rows
        };
        state.update(&value)?;
    }
    Ok(())
}

fn emit_group(
    keys: Vec<SqlValue>,
    states: &[AggState],
    having: &Option<IrExpr>,
    rest: &[PipelineStep],
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
) -> Result<(), QueryError> {
    let mut values = keys;
    values.extend(states.iter().map(|s| s.finalize()));
    if let Some(having) = having {
        if !having.eval_predicate(&values, ctx.params())? {
            return Ok(());
        }
    }
    push_row(Row { values, slot: None }, rest, ctx, qs)
}

/// Steps with end-of-input behavior flush here, in declaration order.
fn finish_steps(
    steps: &[PipelineStep],
    ctx: &ExecutionContext<'_>,
    qs: &QueryState,
) -> Result<(), QueryError> {
    for (index, step) in steps.iter().enumerate() {
        if let PipelineStep::SortedAgg {
            slot, having, ..
        } = step
        {
            let object = qs.object(*slot)?;
            let StateObject::Run(run) = &*object else {
                continue;
            };
            let flushed = run.current.lock().unwrap().take();
            if let Some((_, keys, states)) = flushed {
                emit_group(keys, &states, having, &steps[index + 1..], ctx, qs)?;
            }
        }
    }
    Ok(())
}

// ---- DML helpers ----

fn index_key_from_values(
    index_schema: &IndexSchema,
    schema: &Schema,
    values: &[SqlValue],
) -> Vec<u8> {
    let mut key = Vec::new();
    for key_column in index_schema.columns() {
        let value = schema
            .columns()
            .iter()
            .position(|c| c.oid() == key_column.column_oid)
            .and_then(|i| values.get(i))
            .cloned()
            .unwrap_or(SqlValue::Null);
        encode_sort_key(&value, &mut key);
    }
    key
}

fn check_not_null(writer: &StorageWriter, values: &[SqlValue]) -> Result<(), QueryError> {
    for (column, value) in writer.schema.columns().iter().zip(values) {
        if !column.nullable() && value.is_null() {
            return Err(RuntimeError::NotNullViolation(column.name().to_string()).into());
        }
    }
    Ok(())
}

/// Insert a full row (values in schema order) and maintain every index.
/// Aborted inserts compensate through the transaction's deferred actions.
fn insert_row(
    writer: &StorageWriter,
    values: &[SqlValue],
    ctx: &ExecutionContext<'_>,
) -> Result<(), QueryError> {
    check_not_null(writer, values)?;
    let txn = ctx.accessor().txn();
    let mut prow = writer.table.layout().initialize_row();
    for (column, value) in writer.schema.columns().iter().zip(values) {
        let position = prow
            .position_of(column.col_id())
            .ok_or_else(|| QueryError::Codegen("row layout out of sync with schema".into()))?;
        prow.set_value(position, value)?;
    }
    let slot = writer.table.insert(txn, prow)?;

    for (_, index, index_schema) in &writer.indexes {
        let key = index_key_from_values(index_schema, &writer.schema, values);
        let inserted = if index_schema.unique() {
            index.insert_unique(txn, &key, slot)
        } else {
            index.insert(txn, &key, slot);
            true
        };
        if !inserted {
            return Err(RuntimeError::UniqueViolation.into());
        }
        register_index_abort_compensation(txn, Arc::clone(index), key, slot);
    }
    Ok(())
}

fn update_row(
    writer: &StorageWriter,
    slot: TupleSlot,
    old_values: &[SqlValue],
    assignments: &[(usize, IrExpr)],
    ctx: &ExecutionContext<'_>,
) -> Result<(), QueryError> {
    let txn = ctx.accessor().txn();
    let mut new_values = old_values.to_vec();
    for (column_index, expr) in assignments {
        new_values[*column_index] = expr.eval(old_values, ctx.params())?;
    }
    check_not_null(writer, &new_values)?;

    let mut delta = writer.table.layout().initialize_row();
    for (column_index, _) in assignments {
        let column = writer.schema.column(*column_index);
        let position = delta
            .position_of(column.col_id())
            .ok_or_else(|| QueryError::Codegen("row layout out of sync with schema".into()))?;
        delta.set_value(position, &new_values[*column_index])?;
    }
    if !writer.table.update(txn, slot, &delta)? {
        return Ok(());
    }

    for (_, index, index_schema) in &writer.indexes {
        let old_key = index_key_from_values(index_schema, &writer.schema, old_values);
        let new_key = index_key_from_values(index_schema, &writer.schema, &new_values);
        if old_key == new_key {
            continue;
        }
        let inserted = if index_schema.unique() {
            index.insert_unique(txn, &new_key, slot)
        } else {
            index.insert(txn, &new_key, slot);
            true
        };
        if !inserted {
            return Err(RuntimeError::UniqueViolation.into());
        }
        register_index_abort_compensation(txn, Arc::clone(index), new_key, slot);
        register_index_deferred_delete(txn, Arc::clone(index), old_key, slot);
    }
    Ok(())
}

fn delete_row(
    writer: &StorageWriter,
    slot: TupleSlot,
    values: &[SqlValue],
    ctx: &ExecutionContext<'_>,
) -> Result<(), QueryError> {
    let txn = ctx.accessor().txn();
    if !writer.table.delete(txn, slot)? {
        warn!("delete target {slot} no longer visible");
        return Ok(());
    }
    for (_, index, index_schema) in &writer.indexes {
        let key = index_key_from_values(index_schema, &writer.schema, values);
        register_index_deferred_delete(txn, Arc::clone(index), key, slot);
    }
    Ok(())
}

/// An aborted insert registers a compensating index delete.
fn register_index_abort_compensation(
    txn: &Arc<TransactionContext>,
    index: Arc<dyn Index>,
    key: Vec<u8>,
    slot: TupleSlot,
) {
    let txn_for_action = Arc::clone(txn);
    txn.register_abort_action(move |_| {
        index.delete(&txn_for_action, &key, slot);
    });
}

/// Index deletes are logically deferred until commit.
fn register_index_deferred_delete(
    txn: &Arc<TransactionContext>,
    index: Arc<dyn Index>,
    key: Vec<u8>,
    slot: TupleSlot,
) {
    let txn_for_action = Arc::clone(txn);
    txn.register_commit_action(move |_| {
        index.delete(&txn_for_action, &key, slot);
    });
}
