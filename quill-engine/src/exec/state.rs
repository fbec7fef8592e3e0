//! Query state: the caller-allocated scalar byte region plus the object
//! slot table holding runtime structures (hash tables, sorters, buffers,
//! storage writers). Raw pointers in the original's state structs become
//! slot indexes here; every slot has matched init and teardown emitted by
//! the owning translator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use quill_catalog::{IndexOid, IndexSchema, Schema, TableOid};
use quill_storage::{Index, SqlTable, SqlValue};

use crate::error::QueryError;
use crate::exec::ir::AggState;

/// One build-side row of a join hash table, with the match flag left outer
/// joins consult when draining unmatched rows.
#[derive(Debug)]
pub struct BuildRow {
    pub values: Vec<SqlValue>,
    pub matched: AtomicBool,
}

#[derive(Debug, Default)]
pub struct JoinHashTable {
    pub map: Mutex<HashMap<Vec<u8>, Vec<BuildRow>>>,
}

impl JoinHashTable {
    pub fn insert(&self, key: Vec<u8>, values: Vec<SqlValue>) {
        self.map.lock().unwrap().entry(key).or_default().push(BuildRow {
            values,
            matched: AtomicBool::new(false),
        });
    }
}

#[derive(Debug)]
pub struct AggGroup {
    pub keys: Vec<SqlValue>,
    pub states: Vec<AggState>,
}

#[derive(Debug, Default)]
pub struct AggregationHashTable {
    pub map: Mutex<HashMap<Vec<u8>, AggGroup>>,
}

/// Single-group payload for aggregation without GROUP BY.
#[derive(Debug, Default)]
pub struct StaticAggPayload {
    pub states: Mutex<Vec<AggState>>,
}

/// Sort-build state; rows carry their memcmp-comparable key prefix so the
/// scan side is a plain byte sort. Descending keys store complemented
/// bytes.
#[derive(Debug, Default)]
pub struct Sorter {
    pub rows: Mutex<Vec<(Vec<u8>, Vec<SqlValue>)>>,
    pub limit: Option<usize>,
}

impl Sorter {
    /// Sort and truncate to the top-K bound, returning the payload rows.
    pub fn finish(&self) -> Vec<Vec<SqlValue>> {
        let mut rows = std::mem::take(&mut *self.rows.lock().unwrap());
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows.into_iter().map(|(_, values)| values).collect()
    }
}

/// Materialized intermediate rows: CTE contents and nested-loop inners.
#[derive(Debug, Default)]
pub struct RowBuffer {
    pub rows: Mutex<Vec<Vec<SqlValue>>>,
}

/// Streaming-aggregation run state: the key of the group currently being
/// accumulated.
#[derive(Debug, Default)]
pub struct GroupRun {
    pub current: Mutex<Option<(Vec<u8>, Vec<SqlValue>, Vec<AggState>)>>,
}

/// Table write handle plus the index maintenance set, resolved once per
/// query at state-initialization time.
pub struct StorageWriter {
    pub table_oid: TableOid,
    pub table: Arc<SqlTable>,
    pub schema: Arc<Schema>,
    pub indexes: Vec<(IndexOid, Arc<dyn Index>, Arc<IndexSchema>)>,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("table_oid", &self.table_oid)
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

#[derive(Debug)]
pub enum StateObject {
    JoinTable(JoinHashTable),
    AggTable(AggregationHashTable),
    StaticAgg(StaticAggPayload),
    Sorter(Sorter),
    Buffer(RowBuffer),
    Run(GroupRun),
    Writer(StorageWriter),
}

/// The per-query state threaded through every fragment function: an opaque
/// byte array of the compiled `query_state_size` for scalar slots, and the
/// object table for runtime structures.
pub struct QueryState {
    bytes: Mutex<Vec<u8>>,
    objects: Mutex<Vec<Option<Arc<StateObject>>>>,
}

impl QueryState {
    pub fn new(byte_size: usize, object_slots: usize) -> Self {
        QueryState {
            bytes: Mutex::new(vec![0u8; byte_size]),
            objects: Mutex::new((0..object_slots).map(|_| None).collect()),
        }
    }

    pub fn byte_size(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn install(&self, slot: usize, object: StateObject) {
        let mut objects = self.objects.lock().unwrap();
        objects[slot] = Some(Arc::new(object));
    }

    pub fn object(&self, slot: usize) -> Result<Arc<StateObject>, QueryError> {
        self.objects
            .lock()
            .unwrap()
            .get(slot)
            .and_then(|o| o.clone())
            .ok_or_else(|| {
                QueryError::Codegen(format!("query-state slot {slot} is not initialized"))
            })
    }

    pub fn clear(&self, slot: usize) {
        if let Some(entry) = self.objects.lock().unwrap().get_mut(slot) {
            *entry = None;
        }
    }

    /// Read a u64 counter from the scalar byte region.
    pub fn read_u64(&self, offset: usize) -> u64 {
        let bytes = self.bytes.lock().unwrap();
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        let mut bytes = self.bytes.lock().unwrap();
        bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Increment and return the new counter value.
    pub fn bump_u64(&self, offset: usize) -> u64 {
        let mut bytes = self.bytes.lock().unwrap();
        let current = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        let next = current + 1;
        bytes[offset..offset + 8].copy_from_slice(&next.to_le_bytes());
        next
    }
}

impl std::fmt::Debug for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("byte_size", &self.byte_size())
            .field("object_slots", &self.objects.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_live_in_the_byte_region() {
        let qs = QueryState::new(16, 0);
        assert_eq!(qs.read_u64(0), 0);
        qs.bump_u64(0);
        qs.bump_u64(0);
        qs.write_u64(8, 99);
        assert_eq!(qs.read_u64(0), 2);
        assert_eq!(qs.read_u64(8), 99);
    }

    #[test]
    fn object_slots_install_and_clear() {
        let qs = QueryState::new(0, 2);
        assert!(qs.object(0).is_err());
        qs.install(0, StateObject::Buffer(RowBuffer::default()));
        assert!(matches!(*qs.object(0).unwrap(), StateObject::Buffer(_)));
        qs.clear(0);
        assert!(qs.object(0).is_err());
    }
}
