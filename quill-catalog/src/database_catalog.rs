use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use quill_storage::{
    encode_sort_key, Index, BTreeIndex, ProjectedRow, SqlTable, Timestamp, TransactionContext,
    TransactionManager,
};

use crate::error::CatalogError;
use crate::oid::{
    postgres, DatabaseOid, IndexOid, NamespaceOid, OidAllocator, TableOid,
};
use crate::pg::core::{schema_from_attributes, PgCore};
use crate::pg::language::PgLanguages;
use crate::pg::proc::{PgProcs, ProcRow};
use crate::pg::statistic::PgStatistics;
use crate::pg::types::PgTypes;
use crate::schema::{IndexColumn, IndexSchema, RelKind, Schema};
use crate::statistics::{ColumnStatistics, TableStatistics};

/// Upper bound on the deferred deletions queued per batch during catalog
/// teardown, to keep shutdown latency predictable.
pub const TEARDOWN_MAX_TUPLES: usize = 128;

const DDL_LOCK_HELD: u64 = 1 << 63;

/// Encode the key of `row` under `index`: the order-preserving concatenation
/// of the key columns' values.
pub fn build_index_key(index: &IndexSchema, schema: &Schema, row: &ProjectedRow) -> Vec<u8> {
    let mut key = Vec::new();
    for key_col in index.columns() {
        let value = schema
            .column_by_oid(key_col.column_oid)
            .map(|c| row.value_by_col_id(c.col_id()))
            .unwrap_or(quill_storage::SqlValue::Null);
        encode_sort_key(&value, &mut key);
    }
    key
}

/// The metadata store of one database: the Postgres-style tables, the live
/// table/index object registry, versioned schemas, the OID allocator and
/// the DDL write lock.
pub struct DatabaseCatalog {
    oid: DatabaseOid,
    /// Timestamp word serializing DDL. While held, the high bit is set and
    /// the low bits carry the holder's start timestamp; while free, it
    /// carries the finish timestamp of the last committed DDL.
    write_lock: AtomicU64,
    /// Bumped at commit of every DDL; cached plans compare epochs.
    ddl_epoch: AtomicU64,
    oids: OidAllocator,
    core: PgCore,
    types: PgTypes,
    languages: PgLanguages,
    procs: PgProcs,
    statistics: PgStatistics,
    /// Schema versions per table, newest last, stamped with the installing
    /// transaction's start timestamp.
    schemas: RwLock<HashMap<TableOid, Vec<(Timestamp, Arc<Schema>)>>>,
    index_schemas: RwLock<HashMap<IndexOid, Arc<IndexSchema>>>,
    /// Live object registry; the rel_ptr columns of `pg_class` index into
    /// these maps. Entries are installed exactly once per (oid, generation)
    /// and reclaimed by abort actions or deferred commit actions.
    tables: RwLock<HashMap<TableOid, Arc<SqlTable>>>,
    indexes: RwLock<HashMap<IndexOid, Arc<dyn Index>>>,
}

impl DatabaseCatalog {
    pub(crate) fn new(oid: DatabaseOid) -> Self {
        DatabaseCatalog {
            oid,
            write_lock: AtomicU64::new(0),
            ddl_epoch: AtomicU64::new(0),
            oids: OidAllocator::new(),
            core: PgCore::new(),
            types: PgTypes::new(),
            languages: PgLanguages::new(),
            procs: PgProcs::new(),
            statistics: PgStatistics::new(),
            schemas: RwLock::new(HashMap::new()),
            index_schemas: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn oid(&self) -> DatabaseOid {
        self.oid
    }

    pub fn ddl_epoch(&self) -> u64 {
        self.ddl_epoch.load(Ordering::Acquire)
    }

    pub fn oid_allocator(&self) -> &OidAllocator {
        &self.oids
    }

    /// Seed the namespace, type, language and procedure tables.
    pub(crate) fn bootstrap(&self, txn: &Arc<TransactionContext>) -> Result<(), CatalogError> {
        self.core
            .insert_namespace(txn, postgres::PG_CATALOG_NAMESPACE_OID, "pg_catalog")?;
        self.core
            .insert_namespace(txn, postgres::DEFAULT_NAMESPACE_OID, "public")?;
        self.types.bootstrap(txn)?;
        self.languages.bootstrap(txn)?;
        self.procs.bootstrap(txn, &self.oids)?;
        Ok(())
    }

    /// Attempt to acquire the DDL lock. Succeeds iff the transaction's start
    /// timestamp is not below the last committed DDL and no other
    /// transaction holds the lock; reentrant for the holder. On success the
    /// release is registered on the transaction's commit and abort action
    /// lists.
    pub fn try_lock(self: &Arc<Self>, txn: &Arc<TransactionContext>) -> bool {
        let start = txn.start_ts();
        loop {
            let current = self.write_lock.load(Ordering::Acquire);
            if current & DDL_LOCK_HELD != 0 {
                return current & !DDL_LOCK_HELD == start;
            }
            if start < current {
                // The snapshot predates a committed DDL; the txn must abort.
                return false;
            }
            if self
                .write_lock
                .compare_exchange(
                    current,
                    start | DDL_LOCK_HELD,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let catalog = Arc::clone(self);
                txn.register_commit_action(move |finish| {
                    catalog.ddl_epoch.fetch_add(1, Ordering::AcqRel);
                    catalog.write_lock.store(finish, Ordering::Release);
                });
                let catalog = Arc::clone(self);
                txn.register_abort_action(move |_| {
                    catalog.write_lock.store(current, Ordering::Release);
                });
                debug!("txn@{start} acquired DDL lock on database {}", self.oid);
                return true;
            }
        }
    }

    // ---- namespaces ----

    pub fn create_namespace(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        name: &str,
    ) -> Result<NamespaceOid, CatalogError> {
        if !self.try_lock(txn) {
            return Err(CatalogError::DdlLockConflict);
        }
        if self.get_namespace_oid(txn, name).is_some() {
            return Err(CatalogError::DuplicateNamespace(name.to_string()));
        }
        let oid = self.oids.next_namespace();
        self.core.insert_namespace(txn, oid, name)?;
        Ok(oid)
    }

    pub fn drop_namespace(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        oid: NamespaceOid,
    ) -> Result<bool, CatalogError> {
        if !self.try_lock(txn) {
            return Err(CatalogError::DdlLockConflict);
        }
        let slot = self
            .core
            .namespaces(txn)
            .into_iter()
            .find(|(_, row)| row.oid == oid)
            .map(|(slot, _)| slot);
        match slot {
            Some(slot) => self.core.delete_namespace(txn, slot),
            None => Ok(false),
        }
    }

    pub fn get_namespace_oid(&self, txn: &TransactionContext, name: &str) -> Option<NamespaceOid> {
        self.core
            .namespaces(txn)
            .into_iter()
            .find(|(_, row)| row.name.eq_ignore_ascii_case(name))
            .map(|(_, row)| row.oid)
    }

    // ---- tables ----

    /// Create a table: acquire the DDL lock, allocate OIDs, insert the
    /// `pg_class` and `pg_attribute` rows at the transaction's timestamp,
    /// install the live table object and register its reclaim on abort.
    pub fn create_table(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        namespace: NamespaceOid,
        name: &str,
        mut schema: Schema,
    ) -> Result<TableOid, CatalogError> {
        if !self.try_lock(txn) {
            return Err(CatalogError::DdlLockConflict);
        }
        if self.class_oid_by_name(txn, namespace, name).is_some() {
            return Err(CatalogError::DuplicateRelation(name.to_string()));
        }

        let table_oid = self.oids.next_table();
        schema.assign_identifiers(|| self.oids.next_column(), 1);
        self.core
            .insert_class(txn, table_oid.0, name, namespace, RelKind::Table)?;
        self.core.insert_attributes(txn, table_oid, &schema)?;

        let schema = Arc::new(schema);
        let table = Arc::new(SqlTable::new(schema.full_layout()?));
        self.schemas
            .write()
            .unwrap()
            .insert(table_oid, vec![(txn.start_ts(), Arc::clone(&schema))]);
        self.tables.write().unwrap().insert(table_oid, table);

        let catalog = Arc::clone(self);
        txn.register_abort_action(move |_| {
            catalog.tables.write().unwrap().remove(&table_oid);
            catalog.schemas.write().unwrap().remove(&table_oid);
        });
        debug!("created table {name} with oid {table_oid}");
        Ok(table_oid)
    }

    /// Drop a table and cascade to its attributes, indexes, constraints and
    /// statistics. The live objects are reclaimed by a deferred commit
    /// action so concurrent snapshot readers finish against them; the block
    /// store's GC honors the same watermark for page reclamation.
    pub fn delete_table(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        table_oid: TableOid,
    ) -> Result<bool, CatalogError> {
        if !self.try_lock(txn) {
            return Err(CatalogError::DdlLockConflict);
        }
        let class_slot = self
            .core
            .classes(txn)
            .into_iter()
            .find(|(_, row)| row.oid == table_oid.0 && row.kind == RelKind::Table)
            .map(|(slot, _)| slot);
        let Some(class_slot) = class_slot else {
            return Ok(false);
        };
        self.core.delete_class(txn, class_slot)?;

        for (slot, attr) in self.core.attributes(txn) {
            if attr.rel_oid == table_oid {
                self.core.delete_attribute(txn, slot)?;
            }
        }
        for index_oid in self.get_index_oids(txn, table_oid) {
            self.delete_index_rows(txn, index_oid)?;
        }
        self.statistics.delete_for_table(txn, table_oid)?;

        let catalog = Arc::clone(self);
        txn.register_commit_action(move |_| {
            catalog.tables.write().unwrap().remove(&table_oid);
            catalog.schemas.write().unwrap().remove(&table_oid);
        });
        Ok(true)
    }

    pub fn get_table_oid(
        &self,
        txn: &TransactionContext,
        namespace: NamespaceOid,
        name: &str,
    ) -> Option<TableOid> {
        self.core
            .classes(txn)
            .into_iter()
            .find(|(_, row)| {
                row.kind == RelKind::Table
                    && row.namespace == namespace
                    && row.name.eq_ignore_ascii_case(name)
            })
            .map(|(_, row)| TableOid(row.oid))
    }

    pub fn get_table(&self, table_oid: TableOid) -> Option<Arc<SqlTable>> {
        self.tables.read().unwrap().get(&table_oid).cloned()
    }

    /// Schema version valid at the transaction's snapshot.
    pub fn get_schema(&self, txn: &TransactionContext, table_oid: TableOid) -> Option<Arc<Schema>> {
        let schemas = self.schemas.read().unwrap();
        let versions = schemas.get(&table_oid)?;
        versions
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= txn.start_ts())
            .map(|(_, schema)| Arc::clone(schema))
    }

    /// Replace the schema wholesale. Fresh column OIDs are assigned; they
    /// are not stable across the call. Ownership of `new_schema` transfers
    /// to the catalog.
    pub fn update_schema(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        table_oid: TableOid,
        mut new_schema: Schema,
    ) -> Result<Arc<Schema>, CatalogError> {
        if !self.try_lock(txn) {
            return Err(CatalogError::DdlLockConflict);
        }
        let mut schemas = self.schemas.write().unwrap();
        let versions = schemas
            .get_mut(&table_oid)
            .ok_or_else(|| CatalogError::UnknownRelation(table_oid.to_string()))?;
        let next_version = versions.last().map(|(_, s)| s.version() + 1).unwrap_or(1);
        new_schema.assign_identifiers(|| self.oids.next_column(), next_version);
        let new_schema = Arc::new(new_schema);
        versions.push((txn.start_ts(), Arc::clone(&new_schema)));
        Ok(new_schema)
    }

    // ---- indexes ----

    /// Create an index on `table_oid`, backfilling it from the rows visible
    /// to the creating transaction. A unique index whose backfill finds a
    /// duplicate fails with a unique violation.
    pub fn create_index(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        namespace: NamespaceOid,
        name: &str,
        table_oid: TableOid,
        key_columns: Vec<IndexColumn>,
        unique: bool,
    ) -> Result<IndexOid, CatalogError> {
        if !self.try_lock(txn) {
            return Err(CatalogError::DdlLockConflict);
        }
        if self.class_oid_by_name(txn, namespace, name).is_some() {
            return Err(CatalogError::DuplicateRelation(name.to_string()));
        }
        let schema = self
            .get_schema(txn, table_oid)
            .ok_or_else(|| CatalogError::UnknownRelation(table_oid.to_string()))?;
        let table = self
            .get_table(table_oid)
            .ok_or_else(|| CatalogError::UnknownRelation(table_oid.to_string()))?;

        let index_oid = self.oids.next_index();
        let mut index_schema = IndexSchema::new(table_oid, key_columns, unique);
        index_schema.assign(index_oid);

        self.core
            .insert_class(txn, index_oid.0, name, namespace, RelKind::Index)?;
        self.core.insert_index(txn, &index_schema)?;
        if unique {
            let constraint_oid = self.oids.next_constraint();
            self.core.insert_constraint(
                txn,
                constraint_oid,
                &format!("{name}_key"),
                table_oid,
                index_oid,
            )?;
        }

        let index: Arc<dyn Index> = Arc::new(BTreeIndex::new());
        for (slot, row) in table.scan(txn, table.layout()) {
            let key = build_index_key(&index_schema, &schema, &row);
            let inserted = if unique {
                index.insert_unique(txn, &key, slot)
            } else {
                index.insert(txn, &key, slot);
                true
            };
            if !inserted {
                return Err(CatalogError::Storage(
                    quill_storage::StorageError::UniqueViolation,
                ));
            }
        }

        let index_schema = Arc::new(index_schema);
        self.index_schemas
            .write()
            .unwrap()
            .insert(index_oid, Arc::clone(&index_schema));
        self.indexes.write().unwrap().insert(index_oid, index);

        let catalog = Arc::clone(self);
        txn.register_abort_action(move |_| {
            catalog.indexes.write().unwrap().remove(&index_oid);
            catalog.index_schemas.write().unwrap().remove(&index_oid);
        });
        debug!("created index {name} with oid {index_oid} on table {table_oid}");
        Ok(index_oid)
    }

    pub fn delete_index(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        index_oid: IndexOid,
    ) -> Result<bool, CatalogError> {
        if !self.try_lock(txn) {
            return Err(CatalogError::DdlLockConflict);
        }
        self.delete_index_rows(txn, index_oid)
    }

    fn delete_index_rows(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        index_oid: IndexOid,
    ) -> Result<bool, CatalogError> {
        let class_slot = self
            .core
            .classes(txn)
            .into_iter()
            .find(|(_, row)| row.oid == index_oid.0 && row.kind == RelKind::Index)
            .map(|(slot, _)| slot);
        let Some(class_slot) = class_slot else {
            return Ok(false);
        };
        self.core.delete_class(txn, class_slot)?;
        for (slot, row) in self.core.indexes(txn) {
            if row.oid == index_oid {
                self.core.delete_index(txn, slot)?;
            }
        }
        for (slot, row) in self.core.constraints(txn) {
            if row.index_oid == index_oid {
                self.core.delete_constraint(txn, slot)?;
            }
        }
        let catalog = Arc::clone(self);
        txn.register_commit_action(move |_| {
            catalog.indexes.write().unwrap().remove(&index_oid);
            catalog.index_schemas.write().unwrap().remove(&index_oid);
        });
        Ok(true)
    }

    pub fn get_index_oid(
        &self,
        txn: &TransactionContext,
        namespace: NamespaceOid,
        name: &str,
    ) -> Option<IndexOid> {
        self.core
            .classes(txn)
            .into_iter()
            .find(|(_, row)| {
                row.kind == RelKind::Index
                    && row.namespace == namespace
                    && row.name.eq_ignore_ascii_case(name)
            })
            .map(|(_, row)| IndexOid(row.oid))
    }

    pub fn get_index_oids(&self, txn: &TransactionContext, table_oid: TableOid) -> Vec<IndexOid> {
        self.core
            .indexes(txn)
            .into_iter()
            .filter(|(_, row)| row.table_oid == table_oid)
            .map(|(_, row)| row.oid)
            .collect()
    }

    pub fn get_index(&self, index_oid: IndexOid) -> Option<Arc<dyn Index>> {
        self.indexes.read().unwrap().get(&index_oid).cloned()
    }

    pub fn get_index_schema(&self, index_oid: IndexOid) -> Option<Arc<IndexSchema>> {
        self.index_schemas.read().unwrap().get(&index_oid).cloned()
    }

    // ---- types, languages, procedures ----

    pub fn get_proc(&self, txn: &TransactionContext, name: &str) -> Option<ProcRow> {
        self.procs.find(txn, name)
    }

    pub fn list_types(&self, txn: &TransactionContext) -> Vec<crate::pg::types::TypeRow> {
        self.types.types(txn).into_iter().map(|(_, row)| row).collect()
    }

    pub fn list_languages(
        &self,
        txn: &TransactionContext,
    ) -> Vec<crate::pg::language::LanguageRow> {
        self.languages
            .languages(txn)
            .into_iter()
            .map(|(_, row)| row)
            .collect()
    }

    pub fn list_procs(&self, txn: &TransactionContext) -> Vec<ProcRow> {
        self.procs.procs(txn).into_iter().map(|(_, row)| row).collect()
    }

    // ---- statistics ----

    pub fn record_statistics(
        &self,
        txn: &Arc<TransactionContext>,
        table_oid: TableOid,
        column_oid: crate::oid::ColumnOid,
        stats: ColumnStatistics,
    ) -> Result<(), CatalogError> {
        self.statistics.record(txn, table_oid, column_oid, stats)?;
        Ok(())
    }

    /// Per-column synopsis; absence yields the zero stub the optimizer
    /// treats as "unknown".
    pub fn get_column_statistics(
        &self,
        txn: &TransactionContext,
        table_oid: TableOid,
        column_oid: crate::oid::ColumnOid,
    ) -> ColumnStatistics {
        self.statistics
            .get(txn, table_oid, column_oid)
            .unwrap_or_default()
    }

    pub fn get_table_statistics(
        &self,
        txn: &TransactionContext,
        table_oid: TableOid,
    ) -> TableStatistics {
        let schema = self.get_schema(txn, table_oid);
        let num_columns = schema.as_ref().map(|s| s.columns().len() as u32).unwrap_or(0);
        let num_rows = schema
            .map(|s| {
                s.columns()
                    .iter()
                    .map(|c| self.get_column_statistics(txn, table_oid, c.oid()).num_rows)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        TableStatistics {
            num_rows,
            num_columns,
        }
    }

    /// Rebuild the in-memory side state from the metadata rows, rewinding
    /// the OID counters past every observed allocation.
    pub fn recover_oid_counters(&self, txn: &TransactionContext) {
        for (_, row) in self.core.classes(txn) {
            self.oids.advance_class_to(row.oid);
        }
        for (_, row) in self.core.attributes(txn) {
            self.oids.advance_column_to(row.oid.0);
        }
    }

    /// Queue deferred deletions for every live row content (schemas, table
    /// and index pointers), in batches of at most [`TEARDOWN_MAX_TUPLES`].
    /// Returns the number of reclaimed entries.
    pub fn teardown(self: &Arc<Self>, txn_manager: &TransactionManager) -> usize {
        let txn = txn_manager.begin();
        let mut deferred: Vec<Box<dyn FnOnce() + Send>> = Vec::new();

        let tables: Vec<TableOid> = self.tables.read().unwrap().keys().copied().collect();
        for oid in tables {
            let registry = Arc::clone(self);
            deferred.push(Box::new(move || {
                registry.tables.write().unwrap().remove(&oid);
                registry.schemas.write().unwrap().remove(&oid);
            }));
        }
        let indexes: Vec<IndexOid> = self.indexes.read().unwrap().keys().copied().collect();
        for oid in indexes {
            let registry = Arc::clone(self);
            deferred.push(Box::new(move || {
                registry.indexes.write().unwrap().remove(&oid);
                registry.index_schemas.write().unwrap().remove(&oid);
            }));
        }

        let total = deferred.len();
        let scanned = self.core.num_rows()
            + self.types.num_rows()
            + self.languages.num_rows()
            + self.procs.num_rows()
            + self.statistics.num_rows();
        debug!("catalog teardown: {scanned} metadata rows scanned, {total} live entries queued");
        let mut batch_iter = deferred.into_iter().peekable();
        while batch_iter.peek().is_some() {
            for action in batch_iter.by_ref().take(TEARDOWN_MAX_TUPLES) {
                action();
            }
        }
        txn_manager.abort(&txn);
        total
    }

    /// Attribute rows of one table, for introspection surfaces.
    pub fn describe_table(&self, txn: &TransactionContext, table_oid: TableOid) -> Schema {
        let rows = self
            .core
            .attributes(txn)
            .into_iter()
            .filter(|(_, row)| row.rel_oid == table_oid)
            .map(|(_, row)| row)
            .collect();
        schema_from_attributes(rows)
    }

    /// All user tables visible to the transaction, with their namespaces.
    pub fn list_tables(&self, txn: &TransactionContext) -> Vec<(NamespaceOid, String, TableOid)> {
        self.core
            .classes(txn)
            .into_iter()
            .filter(|(_, row)| row.kind == RelKind::Table)
            .map(|(_, row)| (row.namespace, row.name.clone(), TableOid(row.oid)))
            .collect()
    }

    fn class_oid_by_name(
        &self,
        txn: &TransactionContext,
        namespace: NamespaceOid,
        name: &str,
    ) -> Option<u32> {
        self.core
            .classes(txn)
            .into_iter()
            .find(|(_, row)| row.namespace == namespace && row.name.eq_ignore_ascii_case(name))
            .map(|(_, row)| row.oid)
    }
}

impl std::fmt::Debug for DatabaseCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCatalog")
            .field("oid", &self.oid)
            .field("ddl_epoch", &self.ddl_epoch())
            .finish()
    }
}
