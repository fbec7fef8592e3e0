use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, info};

use quill_storage::{TransactionContext, TransactionManager};

use crate::accessor::CatalogAccessor;
use crate::database_catalog::DatabaseCatalog;
use crate::error::CatalogError;
use crate::oid::DatabaseOid;

const FIRST_DATABASE_OID: u32 = 1;

/// The global catalog: the primary table of databases with a name index and
/// an OID index, plus the database OID allocator.
pub struct Catalog {
    txn_manager: Arc<TransactionManager>,
    databases: RwLock<HashMap<DatabaseOid, Arc<DatabaseCatalog>>>,
    name_index: RwLock<HashMap<String, DatabaseOid>>,
    next_db_oid: AtomicU32,
}

impl Catalog {
    pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
        Catalog {
            txn_manager,
            databases: RwLock::new(HashMap::new()),
            name_index: RwLock::new(HashMap::new()),
            next_db_oid: AtomicU32::new(FIRST_DATABASE_OID),
        }
    }

    pub fn txn_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_manager
    }

    /// Create and bootstrap a database. The new database catalog becomes
    /// visible immediately on success and is removed again if the creating
    /// transaction aborts.
    pub fn create_database(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        name: &str,
    ) -> Result<DatabaseOid, CatalogError> {
        {
            let names = self.name_index.read().unwrap();
            if names.contains_key(name) {
                return Err(CatalogError::DuplicateDatabase(name.to_string()));
            }
        }
        let oid = DatabaseOid(self.next_db_oid.fetch_add(1, Ordering::AcqRel));
        let dbc = Arc::new(DatabaseCatalog::new(oid));
        dbc.bootstrap(txn)?;
        self.databases.write().unwrap().insert(oid, Arc::clone(&dbc));
        self.name_index
            .write()
            .unwrap()
            .insert(name.to_string(), oid);

        let catalog = Arc::clone(self);
        let name = name.to_string();
        txn.register_abort_action(move |_| {
            catalog.databases.write().unwrap().remove(&oid);
            catalog.name_index.write().unwrap().remove(&name);
        });
        info!("created database {oid}");
        Ok(oid)
    }

    pub fn drop_database(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        name: &str,
    ) -> Result<bool, CatalogError> {
        let oid = {
            let names = self.name_index.read().unwrap();
            match names.get(name) {
                Some(oid) => *oid,
                None => return Ok(false),
            }
        };
        let catalog = Arc::clone(self);
        let name = name.to_string();
        txn.register_commit_action(move |_| {
            if let Some(dbc) = catalog.databases.write().unwrap().remove(&oid) {
                dbc.teardown(&catalog.txn_manager);
            }
            catalog.name_index.write().unwrap().remove(&name);
        });
        Ok(true)
    }

    pub fn get_database_oid(&self, name: &str) -> Option<DatabaseOid> {
        self.name_index.read().unwrap().get(name).copied()
    }

    pub fn get_database_catalog(&self, oid: DatabaseOid) -> Option<Arc<DatabaseCatalog>> {
        self.databases.read().unwrap().get(&oid).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.name_index.read().unwrap().keys().cloned().collect()
    }

    /// Accessor bundling the catalog, one database and one transaction, the
    /// handle the binder and optimizer resolve names through.
    pub fn accessor(
        self: &Arc<Self>,
        db_oid: DatabaseOid,
        txn: Arc<TransactionContext>,
    ) -> Option<CatalogAccessor> {
        let dbc = self.get_database_catalog(db_oid)?;
        Some(CatalogAccessor::new(Arc::clone(self), dbc, txn))
    }

    /// Tear down every database catalog; deferred deletions are batched per
    /// database.
    pub fn teardown(&self) -> usize {
        let databases: Vec<Arc<DatabaseCatalog>> =
            self.databases.read().unwrap().values().cloned().collect();
        let mut reclaimed = 0;
        for dbc in databases {
            reclaimed += dbc.teardown(&self.txn_manager);
        }
        self.databases.write().unwrap().clear();
        self.name_index.write().unwrap().clear();
        debug!("catalog teardown reclaimed {reclaimed} entries");
        reclaimed
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("databases", &self.databases.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::postgres;
    use crate::schema::{Column, IndexColumn, Schema};
    use quill_storage::{SqlTypeId, StorageError};

    fn setup() -> (Arc<TransactionManager>, Arc<Catalog>, DatabaseOid) {
        let txn_manager = Arc::new(TransactionManager::new());
        let catalog = Arc::new(Catalog::new(Arc::clone(&txn_manager)));
        let txn = txn_manager.begin();
        let oid = catalog.create_database(&txn, "quill").unwrap();
        txn_manager.commit(&txn);
        (txn_manager, catalog, oid)
    }

    fn two_column_schema() -> Schema {
        Schema::new(vec![
            Column::new("a1", SqlTypeId::Integer, false),
            Column::new("a2", SqlTypeId::Varchar, true),
        ])
    }

    #[test]
    fn bootstrap_seeds_builtin_metadata() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let txn = txn_manager.begin();
        assert_eq!(
            dbc.list_types(&txn).len(),
            postgres::builtin_types().len()
        );
        let languages: Vec<String> = dbc
            .list_languages(&txn)
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert!(languages.contains(&"internal".to_string()));
        assert!(languages.contains(&"sql".to_string()));
        assert!(dbc.list_procs(&txn).iter().any(|p| p.name == "lower"));
        assert_eq!(
            dbc.get_namespace_oid(&txn, "pg_catalog"),
            Some(postgres::PG_CATALOG_NAMESPACE_OID)
        );
        txn_manager.abort(&txn);
    }

    #[test]
    fn create_table_installs_schema_and_attributes() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let txn = txn_manager.begin();
        let oid = dbc
            .create_table(&txn, postgres::DEFAULT_NAMESPACE_OID, "a", two_column_schema())
            .unwrap();
        // Visible to the creating transaction before commit.
        assert_eq!(
            dbc.get_table_oid(&txn, postgres::DEFAULT_NAMESPACE_OID, "A"),
            Some(oid)
        );
        let schema = dbc.get_schema(&txn, oid).unwrap();
        assert!(schema.column(0).oid().is_valid());
        assert_ne!(schema.column(0).oid(), schema.column(1).oid());
        txn_manager.commit(&txn);

        let reader = txn_manager.begin();
        assert_eq!(
            dbc.get_table_oid(&reader, postgres::DEFAULT_NAMESPACE_OID, "a"),
            Some(oid)
        );
        assert_eq!(dbc.describe_table(&reader, oid).columns().len(), 2);
    }

    #[test]
    fn aborted_create_table_leaves_no_trace() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let txn = txn_manager.begin();
        let oid = dbc
            .create_table(&txn, postgres::DEFAULT_NAMESPACE_OID, "ghost", two_column_schema())
            .unwrap();
        txn_manager.abort(&txn);

        let reader = txn_manager.begin();
        assert!(dbc
            .get_table_oid(&reader, postgres::DEFAULT_NAMESPACE_OID, "ghost")
            .is_none());
        assert!(dbc.get_table(oid).is_none());
        assert!(dbc.get_schema(&reader, oid).is_none());
    }

    #[test]
    fn concurrent_ddl_serializes_on_the_write_lock() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let t1 = txn_manager.begin();
        let t2 = txn_manager.begin();
        assert!(dbc
            .create_table(&t1, postgres::DEFAULT_NAMESPACE_OID, "t1", two_column_schema())
            .is_ok());
        let err = dbc
            .create_table(&t2, postgres::DEFAULT_NAMESPACE_OID, "t2", two_column_schema())
            .unwrap_err();
        assert!(matches!(err, CatalogError::DdlLockConflict));
        txn_manager.commit(&t1);

        // A transaction whose snapshot predates the committed DDL can never
        // acquire the lock again.
        assert!(!dbc.try_lock(&t2));
        txn_manager.abort(&t2);
        let t3 = txn_manager.begin();
        assert!(dbc
            .create_table(&t3, postgres::DEFAULT_NAMESPACE_OID, "t2", two_column_schema())
            .is_ok());
        txn_manager.commit(&t3);
    }

    #[test]
    fn ddl_lock_released_on_abort() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let t1 = txn_manager.begin();
        assert!(dbc.try_lock(&t1));
        txn_manager.abort(&t1);
        let t2 = txn_manager.begin();
        assert!(dbc.try_lock(&t2));
        txn_manager.commit(&t2);
    }

    #[test]
    fn index_visible_in_creating_txn_and_after_commit() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let setup_txn = txn_manager.begin();
        let table = dbc
            .create_table(&setup_txn, postgres::DEFAULT_NAMESPACE_OID, "a", two_column_schema())
            .unwrap();
        txn_manager.commit(&setup_txn);

        let schema_txn = txn_manager.begin();
        let schema = dbc.get_schema(&schema_txn, table).unwrap();
        let keys = vec![
            IndexColumn {
                column_oid: schema.column(1).oid(),
                descending: false,
            },
            IndexColumn {
                column_oid: schema.column(0).oid(),
                descending: false,
            },
        ];
        let idx = dbc
            .create_index(
                &schema_txn,
                postgres::DEFAULT_NAMESPACE_OID,
                "idx_d",
                table,
                keys,
                true,
            )
            .unwrap();
        assert_eq!(dbc.get_index_oids(&schema_txn, table), vec![idx]);
        txn_manager.commit(&schema_txn);

        let reader = txn_manager.begin();
        assert_eq!(dbc.get_index_oids(&reader, table), vec![idx]);
        assert!(dbc.get_index(idx).is_some());
        assert!(dbc.get_index_schema(idx).unwrap().unique());
    }

    #[test]
    fn delete_table_cascades_to_all_dependents() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let txn = txn_manager.begin();
        let table = dbc
            .create_table(&txn, postgres::DEFAULT_NAMESPACE_OID, "a", two_column_schema())
            .unwrap();
        let schema = dbc.get_schema(&txn, table).unwrap();
        dbc.create_index(
            &txn,
            postgres::DEFAULT_NAMESPACE_OID,
            "a_idx",
            table,
            vec![IndexColumn {
                column_oid: schema.column(0).oid(),
                descending: false,
            }],
            true,
        )
        .unwrap();
        dbc.record_statistics(
            &txn,
            table,
            schema.column(0).oid(),
            crate::statistics::ColumnStatistics {
                num_rows: 3,
                non_null_rows: 3,
                distinct_values: 3,
            },
        )
        .unwrap();
        txn_manager.commit(&txn);

        let drop_txn = txn_manager.begin();
        assert!(dbc.delete_table(&drop_txn, table).unwrap());
        assert!(dbc
            .get_table_oid(&drop_txn, postgres::DEFAULT_NAMESPACE_OID, "a")
            .is_none());
        assert!(dbc.get_index_oids(&drop_txn, table).is_empty());
        assert!(dbc.describe_table(&drop_txn, table).columns().is_empty());
        assert!(dbc
            .get_column_statistics(&drop_txn, table, schema.column(0).oid())
            .is_stub());
        txn_manager.commit(&drop_txn);
        assert!(dbc.get_table(table).is_none());
    }

    #[test]
    fn unique_index_backfill_rejects_duplicates() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let txn = txn_manager.begin();
        let table = dbc
            .create_table(&txn, postgres::DEFAULT_NAMESPACE_OID, "dups", two_column_schema())
            .unwrap();
        let schema = dbc.get_schema(&txn, table).unwrap();
        let heap = dbc.get_table(table).unwrap();
        for _ in 0..2 {
            let mut row = heap.layout().initialize_row();
            let pos = row.position_of(schema.column(0).col_id()).unwrap();
            row.set_value(pos, &quill_storage::SqlValue::Integer(7)).unwrap();
            heap.insert(&txn, row).unwrap();
        }
        let err = dbc
            .create_index(
                &txn,
                postgres::DEFAULT_NAMESPACE_OID,
                "dups_idx",
                table,
                vec![IndexColumn {
                    column_oid: schema.column(0).oid(),
                    descending: false,
                }],
                true,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Storage(StorageError::UniqueViolation)
        ));
    }

    #[test]
    fn drop_database_defers_teardown_to_commit() {
        let (txn_manager, catalog, _) = setup();
        let txn = txn_manager.begin();
        assert!(catalog.drop_database(&txn, "quill").unwrap());
        // Still resolvable until commit.
        assert!(catalog.get_database_oid("quill").is_some());
        txn_manager.commit(&txn);
        assert!(catalog.get_database_oid("quill").is_none());
    }

    #[test]
    fn schema_update_replaces_versions_per_snapshot() {
        let (txn_manager, catalog, db) = setup();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let txn = txn_manager.begin();
        let table = dbc
            .create_table(&txn, postgres::DEFAULT_NAMESPACE_OID, "v", two_column_schema())
            .unwrap();
        txn_manager.commit(&txn);

        let old_reader = txn_manager.begin();
        let update_txn = txn_manager.begin();
        let new_schema = Schema::new(vec![Column::new("only", SqlTypeId::BigInt, false)]);
        let installed = dbc.update_schema(&update_txn, table, new_schema).unwrap();
        assert_eq!(installed.version(), 2);
        txn_manager.commit(&update_txn);

        assert_eq!(dbc.get_schema(&old_reader, table).unwrap().columns().len(), 2);
        let new_reader = txn_manager.begin();
        assert_eq!(dbc.get_schema(&new_reader, table).unwrap().columns().len(), 1);
    }
}
