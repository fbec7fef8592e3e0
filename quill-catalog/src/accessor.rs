use std::sync::Arc;

use quill_storage::{Index, SqlTable, TransactionContext};

use crate::catalog::Catalog;
use crate::database_catalog::DatabaseCatalog;
use crate::error::CatalogError;
use crate::oid::{postgres, ColumnOid, DatabaseOid, IndexOid, NamespaceOid, TableOid};
use crate::pg::proc::ProcRow;
use crate::schema::{IndexColumn, IndexSchema, Schema};
use crate::statistics::{ColumnStatistics, TableStatistics};

/// A convenience handle bundling the global catalog, one database catalog
/// and one transaction. All name resolution the binder and optimizer do
/// goes through an accessor; the search path implicitly begins with
/// `pg_catalog`.
pub struct CatalogAccessor {
    catalog: Arc<Catalog>,
    dbc: Arc<DatabaseCatalog>,
    txn: Arc<TransactionContext>,
    search_path: Vec<NamespaceOid>,
}

impl CatalogAccessor {
    pub(crate) fn new(
        catalog: Arc<Catalog>,
        dbc: Arc<DatabaseCatalog>,
        txn: Arc<TransactionContext>,
    ) -> Self {
        CatalogAccessor {
            catalog,
            dbc,
            txn,
            search_path: vec![
                postgres::PG_CATALOG_NAMESPACE_OID,
                postgres::DEFAULT_NAMESPACE_OID,
            ],
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn database_catalog(&self) -> &Arc<DatabaseCatalog> {
        &self.dbc
    }

    pub fn db_oid(&self) -> DatabaseOid {
        self.dbc.oid()
    }

    pub fn txn(&self) -> &Arc<TransactionContext> {
        &self.txn
    }

    pub fn ddl_epoch(&self) -> u64 {
        self.dbc.ddl_epoch()
    }

    /// Replace the search path. `pg_catalog` is implicitly prepended when
    /// the caller's path does not already contain it.
    pub fn set_search_path(&mut self, mut path: Vec<NamespaceOid>) {
        if !path.contains(&postgres::PG_CATALOG_NAMESPACE_OID) {
            path.insert(0, postgres::PG_CATALOG_NAMESPACE_OID);
        }
        self.search_path = path;
    }

    pub fn search_path(&self) -> &[NamespaceOid] {
        &self.search_path
    }

    /// Namespace new relations land in: the first entry after `pg_catalog`.
    pub fn default_namespace(&self) -> NamespaceOid {
        self.search_path
            .iter()
            .copied()
            .find(|ns| *ns != postgres::PG_CATALOG_NAMESPACE_OID)
            .unwrap_or(postgres::DEFAULT_NAMESPACE_OID)
    }

    pub fn get_namespace_oid(&self, name: &str) -> Option<NamespaceOid> {
        self.dbc.get_namespace_oid(&self.txn, name)
    }

    /// Resolve an unqualified table name along the search path.
    pub fn get_table_oid(&self, name: &str) -> Option<TableOid> {
        self.search_path
            .iter()
            .find_map(|ns| self.dbc.get_table_oid(&self.txn, *ns, name))
    }

    pub fn get_table_oid_in(&self, namespace: NamespaceOid, name: &str) -> Option<TableOid> {
        self.dbc.get_table_oid(&self.txn, namespace, name)
    }

    pub fn get_schema(&self, table_oid: TableOid) -> Option<Arc<Schema>> {
        self.dbc.get_schema(&self.txn, table_oid)
    }

    pub fn get_table(&self, table_oid: TableOid) -> Option<Arc<SqlTable>> {
        self.dbc.get_table(table_oid)
    }

    pub fn get_index_oid(&self, name: &str) -> Option<IndexOid> {
        self.search_path
            .iter()
            .find_map(|ns| self.dbc.get_index_oid(&self.txn, *ns, name))
    }

    pub fn get_index_oids(&self, table_oid: TableOid) -> Vec<IndexOid> {
        self.dbc.get_index_oids(&self.txn, table_oid)
    }

    pub fn get_index(&self, index_oid: IndexOid) -> Option<Arc<dyn Index>> {
        self.dbc.get_index(index_oid)
    }

    pub fn get_index_schema(&self, index_oid: IndexOid) -> Option<Arc<IndexSchema>> {
        self.dbc.get_index_schema(index_oid)
    }

    pub fn get_proc(&self, name: &str) -> Option<ProcRow> {
        self.dbc.get_proc(&self.txn, name)
    }

    pub fn get_column_statistics(
        &self,
        table_oid: TableOid,
        column_oid: ColumnOid,
    ) -> ColumnStatistics {
        self.dbc.get_column_statistics(&self.txn, table_oid, column_oid)
    }

    pub fn get_table_statistics(&self, table_oid: TableOid) -> TableStatistics {
        self.dbc.get_table_statistics(&self.txn, table_oid)
    }

    pub fn create_table(
        &self,
        namespace: NamespaceOid,
        name: &str,
        schema: Schema,
    ) -> Result<TableOid, CatalogError> {
        self.dbc.create_table(&self.txn, namespace, name, schema)
    }

    pub fn create_index(
        &self,
        namespace: NamespaceOid,
        name: &str,
        table_oid: TableOid,
        key_columns: Vec<IndexColumn>,
        unique: bool,
    ) -> Result<IndexOid, CatalogError> {
        self.dbc
            .create_index(&self.txn, namespace, name, table_oid, key_columns, unique)
    }

    pub fn delete_table(&self, table_oid: TableOid) -> Result<bool, CatalogError> {
        self.dbc.delete_table(&self.txn, table_oid)
    }

    pub fn delete_index(&self, index_oid: IndexOid) -> Result<bool, CatalogError> {
        self.dbc.delete_index(&self.txn, index_oid)
    }

    pub fn create_namespace(&self, name: &str) -> Result<NamespaceOid, CatalogError> {
        self.dbc.create_namespace(&self.txn, name)
    }

    pub fn drop_namespace(&self, oid: NamespaceOid) -> Result<bool, CatalogError> {
        self.dbc.drop_namespace(&self.txn, oid)
    }

    pub fn list_tables(&self) -> Vec<(NamespaceOid, String, TableOid)> {
        self.dbc.list_tables(&self.txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use quill_storage::{SqlTypeId, TransactionManager};

    #[test]
    fn unqualified_lookup_walks_the_search_path() {
        let txn_manager = Arc::new(TransactionManager::new());
        let catalog = Arc::new(Catalog::new(Arc::clone(&txn_manager)));
        let boot = txn_manager.begin();
        let db = catalog.create_database(&boot, "db").unwrap();
        txn_manager.commit(&boot);

        let txn = txn_manager.begin();
        let accessor = catalog.accessor(db, Arc::clone(&txn)).unwrap();
        let table = accessor
            .create_table(
                postgres::DEFAULT_NAMESPACE_OID,
                "t",
                Schema::new(vec![Column::new("c", SqlTypeId::Integer, false)]),
            )
            .unwrap();
        assert_eq!(accessor.get_table_oid("t"), Some(table));
        assert_eq!(accessor.get_table_oid("T"), Some(table));
        assert!(accessor.get_table_oid("missing").is_none());
    }

    #[test]
    fn search_path_always_includes_pg_catalog() {
        let txn_manager = Arc::new(TransactionManager::new());
        let catalog = Arc::new(Catalog::new(Arc::clone(&txn_manager)));
        let boot = txn_manager.begin();
        let db = catalog.create_database(&boot, "db").unwrap();
        txn_manager.commit(&boot);

        let txn = txn_manager.begin();
        let mut accessor = catalog.accessor(db, txn).unwrap();
        accessor.set_search_path(vec![postgres::DEFAULT_NAMESPACE_OID]);
        assert_eq!(accessor.search_path()[0], postgres::PG_CATALOG_NAMESPACE_OID);
        assert_eq!(accessor.default_namespace(), postgres::DEFAULT_NAMESPACE_OID);
    }
}
