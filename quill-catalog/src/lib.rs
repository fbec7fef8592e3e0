//! Self-describing metadata store for the quill engine.
//!
//! Every catalog object lives as a row in one of the Postgres-style metadata
//! tables (`pg_namespace`, `pg_class`, `pg_attribute`, `pg_index`, `pg_type`,
//! `pg_constraint`, `pg_language`, `pg_proc`, `pg_statistic`), serialized
//! through the same MVCC projected-row storage the catalog describes. DDL is
//! serialized per database by a timestamp-ordered write lock.

mod accessor;
mod catalog;
mod database_catalog;
mod error;
mod oid;
pub mod pg;
mod schema;
mod statistics;

pub use accessor::CatalogAccessor;
pub use catalog::Catalog;
pub use database_catalog::{build_index_key, DatabaseCatalog, TEARDOWN_MAX_TUPLES};
pub use error::CatalogError;
pub use oid::{
    postgres, ColumnOid, ConstraintOid, DatabaseOid, IndexOid, LanguageOid, NamespaceOid,
    OidAllocator, ProcOid, TableOid, TypeOid,
};
pub use schema::{Column, IndexColumn, IndexSchema, RelKind, Schema};
pub use statistics::{ColumnStatistics, TableStatistics};
