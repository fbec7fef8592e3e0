use thiserror::Error;

use quill_storage::StorageError;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("could not acquire the DDL lock; a concurrent schema change is in flight")]
    DdlLockConflict,

    #[error("relation \"{0}\" already exists")]
    DuplicateRelation(String),

    #[error("database \"{0}\" already exists")]
    DuplicateDatabase(String),

    #[error("namespace \"{0}\" already exists")]
    DuplicateNamespace(String),

    #[error("relation \"{0}\" does not exist")]
    UnknownRelation(String),

    #[error("namespace \"{0}\" does not exist")]
    UnknownNamespace(String),

    #[error("database \"{0}\" does not exist")]
    UnknownDatabase(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
