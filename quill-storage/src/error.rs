use thiserror::Error;

use crate::table::TupleSlot;
use crate::value::SqlTypeId;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("duplicate column id {0} in projection")]
    DuplicateColumnId(u16),

    #[error("column position {0} out of bounds")]
    ColumnOutOfBounds(u16),

    #[error("cannot write {value_type} value into a {slot_type} slot")]
    TypeMismatch {
        value_type: SqlTypeId,
        slot_type: SqlTypeId,
    },

    #[error("write-write conflict on tuple {0}")]
    WriteWriteConflict(TupleSlot),

    #[error("duplicate key value violates unique constraint")]
    UniqueViolation,

    #[error("tuple {0} does not exist")]
    InvalidSlot(TupleSlot),

    #[error("projection references column id {0} not present in the table layout")]
    UnknownColumnId(u16),
}
