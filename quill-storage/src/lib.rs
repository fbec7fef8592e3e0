//! Storage-facing primitives shared by the catalog and the execution engine:
//! the projected-row byte format, MVCC transaction contexts, in-memory
//! versioned tables and the key-value index interface.
//!
//! The block store and the write-ahead log are external collaborators; the
//! in-memory `SqlTable` stands in behind the same interface they would feed.

mod error;
mod index;
mod projected_row;
mod table;
mod transaction;
mod value;

pub use error::StorageError;
pub use index::{BTreeIndex, Index};
pub use projected_row::{ColId, ProjectedRow, ProjectedRowInitializer};
pub use table::{SqlTable, TupleSlot};
pub use transaction::{
    DeferredAction, Timestamp, TransactionContext, TransactionManager, INITIAL_TIMESTAMP,
    TS_ABORTED, TS_PENDING,
};
pub use value::{encode_sort_key, SqlTypeId, SqlValue};
