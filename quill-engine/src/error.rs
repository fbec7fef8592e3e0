use thiserror::Error;

use quill_catalog::CatalogError;
use quill_storage::{SqlTypeId, StorageError};

/// Binder failures, each mapping to a distinct Postgres error code.
#[derive(Error, Debug)]
pub enum BinderError {
    #[error("relation \"{0}\" does not exist")]
    UnknownTable(String),

    #[error("column \"{0}\" does not exist")]
    UnknownColumn(String),

    #[error("column reference \"{0}\" is ambiguous")]
    AmbiguousColumn(String),

    #[error("table name \"{0}\" specified more than once")]
    DuplicateAlias(String),

    #[error("argument of WHERE must be type boolean, not type {0}")]
    WhereNotBoolean(SqlTypeId),

    #[error("aggregate functions are not allowed in WHERE")]
    AggregateInWhere,

    #[error("column \"{0}\" must appear in the GROUP BY clause or be used in an aggregate function")]
    NotInGroupBy(String),

    #[error("operator does not exist: {0} {1} {2}")]
    ComparisonTypeMismatch(SqlTypeId, String, SqlTypeId),

    #[error("cannot convert parameter ${0} from {1} to {2}")]
    ParameterConversion(usize, SqlTypeId, SqlTypeId),

    #[error("function {0} does not exist")]
    UnknownFunction(String),

    #[error("INSERT has more expressions than target columns")]
    InsertArityMismatch,
}

impl BinderError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            BinderError::UnknownTable(_) => "42P01",
            BinderError::UnknownColumn(_) | BinderError::NotInGroupBy(_) => "42703",
            BinderError::AmbiguousColumn(_) => "42702",
            BinderError::DuplicateAlias(_) => "42712",
            BinderError::WhereNotBoolean(_) => "42804",
            BinderError::AggregateInWhere => "42803",
            BinderError::ComparisonTypeMismatch(..) => "42883",
            BinderError::ParameterConversion(..) => "22003",
            BinderError::UnknownFunction(_) => "42883",
            BinderError::InsertArityMismatch => "42601",
        }
    }
}

/// Runtime failures; these abort the surrounding transaction.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("{0} out of range")]
    NumericOverflow(SqlTypeId),

    #[error("duplicate key value violates unique constraint")]
    UniqueViolation,

    #[error("null value in column \"{0}\" violates not-null constraint")]
    NotNullViolation(String),

    #[error("could not serialize access due to concurrent update")]
    WriteWriteConflict,

    #[error("parameter ${0} was not bound")]
    UnboundParameter(usize),

    #[error("cannot cast {0} to {1}")]
    InvalidCast(SqlTypeId, SqlTypeId),

    #[error("could not read file \"{0}\": {1}")]
    FileRead(String, String),
}

impl RuntimeError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            RuntimeError::DivisionByZero => "22012",
            RuntimeError::NumericOverflow(_) => "22003",
            RuntimeError::UniqueViolation => "23505",
            RuntimeError::NotNullViolation(_) => "23502",
            RuntimeError::WriteWriteConflict => "40001",
            RuntimeError::UnboundParameter(_) => "08P01",
            RuntimeError::InvalidCast(..) => "42846",
            RuntimeError::FileRead(..) => "58030",
        }
    }
}

/// Engine-wide error type: one kind-tagged variant per pipeline stage.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("syntax error: {0}")]
    Parse(String),

    #[error(transparent)]
    Binder(#[from] BinderError),

    #[error("{0} is not implemented")]
    NotImplemented(String),

    #[error("optimizer could not produce a plan: {0}")]
    Optimizer(String),

    #[error("feature not supported by code generation: {0}")]
    Codegen(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl QueryError {
    /// Postgres error code string for the wire protocol.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            QueryError::Parse(_) => "42601",
            QueryError::Binder(e) => e.sqlstate(),
            QueryError::NotImplemented(_) | QueryError::Codegen(_) => "0A000",
            QueryError::Optimizer(_) => "XX000",
            QueryError::Runtime(e) => e.sqlstate(),
            QueryError::Catalog(CatalogError::DdlLockConflict) => "40001",
            QueryError::Catalog(CatalogError::DuplicateRelation(_)) => "42P07",
            QueryError::Catalog(CatalogError::DuplicateDatabase(_)) => "42P04",
            QueryError::Catalog(CatalogError::UnknownRelation(_)) => "42P01",
            QueryError::Catalog(CatalogError::UnknownDatabase(_)) => "3D000",
            QueryError::Catalog(_) => "XX000",
        }
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UniqueViolation => QueryError::Runtime(RuntimeError::UniqueViolation),
            StorageError::WriteWriteConflict(_) => {
                QueryError::Runtime(RuntimeError::WriteWriteConflict)
            }
            other => QueryError::Catalog(CatalogError::Storage(other)),
        }
    }
}
