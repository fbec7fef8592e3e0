use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use quill_storage::SqlTypeId;

macro_rules! oid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(0);

            pub fn is_valid(&self) -> bool {
                self.0 != 0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

oid_newtype!(
    /// Identifier of a database.
    DatabaseOid
);
oid_newtype!(
    /// Identifier of a namespace (schema).
    NamespaceOid
);
oid_newtype!(
    /// Identifier of a table in `pg_class`.
    TableOid
);
oid_newtype!(
    /// Identifier of an index; indexes also get a `pg_class` entry.
    IndexOid
);
oid_newtype!(
    /// Identifier of a column within a table.
    ColumnOid
);
oid_newtype!(
    /// Identifier of a SQL type in `pg_type`.
    TypeOid
);
oid_newtype!(
    /// Identifier of a constraint.
    ConstraintOid
);
oid_newtype!(
    /// Identifier of a procedure language.
    LanguageOid
);
oid_newtype!(
    /// Identifier of a builtin or user procedure.
    ProcOid
);

/// Reserved OIDs, stable across databases. The numeric values match
/// PostgreSQL's so that catalog-probing clients see familiar constants.
pub mod postgres {
    use super::{LanguageOid, NamespaceOid, TypeOid};
    use quill_storage::SqlTypeId;

    pub const PG_CATALOG_NAMESPACE_OID: NamespaceOid = NamespaceOid(11);
    pub const DEFAULT_NAMESPACE_OID: NamespaceOid = NamespaceOid(2200);

    pub const TYPE_BOOLEAN: TypeOid = TypeOid(16);
    pub const TYPE_TINYINT: TypeOid = TypeOid(18);
    pub const TYPE_BIGINT: TypeOid = TypeOid(20);
    pub const TYPE_SMALLINT: TypeOid = TypeOid(21);
    pub const TYPE_INTEGER: TypeOid = TypeOid(23);
    pub const TYPE_REAL: TypeOid = TypeOid(701);
    pub const TYPE_VARCHAR: TypeOid = TypeOid(1043);
    pub const TYPE_DATE: TypeOid = TypeOid(1082);
    pub const TYPE_TIMESTAMP: TypeOid = TypeOid(1114);

    pub const INTERNAL_LANGUAGE_OID: LanguageOid = LanguageOid(12);
    pub const SQL_LANGUAGE_OID: LanguageOid = LanguageOid(13);

    pub fn type_oid_for(type_id: SqlTypeId) -> TypeOid {
        match type_id {
            SqlTypeId::Boolean => TYPE_BOOLEAN,
            SqlTypeId::TinyInt => TYPE_TINYINT,
            SqlTypeId::SmallInt => TYPE_SMALLINT,
            SqlTypeId::Integer => TYPE_INTEGER,
            SqlTypeId::BigInt => TYPE_BIGINT,
            SqlTypeId::Real => TYPE_REAL,
            SqlTypeId::Varchar => TYPE_VARCHAR,
            SqlTypeId::Date => TYPE_DATE,
            SqlTypeId::Timestamp => TYPE_TIMESTAMP,
            SqlTypeId::Invalid => TypeOid::INVALID,
        }
    }

    pub fn sql_type_for(oid: TypeOid) -> SqlTypeId {
        match oid {
            TYPE_BOOLEAN => SqlTypeId::Boolean,
            TYPE_TINYINT => SqlTypeId::TinyInt,
            TYPE_SMALLINT => SqlTypeId::SmallInt,
            TYPE_INTEGER => SqlTypeId::Integer,
            TYPE_BIGINT => SqlTypeId::BigInt,
            TYPE_REAL => SqlTypeId::Real,
            TYPE_VARCHAR => SqlTypeId::Varchar,
            TYPE_DATE => SqlTypeId::Date,
            TYPE_TIMESTAMP => SqlTypeId::Timestamp,
            _ => SqlTypeId::Invalid,
        }
    }

    pub fn builtin_types() -> &'static [(TypeOid, SqlTypeId)] {
        &[
            (TYPE_BOOLEAN, SqlTypeId::Boolean),
            (TYPE_TINYINT, SqlTypeId::TinyInt),
            (TYPE_SMALLINT, SqlTypeId::SmallInt),
            (TYPE_INTEGER, SqlTypeId::Integer),
            (TYPE_BIGINT, SqlTypeId::BigInt),
            (TYPE_REAL, SqlTypeId::Real),
            (TYPE_VARCHAR, SqlTypeId::Varchar),
            (TYPE_DATE, SqlTypeId::Date),
            (TYPE_TIMESTAMP, SqlTypeId::Timestamp),
        ]
    }
}

/// First OID handed out to user objects; everything below is reserved for
/// bootstrap entries.
pub const START_OID: u32 = 10001;

/// Authoritative OID allocator of a database catalog: one monotonic counter
/// per OID space. Recovery rewinds a counter forward with
/// [`OidAllocator::advance_to`] when the log reveals a larger allocation.
#[derive(Debug)]
pub struct OidAllocator {
    next_class: AtomicU32,
    next_column: AtomicU32,
    next_namespace: AtomicU32,
    next_type: AtomicU32,
    next_constraint: AtomicU32,
    next_proc: AtomicU32,
    next_language: AtomicU32,
}

impl OidAllocator {
    pub fn new() -> Self {
        OidAllocator {
            next_class: AtomicU32::new(START_OID),
            next_column: AtomicU32::new(START_OID),
            next_namespace: AtomicU32::new(START_OID),
            next_type: AtomicU32::new(START_OID),
            next_constraint: AtomicU32::new(START_OID),
            next_proc: AtomicU32::new(START_OID),
            next_language: AtomicU32::new(START_OID),
        }
    }

    pub fn next_table(&self) -> TableOid {
        TableOid(self.next_class.fetch_add(1, Ordering::AcqRel))
    }

    /// Tables and indexes share the class OID space.
    pub fn next_index(&self) -> IndexOid {
        IndexOid(self.next_class.fetch_add(1, Ordering::AcqRel))
    }

    pub fn next_column(&self) -> ColumnOid {
        ColumnOid(self.next_column.fetch_add(1, Ordering::AcqRel))
    }

    pub fn next_namespace(&self) -> NamespaceOid {
        NamespaceOid(self.next_namespace.fetch_add(1, Ordering::AcqRel))
    }

    pub fn next_type(&self) -> TypeOid {
        TypeOid(self.next_type.fetch_add(1, Ordering::AcqRel))
    }

    pub fn next_constraint(&self) -> ConstraintOid {
        ConstraintOid(self.next_constraint.fetch_add(1, Ordering::AcqRel))
    }

    pub fn next_proc(&self) -> ProcOid {
        ProcOid(self.next_proc.fetch_add(1, Ordering::AcqRel))
    }

    pub fn next_language(&self) -> LanguageOid {
        LanguageOid(self.next_language.fetch_add(1, Ordering::AcqRel))
    }

    /// Rewind the class counter to at least `observed + 1`.
    pub fn advance_class_to(&self, observed: u32) {
        self.next_class.fetch_max(observed + 1, Ordering::AcqRel);
    }

    pub fn advance_column_to(&self, observed: u32) {
        self.next_column.fetch_max(observed + 1, Ordering::AcqRel);
    }
}

impl Default for OidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a SQL type to the length/by-value attributes recorded in `pg_type`.
pub fn type_len(type_id: SqlTypeId) -> i16 {
    match type_id {
        SqlTypeId::Varchar => -1,
        other => other.size() as i16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_oid_is_zero() {
        assert!(!TableOid::INVALID.is_valid());
        assert!(TableOid(42).is_valid());
    }

    #[test]
    fn tables_and_indexes_share_the_class_space() {
        let alloc = OidAllocator::new();
        let t = alloc.next_table();
        let i = alloc.next_index();
        assert_eq!(i.0, t.0 + 1);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let alloc = OidAllocator::new();
        alloc.advance_class_to(50_000);
        assert_eq!(alloc.next_table().0, 50_001);
        alloc.advance_class_to(10);
        assert_eq!(alloc.next_table().0, 50_002);
    }

    #[test]
    fn builtin_type_mapping_round_trips() {
        for (oid, ty) in postgres::builtin_types() {
            assert_eq!(postgres::type_oid_for(*ty), *oid);
            assert_eq!(postgres::sql_type_for(*oid), *ty);
        }
    }
}
