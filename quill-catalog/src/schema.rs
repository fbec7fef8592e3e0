use serde::{Deserialize, Serialize};

use quill_storage::{ColId, ProjectedRowInitializer, SqlTypeId, SqlValue, StorageError};

use crate::oid::{ColumnOid, IndexOid, TableOid};

/// Relation kind recorded in `pg_class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelKind {
    Table,
    Index,
}

impl RelKind {
    pub fn as_i8(self) -> i8 {
        match self {
            RelKind::Table => 0,
            RelKind::Index => 1,
        }
    }

    pub fn from_i8(v: i8) -> Option<RelKind> {
        match v {
            0 => Some(RelKind::Table),
            1 => Some(RelKind::Index),
            _ => None,
        }
    }
}

/// One column of a table schema. The OID is assigned once by the catalog at
/// CreateTable and never reused; the storage column id is the column's slot
/// in the table's physical layout and is only stable within one schema
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    name: String,
    type_id: SqlTypeId,
    nullable: bool,
    default: Option<SqlValue>,
    oid: ColumnOid,
    col_id: ColId,
}

impl Column {
    pub fn new(name: impl Into<String>, type_id: SqlTypeId, nullable: bool) -> Self {
        Column {
            name: name.into(),
            type_id,
            nullable,
            default: None,
            oid: ColumnOid::INVALID,
            col_id: 0,
        }
    }

    pub fn with_default(mut self, default: SqlValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> SqlTypeId {
        self.type_id
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn default(&self) -> Option<&SqlValue> {
        self.default.as_ref()
    }

    pub fn oid(&self) -> ColumnOid {
        self.oid
    }

    pub fn col_id(&self) -> ColId {
        self.col_id
    }

    pub(crate) fn assign(&mut self, oid: ColumnOid, col_id: ColId) {
        self.oid = oid;
        self.col_id = col_id;
    }
}

/// Ordered column list of a table. Schema replacement is atomic under the
/// catalog's DDL lock; readers resolve the version valid at their snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
    version: u32,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Schema {
            columns,
            version: 0,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn find_column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_by_oid(&self, oid: ColumnOid) -> Option<&Column> {
        self.columns.iter().find(|c| c.oid == oid)
    }

    /// Projection layout covering every column of this schema.
    pub fn full_layout(&self) -> Result<ProjectedRowInitializer, StorageError> {
        let cols: Vec<(ColId, SqlTypeId)> =
            self.columns.iter().map(|c| (c.col_id, c.type_id)).collect();
        ProjectedRowInitializer::new(&cols)
    }

    /// Projection layout over a subset of columns, by column OID.
    pub fn layout_for(&self, oids: &[ColumnOid]) -> Result<ProjectedRowInitializer, StorageError> {
        let cols: Vec<(ColId, SqlTypeId)> = oids
            .iter()
            .filter_map(|oid| self.column_by_oid(*oid))
            .map(|c| (c.col_id, c.type_id))
            .collect();
        ProjectedRowInitializer::new(&cols)
    }

    pub(crate) fn assign_identifiers(
        &mut self,
        mut next_oid: impl FnMut() -> ColumnOid,
        version: u32,
    ) {
        self.version = version;
        for (i, column) in self.columns.iter_mut().enumerate() {
            column.assign(next_oid(), i as ColId);
        }
    }
}

/// One key column of an index, referencing a table column by OID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub column_oid: ColumnOid,
    pub descending: bool,
}

/// Key definition of an index over one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    table_oid: TableOid,
    columns: Vec<IndexColumn>,
    unique: bool,
    oid: IndexOid,
}

impl IndexSchema {
    pub fn new(table_oid: TableOid, columns: Vec<IndexColumn>, unique: bool) -> Self {
        IndexSchema {
            table_oid,
            columns,
            unique,
            oid: IndexOid::INVALID,
        }
    }

    pub fn table_oid(&self) -> TableOid {
        self.table_oid
    }

    pub fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn oid(&self) -> IndexOid {
        self.oid
    }

    pub(crate) fn assign(&mut self, oid: IndexOid) {
        self.oid = oid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lookup_is_case_insensitive() {
        let schema = Schema::new(vec![
            Column::new("A1", SqlTypeId::Integer, false),
            Column::new("a2", SqlTypeId::Varchar, true),
        ]);
        assert_eq!(schema.find_column("a1").unwrap().0, 0);
        assert_eq!(schema.find_column("A2").unwrap().0, 1);
        assert!(schema.find_column("a3").is_none());
    }

    #[test]
    fn assigned_columns_expose_stable_identifiers() {
        let mut schema = Schema::new(vec![
            Column::new("x", SqlTypeId::Integer, false),
            Column::new("y", SqlTypeId::BigInt, true),
        ]);
        let mut next = 100u32;
        schema.assign_identifiers(
            || {
                next += 1;
                ColumnOid(next)
            },
            1,
        );
        assert_eq!(schema.column(0).oid(), ColumnOid(101));
        assert_eq!(schema.column(1).oid(), ColumnOid(102));
        assert_eq!(schema.column(1).col_id(), 1);
        let layout = schema.full_layout().unwrap();
        assert_eq!(layout.num_columns(), 2);
    }
}
