use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::value::{epoch_date, SqlTypeId, SqlValue};
use chrono::DateTime;

/// Storage-layer column id. Column ids are assigned by the catalog per table
/// and have no meaning above the storage layer.
pub type ColId = u16;

const HEADER_SIZE: usize = 6; // size:u32 + num_cols:u16
const VARCHAR_INLINE_CAP: usize = 12;

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Precomputed layout for projected rows over a fixed set of column ids.
///
/// The initializer reorders the projection internally by descending
/// attribute size so that every value lands on its natural alignment without
/// interior padding. Make no assumption about the ordering of positions;
/// always consult [`ProjectedRowInitializer::position_of`] or the populated
/// row itself. Creating rows from a built initializer is O(row size).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedRowInitializer {
    size: u32,
    col_ids: Vec<ColId>,
    type_ids: Vec<SqlTypeId>,
    offsets: Vec<u32>,
}

impl ProjectedRowInitializer {
    /// Compute the layout for the given `(col_id, type)` projection list.
    /// The list is treated as a set; duplicate column ids are an error.
    pub fn new(columns: &[(ColId, SqlTypeId)]) -> Result<Self, StorageError> {
        let mut ordered: Vec<(ColId, SqlTypeId)> = columns.to_vec();
        // Descending attribute size, column id as tie-break, keeps every
        // offset naturally aligned with zero interior padding.
        ordered.sort_by(|a, b| b.1.size().cmp(&a.1.size()).then(a.0.cmp(&b.0)));
        for pair in ordered.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(StorageError::DuplicateColumnId(pair[0].0));
            }
        }

        let n = ordered.len();
        let offsets_start = align_up(HEADER_SIZE + 2 * n, 4);
        let bitmap_start = offsets_start + 4 * n;
        let values_start = bitmap_start + n.div_ceil(8);

        let mut offsets = Vec::with_capacity(n);
        let mut cursor = values_start;
        for (_, ty) in &ordered {
            cursor = align_up(cursor, ty.align());
            offsets.push(cursor as u32);
            cursor += ty.size();
        }

        Ok(ProjectedRowInitializer {
            size: cursor as u32,
            col_ids: ordered.iter().map(|(id, _)| *id).collect(),
            type_ids: ordered.iter().map(|(_, ty)| *ty).collect(),
            offsets,
        })
    }

    /// Total byte size of rows produced by this initializer.
    pub fn row_size(&self) -> u32 {
        self.size
    }

    pub fn num_columns(&self) -> u16 {
        self.col_ids.len() as u16
    }

    pub fn col_id(&self, position: u16) -> ColId {
        self.col_ids[position as usize]
    }

    pub fn col_ids(&self) -> &[ColId] {
        &self.col_ids
    }

    pub fn type_id(&self, position: u16) -> SqlTypeId {
        self.type_ids[position as usize]
    }

    /// Position of `col_id` in the internal (reordered) projection list.
    pub fn position_of(&self, col_id: ColId) -> Option<u16> {
        self.col_ids.iter().position(|c| *c == col_id).map(|p| p as u16)
    }

    /// Allocate and stamp a fresh row: header, column-id map and offsets
    /// written, null bitmap cleared (every column null).
    pub fn initialize_row(&self) -> ProjectedRow {
        let n = self.col_ids.len();
        let mut buf = vec![0u8; self.size as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..6].copy_from_slice(&(n as u16).to_le_bytes());
        for (i, col_id) in self.col_ids.iter().enumerate() {
            let at = HEADER_SIZE + 2 * i;
            buf[at..at + 2].copy_from_slice(&col_id.to_le_bytes());
        }
        let offsets_start = align_up(HEADER_SIZE + 2 * n, 4);
        for (i, offset) in self.offsets.iter().enumerate() {
            let at = offsets_start + 4 * i;
            buf[at..at + 4].copy_from_slice(&offset.to_le_bytes());
        }
        ProjectedRow {
            buf: buf.into_boxed_slice(),
            heap: Vec::new(),
            type_ids: self.type_ids.clone(),
        }
    }
}

/// A partial row image. In-memory layout, packed, in address order:
///
/// ```text
/// | size:u32 | num_cols:u16 | col_id[n]:u16 | pad | offset[n]:u32 | null bitmap | values... |
/// ```
///
/// The null bitmap uses 1 = present, 0 = null. `offset[i]` is the byte
/// offset from the row head to value `i`, aligned for that value's type.
/// Varchar slots hold the string inline up to 12 bytes, longer strings spill
/// into the row's varlen heap and the slot stores the heap index.
#[derive(Debug, Clone)]
pub struct ProjectedRow {
    buf: Box<[u8]>,
    heap: Vec<Box<[u8]>>,
    type_ids: Vec<SqlTypeId>,
}

impl ProjectedRow {
    pub fn size(&self) -> u32 {
        u32::from_le_bytes(self.buf[0..4].try_into().unwrap())
    }

    pub fn num_columns(&self) -> u16 {
        u16::from_le_bytes(self.buf[4..6].try_into().unwrap())
    }

    pub fn column_ids(&self) -> Vec<ColId> {
        (0..self.num_columns() as usize)
            .map(|i| {
                let at = HEADER_SIZE + 2 * i;
                u16::from_le_bytes(self.buf[at..at + 2].try_into().unwrap())
            })
            .collect()
    }

    pub fn type_id(&self, position: u16) -> SqlTypeId {
        self.type_ids[position as usize]
    }

    /// Position of `col_id` in this row's projection list.
    pub fn position_of(&self, col_id: ColId) -> Option<u16> {
        let n = self.num_columns() as usize;
        (0..n).find(|i| {
            let at = HEADER_SIZE + 2 * i;
            u16::from_le_bytes(self.buf[at..at + 2].try_into().unwrap()) == col_id
        }).map(|p| p as u16)
    }

    fn value_offset(&self, position: u16) -> usize {
        let n = self.num_columns() as usize;
        let offsets_start = align_up(HEADER_SIZE + 2 * n, 4);
        let at = offsets_start + 4 * position as usize;
        u32::from_le_bytes(self.buf[at..at + 4].try_into().unwrap()) as usize
    }

    fn bitmap_start(&self) -> usize {
        let n = self.num_columns() as usize;
        align_up(HEADER_SIZE + 2 * n, 4) + 4 * n
    }

    pub fn is_null(&self, position: u16) -> bool {
        let byte = self.buf[self.bitmap_start() + position as usize / 8];
        byte & (1 << (position % 8)) == 0
    }

    pub fn set_null(&mut self, position: u16) {
        let at = self.bitmap_start() + position as usize / 8;
        self.buf[at] &= !(1 << (position % 8));
    }

    fn set_present(&mut self, position: u16) {
        let at = self.bitmap_start() + position as usize / 8;
        self.buf[at] |= 1 << (position % 8);
    }

    /// Write a value into the slot at `position`. Nulls clear the bitmap bit;
    /// everything else must match the slot type exactly.
    pub fn set_value(&mut self, position: u16, value: &SqlValue) -> Result<(), StorageError> {
        if position >= self.num_columns() {
            return Err(StorageError::ColumnOutOfBounds(position));
        }
        if value.is_null() {
            self.set_null(position);
            return Ok(());
        }
        let slot_type = self.type_ids[position as usize];
        if value.type_id() != slot_type {
            return Err(StorageError::TypeMismatch {
                value_type: value.type_id(),
                slot_type,
            });
        }
        let at = self.value_offset(position);
        match value {
            SqlValue::Boolean(v) => self.buf[at] = *v as u8,
            SqlValue::TinyInt(v) => self.buf[at] = *v as u8,
            SqlValue::SmallInt(v) => self.buf[at..at + 2].copy_from_slice(&v.to_le_bytes()),
            SqlValue::Integer(v) => self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes()),
            SqlValue::BigInt(v) => self.buf[at..at + 8].copy_from_slice(&v.to_le_bytes()),
            SqlValue::Real(v) => self.buf[at..at + 8].copy_from_slice(&v.to_le_bytes()),
            SqlValue::Date(d) => {
                let days = d.signed_duration_since(epoch_date()).num_days() as i32;
                self.buf[at..at + 4].copy_from_slice(&days.to_le_bytes());
            }
            SqlValue::Timestamp(ts) => {
                let micros = ts.and_utc().timestamp_micros();
                self.buf[at..at + 8].copy_from_slice(&micros.to_le_bytes());
            }
            SqlValue::Varchar(s) => {
                let bytes = s.as_bytes();
                self.buf[at..at + 4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                if bytes.len() <= VARCHAR_INLINE_CAP {
                    self.buf[at + 4..at + 4 + bytes.len()].copy_from_slice(bytes);
                } else {
                    let heap_idx = self.heap.len() as u32;
                    self.heap.push(bytes.to_vec().into_boxed_slice());
                    self.buf[at + 4..at + 8].copy_from_slice(&heap_idx.to_le_bytes());
                }
            }
            SqlValue::Null => unreachable!(),
        }
        self.set_present(position);
        Ok(())
    }

    /// Read the value at `position`, null bitmap checked first.
    pub fn value(&self, position: u16) -> SqlValue {
        if position >= self.num_columns() || self.is_null(position) {
            return SqlValue::Null;
        }
        let at = self.value_offset(position);
        match self.type_ids[position as usize] {
            SqlTypeId::Boolean => SqlValue::Boolean(self.buf[at] != 0),
            SqlTypeId::TinyInt => SqlValue::TinyInt(self.buf[at] as i8),
            SqlTypeId::SmallInt => {
                SqlValue::SmallInt(i16::from_le_bytes(self.buf[at..at + 2].try_into().unwrap()))
            }
            SqlTypeId::Integer => {
                SqlValue::Integer(i32::from_le_bytes(self.buf[at..at + 4].try_into().unwrap()))
            }
            SqlTypeId::BigInt => {
                SqlValue::BigInt(i64::from_le_bytes(self.buf[at..at + 8].try_into().unwrap()))
            }
            SqlTypeId::Real => {
                SqlValue::Real(f64::from_le_bytes(self.buf[at..at + 8].try_into().unwrap()))
            }
            SqlTypeId::Date => {
                let days = i32::from_le_bytes(self.buf[at..at + 4].try_into().unwrap());
                SqlValue::Date(epoch_date() + chrono::Duration::days(days as i64))
            }
            SqlTypeId::Timestamp => {
                let micros = i64::from_le_bytes(self.buf[at..at + 8].try_into().unwrap());
                SqlValue::Timestamp(
                    DateTime::from_timestamp_micros(micros)
                        .map(|dt| dt.naive_utc())
                        .unwrap_or_default(),
                )
            }
            SqlTypeId::Varchar => {
                let len = u32::from_le_bytes(self.buf[at..at + 4].try_into().unwrap()) as usize;
                let bytes = if len <= VARCHAR_INLINE_CAP {
                    &self.buf[at + 4..at + 4 + len]
                } else {
                    let heap_idx =
                        u32::from_le_bytes(self.buf[at + 4..at + 8].try_into().unwrap()) as usize;
                    &self.heap[heap_idx][..]
                };
                SqlValue::Varchar(String::from_utf8_lossy(bytes).into_owned())
            }
            SqlTypeId::Invalid => SqlValue::Null,
        }
    }

    /// Read the value stored under `col_id`, or null when the projection does
    /// not carry that column.
    pub fn value_by_col_id(&self, col_id: ColId) -> SqlValue {
        match self.position_of(col_id) {
            Some(pos) => self.value(pos),
            None => SqlValue::Null,
        }
    }

    /// Copy every column of this row that also appears in `out`'s projection.
    pub fn project_into(&self, out: &mut ProjectedRow) -> Result<(), StorageError> {
        for position in 0..out.num_columns() {
            let col_id = {
                let at = HEADER_SIZE + 2 * position as usize;
                u16::from_le_bytes(out.buf[at..at + 2].try_into().unwrap())
            };
            match self.position_of(col_id) {
                Some(src) => out.set_value(position, &self.value(src))?,
                None => return Err(StorageError::UnknownColumnId(col_id)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> ProjectedRowInitializer {
        ProjectedRowInitializer::new(&[
            (0, SqlTypeId::Integer),
            (1, SqlTypeId::Varchar),
            (2, SqlTypeId::Boolean),
            (3, SqlTypeId::BigInt),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_column_ids() {
        let err = ProjectedRowInitializer::new(&[
            (7, SqlTypeId::Integer),
            (7, SqlTypeId::Varchar),
        ])
        .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateColumnId(7)));
    }

    #[test]
    fn offsets_are_aligned_and_disjoint() {
        let init = sample_layout();
        let mut spans: Vec<(u32, u32)> = (0..init.num_columns())
            .map(|i| {
                let ty = init.type_id(i);
                let off = init.offsets[i as usize];
                assert_eq!(off as usize % ty.align(), 0, "column {i} misaligned");
                (off, off + ty.size() as u32)
            })
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "value slots overlap");
        }
        assert!(init.row_size() >= spans.last().unwrap().1);
    }

    #[test]
    fn round_trips_values_written_in_any_order() {
        let init = sample_layout();
        let mut row = init.initialize_row();
        for pos in 0..init.num_columns() {
            assert!(row.is_null(pos));
        }

        let by_col: &[(ColId, SqlValue)] = &[
            (3, SqlValue::BigInt(-77)),
            (0, SqlValue::Integer(42)),
            (2, SqlValue::Boolean(true)),
            (1, SqlValue::Varchar("projected row round trip".into())),
        ];
        for (col_id, value) in by_col {
            let pos = row.position_of(*col_id).unwrap();
            row.set_value(pos, value).unwrap();
        }
        for (col_id, value) in by_col {
            assert_eq!(&row.value_by_col_id(*col_id), value);
        }
    }

    #[test]
    fn null_flags_survive_overwrites() {
        let init = sample_layout();
        let mut row = init.initialize_row();
        let pos = row.position_of(0).unwrap();
        row.set_value(pos, &SqlValue::Integer(5)).unwrap();
        assert!(!row.is_null(pos));
        row.set_value(pos, &SqlValue::Null).unwrap();
        assert!(row.is_null(pos));
        assert_eq!(row.value(pos), SqlValue::Null);
    }

    #[test]
    fn long_varchars_spill_to_the_heap() {
        let init = sample_layout();
        let mut row = init.initialize_row();
        let pos = row.position_of(1).unwrap();
        let long = "x".repeat(200);
        row.set_value(pos, &SqlValue::Varchar(long.clone())).unwrap();
        assert_eq!(row.value(pos), SqlValue::Varchar(long));
    }

    #[test]
    fn projection_subset_copies_by_col_id() {
        let init = sample_layout();
        let mut row = init.initialize_row();
        row.set_value(row.position_of(0).unwrap(), &SqlValue::Integer(9)).unwrap();
        row.set_value(row.position_of(3).unwrap(), &SqlValue::BigInt(10)).unwrap();

        let sub = ProjectedRowInitializer::new(&[(3, SqlTypeId::BigInt), (0, SqlTypeId::Integer)])
            .unwrap();
        let mut out = sub.initialize_row();
        row.project_into(&mut out).unwrap();
        assert_eq!(out.value_by_col_id(0), SqlValue::Integer(9));
        assert_eq!(out.value_by_col_id(3), SqlValue::BigInt(10));
    }

    #[test]
    fn row_size_covers_header_bitmap_and_values() {
        let init = sample_layout();
        let n = init.num_columns() as usize;
        let values: usize = (0..n).map(|i| init.type_id(i as u16).size()).sum();
        assert!(init.row_size() as usize >= HEADER_SIZE + 2 * n + 4 * n + n.div_ceil(8) + values);
    }
}
