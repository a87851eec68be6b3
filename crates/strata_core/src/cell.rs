//! Cells and cell batches as delivered by table scanners.

use std::sync::Arc;

use bytes::Bytes;

/// Delete-marker flags. Deletes sort before inserts at the same key, so
/// the numeric ordering is part of the wire contract.
pub const FLAG_DELETE_ROW: u8 = 0;
pub const FLAG_DELETE_COLUMN_FAMILY: u8 = 1;
pub const FLAG_DELETE_CELL: u8 = 2;
pub const FLAG_DELETE_CELL_VERSION: u8 = 3;
/// Regular insert cell.
pub const FLAG_INSERT: u8 = 255;

/// Timestamp sentinel instructing the server to assign the commit time.
pub const TIMESTAMP_AUTO: i64 = i64::MIN + 2;

/// A single cell of a wide-column table.
///
/// Row key, qualifier, and value are refcounted slices: cloning a cell
/// (or any of its byte fields) shares storage with the batch the cell
/// arrived in, so holding on to a row key keeps exactly the backing
/// buffer alive, nothing more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: Bytes,
    pub column_family: Arc<str>,
    pub column_qualifier: Bytes,
    pub value: Bytes,
    pub timestamp: i64,
    pub revision: i64,
    pub flag: u8,
}

impl Cell {
    /// Build a regular insert cell with an explicit timestamp.
    pub fn insert(
        row: impl Into<Bytes>,
        column_family: impl Into<Arc<str>>,
        column_qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Self {
            row: row.into(),
            column_family: column_family.into(),
            column_qualifier: column_qualifier.into(),
            value: value.into(),
            timestamp,
            revision: 0,
            flag: FLAG_INSERT,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.flag != FLAG_INSERT
    }
}

/// A batch of cells plus the end-of-stream marker.
///
/// Scanners deliver zero or more batches followed by exactly one batch
/// with `eos` set. When a scan produced data, the final data batch
/// carries the flag; an empty terminal batch means the scan had no
/// (remaining) results.
#[derive(Debug, Clone, Default)]
pub struct CellBatch {
    pub cells: Vec<Cell>,
    pub eos: bool,
}

impl CellBatch {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells, eos: false }
    }

    /// An empty batch carrying only the end-of-stream marker.
    pub fn terminal() -> Self {
        Self {
            cells: Vec::new(),
            eos: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }
}
