//! Scan specifications.
//!
//! A `ScanSpec` describes one table scan: which columns and rows to
//! read, interval and predicate restrictions, and the user-visible
//! limit/offset knobs. Specs are plain data; servers interpret them,
//! the client only builds and forwards them. `ScanSpecBuilder` is the
//! ergonomic way to assemble one.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Column-predicate operations (bitmask). Value and qualifier halves
/// combine, e.g. `EXACT_MATCH | QUALIFIER_PREFIX_MATCH`.
pub mod ops {
    pub const EXACT_MATCH: u32 = 0x0001;
    pub const PREFIX_MATCH: u32 = 0x0002;
    pub const REGEX_MATCH: u32 = 0x0004;
    pub const VALUE_MATCH: u32 = 0x0007;
    pub const QUALIFIER_EXACT_MATCH: u32 = 0x0100;
    pub const QUALIFIER_PREFIX_MATCH: u32 = 0x0200;
    pub const QUALIFIER_REGEX_MATCH: u32 = 0x0400;
    pub const QUALIFIER_MATCH: u32 = 0x0700;
}

/// Half-open-capable row interval. An empty bound is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowInterval {
    pub start: Bytes,
    pub start_inclusive: bool,
    pub end: Bytes,
    pub end_inclusive: bool,
}

impl RowInterval {
    pub fn new(
        start: impl Into<Bytes>,
        start_inclusive: bool,
        end: impl Into<Bytes>,
        end_inclusive: bool,
    ) -> Self {
        Self {
            start: start.into(),
            start_inclusive,
            end: end.into(),
            end_inclusive,
        }
    }
}

/// Interval over (row, column) pairs. Column names compare after rows;
/// empty bounds are unbounded on their side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInterval {
    pub start_row: Bytes,
    pub start_column: String,
    pub start_inclusive: bool,
    pub end_row: Bytes,
    pub end_column: String,
    pub end_inclusive: bool,
}

/// A predicate against one column family, evaluated server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPredicate {
    pub column_family: String,
    pub column_qualifier: Option<String>,
    pub operation: u32,
    pub value: Bytes,
}

impl ColumnPredicate {
    pub fn exact(column_family: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            column_family: column_family.into(),
            column_qualifier: None,
            operation: ops::EXACT_MATCH,
            value: value.into(),
        }
    }

    pub fn prefix(column_family: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            column_family: column_family.into(),
            column_qualifier: None,
            operation: ops::PREFIX_MATCH,
            value: value.into(),
        }
    }
}

/// Unbounded time interval, nanoseconds, half-open `[start, end)`.
pub const TIME_INTERVAL_ALL: (i64, i64) = (i64::MIN, i64::MAX);

/// One table scan, fully described.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    /// Column selectors: `"family"` or `"family:qualifier"`. Empty
    /// selects everything.
    pub columns: Vec<String>,
    /// Explicit row list; combines with intervals as a union.
    pub rows: Vec<Bytes>,
    pub row_intervals: Vec<RowInterval>,
    pub cell_intervals: Vec<CellInterval>,
    pub column_predicates: Vec<ColumnPredicate>,
    pub time_interval: (i64, i64),
    pub max_versions: u32,
    pub return_deletes: bool,
    pub keys_only: bool,
    pub row_regexp: Option<String>,
    pub value_regexp: Option<String>,
    pub row_limit: u32,
    pub cell_limit: u32,
    pub row_offset: u32,
    pub cell_offset: u32,
    pub cell_limit_per_family: u32,
    /// Server hint: fetch the row list by scanning and filtering
    /// rather than point lookups. Carried through untouched.
    pub scan_and_filter_rows: bool,
}

impl Default for ScanSpec {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_intervals: Vec::new(),
            cell_intervals: Vec::new(),
            column_predicates: Vec::new(),
            time_interval: TIME_INTERVAL_ALL,
            max_versions: 0,
            return_deletes: false,
            keys_only: false,
            row_regexp: None,
            value_regexp: None,
            row_limit: 0,
            cell_limit: 0,
            row_offset: 0,
            cell_offset: 0,
            cell_limit_per_family: 0,
            scan_and_filter_rows: false,
        }
    }
}

impl ScanSpec {
    /// True if any user-visible limit or offset is set, in which case
    /// the client applies them to the verified cell stream.
    pub fn tracks_limits(&self) -> bool {
        self.row_limit != 0
            || self.cell_limit != 0
            || self.row_offset != 0
            || self.cell_offset != 0
            || self.cell_limit_per_family != 0
    }
}

/// Incremental `ScanSpec` assembly.
#[derive(Debug, Clone, Default)]
pub struct ScanSpecBuilder {
    spec: ScanSpec,
}

impl ScanSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column(&mut self, column: impl Into<String>) -> &mut Self {
        self.spec.columns.push(column.into());
        self
    }

    pub fn add_row(&mut self, row: impl Into<Bytes>) -> &mut Self {
        self.spec.rows.push(row.into());
        self
    }

    pub fn add_row_interval(&mut self, interval: RowInterval) -> &mut Self {
        self.spec.row_intervals.push(interval);
        self
    }

    pub fn add_cell_interval(&mut self, interval: CellInterval) -> &mut Self {
        self.spec.cell_intervals.push(interval);
        self
    }

    pub fn add_column_predicate(&mut self, predicate: ColumnPredicate) -> &mut Self {
        self.spec.column_predicates.push(predicate);
        self
    }

    pub fn set_time_interval(&mut self, start: i64, end: i64) -> &mut Self {
        self.spec.time_interval = (start, end);
        self
    }

    pub fn set_max_versions(&mut self, max_versions: u32) -> &mut Self {
        self.spec.max_versions = max_versions;
        self
    }

    pub fn set_return_deletes(&mut self, return_deletes: bool) -> &mut Self {
        self.spec.return_deletes = return_deletes;
        self
    }

    pub fn set_keys_only(&mut self, keys_only: bool) -> &mut Self {
        self.spec.keys_only = keys_only;
        self
    }

    pub fn set_row_regexp(&mut self, regexp: impl Into<String>) -> &mut Self {
        self.spec.row_regexp = Some(regexp.into());
        self
    }

    pub fn set_value_regexp(&mut self, regexp: impl Into<String>) -> &mut Self {
        self.spec.value_regexp = Some(regexp.into());
        self
    }

    pub fn set_row_limit(&mut self, limit: u32) -> &mut Self {
        self.spec.row_limit = limit;
        self
    }

    pub fn set_cell_limit(&mut self, limit: u32) -> &mut Self {
        self.spec.cell_limit = limit;
        self
    }

    pub fn set_row_offset(&mut self, offset: u32) -> &mut Self {
        self.spec.row_offset = offset;
        self
    }

    pub fn set_cell_offset(&mut self, offset: u32) -> &mut Self {
        self.spec.cell_offset = offset;
        self
    }

    pub fn set_cell_limit_per_family(&mut self, limit: u32) -> &mut Self {
        self.spec.cell_limit_per_family = limit;
        self
    }

    pub fn build(self) -> ScanSpec {
        self.spec
    }
}
