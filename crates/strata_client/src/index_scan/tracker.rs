//! User-visible LIMIT/OFFSET application.

use bytes::Bytes;
use strata_core::cell::Cell;
use strata_core::spec::ScanSpec;

/// Applies `row_offset`, `cell_offset`, `row_limit`, `cell_limit`, and
/// `cell_limit_per_family` to the verified cell stream, in arrival
/// order. State persists across batches; the coordinator runs the
/// tracker under its lock, so the output order is the production
/// order.
///
/// One counter serves both the global cell limit and the per-family
/// cap: it is reset on a row change only while `cell_limit_per_family`
/// is active. Combining `cell_limit` with `cell_limit_per_family`
/// therefore bounds cells per row, not across rows.
#[derive(Debug)]
pub(crate) struct PredicateTracker {
    row_limit: u32,
    cell_limit: u32,
    row_offset: u32,
    cell_offset: u32,
    cell_limit_per_family: u32,
    cell_count: u32,
    row_count: u32,
    last_row: Bytes,
    skip_row: bool,
}

impl PredicateTracker {
    /// `None` when the spec carries no limits or offsets; cells are
    /// then forwarded verbatim.
    pub(crate) fn from_spec(spec: &ScanSpec) -> Option<Self> {
        if !spec.tracks_limits() {
            return None;
        }
        Some(Self {
            row_limit: spec.row_limit,
            cell_limit: spec.cell_limit,
            row_offset: spec.row_offset,
            cell_offset: spec.cell_offset,
            cell_limit_per_family: spec.cell_limit_per_family,
            cell_count: 0,
            row_count: 0,
            last_row: Bytes::new(),
            skip_row: false,
        })
    }

    /// Feed one batch; survivors are appended to `out`. Returns true
    /// once a limit is reached, at which point the remainder of the
    /// batch is discarded.
    pub(crate) fn track(&mut self, cells: Vec<Cell>, out: &mut Vec<Cell>) -> bool {
        for cell in cells {
            let new_row = cell.row != self.last_row;
            if new_row {
                self.skip_row = false;
                self.last_row = cell.row.clone();
                if self.cell_limit_per_family != 0 {
                    self.cell_count = 0;
                }
                if self.row_offset != 0 {
                    self.row_offset -= 1;
                    self.skip_row = true;
                    continue;
                }
            } else if self.skip_row {
                continue;
            }

            if self.cell_offset != 0 {
                self.cell_offset -= 1;
                continue;
            }
            if self.cell_limit != 0 && self.cell_count >= self.cell_limit {
                return true;
            }
            if self.row_limit != 0 && new_row && self.row_count >= self.row_limit {
                return true;
            }
            if self.cell_limit_per_family == 0 || self.cell_count < self.cell_limit_per_family {
                out.push(cell);
            }

            self.cell_count += 1;
            if new_row {
                self.row_count += 1;
            }
        }
        false
    }
}
