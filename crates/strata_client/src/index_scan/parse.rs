//! Index-row parsing and client-side interval filtering.
//!
//! Index-table row keys are `"<decimal cf-id>,<primary-row-key>\t<indexed-bytes>"`:
//! a 1-3 digit decimal column-family id, a literal comma, the primary
//! row key, a tab (0x09), and the indexed value (the qualifier for
//! qualifier indexes). The split scans backwards from the end for the
//! tab, so the indexed bytes never contain one; the row key may.

use std::cmp::Ordering;

use bytes::Bytes;
use strata_core::spec::{CellInterval, RowInterval};

/// Family ids are at most 255, so the comma must appear within the
/// first five bytes of the key.
const ID_SPAN: usize = 5;

/// A decoded index-table entry. `row` and `indexed` are zero-copy
/// slices of the source key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedIndexEntry {
    pub family_id: u32,
    pub row: Bytes,
    /// The indexed value (or qualifier). The coordinator only needs
    /// the split; servers consume the value side.
    #[allow(dead_code)]
    pub indexed: Bytes,
}

/// Split an index row key. Returns `None` for malformed entries: no
/// tab in range, no comma within the id span, or a zero id.
pub(crate) fn parse_index_row(key: &Bytes) -> Option<ParsedIndexEntry> {
    let tab = key.iter().rposition(|b| *b == b'\t')?;
    let span = key.len().min(ID_SPAN);
    let comma = key[..span].iter().position(|b| *b == b',')?;
    if comma >= tab {
        return None;
    }
    let family_id = leading_decimal(&key[..comma]);
    if family_id == 0 {
        return None;
    }
    Some(ParsedIndexEntry {
        family_id,
        row: key.slice(comma + 1..tab),
        indexed: key.slice(tab + 1..),
    })
}

// atoi semantics: parse leading digits, stop at the first non-digit.
fn leading_decimal(bytes: &[u8]) -> u32 {
    let mut value = 0u32;
    for b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value * 10 + u32::from(b - b'0');
    }
    value
}

/// True if `row` falls in any of the intervals. Empty bounds are
/// unbounded on their side.
pub(crate) fn row_intervals_match(intervals: &[RowInterval], row: &[u8]) -> bool {
    for ri in intervals {
        if !ri.start.is_empty() {
            if ri.start_inclusive {
                if row < ri.start.as_ref() {
                    continue;
                }
            } else if row <= ri.start.as_ref() {
                continue;
            }
        }
        if !ri.end.is_empty() {
            if ri.end_inclusive {
                if row > ri.end.as_ref() {
                    continue;
                }
            } else if row >= ri.end.as_ref() {
                continue;
            }
        }
        return true;
    }
    false
}

/// True if `(row, column)` falls in any of the cell intervals. Rows
/// order first; column names only decide on the boundary rows, so a
/// row strictly inside the row bounds matches without inspecting
/// columns.
pub(crate) fn cell_intervals_match(intervals: &[CellInterval], row: &[u8], column: &str) -> bool {
    for ci in intervals {
        if !ci.start_row.is_empty() {
            match row.cmp(ci.start_row.as_ref()) {
                Ordering::Less => continue,
                Ordering::Equal => {
                    if !ci.start_column.is_empty() {
                        if ci.start_inclusive {
                            if column < ci.start_column.as_str() {
                                continue;
                            }
                        } else if column <= ci.start_column.as_str() {
                            continue;
                        }
                    }
                }
                Ordering::Greater => {}
            }
        }
        if !ci.end_row.is_empty() {
            match row.cmp(ci.end_row.as_ref()) {
                Ordering::Greater => continue,
                Ordering::Equal => {
                    if !ci.end_column.is_empty() {
                        if ci.end_inclusive {
                            if column > ci.end_column.as_str() {
                                continue;
                            }
                        } else if column >= ci.end_column.as_str() {
                            continue;
                        }
                    }
                }
                Ordering::Less => {}
            }
        }
        return true;
    }
    false
}
