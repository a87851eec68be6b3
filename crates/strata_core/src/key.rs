//! Mutation key specs.

use std::sync::Arc;

use bytes::Bytes;

/// Addresses one cell for a mutation: row, column family, optional
/// qualifier, and the timestamp to write at.
///
/// Row keys order byte-wise: lexicographic over the common prefix, the
/// shorter key first on a tie. This is the ordering `Bytes` (and
/// `[u8]`) already implement, and it matches the order a table scan
/// returns rows in, so buffered key sets iterate in scan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub row: Bytes,
    pub column_family: Arc<str>,
    pub column_qualifier: Bytes,
    pub timestamp: i64,
}

impl KeySpec {
    pub fn new(row: impl Into<Bytes>, column_family: impl Into<Arc<str>>, timestamp: i64) -> Self {
        Self {
            row: row.into(),
            column_family: column_family.into(),
            column_qualifier: Bytes::new(),
            timestamp,
        }
    }
}
