//! Client-side data model for the Strata wide-column database.
//!
//! This crate carries the types that travel between an application and
//! the Strata client layer: cells and cell batches as delivered by
//! scanners, scan specifications and their builder, mutation key specs,
//! and table schemas. It performs no I/O and holds no locks; the client
//! crate (`strata_client`) consumes these types.

pub mod cell;
pub mod key;
pub mod schema;
pub mod spec;

pub use cell::{Cell, CellBatch};
pub use key::KeySpec;
pub use schema::{ColumnFamily, Schema};
pub use spec::{CellInterval, ColumnPredicate, RowInterval, ScanSpec, ScanSpecBuilder};
