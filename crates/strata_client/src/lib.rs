//! Strata client library.
//!
//! This crate defines the abstract table-access surface an RPC layer
//! implements (`api`) and the secondary-index scan coordinator
//! (`index_scan`) that turns a predicate scan against an indexed table
//! into the index/staging/verification pipeline, streaming verified
//! cells to the caller's result sink.

pub mod api;
pub mod index_scan;

pub use api::{
    Client, FailedMutation, Namespace, ScanSink, SinkRef, Table, TableMutator, TableScanner,
};
pub use index_scan::{IndexScanCoordinator, ScanCoordinatorConfig, ScanCoordinatorMetrics};
