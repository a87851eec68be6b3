//! Collaborator interfaces consumed by the scan coordinator.
//!
//! These traits are the seam between the coordinator and the RPC
//! layer: tables hand out asynchronous scanners and mutators, both of
//! which deliver their results through a caller-supplied [`ScanSink`]
//! from whatever worker threads the transport uses. The in-memory
//! implementations under `tests/` drive the same seam.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use strata_core::cell::CellBatch;
use strata_core::key::KeySpec;
use strata_core::schema::Schema;
use strata_core::spec::ScanSpec;

/// Scanner creation flags.
pub type ScannerFlags = u32;

/// Tells servers not to route this scan through the index path again.
/// Every child scanner the coordinator opens carries it.
pub const SCANNER_FLAG_IGNORE_INDEX: ScannerFlags = 0x01;

/// First byte of every index table's leaf name. The value index of
/// table `T` is named `^T`, the qualifier index `^^T`.
pub const INDEX_TABLE_MARKER: u8 = b'^';

/// Client-side error codes reported through [`ScanSink::scan_error`].
pub const ERR_STAGING_SETUP: i32 = 0x0005_0001;
pub const ERR_SCANNER_CREATE: i32 = 0x0005_0002;

/// Non-owning sink handle held by scanners and mutators.
///
/// Children keep only a weak back-reference to their sink (the
/// coordinator owns its children, not the other way around) and
/// upgrade per delivery; a failed upgrade means the scan was dropped
/// and the child should stop.
pub type SinkRef = Weak<dyn ScanSink>;

/// One mutation the server rejected, reported via
/// [`ScanSink::update_error`].
#[derive(Debug, Clone)]
pub struct FailedMutation {
    pub key: KeySpec,
    pub value: Bytes,
    pub code: i32,
}

/// Asynchronous result sink.
///
/// Scanners and mutators invoke these callbacks from transport worker
/// threads; implementations must tolerate concurrent invocation. A
/// scanner signals end-of-stream by setting `eos` on its final batch:
/// when the scan produced data the last data batch carries the flag,
/// and an empty terminal batch means the scan had no results.
pub trait ScanSink: Send + Sync {
    /// A child scanner was created with this sink. Invoked by the
    /// scanner factory before any delivery.
    fn register_scanner(&self, scanner: &dyn TableScanner);

    /// Zero or more cells, plus possibly the end-of-stream marker.
    fn scan_ok(&self, scanner: &dyn TableScanner, cells: CellBatch);

    /// A scan failed. `eos` marks the error as terminal for that
    /// scanner.
    fn scan_error(&self, scanner: &dyn TableScanner, code: i32, message: &str, eos: bool);

    /// A mutation buffer was applied.
    fn update_ok(&self, mutator: &dyn TableMutator);

    /// Some mutations were rejected.
    fn update_error(&self, mutator: &dyn TableMutator, code: i32, failures: &[FailedMutation]);

    /// Outstanding-operation accounting on the sink itself; a scan
    /// that was handed this sink increments once up front and
    /// decrements once at its terminal notification.
    fn increment_outstanding(&self);
    fn decrement_outstanding(&self);
}

/// A running asynchronous scan.
pub trait TableScanner: Send + Sync {
    /// Process-unique id, stable for the scanner's lifetime.
    fn id(&self) -> u64;
    /// Full pathname of the scanned table.
    fn table_name(&self) -> &str;
    /// Best-effort cancellation; pending deliveries may still arrive.
    fn cancel(&self);
}

/// An asynchronous mutator.
pub trait TableMutator: Send + Sync {
    fn id(&self) -> u64;
    /// Queue one cell write. Delivery failures surface later through
    /// [`ScanSink::update_error`].
    fn set(&self, key: KeySpec, value: &[u8]) -> Result<()>;
    /// Flush queued writes synchronously and retire the mutator.
    fn close(&self) -> Result<()>;
}

/// An open table.
pub trait Table: Send + Sync {
    /// Full pathname, e.g. `/app/events`.
    fn name(&self) -> &str;
    fn schema(&self) -> Arc<Schema>;
    fn namespace(&self) -> Arc<dyn Namespace>;
    fn create_scanner_async(
        &self,
        sink: SinkRef,
        spec: &ScanSpec,
        timeout: Duration,
        flags: ScannerFlags,
    ) -> Result<Arc<dyn TableScanner>>;
    fn create_mutator_async(&self, sink: SinkRef) -> Result<Arc<dyn TableMutator>>;
}

/// A namespace: a directory of tables.
pub trait Namespace: Send + Sync {
    fn name(&self) -> &str;
    fn create_table(&self, name: &str, schema_xml: &str) -> Result<()>;
    fn open_table(&self, name: &str) -> Result<Arc<dyn Table>>;
    fn drop_table(&self, name: &str, if_exists: bool) -> Result<()>;
    fn client(&self) -> Arc<dyn Client>;
}

/// Connection handle; hands out namespaces.
pub trait Client: Send + Sync {
    fn open_namespace(&self, path: &str) -> Result<Arc<dyn Namespace>>;
}

/// Leaf (basename) of a slash-separated table pathname.
pub fn leaf_name(table_name: &str) -> &str {
    table_name.rsplit('/').next().unwrap_or(table_name)
}
