//! Secondary-index scan coordination.
//!
//! A scan whose predicate touches an indexed column family runs as a
//! pipeline: scanners over the index table produce candidate primary
//! row keys, the candidate set is buffered in memory (or spilled into
//! an ephemeral staging table past a size cutoff), and primary-table
//! scanners re-read each candidate to fetch and verify the requested
//! cells. [`IndexScanCoordinator`] is the result sink shared by all of
//! those child scanners: it demultiplexes their callbacks by origin,
//! applies the user-visible LIMIT/OFFSET semantics to the verified
//! stream, applies backpressure between the staging scan and the
//! primary-table readahead, and emits exactly one terminal
//! notification to the caller's sink.
//!
//! All public operations are safe to invoke from any number of
//! transport worker threads. A single mutex guards the coordinator
//! state; the outstanding-scanner count lives in a dedicated atomic,
//! and the only blocking point is the verification stage waiting for
//! room on the readahead queue.

mod candidates;
mod metrics;
mod parse;
mod queue;
mod staging;
mod tracker;

pub use self::metrics::ScanCoordinatorMetrics;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{debug, warn};

use strata_core::cell::CellBatch;
use strata_core::key::KeySpec;
use strata_core::spec::{ScanSpec, ScanSpecBuilder};

use crate::api::{
    leaf_name, FailedMutation, ScanSink, SinkRef, Table, TableMutator, TableScanner,
    ERR_SCANNER_CREATE, ERR_STAGING_SETUP, INDEX_TABLE_MARKER, SCANNER_FLAG_IGNORE_INDEX,
};
use self::candidates::CandidateSet;
use self::queue::SpecQueue;
use self::staging::StagingTable;
use self::tracker::PredicateTracker;

/// Bound on queued verification specs.
pub const QUEUE_LIMIT: usize = 40;
/// Buffered candidate bytes tolerated before spilling to the staging
/// table.
pub const STAGING_CUTOFF: usize = 1024 * 1024;

/// Coordinator tunables. The defaults are the production constants;
/// tests shrink them to exercise the staging and backpressure paths
/// with small inputs.
#[derive(Debug, Clone, Copy)]
pub struct ScanCoordinatorConfig {
    pub queue_limit: usize,
    pub staging_cutoff: usize,
    /// Build one verification spec per candidate row instead of one
    /// per staging batch. Same queueing contract; saturates the queue
    /// at much smaller inputs.
    pub spec_per_row: bool,
    /// After enqueueing a spec, launch a readahead scanner while at
    /// most this many child scanners are in flight.
    pub readahead_min_outstanding: i64,
}

impl Default for ScanCoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_limit: QUEUE_LIMIT,
            staging_cutoff: STAGING_CUTOFF,
            spec_per_row: false,
            readahead_min_outstanding: 0,
        }
    }
}

/// Which table a child scanner reads. Children are tagged at creation
/// and callbacks dispatch on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOrigin {
    Index,
    Staging,
    Primary,
}

struct ScanState {
    /// Children are owned here; they hold only weak sink references
    /// back, so dropping the coordinator tears the cycle.
    scanners: Vec<Arc<dyn TableScanner>>,
    origins: HashMap<u64, ScanOrigin>,
    sspecs: SpecQueue,
    /// Family id -> name, restricted to families carrying an index of
    /// the kind this scan uses.
    column_map: BTreeMap<u32, Arc<str>>,
    candidates: CandidateSet,
    staging: Option<StagingTable>,
    tracker: Option<PredicateTracker>,
    /// Last row key handed to verification; dedups across staging
    /// batches.
    last_row_verify: Bytes,
    eos: bool,
    limits_reached: bool,
    final_decrement: bool,
}

/// The shared result sink of an index-assisted scan. See the module
/// docs for the pipeline; construction is via [`Self::start`], which
/// also opens the index scanner. Dropping the coordinator cancels its
/// children and drops the staging table.
pub struct IndexScanCoordinator {
    weak: Weak<IndexScanCoordinator>,
    primary: Arc<dyn Table>,
    primary_spec: ScanSpec,
    user_sink: Arc<dyn ScanSink>,
    timeout: Duration,
    qualifier_scan: bool,
    config: ScanCoordinatorConfig,
    metrics: ScanCoordinatorMetrics,
    /// Child scanners that have not yet delivered their terminal
    /// callback. Kept outside the mutex so observers always read a
    /// current value.
    outstanding_scanners: AtomicI64,
    state: Mutex<ScanState>,
    /// Signalled on every dequeue and whenever `limits_reached` or
    /// `eos` is set; pairs with `state` for the queue-not-full wait.
    queue_cond: Condvar,
}

/// Leaf name of the index table serving `primary_leaf`.
fn index_table_name(primary_leaf: &str, qualifier_scan: bool) -> String {
    if qualifier_scan {
        format!("^^{primary_leaf}")
    } else {
        format!("^{primary_leaf}")
    }
}

impl IndexScanCoordinator {
    /// Begin an index-assisted scan of `primary`.
    ///
    /// Increments `user_sink`'s outstanding count (matched by exactly
    /// one decrement at the terminal notification), opens the index
    /// table through the primary table's namespace, and starts the
    /// index scanner with the coordinator as its sink.
    pub fn start(
        primary: Arc<dyn Table>,
        spec: ScanSpec,
        user_sink: Arc<dyn ScanSink>,
        timeout: Duration,
        qualifier_scan: bool,
        config: ScanCoordinatorConfig,
    ) -> Result<Arc<Self>> {
        let schema = primary.schema();
        let mut column_map = BTreeMap::new();
        for cf in schema.column_families() {
            if cf.deleted {
                continue;
            }
            let indexed = if qualifier_scan {
                cf.has_qualifier_index
            } else {
                cf.has_index
            };
            if indexed {
                column_map.insert(cf.id, Arc::<str>::from(cf.name.as_str()));
            }
        }
        if column_map.is_empty() {
            bail!(
                "table '{}' has no {} index",
                primary.name(),
                if qualifier_scan { "qualifier" } else { "value" }
            );
        }

        let tracker = PredicateTracker::from_spec(&spec);
        let queue_limit = config.queue_limit;
        let coordinator = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            weak: weak.clone(),
            primary: Arc::clone(&primary),
            primary_spec: spec,
            user_sink: Arc::clone(&user_sink),
            timeout,
            qualifier_scan,
            config,
            metrics: ScanCoordinatorMetrics::default(),
            outstanding_scanners: AtomicI64::new(0),
            state: Mutex::new(ScanState {
                scanners: Vec::new(),
                origins: HashMap::new(),
                sspecs: SpecQueue::new(queue_limit),
                column_map,
                candidates: CandidateSet::new(),
                staging: None,
                tracker,
                last_row_verify: Bytes::new(),
                eos: false,
                limits_reached: false,
                final_decrement: false,
            }),
            queue_cond: Condvar::new(),
        });

        user_sink.increment_outstanding();

        let index_leaf = index_table_name(leaf_name(primary.name()), qualifier_scan);
        let started = primary
            .namespace()
            .open_table(&index_leaf)
            .with_context(|| format!("open index table '{index_leaf}'"))
            .and_then(|index_table| {
                let mut index_spec = ScanSpecBuilder::new();
                index_spec.set_keys_only(true);
                index_table
                    .create_scanner_async(
                        coordinator.sink_ref(),
                        &index_spec.build(),
                        timeout,
                        SCANNER_FLAG_IGNORE_INDEX,
                    )
                    .context("create index scanner")
            });
        match started {
            Ok(scanner) => {
                coordinator.adopt_scanner(scanner, ScanOrigin::Index);
                Ok(coordinator)
            }
            Err(err) => {
                user_sink.decrement_outstanding();
                Err(err)
            }
        }
    }

    pub fn metrics(&self) -> &ScanCoordinatorMetrics {
        &self.metrics
    }

    /// Child scanners that have not yet delivered their terminal
    /// callback.
    pub fn outstanding_scanners(&self) -> i64 {
        self.outstanding()
    }

    fn outstanding(&self) -> i64 {
        self.outstanding_scanners.load(Ordering::SeqCst)
    }

    fn sink_ref(&self) -> SinkRef {
        self.weak.clone()
    }

    fn adopt_scanner(&self, scanner: Arc<dyn TableScanner>, origin: ScanOrigin) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        Self::adopt_locked(&mut state, scanner, origin);
    }

    fn adopt_locked(state: &mut ScanState, scanner: Arc<dyn TableScanner>, origin: ScanOrigin) {
        state.origins.insert(scanner.id(), origin);
        state.scanners.push(scanner);
    }

    fn origin_of(&self, state: &ScanState, scanner: &dyn TableScanner) -> ScanOrigin {
        if let Some(origin) = state.origins.get(&scanner.id()) {
            return *origin;
        }
        // Untracked scanner: classify by table identity.
        let name = scanner.table_name();
        if leaf_name(name).as_bytes().first() == Some(&INDEX_TABLE_MARKER) {
            ScanOrigin::Index
        } else if name == self.primary.name() {
            ScanOrigin::Primary
        } else {
            ScanOrigin::Staging
        }
    }

    /// Decode one index batch into candidates, spill to staging past
    /// the cutoff, and on index end-of-stream open the staging scan or
    /// the direct primary fetch.
    fn collect_indices(&self, state: &mut ScanState, scanner: &dyn TableScanner, cells: CellBatch) {
        let is_eos = cells.eos;
        for cell in &cells.cells {
            let Some(entry) = parse::parse_index_row(&cell.row) else {
                warn!(
                    key = %String::from_utf8_lossy(&cell.row),
                    table = %scanner.table_name(),
                    "invalid index entry"
                );
                self.metrics.record_malformed();
                continue;
            };
            let Some(family) = state.column_map.get(&entry.family_id).cloned() else {
                warn!(
                    key = %String::from_utf8_lossy(&cell.row),
                    table = %scanner.table_name(),
                    family_id = entry.family_id,
                    "index entry references unknown column family"
                );
                self.metrics.record_malformed();
                continue;
            };

            // Row and cell intervals from the original request are
            // filtered here at the client; the index scan cannot
            // apply them.
            if !self.primary_spec.row_intervals.is_empty()
                && !parse::row_intervals_match(&self.primary_spec.row_intervals, &entry.row)
            {
                continue;
            }
            if !self.primary_spec.cell_intervals.is_empty()
                && !parse::cell_intervals_match(
                    &self.primary_spec.cell_intervals,
                    &entry.row,
                    &family,
                )
            {
                continue;
            }

            state.candidates.account(entry.row.len());
            if let Some(staging) = &state.staging {
                if let Err(err) = staging.write(KeySpec {
                    row: entry.row.clone(),
                    column_family: family,
                    column_qualifier: Bytes::new(),
                    timestamp: cell.timestamp,
                }) {
                    warn!(error = %format!("{err:#}"), "staging write failed; candidate dropped");
                }
            } else if state
                .candidates
                .insert(entry.row.clone(), family, cell.timestamp)
            {
                self.metrics.record_candidate();
            }
        }

        if !is_eos {
            // Mid-stream: spill once the buffer outgrows the cutoff.
            if state.staging.is_none()
                && state.candidates.over_cutoff(self.config.staging_cutoff)
            {
                match StagingTable::create(
                    self.primary.as_ref(),
                    self.qualifier_scan,
                    self.sink_ref(),
                ) {
                    Ok(staging) => {
                        for (row, candidate) in state.candidates.drain() {
                            if let Err(err) = staging.write(KeySpec {
                                row,
                                column_family: candidate.column_family,
                                column_qualifier: Bytes::new(),
                                timestamp: candidate.timestamp,
                            }) {
                                warn!(
                                    error = %format!("{err:#}"),
                                    "staging flush write failed; candidate dropped"
                                );
                            }
                        }
                        self.metrics.record_staging_flush();
                        state.staging = Some(staging);
                    }
                    Err(err) => {
                        self.fail_terminal(state, scanner, ERR_STAGING_SETUP, err);
                    }
                }
            }
            return;
        }

        // All index scanners have ended.
        if let Some(staging) = state.staging.as_mut() {
            if let Err(err) = staging.close_mutator() {
                warn!(
                    error = %format!("{err:#}"),
                    "staging mutator close failed; scan may return a subset"
                );
            }
        }
        if state.staging.is_none() && state.candidates.is_empty() {
            // Nothing matched: finalize directly.
            state.eos = true;
            self.queue_cond.notify_all();
            return;
        }

        let mut builder = ScanSpecBuilder::new();
        builder
            .set_max_versions(self.primary_spec.max_versions)
            .set_return_deletes(self.primary_spec.return_deletes)
            .set_keys_only(self.primary_spec.keys_only);
        if let Some(re) = &self.primary_spec.row_regexp {
            builder.set_row_regexp(re.clone());
        }
        for column in &self.primary_spec.columns {
            builder.add_column(column.clone());
        }
        builder.set_time_interval(
            self.primary_spec.time_interval.0,
            self.primary_spec.time_interval.1,
        );

        let staging_table = state.staging.as_ref().map(|s| Arc::clone(s.table()));
        if let Some(staging_table) = staging_table {
            match staging_table.create_scanner_async(
                self.sink_ref(),
                &builder.build(),
                self.timeout,
                SCANNER_FLAG_IGNORE_INDEX,
            ) {
                Ok(s) => Self::adopt_locked(state, s, ScanOrigin::Staging),
                Err(err) => self.fail_terminal(
                    state,
                    scanner,
                    ERR_SCANNER_CREATE,
                    err.context("create staging scanner"),
                ),
            }
        } else {
            // Direct fetch: a single primary scan listing every
            // buffered row, with the user's column predicates.
            for row in state.candidates.rows() {
                builder.add_row(row.clone());
            }
            for predicate in &self.primary_spec.column_predicates {
                builder.add_column_predicate(predicate.clone());
            }
            match self.primary.create_scanner_async(
                self.sink_ref(),
                &builder.build(),
                self.timeout,
                SCANNER_FLAG_IGNORE_INDEX,
            ) {
                Ok(s) => Self::adopt_locked(state, s, ScanOrigin::Primary),
                Err(err) => self.fail_terminal(
                    state,
                    scanner,
                    ERR_SCANNER_CREATE,
                    err.context("create direct-fetch scanner"),
                ),
            }
            state.candidates.clear();
        }
    }

    /// Turn one staging batch into verification spec(s) on the
    /// readahead queue, blocking while the queue is over its limit.
    fn verify_results<'a>(
        &'a self,
        mut state: MutexGuard<'a, ScanState>,
        scanner: &dyn TableScanner,
        cells: CellBatch,
    ) -> MutexGuard<'a, ScanState> {
        // Nothing came back, or limits were hit meanwhile: tear down
        // verification.
        if (cells.eos && cells.is_empty()) || state.limits_reached {
            state.sspecs.clear();
            state.eos = true;
            self.queue_cond.notify_all();
            return state;
        }

        if self.config.spec_per_row {
            for cell in &cells.cells {
                if cell.row == state.last_row_verify {
                    continue;
                }
                state.last_row_verify = cell.row.clone();
                let spec = self.verification_spec(vec![cell.row.clone()]);
                let (returned, pushed) = self.enqueue_spec(state, scanner, spec);
                state = returned;
                if !pushed {
                    return state;
                }
            }
        } else {
            // One spec aggregating the batch's unique rows. The
            // staging scan returns rows in order, so equality against
            // the previous key is enough to dedup, including across
            // batch boundaries.
            let mut rows = Vec::new();
            for cell in &cells.cells {
                if cell.row == state.last_row_verify {
                    continue;
                }
                state.last_row_verify = cell.row.clone();
                rows.push(cell.row.clone());
            }
            if rows.is_empty() {
                return state;
            }
            let spec = self.verification_spec(rows);
            let (returned, _pushed) = self.enqueue_spec(state, scanner, spec);
            state = returned;
        }
        state
    }

    /// Block while the queue is full, then push and possibly launch a
    /// readahead scanner. Returns the reacquired guard and whether the
    /// spec was enqueued (false when limits/eos cancelled it).
    fn enqueue_spec<'a>(
        &'a self,
        mut state: MutexGuard<'a, ScanState>,
        scanner: &dyn TableScanner,
        spec: ScanSpec,
    ) -> (MutexGuard<'a, ScanState>, bool) {
        while state.sspecs.is_full() && !state.limits_reached && !state.eos {
            state = self
                .queue_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.limits_reached || state.eos {
            return (state, false);
        }
        let depth = state.sspecs.push(spec);
        self.metrics.record_enqueued(depth);
        if self.outstanding() <= self.config.readahead_min_outstanding {
            self.readahead(&mut state, scanner);
        }
        (state, true)
    }

    /// Launch a primary-table scanner for the head spec, if any.
    fn readahead(&self, state: &mut ScanState, scanner: &dyn TableScanner) {
        debug_assert!(!state.limits_reached && !state.eos);
        let Some(spec) = state.sspecs.pop() else {
            return;
        };
        match self.primary.create_scanner_async(
            self.sink_ref(),
            &spec,
            self.timeout,
            SCANNER_FLAG_IGNORE_INDEX,
        ) {
            Ok(s) => {
                Self::adopt_locked(state, s, ScanOrigin::Primary);
                self.metrics.record_readahead();
                debug!(queued = state.sspecs.len(), "launched readahead scanner");
            }
            Err(err) => {
                self.fail_terminal(
                    state,
                    scanner,
                    ERR_SCANNER_CREATE,
                    err.context("create readahead scanner"),
                );
                return;
            }
        }
        self.queue_cond.notify_one();
    }

    /// Apply LIMIT/OFFSET to verified primary cells and forward the
    /// survivors. The terminal flag is never forwarded from here; that
    /// is the finalizer's job.
    fn track_predicates(&self, state: &mut ScanState, scanner: &dyn TableScanner, batch: CellBatch) {
        if (batch.eos && batch.is_empty()) || state.limits_reached {
            state.sspecs.clear();
            state.eos = true;
            self.queue_cond.notify_all();
            return;
        }
        let mut out = Vec::new();
        let reached = match state.tracker.as_mut() {
            Some(tracker) => tracker.track(batch.cells, &mut out),
            None => return,
        };
        if reached {
            // Cancellation: drop queued specs, wake the verification
            // waiter, and let in-flight scanners drain.
            state.limits_reached = true;
            state.eos = true;
            state.sspecs.clear();
            self.queue_cond.notify_all();
        }
        if !out.is_empty() {
            self.user_sink.scan_ok(scanner, CellBatch::new(out));
        }
    }

    /// Emit the single terminal notification once no scanner is
    /// outstanding and some path has ended the scan: either limits
    /// were reached and this is a proper scanner end, or limits were
    /// not reached and end-of-stream was signalled.
    fn final_decrement(&self, state: &mut ScanState, scanner: &dyn TableScanner, is_eos: bool) {
        if self.outstanding() != 0 {
            return;
        }
        let final_eos = if state.tracker.is_some() {
            (state.limits_reached && is_eos)
                || (!state.limits_reached && (is_eos || state.eos))
        } else {
            is_eos || state.eos
        };
        if !final_eos {
            return;
        }
        state.eos = true;
        self.queue_cond.notify_all();
        if !state.final_decrement {
            state.final_decrement = true;
            self.user_sink.scan_ok(scanner, CellBatch::terminal());
            self.user_sink.decrement_outstanding();
        }
    }

    /// A collaborator failure the scan cannot survive: surface it as
    /// the terminal error and stop processing. The finalizer is
    /// bypassed; the error is the user-visible terminal.
    fn fail_terminal(
        &self,
        state: &mut ScanState,
        scanner: &dyn TableScanner,
        code: i32,
        err: anyhow::Error,
    ) {
        warn!(error = %format!("{err:#}"), "index scan cannot continue");
        state.eos = true;
        state.sspecs.clear();
        self.queue_cond.notify_all();
        if !state.final_decrement {
            state.final_decrement = true;
            self.user_sink
                .scan_error(scanner, code, &format!("{err:#}"), true);
            self.user_sink.decrement_outstanding();
        }
    }

    fn verification_spec(&self, rows: Vec<Bytes>) -> ScanSpec {
        let mut builder = ScanSpecBuilder::new();
        for column in &self.primary_spec.columns {
            builder.add_column(column.clone());
        }
        builder
            .set_max_versions(self.primary_spec.max_versions)
            .set_return_deletes(self.primary_spec.return_deletes);
        for predicate in &self.primary_spec.column_predicates {
            builder.add_column_predicate(predicate.clone());
        }
        if let Some(re) = &self.primary_spec.value_regexp {
            builder.set_value_regexp(re.clone());
        }
        for row in rows {
            builder.add_row(row);
        }
        builder.build()
    }
}

impl ScanSink for IndexScanCoordinator {
    fn register_scanner(&self, _scanner: &dyn TableScanner) {
        self.outstanding_scanners.fetch_add(1, Ordering::SeqCst);
    }

    fn scan_ok(&self, scanner: &dyn TableScanner, cells: CellBatch) {
        let is_eos = cells.eos;
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        // Empty non-terminal packets carry nothing.
        if !is_eos && cells.is_empty() {
            return;
        }

        if is_eos {
            let previous = self.outstanding_scanners.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(previous > 0, "terminal callback without registration");
        }

        // Once terminal, only collect the remaining scanners.
        if state.eos {
            if self.outstanding() == 0 {
                self.final_decrement(&mut state, scanner, is_eos);
            }
            return;
        }

        let origin = self.origin_of(&state, scanner);
        match origin {
            ScanOrigin::Index => self.collect_indices(&mut state, scanner, cells),
            ScanOrigin::Staging => state = self.verify_results(state, scanner, cells),
            ScanOrigin::Primary => {
                let mut batch = cells;
                batch.eos = false;
                if state.tracker.is_some() {
                    self.track_predicates(&mut state, scanner, batch);
                } else {
                    self.user_sink.scan_ok(scanner, batch);
                }
                // Feed the next spec once the current scanner is done.
                if !state.limits_reached && is_eos {
                    self.readahead(&mut state, scanner);
                }
            }
        }

        self.final_decrement(&mut state, scanner, is_eos);
    }

    fn scan_error(&self, scanner: &dyn TableScanner, code: i32, message: &str, eos: bool) {
        self.user_sink.scan_error(scanner, code, message, eos);
        if eos {
            self.user_sink.decrement_outstanding();
        }
    }

    fn update_ok(&self, _mutator: &dyn TableMutator) {}

    fn update_error(&self, mutator: &dyn TableMutator, code: i32, failures: &[FailedMutation]) {
        // Staging-mutator failures lose candidates; the scan returns a
        // subset and the caller learns it from this report.
        self.user_sink.update_error(mutator, code, failures);
    }

    // Child accounting happens through `register_scanner` and terminal
    // batches; the coordinator takes no part in outstanding counts on
    // itself.
    fn increment_outstanding(&self) {}
    fn decrement_outstanding(&self) {}
}

impl Drop for IndexScanCoordinator {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for scanner in &state.scanners {
            scanner.cancel();
        }
        state.sspecs.clear();
        // Dropping `state.staging` closes the mutator and drops the
        // staging table.
    }
}
