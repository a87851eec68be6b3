//! Shared in-memory cluster for integration tests.
//!
//! Implements the client/namespace/table seam entirely in process:
//! tables are `BTreeMap`s, scanners are threads delivering batches to
//! the sink, mutators apply writes synchronously. Enough of the scan
//! spec surface is honoured (row lists, intervals, columns, time
//! interval, predicates, row/value regexps, keys-only, max-versions)
//! to drive the index-scan coordinator end to end.

#![allow(dead_code)]

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;

use strata_client::api::{
    Client, FailedMutation, Namespace, ScanSink, ScannerFlags, SinkRef, Table, TableMutator,
    TableScanner,
};
use strata_core::cell::{Cell, CellBatch, FLAG_INSERT};
use strata_core::key::KeySpec;
use strata_core::schema::{ColumnFamily, Schema};
use strata_core::spec::{ops, ColumnPredicate, RowInterval, ScanSpec};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Install a subscriber once so `RUST_LOG=debug` surfaces coordinator
/// traces during test runs.
pub fn init_logs() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone)]
struct StoredCell {
    family: Arc<str>,
    qualifier: Bytes,
    value: Bytes,
    timestamp: i64,
}

/// In-memory table.
pub struct MemTable {
    self_ref: Weak<MemTable>,
    name: String,
    schema: Arc<Schema>,
    namespace: Weak<MemNamespace>,
    data: Mutex<BTreeMap<Bytes, Vec<StoredCell>>>,
    batch_rows: AtomicUsize,
    batch_delay_ms: AtomicU64,
    fail_scan: Mutex<Option<(i32, String)>>,
    fail_mutations: Mutex<Option<i32>>,
}

impl MemTable {
    fn new(name: String, schema: Schema, namespace: Weak<MemNamespace>, batch_rows: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            name,
            schema: Arc::new(schema),
            namespace,
            data: Mutex::new(BTreeMap::new()),
            batch_rows: AtomicUsize::new(batch_rows),
            batch_delay_ms: AtomicU64::new(0),
            fail_scan: Mutex::new(None),
            fail_mutations: Mutex::new(None),
        })
    }

    /// Rows per delivered batch; the final batch carries `eos`.
    pub fn set_batch_rows(&self, rows: usize) {
        self.batch_rows.store(rows.max(1), Ordering::Relaxed);
    }

    pub fn set_batch_delay(&self, delay: Duration) {
        self.batch_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make every scanner of this table fail terminally.
    pub fn set_fail_scan(&self, code: i32, message: &str) {
        *self.fail_scan.lock().expect("fail_scan lock") = Some((code, message.to_string()));
    }

    /// Make every mutation fail, reported via `update_error`.
    pub fn set_fail_mutations(&self, code: i32) {
        *self.fail_mutations.lock().expect("fail_mutations lock") = Some(code);
    }

    pub fn insert_raw(
        &self,
        row: Bytes,
        family: &str,
        qualifier: Bytes,
        value: Bytes,
        timestamp: i64,
    ) {
        let mut data = self.data.lock().expect("table data lock");
        data.entry(row).or_default().push(StoredCell {
            family: Arc::from(family),
            qualifier,
            value,
            timestamp,
        });
    }

    pub fn row_count(&self) -> usize {
        self.data.lock().expect("table data lock").len()
    }

    fn select_batches(&self, spec: &ScanSpec) -> Vec<CellBatch> {
        let row_regexp = spec
            .row_regexp
            .as_deref()
            .map(|re| regex::bytes::Regex::new(re).expect("row regexp"));
        let value_regexp = spec
            .value_regexp
            .as_deref()
            .map(|re| regex::bytes::Regex::new(re).expect("value regexp"));
        let explicit: BTreeSet<&[u8]> = spec.rows.iter().map(|r| r.as_ref()).collect();

        let data = self.data.lock().expect("table data lock");
        let mut selected_rows: Vec<Vec<Cell>> = Vec::new();
        'rows: for (row, cells) in data.iter() {
            if !spec.rows.is_empty() || !spec.row_intervals.is_empty() {
                let in_list = explicit.contains(row.as_ref());
                let in_interval = spec
                    .row_intervals
                    .iter()
                    .any(|ri| interval_contains(ri, row));
                if !in_list && !in_interval {
                    continue;
                }
            }
            if let Some(re) = &row_regexp {
                if !re.is_match(row) {
                    continue;
                }
            }
            for predicate in &spec.column_predicates {
                if !cells.iter().any(|c| predicate_matches(predicate, c)) {
                    continue 'rows;
                }
            }

            let mut chosen: Vec<&StoredCell> = cells
                .iter()
                .filter(|c| {
                    column_selected(&spec.columns, c)
                        && c.timestamp >= spec.time_interval.0
                        && c.timestamp < spec.time_interval.1
                        && value_regexp
                            .as_ref()
                            .map_or(true, |re| re.is_match(&c.value))
                })
                .collect();
            chosen.sort_by_key(|c| (c.family.clone(), c.qualifier.clone(), Reverse(c.timestamp)));
            if spec.max_versions > 0 {
                let mut kept = Vec::with_capacity(chosen.len());
                let mut last_column: Option<(Arc<str>, Bytes)> = None;
                let mut versions = 0usize;
                for cell in chosen {
                    let column = (cell.family.clone(), cell.qualifier.clone());
                    if last_column.as_ref() != Some(&column) {
                        last_column = Some(column);
                        versions = 0;
                    }
                    if versions < spec.max_versions as usize {
                        kept.push(cell);
                    }
                    versions += 1;
                }
                chosen = kept;
            }
            if chosen.is_empty() {
                continue;
            }
            selected_rows.push(
                chosen
                    .into_iter()
                    .map(|c| Cell {
                        row: row.clone(),
                        column_family: c.family.clone(),
                        column_qualifier: c.qualifier.clone(),
                        value: if spec.keys_only {
                            Bytes::new()
                        } else {
                            c.value.clone()
                        },
                        timestamp: c.timestamp,
                        revision: 0,
                        flag: FLAG_INSERT,
                    })
                    .collect(),
            );
        }

        let batch_rows = self.batch_rows.load(Ordering::Relaxed).max(1);
        let mut batches: Vec<CellBatch> = selected_rows
            .chunks(batch_rows)
            .map(|chunk| CellBatch::new(chunk.iter().flatten().cloned().collect()))
            .collect();
        match batches.last_mut() {
            Some(last) => last.eos = true,
            None => batches.push(CellBatch::terminal()),
        }
        batches
    }
}

fn interval_contains(ri: &RowInterval, row: &[u8]) -> bool {
    if !ri.start.is_empty() {
        if ri.start_inclusive {
            if row < ri.start.as_ref() {
                return false;
            }
        } else if row <= ri.start.as_ref() {
            return false;
        }
    }
    if !ri.end.is_empty() {
        if ri.end_inclusive {
            if row > ri.end.as_ref() {
                return false;
            }
        } else if row >= ri.end.as_ref() {
            return false;
        }
    }
    true
}

fn column_selected(columns: &[String], cell: &StoredCell) -> bool {
    if columns.is_empty() {
        return true;
    }
    columns.iter().any(|col| match col.split_once(':') {
        Some((family, qualifier)) => {
            cell.family.as_ref() == family && cell.qualifier.as_ref() == qualifier.as_bytes()
        }
        None => cell.family.as_ref() == col.as_str(),
    })
}

fn predicate_matches(predicate: &ColumnPredicate, cell: &StoredCell) -> bool {
    if cell.family.as_ref() != predicate.column_family {
        return false;
    }
    let op = predicate.operation;
    if op & ops::QUALIFIER_EXACT_MATCH != 0 {
        match &predicate.column_qualifier {
            Some(q) if cell.qualifier.as_ref() == q.as_bytes() => {}
            _ => return false,
        }
    } else if op & ops::QUALIFIER_PREFIX_MATCH != 0 {
        match &predicate.column_qualifier {
            Some(q) if cell.qualifier.starts_with(q.as_bytes()) => {}
            _ => return false,
        }
    }
    if op & ops::EXACT_MATCH != 0 {
        cell.value == predicate.value
    } else if op & ops::PREFIX_MATCH != 0 {
        cell.value.starts_with(predicate.value.as_ref())
    } else if op & ops::REGEX_MATCH != 0 {
        let pattern = std::str::from_utf8(&predicate.value).expect("regex predicate utf8");
        regex::bytes::Regex::new(pattern)
            .expect("regex predicate")
            .is_match(&cell.value)
    } else {
        true
    }
}

struct MemScanner {
    id: u64,
    table_name: String,
    cancelled: AtomicBool,
}

impl TableScanner for MemScanner {
    fn id(&self) -> u64 {
        self.id
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

struct MemMutator {
    id: u64,
    table: Weak<MemTable>,
    sink: SinkRef,
}

impl TableMutator for MemMutator {
    fn id(&self) -> u64 {
        self.id
    }

    fn set(&self, key: KeySpec, value: &[u8]) -> Result<()> {
        let Some(table) = self.table.upgrade() else {
            bail!("table dropped");
        };
        let fail = *table.fail_mutations.lock().expect("fail_mutations lock");
        if let Some(code) = fail {
            let failure = FailedMutation {
                key,
                value: Bytes::copy_from_slice(value),
                code,
            };
            if let Some(sink) = self.sink.upgrade() {
                sink.update_error(self, code, &[failure]);
            }
            return Ok(());
        }
        let mut data = table.data.lock().expect("table data lock");
        data.entry(key.row).or_default().push(StoredCell {
            family: key.column_family,
            qualifier: key.column_qualifier,
            value: Bytes::copy_from_slice(value),
            timestamp: key.timestamp,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(sink) = self.sink.upgrade() {
            sink.update_ok(self);
        }
        Ok(())
    }
}

impl Table for MemTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn namespace(&self) -> Arc<dyn Namespace> {
        self.namespace.upgrade().expect("namespace alive")
    }

    fn create_scanner_async(
        &self,
        sink: SinkRef,
        spec: &ScanSpec,
        _timeout: Duration,
        _flags: ScannerFlags,
    ) -> Result<Arc<dyn TableScanner>> {
        let scanner = Arc::new(MemScanner {
            id: next_id(),
            table_name: self.name.clone(),
            cancelled: AtomicBool::new(false),
        });
        if let Some(strong) = sink.upgrade() {
            strong.register_scanner(scanner.as_ref());
        }
        let fail = self.fail_scan.lock().expect("fail_scan lock").clone();
        let batches = if fail.is_some() {
            Vec::new()
        } else {
            self.select_batches(spec)
        };
        let delay = Duration::from_millis(self.batch_delay_ms.load(Ordering::Relaxed));
        let thread_scanner = Arc::clone(&scanner);
        thread::spawn(move || {
            if let Some((code, message)) = fail {
                if let Some(sink) = sink.upgrade() {
                    sink.scan_error(thread_scanner.as_ref(), code, &message, true);
                }
                return;
            }
            for batch in batches {
                if thread_scanner.cancelled.load(Ordering::Relaxed) {
                    return;
                }
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                match sink.upgrade() {
                    Some(sink) => sink.scan_ok(thread_scanner.as_ref(), batch),
                    None => return,
                }
            }
        });
        Ok(scanner)
    }

    fn create_mutator_async(&self, sink: SinkRef) -> Result<Arc<dyn TableMutator>> {
        Ok(Arc::new(MemMutator {
            id: next_id(),
            table: self.self_ref.clone(),
            sink,
        }))
    }
}

/// In-memory namespace: a directory of `MemTable`s plus a record of
/// create/drop calls for lifecycle assertions.
pub struct MemNamespace {
    self_ref: Weak<MemNamespace>,
    path: String,
    client: Weak<MemClient>,
    tables: Mutex<BTreeMap<String, Arc<MemTable>>>,
    created: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
    default_batch_rows: AtomicUsize,
    default_fail_mutations: Mutex<Option<i32>>,
}

impl MemNamespace {
    /// Register a table directly (tests side-step `create_table` for
    /// pre-existing tables).
    pub fn add_table(&self, leaf: &str, schema: Schema) -> Arc<MemTable> {
        let table = MemTable::new(
            format!("{}/{leaf}", self.path),
            schema,
            self.self_ref.clone(),
            self.default_batch_rows.load(Ordering::Relaxed),
        );
        self.tables
            .lock()
            .expect("namespace tables lock")
            .insert(leaf.to_string(), Arc::clone(&table));
        table
    }

    /// Rows-per-batch for tables created through `create_table`.
    pub fn set_default_batch_rows(&self, rows: usize) {
        self.default_batch_rows.store(rows.max(1), Ordering::Relaxed);
    }

    /// Make mutations fail on every table later created through
    /// `create_table` (the staging table, in these tests).
    pub fn set_default_fail_mutations(&self, code: i32) {
        *self
            .default_fail_mutations
            .lock()
            .expect("default_fail_mutations lock") = Some(code);
    }

    pub fn created_tables(&self) -> Vec<String> {
        self.created.lock().expect("created lock").clone()
    }

    pub fn dropped_tables(&self) -> Vec<String> {
        self.dropped.lock().expect("dropped lock").clone()
    }

    pub fn table(&self, leaf: &str) -> Option<Arc<MemTable>> {
        self.tables
            .lock()
            .expect("namespace tables lock")
            .get(leaf)
            .cloned()
    }
}

impl Namespace for MemNamespace {
    fn name(&self) -> &str {
        &self.path
    }

    fn create_table(&self, name: &str, schema_xml: &str) -> Result<()> {
        let family_re = regex::Regex::new(r"<Name>([^<]+)</Name>").expect("family regex");
        let mut families = Vec::new();
        for (index, capture) in family_re.captures_iter(schema_xml).enumerate() {
            let mut cf = ColumnFamily::new(index as u32 + 1, &capture[1]);
            cf.max_versions = 1;
            families.push(cf);
        }
        let table = self.add_table(name, Schema::new(families));
        if let Some(code) = *self
            .default_fail_mutations
            .lock()
            .expect("default_fail_mutations lock")
        {
            table.set_fail_mutations(code);
        }
        self.created
            .lock()
            .expect("created lock")
            .push(name.to_string());
        Ok(())
    }

    fn open_table(&self, name: &str) -> Result<Arc<dyn Table>> {
        let table = self
            .table(name)
            .ok_or_else(|| anyhow!("table '{name}' not found in '{}'", self.path))?;
        Ok(table)
    }

    fn drop_table(&self, name: &str, if_exists: bool) -> Result<()> {
        let removed = self
            .tables
            .lock()
            .expect("namespace tables lock")
            .remove(name);
        if removed.is_none() && !if_exists {
            bail!("table '{name}' not found in '{}'", self.path);
        }
        if removed.is_some() {
            self.dropped
                .lock()
                .expect("dropped lock")
                .push(name.to_string());
        }
        Ok(())
    }

    fn client(&self) -> Arc<dyn Client> {
        self.client.upgrade().expect("client alive")
    }
}

/// In-memory client: namespaces created on first open.
pub struct MemClient {
    self_ref: Weak<MemClient>,
    namespaces: Mutex<BTreeMap<String, Arc<MemNamespace>>>,
}

impl MemClient {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            namespaces: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn namespace(&self, path: &str) -> Arc<MemNamespace> {
        let mut namespaces = self.namespaces.lock().expect("namespaces lock");
        Arc::clone(namespaces.entry(path.to_string()).or_insert_with(|| {
            Arc::new_cyclic(|self_ref| MemNamespace {
                self_ref: self_ref.clone(),
                path: path.to_string(),
                client: self.self_ref.clone(),
                tables: Mutex::new(BTreeMap::new()),
                created: Mutex::new(Vec::new()),
                dropped: Mutex::new(Vec::new()),
                default_batch_rows: AtomicUsize::new(100),
                default_fail_mutations: Mutex::new(None),
            })
        }))
    }
}

impl Client for MemClient {
    fn open_namespace(&self, path: &str) -> Result<Arc<dyn Namespace>> {
        Ok(self.namespace(path))
    }
}

/// User-side sink capturing everything the coordinator forwards.
#[derive(Default)]
struct SinkInner {
    batches: Vec<CellBatch>,
    terminal_batches: usize,
    scan_errors: Vec<(i32, String, bool)>,
    update_errors: Vec<i32>,
    outstanding: i64,
    increments: usize,
    decrements: usize,
}

#[derive(Default)]
pub struct CollectingSink {
    inner: Mutex<SinkInner>,
    cond: Condvar,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until a terminal batch or terminal error arrives, plus the
    /// matching outstanding-count decrement.
    pub fn wait_for_terminal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("sink lock");
        loop {
            let terminated =
                inner.terminal_batches > 0 || inner.scan_errors.iter().any(|e| e.2);
            if terminated && inner.decrements > 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .expect("sink wait");
            inner = guard;
        }
    }

    /// All delivered cells, in arrival order.
    pub fn cells(&self) -> Vec<Cell> {
        let inner = self.inner.lock().expect("sink lock");
        inner
            .batches
            .iter()
            .flat_map(|b| b.cells.iter().cloned())
            .collect()
    }

    /// Distinct row keys, sorted.
    pub fn row_keys(&self) -> Vec<Bytes> {
        let mut rows: Vec<Bytes> = self
            .cells()
            .into_iter()
            .map(|c| c.row)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        rows.sort();
        rows
    }

    pub fn terminal_batches(&self) -> usize {
        self.inner.lock().expect("sink lock").terminal_batches
    }

    pub fn scan_errors(&self) -> Vec<(i32, String, bool)> {
        self.inner.lock().expect("sink lock").scan_errors.clone()
    }

    pub fn update_errors(&self) -> Vec<i32> {
        self.inner.lock().expect("sink lock").update_errors.clone()
    }

    pub fn outstanding(&self) -> i64 {
        self.inner.lock().expect("sink lock").outstanding
    }

    pub fn increments(&self) -> usize {
        self.inner.lock().expect("sink lock").increments
    }

    pub fn decrements(&self) -> usize {
        self.inner.lock().expect("sink lock").decrements
    }
}

impl ScanSink for CollectingSink {
    fn register_scanner(&self, _scanner: &dyn TableScanner) {}

    fn scan_ok(&self, _scanner: &dyn TableScanner, cells: CellBatch) {
        let mut inner = self.inner.lock().expect("sink lock");
        if cells.eos {
            inner.terminal_batches += 1;
        }
        inner.batches.push(cells);
        self.cond.notify_all();
    }

    fn scan_error(&self, _scanner: &dyn TableScanner, code: i32, message: &str, eos: bool) {
        let mut inner = self.inner.lock().expect("sink lock");
        inner.scan_errors.push((code, message.to_string(), eos));
        self.cond.notify_all();
    }

    fn update_ok(&self, _mutator: &dyn TableMutator) {}

    fn update_error(&self, _mutator: &dyn TableMutator, code: i32, _failures: &[FailedMutation]) {
        let mut inner = self.inner.lock().expect("sink lock");
        inner.update_errors.push(code);
        self.cond.notify_all();
    }

    fn increment_outstanding(&self) {
        let mut inner = self.inner.lock().expect("sink lock");
        inner.outstanding += 1;
        inner.increments += 1;
    }

    fn decrement_outstanding(&self) {
        let mut inner = self.inner.lock().expect("sink lock");
        inner.outstanding -= 1;
        inner.decrements += 1;
        self.cond.notify_all();
    }
}

/// One primary table with its value- and qualifier-index tables.
pub struct TestCluster {
    pub client: Arc<MemClient>,
    pub namespace: Arc<MemNamespace>,
    pub primary: Arc<MemTable>,
    pub value_index: Arc<MemTable>,
    pub qualifier_index: Arc<MemTable>,
}

fn index_schema() -> Schema {
    Schema::new(vec![ColumnFamily::new(1, "idx")])
}

pub fn build_cluster(families: Vec<ColumnFamily>) -> TestCluster {
    init_logs();
    let client = MemClient::new();
    let namespace = client.namespace("/app");
    let primary = namespace.add_table("events", Schema::new(families));
    let value_index = namespace.add_table("^events", index_schema());
    let qualifier_index = namespace.add_table("^^events", index_schema());
    TestCluster {
        client,
        namespace,
        primary,
        value_index,
        qualifier_index,
    }
}

/// Insert a well-formed index entry pointing at `row`.
pub fn add_index_entry(index: &MemTable, family_id: u32, row: &str, indexed: &str, timestamp: i64) {
    let key = format!("{family_id},{row}\t{indexed}");
    index.insert_raw(
        Bytes::from(key.into_bytes()),
        "idx",
        Bytes::new(),
        Bytes::new(),
        timestamp,
    );
}

/// Insert an arbitrary (possibly malformed) index row key.
pub fn add_raw_index_key(index: &MemTable, key: &str, timestamp: i64) {
    index.insert_raw(
        Bytes::copy_from_slice(key.as_bytes()),
        "idx",
        Bytes::new(),
        Bytes::new(),
        timestamp,
    );
}

/// Write one cell into a table.
pub fn put(table: &MemTable, row: &str, family: &str, qualifier: &str, value: &str, timestamp: i64) {
    table.insert_raw(
        Bytes::copy_from_slice(row.as_bytes()),
        family,
        Bytes::copy_from_slice(qualifier.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes()),
        timestamp,
    );
}
