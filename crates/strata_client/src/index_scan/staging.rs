//! Staging-table lifecycle.
//!
//! When the candidate set outgrows the in-memory cutoff, the
//! coordinator spills it into an ephemeral table that mirrors the
//! primary table's indexed column families. The table lives in the
//! reserved staging namespace under a fresh GUID name and is dropped
//! exactly once when the coordinator goes away.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use strata_core::key::KeySpec;
use strata_core::schema::Schema;

use crate::api::{Namespace, SinkRef, Table, TableMutator};

/// Reserved namespace for staging tables.
pub(crate) const STAGING_NAMESPACE: &str = "/tmp";

/// Schema for a staging table: a single "default" access group holding
/// one family per indexed family of the primary table, restricted to
/// the index kind the scan uses.
pub(crate) fn staging_schema_xml(schema: &Schema, qualifier_scan: bool) -> String {
    let mut inner = String::new();
    for cf in schema.column_families() {
        if cf.deleted {
            continue;
        }
        if qualifier_scan && !cf.has_qualifier_index {
            continue;
        }
        if !qualifier_scan && !cf.has_index {
            continue;
        }
        let _ = write!(
            inner,
            "<ColumnFamily><Name>{}</Name><Counter>false</Counter>\
             <MaxVersions>1</MaxVersions><deleted>false</deleted></ColumnFamily>",
            cf.name
        );
    }
    format!("<Schema><AccessGroup name=\"default\">{inner}</AccessGroup></Schema>")
}

/// A live staging table plus its mutator. Dropping this drops the
/// table.
pub(crate) struct StagingTable {
    namespace: Arc<dyn Namespace>,
    table: Arc<dyn Table>,
    mutator: Option<Arc<dyn TableMutator>>,
    leaf: String,
}

impl std::fmt::Debug for StagingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingTable")
            .field("leaf", &self.leaf)
            .field("mutator_open", &self.mutator.is_some())
            .finish()
    }
}

impl StagingTable {
    /// Create the table and open its mutator. Creation is synchronous;
    /// it happens at most once per scan.
    pub(crate) fn create(primary: &dyn Table, qualifier_scan: bool, sink: SinkRef) -> Result<Self> {
        let xml = staging_schema_xml(primary.schema().as_ref(), qualifier_scan);
        let client = primary.namespace().client();
        let namespace = client
            .open_namespace(STAGING_NAMESPACE)
            .context("open staging namespace")?;
        let leaf = Uuid::new_v4().to_string();
        namespace
            .create_table(&leaf, &xml)
            .with_context(|| format!("create staging table '{leaf}'"))?;
        let table = namespace
            .open_table(&leaf)
            .with_context(|| format!("open staging table '{leaf}'"))?;
        let mutator = table
            .create_mutator_async(sink)
            .context("open staging mutator")?;
        debug!(table = %leaf, "created staging table for index scan");
        Ok(Self {
            namespace,
            table,
            mutator: Some(mutator),
            leaf,
        })
    }

    /// Queue one candidate row. The value is empty; the row key,
    /// family, and timestamp carry everything verification needs.
    pub(crate) fn write(&self, key: KeySpec) -> Result<()> {
        match &self.mutator {
            Some(mutator) => mutator.set(key, b""),
            None => Err(anyhow!("staging mutator already closed")),
        }
    }

    /// Flush and retire the mutator; must run before the staging table
    /// is scanned.
    pub(crate) fn close_mutator(&mut self) -> Result<()> {
        match self.mutator.take() {
            Some(mutator) => mutator.close(),
            None => Ok(()),
        }
    }

    pub(crate) fn table(&self) -> &Arc<dyn Table> {
        &self.table
    }
}

impl Drop for StagingTable {
    fn drop(&mut self) {
        if let Some(mutator) = self.mutator.take() {
            if let Err(err) = mutator.close() {
                warn!(table = %self.leaf, error = %format!("{err:#}"), "staging mutator close failed");
            }
        }
        match self.namespace.drop_table(&self.leaf, true) {
            Ok(()) => debug!(table = %self.leaf, "dropped staging table"),
            Err(err) => {
                warn!(table = %self.leaf, error = %format!("{err:#}"), "failed to drop staging table");
            }
        }
    }
}
