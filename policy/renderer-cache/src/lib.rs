//! Incremental cache of compiled rule tables, kept by a renderer between
//! transactions.
//!
//! The cache tracks the currently programmed state as a set of *local* tables
//! (one per isolated pod, or per group of pods whose rulesets are identical)
//! plus one *global* table with node-wide rules. Transactions stage pod
//! configuration updates, and [`CacheTxn::changes`] reports the minimal set
//! of tables a renderer has to (re)program: tables are looked up by the
//! content-derived [`TableId`], so a pod whose new ruleset matches an
//! existing table is attached to it instead of producing a duplicate.
//!
//! Rules stored here follow the switch viewpoint already; the cache
//! orientation only decides at which end of the switch they attach, and with
//! it which field of a rule anchors the pod's own address.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod combine;
mod tables;
mod txn;

pub use self::txn::{CacheTxn, TxnChange};

use self::tables::LocalTables;
use ahash::AHashMap as HashMap;
use podnet_policy_core::{IpNet, PodId, PodSet, Rule, RuleTable, TableKind};
use thiserror::Error;

/// Anchor point of the rules in the destination network stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    /// Rules attach where traffic enters the switch.
    Ingress,
    /// Rules attach where traffic leaves the switch.
    Egress,
}

/// Compiled configuration of one pod as received from the configurator,
/// i.e. already in the switch viewpoint.
#[derive(Clone, Debug, Default)]
pub struct PodConfig {
    /// The pod's address as a one-host subnet. `None` only for pods whose
    /// configuration could not be reconstructed, e.g. after a resync.
    pub pod_ip: Option<IpNet>,

    /// Rules for traffic entering the switch, i.e. sent by the pod.
    pub ingress: Vec<Rule>,

    /// Rules for traffic leaving the switch, i.e. delivered to the pod.
    pub egress: Vec<Rule>,

    /// Marks the pod for removal from the cache.
    pub removed: bool,
}

/// Errors returned by [`RendererCache::resync`].
#[derive(Debug, Error)]
pub enum ResyncError {
    #[error("pod {0} is assigned to multiple local tables")]
    PodInMultipleTables(PodId),

    #[error("more than one global table supplied")]
    MultipleGlobalTables,
}

/// The cache itself. All mutation goes through [`RendererCache::new_txn`];
/// the borrow taken by the transaction is what serializes access.
pub struct RendererCache {
    pub(crate) orientation: Orientation,
    pub(crate) local_tables: LocalTables,
    pub(crate) global_table: RuleTable,
    pub(crate) config: HashMap<PodId, PodConfig>,
}

// === impl RendererCache ===

impl RendererCache {
    pub fn new(orientation: Orientation) -> Self {
        Self {
            orientation,
            local_tables: LocalTables::new(),
            global_table: RuleTable::new(TableKind::Global),
            config: HashMap::default(),
        }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Wipes the cache content completely.
    pub fn flush(&mut self) {
        self.local_tables = LocalTables::new();
        self.global_table = RuleTable::new(TableKind::Global);
        self.config.clear();
    }

    /// Starts a new transaction. Changes are reflected in the cache only
    /// after [`CacheTxn::commit`].
    pub fn new_txn(&mut self) -> CacheTxn<'_> {
        CacheTxn::new(self)
    }

    /// Atomically replaces the cache content with the supplied tables, e.g.
    /// as read back from the network stack. A validation failure leaves the
    /// cache untouched.
    ///
    /// The per-pod configuration cannot be reconstructed from tables, but the
    /// set of tracked pods can: every pod assigned to a table is re-entered
    /// with an empty [`PodConfig`].
    pub fn resync(&mut self, tables: Vec<RuleTable>) -> Result<(), ResyncError> {
        let mut config: HashMap<PodId, PodConfig> = HashMap::default();
        let mut local_tables = LocalTables::new();
        let mut global_table: Option<RuleTable> = None;

        for table in tables {
            match table.kind {
                TableKind::Global => {
                    if global_table.is_some() {
                        return Err(ResyncError::MultipleGlobalTables);
                    }
                    global_table = Some(table);
                }
                TableKind::Local => {
                    if table.pods.is_empty() {
                        // A local table nobody uses carries no state.
                        continue;
                    }
                    for pod in &table.pods {
                        if config.contains_key(pod) {
                            return Err(ResyncError::PodInMultipleTables(pod.clone()));
                        }
                        config.insert(pod.clone(), PodConfig::default());
                    }
                    local_tables.insert(table);
                }
            }
        }

        self.local_tables = local_tables;
        self.global_table = global_table.unwrap_or_else(|| RuleTable::new(TableKind::Global));
        self.config = config;
        Ok(())
    }

    /// The configuration of a pod as last passed through
    /// [`CacheTxn::update`], or `None` for untracked pods.
    pub fn get_pod_config(&self, pod: &PodId) -> Option<&PodConfig> {
        self.config.get(pod)
    }

    /// All pods currently tracked by the cache.
    pub fn get_all_pods(&self) -> PodSet {
        self.config.keys().cloned().collect()
    }

    /// Pods with a local table assigned. The term is borrowed from
    /// Kubernetes: a pod becomes isolated by being selected by a policy.
    pub fn get_isolated_pods(&self) -> PodSet {
        self.local_tables.isolated_pods()
    }

    /// The local table assigned to a pod, `None` for non-isolated pods.
    pub fn get_local_table_by_pod(&self, pod: &PodId) -> Option<&RuleTable> {
        self.local_tables
            .lookup_by_pod(pod)
            .filter(|table| !table.rules().is_empty())
    }

    /// The global table. Never absent; an empty rule list means allow-all.
    pub fn get_global_table(&self) -> &RuleTable {
        &self.global_table
    }
}
