//! The cache transaction: staging, refresh, diff and commit.

use crate::combine::install_pair_rules;
use crate::tables::LocalTables;
use crate::{Orientation, PodConfig, RendererCache};
use ahash::AHashMap as HashMap;
use podnet_policy_core::{Network, PodId, PodSet, Rule, RuleTable, TableId, TableKind};
use tracing::debug;

/// One unit of the diff reported by [`CacheTxn::changes`]: a table to
/// (re)program together with the pods that held it before the transaction.
/// A table whose new pod set is empty is to be removed.
#[derive(Clone, Debug)]
pub struct TxnChange {
    pub table: RuleTable,
    pub previous_pods: PodSet,
}

/// A single transaction of the cache. Staged tables are refreshed lazily:
/// the first query after an update recomputes them.
pub struct CacheTxn<'a> {
    cache: &'a mut RendererCache,

    local_tables: LocalTables,
    global_table: Option<RuleTable>,
    up_to_date: bool,

    /// Configuration overlay as received through [`CacheTxn::update`].
    config: HashMap<PodId, PodConfig>,
}

// === impl CacheTxn ===

impl<'a> CacheTxn<'a> {
    pub(crate) fn new(cache: &'a mut RendererCache) -> Self {
        Self {
            cache,
            local_tables: LocalTables::new(),
            global_table: None,
            up_to_date: false,
            config: HashMap::default(),
        }
    }

    /// Overlays the configuration of one pod.
    pub fn update(&mut self, pod: PodId, config: PodConfig) {
        debug!(pod = %pod, removed = config.removed, "updating pod");
        self.config.insert(pod, config);
        self.up_to_date = false;
    }

    /// All pods touched by this transaction.
    pub fn updated_pods(&self) -> PodSet {
        self.config.keys().cloned().collect()
    }

    /// Pods this transaction removes.
    pub fn removed_pods(&self) -> PodSet {
        self.config
            .iter()
            .filter(|(_, cfg)| cfg.removed)
            .map(|(pod, _)| pod.clone())
            .collect()
    }

    /// The pod's configuration as pending in the transaction, falling back
    /// to the committed state.
    pub fn get_pod_config(&self, pod: &PodId) -> Option<&PodConfig> {
        self.config
            .get(pod)
            .or_else(|| self.cache.get_pod_config(pod))
    }

    /// Pods that will be tracked if the transaction commits as-is.
    pub fn get_all_pods(&self) -> PodSet {
        let mut pods = self.cache.get_all_pods();
        for (pod, cfg) in self.config.iter() {
            if cfg.removed {
                pods.remove(pod);
            } else {
                pods.insert(pod.clone());
            }
        }
        pods
    }

    /// Pods that will have a local table if the transaction commits as-is.
    pub fn get_isolated_pods(&mut self) -> PodSet {
        if !self.up_to_date {
            self.refresh_tables();
        }
        let mut isolated = self.local_tables.isolated_pods();
        for pod in self.cache.get_isolated_pods() {
            if self.local_tables.lookup_by_pod(&pod).is_none() {
                isolated.insert(pod);
            }
        }
        isolated
    }

    /// The local table the pod will have if the transaction commits as-is;
    /// `None` for non-isolated pods.
    pub fn get_local_table_by_pod(&mut self, pod: &PodId) -> Option<&RuleTable> {
        if !self.up_to_date {
            self.refresh_tables();
        }
        match self.local_tables.lookup_by_pod(pod) {
            Some(table) if table.rules().is_empty() => None,
            Some(table) => Some(table),
            None => self.cache.get_local_table_by_pod(pod),
        }
    }

    /// The global table that will be installed if the transaction commits
    /// as-is.
    pub fn get_global_table(&mut self) -> &RuleTable {
        if !self.up_to_date {
            self.refresh_tables();
        }
        match &self.global_table {
            Some(table) => table,
            None => &self.cache.global_table,
        }
    }

    /// The minimal set of changes prepared in the transaction so far, in
    /// deterministic (table-id) order with a global-table change last.
    pub fn changes(&mut self) -> Vec<TxnChange> {
        if !self.up_to_date {
            self.refresh_tables();
        }

        let mut changes: Vec<(TableId, TxnChange)> = Vec::new();
        for (id, table) in self.local_tables.iter() {
            if table.rules().is_empty() {
                // Empty tables mark non-isolated pods; never surfaced.
                continue;
            }
            let orig = self.cache.local_tables.lookup_by_id(id);
            match orig {
                // Created and dropped within the same transaction.
                None if table.pods.is_empty() => continue,
                // Nothing really changed for this table.
                Some(orig) if orig.pods == table.pods => continue,
                _ => {}
            }
            changes.push((
                *id,
                TxnChange {
                    table: table.clone(),
                    previous_pods: orig.map(|t| t.pods.clone()).unwrap_or_default(),
                },
            ));
        }
        changes.sort_by_key(|(id, _)| *id);
        let mut changes: Vec<TxnChange> = changes.into_iter().map(|(_, change)| change).collect();

        if let Some(global) = &self.global_table {
            if global.rules() != self.cache.global_table.rules() {
                changes.push(TxnChange {
                    table: global.clone(),
                    previous_pods: PodSet::new(),
                });
            }
        }

        changes
    }

    /// Applies the staged state to the underlying cache.
    pub fn commit(mut self) {
        if !self.up_to_date {
            self.refresh_tables();
        }
        let CacheTxn {
            cache,
            local_tables,
            global_table,
            config,
            ..
        } = self;

        for (id, table) in local_tables.into_entries() {
            let orig_pods = cache.local_tables.lookup_by_id(&id).map(|t| t.pods.clone());
            match orig_pods {
                Some(orig_pods) => {
                    if table.pods.is_empty() {
                        debug!(table = %id, "local table removed in the transaction");
                        cache.local_tables.remove(&id);
                    } else if orig_pods != table.pods {
                        debug!(table = %id, "local table re-assigned in the transaction");
                        for pod in orig_pods.difference(&table.pods) {
                            cache.local_tables.unassign_pod(Some(&id), pod);
                        }
                        for pod in table.pods.difference(&orig_pods) {
                            cache.local_tables.assign_pod(&id, pod.clone());
                        }
                        // The renderer may have replaced the private slot.
                        if let Some(orig) = cache.local_tables.lookup_by_id_mut(&id) {
                            orig.private = table.private.clone();
                        }
                    }
                }
                None => {
                    // Rule-less tables only mark non-isolated pods within the
                    // transaction; the committed cache holds neither them nor
                    // tables nobody is assigned to.
                    if !table.pods.is_empty() && !table.rules().is_empty() {
                        debug!(table = %id, "new local table created in the transaction");
                        cache.local_tables.insert(table);
                    }
                }
            }
        }

        if let Some(global) = global_table {
            if global.rules() != cache.global_table.rules() {
                cache.global_table = global;
            }
        }

        for (pod, cfg) in config {
            if cfg.removed {
                cache.config.remove(&pod);
                cache.local_tables.unassign_pod(None, &pod);
            } else {
                cache.config.insert(pod, cfg);
            }
        }
    }

    /// Recomputes the staged local tables and the global table from the
    /// transaction's view of the configuration.
    fn refresh_tables(&mut self) {
        let mut pods = self.get_all_pods();
        pods.extend(self.removed_pods());

        for pod in pods {
            let cfg = self.get_pod_config(&pod).cloned().unwrap_or_default();
            let mut new_table = self.build_local_table(&pod, &cfg);

            // Stage the pod's committed table so pod moves are tracked
            // against it.
            if let Some(orig_id) = self.cache.local_tables.table_id_of_pod(&pod) {
                if self.local_tables.lookup_by_id(&orig_id).is_none() {
                    let copy = self
                        .cache
                        .local_tables
                        .lookup_by_id(&orig_id)
                        .expect("pod index points at an existing table")
                        .clone();
                    self.local_tables.insert(copy);
                }
            }

            // Attach to a staged table with the same content, if any.
            let new_id = new_table.id();
            if self.local_tables.lookup_by_id(&new_id).is_some() {
                self.local_tables.assign_pod(&new_id, pod);
                continue;
            }

            // Or share a committed table with the same content.
            if let Some(shared) = self.cache.local_tables.lookup_by_rules(new_table.rules()) {
                let mut copy = shared.clone();
                copy.assign_pod(pod);
                self.local_tables.insert(copy);
                continue;
            }

            self.local_tables.insert(new_table);
        }

        self.rebuild_global_table();
        self.up_to_date = true;
    }

    /// Builds the candidate local table for one pod.
    fn build_local_table(&self, pod: &PodId, cfg: &PodConfig) -> RuleTable {
        let mut table = RuleTable::new(TableKind::Local);
        table.assign_pod(pod.clone());
        if cfg.removed {
            // A removed pod keeps an empty marker table until commit.
            return table;
        }

        // The rules that already follow the cache orientation apply as-is.
        let own_rules = match self.cache.orientation {
            Orientation::Egress => &cfg.egress,
            Orientation::Ingress => &cfg.ingress,
        };
        for rule in own_rules {
            table.insert_rule(*rule);
        }

        // Fold in the opposite-direction rules of every pod on the node.
        for src_pod in self.get_all_pods() {
            if let Some(src_cfg) = self.get_pod_config(&src_pod) {
                install_pair_rules(&mut table, cfg, src_cfg, self.cache.orientation);
            }
        }

        // Close the table over traffic no rule matched.
        if !table.rules().is_empty() {
            let has_catch_all = table.rules().sorted().iter().any(Rule::matches_anything);
            if !has_catch_all {
                table.insert_rule(Rule::allow_all());
            }
        }

        table
    }

    /// Rebuilds the global table: every pod's opposite-orientation rules,
    /// anchored on the pod's own address.
    fn rebuild_global_table(&mut self) {
        let mut global = RuleTable::new(TableKind::Global);

        for pod in self.get_all_pods() {
            let cfg = match self.get_pod_config(&pod) {
                Some(cfg) => cfg,
                None => continue,
            };
            let pod_ip = match cfg.pod_ip {
                Some(pod_ip) => pod_ip,
                None => continue,
            };
            let rules = match self.cache.orientation {
                Orientation::Egress => &cfg.ingress,
                Orientation::Ingress => &cfg.egress,
            };
            for rule in rules {
                let mut rule = *rule;
                match self.cache.orientation {
                    Orientation::Egress => rule.src_net = Network::Net(pod_ip),
                    Orientation::Ingress => rule.dst_net = Network::Net(pod_ip),
                }
                global.insert_rule(rule);
            }
        }

        if !global.rules().is_empty() {
            // Traffic not named by any pod's rules stays allowed.
            global.insert_rule(Rule::allow_all());
        }

        self.global_table = Some(global);
    }
}
