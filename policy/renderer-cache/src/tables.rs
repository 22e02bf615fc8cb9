//! The store of local tables, indexed by content identity and by pod.

use ahash::AHashMap as HashMap;
use podnet_policy_core::{PodId, PodSet, RuleList, RuleTable, TableId};
use std::collections::hash_map::Entry;

/// Owns the local tables. Because a table's id is derived from its rule
/// content, the by-id index doubles as the by-content index used for
/// structural sharing; a separate by-rules map is unnecessary.
#[derive(Debug, Default)]
pub(crate) struct LocalTables {
    by_id: HashMap<TableId, RuleTable>,
    by_pod: HashMap<PodId, TableId>,
}

impl LocalTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table. Pods the table claims are re-homed: removed from
    /// whichever table currently holds them, so a pod never belongs to two
    /// tables. Inserting content already present merges the pod sets.
    pub fn insert(&mut self, mut table: RuleTable) {
        let id = table.id();
        let pods: Vec<PodId> = table.pods.iter().cloned().collect();
        match self.by_id.entry(id) {
            Entry::Occupied(mut entry) => {
                for pod in &pods {
                    entry.get_mut().assign_pod(pod.clone());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(table);
            }
        }
        for pod in pods {
            if let Some(previous) = self.by_pod.insert(pod.clone(), id) {
                if previous != id {
                    if let Some(table) = self.by_id.get_mut(&previous) {
                        table.unassign_pod(&pod);
                    }
                }
            }
        }
    }

    pub fn remove(&mut self, id: &TableId) -> Option<RuleTable> {
        let table = self.by_id.remove(id)?;
        for pod in &table.pods {
            if self.by_pod.get(pod) == Some(id) {
                self.by_pod.remove(pod);
            }
        }
        Some(table)
    }

    pub fn lookup_by_id(&self, id: &TableId) -> Option<&RuleTable> {
        self.by_id.get(id)
    }

    pub fn lookup_by_id_mut(&mut self, id: &TableId) -> Option<&mut RuleTable> {
        self.by_id.get_mut(id)
    }

    pub fn lookup_by_pod(&self, pod: &PodId) -> Option<&RuleTable> {
        self.by_pod.get(pod).and_then(|id| self.by_id.get(id))
    }

    pub fn table_id_of_pod(&self, pod: &PodId) -> Option<TableId> {
        self.by_pod.get(pod).copied()
    }

    /// Content lookup through the content-derived id.
    pub fn lookup_by_rules(&self, rules: &RuleList) -> Option<&RuleTable> {
        self.by_id.get(&TableId::of(rules))
    }

    /// Attaches a pod to the given table, detaching it from its current one.
    pub fn assign_pod(&mut self, id: &TableId, pod: PodId) {
        if let Some(previous) = self.by_pod.get(&pod).copied() {
            if previous == *id {
                return;
            }
            if let Some(table) = self.by_id.get_mut(&previous) {
                table.unassign_pod(&pod);
            }
        }
        if let Some(table) = self.by_id.get_mut(id) {
            table.assign_pod(pod.clone());
            self.by_pod.insert(pod, *id);
        }
    }

    /// Detaches a pod. With `id` given, only that table is touched; without,
    /// the pod is removed from whichever table holds it.
    pub fn unassign_pod(&mut self, id: Option<&TableId>, pod: &PodId) {
        let current = match self.by_pod.get(pod) {
            Some(current) => *current,
            None => return,
        };
        if let Some(id) = id {
            if *id != current {
                return;
            }
        }
        if let Some(table) = self.by_id.get_mut(&current) {
            table.unassign_pod(pod);
        }
        self.by_pod.remove(pod);
    }

    /// Pods assigned to a table with at least one rule. Empty tables mark
    /// non-isolated pods and do not count.
    pub fn isolated_pods(&self) -> PodSet {
        let mut pods = PodSet::new();
        for table in self.by_id.values() {
            if !table.rules().is_empty() {
                pods.extend(table.pods.iter().cloned());
            }
        }
        pods
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TableId, &RuleTable)> {
        self.by_id.iter()
    }

    pub fn into_entries(self) -> impl Iterator<Item = (TableId, RuleTable)> {
        self.by_id.into_iter()
    }
}
