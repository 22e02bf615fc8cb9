use crate::{PodId, PodSet, Rule, RuleList};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Distinguishes per-pod tables from the node-wide table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Local,
    Global,
}

/// Identity of a rule table, derived from its canonical rule serialization.
///
/// Tables with equal sorted rule lists always share the same id, across
/// processes and restarts, which is what content-based table sharing and
/// diffing key on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId([u8; 32]);

/// An ordered, de-duplicated set of rules together with the pods it is
/// attached to.
///
/// A `Local` table belongs to one or more pods with identical rulesets; the
/// single `Global` table belongs to none. The table id is computed lazily
/// from the rule content and is invalidated by rule mutation, never by pod
/// assignment.
#[derive(Clone)]
pub struct RuleTable {
    pub kind: TableKind,
    rules: RuleList,
    pub pods: PodSet,
    /// Renderer-owned state carried with the table across commits.
    pub private: Option<Arc<dyn Any + Send + Sync>>,
    id: Option<TableId>,
}

// === impl TableId ===

impl TableId {
    /// Derives the identity of a rule list.
    pub fn of(rules: &RuleList) -> Self {
        let mut buf = Vec::with_capacity(rules.len() * 16);
        for rule in rules.sorted() {
            rule.encode(&mut buf);
        }
        Self(Sha256::digest(&buf).into())
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self)
    }
}

// === impl RuleTable ===

impl RuleTable {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            rules: RuleList::new(),
            pods: PodSet::new(),
            private: None,
            id: None,
        }
    }

    /// Inserts a rule; returns false if an equal rule is already present.
    pub fn insert_rule(&mut self, rule: Rule) -> bool {
        let inserted = self.rules.insert(rule);
        if inserted {
            self.id = None;
        }
        inserted
    }

    /// Removes every rule matching the predicate.
    pub fn remove_rules_where(&mut self, pred: impl FnMut(&Rule) -> bool) {
        self.rules.remove_where(pred);
        self.id = None;
    }

    pub fn rules(&self) -> &RuleList {
        &self.rules
    }

    /// The content-derived identity, computed on first use and cached until
    /// the rules change.
    pub fn id(&mut self) -> TableId {
        if let Some(id) = self.id {
            return id;
        }
        let id = TableId::of(&self.rules);
        self.id = Some(id);
        id
    }

    pub fn assign_pod(&mut self, pod: PodId) {
        self.pods.insert(pod);
    }

    pub fn unassign_pod(&mut self, pod: &PodId) -> bool {
        self.pods.remove(pod)
    }
}

impl fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleTable")
            .field("kind", &self.kind)
            .field("rules", &self.rules)
            .field("pods", &self.pods)
            .field("id", &self.id)
            .finish()
    }
}
