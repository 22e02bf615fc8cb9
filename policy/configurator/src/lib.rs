//! Translates sets of pod-attached policies into ingress and egress rule
//! lists and applies them to the target network stack via registered
//! renderers.
//!
//! Policy direction is written from the pod's point of view, while rules are
//! evaluated from the switch's: traffic arriving at a pod leaves the switch.
//! The configurator performs that flip once, here: a pod's ingress matches
//! become the renderer's egress rules and vice versa.
//!
//! For the best renderer performance the generated sequence of rules is the
//! shortest one implementing the given policies, and the same set of policies
//! always results in the same list of rules so that renderers can share one
//! table between pods.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod generate;
mod policy;
#[cfg(test)]
mod tests;

pub use self::policy::{
    L4Protocol, Match, MatchDirection, NetworkMatch, Policy, PolicyId, PolicyKind, PortMatch,
};

use self::generate::generate_rules;
use ahash::AHashMap as HashMap;
use anyhow::Result;
use futures::future;
use podnet_policy_core::{
    parse_host_subnet, IpNet, Ipam, PodId, PodLookup, PolicyRenderer, RendererTxn, RuleList,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Compiles pod policies into rule lists and feeds them to every registered
/// renderer. Renderers for different network stacks can be registered side by
/// side; each receives the rules for all pods on the node.
pub struct PolicyConfigurator {
    lookup: Arc<dyn PodLookup>,
    ipam: Arc<dyn Ipam>,
    renderers: Vec<Box<dyn PolicyRenderer>>,
    parallel_rendering: bool,

    /// Addresses of the pods configured so far, as one-host subnets.
    pod_ips: HashMap<PodId, IpNet>,
}

/// A single transaction of the configurator. Configuration is only applied on
/// [`ConfiguratorTxn::commit`].
pub struct ConfiguratorTxn<'a> {
    configurator: &'a mut PolicyConfigurator,
    resync: bool,
    config: BTreeMap<PodId, Vec<Arc<Policy>>>,
    pod_ips: HashMap<PodId, IpNet>,
}

/// Rules already generated for a policy set within one commit. The same set
/// attached to several pods is only processed once.
struct ProcessedPolicySet {
    policies: Vec<PolicyId>,
    ingress: Arc<RuleList>,
    egress: Arc<RuleList>,
}

// === impl PolicyConfigurator ===

impl PolicyConfigurator {
    pub fn new(
        lookup: Arc<dyn PodLookup>,
        ipam: Arc<dyn Ipam>,
        parallel_rendering: bool,
    ) -> Self {
        Self {
            lookup,
            ipam,
            renderers: Vec::new(),
            parallel_rendering,
            pod_ips: HashMap::default(),
        }
    }

    /// Registers a renderer. It is up to the renderer to filter out rules for
    /// pods without an inter-connection in its network stack.
    pub fn register_renderer(&mut self, renderer: Box<dyn PolicyRenderer>) {
        self.renderers.push(renderer);
    }

    /// Starts a new transaction. With `resync` the supplied configuration
    /// completely replaces the existing one; otherwise pods not mentioned in
    /// the transaction are left unchanged.
    pub fn new_txn(&mut self, resync: bool) -> ConfiguratorTxn<'_> {
        let pod_ips = if resync {
            HashMap::default()
        } else {
            self.pod_ips.clone()
        };
        ConfiguratorTxn {
            configurator: self,
            resync,
            config: BTreeMap::new(),
            pod_ips,
        }
    }
}

// === impl ConfiguratorTxn ===

impl ConfiguratorTxn<'_> {
    /// Replaces the set of policies applied to a pod. The order of policies
    /// is irrelevant; they are treated as a set.
    pub fn configure(&mut self, pod: PodId, policies: Vec<Arc<Policy>>) -> &mut Self {
        debug!(pod = %pod, policies = policies.len(), "configure");
        self.config.insert(pod, policies);
        self
    }

    /// Generates rules for every configured pod and commits them through the
    /// registered renderers.
    ///
    /// Pods are processed in id order and policy sets are memoized across
    /// pods, so identical inputs produce identical renderer calls. Renderer
    /// transactions commit sequentially, or concurrently when the
    /// configurator was built with parallel rendering; either way the last
    /// observed error is returned and the rest are logged.
    pub async fn commit(mut self) -> Result<()> {
        let mut processed: Vec<ProcessedPolicySet> = Vec::new();
        let mut renderer_txns: Vec<Box<dyn RendererTxn>> = Vec::new();
        let config = std::mem::take(&mut self.config);

        for (pod, unordered) in &config {
            let empty = Arc::new(RuleList::new());
            let mut removed = false;
            let pod_ip: IpNet;
            let (ingress, egress): (Arc<RuleList>, Arc<RuleList>);

            let addr = self
                .configurator
                .lookup
                .lookup_pod(pod)
                .map(|data| data.ip_address)
                .unwrap_or_default();

            if addr.is_empty() {
                match self.pod_ips.remove(pod) {
                    Some(previous_ip) => {
                        debug!(pod = %pod, "removing policies from the pod");
                        removed = true;
                        pod_ip = previous_ip;
                        ingress = empty.clone();
                        egress = empty;
                    }
                    // Never had an address: nothing was ever rendered.
                    None => continue,
                }
            } else {
                pod_ip = match parse_host_subnet(&addr) {
                    Some(subnet) => subnet,
                    None => {
                        warn!(pod = %pod, ip = %addr, "pod has an invalid address assigned");
                        continue;
                    }
                };
                self.pod_ips.insert(pod.clone(), pod_ip);

                // Sort policies so the same set always takes the same shape.
                let mut policies = unordered.clone();
                policies.sort();
                let ids: Vec<PolicyId> = policies.iter().map(|p| p.id.clone()).collect();

                match processed.iter().find(|set| set.policies == ids) {
                    Some(hit) => {
                        ingress = hit.ingress.clone();
                        egress = hit.egress.clone();
                    }
                    None => {
                        // The pod's ingress matches restrict traffic that
                        // leaves the switch towards the pod, and vice versa.
                        let egress_rules = generate_rules(
                            MatchDirection::Ingress,
                            &policies,
                            &*self.configurator.lookup,
                            &*self.configurator.ipam,
                        );
                        let ingress_rules = generate_rules(
                            MatchDirection::Egress,
                            &policies,
                            &*self.configurator.lookup,
                            &*self.configurator.ipam,
                        );
                        ingress = Arc::new(ingress_rules);
                        egress = Arc::new(egress_rules);
                        processed.push(ProcessedPolicySet {
                            policies: ids,
                            ingress: ingress.clone(),
                            egress: egress.clone(),
                        });
                    }
                }
            }

            if renderer_txns.is_empty() {
                for renderer in &self.configurator.renderers {
                    renderer_txns.push(renderer.new_txn(self.resync));
                }
            }
            for txn in renderer_txns.iter_mut() {
                txn.render(
                    pod.clone(),
                    pod_ip,
                    ingress.to_vec(),
                    egress.to_vec(),
                    removed,
                );
            }
        }

        let mut result = Ok(());
        if self.configurator.parallel_rendering {
            let outcomes = future::join_all(renderer_txns.iter_mut().map(|t| t.commit())).await;
            for outcome in outcomes {
                if let Err(error) = outcome {
                    warn!(%error, "renderer commit failed");
                    result = Err(error);
                }
            }
        } else {
            for txn in renderer_txns.iter_mut() {
                if let Err(error) = txn.commit().await {
                    warn!(%error, "renderer commit failed");
                    result = Err(error);
                }
            }
        }

        // The address map is saved even when a renderer failed: the caller is
        // expected to follow up with a resync.
        self.configurator.pod_ips = self.pod_ips;

        result
    }
}
