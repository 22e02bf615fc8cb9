//! Rule generation: one pod-view direction of a sorted policy set into a
//! rule list.

use crate::policy::{L4Protocol, Match, MatchDirection, Policy, PolicyKind, PortMatch};
use podnet_policy_core::{
    host_subnet, parse_host_subnet, subtract, Action, IpNet, Ipam, Network, PodLookup, Protocol,
    Rule, RuleList, ANY_PORT,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Generates the rules implementing `policies` for one pod-view direction.
///
/// The same sorted policy set always yields the same list so renderers can
/// share tables between pods. Direction here is the pod's: the caller is
/// responsible for flipping to the switch viewpoint when emitting.
pub(crate) fn generate_rules(
    direction: MatchDirection,
    policies: &[Arc<Policy>],
    lookup: &dyn PodLookup,
    ipam: &dyn Ipam,
) -> RuleList {
    let mut rules = RuleList::new();
    let mut has_policy = false;
    let mut all_allowed = false;

    for policy in policies {
        match (policy.kind, direction) {
            (PolicyKind::Ingress, MatchDirection::Egress)
            | (PolicyKind::Egress, MatchDirection::Ingress) => continue,
            _ => {}
        }
        has_policy = true;

        for clause in policy.matches.iter().filter(|m| m.direction == direction) {
            let peers = resolve_peers(clause, lookup);
            let subnets = resolve_ip_blocks(clause);

            if clause.pods.is_none() && clause.ip_blocks.is_none() {
                if clause.ports.is_empty() {
                    // Match anything on L3 and L4.
                    rules.insert(Rule::allow_all());
                    all_allowed = true;
                } else {
                    // Match by L4 only.
                    for port in &clause.ports {
                        rules.insert(permit(direction, Network::Any, Some(port)));
                    }
                }
            }

            for peer in peers.iter().chain(subnets.iter()) {
                if clause.ports.is_empty() {
                    rules.insert(permit(direction, Network::Net(*peer), None));
                } else {
                    for port in &clause.ports {
                        rules.insert(permit(direction, Network::Net(*peer), Some(port)));
                    }
                }
            }
        }
    }

    if has_policy && !all_allowed {
        if direction == MatchDirection::Ingress {
            // The pod must stay reachable from the virtual NAT loopback so it
            // can access its own services.
            let loopback = host_subnet(ipam.nat_loopback_ip());
            rules.insert(Rule {
                action: Action::Permit,
                protocol: Protocol::Any,
                src_net: Network::Net(loopback),
                src_port: ANY_PORT,
                dst_net: Network::Any,
                dst_port: ANY_PORT,
            });
        }
        rules.insert(Rule {
            action: Action::Deny,
            ..Rule::allow_all()
        });
    }

    rules
}

/// Resolves the clause's peer pods into one-host subnets. Peers that are
/// unknown or lack a usable address are skipped so a single stale peer does
/// not invalidate the whole policy.
fn resolve_peers(clause: &Match, lookup: &dyn PodLookup) -> Vec<IpNet> {
    let mut peers = Vec::new();
    for peer in clause.pods.iter().flatten() {
        let data = match lookup.lookup_pod(peer) {
            Some(data) => data,
            None => {
                warn!(peer = %peer, "peer pod not found in the pod store");
                continue;
            }
        };
        if data.ip_address.is_empty() {
            debug!(peer = %peer, "peer pod has no address assigned");
            continue;
        }
        match parse_host_subnet(&data.ip_address) {
            Some(subnet) => peers.push(subnet),
            None => {
                warn!(peer = %peer, ip = %data.ip_address, "peer pod has an invalid address assigned");
            }
        }
    }
    peers
}

/// Expands the clause's ip-blocks into disjoint subnets by iterated
/// subtraction of the carve-outs.
fn resolve_ip_blocks(clause: &Match) -> Vec<IpNet> {
    let mut all = Vec::new();
    for block in clause.ip_blocks.iter().flatten() {
        let mut subnets = vec![block.net];
        for except in &block.except {
            subnets = subnets
                .iter()
                .flat_map(|subnet| subtract(subnet, except))
                .collect();
        }
        all.extend(subnets);
    }
    all
}

/// Builds one permit with the peer network in the field matching the pod-view
/// direction: traffic arriving at the pod is keyed by source, traffic sent by
/// the pod is keyed by destination.
fn permit(direction: MatchDirection, peer: Network, port: Option<&PortMatch>) -> Rule {
    let mut rule = Rule::allow_all();
    match direction {
        MatchDirection::Ingress => rule.src_net = peer,
        MatchDirection::Egress => rule.dst_net = peer,
    }
    if let Some(port) = port {
        rule.protocol = match port.protocol {
            L4Protocol::Tcp => Protocol::Tcp,
            L4Protocol::Udp => Protocol::Udp,
        };
        rule.dst_port = port.port;
    }
    rule
}
