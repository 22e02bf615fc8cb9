//! Pairwise combination of pod rules.
//!
//! A local table anchors on one pod, but policy is two-sided: what the source
//! pod permits to send must be intersected with what the destination pod
//! accepts. The helpers here compute per-protocol port sets each side permits
//! for a concrete peer address and install the agreed-on intersection into
//! the destination's table.

use crate::{Orientation, PodConfig};
use podnet_policy_core::{
    Action, IpNet, Network, PortSet, Protocol, Rule, RuleTable, ANY_PORT,
};

/// Ports one pod's rules permit for a concrete peer, split by protocol.
/// `any` is set when a protocol-any rule applies, covering everything.
#[derive(Debug, Default)]
struct AllowedPorts {
    tcp: PortSet,
    udp: PortSet,
    any: bool,
}

/// Ports permitted by switch-ingress rules toward `peer_ip`: rules sent by
/// the owning pod, keyed by destination network.
fn allowed_ingress_ports(peer_ip: &IpNet, rules: &[Rule]) -> AllowedPorts {
    allowed_ports(rules, peer_ip, |rule| &rule.dst_net)
}

/// Ports permitted by switch-egress rules from `peer_ip`: rules delivered to
/// the owning pod, keyed by source network.
fn allowed_egress_ports(peer_ip: &IpNet, rules: &[Rule]) -> AllowedPorts {
    allowed_ports(rules, peer_ip, |rule| &rule.src_net)
}

fn allowed_ports<'r>(
    rules: &'r [Rule],
    peer_ip: &IpNet,
    anchor: impl Fn(&'r Rule) -> &'r Network,
) -> AllowedPorts {
    let mut allowed = AllowedPorts::default();

    // A pod without rules in a direction restricts nothing.
    if rules.is_empty() {
        allowed.any = true;
        return allowed;
    }

    let peer_addr = peer_ip.addr();
    for rule in rules {
        if rule.action != Action::Permit || !anchor(rule).contains(&peer_addr) {
            continue;
        }
        match rule.protocol {
            Protocol::Any => allowed.any = true,
            Protocol::Tcp => {
                allowed.tcp.insert(rule.dst_port);
            }
            Protocol::Udp => {
                allowed.udp.insert(rule.dst_port);
            }
        }
    }
    allowed
}

/// Combines the rules of a source pod with the table of the destination pod
/// so that the pair's traffic is exactly what both sides agree on.
///
/// The result does not depend on the order in which source pods are
/// processed: each source only ever touches rules anchored on its own
/// address.
pub(crate) fn install_pair_rules(
    table: &mut RuleTable,
    dst_cfg: &PodConfig,
    src_cfg: &PodConfig,
    orientation: Orientation,
) {
    let (dst_ip, src_ip) = match (dst_cfg.pod_ip, src_cfg.pod_ip) {
        (Some(dst_ip), Some(src_ip)) => (dst_ip, src_ip),
        // Without addresses there is nothing to anchor rules on.
        _ => return,
    };

    // What the source pod permits toward the destination...
    let src = match orientation {
        Orientation::Egress => allowed_ingress_ports(&dst_ip, &src_cfg.ingress),
        Orientation::Ingress => allowed_egress_ports(&dst_ip, &src_cfg.egress),
    };
    // ...and what the destination accepts from the source.
    let dst = match orientation {
        Orientation::Egress => allowed_egress_ports(&src_ip, &dst_cfg.egress),
        Orientation::Ingress => allowed_ingress_ports(&src_ip, &dst_cfg.ingress),
    };

    if src.any {
        // The source imposes no restriction; the destination's own rules
        // already say everything there is to say about this pair.
        return;
    }

    if dst.any || !dst.tcp.is_subset_of(&src.tcp) || !dst.udp.is_subset_of(&src.udp) {
        // The destination permits more than the source will send. Replace the
        // subtree anchored on the source with the agreed intersection.
        let src_addr = src_ip.addr();
        table.remove_rules_where(|rule| {
            let anchor = match orientation {
                Orientation::Egress => &rule.src_net,
                Orientation::Ingress => &rule.dst_net,
            };
            anchor.as_host_addr() == Some(src_addr)
        });

        // A protocol-any destination covers all ports of both protocols.
        let (dst_tcp, dst_udp) = if dst.any {
            let any: PortSet = [ANY_PORT].into_iter().collect();
            (any.clone(), any)
        } else {
            (dst.tcp, dst.udp)
        };

        install_allowed_ports(
            table,
            &src_ip,
            &dst_tcp.intersection(&src.tcp),
            Protocol::Tcp,
            orientation,
        );
        install_allowed_ports(
            table,
            &src_ip,
            &dst_udp.intersection(&src.udp),
            Protocol::Udp,
            orientation,
        );

        let mut deny = Rule {
            action: Action::Deny,
            ..Rule::allow_all()
        };
        match orientation {
            Orientation::Egress => deny.src_net = Network::Net(src_ip),
            Orientation::Ingress => deny.dst_net = Network::Net(src_ip),
        }
        table.insert_rule(deny);
    }
}

/// Permits exactly `ports` of `protocol` for the source pod in the table.
fn install_allowed_ports(
    table: &mut RuleTable,
    src_ip: &IpNet,
    ports: &PortSet,
    protocol: Protocol,
    orientation: Orientation,
) {
    let mut template = Rule {
        protocol,
        ..Rule::allow_all()
    };
    match orientation {
        Orientation::Egress => template.src_net = Network::Net(*src_ip),
        Orientation::Ingress => template.dst_net = Network::Net(*src_ip),
    }

    if ports.has_any_port() {
        // All ports of the protocol are agreed on.
        table.insert_rule(template);
        return;
    }

    for port in ports.iter() {
        table.insert_rule(Rule {
            dst_port: port,
            ..template
        });
    }
}
