use crate::ports::ANY_PORT;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

/// Says whether a rule permits or drops matching traffic.
///
/// Variant order matters: permits sort before denies in the canonical rule
/// ordering, so a generated list always reads "specific permits, then deny".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Permit,
    Deny,
}

/// L4 protocol selector of a rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
}

/// L3 endpoint selector of a rule. `Any` matches every address and sorts
/// before all concrete networks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Network {
    Any,
    Net(IpNet),
}

/// One L3/L4 filter rule.
///
/// The derived ordering is the canonical rule order: action, protocol, source
/// network, source port, destination network, destination port. Tables keep
/// their rules in this order, and table identity is derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rule {
    pub action: Action,
    pub protocol: Protocol,
    pub src_net: Network,
    pub src_port: u16,
    pub dst_net: Network,
    pub dst_port: u16,
}

/// An ordered list of rules without duplicates.
///
/// Two views are maintained: the insertion order, which is what renderers
/// receive, and the canonical order, which defines list equality and feeds
/// table identity.
#[derive(Clone, Debug, Default)]
pub struct RuleList {
    rules: Vec<Rule>,
    ordered: Vec<Rule>,
}

// === impl Action ===

impl Action {
    pub fn wire_code(&self) -> u8 {
        match self {
            Action::Permit => 0,
            Action::Deny => 1,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Permit => "permit".fmt(f),
            Action::Deny => "deny".fmt(f),
        }
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn wire_code(&self) -> u8 {
        match self {
            Protocol::Any => 0,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Any => "ANY".fmt(f),
            Protocol::Tcp => "TCP".fmt(f),
            Protocol::Udp => "UDP".fmt(f),
        }
    }
}

// === impl Network ===

impl Network {
    /// Expresses a single address as a one-host network.
    pub fn host(addr: IpAddr) -> Self {
        Network::Net(IpNet::from(addr))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Network::Any)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match self {
            Network::Any => true,
            Network::Net(net) => net.contains(addr),
        }
    }

    /// The address of a one-host network; `None` for `Any` and for networks
    /// wider than a single host.
    pub fn as_host_addr(&self) -> Option<IpAddr> {
        match self {
            Network::Any => None,
            Network::Net(net) if net.prefix_len() == net.max_prefix_len() => Some(net.addr()),
            Network::Net(_) => None,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Network::Any => buf.extend_from_slice(&[0, 0]),
            Network::Net(net) => {
                match net {
                    IpNet::V4(n) => {
                        buf.push(4);
                        buf.extend_from_slice(&n.addr().octets());
                    }
                    IpNet::V6(n) => {
                        buf.push(16);
                        buf.extend_from_slice(&n.addr().octets());
                    }
                }
                buf.push(net.prefix_len());
            }
        }
    }
}

impl From<IpNet> for Network {
    fn from(net: IpNet) -> Self {
        Network::Net(net)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Any => "any".fmt(f),
            Network::Net(net) => net.fmt(f),
        }
    }
}

// === impl Rule ===

impl Rule {
    /// The rule permitting any traffic.
    pub fn allow_all() -> Self {
        Self {
            action: Action::Permit,
            protocol: Protocol::Any,
            src_net: Network::Any,
            src_port: ANY_PORT,
            dst_net: Network::Any,
            dst_port: ANY_PORT,
        }
    }

    /// True for rules that match any traffic, regardless of the action. Used
    /// to decide whether a table still needs a closing catch-all.
    pub fn matches_anything(&self) -> bool {
        self.protocol == Protocol::Any
            && self.dst_port == ANY_PORT
            && self.src_net.is_any()
            && self.dst_net.is_any()
    }

    /// Appends the canonical serialization of the rule: action, protocol,
    /// source network, source port, destination network, destination port.
    /// Networks encode as `len ‖ address-bytes ‖ prefix-len`, ports as
    /// big-endian u16. Stable across runs; table identity hashes it.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.action.wire_code());
        buf.push(self.protocol.wire_code());
        self.src_net.encode(buf);
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        self.dst_net.encode(buf);
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Port(u16);
        impl fmt::Display for Port {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.0 == ANY_PORT {
                    "*".fmt(f)
                } else {
                    self.0.fmt(f)
                }
            }
        }
        write!(
            f,
            "{} {} {}:{} -> {}:{}",
            self.action,
            self.protocol,
            self.src_net,
            Port(self.src_port),
            self.dst_net,
            Port(self.dst_port),
        )
    }
}

// === impl RuleList ===

impl RuleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a rule, keeping both views consistent. Returns false without
    /// changing the list when an equal rule is already present.
    pub fn insert(&mut self, rule: Rule) -> bool {
        let idx = match self.ordered.binary_search(&rule) {
            Ok(_) => return false,
            Err(idx) => idx,
        };
        self.ordered.insert(idx, rule);
        self.rules.push(rule);
        true
    }

    /// Removes every rule matching the predicate from both views.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&Rule) -> bool) {
        self.rules.retain(|r| !pred(r));
        self.ordered.retain(|r| !pred(r));
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.ordered.binary_search(rule).is_ok()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Rules in canonical order.
    pub fn sorted(&self) -> &[Rule] {
        &self.ordered
    }

    /// An insertion-order copy, suitable for handing to a renderer.
    pub fn to_vec(&self) -> Vec<Rule> {
        self.rules.clone()
    }
}

impl PartialEq for RuleList {
    fn eq(&self, other: &Self) -> bool {
        self.ordered == other.ordered
    }
}

impl Eq for RuleList {}

impl FromIterator<Rule> for RuleList {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        let mut list = Self::new();
        for rule in iter {
            list.insert(rule);
        }
        list
    }
}
