use podnet_policy_core::{IpNet, PodId};
use std::cmp::Ordering;
use std::fmt;

/// Identifies a policy by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyId {
    pub namespace: String,
    pub name: String,
}

/// Directions a policy applies to, from the pod's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Ingress,
    Egress,
    IngressAndEgress,
}

/// Pod-view direction of a single match clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchDirection {
    /// Traffic arriving at the owner pod.
    Ingress,
    /// Traffic sent by the owner pod.
    Egress,
}

/// A network with carve-outs, as selected by an ip-block clause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkMatch {
    /// The network to match against.
    pub net: IpNet,

    /// Networks excluded from the match.
    pub except: Vec<IpNet>,
}

/// L4 protocols a match clause can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

/// A port a match clause applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortMatch {
    pub port: u16,
    pub protocol: L4Protocol,
}

/// One match clause of a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Match {
    pub direction: MatchDirection,

    /// Peer pods the clause selects. `None` means the clause does not select
    /// by pod, which is different from selecting an empty set of pods.
    pub pods: Option<Vec<PodId>>,

    /// Address blocks the clause selects, with the same `None` semantics.
    /// A clause with neither pods nor ip-blocks matches anything on L3.
    pub ip_blocks: Option<Vec<NetworkMatch>>,

    /// Ports the clause applies to; empty means all ports.
    pub ports: Vec<PortMatch>,
}

/// A pod-attached policy.
///
/// Policies compare by id alone: the producer is expected to issue a new id
/// whenever the body changes, so body comparison never happens here.
#[derive(Clone, Debug)]
pub struct Policy {
    pub id: PolicyId,
    pub kind: PolicyKind,
    pub matches: Vec<Match>,
}

// === impl PolicyId ===

impl PolicyId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl NetworkMatch ===

impl From<IpNet> for NetworkMatch {
    fn from(net: IpNet) -> Self {
        Self {
            net,
            except: vec![],
        }
    }
}

// === impl Policy ===

impl PartialEq for Policy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Policy {}

impl PartialOrd for Policy {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Policy {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}
