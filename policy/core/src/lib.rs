//! Core model for the podnet policy compiler.
//!
//! The compiler translates Kubernetes-style network policies into flat L3/L4
//! filter rules and hands them to renderers that program a network stack.
//! This crate holds the pieces everything else is built from:
//!
//! - the [`Rule`] five-tuple and the ordered, de-duplicated [`RuleList`];
//! - the [`RuleTable`] primitive with its content-derived [`TableId`], which
//!   is what lets pods with identical rulesets share one table;
//! - prefix arithmetic ([`subtract`]) and the [`PortSet`] algebra;
//! - the contracts of the external collaborators: the pod store, the IPAM
//!   and the renderers.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod pod;
pub mod ports;
mod rule;
mod subnet;
mod table;

pub use self::pod::{PodId, PodSet};
pub use self::ports::{PortSet, ANY_PORT};
pub use self::rule::{Action, Network, Protocol, Rule, RuleList};
pub use self::subnet::{host_subnet, parse_host_subnet, subtract};
pub use self::table::{RuleTable, TableId, TableKind};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use anyhow::Result;
use std::net::IpAddr;

/// Minimal view of the pod state store needed to resolve policy peers.
pub trait PodLookup: Send + Sync {
    fn lookup_pod(&self, pod: &PodId) -> Option<PodData>;
}

/// Pod state relevant to rule generation.
#[derive(Clone, Debug, Default)]
pub struct PodData {
    /// Address assigned to the pod; empty until one has been allocated.
    pub ip_address: String,
}

/// IPAM queries needed by the policy compiler.
pub trait Ipam: Send + Sync {
    /// The virtual loopback address used to route service traffic back to the
    /// originating pod even when source and destination addresses are equal.
    fn nat_loopback_ip(&self) -> IpAddr;
}

/// A network stack that can program compiled rules.
///
/// A renderer receives rules for every pod on the node; it is up to the
/// renderer to filter out pods without a connection in its stack.
pub trait PolicyRenderer: Send + Sync {
    /// Starts a new transaction. With `resync` the rendered configuration
    /// completely replaces the programmed state.
    fn new_txn(&self, resync: bool) -> Box<dyn RendererTxn>;
}

/// A single transaction of a renderer.
#[async_trait::async_trait]
pub trait RendererTxn: Send {
    /// Stages the rules for one pod. The rule vectors are the caller's copies
    /// and become owned by the transaction. `removed` marks a pod whose
    /// configuration is to be withdrawn.
    fn render(
        &mut self,
        pod: PodId,
        pod_ip: IpNet,
        ingress: Vec<Rule>,
        egress: Vec<Rule>,
        removed: bool,
    );

    /// Programs the staged state into the network stack.
    async fn commit(&mut self) -> Result<()>;
}
