use super::*;
use anyhow::bail;
use podnet_policy_core::{Action, Network, PodData, Protocol, Rule, ANY_PORT};
use std::collections::HashMap as StdHashMap;
use std::net::IpAddr;
use std::sync::Mutex;

const NAT_LOOPBACK: &str = "10.1.255.254";

struct PodStore(Mutex<StdHashMap<PodId, String>>);

struct TestIpam;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Rendered {
    pod: PodId,
    pod_ip: IpNet,
    ingress: Vec<Rule>,
    egress: Vec<Rule>,
    removed: bool,
}

/// Records committed renders; optionally fails every commit.
#[derive(Clone, Default)]
struct Recorder {
    committed: Arc<Mutex<Vec<Rendered>>>,
    resyncs: Arc<Mutex<Vec<bool>>>,
    fail: bool,
}

struct RecorderTxn {
    committed: Arc<Mutex<Vec<Rendered>>>,
    staged: Vec<Rendered>,
    fail: bool,
}

impl PodStore {
    fn new(pods: &[(&PodId, &str)]) -> Arc<Self> {
        let store = Self(Mutex::new(StdHashMap::new()));
        for (pod, ip) in pods {
            store.set(pod, ip);
        }
        Arc::new(store)
    }

    fn set(&self, pod: &PodId, ip: &str) {
        self.0.lock().unwrap().insert(pod.clone(), ip.to_string());
    }

    fn forget(&self, pod: &PodId) {
        self.0.lock().unwrap().remove(pod);
    }
}

impl PodLookup for PodStore {
    fn lookup_pod(&self, pod: &PodId) -> Option<PodData> {
        self.0.lock().unwrap().get(pod).map(|ip| PodData {
            ip_address: ip.clone(),
        })
    }
}

impl Ipam for TestIpam {
    fn nat_loopback_ip(&self) -> IpAddr {
        NAT_LOOPBACK.parse().unwrap()
    }
}

impl Recorder {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn committed(&self) -> Vec<Rendered> {
        self.committed.lock().unwrap().clone()
    }
}

impl PolicyRenderer for Recorder {
    fn new_txn(&self, resync: bool) -> Box<dyn RendererTxn> {
        self.resyncs.lock().unwrap().push(resync);
        Box::new(RecorderTxn {
            committed: self.committed.clone(),
            staged: Vec::new(),
            fail: self.fail,
        })
    }
}

#[async_trait::async_trait]
impl RendererTxn for RecorderTxn {
    fn render(
        &mut self,
        pod: PodId,
        pod_ip: IpNet,
        ingress: Vec<Rule>,
        egress: Vec<Rule>,
        removed: bool,
    ) {
        self.staged.push(Rendered {
            pod,
            pod_ip,
            ingress,
            egress,
            removed,
        });
    }

    async fn commit(&mut self) -> Result<()> {
        if self.fail {
            bail!("renderer unavailable");
        }
        self.committed.lock().unwrap().append(&mut self.staged);
        Ok(())
    }
}

fn pod(ns: &str, name: &str) -> PodId {
    PodId::new(ns, name)
}

fn mk_configurator(store: Arc<PodStore>, parallel: bool) -> (PolicyConfigurator, Recorder) {
    let mut configurator = PolicyConfigurator::new(store, Arc::new(TestIpam), parallel);
    let recorder = Recorder::default();
    configurator.register_renderer(Box::new(recorder.clone()));
    (configurator, recorder)
}

fn ingress_policy(name: &str, matches: Vec<Match>) -> Arc<Policy> {
    Arc::new(Policy {
        id: PolicyId::new("ns", name),
        kind: PolicyKind::Ingress,
        matches,
    })
}

fn tcp(port: u16) -> PortMatch {
    PortMatch {
        port,
        protocol: L4Protocol::Tcp,
    }
}

fn permit_any_from(net: &str) -> Rule {
    Rule {
        action: Action::Permit,
        protocol: Protocol::Any,
        src_net: Network::Net(net.parse().unwrap()),
        src_port: ANY_PORT,
        dst_net: Network::Any,
        dst_port: ANY_PORT,
    }
}

fn permit_tcp_from(net: &str, dst_port: u16) -> Rule {
    Rule {
        action: Action::Permit,
        protocol: Protocol::Tcp,
        src_net: Network::Net(net.parse().unwrap()),
        src_port: ANY_PORT,
        dst_net: Network::Any,
        dst_port,
    }
}

fn loopback_permit() -> Rule {
    permit_any_from("10.1.255.254/32")
}

fn deny_all() -> Rule {
    Rule {
        action: Action::Deny,
        ..Rule::allow_all()
    }
}

/// A pod without policies is rendered with empty rule lists: non-isolated.
#[tokio::test]
async fn no_policies_render_empty_lists() {
    let pod_a = pod("ns", "pod-a");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a.clone(), vec![]);
    txn.commit().await.unwrap();

    assert_eq!(
        recorder.committed(),
        vec![Rendered {
            pod: pod_a,
            pod_ip: "10.0.0.1/32".parse().unwrap(),
            ingress: vec![],
            egress: vec![],
            removed: false,
        }],
    );
}

/// A single pod-ingress match flips into renderer-egress rules: the peer
/// permit, the NAT-loopback permit, then the default deny.
#[tokio::test]
async fn ingress_peer_with_port() {
    let pod_a = pod("ns", "pod-a");
    let pod_b = pod("ns", "pod-b");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1"), (&pod_b, "10.0.0.2")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = ingress_policy(
        "allow-b",
        vec![Match {
            direction: MatchDirection::Ingress,
            pods: Some(vec![pod_b]),
            ip_blocks: None,
            ports: vec![tcp(80)],
        }],
    );

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a.clone(), vec![policy]);
    txn.commit().await.unwrap();

    let committed = recorder.committed();
    assert_eq!(committed.len(), 1);
    assert_eq!(
        committed[0].egress,
        vec![
            permit_tcp_from("10.0.0.2/32", 80),
            loopback_permit(),
            deny_all(),
        ],
    );
    // The policy carries no egress matches, so the renderer-ingress side
    // stays open.
    assert_eq!(committed[0].ingress, vec![]);
}

/// Ip-block carve-outs are expanded through prefix subtraction.
#[tokio::test]
async fn ip_block_with_except() {
    let pod_a = pod("ns", "pod-a");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = ingress_policy(
        "allow-block",
        vec![Match {
            direction: MatchDirection::Ingress,
            pods: None,
            ip_blocks: Some(vec![NetworkMatch {
                net: "10.0.0.0/24".parse().unwrap(),
                except: vec!["10.0.0.128/25".parse().unwrap()],
            }]),
            ports: vec![],
        }],
    );

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![policy]);
    txn.commit().await.unwrap();

    let committed = recorder.committed();
    assert_eq!(
        committed[0].egress,
        vec![
            permit_any_from("10.0.0.0/25"),
            loopback_permit(),
            deny_all(),
        ],
    );
}

/// A match with neither pods nor ip-blocks and no ports allows everything
/// and suppresses the default deny.
#[tokio::test]
async fn match_all_suppresses_default_deny() {
    let pod_a = pod("ns", "pod-a");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = ingress_policy(
        "allow-everything",
        vec![Match {
            direction: MatchDirection::Ingress,
            pods: None,
            ip_blocks: None,
            ports: vec![],
        }],
    );

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![policy]);
    txn.commit().await.unwrap();

    assert_eq!(recorder.committed()[0].egress, vec![Rule::allow_all()]);
}

/// Selecting an empty set of pods is not the same as not selecting: the
/// policy still isolates the pod.
#[tokio::test]
async fn empty_pod_selection_is_not_match_all() {
    let pod_a = pod("ns", "pod-a");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = ingress_policy(
        "allow-nobody",
        vec![Match {
            direction: MatchDirection::Ingress,
            pods: Some(vec![]),
            ip_blocks: None,
            ports: vec![],
        }],
    );

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![policy]);
    txn.commit().await.unwrap();

    assert_eq!(
        recorder.committed()[0].egress,
        vec![loopback_permit(), deny_all()],
    );
}

/// Unknown peers and peers without an address are skipped without poisoning
/// the rest of the policy.
#[tokio::test]
async fn stale_peers_are_skipped() {
    let pod_a = pod("ns", "pod-a");
    let pod_b = pod("ns", "pod-b");
    let pod_c = pod("ns", "pod-c");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1"), (&pod_b, "10.0.0.2")]);
    store.set(&pod_c, "");
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = ingress_policy(
        "allow-peers",
        vec![Match {
            direction: MatchDirection::Ingress,
            pods: Some(vec![pod("ns", "gone"), pod_c, pod_b]),
            ip_blocks: None,
            ports: vec![],
        }],
    );

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![policy]);
    txn.commit().await.unwrap();

    assert_eq!(
        recorder.committed()[0].egress,
        vec![
            permit_any_from("10.0.0.2/32"),
            loopback_permit(),
            deny_all(),
        ],
    );
}

/// Permuting peers changes nothing about the canonical rule list.
#[tokio::test]
async fn peer_order_is_irrelevant() {
    let pod_a = pod("ns", "pod-a");
    let peers: Vec<PodId> = (0..4).map(|i| pod("ns", &format!("peer-{}", i))).collect();
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    for (i, peer) in peers.iter().enumerate() {
        store.set(peer, &format!("10.0.1.{}", i + 1));
    }

    let mut canonical: Option<Vec<Rule>> = None;
    for ordering in [
        vec![0, 1, 2, 3],
        vec![3, 2, 1, 0],
        vec![2, 0, 3, 1],
    ] {
        let (mut configurator, recorder) = mk_configurator(store.clone(), false);
        let policy = ingress_policy(
            "allow-peers",
            vec![Match {
                direction: MatchDirection::Ingress,
                pods: Some(ordering.iter().map(|&i| peers[i].clone()).collect()),
                ip_blocks: None,
                ports: vec![tcp(80), tcp(443)],
            }],
        );
        let mut txn = configurator.new_txn(false);
        txn.configure(pod_a.clone(), vec![policy]);
        txn.commit().await.unwrap();

        let mut egress = recorder.committed()[0].egress.clone();
        egress.sort();
        match &canonical {
            Some(expected) => assert_eq!(&egress, expected, "ordering {:?}", ordering),
            None => canonical = Some(egress),
        }
    }
}

/// Pods sharing a policy set get byte-identical rule lists, generated once.
#[tokio::test]
async fn same_policy_set_same_rules() {
    let pod_a = pod("ns", "pod-a");
    let pod_b = pod("ns", "pod-b");
    let pod_c = pod("ns", "pod-c");
    let store = PodStore::new(&[
        (&pod_a, "10.0.0.1"),
        (&pod_b, "10.0.0.2"),
        (&pod_c, "10.0.0.3"),
    ]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let first = ingress_policy(
        "first",
        vec![Match {
            direction: MatchDirection::Ingress,
            pods: Some(vec![pod_c.clone()]),
            ip_blocks: None,
            ports: vec![tcp(80)],
        }],
    );
    let second = ingress_policy(
        "second",
        vec![Match {
            direction: MatchDirection::Ingress,
            pods: Some(vec![pod_c.clone()]),
            ip_blocks: None,
            ports: vec![tcp(443)],
        }],
    );

    let mut txn = configurator.new_txn(false);
    // The policy set is a set: listing order must not matter.
    txn.configure(pod_a.clone(), vec![first.clone(), second.clone()]);
    txn.configure(pod_b.clone(), vec![second, first]);
    txn.commit().await.unwrap();

    let committed = recorder.committed();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[0].ingress, committed[1].ingress);
    assert_eq!(committed[0].egress, committed[1].egress);
}

/// An egress-only policy leaves the renderer-egress side untouched and
/// closes the renderer-ingress side without a loopback permit.
#[tokio::test]
async fn egress_policy_closes_ingress_side_only() {
    let pod_a = pod("ns", "pod-a");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = Arc::new(Policy {
        id: PolicyId::new("ns", "egress-dns"),
        kind: PolicyKind::Egress,
        matches: vec![Match {
            direction: MatchDirection::Egress,
            pods: None,
            ip_blocks: Some(vec!["10.0.0.53/32".parse::<IpNet>().unwrap().into()]),
            ports: vec![tcp(53)],
        }],
    });

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![policy]);
    txn.commit().await.unwrap();

    let committed = recorder.committed();
    assert_eq!(committed[0].egress, vec![]);
    assert_eq!(
        committed[0].ingress,
        vec![
            Rule {
                action: Action::Permit,
                protocol: Protocol::Tcp,
                src_net: Network::Any,
                src_port: ANY_PORT,
                dst_net: Network::Net("10.0.0.53/32".parse().unwrap()),
                dst_port: 53,
            },
            deny_all(),
        ],
    );
}

/// A combined policy contributes to both renderer directions.
#[tokio::test]
async fn combined_policy_applies_to_both_directions() {
    let pod_a = pod("ns", "pod-a");
    let pod_b = pod("ns", "pod-b");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1"), (&pod_b, "10.0.0.2")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = Arc::new(Policy {
        id: PolicyId::new("ns", "both-ways"),
        kind: PolicyKind::IngressAndEgress,
        matches: vec![
            Match {
                direction: MatchDirection::Ingress,
                pods: Some(vec![pod_b]),
                ip_blocks: None,
                ports: vec![],
            },
            Match {
                direction: MatchDirection::Egress,
                pods: None,
                ip_blocks: Some(vec!["10.0.1.0/24".parse::<IpNet>().unwrap().into()]),
                ports: vec![],
            },
        ],
    });

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![policy]);
    txn.commit().await.unwrap();

    let committed = recorder.committed();
    assert_eq!(
        committed[0].egress,
        vec![
            permit_any_from("10.0.0.2/32"),
            loopback_permit(),
            deny_all(),
        ],
    );
    assert_eq!(
        committed[0].ingress,
        vec![
            Rule {
                action: Action::Permit,
                protocol: Protocol::Any,
                src_net: Network::Any,
                src_port: ANY_PORT,
                dst_net: Network::Net("10.0.1.0/24".parse().unwrap()),
                dst_port: ANY_PORT,
            },
            deny_all(),
        ],
    );
}

/// A combined policy isolates the pod in both directions even when all of
/// its matches point one way.
#[tokio::test]
async fn combined_policy_isolates_both_directions() {
    let pod_a = pod("ns", "pod-a");
    let pod_b = pod("ns", "pod-b");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1"), (&pod_b, "10.0.0.2")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let policy = Arc::new(Policy {
        id: PolicyId::new("ns", "ingress-only-matches"),
        kind: PolicyKind::IngressAndEgress,
        matches: vec![Match {
            direction: MatchDirection::Ingress,
            pods: Some(vec![pod_b]),
            ip_blocks: None,
            ports: vec![],
        }],
    });

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![policy]);
    txn.commit().await.unwrap();

    // No egress matches exist, yet the pod is isolated in that direction too.
    assert_eq!(recorder.committed()[0].ingress, vec![deny_all()]);
}

/// A pod that loses its address is rendered once as removed, with the
/// address it had; afterwards it is a no-op.
#[tokio::test]
async fn pod_removal() {
    let pod_a = pod("ns", "pod-a");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    let (mut configurator, recorder) = mk_configurator(store.clone(), false);

    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a.clone(), vec![]);
    txn.commit().await.unwrap();

    store.forget(&pod_a);
    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a.clone(), vec![]);
    txn.commit().await.unwrap();

    let committed = recorder.committed();
    assert_eq!(committed.len(), 2);
    assert_eq!(
        committed[1],
        Rendered {
            pod: pod_a.clone(),
            pod_ip: "10.0.0.1/32".parse().unwrap(),
            ingress: vec![],
            egress: vec![],
            removed: true,
        },
    );

    // Already un-configured: nothing further is rendered.
    let mut txn = configurator.new_txn(false);
    txn.configure(pod_a, vec![]);
    txn.commit().await.unwrap();
    assert_eq!(recorder.committed().len(), 2);
}

/// The resync flag is forwarded to every renderer transaction.
#[tokio::test]
async fn resync_reaches_renderers() {
    let pod_a = pod("ns", "pod-a");
    let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
    let (mut configurator, recorder) = mk_configurator(store, false);

    let mut txn = configurator.new_txn(true);
    txn.configure(pod_a, vec![]);
    txn.commit().await.unwrap();

    assert_eq!(*recorder.resyncs.lock().unwrap(), vec![true]);
}

/// One failing renderer does not keep the others from committing, and its
/// error is returned.
#[tokio::test]
async fn renderer_errors_surface() {
    for parallel in [false, true] {
        let pod_a = pod("ns", "pod-a");
        let store = PodStore::new(&[(&pod_a, "10.0.0.1")]);
        let (mut configurator, recorder) = mk_configurator(store, parallel);
        configurator.register_renderer(Box::new(Recorder::failing()));

        let mut txn = configurator.new_txn(false);
        txn.configure(pod_a, vec![]);
        let error = txn.commit().await.unwrap_err();
        assert_eq!(error.to_string(), "renderer unavailable");
        assert_eq!(recorder.committed().len(), 1, "parallel={}", parallel);
    }
}
