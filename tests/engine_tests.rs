use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use netacl_engine::{
    Acl, AclEngine, AclError, Action, ApplyErrorKind, Assignment, AssignmentTable, Capabilities, Direction,
    EngineOptions, Endpoint, MemoryBackend, NetworkEntry, NicEntry, NicId, Packet, PeerTable, ResolutionErrorKind,
    Rule, Target, KEY_ACLS,
};

fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn acls(list: &str) -> HashMap<String, String> {
    config(&[(KEY_ACLS, list)])
}

fn fast_options() -> EngineOptions {
    EngineOptions::new()
        .with_apply_timeout(Duration::from_millis(200))
        .with_retry_backoff(Duration::from_millis(1))
}

struct Setup {
    engine: AclEngine,
    backend: Arc<MemoryBackend>,
    peers: Arc<PeerTable>,
}

fn setup_with(capabilities: Capabilities, options: EngineOptions) -> Setup {
    let peers = Arc::new(PeerTable::new());
    let engine = AclEngine::new(peers.clone(), options);
    let backend = Arc::new(MemoryBackend::new("mem", capabilities));
    engine.register_backend("mem", backend.clone()).unwrap();
    Setup { engine, backend, peers }
}

fn setup() -> Setup {
    setup_with(Capabilities::all(), fast_options())
}

fn web() -> Acl {
    Acl::new("web").with_ingress(vec![Rule::new(Action::Allow)
        .with_protocol("tcp")
        .with_source("@internal")
        .with_destination_port("80,443")])
}

fn block() -> Acl {
    Acl::new("block-acl").with_ingress(vec![Rule::new(Action::Drop).with_state("enabled")])
}

fn net0() -> Target {
    Target::Network("net0".into())
}

fn nic(instance: &str) -> NicId {
    NicId::new(instance, "eth0")
}

fn client() -> Endpoint {
    Endpoint::internal("10.0.0.2".parse().unwrap())
}

fn server() -> Endpoint {
    Endpoint::internal("10.0.0.10".parse().unwrap())
}

fn ingress_action(s: &Setup, target: &Target, packet: &Packet) -> Option<Action> {
    s.backend
        .plan(target)
        .and_then(|plan| plan.ingress.decide(packet))
        .map(|d| d.action)
}

#[tokio::test]
async fn test_web_scenario() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();

    let target = net0();
    assert_eq!(
        ingress_action(&s, &target, &Packet::tcp(client(), server(), 80)),
        Some(Action::Allow)
    );
    assert_eq!(
        ingress_action(&s, &target, &Packet::tcp(client(), server(), 8080)),
        Some(Action::Reject)
    );
    assert_eq!(
        ingress_action(&s, &target, &Packet::udp(client(), server(), 80)),
        Some(Action::Reject)
    );
}

#[tokio::test]
async fn test_block_acl_scenario_both_orders() {
    for list in ["web,block-acl", "block-acl,web"] {
        let s = setup();
        s.engine.create_acl(web()).unwrap();
        s.engine.create_acl(block()).unwrap();
        s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();
        s.engine.set_nic(nic("c1"), "net0", &acls(list)).await.unwrap();

        let target = Target::Nic(nic("c1"));
        for packet in [
            Packet::tcp(client(), server(), 80),
            Packet::tcp(client(), server(), 22),
            Packet::udp(Endpoint::external("198.51.100.7".parse().unwrap()), server(), 53),
        ] {
            assert_eq!(ingress_action(&s, &target, &packet), Some(Action::Drop), "order {}", list);
        }
    }
}

#[tokio::test]
async fn test_empty_assignment_applies_no_policy() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();
    s.engine.set_nic(nic("c1"), "net0", &HashMap::new()).await.unwrap();

    assert!(s.backend.targets().is_empty());
    assert!(s.engine.applied_plan(&Target::Nic(nic("c1"))).is_none());
    let plan = s.engine.compile_target(&Target::Nic(nic("c1"))).unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_default_action_fallback_and_nic_override() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine
        .set_network(
            "net0",
            "mem",
            &config(&[(KEY_ACLS, "web"), ("security.acls.default.ingress.action", "drop")]),
        )
        .await
        .unwrap();
    s.engine
        .set_nic(
            nic("c1"),
            "net0",
            &config(&[
                ("security.acls.default.ingress.action", "allow"),
                ("security.acls.default.ingress.logged", "true"),
            ]),
        )
        .await
        .unwrap();
    s.engine.set_nic(nic("c2"), "net0", &HashMap::new()).await.unwrap();

    let unmatched = Packet::tcp(client(), server(), 8080);
    assert_eq!(ingress_action(&s, &net0(), &unmatched), Some(Action::Drop));
    assert_eq!(ingress_action(&s, &Target::Nic(nic("c2")), &unmatched), Some(Action::Drop));

    let plan = s.backend.plan(&Target::Nic(nic("c1"))).unwrap();
    let decision = plan.ingress.decide(&unmatched).unwrap();
    assert_eq!(decision.action, Action::Allow);
    assert!(decision.logged);

    // Egress has no override anywhere: global reject
    let egress = plan.egress.decide(&Packet::tcp(server(), client(), 80)).unwrap();
    assert_eq!(egress.action, Action::Reject);
}

#[tokio::test]
async fn test_global_default_from_options() {
    let s = setup_with(Capabilities::all(), fast_options().with_default_action(Action::Drop));
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();
    assert_eq!(
        ingress_action(&s, &net0(), &Packet::udp(client(), server(), 53)),
        Some(Action::Drop)
    );
}

#[tokio::test]
async fn test_recompile_is_byte_identical_and_apply_idempotent() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();

    let first = s.engine.compile_target(&net0()).unwrap();
    let second = s.engine.compile_target(&net0()).unwrap();
    assert_eq!(first.ingress.render().unwrap(), second.ingress.render().unwrap());
    assert_eq!(first.egress.render().unwrap(), second.egress.render().unwrap());

    let writes = s.backend.writes();
    s.engine.reapply(&net0()).await.unwrap();
    s.engine.reapply(&net0()).await.unwrap();
    assert_eq!(s.backend.writes(), writes);
}

#[tokio::test]
async fn test_live_membership_is_pushed() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine
        .create_acl(Acl::new("db").with_ingress(vec![Rule::new(Action::Allow).with_source("web")]))
        .unwrap();
    s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();
    s.engine.set_nic(nic("c1"), "net0", &acls("db")).await.unwrap();
    s.engine.set_nic(nic("c2"), "net0", &acls("web")).await.unwrap();

    let db = Target::Nic(nic("c1"));
    let from = |instance: &str| Packet::udp(Endpoint::nic(nic(instance), None), server(), 1000);
    assert_eq!(ingress_action(&s, &db, &from("c2")), Some(Action::Allow));
    assert_eq!(ingress_action(&s, &db, &from("c3")), Some(Action::Reject));

    // c3 joins web; db's plan follows without touching the db ACL
    s.engine.set_nic(nic("c3"), "net0", &acls("web")).await.unwrap();
    assert_eq!(ingress_action(&s, &db, &from("c3")), Some(Action::Allow));

    // c2 leaves
    s.engine.remove_nic(&nic("c2")).await.unwrap();
    assert_eq!(ingress_action(&s, &db, &from("c2")), Some(Action::Reject));
    assert!(s.backend.plan(&Target::Nic(nic("c2"))).is_none());
}

#[tokio::test]
async fn test_network_assignment_reaches_group_members() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine
        .create_acl(Acl::new("db").with_ingress(vec![Rule::new(Action::Allow).with_source("web")]))
        .unwrap();
    s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();
    s.engine.set_nic(nic("c1"), "net0", &acls("db")).await.unwrap();
    s.engine.set_nic(nic("c2"), "net0", &HashMap::new()).await.unwrap();

    // web assigned at network level: c1 and c2 both join the group
    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();
    let members = s.engine.index().members_of("web");
    assert!(members.contains(&nic("c1")));
    assert!(members.contains(&nic("c2")));

    let db = Target::Nic(nic("c1"));
    let packet = Packet::udp(Endpoint::nic(nic("c2"), None), server(), 1000);
    assert_eq!(ingress_action(&s, &db, &packet), Some(Action::Allow));
}

#[test]
fn test_mutually_exclusive_fields_rejected() {
    let s = setup();
    let cases = [
        Rule::new(Action::Allow).with_protocol("icmp4").with_destination_port("80"),
        Rule::new(Action::Allow).with_protocol("tcp").with_icmp("8", ""),
        Rule::new(Action::Allow).with_destination_port("80"),
    ];
    for rule in cases {
        let err = s.engine.create_acl(Acl::new("bad").with_ingress(vec![rule])).unwrap_err();
        assert!(matches!(err, AclError::Validation { .. }), "got: {}", err);
    }
    assert!(s.engine.list_acls().is_empty());
}

#[tokio::test]
async fn test_capability_rejection_commits_nothing() {
    let s = setup_with(Capabilities::default(), fast_options());
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();
    let before = s.backend.plan(&net0()).unwrap();

    let intra = web().with_egress(vec![Rule::new(Action::Drop).with_destination("@internal")]);
    let err = s.engine.update_acl(intra).await.unwrap_err();
    assert!(matches!(
        err,
        AclError::Resolution {
            kind: ResolutionErrorKind::MissingCapability,
            ..
        }
    ));
    assert_eq!(s.engine.get_acl("web").unwrap(), web());
    assert_eq!(s.backend.plan(&net0()).unwrap(), before);

    // Same for an assignment on a backend without range support
    s.engine
        .create_acl(Acl::new("ranged").with_ingress(vec![Rule::new(Action::Allow).with_source("10.0.0.1-10.0.0.9")]))
        .unwrap();
    let err = s.engine.set_nic(nic("c1"), "net0", &acls("ranged")).await.unwrap_err();
    assert!(matches!(
        err,
        AclError::Resolution {
            kind: ResolutionErrorKind::MissingCapability,
            ..
        }
    ));
    assert!(s.engine.used_by("ranged").unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_in_use_refused() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();
    s.engine.set_nic(nic("c1"), "net0", &acls("web")).await.unwrap();

    let err = s.engine.delete_acl("web").unwrap_err();
    assert!(matches!(err, AclError::InUse(_)));
    assert_eq!(s.engine.used_by("web").unwrap().targets, vec![Target::Nic(nic("c1"))]);

    s.engine.set_nic(nic("c1"), "net0", &HashMap::new()).await.unwrap();
    s.engine.delete_acl("web").unwrap();
    assert!(matches!(s.engine.delete_acl("web"), Err(AclError::NotFound(_))));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.backend.fail_next(ApplyErrorKind::Busy, 2);

    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();
    assert_eq!(s.backend.calls(), 3);
    assert!(s.backend.plan(&net0()).is_some());
}

#[tokio::test]
async fn test_retries_exhausted_keeps_definition() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.backend.fail_next(ApplyErrorKind::Busy, 10);

    let err = s.engine.set_network("net0", "mem", &acls("web")).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(s.backend.calls(), 3);
    assert!(s.backend.plan(&net0()).is_none());
    assert_eq!(s.engine.used_by("web").unwrap().targets, vec![net0()]);

    s.backend.fail_next(ApplyErrorKind::Busy, 0);
    s.engine.reapply(&net0()).await.unwrap();
    assert!(s.backend.plan(&net0()).is_some());
}

#[tokio::test]
async fn test_permanent_failure_not_retried() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.backend.fail_next(ApplyErrorKind::PermissionDenied, 1);

    let err = s.engine.set_network("net0", "mem", &acls("web")).await.unwrap_err();
    assert!(matches!(
        err,
        AclError::Apply {
            kind: ApplyErrorKind::PermissionDenied,
            ..
        }
    ));
    assert_eq!(s.backend.calls(), 1);
}

#[tokio::test]
async fn test_apply_timeout_keeps_previous_state() {
    let options = fast_options()
        .with_apply_timeout(Duration::from_millis(20))
        .with_max_apply_attempts(1);
    let s = setup_with(Capabilities::all(), options);
    s.engine.create_acl(web()).unwrap();
    s.engine.create_acl(block()).unwrap();
    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();
    let before = s.backend.plan(&net0()).unwrap();

    s.backend.set_delay(Some(Duration::from_millis(500)));
    let err = s.engine.set_network("net0", "mem", &acls("web,block-acl")).await.unwrap_err();
    assert!(matches!(
        err,
        AclError::Apply {
            kind: ApplyErrorKind::Timeout,
            ..
        }
    ));
    assert_eq!(s.backend.plan(&net0()).unwrap(), before);
    assert_eq!(s.engine.applied_plan(&net0()).unwrap(), before);

    s.backend.set_delay(None);
    s.engine.reapply(&net0()).await.unwrap();
    assert_eq!(
        ingress_action(&s, &net0(), &Packet::tcp(client(), server(), 80)),
        Some(Action::Drop)
    );
}

#[tokio::test]
async fn test_restart_replay() {
    let backend = Arc::new(MemoryBackend::new("mem", Capabilities::all()));
    let definitions = vec![
        web(),
        Acl::new("db").with_ingress(vec![Rule::new(Action::Allow).with_source("web")]),
    ];

    let first = AclEngine::new(Arc::new(PeerTable::new()), fast_options());
    first.register_backend("mem", backend.clone()).unwrap();
    for acl in &definitions {
        first.create_acl(acl.clone()).unwrap();
    }
    first.set_network("net0", "mem", &HashMap::new()).await.unwrap();
    first.set_nic(nic("c1"), "net0", &acls("db")).await.unwrap();
    first.set_nic(nic("c2"), "net0", &acls("web")).await.unwrap();
    let enforced = backend.plan(&Target::Nic(nic("c1"))).unwrap();
    let writes = backend.writes();

    // Fresh process: same persisted state, empty index
    let mut table = AssignmentTable::new();
    table.set_network(
        "net0",
        NetworkEntry {
            backend: "mem".into(),
            assignment: Assignment::default(),
        },
    );
    table.set_nic(
        nic("c1"),
        NicEntry {
            network: "net0".into(),
            assignment: Assignment::new(["db"]),
        },
    );
    table.set_nic(
        nic("c2"),
        NicEntry {
            network: "net0".into(),
            assignment: Assignment::new(["web"]),
        },
    );

    let second = AclEngine::new(Arc::new(PeerTable::new()), fast_options());
    second.register_backend("mem", backend.clone()).unwrap();
    second.open().await.unwrap();
    second.load(definitions, table).unwrap();
    assert!(second.index().members_of("web").is_empty());

    second.restore().await.unwrap();
    assert!(second.index().members_of("web").contains(&nic("c2")));
    assert_eq!(second.applied_plan(&Target::Nic(nic("c1"))).unwrap(), enforced);
    assert_eq!(backend.writes(), writes);
}

#[test]
fn test_load_rejects_dangling_assignment() {
    let s = setup();
    let mut table = AssignmentTable::new();
    table.set_network(
        "net0",
        NetworkEntry {
            backend: "mem".into(),
            assignment: Assignment::new(["ghost"]),
        },
    );
    assert!(matches!(s.engine.load(vec![web()], table), Err(AclError::NotFound(_))));
    assert!(s.engine.list_acls().is_empty());
}

#[tokio::test]
async fn test_peer_selectors_follow_topology() {
    let s = setup();
    let acl = Acl::new("dc").with_egress(vec![Rule::new(Action::Allow).with_destination("@net0/dc2")]);
    s.engine.create_acl(acl).unwrap();
    s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();

    // Not established yet: assignment refused
    let err = s.engine.set_nic(nic("c1"), "net0", &acls("dc")).await.unwrap_err();
    assert!(matches!(
        err,
        AclError::Resolution {
            kind: ResolutionErrorKind::Unresolved,
            ..
        }
    ));

    s.peers.establish("net0", "dc2", vec!["192.0.2.0/24".parse().unwrap()]);
    s.engine.set_nic(nic("c1"), "net0", &acls("dc")).await.unwrap();
    let target = Target::Nic(nic("c1"));
    let to_peer = Packet::tcp(server(), Endpoint::external("192.0.2.8".parse().unwrap()), 443);
    let plan = s.backend.plan(&target).unwrap();
    assert_eq!(plan.egress.decide(&to_peer).unwrap().action, Action::Allow);

    // Peer address space moves; the cached resolution is dropped
    s.peers.establish("net0", "dc2", vec!["203.0.113.0/24".parse().unwrap()]);
    s.engine.peers_changed("net0").await.unwrap();
    let plan = s.backend.plan(&target).unwrap();
    assert_eq!(plan.egress.decide(&to_peer).unwrap().action, Action::Reject);

    // Torn down: recompilation fails and the last plan stays enforced
    s.peers.teardown("net0", "dc2");
    assert!(s.engine.peers_changed("net0").await.is_err());
    assert_eq!(s.backend.plan(&target).unwrap(), plan);
}

#[tokio::test]
async fn test_fetch_logs() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.backend.push_log("web", serde_json::json!({"src": "10.0.0.2"}));
    s.backend.push_log("other", serde_json::json!({"src": "10.0.0.3"}));

    let entries: Vec<_> = s.engine.fetch_logs("web").unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record["src"], "10.0.0.2");
    assert!(matches!(s.engine.fetch_logs("missing"), Err(AclError::NotFound(_))));
}

#[tokio::test]
async fn test_update_acl_pushes_to_targets() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &acls("web")).await.unwrap();

    let updated = web().with_ingress(vec![Rule::new(Action::Allow).with_protocol("tcp").with_destination_port("22")]);
    s.engine.update_acl(updated).await.unwrap();
    assert_eq!(
        ingress_action(&s, &net0(), &Packet::tcp(client(), server(), 22)),
        Some(Action::Allow)
    );
    assert_eq!(
        ingress_action(&s, &net0(), &Packet::tcp(client(), server(), 80)),
        Some(Action::Reject)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_nic_updates() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();
    let engine = Arc::new(s.engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .set_nic(NicId::new(format!("c{}", i), "eth0"), "net0", &acls("web"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(engine.index().members_of("web").len(), 16);
    assert_eq!(s.backend.targets().len(), 16);
    for target in s.backend.targets() {
        let plan = engine.applied_plan(&target).unwrap();
        assert_eq!(plan.direction(Direction::Ingress).rule_count(), 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutations_on_one_target_converge() {
    let s = setup();
    s.engine.create_acl(web()).unwrap();
    s.engine.create_acl(block()).unwrap();
    s.engine.set_network("net0", "mem", &HashMap::new()).await.unwrap();
    let c1 = NicId::new("c1", "eth0");
    s.engine.set_nic(c1.clone(), "net0", &acls("web")).await.unwrap();
    let engine = Arc::new(s.engine);

    let mut handles = Vec::new();
    for i in 0..24usize {
        let engine = engine.clone();
        let c1 = c1.clone();
        handles.push(tokio::spawn(async move {
            match i % 4 {
                0 => {
                    let lists = ["web", "web,block-acl", ""];
                    engine.set_nic(c1, "net0", &acls(lists[i % 3])).await
                }
                1 => {
                    let port = (8000 + i).to_string();
                    let rule = Rule::new(Action::Allow).with_protocol("tcp").with_destination_port(port);
                    engine.update_acl(web().with_ingress(vec![rule])).await
                }
                2 => {
                    let list = if i % 8 == 2 { "block-acl" } else { "" };
                    engine.set_network("net0", "mem", &acls(list)).await
                }
                _ => engine.compile_target(&Target::Nic(c1)).map(|_| ()),
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await
    .expect("mutations did not finish");

    // Enforcement matches the last committed state
    let target = Target::Nic(c1);
    let expected = engine.compile_target(&target).unwrap();
    if expected.is_empty() {
        assert!(engine.applied_plan(&target).is_none());
        assert!(s.backend.plan(&target).is_none());
    } else {
        assert_eq!(engine.applied_plan(&target), Some(expected.clone()));
        assert_eq!(s.backend.plan(&target), Some(expected));
    }
    assert_eq!(engine.applied_plan(&net0()).is_some(), !engine.compile_target(&net0()).unwrap().is_empty());
}
