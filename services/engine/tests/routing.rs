mod harness;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::meta;
use switchyard_engine::proxy::{HealthRecord, Liveness, Outcome, DIRECT};
use switchyard_engine::{AdapterRegistry, ConfigError, EngineConfig, Router, SelectError, Snapshot};

fn config(rules: &[&str], policy: &str) -> EngineConfig {
    let rules = rules
        .iter()
        .map(|r| format!("{r:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    EngineConfig::from_toml(&format!(
        r#"
rules = [{rules}]

[[proxies]]
name = "n1"
type = "socks5"
server = "10.0.0.1"
port = 1080

[[proxies]]
name = "n2"
type = "socks5"
server = "10.0.0.2"
port = 1080

[[proxy-groups]]
name = "groupA"
type = "{policy}"
proxies = ["n1", "n2"]
interval = 0
"#
    ))
    .unwrap()
}

fn router(rules: &[&str], policy: &str) -> Router {
    let adapters = AdapterRegistry::with_builtins();
    let snapshot = Snapshot::build(&config(rules, policy), &adapters, None).unwrap();
    Router::new(snapshot)
}

fn set_health(router: &Router, node: &str, record: HealthRecord) {
    router
        .load()
        .registry()
        .get_by_name(node)
        .unwrap()
        .record(record);
}

fn node_of(router: &Router, host: &str) -> String {
    let snapshot = router.load();
    let decision = snapshot.route(&meta(host, 443)).unwrap();
    snapshot.node(decision.node).unwrap().name().to_string()
}

#[test]
fn latency_group_routes_suffix_match_to_fastest_node() {
    let router = router(&["DOMAIN-SUFFIX,example.com,groupA", "MATCH,DIRECT"], "url-test");
    let now = Instant::now();
    set_health(&router, "n1", HealthRecord::alive(Duration::from_millis(50), now));
    set_health(&router, "n2", HealthRecord::alive(Duration::from_millis(10), now));

    let decision = router.route(&meta("a.example.com", 443)).unwrap();
    assert_eq!(decision.target, "groupA");
    assert_eq!(decision.rule.as_deref(), Some("DOMAIN-SUFFIX,example.com,groupA"));
    assert_eq!(node_of(&router, "a.example.com"), "n2");

    let decision = router.route(&meta("other.com", 443)).unwrap();
    assert_eq!(decision.target, DIRECT);
    assert_eq!(decision.rule, None);
    assert!(decision.group.is_none());
}

#[test]
fn leading_dot_suffix_matches_subdomains_only() {
    let router = router(&["DOMAIN-SUFFIX,.example.com,groupA", "MATCH,DIRECT"], "url-test");
    let now = Instant::now();
    set_health(&router, "n1", HealthRecord::alive(Duration::from_millis(50), now));
    set_health(&router, "n2", HealthRecord::alive(Duration::from_millis(10), now));

    let decision = router.route(&meta("A.Example.COM.", 443)).unwrap();
    assert_eq!(decision.target, "groupA");
    assert_eq!(decision.rule.as_deref(), Some("DOMAIN-SUFFIX,.example.com,groupA"));
    assert_eq!(node_of(&router, "a.example.com"), "n2");
    assert_eq!(node_of(&router, "deep.a.example.com"), "n2");

    let apex = router.route(&meta("example.com", 443)).unwrap();
    assert_eq!(apex.target, DIRECT);
    assert_eq!(apex.rule, None);
}

#[test]
fn first_matching_rule_wins_and_order_matters() {
    let keyword_first = router(
        &["DOMAIN-KEYWORD,example,n1", "DOMAIN,a.example.com,n2"],
        "url-test",
    );
    assert_eq!(node_of(&keyword_first, "a.example.com"), "n1");

    let exact_first = router(
        &["DOMAIN,a.example.com,n2", "DOMAIN-KEYWORD,example,n1"],
        "url-test",
    );
    assert_eq!(node_of(&exact_first, "a.example.com"), "n2");
    assert_eq!(node_of(&exact_first, "b.example.com"), "n1");
}

#[test]
fn all_members_dead_yields_no_available_node() {
    let router = router(&["MATCH,groupA"], "url-test");
    let now = Instant::now();
    set_health(&router, "n1", HealthRecord::dead(now));
    set_health(&router, "n2", HealthRecord::dead(now));

    let err = router.route(&meta("a.example.com", 443)).unwrap_err();
    assert_eq!(
        err,
        SelectError::NoAvailableNode {
            group: "groupA".to_string()
        }
    );
}

#[test]
fn reported_failure_applies_to_next_select() {
    let router = router(&["MATCH,groupA"], "fallback");
    let snapshot = router.load();
    let group = snapshot.group("groupA").unwrap();
    let n1 = snapshot.registry().index_of("n1").unwrap();

    assert_eq!(group.select(snapshot.registry()).unwrap(), n1);
    group.report(snapshot.registry(), n1, Outcome::Failure);

    let next = group.select(snapshot.registry()).unwrap();
    assert_eq!(snapshot.node(next).unwrap().name(), "n2");
    assert_eq!(snapshot.node(n1).unwrap().health().liveness(), Liveness::Dead);
}

#[test]
fn rejected_reload_keeps_previous_table() {
    let router = router(&["DOMAIN,a.example.com,n2", "MATCH,DIRECT"], "url-test");

    let bad = config(&["DOMAIN,a.example.com,missing", "MATCH,DIRECT"], "url-test");
    let err = router.reload(&bad, &AdapterRegistry::with_builtins()).unwrap_err();
    assert_eq!(
        err,
        ConfigError::UnknownTarget {
            rule: "DOMAIN,a.example.com,missing".to_string(),
            target: "missing".to_string()
        }
    );

    assert_eq!(router.load().table().len(), 1);
    assert_eq!(node_of(&router, "a.example.com"), "n2");
}

#[test]
fn reload_swaps_table_for_new_sessions_only() {
    let router = router(&["DOMAIN,a.example.com,n2"], "url-test");
    let in_flight = router.load();

    let next = config(&["DOMAIN,a.example.com,n1"], "url-test");
    router.reload(&next, &AdapterRegistry::with_builtins()).unwrap();

    let decision = in_flight.route(&meta("a.example.com", 443)).unwrap();
    assert_eq!(in_flight.node(decision.node).unwrap().name(), "n2");
    assert_eq!(node_of(&router, "a.example.com"), "n1");
}

#[test]
fn manual_selection_survives_reload() {
    let router = router(&["MATCH,groupA"], "select");
    router.load().select_proxy("groupA", "n2").unwrap();
    assert_eq!(node_of(&router, "x.test"), "n2");

    let next = config(&["DOMAIN,never.test,DIRECT", "MATCH,groupA"], "select");
    router.reload(&next, &AdapterRegistry::with_builtins()).unwrap();
    assert_eq!(node_of(&router, "x.test"), "n2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn select_never_observes_torn_health_records() {
    let router = Arc::new(router(&["MATCH,groupA"], "url-test"));
    let stop = Arc::new(AtomicBool::new(false));

    let mut writers = Vec::new();
    for name in ["n1", "n2"] {
        let router = Arc::clone(&router);
        let stop = Arc::clone(&stop);
        writers.push(tokio::spawn(async move {
            let snapshot = router.load();
            let node = Arc::clone(snapshot.registry().get_by_name(name).unwrap());
            let mut i: u64 = 0;
            while !stop.load(Ordering::Relaxed) {
                let record = if i % 2 == 0 {
                    HealthRecord::alive(Duration::from_millis(1 + i % 100), Instant::now())
                } else {
                    HealthRecord::dead(Instant::now())
                };
                node.record(record);
                if i % 3 == 0 {
                    node.report(Outcome::Success);
                }
                i += 1;
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..4 {
        let router = Arc::clone(&router);
        readers.push(tokio::spawn(async move {
            for _ in 0..2_000 {
                let snapshot = router.load();
                for (_, node) in snapshot.registry().iter() {
                    let health = node.health();
                    assert!(health.latency().is_none() || health.is_alive());
                }
                match snapshot.route(&meta("a.example.com", 443)) {
                    Ok(decision) => assert!(decision.group.is_some()),
                    Err(e) => assert!(matches!(e, SelectError::NoAvailableNode { .. })),
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for reader in readers {
        reader.await.unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for writer in writers {
        writer.await.unwrap();
    }
}
