//! Reconciliation pass integration tests.
//!
//! These tests drive full passes through `Reconciler::run_pass()` against an
//! in-memory container source and tunnel API.

mod common;

use std::time::Duration;

use cfd_hostnames::config::OrphanPolicy;
use cfd_hostnames::labels;
use cfd_hostnames::metrics::TriggerReason;
use cfd_hostnames::model::IngressRule;
use cfd_hostnames::reconciler::{FailureScope, PassPhase, PassTrigger};
use common::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =========================================================================
// Idempotence and convergence
// =========================================================================

#[tokio::test]
async fn second_pass_without_changes_makes_no_mutations() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start_web("web", "web.example.com");
    let reconciler = reconciler(&source, &api, settings(OrphanPolicy::Keep));

    let first = reconciler.run_pass().await;
    assert!(!first.is_degraded(), "{:?}", first.failures);
    assert_eq!(first.rules, 1);
    assert_eq!(first.changes, 2);
    assert_hostnames(&api, TUNNEL, &[Some("web.example.com"), None]);
    assert_eq!(api.cname("web.example.com"), Some(tunnel_target(TUNNEL)));

    api.clear_calls();
    let second = reconciler.run_pass().await;
    assert!(!second.is_degraded());
    assert_eq!(second.changes, 0);
    assert!(api.mutations().is_empty(), "{:?}", api.mutations());
}

#[tokio::test]
async fn remote_extras_do_not_break_idempotence() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start_web("web", "web.example.com");

    let mut remote = ingress("web.example.com", "http://web:80");
    remote
        .origin_request
        .extra
        .insert("connectTimeout".into(), serde_json::json!(30));
    api.set_routing(TUNNEL, vec![remote.clone(), IngressRule::catch_all()]);
    api.add_record(ZONE_ID, "web.example.com", "CNAME", &tunnel_target(TUNNEL));

    let report = reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert_eq!(report.changes, 0);
    assert!(api.mutations().is_empty());
    assert_eq!(api.routing(TUNNEL).ingress[0], remote);
}

#[tokio::test]
async fn routing_follows_container_starts_and_stops() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    let reconciler = reconciler(&source, &api, settings(OrphanPolicy::Keep));

    source.start_web("a", "a.example.com");
    source.start_web("b", "b.example.com");
    reconciler.run_pass().await;
    assert_hostnames(
        &api,
        TUNNEL,
        &[Some("a.example.com"), Some("b.example.com"), None],
    );

    source.stop("a");
    source.start_web("c", "c.example.com");
    let report = reconciler.run_pass().await;
    assert!(!report.is_degraded());
    assert_hostnames(
        &api,
        TUNNEL,
        &[Some("b.example.com"), Some("c.example.com"), None],
    );

    source.stop("b");
    source.stop("c");
    reconciler.run_pass().await;
    assert_hostnames(&api, TUNNEL, &[None]);
}

#[tokio::test]
async fn last_container_leaving_other_tunnel_shrinks_it() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    let reconciler = reconciler(&source, &api, settings(OrphanPolicy::Keep));

    source.start(
        "api",
        &[
            (labels::HOSTNAME, "api.example.com"),
            (labels::SERVICE, "http://api:8080"),
            (labels::TUNNEL_ID, OTHER_TUNNEL),
        ],
    );
    reconciler.run_pass().await;
    assert_hostnames(&api, OTHER_TUNNEL, &[Some("api.example.com"), None]);

    source.stop("api");
    reconciler.run_pass().await;
    assert_hostnames(&api, OTHER_TUNNEL, &[None]);
}

// =========================================================================
// Catch-all
// =========================================================================

#[tokio::test]
async fn zero_containers_yield_single_catch_all() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    api.set_routing(TUNNEL, vec![]);

    let report = reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert_eq!(report.rules, 0);
    assert_eq!(report.changes, 1);
    let routing = api.routing(TUNNEL);
    assert_eq!(routing.ingress, vec![IngressRule::catch_all()]);
}

#[tokio::test]
async fn existing_catch_all_is_preserved() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    let custom = IngressRule {
        service: "http_status:503".into(),
        ..IngressRule::catch_all()
    };
    api.set_routing(TUNNEL, vec![custom.clone()]);
    source.start_web("web", "web.example.com");

    reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    let routing = api.routing(TUNNEL);
    assert_eq!(routing.ingress.last(), Some(&custom));
    assert_eq!(routing.ingress.iter().filter(|r| r.is_catch_all()).count(), 1);
}

// =========================================================================
// Conflicts and invalid containers
// =========================================================================

#[tokio::test]
async fn first_discovered_container_wins_hostname() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start(
        "first",
        &[
            (labels::HOSTNAME, "a.example.com"),
            (labels::SERVICE, "http://first:80"),
        ],
    );
    source.start(
        "second",
        &[
            (labels::HOSTNAME, "a.example.com"),
            (labels::SERVICE, "http://second:80"),
        ],
    );

    let report = reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert_eq!(report.rules, 1);
    assert_eq!(report.skipped, 1);
    assert!(!report.is_degraded());
    assert_eq!(api.routing(TUNNEL).ingress[0].service, "http://first:80");
}

#[tokio::test]
async fn invalid_container_does_not_block_others() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start(
        "broken",
        &[
            (labels::HOSTNAME, "broken.example.com"),
            (labels::SERVICE, "http://broken:80"),
            (labels::NO_TLS_VERIFY, "sometimes"),
        ],
    );
    source.start_web("web", "web.example.com");

    let report = reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert_eq!(report.skipped, 1);
    assert_hostnames(&api, TUNNEL, &[Some("web.example.com"), None]);
}

#[tokio::test]
async fn default_service_fills_missing_service_label() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start("app", &[(labels::HOSTNAME, "app.example.com")]);

    let mut settings = settings(OrphanPolicy::Keep);
    settings.defaults.default_service = Some("http://app:8080".into());
    reconciler(&source, &api, settings).run_pass().await;

    assert_eq!(api.routing(TUNNEL).ingress[0].service, "http://app:8080");
}

// =========================================================================
// Partial failure isolation
// =========================================================================

#[tokio::test]
async fn dns_failure_for_one_hostname_is_isolated() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start_web("a", "a.example.com");
    source.start_web("b", "b.example.com");
    api.fail_hostname("b.example.com");
    let reconciler = reconciler(&source, &api, settings(OrphanPolicy::Keep));

    let report = reconciler.run_pass().await;
    assert!(report.is_degraded());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        report.failures[0].scope,
        FailureScope::Hostname("b.example.com".into())
    );
    assert_eq!(api.cname("a.example.com"), Some(tunnel_target(TUNNEL)));
    assert_eq!(api.cname("b.example.com"), None);
    assert_hostnames(
        &api,
        TUNNEL,
        &[Some("a.example.com"), Some("b.example.com"), None],
    );

    api.heal();
    api.clear_calls();
    let retry = reconciler.run_pass().await;
    assert!(!retry.is_degraded());
    assert_eq!(
        api.mutations(),
        vec![Call::UpsertDns {
            hostname: "b.example.com".into(),
            update: false
        }]
    );
}

#[tokio::test]
async fn routing_failure_on_one_tunnel_is_isolated() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start_web("a", "a.example.com");
    source.start(
        "b",
        &[
            (labels::HOSTNAME, "b.example.com"),
            (labels::SERVICE, "http://b:80"),
            (labels::TUNNEL_ID, OTHER_TUNNEL),
        ],
    );
    api.fail_tunnel(OTHER_TUNNEL);

    let report = reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert_eq!(
        report
            .failures
            .iter()
            .map(|f| f.scope.clone())
            .collect::<Vec<_>>(),
        vec![FailureScope::Tunnel(OTHER_TUNNEL.into())]
    );
    assert_hostnames(&api, TUNNEL, &[Some("a.example.com"), None]);
    assert_hostnames(&api, OTHER_TUNNEL, &[None]);
    assert_eq!(api.cname("b.example.com"), Some(tunnel_target(OTHER_TUNNEL)));
}

#[tokio::test]
async fn unavailable_runtime_degrades_without_remote_calls() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.set_unavailable(true);

    let report = reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert_eq!(report.failures[0].scope, FailureScope::Source);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn address_record_blocks_cname_for_that_hostname() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    api.add_record(ZONE_ID, "legacy.example.com", "A", "192.0.2.10");
    source.start_web("legacy", "legacy.example.com");

    let report = reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert_eq!(
        report.failures[0].scope,
        FailureScope::Hostname("legacy.example.com".into())
    );
    assert_eq!(api.cname("legacy.example.com"), None);
    assert_eq!(api.records(ZONE_ID).len(), 1);
}

#[tokio::test]
async fn cname_pointing_elsewhere_is_repointed() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    api.add_record(ZONE_ID, "web.example.com", "CNAME", "old.cfargotunnel.com");
    source.start_web("web", "web.example.com");

    reconciler(&source, &api, settings(OrphanPolicy::Keep))
        .run_pass()
        .await;

    assert!(api.mutations().contains(&Call::UpsertDns {
        hostname: "web.example.com".into(),
        update: true
    }));
    assert_eq!(api.cname("web.example.com"), Some(tunnel_target(TUNNEL)));
    assert_eq!(api.records(ZONE_ID).len(), 1);
}

// =========================================================================
// Orphan policies
// =========================================================================

#[tokio::test]
async fn keep_preserves_foreign_rules_and_dns() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    api.set_routing(
        TUNNEL,
        vec![
            ingress("manual.example.com", "http://manual:80"),
            IngressRule::catch_all(),
        ],
    );
    let reconciler = reconciler(&source, &api, settings(OrphanPolicy::Keep));

    source.start_web("web", "web.example.com");
    reconciler.run_pass().await;
    assert_hostnames(
        &api,
        TUNNEL,
        &[Some("web.example.com"), Some("manual.example.com"), None],
    );

    source.stop("web");
    reconciler.run_pass().await;
    assert_hostnames(&api, TUNNEL, &[Some("manual.example.com"), None]);
    assert_eq!(api.cname("web.example.com"), Some(tunnel_target(TUNNEL)));
    assert!(!api
        .mutations()
        .iter()
        .any(|c| matches!(c, Call::DeleteDns(_))));
}

#[tokio::test]
async fn prune_drops_foreign_rules_and_stale_tunnel_dns() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    api.set_routing(
        TUNNEL,
        vec![
            ingress("manual.example.com", "http://manual:80"),
            IngressRule::catch_all(),
        ],
    );
    api.add_record(ZONE_ID, "stale.example.com", "CNAME", &tunnel_target(TUNNEL));
    api.add_record(ZONE_ID, "elsewhere.example.com", "CNAME", "tunnel-z.cfargotunnel.com");
    api.add_record(ZONE_ID, "www.example.com", "A", "192.0.2.1");
    source.start_web("web", "web.example.com");

    let report = reconciler(&source, &api, settings(OrphanPolicy::Prune))
        .run_pass()
        .await;

    assert!(!report.is_degraded(), "{:?}", report.failures);
    assert_hostnames(&api, TUNNEL, &[Some("web.example.com"), None]);
    let names: Vec<String> = api.records(ZONE_ID).into_iter().map(|r| r.name).collect();
    assert!(!names.contains(&"stale.example.com".to_string()));
    assert!(names.contains(&"elsewhere.example.com".to_string()));
    assert!(names.contains(&"www.example.com".to_string()));
    assert!(names.contains(&"web.example.com".to_string()));
}

// =========================================================================
// Dry run
// =========================================================================

#[tokio::test]
async fn dry_run_plans_without_mutating() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    source.start_web("web", "web.example.com");

    let mut settings = settings(OrphanPolicy::Keep);
    settings.dry_run = true;
    let reconciler = reconciler(&source, &api, settings);

    let report = reconciler.run_pass().await;
    assert_eq!(report.changes, 2);
    assert!(api.mutations().is_empty());
    assert_hostnames(&api, TUNNEL, &[None]);

    let again = reconciler.run_pass().await;
    assert_eq!(again.changes, 2);
}

// =========================================================================
// Pass gate
// =========================================================================

#[tokio::test(start_paused = true)]
async fn queued_requests_coalesce_into_one_pass() {
    let source = FakeSource::new();
    let api = FakeTunnelApi::new();
    let reconciler = Arc::new(reconciler(&source, &api, settings(OrphanPolicy::Keep)));
    let trigger = PassTrigger::new();
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        trigger.request(TriggerReason::Event);
    }
    let worker = tokio::spawn(reconciler.clone().run(trigger.clone(), cancel.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.routing_fetches(), 1);

    trigger.request(TriggerReason::Periodic);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.routing_fetches(), 2);

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn requests_during_a_pass_run_exactly_one_more() {
    let source = FakeSource::new();
    source.start_web("web", "web.example.com");
    let api = FakeTunnelApi::new();
    let reconciler = Arc::new(reconciler(&source, &api, settings(OrphanPolicy::Keep)));
    let trigger = PassTrigger::new();
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(reconciler.clone().run(trigger.clone(), cancel.clone()));

    api.hold_fetches();
    trigger.request(TriggerReason::Startup);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.fetches_in_flight(), 1, "first pass is parked in fetch");
    assert_eq!(reconciler.phase(), PassPhase::Fetching);

    for reason in [TriggerReason::Event, TriggerReason::Periodic, TriggerReason::Reconnect] {
        trigger.request(reason);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.routing_fetches(), 1, "no pass starts while one is running");

    api.release_fetches();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.routing_fetches(), 2);
    assert_eq!(reconciler.phase(), PassPhase::Idle);
    assert_hostnames(&api, TUNNEL, &[Some("web.example.com"), None]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.routing_fetches(), 2, "requests made mid-pass collapse into one");

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_passes_do_not_overlap() {
    let source = FakeSource::new();
    source.start_web("web", "web.example.com");
    let api = FakeTunnelApi::new();
    let reconciler = Arc::new(reconciler(&source, &api, settings(OrphanPolicy::Keep)));

    api.hold_fetches();
    let both = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { tokio::join!(reconciler.run_pass(), reconciler.run_pass()) }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.fetches_in_flight(), 1);
    assert_eq!(api.routing_fetches(), 1, "second pass waits for the first");

    api.release_fetches();
    let (first, second) = both.await.unwrap();
    assert!(first.failures.is_empty());
    assert!(second.failures.is_empty());
    assert_eq!(second.changes, 0);
    assert_eq!(api.routing_fetches(), 2);
    assert_eq!(api.max_fetches_in_flight(), 1);
    assert_eq!(reconciler.phase(), PassPhase::Idle);
}
