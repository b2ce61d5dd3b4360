//! End-to-end runs of the orchestrator against a scripted backend.

mod common;

use std::time::Duration;

use common::{app, env, network, options, FakeBackend, Harness};
use serde_json::json;
use stackwright::error::{ErrorClass, GraphError, StackwrightError, StateError};
use stackwright::planner::ChangeKind;
use stackwright::state::{LocalStateStore, StateStore};
use stackwright::{ApplyMode, ApplyOptions, DeployableUnit, UnitState};

#[tokio::test]
async fn changed_network_redeploys_without_touching_app() {
    let harness = Harness::new(FakeBackend::new());
    let first = harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();
    assert!(first.is_success());
    assert_eq!(harness.backend.submitted_units(), vec!["network", "app"]);
    assert_eq!(harness.backend.submissions()[1].document["vpc"], "vpc-0abc");

    harness.backend.clear();
    let report = harness
        .orchestrator
        .apply(vec![network("10.1.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();

    assert_eq!(report.order(), vec!["network", "app"]);

    let net = report.get("network").unwrap();
    assert_eq!(net.state, UnitState::Succeeded);
    assert_eq!(net.last_active_state, Some(UnitState::InProgress));
    assert_eq!(net.change_set.as_ref().unwrap().kind, ChangeKind::Update);
    assert!(!net.change_set.as_ref().unwrap().is_empty());

    let app = report.get("app").unwrap();
    assert_eq!(app.state, UnitState::Succeeded);
    assert!(app.change_set.as_ref().unwrap().is_empty());
    assert_eq!(app.submissions, 0);

    assert_eq!(harness.backend.submitted_units(), vec!["network"]);
}

#[tokio::test]
async fn teardown_destroys_dependents_first() {
    let harness = Harness::new(FakeBackend::new());
    harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();
    harness.backend.clear();

    let report = harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Destroy, options())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.order(), vec!["app", "network"]);
    let kinds: Vec<_> = harness.backend.submissions().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Destroy, ChangeKind::Destroy]);
    assert_eq!(harness.backend.submitted_units(), vec!["app", "network"]);
    assert!(harness.store.list_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_apply_leaves_its_record_untouched() {
    let harness = Harness::new(FakeBackend::new());
    harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();
    let before = harness.store.load_record("app", &env()).await.unwrap().unwrap();

    let harness = harness.reopen(FakeBackend::new().failing("app"));
    let changed_app = DeployableUnit::new(
        "app",
        env(),
        json!({"type": "service", "vpc": "${network.vpc_id}", "replicas": 5}),
    );
    let mut events = harness.orchestrator.subscribe();
    let report = harness
        .orchestrator
        .apply(vec![network("10.1.0.0/16"), changed_app], ApplyMode::Deploy, options())
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.get("network").unwrap().state, UnitState::Succeeded);

    let failed = report.get("app").unwrap();
    assert_eq!(failed.state, UnitState::RolledBack);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.class, ErrorClass::TerminalBackend);
    assert_eq!(error.diagnostics, vec!["app rejected by policy"]);

    let network_record = harness.store.load_record("network", &env()).await.unwrap().unwrap();
    assert_eq!(network_record.revision, 2);
    assert_eq!(network_record.document["cidr"], "10.1.0.0/16");

    let after = harness.store.load_record("app", &env()).await.unwrap().unwrap();
    assert_eq!(after, before);

    let kinds: Vec<_> = harness
        .backend
        .submissions()
        .iter()
        .filter(|s| s.unit_id == "app")
        .map(|s| s.kind)
        .collect();
    assert_eq!(kinds, vec![ChangeKind::Update, ChangeKind::Rollback]);

    let mut app_states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.unit_id == "app" {
            app_states.push(event.state);
        }
    }
    assert_eq!(
        app_states,
        vec![
            UnitState::Diffing,
            UnitState::Submitting,
            UnitState::InProgress,
            UnitState::RolledBack
        ]
    );
}

#[tokio::test]
async fn lost_contact_while_polling_is_not_rolled_back() {
    let harness = Harness::new(FakeBackend::new());
    harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();
    let before = harness.store.load_record("network", &env()).await.unwrap().unwrap();

    let harness = harness.reopen(FakeBackend::new().unreachable("network"));
    let report = harness
        .orchestrator
        .apply(vec![network("10.1.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();

    let net = report.get("network").unwrap();
    assert_eq!(net.state, UnitState::Failed);
    assert_eq!(net.last_active_state, Some(UnitState::InProgress));
    assert_eq!(net.submissions, 1);
    assert_eq!(net.error.as_ref().unwrap().class, ErrorClass::TransientBackend);

    let kinds: Vec<_> = harness.backend.submissions().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Update]);
    assert_eq!(report.get("app").unwrap().blocked_by, vec!["network"]);
    assert_eq!(harness.store.load_record("network", &env()).await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn long_run_renews_its_lock() {
    let harness = Harness::new(FakeBackend::new().slow("network", 200));
    let opts = ApplyOptions {
        lock_refresh_interval: Duration::from_millis(5),
        ..options()
    };

    let orchestrator = harness.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .apply(vec![network("10.0.0.0/16")], ApplyMode::Deploy, opts)
            .await
    });

    let mut held = loop {
        if let Some(info) = harness.store.get_lock_info().await.unwrap() {
            break info;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };

    // Age the lock past its expiry as if the run had been going for a while.
    held.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    let staged = harness.dir.path().join("run.lock.staged");
    std::fs::write(&staged, serde_json::to_string(&held).unwrap()).unwrap();
    std::fs::rename(&staged, harness.dir.path().join("run.lock")).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    let renewed = harness.store.get_lock_info().await.unwrap().unwrap();
    assert_eq!(renewed.lock_id, held.lock_id);
    assert!(!renewed.is_expired());

    let rival = LocalStateStore::with_base_dir(harness.dir.path());
    assert!(matches!(
        rival.acquire_lock("rival").await,
        Err(StackwrightError::State(StateError::LockedByOther { .. }))
    ));

    let report = run.await.unwrap().unwrap();
    assert!(report.is_success());
    assert!(harness.store.get_lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn failure_is_isolated_to_its_branch() {
    let harness = Harness::new(FakeBackend::new().failing("network"));
    let dns = DeployableUnit::new("dns", env(), json!({"zone": "example.com"}));

    let report = harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app(), dns], ApplyMode::Deploy, options())
        .await
        .unwrap();

    let net = report.get("network").unwrap();
    assert_eq!(net.state, UnitState::RolledBack);
    // Create then the partial-create cleanup.
    assert_eq!(net.submissions, 2);

    let blocked = report.get("app").unwrap();
    assert_eq!(blocked.state, UnitState::Pending);
    assert_eq!(blocked.blocked_by, vec!["network"]);
    assert!(blocked.error.is_none());

    assert_eq!(report.get("dns").unwrap().state, UnitState::Succeeded);
    assert!(harness.store.load_record("dns", &env()).await.unwrap().is_some());
    assert!(harness.store.load_record("network", &env()).await.unwrap().is_none());
    assert!(!harness.backend.submitted_units().contains(&String::from("app")));
}

#[tokio::test]
async fn cycle_aborts_before_any_backend_call() {
    let harness = Harness::new(FakeBackend::new());
    let units = vec![
        DeployableUnit::new("a", env(), json!({"peer": "${b.id}"})),
        DeployableUnit::new("b", env(), json!({})).depends_on("a"),
        DeployableUnit::new("c", env(), json!({})),
    ];

    let err = harness
        .orchestrator
        .apply(units, ApplyMode::Deploy, options())
        .await
        .unwrap_err();

    match err {
        StackwrightError::Graph(GraphError::Cycle { units }) => {
            assert_eq!(units, vec!["a", "b"]);
        }
        other => panic!("expected a cycle error, got {other}"),
    }
    assert!(harness.backend.submissions().is_empty());
    assert!(harness.store.list_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn throttled_submissions_are_retried() {
    let harness = Harness::new(FakeBackend::new().throttled("network", 2));

    let report = tokio_test::assert_ok!(
        harness
            .orchestrator
            .apply(vec![network("10.0.0.0/16")], ApplyMode::Deploy, options())
            .await
    );

    let net = report.get("network").unwrap();
    assert_eq!(net.state, UnitState::Succeeded);
    assert_eq!(net.submissions, 1);
    assert_eq!(harness.backend.submitted_units(), vec!["network"]);
}

#[tokio::test]
async fn exhausted_retries_fail_the_unit() {
    let harness = Harness::new(FakeBackend::new().throttled("network", 10));

    let report = harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();

    let net = report.get("network").unwrap();
    assert_eq!(net.state, UnitState::Failed);
    assert_eq!(net.last_active_state, Some(UnitState::Submitting));
    assert_eq!(report.get("app").unwrap().blocked_by, vec!["network"]);
    assert!(harness.backend.submissions().is_empty());
}

#[tokio::test]
async fn context_is_resolved_once_for_concurrent_units() {
    let harness = Harness::new(FakeBackend::new());
    let units: Vec<DeployableUnit> = (0..6)
        .map(|i| {
            DeployableUnit::new(
                format!("subnet-{i}"),
                env(),
                json!({"index": i, "zones": "${context:availability-zones?tier=public}"}),
            )
        })
        .collect();
    let opts = ApplyOptions {
        concurrency_limit: 6,
        ..options()
    };

    let report = harness
        .orchestrator
        .apply(units.clone(), ApplyMode::Deploy, opts.clone())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(harness.backend.resolutions(), 1);
    for submission in harness.backend.submissions() {
        assert_eq!(submission.document["zones"], json!(["eu-west-1a", "eu-west-1b"]));
    }

    // A later run reads the stored entry and changes nothing.
    harness.backend.clear();
    let again = harness
        .orchestrator
        .apply(units, ApplyMode::Deploy, opts)
        .await
        .unwrap();
    assert!(again.is_success());
    assert_eq!(harness.backend.resolutions(), 1);
    assert!(harness.backend.submissions().is_empty());
}

#[tokio::test]
async fn rollback_mode_restores_recorded_documents() {
    let harness = Harness::new(FakeBackend::new());
    harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();
    let records_before = harness.store.list_records().await.unwrap();
    harness.backend.clear();

    let drifted = DeployableUnit::new("worker", env(), json!({"size": "large"}));
    let report = harness
        .orchestrator
        .apply(
            vec![network("10.9.0.0/16"), app(), drifted],
            ApplyMode::Rollback,
            options(),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    // Only the network document differs from what was recorded.
    let submissions = harness.backend.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].unit_id, "network");
    assert_eq!(submissions[0].kind, ChangeKind::Rollback);
    assert_eq!(submissions[0].document["cidr"], "10.0.0.0/16");

    assert_eq!(report.get("worker").unwrap().submissions, 0);
    assert_eq!(harness.store.list_records().await.unwrap(), records_before);
}

#[tokio::test]
async fn dry_run_plans_without_side_effects() {
    let harness = Harness::new(FakeBackend::new());
    let opts = ApplyOptions {
        dry_run: true,
        ..options()
    };

    let report = harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, opts)
        .await
        .unwrap();

    assert!(report.dry_run);
    assert!(report.is_success());
    assert_eq!(report.count(UnitState::Planned), 2);
    assert_eq!(
        report.get("app").unwrap().change_set.as_ref().unwrap().unresolved,
        vec!["/vpc"]
    );
    assert!(harness.backend.submissions().is_empty());
    assert!(harness.store.list_records().await.unwrap().is_empty());
    assert!(harness.store.get_lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_run_starts_nothing() {
    let harness = Harness::new(FakeBackend::new());
    harness.orchestrator.cancellation().cancel();

    let report = harness
        .orchestrator
        .apply(vec![network("10.0.0.0/16"), app()], ApplyMode::Deploy, options())
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.count(UnitState::Pending), 2);
    assert!(harness.backend.submissions().is_empty());
    assert!(harness.store.get_lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn plan_is_deterministic_and_side_effect_free() {
    let harness = Harness::new(FakeBackend::new());
    let units = || {
        vec![
            DeployableUnit::new("queue", env(), json!({"fifo": true})),
            app(),
            network("10.0.0.0/16"),
        ]
    };

    let first = harness.orchestrator.plan(units()).await.unwrap();
    let second = harness.orchestrator.plan(units()).await.unwrap();

    assert_eq!(first.order(), vec!["queue", "network", "app"]);
    assert_eq!(first.order(), second.order());
    assert_eq!(first.change_count(), 3);
    assert!(harness.backend.submissions().is_empty());
    assert_eq!(harness.backend.resolutions(), 0);
}
