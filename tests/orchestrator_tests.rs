//! Tests for the orchestration control surface

use stackshift::{Error, Orchestrator, StackshiftConfig, StoreBackend};
use stackshift_core::{DependencyGraph, ResourceId, ResourceNode};
use stackshift_cutover::{
    BlueRetirement, CutoverConfig, CutoverSession, CutoverState, HealthProbe, HealthStatus,
    MemoryStore, ScriptedProbe, SessionId, SessionStore, Signal, Stack, StackColor,
};
use stackshift_scheduler::{Executor, InMemoryBackend, RetryPolicy, SchedulerConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn lb() -> ResourceId {
    ResourceId::new("lb", "public")
}

fn three_tier() -> DependencyGraph {
    let mut g = DependencyGraph::new();
    for (kind, name) in [("net", "main"), ("lb", "public"), ("app", "web")] {
        g.add_node(ResourceNode::bare(kind, name).unwrap().with_property("version", 1))
            .unwrap();
    }
    g.add_edge(&ResourceId::new("lb", "public"), &ResourceId::new("net", "main"))
        .unwrap();
    g.add_edge(&ResourceId::new("app", "web"), &ResourceId::new("lb", "public"))
        .unwrap();
    g
}

fn config() -> StackshiftConfig {
    let mut config = StackshiftConfig::default();
    config.store.backend = StoreBackend::Memory;
    config.cutover = CutoverConfig {
        load_balancer: lb(),
        check_interval_ms: 1_000,
        max_health_checks: 5,
        step_pause_ms: 2_000,
        bake_window_ms: 2_000,
        blue_termination_wait_ms: 10_000,
        tags: BTreeMap::from([("Environment".to_string(), "test".to_string())]),
        ..CutoverConfig::default()
    };
    config
}

struct Fixture {
    backend: Arc<InMemoryBackend>,
    store: Arc<MemoryStore>,
    orchestrator: Orchestrator,
}

fn fixture_with(probe: impl HealthProbe + 'static) -> Fixture {
    let backend = Arc::new(InMemoryBackend::new());
    let store = Arc::new(MemoryStore::new());
    let orchestrator =
        Orchestrator::new(config(), backend.clone(), Arc::new(probe), store.clone()).unwrap();
    Fixture {
        backend,
        store,
        orchestrator,
    }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedProbe::always_healthy())
}

// ===========================================================================
// Plans
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn plan_then_apply() {
    let f = fixture();
    let plan = f
        .orchestrator
        .plan_deployment(&three_tier(), &DependencyGraph::new())
        .unwrap();
    assert_eq!(plan.summary().creates, 3);

    let summary = f.orchestrator.apply_plan(&plan).await;

    assert!(summary.is_success(), "{summary}");
    assert!(f.backend.contains(&ResourceId::new("app", "web")));

    let again = f
        .orchestrator
        .plan_deployment(&three_tier(), &three_tier())
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn planning_surfaces_plan_conflicts() {
    let f = fixture();
    // lb goes away while both of its neighbours change around it.
    let mut desired = DependencyGraph::new();
    desired
        .add_node(ResourceNode::bare("net", "main").unwrap().with_property("cidr", "10.1.0.0/16"))
        .unwrap();
    desired
        .add_node(ResourceNode::bare("app", "web").unwrap().with_property("upstream", "net.main"))
        .unwrap();
    desired
        .add_edge(&ResourceId::new("app", "web"), &ResourceId::new("net", "main"))
        .unwrap();

    let err = f
        .orchestrator
        .plan_deployment(&desired, &three_tier())
        .unwrap_err();
    assert!(
        matches!(err, Error::Core(stackshift_core::Error::PlanConflict { .. })),
        "{err}"
    );
}

// ===========================================================================
// Bootstrap
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn bootstrap_routes_all_traffic_to_the_first_stack() {
    let f = fixture();
    let stack = f.orchestrator.bootstrap(&three_tier()).await.unwrap();

    assert_eq!(stack.color, StackColor::Blue);
    assert_eq!(stack.traffic_weight, 100);
    assert_eq!(f.backend.weight(&lb(), stack.id.as_str()), Some(100));
    assert_eq!(f.backend.resource_count(), 3);
    assert_eq!(f.orchestrator.active_stack().await.unwrap().id, stack.id);

    let err = f.orchestrator.bootstrap(&three_tier()).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyBootstrapped(id) if id == stack.id));
}

#[tokio::test(start_paused = true)]
async fn failed_bootstrap_leaves_no_active_stack() {
    // Every apply outlives the timeout and nothing is retried.
    let config = StackshiftConfig {
        scheduler: SchedulerConfig {
            operation_timeout_ms: 5,
            ..SchedulerConfig::default()
        },
        retry: RetryPolicy::none(),
        ..config()
    };
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(InMemoryBackend::new()),
        Arc::new(ScriptedProbe::always_healthy()),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    let err = orchestrator.bootstrap(&three_tier()).await.unwrap_err();

    assert!(
        matches!(err, Error::Provisioning(ref cause) if cause.contains("timed out")),
        "{err}"
    );
    assert!(orchestrator.active_stack().await.is_none());
}

#[tokio::test]
async fn cutover_needs_an_active_stack() {
    let f = fixture();
    let err = f.orchestrator.start_cutover(&three_tier()).await.unwrap_err();
    assert!(matches!(err, Error::NoActiveStack));
}

// ===========================================================================
// Cutover
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn cutover_promotes_green_and_retires_blue() {
    let f = fixture();
    let blue = f.orchestrator.bootstrap(&three_tier()).await.unwrap();

    let id = f.orchestrator.start_cutover(&three_tier()).await.unwrap();
    let session = f.orchestrator.wait_for_terminal(&id).await.unwrap();

    assert_eq!(session.state, CutoverState::Promoted);
    assert_eq!(session.blue.id, blue.id);
    assert_eq!(
        f.orchestrator.get_session_state(&id).await.unwrap(),
        CutoverState::Promoted
    );
    let active = f.orchestrator.active_stack().await.unwrap();
    assert_eq!(active.id, session.green.id);
    assert_eq!(active.traffic_weight, 100);

    let done = f.orchestrator.wait_for_completion(&id).await.unwrap();
    assert_eq!(done.blue_retirement, BlueRetirement::Completed);
    // Only green remains.
    assert_eq!(f.backend.resource_count(), 3);
    assert!(f
        .backend
        .contains(&ResourceId::new("app", format!("{}-web", session.green.id))));

    assert!(f.store.list_active().await.unwrap().is_empty());
    assert_eq!(
        f.store.load(&id).await.unwrap().unwrap().state,
        CutoverState::Promoted
    );
}

#[tokio::test(start_paused = true)]
async fn one_cutover_at_a_time() {
    let f = fixture();
    f.orchestrator.bootstrap(&three_tier()).await.unwrap();

    let first = f.orchestrator.start_cutover(&three_tier()).await.unwrap();
    let err = f.orchestrator.start_cutover(&three_tier()).await.unwrap_err();
    assert!(matches!(err, Error::CutoverInProgress(ref id) if *id == first), "{err}");

    f.orchestrator.wait_for_terminal(&first).await.unwrap();
    assert!(f.orchestrator.start_cutover(&three_tier()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancelled_cutover_rolls_back_to_blue() {
    let f = fixture();
    let blue = f.orchestrator.bootstrap(&three_tier()).await.unwrap();
    let id = f.orchestrator.start_cutover(&three_tier()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        f.orchestrator.get_session_state(&id).await.unwrap(),
        CutoverState::TrafficShifting
    );
    f.orchestrator.cancel_cutover(&id).unwrap();
    let session = f.orchestrator.wait_for_terminal(&id).await.unwrap();

    assert_eq!(session.state, CutoverState::RolledBack);
    assert_eq!(session.failure, Some(Signal::CancelRequested));
    assert_eq!(f.backend.weight(&lb(), blue.id.as_str()), Some(100));
    assert_eq!(f.backend.weight(&lb(), session.green.id.as_str()), Some(0));
    assert_eq!(f.orchestrator.active_stack().await.unwrap().id, blue.id);

    // Cancelling a finished session is a no-op.
    f.orchestrator.cancel_cutover(&id).unwrap();
    assert!(matches!(
        f.orchestrator.cancel_cutover(&SessionId::new("missing")),
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn unhealthy_green_keeps_blue_live() {
    let f = fixture_with(ScriptedProbe::new(
        [HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Healthy],
        HealthStatus::unhealthy("5xx"),
    ));
    let blue = f.orchestrator.bootstrap(&three_tier()).await.unwrap();
    let id = f.orchestrator.start_cutover(&three_tier()).await.unwrap();

    let session = f.orchestrator.wait_for_completion(&id).await.unwrap();

    assert_eq!(session.state, CutoverState::RolledBack);
    assert_eq!(session.weights(), (100, 0));
    assert_eq!(session.blue_retirement, BlueRetirement::NotStarted);
    assert_eq!(f.orchestrator.active_stack().await.unwrap().id, blue.id);
    // Green left in place next to blue.
    assert_eq!(f.backend.resource_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn shutdown_forces_running_cutovers_into_rollback() {
    let f = fixture();
    f.orchestrator.bootstrap(&three_tier()).await.unwrap();
    let id = f.orchestrator.start_cutover(&three_tier()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    f.orchestrator.shutdown();
    let session = f.orchestrator.wait_for_terminal(&id).await.unwrap();

    assert_eq!(session.state, CutoverState::RolledBack);
    assert_eq!(session.failure, Some(Signal::CancelRequested));
}

// ===========================================================================
// Recovery
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn recover_rolls_back_interrupted_sessions() {
    let f = fixture();
    let tags = config().cutover.tags;
    let mut blue = Stack::provision(StackColor::Blue, &three_tier(), &tags);
    let mut green = Stack::provision(StackColor::Green, &three_tier(), &tags);
    f.backend.seed(&blue.graph);
    f.backend.seed(&green.graph);
    f.backend.set_traffic_weight(&lb(), blue.id.as_str(), 90).await.unwrap();
    f.backend.set_traffic_weight(&lb(), green.id.as_str(), 10).await.unwrap();
    blue.traffic_weight = 90;
    green.traffic_weight = 10;

    let mut interrupted = CutoverSession::new(blue.clone(), green.clone());
    for (state, signal) in [
        (CutoverState::GreenProvisioning, Signal::SessionCreated),
        (CutoverState::HealthChecking, Signal::GreenProvisioned { operations: 3 }),
        (CutoverState::TrafficShifting, Signal::HealthChecksPassed { consecutive: 2 }),
    ] {
        interrupted.transition(state, signal).unwrap();
    }
    f.store.save(&interrupted).await.unwrap();

    let settled = f.orchestrator.recover().await.unwrap();

    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].state, CutoverState::RolledBack);
    assert_eq!(settled[0].failure, Some(Signal::Recovered));
    assert_eq!(f.backend.weight(&lb(), blue.id.as_str()), Some(100));
    assert_eq!(f.backend.weight(&lb(), green.id.as_str()), Some(0));
    assert_eq!(f.orchestrator.active_stack().await.unwrap().id, blue.id);
    assert!(f.store.list_active().await.unwrap().is_empty());
    assert_eq!(
        f.orchestrator.get_session_state(&interrupted.id).await.unwrap(),
        CutoverState::RolledBack
    );
}

#[tokio::test(start_paused = true)]
async fn file_backed_sessions_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.store.backend = StoreBackend::File;
    config.store.path = dir.path().to_path_buf();
    let backend = Arc::new(InMemoryBackend::new());

    let id = {
        let orchestrator = Orchestrator::from_config(
            config.clone(),
            backend.clone(),
            Arc::new(ScriptedProbe::always_healthy()),
        )
        .await
        .unwrap();
        orchestrator.bootstrap(&three_tier()).await.unwrap();
        let id = orchestrator.start_cutover(&three_tier()).await.unwrap();
        orchestrator.wait_for_completion(&id).await.unwrap();
        id
    };

    let restarted = Orchestrator::from_config(
        config,
        backend,
        Arc::new(ScriptedProbe::always_healthy()),
    )
    .await
    .unwrap();
    assert!(restarted.recover().await.unwrap().is_empty());
    let session = restarted.get_session(&id).await.unwrap();
    assert_eq!(session.state, CutoverState::Promoted);
    assert_eq!(session.blue_retirement, BlueRetirement::Completed);
}

// ===========================================================================
// Demo inputs
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn demo_stack_cuts_over_with_demo_config() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
    let config = StackshiftConfig::load(Some(&root.join("stackshift.toml"))).unwrap();
    assert_eq!(config.store.backend, StoreBackend::Memory);
    let desired: DependencyGraph =
        serde_json::from_str(&std::fs::read_to_string(root.join("web-stack.json")).unwrap())
            .unwrap();
    assert_eq!(desired.len(), 17);

    let orchestrator = Orchestrator::from_config(
        config,
        Arc::new(InMemoryBackend::new()),
        Arc::new(ScriptedProbe::always_healthy()),
    )
    .await
    .unwrap();
    orchestrator.bootstrap(&desired).await.unwrap();
    let id = orchestrator.start_cutover(&desired).await.unwrap();
    let session = orchestrator.wait_for_completion(&id).await.unwrap();

    assert_eq!(session.state, CutoverState::Promoted);
    assert_eq!(session.blue_retirement, BlueRetirement::Completed);
    assert_eq!(
        session.history[1].signal,
        Signal::GreenProvisioned { operations: 17 }
    );
}
