//! Tests for stackshift-scheduler: dispatch order, isolation, retries, cancellation

use stackshift_core::*;
use stackshift_scheduler::*;
use std::result::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn id(kind: &str, name: &str) -> ResourceId {
    ResourceId::new(kind, name)
}

fn graph(nodes: &[(&str, &str)], edges: &[((&str, &str), (&str, &str))]) -> DependencyGraph {
    let mut g = DependencyGraph::new();
    for (kind, name) in nodes {
        g.add_node(ResourceNode::bare(*kind, *name).unwrap().with_property("size", 1))
            .unwrap();
    }
    for ((fk, fname), (tk, tname)) in edges {
        g.add_edge(&id(fk, fname), &id(tk, tname)).unwrap();
    }
    g
}

fn three_tier() -> DependencyGraph {
    graph(
        &[("net", "main"), ("lb", "public"), ("app", "web")],
        &[(("lb", "public"), ("net", "main")), (("app", "web"), ("lb", "public"))],
    )
}

fn scheduler(backend: &Arc<InMemoryBackend>) -> Scheduler {
    Scheduler::new(backend.clone(), SchedulerConfig::default(), RetryPolicy::default())
}

async fn run(scheduler: &Scheduler, plan: &Plan) -> RunSummary {
    scheduler.run(plan, &CancellationToken::new()).await
}

// ===========================================================================
// Ordering
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn creates_follow_dependencies() {
    let backend = Arc::new(InMemoryBackend::new());
    let plan = compile(&three_tier(), &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler(&backend), &plan).await;

    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.succeeded, 3);
    assert_eq!(
        backend.applied(),
        vec![id("net", "main"), id("lb", "public"), id("app", "web")]
    );
}

#[tokio::test(start_paused = true)]
async fn deletes_run_in_reverse() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(&three_tier());
    let plan = compile(&DependencyGraph::new(), &three_tier()).unwrap();

    let summary = run(&scheduler(&backend), &plan).await;

    assert!(summary.is_success());
    assert_eq!(
        backend.applied(),
        vec![id("app", "web"), id("lb", "public"), id("net", "main")]
    );
    assert_eq!(backend.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn statuses_feed_back_into_graph() {
    let backend = Arc::new(InMemoryBackend::new());
    let mut desired = three_tier();
    let plan = compile(&desired, &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler(&backend), &plan).await;
    desired.apply_statuses(summary.resulting_statuses());

    assert!(desired.nodes().all(|n| n.status() == ResourceStatus::Ready));
}

// ===========================================================================
// Failure isolation
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn failure_skips_dependents_only() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.fail_permanently(id("lb", "public"), "listener port in use");
    let desired = graph(
        &[("net", "main"), ("lb", "public"), ("app", "web"), ("dns", "api")],
        &[(("lb", "public"), ("net", "main")), (("app", "web"), ("lb", "public"))],
    );
    let plan = compile(&desired, &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler(&backend), &plan).await;

    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (2, 1, 1));
    assert_eq!(summary.status_of(&id("net", "main")), Some(OperationStatus::Succeeded));
    assert_eq!(summary.status_of(&id("dns", "api")), Some(OperationStatus::Succeeded));
    assert_eq!(summary.status_of(&id("app", "web")), Some(OperationStatus::Skipped));

    let cause = summary.first_failure.as_ref().unwrap();
    assert_eq!(cause.resource, id("lb", "public"));
    assert_eq!(cause.kind, OperationKind::Create);
    assert_eq!(cause.error, "listener port in use");
    assert_eq!(cause.attempts, 1);
    assert!(!backend.contains(&id("app", "web")));
}

#[tokio::test(start_paused = true)]
async fn diamond_dependent_skipped_when_one_parent_fails() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.fail_permanently(id("subnet", "b"), "quota exceeded");
    let desired = graph(
        &[("subnet", "a"), ("subnet", "b"), ("instance", "web"), ("instance", "batch")],
        &[
            (("instance", "web"), ("subnet", "a")),
            (("instance", "web"), ("subnet", "b")),
            (("instance", "batch"), ("subnet", "a")),
        ],
    );
    let plan = compile(&desired, &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler(&backend), &plan).await;

    assert_eq!(summary.status_of(&id("instance", "web")), Some(OperationStatus::Skipped));
    assert_eq!(summary.status_of(&id("instance", "batch")), Some(OperationStatus::Succeeded));
    assert_eq!(backend.apply_count(&id("instance", "web")), 0);
}

struct PanickingExecutor;

#[async_trait::async_trait]
impl Executor for PanickingExecutor {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn apply(&self, _op: &Operation) -> ApplyOutcome {
        panic!("provider client bug");
    }

    async fn observe(&self, _node: &ResourceNode) -> Result<Observation, ExecutorError> {
        Ok(Observation::NotFound)
    }

    async fn set_traffic_weight(
        &self,
        _load_balancer: &ResourceId,
        _stack_id: &str,
        _weight: u8,
    ) -> Result<(), ExecutorError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_executor_fails_the_operation() {
    let scheduler = Scheduler::new(
        Arc::new(PanickingExecutor),
        SchedulerConfig::default(),
        RetryPolicy::default(),
    );
    let plan = compile(&three_tier(), &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler, &plan).await;

    assert_eq!((summary.failed, summary.skipped), (1, 2));
    assert_eq!(summary.first_failure.unwrap().error, "executor panicked");
}

// ===========================================================================
// Retries and timeouts
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::ZERO));
    backend.fail_transiently(id("net", "main"), 2, "throttled");
    let scheduler = scheduler(&backend);
    let mut events = scheduler.subscribe();
    let plan = compile(&graph(&[("net", "main")], &[]), &DependencyGraph::new()).unwrap();

    let started = Instant::now();
    let summary = run(&scheduler, &plan).await;

    assert!(summary.is_success());
    assert_eq!(summary.reports[0].attempts, 3);
    // 500ms + 1000ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(1_500));

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::Retrying { attempt, delay_ms, .. } = event {
            retries.push((attempt, delay_ms));
        }
    }
    assert_eq!(retries, vec![(1, 500), (2, 1_000)]);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_attempt_ceiling() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.fail_transiently(id("net", "main"), 10, "throttled");
    let plan = compile(&graph(&[("net", "main")], &[]), &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler(&backend), &plan).await;

    assert_eq!(summary.failed, 1);
    let cause = summary.first_failure.unwrap();
    assert_eq!(cause.attempts, 4);
    assert_eq!(cause.error, "throttled");
    assert_eq!(backend.apply_count(&id("net", "main")), 4);
}

#[tokio::test(start_paused = true)]
async fn slow_apply_times_out() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.delay(id("app", "web"), Duration::from_secs(600));
    let config = SchedulerConfig {
        operation_timeout_ms: 1_000,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(backend.clone(), config, RetryPolicy::none());
    let plan = compile(&graph(&[("app", "web")], &[]), &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler, &plan).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.first_failure.unwrap().error, "timed out after 1000ms");
}

// ===========================================================================
// Idempotence
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn converged_resources_are_not_reapplied() {
    let backend = Arc::new(InMemoryBackend::new());
    let desired = three_tier();
    backend.seed(&desired);
    let plan = compile(&desired, &DependencyGraph::new()).unwrap();

    let summary = run(&scheduler(&backend), &plan).await;

    assert!(summary.is_success());
    assert_eq!((summary.succeeded, summary.converged), (3, 3));
    assert!(backend.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rerun_after_partial_failure_only_applies_the_rest() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.fail_permanently(id("app", "web"), "image not found");
    let desired = three_tier();
    let plan = compile(&desired, &DependencyGraph::new()).unwrap();
    let scheduler = scheduler(&backend);

    let first = run(&scheduler, &plan).await;
    assert_eq!(first.failed, 1);

    let second = run(&scheduler, &plan).await;
    assert!(second.is_success());
    assert_eq!(second.converged, 2);
    assert_eq!(backend.apply_count(&id("net", "main")), 1);
    assert_eq!(backend.apply_count(&id("app", "web")), 2);
}

// ===========================================================================
// Concurrency limits
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn global_limit_bounds_parallel_applies() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_secs(1)));
    let nodes: Vec<(String, String)> = (0..6).map(|i| ("instance".into(), format!("w{i}"))).collect();
    let refs: Vec<(&str, &str)> = nodes.iter().map(|(k, n)| (k.as_str(), n.as_str())).collect();
    let plan = compile(&graph(&refs, &[]), &DependencyGraph::new()).unwrap();
    let config = SchedulerConfig {
        max_concurrency: 2,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(backend.clone(), config, RetryPolicy::default());

    let started = Instant::now();
    let summary = run(&scheduler, &plan).await;

    assert_eq!(summary.succeeded, 6);
    assert_eq!(backend.max_in_flight(), 2);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn network_kinds_are_serialized() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_secs(1)));
    let desired = graph(
        &[("subnet", "a"), ("subnet", "b"), ("subnet", "c"), ("instance", "x"), ("instance", "y")],
        &[],
    );
    let plan = compile(&desired, &DependencyGraph::new()).unwrap();

    let started = Instant::now();
    let summary = run(&scheduler(&backend), &plan).await;

    assert_eq!(summary.succeeded, 5);
    // three subnets one after another; instances overlap with them
    assert_eq!(started.elapsed().as_secs(), 3);
    assert_eq!(backend.max_in_flight(), 3);
}

// ===========================================================================
// Cancellation and events
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn cancellation_stops_dispatch() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_secs(1)));
    let plan = compile(&three_tier(), &DependencyGraph::new()).unwrap();
    let scheduler = scheduler(&backend);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });
    let summary = scheduler.run(&plan, &cancel).await;

    assert!(summary.cancelled);
    assert_eq!((summary.failed, summary.skipped), (1, 2));
    let net = summary.report(plan.find(&id("net", "main")).unwrap().id).unwrap();
    assert_eq!(net.error.as_deref(), Some("cancelled"));
    assert!(backend.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn events_trace_each_operation() {
    let backend = Arc::new(InMemoryBackend::new());
    let scheduler = scheduler(&backend);
    let mut events = scheduler.subscribe();
    let plan = compile(&three_tier(), &DependencyGraph::new()).unwrap();

    run(&scheduler, &plan).await;

    let mut dispatched = 0;
    let mut succeeded = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::Dispatched { .. } => dispatched += 1,
            SchedulerEvent::Succeeded { attempts, .. } => {
                assert_eq!(attempts, 1);
                succeeded += 1;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!((dispatched, succeeded), (3, 3));
}

#[tokio::test(start_paused = true)]
async fn empty_plan_completes_immediately() {
    let backend = Arc::new(InMemoryBackend::new());
    let summary = run(&scheduler(&backend), &Plan::empty()).await;
    assert!(summary.is_success());
    assert!(summary.reports.is_empty());
}
