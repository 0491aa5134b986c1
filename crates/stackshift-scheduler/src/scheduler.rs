//! Provisioning scheduler
//!
//! Walks a compiled [`Plan`], dispatching every operation whose dependencies
//! have succeeded. Independent branches run concurrently up to the global and
//! per-kind limits. A failure skips everything that transitively waits on the
//! failed operation and leaves unrelated branches running; the run always
//! completes with a [`RunSummary`].

use crate::config::{RetryPolicy, SchedulerConfig};
use crate::executor::{ApplyOutcome, Executor};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use stackshift_core::{Operation, OperationId, OperationKind, Plan, ResourceId, ResourceStatus};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CANCELLED: &str = "cancelled";

// ---------------------------------------------------------------------------
// Operation status
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress events, broadcast to any subscriber
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Dispatched {
        op: OperationId,
        kind: OperationKind,
        resource: ResourceId,
    },
    Retrying {
        op: OperationId,
        resource: ResourceId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Completed by `apply`.
    Succeeded {
        op: OperationId,
        resource: ResourceId,
        attempts: u32,
    },
    /// Backend already matched; `apply` was not called.
    Converged { op: OperationId, resource: ResourceId },
    Failed {
        op: OperationId,
        resource: ResourceId,
        error: String,
    },
    Skipped { op: OperationId, resource: ResourceId },
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    pub id: OperationId,
    pub kind: OperationKind,
    pub resource: ResourceId,
    pub status: OperationStatus,
    pub attempts: u32,
    pub converged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationReport {
    fn new(op: &Operation) -> Self {
        Self {
            id: op.id,
            kind: op.kind,
            resource: op.resource().clone(),
            status: OperationStatus::Pending,
            attempts: 0,
            converged: false,
            error: None,
        }
    }
}

/// The failure that was reported first, with the raw executor error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub operation: OperationId,
    pub kind: OperationKind,
    pub resource: ResourceId,
    pub error: String,
    pub attempts: u32,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) failed after {} attempt(s): {}",
            self.kind, self.resource, self.operation, self.attempts, self.error
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Subset of `succeeded` that needed no `apply`.
    pub converged: usize,
    pub cancelled: bool,
    pub first_failure: Option<FailureCause>,
    /// One report per operation, in plan order.
    pub reports: Vec<OperationReport>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && !self.cancelled
    }

    pub fn report(&self, id: OperationId) -> Option<&OperationReport> {
        self.reports.get(id.0)
    }

    pub fn status_of(&self, resource: &ResourceId) -> Option<OperationStatus> {
        self.reports
            .iter()
            .find(|r| &r.resource == resource)
            .map(|r| r.status)
    }

    /// Resource statuses implied by the run. Skipped operations leave their
    /// resource untouched and are not listed.
    pub fn resulting_statuses(&self) -> impl Iterator<Item = (&ResourceId, ResourceStatus)> {
        self.reports.iter().filter_map(|r| match r.status {
            OperationStatus::Succeeded => Some((&r.resource, r.kind.target_status())),
            OperationStatus::Failed => Some((&r.resource, ResourceStatus::Failed)),
            _ => None,
        })
    }

    fn tally(&mut self) {
        for report in &self.reports {
            match report.status {
                OperationStatus::Succeeded => {
                    self.succeeded += 1;
                    if report.converged {
                        self.converged += 1;
                    }
                }
                OperationStatus::Failed => self.failed += 1,
                OperationStatus::Skipped => self.skipped += 1,
                OperationStatus::Pending | OperationStatus::Dispatched => {}
            }
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded ({} already converged), {} failed, {} skipped",
            self.succeeded, self.converged, self.failed, self.skipped
        )?;
        if self.cancelled {
            write!(f, ", cancelled")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn Executor>, config: SchedulerConfig, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            executor,
            config,
            retry,
            events,
        }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Execute `plan` to completion or cancellation.
    ///
    /// On cancellation nothing new is dispatched, in-flight operations end
    /// `Failed("cancelled")` and everything not yet dispatched is `Skipped`.
    pub async fn run(&self, plan: &Plan, cancel: &CancellationToken) -> RunSummary {
        let ctx = Arc::new(RunContext {
            executor: self.executor.clone(),
            retry: self.retry.clone(),
            timeout: self.config.operation_timeout(),
            global: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            kind_limits: self.kind_semaphores(plan),
            events: self.events.clone(),
            statuses: plan
                .operations()
                .iter()
                .map(|op| (op.id, OperationStatus::Pending))
                .collect(),
            cancel: cancel.clone(),
        });

        let mut waiting: Vec<usize> = plan.operations().iter().map(|op| op.depends_on.len()).collect();
        let mut ready: BTreeSet<OperationId> = plan
            .operations()
            .iter()
            .filter(|op| op.depends_on.is_empty())
            .map(|op| op.id)
            .collect();
        let mut reports: Vec<OperationReport> = plan.operations().iter().map(OperationReport::new).collect();
        let mut first_failure: Option<FailureCause> = None;
        let mut tasks: JoinSet<OperationReport> = JoinSet::new();

        info!(
            executor = self.executor.name(),
            operations = plan.len(),
            "starting plan run"
        );

        loop {
            if !cancel.is_cancelled() {
                while let Some(id) = ready.pop_first() {
                    if let Some(op) = plan.get(id) {
                        tasks.spawn(supervise(ctx.clone(), op.clone()));
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "operation task did not complete");
                    continue;
                }
            };

            match report.status {
                OperationStatus::Succeeded => {
                    for dependent in plan.dependents_of(report.id) {
                        waiting[dependent.0] = waiting[dependent.0].saturating_sub(1);
                        if waiting[dependent.0] == 0 && ctx.status(dependent) == OperationStatus::Pending {
                            ready.insert(dependent);
                        }
                    }
                }
                OperationStatus::Failed => {
                    if first_failure.is_none() {
                        first_failure = Some(FailureCause {
                            operation: report.id,
                            kind: report.kind,
                            resource: report.resource.clone(),
                            error: report.error.clone().unwrap_or_default(),
                            attempts: report.attempts,
                        });
                    }
                    for dependent in plan.transitive_dependents(report.id) {
                        if ctx.status(dependent) == OperationStatus::Pending {
                            ready.remove(&dependent);
                            reports[dependent.0].status = OperationStatus::Skipped;
                            ctx.skip(dependent, &reports[dependent.0].resource);
                        }
                    }
                }
                _ => {}
            }
            let index = report.id.0;
            reports[index] = report;
        }

        // Whatever never got dispatched was cut off by cancellation.
        for report in reports.iter_mut() {
            match ctx.status(report.id) {
                OperationStatus::Pending => {
                    report.status = OperationStatus::Skipped;
                    ctx.skip(report.id, &report.resource);
                }
                OperationStatus::Dispatched => {
                    report.status = OperationStatus::Failed;
                    report.error = Some("operation task lost".into());
                }
                _ => {}
            }
        }

        let mut summary = RunSummary {
            cancelled: cancel.is_cancelled(),
            first_failure,
            reports,
            ..RunSummary::default()
        };
        summary.tally();

        if summary.is_success() {
            info!(%summary, "plan run complete");
        } else {
            warn!(%summary, first_failure = ?summary.first_failure.as_ref().map(ToString::to_string), "plan run incomplete");
        }
        summary
    }

    fn kind_semaphores(&self, plan: &Plan) -> HashMap<String, Arc<Semaphore>> {
        let mut limits = HashMap::new();
        for op in plan.operations() {
            let kind = op.resource().kind();
            if let Some(limit) = self.config.kind_limit(kind) {
                limits
                    .entry(kind.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))));
            }
        }
        limits
    }
}

// ---------------------------------------------------------------------------
// Per-operation driver
// ---------------------------------------------------------------------------

/// State shared by every task of one run.
struct RunContext {
    executor: Arc<dyn Executor>,
    retry: RetryPolicy,
    timeout: Duration,
    global: Arc<Semaphore>,
    kind_limits: HashMap<String, Arc<Semaphore>>,
    events: broadcast::Sender<SchedulerEvent>,
    statuses: DashMap<OperationId, OperationStatus>,
    cancel: CancellationToken,
}

impl RunContext {
    fn status(&self, id: OperationId) -> OperationStatus {
        self.statuses
            .get(&id)
            .map(|s| *s)
            .unwrap_or(OperationStatus::Pending)
    }

    fn set_status(&self, id: OperationId, status: OperationStatus) {
        self.statuses.insert(id, status);
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn skip(&self, op: OperationId, resource: &ResourceId) {
        self.set_status(op, OperationStatus::Skipped);
        debug!(%op, %resource, "skipped");
        self.emit(SchedulerEvent::Skipped {
            op,
            resource: resource.clone(),
        });
    }

    /// `None` once the run is cancelled.
    async fn acquire(&self, semaphore: Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        }
    }

    async fn already_converged(&self, op: &Operation) -> bool {
        let observed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            observed = tokio::time::timeout(self.timeout, self.executor.observe(&op.node)) => observed,
        };
        match observed {
            Ok(Ok(observation)) => observation.satisfies(op),
            Ok(Err(e)) => {
                warn!(op = %op.id, resource = %op.resource(), error = %e, "observe failed, applying");
                false
            }
            Err(_) => {
                warn!(op = %op.id, resource = %op.resource(), "observe timed out, applying");
                false
            }
        }
    }

    fn finish(
        &self,
        mut report: OperationReport,
        status: OperationStatus,
        error: Option<String>,
    ) -> OperationReport {
        report.status = status;
        report.error = error;
        self.set_status(report.id, status);
        let (op, resource) = (report.id, report.resource.clone());
        match (status, &report.error) {
            (OperationStatus::Succeeded, _) if report.converged => {
                info!(%op, %resource, "already converged");
                self.emit(SchedulerEvent::Converged { op, resource });
            }
            (OperationStatus::Succeeded, _) => {
                info!(%op, %resource, kind = %report.kind, attempts = report.attempts, "succeeded");
                self.emit(SchedulerEvent::Succeeded {
                    op,
                    resource,
                    attempts: report.attempts,
                });
            }
            (OperationStatus::Failed, error) => {
                let error = error.clone().unwrap_or_default();
                error!(%op, %resource, kind = %report.kind, attempts = report.attempts, %error, "failed");
                self.emit(SchedulerEvent::Failed { op, resource, error });
            }
            (OperationStatus::Skipped, _) => self.skip(op, &resource),
            _ => {}
        }
        report
    }
}

/// Run one operation, turning a panicking executor into a failure.
async fn supervise(ctx: Arc<RunContext>, op: Operation) -> OperationReport {
    let report = OperationReport::new(&op);
    match AssertUnwindSafe(drive(ctx.clone(), op)).catch_unwind().await {
        Ok(report) => report,
        Err(_) => ctx.finish(report, OperationStatus::Failed, Some("executor panicked".into())),
    }
}

async fn drive(ctx: Arc<RunContext>, op: Operation) -> OperationReport {
    let mut report = OperationReport::new(&op);

    // Kind permit first, then global, so a serialized kind never pins global slots.
    let _kind_permit = match ctx.kind_limits.get(op.resource().kind()) {
        Some(semaphore) => match ctx.acquire(semaphore.clone()).await {
            Some(permit) => Some(permit),
            None => return ctx.finish(report, OperationStatus::Skipped, None),
        },
        None => None,
    };
    let Some(_permit) = ctx.acquire(ctx.global.clone()).await else {
        return ctx.finish(report, OperationStatus::Skipped, None);
    };

    ctx.set_status(op.id, OperationStatus::Dispatched);
    debug!(op = %op.id, resource = %op.resource(), kind = %op.kind, "dispatched");
    ctx.emit(SchedulerEvent::Dispatched {
        op: op.id,
        kind: op.kind,
        resource: op.resource().clone(),
    });

    if ctx.already_converged(&op).await {
        report.converged = true;
        return ctx.finish(report, OperationStatus::Succeeded, None);
    }

    loop {
        report.attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => ApplyOutcome::Failed(CANCELLED.into()),
            applied = tokio::time::timeout(ctx.timeout, ctx.executor.apply(&op)) => {
                applied.unwrap_or_else(|_| {
                    ApplyOutcome::Retryable(format!("timed out after {}ms", ctx.timeout.as_millis()))
                })
            }
        };

        match outcome {
            ApplyOutcome::Succeeded => return ctx.finish(report, OperationStatus::Succeeded, None),
            ApplyOutcome::Retryable(error) if ctx.retry.allows_retry(report.attempts) => {
                let delay = ctx.retry.backoff(report.attempts);
                warn!(
                    op = %op.id,
                    resource = %op.resource(),
                    attempt = report.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retryable failure"
                );
                ctx.emit(SchedulerEvent::Retrying {
                    op: op.id,
                    resource: op.resource().clone(),
                    attempt: report.attempts,
                    delay_ms: delay.as_millis() as u64,
                    error,
                });
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return ctx.finish(report, OperationStatus::Failed, Some(CANCELLED.into()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ApplyOutcome::Retryable(error) | ApplyOutcome::Failed(error) => {
                return ctx.finish(report, OperationStatus::Failed, Some(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, kind: OperationKind, status: OperationStatus, converged: bool) -> OperationReport {
        OperationReport {
            id: OperationId(0),
            kind,
            resource: ResourceId::new("vm", name),
            status,
            attempts: 1,
            converged,
            error: None,
        }
    }

    #[test]
    fn tally_counts_converged_within_succeeded() {
        let mut summary = RunSummary {
            reports: vec![
                report("a", OperationKind::Create, OperationStatus::Succeeded, true),
                report("b", OperationKind::Create, OperationStatus::Succeeded, false),
                report("c", OperationKind::Delete, OperationStatus::Failed, false),
                report("d", OperationKind::Update, OperationStatus::Skipped, false),
            ],
            ..RunSummary::default()
        };
        summary.tally();
        assert_eq!((summary.succeeded, summary.converged), (2, 1));
        assert_eq!((summary.failed, summary.skipped), (1, 1));
        assert!(!summary.is_success());
        assert_eq!(
            summary.to_string(),
            "2 succeeded (1 already converged), 1 failed, 1 skipped"
        );
    }

    #[test]
    fn resulting_statuses_skip_untouched_resources() {
        let summary = RunSummary {
            reports: vec![
                report("a", OperationKind::Delete, OperationStatus::Succeeded, false),
                report("b", OperationKind::Create, OperationStatus::Failed, false),
                report("c", OperationKind::Create, OperationStatus::Skipped, false),
            ],
            ..RunSummary::default()
        };
        let statuses: Vec<_> = summary
            .resulting_statuses()
            .map(|(id, s)| (id.name().to_string(), s))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("a".to_string(), ResourceStatus::Deleted),
                ("b".to_string(), ResourceStatus::Failed),
            ]
        );
    }
}
