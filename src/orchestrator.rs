//! Orchestration control surface
//!
//! [`Orchestrator`] ties the pieces together: it compiles and applies plans,
//! bootstraps the first stack, and runs each cutover as a background task
//! that callers follow through session snapshots.

use crate::config::{StackshiftConfig, StoreBackend};
use crate::error::{Error, Result};
use dashmap::DashMap;
use stackshift_core::{compile, DependencyGraph, Plan};
use stackshift_cutover::{
    CutoverMachine, CutoverSession, CutoverState, FileStore, HealthProbe, MemoryStore,
    SessionId, SessionStore, Stack, StackColor,
};
use stackshift_scheduler::{Executor, RunSummary, Scheduler, SchedulerEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A cutover running (or finished) in this process.
#[derive(Clone)]
struct SessionHandle {
    cancel: CancellationToken,
    snapshots: watch::Receiver<CutoverSession>,
}

impl SessionHandle {
    fn current(&self) -> CutoverSession {
        self.snapshots.borrow().clone()
    }
}

pub struct Orchestrator {
    config: StackshiftConfig,
    scheduler: Arc<Scheduler>,
    probe: Arc<dyn HealthProbe>,
    store: Arc<dyn SessionStore>,
    /// Stack currently serving traffic.
    active: Arc<RwLock<Option<Stack>>>,
    sessions: DashMap<SessionId, SessionHandle>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: StackshiftConfig,
        executor: Arc<dyn Executor>,
        probe: Arc<dyn HealthProbe>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = Arc::new(Scheduler::new(
            executor,
            config.scheduler.clone(),
            config.retry.clone(),
        ));
        Ok(Self {
            config,
            scheduler,
            probe,
            store,
            active: Arc::new(RwLock::new(None)),
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Like [`Orchestrator::new`], with the session store chosen by `[store]`.
    pub async fn from_config(
        config: StackshiftConfig,
        executor: Arc<dyn Executor>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        let store: Arc<dyn SessionStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::File => Arc::new(FileStore::open(&config.store.path).await?),
        };
        Self::new(config, executor, probe, store)
    }

    pub fn config(&self) -> &StackshiftConfig {
        &self.config
    }

    /// Progress events from every plan run, cutovers included.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    pub async fn active_stack(&self) -> Option<Stack> {
        self.active.read().await.clone()
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    /// Operations that take `observed` to `desired`. Nothing is executed.
    pub fn plan_deployment(
        &self,
        desired: &DependencyGraph,
        observed: &DependencyGraph,
    ) -> Result<Plan> {
        let plan = compile(desired, observed)?;
        info!(summary = ?plan.summary(), "planned deployment");
        Ok(plan)
    }

    /// Execute `plan`. Stops dispatching on [`Orchestrator::shutdown`].
    pub async fn apply_plan(&self, plan: &Plan) -> RunSummary {
        let summary = self.scheduler.run(plan, &self.shutdown.child_token()).await;
        info!(%summary, "plan applied");
        summary
    }

    /// Provision the first stack and route all traffic to it.
    pub async fn bootstrap(&self, desired: &DependencyGraph) -> Result<Stack> {
        let mut active = self.active.write().await;
        if let Some(stack) = active.as_ref() {
            return Err(Error::AlreadyBootstrapped(stack.id.clone()));
        }

        let mut stack = Stack::provision(StackColor::Blue, desired, &self.config.cutover.tags);
        let plan = compile(&stack.graph, &DependencyGraph::new())?;
        info!(stack = %stack.id, operations = plan.len(), "bootstrapping");
        let summary = self.apply_plan(&plan).await;
        stack.graph.apply_statuses(summary.resulting_statuses());
        if !summary.is_success() {
            let cause = summary
                .first_failure
                .as_ref()
                .map_or_else(|| summary.to_string(), ToString::to_string);
            return Err(Error::Provisioning(cause));
        }

        self.scheduler
            .executor()
            .set_traffic_weight(&self.config.cutover.load_balancer, stack.id.as_str(), 100)
            .await
            .map_err(|e| Error::Provisioning(e.to_string()))?;
        stack.traffic_weight = 100;
        *active = Some(stack.clone());
        info!(stack = %stack.id, "stack live");
        Ok(stack)
    }

    // -----------------------------------------------------------------------
    // Cutover
    // -----------------------------------------------------------------------

    /// Start a blue/green cutover to `desired` in the background.
    ///
    /// Requires an active stack. Only one cutover runs at a time.
    pub async fn start_cutover(&self, desired: &DependencyGraph) -> Result<SessionId> {
        // Held until the new handle is registered.
        let active = self.active.read().await;
        if let Some(running) = self.sessions.iter().find(|h| !h.current().is_terminal()) {
            return Err(Error::CutoverInProgress(running.key().clone()));
        }
        let blue = active.clone().ok_or(Error::NoActiveStack)?;

        let green = Stack::provision(StackColor::Green, desired, &self.config.cutover.tags);
        let session = CutoverSession::new(blue, green);
        let id = session.id.clone();
        let cancel = self.shutdown.child_token();
        let machine = CutoverMachine::new(
            session,
            self.scheduler.clone(),
            self.probe.clone(),
            self.store.clone(),
            self.config.cutover.clone(),
            cancel.clone(),
        )?;
        self.store.save(machine.session()).await?;

        self.sessions.insert(
            id.clone(),
            SessionHandle {
                cancel,
                snapshots: machine.subscribe(),
            },
        );
        drop(active);

        info!(session = %id, green = %machine.session().green.id, "cutover started");
        tokio::spawn(drive(machine, self.active.clone(), self.store.clone()));
        Ok(id)
    }

    /// Ask a running cutover to stop. It rolls back to blue. No-op once terminal.
    pub fn cancel_cutover(&self, id: &SessionId) -> Result<()> {
        let handle = self
            .sessions
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        let state = handle.current().state;
        if state.is_terminal() {
            info!(session = %id, %state, "cutover already finished, nothing to cancel");
        } else {
            warn!(session = %id, %state, "cancelling cutover");
            handle.cancel.cancel();
        }
        Ok(())
    }

    /// Latest snapshot of a session, from this process or the store.
    pub async fn get_session(&self, id: &SessionId) -> Result<CutoverSession> {
        if let Some(handle) = self.sessions.get(id) {
            return Ok(handle.current());
        }
        self.store
            .load(id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    pub async fn get_session_state(&self, id: &SessionId) -> Result<CutoverState> {
        Ok(self.get_session(id).await?.state)
    }

    /// Resolves once the session reaches `Promoted` or `RolledBack`.
    pub async fn wait_for_terminal(&self, id: &SessionId) -> Result<CutoverSession> {
        let mut rx = self.receiver(id)?;
        let reached = rx.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
        Ok(match reached {
            Ok(session) => session,
            // Machine gone without a terminal state: report where it stopped.
            Err(_) => rx.borrow().clone(),
        })
    }

    /// Resolves once the background task is done, blue retirement included.
    pub async fn wait_for_completion(&self, id: &SessionId) -> Result<CutoverSession> {
        let mut rx = self.receiver(id)?;
        while rx.changed().await.is_ok() {}
        let session = rx.borrow().clone();
        Ok(session)
    }

    fn receiver(&self, id: &SessionId) -> Result<watch::Receiver<CutoverSession>> {
        self.sessions
            .get(id)
            .map(|h| h.snapshots.clone())
            .ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Settle sessions left unfinished by a previous process.
    ///
    /// Mid-flight sessions are rolled back to blue; the traffic split they
    /// left behind is unknown. Every settled session is archived and the
    /// stack left serving traffic becomes the active one.
    pub async fn recover(&self) -> Result<Vec<CutoverSession>> {
        let mut settled = Vec::new();
        for session in self.store.list_active().await? {
            let id = session.id.clone();
            let session = if session.is_terminal() {
                session
            } else {
                warn!(session = %id, state = %session.state, "recovering interrupted cutover");
                let mut machine = CutoverMachine::new(
                    session,
                    self.scheduler.clone(),
                    self.probe.clone(),
                    self.store.clone(),
                    self.config.cutover.clone(),
                    self.shutdown.child_token(),
                )?;
                machine.recover().await?
            };

            let live = match session.state {
                CutoverState::Promoted => session.green.clone(),
                _ => session.blue.clone(),
            };
            *self.active.write().await = Some(live);
            self.store.archive(&id).await?;
            settled.push(session);
        }
        if !settled.is_empty() {
            info!(sessions = settled.len(), "recovery complete");
        }
        Ok(settled)
    }

    /// Stop all work. Running cutovers roll back to blue.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
    }
}

/// Background task owning one cutover.
async fn drive(
    mut machine: CutoverMachine,
    active: Arc<RwLock<Option<Stack>>>,
    store: Arc<dyn SessionStore>,
) {
    let id = machine.session().id.clone();
    match machine.run().await {
        Ok(session) if session.state == CutoverState::Promoted => {
            *active.write().await = Some(session.green.clone());
            info!(session = %id, stack = %session.green.id, "green promoted");
            if let Err(e) = machine.retire_blue().await {
                error!(session = %id, error = %e, "blue retirement failed");
            }
        }
        Ok(session) => {
            let failure = session.failure.map(|f| f.to_string()).unwrap_or_default();
            warn!(session = %id, %failure, "cutover rolled back");
        }
        Err(e) => error!(session = %id, error = %e, "cutover aborted"),
    }
    if machine.session().is_terminal() {
        if let Err(e) = store.archive(&id).await {
            error!(session = %id, error = %e, "failed to archive session");
        }
    }
}
