//! Blue/green cutover state machine
//!
//! Owns one [`CutoverSession`] and is the only thing that mutates it. Every
//! transition and weight change is persisted and published as a snapshot;
//! callers observe through [`CutoverMachine::subscribe`] and stop a run by
//! cancelling the token handed to [`CutoverMachine::new`].
//!
//! Any failure on the forward path, cancellation included, goes through
//! `RollingBack`, which routes all traffic back to blue before the session
//! ends in `RolledBack`. The green stack is left in place for inspection.

use crate::config::CutoverConfig;
use crate::error::{CutoverError, Result};
use crate::health::{HealthProbe, HealthStatus};
use crate::session::{BlueRetirement, CutoverSession, CutoverState, Signal};
use crate::stack::StackColor;
use crate::store::SessionStore;
use stackshift_core::{compile, DependencyGraph};
use stackshift_scheduler::{ExecutorError, Scheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Forward progress: `Ok` carries the signal for the next transition,
/// `Err` the signal that sends the session into rollback.
type Step<T = Signal> = std::result::Result<T, Signal>;

pub struct CutoverMachine {
    session: CutoverSession,
    scheduler: Arc<Scheduler>,
    probe: Arc<dyn HealthProbe>,
    store: Arc<dyn SessionStore>,
    config: CutoverConfig,
    cancel: CancellationToken,
    snapshots: watch::Sender<CutoverSession>,
}

impl CutoverMachine {
    pub fn new(
        session: CutoverSession,
        scheduler: Arc<Scheduler>,
        probe: Arc<dyn HealthProbe>,
        store: Arc<dyn SessionStore>,
        config: CutoverConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let (snapshots, _) = watch::channel(session.clone());
        Ok(Self {
            session,
            scheduler,
            probe,
            store,
            config,
            cancel,
            snapshots,
        })
    }

    pub fn session(&self) -> &CutoverSession {
        &self.session
    }

    /// Snapshot stream. Closes when the machine is dropped.
    pub fn subscribe(&self) -> watch::Receiver<CutoverSession> {
        self.snapshots.subscribe()
    }

    /// Drive a freshly created session to `Promoted` or `RolledBack`.
    pub async fn run(&mut self) -> Result<CutoverSession> {
        if self.session.state != CutoverState::Initializing {
            return Err(CutoverError::InvalidTransition {
                from: self.session.state,
                to: CutoverState::GreenProvisioning,
            });
        }
        self.publish().await;
        self.advance(CutoverState::GreenProvisioning, Signal::SessionCreated)
            .await?;

        if let Some(cause) = self.forward().await? {
            self.roll_back(cause).await?;
        }
        Ok(self.session.clone())
    }

    /// Finish a session found mid-flight after a restart. Whatever it was
    /// doing, traffic goes back to blue.
    pub async fn recover(&mut self) -> Result<CutoverSession> {
        match self.session.state {
            state if state.is_terminal() => {}
            CutoverState::RollingBack => self.finish_rollback().await?,
            CutoverState::Initializing => {
                self.advance(CutoverState::GreenProvisioning, Signal::SessionCreated)
                    .await?;
                self.roll_back(Signal::Recovered).await?;
            }
            _ => self.roll_back(Signal::Recovered).await?,
        }
        Ok(self.session.clone())
    }

    /// After promotion: wait out the termination window, then delete every
    /// blue resource through the scheduler. Cancellation during the wait
    /// leaves blue in place.
    pub async fn retire_blue(&mut self) -> Result<()> {
        if self.session.state != CutoverState::Promoted {
            return Ok(());
        }
        let wait = self.config.blue_termination_wait();
        info!(
            session = %self.session.id,
            stack = %self.session.blue.id,
            wait_ms = wait.as_millis() as u64,
            "blue scheduled for termination"
        );
        let abandoned = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(wait) => false,
        };
        if abandoned {
            warn!(session = %self.session.id, stack = %self.session.blue.id, "blue termination abandoned");
            self.session.blue_retirement = BlueRetirement::Abandoned;
            self.publish().await;
            return Ok(());
        }

        let plan = compile(&DependencyGraph::new(), &self.session.blue.graph)?;
        let summary = self.scheduler.run(&plan, &self.cancel).await;
        self.session
            .blue
            .graph
            .apply_statuses(summary.resulting_statuses());
        self.session.blue_retirement = if summary.is_success() {
            info!(session = %self.session.id, stack = %self.session.blue.id, "blue terminated");
            BlueRetirement::Completed
        } else {
            let cause = summary
                .first_failure
                .as_ref()
                .map_or_else(|| summary.to_string(), ToString::to_string);
            error!(session = %self.session.id, stack = %self.session.blue.id, %cause, "blue termination failed");
            BlueRetirement::Failed(cause)
        };
        self.publish().await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Forward path
    // -----------------------------------------------------------------------

    /// `None` once promoted, otherwise the cause to roll back with.
    async fn forward(&mut self) -> Result<Option<Signal>> {
        match self.provision_green().await {
            Ok(signal) => self.advance(CutoverState::HealthChecking, signal).await?,
            Err(cause) => return Ok(Some(cause)),
        }
        match self.health_gate().await {
            Ok(signal) => self.advance(CutoverState::TrafficShifting, signal).await?,
            Err(cause) => return Ok(Some(cause)),
        }
        match self.shift_traffic().await {
            Ok(signal) => self.advance(CutoverState::Validating, signal).await?,
            Err(cause) => return Ok(Some(cause)),
        }
        match self.validate_green().await {
            Ok(signal) => self.advance(CutoverState::Promoted, signal).await?,
            Err(cause) => return Ok(Some(cause)),
        }
        Ok(None)
    }

    async fn provision_green(&mut self) -> Step {
        let plan = compile(&self.session.green.graph, &DependencyGraph::new())
            .map_err(|e| Signal::ProvisioningFailed { cause: e.to_string() })?;
        info!(
            session = %self.session.id,
            stack = %self.session.green.id,
            operations = plan.len(),
            "provisioning green"
        );

        let summary = self.scheduler.run(&plan, &self.cancel).await;
        self.session
            .green
            .graph
            .apply_statuses(summary.resulting_statuses());
        self.publish().await;

        if self.cancel.is_cancelled() {
            return Err(Signal::CancelRequested);
        }
        if !summary.is_success() {
            let cause = summary
                .first_failure
                .as_ref()
                .map_or_else(|| summary.to_string(), ToString::to_string);
            return Err(Signal::ProvisioningFailed { cause });
        }
        Ok(Signal::GreenProvisioned {
            operations: plan.len(),
        })
    }

    /// Consecutive healthy readings, one every `check_interval`.
    async fn health_gate(&mut self) -> Step {
        let (mut healthy, mut unhealthy) = (0u32, 0u32);
        for check in 1..=self.config.max_health_checks {
            if check > 1 {
                self.pause(self.config.check_interval()).await?;
            }
            match self.probe_green().await? {
                HealthStatus::Healthy => {
                    healthy += 1;
                    unhealthy = 0;
                    debug!(session = %self.session.id, check, healthy, "green healthy");
                    if healthy >= self.config.healthy_threshold {
                        return Ok(Signal::HealthChecksPassed {
                            consecutive: healthy,
                        });
                    }
                }
                HealthStatus::Unhealthy(reason) => {
                    healthy = 0;
                    unhealthy += 1;
                    warn!(session = %self.session.id, check, unhealthy, %reason, "green unhealthy");
                    if unhealthy >= self.config.unhealthy_threshold {
                        return Err(Signal::HealthCheckFailed { reason });
                    }
                }
            }
        }
        Err(Signal::HealthCheckTimeout {
            checks: self.config.max_health_checks,
        })
    }

    /// Step green's weight up, re-probing before each increment.
    async fn shift_traffic(&mut self) -> Step {
        let steps = self.config.traffic_steps.clone();
        for (i, weight) in steps.into_iter().enumerate() {
            if i > 0 {
                self.pause(self.config.step_pause()).await?;
            }
            if let HealthStatus::Unhealthy(reason) = self.probe_green().await? {
                warn!(
                    session = %self.session.id,
                    weight = self.session.green.traffic_weight,
                    %reason,
                    "green unhealthy during traffic shift"
                );
                return Err(Signal::HealthCheckFailed { reason });
            }
            // Green gains before blue loses.
            let shifted = match self.route(StackColor::Green, weight).await {
                Ok(()) => self.route(StackColor::Blue, 100 - weight).await,
                Err(e) => Err(e),
            };
            if let Err(e) = shifted {
                return Err(Signal::TrafficError {
                    error: e.to_string(),
                });
            }
            info!(session = %self.session.id, weight, "shifted traffic to green");
            self.publish().await;
        }
        Ok(Signal::TrafficShifted { green_weight: 100 })
    }

    /// Bake window: probe every `check_interval`, at least once.
    async fn validate_green(&mut self) -> Step {
        let checks = self.config.bake_checks();
        for _ in 0..checks {
            self.pause(self.config.check_interval()).await?;
            if let HealthStatus::Unhealthy(reason) = self.probe_green().await? {
                return Err(Signal::ValidationFailed { reason });
            }
        }
        Ok(Signal::ValidationPassed { checks })
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    async fn roll_back(&mut self, cause: Signal) -> Result<()> {
        warn!(session = %self.session.id, state = %self.session.state, %cause, "rolling back");
        self.advance(CutoverState::RollingBack, cause).await?;
        self.finish_rollback().await
    }

    async fn finish_rollback(&mut self) -> Result<()> {
        let signal = match self.restore_blue().await {
            Ok(()) => Signal::TrafficRestored,
            Err(e) => {
                error!(session = %self.session.id, error = %e, "could not restore traffic to blue");
                Signal::TrafficRestoreFailed {
                    error: e.to_string(),
                }
            }
        };
        self.advance(CutoverState::RolledBack, signal).await
    }

    /// blue = 100 then green = 0, retried with the scheduler's backoff.
    /// Not cancellable.
    async fn restore_blue(&mut self) -> std::result::Result<(), ExecutorError> {
        let policy = self.scheduler.retry_policy().clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let restored = match self.route(StackColor::Blue, 100).await {
                Ok(()) => self.route(StackColor::Green, 0).await,
                Err(e) => Err(e),
            };
            match restored {
                Ok(()) => {
                    self.publish().await;
                    return Ok(());
                }
                Err(e) if policy.allows_retry(attempt) => {
                    warn!(session = %self.session.id, attempt, error = %e, "traffic restore failed, retrying");
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn advance(&mut self, to: CutoverState, signal: Signal) -> Result<()> {
        let from = self.session.state;
        let reason = signal.to_string();
        self.session.transition(to, signal)?;
        info!(session = %self.session.id, %from, %to, signal = %reason, "cutover transition");
        self.publish().await;
        Ok(())
    }

    /// Persist, then publish. A failed save is logged and the run continues.
    async fn publish(&self) {
        if let Err(e) = self.store.save(&self.session).await {
            error!(session = %self.session.id, error = %e, "failed to persist session");
        }
        self.snapshots.send_replace(self.session.clone());
    }

    async fn pause(&self, duration: Duration) -> Step<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Signal::CancelRequested),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn probe_green(&self) -> Step<HealthStatus> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Signal::CancelRequested),
            status = self.probe.check(&self.session.green) => Ok(status),
        }
    }

    async fn route(&mut self, color: StackColor, weight: u8) -> std::result::Result<(), ExecutorError> {
        let stack = match color {
            StackColor::Blue => &mut self.session.blue,
            StackColor::Green => &mut self.session.green,
        };
        self.scheduler
            .executor()
            .set_traffic_weight(&self.config.load_balancer, stack.id.as_str(), weight)
            .await?;
        stack.traffic_weight = weight;
        Ok(())
    }
}
