//! Window Scheduler
//!
//! Periodic sweep that finalizes optimistic resolutions whose window has
//! elapsed and retries finalizations deferred by an upstream failure. A
//! failure on one entity is logged and counted; the sweep moves on and the
//! next tick retries.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::governance::{FinalizeOutcome, GovernanceEngine};
use crate::models::{ProposalStatus, UmaResolution, UmaStatus};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// `PROPOSED` → `EXPIRED_NO_DISPUTE`
    pub expired: usize,
    /// `UMA_VOTING` → `UMA_LOCKED`
    pub locked: usize,
    /// Deferred multisig proposals resolved on retry.
    pub multisig_resolved: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

pub struct WindowScheduler {
    engine: GovernanceEngine,
    interval: Duration,
}

impl WindowScheduler {
    pub fn new(engine: GovernanceEngine, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Interval taken from the engine's configuration.
    pub fn from_engine(engine: GovernanceEngine) -> Self {
        let interval = engine.config().scheduler_interval;
        Self::new(engine, interval)
    }

    /// One sweep. Never returns an error; per-entity failures land in
    /// [`SweepReport::failures`].
    pub async fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.engine.now();

        // 1. Undisputed resolutions past their dispute window.
        match self.engine.store().uma_resolutions_by_status(UmaStatus::Proposed).await {
            Ok(proposed) => {
                for resolution in proposed.iter().filter(|r| r.dispute_window_ends <= now) {
                    self.finalize(resolution, &mut report).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to load proposed resolutions");
                report.failures += 1;
            }
        }

        // 2. Disputed resolutions past their voting window or with a full
        //    committee (an early finalize that failed upstream).
        match self.engine.store().uma_resolutions_by_status(UmaStatus::UmaVoting).await {
            Ok(voting) => {
                for resolution in &voting {
                    match self.voting_due(resolution, now).await {
                        Ok(true) => self.finalize(resolution, &mut report).await,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(resolution_id = %resolution.id, error = %e, "Failed to load votes");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to load voting resolutions");
                report.failures += 1;
            }
        }

        // 3. Multisig proposals at threshold whose broadcast failed.
        match self
            .engine
            .store()
            .proposals_by_status(ProposalStatus::PendingSignatures)
            .await
        {
            Ok(pending) => {
                for proposal in pending.iter().filter(|p| p.threshold_met()) {
                    match self.engine.retry_multisig_finalize(&proposal.id).await {
                        Ok(Some(receipt)) if receipt.resolved => report.multisig_resolved += 1,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(proposal_id = %proposal.id, error = %e, "Multisig retry failed");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to load pending proposals");
                report.failures += 1;
            }
        }

        report
    }

    async fn voting_due(
        &self,
        resolution: &UmaResolution,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        if resolution.voting_ends().is_some_and(|ends| ends <= now) {
            return Ok(true);
        }
        let votes = self
            .engine
            .store()
            .get_votes_by_resolution(&resolution.id)
            .await?;
        Ok(votes.len() >= resolution.committee_size)
    }

    async fn finalize(&self, resolution: &UmaResolution, report: &mut SweepReport) {
        match self.engine.finalize_uma_resolution(&resolution.id).await {
            Ok(FinalizeOutcome::Finalized(locked)) => match locked.status {
                UmaStatus::ExpiredNoDispute => report.expired += 1,
                UmaStatus::UmaLocked => report.locked += 1,
                _ => {}
            },
            Ok(FinalizeOutcome::AlreadyFinal(_)) | Ok(FinalizeOutcome::NotDue(_)) => {}
            Err(e) => {
                warn!(
                    market_id = %resolution.market_id,
                    resolution_id = %resolution.id,
                    error = %e,
                    "Finalize failed, retrying next tick"
                );
                report.failures += 1;
            }
        }
    }

    /// Spawns the sweep loop. The first tick runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs_f64(), "⏱️ Window scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.tick().await;
                        if report.is_quiet() {
                            debug!("Sweep: nothing due");
                        } else {
                            info!(
                                expired = report.expired,
                                locked = report.locked,
                                multisig_resolved = report.multisig_resolved,
                                failures = report.failures,
                                "Sweep complete"
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Window scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Owns the running sweep task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals shutdown and waits for the in-flight tick to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.context("scheduler task panicked")
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
