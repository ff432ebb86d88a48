//! Resolution Governance Engine
//!
//! Turns an admin's claimed outcome into a final, auditable market verdict via
//! one of two paths:
//!
//! - **multisig**: proposal → N-of-M admin signatures → broadcast → RESOLVED
//! - **optimistic**: proposal → dispute window → (undisputed) EXPIRED_NO_DISPUTE,
//!   or (disputed) voting window → tally → UMA_LOCKED
//!
//! Every mutating entry point takes the market's in-process mutex, consults
//! the lock guard, then re-reads state from the [`Store`] before writing. The
//! store's compare-and-swap updates keep this correct across processes; the
//! mutex keeps one process from broadcasting the same outcome twice.

pub mod audit;
pub mod dispute;
pub mod lock_guard;
pub mod multisig;
pub mod tally;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::broadcaster::Broadcaster;
use crate::clock::{remaining_until, Clock};
use crate::config::GovernanceConfig;
use crate::error::{GovernanceError, GovernanceResult};
use crate::models::{
    Market, MarketStatus, Outcome, ProposalStatus, Resolution, ResolutionProposal, UmaResolution,
    UmaStatus, Vote,
};
use crate::store::Store;

pub use dispute::{FinalizeOutcome, VoteReceipt};
pub use multisig::SignReceipt;
pub use tally::{tally_votes, VoteTally};

/// Per-market async mutexes. Holds no resolution state.
#[derive(Default)]
struct MarketLocks {
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MarketLocks {
    async fn acquire(&self, market_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(market_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Clone)]
pub struct GovernanceEngine {
    config: Arc<GovernanceConfig>,
    store: Arc<dyn Store>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    market_locks: Arc<MarketLocks>,
}

impl GovernanceEngine {
    pub fn new(
        config: GovernanceConfig,
        store: Arc<dyn Store>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            broadcaster,
            clock,
            market_locks: Arc::new(MarketLocks::default()),
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn lock_market(&self, market_id: &str) -> OwnedMutexGuard<()> {
        self.market_locks.acquire(market_id).await
    }

    // ========================================================================
    // Shared checks
    // ========================================================================

    async fn load_market(&self, market_id: &str) -> GovernanceResult<Market> {
        self.store
            .get_market(market_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("market", market_id))
    }

    fn parse_outcome(&self, raw: u8) -> GovernanceResult<Outcome> {
        Outcome::try_from(raw).map_err(GovernanceError::Validation)
    }

    fn validate_id(&self, field: &str, raw: &str) -> GovernanceResult<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GovernanceError::Validation(format!("{field} must not be empty")));
        }
        Ok(trimmed.to_string())
    }

    /// Evidence and dispute reasons: trimmed, non-empty, bounded.
    fn validate_text(&self, field: &str, raw: &str) -> GovernanceResult<String> {
        let trimmed = self.validate_id(field, raw)?;
        let len = trimmed.chars().count();
        if len > self.config.max_text_len {
            return Err(GovernanceError::Validation(format!(
                "{field} is {len} characters, limit is {}",
                self.config.max_text_len
            )));
        }
        Ok(trimmed)
    }

    fn window_end(
        &self,
        window: &str,
        start: DateTime<Utc>,
        length: chrono::Duration,
    ) -> GovernanceResult<DateTime<Utc>> {
        start.checked_add_signed(length).ok_or_else(|| {
            GovernanceError::Validation(format!("{window} window ends beyond the representable range"))
        })
    }

    /// Preconditions shared by both proposal paths, in order: lock guard
    /// (Forbidden), market status (Conflict), one active resolution per market
    /// (Conflict).
    async fn ensure_can_propose(&self, market: &Market) -> GovernanceResult<()> {
        self.ensure_not_locked(&market.id).await?;

        if matches!(market.status, MarketStatus::Resolved | MarketStatus::Closed) {
            return Err(GovernanceError::Conflict(format!(
                "market {} is already {}",
                market.id,
                market.status.as_str()
            )));
        }

        if let Some(active) = self.active_resolution(&market.id).await? {
            let kind = match active {
                Resolution::Multisig(p) => format!("multisig proposal {}", p.id),
                Resolution::Optimistic(r) => format!("optimistic resolution {}", r.id),
            };
            return Err(GovernanceError::Conflict(format!(
                "market {} already has an active {kind}",
                market.id
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Read accessors
    // ========================================================================

    /// The market's non-terminal resolution, if any.
    pub async fn active_resolution(&self, market_id: &str) -> GovernanceResult<Option<Resolution>> {
        let pending = self
            .store
            .proposals_for_market(market_id)
            .await?
            .into_iter()
            .find(|p| p.status == ProposalStatus::PendingSignatures);
        if let Some(proposal) = pending {
            return Ok(Some(Resolution::Multisig(proposal)));
        }

        let open = self
            .store
            .uma_resolutions_for_market(market_id)
            .await?
            .into_iter()
            .find(|r| !r.is_terminal());
        Ok(open.map(Resolution::Optimistic))
    }

    pub async fn get_pending_proposals(&self) -> GovernanceResult<Vec<ResolutionProposal>> {
        Ok(self
            .store
            .proposals_by_status(ProposalStatus::PendingSignatures)
            .await?)
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> GovernanceResult<ResolutionProposal> {
        self.store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("proposal", proposal_id))
    }

    /// Most recent optimistic resolution for the market.
    pub async fn get_uma_resolution(
        &self,
        market_id: &str,
    ) -> GovernanceResult<Option<UmaResolution>> {
        Ok(self
            .store
            .uma_resolutions_for_market(market_id)
            .await?
            .into_iter()
            .last())
    }

    pub async fn get_uma_resolution_by_id(
        &self,
        resolution_id: &str,
    ) -> GovernanceResult<UmaResolution> {
        self.store
            .get_uma_resolution(resolution_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("uma resolution", resolution_id))
    }

    pub async fn get_votes(&self, resolution_id: &str) -> GovernanceResult<Vec<Vote>> {
        Ok(self.store.get_votes_by_resolution(resolution_id).await?)
    }

    /// Time left to dispute the market's resolution. `None` unless the latest
    /// resolution is still `PROPOSED`; zero once the window has elapsed but the
    /// scheduler has not swept it yet.
    pub async fn get_dispute_time_remaining(
        &self,
        market_id: &str,
    ) -> GovernanceResult<Option<Duration>> {
        let now = self.now();
        Ok(self
            .get_uma_resolution(market_id)
            .await?
            .filter(|r| r.status == UmaStatus::Proposed)
            .map(|r| remaining_until(now, r.dispute_window_ends)))
    }

    /// Time left to vote. `None` unless the latest resolution is `UMA_VOTING`.
    pub async fn get_voting_time_remaining(
        &self,
        market_id: &str,
    ) -> GovernanceResult<Option<Duration>> {
        let now = self.now();
        Ok(self
            .get_uma_resolution(market_id)
            .await?
            .filter(|r| r.status == UmaStatus::UmaVoting)
            .and_then(|r| r.voting_ends())
            .map(|ends| remaining_until(now, ends)))
    }
}
