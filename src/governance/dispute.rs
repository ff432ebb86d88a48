//! Dispute Protocol
//!
//! Optimistic oracle state machine:
//!
//! ```text
//! PROPOSED ──dispute──▶ UMA_VOTING ──tally──▶ UMA_LOCKED
//!    │
//!    └──window elapsed──▶ EXPIRED_NO_DISPUTE
//! ```
//!
//! Both right-hand states are terminal and lock the market.

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{audit, tally_votes, GovernanceEngine, VoteTally};
use crate::broadcaster::{ResolutionPath, ResolutionPayload};
use crate::error::{GovernanceError, GovernanceResult};
use crate::models::{DisputeInfo, LockInfo, UmaResolution, UmaStatus, Vote};
use crate::store::{encode_ts, MarketEffect};

#[derive(Debug, Clone, serde::Serialize)]
pub struct VoteReceipt {
    pub vote: Vote,
    pub tally: VoteTally,
    pub resolution: UmaResolution,
    /// True when this vote completed the committee and the lock was written.
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// This call wrote the terminal status.
    Finalized(UmaResolution),
    /// Already terminal; nothing written, nothing broadcast.
    AlreadyFinal(UmaResolution),
    /// Window still open and committee incomplete.
    NotDue(UmaResolution),
}

impl FinalizeOutcome {
    pub fn into_resolution(self) -> UmaResolution {
        match self {
            Self::Finalized(r) | Self::AlreadyFinal(r) | Self::NotDue(r) => r,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::NotDue(_))
    }
}

impl GovernanceEngine {
    /// Opens the dispute window on a proposed outcome. Same preconditions and
    /// errors as [`GovernanceEngine::propose_resolution`].
    pub async fn propose_uma_resolution(
        &self,
        market_id: &str,
        outcome: u8,
        evidence: &str,
        admin_id: &str,
    ) -> GovernanceResult<UmaResolution> {
        let outcome = self.parse_outcome(outcome)?;
        let market_id = self.validate_id("market_id", market_id)?;
        let admin_id = self.validate_id("admin_id", admin_id)?;
        let evidence = self.validate_text("evidence", evidence)?;

        let _guard = self.lock_market(&market_id).await;
        let market = self.load_market(&market_id).await?;
        self.ensure_can_propose(&market).await?;

        let proposed_at = self.now();
        let dispute_window_ends =
            self.window_end("dispute", proposed_at, self.config.dispute_window_chrono())?;
        let resolution = UmaResolution {
            id: Uuid::new_v4().to_string(),
            market_id: market.id.clone(),
            proposed_outcome: outcome,
            proposed_by: admin_id,
            evidence,
            status: UmaStatus::Proposed,
            proposed_at,
            dispute_window_ends,
            committee_size: self.config.committee_size,
            dispute: None,
            lock: None,
        };
        self.store.insert_uma_resolution(&resolution).await?;

        info!(
            market_id = %resolution.market_id,
            resolution_id = %resolution.id,
            outcome = outcome.as_u8(),
            dispute_window_ends = %resolution.dispute_window_ends,
            "🔮 Optimistic resolution proposed"
        );
        Ok(resolution)
    }

    /// Moves the market's `PROPOSED` resolution into `UMA_VOTING` and flags
    /// the market as disputed.
    ///
    /// Errors: `NotFound` (no open resolution), `Forbidden` (locked),
    /// `Conflict` (already disputed), `Expired` (dispute window over).
    pub async fn raise_dispute(
        &self,
        market_id: &str,
        user_id: &str,
        reason: &str,
    ) -> GovernanceResult<UmaResolution> {
        let market_id = self.validate_id("market_id", market_id)?;
        let user_id = self.validate_id("user_id", user_id)?;
        let reason = self.validate_text("reason", reason)?;

        let _guard = self.lock_market(&market_id).await;
        self.load_market(&market_id).await?;
        self.ensure_not_locked(&market_id).await?;

        let resolution = self
            .store
            .uma_resolutions_for_market(&market_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| !r.is_terminal())
            .ok_or_else(|| GovernanceError::not_found("uma resolution for market", &market_id))?;

        if resolution.status != UmaStatus::Proposed {
            return Err(GovernanceError::Conflict(format!(
                "resolution {} is {}, only PROPOSED can be disputed",
                resolution.id,
                resolution.status.as_str()
            )));
        }

        let now = self.now();
        if now >= resolution.dispute_window_ends {
            return Err(GovernanceError::Expired {
                window: "dispute",
                closed_at: encode_ts(&resolution.dispute_window_ends),
            });
        }

        let voting_ends = self.window_end("voting", now, self.config.voting_window_chrono())?;
        let mut disputed = resolution.clone();
        disputed.status = UmaStatus::UmaVoting;
        disputed.dispute = Some(DisputeInfo {
            disputed_by: user_id.clone(),
            reason,
            disputed_at: now,
            voting_ends,
        });

        let written = self
            .store
            .update_uma_resolution(&disputed, UmaStatus::Proposed, Some(MarketEffect::FlagDisputed))
            .await?;
        if !written {
            return Err(GovernanceError::Conflict(format!(
                "resolution {} changed while disputing",
                resolution.id
            )));
        }

        info!(
            market_id = %disputed.market_id,
            resolution_id = %disputed.id,
            disputed_by = %user_id,
            voting_ends = ?disputed.voting_ends(),
            "⚔️ Dispute raised, voting open"
        );
        Ok(disputed)
    }

    /// Records one committee vote and re-tallies. When the whole committee has
    /// voted the resolution is finalized without waiting for `voting_ends`.
    /// Once `committee_size` ballots exist further votes are a `Conflict`.
    ///
    /// The vote is kept even if that early finalize fails upstream; the
    /// receipt then reports `finalized = false` and the scheduler retries.
    pub async fn cast_uma_vote(
        &self,
        resolution_id: &str,
        admin_id: &str,
        vote: u8,
    ) -> GovernanceResult<VoteReceipt> {
        let choice = self.parse_outcome(vote)?;
        let resolution_id = self.validate_id("resolution_id", resolution_id)?;
        let admin_id = self.validate_id("admin_id", admin_id)?;

        let market_id = self.get_uma_resolution_by_id(&resolution_id).await?.market_id;
        let _guard = self.lock_market(&market_id).await;
        self.ensure_not_locked(&market_id).await?;

        let resolution = self.get_uma_resolution_by_id(&resolution_id).await?;
        if resolution.status != UmaStatus::UmaVoting {
            return Err(GovernanceError::Conflict(format!(
                "resolution {} is {}, votes need UMA_VOTING",
                resolution.id,
                resolution.status.as_str()
            )));
        }

        let now = self.now();
        if let Some(voting_ends) = resolution.voting_ends() {
            if now >= voting_ends {
                return Err(GovernanceError::Expired {
                    window: "voting",
                    closed_at: encode_ts(&voting_ends),
                });
            }
        }

        let cast = self.store.get_votes_by_resolution(&resolution.id).await?;
        if cast.len() >= resolution.committee_size {
            return Err(GovernanceError::Conflict(format!(
                "committee for resolution {} is complete",
                resolution.id
            )));
        }

        let vote = Vote {
            id: Uuid::new_v4().to_string(),
            resolution_id: resolution.id.clone(),
            admin_id: admin_id.clone(),
            vote: choice,
            voted_at: now,
        };
        if !self.store.insert_vote(&vote).await? {
            return Err(GovernanceError::Conflict(format!(
                "admin {admin_id} already voted on resolution {}",
                resolution.id
            )));
        }

        let votes = self.store.get_votes_by_resolution(&resolution.id).await?;
        let tally = tally_votes(
            votes.iter().take(resolution.committee_size),
            resolution.proposed_outcome,
        );
        info!(
            resolution_id = %resolution.id,
            admin_id = %admin_id,
            vote = choice.as_u8(),
            yes = tally.yes,
            no = tally.no,
            committee_size = resolution.committee_size,
            "🗳️ Vote cast"
        );

        if tally.total() < resolution.committee_size {
            return Ok(VoteReceipt {
                vote,
                tally,
                resolution,
                finalized: false,
            });
        }

        match self.finalize_under_lock(&resolution.id).await {
            Ok(outcome) => {
                let finalized = outcome.is_final();
                Ok(VoteReceipt {
                    vote,
                    tally,
                    resolution: outcome.into_resolution(),
                    finalized,
                })
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    resolution_id = %resolution.id,
                    error = %e,
                    "Early finalize deferred to scheduler"
                );
                Ok(VoteReceipt {
                    vote,
                    tally,
                    resolution: self.get_uma_resolution_by_id(&resolution.id).await?,
                    finalized: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Locks the resolution if it is due: `PROPOSED` past its dispute window
    /// becomes `EXPIRED_NO_DISPUTE` with the proposed outcome; `UMA_VOTING`
    /// past its voting window, or with a complete committee, becomes
    /// `UMA_LOCKED` with the tallied outcome.
    ///
    /// Idempotent: an already terminal resolution yields `AlreadyFinal` with
    /// no store write and no broadcast.
    pub async fn finalize_uma_resolution(
        &self,
        resolution_id: &str,
    ) -> GovernanceResult<FinalizeOutcome> {
        let market_id = self.get_uma_resolution_by_id(resolution_id).await?.market_id;
        let _guard = self.lock_market(&market_id).await;
        self.finalize_under_lock(resolution_id).await
    }

    async fn finalize_under_lock(&self, resolution_id: &str) -> GovernanceResult<FinalizeOutcome> {
        let resolution = self.get_uma_resolution_by_id(resolution_id).await?;
        if resolution.is_terminal() {
            debug!(resolution_id = %resolution.id, "Already final");
            return Ok(FinalizeOutcome::AlreadyFinal(resolution));
        }

        let now = self.now();
        let (next, final_outcome) = match resolution.status {
            UmaStatus::Proposed if now >= resolution.dispute_window_ends => {
                (UmaStatus::ExpiredNoDispute, resolution.proposed_outcome)
            }
            UmaStatus::UmaVoting => {
                let votes = self.store.get_votes_by_resolution(&resolution.id).await?;
                // Only the first committee_size ballots count.
                let tally = tally_votes(
                    votes.iter().take(resolution.committee_size),
                    resolution.proposed_outcome,
                );
                let window_closed = resolution.voting_ends().is_some_and(|ends| now >= ends);
                if !window_closed && tally.total() < resolution.committee_size {
                    return Ok(FinalizeOutcome::NotDue(resolution));
                }
                (UmaStatus::UmaLocked, tally.outcome)
            }
            _ => return Ok(FinalizeOutcome::NotDue(resolution)),
        };

        let lock_hash = audit::lock_hash(
            &resolution.market_id,
            final_outcome,
            &resolution.proposed_at,
            &now,
            &resolution.evidence,
        );
        let market = self.load_market(&resolution.market_id).await?;
        let payload = ResolutionPayload {
            market_id: resolution.market_id.clone(),
            app_id: market.app_id,
            outcome: final_outcome,
            path: ResolutionPath::Optimistic,
            source_id: resolution.id.clone(),
            digest: lock_hash.clone(),
        };
        let tx_id = match self.broadcaster.broadcast(&payload).await {
            Ok(tx_id) => tx_id,
            Err(e) => {
                warn!(
                    market_id = %resolution.market_id,
                    resolution_id = %resolution.id,
                    error = %e,
                    "⚠️ Finalize broadcast failed, resolution stays {}",
                    resolution.status.as_str()
                );
                return Err(GovernanceError::Upstream(
                    e.context(format!("broadcast for resolution {} failed", resolution.id)),
                ));
            }
        };

        let mut locked = resolution.clone();
        locked.status = next;
        locked.lock = Some(LockInfo {
            final_outcome,
            lock_hash,
            locked_at: now,
            tx_id: Some(tx_id.clone()),
        });

        let written = self
            .store
            .update_uma_resolution(
                &locked,
                resolution.status,
                Some(MarketEffect::Resolve(final_outcome)),
            )
            .await?;
        if !written {
            warn!(
                resolution_id = %resolution.id,
                tx_id = %tx_id,
                "Resolution was finalized elsewhere after broadcast"
            );
            let current = self.get_uma_resolution_by_id(&resolution.id).await?;
            return Ok(FinalizeOutcome::AlreadyFinal(current));
        }

        info!(
            market_id = %locked.market_id,
            resolution_id = %locked.id,
            status = next.as_str(),
            final_outcome = final_outcome.as_u8(),
            tx_id = %tx_id,
            "🔒 Resolution locked"
        );
        Ok(FinalizeOutcome::Finalized(locked))
    }
}
