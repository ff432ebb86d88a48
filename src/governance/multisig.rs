//! Multisig Flow
//!
//! N-of-M admin signatures. The proposer's signature is recorded on creation;
//! once the proposal's threshold is met the outcome is broadcast and the
//! proposal and its market are resolved in one store transaction.

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{audit, GovernanceEngine};
use crate::broadcaster::{ResolutionPath, ResolutionPayload};
use crate::error::{GovernanceError, GovernanceResult};
use crate::models::{ProposalStatus, ResolutionProposal};
use crate::store::MarketEffect;

#[derive(Debug, Clone, Serialize)]
pub struct SignReceipt {
    pub proposal: ResolutionProposal,
    pub resolved: bool,
    pub tx_id: Option<String>,
}

impl SignReceipt {
    fn current(proposal: ResolutionProposal) -> Self {
        Self {
            resolved: proposal.is_terminal(),
            tx_id: proposal.tx_id.clone(),
            proposal,
        }
    }
}

impl GovernanceEngine {
    /// Creates a `PENDING_SIGNATURES` proposal signed by its proposer.
    ///
    /// Errors: `Validation` (outcome, evidence), `NotFound` (market),
    /// `Forbidden` (locked), `Conflict` (market resolved or closed, or another
    /// resolution already active).
    ///
    /// With a threshold of one the proposer's signature is enough and the
    /// proposal is finalized on the spot; if that broadcast fails the pending
    /// proposal is still returned and the scheduler retries it.
    pub async fn propose_resolution(
        &self,
        market_id: &str,
        outcome: u8,
        evidence: &str,
        admin_id: &str,
    ) -> GovernanceResult<ResolutionProposal> {
        let outcome = self.parse_outcome(outcome)?;
        let market_id = self.validate_id("market_id", market_id)?;
        let admin_id = self.validate_id("admin_id", admin_id)?;
        let evidence = self.validate_text("evidence", evidence)?;

        let _guard = self.lock_market(&market_id).await;
        let market = self.load_market(&market_id).await?;
        self.ensure_can_propose(&market).await?;

        let created_at = self.now();
        let proposal = ResolutionProposal {
            id: Uuid::new_v4().to_string(),
            market_id: market.id.clone(),
            proposed_outcome: outcome,
            proposer_admin_id: admin_id.clone(),
            signatures: BTreeSet::from([admin_id.clone()]),
            threshold: self.config.signature_threshold,
            status: ProposalStatus::PendingSignatures,
            resolution_hash: audit::resolution_hash(&market.id, outcome, &evidence, &created_at),
            evidence,
            created_at,
            resolved_at: None,
            tx_id: None,
        };
        self.store.insert_proposal(&proposal).await?;

        info!(
            market_id = %proposal.market_id,
            proposal_id = %proposal.id,
            outcome = outcome.as_u8(),
            admin_id = %admin_id,
            threshold = proposal.threshold,
            "🗳️ Multisig proposal created"
        );

        if !proposal.threshold_met() {
            return Ok(proposal);
        }
        match self.finalize_proposal(proposal.clone()).await {
            Ok(receipt) => Ok(receipt.proposal),
            Err(e) if e.is_retryable() => {
                warn!(proposal_id = %proposal.id, error = %e, "Finalize deferred");
                Ok(proposal)
            }
            Err(e) => Err(e),
        }
    }

    /// Adds `admin_id`'s signature and finalizes once the threshold is met.
    ///
    /// Signing twice is a no-op returning the current state, except that a
    /// proposal already at its threshold but still pending (its broadcast
    /// failed earlier) is finalized again. A broadcast failure keeps the
    /// signature, leaves the proposal pending and returns `Upstream`.
    pub async fn sign_resolution(
        &self,
        proposal_id: &str,
        admin_id: &str,
    ) -> GovernanceResult<SignReceipt> {
        let proposal_id = self.validate_id("proposal_id", proposal_id)?;
        let admin_id = self.validate_id("admin_id", admin_id)?;

        let market_id = self.get_proposal(&proposal_id).await?.market_id;
        let _guard = self.lock_market(&market_id).await;
        self.ensure_not_locked(&market_id).await?;

        let proposal = self.get_proposal(&proposal_id).await?;

        if proposal.has_signed(&admin_id) {
            if proposal.status == ProposalStatus::PendingSignatures && proposal.threshold_met() {
                debug!(proposal_id = %proposal.id, "Re-sign retries deferred finalize");
                return self.finalize_proposal(proposal).await;
            }
            return Ok(SignReceipt::current(proposal));
        }

        if proposal.is_terminal() {
            return Err(GovernanceError::Conflict(format!(
                "proposal {} is already resolved",
                proposal.id
            )));
        }

        let inserted = self.store.insert_signature(&proposal.id, &admin_id).await?;
        let proposal = self.get_proposal(&proposal_id).await?;
        if inserted {
            info!(
                market_id = %proposal.market_id,
                proposal_id = %proposal.id,
                admin_id = %admin_id,
                signatures = proposal.signature_count(),
                threshold = proposal.threshold,
                "✍️ Signature recorded"
            );
        }

        if proposal.status == ProposalStatus::PendingSignatures && proposal.threshold_met() {
            return self.finalize_proposal(proposal).await;
        }
        Ok(SignReceipt::current(proposal))
    }

    /// Finalizes a pending proposal that already meets its threshold. `None`
    /// when there is nothing to do.
    pub async fn retry_multisig_finalize(
        &self,
        proposal_id: &str,
    ) -> GovernanceResult<Option<SignReceipt>> {
        let market_id = self.get_proposal(proposal_id).await?.market_id;
        let _guard = self.lock_market(&market_id).await;
        self.ensure_not_locked(&market_id).await?;

        let proposal = self.get_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::PendingSignatures || !proposal.threshold_met() {
            return Ok(None);
        }
        self.finalize_proposal(proposal).await.map(Some)
    }

    /// Broadcast, then resolve proposal and market together. Caller holds the
    /// market lock.
    async fn finalize_proposal(&self, proposal: ResolutionProposal) -> GovernanceResult<SignReceipt> {
        let market = self.load_market(&proposal.market_id).await?;

        let payload = ResolutionPayload {
            market_id: proposal.market_id.clone(),
            app_id: market.app_id,
            outcome: proposal.proposed_outcome,
            path: ResolutionPath::Multisig,
            source_id: proposal.id.clone(),
            digest: proposal.resolution_hash.clone(),
        };
        let tx_id = match self.broadcaster.broadcast(&payload).await {
            Ok(tx_id) => tx_id,
            Err(e) => {
                warn!(
                    market_id = %proposal.market_id,
                    proposal_id = %proposal.id,
                    error = %e,
                    "⚠️ Multisig broadcast failed, proposal stays pending"
                );
                return Err(GovernanceError::Upstream(
                    e.context(format!("broadcast for proposal {} failed", proposal.id)),
                ));
            }
        };

        let mut resolved = proposal.clone();
        resolved.status = ProposalStatus::Resolved;
        resolved.resolved_at = Some(self.now());
        resolved.tx_id = Some(tx_id.clone());

        let written = self
            .store
            .update_proposal(
                &resolved,
                ProposalStatus::PendingSignatures,
                Some(MarketEffect::Resolve(proposal.proposed_outcome)),
            )
            .await?;
        if !written {
            warn!(
                proposal_id = %proposal.id,
                tx_id = %tx_id,
                "Proposal was resolved elsewhere after broadcast"
            );
            return Ok(SignReceipt::current(self.get_proposal(&proposal.id).await?));
        }

        info!(
            market_id = %resolved.market_id,
            proposal_id = %resolved.id,
            outcome = resolved.proposed_outcome.as_u8(),
            signatures = resolved.signature_count(),
            tx_id = %tx_id,
            "✅ Multisig proposal resolved"
        );
        Ok(SignReceipt::current(self.get_proposal(&resolved.id).await?))
    }
}
