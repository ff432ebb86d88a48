//! In-memory Store
//!
//! Same contract as the SQLite store, held behind a single parking_lot mutex.
//! Used by tests and dry runs.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{MarketEffect, Store};
use crate::models::{
    Market, MarketStatus, Outcome, ProposalStatus, ResolutionProposal, UmaResolution, UmaStatus,
    Vote,
};

#[derive(Default)]
struct Tables {
    markets: HashMap<String, Market>,
    proposals: Vec<ResolutionProposal>,
    uma: Vec<UmaResolution>,
    votes: Vec<Vote>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful mutating calls so far. Lets tests assert that an
    /// operation wrote nothing.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn apply_effect(tables: &mut Tables, market_id: &str, effect: Option<MarketEffect>) -> Result<()> {
    let Some(effect) = effect else {
        return Ok(());
    };
    let Some(market) = tables.markets.get_mut(market_id) else {
        bail!("market {market_id} not found");
    };
    match effect {
        MarketEffect::FlagDisputed => market.dispute_flag = true,
        MarketEffect::Resolve(outcome) => {
            market.status = MarketStatus::Resolved;
            market.outcome = Some(outcome);
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        Ok(self.tables.lock().markets.get(market_id).cloned())
    }

    async fn upsert_market(&self, market: &Market) -> Result<()> {
        self.tables
            .lock()
            .markets
            .insert(market.id.clone(), market.clone());
        self.record_write();
        Ok(())
    }

    async fn update_market_resolution(
        &self,
        market_id: &str,
        status: MarketStatus,
        outcome: Option<Outcome>,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let Some(market) = tables.markets.get_mut(market_id) else {
            bail!("market {market_id} not found");
        };
        market.status = status;
        market.outcome = outcome;
        drop(tables);
        self.record_write();
        Ok(())
    }

    async fn insert_proposal(&self, proposal: &ResolutionProposal) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.proposals.iter().any(|p| p.id == proposal.id) {
            bail!("proposal {} already exists", proposal.id);
        }
        tables.proposals.push(proposal.clone());
        drop(tables);
        self.record_write();
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Option<ResolutionProposal>> {
        Ok(self
            .tables
            .lock()
            .proposals
            .iter()
            .find(|p| p.id == proposal_id)
            .cloned())
    }

    async fn insert_signature(&self, proposal_id: &str, admin_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Some(proposal) = tables.proposals.iter_mut().find(|p| p.id == proposal_id) else {
            bail!("proposal {proposal_id} not found");
        };
        let inserted = proposal.signatures.insert(admin_id.to_string());
        drop(tables);
        if inserted {
            self.record_write();
        }
        Ok(inserted)
    }

    async fn update_proposal(
        &self,
        proposal: &ResolutionProposal,
        expected: ProposalStatus,
        effect: Option<MarketEffect>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        let current = tables
            .proposals
            .iter()
            .find(|p| p.id == proposal.id)
            .map(|p| p.status);
        if current != Some(expected) {
            return Ok(false);
        }
        apply_effect(&mut tables, &proposal.market_id, effect)?;
        let Some(stored) = tables.proposals.iter_mut().find(|p| p.id == proposal.id) else {
            return Ok(false);
        };
        // Signatures live in their own "table"; keep whatever is stored.
        let signatures = std::mem::take(&mut stored.signatures);
        *stored = proposal.clone();
        stored.signatures = signatures;
        drop(tables);
        self.record_write();
        Ok(true)
    }

    async fn proposals_for_market(&self, market_id: &str) -> Result<Vec<ResolutionProposal>> {
        Ok(self
            .tables
            .lock()
            .proposals
            .iter()
            .filter(|p| p.market_id == market_id)
            .cloned()
            .collect())
    }

    async fn proposals_by_status(
        &self,
        status: ProposalStatus,
    ) -> Result<Vec<ResolutionProposal>> {
        Ok(self
            .tables
            .lock()
            .proposals
            .iter()
            .filter(|p| p.status == status)
            .cloned()
            .collect())
    }

    async fn insert_uma_resolution(&self, resolution: &UmaResolution) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.uma.iter().any(|r| r.id == resolution.id) {
            bail!("resolution {} already exists", resolution.id);
        }
        tables.uma.push(resolution.clone());
        drop(tables);
        self.record_write();
        Ok(())
    }

    async fn get_uma_resolution(&self, resolution_id: &str) -> Result<Option<UmaResolution>> {
        Ok(self
            .tables
            .lock()
            .uma
            .iter()
            .find(|r| r.id == resolution_id)
            .cloned())
    }

    async fn uma_resolutions_for_market(&self, market_id: &str) -> Result<Vec<UmaResolution>> {
        Ok(self
            .tables
            .lock()
            .uma
            .iter()
            .filter(|r| r.market_id == market_id)
            .cloned()
            .collect())
    }

    async fn uma_resolutions_by_status(&self, status: UmaStatus) -> Result<Vec<UmaResolution>> {
        Ok(self
            .tables
            .lock()
            .uma
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn update_uma_resolution(
        &self,
        resolution: &UmaResolution,
        expected: UmaStatus,
        effect: Option<MarketEffect>,
    ) -> Result<bool> {
        if !expected.can_advance_to(resolution.status) {
            bail!(
                "illegal transition {} -> {} for resolution {}",
                expected.as_str(),
                resolution.status.as_str(),
                resolution.id
            );
        }
        let mut tables = self.tables.lock();
        let current = tables
            .uma
            .iter()
            .find(|r| r.id == resolution.id)
            .map(|r| r.status);
        if current != Some(expected) {
            return Ok(false);
        }
        apply_effect(&mut tables, &resolution.market_id, effect)?;
        let Some(stored) = tables.uma.iter_mut().find(|r| r.id == resolution.id) else {
            return Ok(false);
        };
        // Append-only: status advances, dispute and lock are written at most once.
        stored.status = resolution.status;
        if stored.dispute.is_none() {
            stored.dispute = resolution.dispute.clone();
        }
        if stored.lock.is_none() {
            stored.lock = resolution.lock.clone();
        }
        drop(tables);
        self.record_write();
        Ok(true)
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<bool> {
        let mut tables = self.tables.lock();
        let duplicate = tables
            .votes
            .iter()
            .any(|v| v.resolution_id == vote.resolution_id && v.admin_id == vote.admin_id);
        if duplicate {
            return Ok(false);
        }
        tables.votes.push(vote.clone());
        drop(tables);
        self.record_write();
        Ok(true)
    }

    async fn get_votes_by_resolution(&self, resolution_id: &str) -> Result<Vec<Vote>> {
        Ok(self
            .tables
            .lock()
            .votes
            .iter()
            .filter(|v| v.resolution_id == resolution_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DisputeInfo, LockInfo};
    use chrono::Utc;

    fn sample_resolution(id: &str) -> UmaResolution {
        let now = Utc::now();
        UmaResolution {
            id: id.to_string(),
            market_id: "m-1".to_string(),
            proposed_outcome: Outcome::Yes,
            proposed_by: "admin-a".to_string(),
            evidence: "final score".to_string(),
            status: UmaStatus::Proposed,
            proposed_at: now,
            dispute_window_ends: now,
            committee_size: 3,
            dispute: None,
            lock: None,
        }
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = MemoryStore::new();
        let mut resolution = sample_resolution("r-1");
        store.insert_uma_resolution(&resolution).await.unwrap();

        resolution.status = UmaStatus::ExpiredNoDispute;
        assert!(store
            .update_uma_resolution(&resolution, UmaStatus::Proposed, None)
            .await
            .unwrap());

        // Second writer expected the old status and loses.
        resolution.status = UmaStatus::UmaVoting;
        assert!(!store
            .update_uma_resolution(&resolution, UmaStatus::Proposed, None)
            .await
            .unwrap());

        let stored = store.get_uma_resolution("r-1").await.unwrap().unwrap();
        assert_eq!(stored.status, UmaStatus::ExpiredNoDispute);
    }

    #[tokio::test]
    async fn test_written_fields_are_never_unset() {
        let store = MemoryStore::new();
        let mut resolution = sample_resolution("r-1");
        store.insert_uma_resolution(&resolution).await.unwrap();

        resolution.status = UmaStatus::UmaVoting;
        resolution.dispute = Some(DisputeInfo {
            disputed_by: "user-9".to_string(),
            reason: "wrong source".to_string(),
            disputed_at: resolution.proposed_at,
            voting_ends: resolution.proposed_at,
        });
        assert!(store
            .update_uma_resolution(&resolution, UmaStatus::Proposed, None)
            .await
            .unwrap());

        // A stale writer that dropped the dispute info cannot erase it.
        let mut stale = resolution.clone();
        stale.dispute = None;
        stale.status = UmaStatus::UmaLocked;
        stale.lock = Some(LockInfo {
            final_outcome: Outcome::No,
            lock_hash: "deadbeef".to_string(),
            locked_at: resolution.proposed_at,
            tx_id: None,
        });
        assert!(store
            .update_uma_resolution(&stale, UmaStatus::UmaVoting, None)
            .await
            .unwrap());

        let stored = store.get_uma_resolution("r-1").await.unwrap().unwrap();
        assert_eq!(stored.status, UmaStatus::UmaLocked);
        assert_eq!(stored.dispute, resolution.dispute);
        assert_eq!(stored.lock_hash(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn test_backward_transition_is_rejected() {
        let store = MemoryStore::new();
        let mut resolution = sample_resolution("r-1");
        resolution.status = UmaStatus::UmaVoting;
        store.insert_uma_resolution(&resolution).await.unwrap();

        resolution.status = UmaStatus::Proposed;
        assert!(store
            .update_uma_resolution(&resolution, UmaStatus::UmaVoting, None)
            .await
            .is_err());

        resolution.status = UmaStatus::ExpiredNoDispute;
        assert!(store
            .update_uma_resolution(&resolution, UmaStatus::UmaVoting, None)
            .await
            .is_err());

        let stored = store.get_uma_resolution("r-1").await.unwrap().unwrap();
        assert_eq!(stored.status, UmaStatus::UmaVoting);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_vote_is_reported_not_overwritten() {
        let store = MemoryStore::new();
        let vote = Vote {
            id: "v-1".to_string(),
            resolution_id: "r-1".to_string(),
            admin_id: "admin-a".to_string(),
            vote: Outcome::Yes,
            voted_at: Utc::now(),
        };
        assert!(store.insert_vote(&vote).await.unwrap());

        let flipped = Vote {
            id: "v-2".to_string(),
            vote: Outcome::No,
            ..vote.clone()
        };
        assert!(!store.insert_vote(&flipped).await.unwrap());

        let votes = store.get_votes_by_resolution("r-1").await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].vote, Outcome::Yes);
    }
}
