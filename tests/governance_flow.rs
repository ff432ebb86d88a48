//! End-to-end governance flows against the in-memory store, a manual clock
//! and a broadcaster that records calls and can be told to fail.

use anyhow::{bail, Result};
use chrono::Duration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

use castalgo_governance::broadcaster::{Broadcaster, ResolutionPayload};
use castalgo_governance::clock::{Clock, ManualClock};
use castalgo_governance::governance::audit::verify_lock_hash;
use castalgo_governance::governance::FinalizeOutcome;
use castalgo_governance::models::{Market, MarketStatus, Outcome, ProposalStatus, UmaStatus};
use castalgo_governance::store::{MemoryStore, SqliteStore, Store};
use castalgo_governance::{ErrorKind, GovernanceConfig, GovernanceEngine, WindowScheduler};

const MARKET: &str = "m-lakers-celtics";

#[derive(Default)]
struct RecordingBroadcaster {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingBroadcaster {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(&self, payload: &ResolutionPayload) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("node unavailable");
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("tx-{}-{n}", payload.source_id))
    }
}

struct Harness {
    engine: GovernanceEngine,
    store: Arc<MemoryStore>,
    broadcaster: Arc<RecordingBroadcaster>,
    clock: ManualClock,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(GovernanceConfig::default()).await
    }

    async fn with_config(config: GovernanceConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_market(&Market::new(MARKET, "Will the Lakers win?").with_app_id(7))
            .await
            .unwrap();
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let engine = GovernanceEngine::new(
            config,
            store.clone(),
            broadcaster.clone(),
            Arc::new(clock.clone()),
        );
        Self {
            engine,
            store,
            broadcaster,
            clock,
        }
    }

    fn scheduler(&self) -> WindowScheduler {
        WindowScheduler::from_engine(self.engine.clone())
    }

    async fn market(&self) -> Market {
        self.store.get_market(MARKET).await.unwrap().unwrap()
    }
}

// ============================================================================
// Multisig
// ============================================================================

#[tokio::test]
async fn test_multisig_happy_path() {
    let h = Harness::new().await;

    let proposal = h
        .engine
        .propose_resolution(MARKET, 1, "final score 112-104", "admin-a")
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::PendingSignatures);
    assert!(proposal.has_signed("admin-a"));
    assert_eq!(proposal.signature_count(), 1);
    assert_eq!(h.engine.get_pending_proposals().await.unwrap().len(), 1);

    let receipt = h.engine.sign_resolution(&proposal.id, "admin-b").await.unwrap();
    assert!(receipt.resolved);
    assert!(receipt.tx_id.is_some());
    assert_eq!(receipt.proposal.status, ProposalStatus::Resolved);
    assert_eq!(receipt.proposal.signature_count(), 2);

    let market = h.market().await;
    assert_eq!(market.status, MarketStatus::Resolved);
    assert_eq!(market.outcome, Some(Outcome::Yes));
    assert_eq!(h.broadcaster.calls(), 1);
    assert!(h.engine.get_pending_proposals().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_repeat_signature_counts_once() {
    let config = GovernanceConfig {
        signature_threshold: 3,
        ..GovernanceConfig::default()
    };
    let h = Harness::with_config(config).await;
    let proposal = h
        .engine
        .propose_resolution(MARKET, 0, "box score", "admin-a")
        .await
        .unwrap();

    let first = h.engine.sign_resolution(&proposal.id, "admin-b").await.unwrap();
    let writes = h.store.write_count();
    let second = h.engine.sign_resolution(&proposal.id, "admin-b").await.unwrap();
    let proposer_again = h.engine.sign_resolution(&proposal.id, "admin-a").await.unwrap();

    assert_eq!(first.proposal.signature_count(), 2);
    assert_eq!(second.proposal.signature_count(), 2);
    assert_eq!(proposer_again.proposal.signature_count(), 2);
    assert!(!second.resolved);
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.broadcaster.calls(), 0);
}

#[tokio::test]
async fn test_multisig_broadcast_failure_keeps_signature_and_retries() {
    let h = Harness::new().await;
    let proposal = h
        .engine
        .propose_resolution(MARKET, 1, "final score", "admin-a")
        .await
        .unwrap();

    h.broadcaster.set_failing(true);
    let err = h
        .engine
        .sign_resolution(&proposal.id, "admin-b")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert!(err.is_retryable());

    let stored = h.engine.get_proposal(&proposal.id).await.unwrap();
    assert_eq!(stored.status, ProposalStatus::PendingSignatures);
    assert_eq!(stored.signature_count(), 2);
    assert_eq!(h.market().await.status, MarketStatus::Active);

    // Still down: the sweep counts a failure and changes nothing.
    let report = h.scheduler().tick().await;
    assert_eq!(report.failures, 1);
    assert_eq!(report.multisig_resolved, 0);

    h.broadcaster.set_failing(false);
    let report = h.scheduler().tick().await;
    assert_eq!(report.multisig_resolved, 1);
    assert_eq!(report.failures, 0);

    let market = h.market().await;
    assert_eq!(market.status, MarketStatus::Resolved);
    assert_eq!(market.outcome, Some(Outcome::Yes));
    assert_eq!(h.broadcaster.calls(), 1);
}

#[tokio::test]
async fn test_resign_after_failed_broadcast_finalizes() {
    let h = Harness::new().await;
    let proposal = h
        .engine
        .propose_resolution(MARKET, 0, "final score", "admin-a")
        .await
        .unwrap();

    h.broadcaster.set_failing(true);
    assert!(h.engine.sign_resolution(&proposal.id, "admin-b").await.is_err());

    h.broadcaster.set_failing(false);
    let receipt = h.engine.sign_resolution(&proposal.id, "admin-b").await.unwrap();
    assert!(receipt.resolved);
    assert_eq!(receipt.proposal.signature_count(), 2);

    // A late signer gets a conflict, not a second broadcast.
    let err = h
        .engine
        .sign_resolution(&proposal.id, "admin-c")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.broadcaster.calls(), 1);
}

#[tokio::test]
async fn test_threshold_of_one_resolves_on_proposal() {
    let config = GovernanceConfig {
        signature_threshold: 1,
        ..GovernanceConfig::default()
    };
    let h = Harness::with_config(config).await;

    let proposal = h
        .engine
        .propose_resolution(MARKET, 1, "final score", "admin-a")
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::Resolved);
    assert_eq!(h.market().await.outcome, Some(Outcome::Yes));
}

// ============================================================================
// Optimistic path
// ============================================================================

#[tokio::test]
async fn test_undisputed_resolution_expires_and_locks() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 0, "official league feed", "admin-a")
        .await
        .unwrap();
    assert_eq!(resolution.status, UmaStatus::Proposed);
    assert_eq!(
        resolution.dispute_window_ends,
        resolution.proposed_at + Duration::minutes(10)
    );

    h.clock.advance_by(Duration::minutes(11));
    let report = h.scheduler().tick().await;
    assert_eq!(report.expired, 1);

    let locked = h.engine.get_uma_resolution_by_id(&resolution.id).await.unwrap();
    assert_eq!(locked.status, UmaStatus::ExpiredNoDispute);
    assert_eq!(locked.final_outcome(), Some(Outcome::No));
    assert!(locked.lock_hash().is_some());
    assert!(verify_lock_hash(&locked));

    let market = h.market().await;
    assert_eq!(market.status, MarketStatus::Resolved);
    assert_eq!(market.outcome, Some(Outcome::No));
    assert!(!market.dispute_flag);
    assert!(h.engine.is_market_locked(MARKET).await.unwrap());
}

#[tokio::test]
async fn test_disputed_resolution_majority_vote() {
    let h = Harness::new().await;
    let t0 = h.clock.now();
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();

    h.clock.advance_by(Duration::minutes(2));
    let disputed = h
        .engine
        .raise_dispute(MARKET, "user-42", "overtime not counted")
        .await
        .unwrap();
    assert_eq!(disputed.status, UmaStatus::UmaVoting);
    assert_eq!(disputed.voting_ends(), Some(t0 + Duration::minutes(12)));
    assert!(h.market().await.dispute_flag);

    let first = h.engine.cast_uma_vote(&resolution.id, "admin-a", 1).await.unwrap();
    assert!(!first.finalized);
    let second = h.engine.cast_uma_vote(&resolution.id, "admin-b", 1).await.unwrap();
    assert!(!second.finalized);
    let third = h.engine.cast_uma_vote(&resolution.id, "admin-c", 0).await.unwrap();

    assert!(third.finalized);
    assert_eq!((third.tally.yes, third.tally.no), (2, 1));
    assert_eq!(third.resolution.status, UmaStatus::UmaLocked);
    assert_eq!(third.resolution.final_outcome(), Some(Outcome::Yes));
    assert!(verify_lock_hash(&third.resolution));

    let market = h.market().await;
    assert_eq!(market.status, MarketStatus::Resolved);
    assert_eq!(market.outcome, Some(Outcome::Yes));
    assert_eq!(h.broadcaster.calls(), 1);
    assert_eq!(h.engine.get_votes(&resolution.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_tie_at_expiry_keeps_proposed_outcome() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 0, "official league feed", "admin-a")
        .await
        .unwrap();
    h.engine
        .raise_dispute(MARKET, "user-42", "wrong team")
        .await
        .unwrap();

    h.engine.cast_uma_vote(&resolution.id, "admin-a", 1).await.unwrap();
    h.engine.cast_uma_vote(&resolution.id, "admin-b", 0).await.unwrap();

    h.clock.advance_by(Duration::minutes(9));
    assert!(h.scheduler().tick().await.is_quiet());

    h.clock.advance_by(Duration::minutes(2));
    let report = h.scheduler().tick().await;
    assert_eq!(report.locked, 1);

    let locked = h.engine.get_uma_resolution_by_id(&resolution.id).await.unwrap();
    assert_eq!(locked.status, UmaStatus::UmaLocked);
    assert_eq!(locked.final_outcome(), Some(Outcome::No));
}

#[tokio::test]
async fn test_two_admin_committee_tie_finalizes_early() {
    let config = GovernanceConfig {
        committee_size: 2,
        ..GovernanceConfig::default()
    };
    let h = Harness::with_config(config).await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    h.engine
        .raise_dispute(MARKET, "user-42", "wrong team")
        .await
        .unwrap();

    h.engine.cast_uma_vote(&resolution.id, "admin-a", 1).await.unwrap();
    let receipt = h.engine.cast_uma_vote(&resolution.id, "admin-b", 0).await.unwrap();

    assert!(receipt.finalized);
    assert!(receipt.tally.tie);
    assert_eq!(receipt.resolution.final_outcome(), Some(Outcome::Yes));
}

// ============================================================================
// Lock guard and idempotence
// ============================================================================

async fn locked_market() -> (Harness, String) {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    h.clock.advance_by(Duration::minutes(11));
    assert_eq!(h.scheduler().tick().await.expired, 1);
    (h, resolution.id)
}

#[tokio::test]
async fn test_locked_market_rejects_every_mutation() {
    let (h, resolution_id) = locked_market().await;
    let before = h.engine.get_uma_resolution_by_id(&resolution_id).await.unwrap();
    let writes = h.store.write_count();

    let err = h
        .engine
        .propose_resolution(MARKET, 0, "new evidence", "admin-b")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = h
        .engine
        .propose_uma_resolution(MARKET, 0, "new evidence", "admin-b")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = h
        .engine
        .raise_dispute(MARKET, "user-42", "too late")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = h
        .engine
        .cast_uma_vote(&resolution_id, "admin-b", 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    assert_eq!(h.store.write_count(), writes);
    let after = h.engine.get_uma_resolution_by_id(&resolution_id).await.unwrap();
    assert_eq!(after.lock, before.lock);
}

#[tokio::test]
async fn test_finalize_twice_writes_and_broadcasts_once() {
    let (h, resolution_id) = locked_market().await;
    let writes = h.store.write_count();
    let calls = h.broadcaster.calls();
    let before = h.engine.get_uma_resolution_by_id(&resolution_id).await.unwrap();

    let outcome = h.engine.finalize_uma_resolution(&resolution_id).await.unwrap();
    assert!(matches!(outcome, FinalizeOutcome::AlreadyFinal(_)));
    assert!(h.scheduler().tick().await.is_quiet());

    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.broadcaster.calls(), calls);
    let after = h.engine.get_uma_resolution_by_id(&resolution_id).await.unwrap();
    assert_eq!(after.lock_hash(), before.lock_hash());
    assert_eq!(after.final_outcome(), before.final_outcome());
}

#[tokio::test]
async fn test_finalize_before_window_is_not_due() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();

    h.clock.advance_by(Duration::minutes(5));
    let outcome = h.engine.finalize_uma_resolution(&resolution.id).await.unwrap();
    assert!(matches!(outcome, FinalizeOutcome::NotDue(_)));
    assert_eq!(h.broadcaster.calls(), 0);
}

// ============================================================================
// Windows and conflicts
// ============================================================================

#[tokio::test]
async fn test_dispute_after_window_is_expired() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();

    h.clock.advance_by(Duration::minutes(10));
    let err = h
        .engine
        .raise_dispute(MARKET, "user-42", "late")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);

    let stored = h.engine.get_uma_resolution_by_id(&resolution.id).await.unwrap();
    assert_eq!(stored.status, UmaStatus::Proposed);
    assert!(!h.market().await.dispute_flag);
}

#[tokio::test]
async fn test_dispute_and_vote_state_checks() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();

    let err = h
        .engine
        .cast_uma_vote(&resolution.id, "admin-a", 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap();
    let err = h
        .engine
        .raise_dispute(MARKET, "user-43", "also wrong")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.engine.cast_uma_vote(&resolution.id, "admin-a", 1).await.unwrap();
    let err = h
        .engine
        .cast_uma_vote(&resolution.id, "admin-a", 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.engine.get_votes(&resolution.id).await.unwrap().len(), 1);

    h.clock.advance_by(Duration::minutes(10));
    let err = h
        .engine
        .cast_uma_vote(&resolution.id, "admin-b", 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
}

#[tokio::test]
async fn test_one_active_resolution_per_market() {
    let h = Harness::new().await;
    h.engine
        .propose_resolution(MARKET, 1, "final score", "admin-a")
        .await
        .unwrap();

    let err = h
        .engine
        .propose_uma_resolution(MARKET, 1, "final score", "admin-b")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = h
        .engine
        .propose_resolution(MARKET, 0, "final score", "admin-b")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_input_validation_and_lookup_errors() {
    let h = Harness::new().await;

    let err = h
        .engine
        .propose_resolution(MARKET, 2, "final score", "admin-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h
        .engine
        .propose_uma_resolution(MARKET, 1, "   ", "admin-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let long = "x".repeat(GovernanceConfig::default().max_text_len + 1);
    let err = h
        .engine
        .propose_uma_resolution(MARKET, 1, &long, "admin-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h
        .engine
        .propose_resolution("m-unknown", 1, "final score", "admin-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h
        .engine
        .sign_resolution("p-unknown", "admin-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h
        .engine
        .raise_dispute(MARKET, "user-42", "nothing to dispute")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_resolved_market_rejects_proposals() {
    let h = Harness::new().await;
    h.store
        .update_market_resolution(MARKET, MarketStatus::Closed, None)
        .await
        .unwrap();

    let err = h
        .engine
        .propose_uma_resolution(MARKET, 1, "final score", "admin-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_time_remaining_accessors() {
    let h = Harness::new().await;
    assert!(h.engine.get_dispute_time_remaining(MARKET).await.unwrap().is_none());

    h.engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    h.clock.advance_by(Duration::minutes(4));

    let remaining = h.engine.get_dispute_time_remaining(MARKET).await.unwrap();
    assert_eq!(remaining.map(|d| d.as_secs()), Some(6 * 60));
    assert!(h.engine.get_voting_time_remaining(MARKET).await.unwrap().is_none());

    h.engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap();
    assert!(h.engine.get_dispute_time_remaining(MARKET).await.unwrap().is_none());
    let remaining = h.engine.get_voting_time_remaining(MARKET).await.unwrap();
    assert_eq!(remaining.map(|d| d.as_secs()), Some(10 * 60));
}

// ============================================================================
// Upstream failure and races
// ============================================================================

#[tokio::test]
async fn test_failed_early_finalize_keeps_vote_and_scheduler_retries() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    h.engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap();
    h.engine.cast_uma_vote(&resolution.id, "admin-a", 0).await.unwrap();
    h.engine.cast_uma_vote(&resolution.id, "admin-b", 0).await.unwrap();

    h.broadcaster.set_failing(true);
    let receipt = h.engine.cast_uma_vote(&resolution.id, "admin-c", 1).await.unwrap();
    assert!(!receipt.finalized);
    assert_eq!(receipt.resolution.status, UmaStatus::UmaVoting);
    assert!(receipt.resolution.lock.is_none());
    assert_eq!(h.engine.get_votes(&resolution.id).await.unwrap().len(), 3);
    assert_eq!(h.market().await.status, MarketStatus::Active);

    h.broadcaster.set_failing(false);
    let report = h.scheduler().tick().await;
    assert_eq!(report.locked, 1);

    let locked = h.engine.get_uma_resolution_by_id(&resolution.id).await.unwrap();
    assert_eq!(locked.status, UmaStatus::UmaLocked);
    assert_eq!(locked.final_outcome(), Some(Outcome::No));
}

#[tokio::test]
async fn test_votes_after_complete_committee_are_rejected() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    h.engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap();
    h.engine.cast_uma_vote(&resolution.id, "admin-a", 1).await.unwrap();
    h.engine.cast_uma_vote(&resolution.id, "admin-b", 1).await.unwrap();

    h.broadcaster.set_failing(true);
    let receipt = h.engine.cast_uma_vote(&resolution.id, "admin-c", 0).await.unwrap();
    assert!(!receipt.finalized);

    // The committee is full; an extra ballot cannot tip a 2-1 verdict.
    for admin in ["admin-d", "admin-e"] {
        let err = h.engine.cast_uma_vote(&resolution.id, admin, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
    assert_eq!(h.engine.get_votes(&resolution.id).await.unwrap().len(), 3);

    h.broadcaster.set_failing(false);
    let report = h.scheduler().tick().await;
    assert_eq!(report.locked, 1);

    let locked = h.engine.get_uma_resolution_by_id(&resolution.id).await.unwrap();
    assert_eq!(locked.status, UmaStatus::UmaLocked);
    assert_eq!(locked.final_outcome(), Some(Outcome::Yes));
    assert_eq!(h.market().await.outcome, Some(Outcome::Yes));
}

#[tokio::test]
async fn test_unrepresentable_window_end_is_a_validation_error() {
    let config = GovernanceConfig {
        dispute_window: std::time::Duration::from_secs(9_000_000_000_000),
        ..GovernanceConfig::default()
    };
    let h = Harness::with_config(config).await;
    let err = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.engine.active_resolution(MARKET).await.unwrap().is_none());

    let config = GovernanceConfig {
        voting_window: std::time::Duration::from_secs(9_000_000_000_000),
        ..GovernanceConfig::default()
    };
    let h = Harness::with_config(config).await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    let err = h
        .engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let stored = h.engine.get_uma_resolution_by_id(&resolution.id).await.unwrap();
    assert_eq!(stored.status, UmaStatus::Proposed);
    assert!(stored.dispute.is_none());
    assert_eq!(h.market().await.status, MarketStatus::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_votes_only_one_succeeds() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    h.engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = h.engine.clone();
            let id = resolution.id.clone();
            tokio::spawn(async move { engine.cast_uma_vote(&id, "admin-a", 1).await })
        })
        .collect();

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(h.engine.get_votes(&resolution.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_final_vote_racing_scheduler_broadcasts_once() {
    let h = Harness::new().await;
    let resolution = h
        .engine
        .propose_uma_resolution(MARKET, 1, "official league feed", "admin-a")
        .await
        .unwrap();
    h.engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap();
    h.engine.cast_uma_vote(&resolution.id, "admin-a", 1).await.unwrap();
    h.engine.cast_uma_vote(&resolution.id, "admin-b", 1).await.unwrap();

    let engine = h.engine.clone();
    let id = resolution.id.clone();
    let vote = tokio::spawn(async move { engine.cast_uma_vote(&id, "admin-c", 0).await });
    let scheduler = h.scheduler();
    let sweep = tokio::spawn(async move { scheduler.tick().await });

    vote.await.unwrap().unwrap();
    let report = sweep.await.unwrap();
    assert_eq!(report.failures, 0);

    // A straggling finalize from either side is a no-op.
    let outcome = h.engine.finalize_uma_resolution(&resolution.id).await.unwrap();
    assert!(matches!(outcome, FinalizeOutcome::AlreadyFinal(_)));

    assert_eq!(h.broadcaster.calls(), 1);
    let locked = h.engine.get_uma_resolution_by_id(&resolution.id).await.unwrap();
    assert_eq!(locked.status, UmaStatus::UmaLocked);
    assert_eq!(locked.final_outcome(), Some(Outcome::Yes));
}

// ============================================================================
// SQLite-backed flow
// ============================================================================

#[tokio::test]
async fn test_disputed_flow_on_sqlite_store() {
    let tmp = NamedTempFile::new().unwrap();
    let db_path = tmp.path().to_str().unwrap().to_string();
    let store: Arc<SqliteStore> = Arc::new(SqliteStore::new(&db_path).unwrap());
    store
        .upsert_market(&Market::new(MARKET, "Will the Lakers win?"))
        .await
        .unwrap();

    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let clock = ManualClock::from_unix_secs(1_700_000_000);
    let engine = GovernanceEngine::new(
        GovernanceConfig::default(),
        store.clone(),
        broadcaster.clone(),
        Arc::new(clock.clone()),
    );

    let resolution = engine
        .propose_uma_resolution(MARKET, 0, "official league feed", "admin-a")
        .await
        .unwrap();
    clock.advance_by(Duration::minutes(3));
    engine
        .raise_dispute(MARKET, "user-42", "wrong score")
        .await
        .unwrap();
    for (admin, vote) in [("admin-a", 1), ("admin-b", 1), ("admin-c", 1)] {
        engine.cast_uma_vote(&resolution.id, admin, vote).await.unwrap();
    }

    // Reopen the database: the locked state must come back from disk intact.
    drop(engine);
    let reopened = SqliteStore::new(&db_path).unwrap();
    let locked = reopened
        .get_uma_resolution(&resolution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(locked.status, UmaStatus::UmaLocked);
    assert_eq!(locked.final_outcome(), Some(Outcome::Yes));
    assert!(verify_lock_hash(&locked));

    let market = reopened.get_market(MARKET).await.unwrap().unwrap();
    assert_eq!(market.status, MarketStatus::Resolved);
    assert_eq!(market.outcome, Some(Outcome::Yes));
    assert!(market.dispute_flag);
    assert_eq!(broadcaster.calls(), 1);
}
