//! Governance Storage
//!
//! The engine reads and writes markets, proposals, optimistic resolutions and
//! votes only through [`Store`]. Every `update_*` is a compare-and-swap on the
//! entity's status, and every `insert_*` that can collide reports the
//! collision instead of overwriting.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{
    Market, MarketStatus, Outcome, ProposalStatus, ResolutionProposal, UmaResolution, UmaStatus,
    Vote,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // --- markets -----------------------------------------------------------

    async fn get_market(&self, market_id: &str) -> Result<Option<Market>>;

    /// Inserts or replaces a market row. Used by the surrounding system, never
    /// by the engine's resolution paths.
    async fn upsert_market(&self, market: &Market) -> Result<()>;

    async fn update_market_resolution(
        &self,
        market_id: &str,
        status: MarketStatus,
        outcome: Option<Outcome>,
    ) -> Result<()>;

    // --- multisig proposals ------------------------------------------------

    async fn insert_proposal(&self, proposal: &ResolutionProposal) -> Result<()>;

    async fn get_proposal(&self, proposal_id: &str) -> Result<Option<ResolutionProposal>>;

    /// Returns `false` when the admin had already signed.
    async fn insert_signature(&self, proposal_id: &str, admin_id: &str) -> Result<bool>;

    /// Writes `proposal`'s mutable fields only if the stored status still equals
    /// `expected`, applying `effect` to its market in the same transaction.
    /// Returns whether the write happened.
    async fn update_proposal(
        &self,
        proposal: &ResolutionProposal,
        expected: ProposalStatus,
        effect: Option<MarketEffect>,
    ) -> Result<bool>;

    async fn proposals_for_market(&self, market_id: &str) -> Result<Vec<ResolutionProposal>>;

    async fn proposals_by_status(&self, status: ProposalStatus)
        -> Result<Vec<ResolutionProposal>>;

    // --- optimistic resolutions ---------------------------------------------

    async fn insert_uma_resolution(&self, resolution: &UmaResolution) -> Result<()>;

    async fn get_uma_resolution(&self, resolution_id: &str) -> Result<Option<UmaResolution>>;

    /// Oldest first.
    async fn uma_resolutions_for_market(&self, market_id: &str) -> Result<Vec<UmaResolution>>;

    async fn uma_resolutions_by_status(&self, status: UmaStatus) -> Result<Vec<UmaResolution>>;

    /// Compare-and-swap on status, as for proposals.
    async fn update_uma_resolution(
        &self,
        resolution: &UmaResolution,
        expected: UmaStatus,
        effect: Option<MarketEffect>,
    ) -> Result<bool>;

    // --- votes ---------------------------------------------------------------

    /// Returns `false` when `(resolution_id, admin_id)` already has a vote.
    async fn insert_vote(&self, vote: &Vote) -> Result<bool>;

    /// In the order they were cast.
    async fn get_votes_by_resolution(&self, resolution_id: &str) -> Result<Vec<Vote>>;
}

/// Market write committed together with a resolution's status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketEffect {
    /// `dispute_flag = true`
    FlagDisputed,
    /// `status = RESOLVED`, `outcome = Some(_)`
    Resolve(Outcome),
}

/// RFC 3339 with nanoseconds and a `Z` suffix: exact round-trips and
/// lexicographic order equal to chronological order.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
