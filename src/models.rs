//! Governance Models
//!
//! Markets (owned by the surrounding system), multisig proposals, optimistic
//! resolutions and admin votes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Binary market outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Outcome {
    No = 0,
    Yes = 1,
}

impl Outcome {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<Outcome> for u8 {
    fn from(outcome: Outcome) -> Self {
        outcome.as_u8()
    }
}

impl TryFrom<u8> for Outcome {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Outcome::No),
            1 => Ok(Outcome::Yes),
            other => Err(format!("outcome must be 0 or 1, got {other}")),
        }
    }
}

impl TryFrom<i64> for Outcome {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| format!("outcome must be 0 or 1, got {value}"))
            .and_then(Outcome::try_from)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

// ============================================================================
// Market
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "RESOLVED")]
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Closed => "CLOSED",
            MarketStatus::Resolved => "RESOLVED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MarketStatus::Active),
            "CLOSED" => Some(MarketStatus::Closed),
            "RESOLVED" => Some(MarketStatus::Resolved),
            _ => None,
        }
    }
}

/// Market row as seen by the engine. Lifecycle is owned elsewhere; the engine
/// only writes `status`, `outcome` and `dispute_flag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub status: MarketStatus,
    pub outcome: Option<Outcome>,
    pub dispute_flag: bool,
    /// On-chain application the final outcome is broadcast to.
    pub app_id: Option<u64>,
}

impl Market {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            status: MarketStatus::Active,
            outcome: None,
            dispute_flag: false,
            app_id: None,
        }
    }

    pub fn with_app_id(mut self, app_id: u64) -> Self {
        self.app_id = Some(app_id);
        self
    }
}

// ============================================================================
// Multisig proposal
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    #[serde(rename = "PENDING_SIGNATURES")]
    PendingSignatures,
    #[serde(rename = "RESOLVED")]
    Resolved,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::PendingSignatures => "PENDING_SIGNATURES",
            ProposalStatus::Resolved => "RESOLVED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING_SIGNATURES" => Some(ProposalStatus::PendingSignatures),
            "RESOLVED" => Some(ProposalStatus::Resolved),
            _ => None,
        }
    }
}

/// N-of-M resolution proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionProposal {
    pub id: String,
    pub market_id: String,
    pub proposed_outcome: Outcome,
    pub proposer_admin_id: String,
    /// Distinct admin ids; ordering carries no meaning.
    pub signatures: BTreeSet<String>,
    /// Signature threshold captured when the proposal was created.
    pub threshold: usize,
    pub status: ProposalStatus,
    pub evidence: String,
    pub resolution_hash: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub tx_id: Option<String>,
}

impl ResolutionProposal {
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn has_signed(&self, admin_id: &str) -> bool {
        self.signatures.contains(admin_id)
    }

    pub fn threshold_met(&self) -> bool {
        self.signatures.len() >= self.threshold
    }

    pub fn is_terminal(&self) -> bool {
        self.status == ProposalStatus::Resolved
    }
}

// ============================================================================
// Optimistic (UMA-style) resolution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UmaStatus {
    #[serde(rename = "PROPOSED")]
    Proposed,
    #[serde(rename = "UMA_VOTING")]
    UmaVoting,
    #[serde(rename = "UMA_LOCKED")]
    UmaLocked,
    #[serde(rename = "EXPIRED_NO_DISPUTE")]
    ExpiredNoDispute,
}

impl UmaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UmaStatus::Proposed => "PROPOSED",
            UmaStatus::UmaVoting => "UMA_VOTING",
            UmaStatus::UmaLocked => "UMA_LOCKED",
            UmaStatus::ExpiredNoDispute => "EXPIRED_NO_DISPUTE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PROPOSED" => Some(UmaStatus::Proposed),
            "UMA_VOTING" => Some(UmaStatus::UmaVoting),
            "UMA_LOCKED" => Some(UmaStatus::UmaLocked),
            "EXPIRED_NO_DISPUTE" => Some(UmaStatus::ExpiredNoDispute),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UmaStatus::UmaLocked | UmaStatus::ExpiredNoDispute)
    }

    /// Forward-only transition table.
    pub fn can_advance_to(&self, next: UmaStatus) -> bool {
        matches!(
            (self, next),
            (UmaStatus::Proposed, UmaStatus::UmaVoting)
                | (UmaStatus::Proposed, UmaStatus::ExpiredNoDispute)
                | (UmaStatus::UmaVoting, UmaStatus::UmaLocked)
        )
    }
}

/// Written once by `raise_dispute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeInfo {
    pub disputed_by: String,
    pub reason: String,
    pub disputed_at: DateTime<Utc>,
    pub voting_ends: DateTime<Utc>,
}

/// Written once by finalize; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub final_outcome: Outcome,
    pub lock_hash: String,
    pub locked_at: DateTime<Utc>,
    pub tx_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmaResolution {
    pub id: String,
    pub market_id: String,
    pub proposed_outcome: Outcome,
    pub proposed_by: String,
    pub evidence: String,
    pub status: UmaStatus,
    pub proposed_at: DateTime<Utc>,
    pub dispute_window_ends: DateTime<Utc>,
    /// Committee size captured when the resolution was proposed.
    pub committee_size: usize,
    pub dispute: Option<DisputeInfo>,
    pub lock: Option<LockInfo>,
}

impl UmaResolution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn voting_ends(&self) -> Option<DateTime<Utc>> {
        self.dispute.as_ref().map(|d| d.voting_ends)
    }

    pub fn final_outcome(&self) -> Option<Outcome> {
        self.lock.as_ref().map(|l| l.final_outcome)
    }

    pub fn lock_hash(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.lock_hash.as_str())
    }
}

/// One admin vote on a disputed resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub resolution_id: String,
    pub admin_id: String,
    pub vote: Outcome,
    pub voted_at: DateTime<Utc>,
}

// ============================================================================
// Either flow
// ============================================================================

/// A market's resolution, whichever path produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum Resolution {
    Multisig(ResolutionProposal),
    Optimistic(UmaResolution),
}
