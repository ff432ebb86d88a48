//! Governance Errors
//!
//! Typed results returned by every engine entry point. The HTTP layer maps
//! [`ErrorKind`] to status codes; the engine never does.

use thiserror::Error;

pub type GovernanceResult<T> = Result<T, GovernanceError>;

#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Malformed outcome, empty or oversized evidence / reason.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate vote, market already resolved, resolution in the wrong state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Market is locked by a terminal optimistic resolution.
    #[error("market {market_id} is locked by a final resolution")]
    Forbidden { market_id: String },

    #[error("{window} window closed at {closed_at}")]
    Expired {
        window: &'static str,
        closed_at: String,
    },

    /// Store or Broadcaster failure. The entity keeps its pre-finalize state.
    #[error("upstream failure: {0:#}")]
    Upstream(anyhow::Error),
}

/// Fieldless discriminant of [`GovernanceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Expired,
    Upstream,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Expired => "expired",
            ErrorKind::Upstream => "upstream_failure",
        }
    }
}

impl GovernanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::Upstream(_) => ErrorKind::Upstream,
        }
    }

    /// Only upstream failures are worth retrying; everything else is final for
    /// the given input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn forbidden(market_id: impl Into<String>) -> Self {
        Self::Forbidden {
            market_id: market_id.into(),
        }
    }
}

impl From<anyhow::Error> for GovernanceError {
    fn from(e: anyhow::Error) -> Self {
        Self::Upstream(e)
    }
}
