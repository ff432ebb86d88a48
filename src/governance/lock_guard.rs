//! Lock Guard
//!
//! A market whose optimistic resolution reached a terminal status is final.
//! Every mutating entry point checks this before touching anything and fails
//! closed. Finalize is the only path that skips it: it creates the lock.

use tracing::warn;

use super::GovernanceEngine;
use crate::error::{GovernanceError, GovernanceResult};

impl GovernanceEngine {
    /// True iff the market has any `UMA_LOCKED` or `EXPIRED_NO_DISPUTE`
    /// resolution.
    pub async fn is_market_locked(&self, market_id: &str) -> GovernanceResult<bool> {
        let resolutions = self.store.uma_resolutions_for_market(market_id).await?;
        Ok(resolutions.iter().any(|r| r.is_terminal()))
    }

    pub(crate) async fn ensure_not_locked(&self, market_id: &str) -> GovernanceResult<()> {
        if self.is_market_locked(market_id).await? {
            warn!(market_id = %market_id, "🔒 Rejected mutation on locked market");
            return Err(GovernanceError::forbidden(market_id));
        }
        Ok(())
    }
}
