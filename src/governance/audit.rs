//! Audit digests
//!
//! SHA-256 over `|`-joined fields, hex encoded. Timestamps use the store's
//! RFC 3339 nanosecond encoding so a digest recomputed from a stored row
//! matches the one written at finalize time.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::{Outcome, UmaResolution};
use crate::store::encode_ts;

fn digest(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// `Hash(market_id ∥ final_outcome ∥ proposed_at ∥ locked_at ∥ evidence)`
pub fn lock_hash(
    market_id: &str,
    final_outcome: Outcome,
    proposed_at: &DateTime<Utc>,
    locked_at: &DateTime<Utc>,
    evidence: &str,
) -> String {
    digest(&[
        market_id,
        &final_outcome.to_string(),
        &encode_ts(proposed_at),
        &encode_ts(locked_at),
        evidence,
    ])
}

pub fn resolution_hash(
    market_id: &str,
    outcome: Outcome,
    evidence: &str,
    created_at: &DateTime<Utc>,
) -> String {
    digest(&[
        market_id,
        &outcome.to_string(),
        evidence,
        &encode_ts(created_at),
    ])
}

/// Recomputes the lock hash of a final resolution. False for resolutions that
/// are not locked.
pub fn verify_lock_hash(resolution: &UmaResolution) -> bool {
    let Some(lock) = resolution.lock.as_ref() else {
        return false;
    };
    let expected = lock_hash(
        &resolution.market_id,
        lock.final_outcome,
        &resolution.proposed_at,
        &lock.locked_at,
        &resolution.evidence,
    );
    expected == lock.lock_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LockInfo, UmaStatus};
    use chrono::Duration;

    #[test]
    fn test_lock_hash_is_deterministic_and_field_sensitive() {
        let proposed_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let locked_at = proposed_at + Duration::minutes(11);

        let a = lock_hash("m-1", Outcome::No, &proposed_at, &locked_at, "box score");
        let b = lock_hash("m-1", Outcome::No, &proposed_at, &locked_at, "box score");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, lock_hash("m-1", Outcome::Yes, &proposed_at, &locked_at, "box score"));
        assert_ne!(a, lock_hash("m-2", Outcome::No, &proposed_at, &locked_at, "box score"));
        assert_ne!(a, lock_hash("m-1", Outcome::No, &proposed_at, &proposed_at, "box score"));
    }

    #[test]
    fn test_verify_lock_hash() {
        let proposed_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let locked_at = proposed_at + Duration::minutes(11);
        let mut resolution = UmaResolution {
            id: "r-1".to_string(),
            market_id: "m-1".to_string(),
            proposed_outcome: Outcome::No,
            proposed_by: "admin-a".to_string(),
            evidence: "box score".to_string(),
            status: UmaStatus::Proposed,
            proposed_at,
            dispute_window_ends: proposed_at + Duration::minutes(10),
            committee_size: 3,
            dispute: None,
            lock: None,
        };
        assert!(!verify_lock_hash(&resolution));

        resolution.status = UmaStatus::ExpiredNoDispute;
        resolution.lock = Some(LockInfo {
            final_outcome: Outcome::No,
            lock_hash: lock_hash("m-1", Outcome::No, &proposed_at, &locked_at, "box score"),
            locked_at,
            tx_id: None,
        });
        assert!(verify_lock_hash(&resolution));

        resolution.evidence = "edited after the fact".to_string();
        assert!(!verify_lock_hash(&resolution));
    }
}
