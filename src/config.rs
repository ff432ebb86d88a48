//! Governance Configuration
//!
//! Thresholds, windows and collaborator settings. Every value is read from the
//! environment with a default, so nothing about the committee is hard-coded.

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

/// Longest accepted dispute or voting window.
pub const MAX_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterKind {
    /// Fake tx ids, no network.
    Paper,
    /// POST to an external signing relay.
    Relay,
}

impl BroadcasterKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "paper" => Some(BroadcasterKind::Paper),
            "relay" => Some(BroadcasterKind::Relay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    /// Distinct admin signatures needed to finalize a multisig proposal.
    pub signature_threshold: usize,
    /// Admins eligible to vote; once this many have voted the tally is final.
    pub committee_size: usize,
    pub dispute_window: Duration,
    pub voting_window: Duration,
    pub scheduler_interval: Duration,
    /// Upper bound on evidence / dispute reason length, in characters.
    pub max_text_len: usize,
    pub database_path: String,
    pub broadcaster: BroadcasterKind,
    pub relay_url: Option<String>,
    pub relay_timeout: Duration,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            signature_threshold: 2,
            committee_size: 3,
            dispute_window: Duration::from_secs(10 * 60),
            voting_window: Duration::from_secs(10 * 60),
            scheduler_interval: Duration::from_secs(15),
            max_text_len: 2000,
            database_path: "./castalgo_governance.db".to_string(),
            broadcaster: BroadcasterKind::Paper,
            relay_url: None,
            relay_timeout: Duration::from_secs(10),
        }
    }
}

impl GovernanceConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup. Absent keys keep the default; a
    /// present value that does not parse is an error, as is any value that
    /// fails [`GovernanceConfig::validate`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize>(&lookup, "SIGNATURE_THRESHOLD")? {
            config.signature_threshold = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "COMMITTEE_SIZE")? {
            config.committee_size = v;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "DISPUTE_WINDOW_SECS")? {
            config.dispute_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "VOTING_WINDOW_SECS")? {
            config.voting_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SCHEDULER_INTERVAL_SECS")? {
            config.scheduler_interval = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "MAX_EVIDENCE_LEN")? {
            config.max_text_len = v;
        }
        if let Some(path) = lookup("GOVERNANCE_DB_PATH").filter(|v| !v.trim().is_empty()) {
            config.database_path = path;
        }
        if let Some(raw) = lookup("BROADCASTER") {
            config.broadcaster = BroadcasterKind::from_str(&raw).ok_or_else(|| {
                anyhow!("BROADCASTER must be `paper` or `relay`, got {raw:?}")
            })?;
        }
        config.relay_url = lookup("RELAY_URL").filter(|v| !v.trim().is_empty());
        if let Some(secs) = parse_var::<u64>(&lookup, "RELAY_TIMEOUT_SECS")? {
            config.relay_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signature_threshold == 0 {
            bail!("SIGNATURE_THRESHOLD must be at least 1");
        }
        if self.committee_size == 0 {
            bail!("COMMITTEE_SIZE must be at least 1");
        }
        if self.signature_threshold > self.committee_size {
            bail!(
                "SIGNATURE_THRESHOLD ({}) cannot exceed COMMITTEE_SIZE ({})",
                self.signature_threshold,
                self.committee_size
            );
        }
        if self.dispute_window.is_zero() || self.voting_window.is_zero() {
            bail!("dispute and voting windows must be non-zero");
        }
        if self.dispute_window > MAX_WINDOW || self.voting_window > MAX_WINDOW {
            bail!(
                "dispute and voting windows are capped at {}s",
                MAX_WINDOW.as_secs()
            );
        }
        if self.scheduler_interval.is_zero() {
            bail!("SCHEDULER_INTERVAL_SECS must be non-zero");
        }
        if self.max_text_len == 0 {
            bail!("MAX_EVIDENCE_LEN must be at least 1");
        }
        if self.relay_timeout.is_zero() {
            bail!("RELAY_TIMEOUT_SECS must be non-zero");
        }
        if self.scheduler_interval >= self.dispute_window.min(self.voting_window) {
            bail!(
                "SCHEDULER_INTERVAL ({:?}) must be shorter than both windows",
                self.scheduler_interval
            );
        }
        if self.broadcaster == BroadcasterKind::Relay && self.relay_url.is_none() {
            bail!("BROADCASTER=relay requires RELAY_URL");
        }
        Ok(())
    }

    pub fn dispute_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.dispute_window)
    }

    pub fn voting_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.voting_window)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => bail!("{key} must be a non-negative integer, got {raw:?}"),
        },
    }
}
