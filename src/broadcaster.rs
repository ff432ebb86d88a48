//! Outcome Broadcaster
//!
//! Submits a final outcome to the chain. The engine only sees the
//! [`Broadcaster`] trait; transaction construction and key custody live behind
//! it.

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{BroadcasterKind, GovernanceConfig};
use crate::models::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    Multisig,
    Optimistic,
}

/// What gets written on-chain: `resolve_market(outcome)` against `app_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPayload {
    pub market_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<u64>,
    pub outcome: Outcome,
    pub path: ResolutionPath,
    /// Proposal id or optimistic resolution id.
    pub source_id: String,
    /// Resolution hash (multisig) or lock hash (optimistic).
    pub digest: String,
}

#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    /// Returns the transaction id. Timeouts are the implementation's job.
    async fn broadcast(&self, payload: &ResolutionPayload) -> Result<String>;
}

/// Paper broadcaster: logs and returns a fake tx id.
#[derive(Debug, Clone, Default)]
pub struct PaperBroadcaster;

#[async_trait::async_trait]
impl Broadcaster for PaperBroadcaster {
    async fn broadcast(&self, payload: &ResolutionPayload) -> Result<String> {
        let tx_id = format!("paper:{}", uuid::Uuid::new_v4().simple());
        info!(
            market_id = %payload.market_id,
            outcome = payload.outcome.as_u8(),
            path = ?payload.path,
            tx_id = %tx_id,
            "📝 Paper broadcast"
        );
        Ok(tx_id)
    }
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    tx_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// POSTs the payload to a signing relay that owns the resolver keys.
#[derive(Debug, Clone)]
pub struct RelayBroadcaster {
    client: Client,
    url: String,
}

impl RelayBroadcaster {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build relay HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Broadcaster for RelayBroadcaster {
    async fn broadcast(&self, payload: &ResolutionPayload) -> Result<String> {
        debug!(url = %self.url, market_id = %payload.market_id, "relay broadcast");

        let resp = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .context("relay request failed")?;

        let status = resp.status();
        let body: RelayResponse = resp
            .json()
            .await
            .with_context(|| format!("relay returned unreadable body (HTTP {status})"))?;

        if !status.is_success() {
            return Err(anyhow!(
                "relay rejected broadcast (HTTP {}): {}",
                status,
                body.error.unwrap_or_else(|| "no error message".to_string())
            ));
        }

        body.tx_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow!("relay response missing tx_id"))
    }
}

/// Builds the broadcaster selected by configuration.
pub fn from_config(config: &GovernanceConfig) -> Result<Box<dyn Broadcaster>> {
    match config.broadcaster {
        BroadcasterKind::Paper => Ok(Box::new(PaperBroadcaster)),
        BroadcasterKind::Relay => {
            let url = config
                .relay_url
                .clone()
                .ok_or_else(|| anyhow!("BROADCASTER=relay requires RELAY_URL"))?;
            Ok(Box::new(RelayBroadcaster::new(url, config.relay_timeout)?))
        }
    }
}
