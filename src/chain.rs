//! Boundary to the on-chain payment channel contract.
//!
//! The contract runtime is an external collaborator. The gateway consumes it
//! through [`ChainClient`]: submitting claims for signed RAVs and reading
//! channel facts (payer identity, epoch, status, hub balance). Chain failures
//! never reach the request path; the claim scheduler absorbs them with
//! retries and backoff.

use alloy_primitives::U256;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::rav::{ChannelId, SignedSubRav};
use crate::store::ChannelStatus;
use crate::util::num_str;

/// Channel facts as reported by the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainChannel {
    pub channel_id: ChannelId,
    pub payer_did: String,
    pub payee_did: String,
    pub asset_id: String,
    pub epoch: u64,
    pub status: ChannelStatus,
    /// Funds deposited by the payer and still available to claims.
    #[serde(with = "num_str::u256_dec")]
    pub hub_balance: U256,
}

/// Result of a successful on-chain claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub tx_hash: String,
}

/// Errors crossing the chain boundary. All of them are treated as transient
/// by the claim scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain transport failure: {0}")]
    Transport(String),
    #[error("claim rejected by contract: {0}")]
    Rejected(String),
}

/// External on-chain contract runtime.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Submits a signed RAV for settlement and waits for inclusion.
    async fn claim(&self, rav: &SignedSubRav) -> Result<ClaimReceipt, ChainError>;

    /// Reads the current channel record, `None` if the channel does not
    /// exist on-chain.
    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Option<OnChainChannel>, ChainError>;
}

/// [`ChainClient`] backed by a settlement hub spoken to over HTTP.
///
/// The hub wraps the actual contract runtime; this client only does JSON
/// POST/GET against it. Cheap to clone: the underlying `reqwest::Client`
/// shares its connection pool.
#[derive(Clone, Debug)]
pub struct HubChainClient {
    claim_url: Url,
    channel_url: Url,
    client: Client,
    timeout: Duration,
}

impl HubChainClient {
    /// Builds a client against a hub base URL, e.g. `https://hub.example/`.
    pub fn try_new(base_url: Url, timeout: Duration) -> Result<Self, url::ParseError> {
        let claim_url = base_url.join("./claims")?;
        let channel_url = base_url.join("./channels/")?;
        Ok(HubChainClient {
            claim_url,
            channel_url,
            client: Client::new(),
            timeout,
        })
    }
}

#[async_trait]
impl ChainClient for HubChainClient {
    async fn claim(&self, rav: &SignedSubRav) -> Result<ClaimReceipt, ChainError> {
        let response = self
            .client
            .post(self.claim_url.clone())
            .timeout(self.timeout)
            .json(rav)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        if response.status().is_success() {
            response
                .json::<ClaimReceipt>()
                .await
                .map_err(|e| ChainError::Transport(e.to_string()))
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ChainError::Rejected(format!("{status}: {body}")))
        }
    }

    async fn get_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<OnChainChannel>, ChainError> {
        let url = self
            .channel_url
            .join(channel_id.as_str())
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status().is_success() {
            response
                .json::<OnChainChannel>()
                .await
                .map(Some)
                .map_err(|e| ChainError::Transport(e.to_string()))
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ChainError::Transport(format!("{status}: {body}")))
        }
    }
}
