//! WhatsOnChain REST client.
//!
//! | Role          | Request                              |
//! |---------------|--------------------------------------|
//! | UTXO query    | `GET  {base}/address/{address}/unspent` |
//! | Source fetch  | `GET  {base}/tx/{txid}/hex`          |
//! | Broadcast     | `POST {base}/tx/raw {"txhex": ...}`  |
//!
//! Broadcast failures are classified for the writer. A refused connection
//! never reached the service and a 4xx is an explicit rejection; both are
//! unambiguous. A timeout, a dropped response, or a 5xx may have followed
//! a relay, so those are reported as ambiguous.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::chain::head::Utxo;
use crate::chain::services::{Broadcaster, TxFetch, UtxoQuery};
use crate::config;
use crate::error::{AuditError, AuditResult};

/// Which BSV network to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// API base URL.
    pub fn api_base(self) -> &'static str {
        match self {
            Self::Mainnet => config::WOC_API_MAINNET,
            Self::Testnet => config::WOC_API_TESTNET,
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Self::Mainnet),
            "test" | "testnet" => Ok(Self::Testnet),
            other => Err(format!("unknown network '{other}' (expected main or test)")),
        }
    }
}

/// One entry of `/address/{address}/unspent`.
#[derive(Debug, Deserialize)]
struct WocUnspent {
    tx_hash: String,
    tx_pos: u32,
    value: u64,
    #[serde(default)]
    height: u64,
}

impl From<WocUnspent> for Utxo {
    fn from(u: WocUnspent) -> Self {
        Utxo {
            txid: u.tx_hash,
            output_index: u.tx_pos,
            value: u.value,
            height: u.height,
        }
    }
}

/// HTTP client for the WhatsOnChain API.
#[derive(Debug, Clone)]
pub struct WhatsOnChainClient {
    client: reqwest::Client,
    base_url: String,
}

impl WhatsOnChainClient {
    /// Client for `network` with the given per-request timeout.
    pub fn new(network: Network, timeout: Duration) -> AuditResult<Self> {
        Self::with_base_url(network.api_base(), timeout)
    }

    /// Client against an arbitrary base URL.
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> AuditResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("auditchain/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuditError::Service(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, url: &str) -> AuditResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AuditError::Service(format!("GET {url}: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuditError::Service(format!("GET {url}: {e}")))?;
        if !status.is_success() {
            return Err(AuditError::Service(format!(
                "GET {url}: HTTP {status}: {}",
                body.trim()
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl UtxoQuery for WhatsOnChainClient {
    async fn list_unspent(&self, address: &str) -> AuditResult<Vec<Utxo>> {
        let url = format!("{}/address/{address}/unspent", self.base_url);
        let body = self.get_text(&url).await?;
        parse_unspent(&body)
    }
}

#[async_trait]
impl TxFetch for WhatsOnChainClient {
    async fn get_raw(&self, txid: &str) -> AuditResult<Vec<u8>> {
        let url = format!("{}/tx/{txid}/hex", self.base_url);
        let body = self.get_text(&url).await?;
        hex::decode(body.trim().trim_matches('"'))
            .map_err(|e| AuditError::Service(format!("tx {txid}: response is not hex: {e}")))
    }
}

#[async_trait]
impl Broadcaster for WhatsOnChainClient {
    async fn submit(&self, raw: &[u8]) -> AuditResult<String> {
        let url = format!("{}/tx/raw", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "txhex": hex::encode(raw) }))
            .send()
            .await
            .map_err(|e| AuditError::Broadcast {
                reason: e.to_string(),
                ambiguous: !e.is_connect(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AuditError::Broadcast {
            reason: format!("response lost: {e}"),
            ambiguous: true,
        })?;

        if !status.is_success() {
            return Err(AuditError::Broadcast {
                reason: format!("HTTP {status}: {}", body.trim()),
                ambiguous: status.is_server_error(),
            });
        }
        parse_broadcast_txid(&body).ok_or_else(|| AuditError::Broadcast {
            reason: format!("unrecognised broadcast response: {}", body.trim()),
            ambiguous: true,
        })
    }
}

fn parse_unspent(body: &str) -> AuditResult<Vec<Utxo>> {
    serde_json::from_str::<Vec<WocUnspent>>(body)
        .map(|list| list.into_iter().map(Utxo::from).collect())
        .map_err(|e| AuditError::Service(format!("unspent list: {e}")))
}

/// Pulls the txid out of a broadcast response. The service answers with a
/// JSON string, but a bare txid or `{"txid": ...}` are accepted too.
fn parse_broadcast_txid(body: &str) -> Option<String> {
    let body = body.trim();
    let candidate = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(serde_json::Value::Object(map)) => map.get("txid")?.as_str()?.to_string(),
        _ => body.to_string(),
    };
    let is_txid = candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit());
    is_txid.then_some(candidate)
}
