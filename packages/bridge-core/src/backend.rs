//! Relayer backend proof/record API
//!
//! The backend indexes bridge events and serves register proofs, the best
//! accepted MMR root and per-account transfer history. Every endpoint wraps
//! its payload as `{"data": ...}`. Non-2xx responses and malformed bodies are
//! returned as errors; callers retry them through [`crate::poller`].

use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::hash::parse_bytes32;
use crate::redact::Redacted;
use crate::types::{BestRoot, RawRegisterProof, RecordPage, RecordQuery, RegisterProofDoc};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ProofBackend: Send + Sync {
    /// Register proof for `token`, or `None` while the relayer has not produced one
    async fn register_proof(&self, token: Address) -> Result<Option<RegisterProofDoc>>;

    /// Latest MMR root the destination chain has accepted
    async fn best_root(&self) -> Result<BestRoot>;

    async fn records(&self, query: &RecordQuery) -> Result<RecordPage>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RawBestRoot {
    index: u64,
    root: String,
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<Option<T>> {
    let envelope: Envelope<T> =
        serde_json::from_str(body).wrap_err("Malformed backend response")?;
    Ok(envelope.data)
}

pub(crate) fn parse_register_proof(body: &str) -> Result<Option<RegisterProofDoc>> {
    parse_envelope::<RawRegisterProof>(body)?
        .map(|raw| RegisterProofDoc::try_from(raw).map_err(|e| eyre!("{}", e)))
        .transpose()
}

pub(crate) fn parse_best_root(body: &str) -> Result<BestRoot> {
    let raw: RawBestRoot =
        parse_envelope(body)?.ok_or_else(|| eyre!("Backend has no best MMR root yet"))?;
    Ok(BestRoot {
        index: raw.index,
        root: parse_bytes32(&raw.root).wrap_err("Invalid best MMR root")?,
    })
}

pub(crate) fn parse_record_page(body: &str) -> Result<RecordPage> {
    Ok(parse_envelope(body)?.unwrap_or_default())
}

/// [`ProofBackend`] over the relayer's HTTP API
pub struct HttpProofBackend {
    base_url: String,
    api_key: Option<Redacted<String>>,
    client: Client,
}

impl HttpProofBackend {
    pub fn new(base_url: &str, api_key: Option<Redacted<String>>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("Failed to build HTTP client")?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!(
            base_url = %base_url,
            api_key = ?api_key,
            "Proof backend configured"
        );

        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key.expose().as_str());
        }

        let response = request
            .send()
            .await
            .wrap_err_with(|| format!("Request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            return Err(eyre!(
                "Backend {} returned {} - {}",
                path,
                status,
                response.text().await.unwrap_or_default()
            ));
        }

        debug!(path, "Backend response received");
        response
            .text()
            .await
            .wrap_err_with(|| format!("Failed to read {} response", path))
    }
}

#[async_trait]
impl ProofBackend for HttpProofBackend {
    async fn register_proof(&self, token: Address) -> Result<Option<RegisterProofDoc>> {
        let body = self
            .get("/api/register-proof", &[("token", token.to_string())])
            .await?;
        parse_register_proof(&body)
    }

    async fn best_root(&self) -> Result<BestRoot> {
        let body = self.get("/api/mmr/best", &[]).await?;
        parse_best_root(&body)
    }

    async fn records(&self, query: &RecordQuery) -> Result<RecordPage> {
        let params = [
            ("from", query.direction.departure.network.to_string()),
            ("from_mode", query.direction.departure.mode.to_string()),
            ("to", query.direction.arrival.network.to_string()),
            ("to_mode", query.direction.arrival.mode.to_string()),
            ("account", query.account.clone()),
            ("page", query.page.to_string()),
            ("size", query.size.to_string()),
        ];
        let body = self.get("/api/records", &params).await?;
        parse_record_page(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    #[test]
    fn test_parse_register_proof_pending() {
        assert_eq!(parse_register_proof(r#"{"data": null}"#).unwrap(), None);
        assert_eq!(parse_register_proof(r#"{}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_register_proof_document() {
        let body = format!(
            r#"{{"data": {{
                "block_hash": "0x{}",
                "block_num": 88,
                "mmr_index": 90,
                "mmr_root": "0x{}",
                "signatures": ["0x01", "0x02"]
            }}}}"#,
            "aa".repeat(32),
            "bb".repeat(32)
        );
        let doc = parse_register_proof(&body).unwrap().unwrap();
        assert_eq!(doc.block_num, 88);
        assert_eq!(doc.mmr_root, B256::from([0xbb; 32]));
        assert_eq!(doc.signatures.len(), 2);
    }

    #[test]
    fn test_malformed_bodies_are_errors() {
        assert!(parse_register_proof("<html>502 Bad Gateway</html>").is_err());
        let bad_hash = r#"{"data": {"block_hash": "0x01", "block_num": 1, "mmr_index": 2,
            "mmr_root": "0x02", "signatures": ""}}"#;
        assert!(parse_register_proof(bad_hash).is_err());
        assert!(parse_best_root(r#"{"data": null}"#).is_err());
    }

    #[test]
    fn test_parse_best_root() {
        let body = format!(r#"{{"data": {{"index": 1200, "root": "0x{}"}}}}"#, "cd".repeat(32));
        let best = parse_best_root(&body).unwrap();
        assert_eq!(best.index, 1200);
        assert_eq!(best.root, B256::from([0xcd; 32]));
    }

    #[test]
    fn test_parse_record_page() {
        let body = r#"{"data": {"total": 1, "records": [{
            "tx_hash": "0x01",
            "sender": "5Grw",
            "recipient": "0xabc",
            "amount": "1000000000",
            "block_num": 7
        }]}}"#;
        let page = parse_record_page(body).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].block_num, 7);
        assert!(page.records[0].mmr_root.is_none());

        assert_eq!(parse_record_page(r#"{"data": null}"#).unwrap(), RecordPage::default());
    }

    #[test]
    fn test_http_backend_trims_base_url() {
        let backend =
            HttpProofBackend::new("https://api.example.org/", Some(Redacted("k".into()))).unwrap();
        assert_eq!(backend.base_url, "https://api.example.org");
    }
}
