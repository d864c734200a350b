//! Bridge core configuration
//!
//! # Environment Variable Schema
//!
//! ```text
//! BRIDGE_PROOF_API_URL=https://api.example.org      # required
//! BRIDGE_PROOF_API_KEY=...                          # optional, never logged
//! BRIDGE_CHAIN_PREFIX=Pangolin                      # optional
//! BRIDGE_ROOT_METHOD_ID=0x479fbdf9                  # optional
//! BRIDGE_STORAGE_KEYS='[{"min_block":0,"max_block":null,"key":"0x..."}]'
//! BRIDGE_STORAGE_KEYS_ALLOW_GAPS=false              # optional
//! BRIDGE_REGISTER_PROOF_ADDRESS=0x...               # required
//! PROOF_CACHE_SIZE=1024                             # optional
//! RECORD_POLL_INTERVAL_MS=5000                      # optional
//! RECORD_POLL_MAX_ATTEMPTS=10                       # optional
//! ```

use std::env;
use std::path::Path;
use std::time::Duration;

use alloy::primitives::Bytes;
use eyre::{Result, WrapErr};
use tracing::{info, warn};

use crate::backend::HttpProofBackend;
use crate::cache::DEFAULT_PROOF_CACHE_SIZE;
use crate::encoding::{DEFAULT_CHAIN_PREFIX, DEFAULT_METHOD_ID};
use crate::error::ConfigError;
use crate::hash::{parse_bytes4, parse_hex_bytes};
use crate::poller::PollConfig;
use crate::proof::ProofSettings;
use crate::redact::Redacted;
use crate::storage_keys::StorageKeyTable;

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_poll_max_attempts() -> u32 {
    10
}

/// Validates that a URL uses http/https and has a host component.
pub fn validate_url(url_str: &str, name: &'static str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid { name, reason };

    let parsed = url::Url::parse(url_str).map_err(|e| invalid(format!("not a valid URL: {}", e)))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(invalid(format!(
            "must use http:// or https:// scheme, got {}",
            scheme
        )));
    }

    if parsed.host_str().is_none() {
        return Err(invalid("must have a host component".to_string()));
    }

    if scheme == "http" {
        warn!("{} uses unencrypted http://, use https:// in production", name);
    }

    Ok(())
}

/// Main configuration for the bridge core
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub proof_api_url: String,
    pub proof_api_key: Option<Redacted<String>>,
    pub chain_prefix: String,
    pub root_method_id: [u8; 4],
    pub storage_keys: StorageKeyTable,
    pub register_proof_key: Bytes,
    pub proof_cache_size: usize,
    pub record_poll_interval_ms: u64,
    pub record_poll_max_attempts: u32,
}

impl BridgeConfig {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let config = Self::from_lookup(|name| env::var(name).ok())?;
        info!(
            proof_api_url = %config.proof_api_url,
            storage_key_ranges = config.storage_keys.len(),
            cache_size = config.proof_cache_size,
            "Bridge configuration loaded"
        );
        Ok(config)
    }

    /// Build the configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let proof_api_url = required("BRIDGE_PROOF_API_URL")?;
        validate_url(&proof_api_url, "BRIDGE_PROOF_API_URL")?;

        let proof_api_key = lookup("BRIDGE_PROOF_API_KEY")
            .filter(|key| !key.is_empty())
            .map(Redacted);

        let chain_prefix =
            lookup("BRIDGE_CHAIN_PREFIX").unwrap_or_else(|| DEFAULT_CHAIN_PREFIX.to_string());

        let root_method_id = match lookup("BRIDGE_ROOT_METHOD_ID") {
            Some(raw) => parse_bytes4(&raw).map_err(|e| ConfigError::Invalid {
                name: "BRIDGE_ROOT_METHOD_ID",
                reason: e.to_string(),
            })?,
            None => DEFAULT_METHOD_ID,
        };

        let allow_gaps = match lookup("BRIDGE_STORAGE_KEYS_ALLOW_GAPS") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "BRIDGE_STORAGE_KEYS_ALLOW_GAPS",
                reason: format!("expected true or false, got '{}'", raw),
            })?,
            None => false,
        };
        let storage_keys =
            StorageKeyTable::from_json(&required("BRIDGE_STORAGE_KEYS")?, allow_gaps)?;

        let register_proof_key = parse_hex_bytes(&required("BRIDGE_REGISTER_PROOF_ADDRESS")?)
            .map_err(|e| ConfigError::Invalid {
                name: "BRIDGE_REGISTER_PROOF_ADDRESS",
                reason: e.to_string(),
            })?;
        if register_proof_key.is_empty() {
            return Err(ConfigError::Invalid {
                name: "BRIDGE_REGISTER_PROOF_ADDRESS",
                reason: "cannot be empty".to_string(),
            });
        }

        let config = Self {
            proof_api_url,
            proof_api_key,
            chain_prefix,
            root_method_id,
            storage_keys,
            register_proof_key: Bytes::from(register_proof_key),
            proof_cache_size: lookup("PROOF_CACHE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PROOF_CACHE_SIZE),
            record_poll_interval_ms: lookup("RECORD_POLL_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_poll_interval_ms()),
            record_poll_max_attempts: lookup("RECORD_POLL_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_poll_max_attempts()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                name: "BRIDGE_CHAIN_PREFIX",
                reason: "cannot be empty".to_string(),
            });
        }
        if self.proof_cache_size == 0 {
            return Err(ConfigError::Invalid {
                name: "PROOF_CACHE_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.record_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "RECORD_POLL_INTERVAL_MS",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.record_poll_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "RECORD_POLL_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn proof_settings(&self) -> ProofSettings {
        ProofSettings {
            chain_prefix: self.chain_prefix.clone(),
            method_id: self.root_method_id,
            storage_keys: self.storage_keys.clone(),
            register_proof_key: self.register_proof_key.clone(),
            cache_size: self.proof_cache_size,
        }
    }

    /// Bounded polling for UI-triggered record refreshes
    pub fn record_poll(&self) -> PollConfig {
        PollConfig::bounded(
            Duration::from_millis(self.record_poll_interval_ms),
            self.record_poll_max_attempts,
        )
    }

    /// Unbounded polling for register proofs; runs until the caller drops it
    pub fn register_proof_poll(&self) -> PollConfig {
        PollConfig::unbounded(Duration::from_millis(self.record_poll_interval_ms))
    }

    pub fn proof_backend(&self) -> Result<HttpProofBackend> {
        HttpProofBackend::new(&self.proof_api_url, self.proof_api_key.clone())
    }
}
