//! Client for the exit-relay directory service.
//!
//! A single JSON GET at startup; failures are recoverable and leave the
//! pool running without exit-node pinning.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{PoolError, Result};
use crate::models::RelayRecord;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    relays: Vec<DirectoryRelay>,
}

#[derive(Debug, Deserialize)]
struct DirectoryRelay {
    #[serde(default)]
    fingerprint: String,
    #[serde(default)]
    or_addresses: Vec<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    exit_probability: Option<f64>,
}

/// Fetches and filters exit relays from the directory service.
pub struct DirectoryClient {
    config: RelayConfig,
    client: reqwest::Client,
}

impl DirectoryClient {
    pub fn new(config: RelayConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { config, client }
    }

    /// Fetch the relay list, applying the configured country filter and
    /// global cap.
    pub async fn fetch(&self) -> Result<Vec<RelayRecord>> {
        debug!("fetching exit relays from {}", self.config.directory_url);

        let response = self
            .client
            .get(&self.config.directory_url)
            .send()
            .await
            .map_err(|e| PoolError::DirectoryUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PoolError::DirectoryUnavailable(format!(
                "directory returned status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PoolError::DirectoryUnavailable(e.to_string()))?;

        let relays = parse_relays(&body, &self.config.countries, self.config.exit_nodes_max)?;
        info!("directory returned {} usable exit relays", relays.len());
        Ok(relays)
    }

    /// Fetch, degrading to an empty list when the directory is down or
    /// returns garbage. The pool then runs with default exit selection.
    pub async fn fetch_or_empty(&self) -> Vec<RelayRecord> {
        match self.fetch().await {
            Ok(relays) => relays,
            Err(e) => {
                warn!("proceeding without exit-node pinning: {}", e);
                Vec::new()
            }
        }
    }
}

/// Parse the directory JSON into relay records.
///
/// Each relay contributes its first IPv4 address; records without one are
/// discarded. `countries` is lowercase two-letter codes; empty means no
/// filter. `cap` bounds the result length (0 = unlimited).
pub fn parse_relays(body: &str, countries: &[String], cap: usize) -> Result<Vec<RelayRecord>> {
    let parsed: DirectoryResponse =
        serde_json::from_str(body).map_err(|e| PoolError::DirectoryMalformed(e.to_string()))?;

    let mut records = Vec::new();
    for relay in parsed.relays {
        if relay.fingerprint.is_empty() {
            continue;
        }
        let address = match first_ipv4(&relay.or_addresses) {
            Some(addr) => addr,
            None => continue,
        };
        let country = relay.country.map(|c| c.to_ascii_lowercase());
        if !countries.is_empty() {
            match &country {
                Some(c) if countries.contains(c) => {}
                _ => continue,
            }
        }
        records.push(RelayRecord {
            fingerprint: relay.fingerprint,
            address,
            country,
            exit_probability: relay.exit_probability,
        });
        if cap > 0 && records.len() == cap {
            break;
        }
    }

    Ok(records)
}

/// First `host:port` entry whose host parses as IPv4, host part only.
fn first_ipv4(or_addresses: &[String]) -> Option<String> {
    for entry in or_addresses {
        let host = entry.rsplit_once(':').map(|(h, _)| h).unwrap_or(entry);
        if host.parse::<std::net::Ipv4Addr>().is_ok() {
            return Some(host.to_string());
        }
    }
    None
}
