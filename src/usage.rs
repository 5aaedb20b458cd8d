//! Usage fetching and aggregation across all managed credentials.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::UsageConfig;
use crate::crypto::is_encrypted;
use crate::keys::{display_key, CredentialStore};
use crate::storage::{Credential, HistoryEntry, KeyReading, UsageTotals};
use crate::util::{format_date_value, lenient, now_millis};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageResponse {
    usage: UsagePeriod,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsagePeriod {
    /// Epoch milliseconds or a date string; formatted leniently.
    #[serde(default)]
    start_date: Option<Value>,
    #[serde(default)]
    end_date: Option<Value>,
    standard: StandardUsage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StandardUsage {
    #[serde(default, deserialize_with = "count_or_zero")]
    org_total_tokens_used: i64,
    #[serde(default, deserialize_with = "count_or_zero")]
    total_allowance: i64,
    #[serde(default, deserialize_with = "ratio_or_zero")]
    used_ratio: f64,
}

fn count_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    lenient::read(d, lenient::integer, i64::default)
}

fn ratio_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    lenient::read(d, lenient::float, f64::default)
}

/// Result of querying one credential. Failures are recorded in `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUsage {
    pub id: String,
    pub alias: String,
    pub group: String,
    pub note: String,
    pub enabled: bool,
    pub masked_key: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_total_tokens_used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_allowance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

impl KeyUsage {
    fn base(credential: &Credential) -> Self {
        Self {
            id: credential.id.clone(),
            alias: credential.alias.clone(),
            group: credential.group.clone(),
            note: credential.note.clone(),
            enabled: credential.enabled,
            masked_key: display_key(&credential.key),
            valid: false,
            error: None,
            start_date: None,
            end_date: None,
            org_total_tokens_used: None,
            total_allowance: None,
            used_ratio: None,
            remaining: None,
        }
    }

    fn failed(credential: &Credential, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(credential)
        }
    }

    fn succeeded(credential: &Credential, period: UsagePeriod) -> Self {
        let standard = period.standard;
        Self {
            valid: true,
            start_date: Some(format_date_value(period.start_date.as_ref())),
            end_date: Some(format_date_value(period.end_date.as_ref())),
            org_total_tokens_used: Some(standard.org_total_tokens_used),
            total_allowance: Some(standard.total_allowance),
            used_ratio: Some(standard.used_ratio),
            remaining: Some(standard.total_allowance - standard.org_total_tokens_used),
            ..Self::base(credential)
        }
    }

    fn reading(&self) -> Option<KeyReading> {
        if !self.valid {
            return None;
        }
        Some(KeyReading {
            id: self.id.clone(),
            used: self.org_total_tokens_used.unwrap_or(0),
            allowance: self.total_allowance.unwrap_or(0),
            remaining: self.remaining.unwrap_or(0),
        })
    }
}

/// Client for the remote metering endpoint.
#[derive(Debug, Clone)]
pub struct UsageClient {
    client: Client,
    url: String,
    timeout: Duration,
}

impl UsageClient {
    pub fn new(config: &UsageConfig) -> Self {
        Self {
            client: Client::new(),
            url: config.url.clone(),
            timeout: config.timeout,
        }
    }

    /// Query usage for one credential. Never fails; errors become invalid results.
    pub async fn fetch(&self, credential: &Credential) -> KeyUsage {
        let response = self
            .client
            .get(&self.url)
            .header("Authorization", format!("Bearer {}", credential.key))
            .header("User-Agent", USER_AGENT)
            .timeout(self.timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return Self::transport_failure(credential, e),
        };

        let status = response.status();
        if status != StatusCode::OK {
            tracing::warn!("Usage query for key {} failed: HTTP {}", credential.id, status.as_u16());
            return KeyUsage::failed(credential, format!("HTTP {}", status.as_u16()));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Self::transport_failure(credential, e),
        };

        match Self::parse(&body) {
            Ok(period) => KeyUsage::succeeded(credential, period),
            Err(reason) => {
                tracing::warn!("Usage query for key {} failed: {}", credential.id, reason);
                KeyUsage::failed(credential, reason)
            }
        }
    }

    fn transport_failure(credential: &Credential, e: reqwest::Error) -> KeyUsage {
        if e.is_timeout() {
            tracing::warn!("Usage query for key {} timed out", credential.id);
            return KeyUsage::failed(credential, "Request timeout");
        }
        tracing::warn!("Usage query for key {} failed: {}", credential.id, e);
        KeyUsage::failed(credential, e.to_string())
    }

    fn parse(body: &str) -> Result<UsagePeriod, &'static str> {
        let value: Value = serde_json::from_str(body).map_err(|_| "Parse error")?;
        if !value["usage"]["standard"].is_object() {
            return Err("Invalid API response");
        }
        serde_json::from_value::<UsageResponse>(value)
            .map(|r| r.usage)
            .map_err(|_| "Parse error")
    }
}

/// Response of one aggregation pass.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedUsage {
    pub update_time: String,
    /// Number of enabled credentials queried.
    pub total_count: usize,
    pub totals: UsageTotals,
    pub data: Vec<KeyUsage>,
    pub groups: BTreeMap<String, Vec<KeyUsage>>,
}

/// Sum usage over valid results.
pub fn compute_totals(results: &[KeyUsage]) -> UsageTotals {
    let mut totals = results
        .iter()
        .filter(|r| r.valid)
        .fold(UsageTotals::default(), |mut acc, r| {
            acc.used += r.org_total_tokens_used.unwrap_or(0);
            acc.allowance += r.total_allowance.unwrap_or(0);
            acc
        });
    totals.remaining = totals.allowance - totals.used;
    totals
}

/// Bucket every result, valid or not, by its group.
pub fn group_results(results: &[KeyUsage]) -> BTreeMap<String, Vec<KeyUsage>> {
    let mut groups: BTreeMap<String, Vec<KeyUsage>> = BTreeMap::new();
    for result in results {
        let group = if result.group.is_empty() {
            crate::storage::DEFAULT_GROUP.to_string()
        } else {
            result.group.clone()
        };
        groups.entry(group).or_default().push(result.clone());
    }
    groups
}

/// Runs aggregation passes over the managed credentials.
#[derive(Clone)]
pub struct UsageMonitor {
    store: CredentialStore,
    client: UsageClient,
}

impl UsageMonitor {
    pub fn new(store: CredentialStore, client: UsageClient) -> Self {
        Self { store, client }
    }

    pub fn client(&self) -> &UsageClient {
        &self.client
    }

    /// Keys still sealed under an unknown passphrase are reported without a
    /// request; the endpoint would only answer with an auth failure.
    async fn query(&self, credential: &Credential) -> KeyUsage {
        if is_encrypted(&credential.key) {
            tracing::warn!("Skipping usage query for key {}: undecryptable", credential.id);
            return KeyUsage::failed(credential, "Undecryptable key");
        }
        self.client.fetch(credential).await
    }

    /// Fetch every enabled credential concurrently, record a history entry,
    /// and return the combined result.
    pub async fn aggregate(&self) -> AggregatedUsage {
        let config = self.store.load_config().await;
        let enabled: Vec<&Credential> = config.api_keys.iter().filter(|c| c.enabled).collect();
        let update_time = chrono::Utc::now().to_rfc3339();

        if enabled.is_empty() {
            return AggregatedUsage {
                update_time,
                total_count: 0,
                totals: UsageTotals::default(),
                data: Vec::new(),
                groups: BTreeMap::new(),
            };
        }

        tracing::info!("Querying usage for {} key(s)", enabled.len());
        let results = join_all(enabled.iter().map(|c| self.query(c))).await;

        let totals = compute_totals(&results);
        let groups = group_results(&results);

        let mut history = self.store.storage().load_history().await;
        history.push(HistoryEntry {
            timestamp: now_millis(),
            totals,
            keys: results.iter().filter_map(KeyUsage::reading).collect(),
        });
        if !self.store.storage().save_history(history).await {
            tracing::warn!("Failed to record usage history");
        }

        for result in results.iter().filter(|r| r.valid && r.remaining.unwrap_or(0) > 0) {
            let alias = if result.alias.is_empty() {
                "No Alias"
            } else {
                &result.alias
            };
            tracing::info!(
                "{} ({}): {} tokens remaining",
                result.id,
                alias,
                result.remaining.unwrap_or(0)
            );
        }

        AggregatedUsage {
            update_time,
            total_count: enabled.len(),
            totals,
            data: results,
            groups,
        }
    }
}
