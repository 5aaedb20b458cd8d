//! Persisted document types.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::util::lenient;

pub const DEFAULT_AUTO_REFRESH_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.8;
pub const DEFAULT_HISTORY_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_VIEW_PASSWORD: &str = "0000";

/// The configuration document (`config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    /// Managed credentials in display order. Ids are unique.
    pub api_keys: Vec<Credential>,
    #[serde(default)]
    pub settings: Settings,
    /// Unrecognized top-level fields, preserved on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            settings: Settings::default(),
            extra: Map::new(),
        }
    }
}

impl ConfigDocument {
    pub fn find(&self, id: &str) -> Option<&Credential> {
        self.api_keys.iter().find(|c| c.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Credential> {
        self.api_keys.iter_mut().find(|c| c.id == id)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Read a stored document, repairing what can be repaired.
    ///
    /// Only a document without an `apiKeys` array is rejected. Credential
    /// entries that cannot be read at all (not an object, no string `id` or
    /// `key`) are dropped, and an unreadable `settings` value is reset; each
    /// such repair is described in the returned list.
    pub fn from_stored(value: &Value) -> Result<(Self, Vec<String>), serde_json::Error> {
        use serde::de::Error as _;

        let Value::Object(fields) = value else {
            return Err(serde_json::Error::custom("config is not an object"));
        };
        let Some(Value::Array(entries)) = fields.get("apiKeys") else {
            return Err(serde_json::Error::custom("apiKeys is not an array"));
        };

        let mut repairs = Vec::new();
        let mut api_keys = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match Credential::deserialize(entry) {
                Ok(credential) => api_keys.push(credential),
                Err(e) => repairs.push(format!("dropped apiKeys[{}]: {}", index, e)),
            }
        }

        let settings = match fields.get("settings") {
            None | Some(Value::Null) => Settings::default(),
            Some(raw) => Settings::deserialize(raw).unwrap_or_else(|e| {
                repairs.push(format!("reset settings: {}", e));
                Settings::default()
            }),
        };

        let extra = fields
            .iter()
            .filter(|(name, _)| !matches!(name.as_str(), "apiKeys" | "settings"))
            .map(|(name, v)| (name.clone(), v.clone()))
            .collect();

        Ok((
            Self {
                api_keys,
                settings,
                extra,
            },
            repairs,
        ))
    }
}

/// User-adjustable monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(
        default = "default_auto_refresh_interval",
        deserialize_with = "auto_refresh_interval_or_default"
    )]
    pub auto_refresh_interval: u64,
    #[serde(
        default = "default_alert_threshold",
        deserialize_with = "alert_threshold_or_default"
    )]
    pub alert_threshold: f64,
    #[serde(
        default = "default_history_retention_days",
        deserialize_with = "history_retention_days_or_default"
    )]
    pub history_retention_days: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_refresh_interval: DEFAULT_AUTO_REFRESH_INTERVAL_MS,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
            extra: Map::new(),
        }
    }
}

impl Settings {
    /// Retention window in days; zero means unset.
    pub fn retention_days(&self) -> u32 {
        if self.history_retention_days == 0 {
            DEFAULT_HISTORY_RETENTION_DAYS
        } else {
            self.history_retention_days
        }
    }
}

fn default_auto_refresh_interval() -> u64 {
    DEFAULT_AUTO_REFRESH_INTERVAL_MS
}

fn default_alert_threshold() -> f64 {
    DEFAULT_ALERT_THRESHOLD
}

fn default_history_retention_days() -> u32 {
    DEFAULT_HISTORY_RETENTION_DAYS
}

fn auto_refresh_interval_or_default<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    lenient::read(
        d,
        |v: Value| lenient::integer(v).and_then(|n| u64::try_from(n).ok()),
        default_auto_refresh_interval,
    )
}

fn alert_threshold_or_default<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    lenient::read(d, lenient::float, default_alert_threshold)
}

fn history_retention_days_or_default<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    lenient::read(
        d,
        |v: Value| lenient::integer(v).and_then(|n| u32::try_from(n).ok()),
        default_history_retention_days,
    )
}

/// One managed API credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    /// Plaintext secret, or an `enc:` envelope when at rest.
    pub key: String,
    #[serde(default, deserialize_with = "text_or_empty")]
    pub alias: String,
    #[serde(default = "default_group", deserialize_with = "group_or_default")]
    pub group: String,
    #[serde(default, deserialize_with = "text_or_empty")]
    pub note: String,
    #[serde(default = "default_enabled", deserialize_with = "enabled_or_default")]
    pub enabled: bool,
    /// Password required to reveal the full key.
    #[serde(
        default = "default_view_password",
        deserialize_with = "view_password_or_default"
    )]
    pub view_password: String,
}

impl Credential {
    pub fn new(id: &str, key: &str) -> Self {
        Self {
            id: id.to_string(),
            key: key.to_string(),
            alias: String::new(),
            group: default_group(),
            note: String::new(),
            enabled: true,
            view_password: default_view_password(),
        }
    }
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_view_password() -> String {
    DEFAULT_VIEW_PASSWORD.to_string()
}

fn text_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    lenient::read(d, lenient::text, String::new)
}

fn group_or_default<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    lenient::read(
        d,
        |v: Value| lenient::text(v).filter(|g| !g.trim().is_empty()),
        default_group,
    )
}

fn enabled_or_default<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    lenient::read(d, lenient::flag, default_enabled)
}

fn view_password_or_default<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    lenient::read(d, lenient::text, default_view_password)
}

/// Aggregate totals across all valid credentials at one reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub used: i64,
    pub allowance: i64,
    pub remaining: i64,
}

/// A single credential's reading within a history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReading {
    pub id: String,
    pub used: i64,
    pub allowance: i64,
    pub remaining: i64,
}

/// One point in the usage time series (`history.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub totals: UsageTotals,
    #[serde(default)]
    pub keys: Vec<KeyReading>,
}

impl HistoryEntry {
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp,
            totals: UsageTotals::default(),
            keys: Vec::new(),
        }
    }
}
