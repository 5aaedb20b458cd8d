//! # Usage Monitor
//!
//! Tracks token usage for a set of API keys against a remote metering
//! endpoint and keeps a time series of the aggregated readings.
//!
//! ## Architecture
//!
//! ```text
//!   api ──► keys::CredentialStore ──► storage::Storage ──► Backend
//!    │          (SecretCodec)                            local | blob | kv
//!    └────► usage::UsageMonitor ──► metering endpoint
//! ```
//!
//! Keys are encrypted before they reach any backend and decrypted after every
//! load, so the API and the usage client only ever see plaintext.
//!
//! ## Modules
//! - `config`: Environment-driven process configuration
//! - `crypto`: Encrypted envelopes for secrets at rest
//! - `storage`: Backend selection, documents, and history retention
//! - `keys`: Credential management operations
//! - `usage`: Metering client and aggregation

pub mod api;
pub mod config;
pub mod crypto;
pub mod keys;
pub mod storage;
pub mod usage;
pub mod util;

pub use config::AppConfig;
pub use keys::CredentialStore;
pub use storage::Storage;
