//! HTTP API for the usage monitor.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check with storage mode
//! - `GET /api/storage` - Active storage backend
//! - `GET /api/data` - Query every enabled key and record a history point
//! - `GET /api/config` - Configuration with masked keys
//! - `POST /api/config` - Replace the configuration (admin)
//! - `POST /api/keys` - Add a key (admin)
//! - `PUT /api/keys/{id}` - Update a key (admin)
//! - `DELETE /api/keys/{id}` - Delete a key (admin)
//! - `POST /api/keys/batch-update` - Update several keys (admin)
//! - `POST /api/keys/batch-delete` - Delete several keys (admin)
//! - `POST /api/keys/import` - Import raw keys (admin)
//! - `POST /api/keys/{id}/reveal` - Full key, guarded by its view password
//! - `GET /api/history` - Usage history
//! - `POST /api/test-key` - Query one arbitrary key (admin)

mod auth;
mod keys;
mod routes;
pub mod types;

pub use routes::{app, serve, AppState};
pub use types::*;
