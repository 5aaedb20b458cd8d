//! Shared admin password guard for mutating endpoints.
//!
//! Clients send the password in `X-Admin-Password` or as
//! `Authorization: Bearer <password>`. There are no sessions.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::routes::AppState;
use super::types::ApiMessage;
use crate::util::constant_time_eq;

pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";

fn presented_password(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(ADMIN_PASSWORD_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        return Some(value.trim());
    }
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(str::trim)
}

pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let authorized = presented_password(req.headers())
        .filter(|p| !p.is_empty())
        .map(|p| constant_time_eq(p, &state.config.admin_password))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!("Rejected {} {}: bad admin password", req.method(), req.uri().path());
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiMessage::error("Invalid admin password")),
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_dedicated_header_first() {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_PASSWORD_HEADER, HeaderValue::from_static("hunter2"));
        headers.insert("authorization", HeaderValue::from_static("Bearer other"));
        assert_eq!(presented_password(&headers), Some("hunter2"));
    }

    #[test]
    fn falls_back_to_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer hunter2"));
        assert_eq!(presented_password(&headers), Some("hunter2"));

        headers.insert("authorization", HeaderValue::from_static("Basic aGk="));
        assert_eq!(presented_password(&headers), None);
        assert_eq!(presented_password(&HeaderMap::new()), None);
    }
}
