//! Deterministic HTTP endpoints for exercising the exchange engine.
//!
//! Every route answers the same way each time, so tests can assert on exact
//! bodies, headers and status codes.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::debug;

/// Body served by `/ok`.
pub const OK_BODY: &str = "ok";

/// Address reported by `/lookup`.
pub const PROBE_IP: &str = "130.25.90.231";

/// Delay applied by `/slow` when no `ms` is given.
pub const DEFAULT_SLOW_MS: u64 = 2_000;

#[derive(Debug, Deserialize)]
pub struct RedirectQuery {
    pub to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SlowQuery {
    pub ms: Option<u64>,
}

pub fn app() -> Router {
    Router::new()
        .route("/ok", get(ok))
        .route("/echo", post(echo))
        .route("/headers", get(headers))
        .route("/redirect", get(redirect))
        .route("/loop", get(redirect_loop))
        .route("/slow", get(slow))
        .route("/lookup", get(lookup))
        .route("/status/{code}", get(status))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn ok() -> &'static str {
    OK_BODY
}

/// Returns the request body unchanged, with the caller's content type.
async fn echo(headers: HeaderMap, body: Bytes) -> Response {
    debug!(len = body.len(), "echo");
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

/// Request headers as `[name, value]` pairs in arrival order.
async fn headers(headers: HeaderMap) -> Json<Vec<(String, String)>> {
    Json(
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
    )
}

async fn redirect(Query(query): Query<RedirectQuery>) -> Response {
    let to = query.to.unwrap_or_else(|| "/ok".to_string());
    debug!(%to, "redirect");
    (
        StatusCode::FOUND,
        [(header::LOCATION, to)],
        "redirecting",
    )
        .into_response()
}

async fn redirect_loop() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/loop")]).into_response()
}

async fn slow(Query(query): Query<SlowQuery>) -> &'static str {
    let ms = query.ms.unwrap_or(DEFAULT_SLOW_MS);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "slow"
}

/// Mimics Ubuntu's GeoIP lookup document.
async fn lookup() -> Response {
    let body = format!(
        "<Response>\n  <Ip>{PROBE_IP}</Ip>\n  <Status>OK</Status>\n  <CountryCode>IT</CountryCode>\n</Response>\n"
    );
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn status(Path(code): Path<u16>) -> Result<StatusCode, StatusCode> {
    StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_query_target_is_optional() {
        let query: RedirectQuery = serde_json::from_str("{}").unwrap();
        assert!(query.to.is_none());
        let query: RedirectQuery = serde_json::from_str(r#"{"to":"/status/204"}"#).unwrap();
        assert_eq!(query.to.as_deref(), Some("/status/204"));
    }

    #[test]
    fn slow_query_accepts_milliseconds() {
        let query: SlowQuery = serde_json::from_str(r#"{"ms":25}"#).unwrap();
        assert_eq!(query.ms, Some(25));
    }
}
