//! Passthrough to the Kobo store API.
//!
//! Devices pointed at this server still expect the store for purchases, wishlists and
//! their store library. Anything not answered locally is relayed, and library syncs
//! merge the store's entitlements after the local ones.

use crate::config::StoreConfig;
use crate::error::{AppError, Result};
use crate::sync::SYNC_TOKEN_HEADER;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::Value;
use std::time::Duration;

/// Header the store uses to announce another sync page.
pub const SYNC_CONTINUE_HEADER: &str = "X-Kobo-Sync";

/// Relayed store response.
#[derive(Debug)]
pub struct StoreResponse {
    /// Upstream status.
    pub status: StatusCode,
    /// `x-kobo-*` and `content-type` headers from the store.
    pub headers: HeaderMap,
    /// Raw body.
    pub body: Bytes,
}

/// The store's part of a library sync.
#[derive(Debug, Default)]
pub struct StoreSync {
    /// Store entitlements, passed on to the device untouched.
    pub entitlements: Vec<Value>,
    /// Store checkpoint to keep in the composite token.
    pub sync_token: Option<String>,
    /// Whether the store has another page.
    pub more: bool,
}

/// HTTP client for the store API.
#[derive(Clone)]
pub struct StoreProxy {
    client: reqwest::Client,
    base_url: String,
}

impl StoreProxy {
    /// Build a client from the store settings.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Forward one request to the store.
    ///
    /// `vendor_token` becomes the upstream `X-Kobo-SyncToken`; the device's own composite
    /// token never leaves this server.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
        vendor_token: Option<&str>,
    ) -> Result<StoreResponse> {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        tracing::debug!(method = %method, url = %url, "Forwarding to store");

        let mut request = self
            .client
            .request(method, &url)
            .headers(upstream_headers(headers, vendor_token));
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = downstream_headers(response.headers());
        let body = response.bytes().await?;

        Ok(StoreResponse {
            status,
            headers,
            body,
        })
    }

    /// Fetch the store's library sync page. `None` when the store declined.
    pub async fn library_sync(
        &self,
        headers: &HeaderMap,
        vendor_token: Option<&str>,
    ) -> Result<Option<StoreSync>> {
        let response = self
            .forward(
                Method::GET,
                "/v1/library/sync",
                None,
                headers,
                Bytes::new(),
                vendor_token,
            )
            .await?;

        if response.status != StatusCode::OK {
            tracing::debug!(status = %response.status, "Store library sync declined");
            return Ok(None);
        }

        let entitlements: Vec<Value> = serde_json::from_slice(&response.body)
            .map_err(|e| AppError::InvalidFormat(format!("store sync body: {}", e)))?;
        let header_str = |name: &str| {
            response
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Ok(Some(StoreSync {
            entitlements,
            sync_token: header_str(SYNC_TOKEN_HEADER),
            more: header_str(SYNC_CONTINUE_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("continue")),
        }))
    }
}

fn is_kobo_header(name: &HeaderName) -> bool {
    name.as_str().starts_with("x-kobo-")
}

/// Device headers the store needs: credentials, client identity and `x-kobo-*`.
fn upstream_headers(incoming: &HeaderMap, vendor_token: Option<&str>) -> HeaderMap {
    let sync_token = HeaderName::from_static("x-kobo-synctoken");
    let mut headers = HeaderMap::new();

    for (name, value) in incoming {
        let keep = [
            header::AUTHORIZATION,
            header::USER_AGENT,
            header::ACCEPT,
            header::ACCEPT_LANGUAGE,
        ]
        .contains(name)
            || (is_kobo_header(name) && *name != sync_token);
        if keep {
            headers.append(name.clone(), value.clone());
        }
    }

    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(token) = vendor_token {
        match HeaderValue::from_str(token) {
            Ok(value) => {
                headers.insert(sync_token, value);
            }
            Err(_) => tracing::debug!("Dropping unprintable store sync token"),
        }
    }
    headers
}

/// Store headers worth relaying back to the device.
fn downstream_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if is_kobo_header(name) || *name == header::CONTENT_TYPE {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn forwards_identity_and_kobo_headers_only() {
        let incoming = headers(&[
            ("authorization", "Bearer device"),
            ("user-agent", "Kobo Touch"),
            ("host", "192.168.1.10:8000"),
            ("cookie", "session=1"),
            ("x-kobo-deviceid", "abc"),
            ("x-kobo-synctoken", "composite"),
            ("content-type", "text/plain"),
        ]);
        let out = upstream_headers(&incoming, Some("vendor"));

        assert_eq!(out["authorization"], "Bearer device");
        assert_eq!(out["user-agent"], "Kobo Touch");
        assert_eq!(out["x-kobo-deviceid"], "abc");
        assert_eq!(out["x-kobo-synctoken"], "vendor");
        assert_eq!(out["content-type"], "application/json");
        assert!(out.get("host").is_none());
        assert!(out.get("cookie").is_none());
    }

    #[test]
    fn composite_token_is_not_leaked_without_vendor_token() {
        let incoming = headers(&[("x-kobo-synctoken", "composite")]);
        let out = upstream_headers(&incoming, None);
        assert!(out.get("x-kobo-synctoken").is_none());
    }

    #[test]
    fn relays_kobo_and_content_type_headers() {
        let upstream = headers(&[
            ("content-type", "application/json"),
            ("x-kobo-sync", "continue"),
            ("set-cookie", "a=b"),
            ("content-length", "12"),
        ]);
        let out = downstream_headers(&upstream);
        assert_eq!(out.len(), 2);
        assert_eq!(out["x-kobo-sync"], "continue");
    }
}
