//! Kobo store API handlers (the subset a device needs to sync a library).
//!
//! Requests for anything the local library does not own are relayed to the store.

use crate::db::{ReadingState, now_timestamp, timestamp_to_datetime};
use crate::error::{AppError, Result};
use crate::server::AppState;
use crate::server::proxy::SYNC_CONTINUE_HEADER;
use crate::sync::{SYNC_TOKEN_HEADER, render_delta};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Relay a request to the store, or 404 when passthrough is off.
///
/// Upstream failures become a 502 with a JSON body the device tolerates.
async fn relay_to_store(
    state: &AppState,
    method: Method,
    path: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let Some(store) = &state.store else {
        return Err(AppError::NotFound(format!("No local handler for {}", path)));
    };

    match store
        .forward(method, path, uri.query(), headers, body, None)
        .await
    {
        Ok(upstream) => {
            let mut response = (upstream.status, upstream.body).into_response();
            let headers = response.headers_mut();
            headers.remove(header::CONTENT_TYPE);
            for (name, value) in &upstream.headers {
                // Store checkpoints only travel inside the composite token
                if name.as_str() != "x-kobo-synctoken" {
                    headers.append(name.clone(), value.clone());
                }
            }
            Ok(response)
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Store request failed");
            Ok((
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Proxy failed", "detail": e.to_string()})),
            )
                .into_response())
        }
    }
}

/// Everything under the device URL without a local handler.
pub async fn store_passthrough(
    State(state): State<AppState>,
    Path((token, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.sync.authenticate(&token)?;
    relay_to_store(&state, method, &format!("/{}", path), &uri, &headers, body).await
}

/// Device resource map.
pub async fn initialization(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.sync.authenticate(&token)?;
    let base = state.base_url(&headers);

    Ok(Json(json!({
        "Resources": {
            "image_host": format!("{}/images", base),
            "image_url_template":
                format!("{}/images/{{ImageId}}/{{Width}}/{{Height}}/False/img.jpg", base),
        }
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceAuthRequest {
    #[serde(default)]
    user_key: Option<String>,
}

/// Device authentication; the path token already identifies the user.
pub async fn auth_device(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    state.sync.authenticate(&token)?;
    let request: DeviceAuthRequest = serde_json::from_slice(&body).unwrap_or_default();

    Ok(Json(json!({
        "AccessToken": "ACCESS_TOKEN",
        "RefreshToken": "REFRESH_TOKEN",
        "TokenType": "Bearer",
        "TrackingId": uuid::Uuid::new_v4().to_string(),
        "UserKey": request.user_key.unwrap_or_else(|| "local-user".to_string()),
    })))
}

/// Library sync: entitlements past the device checkpoint.
pub async fn library_sync(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let incoming = headers
        .get(SYNC_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let reconciler = state.sync.clone();
    let exchange = tokio::task::spawn_blocking(move || {
        reconciler.exchange(&token, incoming.as_deref())
    })
    .await
    .map_err(|e| AppError::Internal(format!("sync task failed: {}", e)))??;

    let items = render_delta(&exchange.delta, &state.base_url(&headers));
    let mut entries = match serde_json::to_value(&items) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => Vec::new(),
        Err(e) => return Err(AppError::Internal(format!("sync items: {}", e))),
    };
    let mut token = exchange.token;
    let mut more = exchange.delta.has_more;

    // Local entitlements first, then the store's; local revisions stay in the checkpoint
    if let Some(store) = &state.store {
        match store
            .library_sync(&headers, token.raw_kobo_sync_token.as_deref())
            .await
        {
            Ok(Some(remote)) => {
                tracing::debug!(count = remote.entitlements.len(), "Store entitlements merged");
                entries.extend(remote.entitlements);
                if remote.sync_token.is_some() {
                    token.raw_kobo_sync_token = remote.sync_token;
                }
                more |= remote.more;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Store sync failed, serving local library only"),
        }
    }

    let mut response = Json(entries).into_response();
    let token_value = HeaderValue::from_str(&token.encode())
        .map_err(|e| AppError::Internal(format!("invalid sync token header: {}", e)))?;
    response.headers_mut().insert(SYNC_TOKEN_HEADER, token_value);
    if more {
        response
            .headers_mut()
            .insert(SYNC_CONTINUE_HEADER, HeaderValue::from_static("continue"));
    }

    Ok(response)
}

/// Reading state in the Kobo wire shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KoboReadingState {
    /// Book id.
    #[serde(default)]
    pub entitlement_id: Option<String>,
    /// Reading status.
    #[serde(default)]
    pub status_info: StatusInfo,
    /// Reading statistics.
    #[serde(default)]
    pub statistics: Statistics,
    /// Current position.
    #[serde(default)]
    pub current_bookmark: CurrentBookmark,
}

/// `StatusInfo` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusInfo {
    /// `Unread`, `Reading` or `Finished`.
    #[serde(default = "default_status")]
    pub status: String,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl Default for StatusInfo {
    fn default() -> Self {
        Self {
            status: default_status(),
            last_modified: None,
        }
    }
}

fn default_status() -> String {
    "Unread".to_string()
}

/// `Statistics` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statistics {
    /// Minutes spent reading.
    #[serde(default)]
    pub spent_reading_minutes: i64,
    /// Estimated minutes left.
    #[serde(default)]
    pub remaining_time_minutes: i64,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub last_modified: Option<String>,
}

/// `CurrentBookmark` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CurrentBookmark {
    /// Progress in percent.
    #[serde(default)]
    pub progress_percent: f64,
    /// Position inside the book.
    #[serde(default)]
    pub location: Option<Location>,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub last_modified: Option<String>,
}

/// Bookmark location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    /// Position value.
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
    /// Position kind.
    #[serde(rename = "Type", default)]
    pub kind: Option<String>,
    /// Position source.
    #[serde(rename = "Source", default)]
    pub source: Option<String>,
}

impl KoboReadingState {
    fn from_stored(book_id: &str, stored: Option<&ReadingState>) -> Self {
        let Some(s) = stored else {
            return Self {
                entitlement_id: Some(book_id.to_string()),
                ..Default::default()
            };
        };
        let modified = Some(timestamp_to_datetime(s.updated_at).to_rfc3339());
        let location = (s.location_value.is_some()
            || s.location_type.is_some()
            || s.location_source.is_some())
        .then(|| Location {
            value: s.location_value.clone(),
            kind: s.location_type.clone(),
            source: s.location_source.clone(),
        });

        Self {
            entitlement_id: Some(book_id.to_string()),
            status_info: StatusInfo {
                status: s.status.clone(),
                last_modified: modified.clone(),
            },
            statistics: Statistics {
                spent_reading_minutes: s.spent_reading_minutes,
                remaining_time_minutes: s.remaining_time_minutes,
                last_modified: modified.clone(),
            },
            current_bookmark: CurrentBookmark {
                progress_percent: s.progress_percent,
                location,
                last_modified: modified,
            },
        }
    }

    fn to_stored(&self, book_id: &str) -> ReadingState {
        let location = self.current_bookmark.location.clone().unwrap_or_default();
        ReadingState {
            book_id: book_id.to_string(),
            status: self.status_info.status.clone(),
            progress_percent: self.current_bookmark.progress_percent.clamp(0.0, 100.0),
            location_value: location.value,
            location_type: location.kind,
            location_source: location.source,
            spent_reading_minutes: self.statistics.spent_reading_minutes,
            remaining_time_minutes: self.statistics.remaining_time_minutes,
            updated_at: now_timestamp(),
        }
    }
}

/// Reading state update body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReadingStatesUpdate {
    #[serde(default)]
    reading_states: Vec<KoboReadingState>,
}

/// Whether a book id belongs to the store rather than the local catalog.
fn is_store_book(state: &AppState, book_id: &str) -> Result<bool> {
    Ok(state.store.is_some() && state.db.get_book(book_id)?.is_none())
}

/// Get the stored reading state for a book.
pub async fn get_reading_state(
    State(state): State<AppState>,
    Path((token, book_id)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    state.sync.authenticate(&token)?;
    if is_store_book(&state, &book_id)? {
        let path = format!("/v1/library/{}/state", book_id);
        return relay_to_store(&state, Method::GET, &path, &uri, &headers, Bytes::new()).await;
    }

    let book = state.live_book(&book_id)?;
    let stored = state.db.get_reading_state(&book.id)?;

    Ok(Json(vec![KoboReadingState::from_stored(
        &book.id,
        stored.as_ref(),
    )])
    .into_response())
}

/// Store the reading state a device reports.
pub async fn put_reading_state(
    State(state): State<AppState>,
    Path((token, book_id)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    raw: Bytes,
) -> Result<Response> {
    state.sync.authenticate(&token)?;
    if is_store_book(&state, &book_id)? {
        let path = format!("/v1/library/{}/state", book_id);
        return relay_to_store(&state, Method::PUT, &path, &uri, &headers, raw).await;
    }

    let book = state.live_book(&book_id)?;
    let body: Value = serde_json::from_slice(&raw)
        .map_err(|e| AppError::InvalidFormat(format!("Invalid reading state: {}", e)))?;
    let update: ReadingStatesUpdate = serde_json::from_value(body.clone())
        .map_err(|e| AppError::InvalidFormat(format!("Invalid reading state: {}", e)))?;
    let Some(reported) = update.reading_states.first() else {
        return Err(AppError::InvalidFormat("No reading state provided".to_string()));
    };

    let stored = reported.to_stored(&book.id);
    state.db.save_reading_state(&stored)?;
    tracing::debug!(
        book_id = %book.id,
        status = %stored.status,
        progress = stored.progress_percent,
        "Reading state saved"
    );

    Ok(Json(body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_defaults_to_unread() {
        let state = KoboReadingState::from_stored("b1", None);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["EntitlementId"], "b1");
        assert_eq!(json["StatusInfo"]["Status"], "Unread");
        assert_eq!(json["CurrentBookmark"]["ProgressPercent"], 0.0);
    }

    #[test]
    fn reported_state_maps_to_store() {
        let body = json!({
            "ReadingStates": [{
                "EntitlementId": "b1",
                "StatusInfo": {"Status": "Reading"},
                "Statistics": {"SpentReadingMinutes": 12, "RemainingTimeMinutes": 40},
                "CurrentBookmark": {
                    "ProgressPercent": 23.5,
                    "Location": {"Value": "span#kobo.3.1", "Type": "KoboSpan", "Source": "ch1.xhtml"}
                }
            }]
        });
        let update: ReadingStatesUpdate = serde_json::from_value(body).unwrap();
        let stored = update.reading_states[0].to_stored("b1");

        assert_eq!(stored.status, "Reading");
        assert_eq!(stored.progress_percent, 23.5);
        assert_eq!(stored.spent_reading_minutes, 12);
        assert_eq!(stored.location_type.as_deref(), Some("KoboSpan"));

        let back = KoboReadingState::from_stored("b1", Some(&stored));
        let location = back.current_bookmark.location.unwrap();
        assert_eq!(location.value.as_deref(), Some("span#kobo.3.1"));
    }
}
