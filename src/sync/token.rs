use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Header carrying the checkpoint in both directions.
pub const SYNC_TOKEN_HEADER: &str = "X-Kobo-SyncToken";

/// Checkpoint token as exchanged with the device: base64-encoded JSON.
///
/// `lastSuccessfulSyncPointId` holds the highest library revision the device has fully
/// received, in decimal. `rawKoboSyncToken` belongs to the vendor store and is passed
/// through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncToken {
    /// Last fully delivered revision.
    #[serde(default)]
    pub last_successful_sync_point_id: Option<String>,
    /// Unused; always cleared on issue.
    #[serde(default)]
    pub ongoing_sync_point_id: Option<String>,
    /// Opaque vendor token.
    #[serde(default)]
    pub raw_kobo_sync_token: Option<String>,
}

impl SyncToken {
    /// Decode a header value. Absent or malformed input yields an empty token.
    pub fn decode(header: Option<&str>) -> Self {
        let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) else {
            return Self::default();
        };
        match STANDARD
            .decode(value)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<SyncToken>(&bytes).ok())
        {
            Some(token) => token,
            None => {
                tracing::debug!("Malformed sync token, starting full sync");
                Self::default()
            }
        }
    }

    /// Encode for the response header.
    pub fn encode(&self) -> String {
        // Serializing three optional strings cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Baseline revision; 0 (full sync) when missing, non-numeric or negative.
    pub fn baseline_revision(&self) -> i64 {
        self.last_successful_sync_point_id
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|r| *r >= 0)
            .unwrap_or(0)
    }

    /// Token for the next exchange, keeping the vendor token.
    pub fn advanced_to(&self, revision: i64) -> Self {
        Self {
            last_successful_sync_point_id: Some(revision.to_string()),
            ongoing_sync_point_id: None,
            raw_kobo_sync_token: self.raw_kobo_sync_token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_or_garbage_is_full_sync() {
        assert_eq!(SyncToken::decode(None).baseline_revision(), 0);
        assert_eq!(SyncToken::decode(Some("")).baseline_revision(), 0);
        assert_eq!(SyncToken::decode(Some("!!not base64!!")).baseline_revision(), 0);
        let not_json = STANDARD.encode(b"hello");
        assert_eq!(SyncToken::decode(Some(&not_json)).baseline_revision(), 0);
    }

    #[test]
    fn non_numeric_checkpoint_is_full_sync() {
        let token = SyncToken {
            last_successful_sync_point_id: Some("2024-01-01T00:00:00+00:00".into()),
            ..Default::default()
        };
        let decoded = SyncToken::decode(Some(&token.encode()));
        assert_eq!(decoded.baseline_revision(), 0);

        let negative = SyncToken {
            last_successful_sync_point_id: Some("-4".into()),
            ..Default::default()
        };
        assert_eq!(negative.baseline_revision(), 0);
    }

    #[test]
    fn wire_format_uses_camel_case_keys() {
        let token = SyncToken::default().advanced_to(7);
        let json = String::from_utf8(STANDARD.decode(token.encode()).unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"lastSuccessfulSyncPointId":"7","ongoingSyncPointId":null,"rawKoboSyncToken":null}"#
        );
    }

    #[test]
    fn vendor_token_is_preserved() {
        let incoming = SyncToken {
            last_successful_sync_point_id: Some("3".into()),
            ongoing_sync_point_id: Some("x".into()),
            raw_kobo_sync_token: Some("vendor".into()),
        };
        let decoded = SyncToken::decode(Some(&incoming.encode()));
        assert_eq!(decoded.baseline_revision(), 3);

        let next = decoded.advanced_to(9);
        assert_eq!(next.raw_kobo_sync_token.as_deref(), Some("vendor"));
        assert!(next.ongoing_sync_point_id.is_none());
        assert_eq!(next.baseline_revision(), 9);
    }
}
