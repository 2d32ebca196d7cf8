//! Gmail API response normalization
//!
//! Converts Gmail API responses to [`MessageRecord`]s. Decode trouble never
//! drops a message: missing headers become empty strings, an undecodable
//! body becomes empty text, invalid UTF-8 is replaced.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};
use log::warn;

use super::api::{GmailMessage, MessagePart, MessagePayload};
use crate::models::{MessageRecord, decode_body_lossy};

/// Normalize a raw Gmail API message to a MessageRecord
///
/// The raw JSON is kept as the record's audit payload.
pub fn normalize_message(raw: serde_json::Value) -> Result<MessageRecord> {
    let gmail_msg: GmailMessage =
        serde_json::from_value(raw.clone()).context("Unexpected Gmail message shape")?;

    let payload = gmail_msg.payload.as_ref();

    let subject = payload
        .and_then(|p| extract_header(p, "Subject"))
        .unwrap_or_default();
    let sender = payload
        .and_then(|p| extract_header(p, "From"))
        .unwrap_or_default();

    let received_at = received_at(&gmail_msg).unwrap_or_else(|| {
        warn!(
            "Message {} has no usable timestamp, recording it at the Unix epoch",
            gmail_msg.id
        );
        DateTime::UNIX_EPOCH
    });

    let body = payload.and_then(extract_plain_text_body).unwrap_or_default();

    Ok(MessageRecord::builder(gmail_msg.id.as_str())
        .subject(subject)
        .sender(sender)
        .received_at(received_at)
        .body(body)
        .raw_payload(raw)
        .build())
}

/// Receive time: internalDate (ms since epoch), then the Date header
fn received_at(gmail_msg: &GmailMessage) -> Option<DateTime<Utc>> {
    if let Some(millis) = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        && let Some(ts) = Utc.timestamp_millis_opt(millis).single()
    {
        return Some(ts);
    }

    let date = gmail_msg
        .payload
        .as_ref()
        .and_then(|p| extract_header(p, "Date"))?;
    DateTime::parse_from_rfc2822(date.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

fn is_plain_text(mime_type: Option<&String>) -> bool {
    mime_type.is_some_and(|m| m.starts_with("text/plain"))
}

/// Extract plain text body from message payload
fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    // Simple single-part message
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && is_plain_text(payload.mime_type.as_ref())
    {
        return decode_base64_body(data);
    }

    if let Some(parts) = &payload.parts
        && let Some(text) = find_plain_text_in_parts(parts)
    {
        return Some(text);
    }

    // Fall back to whatever the top-level body holds
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
    {
        return decode_base64_body(data);
    }

    None
}

/// Recursively search message parts for text/plain content
fn find_plain_text_in_parts(parts: &[MessagePart]) -> Option<String> {
    for part in parts {
        if is_plain_text(part.mime_type.as_ref())
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_plain_text_in_parts(nested)
        {
            return Some(text);
        }
    }

    None
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple
/// decoders. Bytes that are not valid UTF-8 are replaced, not rejected.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders
        .iter()
        .find_map(|decoder| decoder.decode(data).ok())
        .map(|bytes| decode_body_lossy(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::api::{Header, MessageBody};
    use serde_json::json;

    fn make_test_payload(headers: Vec<(&str, &str)>) -> MessagePayload {
        MessagePayload {
            headers: Some(
                headers
                    .into_iter()
                    .map(|(n, v)| Header {
                        name: n.to_string(),
                        value: v.to_string(),
                    })
                    .collect(),
            ),
            body: Some(MessageBody { data: None }),
            parts: None,
            mime_type: Some("text/plain".to_string()),
        }
    }

    #[test]
    fn test_extract_header_case_insensitive() {
        let payload = make_test_payload(vec![("FROM", "test@example.com")]);
        assert_eq!(
            extract_header(&payload, "from"),
            Some("test@example.com".to_string())
        );
        assert_eq!(extract_header(&payload, "Cc"), None);
    }

    #[test]
    fn test_decode_base64_body() {
        // "Hello, World!" in base64url
        let decoded = decode_base64_body("SGVsbG8sIFdvcmxkIQ");
        assert_eq!(decoded, Some("Hello, World!".to_string()));
    }

    #[test]
    fn test_decode_base64_body_replaces_invalid_utf8() {
        // bytes: 'o', 'k', 0xFF
        let encoded = BASE64_URL_SAFE_NO_PAD.encode([b'o', b'k', 0xff]);
        assert_eq!(decode_base64_body(&encoded), Some("ok\u{FFFD}".to_string()));
    }

    #[test]
    fn test_normalize_multipart_message() {
        let raw = json!({
            "id": "18c2",
            "threadId": "18c2",
            "internalDate": "1704103200789",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    { "name": "Subject", "value": "Invoice" },
                    { "name": "From", "value": "Billing <billing@example.com>" }
                ],
                "parts": [
                    { "mimeType": "text/html", "body": { "data": "PGI-aGk8L2I-" } },
                    { "mimeType": "text/plain", "body": { "data": "SGVsbG8sIFdvcmxkIQ" } }
                ]
            }
        });

        let record = normalize_message(raw.clone()).unwrap();
        assert_eq!(record.id.as_str(), "18c2");
        assert_eq!(record.subject, "Invoice");
        assert_eq!(record.sender, "Billing <billing@example.com>");
        assert_eq!(record.body, "Hello, World!");
        assert_eq!(record.received_at.timestamp(), 1_704_103_200);
        assert_eq!(record.raw_payload, raw);
        assert!(!record.processed);
    }

    #[test]
    fn test_normalize_falls_back_to_date_header() {
        let raw = json!({
            "id": "m1",
            "payload": {
                "headers": [
                    { "name": "Date", "value": "Mon, 1 Jan 2024 11:00:00 +0000" }
                ]
            }
        });

        let record = normalize_message(raw).unwrap();
        assert_eq!(
            record.received_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
        );
        assert_eq!(record.subject, "");
        assert_eq!(record.body, "");
    }

    #[test]
    fn test_normalize_without_timestamp_uses_epoch() {
        let record = normalize_message(json!({ "id": "m1" })).unwrap();
        assert_eq!(record.received_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_normalize_rejects_missing_id() {
        assert!(normalize_message(json!({ "payload": {} })).is_err());
    }
}
