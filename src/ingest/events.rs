//! Storage change events and their wire envelope.
//!
//! Bucket events arrive as S3-style notification JSON, both on the message
//! queue and on the webhook route; decoding is shared between the two paths.

use serde::Deserialize;
use thiserror::Error;

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAction {
    Put,
    Delete,
}

impl ObjectAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectAction::Put => "put",
            ObjectAction::Delete => "delete",
        }
    }
}

/// A single object change extracted from a notification envelope.
///
/// Events are ephemeral; identity is the (object_key, version_id) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub object_key: String,
    pub version_id: String,
    pub action: ObjectAction,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid notification JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("notification has no records")]
    EmptyRecords,
    #[error("event '{0}' is not processed")]
    UnsupportedEvent(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "EventName")]
    event_name: String,
    #[serde(rename = "Records", default)]
    records: Vec<EnvelopeRecord>,
}

#[derive(Deserialize)]
struct EnvelopeRecord {
    s3: RecordS3,
}

#[derive(Deserialize)]
struct RecordS3 {
    object: RecordObject,
}

#[derive(Deserialize)]
struct RecordObject {
    key: String,
    #[serde(rename = "versionId", default)]
    version_id: String,
}

/// Decode a notification envelope into change events.
pub fn decode_envelope(body: &[u8]) -> Result<Vec<ChangeEvent>, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(body)?;

    let action = if envelope.event_name.starts_with("s3:ObjectCreated") {
        ObjectAction::Put
    } else if envelope.event_name.starts_with("s3:ObjectRemoved") {
        ObjectAction::Delete
    } else {
        return Err(DecodeError::UnsupportedEvent(envelope.event_name));
    };

    if envelope.records.is_empty() {
        return Err(DecodeError::EmptyRecords);
    }

    Ok(envelope
        .records
        .into_iter()
        .map(|record| {
            let raw_key = record.s3.object.key;
            // Object keys are URL-encoded in bucket notifications.
            let object_key = urlencoding::decode(&raw_key)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw_key.clone());
            ChangeEvent {
                object_key,
                version_id: record.s3.object.version_id,
                action,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_envelope(key: &str, version: &str) -> String {
        format!(
            r#"{{
                "EventName": "s3:ObjectCreated:Put",
                "Key": "media/{key}",
                "Records": [{{
                    "eventName": "s3:ObjectCreated:Put",
                    "s3": {{
                        "bucket": {{"name": "media"}},
                        "object": {{"key": "{key}", "versionId": "{version}", "size": 1024}}
                    }}
                }}]
            }}"#
        )
    }

    #[test]
    fn test_decode_put() {
        let body = put_envelope("albums%2Fsong.mp3", "v123");
        let events = decode_envelope(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ObjectAction::Put);
        assert_eq!(events[0].object_key, "albums/song.mp3");
        assert_eq!(events[0].version_id, "v123");
    }

    #[test]
    fn test_decode_delete() {
        let body = r#"{
            "EventName": "s3:ObjectRemoved:Delete",
            "Records": [{"s3": {"object": {"key": "song.mp3", "versionId": "v9"}}}]
        }"#;
        let events = decode_envelope(body.as_bytes()).unwrap();
        assert_eq!(events[0].action, ObjectAction::Delete);
        assert_eq!(events[0].version_id, "v9");
    }

    #[test]
    fn test_unsupported_event_is_not_an_envelope_error() {
        let body = r#"{
            "EventName": "s3:BucketCreated",
            "Records": [{"s3": {"object": {"key": "x"}}}]
        }"#;
        assert!(matches!(
            decode_envelope(body.as_bytes()),
            Err(DecodeError::UnsupportedEvent(_))
        ));
    }

    #[test]
    fn test_malformed_and_empty_envelopes() {
        assert!(matches!(
            decode_envelope(b"not json at all"),
            Err(DecodeError::Json(_))
        ));
        let empty = r#"{"EventName": "s3:ObjectCreated:Put", "Records": []}"#;
        assert!(matches!(
            decode_envelope(empty.as_bytes()),
            Err(DecodeError::EmptyRecords)
        ));
    }

    #[test]
    fn test_missing_version_id_defaults_empty() {
        let body = r#"{
            "EventName": "s3:ObjectCreated:Put",
            "Records": [{"s3": {"object": {"key": "song.mp3"}}}]
        }"#;
        let events = decode_envelope(body.as_bytes()).unwrap();
        assert_eq!(events[0].version_id, "");
    }
}
