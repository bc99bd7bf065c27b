/*!
 * Event Envelope
 *
 * The self-contained record every event travels as. On the wire an envelope
 * is a flat map of string fields (the stream backend only stores flat maps);
 * `data` and `metadata` ride as canonical JSON strings under single keys.
 *
 * ## Wire format
 *
 * ```text
 * id             726f68b2-6bb6-4cb5-a467-80bb4fc42e16
 * stream         user.events
 * type           user.registered
 * version        1
 * timestamp      2026-01-14T09:30:12.417203+00:00
 * correlation_id cf1f6dd7-...          (optional)
 * user_id        u-42                  (optional)
 * metadata       {"source":"api"}      (optional, JSON)
 * data           {"email":"a@b.c",...} (JSON)
 * ```
 */

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::streams::EventStream;

/// Failure while turning a wire map back into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A complete event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Producer-assigned id, unique over all time
    pub id: Uuid,

    /// Stream this envelope belongs on
    pub stream: EventStream,

    /// Dotted type tag routing to handlers, e.g. `user.registered`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Schema version of `data`
    pub version: u32,

    /// Producer wall clock, informational
    pub timestamp: DateTime<Utc>,

    /// Propagated across causally linked events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Informational tenancy hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Free-form annotations; the bus adds dead-letter provenance here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    /// Typed payload, shape determined by `(type, version)`
    pub data: Value,
}

impl Envelope {
    /// New envelope with a fresh id, version 1 and the current wall clock.
    pub fn new(stream: EventStream, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            event_type: event_type.into(),
            version: 1,
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
            metadata: None,
            data,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Insert one metadata key, creating the map if needed.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
    }

    /// Flatten into the wire form. Optional fields that are `None` are
    /// omitted entirely.
    pub fn encode(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".to_string(), self.id.to_string()),
            ("stream".to_string(), self.stream.as_str().to_string()),
            ("type".to_string(), self.event_type.clone()),
            ("version".to_string(), self.version.to_string()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
        ];
        if let Some(correlation_id) = self.correlation_id {
            fields.push(("correlation_id".to_string(), correlation_id.to_string()));
        }
        if let Some(user_id) = &self.user_id {
            fields.push(("user_id".to_string(), user_id.clone()));
        }
        if let Some(metadata) = &self.metadata {
            fields.push((
                "metadata".to_string(),
                Value::Object(metadata.clone()).to_string(),
            ));
        }
        fields.push(("data".to_string(), self.data.to_string()));
        fields
    }

    /// Rebuild an envelope from the wire map. `decode(encode(e)) == e` for
    /// every well-formed envelope.
    pub fn decode(fields: &HashMap<String, String>) -> Result<Self, DecodeError> {
        fn required<'a>(
            fields: &'a HashMap<String, String>,
            name: &'static str,
        ) -> Result<&'a str, DecodeError> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(DecodeError::MissingField(name))
        }

        fn invalid(field: &'static str, reason: impl ToString) -> DecodeError {
            DecodeError::InvalidField {
                field,
                reason: reason.to_string(),
            }
        }

        let id = Uuid::parse_str(required(fields, "id")?).map_err(|e| invalid("id", e))?;
        let stream: EventStream = required(fields, "stream")?
            .parse()
            .map_err(|e| invalid("stream", e))?;
        let event_type = required(fields, "type")?.to_string();
        let version: u32 = required(fields, "version")?
            .parse()
            .map_err(|e| invalid("version", e))?;
        let timestamp = DateTime::parse_from_rfc3339(required(fields, "timestamp")?)
            .map_err(|e| invalid("timestamp", e))?
            .with_timezone(&Utc);

        let correlation_id = fields
            .get("correlation_id")
            .map(|raw| Uuid::parse_str(raw).map_err(|e| invalid("correlation_id", e)))
            .transpose()?;
        let user_id = fields.get("user_id").cloned();

        let metadata = fields
            .get("metadata")
            .map(|raw| {
                serde_json::from_str::<Map<String, Value>>(raw)
                    .map_err(|e| invalid("metadata", e))
            })
            .transpose()?;

        let data: Value = serde_json::from_str(required(fields, "data")?)
            .map_err(|e| invalid("data", e))?;

        Ok(Envelope {
            id,
            stream,
            event_type,
            version,
            timestamp,
            correlation_id,
            user_id,
            metadata,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn test_encode_decode_round_trip_minimal() {
        let envelope = Envelope::new(
            EventStream::User,
            "user.registered",
            json!({"user_id": "u-1", "email": "a@b.c", "tier": "individual_pro"}),
        );

        let decoded = Envelope::decode(&to_map(envelope.encode())).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_encode_decode_round_trip_full() {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("api"));
        metadata.insert("attempt".to_string(), json!(2));

        let envelope = Envelope::new(
            EventStream::Ai,
            "content.generation.requested",
            json!({"request_id": "r-9", "prompt": "weekly briefing"}),
        )
        .with_version(2)
        .with_correlation_id(Uuid::new_v4())
        .with_user_id("u-42")
        .with_metadata(metadata);

        let decoded = Envelope::decode(&to_map(envelope.encode())).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_optional_fields_omitted_on_wire() {
        let envelope = Envelope::new(EventStream::System, "system.health.reported", json!({}));
        let fields = to_map(envelope.encode());
        assert!(!fields.contains_key("correlation_id"));
        assert!(!fields.contains_key("user_id"));
        assert!(!fields.contains_key("metadata"));
    }

    #[test]
    fn test_decode_rejects_missing_data() {
        let envelope = Envelope::new(EventStream::User, "user.login", json!({"user_id": "u-1"}));
        let mut fields = to_map(envelope.encode());
        fields.remove("data");

        let err = Envelope::decode(&fields).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("data")));
    }

    #[test]
    fn test_decode_rejects_garbage_uuid() {
        let envelope = Envelope::new(EventStream::User, "user.login", json!({"user_id": "u-1"}));
        let mut fields = to_map(envelope.encode());
        fields.insert("id".to_string(), "not-a-uuid".to_string());

        let err = Envelope::decode(&fields).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "id", .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_stream() {
        let envelope = Envelope::new(EventStream::User, "user.login", json!({"user_id": "u-1"}));
        let mut fields = to_map(envelope.encode());
        fields.insert("stream".to_string(), "billing.events".to_string());

        assert!(Envelope::decode(&fields).is_err());
    }
}
