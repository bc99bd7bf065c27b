/*!
 * Schema Registry
 *
 * Authoritative table of every event type the platform understands, keyed by
 * `(type, version)`. The registry is closed at process start: unknown types
 * are rejected on publish and on consume, and a higher version than the one
 * registered is rejected (never silently skipped), so it ends up on the
 * dead-letter stream where an operator can see it.
 *
 * Adding a new event is one registry entry plus one handler.
 */

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::streams::EventStream;

/// Why a payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    UnknownType,
    UnsupportedVersion,
    InvalidPayload,
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationCode::UnknownType => "UNKNOWN_TYPE",
            ValidationCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ValidationCode::InvalidPayload => "INVALID_PAYLOAD",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {details}")]
pub struct ValidationError {
    pub code: ValidationCode,
    pub details: String,
}

impl ValidationError {
    fn new(code: ValidationCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }
}

/// One accepted `(type, version)` payload shape.
#[derive(Debug, Clone)]
struct EventSchema {
    stream: EventStream,
    required: &'static [&'static str],
}

/// Closed table of accepted event schemas.
///
/// Build with [`SchemaRegistry::with_defaults`], optionally [`register`]
/// additional entries, then share immutably (`Arc`) — registration after
/// startup is a design smell, not a supported operation.
///
/// [`register`]: SchemaRegistry::register
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(String, u32), EventSchema>,
    known_types: HashSet<String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every platform event type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // user.events
        registry.register(EventStream::User, "user.registered", 1, &["user_id", "email", "tier"]);
        registry.register(EventStream::User, "user.login", 1, &["user_id"]);
        registry.register(EventStream::User, "user.preferences.updated", 1, &["user_id", "preferences"]);

        // contextual.events
        registry.register(EventStream::Contextual, "asset.uploaded", 1, &["asset_id", "user_id", "content_type"]);
        registry.register(EventStream::Contextual, "asset.processing.started", 1, &["asset_id"]);
        registry.register(EventStream::Contextual, "asset.processing.completed", 1, &["asset_id", "status"]);
        registry.register(EventStream::Contextual, "embedding.requested", 1, &["asset_id", "content_hash"]);
        registry.register(EventStream::Contextual, "embedding.completed", 1, &["asset_id"]);

        // ai.events
        registry.register(EventStream::Ai, "content.generation.requested", 1, &["request_id", "user_id", "prompt"]);
        registry.register(EventStream::Ai, "content.generation.completed", 1, &["request_id", "status"]);
        registry.register(EventStream::Ai, "consultation.requested", 1, &["consultation_id", "user_id", "topic"]);
        registry.register(EventStream::Ai, "consultation.completed", 1, &["consultation_id", "status"]);

        // market.events
        registry.register(EventStream::Market, "market.collection.started", 1, &["collection_id", "source"]);
        registry.register(EventStream::Market, "market.data.collected", 1, &["collection_id", "source", "record_count"]);
        registry.register(EventStream::Market, "market.trend.detected", 1, &["trend_id", "topic", "confidence"]);

        // notification.events
        registry.register(EventStream::Notification, "notification.requested", 1, &["notification_id", "user_id", "channel"]);
        registry.register(EventStream::Notification, "notification.delivered", 1, &["notification_id", "channel"]);
        registry.register(EventStream::Notification, "briefing.scheduled", 1, &["briefing_id", "user_id", "scheduled_for"]);

        // system.events
        registry.register(EventStream::System, "system.health.reported", 1, &["service", "status"]);
        registry.register(EventStream::System, "system.error.critical", 1, &["service", "error"]);
        registry.register(EventStream::System, "system.performance.degraded", 1, &["service", "metric"]);

        registry
    }

    /// Register one `(type, version)` schema. Only call during startup,
    /// before the registry is shared.
    pub fn register(
        &mut self,
        stream: EventStream,
        event_type: &str,
        version: u32,
        required: &'static [&'static str],
    ) {
        self.known_types.insert(event_type.to_string());
        self.schemas
            .insert((event_type.to_string(), version), EventSchema { stream, required });
    }

    /// Validate a payload against the registered schema for
    /// `(event_type, version)`.
    pub fn validate(
        &self,
        event_type: &str,
        version: u32,
        data: &Value,
    ) -> Result<(), ValidationError> {
        if !self.known_types.contains(event_type) {
            return Err(ValidationError::new(
                ValidationCode::UnknownType,
                format!("event type '{event_type}' is not registered"),
            ));
        }

        let Some(schema) = self.schemas.get(&(event_type.to_string(), version)) else {
            return Err(ValidationError::new(
                ValidationCode::UnsupportedVersion,
                format!("event type '{event_type}' has no schema for version {version}"),
            ));
        };

        let Some(object) = data.as_object() else {
            return Err(ValidationError::new(
                ValidationCode::InvalidPayload,
                format!("payload for '{event_type}' v{version} must be a JSON object"),
            ));
        };

        for field in schema.required {
            match object.get(*field) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::new(
                        ValidationCode::InvalidPayload,
                        format!("payload for '{event_type}' v{version} is missing '{field}'"),
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Full envelope validation: payload schema plus stream membership.
    pub fn validate_envelope(&self, envelope: &Envelope) -> Result<(), ValidationError> {
        self.validate(&envelope.event_type, envelope.version, &envelope.data)?;

        let schema = &self.schemas[&(envelope.event_type.clone(), envelope.version)];
        if schema.stream != envelope.stream {
            return Err(ValidationError::new(
                ValidationCode::InvalidPayload,
                format!(
                    "event type '{}' belongs on '{}', not '{}'",
                    envelope.event_type, schema.stream, envelope.stream
                ),
            ));
        }
        Ok(())
    }

    /// Stream a type's current schema lives on, if the type is known.
    pub fn stream_of(&self, event_type: &str, version: u32) -> Option<EventStream> {
        self.schemas
            .get(&(event_type.to_string(), version))
            .map(|s| s.stream)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
