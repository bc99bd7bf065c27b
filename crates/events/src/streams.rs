//! Named streams
//!
//! The closed set of streams events travel on. Every stream has a sibling
//! `<stream>.dead` receiving envelopes that exhausted retries or could not
//! be understood.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The named streams of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventStream {
    /// User lifecycle: registered, login, preferences updated
    User,
    /// Asset uploads, processing, embeddings
    Contextual,
    /// Content generation and consultations
    Ai,
    /// Market data collection and trend detection
    Market,
    /// Notification sends and briefings
    Notification,
    /// Service health and degradation signals
    System,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stream '{0}'")]
pub struct UnknownStream(pub String);

impl EventStream {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventStream::User => "user.events",
            EventStream::Contextual => "contextual.events",
            EventStream::Ai => "ai.events",
            EventStream::Market => "market.events",
            EventStream::Notification => "notification.events",
            EventStream::System => "system.events",
        }
    }

    /// Sibling stream receiving dead-lettered envelopes.
    pub fn dead_letter_name(self) -> String {
        format!("{}.dead", self.as_str())
    }

    pub const fn all() -> [EventStream; 6] {
        [
            EventStream::User,
            EventStream::Contextual,
            EventStream::Ai,
            EventStream::Market,
            EventStream::Notification,
            EventStream::System,
        ]
    }
}

impl fmt::Display for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStream {
    type Err = UnknownStream;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventStream::all()
            .into_iter()
            .find(|stream| stream.as_str() == s)
            .ok_or_else(|| UnknownStream(s.to_string()))
    }
}

impl TryFrom<String> for EventStream {
    type Error = UnknownStream;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EventStream> for String {
    fn from(stream: EventStream) -> String {
        stream.as_str().to_string()
    }
}
