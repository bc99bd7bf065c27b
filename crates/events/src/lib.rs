//! # Beacon Events
//!
//! The typed event contract shared by producers and consumers:
//! - the closed set of named streams ([`EventStream`])
//! - the event envelope and its flat string-map wire codec ([`Envelope`])
//! - the `(type, version)` schema registry validating payloads on publish
//!   and on consume ([`SchemaRegistry`])

pub mod envelope;
pub mod registry;
pub mod streams;

pub use envelope::{DecodeError, Envelope};
pub use registry::{SchemaRegistry, ValidationCode, ValidationError};
pub use streams::EventStream;
