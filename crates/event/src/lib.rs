#![warn(missing_docs)]

//! # Archflow Event
//!
//! The structured event model every subsystem publishes through:
//!
//! - [`ArchflowEvent`] — the envelope (domain × type × execution id ×
//!   sequence × timestamp) wrapping a domain-specific data map
//! - [`EventDomain`] / [`EventType`] — the closed enumerations of the wire
//!   protocol
//! - [`sse`] — server-sent-events framing used by the streaming endpoints
//!
//! Events are projections: dropping one never affects execution outcome.

pub mod envelope;
pub mod sse;

pub use envelope::{ArchflowEvent, EventDomain, EventType};
