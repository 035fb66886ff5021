//! # Geo Uplink Library
//!
//! Position sampling with a crash-safe, ordered uplink to a tracking server.
//!
//! Samples from a location sensor are encoded as OsmAnd-style HTTP requests,
//! persisted in a durable queue and delivered one at a time, oldest first,
//! with exponential backoff while the server is unreachable. A request
//! leaves the queue only after the server acknowledged it.

pub mod config;
pub mod error;
pub mod logging;
pub mod position;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod status;
pub mod transport;
pub mod uplink;

pub use session::{RemoteCommand, SessionSettings, TrackingSession};
