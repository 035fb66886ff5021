//! # Delivery Transport Module
//!
//! Single-shot delivery of one request to the tracking server.
//!
//! A transport performs exactly one attempt per call and classifies the
//! result; retrying is the uplink controller's job.

pub mod http;

pub use http::{HttpMethod, HttpTransport};

use async_trait::async_trait;

use crate::protocol::RequestDescriptor;

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Server acknowledged with a 2xx response
    Success,

    /// Network unreachable, timeout, 5xx, 408 or 429
    TransientFailure(String),

    /// Any other 4xx response
    PermanentFailure(String),
}

impl DeliveryOutcome {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            408 | 429 => Self::TransientFailure(format!("HTTP {}", status)),
            400..=499 => Self::PermanentFailure(format!("HTTP {}", status)),
            _ => Self::TransientFailure(format!("HTTP {}", status)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::TransientFailure(reason) | Self::PermanentFailure(reason) => Some(reason),
        }
    }
}

/// Trait for delivery transports
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Perform exactly one delivery attempt
    async fn send(&self, request: &RequestDescriptor) -> DeliveryOutcome;
}
