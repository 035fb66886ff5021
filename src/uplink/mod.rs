//! # Uplink Module
//!
//! Reliable, ordered delivery of queued requests.
//!
//! This module handles:
//! - Bounded exponential backoff between failed attempts
//! - The single-flight controller that drains the durable queue

pub mod backoff;
pub mod controller;

pub use backoff::{BackoffPolicy, DEFAULT_RETRY_BASE, DEFAULT_RETRY_MAX};
pub use controller::{DeliverySlot, UplinkController, UplinkHandle, UplinkState, UplinkWaker};
