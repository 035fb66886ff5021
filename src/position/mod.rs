//! # Position Module
//!
//! Position acquisition.
//!
//! This module handles:
//! - Position samples built from raw sensor fixes
//! - The sensor seam and the fix feed bridging platform callbacks
//! - Periodic and one-shot sampling with interval/distance filtering

pub mod geo;
pub mod sample;
pub mod sensor;
pub mod source;

pub use sample::{BatteryStatus, Fix, Position};
pub use sensor::{Accuracy, FixFeed, PositionSensor, SensorProvider};
pub use source::{PositionObserver, PositionSource, SourceConfig};
