//! netpulse-core: Shared types, configuration, and error handling for NetPulse.
//!
//! This crate provides the foundational types used across all NetPulse
//! components:
//! - Inventory types (Device, Port, ScanTask, ScanRecord, Event)
//! - Observation types produced by the scan result normalizer
//! - Typed configuration loaded from file + environment
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use config::NetPulseConfig;
pub use error::CoreError;
