//! netpulse-scan: scan task lifecycle and device reconciliation for NetPulse.
//!
//! Wraps nmap to scan targets, normalizes its XML output into the
//! canonical device model, classifies devices, and reconciles them into
//! the inventory. Scheduling, bounded-concurrency execution, OUI
//! updates, alerting, and export live here too.

pub mod alerts;
pub mod classify;
pub mod error;
pub mod export;
pub mod invoke;
pub mod nmap_xml;
pub mod normalize;
pub mod oui;
pub mod pipeline;
pub mod scheduler;
pub mod worker;

pub use classify::DeviceClassifier;
pub use error::ScanError;
pub use invoke::NmapInvoker;
pub use pipeline::ScanPipeline;
pub use scheduler::ScanScheduler;
pub use worker::WorkerPool;
