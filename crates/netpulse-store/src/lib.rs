//! netpulse-store: durable device inventory for NetPulse.
//!
//! Wraps an embedded SQLite database holding devices, ports, scan tasks,
//! scan results, events, an OUI vendor cache, and runtime key-value
//! configuration. Reconciliation semantics (last-write-wins upserts,
//! monotonic task transitions) live here; callers own event emission.

pub mod error;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use store::DeviceStore;
