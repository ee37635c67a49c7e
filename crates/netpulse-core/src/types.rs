//! Core domain types for the NetPulse device inventory.
//!
//! These types flow between the scan pipeline, the persistent store, and
//! the HTTP API. Inventory rows are keyed by SQLite rowids (`i64`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Scan tasks ────────────────────────────────────────────────────

/// The scan category, mapping to a distinct nmap option profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Discovery,
    Quick,
    Deep,
    Full,
    Custom,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Quick => "quick",
            Self::Deep => "deep",
            Self::Full => "full",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discovery" => Ok(Self::Discovery),
            "quick" => Ok(Self::Quick),
            "deep" => Ok(Self::Deep),
            "full" => Ok(Self::Full),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown scan type: {other}")),
        }
    }
}

/// Lifecycle state of a scan task.
///
/// Transitions are monotonic: `Pending → Running → {Completed, Failed}`.
/// A task never re-enters `Pending` once started and never leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A scheduled or executed scan task. Tasks are never deleted and form
/// an audit trail of all scan activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
    pub id: i64,
    pub task_type: TaskType,
    /// IP, CIDR range, or hostname.
    pub target: String,
    /// Raw nmap options for `custom` tasks.
    pub scan_options: Option<String>,
    pub status: TaskStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Parameters for creating a new scan task.
#[derive(Debug, Clone)]
pub struct NewScanTask {
    pub task_type: TaskType,
    pub target: String,
    pub scan_options: Option<String>,
    pub priority: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewScanTask {
    pub fn new(task_type: TaskType, target: impl Into<String>) -> Self {
        Self {
            task_type,
            target: target.into(),
            scan_options: None,
            priority: 5,
            scheduled_at: None,
        }
    }
}

// ── Scan records ──────────────────────────────────────────────────

/// Immutable record of one completed scan invocation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub task_id: Option<i64>,
    pub scan_type: TaskType,
    pub target: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds.
    pub duration: f64,
    pub hosts_up: i64,
    pub hosts_down: i64,
    pub hosts_total: i64,
    pub command_line: Option<String>,
    pub tool_version: Option<String>,
    pub raw_output: Option<String>,
    pub structured_output: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending a new scan record.
#[derive(Debug, Clone)]
pub struct NewScanRecord {
    pub task_id: Option<i64>,
    pub scan_type: TaskType,
    pub target: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: f64,
    pub hosts_up: i64,
    pub hosts_down: i64,
    pub hosts_total: i64,
    pub command_line: Option<String>,
    pub tool_version: Option<String>,
    pub raw_output: Option<String>,
    pub structured_output: Option<String>,
    pub summary: Option<String>,
}

// ── Devices and ports ─────────────────────────────────────────────

/// A device row in the inventory. `ip_address` is the sole merge key:
/// two scans reporting the same IP always coalesce into one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    /// Vendor-identifying MAC prefix, uppercase hex without separators.
    pub oui: Option<String>,
    pub device_type: Option<String>,
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    pub os_version: Option<String>,
    pub os_accuracy: Option<i64>,
    pub status: String,
    pub is_active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A port row, owned by a device. Keyed by
/// `(device_id, port_number, protocol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: i64,
    pub device_id: i64,
    pub port_number: u16,
    pub protocol: String,
    pub state: String,
    pub service_name: Option<String>,
    pub service_product: Option<String>,
    pub service_version: Option<String>,
    pub service_extrainfo: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// One observation of a device produced by the result normalizer,
/// before it is reconciled into the inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceObservation {
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub oui: Option<String>,
    pub status: String,
    pub device_type: Option<String>,
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    pub os_version: Option<String>,
    pub os_accuracy: Option<i64>,
    pub ports: Vec<PortObservation>,
    pub metadata: serde_json::Value,
}

impl DeviceObservation {
    /// Ports observed in the `open` state.
    pub fn open_ports(&self) -> impl Iterator<Item = &PortObservation> {
        self.ports.iter().filter(|p| p.state == "open")
    }
}

/// One observation of a port on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortObservation {
    pub port_number: u16,
    pub protocol: String,
    pub state: String,
    pub service_name: Option<String>,
    pub service_product: Option<String>,
    pub service_version: Option<String>,
    pub service_extrainfo: Option<String>,
}

// ── Events ────────────────────────────────────────────────────────

/// Event severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only notable occurrence, e.g. `device_discovered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub device_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending a new event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub severity: Severity,
    pub device_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
}

// ── Classification ────────────────────────────────────────────────

/// Classification confidence derived from observation completeness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}
