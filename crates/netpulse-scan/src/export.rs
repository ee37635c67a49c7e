//! Export inventory data to files.
//!
//! Devices and scan records go to timestamped JSON or CSV files under
//! the configured output directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use netpulse_core::types::{Device, ScanRecord};
use netpulse_store::DeviceStore;

use crate::error::Result;

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

pub struct ExportService {
    output_dir: PathBuf,
    store: Arc<DeviceStore>,
}

impl ExportService {
    pub fn new(output_dir: impl Into<PathBuf>, store: Arc<DeviceStore>) -> Self {
        Self {
            output_dir: output_dir.into(),
            store,
        }
    }

    /// Export all devices. Returns the written file path.
    pub fn export_devices(&self, format: ExportFormat) -> Result<PathBuf> {
        let devices = self.store.list_devices(false)?;
        let path = self.output_path("devices", format);

        match format {
            ExportFormat::Json => write_json(&path, &devices)?,
            ExportFormat::Csv => write_csv(&path, DEVICE_COLUMNS, devices.iter().map(device_row))?,
        }

        tracing::info!(count = devices.len(), path = %path.display(), "Exported devices");
        Ok(path)
    }

    /// Export recent scan records. Returns the written file path.
    pub fn export_scan_records(&self, format: ExportFormat, limit: usize) -> Result<PathBuf> {
        let records = self.store.list_scan_records(limit)?;
        let path = self.output_path("scan_results", format);

        match format {
            ExportFormat::Json => write_json(&path, &records)?,
            ExportFormat::Csv => write_csv(&path, RECORD_COLUMNS, records.iter().map(record_row))?,
        }

        tracing::info!(count = records.len(), path = %path.display(), "Exported scan records");
        Ok(path)
    }

    fn output_path(&self, stem: &str, format: ExportFormat) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        self.output_dir
            .join(format!("{stem}_{timestamp}.{}", format.extension()))
    }
}

const DEVICE_COLUMNS: &[&str] = &[
    "id",
    "ip_address",
    "mac_address",
    "hostname",
    "vendor",
    "device_type",
    "os_name",
    "status",
    "first_seen",
    "last_seen",
];

const RECORD_COLUMNS: &[&str] = &[
    "id",
    "task_id",
    "scan_type",
    "target",
    "duration",
    "hosts_up",
    "hosts_total",
    "created_at",
];

fn device_row(d: &Device) -> Vec<String> {
    vec![
        d.id.to_string(),
        d.ip_address.clone(),
        d.mac_address.clone().unwrap_or_default(),
        d.hostname.clone().unwrap_or_default(),
        d.vendor.clone().unwrap_or_default(),
        d.device_type.clone().unwrap_or_default(),
        d.os_name.clone().unwrap_or_default(),
        d.status.clone(),
        d.first_seen.to_rfc3339(),
        d.last_seen.to_rfc3339(),
    ]
}

fn record_row(r: &ScanRecord) -> Vec<String> {
    vec![
        r.id.to_string(),
        r.task_id.map(|id| id.to_string()).unwrap_or_default(),
        r.scan_type.to_string(),
        r.target.clone(),
        format!("{:.2}", r.duration),
        r.hosts_up.to_string(),
        r.hosts_total.to_string(),
        r.created_at.to_rfc3339(),
    ]
}

fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(data)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn write_csv(
    path: &Path,
    columns: &[&str],
    rows: impl Iterator<Item = Vec<String>>,
) -> Result<()> {
    ensure_parent(path)?;
    let mut out = String::new();
    out.push_str(&columns.join(","));
    out.push('\n');
    for row in rows {
        let escaped: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        out.push_str(&escaped.join(","));
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
