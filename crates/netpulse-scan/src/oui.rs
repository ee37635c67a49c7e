//! OUI vendor-database updater.
//!
//! Downloads the IEEE OUI registry, parses `XX-XX-XX (hex) Vendor`
//! lines, and refreshes the store's OUI cache. The last update
//! timestamp lives in the runtime configuration table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;

use netpulse_core::config::OuiConfig;
use netpulse_store::DeviceStore;

use crate::error::{Result, ScanError};

/// Runtime-config key holding the last successful update timestamp.
const LAST_UPDATE_KEY: &str = "oui.last_update";

pub struct OuiUpdater {
    config: OuiConfig,
    store: Arc<DeviceStore>,
    client: reqwest::Client,
}

impl OuiUpdater {
    pub fn new(config: OuiConfig, store: Arc<DeviceStore>) -> Self {
        Self {
            config,
            store,
            client: reqwest::Client::new(),
        }
    }

    /// Download and apply the OUI registry. Returns the number of
    /// entries written to the cache.
    pub async fn update(&self) -> Result<usize> {
        tracing::info!(url = %self.config.update_url, "Downloading OUI database");

        let body = self
            .client
            .get(&self.config.update_url)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        tracing::info!(bytes = body.len(), "OUI database downloaded");

        let entries = parse_oui_file(&body);
        if entries.is_empty() {
            return Err(ScanError::OuiUpdate("no OUI entries parsed".to_string()));
        }

        let written = self.store.bulk_insert_oui(&entries)?;
        self.store
            .set_value(LAST_UPDATE_KEY, &Utc::now().to_rfc3339(), None)?;

        tracing::info!(entries = written, "OUI database updated");
        Ok(written)
    }

    /// Timestamp of the last successful update, if any.
    pub fn last_update(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.store.get_value(LAST_UPDATE_KEY)?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Whether the cache is stale per the configured update interval.
    /// A missing or unreadable timestamp always means "update".
    pub fn should_update(&self) -> bool {
        match self.last_update() {
            Ok(Some(last)) => {
                let elapsed = (Utc::now() - last).num_seconds();
                elapsed < 0 || elapsed as u64 >= self.config.update_interval
            }
            _ => true,
        }
    }
}

/// Parse the IEEE registry text format into `(oui, vendor)` pairs.
pub fn parse_oui_file(content: &str) -> Vec<(String, String)> {
    // Format: "AA-BB-CC   (hex)\t\tVendor Name"
    let pattern = Regex::new(r"^([0-9A-F]{2}-[0-9A-F]{2}-[0-9A-F]{2})\s+\(hex\)\s+(.+)$")
        .expect("static regex");

    content
        .lines()
        .filter_map(|line| {
            let caps = pattern.captures(line.trim_end())?;
            let oui = caps[1].replace('-', "");
            let vendor = caps[2].trim().to_string();
            Some((oui, vendor))
        })
        .collect()
}
