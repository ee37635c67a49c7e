//! Device type classification and suspicion heuristics.
//!
//! Scores observations against an ordered rule list: +10 per matching
//! open port, +20 per keyword hit, +15 per matching service. The
//! strictly highest total wins, ties resolve to rule definition order,
//! and a zero score falls back to OS-family heuristics.

use std::collections::HashSet;

use serde::Serialize;

use netpulse_core::config::ClassificationRule;
use netpulse_core::types::{Confidence, Device, DeviceObservation, Port};

/// Well-known server ports used by the OS-family fallback.
const SERVER_PORTS: [u16; 7] = [22, 80, 443, 3306, 5432, 6379, 8080];

/// Open-port threshold above which any device looks suspicious.
const SUSPICIOUS_PORT_COUNT: usize = 50;

/// Open-port threshold for unidentified devices.
const UNKNOWN_TYPE_PORT_COUNT: usize = 5;

/// Severity of a suspicious-device finding.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SuspicionSeverity {
    Medium,
    High,
    Critical,
}

/// A device flagged by the suspicion heuristics.
#[derive(Debug, Clone, Serialize)]
pub struct SuspiciousDevice {
    pub device_id: i64,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    pub device_type: Option<String>,
    pub reasons: Vec<String>,
    pub severity: SuspicionSeverity,
}

/// Rule-based device classifier.
pub struct DeviceClassifier {
    rules: Vec<ClassificationRule>,
    suspicious_ports: HashSet<u16>,
}

impl DeviceClassifier {
    pub fn new(rules: Vec<ClassificationRule>, suspicious_ports: Vec<u16>) -> Self {
        Self {
            rules,
            suspicious_ports: suspicious_ports.into_iter().collect(),
        }
    }

    /// Score one rule against an observation.
    fn score(&self, rule: &ClassificationRule, obs: &DeviceObservation, text: &str) -> i64 {
        let open_ports: HashSet<u16> = obs.open_ports().map(|p| p.port_number).collect();
        let services: HashSet<String> = obs
            .open_ports()
            .filter_map(|p| p.service_name.as_deref())
            .map(str::to_lowercase)
            .collect();

        let mut score = 0;
        score += open_ports.intersection(&rule.ports).count() as i64 * 10;
        score += rule
            .keywords
            .iter()
            .filter(|k| text.contains(&k.to_lowercase()))
            .count() as i64
            * 20;
        score += rule
            .services
            .iter()
            .filter(|s| services.contains(&s.to_lowercase()))
            .count() as i64
            * 15;
        score
    }

    /// Assign a device type. The highest-scoring rule wins; ties go to
    /// the earliest rule; a zero score falls back to OS heuristics.
    pub fn classify(&self, obs: &DeviceObservation) -> String {
        let text = evidence_text(obs);

        let mut best: Option<(&str, i64)> = None;
        for rule in &self.rules {
            let score = self.score(rule, obs, &text);
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((&rule.label, score));
            }
        }

        if let Some((label, score)) = best {
            tracing::debug!(ip = %obs.ip_address, device_type = label, score, "Classified device");
            return label.to_string();
        }

        self.fallback_type(obs)
    }

    fn fallback_type(&self, obs: &DeviceObservation) -> String {
        let os_name = obs.os_name.as_deref().unwrap_or("").to_lowercase();
        let os_family = obs.os_family.as_deref().unwrap_or("").to_lowercase();
        let open_ports: HashSet<u16> = obs.open_ports().map(|p| p.port_number).collect();

        if os_name.contains("windows") || os_family.contains("windows") {
            return "workstation".to_string();
        }
        if ["linux", "unix", "bsd"]
            .iter()
            .any(|x| os_name.contains(x) || os_family.contains(x))
        {
            if SERVER_PORTS.iter().any(|p| open_ports.contains(p)) {
                return "server".to_string();
            }
            return "workstation".to_string();
        }
        if os_name.contains("android") || os_name.contains("ios") {
            return "mobile".to_string();
        }

        "unknown".to_string()
    }

    /// Classification confidence from observation completeness.
    pub fn confidence(&self, obs: &DeviceObservation) -> Confidence {
        let mut score = 0;
        if obs.os_name.is_some() {
            score += 30;
        }
        if obs.vendor.is_some() {
            score += 20;
        }
        if obs.hostname.is_some() {
            score += 20;
        }
        if obs.open_ports().next().is_some() {
            score += 20;
        }
        if obs.open_ports().any(|p| p.service_name.is_some()) {
            score += 10;
        }

        if score >= 70 {
            Confidence::High
        } else if score >= 40 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    /// Evaluate one stored device against the suspicion heuristics.
    /// Returns None when nothing is suspicious about it.
    pub fn check_suspicious(&self, device: &Device, ports: &[Port]) -> Option<SuspiciousDevice> {
        let open_ports: Vec<&Port> = ports.iter().filter(|p| p.state == "open").collect();
        let mut reasons = Vec::new();

        for port in &open_ports {
            if self.suspicious_ports.contains(&port.port_number) {
                reasons.push(format!(
                    "Suspicious port {} ({})",
                    port.port_number,
                    port.service_name.as_deref().unwrap_or("unknown")
                ));
            }
        }

        if device.hostname.is_none() && device.vendor.is_none() {
            reasons.push("No hostname or vendor information".to_string());
        }

        if open_ports.len() > SUSPICIOUS_PORT_COUNT {
            reasons.push(format!(
                "Unusual number of open ports ({})",
                open_ports.len()
            ));
        }

        if device.device_type.as_deref() == Some("unknown")
            && open_ports.len() > UNKNOWN_TYPE_PORT_COUNT
        {
            reasons.push("Unknown device type with multiple open ports".to_string());
        }

        if reasons.is_empty() {
            return None;
        }

        let severity = suspicion_severity(&reasons);
        Some(SuspiciousDevice {
            device_id: device.id,
            ip_address: device.ip_address.clone(),
            hostname: device.hostname.clone(),
            mac_address: device.mac_address.clone(),
            vendor: device.vendor.clone(),
            device_type: device.device_type.clone(),
            reasons,
            severity,
        })
    }
}

/// Aggregate statistics over the device inventory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStatistics {
    pub total_devices: usize,
    pub by_type: std::collections::BTreeMap<String, usize>,
    pub by_vendor: std::collections::BTreeMap<String, usize>,
    pub by_os: std::collections::BTreeMap<String, usize>,
    pub with_hostname: usize,
    pub without_hostname: usize,
    pub with_mac: usize,
    pub without_mac: usize,
}

/// Summarize the inventory: counts by type, vendor, and OS family, and
/// hostname/MAC coverage.
pub fn device_statistics(devices: &[Device]) -> DeviceStatistics {
    let mut stats = DeviceStatistics {
        total_devices: devices.len(),
        ..Default::default()
    };

    for device in devices {
        let device_type = device.device_type.clone().unwrap_or_else(|| "unknown".to_string());
        *stats.by_type.entry(device_type).or_default() += 1;

        let vendor = device.vendor.clone().unwrap_or_else(|| "Unknown".to_string());
        *stats.by_vendor.entry(vendor).or_default() += 1;

        let os_family = device.os_family.clone().unwrap_or_else(|| "Unknown".to_string());
        *stats.by_os.entry(os_family).or_default() += 1;

        if device.hostname.is_some() {
            stats.with_hostname += 1;
        } else {
            stats.without_hostname += 1;
        }
        if device.mac_address.is_some() {
            stats.with_mac += 1;
        } else {
            stats.without_mac += 1;
        }
    }

    stats
}

/// Lowercased concatenation of the textual evidence fields.
fn evidence_text(obs: &DeviceObservation) -> String {
    format!(
        "{} {} {} {}",
        obs.hostname.as_deref().unwrap_or(""),
        obs.vendor.as_deref().unwrap_or(""),
        obs.os_name.as_deref().unwrap_or(""),
        obs.os_family.as_deref().unwrap_or("")
    )
    .to_lowercase()
}

fn suspicion_severity(reasons: &[String]) -> SuspicionSeverity {
    if reasons.len() >= 3 {
        SuspicionSeverity::Critical
    } else if reasons.len() == 2 || reasons.iter().any(|r| r.to_lowercase().contains("suspicious port"))
    {
        SuspicionSeverity::High
    } else {
        SuspicionSeverity::Medium
    }
}
