//! Configuration for NetPulse.
//!
//! Loaded from (in priority order):
//! 1. Environment variables (`NETPULSE__` prefix, `__` separator)
//! 2. Config file (`netpulse.toml` by default, `--config` to override)
//! 3. Defaults

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Top-level NetPulse configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetPulseConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub oui: OuiConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl NetPulseConfig {
    /// Load configuration from a file prefix plus environment overrides.
    ///
    /// The file is optional; missing keys fall back to defaults.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("NETPULSE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let parsed: Self = cfg
            .try_deserialize()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        tracing::debug!(prefix = file_prefix, "Configuration loaded");
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite inventory database.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Scanner configuration: nmap location, option profiles, worker limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Path to the nmap binary (default: "nmap", resolved via PATH).
    #[serde(default = "default_nmap_path")]
    pub nmap_path: String,

    /// Network scanned by the default recurring discovery job.
    #[serde(default = "default_network")]
    pub default_network: String,

    /// Option profile per scan category.
    #[serde(default = "default_discovery_options")]
    pub discovery_options: String,
    #[serde(default = "default_quick_options")]
    pub quick_options: String,
    #[serde(default = "default_deep_options")]
    pub deep_options: String,
    #[serde(default = "default_full_options")]
    pub full_options: String,

    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            nmap_path: default_nmap_path(),
            default_network: default_network(),
            discovery_options: default_discovery_options(),
            quick_options: default_quick_options(),
            deep_options: default_deep_options(),
            full_options: default_full_options(),
            intervals: IntervalConfig::default(),
            workers: WorkerConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalConfig {
    /// Seconds between recurring discovery scans. Zero disables the job.
    #[serde(default = "default_discovery_interval")]
    pub discovery: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            discovery: default_discovery_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrently running scan pipelines.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Fallback per-scan timeout in seconds when no category timeout applies.
    #[serde(default = "default_worker_timeout")]
    pub timeout: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout: default_worker_timeout(),
        }
    }
}

/// Wall-clock timeout per scan category, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_short")]
    pub discovery: u64,
    #[serde(default = "default_timeout_short")]
    pub quick: u64,
    #[serde(default = "default_timeout_medium")]
    pub deep: u64,
    #[serde(default = "default_timeout_long")]
    pub full: u64,
    #[serde(default = "default_timeout_medium")]
    pub custom: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            discovery: default_timeout_short(),
            quick: default_timeout_short(),
            deep: default_timeout_medium(),
            full: default_timeout_long(),
            custom: default_timeout_medium(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum simultaneous firings of one job.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Collapse missed firings into one.
    #[serde(default = "default_true")]
    pub coalesce: bool,

    /// Maximum pending tasks promoted per backlog sweep.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            coalesce: default_true(),
            sweep_batch: default_sweep_batch(),
        }
    }
}

/// Device recognition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Ordered classification rules; definition order breaks score ties.
    #[serde(default = "default_classification_rules")]
    pub classification: Vec<ClassificationRule>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            classification: default_classification_rules(),
        }
    }
}

/// A single device-type classification rule.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationRule {
    /// Device type assigned when this rule wins, e.g. "router".
    pub label: String,
    /// Open ports that add +10 each.
    #[serde(default)]
    pub ports: HashSet<u16>,
    /// Substrings matched against hostname/vendor/OS text, +20 each.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Service names that add +15 each.
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub rules: AlertRules,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook: WebhookConfig::default(),
            rules: AlertRules::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertRules {
    #[serde(default)]
    pub suspicious_port: SuspiciousPortRule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuspiciousPortRule {
    /// Open ports that flag a device as suspicious.
    #[serde(default = "default_suspicious_ports")]
    pub ports: Vec<u16>,
}

impl Default for SuspiciousPortRule {
    fn default() -> Self {
        Self {
            ports: default_suspicious_ports(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OuiConfig {
    #[serde(default = "default_oui_url")]
    pub update_url: String,

    /// Seconds between OUI database refreshes (default: 7 days).
    #[serde(default = "default_oui_interval")]
    pub update_interval: u64,
}

impl Default for OuiConfig {
    fn default() -> Self {
        Self {
            update_url: default_oui_url(),
            update_interval: default_oui_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub output_dir: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_export_dir(),
        }
    }
}

fn default_db_path() -> String {
    "instance/netpulse.sqlite".to_string()
}

fn default_nmap_path() -> String {
    "nmap".to_string()
}

fn default_network() -> String {
    "192.168.1.0/24".to_string()
}

fn default_discovery_options() -> String {
    "-sn -T4".to_string()
}

fn default_quick_options() -> String {
    "-F -sV -T4".to_string()
}

fn default_deep_options() -> String {
    "-sV -O -A --script=default,discovery -T4".to_string()
}

fn default_full_options() -> String {
    "-p- -sV -T4".to_string()
}

fn default_discovery_interval() -> u64 {
    300
}

fn default_max_workers() -> usize {
    4
}

fn default_worker_timeout() -> u64 {
    600
}

fn default_timeout_short() -> u64 {
    300
}

fn default_timeout_medium() -> u64 {
    600
}

fn default_timeout_long() -> u64 {
    3600
}

fn default_max_instances() -> usize {
    1
}

fn default_sweep_batch() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_suspicious_ports() -> Vec<u16> {
    vec![23, 445, 3389]
}

fn default_oui_url() -> String {
    "https://standards-oui.ieee.org/oui/oui.txt".to_string()
}

fn default_oui_interval() -> u64 {
    604_800
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_export_dir() -> String {
    "exports".to_string()
}

fn default_classification_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule {
            label: "router".to_string(),
            ports: [23, 53, 67].into_iter().collect(),
            keywords: ["router", "gateway", "openwrt", "mikrotik", "cisco", "tp-link"]
                .map(str::to_string)
                .to_vec(),
            services: ["telnet", "domain", "dhcps"].map(str::to_string).to_vec(),
        },
        ClassificationRule {
            label: "printer".to_string(),
            ports: [515, 631, 9100].into_iter().collect(),
            keywords: ["printer", "print", "epson", "canon", "brother", "lexmark"]
                .map(str::to_string)
                .to_vec(),
            services: ["ipp", "printer", "jetdirect"].map(str::to_string).to_vec(),
        },
        ClassificationRule {
            label: "nas".to_string(),
            ports: [139, 445, 2049].into_iter().collect(),
            keywords: ["nas", "synology", "qnap", "storage"]
                .map(str::to_string)
                .to_vec(),
            services: ["netbios-ssn", "microsoft-ds", "nfs"]
                .map(str::to_string)
                .to_vec(),
        },
        ClassificationRule {
            label: "camera".to_string(),
            ports: [554, 8554].into_iter().collect(),
            keywords: ["camera", "cam", "hikvision", "dahua", "axis"]
                .map(str::to_string)
                .to_vec(),
            services: ["rtsp"].map(str::to_string).to_vec(),
        },
        ClassificationRule {
            label: "server".to_string(),
            ports: [22, 80, 443, 3306, 5432].into_iter().collect(),
            keywords: ["server", "ubuntu", "debian", "centos"]
                .map(str::to_string)
                .to_vec(),
            services: ["http", "https", "ssh", "mysql", "postgresql"]
                .map(str::to_string)
                .to_vec(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = NetPulseConfig::default();
        assert_eq!(cfg.database.path, "instance/netpulse.sqlite");
        assert_eq!(cfg.scanner.nmap_path, "nmap");
        assert_eq!(cfg.scanner.discovery_options, "-sn -T4");
        assert_eq!(cfg.scanner.intervals.discovery, 300);
        assert_eq!(cfg.scanner.workers.max_workers, 4);
        assert_eq!(cfg.scanner.timeouts.full, 3600);
        assert_eq!(cfg.scheduler.sweep_batch, 10);
        assert_eq!(cfg.alerts.rules.suspicious_port.ports, vec![23, 445, 3389]);
        assert_eq!(cfg.api.port, 5000);
    }

    #[test]
    fn default_rules_are_ordered() {
        let rules = default_classification_rules();
        assert_eq!(rules[0].label, "router");
        assert!(rules[0].ports.contains(&23));
        assert!(rules.iter().any(|r| r.label == "server"));
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netpulse.toml");
        std::fs::write(
            &path,
            r#"
[scanner]
default_network = "10.0.0.0/24"

[scanner.workers]
max_workers = 8

[[recognition.classification]]
label = "iot"
ports = [1883, 8883]
keywords = ["esp", "tasmota"]
services = ["mqtt"]
"#,
        )
        .unwrap();

        let prefix = path.with_extension("");
        let cfg = NetPulseConfig::load(prefix.to_str().unwrap()).unwrap();
        assert_eq!(cfg.scanner.default_network, "10.0.0.0/24");
        assert_eq!(cfg.scanner.workers.max_workers, 8);
        // File-provided rules replace the defaults entirely.
        assert_eq!(cfg.recognition.classification.len(), 1);
        assert_eq!(cfg.recognition.classification[0].label, "iot");
        // Untouched sections keep their defaults.
        assert_eq!(cfg.scanner.intervals.discovery, 300);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = NetPulseConfig::load("/nonexistent/netpulse").unwrap();
        assert_eq!(cfg.scanner.nmap_path, "nmap");
        assert_eq!(cfg.api.port, 5000);
    }
}
