//! The scan pipeline: invoke → normalize → classify → reconcile.
//!
//! One pipeline execution covers a single task: it claims the task,
//! runs the external scan, parses the output, enriches and classifies
//! each discovered device, and merges everything into the inventory.
//! All failure modes come back as a failed outcome with the task's
//! `error` field set; nothing propagates into the scheduler.

use std::sync::Arc;

use async_trait::async_trait;

use netpulse_core::types::{
    DeviceObservation, NewEvent, NewScanRecord, ScanTask, Severity, TaskStatus, TaskType,
};
use netpulse_core::NetPulseConfig;
use netpulse_store::DeviceStore;

use crate::classify::DeviceClassifier;
use crate::error::{Result, ScanError};
use crate::invoke::NmapInvoker;
use crate::normalize;
use crate::worker::{PipelineOutcome, TaskRunner};

/// Orchestrates scan execution and result reconciliation.
pub struct ScanPipeline {
    invoker: NmapInvoker,
    classifier: DeviceClassifier,
    store: Arc<DeviceStore>,
    config: Arc<NetPulseConfig>,
}

impl ScanPipeline {
    pub fn new(
        invoker: NmapInvoker,
        classifier: DeviceClassifier,
        store: Arc<DeviceStore>,
        config: Arc<NetPulseConfig>,
    ) -> Self {
        Self {
            invoker,
            classifier,
            store,
            config,
        }
    }

    /// Wall-clock timeout for a scan category, in seconds.
    pub fn timeout_for(&self, task_type: TaskType) -> u64 {
        let timeouts = &self.config.scanner.timeouts;
        let secs = match task_type {
            TaskType::Discovery => timeouts.discovery,
            TaskType::Quick => timeouts.quick,
            TaskType::Deep => timeouts.deep,
            TaskType::Full => timeouts.full,
            TaskType::Custom => timeouts.custom,
        };
        if secs == 0 {
            self.config.scanner.workers.timeout
        } else {
            secs
        }
    }

    /// Claim a task for execution: transition it `pending → running`,
    /// or accept a task the dispatcher already claimed.
    fn claim(&self, task: &ScanTask) -> Result<()> {
        if self.store.mark_task_running(task.id)? {
            return Ok(());
        }
        match self.store.get_task(task.id)? {
            Some(current) if current.status == TaskStatus::Running => Ok(()),
            Some(current) => Err(ScanError::TaskNotRunnable {
                id: task.id,
                status: current.status.to_string(),
            }),
            None => Err(ScanError::TaskNotFound(task.id)),
        }
    }

    async fn run_claimed(&self, task: &ScanTask) -> Result<(usize, i64, f64)> {
        let timeout = self.timeout_for(task.task_type);
        let invocation = self
            .invoker
            .scan(
                &task.target,
                task.task_type,
                task.scan_options.as_deref(),
                timeout,
            )
            .await?;

        if !invocation.success {
            return Err(match invocation.error.as_deref() {
                Some("timeout") => ScanError::Timeout { seconds: timeout },
                other => ScanError::ToolFailed {
                    code: invocation.exit_code.unwrap_or(-1),
                    stderr: other.unwrap_or("unknown failure").to_string(),
                },
            });
        }

        let xml = invocation
            .structured_output
            .as_deref()
            .ok_or(ScanError::EmptyOutput)?;
        let report = normalize::parse_report(xml)?;
        let devices = normalize::extract_devices(&report);

        self.store.save_scan_record(&NewScanRecord {
            task_id: Some(task.id),
            scan_type: task.task_type,
            target: task.target.clone(),
            start_time: Some(invocation.start_time),
            end_time: Some(invocation.end_time),
            duration: invocation.duration,
            hosts_up: report.hosts_up,
            hosts_down: report.hosts_down,
            hosts_total: report.hosts_total,
            command_line: Some(invocation.command_line.clone()),
            tool_version: Some(invocation.tool_version.clone()),
            raw_output: Some(invocation.stdout.clone()),
            structured_output: invocation.structured_output.clone(),
            summary: Some(format!(
                "Scanned {} - {} hosts up",
                task.target, report.hosts_up
            )),
        })?;

        let persisted = self.reconcile(devices);

        Ok((persisted, report.hosts_up, invocation.duration))
    }

    /// Merge a batch of observations into the inventory.
    ///
    /// A failure on one device is logged and skipped; the rest of the
    /// batch is still persisted. Returns the number of devices merged.
    pub fn reconcile(&self, devices: Vec<DeviceObservation>) -> usize {
        let total = devices.len();
        let mut persisted = 0;

        for obs in devices {
            let ip = obs.ip_address.clone();
            match self.reconcile_device(obs) {
                Ok(device_id) => {
                    tracing::debug!(ip = %ip, device_id, "Device reconciled");
                    persisted += 1;
                }
                Err(e) => {
                    tracing::warn!(ip = %ip, error = %e, "Skipping device after reconcile error");
                }
            }
        }

        tracing::info!(persisted, total, "Processed discovered devices");
        persisted
    }

    fn reconcile_device(&self, mut obs: DeviceObservation) -> Result<i64> {
        if obs.ip_address.trim().is_empty() {
            return Err(ScanError::InvalidTarget(
                "device observation without an IP address".to_string(),
            ));
        }

        // Vendor enrichment from the OUI cache when the scan did not
        // carry a vendor string.
        if obs.vendor.is_none() {
            if let Some(oui) = &obs.oui {
                obs.vendor = self.store.oui_vendor(oui)?;
            }
        }

        let device_type = self.classifier.classify(&obs);
        let confidence = self.classifier.confidence(&obs);
        obs.device_type = Some(device_type);
        if let serde_json::Value::Object(map) = &mut obs.metadata {
            map.insert(
                "classification_confidence".to_string(),
                confidence.as_str().into(),
            );
        }

        let device_id = self.store.upsert_device(&obs)?;
        for port in &obs.ports {
            self.store.upsert_port(device_id, port)?;
        }

        self.store.create_event(&NewEvent {
            event_type: "device_discovered".to_string(),
            severity: Severity::Info,
            device_id: Some(device_id),
            title: format!("Device discovered: {}", obs.ip_address),
            description: Some(format!(
                "Device found - {}",
                obs.hostname.as_deref().unwrap_or(&obs.ip_address)
            )),
            metadata: serde_json::Value::Null,
        })?;

        Ok(device_id)
    }
}

#[async_trait]
impl TaskRunner for ScanPipeline {
    async fn run(&self, task: ScanTask) -> PipelineOutcome {
        if let Err(e) = self.claim(&task) {
            return PipelineOutcome::failed(task.id, e.to_string());
        }

        match self.run_claimed(&task).await {
            Ok((devices_found, hosts_up, duration)) => {
                if let Err(e) =
                    self.store
                        .mark_task_finished(task.id, TaskStatus::Completed, None)
                {
                    tracing::error!(task_id = task.id, error = %e, "Failed to mark task completed");
                }
                tracing::info!(
                    task_id = task.id,
                    target = %task.target,
                    devices_found,
                    hosts_up,
                    "Task completed"
                );
                PipelineOutcome {
                    task_id: task.id,
                    success: true,
                    error: None,
                    devices_found,
                    hosts_up,
                    duration,
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self.store.mark_task_finished(
                    task.id,
                    TaskStatus::Failed,
                    Some(message.as_str()),
                ) {
                    tracing::error!(task_id = task.id, error = %store_err, "Failed to mark task failed");
                }
                tracing::error!(task_id = task.id, target = %task.target, error = %message, "Task failed");
                PipelineOutcome::failed(task.id, message)
            }
        }
    }

    async fn abandon(&self, task: ScanTask) -> PipelineOutcome {
        // Keep the state machine monotonic: pending → running → failed.
        match self.store.mark_task_running(task.id) {
            Ok(_) => {
                if let Err(e) = self.store.mark_task_finished(
                    task.id,
                    TaskStatus::Failed,
                    Some("cancelled before start"),
                ) {
                    tracing::error!(task_id = task.id, error = %e, "Failed to mark task cancelled");
                }
            }
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Failed to mark task cancelled");
            }
        }
        PipelineOutcome::cancelled(task.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpulse_core::config::{RecognitionConfig, ScannerConfig};
    use netpulse_core::types::NewScanTask;

    fn pipeline_with(store: Arc<DeviceStore>, scanner: ScannerConfig) -> ScanPipeline {
        let config = Arc::new(NetPulseConfig {
            scanner,
            ..NetPulseConfig::default()
        });
        ScanPipeline::new(
            NmapInvoker::with_version(&config.scanner, "Nmap 7.95 test"),
            DeviceClassifier::new(
                RecognitionConfig::default().classification,
                vec![23, 445, 3389],
            ),
            store,
            config,
        )
    }

    fn observation(ip: &str) -> DeviceObservation {
        DeviceObservation {
            ip_address: ip.to_string(),
            status: "up".to_string(),
            metadata: serde_json::json!({}),
            ..Default::default()
        }
    }

    #[test]
    fn reconcile_isolates_per_device_failures() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let pipeline = pipeline_with(store.clone(), ScannerConfig::default());

        let batch = vec![
            observation("10.0.0.1"),
            observation(""), // malformed record
            observation("10.0.0.3"),
        ];
        let persisted = pipeline.reconcile(batch);

        assert_eq!(persisted, 2);
        assert_eq!(store.list_devices(false).unwrap().len(), 2);
        let events = store.list_events(100, None).unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == "device_discovered")
                .count(),
            2
        );
    }

    #[test]
    fn reconcile_enriches_vendor_from_oui_cache() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        store
            .bulk_insert_oui(&[("AABBCC".to_string(), "Cached Vendor".to_string())])
            .unwrap();
        let pipeline = pipeline_with(store.clone(), ScannerConfig::default());

        let mut obs = observation("10.0.0.9");
        obs.mac_address = Some("AA:BB:CC:11:22:33".to_string());
        obs.oui = Some("AABBCC".to_string());
        assert_eq!(pipeline.reconcile(vec![obs]), 1);

        let device = store.get_device_by_ip("10.0.0.9").unwrap().unwrap();
        assert_eq!(device.vendor.as_deref(), Some("Cached Vendor"));
        assert!(device.device_type.is_some());
        assert_eq!(
            device.metadata["classification_confidence"],
            serde_json::json!("low")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_executes_scan_and_reconciles_devices() {
        use std::os::unix::fs::PermissionsExt;

        let xml = r#"<?xml version="1.0"?><nmaprun scanner="nmap" version="7.95"><host><status state="up"/><address addr="192.168.1.10" addrtype="ipv4"/><ports><port protocol="tcp" portid="80"><state state="open"/><service name="http"/></port><port protocol="tcp" portid="443"><state state="open"/><service name="https"/></port></ports></host><host><status state="up"/><address addr="192.168.1.20" addrtype="ipv4"/><address addr="AA:BB:CC:DD:EE:FF" addrtype="mac" vendor="Test Vendor"/></host><runstats><hosts up="2" down="254" total="256"/></runstats></nmaprun>"#;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-nmap");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nfor a in \"$@\"; do prev2=\"$prev\"; prev=\"$a\"; done\n\
                 printf '%s' '{xml}' > \"$prev2\"\n"
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let scanner = ScannerConfig {
            nmap_path: script.display().to_string(),
            ..ScannerConfig::default()
        };
        let pipeline = pipeline_with(store.clone(), scanner);

        let task_id = store
            .create_task(&NewScanTask::new(TaskType::Discovery, "192.168.1.0/24"))
            .unwrap();
        let task = store.get_task(task_id).unwrap().unwrap();

        let outcome = pipeline.run(task).await;
        assert!(outcome.success, "outcome error: {:?}", outcome.error);
        assert_eq!(outcome.devices_found, 2);
        assert_eq!(outcome.hosts_up, 2);

        // Task reached its terminal state.
        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        // Exactly two device rows; the MAC-bearing one derived its OUI.
        let devices = store.list_devices(false).unwrap();
        assert_eq!(devices.len(), 2);
        let mac_device = store.get_device_by_ip("192.168.1.20").unwrap().unwrap();
        assert_eq!(mac_device.oui.as_deref(), Some("AABBCC"));

        // The other device has its two open port rows.
        let ported = store.get_device_by_ip("192.168.1.10").unwrap().unwrap();
        let ports = store.device_ports(ported.id).unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| p.state == "open"));

        // One scan record and one event per device.
        assert_eq!(store.list_scan_records(10).unwrap().len(), 1);
        assert_eq!(store.list_events(10, None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_invocation_marks_task_failed() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let scanner = ScannerConfig {
            nmap_path: "/nonexistent/netpulse-nmap".to_string(),
            ..ScannerConfig::default()
        };
        let pipeline = pipeline_with(store.clone(), scanner);

        let task_id = store
            .create_task(&NewScanTask::new(TaskType::Quick, "10.0.0.7"))
            .unwrap();
        let task = store.get_task(task_id).unwrap().unwrap();

        let outcome = pipeline.run(task).await;
        assert!(!outcome.success);

        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        // Failed invocations produce no scan record.
        assert!(store.list_scan_records(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_task_is_not_rerun() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let pipeline = pipeline_with(store.clone(), ScannerConfig::default());

        let task_id = store
            .create_task(&NewScanTask::new(TaskType::Quick, "10.0.0.8"))
            .unwrap();
        store.mark_task_running(task_id).unwrap();
        store
            .mark_task_finished(task_id, TaskStatus::Completed, None)
            .unwrap();

        let task = store.get_task(task_id).unwrap().unwrap();
        let outcome = pipeline.run(task).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not runnable"));
    }

    #[tokio::test]
    async fn abandon_fails_task_without_running_it() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let pipeline = pipeline_with(store.clone(), ScannerConfig::default());

        let task_id = store
            .create_task(&NewScanTask::new(TaskType::Quick, "10.0.0.9"))
            .unwrap();
        let task = store.get_task(task_id).unwrap().unwrap();

        let outcome = pipeline.abandon(task).await;
        assert!(!outcome.success);

        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("cancelled before start"));
    }
}
