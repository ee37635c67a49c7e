//! Nmap process wrapper.
//!
//! Executes nmap as a child process via `tokio::process::Command` with a
//! per-invocation wall-clock timeout. Structured XML output goes to a
//! scratch file that is removed on every exit path; the invocation result
//! carries the XML contents alongside stdout/stderr.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Instant;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use tokio::process::Command;
use uuid::Uuid;

use netpulse_core::config::ScannerConfig;
use netpulse_core::types::TaskType;

use crate::error::{Result, ScanError};

/// Result of a single nmap invocation. Failures (nonzero exit, timeout,
/// launch error) are captured here rather than raised, so a bad scan
/// never unwinds into the worker pool.
#[derive(Debug, Clone)]
pub struct ScanInvocation {
    /// Unique ID for this invocation.
    pub scan_id: Uuid,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub command_line: String,
    pub target: String,
    pub scan_type: TaskType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration in seconds. Equals the timeout on timeout.
    pub duration: f64,
    pub stdout: String,
    pub stderr: String,
    /// Contents of the XML scratch file, if any were produced.
    pub structured_output: Option<String>,
    pub tool_version: String,
    pub error: Option<String>,
}

/// Wrapper around the nmap binary.
#[derive(Debug)]
pub struct NmapInvoker {
    nmap_path: String,
    tool_version: String,
    discovery_options: String,
    quick_options: String,
    deep_options: String,
    full_options: String,
}

impl NmapInvoker {
    /// Locate and verify the nmap binary.
    ///
    /// This is a startup precondition: a missing binary is fatal for the
    /// process, not a per-scan error.
    pub async fn locate(config: &ScannerConfig) -> Result<Self> {
        let output = Command::new(&config.nmap_path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|_| ScanError::NmapNotFound {
                path: config.nmap_path.clone(),
            })?;

        if !output.status.success() {
            return Err(ScanError::NmapNotFound {
                path: config.nmap_path.clone(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let tool_version = stdout.lines().next().unwrap_or("unknown").trim().to_string();
        tracing::info!(path = %config.nmap_path, version = %tool_version, "Nmap verified");

        Ok(Self {
            nmap_path: config.nmap_path.clone(),
            tool_version,
            discovery_options: config.discovery_options.clone(),
            quick_options: config.quick_options.clone(),
            deep_options: config.deep_options.clone(),
            full_options: config.full_options.clone(),
        })
    }

    /// Build an invoker without probing the binary. Used by tests and by
    /// callers that have already verified the installation.
    pub fn with_version(config: &ScannerConfig, tool_version: impl Into<String>) -> Self {
        Self {
            nmap_path: config.nmap_path.clone(),
            tool_version: tool_version.into(),
            discovery_options: config.discovery_options.clone(),
            quick_options: config.quick_options.clone(),
            deep_options: config.deep_options.clone(),
            full_options: config.full_options.clone(),
        }
    }

    pub fn tool_version(&self) -> &str {
        &self.tool_version
    }

    /// The option profile for a scan category. `custom` supplies its own
    /// options and resolves to an empty profile here.
    pub fn profile_options(&self, scan_type: TaskType) -> &str {
        match scan_type {
            TaskType::Discovery => &self.discovery_options,
            TaskType::Quick => &self.quick_options,
            TaskType::Deep => &self.deep_options,
            TaskType::Full => &self.full_options,
            TaskType::Custom => "",
        }
    }

    /// Execute one scan against one target.
    ///
    /// `custom_options` overrides the category profile (used by `custom`
    /// tasks). The timeout is enforced here; the worker pool adds none of
    /// its own.
    pub async fn scan(
        &self,
        target: &str,
        scan_type: TaskType,
        custom_options: Option<&str>,
        timeout_secs: u64,
    ) -> Result<ScanInvocation> {
        validate_target(target)?;

        let scan_id = Uuid::new_v4();
        let start_time = Utc::now();
        let started = Instant::now();

        // Scratch file for -oX output. The NamedTempFile guard removes it
        // on every exit path, including timeout and launch failure.
        let scratch = tempfile::Builder::new()
            .prefix("nmap_")
            .suffix(".xml")
            .tempfile()?;
        let scratch_path = scratch.path().to_path_buf();

        let options = custom_options.unwrap_or_else(|| self.profile_options(scan_type));
        let mut args: Vec<String> = options.split_whitespace().map(String::from).collect();
        args.push("-oX".to_string());
        args.push(scratch_path.display().to_string());
        args.push(target.to_string());

        let command_line = format!("{} {}", self.nmap_path, args.join(" "));
        tracing::info!(
            scan_id = %scan_id,
            target = %target,
            network_range = is_network_target(target),
            scan_type = %scan_type,
            timeout_secs,
            command = %command_line,
            "Starting scan"
        );

        let mut cmd = Command::new(&self.nmap_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = std::time::Duration::from_secs(timeout_secs);
        let invocation = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => {
                tracing::warn!(scan_id = %scan_id, target = %target, timeout_secs, "Scan timed out");
                ScanInvocation {
                    scan_id,
                    success: false,
                    exit_code: None,
                    command_line,
                    target: target.to_string(),
                    scan_type,
                    start_time,
                    end_time: Utc::now(),
                    duration: timeout_secs as f64,
                    stdout: String::new(),
                    stderr: String::new(),
                    structured_output: None,
                    tool_version: self.tool_version.clone(),
                    error: Some("timeout".to_string()),
                }
            }
            Ok(Err(e)) => {
                tracing::error!(scan_id = %scan_id, target = %target, error = %e, "Failed to launch scan");
                ScanInvocation {
                    scan_id,
                    success: false,
                    exit_code: None,
                    command_line,
                    target: target.to_string(),
                    scan_type,
                    start_time,
                    end_time: Utc::now(),
                    duration: started.elapsed().as_secs_f64(),
                    stdout: String::new(),
                    stderr: String::new(),
                    structured_output: None,
                    tool_version: self.tool_version.clone(),
                    error: Some(format!("launch error: {e}")),
                }
            }
            Ok(Ok(output)) => {
                let end_time = Utc::now();
                let duration = started.elapsed().as_secs_f64();
                let success = output.status.success();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                let structured_output = std::fs::read_to_string(&scratch_path)
                    .ok()
                    .filter(|s| !s.trim().is_empty());

                if success {
                    tracing::info!(
                        scan_id = %scan_id,
                        target = %target,
                        duration_secs = format!("{duration:.2}"),
                        "Scan completed"
                    );
                } else {
                    tracing::error!(
                        scan_id = %scan_id,
                        target = %target,
                        exit_code = output.status.code(),
                        stderr = %stderr,
                        "Scan failed"
                    );
                }

                ScanInvocation {
                    scan_id,
                    success,
                    exit_code: output.status.code(),
                    command_line,
                    target: target.to_string(),
                    scan_type,
                    start_time,
                    end_time,
                    duration,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: stderr.clone(),
                    structured_output,
                    tool_version: self.tool_version.clone(),
                    error: if success {
                        None
                    } else {
                        Some(format!(
                            "exit code {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        ))
                    },
                }
            }
        };

        Ok(invocation)
    }
}

/// Reject targets that are empty or would be read as extra flags. IPs,
/// CIDR ranges, and hostnames are all acceptable nmap targets.
fn validate_target(target: &str) -> Result<()> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(ScanError::InvalidTarget("empty target".to_string()));
    }
    if trimmed.starts_with('-') {
        return Err(ScanError::InvalidTarget(format!(
            "target may not start with '-': {trimmed}"
        )));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ScanError::InvalidTarget(format!(
            "target may not contain whitespace: {trimmed}"
        )));
    }
    Ok(())
}

/// Whether a target string is an address or CIDR range (as opposed to a
/// hostname). Used for logging only.
pub fn is_network_target(target: &str) -> bool {
    target.parse::<IpAddr>().is_ok() || target.parse::<IpNet>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpulse_core::config::ScannerConfig;

    fn invoker() -> NmapInvoker {
        NmapInvoker::with_version(&ScannerConfig::default(), "Nmap 7.95 test")
    }

    #[test]
    fn profile_options_per_category() {
        let inv = invoker();
        assert_eq!(inv.profile_options(TaskType::Discovery), "-sn -T4");
        assert_eq!(inv.profile_options(TaskType::Quick), "-F -sV -T4");
        assert_eq!(
            inv.profile_options(TaskType::Deep),
            "-sV -O -A --script=default,discovery -T4"
        );
        assert_eq!(inv.profile_options(TaskType::Full), "-p- -sV -T4");
        assert_eq!(inv.profile_options(TaskType::Custom), "");
    }

    #[test]
    fn target_validation() {
        assert!(validate_target("192.168.1.0/24").is_ok());
        assert!(validate_target("host.example.com").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target("-iL /etc/passwd").is_err());
        assert!(validate_target("10.0.0.1 10.0.0.2").is_err());
    }

    #[test]
    fn network_target_detection() {
        assert!(is_network_target("10.0.0.1"));
        assert!(is_network_target("192.168.1.0/24"));
        assert!(is_network_target("fe80::1"));
        assert!(!is_network_target("printer.local"));
    }

    #[tokio::test]
    async fn launch_failure_is_captured_not_raised() {
        let config = ScannerConfig {
            nmap_path: "/nonexistent/netpulse-nmap".to_string(),
            ..ScannerConfig::default()
        };
        let inv = NmapInvoker::with_version(&config, "test");

        let result = inv
            .scan("127.0.0.1", TaskType::Discovery, None, 5)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().starts_with("launch error"));
        assert!(result.structured_output.is_none());
    }

    #[tokio::test]
    async fn locate_fails_for_missing_binary() {
        let config = ScannerConfig {
            nmap_path: "/nonexistent/netpulse-nmap".to_string(),
            ..ScannerConfig::default()
        };
        let err = NmapInvoker::locate(&config).await.unwrap_err();
        assert!(matches!(err, ScanError::NmapNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_reported_with_timeout_duration() {
        use std::os::unix::fs::PermissionsExt;

        // A stand-in scan binary that ignores its arguments and hangs.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-nmap");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = ScannerConfig {
            nmap_path: script.display().to_string(),
            ..ScannerConfig::default()
        };
        let inv = NmapInvoker::with_version(&config, "test");

        let result = inv
            .scan("127.0.0.1", TaskType::Discovery, None, 1)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
        assert_eq!(result.duration, 1.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_invocation_reads_scratch_xml() {
        use std::os::unix::fs::PermissionsExt;

        // A stand-in binary that writes XML to the path after -oX. The
        // scratch path is the second-to-last argument the invoker passes.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-nmap");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor a in \"$@\"; do prev2=\"$prev\"; prev=\"$a\"; done\n\
             printf '<nmaprun scanner=\"nmap\"></nmaprun>' > \"$prev2\"\necho done\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = ScannerConfig {
            nmap_path: script.display().to_string(),
            ..ScannerConfig::default()
        };
        let inv = NmapInvoker::with_version(&config, "test");

        let result = inv
            .scan("127.0.0.1", TaskType::Discovery, None, 10)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result
            .structured_output
            .as_deref()
            .unwrap()
            .contains("nmaprun"));
        assert!(result.stdout.contains("done"));
        assert!(result.error.is_none());
    }
}
