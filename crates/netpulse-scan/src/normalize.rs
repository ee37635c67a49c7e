//! Canonical scan-report model and device extraction.
//!
//! Converts raw nmap XML into a `ScanReport`, then flattens up hosts
//! into `DeviceObservation`s ready for reconciliation. OS detail is
//! collapsed to the best match; ports and ancillary host data are
//! carried in device metadata.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use netpulse_core::types::{DeviceObservation, PortObservation};

use crate::error::Result;
use crate::nmap_xml::{self, NmapHost, NmapRun};

/// Canonical representation of one scan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub tool_version: Option<String>,
    pub command_args: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub elapsed: Option<f64>,
    pub hosts: Vec<HostReport>,
    pub hosts_up: i64,
    pub hosts_down: i64,
    pub hosts_total: i64,
}

/// One host in a scan report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostReport {
    /// `up` or `down`.
    pub status: String,
    pub reason: Option<String>,
    pub ip_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub mac_address: Option<String>,
    /// Vendor string attached to the MAC, when nmap knows it.
    pub vendor: Option<String>,
    /// All reported hostnames; the first is canonical.
    pub hostnames: Vec<String>,
    pub os_matches: Vec<OsMatchReport>,
    pub ports: Vec<PortReport>,
    pub host_scripts: Vec<ScriptReport>,
    pub uptime_seconds: Option<u64>,
    pub last_boot: Option<String>,
    /// Network hop distance.
    pub distance: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsMatchReport {
    pub name: String,
    pub accuracy: i64,
    pub classes: Vec<OsClassReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsClassReport {
    pub class_type: Option<String>,
    pub vendor: Option<String>,
    pub os_family: Option<String>,
    pub os_gen: Option<String>,
    pub cpe: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortReport {
    pub port_number: u16,
    pub protocol: String,
    pub state: String,
    pub reason: Option<String>,
    pub service_name: Option<String>,
    pub service_product: Option<String>,
    pub service_version: Option<String>,
    pub service_extrainfo: Option<String>,
    pub scripts: Vec<ScriptReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptReport {
    pub id: String,
    pub output: Option<String>,
}

impl HostReport {
    pub fn is_up(&self) -> bool {
        self.status == "up"
    }

    /// The canonical (first) hostname.
    pub fn hostname(&self) -> Option<&str> {
        self.hostnames.first().map(String::as_str)
    }

    /// The OS match with the highest accuracy; ties resolve to the
    /// first encountered.
    pub fn best_os_match(&self) -> Option<&OsMatchReport> {
        let mut best: Option<&OsMatchReport> = None;
        for m in &self.os_matches {
            match best {
                Some(b) if m.accuracy <= b.accuracy => {}
                _ => best = Some(m),
            }
        }
        best
    }
}

/// Parse raw XML output into the canonical report.
///
/// Malformed or empty payloads yield an explicit error, never a
/// partially populated report.
pub fn parse_report(xml: &str) -> Result<ScanReport> {
    let run = nmap_xml::parse_nmap_xml(xml)?;
    Ok(report_from_run(&run))
}

fn report_from_run(run: &NmapRun) -> ScanReport {
    let stats = run.runstats.as_ref().and_then(|r| r.hosts.as_ref());
    let elapsed = run
        .runstats
        .as_ref()
        .and_then(|r| r.finished.as_ref())
        .and_then(|f| f.elapsed);

    ScanReport {
        tool_version: run.version.clone(),
        command_args: run.args.clone(),
        start_time: run
            .start
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single()),
        elapsed,
        hosts: run.hosts.iter().map(host_report).collect(),
        hosts_up: stats.and_then(|s| s.up).unwrap_or(0),
        hosts_down: stats.and_then(|s| s.down).unwrap_or(0),
        hosts_total: stats.and_then(|s| s.total).unwrap_or(0),
    }
}

fn host_report(host: &NmapHost) -> HostReport {
    let ports = host
        .ports
        .as_ref()
        .map(|ps| {
            ps.ports
                .iter()
                .map(|p| PortReport {
                    port_number: p.port_id,
                    protocol: p.protocol.clone(),
                    state: p.state.state.clone(),
                    reason: p.state.reason.clone(),
                    service_name: p.service.as_ref().map(|s| s.name.clone()),
                    service_product: p.service.as_ref().and_then(|s| s.product.clone()),
                    service_version: p.service.as_ref().and_then(|s| s.version.clone()),
                    service_extrainfo: p.service.as_ref().and_then(|s| s.extra_info.clone()),
                    scripts: p
                        .scripts
                        .iter()
                        .map(|s| ScriptReport {
                            id: s.id.clone(),
                            output: s.output.clone(),
                        })
                        .collect(),
                })
                .collect()
        })
        .unwrap_or_default();

    let os_matches = host
        .os
        .as_ref()
        .map(|os| {
            os.matches
                .iter()
                .map(|m| OsMatchReport {
                    name: m.name.clone(),
                    accuracy: m.accuracy_value(),
                    classes: m
                        .classes
                        .iter()
                        .map(|c| OsClassReport {
                            class_type: c.class_type.clone(),
                            vendor: c.vendor.clone(),
                            os_family: c.os_family.clone(),
                            os_gen: c.os_gen.clone(),
                            cpe: c.cpe.clone(),
                        })
                        .collect(),
                })
                .collect()
        })
        .unwrap_or_default();

    HostReport {
        status: host
            .status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        reason: host.status.as_ref().and_then(|s| s.reason.clone()),
        ip_address: host.ipv4().map(String::from),
        ipv6_address: host.ipv6().map(String::from),
        mac_address: host.mac().map(String::from),
        vendor: host.mac_vendor().map(String::from),
        hostnames: host.all_hostnames().iter().map(|s| s.to_string()).collect(),
        os_matches,
        ports,
        host_scripts: host
            .hostscript
            .as_ref()
            .map(|hs| {
                hs.scripts
                    .iter()
                    .map(|s| ScriptReport {
                        id: s.id.clone(),
                        output: s.output.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        uptime_seconds: host.uptime.as_ref().and_then(|u| u.seconds),
        last_boot: host.uptime.as_ref().and_then(|u| u.last_boot.clone()),
        distance: host.distance.as_ref().and_then(|d| d.value),
    }
}

/// Derive the OUI from a MAC address: first three octets, separators
/// stripped, uppercased.
pub fn oui_from_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(6)
        .collect::<String>()
        .to_uppercase()
}

/// Flatten up hosts into device observations.
///
/// A host without a MAC still yields a device keyed by IP; a host
/// without an IPv4 address is skipped (nothing to key on).
pub fn extract_devices(report: &ScanReport) -> Vec<DeviceObservation> {
    report
        .hosts
        .iter()
        .filter(|h| h.is_up())
        .filter_map(observation_from_host)
        .collect()
}

fn observation_from_host(host: &HostReport) -> Option<DeviceObservation> {
    let ip_address = host.ip_address.clone()?;

    let oui = host.mac_address.as_deref().map(oui_from_mac);

    let best = host.best_os_match();
    let best_class = best.and_then(|m| m.classes.first());

    let ports: Vec<PortObservation> = host
        .ports
        .iter()
        .map(|p| PortObservation {
            port_number: p.port_number,
            protocol: p.protocol.clone(),
            state: p.state.clone(),
            service_name: p.service_name.clone(),
            service_product: p.service_product.clone(),
            service_version: p.service_version.clone(),
            service_extrainfo: p.service_extrainfo.clone(),
        })
        .collect();

    let open_ports_count = ports.iter().filter(|p| p.state == "open").count();

    let mut metadata = serde_json::Map::new();
    if !host.ports.is_empty() {
        metadata.insert(
            "ports".to_string(),
            serde_json::to_value(&host.ports).unwrap_or(serde_json::Value::Null),
        );
        metadata.insert("open_ports_count".to_string(), open_ports_count.into());
    }
    if !host.hostnames.is_empty() {
        metadata.insert(
            "all_hostnames".to_string(),
            serde_json::to_value(&host.hostnames).unwrap_or(serde_json::Value::Null),
        );
    }
    if let Some(seconds) = host.uptime_seconds {
        metadata.insert("uptime_seconds".to_string(), seconds.into());
    }
    if let Some(distance) = host.distance {
        metadata.insert("distance".to_string(), distance.into());
    }

    Some(DeviceObservation {
        ip_address,
        mac_address: host.mac_address.clone(),
        hostname: host.hostname().map(String::from),
        vendor: host.vendor.clone(),
        oui,
        status: host.status.clone(),
        device_type: None,
        os_name: best.map(|m| m.name.clone()),
        os_family: best_class.and_then(|c| c.os_family.clone()),
        os_version: best_class.and_then(|c| c.os_gen.clone()),
        os_accuracy: best.map(|m| m.accuracy),
        ports,
        metadata: serde_json::Value::Object(metadata),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;

    const TWO_HOST_DISCOVERY: &str = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap" version="7.95" args="nmap -sn -T4 192.168.1.0/24" start="1754400000">
  <host>
    <status state="up" reason="syn-ack"/>
    <address addr="192.168.1.10" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="80">
        <state state="open" reason="syn-ack"/>
        <service name="http"/>
      </port>
      <port protocol="tcp" portid="443">
        <state state="open" reason="syn-ack"/>
        <service name="https"/>
      </port>
    </ports>
  </host>
  <host>
    <status state="up" reason="arp-response"/>
    <address addr="192.168.1.20" addrtype="ipv4"/>
    <address addr="AA:BB:CC:DD:EE:FF" addrtype="mac" vendor="Test Vendor"/>
  </host>
  <host>
    <status state="down" reason="no-response"/>
    <address addr="192.168.1.30" addrtype="ipv4"/>
  </host>
  <runstats>
    <finished time="1754400003" elapsed="3.20"/>
    <hosts up="2" down="1" total="3"/>
  </runstats>
</nmaprun>"#;

    #[test]
    fn report_carries_run_metadata() {
        let report = parse_report(TWO_HOST_DISCOVERY).unwrap();
        assert_eq!(report.tool_version.as_deref(), Some("7.95"));
        assert_eq!(report.hosts_up, 2);
        assert_eq!(report.hosts_down, 1);
        assert_eq!(report.hosts_total, 3);
        assert_eq!(report.elapsed, Some(3.20));
        assert!(report.start_time.is_some());
        assert_eq!(report.hosts.len(), 3);
    }

    #[test]
    fn extract_devices_filters_and_flattens() {
        let report = parse_report(TWO_HOST_DISCOVERY).unwrap();
        let devices = extract_devices(&report);
        assert_eq!(devices.len(), 2);

        // Host with ports but no MAC still yields a device keyed by IP.
        let ported = &devices[0];
        assert_eq!(ported.ip_address, "192.168.1.10");
        assert_eq!(ported.mac_address, None);
        assert_eq!(ported.oui, None);
        assert_eq!(ported.ports.len(), 2);
        assert!(ported.ports.iter().all(|p| p.state == "open"));
        assert_eq!(ported.metadata["open_ports_count"], 2);

        // MAC-bearing host derives its OUI.
        let mac_host = &devices[1];
        assert_eq!(mac_host.ip_address, "192.168.1.20");
        assert_eq!(mac_host.oui.as_deref(), Some("AABBCC"));
        assert_eq!(mac_host.vendor.as_deref(), Some("Test Vendor"));
        assert!(mac_host.ports.is_empty());
    }

    #[test]
    fn oui_derivation_strips_separators() {
        assert_eq!(oui_from_mac("AA:BB:CC:DD:EE:FF"), "AABBCC");
        assert_eq!(oui_from_mac("aa:bb:cc:dd:ee:ff"), "AABBCC");
        assert_eq!(oui_from_mac("00-11-22-33-44-55"), "001122");
    }

    #[test]
    fn best_os_match_flattens_into_observation() {
        let xml = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host>
    <status state="up"/>
    <address addr="10.0.0.5" addrtype="ipv4"/>
    <os>
      <osmatch name="Windows 10" accuracy="85">
        <osclass vendor="Microsoft" osfamily="Windows" osgen="10"/>
      </osmatch>
      <osmatch name="Windows Server 2019" accuracy="92">
        <osclass vendor="Microsoft" osfamily="Windows" osgen="2019"/>
      </osmatch>
    </os>
  </host>
</nmaprun>"#;

        let report = parse_report(xml).unwrap();
        let devices = extract_devices(&report);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].os_name.as_deref(), Some("Windows Server 2019"));
        assert_eq!(devices[0].os_family.as_deref(), Some("Windows"));
        assert_eq!(devices[0].os_version.as_deref(), Some("2019"));
        assert_eq!(devices[0].os_accuracy, Some(92));
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_partial_report() {
        assert!(matches!(parse_report(""), Err(ScanError::EmptyOutput)));
        assert!(matches!(
            parse_report("not xml at all <"),
            Err(ScanError::XmlParse(_))
        ));
    }

    #[test]
    fn host_without_ipv4_is_skipped() {
        let xml = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host>
    <status state="up"/>
    <address addr="fe80::2" addrtype="ipv6"/>
  </host>
</nmaprun>"#;
        let report = parse_report(xml).unwrap();
        assert_eq!(extract_devices(&report).len(), 0);
    }
}
