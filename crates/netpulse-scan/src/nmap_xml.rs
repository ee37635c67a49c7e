//! Nmap XML output deserialization.
//!
//! Nmap's `-oX` flag writes structured XML. This module provides typed
//! Rust structs that deserialize from that XML using `quick-xml` with
//! serde, covering hosts, addresses, ports, services, OS matches,
//! script output, uptime, and run statistics.

use serde::Deserialize;

use crate::error::{Result, ScanError};

/// Root element: `<nmaprun>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "nmaprun")]
pub struct NmapRun {
    #[serde(rename = "@scanner")]
    pub scanner: Option<String>,
    #[serde(rename = "@version")]
    pub version: Option<String>,
    #[serde(rename = "@args")]
    pub args: Option<String>,
    #[serde(rename = "@start")]
    pub start: Option<i64>,
    #[serde(rename = "@startstr")]
    pub start_str: Option<String>,
    pub scaninfo: Option<ScanInfo>,
    #[serde(rename = "host", default)]
    pub hosts: Vec<NmapHost>,
    pub runstats: Option<RunStats>,
}

/// `<scaninfo>`: scan technique metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanInfo {
    #[serde(rename = "@type")]
    pub scan_type: Option<String>,
    #[serde(rename = "@protocol")]
    pub protocol: Option<String>,
    #[serde(rename = "@services")]
    pub services: Option<String>,
}

/// A single host from scan results.
#[derive(Debug, Clone, Deserialize)]
pub struct NmapHost {
    pub status: Option<HostStatus>,
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    pub hostnames: Option<Hostnames>,
    pub ports: Option<Ports>,
    pub os: Option<OsMatches>,
    pub hostscript: Option<HostScript>,
    pub uptime: Option<Uptime>,
    pub distance: Option<Distance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostStatus {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@addrtype")]
    pub addr_type: String,
    #[serde(rename = "@vendor")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hostnames {
    #[serde(rename = "hostname", default)]
    pub hostnames: Vec<Hostname>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hostname {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub hostname_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ports {
    #[serde(rename = "port", default)]
    pub ports: Vec<NmapPort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NmapPort {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@portid")]
    pub port_id: u16,
    pub state: PortState,
    pub service: Option<NmapService>,
    #[serde(rename = "script", default)]
    pub scripts: Vec<Script>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortState {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NmapService {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@product")]
    pub product: Option<String>,
    #[serde(rename = "@version")]
    pub version: Option<String>,
    #[serde(rename = "@extrainfo")]
    pub extra_info: Option<String>,
    #[serde(rename = "cpe", default)]
    pub cpe: Vec<String>,
}

/// NSE script output attached to a port or host.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@output")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostScript {
    #[serde(rename = "script", default)]
    pub scripts: Vec<Script>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsMatches {
    #[serde(rename = "osmatch", default)]
    pub matches: Vec<OsMatch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsMatch {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@accuracy")]
    pub accuracy: Option<String>,
    #[serde(rename = "osclass", default)]
    pub classes: Vec<OsClass>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsClass {
    #[serde(rename = "@type")]
    pub class_type: Option<String>,
    #[serde(rename = "@vendor")]
    pub vendor: Option<String>,
    #[serde(rename = "@osfamily")]
    pub os_family: Option<String>,
    #[serde(rename = "@osgen")]
    pub os_gen: Option<String>,
    #[serde(rename = "@accuracy")]
    pub accuracy: Option<String>,
    #[serde(rename = "cpe", default)]
    pub cpe: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Uptime {
    #[serde(rename = "@seconds")]
    pub seconds: Option<u64>,
    #[serde(rename = "@lastboot")]
    pub last_boot: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Distance {
    #[serde(rename = "@value")]
    pub value: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStats {
    pub finished: Option<Finished>,
    pub hosts: Option<RunStatsHosts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Finished {
    #[serde(rename = "@time")]
    pub time: Option<i64>,
    #[serde(rename = "@elapsed")]
    pub elapsed: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStatsHosts {
    #[serde(rename = "@up")]
    pub up: Option<i64>,
    #[serde(rename = "@down")]
    pub down: Option<i64>,
    #[serde(rename = "@total")]
    pub total: Option<i64>,
}

impl OsMatch {
    /// Accuracy as a number; unparseable or missing values count as zero.
    pub fn accuracy_value(&self) -> i64 {
        self.accuracy
            .as_deref()
            .and_then(|a| a.parse().ok())
            .unwrap_or(0)
    }
}

impl NmapHost {
    /// Extract the IPv4 address, if present.
    pub fn ipv4(&self) -> Option<&str> {
        self.address_of_type("ipv4")
    }

    /// Extract the IPv6 address, if present.
    pub fn ipv6(&self) -> Option<&str> {
        self.address_of_type("ipv6")
    }

    /// Extract the MAC address, if present.
    pub fn mac(&self) -> Option<&str> {
        self.address_of_type("mac")
    }

    /// Vendor string attached to the MAC address, if present.
    pub fn mac_vendor(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.addr_type == "mac")
            .and_then(|a| a.vendor.as_deref())
    }

    fn address_of_type(&self, addr_type: &str) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.addr_type == addr_type)
            .map(|a| a.addr.as_str())
    }

    /// Extract the first (canonical) hostname, if present.
    pub fn hostname(&self) -> Option<&str> {
        self.hostnames
            .as_ref()
            .and_then(|hn| hn.hostnames.first())
            .map(|h| h.name.as_str())
    }

    /// All hostnames reported for the host.
    pub fn all_hostnames(&self) -> Vec<&str> {
        self.hostnames
            .as_ref()
            .map(|hn| hn.hostnames.iter().map(|h| h.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Check if the host is up.
    pub fn is_up(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.state == "up")
    }

    /// The OS match with the numerically highest accuracy. Ties resolve
    /// to the first match encountered.
    pub fn best_os_match(&self) -> Option<&OsMatch> {
        let matches = &self.os.as_ref()?.matches;
        let mut best: Option<&OsMatch> = None;
        for m in matches {
            match best {
                Some(b) if m.accuracy_value() <= b.accuracy_value() => {}
                _ => best = Some(m),
            }
        }
        best
    }
}

/// Parse nmap XML into a structured `NmapRun`.
///
/// An empty or whitespace-only payload is rejected explicitly rather
/// than surfacing as a confusing deserialization error.
pub fn parse_nmap_xml(xml: &str) -> Result<NmapRun> {
    if xml.trim().is_empty() {
        return Err(ScanError::EmptyOutput);
    }
    quick_xml::de::from_str(xml).map_err(|e| ScanError::XmlParse(format!("{e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" version="7.95" args="nmap -sn -T4 192.168.1.0/24" start="1754400000" startstr="Wed Aug  5 10:00:00 2026">
  <host>
    <status state="up" reason="arp-response"/>
    <address addr="192.168.1.1" addrtype="ipv4"/>
    <address addr="AA:BB:CC:DD:EE:01" addrtype="mac" vendor="Test Vendor"/>
    <hostnames>
      <hostname name="gateway.local" type="PTR"/>
    </hostnames>
  </host>
  <host>
    <status state="up" reason="arp-response"/>
    <address addr="192.168.1.10" addrtype="ipv4"/>
    <address addr="AA:BB:CC:DD:EE:10" addrtype="mac"/>
  </host>
  <host>
    <status state="down" reason="no-response"/>
    <address addr="192.168.1.99" addrtype="ipv4"/>
  </host>
  <runstats>
    <finished time="1754400002" elapsed="2.50"/>
    <hosts up="2" down="254" total="256"/>
  </runstats>
</nmaprun>"#;

    const DEEP_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" version="7.95" args="nmap -sV -O -A 192.168.1.20" start="1754400100">
  <scaninfo type="syn" protocol="tcp" services="1-1000"/>
  <host>
    <status state="up" reason="syn-ack"/>
    <address addr="192.168.1.20" addrtype="ipv4"/>
    <address addr="fe80::1" addrtype="ipv6"/>
    <hostnames>
      <hostname name="web-server.local" type="PTR"/>
      <hostname name="www.local" type="user"/>
    </hostnames>
    <ports>
      <port protocol="tcp" portid="22">
        <state state="open" reason="syn-ack"/>
        <service name="ssh" product="OpenSSH" version="9.6" extrainfo="Ubuntu Linux"/>
      </port>
      <port protocol="tcp" portid="80">
        <state state="open" reason="syn-ack"/>
        <service name="http" product="nginx" version="1.24.0"/>
        <script id="http-title" output="Welcome"/>
      </port>
      <port protocol="tcp" portid="3306">
        <state state="filtered" reason="no-response"/>
      </port>
    </ports>
    <os>
      <osmatch name="Linux 5.15" accuracy="90">
        <osclass type="general purpose" vendor="Linux" osfamily="Linux" osgen="5.X" accuracy="90">
          <cpe>cpe:/o:linux:linux_kernel:5</cpe>
        </osclass>
      </osmatch>
      <osmatch name="Linux 6.1" accuracy="95">
        <osclass type="general purpose" vendor="Linux" osfamily="Linux" osgen="6.X" accuracy="95"/>
      </osmatch>
      <osmatch name="Linux 4.19" accuracy="95"/>
    </os>
    <hostscript>
      <script id="smb-os-discovery" output="OS: Linux"/>
    </hostscript>
    <uptime seconds="86400" lastboot="Tue Aug  4 10:01:40 2026"/>
    <distance value="1"/>
  </host>
  <runstats>
    <finished time="1754400130" elapsed="30.10"/>
    <hosts up="1" down="0" total="1"/>
  </runstats>
</nmaprun>"#;

    #[test]
    fn parse_discovery_scan() {
        let run = parse_nmap_xml(DISCOVERY_XML).unwrap();
        assert_eq!(run.version.as_deref(), Some("7.95"));
        assert_eq!(run.start, Some(1754400000));
        assert_eq!(run.hosts.len(), 3);
        assert_eq!(run.hosts.iter().filter(|h| h.is_up()).count(), 2);

        let gateway = &run.hosts[0];
        assert_eq!(gateway.ipv4(), Some("192.168.1.1"));
        assert_eq!(gateway.mac(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(gateway.mac_vendor(), Some("Test Vendor"));
        assert_eq!(gateway.hostname(), Some("gateway.local"));

        let bare = &run.hosts[1];
        assert_eq!(bare.mac_vendor(), None);

        let stats = run.runstats.unwrap().hosts.unwrap();
        assert_eq!(stats.up, Some(2));
        assert_eq!(stats.total, Some(256));
    }

    #[test]
    fn parse_deep_scan() {
        let run = parse_nmap_xml(DEEP_XML).unwrap();
        let host = &run.hosts[0];

        assert_eq!(host.ipv6(), Some("fe80::1"));
        assert_eq!(host.all_hostnames(), vec!["web-server.local", "www.local"]);
        assert_eq!(host.uptime.as_ref().unwrap().seconds, Some(86400));
        assert_eq!(host.distance.as_ref().unwrap().value, Some(1));
        assert_eq!(host.hostscript.as_ref().unwrap().scripts.len(), 1);

        let ports = &host.ports.as_ref().unwrap().ports;
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[1].scripts[0].id, "http-title");
        assert_eq!(ports[1].scripts[0].output.as_deref(), Some("Welcome"));

        let info = run.scaninfo.unwrap();
        assert_eq!(info.protocol.as_deref(), Some("tcp"));
    }

    #[test]
    fn best_os_match_prefers_accuracy_then_order() {
        let run = parse_nmap_xml(DEEP_XML).unwrap();
        let host = &run.hosts[0];

        // 95 beats 90; the tie between the two 95s goes to the first.
        let best = host.best_os_match().unwrap();
        assert_eq!(best.name, "Linux 6.1");
        assert_eq!(best.accuracy_value(), 95);
        assert_eq!(best.classes[0].os_family.as_deref(), Some("Linux"));
        assert_eq!(best.classes[0].os_gen.as_deref(), Some("6.X"));
    }

    #[test]
    fn empty_output_is_explicit_error() {
        assert!(matches!(parse_nmap_xml(""), Err(ScanError::EmptyOutput)));
        assert!(matches!(
            parse_nmap_xml("   \n"),
            Err(ScanError::EmptyOutput)
        ));
    }

    #[test]
    fn malformed_xml_is_parse_error() {
        let result = parse_nmap_xml("<nmaprun><host></nmaprun>");
        assert!(matches!(result, Err(ScanError::XmlParse(_))));
    }

    #[test]
    fn host_without_optional_sections() {
        let xml = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host>
    <status state="up"/>
    <address addr="10.0.1.5" addrtype="ipv4"/>
  </host>
</nmaprun>"#;
        let run = parse_nmap_xml(xml).unwrap();
        let host = &run.hosts[0];

        assert_eq!(host.ipv4(), Some("10.0.1.5"));
        assert_eq!(host.mac(), None);
        assert_eq!(host.hostname(), None);
        assert!(host.best_os_match().is_none());
        assert!(host.is_up());
    }
}
