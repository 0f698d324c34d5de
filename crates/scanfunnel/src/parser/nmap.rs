use quick_xml::de::from_str;

use crate::{
    error::{Result, ScanError},
    models::{HostSnapshot, OpenPort},
};

#[derive(Debug, serde::Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHost {
    #[serde(default)]
    status: Option<NmapState>,
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    hostnames: Option<NmapHostnames>,
    #[serde(default)]
    ports: Option<NmapPorts>,
    #[serde(default)]
    os: Option<NmapOs>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addrtype: Option<String>,
    #[serde(rename = "@vendor", default)]
    vendor: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<NmapHostname>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostname {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(rename = "@protocol")]
    protocol: String,
    state: NmapState,
    #[serde(default)]
    service: Option<NmapService>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapService {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapOs {
    #[serde(rename = "osmatch", default)]
    matches: Vec<NmapOsMatch>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapOsMatch {
    #[serde(rename = "@name")]
    name: String,
}

/// Maps prober XML output to one snapshot per responding host, in document
/// order. Hosts reported down are dropped.
pub fn parse_nmap_xml(xml: &str) -> Result<Vec<HostSnapshot>> {
    let run: NmapRun = from_str(xml).map_err(|e| ScanError::protocol("nmap", e.to_string()))?;

    let mut snapshots = Vec::with_capacity(run.hosts.len());
    for host in run.hosts {
        if host.status.as_ref().is_some_and(|s| s.state != "up") {
            continue;
        }

        let ip = host
            .addresses
            .iter()
            .find(|a| matches!(a.addrtype.as_deref(), None | Some("ipv4") | Some("ipv6")))
            .map(|a| a.addr.clone());
        let Some(ip) = ip else {
            continue;
        };
        let mac = host
            .addresses
            .iter()
            .find(|a| a.addrtype.as_deref() == Some("mac"));

        let open_ports = host
            .ports
            .map(|p| p.ports)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.state.state == "open")
            .map(|p| OpenPort {
                port: p.portid,
                protocol: p.protocol,
                service_name: p.service.map(|s| s.name),
            })
            .collect();

        snapshots.push(HostSnapshot {
            ip,
            mac: mac.map(|m| m.addr.clone()),
            vendor: mac.and_then(|m| m.vendor.clone()),
            hostname: host
                .hostnames
                .and_then(|h| h.hostnames.into_iter().next().map(|n| n.name)),
            os_guess: host
                .os
                .and_then(|os| os.matches.into_iter().next().map(|m| m.name)),
            open_ports,
        });
    }

    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::parse_nmap_xml;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nmaprun scanner="nmap" args="nmap -sS -O -oX - 10.0.0.0/24" version="7.94">
  <scaninfo type="syn" protocol="tcp" numservices="1000" services="1-1000"/>
  <host starttime="1700000000" endtime="1700000010">
    <status state="up" reason="arp-response" reason_ttl="0"/>
    <address addr="10.0.0.5" addrtype="ipv4"/>
    <address addr="B8:27:EB:12:34:56" addrtype="mac" vendor="Raspberry Pi Foundation"/>
    <hostnames><hostname name="pi.lan" type="PTR"/></hostnames>
    <ports>
      <extraports state="closed" count="997"/>
      <port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh" method="table" conf="3"/></port>
      <port protocol="tcp" portid="80"><state state="open" reason="syn-ack"/><service name="http" method="table" conf="3"/></port>
      <port protocol="tcp" portid="443"><state state="filtered" reason="no-response"/></port>
    </ports>
    <os>
      <portused state="open" proto="tcp" portid="22"/>
      <osmatch name="Linux 5.0 - 5.14" accuracy="98" line="1"/>
      <osmatch name="Linux 4.15" accuracy="90" line="2"/>
    </os>
  </host>
  <host>
    <status state="up" reason="user-set"/>
    <address addr="10.0.0.7" addrtype="ipv4"/>
    <hostnames/>
    <ports><extraports state="filtered" count="1000"/></ports>
  </host>
  <host>
    <status state="down" reason="no-response"/>
    <address addr="10.0.0.8" addrtype="ipv4"/>
  </host>
  <runstats><finished time="1700000020"/><hosts up="2" down="1" total="3"/></runstats>
</nmaprun>"#;

    #[test]
    fn parse_nmap_xml_extracts_hosts_and_open_ports() {
        let hosts = parse_nmap_xml(SAMPLE).expect("parse should work");
        assert_eq!(hosts.len(), 2);

        let pi = &hosts[0];
        assert_eq!(pi.ip, "10.0.0.5");
        assert_eq!(pi.mac.as_deref(), Some("B8:27:EB:12:34:56"));
        assert_eq!(pi.vendor.as_deref(), Some("Raspberry Pi Foundation"));
        assert_eq!(pi.hostname.as_deref(), Some("pi.lan"));
        assert_eq!(pi.os_guess.as_deref(), Some("Linux 5.0 - 5.14"));
        assert_eq!(pi.open_ports.len(), 2);
        assert_eq!(pi.open_ports[0].port, 22);
        assert_eq!(pi.open_ports[1].service_name.as_deref(), Some("http"));
    }

    #[test]
    fn hosts_without_open_ports_are_still_reported() {
        let hosts = parse_nmap_xml(SAMPLE).expect("parse should work");
        let quiet = &hosts[1];
        assert_eq!(quiet.ip, "10.0.0.7");
        assert!(quiet.open_ports.is_empty());
        assert!(quiet.mac.is_none());
        assert!(quiet.hostname.is_none());
    }

    #[test]
    fn empty_run_yields_no_hosts() {
        let hosts = parse_nmap_xml("<nmaprun><runstats/></nmaprun>").expect("parse should work");
        assert!(hosts.is_empty());
    }

    #[test]
    fn malformed_output_is_a_protocol_error() {
        let err = parse_nmap_xml("<nmaprun><host></nmaprun>").unwrap_err();
        assert!(err.to_string().contains("nmap protocol error"));
    }
}
