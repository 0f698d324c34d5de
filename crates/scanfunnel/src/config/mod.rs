use std::{env, fs, net::IpAddr, str::FromStr, time::Duration};

use anyhow::Context;
use chrono::NaiveTime;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub scope_allowlist: Vec<String>,
    pub manual_runs_per_minute: usize,
    pub discovery: DiscoveryConfig,
    pub triage: TriageConfig,
    pub deep_scan: DeepScanConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Address range handed to the prober, e.g. `192.168.1.0/24`.
    pub target_range: Option<String>,
    pub binary: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub require_root: bool,
    /// Set hosts `down` when a successful sweep no longer sees them.
    pub mark_missing_hosts_down: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepScanConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub cli_binary: String,
    pub timeout_secs: u64,
    pub scanner_id: String,
    pub config_id: String,
    pub port_list_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub funnel_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Local wall-clock time of the nightly re-audit, `HH:MM`.
    pub nightly_audit_at: String,
    pub audit_pacing_secs: u64,
    pub tick_secs: u64,
    pub startup_delay_secs: u64,
    pub error_backoff_secs: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SCANFUNNEL_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SF_HOST") {
            self.host = v;
        }
        if let Some(v) = var("SF_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("SF_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("SF_SCOPE_ALLOWLIST") {
            self.scope_allowlist = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = var("SCAN_TARGET_CIDR") {
            self.discovery.target_range = Some(v.trim().to_string()).filter(|v| !v.is_empty());
        }
        if let Some(v) = var("GVM_HOST") {
            self.deep_scan.host = v;
        }
        if let Some(v) = var("GVM_PORT") {
            self.deep_scan.port = v.parse().unwrap_or(self.deep_scan.port);
        }
        if let Some(v) = var("GVM_USER") {
            self.deep_scan.username = Some(v);
        }
        if let Some(v) = var("GVM_PASSWORD") {
            self.deep_scan.password = Some(v);
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://scanfunnel.db".to_string(),
            scope_allowlist: vec!["127.0.0.1/32".to_string(), "localhost".to_string()],
            manual_runs_per_minute: 10,
            discovery: DiscoveryConfig::default(),
            triage: TriageConfig::default(),
            deep_scan: DeepScanConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target_range: None,
            binary: "nmap".to_string(),
            args: ["-sS", "-O", "--osscan-guess", "-T4", "-Pn"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            timeout_secs: 3600,
            require_root: true,
            mark_missing_hosts_down: false,
        }
    }
}

impl DiscoveryConfig {
    /// The configured range, validated. Absent or malformed ranges disable
    /// discovery until corrected.
    pub fn target(&self) -> Result<&str> {
        let range = self
            .target_range
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                ScanError::Configuration("SCAN_TARGET_CIDR / discovery.target_range is not set".into())
            })?;
        validate_target(range)?;
        Ok(range)
    }
}

/// Accepts CIDR networks, single addresses and host names. Anything that
/// could be read as a command-line flag is refused.
pub fn validate_target(target: &str) -> Result<()> {
    if IpNet::from_str(target).is_ok() || IpAddr::from_str(target).is_ok() {
        return Ok(());
    }
    let plausible = !target.is_empty()
        && !target.starts_with('-')
        && target.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if plausible {
        Ok(())
    } else {
        Err(ScanError::Configuration(format!("invalid scan target {target:?}")))
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            binary: "nuclei".to_string(),
            args: ["-jsonl", "-silent", "-disable-update-check"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            timeout_secs: 900,
        }
    }
}

impl Default for DeepScanConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9390,
            username: None,
            password: None,
            cli_binary: "gvm-cli".to_string(),
            timeout_secs: 120,
            // Stock OpenVAS scanner, "Full and fast" config, "All IANA assigned TCP".
            scanner_id: "08b69003-5fc2-4037-a479-93b440211c73".to_string(),
            config_id: "daba56c8-73ec-11df-a475-002264764cea".to_string(),
            port_list_id: "33d0cd82-57c6-11e1-8ed1-406186ea4fc5".to_string(),
        }
    }
}

impl DeepScanConfig {
    pub fn credentials(&self) -> Result<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Ok((u, p)),
            _ => Err(ScanError::Configuration(
                "GVM_USER and GVM_PASSWORD are not set; deep scanning is disabled".into(),
            )),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            funnel_interval_secs: 30 * 60,
            reconcile_interval_secs: 15 * 60,
            nightly_audit_at: "02:00".to_string(),
            audit_pacing_secs: 5,
            tick_secs: 30,
            startup_delay_secs: 60,
            error_backoff_secs: 60,
        }
    }
}

impl ScheduleConfig {
    pub fn audit_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.nightly_audit_at.trim(), "%H:%M").map_err(|e| {
            ScanError::Configuration(format!(
                "invalid nightly_audit_at {:?}: {e}",
                self.nightly_audit_at
            ))
        })
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn audit_pacing(&self) -> Duration {
        Duration::from_secs(self.audit_pacing_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("SCAN_TARGET_CIDR", "192.168.1.0/24"),
            ("GVM_USER", "admin"),
            ("GVM_PASSWORD", "secret"),
            ("GVM_PORT", "not-a-port"),
            ("SF_SCOPE_ALLOWLIST", "10.0.0.0/8, lab.local"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.discovery.target().unwrap(), "192.168.1.0/24");
        assert_eq!(cfg.deep_scan.credentials().unwrap(), ("admin", "secret"));
        assert_eq!(cfg.deep_scan.port, 9390);
        assert_eq!(cfg.scope_allowlist, vec!["10.0.0.0/8", "lab.local"]);
    }

    #[test]
    fn missing_range_and_credentials_are_configuration_errors() {
        let cfg = AppConfig::default();
        assert!(matches!(cfg.discovery.target(), Err(ScanError::Configuration(_))));
        assert!(matches!(cfg.deep_scan.credentials(), Err(ScanError::Configuration(_))));
    }

    #[test]
    fn targets_that_look_like_flags_are_rejected() {
        assert!(validate_target("10.0.0.0/24").is_ok());
        assert!(validate_target("fe80::1").is_ok());
        assert!(validate_target("scanme.nmap.org").is_ok());
        assert!(validate_target("-iL/etc/passwd").is_err());
        assert!(validate_target("10.0.0.1; rm").is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"port": 9000, "schedule": {"nightly_audit_at": "03:30"}}"#)
                .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.schedule.reconcile_interval_secs, 900);
        assert_eq!(
            cfg.schedule.audit_time().unwrap(),
            NaiveTime::from_hms_opt(3, 30, 0).unwrap()
        );
        assert!(ScheduleConfig {
            nightly_audit_at: "25:00".into(),
            ..ScheduleConfig::default()
        }
        .audit_time()
        .is_err());
    }
}
