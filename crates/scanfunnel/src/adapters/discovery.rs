use async_trait::async_trait;
use tracing::info;

use super::DiscoveryScanner;
use crate::{
    config::{validate_target, DiscoveryConfig},
    error::{Result, ScanError},
    models::HostSnapshot,
    parser::parse_nmap_xml,
    security::run_command_allowlisted,
};

const ALLOWED: &[&str] = &["nmap", "/usr/bin/nmap", "/usr/local/bin/nmap"];

pub struct NmapAdapter {
    cfg: DiscoveryConfig,
}

impl NmapAdapter {
    pub fn new(cfg: DiscoveryConfig) -> Self {
        Self { cfg }
    }

    fn args_for(&self, range: &str) -> Vec<String> {
        let mut args = self.cfg.args.clone();
        args.extend(["-oX".to_string(), "-".to_string(), range.to_string()]);
        args
    }
}

#[cfg(unix)]
fn has_privileges() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn has_privileges() -> bool {
    true
}

#[async_trait]
impl DiscoveryScanner for NmapAdapter {
    fn name(&self) -> &'static str {
        "nmap"
    }

    async fn discover(&self, range: &str) -> Result<Vec<HostSnapshot>> {
        validate_target(range)?;
        if self.cfg.require_root && !has_privileges() {
            return Err(ScanError::PermissionDenied { tool: self.name() });
        }

        let out = run_command_allowlisted(
            self.name(),
            &self.cfg.binary,
            &self.args_for(range),
            ALLOWED,
            self.cfg.timeout_secs,
        )
        .await?;

        if !out.success {
            if out.stderr.contains("root privileges") {
                return Err(ScanError::PermissionDenied { tool: self.name() });
            }
            return Err(ScanError::unavailable(self.name(), out.stderr.trim()));
        }

        let hosts = parse_nmap_xml(&out.stdout)?;
        info!(range, hosts = hosts.len(), "discovery sweep finished");
        Ok(hosts)
    }
}
