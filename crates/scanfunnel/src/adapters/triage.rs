use async_trait::async_trait;
use tracing::{info, warn};

use super::TriageScanner;
use crate::{
    config::{validate_target, TriageConfig},
    models::TriageFinding,
    parser::parse_nuclei_jsonl,
    security::run_command_allowlisted,
};

const ALLOWED: &[&str] = &["nuclei", "/usr/bin/nuclei", "/usr/local/bin/nuclei"];

pub struct NucleiAdapter {
    cfg: TriageConfig,
}

impl NucleiAdapter {
    pub fn new(cfg: TriageConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl TriageScanner for NucleiAdapter {
    fn name(&self) -> &'static str {
        "nuclei"
    }

    async fn triage(&self, target: &str) -> Vec<TriageFinding> {
        if let Err(e) = validate_target(target) {
            warn!(error = %e, host = target, "refusing triage target");
            return Vec::new();
        }

        let mut args = vec!["-target".to_string(), target.to_string()];
        args.extend(self.cfg.args.iter().cloned());

        let out = match run_command_allowlisted(
            self.name(),
            &self.cfg.binary,
            &args,
            ALLOWED,
            self.cfg.timeout_secs,
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, host = target, "triage scanner did not run");
                return Vec::new();
            }
        };

        if !out.success {
            warn!(host = target, stderr = out.stderr.trim(), "triage scanner exited with failure, keeping partial output");
        }

        let findings = parse_nuclei_jsonl(&out.stdout, target);
        info!(host = target, findings = findings.len(), "triage finished");
        findings
    }
}
