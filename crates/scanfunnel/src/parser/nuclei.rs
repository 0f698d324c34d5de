use serde::Deserialize;
use tracing::warn;

use crate::models::{FindingSource, NewFinding, TriageFinding};

#[derive(Debug, Deserialize)]
struct NucleiLine {
    #[serde(rename = "template-id")]
    template_id: String,
    #[serde(default)]
    host: Option<String>,
    info: NucleiInfo,
    #[serde(rename = "extracted-results", default)]
    extracted_results: Option<Vec<String>>,
    #[serde(rename = "matched-at", default)]
    matched_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NucleiInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    classification: Option<NucleiClassification>,
}

#[derive(Debug, Deserialize)]
struct NucleiClassification {
    #[serde(rename = "cve-id", default)]
    cve_id: Option<serde_json::Value>,
}

/// Maps newline-delimited scanner output to findings. Lines that fail to
/// decode are logged and skipped; the rest of the output is kept.
pub fn parse_nuclei_jsonl(output: &str, target: &str) -> Vec<TriageFinding> {
    let mut findings = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parsed: NucleiLine = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, line, "skipping undecodable triage line");
                continue;
            }
        };

        let cve = parsed
            .info
            .classification
            .and_then(|c| c.cve_id)
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .find_map(|i| i.as_str().map(ToString::to_string)),
                _ => None,
            })
            .map(|c| c.to_uppercase());

        findings.push(TriageFinding {
            name: parsed
                .info
                .name
                .unwrap_or_else(|| parsed.template_id.clone()),
            template_id: parsed.template_id,
            host: parsed
                .host
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| target.to_string()),
            severity: parsed
                .info
                .severity
                .unwrap_or_else(|| "unknown".to_string())
                .to_lowercase(),
            description: parsed.info.description.filter(|d| !d.trim().is_empty()),
            extracted_results: parsed.extracted_results.unwrap_or_default(),
            matched_at: parsed.matched_at,
            cve,
        });
    }
    findings
}

/// Unified view of a triage finding for `host_ip`.
pub fn unified_finding(finding: &TriageFinding, host_ip: &str) -> NewFinding {
    let (port, service) = finding
        .matched_at
        .as_deref()
        .map(endpoint_of)
        .unwrap_or((None, None));
    let description = match &finding.description {
        Some(d) => format!("{}: {}", finding.name, d.trim()),
        None => finding.name.clone(),
    };

    NewFinding {
        host_ip: host_ip.to_string(),
        port,
        service,
        severity: finding.severity.clone(),
        cve: finding.cve.clone(),
        description: truncate(&description, 1000),
        source: FindingSource::Triage,
    }
}

/// Port and scheme of a `matched-at` value such as `https://10.0.0.5:8443/x`
/// or `10.0.0.5:22`.
fn endpoint_of(matched_at: &str) -> (Option<u16>, Option<String>) {
    let (scheme, rest) = match matched_at.split_once("://") {
        Some((s, r)) => (Some(s.to_lowercase()), r),
        None => (None, matched_at),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let explicit = authority
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse::<u16>().ok());
    let port = explicit.or(match scheme.as_deref() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    });
    (port, scheme)
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
