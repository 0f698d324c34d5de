use crate::models::TriageFinding;

const ESCALATING: &[&str] = &["high", "critical"];

/// True when at least one triage finding is severe enough to justify a deep scan.
pub fn should_escalate(findings: &[TriageFinding]) -> bool {
    findings.iter().any(|f| {
        ESCALATING
            .iter()
            .any(|level| f.severity.trim().eq_ignore_ascii_case(level))
    })
}
