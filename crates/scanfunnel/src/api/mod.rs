use std::{net::IpAddr, str::FromStr};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info};

use crate::{security::in_scope, AppState};

pub async fn health(State(state): State<AppState>) -> Response {
    match state.orchestrator.inventory().host_count().await {
        Ok(hosts) => Json(serde_json::json!({
            "status": "ok",
            "service": "scanfunnel",
            "hosts": hosts,
        }))
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

pub async fn online_hosts(State(state): State<AppState>) -> Response {
    match state.orchestrator.inventory().online_hosts().await {
        Ok(hosts) => Json(hosts).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn list_tasks(State(state): State<AppState>) -> Response {
    match state.orchestrator.inventory().recent_scan_tasks(100).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn trigger_triage(State(state): State<AppState>, Path(target): Path<String>) -> Response {
    if let Err(resp) = admit(&state, &target).await {
        return resp;
    }

    let orchestrator = state.orchestrator.clone();
    let job_target = target.clone();
    tokio::spawn(async move {
        match orchestrator.manual_triage(&job_target).await {
            Ok(outcome) => info!(
                host = %job_target,
                findings = outcome.findings,
                escalated = outcome.task_id.is_some(),
                "manual triage finished"
            ),
            Err(e) => error!(error = %e, host = %job_target, "manual triage failed"),
        }
    });

    accepted("triage", &target)
}

pub async fn trigger_deep_scan(State(state): State<AppState>, Path(ip): Path<String>) -> Response {
    if IpAddr::from_str(&ip).is_err() {
        return (StatusCode::BAD_REQUEST, "deep scans take a single IP address").into_response();
    }
    if let Err(resp) = admit(&state, &ip).await {
        return resp;
    }

    let orchestrator = state.orchestrator.clone();
    let job_ip = ip.clone();
    tokio::spawn(async move {
        match orchestrator.manual_deep_scan(&job_ip).await {
            Ok(task_id) => info!(host = %job_ip, task_id = %task_id, "manual deep scan dispatched"),
            Err(e) => error!(error = %e, host = %job_ip, "manual deep scan failed"),
        }
    });

    accepted("deep_scan", &ip)
}

/// Scope and rate checks shared by every manual trigger.
async fn admit(state: &AppState, target: &str) -> Result<(), Response> {
    if !in_scope(target, &state.config.scope_allowlist) {
        return Err((StatusCode::FORBIDDEN, "target out of scope").into_response());
    }

    let mut limiter = state.rate_limiter.lock().await;
    if !limiter.allow() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response());
    }
    Ok(())
}

fn accepted(kind: &str, target: &str) -> Response {
    info!(kind, host = target, "audit: manual run accepted");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted", "kind": kind, "target": target})),
    )
        .into_response()
}
