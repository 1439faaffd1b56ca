use std::collections::BTreeMap;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::{AppState, ProbeResult};
use crate::models::ProgressCounters;
use crate::services::failure_tracker::FailureSummary;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub libraries: BTreeMap<String, LibraryHealth>,
    pub progress: ProgressCounters,
    pub failures: FailureSummary,
}

#[derive(Serialize)]
pub struct LibraryHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<LibraryUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct LibraryUser {
    pub name: String,
    pub email: String,
}

/// GET /health — probe connectivity for every configured library.
///
/// Probes use the silent client variants so a poll never disturbs logs or
/// the tag caches, and the active-library pointer is restored afterwards.
/// Results are cached per library for the configured TTL.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mut orchestrator = state.orchestrator.lock().await;
    let mut probes = state.probes.lock().await;

    let original_index = orchestrator.client().current_index();
    let library_names = orchestrator.client().library_names();
    let now = Instant::now();

    let mut libraries = BTreeMap::new();
    let mut all_healthy = true;

    for (index, name) in library_names.iter().enumerate() {
        let cached = probes
            .get(name)
            .filter(|p| now.duration_since(p.checked_at) < state.probe_ttl)
            .cloned();
        let probe = match cached {
            Some(probe) => probe,
            None => {
                let probe = probe_library(&mut orchestrator, index).await;
                probes.insert(name.clone(), probe.clone());
                probe
            }
        };

        if !probe.healthy {
            all_healthy = false;
        }
        libraries.insert(
            name.clone(),
            LibraryHealth {
                status: if probe.healthy { "healthy" } else { "unhealthy" }.to_string(),
                user: probe.user_name.as_ref().map(|n| LibraryUser {
                    name: n.clone(),
                    email: probe.user_email.clone().unwrap_or_default(),
                }),
                error: probe.error,
            },
        );
    }

    // Restore the library that was active before probing.
    if orchestrator
        .client_mut()
        .switch_library_silent(original_index)
        .is_err()
    {
        all_healthy = false;
    }

    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        libraries,
        progress: orchestrator.progress().clone(),
        failures: orchestrator.failure_summary(),
    };
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

async fn probe_library(
    orchestrator: &mut crate::services::orchestrator::Orchestrator,
    index: usize,
) -> ProbeResult {
    let checked_at = Instant::now();
    if let Err(error) = orchestrator.client_mut().switch_library_silent(index) {
        return ProbeResult {
            healthy: false,
            user_name: None,
            user_email: None,
            error: Some(error.to_string()),
            checked_at,
        };
    }

    if !orchestrator.client().test_connection_silent().await {
        return ProbeResult {
            healthy: false,
            user_name: None,
            user_email: None,
            error: Some("connection test failed".to_string()),
            checked_at,
        };
    }

    match orchestrator.client().current_user().await {
        Ok(user) => ProbeResult {
            healthy: true,
            user_name: Some(user.name),
            user_email: Some(user.email),
            error: None,
            checked_at,
        },
        Err(error) => ProbeResult {
            healthy: false,
            user_name: None,
            user_email: None,
            error: Some(error.to_string()),
            checked_at,
        },
    }
}
