use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::services::orchestrator::Orchestrator;

/// Cached result of one library's connectivity probe.
#[derive(Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub error: Option<String>,
    pub checked_at: Instant,
}

/// Shared application state passed to all route handlers.
///
/// The orchestrator is shared with the processing loop behind a mutex, so a
/// health probe never interleaves with asset processing. Probe results are
/// cached to keep the endpoint cheap under frequent polling.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Mutex<Orchestrator>>,
    pub probes: Arc<Mutex<HashMap<String, ProbeResult>>>,
    pub probe_ttl: Duration,
}

impl AppState {
    pub fn new(orchestrator: Arc<Mutex<Orchestrator>>, probe_ttl: Duration) -> Self {
        Self {
            orchestrator,
            probes: Arc::new(Mutex::new(HashMap::new())),
            probe_ttl,
        }
    }
}
