use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

pub mod jobwatcher;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    /// When a job was last reconciled
    pub last_event: DateTime<Utc>,
    /// When the target deployment was last restarted by this process
    pub last_restart: Option<DateTime<Utc>>,
    /// Jobs created before this instant are ignored
    pub startup_cutoff: DateTime<Utc>,
}

impl Diagnostics {
    fn new(startup_cutoff: DateTime<Utc>) -> Self {
        Self {
            last_event: Utc::now(),
            last_restart: None,
            startup_cutoff,
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(startup_cutoff: DateTime<Utc>) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(startup_cutoff))),
            registry: prometheus::Registry::default(),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
