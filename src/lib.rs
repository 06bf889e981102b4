use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("The target Deployment {namespace}/{name} does not exist")]
    TargetNotFound { namespace: String, name: String },

    #[error("Invalid JOB_NAME_PATTERN: {0}")]
    InvalidJobNamePattern(#[from] regex::Error),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Jobs are not watchable: {0}")]
    WatchUnavailable(#[source] kube::Error),

    #[error("Failed to initialize tracing: {0}")]
    Telemetry(String),

    #[error("Metrics Error: {0}")]
    MetricsError(#[from] prometheus::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::TargetNotFound { .. } => "TargetNotFound",
            Error::InvalidJobNamePattern(_) => "InvalidJobNamePattern",
            Error::InvalidSetting(_) => "InvalidSetting",
            Error::WatchUnavailable(_) => "WatchUnavailable",
            Error::Telemetry(_) => "Telemetry",
            Error::MetricsError(_) => "MetricsError",
        }
    }
}

pub mod cluster;
pub mod config;
pub mod controllers;
pub mod filter;
pub mod precheck;
pub mod queue;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Patch builders and job predicates
pub mod reconcilers;

pub use controllers::jobwatcher::run;
pub use controllers::State;
