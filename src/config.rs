use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::queue::Backoff;
use crate::{Error, Result};

pub const DEFAULT_MONITORED_NAMESPACE: &str = "dev-namespace";
pub const DEFAULT_TARGET_DEPLOYMENT_NAME: &str = "dev-deployment";
pub const DEFAULT_JOB_NAME_PATTERN: &str = "^dev-job-.+$";

/// Process-wide configuration, fixed once the controller starts
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace in which jobs are watched and the target deployment lives
    pub monitored_namespace: String,
    /// Deployment restarted whenever a matching job completes
    pub target_deployment_name: String,
    /// Jobs whose names don't match are ignored
    pub job_name_pattern: Regex,
    /// Jobs created before this instant are never acted upon
    pub startup_cutoff: DateTime<Utc>,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// How often every cached job is enqueued again
    pub resync_period: Duration,
    /// Per-key retry delays after a failed reconcile
    pub backoff: Backoff,
}

/// Raw configuration values, usually straight from flags or the environment
#[derive(Clone, Debug, Default)]
pub struct RawSettings {
    pub monitored_namespace: String,
    pub target_deployment_name: String,
    pub job_name_pattern: String,
    pub workers: usize,
    pub resync_period: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Settings {
    /// Validate raw values, substituting defaults for empty strings.
    ///
    /// A pattern that fails to compile, a zero resync period or a zero backoff
    /// base is an error; callers treat it as fatal.
    pub fn new(raw: RawSettings, startup_cutoff: DateTime<Utc>) -> Result<Self> {
        let pattern = or_default(raw.job_name_pattern, DEFAULT_JOB_NAME_PATTERN);
        let job_name_pattern = Regex::new(&pattern)?;

        if raw.resync_period.is_zero() {
            return Err(Error::InvalidSetting(
                "RESYNC_PERIOD_SECS must be greater than zero".into(),
            ));
        }
        if raw.backoff_base.is_zero() {
            return Err(Error::InvalidSetting(
                "BACKOFF_BASE_MS must be greater than zero".into(),
            ));
        }

        Ok(Self {
            monitored_namespace: or_default(raw.monitored_namespace, DEFAULT_MONITORED_NAMESPACE),
            target_deployment_name: or_default(
                raw.target_deployment_name,
                DEFAULT_TARGET_DEPLOYMENT_NAME,
            ),
            job_name_pattern,
            startup_cutoff,
            workers: raw.workers.max(1),
            resync_period: raw.resync_period,
            backoff: Backoff::new(raw.backoff_base, raw.backoff_max),
        })
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}
