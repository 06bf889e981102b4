use regex::Regex;

use crate::config::Settings;

/// Decides which job notifications may enter the work queue
#[derive(Clone, Debug)]
pub struct AdmissionFilter {
    namespace: String,
    pattern: Regex,
}

impl AdmissionFilter {
    pub fn new(namespace: impl Into<String>, pattern: Regex) -> Self {
        Self {
            namespace: namespace.into(),
            pattern,
        }
    }

    /// True iff the object lives in the monitored namespace and its name matches the pattern
    pub fn admit(&self, namespace: &str, name: &str) -> bool {
        namespace == self.namespace && self.pattern.is_match(name)
    }
}

impl From<&Settings> for AdmissionFilter {
    fn from(settings: &Settings) -> Self {
        Self::new(
            settings.monitored_namespace.clone(),
            settings.job_name_pattern.clone(),
        )
    }
}
