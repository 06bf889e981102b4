use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use serde_json::{json, Value};

/// Set on a job once its completion has triggered a restart
pub const PROCESSED_ANNOTATION: &str = "job-watcher/processed";
/// Pod template annotation whose change makes the deployment roll its pods
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

const JOB_COMPLETE: &str = "Complete";
const CONDITION_TRUE: &str = "True";

/// Whether the restart for this job has already been issued
pub fn is_processed(job: &Job) -> bool {
    job.annotations()
        .get(PROCESSED_ANNOTATION)
        .is_some_and(|v| v == "true")
}

/// Whether the job carries a `Complete=True` condition
pub fn is_complete(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == JOB_COMPLETE && c.status == CONDITION_TRUE)
        })
}

/// Whether the job was created strictly before `cutoff`.
///
/// A job without a creation timestamp is treated as older than any cutoff.
pub fn created_before(job: &Job, cutoff: DateTime<Utc>) -> bool {
    match job.metadata.creation_timestamp.as_ref() {
        Some(created) => created.0 < cutoff,
        None => true,
    }
}

/// Merge patch for a deployment that only touches the restart annotation of its pod template
pub fn restart_patch(restarted_at: DateTime<Utc>) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: restarted_at.to_rfc3339_opts(SecondsFormat::Secs, true)
                    }
                }
            }
        }
    })
}

/// Merge patch marking a job as processed
pub fn processed_patch() -> Value {
    json!({
        "metadata": {
            "annotations": {
                PROCESSED_ANNOTATION: "true"
            }
        }
    })
}
