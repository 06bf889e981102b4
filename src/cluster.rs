//! Access to the cluster objects the reconciler reads and mutates.

use std::future::Future;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::*;

use crate::Result;

pub const FIELD_MANAGER: &str = "job-watcher";

/// The cluster operations needed to reconcile a job.
///
/// Failures are surfaced as-is; retrying is left to the work queue.
pub trait ClusterClient: Send + Sync + 'static {
    /// Fetch a job, `None` if it does not exist
    fn get_job(&self, namespace: &str, name: &str)
        -> impl Future<Output = Result<Option<Job>>> + Send;

    /// Fetch a deployment, `None` if it does not exist
    fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Deployment>>> + Send;

    /// Apply a JSON merge patch to a deployment
    fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Apply a JSON merge patch to a job
    fn patch_job(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Best-effort notice that `job` caused `deployment` to restart
    fn record_restart(&self, _job: &Job, _deployment: &str) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    recorder: Recorder,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), FIELD_MANAGER.into()),
            client,
        }
    }
}

impl ClusterClient for KubeCluster {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::default();
        api.patch(name, &params, &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn patch_job(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::default();
        api.patch(name, &params, &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn record_restart(&self, job: &Job, deployment: &str) {
        let event = Event {
            type_: EventType::Normal,
            reason: "RestartTriggered".into(),
            note: Some(format!(
                "Completion of job {} restarted deployment {deployment}",
                job.name_any()
            )),
            action: "Restart".into(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &job.object_ref(&())).await {
            warn!("Failed to publish restart event for job {}: {err}", job.name_any());
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::{Mutex, MutexGuard};

    use kube::error::ErrorResponse;
    use serde_json::Value;
    use tokio::time::Instant;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    pub struct RecordedPatch {
        pub kind: &'static str,
        pub namespace: String,
        pub name: String,
        pub body: Value,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub jobs: BTreeMap<(String, String), Job>,
        pub deployments: BTreeMap<(String, String), Deployment>,
        pub patches: Vec<RecordedPatch>,
        pub deployment_reads: Vec<Instant>,
        pub events: Vec<String>,
        /// Object kinds whose patches currently fail with a conflict
        pub failing_patches: HashSet<&'static str>,
        /// Deployment reads never complete while set
        pub stalled_deployment_reads: bool,
    }

    /// In-memory cluster applying merge patches to stored objects
    #[derive(Default)]
    pub struct FakeCluster {
        state: Mutex<FakeState>,
    }

    fn api_error(code: u16, reason: &str) -> crate::Error {
        crate::Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("fake {reason}"),
            reason: reason.into(),
            code,
        }))
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    /// RFC 7386 merge
    fn merge(target: &mut Value, patch: &Value) {
        match (target, patch) {
            (Value::Object(target), Value::Object(patch)) => {
                for (k, v) in patch {
                    if v.is_null() {
                        target.remove(k);
                    } else {
                        merge(target.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
            (target, patch) => {
                if patch.is_object() {
                    *target = Value::Object(Default::default());
                    merge(target, patch);
                } else {
                    *target = patch.clone();
                }
            }
        }
    }

    fn apply<K: serde::Serialize + serde::de::DeserializeOwned>(obj: &mut K, patch: &Value) {
        let mut value = serde_json::to_value(&*obj).unwrap();
        merge(&mut value, patch);
        *obj = serde_json::from_value(value).unwrap();
    }

    impl FakeCluster {
        pub fn state(&self) -> MutexGuard<'_, FakeState> {
            self.state.lock().unwrap()
        }

        pub fn insert_job(&self, job: Job) {
            let k = key(
                job.metadata.namespace.as_deref().unwrap_or_default(),
                job.metadata.name.as_deref().unwrap_or_default(),
            );
            self.state().jobs.insert(k, job);
        }

        pub fn insert_deployment(&self, namespace: &str, name: &str) {
            let mut deployment = Deployment::default();
            deployment.metadata.namespace = Some(namespace.into());
            deployment.metadata.name = Some(name.into());
            self.state().deployments.insert(key(namespace, name), deployment);
        }

        pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
            self.state().jobs.get(&key(namespace, name)).cloned()
        }

        pub fn patches(&self) -> Vec<RecordedPatch> {
            self.state().patches.clone()
        }

        pub fn stall_deployment_reads(&self, stalled: bool) {
            self.state().stalled_deployment_reads = stalled;
        }

        pub fn fail_patches(&self, kind: &'static str, failing: bool) {
            let mut state = self.state();
            if failing {
                state.failing_patches.insert(kind);
            } else {
                state.failing_patches.remove(kind);
            }
        }
    }

    impl ClusterClient for FakeCluster {
        async fn get_job(&self, namespace: &str, name: &str) -> crate::Result<Option<Job>> {
            Ok(self.job(namespace, name))
        }

        async fn get_deployment(
            &self,
            namespace: &str,
            name: &str,
        ) -> crate::Result<Option<Deployment>> {
            let stalled = {
                let mut state = self.state();
                state.deployment_reads.push(Instant::now());
                state.stalled_deployment_reads
            };
            if stalled {
                std::future::pending::<()>().await;
            }
            Ok(self.state().deployments.get(&key(namespace, name)).cloned())
        }

        async fn patch_deployment(
            &self,
            namespace: &str,
            name: &str,
            patch: &Value,
        ) -> crate::Result<()> {
            let mut state = self.state();
            if state.failing_patches.contains("Deployment") {
                return Err(api_error(409, "Conflict"));
            }
            let Some(deployment) = state.deployments.get_mut(&key(namespace, name)) else {
                return Err(api_error(404, "NotFound"));
            };
            apply(deployment, patch);
            state.patches.push(RecordedPatch {
                kind: "Deployment",
                namespace: namespace.into(),
                name: name.into(),
                body: patch.clone(),
            });
            Ok(())
        }

        async fn patch_job(&self, namespace: &str, name: &str, patch: &Value) -> crate::Result<()> {
            let mut state = self.state();
            if state.failing_patches.contains("Job") {
                return Err(api_error(409, "Conflict"));
            }
            let Some(job) = state.jobs.get_mut(&key(namespace, name)) else {
                return Err(api_error(404, "NotFound"));
            };
            apply(job, patch);
            state.patches.push(RecordedPatch {
                kind: "Job",
                namespace: namespace.into(),
                name: name.into(),
                body: patch.clone(),
            });
            Ok(())
        }

        async fn record_restart(&self, job: &Job, deployment: &str) {
            self.state()
                .events
                .push(format!("{} -> {deployment}", job.name_any()));
        }
    }
}
