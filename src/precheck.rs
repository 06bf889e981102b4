//! Point-in-time check that a persistent volume claim is free to be mounted by a new job.

use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::ResourceExt;

use crate::Result;

pub const DEFAULT_PVC_NAMESPACE: &str = "default-namespace";
pub const DEFAULT_PVC_NAME: &str = "default-app-pvc";

const ACTIVE_PHASES: [&str; 2] = ["Running", "Pending"];

#[derive(Debug)]
pub enum ClaimStatus {
    /// The namespace could not be fetched
    NamespaceMissing(String),
    /// The claim could not be fetched from the namespace
    ClaimMissing(String),
    /// Names of other running or pending pods mounting the claim, possibly empty
    Checked(Vec<String>),
}

impl ClaimStatus {
    /// Whether a job may safely start
    pub fn is_free(&self) -> bool {
        matches!(self, ClaimStatus::Checked(users) if users.is_empty())
    }
}

/// Names of running or pending pods, other than `current_pod`, with a volume backed by `claim`
pub fn claim_users(pods: &[Pod], claim: &str, current_pod: Option<&str>) -> Vec<String> {
    pods.iter()
        .filter(|pod| current_pod != Some(pod.name_any().as_str()))
        .filter(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| ACTIVE_PHASES.contains(&phase))
        })
        .filter(|pod| {
            pod.spec
                .as_ref()
                .and_then(|s| s.volumes.as_ref())
                .is_some_and(|volumes| {
                    volumes.iter().any(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .is_some_and(|source| source.claim_name == claim)
                    })
                })
        })
        .map(|pod| pod.name_any())
        .collect()
}

/// Check that `namespace` and `claim` exist and that no other active pod mounts the claim
pub async fn check_claim(
    client: Client,
    namespace: &str,
    claim: &str,
    current_pod: Option<&str>,
) -> Result<ClaimStatus> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    if let Err(err) = namespaces.get(namespace).await {
        return Ok(ClaimStatus::NamespaceMissing(err.to_string()));
    }

    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    if let Err(err) = claims.get(claim).await {
        return Ok(ClaimStatus::ClaimMissing(err.to_string()));
    }

    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let pods = pods.list(&ListParams::default()).await?;

    Ok(ClaimStatus::Checked(claim_users(
        &pods.items,
        claim,
        current_pod,
    )))
}
