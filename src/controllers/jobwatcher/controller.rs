use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::ResourceExt;
use tokio::signal;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::*;

use crate::cluster::{ClusterClient, KubeCluster};
use crate::config::Settings;
use crate::controllers::jobwatcher::source;
use crate::controllers::{Diagnostics, State};
use crate::filter::AdmissionFilter;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::restart;
use crate::telemetry;
use crate::{Error, Result};

/// Namespace and name of a watched job; the unit of work in the queue
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_job(job: &Job) -> Option<Self> {
        Some(Self::new(job.namespace()?, job.metadata.name.clone()?))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a reconcile concluded without error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    JobNotFound,
    AlreadyProcessed,
    NameMismatch,
    NotCompleted,
    CreatedBeforeStartup,
    Restarted,
}

impl Outcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Outcome::JobNotFound => "job_not_found",
            Outcome::AlreadyProcessed => "already_processed",
            Outcome::NameMismatch => "name_mismatch",
            Outcome::NotCompleted => "not_completed",
            Outcome::CreatedBeforeStartup => "created_before_startup",
            Outcome::Restarted => "restarted",
        }
    }
}

pub struct Context<C> {
    /// Cluster API access
    pub client: C,
    /// Admission policy, target and startup cutoff
    pub settings: Arc<Settings>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(client: C, settings: Arc<Settings>, metrics: Metrics, state: &State) -> Arc<Self> {
        Arc::new(Context {
            client,
            settings,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx), fields(job = %key, trace_id))]
pub async fn reconcile<C: ClusterClient>(key: &JobKey, ctx: &Context<C>) -> Result<Outcome> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    match evaluate(key, ctx).await {
        Ok(outcome) => {
            ctx.metrics.reconcile_outcome(outcome.metric_label());
            Ok(outcome)
        }
        Err(err) => {
            warn!("reconcile failed: {err}");
            ctx.metrics.reconcile_failure(&err);
            Err(err)
        }
    }
}

/// The guards run in order; the first one that applies ends the reconcile.
async fn evaluate<C: ClusterClient>(key: &JobKey, ctx: &Context<C>) -> Result<Outcome> {
    let settings = &ctx.settings;

    let Some(job) = ctx.client.get_job(&key.namespace, &key.name).await? else {
        debug!("Job no longer exists, ignoring");
        return Ok(Outcome::JobNotFound);
    };

    if restart::is_processed(&job) {
        info!("Job already processed, ignoring");
        return Ok(Outcome::AlreadyProcessed);
    }

    // the admission filter may have been configured differently when this key was queued
    if !settings.job_name_pattern.is_match(&job.name_any()) {
        info!("Job name does not match pattern, ignoring");
        return Ok(Outcome::NameMismatch);
    }

    if !restart::is_complete(&job) {
        debug!("Job has not completed yet");
        return Ok(Outcome::NotCompleted);
    }

    if restart::created_before(&job, settings.startup_cutoff) {
        info!("Ignoring job created before controller startup");
        return Ok(Outcome::CreatedBeforeStartup);
    }

    let namespace = settings.monitored_namespace.as_str();
    let deployment = settings.target_deployment_name.as_str();

    if ctx.client.get_deployment(namespace, deployment).await?.is_none() {
        return Err(Error::TargetNotFound {
            namespace: namespace.to_string(),
            name: deployment.to_string(),
        });
    }

    let restarted_at = Utc::now();
    ctx.client
        .patch_deployment(namespace, deployment, &restart::restart_patch(restarted_at))
        .await?;

    // a failure here leaves the restart unmarked; the retry may restart once more
    ctx.client
        .patch_job(&key.namespace, &key.name, &restart::processed_patch())
        .await?;

    ctx.client.record_restart(&job, deployment).await;
    ctx.metrics.restarts.inc();
    ctx.diagnostics.write().await.last_restart = Some(restarted_at);

    info!(
        "Target deployment {deployment} in namespace {namespace} restarted due to job completion"
    );
    Ok(Outcome::Restarted)
}

/// Requeue a failed key with its next backoff delay
fn error_policy<C>(
    key: &JobKey,
    error: &Error,
    queue: &WorkQueue<JobKey>,
    ctx: &Context<C>,
) -> Duration {
    let delay = queue.add_rate_limited(key.clone());
    ctx.metrics.requeues.inc();
    debug!(
        job = %key,
        attempt = queue.num_requeues(key),
        "requeueing in {delay:?} after {}",
        error.metric_label()
    );
    delay
}

async fn worker<C: ClusterClient>(
    ctx: Arc<Context<C>>,
    queue: WorkQueue<JobKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    while let Some(key) = queue.get().await {
        let result = tokio::select! {
            result = reconcile(&key, &ctx) => result,
            _ = shutdown.wait_for(|stopping| *stopping) => {
                debug!(job = %key, "Reconcile cancelled by shutdown");
                queue.done(&key);
                break;
            }
        };

        match result {
            Ok(_) => queue.forget(&key),
            Err(err) => {
                error_policy(&key, &err, &queue, &ctx);
            }
        }
        queue.done(&key);
    }
}

/// Run `workers` concurrent reconcile loops until the queue shuts down
pub async fn run_workers<C: ClusterClient>(
    ctx: Arc<Context<C>>,
    queue: WorkQueue<JobKey>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) {
    let mut set = JoinSet::new();
    for _ in 0..workers.max(1) {
        set.spawn(worker(ctx.clone(), queue.clone(), shutdown.clone()));
    }
    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            error!("Reconcile worker failed: {err}");
        }
    }
}

/// Flip the returned channel and shut `queue` down on SIGINT or SIGTERM
fn spawn_shutdown_listener(queue: WorkQueue<JobKey>) -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let sender = tx.clone();

    tokio::spawn(async move {
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    warn!("Failed to listen for SIGTERM: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            res = signal::ctrl_c() => match res {
                Ok(()) => info!("Received SIGINT, shutting down"),
                Err(err) => warn!("Failed to listen for SIGINT: {err}; shutting down"),
            },
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }

        queue.shut_down();
        let _ = sender.send(true);
    });

    (tx, rx)
}

/// Run the job watcher until a shutdown signal arrives
pub async fn run(client: Client, settings: Settings, state: State) -> Result<()> {
    let settings = Arc::new(settings);
    let jobs: Api<Job> = Api::namespaced(client.clone(), &settings.monitored_namespace);

    if let Err(e) = jobs.list(&ListParams::default().limit(1)).await {
        error!("Jobs are not queryable; {e:?}. Is the service account allowed to list jobs?");
        return Err(Error::WatchUnavailable(e));
    }

    let metrics = Metrics::new()?.register(&state.registry)?;
    let queue = WorkQueue::with_depth_gauge(settings.backoff, metrics.queue_depth.clone());
    let (_shutdown_tx, shutdown) = spawn_shutdown_listener(queue.clone());

    info!(
        namespace = %settings.monitored_namespace,
        deployment = %settings.target_deployment_name,
        pattern = %settings.job_name_pattern,
        startup_cutoff = %settings.startup_cutoff,
        workers = settings.workers,
        "Starting job watcher"
    );

    let ctx = Context::new(KubeCluster::new(client), settings.clone(), metrics, &state);
    let notifications = source::watch_jobs(
        jobs,
        AdmissionFilter::from(settings.as_ref()),
        queue.clone(),
        settings.resync_period,
        shutdown.clone(),
    );
    let workers = run_workers(ctx, queue, settings.workers, shutdown);

    tokio::join!(notifications, workers);
    info!("Job watcher stopped");
    Ok(())
}
