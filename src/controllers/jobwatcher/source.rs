//! Turns the job watch into queued reconcile keys.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::*;

use crate::controllers::jobwatcher::JobKey;
use crate::filter::AdmissionFilter;
use crate::queue::WorkQueue;

/// Queue `job` if the admission filter lets it through
pub fn enqueue_admitted(job: &Job, filter: &AdmissionFilter, queue: &WorkQueue<JobKey>) -> bool {
    let Some(key) = JobKey::from_job(job) else {
        return false;
    };
    if !filter.admit(&key.namespace, &key.name) {
        trace!(job = %key, "Job not admitted");
        return false;
    }
    queue.add(key);
    true
}

/// Queue every admitted job from a cache snapshot, returning how many were queued
pub fn resync(
    jobs: impl IntoIterator<Item = Arc<Job>>,
    filter: &AdmissionFilter,
    queue: &WorkQueue<JobKey>,
) -> usize {
    jobs.into_iter()
        .filter(|job| enqueue_admitted(job, filter, queue))
        .count()
}

/// Watch jobs and feed admitted keys into `queue` until shutdown.
///
/// The watch relists and reconnects with backoff on errors, and every
/// `resync_period` all cached jobs are queued again so a missed event is
/// eventually picked up.
pub async fn watch_jobs(
    api: Api<Job>,
    filter: AdmissionFilter,
    queue: WorkQueue<JobKey>,
    resync_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let (store, writer) = reflector::store::<Job>();
    let events = reflector(writer, watcher(api, watcher::Config::default()))
        .touched_objects()
        .default_backoff();
    let mut events = std::pin::pin!(events);

    let mut resync_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + resync_period,
        resync_period,
    );
    resync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stopping| *stopping) => break,
            _ = resync_timer.tick() => {
                let queued = resync(store.state(), &filter, &queue);
                debug!("Resync queued {queued} jobs");
            }
            event = events.next() => match event {
                Some(Ok(job)) => {
                    enqueue_admitted(&job, &filter, &queue);
                }
                Some(Err(err)) => warn!("Job watch failed, retrying: {err}"),
                None => break,
            },
        }
    }

    debug!("Job watch stopped");
}
