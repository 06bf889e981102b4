use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use chrono::Utc;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tracing::*;

use job_watcher::config::{self, RawSettings, Settings};
use job_watcher::{telemetry, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    #[arg(
        long = "monitored-namespace",
        env = "MONITORED_NAMESPACE",
        default_value = config::DEFAULT_MONITORED_NAMESPACE
    )]
    monitored_namespace: String,

    #[arg(
        long = "target-deployment-name",
        env = "TARGET_DEPLOYMENT_NAME",
        default_value = config::DEFAULT_TARGET_DEPLOYMENT_NAME
    )]
    target_deployment_name: String,

    #[arg(
        long = "job-name-pattern",
        env = "JOB_NAME_PATTERN",
        default_value = config::DEFAULT_JOB_NAME_PATTERN
    )]
    job_name_pattern: String,

    #[arg(
        long = "probe-bind-address",
        env = "PROBE_BIND_ADDRESS",
        default_value = "0.0.0.0:9440"
    )]
    probe_bind_address: String,

    #[arg(long = "workers", env = "WORKERS", default_value_t = 1)]
    workers: usize,

    #[arg(long = "resync-period-secs", env = "RESYNC_PERIOD_SECS", default_value_t = 36000)]
    resync_period_secs: u64,

    #[arg(long = "backoff-base-ms", env = "BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    #[arg(long = "backoff-max-secs", env = "BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,
}

impl From<Arguments> for RawSettings {
    fn from(args: Arguments) -> Self {
        RawSettings {
            monitored_namespace: args.monitored_namespace,
            target_deployment_name: args.target_deployment_name,
            job_name_pattern: args.job_name_pattern,
            workers: args.workers,
            resync_period: Duration::from_secs(args.resync_period_secs),
            backoff_base: Duration::from_millis(args.backoff_base_ms),
            backoff_max: Duration::from_secs(args.backoff_max_secs),
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(e) => {
            warn!("Failed to encode metrics: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Jobs created before this instant are left alone
    let startup_cutoff = Utc::now();

    telemetry::init()?;

    let args: Arguments = Arguments::parse();
    let probe_bind_address = args.probe_bind_address.clone();
    let settings = Settings::new(args.into(), startup_cutoff)?;

    let client = kube::Client::try_default().await?;

    // Initialize Kubernetes controller state
    let state = State::new(startup_cutoff);

    // Start web server
    let server = HttpServer::new({
        let state = state.clone();
        move || {
            App::new()
                .app_data(Data::new(state.clone()))
                .wrap(
                    middleware::Logger::default()
                        .exclude("/healthz")
                        .exclude("/readyz"),
                )
                .service(index)
                .service(health)
                .service(ready)
                .service(metrics)
        }
    })
    .bind(&probe_bind_address)?
    .shutdown_timeout(5)
    .run();
    let server_handle = server.handle();

    // The web server stops once the controller is done, whatever the reason
    let controller = async move {
        let result = job_watcher::run(client, settings, state).await;
        server_handle.stop(true).await;
        result
    };

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    server?;
    controller?;
    Ok(())
}
