use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use job_watcher::precheck::{self, ClaimStatus};
use job_watcher::telemetry;

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Path to a kubeconfig file; in-cluster or default inference when omitted
    #[arg(long = "kubeconfig", value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    #[arg(long, env = "PVC_NAMESPACE", default_value = precheck::DEFAULT_PVC_NAMESPACE)]
    namespace: String,

    #[arg(long = "pvc-name", env = "PVC_NAME", default_value = precheck::DEFAULT_PVC_NAME)]
    pvc_name: String,

    /// Pod running this check, excluded from the scan
    #[arg(long = "current-pod-name", env = "CURRENT_POD_NAME")]
    current_pod_name: Option<String>,
}

async fn client(kubeconfig: Option<PathBuf>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    telemetry::init()?;

    let args = Arguments::parse();
    let namespace = non_empty(args.namespace, precheck::DEFAULT_PVC_NAMESPACE);
    let pvc_name = non_empty(args.pvc_name, precheck::DEFAULT_PVC_NAME);
    let current_pod = args.current_pod_name.filter(|p| !p.is_empty());

    let client = client(args.kubeconfig).await?;

    match precheck::check_claim(client, &namespace, &pvc_name, current_pod.as_deref()).await? {
        ClaimStatus::NamespaceMissing(err) => {
            println!("Error: Namespace {namespace} does not exist. {err}");
            Ok(ExitCode::FAILURE)
        }
        ClaimStatus::ClaimMissing(err) => {
            println!("Error: PVC {pvc_name} does not exist in namespace {namespace}. {err}");
            Ok(ExitCode::FAILURE)
        }
        ClaimStatus::Checked(users) => {
            println!(
                "Checking for pods actively using {pvc_name}, excluding current pod {}:",
                current_pod.as_deref().unwrap_or_default()
            );
            for pod in &users {
                println!("{pod}");
            }
            if users.is_empty() {
                println!("No active pods found using PVC. Proceeding with job...");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Error: active pods found using PVC. Exiting to prevent job start...");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn non_empty(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}
