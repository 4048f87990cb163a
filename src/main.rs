//! istio-initializer binary: loads the configuration, starts the pod watch and
//! runs until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use kube_client::config::{KubeConfigOptions, Kubeconfig};
use kube_client::{Client, Config};
use tracing_subscriber::EnvFilter;

use istio_initializer::subscriber::{self, RESYNC_PERIOD};
use istio_initializer::supervisor::ShutdownSignal;
use istio_initializer::{config, runner, KubeStore, Supervisor, INITIALIZER_NAME};

/// Injects the Istio sidecar into pods pending initialization
#[derive(Parser, Debug)]
#[command(name = "istio-initializer", version, about, long_about = None)]
struct Cli {
    /// Absolute path to the kubeconfig file; in-cluster config is used when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("istio_initializer=info,kube=warn")),
        )
        .init();

    let cli = Cli::parse();

    log::info!("Starting the istio initializer...");
    log::info!("Initializer name set to: {INITIALIZER_NAME}");

    if let Err(err) = run(cli).await {
        log::error!("{err:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = client(cli.kubeconfig).await?;
    let config = config::load(client.clone()).await?;
    log::debug!("loaded configuration: {config:?}");

    let shutdown = ShutdownSignal::register().context("cannot listen for shutdown signals")?;

    let store = KubeStore::new(client.clone());
    let events = subscriber::objects(client, RESYNC_PERIOD);
    let supervisor = Supervisor::start(move |stop| async move {
        runner::run(events, &config, &store, stop).await;
    });

    let received = shutdown.recv().await;
    log::info!("Shutdown signal received, exiting...");
    supervisor.stop().await;
    received.context("cannot listen for shutdown signals")
}

async fn client(kubeconfig: Option<PathBuf>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("cannot read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await.context("cannot infer cluster config")?,
    };
    Client::try_from(config).context("cannot build cluster client")
}
