//! Atelier - development environment operator and DNS controller

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use atelier::controller::{error_policy, reconcile, Context, OperatorSettings};
use atelier::crd::DevEnvironment;
use atelier::dns::{
    DnsSettings, DnsSynchronizer, EndpointWatcher, KubeServiceLookup, RecordStore,
    Route53Provider, StaleRecordSweeper,
};
use atelier::materialize::Materializer;

/// Atelier - Kubernetes operator for ephemeral development environments
#[derive(Parser, Debug)]
#[command(name = "atelier", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the environment operator (default mode)
    ///
    /// Watches DevEnvironment resources and converges each one into its
    /// namespace, network policy, workspace claim, workload, and service.
    Operator(OperatorArgs),

    /// Run the DNS controller
    ///
    /// Watches platform-managed services and keeps Route53 records
    /// converged with their external addresses, sweeping stale records
    /// on a fixed period.
    Dns(DnsArgs),
}

/// Operator mode arguments
#[derive(Args, Debug)]
struct OperatorArgs {
    /// Storage class backing workspace claims
    #[arg(long, env = "STORAGE_CLASS", default_value = "gp3")]
    storage_class: String,

    /// Domain suffix under which environments become reachable
    #[arg(long, env = "DOMAIN_SUFFIX", default_value = "dev-platform.company.com")]
    domain_suffix: String,
}

impl OperatorArgs {
    /// Defaults for running with no subcommand, honoring the same
    /// environment variables as the parsed form
    fn from_env() -> Self {
        Self {
            storage_class: std::env::var("STORAGE_CLASS").unwrap_or_else(|_| "gp3".to_string()),
            domain_suffix: std::env::var("DOMAIN_SUFFIX")
                .unwrap_or_else(|_| "dev-platform.company.com".to_string()),
        }
    }
}

/// DNS mode arguments
#[derive(Args, Debug)]
struct DnsArgs {
    /// Route53 hosted zone holding the managed records
    #[arg(long, env = "HOSTED_ZONE_ID")]
    hosted_zone_id: String,

    /// Domain suffix for environment hostnames
    #[arg(long, env = "DOMAIN_SUFFIX", default_value = "dev-platform.company.com")]
    domain_suffix: String,

    /// Time-to-live for managed records, in seconds
    #[arg(long, env = "DNS_RECORD_TTL", default_value = "300")]
    record_ttl: i64,

    /// Seconds each watch subscription stays open before resubscribing
    #[arg(long, env = "WATCH_TIMEOUT_SECS", default_value = "290")]
    watch_timeout_secs: u32,

    /// Delay before resubscribing after a stream ends, in seconds
    #[arg(long, env = "WATCH_RECONNECT_SECS", default_value = "10")]
    watch_reconnect_secs: u64,

    /// Period between stale-record sweeps, in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "3600")]
    sweep_interval_secs: u64,

    /// Minimum record age before stale cleanup, in hours
    #[arg(long, env = "STALE_GRACE_HOURS", default_value = "24")]
    stale_grace_hours: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&DevEnvironment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Dns(args)) => run_dns(args).await,
        Some(Commands::Operator(args)) => run_operator(args).await,
        None => run_operator(OperatorArgs::from_env()).await,
    }
}

/// Run the environment operator
async fn run_operator(args: OperatorArgs) -> anyhow::Result<()> {
    tracing::info!("atelier operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // The operator installs its own CRD on startup so the manifest
    // version always matches the operator version
    ensure_crd_installed(&client).await?;

    let context = Arc::new(Context::new(
        client.clone(),
        Materializer::new(args.storage_class),
        OperatorSettings {
            domain_suffix: args.domain_suffix,
        },
    ));

    let environments: Api<DevEnvironment> = Api::all(client);
    Controller::new(environments, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((env, _)) => tracing::debug!(environment = %env.name, "reconciled"),
                Err(e) => tracing::warn!(error = %e, "reconcile failed"),
            }
        })
        .await;

    tracing::info!("atelier operator stopped");
    Ok(())
}

/// Install or update the DevEnvironment CRD via server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = DevEnvironment::crd();
    let name = DevEnvironment::crd_name();
    let params = PatchParams::apply("atelier").force();
    api.patch(name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;

    tracing::info!(crd = name, "CRD installed");
    Ok(())
}

/// Run the DNS controller: watch loop, synchronizer, and sweeper
async fn run_dns(args: DnsArgs) -> anyhow::Result<()> {
    tracing::info!("atelier dns controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let settings = DnsSettings {
        domain_suffix: args.domain_suffix,
        record_ttl: args.record_ttl,
    };
    let provider = Arc::new(Route53Provider::new(args.hosted_zone_id).await);
    let store = RecordStore::new();

    let synchronizer = DnsSynchronizer::new(provider.clone(), store.clone(), settings.clone());
    let watcher = EndpointWatcher::new(
        client.clone(),
        args.watch_timeout_secs,
        Duration::from_secs(args.watch_reconnect_secs),
    );
    let sweeper = StaleRecordSweeper::new(
        store,
        provider,
        Arc::new(KubeServiceLookup::new(client)),
        settings,
        Duration::from_secs(args.sweep_interval_secs),
        chrono::Duration::hours(args.stale_grace_hours),
    );

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(64);

    let watch_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { watcher.run(events_tx, cancel).await }
    });
    let sync_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { synchronizer.run(events_rx, cancel).await }
    });
    let sweep_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { sweeper.run(cancel).await }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;
    tracing::info!("shutdown requested, letting in-flight work finish");
    cancel.cancel();

    let _ = tokio::join!(watch_task, sync_task, sweep_task);
    tracing::info!("atelier dns controller stopped");
    Ok(())
}
