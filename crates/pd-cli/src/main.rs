mod config;
mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use incus_api::{ClientConfig, IncusClient};
use pd_engine::apply::{MAX_CONCURRENT_REQUESTS, Reconciler, ReconcilerConfig};
use pd_engine::backup::BackupRunner;
use pd_engine::expiry::ExpiryNotifier;
use pd_infra::config::ClusterConfig;
use pd_infra::exec::ProcessRunner;
use pd_infra::incus::IncusBackend;
use pd_infra::mail::SmtpSender;
use pd_infra::notify::MailTemplates;

#[derive(Parser)]
#[command(name = "paddock", about = "Utility for managing a Paddock cluster")]
struct Cli {
    /// Path to the cluster config
    #[arg(long, default_value = "/etc/paddock/cluster.yaml")]
    cluster_config: PathBuf,

    /// Directory of declared instance files
    #[arg(long, default_value = "/etc/paddock/instances")]
    instances_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the cluster with the declared instances
    Apply {
        /// Abort the run after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Back up instances located on this host
    Backup,
    /// Validate the declared instances
    Validate,
    /// Warn users whose instances expire soon
    Notify {
        /// How many days ahead to warn
        #[arg(long, default_value_t = 7)]
        within_days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cluster = config::load_cluster(&cli.cluster_config)?;

    match cli.command {
        Command::Apply { timeout_secs } => {
            run_apply(&cluster, &cli.instances_dir, timeout_secs).await
        }
        Command::Backup => run_backup(&cluster).await,
        Command::Validate => run_validate(&cluster, &cli.instances_dir),
        Command::Notify { within_days } => {
            run_notify(&cluster, &cli.instances_dir, within_days).await
        }
    }
}

async fn run_apply(
    cluster: &ClusterConfig,
    instances_dir: &Path,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let instances = config::load_instances(instances_dir)?;
    validate::validate(&instances, &cluster.flavors)?;

    let backend = Arc::new(IncusBackend::new(build_client(cluster)?, cluster.clone())?);
    let mailer = Arc::new(SmtpSender::new(&cluster.mail.server, sender_address())?);

    let reconciler = Reconciler::new(ReconcilerConfig {
        backend,
        mailer,
        templates: Arc::new(MailTemplates::new()?),
        domain: cluster.domain.clone(),
        network: cluster.network.cidr,
        reserved: cluster.network.reserved.clone(),
        concurrency: MAX_CONCURRENT_REQUESTS,
    });

    let cancel = CancellationToken::new();
    if let Some(secs) = timeout_secs {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            cancel.cancel();
        });
    }

    let result = reconciler.apply(&instances, &cancel).await?;

    print!("{}", serde_yaml::to_string(&result)?);
    Ok(())
}

async fn run_backup(cluster: &ClusterConfig) -> anyhow::Result<()> {
    let backend = Arc::new(IncusBackend::new(build_client(cluster)?, cluster.clone())?);

    let backup = BackupRunner::new(
        backend,
        Arc::new(ProcessRunner),
        hostname(),
        cluster.backup.dir.clone(),
    );

    let count = backup.run().await?;
    info!(count, "backup finished");
    Ok(())
}

fn run_validate(cluster: &ClusterConfig, instances_dir: &Path) -> anyhow::Result<()> {
    let instances = config::load_instances(instances_dir)?;
    validate::validate(&instances, &cluster.flavors)?;

    println!("{} declared instances are valid", instances.len());
    Ok(())
}

async fn run_notify(
    cluster: &ClusterConfig,
    instances_dir: &Path,
    within_days: i64,
) -> anyhow::Result<()> {
    let instances = config::load_instances(instances_dir)?;
    validate::validate(&instances, &cluster.flavors)?;

    let notifier = ExpiryNotifier::new(
        Arc::new(SmtpSender::new(&cluster.mail.server, sender_address())?),
        Arc::new(MailTemplates::new()?),
        chrono::Duration::days(within_days),
    );

    let count = notifier.run(&instances).await?;
    info!(count, "expiry warnings sent");
    Ok(())
}

fn build_client(cluster: &ClusterConfig) -> anyhow::Result<IncusClient> {
    let client_cert_pem = match &cluster.api.client_cert {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("failed to read client cert {}", path.display()))?,
        ),
        None => None,
    };

    Ok(IncusClient::new(ClientConfig {
        endpoint: cluster.api.endpoint.clone(),
        client_cert_pem,
        accept_invalid_certs: cluster.api.accept_invalid_certs,
    })?)
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Mail envelope sender, `user@host` of whoever runs the tool.
fn sender_address() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "root".into());
    format!("{user}@{}", hostname())
}
