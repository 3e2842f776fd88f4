use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use reaper::{CleanupPlan, HttpConfig, HttpPlatform, LeaseRunner, Reaper, ReaperConfig};
use reaper_lease::LeaseClient;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "reaper")]
#[command(about = "Reclaims VMs, folders, resource pools, volumes and cluster modules left behind by test environments")]
struct Args {
    #[command(flatten)]
    platform: PlatformArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct PlatformArgs {
    /// Platform API endpoint
    #[arg(long, env = "REAPER_URL")]
    url: String,

    #[arg(long, env = "REAPER_USERNAME")]
    username: String,

    #[arg(long, env = "REAPER_PASSWORD", hide_env_values = true)]
    password: String,

    /// Skip TLS certificate verification
    #[arg(long, env = "REAPER_INSECURE")]
    insecure: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Clean the given paths once
    Run(RunArgs),
    /// Clean every dirty resource handed out by the lease broker
    Lease(LeaseArgs),
}

#[derive(ClapArgs)]
struct RunArgs {
    /// Folder whose empty sub-folders are deleted (repeatable)
    #[arg(long = "folder")]
    folders: Vec<String>,

    /// Resource pool whose empty child pools are deleted (repeatable)
    #[arg(long = "resource-pool")]
    resource_pools: Vec<String>,

    /// Folder whose VMs are deleted (repeatable)
    #[arg(long = "vm-folder")]
    vm_folders: Vec<String>,

    /// Delete volumes whose claim carries this owner label value
    #[arg(long)]
    owner_label: Option<String>,

    #[arg(long)]
    skip_cluster_modules: bool,

    /// Print the actions without changing anything
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    age: AgeArgs,
}

#[derive(ClapArgs)]
struct LeaseArgs {
    /// Lease broker URL
    #[arg(long, env = "LEASE_BROKER_HOST")]
    broker_host: String,

    /// Owner for the resources during cleanup
    #[arg(long, default_value = "reaper")]
    resource_owner: String,

    /// Resource types to clean (repeatable)
    #[arg(long = "resource-type", required = true)]
    resource_types: Vec<String>,

    #[command(flatten)]
    age: AgeArgs,
}

#[derive(ClapArgs)]
struct AgeArgs {
    /// Only delete objects older than this, e.g. 12h, 30m or 2d
    #[arg(long, value_parser = parse_max_age)]
    max_age: Option<chrono::Duration>,
}

fn parse_max_age(value: &str) -> std::result::Result<chrono::Duration, String> {
    let duration = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    chrono::Duration::from_std(duration).map_err(|e| e.to_string())
}

impl AgeArgs {
    fn config(&self, dry_run: bool) -> ReaperConfig {
        let config = ReaperConfig::default().dry_run(dry_run);
        match self.max_age {
            Some(max_age) => config.max_age(max_age),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("reaper=info".parse()?)
                .add_directive("reaper_lease=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling cleanup");
            trigger.cancel();
        }
    });

    let platform = Arc::new(
        HttpPlatform::login(&HttpConfig {
            url: args.platform.url.clone(),
            username: args.platform.username.clone(),
            password: args.platform.password.clone(),
            insecure: args.platform.insecure,
        })
        .await
        .context("creating platform session")?,
    );

    let run_id = Uuid::new_v4();
    let outcome = run(args.command, Arc::clone(&platform), cancel)
        .instrument(info_span!("reaper", run = %run_id))
        .await;

    if let Err(e) = platform.logout().await {
        warn!(error = %e, "Failed to log out of platform");
    }

    match outcome {
        Ok(()) => {
            info!("Finished cleanup");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Cleanup failed");
            Err(e)
        }
    }
}

async fn run(command: Command, platform: Arc<HttpPlatform>, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::Run(args) => {
            let config = args.age.config(args.dry_run);
            info!(dry_run = config.dry_run, max_age = ?config.max_age, "Configured settings");

            let reaper = Reaper::new(
                config,
                platform.clone(),
                platform.clone(),
                platform,
                cancel,
            );
            let plan = CleanupPlan {
                folders: args.folders,
                resource_pools: args.resource_pools,
                vm_folders: args.vm_folders,
                owner_label: args.owner_label,
                skip_grouping_objects: args.skip_cluster_modules,
            };
            reaper.cleanup(&plan).await?;
        }
        Command::Lease(args) => {
            let config = args.age.config(false);
            info!(
                broker = %args.broker_host,
                owner = %args.resource_owner,
                max_age = ?config.max_age,
                "Getting resources to clean up from the lease broker"
            );

            let client = LeaseClient::new(&args.resource_owner, &args.broker_host)
                .context("creating lease broker client")?;
            let reaper = Reaper::new(
                config,
                platform.clone(),
                platform.clone(),
                platform,
                cancel,
            );
            LeaseRunner::new(client, reaper)
                .run(&args.resource_types)
                .await?;
        }
    }
    Ok(())
}
