//! dutctl CLI - test-machine fleet executor and job client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dutctl::client::{self, ClientOptions};
use dutctl::config::{self, BootConfig, PduDriverConfig};
use dutctl::fleet::{Fleet, StorageCredentials};
use dutctl::inventory::InventorySync;
use dutctl::job::{Job, JobContext, Target};
use dutctl::machine::ExecutorContext;
use dutctl::pdu::{self, vpdu::VirtualPduServer};
use dutctl::protocol::ProtocolVersion;
use dutctl::salad::{Salad, SessionRegistry};
use dutctl::submit::{self, Request, SubmitServer};
use dutctl::{boot, timeout::TimeoutKind};

#[derive(Parser)]
#[command(name = "dutctl")]
#[command(about = "Run CI jobs on a fleet of physical test machines", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dutctl.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the executor: machines, console multiplexer and submission endpoint
    Serve,

    /// Submit a job and attach to its console
    Run {
        /// Job description file
        job: PathBuf,

        /// Executor submission endpoint
        #[arg(short, long, default_value = "127.0.0.1:8100")]
        executor: String,

        /// Host name the executor connects back to
        #[arg(long, default_value = "127.0.0.1")]
        callback_host: String,

        /// Address to listen on for the executor
        #[arg(long, default_value = "0.0.0.0")]
        listen_host: String,

        /// Wire protocol version (0 or 1)
        #[arg(long, default_value_t = 1)]
        protocol: u32,

        /// Run on this machine, ignoring the job's target
        #[arg(short, long)]
        machine: Option<String>,

        /// Required machine tags, ignoring the job's target
        #[arg(short, long)]
        tag: Vec<String>,

        /// Job id (random by default)
        #[arg(long)]
        job_id: Option<String>,

        /// Storage access key
        #[arg(long, requires = "secret_key")]
        access_key: Option<String>,

        /// Storage secret key
        #[arg(long, requires = "access_key")]
        secret_key: Option<String>,

        /// Storage groups to join
        #[arg(long)]
        group: Vec<String>,

        /// Seconds between submissions while every machine is busy
        #[arg(long, default_value_t = 5)]
        retry_secs: u64,

        /// Copy the job bucket to this directory once the job is over
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Check a job description
    ValidateJob {
        /// Job description file
        job: PathBuf,

        /// Machine id to render the job for
        #[arg(long, default_value = "00:00:00:00:00:00")]
        machine_id: String,

        /// Machine tags to render the job with
        #[arg(short, long)]
        tag: Vec<String>,
    },

    /// Validate the configuration file
    Validate,

    /// Serve a virtual PDU
    Vpdu {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:9191")]
        listen: String,

        /// Number of ports
        #[arg(short, long, default_value_t = 16)]
        ports: usize,
    },

    /// List the machines of an executor
    Machines {
        /// Executor submission endpoint
        #[arg(short, long, default_value = "127.0.0.1:8100")]
        executor: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging. Console output of `run` owns stdout, so logs go to stderr.
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => serve(&cli.config).await,
        Commands::Run {
            job,
            executor,
            callback_host,
            listen_host,
            protocol,
            machine,
            tag,
            job_id,
            access_key,
            secret_key,
            group,
            retry_secs,
            artifacts,
        } => {
            let mut options = ClientOptions::new(executor, read_job(&job)?);
            options.callback_host = callback_host;
            options.listen_host = listen_host;
            options.protocol = ProtocolVersion::try_from(protocol)?;
            options.job_id = job_id;
            if machine.is_some() || !tag.is_empty() {
                options.target = Some(Target { id: machine, tags: tag });
            }
            if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
                options.storage = Some(StorageCredentials {
                    access_key,
                    secret_key,
                    groups: group,
                });
            }
            options.retry_interval = Duration::from_secs(retry_secs);
            options.artifacts = artifacts;

            let status = client::run(options).await?;
            info!("Job finished: {}", status);
            // stdin is read on a thread that cannot be interrupted.
            std::process::exit(status.exit_code());
        }
        Commands::ValidateJob {
            job,
            machine_id,
            tag,
        } => validate_job(&job, machine_id, tag),
        Commands::Validate => validate_config(&cli.config),
        Commands::Vpdu { listen, ports } => run_vpdu(&listen, ports).await,
        Commands::Machines { executor, format } => list_machines(&executor, &format).await,
    }
}

fn read_job(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))
}

async fn serve(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let registry = Arc::new(SessionRegistry::new());
    let boot_service = boot::create(&config.boot);
    let pdus = pdu::create_all(&config.pdus).context("Failed to set up PDUs")?;
    let context = ExecutorContext::from_config(&config.executor, registry.clone(), boot_service);
    let fleet = Arc::new(Fleet::new(context, config.storage.clone()));
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.salad.enabled {
        let salad = Salad::new(config.salad.clone(), registry.clone())?;
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = salad.run(token).await {
                warn!("Console multiplexer stopped: {}", e);
            }
        }));
    }

    match &config.inventory.path {
        Some(path) => {
            let mut sync = InventorySync::new(
                fleet.clone(),
                pdus,
                path.clone(),
                Duration::from_secs(config.inventory.sync_interval_secs),
            );
            sync.sync_once()
                .await
                .context("Failed to load the machine inventory")?;
            tasks.push(tokio::spawn(sync.run(cancel.clone())));
        }
        None => warn!("No machine inventory configured, the fleet is empty"),
    }

    let server = SubmitServer::bind(config.executor.listen.as_str(), fleet.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", config.executor.listen))?;
    let token = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.run(token).await {
            warn!("Submission endpoint stopped: {}", e);
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for CTRL+C")?;
    info!("Shutting down");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task failed during shutdown: {}", e);
        }
    }
    fleet.shutdown().await;
    Ok(())
}

fn validate_job(path: &Path, machine_id: String, tags: Vec<String>) -> Result<()> {
    let template = read_job(path)?;
    let context = JobContext {
        machine_id,
        machine_tags: tags,
        ..JobContext::default()
    };

    match Job::render(&template, &context) {
        Ok(job) => {
            println!("Job is valid!");
            println!();
            println!("Target:");
            println!("  Id: {}", job.target.id.as_deref().unwrap_or("(any)"));
            println!("  Tags: {}", job.target.tags.join(", "));
            println!("Timeouts:");
            for kind in TimeoutKind::ALL {
                let timeout = job.timeouts.get(kind);
                if timeout.is_infinite() {
                    continue;
                }
                println!(
                    "  {}: {:?} ({} retries)",
                    kind,
                    timeout.duration(),
                    timeout.max_retries()
                );
            }
            for name in job.timeouts.watchdog_names() {
                println!("  watchdog {}", name);
            }
            println!("Deployment:");
            println!("  Kernel: {}", job.deployment_start.kernel_url);
            if let Some(initramfs) = &job.deployment_start.initramfs_url {
                println!("  Initramfs: {}", initramfs);
            }
            println!("  Cmdline: {}", job.deployment_start.kernel_cmdline);
            Ok(())
        }
        Err(e) => {
            eprintln!("Job error: {}", e);
            std::process::exit(1);
        }
    }
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Listen: {}", config.executor.listen);
            println!("  Poll interval: {}ms", config.executor.poll_interval_ms);
            println!(
                "  Console multiplexer: {}",
                if config.salad.enabled { "enabled" } else { "disabled" }
            );

            let boot_name = match &config.boot {
                BootConfig::None => "none",
                BootConfig::Directory { .. } => "directory",
            };
            println!("  Boot service: {}", boot_name);

            for pdu in &config.pdus {
                let driver = match &pdu.driver {
                    PduDriverConfig::Dummy { .. } => "dummy",
                    PduDriverConfig::Vpdu { .. } => "vpdu",
                    PduDriverConfig::Command { .. } => "command",
                };
                println!("  PDU {}: {}", pdu.name, driver);
            }

            if let Some(path) = &config.inventory.path {
                println!("  Inventory: {}", path.display());
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run_vpdu(listen: &str, ports: usize) -> Result<()> {
    let server = VirtualPduServer::bind(listen, ports)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    server.run(cancel).await?;
    Ok(())
}

async fn list_machines(executor: &str, format: &str) -> Result<()> {
    let response = submit::send_request(executor, &Request::List { list: true })
        .await
        .with_context(|| format!("Failed to reach the executor at {}", executor))?;
    if !response.is_success() {
        anyhow::bail!(
            "Listing failed ({}): {}",
            response.status,
            response.reason.unwrap_or_default()
        );
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&response.machines)?),
        _ => {
            for machine in &response.machines {
                println!(
                    "{:<20} {:<16} {:<24} {}{}",
                    machine.id,
                    machine.state,
                    machine.pdu_port.as_deref().unwrap_or("-"),
                    machine.tags.join(","),
                    if machine.ready_for_service { "" } else { " (out of service)" }
                );
            }
            println!();
            println!("{} machines", response.machines.len());
        }
    }

    Ok(())
}
