use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cyclone::config::ClusterConfig;
use cyclone::error::{CycloneError, Result};
use cyclone::logsink::{LogSink, MemoryLogSink, TracingLogSink};
use cyclone::node::Node;
use cyclone::scheduler::job::{JobRecord, JobStatus};
use cyclone::scheduler::rotation::RotationList;
use cyclone::scheduler::submit::ScriptDirectives;
use cyclone::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "cyclone")]
#[command(version)]
#[command(about = "Elastic multi-region job dispatch")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a node with the REST API
    Server(ServerArgs),

    /// Submit job scripts to an in-process cluster and wait for them
    Run(RunArgs),

    /// Validate a configuration file and print its rotation lists
    CheckConfig {
        /// Path to the TOML configuration
        #[arg(long, short = 'c', default_value = "cyclone.toml")]
        config: PathBuf,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the TOML configuration
    #[arg(long, short = 'c', default_value = "cyclone.toml")]
    config: PathBuf,

    /// Override the REST API port
    #[arg(long)]
    port: Option<u16>,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the TOML configuration
    #[arg(long, short = 'c', default_value = "cyclone.toml")]
    config: PathBuf,

    /// Job scripts; `#HYPER` lines inside them fill in the flags below
    #[arg(required = true)]
    scripts: Vec<PathBuf>,

    /// Job name
    #[arg(long, short = 'n')]
    name: Option<String>,

    /// Job queue
    #[arg(long, short = 'q')]
    queue: Option<String>,

    /// Job definition
    #[arg(long, short = 'd')]
    definition: Option<String>,

    /// Retries available
    #[arg(long, short = 'r')]
    retries: Option<u32>,

    /// File with one params object per line, e.g. {'SEED': '7'}; submits an
    /// array job per script
    #[arg(long)]
    array: Option<PathBuf>,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResultOutput {
    id: String,
    job_name: String,
    job_queue: String,
    status: String,
    retries_available: u32,
    error: Option<String>,
    output: String,
}

impl From<&JobRecord> for JobResultOutput {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.clone(),
            job_name: job.job_name.clone(),
            job_queue: job.job_queue.clone(),
            status: job.status.to_string(),
            retries_available: job.retries_available,
            error: job.error.clone(),
            output: job.output.clone(),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_server(args: ServerArgs) -> Result<()> {
    init_tracing();

    let mut config = ClusterConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.api.listen_addr.set_port(port);
    }

    tracing::info!(
        config = %args.config.display(),
        main_region = %config.main_region,
        regions = ?config.regions,
        listen_addr = %config.api.listen_addr,
        "Starting cyclone node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, Arc::new(TracingLogSink), shutdown)?;
    node.run().await
}

/// Parse a params file: one `{'key': 'value'}` object per line.
fn read_params(path: &Path) -> Result<Vec<BTreeMap<String, String>>> {
    std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(&line.replace('\'', "\"")).map_err(CycloneError::from))
        .collect()
}

async fn run_scripts(args: RunArgs) -> Result<()> {
    init_tracing();

    let config = ClusterConfig::load(&args.config)?;
    let sink: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new());
    let mut node = Node::new(config, sink, install_shutdown_handler())?;
    node.start()?;

    let explicit = ScriptDirectives {
        job_name: args.name.clone(),
        job_queue: args.queue.clone(),
        job_definition: args.definition.clone(),
        retries: args.retries,
    };
    let params = args.array.as_deref().map(read_params).transpose()?;

    let mut submitted = Vec::new();
    for path in &args.scripts {
        let script = std::fs::read_to_string(path)?;
        let spec = ScriptDirectives::into_spec(&script, explicit.clone())?;
        let queue = spec.job_queue.clone();
        match &params {
            Some(params) => {
                let array = node.submitter.submit_array(spec, params).await?;
                submitted.extend(array.ids.into_iter().map(|id| (queue.clone(), id)));
            }
            None => submitted.push((queue, node.submitter.submit(spec).await?)),
        }
    }

    let timeout = Duration::from_secs(args.timeout_secs);
    let mut results = Vec::with_capacity(submitted.len());
    for (queue, id) in &submitted {
        results.push(node.wait_for_job(queue, id, timeout).await?);
    }
    node.stop().await;

    let rows: Vec<JobResultOutput> = results.iter().map(JobResultOutput::from).collect();
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table => {
            println!("{:<44} {:<20} {:<12} RETRIES", "JOB ID", "NAME", "STATUS");
            println!("{}", "-".repeat(86));
            for row in &rows {
                println!(
                    "{:<44} {:<20} {:<12} {}",
                    row.id, row.job_name, row.status, row.retries_available
                );
            }
        }
    }

    if results.iter().all(|job| job.status == JobStatus::Successful) {
        Ok(())
    } else {
        Err(CycloneError::Internal("one or more jobs did not succeed".into()))
    }
}

async fn check_config(path: &Path) -> Result<()> {
    let config = ClusterConfig::load(path)?;
    println!("Configuration {} is valid", path.display());
    println!("Main region: {}", config.main_region);
    for (queue, q) in &config.queues {
        let weights = q.regions.resolve(None).await;
        let rotation = RotationList::from_weights(&weights);
        println!("Queue {queue}: {} rotation slots {:?}", rotation.len(), weights);
    }
    for (definition, d) in &config.definitions {
        println!("Definition {definition}: {} jobs per worker", d.jobs_to_workers_ratio);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Run(run_args) => run_scripts(run_args).await?,
        Commands::CheckConfig { config } => check_config(&config).await?,
    }

    Ok(())
}
