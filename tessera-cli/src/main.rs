//! Tessera CLI - Run capabilities through the execution pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::capability::{builtin, CapabilityRegistry};
use tessera_core::config::TesseraConfig;
use tessera_core::pipeline::{ExecutionPipeline, InvocationRequest};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera capability execution CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "TESSERA_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a capability and print the result
    Run {
        /// Capability name
        capability: String,

        /// Input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Deadline for each dispatch, e.g. "5s" or "250ms"
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Maximum attempts, including the first
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Skip the result cache
        #[arg(long)]
        no_cache: bool,

        /// Number of dispatches to run
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// List registered capabilities
    List,
    /// Print the effective configuration
    Config,
    /// Version information
    Version,
}

fn load_config(path: Option<&PathBuf>) -> Result<TesseraConfig> {
    let config = match path {
        Some(path) => TesseraConfig::from_file(path)?,
        None => TesseraConfig::load()?,
    };
    Ok(config)
}

async fn build_pipeline(config: &TesseraConfig) -> Result<ExecutionPipeline> {
    let registry = Arc::new(CapabilityRegistry::new());
    for (name, factory) in builtin::all() {
        registry.register(name, factory).await?;
    }
    debug!(capabilities = registry.len().await, "Registered builtin capabilities");
    Ok(ExecutionPipeline::new(config.pipeline.clone(), registry)?)
}

async fn run(
    pipeline: &ExecutionPipeline,
    capability: String,
    input: &str,
    timeout: Option<Duration>,
    max_attempts: Option<u32>,
    no_cache: bool,
    repeat: u32,
) -> Result<()> {
    let input: serde_json::Value =
        serde_json::from_str(input).context("--input must be valid JSON")?;

    info!(capability = %capability, repeat, "Dispatching");
    for _ in 0..repeat.max(1) {
        let mut request = InvocationRequest::from_json(capability.clone(), input.clone())?;
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        if let Some(attempts) = max_attempts {
            let policy = pipeline.config().default_retry.clone().with_max_attempts(attempts);
            request = request.with_retry_policy(policy);
        }
        if no_cache {
            request = request.with_cache(false);
        }

        let result = pipeline.dispatch(request).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    println!("{}", serde_json::to_string_pretty(&pipeline.stats(&capability))?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    // Initialize tracing; stdout is reserved for JSON output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    match cli.command {
        Commands::Version => {
            println!("tessera {}", env!("CARGO_PKG_VERSION"));
            println!("tessera-core {}", tessera_core::VERSION);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::List => {
            let pipeline = build_pipeline(&config).await?;
            let capabilities = pipeline.list_capabilities().await;
            println!("{}", serde_json::to_string_pretty(&capabilities)?);
        }
        Commands::Run {
            capability,
            input,
            timeout,
            max_attempts,
            no_cache,
            repeat,
        } => {
            let pipeline = build_pipeline(&config).await?;
            let outcome = run(
                &pipeline,
                capability,
                &input,
                timeout,
                max_attempts,
                no_cache,
                repeat,
            )
            .await;
            if let Err(e) = &outcome {
                warn!(error = %e, "Run failed");
            }
            pipeline.shutdown().await?;
            outcome?;
        }
    }

    Ok(())
}
