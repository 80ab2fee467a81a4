use circom_pkg_builder_lib::config::CONFIG_ENV_VAR;
use circom_pkg_builder_lib::{BuildContext, BuilderConfig, handle, read_status};
use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context};
use std::path::PathBuf;
use std::process::exit;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Builds prove/verify packages from circom sources", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs one build and prints the response
    Build {
        /// Request JSON file, or `-` for stdin
        #[arg(short, long, value_name = "FILE")]
        request: String,
    },

    /// Prints the status log of a request
    Status {
        #[arg(value_name = "REQUEST_ID")]
        request_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BuilderConfig::load(path)
            .with_context(|| format!("Loading configuration from {}", path.display()))?,
        None => BuilderConfig::default(),
    };
    let ctx = BuildContext::from_config(config).context("Initializing build context")?;
    tracing::debug!("Build context ready");

    match cli.command {
        Command::Build { request } => {
            let raw = read_request(&request).await?;
            let event: serde_json::Value =
                serde_json::from_str(&raw).context("Parsing request JSON")?;
            let response = handle(&ctx, event).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.status_code != 200 {
                exit(1);
            }
        }
        Command::Status { request_id } => {
            let events = read_status(ctx.store().as_ref(), &request_id)
                .await
                .context("Reading status log")?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
    }
    Ok(())
}

async fn read_request(source: &str) -> Result<String> {
    if source == "-" {
        let mut raw = String::new();
        tokio::io::stdin()
            .read_to_string(&mut raw)
            .await
            .context("Reading request from stdin")?;
        return Ok(raw);
    }
    tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("Reading request from {}", source))
}
