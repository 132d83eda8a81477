use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cardea::config::{CardeaConfig, LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(
    name = "cardea",
    about = "Edge-to-brain event correlation and adaptive scoring for network security sensors",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $CARDEA_CONFIG, then /etc/cardea/cardea.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the brain: ingress, correlation, scoring and threshold feedback
    Brain {
        /// Bind address (overrides server.brain_bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the edge: sensor intake, durable queue and uplink forwarder
    Edge {
        /// Bind address (overrides server.edge_bind)
        #[arg(long)]
        bind: Option<String>,

        /// Brain base URL (overrides edge.brain_url)
        #[arg(long)]
        brain_url: Option<String>,
    },

    /// Normalize one raw sensor record and print the canonical event
    Normalize {
        /// Adapter name: suricata, zeek, kitnet or generic
        #[arg(long, short)]
        adapter: String,

        /// File holding the JSON record; stdin when omitted or "-"
        input: Option<PathBuf>,
    },

    /// Print queued event counts per sensor source
    QueueStatus {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn read_input(input: Option<&PathBuf>) -> Result<String> {
    match input {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            Ok(buf)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = CardeaConfig::resolve(cli.config.as_deref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Brain { bind } => {
            if let Some(bind) = bind {
                cfg.server.brain_bind = bind;
            }
            tracing::info!(bind = %cfg.server.brain_bind, "starting cardea brain");
            cardea::serve_brain(cfg).await?;
        }
        Commands::Edge { bind, brain_url } => {
            if let Some(bind) = bind {
                cfg.server.edge_bind = bind;
            }
            if let Some(url) = brain_url {
                cfg.edge.brain_url = url;
            }
            tracing::info!(bind = %cfg.server.edge_bind, "starting cardea edge");
            cardea::serve_edge(cfg).await?;
        }
        Commands::Normalize { adapter, input } => {
            let text = read_input(input.as_ref())?;
            let raw: serde_json::Value =
                serde_json::from_str(&text).context("input is not valid JSON")?;
            let normalizer = cardea::normalize::Normalizer::with_builtin_adapters();
            let event = normalizer
                .normalize(&adapter, &raw)
                .with_context(|| format!("adapter '{}' rejected the record", adapter))?;
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        Commands::QueueStatus { json } => {
            let queue = cardea::edge::EdgeQueue::open(
                &cfg.storage.edge_db_path,
                cfg.edge.queue_capacity,
            )?;
            let depths = queue.depths().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&depths)?);
            } else {
                println!("\nCardea Edge Queue ({})", cfg.storage.edge_db_path.display());
                println!("{:<20} | {:>8} | {:>8}", "Source", "Queued", "Capacity");
                println!("{:-<20}-|-{:->8}-|-{:->8}", "", "", "");
                for (source, n) in &depths {
                    println!("{:<20} | {:>8} | {:>8}", source.as_str(), n, queue.capacity());
                }
                println!();
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}
