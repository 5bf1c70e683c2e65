//! dbguard - database privilege discovery and policy management

use clap::{Parser, Subcommand};
use dbguard_cli::commands;
use dbguard_foundation::GuardConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dbguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: global dbguard config merged with ./.dbguard/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import connections, actors, objects, templates and groups from a catalog file
    Import {
        /// Catalog JSON file
        file: PathBuf,
    },

    /// Evaluate a privilege snapshot and regenerate discovered policies
    Discover {
        /// Connection id
        #[arg(long)]
        connection: i64,

        /// Snapshot JSON produced by the agent dump
        #[arg(long)]
        snapshot: PathBuf,

        /// Expected SHA-256 of the snapshot file
        #[arg(long)]
        checksum: Option<String>,
    },

    /// List the policies of a connection
    Policies {
        #[arg(long)]
        connection: i64,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write the rule file of a connection
    Export {
        #[arg(long)]
        connection: i64,

        /// Output directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup logging
    let log_level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => GuardConfig::load_from(path)?,
        None => GuardConfig::load()?,
    };

    match args.command {
        Command::Import { file } => {
            let store = commands::open_store(&config)?;
            let summary = commands::import_catalog(&store, &file)?;
            println!(
                "Imported {} connections, {} actors, {} databases, {} objects, {} templates, {} group-list policies, {} groups",
                summary.connections,
                summary.actors,
                summary.databases,
                summary.objects,
                summary.templates,
                summary.group_list_policies,
                summary.groups
            );
        }
        Command::Discover {
            connection,
            snapshot,
            checksum,
        } => {
            let store = commands::open_store(&config)?;
            let report = commands::discover_offline(
                &config,
                &store,
                connection,
                &snapshot,
                checksum.as_deref(),
            )
            .await?;
            println!("Job {}: {}", report.job_id, report.summary());
            for (tier, stats) in &report.tiers {
                println!(
                    "  {:<16} {} probes, {} allowed, {} errors",
                    tier, stats.probes, stats.allowed, stats.errors
                );
            }
        }
        Command::Policies { connection, json } => {
            let store = commands::open_store(&config)?;
            let rules = commands::list_rules(&store, connection)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else if rules.rules.is_empty() {
                println!("No policies for connection {}.", connection);
            } else {
                print!("{}", commands::render_rules(&rules.rules));
            }
        }
        Command::Export { connection, out } => {
            let store = commands::open_store(&config)?;
            let path = commands::export_rules(&config, &store, connection, out)?;
            println!("Rules written to {}", path.display());
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
