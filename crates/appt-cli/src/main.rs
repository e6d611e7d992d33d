use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use appt_reconcile::Reconciler;
use appt_storage::{connect_gateway, GatewayConfig, GatewayKind, PgGateway};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "appt-cli")]
#[command(about = "GHL appointment webhook reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook HTTP server.
    Serve,
    /// Apply SQL migrations to DATABASE_URL.
    Migrate,
    /// Feed a saved webhook payload through the reconciler.
    Replay {
        path: PathBuf,
        /// Treat the payload as an "appointment created" delivery.
        #[arg(long)]
        created: bool,
    },
    /// Show the outcome a vendor status maps to.
    Classify { status: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => appt_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = GatewayConfig::from_env()?;
            if config.kind != GatewayKind::Postgres {
                bail!("migrate needs the postgres gateway; set DATABASE_URL");
            }
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            PgGateway::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Replay { path, created } => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let payload: serde_json::Value =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            let gateway = connect_gateway(&GatewayConfig::from_env()?).await?;
            let reconciler = Reconciler::new(gateway);
            let result = if created {
                reconciler.handle_created_event(&payload).await
            } else {
                reconciler.handle_status_event(&payload).await
            };
            match result {
                Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                Err(err) => bail!("{} ({}): {}", err, err.reason(), err.details().unwrap_or_default()),
            }
        }
        Commands::Classify { status } => match appt_adapters::classify_status(&status) {
            Some(outcome) => println!("{status} -> {outcome}"),
            None => println!("{status} -> no mapping"),
        },
    }

    Ok(())
}
