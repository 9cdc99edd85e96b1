use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use panelbridge::auth::{Authenticator, HttpAuthenticator, StaticAuthenticator};
use panelbridge::config::{AppConfig, AuthConfig, StoreConfig};
use panelbridge::engine::ReconcileEngine;
use panelbridge::panel::{HttpPanelClient, PanelClient};
use panelbridge::server::{self, AppState};
use panelbridge::store::{MemoryStore, OrderStore, RestStore};

/// Timeout for order store and identity provider calls.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about = "SMM panel order reconciliation worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    verbose: String,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the HTTP worker
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one bulk status sweep and exit (for cron-style hosts)
    Sweep,
    /// Poll one panel order, persist the result, and print it
    CheckStatus {
        /// Panel-assigned external order id
        external_order_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.verbose)),
        )
        .init();

    let config = AppConfig::from_env()?;

    let panel: Arc<dyn PanelClient> = Arc::new(HttpPanelClient::new(
        config.panel.api_url.clone(),
        config.panel.api_key.clone(),
        config.panel.timeout,
    )?);

    let store: Arc<dyn OrderStore> = match &config.store {
        StoreConfig::Rest { api_url, api_key } => {
            Arc::new(RestStore::new(api_url.clone(), api_key.clone(), BACKEND_TIMEOUT)?)
        }
        StoreConfig::Memory => {
            warn!("ORDERS_API_URL not set, using in-memory order store (orders will not survive a restart)");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(ReconcileEngine::new(panel, store, config.engine.clone()));

    match cli.command {
        Commands::Serve { port } => {
            let auth: Arc<dyn Authenticator> = match &config.auth {
                AuthConfig::Http { api_url, api_key } => Arc::new(HttpAuthenticator::new(
                    format!("{}/auth/v1/user", api_url.trim_end_matches('/')),
                    api_key.clone(),
                    BACKEND_TIMEOUT,
                )?),
                AuthConfig::Static { token } => {
                    if token.is_empty() {
                        warn!("no WORKER_API_TOKEN configured, all requests will be rejected");
                    }
                    Arc::new(StaticAuthenticator::new(token.clone()))
                }
            };

            server::run(AppState { engine, auth }, port.unwrap_or(config.port)).await?;
        }
        Commands::Sweep => {
            let report = engine.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckStatus { external_order_id } => {
            let report = engine.check_status(&external_order_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
