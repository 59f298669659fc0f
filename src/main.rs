//! Herald CLI - send web push notifications and manage subscriptions.
//!
//! This is the main binary entry point. See the `herald` library for the
//! core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use herald::notifications::{Registration, SubscriptionId};
use herald::server::{self, AppState};
use herald::{Config, FileStore, NotificationRequest, PushService, ServerIdentity, SubscriptionStore};
use mimalloc::MiMalloc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Web push dispatch engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a notification to every stored subscription
    Send {
        /// Notification title
        #[arg(long)]
        title: Option<String>,
        /// Notification body
        #[arg(long)]
        body: Option<String>,
        /// Topic identifier forwarded to the service worker
        #[arg(long)]
        topic_id: Option<String>,
        /// URL opened when the notification is clicked
        #[arg(long)]
        url: Option<String>,
    },
    /// Serve the HTTP dispatch endpoint
    Serve {
        /// Listen address (overrides config and HERALD_BIND)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Manage the server's VAPID keypair
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    /// Register (or refresh) a subscription
    Subscribe {
        /// Push service endpoint URL
        #[arg(long)]
        endpoint: String,
        /// Subscriber P-256 public key (base64)
        #[arg(long)]
        p256dh: String,
        /// Subscriber auth secret (base64)
        #[arg(long)]
        auth: String,
        /// Owner reference
        #[arg(long)]
        owner: Option<String>,
    },
    /// Remove subscriptions by id
    Unsubscribe {
        /// Subscription ids
        #[arg(required = true)]
        ids: Vec<SubscriptionId>,
    },
    /// List stored subscriptions
    List,
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Generate a new VAPID keypair and print it as JSON
    Generate {
        /// Also write it to identity.json in the config directory
        #[arg(long)]
        save: bool,
    },
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("HERALD_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path:?}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<dyn SubscriptionStore>> {
    let path = config.store_path()?;
    let store = FileStore::open(&path)
        .with_context(|| format!("Failed to open subscription store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_service(config: &Config) -> Result<PushService> {
    let store = open_store(config)?;
    PushService::from_config(config, store).context("Invalid configuration")
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping");
            token.cancel();
        }
    });
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Send {
            title,
            body,
            topic_id,
            url,
        } => {
            let config = Config::load()?;
            let service = build_service(&config)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let request = NotificationRequest {
                title,
                body,
                topic_id,
                url,
            };
            let report = service.send(request, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report.to_response())?);
        }
        Commands::Serve { bind } => {
            let config = Config::load()?;
            let service = build_service(&config)?;
            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());

            let addr = bind.unwrap_or_else(|| config.bind.clone());
            let state = Arc::new(AppState { service, shutdown });
            server::serve(state, &addr).await?;
        }
        Commands::Keys {
            command: KeysCommand::Generate { save },
        } => {
            let identity = ServerIdentity::generate();
            println!("{}", serde_json::to_string_pretty(&identity.to_stored())?);
            if save {
                let path = Config::save_identity(&identity)?;
                eprintln!("Saved to {}", path.display());
            }
        }
        Commands::Subscribe {
            endpoint,
            p256dh,
            auth,
            owner,
        } => {
            let config = Config::load()?;
            let store = open_store(&config)?;
            let subscription = store
                .upsert(Registration {
                    endpoint,
                    p256dh,
                    auth,
                    owner,
                })
                .await?;
            if let Err(e) = subscription.keys() {
                eprintln!("Warning: stored subscription has unusable keys: {e}");
            }
            println!("{}", subscription.id);
        }
        Commands::Unsubscribe { ids } => {
            let config = Config::load()?;
            let store = open_store(&config)?;
            let removed = store.delete_many(&ids).await?;
            println!("Removed {removed} of {} subscription(s)", ids.len());
        }
        Commands::List => {
            let config = Config::load()?;
            let store = open_store(&config)?;
            let subscriptions = store.list_all().await?;
            println!("{}", serde_json::to_string_pretty(&subscriptions)?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    run(Cli::parse()).await
}
