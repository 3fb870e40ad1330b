mod api;
mod commands;
mod config;
mod downloader;
mod errors;
mod metadata;
mod notifications;
mod processing;
mod selection;
mod storage;
mod utils;

use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{AppConfig, DownloadType};
use crate::notifications::{NotificationAction, Notifier};

const STORE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "iwara-dl")]
#[command(about = "Resolve Iwara videos and hand them to a download backend", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Shared store file (defaults to the user data directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Selection scope shared by every instance using the same store
    #[arg(long, global = true, default_value = "default")]
    scope: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add IDs, file names or URLs to the selection (separated by `|`)
    Select { input: String },
    /// Remove IDs from the selection
    Deselect { input: String },
    /// Print the current selection
    List,
    /// Empty the selection
    Clear,
    /// Process every selected video
    Run,
    /// Process the given IDs right away
    Download { input: String },
    /// Restart stalled Aria2 transfers
    Reconcile {
        /// Keep reconciling on the configured interval
        #[arg(long)]
        watch: bool,
    },
    /// Test a backend connection and the path template
    Check {
        #[arg(long, value_enum)]
        backend: Option<DownloadType>,
    },
    /// Show how manual input would be split into IDs
    Parse { input: String },
    /// Read or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Store an access or refresh token
    Login { token: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    /// Set one field; the value is parsed as JSON when possible
    Set { field: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    if let Commands::Parse { input } = &cli.command {
        println!("{}", serde_json::to_string_pretty(&commands::parse_ids(input))?);
        return Ok(());
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::get_config_path()?,
    };
    let config = match AppConfig::load_from(&config_path) {
        Ok(config) => {
            info!("Configuration loaded from {:?}", config_path);
            config
        }
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };
    let store_path = match cli.store {
        Some(path) => path,
        None => AppConfig::get_data_dir()?.join("store.db"),
    };

    let (notifier, mut notifications) = Notifier::channel();
    let state = commands::AppState::initialize(
        config,
        Some(config_path),
        store_path,
        &cli.scope,
        notifier,
    )
    .await?;
    let _watcher = state.store.clone().watch(STORE_POLL_INTERVAL);

    let printer = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification.action {
                Some(NotificationAction::RetryVideo { id, .. }) => {
                    eprintln!("  retry with: iwara-dl download {}", id)
                }
                Some(NotificationAction::OpenUrl(url)) => eprintln!("  open: {}", url),
                None => {}
            }
        }
    });

    let result = match cli.command {
        Commands::Select { input } => commands::select_videos(&state, &input).await,
        Commands::Deselect { input } => commands::deselect_videos(&state, &input).await,
        Commands::List => commands::list_selection(&state).await,
        Commands::Clear => commands::clear_selection(&state).await,
        Commands::Run => commands::run_selection(&state).await,
        Commands::Download { input } => commands::download_videos(&state, &input).await,
        Commands::Reconcile { watch } => commands::reconcile(&state, watch).await,
        Commands::Check { backend } => commands::check(&state, backend).await,
        Commands::Config { action: ConfigAction::Show } => commands::show_config(&state),
        Commands::Config {
            action: ConfigAction::Set { field, value },
        } => commands::set_config(&state, &field, &value),
        Commands::Login { token } => commands::login_token(&state, &token),
        Commands::Parse { input } => Ok(commands::parse_ids(&input)),
    };

    // The channel closes once host downloads holding a notifier are done.
    drop(state);
    let _ = printer.await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
