use clap::Parser;
use parlance::capability::Capabilities;
use parlance::config::Config;
use parlance::error::Result;
use parlance::session::RoomRegistry;
use parlance::wire::{router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "parlance",
    version,
    about = "Real-time bidirectional speech translation server"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the server (default)
    Serve {
        /// Bind address override, e.g. 0.0.0.0:8080
        #[arg(long)]
        bind: Option<String>,
        /// Use mock model backends instead of loading real models.
        /// Development and testing only.
        #[arg(long)]
        mock_capabilities: bool,
    },
    /// Verify that configured model backends can initialize
    Check,
    /// Print the effective configuration as TOML
    Defaults,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config.with_env_overrides())
}

async fn serve(mut config: Config, bind: Option<String>, mock: bool) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind_addr = bind;
    }

    let caps = if mock {
        info!("running with mock capabilities");
        Capabilities::mock(&config)
    } else {
        Capabilities::initialize(&config)?
    };

    let registry = Arc::new(RoomRegistry::new(&config.room));
    let sweeper = registry.spawn_sweeper(Duration::from_secs(config.room.sweep_interval_secs));

    let bind_addr = config.server.bind_addr.clone();
    let state = AppState {
        caps: Arc::new(caps),
        registry,
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("listening on {}", bind_addr);
    axum::serve(listener, router(state)).await?;

    sweeper.abort();
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    let caps = Capabilities::initialize(config)?;
    println!("asr: {} ready", caps.asr.model_name());
    println!("mt: ready");
    println!("tts: ready");
    println!("vad: ready");
    Ok(())
}

fn defaults(config: &Config) -> Result<()> {
    match toml::to_string_pretty(config) {
        Ok(rendered) => {
            println!("{}", rendered);
            Ok(())
        }
        Err(e) => Err(parlance::error::ParlanceError::ConfigInvalidValue {
            key: "config".to_string(),
            message: e.to_string(),
        }),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parlance=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let command = cli.command.unwrap_or(Commands::Serve {
        bind: None,
        mock_capabilities: false,
    });

    let outcome = match command {
        Commands::Serve {
            bind,
            mock_capabilities,
        } => serve(config, bind, mock_capabilities).await,
        Commands::Check => check(&config),
        Commands::Defaults => defaults(&config),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
