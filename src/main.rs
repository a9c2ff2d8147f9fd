//! # Main — Server Entry Point
//!
//! Boots the extraction platform: structured logging, settings from the
//! environment, PostgreSQL connection and migrations, and the Axum server
//! with the WebSocket extraction stream.
//!
//! ## Exit codes
//!
//! - `0` — clean shutdown
//! - `2` — configuration or startup error (bad env, storage unreachable)
//! - `130` — interrupted by SIGINT
//!
//! ## Environment
//!
//! `DATABASE_URL`, `LOG_LEVEL`, `LOG_FORMAT` (`text`|`json`), `SERVER_HOST`,
//! `SERVER_PORT`, `GEONAMES_BASE_URL`, `MAX_BOTS_DEFAULT`,
//! `SNAPSHOT_INTERVAL_MS`, `DRIVER_HEADLESS`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use placehound::config::Settings;
use placehound::db::Database;
use placehound::driver::{ChromeDriver, Driver, ScriptedDriver};
use placehound::events::EventBus;
use placehound::geonames::GeonamesClient;
use placehound::license::StaticLicense;
use placehound::server::{build_router, AppState};
use placehound::service::CampaignService;

#[derive(Parser)]
#[command(
    name = "placehound",
    about = "Extract place records from a public map service at campaign scale"
)]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extraction server (HTTP API + WebSocket stream)
    Serve {
        /// Bind address (overrides SERVER_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides SERVER_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Browser driver: "chrome" or "scripted" (dry-run, no browser)
        #[arg(long, default_value = "chrome")]
        driver: String,
    },
    /// Apply the database schema and exit
    Migrate,
}

enum Shutdown {
    Clean,
    Interrupted,
}

fn main() {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for structured collectors, human-readable otherwise;
    // LOG_LEVEL feeds the env filter.
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("could not start runtime: {e}");
            std::process::exit(2);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(Shutdown::Clean) => {}
        Ok(Shutdown::Interrupted) => std::process::exit(130),
        Err(e) => {
            eprintln!("startup error: {e:#}");
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> Result<Shutdown> {
    let settings = Settings::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let database_url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL is required (set via --database-url or env)")?;

    let db = Database::connect(database_url).await?;
    info!(
        database = %placehound::redact_database_url(database_url),
        "connected to storage"
    );
    db.run_migrations()
        .await
        .map_err(|e| anyhow::anyhow!("migrations failed: {e}"))?;

    let (host, port, driver_kind) = match cli.command {
        Commands::Migrate => {
            info!("schema is up to date");
            return Ok(Shutdown::Clean);
        }
        Commands::Serve { host, port, driver } => (host, port, driver),
    };

    let driver: Arc<dyn Driver> = match driver_kind.as_str() {
        "chrome" => Arc::new(ChromeDriver::new(settings.driver_headless)),
        "scripted" => Arc::new(ScriptedDriver::new(10)),
        other => anyhow::bail!("unknown driver {other:?} (expected \"chrome\" or \"scripted\")"),
    };

    let bus = EventBus::new();
    let geonames = Arc::new(GeonamesClient::new(&settings.geonames_base_url));
    let license = Arc::new(StaticLicense::allow_all());
    let service = CampaignService::new(
        db.clone(),
        Arc::clone(&bus),
        Arc::clone(&geonames),
        driver,
        license,
        settings.clone(),
    );
    let state = AppState::new(db, bus, service, geonames);
    let app = build_router(state);

    let bind_host = host.unwrap_or_else(|| settings.server_host.clone());
    let bind_port = port.unwrap_or(settings.server_port);
    let listener = tokio::net::TcpListener::bind((bind_host.as_str(), bind_port))
        .await
        .with_context(|| format!("could not bind {bind_host}:{bind_port}"))?;
    info!(host = %bind_host, port = bind_port, "placehound listening");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            flag.store(true, Ordering::SeqCst);
            info!("shutdown signal received");
        })
        .await?;

    if interrupted.load(Ordering::SeqCst) {
        Ok(Shutdown::Interrupted)
    } else {
        Ok(Shutdown::Clean)
    }
}
