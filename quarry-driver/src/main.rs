use clap::Parser;
use quarry_core::Config;
use quarry_driver::{router, AppState, DriverSettings};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "quarry-driver")]
#[command(about = "Single-writer RPC driver for the quarry index database")]
struct Args {
    /// Config file (default: $QUARRY_CONFIG or ./quarry.toml)
    #[arg(long, env = "QUARRY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overrides [driver].bind
    #[arg(long)]
    bind: Option<String>,

    /// Port, overrides [driver].port
    #[arg(long)]
    port: Option<u16>,

    /// Database file, overrides [database].path
    #[arg(long)]
    db: Option<PathBuf>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let mut config = match Config::discover(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    if let Some(db) = args.db {
        config.database.path = match quarry_core::config::absolute_path(&db) {
            Ok(path) => path,
            Err(err) => {
                tracing::error!(db = %db.display(), error = %err, "failed to resolve database path");
                return ExitCode::FAILURE;
            }
        };
    }
    let bind = args.bind.unwrap_or_else(|| config.driver.bind.clone());
    let port = args.port.unwrap_or(config.driver.port);

    let state = match AppState::start(DriverSettings::from_config(&config)) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "failed to start executor");
            return ExitCode::FAILURE;
        }
    };

    let addr = format!("{}:{}", bind, port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %addr, error = %err, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(addr = %addr, db = %config.database.path.display(), "quarry-driver listening");

    let server = axum::serve(listener, router(state)).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    });
    if let Err(err) = server.await {
        tracing::error!(error = %err, "server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
