//! Echo billing gateway server binary.
//!
//! Everything not given on the command line comes from the environment (see
//! `ApiConfig::from_env`); a `.env` file in the working directory is loaded first.

use std::time::Duration;

use clap::Parser;
use echo_api::config::ApiConfig;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI arguments for the gateway.
#[derive(Parser, Debug)]
#[command(name = "echo_api_server", about = "Echo OAuth + metered LLM billing gateway")]
struct Args {
    /// Address to bind. Overrides `BIND_ADDR`.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// Port to listen on, keeping the configured host. Ignored when `--bind` is set.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost:5432/echo")]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// Skip embedded migrations on startup.
    #[arg(long, default_value_t = false)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,echo_api=debug,echo_core=debug")
            }),
        )
        .init();

    let args = Args::parse();

    let mut config = ApiConfig::from_env();
    config.pg_connection_url = args.database_url;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    } else if let Some(port) = args.port {
        let host = config
            .bind_addr
            .rsplit_once(':')
            .map_or("127.0.0.1", |(host, _)| host)
            .to_string();
        config.bind_addr = format!("{host}:{port}");
    }
    config.validate()?;

    info!(
        version = echo_core::version(),
        bind_addr = %config.bind_addr,
        max_connections = args.max_connections,
        "starting echo_api_server"
    );
    if config.payment_webhook_secret.is_none() {
        warn!("PAYMENT_WEBHOOK_SECRET is unset; payment webhooks will be refused");
    }
    if !config.x402.enabled() {
        info!("X402 disabled (set X402_FACILITATOR_URL and X402_PAY_TO to enable)");
    }

    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.pg_connection_url)
        .await?;

    if args.skip_migrations {
        info!("skipping database migrations");
    } else {
        info!("running database migrations");
        echo_api::migrate(&pool).await?;
    }

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    let local_addr = listener.local_addr()?;

    let state = echo_api::AppState::new(pool.clone(), config);
    let app = echo_api::router(state);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    info!(addr = %local_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    // Waits for checked-out connections to come back.
    pool.close().await;
    info!("shutdown complete");
    Ok(())
}
