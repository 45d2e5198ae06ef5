use std::sync::Arc;

use clap::Parser;
use rapport_core::{PgRelationshipStore, RapportConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use rapport_server::{server, Engine};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "rapport.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match RapportConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Connect to DB
    let pool = match rapport_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match rapport_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Rapport DB health check passed");
        return Ok(());
    }

    if config.database.bootstrap_schema {
        rapport_core::db::bootstrap_schema(&pool).await?;
    }

    let engine = Arc::new(Engine::new(
        Arc::new(PgRelationshipStore::new(pool)),
        config,
    ));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Periodic rolling windows, hygiene, consolidation and rollup
    tokio::spawn(rapport_server::subsystems::maintenance::run_maintenance_loop(
        engine.clone(),
        tx.subscribe(),
    ));

    if engine.config().http.enabled {
        let http_engine = engine.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = rapport_server::http::start_http_server(http_engine, http_shutdown).await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = engine.config().service.socket_path.clone();
    server::run_unix_server(&socket_path, engine, tx.subscribe()).await?;

    Ok(())
}
