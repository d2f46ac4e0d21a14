//! Warehouse Pool - Main entry point.
//!
//! Brings up a pool against the configured endpoint, probes connectivity,
//! then either runs the given statements or serves until SIGINT/SIGTERM.

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use warehouse_pool::config::Config;
use warehouse_pool::db::{SqlxDriver, WarehousePool};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        endpoint = %config.endpoint,
        "Starting warehouse pool v{}",
        env!("CARGO_PKG_VERSION")
    );

    let driver = SqlxDriver::new(config.endpoint.clone())?;
    info!(backend = %driver.backend(), "Using sqlx driver");

    let pool = match WarehousePool::new(config.pool.clone(), Arc::new(driver)) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!();
            eprintln!("Required: --account, --username, --password, --database, --warehouse");
            eprintln!("          (or WAREHOUSE_ACCOUNT, WAREHOUSE_USERNAME, ... in the environment)");
            eprintln!();
            eprintln!("Examples:");
            eprintln!(
                "  warehouse-pool --endpoint postgres://localhost:5432 --account a --username u \\"
            );
            eprintln!("      --password p --database analytics --warehouse compute_wh -e 'SELECT 1'");
            eprintln!("  warehouse-pool --endpoint sqlite:local.db ... --print-metrics -e 'SELECT 1'");
            std::process::exit(1);
        }
    };

    // Startup probe; the health monitor keeps running in the background.
    pool.start().await??;

    let result = run(&config, &pool).await;

    if config.print_metrics {
        print!("{}", pool.metrics().render_prometheus());
    }

    pool.cleanup().await;

    if let Err(e) = result {
        error!(error = %e, "Warehouse pool error");
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run(config: &Config, pool: &WarehousePool) -> Result<(), Box<dyn std::error::Error>> {
    if config.statements.is_empty() {
        info!("Pool ready, waiting for SIGINT or SIGTERM");
        wait_for_signal().await?;
        info!("Shutting down");
        return Ok(());
    }

    for sql in &config.statements {
        let rows = pool.execute_query(sql, &[], None).await?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() -> std::io::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received SIGINT");
        }
        _ = terminate => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_ends_wait() {
        let waiter = tokio::spawn(wait_for_signal());
        // let the handler install before signalling
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("SIGTERM wakes the waiter")
            .unwrap()
            .unwrap();
    }
}
