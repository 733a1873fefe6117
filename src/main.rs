use std::sync::Arc;

use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use release_gate::{build_router, recovery, AppState, Config, Executor, Scheduler, SqliteLedger};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(db_path = %config.db_path, "opening release ledger");
    let ledger = SqliteLedger::open(&config.db_path)?;

    let executor = Executor::new(
        ledger.clone(),
        config.release_command.clone(),
        config.release_timeout,
        config.term_grace,
    );
    let scheduler = Scheduler::new(ledger.clone(), executor);

    recovery::recover(&ledger, &scheduler).await?;

    tokio::spawn(scheduler.clone().run_ticker(config.drain_interval));

    let state = Arc::new(AppState {
        ledger,
        scheduler,
        default_cleanup_days: config.default_cleanup_days,
        api_key: config.api_key.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "release-gate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
