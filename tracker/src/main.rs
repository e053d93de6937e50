// Rideshare Tracker - offline-first shift and ride tracking core
// Entry point: opens the local store and runs background sync until interrupted

use rideshare_tracker::App;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DATA_DIR_ENV: &str = "RIDESHARE_TRACKER_DATA_DIR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rideshare_tracker=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Rideshare Tracker");

    let data_dir = match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?.join("rideshare-data"),
    };

    let app = App::open(&data_dir).await?;
    let view = app.tracker.view();
    match &view.shift {
        Some(shift) => tracing::info!("Resumed {} for shift {}", view.state, shift.id),
        None => tracing::info!("No open shift"),
    }

    tokio::signal::ctrl_c().await?;
    app.shutdown().await;

    Ok(())
}
