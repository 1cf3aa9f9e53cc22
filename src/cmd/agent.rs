use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::agent;
use crate::config::Config;

/// Run the telemetry loop, wiring ctrl-c to a graceful drain.
pub async fn run(config: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            let _ = shutdown_tx.send(true);
        }
    });

    agent::start(config, shutdown_rx).await?;
    info!("telemetry loop stopped");
    Ok(())
}
