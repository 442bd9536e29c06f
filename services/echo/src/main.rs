// Echo service main entry point.
use anyhow::{Context, Result};
use echo::config::EchoConfig;
use echo::observability;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EchoConfig::from_env().context("load echo config")?;
    let metrics_handle = observability::init_observability();

    let listener = TcpListener::bind(config.bind)
        .await
        .context("bind echo listener")?;
    tracing::info!(addr = %listener.local_addr()?, "echo listener started");

    let metrics_task = {
        let metrics_bind = config.metrics_bind;
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
                tracing::warn!(error = %err, "metrics endpoint exited");
            }
        })
    };
    let accept_task = tokio::spawn(async move {
        if let Err(err) = echo::serve(listener, config).await {
            tracing::warn!(error = %err, "accept loop exited");
        }
    });

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    accept_task.abort();
    metrics_task.abort();
    tracing::info!("echo stopped");
    Ok(())
}
