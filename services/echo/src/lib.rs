// Echo service: a lyra demonstration server that answers every frame with
// its own payload, pipelined and in order.
use std::time::Duration;

use anyhow::Result;
use lyra_service::ConnectionDriver;
use tokio::net::{TcpListener, TcpStream};

pub mod codec;
pub mod config;
pub mod handler;
pub mod observability;

use codec::{FrameSink, FrameSource};
use config::EchoConfig;
use handler::EchoHandler;

/// Accept loop: one connection driver per client.
pub async fn serve(listener: TcpListener, config: EchoConfig) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(%peer, "accepted connection");
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, config).await {
                tracing::warn!(error = %err, "connection handler failed");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, config: EchoConfig) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let source = FrameSource::new(read_half, config.max_frame_bytes);
    let sink = FrameSink::new(write_half);
    ConnectionDriver::new(config.service_config(), EchoHandler)
        .with_idle_period(Duration::from_millis(config.idle_interval_ms))
        .with_write_buffer(config.write_buffer)
        .run(source, sink)
        .await?;
    Ok(())
}
