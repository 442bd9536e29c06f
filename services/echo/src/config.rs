// Echo service configuration sourced from environment variables.
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use lyra_service::ServiceConfig;
use lyra_wire::Frame;

#[derive(Debug, Clone)]
pub struct EchoConfig {
    // TCP listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Per-request deadline; 0 disables timeouts.
    pub request_timeout_ms: u64,
    // Max concurrently in-flight requests per connection.
    pub request_buffer_size: usize,
    // Cadence of the per-connection idle sweep.
    pub idle_interval_ms: u64,
    // Output queue depth between the core and the socket writer.
    pub write_buffer: usize,
    // Max frame payload accepted on the wire.
    pub max_frame_bytes: usize,
    // Log per-request failures.
    pub log_errors: bool,
}

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REQUEST_BUFFER_SIZE: usize = 128;
const DEFAULT_IDLE_INTERVAL_MS: u64 = 100;
const DEFAULT_WRITE_BUFFER: usize = 64;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

impl EchoConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("LYRA_ECHO_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7400".to_string())
            .parse()
            .with_context(|| "parse LYRA_ECHO_BIND")?;
        let metrics_bind = std::env::var("LYRA_ECHO_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse LYRA_ECHO_METRICS_BIND")?;
        let request_timeout_ms = std::env::var("LYRA_ECHO_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let request_buffer_size = std::env::var("LYRA_ECHO_REQUEST_BUFFER")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_REQUEST_BUFFER_SIZE);
        let idle_interval_ms = std::env::var("LYRA_ECHO_IDLE_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_IDLE_INTERVAL_MS);
        let write_buffer = std::env::var("LYRA_ECHO_WRITE_BUFFER")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WRITE_BUFFER);
        let max_frame_bytes = std::env::var("LYRA_ECHO_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let log_errors = std::env::var("LYRA_ECHO_LOG_ERRORS")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);
        Ok(Self {
            bind,
            metrics_bind,
            request_timeout_ms,
            request_buffer_size,
            idle_interval_ms,
            write_buffer,
            max_frame_bytes,
            log_errors,
        })
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Per-connection service configuration derived from this config.
    pub fn service_config(&self) -> ServiceConfig<Frame, Frame> {
        ServiceConfig::new("echo")
            .with_request_timeout(self.request_timeout())
            .with_request_buffer_size(self.request_buffer_size)
            .with_log_errors(self.log_errors)
    }
}
