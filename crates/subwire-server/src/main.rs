//! subwire - GraphQL subscription server.
//!
//! Runs the subscription endpoint with the development passthrough engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use subwire_router::DrainPolicy;
use subwire_server::{PassthroughEngine, ServerConfig, SubscriptionServer, WebSocketConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "subwire-server")]
#[command(about = "GraphQL subscription server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SUBWIRE_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Endpoint path
    #[arg(long, env = "SUBWIRE_PATH", default_value = "/graphql")]
    path: String,

    /// Schema name used to build event names
    #[arg(long, env = "SUBWIRE_SCHEMA", default_value = "graphql")]
    schema: String,

    /// Maximum connected clients (unset: unbounded, negative: none)
    #[arg(long, env = "SUBWIRE_MAX_CLIENTS", allow_negative_numbers = true)]
    max_clients: Option<i64>,

    /// Protocol used when the client states no preference
    #[arg(long, default_value = "graphql-transport-ws")]
    default_protocol: String,

    /// Only allow these protocols (comma separated)
    #[arg(long, value_delimiter = ',')]
    allowed_protocols: Option<Vec<String>>,

    /// Reject clients without an Authorization header
    #[arg(long)]
    require_auth: bool,

    /// Keep-alive interval in seconds (0 disables)
    #[arg(long, default_value = "15")]
    keep_alive_secs: u64,

    /// Seconds a client has to send its init message
    #[arg(long, default_value = "10")]
    init_timeout_secs: u64,

    /// Events buffered per client before drops
    #[arg(long, default_value = "64")]
    client_buffer: usize,

    /// Send internal error messages to clients
    #[arg(long)]
    expose_exceptions: bool,

    /// Interval between shutdown drain checks, in milliseconds
    #[arg(long, default_value = "25")]
    drain_poll_ms: u64,

    /// Maximum shutdown drain time, in milliseconds
    #[arg(long, default_value = "5000")]
    drain_ceiling_ms: u64,

    /// Maximum inbound message size in bytes
    #[arg(long, default_value = "1048576")]
    max_message_size: usize,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.bind)
            .with_route_path(self.path.clone())
            .with_schema_name(self.schema.clone())
            .with_default_protocol(self.default_protocol.clone())
            .with_require_authenticated(self.require_auth)
            .with_init_timeout(Duration::from_secs(self.init_timeout_secs))
            .with_client_buffer_size(self.client_buffer)
            .with_expose_exceptions(self.expose_exceptions)
            .with_drain_policy(DrainPolicy::new(
                Duration::from_millis(self.drain_poll_ms),
                Duration::from_millis(self.drain_ceiling_ms),
            ))
            .with_websocket_config(
                WebSocketConfig::new().with_max_message_size(self.max_message_size),
            );

        if let Some(max) = self.max_clients {
            config = config.with_max_connected_clients(max);
        }
        if let Some(allowed) = &self.allowed_protocols {
            config = config.with_allowed_protocols(allowed.iter().cloned());
        }
        if self.keep_alive_secs > 0 {
            config = config.with_keep_alive_interval(Duration::from_secs(self.keep_alive_secs));
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    let config = cli.server_config();
    info!(
        bind = %config.bind_addr,
        path = %config.route_path,
        schema = %config.schema_name,
        "Starting subwire subscription server"
    );

    let server = Arc::new(SubscriptionServer::new(config, Arc::new(PassthroughEngine)));

    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown requested");
        }
        joined = serving => {
            match joined {
                Ok(Ok(())) => info!("Server stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "Server error");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let report = server.shutdown().await;
    info!(
        drained = report.drained,
        abandoned = report.abandoned,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Shutdown complete"
    );
    Ok(())
}
