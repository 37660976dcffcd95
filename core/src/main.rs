use clap::Parser;
use mqueue::{BrokerConfig, BrokerServer, Result};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mqserver")]
#[command(about = "A bounded work-queue message broker")]
struct Args {
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Admission limit on concurrent connections
    #[arg(short = 'a', long)]
    max_connections: Option<usize>,

    /// Redeliveries of an unacknowledged message before it fails
    #[arg(short = 'r', long)]
    max_retries: Option<u32>,

    /// Largest accepted message payload in bytes
    #[arg(short = 'm', long)]
    max_message_size: Option<usize>,

    /// Most messages held at once, failed ones included
    #[arg(long)]
    capacity: Option<usize>,

    #[arg(long)]
    priorities: Option<u8>,

    /// 0 disables redelivery on ack timeout
    #[arg(long)]
    ack_timeout_ms: Option<u64>,

    /// 0 disables starvation boosting
    #[arg(long)]
    boost_timeout_ms: Option<u64>,

    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut BrokerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(max_message_size) = self.max_message_size {
            config.max_message_size = max_message_size;
        }
        if let Some(capacity) = self.capacity {
            config.queue_capacity = capacity;
        }
        if let Some(priorities) = self.priorities {
            config.priority_levels = priorities;
        }
        if let Some(ms) = self.ack_timeout_ms {
            config.ack_timeout_ms = ms;
        }
        if let Some(ms) = self.boost_timeout_ms {
            config.boost_timeout_ms = ms;
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config.handshake_timeout_ms = ms;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let mut config = BrokerConfig::from_env()?;
    args.apply(&mut config);

    info!("Starting MQueue broker on {}", config.bind_address());
    info!("Max connections: {}", config.max_connections);
    info!("Max retries: {}", config.max_retries);
    info!("Max message size: {} bytes", config.max_message_size);
    info!(
        "Queue capacity: {} ({} priority levels)",
        config.queue_capacity, config.priority_levels
    );

    let broker = BrokerServer::new(config)?.start().await?;

    wait_for_signal().await;
    broker.shutdown().await;

    info!("MQueue shut down successfully");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            if signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down gracefully...");
            }
            return;
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down gracefully..."),
        _ = terminate.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down gracefully...");
    }
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
