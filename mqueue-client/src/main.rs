use clap::Parser;
use mqueue_client::{run_script, ClientConfigBuilder, ExitStatus, RetryConfig, Script};
use std::process;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mqclient")]
#[command(about = "Push, pop and verify messages against an MQueue broker")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9092")]
    broker: String,

    /// Messages to push and then pop back
    #[arg(short = 'n', long, default_value_t = 1)]
    messages: usize,

    /// Payload size in bytes
    #[arg(short, long, default_value_t = 100)]
    size: usize,

    #[arg(long, default_value_t = 0)]
    priority: u8,

    /// Retries after the first attempt for connects and pushes
    #[arg(short = 'r', long, default_value_t = 3)]
    retries: u32,

    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,

    #[arg(long, default_value_t = 30000)]
    request_timeout_ms: u64,

    /// Frame ceiling until the broker announces its own
    #[arg(long, default_value_t = 1024 * 1024)]
    max_message_size: usize,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() {
                ExitStatus::Usage.code()
            } else {
                ExitStatus::Success.code()
            });
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let config = ClientConfigBuilder::new()
        .brokers(vec![args.broker.clone()])
        .connection_timeout(Duration::from_millis(args.connect_timeout_ms))
        .request_timeout(Duration::from_millis(args.request_timeout_ms))
        .retry_config(RetryConfig {
            max_retries: args.retries,
            ..RetryConfig::default()
        })
        .max_message_size(args.max_message_size)
        .build();
    let script = Script {
        messages: args.messages,
        size: args.size,
        priority: args.priority,
        ..Script::default()
    };

    info!(
        "Running {} message(s) of {} bytes against {}",
        script.messages, script.size, args.broker
    );
    let report = run_script(config, &script).await;
    process::exit(report.status.code());
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
