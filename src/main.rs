use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};

use frame_relay::relay::protocol::DEFAULT_RELAY_PORT;
use frame_relay::utils::logging;
use frame_relay::{RelayConfig, RelayServer, ReplyMode, SessionScope, shutdown_channel};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relays framed payloads from a TCP control connection to TCP/UDP destinations",
    long_about = None
)]
struct Args {
    /// Address to bind the relay listener on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Relay listener port
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,

    /// Listen backlog (at least 5)
    #[arg(long, default_value = "128")]
    backlog: u32,

    /// Seconds a UDP session may go without a reply before it is closed
    #[arg(long, default_value = "5")]
    udp_idle_timeout: u64,

    /// Seconds to wait for a TCP destination to accept
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Maximum concurrent control connections (unbounded if omitted)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum concurrent outbound sessions (unbounded if omitted)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Whether control connections share sessions to the same destination
    #[arg(long, value_enum, default_value_t = SessionScope::Connection)]
    session_scope: SessionScope,

    /// Reply format written back to workers
    #[arg(long, value_enum, default_value_t = ReplyMode::Raw)]
    reply_mode: ReplyMode,

    /// Drop UDP replies that do not come from the destination address
    #[arg(long)]
    strict_udp_source: bool,

    /// Log filter, overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            backlog: self.backlog,
            udp_idle_timeout: Duration::from_secs(self.udp_idle_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_connections: self.max_connections,
            max_sessions: self.max_sessions,
            session_scope: self.session_scope,
            reply_mode: self.reply_mode,
            strict_udp_source: self.strict_udp_source,
            ..RelayConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config = args.into_config();
    info!(
        scope = ?config.session_scope,
        replies = ?config.reply_mode,
        udp_idle_timeout = ?config.udp_idle_timeout,
        "🚇 Starting relay"
    );

    let server = RelayServer::bind(config)
        .await
        .context("Relay startup failed")?;
    info!("📡 Relay listening on {}", server.local_addr()?);

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Ctrl-C received, shutting down");
                trigger.trigger();
            }
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
        }
    });

    server.run(shutdown).await
}
