//! Duet driver
//!
//! Runs a bounded message exchange between two players:
//! - `single`: both players in this process over an in-process channel
//! - `multi initiator|responder`: one player per process over TCP

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use duet_player::{CountingPlayer, DEFAULT_MAX_MESSAGES, DEFAULT_POLL_INTERVAL, SessionSummary};
use duet_transport::{InProcessTransport, TcpConfig, TcpTransport};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const FIRST_MESSAGE: &str = "Hello";

#[derive(Parser)]
#[command(name = "duet", version, about = "Two players exchanging numbered messages")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Print a JSON session summary to stdout on exit
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Both players in this process
    Single {
        /// Messages each way before the initiator stops
        #[arg(long, default_value_t = DEFAULT_MAX_MESSAGES)]
        max: i32,
        /// Stop-condition poll interval in milliseconds
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
        poll_ms: u64,
    },
    /// One player per process, connected over TCP
    Multi {
        #[arg(value_enum, ignore_case = true)]
        role: Role,
        /// Host the initiator dials or the responder binds
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 9999)]
        port: u16,
        /// Messages each way before the initiator stops
        #[arg(long, default_value_t = DEFAULT_MAX_MESSAGES)]
        max: i32,
        /// Pause between connecting and the first message
        #[arg(long, default_value_t = 1000)]
        initial_delay_ms: u64,
        /// Stop-condition poll interval in milliseconds
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
        poll_ms: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Initiator,
    Responder,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let result = match cli.mode {
        Mode::Single { max, poll_ms } => run_single(max, Duration::from_millis(poll_ms)).await,
        Mode::Multi {
            role,
            host,
            port,
            max,
            initial_delay_ms,
            poll_ms,
        } => {
            let config = TcpConfig::new(host, port);
            match role {
                Role::Initiator => {
                    run_initiator(
                        config,
                        max,
                        Duration::from_millis(initial_delay_ms),
                        Duration::from_millis(poll_ms),
                    )
                    .await
                }
                Role::Responder => run_responder(config, max).await,
            }
        }
    };

    let summaries = result.map_err(|e| {
        let phase = e.phase();
        error!("Session failed during {}: {}", phase, e);
        anyhow::Error::new(e).context(format!("{} phase failed", phase))
    })?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }
    Ok(())
}

/// Both players share this process
async fn run_single(max: i32, poll_interval: Duration) -> duet_core::Result<Vec<SessionSummary>> {
    info!("=== Single Process Mode ===");
    info!("PID: {}", std::process::id());

    let (transport1, transport2) = InProcessTransport::pair();
    let player1 = CountingPlayer::with_max_messages("Player1", transport1, true, max);
    let player2 = CountingPlayer::with_max_messages("Player2", transport2, false, max);

    player1.start().await?;
    player2.start().await?;

    player1.send_message(FIRST_MESSAGE).await?;
    player1.wait_for_stop_condition(poll_interval).await;

    info!("=== Stop condition reached ===");
    info!("Player1 sent: {} messages", player1.sent_count());
    info!("Player1 received: {} messages", player1.received_count());

    player1.stop().await;
    player2.stop().await;
    info!("=== Graceful shutdown complete ===");

    Ok(vec![player1.summary(), player2.summary()])
}

/// Dial the responder, start the exchange and wait for the stop condition
async fn run_initiator(
    config: TcpConfig,
    max: i32,
    initial_delay: Duration,
    poll_interval: Duration,
) -> duet_core::Result<Vec<SessionSummary>> {
    info!("=== Multi Process Mode ===");
    info!("Role: initiator");
    info!("PID: {}", std::process::id());

    let player =
        CountingPlayer::with_max_messages("Initiator", TcpTransport::connector(config), true, max);
    player.start().await?;

    tokio::time::sleep(initial_delay).await;
    player.send_message(FIRST_MESSAGE).await?;

    tokio::select! {
        _ = player.wait_for_stop_condition(poll_interval) => {
            info!("=== Stop condition reached ===");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the stop condition");
        }
    }
    info!("Initiator sent: {} messages", player.sent_count());
    info!("Initiator received: {} messages", player.received_count());

    player.stop().await;
    info!("=== Graceful shutdown complete ===");
    Ok(vec![player.summary()])
}

/// Accept the initiator and answer until interrupted
async fn run_responder(config: TcpConfig, max: i32) -> duet_core::Result<Vec<SessionSummary>> {
    info!("=== Multi Process Mode ===");
    info!("Role: responder");
    info!("PID: {}", std::process::id());

    let player =
        CountingPlayer::with_max_messages("Responder", TcpTransport::listener(config), false, max);
    player.start().await?;

    info!("Responder waiting for messages...");
    info!("Press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }

    info!("Responder received: {} messages", player.received_count());
    player.stop().await;
    info!("=== Graceful shutdown complete ===");
    Ok(vec![player.summary()])
}
