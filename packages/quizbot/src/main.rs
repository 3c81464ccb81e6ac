//! Quizbot
//!
//! Runs the quiz over stdin/stdout. Each input line is `<chat_id> <text>` or
//! `<chat_id> cb:<data>`; replies are printed with their keyboards. Logs go
//! to stderr.

mod config;
mod console;
mod quiz;

use std::sync::Arc;

use anyhow::{ensure, Result};
use clap::Parser;
use nabot::AppConfig;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::console::{ConsoleBot, ConsoleUpdate};

#[derive(Parser, Debug)]
#[command(name = "quizbot", about = "A quiz bot on the console")]
struct Cli {
    /// Process at most this many updates at once [env: QUIZBOT_MAX_CONCURRENCY]
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Input buffer size [env: QUIZBOT_CHANNEL_CAPACITY, default: 64]
    #[arg(long)]
    channel_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nabot=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(limit) = cli.max_concurrency {
        config.max_concurrency = Some(limit);
    }
    if let Some(capacity) = cli.channel_capacity {
        config.channel_capacity = capacity;
    }
    ensure!(config.channel_capacity > 0, "channel capacity must be at least 1");
    ensure!(
        config.max_concurrency != Some(0),
        "max concurrency must be at least 1"
    );
    tracing::info!(?config, "Starting quizbot");

    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(console::print_replies(reply_rx));

    let app = quiz::build_app(
        Arc::new(ConsoleBot::new(reply_tx)),
        AppConfig {
            max_concurrent_updates: config.max_concurrency,
        },
    );

    let (update_tx, update_rx) = mpsc::channel(config.channel_capacity);
    let runner = {
        let app = app.clone();
        tokio::spawn(async move { app.run(update_rx).await })
    };

    let mut lines = console::spawn_line_reader(
        std::io::BufReader::new(std::io::stdin()),
        config.channel_capacity,
    )?;
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if update_tx.send(ConsoleUpdate::parse(&line)).await.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    // Closing the channel ends `run`; `stop` waits for in-flight updates
    drop(update_tx);
    runner.await?;
    app.stop().await;

    // Last bot handle goes with the app, which ends the printer
    drop(app);
    printer.await?;

    tracing::info!("Quizbot stopped");
    Ok(())
}
