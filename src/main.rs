use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::broker::Connector;
use crate::config::{AppConfig, BrokerKind};

mod amqp;
mod broker;
mod classifier;
mod config;
mod messages;
mod mqtt;
mod simulator;
mod worker;

/// Classifies attendance from RSSI measurements on a message queue.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume measurements and publish attendance results (default)
    Run,
    /// Publish sample measurements to the inbound queue
    Simulate {
        #[arg(long, default_value_t = 5)]
        interval_seconds: u64,
        #[arg(long, default_value_t = -65.0, allow_negative_numbers = true)]
        rssi: f64,
        /// Stop after this many messages
        #[arg(long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Error listening for shutdown signal: {}", err);
        }
        info!("Received shutdown signal");
        signal_token.cancel();
    });

    let command = cli.command.unwrap_or(Command::Run);
    match config.broker.kind {
        BrokerKind::Amqp => {
            let connector = amqp::AmqpConnector::new(&config.broker);
            dispatch(command, &config, &connector, shutdown).await
        }
        BrokerKind::Mqtt => {
            let connector = mqtt::MqttConnector::new(&config.broker);
            dispatch(command, &config, &connector, shutdown).await
        }
    }
}

async fn dispatch<C: Connector>(
    command: Command,
    config: &AppConfig,
    connector: &C,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Run => {
            let worker = worker::Worker::new(&config.worker());
            worker.run(connector, shutdown).await
        }
        Command::Simulate {
            interval_seconds,
            rssi,
            count,
        } => {
            let simulator = simulator::Simulator {
                rssi,
                interval: Duration::from_secs(interval_seconds),
                count,
            };
            let sent = simulator.run(connector, shutdown).await?;
            info!("Sent {} simulated measurements", sent);
            Ok(())
        }
    }
}
