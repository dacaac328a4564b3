//! CLI for pubsub-relay
//!
//! Subcommands:
//! - `server`: run the relay
//! - `publish`: send payloads to a topic of a running relay
//! - `subscribe`: print everything published on one or more topics

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use pubsub_relay::broker::Broker;
use pubsub_relay::client::{Publisher, Subscriber};
use pubsub_relay::config::{Settings, load_config};
use pubsub_relay::transport::start_websocket_server;
use pubsub_relay::utils::{Result, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pubsub-relay", version, about)]
enum Command {
    /// Start the relay server
    Server,
    /// Publish each payload as one message, then disconnect
    Publish {
        /// Relay URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Topic to publish on; it must already have been subscribed to
        #[arg(long)]
        topic: String,
        /// Payloads to send, in order
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Print messages from one or more topics until the relay disconnects
    Subscribe {
        /// Relay URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Topic to subscribe to (repeatable)
        #[arg(long, required = true)]
        topic: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level);

    let outcome = match cmd {
        Command::Server => run_server(settings).await,
        Command::Publish { url, topic, payloads } => run_publish(&url, &topic, payloads).await,
        Command::Subscribe { url, topic } => run_subscribe(&url, &topic).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<()> {
    let addr = settings.server.addr();
    let broker = Arc::new(Broker::new(&settings.broker));

    tokio::select! {
        result = start_websocket_server(addr, broker, settings.broker) => {
            error!("WebSocket server exited unexpectedly.");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    }
}

async fn run_publish(url: &str, topic: &str, payloads: Vec<String>) -> Result<()> {
    let mut publisher = Publisher::connect(url, topic).await?;
    for payload in payloads {
        publisher.publish(payload).await?;
    }
    info!(topic, "published");
    publisher.close().await
}

async fn run_subscribe(url: &str, topics: &[String]) -> Result<()> {
    let mut subscriber = Subscriber::connect(url, topics).await?;
    info!(?topics, "subscribed");

    while let Some(envelope) = subscriber.next_envelope().await {
        let envelope = envelope?;
        println!(
            "{}: {}",
            envelope.topic,
            String::from_utf8_lossy(&envelope.payload)
        );
    }
    Ok(())
}
