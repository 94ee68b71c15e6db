//! `stomp-listen`: subscribe to destinations and print what arrives.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stomp_websocket::frame::headers;
use stomp_websocket::{ClientConfig, Command, StompClient, Subscription};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser, Debug)]
#[command(name = "stomp-listen")]
#[command(version = VERSION)]
#[command(about = "Print messages from STOMP destinations over SockJS WebSocket")]
struct Cli {
    /// Base endpoint URL, e.g. wss://broker.example.com/stomp
    #[arg(long)]
    url: String,
    /// Destination to subscribe to (repeatable)
    #[arg(long = "topic", required = true)]
    topics: Vec<String>,
    /// Bearer token; also sets Host and Origin
    #[arg(long)]
    token: Option<String>,
    /// Extra request header as key:value (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let Some((key, value)) = raw.split_once(':') else {
        return Err(format!("expected key:value, got '{raw}'"));
    };
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ClientConfig::load_from_file(path)?,
        None => {
            let mut config = ClientConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    let mut builder = StompClient::builder(&cli.url).config(config);
    for (key, value) in &cli.headers {
        builder = builder.header(key, value);
    }
    if let Some(token) = &cli.token {
        builder = builder.bearer_token(token);
    }
    let client = builder
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", cli.url))?;

    let mut printers = Vec::with_capacity(cli.topics.len());
    for topic in &cli.topics {
        let subscription = client
            .subscribe(topic)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
        printers.push(tokio::spawn(print_messages(subscription)));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log::info!("Interrupted, disconnecting");

    if let Err(e) = client.disconnect().await {
        log::warn!("Disconnect failed: {e}");
        client.close();
    }
    for printer in printers {
        if let Err(e) = printer.await {
            log::warn!("Printer task failed: {e}");
        }
    }
    Ok(())
}

async fn print_messages(mut subscription: Subscription) {
    while let Some(frame) = subscription.recv().await {
        match frame.command {
            Command::Message => {
                let destination = frame
                    .contains(headers::DESTINATION)
                    .unwrap_or(subscription.topic());
                println!("{destination}: {}", frame.body);
            }
            Command::Error => {
                log::error!("{}: {}", subscription.topic(), frame.error_message());
            }
            _ => {}
        }
    }
    log::debug!("Subscription {} closed", subscription.id());
}
