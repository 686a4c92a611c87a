#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::Parser;
use futures::StreamExt;
use log::{error, info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use collaboraid_chat::{
    config::ClientConfig,
    credentials::{CredentialProvider, SessionCredentials},
    messaging::MessagingService,
    models::{DeliveryStatus, Message},
    stomp::StompClient,
};

/// Command line arguments for the CollaborAid chat client
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Command-line client for CollaborAid realtime chat.",
    long_about = "Connects to the CollaborAid STOMP broker and lets you exchange messages.\n\n\
    Type `<receiver id> <message>` to send, `/connect` to reconnect, \
    `/queue` to list unsent messages and `/quit` to leave."
)]
struct Args {
    /// Config file (defaults to config.json in the config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the WebSocket URL
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Prompts for whatever the environment does not provide
fn prompt_credentials() -> Result<(String, i64, String)> {
    let token = env::var("COLLABORAID_TOKEN").or_else(|_| {
        eprintln!("Enter auth token:");
        utils::read_line()
    })?;

    let user_id = match env::var("COLLABORAID_USER_ID") {
        Ok(id) => id,
        Err(_) => {
            eprintln!("Enter your user id:");
            utils::read_line()?
        }
    };
    let user_id = user_id
        .trim()
        .parse::<i64>()
        .map_err(|e| anyhow!("Invalid user id '{}': {}", user_id, e))?;

    let username = env::var("COLLABORAID_USERNAME").or_else(|_| {
        eprintln!("Enter username:");
        utils::read_line()
    })?;

    Ok((token.trim().to_string(), user_id, username.trim().to_string()))
}

fn load_session() -> Result<SessionCredentials> {
    let session = SessionCredentials::load_default()?;

    let from_env = env::var("COLLABORAID_TOKEN").is_ok() && env::var("COLLABORAID_USER_ID").is_ok();
    if session.is_complete() && !from_env {
        info!(
            "Using cached credentials for {}",
            session.username().unwrap_or_default()
        );
        return Ok(session);
    }

    let (token, user_id, username) = prompt_credentials()?;
    session.set(&token, user_id, &username)?;
    Ok(session)
}

fn render(message: &Message) -> String {
    let status = match message.delivery_status {
        DeliveryStatus::Sending => "…",
        DeliveryStatus::Sent => "✓",
        DeliveryStatus::Delivered => "✓✓",
        DeliveryStatus::Read => "✓✓ read",
        DeliveryStatus::Failed => "failed",
        DeliveryStatus::Queued => "queued",
    };
    format!(
        "[{}] {} -> {}: {} ({})",
        message.timestamp, message.sender_username, message.receiver_id, message.content, status
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let log_file = args.log_file.as_ref().and_then(|path| path.to_str());
    utils::setup_logging(log_file, level)?;
    info!("CollaborAid chat client starting up");
    info!("System information: {} {}", env::consts::OS, env::consts::ARCH);

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(url) = args.url {
        config.url = url;
        config.validate()?;
    }

    let credentials = Arc::new(load_session()?);
    let user_id = credentials
        .user_id()
        .ok_or_else(|| anyhow!("No user id available"))?;

    println!("Connecting to {} ... please wait...\n", config.url);
    let client = StompClient::with_websocket(config, credentials);
    let service = MessagingService::new(client);

    let mut messages = service.message_updates();
    tokio::spawn(async move {
        while let Some(message) = messages.next().await {
            println!("{}", render(&message));
        }
    });

    let mut status = service.connection_status();
    tokio::spawn(async move {
        while let Some(connected) = status.next().await {
            if connected {
                println!("* connected");
            } else {
                println!("* disconnected");
            }
        }
    });

    if !service.connect().await {
        warn!("Initial connection failed");
        eprintln!("Could not connect; messages will be queued. Type /connect to retry.");
    }
    println!("Logged in as user {}. Type `<receiver id> <message>` to send.", user_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/connect" => {
                if service.connect().await {
                    println!("* connected");
                } else {
                    println!("* connection failed");
                }
            }
            "/queue" => {
                for item in service.queued().await {
                    println!("  -> {}: {}", item.receiver_id, item.content);
                }
            }
            _ => {
                let Some((receiver, content)) = line.split_once(' ') else {
                    eprintln!("Usage: <receiver id> <message>");
                    continue;
                };
                match receiver.parse::<i64>() {
                    Ok(receiver_id) => {
                        if !service.send_message(receiver_id, content.trim()).await {
                            info!("Message to {} not sent yet", receiver_id);
                        }
                    }
                    Err(e) => {
                        error!("Invalid receiver id '{}': {}", receiver, e);
                        eprintln!("Invalid receiver id: {}", receiver);
                    }
                }
            }
        }
    }

    service.disconnect().await;
    println!("Chat session ended.");
    Ok(())
}
