use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

mod utils;

use switchboard::config::{self, GatewayConfig};
use switchboard::inbox::{HistoryOutcome, Inbox, InboxError, PairingSession};
use switchboard::models::{Conversation, Direction, GatewayInstance};

/// Command line arguments for switchboard
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "switchboard: one inbox for conversations across several messaging-gateway instances."
)]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save gateway URL and API key to the config file
    Configure {
        #[arg(long)]
        url: String,
        #[arg(long)]
        api_key: String,
    },
    /// List gateway instances and their status
    Instances,
    /// Create an instance and print its pairing QR
    Create {
        name: String,
        /// Wait until the QR is scanned or pairing times out
        #[arg(long)]
        wait: bool,
    },
    /// Request a fresh pairing QR for an instance
    Qr {
        name: String,
        #[arg(long)]
        wait: bool,
    },
    /// Delete an instance from the gateway
    Delete { name: String },
    /// Sync conversations from all connected instances
    Sync,
    /// Show the recent messages of a conversation
    History { conversation: String },
    /// Send a text message to a conversation
    Send { conversation: String, text: String },
    /// Keep polling and print instance and conversation changes
    Watch,
}

fn print_instances(instances: &[GatewayInstance]) {
    if instances.is_empty() {
        println!("No instances.");
        return;
    }
    for instance in instances {
        println!(
            "{:<24} {:<13} {}",
            instance.name,
            instance.status.to_string(),
            instance.phone_number.as_deref().unwrap_or("-")
        );
    }
}

fn print_conversations(conversations: &[Conversation]) {
    for c in conversations {
        let unread = if c.unread_count > 0 { format!(" ({} unread)", c.unread_count) } else { String::new() };
        let group = if c.is_group { " [group]" } else { "" };
        println!(
            "{:<20} {:<24} via {:<16} {:?}{}{}  {}",
            c.id, c.contact_name, c.owner_instance, c.pipeline_status, group, unread, c.last_message_preview
        );
    }
}

fn print_pairing(session: &PairingSession) {
    println!("{}: {}", session.instance, session.state);
    if let Some(ticket) = &session.ticket {
        if let Some(code) = &ticket.pairing_code {
            println!("Pairing code: {}", code);
        }
        if let Some(qr) = &ticket.qr_code {
            println!("QR payload: {}", qr);
        }
    }
}

/// Sync and explain the three failure cases separately.
async fn sync_and_report(inbox: &Inbox) -> Result<()> {
    match inbox.sync().await {
        Ok(report) => {
            println!("{}", report.summary());
            for failure in &report.failed {
                eprintln!("  failed: {}", failure);
            }
            Ok(())
        }
        Err(InboxError::NoConnectedInstances) => {
            Err(anyhow!("No connected instances. Pair one with `switchboard create <name>`."))
        }
        Err(InboxError::AllInstancesFailed { failed }) => {
            for failure in &failed {
                eprintln!("  failed: {}", failure);
            }
            Err(anyhow!("Network degraded: none of the {} connected instances could be synced", failed.len()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn pair(inbox: &Inbox, session: PairingSession, wait: bool) -> Result<()> {
    print_pairing(&session);
    if wait && !session.state.is_terminal() {
        inbox.start_polling();
        println!("Waiting for the QR to be scanned...");
        let paired = inbox.wait_for_pairing(&session.instance).await?;
        print_pairing(&paired);
    }
    Ok(())
}

async fn run(command: Command, inbox: Arc<Inbox>) -> Result<()> {
    match command {
        // Handled in main before any gateway connection is made
        Command::Configure { .. } => {}
        Command::Instances => {
            let instances = inbox.refresh().await;
            let health = inbox.registry_health();
            if let Some(err) = health.last_error.filter(|_| health.consecutive_failures > 0) {
                return Err(anyhow!("Could not list instances: {}", err));
            }
            print_instances(&instances);
        }
        Command::Create { name, wait } => {
            let session = inbox.create_instance(&name).await?;
            pair(&inbox, session, wait).await?;
        }
        Command::Qr { name, wait } => {
            let session = inbox.request_qr(&name).await?;
            pair(&inbox, session, wait).await?;
        }
        Command::Delete { name } => {
            inbox.delete_instance(&name).await?;
            println!("Deleted {}", name);
        }
        Command::Sync => {
            sync_and_report(&inbox).await?;
            print_conversations(&inbox.conversations().await);
        }
        Command::History { conversation } => {
            sync_and_report(&inbox).await?;
            match inbox.load_history(&conversation).await? {
                HistoryOutcome::Loaded(messages) => {
                    for m in messages {
                        let arrow = match m.direction {
                            Direction::Outbound => ">>",
                            Direction::Inbound => "<<",
                        };
                        let when = chrono::DateTime::from_timestamp(m.sent_at as i64, 0)
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default();
                        println!("{} {} {} [{:?}]", when, arrow, m.text, m.delivery_status);
                    }
                }
                HistoryOutcome::Superseded { .. } => println!("History load was superseded."),
            }
        }
        Command::Send { conversation, text } => {
            sync_and_report(&inbox).await?;
            let message = inbox.send(&conversation, &text).await?;
            println!("Sent ({})", message.id);
        }
        Command::Watch => {
            inbox.start_polling();
            let mut instances_rx = inbox.subscribe_instances();
            let mut sync_ticker = tokio::time::interval(inbox.settings().poll_interval);
            loop {
                tokio::select! {
                    changed = instances_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = instances_rx.borrow_and_update().clone();
                        println!("-- instances --");
                        print_instances(&snapshot);
                    }
                    _ = sync_ticker.tick() => {
                        if let Err(e) = sync_and_report(&inbox).await {
                            eprintln!("{}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, stopping watch");
                        break;
                    }
                }
            }
            inbox.shutdown();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, level)?;

    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
    }

    if let Command::Configure { url, api_key } = &args.command {
        let mut existing = config::read_config(&config::get_config_path()?)?;
        let candidate = GatewayConfig::new(url, api_key);
        candidate.build_client()?;
        existing.base_url = candidate.base_url;
        existing.set_api_key(api_key);
        config::save_config(&existing)?;
        println!("Saved gateway configuration.");
        return Ok(());
    }

    let config = config::load_config()?;
    let client = config.build_client()?;
    info!("Using gateway at {}", client.base_url());
    let inbox = Arc::new(Inbox::new(Arc::new(client), config.inbox_settings()?));

    if let Err(e) = run(args.command, inbox).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
