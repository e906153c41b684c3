//! Tidewire CLI
//!
//! Drives two in-process peers over a simulated lossy link and reports how
//! the delivery layer coped.

use clap::{Parser, Subcommand};
use console::{style, Emoji};
use indicatif::{ProgressBar, ProgressStyle};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidewire_core::PeerAddress;
use tidewire_crypto::identity::IdentityKeyPair;
use tidewire_crypto::x3dh::PreKeyManager;
use tidewire_protocol::prelude::*;

mod config;

use config::CliConfig;

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
static SEND: Emoji<'_, '_> = Emoji("📤 ", "[SEND] ");
static KEY: Emoji<'_, '_> = Emoji("🔑 ", "[KEY] ");

/// Tidewire - encrypted delivery over unreliable links
#[derive(Parser)]
#[command(name = "tidewire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send messages between two simulated peers
    Simulate {
        /// Messages to send
        #[arg(short, long)]
        messages: Option<usize>,

        /// Body size in bytes
        #[arg(short, long)]
        size: Option<usize>,

        /// Frame loss probability
        #[arg(long)]
        loss: Option<f64>,

        /// Frame duplication probability
        #[arg(long)]
        duplicate: Option<f64>,

        /// Frame reordering probability
        #[arg(long)]
        reorder: Option<f64>,

        /// Seed for the network impairments
        #[arg(long)]
        seed: Option<u64>,

        /// Ack timeout in seconds
        #[arg(long)]
        ack_timeout: Option<u64>,
    },

    /// Generate an identity and pre-keys
    Keys {
        /// One-time pre-keys to generate
        #[arg(short, long, default_value = "100")]
        prekeys: usize,

        /// Write the publishable bundle as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Print built-in defaults instead
        #[arg(short, long)]
        defaults: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let config_path = cli.config.unwrap_or_else(CliConfig::default_path);
    let mut config = CliConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Simulate {
            messages,
            size,
            loss,
            duplicate,
            reorder,
            seed,
            ack_timeout,
        } => {
            if let Some(messages) = messages {
                config.traffic.messages = messages;
            }
            if let Some(size) = size {
                config.traffic.message_size = size;
            }
            if let Some(loss) = loss {
                config.network.loss = loss;
            }
            if let Some(duplicate) = duplicate {
                config.network.duplicate = duplicate;
            }
            if let Some(reorder) = reorder {
                config.network.reorder = reorder;
            }
            if seed.is_some() {
                config.network.seed = seed;
            }
            if let Some(secs) = ack_timeout {
                config.protocol.delivery.ack_timeout_secs = secs;
            }
            config.validate().map_err(|e| anyhow::anyhow!(e))?;
            simulate(config).await?;
        }
        Commands::Keys { prekeys, output } => {
            generate_keys(prekeys, output)?;
        }
        Commands::Config { defaults } => {
            let shown = if defaults { CliConfig::default() } else { config };
            print!("{}", toml::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

#[derive(Debug, Default)]
struct Summary {
    sent: usize,
    send_errors: usize,
    delivered: usize,
    failed: usize,
    read: usize,
    received: usize,
    session_resets: usize,
    queue_expired: usize,
}

struct Peer {
    address: PeerAddress,
    sessions: Arc<SessionManager>,
}

async fn peer(
    address: PeerAddress,
    directory: &Arc<dyn PreKeyDirectory>,
    config: &CliConfig,
) -> anyhow::Result<Peer> {
    let sessions = Arc::new(SessionManager::new(
        address.clone(),
        IdentityKeyPair::generate(),
        directory.clone(),
        config.protocol.session.clone(),
    ));
    sessions.publish_prekeys(10).await?;
    Ok(Peer { address, sessions })
}

async fn open_link(
    local: &Peer,
    remote: &Peer,
    network: &Arc<MemoryNetwork>,
    config: &CliConfig,
) -> anyhow::Result<(PeerLink, mpsc::Receiver<LinkEvent>)> {
    let (link, events) = PeerLink::spawn(
        remote.address.clone(),
        local.sessions.clone(),
        Arc::new(network.connector(local.address.clone())),
        Arc::new(ReceiptTracker::new()),
        OfflineQueue::new(),
        config.protocol.clone(),
    )?;
    link.connect().await?;
    Ok((link, events))
}

async fn simulate(config: CliConfig) -> anyhow::Result<()> {
    let network = match config.network.seed {
        Some(seed) => MemoryNetwork::with_seed(LinkProfile::perfect(), seed),
        None => MemoryNetwork::new(LinkProfile::perfect()),
    };
    let directory: Arc<dyn PreKeyDirectory> = Arc::new(MemoryDirectory::new());

    let alice = peer(PeerAddress::new("alice", "phone"), &directory, &config).await?;
    let bob = peer(PeerAddress::new("bob", "laptop"), &directory, &config).await?;
    let (alice_link, mut alice_events) = open_link(&alice, &bob, &network, &config).await?;
    let (bob_link, bob_events) = open_link(&bob, &alice, &network, &config).await?;

    let connect_budget = config.protocol.connection.connect_timeout() * 2;
    for link in [&alice_link, &bob_link] {
        timeout(
            connect_budget,
            link.supervisor().wait_for(ConnectionState::Connected),
        )
        .await
        .map_err(|_| anyhow::anyhow!("{} did not connect", link.peer()))??;
    }
    network.set_profile(config.network.profile());
    info!("Simulated link: {:?}", config.network.profile());

    let (stop_tx, stop_rx) = oneshot::channel();
    let receiver = tokio::spawn(run_receiver(
        bob_link,
        bob_events,
        config.traffic.read_receipts,
        stop_rx,
    ));

    let total = config.traffic.messages;
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_message("sending");

    let started = Instant::now();
    let mut summary = Summary::default();
    let mut rng = rand::thread_rng();
    for _ in 0..total {
        let mut body = vec![0u8; config.traffic.message_size];
        rng.fill_bytes(&mut body);
        match alice_link.send_message(body).await {
            Ok(_) => summary.sent += 1,
            Err(err) => {
                warn!("Send failed: {}", err);
                summary.send_errors += 1;
                pb.inc(1);
            }
        }
    }
    pb.set_message("awaiting acks");

    let deadline = Instant::now()
        + config.protocol.delivery.delivery_deadline()
        + config.protocol.fragment.reassembly_timeout() * 2;
    let wait_for_reads = config.traffic.read_receipts && config.protocol.delivery.enable_acks;
    loop {
        let settled = summary.delivered + summary.failed >= summary.sent;
        let reads_done = !wait_for_reads || summary.read + summary.failed >= summary.sent;
        if settled && reads_done {
            break;
        }

        let event = match timeout_at(deadline, alice_events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        match event {
            LinkEvent::Delivered { .. } => {
                summary.delivered += 1;
                pb.inc(1);
            }
            LinkEvent::DeliveryFailed { error, .. } => {
                warn!("{}", error);
                summary.failed += 1;
                pb.inc(1);
            }
            LinkEvent::Receipt {
                kind: ReceiptKind::Read,
                ..
            } => summary.read += 1,
            LinkEvent::SessionReset { .. } => summary.session_resets += 1,
            LinkEvent::QueueExpired { count, .. } => summary.queue_expired += count,
            LinkEvent::Error(err) => warn!("{}", err),
            _ => {}
        }
        if !config.protocol.delivery.enable_acks && summary.sent + summary.send_errors >= total {
            break;
        }
    }
    pb.finish_with_message("done");
    let elapsed = started.elapsed();

    let _ = stop_tx.send(());
    summary.received = receiver.await??;
    alice_link.shutdown().await?;

    print_summary(&summary, &network.stats(), elapsed, &config);
    Ok(())
}

/// Plays the second peer: counts messages and answers with READ receipts
async fn run_receiver(
    link: PeerLink,
    mut events: mpsc::Receiver<LinkEvent>,
    read_receipts: bool,
    mut stop: oneshot::Receiver<()>,
) -> anyhow::Result<usize> {
    let mut received = 0;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(LinkEvent::Message { id, .. }) => {
                    received += 1;
                    if read_receipts {
                        if let Err(err) = link.send_receipt(id, ReceiptKind::Read).await {
                            warn!("Receipt for {} not sent: {}", id, err);
                        }
                    }
                }
                Some(LinkEvent::Error(err)) => warn!("Receiver: {}", err),
                Some(_) => {}
                None => break,
            },
        }
    }
    link.shutdown().await?;
    Ok(received)
}

fn print_summary(
    summary: &Summary,
    stats: &tidewire_protocol::transport::NetworkStats,
    elapsed: Duration,
    config: &CliConfig,
) {
    let mark = if summary.failed == 0 && summary.send_errors == 0 {
        CHECK
    } else {
        CROSS
    };

    println!();
    println!(
        "{}{} messages of {} bytes in {:.1?}",
        SEND,
        style(summary.sent).bold(),
        config.traffic.message_size,
        elapsed
    );
    println!(
        "  loss {:.0}%  duplicate {:.0}%  reorder {:.0}%",
        config.network.loss * 100.0,
        config.network.duplicate * 100.0,
        config.network.reorder * 100.0
    );
    println!();
    println!("{}Delivered:      {}", mark, style(summary.delivered).green());
    println!("  Failed:         {}", style(summary.failed).red());
    println!("  Received:       {}", summary.received);
    println!("  Read receipts:  {}", summary.read);
    if summary.send_errors > 0 {
        println!("  Send errors:    {}", style(summary.send_errors).red());
    }
    if summary.session_resets > 0 {
        println!("  Session resets: {}", summary.session_resets);
    }
    if summary.queue_expired > 0 {
        println!("  Queue expired:  {}", summary.queue_expired);
    }
    println!();
    println!(
        "{}",
        style(format!(
            "frames delivered {}  dropped {}  duplicated {}  delayed {}",
            stats.delivered, stats.dropped, stats.duplicated, stats.delayed
        ))
        .dim()
    );
}

fn generate_keys(prekeys: usize, output: Option<PathBuf>) -> anyhow::Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message("Generating identity and pre-keys...");
    pb.enable_steady_tick(Duration::from_millis(100));

    let identity = IdentityKeyPair::generate();
    let fingerprint = identity.public_key().fingerprint_hex();
    let mut manager = PreKeyManager::new(identity);
    manager.generate_one_time_prekeys(prekeys);
    let upload = manager.upload();

    pb.finish_and_clear();

    println!("{}Identity generated", CHECK);
    println!("  {}Fingerprint: {}", KEY, style(&fingerprint[..32]).yellow());
    println!("  {}One-time pre-keys: {}", KEY, upload.one_time_prekeys.len());

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_string_pretty(&upload)?)?;
        println!("  Bundle written to {}", style(path.display()).cyan());
    }
    Ok(())
}
