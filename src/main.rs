//! Command line interface for private messaging over Nostr relays. Supports
//! key generation, offline payload encryption, gift-wrapped direct and group
//! messages, public channels and relay list management.

use std::{fs, path::Path};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sealr::{
    config::{csv_strings, Settings},
    messaging::ChannelMetadata,
    nip44,
    relay::connect_ws,
    Channels, DirectMessages, GroupMessages, Keys, RelayPool, UnwrappedMessage,
};
use tracing::warn;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "sealr",
    author,
    version,
    about = "Gift-wrapped private messaging over Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print a fresh secret/public key pair.
    Keygen,
    /// Print the public key of `SECRET_KEY`.
    Pubkey,
    /// Encrypt text for a peer without touching the network.
    Encrypt {
        #[arg(long)]
        peer: String,
        text: String,
    },
    /// Decrypt a payload from a peer.
    Decrypt {
        #[arg(long)]
        peer: String,
        payload: String,
    },
    /// Send a gift-wrapped direct message.
    Send {
        #[arg(long)]
        to: String,
        text: String,
    },
    /// Print received direct messages, oldest first.
    Inbox,
    /// Print direct messages as they arrive until interrupted.
    Listen,
    /// Send one message to a small group.
    GroupSend {
        /// Member public key; repeat for each member.
        #[arg(long = "member", required = true)]
        members: Vec<String>,
        text: String,
    },
    /// Create a public channel and print its id.
    ChannelCreate {
        name: String,
        #[arg(long, default_value = "")]
        about: String,
    },
    /// Post to a public channel.
    ChannelPost {
        #[arg(long)]
        channel: String,
        text: String,
    },
    /// Print a public channel's messages.
    ChannelRead {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Manage the relay list.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
}

/// Operations available under `sealr relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a read/write relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from `RELAYS`.
    Remove { url: String },
    /// Connect to every relay and print its state.
    Status,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Keygen => {
            let keys = Keys::generate();
            println!("secret: {}", keys.secret_key_hex());
            println!("public: {}", keys.public_key_hex());
        }
        Commands::Pubkey => println!("{}", cfg.keys()?.public_key_hex()),
        Commands::Encrypt { peer, text } => {
            let key = cfg.keys()?.conversation_key(&peer)?;
            println!("{}", nip44::encrypt(text.as_bytes(), &key)?);
        }
        Commands::Decrypt { peer, payload } => {
            let key = cfg.keys()?.conversation_key(&peer)?;
            let plain = nip44::decrypt(payload.trim(), &key)?;
            println!("{}", String::from_utf8(plain).context("plaintext is not utf-8")?);
        }
        Commands::Relay { action } => handle_relay(action, &cli.env, &cfg).await?,
        command => {
            let keys = cfg.keys()?;
            let pool = connect(&cfg).await;
            let result = handle_network(command, &cfg, &keys, &pool).await;
            pool.shutdown();
            result?;
        }
    }
    Ok(())
}

async fn handle_network(
    command: Commands,
    cfg: &Settings,
    keys: &Keys,
    pool: &RelayPool,
) -> anyhow::Result<()> {
    let envelope = cfg.envelope();
    match command {
        Commands::Send { to, text } => {
            let dms = DirectMessages::new(pool.clone(), envelope);
            let delivery = dms.send(keys, &to, &text).await?;
            report(&delivery.rumor.id, delivery.accepted(), delivery.acks.len());
        }
        Commands::Inbox => {
            let dms = DirectMessages::new(pool.clone(), envelope);
            for msg in dms.inbox(keys).await? {
                print_message(&msg);
            }
        }
        Commands::Listen => {
            let dms = DirectMessages::new(pool.clone(), envelope);
            let mut inbox = dms.listen(keys)?;
            loop {
                tokio::select! {
                    msg = inbox.next() => match msg {
                        Some(msg) => print_message(&msg),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::GroupSend { members, text } => {
            let groups = GroupMessages::new(pool.clone(), envelope);
            let delivery = groups.send(keys, &members, &text).await?;
            report(&delivery.rumor.id, delivery.accepted(), delivery.acks.len());
        }
        Commands::ChannelCreate { name, about } => {
            let channels = Channels::new(pool.clone(), envelope);
            let meta = ChannelMetadata {
                name,
                about,
                ..Default::default()
            };
            let (ev, acks) = channels.create_and_wait(keys, &meta).await?;
            report(ev.id(), acks.iter().filter(|a| a.accepted).count(), acks.len());
        }
        Commands::ChannelPost { channel, text } => {
            let channels = Channels::new(pool.clone(), envelope);
            let (ev, acks) = channels.post_and_wait(keys, &channel, &text).await?;
            report(ev.id(), acks.iter().filter(|a| a.accepted).count(), acks.len());
        }
        Commands::ChannelRead { channel, limit } => {
            let channels = Channels::new(pool.clone(), envelope);
            for ev in channels.history(&channel, limit).await? {
                println!("{} {} {}", ev.created_at(), ev.pubkey(), ev.content());
            }
        }
        Commands::Keygen
        | Commands::Pubkey
        | Commands::Encrypt { .. }
        | Commands::Decrypt { .. }
        | Commands::Relay { .. } => unreachable!(),
    }
    Ok(())
}

/// Build the pool and give it one connect timeout to open a link.
async fn connect(cfg: &Settings) -> RelayPool {
    let pool = RelayPool::new(cfg.pool_config());
    if !pool.wait_connected(cfg.connect_timeout).await {
        warn!("no relay connected yet; messages stay queued");
    }
    pool
}

/// Print how many relay acknowledgments were positive.
fn report(id: &str, accepted: usize, answered: usize) {
    println!("{id} accepted {accepted}/{answered}");
}

fn print_message(msg: &UnwrappedMessage) {
    println!("{} {} {}", msg.rumor.created_at, msg.sender, msg.rumor.content);
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("SECRET_KEY=\n");
    content.push_str("RELAYS=\n");
    content.push_str("RELAYS_READ=\n");
    content.push_str("RELAYS_WRITE=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("CONNECT_TIMEOUT_SECS=10\n");
    content.push_str("FETCH_TIMEOUT_SECS=8\n");
    content.push_str("FETCH_EOSE_QUORUM=2\n");
    content.push_str("VERIFY_SIG=1\n");
    fs::write(env_path, content)?;
    Ok(())
}

async fn handle_relay(action: RelayAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => add_relay(env_path, cfg, url).await?,
        RelayAction::Remove { url } => remove_relay(env_path, url)?,
        RelayAction::Status => {
            let pool = connect(cfg).await;
            for (url, status) in pool.status() {
                println!("{url} {:?} attempts={}", status.state, status.attempts);
            }
            pool.shutdown();
        }
    }
    Ok(())
}

async fn add_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays.iter().any(|(existing, _)| existing == &url) {
        bail!("relay already configured: {url}");
    }
    tokio::time::timeout(
        cfg.connect_timeout,
        connect_ws(&url, cfg.tor_socks.as_deref()),
    )
    .await
    .map_err(|_| sealr::Error::ConnectionTimeout)?
    .with_context(|| format!("connecting to {url}"))?;
    let mut relays = current_relays(env_path)?;
    relays.push(url);
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn remove_relay(env_path: &str, url: String) -> anyhow::Result<()> {
    let mut relays = current_relays(env_path)?;
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("relay not configured in RELAYS: {url}");
    }
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

/// Read `RELAYS` straight from the file; the process env may be stale.
fn current_relays(env_path: &str) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(env_path)?;
    Ok(content
        .lines()
        .find_map(|line| line.strip_prefix("RELAYS="))
        .map(csv_strings)
        .unwrap_or_default())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS=") {
            new_content.push_str(&format!("RELAYS={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sealr=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
