//! Configuration loading from `.env` files.

use std::{env, time::Duration};

use anyhow::{anyhow, Context, Result};

use crate::{
    event::Kinds,
    gift_wrap::{Envelope, TIMESTAMP_WINDOW_SECS},
    keys::Keys,
    pool::PoolConfig,
    relay::{Backoff, LinkConfig, RelayOptions, DEFAULT_MAX_QUEUE},
};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Hex secret key of the local identity, if configured.
    pub secret_key: Option<String>,
    /// Relays with their read/write capabilities.
    pub relays: Vec<(String, RelayOptions)>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max_attempts: u32,
    /// Publishes buffered per link while it is not open.
    pub max_queued_events: usize,
    pub fetch_timeout: Duration,
    pub eose_quorum: usize,
    /// Verify ids and signatures of inbound events.
    pub verify_sig: bool,
    /// Half-width of the seal/wrap timestamp window; `0` disables it.
    pub timestamp_jitter_secs: u64,
    pub kinds: Kinds,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let secret_key = env::var("SECRET_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(sk) = &secret_key {
            Keys::from_secret_hex(sk).context("SECRET_KEY is not a valid secret key")?;
        }

        let mut relays = Vec::new();
        let mut add = |var: &str, read: bool, write: bool| {
            for url in csv_strings(env::var(var).unwrap_or_default()) {
                relays.push((url, RelayOptions { read, write }));
            }
        };
        add("RELAYS", true, true);
        add("RELAYS_READ", true, false);
        add("RELAYS_WRITE", false, true);

        let defaults = Kinds::default();
        Ok(Self {
            secret_key,
            relays,
            tor_socks: env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty()),
            connect_timeout: Duration::from_secs(num("CONNECT_TIMEOUT_SECS", 10)),
            reconnect_base: Duration::from_millis(num("RECONNECT_BASE_MS", 1000)),
            reconnect_max_attempts: num("RECONNECT_MAX_ATTEMPTS", 8),
            max_queued_events: num("MAX_QUEUED_EVENTS", DEFAULT_MAX_QUEUE),
            fetch_timeout: Duration::from_secs(num("FETCH_TIMEOUT_SECS", 8)),
            eose_quorum: num("FETCH_EOSE_QUORUM", 2),
            verify_sig: env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) != "0",
            timestamp_jitter_secs: num("TIMESTAMP_JITTER_SECS", TIMESTAMP_WINDOW_SECS),
            kinds: Kinds {
                seal: num("KIND_SEAL", defaults.seal),
                gift_wrap: num("KIND_GIFT_WRAP", defaults.gift_wrap),
                private_dm: num("KIND_PRIVATE_DM", defaults.private_dm),
                channel_create: num("KIND_CHANNEL_CREATE", defaults.channel_create),
                channel_message: num("KIND_CHANNEL_MESSAGE", defaults.channel_message),
            },
        })
    }

    /// The configured identity.
    pub fn keys(&self) -> Result<Keys> {
        let sk = self
            .secret_key
            .as_deref()
            .ok_or_else(|| anyhow!("SECRET_KEY is not set (run `sealr keygen`)"))?;
        Ok(Keys::from_secret_hex(sk)?)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            relays: self.relays.clone(),
            link: LinkConfig {
                connect_timeout: self.connect_timeout,
                backoff: Backoff {
                    base_delay: self.reconnect_base,
                    max_attempts: self.reconnect_max_attempts,
                },
                proxy: self.tor_socks.clone(),
                max_queue: self.max_queued_events,
            },
            fetch_timeout: self.fetch_timeout,
            eose_quorum: self.eose_quorum,
            verify_events: self.verify_sig,
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.kinds, self.timestamp_jitter_secs)
    }
}

/// Parse a numeric variable, falling back to `default` when absent or invalid.
fn num<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
