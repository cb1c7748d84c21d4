//! Multiplexes publishes and subscriptions over a set of [`RelayLink`]s.
//!
//! The subscription table is the only state shared between callers and link
//! tasks. It sits behind a `std::sync::Mutex` that is never held across an
//! await; links read it when they (re)open and write into per-subscription
//! channels when frames arrive.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    message::RelayMessage,
    relay::{Inbound, LinkCommand, LinkConfig, LinkState, LinkStatus, RelayLink, RelayOptions},
};

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub relays: Vec<(String, RelayOptions)>,
    pub link: LinkConfig,
    /// Hard upper bound for [`RelayPool::fetch`].
    pub fetch_timeout: Duration,
    /// EOSE signals needed to finish a fetch early (capped at the number of
    /// read links).
    pub eose_quorum: usize,
    /// Drop inbound events whose id or signature does not check out.
    pub verify_events: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            link: LinkConfig::default(),
            fetch_timeout: Duration::from_secs(8),
            eose_quorum: 2,
            verify_events: true,
        }
    }
}

impl PoolConfig {
    pub fn relay(mut self, url: impl Into<String>, options: RelayOptions) -> Self {
        self.relays.push((url.into(), options));
        self
    }
}

/// Item yielded by a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event { relay: String, event: Event },
    /// The relay has sent all stored matches.
    Eose { relay: String },
    /// The relay refused or ended the subscription.
    Closed { relay: String, message: String },
}

/// Acknowledgment for a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub relay: String,
    pub accepted: bool,
    pub message: String,
}

struct SubEntry {
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<SubscriptionItem>,
    /// Shared with the [`Subscription`]; once set, buffered items are discarded.
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Table {
    subs: Mutex<HashMap<String, SubEntry>>,
    acks: Mutex<HashMap<String, mpsc::UnboundedSender<PublishAck>>>,
    verify_events: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Table {
    fn route(&self, id: &str, item: SubscriptionItem) {
        let tx = lock(&self.subs).get(id).map(|e| e.tx.clone());
        match tx {
            Some(tx) => {
                let _ = tx.send(item);
            }
            None => debug!(subscription = id, "dropping frame for unknown subscription"),
        }
    }
}

impl Inbound for Table {
    fn live_subscriptions(&self) -> Vec<(String, Vec<Filter>)> {
        lock(&self.subs)
            .iter()
            .map(|(id, e)| (id.clone(), e.filters.clone()))
            .collect()
    }

    fn deliver(&self, relay: &str, msg: RelayMessage) {
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if self.verify_events && !event.verify() {
                    warn!(relay, id = event.id(), "dropping event that fails verification");
                    return;
                }
                self.route(
                    &subscription_id,
                    SubscriptionItem::Event {
                        relay: relay.to_string(),
                        event: *event,
                    },
                );
            }
            RelayMessage::Eose(id) => self.route(
                &id,
                SubscriptionItem::Eose {
                    relay: relay.to_string(),
                },
            ),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                info!(relay, subscription = %subscription_id, "subscription closed: {message}");
                self.route(
                    &subscription_id,
                    SubscriptionItem::Closed {
                        relay: relay.to_string(),
                        message,
                    },
                );
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if accepted {
                    debug!(relay, id = %event_id, "event accepted");
                } else {
                    warn!(relay, id = %event_id, "event rejected: {message}");
                }
                if let Some(tx) = lock(&self.acks).get(&event_id) {
                    let _ = tx.send(PublishAck {
                        relay: relay.to_string(),
                        accepted,
                        message,
                    });
                }
            }
            RelayMessage::Notice(notice) => info!(relay, "notice: {notice}"),
        }
    }
}

struct PoolInner {
    table: Arc<Table>,
    links: Vec<RelayLink>,
    fetch_timeout: Duration,
    eose_quorum: usize,
    closed: AtomicBool,
}

impl PoolInner {
    fn links_for(&self, want: fn(RelayOptions) -> bool) -> impl Iterator<Item = &RelayLink> {
        self.links.iter().filter(move |l| want(l.options()))
    }

    /// Fail with `ConnectionClosed` if no link with the capability can make
    /// progress.
    /// Links with the capability that have not given up reconnecting.
    fn live_links(&self, want: fn(RelayOptions) -> bool) -> usize {
        self.links_for(want)
            .filter(|l| l.status().state != LinkState::Exhausted)
            .count()
    }

    fn ensure_usable(&self, want: fn(RelayOptions) -> bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if self.live_links(want) > 0 {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    fn remove_subscription(&self, id: &str) -> Result<()> {
        match lock(&self.table.subs).remove(id) {
            Some(entry) => entry.cancelled.store(true, Ordering::SeqCst),
            None => return Err(Error::SubscriptionNotFound(id.to_string())),
        }
        for link in self.links_for(|o| o.read) {
            link.send(LinkCommand::Close(id.to_string()));
        }
        Ok(())
    }
}

/// A set of relay links sharing one subscription table. Cheap to clone.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Spawn one link per configured relay. Must be called inside a Tokio
    /// runtime. Duplicate URLs are merged.
    pub fn new(config: PoolConfig) -> Self {
        let table = Arc::new(Table {
            verify_events: config.verify_events,
            ..Default::default()
        });
        let mut relays: Vec<(String, RelayOptions)> = Vec::new();
        for (url, opts) in config.relays {
            match relays.iter_mut().find(|(u, _)| *u == url) {
                Some((_, existing)) => {
                    existing.read |= opts.read;
                    existing.write |= opts.write;
                }
                None => relays.push((url, opts)),
            }
        }
        let links = relays
            .into_iter()
            .map(|(url, opts)| {
                let inbound: Arc<dyn Inbound> = table.clone();
                RelayLink::spawn(url, opts, config.link.clone(), inbound)
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                table,
                links,
                fetch_timeout: config.fetch_timeout,
                eose_quorum: config.eose_quorum,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Send `event` to every write link. Links that are not open queue it.
    pub fn publish(&self, event: &Event) -> Result<()> {
        self.inner.ensure_usable(|o| o.write)?;
        for link in self.inner.links_for(|o| o.write) {
            link.send(LinkCommand::Publish(event.clone()));
        }
        Ok(())
    }

    /// Publish and collect `OK` answers until every write link replied or
    /// `limit` elapsed. Missing answers are not an error.
    pub async fn publish_and_wait(&self, event: &Event, limit: Duration) -> Result<Vec<PublishAck>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.inner.table.acks).insert(event.id().to_string(), tx);
        if let Err(e) = self.publish(event) {
            lock(&self.inner.table.acks).remove(event.id());
            return Err(e);
        }
        let expected = self.inner.live_links(|o| o.write);
        let deadline = Instant::now() + limit;
        let mut acks: Vec<PublishAck> = Vec::new();
        while acks.len() < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ack)) => {
                    if !acks.iter().any(|a| a.relay == ack.relay) {
                        acks.push(ack);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        lock(&self.inner.table.acks).remove(event.id());
        Ok(acks)
    }

    /// Register a live subscription and send it to every read link.
    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<Subscription> {
        self.inner.ensure_usable(|o| o.read)?;
        let id = hex::encode(rand::random::<[u8; 8]>());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        lock(&self.inner.table.subs).insert(
            id.clone(),
            SubEntry {
                filters: filters.clone(),
                tx,
                cancelled: cancelled.clone(),
            },
        );
        for link in self.inner.links_for(|o| o.read) {
            link.send(LinkCommand::Subscribe {
                id: id.clone(),
                filters: filters.clone(),
            });
        }
        debug!(subscription = %id, "subscribed");
        Ok(Subscription {
            id,
            rx,
            cancelled,
            pool: self.inner.clone(),
        })
    }

    /// Remove a subscription and send `CLOSE` to every read link. Once this
    /// returns the handle yields nothing more, buffered frames included.
    pub fn unsubscribe(&self, id: &str) -> Result<()> {
        self.inner.remove_subscription(id)
    }

    /// One-shot query: events deduplicated by id, returned once enough
    /// relays sent EOSE or the fetch timeout elapsed.
    pub async fn fetch(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.fetch_with_timeout(filters, self.inner.fetch_timeout).await
    }

    pub async fn fetch_with_timeout(&self, filters: Vec<Filter>, limit: Duration) -> Result<Vec<Event>> {
        let mut sub = self.subscribe(filters)?;
        let readers = self.inner.live_links(|o| o.read);
        let quorum = self.inner.eose_quorum.min(readers).max(1);
        let deadline = Instant::now() + limit;

        let mut seen = HashSet::new();
        let mut done = HashSet::new();
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, sub.recv()).await {
                Ok(Some(SubscriptionItem::Event { event, .. })) => {
                    if seen.insert(event.id().to_string()) {
                        events.push(event);
                    }
                }
                Ok(Some(SubscriptionItem::Eose { relay }))
                | Ok(Some(SubscriptionItem::Closed { relay, .. })) => {
                    done.insert(relay);
                    if done.len() >= quorum {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(collected = events.len(), "fetch timed out");
                    break;
                }
            }
        }
        Ok(events)
    }

    /// Per-relay state snapshot.
    pub fn status(&self) -> Vec<(String, LinkStatus)> {
        self.inner
            .links
            .iter()
            .map(|l| (l.url().to_string(), l.status()))
            .collect()
    }

    /// Restart reconnecting to `url`. Returns false for unknown relays.
    pub fn reset(&self, url: &str) -> bool {
        match self.inner.links.iter().find(|l| l.url() == url) {
            Some(link) => {
                link.reset();
                true
            }
            None => false,
        }
    }

    /// Wait until at least one link is open, up to `limit`.
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let waits = self
            .inner
            .links
            .iter()
            .map(|l| Box::pin(l.wait_for(LinkState::Open, limit)));
        let mut waits: Vec<_> = waits.collect();
        while !waits.is_empty() {
            let (ok, _, rest) = futures_util::future::select_all(waits).await;
            if ok {
                return true;
            }
            waits = rest;
        }
        false
    }

    /// Stop every link and end every subscription stream.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for (_, entry) in lock(&self.inner.table.subs).drain() {
            entry.cancelled.store(true, Ordering::SeqCst);
        }
        lock(&self.inner.table.acks).clear();
        for link in &self.inner.links {
            link.shutdown();
        }
    }
}

/// Live feed of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    rx: mpsc::UnboundedReceiver<SubscriptionItem>,
    cancelled: Arc<AtomicBool>,
    pool: Arc<PoolInner>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next item, or `None` once the subscription was removed.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        let item = self.rx.recv().await?;
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        Some(item)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.pool.remove_subscription(&self.id);
    }
}
