//! Messaging patterns built on [`Envelope`] and [`RelayPool`]: private direct
//! messages, small-group fan-out and public channels.

use std::{collections::HashSet, time::Duration};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    event::{now, Event, Rumor, Tag, UnsignedEvent},
    filter::Filter,
    gift_wrap::{Envelope, UnwrappedMessage},
    keys::{parse_public_key, Keys},
    pool::{PublishAck, RelayPool, Subscription, SubscriptionItem},
};

/// Outcome of sending one logical message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub rumor: Rumor,
    /// Acknowledgments for every wrap published, in no particular order.
    pub acks: Vec<PublishAck>,
}

impl Delivery {
    pub fn accepted(&self) -> usize {
        self.acks.iter().filter(|a| a.accepted).count()
    }
}

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrap `rumor` for every recipient and publish the wraps concurrently.
async fn deliver(
    pool: &RelayPool,
    envelope: &Envelope,
    ack_timeout: Duration,
    sender: &Keys,
    rumor: Rumor,
    recipients: &[String],
) -> Result<Delivery> {
    let wraps = recipients
        .iter()
        .map(|r| envelope.wrap_direct_message(&rumor, sender, r))
        .collect::<Result<Vec<_>>>()?;
    let results = join_all(wraps.iter().map(|w| pool.publish_and_wait(w, ack_timeout))).await;
    let mut acks = Vec::new();
    for res in results {
        acks.extend(res?);
    }
    debug!(rumor = %rumor.id, wraps = wraps.len(), acks = acks.len(), "message published");
    Ok(Delivery { rumor, acks })
}

/// Unwrap every gift wrap, skipping ones that fail, dedup by rumor id and
/// sort oldest first.
fn open_all(envelope: &Envelope, keys: &Keys, wraps: &[Event]) -> Vec<UnwrappedMessage> {
    let mut seen = HashSet::new();
    let mut out: Vec<UnwrappedMessage> = wraps
        .iter()
        .filter_map(|w| match envelope.unwrap_direct_message(w, keys) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(wrap = w.id(), "skipping gift wrap: {e}");
                None
            }
        })
        .filter(|m| m.rumor.kind == envelope.kinds().private_dm)
        .filter(|m| seen.insert(m.rumor.id.clone()))
        .collect();
    out.sort_by_key(|m| m.rumor.created_at);
    out
}

/// Rumor for a private message from `keys` tagged to each of `members`.
fn private_rumor(envelope: &Envelope, keys: &Keys, members: &[String], text: &str) -> Result<Rumor> {
    let mut draft = UnsignedEvent::new(keys.public_key_hex(), envelope.kinds().private_dm, text)
        .with_created_at(now());
    for m in members {
        draft = draft.tag(Tag::pubkey(m.clone()));
    }
    draft.into_rumor()
}

fn gift_wrap_filter(envelope: &Envelope, keys: &Keys) -> Filter {
    Filter::new()
        .kind(envelope.kinds().gift_wrap)
        .pubkey(keys.public_key_hex())
}

/// One-to-one private messages (NIP-17).
#[derive(Clone)]
pub struct DirectMessages {
    pool: RelayPool,
    envelope: Envelope,
    ack_timeout: Duration,
}

impl DirectMessages {
    pub fn new(pool: RelayPool, envelope: Envelope) -> Self {
        Self {
            pool,
            envelope,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// How long `send` waits for relay acknowledgments.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Send `text` to `recipient`. A second copy is wrapped to the sender so
    /// their other clients can show the conversation.
    pub async fn send(&self, keys: &Keys, recipient: &str, text: &str) -> Result<Delivery> {
        parse_public_key(recipient)?;
        let rumor = private_rumor(&self.envelope, keys, &[recipient.to_string()], text)?;
        let mut targets = vec![recipient.to_string()];
        if recipient != keys.public_key_hex() {
            targets.push(keys.public_key_hex());
        }
        deliver(&self.pool, &self.envelope, self.ack_timeout, keys, rumor, &targets).await
    }

    /// Fetch and open every gift wrap addressed to `keys`, oldest first.
    pub async fn inbox(&self, keys: &Keys) -> Result<Vec<UnwrappedMessage>> {
        let wraps = self.pool.fetch(vec![gift_wrap_filter(&self.envelope, keys)]).await?;
        Ok(open_all(&self.envelope, keys, &wraps))
    }

    /// Live feed of incoming messages.
    pub fn listen(&self, keys: &Keys) -> Result<Inbox> {
        let sub = self
            .pool
            .subscribe(vec![gift_wrap_filter(&self.envelope, keys)])?;
        Ok(Inbox {
            sub,
            envelope: self.envelope.clone(),
            keys: keys.clone(),
            seen: HashSet::new(),
        })
    }
}

/// Stream of unwrapped private messages from a live subscription.
pub struct Inbox {
    sub: Subscription,
    envelope: Envelope,
    keys: Keys,
    seen: HashSet<String>,
}

impl Inbox {
    /// Next new message. Duplicates and undecryptable wraps are skipped;
    /// `None` means the subscription ended.
    pub async fn next(&mut self) -> Option<UnwrappedMessage> {
        loop {
            let SubscriptionItem::Event { event, .. } = self.sub.recv().await? else {
                continue;
            };
            match self.envelope.unwrap_direct_message(&event, &self.keys) {
                Ok(msg) if self.seen.insert(msg.rumor.id.clone()) => return Some(msg),
                Ok(_) => {}
                Err(e) => warn!(wrap = event.id(), "skipping gift wrap: {e}"),
            }
        }
    }
}

/// Small-group private messages: one rumor, wrapped once per participant.
#[derive(Clone)]
pub struct GroupMessages {
    pool: RelayPool,
    envelope: Envelope,
    ack_timeout: Duration,
}

impl GroupMessages {
    pub fn new(pool: RelayPool, envelope: Envelope) -> Self {
        Self {
            pool,
            envelope,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Send `text` to every member. The sender is implied and may be listed.
    pub async fn send(&self, keys: &Keys, members: &[String], text: &str) -> Result<Delivery> {
        let me = keys.public_key_hex();
        let mut others: Vec<String> = Vec::new();
        for m in members {
            parse_public_key(m)?;
            if *m != me && !others.contains(m) {
                others.push(m.clone());
            }
        }
        if others.is_empty() {
            return Err(Error::InvalidPayload("group has no other members"));
        }
        let rumor = private_rumor(&self.envelope, keys, &others, text)?;
        let mut targets = others;
        targets.push(me);
        deliver(&self.pool, &self.envelope, self.ack_timeout, keys, rumor, &targets).await
    }

    /// Messages whose participants (author plus `p` tags) are exactly
    /// `members` plus ourselves.
    pub async fn inbox(&self, keys: &Keys, members: &[String]) -> Result<Vec<UnwrappedMessage>> {
        let mut group: HashSet<&str> = members.iter().map(String::as_str).collect();
        let me = keys.public_key_hex();
        group.insert(me.as_str());
        let wraps = self.pool.fetch(vec![gift_wrap_filter(&self.envelope, keys)]).await?;
        Ok(open_all(&self.envelope, keys, &wraps)
            .into_iter()
            .filter(|m| {
                let mut participants: HashSet<&str> = m.rumor.tag_values("p").collect();
                participants.insert(m.sender.as_str());
                participants == group
            })
            .collect())
    }
}

/// Metadata carried in a channel creation event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub about: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub picture: String,
}

/// Public channels (NIP-28). Nothing here is encrypted.
#[derive(Clone)]
pub struct Channels {
    pool: RelayPool,
    envelope: Envelope,
    ack_timeout: Duration,
}

impl Channels {
    pub fn new(pool: RelayPool, envelope: Envelope) -> Self {
        Self {
            pool,
            envelope,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// How long the `*_and_wait` variants wait for relay acknowledgments.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    fn creation_event(&self, keys: &Keys, metadata: &ChannelMetadata) -> Result<Event> {
        let content = serde_json::to_string(metadata)?;
        UnsignedEvent::new(
            keys.public_key_hex(),
            self.envelope.kinds().channel_create,
            content,
        )
        .sign(keys)
    }

    fn message_event(&self, keys: &Keys, channel_id: &str, text: &str) -> Result<Event> {
        UnsignedEvent::new(
            keys.public_key_hex(),
            self.envelope.kinds().channel_message,
            text,
        )
        .tag(Tag::event(channel_id, "root"))
        .sign(keys)
    }

    /// Publish a channel creation event; its id is the channel id.
    pub fn create(&self, keys: &Keys, metadata: &ChannelMetadata) -> Result<Event> {
        let ev = self.creation_event(keys, metadata)?;
        self.pool.publish(&ev)?;
        Ok(ev)
    }

    /// Like [`Channels::create`], but waits for relay acknowledgments.
    pub async fn create_and_wait(
        &self,
        keys: &Keys,
        metadata: &ChannelMetadata,
    ) -> Result<(Event, Vec<PublishAck>)> {
        let ev = self.creation_event(keys, metadata)?;
        let acks = self.pool.publish_and_wait(&ev, self.ack_timeout).await?;
        Ok((ev, acks))
    }

    /// Publish a message into `channel_id`.
    pub fn post(&self, keys: &Keys, channel_id: &str, text: &str) -> Result<Event> {
        let ev = self.message_event(keys, channel_id, text)?;
        self.pool.publish(&ev)?;
        Ok(ev)
    }

    pub async fn post_and_wait(
        &self,
        keys: &Keys,
        channel_id: &str,
        text: &str,
    ) -> Result<(Event, Vec<PublishAck>)> {
        let ev = self.message_event(keys, channel_id, text)?;
        let acks = self.pool.publish_and_wait(&ev, self.ack_timeout).await?;
        Ok((ev, acks))
    }

    /// Look up a channel's metadata, if any relay has its creation event.
    pub async fn metadata(&self, channel_id: &str) -> Result<Option<ChannelMetadata>> {
        let filter = Filter::new()
            .id(channel_id)
            .kind(self.envelope.kinds().channel_create);
        let found = self.pool.fetch(vec![filter]).await?;
        Ok(found
            .iter()
            .find(|ev| ev.id() == channel_id)
            .and_then(|ev| serde_json::from_str(ev.content()).ok()))
    }

    /// Messages posted to `channel_id`, oldest first.
    pub async fn history(&self, channel_id: &str, limit: Option<usize>) -> Result<Vec<Event>> {
        let mut filter = Filter::new()
            .kind(self.envelope.kinds().channel_message)
            .event(channel_id);
        if let Some(limit) = limit {
            filter = filter.limit(limit);
        }
        let mut events = self.pool.fetch(vec![filter]).await?;
        events.sort_by_key(|ev| ev.created_at());
        Ok(events)
    }
}
