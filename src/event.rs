//! Nostr event model, canonical ids and Schnorr signatures.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    keys::{parse_public_key, secp, Keys},
};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The ones this crate produces are:
///
/// - `p` – references another author's public key (gift wrap recipient, DM
///   participants)
/// - `e` – links to another event ID (channel root)
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved. For
/// example, a `["p", "<hex>"]` tag from the protocol is represented as
/// `Tag(vec!["p".into(), "<hex>".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// `["p", pubkey]`
    pub fn pubkey(pubkey: impl Into<String>) -> Self {
        Tag(vec!["p".into(), pubkey.into()])
    }

    /// `["e", id, "", marker]`
    pub fn event(id: impl Into<String>, marker: &str) -> Self {
        Tag(vec!["e".into(), id.into(), String::new(), marker.into()])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Reserved kind numbers. Kept configurable so deployments can follow
/// registry changes without a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kinds {
    pub seal: u32,
    pub gift_wrap: u32,
    pub private_dm: u32,
    pub channel_create: u32,
    pub channel_message: u32,
}

impl Default for Kinds {
    fn default() -> Self {
        Self {
            seal: 13,
            gift_wrap: 1059,
            private_dm: 14,
            channel_create: 40,
            channel_message: 42,
        }
    }
}

/// Current Unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// SHA-256 of the canonical `[0, pubkey, created_at, kind, tags, content]`
/// serialization.
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let data = serde_json::to_vec(&(0, pubkey, created_at, kind, tags, content))?;
    Ok(Sha256::digest(&data).into())
}

/// Event fields before an id and signature are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Start an event authored by `pubkey`, stamped with the current time.
    pub fn new(pubkey: impl Into<String>, kind: u32, content: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: now(),
            kind,
            tags: vec![],
            content: content.into(),
        }
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Hex id this event would carry.
    pub fn id(&self) -> Result<String> {
        Ok(hex::encode(self.hash()?))
    }

    fn hash(&self) -> Result<[u8; 32]> {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Compute the id and sign it. The signature only verifies when
    /// `self.pubkey` belongs to `keys`.
    pub fn sign(self, keys: &Keys) -> Result<Event> {
        let hash = self.hash()?;
        let msg = Message::from_digest(hash);
        let aux: [u8; 32] = rand::random();
        let sig = secp().sign_schnorr_with_aux_rand(&msg, keys.keypair(), &aux);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }

    /// Attach the id but no signature, producing the innermost envelope layer.
    pub fn into_rumor(self) -> Result<Rumor> {
        let id = self.id()?;
        Ok(Rumor {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        })
    }
}

/// An unsigned application message carried inside a seal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rumor {
    #[serde(default)]
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub content: String,
}

impl Rumor {
    /// Recompute the id from the body.
    pub fn compute_id(&self) -> Result<String> {
        let hash = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        Ok(hex::encode(hash))
    }

    /// Values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        tag_values(&self.tags, name)
    }
}

fn tag_values<'a>(tags: &'a [Tag], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    tags.iter()
        .filter(move |t| t.name() == Some(name))
        .filter_map(Tag::value)
}

/// Core Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "<64 hex>",
///   "pubkey": "<64 hex>",
///   "kind": 1059,
///   "created_at": 1700000000,
///   "tags": [["p", "<64 hex>"]],
///   "content": "<base64 payload>",
///   "sig": "<128 hex>"
/// }
/// ```
///
/// Events built locally come out of [`UnsignedEvent::sign`] and are never
/// mutated afterwards. Events received from relays are untrusted until
/// [`Event::verify`] passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    id: String,
    pubkey: String,
    kind: u32,
    created_at: u64,
    tags: Vec<Tag>,
    content: String,
    sig: String,
}

impl Event {
    /// Event identifier (hex of SHA-256 hash).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Author public key (x-only hex).
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sig(&self) -> &str {
        &self.sig
    }

    /// Values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        tag_values(&self.tags, name)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::InvalidEvent(e.to_string()))
    }

    pub fn as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Recompute the id, then check the Schnorr signature against it.
    ///
    /// Never panics or errors: malformed hex, wrong lengths, a stale id or a
    /// bad signature all yield `false`.
    pub fn verify(&self) -> bool {
        self.check().is_ok()
    }

    fn check(&self) -> Result<()> {
        if self.id.len() != 64 || self.sig.len() != 128 {
            return Err(Error::InvalidSignature);
        }
        let hash = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(hash) != self.id {
            return Err(Error::InvalidSignature);
        }
        let sig_bytes = hex::decode(&self.sig).map_err(|_| Error::InvalidSignature)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| Error::InvalidSignature)?;
        let pk = parse_public_key(&self.pubkey)?;
        secp()
            .verify_schnorr(&sig, &Message::from_digest(hash), &pk)
            .map_err(|_| Error::InvalidSignature)
    }
}
