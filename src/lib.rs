//! Gift-wrapped private messaging over a pool of Nostr relays.
//!
//! Layers, bottom up: [`keys`] derives conversation keys, [`nip44`] encrypts
//! payloads, [`event`] signs and verifies events, [`gift_wrap`] builds the
//! seal + wrap envelope, [`relay`] and [`pool`] move events over WebSockets,
//! and [`messaging`] ties them together.

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod gift_wrap;
pub mod keys;
pub mod message;
pub mod messaging;
pub mod nip44;
pub mod pool;
pub mod relay;

pub use error::{Error, Result};
pub use event::{Event, Kinds, Rumor, Tag, UnsignedEvent};
pub use filter::Filter;
pub use gift_wrap::{Envelope, UnwrappedMessage};
pub use keys::{ConversationKey, Keys};
pub use messaging::{Channels, DirectMessages, GroupMessages};
pub use pool::{PoolConfig, RelayPool, Subscription, SubscriptionItem};
pub use relay::{LinkState, RelayOptions};
