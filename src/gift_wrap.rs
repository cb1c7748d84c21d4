//! Two-layer private envelope: rumor -> seal -> gift wrap.
//!
//! The seal is signed by the real sender and encrypted to the recipient. The
//! gift wrap encrypts the seal again under a one-off key that is thrown away
//! after signing, so relays only ever see the ephemeral author and the
//! recipient tag. Both layers carry jittered timestamps.

use rand::Rng;
use tracing::debug;

use crate::{
    error::{Error, Result},
    event::{now, Event, Kinds, Rumor, Tag, UnsignedEvent},
    keys::Keys,
    nip44,
};

/// Default half-width of the timestamp randomization window (two days).
pub const TIMESTAMP_WINDOW_SECS: u64 = 2 * 24 * 60 * 60;

/// A rumor recovered from a gift wrap, with the sender authenticated by the
/// seal signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwrappedMessage {
    pub rumor: Rumor,
    /// Real sender public key, taken from the seal (never from the wrap).
    pub sender: String,
}

/// Builds and opens seals and gift wraps for a fixed set of kind numbers.
#[derive(Debug, Clone)]
pub struct Envelope {
    kinds: Kinds,
    jitter_secs: u64,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new(Kinds::default(), TIMESTAMP_WINDOW_SECS)
    }
}

impl Envelope {
    pub fn new(kinds: Kinds, jitter_secs: u64) -> Self {
        Self { kinds, jitter_secs }
    }

    /// Change the timestamp window; `0` stamps layers with the current time.
    pub fn with_jitter(mut self, jitter_secs: u64) -> Self {
        self.jitter_secs = jitter_secs;
        self
    }

    pub fn kinds(&self) -> &Kinds {
        &self.kinds
    }

    fn randomized_timestamp(&self) -> u64 {
        let now = now();
        if self.jitter_secs == 0 {
            return now;
        }
        let offset = rand::thread_rng().gen_range(0..=self.jitter_secs.saturating_mul(2));
        now.saturating_sub(self.jitter_secs).saturating_add(offset)
    }

    /// Encrypt `rumor` to `recipient` and sign the result with the sender's
    /// real key.
    pub fn create_seal(&self, rumor: &Rumor, sender: &Keys, recipient: &str) -> Result<Event> {
        let key = sender.conversation_key(recipient)?;
        let plaintext = serde_json::to_string(rumor)?;
        let content = nip44::encrypt(plaintext.as_bytes(), &key)?;
        UnsignedEvent::new(sender.public_key_hex(), self.kinds.seal, content)
            .with_created_at(self.randomized_timestamp())
            .sign(sender)
    }

    /// Open a seal addressed to `recipient` and return the rumor inside.
    ///
    /// The rumor must be authored by the seal's signer; anything else is an
    /// impersonation attempt.
    pub fn unwrap_seal(&self, seal: &Event, recipient: &Keys) -> Result<Rumor> {
        self.check_layer(seal, self.kinds.seal)?;
        let plaintext = open(seal, recipient)?;
        let mut rumor: Rumor = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::InvalidEvent(format!("rumor: {e}")))?;
        if rumor.pubkey != seal.pubkey() {
            return Err(Error::SenderMismatch);
        }
        let computed = rumor.compute_id()?;
        if rumor.id.is_empty() {
            rumor.id = computed;
        } else if rumor.id != computed {
            return Err(Error::InvalidEvent("rumor id mismatch".into()));
        }
        Ok(rumor)
    }

    /// Encrypt a signed seal to `recipient` under a fresh single-use key.
    pub fn create_gift_wrap(&self, seal: &Event, recipient: &str) -> Result<Event> {
        let ephemeral = Keys::generate();
        let key = ephemeral.conversation_key(recipient)?;
        let content = nip44::encrypt(seal.as_json()?.as_bytes(), &key)?;
        UnsignedEvent::new(ephemeral.public_key_hex(), self.kinds.gift_wrap, content)
            .with_created_at(self.randomized_timestamp())
            .tag(Tag::pubkey(recipient))
            .sign(&ephemeral)
    }

    /// Open a gift wrap addressed to `recipient` and return the seal inside.
    pub fn unwrap_gift_wrap(&self, wrap: &Event, recipient: &Keys) -> Result<Event> {
        self.check_layer(wrap, self.kinds.gift_wrap)?;
        let plaintext = open(wrap, recipient)?;
        let json = String::from_utf8(plaintext)
            .map_err(|_| Error::InvalidEvent("seal is not utf-8".into()))?;
        Event::from_json(&json)
    }

    /// Seal and wrap `rumor` for `recipient` in one call.
    pub fn wrap_direct_message(
        &self,
        rumor: &Rumor,
        sender: &Keys,
        recipient: &str,
    ) -> Result<Event> {
        if rumor.pubkey != sender.public_key_hex() {
            return Err(Error::SenderMismatch);
        }
        let seal = self.create_seal(rumor, sender, recipient)?;
        self.create_gift_wrap(&seal, recipient)
    }

    /// Unwrap both layers. The seal's signature is checked again before the
    /// sender is reported.
    pub fn unwrap_direct_message(&self, wrap: &Event, recipient: &Keys) -> Result<UnwrappedMessage> {
        let seal = self.unwrap_gift_wrap(wrap, recipient)?;
        let rumor = self.unwrap_seal(&seal, recipient)?;
        Ok(UnwrappedMessage {
            rumor,
            sender: seal.pubkey().to_string(),
        })
    }

    fn check_layer(&self, ev: &Event, expected: u32) -> Result<()> {
        if ev.kind() != expected {
            return Err(Error::InvalidKind {
                expected,
                found: ev.kind(),
            });
        }
        if !ev.verify() {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }
}

/// Decrypt a layer's content with the key shared between its author and us.
fn open(layer: &Event, recipient: &Keys) -> Result<Vec<u8>> {
    let key = recipient.conversation_key(layer.pubkey())?;
    nip44::decrypt(layer.content(), &key).map_err(|e| {
        debug!(id = layer.id(), "layer decryption failed: {e}");
        Error::DecryptionFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rumor(sender: &Keys, recipient: &Keys, text: &str) -> Rumor {
        UnsignedEvent::new(sender.public_key_hex(), Kinds::default().private_dm, text)
            .tag(Tag::pubkey(recipient.public_key_hex()))
            .into_rumor()
            .unwrap()
    }

    #[test]
    fn direct_message_round_trip() {
        let env = Envelope::default();
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let r = rumor(&alice, &bob, "hello bob");
        let wrap = env
            .wrap_direct_message(&r, &alice, &bob.public_key_hex())
            .unwrap();
        let opened = env.unwrap_direct_message(&wrap, &bob).unwrap();
        assert_eq!(
            opened,
            UnwrappedMessage {
                rumor: r,
                sender: alice.public_key_hex(),
            }
        );
    }

    #[test]
    fn gift_wrap_hides_sender() {
        let env = Envelope::default();
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let r = rumor(&alice, &bob, "same message");
        let w1 = env
            .wrap_direct_message(&r, &alice, &bob.public_key_hex())
            .unwrap();
        let w2 = env
            .wrap_direct_message(&r, &alice, &bob.public_key_hex())
            .unwrap();
        assert_ne!(w1.pubkey(), w2.pubkey());
        assert_ne!(w1.id(), w2.id());
        for w in [&w1, &w2] {
            assert_ne!(w.pubkey(), alice.public_key_hex());
            assert_eq!(w.kind(), 1059);
            assert!(w.verify());
            assert_eq!(
                w.tag_values("p").collect::<Vec<_>>(),
                vec![bob.public_key_hex().as_str()]
            );
            assert!(!w.as_json().unwrap().contains(&alice.public_key_hex()));
        }
    }

    #[test]
    fn seal_layer_is_signed_by_sender() {
        let env = Envelope::default();
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let r = rumor(&alice, &bob, "hi");
        let seal = env.create_seal(&r, &alice, &bob.public_key_hex()).unwrap();
        assert_eq!(seal.kind(), 13);
        assert_eq!(seal.pubkey(), alice.public_key_hex());
        assert!(seal.tags().is_empty());
        assert!(seal.verify());
        assert_eq!(env.unwrap_seal(&seal, &bob).unwrap(), r);
        assert!(matches!(
            env.unwrap_seal(&seal, &Keys::generate()),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_kind_is_rejected_before_decryption() {
        let env = Envelope::default();
        let bob = Keys::generate();
        let imposter = Keys::generate();
        let ev = UnsignedEvent::new(imposter.public_key_hex(), 1, "not even base64")
            .sign(&imposter)
            .unwrap();
        assert!(matches!(
            env.unwrap_gift_wrap(&ev, &bob),
            Err(Error::InvalidKind {
                expected: 1059,
                found: 1
            })
        ));
        assert!(matches!(
            env.unwrap_seal(&ev, &bob),
            Err(Error::InvalidKind { expected: 13, .. })
        ));
    }

    #[test]
    fn tampered_layers_are_rejected() {
        let env = Envelope::default();
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let wrap = env
            .wrap_direct_message(&rumor(&alice, &bob, "x"), &alice, &bob.public_key_hex())
            .unwrap();
        let mut v = serde_json::to_value(&wrap).unwrap();
        v["created_at"] = (wrap.created_at() + 1).into();
        let forged: Event = serde_json::from_value(v).unwrap();
        assert!(matches!(
            env.unwrap_gift_wrap(&forged, &bob),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_recipient_cannot_decrypt() {
        let env = Envelope::default();
        let (alice, bob, eve) = (Keys::generate(), Keys::generate(), Keys::generate());
        let wrap = env
            .wrap_direct_message(&rumor(&alice, &bob, "x"), &alice, &bob.public_key_hex())
            .unwrap();
        assert!(matches!(
            env.unwrap_direct_message(&wrap, &eve),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn impersonated_rumor_is_rejected() {
        let env = Envelope::default();
        let (alice, bob, mallory) = (Keys::generate(), Keys::generate(), Keys::generate());
        // Mallory seals a rumor claiming to be from Alice.
        let forged = rumor(&alice, &bob, "trust me");
        assert!(matches!(
            env.wrap_direct_message(&forged, &mallory, &bob.public_key_hex()),
            Err(Error::SenderMismatch)
        ));
        let seal = env
            .create_seal(&forged, &mallory, &bob.public_key_hex())
            .unwrap();
        let wrap = env
            .create_gift_wrap(&seal, &bob.public_key_hex())
            .unwrap();
        assert!(matches!(
            env.unwrap_direct_message(&wrap, &bob),
            Err(Error::SenderMismatch)
        ));
    }

    #[test]
    fn rumor_with_bad_id_is_rejected() {
        let env = Envelope::default();
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let mut r = rumor(&alice, &bob, "x");
        r.id = "00".repeat(32);
        let seal = env.create_seal(&r, &alice, &bob.public_key_hex()).unwrap();
        assert!(matches!(
            env.unwrap_seal(&seal, &bob),
            Err(Error::InvalidEvent(_))
        ));
        // A rumor serialized without an id gets one on the way out.
        r.id = String::new();
        let seal = env.create_seal(&r, &alice, &bob.public_key_hex()).unwrap();
        let opened = env.unwrap_seal(&seal, &bob).unwrap();
        assert_eq!(opened.id, opened.compute_id().unwrap());
    }

    #[test]
    fn timestamps_stay_inside_window() {
        let env = Envelope::default();
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let start = now();
        for _ in 0..20 {
            let wrap = env
                .wrap_direct_message(&rumor(&alice, &bob, "t"), &alice, &bob.public_key_hex())
                .unwrap();
            assert!(wrap.created_at() + TIMESTAMP_WINDOW_SECS >= start);
            assert!(wrap.created_at() <= now() + TIMESTAMP_WINDOW_SECS);
        }
        let exact = Envelope::default().with_jitter(0);
        let seal = exact
            .create_seal(&rumor(&alice, &bob, "t"), &alice, &bob.public_key_hex())
            .unwrap();
        assert!(seal.created_at() >= start && seal.created_at() <= now());
    }

    #[test]
    fn custom_kinds_are_honoured() {
        let kinds = Kinds {
            seal: 30013,
            gift_wrap: 31059,
            ..Kinds::default()
        };
        let env = Envelope::new(kinds, 0);
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let wrap = env
            .wrap_direct_message(&rumor(&alice, &bob, "x"), &alice, &bob.public_key_hex())
            .unwrap();
        assert_eq!(wrap.kind(), 31059);
        assert!(env.unwrap_direct_message(&wrap, &bob).is_ok());
        assert!(matches!(
            Envelope::default().unwrap_direct_message(&wrap, &bob),
            Err(Error::InvalidKind { .. })
        ));
    }
}
