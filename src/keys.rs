//! Identity keys and per-pair conversation key derivation.

use std::{fmt, sync::OnceLock};

use hkdf::Hkdf;
use secp256k1::{ecdh, All, Keypair, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Domain-separation label fed to HKDF when deriving a conversation key.
pub const CONVERSATION_KEY_LABEL: &[u8] = b"nip44-v2";

pub(crate) fn secp() -> &'static Secp256k1<All> {
    static CTX: OnceLock<Secp256k1<All>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::new)
}

/// A secp256k1 identity: secret scalar plus its x-only public key.
///
/// The core never persists keys; callers hand them in per operation.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public: XOnlyPublicKey,
}

impl Keys {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret(&secret)
    }

    /// Build an identity from an existing secret key.
    pub fn from_secret(secret: &SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(secp(), secret);
        let (public, _) = keypair.x_only_public_key();
        Self { keypair, public }
    }

    /// Parse a 64-character hex secret key.
    pub fn from_secret_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| Error::InvalidKeyMaterial)?;
        let secret = SecretKey::from_slice(&bytes).map_err(|_| Error::InvalidKeyMaterial)?;
        Ok(Self::from_secret(&secret))
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> XOnlyPublicKey {
        self.public
    }

    /// Lowercase hex of the x-only public key, as used in `pubkey` fields.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// Derive the conversation key shared with `peer` (x-only hex).
    pub fn conversation_key(&self, peer: &str) -> Result<ConversationKey> {
        let peer = parse_public_key(peer)?;
        conversation_key(&self.secret_key(), &peer)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public_key_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Parse a 32-byte x-only public key from hex.
pub fn parse_public_key(hex_key: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(hex_key).map_err(|_| Error::InvalidKeyMaterial)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidKeyMaterial);
    }
    XOnlyPublicKey::from_slice(&bytes).map_err(|_| Error::InvalidKeyMaterial)
}

/// 32-byte symmetric key shared by exactly two identities.
///
/// Callers may cache it per (own key, peer key) pair; the core does not.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey([REDACTED])")
    }
}

impl Drop for ConversationKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// ECDH on secp256k1 followed by HKDF-SHA256 over the shared x-coordinate.
///
/// The x-only peer key is lifted to its even-parity point, so
/// `derive(a, B) == derive(b, A)` for any two identities.
pub fn conversation_key(secret: &SecretKey, peer: &XOnlyPublicKey) -> Result<ConversationKey> {
    let point = PublicKey::from_x_only_public_key(*peer, Parity::Even);
    let mut shared = ecdh::shared_secret_point(&point, secret);
    let hkdf = Hkdf::<Sha256>::new(None, &shared[..32]);
    shared.zeroize();
    let mut out = [0u8; 32];
    hkdf.expand(CONVERSATION_KEY_LABEL, &mut out)
        .map_err(|_| Error::InvalidKeyMaterial)?;
    Ok(ConversationKey(out))
}
