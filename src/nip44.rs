//! Versioned payload encryption between two identities.
//!
//! Wire frame (base64 of):
//!
//! ```text
//! version (1) || nonce (32) || ciphertext + poly1305 tag || hmac-sha256 (32)
//! ```
//!
//! The plaintext is prefixed with its big-endian `u16` length and zero padded
//! to a bucket boundary before encryption, so ciphertext lengths only leak the
//! bucket a message falls into.
//!
//! The outer HMAC duplicates the cipher's own tag; both are checked on
//! decrypt. The frame is not NIP-44 v2 (that uses ChaCha20 with a separate
//! HMAC), so it carries its own version byte and standard v2 payloads are
//! rejected as unsupported rather than misread.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{
    error::{Error, Result},
    keys::ConversationKey,
};

/// Version byte written in front of every payload. Kept clear of the
/// versions assigned by NIP-44.
pub const VERSION: u8 = 0x80;
/// Smallest plaintext accepted by [`encrypt`].
pub const MIN_PLAINTEXT_LEN: usize = 1;
/// Largest plaintext accepted by [`encrypt`].
pub const MAX_PLAINTEXT_LEN: usize = 65535;

const NONCE_LEN: usize = 32;
const MAC_LEN: usize = 32;
const TAG_LEN: usize = 16;
const MIN_PADDED_LEN: usize = 32;
const MESSAGE_KEYS_LABEL: &[u8] = b"nip44-v2/message-keys";
const MIN_FRAME_LEN: usize = 1 + NONCE_LEN + 2 + MIN_PADDED_LEN + TAG_LEN + MAC_LEN;

type HmacSha256 = Hmac<Sha256>;

/// Per-message keys expanded from the conversation key and nonce.
struct MessageKeys {
    cipher_key: [u8; 32],
    cipher_nonce: [u8; 24],
    auth_key: [u8; 32],
}

impl Drop for MessageKeys {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.cipher_nonce.zeroize();
        self.auth_key.zeroize();
    }
}

fn message_keys(key: &ConversationKey, nonce: &[u8; NONCE_LEN]) -> Result<MessageKeys> {
    let hkdf = Hkdf::<Sha256>::from_prk(key.as_bytes()).map_err(|_| Error::InvalidKeyMaterial)?;
    let mut okm = [0u8; 32 + 24 + 32];
    hkdf.expand_multi_info(&[MESSAGE_KEYS_LABEL, nonce], &mut okm)
        .map_err(|_| Error::InvalidKeyMaterial)?;
    let mut keys = MessageKeys {
        cipher_key: [0u8; 32],
        cipher_nonce: [0u8; 24],
        auth_key: [0u8; 32],
    };
    keys.cipher_key.copy_from_slice(&okm[..32]);
    keys.cipher_nonce.copy_from_slice(&okm[32..56]);
    keys.auth_key.copy_from_slice(&okm[56..]);
    okm.zeroize();
    Ok(keys)
}

/// Padded length (excluding the 2-byte length prefix) for a plaintext length.
pub fn padded_len(len: usize) -> usize {
    if len <= MIN_PADDED_LEN {
        return MIN_PADDED_LEN;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

/// Length-prefix and zero-pad a plaintext.
pub fn pad(plaintext: &[u8]) -> Result<Vec<u8>> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(Error::InvalidLength(len));
    }
    let mut out = vec![0u8; 2 + padded_len(len)];
    out[..2].copy_from_slice(&(len as u16).to_be_bytes());
    out[2..2 + len].copy_from_slice(plaintext);
    Ok(out)
}

/// Strip padding using the embedded length. Pad bytes are not inspected.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 2 {
        return Err(Error::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len == 0 || 2 + len > padded.len() {
        return Err(Error::InvalidPadding);
    }
    Ok(padded[2..2 + len].to_vec())
}

/// Encrypt with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &ConversationKey) -> Result<String> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(plaintext, key, &nonce)
}

/// Encrypt with a caller-supplied nonce. Only deterministic tests should
/// pass their own nonce; reusing one leaks plaintext.
pub fn encrypt_with_nonce(
    plaintext: &[u8],
    key: &ConversationKey,
    nonce: &[u8; NONCE_LEN],
) -> Result<String> {
    let padded = pad(plaintext)?;
    let keys = message_keys(key, nonce)?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&keys.cipher_key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&keys.cipher_nonce), padded.as_slice())
        .map_err(|_| Error::InvalidPayload("cipher rejected input"))?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.auth_key)
        .map_err(|_| Error::InvalidKeyMaterial)?;
    mac.update(nonce);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut frame = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len() + MAC_LEN);
    frame.push(VERSION);
    frame.extend_from_slice(nonce);
    frame.extend_from_slice(&ciphertext);
    frame.extend_from_slice(&tag);
    Ok(STANDARD.encode(frame))
}

/// Decrypt a base64 payload produced by [`encrypt`].
pub fn decrypt(payload: &str, key: &ConversationKey) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(Error::InvalidPayload("empty payload"));
    }
    let raw = STANDARD
        .decode(payload)
        .map_err(|_| Error::InvalidPayload("invalid base64"))?;
    match raw.first() {
        None => return Err(Error::InvalidPayload("empty payload")),
        Some(&VERSION) => {}
        Some(&other) => return Err(Error::UnsupportedVersion(other)),
    }
    if raw.len() < MIN_FRAME_LEN {
        return Err(Error::InvalidPayload("payload too short"));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&raw[1..1 + NONCE_LEN]);
    let mac_start = raw.len() - MAC_LEN;
    let ciphertext = &raw[1 + NONCE_LEN..mac_start];
    let keys = message_keys(key, &nonce)?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.auth_key)
        .map_err(|_| Error::InvalidKeyMaterial)?;
    mac.update(&nonce);
    mac.update(ciphertext);
    mac.verify_slice(&raw[mac_start..])
        .map_err(|_| Error::AuthenticationFailed)?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&keys.cipher_key));
    let mut padded = cipher
        .decrypt(XNonce::from_slice(&keys.cipher_nonce), ciphertext)
        .map_err(|_| Error::AuthenticationFailed)?;
    let plaintext = unpad(&padded);
    padded.zeroize();
    plaintext
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::from_bytes([7u8; 32])
    }

    #[test]
    fn padded_len_buckets() {
        let cases = [
            (1, 32),
            (16, 32),
            (32, 32),
            (33, 64),
            (37, 64),
            (64, 64),
            (65, 96),
            (100, 128),
            (200, 224),
            (256, 256),
            (257, 320),
            (383, 384),
            (384, 384),
            (400, 448),
            (515, 640),
            (700, 768),
            (900, 1024),
            (1020, 1024),
            (65535, 65536),
        ];
        for (len, expected) in cases {
            assert_eq!(padded_len(len), expected, "len {len}");
        }
    }

    #[test]
    fn padding_is_monotonic_and_bucket_aligned() {
        let mut prev = 0;
        for len in MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN {
            let padded = padded_len(len);
            assert!(padded >= prev);
            assert!(padded >= len);
            let chunk = if padded <= 256 { 32 } else { padded.next_power_of_two() / 8 };
            assert_eq!(padded % chunk, 0, "len {len}");
            if len < 300 || len % 997 == 0 {
                assert_eq!(pad(&vec![1u8; len]).unwrap().len(), padded + 2);
            }
            prev = padded;
        }
    }

    #[test]
    fn hello_pads_to_smallest_bucket() {
        let padded = pad(b"hello").unwrap();
        assert_eq!(padded.len(), 34);
        assert_eq!(&padded[..2], &[0, 5]);
        assert_eq!(&padded[2..7], b"hello");
        assert!(padded[7..].iter().all(|b| *b == 0));
        assert_eq!(unpad(&padded).unwrap(), b"hello");
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(matches!(pad(b""), Err(Error::InvalidLength(0))));
        assert!(matches!(
            encrypt(&vec![0u8; 65536], &key()),
            Err(Error::InvalidLength(65536))
        ));
    }

    #[test]
    fn unpad_trusts_embedded_length() {
        let mut padded = pad(b"abc").unwrap();
        // Garbage after the message is ignored.
        padded[10] = 0xff;
        assert_eq!(unpad(&padded).unwrap(), b"abc");
        padded[0] = 0xff;
        assert!(matches!(unpad(&padded), Err(Error::InvalidPadding)));
        assert!(matches!(unpad(&[0, 0, 1]), Err(Error::InvalidPadding)));
    }

    #[test]
    fn round_trip_across_buckets() {
        for len in [1usize, 5, 32, 33, 255, 256, 257, 1000, 65535] {
            let msg: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let payload = encrypt(&msg, &key()).unwrap();
            assert_eq!(decrypt(&payload, &key()).unwrap(), msg);
        }
    }

    #[test]
    fn fixed_nonce_is_deterministic() {
        let nonce = [9u8; 32];
        let a = encrypt_with_nonce(b"hello", &key(), &nonce).unwrap();
        let b = encrypt_with_nonce(b"hello", &key(), &nonce).unwrap();
        let c = encrypt_with_nonce(b"world", &key(), &nonce).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let raw = STANDARD.decode(&a).unwrap();
        assert_eq!(raw.len(), 1 + 32 + 34 + TAG_LEN + MAC_LEN);
        assert_eq!(raw.len(), STANDARD.decode(&c).unwrap().len());
        assert_eq!(raw[0], VERSION);
        assert_eq!(&raw[1..33], &nonce);
    }

    #[test]
    fn random_nonces_differ() {
        let a = encrypt(b"hello", &key()).unwrap();
        let b = encrypt(b"hello", &key()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let payload = encrypt_with_nonce(b"tamper me", &key(), &[3u8; 32]).unwrap();
        let raw = STANDARD.decode(&payload).unwrap();
        for byte in 1..raw.len() {
            for bit in [0u8, 3, 7] {
                let mut bad = raw.clone();
                bad[byte] ^= 1 << bit;
                let err = decrypt(&STANDARD.encode(&bad), &key()).unwrap_err();
                assert!(
                    matches!(err, Error::AuthenticationFailed),
                    "byte {byte} bit {bit}: {err:?}"
                );
            }
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let payload = encrypt(b"secret", &key()).unwrap();
        let other = ConversationKey::from_bytes([8u8; 32]);
        assert!(matches!(
            decrypt(&payload, &other),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn rejects_unknown_version_and_garbage() {
        let payload = encrypt(b"x", &key()).unwrap();
        let mut raw = STANDARD.decode(&payload).unwrap();
        raw[0] = 1;
        assert!(matches!(
            decrypt(&STANDARD.encode(&raw), &key()),
            Err(Error::UnsupportedVersion(1))
        ));
        // A NIP-44 v2 payload is refused before any key material is used.
        raw[0] = 2;
        assert!(matches!(
            decrypt(&STANDARD.encode(&raw), &key()),
            Err(Error::UnsupportedVersion(2))
        ));
        assert!(matches!(
            decrypt("", &key()),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            decrypt("%%%not-base64", &key()),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            decrypt(&STANDARD.encode([VERSION, 1, 2, 3]), &key()),
            Err(Error::InvalidPayload(_))
        ));
    }
}
