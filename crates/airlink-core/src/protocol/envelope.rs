//! Password-based encrypted envelope.
//!
//! Wire layout:
//! ```text
//! [salt:8][iv:12][ciphertext + 16-byte GCM tag]
//! ```
//!
//! # How the key is made (for beginners)
//!
//! Both ends share a human-chosen password, which is far too guessable to use
//! as an AES key directly.  PBKDF2-HMAC-SHA256 stretches it: the password and
//! a random salt are hashed 10 000 times to produce a 128-bit key.  Because
//! the salt is fresh for every envelope, the same password never yields the
//! same key twice, and an attacker cannot precompute a table of keys.
//!
//! The key then drives AES-128-GCM, an *authenticated* cipher.  GCM appends a
//! 16-byte tag; decryption recomputes it and refuses to return anything if it
//! does not match.  That is what makes a wrong password fail loudly with
//! [`EnvelopeError::Auth`] instead of producing garbage plaintext.

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Salt length in bytes.
pub const SALT_LEN: usize = 8;

/// IV (GCM nonce) length in bytes.
pub const IV_LEN: usize = 12;

/// Derived key length in bytes (128 bits).
pub const KEY_LEN: usize = 16;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

const ITERATIONS: NonZeroU32 = match NonZeroU32::new(PBKDF2_ITERATIONS) {
    Some(n) => n,
    None => unreachable!(),
};

/// Errors returned by envelope operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The bytes cannot be an envelope (too short to hold salt, iv, and tag).
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Key derivation or authenticated decryption failed (wrong password or
    /// tampered ciphertext).
    #[error("envelope authentication failed")]
    Auth,

    /// The system random source or cipher setup failed.
    #[error("envelope crypto failure: {0}")]
    Internal(&'static str),
}

/// An encrypted payload with the parameters needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    /// Ciphertext with the GCM tag appended.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serializes as `salt | iv | ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SALT_LEN + IV_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Parses `salt | iv | ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] when the input cannot hold a salt,
    /// an iv, and a GCM tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let min = SALT_LEN + IV_LEN + TAG_LEN;
        if bytes.len() < min {
            return Err(EnvelopeError::Malformed(format!(
                "need at least {min} bytes, got {}",
                bytes.len()
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[..SALT_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[SALT_LEN..SALT_LEN + IV_LEN]);

        Ok(Self {
            salt,
            iv,
            ciphertext: bytes[SALT_LEN + IV_LEN..].to_vec(),
        })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encrypts `plaintext` under `password` with a fresh random salt and iv.
///
/// # Errors
///
/// Returns [`EnvelopeError::Internal`] if the system random source fails.
pub fn encrypt_envelope(plaintext: &[u8], password: &str) -> Result<Envelope, EnvelopeError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rng.fill(&mut salt)
        .map_err(|_| EnvelopeError::Internal("random salt"))?;
    rng.fill(&mut iv)
        .map_err(|_| EnvelopeError::Internal("random iv"))?;

    let key = derive_key(password, &salt)?;
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
        .map_err(|_| EnvelopeError::Internal("seal"))?;

    Ok(Envelope {
        salt,
        iv,
        ciphertext: in_out,
    })
}

/// Decrypts an envelope with `password`.
///
/// # Errors
///
/// Returns [`EnvelopeError::Auth`] if the password is wrong or the ciphertext
/// was altered.
pub fn decrypt_envelope(envelope: &Envelope, password: &str) -> Result<Vec<u8>, EnvelopeError> {
    if envelope.ciphertext.len() < TAG_LEN {
        return Err(EnvelopeError::Malformed(format!(
            "ciphertext shorter than the {TAG_LEN}-byte tag"
        )));
    }

    let key = derive_key(password, &envelope.salt).map_err(|_| EnvelopeError::Auth)?;
    let mut in_out = envelope.ciphertext.clone();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(envelope.iv),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| EnvelopeError::Auth)?;
    Ok(plaintext.to_vec())
}

/// Convenience: encrypt and serialize in one step.
///
/// # Errors
///
/// See [`encrypt_envelope`].
pub fn seal(plaintext: &[u8], password: &str) -> Result<Vec<u8>, EnvelopeError> {
    encrypt_envelope(plaintext, password).map(|e| e.to_bytes())
}

/// Convenience: parse and decrypt in one step.
///
/// # Errors
///
/// [`EnvelopeError::Malformed`] for structurally invalid bytes,
/// [`EnvelopeError::Auth`] for a wrong password.
pub fn open(bytes: &[u8], password: &str) -> Result<Vec<u8>, EnvelopeError> {
    decrypt_envelope(&Envelope::from_bytes(bytes)?, password)
}

fn derive_key(password: &str, salt: &[u8]) -> Result<LessSafeKey, EnvelopeError> {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        ITERATIONS,
        salt,
        password.as_bytes(),
        &mut key,
    );
    let unbound =
        UnboundKey::new(&AES_128_GCM, &key).map_err(|_| EnvelopeError::Internal("key setup"))?;
    Ok(LessSafeKey::new(unbound))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
