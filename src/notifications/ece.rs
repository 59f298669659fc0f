//! Message encryption for Web Push (RFC 8291 over RFC 8188 `aes128gcm`).
//!
//! Each call generates a fresh ephemeral P-256 keypair and salt, so two
//! encryptions of the same plaintext for the same subscriber never share
//! key material.
//!
//! # Record layout
//!
//! ```text
//! salt (16) | rs (4, big-endian) | idlen (1) = 65 | keyid (65) | ciphertext || tag (16)
//! ```
//!
//! `keyid` is the ephemeral public key. A single record is produced; the
//! plaintext is terminated by the `0x02` last-record delimiter and not padded
//! further.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use bytes::Bytes;
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::error::CryptoError;
use super::vapid::PUBLIC_KEY_LEN;
use super::{decode_base64_any, PayloadEncryptor};

/// Record size written into the header.
pub const RECORD_SIZE: u32 = 4096;

/// Salt length.
pub const SALT_LEN: usize = 16;

/// Subscriber auth secret length.
pub const AUTH_SECRET_LEN: usize = 16;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Header length: salt + rs + idlen + keyid.
pub const HEADER_LEN: usize = SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN;

/// Last-record padding delimiter.
pub const PADDING_DELIMITER: u8 = 0x02;

/// Largest plaintext that fits in one record of [`RECORD_SIZE`].
pub const MAX_PLAINTEXT_LEN: usize = RECORD_SIZE as usize - TAG_LEN - 1;

const CONTENT_ENCODING: &str = "aes128gcm";
const KEY_INFO_PREFIX: &[u8] = b"WebPush: info\0";
const CEK_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";
const CEK_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const IKM_LEN: usize = 32;

/// A subscriber's push keys: the `p256dh` point and the `auth` secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SubscriberKeys {
    #[zeroize(skip)]
    public_key: [u8; PUBLIC_KEY_LEN],
    auth_secret: [u8; AUTH_SECRET_LEN],
}

impl std::fmt::Debug for SubscriberKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberKeys").finish_non_exhaustive()
    }
}

impl SubscriberKeys {
    /// Validate raw key bytes.
    ///
    /// The public key must be 65 bytes with the uncompressed-point marker;
    /// curve membership is checked at encryption time.
    pub fn new(public_key: &[u8], auth_secret: &[u8]) -> Result<Self, CryptoError> {
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidSubscriberKey(format!(
                "p256dh must be {PUBLIC_KEY_LEN} bytes, got {}",
                public_key.len()
            )));
        }
        if public_key[0] != 0x04 {
            return Err(CryptoError::InvalidSubscriberKey(
                "p256dh is not an uncompressed point".to_string(),
            ));
        }
        if auth_secret.len() != AUTH_SECRET_LEN {
            return Err(CryptoError::InvalidSharedSecret(format!(
                "auth secret must be {AUTH_SECRET_LEN} bytes, got {}",
                auth_secret.len()
            )));
        }

        let mut keys = Self {
            public_key: [0u8; PUBLIC_KEY_LEN],
            auth_secret: [0u8; AUTH_SECRET_LEN],
        };
        keys.public_key.copy_from_slice(public_key);
        keys.auth_secret.copy_from_slice(auth_secret);
        Ok(keys)
    }

    /// Decode from the base64 strings a browser reports (either alphabet,
    /// padded or not).
    pub fn from_base64(p256dh: &str, auth: &str) -> Result<Self, CryptoError> {
        let public_key = decode_base64_any(p256dh)
            .map_err(|e| CryptoError::InvalidSubscriberKey(format!("p256dh is not base64: {e}")))?;
        let auth_secret = Zeroizing::new(
            decode_base64_any(auth)
                .map_err(|e| CryptoError::InvalidSharedSecret(format!("auth is not base64: {e}")))?,
        );
        Self::new(&public_key, &auth_secret)
    }

    /// Uncompressed subscriber public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    /// Subscriber auth secret.
    pub fn auth_secret(&self) -> &[u8; AUTH_SECRET_LEN] {
        &self.auth_secret
    }
}

/// An encrypted `aes128gcm` record, ready to be used as a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord(Vec<u8>);

impl EncryptedRecord {
    /// Wrap bytes produced by an encryption backend.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw record bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Record length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record is empty (never true for a sealed record).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `rs` header field, if the record is long enough to have one.
    pub fn record_size(&self) -> Option<u32> {
        let field = self.0.get(SALT_LEN..SALT_LEN + 4)?;
        Some(u32::from_be_bytes([field[0], field[1], field[2], field[3]]))
    }

    /// Content-Encoding token for this record format.
    pub fn content_encoding(&self) -> &'static str {
        CONTENT_ENCODING
    }

    /// Convert into a request body.
    pub fn into_body(self) -> Bytes {
        Bytes::from(self.0)
    }
}

/// Hand-rolled RFC 8291 encryptor (p256 ECDH, HKDF-SHA256, AES-128-GCM).
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes128GcmEncryptor;

impl PayloadEncryptor for Aes128GcmEncryptor {
    fn encrypt(&self, plaintext: &[u8], keys: &SubscriberKeys) -> Result<EncryptedRecord, CryptoError> {
        encrypt(plaintext, keys)
    }
}

/// Encrypt `plaintext` for one subscriber with a fresh ephemeral key and salt.
pub fn encrypt(plaintext: &[u8], keys: &SubscriberKeys) -> Result<EncryptedRecord, CryptoError> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    seal(plaintext, keys, &ephemeral, &salt)
}

/// Deterministic core of [`encrypt`].
fn seal(
    plaintext: &[u8],
    keys: &SubscriberKeys,
    ephemeral: &SecretKey,
    salt: &[u8; SALT_LEN],
) -> Result<EncryptedRecord, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(CryptoError::PayloadTooLarge {
            size: plaintext.len(),
            max: MAX_PLAINTEXT_LEN,
        });
    }

    let ua_public = PublicKey::from_sec1_bytes(keys.public_key()).map_err(|e| {
        CryptoError::InvalidSubscriberKey(format!("p256dh is not on the P-256 curve: {e}"))
    })?;
    let as_public = ephemeral.public_key().to_encoded_point(false);

    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), ua_public.as_affine());
    let ikm = derive_ikm(
        shared.raw_secret_bytes().as_slice(),
        keys.auth_secret(),
        keys.public_key(),
        as_public.as_bytes(),
    )?;
    let (cek, nonce) = derive_content_keys(ikm.as_slice(), salt)?;

    let mut padded = Zeroizing::new(Vec::with_capacity(plaintext.len() + 1));
    padded.extend_from_slice(plaintext);
    padded.push(PADDING_DELIMITER);

    let cipher = Aes128Gcm::new_from_slice(cek.as_slice())
        .map_err(|e| CryptoError::Encryption(format!("content key: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce.as_slice()), padded.as_slice())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    // The whole ciphertext is one record, so it must not exceed rs
    debug_assert!(ciphertext.len() <= RECORD_SIZE as usize);

    let mut record = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    record.extend_from_slice(salt);
    record.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    record.push(PUBLIC_KEY_LEN as u8);
    record.extend_from_slice(as_public.as_bytes());
    record.extend_from_slice(&ciphertext);
    Ok(EncryptedRecord::from_bytes(record))
}

/// Open a record as the subscriber would.
///
/// `ua_private` is the subscriber's private key, which this system never
/// holds in production; this exists for round-trip checks and diagnostics.
pub fn decrypt(
    record: &[u8],
    ua_private: &SecretKey,
    auth_secret: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let fail = |msg: &str| CryptoError::Decryption(msg.to_string());

    if auth_secret.len() != AUTH_SECRET_LEN {
        return Err(fail("auth secret must be 16 bytes"));
    }
    if record.len() < HEADER_LEN + TAG_LEN {
        return Err(fail("record shorter than header and tag"));
    }

    let salt = &record[..SALT_LEN];
    let rs = u32::from_be_bytes([record[16], record[17], record[18], record[19]]);
    let idlen = usize::from(record[20]);
    if idlen != PUBLIC_KEY_LEN {
        return Err(fail("key id is not an uncompressed P-256 point"));
    }
    let as_public_bytes = &record[21..HEADER_LEN];
    let ciphertext = &record[HEADER_LEN..];
    if ciphertext.len() > rs as usize {
        return Err(fail("ciphertext exceeds declared record size"));
    }

    let as_public = PublicKey::from_sec1_bytes(as_public_bytes)
        .map_err(|e| CryptoError::Decryption(format!("sender key: {e}")))?;
    let ua_public = ua_private.public_key().to_encoded_point(false);

    let shared = diffie_hellman(ua_private.to_nonzero_scalar(), as_public.as_affine());
    let ikm = derive_ikm(
        shared.raw_secret_bytes().as_slice(),
        auth_secret,
        ua_public.as_bytes(),
        as_public_bytes,
    )?;
    let (cek, nonce) = derive_content_keys(ikm.as_slice(), salt)?;

    let cipher = Aes128Gcm::new_from_slice(cek.as_slice())
        .map_err(|e| CryptoError::Decryption(format!("content key: {e}")))?;
    let mut padded = cipher
        .decrypt(Nonce::from_slice(nonce.as_slice()), ciphertext)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;

    // Strip zero padding, then the delimiter
    let end = padded
        .iter()
        .rposition(|&b| b != 0)
        .ok_or_else(|| fail("record has no padding delimiter"))?;
    if padded[end] != PADDING_DELIMITER {
        return Err(fail("record is not marked as the last record"));
    }
    padded.truncate(end);
    Ok(padded)
}

/// `IKM = HKDF(auth_secret, ecdh_secret, "WebPush: info\0" || ua_public || as_public, 32)`
fn derive_ikm(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
) -> Result<Zeroizing<[u8; IKM_LEN]>, CryptoError> {
    let mut info = Vec::with_capacity(KEY_INFO_PREFIX.len() + ua_public.len() + as_public.len());
    info.extend_from_slice(KEY_INFO_PREFIX);
    info.extend_from_slice(ua_public);
    info.extend_from_slice(as_public);

    let mut ikm = Zeroizing::new([0u8; IKM_LEN]);
    hkdf_expand(auth_secret, ecdh_secret, &info, ikm.as_mut_slice())?;
    Ok(ikm)
}

/// Content-encryption key and nonce, both salted with the record salt.
fn derive_content_keys(
    ikm: &[u8],
    salt: &[u8],
) -> Result<(Zeroizing<[u8; CEK_LEN]>, Zeroizing<[u8; NONCE_LEN]>), CryptoError> {
    let mut cek = Zeroizing::new([0u8; CEK_LEN]);
    let mut nonce = Zeroizing::new([0u8; NONCE_LEN]);
    hkdf_expand(salt, ikm, CEK_INFO, cek.as_mut_slice())?;
    hkdf_expand(salt, ikm, NONCE_INFO, nonce.as_mut_slice())?;
    Ok((cek, nonce))
}

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, out)
        .map_err(|e| CryptoError::Encryption(format!("HKDF expand: {e}")))
}
