//! Cryptographic helpers shared by the ledger core.
//!
//! Server-side operations only need public-key material:
//!
//! - parsing creator public keys from PEM (PKCS#8 or PKCS#1),
//! - verifying the RSA-SHA256 block signature over the ASCII block hash,
//! - constant-time hash comparison for the recomputation check.
//!
//! The private-key operations a client performs (sealing, signing, the
//! proof-of-work search) live in [`client`]; the server never sees a
//! private key.

use std::fmt;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::types::BlockHash;

pub mod client;

pub use client::{seal_and_mine, seal_record, open_record, sign_block_hash, SealedPayload};

/// Minimum RSA modulus size accepted at creator registration.
pub const MIN_RSA_BITS: usize = 2048;

/// Errors from key handling and signature or envelope operations.
#[derive(Debug)]
pub enum CryptoError {
    /// The PEM input did not parse as an RSA public key.
    InvalidPublicKey(String),
    /// The key modulus is below [`MIN_RSA_BITS`].
    KeyTooSmall(usize),
    /// The signature did not verify under the creator's public key.
    SignatureInvalid,
    /// AES-GCM or RSA-OAEP sealing failed.
    Seal(String),
    /// AES-GCM or RSA-OAEP opening failed (wrong key, tampered data).
    Open(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidPublicKey(msg) => write!(f, "invalid public key: {msg}"),
            CryptoError::KeyTooSmall(bits) => {
                write!(f, "RSA modulus of {bits} bits is below the {MIN_RSA_BITS}-bit minimum")
            }
            CryptoError::SignatureInvalid => write!(f, "signature verification failed"),
            CryptoError::Seal(msg) => write!(f, "sealing failed: {msg}"),
            CryptoError::Open(msg) => write!(f, "opening failed: {msg}"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Parses a PEM-encoded RSA public key.
///
/// Accepts both the PKCS#8 `PUBLIC KEY` and the PKCS#1 `RSA PUBLIC KEY`
/// envelope, since browser and CLI clients export either.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Parses a PEM key and enforces the registration minimum modulus.
pub fn parse_registration_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let key = parse_public_key_pem(pem)?;
    let bits = key_bits(&key);
    if bits < MIN_RSA_BITS {
        return Err(CryptoError::KeyTooSmall(bits));
    }
    Ok(key)
}

/// Modulus size in bits.
pub fn key_bits(key: &RsaPublicKey) -> usize {
    key.n().bits()
}

/// Modulus size in bytes; the length of an OAEP-wrapped data key under
/// this key (256 for RSA-2048).
pub fn key_size_bytes(key: &RsaPublicKey) -> usize {
    key.size()
}

/// Verifies the RSA-SHA256 (PKCS#1 v1.5) signature over the ASCII bytes
/// of the hex block hash.
pub fn verify_block_signature(
    key: &RsaPublicKey,
    block_hash: &BlockHash,
    signature: &[u8],
) -> Result<(), CryptoError> {
    let digest = Sha256::digest(block_hash.as_str().as_bytes());
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

/// Constant-time equality for two hex hash strings.
///
/// Both inputs are fixed-length public values here, but the recomputation
/// check in the commit pipeline is specified as constant-time, so the
/// comparison must not short-circuit.
pub fn ct_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Shared 2048-bit test keypair; RSA key generation is slow enough that
/// every test binary generates it once.
#[cfg(test)]
pub(crate) mod testkeys {
    use std::sync::OnceLock;

    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    static KEYPAIR: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();

    pub fn keypair() -> &'static (RsaPrivateKey, RsaPublicKey) {
        KEYPAIR.get_or_init(|| {
            let mut rng = rand::thread_rng();
            let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA keypair");
            let public = RsaPublicKey::from(&private);
            (private, public)
        })
    }

    pub fn public_key_pem() -> String {
        keypair()
            .1
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public key PEM")
    }
}
