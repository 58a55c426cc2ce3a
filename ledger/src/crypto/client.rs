// ledger/src/crypto/client.rs

//! Client-side sealing, signing, and proof-of-work search.
//!
//! In production these operations run in the browser: the server hands out
//! the creator's public key, the tip hash, and the difficulty, and the
//! client does everything that touches plaintext or private keys. This
//! module is the reference client used by tests and tooling; it must agree
//! byte for byte with the server-side canonical hash input.
//!
//! Sealing is hybrid: a fresh 256-bit AES key encrypts the record with
//! AES-256-GCM under a 16-byte IV, and the AES key is wrapped under the
//! creator's RSA key with OAEP/SHA-256.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::types::block::canonical_timestamp;
use crate::types::{BlockDraft, BlockHash, CreatorId, DATA_IV_LEN, GENESIS_SENTINEL};

use super::CryptoError;

/// AES-256-GCM with the ledger's 16-byte IV instead of the usual 12.
type Aes256GcmWideIv = AesGcm<Aes256, U16>;

/// The three byte fields a sealed record contributes to a block.
#[derive(Clone, Debug)]
pub struct SealedPayload {
    /// Ciphertext with the 16-byte auth tag appended.
    pub encrypted_data: Vec<u8>,
    /// 16-byte AES-GCM IV.
    pub data_iv: Vec<u8>,
    /// AES key wrapped under the creator's RSA key (OAEP/SHA-256).
    pub encrypted_data_key: Vec<u8>,
}

impl SealedPayload {
    /// Total size in bytes, as declared in a block's `data_size`.
    pub fn data_size(&self) -> u64 {
        (self.encrypted_data.len() + self.data_iv.len() + self.encrypted_data_key.len()) as u64
    }
}

/// Seals a plaintext record for a creator.
pub fn seal_record(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<SealedPayload, CryptoError> {
    let mut rng = rand::thread_rng();

    let mut key = [0u8; 32];
    rng.fill_bytes(&mut key);
    let mut iv = [0u8; DATA_IV_LEN];
    rng.fill_bytes(&mut iv);

    let cipher = Aes256GcmWideIv::new(Key::<Aes256GcmWideIv>::from_slice(&key));
    let encrypted_data = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext)
        .map_err(|e| CryptoError::Seal(format!("AES-GCM encryption failed: {e}")))?;

    let encrypted_data_key = public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &key)
        .map_err(|e| CryptoError::Seal(format!("RSA-OAEP key wrap failed: {e}")))?;

    Ok(SealedPayload {
        encrypted_data,
        data_iv: iv.to_vec(),
        encrypted_data_key,
    })
}

/// Opens a sealed record with the creator's private key.
pub fn open_record(
    encrypted_data: &[u8],
    data_iv: &[u8],
    encrypted_data_key: &[u8],
    private_key: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    if data_iv.len() != DATA_IV_LEN {
        return Err(CryptoError::Open(format!(
            "IV must be {DATA_IV_LEN} bytes, got {}",
            data_iv.len()
        )));
    }

    let key = private_key
        .decrypt(Oaep::new::<Sha256>(), encrypted_data_key)
        .map_err(|e| CryptoError::Open(format!("RSA-OAEP key unwrap failed: {e}")))?;
    if key.len() != 32 {
        return Err(CryptoError::Open(format!(
            "unwrapped data key must be 32 bytes, got {}",
            key.len()
        )));
    }

    let cipher = Aes256GcmWideIv::new(Key::<Aes256GcmWideIv>::from_slice(&key));
    cipher
        .decrypt(Nonce::<U16>::from_slice(data_iv), encrypted_data)
        .map_err(|_| CryptoError::Open("AES-GCM authentication failed".to_string()))
}

/// Signs the ASCII hex block hash with RSA-SHA256 (PKCS#1 v1.5).
pub fn sign_block_hash(
    private_key: &RsaPrivateKey,
    block_hash: &BlockHash,
) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(block_hash.as_str().as_bytes());
    private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::Seal(format!("RSA signing failed: {e}")))
}

/// Searches for a nonce whose block hash satisfies the difficulty rule.
///
/// The hash input is assembled here independently of the server-side
/// [`BlockDraft::canonical_hash_input`]; the two must agree byte for byte,
/// which the tests below pin down. The invariant fields are rendered once
/// and only the nonce varies per attempt.
pub fn search_nonce(
    seal: &SealedPayload,
    previous_hash: Option<&BlockHash>,
    creator_id: CreatorId,
    difficulty: u32,
    created_at: &DateTime<Utc>,
) -> (u64, BlockHash) {
    let prefix = format!(
        "{}|{}|{}|{}",
        previous_hash.map(BlockHash::as_str).unwrap_or(GENESIS_SENTINEL),
        hex::encode(&seal.encrypted_data),
        hex::encode(&seal.data_iv),
        hex::encode(&seal.encrypted_data_key),
    );
    let suffix = format!("{}|{}|{}", canonical_timestamp(created_at), creator_id, difficulty);

    let mut nonce: u64 = 0;
    loop {
        let candidate = BlockHash::compute(&format!("{prefix}|{nonce}|{suffix}"));
        if candidate.meets_difficulty(difficulty) {
            return (nonce, candidate);
        }
        nonce += 1;
    }
}

/// Performs the full client flow: seal, proof-of-work search, sign.
///
/// Returns a [`BlockDraft`] ready for commit. `previous_hash` of `None`
/// stands for the genesis sentinel received from `prepare_mining`.
pub fn seal_and_mine(
    plaintext: &[u8],
    creator_id: CreatorId,
    public_key: &RsaPublicKey,
    private_key: &RsaPrivateKey,
    previous_hash: Option<BlockHash>,
    difficulty: u32,
    created_at: DateTime<Utc>,
) -> Result<BlockDraft, CryptoError> {
    let started = std::time::Instant::now();

    let seal = seal_record(plaintext, public_key)?;
    let (nonce, block_hash) =
        search_nonce(&seal, previous_hash.as_ref(), creator_id, difficulty, &created_at);
    let signature = sign_block_hash(private_key, &block_hash)?;

    let data_size = seal.data_size();
    Ok(BlockDraft {
        creator_id: Some(creator_id),
        previous_hash,
        block_hash,
        nonce,
        difficulty,
        encrypted_data: seal.encrypted_data,
        data_iv: seal.data_iv,
        encrypted_data_key: seal.encrypted_data_key,
        data_size,
        signature,
        created_at,
        mining_duration_ms: Some(started.elapsed().as_millis() as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{testkeys, verify_block_signature};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn fixed_creator() -> CreatorId {
        CreatorId(Uuid::parse_str("b17f2a44-51a3-4f4e-8a30-0fd3788c3c0d").unwrap())
    }

    fn fixed_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn seal_then_open_round_trips() {
        let (private, public) = testkeys::keypair();
        let plaintext = b"the vault combination is 12-34-56";

        let seal = seal_record(plaintext, public).expect("seal");
        assert_eq!(seal.data_iv.len(), DATA_IV_LEN);
        assert_eq!(seal.encrypted_data_key.len(), 256);
        assert!(seal.encrypted_data.len() >= plaintext.len() + 16);

        let opened =
            open_record(&seal.encrypted_data, &seal.data_iv, &seal.encrypted_data_key, private)
                .expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (private, public) = testkeys::keypair();
        let mut seal = seal_record(b"secret", public).expect("seal");

        let last = seal.encrypted_data.len() - 1;
        seal.encrypted_data[last] ^= 0x01;

        let err =
            open_record(&seal.encrypted_data, &seal.data_iv, &seal.encrypted_data_key, private);
        assert!(matches!(err, Err(CryptoError::Open(_))));
    }

    #[test]
    fn open_rejects_wrong_iv_length() {
        let (private, public) = testkeys::keypair();
        let seal = seal_record(b"secret", public).expect("seal");

        let short_iv = &seal.data_iv[..15];
        let err = open_record(&seal.encrypted_data, short_iv, &seal.encrypted_data_key, private);
        assert!(matches!(err, Err(CryptoError::Open(_))));
    }

    #[test]
    fn client_hash_input_matches_server_reconstruction() {
        let (private, public) = testkeys::keypair();
        let draft = seal_and_mine(
            b"parity check",
            fixed_creator(),
            public,
            private,
            None,
            1,
            fixed_timestamp(),
        )
        .expect("seal and mine");

        // The server rebuilds the input from the payload; it must land on
        // the exact hash the client mined.
        assert_eq!(draft.compute_hash(), draft.block_hash);
    }

    #[test]
    fn mined_draft_satisfies_pow_and_signature() {
        let (private, public) = testkeys::keypair();
        let difficulty = 2;

        let draft = seal_and_mine(
            b"hello",
            fixed_creator(),
            public,
            private,
            Some(BlockHash::compute("tip")),
            difficulty,
            fixed_timestamp(),
        )
        .expect("seal and mine");

        assert!(draft.block_hash.meets_difficulty(difficulty));
        verify_block_signature(public, &draft.block_hash, &draft.signature).expect("signature");
        assert_eq!(draft.data_size, draft.measured_size());
    }

    #[test]
    fn nonce_search_respects_difficulty_one() {
        let (_, public) = testkeys::keypair();
        let seal = seal_record(b"x", public).expect("seal");

        let (_, hash) = search_nonce(&seal, None, fixed_creator(), 1, &fixed_timestamp());
        assert!(hash.meets_difficulty(1));
    }
}
