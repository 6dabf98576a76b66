//! Callback signing and message encryption for the messaging platform.
//!
//! Wire format of an encrypted message, before base64:
//! `AES-256-CBC(16 random bytes ‖ u32 BE length ‖ payload ‖ receiver id ‖ PKCS#7)`
//! with the IV taken from the first 16 key bytes and padding to 32-byte blocks.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const ENCODED_KEY_LEN: usize = 43;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;
const PAD_BLOCK: usize = 32;

// Platform keys are random base64 text, so the last symbol may carry trailing bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("callback signature does not match")]
    SignatureInvalid,
    #[error("callback payload could not be decrypted: {0}")]
    DecryptionFailed(String),
    #[error("payload could not be encrypted: {0}")]
    EncryptionFailed(String),
    #[error("callback was encrypted for receiver `{actual}`, expected `{expected}`")]
    ReceiverMismatch { expected: String, actual: String },
    #[error("invalid callback key: {0}")]
    InvalidKey(String),
}

/// SHA-1 hex digest over the sorted concatenation of the four inputs.
pub fn signature(token: &str, timestamp: &str, nonce: &str, payload: &str) -> String {
    let mut parts = [token, timestamp, nonce, payload];
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub struct CallbackCrypto {
    token: SecretString,
    key: [u8; KEY_LEN],
    receiver_id: String,
}

impl std::fmt::Debug for CallbackCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackCrypto")
            .field("receiver_id", &self.receiver_id)
            .finish_non_exhaustive()
    }
}

impl CallbackCrypto {
    pub fn new(
        token: SecretString,
        encoded_key: &SecretString,
        receiver_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        let encoded = encoded_key.expose_secret();
        if encoded.len() != ENCODED_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {ENCODED_KEY_LEN} characters, got {}",
                encoded.len()
            )));
        }

        let decoded = KEY_ENGINE
            .decode(format!("{encoded}="))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = decoded.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::InvalidKey(format!("decoded to {} bytes", bytes.len()))
        })?;

        Ok(Self { token, key, receiver_id: receiver_id.into() })
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn sign(&self, timestamp: &str, nonce: &str, payload: &str) -> String {
        signature(self.token.expose_secret(), timestamp, nonce, payload)
    }

    pub fn verify(
        &self,
        provided: &str,
        timestamp: &str,
        nonce: &str,
        payload: &str,
    ) -> Result<(), CryptoError> {
        let expected = self.sign(timestamp, nonce, payload);
        if bool::from(expected.as_bytes().ct_eq(provided.trim().as_bytes())) {
            Ok(())
        } else {
            Err(CryptoError::SignatureInvalid)
        }
    }

    /// Verifies the signature over the encrypted text, then decrypts it.
    pub fn open(
        &self,
        provided_signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypted: &str,
    ) -> Result<String, CryptoError> {
        self.verify(provided_signature, timestamp, nonce, encrypted)?;
        self.decrypt(encrypted)
    }

    pub fn encrypt(&self, payload: &str) -> Result<String, CryptoError> {
        let mut random = [0_u8; RANDOM_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut random);
        self.encrypt_with_random(payload, random)
    }

    /// Deterministic variant of [`encrypt`](Self::encrypt) for known-answer tests.
    pub fn encrypt_with_random(
        &self,
        payload: &str,
        random: [u8; RANDOM_PREFIX_LEN],
    ) -> Result<String, CryptoError> {
        let length = u32::try_from(payload.len())
            .map_err(|_| CryptoError::EncryptionFailed("payload too large".to_string()))?;

        let unpadded =
            RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN + payload.len() + self.receiver_id.len();
        let mut buffer = Vec::with_capacity(unpadded + PAD_BLOCK);
        buffer.extend_from_slice(&random);
        buffer.extend_from_slice(&length.to_be_bytes());
        buffer.extend_from_slice(payload.as_bytes());
        buffer.extend_from_slice(self.receiver_id.as_bytes());

        let pad = PAD_BLOCK - buffer.len() % PAD_BLOCK;
        buffer.resize(buffer.len() + pad, pad as u8);

        let message_len = buffer.len();
        let cipher = Aes256CbcEnc::new(&self.key.into(), &self.iv().into());
        let encrypted = cipher
            .encrypt_padded_mut::<NoPadding>(&mut buffer, message_len)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(STANDARD.encode(encrypted))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let mut buffer = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::DecryptionFailed(format!("base64: {e}")))?;
        if buffer.is_empty() || buffer.len() % IV_LEN != 0 {
            return Err(CryptoError::DecryptionFailed(format!(
                "ciphertext length {} is not a multiple of the block size",
                buffer.len()
            )));
        }

        let cipher = Aes256CbcDec::new(&self.key.into(), &self.iv().into());
        let plain = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|e| CryptoError::DecryptionFailed(format!("decrypt: {e}")))?;
        let plain = strip_padding(plain)?;

        let header_len = RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN;
        if plain.len() < header_len {
            return Err(CryptoError::DecryptionFailed("message shorter than header".to_string()));
        }
        let mut length_bytes = [0_u8; LENGTH_FIELD_LEN];
        length_bytes.copy_from_slice(&plain[RANDOM_PREFIX_LEN..header_len]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        let body = &plain[header_len..];
        if length > body.len() {
            return Err(CryptoError::DecryptionFailed(format!(
                "declared length {length} exceeds message body {}",
                body.len()
            )));
        }
        let (payload, receiver) = body.split_at(length);

        if receiver != self.receiver_id.as_bytes() {
            return Err(CryptoError::ReceiverMismatch {
                expected: self.receiver_id.clone(),
                actual: String::from_utf8_lossy(receiver).into_owned(),
            });
        }

        String::from_utf8(payload.to_vec())
            .map_err(|e| CryptoError::DecryptionFailed(format!("payload is not UTF-8: {e}")))
    }

    fn iv(&self) -> [u8; IV_LEN] {
        let mut iv = [0_u8; IV_LEN];
        iv.copy_from_slice(&self.key[..IV_LEN]);
        iv
    }
}

fn strip_padding(plain: &[u8]) -> Result<&[u8], CryptoError> {
    let pad = plain.last().copied().map(usize::from).unwrap_or_default();
    if pad == 0 || pad > PAD_BLOCK || pad > plain.len() {
        return Err(CryptoError::DecryptionFailed(format!("invalid padding byte {pad}")));
    }
    let (message, padding) = plain.split_at(plain.len() - pad);
    if padding.iter().any(|byte| usize::from(*byte) != pad) {
        return Err(CryptoError::DecryptionFailed("inconsistent padding".to_string()));
    }
    Ok(message)
}
