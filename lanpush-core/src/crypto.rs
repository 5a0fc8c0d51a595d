//! Password-derived symmetric encryption for peer connections.
//!
//! AES-256-CBC with PKCS#7 padding. Key and IV are both derived from the
//! shared password with PBKDF2-HMAC-SHA1 over a fixed salt, so two peers
//! that know the same password build byte-identical contexts without
//! exchanging anything.
//!
//! Every call is independent: the IV is reset for each payload and each
//! payload is padded on its own. That is what lets the transfer engine
//! encrypt file chunks one by one and the receiver decrypt them one by one
//! knowing only [`predict_cipher_length`].

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;
/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;
/// CBC initialisation vector size in bytes.
pub const IV_SIZE: usize = 16;

const KDF_SALT: [u8; 8] = [39, 28, 5, 104, 66, 15, 152, 184];
const KDF_ROUNDS: u32 = 1000;

/// Exact ciphertext length produced by [`EncryptionContext::encrypt`] for a
/// plaintext of `plain_len` bytes. PKCS#7 always adds at least one byte, so a
/// block-aligned plaintext grows by a full block.
#[must_use]
pub const fn predict_cipher_length(plain_len: usize) -> usize {
    (plain_len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

/// Key material for one connection. Read-only once built; safe to share
/// across chunk operations.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionContext {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl EncryptionContext {
    /// Derives the key and IV from `password`.
    #[must_use]
    pub fn from_password(password: &str) -> Self {
        let mut derived = [0u8; KEY_SIZE + IV_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), &KDF_SALT, KDF_ROUNDS, &mut derived);

        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&derived[..KEY_SIZE]);
        iv.copy_from_slice(&derived[KEY_SIZE..]);
        derived.zeroize();

        Self { key, iv }
    }

    #[must_use]
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    /// # Errors
    ///
    /// Fails when the ciphertext is not block aligned or its padding does
    /// not check out, which is what a wrong password looks like.
    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
