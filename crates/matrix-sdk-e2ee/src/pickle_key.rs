// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const KDF_SALT_SIZE: usize = 32;
#[cfg(not(test))]
const KDF_ROUNDS: u32 = 200_000;
#[cfg(test)]
const KDF_ROUNDS: u32 = 1000;

/// Error type for the creation and the decryption of a [`PickleKey`].
#[derive(Debug, Error)]
pub enum PickleKeyError {
    /// The raw key didn't have the right length.
    #[error("the pickle key has an invalid length, expected {KEY_SIZE} bytes, got {0}")]
    InvalidLength(usize),

    /// The encrypted pickle key couldn't be decrypted, most likely because the
    /// passphrase is wrong.
    #[error("failed to decrypt the pickle key")]
    Decryption,

    /// The pickle key couldn't be encrypted.
    #[error("failed to encrypt the pickle key")]
    Encryption,
}

/// Version specific info for the key derivation method that is used.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum KdfInfo {
    /// PBKDF2 with HMAC-SHA256.
    Pbkdf2 {
        /// The number of PBKDF rounds that were used when deriving the AES key.
        rounds: u32,
    },
}

/// Version specific info for encryption method that is used to encrypt our
/// pickle key.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum CipherTextInfo {
    /// AES-256 in GCM mode.
    Aes256Gcm {
        /// The nonce that was used to encrypt the ciphertext.
        nonce: Vec<u8>,
        /// The encrypted pickle key.
        ciphertext: Vec<u8>,
    },
}

/// An encrypted version of our pickle key, this can be safely stored in a
/// database.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EncryptedPickleKey {
    /// Info about the key derivation method that was used to expand the
    /// passphrase into an encryption key.
    pub kdf_info: KdfInfo,
    /// The ciphertext with it's accompanying additional data that is needed to
    /// decrypt the pickle key.
    pub ciphertext_info: CipherTextInfo,
    /// The salt that was used when the passphrase was expanded into a AES key.
    kdf_salt: Vec<u8>,
}

/// A pickle key that is used to encrypt the Olm accounts, sessions and room
/// keys when they are persisted.
///
/// The key material is zeroized once the key is dropped.
#[derive(Zeroize, ZeroizeOnDrop, PartialEq)]
pub struct PickleKey {
    aes256_key: Box<[u8; KEY_SIZE]>,
}

impl PickleKey {
    /// Generate a new random pickle key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { aes256_key: key }
    }

    /// Create a pickle key from raw bytes.
    ///
    /// Fails if `bytes` isn't exactly 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PickleKeyError> {
        let mut key = Box::new([0u8; KEY_SIZE]);

        if bytes.len() != KEY_SIZE {
            return Err(PickleKeyError::InvalidLength(bytes.len()));
        }

        key.copy_from_slice(bytes);

        Ok(Self { aes256_key: key })
    }

    /// Get the raw AES256 key.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.aes256_key
    }

    fn expand_key(passphrase: &str, salt: &[u8], rounds: u32) -> Zeroizing<[u8; KEY_SIZE]> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, key.as_mut_slice());
        key
    }

    /// Encrypt and export our pickle key using the given passphrase.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - The passphrase that should be used to encrypt the
    ///   pickle key.
    pub fn encrypt(&self, passphrase: &str) -> Result<EncryptedPickleKey, PickleKeyError> {
        let mut rng = thread_rng();

        let mut salt = vec![0u8; KDF_SALT_SIZE];
        rng.fill_bytes(&mut salt);

        let key = Self::expand_key(passphrase, &salt, KDF_ROUNDS);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));

        let mut nonce = vec![0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), self.aes256_key.as_slice())
            .map_err(|_| PickleKeyError::Encryption)?;

        Ok(EncryptedPickleKey {
            kdf_info: KdfInfo::Pbkdf2 { rounds: KDF_ROUNDS },
            kdf_salt: salt,
            ciphertext_info: CipherTextInfo::Aes256Gcm { nonce, ciphertext },
        })
    }

    /// Restore a pickle key from an encrypted export.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - The passphrase that was used to encrypt the pickle
    ///   key.
    ///
    /// * `encrypted` - The exported and encrypted version of the pickle key.
    pub fn from_encrypted(
        passphrase: &str,
        encrypted: EncryptedPickleKey,
    ) -> Result<Self, PickleKeyError> {
        let key = match encrypted.kdf_info {
            KdfInfo::Pbkdf2 { rounds } => Self::expand_key(passphrase, &encrypted.kdf_salt, rounds),
        };

        let decrypted = match encrypted.ciphertext_info {
            CipherTextInfo::Aes256Gcm { nonce, ciphertext } => {
                if nonce.len() != NONCE_SIZE {
                    return Err(PickleKeyError::Decryption);
                }

                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
                let decrypted = cipher
                    .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
                    .map_err(|_| PickleKeyError::Decryption)?;

                Zeroizing::new(decrypted)
            }
        };

        Self::from_bytes(&decrypted)
    }
}

impl Default for PickleKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickleKey").finish_non_exhaustive()
    }
}
