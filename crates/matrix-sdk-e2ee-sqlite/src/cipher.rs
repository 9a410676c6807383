// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Encryption of the values, and hashing of the keys, of an encrypted store.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use matrix_sdk_e2ee::PickleKey;
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedValue {
    version: u8,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

/// Encrypts the values of the store with AES-256-GCM under the store's pickle
/// key.
pub(crate) struct StoreCipher {
    key: PickleKey,
}

impl StoreCipher {
    pub(crate) fn new(key: PickleKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()))
    }

    pub(crate) fn encrypt_value_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        thread_rng().fill_bytes(&mut nonce);

        let ciphertext =
            self.cipher().encrypt(Nonce::from_slice(&nonce), data).map_err(|_| Error::Encryption)?;

        Ok(rmp_serde::to_vec_named(&EncryptedValue {
            version: VERSION,
            nonce: nonce.to_vec(),
            ciphertext,
        })?)
    }

    pub(crate) fn decrypt_value_data(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let value: EncryptedValue = rmp_serde::from_slice(data)?;

        if value.version != VERSION || value.nonce.len() != NONCE_SIZE {
            return Err(Error::Decryption);
        }

        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&value.nonce), value.ciphertext.as_ref())
            .map_err(|_| Error::Decryption)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Hash a key of the given table, so the database doesn't leak room and
    /// session ids.
    pub(crate) fn hash_key(&self, table: &str, key: &[u8]) -> [u8; 32] {
        Sha256::new()
            .chain_update(self.key.as_bytes())
            .chain_update(table.as_bytes())
            .chain_update([0u8])
            .chain_update(key)
            .finalize()
            .into()
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for StoreCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use matrix_sdk_e2ee::PickleKey;

    use super::StoreCipher;
    use crate::error::Error;

    #[test]
    fn test_values_are_encrypted() {
        let cipher = StoreCipher::new(PickleKey::new());
        let encrypted = cipher.encrypt_value_data(b"It's a secret to everybody").unwrap();

        assert!(!encrypted.windows(6).any(|w| w == b"secret"));
        assert_eq!(
            cipher.decrypt_value_data(&encrypted).unwrap().as_slice(),
            b"It's a secret to everybody"
        );

        let other = StoreCipher::new(PickleKey::new());
        assert_matches!(other.decrypt_value_data(&encrypted), Err(Error::Decryption));
    }

    #[test]
    fn test_keys_are_hashed_per_table() {
        let cipher = StoreCipher::new(PickleKey::new());

        assert_eq!(cipher.hash_key("session", b"id"), cipher.hash_key("session", b"id"));
        assert_ne!(cipher.hash_key("session", b"id"), cipher.hash_key("tracked_user", b"id"));
        assert_ne!(
            cipher.hash_key("session", b"id"),
            StoreCipher::new(PickleKey::new()).hash_key("session", b"id")
        );
    }
}
