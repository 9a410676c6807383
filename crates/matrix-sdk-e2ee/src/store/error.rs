// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use thiserror::Error;
use vodozemac::{KeyError, LibolmPickleError, PickleError};

use crate::PickleKeyError;

/// A `CryptoStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// Failed to encrypt or decrypt a vodozemac pickle.
    #[error(transparent)]
    Pickle(#[from] PickleError),

    /// Failed to read a pickle that was created by libolm.
    #[error(transparent)]
    LibolmPickle(#[from] LibolmPickleError),

    /// A public key stored next to a pickle couldn't be decoded.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The store failed to (de)serialize a data type.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// An invalid Matrix identifier was stored.
    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),

    /// The pickle key of the store is invalid or couldn't be decrypted.
    #[error(transparent)]
    PickleKey(#[from] PickleKeyError),

    /// A problem with the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `CryptoStoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}
