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

use std::path::PathBuf;

use deadpool_sqlite::{CreatePoolError, InteractError, PoolError};
use matrix_sdk_e2ee::{store::CryptoStoreError, PickleKeyError};
use thiserror::Error;
use tokio::io;

/// All the errors that can occur when opening a sqlite store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpenStoreError {
    /// There's no database file at the given path.
    #[error("There's no database at {}", .0.display())]
    MissingDatabase(PathBuf),

    /// Failed to check whether the database file exists.
    #[error("Failed to access the database file")]
    Io(#[source] io::Error),

    /// Failed to create the DB's parent directory.
    #[error("Failed to create the database's parent directory")]
    CreateDir(#[source] io::Error),

    /// Failed to create the DB pool.
    #[error(transparent)]
    CreatePool(#[from] CreatePoolError),

    /// Failed to get a DB connection from the pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Failed to load the database version.
    #[error("Failed to load the database version")]
    LoadVersion(#[source] Error),

    /// The stored database version is invalid.
    #[error("Invalid database version")]
    InvalidVersion,

    /// The database version is missing.
    #[error("Missing database version")]
    MissingVersion,

    /// The database was created by a newer version of this crate.
    #[error("The database version {0} is newer than the supported one")]
    UnsupportedVersion(u8),

    /// Failed to apply migrations.
    #[error("Failed to run migrations")]
    Migration(#[source] Error),

    /// Failed to load the pickle key from the DB.
    #[error("Failed to load the pickle key from the DB")]
    LoadPickleKey(#[source] Error),

    /// Failed to save the pickle key to the DB.
    #[error("Failed to save the pickle key to the DB")]
    SavePickleKey(#[source] Error),

    /// The pickle key couldn't be created or decrypted, most likely the
    /// passphrase is wrong.
    #[error(transparent)]
    PickleKey(#[from] PickleKeyError),

    /// The database is encrypted but no passphrase was given.
    #[error("The database is encrypted, a passphrase is needed to open it")]
    MissingPassphrase,
}

/// Errors of the database layer.
#[derive(Error, Debug)]
pub enum Error {
    /// An error of SQLite itself.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to get a DB connection from the pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The task running the database operation panicked.
    #[error("The database task panicked")]
    InteractPanic,

    /// The task running the database operation was aborted.
    #[error("The database task was aborted")]
    InteractAborted,

    /// A stored value couldn't be encoded or decoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An encrypted value couldn't be encoded.
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),

    /// An encrypted value couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),

    /// A value couldn't be encrypted.
    #[error("Failed to encrypt a value")]
    Encryption,

    /// A value couldn't be decrypted, or was encrypted in an unknown format.
    #[error("Failed to decrypt a value")]
    Decryption,

    /// The legacy store holds metadata but no account.
    #[error("The legacy store doesn't contain an account")]
    MissingAccount,

    /// The legacy store uses a pickle format we don't know about.
    #[error("Unknown pickle format {0:?}")]
    UnknownPickleFormat(String),

    /// An error of the crypto layer.
    #[error(transparent)]
    Crypto(#[from] CryptoStoreError),
}

impl From<InteractError> for Error {
    fn from(value: InteractError) -> Self {
        match value {
            InteractError::Panic(_) => Self::InteractPanic,
            _ => Self::InteractAborted,
        }
    }
}

impl From<Error> for CryptoStoreError {
    fn from(value: Error) -> Self {
        match value {
            Error::Crypto(c) => c,
            Error::Json(e) => CryptoStoreError::Serialization(e),
            e => CryptoStoreError::backend(e),
        }
    }
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
