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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod decryption;
pub mod engine;
mod error;
pub mod key_request;
pub mod metrics;
pub mod migration;
pub mod olm;
mod pickle_key;
pub mod store;
pub mod types;

pub use decryption::DecryptRoomEventUseCase;
pub use error::{ErrorKind, MegolmError, MegolmResult};
pub use migration::{CryptoStoreMigration, MigrationError, MigrationOutcome};
pub use pickle_key::{CipherTextInfo, EncryptedPickleKey, KdfInfo, PickleKey, PickleKeyError};
pub use types::{
    EncryptedEventContent, EventDecryptionResult, MessageVerificationState, RoomEvent,
    RoomKeySource, WithheldCode, WithheldInfo,
};
pub use vodozemac;

/// Super trait that is used for our store and engine traits.
///
/// Implementors have to be shareable across the tasks of a multi-threaded
/// runtime, and printable in logs.
pub trait AsyncTraitDeps: std::fmt::Debug + Send + Sync {}
impl<T: std::fmt::Debug + Send + Sync> AsyncTraitDeps for T {}

#[cfg(test)]
matrix_sdk_e2ee_test::init_tracing_for_tests!();
