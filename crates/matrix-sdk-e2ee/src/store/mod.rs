// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! Types and traits to implement the storage layer for the decryption
//! pipeline.
//!
//! The storage layer persists the account, the Olm sessions, the room keys and
//! the bits of metadata that come with them. A [`MemoryStore`] is provided,
//! persistent implementations live in their own crates.
//!
//! All the writes go through [`CryptoStore::save_changes`], which commits a
//! whole [`Changes`] bundle at once.

mod error;
mod locks;
mod memorystore;
mod traits;

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use self::{
    error::{CryptoStoreError, Result},
    locks::SessionLocks,
    memorystore::MemoryStore,
    traits::{CryptoStore, DynCryptoStore},
};
use crate::{
    olm::{Account, InboundGroupSession, Session},
    types::WithheldInfo,
};

/// Aggregated changes to be saved in the store.
///
/// This is an update to be applied atomically: implementations must either
/// commit every field or none of them.
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct Changes {
    pub account: Option<Account>,
    pub sessions: Vec<Session>,
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    /// Stores when a `m.room_key.withheld` is received.
    pub withheld_session_info: Vec<WithheldInfo>,
    pub tracked_users: Vec<OwnedUserId>,
    pub backup_keys: Option<BackupKeys>,
    pub cross_signing_keys: Option<CrossSigningKeyExport>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct?
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.withheld_session_info.is_empty()
            && self.tracked_users.is_empty()
            && self.backup_keys.is_none()
            && self.cross_signing_keys.is_none()
    }
}

/// The version and the key of the server-side key backup.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BackupKeys {
    /// The version of the backup the recovery key belongs to.
    pub backup_version: Option<String>,
    /// The base58 encoded recovery key of the backup.
    pub recovery_key: Option<String>,
}

/// The private parts of the cross-signing keys, each one as an unpadded
/// base64 encoded seed.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CrossSigningKeyExport {
    /// The seed of the master key.
    pub master_key: Option<String>,
    /// The seed of the self-signing key.
    pub self_signing_key: Option<String>,
    /// The seed of the user-signing key.
    pub user_signing_key: Option<String>,
}

impl CrossSigningKeyExport {
    /// Do we have none of the private keys?
    pub fn is_empty(&self) -> bool {
        self.master_key.is_none()
            && self.self_signing_key.is_none()
            && self.user_signing_key.is_none()
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for CrossSigningKeyExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossSigningKeyExport")
            .field("has_master_key", &self.master_key.is_some())
            .field("has_self_signing_key", &self.self_signing_key.is_some())
            .field("has_user_signing_key", &self.user_signing_key.is_some())
            .finish()
    }
}
