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

use async_trait::async_trait;
use ruma::{OwnedUserId, RoomId};

use super::{BackupKeys, Changes, CrossSigningKeyExport, Result};
use crate::{
    olm::{Account, InboundGroupSession, Session},
    types::WithheldInfo,
    AsyncTraitDeps,
};

/// Represents a store that the decryption pipeline uses to store E2EE data
/// (such as cryptographic keys).
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait CryptoStore: AsyncTraitDeps {
    /// Load an account that was previously stored.
    async fn load_account(&self) -> Result<Option<Account>>;

    /// Save the set of changes to the store.
    ///
    /// All the changes are committed at once, either all of them end up in
    /// the store or none of them do.
    ///
    /// # Arguments
    ///
    /// * `changes` - The set of changes that should be stored.
    async fn save_changes(&self, changes: Changes) -> Result<()>;

    /// Get all the Olm sessions that belong to the given sender key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The sender key that was used to establish the sessions.
    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<Session>>;

    /// Get the inbound group session from our store.
    ///
    /// # Arguments
    /// * `room_id` - The room id of the room that the session belongs to.
    ///
    /// * `session_id` - The unique id of the session.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get all the inbound group sessions we have stored.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Get the withheld info the creator of a room key sent us, if any.
    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<WithheldInfo>>;

    /// Load the list of users whose devices we are tracking.
    async fn load_tracked_users(&self) -> Result<Vec<OwnedUserId>>;

    /// Get the backup version and recovery key, if a backup was set up.
    async fn load_backup_keys(&self) -> Result<BackupKeys>;

    /// Load the private cross-signing keys, if we have them.
    async fn load_cross_signing_keys(&self) -> Result<Option<CrossSigningKeyExport>>;

    /// Get arbitrary data from the store.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to fetch data for
    async fn get_custom_value(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Put arbitrary data into the store.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to insert data into
    ///
    /// * `value` - The value to insert
    async fn set_custom_value(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove arbitrary data from the store.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to remove data from
    async fn remove_custom_value(&self, key: &str) -> Result<()>;
}

/// A type-erased [`CryptoStore`].
pub type DynCryptoStore = dyn CryptoStore;
