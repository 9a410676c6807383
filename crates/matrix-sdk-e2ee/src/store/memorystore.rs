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

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedUserId, RoomId};
use tokio::sync::{Mutex, RwLock};

use super::{BackupKeys, Changes, CryptoStore, CrossSigningKeyExport, Result};
use crate::{
    olm::{Account, InboundGroupSession, PickledAccount, Session},
    types::WithheldInfo,
};

/// An in-memory only store that will forget all the E2EE key once it's dropped.
///
/// Olm sessions and room keys are kept as live objects, the account is kept
/// pickled.
#[derive(Default, Debug)]
pub struct MemoryStore {
    account: RwLock<Option<String>>,
    // Map of sender_key to the sessions we share with it.
    sessions: RwLock<BTreeMap<String, Vec<Session>>>,
    inbound_group_sessions: RwLock<BTreeMap<OwnedRoomId, HashMap<String, InboundGroupSession>>>,
    withheld_info: RwLock<BTreeMap<OwnedRoomId, HashMap<String, WithheldInfo>>>,
    tracked_users: RwLock<BTreeSet<OwnedUserId>>,
    backup_keys: RwLock<BackupKeys>,
    cross_signing_keys: RwLock<Option<CrossSigningKeyExport>>,
    custom_values: RwLock<HashMap<String, Vec<u8>>>,

    save_changes_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    async fn save_sessions(&self, sessions: Vec<Session>) {
        let mut stored = self.sessions.write().await;

        for session in sessions {
            let entry = stored.entry(session.sender_key().to_base64()).or_default();

            if let Some(existing) =
                entry.iter_mut().find(|s| s.session_id() == session.session_id())
            {
                *existing = session;
            } else {
                entry.push(session);
            }
        }
    }

    async fn save_inbound_group_sessions(&self, sessions: Vec<InboundGroupSession>) {
        let mut stored = self.inbound_group_sessions.write().await;

        for session in sessions {
            stored
                .entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), session);
        }
    }
}

#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        let Some(pickle) = self.account.read().await.clone() else {
            return Ok(None);
        };

        let pickle: PickledAccount = serde_json::from_str(&pickle)?;

        Ok(Some(Account::from_pickle(pickle)))
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.save_changes_lock.lock().await;

        // Serialize first so that a failure leaves the store untouched.
        let account = changes.account.map(|a| serde_json::to_string(&a.pickle())).transpose()?;

        if let Some(account) = account {
            *self.account.write().await = Some(account);
        }

        self.save_sessions(changes.sessions).await;
        self.save_inbound_group_sessions(changes.inbound_group_sessions).await;

        {
            let mut withheld_info = self.withheld_info.write().await;

            for info in changes.withheld_session_info {
                withheld_info
                    .entry(info.room_id.clone())
                    .or_default()
                    .insert(info.session_id.clone(), info);
            }
        }

        self.tracked_users.write().await.extend(changes.tracked_users);

        if let Some(backup_keys) = changes.backup_keys {
            *self.backup_keys.write().await = backup_keys;
        }

        if let Some(keys) = changes.cross_signing_keys {
            *self.cross_signing_keys.write().await = Some(keys);
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<Session>> {
        Ok(self.sessions.read().await.get(sender_key).cloned().unwrap_or_default())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .read()
            .await
            .get(room_id)
            .and_then(|sessions| sessions.get(session_id))
            .cloned())
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .read()
            .await
            .values()
            .flat_map(HashMap::values)
            .cloned()
            .collect())
    }

    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<WithheldInfo>> {
        Ok(self
            .withheld_info
            .read()
            .await
            .get(room_id)
            .and_then(|info| info.get(session_id))
            .cloned())
    }

    async fn load_tracked_users(&self) -> Result<Vec<OwnedUserId>> {
        Ok(self.tracked_users.read().await.iter().cloned().collect())
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        Ok(self.backup_keys.read().await.clone())
    }

    async fn load_cross_signing_keys(&self) -> Result<Option<CrossSigningKeyExport>> {
        Ok(self.cross_signing_keys.read().await.clone())
    }

    async fn get_custom_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.custom_values.read().await.get(key).cloned())
    }

    async fn set_custom_value(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.custom_values.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove_custom_value(&self, key: &str) -> Result<()> {
        self.custom_values.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use matrix_sdk_e2ee_test::{megolm::OutboundRoomKey, ALICE};
    use ruma::{device_id, room_id, user_id};
    use similar_asserts::assert_eq;

    use crate::{
        olm::Account,
        store::{BackupKeys, Changes, CryptoStore, MemoryStore},
        types::{WithheldCode, WithheldInfo},
    };

    #[tokio::test]
    async fn test_account_is_restored_from_its_pickle() {
        let store = MemoryStore::new();
        assert!(store.load_account().await.unwrap().is_none());

        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let identity_keys = account.identity_keys();

        store.save_changes(Changes { account: Some(account), ..Default::default() }).await.unwrap();

        let loaded = store.load_account().await.unwrap().unwrap();
        assert_eq!(loaded.identity_keys(), identity_keys);
        assert_eq!(loaded.user_id(), user_id!("@alice:localhost"));
    }

    #[tokio::test]
    async fn test_inbound_group_sessions_are_keyed_by_room() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:localhost");
        let outbound = OutboundRoomKey::new();

        let session = crate::olm::InboundGroupSession::from_room_key(
            &outbound.sender_key(),
            &outbound.signing_key(),
            room_id,
            &outbound.session_key(),
        )
        .unwrap();
        let session_id = session.session_id().to_owned();

        store
            .save_changes(Changes { inbound_group_sessions: vec![session], ..Default::default() })
            .await
            .unwrap();

        assert!(store.get_inbound_group_session(room_id, &session_id).await.unwrap().is_some());
        assert!(store
            .get_inbound_group_session(room_id!("!other:localhost"), &session_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.get_inbound_group_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_withheld_info_and_metadata() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:localhost");

        let info = WithheldInfo {
            room_id: room_id.to_owned(),
            session_id: "session".to_owned(),
            sender_key: "9n7mdWKOjr9c4NTlG6zV8dbFtNK79q9vZADoh7nMUwA".to_owned(),
            code: WithheldCode::Blacklisted,
            reason: None,
        };

        store
            .save_changes(Changes {
                withheld_session_info: vec![info.clone()],
                tracked_users: vec![ALICE.to_owned()],
                backup_keys: Some(BackupKeys {
                    backup_version: Some("3".to_owned()),
                    recovery_key: None,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.get_withheld_info(room_id, "session").await.unwrap(), Some(info));
        assert_eq!(store.get_withheld_info(room_id, "other").await.unwrap(), None);
        assert_eq!(store.load_tracked_users().await.unwrap(), vec![ALICE.to_owned()]);
        assert_eq!(store.load_backup_keys().await.unwrap().backup_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_custom_values() {
        let store = MemoryStore::new();

        assert!(store.get_custom_value("key").await.unwrap().is_none());
        store.set_custom_value("key", b"value".to_vec()).await.unwrap();
        assert_eq!(store.get_custom_value("key").await.unwrap().as_deref(), Some(&b"value"[..]));
        store.remove_custom_value("key").await.unwrap();
        assert!(store.get_custom_value("key").await.unwrap().is_none());
    }
}
