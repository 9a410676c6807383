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

use std::sync::Arc;

use async_trait::async_trait;
use ruma::{OwnedDeviceId, RoomId, UserId};
use tracing::{debug, instrument, warn};
use vodozemac::{
    megolm::InboundGroupSessionPickle,
    olm::{Account as InnerAccount, AccountPickle, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

use super::{
    parse_timestamp, MigrationData, MigrationError, MigrationTarget, PickledInboundGroupSession,
    PickledSession, ProgressListener,
};
use crate::{
    olm::{self, Account, InboundGroupSession, Session},
    store::{BackupKeys, Changes, CryptoStoreError, DynCryptoStore},
    PickleKey,
};

/// A [`MigrationTarget`] committing the migrated data into a [`CryptoStore`].
///
/// [`CryptoStore`]: crate::store::CryptoStore
#[derive(Debug, Clone)]
pub struct CryptoStoreImporter {
    store: Arc<DynCryptoStore>,
}

impl CryptoStoreImporter {
    /// Create an importer writing into the given store.
    pub fn new(store: Arc<DynCryptoStore>) -> Self {
        Self { store }
    }
}

#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
impl MigrationTarget for CryptoStoreImporter {
    #[instrument(skip_all, fields(user_id = data.account.user_id.as_str()))]
    async fn import(
        &self,
        data: MigrationData,
        progress: &dyn ProgressListener,
    ) -> Result<(), MigrationError> {
        // The total steps here include all the sessions/inbound group sessions
        // and additionally some static number of steps:
        //
        // 1. opening the store
        // 2. the Account
        // 3. the cross signing keys
        // 4. the tracked users
        // 5. the final save operation
        let total_steps = 5 + data.sessions.len() + data.inbound_group_sessions.len();
        let mut processed_steps = 0;
        let mut step = || {
            processed_steps += 1;
            progress.on_progress(processed_steps, total_steps);
        };

        if self.store.load_account().await.map_err(MigrationError::Import)?.is_some() {
            warn!("The target store already holds an account, it will be replaced");
        }

        step();

        let account = import_account(&data)?;

        step();

        let mut sessions = Vec::with_capacity(data.sessions.len());

        for session in &data.sessions {
            sessions.push(import_session(session, &data.pickle_key)?);
            step();
        }

        let mut inbound_group_sessions = Vec::with_capacity(data.inbound_group_sessions.len());

        for session in &data.inbound_group_sessions {
            inbound_group_sessions.push(import_inbound_group_session(session, &data.pickle_key)?);
            step();
        }

        let cross_signing_keys =
            (!data.cross_signing.is_empty()).then(|| data.cross_signing.clone());

        step();

        let tracked_users = data
            .tracked_users
            .iter()
            .filter_map(|user_id| match UserId::parse(user_id) {
                Ok(user_id) => Some(user_id),
                Err(e) => {
                    warn!(user_id = user_id.as_str(), "Not tracking an invalid user id: {e}");
                    None
                }
            })
            .collect();

        step();

        let backup_keys = BackupKeys {
            backup_version: data.backup_version.clone(),
            recovery_key: data.backup_recovery_key.as_deref().cloned(),
        };

        let changes = Changes {
            account: Some(account),
            sessions,
            inbound_group_sessions,
            tracked_users,
            backup_keys: Some(backup_keys),
            cross_signing_keys,
            ..Default::default()
        };

        self.store.save_changes(changes).await.map_err(MigrationError::Import)?;

        step();

        debug!("Imported the migrated data");

        Ok(())
    }
}

fn import_account(data: &MigrationData) -> Result<Account, MigrationError> {
    let user_id = UserId::parse(&data.account.user_id).map_err(CryptoStoreError::from)?;
    let device_id: OwnedDeviceId = data.account.device_id.as_str().into();
    let uploaded_signed_key_count = u64::try_from(data.account.uploaded_signed_key_count)
        .map_err(|_| {
            MigrationError::InvalidData(format!(
                "negative uploaded key count {}",
                data.account.uploaded_signed_key_count
            ))
        })?;

    let pickle = AccountPickle::from_encrypted(&data.account.pickle, data.pickle_key.as_bytes())
        .map_err(CryptoStoreError::from)?;

    Ok(Account::from_inner(
        user_id,
        device_id,
        InnerAccount::from_pickle(pickle),
        data.account.shared,
        uploaded_signed_key_count,
    ))
}

fn import_session(
    session: &PickledSession,
    pickle_key: &PickleKey,
) -> Result<Session, MigrationError> {
    let pickle = SessionPickle::from_encrypted(&session.pickle, pickle_key.as_bytes())
        .map_err(CryptoStoreError::from)?;
    let sender_key =
        Curve25519PublicKey::from_base64(&session.sender_key).map_err(CryptoStoreError::from)?;

    Ok(Session::new(
        InnerSession::from_pickle(pickle),
        sender_key,
        session.created_using_fallback_key,
        parse_timestamp(&session.creation_time)?,
        parse_timestamp(&session.last_use_time)?,
    ))
}

fn import_inbound_group_session(
    session: &PickledInboundGroupSession,
    pickle_key: &PickleKey,
) -> Result<InboundGroupSession, MigrationError> {
    let pickle = InboundGroupSessionPickle::from_encrypted(&session.pickle, pickle_key.as_bytes())
        .map_err(CryptoStoreError::from)?;

    let pickle = olm::PickledInboundGroupSession {
        pickle,
        sender_key: session.sender_key.clone(),
        signing_key: session.signing_key.clone(),
        room_id: RoomId::parse(&session.room_id).map_err(CryptoStoreError::from)?,
        forwarding_chains: session.forwarding_chains.clone(),
        imported: session.imported,
        backed_up: session.backed_up,
    };

    InboundGroupSession::from_pickle(pickle).map_err(|e| MigrationError::Pickle(e.into()))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use matrix_sdk_e2ee_test::ALICE;
    use vodozemac::olm::Account as InnerAccount;
    use zeroize::Zeroizing;

    use super::CryptoStoreImporter;
    use crate::{
        migration::{MigrationData, MigrationError, MigrationTarget, PickledAccount, PickledSession},
        store::{CryptoStore, MemoryStore},
        PickleKey,
    };

    fn migration_data(pickle_key: PickleKey) -> MigrationData {
        let account = InnerAccount::new();

        MigrationData {
            account: PickledAccount {
                user_id: ALICE.to_string(),
                device_id: "ALICEDEVICE".to_owned(),
                pickle: account.pickle().encrypt(pickle_key.as_bytes()),
                shared: true,
                uploaded_signed_key_count: 10,
            },
            sessions: Vec::new(),
            inbound_group_sessions: Vec::new(),
            pickle_key,
            backup_version: Some("1".to_owned()),
            backup_recovery_key: Some(Zeroizing::new("EsT recovery key".to_owned())),
            cross_signing: Default::default(),
            tracked_users: vec![ALICE.to_string(), "not a user id".to_owned()],
        }
    }

    #[tokio::test]
    async fn test_import_reports_every_step() {
        let store = Arc::new(MemoryStore::new());
        let importer = CryptoStoreImporter::new(store.clone());

        let steps = Mutex::new(Vec::new());
        let listener =
            |processed: usize, total: usize| steps.lock().unwrap().push((processed, total));

        importer.import(migration_data(PickleKey::new()), &listener).await.unwrap();

        assert_eq!(*steps.lock().unwrap(), (1..=5).map(|step| (step, 5)).collect::<Vec<_>>());

        let account = store.load_account().await.unwrap().unwrap();
        assert_eq!(account.uploaded_key_count(), 10);
        assert_eq!(store.load_tracked_users().await.unwrap(), vec![ALICE.to_owned()]);
        assert_eq!(
            store.load_backup_keys().await.unwrap().recovery_key.as_deref(),
            Some("EsT recovery key")
        );
        assert!(store.load_cross_signing_keys().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nothing_is_committed_on_failure() {
        let store = Arc::new(MemoryStore::new());
        let importer = CryptoStoreImporter::new(store.clone());

        let mut data = migration_data(PickleKey::new());
        data.sessions.push(PickledSession {
            pickle: "garbage".to_owned(),
            sender_key: "garbage".to_owned(),
            created_using_fallback_key: false,
            creation_time: "0".to_owned(),
            last_use_time: "0".to_owned(),
        });

        let result = importer.import(data, &|_: usize, _: usize| {}).await;

        assert_matches!(result, Err(MigrationError::Pickle(_)));
        assert!(store.load_account().await.unwrap().is_none());
    }
}
