// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use deadpool_sqlite::{Object as SqliteAsyncConn, Pool as SqlitePool, Runtime};
use matrix_sdk_e2ee::{
    olm::{
        Account, InboundGroupSession, PickledAccount, PickledInboundGroupSession,
        PickledSession, Session,
    },
    store::{
        BackupKeys, Changes, CrossSigningKeyExport, CryptoStore, Result as StoreResult,
    },
    EncryptedPickleKey, PickleKey, WithheldInfo,
};
use ruma::{OwnedUserId, RoomId};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{fs, sync::Mutex};
use tracing::{debug, instrument};

use crate::{
    cipher::StoreCipher,
    error::{Error, Result},
    utils::{
        load_db_version, set_db_version, Key, SqliteAsyncConnExt, SqliteConnectionExt,
        SqliteObjectStoreExt,
    },
    OpenStoreError,
};

/// The database name.
const DATABASE_NAME: &str = "matrix-sdk-e2ee.sqlite3";

const DATABASE_VERSION: u8 = 1;

/// Key of the passphrase-encrypted pickle key in the key/value table.
const PICKLE_KEY: &str = "pickle_key";
const ACCOUNT: &str = "account";
const BACKUP_KEYS: &str = "backup_keys";
const CROSS_SIGNING_KEYS: &str = "cross_signing_keys";

fn custom_value_key(key: &str) -> String {
    format!("custom_value::{key}")
}

/// A sqlite based crypto store.
#[derive(Clone)]
pub struct SqliteCryptoStore {
    cipher: Option<Arc<StoreCipher>>,
    pool: SqlitePool,
    save_changes_lock: Arc<Mutex<()>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteCryptoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCryptoStore")
            .field("encrypted", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteCryptoStore {
    /// Open the sqlite-based crypto store in the given directory, using the
    /// given passphrase to encrypt private data.
    ///
    /// The first time a store is opened with a passphrase, a random pickle key
    /// is generated and stored encrypted with the passphrase. The same
    /// passphrase has to be used to open the store from then on.
    pub async fn open(
        path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<Self, OpenStoreError> {
        Self::open_at(path.as_ref(), passphrase).await
    }

    #[instrument(skip(passphrase))]
    async fn open_at(path: &Path, passphrase: Option<&str>) -> Result<Self, OpenStoreError> {
        fs::create_dir_all(path).await.map_err(OpenStoreError::CreateDir)?;

        let cfg = deadpool_sqlite::Config::new(path.join(DATABASE_NAME));
        let pool = cfg.create_pool(Runtime::Tokio1)?;

        Self::open_with_pool(pool, passphrase).await
    }

    /// Create a sqlite-based crypto store using the given sqlite database
    /// pool. The given passphrase will be used to encrypt private data.
    async fn open_with_pool(
        pool: SqlitePool,
        passphrase: Option<&str>,
    ) -> Result<Self, OpenStoreError> {
        let conn = pool.get().await?;

        let version = load_db_version(&conn).await?;
        debug!("Opened sqlite store with version {version}");
        run_migrations(&conn, version).await?;

        let cipher = load_or_create_cipher(&conn, passphrase).await?;

        Ok(Self { cipher: cipher.map(Arc::new), pool, save_changes_lock: Default::default() })
    }

    fn encode_key(&self, table: &str, key: impl AsRef<[u8]>) -> Key {
        let bytes = key.as_ref();

        match &self.cipher {
            Some(cipher) => Key::Hashed(cipher.hash_key(table, bytes)),
            None => Key::Plain(bytes.to_owned()),
        }
    }

    fn serialize_value(&self, value: &impl Serialize) -> Result<Vec<u8>> {
        match &self.cipher {
            Some(cipher) => {
                let serialized = zeroize::Zeroizing::new(serde_json::to_vec(value)?);
                cipher.encrypt_value_data(&serialized)
            }
            None => Ok(serde_json::to_vec(value)?),
        }
    }

    fn deserialize_value<T: DeserializeOwned>(&self, value: &[u8]) -> Result<T> {
        match &self.cipher {
            Some(cipher) => Ok(serde_json::from_slice(&cipher.decrypt_value_data(value)?)?),
            None => Ok(serde_json::from_slice(value)?),
        }
    }

    fn deserialize_session(&self, value: &[u8]) -> StoreResult<Session> {
        let pickle: PickledSession = self.deserialize_value(value)?;
        Ok(Session::from_pickle(pickle)?)
    }

    fn deserialize_inbound_group_session(
        &self,
        value: &[u8],
    ) -> StoreResult<InboundGroupSession> {
        let pickle: PickledInboundGroupSession = self.deserialize_value(value)?;
        Ok(InboundGroupSession::from_pickle(pickle)?)
    }

    async fn acquire(&self) -> Result<SqliteAsyncConn> {
        Ok(self.pool.get().await?)
    }

    async fn get_kv_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.acquire()
            .await?
            .get_kv(key)
            .await?
            .map(|value| self.deserialize_value(&value))
            .transpose()
    }

    async fn select_all(&self, sql: &'static str, params: Vec<Key>) -> Result<Vec<Vec<u8>>> {
        self.acquire()
            .await?
            .prepare(sql, move |mut stmt| {
                stmt.query(rusqlite::params_from_iter(params))?.mapped(|row| row.get(0)).collect()
            })
            .await
    }
}

/// Run migrations for the given version of the database.
async fn run_migrations(conn: &SqliteAsyncConn, version: u8) -> Result<(), OpenStoreError> {
    if version == 0 {
        debug!("Creating database");
    } else if version < DATABASE_VERSION {
        debug!(version, new_version = DATABASE_VERSION, "Upgrading database");
    } else if version > DATABASE_VERSION {
        return Err(OpenStoreError::UnsupportedVersion(version));
    } else {
        return Ok(());
    }

    if version < 1 {
        // First turn on WAL mode, this can't be done in the transaction, it fails with
        // the error message: "cannot change into wal mode from within a transaction".
        conn.execute_batch("PRAGMA journal_mode = wal;")
            .await
            .map_err(OpenStoreError::Migration)?;
        conn.with_transaction(|txn| {
            txn.execute_batch(include_str!("../migrations/crypto_store/001_init.sql"))?;
            set_db_version(txn, 1)?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(OpenStoreError::Migration)?;
    }

    Ok(())
}

/// Load the pickle key of the store, or create one if the store is new.
async fn load_or_create_cipher(
    conn: &SqliteAsyncConn,
    passphrase: Option<&str>,
) -> Result<Option<StoreCipher>, OpenStoreError> {
    let stored = conn.get_kv(PICKLE_KEY).await.map_err(OpenStoreError::LoadPickleKey)?;

    let pickle_key = match (passphrase, stored) {
        (None, None) => return Ok(None),
        (None, Some(_)) => return Err(OpenStoreError::MissingPassphrase),
        (Some(passphrase), Some(stored)) => {
            let encrypted: EncryptedPickleKey = rmp_serde::from_slice(&stored)
                .map_err(|e| OpenStoreError::LoadPickleKey(e.into()))?;

            PickleKey::from_encrypted(passphrase, encrypted)?
        }
        (Some(passphrase), None) => {
            debug!("Creating a new pickle key");

            let pickle_key = PickleKey::new();
            let encrypted = rmp_serde::to_vec_named(&pickle_key.encrypt(passphrase)?)
                .map_err(|e| OpenStoreError::SavePickleKey(e.into()))?;
            conn.set_kv(PICKLE_KEY, encrypted).await.map_err(OpenStoreError::SavePickleKey)?;

            pickle_key
        }
    };

    Ok(Some(StoreCipher::new(pickle_key)))
}

trait SqliteCryptoConnectionExt {
    fn set_session(&self, session_id: &Key, sender_key: &Key, data: &[u8]) -> rusqlite::Result<()>;

    fn set_inbound_group_session(
        &self,
        room_id: &Key,
        session_id: &Key,
        data: &[u8],
    ) -> rusqlite::Result<()>;

    fn set_withheld_info(&self, room_id: &Key, session_id: &Key, data: &[u8])
        -> rusqlite::Result<()>;

    fn set_tracked_user(&self, user_id: &Key, data: &[u8]) -> rusqlite::Result<()>;
}

impl SqliteCryptoConnectionExt for rusqlite::Connection {
    fn set_session(
        &self,
        session_id: &Key,
        sender_key: &Key,
        data: &[u8],
    ) -> rusqlite::Result<()> {
        self.execute(
            "INSERT INTO session (session_id, sender_key, data)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (session_id) DO UPDATE SET data = ?3",
            (session_id, sender_key, data),
        )?;
        Ok(())
    }

    fn set_inbound_group_session(
        &self,
        room_id: &Key,
        session_id: &Key,
        data: &[u8],
    ) -> rusqlite::Result<()> {
        self.execute(
            "INSERT INTO inbound_group_session (room_id, session_id, data)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (room_id, session_id) DO UPDATE SET data = ?3",
            (room_id, session_id, data),
        )?;
        Ok(())
    }

    fn set_withheld_info(
        &self,
        room_id: &Key,
        session_id: &Key,
        data: &[u8],
    ) -> rusqlite::Result<()> {
        self.execute(
            "INSERT INTO withheld_info (room_id, session_id, data)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (room_id, session_id) DO UPDATE SET data = ?3",
            (room_id, session_id, data),
        )?;
        Ok(())
    }

    fn set_tracked_user(&self, user_id: &Key, data: &[u8]) -> rusqlite::Result<()> {
        self.execute(
            "INSERT INTO tracked_user (user_id, data)
             VALUES (?1, ?2)
             ON CONFLICT (user_id) DO UPDATE SET data = ?2",
            (user_id, data),
        )?;
        Ok(())
    }
}

#[async_trait]
impl CryptoStore for SqliteCryptoStore {
    async fn load_account(&self) -> StoreResult<Option<Account>> {
        let pickle: Option<PickledAccount> = self.get_kv_value(ACCOUNT).await?;
        Ok(pickle.map(Account::from_pickle))
    }

    #[instrument(skip_all)]
    async fn save_changes(&self, changes: Changes) -> StoreResult<()> {
        // Serialize calls to `save_changes`, the sessions are pickled before the
        // transaction starts.
        let _guard = self.save_changes_lock.lock().await;

        let account =
            changes.account.as_ref().map(|a| self.serialize_value(&a.pickle())).transpose()?;

        let mut sessions = Vec::with_capacity(changes.sessions.len());

        for session in &changes.sessions {
            let pickle = session.pickle().await;
            sessions.push((
                self.encode_key("session", session.session_id()),
                self.encode_key("session", &pickle.sender_key),
                self.serialize_value(&pickle)?,
            ));
        }

        let mut inbound_group_sessions = Vec::with_capacity(changes.inbound_group_sessions.len());

        for session in &changes.inbound_group_sessions {
            let pickle = session.pickle().await;
            inbound_group_sessions.push((
                self.encode_key("inbound_group_session", session.room_id().as_bytes()),
                self.encode_key("inbound_group_session", session.session_id()),
                self.serialize_value(&pickle)?,
            ));
        }

        let withheld_info = changes
            .withheld_session_info
            .iter()
            .map(|info| {
                Ok((
                    self.encode_key("withheld_info", info.room_id.as_bytes()),
                    self.encode_key("withheld_info", &info.session_id),
                    self.serialize_value(info)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let tracked_users = changes
            .tracked_users
            .iter()
            .map(|user_id| {
                let key = self.encode_key("tracked_user", user_id.as_bytes());
                Ok((key, self.serialize_value(user_id)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let backup_keys =
            changes.backup_keys.as_ref().map(|k| self.serialize_value(k)).transpose()?;
        let cross_signing_keys =
            changes.cross_signing_keys.as_ref().map(|k| self.serialize_value(k)).transpose()?;

        debug!(
            sessions = sessions.len(),
            inbound_group_sessions = inbound_group_sessions.len(),
            "Saving changes"
        );

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                if let Some(account) = &account {
                    txn.set_kv(ACCOUNT, account)?;
                }

                for (session_id, sender_key, data) in &sessions {
                    txn.set_session(session_id, sender_key, data)?;
                }

                for (room_id, session_id, data) in &inbound_group_sessions {
                    txn.set_inbound_group_session(room_id, session_id, data)?;
                }

                for (room_id, session_id, data) in &withheld_info {
                    txn.set_withheld_info(room_id, session_id, data)?;
                }

                for (user_id, data) in &tracked_users {
                    txn.set_tracked_user(user_id, data)?;
                }

                if let Some(backup_keys) = &backup_keys {
                    txn.set_kv(BACKUP_KEYS, backup_keys)?;
                }

                if let Some(cross_signing_keys) = &cross_signing_keys {
                    txn.set_kv(CROSS_SIGNING_KEYS, cross_signing_keys)?;
                }

                Ok::<_, Error>(())
            })
            .await?;

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> StoreResult<Vec<Session>> {
        let sender_key = self.encode_key("session", sender_key);

        self.select_all("SELECT data FROM session WHERE sender_key = ?", vec![sender_key])
            .await?
            .iter()
            .map(|value| self.deserialize_session(value))
            .collect()
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> StoreResult<Option<InboundGroupSession>> {
        let room_id = self.encode_key("inbound_group_session", room_id.as_bytes());
        let session_id = self.encode_key("inbound_group_session", session_id);

        let value = self
            .acquire()
            .await?
            .query_optional_row(
                "SELECT data FROM inbound_group_session WHERE room_id = ? AND session_id = ?",
                (room_id, session_id),
                |row| row.get::<_, Vec<u8>>(0),
            )
            .await?;

        value.map(|value| self.deserialize_inbound_group_session(&value)).transpose()
    }

    async fn get_inbound_group_sessions(&self) -> StoreResult<Vec<InboundGroupSession>> {
        self.select_all("SELECT data FROM inbound_group_session", Vec::new())
            .await?
            .iter()
            .map(|value| self.deserialize_inbound_group_session(value))
            .collect()
    }

    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> StoreResult<Option<WithheldInfo>> {
        let room_id = self.encode_key("withheld_info", room_id.as_bytes());
        let session_id = self.encode_key("withheld_info", session_id);

        let value = self
            .acquire()
            .await?
            .query_optional_row(
                "SELECT data FROM withheld_info WHERE room_id = ? AND session_id = ?",
                (room_id, session_id),
                |row| row.get::<_, Vec<u8>>(0),
            )
            .await?;

        Ok(value.map(|value| self.deserialize_value(&value)).transpose()?)
    }

    async fn load_tracked_users(&self) -> StoreResult<Vec<OwnedUserId>> {
        self.select_all("SELECT data FROM tracked_user", Vec::new())
            .await?
            .iter()
            .map(|value| Ok(self.deserialize_value::<OwnedUserId>(value)?))
            .collect()
    }

    async fn load_backup_keys(&self) -> StoreResult<BackupKeys> {
        Ok(self.get_kv_value(BACKUP_KEYS).await?.unwrap_or_default())
    }

    async fn load_cross_signing_keys(&self) -> StoreResult<Option<CrossSigningKeyExport>> {
        Ok(self.get_kv_value(CROSS_SIGNING_KEYS).await?)
    }

    async fn get_custom_value(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let Some(serialized) = self.acquire().await?.get_kv(&custom_value_key(key)).await? else {
            return Ok(None);
        };

        let value = match &self.cipher {
            Some(cipher) => cipher.decrypt_value_data(&serialized)?.to_vec(),
            None => serialized,
        };

        Ok(Some(value))
    }

    async fn set_custom_value(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let serialized = match &self.cipher {
            Some(cipher) => cipher.encrypt_value_data(&value)?,
            None => value,
        };

        self.acquire().await?.set_kv(&custom_value_key(key), serialized).await?;

        Ok(())
    }

    async fn remove_custom_value(&self, key: &str) -> StoreResult<()> {
        self.acquire()
            .await?
            .execute("DELETE FROM kv WHERE key = ?", (custom_value_key(key),))
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use matrix_sdk_e2ee::{
        key_request::OutgoingKeyRequestManager,
        olm::{Account, InboundGroupSession, OlmEngine, Session},
        store::{BackupKeys, Changes, CrossSigningKeyExport, CryptoStore},
        vodozemac::olm::{Account as InnerAccount, SessionConfig},
        DecryptRoomEventUseCase, PickleKeyError, RoomEvent, WithheldCode, WithheldInfo,
    };
    use matrix_sdk_e2ee_metrics::{ReportedDecryptionFailurePersistence, ReportedFailuresConfig};
    use matrix_sdk_e2ee_test::{megolm::OutboundRoomKey, ALICE, BOB};
    use ruma::{device_id, event_id, room_id, MilliSecondsSinceUnixEpoch, RoomId};
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::SqliteCryptoStore;
    use crate::OpenStoreError;

    fn room_key(outbound: &OutboundRoomKey, room_id: &RoomId) -> InboundGroupSession {
        InboundGroupSession::from_room_key(
            &outbound.sender_key(),
            &outbound.signing_key(),
            room_id,
            &outbound.session_key(),
        )
        .unwrap()
    }

    fn olm_session() -> Session {
        let mut bob = InnerAccount::new();
        bob.generate_one_time_keys(1);
        let one_time_key = *bob.one_time_keys().values().next().unwrap();

        let alice = InnerAccount::new();
        let inner = alice.create_outbound_session(
            SessionConfig::version_1(),
            bob.curve25519_key(),
            one_time_key,
        );

        let now = MilliSecondsSinceUnixEpoch::now();
        Session::new(inner, bob.curve25519_key(), false, now, now)
    }

    #[tokio::test]
    async fn test_the_passphrase_is_required_to_reopen() {
        let dir = tempdir().unwrap();
        SqliteCryptoStore::open(dir.path(), Some("secret")).await.unwrap();

        let result = SqliteCryptoStore::open(dir.path(), Some("not the secret")).await;
        assert_matches!(result, Err(OpenStoreError::PickleKey(PickleKeyError::Decryption)));

        let result = SqliteCryptoStore::open(dir.path(), None).await;
        assert_matches!(result, Err(OpenStoreError::MissingPassphrase));

        SqliteCryptoStore::open(dir.path(), Some("secret")).await.unwrap();
    }

    #[tokio::test]
    async fn test_data_survives_a_reopen() {
        let dir = tempdir().unwrap();
        let room_id = room_id!("!test:localhost");
        let mut outbound = OutboundRoomKey::new();

        let account = Account::new(&ALICE, device_id!("ALICEDEVICE"));
        let ed25519_key = account.ed25519_key().to_base64();
        let session = olm_session();
        let session_id = session.session_id().to_owned();
        let sender_key = session.sender_key().to_base64();

        let withheld = WithheldInfo {
            room_id: room_id.to_owned(),
            session_id: "withheld".to_owned(),
            sender_key: outbound.sender_key(),
            code: WithheldCode::Unverified,
            reason: Some("Device not verified".to_owned()),
        };

        let store = SqliteCryptoStore::open(dir.path(), Some("secret")).await.unwrap();
        store
            .save_changes(Changes {
                account: Some(account),
                sessions: vec![session],
                inbound_group_sessions: vec![room_key(&outbound, room_id)],
                withheld_session_info: vec![withheld.clone()],
                tracked_users: vec![BOB.to_owned()],
                backup_keys: Some(BackupKeys {
                    backup_version: Some("1".to_owned()),
                    recovery_key: Some("EsTc recovery key".to_owned()),
                }),
                cross_signing_keys: Some(CrossSigningKeyExport {
                    master_key: Some("master".to_owned()),
                    self_signing_key: None,
                    user_signing_key: None,
                }),
            })
            .await
            .unwrap();
        drop(store);

        let store = Arc::new(SqliteCryptoStore::open(dir.path(), Some("secret")).await.unwrap());

        let account = store.load_account().await.unwrap().unwrap();
        assert_eq!(account.ed25519_key().to_base64(), ed25519_key);
        assert_eq!(account.device_id(), device_id!("ALICEDEVICE"));

        let sessions = store.get_sessions(&sender_key).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id(), session_id);
        assert!(store.get_sessions(&outbound.sender_key()).await.unwrap().is_empty());

        assert_eq!(store.get_withheld_info(room_id, "withheld").await.unwrap(), Some(withheld));
        assert_eq!(store.get_withheld_info(room_id, "unknown").await.unwrap(), None);
        assert_eq!(store.load_tracked_users().await.unwrap(), vec![BOB.to_owned()]);

        let backup_keys = store.load_backup_keys().await.unwrap();
        assert_eq!(backup_keys.backup_version.as_deref(), Some("1"));
        assert_eq!(backup_keys.recovery_key.as_deref(), Some("EsTc recovery key"));
        let cross_signing = store.load_cross_signing_keys().await.unwrap().unwrap();
        assert_eq!(cross_signing.master_key.as_deref(), Some("master"));

        assert_eq!(store.get_inbound_group_sessions().await.unwrap().len(), 1);
        assert!(store
            .get_inbound_group_session(room_id!("!other:localhost"), &outbound.session_id())
            .await
            .unwrap()
            .is_none());

        let engine = Arc::new(OlmEngine::new(store.clone()));
        let use_case = DecryptRoomEventUseCase::new(
            engine,
            store.clone(),
            Arc::new(OutgoingKeyRequestManager::new()),
        );

        let json =
            outbound.encrypted_event(event_id!("$event:localhost"), room_id, &BOB, "It's a secret");
        let event: RoomEvent = serde_json::from_value(json).unwrap();

        let result = use_case.decrypt(&event, false).await.unwrap();
        assert_eq!(result.event_type(), Some("m.room.message"));
        assert_eq!(result.content().unwrap()["body"], "It's a secret");
    }

    #[tokio::test]
    async fn test_empty_unencrypted_store() {
        let dir = tempdir().unwrap();
        let store = SqliteCryptoStore::open(dir.path(), None).await.unwrap();

        assert!(store.load_account().await.unwrap().is_none());
        assert!(store.get_inbound_group_sessions().await.unwrap().is_empty());
        assert!(store.load_tracked_users().await.unwrap().is_empty());
        assert!(store.load_cross_signing_keys().await.unwrap().is_none());
        assert_eq!(store.load_backup_keys().await.unwrap().backup_version, None);
    }

    #[tokio::test]
    async fn test_custom_values() {
        let dir = tempdir().unwrap();
        let store = SqliteCryptoStore::open(dir.path(), Some("secret")).await.unwrap();

        assert_eq!(store.get_custom_value("key").await.unwrap(), None);

        store.set_custom_value("key", b"first".to_vec()).await.unwrap();
        store.set_custom_value("key", b"second".to_vec()).await.unwrap();
        assert_eq!(store.get_custom_value("key").await.unwrap().as_deref(), Some(&b"second"[..]));

        store.remove_custom_value("key").await.unwrap();
        assert_eq!(store.get_custom_value("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reported_decryption_failures_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let event_id = event_id!("$reported:localhost");

        let store = Arc::new(SqliteCryptoStore::open(dir.path(), Some("secret")).await.unwrap());
        let ledger =
            ReportedDecryptionFailurePersistence::new(store, ReportedFailuresConfig::default());
        assert!(ledger.mark_as_reported(event_id).await);
        ledger.persist().await.unwrap();
        drop(ledger);

        let store = Arc::new(SqliteCryptoStore::open(dir.path(), Some("secret")).await.unwrap());
        let ledger =
            ReportedDecryptionFailurePersistence::new(store, ReportedFailuresConfig::default());
        ledger.load().await.unwrap();

        assert!(ledger.has_been_reported(event_id).await);
        assert!(!ledger.mark_as_reported(event_id).await);
    }
}
