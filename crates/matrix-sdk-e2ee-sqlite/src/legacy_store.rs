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

//! Read access to the SQLite database of a legacy, libolm based, client.

use std::path::Path;

use async_trait::async_trait;
use deadpool_sqlite::{Pool as SqlitePool, Runtime};
use matrix_sdk_e2ee::{
    migration::{
        LegacyCryptoStore, LegacyPickleFormat, LegacySnapshot, PickledAccount,
        PickledInboundGroupSession, PickledSession,
    },
    store::{CrossSigningKeyExport, CryptoStoreError},
};
use rusqlite::{OptionalExtension, Row, Transaction};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    error::{Error, Result},
    utils::SqliteAsyncConnExt,
    OpenStoreError,
};

/// The crypto database of a legacy client, which can be migrated into a
/// [`SqliteCryptoStore`] with a [`CryptoStoreMigration`].
///
/// The legacy database is only ever read.
///
/// [`SqliteCryptoStore`]: crate::SqliteCryptoStore
/// [`CryptoStoreMigration`]: matrix_sdk_e2ee::CryptoStoreMigration
#[derive(Clone)]
pub struct SqliteLegacyCryptoStore {
    pool: SqlitePool,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SqliteLegacyCryptoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLegacyCryptoStore").finish_non_exhaustive()
    }
}

impl SqliteLegacyCryptoStore {
    /// Open the legacy database file at the given path.
    ///
    /// Fails with [`OpenStoreError::MissingDatabase`] if there's no file at
    /// the path, no database gets created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OpenStoreError> {
        let path = path.as_ref();

        if !tokio::fs::try_exists(path).await.map_err(OpenStoreError::Io)? {
            return Err(OpenStoreError::MissingDatabase(path.to_owned()));
        }

        let cfg = deadpool_sqlite::Config::new(path);
        let pool = cfg.create_pool(Runtime::Tokio1)?;

        // Fail early if the file can't be opened.
        drop(pool.get().await?);

        Ok(Self { pool })
    }
}

#[async_trait]
impl LegacyCryptoStore for SqliteLegacyCryptoStore {
    #[instrument(skip(self))]
    async fn read_snapshot(&self) -> Result<Option<LegacySnapshot>, CryptoStoreError> {
        let conn = self.pool.get().await.map_err(Error::from)?;
        let snapshot = conn.with_transaction(read_snapshot).await?;

        if let Some(snapshot) = &snapshot {
            debug!(
                sessions = snapshot.sessions.len(),
                inbound_group_sessions = snapshot.inbound_group_sessions.len(),
                tracked_users = snapshot.tracked_users.len(),
                "Read the legacy crypto store"
            );
        }

        Ok(snapshot)
    }
}

struct Metadata {
    pickle_key: Vec<u8>,
    format: String,
    user_id: String,
    device_id: String,
    backup_version: Option<String>,
    backup_recovery_key: Option<String>,
    cross_signing: CrossSigningKeyExport,
}

impl Metadata {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pickle_key: row.get(0)?,
            format: row.get(1)?,
            user_id: row.get(2)?,
            device_id: row.get(3)?,
            backup_version: row.get(4)?,
            backup_recovery_key: row.get(5)?,
            cross_signing: CrossSigningKeyExport {
                master_key: row.get(6)?,
                self_signing_key: row.get(7)?,
                user_signing_key: row.get(8)?,
            },
        })
    }
}

fn parse_format(format: &str) -> Result<LegacyPickleFormat> {
    match format {
        "libolm" => Ok(LegacyPickleFormat::Libolm),
        "vodozemac" => Ok(LegacyPickleFormat::Vodozemac),
        other => Err(Error::UnknownPickleFormat(other.to_owned())),
    }
}

fn read_snapshot(txn: &Transaction<'_>) -> Result<Option<LegacySnapshot>> {
    let has_metadata = txn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
        (),
        |row| row.get::<_, u32>(0),
    )? > 0;

    if !has_metadata {
        return Ok(None);
    }

    let Some(metadata) = txn
        .query_row(
            "SELECT pickle_key, pickle_format, user_id, device_id, backup_version, \
             backup_recovery_key, xsign_master_key, xsign_self_signing_key, \
             xsign_user_signing_key FROM metadata",
            (),
            Metadata::from_row,
        )
        .optional()?
    else {
        return Ok(None);
    };

    let format = parse_format(&metadata.format)?;

    let account = txn
        .query_row(
            "SELECT pickle, shared, uploaded_signed_key_count FROM account",
            (),
            |row| Ok((row.get::<_, String>(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .map(|(pickle, shared, uploaded_signed_key_count)| PickledAccount {
            user_id: metadata.user_id.clone(),
            device_id: metadata.device_id.clone(),
            pickle,
            shared,
            uploaded_signed_key_count,
        })
        .ok_or(Error::MissingAccount)?;

    let sessions = txn
        .prepare(
            "SELECT pickle, sender_key, created_using_fallback_key, creation_time, \
             last_use_time FROM olm_session",
        )?
        .query(())?
        .mapped(|row| {
            Ok(PickledSession {
                pickle: row.get(0)?,
                sender_key: row.get(1)?,
                created_using_fallback_key: row.get(2)?,
                creation_time: row.get(3)?,
                last_use_time: row.get(4)?,
            })
        })
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let rows = txn
        .prepare(
            "SELECT pickle, sender_key, signing_key, room_id, forwarding_chains, imported, \
             backed_up FROM inbound_group_session",
        )?
        .query(())?
        .mapped(|row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut inbound_group_sessions = Vec::with_capacity(rows.len());
    let mut unreadable_inbound_group_sessions = 0;

    for row in rows {
        let (pickle, sender_key, signing_key, room_id, chains, imported, backed_up) = row;
        let columns = (serde_json::from_str(&signing_key), serde_json::from_str(&chains));

        match columns {
            (Ok(signing_key), Ok(forwarding_chains)) => {
                inbound_group_sessions.push(PickledInboundGroupSession {
                    pickle,
                    sender_key,
                    signing_key,
                    room_id,
                    forwarding_chains,
                    imported,
                    backed_up,
                });
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(%room_id, "Skipping a room key with malformed JSON columns: {e}");
                unreadable_inbound_group_sessions += 1;
            }
        }
    }

    let tracked_users = txn
        .prepare("SELECT user_id FROM tracked_user")?
        .query(())?
        .mapped(|row| row.get(0))
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(Some(LegacySnapshot {
        pickle_key: Zeroizing::new(metadata.pickle_key),
        format,
        account,
        sessions,
        inbound_group_sessions,
        unreadable_inbound_group_sessions,
        cross_signing: metadata.cross_signing,
        backup_version: metadata.backup_version,
        backup_recovery_key: metadata.backup_recovery_key.map(Zeroizing::new),
        tracked_users,
    }))
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use assert_matches::assert_matches;
    use matrix_sdk_e2ee::{
        migration::{CryptoStoreImporter, LegacyCryptoStore, LegacyPickleFormat},
        store::{CryptoStore, MemoryStore},
        CryptoStoreMigration, MigrationError, MigrationOutcome,
    };
    use matrix_sdk_e2ee_test::legacy::{legacy_pickle_key, ACCOUNT_ED25519_KEY, LEGACY_STORE};
    use rusqlite::Connection;
    use serde_json::Value;
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::SqliteLegacyCryptoStore;
    use crate::{OpenStoreError, SqliteCryptoStore};

    const LEGACY_SCHEMA: &str = "
        CREATE TABLE metadata (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            user_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            pickle_key BLOB NOT NULL,
            pickle_format TEXT NOT NULL,
            backup_version TEXT,
            backup_recovery_key TEXT,
            xsign_master_key TEXT,
            xsign_self_signing_key TEXT,
            xsign_user_signing_key TEXT
        );
        CREATE TABLE account (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            pickle TEXT NOT NULL,
            shared INTEGER NOT NULL,
            uploaded_signed_key_count INTEGER NOT NULL
        );
        CREATE TABLE olm_session (
            session_id INTEGER PRIMARY KEY,
            sender_key TEXT NOT NULL,
            pickle TEXT NOT NULL,
            created_using_fallback_key INTEGER NOT NULL,
            creation_time TEXT NOT NULL,
            last_use_time TEXT NOT NULL
        );
        CREATE TABLE inbound_group_session (
            room_id TEXT NOT NULL,
            session_id INTEGER NOT NULL,
            sender_key TEXT NOT NULL,
            signing_key TEXT NOT NULL,
            forwarding_chains TEXT NOT NULL,
            pickle TEXT NOT NULL,
            imported INTEGER NOT NULL,
            backed_up INTEGER NOT NULL,
            PRIMARY KEY (room_id, session_id)
        );
        CREATE TABLE tracked_user (user_id TEXT PRIMARY KEY);
    ";

    fn text(value: &Value) -> &str {
        value.as_str().unwrap()
    }

    /// Write the content of the legacy fixture into a database at `path`.
    fn write_legacy_store(path: &Path, with_account: bool) {
        let store = &*LEGACY_STORE;
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(LEGACY_SCHEMA).unwrap();

        let account = &store["account"];
        let cross_signing = &store["cross_signing"];
        conn.execute(
            "INSERT INTO metadata VALUES (0, ?, ?, ?, 'libolm', ?, ?, ?, ?, ?)",
            (
                text(&account["user_id"]),
                text(&account["device_id"]),
                legacy_pickle_key(),
                text(&store["backup_version"]),
                text(&store["backup_recovery_key"]),
                text(&cross_signing["master_key"]),
                text(&cross_signing["self_signing_key"]),
                text(&cross_signing["user_signing_key"]),
            ),
        )
        .unwrap();

        if with_account {
            conn.execute(
                "INSERT INTO account VALUES (0, ?, ?, ?)",
                (
                    text(&account["pickle"]),
                    account["shared"].as_bool().unwrap(),
                    account["uploaded_signed_key_count"].as_i64().unwrap(),
                ),
            )
            .unwrap();
        }

        for (id, session) in store["sessions"].as_array().unwrap().iter().enumerate() {
            conn.execute(
                "INSERT INTO olm_session VALUES (?, ?, ?, ?, ?, ?)",
                (
                    id,
                    text(&session["sender_key"]),
                    text(&session["pickle"]),
                    session["created_using_fallback_key"].as_bool().unwrap(),
                    text(&session["creation_time"]),
                    text(&session["last_use_time"]),
                ),
            )
            .unwrap();
        }

        let inbound_group_sessions = store["inbound_group_sessions"].as_array().unwrap();
        for (id, session) in inbound_group_sessions.iter().enumerate() {
            conn.execute(
                "INSERT INTO inbound_group_session VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    text(&session["room_id"]),
                    id,
                    text(&session["sender_key"]),
                    session["signing_key"].to_string(),
                    session["forwarding_chains"].to_string(),
                    text(&session["pickle"]),
                    session["imported"].as_bool().unwrap(),
                    session["backed_up"].as_bool().unwrap(),
                ),
            )
            .unwrap();
        }

        for user_id in store["tracked_users"].as_array().unwrap() {
            conn.execute("INSERT INTO tracked_user VALUES (?)", (text(user_id),)).unwrap();
        }
    }

    fn ignore_progress(_: usize, _: usize) {}

    #[tokio::test]
    async fn test_reading_the_legacy_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        write_legacy_store(&path, true);

        let legacy = SqliteLegacyCryptoStore::open(&path).await.unwrap();
        let snapshot = legacy.read_snapshot().await.unwrap().unwrap();

        assert_eq!(snapshot.format, LegacyPickleFormat::Libolm);
        assert_eq!(*snapshot.pickle_key, legacy_pickle_key());
        assert_eq!(snapshot.account.device_id, "DEWRCMENGS");
        assert_eq!(snapshot.account.uploaded_signed_key_count, 50);
        assert_eq!(snapshot.sessions.len(), 4);
        assert_eq!(snapshot.inbound_group_sessions.len(), 2);
        assert_eq!(
            snapshot.inbound_group_sessions[0].signing_key.get("ed25519").map(String::as_str),
            Some(ACCOUNT_ED25519_KEY)
        );
        assert_eq!(snapshot.tracked_users.len(), 5);
        assert_eq!(snapshot.backup_version.as_deref(), Some("3"));
        assert!(!snapshot.cross_signing.is_empty());
    }

    #[tokio::test]
    async fn test_migrating_into_a_sqlite_store() {
        let dir = tempdir().unwrap();
        let legacy_path = dir.path().join("legacy.db");
        let store_path = dir.path().join("crypto");
        write_legacy_store(&legacy_path, true);

        let store = Arc::new(SqliteCryptoStore::open(&store_path, Some("secret")).await.unwrap());
        let migration = CryptoStoreMigration::new(
            SqliteLegacyCryptoStore::open(&legacy_path).await.unwrap(),
            CryptoStoreImporter::new(store),
        );

        let outcome = migration.migrate(&ignore_progress).await.unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                sessions: 4,
                inbound_group_sessions: 2,
                skipped_sessions: 0,
                skipped_inbound_group_sessions: 0,
            }
        );
        drop(migration);

        let store = SqliteCryptoStore::open(&store_path, Some("secret")).await.unwrap();

        let account = store.load_account().await.unwrap().unwrap();
        assert_eq!(account.ed25519_key().to_base64(), ACCOUNT_ED25519_KEY);
        assert_eq!(store.get_inbound_group_sessions().await.unwrap().len(), 2);
        assert_eq!(store.load_tracked_users().await.unwrap().len(), 4);

        let sender_key = text(&LEGACY_STORE["sessions"][0]["sender_key"]);
        assert_eq!(store.get_sessions(sender_key).await.unwrap().len(), 1);

        let backup_keys = store.load_backup_keys().await.unwrap();
        assert_eq!(backup_keys.backup_version.as_deref(), Some("3"));
        assert_eq!(
            backup_keys.recovery_key.as_deref(),
            Some(text(&LEGACY_STORE["backup_recovery_key"]))
        );

        // The legacy store is left as it was.
        let legacy = SqliteLegacyCryptoStore::open(&legacy_path).await.unwrap();
        let snapshot = legacy.read_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.sessions.len(), 4);
        assert_eq!(snapshot.account.pickle, text(&LEGACY_STORE["account"]["pickle"]));
    }

    #[tokio::test]
    async fn test_a_missing_legacy_store_is_not_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");

        let result = SqliteLegacyCryptoStore::open(&path).await;

        assert_matches!(result, Err(OpenStoreError::MissingDatabase(missing)) if missing == path);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_room_keys_with_malformed_columns_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        write_legacy_store(&path, true);

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE inbound_group_session SET signing_key = '{' WHERE session_id = 0", ())
            .unwrap();
        drop(conn);

        let legacy = SqliteLegacyCryptoStore::open(&path).await.unwrap();
        let snapshot = legacy.read_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.inbound_group_sessions.len(), 1);
        assert_eq!(snapshot.unreadable_inbound_group_sessions, 1);

        let store = Arc::new(MemoryStore::new());
        let migration = CryptoStoreMigration::new(legacy, CryptoStoreImporter::new(store));

        assert_eq!(
            migration.migrate(&ignore_progress).await.unwrap(),
            MigrationOutcome::Migrated {
                sessions: 4,
                inbound_group_sessions: 1,
                skipped_sessions: 0,
                skipped_inbound_group_sessions: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_an_empty_legacy_store_needs_no_migration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        Connection::open(&path).unwrap().execute_batch("CREATE TABLE unrelated (id);").unwrap();
        let store = Arc::new(MemoryStore::new());

        let migration = CryptoStoreMigration::new(
            SqliteLegacyCryptoStore::open(&path).await.unwrap(),
            CryptoStoreImporter::new(store.clone()),
        );

        assert_eq!(migration.migrate(&ignore_progress).await.unwrap(), MigrationOutcome::NotNeeded);
        assert!(store.load_account().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_a_legacy_store_without_an_account_fails_the_migration() {
        let dir = tempdir().unwrap();
        let legacy_path = dir.path().join("legacy.db");
        write_legacy_store(&legacy_path, false);

        let store =
            Arc::new(SqliteCryptoStore::open(dir.path().join("crypto"), None).await.unwrap());
        let migration = CryptoStoreMigration::new(
            SqliteLegacyCryptoStore::open(&legacy_path).await.unwrap(),
            CryptoStoreImporter::new(store.clone()),
        );

        assert_matches!(
            migration.migrate(&ignore_progress).await,
            Err(MigrationError::LegacyStore(_))
        );
        assert!(store.load_account().await.unwrap().is_none());
    }
}
