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

//! Migration of the Olm and Megolm state out of a legacy crypto store.
//!
//! The migration reads a [`LegacySnapshot`] out of a [`LegacyCryptoStore`],
//! re-pickles every object under a fresh, transient [`PickleKey`] and hands
//! the resulting [`MigrationData`] to a [`MigrationTarget`], which commits it
//! into the new store in one go.
//!
//! The transient key only lives as long as the migration: the target decrypts
//! the bundle with it and re-encrypts everything with its own key.

mod import;

use std::collections::BTreeMap;

use async_trait::async_trait;
use ruma::{MilliSecondsSinceUnixEpoch, RoomId, UInt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use vodozemac::{
    megolm::{InboundGroupSession, InboundGroupSessionPickle},
    olm::{Account, AccountPickle, Session, SessionPickle},
    Curve25519PublicKey,
};
use zeroize::Zeroizing;

pub use self::import::CryptoStoreImporter;
pub use crate::store::CrossSigningKeyExport;
use crate::{store::CryptoStoreError, PickleKey};

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Debug, Deserialize, Serialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: String,
    /// The device ID of the account owner.
    pub device_id: String,
    /// The pickled version of the Olm account.
    pub pickle: String,
    /// Was the account shared.
    pub shared: bool,
    /// The number of uploaded one-time keys we have on the server.
    pub uploaded_signed_key_count: i64,
}

/// A pickled version of a `Session`.
#[derive(Debug, Deserialize, Serialize)]
pub struct PickledSession {
    /// The pickle string holding the Olm Session.
    pub pickle: String,
    /// The curve25519 key of the other user that we share this session with.
    pub sender_key: String,
    /// Was the session created using a fallback key.
    pub created_using_fallback_key: bool,
    /// The timestamp, in milliseconds, when the session was created.
    pub creation_time: String,
    /// The timestamp, in milliseconds, when the session was last used.
    pub last_use_time: String,
}

/// A pickled version of an `InboundGroupSession`.
#[derive(Debug, Deserialize, Serialize)]
pub struct PickledInboundGroupSession {
    /// The pickle string holding the InboundGroupSession.
    pub pickle: String,
    /// The public curve25519 key of the account that sent us the session
    pub sender_key: String,
    /// The public ed25519 key of the account that sent us the session.
    pub signing_key: BTreeMap<String, String>,
    /// The id of the room that the session is used in.
    pub room_id: String,
    /// The list of claimed ed25519 that forwarded us this key. Will be empty if
    /// we directly received this session.
    pub forwarding_chains: Vec<String>,
    /// Flag remembering if the session was directly sent to us by the sender
    /// or if it was imported.
    pub imported: bool,
    /// Flag remembering if the session has been backed up.
    pub backed_up: bool,
}

/// The format the pickles of a legacy store are in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LegacyPickleFormat {
    /// Pickles created by libolm.
    Libolm,
    /// Encrypted vodozemac pickles, the pickle key must be 32 bytes long.
    Vodozemac,
}

/// Everything a legacy crypto store holds, read out in a single transaction.
///
/// The pickles are in the store's own [`LegacyPickleFormat`], encrypted with
/// its `pickle_key`.
pub struct LegacySnapshot {
    /// The key the legacy pickles are encrypted with.
    pub pickle_key: Zeroizing<Vec<u8>>,
    /// The format of the legacy pickles.
    pub format: LegacyPickleFormat,
    /// The Olm account.
    pub account: PickledAccount,
    /// The Olm sessions.
    pub sessions: Vec<PickledSession>,
    /// The Megolm room keys.
    pub inbound_group_sessions: Vec<PickledInboundGroupSession>,
    /// How many room keys the legacy store couldn't even read, they count as
    /// skipped.
    pub unreadable_inbound_group_sessions: usize,
    /// The private cross-signing keys.
    pub cross_signing: CrossSigningKeyExport,
    /// The version of the active server-side key backup.
    pub backup_version: Option<String>,
    /// The recovery key of the backup, base58 encoded.
    pub backup_recovery_key: Option<Zeroizing<String>>,
    /// The users whose devices are tracked.
    pub tracked_users: Vec<String>,
}

/// Struct collecting the data that is handed to the new store.
///
/// Every pickle is a vodozemac pickle encrypted with `pickle_key`.
pub struct MigrationData {
    /// The pickled version of the Olm Account
    pub account: PickledAccount,
    /// The list of pickled Olm Sessions.
    pub sessions: Vec<PickledSession>,
    /// The list of Megolm inbound group sessions.
    pub inbound_group_sessions: Vec<PickledInboundGroupSession>,
    /// The transient key that was used to pickle all the Olm objects.
    pub pickle_key: PickleKey,
    /// The backup version that is currently active.
    pub backup_version: Option<String>,
    /// The backup recovery key, as a base58 encoded string.
    pub backup_recovery_key: Option<Zeroizing<String>>,
    /// The private cross signing keys.
    pub cross_signing: CrossSigningKeyExport,
    /// The list of users that should be tracked.
    pub tracked_users: Vec<String>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for LegacySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacySnapshot")
            .field("format", &self.format)
            .field("account", &self.account.user_id)
            .field("sessions", &self.sessions.len())
            .field("inbound_group_sessions", &self.inbound_group_sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MigrationData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationData")
            .field("account", &self.account.user_id)
            .field("sessions", &self.sessions.len())
            .field("inbound_group_sessions", &self.inbound_group_sessions.len())
            .field("backup_version", &self.backup_version)
            .finish_non_exhaustive()
    }
}

/// Error type for the migration process.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The legacy store couldn't be read.
    #[error("failed to read the legacy crypto store: {0}")]
    LegacyStore(#[source] CryptoStoreError),

    /// A pickle couldn't be decrypted, parsed or re-encrypted.
    #[error(transparent)]
    Pickle(#[from] CryptoStoreError),

    /// A field of the migrated data doesn't hold what it should.
    #[error("invalid migration data: {0}")]
    InvalidData(String),

    /// The new store failed to commit the migrated data.
    #[error("failed to import the migrated data: {0}")]
    Import(#[source] CryptoStoreError),
}

/// The result of a successful [`CryptoStoreMigration::migrate`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The legacy store is empty, there was nothing to migrate.
    NotNeeded,
    /// The legacy data was committed into the new store.
    Migrated {
        /// The number of migrated Olm sessions.
        sessions: usize,
        /// The number of migrated room keys.
        inbound_group_sessions: usize,
        /// The number of Olm sessions that couldn't be read and were left
        /// behind.
        skipped_sessions: usize,
        /// The number of room keys that couldn't be read and were left behind.
        skipped_inbound_group_sessions: usize,
    },
}

/// A callback that can be used to introspect the progress of a migration.
pub trait ProgressListener: Send + Sync {
    /// Called every time a step of the migration has been processed.
    ///
    /// # Arguments
    ///
    /// * `progress` - The number of processed steps.
    ///
    /// * `total` - The total number of steps.
    fn on_progress(&self, progress: usize, total: usize);
}

impl<F> ProgressListener for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn on_progress(&self, progress: usize, total: usize) {
        self(progress, total)
    }
}

/// The store we migrate away from.
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait LegacyCryptoStore: Send + Sync {
    /// Read the whole content of the store, in one read transaction.
    ///
    /// Returns `None` if the store doesn't hold any crypto metadata, in which
    /// case there is nothing to migrate.
    async fn read_snapshot(&self) -> Result<Option<LegacySnapshot>, CryptoStoreError>;
}

/// The store we migrate into.
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait MigrationTarget: Send + Sync {
    /// Commit the migrated data.
    ///
    /// This is the single commit point of the migration, either all of the
    /// data ends up in the new store or none of it does.
    async fn import(
        &self,
        data: MigrationData,
        progress: &dyn ProgressListener,
    ) -> Result<(), MigrationError>;
}

/// Moves the Olm and Megolm state of a legacy store into a new store.
pub struct CryptoStoreMigration<L, T> {
    legacy: L,
    target: T,
}

impl<L, T> CryptoStoreMigration<L, T>
where
    L: LegacyCryptoStore,
    T: MigrationTarget,
{
    /// Create a new migration from the `legacy` store into the `target`.
    pub fn new(legacy: L, target: T) -> Self {
        Self { legacy, target }
    }

    /// Run the migration.
    ///
    /// The account, the legacy store read and the final import either succeed
    /// or fail the whole migration. Olm sessions and room keys that can't be
    /// read are skipped.
    #[instrument(skip_all)]
    pub async fn migrate(
        &self,
        progress: &dyn ProgressListener,
    ) -> Result<MigrationOutcome, MigrationError> {
        let Some(snapshot) =
            self.legacy.read_snapshot().await.map_err(MigrationError::LegacyStore)?
        else {
            info!("The legacy crypto store is empty, nothing to migrate");
            return Ok(MigrationOutcome::NotNeeded);
        };

        info!(
            format = ?snapshot.format,
            sessions = snapshot.sessions.len(),
            inbound_group_sessions = snapshot.inbound_group_sessions.len(),
            "Migrating the legacy crypto store"
        );

        let pickle_key = PickleKey::new();
        let legacy = LegacyPickles::new(&snapshot)?;

        let account = legacy.repickle_account(&snapshot.account, &pickle_key)?;

        let mut sessions = Vec::with_capacity(snapshot.sessions.len());
        let mut skipped_sessions = 0;

        for session in &snapshot.sessions {
            match legacy.repickle_session(session, &pickle_key) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(
                        sender_key = %session.sender_key,
                        "Skipping an unreadable Olm session: {e}"
                    );
                    skipped_sessions += 1;
                }
            }
        }

        let mut inbound_group_sessions = Vec::with_capacity(snapshot.inbound_group_sessions.len());
        let mut skipped_inbound_group_sessions = snapshot.unreadable_inbound_group_sessions;

        for session in &snapshot.inbound_group_sessions {
            match legacy.repickle_inbound_group_session(session, &pickle_key) {
                Ok(session) => inbound_group_sessions.push(session),
                Err(e) => {
                    warn!(room_id = %session.room_id, "Skipping an unreadable room key: {e}");
                    skipped_inbound_group_sessions += 1;
                }
            }
        }

        let outcome = MigrationOutcome::Migrated {
            sessions: sessions.len(),
            inbound_group_sessions: inbound_group_sessions.len(),
            skipped_sessions,
            skipped_inbound_group_sessions,
        };

        let data = MigrationData {
            account,
            sessions,
            inbound_group_sessions,
            pickle_key,
            backup_version: snapshot.backup_version.clone(),
            backup_recovery_key: snapshot.backup_recovery_key.clone(),
            cross_signing: snapshot.cross_signing.clone(),
            tracked_users: snapshot.tracked_users.clone(),
        };

        self.target.import(data, progress).await?;

        debug!(?outcome, "The legacy crypto store was migrated");

        Ok(outcome)
    }
}

#[cfg(not(tarpaulin_include))]
impl<L, T> std::fmt::Debug for CryptoStoreMigration<L, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoStoreMigration").finish_non_exhaustive()
    }
}

/// Parse a timestamp in milliseconds stored as a string.
pub(crate) fn parse_timestamp(
    timestamp: &str,
) -> Result<MilliSecondsSinceUnixEpoch, MigrationError> {
    timestamp
        .trim()
        .parse::<UInt>()
        .map(MilliSecondsSinceUnixEpoch)
        .map_err(|e| MigrationError::InvalidData(format!("invalid timestamp {timestamp:?}: {e}")))
}

/// Decodes pickles in the format of a legacy store.
enum LegacyPickles<'a> {
    Libolm(&'a [u8]),
    Vodozemac(PickleKey),
}

impl<'a> LegacyPickles<'a> {
    fn new(snapshot: &'a LegacySnapshot) -> Result<Self, MigrationError> {
        Ok(match snapshot.format {
            LegacyPickleFormat::Libolm => Self::Libolm(&snapshot.pickle_key),
            LegacyPickleFormat::Vodozemac => Self::Vodozemac(
                PickleKey::from_bytes(&snapshot.pickle_key).map_err(CryptoStoreError::from)?,
            ),
        })
    }

    fn account(&self, pickle: &str) -> Result<Account, CryptoStoreError> {
        Ok(match self {
            Self::Libolm(key) => Account::from_libolm_pickle(pickle, key)?,
            Self::Vodozemac(key) => {
                Account::from_pickle(AccountPickle::from_encrypted(pickle, key.as_bytes())?)
            }
        })
    }

    fn session(&self, pickle: &str) -> Result<Session, CryptoStoreError> {
        Ok(match self {
            Self::Libolm(key) => Session::from_libolm_pickle(pickle, key)?,
            Self::Vodozemac(key) => {
                Session::from_pickle(SessionPickle::from_encrypted(pickle, key.as_bytes())?)
            }
        })
    }

    fn inbound_group_session(&self, pickle: &str) -> Result<InboundGroupSession, CryptoStoreError> {
        Ok(match self {
            Self::Libolm(key) => InboundGroupSession::from_libolm_pickle(pickle, key)?,
            Self::Vodozemac(key) => InboundGroupSession::from_pickle(
                InboundGroupSessionPickle::from_encrypted(pickle, key.as_bytes())?,
            ),
        })
    }

    fn repickle_account(
        &self,
        account: &PickledAccount,
        pickle_key: &PickleKey,
    ) -> Result<PickledAccount, MigrationError> {
        let pickle = self.account(&account.pickle)?.pickle().encrypt(pickle_key.as_bytes());

        Ok(PickledAccount {
            user_id: account.user_id.clone(),
            device_id: account.device_id.clone(),
            pickle,
            shared: account.shared,
            uploaded_signed_key_count: account.uploaded_signed_key_count,
        })
    }

    fn repickle_session(
        &self,
        session: &PickledSession,
        pickle_key: &PickleKey,
    ) -> Result<PickledSession, MigrationError> {
        Curve25519PublicKey::from_base64(&session.sender_key).map_err(CryptoStoreError::from)?;
        parse_timestamp(&session.creation_time)?;
        parse_timestamp(&session.last_use_time)?;

        let pickle = self.session(&session.pickle)?.pickle().encrypt(pickle_key.as_bytes());

        Ok(PickledSession {
            pickle,
            sender_key: session.sender_key.clone(),
            created_using_fallback_key: session.created_using_fallback_key,
            creation_time: session.creation_time.clone(),
            last_use_time: session.last_use_time.clone(),
        })
    }

    fn repickle_inbound_group_session(
        &self,
        session: &PickledInboundGroupSession,
        pickle_key: &PickleKey,
    ) -> Result<PickledInboundGroupSession, MigrationError> {
        Curve25519PublicKey::from_base64(&session.sender_key).map_err(CryptoStoreError::from)?;
        RoomId::parse(&session.room_id).map_err(CryptoStoreError::from)?;

        let pickle =
            self.inbound_group_session(&session.pickle)?.pickle().encrypt(pickle_key.as_bytes());

        Ok(PickledInboundGroupSession {
            pickle,
            sender_key: session.sender_key.clone(),
            signing_key: session.signing_key.clone(),
            room_id: session.room_id.clone(),
            forwarding_chains: session.forwarding_chains.clone(),
            imported: session.imported,
            backed_up: session.backed_up,
        })
    }
}
