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

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        DecryptedMessage, DecryptionError, ExportedSessionKey,
        InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage,
        SessionConfig, SessionKey,
    },
    Curve25519PublicKey, KeyError,
};

/// A structure representing an inbound group session.
///
/// Inbound group sessions, also known as "room keys", are used to facilitate
/// the exchange of room messages among a group of participants. The inbound
/// variant of the group session is used to decrypt the room messages.
///
/// This struct wraps the [vodozemac] type of the same name, and adds the
/// Matrix-specific provenance of the key to it: who created it, who claims to
/// have created it, who forwarded it to us and whether we imported it.
/// Additionally, the wrapper ensures thread-safe access of the vodozemac type.
///
/// [vodozemac]: https://matrix-org.github.io/vodozemac/vodozemac/index.html
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,

    /// A copy of [`InnerSession::session_id`] to avoid having to acquire a lock
    /// to get to the session ID.
    session_id: Arc<str>,

    /// A copy of [`InnerSession::first_known_index`] to avoid having to acquire
    /// a lock to get to the first known index.
    first_known_index: u32,

    /// The Curve25519 key of the device that created the session.
    sender_key: Curve25519PublicKey,

    /// The signing keys the creator of the session claims to own, keyed by
    /// algorithm.
    signing_keys: Arc<BTreeMap<String, String>>,

    room_id: OwnedRoomId,

    forwarding_key_chain: Arc<[String]>,

    imported: bool,

    backed_up: Arc<AtomicBool>,
}

impl InboundGroupSession {
    /// Create a new inbound group session from a room key that was shared
    /// with us directly by its creator.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that
    ///   sent us the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that
    ///   sent us the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    pub fn from_room_key(
        sender_key: &str,
        signing_key: &str,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Result<Self, KeyError> {
        let inner = InnerSession::new(session_key, SessionConfig::version_1());

        Ok(Self::from_inner(
            inner,
            Curve25519PublicKey::from_base64(sender_key)?,
            BTreeMap::from([("ed25519".to_owned(), signing_key.to_owned())]),
            room_id.to_owned(),
            Vec::new(),
            false,
            false,
        ))
    }

    /// Create a new inbound group session from a room key that was forwarded
    /// to us, downloaded from a backup or imported from a file.
    ///
    /// Such sessions are always marked as imported, the claims they carry
    /// about their creator can't be verified.
    pub fn from_export(
        sender_key: &str,
        signing_keys: BTreeMap<String, String>,
        room_id: &RoomId,
        forwarding_key_chain: Vec<String>,
        session_key: &ExportedSessionKey,
    ) -> Result<Self, KeyError> {
        let inner = InnerSession::import(session_key, SessionConfig::version_1());

        Ok(Self::from_inner(
            inner,
            Curve25519PublicKey::from_base64(sender_key)?,
            signing_keys,
            room_id.to_owned(),
            forwarding_key_chain,
            true,
            false,
        ))
    }

    fn from_inner(
        inner: InnerSession,
        sender_key: Curve25519PublicKey,
        signing_keys: BTreeMap<String, String>,
        room_id: OwnedRoomId,
        forwarding_key_chain: Vec<String>,
        imported: bool,
        backed_up: bool,
    ) -> Self {
        let session_id = inner.session_id().into();
        let first_known_index = inner.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(inner)),
            session_id,
            first_known_index,
            sender_key,
            signing_keys: signing_keys.into(),
            room_id,
            forwarding_key_chain: forwarding_key_chain.into(),
            imported,
            backed_up: AtomicBool::new(backed_up).into(),
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The Curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The signing keys the creator of the session claims to own.
    pub fn signing_keys(&self) -> &BTreeMap<String, String> {
        &self.signing_keys
    }

    /// The Curve25519 keys of the devices that forwarded this session to us.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_key_chain
    }

    /// Has the session been imported from a file, a backup or a forward.
    pub fn imported(&self) -> bool {
        self.imported
    }

    /// Has the session been backed up to the server.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(SeqCst)
    }

    /// Mark the session as backed up.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, SeqCst)
    }

    /// Export this session at the given message index.
    pub async fn export_at(&self, message_index: u32) -> Option<ExportedSessionKey> {
        self.inner.lock().await.export_at(message_index)
    }

    /// Decrypt a Megolm message, advancing the ratchet if needed.
    pub async fn decrypt(
        &self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, DecryptionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// Store the group session as a base64 encoded string.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key.to_base64(),
            signing_key: (*self.signing_keys).clone(),
            room_id: self.room_id.clone(),
            forwarding_chains: self.forwarding_key_chain.to_vec(),
            imported: self.imported,
            backed_up: self.backed_up(),
        }
    }

    /// Restore a Session from a previously pickled string.
    ///
    /// Returns the restored group session or an error if the stored sender key
    /// isn't a valid Curve25519 key.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Result<Self, KeyError> {
        let sender_key = Curve25519PublicKey::from_base64(&pickle.sender_key)?;
        let inner = InnerSession::from_pickle(pickle.pickle);

        Ok(Self::from_inner(
            inner,
            sender_key,
            pickle.signing_key,
            pickle.room_id,
            pickle.forwarding_chains,
            pickle.imported,
            pickle.backed_up,
        ))
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an `InboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an InboundGroupSession.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickle string holding the InboundGroupSession.
    pub pickle: InboundGroupSessionPickle,
    /// The public Curve25519 key of the account that sent us the session,
    /// base64 encoded.
    pub sender_key: String,
    /// The public keys the creator of the session claims to own.
    pub signing_key: BTreeMap<String, String>,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// The Curve25519 keys of the devices that forwarded us the session.
    #[serde(default)]
    pub forwarding_chains: Vec<String>,
    /// Flag remembering if the session was directly sent to us by the sender
    /// or if it was imported.
    pub imported: bool,
    /// Flag remembering if the session has been backed up.
    #[serde(default)]
    pub backed_up: bool,
}
