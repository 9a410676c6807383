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

use std::{fmt, sync::Arc};

use ruma::MilliSecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    olm::{Session as InnerSession, SessionPickle},
    Curve25519PublicKey, KeyError,
};

/// Cryptographic session that enables secure communication between two
/// `Account`s
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    sender_key: Curve25519PublicKey,
    created_using_fallback_key: bool,
    creation_time: MilliSecondsSinceUnixEpoch,
    last_use_time: MilliSecondsSinceUnixEpoch,
}

impl Session {
    /// Wrap an existing vodozemac session.
    pub fn new(
        inner: InnerSession,
        sender_key: Curve25519PublicKey,
        created_using_fallback_key: bool,
        creation_time: MilliSecondsSinceUnixEpoch,
        last_use_time: MilliSecondsSinceUnixEpoch,
    ) -> Self {
        let session_id = inner.session_id().into();

        Self {
            inner: Arc::new(Mutex::new(inner)),
            session_id,
            sender_key,
            created_using_fallback_key,
            creation_time,
            last_use_time,
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the other device in this session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Was the session created using a fallback key.
    pub fn created_using_fallback_key(&self) -> bool {
        self.created_using_fallback_key
    }

    /// When the session was created.
    pub fn creation_time(&self) -> MilliSecondsSinceUnixEpoch {
        self.creation_time
    }

    /// When the session was last used to encrypt or decrypt a message.
    pub fn last_use_time(&self) -> MilliSecondsSinceUnixEpoch {
        self.last_use_time
    }

    /// Store the session as a base64 encoded string.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key.to_base64(),
            created_using_fallback_key: self.created_using_fallback_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a Session from a previously pickled string.
    ///
    /// Returns the restored Olm Session or an error if the stored sender key
    /// isn't a valid Curve25519 key.
    pub fn from_pickle(pickle: PickledSession) -> Result<Self, KeyError> {
        let sender_key = Curve25519PublicKey::from_base64(&pickle.sender_key)?;
        let inner = InnerSession::from_pickle(pickle.pickle);

        Ok(Self::new(
            inner,
            sender_key,
            pickle.created_using_fallback_key,
            pickle.creation_time,
            pickle.last_use_time,
        ))
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to restore
/// a Session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickle string holding the Olm Session.
    pub pickle: SessionPickle,
    /// The curve25519 key of the other user that we share this session with,
    /// base64 encoded.
    pub sender_key: String,
    /// Was the session created using a fallback key.
    #[serde(default)]
    pub created_using_fallback_key: bool,
    /// When the session was created.
    pub creation_time: MilliSecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: MilliSecondsSinceUnixEpoch,
}
