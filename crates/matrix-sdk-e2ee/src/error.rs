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

use std::fmt;

use thiserror::Error;

use crate::{store::CryptoStoreError, types::WithheldCode};

/// A `Result` type for the decryption of room events.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during the decryption of a room event.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event is missing the room id, isn't an encrypted event, or one of
    /// the fields needed to decrypt it is blank.
    #[error("the encrypted event is missing fields needed to decrypt it")]
    MissingFields,

    /// We don't have the room key the event was encrypted with.
    #[error("can't find the room key {session_id} to decrypt the event")]
    UnknownInboundSessionId {
        /// The id of the missing room key.
        session_id: String,
    },

    /// We have the room key, but only starting at a later message index than
    /// the one of the event.
    #[error(
        "the room key is only known starting at index {first_known_index}, \
         the event was encrypted at index {message_index}"
    )]
    UnknownMessageIndex {
        /// The first message index our copy of the room key can decrypt.
        first_known_index: u32,
        /// The message index of the event.
        message_index: u32,
    },

    /// The sender of the event told us that they won't share the room key with
    /// us.
    #[error("the room key was withheld: {code}")]
    KeysWithheld {
        /// The machine readable reason why the key was withheld.
        code: WithheldCode,
        /// The human readable reason why the key was withheld, if the sender
        /// gave one.
        reason: Option<String>,
    },

    /// The cryptographic engine failed to decrypt the event.
    #[error("{reason}")]
    Olm {
        /// Short description, `OLM error: ` followed by the engine's message.
        reason: String,
        /// Longer description including the ciphertext that failed to decrypt.
        detail: String,
    },

    /// The message index of the event was already used by another event, the
    /// event is likely a replay.
    #[error("the message index {message_index} was already used by event {first_event_id}")]
    DuplicatedMessageIndex {
        /// The reused message index.
        message_index: u32,
        /// The event id of the first event that used the message index.
        first_event_id: String,
    },

    /// The decrypted event claims to belong to a different room than the one
    /// it was received in.
    #[error("the decrypted event belongs to a different room than the room key")]
    InboundSessionMismatchRoomId,

    /// The plaintext of the event isn't a valid JSON object.
    #[error("the decrypted event has an invalid format: {0}")]
    BadDecryptedFormat(String),

    /// The crypto store failed while we were decrypting the event.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

impl MegolmError {
    /// The stable, machine readable kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MegolmError::MissingFields => ErrorKind::MissingFields,
            MegolmError::UnknownInboundSessionId { .. } => ErrorKind::UnknownInboundSessionId,
            MegolmError::UnknownMessageIndex { .. } => ErrorKind::UnknownMessageIndex,
            MegolmError::KeysWithheld { .. } => ErrorKind::KeysWithheld,
            MegolmError::Olm { .. } => ErrorKind::Olm,
            MegolmError::DuplicatedMessageIndex { .. } => ErrorKind::DuplicatedMessageIndex,
            MegolmError::InboundSessionMismatchRoomId => ErrorKind::InboundSessionMismatchRoomId,
            MegolmError::BadDecryptedFormat(_) => ErrorKind::BadDecryptedFormat,
            MegolmError::Store(_) => ErrorKind::Store,
        }
    }

    /// Is this error one a room key arriving later on could fix?
    pub fn is_missing_room_key(&self) -> bool {
        matches!(
            self,
            MegolmError::UnknownInboundSessionId { .. }
                | MegolmError::UnknownMessageIndex { .. }
                | MegolmError::KeysWithheld { .. }
        )
    }
}

/// The kind of a [`MegolmError`], usable as a telemetry dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`MegolmError::MissingFields`].
    MissingFields,
    /// See [`MegolmError::UnknownInboundSessionId`].
    UnknownInboundSessionId,
    /// See [`MegolmError::UnknownMessageIndex`].
    UnknownMessageIndex,
    /// See [`MegolmError::KeysWithheld`].
    KeysWithheld,
    /// See [`MegolmError::Olm`].
    Olm,
    /// See [`MegolmError::DuplicatedMessageIndex`].
    DuplicatedMessageIndex,
    /// See [`MegolmError::InboundSessionMismatchRoomId`].
    InboundSessionMismatchRoomId,
    /// See [`MegolmError::BadDecryptedFormat`].
    BadDecryptedFormat,
    /// See [`MegolmError::Store`].
    Store,
}

impl ErrorKind {
    /// The upper snake case code of the error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingFields => "MISSING_FIELDS",
            ErrorKind::UnknownInboundSessionId => "UNKNOWN_INBOUND_SESSION_ID",
            ErrorKind::UnknownMessageIndex => "UNKNOWN_MESSAGE_INDEX",
            ErrorKind::KeysWithheld => "KEYS_WITHHELD",
            ErrorKind::Olm => "OLM",
            ErrorKind::DuplicatedMessageIndex => "DUPLICATED_MESSAGE_INDEX",
            ErrorKind::InboundSessionMismatchRoomId => "INBOUND_SESSION_MISMATCH_ROOM_ID",
            ErrorKind::BadDecryptedFormat => "BAD_DECRYPTED_FORMAT",
            ErrorKind::Store => "STORE_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
