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

//! The boundary between the decryption pipeline and the cryptographic engine.
//!
//! The pipeline only ever talks to a [`CryptoEngine`], [`OlmEngine`] is the
//! vodozemac backed implementation, tests can plug in their own.
//!
//! [`OlmEngine`]: crate::olm::OlmEngine

use std::collections::BTreeMap;

use async_trait::async_trait;
use ruma::{EventId, RoomId, UserId};
use thiserror::Error;

use crate::{
    store::CryptoStoreError,
    types::{JsonObject, MessageVerificationState},
    AsyncTraitDeps,
};

/// The timeline messages are decrypted for when the caller doesn't name one.
pub const MAIN_TIMELINE: &str = "main";

/// An encrypted room message handed to the engine.
#[derive(Clone, Copy, Debug)]
pub struct GroupMessage<'a> {
    /// The timeline the message is shown in, message indices are checked for
    /// reuse within a single timeline.
    pub timeline_id: &'a str,
    /// The base64 encoded Megolm ciphertext.
    pub ciphertext: &'a str,
    /// The room the message was received in.
    pub room_id: &'a RoomId,
    /// The sender of the message.
    pub sender: &'a UserId,
    /// The event id of the message, used for replay detection.
    pub event_id: &'a EventId,
    /// The id of the Megolm session the message claims to be encrypted with.
    pub session_id: &'a str,
    /// The Curve25519 key of the creator of the Megolm session.
    pub sender_key: &'a str,
}

/// The result of a successful group message decryption.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupMessageDecryption {
    /// The decrypted event, `None` if the engine couldn't produce one.
    pub payload: Option<JsonObject>,
    /// The Curve25519 key of the creator of the room key.
    pub sender_key: Option<String>,
    /// The signing keys the creator of the room key claimed, keyed by
    /// algorithm.
    pub claimed_keys: BTreeMap<String, String>,
    /// The Curve25519 keys of the devices that forwarded the room key.
    pub forwarding_curve25519_key_chain: Option<Vec<String>>,
    /// How much we trust the message.
    pub verification_state: MessageVerificationState,
}

impl GroupMessageDecryption {
    /// The Ed25519 key the creator of the room key claimed to own, if any.
    pub fn claimed_ed25519_key(&self) -> Option<&str> {
        self.claimed_keys.get("ed25519").map(String::as_str)
    }
}

/// Typed failure codes of a [`CryptoEngine`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// No inbound group session with the given id is known.
    #[error("unknown inbound session id {0}")]
    UnknownInboundSessionId(String),

    /// The inbound group session is known but was ratcheted past the message.
    #[error("unknown message index {message_index}, first known index {first_known_index}")]
    UnknownMessageIndex {
        /// The first index the known session can decrypt.
        first_known_index: u32,
        /// The index the message was encrypted at.
        message_index: u32,
    },

    /// A different event was already decrypted with the same message index.
    #[error("duplicated message index {message_index}, first seen in {first_event_id}")]
    DuplicatedMessageIndex {
        /// The reused message index.
        message_index: u32,
        /// The event that first used the message index.
        first_event_id: String,
    },

    /// The payload's `room_id` doesn't match the room of the event.
    #[error("the decrypted payload belongs to another room")]
    InboundSessionMismatchRoomId,

    /// The plaintext isn't a JSON object.
    #[error("bad decrypted format: {0}")]
    BadDecryptedFormat(String),

    /// Any other cryptographic failure.
    #[error("{0}")]
    Olm(String),

    /// The engine failed to read or write its store.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// The capability to decrypt Megolm room messages.
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait CryptoEngine: AsyncTraitDeps {
    /// Decrypt a room message.
    async fn decrypt_group_message(
        &self,
        message: GroupMessage<'_>,
    ) -> Result<GroupMessageDecryption, EngineError>;
}
