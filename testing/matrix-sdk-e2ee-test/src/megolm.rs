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

//! A sending device producing real Megolm ciphertexts.

use ruma::{EventId, RoomId, UserId};
use serde_json::{json, Value};
use vodozemac::{
    megolm::{
        ExportedSessionKey, GroupSession, InboundGroupSession, SessionConfig, SessionKey,
    },
    olm::Account,
};

/// The device id every fixture event claims to be sent from.
pub const SENDER_DEVICE_ID: &str = "SENDERDEVICE";

/// The timestamp every fixture event carries.
pub const ORIGIN_SERVER_TS: u64 = 1_700_000_000_000;

/// The outbound side of a room key, owned by a sending device with its own
/// identity keys.
pub struct OutboundRoomKey {
    account: Account,
    session: GroupSession,
    // An inbound copy starting at index 0, used to export the key at any index.
    exporter: InboundGroupSession,
}

impl OutboundRoomKey {
    /// Create a new room key owned by a fresh device.
    pub fn new() -> Self {
        let account = Account::new();
        let session = GroupSession::new(SessionConfig::version_1());
        let exporter = InboundGroupSession::new(&session.session_key(), SessionConfig::version_1());

        Self { account, session, exporter }
    }

    /// The Curve25519 key of the sending device, base64 encoded.
    pub fn sender_key(&self) -> String {
        self.account.curve25519_key().to_base64()
    }

    /// The Ed25519 key of the sending device, base64 encoded.
    pub fn signing_key(&self) -> String {
        self.account.ed25519_key().to_base64()
    }

    /// The id of the room key.
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// The index the next message will be encrypted at.
    pub fn message_index(&self) -> u32 {
        self.session.message_index()
    }

    /// The room key as it would be shared in an `m.room_key`, starting at the
    /// current message index.
    pub fn session_key(&self) -> SessionKey {
        self.session.session_key()
    }

    /// The room key as it would be forwarded or exported, starting at the
    /// given index.
    pub fn exported_key_at(&mut self, index: u32) -> ExportedSessionKey {
        self.exporter
            .export_at(index)
            .expect("The exporter starts at index 0 and can export any index")
    }

    /// Encrypt a room event and return the base64 encoded ciphertext.
    pub fn encrypt(&mut self, room_id: &RoomId, event_type: &str, content: Value) -> String {
        let payload = json!({
            "room_id": room_id,
            "type": event_type,
            "content": content,
        });

        self.session.encrypt(payload.to_string()).to_base64()
    }

    /// Encrypt a plaintext that isn't necessarily a valid event.
    pub fn encrypt_raw(&mut self, plaintext: &str) -> String {
        self.session.encrypt(plaintext).to_base64()
    }

    /// The content of an `m.room.encrypted` event carrying the given
    /// ciphertext.
    pub fn encrypted_content(&self, ciphertext: &str) -> Value {
        json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "sender_key": self.sender_key(),
            "session_id": self.session_id(),
            "ciphertext": ciphertext,
            "device_id": SENDER_DEVICE_ID,
        })
    }

    /// Encrypt an `m.room.message` and wrap it into a full room event.
    pub fn encrypted_event(
        &mut self,
        event_id: &EventId,
        room_id: &RoomId,
        sender: &UserId,
        body: &str,
    ) -> Value {
        let ciphertext =
            self.encrypt(room_id, "m.room.message", json!({ "msgtype": "m.text", "body": body }));

        room_event(event_id, room_id, sender, self.encrypted_content(&ciphertext))
    }
}

impl Default for OutboundRoomKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutboundRoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRoomKey").field("session_id", &self.session_id()).finish()
    }
}

/// Wrap an event content into a room event with the `m.room.encrypted` type.
pub fn room_event(event_id: &EventId, room_id: &RoomId, sender: &UserId, content: Value) -> Value {
    json!({
        "event_id": event_id,
        "room_id": room_id,
        "sender": sender,
        "origin_server_ts": ORIGIN_SERVER_TS,
        "type": "m.room.encrypted",
        "content": content,
    })
}
