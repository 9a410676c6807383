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

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JsonObject, MessageVerificationState};

/// The event type of encrypted room events.
pub const ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";

/// The content of an `m.room.encrypted` room event, as it arrives over the
/// wire.
///
/// Missing fields deserialize to empty strings, deciding whether the content
/// is usable is left to the decryption pipeline.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct EncryptedEventContent {
    /// The encryption algorithm used to encrypt the event.
    #[serde(default)]
    pub algorithm: String,

    /// The Curve25519 key of the device that created the room key.
    #[serde(default)]
    pub sender_key: String,

    /// The ID of the Megolm session that was used to encrypt the event.
    #[serde(default)]
    pub session_id: String,

    /// The base64 encoded Megolm message.
    #[serde(default)]
    pub ciphertext: String,

    /// The ID of the device that sent the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,

    /// The relation of the event, sent in clear so servers can aggregate it.
    #[serde(rename = "m.relates_to", default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Value>,
}

impl EncryptedEventContent {
    /// Does this content lack one of the fields needed to decrypt it?
    pub fn has_missing_fields(&self) -> bool {
        [&self.sender_key, &self.session_id, &self.ciphertext]
            .iter()
            .any(|field| field.trim().is_empty())
    }
}

/// A room event as the timeline sees it.
///
/// The event is either encrypted, in which case the [`content`] holds an
/// [`EncryptedEventContent`], or in clear.
///
/// [`content`]: RoomEvent::content
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomEvent {
    /// The globally unique ID of the event.
    pub event_id: OwnedEventId,

    /// The room the event was sent to, absent for events that were received
    /// without room context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,

    /// The user that sent the event.
    pub sender: OwnedUserId,

    /// The timestamp of the event, as set by the sender's homeserver.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,

    /// The type of the event, `m.room.encrypted` for encrypted events.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The raw content of the event.
    #[serde(default)]
    pub content: Value,

    /// The result of decrypting this event, cached in memory once a
    /// decryption succeeded.
    ///
    /// This is never serialized, the decrypted payload is only ever kept
    /// in memory.
    #[serde(skip)]
    pub decryption_result: Option<EventDecryptionResult>,
}

impl RoomEvent {
    /// Is this an `m.room.encrypted` event?
    pub fn is_encrypted(&self) -> bool {
        self.event_type == ENCRYPTED_EVENT_TYPE
    }

    /// Try to read the content of the event as an encrypted payload.
    ///
    /// Returns `None` if the content isn't a JSON object with the expected
    /// shape.
    pub fn encrypted_content(&self) -> Option<EncryptedEventContent> {
        if !self.content.is_object() {
            return None;
        }

        serde_json::from_value(self.content.clone()).ok()
    }

    /// The type of the event, or the type of the decrypted event if the event
    /// was successfully decrypted.
    pub fn clear_type(&self) -> &str {
        self.decryption_result
            .as_ref()
            .and_then(|result| result.event_type())
            .unwrap_or(&self.event_type)
    }

    /// The content of the event, or the content of the decrypted event if the
    /// event was successfully decrypted.
    pub fn clear_content(&self) -> &Value {
        self.decryption_result.as_ref().and_then(|result| result.content()).unwrap_or(&self.content)
    }
}

/// The result of a successful room event decryption.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct EventDecryptionResult {
    /// The decrypted event, `type` and `content` included.
    pub clear_event: JsonObject,

    /// The Curve25519 key of the device that created the room key.
    pub sender_curve25519_key: Option<String>,

    /// The Ed25519 key the creator of the room key claimed to own.
    pub claimed_ed25519_key: Option<String>,

    /// The Curve25519 keys of the devices that forwarded the room key to us,
    /// in forwarding order. Empty if the room key came directly from its
    /// creator.
    pub forwarding_curve25519_key_chain: Vec<String>,

    /// How much we trust the authenticity of the event.
    pub verification_state: MessageVerificationState,
}

impl EventDecryptionResult {
    /// The type of the decrypted event.
    pub fn event_type(&self) -> Option<&str> {
        self.clear_event.get("type").and_then(Value::as_str)
    }

    /// The content of the decrypted event.
    pub fn content(&self) -> Option<&Value> {
        self.clear_event.get("content")
    }
}
