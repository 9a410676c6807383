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

//! Types for the events and records that flow through the decryption
//! pipeline.

mod events;
mod withheld;

use serde::{Deserialize, Serialize};

pub use self::{
    events::{EncryptedEventContent, EventDecryptionResult, RoomEvent, ENCRYPTED_EVENT_TYPE},
    withheld::{WithheldCode, WithheldInfo},
};

/// Represents a JSON object.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// The identifier of the Megolm v1 room encryption algorithm.
pub const MEGOLM_V1_AES_SHA2: &str = "m.megolm.v1.aes-sha2";

/// How much we trust the authenticity of a decrypted message.
///
/// This is computed at decryption time from what we know about the room key
/// and the device that sent it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageVerificationState {
    /// The message was sent by a verified device of a verified user.
    Verified,
    /// The message was sent by a device signed by its owner, but the owner
    /// isn't verified.
    SignedDeviceOfUnverifiedUser,
    /// The owner is verified but didn't sign the sending device.
    UnsignedDeviceOfVerifiedUser,
    /// The sending device isn't signed by its owner.
    UnsignedDevice,
    /// We don't know anything about the sending device.
    #[default]
    UnknownDevice,
    /// The room key didn't come directly from the sender, it was forwarded,
    /// imported or restored from a backup.
    UnsafeSource,
}

/// Where a room key we just learned about came from.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomKeySource {
    /// The sender shared the key directly with us as an `m.room_key`.
    Direct,
    /// Another device forwarded the key, usually as the answer to a key
    /// request.
    Forward,
    /// The key was downloaded from the server-side key backup.
    Backup,
    /// The key was imported from a key export file.
    FileImport,
}

impl RoomKeySource {
    /// Is the key coming from someone else than the creator of the session.
    pub fn is_indirect(&self) -> bool {
        !matches!(self, Self::Direct)
    }
}
