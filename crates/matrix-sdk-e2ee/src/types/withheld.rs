// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! When an encrypted message is sent in a room, the group key might not be sent
//! to all devices present in the room. Sometimes this may be inadvertent (for
//! example, if the sending device is not aware of some devices that have
//! joined), but some times, this may be purposeful.

use std::fmt;

use ruma::OwnedRoomId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A machine-readable code for why the megolm key was not sent.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WithheldCode {
    /// the user/device was blacklisted.
    Blacklisted,

    /// the user/devices is unverified.
    Unverified,

    /// The user/device is not allowed have the key. For example, this would
    /// usually be sent in response to a key request if the user was not in
    /// the room when the message was sent.
    Unauthorised,

    /// Sent in reply to a key request if the device that the key is requested
    /// from does not have the requested key.
    Unavailable,

    /// An olm session could not be established.
    /// This may happen, for example, if the sender was unable to obtain a
    /// one-time key from the recipient.
    NoOlm,

    #[doc(hidden)]
    _Custom(String),
}

impl WithheldCode {
    /// The wire representation of the code.
    pub fn as_str(&self) -> &str {
        match self {
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::Unavailable => "m.unavailable",
            WithheldCode::NoOlm => "m.no_olm",
            WithheldCode::_Custom(code) => code,
        }
    }
}

impl From<&str> for WithheldCode {
    fn from(code: &str) -> Self {
        match code {
            "m.blacklisted" => WithheldCode::Blacklisted,
            "m.unverified" => WithheldCode::Unverified,
            "m.unauthorised" => WithheldCode::Unauthorised,
            "m.unavailable" => WithheldCode::Unavailable,
            "m.no_olm" => WithheldCode::NoOlm,
            _ => WithheldCode::_Custom(code.to_owned()),
        }
    }
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
            _ => self.as_str(),
        };

        f.write_str(string)
    }
}

impl Serialize for WithheldCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WithheldCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(code.as_str().into())
    }
}

/// We want to store when the owner of the group session sent us a withheld
/// code, so that a failed decryption can be explained to the user.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct WithheldInfo {
    /// The room of the group key.
    pub room_id: OwnedRoomId,
    /// The group session id.
    pub session_id: String,
    /// The curve25519 key of the session creator, claimed because withheld
    /// messages are sent in clear.
    pub sender_key: String,
    /// The reason why the key was not distributed.
    pub code: WithheldCode,
    /// A human readable version of the reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use ruma::room_id;
    use serde_json::json;

    use super::{WithheldCode, WithheldInfo};

    #[test]
    fn test_withheld_info_deserialization() {
        let json = json!({
            "room_id": "!DwLygpkclUAfQNnfva:localhost:8480",
            "session_id": "0ZcULv8j1nqVWx6orFjD6OW9JQHydDPXfaanA+uRyfs",
            "sender_key": "9n7mdWKOjr9c4NTlG6zV8dbFtNK79q9vZADoh7nMUwA",
            "code": "m.unverified",
            "reason": "Device not verified",
        });

        let info: WithheldInfo = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(info.room_id, room_id!("!DwLygpkclUAfQNnfva:localhost:8480"));
        assert_eq!(info.code, WithheldCode::Unverified);
        assert_eq!(info.reason.as_deref(), Some("Device not verified"));

        assert_eq!(serde_json::to_value(&info).unwrap(), json);
    }

    #[test]
    fn test_unknown_withheld_codes_are_kept() {
        let code: WithheldCode = serde_json::from_value(json!("org.example.policy")).unwrap();

        assert_eq!(code.as_str(), "org.example.policy");
        assert_eq!(code.to_string(), "org.example.policy");
        assert_eq!(serde_json::to_value(&code).unwrap(), json!("org.example.policy"));
    }
}
