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

//! Hooks through which the crypto layer reports failures and recoveries.

use std::error::Error;

use crate::{types::RoomKeySource, MegolmError};

/// A generic interface which methods get called whenever the crypto layer
/// observes something telemetry might care about.
///
/// Implementations must return quickly, they are called from the decryption
/// path.
pub trait CryptoMetrics: std::fmt::Debug + Send + Sync {
    /// A room message couldn't be decrypted.
    fn on_failed_to_decrypt_room_message(&self, error: &MegolmError, session_id: &str);

    /// A to-device message couldn't be decrypted.
    fn on_fail_to_decrypt_to_device(&self, error: &(dyn Error + Send + Sync));

    /// A to-device message couldn't be sent.
    fn on_fail_to_send_to_device(&self, error: &(dyn Error + Send + Sync));

    /// A room key was added to the store.
    fn on_room_key_imported(&self, session_id: &str, source: RoomKeySource);
}
