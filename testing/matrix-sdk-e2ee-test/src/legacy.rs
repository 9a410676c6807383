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

//! The content of a legacy crypto store created by a libolm based client.
//!
//! Every pickle in here is a libolm pickle encrypted with `pickle_key`. The
//! account's Ed25519 key is [`ACCOUNT_ED25519_KEY`].

use once_cell::sync::Lazy;
use serde_json::Value;

/// The Ed25519 identity key of the legacy account.
pub const ACCOUNT_ED25519_KEY: &str = "JGgPQRuYj3ScMdPS+A0P+k/1qS9Hr3qeKXLscI+hS78";

/// The dump of the legacy store: the account, four Olm sessions, two room
/// keys, the backup and cross-signing secrets and the tracked users.
pub static LEGACY_STORE: Lazy<Value> = Lazy::new(|| {
    serde_json::from_str(include_str!("fixtures/legacy_android_store.json"))
        .expect("The legacy store fixture should be valid JSON")
});

/// The pickle key of the legacy store.
pub fn legacy_pickle_key() -> Vec<u8> {
    LEGACY_STORE["pickle_key"]
        .as_array()
        .expect("The pickle key should be an array of bytes")
        .iter()
        .filter_map(Value::as_u64)
        .filter_map(|byte| u8::try_from(byte).ok())
        .collect()
}
