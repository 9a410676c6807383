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

use std::{collections::HashSet, fmt, num::NonZeroUsize, sync::Arc};

use async_trait::async_trait;
use lru::LruCache;
use ruma::OwnedEventId;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, trace, warn};
use vodozemac::megolm::{DecryptionError, MegolmMessage};

use super::InboundGroupSession;

/// How many decrypted message indices are remembered for replay detection,
/// across all timelines.
const REPLAY_DETECTION_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

/// Identifies a message index of a room key as seen in a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReplayKey {
    timeline_id: String,
    session_id: String,
    message_index: u32,
}
use crate::{
    engine::{CryptoEngine, EngineError, GroupMessage, GroupMessageDecryption},
    key_request::KeyRequestManager,
    metrics::CryptoMetrics,
    store::{Changes, CryptoStoreError, DynCryptoStore, SessionLocks},
    types::{JsonObject, MessageVerificationState, RoomKeySource, WithheldInfo},
};

/// A [`CryptoEngine`] decrypting Megolm messages with vodozemac, using the
/// room keys found in a [`CryptoStore`].
///
/// Decryptions using the same room key are serialized, a Megolm ratchet only
/// moves forward one message at a time.
///
/// [`CryptoStore`]: crate::store::CryptoStore
pub struct OlmEngine {
    store: Arc<DynCryptoStore>,
    session_locks: SessionLocks,
    /// The event that first used a message index, the least recently used
    /// entries are forgotten first.
    decrypted_indices: Mutex<LruCache<ReplayKey, OwnedEventId>>,
    trusted_sender_keys: RwLock<HashSet<String>>,
    metrics: Option<Arc<dyn CryptoMetrics>>,
    key_requests: Option<Arc<dyn KeyRequestManager>>,
}

impl OlmEngine {
    /// Create a new engine using the room keys of the given store.
    pub fn new(store: Arc<DynCryptoStore>) -> Self {
        Self {
            store,
            session_locks: SessionLocks::new(),
            decrypted_indices: Mutex::new(LruCache::new(REPLAY_DETECTION_CAPACITY)),
            trusted_sender_keys: Default::default(),
            metrics: None,
            key_requests: None,
        }
    }

    /// Report the room keys we receive to the given metrics hook.
    pub fn with_metrics(mut self, metrics: Arc<dyn CryptoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Tell the given key request manager about the room keys we receive, so
    /// it can cancel the requests for them.
    pub fn with_key_request_manager(mut self, key_requests: Arc<dyn KeyRequestManager>) -> Self {
        self.key_requests = Some(key_requests);
        self
    }

    /// Change how many decrypted message indices are remembered for replay
    /// detection.
    pub fn with_replay_detection_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.decrypted_indices = Mutex::new(LruCache::new(capacity));
        self
    }

    /// The store the engine reads room keys from.
    pub fn store(&self) -> &Arc<DynCryptoStore> {
        &self.store
    }

    /// Consider the device owning the given Curve25519 key as verified.
    ///
    /// Messages encrypted with room keys this device shared with us directly
    /// will be marked as [`MessageVerificationState::Verified`].
    pub async fn mark_sender_key_as_trusted(&self, sender_key: &str) {
        self.trusted_sender_keys.write().await.insert(sender_key.to_owned());
    }

    /// Forget which events used which message indices in the given timeline.
    ///
    /// Call this when the timeline is reset, events seen again afterwards
    /// won't be considered as replays. Other timelines are left untouched.
    pub async fn reset_replay_detection(&self, timeline_id: &str) {
        let mut indices = self.decrypted_indices.lock().await;

        let stale: Vec<_> = indices
            .iter()
            .filter(|(key, _)| key.timeline_id == timeline_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            indices.pop(&key);
        }
    }

    /// Add a room key to the store.
    ///
    /// If we already have a copy of the same room key that can decrypt more
    /// messages, the new copy is dropped.
    ///
    /// Returns `true` if the room key was stored.
    #[instrument(
        skip_all,
        fields(room_id = %session.room_id(), session_id = session.session_id(), ?source)
    )]
    pub async fn add_room_key(
        &self,
        session: InboundGroupSession,
        source: RoomKeySource,
    ) -> Result<bool, CryptoStoreError> {
        let _guard = self.session_locks.lock(session.room_id(), session.session_id()).await;

        if let Some(existing) =
            self.store.get_inbound_group_session(session.room_id(), session.session_id()).await?
        {
            if existing.first_known_index() <= session.first_known_index() {
                debug!(
                    existing_index = existing.first_known_index(),
                    new_index = session.first_known_index(),
                    "Ignoring a room key, we already have a better copy of it"
                );

                return Ok(false);
            }
        }

        let room_id = session.room_id().to_owned();
        let session_id = session.session_id().to_owned();

        self.store
            .save_changes(Changes { inbound_group_sessions: vec![session], ..Default::default() })
            .await?;

        debug!("Stored a new room key");

        if let Some(metrics) = &self.metrics {
            metrics.on_room_key_imported(&session_id, source);
        }

        if let Some(key_requests) = &self.key_requests {
            key_requests.on_room_key_received(&room_id, &session_id);
        }

        Ok(true)
    }

    /// Remember that the creator of a room key refused to share it with us.
    pub async fn add_withheld_info(&self, info: WithheldInfo) -> Result<(), CryptoStoreError> {
        trace!(
            room_id = %info.room_id,
            session_id = info.session_id.as_str(),
            code = info.code.as_str(),
            "Storing withheld info"
        );

        self.store
            .save_changes(Changes { withheld_session_info: vec![info], ..Default::default() })
            .await
    }

    async fn check_replay(
        &self,
        message: &GroupMessage<'_>,
        message_index: u32,
    ) -> Result<(), EngineError> {
        let mut indices = self.decrypted_indices.lock().await;
        let key = ReplayKey {
            timeline_id: message.timeline_id.to_owned(),
            session_id: message.session_id.to_owned(),
            message_index,
        };

        match indices.get(&key) {
            Some(first_event_id) if first_event_id.as_str() != message.event_id.as_str() => {
                warn!(
                    message_index,
                    %first_event_id,
                    "A message index was reused by a different event, this may be a replay"
                );

                Err(EngineError::DuplicatedMessageIndex {
                    message_index,
                    first_event_id: first_event_id.to_string(),
                })
            }
            Some(_) => Ok(()),
            None => {
                indices.put(key, message.event_id.to_owned());
                Ok(())
            }
        }
    }

    async fn verification_state(&self, session: &InboundGroupSession) -> MessageVerificationState {
        if session.imported() || !session.forwarding_key_chain().is_empty() {
            MessageVerificationState::UnsafeSource
        } else if self.trusted_sender_keys.read().await.contains(&session.sender_key().to_base64())
        {
            MessageVerificationState::Verified
        } else {
            MessageVerificationState::UnknownDevice
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OlmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OlmEngine").field("store", &self.store).finish_non_exhaustive()
    }
}

#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
impl CryptoEngine for OlmEngine {
    #[instrument(skip_all, fields(room_id = %message.room_id, session_id = message.session_id))]
    async fn decrypt_group_message(
        &self,
        message: GroupMessage<'_>,
    ) -> Result<GroupMessageDecryption, EngineError> {
        let _guard = self.session_locks.lock(message.room_id, message.session_id).await;

        let Some(session) =
            self.store.get_inbound_group_session(message.room_id, message.session_id).await?
        else {
            return Err(EngineError::UnknownInboundSessionId(message.session_id.to_owned()));
        };

        let ciphertext = MegolmMessage::from_base64(message.ciphertext)
            .map_err(|e| EngineError::Olm(e.to_string()))?;

        let decrypted = session.decrypt(&ciphertext).await.map_err(|e| match e {
            DecryptionError::UnknownMessageIndex(first_known_index, message_index) => {
                EngineError::UnknownMessageIndex { first_known_index, message_index }
            }
            e => EngineError::Olm(e.to_string()),
        })?;

        let payload: JsonObject = serde_json::from_slice(&decrypted.plaintext)
            .map_err(|e| EngineError::BadDecryptedFormat(e.to_string()))?;

        // Check that the event wasn't forwarded from another room.
        if payload.get("room_id").and_then(Value::as_str) != Some(message.room_id.as_str()) {
            return Err(EngineError::InboundSessionMismatchRoomId);
        }

        self.check_replay(&message, decrypted.message_index).await?;

        trace!(message_index = decrypted.message_index, "Decrypted a room message");

        Ok(GroupMessageDecryption {
            payload: Some(payload),
            sender_key: Some(session.sender_key().to_base64()),
            claimed_keys: session.signing_keys().clone(),
            forwarding_curve25519_key_chain: Some(session.forwarding_key_chain().to_vec()),
            verification_state: self.verification_state(&session).await,
        })
    }
}
