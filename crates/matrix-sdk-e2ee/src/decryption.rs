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

use std::sync::Arc;

use ruma::RoomId;
use tracing::{debug, field::debug, instrument, warn, Span};

use crate::{
    engine::{CryptoEngine, EngineError, GroupMessage, GroupMessageDecryption, MAIN_TIMELINE},
    key_request::KeyRequestManager,
    metrics::CryptoMetrics,
    store::DynCryptoStore,
    types::{EncryptedEventContent, EventDecryptionResult, RoomEvent},
    MegolmError, MegolmResult,
};

/// Decrypts encrypted room events and classifies the failures.
///
/// When the room key of an event is missing, the use case looks up whether
/// the sender told us they withheld it, and asks the [`KeyRequestManager`]
/// to request it from our other devices.
#[derive(Clone, Debug)]
pub struct DecryptRoomEventUseCase {
    engine: Arc<dyn CryptoEngine>,
    store: Arc<DynCryptoStore>,
    key_requests: Arc<dyn KeyRequestManager>,
    metrics: Option<Arc<dyn CryptoMetrics>>,
    timeline_id: String,
}

impl DecryptRoomEventUseCase {
    /// Create a new use case.
    ///
    /// # Arguments
    ///
    /// * `engine` - The engine doing the actual decryption.
    ///
    /// * `store` - The store holding the withheld records of room keys.
    ///
    /// * `key_requests` - Where requests for missing room keys are sent to.
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        store: Arc<DynCryptoStore>,
        key_requests: Arc<dyn KeyRequestManager>,
    ) -> Self {
        Self { engine, store, key_requests, metrics: None, timeline_id: MAIN_TIMELINE.to_owned() }
    }

    /// Decrypt the events of the given timeline.
    ///
    /// Message indices are only checked for reuse among the events of the
    /// same timeline, defaults to [`MAIN_TIMELINE`].
    pub fn with_timeline_id(mut self, timeline_id: impl Into<String>) -> Self {
        self.timeline_id = timeline_id.into();
        self
    }

    /// Report every failed decryption to the given hook.
    pub fn with_metrics(mut self, metrics: Arc<dyn CryptoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decrypt an event from a room timeline.
    ///
    /// # Arguments
    ///
    /// * `event` - The encrypted event.
    ///
    /// * `request_keys_on_fail` - Request the room key from our other devices
    ///   if we don't have it.
    #[instrument(
        skip_all,
        fields(event_id = %event.event_id, room_id, session_id, sender_key)
    )]
    pub async fn decrypt(
        &self,
        event: &RoomEvent,
        request_keys_on_fail: bool,
    ) -> MegolmResult<EventDecryptionResult> {
        let content = event.encrypted_content();
        let result = self.decrypt_inner(event, content.as_ref(), request_keys_on_fail).await;

        if let Err(e) = &result {
            warn!(kind = %e.kind(), "Failed to decrypt a room event: {e}");

            if let Some(metrics) = &self.metrics {
                let session_id =
                    content.as_ref().map(|c| c.session_id.as_str()).unwrap_or_default();
                metrics.on_failed_to_decrypt_room_message(e, session_id);
            }
        }

        result
    }

    /// Decrypt an event and cache the result in the event.
    ///
    /// Failures are logged and otherwise ignored, the event is left untouched
    /// if the decryption doesn't succeed. Keys are requested for events we
    /// don't have the room key for.
    pub async fn decrypt_and_save(&self, event: &mut RoomEvent) {
        match self.decrypt(event, true).await {
            Ok(result) => event.decryption_result = Some(result),
            Err(e) => debug!(event_id = %event.event_id, "Leaving the event encrypted: {e}"),
        }
    }

    async fn decrypt_inner(
        &self,
        event: &RoomEvent,
        content: Option<&EncryptedEventContent>,
        request_keys_on_fail: bool,
    ) -> MegolmResult<EventDecryptionResult> {
        let (Some(room_id), Some(content)) = (event.room_id.as_deref(), content) else {
            return Err(MegolmError::MissingFields);
        };

        if content.has_missing_fields() {
            return Err(MegolmError::MissingFields);
        }

        Span::current()
            .record("room_id", debug(room_id))
            .record("session_id", content.session_id.as_str())
            .record("sender_key", content.sender_key.as_str());

        let message = GroupMessage {
            timeline_id: &self.timeline_id,
            ciphertext: &content.ciphertext,
            room_id,
            sender: &event.sender,
            event_id: &event.event_id,
            session_id: &content.session_id,
            sender_key: &content.sender_key,
        };

        match self.engine.decrypt_group_message(message).await {
            Ok(decryption) => Self::to_result(decryption),
            Err(error) => Err(self
                .classify_error(error, event, room_id, content, request_keys_on_fail)
                .await?),
        }
    }

    fn to_result(decryption: GroupMessageDecryption) -> MegolmResult<EventDecryptionResult> {
        let claimed_ed25519_key = decryption.claimed_ed25519_key().map(ToOwned::to_owned);

        let Some(clear_event) = decryption.payload else {
            return Err(MegolmError::MissingFields);
        };

        Ok(EventDecryptionResult {
            clear_event,
            sender_curve25519_key: decryption.sender_key,
            claimed_ed25519_key,
            forwarding_curve25519_key_chain: decryption
                .forwarding_curve25519_key_chain
                .unwrap_or_default(),
            verification_state: decryption.verification_state,
        })
    }

    /// Turn an engine failure into the error we hand out.
    ///
    /// Returns `Err` only if looking up the withheld record failed.
    async fn classify_error(
        &self,
        error: EngineError,
        event: &RoomEvent,
        room_id: &RoomId,
        content: &EncryptedEventContent,
        request_keys_on_fail: bool,
    ) -> MegolmResult<MegolmError> {
        Ok(match error {
            EngineError::UnknownMessageIndex { first_known_index, message_index } => {
                // A later copy of the key won't help, so no key request here.
                match self.store.get_withheld_info(room_id, &content.session_id).await? {
                    Some(info) => {
                        MegolmError::KeysWithheld { code: info.code, reason: info.reason }
                    }
                    None => MegolmError::UnknownMessageIndex { first_known_index, message_index },
                }
            }
            EngineError::UnknownInboundSessionId(session_id) => {
                if request_keys_on_fail {
                    self.key_requests.request_key_for_event(event, false);
                }

                match self.store.get_withheld_info(room_id, &content.session_id).await? {
                    Some(info) => {
                        MegolmError::KeysWithheld { code: info.code, reason: info.reason }
                    }
                    None => MegolmError::UnknownInboundSessionId { session_id },
                }
            }
            EngineError::DuplicatedMessageIndex { message_index, first_event_id } => {
                MegolmError::DuplicatedMessageIndex { message_index, first_event_id }
            }
            EngineError::InboundSessionMismatchRoomId => MegolmError::InboundSessionMismatchRoomId,
            EngineError::BadDecryptedFormat(e) => MegolmError::BadDecryptedFormat(e),
            EngineError::Store(e) => MegolmError::Store(e),
            EngineError::Olm(message) => {
                let reason = format!("OLM error: {message}");
                let detail = format!(
                    "Unable to decrypt olm event {} (reason: {reason})",
                    content.ciphertext
                );

                MegolmError::Olm { reason, detail }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Arc, Mutex,
        },
    };

    use assert_matches::assert_matches;
    use assert_matches2::assert_let;
    use async_trait::async_trait;
    use matrix_sdk_e2ee_test::{
        megolm::{room_event, OutboundRoomKey},
        ALICE, BOB,
    };
    use ruma::{event_id, room_id, RoomId};
    use serde_json::{json, Value};

    use super::DecryptRoomEventUseCase;
    use crate::{
        engine::{CryptoEngine, EngineError, GroupMessage, GroupMessageDecryption},
        key_request::{KeyRequestManager, OutgoingKeyRequestManager},
        metrics::CryptoMetrics,
        olm::{InboundGroupSession, OlmEngine},
        store::{Changes, CryptoStore, MemoryStore},
        types::{MessageVerificationState, RoomEvent, RoomKeySource, WithheldCode, WithheldInfo},
        ErrorKind, MegolmError,
    };

    /// An engine answering every call with a canned result.
    #[derive(Debug)]
    struct FakeEngine {
        calls: AtomicUsize,
        answer: fn() -> Result<GroupMessageDecryption, EngineError>,
    }

    impl FakeEngine {
        fn new(answer: fn() -> Result<GroupMessageDecryption, EngineError>) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), answer })
        }

        fn calls(&self) -> usize {
            self.calls.load(SeqCst)
        }
    }

    #[async_trait]
    impl CryptoEngine for FakeEngine {
        async fn decrypt_group_message(
            &self,
            _: GroupMessage<'_>,
        ) -> Result<GroupMessageDecryption, EngineError> {
            self.calls.fetch_add(1, SeqCst);
            (self.answer)()
        }
    }

    #[derive(Debug, Default)]
    struct CountingKeyRequests {
        requests: AtomicUsize,
    }

    impl KeyRequestManager for CountingKeyRequests {
        fn request_key_for_event(&self, _: &RoomEvent, force_resend: bool) {
            assert!(!force_resend);
            self.requests.fetch_add(1, SeqCst);
        }

        fn on_room_key_received(&self, _: &RoomId, _: &str) {}
    }

    #[derive(Debug, Default)]
    struct RecordingMetrics {
        failures: Mutex<Vec<(ErrorKind, String)>>,
    }

    impl CryptoMetrics for RecordingMetrics {
        fn on_failed_to_decrypt_room_message(&self, error: &MegolmError, session_id: &str) {
            self.failures.lock().unwrap().push((error.kind(), session_id.to_owned()));
        }

        fn on_fail_to_decrypt_to_device(&self, _: &(dyn std::error::Error + Send + Sync)) {}
        fn on_fail_to_send_to_device(&self, _: &(dyn std::error::Error + Send + Sync)) {}
        fn on_room_key_imported(&self, _: &str, _: RoomKeySource) {}
    }

    const SESSION_ID: &str = "0ZcULv8j1nqVWx6orFjD6OW9JQHydDPXfaanA+uRyfs";
    const SENDER_KEY: &str = "9n7mdWKOjr9c4NTlG6zV8dbFtNK79q9vZADoh7nMUwA";
    const CIPHERTEXT: &str = "AwgAEpABqOCAaP6NqXquQcEsrGCVInjRTLHmVH8exkM";

    fn encrypted_event(content: Value) -> RoomEvent {
        serde_json::from_value(room_event(
            event_id!("$event:localhost"),
            room_id!("!test:localhost"),
            &BOB,
            content,
        ))
        .unwrap()
    }

    fn valid_event() -> RoomEvent {
        encrypted_event(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "sender_key": SENDER_KEY,
            "session_id": SESSION_ID,
            "ciphertext": CIPHERTEXT,
        }))
    }

    struct Fixture {
        engine: Arc<FakeEngine>,
        store: Arc<MemoryStore>,
        key_requests: Arc<CountingKeyRequests>,
        metrics: Arc<RecordingMetrics>,
        use_case: DecryptRoomEventUseCase,
    }

    impl Fixture {
        fn new(answer: fn() -> Result<GroupMessageDecryption, EngineError>) -> Self {
            let engine = FakeEngine::new(answer);
            let store = Arc::new(MemoryStore::new());
            let key_requests = Arc::new(CountingKeyRequests::default());
            let metrics = Arc::new(RecordingMetrics::default());

            let use_case =
                DecryptRoomEventUseCase::new(engine.clone(), store.clone(), key_requests.clone())
                    .with_metrics(metrics.clone());

            Self { engine, store, key_requests, metrics, use_case }
        }

        async fn withhold(&self, code: WithheldCode, reason: Option<&str>) {
            let info = WithheldInfo {
                room_id: room_id!("!test:localhost").to_owned(),
                session_id: SESSION_ID.to_owned(),
                sender_key: SENDER_KEY.to_owned(),
                code,
                reason: reason.map(ToOwned::to_owned),
            };

            self.store
                .save_changes(Changes { withheld_session_info: vec![info], ..Default::default() })
                .await
                .unwrap();
        }

        fn key_requests(&self) -> usize {
            self.key_requests.requests.load(SeqCst)
        }
    }

    fn unknown_session() -> Result<GroupMessageDecryption, EngineError> {
        Err(EngineError::UnknownInboundSessionId(SESSION_ID.to_owned()))
    }

    fn unknown_index() -> Result<GroupMessageDecryption, EngineError> {
        Err(EngineError::UnknownMessageIndex { first_known_index: 4, message_index: 2 })
    }

    #[tokio::test]
    async fn test_missing_fields_never_reach_the_engine() {
        let fixture = Fixture::new(unknown_session);

        let contents = [
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "session_id": SESSION_ID,
                "ciphertext": CIPHERTEXT,
            }),
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": SENDER_KEY,
                "ciphertext": CIPHERTEXT,
            }),
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": SENDER_KEY,
                "session_id": SESSION_ID,
            }),
            json!({ "sender_key": SENDER_KEY, "session_id": "  ", "ciphertext": CIPHERTEXT }),
            json!("not an object"),
        ];

        for content in contents {
            let result = fixture.use_case.decrypt(&encrypted_event(content), true).await;
            assert_matches!(result, Err(MegolmError::MissingFields));
        }

        let mut event = valid_event();
        event.room_id = None;
        assert_matches!(
            fixture.use_case.decrypt(&event, true).await,
            Err(MegolmError::MissingFields)
        );

        assert_eq!(fixture.engine.calls(), 0);
        assert_eq!(fixture.key_requests(), 0);
    }

    #[tokio::test]
    async fn test_successful_decryption() {
        let fixture = Fixture::new(|| {
            Ok(GroupMessageDecryption {
                payload: json!({
                    "room_id": "!test:localhost",
                    "type": "m.room.message",
                    "content": { "msgtype": "m.text", "body": "Hello" },
                })
                .as_object()
                .cloned(),
                sender_key: Some(SENDER_KEY.to_owned()),
                claimed_keys: BTreeMap::from([(
                    "ed25519".to_owned(),
                    "nE6W2fCblxDcOFmeEtCHNl8/l8bXcu7GKyAswA4r3mM".to_owned(),
                )]),
                forwarding_curve25519_key_chain: None,
                verification_state: MessageVerificationState::UnknownDevice,
            })
        });

        let result = fixture.use_case.decrypt(&valid_event(), true).await.unwrap();

        assert_eq!(result.event_type(), Some("m.room.message"));
        assert_eq!(result.sender_curve25519_key.as_deref(), Some(SENDER_KEY));
        assert_eq!(
            result.claimed_ed25519_key.as_deref(),
            Some("nE6W2fCblxDcOFmeEtCHNl8/l8bXcu7GKyAswA4r3mM")
        );
        assert!(result.forwarding_curve25519_key_chain.is_empty());
        assert_eq!(fixture.engine.calls(), 1);
        assert!(fixture.metrics.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_without_payload_is_missing_fields() {
        let fixture = Fixture::new(|| Ok(GroupMessageDecryption::default()));

        let result = fixture.use_case.decrypt(&valid_event(), true).await;
        assert_matches!(result, Err(MegolmError::MissingFields));
    }

    #[tokio::test]
    async fn test_unknown_message_index() {
        let fixture = Fixture::new(unknown_index);

        let result = fixture.use_case.decrypt(&valid_event(), true).await;
        assert_matches!(
            result,
            Err(MegolmError::UnknownMessageIndex { first_known_index: 4, message_index: 2 })
        );

        fixture.withhold(WithheldCode::Unverified, Some("Device not verified")).await;

        let result = fixture.use_case.decrypt(&valid_event(), true).await;
        assert_let!(Err(MegolmError::KeysWithheld { code, reason }) = result);
        assert_eq!(code, WithheldCode::Unverified);
        assert_eq!(reason.as_deref(), Some("Device not verified"));

        // A later copy of the key wouldn't help, we never ask for one.
        assert_eq!(fixture.key_requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_requests_keys() {
        let fixture = Fixture::new(unknown_session);

        let result = fixture.use_case.decrypt(&valid_event(), true).await;
        assert_let!(Err(MegolmError::UnknownInboundSessionId { session_id }) = result);
        assert_eq!(session_id, SESSION_ID);
        assert_eq!(fixture.key_requests(), 1);

        let result = fixture.use_case.decrypt(&valid_event(), false).await;
        assert_matches!(result, Err(MegolmError::UnknownInboundSessionId { .. }));
        assert_eq!(fixture.key_requests(), 1);

        fixture.withhold(WithheldCode::Blacklisted, None).await;

        let result = fixture.use_case.decrypt(&valid_event(), true).await;
        assert_matches!(
            result,
            Err(MegolmError::KeysWithheld { code: WithheldCode::Blacklisted, reason: None })
        );
        assert_eq!(fixture.key_requests(), 2);
    }

    #[tokio::test]
    async fn test_olm_errors_carry_the_ciphertext() {
        let fixture = Fixture::new(|| Err(EngineError::Olm("BAD_MESSAGE_MAC".to_owned())));

        let result = fixture.use_case.decrypt(&valid_event(), true).await;
        assert_let!(Err(MegolmError::Olm { reason, detail }) = result);
        assert_eq!(reason, "OLM error: BAD_MESSAGE_MAC");
        assert_eq!(
            detail,
            format!("Unable to decrypt olm event {CIPHERTEXT} (reason: OLM error: BAD_MESSAGE_MAC)")
        );
        assert_eq!(fixture.key_requests(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_reported_to_the_metrics() {
        let fixture = Fixture::new(|| Err(EngineError::InboundSessionMismatchRoomId));

        let result = fixture.use_case.decrypt(&valid_event(), true).await;
        assert_matches!(result, Err(MegolmError::InboundSessionMismatchRoomId));

        let result = fixture.use_case.decrypt(&encrypted_event(json!({})), true).await;
        assert_matches!(result, Err(MegolmError::MissingFields));

        assert_eq!(
            *fixture.metrics.failures.lock().unwrap(),
            vec![
                (ErrorKind::InboundSessionMismatchRoomId, SESSION_ID.to_owned()),
                (ErrorKind::MissingFields, String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_decrypt_and_save_with_a_real_engine() {
        let room_id = room_id!("!test:localhost");
        let store = Arc::new(MemoryStore::new());
        let key_requests = Arc::new(OutgoingKeyRequestManager::new());
        let engine = Arc::new(
            OlmEngine::new(store.clone()).with_key_request_manager(key_requests.clone()),
        );
        let use_case = DecryptRoomEventUseCase::new(engine.clone(), store, key_requests.clone());

        let mut outbound = OutboundRoomKey::new();
        // Taken before encrypting, the key has to start at the event's index.
        let session_key = outbound.session_key();
        let event_id = event_id!("$event:localhost");
        let json = outbound.encrypted_event(event_id, room_id, &ALICE, "It's a secret");
        let mut event: RoomEvent = serde_json::from_value(json).unwrap();

        // The key is missing, the event stays encrypted and a key gets requested.
        use_case.decrypt_and_save(&mut event).await;
        assert!(event.decryption_result.is_none());
        assert_eq!(event.clear_type(), "m.room.encrypted");
        assert!(key_requests.is_pending(room_id, &outbound.session_id()));

        let room_key = InboundGroupSession::from_room_key(
            &outbound.sender_key(),
            &outbound.signing_key(),
            room_id,
            &session_key,
        )
        .unwrap();
        engine.add_room_key(room_key, RoomKeySource::Direct).await.unwrap();
        assert!(!key_requests.is_pending(room_id, &outbound.session_id()));

        use_case.decrypt_and_save(&mut event).await;
        assert_eq!(event.clear_type(), "m.room.message");
        assert_eq!(event.clear_content()["body"], "It's a secret");

        let result = event.decryption_result.as_ref().unwrap();
        assert_eq!(result.sender_curve25519_key, Some(outbound.sender_key()));
        assert_eq!(result.claimed_ed25519_key, Some(outbound.signing_key()));
    }

    #[tokio::test]
    async fn test_timelines_dont_share_replay_detection() {
        let room_id = room_id!("!test:localhost");
        let store = Arc::new(MemoryStore::new());
        let key_requests = Arc::new(OutgoingKeyRequestManager::new());
        let engine = Arc::new(OlmEngine::new(store.clone()));

        let main = DecryptRoomEventUseCase::new(engine.clone(), store, key_requests);
        let thread = main.clone().with_timeline_id("thread");

        let mut outbound = OutboundRoomKey::new();
        let room_key = InboundGroupSession::from_room_key(
            &outbound.sender_key(),
            &outbound.signing_key(),
            room_id,
            &outbound.session_key(),
        )
        .unwrap();
        engine.add_room_key(room_key, RoomKeySource::Direct).await.unwrap();

        let json = outbound.encrypted_event(event_id!("$a:localhost"), room_id, &ALICE, "Hi");
        let original: RoomEvent = serde_json::from_value(json.clone()).unwrap();

        let mut json = json;
        json["event_id"] = "$b:localhost".into();
        let mut replayed: RoomEvent = serde_json::from_value(json).unwrap();

        main.decrypt(&original, false).await.unwrap();
        thread.decrypt_and_save(&mut replayed).await;
        assert_eq!(replayed.clear_content()["body"], "Hi");

        let result = main.decrypt(&replayed, false).await;
        assert_let!(Err(MegolmError::DuplicatedMessageIndex { first_event_id, .. }) = result);
        assert_eq!(first_event_id, "$a:localhost");
    }
}
