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

//! A [`CryptoMetrics`] implementation that forwards de-duplicated reports to a
//! telemetry sink.

use std::{error::Error, num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use matrix_sdk_e2ee::{metrics::CryptoMetrics, ErrorKind, MegolmError, RoomKeySource};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

/// How many distinct Megolm sessions the plugin remembers by default.
pub const DEFAULT_DEDUP_CAPACITY: usize = 200;

/// An event the [`CryptoMetricPlugin`] hands over to its sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoEvent {
    /// The first failure to decrypt a room message for a given session.
    UnableToDecryptRoomMessage {
        /// The Megolm session the message was encrypted with.
        session_id: String,
        /// The kind of the decryption failure.
        kind: ErrorKind,
        /// A human readable description of the failure.
        reason: String,
    },

    /// The room key for a session which previously failed to decrypt a
    /// message has been received.
    LateDecryptRoomMessage {
        /// The Megolm session the key belongs to.
        session_id: String,
        /// Where the key came from.
        source: RoomKeySource,
    },

    /// A to-device message couldn't be decrypted.
    UnableToDecryptToDevice {
        /// A description of the failure.
        reason: String,
    },

    /// A to-device message couldn't be sent.
    UnableToSendToDevice {
        /// A description of the failure.
        reason: String,
    },
}

/// The telemetry backend the [`CryptoMetricPlugin`] reports to.
pub trait CryptoMetricsSink: std::fmt::Debug + Send + Sync {
    /// Capture a single event.
    ///
    /// Called from the background task of the plugin, never from the
    /// decryption path.
    fn capture_event(&self, event: CryptoEvent);
}

#[derive(Debug)]
enum Report {
    RoomMessage { session_id: String, kind: ErrorKind, reason: String },
    ToDeviceDecryption(String),
    ToDeviceSending(String),
    RoomKeyImported { session_id: String, source: RoomKeySource },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    /// A decryption failure was reported.
    Failed,
    /// The late arrival of the room key was reported as well.
    LateDecrypted,
}

/// A [`CryptoMetrics`] hook forwarding reports to a [`CryptoMetricsSink`].
///
/// Every report is put on an unbounded queue and the call returns right away.
/// A single background task consumes the queue in order:
///
/// * a room message decryption failure is forwarded the first time its session
///   is seen, the last [`DEFAULT_DEDUP_CAPACITY`] sessions are remembered,
/// * a room key import for a session that failed before is forwarded as a
///   [`CryptoEvent::LateDecryptRoomMessage`], once,
/// * to-device failures are always forwarded.
///
/// The plugin must be created inside a Tokio runtime.
#[derive(Debug)]
pub struct CryptoMetricPlugin {
    sender: mpsc::UnboundedSender<Report>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CryptoMetricPlugin {
    /// Create a new plugin reporting to the given sink.
    pub fn new(sink: Arc<dyn CryptoMetricsSink>) -> Self {
        Self::with_dedup_capacity(sink, DEFAULT_DEDUP_CAPACITY)
    }

    /// Create a new plugin remembering `capacity` sessions for the
    /// de-duplication of decryption failures.
    ///
    /// A capacity of zero is bumped to one.
    pub fn with_dedup_capacity(sink: Arc<dyn CryptoMetricsSink>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let (sender, receiver) = mpsc::unbounded_channel();

        let task = tokio::spawn(Self::consume(receiver, sink, LruCache::new(capacity)));

        Self { sender, task: Mutex::new(Some(task)) }
    }

    /// Wait until every report queued before this call has been handed to the
    /// sink.
    ///
    /// Returns immediately if the plugin was shut down.
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();

        if self.sender.send(Report::Flush(sender)).is_ok() {
            // The consumer went away if the sender got dropped.
            let _ = receiver.await;
        }
    }

    /// Process the queued reports and stop the background task.
    ///
    /// Reports made after the shutdown are dropped.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(Report::Shutdown);

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("The crypto metrics task didn't finish cleanly: {e}");
            }
        }
    }

    fn enqueue(&self, report: Report) {
        if self.sender.send(report).is_err() {
            trace!("The crypto metrics plugin was shut down, dropping a report");
        }
    }

    async fn consume(
        mut receiver: mpsc::UnboundedReceiver<Report>,
        sink: Arc<dyn CryptoMetricsSink>,
        mut sessions: LruCache<String, SessionState>,
    ) {
        while let Some(report) = receiver.recv().await {
            match report {
                Report::RoomMessage { session_id, kind, reason } => {
                    if sessions.get(&session_id).is_some() {
                        trace!(
                            session_id = session_id.as_str(),
                            "Decryption failure already reported"
                        );
                        continue;
                    }

                    sessions.put(session_id.clone(), SessionState::Failed);
                    sink.capture_event(CryptoEvent::UnableToDecryptRoomMessage {
                        session_id,
                        kind,
                        reason,
                    });
                }
                Report::RoomKeyImported { session_id, source } => {
                    let Some(state) = sessions.get_mut(&session_id) else { continue };

                    if *state == SessionState::Failed {
                        *state = SessionState::LateDecrypted;
                        debug!(
                            session_id = session_id.as_str(),
                            ?source,
                            "Received a room key after the fact"
                        );
                        sink.capture_event(CryptoEvent::LateDecryptRoomMessage {
                            session_id,
                            source,
                        });
                    }
                }
                Report::ToDeviceDecryption(reason) => {
                    sink.capture_event(CryptoEvent::UnableToDecryptToDevice { reason });
                }
                Report::ToDeviceSending(reason) => {
                    sink.capture_event(CryptoEvent::UnableToSendToDevice { reason });
                }
                Report::Flush(sender) => {
                    let _ = sender.send(());
                }
                Report::Shutdown => break,
            }
        }

        debug!("The crypto metrics task has stopped");
    }
}

impl CryptoMetrics for CryptoMetricPlugin {
    fn on_failed_to_decrypt_room_message(&self, error: &MegolmError, session_id: &str) {
        self.enqueue(Report::RoomMessage {
            session_id: session_id.to_owned(),
            kind: error.kind(),
            reason: error.to_string(),
        });
    }

    fn on_fail_to_decrypt_to_device(&self, error: &(dyn Error + Send + Sync)) {
        self.enqueue(Report::ToDeviceDecryption(error.to_string()));
    }

    fn on_fail_to_send_to_device(&self, error: &(dyn Error + Send + Sync)) {
        self.enqueue(Report::ToDeviceSending(error.to_string()));
    }

    fn on_room_key_imported(&self, session_id: &str, source: RoomKeySource) {
        self.enqueue(Report::RoomKeyImported { session_id: session_id.to_owned(), source });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches2::assert_let;
    use matrix_sdk_e2ee::{metrics::CryptoMetrics, ErrorKind, MegolmError, RoomKeySource};

    use super::{CryptoEvent, CryptoMetricPlugin, CryptoMetricsSink};

    #[derive(Debug, Default)]
    struct Sink {
        events: Mutex<Vec<CryptoEvent>>,
    }

    impl Sink {
        fn events(&self) -> Vec<CryptoEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl CryptoMetricsSink for Sink {
        fn capture_event(&self, event: CryptoEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn plugin() -> (CryptoMetricPlugin, Arc<Sink>) {
        let sink = Arc::new(Sink::default());
        (CryptoMetricPlugin::new(sink.clone()), sink)
    }

    fn unknown_session() -> MegolmError {
        MegolmError::UnknownInboundSessionId { session_id: "session".to_owned() }
    }

    #[tokio::test]
    async fn test_failures_are_reported_once_per_session() {
        let (plugin, sink) = plugin();

        plugin.on_failed_to_decrypt_room_message(&unknown_session(), "S");
        plugin.on_failed_to_decrypt_room_message(&unknown_session(), "S");
        plugin.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_let!(
            CryptoEvent::UnableToDecryptRoomMessage { session_id, kind, .. } = &events[0]
        );
        assert_eq!(session_id, "S");
        assert_eq!(*kind, ErrorKind::UnknownInboundSessionId);
    }

    #[tokio::test]
    async fn test_least_recently_used_session_is_forgotten() {
        let (plugin, sink) = plugin();

        for i in 0..=200 {
            plugin.on_failed_to_decrypt_room_message(&unknown_session(), &format!("session {i}"));
        }
        plugin.flush().await;
        assert_eq!(sink.events().len(), 201);

        // The most recent sessions are still known.
        plugin.on_failed_to_decrypt_room_message(&unknown_session(), "session 200");
        plugin.on_failed_to_decrypt_room_message(&unknown_session(), "session 1");
        plugin.flush().await;
        assert_eq!(sink.events().len(), 201);

        // The first one got evicted by the 201st.
        plugin.on_failed_to_decrypt_room_message(&unknown_session(), "session 0");
        plugin.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 202);
        assert_let!(CryptoEvent::UnableToDecryptRoomMessage { session_id, .. } = &events[201]);
        assert_eq!(session_id, "session 0");
    }

    #[tokio::test]
    async fn test_late_decryption() {
        let (plugin, sink) = plugin();

        plugin.on_room_key_imported("never failed", RoomKeySource::Direct);
        plugin.on_failed_to_decrypt_room_message(&MegolmError::MissingFields, "S");
        plugin.on_room_key_imported("S", RoomKeySource::Forward);
        plugin.on_room_key_imported("S", RoomKeySource::Backup);
        plugin.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            CryptoEvent::LateDecryptRoomMessage {
                session_id: "S".to_owned(),
                source: RoomKeySource::Forward
            }
        );
    }

    #[tokio::test]
    async fn test_to_device_failures_are_not_deduplicated() {
        let (plugin, sink) = plugin();
        let error = std::io::Error::other("the olm session is wedged");

        plugin.on_fail_to_decrypt_to_device(&error);
        plugin.on_fail_to_decrypt_to_device(&error);
        plugin.on_fail_to_send_to_device(&error);
        plugin.flush().await;

        let reason = "the olm session is wedged".to_owned();
        assert_eq!(
            sink.events(),
            vec![
                CryptoEvent::UnableToDecryptToDevice { reason: reason.clone() },
                CryptoEvent::UnableToDecryptToDevice { reason: reason.clone() },
                CryptoEvent::UnableToSendToDevice { reason },
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_drains_the_queue() {
        let (plugin, sink) = plugin();

        for i in 0..10 {
            plugin.on_failed_to_decrypt_room_message(&unknown_session(), &format!("session {i}"));
        }
        plugin.shutdown().await;
        assert_eq!(sink.events().len(), 10);

        plugin.on_failed_to_decrypt_room_message(&unknown_session(), "too late");
        plugin.flush().await;
        assert_eq!(sink.events().len(), 10);
    }
}
