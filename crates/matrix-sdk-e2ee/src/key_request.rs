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

//! Outgoing room key requests.
//!
//! When we receive an event we don't have the room key for, we can ask our
//! other devices, and the sender, to share the key with us. This module keeps
//! track of those requests: which ones need to be sent out, which ones are in
//! flight and which ones need to be cancelled because the key arrived in the
//! meantime.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use ruma::{OwnedRoomId, OwnedTransactionId, RoomId, TransactionId};
use tracing::{debug, trace};

use crate::{types::RoomEvent, AsyncTraitDeps};

/// The consumer side of key requests, as seen by the decryption pipeline.
///
/// Both methods are fire-and-forget, they must not block.
pub trait KeyRequestManager: AsyncTraitDeps {
    /// Queue a request for the room key of the given encrypted event.
    ///
    /// # Arguments
    ///
    /// * `event` - The event we failed to decrypt.
    ///
    /// * `force_resend` - Send the request again even if an identical one is
    ///   already in flight.
    fn request_key_for_event(&self, event: &RoomEvent, force_resend: bool);

    /// A room key arrived, requests for it are not needed anymore.
    fn on_room_key_received(&self, room_id: &RoomId, session_id: &str);
}

/// The state an outgoing key request is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// The request still needs to be sent out.
    Unsent,
    /// The request was sent out, we are waiting for a key.
    Sent,
    /// The key arrived after the request was sent, a cancellation needs to be
    /// sent out.
    CancellationPending,
}

/// A request for a single room key.
#[derive(Clone, Debug)]
pub struct OutgoingKeyRequest {
    /// The unique id of the request.
    pub request_id: OwnedTransactionId,
    /// The room the requested key belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the requested key.
    pub session_id: String,
    /// The Curve25519 key of the creator of the requested key.
    pub sender_key: String,
    /// The algorithm of the requested key.
    pub algorithm: String,
    /// Where the request is in its lifecycle.
    pub state: RequestState,
    created_at: Instant,
}

type RequestInfo = (OwnedRoomId, String, String);

/// An in-memory [`KeyRequestManager`], de-duplicating requests by the room,
/// session id and sender key of the requested key.
#[derive(Debug, Default)]
pub struct OutgoingKeyRequestManager {
    requests: Mutex<HashMap<RequestInfo, OutgoingKeyRequest>>,
}

impl OutgoingKeyRequestManager {
    /// Create a manager with no requests.
    pub fn new() -> Self {
        Self::default()
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<RequestInfo, OutgoingKeyRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The requests that need to be sent out, either as a request or as a
    /// cancellation.
    pub fn outgoing_requests(&self) -> Vec<OutgoingKeyRequest> {
        self.requests()
            .values()
            .filter(|r| matches!(r.state, RequestState::Unsent | RequestState::CancellationPending))
            .cloned()
            .collect()
    }

    /// Is there any request for the given room key that hasn't been answered?
    pub fn is_pending(&self, room_id: &RoomId, session_id: &str) -> bool {
        self.requests().values().any(|r| {
            &*r.room_id == room_id
                && r.session_id == session_id
                && r.state != RequestState::CancellationPending
        })
    }

    /// The request with the given id was sent out.
    ///
    /// Sent requests wait for their key, sent cancellations are forgotten.
    pub fn mark_request_as_sent(&self, request_id: &TransactionId) {
        let mut requests = self.requests();

        let Some((info, request)) =
            requests.iter_mut().find(|(_, request)| &*request.request_id == request_id)
        else {
            trace!(%request_id, "Tried to mark an unknown key request as sent");
            return;
        };

        match request.state {
            RequestState::Unsent => request.state = RequestState::Sent,
            RequestState::Sent => {}
            RequestState::CancellationPending => {
                let info = info.clone();
                requests.remove(&info);
            }
        }
    }

    /// Forget the sent requests that didn't get an answer for longer than the
    /// given duration.
    ///
    /// Returns the number of forgotten requests.
    pub fn expire(&self, older_than: Duration) -> usize {
        let mut requests = self.requests();
        let before = requests.len();

        requests
            .retain(|_, r| r.state != RequestState::Sent || r.created_at.elapsed() < older_than);

        let expired = before - requests.len();

        if expired > 0 {
            debug!(expired, "Expired unanswered key requests");
        }

        expired
    }
}

impl KeyRequestManager for OutgoingKeyRequestManager {
    fn request_key_for_event(&self, event: &RoomEvent, force_resend: bool) {
        let (Some(room_id), Some(content)) = (&event.room_id, event.encrypted_content()) else {
            trace!(event_id = %event.event_id, "Not requesting a key for a non-encrypted event");
            return;
        };

        if content.has_missing_fields() {
            return;
        }

        let info = (room_id.clone(), content.session_id.clone(), content.sender_key.clone());
        let mut requests = self.requests();

        if let Some(request) = requests.get_mut(&info) {
            if force_resend && request.state != RequestState::Unsent {
                debug!(
                    %room_id,
                    session_id = content.session_id.as_str(),
                    "Re-queuing an already sent key request"
                );

                request.request_id = TransactionId::new();
                request.state = RequestState::Unsent;
                request.created_at = Instant::now();
            }

            return;
        }

        debug!(%room_id, session_id = content.session_id.as_str(), "Queuing a new key request");

        requests.insert(
            info,
            OutgoingKeyRequest {
                request_id: TransactionId::new(),
                room_id: room_id.clone(),
                session_id: content.session_id,
                sender_key: content.sender_key,
                algorithm: content.algorithm,
                state: RequestState::Unsent,
                created_at: Instant::now(),
            },
        );
    }

    fn on_room_key_received(&self, room_id: &RoomId, session_id: &str) {
        let mut requests = self.requests();

        requests.retain(|_, request| {
            if &*request.room_id != room_id || request.session_id != session_id {
                return true;
            }

            match request.state {
                // Never sent out, nobody needs to know about it.
                RequestState::Unsent => false,
                RequestState::Sent | RequestState::CancellationPending => {
                    request.state = RequestState::CancellationPending;
                    true
                }
            }
        });
    }
}
