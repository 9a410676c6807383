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

//! Per room key locks.
//!
//! A Megolm ratchet may only be advanced by one decryption at a time, the
//! locks here serialize the work done on a single inbound group session while
//! letting different sessions make progress in parallel.

use std::{collections::HashMap, sync::Arc};

use ruma::{OwnedRoomId, RoomId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type SessionKey = (OwnedRoomId, String);

/// A set of async locks, one per (room, session id) pair.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    /// Create an empty set of locks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until nobody else holds the lock of the given session, and take
    /// it.
    ///
    /// The lock is released once the returned guard is dropped.
    pub async fn lock(&self, room_id: &RoomId, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;

            // Forget the locks nobody holds or waits for anymore.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);

            locks.entry((room_id.to_owned(), session_id.to_owned())).or_default().clone()
        };

        trace!(%room_id, session_id, "Waiting for the room key lock");

        lock.lock_owned().await
    }

    /// The number of sessions that are currently locked or waited on.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.values().filter(|lock| Arc::strong_count(lock) > 1).count()
    }

    /// Is no session currently locked?
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use ruma::room_id;
    use tokio::time::timeout;

    use super::SessionLocks;

    #[tokio::test]
    async fn test_same_session_is_serialized() {
        let locks = Arc::new(SessionLocks::new());
        let room_id = room_id!("!test:localhost");

        let guard = locks.lock(room_id, "session").await;

        let locks_clone = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks_clone.lock(room_id!("!test:localhost"), "session").await;
        });

        // The second lock can't be taken while we hold the first one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        assert!(locks.is_empty().await);
    }

    #[tokio::test]
    async fn test_different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let room_id = room_id!("!test:localhost");

        let _first = locks.lock(room_id, "first").await;
        let _second =
            timeout(Duration::from_secs(1), locks.lock(room_id, "second")).await.unwrap();
        let _other_room =
            timeout(Duration::from_secs(1), locks.lock(room_id!("!other:localhost"), "first"))
                .await
                .unwrap();

        assert_eq!(locks.len().await, 3);
    }
}
