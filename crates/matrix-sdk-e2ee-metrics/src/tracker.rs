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

//! Reporting of unable-to-decrypt (UTD) events, at most once per event.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use lru::LruCache;
use matrix_sdk_e2ee::{ErrorKind, MegolmError};
use ruma::{EventId, OwnedEventId};
use tracing::{error, trace};

use crate::ReportedDecryptionFailurePersistence;

/// How many UTDs are remembered while waiting for them to be decrypted late.
const PENDING_UTDS_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1_000) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

/// A generic interface which methods get called whenever we observe an
/// unable-to-decrypt (UTD) event.
pub trait UnableToDecryptHook: std::fmt::Debug + Send + Sync {
    /// Called the first time an event couldn't be decrypted, and again if it
    /// could be decrypted later on.
    fn on_utd(&self, info: UnableToDecryptInfo);
}

/// Information about an event we were unable to decrypt (UTD).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnableToDecryptInfo {
    /// The identifier of the event that couldn't get decrypted.
    pub event_id: OwnedEventId,

    /// Why the event couldn't be decrypted.
    pub kind: ErrorKind,

    /// If the event could be decrypted late, the time it took since it was
    /// reported as a UTD. A definite UTD if not set.
    pub time_to_decrypt: Option<Duration>,
}

#[derive(Debug)]
struct PendingUtd {
    marked_utd_at: Instant,
    kind: ErrorKind,
}

/// A manager over an [`UnableToDecryptHook`] that reports every UTD only once,
/// even across restarts, thanks to a [`ReportedDecryptionFailurePersistence`].
#[derive(Debug)]
pub struct DecryptionFailureTracker {
    ledger: Arc<ReportedDecryptionFailurePersistence>,
    hook: Arc<dyn UnableToDecryptHook>,
    /// The UTDs reported by this tracker which haven't been decrypted yet.
    ///
    /// Once full, the oldest UTDs are dropped and their late decryption goes
    /// unreported.
    pending: Mutex<LruCache<OwnedEventId, PendingUtd>>,
}

impl DecryptionFailureTracker {
    /// Create a new tracker.
    ///
    /// The ledger should have been [loaded] beforehand, otherwise events
    /// reported in a previous run will be reported again.
    ///
    /// [loaded]: ReportedDecryptionFailurePersistence::load
    pub fn new(
        ledger: Arc<ReportedDecryptionFailurePersistence>,
        hook: Arc<dyn UnableToDecryptHook>,
    ) -> Self {
        Self { ledger, hook, pending: Mutex::new(LruCache::new(PENDING_UTDS_CAPACITY)) }
    }

    /// Change how many UTDs are kept around waiting for a late decryption.
    pub fn with_pending_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.pending = Mutex::new(LruCache::new(capacity));
        self
    }

    /// An event couldn't be decrypted.
    ///
    /// The hook is called unless the event was already reported. The ledger is
    /// persisted after every new report, a failure to do so is only logged.
    pub async fn on_event_undecryptable(&self, event_id: &EventId, error: &MegolmError) {
        trace!(%event_id, "Observed a UTD");

        if !self.ledger.mark_as_reported(event_id).await {
            trace!(%event_id, "The UTD was already reported");
            return;
        }

        let kind = error.kind();

        self.pending
            .lock()
            .unwrap()
            .put(event_id.to_owned(), PendingUtd { marked_utd_at: Instant::now(), kind });

        self.hook.on_utd(UnableToDecryptInfo {
            event_id: event_id.to_owned(),
            kind,
            time_to_decrypt: None,
        });

        if let Err(e) = self.ledger.persist().await {
            error!("Unable to persist the reported decryption failures: {e}");
        }
    }

    /// An event could be decrypted.
    ///
    /// If the event was reported as a UTD by this tracker, the hook is called
    /// once more with the time it took to decrypt it.
    pub fn on_event_decrypted(&self, event_id: &EventId) {
        let Some(pending) = self.pending.lock().unwrap().pop(event_id) else {
            return;
        };

        trace!(%event_id, "A UTD got decrypted late");

        self.hook.on_utd(UnableToDecryptInfo {
            event_id: event_id.to_owned(),
            kind: pending.kind,
            time_to_decrypt: Some(pending.marked_utd_at.elapsed()),
        });
    }
}
