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

use growable_bloom_filter::{GrowableBloom, GrowableBloomBuilder};
use matrix_sdk_e2ee::store::{CryptoStoreError, DynCryptoStore};
use ruma::EventId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, trace};

/// The key under which the ledger is stored in the custom values of the
/// crypto store.
const STORE_KEY: &str = "reported_decryption_failures";

/// Error type for the persistence of the [`ReportedDecryptionFailurePersistence`].
#[derive(Debug, Error)]
pub enum ReportedFailuresError {
    /// The crypto store failed to load or save the ledger.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The ledger couldn't be encoded.
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Sizing of the bloom filter of a [`ReportedDecryptionFailurePersistence`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReportedFailuresConfig {
    /// The number of insertions after which the filter grows a new slice.
    pub estimated_insertions: usize,
    /// The false positive ratio the filter aims for.
    pub desired_error_ratio: f64,
    /// The number of insertions after which the filter is thrown away and
    /// replaced by an empty one.
    pub max_insertions: usize,
}

impl Default for ReportedFailuresConfig {
    fn default() -> Self {
        // A 1% false positive rate after 1000 insertions needs a bit more than a
        // kilobyte of data, every new slice doubles the capacity of the
        // previous one. After 5000 insertions we start from scratch, which keeps
        // the persisted filter small.
        Self { estimated_insertions: 1000, desired_error_ratio: 0.01, max_insertions: 5000 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReportedFailures {
    filter: GrowableBloom,
    insertions: usize,
}

impl ReportedFailures {
    fn new(config: &ReportedFailuresConfig) -> Self {
        let filter = GrowableBloomBuilder::new()
            .estimated_insertions(config.estimated_insertions)
            .desired_error_ratio(config.desired_error_ratio)
            .build();

        Self { filter, insertions: 0 }
    }
}

/// Remembers the events that were reported as undecryptable, across restarts.
///
/// The event ids are kept in a bloom filter: an event that was marked as
/// reported is always found, an event that wasn't may, rarely, be found as
/// well. The filter is recreated once [`ReportedFailuresConfig::max_insertions`]
/// events were marked, old events then lose their reported status.
///
/// The filter lives in memory, [`load()`] and [`persist()`] move it from and to
/// the crypto store.
///
/// [`load()`]: Self::load
/// [`persist()`]: Self::persist
#[derive(Debug)]
pub struct ReportedDecryptionFailurePersistence {
    store: Arc<DynCryptoStore>,
    config: ReportedFailuresConfig,
    reported: Mutex<ReportedFailures>,
}

impl ReportedDecryptionFailurePersistence {
    /// Create an empty ledger, persisted in the given store.
    pub fn new(store: Arc<DynCryptoStore>, config: ReportedFailuresConfig) -> Self {
        let reported = Mutex::new(ReportedFailures::new(&config));
        Self { store, config, reported }
    }

    /// Replace the in-memory ledger with the one found in the store.
    ///
    /// Nothing changes if the store doesn't hold a ledger. A ledger that can't
    /// be decoded is logged and replaced by an empty one.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<(), ReportedFailuresError> {
        let Some(data) = self.store.get_custom_value(STORE_KEY).await? else {
            debug!("No reported decryption failures were persisted");
            return Ok(());
        };

        let loaded = match rmp_serde::from_slice::<ReportedFailures>(&data) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("The persisted decryption failures are corrupted, starting over: {e}");
                ReportedFailures::new(&self.config)
            }
        };

        debug!(insertions = loaded.insertions, "Loaded the reported decryption failures");
        *self.reported.lock().await = loaded;

        Ok(())
    }

    /// Write the in-memory ledger to the store.
    #[instrument(skip(self))]
    pub async fn persist(&self) -> Result<(), ReportedFailuresError> {
        let data = rmp_serde::to_vec_named(&*self.reported.lock().await)?;
        self.store.set_custom_value(STORE_KEY, data).await?;

        Ok(())
    }

    /// Mark the event as reported.
    ///
    /// Returns `false` if the event was already marked.
    pub async fn mark_as_reported(&self, event_id: &EventId) -> bool {
        let mut reported = self.reported.lock().await;

        if reported.filter.contains(event_id.as_str()) {
            return false;
        }

        if reported.insertions >= self.config.max_insertions {
            debug!(
                insertions = reported.insertions,
                "The reported decryption failures filter is saturated, recreating it"
            );
            *reported = ReportedFailures::new(&self.config);
        }

        trace!(%event_id, "Marking the decryption failure as reported");
        reported.filter.insert(event_id.as_str());
        reported.insertions += 1;

        true
    }

    /// Has the event been marked as reported.
    pub async fn has_been_reported(&self, event_id: &EventId) -> bool {
        self.reported.lock().await.filter.contains(event_id.as_str())
    }
}
