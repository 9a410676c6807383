// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::fmt;

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{
    olm::{Account as InnerAccount, AccountPickle, IdentityKeys},
    Curve25519PublicKey, Ed25519PublicKey,
};

/// Account holding identity keys for which sessions can be created.
///
/// An account is the central identity for encrypted communication between two
/// devices.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: Box<InnerAccount>,
    /// Has the account been shared with the server, i.e. were its device keys
    /// uploaded.
    shared: bool,
    /// The number of signed one-time keys we have uploaded to the server.
    uploaded_signed_key_count: u64,
}

impl Account {
    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::from_inner(user_id.to_owned(), device_id.to_owned(), InnerAccount::new(), false, 0)
    }

    /// Wrap an existing vodozemac account, for example one that was read out
    /// of a libolm pickle.
    pub fn from_inner(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        inner: InnerAccount,
        shared: bool,
        uploaded_signed_key_count: u64,
    ) -> Self {
        Self { user_id, device_id, inner: Box::new(inner), shared, uploaded_signed_key_count }
    }

    /// The user that owns this account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device ID that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public parts of the identity keys for the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.inner.identity_keys()
    }

    /// Get the public Curve25519 key of the account.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    /// Get the public Ed25519 key of the account.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.inner.ed25519_key()
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// The number of signed one-time keys we have uploaded to the server.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_signed_key_count
    }

    /// Get a serializable version of the account so it can be persisted.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: self.inner.pickle(),
            shared: self.shared,
            uploaded_signed_key_count: self.uploaded_signed_key_count,
        }
    }

    /// Restore an account from a previously pickled one.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let inner = InnerAccount::from_pickle(pickle.pickle);

        Self::from_inner(
            pickle.user_id,
            pickle.device_id,
            inner,
            pickle.shared,
            pickle.uploaded_signed_key_count,
        )
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared)
            .finish()
    }
}

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device ID of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled version of the Olm account.
    pub pickle: AccountPickle,
    /// Was the account shared.
    pub shared: bool,
    /// The number of uploaded one-time keys we have on the server.
    pub uploaded_signed_key_count: u64,
}
