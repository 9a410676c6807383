// Copyright 2022 The Matrix.org Foundation C.I.C.
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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod cipher;
mod crypto_store;
mod error;
mod legacy_store;
mod utils;

pub use self::{
    crypto_store::SqliteCryptoStore,
    error::{Error, OpenStoreError},
    legacy_store::SqliteLegacyCryptoStore,
};

#[cfg(test)]
matrix_sdk_e2ee_test::init_tracing_for_tests!();
