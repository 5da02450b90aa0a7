// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
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

//! Health aggregation.
//!
//! Rolls the signing backend, the persistence layer, and every registered
//! publisher into one report. Checking health never fails and never mutates
//! state; a dead dependency shows up as `false` in the report, not as an
//! error. The HTTP front-end owns the mapping from report to response
//! status, since that mapping also depends on whether the requested CA is
//! known and in service.

use crate::publisher::PublisherDispatcher;
use crate::signing::SigningBackend;
use crate::store::CertificateStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Point-in-time health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall verdict: every component answered healthy.
    pub healthy: bool,
    /// Signing backend probe result.
    pub signing: bool,
    /// Persistence ping result.
    pub store: bool,
    /// Per-publisher delivery health, keyed by registration name.
    pub publishers: BTreeMap<String, bool>,
}

/// Aggregates component health for one CA engine.
pub struct HealthAggregator {
    backend: Arc<dyn SigningBackend>,
    store: Arc<dyn CertificateStore>,
    dispatcher: Arc<PublisherDispatcher>,
}

impl HealthAggregator {
    /// Build an aggregator over the engine's components.
    pub fn new(
        backend: Arc<dyn SigningBackend>,
        store: Arc<dyn CertificateStore>,
        dispatcher: Arc<PublisherDispatcher>,
    ) -> Self {
        Self {
            backend,
            store,
            dispatcher,
        }
    }

    /// Probe every component and assemble a report.
    pub async fn check(&self) -> HealthReport {
        let signing = self.backend.probe().await.is_ok();
        let store = self.store.ping().await.is_ok();
        let publishers = self.dispatcher.health_details().await;
        let healthy = signing && store && publishers.values().all(|&ok| ok);
        debug!(healthy, signing, store, "health checked");
        HealthReport {
            healthy,
            signing,
            store,
            publishers,
        }
    }
}
