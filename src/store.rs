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

//! Certificate record persistence.
//!
//! The lifecycle engine persists every transition through a
//! [`CertificateStore`] before publishing it; a record that is not durable
//! is a record that did not happen. [`MemoryStore`] is the in-process
//! implementation used by development deployments and tests.

use crate::error::{CaError, Result};
use crate::identity::CaIdentity;
use crate::lifecycle::{CaStatus, CertificateRecord};
use crate::types::Serial;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Durable storage for certificate records and CA identity state.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Load one record by serial, `None` if the CA never issued it (or the
    /// record was purged).
    async fn load_certificate(&self, ca: &str, serial: &Serial)
        -> Result<Option<CertificateRecord>>;

    /// Insert or replace a record. The caller holds the per-serial lock.
    async fn upsert_certificate(&self, ca: &str, record: &CertificateRecord) -> Result<()>;

    /// Physically delete a record. Only called for purge.
    async fn delete_certificate(&self, ca: &str, serial: &Serial) -> Result<()>;

    /// All records currently in a revoked state, for CRL assembly.
    async fn list_revoked(&self, ca: &str) -> Result<Vec<CertificateRecord>>;

    /// Load the persisted CA identity, if any.
    async fn load_ca_identity(&self, ca: &str) -> Result<Option<CaIdentity>>;

    /// Persist the CA identity snapshot.
    async fn update_ca_identity(&self, ca: &str, identity: &CaIdentity) -> Result<()>;

    /// Load the persisted CA lifecycle status, `None` if the CA was never
    /// brought into service on this store.
    async fn load_ca_status(&self, ca: &str) -> Result<Option<CaStatus>>;

    /// Persist the CA lifecycle status. A CA revocation that is not durable
    /// here would silently reverse on restart.
    async fn update_ca_status(&self, ca: &str, status: &CaStatus) -> Result<()>;

    /// Cheap reachability check for startup and health probes.
    async fn ping(&self) -> Result<()>;
}

#[derive(Default)]
struct CaBucket {
    identity: Option<CaIdentity>,
    status: Option<CaStatus>,
    records: HashMap<Serial, CertificateRecord>,
}

/// In-memory store. Not durable; development and test use only.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, CaBucket>>,
    unreachable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a persistence outage. While set, every operation fails with
    /// a store error. Test hook.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CaError::store("persistence unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn load_certificate(
        &self,
        ca: &str,
        serial: &Serial,
    ) -> Result<Option<CertificateRecord>> {
        self.check_reachable()?;
        let buckets = self.buckets.read().expect("store poisoned");
        Ok(buckets
            .get(ca)
            .and_then(|bucket| bucket.records.get(serial))
            .cloned())
    }

    async fn upsert_certificate(&self, ca: &str, record: &CertificateRecord) -> Result<()> {
        self.check_reachable()?;
        let mut buckets = self.buckets.write().expect("store poisoned");
        buckets
            .entry(ca.to_string())
            .or_default()
            .records
            .insert(record.serial().clone(), record.clone());
        Ok(())
    }

    async fn delete_certificate(&self, ca: &str, serial: &Serial) -> Result<()> {
        self.check_reachable()?;
        let mut buckets = self.buckets.write().expect("store poisoned");
        if let Some(bucket) = buckets.get_mut(ca) {
            bucket.records.remove(serial);
        }
        Ok(())
    }

    async fn list_revoked(&self, ca: &str) -> Result<Vec<CertificateRecord>> {
        self.check_reachable()?;
        let buckets = self.buckets.read().expect("store poisoned");
        let mut revoked: Vec<CertificateRecord> = buckets
            .get(ca)
            .map(|bucket| {
                bucket
                    .records
                    .values()
                    .filter(|r| r.status().is_revoked())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        revoked.sort_by(|a, b| a.serial().as_bytes().cmp(b.serial().as_bytes()));
        Ok(revoked)
    }

    async fn load_ca_identity(&self, ca: &str) -> Result<Option<CaIdentity>> {
        self.check_reachable()?;
        let buckets = self.buckets.read().expect("store poisoned");
        Ok(buckets.get(ca).and_then(|bucket| bucket.identity.clone()))
    }

    async fn update_ca_identity(&self, ca: &str, identity: &CaIdentity) -> Result<()> {
        self.check_reachable()?;
        let mut buckets = self.buckets.write().expect("store poisoned");
        buckets.entry(ca.to_string()).or_default().identity = Some(identity.clone());
        Ok(())
    }

    async fn load_ca_status(&self, ca: &str) -> Result<Option<CaStatus>> {
        self.check_reachable()?;
        let buckets = self.buckets.read().expect("store poisoned");
        Ok(buckets.get(ca).and_then(|bucket| bucket.status.clone()))
    }

    async fn update_ca_status(&self, ca: &str, status: &CaStatus) -> Result<()> {
        self.check_reachable()?;
        let mut buckets = self.buckets.write().expect("store poisoned");
        buckets.entry(ca.to_string()).or_default().status = Some(status.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }
}
