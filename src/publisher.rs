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

//! Publisher dispatch.
//!
//! Fans lifecycle events out to registered publishers. Synchronous
//! publishers block the dispatching call and report failure back as a
//! degraded (but committed) result; asynchronous publishers get events
//! queued to a per-publisher worker task whose failures surface only
//! through health status. One failing publisher never blocks dispatch to
//! the others and never unwinds the lifecycle transition that produced
//! the event.

use crate::config::{PublisherConfig, RetryPolicy};
use crate::error::{CaError, Result};
use crate::lifecycle::CertificateRecord;
use crate::types::{RevocationReason, Serial};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Queue depth for each asynchronous publisher.
const ASYNC_QUEUE_DEPTH: usize = 256;

/// A certificate lifecycle event delivered to publishers.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A CA entered service.
    CaAdded {
        /// CA name.
        ca: String,
    },
    /// A CA was revoked.
    CaRevoked {
        /// CA name.
        ca: String,
        /// Revocation reason.
        reason: RevocationReason,
    },
    /// A CA revocation was lifted.
    CaUnrevoked {
        /// CA name.
        ca: String,
    },
    /// A certificate was issued.
    CertificateAdded {
        /// Issuing CA name.
        ca: String,
        /// The freshly persisted record.
        record: CertificateRecord,
    },
    /// A certificate was revoked.
    CertificateRevoked {
        /// Issuing CA name.
        ca: String,
        /// Certificate serial.
        serial: Serial,
        /// Revocation reason.
        reason: RevocationReason,
        /// Revocation time.
        revoked_at: SystemTime,
    },
    /// A certificate revocation was lifted.
    CertificateUnrevoked {
        /// Issuing CA name.
        ca: String,
        /// Certificate serial.
        serial: Serial,
    },
    /// A certificate was logically removed.
    CertificateRemoved {
        /// Issuing CA name.
        ca: String,
        /// Certificate serial.
        serial: Serial,
    },
    /// A CRL was signed and is ready for distribution.
    CrlAdded {
        /// Issuing CA name.
        ca: String,
        /// When the CRL was signed.
        signed_at: SystemTime,
    },
}

impl LifecycleEvent {
    /// Whether this is a "good"/non-terminal event that publishers may opt
    /// out of via [`Publisher::publishes_good_cert`].
    ///
    /// Revocation, removal, and CRL events are always delivered.
    pub fn is_good_event(&self) -> bool {
        matches!(
            self,
            Self::CaAdded { .. }
                | Self::CaUnrevoked { .. }
                | Self::CertificateAdded { .. }
                | Self::CertificateUnrevoked { .. }
        )
    }

    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CaAdded { .. } => "caAdded",
            Self::CaRevoked { .. } => "caRevoked",
            Self::CaUnrevoked { .. } => "caUnrevoked",
            Self::CertificateAdded { .. } => "certificateAdded",
            Self::CertificateRevoked { .. } => "certificateRevoked",
            Self::CertificateUnrevoked { .. } => "certificateUnrevoked",
            Self::CertificateRemoved { .. } => "certificateRemoved",
            Self::CrlAdded { .. } => "crlAdded",
        }
    }
}

/// Publisher service provider interface.
///
/// Implemented by external sinks (LDAP directories, database mirrors,
/// distribution services). `publish` returns a success boolean rather than
/// an error: publishers own their error reporting, and the dispatcher only
/// needs to know whether delivery happened.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Prepare the publisher for delivery. Called once at registration.
    async fn initialize(&self, config: &PublisherConfig) -> Result<()>;

    /// Release publisher resources. Called at unregistration.
    async fn shutdown(&self);

    /// Whether this publisher wants "good"/non-terminal events.
    fn publishes_good_cert(&self) -> bool;

    /// Whether events should be queued rather than delivered inline.
    fn is_asynchronous(&self) -> bool;

    /// Deliver one event. Returns `true` on success.
    async fn publish(&self, event: &LifecycleEvent) -> bool;

    /// Publisher-side health. Combined with delivery health by the
    /// dispatcher.
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Outcome of one dispatch: which synchronous publishers failed.
///
/// An empty `failed` list means every synchronous publisher that wanted the
/// event confirmed delivery. Asynchronous failures never appear here; they
/// surface through [`PublisherDispatcher::is_healthy`].
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    failed: Vec<String>,
}

impl DispatchReport {
    /// Names of synchronous publishers that failed this event.
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// Whether any synchronous publisher failed.
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

struct Registration {
    name: String,
    publisher: Arc<dyn Publisher>,
    config: PublisherConfig,
    delivery_healthy: Arc<AtomicBool>,
    queue: Option<mpsc::Sender<LifecycleEvent>>,
}

/// Fan-out of lifecycle events to registered publishers.
pub struct PublisherDispatcher {
    registrations: RwLock<Vec<Arc<Registration>>>,
    publisher_timeout: Duration,
}

impl PublisherDispatcher {
    /// Create a dispatcher with no publishers registered.
    ///
    /// `publisher_timeout` bounds each synchronous delivery; a publisher
    /// that exceeds it counts as failed for that event.
    pub fn new(publisher_timeout: Duration) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            publisher_timeout,
        }
    }

    /// Register and initialize a publisher.
    ///
    /// Registration names must be unique; re-registering a name fails with
    /// a configuration error.
    pub async fn register(&self, config: PublisherConfig, publisher: Arc<dyn Publisher>) -> Result<()> {
        {
            let registrations = self.registrations.read().expect("registrations poisoned");
            if registrations.iter().any(|r| r.name == config.name) {
                return Err(CaError::configuration(format!(
                    "publisher '{}' is already registered",
                    config.name
                )));
            }
        }

        publisher.initialize(&config).await?;

        let delivery_healthy = Arc::new(AtomicBool::new(true));
        let queue = if publisher.is_asynchronous() {
            let (tx, rx) = mpsc::channel(ASYNC_QUEUE_DEPTH);
            spawn_async_worker(
                config.name.clone(),
                publisher.clone(),
                config.retry.clone(),
                delivery_healthy.clone(),
                rx,
            );
            Some(tx)
        } else {
            None
        };

        let registration = Arc::new(Registration {
            name: config.name.clone(),
            publisher,
            config,
            delivery_healthy,
            queue,
        });
        self.registrations
            .write()
            .expect("registrations poisoned")
            .push(registration);
        Ok(())
    }

    /// Unregister a publisher, shutting it down.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let registration = {
            let mut registrations = self.registrations.write().expect("registrations poisoned");
            let index = registrations
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| {
                    CaError::configuration(format!("publisher '{name}' is not registered"))
                })?;
            registrations.remove(index)
        };
        // Dropping the queue sender lets the worker drain and exit.
        registration.publisher.shutdown().await;
        Ok(())
    }

    /// Deliver `event` to every registered publisher that wants it.
    pub async fn dispatch(&self, event: &LifecycleEvent) -> DispatchReport {
        let snapshot: Vec<Arc<Registration>> = self
            .registrations
            .read()
            .expect("registrations poisoned")
            .clone();

        let mut report = DispatchReport::default();
        for registration in snapshot {
            if event.is_good_event() && !registration.publisher.publishes_good_cert() {
                continue;
            }

            match &registration.queue {
                Some(queue) => {
                    // Best-effort hand-off; a full queue degrades health but
                    // never the caller's result.
                    if queue.try_send(event.clone()).is_err() {
                        warn!(
                            publisher = %registration.name,
                            event = event.kind(),
                            "async publisher queue full, event dropped"
                        );
                        registration.delivery_healthy.store(false, Ordering::SeqCst);
                    }
                }
                None => {
                    let delivered = timeout(
                        self.publisher_timeout,
                        registration.publisher.publish(event),
                    )
                    .await
                    .unwrap_or(false);
                    if delivered {
                        registration.delivery_healthy.store(true, Ordering::SeqCst);
                        debug!(
                            publisher = %registration.name,
                            event = event.kind(),
                            "published"
                        );
                    } else {
                        warn!(
                            publisher = %registration.name,
                            event = event.kind(),
                            "synchronous publisher failed"
                        );
                        registration.delivery_healthy.store(false, Ordering::SeqCst);
                        report.failed.push(registration.name.clone());
                    }
                }
            }
        }
        report
    }

    /// Aggregate health across all registered publishers.
    pub async fn is_healthy(&self) -> bool {
        let snapshot: Vec<Arc<Registration>> = self
            .registrations
            .read()
            .expect("registrations poisoned")
            .clone();
        for registration in snapshot {
            if !registration.delivery_healthy.load(Ordering::SeqCst)
                || !registration.publisher.is_healthy().await
            {
                return false;
            }
        }
        true
    }

    /// Per-publisher health, for the health aggregator's detail map.
    pub async fn health_details(&self) -> BTreeMap<String, bool> {
        let snapshot: Vec<Arc<Registration>> = self
            .registrations
            .read()
            .expect("registrations poisoned")
            .clone();
        let mut details = BTreeMap::new();
        for registration in snapshot {
            let healthy = registration.delivery_healthy.load(Ordering::SeqCst)
                && registration.publisher.is_healthy().await;
            details.insert(registration.name.clone(), healthy);
        }
        details
    }

    /// Names of currently registered publishers.
    pub fn registered(&self) -> Vec<String> {
        self.registrations
            .read()
            .expect("registrations poisoned")
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    /// The retry policy configured for a registered publisher.
    pub fn retry_policy(&self, name: &str) -> Option<RetryPolicy> {
        self.registrations
            .read()
            .expect("registrations poisoned")
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.config.retry.clone())
    }
}

fn spawn_async_worker(
    name: String,
    publisher: Arc<dyn Publisher>,
    retry: RetryPolicy,
    healthy: Arc<AtomicBool>,
    mut rx: mpsc::Receiver<LifecycleEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut delivered = false;
            for attempt in 1..=retry.max_attempts.max(1) {
                if publisher.publish(&event).await {
                    delivered = true;
                    break;
                }
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.backoff).await;
                }
            }
            if delivered {
                healthy.store(true, Ordering::SeqCst);
            } else {
                warn!(
                    publisher = %name,
                    event = event.kind(),
                    attempts = retry.max_attempts,
                    "async publisher exhausted retries"
                );
                healthy.store(false, Ordering::SeqCst);
            }
        }
        debug!(publisher = %name, "async publisher worker stopped");
    });
}
