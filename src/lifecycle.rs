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

//! Certificate lifecycle engine.
//!
//! Owns every certificate state transition for one CA: issuance,
//! revocation, unrevocation, logical removal, physical purge, and CRL
//! signing. Transitions are serialized per serial; every transition signs
//! (when needed), persists, and only then publishes. A persisted transition
//! whose synchronous publication failed is committed but degraded; the
//! receipt says so, and the state never rolls back.
//!
//! Status records are append-in-place: `Removed` keeps the row so that a
//! serial is never silently reusable while history exists. Only `purge`
//! deletes, and only from `Removed`.

use crate::error::{CaError, Result};
use crate::identity::CaIdentity;
use crate::publisher::{DispatchReport, LifecycleEvent, PublisherDispatcher};
use crate::signing::SigningBackend;
use crate::store::CertificateStore;
use crate::types::{RevocationReason, Serial};
use const_oid::db::rfc5280::{ID_CE_CRL_REASONS, ID_CE_INVALIDITY_DATE};
use der::asn1::{BitString, GeneralizedTime, OctetString, UtcTime};
use der::Encode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::CrlReason;
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Time;
use x509_cert::{Certificate, TbsCertificate, Version};

/// Keyed-lock map is pruned once it grows past this many entries.
const SERIAL_LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Lifecycle state of one issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertStatus {
    /// Valid and in service.
    Good,
    /// Revoked. Permanent-reason revocations cannot be lifted.
    Revoked {
        /// Why the certificate was revoked.
        reason: RevocationReason,
        /// When the revocation took effect.
        revoked_at: SystemTime,
        /// When the certificate is believed to have become invalid, if
        /// earlier than the revocation itself.
        invalidity_at: Option<SystemTime>,
    },
    /// Logically removed. The record survives; only purge deletes it.
    Removed,
}

impl CertStatus {
    /// Whether the certificate is in service.
    pub fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }

    /// Whether the certificate is revoked.
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked { .. })
    }

    /// Whether the certificate was logically removed.
    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed)
    }
}

/// One issued certificate as persisted by the engine.
///
/// Constructed only by the lifecycle engine; stores and publishers see it
/// read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    serial: Serial,
    certificate_der: Vec<u8>,
    profile: String,
    issued_at: SystemTime,
    status: CertStatus,
}

impl CertificateRecord {
    /// Certificate serial number.
    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    /// DER encoding of the full signed certificate.
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Parse the stored certificate.
    pub fn certificate(&self) -> Result<Certificate> {
        use der::Decode;
        Ok(Certificate::from_der(&self.certificate_der)?)
    }

    /// Issuance profile name supplied by the front-end.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// When the certificate was issued.
    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    /// Current lifecycle status.
    pub fn status(&self) -> &CertStatus {
        &self.status
    }
}

/// Issuance input: a profile name and the to-be-signed certificate the
/// front-end assembled.
///
/// The engine overwrites the TBS signature algorithm with the one matching
/// its signing key, signs, and persists the result.
#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    /// Profile under which the certificate is issued.
    pub profile: String,
    /// The certificate body to sign. Its serial number becomes the record
    /// key.
    pub tbs: TbsCertificate,
}

/// Lifecycle state of the CA itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaStatus {
    /// The CA issues and serves normally.
    InService,
    /// The CA is revoked: no new issuance, but status and CRL service
    /// continue.
    Revoked {
        /// Why the CA was revoked.
        reason: RevocationReason,
        /// When the revocation took effect.
        revoked_at: SystemTime,
    },
}

/// Outcome of a committed certificate transition.
#[derive(Debug, Clone)]
pub struct TransitionReceipt {
    record: CertificateRecord,
    publishing: DispatchReport,
}

impl TransitionReceipt {
    /// The record as persisted by this transition.
    pub fn record(&self) -> &CertificateRecord {
        &self.record
    }

    /// Synchronous publication outcome.
    pub fn publishing(&self) -> &DispatchReport {
        &self.publishing
    }

    /// Whether the transition committed but some synchronous publisher
    /// failed.
    pub fn is_degraded(&self) -> bool {
        self.publishing.is_degraded()
    }
}

/// A signed CRL ready for distribution.
#[derive(Debug, Clone)]
pub struct CrlArtifact {
    crl_der: Vec<u8>,
    entry_count: usize,
    signed_at: SystemTime,
}

impl CrlArtifact {
    /// DER encoding of the full signed CRL.
    pub fn crl_der(&self) -> &[u8] {
        &self.crl_der
    }

    /// Number of revoked entries in the CRL.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// When the CRL was signed.
    pub fn signed_at(&self) -> SystemTime {
        self.signed_at
    }
}

/// Outcome of a CRL signing run.
#[derive(Debug, Clone)]
pub struct CrlReceipt {
    artifact: CrlArtifact,
    publishing: DispatchReport,
}

impl CrlReceipt {
    /// The signed CRL.
    pub fn artifact(&self) -> &CrlArtifact {
        &self.artifact
    }

    /// Synchronous publication outcome.
    pub fn publishing(&self) -> &DispatchReport {
        &self.publishing
    }
}

/// State machine driver for one CA.
pub struct CaLifecycleEngine {
    ca_name: String,
    identity: RwLock<CaIdentity>,
    ca_status: RwLock<CaStatus>,
    backend: Arc<dyn SigningBackend>,
    store: Arc<dyn CertificateStore>,
    dispatcher: Arc<PublisherDispatcher>,
    sign_timeout: Duration,
    serial_locks: StdMutex<HashMap<Serial, Arc<AsyncMutex<()>>>>,
    // Serializes CA-level transitions across their persist step.
    ca_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for CaLifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaLifecycleEngine")
            .field("ca_name", &self.ca_name)
            .finish_non_exhaustive()
    }
}

impl CaLifecycleEngine {
    /// Bring a CA into service.
    ///
    /// Startup is fail-fast: the store must answer a ping and the signing
    /// backend must answer a probe before the engine accepts work. The
    /// first start persists the identity snapshot and an `InService` status
    /// and dispatches `CaAdded`; a restart restores the persisted lifecycle
    /// status instead, so a revoked CA comes back revoked.
    pub async fn start(
        ca_name: impl Into<String>,
        identity: CaIdentity,
        backend: Arc<dyn SigningBackend>,
        store: Arc<dyn CertificateStore>,
        dispatcher: Arc<PublisherDispatcher>,
        sign_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let ca_name = ca_name.into();

        store.ping().await.map_err(|e| {
            CaError::configuration(format!("persistence unreachable at startup: {e}"))
        })?;
        backend.probe().await.map_err(|e| {
            CaError::configuration(format!("signing backend unreachable at startup: {e}"))
        })?;

        // The persisted lifecycle status is the truth across restarts; a
        // revoked CA must come back revoked, never silently in service.
        let persisted = store.load_ca_status(&ca_name).await?;
        let first_start = persisted.is_none();
        let ca_status = persisted.unwrap_or(CaStatus::InService);
        if first_start {
            store.update_ca_status(&ca_name, &ca_status).await?;
        }
        store.update_ca_identity(&ca_name, &identity).await?;

        if let CaStatus::Revoked { reason, .. } = &ca_status {
            warn!(ca = %ca_name, reason = reason.as_str(), "CA restored in revoked state");
        }

        let engine = Arc::new(Self {
            identity: RwLock::new(identity),
            ca_status: RwLock::new(ca_status),
            backend,
            store,
            dispatcher,
            sign_timeout,
            serial_locks: StdMutex::new(HashMap::new()),
            ca_lock: AsyncMutex::new(()),
            ca_name,
        });

        if first_start {
            let report = engine
                .dispatcher
                .dispatch(&LifecycleEvent::CaAdded {
                    ca: engine.ca_name.clone(),
                })
                .await;
            if report.is_degraded() {
                warn!(ca = %engine.ca_name, failed = ?report.failed(), "caAdded publication degraded");
            }
        }
        info!(ca = %engine.ca_name, "CA in service");
        Ok(engine)
    }

    /// CA name used as the persistence key and in events.
    pub fn ca_name(&self) -> &str {
        &self.ca_name
    }

    /// Snapshot of the CA identity.
    pub fn identity(&self) -> CaIdentity {
        self.identity.read().expect("identity poisoned").clone()
    }

    /// Current CA lifecycle status.
    pub fn ca_status(&self) -> CaStatus {
        self.ca_status.read().expect("ca status poisoned").clone()
    }

    /// Install or clear the CRL-signer certificate and persist the updated
    /// identity.
    pub async fn set_crl_signer_certificate(
        &self,
        signer: Option<x509_cert::Certificate>,
    ) -> Result<()> {
        let updated = {
            let mut identity = self.identity.write().expect("identity poisoned");
            identity.set_crl_signer_certificate(signer)?;
            identity.clone()
        };
        self.store.update_ca_identity(&self.ca_name, &updated).await
    }

    /// Replace the advertised URI sets and persist the updated identity.
    pub async fn update_uris(&self, uris: crate::identity::CaUris) -> Result<()> {
        let updated = {
            let mut identity = self.identity.write().expect("identity poisoned");
            identity.set_uris(uris);
            identity.clone()
        };
        self.store.update_ca_identity(&self.ca_name, &updated).await
    }

    /// Issue a certificate.
    ///
    /// Fails with [`CaError::DuplicateSerial`] while a live (`Good` or
    /// `Revoked`) record holds the serial. A `Removed` record may be
    /// re-issued over. Fails with [`CaError::CaNotInService`] while the CA
    /// is revoked.
    #[instrument(skip(self, request), fields(ca = %self.ca_name, profile = %request.profile))]
    pub async fn issue(&self, request: IssuanceRequest) -> Result<TransitionReceipt> {
        self.require_in_service()?;

        let mut tbs = request.tbs;
        let serial = Serial::new(tbs.serial_number.as_bytes().to_vec());
        let lock = self.serial_lock(&serial);
        let _guard = lock.lock_owned().await;

        if let Some(existing) = self.store.load_certificate(&self.ca_name, &serial).await? {
            if !existing.status.is_removed() {
                return Err(CaError::DuplicateSerial {
                    serial: serial.to_string(),
                });
            }
        }

        let mechanism = self.backend.identity().handle().algorithm().default_mechanism();
        let algorithm = mechanism.algorithm_identifier()?;
        tbs.signature = algorithm.clone();

        let tbs_der = tbs.to_der()?;
        let signature = self.sign(mechanism, &tbs_der).await?;
        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&signature)?,
        };

        let record = CertificateRecord {
            serial: serial.clone(),
            certificate_der: certificate.to_der()?,
            profile: request.profile,
            issued_at: SystemTime::now(),
            status: CertStatus::Good,
        };
        self.store.upsert_certificate(&self.ca_name, &record).await?;

        let publishing = self
            .dispatcher
            .dispatch(&LifecycleEvent::CertificateAdded {
                ca: self.ca_name.clone(),
                record: record.clone(),
            })
            .await;
        info!(serial = %serial, degraded = publishing.is_degraded(), "certificate issued");
        Ok(TransitionReceipt { record, publishing })
    }

    /// Revoke a certificate.
    ///
    /// Re-revoking an already-revoked certificate fails with
    /// [`CaError::AlreadyRevoked`] unless the new reason is permanent and
    /// the standing one is not; that single case upgrades the revocation in
    /// place.
    #[instrument(skip(self), fields(ca = %self.ca_name, serial = %serial, reason = reason.as_str()))]
    pub async fn revoke(
        &self,
        serial: &Serial,
        reason: RevocationReason,
        invalidity_at: Option<SystemTime>,
    ) -> Result<TransitionReceipt> {
        let lock = self.serial_lock(serial);
        let _guard = lock.lock_owned().await;

        let mut record = self.load_live(serial).await?;
        if let CertStatus::Revoked {
            reason: standing, ..
        } = &record.status
        {
            let upgrade = reason.is_permanent() && !standing.is_permanent();
            if !upgrade {
                return Err(CaError::AlreadyRevoked {
                    serial: serial.to_string(),
                    reason: *standing,
                });
            }
        }

        let revoked_at = SystemTime::now();
        record.status = CertStatus::Revoked {
            reason,
            revoked_at,
            invalidity_at,
        };
        self.store.upsert_certificate(&self.ca_name, &record).await?;

        let publishing = self
            .dispatcher
            .dispatch(&LifecycleEvent::CertificateRevoked {
                ca: self.ca_name.clone(),
                serial: serial.clone(),
                reason,
                revoked_at,
            })
            .await;
        info!(degraded = publishing.is_degraded(), "certificate revoked");
        Ok(TransitionReceipt { record, publishing })
    }

    /// Lift a revocation.
    ///
    /// Fails with [`CaError::NotRevoked`] for a `Good` certificate and with
    /// [`CaError::IrreversibleRevocation`] when the standing reason is
    /// permanent.
    #[instrument(skip(self), fields(ca = %self.ca_name, serial = %serial))]
    pub async fn unrevoke(&self, serial: &Serial) -> Result<TransitionReceipt> {
        let lock = self.serial_lock(serial);
        let _guard = lock.lock_owned().await;

        let mut record = self.load_live(serial).await?;
        match &record.status {
            CertStatus::Good => {
                return Err(CaError::NotRevoked {
                    serial: serial.to_string(),
                })
            }
            CertStatus::Revoked { reason, .. } if reason.is_permanent() => {
                return Err(CaError::IrreversibleRevocation {
                    serial: serial.to_string(),
                    reason: *reason,
                });
            }
            CertStatus::Revoked { .. } => {}
            // load_live already rejected Removed.
            CertStatus::Removed => unreachable!("load_live returned a removed record"),
        }

        record.status = CertStatus::Good;
        self.store.upsert_certificate(&self.ca_name, &record).await?;

        let publishing = self
            .dispatcher
            .dispatch(&LifecycleEvent::CertificateUnrevoked {
                ca: self.ca_name.clone(),
                serial: serial.clone(),
            })
            .await;
        info!(degraded = publishing.is_degraded(), "certificate unrevoked");
        Ok(TransitionReceipt { record, publishing })
    }

    /// Logically remove a certificate.
    ///
    /// Legal from any live state; removing an already-removed certificate
    /// is a no-op that returns the standing record without re-publishing.
    #[instrument(skip(self), fields(ca = %self.ca_name, serial = %serial))]
    pub async fn remove(&self, serial: &Serial) -> Result<TransitionReceipt> {
        let lock = self.serial_lock(serial);
        let _guard = lock.lock_owned().await;

        let mut record = self
            .store
            .load_certificate(&self.ca_name, serial)
            .await?
            .ok_or_else(|| CaError::NotFound {
                serial: serial.to_string(),
            })?;

        if record.status.is_removed() {
            return Ok(TransitionReceipt {
                record,
                publishing: DispatchReport::default(),
            });
        }

        record.status = CertStatus::Removed;
        self.store.upsert_certificate(&self.ca_name, &record).await?;

        let publishing = self
            .dispatcher
            .dispatch(&LifecycleEvent::CertificateRemoved {
                ca: self.ca_name.clone(),
                serial: serial.clone(),
            })
            .await;
        info!(degraded = publishing.is_degraded(), "certificate removed");
        Ok(TransitionReceipt { record, publishing })
    }

    /// Physically delete a removed certificate record.
    ///
    /// Only legal from `Removed`; purging a live record is a validation
    /// error. No event is dispatched: removal already published the
    /// certificate's exit.
    #[instrument(skip(self), fields(ca = %self.ca_name, serial = %serial))]
    pub async fn purge(&self, serial: &Serial) -> Result<()> {
        let lock = self.serial_lock(serial);
        let _guard = lock.lock_owned().await;

        let record = self
            .store
            .load_certificate(&self.ca_name, serial)
            .await?
            .ok_or_else(|| CaError::NotFound {
                serial: serial.to_string(),
            })?;
        if !record.status.is_removed() {
            return Err(CaError::validation(format!(
                "certificate {serial} must be removed before it can be purged"
            )));
        }
        self.store.delete_certificate(&self.ca_name, serial).await?;
        info!("certificate purged");
        Ok(())
    }

    /// Current status of a certificate, `None` if the serial was never
    /// issued or has been purged.
    pub async fn certificate_status(&self, serial: &Serial) -> Result<Option<CertStatus>> {
        Ok(self
            .store
            .load_certificate(&self.ca_name, serial)
            .await?
            .map(|record| record.status))
    }

    /// Revoke the CA itself.
    ///
    /// Issuance stops; status queries and CRL signing continue so relying
    /// parties can learn of the revocation. The same override rule as for
    /// certificates applies to a standing CA revocation. The new status is
    /// persisted before it takes effect, so it survives a restart.
    #[instrument(skip(self), fields(ca = %self.ca_name, reason = reason.as_str()))]
    pub async fn revoke_ca(&self, reason: RevocationReason) -> Result<DispatchReport> {
        let _guard = self.ca_lock.lock().await;

        if let CaStatus::Revoked {
            reason: standing, ..
        } = self.ca_status()
        {
            let upgrade = reason.is_permanent() && !standing.is_permanent();
            if !upgrade {
                return Err(CaError::AlreadyRevoked {
                    serial: self.ca_name.clone(),
                    reason: standing,
                });
            }
        }

        let status = CaStatus::Revoked {
            reason,
            revoked_at: SystemTime::now(),
        };
        self.store.update_ca_status(&self.ca_name, &status).await?;
        *self.ca_status.write().expect("ca status poisoned") = status;

        let publishing = self
            .dispatcher
            .dispatch(&LifecycleEvent::CaRevoked {
                ca: self.ca_name.clone(),
                reason,
            })
            .await;
        warn!(degraded = publishing.is_degraded(), "CA revoked");
        Ok(publishing)
    }

    /// Lift a CA revocation and resume issuance.
    #[instrument(skip(self), fields(ca = %self.ca_name))]
    pub async fn unrevoke_ca(&self) -> Result<DispatchReport> {
        let _guard = self.ca_lock.lock().await;

        match self.ca_status() {
            CaStatus::InService => {
                return Err(CaError::NotRevoked {
                    serial: self.ca_name.clone(),
                })
            }
            CaStatus::Revoked { reason, .. } if reason.is_permanent() => {
                return Err(CaError::IrreversibleRevocation {
                    serial: self.ca_name.clone(),
                    reason,
                });
            }
            CaStatus::Revoked { .. } => {}
        }

        self.store
            .update_ca_status(&self.ca_name, &CaStatus::InService)
            .await?;
        *self.ca_status.write().expect("ca status poisoned") = CaStatus::InService;

        let publishing = self
            .dispatcher
            .dispatch(&LifecycleEvent::CaUnrevoked {
                ca: self.ca_name.clone(),
            })
            .await;
        info!(degraded = publishing.is_degraded(), "CA revocation lifted");
        Ok(publishing)
    }

    /// Assemble and sign a CRL covering every currently revoked
    /// certificate.
    ///
    /// Runs for a revoked CA too: a revoked CA must keep telling the world
    /// what it revoked. Requires the CA (or CRL-signer) certificate for the
    /// issuer name.
    #[instrument(skip(self), fields(ca = %self.ca_name))]
    pub async fn sign_crl(&self, next_update: Option<SystemTime>) -> Result<CrlReceipt> {
        let issuer = {
            let identity = self.identity.read().expect("identity poisoned");
            let signer = identity
                .crl_signer_certificate()
                .or_else(|| identity.certificate())
                .ok_or_else(|| {
                    CaError::validation("CRL signing requires a CA or CRL-signer certificate")
                })?;
            signer.tbs_certificate.subject.clone()
        };

        let signed_at = SystemTime::now();
        let revoked = self.store.list_revoked(&self.ca_name).await?;
        let mut entries = Vec::with_capacity(revoked.len());
        for record in &revoked {
            if let CertStatus::Revoked {
                reason,
                revoked_at,
                invalidity_at,
            } = &record.status
            {
                entries.push(crl_entry(
                    record.serial(),
                    *reason,
                    *revoked_at,
                    *invalidity_at,
                )?);
            }
        }
        let entry_count = entries.len();

        let mechanism = self.backend.identity().handle().algorithm().default_mechanism();
        let algorithm = mechanism.algorithm_identifier()?;
        let tbs = TbsCertList {
            version: Version::V2,
            signature: algorithm.clone(),
            issuer,
            this_update: asn1_time(signed_at)?,
            next_update: next_update.map(asn1_time).transpose()?,
            revoked_certificates: if entries.is_empty() {
                None
            } else {
                Some(entries)
            },
            crl_extensions: None,
        };

        let tbs_der = tbs.to_der()?;
        let signature = self.sign(mechanism, &tbs_der).await?;
        let crl = CertificateList {
            tbs_cert_list: tbs,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&signature)?,
        };

        let artifact = CrlArtifact {
            crl_der: crl.to_der()?,
            entry_count,
            signed_at,
        };
        let publishing = self
            .dispatcher
            .dispatch(&LifecycleEvent::CrlAdded {
                ca: self.ca_name.clone(),
                signed_at,
            })
            .await;
        info!(entries = entry_count, degraded = publishing.is_degraded(), "CRL signed");
        Ok(CrlReceipt {
            artifact,
            publishing,
        })
    }

    fn require_in_service(&self) -> Result<()> {
        match &*self.ca_status.read().expect("ca status poisoned") {
            CaStatus::InService => Ok(()),
            CaStatus::Revoked { .. } => Err(CaError::CaNotInService {
                ca: self.ca_name.clone(),
            }),
        }
    }

    /// Load a record that is still live (not removed). Removed records are
    /// invisible to revoke/unrevoke.
    async fn load_live(&self, serial: &Serial) -> Result<CertificateRecord> {
        let record = self
            .store
            .load_certificate(&self.ca_name, serial)
            .await?
            .ok_or_else(|| CaError::NotFound {
                serial: serial.to_string(),
            })?;
        if record.status.is_removed() {
            return Err(CaError::NotFound {
                serial: serial.to_string(),
            });
        }
        Ok(record)
    }

    async fn sign(&self, mechanism: crate::signing::Mechanism, content: &[u8]) -> Result<Vec<u8>> {
        timeout(self.sign_timeout, self.backend.sign(mechanism, None, content))
            .await
            .map_err(|_| CaError::signing("signing operation timed out"))?
    }

    fn serial_lock(&self, serial: &Serial) -> Arc<AsyncMutex<()>> {
        let mut locks = self.serial_locks.lock().expect("serial locks poisoned");
        if locks.len() > SERIAL_LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(serial.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn asn1_time(at: SystemTime) -> Result<Time> {
    let unix = at
        .duration_since(UNIX_EPOCH)
        .map_err(|_| CaError::validation("timestamp precedes the UNIX epoch"))?;
    // UTCTime covers dates through 2049; fall back to GeneralizedTime after.
    match UtcTime::from_unix_duration(unix) {
        Ok(utc) => Ok(Time::UtcTime(utc)),
        Err(_) => Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(
            unix,
        )?)),
    }
}

fn crl_entry(
    serial: &Serial,
    reason: RevocationReason,
    revoked_at: SystemTime,
    invalidity_at: Option<SystemTime>,
) -> Result<RevokedCert> {
    let mut extensions = vec![Extension {
        extn_id: ID_CE_CRL_REASONS,
        critical: false,
        extn_value: OctetString::new(crl_reason(reason).to_der()?)?,
    }];
    if let Some(invalidity_at) = invalidity_at {
        let unix = invalidity_at
            .duration_since(UNIX_EPOCH)
            .map_err(|_| CaError::validation("invalidity date precedes the UNIX epoch"))?;
        extensions.push(Extension {
            extn_id: ID_CE_INVALIDITY_DATE,
            critical: false,
            extn_value: OctetString::new(GeneralizedTime::from_unix_duration(unix)?.to_der()?)?,
        });
    }
    Ok(RevokedCert {
        serial_number: SerialNumber::new(serial.as_bytes())?,
        revocation_date: asn1_time(revoked_at)?,
        crl_entry_extensions: Some(extensions),
    })
}

fn crl_reason(reason: RevocationReason) -> CrlReason {
    match reason {
        RevocationReason::Unspecified => CrlReason::Unspecified,
        RevocationReason::KeyCompromise => CrlReason::KeyCompromise,
        RevocationReason::CaCompromise => CrlReason::CaCompromise,
        RevocationReason::AffiliationChanged => CrlReason::AffiliationChanged,
        RevocationReason::Superseded => CrlReason::Superseded,
        RevocationReason::CessationOfOperation => CrlReason::CessationOfOperation,
        RevocationReason::CertificateHold => CrlReason::CertificateHold,
        RevocationReason::PrivilegeWithdrawn => CrlReason::PrivilegeWithdrawn,
        RevocationReason::AaCompromise => CrlReason::AaCompromise,
    }
}
