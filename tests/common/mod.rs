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

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use der::Decode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use usg_ca_engine::config::PublisherConfig;
use usg_ca_engine::identity::{CaIdentity, CaUris};
use usg_ca_engine::lifecycle::IssuanceRequest;
use usg_ca_engine::publisher::{LifecycleEvent, Publisher};
use usg_ca_engine::signing::local::LocalKeyBackend;
use usg_ca_engine::signing::pool::{SlotSessionPool, SlotToken};
use usg_ca_engine::signing::{KeyAlgorithm, KeySpec, SoftwareToken};
use usg_ca_engine::Result;
use x509_cert::Certificate;

/// A P-256 software-token backend with a freshly generated CA key.
pub fn software_backend() -> Arc<LocalKeyBackend> {
    let token = SoftwareToken::new();
    let identity = token
        .generate_keypair(&KeySpec {
            algorithm: KeyAlgorithm::EcdsaP256,
            label: Some("ca-signing-key".into()),
        })
        .unwrap();
    let pool =
        Arc::new(SlotSessionPool::new(Box::new(token), 4, Duration::from_secs(2)).unwrap());
    Arc::new(LocalKeyBackend::new(pool, identity))
}

/// A self-signed CA certificate parsed into the RustCrypto model.
pub fn ca_certificate(common_name: &str) -> Certificate {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    Certificate::from_der(cert.der().as_ref()).unwrap()
}

/// CA identity over a fresh self-signed certificate.
pub fn ca_identity(common_name: &str) -> CaIdentity {
    CaIdentity::from_certificate(ca_certificate(common_name), CaUris::default()).unwrap()
}

/// An issuance request for a leaf certificate with the given serial.
pub fn leaf_request(serial: u64) -> IssuanceRequest {
    let mut params = rcgen::CertificateParams::new(vec!["leaf.example.mil".into()]).unwrap();
    params.serial_number = Some(rcgen::SerialNumber::from(serial));
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    let parsed = Certificate::from_der(cert.der().as_ref()).unwrap();
    IssuanceRequest {
        profile: "tls-server".into(),
        tbs: parsed.tbs_certificate,
    }
}

/// Synchronous publisher that records every event kind it sees.
pub struct RecordingPublisher {
    events: Mutex<Vec<String>>,
    good: bool,
}

impl RecordingPublisher {
    pub fn new(good: bool) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            good,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn initialize(&self, _config: &PublisherConfig) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}

    fn publishes_good_cert(&self) -> bool {
        self.good
    }

    fn is_asynchronous(&self) -> bool {
        false
    }

    async fn publish(&self, event: &LifecycleEvent) -> bool {
        self.events.lock().unwrap().push(event.kind().to_string());
        true
    }
}

/// Publisher registration config with fast retries for tests.
pub fn publisher_config(name: &str) -> PublisherConfig {
    PublisherConfig {
        name: name.to_string(),
        synchronous: true,
        publish_good_certs: true,
        retry: usg_ca_engine::config::RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(5),
        },
    }
}
