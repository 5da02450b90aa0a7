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

//! Proxied backend against an in-process module speaking the wire format.

mod common;

use async_trait::async_trait;
use common::{ca_identity, leaf_request};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use usg_ca_engine::lifecycle::CaLifecycleEngine;
use usg_ca_engine::publisher::PublisherDispatcher;
use usg_ca_engine::signing::pool::SlotToken;
use usg_ca_engine::signing::proxy::{
    decode_request, encode_response, ProxiedKeyBackend, ProxyOperation, ProxyTransport,
};
use usg_ca_engine::signing::{
    KeyAlgorithm, KeySpec, SigningBackend, SigningIdentity, SoftwareToken,
};
use usg_ca_engine::{CaError, MemoryStore};

/// Module side of the wire: decodes envelopes and serves them from a
/// software token, the way a remote signing service would.
struct InProcessModule {
    token: SoftwareToken,
    identity: SigningIdentity,
    requests_seen: Mutex<Vec<ProxyOperation>>,
}

impl InProcessModule {
    fn new() -> Self {
        let token = SoftwareToken::new();
        let identity = token
            .generate_keypair(&KeySpec {
                algorithm: KeyAlgorithm::EcdsaP256,
                label: Some("remote-ca-key".into()),
            })
            .unwrap();
        Self {
            token,
            identity,
            requests_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProxyTransport for InProcessModule {
    async fn exchange(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        let request = decode_request(request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.requests_seen.lock().unwrap().push(request.operation);

        let value = match request.operation {
            ProxyOperation::Probe => Vec::new(),
            ProxyOperation::Sign => {
                let mut session = self
                    .token
                    .open_session()
                    .map_err(|e| io::Error::other(e.to_string()))?;
                session
                    .sign(
                        self.identity.handle(),
                        request.mechanism,
                        request.parameters.as_deref(),
                        &request.content,
                    )
                    .map_err(|e| io::Error::other(e.to_string()))?
            }
            ProxyOperation::DigestSecretKey => {
                let mut session = self
                    .token
                    .open_session()
                    .map_err(|e| io::Error::other(e.to_string()))?;
                session
                    .digest_secret_key(self.identity.handle(), request.mechanism)
                    .map_err(|e| io::Error::other(e.to_string()))?
            }
        };
        Ok(encode_response(&value))
    }
}

fn proxied_backend() -> (Arc<ProxiedKeyBackend>, Arc<InProcessModule>) {
    let module = Arc::new(InProcessModule::new());
    let backend = Arc::new(ProxiedKeyBackend::new(
        module.clone(),
        "ca-entity",
        module.identity.clone(),
    ));
    (backend, module)
}

#[tokio::test]
async fn test_issue_through_proxied_backend() {
    let (backend, module) = proxied_backend();
    let engine = CaLifecycleEngine::start(
        "proxy-ca",
        ca_identity("Proxy CA"),
        backend,
        Arc::new(MemoryStore::new()),
        Arc::new(PublisherDispatcher::new(Duration::from_millis(500))),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let receipt = engine.issue(leaf_request(0x55)).await.unwrap();
    assert!(receipt.record().status().is_good());
    // Startup probes once; issuance signs once.
    let seen = module.requests_seen.lock().unwrap().clone();
    assert_eq!(seen, vec![ProxyOperation::Probe, ProxyOperation::Sign]);

    // The remote signature survives length validation and lands in the
    // certificate.
    let cert = receipt.record().certificate().unwrap();
    assert_eq!(cert.signature.raw_bytes().len(), 64);
}

#[tokio::test]
async fn test_secret_key_digest_round_trip() {
    let (backend, _module) = proxied_backend();
    let digest = backend
        .digest_secret_key(usg_ca_engine::signing::Mechanism::Sha256Hmac)
        .await
        .unwrap();
    assert_eq!(digest.len(), 32);
}

#[tokio::test]
async fn test_dead_transport_is_a_signing_error() {
    struct DeadTransport;

    #[async_trait]
    impl ProxyTransport for DeadTransport {
        async fn exchange(&self, _request: &[u8]) -> io::Result<Vec<u8>> {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "module offline",
            ))
        }
    }

    let (_, module) = proxied_backend();
    let backend = Arc::new(ProxiedKeyBackend::new(
        Arc::new(DeadTransport),
        "ca-entity",
        module.identity.clone(),
    ));

    // Startup fails fast on the probe.
    let err = CaLifecycleEngine::start(
        "dead-proxy-ca",
        ca_identity("Dead Proxy CA"),
        backend.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(PublisherDispatcher::new(Duration::from_millis(500))),
        Duration::from_secs(5),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CaError::Configuration(_)));

    let err = backend
        .sign(
            usg_ca_engine::signing::Mechanism::EcdsaSha256,
            None,
            b"content",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::ProxyTransport(_)));
    assert!(err.is_signing());
}

#[tokio::test]
async fn test_trailing_bytes_from_module_rejected() {
    struct ChattyModule(Arc<InProcessModule>);

    #[async_trait]
    impl ProxyTransport for ChattyModule {
        async fn exchange(&self, request: &[u8]) -> io::Result<Vec<u8>> {
            let mut response = self.0.exchange(request).await?;
            response.push(0xFF);
            Ok(response)
        }
    }

    let module = Arc::new(InProcessModule::new());
    let backend = ProxiedKeyBackend::new(
        Arc::new(ChattyModule(module.clone())),
        "ca-entity",
        module.identity.clone(),
    );

    let err = backend
        .sign(
            usg_ca_engine::signing::Mechanism::EcdsaSha256,
            None,
            b"content",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::ProxyProtocol(_)));
}
