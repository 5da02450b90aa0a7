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

//! End-to-end lifecycle flows through the public API.

mod common;

use common::{ca_identity, leaf_request, publisher_config, software_backend, RecordingPublisher};
use std::sync::Arc;
use std::time::Duration;
use usg_ca_engine::config::CaEngineConfig;
use usg_ca_engine::lifecycle::CaLifecycleEngine;
use usg_ca_engine::publisher::PublisherDispatcher;
use usg_ca_engine::{
    CaError, HealthAggregator, MemoryStore, RevocationReason, Serial,
};

async fn engine_with_publisher(
) -> (Arc<CaLifecycleEngine>, Arc<RecordingPublisher>, Arc<MemoryStore>) {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let dispatcher = Arc::new(PublisherDispatcher::new(Duration::from_millis(500)));
    dispatcher
        .register(publisher_config("recorder"), publisher.clone())
        .await
        .unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = CaLifecycleEngine::start(
        "flow-ca",
        ca_identity("Flow Test CA"),
        software_backend(),
        store.clone(),
        dispatcher,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    (engine, publisher, store)
}

#[tokio::test]
async fn test_issue_revoke_unrevoke_flow() {
    let (engine, publisher, _store) = engine_with_publisher().await;
    let serial = Serial::from_u64(0x01);

    let receipt = engine.issue(leaf_request(0x01)).await.unwrap();
    assert!(receipt.record().status().is_good());
    assert!(!receipt.is_degraded());

    engine
        .revoke(&serial, RevocationReason::KeyCompromise, None)
        .await
        .unwrap();
    assert!(engine
        .certificate_status(&serial)
        .await
        .unwrap()
        .unwrap()
        .is_revoked());

    // Key compromise is final.
    let err = engine.unrevoke(&serial).await.unwrap_err();
    assert!(matches!(err, CaError::IrreversibleRevocation { .. }));

    assert_eq!(
        publisher.events(),
        vec!["caAdded", "certificateAdded", "certificateRevoked"]
    );
}

#[tokio::test]
async fn test_crl_reflects_live_revocations() {
    let (engine, publisher, _store) = engine_with_publisher().await;
    engine.issue(leaf_request(0x10)).await.unwrap();
    engine.issue(leaf_request(0x11)).await.unwrap();
    engine
        .revoke(&Serial::from_u64(0x11), RevocationReason::Superseded, None)
        .await
        .unwrap();

    let receipt = engine
        .sign_crl(Some(std::time::SystemTime::now() + Duration::from_secs(86400)))
        .await
        .unwrap();
    assert_eq!(receipt.artifact().entry_count(), 1);
    assert!(!receipt.artifact().crl_der().is_empty());
    assert!(publisher.events().contains(&"crlAdded".to_string()));
}

#[tokio::test]
async fn test_revocation_only_publisher_skips_good_events() {
    let revocation_only = Arc::new(RecordingPublisher::new(false));
    let dispatcher = Arc::new(PublisherDispatcher::new(Duration::from_millis(500)));
    dispatcher
        .register(publisher_config("revocation-only"), revocation_only.clone())
        .await
        .unwrap();
    let engine = CaLifecycleEngine::start(
        "gated-ca",
        ca_identity("Gated CA"),
        software_backend(),
        Arc::new(MemoryStore::new()),
        dispatcher,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    engine.issue(leaf_request(0x01)).await.unwrap();
    engine
        .revoke(&Serial::from_u64(0x01), RevocationReason::CertificateHold, None)
        .await
        .unwrap();
    engine.unrevoke(&Serial::from_u64(0x01)).await.unwrap();
    engine.remove(&Serial::from_u64(0x01)).await.unwrap();

    // Neither caAdded, certificateAdded, nor certificateUnrevoked arrive.
    assert_eq!(
        revocation_only.events(),
        vec!["certificateRevoked", "certificateRemoved"]
    );
}

#[tokio::test]
async fn test_health_tracks_store_outage() {
    let (engine, _publisher, store) = engine_with_publisher().await;
    let dispatcher = Arc::new(PublisherDispatcher::new(Duration::from_millis(500)));
    let aggregator = HealthAggregator::new(software_backend(), store.clone(), dispatcher);

    assert!(aggregator.check().await.healthy);

    store.set_unreachable(true);
    let report = aggregator.check().await;
    assert!(!report.healthy);
    assert!(!report.store);
    assert!(report.signing);

    // A transition against the dead store fails without committing.
    let err = engine.issue(leaf_request(0x30)).await.unwrap_err();
    assert!(matches!(err, CaError::Store(_)));

    store.set_unreachable(false);
    assert!(aggregator.check().await.healthy);
    engine.issue(leaf_request(0x30)).await.unwrap();
}

#[tokio::test]
async fn test_config_driven_pool_and_timeouts() {
    let config = CaEngineConfig::from_toml(
        r#"
        [ca]
        name = "configured-ca"

        [signing]
        backend = "software"
        sign_timeout = 5

        [pool]
        max_sessions = 2
        acquire_timeout = 1000

        [publishing]
        publisher_timeout = 500
        "#,
    )
    .unwrap();

    let dispatcher = Arc::new(PublisherDispatcher::new(config.publishing.publisher_timeout));
    let engine = CaLifecycleEngine::start(
        config.ca.name.clone(),
        ca_identity("Configured CA"),
        software_backend(),
        Arc::new(MemoryStore::new()),
        dispatcher,
        config.signing.sign_timeout,
    )
    .await
    .unwrap();

    assert_eq!(engine.ca_name(), "configured-ca");
    engine.issue(leaf_request(0x42)).await.unwrap();
}
