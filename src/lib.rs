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

//! # usg-ca-engine
//!
//! Certificate Authority issuance and revocation engine.
//!
//! The engine owns the certificate lifecycle state machine for one CA:
//! issuance, revocation with RFC 5280 reason codes, unrevocation, logical
//! removal, physical purge, and CRL signing. Every transition signs where
//! needed, persists, and only then publishes to registered sinks.
//!
//! ## Features
//!
//! - **Async-first design** using Tokio
//! - **Pooled token sessions** with bounded concurrency, re-authentication
//!   on lost sessions, and exclusive access for key administration
//! - **Pluggable signing backends**: in-process software token, PKCS#11
//!   hardware tokens (feature-gated), or a remote signer behind a byte
//!   transport
//! - **Publisher fan-out** with synchronous and queued asynchronous
//!   delivery, per-publisher retry, and degraded-but-committed semantics
//! - **Health aggregation** over signing, persistence, and publishers
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usg_ca_engine::identity::{CaIdentity, CaUris};
//! use usg_ca_engine::lifecycle::CaLifecycleEngine;
//! use usg_ca_engine::publisher::PublisherDispatcher;
//! use usg_ca_engine::signing::local::LocalKeyBackend;
//! use usg_ca_engine::signing::pool::{SlotSessionPool, SlotToken};
//! use usg_ca_engine::signing::{KeyAlgorithm, KeySpec, SoftwareToken};
//! use usg_ca_engine::store::MemoryStore;
//! use usg_ca_engine::types::Serial;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Development setup: software token, in-memory store, no publishers.
//!     let token = SoftwareToken::new();
//!     let ca_key = token.generate_keypair(&KeySpec {
//!         algorithm: KeyAlgorithm::EcdsaP256,
//!         label: Some("ca-signing-key".into()),
//!     })?;
//!     let pool = Arc::new(SlotSessionPool::new(
//!         Box::new(token),
//!         4,
//!         Duration::from_secs(5),
//!     )?);
//!     let backend = Arc::new(LocalKeyBackend::new(pool, ca_key));
//!
//!     let identity = CaIdentity::from_parts(
//!         "CN=Dev CA",
//!         Serial::from_u64(1),
//!         None,
//!         None,
//!         CaUris::default(),
//!     );
//!     let engine = CaLifecycleEngine::start(
//!         "dev-ca",
//!         identity,
//!         backend,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(PublisherDispatcher::new(Duration::from_secs(10))),
//!         Duration::from_secs(30),
//!     )
//!     .await?;
//!
//!     println!("CA '{}' in service", engine.ca_name());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod lifecycle;
pub mod publisher;
pub mod signing;
pub mod store;
pub mod types;

pub use config::CaEngineConfig;
pub use error::{CaError, Result};
pub use health::{HealthAggregator, HealthReport};
pub use identity::{CaIdentity, CaUris};
pub use lifecycle::{
    CaLifecycleEngine, CaStatus, CertStatus, CertificateRecord, CrlArtifact, IssuanceRequest,
    TransitionReceipt,
};
pub use publisher::{LifecycleEvent, Publisher, PublisherDispatcher};
pub use signing::SigningBackend;
pub use store::{CertificateStore, MemoryStore};
pub use types::{RevocationReason, Serial};
