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

//! Engine configuration.
//!
//! Deserialized from TOML. Unknown fields are rejected so that a typo in a
//! deployment file fails loudly at startup instead of silently falling back
//! to a default.

use crate::error::{CaError, Result};
use crate::identity::CaUris;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CaEngineConfig {
    /// CA identity and advertised URIs.
    pub ca: CaConfig,
    /// Signing backend selection and timeouts.
    pub signing: SigningConfig,
    /// Token session pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Publisher fan-out.
    #[serde(default)]
    pub publishing: PublishingConfig,
}

impl CaEngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| CaError::configuration(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CaError::configuration(format!("cannot render configuration: {e}")))
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CaError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.ca.name.trim().is_empty() {
            return Err(CaError::configuration("ca.name must not be empty"));
        }
        if self.pool.max_sessions == 0 {
            return Err(CaError::configuration("pool.max_sessions must be at least 1"));
        }
        match self.signing.backend {
            BackendKind::Pkcs11 => {
                if self.signing.module_path.is_none() {
                    return Err(CaError::configuration(
                        "signing.module_path is required for the pkcs11 backend",
                    ));
                }
                if self.signing.pin.is_none() {
                    return Err(CaError::configuration(
                        "signing.pin is required for the pkcs11 backend",
                    ));
                }
            }
            BackendKind::Proxy => {
                if self.signing.proxy_entity.is_none() {
                    return Err(CaError::configuration(
                        "signing.proxy_entity is required for the proxy backend",
                    ));
                }
            }
            BackendKind::Software => {}
        }
        for publisher in &self.publishing.publishers {
            if publisher.name.trim().is_empty() {
                return Err(CaError::configuration("publisher name must not be empty"));
            }
            if publisher.retry.max_attempts == 0 {
                return Err(CaError::configuration(format!(
                    "publisher '{}': retry.max_attempts must be at least 1",
                    publisher.name
                )));
            }
        }
        Ok(())
    }
}

/// CA naming and advertised URI sets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CaConfig {
    /// CA name, used as the persistence key and in dispatched events.
    pub name: String,
    /// Where the CA certificate can be fetched.
    #[serde(default)]
    pub ca_cert_uris: Vec<Url>,
    /// OCSP responder locations.
    #[serde(default)]
    pub ocsp_uris: Vec<Url>,
    /// Full CRL distribution points.
    #[serde(default)]
    pub crl_uris: Vec<Url>,
    /// Delta CRL distribution points.
    #[serde(default)]
    pub delta_crl_uris: Vec<Url>,
}

impl CaConfig {
    /// Advertised URIs as the identity layer consumes them.
    pub fn uris(&self) -> CaUris {
        CaUris {
            ca_cert_uris: self.ca_cert_uris.clone(),
            ocsp_uris: self.ocsp_uris.clone(),
            crl_uris: self.crl_uris.clone(),
            delta_crl_uris: self.delta_crl_uris.clone(),
        }
    }
}

/// Which signing backend the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process software token.
    Software,
    /// PKCS#11 hardware token.
    Pkcs11,
    /// Remote signing service reached over a byte transport.
    Proxy,
}

/// Signing backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    /// Backend selection.
    pub backend: BackendKind,
    /// Label of the CA signing key on the token.
    #[serde(default)]
    pub key_label: Option<String>,
    /// Upper bound on a single signing operation, in seconds.
    #[serde(default = "default_sign_timeout", with = "duration_secs")]
    pub sign_timeout: Duration,
    /// PKCS#11 module path (pkcs11 backend only).
    #[serde(default)]
    pub module_path: Option<PathBuf>,
    /// PKCS#11 slot label (pkcs11 backend only).
    #[serde(default)]
    pub slot_label: Option<String>,
    /// Token PIN (pkcs11 backend only).
    #[serde(default)]
    pub pin: Option<String>,
    /// Entity name presented to the remote signer (proxy backend only).
    #[serde(default)]
    pub proxy_entity: Option<String>,
}

/// Session pool sizing and acquisition timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum concurrent token sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// How long a caller waits for a session before the pool reports
    /// exhaustion, in milliseconds.
    #[serde(default = "default_acquire_timeout", with = "duration_millis")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Publisher fan-out configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PublishingConfig {
    /// Upper bound on a single synchronous delivery, in milliseconds.
    #[serde(default = "default_publisher_timeout", with = "duration_millis")]
    pub publisher_timeout: Duration,
    /// Publishers to register at startup.
    #[serde(default)]
    pub publishers: Vec<PublisherConfig>,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            publisher_timeout: default_publisher_timeout(),
            publishers: Vec::new(),
        }
    }
}

/// Per-publisher registration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    /// Unique registration name.
    pub name: String,
    /// Whether delivery blocks the lifecycle call.
    #[serde(default = "default_true")]
    pub synchronous: bool,
    /// Whether this publisher receives "good"/non-terminal events.
    #[serde(default = "default_true")]
    pub publish_good_certs: bool,
    /// Retry policy for asynchronous delivery.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Retry behavior for asynchronous publishers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Delivery attempts per event, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts, in milliseconds.
    #[serde(default = "default_backoff", with = "duration_millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    4
}

fn default_acquire_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_sign_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_publisher_timeout() -> Duration {
    Duration::from_millis(10_000)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(500)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
