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

//! Key signing backends.
//!
//! This module provides the polymorphic signing abstraction used by the
//! lifecycle engine: a [`SigningBackend`] is "a private key that can sign",
//! with two concrete variants:
//!
//! - [`LocalKeyBackend`]: signs with a key held by a local cryptographic
//!   token, with sessions managed by a [`pool::SlotSessionPool`].
//! - [`ProxiedKeyBackend`]: forwards signing requests to a remote module
//!   over a proxy wire protocol.
//!
//! Both variants are safe to invoke concurrently from multiple signing
//! callers. Private key material never crosses either abstraction; callers
//! only ever see signatures and public keys.

pub mod local;
pub mod pool;
pub mod proxy;

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

#[cfg(feature = "software-token")]
mod software;

#[cfg(feature = "software-token")]
pub use software::SoftwareToken;

pub use local::LocalKeyBackend;
pub use pool::{SessionError, SlotSessionPool, SlotToken, TokenSession};
pub use proxy::{ProxiedKeyBackend, ProxyTransport};

use crate::error::{CaError, Result};
use async_trait::async_trait;
use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ID_RSASSA_PSS, SHA_256_WITH_RSA_ENCRYPTION,
};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::Certificate;

/// Signing mechanism passed to a backend.
///
/// Identifies the algorithm the token applies to the content. The numeric
/// identifiers are stable and appear on the proxy wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// RSASSA PKCS#1 v1.5 with SHA-256.
    RsaPkcs,
    /// RSASSA-PSS with SHA-256.
    RsaPss,
    /// ECDSA with SHA-256, raw `r || s` output.
    EcdsaSha256,
    /// ECDSA with SHA-384, raw `r || s` output.
    EcdsaSha384,
    /// HMAC-SHA256 over a fixed input, used to fingerprint secret keys
    /// without exporting them.
    Sha256Hmac,
}

impl Mechanism {
    /// Stable numeric identifier used in the proxy request envelope.
    pub fn id(&self) -> u32 {
        match self {
            Self::RsaPkcs => 0x0001,
            Self::RsaPss => 0x0002,
            Self::EcdsaSha256 => 0x0010,
            Self::EcdsaSha384 => 0x0011,
            Self::Sha256Hmac => 0x0100,
        }
    }

    /// Reverse of [`Mechanism::id`].
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0x0001 => Some(Self::RsaPkcs),
            0x0002 => Some(Self::RsaPss),
            0x0010 => Some(Self::EcdsaSha256),
            0x0011 => Some(Self::EcdsaSha384),
            0x0100 => Some(Self::Sha256Hmac),
            _ => None,
        }
    }

    /// The X.509 signature AlgorithmIdentifier produced when signing with
    /// this mechanism.
    pub fn algorithm_identifier(&self) -> Result<AlgorithmIdentifierOwned> {
        let oid = match self {
            Self::RsaPkcs => SHA_256_WITH_RSA_ENCRYPTION,
            Self::RsaPss => ID_RSASSA_PSS,
            Self::EcdsaSha256 => ECDSA_WITH_SHA_256,
            Self::EcdsaSha384 => ECDSA_WITH_SHA_384,
            Self::Sha256Hmac => {
                return Err(CaError::validation(
                    "HMAC mechanisms cannot sign certificates",
                ))
            }
        };
        Ok(AlgorithmIdentifierOwned {
            oid,
            parameters: None,
        })
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RsaPkcs => "RSA-PKCS",
            Self::RsaPss => "RSA-PSS",
            Self::EcdsaSha256 => "ECDSA-SHA256",
            Self::EcdsaSha384 => "ECDSA-SHA384",
            Self::Sha256Hmac => "SHA256-HMAC",
        };
        write!(f, "{name}")
    }
}

/// Key algorithm and parameters for a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// ECDSA with P-256 curve (secp256r1 / prime256v1).
    EcdsaP256,

    /// ECDSA with P-384 curve (secp384r1).
    EcdsaP384,

    /// RSA with specified modulus size.
    Rsa {
        /// RSA modulus size in bits (typically 2048, 3072, or 4096).
        bits: u32,
    },
}

impl KeyAlgorithm {
    /// Expected signature length in bytes for a key of this algorithm.
    ///
    /// RSA signatures are always exactly the modulus length. ECDSA signatures
    /// in raw token output are a fixed-width `r || s` pair, each component
    /// padded to the byte-ceiling of the curve order's bit length.
    pub fn expected_signature_length(&self) -> usize {
        match self {
            Self::EcdsaP256 => 2 * 256_usize.div_ceil(8),
            Self::EcdsaP384 => 2 * 384_usize.div_ceil(8),
            Self::Rsa { bits } => (*bits as usize).div_ceil(8),
        }
    }

    /// Get a string representation of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ECDSA-P256",
            Self::EcdsaP384 => "ECDSA-P384",
            Self::Rsa { .. } => "RSA",
        }
    }

    /// Default signing mechanism for keys of this algorithm.
    pub fn default_mechanism(&self) -> Mechanism {
        match self {
            Self::EcdsaP256 => Mechanism::EcdsaSha256,
            Self::EcdsaP384 => Mechanism::EcdsaSha384,
            Self::Rsa { .. } => Mechanism::RsaPkcs,
        }
    }
}

/// Opaque handle to a key held by a token.
///
/// The `id` is backend-specific (a CKA_ID for PKCS#11, a map key for the
/// software token) and is never interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    id: Vec<u8>,
    algorithm: KeyAlgorithm,
    label: Option<String>,
}

impl KeyHandle {
    /// Create a new key handle.
    pub fn new(id: Vec<u8>, algorithm: KeyAlgorithm, label: Option<String>) -> Self {
        Self {
            id,
            algorithm,
            label,
        }
    }

    /// Backend-specific key identifier.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Key algorithm.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Human-readable label, if the token stores one.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// Specification for generating a new key pair.
#[derive(Debug, Clone)]
pub struct KeySpec {
    /// Key algorithm and parameters.
    pub algorithm: KeyAlgorithm,
    /// Optional label stored with the key.
    pub label: Option<String>,
}

/// A key handle paired with its public key and optional certificate chain.
///
/// The expected signature length is derived from the public key algorithm at
/// construction and is used to validate backend output before it is trusted
/// as a signature. A `SigningIdentity` is owned by the slot pool that created
/// it and is never shared across slots.
#[derive(Debug, Clone)]
pub struct SigningIdentity {
    handle: KeyHandle,
    public_key: SubjectPublicKeyInfoOwned,
    chain: Option<Vec<Certificate>>,
}

impl SigningIdentity {
    /// Pair a key handle with its public key.
    pub fn new(
        handle: KeyHandle,
        public_key: SubjectPublicKeyInfoOwned,
        chain: Option<Vec<Certificate>>,
    ) -> Self {
        Self {
            handle,
            public_key,
            chain,
        }
    }

    /// The token-side key handle.
    pub fn handle(&self) -> &KeyHandle {
        &self.handle
    }

    /// The public half of the key, in SPKI form.
    pub fn public_key(&self) -> &SubjectPublicKeyInfoOwned {
        &self.public_key
    }

    /// Certificate chain bound to this key, if one has been installed.
    pub fn chain(&self) -> Option<&[Certificate]> {
        self.chain.as_deref()
    }

    /// Replace the certificate chain bound to this key.
    pub fn set_chain(&mut self, chain: Vec<Certificate>) {
        self.chain = Some(chain);
    }

    /// Expected signature length in bytes for this key.
    pub fn expected_signature_length(&self) -> usize {
        self.handle.algorithm().expected_signature_length()
    }
}

/// A private key that can sign.
///
/// Implementations must be safe to invoke concurrently from multiple signing
/// callers; any shared token state goes through a [`SlotSessionPool`].
#[async_trait]
pub trait SigningBackend: Send + Sync {
    /// The signing identity bound to this backend.
    fn identity(&self) -> &SigningIdentity;

    /// Sign `content` with the given mechanism.
    ///
    /// `parameters` carries mechanism-specific parameters (e.g. PSS salt
    /// configuration) in backend-defined encoding; `None` for mechanisms
    /// without parameters.
    async fn sign(
        &self,
        mechanism: Mechanism,
        parameters: Option<&[u8]>,
        content: &[u8],
    ) -> Result<Vec<u8>>;

    /// Digest a token-resident secret key without exporting it.
    ///
    /// Used to fingerprint secret keys for audit and comparison purposes.
    async fn digest_secret_key(&self, mechanism: Mechanism) -> Result<Vec<u8>>;

    /// Cheap liveness probe; does not perform a cryptographic operation.
    async fn probe(&self) -> Result<()>;
}
