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

//! Error types for the CA engine.
//!
//! This module defines the error taxonomy shared by all components: lifecycle
//! policy violations, signing/backend failures, proxy wire failures, and
//! publisher failures, plus configuration and validation errors surfaced at
//! startup or request entry.

use crate::types::RevocationReason;
use thiserror::Error;

/// Result type alias using [`CaError`].
pub type Result<T> = std::result::Result<T, CaError>;

/// Errors that can occur during CA engine operations.
#[derive(Debug, Error)]
pub enum CaError {
    /// Malformed CA, publisher, or backend configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed extension data or out-of-range parameters in a request.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A CA certificate could not be parsed into an identity.
    #[error("Invalid CA certificate: {0}")]
    InvalidCaCertificate(String),

    /// A certificate with this serial already exists for the issuing CA.
    #[error("Duplicate serial {serial}")]
    DuplicateSerial {
        /// Hex-encoded serial number.
        serial: String,
    },

    /// No certificate record exists for this serial.
    #[error("Certificate {serial} not found")]
    NotFound {
        /// Hex-encoded serial number.
        serial: String,
    },

    /// The certificate is already revoked and the new reason does not
    /// override the existing one.
    #[error("Certificate {serial} already revoked (reason: {reason})")]
    AlreadyRevoked {
        /// Hex-encoded serial number.
        serial: String,
        /// Reason recorded by the earlier revocation.
        reason: RevocationReason,
    },

    /// Unrevocation was requested for a certificate that is not revoked.
    #[error("Certificate {serial} is not revoked")]
    NotRevoked {
        /// Hex-encoded serial number.
        serial: String,
    },

    /// The revocation reason is permanent and cannot be reversed.
    #[error("Certificate {serial} revocation is irreversible (reason: {reason})")]
    IrreversibleRevocation {
        /// Hex-encoded serial number.
        serial: String,
        /// The permanent reason blocking unrevocation.
        reason: RevocationReason,
    },

    /// The CA is revoked or otherwise out of service and rejects new issuance.
    #[error("CA '{ca}' is not in service")]
    CaNotInService {
        /// CA name.
        ca: String,
    },

    /// Signing backend or session failure. The enclosing transition is
    /// aborted; nothing is persisted.
    #[error("Signing error: {0}")]
    Signing(String),

    /// The backend returned a signature whose length does not match the
    /// signing identity's expected length.
    #[error("Signature length mismatch: expected {expected} bytes, got {actual}")]
    SignatureLengthMismatch {
        /// Expected signature length in bytes.
        expected: usize,
        /// Actual length returned by the backend.
        actual: usize,
    },

    /// No slot session became available within the acquire timeout.
    #[error("Session pool exhausted after waiting {waited_ms} ms")]
    SessionPoolExhausted {
        /// Milliseconds spent waiting for a session.
        waited_ms: u64,
    },

    /// The proxy transport reported a send/receive failure.
    #[error("Proxy transport error: {0}")]
    ProxyTransport(String),

    /// The proxy response was not a well-formed length-prefixed binary value.
    #[error("Proxy protocol error: {0}")]
    ProxyProtocol(String),

    /// A publisher rejected or failed an event. Never unwinds a committed
    /// transition; reported as degraded status instead.
    #[error("Publisher error: {0}")]
    Publisher(String),

    /// Persistence collaborator failure.
    #[error("Store error: {0}")]
    Store(String),

    /// DER encoding/decoding error.
    #[error("DER error: {0}")]
    Der(#[from] der::Error),
}

impl CaError {
    /// Create a configuration error with the given message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid-CA-certificate error with the given message.
    pub fn invalid_ca_certificate(msg: impl Into<String>) -> Self {
        Self::InvalidCaCertificate(msg.into())
    }

    /// Create a signing error with the given message.
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Create a proxy transport error with the given message.
    pub fn proxy_transport(msg: impl Into<String>) -> Self {
        Self::ProxyTransport(msg.into())
    }

    /// Create a proxy protocol error with the given message.
    pub fn proxy_protocol(msg: impl Into<String>) -> Self {
        Self::ProxyProtocol(msg.into())
    }

    /// Create a publisher error with the given message.
    pub fn publisher(msg: impl Into<String>) -> Self {
        Self::Publisher(msg.into())
    }

    /// Create a store error with the given message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Returns true if this error originated in the signing path.
    ///
    /// Proxy failures count as signing failures: from the lifecycle engine's
    /// point of view the signature simply was not produced.
    pub fn is_signing(&self) -> bool {
        matches!(
            self,
            Self::Signing(_)
                | Self::SignatureLengthMismatch { .. }
                | Self::ProxyTransport(_)
                | Self::ProxyProtocol(_)
                | Self::SessionPoolExhausted { .. }
        )
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionPoolExhausted { .. } | Self::ProxyTransport(_)
        )
    }
}
