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

//! Common value types shared across the engine.

use serde::{Deserialize, Serialize};

/// Certificate serial number, scoped per issuing CA.
///
/// Stored as the raw big-endian INTEGER content octets, exactly as they
/// appear in the certificate. Serials compare byte-for-byte; callers are
/// expected to hand over canonical (minimal, unsigned) encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Serial(Vec<u8>);

impl Serial {
    /// Create a serial from raw big-endian bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Create a serial from a u64, dropping leading zero octets.
    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(7);
        Self(bytes[start..].to_vec())
    }

    /// Raw big-endian bytes of the serial.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl From<&[u8]> for Serial {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// RFC 5280 revocation reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevocationReason {
    /// No specific reason given.
    Unspecified,
    /// The certificate's private key is known or suspected to be compromised.
    KeyCompromise,
    /// The issuing CA's private key is known or suspected to be compromised.
    CaCompromise,
    /// The subject's affiliation has changed.
    AffiliationChanged,
    /// The certificate has been superseded by a newer one.
    Superseded,
    /// The certified entity has ceased operation.
    CessationOfOperation,
    /// The certificate is temporarily on hold.
    CertificateHold,
    /// Privileges granted to the subject have been withdrawn.
    PrivilegeWithdrawn,
    /// The attribute authority's key is compromised.
    AaCompromise,
}

impl RevocationReason {
    /// RFC 5280 CRLReason code value.
    pub fn code(&self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    /// Whether this reason makes a revocation irreversible.
    ///
    /// Compromise reasons can never be walked back: once a key is suspected
    /// compromised, the only way forward is removal and re-issuance. These
    /// reasons also override an earlier non-compromise revocation.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::KeyCompromise | Self::CaCompromise)
    }

    /// Human-readable reason name as it appears in logs and health details.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::KeyCompromise => "keyCompromise",
            Self::CaCompromise => "cACompromise",
            Self::AffiliationChanged => "affiliationChanged",
            Self::Superseded => "superseded",
            Self::CessationOfOperation => "cessationOfOperation",
            Self::CertificateHold => "certificateHold",
            Self::PrivilegeWithdrawn => "privilegeWithdrawn",
            Self::AaCompromise => "aACompromise",
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
