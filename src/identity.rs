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

//! CA identity snapshot.
//!
//! A [`CaIdentity`] captures the public identity of a CA: subject name,
//! serial, subject key identifier, subject alternative names, and the URI
//! sets the CA advertises, plus a mutable pointer to the CRL-signer
//! certificate when CRLs are signed by a key other than the CA's own.
//!
//! Identity fields are derived from the CA certificate whenever one exists;
//! the field-wise constructor exists for CAs whose certificate is managed
//! elsewhere and whose identity is reconstructed from persisted state.

use crate::error::{CaError, Result};
use crate::types::Serial;
use const_oid::db::rfc5280::{ID_CE_SUBJECT_ALT_NAME, ID_CE_SUBJECT_KEY_IDENTIFIER};
use der::{Decode, Encode};
use sha1::{Digest, Sha1};
use url::Url;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{SubjectAltName, SubjectKeyIdentifier};
use x509_cert::Certificate;

/// URI sets a CA advertises to relying parties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaUris {
    /// Where the CA certificate can be fetched.
    pub ca_cert_uris: Vec<Url>,
    /// OCSP responder locations.
    pub ocsp_uris: Vec<Url>,
    /// Full CRL distribution points.
    pub crl_uris: Vec<Url>,
    /// Delta CRL distribution points.
    pub delta_crl_uris: Vec<Url>,
}

/// Immutable snapshot of a CA's public identity.
#[derive(Debug, Clone)]
pub struct CaIdentity {
    subject: String,
    canonical_subject: String,
    serial: Serial,
    subject_key_identifier: Option<Vec<u8>>,
    subject_alt_names: Option<Vec<String>>,
    certificate: Option<Certificate>,
    crl_signer: Option<Certificate>,
    uris: CaUris,
}

impl CaIdentity {
    /// Derive an identity from a parsed CA certificate.
    ///
    /// Subject, serial, SKI, and SAN all come from the certificate. The SKI
    /// extension is used when present; otherwise the identifier is computed
    /// as the SHA-1 of the subject public key per RFC 5280. Fails with
    /// [`CaError::InvalidCaCertificate`] if the SAN extension is present but
    /// malformed.
    pub fn from_certificate(certificate: Certificate, uris: CaUris) -> Result<Self> {
        let tbs = &certificate.tbs_certificate;
        let subject = tbs.subject.to_string();
        let serial = Serial::new(tbs.serial_number.as_bytes().to_vec());

        let mut ski: Option<Vec<u8>> = None;
        let mut san: Option<Vec<String>> = None;
        if let Some(extensions) = &tbs.extensions {
            for ext in extensions {
                if ext.extn_id == ID_CE_SUBJECT_KEY_IDENTIFIER {
                    let parsed = SubjectKeyIdentifier::from_der(ext.extn_value.as_bytes())
                        .map_err(|e| {
                            CaError::invalid_ca_certificate(format!(
                                "malformed subjectKeyIdentifier extension: {e}"
                            ))
                        })?;
                    ski = Some(parsed.0.as_bytes().to_vec());
                } else if ext.extn_id == ID_CE_SUBJECT_ALT_NAME {
                    let parsed =
                        SubjectAltName::from_der(ext.extn_value.as_bytes()).map_err(|e| {
                            CaError::invalid_ca_certificate(format!(
                                "malformed subjectAltName extension: {e}"
                            ))
                        })?;
                    let rendered: Vec<String> =
                        parsed.0.iter().map(render_general_name).collect();
                    san = Some(rendered);
                }
            }
        }

        // SKI is always derived from the certificate, never supplied
        // independently once a certificate exists.
        let ski = ski.unwrap_or_else(|| {
            Sha1::digest(tbs.subject_public_key_info.subject_public_key.raw_bytes()).to_vec()
        });

        Ok(Self {
            canonical_subject: canonicalize_subject(&subject),
            subject,
            serial,
            subject_key_identifier: Some(ski),
            subject_alt_names: san,
            certificate: Some(certificate),
            crl_signer: None,
            uris,
        })
    }

    /// Reconstruct an identity from pre-extracted fields.
    ///
    /// Used when the CA's own certificate is managed elsewhere and only the
    /// identity fields were persisted.
    pub fn from_parts(
        subject: impl Into<String>,
        serial: Serial,
        subject_key_identifier: Option<Vec<u8>>,
        subject_alt_names: Option<Vec<String>>,
        uris: CaUris,
    ) -> Self {
        let subject = subject.into();
        Self {
            canonical_subject: canonicalize_subject(&subject),
            subject,
            serial,
            subject_key_identifier,
            subject_alt_names,
            certificate: None,
            crl_signer: None,
            uris,
        }
    }

    /// Human-readable subject name.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Canonicalized subject form used for comparisons.
    pub fn canonical_subject(&self) -> &str {
        &self.canonical_subject
    }

    /// CA certificate serial number.
    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    /// Subject key identifier, when known.
    pub fn subject_key_identifier(&self) -> Option<&[u8]> {
        self.subject_key_identifier.as_deref()
    }

    /// Rendered subject alternative names, when the certificate carries any.
    pub fn subject_alt_names(&self) -> Option<&[String]> {
        self.subject_alt_names.as_deref()
    }

    /// The CA's own certificate, when managed here.
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// Advertised URI sets.
    pub fn uris(&self) -> &CaUris {
        &self.uris
    }

    /// Replace the advertised URI sets.
    pub fn set_uris(&mut self, uris: CaUris) {
        self.uris = uris;
    }

    /// The certificate used to sign CRLs, when it differs from the CA's own.
    ///
    /// `None` unambiguously means the CA signs its own CRLs.
    pub fn crl_signer_certificate(&self) -> Option<&Certificate> {
        self.crl_signer.as_ref()
    }

    /// Install or clear the CRL-signer certificate.
    ///
    /// A signer equal to the CA's own certificate is normalized to "none"
    /// rather than stored as a duplicate.
    pub fn set_crl_signer_certificate(&mut self, signer: Option<Certificate>) -> Result<()> {
        self.crl_signer = match (signer, &self.certificate) {
            (Some(signer), Some(own)) if same_certificate(&signer, own)? => None,
            (signer, _) => signer,
        };
        Ok(())
    }

    /// Whether `other` names the same subject as this CA, after
    /// canonicalization.
    pub fn is_same_subject(&self, other: &str) -> bool {
        self.canonical_subject == canonicalize_subject(other)
    }
}

fn same_certificate(a: &Certificate, b: &Certificate) -> Result<bool> {
    Ok(a.to_der()? == b.to_der()?)
}

/// Comparison form of an RFC 4514 subject string: case-folded, with
/// insignificant whitespace around separators removed. Not a full RFC 4518
/// string-prep; sufficient for equality checks on names this engine itself
/// rendered.
fn canonicalize_subject(subject: &str) -> String {
    let mut out = String::with_capacity(subject.len());
    let mut pending_space = false;
    for ch in subject.chars() {
        match ch {
            ' ' | '\t' => {
                if !out.is_empty() {
                    pending_space = true;
                }
            }
            ',' | '=' | '+' => {
                pending_space = false;
                out.push(ch);
            }
            _ => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                for folded in ch.to_lowercase() {
                    out.push(folded);
                }
            }
        }
    }
    out
}

fn render_general_name(name: &GeneralName) -> String {
    match name {
        GeneralName::DnsName(dns) => format!("dns:{}", dns.as_str()),
        GeneralName::Rfc822Name(email) => format!("email:{}", email.as_str()),
        GeneralName::UniformResourceIdentifier(uri) => format!("uri:{}", uri.as_str()),
        GeneralName::IpAddress(ip) => {
            let bytes = ip.as_bytes();
            match bytes.len() {
                4 => format!("ip:{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]),
                _ => format!("ip:{}", hex::encode(bytes)),
            }
        }
        GeneralName::DirectoryName(dir) => format!("dirname:{dir}"),
        other => format!("other:{other:?}"),
    }
}
