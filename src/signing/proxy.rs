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

//! Proxied signing backend.
//!
//! Forwards signing requests to a remote module over a caller-supplied
//! transport. The wire contract is deliberately small:
//!
//! Request envelope (all integers big-endian):
//!
//! ```text
//! u8   operation        1 = sign, 2 = digest-secret-key, 3 = probe
//! u16  entity length    followed by that many UTF-8 bytes
//! u32  mechanism id     see [`Mechanism::id`]
//! u8   params flag      1 if mechanism parameters follow
//! u32  params length    present only when the flag is 1, then the bytes
//! u32  content length   followed by that many bytes
//! ```
//!
//! The response is a single length-prefixed binary value: a `u32` length
//! followed by exactly that many bytes (the signature, or the digest for the
//! digest-secret-key operation, or empty for probe). Any other shape is a
//! protocol error; transport-level failures are transport errors. Both are
//! treated as signing failures by the lifecycle engine.

use crate::error::{CaError, Result};
use crate::signing::{Mechanism, SigningBackend, SigningIdentity};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Operation selector in the request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOperation {
    /// Produce a signature over the content.
    Sign,
    /// Digest a module-resident secret key.
    DigestSecretKey,
    /// Liveness probe; the module answers with an empty value.
    Probe,
}

impl ProxyOperation {
    fn tag(&self) -> u8 {
        match self {
            Self::Sign => 1,
            Self::DigestSecretKey => 2,
            Self::Probe => 3,
        }
    }

    /// Reverse of the wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Sign),
            2 => Some(Self::DigestSecretKey),
            3 => Some(Self::Probe),
            _ => None,
        }
    }
}

/// Transport collaborator carrying request envelopes to the remote module.
///
/// Implementations own connection management, authentication, and timeouts
/// below the envelope layer. Send/receive failures surface as `io::Error`
/// and are mapped to [`CaError::ProxyTransport`].
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Send one request envelope and return the raw response bytes.
    async fn exchange(&self, request: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// A decoded request envelope, as seen by the module side of the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    /// Requested operation.
    pub operation: ProxyOperation,
    /// Identifier of the signing entity on the remote module.
    pub entity: String,
    /// Mechanism identifier.
    pub mechanism: Mechanism,
    /// Optional mechanism parameters.
    pub parameters: Option<Vec<u8>>,
    /// Content to operate on.
    pub content: Vec<u8>,
}

/// Encode a request envelope.
pub fn encode_request(
    operation: ProxyOperation,
    entity: &str,
    mechanism: Mechanism,
    parameters: Option<&[u8]>,
    content: &[u8],
) -> Result<Vec<u8>> {
    let entity_bytes = entity.as_bytes();
    if entity_bytes.len() > u16::MAX as usize {
        return Err(CaError::validation("entity identifier too long"));
    }
    if content.len() > u32::MAX as usize {
        return Err(CaError::validation("content too large for envelope"));
    }

    let mut buf = Vec::with_capacity(16 + entity_bytes.len() + content.len());
    buf.push(operation.tag());
    buf.extend_from_slice(&(entity_bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(entity_bytes);
    buf.extend_from_slice(&mechanism.id().to_be_bytes());
    match parameters {
        Some(params) => {
            buf.push(1);
            buf.extend_from_slice(&(params.len() as u32).to_be_bytes());
            buf.extend_from_slice(params);
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&(content.len() as u32).to_be_bytes());
    buf.extend_from_slice(content);
    Ok(buf)
}

/// Decode a request envelope. Provided for module-side implementations and
/// round-trip testing; the backend itself only encodes.
pub fn decode_request(bytes: &[u8]) -> Result<ProxyRequest> {
    let mut cursor = Cursor::new(bytes);
    let operation = ProxyOperation::from_tag(cursor.take_u8()?)
        .ok_or_else(|| CaError::proxy_protocol("unknown operation tag"))?;
    let entity_len = cursor.take_u16()? as usize;
    let entity = std::str::from_utf8(cursor.take(entity_len)?)
        .map_err(|_| CaError::proxy_protocol("entity identifier is not UTF-8"))?
        .to_string();
    let mechanism_id = cursor.take_u32()?;
    let mechanism = Mechanism::from_id(mechanism_id)
        .ok_or_else(|| CaError::proxy_protocol(format!("unknown mechanism id {mechanism_id}")))?;
    let parameters = match cursor.take_u8()? {
        0 => None,
        1 => {
            let len = cursor.take_u32()? as usize;
            Some(cursor.take(len)?.to_vec())
        }
        flag => {
            return Err(CaError::proxy_protocol(format!(
                "invalid parameters flag {flag}"
            )))
        }
    };
    let content_len = cursor.take_u32()? as usize;
    let content = cursor.take(content_len)?.to_vec();
    cursor.finish()?;
    Ok(ProxyRequest {
        operation,
        entity,
        mechanism,
        parameters,
        content,
    })
}

/// Encode a response value. Module-side counterpart of [`decode_response`].
pub fn encode_response(value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + value.len());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Decode the single length-prefixed binary value a module returns.
///
/// Anything other than an exact `u32` length prefix followed by exactly that
/// many bytes is a protocol error.
pub fn decode_response(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(bytes);
    let len = cursor.take_u32()? as usize;
    let value = cursor.take(len)?.to_vec();
    cursor.finish()?;
    Ok(value)
}

/// Signing backend that forwards requests to a remote module.
pub struct ProxiedKeyBackend {
    transport: Arc<dyn ProxyTransport>,
    entity: String,
    identity: SigningIdentity,
}

impl ProxiedKeyBackend {
    /// Bind an entity on the remote module to a transport.
    pub fn new(
        transport: Arc<dyn ProxyTransport>,
        entity: impl Into<String>,
        identity: SigningIdentity,
    ) -> Self {
        Self {
            transport,
            entity: entity.into(),
            identity,
        }
    }

    /// The entity identifier sent in every envelope.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    async fn round_trip(
        &self,
        operation: ProxyOperation,
        mechanism: Mechanism,
        parameters: Option<&[u8]>,
        content: &[u8],
    ) -> Result<Vec<u8>> {
        let request = encode_request(operation, &self.entity, mechanism, parameters, content)?;
        let response = self
            .transport
            .exchange(&request)
            .await
            .map_err(|e| CaError::proxy_transport(e.to_string()))?;
        decode_response(&response)
    }
}

#[async_trait]
impl SigningBackend for ProxiedKeyBackend {
    fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    async fn sign(
        &self,
        mechanism: Mechanism,
        parameters: Option<&[u8]>,
        content: &[u8],
    ) -> Result<Vec<u8>> {
        let signature = self
            .round_trip(ProxyOperation::Sign, mechanism, parameters, content)
            .await?;
        let expected = self.identity.expected_signature_length();
        if signature.len() != expected {
            return Err(CaError::SignatureLengthMismatch {
                expected,
                actual: signature.len(),
            });
        }
        debug!(
            entity = %self.entity,
            mechanism = %mechanism,
            bytes = signature.len(),
            "remote module produced signature"
        );
        Ok(signature)
    }

    async fn digest_secret_key(&self, mechanism: Mechanism) -> Result<Vec<u8>> {
        self.round_trip(ProxyOperation::DigestSecretKey, mechanism, None, &[])
            .await
    }

    async fn probe(&self) -> Result<()> {
        let value = self
            .round_trip(ProxyOperation::Probe, Mechanism::Sha256Hmac, None, &[])
            .await?;
        if !value.is_empty() {
            return Err(CaError::proxy_protocol(
                "probe response carried a non-empty value",
            ));
        }
        Ok(())
    }
}

/// Minimal forward-only reader over the envelope bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| CaError::proxy_protocol("envelope truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(CaError::proxy_protocol(format!(
                "{} trailing bytes after value",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{KeyAlgorithm, KeyHandle};
    use der::asn1::BitString;
    use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

    fn test_identity() -> SigningIdentity {
        let spki = SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::ID_EC_PUBLIC_KEY,
                parameters: None,
            },
            subject_public_key: BitString::from_bytes(&[0x04]).unwrap(),
        };
        SigningIdentity::new(
            KeyHandle::new(vec![1], KeyAlgorithm::EcdsaP256, None),
            spki,
            None,
        )
    }

    struct ScriptedTransport {
        response: std::io::Result<Vec<u8>>,
    }

    #[async_trait]
    impl ProxyTransport for ScriptedTransport {
        async fn exchange(&self, _request: &[u8]) -> std::io::Result<Vec<u8>> {
            match &self.response {
                Ok(bytes) => Ok(bytes.clone()),
                Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    #[test]
    fn test_request_round_trip() {
        let encoded = encode_request(
            ProxyOperation::Sign,
            "ca-signer-1",
            Mechanism::EcdsaSha256,
            Some(&[0xaa, 0xbb]),
            b"to-be-signed",
        )
        .unwrap();
        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(decoded.operation, ProxyOperation::Sign);
        assert_eq!(decoded.entity, "ca-signer-1");
        assert_eq!(decoded.mechanism, Mechanism::EcdsaSha256);
        assert_eq!(decoded.parameters.as_deref(), Some(&[0xaa, 0xbb][..]));
        assert_eq!(decoded.content, b"to-be-signed");
    }

    #[test]
    fn test_request_without_parameters() {
        let encoded = encode_request(
            ProxyOperation::DigestSecretKey,
            "e",
            Mechanism::Sha256Hmac,
            None,
            &[],
        )
        .unwrap();
        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(decoded.parameters, None);
        assert!(decoded.content.is_empty());
    }

    #[test]
    fn test_response_round_trip() {
        let value = vec![0x01; 64];
        assert_eq!(decode_response(&encode_response(&value)).unwrap(), value);
    }

    #[test]
    fn test_truncated_response_is_protocol_error() {
        let mut bytes = encode_response(&[0x01; 64]);
        bytes.truncate(40);
        assert!(matches!(
            decode_response(&bytes).unwrap_err(),
            CaError::ProxyProtocol(_)
        ));
    }

    #[test]
    fn test_trailing_bytes_are_protocol_error() {
        let mut bytes = encode_response(&[0x01; 8]);
        bytes.push(0xff);
        assert!(matches!(
            decode_response(&bytes).unwrap_err(),
            CaError::ProxyProtocol(_)
        ));
    }

    #[tokio::test]
    async fn test_sign_over_transport() {
        let backend = ProxiedKeyBackend::new(
            Arc::new(ScriptedTransport {
                response: Ok(encode_response(&[0x42; 64])),
            }),
            "ca-signer-1",
            test_identity(),
        );
        let sig = backend
            .sign(Mechanism::EcdsaSha256, None, b"tbs")
            .await
            .unwrap();
        assert_eq!(sig, vec![0x42; 64]);
    }

    #[tokio::test]
    async fn test_short_remote_signature_rejected() {
        let backend = ProxiedKeyBackend::new(
            Arc::new(ScriptedTransport {
                response: Ok(encode_response(&[0x42; 63])),
            }),
            "ca-signer-1",
            test_identity(),
        );
        let err = backend
            .sign(Mechanism::EcdsaSha256, None, b"tbs")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaError::SignatureLengthMismatch {
                expected: 64,
                actual: 63
            }
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_maps_to_transport_error() {
        let backend = ProxiedKeyBackend::new(
            Arc::new(ScriptedTransport {
                response: Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer went away",
                )),
            }),
            "ca-signer-1",
            test_identity(),
        );
        let err = backend
            .sign(Mechanism::EcdsaSha256, None, b"tbs")
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::ProxyTransport(_)));
        assert!(err.is_signing());
    }

    #[tokio::test]
    async fn test_garbage_response_is_protocol_error() {
        let backend = ProxiedKeyBackend::new(
            Arc::new(ScriptedTransport {
                response: Ok(vec![0xde, 0xad]),
            }),
            "ca-signer-1",
            test_identity(),
        );
        let err = backend
            .sign(Mechanism::EcdsaSha256, None, b"tbs")
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::ProxyProtocol(_)));
    }
}
