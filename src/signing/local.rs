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

//! Local token signing backend.
//!
//! Signs with a key resident on an in-process or directly attached token,
//! borrowing sessions from a [`SlotSessionPool`]. Signature output length is
//! validated against the identity's expected length before the bytes are
//! trusted: HSM driver bugs have been observed to silently truncate output,
//! and a wrong-length signature must never reach a certificate.

use crate::error::{CaError, Result};
use crate::signing::pool::SlotSessionPool;
use crate::signing::{Mechanism, SigningBackend, SigningIdentity};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Signing backend bound to a local cryptographic token.
pub struct LocalKeyBackend {
    pool: Arc<SlotSessionPool>,
    identity: SigningIdentity,
}

impl LocalKeyBackend {
    /// Bind a signing identity to a session pool.
    ///
    /// The identity must have been created by (or loaded from) the same slot
    /// the pool manages; the backend does not verify this pairing.
    pub fn new(pool: Arc<SlotSessionPool>, identity: SigningIdentity) -> Self {
        Self { pool, identity }
    }

    /// The session pool backing this key.
    pub fn pool(&self) -> &Arc<SlotSessionPool> {
        &self.pool
    }
}

#[async_trait]
impl SigningBackend for LocalKeyBackend {
    fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    async fn sign(
        &self,
        mechanism: Mechanism,
        parameters: Option<&[u8]>,
        content: &[u8],
    ) -> Result<Vec<u8>> {
        let handle = self.identity.handle();
        let signature = self
            .pool
            .with_session(|session| session.sign(handle, mechanism, parameters, content))
            .await?;

        let expected = self.identity.expected_signature_length();
        if signature.len() != expected {
            return Err(CaError::SignatureLengthMismatch {
                expected,
                actual: signature.len(),
            });
        }
        debug!(
            mechanism = %mechanism,
            bytes = signature.len(),
            "local token produced signature"
        );
        Ok(signature)
    }

    async fn digest_secret_key(&self, mechanism: Mechanism) -> Result<Vec<u8>> {
        let handle = self.identity.handle();
        self.pool
            .with_session(|session| session.digest_secret_key(handle, mechanism))
            .await
    }

    async fn probe(&self) -> Result<()> {
        self.pool.probe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::pool::{SessionError, SlotToken, TokenSession};
    use crate::signing::{KeyAlgorithm, KeyHandle, KeySpec};
    use der::asn1::BitString;
    use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
    use std::time::Duration;
    use x509_cert::Certificate;

    /// Token whose sessions always emit a signature of a fixed length.
    struct FixedLengthToken {
        signature_len: usize,
    }

    struct FixedLengthSession {
        signature_len: usize,
    }

    impl TokenSession for FixedLengthSession {
        fn sign(
            &mut self,
            _key: &KeyHandle,
            _mechanism: Mechanism,
            _parameters: Option<&[u8]>,
            _content: &[u8],
        ) -> std::result::Result<Vec<u8>, SessionError> {
            Ok(vec![0x5a; self.signature_len])
        }

        fn digest_secret_key(
            &mut self,
            _key: &KeyHandle,
            _mechanism: Mechanism,
        ) -> std::result::Result<Vec<u8>, SessionError> {
            Ok(vec![0x11; 32])
        }

        fn login(&mut self) -> std::result::Result<(), SessionError> {
            Ok(())
        }
    }

    impl SlotToken for FixedLengthToken {
        fn open_session(&self) -> std::result::Result<Box<dyn TokenSession>, SessionError> {
            Ok(Box::new(FixedLengthSession {
                signature_len: self.signature_len,
            }))
        }

        fn generate_keypair(
            &self,
            _spec: &KeySpec,
        ) -> std::result::Result<SigningIdentity, SessionError> {
            Err(SessionError::token("not supported"))
        }

        fn remove_identity(&self, _handle: &KeyHandle) -> std::result::Result<(), SessionError> {
            Ok(())
        }

        fn update_certificate(
            &self,
            _handle: &KeyHandle,
            _chain: &[Certificate],
        ) -> std::result::Result<(), SessionError> {
            Ok(())
        }

        fn probe(&self) -> std::result::Result<(), SessionError> {
            Ok(())
        }
    }

    fn identity_for(algorithm: KeyAlgorithm) -> SigningIdentity {
        let spki = SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::ID_EC_PUBLIC_KEY,
                parameters: None,
            },
            subject_public_key: BitString::from_bytes(&[0x04, 0x01, 0x02]).unwrap(),
        };
        SigningIdentity::new(KeyHandle::new(vec![7], algorithm, None), spki, None)
    }

    fn backend(signature_len: usize, algorithm: KeyAlgorithm) -> LocalKeyBackend {
        let pool = Arc::new(
            SlotSessionPool::new(
                Box::new(FixedLengthToken { signature_len }),
                2,
                Duration::from_millis(100),
            )
            .unwrap(),
        );
        LocalKeyBackend::new(pool, identity_for(algorithm))
    }

    #[tokio::test]
    async fn test_rsa_2048_accepts_exactly_256_bytes() {
        let good = backend(256, KeyAlgorithm::Rsa { bits: 2048 });
        let sig = good.sign(Mechanism::RsaPkcs, None, b"tbs").await.unwrap();
        assert_eq!(sig.len(), 256);

        let truncated = backend(255, KeyAlgorithm::Rsa { bits: 2048 });
        let err = truncated
            .sign(Mechanism::RsaPkcs, None, b"tbs")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaError::SignatureLengthMismatch {
                expected: 256,
                actual: 255
            }
        ));
    }

    #[tokio::test]
    async fn test_p256_accepts_exactly_64_bytes() {
        let good = backend(64, KeyAlgorithm::EcdsaP256);
        let sig = good
            .sign(Mechanism::EcdsaSha256, None, b"tbs")
            .await
            .unwrap();
        assert_eq!(sig.len(), 64);

        // A DER-encoded (r,s) pair is longer than the raw form and must be
        // rejected, not silently accepted.
        let der_shaped = backend(70, KeyAlgorithm::EcdsaP256);
        let err = der_shaped
            .sign(Mechanism::EcdsaSha256, None, b"tbs")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaError::SignatureLengthMismatch {
                expected: 64,
                actual: 70
            }
        ));
    }

    #[tokio::test]
    async fn test_digest_secret_key_skips_length_check() {
        let backend = backend(64, KeyAlgorithm::EcdsaP256);
        let digest = backend.digest_secret_key(Mechanism::Sha256Hmac).await.unwrap();
        assert_eq!(digest.len(), 32);
    }
}
