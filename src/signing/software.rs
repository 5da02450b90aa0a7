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

//! In-process software token.
//!
//! Keys live in memory; there is no security boundary. Intended for
//! development deployments and tests. Signature output matches the raw token
//! format the rest of the engine expects: fixed-width `r || s` for ECDSA,
//! modulus-width for RSA.
//!
//! Supports P-256 and RSA keys. P-384 is intentionally absent: nothing in a
//! development deployment needs it, and hardware tokens cover it.

use crate::signing::pool::{SessionError, SlotToken, TokenSession};
use crate::signing::{KeyAlgorithm, KeyHandle, KeySpec, Mechanism, SigningIdentity};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand_core::OsRng;
use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use spki::{EncodePublicKey, SubjectPublicKeyInfoOwned};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use x509_cert::Certificate;

enum SoftKey {
    P256(SigningKey),
    Rsa(RsaPrivateKey),
}

struct KeyEntry {
    key: SoftKey,
    label: Option<String>,
    chain: Option<Vec<Certificate>>,
}

type KeyMap = Arc<RwLock<HashMap<Vec<u8>, KeyEntry>>>;

/// Software slot holding keys in memory.
#[derive(Clone, Default)]
pub struct SoftwareToken {
    keys: KeyMap,
    next_id: Arc<RwLock<u64>>,
}

impl SoftwareToken {
    /// Create an empty software token.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_key_id(&self) -> Vec<u8> {
        let mut id = self.next_id.write().expect("id counter poisoned");
        let current = *id;
        *id += 1;
        current.to_be_bytes().to_vec()
    }

    fn spki_for(key: &SoftKey) -> std::result::Result<SubjectPublicKeyInfoOwned, SessionError> {
        let der = match key {
            SoftKey::P256(k) => k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| SessionError::token(format!("encode public key: {e}")))?,
            SoftKey::Rsa(k) => RsaPublicKey::from(k)
                .to_public_key_der()
                .map_err(|e| SessionError::token(format!("encode public key: {e}")))?,
        };
        use der::Decode;
        SubjectPublicKeyInfoOwned::from_der(der.as_bytes())
            .map_err(|e| SessionError::token(format!("parse public key: {e}")))
    }
}

impl SlotToken for SoftwareToken {
    fn open_session(&self) -> std::result::Result<Box<dyn TokenSession>, SessionError> {
        Ok(Box::new(SoftwareSession {
            keys: self.keys.clone(),
        }))
    }

    fn generate_keypair(&self, spec: &KeySpec) -> std::result::Result<SigningIdentity, SessionError> {
        if let Some(label) = spec.label.as_deref() {
            let keys = self.keys.read().expect("key map poisoned");
            if keys.values().any(|e| e.label.as_deref() == Some(label)) {
                return Err(SessionError::token(format!(
                    "key with label '{label}' already exists"
                )));
            }
        }

        let key = match spec.algorithm {
            KeyAlgorithm::EcdsaP256 => SoftKey::P256(SigningKey::random(&mut OsRng)),
            KeyAlgorithm::Rsa { bits } => {
                if !matches!(bits, 2048 | 3072 | 4096) {
                    return Err(SessionError::token(format!(
                        "unsupported RSA key size: {bits} bits (supported: 2048, 3072, 4096)"
                    )));
                }
                let private = RsaPrivateKey::new(&mut OsRng, bits as usize)
                    .map_err(|e| SessionError::token(format!("RSA key generation: {e}")))?;
                SoftKey::Rsa(private)
            }
            KeyAlgorithm::EcdsaP384 => {
                return Err(SessionError::token(
                    "software token does not support P-384 keys",
                ))
            }
        };

        let public_key = Self::spki_for(&key)?;
        let key_id = self.next_key_id();
        self.keys.write().expect("key map poisoned").insert(
            key_id.clone(),
            KeyEntry {
                key,
                label: spec.label.clone(),
                chain: None,
            },
        );

        let handle = KeyHandle::new(key_id, spec.algorithm, spec.label.clone());
        Ok(SigningIdentity::new(handle, public_key, None))
    }

    fn remove_identity(&self, handle: &KeyHandle) -> std::result::Result<(), SessionError> {
        let mut keys = self.keys.write().expect("key map poisoned");
        keys.remove(handle.id())
            .map(|_| ())
            .ok_or_else(|| SessionError::token(format!("key not found: {}", hex::encode(handle.id()))))
    }

    fn update_certificate(
        &self,
        handle: &KeyHandle,
        chain: &[Certificate],
    ) -> std::result::Result<(), SessionError> {
        let mut keys = self.keys.write().expect("key map poisoned");
        let entry = keys
            .get_mut(handle.id())
            .ok_or_else(|| SessionError::token(format!("key not found: {}", hex::encode(handle.id()))))?;
        entry.chain = Some(chain.to_vec());
        Ok(())
    }

    fn probe(&self) -> std::result::Result<(), SessionError> {
        Ok(())
    }
}

struct SoftwareSession {
    keys: KeyMap,
}

impl TokenSession for SoftwareSession {
    fn sign(
        &mut self,
        key: &KeyHandle,
        mechanism: Mechanism,
        _parameters: Option<&[u8]>,
        content: &[u8],
    ) -> std::result::Result<Vec<u8>, SessionError> {
        let keys = self.keys.read().expect("key map poisoned");
        let entry = keys
            .get(key.id())
            .ok_or_else(|| SessionError::token(format!("key not found: {}", hex::encode(key.id()))))?;

        match (&entry.key, mechanism) {
            (SoftKey::P256(signing_key), Mechanism::EcdsaSha256) => {
                let signature: Signature = signing_key.sign(content);
                Ok(signature.to_bytes().to_vec())
            }
            (SoftKey::Rsa(private), Mechanism::RsaPkcs) => {
                let digest = Sha256::digest(content);
                private
                    .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                    .map_err(|e| SessionError::token(format!("RSA sign: {e}")))
            }
            (SoftKey::Rsa(private), Mechanism::RsaPss) => {
                let digest = Sha256::digest(content);
                private
                    .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
                    .map_err(|e| SessionError::token(format!("RSA-PSS sign: {e}")))
            }
            (_, mechanism) => Err(SessionError::token(format!(
                "mechanism {mechanism} does not match key algorithm {}",
                key.algorithm().as_str()
            ))),
        }
    }

    fn digest_secret_key(
        &mut self,
        key: &KeyHandle,
        _mechanism: Mechanism,
    ) -> std::result::Result<Vec<u8>, SessionError> {
        let keys = self.keys.read().expect("key map poisoned");
        let entry = keys
            .get(key.id())
            .ok_or_else(|| SessionError::token(format!("key not found: {}", hex::encode(key.id()))))?;
        // Fingerprint via the public half; the software token has no
        // non-extractable secrets to protect.
        let spki = SoftwareToken::spki_for(&entry.key)?;
        use der::Encode;
        let der = spki
            .to_der()
            .map_err(|e| SessionError::token(format!("encode public key: {e}")))?;
        Ok(Sha256::digest(&der).to_vec())
    }

    fn login(&mut self) -> std::result::Result<(), SessionError> {
        Ok(())
    }
}
