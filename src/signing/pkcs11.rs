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

//! PKCS#11 (Cryptoki) slot integration.
//!
//! Adapts one PKCS#11 slot to the [`SlotToken`]/[`TokenSession`] interface so
//! the session pool can manage it. Tested against SoftHSM 2.x; other
//! Cryptoki-compliant modules should work.
//!
//! Sessions returned here hold no internal locking. The pool bounds
//! concurrent session use and serializes administrative operations, which is
//! exactly the discipline PKCS#11 requires for object creation and deletion.

use crate::error::{CaError, Result};
use crate::signing::pool::{SessionError, SlotToken, TokenSession};
use crate::signing::{KeyAlgorithm, KeyHandle, KeySpec, Mechanism, SigningIdentity};
use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, RSA_ENCRYPTION, SECP_256_R_1, SECP_384_R_1};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CkError, RvError};
use cryptoki::mechanism::Mechanism as CkMechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use der::asn1::{BitString, UintRef};
use der::{Decode, Encode};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256, Sha384};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use x509_cert::Certificate;

/// RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }
#[derive(der::Sequence)]
struct RsaPublicKeyDer<'a> {
    modulus: UintRef<'a>,
    exponent: UintRef<'a>,
}

/// One PKCS#11 slot, opened and authenticated with a user PIN.
pub struct Pkcs11Slot {
    pkcs11: Arc<Pkcs11>,
    slot: Slot,
    pin: AuthPin,
}

impl Pkcs11Slot {
    /// Load a PKCS#11 library and bind to a slot.
    ///
    /// When `slot_id` is `None` the first slot with a token present is used.
    pub fn new<P: AsRef<Path>>(library_path: P, slot_id: Option<u64>, pin: &str) -> Result<Self> {
        let pkcs11 = Pkcs11::new(library_path.as_ref()).map_err(|e| {
            CaError::configuration(format!(
                "failed to load PKCS#11 library at {}: {e}",
                library_path.as_ref().display()
            ))
        })?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| CaError::configuration(format!("PKCS#11 initialize: {e}")))?;

        let slots = pkcs11
            .get_slots_with_token()
            .map_err(|e| CaError::configuration(format!("enumerate slots: {e}")))?;
        let slot = match slot_id {
            Some(id) => slots
                .into_iter()
                .find(|s| s.id() == id)
                .ok_or_else(|| {
                    CaError::configuration(format!("slot {id} not found or has no token"))
                })?,
            None => slots.into_iter().next().ok_or_else(|| {
                CaError::configuration("no PKCS#11 slots with tokens found")
            })?,
        };

        let token_info = pkcs11
            .get_token_info(slot)
            .map_err(|e| CaError::configuration(format!("token info: {e}")))?;
        info!(
            slot = slot.id(),
            token = token_info.label().trim(),
            "bound PKCS#11 slot"
        );

        Ok(Self {
            pkcs11: Arc::new(pkcs11),
            slot,
            pin: AuthPin::new(pin.to_string()),
        })
    }

    fn authenticated_session(&self) -> std::result::Result<Session, SessionError> {
        let session = self
            .pkcs11
            .open_rw_session(self.slot)
            .map_err(|e| SessionError::token(format!("open session: {e}")))?;
        session
            .login(UserType::User, Some(&self.pin))
            .map_err(|e| SessionError::token(format!("login: {e}")))?;
        Ok(session)
    }

    fn find_private_key(
        session: &Session,
        id: &[u8],
    ) -> std::result::Result<ObjectHandle, SessionError> {
        let template = vec![
            Attribute::Id(id.to_vec()),
            Attribute::Class(ObjectClass::PRIVATE_KEY),
        ];
        session
            .find_objects(&template)
            .map_err(classify)?
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::token(format!("private key {} not on token", hex::encode(id))))
    }

    fn find_objects_with_id(
        session: &Session,
        id: &[u8],
        class: ObjectClass,
    ) -> std::result::Result<Vec<ObjectHandle>, SessionError> {
        let template = vec![Attribute::Id(id.to_vec()), Attribute::Class(class)];
        session.find_objects(&template).map_err(classify)
    }

    fn extract_public_key(
        session: &Session,
        pub_handle: ObjectHandle,
        algorithm: KeyAlgorithm,
    ) -> std::result::Result<SubjectPublicKeyInfoOwned, SessionError> {
        match algorithm {
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => {
                let curve = match algorithm {
                    KeyAlgorithm::EcdsaP256 => SECP_256_R_1,
                    _ => SECP_384_R_1,
                };
                let attrs = session
                    .get_attributes(pub_handle, &[AttributeType::EcPoint])
                    .map_err(classify)?;
                let ec_point = match attrs.first() {
                    Some(Attribute::EcPoint(point)) => point.clone(),
                    _ => return Err(SessionError::token("missing EC_POINT attribute")),
                };
                // CKA_EC_POINT wraps the uncompressed point in an OCTET STRING.
                let point = der::asn1::OctetStringRef::from_der(&ec_point)
                    .map(|os| os.as_bytes().to_vec())
                    .unwrap_or(ec_point);

                let params = curve
                    .to_der()
                    .map_err(|e| SessionError::token(format!("curve OID encode: {e}")))?;
                let algorithm = AlgorithmIdentifierOwned {
                    oid: ID_EC_PUBLIC_KEY,
                    parameters: Some(
                        der::Any::from_der(&params)
                            .map_err(|e| SessionError::token(format!("curve parameters: {e}")))?,
                    ),
                };
                let subject_public_key = BitString::from_bytes(&point)
                    .map_err(|e| SessionError::token(format!("EC point bit string: {e}")))?;
                Ok(SubjectPublicKeyInfoOwned {
                    algorithm,
                    subject_public_key,
                })
            }
            KeyAlgorithm::Rsa { .. } => {
                let attrs = session
                    .get_attributes(
                        pub_handle,
                        &[AttributeType::Modulus, AttributeType::PublicExponent],
                    )
                    .map_err(classify)?;
                let (modulus, exponent) = match (attrs.first(), attrs.get(1)) {
                    (Some(Attribute::Modulus(m)), Some(Attribute::PublicExponent(e))) => {
                        (m.clone(), e.clone())
                    }
                    _ => return Err(SessionError::token("missing RSA key attributes")),
                };
                let rsa_der = RsaPublicKeyDer {
                    modulus: UintRef::new(&modulus)
                        .map_err(|e| SessionError::token(format!("modulus: {e}")))?,
                    exponent: UintRef::new(&exponent)
                        .map_err(|e| SessionError::token(format!("exponent: {e}")))?,
                }
                .to_der()
                .map_err(|e| SessionError::token(format!("RSAPublicKey encode: {e}")))?;

                let algorithm = AlgorithmIdentifierOwned {
                    oid: RSA_ENCRYPTION,
                    parameters: Some(der::Any::null()),
                };
                let subject_public_key = BitString::from_bytes(&rsa_der)
                    .map_err(|e| SessionError::token(format!("RSA bit string: {e}")))?;
                Ok(SubjectPublicKeyInfoOwned {
                    algorithm,
                    subject_public_key,
                })
            }
        }
    }
}

impl SlotToken for Pkcs11Slot {
    fn open_session(&self) -> std::result::Result<Box<dyn TokenSession>, SessionError> {
        let session = self.authenticated_session()?;
        Ok(Box::new(Pkcs11Session {
            session,
            pin: self.pin.clone(),
        }))
    }

    fn generate_keypair(&self, spec: &KeySpec) -> std::result::Result<SigningIdentity, SessionError> {
        let session = self.authenticated_session()?;

        let key_id = fresh_key_id()?;
        let label_bytes = spec.label.clone().unwrap_or_default().into_bytes();

        let (mechanism, mut pub_template) = match spec.algorithm {
            KeyAlgorithm::EcdsaP256 => {
                let params = SECP_256_R_1
                    .to_der()
                    .map_err(|e| SessionError::token(format!("curve OID: {e}")))?;
                (CkMechanism::EccKeyPairGen, vec![Attribute::EcParams(params)])
            }
            KeyAlgorithm::EcdsaP384 => {
                let params = SECP_384_R_1
                    .to_der()
                    .map_err(|e| SessionError::token(format!("curve OID: {e}")))?;
                (CkMechanism::EccKeyPairGen, vec![Attribute::EcParams(params)])
            }
            KeyAlgorithm::Rsa { bits } => (
                CkMechanism::RsaPkcsKeyPairGen,
                vec![
                    Attribute::ModulusBits(cryptoki::types::Ulong::from(bits as u64)),
                    Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
                ],
            ),
        };
        pub_template.extend([
            Attribute::Label(label_bytes.clone()),
            Attribute::Id(key_id.clone()),
            Attribute::Token(true),
            Attribute::Verify(true),
        ]);
        let priv_template = vec![
            Attribute::Label(label_bytes),
            Attribute::Id(key_id.clone()),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Extractable(false),
        ];

        let (pub_handle, _priv_handle) = session
            .generate_key_pair(&mechanism, &pub_template, &priv_template)
            .map_err(classify)?;

        let public_key = Self::extract_public_key(&session, pub_handle, spec.algorithm)?;
        let handle = KeyHandle::new(key_id, spec.algorithm, spec.label.clone());
        Ok(SigningIdentity::new(handle, public_key, None))
    }

    fn remove_identity(&self, handle: &KeyHandle) -> std::result::Result<(), SessionError> {
        let session = self.authenticated_session()?;
        let mut removed = 0usize;
        for class in [
            ObjectClass::PRIVATE_KEY,
            ObjectClass::PUBLIC_KEY,
            ObjectClass::CERTIFICATE,
        ] {
            for object in Self::find_objects_with_id(&session, handle.id(), class)? {
                session.destroy_object(object).map_err(classify)?;
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(SessionError::token(format!(
                "no objects with id {} on token",
                hex::encode(handle.id())
            )));
        }
        Ok(())
    }

    fn update_certificate(
        &self,
        handle: &KeyHandle,
        chain: &[Certificate],
    ) -> std::result::Result<(), SessionError> {
        let session = self.authenticated_session()?;

        // Replace any certificate objects already stored under this id.
        for object in Self::find_objects_with_id(&session, handle.id(), ObjectClass::CERTIFICATE)? {
            session.destroy_object(object).map_err(classify)?;
        }
        for cert in chain {
            let der = cert
                .to_der()
                .map_err(|e| SessionError::token(format!("certificate encode: {e}")))?;
            let template = vec![
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::CertificateType(cryptoki::object::CertificateType::X_509),
                Attribute::Id(handle.id().to_vec()),
                Attribute::Token(true),
                Attribute::Value(der),
            ];
            session.create_object(&template).map_err(classify)?;
        }
        Ok(())
    }

    fn probe(&self) -> std::result::Result<(), SessionError> {
        self.pkcs11
            .get_token_info(self.slot)
            .map(|_| ())
            .map_err(|e| SessionError::token(format!("token info: {e}")))
    }
}

struct Pkcs11Session {
    session: Session,
    pin: AuthPin,
}

impl TokenSession for Pkcs11Session {
    fn sign(
        &mut self,
        key: &KeyHandle,
        mechanism: Mechanism,
        _parameters: Option<&[u8]>,
        content: &[u8],
    ) -> std::result::Result<Vec<u8>, SessionError> {
        let private = Pkcs11Slot::find_private_key(&self.session, key.id())?;
        match mechanism {
            Mechanism::EcdsaSha256 => {
                let digest = Sha256::digest(content);
                self.session
                    .sign(&CkMechanism::Ecdsa, private, &digest)
                    .map_err(classify)
            }
            Mechanism::EcdsaSha384 => {
                let digest = Sha384::digest(content);
                self.session
                    .sign(&CkMechanism::Ecdsa, private, &digest)
                    .map_err(classify)
            }
            Mechanism::RsaPkcs => self
                .session
                .sign(&CkMechanism::Sha256RsaPkcs, private, content)
                .map_err(classify),
            Mechanism::RsaPss | Mechanism::Sha256Hmac => Err(SessionError::token(format!(
                "mechanism {mechanism} not supported by this slot"
            ))),
        }
    }

    fn digest_secret_key(
        &mut self,
        _key: &KeyHandle,
        _mechanism: Mechanism,
    ) -> std::result::Result<Vec<u8>, SessionError> {
        // Secret-key digesting needs CKM_*_HMAC support that common modules
        // gate behind vendor config; declined here until a deployment needs it.
        Err(SessionError::token(
            "secret-key digest not supported by this slot",
        ))
    }

    fn login(&mut self) -> std::result::Result<(), SessionError> {
        match self.session.login(UserType::User, Some(&self.pin)) {
            Ok(()) => Ok(()),
            // Already logged in counts as recovered.
            Err(CkError::Pkcs11(RvError::UserAlreadyLoggedIn)) => Ok(()),
            Err(e) => Err(SessionError::token(format!("re-login: {e}"))),
        }
    }
}

/// Classify Cryptoki errors so the pool can handle lost authentication.
fn classify(err: CkError) -> SessionError {
    match &err {
        CkError::Pkcs11(
            RvError::UserNotLoggedIn | RvError::SessionHandleInvalid | RvError::SessionClosed,
        ) => SessionError::AuthenticationLost,
        _ => SessionError::token(err.to_string()),
    }
}

/// Fresh random CKA_ID so key generations never collide.
fn fresh_key_id() -> std::result::Result<Vec<u8>, SessionError> {
    let mut id = vec![0u8; 16];
    OsRng
        .try_fill_bytes(&mut id)
        .map_err(|e| SessionError::token(format!("key id generation: {e}")))?;
    Ok(id)
}
