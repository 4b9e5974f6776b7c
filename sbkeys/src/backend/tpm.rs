// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Keys sealed to the TPM.
//!
//! The TPM creates an RSA-2048 signing key under its storage root key
//! and returns the key as a public blob and an encrypted private blob.
//! Only that TPM can load the private blob, so the key file is useless
//! on any other machine.
//!
//! The blobs are stored in the `TSS2 PRIVATE KEY` format shared with
//! the OpenSSL and GnuTLS TPM engines:
//!
//! ```text
//! TPMKey ::= SEQUENCE {
//!     type        OBJECT IDENTIFIER,
//!     emptyAuth   [0] EXPLICIT BOOLEAN OPTIONAL,
//!     parent      INTEGER,
//!     pubkey      OCTET STRING,
//!     privkey     OCTET STRING
//! }
//! ```

use super::file::common_name;
use super::{decode_private_pem, encode_private_pem};
use super::{BackendKind, Interaction, KeyBackend};
use crate::certificate::{self, CertSigner, Certificate};
use crate::{Error, Result};
use const_oid::ObjectIdentifier;
use der::asn1::OctetString;
use der::{Decode, Encode, Sequence};
use log::info;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// `id-loadablekey`: a key that is loaded under its parent rather than
/// imported.
const LOADABLE_KEY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.133.10.1.3");

/// Persistent handle of the owner hierarchy storage root key.
pub const STORAGE_ROOT_KEY_HANDLE: u32 = 0x4000_0001;

/// A key created by the TPM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TpmKey {
    pub parent: u32,
    /// `TPM2B_PUBLIC`.
    pub public: Vec<u8>,
    /// `TPM2B_PRIVATE`, encrypted by the parent key.
    pub private: Vec<u8>,
}

/// An open connection to the TPM.
pub trait TpmSession {
    /// Create an RSA-2048 signing key under the storage root key.
    fn create_signing_key(&mut self) -> Result<(TpmKey, RsaPublicKey)>;

    /// Load `key` and sign a SHA-256 digest with PKCS#1 v1.5 padding.
    fn sign_digest(&mut self, key: &TpmKey, digest: &[u8; 32]) -> Result<Vec<u8>>;
}

/// Opens TPM sessions. A new session is opened for each signature.
pub trait TpmSessionFactory {
    fn open(&self) -> Result<Box<dyn TpmSession>>;
}

#[derive(Sequence)]
struct TssPrivateKey {
    key_type: ObjectIdentifier,
    #[asn1(context_specific = "0", optional = "true")]
    empty_auth: Option<bool>,
    parent: u32,
    pubkey: OctetString,
    privkey: OctetString,
}

pub struct TpmBackend {
    tpm: Arc<dyn TpmSessionFactory>,
    key: TpmKey,
    certificate: Certificate,
    description: String,
}

fn sign_with(tpm: &dyn TpmSessionFactory, key: &TpmKey, message: &[u8]) -> Result<Vec<u8>> {
    let digest: [u8; 32] = Sha256::digest(message).into();
    let mut session = tpm.open()?;
    session.sign_digest(key, &digest)
}

fn corrupt(err: der::Error) -> Error {
    Error::CorruptKeyMaterial(err.to_string())
}

impl TpmBackend {
    pub fn generate(description: &str, tpm: Option<Arc<dyn TpmSessionFactory>>) -> Result<Self> {
        let tpm = tpm.ok_or(Error::TpmUnavailable)?;
        info!("creating TPM key for {description}");
        let (key, public_key) = tpm.open()?.create_signing_key()?;

        let sign = |msg: &[u8]| sign_with(tpm.as_ref(), &key, msg);
        let signer = CertSigner::new(public_key, &sign);
        let certificate = certificate::self_signed(description, &signer)?;

        Ok(Self {
            tpm,
            key,
            certificate,
            description: description.to_owned(),
        })
    }

    pub fn load(
        private: &[u8],
        certificate: Certificate,
        tpm: Option<Arc<dyn TpmSessionFactory>>,
    ) -> Result<Self> {
        let der = decode_private_pem(BackendKind::Tpm, private)?;
        let tss = TssPrivateKey::from_der(&der).map_err(corrupt)?;
        if tss.key_type != LOADABLE_KEY_OID {
            return Err(Error::CorruptKeyMaterial(format!(
                "unsupported TPM key type {}",
                tss.key_type
            )));
        }
        // Check the certificate before touching the TPM.
        certificate::public_key(&certificate)?;
        let tpm = tpm.ok_or(Error::TpmUnavailable)?;

        let backend = Self {
            tpm,
            key: TpmKey {
                parent: tss.parent,
                public: tss.pubkey.into_bytes(),
                private: tss.privkey.into_bytes(),
            },
            description: common_name(&certificate),
            certificate,
        };
        Ok(backend)
    }
}

impl KeyBackend for TpmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tpm
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    fn interaction(&self) -> Interaction {
        Interaction::TpmSession
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        sign_with(self.tpm.as_ref(), &self.key, message)
    }

    fn private_bytes(&self) -> Result<Vec<u8>> {
        let tss = TssPrivateKey {
            key_type: LOADABLE_KEY_OID,
            empty_auth: Some(true),
            parent: self.key.parent,
            pubkey: OctetString::new(self.key.public.clone()).map_err(corrupt)?,
            privkey: OctetString::new(self.key.private.clone()).map_err(corrupt)?,
        };
        encode_private_pem(BackendKind::Tpm, &tss.to_der().map_err(corrupt)?)
    }
}
