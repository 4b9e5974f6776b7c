// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::{check_key_matches, decode_private_pem, encode_private_pem};
use super::{BackendKind, Interaction, KeyBackend};
use crate::certificate::{self, CertSigner, Certificate};
use crate::{Error, Result};
use log::info;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;

/// RSA key stored unencrypted in a PKCS#8 PEM file.
pub struct FileBackend {
    key: RsaPrivateKey,
    certificate: Certificate,
    description: String,
}

fn sign_with(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature = signing_key
        .try_sign(message)
        .map_err(|err| Error::Signing(err.to_string()))?;
    Ok(signature.to_vec())
}

impl FileBackend {
    pub fn generate(description: &str, bits: usize) -> Result<Self> {
        info!("generating {bits}-bit RSA key for {description}");
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|err| Error::KeyGeneration(err.to_string()))?;

        let sign = |msg: &[u8]| sign_with(&key, msg);
        let signer = CertSigner::new(key.to_public_key(), &sign);
        let certificate = certificate::self_signed(description, &signer)?;

        Ok(Self {
            key,
            certificate,
            description: description.to_owned(),
        })
    }

    pub fn load(private: &[u8], certificate: Certificate) -> Result<Self> {
        let der = decode_private_pem(BackendKind::File, private)?;
        let key = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|err| Error::CorruptKeyMaterial(err.to_string()))?;
        check_key_matches(&certificate, &key.to_public_key())?;

        Ok(Self {
            key,
            description: common_name(&certificate),
            certificate,
        })
    }
}

/// Get the description back out of a certificate subject.
pub(super) fn common_name(cert: &Certificate) -> String {
    let subject = certificate::subject(cert);
    subject
        .strip_prefix("CN=")
        .unwrap_or(&subject)
        .to_owned()
}

impl KeyBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    fn interaction(&self) -> Interaction {
        Interaction::None
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        sign_with(&self.key, message)
    }

    fn private_bytes(&self) -> Result<Vec<u8>> {
        let der = self
            .key
            .to_pkcs8_der()
            .map_err(|err| Error::CorruptKeyMaterial(err.to_string()))?;
        encode_private_pem(BackendKind::File, der.as_bytes())
    }
}
