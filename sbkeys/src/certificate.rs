// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Self-signed X.509 certificates for the key hierarchy.

use crate::{Error, Result};
use der::asn1::AnyRef;
use der::pem::LineEnding;
use der::{DecodePem, Encode, EncodePem};
use log::warn;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{Keypair, Signer};
use rsa::RsaPublicKey;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{
    AlgorithmIdentifierRef, SignatureAlgorithmIdentifier, SubjectPublicKeyInfoOwned,
};
use x509_cert::time::Validity;

pub use x509_cert::Certificate;

/// Certificates are valid for five years from creation.
pub const VALIDITY: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);

/// Adapts a backend's raw signing function to the interface the
/// certificate builder expects. Signatures are RSA PKCS#1 v1.5 over
/// SHA-256.
pub(crate) struct CertSigner<'a> {
    public_key: RsaPublicKey,
    sign: &'a dyn Fn(&[u8]) -> Result<Vec<u8>>,
}

impl<'a> CertSigner<'a> {
    pub(crate) fn new(
        public_key: RsaPublicKey,
        sign: &'a dyn Fn(&[u8]) -> Result<Vec<u8>>,
    ) -> Self {
        Self { public_key, sign }
    }
}

impl Keypair for CertSigner<'_> {
    type VerifyingKey = VerifyingKey<Sha256>;

    fn verifying_key(&self) -> VerifyingKey<Sha256> {
        VerifyingKey::new(self.public_key.clone())
    }
}

impl Signer<Signature> for CertSigner<'_> {
    fn try_sign(&self, msg: &[u8]) -> std::result::Result<Signature, rsa::signature::Error> {
        let bytes = (self.sign)(msg).map_err(|err| {
            warn!("failed to sign certificate: {err}");
            rsa::signature::Error::new()
        })?;
        Signature::try_from(bytes.as_slice())
    }
}

impl SignatureAlgorithmIdentifier for CertSigner<'_> {
    type Params = AnyRef<'static>;

    const SIGNATURE_ALGORITHM_IDENTIFIER: AlgorithmIdentifierRef<'static> =
        AlgorithmIdentifierRef {
            oid: const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
            parameters: Some(AnyRef::NULL),
        };
}

fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Serial numbers must be positive.
    bytes[0] &= 0x7f;
    bytes[0] |= 0x01;
    SerialNumber::new(&bytes).map_err(|err| Error::KeyGeneration(err.to_string()))
}

/// Create a self-signed certificate with subject `CN=<common_name>`.
pub(crate) fn self_signed(common_name: &str, signer: &CertSigner) -> Result<Certificate> {
    let gen_err = |err: &dyn std::fmt::Display| Error::KeyGeneration(err.to_string());

    let subject = Name::from_str(&format!("CN={common_name}")).map_err(|err| gen_err(&err))?;
    let validity = Validity::from_now(VALIDITY).map_err(|err| gen_err(&err))?;
    let spki = SubjectPublicKeyInfoOwned::from_key(signer.public_key.clone())
        .map_err(|err| gen_err(&err))?;

    let builder = CertificateBuilder::new(
        Profile::Root,
        random_serial()?,
        validity,
        subject,
        spki,
        signer,
    )
    .map_err(|err| gen_err(&err))?;
    builder
        .build::<Signature>()
        .map_err(|err| gen_err(&err))
}

pub fn to_pem(cert: &Certificate) -> Result<String> {
    cert.to_pem(LineEnding::LF)
        .map_err(|err| Error::InvalidCertificate(err.to_string()))
}

pub fn from_pem(data: &[u8]) -> Result<Certificate> {
    Certificate::from_pem(data).map_err(|err| Error::InvalidCertificate(err.to_string()))
}

pub fn to_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.to_der()
        .map_err(|err| Error::InvalidCertificate(err.to_string()))
}

pub fn from_der(data: &[u8]) -> Result<Certificate> {
    use der::Decode;
    Certificate::from_der(data).map_err(|err| Error::InvalidCertificate(err.to_string()))
}

/// Get the RSA public key of a certificate.
pub fn public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|err| Error::InvalidCertificate(err.to_string()))?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|err| Error::InvalidCertificate(format!("not an RSA key: {err}")))
}

/// Subject name, for example "CN=Platform Key".
pub fn subject(cert: &Certificate) -> String {
    cert.tbs_certificate.subject.to_string()
}
