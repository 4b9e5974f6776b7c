// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Signing key backends.
//!
//! A key can live in a PEM file, be sealed to the TPM, or be held in a
//! hardware token. Every backend stores two files: the private part
//! (whose PEM label identifies the backend) and a PEM certificate.

mod file;
mod tpm;
mod token;

pub use file::FileBackend;
pub use token::{
    LogPresence, PinPolicy, SlotKey, Token, TokenAlgorithm, TokenBackend, TokenProvider,
    TouchPolicy, UserPresence, SIGNING_SLOT,
};
pub use tpm::{TpmBackend, TpmKey, TpmSession, TpmSessionFactory, STORAGE_ROOT_KEY_HANDLE};

use crate::certificate::{self, Certificate};
use crate::{Error, Result};
use core::fmt::{self, Display, Formatter};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Where a key is kept.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    File,
    Tpm,
    Token,
}

impl BackendKind {
    /// PEM label of the private key file.
    pub fn pem_label(self) -> &'static str {
        match self {
            Self::File => "PRIVATE KEY",
            Self::Tpm => "TSS2 PRIVATE KEY",
            Self::Token => "HARDWARE TOKEN KEY",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Self::File => "file",
            Self::Tpm => "tpm",
            Self::Token => "token",
        };
        f.write_str(s)
    }
}

/// What signing with a backend may require of the user or system.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interaction {
    None,
    /// A TPM session is opened for each signature.
    TpmSession,
    /// The token must be present and touched.
    UserPresence,
}

pub trait KeyBackend {
    fn kind(&self) -> BackendKind;

    /// Human readable name, also used as the certificate common name.
    fn description(&self) -> &str;

    fn certificate(&self) -> &Certificate;

    fn interaction(&self) -> Interaction;

    /// Sign `message` with RSA PKCS#1 v1.5 over SHA-256.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Serialized private key file contents.
    fn private_bytes(&self) -> Result<Vec<u8>>;

    /// Serialized certificate file contents.
    fn certificate_bytes(&self) -> Result<Vec<u8>> {
        Ok(certificate::to_pem(self.certificate())?.into_bytes())
    }

    fn certificate_der(&self) -> Result<Vec<u8>> {
        certificate::to_der(self.certificate())
    }
}

/// Resources backends need to create or load keys.
#[derive(Clone)]
pub struct BackendContext {
    /// Size of newly generated file keys.
    pub file_key_bits: usize,
    pub tpm: Option<Arc<dyn TpmSessionFactory>>,
    pub tokens: Option<Arc<dyn TokenProvider>>,
    pub presence: Arc<dyn UserPresence>,
    pub token_timeout: Duration,
}

impl BackendContext {
    pub const DEFAULT_FILE_KEY_BITS: usize = 4096;

    /// Context with no TPM or token access.
    pub fn file_only() -> Self {
        Self {
            file_key_bits: Self::DEFAULT_FILE_KEY_BITS,
            tpm: None,
            tokens: None,
            presence: Arc::new(LogPresence),
            token_timeout: Duration::from_secs(90),
        }
    }

    fn token_provider(&self) -> Result<Arc<dyn TokenProvider>> {
        self.tokens
            .clone()
            .ok_or_else(|| Error::Token("no hardware token support available".into()))
    }
}

/// Create a new key and self-signed certificate.
pub fn generate(
    kind: BackendKind,
    description: &str,
    ctx: &BackendContext,
) -> Result<Box<dyn KeyBackend>> {
    Ok(match kind {
        BackendKind::File => Box::new(FileBackend::generate(description, ctx.file_key_bits)?),
        BackendKind::Tpm => Box::new(TpmBackend::generate(description, ctx.tpm.clone())?),
        BackendKind::Token => Box::new(TokenBackend::generate(description, ctx)?),
    })
}

/// Load a key from its serialized private part and certificate.
pub fn load(
    kind: BackendKind,
    private: &[u8],
    cert: &[u8],
    ctx: &BackendContext,
) -> Result<Box<dyn KeyBackend>> {
    let cert = certificate::from_pem(cert)?;
    Ok(match kind {
        BackendKind::File => Box::new(FileBackend::load(private, cert)?),
        BackendKind::Tpm => Box::new(TpmBackend::load(private, cert, ctx.tpm.clone())?),
        BackendKind::Token => Box::new(TokenBackend::load(private, cert, ctx)?),
    })
}

/// Decode a PEM private key file, checking that its label matches the
/// backend.
fn decode_private_pem(expected: BackendKind, data: &[u8]) -> Result<Vec<u8>> {
    let (label, der) = pem_rfc7468::decode_vec(data)
        .map_err(|err| Error::CorruptKeyMaterial(format!("invalid PEM: {err}")))?;
    if label != expected.pem_label() {
        return Err(Error::WrongKeyKind {
            expected,
            found: label.to_owned(),
        });
    }
    Ok(der)
}

fn encode_private_pem(kind: BackendKind, der: &[u8]) -> Result<Vec<u8>> {
    let pem = pem_rfc7468::encode_string(kind.pem_label(), pem_rfc7468::LineEnding::LF, der)
        .map_err(|err| Error::CorruptKeyMaterial(err.to_string()))?;
    Ok(pem.into_bytes())
}

/// The certificate's key must be the key the backend signs with.
fn check_key_matches(cert: &Certificate, public_key: &rsa::RsaPublicKey) -> Result<()> {
    if &certificate::public_key(cert)? != public_key {
        return Err(Error::CorruptKeyMaterial(
            "private key does not match certificate".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{sign_detached, Pkcs7};
    use crate::testing::test_backend_context;
    use anyhow::Result;

    fn check_backend(kind: BackendKind) -> Result<()> {
        let ctx = test_backend_context();
        let backend = generate(kind, "Key Exchange Key", &ctx)?;
        assert_eq!(backend.kind(), kind);
        assert_eq!(backend.description(), "Key Exchange Key");
        assert_eq!(
            certificate::subject(backend.certificate()),
            "CN=Key Exchange Key"
        );

        // Signatures verify with the certificate.
        let message = b"message";
        let sig = Pkcs7::parse(&sign_detached(backend.as_ref(), message)?)?;
        assert!(sig.verify_detached(message, backend.certificate())?);
        assert!(!sig.verify_detached(b"other message", backend.certificate())?);

        // Loading the serialized form gives an equivalent backend.
        let private = backend.private_bytes()?;
        let cert = backend.certificate_bytes()?;
        let loaded = load(kind, &private, &cert, &ctx)?;
        assert_eq!(loaded.certificate(), backend.certificate());
        let sig = Pkcs7::parse(&sign_detached(loaded.as_ref(), message)?)?;
        assert!(sig.verify_detached(message, backend.certificate())?);

        // The private key file is labelled with the backend kind.
        let pem = String::from_utf8(private)?;
        assert!(pem.starts_with(&format!("-----BEGIN {}-----", kind.pem_label())));
        Ok(())
    }

    /// Test generating, signing with, and reloading a file key.
    #[test]
    fn test_file_backend() -> Result<()> {
        check_backend(BackendKind::File)
    }

    /// Test generating, signing with, and reloading a TPM key.
    #[test]
    fn test_tpm_backend() -> Result<()> {
        check_backend(BackendKind::Tpm)
    }

    /// Test generating, signing with, and reloading a token key.
    #[test]
    fn test_token_backend() -> Result<()> {
        check_backend(BackendKind::Token)
    }

    /// Test that loading key material of the wrong kind fails.
    #[test]
    fn test_wrong_kind() -> Result<()> {
        let ctx = test_backend_context();
        let file = generate(BackendKind::File, "Database Key", &ctx)?;
        let err = load(
            BackendKind::Tpm,
            &file.private_bytes()?,
            &file.certificate_bytes()?,
            &ctx,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            Error::WrongKeyKind {
                expected: BackendKind::Tpm,
                ref found,
            } if found == "PRIVATE KEY"
        ));

        let tpm = generate(BackendKind::Tpm, "Database Key", &ctx)?;
        assert!(matches!(
            load(
                BackendKind::File,
                &tpm.private_bytes()?,
                &tpm.certificate_bytes()?,
                &ctx
            ),
            Err(Error::WrongKeyKind {
                expected: BackendKind::File,
                ..
            })
        ));
        Ok(())
    }

    /// Test that corrupt key material is reported as such.
    #[test]
    fn test_corrupt() -> Result<()> {
        let ctx = test_backend_context();
        let file = generate(BackendKind::File, "Database Key", &ctx)?;
        let cert = file.certificate_bytes()?;

        let garbage = encode_private_pem(BackendKind::File, &[1, 2, 3])?;
        assert!(matches!(
            load(BackendKind::File, &garbage, &cert, &ctx),
            Err(Error::CorruptKeyMaterial(_))
        ));
        assert!(matches!(
            load(BackendKind::File, b"not pem", &cert, &ctx),
            Err(Error::CorruptKeyMaterial(_))
        ));

        // A valid key that does not match the certificate.
        let other = generate(BackendKind::File, "Database Key", &ctx)?;
        assert!(matches!(
            load(BackendKind::File, &other.private_bytes()?, &cert, &ctx),
            Err(Error::CorruptKeyMaterial(_))
        ));
        Ok(())
    }

    /// Test that TPM keys need a TPM.
    #[test]
    fn test_tpm_unavailable() -> Result<()> {
        let mut ctx = test_backend_context();
        ctx.tpm = None;
        assert!(matches!(
            generate(BackendKind::Tpm, "Platform Key", &ctx),
            Err(Error::TpmUnavailable)
        ));
        Ok(())
    }
}
