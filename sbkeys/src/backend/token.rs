// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Keys held in a PIV hardware token.
//!
//! The key lives in the token's digital signature slot and never
//! leaves it. The private key file only records which token (by serial
//! number) and which slot to use. Every signature requires the token to
//! be present and touched.

use super::file::common_name;
use super::{decode_private_pem, encode_private_pem};
use super::{BackendContext, BackendKind, Interaction, KeyBackend};
use crate::certificate::{self, CertSigner, Certificate};
use crate::{Error, Result};
use core::fmt::{self, Display, Formatter};
use log::{info, warn};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// PIV slot 9c, "Digital Signature".
pub const SIGNING_SLOT: u8 = 0x9c;

/// How often to look for a token while waiting for one.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenAlgorithm {
    Rsa1024,
    Rsa2048,
    EccP256,
    EccP384,
}

impl Display for TokenAlgorithm {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Self::Rsa1024 => "RSA-1024",
            Self::Rsa2048 => "RSA-2048",
            Self::EccP256 => "ECC P-256",
            Self::EccP384 => "ECC P-384",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinPolicy {
    Never,
    /// The PIN is entered once per session.
    Once,
    Always,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TouchPolicy {
    Never,
    Always,
    Cached,
}

/// Key currently stored in a slot.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotKey {
    pub algorithm: TokenAlgorithm,
    /// Set for RSA keys.
    pub public_key: Option<RsaPublicKey>,
}

/// An open connection to one token.
pub trait Token {
    fn serial(&self) -> u32;

    /// Get the key in `slot`, if any.
    fn slot_key(&mut self, slot: u8) -> Result<Option<SlotKey>>;

    fn generate(
        &mut self,
        slot: u8,
        algorithm: TokenAlgorithm,
        pin: PinPolicy,
        touch: TouchPolicy,
    ) -> Result<RsaPublicKey>;

    /// Sign a SHA-256 digest with PKCS#1 v1.5 padding.
    fn sign_digest(&mut self, slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>>;
}

/// Finds attached tokens.
pub trait TokenProvider {
    /// Serial numbers of the attached tokens.
    fn list(&self) -> Result<Vec<u32>>;

    fn open(&self, serial: u32) -> Result<Box<dyn Token>>;
}

/// Tells the user what the token needs from them.
pub trait UserPresence {
    fn waiting_for_token(&self, timeout: Duration);

    fn touch_required(&self, description: &str);
}

/// Reports through the log.
pub struct LogPresence;

impl UserPresence for LogPresence {
    fn waiting_for_token(&self, timeout: Duration) {
        warn!(
            "no hardware token found, insert one (waiting {} seconds)",
            timeout.as_secs()
        );
    }

    fn touch_required(&self, description: &str) {
        warn!("touch the hardware token to sign with the {description}");
    }
}

/// Wait until a token is attached.
///
/// If `serial` is set, wait for that particular token. Gives up with
/// [`Error::TokenNotFound`] after `timeout`.
fn wait_for_token(
    tokens: &dyn TokenProvider,
    presence: &dyn UserPresence,
    timeout: Duration,
    serial: Option<u32>,
) -> Result<Box<dyn Token>> {
    let start = Instant::now();
    let mut notified = false;
    loop {
        let attached = tokens.list()?;
        let found = match serial {
            Some(serial) => attached.contains(&serial).then_some(serial),
            None => attached.first().copied(),
        };
        if let Some(serial) = found {
            return tokens.open(serial);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::TokenNotFound(timeout));
        }
        if !notified {
            presence.waiting_for_token(timeout);
            notified = true;
        }
        thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
    }
}

pub struct TokenBackend {
    tokens: Arc<dyn TokenProvider>,
    presence: Arc<dyn UserPresence>,
    timeout: Duration,
    serial: u32,
    certificate: Certificate,
    description: String,
}

struct TokenSigner<'a> {
    tokens: &'a dyn TokenProvider,
    presence: &'a dyn UserPresence,
    timeout: Duration,
    serial: u32,
    description: &'a str,
}

impl TokenSigner<'_> {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest: [u8; 32] = Sha256::digest(message).into();
        let mut token =
            wait_for_token(self.tokens, self.presence, self.timeout, Some(self.serial))?;
        self.presence.touch_required(self.description);
        token.sign_digest(SIGNING_SLOT, &digest)
    }
}

impl TokenBackend {
    /// Set up the signing slot of the first attached token.
    ///
    /// An existing RSA-2048 key in the slot is reused. Any other key
    /// type in the slot is an error rather than being overwritten.
    pub fn generate(description: &str, ctx: &BackendContext) -> Result<Self> {
        let tokens = ctx.token_provider()?;
        let presence = ctx.presence.as_ref();
        let mut token = wait_for_token(tokens.as_ref(), presence, ctx.token_timeout, None)?;
        let serial = token.serial();

        let public_key = match token.slot_key(SIGNING_SLOT)? {
            Some(SlotKey {
                algorithm: TokenAlgorithm::Rsa2048,
                public_key: Some(public_key),
            }) => {
                info!("reusing the existing key on token {serial} for {description}");
                public_key
            }
            Some(key) => {
                return Err(Error::TokenSlotIncompatible {
                    slot: SIGNING_SLOT,
                    algorithm: key.algorithm.to_string(),
                });
            }
            None => {
                info!("generating a key on token {serial} for {description}");
                presence.touch_required(description);
                token.generate(
                    SIGNING_SLOT,
                    TokenAlgorithm::Rsa2048,
                    PinPolicy::Once,
                    TouchPolicy::Always,
                )?
            }
        };
        drop(token);

        let signer = TokenSigner {
            tokens: tokens.as_ref(),
            presence,
            timeout: ctx.token_timeout,
            serial,
            description,
        };
        let sign = |msg: &[u8]| signer.sign(msg);
        let certificate =
            certificate::self_signed(description, &CertSigner::new(public_key, &sign))?;

        Ok(Self {
            tokens,
            presence: ctx.presence.clone(),
            timeout: ctx.token_timeout,
            serial,
            certificate,
            description: description.to_owned(),
        })
    }

    pub fn load(private: &[u8], certificate: Certificate, ctx: &BackendContext) -> Result<Self> {
        let data = decode_private_pem(BackendKind::Token, private)?;
        let [s0, s1, s2, s3, slot] = data[..] else {
            return Err(Error::CorruptKeyMaterial(format!(
                "token key reference has {} bytes, expected 5",
                data.len()
            )));
        };
        if slot != SIGNING_SLOT {
            return Err(Error::CorruptKeyMaterial(format!(
                "unsupported token slot {slot:#04x}"
            )));
        }
        certificate::public_key(&certificate)?;
        let tokens = ctx.token_provider()?;

        Ok(Self {
            tokens,
            presence: ctx.presence.clone(),
            timeout: ctx.token_timeout,
            serial: u32::from_be_bytes([s0, s1, s2, s3]),
            description: common_name(&certificate),
            certificate,
        })
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }
}

impl KeyBackend for TokenBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Token
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    fn interaction(&self) -> Interaction {
        Interaction::UserPresence
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signer = TokenSigner {
            tokens: self.tokens.as_ref(),
            presence: self.presence.as_ref(),
            timeout: self.timeout,
            serial: self.serial,
            description: &self.description,
        };
        let signature = signer.sign(message)?;

        // The slot may have been regenerated since the certificate was
        // issued.
        let verifier = VerifyingKey::<Sha256>::new(certificate::public_key(&self.certificate)?);
        let parsed = Signature::try_from(signature.as_slice())
            .map_err(|err| Error::Token(err.to_string()))?;
        verifier.verify(message, &parsed).map_err(|_| {
            Error::Token(format!(
                "token {} no longer holds the key in the certificate",
                self.serial
            ))
        })?;
        Ok(signature)
    }

    fn private_bytes(&self) -> Result<Vec<u8>> {
        let mut data = self.serial.to_be_bytes().to_vec();
        data.push(SIGNING_SLOT);
        encode_private_pem(BackendKind::Token, &data)
    }
}
