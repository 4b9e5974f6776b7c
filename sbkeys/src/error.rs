// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::backend::BackendKind;
use crate::hierarchy::Role;
use camino::Utf8PathBuf;
use core::fmt::{self, Display, Formatter};
use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),

    /// The filesystem handle does not allow access to this path.
    #[error("access to {0} is not permitted")]
    PathNotPermitted(Utf8PathBuf),

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),

    /// The private key file holds a different kind of key than the
    /// configured backend expects.
    #[error("expected {expected} key material, found a \"{found}\" PEM block")]
    WrongKeyKind {
        expected: BackendKind,
        found: String,
    },

    #[error("corrupt or foreign key material: {0}")]
    CorruptKeyMaterial(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid PE executable: {0}")]
    InvalidPe(String),

    #[error("invalid PKCS#7 signature: {0}")]
    InvalidSignature(String),

    #[error("invalid signature database: {0}")]
    SignatureDatabase(#[from] siglist::Error),

    #[error("a TPM key is configured but no TPM is available")]
    TpmUnavailable,

    #[error("TPM error: {0}")]
    Tpm(String),

    #[error("no hardware token found after waiting {0:?}")]
    TokenNotFound(Duration),

    #[error("hardware token slot {slot:#04x} already holds an incompatible {algorithm} key")]
    TokenSlotIncompatible { slot: u8, algorithm: String },

    #[error("hardware token error: {0}")]
    Token(String),

    #[error("invalid owner GUID in {0}")]
    InvalidGuid(Utf8PathBuf),

    #[error("failed to read the TPM event log: {0}")]
    EventLog(#[from] eventlog::Error),

    #[error("invalid tracking table: {0}")]
    TrackingTable(#[from] serde_json::Error),

    #[error("source file {0} does not exist")]
    MissingSource(Utf8PathBuf),

    #[error("{0} is not tracked")]
    NotTracked(Utf8PathBuf),

    #[error("firmware variable {name}: {reason}")]
    Firmware { name: String, reason: String },

    /// The firmware rejected a variable update because it was not signed
    /// by a key enrolled in the parent variable.
    #[error("{0} update is not signed by an enrolled key")]
    UnauthorizedUpdate(String),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// Some files in a batch failed. Each failure is listed with the
    /// path of the file.
    #[error("failed to sign {} file(s)", .0.len())]
    Batch(Vec<(Utf8PathBuf, Error)>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Step of key rotation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RotationStage {
    Collect,
    ReadFirmware,
    Backup,
    Install,
    UpdateDatabase,
    ClearKeys,
    Persist,
    Enroll,
    Resign,
}

impl Display for RotationStage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Self::Collect => "collecting the current keys",
            Self::ReadFirmware => "reading firmware databases",
            Self::Backup => "backing up the current keys",
            Self::Install => "installing the new keys",
            Self::UpdateDatabase => "updating signature databases",
            Self::ClearKeys => "clearing the old key storage",
            Self::Persist => "saving the new keys",
            Self::Enroll => "enrolling signature databases",
            Self::Resign => "re-signing tracked files",
        };
        f.write_str(s)
    }
}

/// Key rotation failed.
///
/// Rotation does not roll back firmware state. If `role` is set, that
/// role's firmware database may not match the saved keys; restore from
/// the backup directory.
#[derive(Debug)]
pub struct RotationError {
    pub stage: RotationStage,
    pub role: Option<Role>,
    pub source: Box<Error>,
}

impl RotationError {
    pub fn new(stage: RotationStage, role: Option<Role>, source: Error) -> Self {
        Self {
            stage,
            role,
            source: Box::new(source),
        }
    }
}

impl Display for RotationError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "key rotation failed while {}", self.stage)?;
        if let Some(role) = self.role {
            write!(f, " ({role})")?;
        }
        write!(f, ": {}", self.source)
    }
}

impl std::error::Error for RotationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}
