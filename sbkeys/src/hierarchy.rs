// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The three Secure Boot signing keys.
//!
//! * The Platform Key (PK) authorizes changes to the PK and KEK.
//! * The Key Exchange Key (KEK) authorizes changes to db and dbx.
//! * The Database Key (db) signs boot executables.

use crate::backend::{self, BackendContext, BackendKind, KeyBackend};
use crate::config::KeysConfig;
use crate::fs::{Fs, PRIVATE_FILE_MODE, PUBLIC_FILE_MODE};
use crate::signature::{self, Pkcs7, WinCertificate, WIN_CERT_TYPE_PKCS_SIGNED_DATA};
use crate::{pe, Result};
use camino::{Utf8Path, Utf8PathBuf};
use core::fmt::{self, Display, Formatter};
use log::{debug, info};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Role {
    Pk,
    Kek,
    Db,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Pk, Role::Kek, Role::Db];

    /// Name of the role's firmware variable and key directory.
    pub fn name(self) -> &'static str {
        match self {
            Self::Pk => "PK",
            Self::Kek => "KEK",
            Self::Db => "db",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Pk => "Platform Key",
            Self::Kek => "Key Exchange Key",
            Self::Db => "Database Key",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Location of one role's key files:
///
/// ```text
/// <keydir>/<role>/<role>.key
/// <keydir>/<role>/<role>.pem
/// ```
pub struct KeyPaths {
    dir: Utf8PathBuf,
    role: Role,
}

impl KeyPaths {
    pub fn new(keydir: &Utf8Path, role: Role) -> Self {
        Self {
            dir: keydir.join(role.name()),
            role,
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn private_key(&self) -> Utf8PathBuf {
        self.dir.join(format!("{}.key", self.role.name()))
    }

    pub fn certificate(&self) -> Utf8PathBuf {
        self.dir.join(format!("{}.pem", self.role.name()))
    }
}

pub struct KeyHierarchy {
    pk: Box<dyn KeyBackend>,
    kek: Box<dyn KeyBackend>,
    db: Box<dyn KeyBackend>,
}

impl KeyHierarchy {
    pub fn new(
        pk: Box<dyn KeyBackend>,
        kek: Box<dyn KeyBackend>,
        db: Box<dyn KeyBackend>,
    ) -> Self {
        Self { pk, kek, db }
    }

    /// Generate all three keys in memory. Nothing is written.
    pub fn create_all(keys: &KeysConfig, ctx: &BackendContext) -> Result<Self> {
        let create = |role: Role| backend::generate(keys.backend(role), role.description(), ctx);
        Ok(Self {
            pk: create(Role::Pk)?,
            kek: create(Role::Kek)?,
            db: create(Role::Db)?,
        })
    }

    /// Load all three keys from `keydir`.
    pub fn load_all(
        fs: &Fs,
        keydir: &Utf8Path,
        keys: &KeysConfig,
        ctx: &BackendContext,
    ) -> Result<Self> {
        let load = |role: Role| {
            let paths = KeyPaths::new(keydir, role);
            let private = fs.read(&paths.private_key())?;
            let cert = fs.read(&paths.certificate())?;
            backend::load(keys.backend(role), &private, &cert, ctx)
        };
        Ok(Self {
            pk: load(Role::Pk)?,
            kek: load(Role::Kek)?,
            db: load(Role::Db)?,
        })
    }

    /// Whether any key files exist in `keydir`.
    pub fn exists(fs: &Fs, keydir: &Utf8Path) -> Result<bool> {
        for role in Role::ALL {
            let paths = KeyPaths::new(keydir, role);
            if fs.exists(&paths.private_key())? || fs.exists(&paths.certificate())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Write one role's key files.
    pub fn save_role(&self, fs: &Fs, keydir: &Utf8Path, role: Role) -> Result<()> {
        let key = self.get(role);
        // Serialize both files before writing either.
        let private = key.private_bytes()?;
        let cert = key.certificate_bytes()?;

        let paths = KeyPaths::new(keydir, role);
        fs.write_atomic(&paths.private_key(), &private, PRIVATE_FILE_MODE)?;
        fs.write_atomic(&paths.certificate(), &cert, PUBLIC_FILE_MODE)?;
        info!(
            "saved {} ({}) to {}",
            role.description(),
            key.kind(),
            paths.dir()
        );
        Ok(())
    }

    pub fn save_all(&self, fs: &Fs, keydir: &Utf8Path) -> Result<()> {
        for role in Role::ALL {
            self.save_role(fs, keydir, role)?;
        }
        Ok(())
    }

    pub fn get(&self, role: Role) -> &dyn KeyBackend {
        match role {
            Role::Pk => self.pk.as_ref(),
            Role::Kek => self.kek.as_ref(),
            Role::Db => self.db.as_ref(),
        }
    }

    /// Replace the key for `role`, returning the old one.
    pub fn replace(&mut self, role: Role, key: Box<dyn KeyBackend>) -> Box<dyn KeyBackend> {
        let slot = match role {
            Role::Pk => &mut self.pk,
            Role::Kek => &mut self.kek,
            Role::Db => &mut self.db,
        };
        std::mem::replace(slot, key)
    }

    /// Replace the key for `role` with a newly generated one, returning
    /// the old one. The new key uses `kind`, or the old key's kind if
    /// `None`. Nothing is written.
    pub fn rotate_role(
        &mut self,
        role: Role,
        kind: Option<BackendKind>,
        ctx: &BackendContext,
    ) -> Result<Box<dyn KeyBackend>> {
        let kind = kind.unwrap_or_else(|| self.get(role).kind());
        let key = backend::generate(kind, role.description(), ctx)?;
        Ok(self.replace(role, key))
    }

    /// Sign a PE executable with the key for `role`, returning the
    /// signed executable. Existing signatures are kept.
    pub fn sign_file(&self, role: Role, binary: &[u8]) -> Result<Vec<u8>> {
        let image = pe::Image::parse(binary)?;
        let content_info = signature::sign_authenticode(self.get(role), &image.digest())?;
        image.with_certificate(&WinCertificate::authenticode(content_info))
    }

    /// Check whether a PE executable carries a valid Authenticode
    /// signature by the key for `role`.
    pub fn verify_file(&self, role: Role, binary: &[u8]) -> Result<bool> {
        let image = pe::Image::parse(binary)?;
        let digest = image.digest();
        let cert = self.get(role).certificate();
        for entry in image.certificates()? {
            if entry.certificate_type != WIN_CERT_TYPE_PKCS_SIGNED_DATA {
                continue;
            }
            let Ok(pkcs7) = Pkcs7::parse(&entry.data) else {
                debug!("skipping unparseable signature");
                continue;
            };
            if pkcs7.verify_authenticode(&digest, cert)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
