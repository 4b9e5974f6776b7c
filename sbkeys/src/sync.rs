// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronizing the key hierarchy with the firmware's signature
//! databases.
//!
//! Databases are always read from the firmware first and then edited in
//! memory, so that an update is the current content plus exactly the
//! intended change.

use crate::auth_var;
use crate::certificate;
use crate::efivars::{EfiVariables, SecureBootVariable, SECURE_BOOT_ATTRIBUTES};
use crate::fs::{Fs, PUBLIC_FILE_MODE};
use crate::hierarchy::{KeyHierarchy, Role};
use crate::{Error, Result};
use camino::Utf8Path;
use log::info;
use siglist::{SignatureDatabase, SignatureType};
use std::time::SystemTime;
use uguid::Guid;

impl From<Role> for SecureBootVariable {
    fn from(role: Role) -> Self {
        match role {
            Role::Pk => Self::Pk,
            Role::Kek => Self::Kek,
            Role::Db => Self::Db,
        }
    }
}

/// Role whose key must sign updates to `var`.
///
/// The PK authorizes changes to itself and to the KEK; the KEK
/// authorizes changes to db and dbx.
pub fn signer_role(var: SecureBootVariable) -> Role {
    match var {
        SecureBootVariable::Pk | SecureBootVariable::Kek => Role::Pk,
        SecureBootVariable::Db | SecureBootVariable::Dbx => Role::Kek,
    }
}

/// Signature databases currently enrolled in the firmware.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SystemState {
    pub pk: SignatureDatabase,
    pub kek: SignatureDatabase,
    pub db: SignatureDatabase,
    pub dbx: SignatureDatabase,
}

impl SystemState {
    /// Read all four databases. A missing variable is an empty
    /// database.
    pub fn read(vars: &dyn EfiVariables) -> Result<Self> {
        Ok(Self {
            pk: read_database(vars, SecureBootVariable::Pk)?,
            kek: read_database(vars, SecureBootVariable::Kek)?,
            db: read_database(vars, SecureBootVariable::Db)?,
            dbx: read_database(vars, SecureBootVariable::Dbx)?,
        })
    }

    pub fn get(&self, var: SecureBootVariable) -> &SignatureDatabase {
        match var {
            SecureBootVariable::Pk => &self.pk,
            SecureBootVariable::Kek => &self.kek,
            SecureBootVariable::Db => &self.db,
            SecureBootVariable::Dbx => &self.dbx,
        }
    }

    pub fn get_mut(&mut self, var: SecureBootVariable) -> &mut SignatureDatabase {
        match var {
            SecureBootVariable::Pk => &mut self.pk,
            SecureBootVariable::Kek => &mut self.kek,
            SecureBootVariable::Db => &mut self.db,
            SecureBootVariable::Dbx => &mut self.dbx,
        }
    }
}

pub fn read_database(
    vars: &dyn EfiVariables,
    var: SecureBootVariable,
) -> Result<SignatureDatabase> {
    match vars.read(var.name(), var.vendor())? {
        Some(data) => Ok(SignatureDatabase::parse(&data)?),
        None => Ok(SignatureDatabase::new()),
    }
}

/// Add an entry unless the exact (type, owner, payload) entry is
/// already present. Returns whether the database changed.
pub fn append(
    db: &mut SignatureDatabase,
    signature_type: SignatureType,
    owner: Guid,
    payload: &[u8],
) -> Result<bool> {
    Ok(db.append(signature_type, owner, payload)?)
}

/// Remove an entry. It is an error for the entry to be missing.
pub fn remove(
    db: &mut SignatureDatabase,
    signature_type: SignatureType,
    payload: &[u8],
) -> Result<()> {
    db.remove(signature_type, payload)?;
    Ok(())
}

/// Write `db` to `var` as an update signed by the appropriate key from
/// `signers`.
pub fn enroll(
    vars: &mut dyn EfiVariables,
    var: SecureBootVariable,
    db: &SignatureDatabase,
    signers: &KeyHierarchy,
) -> Result<()> {
    let signer = signers.get(signer_role(var));
    let payload = auth_var::build(var, &db.to_bytes()?, signer, SystemTime::now())?;
    vars.write(var.name(), var.vendor(), SECURE_BOOT_ATTRIBUTES, &payload)?;
    info!(
        "enrolled {var} with {} entries, signed by the {}",
        db.len(),
        signer.description()
    );
    Ok(())
}

/// Enroll every certificate of `keys` into the firmware.
///
/// The databases are written in the order db, KEK, PK. Writing the PK
/// takes the firmware out of setup mode, after which every further
/// update must be signed, so it goes last.
pub fn enroll_all(vars: &mut dyn EfiVariables, keys: &KeyHierarchy, owner: Guid) -> Result<()> {
    for role in [Role::Db, Role::Kek, Role::Pk] {
        let var = SecureBootVariable::from(role);
        let mut db = read_database(vars, var)?;
        let cert = keys.get(role).certificate_der()?;
        if !append(&mut db, SignatureType::X509, owner, &cert)? {
            info!("{var} already contains the {}", role.description());
        }
        enroll(vars, var, &db, keys)?;
    }
    Ok(())
}

/// Write each enrolled X.509 certificate in PK, KEK and db to
/// `<dir>/<var>/<index>.der`. Returns the number of certificates
/// written.
pub fn export_enrolled(state: &SystemState, fs: &Fs, dir: &Utf8Path) -> Result<usize> {
    let mut count = 0;
    for var in [
        SecureBootVariable::Pk,
        SecureBootVariable::Kek,
        SecureBootVariable::Db,
    ] {
        let certs = state
            .get(var)
            .entries()
            .filter(|(signature_type, _)| *signature_type == SignatureType::X509);
        for (index, (_, entry)) in certs.enumerate() {
            // Make sure this really is a certificate before writing it
            // out with a .der extension.
            if let Err(err) = certificate::from_der(&entry.data) {
                return Err(Error::Firmware {
                    name: var.name().to_owned(),
                    reason: format!("entry {index}: {err}"),
                });
            }
            let path = dir.join(var.name()).join(format!("{index}.der"));
            fs.write_atomic(&path, &entry.data, PUBLIC_FILE_MODE)?;
            count += 1;
        }
    }
    Ok(count)
}
