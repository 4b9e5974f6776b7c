// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Replacing enrolled keys.
//!
//! Rotation runs forward through these stages and never rolls back:
//!
//! 1. Load the current keys and read the firmware databases.
//! 2. Back up the key directory.
//! 3. Build the new keys in memory (generated or imported).
//! 4. For every role, compute the new database: remove the old
//!    certificate and append the new one. All roles are computed
//!    before anything is written, so a database that does not contain
//!    the expected old certificate stops rotation with nothing changed
//!    except the backup.
//! 5. Replace the key directory with the new keys.
//! 6. Enroll db, KEK, then PK. Each update is signed by the old keys,
//!    which the firmware still trusts.
//! 7. Sign all tracked files again with the new db key.
//!
//! If a later stage fails, the error names the stage and role. The
//! backup can be used to enroll the old keys again by hand.

use crate::backend::{self, BackendKind, KeyBackend};
use crate::config::{KeysConfig, State};
use crate::error::{RotationError, RotationStage};
use crate::hierarchy::{KeyHierarchy, KeyPaths, Role};
use crate::signing::{FileSigner, SignReport};
use crate::sync::{self, SystemState};
use crate::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use siglist::{SignatureDatabase, SignatureType};
use std::time::SystemTime;

/// Source of the new keys.
pub enum NewKeys<'a> {
    /// Generate new keys with these backends.
    Generate(&'a KeysConfig),
    /// Load keys from a directory with the same layout as the key
    /// directory.
    Import {
        dir: &'a Utf8Path,
        keys: &'a KeysConfig,
    },
}

#[derive(Debug)]
pub struct RotationReport {
    pub backup_dir: Utf8PathBuf,
    pub enrolled: Vec<Role>,
    pub signing: SignReport,
}

fn stage<T>(stage: RotationStage, role: Option<Role>, result: Result<T>) -> Result<T> {
    result.map_err(|err| RotationError::new(stage, role, err).into())
}

/// Database for `role` with the old certificate swapped for the new
/// one.
fn updated_database(
    firmware: &SystemState,
    role: Role,
    old: &dyn KeyBackend,
    new: &dyn KeyBackend,
    owner: uguid::Guid,
) -> Result<SignatureDatabase> {
    let mut db = firmware.get(role.into()).clone();
    sync::remove(&mut db, SignatureType::X509, &old.certificate_der()?)?;
    sync::append(&mut db, SignatureType::X509, owner, &new.certificate_der()?)?;
    Ok(db)
}

fn backup(state: &State, backup_dir: Option<&Utf8Path>) -> Result<Utf8PathBuf> {
    let dir = match backup_dir {
        Some(dir) => dir.to_owned(),
        None => state.config.backup_dir(SystemTime::now()),
    };
    if state.fs.exists(&dir)? {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("backup directory {dir} already exists"),
        )));
    }
    state.fs.copy_dir_all(state.config.keydir(), &dir)?;
    info!("backed up {} to {dir}", state.config.keydir());
    Ok(dir)
}

fn load_new_keys(state: &State, new: &NewKeys) -> Result<KeyHierarchy> {
    match new {
        NewKeys::Generate(keys) => KeyHierarchy::create_all(keys, &state.backends),
        NewKeys::Import { dir, keys } => {
            KeyHierarchy::load_all(&state.fs, dir, keys, &state.backends)
        }
    }
}

fn resign(state: &State, keys: &KeyHierarchy) -> Result<SignReport> {
    let mut signer = FileSigner::new(&state.fs, keys, state.config.files_db_path())?;
    signer.resign_all_tracked().into_result()
}

/// Replace all three keys.
pub fn rotate_keys(
    state: &mut State,
    new: NewKeys,
    backup_dir: Option<&Utf8Path>,
) -> Result<RotationReport> {
    use RotationStage::*;

    let old = stage(Collect, None, state.load_hierarchy())?;
    let firmware = stage(ReadFirmware, None, SystemState::read(state.vars.as_ref()))?;
    let owner = stage(Collect, None, state.owner_guid())?;
    let backup_dir = stage(Backup, None, backup(state, backup_dir))?;

    let new = stage(Install, None, load_new_keys(state, &new))?;

    let mut updates = Vec::new();
    for role in [Role::Db, Role::Kek, Role::Pk] {
        let db = updated_database(&firmware, role, old.get(role), new.get(role), owner);
        updates.push((role, stage(UpdateDatabase, Some(role), db)?));
    }

    let keydir = state.config.keydir().to_owned();
    stage(ClearKeys, None, state.fs.remove_dir_all(&keydir))?;
    stage(Persist, None, new.save_all(&state.fs, &keydir))?;
    let mut config_keys = state.config.keys().clone();
    for role in Role::ALL {
        config_keys.set_backend(role, new.get(role).kind());
    }
    if &config_keys != state.config.keys() {
        warn!("the new keys use different backends; update the config to match");
        state.config.set_keys(config_keys);
    }

    let mut enrolled = Vec::new();
    for (role, db) in &updates {
        let result = sync::enroll(state.vars.as_mut(), (*role).into(), db, &old);
        stage(Enroll, Some(*role), result)?;
        enrolled.push(*role);
    }

    let signing = stage(Resign, None, resign(state, &new))?;
    info!("rotated all keys; old keys are in {backup_dir}");
    Ok(RotationReport {
        backup_dir,
        enrolled,
        signing,
    })
}

/// Replace the key for one role with `new`.
pub fn rotate_role(
    state: &mut State,
    role: Role,
    new: Box<dyn KeyBackend>,
    backup_dir: Option<&Utf8Path>,
) -> Result<RotationReport> {
    use RotationStage::*;

    let mut keys = stage(Collect, None, state.load_hierarchy())?;
    let db = stage(
        ReadFirmware,
        Some(role),
        sync::read_database(state.vars.as_ref(), role.into()),
    )?;
    let owner = stage(Collect, None, state.owner_guid())?;
    let backup_dir = stage(Backup, None, backup(state, backup_dir))?;

    let mut firmware = SystemState::default();
    *firmware.get_mut(role.into()) = db;
    let db = stage(
        UpdateDatabase,
        Some(role),
        updated_database(&firmware, role, keys.get(role), new.as_ref(), owner),
    )?;

    // The old key signs the update, so enroll before replacing it.
    stage(
        Enroll,
        Some(role),
        sync::enroll(state.vars.as_mut(), role.into(), &db, &keys),
    )?;

    let new_kind = new.kind();
    keys.replace(role, new);
    let keydir = state.config.keydir().to_owned();
    stage(
        Persist,
        Some(role),
        keys.save_role(&state.fs, &keydir, role),
    )?;
    if new_kind != state.config.keys().backend(role) {
        warn!(
            "the new {} uses the {new_kind} backend; update the config to match",
            role.description()
        );
        let mut config_keys = state.config.keys().clone();
        config_keys.set_backend(role, new_kind);
        state.config.set_keys(config_keys);
    }

    let signing = if role == Role::Db {
        stage(Resign, None, resign(state, &keys))?
    } else {
        SignReport::default()
    };
    info!(
        "rotated the {}; old keys are in {backup_dir}",
        role.description()
    );
    Ok(RotationReport {
        backup_dir,
        enrolled: vec![role],
        signing,
    })
}

/// Replace the key for one role with the given key files.
pub fn rotate_key(
    state: &mut State,
    role: Role,
    kind: BackendKind,
    private: &[u8],
    certificate: &[u8],
    backup_dir: Option<&Utf8Path>,
) -> Result<RotationReport> {
    let new = stage(
        RotationStage::Install,
        Some(role),
        backend::load(kind, private, certificate, &state.backends),
    )?;
    rotate_role(state, role, new, backup_dir)
}

/// Read the key files for `role` from an import directory.
pub fn read_key_files(state: &State, dir: &Utf8Path, role: Role) -> Result<(Vec<u8>, Vec<u8>)> {
    let paths = KeyPaths::new(dir, role);
    Ok((
        state.fs.read(&paths.private_key())?,
        state.fs.read(&paths.certificate())?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efivars::SecureBootVariable;
    use crate::testing::{minimal_pe, test_backend_context, TestEnv, TEST_OWNER};
    use anyhow::Result;

    fn certs(state: &State, var: SecureBootVariable) -> Result<SignatureDatabase> {
        Ok(sync::read_database(state.vars.as_ref(), var)?)
    }

    /// Test rotating the db key: firmware gets the new certificate in
    /// place of the old, and tracked files are signed with the new
    /// key.
    #[test]
    fn test_rotate_db() -> Result<()> {
        let env = TestEnv::enrolled()?;
        let mut state = env.state;
        let old = state.load_hierarchy()?;

        let source = env.root.join("app.efi");
        state.fs.write_atomic(&source, &minimal_pe(), 0o644)?;
        let output = env.root.join("app.signed.efi");
        {
            let mut signer = FileSigner::new(&state.fs, &old, state.config.files_db_path())?;
            signer.sign_and_maybe_track(&source, Some(&output), true)?;
        }

        let new = backend::generate(BackendKind::File, "Database Key", &test_backend_context())?;
        let new_cert = new.certificate_der()?;
        let report = rotate_role(&mut state, Role::Db, new, None)?;
        assert_eq!(report.enrolled, [Role::Db]);
        assert_eq!(report.signing.signed, [source.clone()]);

        let db = certs(&state, SecureBootVariable::Db)?;
        assert!(db.contains(SignatureType::X509, &new_cert));
        assert!(!db.contains(SignatureType::X509, &old.get(Role::Db).certificate_der()?));

        let keys = state.load_hierarchy()?;
        assert_eq!(keys.get(Role::Db).certificate_der()?, new_cert);
        assert_eq!(
            keys.get(Role::Pk).certificate(),
            old.get(Role::Pk).certificate()
        );
        assert!(keys.verify_file(Role::Db, &state.fs.read(&output)?)?);

        // The old keys were backed up.
        let backup_keys = KeyHierarchy::load_all(
            &state.fs,
            &report.backup_dir,
            state.config.keys(),
            &state.backends,
        )?;
        assert_eq!(
            backup_keys.get(Role::Db).certificate(),
            old.get(Role::Db).certificate()
        );
        Ok(())
    }

    /// Test rotating all keys. Every update is accepted by firmware
    /// that checks signers.
    #[test]
    fn test_rotate_all() -> Result<()> {
        let env = TestEnv::enrolled()?;
        let mut state = env.state;
        let old = state.load_hierarchy()?;
        let keys = state.config.keys().clone();

        let report = rotate_keys(&mut state, NewKeys::Generate(&keys), None)?;
        assert_eq!(report.enrolled, [Role::Db, Role::Kek, Role::Pk]);

        let new = state.load_hierarchy()?;
        for role in Role::ALL {
            let db = certs(&state, role.into())?;
            assert_eq!(db.len(), 1);
            assert!(db.contains(SignatureType::X509, &new.get(role).certificate_der()?));
            assert_ne!(new.get(role).certificate(), old.get(role).certificate());
        }

        // The new keys control the firmware now.
        let db = certs(&state, SecureBootVariable::Db)?;
        sync::enroll(state.vars.as_mut(), SecureBootVariable::Db, &db, &new)?;
        assert!(matches!(
            sync::enroll(state.vars.as_mut(), SecureBootVariable::Db, &db, &old),
            Err(Error::UnauthorizedUpdate(_))
        ));
        Ok(())
    }

    /// Test rotating all keys onto different backends. The saved keys
    /// load with the new backends afterwards.
    #[test]
    fn test_rotate_all_new_backends() -> Result<()> {
        let env = TestEnv::enrolled()?;
        let mut state = env.state;
        let mut keys = state.config.keys().clone();
        keys.set_backend(Role::Db, BackendKind::Tpm);

        rotate_keys(&mut state, NewKeys::Generate(&keys), None)?;
        assert_eq!(state.config.keys(), &keys);
        let new = state.load_hierarchy()?;
        assert_eq!(new.get(Role::Db).kind(), BackendKind::Tpm);
        assert_eq!(new.get(Role::Kek).kind(), BackendKind::File);
        let db = certs(&state, SecureBootVariable::Db)?;
        assert!(db.contains(SignatureType::X509, &new.get(Role::Db).certificate_der()?));
        Ok(())
    }

    /// Test that a firmware database missing the old certificate stops
    /// rotation before any key or firmware change.
    #[test]
    fn test_rotate_missing_old_cert() -> Result<()> {
        let env = TestEnv::enrolled()?;
        let mut state = env.state;
        let old = state.load_hierarchy()?;

        // Remove the KEK certificate from the firmware's KEK database.
        let mut kek = certs(&state, SecureBootVariable::Kek)?;
        kek.remove(SignatureType::X509, &old.get(Role::Kek).certificate_der()?)?;
        kek.append(SignatureType::Sha256, TEST_OWNER, &[1; 32])?;
        sync::enroll(state.vars.as_mut(), SecureBootVariable::Kek, &kek, &old)?;
        let before = SystemState::read(state.vars.as_ref())?;

        let keys = state.config.keys().clone();
        let err = rotate_keys(&mut state, NewKeys::Generate(&keys), None)
            .err()
            .unwrap();
        let err = match err {
            Error::Rotation(err) => err,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(err.stage, RotationStage::UpdateDatabase);
        assert_eq!(err.role, Some(Role::Kek));

        // Nothing changed.
        assert_eq!(SystemState::read(state.vars.as_ref())?, before);
        let keys = state.load_hierarchy()?;
        for role in Role::ALL {
            assert_eq!(keys.get(role).certificate(), old.get(role).certificate());
        }
        Ok(())
    }

    /// Test rotating from imported key files.
    #[test]
    fn test_rotate_import() -> Result<()> {
        let env = TestEnv::enrolled()?;
        let mut state = env.state;
        let keys = state.config.keys().clone();

        let staged = KeyHierarchy::create_all(&keys, &state.backends)?;
        let import_dir = env.root.join("import");
        staged.save_all(&state.fs, &import_dir)?;

        let backup_dir = env.root.join("backup");
        let report = rotate_keys(
            &mut state,
            NewKeys::Import {
                dir: &import_dir,
                keys: &keys,
            },
            Some(&backup_dir),
        )?;
        assert_eq!(report.backup_dir, backup_dir);

        let new = state.load_hierarchy()?;
        for role in Role::ALL {
            assert_eq!(new.get(role).certificate(), staged.get(role).certificate());
        }
        Ok(())
    }

    /// Test replacing one key from key files.
    #[test]
    fn test_rotate_key_files() -> Result<()> {
        let env = TestEnv::enrolled()?;
        let mut state = env.state;

        let staged = KeyHierarchy::create_all(state.config.keys(), &state.backends)?;
        let import_dir = env.root.join("import");
        staged.save_all(&state.fs, &import_dir)?;
        let (private, cert) = read_key_files(&state, &import_dir, Role::Kek)?;

        rotate_key(
            &mut state,
            Role::Kek,
            BackendKind::File,
            &private,
            &cert,
            None,
        )?;
        let kek = certs(&state, SecureBootVariable::Kek)?;
        assert!(kek.contains(
            SignatureType::X509,
            &staged.get(Role::Kek).certificate_der()?,
        ));

        // Key files of the wrong kind are rejected before anything
        // changes.
        let (private, cert) = read_key_files(&state, &import_dir, Role::Pk)?;
        let err = rotate_key(
            &mut state,
            Role::Pk,
            BackendKind::Tpm,
            &private,
            &cert,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            Error::Rotation(RotationError {
                stage: RotationStage::Install,
                ..
            })
        ));
        Ok(())
    }

    /// Test that an existing backup directory stops rotation.
    #[test]
    fn test_backup_exists() -> Result<()> {
        let env = TestEnv::enrolled()?;
        let mut state = env.state;
        let backup_dir = env.root.join("backup");
        state.fs.create_dir_all(&backup_dir)?;

        let keys = state.config.keys().clone();
        let err = rotate_keys(&mut state, NewKeys::Generate(&keys), Some(&backup_dir))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Rotation(RotationError {
                stage: RotationStage::Backup,
                ..
            })
        ));
        Ok(())
    }
}
