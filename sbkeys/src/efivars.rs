// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access to the firmware's Secure Boot variables.

use crate::fs::Fs;
use crate::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use core::fmt::{self, Display, Formatter};
use log::{debug, info};
use std::io::ErrorKind;
use uguid::{guid, Guid};

/// Default mount point of efivarfs.
pub const EFIVARFS_PATH: &str = "/sys/firmware/efi/efivars";

/// `EFI_GLOBAL_VARIABLE`: vendor of PK, KEK, SetupMode, and SecureBoot.
pub const GLOBAL_VARIABLE_GUID: Guid = guid!("8be4df61-93ca-11d2-aa0d-00e098032b8c");

/// `EFI_IMAGE_SECURITY_DATABASE_GUID`: vendor of db and dbx.
pub const IMAGE_SECURITY_DATABASE_GUID: Guid = guid!("d719b2cb-3d3a-4596-a3bc-dad00e67656f");

pub const VARIABLE_NON_VOLATILE: u32 = 0x01;
pub const VARIABLE_BOOTSERVICE_ACCESS: u32 = 0x02;
pub const VARIABLE_RUNTIME_ACCESS: u32 = 0x04;
pub const VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS: u32 = 0x20;

/// Attributes of every Secure Boot database variable.
pub const SECURE_BOOT_ATTRIBUTES: u32 = VARIABLE_NON_VOLATILE
    | VARIABLE_BOOTSERVICE_ACCESS
    | VARIABLE_RUNTIME_ACCESS
    | VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS;

/// Secure Boot signature database variables.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SecureBootVariable {
    Pk,
    Kek,
    Db,
    Dbx,
}

impl SecureBootVariable {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pk => "PK",
            Self::Kek => "KEK",
            Self::Db => "db",
            Self::Dbx => "dbx",
        }
    }

    pub fn vendor(self) -> Guid {
        match self {
            Self::Pk | Self::Kek => GLOBAL_VARIABLE_GUID,
            Self::Db | Self::Dbx => IMAGE_SECURITY_DATABASE_GUID,
        }
    }
}

impl Display for SecureBootVariable {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interface for reading and writing UEFI variables.
///
/// The implementation used at runtime is normally [`Efivarfs`]; unit
/// tests can use `MockEfiVariables` or the simulated firmware instead.
#[cfg_attr(test, mockall::automock)]
pub trait EfiVariables {
    /// Read a variable's data (without attributes). Returns `None` if
    /// the variable does not exist.
    fn read(&self, name: &str, vendor: Guid) -> Result<Option<Vec<u8>>>;

    /// Write a variable. For authenticated variables `data` is the
    /// signed payload.
    fn write(&mut self, name: &str, vendor: Guid, attributes: u32, data: &[u8]) -> Result<()>;
}

/// Variables accessed through the Linux efivarfs filesystem.
///
/// Each variable is a file named `<name>-<vendor guid>` whose contents
/// are the 32-bit attributes followed by the data.
pub struct Efivarfs {
    fs: Fs,
    root: Utf8PathBuf,
}

impl Efivarfs {
    pub fn new(fs: Fs, root: &Utf8Path) -> Self {
        Self {
            fs,
            root: root.to_owned(),
        }
    }

    fn path(&self, name: &str, vendor: Guid) -> Utf8PathBuf {
        self.root.join(format!("{name}-{vendor}"))
    }
}

impl EfiVariables for Efivarfs {
    fn read(&self, name: &str, vendor: Guid) -> Result<Option<Vec<u8>>> {
        let Some(contents) = self.fs.read_optional(&self.path(name, vendor))? else {
            return Ok(None);
        };
        if contents.len() < 4 {
            return Err(Error::Firmware {
                name: name.to_owned(),
                reason: "variable is missing its attributes".into(),
            });
        }
        Ok(Some(contents[4..].to_vec()))
    }

    fn write(&mut self, name: &str, vendor: Guid, attributes: u32, data: &[u8]) -> Result<()> {
        let path = self.path(name, vendor);
        // The attributes and data must go to the kernel in one write.
        let mut contents = attributes.to_le_bytes().to_vec();
        contents.extend(data);
        debug!("writing {} bytes to {path}", contents.len());

        match self.fs.clear_immutable(&path) {
            Ok(true) => debug!("{path} was immutable"),
            Ok(false) => {}
            Err(Error::Io(err)) => {
                return Err(Error::Firmware {
                    name: name.to_owned(),
                    reason: format!("failed to clear the immutable flag: {err}"),
                })
            }
            Err(err) => return Err(err),
        }

        match self.fs.write_in_place(&path, &contents) {
            Ok(()) => Ok(()),
            Err(Error::Io(err)) if err.kind() == ErrorKind::PermissionDenied => {
                Err(Error::UnauthorizedUpdate(name.to_owned()))
            }
            Err(Error::Io(err)) => Err(Error::Firmware {
                name: name.to_owned(),
                reason: err.to_string(),
            }),
            Err(err) => Err(err),
        }
    }
}

/// Secure Boot state reported by the firmware.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SecureBootStatus {
    /// No PK is enrolled; any variable can be written.
    pub setup_mode: bool,
    /// The firmware is enforcing signatures.
    pub secure_boot: bool,
}

fn read_flag(vars: &dyn EfiVariables, name: &str) -> Result<bool> {
    let data = vars.read(name, GLOBAL_VARIABLE_GUID)?;
    Ok(matches!(data.as_deref(), Some([1, ..])))
}

impl SecureBootStatus {
    pub fn read(vars: &dyn EfiVariables) -> Result<Self> {
        let status = Self {
            setup_mode: read_flag(vars, "SetupMode")?,
            secure_boot: read_flag(vars, "SecureBoot")?,
        };
        info!(
            "setup mode: {}, secure boot: {}",
            status.setup_mode, status.secure_boot
        );
        Ok(status)
    }
}
