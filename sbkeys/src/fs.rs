// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Filesystem access used by key storage, tracking, and firmware
//! variables.
//!
//! All file access goes through [`Fs`] so that callers (and tests) can
//! confine the tool to a set of directories.

use crate::{Error, Result};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use fs_err as fs;
use log::debug;
use rustix::fs::IFlags;
use rustix::io::Errno;
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;

/// Mode of private key files.
pub const PRIVATE_FILE_MODE: u32 = 0o400;

/// Mode of certificates and other non-secret files.
pub const PUBLIC_FILE_MODE: u32 = 0o644;

#[derive(Clone, Debug, Default)]
pub struct Fs {
    /// If set, only paths under one of these directories can be
    /// accessed.
    permitted: Option<Vec<Utf8PathBuf>>,
}

impl Fs {
    /// Unrestricted filesystem access.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filesystem access limited to paths under `roots`.
    pub fn restricted(roots: Vec<Utf8PathBuf>) -> Self {
        Self {
            permitted: Some(roots),
        }
    }

    fn check(&self, path: &Utf8Path) -> Result<()> {
        match &self.permitted {
            None => Ok(()),
            Some(roots) => {
                // `starts_with` compares components lexically, so `..`
                // could climb out of a root.
                let escapes = path
                    .components()
                    .any(|component| component == Utf8Component::ParentDir);
                if !escapes && roots.iter().any(|root| path.starts_with(root)) {
                    Ok(())
                } else {
                    Err(Error::PathNotPermitted(path.to_owned()))
                }
            }
        }
    }

    pub fn exists(&self, path: &Utf8Path) -> Result<bool> {
        self.check(path)?;
        Ok(path.exists())
    }

    pub fn read(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        self.check(path)?;
        Ok(fs::read(path)?)
    }

    /// Read a file, returning `None` if it does not exist.
    pub fn read_optional(&self, path: &Utf8Path) -> Result<Option<Vec<u8>>> {
        self.check(path)?;
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read_to_string(&self, path: &Utf8Path) -> Result<String> {
        self.check(path)?;
        Ok(fs::read_to_string(path)?)
    }

    /// Get the permission bits of a file.
    pub fn mode(&self, path: &Utf8Path) -> Result<u32> {
        self.check(path)?;
        Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
    }

    pub fn create_dir_all(&self, path: &Utf8Path) -> Result<()> {
        self.check(path)?;
        Ok(fs::create_dir_all(path)?)
    }

    /// Recursively delete a directory. A missing directory is not an
    /// error.
    pub fn remove_dir_all(&self, path: &Utf8Path) -> Result<()> {
        self.check(path)?;
        match fs::remove_dir_all(path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Write `data` to `path` with the given permission bits.
    ///
    /// The data is written to a temporary file in the same directory
    /// and then renamed over `path`, so readers see either the old
    /// contents or the new contents. Parent directories are created as
    /// needed.
    pub fn write_atomic(&self, path: &Utf8Path, data: &[u8], mode: u32) -> Result<()> {
        self.check(path)?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
        tmp.persist(path).map_err(|err| err.error)?;
        debug!("wrote {path} ({} bytes, mode {mode:o})", data.len());
        Ok(())
    }

    /// Write `data` to an existing file without replacing it.
    ///
    /// This is needed for files such as efivarfs entries, where the
    /// write itself is the operation.
    pub fn write_in_place(&self, path: &Utf8Path, data: &[u8]) -> Result<()> {
        self.check(path)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.write_all(data)?;
        Ok(())
    }

    /// Clear the immutable attribute of a file. efivarfs sets it on
    /// most variables, and writes fail until it is cleared.
    ///
    /// Returns whether the attribute was set. A missing file, or a
    /// filesystem without file attributes, is not an error.
    pub fn clear_immutable(&self, path: &Utf8Path) -> Result<bool> {
        self.check(path)?;
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let flags = match rustix::fs::ioctl_getflags(file.file()) {
            Ok(flags) => flags,
            Err(Errno::NOTTY | Errno::OPNOTSUPP | Errno::INVAL) => return Ok(false),
            Err(err) => return Err(io::Error::from(err).into()),
        };
        if !flags.contains(IFlags::IMMUTABLE) {
            return Ok(false);
        }
        rustix::fs::ioctl_setflags(file.file(), flags.difference(IFlags::IMMUTABLE))
            .map_err(io::Error::from)?;
        debug!("cleared the immutable flag of {path}");
        Ok(true)
    }

    /// Recursively copy the contents of `src` into `dst`, keeping file
    /// permissions.
    pub fn copy_dir_all(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        self.check(src)?;
        self.check(dst)?;
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|path| Error::NonUtf8Path(path.display().to_string()))?;
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = dst.join(name);
            if entry.file_type()?.is_dir() {
                self.copy_dir_all(&path, &target)?;
            } else {
                // `fs::copy` also copies the permission bits.
                fs::copy(&path, &target)?;
            }
        }
        Ok(())
    }
}
