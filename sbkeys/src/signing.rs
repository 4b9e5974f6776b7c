// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Signing EFI executables with the db key, and keeping track of which
//! files to sign again when they change.

use crate::fs::Fs;
use crate::hierarchy::{KeyHierarchy, Role};
use crate::pe;
use crate::tracking::{checksum, SigningEntry, TrackingTable};
use crate::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignOutcome {
    Signed,
    /// The output already has a valid db signature over the current
    /// source content. Nothing was written.
    AlreadySigned,
}

/// Result of signing every tracked file.
#[derive(Debug, Default)]
pub struct SignReport {
    pub signed: Vec<Utf8PathBuf>,
    pub unchanged: Vec<Utf8PathBuf>,
    pub failed: Vec<(Utf8PathBuf, Error)>,
}

impl SignReport {
    /// Turn any failures into an [`Error::Batch`].
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::Batch(self.failed))
        }
    }
}

pub struct FileSigner<'a> {
    fs: &'a Fs,
    keys: &'a KeyHierarchy,
    table: TrackingTable,
}

impl<'a> FileSigner<'a> {
    pub fn new(fs: &'a Fs, keys: &'a KeyHierarchy, table_path: &Utf8Path) -> Result<Self> {
        Ok(Self {
            fs,
            keys,
            table: TrackingTable::load(fs, table_path)?,
        })
    }

    /// Whether `output` carries a valid db signature and is a signed
    /// copy of `source` as it is now.
    fn is_signed_copy(&self, source: &[u8], output: &Utf8Path) -> Result<bool> {
        let Some(output) = self.fs.read_optional(output)? else {
            return Ok(false);
        };
        if !self.keys.verify_file(Role::Db, &output)? {
            return Ok(false);
        }
        Ok(pe::Image::parse(source)?.digest() == pe::Image::parse(&output)?.digest())
    }

    /// Sign `source` and write the result to `output`, keeping the
    /// source's file mode.
    fn sign_to(&self, source: &Utf8Path, output: &Utf8Path) -> Result<()> {
        let data = self.fs.read(source)?;
        let signed = self.keys.sign_file(Role::Db, &data)?;
        let mode = self.fs.mode(source)?;
        self.fs.write_atomic(output, &signed, mode)?;
        info!("signed {source} -> {output}");
        Ok(())
    }

    /// Record `source` in the tracking table. The checksum is taken
    /// after signing so that a file signed in place is not seen as
    /// changed.
    fn track(&mut self, source: &Utf8Path, output: &Utf8Path) -> Result<()> {
        let data = self.fs.read(source)?;
        self.table.upsert(SigningEntry {
            file: source.to_owned(),
            output_file: output.to_owned(),
            checksum: checksum(&data),
        });
        self.table.save(self.fs)
    }

    /// Sign `source` into `output` (or in place) unless the output is
    /// already signed. If `track` is set, the file is added to the
    /// tracking table.
    pub fn sign_and_maybe_track(
        &mut self,
        source: &Utf8Path,
        output: Option<&Utf8Path>,
        track: bool,
    ) -> Result<SignOutcome> {
        let output = output.unwrap_or(source);
        if !self.fs.exists(source)? {
            return Err(Error::MissingSource(source.to_owned()));
        }

        let data = self.fs.read(source)?;
        let outcome = if self.is_signed_copy(&data, output)? {
            info!("{output} is already signed");
            SignOutcome::AlreadySigned
        } else {
            self.sign_to(source, output)?;
            SignOutcome::Signed
        };

        if track {
            self.track(source, output)?;
        }
        Ok(outcome)
    }

    fn sign_tracked(&mut self, force: bool) -> SignReport {
        let entries: Vec<SigningEntry> = self.table.entries().cloned().collect();
        let mut report = SignReport::default();

        for entry in entries {
            let result = self.sign_entry(&entry, force);
            match result {
                Ok(true) => report.signed.push(entry.file),
                Ok(false) => report.unchanged.push(entry.file),
                Err(err) => {
                    warn!("failed to sign {}: {err}", entry.file);
                    report.failed.push((entry.file, err));
                }
            }
        }
        report
    }

    /// Returns whether the file was signed.
    fn sign_entry(&mut self, entry: &SigningEntry, force: bool) -> Result<bool> {
        let source = entry.file.as_path();
        let output = entry.output_file.as_path();
        let data = self
            .fs
            .read_optional(source)?
            .ok_or_else(|| Error::MissingSource(source.to_owned()))?;

        if !force && checksum(&data) == entry.checksum && self.fs.exists(output)? {
            return Ok(false);
        }
        self.sign_to(source, output)?;
        self.track(source, output)?;
        Ok(true)
    }

    /// Sign every tracked file whose source changed since it was last
    /// signed, or whose output is missing.
    ///
    /// A failure for one file does not stop the others; failures are
    /// collected in the report.
    pub fn sign_all_tracked(&mut self) -> SignReport {
        self.sign_tracked(false)
    }

    /// Sign every tracked file, for example after the db key changed.
    pub fn resign_all_tracked(&mut self) -> SignReport {
        self.sign_tracked(true)
    }

    /// Stop tracking `source`.
    pub fn remove_tracked(&mut self, source: &Utf8Path) -> Result<SigningEntry> {
        let entry = self.table.remove(source)?;
        self.table.save(self.fs)?;
        Ok(entry)
    }

    /// Tracked files in source path order.
    pub fn list_tracked(&self) -> Vec<SigningEntry> {
        self.table.entries().cloned().collect()
    }
}
