// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Table of files that are signed automatically.
//!
//! The table is a JSON object keyed by source path:
//!
//! ```json
//! {
//!   "/boot/vmlinuz.efi": {
//!     "file": "/boot/vmlinuz.efi",
//!     "output_file": "/boot/vmlinuz.efi",
//!     "checksum": "9f86d08..."
//!   }
//! }
//! ```
//!
//! The checksum is the SHA-256 of the source right after it was last
//! signed. Unless the file is signed in place, that is the unsigned
//! content.

use crate::fs::{Fs, PUBLIC_FILE_MODE};
use crate::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SigningEntry {
    pub file: Utf8PathBuf,
    pub output_file: Utf8PathBuf,
    pub checksum: String,
}

/// Lowercase hex SHA-256.
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub struct TrackingTable {
    path: Utf8PathBuf,
    entries: BTreeMap<Utf8PathBuf, SigningEntry>,
}

impl TrackingTable {
    /// Load the table from `path`. A missing file is an empty table.
    pub fn load(fs: &Fs, path: &Utf8Path) -> Result<Self> {
        let entries = match fs.read_optional(path)? {
            Some(data) => serde_json::from_slice(&data)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            path: path.to_owned(),
            entries,
        })
    }

    pub fn save(&self, fs: &Fs) -> Result<()> {
        let mut json = serde_json::to_string_pretty(&self.entries)?;
        json.push('\n');
        fs.write_atomic(&self.path, json.as_bytes(), PUBLIC_FILE_MODE)
    }

    pub fn get(&self, source: &Utf8Path) -> Option<&SigningEntry> {
        self.entries.get(source)
    }

    pub fn upsert(&mut self, entry: SigningEntry) {
        self.entries.insert(entry.file.clone(), entry);
    }

    pub fn remove(&mut self, source: &Utf8Path) -> Result<SigningEntry> {
        self.entries
            .remove(source)
            .ok_or_else(|| Error::NotTracked(source.to_owned()))
    }

    /// Entries in source path order.
    pub fn entries(&self) -> impl Iterator<Item = &SigningEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
