// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Owner GUID recorded in every signature list entry this tool adds.
//!
//! The GUID is generated once and persisted so that entries added by
//! later runs carry the same owner.

use crate::fs::{Fs, PUBLIC_FILE_MODE};
use crate::{Error, Result};
use camino::Utf8Path;
use log::info;
use rand::RngCore;
use uguid::Guid;

/// Generate a random (version 4) GUID.
pub fn random() -> Guid {
    let mut bytes = [0; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Version 4, variant 1. The version lives in the high nibble of
    // time_hi_and_version, which is stored little endian.
    bytes[7] = (bytes[7] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Guid::from_bytes(bytes)
}

/// Read the owner GUID from `path`, creating it if the file does not
/// exist yet.
pub fn read_or_create(fs: &Fs, path: &Utf8Path) -> Result<Guid> {
    if let Some(data) = fs.read_optional(path)? {
        let text = String::from_utf8(data).map_err(|_| Error::InvalidGuid(path.to_owned()))?;
        return text
            .trim()
            .parse::<Guid>()
            .map_err(|_| Error::InvalidGuid(path.to_owned()));
    }

    let guid = random();
    fs.write_atomic(path, format!("{guid}\n").as_bytes(), PUBLIC_FILE_MODE)?;
    info!("created owner GUID {guid} in {path}");
    Ok(guid)
}
