// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! TPM boot event log analysis.
//!
//! The firmware records every measurement it makes into the TPM in an
//! event log that Linux exposes in securityfs. This crate parses that
//! log and looks for events that matter for Secure Boot policy.
//!
//! The main check is for Option ROMs: firmware drivers loaded from
//! add-in devices (typically GPUs and network cards) before the OS
//! loader runs. These show up as `EV_EFI_BOOT_SERVICES_DRIVER`
//! events. If such drivers ran, replacing the Microsoft certificates
//! in db with only custom keys will stop the machine from booting
//! those drivers, and a hostile device can use them to undermine
//! Secure Boot regardless of the keys enrolled.

mod event;
mod parse;

use camino::Utf8Path;
use fs_err as fs;
use log::{info, warn};
use siglist::{SignatureDatabase, SignatureType};
use std::io;
use uguid::{guid, Guid};

pub use event::{Digest, Event, EventType, HashAlgorithm};
pub use parse::parse;

/// Where Linux exposes the firmware event log.
pub const DEFAULT_EVENT_LOG_PATH: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";

const SHA256_DIGEST_SIZE: usize = 32;

/// Owner GUID for hash entries derived from the event log.
pub const EVENT_LOG_DIGEST_OWNER: Guid = guid!("d6c2b1a4-3f0e-4d9b-8f47-2b5e0e1c9a73");

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The event log file does not exist. This usually means there is
    /// no TPM, or securityfs is not mounted.
    #[error("no event log found at {0}")]
    NoEventLog(String),

    /// Failed to read the event log.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The log ended in the middle of an event.
    #[error("event log is truncated at offset {offset}")]
    Truncated {
        /// Byte offset where more data was expected.
        offset: usize,
    },

    /// The `TCG_EfiSpecIDEvent` header is malformed.
    #[error("invalid spec ID event")]
    InvalidSpecIdEvent,

    /// An event has a digest with an algorithm the header did not
    /// declare, so its size is unknown.
    #[error("unknown digest algorithm: {0:#06x}")]
    UnknownAlgorithm(u16),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Option ROMs were executed during boot.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("{num_drivers} option ROM driver(s) were loaded during boot")]
pub struct PolicyViolation {
    /// Number of `EV_EFI_BOOT_SERVICES_DRIVER` events in the log.
    pub num_drivers: usize,
}

/// Read and parse the event log at `path`.
///
/// A missing or empty file is reported as [`Error::NoEventLog`] rather
/// than an I/O error, so that callers can distinguish "no TPM" from a
/// broken log.
pub fn read_event_log(path: &Utf8Path) -> Result<Vec<Event>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NoEventLog(path.to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    if data.is_empty() {
        return Err(Error::NoEventLog(path.to_string()));
    }
    parse(&data)
}

fn boot_services_drivers(events: &[Event]) -> impl Iterator<Item = &Event> {
    events
        .iter()
        .filter(|event| event.event_type == EventType::EFI_BOOT_SERVICES_DRIVER)
}

/// Whether any Option ROM was executed before the OS loader.
#[must_use]
pub fn detect_oprom(events: &[Event]) -> bool {
    boot_services_drivers(events).next().is_some()
}

/// Turn a positive [`detect_oprom`] into a policy violation.
pub fn check_oprom(events: &[Event]) -> std::result::Result<(), PolicyViolation> {
    let num_drivers = boot_services_drivers(events).count();
    if num_drivers == 0 {
        Ok(())
    } else {
        info!("event log contains {num_drivers} boot services driver event(s)");
        Err(PolicyViolation { num_drivers })
    }
}

/// Collect the SHA-256 digests of all Option ROM drivers as hash entries
/// owned by [`EVENT_LOG_DIGEST_OWNER`].
///
/// This allows enrolling exactly the drivers that ran on this machine
/// into db instead of a vendor CA. Events without a SHA-256 digest
/// (legacy SHA-1 logs), or whose log header declared the wrong SHA-256
/// size, are skipped.
#[must_use]
pub fn checksum_digest_list(events: &[Event]) -> SignatureDatabase {
    let mut db = SignatureDatabase::new();
    for event in boot_services_drivers(events) {
        let Some(digest) = event.digest(HashAlgorithm::SHA256) else {
            continue;
        };
        if digest.len() != SHA256_DIGEST_SIZE {
            warn!("skipping {} byte SHA-256 driver digest", digest.len());
            continue;
        }
        if let Err(err) = db.append(SignatureType::Sha256, EVENT_LOG_DIGEST_OWNER, digest) {
            warn!("skipping driver digest: {err}");
        }
    }
    db
}
