// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Option ROM checks run before enrolling keys.
//!
//! If the firmware loaded Option ROMs during boot, enrolling only
//! custom keys in db may leave the machine unable to initialize those
//! devices. The caller can refuse, or allow the specific drivers that
//! ran by enrolling their digests with [`append_digests`].

use crate::{Error, Result};
use camino::Utf8Path;
use eventlog::{Event, PolicyViolation};
use log::{info, warn};
use siglist::SignatureDatabase;

#[derive(Debug, Eq, PartialEq)]
pub enum OpromCheck {
    /// There is no event log, so nothing is known about Option ROMs.
    NoEventLog,
    Clean,
    Violation(PolicyViolation),
}

/// Read the event log at `path` and check it for Option ROM drivers.
pub fn check(path: &Utf8Path) -> Result<(OpromCheck, Vec<Event>)> {
    let events = match eventlog::read_event_log(path) {
        Ok(events) => events,
        Err(eventlog::Error::NoEventLog(_)) => {
            warn!("no TPM event log at {path}, unable to check for option ROMs");
            return Ok((OpromCheck::NoEventLog, Vec::new()));
        }
        Err(err) => return Err(Error::EventLog(err)),
    };
    let result = match eventlog::check_oprom(&events) {
        Ok(()) => OpromCheck::Clean,
        Err(violation) => {
            warn!("{violation}");
            OpromCheck::Violation(violation)
        }
    };
    Ok((result, events))
}

/// Add the digest of every Option ROM driver in `events` to `db`.
/// Returns the number of entries added.
pub fn append_digests(db: &mut SignatureDatabase, events: &[Event]) -> Result<usize> {
    let digests = eventlog::checksum_digest_list(events);
    let mut added = 0;
    for (signature_type, entry) in digests.entries() {
        if db.append(signature_type, entry.owner, &entry.data)? {
            added += 1;
        }
    }
    info!("added {added} option ROM digest(s)");
    Ok(added)
}
