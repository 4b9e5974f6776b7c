// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! UEFI signature databases.
//!
//! The `PK`, `KEK`, `db`, and `dbx` UEFI variables all share the same
//! format: a packed sequence of `EFI_SIGNATURE_LIST` structures. Each
//! list has a type GUID (X.509 certificate, SHA-256 hash, etc), a
//! fixed per-entry size, and a sequence of entries. Each entry starts
//! with the GUID of the entry's owner, followed by the payload (the
//! DER certificate or the hash).
//!
//! This crate models a whole variable as a [`SignatureDatabase`]. Entries
//! are identified by the `(type, owner, payload)` tuple:
//!
//! * [`SignatureDatabase::append`] is a no-op if the exact tuple is
//!   already present.
//! * [`SignatureDatabase::remove`] fails with [`Error::NotFound`] if no
//!   entry matches. Key rotation relies on this to detect an in-memory
//!   database that has diverged from what the firmware holds.
//!
//! See section 32.4.1 "Signature Database" of the UEFI Specification.

#![warn(missing_docs)]
// Turn off std, except when running tests.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod database;
mod list;
mod result;

use uguid::{guid, Guid};

pub use database::SignatureDatabase;
pub use list::{SignatureEntry, SignatureList};
pub use result::{Error, Result};

/// Size in bytes of an encoded GUID.
const GUID_SIZE: usize = 16;

/// Type of the entries in a [`SignatureList`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignatureType {
    /// DER-encoded X.509 certificate (`EFI_CERT_X509_GUID`).
    X509,

    /// SHA-256 hash of an image (`EFI_CERT_SHA256_GUID`).
    Sha256,

    /// Any other signature type. These are preserved unmodified so that
    /// rewriting a variable never drops entries this crate does not
    /// understand.
    Other(Guid),
}

impl SignatureType {
    /// `EFI_CERT_X509_GUID`.
    pub const X509_GUID: Guid = guid!("a5c059a1-94e4-4aa7-87b5-ab155c2bf072");

    /// `EFI_CERT_SHA256_GUID`.
    pub const SHA256_GUID: Guid = guid!("c1c41626-504c-4092-aca9-41f936934328");

    /// Get the type corresponding to a signature list type GUID.
    #[must_use]
    pub fn from_guid(guid: Guid) -> Self {
        if guid == Self::X509_GUID {
            Self::X509
        } else if guid == Self::SHA256_GUID {
            Self::Sha256
        } else {
            Self::Other(guid)
        }
    }

    /// Get the signature list type GUID.
    #[must_use]
    pub fn guid(self) -> Guid {
        match self {
            Self::X509 => Self::X509_GUID,
            Self::Sha256 => Self::SHA256_GUID,
            Self::Other(guid) => guid,
        }
    }

    /// Fixed payload size for this type, if it has one.
    ///
    /// Certificates vary in size, so each certificate usually gets a
    /// list of its own.
    #[must_use]
    pub fn fixed_payload_size(self) -> Option<usize> {
        match self {
            Self::Sha256 => Some(32),
            Self::X509 | Self::Other(_) => None,
        }
    }
}
