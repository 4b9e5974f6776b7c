// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use core::fmt::{self, Display, Formatter};

/// Signature database errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The data ends in the middle of a signature list.
    Truncated,

    /// The `SignatureListSize` field is too small to hold the list
    /// header, or extends past the end of the data.
    InvalidListSize(u32),

    /// The `SignatureSize` field is too small to hold an owner GUID,
    /// or the list body is not a multiple of it.
    InvalidSignatureSize(u32),

    /// An entry is too large to be described by the 32-bit size fields.
    EntryTooLarge,

    /// The payload size does not match the fixed size required by the
    /// signature type.
    InvalidPayloadSize(usize),

    /// No entry matches the one being removed.
    NotFound,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "signature list is truncated"),
            Self::InvalidListSize(size) => write!(f, "invalid signature list size: {size}"),
            Self::InvalidSignatureSize(size) => write!(f, "invalid signature size: {size}"),
            Self::EntryTooLarge => write!(f, "signature entry is too large"),
            Self::InvalidPayloadSize(size) => {
                write!(f, "payload size {size} does not match the signature type")
            }
            Self::NotFound => write!(f, "signature entry not found in database"),
        }
    }
}

impl core::error::Error for Error {}

/// Signature database [`Result`] type alias.
///
/// [`Result`]: `core::result::Result`
pub type Result<T> = core::result::Result<T, Error>;
