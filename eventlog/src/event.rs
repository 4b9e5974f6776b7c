// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use core::fmt::{self, Display, Formatter};

/// TCG event type.
///
/// Only the types this crate looks at are named here; any other value
/// is carried through unchanged.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EventType(pub u32);

impl EventType {
    pub const POST_CODE: Self = Self(0x0000_0001);
    pub const NO_ACTION: Self = Self(0x0000_0003);
    pub const SEPARATOR: Self = Self(0x0000_0004);
    pub const EFI_VARIABLE_DRIVER_CONFIG: Self = Self(0x8000_0001);
    pub const EFI_BOOT_SERVICES_APPLICATION: Self = Self(0x8000_0003);

    /// An EFI driver was loaded from a device before the OS loader ran.
    /// This is how Option ROMs show up in the log.
    pub const EFI_BOOT_SERVICES_DRIVER: Self = Self(0x8000_0004);

    pub const EFI_RUNTIME_SERVICES_DRIVER: Self = Self(0x8000_0005);
    pub const EFI_ACTION: Self = Self(0x8000_0007);
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match *self {
            Self::POST_CODE => "EV_POST_CODE",
            Self::NO_ACTION => "EV_NO_ACTION",
            Self::SEPARATOR => "EV_SEPARATOR",
            Self::EFI_VARIABLE_DRIVER_CONFIG => "EV_EFI_VARIABLE_DRIVER_CONFIG",
            Self::EFI_BOOT_SERVICES_APPLICATION => "EV_EFI_BOOT_SERVICES_APPLICATION",
            Self::EFI_BOOT_SERVICES_DRIVER => "EV_EFI_BOOT_SERVICES_DRIVER",
            Self::EFI_RUNTIME_SERVICES_DRIVER => "EV_EFI_RUNTIME_SERVICES_DRIVER",
            Self::EFI_ACTION => "EV_EFI_ACTION",
            Self(other) => return write!(f, "{other:#010x}"),
        };
        f.write_str(name)
    }
}

/// TPM hash algorithm identifier (`TPM_ALG_ID`).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HashAlgorithm(pub u16);

impl HashAlgorithm {
    pub const SHA1: Self = Self(0x0004);
    pub const SHA256: Self = Self(0x000b);
    pub const SHA384: Self = Self(0x000c);
    pub const SHA512: Self = Self(0x000d);
}

/// One digest of an event's measured data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Digest {
    pub algorithm: HashAlgorithm,
    pub bytes: Vec<u8>,
}

/// A single measured boot event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub pcr: u32,
    pub event_type: EventType,
    pub digests: Vec<Digest>,
    pub data: Vec<u8>,
}

impl Event {
    /// Get the event's digest for `algorithm`, if the log recorded one.
    #[must_use]
    pub fn digest(&self, algorithm: HashAlgorithm) -> Option<&[u8]> {
        self.digests
            .iter()
            .find(|digest| digest.algorithm == algorithm)
            .map(|digest| digest.bytes.as_slice())
    }
}
