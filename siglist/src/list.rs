// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A single `EFI_SIGNATURE_LIST`.

use crate::{Error, Result, SignatureType, GUID_SIZE};
use alloc::vec::Vec;
use uguid::Guid;

/// Size of the fixed part of the `EFI_SIGNATURE_LIST` header:
/// `SignatureType`, `SignatureListSize`, `SignatureHeaderSize`, and
/// `SignatureSize`.
pub(crate) const LIST_HEADER_SIZE: usize = GUID_SIZE + 4 + 4 + 4;

/// One `EFI_SIGNATURE_DATA` entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureEntry {
    /// Agent that added this entry.
    pub owner: Guid,

    /// Certificate or hash data.
    pub data: Vec<u8>,
}

impl SignatureEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(owner: Guid, data: Vec<u8>) -> Self {
        Self { owner, data }
    }
}

/// A group of equally-sized entries of one signature type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureList {
    signature_type: SignatureType,

    /// Type-specific header. Empty for all the types defined in the
    /// UEFI spec, but preserved as-is.
    header: Vec<u8>,

    /// Size of each entry's payload (not including the owner GUID).
    payload_size: usize,

    entries: Vec<SignatureEntry>,
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
        .ok_or(Error::Truncated)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_guid(data: &[u8], offset: usize) -> Result<Guid> {
    let bytes = data
        .get(offset..offset + GUID_SIZE)
        .and_then(|bytes| <[u8; GUID_SIZE]>::try_from(bytes).ok())
        .ok_or(Error::Truncated)?;
    Ok(Guid::from_bytes(bytes))
}

fn to_u32(val: usize) -> Result<u32> {
    u32::try_from(val).map_err(|_| Error::EntryTooLarge)
}

fn to_usize(val: u32) -> usize {
    // usize is at least 32 bits on all supported targets.
    val as usize
}

impl SignatureList {
    /// Create an empty list for entries of `signature_type` with
    /// `payload_size`-byte payloads.
    pub fn new(signature_type: SignatureType, payload_size: usize) -> Result<Self> {
        if let Some(expected) = signature_type.fixed_payload_size() {
            if payload_size != expected {
                return Err(Error::InvalidPayloadSize(payload_size));
            }
        }
        Ok(Self {
            signature_type,
            header: Vec::new(),
            payload_size,
            entries: Vec::new(),
        })
    }

    /// Parse one list from the start of `data`. On success, the list
    /// and the number of bytes it occupied are returned.
    pub(crate) fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let signature_type = SignatureType::from_guid(read_guid(data, 0)?);
        let list_size = read_u32(data, GUID_SIZE)?;
        let header_size = read_u32(data, GUID_SIZE + 4)?;
        let signature_size = read_u32(data, GUID_SIZE + 8)?;

        let list_len = to_usize(list_size);
        let header_len = to_usize(header_size);
        let signature_len = to_usize(signature_size);

        if list_len > data.len() {
            return Err(Error::Truncated);
        }
        let body_start = LIST_HEADER_SIZE
            .checked_add(header_len)
            .ok_or(Error::InvalidListSize(list_size))?;
        if list_len < body_start {
            return Err(Error::InvalidListSize(list_size));
        }
        if signature_len <= GUID_SIZE || (list_len - body_start) % signature_len != 0 {
            return Err(Error::InvalidSignatureSize(signature_size));
        }

        let header = data[LIST_HEADER_SIZE..body_start].to_vec();
        let entries = data[body_start..list_len]
            .chunks_exact(signature_len)
            .map(|chunk| {
                Ok(SignatureEntry {
                    owner: read_guid(chunk, 0)?,
                    data: chunk[GUID_SIZE..].to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let list = Self {
            signature_type,
            header,
            payload_size: signature_len - GUID_SIZE,
            entries,
        };
        Ok((list, list_len))
    }

    /// Append the encoded list to `out`.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        let signature_size = GUID_SIZE + self.payload_size;
        let list_size = LIST_HEADER_SIZE + self.header.len() + signature_size * self.entries.len();

        out.extend(self.signature_type.guid().to_bytes());
        out.extend(to_u32(list_size)?.to_le_bytes());
        out.extend(to_u32(self.header.len())?.to_le_bytes());
        out.extend(to_u32(signature_size)?.to_le_bytes());
        out.extend(&self.header);
        for entry in &self.entries {
            out.extend(entry.owner.to_bytes());
            out.extend(&entry.data);
        }
        Ok(())
    }

    /// Type of all entries in the list.
    #[must_use]
    pub fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    /// Size of each entry's payload.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Entries in the list.
    #[must_use]
    pub fn entries(&self) -> &[SignatureEntry] {
        &self.entries
    }

    /// Whether a new entry of `signature_type` with a `payload_len`
    /// byte payload can be added to this list.
    pub(crate) fn accepts(&self, signature_type: SignatureType, payload_len: usize) -> bool {
        self.signature_type == signature_type
            && self.header.is_empty()
            && self.payload_size == payload_len
    }

    pub(crate) fn push(&mut self, entry: SignatureEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<SignatureEntry> {
        &mut self.entries
    }
}
