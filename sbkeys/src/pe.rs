// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Authenticode digests and certificate tables of PE executables.
//!
//! Signatures live in the certificate table pointed to by the security
//! data directory. The table is at the end of the file and is not
//! loaded into memory. The Authenticode digest covers, in order:
//!
//! * the headers up to `SizeOfHeaders`, skipping the checksum and the
//!   security data directory entry,
//! * the raw data of each section, sorted by file offset,
//! * whatever follows, up to the certificate table.
//!
//! Adding a signature therefore does not change the digest, and an
//! executable can carry signatures from several keys.

use crate::signature::WinCertificate;
use crate::{Error, Result};
use core::mem;
use core::ops::Range;
use object::pe::{
    ImageDataDirectory, ImageFileHeader, ImageNtHeaders32, ImageNtHeaders64,
    IMAGE_DIRECTORY_ENTRY_SECURITY,
};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile};
use object::{FileKind, LittleEndian};
use sha2::{Digest, Sha256};

/// Certificate table entries are aligned to eight bytes.
const CERT_ALIGN: usize = 8;

/// Offset of `CheckSum` within the optional header. The same for PE32
/// and PE32+.
const CHECKSUM_OFFSET_IN_OPTIONAL_HEADER: usize = 64;

fn align_up(value: usize) -> usize {
    value.div_ceil(CERT_ALIGN) * CERT_ALIGN
}

fn invalid(err: object::Error) -> Error {
    Error::InvalidPe(err.to_string())
}

fn u32_to_usize(v: u32) -> usize {
    // usize is at least 32 bits on every supported target.
    v as usize
}

/// A PE executable loaded for signing.
pub struct Image {
    data: Vec<u8>,
    checksum_offset: usize,
    /// Offset of the security data directory entry.
    security_dir_offset: usize,
    cert_table: Option<Range<usize>>,
    digest: [u8; 32],
}

impl Image {
    pub fn parse(data: &[u8]) -> Result<Self> {
        match FileKind::parse(data).map_err(invalid)? {
            FileKind::Pe32 => Self::parse_impl::<ImageNtHeaders32>(data),
            FileKind::Pe64 => Self::parse_impl::<ImageNtHeaders64>(data),
            kind => Err(Error::InvalidPe(format!("not a PE executable: {kind:?}"))),
        }
    }

    fn parse_impl<Pe: ImageNtHeaders>(data: &[u8]) -> Result<Self> {
        let pe = PeFile::<Pe>::parse(data).map_err(invalid)?;

        let nt_offset = u32_to_usize(pe.dos_header().nt_headers_offset());
        let optional_offset = nt_offset + 4 + mem::size_of::<ImageFileHeader>();
        let checksum_offset = optional_offset + CHECKSUM_OFFSET_IN_OPTIONAL_HEADER;
        let size_of_headers = u32_to_usize(pe.nt_headers().optional_header().size_of_headers());

        // `DataDirectories::get` hides entries with a zero address, which
        // is how an unsigned executable's security entry looks, so read
        // the raw entry.
        let security_dir = pe
            .data_directories()
            .iter()
            .nth(IMAGE_DIRECTORY_ENTRY_SECURITY)
            .ok_or_else(|| Error::InvalidPe("no security data directory entry".into()))?;
        let security_dir_offset = optional_offset
            + mem::size_of::<Pe::ImageOptionalHeader>()
            + IMAGE_DIRECTORY_ENTRY_SECURITY * mem::size_of::<ImageDataDirectory>();

        let headers_end = security_dir_offset + mem::size_of::<ImageDataDirectory>();
        if size_of_headers < headers_end || size_of_headers > data.len() {
            return Err(Error::InvalidPe(format!(
                "invalid SizeOfHeaders {size_of_headers:#x}"
            )));
        }

        let mut sections_end = 0;
        for section in pe.section_table().iter() {
            let start = u32_to_usize(section.pointer_to_raw_data.get(LittleEndian));
            let size = u32_to_usize(section.size_of_raw_data.get(LittleEndian));
            if size == 0 {
                continue;
            }
            let end = start
                .checked_add(size)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| Error::InvalidPe("section data out of bounds".into()))?;
            sections_end = sections_end.max(end);
        }

        let table_start = u32_to_usize(security_dir.virtual_address.get(LittleEndian));
        let table_size = u32_to_usize(security_dir.size.get(LittleEndian));

        let mut data = data.to_vec();
        let cert_table = if table_start == 0 || table_size == 0 {
            // The table will start on an aligned offset, and the
            // padding is part of the signed content.
            data.resize(align_up(data.len()), 0);
            None
        } else {
            let table_end = table_start
                .checked_add(table_size)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| Error::InvalidPe("certificate table out of bounds".into()))?;
            if table_end != data.len() {
                return Err(Error::InvalidPe(
                    "certificate table is not at the end of the file".into(),
                ));
            }
            if sections_end > table_start {
                return Err(Error::InvalidPe(
                    "section data overlaps the certificate table".into(),
                ));
            }
            Some(table_start..table_end)
        };

        // Hash the padded data, so the digest matches the one a signed
        // copy will have.
        let padded = PeFile::<Pe>::parse(data.as_slice()).map_err(invalid)?;
        let mut hasher = Sha256::new();
        authenticode::authenticode_digest(&padded, &mut hasher)
            .map_err(|_| Error::InvalidPe("failed to compute the Authenticode digest".into()))?;
        let digest = hasher.finalize().into();

        Ok(Self {
            data,
            checksum_offset,
            security_dir_offset,
            cert_table,
            digest,
        })
    }

    /// SHA-256 Authenticode digest. It covers the headers (without the
    /// checksum and the security entry), the section data, and any
    /// data before the certificate table.
    pub fn digest(&self) -> [u8; 32] {
        self.digest
    }

    /// Entries in the certificate table.
    pub fn certificates(&self) -> Result<Vec<WinCertificate>> {
        let Some(table) = &self.cert_table else {
            return Ok(Vec::new());
        };
        let table = &self.data[table.clone()];

        let mut certificates = Vec::new();
        let mut offset = 0;
        while offset < table.len() {
            let (certificate, len) = WinCertificate::decode(&table[offset..]).ok_or_else(|| {
                Error::InvalidPe(format!("invalid certificate at offset {offset}"))
            })?;
            certificates.push(certificate);
            offset += align_up(len);
        }
        Ok(certificates)
    }

    /// Get the executable with `certificate` appended to the
    /// certificate table.
    pub fn with_certificate(&self, certificate: &WinCertificate) -> Result<Vec<u8>> {
        let dir = self.security_dir_offset;
        let mut entry = certificate.encode()?;
        entry.resize(align_up(entry.len()), 0);

        let mut data = self.data.clone();
        let table_start = self
            .cert_table
            .as_ref()
            .map_or(data.len(), |table| table.start);
        data.extend(&entry);
        let table_size = data.len() - table_start;

        let too_large = || Error::InvalidPe("signed executable is too large".into());
        let start = u32::try_from(table_start).map_err(|_| too_large())?;
        let size = u32::try_from(table_size).map_err(|_| too_large())?;
        data[dir..dir + 4].copy_from_slice(&start.to_le_bytes());
        data[dir + 4..dir + 8].copy_from_slice(&size.to_le_bytes());

        let checksum = pe_checksum(&data, self.checksum_offset);
        data[self.checksum_offset..self.checksum_offset + 4]
            .copy_from_slice(&checksum.to_le_bytes());
        Ok(data)
    }
}

/// Calculate the optional header checksum: a folded 16-bit sum of the
/// file (skipping the checksum field) plus the file length.
fn pe_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    for (index, chunk) in data.chunks(2).enumerate() {
        let offset = index * 2;
        if offset >= checksum_offset && offset < checksum_offset + 4 {
            continue;
        }
        let word = u16::from_le_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)]);
        sum += u32::from(word);
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum = (sum & 0xffff) + (sum >> 16);
    // The checksum field is 32 bits; longer files wrap.
    sum.wrapping_add(data.len() as u32)
}
