// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser for the TCG PC Client event log format.
//!
//! Two layouts exist:
//!
//! * The legacy layout, where every event is a `TCG_PCR_EVENT` with a
//!   single SHA-1 digest.
//! * The crypto-agile layout. The first event is still a
//!   `TCG_PCR_EVENT`, of type `EV_NO_ACTION`, whose data is a
//!   `TCG_EfiSpecIDEvent` listing the digest algorithms and their
//!   sizes. Every following event is a `TCG_PCR_EVENT2` carrying one
//!   digest per algorithm.
//!
//! See the "TCG PC Client Platform Firmware Profile Specification",
//! section 10.

use crate::{Digest, Error, Event, EventType, HashAlgorithm, Result};
use log::debug;

/// Signature at the start of the `TCG_EfiSpecIDEvent` data.
const SPEC_ID_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";

const SHA1_DIGEST_SIZE: usize = 20;

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let data = self.data;
        let offset = self.offset;
        let bytes = offset
            .checked_add(len)
            .and_then(|end| data.get(offset..end))
            .ok_or(Error::Truncated { offset })?;
        self.offset += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a u32 length followed by that many bytes.
    fn sized_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()?;
        let offset = self.offset;
        let len = usize::try_from(len).map_err(|_| Error::Truncated { offset })?;
        self.bytes(len)
    }
}

/// Digest algorithms and sizes declared by the spec ID event.
struct AlgorithmSizes(Vec<(HashAlgorithm, usize)>);

impl AlgorithmSizes {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        if r.bytes(SPEC_ID_SIGNATURE.len())? != SPEC_ID_SIGNATURE {
            return Err(Error::InvalidSpecIdEvent);
        }
        // platformClass, specVersionMinor, specVersionMajor,
        // specErrata, uintnSize.
        r.u32()?;
        let minor = r.u8()?;
        let major = r.u8()?;
        r.u8()?;
        r.u8()?;
        debug!("crypto-agile event log, spec version {major}.{minor}");

        let num_algorithms = r.u32()?;
        let sizes = (0..num_algorithms)
            .map(|_| {
                let algorithm = HashAlgorithm(r.u16()?);
                let size = usize::from(r.u16()?);
                Ok((algorithm, size))
            })
            .collect::<Result<Vec<_>>>()?;
        if sizes.is_empty() {
            return Err(Error::InvalidSpecIdEvent);
        }
        Ok(Self(sizes))
    }

    fn size_of(&self, algorithm: HashAlgorithm) -> Result<usize> {
        self.0
            .iter()
            .find(|(alg, _)| *alg == algorithm)
            .map(|(_, size)| *size)
            .ok_or(Error::UnknownAlgorithm(algorithm.0))
    }
}

/// Read a legacy `TCG_PCR_EVENT`.
fn read_legacy_event(r: &mut Reader) -> Result<Event> {
    let pcr = r.u32()?;
    let event_type = EventType(r.u32()?);
    let digest = r.bytes(SHA1_DIGEST_SIZE)?.to_vec();
    let data = r.sized_bytes()?.to_vec();
    Ok(Event {
        pcr,
        event_type,
        digests: vec![Digest {
            algorithm: HashAlgorithm::SHA1,
            bytes: digest,
        }],
        data,
    })
}

/// Read a crypto-agile `TCG_PCR_EVENT2`.
fn read_event2(r: &mut Reader, sizes: &AlgorithmSizes) -> Result<Event> {
    let pcr = r.u32()?;
    let event_type = EventType(r.u32()?);
    let num_digests = r.u32()?;
    let digests = (0..num_digests)
        .map(|_| {
            let algorithm = HashAlgorithm(r.u16()?);
            let size = sizes.size_of(algorithm)?;
            Ok(Digest {
                algorithm,
                bytes: r.bytes(size)?.to_vec(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let data = r.sized_bytes()?.to_vec();
    Ok(Event {
        pcr,
        event_type,
        digests,
        data,
    })
}

/// Parse a binary event log into its ordered events.
///
/// An empty log is a valid log with no events.
pub fn parse(data: &[u8]) -> Result<Vec<Event>> {
    let mut r = Reader::new(data);
    let mut events = Vec::new();
    if r.is_empty() {
        return Ok(events);
    }

    let first = read_legacy_event(&mut r)?;
    let agile = first.event_type == EventType::NO_ACTION
        && first.data.starts_with(SPEC_ID_SIGNATURE);
    let sizes = if agile {
        Some(AlgorithmSizes::parse(&first.data)?)
    } else {
        None
    };
    events.push(first);

    while !r.is_empty() {
        let event = match &sizes {
            Some(sizes) => read_event2(&mut r, sizes)?,
            None => read_legacy_event(&mut r)?,
        };
        events.push(event);
    }

    debug!("parsed {} event log entries", events.len());
    Ok(events)
}
