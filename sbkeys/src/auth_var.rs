// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Time-based authenticated variable updates.
//!
//! An update is an `EFI_VARIABLE_AUTHENTICATION_2` header followed by
//! the new variable data:
//!
//! ```text
//! EFI_TIME (16 bytes) | WIN_CERTIFICATE_UEFI_GUID | data
//! ```
//!
//! The certificate's `CertType` is `EFI_CERT_TYPE_PKCS7_GUID` and its
//! `CertData` is a detached PKCS#7 `SignedData` over the variable name
//! (UTF-16LE, no terminator), the vendor GUID, the attributes, the
//! timestamp, and the data.

use crate::backend::KeyBackend;
use crate::certificate::Certificate;
use crate::efivars::{SecureBootVariable, SECURE_BOOT_ATTRIBUTES};
use crate::signature::{self, Pkcs7, WinCertificate, EFI_CERT_TYPE_PKCS7_GUID};
use crate::{Error, Result};
use std::time::SystemTime;
use uguid::Guid;

pub const EFI_TIME_SIZE: usize = 16;

/// Encode `time` as an `EFI_TIME` in UTC.
pub fn efi_time(time: SystemTime) -> Result<[u8; EFI_TIME_SIZE]> {
    let dt = der::DateTime::from_system_time(time)
        .map_err(|err| Error::Signing(format!("invalid timestamp: {err}")))?;
    let mut out = [0; EFI_TIME_SIZE];
    out[0..2].copy_from_slice(&dt.year().to_le_bytes());
    out[2] = dt.month();
    out[3] = dt.day();
    out[4] = dt.hour();
    out[5] = dt.minutes();
    out[6] = dt.seconds();
    // Pad1, Nanosecond, TimeZone, Daylight and Pad2 must be zero.
    Ok(out)
}

/// Build the message that the update signature covers.
pub fn signed_message(
    name: &str,
    vendor: Guid,
    attributes: u32,
    timestamp: &[u8; EFI_TIME_SIZE],
    data: &[u8],
) -> Vec<u8> {
    let mut message: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
    message.extend(vendor.to_bytes());
    message.extend(attributes.to_le_bytes());
    message.extend(timestamp);
    message.extend(data);
    message
}

/// Create a signed update that sets `var` to `data`.
pub fn build(
    var: SecureBootVariable,
    data: &[u8],
    signer: &dyn KeyBackend,
    now: SystemTime,
) -> Result<Vec<u8>> {
    let timestamp = efi_time(now)?;
    let message = signed_message(
        var.name(),
        var.vendor(),
        SECURE_BOOT_ATTRIBUTES,
        &timestamp,
        data,
    );
    let signed_data = signature::sign_detached(signer, &message)?;

    let mut payload = timestamp.to_vec();
    payload.extend(WinCertificate::uefi_guid(EFI_CERT_TYPE_PKCS7_GUID, &signed_data).encode()?);
    payload.extend(data);
    Ok(payload)
}

/// A parsed update.
#[derive(Debug, Eq, PartialEq)]
pub struct AuthenticatedUpdate {
    pub timestamp: [u8; EFI_TIME_SIZE],
    pub cert_type: Guid,
    pub cert_data: Vec<u8>,
    pub data: Vec<u8>,
}

impl AuthenticatedUpdate {
    /// Parse the header. Returns `None` if the payload is truncated or
    /// the certificate is not a `WIN_CERTIFICATE_UEFI_GUID`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let timestamp: [u8; EFI_TIME_SIZE] = payload.get(..EFI_TIME_SIZE)?.try_into().ok()?;
        let rest = &payload[EFI_TIME_SIZE..];
        let (certificate, len) = WinCertificate::decode(rest)?;
        let (cert_type, cert_data) = certificate.uefi_guid_parts()?;
        Some(Self {
            timestamp,
            cert_type,
            cert_data: cert_data.to_vec(),
            data: rest[len..].to_vec(),
        })
    }

    /// The PKCS#7 signature. Fails if the certificate is of another
    /// type or does not parse.
    pub fn pkcs7(&self) -> Result<Pkcs7> {
        if self.cert_type != EFI_CERT_TYPE_PKCS7_GUID {
            return Err(Error::InvalidSignature(format!(
                "unsupported certificate type {}",
                self.cert_type
            )));
        }
        Pkcs7::parse(&self.cert_data)
    }

    /// Message the signature must cover for `var`.
    pub fn message(&self, var: SecureBootVariable, attributes: u32) -> Vec<u8> {
        signed_message(
            var.name(),
            var.vendor(),
            attributes,
            &self.timestamp,
            &self.data,
        )
    }

    /// Check that the update for `var` is signed by `trusted`.
    pub fn verify(
        &self,
        var: SecureBootVariable,
        attributes: u32,
        trusted: &Certificate,
    ) -> Result<bool> {
        self.pkcs7()?
            .verify_detached(&self.message(var, attributes), trusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efivars::GLOBAL_VARIABLE_GUID;
    use crate::testing::{fixture_key, test_hierarchy};
    use crate::Role;
    use siglist::{SignatureDatabase, SignatureType};
    use std::time::{Duration, UNIX_EPOCH};

    /// Test EFI_TIME encoding.
    #[test]
    fn test_efi_time() {
        // 2024-03-05 06:07:08 UTC
        let time = UNIX_EPOCH + Duration::from_secs(1709618828);
        assert_eq!(
            efi_time(time).unwrap(),
            [0xe8, 0x07, 3, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    /// Test the signed message layout.
    #[test]
    fn test_signed_message() {
        let timestamp = [9; EFI_TIME_SIZE];
        let message = signed_message("PK", GLOBAL_VARIABLE_GUID, 0x27, &timestamp, b"data");
        let mut expected = vec![b'P', 0, b'K', 0];
        expected.extend(GLOBAL_VARIABLE_GUID.to_bytes());
        expected.extend([0x27, 0, 0, 0]);
        expected.extend([9; EFI_TIME_SIZE]);
        expected.extend(b"data");
        assert_eq!(message, expected);
    }

    /// Test that a built update parses and verifies only for its
    /// variable and signer.
    #[test]
    fn test_build_and_verify() {
        let keys = test_hierarchy();
        let signer = keys.get(Role::Kek);
        let payload = build(SecureBootVariable::Db, b"new db", signer, SystemTime::now()).unwrap();

        let update = AuthenticatedUpdate::parse(&payload).unwrap();
        assert_eq!(update.data, b"new db");
        assert_eq!(update.cert_type, EFI_CERT_TYPE_PKCS7_GUID);

        let attrs = SECURE_BOOT_ATTRIBUTES;
        let kek = signer.certificate();
        assert!(update.verify(SecureBootVariable::Db, attrs, kek).unwrap());
        // Wrong signer.
        let pk = keys.get(Role::Pk).certificate();
        assert!(!update.verify(SecureBootVariable::Db, attrs, pk).unwrap());
        // Replayed against another variable.
        assert!(!update.verify(SecureBootVariable::Dbx, attrs, kek).unwrap());
    }

    /// Test an update built and signed by an external tool.
    #[test]
    fn test_known_update() -> anyhow::Result<()> {
        let payload = include_bytes!("../test_data/db.auth");
        let kek = fixture_key(Role::Kek);
        let db_key = fixture_key(Role::Db);

        let update = AuthenticatedUpdate::parse(payload).unwrap();
        assert_eq!(update.cert_type, EFI_CERT_TYPE_PKCS7_GUID);
        // 2024-03-05 06:07:08 UTC
        assert_eq!(
            update.timestamp,
            [0xe8, 0x07, 3, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        let db = SecureBootVariable::Db;
        let attrs = SECURE_BOOT_ATTRIBUTES;
        assert!(update.verify(db, attrs, kek.certificate())?);
        assert!(!update.verify(db, attrs, db_key.certificate())?);

        let list = SignatureDatabase::parse(&update.data)?;
        assert!(list.contains(SignatureType::X509, &db_key.certificate_der()?));

        // Signing the same data at the same time gives the same bytes.
        let time = UNIX_EPOCH + Duration::from_secs(1709618828);
        assert_eq!(build(db, &update.data, kek.as_ref(), time)?, payload);
        Ok(())
    }

    /// Test that a certificate type other than PKCS#7 does not verify.
    #[test]
    fn test_wrong_cert_type() {
        let keys = test_hierarchy();
        let signer = keys.get(Role::Kek);
        let payload = build(SecureBootVariable::Db, b"new db", signer, SystemTime::now()).unwrap();
        let mut update = AuthenticatedUpdate::parse(&payload).unwrap();
        update.cert_type = GLOBAL_VARIABLE_GUID;
        assert!(matches!(update.pkcs7(), Err(Error::InvalidSignature(_))));
        let attrs = SECURE_BOOT_ATTRIBUTES;
        let kek = signer.certificate();
        assert!(update.verify(SecureBootVariable::Db, attrs, kek).is_err());
    }

    /// Test that truncated payloads are rejected.
    #[test]
    fn test_parse_truncated() {
        assert_eq!(AuthenticatedUpdate::parse(&[0; 10]), None);
        assert_eq!(AuthenticatedUpdate::parse(&[0; 20]), None);
    }
}
