// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PKCS#7 signatures and the `WIN_CERTIFICATE` structures that carry
//! them.
//!
//! Executables are signed with Authenticode: a `ContentInfo` wrapping
//! `SignedData` whose content is an `SpcIndirectDataContent` holding
//! the image digest. The signer info has `contentType` and
//! `messageDigest` signed attributes.
//!
//! Authenticated variable updates carry a bare `SignedData` with
//! detached content and no signed attributes, the same shape
//! `sbvarsign` produces.
//!
//! Signatures are RSA PKCS#1 v1.5 over SHA-256. A signature is trusted
//! if its signer identifier names the trusted certificate and the
//! signature verifies with that certificate's key.

use crate::backend::KeyBackend;
use crate::certificate::{self, Certificate};
use crate::{Error, Result};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedAttributes, SignedData, SignerIdentifier,
    SignerInfo, SignerInfos,
};
use const_oid::db::rfc5911::{ID_CONTENT_TYPE, ID_DATA, ID_MESSAGE_DIGEST, ID_SIGNED_DATA};
use const_oid::db::rfc5912::{ID_SHA_256, RSA_ENCRYPTION};
use der::asn1::{ObjectIdentifier, OctetString, SetOfVec};
use der::{Any, Decode, Encode, Sequence};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use sha2::{Digest, Sha256};
use uguid::{guid, Guid};
use x509_cert::attr::Attribute;
use x509_cert::spki::AlgorithmIdentifierOwned;

/// `WIN_CERTIFICATE.wRevision`.
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;

/// `WIN_CERTIFICATE.wCertificateType` of an Authenticode signature.
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

/// `WIN_CERTIFICATE.wCertificateType` of `WIN_CERTIFICATE_UEFI_GUID`.
pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0ef1;

/// `EFI_CERT_TYPE_PKCS7_GUID`: the only `CertType` firmware accepts
/// in an `EFI_VARIABLE_AUTHENTICATION_2` header.
pub const EFI_CERT_TYPE_PKCS7_GUID: Guid = guid!("4aafd29d-68df-49ee-8aa9-347d375665a7");

/// Size of the `WIN_CERTIFICATE` header: length, revision and
/// certificate type.
pub const WIN_CERT_HEADER_SIZE: usize = 4 + 2 + 2;

/// `SPC_INDIRECT_DATA_OBJID`.
pub const SPC_INDIRECT_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.4");

/// `SPC_PE_IMAGE_DATAOBJ`.
pub const SPC_PE_IMAGE_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.15");

/// DER of the `SpcPeImageData` every signing tool emits: no flags, and
/// a file link holding the BMP string "<<<Obsolete>>>".
const OBSOLETE_PE_IMAGE_DATA: [u8; 39] = [
    0x30, 0x25, 0x03, 0x01, 0x00, 0xa0, 0x20, 0xa2, 0x1e, 0x80, 0x1c, 0x00, 0x3c, 0x00, 0x3c,
    0x00, 0x3c, 0x00, 0x4f, 0x00, 0x62, 0x00, 0x73, 0x00, 0x6f, 0x00, 0x6c, 0x00, 0x65, 0x00,
    0x74, 0x00, 0x65, 0x00, 0x3e, 0x00, 0x3e, 0x00, 0x3e,
];

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcAttributeTypeAndOptionalValue {
    pub value_type: ObjectIdentifier,
    pub value: Any,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct DigestInfo {
    pub digest_algorithm: AlgorithmIdentifierOwned,
    pub digest: OctetString,
}

/// The signed content of an Authenticode signature.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcIndirectDataContent {
    pub data: SpcAttributeTypeAndOptionalValue,
    pub message_digest: DigestInfo,
}

impl SpcIndirectDataContent {
    fn new(image_digest: &[u8]) -> der::Result<Self> {
        Ok(Self {
            data: SpcAttributeTypeAndOptionalValue {
                value_type: SPC_PE_IMAGE_DATA,
                value: Any::from_der(&OBSOLETE_PE_IMAGE_DATA)?,
            },
            message_digest: DigestInfo {
                digest_algorithm: sha256_algorithm(),
                digest: OctetString::new(image_digest)?,
            },
        })
    }

    /// Authenticode's `messageDigest` covers the content octets of the
    /// `SEQUENCE`, without its tag and length.
    fn content_octets(&self) -> der::Result<Vec<u8>> {
        let mut out = self.data.to_der()?;
        out.extend(self.message_digest.to_der()?);
        Ok(out)
    }
}

/// A `WIN_CERTIFICATE` entry, as found in a PE certificate table or an
/// authenticated variable header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WinCertificate {
    pub revision: u16,
    pub certificate_type: u16,
    /// `bCertificate`.
    pub data: Vec<u8>,
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

impl WinCertificate {
    /// An Authenticode signature entry.
    pub fn authenticode(content_info: Vec<u8>) -> Self {
        Self {
            revision: WIN_CERT_REVISION_2_0,
            certificate_type: WIN_CERT_TYPE_PKCS_SIGNED_DATA,
            data: content_info,
        }
    }

    /// A `WIN_CERTIFICATE_UEFI_GUID` entry.
    pub fn uefi_guid(cert_type: Guid, cert_data: &[u8]) -> Self {
        let mut data = cert_type.to_bytes().to_vec();
        data.extend(cert_data);
        Self {
            revision: WIN_CERT_REVISION_2_0,
            certificate_type: WIN_CERT_TYPE_EFI_GUID,
            data,
        }
    }

    /// For a `WIN_CERTIFICATE_UEFI_GUID`, get `CertType` and `CertData`.
    pub fn uefi_guid_parts(&self) -> Option<(Guid, &[u8])> {
        if self.certificate_type != WIN_CERT_TYPE_EFI_GUID {
            return None;
        }
        let cert_type: [u8; 16] = self.data.get(..16)?.try_into().ok()?;
        Some((Guid::from_bytes(cert_type), &self.data[16..]))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = WIN_CERT_HEADER_SIZE + self.data.len();
        let len_u32 = u32::try_from(len)
            .map_err(|_| Error::Signing(format!("{len} byte certificate is too large")))?;
        let mut out = Vec::with_capacity(len);
        out.extend(len_u32.to_le_bytes());
        out.extend(self.revision.to_le_bytes());
        out.extend(self.certificate_type.to_le_bytes());
        out.extend(&self.data);
        Ok(out)
    }

    /// Parse the entry at the start of `data`, returning it and its
    /// `dwLength`. Returns `None` if the header is malformed.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        let length = usize::try_from(read_u32(data, 0)?).ok()?;
        if length < WIN_CERT_HEADER_SIZE || length > data.len() {
            return None;
        }
        let entry = Self {
            revision: read_u16(data, 4)?,
            certificate_type: read_u16(data, 6)?,
            data: data[WIN_CERT_HEADER_SIZE..length].to_vec(),
        };
        Some((entry, length))
    }
}

fn sha256_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ID_SHA_256,
        parameters: None,
    }
}

fn rsa_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: RSA_ENCRYPTION,
        parameters: Some(Any::null()),
    }
}

fn encoding_err(err: der::Error) -> Error {
    Error::Signing(format!("failed to encode signature: {err}"))
}

fn attribute(oid: ObjectIdentifier, value: Any) -> der::Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value])?,
    })
}

fn issuer_and_serial(cert: &Certificate) -> IssuerAndSerialNumber {
    IssuerAndSerialNumber {
        issuer: cert.tbs_certificate.issuer.clone(),
        serial_number: cert.tbs_certificate.serial_number.clone(),
    }
}

/// Build `SignedData` with a single signer.
///
/// Without signed attributes the signature covers `content` directly;
/// otherwise it covers the DER of the attributes.
fn build_signed_data(
    signer: &dyn KeyBackend,
    encap_content_info: EncapsulatedContentInfo,
    signed_attrs: Option<SignedAttributes>,
    content: &[u8],
) -> Result<SignedData> {
    let cert = signer.certificate();
    let signature = match &signed_attrs {
        Some(attrs) => signer.sign(&attrs.to_der().map_err(encoding_err)?)?,
        None => signer.sign(content)?,
    };

    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(issuer_and_serial(cert)),
        digest_alg: sha256_algorithm(),
        signed_attrs,
        signature_algorithm: rsa_algorithm(),
        signature: OctetString::new(signature).map_err(encoding_err)?,
        unsigned_attrs: None,
    };

    let signed_data = (|| -> der::Result<SignedData> {
        Ok(SignedData {
            version: CmsVersion::V1,
            digest_algorithms: SetOfVec::try_from(vec![sha256_algorithm()])?,
            encap_content_info,
            certificates: Some(CertificateSet(SetOfVec::try_from(vec![
                CertificateChoices::Certificate(cert.clone()),
            ])?)),
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
        })
    })();
    signed_data.map_err(encoding_err)
}

/// Create an Authenticode signature over `image_digest`, returning the
/// DER `ContentInfo` for a `WIN_CERT_TYPE_PKCS_SIGNED_DATA` entry.
pub fn sign_authenticode(signer: &dyn KeyBackend, image_digest: &[u8; 32]) -> Result<Vec<u8>> {
    let spc = SpcIndirectDataContent::new(image_digest).map_err(encoding_err)?;
    let content = spc.content_octets().map_err(encoding_err)?;

    let attrs = (|| -> der::Result<SignedAttributes> {
        SetOfVec::try_from(vec![
            attribute(ID_CONTENT_TYPE, Any::encode_from(&SPC_INDIRECT_DATA)?)?,
            attribute(
                ID_MESSAGE_DIGEST,
                Any::encode_from(&OctetString::new(Sha256::digest(&content).to_vec())?)?,
            )?,
        ])
    })()
    .map_err(encoding_err)?;

    let encap = EncapsulatedContentInfo {
        econtent_type: SPC_INDIRECT_DATA,
        econtent: Some(Any::encode_from(&spc).map_err(encoding_err)?),
    };
    let signed_data = build_signed_data(signer, encap, Some(attrs), &content)?;

    let content_info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).map_err(encoding_err)?,
    };
    content_info.to_der().map_err(encoding_err)
}

/// Create a detached signature over `message`, returning the DER
/// `SignedData`.
pub fn sign_detached(signer: &dyn KeyBackend, message: &[u8]) -> Result<Vec<u8>> {
    let encap = EncapsulatedContentInfo {
        econtent_type: ID_DATA,
        econtent: None,
    };
    build_signed_data(signer, encap, None, message)?
        .to_der()
        .map_err(encoding_err)
}

/// A parsed PKCS#7 `SignedData`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pkcs7 {
    signed_data: SignedData,
}

impl Pkcs7 {
    /// Parse either a `ContentInfo` wrapping `SignedData` or a bare
    /// `SignedData`. Firmware accepts both in variable updates.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let invalid = |err: der::Error| Error::InvalidSignature(err.to_string());
        let signed_data = match ContentInfo::from_der(data) {
            Ok(info) if info.content_type == ID_SIGNED_DATA => {
                info.content.decode_as::<SignedData>().map_err(invalid)?
            }
            Ok(info) => {
                return Err(Error::InvalidSignature(format!(
                    "unexpected content type {}",
                    info.content_type
                )))
            }
            Err(_) => SignedData::from_der(data).map_err(invalid)?,
        };
        Ok(Self { signed_data })
    }

    /// Certificates embedded in the signature.
    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.signed_data
            .certificates
            .iter()
            .flat_map(|set| set.0.iter())
            .filter_map(|choice| match choice {
                CertificateChoices::Certificate(cert) => Some(cert),
                CertificateChoices::Other(_) => None,
            })
    }

    /// The `SpcIndirectDataContent` of an Authenticode signature.
    pub fn indirect_data(&self) -> Option<SpcIndirectDataContent> {
        let encap = &self.signed_data.encap_content_info;
        if encap.econtent_type != SPC_INDIRECT_DATA {
            return None;
        }
        encap.econtent.as_ref()?.decode_as().ok()
    }

    /// Image digest an Authenticode signature claims, if it is SHA-256.
    pub fn authenticode_digest(&self) -> Option<Vec<u8>> {
        let spc = self.indirect_data()?;
        if spc.message_digest.digest_algorithm.oid != ID_SHA_256 {
            return None;
        }
        Some(spc.message_digest.digest.as_bytes().to_vec())
    }

    /// Check that this is an Authenticode signature over `image_digest`
    /// by `trusted`.
    pub fn verify_authenticode(&self, image_digest: &[u8], trusted: &Certificate) -> Result<bool> {
        let Some(spc) = self.indirect_data() else {
            return Ok(false);
        };
        if self.authenticode_digest().as_deref() != Some(image_digest) {
            return Ok(false);
        }
        let content = spc
            .content_octets()
            .map_err(|err| Error::InvalidSignature(err.to_string()))?;
        self.verify_signer(&content, trusted)
    }

    /// Check that this is a detached signature over `message` by
    /// `trusted`.
    pub fn verify_detached(&self, message: &[u8], trusted: &Certificate) -> Result<bool> {
        if self.signed_data.encap_content_info.econtent.is_some() {
            return Ok(false);
        }
        self.verify_signer(message, trusted)
    }

    fn verify_signer(&self, content: &[u8], trusted: &Certificate) -> Result<bool> {
        let trusted_id = SignerIdentifier::IssuerAndSerialNumber(issuer_and_serial(trusted));
        let key = VerifyingKey::<Sha256>::new(certificate::public_key(trusted)?);

        for info in self.signed_data.signer_infos.0.iter() {
            if info.sid != trusted_id || info.digest_alg.oid != ID_SHA_256 {
                continue;
            }
            let signed = match &info.signed_attrs {
                None => content.to_vec(),
                Some(attrs) => {
                    if message_digest(attrs) != Some(Sha256::digest(content).to_vec()) {
                        continue;
                    }
                    attrs
                        .to_der()
                        .map_err(|err| Error::InvalidSignature(err.to_string()))?
                }
            };
            let Ok(signature) = Signature::try_from(info.signature.as_bytes()) else {
                continue;
            };
            if key.verify(&signed, &signature).is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn message_digest(attrs: &SignedAttributes) -> Option<Vec<u8>> {
    let attr = attrs.iter().find(|attr| attr.oid == ID_MESSAGE_DIGEST)?;
    let value = attr.values.iter().next()?;
    let digest: OctetString = value.decode_as().ok()?;
    Some(digest.as_bytes().to_vec())
}
