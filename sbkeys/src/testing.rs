// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test doubles: simulated firmware, a software TPM and token, and
//! fixtures.

use crate::auth_var::AuthenticatedUpdate;
use crate::backend::{
    self, BackendContext, KeyBackend, PinPolicy, SlotKey, Token, TokenAlgorithm, TokenProvider,
    TouchPolicy, TpmKey, TpmSession, TpmSessionFactory, UserPresence,
};
use crate::certificate;
use crate::config::{Config, KeysConfig, State};
use crate::efivars::{EfiVariables, SecureBootVariable, GLOBAL_VARIABLE_GUID};
use crate::fs::Fs;
use crate::hierarchy::{KeyHierarchy, Role};
use crate::signature::EFI_CERT_TYPE_PKCS7_GUID;
use crate::sync::{self, signer_role};
use crate::{BackendKind, Error, Result};
use camino::Utf8PathBuf;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use siglist::{SignatureDatabase, SignatureType};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uguid::{guid, Guid};

pub const TEST_OWNER: Guid = guid!("11111111-2222-3333-4444-555555555555");

const TEST_KEY_BITS: usize = 2048;

fn new_rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), TEST_KEY_BITS).unwrap()
}

/// Build a small but valid PE32+ executable with one `.text` section.
///
/// Layout: headers in 0x000..0x200, section data in 0x200..0x400.
pub fn minimal_pe() -> Vec<u8> {
    let mut data = vec![0; 0x400];
    let mut put = |offset: usize, bytes: &[u8]| {
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    // DOS header.
    put(0, b"MZ");
    put(0x3c, &0x40u32.to_le_bytes());

    // PE signature and file header.
    put(0x40, b"PE\0\0");
    put(0x44, &0x8664u16.to_le_bytes()); // Machine
    put(0x46, &1u16.to_le_bytes()); // NumberOfSections
    put(0x54, &240u16.to_le_bytes()); // SizeOfOptionalHeader
    put(0x56, &0x0022u16.to_le_bytes()); // Characteristics

    // Optional header.
    let opt = 0x58;
    put(opt, &0x20bu16.to_le_bytes()); // Magic (PE32+)
    put(opt + 4, &0x200u32.to_le_bytes()); // SizeOfCode
    put(opt + 16, &0x1000u32.to_le_bytes()); // AddressOfEntryPoint
    put(opt + 20, &0x1000u32.to_le_bytes()); // BaseOfCode
    put(opt + 24, &0x1_0000_0000u64.to_le_bytes()); // ImageBase
    put(opt + 32, &0x1000u32.to_le_bytes()); // SectionAlignment
    put(opt + 36, &0x200u32.to_le_bytes()); // FileAlignment
    put(opt + 56, &0x2000u32.to_le_bytes()); // SizeOfImage
    put(opt + 60, &0x200u32.to_le_bytes()); // SizeOfHeaders
    put(opt + 68, &10u16.to_le_bytes()); // Subsystem (EFI application)
    put(opt + 108, &16u32.to_le_bytes()); // NumberOfRvaAndSizes

    // Section table.
    let section = opt + 240;
    put(section, b".text\0\0\0");
    put(section + 8, &0x200u32.to_le_bytes()); // VirtualSize
    put(section + 12, &0x1000u32.to_le_bytes()); // VirtualAddress
    put(section + 16, &0x200u32.to_le_bytes()); // SizeOfRawData
    put(section + 20, &0x200u32.to_le_bytes()); // PointerToRawData
    put(section + 36, &0x6000_0020u32.to_le_bytes()); // Characteristics

    // Code: a single `ret`, then padding.
    put(0x200, &[0xc3]);
    data
}

pub fn test_backend_context() -> BackendContext {
    BackendContext {
        file_key_bits: TEST_KEY_BITS,
        tpm: Some(Arc::new(SoftTpm::new())),
        tokens: Some(Arc::new(SoftTokenProvider::with_token(1))),
        presence: Arc::new(RecordingPresence::default()),
        token_timeout: Duration::ZERO,
    }
}

/// A new hierarchy of file keys.
pub fn test_hierarchy() -> KeyHierarchy {
    KeyHierarchy::create_all(
        &KeysConfig::uniform(BackendKind::File),
        &test_backend_context(),
    )
    .unwrap()
}

/// A file key from `test_data`, signed by an external tool. Only KEK
/// and db keys are provided.
pub fn fixture_key(role: Role) -> Box<dyn KeyBackend> {
    let (private, cert): (&[u8], &[u8]) = match role {
        Role::Kek => (
            include_bytes!("../test_data/kek.key"),
            include_bytes!("../test_data/kek.pem"),
        ),
        Role::Db => (
            include_bytes!("../test_data/db.key"),
            include_bytes!("../test_data/db.pem"),
        ),
        Role::Pk => panic!("no PK fixture"),
    };
    backend::load(BackendKind::File, private, cert, &test_backend_context()).unwrap()
}

/// A temporary directory with saved file keys and simulated firmware.
pub struct TestEnv {
    _tmp: TempDir,
    pub root: Utf8PathBuf,
    pub state: State,
}

impl TestEnv {
    /// Keys are saved but not enrolled; the firmware is in setup mode.
    pub fn new() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();
        let config = Config::with_root(&root, KeysConfig::uniform(BackendKind::File));
        let fs = Fs::restricted(vec![root.clone()]);

        let keys = KeyHierarchy::create_all(config.keys(), &test_backend_context())?;
        keys.save_all(&fs, config.keydir())?;

        let state = State::new(
            config,
            fs,
            Box::new(SimulatedFirmware::new()),
            test_backend_context(),
        );
        Ok(Self {
            _tmp: tmp,
            root,
            state,
        })
    }

    /// Keys are saved and enrolled; the firmware is in user mode.
    pub fn enrolled() -> Result<Self> {
        let mut env = Self::new()?;
        let keys = env.state.load_hierarchy()?;
        let owner = env.state.owner_guid()?;
        sync::enroll_all(env.state.vars.as_mut(), &keys, owner)?;
        Ok(env)
    }
}

/// Firmware variable store that enforces the Secure Boot update rules.
///
/// Every update must carry a PKCS#7 certificate of type
/// `EFI_CERT_TYPE_PKCS7_GUID`. In setup mode (no PK) the signer is not
/// checked. Otherwise an update to PK or KEK must be signed by a
/// certificate in PK, and an update to db or dbx by a certificate in
/// KEK or PK.
#[derive(Default)]
pub struct SimulatedFirmware {
    vars: HashMap<(String, Guid), Vec<u8>>,
    writes: Vec<String>,
}

impl SimulatedFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    fn database(&self, var: SecureBootVariable) -> SignatureDatabase {
        self.vars
            .get(&(var.name().to_owned(), var.vendor()))
            .map(|data| SignatureDatabase::parse(data).unwrap())
            .unwrap_or_default()
    }

    pub fn setup_mode(&self) -> bool {
        self.database(SecureBootVariable::Pk).is_empty()
    }

    /// Names of the variables written, in order.
    pub fn write_log(&self) -> Vec<String> {
        self.writes.clone()
    }

    /// Set a database directly, as a firmware setup menu would.
    pub fn set_unauthenticated(
        &mut self,
        var: SecureBootVariable,
        db: &SignatureDatabase,
    ) -> Result<()> {
        self.vars
            .insert((var.name().to_owned(), var.vendor()), db.to_bytes()?);
        Ok(())
    }

    fn trusted_signers(&self, var: SecureBootVariable) -> Vec<certificate::Certificate> {
        let mut sources = vec![SecureBootVariable::from(signer_role(var))];
        if sources[0] != SecureBootVariable::Pk {
            sources.push(SecureBootVariable::Pk);
        }
        sources
            .into_iter()
            .flat_map(|source| {
                self.database(source)
                    .entries()
                    .filter(|(t, _)| *t == SignatureType::X509)
                    .filter_map(|(_, entry)| certificate::from_der(&entry.data).ok())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

fn variable_from_name(name: &str) -> Option<SecureBootVariable> {
    Some(match name {
        "PK" => SecureBootVariable::Pk,
        "KEK" => SecureBootVariable::Kek,
        "db" => SecureBootVariable::Db,
        "dbx" => SecureBootVariable::Dbx,
        _ => return None,
    })
}

impl EfiVariables for SimulatedFirmware {
    fn read(&self, name: &str, vendor: Guid) -> Result<Option<Vec<u8>>> {
        if vendor == GLOBAL_VARIABLE_GUID {
            match name {
                "SetupMode" => return Ok(Some(vec![u8::from(self.setup_mode())])),
                "SecureBoot" => return Ok(Some(vec![u8::from(!self.setup_mode())])),
                _ => {}
            }
        }
        Ok(self.vars.get(&(name.to_owned(), vendor)).cloned())
    }

    fn write(&mut self, name: &str, vendor: Guid, attributes: u32, data: &[u8]) -> Result<()> {
        let var = variable_from_name(name)
            .filter(|var| var.vendor() == vendor)
            .ok_or_else(|| Error::Firmware {
                name: name.to_owned(),
                reason: "not a Secure Boot variable".into(),
            })?;
        let rejected = |reason: &str| Error::Firmware {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };
        let update = AuthenticatedUpdate::parse(data)
            .ok_or_else(|| rejected("malformed authenticated update"))?;
        if update.cert_type != EFI_CERT_TYPE_PKCS7_GUID {
            return Err(rejected("certificate type is not PKCS#7"));
        }
        if update.pkcs7().is_err() {
            return Err(rejected("malformed PKCS#7 signature"));
        }

        if !self.setup_mode() {
            let authorized = self
                .trusted_signers(var)
                .iter()
                .any(|cert| update.verify(var, attributes, cert).unwrap_or(false));
            if !authorized {
                return Err(Error::UnauthorizedUpdate(name.to_owned()));
            }
        }

        // Firmware rejects data that is not a valid signature database.
        SignatureDatabase::parse(&update.data)?;
        self.vars.insert((name.to_owned(), vendor), update.data);
        self.writes.push(name.to_owned());
        Ok(())
    }
}

/// Software TPM. Private blobs are only usable with the instance that
/// created them.
pub struct SoftTpm {
    seal: [u8; 32],
}

impl SoftTpm {
    pub fn new() -> Self {
        let mut seal = [0; 32];
        rand::thread_rng().fill_bytes(&mut seal);
        Self { seal }
    }
}

struct SoftTpmSession {
    seal: [u8; 32],
}

impl SoftTpmSession {
    fn apply_seal(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.seal.iter().cycle())
            .map(|(a, b)| a ^ b)
            .collect()
    }
}

impl TpmSessionFactory for SoftTpm {
    fn open(&self) -> Result<Box<dyn TpmSession>> {
        Ok(Box::new(SoftTpmSession { seal: self.seal }))
    }
}

impl TpmSession for SoftTpmSession {
    fn create_signing_key(&mut self) -> Result<(TpmKey, RsaPublicKey)> {
        let key = new_rsa_key();
        let public_key = key.to_public_key();
        let tpm_key = TpmKey {
            parent: crate::backend::STORAGE_ROOT_KEY_HANDLE,
            public: public_key.to_public_key_der().unwrap().into_vec(),
            private: self.apply_seal(key.to_pkcs8_der().unwrap().as_bytes()),
        };
        Ok((tpm_key, public_key))
    }

    fn sign_digest(&mut self, key: &TpmKey, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let private = self.apply_seal(&key.private);
        let key = RsaPrivateKey::from_pkcs8_der(&private)
            .map_err(|_| Error::Tpm("failed to load key: integrity check failed".into()))?;
        key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|err| Error::Tpm(err.to_string()))
    }
}

enum SoftSlot {
    Rsa(RsaPrivateKey),
    Other(TokenAlgorithm),
}

#[derive(Default)]
struct SoftTokens {
    slots: BTreeMap<u32, Option<SoftSlot>>,
    generated: usize,
}

/// Software hardware-token provider.
#[derive(Clone, Default)]
pub struct SoftTokenProvider {
    tokens: Arc<Mutex<SoftTokens>>,
}

impl SoftTokenProvider {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_token(serial: u32) -> Self {
        let provider = Self::default();
        provider.tokens.lock().unwrap().slots.insert(serial, None);
        provider
    }

    pub fn set_slot_algorithm(&self, serial: u32, algorithm: TokenAlgorithm) {
        self.tokens
            .lock()
            .unwrap()
            .slots
            .insert(serial, Some(SoftSlot::Other(algorithm)));
    }

    /// Number of keys generated on any token.
    pub fn generated_count(&self) -> usize {
        self.tokens.lock().unwrap().generated
    }
}

impl TokenProvider for SoftTokenProvider {
    fn list(&self) -> Result<Vec<u32>> {
        Ok(self.tokens.lock().unwrap().slots.keys().copied().collect())
    }

    fn open(&self, serial: u32) -> Result<Box<dyn Token>> {
        Ok(Box::new(SoftToken {
            serial,
            tokens: self.tokens.clone(),
        }))
    }
}

struct SoftToken {
    serial: u32,
    tokens: Arc<Mutex<SoftTokens>>,
}

impl Token for SoftToken {
    fn serial(&self) -> u32 {
        self.serial
    }

    fn slot_key(&mut self, slot: u8) -> Result<Option<SlotKey>> {
        assert_eq!(slot, crate::backend::SIGNING_SLOT);
        let tokens = self.tokens.lock().unwrap();
        Ok(match tokens.slots.get(&self.serial) {
            Some(Some(SoftSlot::Rsa(key))) => Some(SlotKey {
                algorithm: TokenAlgorithm::Rsa2048,
                public_key: Some(key.to_public_key()),
            }),
            Some(Some(SoftSlot::Other(algorithm))) => Some(SlotKey {
                algorithm: *algorithm,
                public_key: None,
            }),
            _ => None,
        })
    }

    fn generate(
        &mut self,
        slot: u8,
        algorithm: TokenAlgorithm,
        pin: PinPolicy,
        touch: TouchPolicy,
    ) -> Result<RsaPublicKey> {
        assert_eq!(slot, crate::backend::SIGNING_SLOT);
        assert_eq!(algorithm, TokenAlgorithm::Rsa2048);
        assert_eq!(pin, PinPolicy::Once);
        assert_eq!(touch, TouchPolicy::Always);

        let key = new_rsa_key();
        let public_key = key.to_public_key();
        let mut tokens = self.tokens.lock().unwrap();
        tokens.slots.insert(self.serial, Some(SoftSlot::Rsa(key)));
        tokens.generated += 1;
        Ok(public_key)
    }

    fn sign_digest(&mut self, slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>> {
        assert_eq!(slot, crate::backend::SIGNING_SLOT);
        let tokens = self.tokens.lock().unwrap();
        let Some(Some(SoftSlot::Rsa(key))) = tokens.slots.get(&self.serial) else {
            return Err(Error::Token("slot is empty".into()));
        };
        key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|err| Error::Token(err.to_string()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordedPrompt {
    WaitingForToken,
    Touch(String),
}

/// Records prompts instead of showing them.
#[derive(Default)]
pub struct RecordingPresence {
    prompts: Mutex<Vec<RecordedPrompt>>,
}

impl RecordingPresence {
    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.prompts.lock().unwrap().clone()
    }
}

impl UserPresence for RecordingPresence {
    fn waiting_for_token(&self, _timeout: Duration) {
        self.prompts
            .lock()
            .unwrap()
            .push(RecordedPrompt::WaitingForToken);
    }

    fn touch_required(&self, description: &str) {
        self.prompts
            .lock()
            .unwrap()
            .push(RecordedPrompt::Touch(description.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_var::EFI_TIME_SIZE;
    use crate::efivars::SECURE_BOOT_ATTRIBUTES;
    use crate::pe::Image;
    use crate::signature::WIN_CERT_HEADER_SIZE;

    /// Test that the fixture executable parses.
    #[test]
    fn test_minimal_pe() {
        let image = Image::parse(&minimal_pe()).unwrap();
        assert!(image.certificates().unwrap().is_empty());
    }

    /// Test the simulated firmware's setup mode handling.
    #[test]
    fn test_simulated_firmware() -> anyhow::Result<()> {
        let env = TestEnv::enrolled()?;
        let status = crate::efivars::SecureBootStatus::read(env.state.vars.as_ref())?;
        assert!(!status.setup_mode);
        assert!(status.secure_boot);
        Ok(())
    }

    /// Test that the simulated firmware accepts an update signed by an
    /// external tool, and only when the signer is enrolled.
    #[test]
    fn test_simulated_firmware_known_update() -> anyhow::Result<()> {
        let update = include_bytes!("../test_data/db.auth");
        let kek_der = fixture_key(Role::Kek).certificate_der()?;
        // Any other certificate serves as PK.
        let pk_der = fixture_key(Role::Db).certificate_der()?;
        let db = SecureBootVariable::Db;

        let mut firmware = SimulatedFirmware::new();
        let mut pk = SignatureDatabase::new();
        pk.append(SignatureType::X509, TEST_OWNER, &pk_der)?;
        firmware.set_unauthenticated(SecureBootVariable::Pk, &pk)?;

        // The KEK that signed the update is not enrolled yet.
        assert!(matches!(
            firmware.write(db.name(), db.vendor(), SECURE_BOOT_ATTRIBUTES, update),
            Err(Error::UnauthorizedUpdate(_))
        ));

        let mut kek = SignatureDatabase::new();
        kek.append(SignatureType::X509, TEST_OWNER, &kek_der)?;
        firmware.set_unauthenticated(SecureBootVariable::Kek, &kek)?;
        firmware.write(db.name(), db.vendor(), SECURE_BOOT_ATTRIBUTES, update)?;
        assert_eq!(firmware.write_log(), ["db"]);
        Ok(())
    }

    /// Test that updates whose certificate is not PKCS#7 are rejected,
    /// even in setup mode.
    #[test]
    fn test_simulated_firmware_cert_type() -> anyhow::Result<()> {
        let mut update = include_bytes!("../test_data/db.auth").to_vec();
        let db = SecureBootVariable::Db;
        let mut firmware = SimulatedFirmware::new();
        assert!(firmware.setup_mode());

        // CertType follows the timestamp and the WIN_CERTIFICATE header.
        let cert_type = EFI_TIME_SIZE + WIN_CERT_HEADER_SIZE;
        update[cert_type] ^= 0xff;
        assert!(matches!(
            firmware.write(db.name(), db.vendor(), SECURE_BOOT_ATTRIBUTES, &update),
            Err(Error::Firmware { .. })
        ));

        // A PKCS#7 GUID with garbage in place of the signature.
        update[cert_type] ^= 0xff;
        update[cert_type + 16] = 0;
        assert!(matches!(
            firmware.write(db.name(), db.vendor(), SECURE_BOOT_ATTRIBUTES, &update),
            Err(Error::Firmware { .. })
        ));
        assert!(firmware.write_log().is_empty());
        Ok(())
    }
}
