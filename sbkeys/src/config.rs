// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::backend::{BackendContext, BackendKind};
use crate::efivars::EfiVariables;
use crate::fs::Fs;
use crate::hierarchy::{KeyHierarchy, KeyPaths, Role};
use crate::{guid, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uguid::Guid;

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sbkeys/config.toml";

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    keydir: Utf8PathBuf,
    guid_path: Utf8PathBuf,
    files_db: Utf8PathBuf,

    /// Where key rotation backs up the old keys. If not set, a
    /// timestamped directory next to `keydir` is used.
    #[serde(default)]
    backup_dir: Option<Utf8PathBuf>,

    /// How long to wait for a hardware token to be inserted.
    token_timeout_secs: u64,

    keys: KeysConfig,
}

/// Backend used for each role.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeysConfig {
    pk: KeyConfig,
    kek: KeyConfig,
    db: KeyConfig,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    pub backend: BackendKind,
}

impl KeysConfig {
    /// Use the same backend for every role.
    pub fn uniform(backend: BackendKind) -> Self {
        let key = KeyConfig { backend };
        Self {
            pk: key,
            kek: key,
            db: key,
        }
    }

    pub fn backend(&self, role: Role) -> BackendKind {
        match role {
            Role::Pk => self.pk.backend,
            Role::Kek => self.kek.backend,
            Role::Db => self.db.backend,
        }
    }

    pub fn set_backend(&mut self, role: Role, backend: BackendKind) {
        let key = match role {
            Role::Pk => &mut self.pk,
            Role::Kek => &mut self.kek,
            Role::Db => &mut self.db,
        };
        key.backend = backend;
    }
}

impl Config {
    pub fn load(fs: &Fs, path: &Utf8Path) -> Result<Config> {
        let src = fs.read_to_string(path)?;
        Config::parse(&src)
    }

    pub fn parse(src: &str) -> Result<Config> {
        Ok(toml::de::from_str(src)?)
    }

    /// Config with every file kept under `root`. Mostly useful for
    /// tests and for staging keys outside of the system directories.
    pub fn with_root(root: &Utf8Path, keys: KeysConfig) -> Config {
        Config {
            keydir: root.join("keys"),
            guid_path: root.join("GUID"),
            files_db: root.join("files.json"),
            backup_dir: None,
            token_timeout_secs: 90,
            keys,
        }
    }

    pub fn keydir(&self) -> &Utf8Path {
        &self.keydir
    }

    pub fn key_paths(&self, role: Role) -> KeyPaths {
        KeyPaths::new(&self.keydir, role)
    }

    pub fn guid_path(&self) -> &Utf8Path {
        &self.guid_path
    }

    pub fn files_db_path(&self) -> &Utf8Path {
        &self.files_db
    }

    pub fn keys(&self) -> &KeysConfig {
        &self.keys
    }

    pub fn set_keys(&mut self, keys: KeysConfig) {
        self.keys = keys;
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }

    /// Get the directory that key rotation backs up the current keys
    /// into.
    ///
    /// For example, with the default config this returns a path like:
    ///
    /// ```text
    /// /var/lib/sbkeys/keys.backup-1729300000
    /// ```
    pub fn backup_dir(&self, now: SystemTime) -> Utf8PathBuf {
        if let Some(dir) = &self.backup_dir {
            return dir.clone();
        }
        let secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let name = self.keydir.file_name().unwrap_or("keys");
        self.keydir.with_file_name(format!("{name}.backup-{secs}"))
    }
}

/// Everything an operation needs to touch the outside world.
///
/// Tests build this from a temporary directory, simulated firmware
/// variables, and software TPM and token doubles.
pub struct State {
    pub config: Config,
    pub fs: Fs,
    pub vars: Box<dyn EfiVariables>,
    pub backends: BackendContext,
}

impl State {
    pub fn new(
        config: Config,
        fs: Fs,
        vars: Box<dyn EfiVariables>,
        mut backends: BackendContext,
    ) -> Self {
        backends.token_timeout = config.token_timeout();
        Self {
            config,
            fs,
            vars,
            backends,
        }
    }

    /// Owner GUID recorded with every enrolled signature.
    pub fn owner_guid(&self) -> Result<Guid> {
        guid::read_or_create(&self.fs, self.config.guid_path())
    }

    /// Load the persisted key hierarchy using the configured backends.
    pub fn load_hierarchy(&self) -> Result<KeyHierarchy> {
        KeyHierarchy::load_all(
            &self.fs,
            self.config.keydir(),
            self.config.keys(),
            &self.backends,
        )
    }
}
