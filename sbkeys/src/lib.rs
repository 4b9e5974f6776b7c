// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! UEFI Secure Boot key management.
//!
//! This crate creates and stores the Platform Key, Key Exchange Key and
//! db key, enrolls them into the firmware's signature databases, signs
//! EFI executables with the db key, and rotates keys.
//!
//! Keys can be kept in files, sealed to a TPM, or held in a hardware
//! token; see [`backend`]. Everything that touches the system goes
//! through a [`State`], so the same code runs against the real
//! firmware or against test doubles.

pub mod auth_var;
pub mod backend;
pub mod certificate;
pub mod config;
pub mod efivars;
mod error;
pub mod fs;
pub mod guid;
pub mod hierarchy;
pub mod oprom;
pub mod pe;
pub mod rotation;
pub mod signature;
pub mod signing;
pub mod sync;
pub mod tracking;

#[cfg(test)]
mod testing;

pub use backend::{BackendContext, BackendKind, KeyBackend};
pub use config::{Config, KeysConfig, State};
pub use error::{Error, Result, RotationError, RotationStage};
pub use hierarchy::{KeyHierarchy, Role};
pub use signing::{FileSigner, SignOutcome};
