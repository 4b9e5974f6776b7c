// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The contents of a whole signature database variable.

use crate::list::SignatureList;
use crate::{Error, Result, SignatureEntry, SignatureType};
use alloc::vec::Vec;
use uguid::Guid;

/// Ordered sequence of signature lists, as stored in one of the `PK`,
/// `KEK`, `db`, or `dbx` variables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignatureDatabase {
    lists: Vec<SignatureList>,
}

impl SignatureDatabase {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the raw contents of a signature database variable. Empty
    /// input is a valid empty database.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let mut lists = Vec::new();
        while !data.is_empty() {
            let (list, len) = SignatureList::parse(data)?;
            lists.push(list);
            data = &data[len..];
        }
        Ok(Self { lists })
    }

    /// Encode the database in the variable format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for list in &self.lists {
            list.write_to(&mut out)?;
        }
        Ok(out)
    }

    /// Signature lists in the database.
    #[must_use]
    pub fn lists(&self) -> &[SignatureList] {
        &self.lists
    }

    /// Iterate over all entries along with their type.
    pub fn entries(&self) -> impl Iterator<Item = (SignatureType, &SignatureEntry)> {
        self.lists.iter().flat_map(|list| {
            list.entries()
                .iter()
                .map(move |entry| (list.signature_type(), entry))
        })
    }

    /// Total number of entries across all lists.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.iter().map(|list| list.entries().len()).sum()
    }

    /// Whether the database has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any entry of `signature_type` has exactly `data` as its
    /// payload, regardless of owner.
    #[must_use]
    pub fn contains(&self, signature_type: SignatureType, data: &[u8]) -> bool {
        self.entries()
            .any(|(t, entry)| t == signature_type && entry.data == data)
    }

    /// Add an entry.
    ///
    /// If an entry with the same type, owner, and payload already
    /// exists, nothing is changed and `false` is returned. Otherwise the
    /// entry is added to an existing compatible list, or to a new list
    /// at the end of the database, and `true` is returned.
    pub fn append(
        &mut self,
        signature_type: SignatureType,
        owner: Guid,
        data: &[u8],
    ) -> Result<bool> {
        let duplicate = self
            .entries()
            .any(|(t, entry)| t == signature_type && entry.owner == owner && entry.data == data);
        if duplicate {
            return Ok(false);
        }

        let entry = SignatureEntry::new(owner, data.to_vec());
        if let Some(list) = self
            .lists
            .iter_mut()
            .find(|list| list.accepts(signature_type, data.len()))
        {
            list.push(entry);
        } else {
            let mut list = SignatureList::new(signature_type, data.len())?;
            list.push(entry);
            self.lists.push(list);
        }
        Ok(true)
    }

    /// Remove the first entry of `signature_type` whose payload is
    /// `data`. A list left empty by the removal is dropped.
    ///
    /// Returns [`Error::NotFound`] if there is no such entry.
    pub fn remove(&mut self, signature_type: SignatureType, data: &[u8]) -> Result<SignatureEntry> {
        let (list_index, entry_index) = self
            .lists
            .iter()
            .enumerate()
            .filter(|(_, list)| list.signature_type() == signature_type)
            .find_map(|(list_index, list)| {
                list.entries()
                    .iter()
                    .position(|entry| entry.data == data)
                    .map(|entry_index| (list_index, entry_index))
            })
            .ok_or(Error::NotFound)?;

        let list = &mut self.lists[list_index];
        let removed = list.entries_mut().remove(entry_index);
        if list.entries().is_empty() {
            self.lists.remove(list_index);
        }
        Ok(removed)
    }
}
