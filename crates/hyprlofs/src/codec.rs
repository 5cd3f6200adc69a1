// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Conversion between caller mappings and the control interface's entry lists.
//!
//! An [`EntryBuffer`] owns a private copy of every path and name it carries, so
//! the caller's strings can be dropped as soon as an encode returns. Encoding
//! is all-or-nothing: the first malformed element aborts the encode and every
//! string copied so far is released with the partially built vector.

use std::ffi::{CStr, CString};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Field, ValidationError};

/// A virtual name exposed in the mountpoint, backed by a real path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mapping {
    pub path: String,
    pub name: String,
}

impl Mapping {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

impl<P: Into<String>, N: Into<String>> From<(P, N)> for Mapping {
    fn from((path, name): (P, N)) -> Self {
        Self::new(path, name)
    }
}

#[derive(Debug)]
struct Entry {
    path: Option<CString>,
    name: CString,
}

/// Borrowed view of one entry inside an [`EntryBuffer`].
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    pub path: Option<&'a CStr>,
    pub name: &'a CStr,
}

/// Owned entry list handed to `ADD_ENTRIES` / `REMOVE_ENTRIES`.
#[derive(Debug, Default)]
pub struct EntryBuffer {
    entries: Vec<Entry>,
}

impl EntryBuffer {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = EntryRef<'_>> + '_ {
        self.entries.iter().map(|entry| EntryRef {
            path: entry.path.as_deref(),
            name: entry.name.as_c_str(),
        })
    }
}

/// Encode `(path, name)` pairs for `ADD_ENTRIES`.
pub fn encode_add<I, P, N>(pairs: I) -> Result<EntryBuffer, ValidationError>
where
    I: IntoIterator<Item = (P, N)>,
    P: AsRef<str>,
    N: AsRef<str>,
{
    let pairs = pairs.into_iter();
    let mut entries = Vec::with_capacity(pairs.size_hint().0);
    for (index, (path, name)) in pairs.enumerate() {
        entries.push(Entry {
            path: Some(owned_cstring(index, Field::Path, path.as_ref())?),
            name: owned_cstring(index, Field::Name, name.as_ref())?,
        });
    }
    Ok(EntryBuffer { entries })
}

/// Encode names for `REMOVE_ENTRIES`.
pub fn encode_remove<I, S>(names: I) -> Result<EntryBuffer, ValidationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let names = names.into_iter();
    let mut entries = Vec::with_capacity(names.size_hint().0);
    for (index, name) in names.enumerate() {
        entries.push(Entry {
            path: None,
            name: owned_cstring(index, Field::Name, name.as_ref())?,
        });
    }
    Ok(EntryBuffer { entries })
}

/// Encode loosely-typed input of the form `[["/real/path", "name"], ...]`.
pub fn encode_add_value(value: &Value) -> Result<EntryBuffer, ValidationError> {
    let items = value.as_array().ok_or(ValidationError::NotAnArray)?;
    let mut pairs = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match item.as_array().map(Vec::as_slice) {
            Some([Value::String(path), Value::String(name)]) => pairs.push((path, name)),
            _ => return Err(ValidationError::MalformedPair { index }),
        }
    }
    encode_add(pairs)
}

/// Encode loosely-typed input of the form `["name", ...]`.
pub fn encode_remove_value(value: &Value) -> Result<EntryBuffer, ValidationError> {
    let items = value.as_array().ok_or(ValidationError::NotAnArray)?;
    let mut names = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match item {
            Value::String(name) => names.push(name),
            _ => return Err(ValidationError::MalformedName { index }),
        }
    }
    encode_remove(names)
}

/// Release a buffer and every string it owns. `None` is a no-op.
pub fn free(buffer: Option<EntryBuffer>) {
    drop(buffer);
}

fn owned_cstring(index: usize, field: Field, text: &str) -> Result<CString, ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::Empty { index, field });
    }
    CString::new(text).map_err(|_| ValidationError::InteriorNul { index, field })
}
