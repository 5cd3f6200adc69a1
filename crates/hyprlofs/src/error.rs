// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error taxonomy for hyprlofs administration.
//!
//! Validation, busy and completion-target errors are raised synchronously when
//! an operation is submitted. Everything that happens inside a worker reaches
//! the caller through the single completion as [`Error::Os`].

use std::fmt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

/// Caller input that cannot be turned into an entry buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("expected array")]
    NotAnArray,
    #[error("element {index}: expected a [path, name] pair of strings")]
    MalformedPair { index: usize },
    #[error("element {index}: expected a name string")]
    MalformedName { index: usize },
    #[error("element {index}: {field} must not be empty")]
    Empty { index: usize, field: Field },
    #[error("element {index}: {field} contains a NUL byte")]
    InteriorNul { index: usize, field: Field },
}

/// Which half of a mapping a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Path,
    Name,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Path => write!(f, "path"),
            Field::Name => write!(f, "name"),
        }
    }
}

/// A failed syscall or control request, with enough context to diagnose it
/// without looking at handle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsError {
    op: String,
    label: PathBuf,
    errno: Errno,
}

impl OsError {
    pub fn new(op: impl Into<String>, label: impl Into<PathBuf>, errno: Errno) -> Self {
        Self {
            op: op.into(),
            label: label.into(),
            errno,
        }
    }

    /// Name of the failing operation, e.g. `hyprlofs ioctl ADD`.
    pub fn op(&self) -> &str {
        &self.op
    }

    /// Mountpoint the operation was issued against.
    pub fn label(&self) -> &Path {
        &self.label
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}': {} ({:?})",
            self.op,
            self.label.display(),
            self.errno.desc(),
            self.errno
        )
    }
}

impl std::error::Error for OsError {}

/// Errors surfaced by [`crate::Filesystem`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op}: invalid mappings: {source}")]
    Validation {
        op: &'static str,
        #[source]
        source: ValidationError,
    },
    #[error("{op}: operation already in progress")]
    Busy { op: &'static str },
    #[error("{op}: expected callback argument")]
    InvalidCompletion { op: &'static str },
    #[error("{op}: no async runtime available to run the operation")]
    NoRuntime { op: &'static str },
    #[error(transparent)]
    Os(#[from] OsError),
    #[error("{op}: worker panicked before completing the operation")]
    WorkerPanicked { op: &'static str },
    #[error("{op}: completion was dropped without a result")]
    Abandoned { op: &'static str },
}

impl Error {
    /// The OS error code, when the failure came from a syscall.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os(err) => Some(err.errno()),
            _ => None,
        }
    }

    /// True for the errors raised before an operation is admitted.
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. }
                | Error::Busy { .. }
                | Error::InvalidCompletion { .. }
                | Error::NoRuntime { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
