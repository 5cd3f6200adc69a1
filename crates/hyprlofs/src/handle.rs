// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One mountpoint: its label, control channel and mount settings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;

use crate::channel::{ControlChannel, ControlStatus, control_op_name};
use crate::codec::{EntryBuffer, Mapping};
use crate::config::{HyprlofsConfig, ListingPolicy, MountOptions};
use crate::error::OsError;
use crate::listing;
use crate::sys::{ControlCommand, ControlRequest, Platform};

pub const OP_MOUNT: &str = "hyprlofs mount";
pub const OP_UNMOUNT: &str = "hyprlofs umount";

/// The administrative operations a handle can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Mount,
    Unmount,
    AddMappings,
    RemoveMappings,
    RemoveAll,
    ListMappings,
}

impl OperationKind {
    /// Caller-facing method name, used as the prefix of synchronous errors.
    pub fn method(self) -> &'static str {
        match self {
            OperationKind::Mount => "mount",
            OperationKind::Unmount => "unmount",
            OperationKind::AddMappings => "addMappings",
            OperationKind::RemoveMappings => "removeMappings",
            OperationKind::RemoveAll => "removeAll",
            OperationKind::ListMappings => "listMappings",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// An operation together with the payload it owns until it has run.
#[derive(Debug)]
pub enum Operation {
    Mount,
    Unmount,
    AddMappings(EntryBuffer),
    RemoveMappings(EntryBuffer),
    RemoveAll,
    ListMappings,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Mount => OperationKind::Mount,
            Operation::Unmount => OperationKind::Unmount,
            Operation::AddMappings(_) => OperationKind::AddMappings,
            Operation::RemoveMappings(_) => OperationKind::RemoveMappings,
            Operation::RemoveAll => OperationKind::RemoveAll,
            Operation::ListMappings => OperationKind::ListMappings,
        }
    }
}

/// What a successful operation hands to its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Listing(Vec<Mapping>),
}

/// Result of running one operation, as recorded by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    op: String,
    return_code: i32,
    errno: Option<Errno>,
    listing: Option<Vec<Mapping>>,
}

impl OperationResult {
    fn completed(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            return_code: 0,
            errno: None,
            listing: None,
        }
    }

    fn from_result(op: &str, result: Result<(), OsError>) -> Self {
        match result {
            Ok(()) => Self::completed(op),
            Err(err) => err.into(),
        }
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn return_code(&self) -> i32 {
        self.return_code
    }

    pub fn errno(&self) -> Option<Errno> {
        self.errno
    }

    pub fn listing(&self) -> Option<&[Mapping]> {
        self.listing.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.errno.is_none()
    }

    /// Turn the recorded result into what the completion receives.
    pub fn into_outcome(self, label: &Path) -> Result<Outcome, OsError> {
        match (self.errno, self.listing) {
            (Some(errno), _) => Err(OsError::new(self.op, label, errno)),
            (None, Some(listing)) => Ok(Outcome::Listing(listing)),
            (None, None) => Ok(Outcome::Completed),
        }
    }
}

impl From<ControlStatus> for OperationResult {
    fn from(status: ControlStatus) -> Self {
        Self {
            op: status.op().to_string(),
            return_code: status.return_code(),
            errno: status.errno(),
            listing: None,
        }
    }
}

impl From<OsError> for OperationResult {
    fn from(err: OsError) -> Self {
        ControlStatus::from(err).into()
    }
}

/// State owned by one mountpoint. Only the operation currently running on it
/// ever touches it.
pub struct MountHandle<P: Platform> {
    platform: Arc<P>,
    channel: ControlChannel<P>,
    options: MountOptions,
    listing: ListingPolicy,
    debug: bool,
}

impl<P: Platform> MountHandle<P> {
    pub fn new(platform: Arc<P>, label: impl Into<PathBuf>, config: &HyprlofsConfig) -> Self {
        let channel = ControlChannel::new(Arc::clone(&platform), label, config.debug);
        Self {
            platform,
            channel,
            options: config.mount.clone(),
            listing: config.listing,
            debug: config.debug,
        }
    }

    pub fn label(&self) -> &Path {
        self.channel.label()
    }

    pub fn channel(&self) -> &ControlChannel<P> {
        &self.channel
    }

    /// Mount hyprlofs at the label. The control descriptor is left alone.
    pub fn mount(&mut self) -> Result<(), OsError> {
        debug_event!(
            self.debug,
            operation = "mount",
            mountpoint = %self.label().display(),
            fstype = %self.options.fstype,
            options = %self.options.options,
            "hyprlofs mount"
        );
        let result = self.platform.mount(self.channel.label(), &self.options);
        debug_event!(
            self.debug,
            operation = "mount_result",
            mountpoint = %self.label().display(),
            return_code = if result.is_ok() { 0 } else { -1 },
            error = ?result.err(),
            options = %self.options.options,
            "hyprlofs mount returned"
        );
        result.map_err(|errno| OsError::new(OP_MOUNT, self.channel.label(), errno))
    }

    /// Close the control descriptor, then unmount the label.
    pub fn unmount(&mut self) -> Result<(), OsError> {
        self.channel.close();
        debug_event!(
            self.debug,
            operation = "unmount",
            mountpoint = %self.label().display(),
            "hyprlofs umount"
        );
        let result = self.platform.unmount(self.channel.label());
        debug_event!(
            self.debug,
            operation = "unmount_result",
            mountpoint = %self.label().display(),
            return_code = if result.is_ok() { 0 } else { -1 },
            error = ?result.err(),
            "hyprlofs umount returned"
        );
        result.map_err(|errno| OsError::new(OP_UNMOUNT, self.channel.label(), errno))
    }

    pub fn add(&mut self, entries: &EntryBuffer) -> Result<(), OsError> {
        self.control(ControlRequest::AddEntries(entries))
    }

    pub fn remove(&mut self, entries: &EntryBuffer) -> Result<(), OsError> {
        self.control(ControlRequest::RemoveEntries(entries))
    }

    pub fn remove_all(&mut self) -> Result<(), OsError> {
        self.control(ControlRequest::RemoveAll)
    }

    pub fn list(&mut self) -> Result<Vec<Mapping>, OsError> {
        listing::list(&mut self.channel, self.listing)
    }

    fn control(&mut self, request: ControlRequest<'_>) -> Result<(), OsError> {
        self.channel
            .control(request)
            .into_result(self.channel.label())
            .map(drop)
    }

    /// Run `operation` to completion. The payload is released before this
    /// returns.
    pub fn execute(&mut self, operation: Operation) -> OperationResult {
        match operation {
            Operation::Mount => OperationResult::from_result(OP_MOUNT, self.mount()),
            Operation::Unmount => OperationResult::from_result(OP_UNMOUNT, self.unmount()),
            Operation::AddMappings(entries) => {
                self.channel.control(ControlRequest::AddEntries(&entries)).into()
            }
            Operation::RemoveMappings(entries) => {
                self.channel.control(ControlRequest::RemoveEntries(&entries)).into()
            }
            Operation::RemoveAll => self.channel.control(ControlRequest::RemoveAll).into(),
            Operation::ListMappings => match self.list() {
                Ok(mappings) => OperationResult {
                    listing: Some(mappings),
                    ..OperationResult::completed(control_op_name(ControlCommand::GetEntries))
                },
                Err(err) => err.into(),
            },
        }
    }
}

impl<P: Platform> fmt::Debug for MountHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountHandle")
            .field("label", &self.label())
            .field("open", &self.channel.is_open())
            .field("debug", &self.debug)
            .finish()
    }
}
