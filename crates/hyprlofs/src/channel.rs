// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Control channel: the cached descriptor through which hyprlofs ioctls are
//! issued.
//!
//! The descriptor moves `Closed → Open` lazily on first use and back to
//! `Closed` on explicit [`ControlChannel::close`] or when the kernel answers a
//! control request with `ENOTTY`, meaning the descriptor no longer refers to a
//! hyprlofs mount (typically because the filesystem was unmounted and
//! remounted underneath it). The next request reopens it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;

use crate::error::OsError;
use crate::sys::{ControlCommand, ControlRequest, Platform};

pub const OP_OPEN: &str = "hyprlofs open";

/// Descriptor state of a [`ControlChannel`].
#[derive(Debug)]
pub enum ChannelState<D> {
    Closed,
    Open(D),
}

/// Raw outcome of a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlStatus {
    op: String,
    return_code: i32,
    errno: Option<Errno>,
}

impl ControlStatus {
    pub fn success(op: impl Into<String>, return_code: i32) -> Self {
        Self {
            op: op.into(),
            return_code,
            errno: None,
        }
    }

    pub fn failure(op: impl Into<String>, errno: Errno) -> Self {
        Self {
            op: op.into(),
            return_code: -1,
            errno: Some(errno),
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

    pub fn is_success(&self) -> bool {
        self.errno.is_none()
    }

    pub fn into_result(self, label: &Path) -> Result<i32, OsError> {
        match self.errno {
            None => Ok(self.return_code),
            Some(errno) => Err(OsError::new(self.op, label, errno)),
        }
    }
}

impl From<OsError> for ControlStatus {
    fn from(err: OsError) -> Self {
        Self::failure(err.op(), err.errno())
    }
}

pub fn control_op_name(command: ControlCommand) -> String {
    format!("hyprlofs ioctl {}", command.name())
}

pub struct ControlChannel<P: Platform> {
    platform: Arc<P>,
    label: PathBuf,
    debug: bool,
    state: ChannelState<P::Descriptor>,
}

impl<P: Platform> ControlChannel<P> {
    pub fn new(platform: Arc<P>, label: impl Into<PathBuf>, debug: bool) -> Self {
        Self {
            platform,
            label: label.into(),
            debug,
            state: ChannelState::Closed,
        }
    }

    pub fn label(&self) -> &Path {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open(_))
    }

    /// Open the mountpoint if no descriptor is cached.
    pub fn ensure_open(&mut self) -> Result<(), OsError> {
        let descriptor = self.take_or_open()?;
        self.state = ChannelState::Open(descriptor);
        Ok(())
    }

    /// Issue `request`, opening the descriptor first if needed.
    pub fn control(&mut self, request: ControlRequest<'_>) -> ControlStatus {
        let command = request.command();
        let descriptor = match self.take_or_open() {
            Ok(descriptor) => descriptor,
            Err(err) => return err.into(),
        };

        debug_event!(
            self.debug,
            operation = "channel_control",
            mountpoint = %self.label.display(),
            command = command.name(),
            "hyprlofs ioctl"
        );
        if let Some(entries) = request.entries() {
            for (index, entry) in entries.iter().enumerate() {
                debug_event!(
                    self.debug,
                    operation = "channel_control_entry",
                    mountpoint = %self.label.display(),
                    command = command.name(),
                    index,
                    path = %entry.path.map(|p| p.to_string_lossy()).unwrap_or_default(),
                    name = %entry.name.to_string_lossy(),
                    "mapping"
                );
            }
        }

        let op = control_op_name(command);
        let status = match self.platform.control(&descriptor, request) {
            Ok(return_code) => ControlStatus::success(op, return_code),
            Err(errno) => ControlStatus::failure(op, errno),
        };
        debug_event!(
            self.debug,
            operation = "channel_control_result",
            mountpoint = %self.label.display(),
            command = command.name(),
            return_code = status.return_code(),
            error = ?status.errno(),
            "hyprlofs ioctl returned"
        );

        if status.errno() == Some(Errno::ENOTTY) {
            self.discard(descriptor);
        } else {
            self.state = ChannelState::Open(descriptor);
        }
        status
    }

    /// Close the cached descriptor, if any. Returns whether one was open.
    pub fn close(&mut self) -> bool {
        match std::mem::replace(&mut self.state, ChannelState::Closed) {
            ChannelState::Open(descriptor) => {
                self.discard(descriptor);
                true
            }
            ChannelState::Closed => false,
        }
    }

    fn take_or_open(&mut self) -> Result<P::Descriptor, OsError> {
        match std::mem::replace(&mut self.state, ChannelState::Closed) {
            ChannelState::Open(descriptor) => Ok(descriptor),
            ChannelState::Closed => {
                debug_event!(
                    self.debug,
                    operation = "channel_open",
                    mountpoint = %self.label.display(),
                    "hyprlofs open"
                );
                self.platform.open_control(&self.label).map_err(|errno| {
                    debug_event!(
                        self.debug,
                        operation = "channel_open_failed",
                        mountpoint = %self.label.display(),
                        error = %errno.desc(),
                        "hyprlofs open failed"
                    );
                    OsError::new(OP_OPEN, &self.label, errno)
                })
            }
        }
    }

    fn discard(&self, descriptor: P::Descriptor) {
        debug_event!(
            self.debug,
            operation = "channel_close",
            mountpoint = %self.label.display(),
            "hyprlofs close"
        );
        drop(descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::MountOptions;
    use crate::sim::SimulatedPlatform;

    fn mounted(label: &str) -> Arc<SimulatedPlatform> {
        let sim = Arc::new(SimulatedPlatform::new());
        sim.create_dir(label);
        sim.mount(Path::new(label), &MountOptions::default()).unwrap();
        sim
    }

    #[test]
    fn opens_lazily_and_reuses_descriptor() {
        let sim = mounted("/vfs");
        let mut channel = ControlChannel::new(sim.clone(), "/vfs", false);
        assert!(!channel.is_open());
        assert_eq!(sim.opens("/vfs"), 0);

        assert!(channel.control(ControlRequest::RemoveAll).is_success());
        assert!(channel.is_open());
        channel.ensure_open().unwrap();
        assert!(channel.control(ControlRequest::RemoveAll).is_success());
        assert_eq!(sim.opens("/vfs"), 1);
        assert_eq!(sim.open_descriptors("/vfs"), 1);
    }

    #[test]
    fn open_failure_is_reported_as_open() {
        let sim = Arc::new(SimulatedPlatform::new());
        let mut channel = ControlChannel::new(sim, "/missing", false);
        let status = channel.control(ControlRequest::RemoveAll);
        assert_eq!(status.op(), OP_OPEN);
        assert_eq!(status.return_code(), -1);
        assert_eq!(status.errno(), Some(Errno::ENOENT));
        assert!(!channel.is_open());
    }

    #[test]
    fn stale_descriptor_is_discarded_and_reopened() {
        let sim = mounted("/vfs");
        let mut channel = ControlChannel::new(sim.clone(), "/vfs", true);
        channel.ensure_open().unwrap();

        // Remount underneath the cached descriptor.
        sim.force_remount("/vfs");
        let status = channel.control(ControlRequest::RemoveAll);
        assert_eq!(status.op(), "hyprlofs ioctl CLEAR");
        assert_eq!(status.errno(), Some(Errno::ENOTTY));
        assert!(!channel.is_open());
        assert_eq!(sim.open_descriptors("/vfs"), 0);

        let entries = codec::encode_add([("/etc/hosts", "hosts")]).unwrap();
        assert!(channel.control(ControlRequest::AddEntries(&entries)).is_success());
        assert_eq!(sim.opens("/vfs"), 2);
        assert_eq!(sim.entries("/vfs").len(), 1);
    }

    #[test]
    fn other_failures_keep_descriptor() {
        let sim = mounted("/vfs");
        let mut channel = ControlChannel::new(sim.clone(), "/vfs", false);
        let entries = codec::encode_remove(["absent"]).unwrap();
        let status = channel.control(ControlRequest::RemoveEntries(&entries));
        assert_eq!(status.errno(), Some(Errno::ENOENT));
        assert!(channel.is_open());

        let err = status.into_result(channel.label()).unwrap_err();
        assert_eq!(err.op(), "hyprlofs ioctl REMOVE");
    }

    #[test]
    fn close_releases_descriptor() {
        let sim = mounted("/vfs");
        let mut channel = ControlChannel::new(sim.clone(), "/vfs", false);
        assert!(!channel.close());
        channel.ensure_open().unwrap();
        assert_eq!(sim.open_descriptors("/vfs"), 1);
        assert!(channel.close());
        assert_eq!(sim.open_descriptors("/vfs"), 0);
    }
}
