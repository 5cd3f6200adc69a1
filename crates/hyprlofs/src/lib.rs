// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Administrative control of hyprlofs mounts.
//!
//! hyprlofs is a stacking filesystem that exposes a table of name → real path
//! mappings as files under its mountpoint. This crate mounts and unmounts it,
//! edits the table through the filesystem's control ioctls and reads the table
//! back. [`Filesystem`] is the entry point: it runs every operation on a tokio
//! blocking-pool worker and admits at most one operation per mountpoint at a
//! time.
//!
//! ```no_run
//! # async fn demo() -> Result<(), hyprlofs::Error> {
//! use hyprlofs::{Filesystem, HyprlofsConfig};
//!
//! let fs = Filesystem::new("/vfs", HyprlofsConfig::default());
//! fs.mount()?.await?;
//! fs.add_mappings([("/etc/hosts", "hosts")])?.await?;
//! for mapping in fs.list_mappings()?.await? {
//!     println!("{} -> {}", mapping.name, mapping.path);
//! }
//! # Ok(())
//! # }
//! ```

/// Emit a tracing event at INFO when `$enabled`, TRACE otherwise.
macro_rules! debug_event {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            ::tracing::info!($($arg)+)
        } else {
            ::tracing::trace!($($arg)+)
        }
    };
}

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod listing;
pub mod sequencer;
pub mod sim;
pub mod sys;

pub use channel::{ChannelState, ControlChannel, ControlStatus};
pub use codec::{EntryBuffer, EntryRef, Mapping};
pub use config::{HyprlofsConfig, ListingPolicy, MountOptions};
pub use error::{Error, Field, OsError, Result, ValidationError};
pub use handle::{MountHandle, Operation, OperationKind, OperationResult, Outcome};
pub use sequencer::{CompletionTarget, Filesystem, FromOutcome, Pending};
pub use sim::{SimCall, SimDescriptor, SimulatedPlatform};
pub use sys::{ControlCommand, ControlRequest, ListingBuffer, Platform, SystemPlatform};
