// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fetching the current mapping table with `GET_ENTRIES`.
//!
//! The table size is unknown up front and may grow between measuring it and
//! fetching it. A zero-capacity call measures; the kernel answers `E2BIG` with
//! the current count whenever the supplied buffer is too small, and that count
//! sizes the next attempt. The receiving buffer of each attempt is dropped
//! before the next one is allocated.

use nix::errno::Errno;
use tracing::debug;

use crate::channel::{ControlChannel, control_op_name};
use crate::codec::Mapping;
use crate::config::ListingPolicy;
use crate::error::OsError;
use crate::sys::{ControlCommand, ControlRequest, ListingBuffer, Platform};

/// List the mappings of the mount behind `channel`, in channel order.
pub fn list<P: Platform>(
    channel: &mut ControlChannel<P>,
    policy: ListingPolicy,
) -> Result<Vec<Mapping>, OsError> {
    let mut measure = ListingBuffer::measure();
    let status = channel.control(ControlRequest::GetEntries(&mut measure));
    match status.errno() {
        None => return Ok(measure.mappings()),
        Some(Errno::E2BIG) => {}
        Some(errno) => return Err(OsError::new(status.op(), channel.label(), errno)),
    }

    let mut needed = measure.count();
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        if !policy.allows(attempt) {
            debug!(
                operation = "listing_retry_exhausted",
                mountpoint = %channel.label().display(),
                attempts = attempt - 1,
                "Mapping table kept growing; giving up"
            );
            return Err(get_error(channel, Errno::E2BIG));
        }

        let mut buffer =
            ListingBuffer::with_capacity(needed).map_err(|errno| get_error(channel, errno))?;
        let status = channel.control(ControlRequest::GetEntries(&mut buffer));
        match status.errno() {
            None => return Ok(buffer.mappings()),
            Some(Errno::E2BIG) => {
                debug!(
                    operation = "listing_retry",
                    mountpoint = %channel.label().display(),
                    attempt,
                    capacity = needed,
                    count = buffer.count(),
                    "Mapping table grew while fetching; retrying"
                );
                needed = buffer.count();
            }
            Some(errno) => return Err(OsError::new(status.op(), channel.label(), errno)),
        }
    }
}

fn get_error<P: Platform>(channel: &ControlChannel<P>, errno: Errno) -> OsError {
    OsError::new(
        control_op_name(ControlCommand::GetEntries),
        channel.label(),
        errno,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountOptions;
    use crate::sim::{SimCall, SimulatedPlatform};
    use std::path::Path;
    use std::sync::Arc;

    fn setup(
        mappings: &[(&str, &str)],
    ) -> (Arc<SimulatedPlatform>, ControlChannel<SimulatedPlatform>) {
        let sim = Arc::new(SimulatedPlatform::new());
        sim.create_dir("/vfs");
        sim.mount(Path::new("/vfs"), &MountOptions::default()).unwrap();
        for (path, name) in mappings {
            sim.insert("/vfs", path, name);
        }
        let channel = ControlChannel::new(sim.clone(), "/vfs", false);
        (sim, channel)
    }

    fn get_capacities(sim: &SimulatedPlatform) -> Vec<u32> {
        sim.calls()
            .into_iter()
            .filter_map(|call| match call {
                SimCall::Get { capacity } => Some(capacity),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_table_needs_one_call() {
        let (sim, mut channel) = setup(&[]);
        assert!(list(&mut channel, ListingPolicy::default()).unwrap().is_empty());
        assert_eq!(get_capacities(&sim), vec![0]);
    }

    #[test]
    fn measures_then_fetches_in_channel_order() {
        let (sim, mut channel) = setup(&[("/etc/passwd", "pw"), ("/etc/hosts", "hosts")]);
        let listing = list(&mut channel, ListingPolicy::default()).unwrap();
        assert_eq!(
            listing,
            vec![
                Mapping::new("/etc/passwd", "pw"),
                Mapping::new("/etc/hosts", "hosts")
            ]
        );
        assert_eq!(get_capacities(&sim), vec![0, 2]);
    }

    #[test]
    fn growth_between_measure_and_fetch_is_retried() {
        let (sim, mut channel) = setup(&[("/a", "a"), ("/b", "b")]);
        sim.grow_before_fetch("/vfs", vec![("/c".into(), "c".into())]);
        sim.grow_before_fetch("/vfs", vec![("/d".into(), "d".into()), ("/e".into(), "e".into())]);

        let listing = list(&mut channel, ListingPolicy::default()).unwrap();
        let names: Vec<_> = listing.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(get_capacities(&sim), vec![0, 2, 3, 5]);
    }

    #[test]
    fn shrink_between_measure_and_fetch_returns_what_remains() {
        let (sim, mut channel) = setup(&[("/a", "a"), ("/b", "b"), ("/c", "c")]);
        sim.shrink_before_fetch("/vfs", &["a", "c"]);

        let listing = list(&mut channel, ListingPolicy::default()).unwrap();
        assert_eq!(listing, vec![Mapping::new("/b", "b")]);
        assert_eq!(get_capacities(&sim), vec![0, 3]);
    }

    #[test]
    fn retry_bound_reports_too_long() {
        let (sim, mut channel) = setup(&[("/a", "a")]);
        for i in 0..10 {
            sim.grow_before_fetch("/vfs", vec![(format!("/g{i}"), format!("g{i}"))]);
        }
        let err = list(&mut channel, ListingPolicy { max_attempts: 3 }).unwrap_err();
        assert_eq!(err.errno(), Errno::E2BIG);
        assert_eq!(err.op(), "hyprlofs ioctl GET");
        assert_eq!(get_capacities(&sim), vec![0, 1, 2, 3]);
    }

    #[test]
    fn unbounded_policy_keeps_retrying() {
        let (sim, mut channel) = setup(&[("/a", "a")]);
        for i in 0..100 {
            sim.grow_before_fetch("/vfs", vec![(format!("/g{i}"), format!("g{i}"))]);
        }
        let listing = list(&mut channel, ListingPolicy::unbounded()).unwrap();
        assert_eq!(listing.len(), 101);
    }

    #[test]
    fn other_errors_abort_without_retry() {
        let (sim, mut channel) = setup(&[("/a", "a")]);
        sim.fail_next(ControlCommand::GetEntries, Errno::EIO);
        let err = list(&mut channel, ListingPolicy::default()).unwrap_err();
        assert_eq!(err.errno(), Errno::EIO);
        assert_eq!(get_capacities(&sim), vec![0]);
    }

    #[test]
    fn error_during_fetch_is_reported() {
        let (sim, mut channel) = setup(&[("/a", "a")]);
        sim.fail_nth(ControlCommand::GetEntries, 2, Errno::EFAULT);
        let err = list(&mut channel, ListingPolicy::default()).unwrap_err();
        assert_eq!(err.errno(), Errno::EFAULT);
        assert_eq!(get_capacities(&sim), vec![0, 1]);
    }

    #[test]
    fn unmounted_mountpoint_is_not_a_tty() {
        let sim = Arc::new(SimulatedPlatform::new());
        sim.create_dir("/vfs");
        let mut channel = ControlChannel::new(sim, "/vfs", false);
        let err = list(&mut channel, ListingPolicy::default()).unwrap_err();
        assert_eq!(err.errno(), Errno::ENOTTY);
        assert!(!channel.is_open());
    }
}
