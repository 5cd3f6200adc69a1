// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process model of the hyprlofs kernel side.
//!
//! [`SimulatedPlatform`] keeps a mapping table per mountpoint and answers
//! control requests the way the kernel module does, including `E2BIG` sizing
//! for `GET_ENTRIES`, `ENOTTY` for descriptors that do not refer to the live
//! mount, and `EBUSY` when unmounting while a descriptor is held open. Tests
//! can queue table growth or shrinkage that lands between a listing's
//! measurement and its fetch, and inject one-shot failures for any command.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;

use crate::codec::{EntryBuffer, Mapping};
use crate::config::MountOptions;
use crate::sys::{ControlCommand, ControlRequest, ListingBuffer, Platform};

/// One call observed by the simulated kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Open { path: PathBuf },
    Add { entries: usize },
    Remove { entries: usize },
    Clear,
    Get { capacity: u32 },
    Mount { path: PathBuf },
    Unmount { path: PathBuf },
}

/// Change applied to the table just before a sized fetch.
#[derive(Debug)]
enum TableChange {
    Grow(Vec<Mapping>),
    Shrink(Vec<String>),
}

#[derive(Debug)]
struct SimMount {
    generation: u64,
    entries: Vec<Mapping>,
    changes: VecDeque<TableChange>,
    open_descriptors: usize,
}

#[derive(Debug)]
struct InjectedFailure {
    command: ControlCommand,
    countdown: u32,
    errno: Errno,
}

#[derive(Debug, Default)]
struct SimState {
    dirs: HashSet<PathBuf>,
    mounts: HashMap<PathBuf, SimMount>,
    next_generation: u64,
    opens: HashMap<PathBuf, usize>,
    failures: Vec<InjectedFailure>,
    calls: Vec<SimCall>,
}

impl SimState {
    fn next_mount(&mut self) -> SimMount {
        self.next_generation += 1;
        SimMount {
            generation: self.next_generation,
            entries: Vec::new(),
            changes: VecDeque::new(),
            open_descriptors: 0,
        }
    }

    fn take_failure(&mut self, command: ControlCommand) -> Option<Errno> {
        let mut fired = None;
        self.failures.retain_mut(|failure| {
            if failure.command != command {
                return true;
            }
            failure.countdown = failure.countdown.saturating_sub(1);
            if failure.countdown == 0 && fired.is_none() {
                fired = Some(failure.errno);
                false
            } else {
                true
            }
        });
        fired
    }
}

impl SimMount {
    fn add(&mut self, buffer: &EntryBuffer) -> Result<(), Errno> {
        let mut incoming: Vec<Mapping> = Vec::with_capacity(buffer.len());
        for entry in buffer.iter() {
            let path = entry.path.ok_or(Errno::EINVAL)?.to_string_lossy().into_owned();
            let name = entry.name.to_string_lossy().into_owned();
            if !path.starts_with('/') {
                return Err(Errno::EINVAL);
            }
            let taken = self.entries.iter().chain(&incoming).any(|m| m.name == name);
            if taken {
                return Err(Errno::EEXIST);
            }
            incoming.push(Mapping::new(path, name));
        }
        self.entries.extend(incoming);
        Ok(())
    }

    fn remove(&mut self, buffer: &EntryBuffer) -> Result<(), Errno> {
        let names: Vec<String> = buffer
            .iter()
            .map(|entry| entry.name.to_string_lossy().into_owned())
            .collect();
        if names.iter().any(|name| !self.entries.iter().any(|m| &m.name == name)) {
            return Err(Errno::ENOENT);
        }
        self.entries.retain(|m| !names.contains(&m.name));
        Ok(())
    }

    fn get(&mut self, buffer: &mut ListingBuffer) -> Result<(), Errno> {
        if buffer.capacity() > 0 {
            match self.changes.pop_front() {
                Some(TableChange::Grow(grown)) => self.entries.extend(grown),
                Some(TableChange::Shrink(names)) => {
                    self.entries.retain(|mapping| !names.contains(&mapping.name));
                }
                None => {}
            }
        }
        let count = self.entries.len() as u32;
        buffer.set_count(count);
        if count > buffer.capacity() {
            return Err(Errno::E2BIG);
        }
        for (slot, mapping) in buffer.slots_mut().iter_mut().zip(&self.entries) {
            slot.set(&mapping.path, &mapping.name);
        }
        Ok(())
    }
}

/// Simulated hyprlofs kernel. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct SimulatedPlatform {
    state: Arc<Mutex<SimState>>,
}

/// Descriptor handed out by [`SimulatedPlatform::open_control`].
#[derive(Debug)]
pub struct SimDescriptor {
    state: Arc<Mutex<SimState>>,
    path: PathBuf,
    generation: Option<u64>,
}

impl Drop for SimDescriptor {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(mount) = state.mounts.get_mut(&self.path) {
            if Some(mount.generation) == self.generation {
                mount.open_descriptors -= 1;
            }
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Make `path` exist so it can be opened and mounted on.
    pub fn create_dir(&self, path: impl AsRef<Path>) {
        self.state().dirs.insert(path.as_ref().to_path_buf());
    }

    pub fn is_mounted(&self, path: impl AsRef<Path>) -> bool {
        self.state().mounts.contains_key(path.as_ref())
    }

    /// Replace the mount at `path` with a fresh one, as if it had been
    /// unmounted and remounted behind the caller's back. Descriptors opened on
    /// the old mount go stale.
    pub fn force_remount(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.state();
        let mount = state.next_mount();
        state.mounts.insert(path.to_path_buf(), mount);
    }

    /// Insert a mapping directly into the table of the mount at `path`.
    pub fn insert(&self, path: impl AsRef<Path>, real_path: &str, name: &str) {
        if let Some(mount) = self.state().mounts.get_mut(path.as_ref()) {
            mount.entries.push(Mapping::new(real_path, name));
        }
    }

    /// Queue mappings that appear right before the next sized `GET_ENTRIES`
    /// call, simulating a concurrent writer.
    pub fn grow_before_fetch(&self, path: impl AsRef<Path>, mappings: Vec<(String, String)>) {
        if let Some(mount) = self.state().mounts.get_mut(path.as_ref()) {
            mount.changes.push_back(TableChange::Grow(
                mappings.into_iter().map(Mapping::from).collect(),
            ));
        }
    }

    /// Drop the named mappings right before the next sized `GET_ENTRIES`.
    pub fn shrink_before_fetch(&self, path: impl AsRef<Path>, names: &[&str]) {
        if let Some(mount) = self.state().mounts.get_mut(path.as_ref()) {
            mount.changes.push_back(TableChange::Shrink(
                names.iter().map(|name| name.to_string()).collect(),
            ));
        }
    }

    /// Fail the next call of `command` with `errno`.
    pub fn fail_next(&self, command: ControlCommand, errno: Errno) {
        self.fail_nth(command, 1, errno);
    }

    /// Fail the `nth` (1-based) upcoming call of `command` with `errno`.
    pub fn fail_nth(&self, command: ControlCommand, nth: u32, errno: Errno) {
        self.state().failures.push(InjectedFailure {
            command,
            countdown: nth.max(1),
            errno,
        });
    }

    /// Current table of the mount at `path`, in insertion order.
    pub fn entries(&self, path: impl AsRef<Path>) -> Vec<Mapping> {
        self.state()
            .mounts
            .get(path.as_ref())
            .map(|mount| mount.entries.clone())
            .unwrap_or_default()
    }

    /// Number of successful opens of `path` so far.
    pub fn opens(&self, path: impl AsRef<Path>) -> usize {
        self.state().opens.get(path.as_ref()).copied().unwrap_or(0)
    }

    /// Descriptors currently open on the live mount at `path`.
    pub fn open_descriptors(&self, path: impl AsRef<Path>) -> usize {
        self.state()
            .mounts
            .get(path.as_ref())
            .map_or(0, |mount| mount.open_descriptors)
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }
}

impl Platform for SimulatedPlatform {
    type Descriptor = SimDescriptor;

    fn open_control(&self, path: &Path) -> Result<SimDescriptor, Errno> {
        let mut state = self.state();
        state.calls.push(SimCall::Open {
            path: path.to_path_buf(),
        });
        if !state.dirs.contains(path) {
            return Err(Errno::ENOENT);
        }
        *state.opens.entry(path.to_path_buf()).or_default() += 1;
        let generation = state.mounts.get_mut(path).map(|mount| {
            mount.open_descriptors += 1;
            mount.generation
        });
        Ok(SimDescriptor {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
            generation,
        })
    }

    fn control(&self, descriptor: &SimDescriptor, request: ControlRequest<'_>) -> Result<i32, Errno> {
        let mut state = self.state();
        state.calls.push(match &request {
            ControlRequest::AddEntries(buffer) => SimCall::Add {
                entries: buffer.len(),
            },
            ControlRequest::RemoveEntries(buffer) => SimCall::Remove {
                entries: buffer.len(),
            },
            ControlRequest::RemoveAll => SimCall::Clear,
            ControlRequest::GetEntries(buffer) => SimCall::Get {
                capacity: buffer.capacity(),
            },
        });
        if let Some(errno) = state.take_failure(request.command()) {
            return Err(errno);
        }

        let mount = match state.mounts.get_mut(&descriptor.path) {
            Some(mount) if Some(mount.generation) == descriptor.generation => mount,
            _ => return Err(Errno::ENOTTY),
        };
        match request {
            ControlRequest::AddEntries(buffer) => mount.add(buffer)?,
            ControlRequest::RemoveEntries(buffer) => mount.remove(buffer)?,
            ControlRequest::RemoveAll => mount.entries.clear(),
            ControlRequest::GetEntries(buffer) => mount.get(buffer)?,
        }
        Ok(0)
    }

    fn mount(&self, path: &Path, options: &MountOptions) -> Result<(), Errno> {
        let mut state = self.state();
        state.calls.push(SimCall::Mount {
            path: path.to_path_buf(),
        });
        if !state.dirs.contains(path) {
            return Err(Errno::ENOENT);
        }
        if options.fstype != "hyprlofs" {
            return Err(Errno::ENODEV);
        }
        if state.mounts.contains_key(path) {
            return Err(Errno::EBUSY);
        }
        let mount = state.next_mount();
        state.mounts.insert(path.to_path_buf(), mount);
        Ok(())
    }

    fn unmount(&self, path: &Path) -> Result<(), Errno> {
        let mut state = self.state();
        state.calls.push(SimCall::Unmount {
            path: path.to_path_buf(),
        });
        match state.mounts.get(path) {
            None => Err(Errno::EINVAL),
            Some(mount) if mount.open_descriptors > 0 => Err(Errno::EBUSY),
            Some(_) => {
                state.mounts.remove(path);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn mounted() -> SimulatedPlatform {
        let sim = SimulatedPlatform::new();
        sim.create_dir("/vfs");
        sim.mount(Path::new("/vfs"), &MountOptions::default()).unwrap();
        sim
    }

    #[test]
    fn mount_requires_directory_and_hyprlofs_type() {
        let sim = SimulatedPlatform::new();
        assert_eq!(
            sim.mount(Path::new("/vfs"), &MountOptions::default()),
            Err(Errno::ENOENT)
        );
        sim.create_dir("/vfs");
        let tmpfs = MountOptions {
            fstype: "tmpfs".to_string(),
            ..MountOptions::default()
        };
        assert_eq!(sim.mount(Path::new("/vfs"), &tmpfs), Err(Errno::ENODEV));
        sim.mount(Path::new("/vfs"), &MountOptions::default()).unwrap();
        assert_eq!(
            sim.mount(Path::new("/vfs"), &MountOptions::default()),
            Err(Errno::EBUSY)
        );
    }

    #[test]
    fn unmount_refuses_while_descriptor_open() {
        let sim = mounted();
        let fd = sim.open_control(Path::new("/vfs")).unwrap();
        assert_eq!(sim.unmount(Path::new("/vfs")), Err(Errno::EBUSY));
        drop(fd);
        sim.unmount(Path::new("/vfs")).unwrap();
        assert_eq!(sim.unmount(Path::new("/vfs")), Err(Errno::EINVAL));
    }

    #[test]
    fn add_is_atomic_and_rejects_duplicates() {
        let sim = mounted();
        let fd = sim.open_control(Path::new("/vfs")).unwrap();
        let first = codec::encode_add([("/etc/hosts", "hosts")]).unwrap();
        sim.control(&fd, ControlRequest::AddEntries(&first)).unwrap();

        let clash = codec::encode_add([("/etc/passwd", "pw"), ("/etc/group", "hosts")]).unwrap();
        assert_eq!(
            sim.control(&fd, ControlRequest::AddEntries(&clash)),
            Err(Errno::EEXIST)
        );
        assert_eq!(sim.entries("/vfs"), vec![Mapping::new("/etc/hosts", "hosts")]);
    }

    #[test]
    fn injected_failures_fire_once() {
        let sim = mounted();
        let fd = sim.open_control(Path::new("/vfs")).unwrap();
        sim.fail_nth(ControlCommand::RemoveAll, 2, Errno::EIO);
        assert_eq!(sim.control(&fd, ControlRequest::RemoveAll), Ok(0));
        assert_eq!(sim.control(&fd, ControlRequest::RemoveAll), Err(Errno::EIO));
        assert_eq!(sim.control(&fd, ControlRequest::RemoveAll), Ok(0));
    }

    #[test]
    fn descriptor_on_plain_directory_is_not_a_tty() {
        let sim = SimulatedPlatform::new();
        sim.create_dir("/vfs");
        let fd = sim.open_control(Path::new("/vfs")).unwrap();
        assert_eq!(sim.control(&fd, ControlRequest::RemoveAll), Err(Errno::ENOTTY));
    }
}
