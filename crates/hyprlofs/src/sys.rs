// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Syscall seam: opening the control descriptor, issuing hyprlofs ioctls, and
//! mounting/unmounting.
//!
//! [`Platform`] is implemented by [`SystemPlatform`] for real hosts and by
//! [`crate::sim::SimulatedPlatform`] for tests. Buffers passed through
//! [`ControlRequest`] use the kernel's structure layout so the system backend
//! can hand them to `ioctl(2)` without another copy.

use std::ffi::CStr;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::codec::{EntryBuffer, Mapping};
use crate::config::MountOptions;

/// `MAXPATHLEN` on illumos.
pub const MAX_PATH_LEN: usize = 1024;
/// `MAXNAMELEN` on illumos.
pub const MAX_NAME_LEN: usize = 256;

const HYPRLOFS_IOC: u32 = (b'H' as u32) << 8;

/// hyprlofs control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    AddEntries,
    RemoveEntries,
    RemoveAll,
    GetEntries,
}

impl ControlCommand {
    pub fn code(self) -> u32 {
        HYPRLOFS_IOC
            | match self {
                ControlCommand::AddEntries => 1,
                ControlCommand::RemoveEntries => 2,
                ControlCommand::RemoveAll => 3,
                ControlCommand::GetEntries => 4,
            }
    }

    /// Short name used in operation names and debug output.
    pub fn name(self) -> &'static str {
        match self {
            ControlCommand::AddEntries => "ADD",
            ControlCommand::RemoveEntries => "REMOVE",
            ControlCommand::RemoveAll => "CLEAR",
            ControlCommand::GetEntries => "GET",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One slot of the `GET_ENTRIES` receiving buffer (`hyprlofs_curr_entry_t`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CurrentEntry {
    path: [u8; MAX_PATH_LEN],
    name: [u8; MAX_NAME_LEN],
}

impl CurrentEntry {
    const ZEROED: CurrentEntry = CurrentEntry {
        path: [0; MAX_PATH_LEN],
        name: [0; MAX_NAME_LEN],
    };

    /// Store a mapping the way the kernel does: NUL-terminated, truncated to
    /// the fixed field widths.
    pub fn set(&mut self, path: &str, name: &str) {
        copy_terminated(&mut self.path, path.as_bytes());
        copy_terminated(&mut self.name, name.as_bytes());
    }

    pub fn to_mapping(&self) -> Mapping {
        Mapping::new(read_terminated(&self.path), read_terminated(&self.name))
    }
}

impl fmt::Debug for CurrentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentEntry")
            .field("path", &read_terminated(&self.path))
            .field("name", &read_terminated(&self.name))
            .finish()
    }
}

fn copy_terminated(dst: &mut [u8], src: &[u8]) {
    let len = src.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&src[..len]);
    dst[len..].fill(0);
}

fn read_terminated(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Receiving buffer for `GET_ENTRIES` (`hyprlofs_curr_entries_t` plus its
/// entry storage).
///
/// On input `count` is the capacity. The kernel overwrites it with the number
/// of current mappings: on success that many slots are filled; on `E2BIG`
/// nothing is filled and `count` is the size the caller needs.
#[derive(Debug)]
pub struct ListingBuffer {
    entries: Vec<CurrentEntry>,
    count: u32,
}

impl ListingBuffer {
    /// Zero-capacity buffer used to measure the table.
    pub fn measure() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    /// Buffer with room for `capacity` entries. Allocation failure is
    /// reported as `ENOMEM`.
    pub fn with_capacity(capacity: u32) -> Result<Self, Errno> {
        let slots = capacity as usize;
        let mut entries = Vec::new();
        entries.try_reserve_exact(slots).map_err(|_| Errno::ENOMEM)?;
        entries.resize(slots, CurrentEntry::ZEROED);
        Ok(Self {
            entries,
            count: capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Count reported by the last `GET_ENTRIES` call.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = count;
    }

    pub fn slots_mut(&mut self) -> &mut [CurrentEntry] {
        &mut self.entries
    }

    /// The filled entries, in channel order.
    pub fn mappings(&self) -> Vec<Mapping> {
        let filled = (self.count as usize).min(self.entries.len());
        self.entries[..filled].iter().map(CurrentEntry::to_mapping).collect()
    }
}

/// A control command together with its argument.
#[derive(Debug)]
pub enum ControlRequest<'a> {
    AddEntries(&'a EntryBuffer),
    RemoveEntries(&'a EntryBuffer),
    RemoveAll,
    GetEntries(&'a mut ListingBuffer),
}

impl ControlRequest<'_> {
    pub fn command(&self) -> ControlCommand {
        match self {
            ControlRequest::AddEntries(_) => ControlCommand::AddEntries,
            ControlRequest::RemoveEntries(_) => ControlCommand::RemoveEntries,
            ControlRequest::RemoveAll => ControlCommand::RemoveAll,
            ControlRequest::GetEntries(_) => ControlCommand::GetEntries,
        }
    }

    /// The entry list argument, for requests that carry one.
    pub fn entries(&self) -> Option<&EntryBuffer> {
        match self {
            ControlRequest::AddEntries(entries) | ControlRequest::RemoveEntries(entries) => {
                Some(entries)
            }
            ControlRequest::RemoveAll | ControlRequest::GetEntries(_) => None,
        }
    }
}

/// Syscalls needed to administer a hyprlofs mount.
pub trait Platform: Send + Sync + 'static {
    /// An open control descriptor. Dropping it closes it.
    type Descriptor: Send + 'static;

    /// Open `path` read-only with close-on-exec set.
    fn open_control(&self, path: &Path) -> Result<Self::Descriptor, Errno>;

    /// Issue one control request, returning the raw non-negative return code.
    fn control(
        &self,
        descriptor: &Self::Descriptor,
        request: ControlRequest<'_>,
    ) -> Result<i32, Errno>;

    fn mount(&self, path: &Path, options: &MountOptions) -> Result<(), Errno>;

    fn unmount(&self, path: &Path) -> Result<(), Errno>;
}

/// Real syscalls against the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

#[repr(C)]
struct RawEntry {
    path: *const libc::c_char,
    path_len: libc::c_uint,
    name: *const libc::c_char,
    name_len: libc::c_uint,
}

#[repr(C)]
struct RawEntries {
    entries: *const RawEntry,
    len: libc::c_uint,
}

#[repr(C)]
struct RawCurrentEntries {
    entries: *mut CurrentEntry,
    count: libc::c_uint,
}

impl SystemPlatform {
    fn ioctl(fd: &OwnedFd, command: ControlCommand, arg: *mut libc::c_void) -> Result<i32, Errno> {
        // SAFETY: `arg` is either null or points at a structure laid out as the
        // kernel expects for `command`, kept alive by the caller for the call.
        let rv = unsafe { libc::ioctl(fd.as_raw_fd(), command.code() as _, arg) };
        Errno::result(rv)
    }

    fn send_entries(fd: &OwnedFd, command: ControlCommand, buffer: &EntryBuffer) -> Result<i32, Errno> {
        let raw: Vec<RawEntry> = buffer
            .iter()
            .map(|entry| RawEntry {
                path: entry.path.map_or(std::ptr::null(), CStr::as_ptr),
                path_len: entry.path.map_or(0, |p| p.to_bytes().len() as libc::c_uint),
                name: entry.name.as_ptr(),
                name_len: entry.name.to_bytes().len() as libc::c_uint,
            })
            .collect();
        let mut list = RawEntries {
            entries: raw.as_ptr(),
            len: raw.len() as libc::c_uint,
        };
        Self::ioctl(fd, command, (&mut list as *mut RawEntries).cast())
    }

    fn get_entries(fd: &OwnedFd, buffer: &mut ListingBuffer) -> Result<i32, Errno> {
        let slots = buffer.slots_mut();
        let mut list = RawCurrentEntries {
            entries: if slots.is_empty() {
                std::ptr::null_mut()
            } else {
                slots.as_mut_ptr()
            },
            count: slots.len() as libc::c_uint,
        };
        let result = Self::ioctl(
            fd,
            ControlCommand::GetEntries,
            (&mut list as *mut RawCurrentEntries).cast(),
        );
        buffer.set_count(list.count);
        result
    }
}

impl Platform for SystemPlatform {
    type Descriptor = OwnedFd;

    fn open_control(&self, path: &Path) -> Result<OwnedFd, Errno> {
        nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
    }

    fn control(&self, fd: &OwnedFd, request: ControlRequest<'_>) -> Result<i32, Errno> {
        match request {
            ControlRequest::AddEntries(buffer) => {
                Self::send_entries(fd, ControlCommand::AddEntries, buffer)
            }
            ControlRequest::RemoveEntries(buffer) => {
                Self::send_entries(fd, ControlCommand::RemoveEntries, buffer)
            }
            ControlRequest::RemoveAll => {
                Self::ioctl(fd, ControlCommand::RemoveAll, std::ptr::null_mut())
            }
            ControlRequest::GetEntries(buffer) => Self::get_entries(fd, buffer),
        }
    }

    fn mount(&self, path: &Path, options: &MountOptions) -> Result<(), Errno> {
        os::mount(path, options)
    }

    fn unmount(&self, path: &Path) -> Result<(), Errno> {
        os::unmount(path)
    }
}

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
mod os {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use nix::errno::Errno;

    use crate::config::MountOptions;

    const MS_OPTIONSTR: libc::c_int = 0x0100;
    const OPTION_BUFFER_LEN: usize = 256;

    extern "C" {
        // `int mount(const char *, const char *, int, ...)`: the filesystem
        // type, data and option arguments are read with `va_arg`.
        #[link_name = "mount"]
        fn sys_mount(
            spec: *const libc::c_char,
            dir: *const libc::c_char,
            mflag: libc::c_int,
            ...
        ) -> libc::c_int;

        #[link_name = "umount"]
        fn sys_umount(file: *const libc::c_char) -> libc::c_int;
    }

    fn c_path(path: &Path) -> Result<CString, Errno> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
    }

    fn c_text(text: &str) -> Result<CString, Errno> {
        CString::new(text).map_err(|_| Errno::EINVAL)
    }

    pub(super) fn mount(path: &Path, options: &MountOptions) -> Result<(), Errno> {
        let dir = c_path(path)?;
        let special = c_text(&options.special)?;
        let fstype = c_text(&options.fstype)?;
        // The kernel rewrites the option string in place, so it needs a
        // writable buffer of the advertised length.
        let mut optbuf = [0 as libc::c_char; OPTION_BUFFER_LEN];
        let opts = options.options.as_bytes();
        if opts.len() >= OPTION_BUFFER_LEN || opts.contains(&0) {
            return Err(Errno::EINVAL);
        }
        for (dst, src) in optbuf.iter_mut().zip(opts) {
            *dst = *src as libc::c_char;
        }
        // SAFETY: every pointer refers to a live NUL-terminated buffer.
        let rv = unsafe {
            sys_mount(
                special.as_ptr(),
                dir.as_ptr(),
                MS_OPTIONSTR,
                fstype.as_ptr(),
                std::ptr::null::<libc::c_char>(),
                0 as libc::c_int,
                optbuf.as_mut_ptr(),
                OPTION_BUFFER_LEN as libc::c_int,
            )
        };
        Errno::result(rv).map(drop)
    }

    pub(super) fn unmount(path: &Path) -> Result<(), Errno> {
        let dir = c_path(path)?;
        // SAFETY: `dir` is a live NUL-terminated path.
        let rv = unsafe { sys_umount(dir.as_ptr()) };
        Errno::result(rv).map(drop)
    }
}

#[cfg(target_os = "linux")]
mod os {
    use std::path::Path;

    use nix::errno::Errno;
    use nix::mount::MsFlags;

    use crate::config::MountOptions;

    // Linux has no hyprlofs; the request is still issued so the kernel's answer
    // (usually ENODEV or EPERM) reaches the caller unchanged.
    pub(super) fn mount(path: &Path, options: &MountOptions) -> Result<(), Errno> {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for option in options.options.split(',').filter(|o| !o.is_empty()) {
            match option {
                "ro" => flags |= MsFlags::MS_RDONLY,
                other => data.push(other),
            }
        }
        let data = data.join(",");
        nix::mount::mount(
            Some(options.special.as_str()),
            path,
            Some(options.fstype.as_str()),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
    }

    pub(super) fn unmount(path: &Path) -> Result<(), Errno> {
        nix::mount::umount(path)
    }
}

#[cfg(not(any(target_os = "illumos", target_os = "solaris", target_os = "linux")))]
mod os {
    use std::path::Path;

    use nix::errno::Errno;

    use crate::config::MountOptions;

    pub(super) fn mount(_path: &Path, _options: &MountOptions) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    pub(super) fn unmount(_path: &Path) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }
}
