//! Host OS oracles.
//!
//! The sensor never talks to the operating system directly: everything it
//! needs (process protection and personality queries, export lookup, thread
//! APC queues, shared sections) goes through the [`Platform`] trait. A real
//! backend wraps the kernel services, [`simulated::SimulatedPlatform`] keeps
//! everything in memory for tests and trace replay.

use std::fmt;

use thiserror::Error;

use crate::{
    deferred::{ApcTicket, CallKey},
    event::{Pid, Tid},
};

#[cfg(any(test, feature = "test-utils"))]
pub mod simulated;

/// Virtual address, in the address space the value was obtained from.
pub type Address = u64;

pub const PAGE_SIZE: usize = 0x1000;

/// Rounds `size` up to a whole number of pages.
pub fn page_align(size: usize) -> Option<usize> {
    Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

/// Opaque handle of a shared memory section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionHandle(u64);

impl SectionHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// A section view mapped in the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappedRegion {
    pub base: Address,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    pub const WINDOWS_7: OsVersion = OsVersion::new(6, 1, 7601);
    pub const WINDOWS_10: OsVersion = OsVersion::new(10, 0, 19045);

    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// Windows 7 loads kernel32 and kernelbase before the loader is usable.
    pub fn is_windows7(&self) -> bool {
        self.major == 6 && self.minor == 1
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("access violation writing {len} bytes at offset {offset:#x}")]
    AccessViolation { offset: usize, len: usize },
    #[error("operation not supported")]
    NotSupported,
    #[error("{call} failed with status {status:#010x}")]
    Status { call: &'static str, status: u32 },
}

/// A ticket the platform refused to queue, handed back to its owner.
#[derive(Debug)]
pub struct RejectedApc {
    pub ticket: ApcTicket,
    pub error: PlatformError,
}

pub trait Platform: Send + Sync {
    /// Protected processes must never be injected.
    fn is_protected(&self, pid: Pid) -> bool;

    /// Whether `pid` is a 32-bit process running on a 64-bit system.
    fn is_wow64(&self, pid: Pid) -> bool;

    fn os_version(&self) -> OsVersion;

    /// Thread executing the caller.
    fn current_thread(&self) -> Tid;

    /// Looks up the exported routine `name` of the image mapped at `image_base`
    /// in the current process.
    fn resolve_export(&self, image_base: Address, name: &str) -> Option<Address>;

    /// Links `ticket` to the APC queue of `ticket.thread()`.
    ///
    /// The platform later consumes the ticket exactly once: with
    /// [`ApcTicket::deliver`] when the thread runs it, with
    /// [`ApcTicket::rundown`] when the thread exits first.
    fn queue_apc(&self, ticket: ApcTicket) -> Result<(), RejectedApc>;

    /// Unlinks the ticket identified by `key` if it has not been delivered yet.
    fn cancel_apc(&self, thread: Tid, key: CallKey) -> Option<ApcTicket>;

    /// Encodes a user-mode routine so it runs in the 32-bit personality.
    fn wrap_wow64_routine(
        &self,
        entry: Address,
        context: Address,
    ) -> Result<(Address, Address), PlatformError>;

    fn create_section(&self, size: usize) -> Result<SectionHandle, PlatformError>;

    /// Maps `section` in the current process.
    fn map_section(&self, section: SectionHandle) -> Result<MappedRegion, PlatformError>;

    fn write_view(
        &self,
        view: MappedRegion,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), PlatformError>;

    fn unmap_view(&self, view: MappedRegion);

    fn close_section(&self, section: SectionHandle);
}

/// Section handle closed on drop.
pub struct Section<'p> {
    platform: &'p dyn Platform,
    handle: SectionHandle,
}

impl<'p> Section<'p> {
    pub fn create(platform: &'p dyn Platform, size: usize) -> Result<Self, PlatformError> {
        let handle = platform.create_section(size)?;
        Ok(Self { platform, handle })
    }

    pub fn handle(&self) -> SectionHandle {
        self.handle
    }

    pub fn map(&self) -> Result<MappedView<'p>, PlatformError> {
        let region = self.platform.map_section(self.handle)?;
        Ok(MappedView {
            platform: self.platform,
            region,
            released: false,
        })
    }
}

impl Drop for Section<'_> {
    fn drop(&mut self) {
        self.platform.close_section(self.handle);
    }
}

/// Mapped view, unmapped on drop unless released.
pub struct MappedView<'p> {
    platform: &'p dyn Platform,
    region: MappedRegion,
    released: bool,
}

impl MappedView<'_> {
    pub fn region(&self) -> MappedRegion {
        self.region
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), PlatformError> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(PlatformError::AccessViolation {
                offset,
                len: bytes.len(),
            })?;
        if end > self.region.size {
            return Err(PlatformError::AccessViolation {
                offset,
                len: bytes.len(),
            });
        }
        self.platform.write_view(self.region, offset, bytes)
    }

    /// Leaves the view mapped, its lifetime now belongs to whoever got its
    /// address.
    pub fn release(mut self) -> MappedRegion {
        self.released = true;
        self.region
    }
}

impl Drop for MappedView<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.platform.unmap_view(self.region);
        }
    }
}
