//! Core identifier and address types shared across the crate.

use std::fmt;

/// Log2 of the page size used for handle assignment and fault mapping.
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Round `n` up to the next page boundary.
#[inline]
pub fn page_align(n: u32) -> u32 {
    (n + (PAGE_SIZE as u32 - 1)) & !(PAGE_SIZE as u32 - 1)
}

/// Coprocessor bus address. The low 30 bits select the offset inside the
/// coprocessor memory window.
pub type VcAddress = u32;

/// Mask extracting the window offset from a [`VcAddress`].
pub const VC_ADDR_MASK: u32 = 0x3FFF_FFFF;

/// Process-visible opaque handle for a resource.
///
/// Handles are assigned monotonically and shifted left by [`PAGE_SHIFT`] so
/// that a handle can double as an mmap offset token, hiding the remote handle
/// and address from user space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    /// The "no resource" sentinel.
    pub const NONE: Handle = Handle(0);

    /// Whether this is the null handle.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The coprocessor's own identifier for a backing allocation (0 = none).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RemoteHandle(pub u32);

impl RemoteHandle {
    /// The "no remote allocation" sentinel.
    pub const NONE: RemoteHandle = RemoteHandle(0);

    /// Whether this is the null remote handle.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Owning process identifier. Pid 0 is reserved for kernel-owned resources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// The reserved kernel identity.
    pub const KERNEL: Pid = Pid(0);

    /// Whether this is the kernel identity.
    #[inline]
    pub fn is_kernel(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one opened session (one per device open, plus the kernel
/// session created at startup).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

/// Stable identifier for one mapping-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MapId(pub u64);

/// Cache policy of a resource, as seen by the host and the coprocessor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Uncached on both sides.
    #[default]
    None,
    /// Cached on the host CPU only.
    Host,
    /// Cached on the coprocessor only.
    Videocore,
    /// Cached on both sides.
    Both,
}

impl CachePolicy {
    /// Whether host CPU caches may hold lines for this resource. Cache
    /// maintenance is only meaningful when this is true.
    #[inline]
    pub fn is_host_cached(self) -> bool {
        matches!(self, CachePolicy::Host | CachePolicy::Both)
    }

    /// Whether the coprocessor side allocates from its cached alias.
    #[inline]
    pub fn is_vc_cached(self) -> bool {
        matches!(self, CachePolicy::Videocore | CachePolicy::Both)
    }

    /// Short label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            CachePolicy::None => "none",
            CachePolicy::Host => "host",
            CachePolicy::Videocore => "videocore",
            CachePolicy::Both => "host+videocore",
        }
    }
}
