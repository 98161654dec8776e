//! Imported host-owned buffers.
//!
//! Shared memory does not have to originate on the coprocessor: a buffer
//! exported by another subsystem (camera, display, codec) can be handed in
//! as a DMA-BUF fd and wrapped in a resource, as long as it is physically
//! contiguous so the coprocessor can address it as one block.
//!
//! [`ExternalBuffer`] owns the fd for the lifetime of the resource, records
//! the buffer's bus-address layout, and maps the memory for CPU access.
//! Tests use a memfd in place of a real DMA-BUF; a real one requires a
//! device driver, but a memfd exercises the same fd and mmap paths.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// One physically contiguous run of an external buffer, as reported by the
/// exporting driver's DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusSegment {
    /// Bus (DMA) address of the run.
    pub addr: u64,
    /// Length of the run in bytes.
    pub len: usize,
}

/// A host-owned buffer attached for sharing with the coprocessor.
///
/// Holds the exporter's fd so the underlying memory cannot be released
/// while the coprocessor may still reference it, and a CPU mapping for
/// host-side access.
pub struct ExternalBuffer {
    fd: OwnedFd,
    segment: BusSegment,
    ptr: NonNull<u8>,
}

impl ExternalBuffer {
    /// Attach an exported buffer described by its DMA segment list.
    ///
    /// The coprocessor addresses imported memory as a single block, so the
    /// buffer must consist of exactly one contiguous segment. The fd must be
    /// at least as large as the segment it backs.
    ///
    /// # Errors
    ///
    /// Fails if the segment list is not a single contiguous run, if the fd
    /// is smaller than the claimed segment, or if mmap fails.
    pub fn attach(fd: OwnedFd, segments: &[BusSegment]) -> Result<Self> {
        let segment = match segments {
            [only] if only.len > 0 => *only,
            // Scattered buffers cannot be represented remotely.
            _ => return Err(Error::OutOfMemory),
        };

        let stat = rustix::fs::fstat(&fd)?;
        if (stat.st_size as u64) < segment.len as u64 {
            return Err(Error::InvalidArgument(format!(
                "buffer fd holds {} bytes, segment claims {}",
                stat.st_size, segment.len
            )));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                segment.len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidArgument("mmap returned null".into()))?;

        Ok(Self { fd, segment, ptr })
    }

    /// Bus address the coprocessor should use for this buffer.
    #[inline]
    pub fn bus_address(&self) -> u64 {
        self.segment.addr
    }

    /// Size of the buffer in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.segment.len
    }

    /// Borrow the underlying fd, e.g. for passing to another process.
    #[inline]
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// CPU view of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for segment.len bytes for the life of self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.segment.len) }
    }

    /// Mutable CPU view of the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for segment.len bytes, we have &mut self
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.segment.len) }
    }
}

impl Drop for ExternalBuffer {
    fn drop(&mut self) {
        // Unmap before the fd closes
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.segment.len);
        }
    }
}

// SAFETY: the fd is just a number and the mapping is process-wide; the
// exporter handles device-side synchronization.
unsafe impl Send for ExternalBuffer {}

// SAFETY: concurrent reads of the mapping are safe; mutable access
// requires &mut self.
unsafe impl Sync for ExternalBuffer {}

impl std::fmt::Debug for ExternalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBuffer")
            .field("fd", &self.fd.as_raw_fd())
            .field("addr", &self.segment.addr)
            .field("len", &self.segment.len)
            .finish()
    }
}
