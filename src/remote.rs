//! The coprocessor RPC contract.
//!
//! The manager never talks to the coprocessor transport directly; it goes
//! through [`SharedMemoryService`]. Every call can end three ways: success,
//! failure (the remote side rejected or botched the request), or interrupted
//! (a signal arrived while waiting for the reply). Interrupted is *not* a
//! failure: the caller must remember which action and transaction were cut
//! short and issue [`SharedMemoryService::clean_up`] before retrying.
//!
//! [`LoopbackService`] is an in-process stand-in that services requests from
//! a bump allocator over a simulated coprocessor window. A real transport
//! requires the coprocessor firmware, but the loopback works for API and
//! lifecycle testing, the same way a memfd stands in for a real DMA-BUF.

use crate::types::{Pid, RemoteHandle, VcAddress};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Name length limit carried in alloc/import requests.
pub const RESOURCE_NAME_MAX: usize = 32;

/// Default resource name when the caller does not supply one.
pub const RESOURCE_NAME_DEFAULT: &str = "sm-host-resource";

/// Result type for remote-service calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Failure modes of a remote call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteError {
    /// The call was interrupted by a signal before the reply arrived. The
    /// transaction id keys the cleanup the service expects before a retry.
    Interrupted {
        /// Transaction id of the interrupted exchange.
        trans_id: u32,
    },
    /// The remote side failed the request.
    Failed {
        /// Status code reported by the remote side.
        status: i32,
        /// Transaction id of the failed exchange.
        trans_id: u32,
    },
}

/// Action kinds the remote service distinguishes for cleanup purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteAction {
    /// Memory allocation.
    Alloc,
    /// Memory free.
    Free,
    /// Lock for host access.
    Lock,
    /// Unlock after host access.
    Unlock,
    /// In-place resize.
    Resize,
    /// Import of host-owned memory.
    Import,
}

/// Parameters of a remote allocation.
#[derive(Clone, Debug)]
pub struct AllocRequest {
    /// Allocate from the coprocessor's cached alias.
    pub cached: bool,
    /// Size of one unit in bytes (page aligned by the caller).
    pub base_unit: u32,
    /// Number of units.
    pub num_unit: u32,
    /// Required alignment in bytes.
    pub alignment: u32,
    /// Identity of the allocating process.
    pub allocator: Pid,
    /// Debug name attached to the allocation.
    pub name: String,
}

/// Successful allocation reply.
#[derive(Clone, Copy, Debug)]
pub struct AllocReply {
    /// Remote identifier for the new allocation.
    pub handle: RemoteHandle,
    /// Base address of the allocation in the coprocessor window.
    pub addr: VcAddress,
}

/// Successful lock reply.
#[derive(Clone, Copy, Debug)]
pub struct LockReply {
    /// Address the memory is reachable at while locked. May differ from the
    /// address observed before the lock if the coprocessor moved the block.
    pub addr: VcAddress,
    /// Address the block had before this lock.
    pub old_addr: VcAddress,
}

/// Parameters of a remote import of host-owned memory.
#[derive(Clone, Debug)]
pub struct ImportRequest {
    /// Coprocessor-side caching for the imported range.
    pub cached: bool,
    /// Bus (DMA) address of the contiguous block.
    pub addr: u64,
    /// Length of the block in bytes.
    pub size: u32,
    /// Identity of the importing process.
    pub allocator: Pid,
    /// Debug name attached to the import.
    pub name: String,
}

/// Successful import reply.
#[derive(Clone, Copy, Debug)]
pub struct ImportReply {
    /// Remote identifier wrapping the imported block.
    pub handle: RemoteHandle,
}

/// The coprocessor shared-memory service.
///
/// Calls may block waiting for the coprocessor reply. Implementations must
/// report a signal arriving mid-call as [`RemoteError::Interrupted`], never
/// as a generic failure.
pub trait SharedMemoryService: Send + Sync {
    /// Allocate a block of coprocessor memory.
    fn alloc(&self, req: &AllocRequest) -> RemoteResult<AllocReply>;

    /// Free a previously allocated block.
    fn free(&self, handle: RemoteHandle, base: VcAddress) -> RemoteResult<()>;

    /// Lock a block for host access, pinning its address.
    fn lock(&self, handle: RemoteHandle, base: VcAddress) -> RemoteResult<LockReply>;

    /// Unlock a block after host access. `wait_reply` selects whether the
    /// call waits for the coprocessor acknowledgement.
    fn unlock(&self, handle: RemoteHandle, base: VcAddress, wait_reply: bool) -> RemoteResult<()>;

    /// Resize an unlocked, unmapped block in place.
    fn resize(&self, handle: RemoteHandle, base: VcAddress, new_size: u32) -> RemoteResult<()>;

    /// Import a contiguous block of host memory into the coprocessor's view.
    fn import(&self, req: &ImportRequest) -> RemoteResult<ImportReply>;

    /// Clean up the remains of an interrupted exchange so it can be retried.
    fn clean_up(&self, action: RemoteAction, trans_id: u32);

    /// Ask the remote side to log its allocation table.
    fn walk_alloc(&self) -> RemoteResult<()>;
}

/// Scripted outcome for the next matching loopback call.
#[derive(Clone, Copy, Debug)]
enum Scripted {
    Interrupt,
    Fail(i32),
}

#[derive(Debug)]
struct LoopbackAlloc {
    addr: VcAddress,
    size: u32,
    locks: u32,
    relocate_to: Option<VcAddress>,
}

#[derive(Debug, Default)]
struct LoopbackInner {
    next_handle: u32,
    next_addr: u32,
    next_trans: u32,
    allocs: HashMap<u32, LoopbackAlloc>,
    script: Vec<(RemoteAction, Scripted)>,
    cleanups: Vec<(RemoteAction, u32)>,
}

impl LoopbackInner {
    fn trans_id(&mut self) -> u32 {
        self.next_trans += 1;
        self.next_trans
    }

    /// Consume a scripted outcome for `action`, if one is queued.
    fn take_script(&mut self, action: RemoteAction) -> Option<Scripted> {
        let pos = self.script.iter().position(|(a, _)| *a == action)?;
        Some(self.script.remove(pos).1)
    }

    fn check_script(&mut self, action: RemoteAction) -> RemoteResult<()> {
        match self.take_script(action) {
            Some(Scripted::Interrupt) => {
                let trans_id = self.trans_id();
                Err(RemoteError::Interrupted { trans_id })
            }
            Some(Scripted::Fail(status)) => {
                let trans_id = self.trans_id();
                Err(RemoteError::Failed { status, trans_id })
            }
            None => Ok(()),
        }
    }
}

/// In-process [`SharedMemoryService`] backed by a bump allocator.
///
/// Useful for tests and for exercising the manager without coprocessor
/// firmware. Clones share the same underlying state, so a test can keep a
/// clone for scripting failures and inspecting outcomes while the manager
/// owns the other.
#[derive(Clone)]
pub struct LoopbackService {
    inner: Arc<Mutex<LoopbackInner>>,
}

/// Window offset the loopback hands out its first allocation at.
const LOOPBACK_WINDOW_BASE: u32 = 0x1000_0000;

impl LoopbackService {
    /// Create a loopback service with an empty allocation table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopbackInner {
                next_addr: LOOPBACK_WINDOW_BASE,
                ..LoopbackInner::default()
            })),
        }
    }

    /// Script the next call of `action` to report an interrupt.
    pub fn interrupt_next(&self, action: RemoteAction) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push((action, Scripted::Interrupt));
    }

    /// Script the next call of `action` to fail with `status`.
    pub fn fail_next(&self, action: RemoteAction, status: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push((action, Scripted::Fail(status)));
    }

    /// Make the next lock of `handle` report a relocated base address.
    pub fn relocate_on_next_lock(&self, handle: RemoteHandle, new_addr: VcAddress) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(alloc) = inner.allocs.get_mut(&handle.0) {
            alloc.relocate_to = Some(new_addr);
        }
    }

    /// Number of live remote allocations.
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().unwrap().allocs.len()
    }

    /// Remote lock count of `handle`, or `None` if it is not allocated.
    pub fn lock_count(&self, handle: RemoteHandle) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.allocs.get(&handle.0).map(|a| a.locks)
    }

    /// Cleanup calls received so far, in order.
    pub fn cleanups(&self) -> Vec<(RemoteAction, u32)> {
        self.inner.lock().unwrap().cleanups.clone()
    }
}

impl Default for LoopbackService {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMemoryService for LoopbackService {
    fn alloc(&self, req: &AllocRequest) -> RemoteResult<AllocReply> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_script(RemoteAction::Alloc)?;

        let size = req.base_unit.saturating_mul(req.num_unit);
        if size == 0 {
            let trans_id = inner.trans_id();
            return Err(RemoteError::Failed { status: -1, trans_id });
        }

        let align = req.alignment.max(1);
        let addr = (inner.next_addr + align - 1) & !(align - 1);
        inner.next_addr = addr + size;

        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.allocs.insert(
            handle,
            LoopbackAlloc {
                addr,
                size,
                locks: 0,
                relocate_to: None,
            },
        );

        Ok(AllocReply {
            handle: RemoteHandle(handle),
            addr,
        })
    }

    fn free(&self, handle: RemoteHandle, _base: VcAddress) -> RemoteResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_script(RemoteAction::Free)?;
        if inner.allocs.remove(&handle.0).is_none() {
            let trans_id = inner.trans_id();
            return Err(RemoteError::Failed { status: -1, trans_id });
        }
        Ok(())
    }

    fn lock(&self, handle: RemoteHandle, base: VcAddress) -> RemoteResult<LockReply> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_script(RemoteAction::Lock)?;
        let trans_id = inner.trans_id();
        let Some(alloc) = inner.allocs.get_mut(&handle.0) else {
            return Err(RemoteError::Failed { status: -1, trans_id });
        };

        let old_addr = if base != 0 { base } else { alloc.addr };
        if let Some(new_addr) = alloc.relocate_to.take() {
            alloc.addr = new_addr;
        }
        alloc.locks += 1;
        Ok(LockReply {
            addr: alloc.addr,
            old_addr,
        })
    }

    fn unlock(&self, handle: RemoteHandle, _base: VcAddress, _wait_reply: bool) -> RemoteResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_script(RemoteAction::Unlock)?;
        let trans_id = inner.trans_id();
        let Some(alloc) = inner.allocs.get_mut(&handle.0) else {
            return Err(RemoteError::Failed { status: -1, trans_id });
        };
        alloc.locks = alloc.locks.saturating_sub(1);
        Ok(())
    }

    fn resize(&self, handle: RemoteHandle, _base: VcAddress, new_size: u32) -> RemoteResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_script(RemoteAction::Resize)?;
        let trans_id = inner.trans_id();
        let Some(alloc) = inner.allocs.get_mut(&handle.0) else {
            return Err(RemoteError::Failed { status: -1, trans_id });
        };
        if alloc.locks != 0 {
            return Err(RemoteError::Failed { status: -16, trans_id });
        }
        alloc.size = new_size;
        Ok(())
    }

    fn import(&self, req: &ImportRequest) -> RemoteResult<ImportReply> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_script(RemoteAction::Import)?;
        let trans_id = inner.trans_id();
        if req.size == 0 {
            return Err(RemoteError::Failed { status: -1, trans_id });
        }

        inner.next_handle += 1;
        let handle = inner.next_handle;
        // Imported memory stays at its host bus address; the loopback only
        // tracks the handle so free/lock bookkeeping works.
        inner.allocs.insert(
            handle,
            LoopbackAlloc {
                addr: (req.addr as u32) & crate::types::VC_ADDR_MASK,
                size: req.size,
                locks: 0,
                relocate_to: None,
            },
        );
        Ok(ImportReply {
            handle: RemoteHandle(handle),
        })
    }

    fn clean_up(&self, action: RemoteAction, trans_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanups.push((action, trans_id));
    }

    fn walk_alloc(&self) -> RemoteResult<()> {
        Ok(())
    }
}
