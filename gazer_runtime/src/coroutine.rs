//! Coroutine descriptor views and enumeration.
//!
//! A coroutine handle is nothing but the descriptor's address plus the
//! runtime config; every field access is "read an integer at descriptor
//! address + configured offset". No synchronization is needed anywhere in
//! this module because it only runs while the world is stopped.

use gazer_program::RuntimeConfig;

use crate::memory::ReadMemory;

/// The scan bit the host runtime ORs into a status while examining a
/// coroutine's stack. Masked out before any comparison.
pub const SCAN_BIT: u32 = 0x1000;

/// Coroutine scheduling states.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Just allocated, not yet initialized.
    Idle = 0,
    /// On a run queue, not executing.
    Runnable = 1,
    /// Executing user code; owns its stack.
    Running = 2,
    /// Executing a system call; not running user code.
    Syscall = 3,
    /// Blocked in the runtime.
    Waiting = 4,
    /// Currently unused by the host runtime.
    Moribund = 5,
    /// Exited or on a free list; may have no stack.
    Dead = 6,
    /// Currently unused by the host runtime.
    Enqueue = 7,
    /// Stack is being moved.
    CopyStack = 8,
    /// Stopped for preemption.
    Preempted = 9,
}

impl Status {
    /// Decode a raw status word, masking the scan bit first.
    pub fn from_raw(raw: u32) -> Option<Status> {
        Some(match raw & !SCAN_BIT {
            0 => Status::Idle,
            1 => Status::Runnable,
            2 => Status::Running,
            3 => Status::Syscall,
            4 => Status::Waiting,
            5 => Status::Moribund,
            6 => Status::Dead,
            7 => Status::Enqueue,
            8 => Status::CopyStack,
            9 => Status::Preempted,
            _ => return None,
        })
    }

    /// Masked numeric value, as recorded in the output blob.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Idle => "idle",
            Status::Runnable => "runnable",
            Status::Running => "running",
            Status::Syscall => "syscall",
            Status::Waiting => "waiting",
            Status::Moribund => "moribund",
            Status::Dead => "dead",
            Status::Enqueue => "enqueue",
            Status::CopyStack => "copystack",
            Status::Preempted => "preempted",
        };
        f.write_str(s)
    }
}

/// A view over one coroutine descriptor.
///
/// Field reads that fail (the descriptor vanished under a torn list, which
/// cannot happen while the world is stopped but is cheap to tolerate)
/// report zero, which downstream handles as an absent value.
#[derive(Debug, Clone, Copy)]
pub struct Coroutine<'a> {
    addr: u64,
    cfg: &'a RuntimeConfig,
}

impl<'a> Coroutine<'a> {
    /// Wrap a descriptor address.
    pub fn new(addr: u64, cfg: &'a RuntimeConfig) -> Self {
        Self { addr, cfg }
    }

    /// The descriptor address itself.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Saved program counter.
    pub fn pc<M: ReadMemory>(&self, mem: &M) -> u64 {
        mem.read_u64(self.addr + self.cfg.co_sched_pc_offset)
            .unwrap_or(0)
    }

    /// Saved frame pointer.
    pub fn fp<M: ReadMemory>(&self, mem: &M) -> u64 {
        mem.read_u64(self.addr + self.cfg.co_sched_fp_offset)
            .unwrap_or(0)
    }

    /// Program counter recorded at syscall entry.
    pub fn syscall_pc<M: ReadMemory>(&self, mem: &M) -> u64 {
        mem.read_u64(self.addr + self.cfg.co_syscall_pc_offset)
            .unwrap_or(0)
    }

    /// Coroutine id.
    pub fn id<M: ReadMemory>(&self, mem: &M) -> i64 {
        mem.read_i64(self.addr + self.cfg.co_id_offset).unwrap_or(0)
    }

    /// Raw status word, scan bit included.
    pub fn status_raw<M: ReadMemory>(&self, mem: &M) -> u32 {
        mem.read_u32(self.addr + self.cfg.co_status_offset)
            .unwrap_or(Status::Dead.as_u32())
    }

    /// Decoded status with the scan bit masked.
    pub fn status<M: ReadMemory>(&self, mem: &M) -> Option<Status> {
        Status::from_raw(self.status_raw(mem))
    }

    /// Highest stack address ever used.
    pub fn stack_top_sp<M: ReadMemory>(&self, mem: &M) -> u64 {
        mem.read_u64(self.addr + self.cfg.co_stack_top_sp_offset)
            .unwrap_or(0)
    }
}

/// Iteration setup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterError {
    /// The coroutine-list header could not be read.
    BadListHeader(u64),
}

impl std::fmt::Display for IterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterError::BadListHeader(addr) => {
                write!(f, "unreadable coroutine list header at {:#x}", addr)
            }
        }
    }
}

impl std::error::Error for IterError {}

/// Enumerates the runtime's coroutine descriptors.
///
/// Construction reads the `{ptr, len}` list header at the (rebased) list
/// address; the header being unreadable is the one hard failure the
/// enumerator can produce.
#[derive(Debug)]
pub struct CoroutineIter<'a> {
    cfg: &'a RuntimeConfig,
    list_ptr: u64,
    list_len: u64,
}

impl<'a> CoroutineIter<'a> {
    /// Read the list header at `list_addr` and build an enumerator.
    pub fn new<M: ReadMemory>(
        cfg: &'a RuntimeConfig,
        mem: &M,
        list_addr: u64,
    ) -> Result<Self, IterError> {
        let Some(list_ptr) = mem.read_u64(list_addr) else {
            return Err(IterError::BadListHeader(list_addr));
        };
        let Some(list_len) = mem.read_u64(list_addr + 8) else {
            return Err(IterError::BadListHeader(list_addr));
        };
        Ok(Self {
            cfg,
            list_ptr,
            list_len,
        })
    }

    /// Number of descriptor slots.
    #[inline]
    pub fn len(&self) -> u64 {
        self.list_len
    }

    /// Whether the list is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list_len == 0
    }

    /// Call `f` for every readable, non-null descriptor, in list order.
    pub fn for_each<M: ReadMemory>(&self, mem: &M, mut f: impl FnMut(Coroutine<'a>)) {
        for i in 0..self.list_len {
            let slot = self.list_ptr + 8 * i;
            match mem.read_u64(slot) {
                Some(addr) if addr != 0 => f(Coroutine::new(addr, self.cfg)),
                _ => {}
            }
        }
    }
}
