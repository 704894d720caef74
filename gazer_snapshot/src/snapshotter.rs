//! The snapshot orchestrator.
//!
//! Ties the engine together: writes the blob headers, enumerates and
//! unwinds coroutines, classifies frames of interest, runs the traversal
//! machine, and drains the pointer queue — all under one world stop. The
//! engine body is generic over the memory seam so the end-to-end fixtures
//! can run it against a canned address space without pausing anything;
//! [`snapshot`] is the production path over [`LiveMemory`].

use std::time::{Instant, SystemTime};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use gazer_program::SnapshotProgram;
use gazer_runtime::{
    BootTimeError, CoroutineIter, IterError, LiveMemory, Moduledata, ReadMemory, SCAN_BIT, Status,
    boot_time,
};
use gazer_world::{WorldError, platform_supported, relocation_base, stop_the_world};

use crate::framing::{GoroutineHeader, SnapshotHeader};
use crate::hash::murmur2;
use crate::machine::{MachineCtx, StackMachine};
use crate::out_buf::{OutBuf, SnapshotHeaderHandle};
use crate::queue::TraversalQueue;
use crate::resolver::RuntimeTypeResolver;
use crate::unwinder::Unwinder;

/// Default output arena capacity.
pub const DEFAULT_CAPACITY: u32 = 1 << 20;

/// A completed snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotResponse {
    /// The self-describing blob.
    pub data: Vec<u8>,
    /// Wall-clock time at snapshot start.
    pub timestamp: SystemTime,
    /// Total pause nanoseconds.
    pub pause_duration_ns: u64,
    /// Base for converting monotonic readings to wall-clock times;
    /// absent where the platform offers no way to compute it.
    pub approximate_boot_time: Option<SystemTime>,
}

/// Hard snapshot failures. Soft conditions (full output, failed
/// dereferences, interpreter faults) are carried inside the blob instead.
#[derive(Debug)]
pub enum SnapshotError {
    /// The world could not be stopped.
    World(WorldError),
    /// The coroutine enumerator could not be constructed.
    Iterator(IterError),
    /// Moduledata was unreadable at the given address.
    Moduledata(u64),
    /// The output buffer could not fit the snapshot header.
    HeaderWrite,
    /// Boot time lookup failed for a reason other than "not implemented".
    BootTime(BootTimeError),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::World(e) => write!(f, "failed to stop the world: {}", e),
            SnapshotError::Iterator(e) => {
                write!(f, "failed to construct coroutine iterator: {}", e)
            }
            SnapshotError::Moduledata(addr) => {
                write!(f, "unreadable moduledata at {:#x}", addr)
            }
            SnapshotError::HeaderWrite => write!(f, "failed to write snapshot header"),
            SnapshotError::BootTime(e) => write!(f, "failed to get boot time: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::World(e) => Some(e),
            SnapshotError::Iterator(e) => Some(e),
            SnapshotError::BootTime(e) => Some(e),
            _ => None,
        }
    }
}

/// A stack frame with typed extraction logic: its index in the frame list
/// and the program entry to run on it.
#[derive(Debug, Clone, Copy)]
struct FrameOfInterest {
    idx: u32,
    pc: u32,
}

/// The engine, generic over the observed address space.
pub struct Snapshotter<'p, M: ReadMemory> {
    program: &'p SnapshotProgram,
    mem: &'p M,
    base: u64,
    out: OutBuf,
    queue: TraversalQueue,
    unwinder: Box<Unwinder>,
    machine: StackMachine,
    types: RuntimeTypeResolver,
    /// Stack hash to frames of interest; coroutines sharing a stack reuse
    /// the classification and skip rewriting the PC words.
    stacks: FxHashMap<u64, SmallVec<[FrameOfInterest; 4]>>,
}

impl<'p, M: ReadMemory> Snapshotter<'p, M> {
    /// Build an engine over `mem`, loaded with slide `base`.
    pub fn new(program: &'p SnapshotProgram, mem: &'p M, base: u64, capacity: u32) -> Self {
        Snapshotter {
            program,
            mem,
            base,
            out: OutBuf::with_capacity(capacity),
            queue: TraversalQueue::new(),
            unwinder: Unwinder::new(base),
            machine: StackMachine::new(),
            types: RuntimeTypeResolver::default(),
            stacks: FxHashMap::with_capacity_and_hasher(512, Default::default()),
        }
    }

    /// Append the snapshot header. Must be the first write.
    pub fn write_header(&mut self) -> Option<SnapshotHeaderHandle> {
        self.out.write_snapshot_header()
    }

    /// The engine body. Must run while the observed memory is quiescent —
    /// under the world stop in production, trivially for canned memory.
    pub fn run_stopped(&mut self, header: SnapshotHeaderHandle) -> Result<(), SnapshotError> {
        let t0 = Instant::now();
        let program = self.program;
        let mem = self.mem;
        let cfg = &program.runtime_config;

        let md = Moduledata::locate(cfg, self.base);
        let Some(bss) = md.bss(mem) else {
            return Err(SnapshotError::Moduledata(md.addr()));
        };
        self.types = RuntimeTypeResolver::new(md.type_range(mem));

        let list_addr = cfg.rebase_static(cfg.coroutine_list_addr, bss);
        let iter = CoroutineIter::new(cfg, mem, list_addr).map_err(SnapshotError::Iterator)?;
        iter.for_each(mem, |co| {
            let before = self.out.len();
            self.snapshot_coroutine(header, &co);
            if self.out.full() {
                self.out.truncate(before);
            }
        });

        let after_stacks = Instant::now();
        {
            let h = self.out.snapshot_header_mut(header);
            h.statistics.stacks_duration_ns = (after_stacks - t0).as_nanos() as u64;
        }
        let goroutines_byte_len = self.out.len() - SnapshotHeader::SIZE;
        self.out.snapshot_header_mut(header).goroutines_byte_len = goroutines_byte_len;

        for v in &program.static_variables {
            self.queue.push(v.address, v.type_id, 0);
        }
        self.process_queue();

        let memstats_addr = cfg.rebase_static(cfg.memstats_addr, bss);
        let last_gc = mem
            .read_u64(memstats_addr + cfg.mstats_last_gc_unix_offset)
            .unwrap_or(0);
        let h = self.out.snapshot_header_mut(header);
        h.ktime_ns = last_gc;
        h.statistics.pointer_duration_ns = after_stacks.elapsed().as_nanos() as u64;
        Ok(())
    }

    /// Record one coroutine: header, stack, frames of interest.
    fn snapshot_coroutine(&mut self, header: SnapshotHeaderHandle, co: &gazer_runtime::Coroutine<'_>) {
        if self.out.full() {
            return;
        }
        let program = self.program;
        let mem = self.mem;

        let status = co.status_raw(mem) & !SCAN_BIT;
        if status == Status::Dead.as_u32() {
            self.out
                .snapshot_header_mut(header)
                .statistics
                .non_live_goroutines += 1;
            return;
        }
        // Our own coroutine: no usable unwind context, and no interest.
        if status == Status::Running.as_u32() {
            return;
        }
        self.out
            .snapshot_header_mut(header)
            .statistics
            .num_goroutines += 1;

        let (pcs, cfas) =
            self.unwinder
                .walk_stack(mem, co.pc(mem), co.fp(mem), co.stack_top_sp(mem));
        let stack_hash = murmur2(pcs, 0);

        let Some(gh) = self.out.write_goroutine_header() else {
            return;
        };
        let mut stack_bytes = 0u32;
        let fois: SmallVec<[FrameOfInterest; 4]>;
        if let Some(known) = self.stacks.get(&stack_hash) {
            fois = known.clone();
        } else {
            // First sight of this stack: write the PC words and classify.
            let Some(written) = self.out.write_stack(pcs) else {
                return;
            };
            stack_bytes = written;
            let mut classified = SmallVec::new();
            for (i, &pc) in pcs.iter().enumerate() {
                if let Some(prog_pc) = program.pc_classifier.classify(pc) {
                    classified.push(FrameOfInterest {
                        idx: i as u32,
                        pc: prog_pc,
                    });
                }
            }
            self.stacks.insert(stack_hash, classified.clone());
            fois = classified;
        }
        let after_stack = self.out.len();

        // Frames of interest run leaf to root.
        let ctx = MachineCtx {
            program,
            mem,
            types: &self.types,
        };
        for foi in &fois {
            let offset = self.out.len();
            if !self.machine.run(
                &ctx,
                &mut self.out,
                &mut self.queue,
                foi.pc,
                cfas[foi.idx as usize],
                foi.idx,
                offset,
            ) {
                break;
            }
        }

        *self.out.goroutine_header_mut(gh) = GoroutineHeader {
            goid: co.id(mem),
            stack_hash,
            status,
            wait_reason: 0,
            _pad: [0; 3],
            wait_since_nanos: 0,
            stack_bytes,
            data_byte_len: self.out.len() - after_stack,
        };
    }

    /// Drain the traversal queue into the output, running each type's
    /// follow-up program over the freshly recorded data.
    fn process_queue(&mut self) {
        let program = self.program;
        let mem = self.mem;
        let ctx = MachineCtx {
            program,
            mem,
            types: &self.types,
        };
        while !self.out.full() {
            let Some(mut entry) = self.queue.pop() else {
                break;
            };
            let Some(info) = program.type_info(entry.type_id) else {
                continue;
            };
            // Length 0 means "the type's natural length"; longer requests
            // clamp to it; zero-length types are never recorded.
            if entry.len == 0 {
                entry.len = info.byte_len;
            }
            if entry.len > info.byte_len {
                entry.len = info.byte_len;
            }
            if entry.len == 0 {
                continue;
            }
            let Some(offset) = self.out.write_queue_entry(mem, entry) else {
                continue;
            };
            if info.enqueue_pc == 0 {
                continue;
            }
            self.machine.run(
                &ctx,
                &mut self.out,
                &mut self.queue,
                info.enqueue_pc,
                0,
                0,
                offset,
            );
        }
    }

    /// Finalize the header and hand back the blob.
    pub fn finalize(mut self, header: SnapshotHeaderHandle, total_duration_ns: u64) -> Vec<u8> {
        let len = self.out.len();
        let h = self.out.snapshot_header_mut(header);
        h.data_byte_len = len;
        h.statistics.total_duration_ns = total_duration_ns;
        self.out.to_vec()
    }
}

/// Run the engine over a canned address space without stopping anything.
///
/// The fixture path: identical byte-for-byte behavior to the stopped-world
/// body, minus the pause.
pub fn capture<M: ReadMemory>(
    program: &SnapshotProgram,
    mem: &M,
    base: u64,
    capacity: u32,
) -> Result<Vec<u8>, SnapshotError> {
    let t0 = Instant::now();
    let mut engine = Snapshotter::new(program, mem, base, capacity);
    let header = engine.write_header().ok_or(SnapshotError::HeaderWrite)?;
    engine.run_stopped(header)?;
    let total_ns = t0.elapsed().as_nanos() as u64;
    Ok(engine.finalize(header, total_ns))
}

/// Take a snapshot of the current process.
///
/// Stops the world, records every non-running coroutine's stack and the
/// object graph reachable from the program's roots, and returns the blob
/// with timing metadata. Hard failures are returned; a full buffer is not
/// a failure — the blob is truncated at a record boundary and its
/// statistics show how many coroutines were observed versus included.
pub fn snapshot(program: &SnapshotProgram) -> Result<SnapshotResponse, SnapshotError> {
    platform_supported().map_err(SnapshotError::World)?;
    program
        .runtime_config
        .validate()
        .map_err(|e| SnapshotError::World(WorldError::Config(e)))?;

    let timestamp = SystemTime::now();
    let t0 = Instant::now();
    let mem = LiveMemory;
    let base = relocation_base(&program.runtime_config);

    let mut engine = Snapshotter::new(program, &mem, base, DEFAULT_CAPACITY);
    let header = engine.write_header().ok_or(SnapshotError::HeaderWrite)?;

    let mut body_result: Result<(), SnapshotError> = Ok(());
    stop_the_world(&program.runtime_config, || {
        body_result = engine.run_stopped(header);
    })
    .map_err(SnapshotError::World)?;
    body_result?;

    let pause_duration_ns = t0.elapsed().as_nanos() as u64;
    let data = engine.finalize(header, pause_duration_ns);

    let approximate_boot_time = match boot_time() {
        Ok(t) => Some(t),
        Err(BootTimeError::NotImplemented) => None,
        Err(e) => return Err(SnapshotError::BootTime(e)),
    };

    Ok(SnapshotResponse {
        data,
        timestamp,
        pause_duration_ns,
        approximate_boot_time,
    })
}
