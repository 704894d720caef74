//! End-to-end snapshots over a canned address space.
//!
//! Each test builds a miniature paused process in `TableMemory` — module
//! bookkeeping, coroutine list, descriptors, heap objects — runs the engine
//! body against it, and checks the produced blob byte-for-byte.

use gazer_program::{ProgramBuilder, RuntimeConfig, SnapshotProgram, StaticVariable, TypeInfo};
use gazer_runtime::TableMemory;
use gazer_snapshot::{
    FAILED_DEREFERENCE_BIT, GoroutineHeader, QueueEntry, SnapshotHeader, capture, murmur2,
};

// Declared layout of the fake process (loaded with slide 0 unless a test
// says otherwise).
const MODULEDATA: u64 = 0x4000;
const TYPES_START: u64 = 0xa000;
const TYPES_END: u64 = 0xb000;
const BSS: u64 = 0x30000;
const CO_LIST: u64 = 0x30010;
const MEMSTATS: u64 = 0x30100;
const CO_SLOTS: u64 = 0x20000;
const LAST_GC: u64 = 1_234_567;

fn config() -> RuntimeConfig {
    RuntimeConfig {
        co_sched_pc_offset: 0,
        co_sched_fp_offset: 8,
        co_syscall_pc_offset: 16,
        co_id_offset: 24,
        co_status_offset: 32,
        co_stack_top_sp_offset: 40,
        first_moduledata_addr: MODULEDATA,
        moduledata_types_offset: 0,
        moduledata_etypes_offset: 8,
        moduledata_bss_offset: 16,
        bss_addr: BSS,
        coroutine_list_addr: CO_LIST,
        memstats_addr: MEMSTATS,
        mstats_last_gc_unix_offset: 0,
        stop_the_world_addr: 0x1000,
        start_the_world_addr: 0x1100,
        runtime_version: 2,
        safe_read_start_pc: 0x500,
        safe_read_end_pc: 0x540,
    }
}

/// A coroutine descriptor image.
struct Co {
    pc: u64,
    fp: u64,
    id: i64,
    status: u32,
    stack_top: u64,
}

/// Map module bookkeeping, the coroutine list, and memstats at slide
/// `slide`; descriptor slots point at `0x9000 + i * 0x100`.
fn map_process(mem: &mut TableMemory, slide: u64, cos: &[Co]) {
    mem.map_u64(MODULEDATA + slide, TYPES_START + slide);
    mem.map_u64(MODULEDATA + slide + 8, TYPES_END + slide);
    mem.map_u64(MODULEDATA + slide + 16, BSS + slide);

    mem.map_u64(CO_LIST + slide, CO_SLOTS + slide);
    mem.map_u64(CO_LIST + slide + 8, cos.len() as u64);

    let mut slots = Vec::new();
    for i in 0..cos.len() as u64 {
        slots.extend_from_slice(&(0x9000 + slide + i * 0x100).to_le_bytes());
    }
    if !slots.is_empty() {
        mem.map(CO_SLOTS + slide, slots);
    }

    for (i, co) in cos.iter().enumerate() {
        let mut d = Vec::new();
        d.extend_from_slice(&co.pc.to_le_bytes());
        d.extend_from_slice(&co.fp.to_le_bytes());
        d.extend_from_slice(&0u64.to_le_bytes());
        d.extend_from_slice(&co.id.to_le_bytes());
        d.extend_from_slice(&(co.status as u64).to_le_bytes());
        d.extend_from_slice(&co.stack_top.to_le_bytes());
        mem.map(0x9000 + slide + i as u64 * 0x100, d);
    }

    mem.map_u64(MEMSTATS + slide, LAST_GC);
}

fn program_with(cfg: RuntimeConfig) -> SnapshotProgram {
    SnapshotProgram {
        runtime_config: cfg,
        ..Default::default()
    }
}

fn rd_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

fn rd_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

const HDR: usize = SnapshotHeader::SIZE as usize; // 48
const GHDR: usize = GoroutineHeader::SIZE as usize; // 40
const QE: usize = QueueEntry::SIZE as usize; // 16

/// Walk the heap-object section, returning `(type, len, addr, data_off)`.
fn object_entries(blob: &[u8]) -> Vec<(u32, u32, u64, usize)> {
    let mut entries = Vec::new();
    let mut off = HDR + rd_u32(blob, 4) as usize; // skip coroutine section
    while off < blob.len() {
        let type_id = rd_u32(blob, off);
        let len = rd_u32(blob, off + 4);
        let addr = rd_u64(blob, off + 8);
        entries.push((type_id, len, addr, off + QE));
        let padded = (len as usize + 7) & !7;
        off += QE + padded;
    }
    assert_eq!(off, blob.len(), "object section ends at a record boundary");
    entries
}

// =============================================================================
// Scenario: empty program
// =============================================================================

#[test]
fn test_empty_program_single_coroutine() {
    let mut mem = TableMemory::new();
    map_process(
        &mut mem,
        0,
        &[Co {
            pc: 0x401000,
            fp: 0,
            id: 7,
            status: 4, // waiting
            stack_top: 0x8000,
        }],
    );
    let program = program_with(config());
    let blob = capture(&program, &mem, 0, 4096).unwrap();

    // Header + one goroutine header + one PC word.
    assert_eq!(blob.len(), HDR + GHDR + 8);
    assert_eq!(rd_u32(&blob, 0) as usize, blob.len()); // data_byte_len
    assert_eq!(rd_u32(&blob, 4) as usize, GHDR + 8); // goroutines_byte_len
    assert_eq!(rd_u32(&blob, 32), 1); // num_goroutines
    assert_eq!(rd_u32(&blob, 36), 0); // non_live_goroutines
    assert_eq!(rd_u64(&blob, 40), LAST_GC); // ktime_ns

    // Goroutine header.
    assert_eq!(rd_u64(&blob, HDR) as i64, 7); // goid
    assert_eq!(rd_u64(&blob, HDR + 8), murmur2(&[0x401000], 0)); // stack_hash
    assert_eq!(rd_u32(&blob, HDR + 16), 4); // status
    assert_eq!(rd_u32(&blob, HDR + 32), 8); // stack_bytes
    assert_eq!(rd_u32(&blob, HDR + 36), 0); // data_byte_len

    // The PC list.
    assert_eq!(rd_u64(&blob, HDR + GHDR), 0x401000);
}

#[test]
fn test_dead_and_running_are_skipped() {
    let mut mem = TableMemory::new();
    map_process(
        &mut mem,
        0,
        &[
            Co {
                pc: 0x401000,
                fp: 0,
                id: 1,
                status: 6, // dead
                stack_top: 0,
            },
            Co {
                pc: 0x401000,
                fp: 0,
                id: 2,
                status: 2, // running (the snapshotting thread itself)
                stack_top: 0,
            },
            Co {
                pc: 0x402000,
                fp: 0,
                id: 3,
                status: 4 | 0x1000, // waiting with the scan bit set
                stack_top: 0,
            },
        ],
    );
    let program = program_with(config());
    let blob = capture(&program, &mem, 0, 4096).unwrap();

    assert_eq!(rd_u32(&blob, 32), 1); // only the waiting coroutine counts
    assert_eq!(rd_u32(&blob, 36), 1); // the dead one
    assert_eq!(rd_u32(&blob, HDR + 16), 4, "scan bit is masked");
}

// =============================================================================
// Scenario: failed dereference
// =============================================================================

#[test]
fn test_failed_dereference_static_root() {
    let mut mem = TableMemory::new();
    map_process(&mut mem, 0, &[]);
    let mut program = program_with(config());
    program.type_info.insert(
        1,
        TypeInfo {
            byte_len: 8,
            ..Default::default()
        },
    );
    program.static_variables.push(StaticVariable {
        address: 0xdead_beef,
        type_id: 1,
    });
    let blob = capture(&program, &mem, 0, 4096).unwrap();

    let entries = object_entries(&blob);
    assert_eq!(entries.len(), 1);
    let (type_id, len, addr, data_off) = entries[0];
    assert_eq!(type_id, 1 | FAILED_DEREFERENCE_BIT);
    assert_eq!(len, 8);
    assert_eq!(addr, 0xdead_beef);
    assert_eq!(rd_u64(&blob, data_off), 0, "failed slot carries zeroes");
}

// =============================================================================
// Scenario: dedup
// =============================================================================

#[test]
fn test_duplicate_roots_record_once() {
    let mut mem = TableMemory::new();
    map_process(&mut mem, 0, &[]);
    mem.map(0x6000, vec![0x5a; 16]);

    let mut program = program_with(config());
    program.type_info.insert(
        2,
        TypeInfo {
            byte_len: 16,
            ..Default::default()
        },
    );
    for _ in 0..2 {
        program.static_variables.push(StaticVariable {
            address: 0x6000,
            type_id: 2,
        });
    }
    let blob = capture(&program, &mem, 0, 4096).unwrap();

    let entries = object_entries(&blob);
    assert_eq!(entries.len(), 1, "(addr, type) pairs are recorded once");
    assert_eq!(entries[0].2, 0x6000);
}

#[test]
fn test_same_address_different_types_both_record() {
    let mut mem = TableMemory::new();
    map_process(&mut mem, 0, &[]);
    mem.map(0x6000, vec![0x5a; 16]);

    let mut program = program_with(config());
    for t in [2u32, 3] {
        program.type_info.insert(
            t,
            TypeInfo {
                byte_len: 16,
                ..Default::default()
            },
        );
        program.static_variables.push(StaticVariable {
            address: 0x6000,
            type_id: t,
        });
    }
    let blob = capture(&program, &mem, 0, 4096).unwrap();
    assert_eq!(object_entries(&blob).len(), 2);
}

// =============================================================================
// Scenario: hash-map bucket sizing
// =============================================================================

/// Build a program whose type 10 is a 24-byte map header: flags at 0, the
/// bucket-count exponent at 1, buckets pointer at 8, old-buckets at 16.
fn hmap_fixture(flags: u8) -> (SnapshotProgram, TableMemory) {
    let mut mem = TableMemory::new();
    map_process(&mut mem, 0, &[]);

    let mut header = vec![0u8; 24];
    header[0] = flags;
    header[1] = 4; // B: 16 buckets
    header[8..16].copy_from_slice(&0xc000u64.to_le_bytes());
    header[16..24].copy_from_slice(&0xd000u64.to_le_bytes());
    mem.map(0x6000, header);
    mem.map(0xc000, vec![0x11; 16 * 32]);
    mem.map(0xd000, vec![0x22; 16 * 32]);

    let mut b = ProgramBuilder::new();
    b.ret(); // entry 0 stays unused; enqueue_pc 0 means "no program"
    let entry = b.here();
    b.push_imm(1);
    b.enqueue_hmap_header(20, 32, 0, 1, 8, 16);
    b.pop();
    b.ret();

    let mut program = program_with(config());
    program.bytecode = b.finish();
    program.type_info.insert(
        10,
        TypeInfo {
            byte_len: 24,
            enqueue_pc: entry,
            ..Default::default()
        },
    );
    program.type_info.insert(
        20,
        TypeInfo {
            byte_len: 16 * 32,
            ..Default::default()
        },
    );
    program.static_variables.push(StaticVariable {
        address: 0x6000,
        type_id: 10,
    });
    (program, mem)
}

#[test]
fn test_hmap_growing_halves_old_buckets() {
    let (program, mem) = hmap_fixture(0);
    let blob = capture(&program, &mem, 0, 1 << 16).unwrap();
    let entries = object_entries(&blob);
    assert_eq!(entries.len(), 3);
    assert_eq!((entries[0].0, entries[0].1, entries[0].2), (10, 24, 0x6000));
    assert_eq!(
        (entries[1].0, entries[1].1, entries[1].2),
        (20, 16 * 32, 0xc000),
        "new buckets: (1 << B) * bucket_byte_len"
    );
    assert_eq!(
        (entries[2].0, entries[2].1, entries[2].2),
        (20, 8 * 32, 0xd000),
        "old buckets halve while growing"
    );
}

#[test]
fn test_hmap_same_size_grow_keeps_old_bucket_count() {
    let (program, mem) = hmap_fixture(0x08);
    let blob = capture(&program, &mem, 0, 1 << 16).unwrap();
    let entries = object_entries(&blob);
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[1].1, 16 * 32);
    assert_eq!(entries[2].1, 16 * 32, "same-size grow: both arrays equal");
}

// =============================================================================
// Scenario: overflow
// =============================================================================

#[test]
fn test_overflow_truncates_at_record_boundary() {
    let mut mem = TableMemory::new();
    map_process(
        &mut mem,
        0,
        &[Co {
            pc: 0x401000,
            fp: 0,
            id: 1,
            status: 4,
            stack_top: 0x8000,
        }],
    );
    mem.map(0x6000, vec![0x77; 2048]);

    let mut program = program_with(config());
    program.type_info.insert(
        5,
        TypeInfo {
            byte_len: 2048,
            ..Default::default()
        },
    );
    program.static_variables.push(StaticVariable {
        address: 0x6000,
        type_id: 5,
    });
    let blob = capture(&program, &mem, 0, 1024).unwrap();

    // The oversized object was dropped; the blob still ends cleanly after
    // the coroutine section and stays self-consistent.
    assert_eq!(rd_u32(&blob, 0) as usize, blob.len());
    assert_eq!(blob.len(), HDR + GHDR + 8);
    assert_eq!(rd_u32(&blob, 32), 1, "observed count survives the overflow");
    assert!(object_entries(&blob).is_empty());
}

// =============================================================================
// Stack sharing and self-consistency
// =============================================================================

#[test]
fn test_identical_stacks_share_hash_and_words() {
    let mut mem = TableMemory::new();
    // Two coroutines parked at the same PC with no frame chain.
    map_process(
        &mut mem,
        0,
        &[
            Co {
                pc: 0x401000,
                fp: 0,
                id: 1,
                status: 4,
                stack_top: 0x8000,
            },
            Co {
                pc: 0x401000,
                fp: 0,
                id: 2,
                status: 4,
                stack_top: 0x9000,
            },
        ],
    );
    let program = program_with(config());
    let blob = capture(&program, &mem, 0, 4096).unwrap();

    let first = HDR;
    let second = HDR + GHDR + 8; // first record carries the 8-byte stack
    assert_eq!(rd_u64(&blob, first + 8), rd_u64(&blob, second + 8));
    assert_eq!(rd_u32(&blob, first + 32), 8, "first writes the stack");
    assert_eq!(rd_u32(&blob, second + 32), 0, "second reuses it");
    assert_eq!(blob.len(), HDR + 2 * GHDR + 8);
}

#[test]
fn test_goroutine_section_accounting() {
    let mut mem = TableMemory::new();
    map_process(
        &mut mem,
        0,
        &[
            Co {
                pc: 0x401000,
                fp: 0,
                id: 1,
                status: 4,
                stack_top: 0,
            },
            Co {
                pc: 0x402000,
                fp: 0,
                id: 2,
                status: 1,
                stack_top: 0,
            },
        ],
    );
    let mut program = program_with(config());
    mem.map(0x6000, vec![1; 8]);
    program.type_info.insert(
        1,
        TypeInfo {
            byte_len: 8,
            ..Default::default()
        },
    );
    program.static_variables.push(StaticVariable {
        address: 0x6000,
        type_id: 1,
    });
    let blob = capture(&program, &mem, 0, 4096).unwrap();

    // Walk the coroutine section record by record; the declared section
    // length must land exactly on its end.
    let goroutines_byte_len = rd_u32(&blob, 4) as usize;
    let mut off = HDR;
    let mut records = 0;
    while off < HDR + goroutines_byte_len {
        let stack_bytes = rd_u32(&blob, off + 32) as usize;
        let data_byte_len = rd_u32(&blob, off + 36) as usize;
        off += GHDR + stack_bytes + data_byte_len;
        records += 1;
    }
    assert_eq!(off, HDR + goroutines_byte_len);
    assert_eq!(records, 2);

    // Everything after is the object section, 8-aligned throughout.
    for (_, _, _, data_off) in object_entries(&blob) {
        assert_eq!(data_off % 8, 0);
    }
}

// =============================================================================
// Frame extraction end to end
// =============================================================================

#[test]
fn test_frame_of_interest_extracts_local_and_follows_pointer() {
    let mut mem = TableMemory::new();
    map_process(
        &mut mem,
        0,
        &[Co {
            pc: 0x401000,
            fp: 0x7000,
            id: 1,
            status: 4,
            stack_top: 0x7200,
        }],
    );
    // One stack frame: {caller_fp = 0, caller_pc = 0x402000} at 0x7000.
    let mut frame = Vec::new();
    frame.extend_from_slice(&0u64.to_le_bytes());
    frame.extend_from_slice(&0x402000u64.to_le_bytes());
    mem.map(0x7000, frame);

    // The leaf frame holds one local: a pointer to a 16-byte object. On
    // x86_64 the CFA is fp + 16 = 0x7010; the local spills below the saved
    // frame pair, at CFA - 24.
    #[cfg(target_arch = "x86_64")]
    mem.map_u64(0x6ff8, 0x6000);
    // On aarch64 the leaf CFA lands elsewhere; the dereference fails soft
    // there and the frame slot stays zeroed.
    mem.map(0x6000, vec![0x3c; 16]);

    let mut b = ProgramBuilder::new();
    b.ret();
    let entry = b.here();
    b.prepare_frame_data(1, 8, 40);
    b.dereference_cfa_offset(-24, 8, 0);
    b.enqueue_pointer(6);
    b.conclude_frame_data();
    b.ret();

    let mut program = program_with(config());
    program.bytecode = b.finish();
    program.type_info.insert(
        6,
        TypeInfo {
            byte_len: 16,
            ..Default::default()
        },
    );
    // Classify PC 0x401000 as a frame of interest.
    program.pc_classifier.target_pc = vec![0x401fff];
    program.pc_classifier.prog_pc = vec![entry];

    let blob = capture(&program, &mem, 0, 1 << 16).unwrap();

    // Coroutine record: header + 16 bytes of PCs + one frame record.
    let frame_off = HDR + GHDR + 16;
    let entry_off = frame_off + 8;
    assert_eq!(rd_u32(&blob, entry_off), 40, "frame entry carries type id");
    assert_eq!(rd_u32(&blob, entry_off + 4), 16, "data_len + 8");

    #[cfg(target_arch = "x86_64")]
    {
        let data_off = entry_off + QE;
        assert_eq!(rd_u64(&blob, data_off), 0x6000, "extracted local");
        // The pointed-to object landed in the object section.
        let entries = object_entries(&blob);
        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].0, entries[0].1, entries[0].2), (6, 16, 0x6000));
    }
}

// =============================================================================
// ASLR slide
// =============================================================================

#[test]
fn test_nonzero_slide_rebases_statics_and_pcs() {
    const SLIDE: u64 = 0x10_0000;
    let mut mem = TableMemory::new();
    map_process(
        &mut mem,
        SLIDE,
        &[Co {
            pc: 0x401000 + SLIDE,
            fp: 0,
            id: 1,
            status: 4,
            stack_top: 0,
        }],
    );
    let program = program_with(config());
    let blob = capture(&program, &mem, SLIDE, 4096).unwrap();

    assert_eq!(rd_u32(&blob, 32), 1);
    assert_eq!(rd_u64(&blob, 40), LAST_GC, "memstats found through slide");
    // Reported PCs match the unrelocated binary.
    assert_eq!(rd_u64(&blob, HDR + GHDR), 0x401000);
}
