//! The framing protocol of the output blob.
//!
//! A binary layout shared with the external decoder. All multi-byte fields
//! are little-endian; every record is padded so the next one starts
//! 8-byte-aligned relative to the blob start. These structs are written
//! into the output buffer in place, so their `#[repr(C)]` layout is the
//! wire format.

/// Set on a queue entry's type field when dereferencing its address failed;
/// the data region is zeroed.
pub const FAILED_DEREFERENCE_BIT: u32 = 1 << 31;

/// Timing and population counters embedded in the snapshot header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Nanoseconds spent unwinding and recording stacks.
    pub stacks_duration_ns: u64,
    /// Nanoseconds spent draining the pointer queue.
    pub pointer_duration_ns: u64,
    /// Total pause nanoseconds.
    pub total_duration_ns: u64,
    /// Live coroutines observed.
    pub num_goroutines: u32,
    /// Dead coroutines skipped.
    pub non_live_goroutines: u32,
}

/// Leading record of every blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotHeader {
    /// Total blob bytes, this header included.
    pub data_byte_len: u32,
    /// Bytes of the coroutine section (everything between this header and
    /// the heap-object section).
    pub goroutines_byte_len: u32,
    /// Counters.
    pub statistics: Statistics,
    /// Last-GC unix time read from the runtime's memory statistics.
    pub ktime_ns: u64,
}

impl SnapshotHeader {
    /// Wire size of the header.
    pub const SIZE: u32 = std::mem::size_of::<SnapshotHeader>() as u32;
}

/// Per-coroutine record header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GoroutineHeader {
    /// Coroutine id.
    pub goid: i64,
    /// Hash of the PC list, leaf to root.
    pub stack_hash: u64,
    /// Masked scheduling status.
    pub status: u32,
    /// Reserved; the unwinder does not recover wait reasons.
    pub wait_reason: u8,
    /// Explicit padding; always zero.
    pub _pad: [u8; 3],
    /// Reserved; see `wait_reason`.
    pub wait_since_nanos: i64,
    /// Bytes of raw PC words following this header; zero when a previous
    /// coroutine with the same stack hash already wrote them.
    pub stack_bytes: u32,
    /// Bytes of frame records following the PC words.
    pub data_byte_len: u32,
}

impl GoroutineHeader {
    /// Wire size of the header.
    pub const SIZE: u32 = std::mem::size_of::<GoroutineHeader>() as u32;
}

/// Describes one recorded memory region: a stack frame's locals or a heap
/// object.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueEntry {
    /// Compact type id; high bit flags a failed dereference.
    pub type_id: u32,
    /// Byte length of the recorded data.
    pub len: u32,
    /// Source address the data was read from (zero for synthetic records).
    pub addr: u64,
}

impl QueueEntry {
    /// Wire size of the entry.
    pub const SIZE: u32 = std::mem::size_of::<QueueEntry>() as u32;
}

/// Header of a frame record inside a coroutine's data section.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameHeader {
    /// Bytes of the frame record after this header. Used as a scratch
    /// start-marker while the frame is open; finalized on conclude.
    pub data_byte_len: u32,
    /// Reserved.
    pub _pad: u32,
}

impl FrameHeader {
    /// Wire size of the header.
    pub const SIZE: u32 = std::mem::size_of::<FrameHeader>() as u32;
}

// Layout is the wire contract; catch drift at compile time.
const _: () = {
    assert!(std::mem::size_of::<Statistics>() == 32);
    assert!(std::mem::size_of::<SnapshotHeader>() == 48);
    assert!(std::mem::size_of::<GoroutineHeader>() == 40);
    assert!(std::mem::size_of::<QueueEntry>() == 16);
    assert!(std::mem::size_of::<FrameHeader>() == 8);
    assert!(std::mem::align_of::<SnapshotHeader>() == 8);
    assert!(std::mem::align_of::<GoroutineHeader>() == 8);
    assert!(std::mem::align_of::<QueueEntry>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets_match_wire_layout() {
        assert_eq!(std::mem::offset_of!(SnapshotHeader, data_byte_len), 0);
        assert_eq!(std::mem::offset_of!(SnapshotHeader, goroutines_byte_len), 4);
        assert_eq!(std::mem::offset_of!(SnapshotHeader, statistics), 8);
        assert_eq!(std::mem::offset_of!(SnapshotHeader, ktime_ns), 40);

        assert_eq!(std::mem::offset_of!(GoroutineHeader, goid), 0);
        assert_eq!(std::mem::offset_of!(GoroutineHeader, stack_hash), 8);
        assert_eq!(std::mem::offset_of!(GoroutineHeader, status), 16);
        assert_eq!(std::mem::offset_of!(GoroutineHeader, wait_reason), 20);
        assert_eq!(std::mem::offset_of!(GoroutineHeader, wait_since_nanos), 24);
        assert_eq!(std::mem::offset_of!(GoroutineHeader, stack_bytes), 32);
        assert_eq!(std::mem::offset_of!(GoroutineHeader, data_byte_len), 36);

        assert_eq!(std::mem::offset_of!(QueueEntry, type_id), 0);
        assert_eq!(std::mem::offset_of!(QueueEntry, len), 4);
        assert_eq!(std::mem::offset_of!(QueueEntry, addr), 8);
    }
}
