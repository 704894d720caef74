//! The fixed-capacity output arena.
//!
//! One 8-aligned allocation sized up front; nothing grows during the pause.
//! Appends that would exceed capacity flip the buffer into the *full* state
//! and fail without partial writes. Headers that need later in-place
//! patching are addressed through typed offset handles instead of raw
//! pointers; every handle is created at an 8-aligned offset, so resolving
//! one to a reference is well-formed.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use gazer_runtime::ReadMemory;

use crate::framing::{
    FAILED_DEREFERENCE_BIT, FrameHeader, GoroutineHeader, QueueEntry, SnapshotHeader,
};

/// Round up to the record alignment.
#[inline]
pub(crate) fn pad8(len: u32) -> u32 {
    len.wrapping_add(7) & !7
}

/// Offset handle to the snapshot header.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotHeaderHandle(u32);

/// Offset handle to a coroutine header.
#[derive(Debug, Clone, Copy)]
pub struct GoroutineHeaderHandle(u32);

/// Offset handle to an open frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHandle(u32);

/// Fixed-capacity byte arena the snapshot is assembled in.
pub struct OutBuf {
    ptr: NonNull<u8>,
    cap: u32,
    len: u32,
    is_full: bool,
}

// SAFETY: the buffer owns its allocation exclusively.
unsafe impl Send for OutBuf {}

impl OutBuf {
    /// Allocate a zeroed arena. Capacity is rounded up to 8 bytes.
    pub fn with_capacity(cap: u32) -> OutBuf {
        let cap = pad8(cap.max(8));
        let layout = Layout::from_size_align(cap as usize, 8).expect("arena layout");
        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        OutBuf {
            ptr,
            cap,
            len: 0,
            is_full: false,
        }
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether an append has ever overflowed capacity.
    #[inline]
    pub fn full(&self) -> bool {
        self.is_full
    }

    /// Roll written length back to `offset`. The full flag is sticky.
    pub fn truncate(&mut self, offset: u32) {
        debug_assert!(offset <= self.len);
        self.len = offset.min(self.len);
    }

    /// The assembled bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: 0..len is initialized (zeroed at alloc, overwritten since).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize) }
    }

    /// Copy the assembled bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Extend the written length to `min_len`, flipping the full flag when
    /// capacity does not allow it.
    fn ensure_len(&mut self, min_len: u32) -> bool {
        if min_len <= self.len {
            return true;
        }
        if min_len > self.cap {
            self.is_full = true;
            return false;
        }
        self.len = min_len;
        true
    }

    #[inline]
    fn at(&self, offset: u32) -> *mut u8 {
        debug_assert!(offset <= self.cap);
        // SAFETY: offset is within the allocation per the debug assert;
        // callers only pass offsets they obtained from this buffer.
        unsafe { self.ptr.as_ptr().add(offset as usize) }
    }

    // =========================================================================
    // Scalar access
    // =========================================================================

    /// Read a `u64` at `offset`; zero when out of bounds.
    #[inline]
    pub fn read_u64(&self, offset: u32) -> u64 {
        if offset.checked_add(8).is_none_or(|end| end > self.cap) {
            return 0;
        }
        // SAFETY: bounds checked above.
        unsafe { (self.at(offset) as *const u64).read_unaligned().to_le() }
    }

    /// Read a `u32` at `offset`; zero when out of bounds.
    #[inline]
    pub fn read_u32(&self, offset: u32) -> u32 {
        if offset.checked_add(4).is_none_or(|end| end > self.cap) {
            return 0;
        }
        // SAFETY: bounds checked above.
        unsafe { (self.at(offset) as *const u32).read_unaligned().to_le() }
    }

    /// Read one byte at `offset`; zero when out of bounds.
    #[inline]
    pub fn read_u8(&self, offset: u32) -> u8 {
        if offset >= self.cap {
            return 0;
        }
        // SAFETY: bounds checked above.
        unsafe { *self.at(offset) }
    }

    /// Write a `u64` at `offset`; ignored when out of bounds.
    #[inline]
    pub fn write_u64(&mut self, offset: u32, v: u64) {
        if offset.checked_add(8).is_none_or(|end| end > self.cap) {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe { (self.at(offset) as *mut u64).write_unaligned(v.to_le()) }
    }

    /// Write a `u32` at `offset`; ignored when out of bounds.
    #[inline]
    pub fn write_u32(&mut self, offset: u32, v: u32) {
        if offset.checked_add(4).is_none_or(|end| end > self.cap) {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe { (self.at(offset) as *mut u32).write_unaligned(v.to_le()) }
    }

    /// Write one byte at `offset`; ignored when out of bounds.
    #[inline]
    pub fn write_u8(&mut self, offset: u32, v: u8) {
        if offset >= self.cap {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe { *self.at(offset) = v }
    }

    // =========================================================================
    // Structural edits
    // =========================================================================

    /// Zero `n` bytes at `offset`. Out-of-bounds requests are ignored.
    pub fn zero(&mut self, offset: u32, n: u32) {
        let Some(end) = offset.checked_add(n) else {
            return;
        };
        if end > self.cap {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe { std::ptr::write_bytes(self.at(offset), 0, n as usize) }
    }

    /// Copy `n` buffer bytes from `src` to `dst`. Ranges must not overlap;
    /// out-of-bounds requests are ignored.
    pub fn copy(&mut self, src: u32, dst: u32, n: u32) {
        let (Some(src_end), Some(dst_end)) = (src.checked_add(n), dst.checked_add(n)) else {
            return;
        };
        if src_end > self.cap || dst_end > self.cap {
            return;
        }
        // SAFETY: bounds checked above; caller guarantees disjointness.
        unsafe { std::ptr::copy_nonoverlapping(self.at(src), self.at(dst), n as usize) }
    }

    /// Dereference `n` bytes at `addr` into the buffer at `offset`. On
    /// failure the destination region is zeroed.
    pub fn dereference<M: ReadMemory>(&mut self, mem: &M, offset: u32, addr: u64, n: u32) -> bool {
        let Some(end) = offset.checked_add(n) else {
            return false;
        };
        if end > self.cap {
            return false;
        }
        // SAFETY: bounds checked above; the region belongs to this buffer.
        let dst = unsafe { std::slice::from_raw_parts_mut(self.at(offset), n as usize) };
        if !mem.read_into(dst, addr) {
            self.zero(offset, n);
            return false;
        }
        true
    }

    // =========================================================================
    // Record appends
    // =========================================================================

    /// Append a zeroed snapshot header.
    pub fn write_snapshot_header(&mut self) -> Option<SnapshotHeaderHandle> {
        let offset = self.len;
        if !self.ensure_len(offset + SnapshotHeader::SIZE) {
            return None;
        }
        self.zero(offset, SnapshotHeader::SIZE);
        Some(SnapshotHeaderHandle(offset))
    }

    /// Resolve a snapshot-header handle for patching.
    pub fn snapshot_header_mut(&mut self, h: SnapshotHeaderHandle) -> &mut SnapshotHeader {
        debug_assert!(h.0 % 8 == 0 && h.0 + SnapshotHeader::SIZE <= self.cap);
        // SAFETY: the handle was created at an 8-aligned in-bounds offset.
        unsafe { &mut *(self.at(h.0) as *mut SnapshotHeader) }
    }

    /// Append a zeroed coroutine header.
    pub fn write_goroutine_header(&mut self) -> Option<GoroutineHeaderHandle> {
        let offset = self.len;
        if !self.ensure_len(offset + GoroutineHeader::SIZE) {
            return None;
        }
        self.zero(offset, GoroutineHeader::SIZE);
        Some(GoroutineHeaderHandle(offset))
    }

    /// Resolve a coroutine-header handle for patching.
    pub fn goroutine_header_mut(&mut self, h: GoroutineHeaderHandle) -> &mut GoroutineHeader {
        debug_assert!(h.0 % 8 == 0 && h.0 + GoroutineHeader::SIZE <= self.cap);
        // SAFETY: the handle was created at an 8-aligned in-bounds offset.
        unsafe { &mut *(self.at(h.0) as *mut GoroutineHeader) }
    }

    /// Append raw PC words. Returns the byte length written.
    pub fn write_stack(&mut self, pcs: &[u64]) -> Option<u32> {
        let offset = self.len;
        let byte_len = (pcs.len() as u32) * 8;
        if !self.ensure_len(offset + byte_len) {
            return None;
        }
        for (i, &pc) in pcs.iter().enumerate() {
            self.write_u64(offset + (i as u32) * 8, pc);
        }
        Some(byte_len)
    }

    /// Append a queue entry and dereference its data after it (padded to 8
    /// bytes). On dereference failure the entry stays in the output with
    /// the failed bit set over zeroed data, and `None` is returned.
    pub fn write_queue_entry<M: ReadMemory>(
        &mut self,
        mem: &M,
        entry: QueueEntry,
    ) -> Option<u32> {
        let header_offset = self.len;
        let padded = pad8(entry.len);
        if !self.ensure_len(header_offset + QueueEntry::SIZE + padded) {
            return None;
        }
        self.write_u32(header_offset, entry.type_id);
        self.write_u32(header_offset + 4, entry.len);
        self.write_u64(header_offset + 8, entry.addr);
        let data_offset = header_offset + QueueEntry::SIZE;
        // Stale bytes may remain in the padding after a rollback; the data
        // region itself is always overwritten or zeroed.
        self.zero(data_offset + entry.len, padded - entry.len);
        if !self.dereference(mem, data_offset, entry.addr, entry.len) {
            self.write_u32(header_offset, entry.type_id | FAILED_DEREFERENCE_BIT);
            return None;
        }
        Some(data_offset)
    }

    /// Reads the length out of the queue entry that ends at `entry_data_offset`.
    pub fn get_entry_len(&self, entry_data_offset: u32) -> u32 {
        if entry_data_offset < QueueEntry::SIZE {
            return 0;
        }
        self.read_u32(entry_data_offset - QueueEntry::SIZE + 4)
    }

    /// Open a frame record: frame header, queue entry (`len = data_len + 8`,
    /// `addr = 0`), a padded data region, and a trailing `{prog_id, depth}`
    /// pair at `data + data_len`.
    ///
    /// The frame header's length field temporarily stores the record's
    /// start marker; [`OutBuf::conclude_frame_data`] turns it into the
    /// final byte length. Returns the frame handle and the data offset.
    pub fn prepare_frame_data(
        &mut self,
        type_id: u32,
        prog_id: u32,
        data_len: u32,
        depth: u32,
    ) -> Option<(FrameHandle, u32)> {
        let frame_offset = self.len;
        let padded = pad8(data_len);
        let new_len = frame_offset + FrameHeader::SIZE + QueueEntry::SIZE + padded + 8;
        if !self.ensure_len(new_len) {
            return None;
        }
        let entry_offset = frame_offset + FrameHeader::SIZE;
        // Start marker; finalized by conclude_frame_data.
        self.write_u32(frame_offset, entry_offset);
        self.write_u32(frame_offset + 4, 0);
        self.write_u32(entry_offset, type_id);
        self.write_u32(entry_offset + 4, data_len + 8);
        self.write_u64(entry_offset + 8, 0);
        let data_offset = entry_offset + QueueEntry::SIZE;
        self.zero(data_offset, padded + 8);
        self.write_u32(data_offset + data_len, prog_id);
        self.write_u32(data_offset + data_len + 4, depth);
        Some((FrameHandle(frame_offset), data_offset))
    }

    /// Finalize an open frame record's byte length.
    pub fn conclude_frame_data(&mut self, h: FrameHandle) {
        let start_marker = self.read_u32(h.0);
        self.write_u32(h.0, self.len - start_marker);
    }
}

impl Drop for OutBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.cap as usize, 8).expect("arena layout");
        // SAFETY: allocated with this exact layout in with_capacity.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gazer_runtime::TableMemory;

    #[test]
    fn test_append_headers_and_len() {
        let mut out = OutBuf::with_capacity(4096);
        let sh = out.write_snapshot_header().unwrap();
        assert_eq!(out.len(), SnapshotHeader::SIZE);
        let gh = out.write_goroutine_header().unwrap();
        assert_eq!(out.len(), SnapshotHeader::SIZE + GoroutineHeader::SIZE);

        out.snapshot_header_mut(sh).statistics.num_goroutines = 3;
        out.goroutine_header_mut(gh).goid = 42;
        let blob = out.to_vec();
        // num_goroutines sits at header offset 8 + 24.
        assert_eq!(u32::from_le_bytes(blob[32..36].try_into().unwrap()), 3);
        assert_eq!(
            i64::from_le_bytes(blob[48..56].try_into().unwrap()),
            42
        );
    }

    #[test]
    fn test_full_flag_and_rollback() {
        let mut out = OutBuf::with_capacity(64);
        assert!(out.write_snapshot_header().is_some()); // 48 bytes
        assert!(!out.full());
        // 40 more bytes do not fit in 64.
        assert!(out.write_goroutine_header().is_none());
        assert!(out.full());
        assert_eq!(out.len(), 48, "failed append must not move the length");
        out.truncate(0);
        assert_eq!(out.len(), 0);
        assert!(out.full(), "full flag is sticky across truncate");
    }

    #[test]
    fn test_write_queue_entry_success() {
        let mut mem = TableMemory::new();
        mem.map(0x1000, vec![0xab; 12]);
        let mut out = OutBuf::with_capacity(4096);
        let entry = QueueEntry {
            type_id: 7,
            len: 12,
            addr: 0x1000,
        };
        let data_offset = out.write_queue_entry(&mem, entry).unwrap();
        assert_eq!(data_offset, QueueEntry::SIZE);
        // 12 bytes padded to 16.
        assert_eq!(out.len(), QueueEntry::SIZE + 16);
        assert_eq!(out.read_u32(0), 7);
        assert_eq!(out.read_u32(4), 12);
        assert_eq!(out.read_u64(8), 0x1000);
        assert_eq!(out.read_u8(data_offset), 0xab);
        assert_eq!(out.read_u8(data_offset + 11), 0xab);
        assert_eq!(out.get_entry_len(data_offset), 12);
    }

    #[test]
    fn test_write_queue_entry_failed_dereference() {
        let mem = TableMemory::new();
        let mut out = OutBuf::with_capacity(4096);
        let entry = QueueEntry {
            type_id: 1,
            len: 8,
            addr: 0xdead_beef,
        };
        assert!(out.write_queue_entry(&mem, entry).is_none());
        // The entry stays, flagged, over zeroed data.
        assert_eq!(out.read_u32(0), 1 | FAILED_DEREFERENCE_BIT);
        assert_eq!(out.read_u64(QueueEntry::SIZE), 0);
        assert_eq!(out.len(), QueueEntry::SIZE + 8);
        assert!(!out.full());
    }

    #[test]
    fn test_prepare_and_conclude_frame() {
        let mut out = OutBuf::with_capacity(4096);
        let (h, data_offset) = out.prepare_frame_data(9, 3, 20, 2).unwrap();
        // Frame header + queue entry + 24 (padded 20) + trailing 8.
        assert_eq!(out.len(), FrameHeader::SIZE + QueueEntry::SIZE + 24 + 8);
        assert_eq!(data_offset, FrameHeader::SIZE + QueueEntry::SIZE);
        // Queue entry: type 9, len 28 (= 20 + 8).
        assert_eq!(out.read_u32(FrameHeader::SIZE), 9);
        assert_eq!(out.read_u32(FrameHeader::SIZE + 4), 28);
        // Trailing prog id and depth at data + data_len.
        assert_eq!(out.read_u32(data_offset + 20), 3);
        assert_eq!(out.read_u32(data_offset + 24), 2);

        out.conclude_frame_data(h);
        // data_byte_len counts from right after the frame header.
        assert_eq!(out.read_u32(0), out.len() - FrameHeader::SIZE);
    }

    #[test]
    fn test_write_stack() {
        let mut out = OutBuf::with_capacity(4096);
        let byte_len = out.write_stack(&[0x10, 0x20, 0x30]).unwrap();
        assert_eq!(byte_len, 24);
        assert_eq!(out.read_u64(0), 0x10);
        assert_eq!(out.read_u64(16), 0x30);
    }

    #[test]
    fn test_dereference_failure_zeroes() {
        let mem = TableMemory::new();
        let mut out = OutBuf::with_capacity(64);
        assert!(out.ensure_len(16));
        out.write_u64(0, 0x1111_1111_1111_1111);
        assert!(!out.dereference(&mem, 0, 0x5000, 8));
        assert_eq!(out.read_u64(0), 0, "failed slot must not keep stale bytes");
    }

    #[test]
    fn test_copy_and_zero() {
        let mut out = OutBuf::with_capacity(64);
        assert!(out.ensure_len(32));
        out.write_u64(0, 0xdead);
        out.copy(0, 16, 8);
        assert_eq!(out.read_u64(16), 0xdead);
        out.zero(0, 8);
        assert_eq!(out.read_u64(0), 0);
        // Out-of-bounds edits are ignored.
        out.zero(60, 8);
        out.copy(0, 60, 8);
    }
}
