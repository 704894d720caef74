//! The memory-observation seam.
//!
//! Everything the engine learns about the paused process flows through
//! [`ReadMemory`]. Production uses [`LiveMemory`]; tests use
//! [`TableMemory`], which serves canned ranges and makes every unmapped
//! address a recoverable failure, exactly like a bad pointer under the
//! signal handler.

/// Read-only access to the observed address space.
pub trait ReadMemory {
    /// Copy `dst.len()` bytes from `addr` into `dst`. On failure the
    /// destination contents are unspecified and `false` is returned.
    fn read_into(&self, dst: &mut [u8], addr: u64) -> bool;

    /// Read a little-endian `u64`.
    #[inline]
    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut raw = [0u8; 8];
        if self.read_into(&mut raw, addr) {
            Some(u64::from_le_bytes(raw))
        } else {
            None
        }
    }

    /// Read a little-endian `u32`.
    #[inline]
    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut raw = [0u8; 4];
        if self.read_into(&mut raw, addr) {
            Some(u32::from_le_bytes(raw))
        } else {
            None
        }
    }

    /// Read a little-endian `i64`.
    #[inline]
    fn read_i64(&self, addr: u64) -> Option<i64> {
        self.read_u64(addr).map(|v| v as i64)
    }

    /// Read one byte.
    #[inline]
    fn read_u8(&self, addr: u64) -> Option<u8> {
        let mut raw = [0u8; 1];
        if self.read_into(&mut raw, addr) {
            Some(raw[0])
        } else {
            None
        }
    }
}

/// The current process, read through the signal-protected safe read.
///
/// Only meaningful while the world is stopped and the recovery handler is
/// installed; outside that window a bad address faults normally.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveMemory;

impl ReadMemory for LiveMemory {
    #[inline]
    fn read_into(&self, dst: &mut [u8], addr: u64) -> bool {
        gazer_world::try_read(dst, addr)
    }
}

/// A canned address space: non-overlapping ranges with fixed contents.
///
/// Reads must fall entirely inside one range; everything else fails the
/// way an unmapped pointer does.
#[derive(Debug, Clone, Default)]
pub struct TableMemory {
    /// Sorted by start address.
    ranges: Vec<(u64, Vec<u8>)>,
}

impl TableMemory {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `addr`. Panics on overlap with an existing range;
    /// that is a fixture bug.
    pub fn map(&mut self, addr: u64, bytes: Vec<u8>) {
        let end = addr + bytes.len() as u64;
        for (start, data) in &self.ranges {
            let rend = start + data.len() as u64;
            assert!(
                end <= *start || addr >= rend,
                "overlapping range at {:#x}",
                addr
            );
        }
        self.ranges.push((addr, bytes));
        self.ranges.sort_by_key(|(start, _)| *start);
    }

    /// Map a little-endian `u64` at `addr`.
    pub fn map_u64(&mut self, addr: u64, v: u64) {
        self.map(addr, v.to_le_bytes().to_vec());
    }

    /// Map a little-endian `u32` at `addr`.
    pub fn map_u32(&mut self, addr: u64, v: u32) {
        self.map(addr, v.to_le_bytes().to_vec());
    }

    /// Overwrite bytes inside an already-mapped range.
    pub fn patch(&mut self, addr: u64, bytes: &[u8]) {
        for (start, data) in &mut self.ranges {
            let rend = *start + data.len() as u64;
            if addr >= *start && addr + bytes.len() as u64 <= rend {
                let off = (addr - *start) as usize;
                data[off..off + bytes.len()].copy_from_slice(bytes);
                return;
            }
        }
        panic!("patch outside any mapped range at {:#x}", addr);
    }
}

impl ReadMemory for TableMemory {
    fn read_into(&self, dst: &mut [u8], addr: u64) -> bool {
        if dst.is_empty() {
            return true;
        }
        let Some(end) = addr.checked_add(dst.len() as u64) else {
            return false;
        };
        // Last range starting at or before addr.
        let i = self.ranges.partition_point(|(start, _)| *start <= addr);
        if i == 0 {
            return false;
        }
        let (start, data) = &self.ranges[i - 1];
        let rend = start + data.len() as u64;
        if end > rend {
            return false;
        }
        let off = (addr - start) as usize;
        dst.copy_from_slice(&data[off..off + dst.len()]);
        true
    }
}
