//! Binary wire format for snapshot programs.
//!
//! Programs travel from the program compiler to the agent as one opaque
//! byte blob. The layout is a versioned sequence of little-endian sections:
//!
//! ```text
//! magic "GZPR" | version u16
//! bytecode        : u32 len, bytes
//! type table      : u32 count, entries
//! pc classifier   : u32 count, target_pc u64[count], prog_pc u32[count]
//! static roots    : u32 count, { addr u64, type u32 }[count]
//! runtime types   : u32 count, { runtime_type u64, type_id u32 }[count]
//! runtime config  : fixed field sequence
//! ```
//!
//! A type-table entry is `{ type_id u32, byte_len u32, enqueue_pc u32,
//! flags u8 }` followed by the optional context sections selected by the
//! flag bits.

use rustc_hash::FxHashMap;

use crate::config::RuntimeConfig;
use crate::types::{
    ContextCapture, ContextImpl, PcClassifier, SnapshotProgram, StaticVariable, TypeInfo,
};

const MAGIC: [u8; 4] = *b"GZPR";
const VERSION: u16 = 1;

const FLAG_CONTEXT_IMPL: u8 = 1 << 0;
const FLAG_CONTEXT_VALUE: u8 = 1 << 1;
const FLAG_CONTEXT_KEY: u8 = 1 << 2;
const FLAG_CONTEXT_KEY_VALUE_TYPE: u8 = 1 << 3;

/// Wire decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The blob does not start with the program magic.
    BadMagic,
    /// The version is newer than this decoder understands.
    UnsupportedVersion(u16),
    /// The blob ended inside a section.
    Truncated,
    /// A section length is implausible for the blob size.
    BadSectionLen,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::BadMagic => write!(f, "bad program magic"),
            WireError::UnsupportedVersion(v) => write!(f, "unsupported program version {}", v),
            WireError::Truncated => write!(f, "truncated program"),
            WireError::BadSectionLen => write!(f, "section length exceeds blob"),
        }
    }
}

impl std::error::Error for WireError {}

// =============================================================================
// Reader
// =============================================================================

struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, n: usize) -> Result<&'b [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// A section count; rejected when even one-byte entries cannot fit.
    fn count(&mut self) -> Result<usize, WireError> {
        let n = self.u32()? as usize;
        if n > self.buf.len().saturating_sub(self.pos) {
            return Err(WireError::BadSectionLen);
        }
        Ok(n)
    }

    fn opt_u32(&mut self) -> Result<Option<u32>, WireError> {
        if self.u8()? != 0 {
            Ok(Some(self.u32()?))
        } else {
            Ok(None)
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn opt_u32(&mut self, v: Option<u32>) {
        match v {
            Some(v) => {
                self.u8(1);
                self.u32(v);
            }
            None => self.u8(0),
        }
    }
}

// =============================================================================
// Decode
// =============================================================================

/// Decode a program blob.
pub fn decode_program(blob: &[u8]) -> Result<SnapshotProgram, WireError> {
    let mut r = Reader { buf: blob, pos: 0 };
    if r.take(4)? != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let bytecode_len = r.count()?;
    let bytecode = r.take(bytecode_len)?.to_vec();

    let type_count = r.count()?;
    let mut type_info = FxHashMap::default();
    type_info.reserve(type_count);
    for _ in 0..type_count {
        let type_id = r.u32()?;
        let byte_len = r.u32()?;
        let enqueue_pc = r.u32()?;
        let flags = r.u8()?;
        let context_impl = if flags & FLAG_CONTEXT_IMPL != 0 {
            Some(ContextImpl {
                value_offset: r.opt_u32()?,
                key_offset: r.opt_u32()?,
                context_offset: r.opt_u32()?,
            })
        } else {
            None
        };
        let context_value = if flags & FLAG_CONTEXT_VALUE != 0 {
            Some(read_capture(&mut r)?)
        } else {
            None
        };
        let context_key = if flags & FLAG_CONTEXT_KEY != 0 {
            Some(read_capture(&mut r)?)
        } else {
            None
        };
        let context_key_value_type = if flags & FLAG_CONTEXT_KEY_VALUE_TYPE != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        type_info.insert(
            type_id,
            TypeInfo {
                byte_len,
                enqueue_pc,
                context_impl,
                context_value,
                context_key,
                context_key_value_type,
            },
        );
    }

    let classifier_count = r.count()?;
    let mut target_pc = Vec::with_capacity(classifier_count);
    for _ in 0..classifier_count {
        target_pc.push(r.u64()?);
    }
    let mut prog_pc = Vec::with_capacity(classifier_count);
    for _ in 0..classifier_count {
        prog_pc.push(r.u32()?);
    }

    let root_count = r.count()?;
    let mut static_variables = Vec::with_capacity(root_count);
    for _ in 0..root_count {
        static_variables.push(StaticVariable {
            address: r.u64()?,
            type_id: r.u32()?,
        });
    }

    let map_count = r.count()?;
    let mut runtime_type_to_type_id = FxHashMap::default();
    runtime_type_to_type_id.reserve(map_count);
    for _ in 0..map_count {
        let runtime_type = r.u64()?;
        let type_id = r.u32()?;
        runtime_type_to_type_id.insert(runtime_type, type_id);
    }

    let runtime_config = read_config(&mut r)?;

    Ok(SnapshotProgram {
        bytecode,
        type_info,
        pc_classifier: PcClassifier { target_pc, prog_pc },
        static_variables,
        runtime_type_to_type_id,
        runtime_config,
    })
}

fn read_capture(r: &mut Reader<'_>) -> Result<ContextCapture, WireError> {
    Ok(ContextCapture {
        index: r.u32()?,
        offset: r.u32()?,
        type_id: r.u32()?,
    })
}

fn read_config(r: &mut Reader<'_>) -> Result<RuntimeConfig, WireError> {
    Ok(RuntimeConfig {
        co_sched_pc_offset: r.u64()?,
        co_sched_fp_offset: r.u64()?,
        co_syscall_pc_offset: r.u64()?,
        co_id_offset: r.u64()?,
        co_status_offset: r.u64()?,
        co_stack_top_sp_offset: r.u64()?,
        first_moduledata_addr: r.u64()?,
        moduledata_types_offset: r.u64()?,
        moduledata_etypes_offset: r.u64()?,
        moduledata_bss_offset: r.u64()?,
        bss_addr: r.u64()?,
        coroutine_list_addr: r.u64()?,
        memstats_addr: r.u64()?,
        mstats_last_gc_unix_offset: r.u64()?,
        stop_the_world_addr: r.u64()?,
        start_the_world_addr: r.u64()?,
        runtime_version: r.u32()?,
        safe_read_start_pc: r.u64()?,
        safe_read_end_pc: r.u64()?,
    })
}

// =============================================================================
// Encode
// =============================================================================

/// Encode a program into its wire blob.
pub fn encode_program(p: &SnapshotProgram) -> Vec<u8> {
    let mut w = Writer { buf: Vec::new() };
    w.buf.extend_from_slice(&MAGIC);
    w.u16(VERSION);

    w.u32(p.bytecode.len() as u32);
    w.buf.extend_from_slice(&p.bytecode);

    // Sorted for deterministic output.
    let mut type_ids: Vec<u32> = p.type_info.keys().copied().collect();
    type_ids.sort_unstable();
    w.u32(type_ids.len() as u32);
    for type_id in type_ids {
        let ti = &p.type_info[&type_id];
        w.u32(type_id);
        w.u32(ti.byte_len);
        w.u32(ti.enqueue_pc);
        let mut flags = 0u8;
        if ti.context_impl.is_some() {
            flags |= FLAG_CONTEXT_IMPL;
        }
        if ti.context_value.is_some() {
            flags |= FLAG_CONTEXT_VALUE;
        }
        if ti.context_key.is_some() {
            flags |= FLAG_CONTEXT_KEY;
        }
        if ti.context_key_value_type.is_some() {
            flags |= FLAG_CONTEXT_KEY_VALUE_TYPE;
        }
        w.u8(flags);
        if let Some(ci) = &ti.context_impl {
            w.opt_u32(ci.value_offset);
            w.opt_u32(ci.key_offset);
            w.opt_u32(ci.context_offset);
        }
        if let Some(cv) = &ti.context_value {
            write_capture(&mut w, cv);
        }
        if let Some(ck) = &ti.context_key {
            write_capture(&mut w, ck);
        }
        if let Some(t) = ti.context_key_value_type {
            w.u32(t);
        }
    }

    w.u32(p.pc_classifier.target_pc.len() as u32);
    for &t in &p.pc_classifier.target_pc {
        w.u64(t);
    }
    for &pc in &p.pc_classifier.prog_pc {
        w.u32(pc);
    }

    w.u32(p.static_variables.len() as u32);
    for v in &p.static_variables {
        w.u64(v.address);
        w.u32(v.type_id);
    }

    let mut runtime_types: Vec<(u64, u32)> = p
        .runtime_type_to_type_id
        .iter()
        .map(|(&k, &v)| (k, v))
        .collect();
    runtime_types.sort_unstable();
    w.u32(runtime_types.len() as u32);
    for (runtime_type, type_id) in runtime_types {
        w.u64(runtime_type);
        w.u32(type_id);
    }

    write_config(&mut w, &p.runtime_config);
    w.buf
}

fn write_capture(w: &mut Writer, c: &ContextCapture) {
    w.u32(c.index);
    w.u32(c.offset);
    w.u32(c.type_id);
}

fn write_config(w: &mut Writer, c: &RuntimeConfig) {
    w.u64(c.co_sched_pc_offset);
    w.u64(c.co_sched_fp_offset);
    w.u64(c.co_syscall_pc_offset);
    w.u64(c.co_id_offset);
    w.u64(c.co_status_offset);
    w.u64(c.co_stack_top_sp_offset);
    w.u64(c.first_moduledata_addr);
    w.u64(c.moduledata_types_offset);
    w.u64(c.moduledata_etypes_offset);
    w.u64(c.moduledata_bss_offset);
    w.u64(c.bss_addr);
    w.u64(c.coroutine_list_addr);
    w.u64(c.memstats_addr);
    w.u64(c.mstats_last_gc_unix_offset);
    w.u64(c.stop_the_world_addr);
    w.u64(c.start_the_world_addr);
    w.u32(c.runtime_version);
    w.u64(c.safe_read_start_pc);
    w.u64(c.safe_read_end_pc);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_program() -> SnapshotProgram {
        let mut p = SnapshotProgram {
            bytecode: vec![15], // Return
            ..Default::default()
        };
        p.type_info.insert(
            1,
            TypeInfo {
                byte_len: 16,
                enqueue_pc: 0,
                ..Default::default()
            },
        );
        p.type_info.insert(
            2,
            TypeInfo {
                byte_len: 48,
                enqueue_pc: 0,
                context_impl: Some(ContextImpl {
                    value_offset: Some(16),
                    key_offset: None,
                    context_offset: Some(32),
                }),
                context_value: Some(ContextCapture {
                    index: 1,
                    offset: 8,
                    type_id: 7,
                }),
                context_key: None,
                context_key_value_type: Some(9),
            },
        );
        p.pc_classifier = PcClassifier {
            target_pc: vec![0x100, 0x200],
            prog_pc: vec![1, 0],
        };
        p.static_variables.push(StaticVariable {
            address: 0xdead_beef,
            type_id: 1,
        });
        p.runtime_type_to_type_id.insert(0x40, 1);
        p.runtime_config = RuntimeConfig {
            stop_the_world_addr: 0x1000,
            start_the_world_addr: 0x1100,
            coroutine_list_addr: 0x2000,
            bss_addr: 0x3000,
            first_moduledata_addr: 0x4000,
            memstats_addr: 0x3100,
            safe_read_start_pc: 0x500,
            safe_read_end_pc: 0x540,
            runtime_version: 2,
            ..Default::default()
        };
        p
    }

    #[test]
    fn test_round_trip() {
        let p = sample_program();
        let blob = encode_program(&p);
        let q = decode_program(&blob).unwrap();
        assert_eq!(q.bytecode, p.bytecode);
        assert_eq!(q.type_info.len(), 2);
        assert_eq!(q.type_info[&1].byte_len, 16);
        let t2 = &q.type_info[&2];
        assert_eq!(
            t2.context_impl.as_ref().unwrap().value_offset,
            Some(16)
        );
        assert_eq!(t2.context_impl.as_ref().unwrap().key_offset, None);
        assert_eq!(t2.context_value.unwrap().type_id, 7);
        assert_eq!(t2.context_key_value_type, Some(9));
        assert_eq!(q.pc_classifier.target_pc, p.pc_classifier.target_pc);
        assert_eq!(q.pc_classifier.prog_pc, p.pc_classifier.prog_pc);
        assert_eq!(q.static_variables, p.static_variables);
        assert_eq!(q.runtime_type_to_type_id.get(&0x40), Some(&1));
        assert_eq!(
            q.runtime_config.stop_the_world_addr,
            p.runtime_config.stop_the_world_addr
        );
        assert_eq!(q.runtime_config.runtime_version, 2);
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            decode_program(b"NOPE\x01\x00"),
            Err(WireError::BadMagic)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut blob = encode_program(&sample_program());
        blob[4] = 9;
        assert!(matches!(
            decode_program(&blob),
            Err(WireError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_truncation_anywhere_is_an_error() {
        let blob = encode_program(&sample_program());
        for cut in 0..blob.len() {
            assert!(decode_program(&blob[..cut]).is_err(), "cut at {}", cut);
        }
    }
}
