//! Program data model: type descriptors, PC classifier, static roots.

use rustc_hash::FxHashMap;

use crate::config::RuntimeConfig;

/// How a wrapper-context structure exposes its payload.
///
/// Context values are nested wrapper structs, each optionally carrying a
/// stored value, a lookup key, and a pointer to the next wrapped context.
/// All offsets are relative to the start of the wrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextImpl {
    /// Offset of the stored value interface cell, if any.
    pub value_offset: Option<u32>,
    /// Offset of the lookup-key interface cell, if any.
    pub key_offset: Option<u32>,
    /// Offset of the wrapped inner context interface cell, if any.
    pub context_offset: Option<u32>,
}

/// A captured context slot: where a matched value is recorded inside the
/// synthetic context record, and under which capture index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCapture {
    /// Capture index; bit `index` of the capture bitmask.
    pub index: u32,
    /// Byte offset inside the synthetic record where the reference lands.
    pub offset: u32,
    /// Type under which the value is enqueued; 0 means "use the value's own".
    pub type_id: u32,
}

/// Per-type traversal descriptor.
#[derive(Debug, Clone, Default)]
pub struct TypeInfo {
    /// Natural byte length of the type. Zero-length types are never recorded.
    pub byte_len: u32,
    /// Entry PC of the follow-up program run after the type's data is
    /// dereferenced into the output. Zero means no follow-up.
    pub enqueue_pc: u32,
    /// Present when the type is a context wrapper.
    pub context_impl: Option<ContextImpl>,
    /// Present when values of this type are captured out of context chains.
    pub context_value: Option<ContextCapture>,
    /// Present when this type serves as a context lookup key.
    pub context_key: Option<ContextCapture>,
    /// Expected value type when matched through [`TypeInfo::context_key`].
    pub context_key_value_type: Option<u32>,
}

/// Maps stack program counters to frame-extraction program entry points.
///
/// Two parallel arrays; `target_pc` is sorted ascending. A PC classifies to
/// the first slot `j` with `target_pc[j] >= pc`; the frame is of interest
/// when that slot exists and `prog_pc[j]` is nonzero.
#[derive(Debug, Clone, Default)]
pub struct PcClassifier {
    /// Sorted function-end PCs in the unrelocated binary.
    pub target_pc: Vec<u64>,
    /// Program entry PC per slot; zero marks a gap.
    pub prog_pc: Vec<u32>,
}

impl PcClassifier {
    /// Classify a (base-adjusted) program counter.
    ///
    /// Returns the entry PC of the frame-extraction program, or `None` when
    /// the frame is not of interest.
    pub fn classify(&self, pc: u64) -> Option<u32> {
        let j = self.target_pc.partition_point(|&t| t < pc);
        match self.prog_pc.get(j) {
            Some(&prog_pc) if prog_pc != 0 => Some(prog_pc),
            _ => None,
        }
    }
}

/// A static root: an absolute (unrelocated) address traversed as `type_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticVariable {
    /// Declared address of the variable.
    pub address: u64,
    /// Type under which it is traversed.
    pub type_id: u32,
}

/// A complete snapshot program, immutable for the duration of a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotProgram {
    /// Flat bytecode; program counters index into it.
    pub bytecode: Vec<u8>,
    /// Type descriptors keyed by compact type id.
    pub type_info: FxHashMap<u32, TypeInfo>,
    /// Stack-PC classifier.
    pub pc_classifier: PcClassifier,
    /// Static roots pushed before the queue drain.
    pub static_variables: Vec<StaticVariable>,
    /// Runtime type id (type-section-relative) to compact type id.
    pub runtime_type_to_type_id: FxHashMap<u64, u32>,
    /// Description of the observed runtime.
    pub runtime_config: RuntimeConfig,
}

impl SnapshotProgram {
    /// Look up a type descriptor.
    #[inline]
    pub fn type_info(&self, type_id: u32) -> Option<&TypeInfo> {
        self.type_info.get(&type_id)
    }

    /// Resolve a runtime type id to a compact type id; 0 when unknown.
    #[inline]
    pub fn compact_type_id(&self, runtime_type_id: u64) -> u32 {
        self.runtime_type_to_type_id
            .get(&runtime_type_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_hits_first_covering_slot() {
        let c = PcClassifier {
            target_pc: vec![0x100, 0x200, 0x300],
            prog_pc: vec![10, 0, 30],
        };
        // Below the first end PC: first covering slot is 0.
        assert_eq!(c.classify(0x50), Some(10));
        assert_eq!(c.classify(0x100), Some(10));
        // Slot 1 covers but has no program.
        assert_eq!(c.classify(0x101), None);
        assert_eq!(c.classify(0x200), None);
        // Slot 2.
        assert_eq!(c.classify(0x201), Some(30));
        assert_eq!(c.classify(0x300), Some(30));
        // Past the table.
        assert_eq!(c.classify(0x301), None);
    }

    #[test]
    fn test_classify_empty_table() {
        let c = PcClassifier::default();
        assert_eq!(c.classify(0x1234), None);
    }

    #[test]
    fn test_compact_type_id_unknown_is_zero() {
        let p = SnapshotProgram::default();
        assert_eq!(p.compact_type_id(0xdead), 0);
    }
}
