//! Program builder for traversal bytecode emission.
//!
//! The `ProgramBuilder` provides a high-level API for constructing bytecode
//! with automatic label resolution. The program compiler proper derives its
//! emission from debug information and is out of scope here; the builder
//! exists for tooling and for constructing test fixtures that exercise the
//! interpreter.

use rustc_hash::FxHashMap;

use crate::opcode::Opcode;

/// A label for jump and call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A forward reference to a label that needs patching.
#[derive(Debug)]
struct ForwardRef {
    /// Byte offset of the 4-byte PC operand to patch.
    operand_offset: usize,
    /// The label being referenced.
    label: Label,
}

/// Builder for traversal bytecode.
///
/// # Example
/// ```
/// use gazer_program::{Opcode, ProgramBuilder};
///
/// let mut b = ProgramBuilder::new();
/// let done = b.new_label();
/// b.push_imm(2);
/// let top = b.bind_fresh_label();
/// b.cond_jump(done); // placeholder shape; real loops decrement first
/// b.decrement();
/// b.jump(top);
/// b.bind_label(done);
/// b.ret();
/// let bytecode = b.finish();
/// assert_eq!(bytecode[0], Opcode::PushImm as u8);
/// ```
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    code: Vec<u8>,
    next_label: u32,
    /// Label to byte-offset map, filled by `bind_label`.
    labels: FxHashMap<Label, u32>,
    /// Forward references that need patching in `finish`.
    forward_refs: Vec<ForwardRef>,
}

impl ProgramBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current emission position; the entry PC of whatever is emitted next.
    #[inline]
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Allocate an unbound label.
    pub fn new_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    /// Bind a label to the current position.
    pub fn bind_label(&mut self, label: Label) {
        let prev = self.labels.insert(label, self.here());
        debug_assert!(prev.is_none(), "label bound twice");
    }

    /// Allocate and immediately bind a label.
    pub fn bind_fresh_label(&mut self) -> Label {
        let l = self.new_label();
        self.bind_label(l);
        l
    }

    fn op(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    fn u8(&mut self, v: u8) {
        self.code.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn label_operand(&mut self, label: Label) {
        if let Some(&target) = self.labels.get(&label) {
            self.u32(target);
        } else {
            self.forward_refs.push(ForwardRef {
                operand_offset: self.code.len(),
                label,
            });
            self.u32(0);
        }
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// Emit `Call label`.
    pub fn call(&mut self, label: Label) {
        self.op(Opcode::Call);
        self.label_operand(label);
    }

    /// Emit `Jump label`.
    pub fn jump(&mut self, label: Label) {
        self.op(Opcode::Jump);
        self.label_operand(label);
    }

    /// Emit `CondJump label`.
    pub fn cond_jump(&mut self, label: Label) {
        self.op(Opcode::CondJump);
        self.label_operand(label);
    }

    /// Emit `Return`.
    pub fn ret(&mut self) {
        self.op(Opcode::Return);
    }

    /// Emit `Illegal`.
    pub fn illegal(&mut self) {
        self.op(Opcode::Illegal);
    }

    // =========================================================================
    // Data stack and cursor
    // =========================================================================

    /// Emit `PushImm value`.
    pub fn push_imm(&mut self, value: u32) {
        self.op(Opcode::PushImm);
        self.u32(value);
    }

    /// Emit `PushOffset`.
    pub fn push_offset(&mut self) {
        self.op(Opcode::PushOffset);
    }

    /// Emit `PushSliceLen elem_byte_len`.
    pub fn push_slice_len(&mut self, elem_byte_len: u32) {
        self.op(Opcode::PushSliceLen);
        self.u32(elem_byte_len);
    }

    /// Emit `Pop`.
    pub fn pop(&mut self) {
        self.op(Opcode::Pop);
    }

    /// Emit `Decrement`.
    pub fn decrement(&mut self) {
        self.op(Opcode::Decrement);
    }

    /// Emit `SetOffset`.
    pub fn set_offset(&mut self) {
        self.op(Opcode::SetOffset);
    }

    /// Emit `ShiftOffset increment`.
    pub fn shift_offset(&mut self, increment: u32) {
        self.op(Opcode::ShiftOffset);
        self.u32(increment);
    }

    // =========================================================================
    // Memory extraction
    // =========================================================================

    /// Emit `DereferenceCFAOffset offset, byte_len, pointer_bias`.
    pub fn dereference_cfa_offset(&mut self, offset: i32, byte_len: u32, pointer_bias: u32) {
        self.op(Opcode::DereferenceCFAOffset);
        self.u32(offset as u32);
        self.u32(byte_len);
        self.u32(pointer_bias);
    }

    /// Emit `CopyFromRegister register, byte_size`.
    pub fn copy_from_register(&mut self, register: u16, byte_size: u8) {
        self.op(Opcode::CopyFromRegister);
        self.u16(register);
        self.u8(byte_size);
    }

    /// Emit `ZeroFill byte_len`.
    pub fn zero_fill(&mut self, byte_len: u32) {
        self.op(Opcode::ZeroFill);
        self.u32(byte_len);
    }

    /// Emit `SetPresenceBit bit_offset`.
    pub fn set_presence_bit(&mut self, bit_offset: u32) {
        self.op(Opcode::SetPresenceBit);
        self.u32(bit_offset);
    }

    // =========================================================================
    // Frame records
    // =========================================================================

    /// Emit `PrepareFrameData prog_id, data_byte_len, type_id`.
    pub fn prepare_frame_data(&mut self, prog_id: u32, data_byte_len: u32, type_id: u32) {
        self.op(Opcode::PrepareFrameData);
        self.u32(prog_id);
        self.u32(data_byte_len);
        self.u32(type_id);
    }

    /// Emit `ConcludeFrameData`.
    pub fn conclude_frame_data(&mut self) {
        self.op(Opcode::ConcludeFrameData);
    }

    // =========================================================================
    // Enqueue family
    // =========================================================================

    /// Emit `EnqueuePointer elem_type`.
    pub fn enqueue_pointer(&mut self, elem_type: u32) {
        self.op(Opcode::EnqueuePointer);
        self.u32(elem_type);
    }

    /// Emit `EnqueueBiasedPointer elem_type, bias`.
    pub fn enqueue_biased_pointer(&mut self, elem_type: u32, bias: u32) {
        self.op(Opcode::EnqueueBiasedPointer);
        self.u32(elem_type);
        self.u32(bias);
    }

    /// Emit `EnqueueSliceHeader array_type, elem_byte_len`.
    pub fn enqueue_slice_header(&mut self, array_type: u32, elem_byte_len: u32) {
        self.op(Opcode::EnqueueSliceHeader);
        self.u32(array_type);
        self.u32(elem_byte_len);
    }

    /// Emit `EnqueueStringHeader string_data_type`.
    pub fn enqueue_string_header(&mut self, string_data_type: u32) {
        self.op(Opcode::EnqueueStringHeader);
        self.u32(string_data_type);
    }

    /// Emit `EnqueueEmptyInterface`.
    pub fn enqueue_empty_interface(&mut self) {
        self.op(Opcode::EnqueueEmptyInterface);
    }

    /// Emit `EnqueueInterface`.
    pub fn enqueue_interface(&mut self) {
        self.op(Opcode::EnqueueInterface);
    }

    /// Emit `EnqueueHMapHeader`.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_hmap_header(
        &mut self,
        buckets_array_type: u32,
        bucket_byte_len: u32,
        flags_offset: u8,
        b_offset: u8,
        buckets_offset: u8,
        old_buckets_offset: u8,
    ) {
        self.op(Opcode::EnqueueHMapHeader);
        self.u32(buckets_array_type);
        self.u32(bucket_byte_len);
        self.u8(flags_offset);
        self.u8(b_offset);
        self.u8(buckets_offset);
        self.u8(old_buckets_offset);
    }

    /// Emit `EnqueueSwissMap`.
    pub fn enqueue_swiss_map(
        &mut self,
        table_ptr_slice_type: u32,
        group_type: u32,
        dir_ptr_offset: u8,
        dir_len_offset: u8,
    ) {
        self.op(Opcode::EnqueueSwissMap);
        self.u32(table_ptr_slice_type);
        self.u32(group_type);
        self.u8(dir_ptr_offset);
        self.u8(dir_len_offset);
    }

    /// Emit `EnqueueSwissMapGroups`.
    pub fn enqueue_swiss_map_groups(
        &mut self,
        group_slice_type: u32,
        group_byte_len: u32,
        data_offset: u8,
        length_mask_offset: u8,
    ) {
        self.op(Opcode::EnqueueSwissMapGroups);
        self.u32(group_slice_type);
        self.u32(group_byte_len);
        self.u8(data_offset);
        self.u8(length_mask_offset);
    }

    /// Emit `PrepareGoContext data_byte_len, type_id, capture_count`.
    pub fn prepare_go_context(&mut self, data_byte_len: u32, type_id: u32, capture_count: u8) {
        self.op(Opcode::PrepareGoContext);
        self.u32(data_byte_len);
        self.u32(type_id);
        self.u8(capture_count);
    }

    // =========================================================================
    // Finish
    // =========================================================================

    /// Resolve all forward references and return the bytecode.
    ///
    /// # Panics
    ///
    /// Panics when a referenced label was never bound; that is a bug in the
    /// emitting code, not an input condition.
    pub fn finish(mut self) -> Vec<u8> {
        for fref in self.forward_refs.drain(..) {
            let target = *self
                .labels
                .get(&fref.label)
                .expect("unbound label referenced in emitted code");
            self.code[fref.operand_offset..fref.operand_offset + 4]
                .copy_from_slice(&target.to_le_bytes());
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::OpDecoder;

    #[test]
    fn test_backward_label() {
        let mut b = ProgramBuilder::new();
        let top = b.bind_fresh_label();
        b.decrement();
        b.jump(top);
        let code = b.finish();
        let mut d = OpDecoder::new(&code);
        assert_eq!(d.pop_opcode(), Some(Opcode::Decrement));
        assert_eq!(d.pop_opcode(), Some(Opcode::Jump));
        assert_eq!(d.decode_jump().unwrap().pc, 0);
    }

    #[test]
    fn test_forward_label_is_patched() {
        let mut b = ProgramBuilder::new();
        let out = b.new_label();
        b.cond_jump(out);
        b.zero_fill(8);
        b.bind_label(out);
        b.ret();
        let code = b.finish();
        let mut d = OpDecoder::new(&code);
        assert_eq!(d.pop_opcode(), Some(Opcode::CondJump));
        // CondJump is 5 bytes, ZeroFill is 5 bytes: Return sits at 10.
        assert_eq!(d.decode_cond_jump().unwrap().pc, 10);
        assert_eq!(code[10], Opcode::Return as u8);
    }

    #[test]
    fn test_round_trip_through_decoder() {
        let mut b = ProgramBuilder::new();
        b.prepare_frame_data(3, 24, 9);
        b.dereference_cfa_offset(-16, 8, 0);
        b.enqueue_pointer(5);
        b.conclude_frame_data();
        b.ret();
        let code = b.finish();

        let mut d = OpDecoder::new(&code);
        assert_eq!(d.pop_opcode(), Some(Opcode::PrepareFrameData));
        let pfd = d.decode_prepare_frame_data().unwrap();
        assert_eq!((pfd.prog_id, pfd.data_byte_len, pfd.type_id), (3, 24, 9));
        assert_eq!(d.pop_opcode(), Some(Opcode::DereferenceCFAOffset));
        let deref = d.decode_dereference_cfa_offset().unwrap();
        assert_eq!((deref.offset, deref.byte_len, deref.pointer_bias), (-16, 8, 0));
        assert_eq!(d.pop_opcode(), Some(Opcode::EnqueuePointer));
        assert_eq!(d.decode_enqueue_pointer().unwrap().elem_type, 5);
        assert_eq!(d.pop_opcode(), Some(Opcode::ConcludeFrameData));
        assert_eq!(d.pop_opcode(), Some(Opcode::Return));
    }
}
