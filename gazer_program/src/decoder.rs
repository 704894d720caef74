//! Bounds-checked decoding of traversal instructions.
//!
//! The decoder owns a program counter into the bytecode and pops one opcode
//! or operand block at a time. Every read is bounds-checked: a truncated
//! operand or an out-of-range jump target decodes to `None`, which the
//! interpreter treats as a fault of the current run, never a panic.

use crate::opcode::*;

/// Streaming decoder over a bytecode buffer.
#[derive(Debug, Clone)]
pub struct OpDecoder<'p> {
    pc: u32,
    bytecode: &'p [u8],
}

impl<'p> OpDecoder<'p> {
    /// Create a decoder positioned at PC 0.
    pub fn new(bytecode: &'p [u8]) -> Self {
        Self { pc: 0, bytecode }
    }

    /// Reposition the decoder. Fails when the target lies outside the
    /// bytecode.
    #[inline]
    pub fn set_pc(&mut self, pc: u32) -> bool {
        if (pc as usize) >= self.bytecode.len() {
            return false;
        }
        self.pc = pc;
        true
    }

    /// Current program counter.
    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    #[inline]
    fn take(&mut self, n: usize) -> Option<&'p [u8]> {
        let start = self.pc as usize;
        let end = start.checked_add(n)?;
        let bytes = self.bytecode.get(start..end)?;
        self.pc = end as u32;
        Some(bytes)
    }

    #[inline]
    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    #[inline]
    fn u16(&mut self) -> Option<u16> {
        self.take(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    #[inline]
    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Pop the next opcode byte. `None` on end-of-bytecode or unknown byte.
    #[inline]
    pub fn pop_opcode(&mut self) -> Option<Opcode> {
        Opcode::from_byte(self.u8()?)
    }

    /// Decode `Call` operands.
    pub fn decode_call(&mut self) -> Option<OpCall> {
        Some(OpCall { pc: self.u32()? })
    }

    /// Decode `CondJump` operands.
    pub fn decode_cond_jump(&mut self) -> Option<OpCondJump> {
        Some(OpCondJump { pc: self.u32()? })
    }

    /// Decode `Jump` operands.
    pub fn decode_jump(&mut self) -> Option<OpJump> {
        Some(OpJump { pc: self.u32()? })
    }

    /// Decode `PushImm` operands.
    pub fn decode_push_imm(&mut self) -> Option<OpPushImm> {
        Some(OpPushImm { value: self.u32()? })
    }

    /// Decode `PushSliceLen` operands.
    pub fn decode_push_slice_len(&mut self) -> Option<OpPushSliceLen> {
        Some(OpPushSliceLen {
            elem_byte_len: self.u32()?,
        })
    }

    /// Decode `ShiftOffset` operands.
    pub fn decode_shift_offset(&mut self) -> Option<OpShiftOffset> {
        Some(OpShiftOffset {
            increment: self.u32()?,
        })
    }

    /// Decode `EnqueuePointer` operands.
    pub fn decode_enqueue_pointer(&mut self) -> Option<OpEnqueuePointer> {
        Some(OpEnqueuePointer {
            elem_type: self.u32()?,
        })
    }

    /// Decode `EnqueueBiasedPointer` operands.
    pub fn decode_enqueue_biased_pointer(&mut self) -> Option<OpEnqueueBiasedPointer> {
        Some(OpEnqueueBiasedPointer {
            elem_type: self.u32()?,
            bias: self.u32()?,
        })
    }

    /// Decode `EnqueueSliceHeader` operands.
    pub fn decode_enqueue_slice_header(&mut self) -> Option<OpEnqueueSliceHeader> {
        Some(OpEnqueueSliceHeader {
            array_type: self.u32()?,
            elem_byte_len: self.u32()?,
        })
    }

    /// Decode `EnqueueStringHeader` operands.
    pub fn decode_enqueue_string_header(&mut self) -> Option<OpEnqueueStringHeader> {
        Some(OpEnqueueStringHeader {
            string_data_type: self.u32()?,
        })
    }

    /// Decode `EnqueueHMapHeader` operands.
    pub fn decode_enqueue_hmap_header(&mut self) -> Option<OpEnqueueHMapHeader> {
        Some(OpEnqueueHMapHeader {
            buckets_array_type: self.u32()?,
            bucket_byte_len: self.u32()?,
            flags_offset: self.u8()?,
            b_offset: self.u8()?,
            buckets_offset: self.u8()?,
            old_buckets_offset: self.u8()?,
        })
    }

    /// Decode `EnqueueSwissMap` operands.
    pub fn decode_enqueue_swiss_map(&mut self) -> Option<OpEnqueueSwissMap> {
        Some(OpEnqueueSwissMap {
            table_ptr_slice_type: self.u32()?,
            group_type: self.u32()?,
            dir_ptr_offset: self.u8()?,
            dir_len_offset: self.u8()?,
        })
    }

    /// Decode `EnqueueSwissMapGroups` operands.
    pub fn decode_enqueue_swiss_map_groups(&mut self) -> Option<OpEnqueueSwissMapGroups> {
        Some(OpEnqueueSwissMapGroups {
            group_slice_type: self.u32()?,
            group_byte_len: self.u32()?,
            data_offset: self.u8()?,
            length_mask_offset: self.u8()?,
        })
    }

    /// Decode `DereferenceCFAOffset` operands.
    pub fn decode_dereference_cfa_offset(&mut self) -> Option<OpDereferenceCFAOffset> {
        Some(OpDereferenceCFAOffset {
            offset: self.u32()? as i32,
            byte_len: self.u32()?,
            pointer_bias: self.u32()?,
        })
    }

    /// Decode `CopyFromRegister` operands.
    pub fn decode_copy_from_register(&mut self) -> Option<OpCopyFromRegister> {
        Some(OpCopyFromRegister {
            register: self.u16()?,
            byte_size: self.u8()?,
        })
    }

    /// Decode `ZeroFill` operands.
    pub fn decode_zero_fill(&mut self) -> Option<OpZeroFill> {
        Some(OpZeroFill {
            byte_len: self.u32()?,
        })
    }

    /// Decode `SetPresenceBit` operands.
    pub fn decode_set_presence_bit(&mut self) -> Option<OpSetPresenceBit> {
        Some(OpSetPresenceBit {
            bit_offset: self.u32()?,
        })
    }

    /// Decode `PrepareFrameData` operands.
    pub fn decode_prepare_frame_data(&mut self) -> Option<OpPrepareFrameData> {
        Some(OpPrepareFrameData {
            prog_id: self.u32()?,
            data_byte_len: self.u32()?,
            type_id: self.u32()?,
        })
    }

    /// Decode `PrepareGoContext` operands.
    pub fn decode_prepare_go_context(&mut self) -> Option<OpPrepareGoContext> {
        Some(OpPrepareGoContext {
            data_byte_len: self.u32()?,
            type_id: self.u32()?,
            capture_count: self.u8()?,
        })
    }
}
