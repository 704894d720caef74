//! The traversal opcode catalog.
//!
//! Instructions are one opcode byte followed by fixed-size little-endian
//! operands. Opcode numbering is part of the wire contract with the program
//! compiler and must not be renumbered.

/// Operation codes of the traversal stack machine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Reserved; decoding it is a program error.
    Invalid = 0,
    /// Push the return PC, jump to the operand PC.
    Call = 1,
    /// Jump to the operand PC when top-of-stack is nonzero (no pop).
    CondJump = 2,
    /// Decrement top-of-stack.
    Decrement = 3,
    /// Resolve a `{type_addr, data_ptr}` cell and enqueue the payload.
    EnqueueEmptyInterface = 4,
    /// Resolve an `{itab_addr, data_ptr}` cell and enqueue the payload.
    EnqueueInterface = 5,
    /// Enqueue the pointer at the cursor under a fixed element type.
    EnqueuePointer = 6,
    /// Enqueue a `{ptr, len}` slice header as `len * elem_byte_len` bytes.
    EnqueueSliceHeader = 7,
    /// Enqueue a `{ptr, len}` string header as `len` bytes.
    EnqueueStringHeader = 8,
    /// Enqueue both bucket arrays of an old-style hash map header.
    EnqueueHMapHeader = 9,
    /// Unconditional jump.
    Jump = 10,
    /// Pop top-of-stack.
    Pop = 11,
    /// Push an immediate.
    PushImm = 12,
    /// Push the current output cursor.
    PushOffset = 13,
    /// Push `queue entry length / elem_byte_len`.
    PushSliceLen = 14,
    /// Return to the PC on the stack; exit the run when the stack is empty.
    Return = 15,
    /// Set the output cursor to top-of-stack (no pop).
    SetOffset = 16,
    /// Advance the output cursor by the operand.
    ShiftOffset = 17,
    /// Enqueue the pointer at the cursor, biased, under a fixed element type.
    EnqueueBiasedPointer = 18,
    /// Dereference `cfa + offset + bias` into the output at the cursor.
    DereferenceCFAOffset = 19,
    /// Reserved: register values are not captured; zeroes the destination.
    CopyFromRegister = 20,
    /// Zero bytes at the cursor.
    ZeroFill = 21,
    /// Open a frame record; set cursor and frame back-references.
    PrepareFrameData = 22,
    /// Deliberate trap; aborts the run.
    Illegal = 23,
    /// Finalize the open frame record's byte length.
    ConcludeFrameData = 25,
    /// Walk a wrapper-context chain, capturing declared keys/values.
    PrepareGoContext = 27,
    /// OR a bit into the frame's presence bitmap.
    SetPresenceBit = 30,
    /// Enqueue a swiss-table map directory or sole group.
    EnqueueSwissMap = 31,
    /// Enqueue a swiss-table group array from `{data, length_mask}`.
    EnqueueSwissMapGroups = 32,
}

impl Opcode {
    /// Decode an opcode byte. Unknown bytes are `None`; the interpreter
    /// treats them as a program fault.
    pub fn from_byte(b: u8) -> Option<Opcode> {
        Some(match b {
            0 => Opcode::Invalid,
            1 => Opcode::Call,
            2 => Opcode::CondJump,
            3 => Opcode::Decrement,
            4 => Opcode::EnqueueEmptyInterface,
            5 => Opcode::EnqueueInterface,
            6 => Opcode::EnqueuePointer,
            7 => Opcode::EnqueueSliceHeader,
            8 => Opcode::EnqueueStringHeader,
            9 => Opcode::EnqueueHMapHeader,
            10 => Opcode::Jump,
            11 => Opcode::Pop,
            12 => Opcode::PushImm,
            13 => Opcode::PushOffset,
            14 => Opcode::PushSliceLen,
            15 => Opcode::Return,
            16 => Opcode::SetOffset,
            17 => Opcode::ShiftOffset,
            18 => Opcode::EnqueueBiasedPointer,
            19 => Opcode::DereferenceCFAOffset,
            20 => Opcode::CopyFromRegister,
            21 => Opcode::ZeroFill,
            22 => Opcode::PrepareFrameData,
            23 => Opcode::Illegal,
            25 => Opcode::ConcludeFrameData,
            27 => Opcode::PrepareGoContext,
            30 => Opcode::SetPresenceBit,
            31 => Opcode::EnqueueSwissMap,
            32 => Opcode::EnqueueSwissMapGroups,
            _ => return None,
        })
    }
}

// =============================================================================
// Operand structs
// =============================================================================

/// `Call` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCall {
    /// Target PC.
    pub pc: u32,
}

/// `CondJump` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCondJump {
    /// Target PC.
    pub pc: u32,
}

/// `Jump` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpJump {
    /// Target PC.
    pub pc: u32,
}

/// `PushImm` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpPushImm {
    /// Immediate value.
    pub value: u32,
}

/// `PushSliceLen` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpPushSliceLen {
    /// Element byte length the entry length is divided by.
    pub elem_byte_len: u32,
}

/// `ShiftOffset` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpShiftOffset {
    /// Cursor increment.
    pub increment: u32,
}

/// `EnqueuePointer` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpEnqueuePointer {
    /// Element type; zero is a program error.
    pub elem_type: u32,
}

/// `EnqueueBiasedPointer` shares the `EnqueuePointer` shape plus a bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpEnqueueBiasedPointer {
    /// Element type; zero is a program error.
    pub elem_type: u32,
    /// Added to the pointer before enqueueing.
    pub bias: u32,
}

/// `EnqueueSliceHeader` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpEnqueueSliceHeader {
    /// Type the backing array is recorded under.
    pub array_type: u32,
    /// Element byte length.
    pub elem_byte_len: u32,
}

/// `EnqueueStringHeader` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpEnqueueStringHeader {
    /// Type the byte payload is recorded under.
    pub string_data_type: u32,
}

/// `EnqueueHMapHeader` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpEnqueueHMapHeader {
    /// Type the bucket arrays are recorded under.
    pub buckets_array_type: u32,
    /// Byte length of one bucket.
    pub bucket_byte_len: u32,
    /// Offset of the flags byte within the map header.
    pub flags_offset: u8,
    /// Offset of the bucket-count exponent within the map header.
    pub b_offset: u8,
    /// Offset of the buckets pointer within the map header.
    pub buckets_offset: u8,
    /// Offset of the old-buckets pointer within the map header.
    pub old_buckets_offset: u8,
}

/// `EnqueueSwissMap` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpEnqueueSwissMap {
    /// Type of the directory as a slice of table pointers.
    pub table_ptr_slice_type: u32,
    /// Type of a single group (small-map case).
    pub group_type: u32,
    /// Offset of the directory pointer within the map header.
    pub dir_ptr_offset: u8,
    /// Offset of the directory length within the map header.
    pub dir_len_offset: u8,
}

/// `EnqueueSwissMapGroups` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpEnqueueSwissMapGroups {
    /// Type of the group array.
    pub group_slice_type: u32,
    /// Byte length of one group.
    pub group_byte_len: u32,
    /// Offset of the group-data pointer within the table.
    pub data_offset: u8,
    /// Offset of the length mask within the table.
    pub length_mask_offset: u8,
}

/// `DereferenceCFAOffset` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDereferenceCFAOffset {
    /// Signed offset from the frame's canonical frame address.
    pub offset: i32,
    /// Bytes to read.
    pub byte_len: u32,
    /// Additional bias applied to the source address.
    pub pointer_bias: u32,
}

/// `CopyFromRegister` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCopyFromRegister {
    /// DWARF register number.
    pub register: u16,
    /// Bytes the register value would occupy.
    pub byte_size: u8,
}

/// `ZeroFill` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpZeroFill {
    /// Bytes to zero at the cursor.
    pub byte_len: u32,
}

/// `SetPresenceBit` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSetPresenceBit {
    /// Bit position relative to the open frame's data start.
    pub bit_offset: u32,
}

/// `PrepareFrameData` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpPrepareFrameData {
    /// Program id recorded after the frame data.
    pub prog_id: u32,
    /// Byte length of the frame's data region.
    pub data_byte_len: u32,
    /// Type id recorded in the frame's queue entry.
    pub type_id: u32,
}

/// `PrepareGoContext` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpPrepareGoContext {
    /// Byte length of the synthetic context record.
    pub data_byte_len: u32,
    /// Type id of the synthetic record.
    pub type_id: u32,
    /// Number of captured slots; bitmask starts at `(1 << count) - 1`.
    pub capture_count: u8,
}
