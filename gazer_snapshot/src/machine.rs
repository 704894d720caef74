//! The traversal stack machine.
//!
//! One dispatch loop over the snapshot program's bytecode. The machine
//! extracts typed data out of the paused process: it dereferences memory
//! into the output buffer, resolves interface cells through the type
//! resolvers, and enqueues follow-up addresses onto the traversal queue.
//!
//! Two invocation shapes share the loop:
//!
//! - **Frame programs** run with the frame's canonical frame address and
//!   begin with `PrepareFrameData`.
//! - **Type follow-up programs** (`TypeInfo::enqueue_pc`) run with a zero
//!   CFA over data a queue entry already dereferenced at `start_offset`.
//!
//! Everything is fail-soft. A dereference of a bad pointer zero-fills its
//! destination and execution continues; the blob keeps a hole, not a lie.
//! A fault in the *program* (unknown opcode, truncated operand, jump out
//! of range, data-stack underflow, illegal opcode) aborts only the current
//! run; the snapshot carries on with the next frame or queue entry.

use gazer_program::opcode::{OpPrepareGoContext, Opcode};
use gazer_program::{ContextCapture, OpDecoder, SnapshotProgram, TypeInfo};
use gazer_runtime::ReadMemory;

use crate::framing::QueueEntry;
use crate::out_buf::{FrameHandle, OutBuf};
use crate::queue::TraversalQueue;
use crate::resolver::RuntimeTypeResolver;

/// Hard cutoff on instructions per run; bounds the pause against runaway
/// programs.
pub const MAX_ITERATIONS: usize = 100_000;

/// Pre-sized operand stack depth.
const DATA_STACK_CAP: usize = 64;

/// Everything a run reads but never mutates.
pub struct MachineCtx<'a, M: ReadMemory> {
    /// The program being interpreted.
    pub program: &'a SnapshotProgram,
    /// The observed address space.
    pub mem: &'a M,
    /// Runtime-type-address resolution.
    pub types: &'a RuntimeTypeResolver,
}

/// An interface cell resolved all the way to a program type.
struct ResolvedAny<'p> {
    /// The cell's payload pointer.
    addr: u64,
    /// Type-section-relative runtime type id.
    runtime_type: u64,
    /// Compact type id.
    type_id: u32,
    /// The compact type's descriptor.
    info: &'p TypeInfo,
}

/// Mutable interpreter state, reusable across runs.
pub struct StackMachine {
    /// Operand stack of 32-bit values and return PCs.
    stack: Vec<u32>,
    /// Cursor into the output buffer where the next write lands.
    offset: u32,
    /// Canonical frame address of the current frame program.
    cfa: u64,
    /// Data offset of the open frame record (presence bitmap base).
    frame_offset: u32,
    /// Handle of the open frame record.
    frame: Option<FrameHandle>,
    /// Synthetic context record being filled.
    ctx_record_offset: u32,
    /// Remaining context captures, one bit per capture index.
    ctx_capture_bitmask: u64,
}

impl StackMachine {
    /// Create a machine with the operand stack pre-sized.
    pub fn new() -> Self {
        StackMachine {
            stack: Vec::with_capacity(DATA_STACK_CAP),
            offset: 0,
            cfa: 0,
            frame_offset: 0,
            frame: None,
            ctx_record_offset: 0,
            ctx_capture_bitmask: 0,
        }
    }

    #[inline]
    fn top(&self) -> Option<u32> {
        self.stack.last().copied()
    }

    /// Execute the program at `entry_pc`.
    ///
    /// `cfa` is the frame's canonical frame address (zero for type
    /// follow-up programs), `depth` the frame index recorded into frame
    /// records, `start_offset` the output cursor the program starts at.
    ///
    /// Returns false when the run was aborted by a program fault or a full
    /// output buffer; the output may hold a partial record either way.
    pub fn run<M: ReadMemory>(
        &mut self,
        ctx: &MachineCtx<'_, M>,
        out: &mut OutBuf,
        queue: &mut TraversalQueue,
        entry_pc: u32,
        cfa: u64,
        depth: u32,
        start_offset: u32,
    ) -> bool {
        let mut decoder = OpDecoder::new(&ctx.program.bytecode);
        if !decoder.set_pc(entry_pc) {
            return false;
        }
        self.stack.clear();
        self.cfa = cfa;
        self.offset = start_offset;
        self.frame_offset = 0;
        self.frame = None;

        for _ in 0..MAX_ITERATIONS {
            let Some(op) = decoder.pop_opcode() else {
                return false;
            };
            match op {
                Opcode::Invalid | Opcode::Illegal => return false,

                Opcode::Call => {
                    let Some(call) = decoder.decode_call() else {
                        return false;
                    };
                    self.stack.push(decoder.pc());
                    if !decoder.set_pc(call.pc) {
                        return false;
                    }
                }

                Opcode::Return => {
                    let Some(ret_pc) = self.stack.pop() else {
                        // An empty stack means the run is complete.
                        return true;
                    };
                    if !decoder.set_pc(ret_pc) {
                        return false;
                    }
                }

                Opcode::Jump => {
                    let Some(jump) = decoder.decode_jump() else {
                        return false;
                    };
                    if !decoder.set_pc(jump.pc) {
                        return false;
                    }
                }

                Opcode::CondJump => {
                    let Some(jump) = decoder.decode_cond_jump() else {
                        return false;
                    };
                    let Some(top) = self.top() else {
                        return false;
                    };
                    if top != 0 && !decoder.set_pc(jump.pc) {
                        return false;
                    }
                }

                Opcode::Decrement => {
                    let Some(top) = self.stack.last_mut() else {
                        return false;
                    };
                    *top = top.wrapping_sub(1);
                }

                Opcode::Pop => {
                    if self.stack.pop().is_none() {
                        return false;
                    }
                }

                Opcode::PushImm => {
                    let Some(imm) = decoder.decode_push_imm() else {
                        return false;
                    };
                    self.stack.push(imm.value);
                }

                Opcode::PushOffset => {
                    self.stack.push(self.offset);
                }

                Opcode::PushSliceLen => {
                    let Some(psl) = decoder.decode_push_slice_len() else {
                        return false;
                    };
                    if psl.elem_byte_len == 0 {
                        return false;
                    }
                    let entry_len = out.get_entry_len(self.offset);
                    self.stack.push(entry_len / psl.elem_byte_len);
                }

                Opcode::SetOffset => {
                    let Some(top) = self.top() else {
                        return false;
                    };
                    self.offset = top;
                }

                Opcode::ShiftOffset => {
                    let Some(shift) = decoder.decode_shift_offset() else {
                        return false;
                    };
                    self.offset = self.offset.wrapping_add(shift.increment);
                }

                Opcode::DereferenceCFAOffset => {
                    let Some(deref) = decoder.decode_dereference_cfa_offset() else {
                        return false;
                    };
                    let src = (self.cfa as i64)
                        .wrapping_add(deref.offset as i64)
                        .wrapping_add(deref.pointer_bias as i64)
                        as u64;
                    out.dereference(ctx.mem, self.offset, src, deref.byte_len);
                }

                Opcode::CopyFromRegister => {
                    // Register values are not captured; the slot decodes as
                    // absent.
                    let Some(_) = decoder.decode_copy_from_register() else {
                        return false;
                    };
                    out.zero(self.offset, 8);
                }

                Opcode::ZeroFill => {
                    let Some(zf) = decoder.decode_zero_fill() else {
                        return false;
                    };
                    out.zero(self.offset, zf.byte_len);
                }

                Opcode::SetPresenceBit => {
                    let Some(spb) = decoder.decode_set_presence_bit() else {
                        return false;
                    };
                    let at = self.frame_offset + spb.bit_offset / 8;
                    let byte = out.read_u8(at) | (1 << (spb.bit_offset % 8));
                    out.write_u8(at, byte);
                }

                Opcode::PrepareFrameData => {
                    let Some(pfd) = decoder.decode_prepare_frame_data() else {
                        return false;
                    };
                    let Some((frame, offset)) =
                        out.prepare_frame_data(pfd.type_id, pfd.prog_id, pfd.data_byte_len, depth)
                    else {
                        return false;
                    };
                    self.offset = offset;
                    self.frame_offset = offset;
                    self.frame = Some(frame);
                }

                Opcode::ConcludeFrameData => {
                    let Some(frame) = self.frame else {
                        return false;
                    };
                    out.conclude_frame_data(frame);
                }

                Opcode::EnqueuePointer => {
                    let Some(eq) = decoder.decode_enqueue_pointer() else {
                        return false;
                    };
                    if eq.elem_type == 0 {
                        return false;
                    }
                    let addr = out.read_u64(self.offset);
                    queue.push(addr, eq.elem_type, 0);
                }

                Opcode::EnqueueBiasedPointer => {
                    let Some(eq) = decoder.decode_enqueue_biased_pointer() else {
                        return false;
                    };
                    if eq.elem_type == 0 {
                        return false;
                    }
                    let addr = out.read_u64(self.offset).wrapping_add(eq.bias as u64);
                    queue.push(addr, eq.elem_type, 0);
                }

                Opcode::EnqueueSliceHeader => {
                    let Some(eq) = decoder.decode_enqueue_slice_header() else {
                        return false;
                    };
                    let len = out.read_u64(self.offset + 8) as i64;
                    if len > 0 && eq.elem_byte_len > 0 {
                        let addr = out.read_u64(self.offset);
                        let byte_len = len.wrapping_mul(eq.elem_byte_len as i64) as u32;
                        queue.push(addr, eq.array_type, byte_len);
                    }
                }

                Opcode::EnqueueStringHeader => {
                    let Some(eq) = decoder.decode_enqueue_string_header() else {
                        return false;
                    };
                    let len = out.read_u64(self.offset + 8) as i64;
                    if len > 0 {
                        let addr = out.read_u64(self.offset);
                        queue.push(addr, eq.string_data_type, len as u32);
                    }
                }

                Opcode::EnqueueEmptyInterface => {
                    let type_addr = out.read_u64(self.offset);
                    // Nil cell.
                    if type_addr == 0 {
                        continue;
                    }
                    let runtime_type = ctx.types.resolve(type_addr);
                    let data = out.read_u64(self.offset + 8);
                    // Replace the absolute address with the relocatable id.
                    out.write_u64(self.offset, runtime_type);
                    let type_id = ctx.program.compact_type_id(runtime_type);
                    if type_id == 0 {
                        continue;
                    }
                    queue.push(data, type_id, 0);
                }

                Opcode::EnqueueInterface => {
                    let itab = out.read_u64(self.offset);
                    // Nil cell.
                    if itab == 0 {
                        continue;
                    }
                    // The type descriptor pointer sits one word into the
                    // itab; pull it into the buffer over the itab word.
                    if !out.dereference(ctx.mem, self.offset, itab.wrapping_add(8), 8) {
                        continue;
                    }
                    let type_addr = out.read_u64(self.offset);
                    let runtime_type = ctx.types.resolve(type_addr);
                    let data = out.read_u64(self.offset + 8);
                    out.write_u64(self.offset, runtime_type);
                    let type_id = ctx.program.compact_type_id(runtime_type);
                    if type_id == 0 {
                        continue;
                    }
                    queue.push(data, type_id, 0);
                }

                Opcode::EnqueueHMapHeader => {
                    // New and old buckets are enqueued at once; zeroing the
                    // loop counter lets the program's CondJump skip its
                    // per-bucket loop.
                    let Some(top) = self.stack.last_mut() else {
                        return false;
                    };
                    *top = 0;

                    let Some(eq) = decoder.decode_enqueue_hmap_header() else {
                        return false;
                    };
                    let flags = out.read_u8(self.offset + eq.flags_offset as u32);
                    let b = out.read_u8(self.offset + eq.b_offset as u32);
                    const SAME_SIZE_GROW: u8 = 8;

                    let buckets = out.read_u64(self.offset + eq.buckets_offset as u32);
                    if buckets != 0 {
                        let num = 1u32.checked_shl(b as u32).unwrap_or(0);
                        queue.push(
                            buckets,
                            eq.buckets_array_type,
                            num.wrapping_mul(eq.bucket_byte_len),
                        );
                    }
                    let old_buckets = out.read_u64(self.offset + eq.old_buckets_offset as u32);
                    if old_buckets != 0 {
                        let mut num = 1u32.checked_shl(b as u32).unwrap_or(0);
                        if flags & SAME_SIZE_GROW == 0 {
                            num >>= 1;
                        }
                        queue.push(
                            old_buckets,
                            eq.buckets_array_type,
                            num.wrapping_mul(eq.bucket_byte_len),
                        );
                    }
                }

                Opcode::EnqueueSwissMap => {
                    let Some(eq) = decoder.decode_enqueue_swiss_map() else {
                        return false;
                    };
                    let dir_ptr = out.read_u64(self.offset + eq.dir_ptr_offset as u32);
                    let dir_len = out.read_u64(self.offset + eq.dir_len_offset as u32) as i64;
                    if dir_len > 0 {
                        queue.push(dir_ptr, eq.table_ptr_slice_type, (8 * dir_len) as u32);
                    } else {
                        queue.push(dir_ptr, eq.group_type, 0);
                    }
                }

                Opcode::EnqueueSwissMapGroups => {
                    let Some(eq) = decoder.decode_enqueue_swiss_map_groups() else {
                        return false;
                    };
                    let data = out.read_u64(self.offset + eq.data_offset as u32);
                    let mask = out.read_u64(self.offset + eq.length_mask_offset as u32);
                    let byte_len = eq.group_byte_len.wrapping_mul((mask as u32).wrapping_add(1));
                    queue.push(data, eq.group_slice_type, byte_len);
                }

                Opcode::PrepareGoContext => {
                    let Some(pgc) = decoder.decode_prepare_go_context() else {
                        return false;
                    };
                    self.prepare_go_context(ctx, out, queue, pgc);
                }
            }
        }

        false
    }

    /// Resolve the interface cell at the cursor to a program type.
    fn resolve_any<'p, M: ReadMemory>(
        &self,
        ctx: &MachineCtx<'p, M>,
        out: &OutBuf,
    ) -> Option<ResolvedAny<'p>> {
        let type_addr = out.read_u64(self.offset);
        if type_addr == 0 {
            return None;
        }
        let runtime_type = ctx.types.resolve(type_addr);
        if runtime_type == 0 {
            return None;
        }
        let type_id = ctx.program.compact_type_id(runtime_type);
        if type_id == 0 {
            return None;
        }
        let info = ctx.program.type_info(type_id)?;
        Some(ResolvedAny {
            addr: out.read_u64(self.offset + 8),
            runtime_type,
            type_id,
            info,
        })
    }

    /// Record one captured context value into the synthetic record and
    /// enqueue it, unless its capture slot was already filled.
    fn record_context_value(
        &mut self,
        out: &mut OutBuf,
        queue: &mut TraversalQueue,
        slot: &ContextCapture,
        value: &ResolvedAny<'_>,
        expected_type: u32,
    ) {
        let bit = 1u64.checked_shl(slot.index).unwrap_or(0);
        if self.ctx_capture_bitmask & bit == 0 {
            return;
        }
        self.ctx_capture_bitmask &= !bit;

        // The reference is recorded even on a type mismatch below; the
        // decoder surfaces the discrepancy.
        out.write_u64(self.ctx_record_offset + slot.offset, value.addr);
        out.write_u64(self.ctx_record_offset + slot.offset + 8, value.runtime_type);

        if expected_type != 0 && expected_type != value.type_id {
            return;
        }
        let type_id = if slot.type_id == 0 {
            value.type_id
        } else {
            slot.type_id
        };
        queue.push(value.addr, type_id, 0);
    }

    /// Walk a wrapper-context chain, filling a synthetic record with the
    /// captured keys and values the program declared.
    ///
    /// The cursor must sit on the chain's outermost interface cell. Scratch
    /// reads pulled into the buffer during the walk are truncated away
    /// before returning; only the synthetic record survives.
    fn prepare_go_context<M: ReadMemory>(
        &mut self,
        ctx: &MachineCtx<'_, M>,
        out: &mut OutBuf,
        queue: &mut TraversalQueue,
        op: OpPrepareGoContext,
    ) {
        // The first object behind the interface keys the synthetic record.
        let data = out.read_u64(self.offset + 8);
        if !queue.should_record(data, op.type_id) {
            return;
        }
        let Some(record_offset) = out.write_queue_entry(
            ctx.mem,
            QueueEntry {
                type_id: op.type_id,
                len: op.data_byte_len,
                addr: data,
            },
        ) else {
            return;
        };
        out.zero(record_offset, op.data_byte_len);
        self.ctx_record_offset = record_offset;
        self.ctx_capture_bitmask = match 1u64.checked_shl(op.capture_count as u32) {
            Some(v) => v.wrapping_sub(1),
            None => u64::MAX,
        };

        let truncate_target = out.len();
        loop {
            if self.ctx_capture_bitmask == 0 {
                break;
            }
            let itab = out.read_u64(self.offset);
            if itab == 0 {
                break;
            }
            if !out.dereference(ctx.mem, self.offset, itab.wrapping_add(8), 8) {
                break;
            }
            let type_addr = out.read_u64(self.offset);
            let runtime_type = ctx.types.resolve(type_addr);
            let type_id = ctx.program.compact_type_id(runtime_type);
            if type_id == 0 {
                break;
            }
            let Some(info) = ctx.program.type_info(type_id) else {
                break;
            };
            let Some(wrapper) = info.context_impl.clone() else {
                break;
            };
            let byte_len = info.byte_len;
            let inner_data = out.read_u64(self.offset + 8);
            let Some(new_offset) = out.write_queue_entry(
                ctx.mem,
                QueueEntry {
                    type_id,
                    len: byte_len,
                    addr: inner_data,
                },
            ) else {
                break;
            };
            self.offset = new_offset;

            if let Some(value_off) = wrapper.value_offset {
                self.offset += value_off;
                let value = self.resolve_any(ctx, out);
                self.offset -= value_off;
                if let Some(value) = value {
                    if let Some(capture) = value.info.context_value {
                        self.record_context_value(out, queue, &capture, &value, 0);
                    }
                    if let Some(key_off) = wrapper.key_offset {
                        self.offset += key_off;
                        let key = self.resolve_any(ctx, out);
                        self.offset -= key_off;
                        if let Some(key) = key {
                            if let Some(capture) = key.info.context_key {
                                let expected = key.info.context_key_value_type.unwrap_or(0);
                                self.record_context_value(out, queue, &capture, &value, expected);
                            }
                        }
                    }
                }
            }

            // Step into the wrapped inner context, if this wrapper has one.
            let Some(next_off) = wrapper.context_offset else {
                break;
            };
            self.offset += next_off;
        }
        out.truncate(truncate_target);
    }
}

impl Default for StackMachine {
    fn default() -> Self {
        Self::new()
    }
}
