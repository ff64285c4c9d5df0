// This module is the AArch64 instruction selector for dexlower. A64Encoder turns an
// abstract operation (an OpKind applied to registers, immediates or a memory
// reference of a given OpSize) into one or more Lir records, choosing the shortest
// legal encoding: fmov immediates and a zero-register fast path for floating-point
// constants, movz/movn/orr/movk sequences for integer constants, 12-bit and shifted
// 12-bit immediates for add/sub/cmp, bitmask immediates for logical operations, and
// scaled, unscaled or register-indexed addressing for loads and stores. When no
// immediate form fits, the value is materialized into a register from the scratch
// pool, used, and the register is returned to the pool before the call ends.
// Constants with no compact form go to the per-method literal pool, which
// deduplicates by bit pattern. Operation and operand combinations this target has no
// lowering for are reported as InvariantViolation; they indicate that an earlier
// stage failed to legalize its input and are never retried.

//! AArch64 instruction selection.
//!
//! Selecting methods return the [`LirId`] of the record that performs the
//! operation; constants materialized ahead of it sit just before it in
//! [`A64Encoder::code`], which holds every record in emission order.

use super::immediates::{
    encode_extend, encode_imm_double, encode_imm_single, encode_logical_immediate,
    encode_shift, fits_signed_imm9, is_extend_encoding, ExtendType, ShiftType, ENCODE_NO_SHIFT,
};
use super::lir::{A64Opcode, Cond, Label, Lir, LirId, LirTarget, Operand};
use super::literal_pool::{LiteralPool, LiteralValue};
use super::registers::{Reg, ScratchPool};
use crate::core::{EncodeResult, InvariantViolation};
use log::{debug, trace};
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// Abstract operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Adc,
    Sbc,
    And,
    Or,
    Xor,
    Mul,
    Div,
    Lsl,
    Lsr,
    Asr,
    Ror,
    Cmp,
    Cmn,
    Mov,
    Mvn,
    Neg,
    Tst,
    Rev,
    Revsh,
    IntToByte,
    IntToShort,
    IntToChar,
    /// Branch with link to register.
    Blx,
    /// Branch to register.
    Bx,
}

/// Width and signedness of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    /// Native word, 8 bytes.
    Word,
    K64,
    K32,
    /// Heap reference, 4 bytes.
    Reference,
    Single,
    Double,
    UnsignedHalf,
    SignedHalf,
    UnsignedByte,
    SignedByte,
}

impl OpSize {
    /// log2 of the access size in bytes.
    pub fn scale(self) -> u32 {
        match self {
            OpSize::Word | OpSize::K64 | OpSize::Double => 3,
            OpSize::K32 | OpSize::Reference | OpSize::Single => 2,
            OpSize::UnsignedHalf | OpSize::SignedHalf => 1,
            OpSize::UnsignedByte | OpSize::SignedByte => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpSize::Word => "word",
            OpSize::K64 => "64",
            OpSize::K32 => "32",
            OpSize::Reference => "reference",
            OpSize::Single => "single",
            OpSize::Double => "double",
            OpSize::UnsignedHalf => "unsigned-half",
            OpSize::SignedHalf => "signed-half",
            OpSize::UnsignedByte => "unsigned-byte",
            OpSize::SignedByte => "signed-byte",
        }
    }
}

impl fmt::Display for OpSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opcode pair for a displacement access: scaled 12-bit form and unscaled
/// signed 9-bit form.
struct DispForms {
    scaled: A64Opcode,
    unscaled: A64Opcode,
    scale: u32,
    wide: bool,
}

/// Instruction selector for one method.
#[derive(Debug, Default)]
pub struct A64Encoder {
    code: Vec<Lir>,
    literals: LiteralPool,
    scratch: ScratchPool,
    dex_pc: u32,
    next_label: u32,
}

impl A64Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scratch(scratch: ScratchPool) -> Self {
        Self {
            scratch,
            ..Self::default()
        }
    }

    /// Bytecode offset recorded in subsequently emitted records.
    pub fn set_dex_pc(&mut self, dex_pc: u32) {
        self.dex_pc = dex_pc;
    }

    pub fn code(&self) -> &[Lir] {
        &self.code
    }

    pub fn lir(&self, id: LirId) -> &Lir {
        &self.code[id.index()]
    }

    /// Records from `id` to the end of the list.
    pub fn code_since(&self, id: LirId) -> &[Lir] {
        &self.code[id.index()..]
    }

    pub fn literals(&self) -> &LiteralPool {
        &self.literals
    }

    pub fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    fn next_id(&self) -> LirId {
        LirId(self.code.len() as u32)
    }

    fn emit(
        &mut self,
        opcode: A64Opcode,
        wide: bool,
        operands: SmallVec<[Operand; 4]>,
        target: Option<LirTarget>,
    ) -> LirId {
        let id = self.next_id();
        let lir = Lir::new(opcode, wide, operands, target, self.dex_pc);
        trace!("emit {lir}");
        self.code.push(lir);
        id
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Place `label` at the current position.
    pub fn bind_label(&mut self, label: Label) -> LirId {
        self.emit(A64Opcode::Label, false, SmallVec::new(), Some(LirTarget::Label(label)))
    }

    fn alloc_scratch(&mut self, wide: bool) -> EncodeResult<Reg> {
        if wide {
            self.scratch.alloc_temp_wide()
        } else {
            self.scratch.alloc_temp()
        }
    }

    // Constants.

    /// Load a single-precision bit pattern into an `s` register.
    pub fn load_fp_constant_value(&mut self, dest: Reg, value: i32) -> EncodeResult<LirId> {
        if !dest.is_single() {
            return Err(InvariantViolation::RegisterClass {
                operation: "load_fp_constant_value",
                reg: dest.to_string(),
            });
        }
        if value == 0 {
            return Ok(self.emit(
                A64Opcode::FmovCore,
                false,
                smallvec![Operand::Reg(dest), Operand::Reg(Reg::WZR)],
                None,
            ));
        }
        if let Some(imm8) = encode_imm_single(value as u32) {
            return Ok(self.emit(
                A64Opcode::FmovImm,
                false,
                smallvec![Operand::Reg(dest), Operand::Imm(imm8 as i64)],
                None,
            ));
        }
        let slot = self.literals.get_or_insert(LiteralValue::Word(value as u32));
        Ok(self.emit(
            A64Opcode::LdrFpLiteral,
            false,
            smallvec![Operand::Reg(dest)],
            Some(LirTarget::Literal(slot)),
        ))
    }

    /// Load a double-precision bit pattern into a `d` register.
    pub fn load_fp_constant_value_wide(&mut self, dest: Reg, value: i64) -> EncodeResult<LirId> {
        if !dest.is_double() {
            return Err(InvariantViolation::RegisterClass {
                operation: "load_fp_constant_value_wide",
                reg: dest.to_string(),
            });
        }
        if value == 0 {
            return Ok(self.emit(
                A64Opcode::FmovCore,
                true,
                smallvec![Operand::Reg(dest), Operand::Reg(Reg::XZR)],
                None,
            ));
        }
        if let Some(imm8) = encode_imm_double(value as u64) {
            return Ok(self.emit(
                A64Opcode::FmovImm,
                true,
                smallvec![Operand::Reg(dest), Operand::Imm(imm8 as i64)],
                None,
            ));
        }
        let slot = self.literals.get_or_insert(LiteralValue::Wide(value as u64));
        Ok(self.emit(
            A64Opcode::LdrFpLiteral,
            true,
            smallvec![Operand::Reg(dest)],
            Some(LirTarget::Literal(slot)),
        ))
    }

    /// Load a 32-bit constant in at most two instructions without touching
    /// any register but `dest`.
    ///
    /// Core destinations are written through their W view, so an X
    /// destination receives the zero-extended value.
    pub fn load_constant_no_clobber(&mut self, dest: Reg, value: i32) -> EncodeResult<LirId> {
        if dest.is_float() {
            return self.load_fp_constant_value(dest, value);
        }
        if dest.is_zero_register() || dest.is_stack_pointer() {
            return Err(InvariantViolation::RegisterClass {
                operation: "load_constant",
                reg: dest.to_string(),
            });
        }

        // Always the W form: writing a W register zero-extends into X.
        let dest = dest.as_32bit();
        let wide = false;
        let zero = Reg::WZR;
        let high_bits = (value as u32 >> 16) as u16;
        let low_bits = value as u16;
        // A half is "fast" when it is all zeros or all ones.
        let low_fast = low_bits.wrapping_add(1) <= 1;
        let high_fast = high_bits.wrapping_add(1) <= 1;

        if low_fast || high_fast {
            if low_bits == high_bits {
                // 0 or -1
                let opcode = if low_bits == 0 {
                    A64Opcode::Mov
                } else {
                    A64Opcode::Mvn
                };
                return Ok(self.emit(
                    opcode,
                    wide,
                    smallvec![Operand::Reg(dest), Operand::Reg(zero)],
                    None,
                ));
            }
            let (shift, uniform_bits, useful_bits) = if high_fast {
                (0, high_bits, low_bits)
            } else {
                (1, low_bits, high_bits)
            };
            let (opcode, imm) = if uniform_bits != 0 {
                (A64Opcode::Movn, !useful_bits)
            } else {
                (A64Opcode::Movz, useful_bits)
            };
            return Ok(self.emit(
                opcode,
                wide,
                smallvec![
                    Operand::Reg(dest),
                    Operand::Imm(imm as i64),
                    Operand::Shift(encode_shift(ShiftType::Lsl, 16 * shift)),
                ],
                None,
            ));
        }

        if let Some(bitmask) = encode_logical_immediate(false, value as u32 as u64) {
            return Ok(self.emit(
                A64Opcode::OrrImm,
                wide,
                smallvec![
                    Operand::Reg(dest),
                    Operand::Reg(zero),
                    Operand::Imm(bitmask as i64),
                ],
                None,
            ));
        }

        let first = self.emit(
            A64Opcode::Movz,
            wide,
            smallvec![
                Operand::Reg(dest),
                Operand::Imm(low_bits as i64),
                Operand::Shift(ENCODE_NO_SHIFT),
            ],
            None,
        );
        self.emit(
            A64Opcode::Movk,
            wide,
            smallvec![
                Operand::Reg(dest),
                Operand::Imm(high_bits as i64),
                Operand::Shift(encode_shift(ShiftType::Lsl, 16)),
            ],
            None,
        );
        Ok(first)
    }

    pub fn load_constant(&mut self, dest: Reg, value: i32) -> EncodeResult<LirId> {
        self.load_constant_no_clobber(dest, value)
    }

    /// Load a 64-bit constant.
    pub fn load_constant_wide(&mut self, dest: Reg, value: i64) -> EncodeResult<LirId> {
        if dest.is_float() {
            return self.load_fp_constant_value_wide(dest, value);
        }
        if !dest.is_64bit() || dest.is_zero_register() || dest.is_stack_pointer() {
            return Err(InvariantViolation::RegisterClass {
                operation: "load_constant_wide",
                reg: dest.to_string(),
            });
        }
        if value == 0 {
            return Ok(self.emit(
                A64Opcode::Mov,
                true,
                smallvec![Operand::Reg(dest), Operand::Reg(Reg::XZR)],
                None,
            ));
        }
        if let Some(bitmask) = encode_logical_immediate(true, value as u64) {
            return Ok(self.emit(
                A64Opcode::OrrImm,
                true,
                smallvec![
                    Operand::Reg(dest),
                    Operand::Reg(Reg::XZR),
                    Operand::Imm(bitmask as i64),
                ],
                None,
            ));
        }
        let slot = self.literals.get_or_insert(LiteralValue::Wide(value as u64));
        Ok(self.emit(
            A64Opcode::LdrLiteral,
            true,
            smallvec![Operand::Reg(dest)],
            Some(LirTarget::Literal(slot)),
        ))
    }

    // Branches.

    pub fn op_unconditional_branch(&mut self, target: Label) -> LirId {
        self.emit(A64Opcode::B, false, SmallVec::new(), Some(LirTarget::Label(target)))
    }

    pub fn op_cond_branch(&mut self, cond: Cond, target: Label) -> LirId {
        self.emit(
            A64Opcode::BCond,
            false,
            smallvec![Operand::Cond(cond)],
            Some(LirTarget::Label(target)),
        )
    }

    pub fn op_reg(&mut self, op: OpKind, reg: Reg) -> EncodeResult<LirId> {
        match op {
            OpKind::Blx => Ok(self.emit(A64Opcode::Blr, true, smallvec![Operand::Reg(reg)], None)),
            _ => Err(InvariantViolation::NoLegalization { operation: "op_reg" }),
        }
    }

    // Register-register ALU.

    pub fn op_reg_reg(&mut self, op: OpKind, dest_src1: Reg, src2: Reg) -> EncodeResult<LirId> {
        self.op_reg_reg_shift(op, dest_src1, src2, ENCODE_NO_SHIFT)
    }

    /// Two-register form; ops without one fall through to the three-register
    /// form with `dest_src1` as both destination and first source.
    pub fn op_reg_reg_shift(
        &mut self,
        op: OpKind,
        dest_src1: Reg,
        src2: Reg,
        shift: u32,
    ) -> EncodeResult<LirId> {
        if dest_src1.is_64bit() != src2.is_64bit() {
            return Err(InvariantViolation::WidthMismatch {
                operation: "op_reg_reg_shift",
            });
        }
        let wide = dest_src1.is_64bit();
        let regs = [Operand::Reg(dest_src1), Operand::Reg(src2)];

        let opcode = match op {
            OpKind::Cmn => A64Opcode::Cmn,
            OpKind::Cmp => A64Opcode::Cmp,
            OpKind::Mov => A64Opcode::Mov,
            OpKind::Mvn => A64Opcode::Mvn,
            OpKind::Neg => A64Opcode::Neg,
            OpKind::Tst => A64Opcode::Tst,
            OpKind::Rev => A64Opcode::Rev,
            OpKind::Revsh => A64Opcode::Rev16,
            OpKind::IntToByte | OpKind::IntToShort | OpKind::IntToChar => {
                if shift != ENCODE_NO_SHIFT {
                    return Err(InvariantViolation::NoLegalization {
                        operation: "op_reg_reg_shift(extension with shift)",
                    });
                }
                // sbfx/ubfx aliases, emitted as sbfm/ubfm
                let (opcode, imms) = match op {
                    OpKind::IntToByte => (A64Opcode::Sbfm, 7),
                    OpKind::IntToShort => (A64Opcode::Sbfm, 15),
                    _ => (A64Opcode::Ubfm, 15),
                };
                return Ok(self.emit(
                    opcode,
                    wide,
                    smallvec![regs[0], regs[1], Operand::Imm(0), Operand::Imm(imms)],
                    None,
                ));
            }
            _ => return self.op_reg_reg_reg_shift(op, dest_src1, dest_src1, src2, shift),
        };

        match opcode.operand_count() {
            2 => {
                if shift != ENCODE_NO_SHIFT {
                    return Err(InvariantViolation::NoLegalization {
                        operation: "op_reg_reg_shift(two-operand form with shift)",
                    });
                }
                Ok(self.emit(opcode, wide, smallvec![regs[0], regs[1]], None))
            }
            _ => {
                if is_extend_encoding(shift) {
                    return Err(InvariantViolation::NoLegalization {
                        operation: "op_reg_reg_shift(extend operand)",
                    });
                }
                Ok(self.emit(
                    opcode,
                    wide,
                    smallvec![regs[0], regs[1], Operand::Shift(shift)],
                    None,
                ))
            }
        }
    }

    pub fn op_reg_reg_reg(
        &mut self,
        op: OpKind,
        dest: Reg,
        src1: Reg,
        src2: Reg,
    ) -> EncodeResult<LirId> {
        self.op_reg_reg_reg_shift(op, dest, src1, src2, ENCODE_NO_SHIFT)
    }

    pub fn op_reg_reg_reg_shift(
        &mut self,
        op: OpKind,
        dest: Reg,
        src1: Reg,
        src2: Reg,
        shift: u32,
    ) -> EncodeResult<LirId> {
        let opcode = match op {
            OpKind::Add => A64Opcode::AddShifted,
            OpKind::Sub => A64Opcode::SubShifted,
            OpKind::Adc => A64Opcode::Adc,
            OpKind::And => A64Opcode::AndShifted,
            OpKind::Xor => A64Opcode::EorShifted,
            OpKind::Mul => A64Opcode::Mul,
            OpKind::Div => A64Opcode::Sdiv,
            OpKind::Or => A64Opcode::OrrShifted,
            OpKind::Sbc => A64Opcode::Sbc,
            OpKind::Lsl => A64Opcode::LslReg,
            OpKind::Lsr => A64Opcode::LsrReg,
            OpKind::Asr => A64Opcode::AsrReg,
            OpKind::Ror => A64Opcode::RorReg,
            _ => {
                return Err(InvariantViolation::NoLegalization {
                    operation: "op_reg_reg_reg_shift",
                })
            }
        };
        if dest.is_64bit() != src1.is_64bit() || dest.is_64bit() != src2.is_64bit() {
            return Err(InvariantViolation::WidthMismatch {
                operation: "op_reg_reg_reg_shift",
            });
        }
        let wide = dest.is_64bit();
        let mut operands: SmallVec<[Operand; 4]> =
            smallvec![Operand::Reg(dest), Operand::Reg(src1), Operand::Reg(src2)];
        if opcode.operand_count() == 4 {
            if is_extend_encoding(shift) {
                return Err(InvariantViolation::NoLegalization {
                    operation: "op_reg_reg_reg_shift(extend operand)",
                });
            }
            operands.push(Operand::Shift(shift));
        } else if shift != ENCODE_NO_SHIFT {
            return Err(InvariantViolation::NoLegalization {
                operation: "op_reg_reg_reg_shift(shift on unshiftable op)",
            });
        }
        Ok(self.emit(opcode, wide, operands, None))
    }

    // Register-immediate ALU.

    pub fn op_reg_reg_imm(
        &mut self,
        op: OpKind,
        dest: Reg,
        src1: Reg,
        value: i32,
    ) -> EncodeResult<LirId> {
        if dest.is_64bit() != src1.is_64bit() {
            return Err(InvariantViolation::WidthMismatch {
                operation: "op_reg_reg_imm",
            });
        }
        let wide = dest.is_64bit();
        let max_value: i64 = if wide { 64 } else { 32 };
        let value64 = value as i64;
        let abs_value = value64.unsigned_abs();
        let dest_src = [Operand::Reg(dest), Operand::Reg(src1)];

        if matches!(op, OpKind::Lsl | OpKind::Lsr | OpKind::Asr | OpKind::Ror)
            && !(0..max_value).contains(&value64)
        {
            return Err(InvariantViolation::ImmediateOutOfRange {
                operation: "op_reg_reg_imm(shift amount)",
                value: value64,
            });
        }

        let (log_imm, opcode, alt_opcode) = match op {
            OpKind::Lsl => {
                // lsl #n is ubfm #(-n mod size), #(size - 1 - n)
                return Ok(self.emit(
                    A64Opcode::Ubfm,
                    wide,
                    smallvec![
                        dest_src[0],
                        dest_src[1],
                        Operand::Imm((-value64) & (max_value - 1)),
                        Operand::Imm(max_value - 1 - value64),
                    ],
                    None,
                ));
            }
            OpKind::Lsr | OpKind::Asr => {
                let opcode = if op == OpKind::Lsr {
                    A64Opcode::LsrImm
                } else {
                    A64Opcode::AsrImm
                };
                return Ok(self.emit(
                    opcode,
                    wide,
                    smallvec![dest_src[0], dest_src[1], Operand::Imm(value64)],
                    None,
                ));
            }
            OpKind::Ror => {
                // ror #n is extr rd, rn, rn, #n
                return Ok(self.emit(
                    A64Opcode::Extr,
                    wide,
                    smallvec![dest_src[0], dest_src[1], dest_src[1], Operand::Imm(value64)],
                    None,
                ));
            }
            OpKind::Add | OpKind::Sub => {
                // Negative add is a subtract and vice versa.
                let is_add = (op == OpKind::Add) != (value < 0);
                let opcode = if is_add {
                    A64Opcode::AddImm
                } else {
                    A64Opcode::SubImm
                };
                if abs_value < 0x1000 {
                    return Ok(self.emit(
                        opcode,
                        wide,
                        smallvec![
                            dest_src[0],
                            dest_src[1],
                            Operand::Imm(abs_value as i64),
                            Operand::Shift(ENCODE_NO_SHIFT),
                        ],
                        None,
                    ));
                }
                if abs_value & 0xfff == 0 && (abs_value >> 12) < 0x1000 {
                    return Ok(self.emit(
                        opcode,
                        wide,
                        smallvec![
                            dest_src[0],
                            dest_src[1],
                            Operand::Imm((abs_value >> 12) as i64),
                            Operand::Shift(encode_shift(ShiftType::Lsl, 12)),
                        ],
                        None,
                    ));
                }
                let alt = if op == OpKind::Add {
                    A64Opcode::AddShifted
                } else {
                    A64Opcode::SubShifted
                };
                (None, alt, alt)
            }
            OpKind::Adc => (None, A64Opcode::Adc, A64Opcode::Adc),
            OpKind::Sbc => (None, A64Opcode::Sbc, A64Opcode::Sbc),
            OpKind::Mul => (None, A64Opcode::Mul, A64Opcode::Mul),
            OpKind::Or => (
                encode_logical_immediate(wide, value64 as u64),
                A64Opcode::OrrImm,
                A64Opcode::OrrShifted,
            ),
            OpKind::And => (
                encode_logical_immediate(wide, value64 as u64),
                A64Opcode::AndImm,
                A64Opcode::AndShifted,
            ),
            OpKind::Xor => (
                encode_logical_immediate(wide, value64 as u64),
                A64Opcode::EorImm,
                A64Opcode::EorShifted,
            ),
            _ => {
                return Err(InvariantViolation::NoLegalization {
                    operation: "op_reg_reg_imm",
                })
            }
        };

        if let Some(bitmask) = log_imm {
            return Ok(self.emit(
                opcode,
                wide,
                smallvec![dest_src[0], dest_src[1], Operand::Imm(bitmask as i64)],
                None,
            ));
        }

        let scratch = self.alloc_scratch(wide)?;
        let loaded = if wide {
            self.load_constant_wide(scratch, value64)
        } else {
            self.load_constant(scratch, value)
        };
        let res = loaded.map(|_| {
            let mut operands: SmallVec<[Operand; 4]> =
                smallvec![dest_src[0], dest_src[1], Operand::Reg(scratch)];
            if alt_opcode.operand_count() == 4 {
                operands.push(Operand::Shift(ENCODE_NO_SHIFT));
            }
            self.emit(alt_opcode, wide, operands, None)
        });
        self.scratch.free_temp(scratch)?;
        res
    }

    pub fn op_reg_imm(&mut self, op: OpKind, dest_src1: Reg, value: i32) -> EncodeResult<LirId> {
        self.op_reg_imm64(op, dest_src1, value as i64)
    }

    /// Add, subtract or compare against an immediate.
    ///
    /// When the immediate has to be materialized, the returned id is that of
    /// the constant load.
    pub fn op_reg_imm64(
        &mut self,
        op: OpKind,
        dest_src1: Reg,
        value: i64,
    ) -> EncodeResult<LirId> {
        let wide = dest_src1.is_64bit();
        let narrow = i32::try_from(value);
        if !wide && narrow.is_err() {
            return Err(InvariantViolation::ImmediateOutOfRange {
                operation: "op_reg_imm64",
                value,
            });
        }
        let neg = value < 0;
        let mut abs_value = value.unsigned_abs();
        let shift = if abs_value < 0x1000 {
            false
        } else if abs_value & 0xfff == 0 && (abs_value >> 12) < 0x1000 {
            abs_value >>= 12;
            true
        } else {
            let scratch = self.alloc_scratch(wide)?;
            let res = match narrow {
                Ok(narrow) if !wide => self.load_constant(scratch, narrow),
                _ => self.load_constant_wide(scratch, value),
            }
            .and_then(|res| self.op_reg_reg(op, dest_src1, scratch).map(|_| res));
            self.scratch.free_temp(scratch)?;
            return res;
        };

        let (opcode, neg_opcode) = match op {
            OpKind::Add => (A64Opcode::AddImm, A64Opcode::SubImm),
            OpKind::Sub => (A64Opcode::SubImm, A64Opcode::AddImm),
            OpKind::Cmp => (A64Opcode::CmpImm, A64Opcode::CmnImm),
            _ => {
                return Err(InvariantViolation::NoLegalization {
                    operation: "op_reg_imm64",
                })
            }
        };
        let opcode = if neg { neg_opcode } else { opcode };
        let shift = Operand::Shift(encode_shift(ShiftType::Lsl, if shift { 12 } else { 0 }));
        let imm = Operand::Imm(abs_value as i64);

        let operands: SmallVec<[Operand; 4]> = if opcode.operand_count() == 4 {
            smallvec![Operand::Reg(dest_src1), Operand::Reg(dest_src1), imm, shift]
        } else {
            smallvec![Operand::Reg(dest_src1), imm, shift]
        };
        Ok(self.emit(opcode, wide, operands, None))
    }

    // Memory.

    fn check_base(operation: &'static str, base: Reg) -> EncodeResult<()> {
        if base.is_float() || !base.is_64bit() || base.is_zero_register() {
            return Err(InvariantViolation::RegisterClass {
                operation,
                reg: base.to_string(),
            });
        }
        Ok(())
    }

    /// Index operand descriptor: 32-bit indices are sign-extended.
    fn index_extend(index: Reg, scale: u32) -> Operand {
        let extend = if index.is_64bit() {
            ExtendType::Uxtx
        } else {
            ExtendType::Sxtw
        };
        Operand::Extend(encode_extend(extend, scale))
    }

    /// Sizes an FP register can be loaded or stored as: any 8-byte size for
    /// a `d` register, a 4-byte non-reference size for an `s` register.
    fn fp_size_ok(reg: Reg, size: OpSize) -> bool {
        if reg.is_double() {
            size.scale() == 3
        } else {
            matches!(size, OpSize::K32 | OpSize::Single)
        }
    }

    /// Opcode, natural scale and width for a register-indexed access.
    fn indexed_form(
        operation: &'static str,
        reg: Reg,
        size: OpSize,
        is_load: bool,
    ) -> EncodeResult<(A64Opcode, u32, bool)> {
        let bad_size = || InvariantViolation::BadOperandSize {
            operation,
            size: size.name(),
        };
        if reg.is_float() {
            if !Self::fp_size_ok(reg, size) {
                return Err(bad_size());
            }
            let expected = size.scale();
            let opcode = if is_load {
                A64Opcode::LdrFpReg
            } else {
                A64Opcode::StrFpReg
            };
            return Ok((opcode, expected, reg.is_double()));
        }

        let expected = size.scale();
        if expected >= 2 && reg.is_64bit() != (expected == 3) {
            return Err(InvariantViolation::WidthMismatch { operation });
        }
        let opcode = match (size, is_load) {
            (OpSize::Double | OpSize::Word | OpSize::K64, true)
            | (OpSize::Single | OpSize::K32 | OpSize::Reference, true) => A64Opcode::LdrReg,
            (OpSize::Double | OpSize::Word | OpSize::K64, false)
            | (OpSize::Single | OpSize::K32 | OpSize::Reference, false) => A64Opcode::StrReg,
            (OpSize::UnsignedHalf, true) => A64Opcode::LdrhReg,
            (OpSize::SignedHalf, true) => A64Opcode::LdrshReg,
            (OpSize::UnsignedHalf | OpSize::SignedHalf, false) => A64Opcode::StrhReg,
            (OpSize::UnsignedByte, true) => A64Opcode::LdrbReg,
            (OpSize::SignedByte, true) => A64Opcode::LdrsbReg,
            (OpSize::UnsignedByte | OpSize::SignedByte, false) => A64Opcode::StrbReg,
        };
        Ok((opcode, expected, reg.is_64bit()))
    }

    #[allow(clippy::too_many_arguments)]
    fn base_indexed(
        &mut self,
        operation: &'static str,
        base: Reg,
        index: Reg,
        reg: Reg,
        scale: u32,
        size: OpSize,
        is_load: bool,
    ) -> EncodeResult<LirId> {
        Self::check_base(operation, base)?;
        let (opcode, expected, wide) = Self::indexed_form(operation, reg, size, is_load)?;
        if scale != 0 && scale != expected {
            return Err(InvariantViolation::ScaleMismatch {
                operation,
                expected,
                actual: scale,
            });
        }
        Ok(self.emit(
            opcode,
            wide,
            smallvec![
                Operand::Reg(reg),
                Operand::Reg(base),
                Operand::Reg(index),
                Self::index_extend(index, scale),
            ],
            None,
        ))
    }

    /// Load `[base + index << scale]`; `scale` is 0 or the natural scale of
    /// `size`, and byte accesses take no scale.
    pub fn load_base_indexed(
        &mut self,
        base: Reg,
        index: Reg,
        dest: Reg,
        scale: u32,
        size: OpSize,
    ) -> EncodeResult<LirId> {
        self.base_indexed("load_base_indexed", base, index, dest, scale, size, true)
    }

    pub fn store_base_indexed(
        &mut self,
        base: Reg,
        index: Reg,
        src: Reg,
        scale: u32,
        size: OpSize,
    ) -> EncodeResult<LirId> {
        self.base_indexed("store_base_indexed", base, index, src, scale, size, false)
    }

    fn disp_forms(
        operation: &'static str,
        reg: Reg,
        size: OpSize,
        is_load: bool,
    ) -> EncodeResult<DispForms> {
        let scale = size.scale();
        let pick = |load: (A64Opcode, A64Opcode), store: (A64Opcode, A64Opcode)| {
            if is_load {
                load
            } else {
                store
            }
        };

        if reg.is_float() {
            if !Self::fp_size_ok(reg, size) {
                return Err(InvariantViolation::BadOperandSize {
                    operation,
                    size: size.name(),
                });
            }
            let (scaled, unscaled) = pick(
                (A64Opcode::LdrFpImm, A64Opcode::LdurFp),
                (A64Opcode::StrFpImm, A64Opcode::SturFp),
            );
            return Ok(DispForms {
                scaled,
                unscaled,
                scale,
                wide: reg.is_double(),
            });
        }

        if scale >= 2 && reg.is_64bit() != (scale == 3) {
            return Err(InvariantViolation::WidthMismatch { operation });
        }
        let (scaled, unscaled) = match size {
            OpSize::Double | OpSize::Word | OpSize::K64 | OpSize::Single | OpSize::K32
            | OpSize::Reference => pick(
                (A64Opcode::LdrImm, A64Opcode::Ldur),
                (A64Opcode::StrImm, A64Opcode::Stur),
            ),
            OpSize::UnsignedHalf => pick(
                (A64Opcode::LdrhImm, A64Opcode::Ldurh),
                (A64Opcode::StrhImm, A64Opcode::Sturh),
            ),
            OpSize::SignedHalf => pick(
                (A64Opcode::LdrshImm, A64Opcode::Ldursh),
                (A64Opcode::StrhImm, A64Opcode::Sturh),
            ),
            OpSize::UnsignedByte => pick(
                (A64Opcode::LdrbImm, A64Opcode::Ldurb),
                (A64Opcode::StrbImm, A64Opcode::Sturb),
            ),
            OpSize::SignedByte => pick(
                (A64Opcode::LdrsbImm, A64Opcode::Ldursb),
                (A64Opcode::StrbImm, A64Opcode::Sturb),
            ),
        };
        Ok(DispForms {
            scaled,
            unscaled,
            scale,
            wide: reg.is_64bit(),
        })
    }

    fn base_disp(
        &mut self,
        operation: &'static str,
        base: Reg,
        displacement: i32,
        reg: Reg,
        size: OpSize,
        is_load: bool,
    ) -> EncodeResult<LirId> {
        Self::check_base(operation, base)?;
        let forms = Self::disp_forms(operation, reg, size, is_load)?;

        let aligned = displacement & ((1 << forms.scale) - 1) == 0;
        let scaled_disp = displacement >> forms.scale;
        if aligned && (0..4096).contains(&scaled_disp) {
            return Ok(self.emit(
                forms.scaled,
                forms.wide,
                smallvec![
                    Operand::Reg(reg),
                    Operand::Reg(base),
                    Operand::Imm(scaled_disp as i64),
                ],
                None,
            ));
        }
        if fits_signed_imm9(displacement) {
            return Ok(self.emit(
                forms.unscaled,
                forms.wide,
                smallvec![
                    Operand::Reg(reg),
                    Operand::Reg(base),
                    Operand::Imm(displacement as i64),
                ],
                None,
            ));
        }

        debug!("{operation}: displacement {displacement} needs a scratch register");
        let scratch = self.scratch.alloc_temp()?;
        let res = self
            .load_constant(scratch, displacement)
            .and_then(|_| self.base_indexed(operation, base, scratch, reg, 0, size, is_load));
        self.scratch.free_temp(scratch)?;
        res
    }

    /// Load `[base + displacement]`, picking scaled, unscaled or
    /// register-indexed addressing.
    pub fn load_base_disp(
        &mut self,
        base: Reg,
        displacement: i32,
        dest: Reg,
        size: OpSize,
    ) -> EncodeResult<LirId> {
        self.base_disp("load_base_disp", base, displacement, dest, size, true)
    }

    /// Plain loads are single-copy atomic for naturally aligned accesses.
    pub fn load_base_disp_volatile(
        &mut self,
        base: Reg,
        displacement: i32,
        dest: Reg,
        size: OpSize,
    ) -> EncodeResult<LirId> {
        self.load_base_disp(base, displacement, dest, size)
    }

    pub fn store_base_disp(
        &mut self,
        base: Reg,
        displacement: i32,
        src: Reg,
        size: OpSize,
    ) -> EncodeResult<LirId> {
        self.base_disp("store_base_disp", base, displacement, src, size, false)
    }

    pub fn store_base_disp_volatile(
        &mut self,
        base: Reg,
        displacement: i32,
        src: Reg,
        size: OpSize,
    ) -> EncodeResult<LirId> {
        self.store_base_disp(base, displacement, src, size)
    }

    // Combinations with no lowering on this target.

    pub fn op_fp_reg_copy(&mut self, _dest: Reg, _src: Reg) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "op_fp_reg_copy",
        })
    }

    pub fn op_mov_reg_mem(&mut self, _dest: Reg, _base: Reg, _offset: i32) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "op_mov_reg_mem",
        })
    }

    pub fn op_mov_mem_reg(&mut self, _base: Reg, _offset: i32, _src: Reg) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "op_mov_mem_reg",
        })
    }

    pub fn op_cond_reg_reg(
        &mut self,
        _op: OpKind,
        _cond: Cond,
        _dest: Reg,
        _src: Reg,
    ) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "op_cond_reg_reg",
        })
    }

    pub fn op_thread_mem(&mut self, _op: OpKind, _thread_offset: i32) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "op_thread_mem",
        })
    }

    pub fn op_mem(&mut self, _op: OpKind, _base: Reg, _displacement: i32) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization { operation: "op_mem" })
    }

    pub fn op_reg_mem(
        &mut self,
        _op: OpKind,
        _dest: Reg,
        _base: Reg,
        _offset: i32,
    ) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "op_reg_mem",
        })
    }

    pub fn load_base_indexed_disp(
        &mut self,
        _base: Reg,
        _index: Reg,
        _scale: u32,
        _displacement: i32,
        _dest: Reg,
        _size: OpSize,
    ) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "load_base_indexed_disp",
        })
    }

    pub fn store_base_indexed_disp(
        &mut self,
        _base: Reg,
        _index: Reg,
        _scale: u32,
        _displacement: i32,
        _src: Reg,
        _size: OpSize,
    ) -> EncodeResult<LirId> {
        Err(InvariantViolation::NoLegalization {
            operation: "store_base_indexed_disp",
        })
    }
}

impl fmt::Display for A64Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for lir in &self.code {
            if lir.opcode() == A64Opcode::Label {
                writeln!(f, "{lir}")?;
            } else {
                writeln!(f, "    {lir}")?;
            }
        }
        if !self.literals.is_empty() {
            writeln!(f, "literal pool:")?;
            for (id, value) in self.literals.iter() {
                writeln!(f, "  {id}: {value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::immediates::decode_logical_immediate;

    #[test]
    fn test_fp_zero_uses_zero_register() {
        let mut enc = A64Encoder::new();
        enc.load_fp_constant_value(Reg::s(0), 0).unwrap();
        assert_eq!(enc.code().len(), 1);
        assert_eq!(enc.code()[0].opcode(), A64Opcode::FmovCore);
        assert_eq!(enc.code()[0].reg(1), Some(Reg::WZR));
        assert!(enc.literals().is_empty());
    }

    #[test]
    fn test_fp_immediate_and_pool() {
        let mut enc = A64Encoder::new();
        enc.load_fp_constant_value(Reg::s(1), 1.0f32.to_bits() as i32).unwrap();
        assert_eq!(enc.code()[0].opcode(), A64Opcode::FmovImm);
        assert_eq!(enc.code()[0].imm(1), Some(0x70));

        let pi = 3.14159f32.to_bits() as i32;
        enc.load_fp_constant_value(Reg::s(2), pi).unwrap();
        enc.load_fp_constant_value(Reg::s(3), pi).unwrap();
        assert_eq!(enc.literals().len(), 1);
        assert_eq!(enc.code()[1].target(), enc.code()[2].target());
        assert_eq!(enc.code()[2].opcode(), A64Opcode::LdrFpLiteral);
    }

    #[test]
    fn test_fp_constant_rejects_core_register() {
        let mut enc = A64Encoder::new();
        assert!(matches!(
            enc.load_fp_constant_value(Reg::w(0), 0),
            Err(InvariantViolation::RegisterClass { .. })
        ));
        assert!(matches!(
            enc.load_fp_constant_value_wide(Reg::s(0), 0),
            Err(InvariantViolation::RegisterClass { .. })
        ));
    }

    #[test]
    fn test_load_constant_single_instruction_forms() {
        let mut enc = A64Encoder::new();
        enc.load_constant(Reg::w(0), 0).unwrap();
        enc.load_constant(Reg::w(0), -1).unwrap();
        enc.load_constant(Reg::w(0), 0x1234).unwrap();
        enc.load_constant(Reg::w(0), 0x5678_0000).unwrap();
        enc.load_constant(Reg::w(0), -2).unwrap();
        enc.load_constant(Reg::w(0), 0x1234_ffff).unwrap();

        let ops: Vec<_> = enc.code().iter().map(|l| l.opcode()).collect();
        assert_eq!(
            ops,
            vec![
                A64Opcode::Mov,
                A64Opcode::Mvn,
                A64Opcode::Movz,
                A64Opcode::Movz,
                A64Opcode::Movn,
                A64Opcode::Movn,
            ]
        );
        assert_eq!(enc.code()[2].imm(1), Some(0x1234));
        assert_eq!(enc.code()[3].imm(1), Some(0x5678));
        assert_eq!(enc.code()[3].operand(2), Some(Operand::Shift(encode_shift(ShiftType::Lsl, 16))));
        // -2 = movn #1
        assert_eq!(enc.code()[4].imm(1), Some(1));
        // 0x1234ffff = movn #0xedcb, lsl #16
        assert_eq!(enc.code()[5].imm(1), Some(0xedcb));
    }

    #[test]
    fn test_load_constant_logical_then_pair() {
        let mut enc = A64Encoder::new();
        let orr = enc.load_constant(Reg::w(1), 0x00ff_00ff).unwrap();
        assert_eq!(enc.lir(orr).opcode(), A64Opcode::OrrImm);
        assert_eq!(enc.lir(orr).reg(1), Some(Reg::WZR));

        let pair = enc.load_constant(Reg::w(1), 0x1234_5678).unwrap();
        let seq = enc.code_since(pair);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].opcode(), A64Opcode::Movz);
        assert_eq!(seq[0].imm(1), Some(0x5678));
        assert_eq!(seq[1].opcode(), A64Opcode::Movk);
        assert_eq!(seq[1].imm(1), Some(0x1234));
    }

    #[test]
    fn test_load_constant_x_destination_uses_w_view() {
        let mut enc = A64Encoder::new();
        let orr = enc.load_constant(Reg::x(0), 0x00ff_00ff).unwrap();
        let lir = enc.lir(orr);
        assert_eq!(lir.opcode(), A64Opcode::OrrImm);
        assert!(!lir.is_wide());
        assert_eq!(lir.reg(0), Some(Reg::w(0)));
        assert_eq!(lir.reg(1), Some(Reg::WZR));
        let encoded = lir.imm(2).unwrap() as u32;
        assert_eq!(decode_logical_immediate(false, encoded), Some(0x00ff_00ff));

        // movn of a W register leaves the upper half of X clear.
        let movn = enc.load_constant(Reg::x(1), -2).unwrap();
        assert_eq!(enc.lir(movn).opcode(), A64Opcode::Movn);
        assert_eq!(enc.lir(movn).reg(0), Some(Reg::w(1)));
        assert!(!enc.lir(movn).is_wide());

        let pair = enc.load_constant(Reg::x(2), 0x1234_5678).unwrap();
        let seq = enc.code_since(pair);
        assert_eq!(seq.len(), 2);
        assert!(seq.iter().all(|l| !l.is_wide() && l.reg(0) == Some(Reg::w(2))));
    }

    #[test]
    fn test_load_constant_wide_paths() {
        let mut enc = A64Encoder::new();
        enc.load_constant_wide(Reg::x(0), 0).unwrap();
        enc.load_constant_wide(Reg::x(0), 0x5555_5555_5555_5555).unwrap();
        enc.load_constant_wide(Reg::x(0), 0x0123_4567_89ab_cdef).unwrap();
        let ops: Vec<_> = enc.code().iter().map(|l| l.opcode()).collect();
        assert_eq!(
            ops,
            vec![A64Opcode::Mov, A64Opcode::OrrImm, A64Opcode::LdrLiteral]
        );
        assert_eq!(enc.literals().len(), 1);
        assert!(enc.load_constant_wide(Reg::w(0), 1).is_err());
    }

    #[test]
    fn test_add_sub_immediates() {
        let mut enc = A64Encoder::new();
        enc.op_reg_reg_imm(OpKind::Add, Reg::x(0), Reg::x(1), 42).unwrap();
        enc.op_reg_reg_imm(OpKind::Add, Reg::x(0), Reg::x(1), -42).unwrap();
        enc.op_reg_reg_imm(OpKind::Sub, Reg::w(0), Reg::w(1), 0x5000).unwrap();
        let code = enc.code();
        assert_eq!(code[0].opcode(), A64Opcode::AddImm);
        assert_eq!(code[1].opcode(), A64Opcode::SubImm);
        assert_eq!(code[1].imm(2), Some(42));
        assert_eq!(code[2].opcode(), A64Opcode::SubImm);
        assert_eq!(code[2].imm(2), Some(5));
        assert_eq!(code[2].operand(3), Some(Operand::Shift(encode_shift(ShiftType::Lsl, 12))));
    }

    #[test]
    fn test_reg_reg_imm_scratch_fallback() {
        let mut enc = A64Encoder::new();
        let res = enc.op_reg_reg_imm(OpKind::Add, Reg::w(0), Reg::w(1), 0x12345).unwrap();
        let lir = enc.lir(res);
        assert_eq!(lir.opcode(), A64Opcode::AddShifted);
        assert_eq!(lir.reg(2), Some(Reg::w(16)));
        assert_eq!(enc.scratch().available(), 2);

        enc.op_reg_reg_imm(OpKind::And, Reg::w(0), Reg::w(1), 0xff).unwrap();
        assert_eq!(enc.code().last().unwrap().opcode(), A64Opcode::AndImm);
    }

    #[test]
    fn test_shift_immediates() {
        let mut enc = A64Encoder::new();
        let lsl = enc.op_reg_reg_imm(OpKind::Lsl, Reg::w(0), Reg::w(1), 3).unwrap();
        assert_eq!(enc.lir(lsl).opcode(), A64Opcode::Ubfm);
        assert_eq!(enc.lir(lsl).imm(2), Some(29));
        assert_eq!(enc.lir(lsl).imm(3), Some(28));
        let ror = enc.op_reg_reg_imm(OpKind::Ror, Reg::x(0), Reg::x(1), 7).unwrap();
        assert_eq!(enc.lir(ror).opcode(), A64Opcode::Extr);
        assert_eq!(enc.lir(ror).reg(2), Some(Reg::x(1)));
    }

    #[test]
    fn test_reg_imm_negation_flip() {
        let mut enc = A64Encoder::new();
        enc.op_reg_imm(OpKind::Cmp, Reg::w(3), -5).unwrap();
        enc.op_reg_imm(OpKind::Sub, Reg::x(3), 0x7000).unwrap();
        assert_eq!(enc.code()[0].opcode(), A64Opcode::CmnImm);
        assert_eq!(enc.code()[0].operands().len(), 3);
        assert_eq!(enc.code()[1].opcode(), A64Opcode::SubImm);
        assert_eq!(enc.code()[1].imm(2), Some(7));

        let res = enc.op_reg_imm64(OpKind::Add, Reg::x(3), 0x1_2345_6789).unwrap();
        assert_eq!(enc.lir(res).opcode(), A64Opcode::LdrLiteral);
        assert_eq!(enc.code().last().unwrap().opcode(), A64Opcode::AddShifted);
        assert_eq!(enc.scratch().available(), 2);
    }

    #[test]
    fn test_shift_amount_must_fit_operand_width() {
        let mut enc = A64Encoder::new();
        for op in [OpKind::Lsl, OpKind::Lsr, OpKind::Asr, OpKind::Ror] {
            assert!(matches!(
                enc.op_reg_reg_imm(op, Reg::w(0), Reg::w(1), 32),
                Err(InvariantViolation::ImmediateOutOfRange { value: 32, .. })
            ));
            assert!(matches!(
                enc.op_reg_reg_imm(op, Reg::x(0), Reg::x(1), 64),
                Err(InvariantViolation::ImmediateOutOfRange { value: 64, .. })
            ));
            assert!(matches!(
                enc.op_reg_reg_imm(op, Reg::x(0), Reg::x(1), -1),
                Err(InvariantViolation::ImmediateOutOfRange { value: -1, .. })
            ));
        }
        assert!(enc.code().is_empty());

        // lsl #63 is ubfm #1, #0
        let lsl = enc.op_reg_reg_imm(OpKind::Lsl, Reg::x(0), Reg::x(1), 63).unwrap();
        assert_eq!(enc.lir(lsl).imm(2), Some(1));
        assert_eq!(enc.lir(lsl).imm(3), Some(0));
        let asr = enc.op_reg_reg_imm(OpKind::Asr, Reg::w(0), Reg::w(1), 31).unwrap();
        assert_eq!(enc.lir(asr).imm(2), Some(31));
    }

    #[test]
    fn test_reg_imm64_rejects_truncating_w_immediate() {
        let mut enc = A64Encoder::new();
        assert!(matches!(
            enc.op_reg_imm64(OpKind::Add, Reg::w(3), 0x1_0000_0001),
            Err(InvariantViolation::ImmediateOutOfRange { .. })
        ));
        assert!(enc.code().is_empty());
        assert_eq!(enc.scratch().available(), 2);

        let res = enc.op_reg_imm64(OpKind::Add, Reg::w(3), 0x12345).unwrap();
        assert_eq!(enc.lir(res).opcode(), A64Opcode::Movz);
        assert_eq!(enc.lir(res).reg(0), Some(Reg::w(16)));
        assert_eq!(enc.code().last().unwrap().opcode(), A64Opcode::AddShifted);
    }

    #[test]
    fn test_scratch_released_when_fallback_fails() {
        let mut enc = A64Encoder::new();
        assert!(matches!(
            enc.op_reg_imm64(OpKind::Bx, Reg::x(3), 0x1_2345_6789),
            Err(InvariantViolation::NoLegalization { .. })
        ));
        assert_eq!(enc.scratch().available(), 2);

        let mut enc = A64Encoder::with_scratch(ScratchPool::new(&[9]));
        let res = enc.op_reg_reg_imm(OpKind::Mul, Reg::w(0), Reg::w(1), 7).unwrap();
        assert_eq!(enc.lir(res).reg(2), Some(Reg::w(9)));
        assert!(enc.scratch().is_free(Reg::w(9)));
    }

    #[test]
    fn test_reg_reg_forms() {
        let mut enc = A64Encoder::new();
        enc.op_reg_reg(OpKind::Mov, Reg::x(0), Reg::x(1)).unwrap();
        enc.op_reg_reg_shift(OpKind::Cmp, Reg::w(0), Reg::w(1), encode_shift(ShiftType::Lsl, 2))
            .unwrap();
        enc.op_reg_reg(OpKind::IntToChar, Reg::w(0), Reg::w(1)).unwrap();
        enc.op_reg_reg(OpKind::Add, Reg::w(0), Reg::w(1)).unwrap();
        let code = enc.code();
        assert_eq!(code[0].opcode(), A64Opcode::Mov);
        assert_eq!(code[1].operands().len(), 3);
        assert_eq!(code[2].opcode(), A64Opcode::Ubfm);
        assert_eq!(code[2].imm(3), Some(15));
        assert_eq!(code[3].opcode(), A64Opcode::AddShifted);
        assert_eq!(code[3].reg(1), Some(Reg::w(0)));
    }

    #[test]
    fn test_width_mismatch_is_fatal() {
        let mut enc = A64Encoder::new();
        assert!(matches!(
            enc.op_reg_reg(OpKind::Mov, Reg::x(0), Reg::w(1)),
            Err(InvariantViolation::WidthMismatch { .. })
        ));
        assert!(matches!(
            enc.op_reg_reg_reg(OpKind::Add, Reg::x(0), Reg::x(1), Reg::w(2)),
            Err(InvariantViolation::WidthMismatch { .. })
        ));
    }

    #[test]
    fn test_branches() {
        let mut enc = A64Encoder::new();
        let head = enc.new_label();
        let exit = enc.new_label();
        enc.bind_label(head);
        enc.op_cond_branch(Cond::Eq, exit);
        enc.op_unconditional_branch(head);
        enc.bind_label(exit);
        enc.op_reg(OpKind::Blx, Reg::LR).unwrap();
        assert!(enc.op_reg(OpKind::Bx, Reg::LR).is_err());

        let listing = enc.to_string();
        assert!(listing.contains("L0:"));
        assert!(listing.contains("b.eq L1"));
        assert!(listing.contains("b L0"));
        assert!(listing.contains("blr x30"));
    }

    #[test]
    fn test_displacement_forms() {
        let mut enc = A64Encoder::new();
        enc.load_base_disp(Reg::SP, 16, Reg::x(0), OpSize::K64).unwrap();
        enc.load_base_disp(Reg::SP, 12, Reg::x(0), OpSize::K64).unwrap();
        enc.load_base_disp(Reg::SP, -8, Reg::w(0), OpSize::K32).unwrap();
        let code = enc.code();
        assert_eq!(code[0].opcode(), A64Opcode::LdrImm);
        assert_eq!(code[0].imm(2), Some(2));
        assert!(code[0].is_wide());
        assert_eq!(code[1].opcode(), A64Opcode::Ldur);
        assert_eq!(code[1].imm(2), Some(12));
        assert_eq!(code[2].opcode(), A64Opcode::Ldur);
    }

    #[test]
    fn test_displacement_scratch_is_released() {
        let mut enc = A64Encoder::new();
        let res = enc.store_base_disp(Reg::x(1), 0x10_0000, Reg::w(2), OpSize::K32).unwrap();
        let lir = enc.lir(res);
        assert_eq!(lir.opcode(), A64Opcode::StrReg);
        assert_eq!(lir.reg(2), Some(Reg::w(16)));
        assert_eq!(
            lir.operand(3),
            Some(Operand::Extend(encode_extend(ExtendType::Sxtw, 0)))
        );
        assert!(enc.scratch().is_free(Reg::w(16)));
        // The displacement is materialized before the store.
        assert_eq!(enc.code()[0].opcode(), A64Opcode::Movz);
    }

    #[test]
    fn test_fp_sizes_agree_between_addressing_modes() {
        let mut enc = A64Encoder::new();
        // Word is an 8-byte size, so a d register takes it in every mode.
        let scaled = enc.load_base_disp(Reg::x(1), 8, Reg::d(0), OpSize::Word).unwrap();
        assert_eq!(enc.lir(scaled).opcode(), A64Opcode::LdrFpImm);
        let indexed = enc
            .load_base_disp(Reg::x(1), 0x10_0000, Reg::d(0), OpSize::Word)
            .unwrap();
        assert_eq!(enc.lir(indexed).opcode(), A64Opcode::LdrFpReg);
        assert_eq!(enc.scratch().available(), 2);
        enc.load_base_indexed(Reg::x(1), Reg::x(2), Reg::d(0), 3, OpSize::Word)
            .unwrap();

        for size in [OpSize::Reference, OpSize::K64] {
            assert!(matches!(
                enc.store_base_disp(Reg::x(1), 0x10_0000, Reg::s(0), size),
                Err(InvariantViolation::BadOperandSize { .. })
            ));
            assert!(matches!(
                enc.store_base_indexed(Reg::x(1), Reg::x(2), Reg::s(0), 0, size),
                Err(InvariantViolation::BadOperandSize { .. })
            ));
        }
        assert_eq!(enc.scratch().available(), 2);
    }

    #[test]
    fn test_byte_and_half_accesses() {
        let mut enc = A64Encoder::new();
        enc.load_base_disp(Reg::x(1), 4095, Reg::w(0), OpSize::UnsignedByte).unwrap();
        enc.load_base_disp(Reg::x(1), -1, Reg::w(0), OpSize::SignedByte).unwrap();
        enc.load_base_disp(Reg::x(1), 6, Reg::w(0), OpSize::SignedHalf).unwrap();
        enc.store_base_disp(Reg::x(1), 3, Reg::w(0), OpSize::UnsignedHalf).unwrap();
        let ops: Vec<_> = enc.code().iter().map(|l| l.opcode()).collect();
        assert_eq!(
            ops,
            vec![
                A64Opcode::LdrbImm,
                A64Opcode::Ldursb,
                A64Opcode::LdrshImm,
                A64Opcode::Sturh
            ]
        );
    }

    #[test]
    fn test_indexed_scale_checks() {
        let mut enc = A64Encoder::new();
        enc.load_base_indexed(Reg::x(1), Reg::x(2), Reg::x(0), 3, OpSize::K64).unwrap();
        enc.load_base_indexed(Reg::x(1), Reg::x(2), Reg::d(0), 0, OpSize::Double).unwrap();
        assert_eq!(enc.code()[1].opcode(), A64Opcode::LdrFpReg);
        assert!(enc.code()[1].is_wide());
        assert!(matches!(
            enc.load_base_indexed(Reg::x(1), Reg::x(2), Reg::w(0), 3, OpSize::K32),
            Err(InvariantViolation::ScaleMismatch { expected: 2, actual: 3, .. })
        ));
        assert!(matches!(
            enc.store_base_indexed(Reg::x(1), Reg::x(2), Reg::w(0), 1, OpSize::UnsignedByte),
            Err(InvariantViolation::ScaleMismatch { expected: 0, .. })
        ));
        assert!(matches!(
            enc.load_base_indexed(Reg::x(1), Reg::x(2), Reg::s(0), 0, OpSize::K64),
            Err(InvariantViolation::BadOperandSize { .. })
        ));
    }

    #[test]
    fn test_fp_displacement_forms() {
        let mut enc = A64Encoder::new();
        enc.load_base_disp(Reg::x(1), 8, Reg::d(0), OpSize::Double).unwrap();
        enc.store_base_disp(Reg::x(1), -4, Reg::s(0), OpSize::Single).unwrap();
        assert_eq!(enc.code()[0].opcode(), A64Opcode::LdrFpImm);
        assert_eq!(enc.code()[0].imm(2), Some(1));
        assert_eq!(enc.code()[1].opcode(), A64Opcode::SturFp);
    }

    #[test]
    fn test_unimplementable_operations() {
        let mut enc = A64Encoder::new();
        assert_eq!(
            enc.op_fp_reg_copy(Reg::d(0), Reg::d(1)),
            Err(InvariantViolation::NoLegalization {
                operation: "op_fp_reg_copy"
            })
        );
        assert!(enc
            .store_base_indexed_disp(Reg::x(0), Reg::x(1), 2, 8, Reg::w(2), OpSize::K32)
            .is_err());
        assert!(enc.op_mem(OpKind::Add, Reg::x(0), 0).is_err());
        assert!(enc.op_thread_mem(OpKind::Cmp, 64).is_err());
        assert!(enc.code().is_empty());
    }
}
