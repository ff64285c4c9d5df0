// This module groups the AArch64 back end of dexlower: the register model and the
// encoder's scratch pool, the LIR records with their static opcode table, the pure
// immediate encoders and decoders, the per-method literal pool, and the A64Encoder
// that selects instructions from abstract operations. Only the encoder holds
// mutable state; the tables and the immediate functions are free of side effects
// and can be shared by any number of compiling threads.

//! AArch64 instruction selection.
//!
//! - [`registers`]: `Reg`, the zero register and stack pointer, `ScratchPool`
//! - [`lir`]: instruction records and opcode metadata
//! - [`immediates`]: fmov, logical, shift and extend encodings
//! - [`literal_pool`]: deduplicated per-method constants
//! - [`encoder`]: `A64Encoder`

pub mod encoder;
pub mod immediates;
pub mod lir;
pub mod literal_pool;
pub mod registers;

pub use encoder::{A64Encoder, OpKind, OpSize};
pub use immediates::{
    decode_imm_double, decode_imm_single, decode_logical_immediate, encode_extend,
    encode_imm_double, encode_imm_single, encode_logical_immediate, encode_shift,
    is_extend_encoding, ExtendType, ShiftType, ENCODE_NO_SHIFT,
};
pub use lir::{A64Opcode, Cond, Label, Lir, LirId, LirTarget, Operand};
pub use literal_pool::{LiteralId, LiteralPool, LiteralValue};
pub use registers::{Reg, RegClass, ScratchPool};
