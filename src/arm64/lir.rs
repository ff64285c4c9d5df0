// This module defines the low-level instruction records (LIR) the AArch64 encoder
// produces. Each record names an opcode from a fixed table, whether it operates on
// the 64-bit (or double-precision) form, up to four operands and an optional
// target: a label for branches or a literal-pool slot for PC-relative loads. The
// opcode table is generated by a macro into a const fn match, so the metadata
// (mnemonic, operand count, flags) is immutable and shared by every worker without
// initialisation. Operand descriptors for shifts and extends reuse the packed
// encodings from the immediates module, so a record carries exactly what the final
// instruction word needs.

//! Low-level instruction records and opcode metadata.

use super::immediates::is_extend_encoding;
use super::literal_pool::LiteralId;
use super::registers::Reg;
use smallvec::SmallVec;
use std::fmt;
use std::ops::BitOr;

/// Opcode property bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LirFlags(u16);

impl LirFlags {
    pub const NONE: LirFlags = LirFlags(0);
    pub const LOAD: LirFlags = LirFlags(1 << 0);
    pub const STORE: LirFlags = LirFlags(1 << 1);
    pub const BRANCH: LirFlags = LirFlags(1 << 2);
    /// Addresses a literal-pool slot.
    pub const PC_RELATIVE: LirFlags = LirFlags(1 << 3);
    pub const SETS_FLAGS: LirFlags = LirFlags(1 << 4);
    /// Operates on the FP register file.
    pub const FP: LirFlags = LirFlags(1 << 5);
    /// Emits no machine instruction.
    pub const PSEUDO: LirFlags = LirFlags(1 << 6);

    pub const fn union(self, other: LirFlags) -> LirFlags {
        LirFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: LirFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LirFlags {
    type Output = LirFlags;

    fn bitor(self, rhs: LirFlags) -> LirFlags {
        self.union(rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A64OpcodeInfo {
    pub mnemonic: &'static str,
    /// Operand count, target excluded.
    pub operands: u8,
    pub flags: LirFlags,
}

macro_rules! a64_opcodes {
    ($($variant:ident => $mnemonic:literal, $operands:literal, [$($flag:ident)|*];)*) => {
        /// AArch64 instructions the encoder selects.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum A64Opcode {
            $($variant,)*
        }

        impl A64Opcode {
            pub const fn info(self) -> A64OpcodeInfo {
                match self {
                    $(A64Opcode::$variant => A64OpcodeInfo {
                        mnemonic: $mnemonic,
                        operands: $operands,
                        flags: LirFlags::NONE$(.union(LirFlags::$flag))*,
                    },)*
                }
            }
        }
    };
}

a64_opcodes! {
    Label => "label", 0, [PSEUDO];
    Brk => "brk", 1, [];
    Mov => "mov", 2, [];
    Mvn => "mvn", 2, [];
    Movz => "movz", 3, [];
    Movn => "movn", 3, [];
    Movk => "movk", 3, [];
    Neg => "neg", 3, [];
    Cmp => "cmp", 3, [SETS_FLAGS];
    Cmn => "cmn", 3, [SETS_FLAGS];
    Tst => "tst", 3, [SETS_FLAGS];
    Rev => "rev", 2, [];
    Rev16 => "rev16", 2, [];
    Sbfm => "sbfm", 4, [];
    Ubfm => "ubfm", 4, [];
    AddShifted => "add", 4, [];
    SubShifted => "sub", 4, [];
    AndShifted => "and", 4, [];
    EorShifted => "eor", 4, [];
    OrrShifted => "orr", 4, [];
    Adc => "adc", 3, [];
    Sbc => "sbc", 3, [];
    Mul => "mul", 3, [];
    Sdiv => "sdiv", 3, [];
    LslReg => "lsl", 3, [];
    LsrReg => "lsr", 3, [];
    AsrReg => "asr", 3, [];
    RorReg => "ror", 3, [];
    LsrImm => "lsr", 3, [];
    AsrImm => "asr", 3, [];
    Extr => "extr", 4, [];
    AddImm => "add", 4, [];
    SubImm => "sub", 4, [];
    CmpImm => "cmp", 3, [SETS_FLAGS];
    CmnImm => "cmn", 3, [SETS_FLAGS];
    AndImm => "and", 3, [];
    OrrImm => "orr", 3, [];
    EorImm => "eor", 3, [];
    B => "b", 0, [BRANCH];
    BCond => "b", 1, [BRANCH];
    Blr => "blr", 1, [BRANCH];
    FmovCore => "fmov", 2, [FP];
    FmovImm => "fmov", 2, [FP];
    LdrLiteral => "ldr", 1, [LOAD | PC_RELATIVE];
    LdrFpLiteral => "ldr", 1, [LOAD | PC_RELATIVE | FP];
    LdrImm => "ldr", 3, [LOAD];
    LdrFpImm => "ldr", 3, [LOAD | FP];
    LdrhImm => "ldrh", 3, [LOAD];
    LdrshImm => "ldrsh", 3, [LOAD];
    LdrbImm => "ldrb", 3, [LOAD];
    LdrsbImm => "ldrsb", 3, [LOAD];
    Ldur => "ldur", 3, [LOAD];
    LdurFp => "ldur", 3, [LOAD | FP];
    Ldurh => "ldurh", 3, [LOAD];
    Ldursh => "ldursh", 3, [LOAD];
    Ldurb => "ldurb", 3, [LOAD];
    Ldursb => "ldursb", 3, [LOAD];
    LdrReg => "ldr", 4, [LOAD];
    LdrFpReg => "ldr", 4, [LOAD | FP];
    LdrhReg => "ldrh", 4, [LOAD];
    LdrshReg => "ldrsh", 4, [LOAD];
    LdrbReg => "ldrb", 4, [LOAD];
    LdrsbReg => "ldrsb", 4, [LOAD];
    StrImm => "str", 3, [STORE];
    StrFpImm => "str", 3, [STORE | FP];
    StrhImm => "strh", 3, [STORE];
    StrbImm => "strb", 3, [STORE];
    Stur => "stur", 3, [STORE];
    SturFp => "stur", 3, [STORE | FP];
    Sturh => "sturh", 3, [STORE];
    Sturb => "sturb", 3, [STORE];
    StrReg => "str", 4, [STORE];
    StrFpReg => "str", 4, [STORE | FP];
    StrhReg => "strh", 4, [STORE];
    StrbReg => "strb", 4, [STORE];
}

impl A64Opcode {
    pub const fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    pub const fn operand_count(self) -> u8 {
        self.info().operands
    }

    pub const fn flags(self) -> LirFlags {
        self.info().flags
    }

    pub const fn is_load(self) -> bool {
        self.flags().contains(LirFlags::LOAD)
    }

    pub const fn is_store(self) -> bool {
        self.flags().contains(LirFlags::STORE)
    }

    pub const fn is_branch(self) -> bool {
        self.flags().contains(LirFlags::BRANCH)
    }
}

/// Condition codes, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Cond {
    pub fn encoding(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Cs => "cs",
            Cond::Cc => "cc",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Al => "al",
        }
    }
}

/// One operand field of a [`Lir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// Packed by [`encode_shift`](super::immediates::encode_shift).
    Shift(u32),
    /// Packed by [`encode_extend`](super::immediates::encode_extend).
    Extend(u32),
    Cond(Cond),
}

const SHIFT_NAMES: [&str; 4] = ["lsl", "lsr", "asr", "ror"];
const EXTEND_NAMES: [&str; 8] = ["uxtb", "uxth", "uxtw", "uxtx", "sxtb", "sxth", "sxtw", "sxtx"];

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Imm(value) => write!(f, "#{value}"),
            Operand::Shift(encoded) => {
                debug_assert!(!is_extend_encoding(encoded));
                let kind = SHIFT_NAMES[((encoded >> 7) & 0x3) as usize];
                write!(f, "{kind} #{}", encoded & 0x1f)
            }
            Operand::Extend(encoded) => {
                let kind = EXTEND_NAMES[((encoded >> 3) & 0x7) as usize];
                write!(f, "{kind} #{}", encoded & 0x7)
            }
            Operand::Cond(cond) => f.write_str(cond.name()),
        }
    }
}

/// Branch label, bound by a `Label` pseudo-instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LirTarget {
    Label(Label),
    Literal(LiteralId),
}

impl fmt::Display for LirTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirTarget::Label(label) => write!(f, "{label}"),
            LirTarget::Literal(id) => write!(f, "{id}"),
        }
    }
}

/// Handle to a record in an encoder's instruction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LirId(pub(crate) u32);

impl LirId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A selected machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lir {
    opcode: A64Opcode,
    wide: bool,
    operands: SmallVec<[Operand; 4]>,
    target: Option<LirTarget>,
    dex_pc: u32,
}

impl Lir {
    pub(crate) fn new(
        opcode: A64Opcode,
        wide: bool,
        operands: SmallVec<[Operand; 4]>,
        target: Option<LirTarget>,
        dex_pc: u32,
    ) -> Self {
        debug_assert_eq!(
            operands.len(),
            opcode.operand_count() as usize,
            "operand count for {opcode:?}"
        );
        Self {
            opcode,
            wide,
            operands,
            target,
            dex_pc,
        }
    }

    pub fn opcode(&self) -> A64Opcode {
        self.opcode
    }

    /// 64-bit (or double-precision) form.
    pub fn is_wide(&self) -> bool {
        self.wide
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Option<Operand> {
        self.operands.get(index).copied()
    }

    pub fn reg(&self, index: usize) -> Option<Reg> {
        match self.operand(index)? {
            Operand::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn imm(&self, index: usize) -> Option<i64> {
        match self.operand(index)? {
            Operand::Imm(value) => Some(value),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<LirTarget> {
        self.target
    }

    /// Bytecode offset this instruction was selected for.
    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }
}

impl fmt::Display for Lir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.opcode == A64Opcode::Label {
            return match self.target {
                Some(target) => write!(f, "{target}:"),
                None => f.write_str("label:"),
            };
        }
        f.write_str(self.opcode.mnemonic())?;
        let mut operands = self.operands.iter();
        if self.opcode == A64Opcode::BCond {
            if let Some(Operand::Cond(cond)) = operands.next() {
                write!(f, ".{}", cond.name())?;
            }
        }
        let mut first = true;
        for operand in operands {
            f.write_str(if first { " " } else { ", " })?;
            write!(f, "{operand}")?;
            first = false;
        }
        if let Some(target) = self.target {
            f.write_str(if first { " " } else { ", " })?;
            write!(f, "{target}")?;
        }
        Ok(())
    }
}
