//! Decoded bytecode instructions.
//!
//! An [`Instruction`] pairs an opcode with operands whose shape matches the
//! opcode's [`Format`]; the constructor rejects anything else, so consumers
//! can pattern-match on operands without re-validating field widths.

use super::opcode::{Format, Opcode};
use smallvec::SmallVec;
use thiserror::Error;

/// Virtual register number.
pub type VReg = u16;

/// Errors raised while constructing or decoding bytecode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("{opcode} expects {expected:?} operands")]
    OperandShape { opcode: Opcode, expected: Format },

    #[error("{opcode}: {what} {value} does not fit the {format:?} encoding")]
    OperandRange {
        opcode: Opcode,
        format: Format,
        what: &'static str,
        value: i64,
    },
}

/// Operand payload of an instruction, one variant per operand shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operands {
    None,
    Reg { a: VReg },
    RegReg { a: VReg, b: VReg },
    RegLiteral { a: VReg, literal: i32 },
    RegIndex { a: VReg, index: u32 },
    Branch { offset: i32 },
    RegBranch { a: VReg, offset: i32 },
    RegRegBranch { a: VReg, b: VReg, offset: i32 },
    RegRegReg { a: VReg, b: VReg, c: VReg },
    RegRegLiteral { a: VReg, b: VReg, literal: i32 },
    Invoke { method_idx: u32, args: SmallVec<[VReg; 5]> },
    InvokeRange { method_idx: u32, first: VReg, count: u16 },
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    opcode: Opcode,
    operands: Operands,
}

fn check_range(
    opcode: Opcode,
    what: &'static str,
    value: i64,
    min: i64,
    max: i64,
) -> Result<(), BytecodeError> {
    if value < min || value > max {
        return Err(BytecodeError::OperandRange {
            opcode,
            format: opcode.format(),
            what,
            value,
        });
    }
    Ok(())
}

impl Instruction {
    /// Build an instruction, validating operand shape and field widths.
    pub fn new(opcode: Opcode, operands: Operands) -> Result<Self, BytecodeError> {
        let format = opcode.format();
        let shape_error = || BytecodeError::OperandShape { opcode, expected: format };
        let nibble = |what, v: VReg| check_range(opcode, what, v as i64, 0, 15);
        let byte = |what, v: VReg| check_range(opcode, what, v as i64, 0, 255);

        match (format, &operands) {
            (Format::K10x, Operands::None) => {}
            (Format::K11x, Operands::Reg { a }) => byte("register", *a)?,
            (Format::K12x, Operands::RegReg { a, b }) => {
                nibble("register", *a)?;
                nibble("register", *b)?;
            }
            (Format::K11n, Operands::RegLiteral { a, literal }) => {
                nibble("register", *a)?;
                check_range(opcode, "literal", *literal as i64, -8, 7)?;
            }
            (Format::K21s, Operands::RegLiteral { a, literal }) => {
                byte("register", *a)?;
                check_range(opcode, "literal", *literal as i64, i16::MIN as i64, i16::MAX as i64)?;
            }
            (Format::K31i, Operands::RegLiteral { a, .. }) => byte("register", *a)?,
            (Format::K21c, Operands::RegIndex { a, index }) => {
                byte("register", *a)?;
                check_range(opcode, "index", *index as i64, 0, u16::MAX as i64)?;
            }
            (Format::K10t, Operands::Branch { offset }) => {
                check_range(opcode, "offset", *offset as i64, i8::MIN as i64, i8::MAX as i64)?;
            }
            (Format::K20t, Operands::Branch { offset }) => {
                check_range(opcode, "offset", *offset as i64, i16::MIN as i64, i16::MAX as i64)?;
            }
            (Format::K30t, Operands::Branch { .. }) => {}
            (Format::K31t, Operands::RegBranch { a, .. }) => byte("register", *a)?,
            (Format::K22t, Operands::RegRegBranch { a, b, offset }) => {
                nibble("register", *a)?;
                nibble("register", *b)?;
                check_range(opcode, "offset", *offset as i64, i16::MIN as i64, i16::MAX as i64)?;
            }
            (Format::K23x, Operands::RegRegReg { a, b, c }) => {
                byte("register", *a)?;
                byte("register", *b)?;
                byte("register", *c)?;
            }
            (Format::K22s, Operands::RegRegLiteral { a, b, literal }) => {
                nibble("register", *a)?;
                nibble("register", *b)?;
                check_range(opcode, "literal", *literal as i64, i16::MIN as i64, i16::MAX as i64)?;
            }
            (Format::K22b, Operands::RegRegLiteral { a, b, literal }) => {
                byte("register", *a)?;
                byte("register", *b)?;
                check_range(opcode, "literal", *literal as i64, i8::MIN as i64, i8::MAX as i64)?;
            }
            (Format::K35c, Operands::Invoke { method_idx, args }) => {
                check_range(opcode, "argument count", args.len() as i64, 0, 5)?;
                for &arg in args {
                    nibble("register", arg)?;
                }
                check_range(opcode, "method index", *method_idx as i64, 0, u16::MAX as i64)?;
            }
            (Format::K3rc, Operands::InvokeRange { method_idx, count, .. }) => {
                check_range(opcode, "argument count", *count as i64, 0, 255)?;
                check_range(opcode, "method index", *method_idx as i64, 0, u16::MAX as i64)?;
            }
            _ => return Err(shape_error()),
        }

        Ok(Self { opcode, operands })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn operands(&self) -> &Operands {
        &self.operands
    }

    pub fn size_in_code_units(&self) -> u32 {
        self.opcode.format().size_in_code_units()
    }

    /// Relative branch offset, for branching instructions and switches.
    pub fn branch_offset(&self) -> Option<i32> {
        match self.operands {
            Operands::Branch { offset }
            | Operands::RegBranch { offset, .. }
            | Operands::RegRegBranch { offset, .. } => Some(offset),
            _ => None,
        }
    }

    pub fn is_branch(&self) -> bool {
        self.opcode.is_branch()
    }

    /// Highest virtual register this instruction names, if any.
    pub fn max_register(&self) -> Option<u32> {
        let regs: SmallVec<[u32; 5]> = match &self.operands {
            Operands::None | Operands::Branch { .. } => SmallVec::new(),
            Operands::Reg { a }
            | Operands::RegLiteral { a, .. }
            | Operands::RegIndex { a, .. }
            | Operands::RegBranch { a, .. } => smallvec::smallvec![*a as u32],
            Operands::RegReg { a, b }
            | Operands::RegRegBranch { a, b, .. }
            | Operands::RegRegLiteral { a, b, .. } => smallvec::smallvec![*a as u32, *b as u32],
            Operands::RegRegReg { a, b, c } => {
                smallvec::smallvec![*a as u32, *b as u32, *c as u32]
            }
            Operands::Invoke { args, .. } => args.iter().map(|&r| r as u32).collect(),
            Operands::InvokeRange { first, count, .. } if *count > 0 => {
                smallvec::smallvec![*first as u32 + *count as u32 - 1]
            }
            Operands::InvokeRange { .. } => SmallVec::new(),
        };
        regs.into_iter().max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_shape() {
        let err = Instruction::new(Opcode::AddInt, Operands::RegReg { a: 0, b: 1 }).unwrap_err();
        assert_eq!(
            err,
            BytecodeError::OperandShape { opcode: Opcode::AddInt, expected: Format::K23x }
        );
    }

    #[test]
    fn test_literal_ranges() {
        assert!(Instruction::new(Opcode::Const4, Operands::RegLiteral { a: 0, literal: 7 }).is_ok());
        assert!(Instruction::new(Opcode::Const4, Operands::RegLiteral { a: 0, literal: 8 }).is_err());
        assert!(Instruction::new(Opcode::Const4, Operands::RegLiteral { a: 16, literal: 0 }).is_err());
        assert!(
            Instruction::new(Opcode::AddIntLit8, Operands::RegRegLiteral { a: 0, b: 1, literal: -128 })
                .is_ok()
        );
    }

    #[test]
    fn test_max_register() {
        let add = Instruction::new(Opcode::AddInt, Operands::RegRegReg { a: 2, b: 7, c: 1 }).unwrap();
        assert_eq!(add.max_register(), Some(7));

        let range = Instruction::new(
            Opcode::InvokeStaticRange,
            Operands::InvokeRange { method_idx: 0, first: 4, count: 3 },
        )
        .unwrap();
        assert_eq!(range.max_register(), Some(6));

        let nop = Instruction::new(Opcode::Nop, Operands::None).unwrap();
        assert_eq!(nop.max_register(), None);
    }
}
