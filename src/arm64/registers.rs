// This module models the AArch64 register file as the encoder sees it. A Reg is a
// small copyable value naming a register class (core or floating point), an access
// width (32 or 64 bits, which for the FP class means single or double precision)
// and a hardware number. Register number 31 of the core class is context dependent
// in the architecture, so the zero register and the stack pointer get distinct
// constants here and are only folded onto 31 when an instruction is finally
// encoded. ScratchPool tracks the few core registers the encoder may clobber while
// legalizing an operation (materializing an out-of-range displacement or an ALU
// immediate). Allocation and release are checked: running out of scratch registers
// or releasing one twice is an invariant violation, not a recoverable condition.

//! AArch64 registers and the encoder's scratch pool.

use crate::core::{EncodeResult, InvariantViolation};
use smallvec::SmallVec;
use std::fmt;

/// Register file a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Core,
    Fp,
}

/// A physical register at a given access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    class: RegClass,
    wide: bool,
    num: u8,
}

const ZR_NUM: u8 = 31;
const SP_NUM: u8 = 32;

impl Reg {
    pub const WZR: Reg = Reg::raw(RegClass::Core, false, ZR_NUM);
    pub const XZR: Reg = Reg::raw(RegClass::Core, true, ZR_NUM);
    pub const WSP: Reg = Reg::raw(RegClass::Core, false, SP_NUM);
    pub const SP: Reg = Reg::raw(RegClass::Core, true, SP_NUM);
    /// Link register.
    pub const LR: Reg = Reg::raw(RegClass::Core, true, 30);

    const fn raw(class: RegClass, wide: bool, num: u8) -> Self {
        Self { class, wide, num }
    }

    /// 32-bit core register `w{num}`.
    pub const fn w(num: u8) -> Self {
        assert!(num < 31, "core register number out of range");
        Self::raw(RegClass::Core, false, num)
    }

    /// 64-bit core register `x{num}`.
    pub const fn x(num: u8) -> Self {
        assert!(num < 31, "core register number out of range");
        Self::raw(RegClass::Core, true, num)
    }

    /// Single-precision register `s{num}`.
    pub const fn s(num: u8) -> Self {
        assert!(num < 32, "fp register number out of range");
        Self::raw(RegClass::Fp, false, num)
    }

    /// Double-precision register `d{num}`.
    pub const fn d(num: u8) -> Self {
        assert!(num < 32, "fp register number out of range");
        Self::raw(RegClass::Fp, true, num)
    }

    pub fn class(self) -> RegClass {
        self.class
    }

    pub fn is_float(self) -> bool {
        self.class == RegClass::Fp
    }

    pub fn is_64bit(self) -> bool {
        self.wide
    }

    pub fn is_single(self) -> bool {
        self.is_float() && !self.wide
    }

    pub fn is_double(self) -> bool {
        self.is_float() && self.wide
    }

    pub fn is_zero_register(self) -> bool {
        self.class == RegClass::Core && self.num == ZR_NUM
    }

    pub fn is_stack_pointer(self) -> bool {
        self.class == RegClass::Core && self.num == SP_NUM
    }

    /// Number as written into an instruction field.
    pub fn hw_num(self) -> u8 {
        if self.num == SP_NUM {
            ZR_NUM
        } else {
            self.num
        }
    }

    /// Same register, 64-bit view.
    pub fn as_64bit(self) -> Self {
        Self { wide: true, ..self }
    }

    /// Same register, 32-bit view.
    pub fn as_32bit(self) -> Self {
        Self { wide: false, ..self }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.class, self.wide, self.num) {
            (RegClass::Core, false, ZR_NUM) => f.write_str("wzr"),
            (RegClass::Core, true, ZR_NUM) => f.write_str("xzr"),
            (RegClass::Core, false, SP_NUM) => f.write_str("wsp"),
            (RegClass::Core, true, SP_NUM) => f.write_str("sp"),
            (RegClass::Core, false, n) => write!(f, "w{n}"),
            (RegClass::Core, true, n) => write!(f, "x{n}"),
            (RegClass::Fp, false, n) => write!(f, "s{n}"),
            (RegClass::Fp, true, n) => write!(f, "d{n}"),
        }
    }
}

/// Core registers the encoder may clobber during legalization.
#[derive(Debug, Clone)]
pub struct ScratchPool {
    regs: SmallVec<[u8; 4]>,
    /// Bit `n` set when register `n` is free.
    free: u32,
}

impl ScratchPool {
    /// The intra-procedure-call registers x16 and x17.
    pub const DEFAULT_REGS: [u8; 2] = [16, 17];

    pub fn new(regs: &[u8]) -> Self {
        let mut free = 0u32;
        for &num in regs {
            assert!(num < 31, "scratch register must be a core register");
            free |= 1 << num;
        }
        Self {
            regs: regs.iter().copied().collect(),
            free,
        }
    }

    /// Take a free scratch register, 32-bit view.
    pub fn alloc_temp(&mut self) -> EncodeResult<Reg> {
        let num = self
            .regs
            .iter()
            .copied()
            .find(|&num| self.free & (1 << num) != 0)
            .ok_or(InvariantViolation::ScratchExhausted)?;
        self.free &= !(1 << num);
        Ok(Reg::w(num))
    }

    /// Take a free scratch register, 64-bit view.
    pub fn alloc_temp_wide(&mut self) -> EncodeResult<Reg> {
        self.alloc_temp().map(Reg::as_64bit)
    }

    /// Return a scratch register to the pool; either width view is accepted.
    pub fn free_temp(&mut self, reg: Reg) -> EncodeResult<()> {
        if !self.owns(reg) {
            return Err(InvariantViolation::RegisterClass {
                operation: "free_temp",
                reg: reg.to_string(),
            });
        }
        let bit = 1 << reg.num;
        if self.free & bit != 0 {
            return Err(InvariantViolation::ScratchDoubleFree {
                reg: reg.to_string(),
            });
        }
        self.free |= bit;
        Ok(())
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        self.owns(reg) && self.free & (1 << reg.num) != 0
    }

    pub fn owns(&self, reg: Reg) -> bool {
        reg.class == RegClass::Core && self.regs.contains(&reg.num)
    }

    /// Number of registers currently available.
    pub fn available(&self) -> usize {
        self.free.count_ones() as usize
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(&Self::DEFAULT_REGS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names() {
        assert_eq!(Reg::w(3).to_string(), "w3");
        assert_eq!(Reg::x(3).to_string(), "x3");
        assert_eq!(Reg::s(0).to_string(), "s0");
        assert_eq!(Reg::d(31).to_string(), "d31");
        assert_eq!(Reg::WZR.to_string(), "wzr");
        assert_eq!(Reg::SP.to_string(), "sp");
        assert_eq!(Reg::SP.hw_num(), 31);
        assert_eq!(Reg::x(5).as_32bit(), Reg::w(5));
    }

    #[test]
    fn test_register_predicates() {
        assert!(Reg::d(1).is_double());
        assert!(Reg::s(1).is_single());
        assert!(!Reg::x(1).is_float());
        assert!(Reg::XZR.is_zero_register());
        assert!(!Reg::SP.is_zero_register());
        assert!(Reg::WSP.is_stack_pointer());
    }

    #[test]
    fn test_scratch_alloc_and_free() {
        let mut pool = ScratchPool::default();
        assert_eq!(pool.available(), 2);

        let first = pool.alloc_temp().unwrap();
        assert_eq!(first, Reg::w(16));
        let second = pool.alloc_temp_wide().unwrap();
        assert_eq!(second, Reg::x(17));
        assert_eq!(pool.alloc_temp(), Err(InvariantViolation::ScratchExhausted));

        pool.free_temp(first).unwrap();
        assert!(pool.is_free(Reg::x(16)));
        assert_eq!(pool.alloc_temp().unwrap(), Reg::w(16));
    }

    #[test]
    fn test_scratch_double_free() {
        let mut pool = ScratchPool::new(&[9]);
        let reg = pool.alloc_temp().unwrap();
        pool.free_temp(reg).unwrap();
        assert!(matches!(
            pool.free_temp(reg),
            Err(InvariantViolation::ScratchDoubleFree { .. })
        ));
        assert!(matches!(
            pool.free_temp(Reg::w(3)),
            Err(InvariantViolation::RegisterClass { .. })
        ));
    }
}
