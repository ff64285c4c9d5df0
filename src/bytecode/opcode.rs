//! Opcode metadata for the subset of the register bytecode the compiler sees.
//!
//! The table is a `const fn` match, so it is immutable and needs no
//! initialisation or synchronisation across worker threads.

use std::fmt;

/// Instruction formats, named after their layout (`kAB`: A code units,
/// B register/operand shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// `op`
    K10x,
    /// `op vAA`
    K11x,
    /// `op vA, vB`
    K12x,
    /// `op vA, #+B` (4-bit literal)
    K11n,
    /// `op vAA, #+BBBB` (16-bit literal)
    K21s,
    /// `op vAA, #+BBBBBBBB` (32-bit literal)
    K31i,
    /// `op vAA, kind@BBBB`
    K21c,
    /// `op +AA`
    K10t,
    /// `op +AAAA`
    K20t,
    /// `op +AAAAAAAA`
    K30t,
    /// `op vAA, +BBBBBBBB` (switch payload)
    K31t,
    /// `op vA, vB, +CCCC`
    K22t,
    /// `op vAA, vBB, vCC`
    K23x,
    /// `op vA, vB, #+CCCC`
    K22s,
    /// `op vAA, vBB, #+CC`
    K22b,
    /// `op {vC, vD, vE, vF, vG}, meth@BBBB`
    K35c,
    /// `op {vCCCC .. vNNNN}, meth@BBBB`
    K3rc,
}

impl Format {
    /// Size of an instruction of this format, in 16-bit code units.
    pub const fn size_in_code_units(self) -> u32 {
        match self {
            Format::K10x | Format::K11x | Format::K12x | Format::K11n | Format::K10t => 1,
            Format::K21s
            | Format::K21c
            | Format::K20t
            | Format::K22t
            | Format::K23x
            | Format::K22s
            | Format::K22b => 2,
            Format::K31i | Format::K30t | Format::K31t | Format::K35c | Format::K3rc => 3,
        }
    }
}

/// Static description of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub name: &'static str,
    pub format: Format,
    /// Transfers control to a relative offset.
    pub is_branch: bool,
    /// Multi-way branch through a payload table.
    pub is_switch: bool,
    /// Control never falls through to the next instruction.
    pub is_terminal: bool,
}

macro_rules! opcodes {
    ($($variant:ident => $name:literal, $format:ident, $branch:literal, $switch:literal, $terminal:literal;)*) => {
        /// Bytecode opcodes understood by the decoder.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            /// Every opcode, in table order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub const fn info(self) -> OpcodeInfo {
                match self {
                    $(Opcode::$variant => OpcodeInfo {
                        name: $name,
                        format: Format::$format,
                        is_branch: $branch,
                        is_switch: $switch,
                        is_terminal: $terminal,
                    },)*
                }
            }
        }
    };
}

opcodes! {
    Nop => "nop", K10x, false, false, false;
    Move => "move", K12x, false, false, false;
    ReturnVoid => "return-void", K10x, false, false, true;
    Return => "return", K11x, false, false, true;
    ReturnObject => "return-object", K11x, false, false, true;
    Const4 => "const/4", K11n, false, false, false;
    Const16 => "const/16", K21s, false, false, false;
    Const => "const", K31i, false, false, false;
    NewInstance => "new-instance", K21c, false, false, false;
    Throw => "throw", K11x, false, false, true;
    Goto => "goto", K10t, true, false, true;
    Goto16 => "goto/16", K20t, true, false, true;
    Goto32 => "goto/32", K30t, true, false, true;
    PackedSwitch => "packed-switch", K31t, false, true, false;
    SparseSwitch => "sparse-switch", K31t, false, true, false;
    IfEq => "if-eq", K22t, true, false, false;
    IfNe => "if-ne", K22t, true, false, false;
    IfLt => "if-lt", K22t, true, false, false;
    InvokeVirtual => "invoke-virtual", K35c, false, false, false;
    InvokeDirect => "invoke-direct", K35c, false, false, false;
    InvokeStatic => "invoke-static", K35c, false, false, false;
    InvokeDirectRange => "invoke-direct/range", K3rc, false, false, false;
    InvokeStaticRange => "invoke-static/range", K3rc, false, false, false;
    AddInt => "add-int", K23x, false, false, false;
    SubInt => "sub-int", K23x, false, false, false;
    MulInt => "mul-int", K23x, false, false, false;
    AddInt2Addr => "add-int/2addr", K12x, false, false, false;
    SubInt2Addr => "sub-int/2addr", K12x, false, false, false;
    AddIntLit16 => "add-int/lit16", K22s, false, false, false;
    RsubInt => "rsub-int", K22s, false, false, false;
    AddIntLit8 => "add-int/lit8", K22b, false, false, false;
    RsubIntLit8 => "rsub-int/lit8", K22b, false, false, false;
}

impl Opcode {
    pub const fn name(self) -> &'static str {
        self.info().name
    }

    pub const fn format(self) -> Format {
        self.info().format
    }

    pub const fn is_branch(self) -> bool {
        self.info().is_branch
    }

    pub const fn is_switch(self) -> bool {
        self.info().is_switch
    }

    /// Look an opcode up by its assembler mnemonic.
    pub fn from_name(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.name() == name)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
