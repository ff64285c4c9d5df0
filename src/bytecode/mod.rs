// This module models the bytecode-side collaborators the compiler consumes: opcode
// metadata, decoded instructions, the code item of one method (register counts, try
// count and a random-access instruction stream addressed by code-unit offset), the
// compilation unit describing the method's signature, and the resolver that maps
// method indices to return-type descriptors. A textual assembler builds all of these
// from a compact listing so tests and the developer CLI can feed methods without a
// container-file reader.

//! Bytecode input model.

pub mod instruction;
pub mod opcode;
pub mod parser;

pub use instruction::{BytecodeError, Instruction, Operands, VReg};
pub use opcode::{Format, Opcode, OpcodeInfo};
pub use parser::{parse_method, ParseError, ParsedMethod};

use hashbrown::HashMap;
use std::fmt;

/// Value types carried by graph instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Void,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl PrimitiveType {
    /// Map a shorty/descriptor character to its type.
    pub fn from_descriptor(c: char) -> Option<Self> {
        Some(match c {
            'V' => PrimitiveType::Void,
            'Z' => PrimitiveType::Boolean,
            'B' => PrimitiveType::Byte,
            'C' => PrimitiveType::Char,
            'S' => PrimitiveType::Short,
            'I' => PrimitiveType::Int,
            'J' => PrimitiveType::Long,
            'F' => PrimitiveType::Float,
            'D' => PrimitiveType::Double,
            'L' | '[' => PrimitiveType::Reference,
            _ => return None,
        })
    }

    pub fn is_wide(self) -> bool {
        matches!(self, PrimitiveType::Long | PrimitiveType::Double)
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, PrimitiveType::Float | PrimitiveType::Double)
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveType::Void => "void",
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Byte => "byte",
            PrimitiveType::Char => "char",
            PrimitiveType::Short => "short",
            PrimitiveType::Int => "int",
            PrimitiveType::Long => "long",
            PrimitiveType::Float => "float",
            PrimitiveType::Double => "double",
            PrimitiveType::Reference => "reference",
        };
        f.write_str(name)
    }
}

/// Method body: register file layout plus the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub tries_size: u16,
    insns: Vec<Instruction>,
    /// Code-unit offset of each instruction in `insns`.
    offsets: Vec<u32>,
    size_in_code_units: u32,
}

impl CodeItem {
    pub fn new(
        registers_size: u16,
        ins_size: u16,
        outs_size: u16,
        tries_size: u16,
        insns: Vec<Instruction>,
    ) -> Self {
        let mut offsets = Vec::with_capacity(insns.len());
        let mut offset = 0u32;
        for insn in &insns {
            offsets.push(offset);
            offset += insn.size_in_code_units();
        }
        Self {
            registers_size,
            ins_size,
            outs_size,
            tries_size,
            insns,
            offsets,
            size_in_code_units: offset,
        }
    }

    /// Instructions with their code-unit offsets, in address order.
    pub fn instructions(&self) -> impl Iterator<Item = (u32, &Instruction)> + '_ {
        self.offsets.iter().copied().zip(self.insns.iter())
    }

    pub fn instruction_at(&self, dex_pc: u32) -> Option<&Instruction> {
        self.offsets
            .binary_search(&dex_pc)
            .ok()
            .map(|index| &self.insns[index])
    }

    pub fn is_instruction_boundary(&self, dex_pc: u32) -> bool {
        self.offsets.binary_search(&dex_pc).is_ok()
    }

    pub fn size_in_code_units(&self) -> u32 {
        self.size_in_code_units
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

/// The method being compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationUnit {
    /// Fully qualified name used in diagnostics.
    pub name: String,
    /// Return type followed by parameter types, one character each.
    pub shorty: String,
    pub is_static: bool,
}

impl CompilationUnit {
    pub fn new(name: impl Into<String>, shorty: impl Into<String>, is_static: bool) -> Self {
        Self {
            name: name.into(),
            shorty: shorty.into(),
            is_static,
        }
    }
}

/// Resolves method references to their signatures.
pub trait MethodResolver {
    /// Return-type descriptor of the referenced method, `None` if unresolved.
    fn return_descriptor(&self, method_idx: u32) -> Option<&str>;
}

/// In-memory method table keyed by method index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodTable {
    descriptors: HashMap<u32, String>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method_idx: u32, return_descriptor: impl Into<String>) {
        self.descriptors.insert(method_idx, return_descriptor.into());
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl MethodResolver for MethodTable {
    fn return_descriptor(&self, method_idx: u32) -> Option<&str> {
        self.descriptors.get(&method_idx).map(String::as_str)
    }
}
