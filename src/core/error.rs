// This module defines the error types for dexlower using the thiserror crate. Two
// families are kept strictly apart. CompileError is recoverable: the graph builder
// met a bytecode construct it does not lower (exception handlers, wide or floating
// parameters, untranslated opcodes, switches, value-returning invokes, oversized
// methods) and the caller is expected to fall back to interpretation. Each variant
// of UnsupportedConstruct carries enough context (opcode, offset, descriptor) to
// explain the bail-out in logs. InvariantViolation is fatal: the instruction encoder
// reached an operation/operand combination with no legalization on the target, or
// an operand check on width, scale or register class failed. There is no From
// conversion between the two, so `?` cannot turn a compiler bug into a retryable
// bail-out; callers terminate through InvariantViolation::abort.

//! Error types for the dexlower compiler.
//!
//! Using thiserror for more idiomatic error handling.

use crate::bytecode::Opcode;
use thiserror::Error;

/// A bytecode feature the graph builder does not lower.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedConstruct {
    #[error("method has {count} try block(s)")]
    ExceptionHandlers { count: u16 },

    #[error("parameter of type '{shorty}' is not supported")]
    ParameterType { shorty: char },

    #[error("no translation for opcode {opcode} at offset {dex_pc}")]
    Opcode { opcode: Opcode, dex_pc: u32 },

    #[error("multi-way branch {opcode} at offset {dex_pc}")]
    MultiWayBranch { opcode: Opcode, dex_pc: u32 },

    #[error("invoke of method@{method_idx} returns '{descriptor}'")]
    NonVoidInvoke { method_idx: u32, descriptor: String },

    #[error("unresolved method@{method_idx}")]
    UnresolvedMethod { method_idx: u32 },

    #[error("branch at offset {dex_pc} targets invalid offset {target}")]
    InvalidBranchTarget { dex_pc: u32, target: i64 },

    #[error("execution falls off the end of the code after offset {dex_pc}")]
    FallsOffEnd { dex_pc: u32 },

    #[error("virtual register v{reg} out of range (method declares {registers})")]
    RegisterOutOfRange { reg: u32, registers: u16 },

    #[error("method too large: {what} {actual} exceeds limit {limit}")]
    MethodTooLarge {
        what: &'static str,
        actual: usize,
        limit: usize,
    },

    #[error("malformed signature '{shorty}'")]
    MalformedShorty { shorty: String },
}

impl UnsupportedConstruct {
    /// Short stable key used for bail-out statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            UnsupportedConstruct::ExceptionHandlers { .. } => "exception-handlers",
            UnsupportedConstruct::ParameterType { .. } => "parameter-type",
            UnsupportedConstruct::Opcode { .. } => "opcode",
            UnsupportedConstruct::MultiWayBranch { .. } => "multi-way-branch",
            UnsupportedConstruct::NonVoidInvoke { .. } => "non-void-invoke",
            UnsupportedConstruct::UnresolvedMethod { .. } => "unresolved-method",
            UnsupportedConstruct::InvalidBranchTarget { .. } => "invalid-branch-target",
            UnsupportedConstruct::FallsOffEnd { .. } => "falls-off-end",
            UnsupportedConstruct::RegisterOutOfRange { .. } => "register-out-of-range",
            UnsupportedConstruct::MethodTooLarge { .. } => "method-too-large",
            UnsupportedConstruct::MalformedShorty { .. } => "malformed-shorty",
        }
    }
}

/// Main error type for method compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("cannot compile {method}: {construct}")]
    Unsupported {
        method: String,
        construct: UnsupportedConstruct,
    },
}

impl CompileError {
    /// The construct that caused the bail-out.
    pub fn construct(&self) -> &UnsupportedConstruct {
        match self {
            CompileError::Unsupported { construct, .. } => construct,
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// A broken invariant inside the instruction encoder.
///
/// These signal a legalization bug in an earlier stage and are never
/// user-triggerable. They do not convert into [`CompileError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("no legalization for {operation} on arm64")]
    NoLegalization { operation: &'static str },

    #[error("{operation}: operand widths differ")]
    WidthMismatch { operation: &'static str },

    #[error("{operation}: scale {actual} does not match expected scale {expected}")]
    ScaleMismatch {
        operation: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("{operation}: register {reg} has the wrong class")]
    RegisterClass { operation: &'static str, reg: String },

    #[error("{operation}: operand size {size} is not valid here")]
    BadOperandSize { operation: &'static str, size: &'static str },

    #[error("{operation}: immediate {value} does not fit the operand")]
    ImmediateOutOfRange { operation: &'static str, value: i64 },

    #[error("no scratch register available")]
    ScratchExhausted,

    #[error("scratch register {reg} freed twice")]
    ScratchDoubleFree { reg: String },
}

impl InvariantViolation {
    /// Log the violation and terminate the compiling worker.
    pub fn abort(self) -> ! {
        log::error!("internal compiler error: {self}");
        panic!("internal compiler error: {self}");
    }
}

/// Result type alias for encoder operations.
pub type EncodeResult<T> = Result<T, InvariantViolation>;
