//! dexlower - method compiler middle and back end.
//!
//! dexlower lowers register-based managed bytecode into a control-flow graph,
//! computes SSA liveness for a linear-scan register allocator, and selects
//! AArch64 instructions with exact immediate and addressing-mode encodings.
//!
//! # Primary Usage
//!
//! ```ignore
//! use dexlower::bytecode::parse_method;
//! use dexlower::core::{CompilationSession, CompilerOptions};
//! use dexlower::driver::MethodCompiler;
//! use bumpalo::Bump;
//!
//! let parsed = parse_method(listing)?;
//!
//! // One arena per method compilation
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let compiler = MethodCompiler::new(&session, CompilerOptions::default());
//! let compiled = compiler.compile(&parsed.unit, &parsed.code, &parsed.methods)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Shared infrastructure (session, errors, options, bit vectors)
//! - [`bytecode`] - Opcodes, code items, method resolution, text assembler
//! - [`graph`] - Control-flow graph and the bytecode graph builder
//! - [`liveness`] - Linear order, live intervals, SSA liveness analysis
//! - [`arm64`] - AArch64 instruction selection and immediate encodings
//! - [`driver`] - Per-method pipeline with statistics

pub mod arm64;
pub mod bytecode;
pub mod core;
pub mod driver;
pub mod graph;
pub mod liveness;

pub use crate::core::{
    CompilationSession, CompileError, CompileResult, CompilerOptions, EncodeResult,
    InvariantViolation, SessionStats, UnsupportedConstruct,
};
pub use driver::{CompiledMethod, MethodCompiler};
