// This module serves as the central hub for dexlower's shared infrastructure: the
// per-method compilation session (arena ownership, interning and statistics), the
// error families (recoverable bail-outs versus fatal encoder invariant violations),
// compiler options, and the arena-backed bit vectors used by liveness analysis. None
// of these depend on the graph, liveness or encoder passes, so every pass can build
// on them without cycles.

//! Core dexlower infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Compilation statistics and bail-out tracking
//!
//! ## Errors (`error`)
//! - [`CompileError`]: recoverable, the caller falls back to interpretation
//! - [`InvariantViolation`]: fatal, signals a bug in an earlier stage
//!
//! ## Bit vectors (`bit_vector`)
//! - Fixed-size sets for live-in, live-out and kill

pub mod bit_vector;
pub mod error;
pub mod options;
pub mod session;
pub mod test_utils;

pub use bit_vector::BitVector;
pub use error::{
    CompileError, CompileResult, EncodeResult, InvariantViolation, UnsupportedConstruct,
};
pub use options::CompilerOptions;
pub use session::{CompilationSession, SessionStats};
