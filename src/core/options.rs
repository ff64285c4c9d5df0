//! Compiler configuration.
//!
//! Limits are checked by the graph builder before any node is created, so
//! an oversized method bails out as cheaply as one with try blocks.

/// Knobs for one [`MethodCompiler`](crate::driver::MethodCompiler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Largest method body accepted, in 16-bit code units.
    pub max_code_units: u32,
    /// Largest number of basic blocks (including entry and exit).
    pub max_blocks: usize,
    /// Re-check range ordering of every interval after liveness analysis.
    pub verify_liveness: bool,
}

impl CompilerOptions {
    pub const DEFAULT_MAX_CODE_UNITS: u32 = u16::MAX as u32;
    pub const DEFAULT_MAX_BLOCKS: usize = 4096;
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            max_code_units: Self::DEFAULT_MAX_CODE_UNITS,
            max_blocks: Self::DEFAULT_MAX_BLOCKS,
            verify_liveness: cfg!(debug_assertions),
        }
    }
}
