// This module provides arena-based compilation session management using the bumpalo
// crate. CompilationSession is the per-method hub that owns the arena reference and
// tracks compilation statistics with a unified lifetime. Liveness bit vectors are
// allocated in the arena and method names are interned there, so everything a single
// method compilation produces is released in bulk when the Bump is dropped. Graph
// nodes, live ranges and intervals are index-addressed stores owned by their passes,
// which keeps handles plain integers while the session stays the single owner of
// raw arena memory. SessionStats tracks methods compiled, bail-outs per reason, and
// the sizes of the graphs and liveness results produced, and renders a summary via
// Display for the developer CLI.

//! Arena-based compilation session management.
//!
//! All arena allocations of a compilation are tied to the session lifetime,
//! eliminating complex lifetime propagation.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// String interning for method names.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Method currently being compiled.
    current_method: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            current_method: RefCell::new(None),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Set the method being compiled.
    pub fn set_current_method(&self, name: &str) {
        let interned = self.intern_str(name);
        *self.current_method.borrow_mut() = Some(interned);
    }

    pub fn current_method(&self) -> Option<&'arena str> {
        *self.current_method.borrow()
    }

    /// Record a method that went all the way through liveness.
    pub fn record_method_compiled(&self, name: &str, code_units: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.methods_compiled += 1;
        stats.total_code_units += code_units;

        if stats.largest_method_code_units < code_units {
            stats.largest_method_code_units = code_units;
            stats.largest_method_name = name.to_string();
        }
    }

    /// Record a bail-out, keyed by construct kind.
    pub fn record_bailout(&self, kind: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.methods_bailed_out += 1;
        *stats.bailouts.entry(kind).or_insert(0) += 1;
    }

    /// Record the size of a built graph.
    pub fn record_graph(&self, blocks: usize, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.blocks_built += blocks;
        stats.instructions_built += instructions;
    }

    /// Record the size of a liveness result.
    pub fn record_liveness(&self, ssa_values: usize, intervals: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.ssa_values += ssa_values;
        stats.live_intervals += intervals;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Methods that produced a graph and liveness.
    pub methods_compiled: usize,

    /// Methods rejected as unsupported.
    pub methods_bailed_out: usize,

    /// Bail-outs per construct kind.
    pub bailouts: HashMap<&'static str, usize>,

    /// Code units of all compiled methods.
    pub total_code_units: usize,

    /// Largest method compiled (for analysis).
    pub largest_method_code_units: usize,

    /// Name of largest method.
    pub largest_method_name: String,

    /// Blocks in built graphs, entry and exit included.
    pub blocks_built: usize,

    /// Graph instructions created.
    pub instructions_built: usize,

    /// Values that received an SSA index.
    pub ssa_values: usize,

    /// Live intervals created by liveness analysis.
    pub live_intervals: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Methods compiled: {}", self.methods_compiled)?;
        writeln!(f, "  Methods bailed out: {}", self.methods_bailed_out)?;
        writeln!(f, "  Total code units: {}", self.total_code_units)?;
        writeln!(f, "  Blocks built: {}", self.blocks_built)?;
        writeln!(f, "  Instructions built: {}", self.instructions_built)?;
        writeln!(f, "  SSA values: {}", self.ssa_values)?;
        writeln!(f, "  Live intervals: {}", self.live_intervals)?;

        if !self.largest_method_name.is_empty() {
            writeln!(
                f,
                "  Largest method: {} ({} code units)",
                self.largest_method_name, self.largest_method_code_units
            )?;
        }

        if !self.bailouts.is_empty() {
            writeln!(f, "  Bail-out breakdown:")?;
            let mut sorted: Vec<_> = self.bailouts.iter().collect();
            sorted.sort_by_key(|(kind, count)| (std::cmp::Reverse(**count), **kind));

            for (kind, count) in sorted {
                writeln!(f, "    {}: {}", kind, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.methods_compiled, 0);
        assert_eq!(stats.methods_bailed_out, 0);
        assert!(session.current_method().is_none());
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("LFoo;->bar()V");
        let s2 = session.intern_str("LFoo;->bar()V");
        let s3 = session.intern_str("LFoo;->baz()V");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_method_compiled("small", 4);
        session.record_method_compiled("big", 40);
        session.record_bailout("opcode");
        session.record_bailout("opcode");
        session.record_bailout("exception-handlers");
        session.record_graph(3, 12);
        session.record_liveness(5, 5);

        let stats = session.stats();
        assert_eq!(stats.methods_compiled, 2);
        assert_eq!(stats.methods_bailed_out, 3);
        assert_eq!(stats.bailouts["opcode"], 2);
        assert_eq!(stats.total_code_units, 44);
        assert_eq!(stats.largest_method_name, "big");
        assert_eq!(stats.instructions_built, 12);
        assert_eq!(stats.live_intervals, 5);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_method_compiled("factorial", 18);
        session.record_bailout("multi-way-branch");

        let output = format!("{}", session.stats());
        assert!(output.contains("Methods compiled: 1"));
        assert!(output.contains("factorial (18 code units)"));
        assert!(output.contains("multi-way-branch: 1"));
    }
}
