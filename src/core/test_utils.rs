//! Helpers shared by the unit tests.
//!
//! A test owns one arena through [`test::TestContext`], the way a worker
//! owns one arena per method compilation, and assembles its methods from
//! the textual bytecode format.

#[cfg(test)]
pub mod test {
    use super::super::options::CompilerOptions;
    use super::super::session::CompilationSession;
    use crate::bytecode::parse_method;
    use crate::graph::{BlockRef, Graph, GraphBuilder};
    use bumpalo::Bump;

    /// Owns the arena a test's sessions allocate from.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        /// The session borrows the context, which must outlive it.
        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }

        pub fn with_session<F, R>(&self, f: F) -> R
        where
            F: FnOnce(&CompilationSession<'_>) -> R,
        {
            let session = self.create_session();
            f(&session)
        }

        /// Bytes handed out by the arena so far.
        pub fn arena_bytes(&self) -> usize {
            self.arena.allocated_bytes()
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Assemble `text` and build its graph with default options.
    ///
    /// Panics if the listing does not assemble or the builder bails out.
    pub fn build_graph(text: &str) -> Graph {
        let parsed = match parse_method(text) {
            Ok(parsed) => parsed,
            Err(e) => panic!("listing does not assemble: {e}"),
        };
        let options = CompilerOptions::default();
        match GraphBuilder::new(&parsed.unit, &parsed.methods, &options).build(&parsed.code) {
            Ok(graph) => graph,
            Err(construct) => panic!("graph builder bailed out: {construct}"),
        }
    }

    /// Kind names of the instructions in `block`, in order.
    pub fn block_kinds(graph: &Graph, block: BlockRef) -> Vec<&'static str> {
        graph
            .block(block)
            .instructions()
            .iter()
            .map(|&inst| graph.instruction(inst).kind().name())
            .collect()
    }
}
