// This module ties the passes together for one method at a time. MethodCompiler owns
// the compiler options and borrows the compilation session; compile runs the graph
// builder and, when the method is supported, SSA liveness analysis, and records the
// outcome in the session statistics either way. A bail-out is logged at warn level
// with its reason and returned as CompileError so the caller can fall back to
// interpretation. Liveness results borrow the graph they describe, so callers that
// want to inspect them use compile_with, which hands both to a closure before the
// graph is moved into the returned summary.

//! Per-method compilation pipeline.

use crate::bytecode::{CodeItem, CompilationUnit, MethodResolver};
use crate::core::{CompilationSession, CompileError, CompileResult, CompilerOptions};
use crate::graph::{Graph, GraphBuilder};
use crate::liveness::SsaLivenessAnalysis;
use log::{info, warn};

/// Result of a successful compilation.
#[derive(Debug)]
pub struct CompiledMethod<T = ()> {
    pub name: String,
    pub graph: Graph,
    pub code_units: u32,
    pub ssa_values: usize,
    pub live_intervals: usize,
    /// Whatever the inspection closure returned.
    pub extra: T,
}

pub struct MethodCompiler<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    options: CompilerOptions,
}

impl<'s, 'arena> MethodCompiler<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>, options: CompilerOptions) -> Self {
        Self { session, options }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn session(&self) -> &'s CompilationSession<'arena> {
        self.session
    }

    /// Build the graph only, recording a bail-out on failure.
    pub fn build_graph<R: MethodResolver + ?Sized>(
        &self,
        unit: &CompilationUnit,
        code: &CodeItem,
        resolver: &R,
    ) -> CompileResult<Graph> {
        self.session.set_current_method(&unit.name);
        match GraphBuilder::new(unit, resolver, &self.options).build(code) {
            Ok(graph) => {
                self.session
                    .record_graph(graph.num_blocks(), graph.num_instructions());
                Ok(graph)
            }
            Err(construct) => {
                warn!("not compiling {}: {}", unit.name, construct);
                self.session.record_bailout(construct.kind());
                Err(CompileError::Unsupported {
                    method: unit.name.clone(),
                    construct,
                })
            }
        }
    }

    /// Run liveness analysis on a built graph.
    pub fn analyze<'g>(&self, graph: &'g Graph) -> SsaLivenessAnalysis<'g, 'arena> {
        let analysis = SsaLivenessAnalysis::analyze(graph, self.session);
        if self.options.verify_liveness {
            assert!(analysis.verify(), "live ranges out of order after analysis");
        }
        self.session
            .record_liveness(analysis.number_of_ssa_values(), analysis.intervals().len());
        analysis
    }

    pub fn compile<R: MethodResolver + ?Sized>(
        &self,
        unit: &CompilationUnit,
        code: &CodeItem,
        resolver: &R,
    ) -> CompileResult<CompiledMethod> {
        self.compile_with(unit, code, resolver, |_, _| ())
    }

    /// Compile, then pass the graph and its liveness to `inspect`.
    pub fn compile_with<R, T, F>(
        &self,
        unit: &CompilationUnit,
        code: &CodeItem,
        resolver: &R,
        inspect: F,
    ) -> CompileResult<CompiledMethod<T>>
    where
        R: MethodResolver + ?Sized,
        F: FnOnce(&Graph, &SsaLivenessAnalysis<'_, 'arena>) -> T,
    {
        let graph = self.build_graph(unit, code, resolver)?;

        let (ssa_values, live_intervals, extra) = {
            let analysis = self.analyze(&graph);
            let extra = inspect(&graph, &analysis);
            (
                analysis.number_of_ssa_values(),
                analysis.intervals().len(),
                extra,
            )
        };

        let code_units = code.size_in_code_units();
        self.session
            .record_method_compiled(&unit.name, code_units as usize);
        info!(
            "compiled {}: {} code units, {} blocks, {} ssa values",
            unit.name,
            code_units,
            graph.num_blocks(),
            ssa_values
        );

        Ok(CompiledMethod {
            name: unit.name.clone(),
            graph,
            code_units,
            ssa_values,
            live_intervals,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::parse_method;
    use crate::core::test_utils::test::TestContext;
    use crate::core::UnsupportedConstruct;

    #[test]
    fn test_compile_records_statistics() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let compiler = MethodCompiler::new(&session, CompilerOptions::default());

        let parsed = parse_method(
            ".method LFoo;->sum()I\n\
             .shorty I\n\
             const/4 v0, #2\n\
             const/4 v1, #3\n\
             add-int v2, v0, v1\n\
             return v2\n",
        )
        .unwrap();
        let compiled = compiler
            .compile(&parsed.unit, &parsed.code, &parsed.methods)
            .unwrap();
        assert_eq!(compiled.name, "LFoo;->sum()I");
        assert!(compiled.ssa_values > 0);
        assert_eq!(compiled.ssa_values, compiled.live_intervals);

        let stats = session.stats();
        assert_eq!(stats.methods_compiled, 1);
        assert_eq!(stats.blocks_built, compiled.graph.num_blocks());
        assert_eq!(stats.ssa_values, compiled.ssa_values);
        assert_eq!(session.current_method(), Some("LFoo;->sum()I"));
    }

    #[test]
    fn test_bailout_is_recorded() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let compiler = MethodCompiler::new(&session, CompilerOptions::default());

        let parsed = parse_method(
            ".method LFoo;->bad()V\n\
             .tries 1\n\
             return-void\n",
        )
        .unwrap();
        let err = compiler
            .compile(&parsed.unit, &parsed.code, &parsed.methods)
            .unwrap_err();
        assert_eq!(
            err.construct(),
            &UnsupportedConstruct::ExceptionHandlers { count: 1 }
        );
        let stats = session.stats();
        assert_eq!(stats.methods_bailed_out, 1);
        assert_eq!(stats.bailouts["exception-handlers"], 1);
        assert_eq!(stats.methods_compiled, 0);
    }

    #[test]
    fn test_compile_with_inspects_liveness() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let compiler = MethodCompiler::new(&session, CompilerOptions::default());

        let parsed = parse_method(
            ".method LFoo;->id(I)I\n\
             .shorty II\n\
             .registers 1\n\
             return v0\n",
        )
        .unwrap();
        let compiled = compiler
            .compile_with(&parsed.unit, &parsed.code, &parsed.methods, |graph, liveness| {
                liveness.linear_order().len() == graph.num_blocks()
            })
            .unwrap();
        assert!(compiled.extra);
    }
}
