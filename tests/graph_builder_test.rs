//! Test translation of bytecode methods into control-flow graphs.
//!
//! Methods are written in the textual assembler format and run through the
//! graph builder; the tests check block structure, successor order and the
//! constructs that make the builder bail out.

use dexlower::bytecode::{parse_method, MethodTable, Opcode, ParsedMethod};
use dexlower::core::{CompilerOptions, UnsupportedConstruct};
use dexlower::graph::{BlockRef, Graph, GraphBuilder, InstKind};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn parse(text: &str) -> ParsedMethod {
    parse_method(text).expect("listing should assemble")
}

fn build_with(parsed: &ParsedMethod, options: &CompilerOptions) -> Result<Graph, UnsupportedConstruct> {
    GraphBuilder::new(&parsed.unit, &parsed.methods, options).build(&parsed.code)
}

fn build(text: &str) -> Result<Graph, UnsupportedConstruct> {
    init_logging();
    build_with(&parse(text), &CompilerOptions::default())
}

fn kinds(graph: &Graph, block: BlockRef) -> Vec<&'static str> {
    graph
        .block(block)
        .instructions()
        .iter()
        .map(|&i| graph.instruction(i).kind().name())
        .collect()
}

#[test]
fn test_diamond_joins_at_return() {
    let graph = build(
        r#"
        .shorty I
        .registers 2
            const/4 v0, #0
            if-eq v0, v1, :other
            const/4 v0, #1
            goto :join
        other:
            const/4 v0, #2
        join:
            return v0
        "#,
    )
    .unwrap();

    // entry, head, two arms, join, exit
    assert_eq!(graph.num_blocks(), 6);
    let head = graph.block_by_id(1).unwrap();
    assert_eq!(
        kinds(&graph, head),
        vec!["store-local", "load-local", "load-local", "equal", "if"]
    );
    let succs = graph.block(head).successors();
    assert_eq!(succs.len(), 2);

    let join = graph
        .blocks()
        .iter()
        .copied()
        .find(|&b| kinds(&graph, b).last() == Some(&"return"))
        .unwrap();
    assert_eq!(graph.block(join).predecessors().len(), 2);
    assert_eq!(graph.block(join).successors(), &[graph.exit_block()]);
    for &arm in succs {
        assert!(graph.block(arm).successors().contains(&join));
    }
}

#[test]
fn test_exit_block_has_highest_id() {
    let graph = build(
        r#"
            if-eq v0, v0, :done
            return-void
        done:
            return-void
        "#,
    )
    .unwrap();
    let exit = graph.exit_block();
    assert_eq!(graph.block_id(exit) as usize, graph.num_blocks() - 1);
    assert_eq!(graph.block_id(graph.entry_block()), 0);
    assert!(graph.block(exit).successors().is_empty());
    assert_eq!(graph.block(exit).predecessors().len(), 2);
}

#[test]
fn test_if_ne_lowers_to_negated_equal() {
    let graph = build(
        r#"
            if-ne v0, v1, :target
            return-void
        target:
            return-void
        "#,
    )
    .unwrap();

    let (not, _) = graph
        .instructions()
        .find(|(_, inst)| matches!(inst.kind(), InstKind::Not { .. }))
        .unwrap();
    let InstKind::Not { input } = graph.instruction(not).kind() else {
        unreachable!()
    };
    assert!(matches!(graph.instruction(*input).kind(), InstKind::Equal { .. }));
    let users = graph.instruction(not).users();
    assert_eq!(users.len(), 1);
    assert!(matches!(graph.instruction(users[0]).kind(), InstKind::If { .. }));
}

#[test]
fn test_invoke_static_pushes_arguments() {
    let graph = build(
        r#"
        .registers 2
        .callee 7 V
            const/4 v0, #3
            const/4 v1, #4
            invoke-static {v0, v1}, method@7
            return-void
        "#,
    )
    .unwrap();

    let pushes: Vec<u16> = graph
        .instructions()
        .filter_map(|(_, inst)| match inst.kind() {
            InstKind::PushArgument { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(pushes, vec![0, 1]);

    let (invoke, inst) = graph
        .instructions()
        .find(|(_, inst)| matches!(inst.kind(), InstKind::InvokeStatic { .. }))
        .unwrap();
    let InstKind::InvokeStatic { method_idx, args, .. } = inst.kind() else {
        unreachable!()
    };
    assert_eq!(*method_idx, 7);
    assert_eq!(args.len(), 2);
    assert!(graph.instruction(invoke).needs_environment());
}

#[test]
fn test_unresolved_callee_bails_out() {
    init_logging();
    let parsed = parse(
        r#"
            invoke-static {v0}, method@3
            return-void
        "#,
    );
    let err = GraphBuilder::new(&parsed.unit, &MethodTable::new(), &CompilerOptions::default())
        .build(&parsed.code)
        .unwrap_err();
    assert_eq!(err, UnsupportedConstruct::UnresolvedMethod { method_idx: 3 });
    assert_eq!(err.kind(), "unresolved-method");
}

#[test]
fn test_unsupported_opcode_reports_dex_pc() {
    let err = build(
        r#"
            const/4 v0, #1
            mul-int v0, v0, v0
            return-void
        "#,
    )
    .unwrap_err();
    assert_eq!(
        err,
        UnsupportedConstruct::Opcode {
            opcode: Opcode::MulInt,
            dex_pc: 1
        }
    );
}

#[test]
fn test_falling_off_the_end_bails_out() {
    let err = build(
        r#"
            const/4 v0, #1
            if-eq v0, v0, :out
        out:
            const/4 v1, #2
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, UnsupportedConstruct::FallsOffEnd { .. }));
}

#[test]
fn test_size_limits_bail_out() {
    init_logging();
    let parsed = parse(
        r#"
            const/4 v0, #1
            const/4 v1, #2
            return-void
        "#,
    );
    let options = CompilerOptions {
        max_code_units: 2,
        ..CompilerOptions::default()
    };
    let err = build_with(&parsed, &options).unwrap_err();
    assert!(matches!(err, UnsupportedConstruct::MethodTooLarge { .. }));
}

#[test]
fn test_graph_dump_lists_blocks() {
    let graph = build(
        r#"
            const/4 v0, #1
            return v0
        "#,
    )
    .unwrap();
    let dump = graph.to_string();
    assert!(dump.contains("B0"));
    assert!(dump.contains("int-constant"));
    assert!(dump.contains("return"));
}
