// This module implements SsaLivenessAnalysis, which turns a Graph into per-block
// liveness sets and per-value live intervals. Analysis runs in four steps. Blocks are
// linearized (reverse post-order, loop bodies contiguous) and numbered: every block
// spans [start, end) and every instruction sits at an even position strictly inside
// its block, with each block starting where the previous one ended so whole-block
// ranges merge. Values that have at least one user in a linearized block receive a
// dense SSA index and an interval. Live ranges are then built in one backward sweep
// over the linear order; loop headers stretch every live-in value over the whole
// loop. Finally live-in and live-out sets are iterated to a fixed point. The
// live-in, live-out and kill bit vectors are allocated in the session arena.

//! SSA liveness analysis.

use super::interval::{IntervalId, LiveInterval, LiveIntervals};
use super::linear_order::LinearOrder;
use crate::core::{BitVector, CompilationSession};
use crate::graph::{BlockRef, Graph, InstId};
use bumpalo::Bump;
use log::{debug, trace};

/// Distance between consecutive lifetime positions.
pub const LIFETIME_STRIDE: usize = 2;

/// Liveness sets of one block, indexed by SSA index.
pub struct BlockInfo<'arena> {
    live_in: BitVector<'arena>,
    live_out: BitVector<'arena>,
    kill: BitVector<'arena>,
}

impl<'arena> BlockInfo<'arena> {
    fn new(number_of_ssa_values: usize, arena: &'arena Bump) -> Self {
        Self {
            live_in: BitVector::new_in(number_of_ssa_values, arena),
            live_out: BitVector::new_in(number_of_ssa_values, arena),
            kill: BitVector::new_in(number_of_ssa_values, arena),
        }
    }

    pub fn live_in(&self) -> &BitVector<'arena> {
        &self.live_in
    }

    pub fn live_out(&self) -> &BitVector<'arena> {
        &self.live_out
    }

    pub fn kill(&self) -> &BitVector<'arena> {
        &self.kill
    }
}

/// Liveness of one method's graph.
pub struct SsaLivenessAnalysis<'g, 'arena> {
    graph: &'g Graph,
    linear_order: LinearOrder,
    /// Indexed by block id; `None` for blocks that were not linearized.
    block_infos: Vec<Option<BlockInfo<'arena>>>,
    block_lifetimes: Vec<Option<(usize, usize)>>,
    /// Indexed by instruction.
    lifetime_positions: Vec<Option<usize>>,
    ssa_indexes: Vec<Option<usize>>,
    instructions_from_ssa_index: Vec<InstId>,
    intervals: LiveIntervals,
}

impl<'g, 'arena> SsaLivenessAnalysis<'g, 'arena> {
    /// Run the full analysis on `graph`.
    pub fn analyze(graph: &'g Graph, session: &CompilationSession<'arena>) -> Self {
        let mut analysis = Self {
            graph,
            linear_order: LinearOrder::compute(graph),
            block_infos: Vec::new(),
            block_lifetimes: vec![None; graph.num_blocks()],
            lifetime_positions: vec![None; graph.num_instructions()],
            ssa_indexes: vec![None; graph.num_instructions()],
            instructions_from_ssa_index: Vec::new(),
            intervals: LiveIntervals::new(),
        };

        analysis.number_instructions();
        analysis.compute_liveness(session.arena());

        debug!(
            "liveness: {} blocks linearized, {} ssa values",
            analysis.linear_order.blocks().len(),
            analysis.number_of_ssa_values()
        );
        analysis
    }

    fn block_index(&self, block: BlockRef) -> usize {
        self.graph.block_id(block) as usize
    }

    fn number_instructions(&mut self) {
        let graph = self.graph;
        let mut linearized = vec![false; graph.num_blocks()];
        for &block in self.linear_order.blocks() {
            linearized[graph.block_id(block) as usize] = true;
        }

        let mut position = 0;
        for &block in self.linear_order.blocks() {
            let start = position;
            for &inst in graph.block(block).instructions() {
                position += LIFETIME_STRIDE;
                self.lifetime_positions[inst.index()] = Some(position);

                let instruction = graph.instruction(inst);
                let used = instruction
                    .users()
                    .iter()
                    .any(|&user| linearized[graph.block_id(graph.instruction(user).block()) as usize]);
                if used {
                    self.ssa_indexes[inst.index()] = Some(self.instructions_from_ssa_index.len());
                    self.instructions_from_ssa_index.push(inst);
                    self.intervals.create(instruction.ty());
                }
            }
            position += LIFETIME_STRIDE;
            self.block_lifetimes[graph.block_id(block) as usize] = Some((start, position));
        }
    }

    fn compute_liveness(&mut self, arena: &'arena Bump) {
        let number_of_ssa_values = self.number_of_ssa_values();
        self.block_infos = (0..self.graph.num_blocks())
            .map(|id| {
                self.block_lifetimes[id].map(|_| BlockInfo::new(number_of_ssa_values, arena))
            })
            .collect();

        self.compute_live_ranges();
        self.compute_live_in_and_live_out_sets();
    }

    fn compute_live_ranges(&mut self) {
        let graph = self.graph;
        for &block in self.linear_order.blocks().iter().rev() {
            let index = self.block_index(block);
            let (start, end) = self.lifetime_of(block);

            for &succ in graph.block(block).successors() {
                let succ_index = self.block_index(succ);
                if succ_index != index {
                    let (info, succ_info) = pair_mut(&mut self.block_infos, index, succ_index);
                    info.live_in.union(&succ_info.live_in);
                }
            }

            let info = info_mut(&mut self.block_infos, index);
            for ssa_index in info.live_in.indexes() {
                self.intervals.add_range(IntervalId::from_index(ssa_index), start, end);
            }

            for &inst in graph.block(block).instructions().iter().rev() {
                let position = self.lifetime_positions[inst.index()].unwrap_or(start);
                if let Some(ssa_index) = self.ssa_indexes[inst.index()] {
                    info.kill.set_bit(ssa_index);
                    info.live_in.clear_bit(ssa_index);
                    self.intervals.set_from(IntervalId::from_index(ssa_index), position);
                }

                let instruction = graph.instruction(inst);
                let requires_environment = instruction.needs_environment();
                for input in instruction.inputs() {
                    if let Some(ssa_index) = self.ssa_indexes[input.index()] {
                        info.live_in.set_bit(ssa_index);
                        self.intervals.add_use(
                            IntervalId::from_index(ssa_index),
                            inst,
                            position,
                            start,
                            end,
                            requires_environment,
                        );
                    }
                }
            }

            if let Some(info_loop) = self.linear_order.loop_headed_by(graph, block) {
                let loop_end = info_loop
                    .back_edges()
                    .iter()
                    .filter_map(|&edge| self.block_lifetimes[graph.block_id(edge) as usize])
                    .map(|(_, edge_end)| edge_end)
                    .max()
                    .unwrap_or(end);
                for ssa_index in info.live_in.indexes() {
                    trace!("loop range [{start}, {loop_end}) for ssa value {ssa_index}");
                    self.intervals
                        .add_loop_range(IntervalId::from_index(ssa_index), start, loop_end);
                }
            }
        }
    }

    fn compute_live_in_and_live_out_sets(&mut self) {
        let post_order: Vec<BlockRef> = self.linear_order.blocks().iter().rev().copied().collect();
        let mut iterations = 0;
        loop {
            iterations += 1;
            let mut changed = false;
            for &block in &post_order {
                // live_in depends only on live_out, the kill set is fixed.
                if self.update_live_out(block) && self.update_live_in(block) {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        trace!("live sets stable after {iterations} iteration(s)");
    }

    fn update_live_out(&mut self, block: BlockRef) -> bool {
        let graph = self.graph;
        let index = self.block_index(block);
        let mut changed = false;
        for &succ in graph.block(block).successors() {
            let succ_index = self.block_index(succ);
            if succ_index == index {
                let info = info_mut(&mut self.block_infos, index);
                changed |= info.live_out.union(&info.live_in);
            } else {
                let (info, succ_info) = pair_mut(&mut self.block_infos, index, succ_index);
                changed |= info.live_out.union(&succ_info.live_in);
            }
        }
        changed
    }

    fn update_live_in(&mut self, block: BlockRef) -> bool {
        let index = self.block_index(block);
        let info = info_mut(&mut self.block_infos, index);
        info.live_in.union_if_not_in(&info.live_out, &info.kill)
    }

    fn lifetime_of(&self, block: BlockRef) -> (usize, usize) {
        match self.block_lifetimes[self.block_index(block)] {
            Some(lifetime) => lifetime,
            None => panic!("block B{} was not linearized", self.block_index(block)),
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Blocks in linear order.
    pub fn linear_order(&self) -> &[BlockRef] {
        self.linear_order.blocks()
    }

    pub fn loops(&self) -> &LinearOrder {
        &self.linear_order
    }

    /// `[start, end)` lifetime of a linearized block.
    pub fn block_lifetime(&self, block: BlockRef) -> Option<(usize, usize)> {
        self.block_lifetimes[self.block_index(block)]
    }

    pub fn block_info(&self, block: BlockRef) -> Option<&BlockInfo<'arena>> {
        self.block_infos
            .get(self.block_index(block))
            .and_then(Option::as_ref)
    }

    pub fn live_in(&self, block: BlockRef) -> Option<&BitVector<'arena>> {
        self.block_info(block).map(BlockInfo::live_in)
    }

    pub fn live_out(&self, block: BlockRef) -> Option<&BitVector<'arena>> {
        self.block_info(block).map(BlockInfo::live_out)
    }

    pub fn kill(&self, block: BlockRef) -> Option<&BitVector<'arena>> {
        self.block_info(block).map(BlockInfo::kill)
    }

    pub fn lifetime_position(&self, inst: InstId) -> Option<usize> {
        self.lifetime_positions[inst.index()]
    }

    pub fn ssa_index(&self, inst: InstId) -> Option<usize> {
        self.ssa_indexes[inst.index()]
    }

    pub fn instruction_from_ssa_index(&self, ssa_index: usize) -> Option<InstId> {
        self.instructions_from_ssa_index.get(ssa_index).copied()
    }

    pub fn number_of_ssa_values(&self) -> usize {
        self.instructions_from_ssa_index.len()
    }

    /// Interval of a value, if it has an SSA index.
    pub fn interval_of(&self, inst: InstId) -> Option<IntervalId> {
        self.ssa_index(inst).map(IntervalId::from_index)
    }

    pub fn interval(&self, inst: InstId) -> Option<&LiveInterval> {
        self.interval_of(inst).map(|id| self.intervals.get(id))
    }

    pub fn intervals(&self) -> &LiveIntervals {
        &self.intervals
    }

    /// Mutable access for the register allocator (register slots, splits).
    pub fn intervals_mut(&mut self) -> &mut LiveIntervals {
        &mut self.intervals
    }

    /// Check that every interval's ranges are increasing and disjoint.
    pub fn verify(&self) -> bool {
        self.intervals
            .iter()
            .all(|(_, interval)| interval.ranges_are_ordered())
    }
}

fn info_mut<'s, 'arena>(
    infos: &'s mut [Option<BlockInfo<'arena>>],
    index: usize,
) -> &'s mut BlockInfo<'arena> {
    match infos[index].as_mut() {
        Some(info) => info,
        None => panic!("no liveness sets for block B{index}"),
    }
}

/// Mutable access to one block's sets with shared access to another's.
fn pair_mut<'s, 'arena>(
    infos: &'s mut [Option<BlockInfo<'arena>>],
    index: usize,
    other: usize,
) -> (&'s mut BlockInfo<'arena>, &'s BlockInfo<'arena>) {
    assert_ne!(index, other);
    let (info, other_info) = if index < other {
        let (low, high) = infos.split_at_mut(other);
        (&mut low[index], &high[0])
    } else {
        let (low, high) = infos.split_at_mut(index);
        (&mut high[0], &low[other])
    };
    match (info.as_mut(), other_info.as_ref()) {
        (Some(info), Some(other_info)) => (info, other_info),
        _ => panic!("no liveness sets for block B{index} or B{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_graph as build, TestContext};
    use crate::graph::InstKind;

    #[test]
    fn test_numbering_is_contiguous() {
        let graph = build(
            r#"
                const/4 v0, #1
                return v0
            "#,
        );
        let ctx = TestContext::new();
        ctx.with_session(|session| {
            let liveness = SsaLivenessAnalysis::analyze(&graph, session);
            let mut previous_end = 0;
            for &block in liveness.linear_order() {
                let (start, end) = liveness.block_lifetime(block).unwrap();
                assert_eq!(start, previous_end);
                assert!(end > start);
                for &inst in graph.block(block).instructions() {
                    let pos = liveness.lifetime_position(inst).unwrap();
                    assert!(pos > start && pos < end);
                    assert_eq!(pos % LIFETIME_STRIDE, 0);
                }
                previous_end = end;
            }
        });
    }

    #[test]
    fn test_value_live_across_blocks() {
        // The constant is defined in the entry block and used in B1.
        let graph = build(
            r#"
                const/4 v0, #1
                return-void
            "#,
        );
        let ctx = TestContext::new();
        ctx.with_session(|session| {
            let liveness = SsaLivenessAnalysis::analyze(&graph, session);
            let (constant, _) = graph
                .instructions()
                .find(|(_, inst)| matches!(inst.kind(), InstKind::IntConstant { .. }))
                .unwrap();
            let index = liveness.ssa_index(constant).unwrap();
            assert_eq!(liveness.instruction_from_ssa_index(index), Some(constant));
            // Block sets live in the session arena.
            assert!(ctx.arena_bytes() > 0);

            let entry = graph.entry_block();
            let body = graph.block_by_id(1).unwrap();
            assert!(liveness.live_out(entry).unwrap().is_bit_set(index));
            assert!(liveness.live_in(body).unwrap().is_bit_set(index));
            assert!(liveness.kill(entry).unwrap().is_bit_set(index));
            assert!(!liveness.live_in(entry).unwrap().is_bit_set(index));

            let interval = liveness.interval(constant).unwrap();
            assert_eq!(interval.ranges().len(), 1);
            assert_eq!(interval.start(), liveness.lifetime_position(constant).unwrap());
            assert!(liveness.verify());
        });
    }

    #[test]
    fn test_loop_extends_live_in_values() {
        // i0 = 1 is read inside the loop on every iteration.
        let graph = build(
            r#"
                const/4 v1, #1
            loop:
                add-int/lit8 v0, v0, #1
                if-ne v0, v1, :loop
                return-void
            "#,
        );
        let ctx = TestContext::new();
        ctx.with_session(|session| {
            let liveness = SsaLivenessAnalysis::analyze(&graph, session);
            let (constant, _) = graph
                .instructions()
                .find(|(_, inst)| matches!(inst.kind(), InstKind::IntConstant { value: 1 }))
                .unwrap();
            let header = graph.block_by_id(2).unwrap();
            let (header_start, header_end) = liveness.block_lifetime(header).unwrap();

            let interval = liveness.interval(constant).unwrap();
            assert!(interval.covers(header_start));
            assert!(interval.covers(header_end - 1));
            assert!(liveness.live_in(header).unwrap().is_bit_set(liveness.ssa_index(constant).unwrap()));
            assert!(liveness.verify());
        });
    }
}
