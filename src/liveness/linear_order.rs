//! Block linearization and loop detection.
//!
//! Loops are found from DFS back edges; each header's natural loop is the
//! set of blocks that reach one of its back edges without passing through
//! the header. The linear order is a reverse post-order in which, at a
//! branch, successors leaving the current loop are visited first. They
//! finish earlier in post-order and so land after the loop body, which
//! keeps every loop body contiguous behind its header.

use crate::graph::{BlockRef, Graph};
use smallvec::SmallVec;

/// A natural loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    header: BlockRef,
    back_edges: SmallVec<[BlockRef; 2]>,
    /// Membership, indexed by block id.
    blocks: Vec<bool>,
    size: usize,
}

impl LoopInfo {
    pub fn header(&self) -> BlockRef {
        self.header
    }

    /// Blocks with an edge back to the header.
    pub fn back_edges(&self) -> &[BlockRef] {
        &self.back_edges
    }

    pub fn contains(&self, graph: &Graph, block: BlockRef) -> bool {
        self.blocks[graph.block_id(block) as usize]
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Linear block order plus the loops it was built from.
#[derive(Debug, Clone)]
pub struct LinearOrder {
    order: Vec<BlockRef>,
    loops: Vec<LoopInfo>,
    /// Innermost loop per block id.
    innermost: Vec<Option<usize>>,
    /// Loop headed by each block id.
    header_of: Vec<Option<usize>>,
}

impl LinearOrder {
    /// Linearize the blocks reachable from the entry block.
    pub fn compute(graph: &Graph) -> Self {
        let num_blocks = graph.num_blocks();
        let loops = detect_loops(graph);

        let mut innermost: Vec<Option<usize>> = vec![None; num_blocks];
        let mut header_of: Vec<Option<usize>> = vec![None; num_blocks];
        for (index, info) in loops.iter().enumerate() {
            header_of[graph.block_id(info.header) as usize] = Some(index);
            for (id, &member) in info.blocks.iter().enumerate() {
                if !member {
                    continue;
                }
                let smaller = match innermost[id] {
                    Some(current) => info.size < loops[current].size,
                    None => true,
                };
                if smaller {
                    innermost[id] = Some(index);
                }
            }
        }

        let mut linear = Self {
            order: Vec::with_capacity(num_blocks),
            loops,
            innermost,
            header_of,
        };
        linear.order = linear.linearize(graph);
        linear
    }

    fn linearize(&self, graph: &Graph) -> Vec<BlockRef> {
        let num_blocks = graph.num_blocks();
        let mut visited = vec![false; num_blocks];
        let mut post_order = Vec::with_capacity(num_blocks);

        struct Frame {
            block: BlockRef,
            successors: SmallVec<[BlockRef; 2]>,
            next: usize,
        }

        let entry = graph.entry_block();
        visited[graph.block_id(entry) as usize] = true;
        let mut stack = vec![Frame {
            block: entry,
            successors: self.visit_order(graph, entry),
            next: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.successors.len() {
                let succ = frame.successors[frame.next];
                frame.next += 1;
                let id = graph.block_id(succ) as usize;
                if !visited[id] {
                    visited[id] = true;
                    stack.push(Frame {
                        block: succ,
                        successors: self.visit_order(graph, succ),
                        next: 0,
                    });
                }
            } else {
                post_order.push(frame.block);
                stack.pop();
            }
        }

        post_order.reverse();
        post_order
    }

    /// Successors with loop exits first.
    fn visit_order(&self, graph: &Graph, block: BlockRef) -> SmallVec<[BlockRef; 2]> {
        let successors = graph.block(block).successors();
        let Some(current) = self.innermost[graph.block_id(block) as usize] else {
            return successors.iter().copied().collect();
        };
        let current = &self.loops[current];
        let (exits, inside): (SmallVec<[BlockRef; 2]>, SmallVec<[BlockRef; 2]>) = successors
            .iter()
            .copied()
            .partition(|&succ| !current.contains(graph, succ));
        exits.into_iter().chain(inside).collect()
    }

    /// Reachable blocks, dominators first, loop bodies contiguous.
    pub fn blocks(&self) -> &[BlockRef] {
        &self.order
    }

    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    /// The loop headed by `block`, if it is a loop header.
    pub fn loop_headed_by(&self, graph: &Graph, block: BlockRef) -> Option<&LoopInfo> {
        self.header_of[graph.block_id(block) as usize].map(|index| &self.loops[index])
    }

    pub fn innermost_loop(&self, graph: &Graph, block: BlockRef) -> Option<&LoopInfo> {
        self.innermost[graph.block_id(block) as usize].map(|index| &self.loops[index])
    }
}

/// Find back edges by DFS and collect each header's natural loop.
fn detect_loops(graph: &Graph) -> Vec<LoopInfo> {
    let num_blocks = graph.num_blocks();
    let mut visited = vec![false; num_blocks];
    let mut on_stack = vec![false; num_blocks];
    let mut back_edges: Vec<(BlockRef, BlockRef)> = Vec::new();

    let entry = graph.entry_block();
    let entry_id = graph.block_id(entry) as usize;
    visited[entry_id] = true;
    on_stack[entry_id] = true;
    let mut stack: Vec<(BlockRef, usize)> = vec![(entry, 0)];

    while let Some((block, next)) = stack.last_mut() {
        let block = *block;
        let successors = graph.block(block).successors();
        if *next < successors.len() {
            let succ = successors[*next];
            *next += 1;
            let id = graph.block_id(succ) as usize;
            if !visited[id] {
                visited[id] = true;
                on_stack[id] = true;
                stack.push((succ, 0));
            } else if on_stack[id] && !back_edges.contains(&(block, succ)) {
                back_edges.push((block, succ));
            }
        } else {
            on_stack[graph.block_id(block) as usize] = false;
            stack.pop();
        }
    }

    let mut loops: Vec<LoopInfo> = Vec::new();
    for (source, header) in back_edges {
        let index = match loops.iter().position(|l| l.header == header) {
            Some(index) => index,
            None => {
                let mut blocks = vec![false; num_blocks];
                blocks[graph.block_id(header) as usize] = true;
                loops.push(LoopInfo {
                    header,
                    back_edges: SmallVec::new(),
                    blocks,
                    size: 1,
                });
                loops.len() - 1
            }
        };
        let info = &mut loops[index];
        info.back_edges.push(source);

        // Walk predecessors from the back edge up to the header.
        let mut worklist = vec![source];
        while let Some(block) = worklist.pop() {
            let id = graph.block_id(block) as usize;
            if info.blocks[id] {
                continue;
            }
            info.blocks[id] = true;
            info.size += 1;
            worklist.extend(graph.block(block).predecessors().iter().copied());
        }
    }

    loops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::PrimitiveType;
    use crate::graph::InstKind;

    /// Build a graph from an edge list over `n` blocks placed in order.
    fn graph_with_edges(n: usize, edges: &[(usize, usize)]) -> (Graph, Vec<BlockRef>) {
        let mut graph = Graph::new();
        let mut blocks = vec![graph.entry_block()];
        for i in 1..n {
            let block = graph.create_block(Some(i as u32));
            graph.add_block(block);
            blocks.push(block);
        }
        for &(from, to) in edges {
            graph.add_successor(blocks[from], blocks[to]);
        }
        for &block in &blocks {
            graph.add_instruction(block, InstKind::Goto, PrimitiveType::Void);
        }
        (graph, blocks)
    }

    fn ids(graph: &Graph, order: &[BlockRef]) -> Vec<u32> {
        order.iter().map(|&b| graph.block_id(b)).collect()
    }

    #[test]
    fn test_diamond_order() {
        let (graph, _) = graph_with_edges(5, &[(0, 1), (1, 2), (1, 3), (2, 4), (3, 4)]);
        let linear = LinearOrder::compute(&graph);
        let order = ids(&graph, linear.blocks());
        assert_eq!(order[0], 0);
        assert_eq!(order[1], 1);
        assert_eq!(*order.last().unwrap(), 4);
        assert!(linear.loops().is_empty());
    }

    #[test]
    fn test_loop_body_is_contiguous() {
        // 0 -> 1 (header) -> {4 exit, 2 body}; 2 -> 3 -> 1
        let (graph, blocks) =
            graph_with_edges(5, &[(0, 1), (1, 4), (1, 2), (2, 3), (3, 1)]);
        let linear = LinearOrder::compute(&graph);
        assert_eq!(ids(&graph, linear.blocks()), vec![0, 1, 2, 3, 4]);

        let info = linear.loop_headed_by(&graph, blocks[1]).unwrap();
        assert_eq!(info.back_edges(), &[blocks[3]]);
        assert_eq!(info.len(), 3);
        assert!(info.contains(&graph, blocks[2]));
        assert!(!info.contains(&graph, blocks[4]));
        assert!(linear.innermost_loop(&graph, blocks[4]).is_none());
    }

    #[test]
    fn test_unreachable_blocks_are_dropped() {
        let (graph, _) = graph_with_edges(4, &[(0, 1), (1, 3), (2, 3)]);
        let linear = LinearOrder::compute(&graph);
        assert_eq!(ids(&graph, linear.blocks()), vec![0, 1, 3]);
    }

    #[test]
    fn test_self_loop() {
        let (graph, blocks) = graph_with_edges(3, &[(0, 1), (1, 1), (1, 2)]);
        let linear = LinearOrder::compute(&graph);
        assert_eq!(ids(&graph, linear.blocks()), vec![0, 1, 2]);
        let info = linear.loop_headed_by(&graph, blocks[1]).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info.back_edges(), &[blocks[1]]);
    }
}
