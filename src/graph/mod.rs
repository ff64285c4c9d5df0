// This module defines the control-flow graph the builder produces and liveness
// consumes. Blocks and instructions live in per-graph stores addressed by u32
// handles (BlockRef, InstId), so def/use edges and successor lists are plain integers
// and the whole graph is dropped in one piece when the method compilation ends.
// Blocks are created before they are placed: a block receives its dense identity
// only when add_block is called, which lets the builder allocate branch-target blocks
// during its pre-scan while still handing out ids in translation order and giving the
// exit block the highest id. Instructions keep their users in insertion order;
// references from LoadLocal/StoreLocal to Local slots are storage references and do
// not count as def/use edges.

//! Control-flow graph of typed operations.

pub mod builder;

pub use builder::GraphBuilder;

use crate::bytecode::PrimitiveType;
use smallvec::SmallVec;
use std::fmt;

/// Handle to a block in a [`Graph`]'s block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(u32);

impl BlockRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to an instruction in a [`Graph`]'s instruction store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub(crate) u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
}

/// Operation performed by an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// Storage slot for virtual register `reg`.
    Local { reg: u16 },
    IntConstant { value: i32 },
    /// Incoming argument, receiver first for instance methods.
    ParameterValue { index: u16 },
    LoadLocal { local: InstId },
    StoreLocal { local: InstId, value: InstId },
    Binary { op: BinaryOp, lhs: InstId, rhs: InstId },
    Equal { lhs: InstId, rhs: InstId },
    Not { input: InstId },
    If { condition: InstId },
    Goto,
    Return { value: InstId },
    ReturnVoid,
    Exit,
    PushArgument { value: InstId, index: u16 },
    InvokeStatic {
        method_idx: u32,
        dex_pc: u32,
        args: SmallVec<[InstId; 4]>,
    },
    NewInstance { dex_pc: u32, type_idx: u32 },
}

impl InstKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstKind::Local { .. } => "local",
            InstKind::IntConstant { .. } => "int-constant",
            InstKind::ParameterValue { .. } => "parameter",
            InstKind::LoadLocal { .. } => "load-local",
            InstKind::StoreLocal { .. } => "store-local",
            InstKind::Binary { op: BinaryOp::Add, .. } => "add",
            InstKind::Binary { op: BinaryOp::Sub, .. } => "sub",
            InstKind::Equal { .. } => "equal",
            InstKind::Not { .. } => "not",
            InstKind::If { .. } => "if",
            InstKind::Goto => "goto",
            InstKind::Return { .. } => "return",
            InstKind::ReturnVoid => "return-void",
            InstKind::Exit => "exit",
            InstKind::PushArgument { .. } => "push-argument",
            InstKind::InvokeStatic { .. } => "invoke-static",
            InstKind::NewInstance { .. } => "new-instance",
        }
    }

    /// Value inputs, in operand order.
    pub fn inputs(&self) -> SmallVec<[InstId; 4]> {
        match self {
            InstKind::StoreLocal { value, .. }
            | InstKind::Return { value }
            | InstKind::PushArgument { value, .. } => smallvec::smallvec![*value],
            InstKind::Binary { lhs, rhs, .. } | InstKind::Equal { lhs, rhs } => {
                smallvec::smallvec![*lhs, *rhs]
            }
            InstKind::Not { input } => smallvec::smallvec![*input],
            InstKind::If { condition } => smallvec::smallvec![*condition],
            InstKind::InvokeStatic { args, .. } => args.clone(),
            InstKind::Local { .. }
            | InstKind::IntConstant { .. }
            | InstKind::ParameterValue { .. }
            | InstKind::LoadLocal { .. }
            | InstKind::Goto
            | InstKind::ReturnVoid
            | InstKind::Exit
            | InstKind::NewInstance { .. } => SmallVec::new(),
        }
    }

    /// Ends a block.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            InstKind::If { .. }
                | InstKind::Goto
                | InstKind::Return { .. }
                | InstKind::ReturnVoid
                | InstKind::Exit
        )
    }

    /// Instructions that may call into the runtime and therefore capture
    /// the full interpreter state at their position.
    pub fn needs_environment(&self) -> bool {
        matches!(self, InstKind::InvokeStatic { .. } | InstKind::NewInstance { .. })
    }
}

/// A node in the graph.
#[derive(Debug, Clone)]
pub struct Instruction {
    kind: InstKind,
    block: BlockRef,
    ty: PrimitiveType,
    users: SmallVec<[InstId; 4]>,
}

impl Instruction {
    pub fn kind(&self) -> &InstKind {
        &self.kind
    }

    pub fn block(&self) -> BlockRef {
        self.block
    }

    pub fn ty(&self) -> PrimitiveType {
        self.ty
    }

    /// Instructions consuming this one, in insertion order. A user that
    /// consumes the value twice appears twice.
    pub fn users(&self) -> &[InstId] {
        &self.users
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn inputs(&self) -> SmallVec<[InstId; 4]> {
        self.kind.inputs()
    }

    pub fn needs_environment(&self) -> bool {
        self.kind.needs_environment()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    id: Option<u32>,
    dex_pc: Option<u32>,
    instructions: Vec<InstId>,
    successors: SmallVec<[BlockRef; 2]>,
    predecessors: SmallVec<[BlockRef; 4]>,
}

impl Block {
    /// Dense identity, assigned when the block is placed in the graph.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Bytecode offset of the first instruction, for blocks that have one.
    pub fn dex_pc(&self) -> Option<u32> {
        self.dex_pc
    }

    pub fn instructions(&self) -> &[InstId] {
        &self.instructions
    }

    pub fn successors(&self) -> &[BlockRef] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[BlockRef] {
        &self.predecessors
    }

    pub fn last_instruction(&self) -> Option<InstId> {
        self.instructions.last().copied()
    }
}

/// Method graph with a single entry and a single exit block.
#[derive(Debug, Clone)]
pub struct Graph {
    blocks: Vec<Block>,
    /// Placed blocks, indexed by id.
    order: Vec<BlockRef>,
    instructions: Vec<Instruction>,
    entry: BlockRef,
    exit: BlockRef,
    number_of_vregs: u16,
    number_of_in_vregs: u16,
    max_out_vregs: u16,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create a graph whose entry block is placed and whose exit block is
    /// created but not yet placed.
    pub fn new() -> Self {
        let mut graph = Self {
            blocks: Vec::new(),
            order: Vec::new(),
            instructions: Vec::new(),
            entry: BlockRef(0),
            exit: BlockRef(0),
            number_of_vregs: 0,
            number_of_in_vregs: 0,
            max_out_vregs: 0,
        };
        graph.entry = graph.create_block(None);
        graph.add_block(graph.entry);
        graph.exit = graph.create_block(None);
        graph
    }

    pub fn create_block(&mut self, dex_pc: Option<u32>) -> BlockRef {
        let block = BlockRef(self.blocks.len() as u32);
        self.blocks.push(Block {
            dex_pc,
            ..Block::default()
        });
        block
    }

    /// Place a block, giving it the next id.
    pub fn add_block(&mut self, block: BlockRef) -> u32 {
        let id = self.order.len() as u32;
        let slot = &mut self.blocks[block.index()];
        assert!(slot.id.is_none(), "block placed twice");
        slot.id = Some(id);
        self.order.push(block);
        id
    }

    /// Append an instruction to `block`, registering it as a user of its
    /// inputs.
    pub fn add_instruction(&mut self, block: BlockRef, kind: InstKind, ty: PrimitiveType) -> InstId {
        let id = InstId(self.instructions.len() as u32);
        for input in kind.inputs() {
            self.instructions[input.index()].users.push(id);
        }
        self.instructions.push(Instruction {
            kind,
            block,
            ty,
            users: SmallVec::new(),
        });
        self.blocks[block.index()].instructions.push(id);
        id
    }

    pub fn add_successor(&mut self, from: BlockRef, to: BlockRef) {
        self.blocks[from.index()].successors.push(to);
        self.blocks[to.index()].predecessors.push(from);
    }

    pub fn block(&self, block: BlockRef) -> &Block {
        &self.blocks[block.index()]
    }

    pub fn instruction(&self, inst: InstId) -> &Instruction {
        &self.instructions[inst.index()]
    }

    /// Placed blocks in id order.
    pub fn blocks(&self) -> &[BlockRef] {
        &self.order
    }

    pub fn block_by_id(&self, id: u32) -> Option<BlockRef> {
        self.order.get(id as usize).copied()
    }

    /// Id of a placed block.
    ///
    /// Passes only see blocks reachable through placed blocks, so every
    /// block they query has an id.
    pub fn block_id(&self, block: BlockRef) -> u32 {
        let id = self.blocks[block.index()].id;
        debug_assert!(id.is_some(), "block {} queried before placement", block.index());
        id.expect("graph invariant: block queried before placement")
    }

    pub fn entry_block(&self) -> BlockRef {
        self.entry
    }

    pub fn exit_block(&self) -> BlockRef {
        self.exit
    }

    pub fn num_blocks(&self) -> usize {
        self.order.len()
    }

    pub fn num_instructions(&self) -> usize {
        self.instructions.len()
    }

    /// All instructions in creation order.
    pub fn instructions(&self) -> impl Iterator<Item = (InstId, &Instruction)> + '_ {
        self.instructions
            .iter()
            .enumerate()
            .map(|(index, inst)| (InstId(index as u32), inst))
    }

    pub fn number_of_vregs(&self) -> u16 {
        self.number_of_vregs
    }

    pub fn set_number_of_vregs(&mut self, count: u16) {
        self.number_of_vregs = count;
    }

    pub fn number_of_in_vregs(&self) -> u16 {
        self.number_of_in_vregs
    }

    pub fn set_number_of_in_vregs(&mut self, count: u16) {
        self.number_of_in_vregs = count;
    }

    pub fn max_out_vregs(&self) -> u16 {
        self.max_out_vregs
    }

    pub fn update_max_out_vregs(&mut self, count: u16) {
        self.max_out_vregs = self.max_out_vregs.max(count);
    }

    fn local_reg(&self, local: InstId) -> Option<u16> {
        match self.instruction(local).kind {
            InstKind::Local { reg } => Some(reg),
            _ => None,
        }
    }

    fn fmt_instruction(&self, f: &mut fmt::Formatter<'_>, id: InstId) -> fmt::Result {
        let inst = self.instruction(id);
        let kind = &inst.kind;
        if inst.ty != PrimitiveType::Void {
            write!(f, "{id} = ")?;
        }
        f.write_str(kind.name())?;

        match kind {
            InstKind::Local { reg } => write!(f, " v{reg}")?,
            InstKind::IntConstant { value } => write!(f, " {value}")?,
            InstKind::ParameterValue { index } => write!(f, " {index}")?,
            InstKind::LoadLocal { local } => match self.local_reg(*local) {
                Some(reg) => write!(f, " v{reg}")?,
                None => write!(f, " {local}")?,
            },
            InstKind::StoreLocal { local, value } => match self.local_reg(*local) {
                Some(reg) => write!(f, " v{reg}, {value}")?,
                None => write!(f, " {local}, {value}")?,
            },
            InstKind::Binary { lhs, rhs, .. } | InstKind::Equal { lhs, rhs } => {
                write!(f, " {lhs}, {rhs}")?
            }
            InstKind::Not { input } => write!(f, " {input}")?,
            InstKind::If { condition } => write!(f, " {condition}")?,
            InstKind::Return { value } => write!(f, " {value}")?,
            InstKind::PushArgument { value, index } => write!(f, " {value}, {index}")?,
            InstKind::InvokeStatic {
                method_idx, args, ..
            } => {
                write!(f, " method@{method_idx} (")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")?;
            }
            InstKind::NewInstance { type_idx, .. } => write!(f, " type@{type_idx}")?,
            InstKind::Goto | InstKind::ReturnVoid | InstKind::Exit => {}
        }

        if inst.ty != PrimitiveType::Void {
            write!(f, " [{}]", inst.ty)?;
        }
        Ok(())
    }

    fn fmt_block_list(&self, f: &mut fmt::Formatter<'_>, label: &str, list: &[BlockRef]) -> fmt::Result {
        if list.is_empty() {
            return Ok(());
        }
        write!(f, " {label} [")?;
        for (i, block) in list.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match self.block(*block).id {
                Some(id) => write!(f, "B{id}")?,
                None => f.write_str("B?")?,
            }
        }
        f.write_str("]")
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &block_ref in &self.order {
            let block = self.block(block_ref);
            write!(f, "B{}", self.block_id(block_ref))?;
            if block_ref == self.entry {
                f.write_str(" (entry)")?;
            } else if block_ref == self.exit {
                f.write_str(" (exit)")?;
            } else if let Some(pc) = block.dex_pc {
                write!(f, " @{pc}")?;
            }
            self.fmt_block_list(f, "pred", &block.predecessors)?;
            self.fmt_block_list(f, "succ", &block.successors)?;
            writeln!(f)?;
            for &inst in &block.instructions {
                f.write_str("  ")?;
                self.fmt_instruction(f, inst)?;
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
