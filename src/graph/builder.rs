// This module implements GraphBuilder, which turns one method's bytecode into a Graph.
// Construction runs in two passes over the code item. The pre-scan validates every
// branch (targets must land on an instruction boundary inside the code), rejects
// multi-way branches, and allocates one block per branch target and per instruction
// following a branch, so translation never has to split a block after the fact. The
// translation pass walks instructions in address order with a current-block cursor:
// reaching a precomputed boundary closes the open block with a fallthrough goto, and
// terminal translations clear the cursor so the unreachable tail up to the next
// boundary is skipped. Register values stay in Local slots (every read is a LoadLocal
// and every write a StoreLocal), the constants 0 and 1 are shared per method, and all
// constants live in the entry block. Any construct without a translation rule aborts
// the build with UnsupportedConstruct and no graph is returned.

//! Bytecode to control-flow graph translation.

use super::{BinaryOp, BlockRef, Graph, InstId, InstKind};
use crate::bytecode::{
    CodeItem, CompilationUnit, Instruction, MethodResolver, Opcode, Operands, PrimitiveType, VReg,
};
use crate::core::{CompilerOptions, UnsupportedConstruct};
use hashbrown::HashMap;
use log::{debug, trace};
use smallvec::SmallVec;

type BuildResult<T> = Result<T, UnsupportedConstruct>;

/// Builds a [`Graph`] for a single method.
pub struct GraphBuilder<'a, R: MethodResolver + ?Sized> {
    unit: &'a CompilationUnit,
    resolver: &'a R,
    options: &'a CompilerOptions,
    graph: Graph,
    locals: Vec<InstId>,
    /// Blocks starting at each branch target / post-branch offset.
    branch_targets: HashMap<u32, BlockRef>,
    current_block: Option<BlockRef>,
    constant0: Option<InstId>,
    constant1: Option<InstId>,
    return_type: PrimitiveType,
}

impl<'a, R: MethodResolver + ?Sized> GraphBuilder<'a, R> {
    pub fn new(unit: &'a CompilationUnit, resolver: &'a R, options: &'a CompilerOptions) -> Self {
        Self {
            unit,
            resolver,
            options,
            graph: Graph::new(),
            locals: Vec::new(),
            branch_targets: HashMap::new(),
            current_block: None,
            constant0: None,
            constant1: None,
            return_type: PrimitiveType::Void,
        }
    }

    /// Translate `code` into a graph, or report the first construct that
    /// cannot be lowered.
    pub fn build(mut self, code: &CodeItem) -> BuildResult<Graph> {
        if code.tries_size > 0 {
            return Err(UnsupportedConstruct::ExceptionHandlers {
                count: code.tries_size,
            });
        }

        let code_units = code.size_in_code_units() as usize;
        let max_code_units = self.options.max_code_units as usize;
        if code_units > max_code_units {
            return Err(UnsupportedConstruct::MethodTooLarge {
                what: "code units",
                actual: code_units,
                limit: max_code_units,
            });
        }

        if code.is_empty() {
            return Err(UnsupportedConstruct::FallsOffEnd { dex_pc: 0 });
        }

        if code.ins_size > code.registers_size {
            return Err(UnsupportedConstruct::RegisterOutOfRange {
                reg: code.ins_size as u32 - 1,
                registers: code.registers_size,
            });
        }

        self.return_type = self.parse_return_type()?;
        self.initialize_locals(code.registers_size);
        self.graph.update_max_out_vregs(code.outs_size);

        self.compute_branch_targets(code)?;
        self.initialize_parameters(code.ins_size)?;

        let mut last_pc = 0;
        for (dex_pc, instruction) in code.instructions() {
            self.maybe_update_current_block(dex_pc);
            self.analyze_instruction(code, instruction, dex_pc)?;
            last_pc = dex_pc;
        }

        if self.current_block.is_some() {
            return Err(UnsupportedConstruct::FallsOffEnd { dex_pc: last_pc });
        }

        // Placed last so it gets the highest id.
        let exit = self.graph.exit_block();
        self.graph.add_block(exit);
        self.graph.add_instruction(exit, InstKind::Exit, PrimitiveType::Void);
        let entry = self.graph.entry_block();
        self.graph.add_instruction(entry, InstKind::Goto, PrimitiveType::Void);

        debug!(
            "built graph for {}: {} blocks, {} instructions",
            self.unit.name,
            self.graph.num_blocks(),
            self.graph.num_instructions()
        );
        Ok(self.graph)
    }

    fn parse_return_type(&self) -> BuildResult<PrimitiveType> {
        self.unit
            .shorty
            .chars()
            .next()
            .and_then(PrimitiveType::from_descriptor)
            .ok_or_else(|| UnsupportedConstruct::MalformedShorty {
                shorty: self.unit.shorty.clone(),
            })
    }

    fn initialize_locals(&mut self, count: u16) {
        self.graph.set_number_of_vregs(count);
        let entry = self.graph.entry_block();
        self.locals = (0..count)
            .map(|reg| {
                self.graph
                    .add_instruction(entry, InstKind::Local { reg }, PrimitiveType::Void)
            })
            .collect();
    }

    /// Bind parameters to the trailing locals, receiver first.
    fn initialize_parameters(&mut self, number_of_parameters: u16) -> BuildResult<()> {
        self.graph.set_number_of_in_vregs(number_of_parameters);
        let entry = self.graph.entry_block();
        let mut locals_index = self.locals.len() - number_of_parameters as usize;
        let mut parameter_index = 0u16;

        let mut types: SmallVec<[PrimitiveType; 8]> = SmallVec::new();
        if !self.unit.is_static {
            types.push(PrimitiveType::Reference);
        }
        for c in self.unit.shorty.chars().skip(1) {
            let ty = PrimitiveType::from_descriptor(c)
                .filter(|ty| *ty != PrimitiveType::Void)
                .ok_or_else(|| UnsupportedConstruct::MalformedShorty {
                    shorty: self.unit.shorty.clone(),
                })?;
            if ty.is_wide() || ty.is_floating_point() {
                return Err(UnsupportedConstruct::ParameterType { shorty: c });
            }
            types.push(ty);
        }

        if types.len() != number_of_parameters as usize {
            return Err(UnsupportedConstruct::MalformedShorty {
                shorty: self.unit.shorty.clone(),
            });
        }

        for ty in types {
            let parameter = self.graph.add_instruction(
                entry,
                InstKind::ParameterValue {
                    index: parameter_index,
                },
                ty,
            );
            parameter_index += 1;
            let local = self.locals[locals_index];
            locals_index += 1;
            self.graph.add_instruction(
                entry,
                InstKind::StoreLocal {
                    local,
                    value: parameter,
                },
                PrimitiveType::Void,
            );
        }
        Ok(())
    }

    /// Allocate a block for every branch target and every instruction
    /// following a branch.
    fn compute_branch_targets(&mut self, code: &CodeItem) -> BuildResult<()> {
        let code_end = code.size_in_code_units();

        let first = self.graph.create_block(Some(0));
        self.branch_targets.insert(0, first);
        let entry = self.graph.entry_block();
        self.graph.add_successor(entry, first);

        for (dex_pc, instruction) in code.instructions() {
            if let Some(reg) = instruction.max_register() {
                if reg >= code.registers_size as u32 {
                    return Err(UnsupportedConstruct::RegisterOutOfRange {
                        reg,
                        registers: code.registers_size,
                    });
                }
            }

            if instruction.opcode().is_switch() {
                return Err(UnsupportedConstruct::MultiWayBranch {
                    opcode: instruction.opcode(),
                    dex_pc,
                });
            }

            if !instruction.is_branch() {
                continue;
            }

            let target = branch_target(code, instruction, dex_pc)?;
            self.block_starting_at(target);

            let next = dex_pc + instruction.size_in_code_units();
            if next < code_end {
                self.block_starting_at(next);
            }
        }

        // Entry and exit come on top of the branch-target blocks.
        let blocks = self.branch_targets.len() + 2;
        if blocks > self.options.max_blocks {
            return Err(UnsupportedConstruct::MethodTooLarge {
                what: "blocks",
                actual: blocks,
                limit: self.options.max_blocks,
            });
        }
        Ok(())
    }

    fn block_starting_at(&mut self, dex_pc: u32) -> BlockRef {
        if let Some(&block) = self.branch_targets.get(&dex_pc) {
            return block;
        }
        let block = self.graph.create_block(Some(dex_pc));
        self.branch_targets.insert(dex_pc, block);
        trace!("block boundary at {dex_pc}");
        block
    }

    fn find_block_starting_at(&self, dex_pc: u32) -> Option<BlockRef> {
        self.branch_targets.get(&dex_pc).copied()
    }

    fn maybe_update_current_block(&mut self, dex_pc: u32) {
        let Some(block) = self.find_block_starting_at(dex_pc) else {
            return;
        };

        if let Some(current) = self.current_block {
            // Branches clear the cursor, so an open block falls through.
            self.graph
                .add_instruction(current, InstKind::Goto, PrimitiveType::Void);
            self.graph.add_successor(current, block);
        }
        let id = self.graph.add_block(block);
        debug!("B{id} starts at offset {dex_pc}");
        self.current_block = Some(block);
    }

    fn analyze_instruction(
        &mut self,
        code: &CodeItem,
        instruction: &Instruction,
        dex_pc: u32,
    ) -> BuildResult<()> {
        let Some(block) = self.current_block else {
            trace!("skipping dead {} at {dex_pc}", instruction.opcode());
            return Ok(());
        };

        let opcode = instruction.opcode();
        let untranslated = || UnsupportedConstruct::Opcode { opcode, dex_pc };

        match (opcode, instruction.operands()) {
            (Opcode::Nop, _) => {}

            (Opcode::Move, &Operands::RegReg { a, b }) => {
                let value = self.load_local(block, b, PrimitiveType::Int);
                self.update_local(block, a, value);
            }

            (Opcode::Const4 | Opcode::Const16, &Operands::RegLiteral { a, literal }) => {
                let constant = self.get_constant(literal);
                self.update_local(block, a, constant);
            }

            (Opcode::ReturnVoid, _) => {
                self.graph
                    .add_instruction(block, InstKind::ReturnVoid, PrimitiveType::Void);
                self.end_block_at_exit(block);
            }

            (Opcode::Return | Opcode::ReturnObject, &Operands::Reg { a }) => {
                let value = self.load_local(block, a, self.return_type);
                self.graph
                    .add_instruction(block, InstKind::Return { value }, PrimitiveType::Void);
                self.end_block_at_exit(block);
            }

            (Opcode::IfEq | Opcode::IfNe, &Operands::RegRegBranch { a, b, .. }) => {
                self.if_22t(code, block, instruction, dex_pc, a, b, opcode == Opcode::IfNe)?;
            }

            (Opcode::Goto | Opcode::Goto16 | Opcode::Goto32, _) => {
                let target = branch_target(code, instruction, dex_pc)?;
                let target = self
                    .find_block_starting_at(target)
                    .ok_or(UnsupportedConstruct::InvalidBranchTarget {
                        dex_pc,
                        target: target as i64,
                    })?;
                self.graph
                    .add_instruction(block, InstKind::Goto, PrimitiveType::Void);
                self.graph.add_successor(block, target);
                self.current_block = None;
            }

            (
                Opcode::InvokeStatic | Opcode::InvokeDirect,
                Operands::Invoke { method_idx, args },
            ) => {
                self.invoke(block, *method_idx, dex_pc, args)?;
            }

            (
                Opcode::InvokeStaticRange | Opcode::InvokeDirectRange,
                &Operands::InvokeRange {
                    method_idx,
                    first,
                    count,
                },
            ) => {
                let args: SmallVec<[VReg; 5]> = (0..count).map(|i| first + i).collect();
                self.invoke(block, method_idx, dex_pc, &args)?;
            }

            (Opcode::AddInt | Opcode::SubInt, &Operands::RegRegReg { a, b, c }) => {
                let first = self.load_local(block, b, PrimitiveType::Int);
                let second = self.load_local(block, c, PrimitiveType::Int);
                self.binop(block, binary_op(opcode), a, first, second);
            }

            (Opcode::AddInt2Addr | Opcode::SubInt2Addr, &Operands::RegReg { a, b }) => {
                let first = self.load_local(block, a, PrimitiveType::Int);
                let second = self.load_local(block, b, PrimitiveType::Int);
                self.binop(block, binary_op(opcode), a, first, second);
            }

            (
                Opcode::AddIntLit16 | Opcode::RsubInt | Opcode::AddIntLit8 | Opcode::RsubIntLit8,
                &Operands::RegRegLiteral { a, b, literal },
            ) => {
                let mut first = self.load_local(block, b, PrimitiveType::Int);
                let mut second = self.get_constant(literal);
                if matches!(opcode, Opcode::RsubInt | Opcode::RsubIntLit8) {
                    std::mem::swap(&mut first, &mut second);
                }
                self.binop(block, binary_op(opcode), a, first, second);
            }

            (Opcode::NewInstance, &Operands::RegIndex { a, index }) => {
                let instance = self.graph.add_instruction(
                    block,
                    InstKind::NewInstance {
                        dex_pc,
                        type_idx: index,
                    },
                    PrimitiveType::Reference,
                );
                self.update_local(block, a, instance);
            }

            _ => return Err(untranslated()),
        }

        trace!("translated {opcode} at {dex_pc}");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn if_22t(
        &mut self,
        code: &CodeItem,
        block: BlockRef,
        instruction: &Instruction,
        dex_pc: u32,
        a: VReg,
        b: VReg,
        is_not: bool,
    ) -> BuildResult<()> {
        let first = self.load_local(block, a, PrimitiveType::Int);
        let second = self.load_local(block, b, PrimitiveType::Int);
        let mut condition = self.graph.add_instruction(
            block,
            InstKind::Equal {
                lhs: first,
                rhs: second,
            },
            PrimitiveType::Boolean,
        );
        if is_not {
            condition = self.graph.add_instruction(
                block,
                InstKind::Not { input: condition },
                PrimitiveType::Boolean,
            );
        }
        self.graph
            .add_instruction(block, InstKind::If { condition }, PrimitiveType::Void);

        let target = branch_target(code, instruction, dex_pc)?;
        let taken = self
            .find_block_starting_at(target)
            .ok_or(UnsupportedConstruct::InvalidBranchTarget {
                dex_pc,
                target: target as i64,
            })?;
        let next = dex_pc + instruction.size_in_code_units();
        let fallthrough = self
            .find_block_starting_at(next)
            .ok_or(UnsupportedConstruct::InvalidBranchTarget {
                dex_pc,
                target: next as i64,
            })?;

        self.graph.add_successor(block, taken);
        self.graph.add_successor(block, fallthrough);
        self.current_block = None;
        Ok(())
    }

    fn invoke(
        &mut self,
        block: BlockRef,
        method_idx: u32,
        dex_pc: u32,
        args: &[VReg],
    ) -> BuildResult<()> {
        let descriptor = self
            .resolver
            .return_descriptor(method_idx)
            .ok_or(UnsupportedConstruct::UnresolvedMethod { method_idx })?;
        let return_type = descriptor.chars().next().and_then(PrimitiveType::from_descriptor);
        if return_type != Some(PrimitiveType::Void) {
            return Err(UnsupportedConstruct::NonVoidInvoke {
                method_idx,
                descriptor: descriptor.to_string(),
            });
        }

        // invoke-direct is lowered like a static call.
        let mut pushes = SmallVec::new();
        for (index, &reg) in args.iter().enumerate() {
            let value = self.load_local(block, reg, PrimitiveType::Int);
            let push = self.graph.add_instruction(
                block,
                InstKind::PushArgument {
                    value,
                    index: index as u16,
                },
                PrimitiveType::Int,
            );
            pushes.push(push);
        }

        self.graph.add_instruction(
            block,
            InstKind::InvokeStatic {
                method_idx,
                dex_pc,
                args: pushes,
            },
            PrimitiveType::Void,
        );
        Ok(())
    }

    fn binop(&mut self, block: BlockRef, op: BinaryOp, dest: VReg, lhs: InstId, rhs: InstId) {
        let result =
            self.graph
                .add_instruction(block, InstKind::Binary { op, lhs, rhs }, PrimitiveType::Int);
        self.update_local(block, dest, result);
    }

    fn end_block_at_exit(&mut self, block: BlockRef) {
        let exit = self.graph.exit_block();
        self.graph.add_successor(block, exit);
        self.current_block = None;
    }

    fn get_constant(&mut self, value: i32) -> InstId {
        let cached = match value {
            0 => self.constant0,
            1 => self.constant1,
            _ => None,
        };
        if let Some(constant) = cached {
            return constant;
        }

        let entry = self.graph.entry_block();
        let constant =
            self.graph
                .add_instruction(entry, InstKind::IntConstant { value }, PrimitiveType::Int);
        match value {
            0 => self.constant0 = Some(constant),
            1 => self.constant1 = Some(constant),
            _ => {}
        }
        constant
    }

    fn update_local(&mut self, block: BlockRef, reg: VReg, value: InstId) {
        let local = self.locals[reg as usize];
        self.graph
            .add_instruction(block, InstKind::StoreLocal { local, value }, PrimitiveType::Void);
    }

    fn load_local(&mut self, block: BlockRef, reg: VReg, ty: PrimitiveType) -> InstId {
        let local = self.locals[reg as usize];
        self.graph
            .add_instruction(block, InstKind::LoadLocal { local }, ty)
    }
}

fn binary_op(opcode: Opcode) -> BinaryOp {
    match opcode {
        Opcode::SubInt | Opcode::SubInt2Addr | Opcode::RsubInt | Opcode::RsubIntLit8 => {
            BinaryOp::Sub
        }
        _ => BinaryOp::Add,
    }
}

/// Absolute target of a branch, checked against the code bounds and
/// instruction boundaries.
fn branch_target(code: &CodeItem, instruction: &Instruction, dex_pc: u32) -> BuildResult<u32> {
    let offset = instruction.branch_offset().unwrap_or(0) as i64;
    let target = dex_pc as i64 + offset;
    let valid = target >= 0
        && target < code.size_in_code_units() as i64
        && code.is_instruction_boundary(target as u32);
    if !valid {
        return Err(UnsupportedConstruct::InvalidBranchTarget { dex_pc, target });
    }
    Ok(target as u32)
}
