//! Construction API for IR functions.
//!
//! Two layers: [`BlockBuilder`] appends typed instructions to one basic block and owns the type
//! checks each instruction form requires; [`FunctionBuilder`] manages block creation by symbolic
//! name, branch-target declaration, and the `finish()` step that resolves every declared target
//! into a direct successor link.

use hashbrown::HashMap;

use crate::ir::{
    BasicBlock, BlockId, ConstValue, DataType, Function, Instr, IrError, Op, RegHandle, RegList,
};
use crate::ucode::ExternRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    /// Name of the block under construction, when one was open.
    pub block: Option<String>,
    pub message: String,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.block {
            Some(block) => write!(f, "IR build error in block `{block}`: {}", self.message),
            None => write!(f, "IR build error: {}", self.message),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<IrError> for BuildError {
    fn from(e: IrError) -> Self {
        Self {
            block: None,
            message: e.to_string(),
        }
    }
}

fn err(message: impl Into<String>) -> BuildError {
    BuildError {
        block: None,
        message: message.into(),
    }
}

/// Appends instructions to one basic block, enforcing each form's operand contract.
pub struct BlockBuilder<'a> {
    block: &'a mut BasicBlock,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(block: &'a mut BasicBlock) -> Self {
        Self { block }
    }

    pub fn reg(&mut self, ty: DataType) -> Result<RegHandle, BuildError> {
        Ok(self.block.alloc_reg(ty)?)
    }

    pub fn constant(&mut self, value: ConstValue) -> Result<RegHandle, BuildError> {
        Ok(self.block.alloc_const(value)?)
    }

    pub fn const_f32(&mut self, value: f32) -> Result<RegHandle, BuildError> {
        self.constant(ConstValue::F32(value))
    }

    pub fn const_i32(&mut self, value: i32) -> Result<RegHandle, BuildError> {
        self.constant(ConstValue::I32(value))
    }

    pub fn const_u32(&mut self, value: u32) -> Result<RegHandle, BuildError> {
        self.constant(ConstValue::U32(value))
    }

    pub fn value_type(&self, handle: RegHandle) -> Result<DataType, BuildError> {
        Ok(self.block.value_type(handle)?)
    }

    /// Appends a two-register instruction after checking the op's type contract.
    pub fn push_two(&mut self, op: Op, dst: RegHandle, src: RegHandle) -> Result<(), BuildError> {
        if !op.is_two_reg() {
            return Err(err(format!("{} is not a two-register op", op.name())));
        }
        if dst.is_constant() {
            return Err(err(format!("{} destination must be a register", op.name())));
        }
        let dst_ty = self.value_type(dst)?;
        let src_ty = self.value_type(src)?;
        match op {
            Op::Mov => {
                if dst_ty != src_ty {
                    return Err(err(format!(
                        "mov requires matching types, got {} and {}",
                        dst_ty.name(),
                        src_ty.name()
                    )));
                }
            }
            Op::Bitcast => {
                if dst_ty == src_ty {
                    return Err(err(format!(
                        "bitcast between two {} values is meaningless; use mov",
                        dst_ty.name()
                    )));
                }
                match (dst_ty.bits(), src_ty.bits()) {
                    (Some(d), Some(s)) if d == s => {}
                    _ => {
                        return Err(err(format!(
                            "bitcast requires equal fixed widths, got {} and {}",
                            dst_ty.name(),
                            src_ty.name()
                        )))
                    }
                }
            }
            Op::Swap => {
                if dst_ty != src_ty {
                    return Err(err("swap requires matching types"));
                }
                if !dst_ty.is_integer() || dst_ty.bits() == Some(8) {
                    return Err(err(format!(
                        "swap requires a multi-byte integer type, got {}",
                        dst_ty.name()
                    )));
                }
            }
            Op::Ftoi => {
                if src_ty != DataType::F32 || dst_ty != DataType::I32 {
                    return Err(err(format!(
                        "ftoi converts f32 to i32, got {} to {}",
                        src_ty.name(),
                        dst_ty.name()
                    )));
                }
            }
            Op::Itof => {
                if src_ty != DataType::I32 || dst_ty != DataType::F32 {
                    return Err(err(format!(
                        "itof converts i32 to f32, got {} to {}",
                        src_ty.name(),
                        dst_ty.name()
                    )));
                }
            }
            _ => unreachable!("checked by is_two_reg"),
        }
        self.block.instrs.push(Instr::Two { op, dst, src });
        Ok(())
    }

    /// Appends a three-register instruction after checking that all operands share one type.
    pub fn push_three(
        &mut self,
        op: Op,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    ) -> Result<(), BuildError> {
        if !op.is_three_reg() {
            return Err(err(format!("{} is not a three-register op", op.name())));
        }
        if dst.is_constant() {
            return Err(err(format!("{} destination must be a register", op.name())));
        }
        let dst_ty = self.value_type(dst)?;
        let a_ty = self.value_type(src0)?;
        let b_ty = self.value_type(src1)?;
        if dst_ty != a_ty || dst_ty != b_ty {
            return Err(err(format!(
                "{} requires one operand type, got {}, {}, {}",
                op.name(),
                dst_ty.name(),
                a_ty.name(),
                b_ty.name()
            )));
        }
        if !dst_ty.is_integer() && !dst_ty.is_float() {
            return Err(err(format!(
                "{} is not defined for {} values",
                op.name(),
                dst_ty.name()
            )));
        }
        self.block.instrs.push(Instr::Three {
            op,
            dst,
            src0,
            src1,
        });
        Ok(())
    }

    pub fn mov(&mut self, dst: RegHandle, src: RegHandle) -> Result<(), BuildError> {
        self.push_two(Op::Mov, dst, src)
    }

    pub fn bitcast(&mut self, dst: RegHandle, src: RegHandle) -> Result<(), BuildError> {
        self.push_two(Op::Bitcast, dst, src)
    }

    pub fn swap(&mut self, dst: RegHandle, src: RegHandle) -> Result<(), BuildError> {
        self.push_two(Op::Swap, dst, src)
    }

    pub fn ftoi(&mut self, dst: RegHandle, src: RegHandle) -> Result<(), BuildError> {
        self.push_two(Op::Ftoi, dst, src)
    }

    pub fn itof(&mut self, dst: RegHandle, src: RegHandle) -> Result<(), BuildError> {
        self.push_two(Op::Itof, dst, src)
    }

    pub fn add(
        &mut self,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    ) -> Result<(), BuildError> {
        self.push_three(Op::Add, dst, src0, src1)
    }

    pub fn sub(
        &mut self,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    ) -> Result<(), BuildError> {
        self.push_three(Op::Sub, dst, src0, src1)
    }

    pub fn mul(
        &mut self,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    ) -> Result<(), BuildError> {
        self.push_three(Op::Mul, dst, src0, src1)
    }

    pub fn div(
        &mut self,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    ) -> Result<(), BuildError> {
        self.push_three(Op::Div, dst, src0, src1)
    }

    pub fn min(
        &mut self,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    ) -> Result<(), BuildError> {
        self.push_three(Op::Min, dst, src0, src1)
    }

    pub fn max(
        &mut self,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    ) -> Result<(), BuildError> {
        self.push_three(Op::Max, dst, src0, src1)
    }

    /// Appends a multi-register import from an external location.
    pub fn push_import(
        &mut self,
        dsts: &[RegHandle],
        source: ExternRef,
    ) -> Result<(), BuildError> {
        for &dst in dsts {
            if dst.is_constant() {
                return Err(err("import destinations must be registers"));
            }
            self.value_type(dst)?;
        }
        let dst = RegList::from_slice(dsts)
            .ok_or_else(|| err(format!("import takes 1..=4 registers, got {}", dsts.len())))?;
        self.block.instrs.push(Instr::Import { dst, source });
        Ok(())
    }

    /// Appends a multi-register export to an external location.
    pub fn push_export(
        &mut self,
        srcs: &[RegHandle],
        target: ExternRef,
    ) -> Result<(), BuildError> {
        for &src in srcs {
            self.value_type(src)?;
        }
        let src = RegList::from_slice(srcs)
            .ok_or_else(|| err(format!("export takes 1..=4 registers, got {}", srcs.len())))?;
        self.block.instrs.push(Instr::Export { src, target });
        Ok(())
    }

    /// Declares `reg` as arriving from a predecessor block under `name`.
    pub fn import_value(&mut self, reg: RegHandle, name: ExternRef) -> Result<(), BuildError> {
        if reg.is_constant() {
            return Err(err("imported values must be registers"));
        }
        self.block.reg_info(reg)?;
        if self.block.imports.iter().any(|(_, n)| *n == name) {
            return Err(err(format!("duplicate import name {name}")));
        }
        self.block.imports.push((reg, name));
        Ok(())
    }

    /// Declares `reg` as leaving for successor blocks under `name`.
    pub fn export_value(&mut self, reg: RegHandle, name: ExternRef) -> Result<(), BuildError> {
        if reg.is_constant() {
            return Err(err("exported values must be registers"));
        }
        self.block.reg_info(reg)?;
        if self.block.exports.iter().any(|(_, n)| *n == name) {
            return Err(err(format!("duplicate export name {name}")));
        }
        self.block.exports.push((reg, name));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    Taken,
    NotTaken,
}

#[derive(Debug)]
struct PendingBranch {
    from: BlockId,
    kind: BranchKind,
    target: String,
}

/// Builds a whole [`Function`], wiring branch targets by symbolic name.
///
/// Targets declared with [`branch_taken`](Self::branch_taken) /
/// [`branch_not_taken`](Self::branch_not_taken) are resolved in [`finish`](Self::finish); a
/// declared name with no matching block fails there, as does a block unreachable from the entry
/// set.
pub struct FunctionBuilder {
    func: Function,
    names: HashMap<String, BlockId>,
    order: Vec<String>,
    current: Option<(String, BlockId)>,
    branches: Vec<PendingBranch>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self {
            func: Function::new(),
            names: HashMap::new(),
            order: Vec::new(),
            current: None,
            branches: Vec::new(),
        }
    }

    fn in_block(&self, message: impl Into<String>) -> BuildError {
        BuildError {
            block: self.current.as_ref().map(|(name, _)| name.clone()),
            message: message.into(),
        }
    }

    /// Opens a new named block and makes it current.
    pub fn begin_block(&mut self, name: &str) -> Result<BlockId, BuildError> {
        if let Some((open, _)) = &self.current {
            return Err(err(format!(
                "begin_block(`{name}`) while block `{open}` is still open"
            )));
        }
        if self.names.contains_key(name) {
            return Err(err(format!("duplicate block name `{name}`")));
        }
        let id = self.func.add_block();
        self.names.insert(name.to_owned(), id);
        self.order.push(name.to_owned());
        self.current = Some((name.to_owned(), id));
        Ok(id)
    }

    /// Closes the current block.
    pub fn end_block(&mut self) -> Result<(), BuildError> {
        if self.current.take().is_none() {
            return Err(err("end_block without an open block"));
        }
        Ok(())
    }

    /// Builder for the current block's contents.
    pub fn block(&mut self) -> Result<BlockBuilder<'_>, BuildError> {
        let id = self
            .current
            .as_ref()
            .map(|(_, id)| *id)
            .ok_or_else(|| err("no block is open"))?;
        let block = self.func.block_mut(id)?;
        Ok(BlockBuilder::new(block))
    }

    /// Declares the current block's branch-taken successor by name.
    pub fn branch_taken(&mut self, target: &str) -> Result<(), BuildError> {
        self.declare_branch(BranchKind::Taken, target)
    }

    /// Declares the current block's fall-through successor by name.
    pub fn branch_not_taken(&mut self, target: &str) -> Result<(), BuildError> {
        self.declare_branch(BranchKind::NotTaken, target)
    }

    fn declare_branch(&mut self, kind: BranchKind, target: &str) -> Result<(), BuildError> {
        let from = match &self.current {
            Some((_, id)) => *id,
            None => return Err(err("branch target declared outside a block")),
        };
        if self
            .branches
            .iter()
            .any(|b| b.from == from && b.kind == kind)
        {
            return Err(self.in_block("successor declared twice"));
        }
        self.branches.push(PendingBranch {
            from,
            kind,
            target: target.to_owned(),
        });
        Ok(())
    }

    /// Marks the current block as a function entry.
    pub fn mark_entry(&mut self) -> Result<(), BuildError> {
        let id = match &self.current {
            Some((_, id)) => *id,
            None => return Err(err("mark_entry outside a block")),
        };
        if !self.func.entry.contains(&id) {
            self.func.entry.push(id);
        }
        Ok(())
    }

    /// Marks the current block as a function exit.
    pub fn mark_exit(&mut self) -> Result<(), BuildError> {
        let id = match &self.current {
            Some((_, id)) => *id,
            None => return Err(err("mark_exit outside a block")),
        };
        if !self.func.exit.contains(&id) {
            self.func.exit.push(id);
        }
        Ok(())
    }

    /// Resolves all declared branch targets and validates the block graph.
    pub fn finish(mut self) -> Result<Function, BuildError> {
        if let Some((open, _)) = &self.current {
            return Err(err(format!("finish() while block `{open}` is still open")));
        }
        if self.func.entry.is_empty() {
            return Err(err("function has no entry block"));
        }

        for branch in &self.branches {
            let target = *self.names.get(&branch.target).ok_or_else(|| {
                err(format!(
                    "branch target `{}` does not name a block",
                    branch.target
                ))
            })?;
            let block = self.func.block_mut(branch.from)?;
            match branch.kind {
                BranchKind::Taken => block.taken = Some(target),
                BranchKind::NotTaken => block.not_taken = Some(target),
            }
        }

        // Every block must be reachable from a declared entry.
        let mut reachable = vec![false; self.func.blocks.len()];
        let mut stack: Vec<BlockId> = self.func.entry.clone();
        while let Some(id) = stack.pop() {
            let seen = &mut reachable[id.index()];
            if *seen {
                continue;
            }
            *seen = true;
            let block = self.func.block(id)?;
            if let Some(taken) = block.taken {
                stack.push(taken);
            }
            if let Some(not_taken) = block.not_taken {
                stack.push(not_taken);
            }
        }
        for (name, &id) in self.order.iter().map(|n| (n, &self.names[n])) {
            if !reachable[id.index()] {
                return Err(err(format!(
                    "block `{name}` is unreachable from the entry set"
                )));
            }
        }

        Ok(self.func)
    }
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
