//! Typed intermediate representation for translated shader programs.
//!
//! A [`Function`] owns an arena of [`BasicBlock`]s indexed by [`BlockId`]. Each block owns its
//! instruction list, a register table, a constant table, and the ordered import/export lists that
//! carry values across block boundaries by symbolic name. Register handles are block-scoped; a
//! handle from one block means nothing in another.

use thiserror::Error;

use crate::limits::BLOCK_HANDLE_SPLIT;
use crate::ucode::ExternRef;

pub mod builder;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("basic block register table is full ({BLOCK_HANDLE_SPLIT:#x} registers)")]
    RegisterSpaceExhausted,
    #[error("basic block constant table is full ({BLOCK_HANDLE_SPLIT:#x} constants)")]
    ConstantSpaceExhausted,
    #[error("handle {0:#06x} does not name a register or constant in this block")]
    UnknownHandle(u16),
    #[error("block id {0} is out of range for this function")]
    UnknownBlock(u32),
}

/// Value kinds. Every register and constant carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// 32-bit float. A 64-bit float type is reserved but not defined until a target needs it.
    F32,
    /// Target-dependent pointer width.
    Ptr,
    /// Target-dependent boolean representation.
    Bool,
}

impl DataType {
    /// Bit width, where it is target-independent.
    pub fn bits(self) -> Option<u32> {
        match self {
            Self::U8 | Self::I8 => Some(8),
            Self::U16 | Self::I16 => Some(16),
            Self::U32 | Self::I32 | Self::F32 => Some(32),
            Self::U64 | Self::I64 => Some(64),
            Self::Ptr | Self::Bool => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::U8
                | Self::U16
                | Self::U32
                | Self::U64
                | Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32)
    }

    /// The register class a value of this type allocates from.
    pub fn class(self) -> RegClass {
        match self {
            Self::F32 => RegClass::Float,
            Self::Bool => RegClass::Bool,
            Self::U8
            | Self::U16
            | Self::U32
            | Self::U64
            | Self::I8
            | Self::I16
            | Self::I32
            | Self::I64
            | Self::Ptr => RegClass::Int,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::Ptr => "ptr",
            Self::Bool => "bool",
        }
    }
}

/// Physical register classes. Targets describe their register file per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    Int,
    Float,
    Bool,
}

impl RegClass {
    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }

    /// Short prefix used when rendering physical register names.
    pub fn prefix(self) -> char {
        match self {
            Self::Int => 'i',
            Self::Float => 'f',
            Self::Bool => 'b',
        }
    }
}

/// A physical register (or, for unlimited targets, a named local slot) within one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg {
    pub class: RegClass,
    pub index: u16,
}

impl std::fmt::Display for PhysReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.class.prefix(), self.index)
    }
}

/// A block-scoped value handle.
///
/// Handles below [`BLOCK_HANDLE_SPLIT`] index the owning block's register table; handles at or
/// above it index the constant table. The split means a handle is only meaningful relative to the
/// block that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegHandle(pub u16);

impl RegHandle {
    pub(crate) fn register(index: u16) -> Self {
        debug_assert!(index < BLOCK_HANDLE_SPLIT);
        Self(index)
    }

    pub(crate) fn constant(index: u16) -> Self {
        debug_assert!(index < BLOCK_HANDLE_SPLIT);
        Self(BLOCK_HANDLE_SPLIT + index)
    }

    pub fn is_constant(self) -> bool {
        self.0 >= BLOCK_HANDLE_SPLIT
    }

    /// Index into the owning block's register or constant table.
    pub fn table_index(self) -> usize {
        (self.0 & (BLOCK_HANDLE_SPLIT - 1)) as usize
    }
}

impl std::fmt::Display for RegHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_constant() {
            write!(f, "k{}", self.table_index())
        } else {
            write!(f, "v{}", self.table_index())
        }
    }
}

/// One register table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegInfo {
    pub ty: DataType,
    /// Element count; 1 for scalars. Wider SIMD values are an extension point, not supported yet.
    pub count: u8,
    /// Physical assignment, filled in by register allocation.
    pub phys: Option<PhysReg>,
}

/// A literal constant value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    Ptr(u64),
    Bool(bool),
}

impl ConstValue {
    pub fn data_type(self) -> DataType {
        match self {
            Self::U32(_) => DataType::U32,
            Self::U64(_) => DataType::U64,
            Self::I32(_) => DataType::I32,
            Self::I64(_) => DataType::I64,
            Self::F32(_) => DataType::F32,
            Self::Ptr(_) => DataType::Ptr,
            Self::Bool(_) => DataType::Bool,
        }
    }
}

/// One constant table entry. Constants never receive a physical register; the emitter renders
/// them as literals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstDef {
    pub ty: DataType,
    pub count: u8,
    pub value: ConstValue,
}

bitflags::bitflags! {
    /// Static attributes of an [`Op`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        /// The emitter must always materialize this op's result as a named local, never inline
        /// its expression at the use site.
        const NEVER_INLINE = 1 << 0;
    }
}

/// IR opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Two-register forms.
    Mov,
    /// Reinterpret the bits of a value as a different type of the same width.
    Bitcast,
    /// Byte swap of a multi-byte integer.
    Swap,
    /// Float to signed-integer conversion.
    Ftoi,
    /// Signed-integer to float conversion.
    Itof,

    // Three-register forms.
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mov => "mov",
            Self::Bitcast => "bitcast",
            Self::Swap => "swap",
            Self::Ftoi => "ftoi",
            Self::Itof => "itof",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    pub fn flags(self) -> OpFlags {
        match self {
            Self::Swap => OpFlags::NEVER_INLINE,
            _ => OpFlags::empty(),
        }
    }

    pub fn is_two_reg(self) -> bool {
        matches!(
            self,
            Self::Mov | Self::Bitcast | Self::Swap | Self::Ftoi | Self::Itof
        )
    }

    pub fn is_three_reg(self) -> bool {
        !self.is_two_reg()
    }
}

/// Maximum register count of the import/export instruction forms.
pub const MAX_TRANSFER_REGS: usize = 4;

/// A fixed-capacity register list used by the import/export instruction forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegList {
    regs: [RegHandle; MAX_TRANSFER_REGS],
    len: u8,
}

impl RegList {
    /// Builds a list from a slice of 1..=4 handles. Returns `None` outside that range.
    pub fn from_slice(regs: &[RegHandle]) -> Option<Self> {
        if regs.is_empty() || regs.len() > MAX_TRANSFER_REGS {
            return None;
        }
        let mut out = Self {
            regs: [RegHandle(0); MAX_TRANSFER_REGS],
            len: regs.len() as u8,
        };
        out.regs[..regs.len()].copy_from_slice(regs);
        Some(out)
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[RegHandle] {
        &self.regs[..self.len as usize]
    }
}

/// One IR instruction, tagged by form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    /// Result plus one operand: moves, bitcasts, byte swaps, conversions.
    Two {
        op: Op,
        dst: RegHandle,
        src: RegHandle,
    },
    /// Result plus two operands: arithmetic.
    Three {
        op: Op,
        dst: RegHandle,
        src0: RegHandle,
        src1: RegHandle,
    },
    /// Fill 1..=4 destination registers from a named external location.
    Import { dst: RegList, source: ExternRef },
    /// Write 1..=4 source registers to a named external location.
    Export { src: RegList, target: ExternRef },
}

impl Instr {
    /// Registers read by this instruction, in operand order.
    pub fn reads(&self) -> RegList {
        match self {
            Self::Two { src, .. } => RegList::from_slice(&[*src]).unwrap_or_else(|| unreachable!()),
            Self::Three { src0, src1, .. } => {
                RegList::from_slice(&[*src0, *src1]).unwrap_or_else(|| unreachable!())
            }
            Self::Import { .. } => RegList {
                regs: [RegHandle(0); MAX_TRANSFER_REGS],
                len: 0,
            },
            Self::Export { src, .. } => *src,
        }
    }

    /// Registers written by this instruction, in operand order.
    pub fn writes(&self) -> RegList {
        match self {
            Self::Two { dst, .. } | Self::Three { dst, .. } => {
                RegList::from_slice(&[*dst]).unwrap_or_else(|| unreachable!())
            }
            Self::Import { dst, .. } => *dst,
            Self::Export { .. } => RegList {
                regs: [RegHandle(0); MAX_TRANSFER_REGS],
                len: 0,
            },
        }
    }
}

/// Index of a basic block within its owning [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A straight-line sequence of instructions plus the value tables its handles index.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instrs: Vec<Instr>,
    pub regs: Vec<RegInfo>,
    pub consts: Vec<ConstDef>,
    /// Values arriving from predecessor blocks, in arrival order, keyed by external name.
    pub imports: Vec<(RegHandle, ExternRef)>,
    /// Values leaving for successor blocks, in departure order, keyed by external name.
    pub exports: Vec<(RegHandle, ExternRef)>,
    /// Successor when the block's branch is taken.
    pub taken: Option<BlockId>,
    /// Fall-through successor.
    pub not_taken: Option<BlockId>,
}

impl BasicBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh scalar virtual register of type `ty`.
    pub fn alloc_reg(&mut self, ty: DataType) -> Result<RegHandle, IrError> {
        if self.regs.len() >= BLOCK_HANDLE_SPLIT as usize {
            return Err(IrError::RegisterSpaceExhausted);
        }
        let handle = RegHandle::register(self.regs.len() as u16);
        self.regs.push(RegInfo {
            ty,
            count: 1,
            phys: None,
        });
        Ok(handle)
    }

    /// Allocates a fresh scalar constant. Each call interns a new entry; callers that want
    /// identical constants to share a handle must reuse the returned handle themselves.
    pub fn alloc_const(&mut self, value: ConstValue) -> Result<RegHandle, IrError> {
        if self.consts.len() >= BLOCK_HANDLE_SPLIT as usize {
            return Err(IrError::ConstantSpaceExhausted);
        }
        let handle = RegHandle::constant(self.consts.len() as u16);
        self.consts.push(ConstDef {
            ty: value.data_type(),
            count: 1,
            value,
        });
        Ok(handle)
    }

    pub fn reg_info(&self, handle: RegHandle) -> Result<&RegInfo, IrError> {
        if handle.is_constant() {
            return Err(IrError::UnknownHandle(handle.0));
        }
        self.regs
            .get(handle.table_index())
            .ok_or(IrError::UnknownHandle(handle.0))
    }

    pub fn reg_info_mut(&mut self, handle: RegHandle) -> Result<&mut RegInfo, IrError> {
        if handle.is_constant() {
            return Err(IrError::UnknownHandle(handle.0));
        }
        self.regs
            .get_mut(handle.table_index())
            .ok_or(IrError::UnknownHandle(handle.0))
    }

    pub fn const_def(&self, handle: RegHandle) -> Result<&ConstDef, IrError> {
        if !handle.is_constant() {
            return Err(IrError::UnknownHandle(handle.0));
        }
        self.consts
            .get(handle.table_index())
            .ok_or(IrError::UnknownHandle(handle.0))
    }

    /// Type of the value a handle names, register or constant.
    pub fn value_type(&self, handle: RegHandle) -> Result<DataType, IrError> {
        if handle.is_constant() {
            Ok(self.const_def(handle)?.ty)
        } else {
            Ok(self.reg_info(handle)?.ty)
        }
    }
}

/// A compiled shader program: an arena of basic blocks plus entry/exit sets.
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub blocks: Vec<BasicBlock>,
    pub entry: Vec<BlockId>,
    pub exit: Vec<BlockId>,
    allocated: bool,
}

impl Function {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new());
        id
    }

    pub fn block(&self, id: BlockId) -> Result<&BasicBlock, IrError> {
        self.blocks.get(id.index()).ok_or(IrError::UnknownBlock(id.0))
    }

    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut BasicBlock, IrError> {
        self.blocks
            .get_mut(id.index())
            .ok_or(IrError::UnknownBlock(id.0))
    }

    /// True once a register allocator has run. Allocation must not run twice.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub(crate) fn mark_allocated(&mut self) {
        self.allocated = true;
    }
}
