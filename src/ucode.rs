//! Guest GPU microcode input contract.
//!
//! A shader program reaches the translator as a flat stream of fixed-size 8-byte control-flow
//! records plus side tables of already-decoded clause instructions (ALU, vertex fetch, export).
//! The bit-level clause decoders live with the GPU front end; this module only defines the typed
//! views the translator consumes.

use crate::limits::{CF_RECORD_BYTES, MAX_CF_STREAM_BYTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UcodeError {
    pub offset: usize,
    pub message: String,
}

impl std::fmt::Display for UcodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "microcode stream error at byte {}: {}",
            self.offset, self.message
        )
    }
}

impl std::error::Error for UcodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

/// One of the four channels of a guest GPR or attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chan {
    X,
    Y,
    Z,
    W,
}

impl Chan {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::Z),
            3 => Some(Self::W),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::W => 3,
        }
    }

    pub fn name(self) -> char {
        match self {
            Self::X => 'x',
            Self::Y => 'y',
            Self::Z => 'z',
            Self::W => 'w',
        }
    }

    /// The channel `offset` steps past this one, if it stays within `w`.
    pub fn offset(self, offset: u8) -> Option<Self> {
        Self::from_raw(self.raw().checked_add(offset)?)
    }
}

/// Control-flow record opcodes.
///
/// The numeric values match the guest encoding; anything else decodes to `Unknown` and is
/// rejected by the control-flow parser rather than skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfOpcode {
    Nop,
    /// Execute an ALU clause inline.
    Exec,
    /// Execute an ALU clause inline and end the program.
    ExecEnd,
    /// Execute a vertex-fetch (import) clause inline.
    Fetch,
    /// Execute an export clause inline.
    Emit,
    Jump,
    /// Conditional execution of the following record.
    CondExec,
    LoopStart,
    LoopEnd,
    Call,
    Return,
    Unknown(u8),
}

impl CfOpcode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Nop,
            0x01 => Self::Exec,
            0x02 => Self::ExecEnd,
            0x03 => Self::Fetch,
            0x04 => Self::Emit,
            0x10 => Self::Jump,
            0x11 => Self::CondExec,
            0x12 => Self::LoopStart,
            0x13 => Self::LoopEnd,
            0x14 => Self::Call,
            0x15 => Self::Return,
            other => Self::Unknown(other),
        }
    }

    #[deny(unreachable_patterns)]
    pub fn raw(self) -> u8 {
        match self {
            Self::Nop => 0x00,
            Self::Exec => 0x01,
            Self::ExecEnd => 0x02,
            Self::Fetch => 0x03,
            Self::Emit => 0x04,
            Self::Jump => 0x10,
            Self::CondExec => 0x11,
            Self::LoopStart => 0x12,
            Self::LoopEnd => 0x13,
            Self::Call => 0x14,
            Self::Return => 0x15,
            Self::Unknown(raw) => raw,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Exec => "exec",
            Self::ExecEnd => "exec_end",
            Self::Fetch => "fetch",
            Self::Emit => "emit",
            Self::Jump => "jump",
            Self::CondExec => "cond_exec",
            Self::LoopStart => "loop_start",
            Self::LoopEnd => "loop_end",
            Self::Call => "call",
            Self::Return => "return",
            Self::Unknown(_) => "unknown",
        }
    }

    pub fn kind(self) -> CfKind {
        match self {
            Self::Exec | Self::ExecEnd => CfKind::Alu,
            Self::Fetch | Self::Emit => CfKind::Transfer,
            Self::Nop
            | Self::Jump
            | Self::CondExec
            | Self::LoopStart
            | Self::LoopEnd
            | Self::Call
            | Self::Return
            | Self::Unknown(_) => CfKind::Default,
        }
    }
}

/// The three disjoint control-flow record layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfKind {
    /// Default/branch layout: condition, branch target, call/return count.
    Default,
    /// ALU-clause layout: clause address + instruction count.
    Alu,
    /// Export/import-clause layout: clause address + instruction count.
    Transfer,
}

/// One raw 8-byte control-flow record.
///
/// Field layout (little-endian word):
/// - bits 0..8: opcode
/// - bits 8..11 (default layout): condition code, 0 = always
/// - bits 16..32 (default layout): branch target address
/// - bits 32..40 (default layout): call/return count
/// - bits 8..24 (clause layouts): clause address
/// - bits 24..32 (clause layouts): clause instruction count
/// - bit 63: end-of-program flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfInstruction(pub u64);

const CF_EOP_BIT: u64 = 1 << 63;

impl CfInstruction {
    pub fn opcode(self) -> CfOpcode {
        CfOpcode::from_raw((self.0 & 0xFF) as u8)
    }

    /// True when this record ends the program. `exec_end` implies the flag even when the encoder
    /// left the bit clear.
    pub fn end_of_program(self) -> bool {
        self.0 & CF_EOP_BIT != 0 || self.opcode() == CfOpcode::ExecEnd
    }

    pub fn default_view(self) -> CfDefaultView {
        CfDefaultView(self.0)
    }

    pub fn alu_view(self) -> CfAluView {
        CfAluView(self.0)
    }

    pub fn transfer_view(self) -> CfTransferView {
        CfTransferView(self.0)
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn with_end_of_program(self) -> Self {
        Self(self.0 | CF_EOP_BIT)
    }

    // Record constructors, used by tests and by hosts that synthesize programs.

    pub fn nop() -> Self {
        Self(CfOpcode::Nop.raw() as u64)
    }

    pub fn exec(clause_addr: u16, count: u8) -> Self {
        Self::clause(CfOpcode::Exec, clause_addr, count)
    }

    pub fn exec_end(clause_addr: u16, count: u8) -> Self {
        Self::clause(CfOpcode::ExecEnd, clause_addr, count)
    }

    pub fn fetch(clause_addr: u16, count: u8) -> Self {
        Self::clause(CfOpcode::Fetch, clause_addr, count)
    }

    pub fn emit(clause_addr: u16, count: u8) -> Self {
        Self::clause(CfOpcode::Emit, clause_addr, count)
    }

    pub fn jump(target: u16, condition: u8) -> Self {
        Self(
            CfOpcode::Jump.raw() as u64
                | ((condition as u64 & 0x7) << 8)
                | ((target as u64) << 16),
        )
    }

    pub fn call(target: u16, count: u8) -> Self {
        Self(CfOpcode::Call.raw() as u64 | ((target as u64) << 16) | ((count as u64) << 32))
    }

    fn clause(op: CfOpcode, clause_addr: u16, count: u8) -> Self {
        Self(op.raw() as u64 | ((clause_addr as u64) << 8) | ((count as u64) << 24))
    }
}

/// Default/branch layout accessor.
#[derive(Debug, Clone, Copy)]
pub struct CfDefaultView(u64);

impl CfDefaultView {
    pub fn opcode(self) -> CfOpcode {
        CfInstruction(self.0).opcode()
    }

    /// Condition code; 0 means "always".
    pub fn condition(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    pub fn target(self) -> u16 {
        ((self.0 >> 16) & 0xFFFF) as u16
    }

    /// Call depth / return pop count.
    pub fn count(self) -> u8 {
        ((self.0 >> 32) & 0xFF) as u8
    }

    pub fn end_of_program(self) -> bool {
        CfInstruction(self.0).end_of_program()
    }
}

/// ALU-clause layout accessor.
#[derive(Debug, Clone, Copy)]
pub struct CfAluView(u64);

impl CfAluView {
    pub fn opcode(self) -> CfOpcode {
        CfInstruction(self.0).opcode()
    }

    pub fn clause_addr(self) -> u16 {
        ((self.0 >> 8) & 0xFFFF) as u16
    }

    pub fn clause_count(self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }

    pub fn end_of_program(self) -> bool {
        CfInstruction(self.0).end_of_program()
    }
}

/// Export/import-clause layout accessor.
#[derive(Debug, Clone, Copy)]
pub struct CfTransferView(u64);

impl CfTransferView {
    pub fn opcode(self) -> CfOpcode {
        CfInstruction(self.0).opcode()
    }

    pub fn clause_addr(self) -> u16 {
        ((self.0 >> 8) & 0xFFFF) as u16
    }

    pub fn clause_count(self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }

    pub fn end_of_program(self) -> bool {
        CfInstruction(self.0).end_of_program()
    }
}

/// A scalar GPR reference: register index plus channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GprRef {
    pub index: u8,
    pub chan: Chan,
}

impl GprRef {
    pub fn new(index: u8, chan: Chan) -> Self {
        Self { index, chan }
    }
}

impl std::fmt::Display for GprRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}.{}", self.index, self.chan.name())
    }
}

/// ALU clause opcodes, as decoded by the GPU front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Mov,
    Add,
    Sub,
    Mul,
    Min,
    Max,
    /// Float to signed-integer conversion.
    Ftoi,
    /// Signed-integer to float conversion.
    Itof,
    /// Fractional part. Recognized but not yet lowered.
    Frac,
    /// Reciprocal square root. Recognized but not yet lowered.
    Rsq,
}

impl AluOp {
    pub fn raw(self) -> u8 {
        match self {
            Self::Mov => 0x00,
            Self::Add => 0x01,
            Self::Sub => 0x02,
            Self::Mul => 0x03,
            Self::Min => 0x04,
            Self::Max => 0x05,
            Self::Ftoi => 0x06,
            Self::Itof => 0x07,
            Self::Frac => 0x08,
            Self::Rsq => 0x09,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mov => "mov",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Min => "min",
            Self::Max => "max",
            Self::Ftoi => "ftoi",
            Self::Itof => "itof",
            Self::Frac => "frac",
            Self::Rsq => "rsq",
        }
    }
}

/// Source operand of an ALU clause instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AluSrc {
    Gpr(GprRef),
    /// One channel of a uniform constant register.
    Uniform { slot: u16, chan: Chan },
    LiteralF32(f32),
}

/// One decoded ALU clause instruction. Unary ops ignore `b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AluInst {
    pub op: AluOp,
    pub dst: GprRef,
    pub a: AluSrc,
    pub b: AluSrc,
}

/// Byte order of fetched vertex data in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// One decoded vertex-fetch clause instruction.
///
/// Fetches `chan_count` consecutive attribute channels starting at `first_chan` into the
/// matching channels of `dst_gpr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchInst {
    pub dst_gpr: u8,
    pub attr: u16,
    pub first_chan: Chan,
    pub chan_count: u8,
    pub endian: Endian,
}

/// Destination of an export clause instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    Position,
    Param(u16),
}

/// One decoded export clause instruction: writes all four channels of `gpr` to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportInst {
    pub target: ExportTarget,
    pub gpr: u8,
}

/// A complete shader program as handed over by the GPU front end.
#[derive(Debug, Clone, Copy)]
pub struct ShaderProgram<'a> {
    pub stage: ShaderStage,
    /// Raw control-flow stream; length must be a multiple of 8.
    pub cf_bytes: &'a [u8],
    /// ALU clause table, indexed by `CfAluView::clause_addr`.
    pub alu: &'a [AluInst],
    /// Vertex-fetch clause table, indexed by `CfTransferView::clause_addr` of `fetch` records.
    pub fetch: &'a [FetchInst],
    /// Export clause table, indexed by `CfTransferView::clause_addr` of `emit` records.
    pub exports: &'a [ExportInst],
}

impl ShaderProgram<'_> {
    /// Reads the control-flow stream as typed records.
    pub fn cf_records(&self) -> Result<Vec<CfInstruction>, UcodeError> {
        if self.cf_bytes.len() > MAX_CF_STREAM_BYTES {
            return Err(UcodeError {
                offset: 0,
                message: format!(
                    "control-flow stream of {} bytes exceeds the {} byte limit",
                    self.cf_bytes.len(),
                    MAX_CF_STREAM_BYTES
                ),
            });
        }
        if self.cf_bytes.len() % CF_RECORD_BYTES != 0 {
            return Err(UcodeError {
                offset: self.cf_bytes.len(),
                message: format!(
                    "control-flow stream length {} is not a multiple of the {}-byte record size",
                    self.cf_bytes.len(),
                    CF_RECORD_BYTES
                ),
            });
        }

        Ok(self
            .cf_bytes
            .chunks_exact(CF_RECORD_BYTES)
            .map(|chunk| CfInstruction(bytemuck::pod_read_unaligned::<u64>(chunk)))
            .collect())
    }
}

/// Tag component of an [`ExternRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternTag {
    /// One channel of a uniform constant register.
    Uniform,
    /// One or more channels of a vertex attribute.
    Attribute,
    /// The position output.
    Position,
    /// A generic (inter-stage) output.
    Param,
    /// A translator-chosen name for a value crossing a basic-block boundary.
    Local,
}

impl ExternTag {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Uniform),
            2 => Some(Self::Attribute),
            3 => Some(Self::Position),
            4 => Some(Self::Param),
            5 => Some(Self::Local),
            _ => None,
        }
    }

    fn raw(self) -> u8 {
        match self {
            Self::Uniform => 1,
            Self::Attribute => 2,
            Self::Position => 3,
            Self::Param => 4,
            Self::Local => 5,
        }
    }
}

/// An opaque external symbolic location: a tag plus two small indices packed into 64 bits.
///
/// Layout: bits 32..40 tag, bits 16..32 index a, bits 0..16 index b. The translator only ever
/// distinguishes the shapes below; the surrounding system owns the interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternRef(u64);

impl ExternRef {
    fn pack(tag: ExternTag, a: u16, b: u16) -> Self {
        Self(((tag.raw() as u64) << 32) | ((a as u64) << 16) | b as u64)
    }

    pub fn uniform(slot: u16, chan: Chan) -> Self {
        Self::pack(ExternTag::Uniform, slot, chan.raw() as u16)
    }

    pub fn attribute(attr: u16, first_chan: Chan) -> Self {
        Self::pack(ExternTag::Attribute, attr, first_chan.raw() as u16)
    }

    pub fn position() -> Self {
        Self::pack(ExternTag::Position, 0, 0)
    }

    pub fn param(index: u16) -> Self {
        Self::pack(ExternTag::Param, index, 0)
    }

    pub fn local(id: u16) -> Self {
        Self::pack(ExternTag::Local, id, 0)
    }

    pub fn tag(self) -> Option<ExternTag> {
        ExternTag::from_raw(((self.0 >> 32) & 0xFF) as u8)
    }

    pub fn index_a(self) -> u16 {
        ((self.0 >> 16) & 0xFFFF) as u16
    }

    pub fn index_b(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn chan(self) -> Option<Chan> {
        Chan::from_raw(self.index_b() as u8)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ExternRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tag() {
            Some(ExternTag::Uniform) => match self.chan() {
                Some(chan) => write!(f, "uniform[{}].{}", self.index_a(), chan.name()),
                None => write!(f, "uniform[{}].?", self.index_a()),
            },
            Some(ExternTag::Attribute) => match self.chan() {
                Some(chan) => write!(f, "attr[{}].{}", self.index_a(), chan.name()),
                None => write!(f, "attr[{}].?", self.index_a()),
            },
            Some(ExternTag::Position) => write!(f, "position"),
            Some(ExternTag::Param) => write!(f, "param[{}]", self.index_a()),
            Some(ExternTag::Local) => write!(f, "local:{}", self.index_a()),
            None => write!(f, "extern:{:#x}", self.0),
        }
    }
}
