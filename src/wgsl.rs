//! WGSL source emission.
//!
//! Two passes over the allocated block: an analysis pass counts reads per register, then the
//! emission pass builds one expression per instruction and either caches it for inlining at its
//! single use site or materializes a named local. The emitter only reads the function; all
//! scratch state lives in a per-compilation [`Emitter`] so concurrent compilations never share
//! buffers.

use std::collections::BTreeSet;
use std::fmt::Write;

use hashbrown::HashMap;

use crate::ir::{
    BasicBlock, ConstValue, DataType, Function, Instr, Op, OpFlags, PhysReg, RegHandle,
};
use crate::limits::DEFAULT_MAX_INLINE_EXPR_LEN;
use crate::ucode::{ExternRef, ExternTag, ShaderStage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgslError {
    pub message: String,
}

impl std::fmt::Display for WgslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WGSL generation error: {}", self.message)
    }
}

impl std::error::Error for WgslError {}

fn err(message: impl Into<String>) -> WgslError {
    WgslError {
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgslOptions {
    /// Expressions at or below this length (in bytes of text) stay candidates for inlining.
    pub max_inline_expr_len: usize,
}

impl Default for WgslOptions {
    fn default() -> Self {
        Self {
            max_inline_expr_len: DEFAULT_MAX_INLINE_EXPR_LEN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WgslOutput {
    pub wgsl: String,
    pub entry_point: &'static str,
}

pub fn generate_wgsl(func: &Function, stage: ShaderStage) -> Result<WgslOutput, WgslError> {
    generate_wgsl_with_options(func, stage, WgslOptions::default())
}

pub fn generate_wgsl_with_options(
    func: &Function,
    stage: ShaderStage,
    options: WgslOptions,
) -> Result<WgslOutput, WgslError> {
    if !func.is_allocated() {
        return Err(err("register allocation must run before emission"));
    }
    if func.blocks.len() != 1 {
        return Err(err(format!(
            "emitting {} blocks requires branch reconstruction, which is not implemented",
            func.blocks.len()
        )));
    }

    let block = &func.blocks[0];
    let mut emitter = Emitter::new(block, stage, options);
    emitter.analyze();
    for instr in &block.instrs {
        emitter.emit_instr(instr)?;
    }
    emitter.finish()
}

fn wgsl_scalar(ty: DataType) -> Result<&'static str, WgslError> {
    match ty {
        DataType::F32 => Ok("f32"),
        DataType::I32 => Ok("i32"),
        DataType::U32 => Ok("u32"),
        DataType::Bool => Ok("bool"),
        DataType::U8 | DataType::U16 | DataType::I8 | DataType::I16 => Err(err(format!(
            "{} registers are not representable in WGSL",
            ty.name()
        ))),
        DataType::U64 | DataType::I64 | DataType::Ptr => Err(err(format!(
            "{} registers are not representable in WGSL",
            ty.name()
        ))),
    }
}

/// Formats a float with an explicit decimal point so generated code stays unambiguous and stable.
fn format_f32(v: f32) -> String {
    let mut s = format!("{v:.8}");
    if let Some(dot) = s.find('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.len() == dot + 1 {
            s.push('0');
        }
    }
    s
}

struct Emitter<'a> {
    block: &'a BasicBlock,
    stage: ShaderStage,
    opts: WgslOptions,
    /// Saturating read count per register table index.
    use_counts: Vec<u8>,
    /// Expressions cached for inline substitution at their single pending use site.
    pending: HashMap<u16, String>,
    /// Locals already declared, with the type they were declared at.
    declared: HashMap<PhysReg, DataType>,
    body: String,
    uses_constants: bool,
    attrs: BTreeSet<u16>,
    params: BTreeSet<u16>,
    writes_position: bool,
}

impl<'a> Emitter<'a> {
    fn new(block: &'a BasicBlock, stage: ShaderStage, opts: WgslOptions) -> Self {
        Self {
            block,
            stage,
            opts,
            use_counts: vec![0; block.regs.len()],
            pending: HashMap::new(),
            declared: HashMap::new(),
            body: String::new(),
            uses_constants: false,
            attrs: BTreeSet::new(),
            params: BTreeSet::new(),
            writes_position: false,
        }
    }

    /// Pass 1: count reads per register so pass 2 can tell single-use values from shared ones.
    fn analyze(&mut self) {
        for instr in &self.block.instrs {
            for &read in instr.reads().as_slice() {
                if read.is_constant() {
                    continue;
                }
                let count = &mut self.use_counts[read.table_index()];
                *count = count.saturating_add(1);
            }
        }
    }

    fn const_literal(&self, handle: RegHandle) -> Result<String, WgslError> {
        let def = self
            .block
            .const_def(handle)
            .map_err(|e| err(e.to_string()))?;
        match def.value {
            ConstValue::F32(v) => Ok(format_f32(v)),
            ConstValue::I32(v) => Ok(format!("{v}i")),
            ConstValue::U32(v) => Ok(format!("{v}u")),
            ConstValue::Bool(v) => Ok(if v { "true" } else { "false" }.to_owned()),
            ConstValue::U64(_) | ConstValue::I64(_) | ConstValue::Ptr(_) => Err(err(format!(
                "{} literals are not representable in WGSL",
                def.ty.name()
            ))),
        }
    }

    /// Renders an operand: a literal for constants, the cached expression for a pending inline
    /// value, or the physical register name.
    fn operand(&mut self, handle: RegHandle) -> Result<String, WgslError> {
        if handle.is_constant() {
            return self.const_literal(handle);
        }
        if let Some(expr) = self.pending.remove(&handle.0) {
            return Ok(expr);
        }
        let info = self
            .block
            .reg_info(handle)
            .map_err(|e| err(e.to_string()))?;
        let phys = info
            .phys
            .ok_or_else(|| err(format!("register {handle} has no physical assignment")))?;
        Ok(phys.to_string())
    }

    /// Decides what happens to an instruction's result expression: cache it for inlining, or
    /// materialize a statement.
    fn sink(&mut self, dst: RegHandle, expr: String, flags: OpFlags) -> Result<(), WgslError> {
        let info = self
            .block
            .reg_info(dst)
            .map_err(|e| err(e.to_string()))?;
        let phys = info
            .phys
            .ok_or_else(|| err(format!("register {dst} has no physical assignment")))?;

        let reads = self.use_counts[dst.table_index()];
        if reads <= 1
            && expr.len() <= self.opts.max_inline_expr_len
            && !flags.contains(OpFlags::NEVER_INLINE)
        {
            self.pending.insert(dst.0, expr);
            return Ok(());
        }

        match self.declared.get(&phys) {
            None => {
                let ty = wgsl_scalar(info.ty)?;
                self.declared.insert(phys, info.ty);
                let _ = writeln!(self.body, "  var {phys}: {ty} = {expr};");
            }
            Some(&declared_ty) if declared_ty == info.ty => {
                let _ = writeln!(self.body, "  {phys} = {expr};");
            }
            Some(&declared_ty) => {
                return Err(err(format!(
                    "physical register {phys} reused with mismatched types {} and {}",
                    declared_ty.name(),
                    info.ty.name()
                )));
            }
        }
        Ok(())
    }

    fn emit_instr(&mut self, instr: &Instr) -> Result<(), WgslError> {
        match *instr {
            Instr::Two { op, dst, src } => {
                let a = self.operand(src)?;
                let expr = match op {
                    Op::Mov => a,
                    Op::Bitcast => {
                        let ty = self
                            .block
                            .reg_info(dst)
                            .map_err(|e| err(e.to_string()))?
                            .ty;
                        format!("bitcast<{}>({a})", wgsl_scalar(ty)?)
                    }
                    Op::Swap => {
                        let ty = self
                            .block
                            .value_type(src)
                            .map_err(|e| err(e.to_string()))?;
                        if ty != DataType::U32 {
                            return Err(err(format!(
                                "byte swap of {} is not supported in WGSL output",
                                ty.name()
                            )));
                        }
                        format!(
                            "((({a}) << 24u) | ((({a}) << 8u) & 0xff0000u) | \
                             ((({a}) >> 8u) & 0xff00u) | (({a}) >> 24u))"
                        )
                    }
                    Op::Ftoi => format!("i32({a})"),
                    Op::Itof => format!("f32({a})"),
                    _ => return Err(err(format!("{} is not a two-register op", op.name()))),
                };
                self.sink(dst, expr, op.flags())
            }
            Instr::Three {
                op,
                dst,
                src0,
                src1,
            } => {
                let a = self.operand(src0)?;
                let b = self.operand(src1)?;
                let expr = match op {
                    Op::Add => format!("({a} + {b})"),
                    Op::Sub => format!("({a} - {b})"),
                    Op::Mul => format!("({a} * {b})"),
                    Op::Div => format!("({a} / {b})"),
                    Op::Min => format!("min({a}, {b})"),
                    Op::Max => format!("max({a}, {b})"),
                    _ => return Err(err(format!("{} is not a three-register op", op.name()))),
                };
                self.sink(dst, expr, op.flags())
            }
            Instr::Import { dst, source } => self.emit_import(dst.as_slice(), source),
            Instr::Export { src, target } => self.emit_export(src.as_slice(), target),
        }
    }

    /// Lowers an import to a uniform/input access expression. The result participates in the
    /// same inlining decision as any computed expression.
    fn emit_import(&mut self, dsts: &[RegHandle], source: ExternRef) -> Result<(), WgslError> {
        match source.tag() {
            Some(ExternTag::Uniform) => {
                if dsts.len() != 1 {
                    return Err(err(format!(
                        "uniform import fills exactly one register, got {}",
                        dsts.len()
                    )));
                }
                let chan = source
                    .chan()
                    .ok_or_else(|| err(format!("{source} has an invalid channel")))?;
                self.uses_constants = true;
                let expr = format!("constants.c[{}].{}", source.index_a(), chan.name());
                self.sink(dsts[0], expr, OpFlags::empty())
            }
            Some(ExternTag::Attribute) => {
                let first = source
                    .chan()
                    .ok_or_else(|| err(format!("{source} has an invalid channel")))?;
                let attr = source.index_a();
                self.attrs.insert(attr);
                for (k, &dst) in dsts.iter().enumerate() {
                    let chan = first.offset(k as u8).ok_or_else(|| {
                        err(format!("attribute import of {} registers spans past .w", dsts.len()))
                    })?;
                    let base = format!("input.v{attr}.{}", chan.name());
                    let ty = self
                        .block
                        .reg_info(dst)
                        .map_err(|e| err(e.to_string()))?
                        .ty;
                    let expr = match ty {
                        DataType::F32 => base,
                        // Raw-word fetches reinterpret the attribute bits.
                        DataType::U32 => format!("bitcast<u32>({base})"),
                        DataType::I32 => format!("bitcast<i32>({base})"),
                        other => {
                            return Err(err(format!(
                                "attribute import into a {} register is not supported",
                                other.name()
                            )))
                        }
                    };
                    self.sink(dst, expr, OpFlags::empty())?;
                }
                Ok(())
            }
            _ => Err(err(format!("{source} is not an importable location"))),
        }
    }

    /// Exports always materialize a statement: there is no later use site to defer to.
    fn emit_export(&mut self, srcs: &[RegHandle], target: ExternRef) -> Result<(), WgslError> {
        match target.tag() {
            Some(ExternTag::Position) => {
                if self.stage != ShaderStage::Vertex {
                    return Err(err("position export outside a vertex program"));
                }
                if srcs.len() != 4 {
                    return Err(err(format!(
                        "position export expects exactly 4 operands, got {}",
                        srcs.len()
                    )));
                }
                let args = self.export_args(srcs, "position")?;
                self.writes_position = true;
                let _ = writeln!(self.body, "  out.pos = vec4<f32>({args});");
                Ok(())
            }
            Some(ExternTag::Param) => {
                if srcs.len() != 4 {
                    return Err(err(format!(
                        "param export expects exactly 4 operands, got {}",
                        srcs.len()
                    )));
                }
                let index = target.index_a();
                let args = self.export_args(srcs, "param")?;
                self.params.insert(index);
                let _ = writeln!(self.body, "  out.o{index} = vec4<f32>({args});");
                Ok(())
            }
            _ => Err(err(format!("{target} is not an exportable location"))),
        }
    }

    fn export_args(&mut self, srcs: &[RegHandle], what: &str) -> Result<String, WgslError> {
        let mut args = String::new();
        for (k, &src) in srcs.iter().enumerate() {
            let ty = self
                .block
                .value_type(src)
                .map_err(|e| err(e.to_string()))?;
            if ty != DataType::F32 {
                return Err(err(format!(
                    "{what} export operand {k} must be f32, got {}",
                    ty.name()
                )));
            }
            if k > 0 {
                args.push_str(", ");
            }
            args.push_str(&self.operand(src)?);
        }
        Ok(args)
    }

    /// Assembles the final module: bindings, IO structs, and the single entry point.
    fn finish(self) -> Result<WgslOutput, WgslError> {
        let mut wgsl = String::new();

        if self.uses_constants {
            wgsl.push_str("struct Constants {\n  c: array<vec4<f32>, 256>,\n}\n\n");
            wgsl.push_str("@group(0) @binding(0) var<uniform> constants: Constants;\n\n");
        }

        let entry_point = match self.stage {
            ShaderStage::Vertex => "vs_main",
            ShaderStage::Pixel => "fs_main",
        };

        let has_inputs = !self.attrs.is_empty();
        let input_struct = match self.stage {
            ShaderStage::Vertex => "VsInput",
            ShaderStage::Pixel => "FsIn",
        };
        if has_inputs {
            let _ = writeln!(wgsl, "struct {input_struct} {{");
            for attr in &self.attrs {
                let _ = writeln!(wgsl, "  @location({attr}) v{attr}: vec4<f32>,");
            }
            wgsl.push_str("}\n\n");
        }

        match self.stage {
            ShaderStage::Vertex => {
                wgsl.push_str("struct VsOut {\n  @builtin(position) pos: vec4<f32>,\n");
                for param in &self.params {
                    let _ = writeln!(wgsl, "  @location({param}) o{param}: vec4<f32>,");
                }
                wgsl.push_str("}\n\n");

                if has_inputs {
                    wgsl.push_str("@vertex\nfn vs_main(input: VsInput) -> VsOut {\n");
                } else {
                    wgsl.push_str("@vertex\nfn vs_main() -> VsOut {\n");
                }
                wgsl.push_str("  var out: VsOut;\n");
                wgsl.push_str(&self.body);
                wgsl.push_str("  return out;\n}\n");
            }
            ShaderStage::Pixel => {
                let has_outputs = !self.params.is_empty();
                if has_outputs {
                    wgsl.push_str("struct FsOut {\n");
                    for param in &self.params {
                        let _ = writeln!(wgsl, "  @location({param}) o{param}: vec4<f32>,");
                    }
                    wgsl.push_str("}\n\n");
                }

                let signature = match (has_inputs, has_outputs) {
                    (true, true) => "@fragment\nfn fs_main(input: FsIn) -> FsOut {\n",
                    (true, false) => "@fragment\nfn fs_main(input: FsIn) {\n",
                    (false, true) => "@fragment\nfn fs_main() -> FsOut {\n",
                    (false, false) => "@fragment\nfn fs_main() {\n",
                };
                wgsl.push_str(signature);
                if has_outputs {
                    wgsl.push_str("  var out: FsOut;\n");
                }
                wgsl.push_str(&self.body);
                if has_outputs {
                    wgsl.push_str("  return out;\n");
                }
                wgsl.push_str("}\n");
            }
        }

        Ok(WgslOutput { wgsl, entry_point })
    }
}
