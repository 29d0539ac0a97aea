//! IR generation from partitioned control-flow nodes.
//!
//! Each node becomes one IR basic block. Clause records expand through the block builder: ALU
//! instructions into two/three-register ops, vertex fetches into imports (plus byte swaps for
//! big-endian data), exports into export instructions. A clause opcode with no generation rule
//! fails naming the opcode and its raw value; guessing a translation would corrupt rendering
//! silently.

use hashbrown::HashMap;
use tracing::debug;

use crate::cfg::CfNode;
use crate::ir::builder::{BlockBuilder, BuildError, FunctionBuilder};
use crate::ir::{DataType, Function, RegHandle};
use crate::limits::{MAX_ATTRIBUTE_INDEX, MAX_PARAM_INDEX, MAX_UNIFORM_SLOT};
use crate::ucode::{
    AluInst, AluOp, AluSrc, CfInstruction, CfKind, CfOpcode, Chan, Endian, ExportInst,
    ExportTarget, ExternRef, FetchInst, GprRef, ShaderProgram, ShaderStage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenError {
    /// Control-flow record index the failure was observed at.
    pub address: usize,
    pub message: String,
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "code generation error at record {}: {}",
            self.address, self.message
        )
    }
}

impl std::error::Error for CodegenError {}

fn err(address: usize, message: impl Into<String>) -> CodegenError {
    CodegenError {
        address,
        message: message.into(),
    }
}

fn build_err(address: usize, e: BuildError) -> CodegenError {
    err(address, e.to_string())
}

/// Scalar virtual-register map for the node being generated. Every GPR-channel write binds a
/// fresh virtual register, so reads always see the latest definition.
type GprMap = HashMap<GprRef, RegHandle>;

/// Generates one IR [`Function`] from a partitioned control-flow stream.
pub fn generate(
    program: &ShaderProgram<'_>,
    records: &[CfInstruction],
    nodes: &[CfNode],
) -> Result<Function, CodegenError> {
    if nodes.len() != 1 {
        // Multi-node programs need branch-target resolution between blocks, which is not wired
        // up yet. Fail rather than emit a function with dangling successors.
        return Err(err(
            nodes.get(1).map_or(0, |n| n.start as usize),
            format!(
                "linking {} control-flow nodes is not implemented",
                nodes.len()
            ),
        ));
    }

    let mut fb = FunctionBuilder::new();

    for (node_index, node) in nodes.iter().enumerate() {
        let name = format!("cf{}", node.start);
        fb.begin_block(&name)
            .map_err(|e| build_err(node.start as usize, e))?;
        if node_index == 0 {
            fb.mark_entry()
                .map_err(|e| build_err(node.start as usize, e))?;
        }
        if node.end_of_program {
            fb.mark_exit()
                .map_err(|e| build_err(node.start as usize, e))?;
        }

        let mut gprs = GprMap::new();

        if node_index == 0 && program.stage == ShaderStage::Vertex {
            emit_vertex_prologue(&mut fb, &mut gprs)
                .map_err(|e| build_err(node.start as usize, e))?;
        }

        for address in node.start as usize..node.end as usize {
            let inst = records[address];
            let op = inst.opcode();
            match op.kind() {
                CfKind::Alu => {
                    let view = inst.alu_view();
                    let clause = clause_slice(
                        program.alu,
                        view.clause_addr(),
                        view.clause_count(),
                        address,
                        "ALU",
                    )?;
                    for alu in clause {
                        emit_alu(&mut fb, &mut gprs, alu, address)?;
                    }
                }
                CfKind::Transfer => {
                    let view = inst.transfer_view();
                    match op {
                        CfOpcode::Fetch => {
                            let clause = clause_slice(
                                program.fetch,
                                view.clause_addr(),
                                view.clause_count(),
                                address,
                                "fetch",
                            )?;
                            for fetch in clause {
                                emit_fetch(&mut fb, &mut gprs, fetch, address)?;
                            }
                        }
                        CfOpcode::Emit => {
                            let clause = clause_slice(
                                program.exports,
                                view.clause_addr(),
                                view.clause_count(),
                                address,
                                "export",
                            )?;
                            for export in clause {
                                emit_export(&mut fb, &gprs, export, program.stage, address)?;
                            }
                        }
                        _ => unreachable!("transfer kind covers fetch/emit only"),
                    }
                }
                CfKind::Default => match op {
                    CfOpcode::Nop => {}
                    CfOpcode::Jump | CfOpcode::LoopStart | CfOpcode::LoopEnd => {
                        return Err(err(
                            address,
                            format!(
                                "{} ({:#04x}): branch target linking is not implemented",
                                op.name(),
                                op.raw()
                            ),
                        ));
                    }
                    other => {
                        return Err(err(
                            address,
                            format!(
                                "control-flow opcode {} ({:#04x}) has no generation rule",
                                other.name(),
                                other.raw()
                            ),
                        ));
                    }
                },
            }
        }

        fb.end_block().map_err(|e| build_err(node.start as usize, e))?;
    }

    let func = fb.finish().map_err(|e| build_err(0, e))?;
    debug!(
        blocks = func.blocks.len(),
        stage = ?program.stage,
        "generated IR"
    );
    Ok(func)
}

fn clause_slice<'a, T>(
    table: &'a [T],
    addr: u16,
    count: u8,
    address: usize,
    what: &str,
) -> Result<&'a [T], CodegenError> {
    let start = addr as usize;
    let end = start + count as usize;
    table.get(start..end).ok_or_else(|| {
        err(
            address,
            format!(
                "{what} clause [{start}, {end}) is out of bounds (table holds {})",
                table.len()
            ),
        )
    })
}

/// Placeholder entry setup for vertex programs: zero the four channels of r0.
///
/// TODO: seed r0 from the bound vertex-fetch context registers instead of zeroing it.
fn emit_vertex_prologue(fb: &mut FunctionBuilder, gprs: &mut GprMap) -> Result<(), BuildError> {
    let mut b = fb.block()?;
    let zero = b.const_f32(0.0)?;
    for chan in [Chan::X, Chan::Y, Chan::Z, Chan::W] {
        let reg = b.reg(DataType::F32)?;
        b.mov(reg, zero)?;
        gprs.insert(GprRef::new(0, chan), reg);
    }
    Ok(())
}

fn alu_operand(
    b: &mut BlockBuilder<'_>,
    gprs: &GprMap,
    src: AluSrc,
    address: usize,
) -> Result<RegHandle, CodegenError> {
    match src {
        AluSrc::Gpr(gpr) => gprs
            .get(&gpr)
            .copied()
            .ok_or_else(|| err(address, format!("read of uninitialized GPR {gpr}"))),
        AluSrc::Uniform { slot, chan } => {
            if slot > MAX_UNIFORM_SLOT {
                return Err(err(
                    address,
                    format!("uniform slot {slot} exceeds the {MAX_UNIFORM_SLOT} limit"),
                ));
            }
            let reg = b.reg(DataType::F32).map_err(|e| build_err(address, e))?;
            b.push_import(&[reg], ExternRef::uniform(slot, chan))
                .map_err(|e| build_err(address, e))?;
            Ok(reg)
        }
        AluSrc::LiteralF32(value) => b.const_f32(value).map_err(|e| build_err(address, e)),
    }
}

fn emit_alu(
    fb: &mut FunctionBuilder,
    gprs: &mut GprMap,
    inst: &AluInst,
    address: usize,
) -> Result<(), CodegenError> {
    let mut b = fb.block().map_err(|e| build_err(address, e))?;
    let dst = match inst.op {
        AluOp::Mov => {
            let a = alu_operand(&mut b, gprs, inst.a, address)?;
            let ty = b.value_type(a).map_err(|e| build_err(address, e))?;
            let dst = b.reg(ty).map_err(|e| build_err(address, e))?;
            b.mov(dst, a).map_err(|e| build_err(address, e))?;
            dst
        }
        AluOp::Add | AluOp::Sub | AluOp::Mul | AluOp::Min | AluOp::Max => {
            let a = alu_operand(&mut b, gprs, inst.a, address)?;
            let bb = alu_operand(&mut b, gprs, inst.b, address)?;
            let ty = b.value_type(a).map_err(|e| build_err(address, e))?;
            let dst = b.reg(ty).map_err(|e| build_err(address, e))?;
            let result = match inst.op {
                AluOp::Add => b.add(dst, a, bb),
                AluOp::Sub => b.sub(dst, a, bb),
                AluOp::Mul => b.mul(dst, a, bb),
                AluOp::Min => b.min(dst, a, bb),
                AluOp::Max => b.max(dst, a, bb),
                _ => unreachable!(),
            };
            result.map_err(|e| build_err(address, e))?;
            dst
        }
        AluOp::Ftoi => {
            let a = alu_operand(&mut b, gprs, inst.a, address)?;
            let dst = b.reg(DataType::I32).map_err(|e| build_err(address, e))?;
            b.ftoi(dst, a).map_err(|e| build_err(address, e))?;
            dst
        }
        AluOp::Itof => {
            let a = alu_operand(&mut b, gprs, inst.a, address)?;
            let dst = b.reg(DataType::F32).map_err(|e| build_err(address, e))?;
            b.itof(dst, a).map_err(|e| build_err(address, e))?;
            dst
        }
        AluOp::Frac | AluOp::Rsq => {
            return Err(err(
                address,
                format!(
                    "ALU opcode {} ({:#04x}) has no generation rule",
                    inst.op.name(),
                    inst.op.raw()
                ),
            ));
        }
    };
    gprs.insert(inst.dst, dst);
    Ok(())
}

fn emit_fetch(
    fb: &mut FunctionBuilder,
    gprs: &mut GprMap,
    fetch: &FetchInst,
    address: usize,
) -> Result<(), CodegenError> {
    if fetch.attr > MAX_ATTRIBUTE_INDEX {
        return Err(err(
            address,
            format!(
                "vertex attribute {} exceeds the {MAX_ATTRIBUTE_INDEX} limit",
                fetch.attr
            ),
        ));
    }
    if fetch.chan_count == 0 || fetch.chan_count > 4 {
        return Err(err(
            address,
            format!("fetch channel count {} is outside 1..=4", fetch.chan_count),
        ));
    }
    if fetch.first_chan.offset(fetch.chan_count - 1).is_none() {
        return Err(err(
            address,
            format!(
                "fetch of {} channels from .{} spans past .w",
                fetch.chan_count,
                fetch.first_chan.name()
            ),
        ));
    }

    let mut b = fb.block().map_err(|e| build_err(address, e))?;

    // Big-endian attribute data arrives as raw words: import as u32, byte-swap, then reinterpret
    // as float. Little-endian data imports as f32 directly.
    let import_ty = match fetch.endian {
        Endian::Little => DataType::F32,
        Endian::Big => DataType::U32,
    };
    let mut raw = Vec::with_capacity(fetch.chan_count as usize);
    for _ in 0..fetch.chan_count {
        raw.push(b.reg(import_ty).map_err(|e| build_err(address, e))?);
    }
    b.push_import(&raw, ExternRef::attribute(fetch.attr, fetch.first_chan))
        .map_err(|e| build_err(address, e))?;

    for (k, &imported) in raw.iter().enumerate() {
        let chan = fetch
            .first_chan
            .offset(k as u8)
            .unwrap_or_else(|| unreachable!("range checked above"));
        let value = match fetch.endian {
            Endian::Little => imported,
            Endian::Big => {
                let swapped = b.reg(DataType::U32).map_err(|e| build_err(address, e))?;
                b.swap(swapped, imported).map_err(|e| build_err(address, e))?;
                let float = b.reg(DataType::F32).map_err(|e| build_err(address, e))?;
                b.bitcast(float, swapped).map_err(|e| build_err(address, e))?;
                float
            }
        };
        gprs.insert(GprRef::new(fetch.dst_gpr, chan), value);
    }
    Ok(())
}

fn emit_export(
    fb: &mut FunctionBuilder,
    gprs: &GprMap,
    export: &ExportInst,
    stage: ShaderStage,
    address: usize,
) -> Result<(), CodegenError> {
    let target = match export.target {
        ExportTarget::Position => {
            if stage != ShaderStage::Vertex {
                return Err(err(address, "position export outside a vertex program"));
            }
            ExternRef::position()
        }
        ExportTarget::Param(index) => {
            if index > MAX_PARAM_INDEX {
                return Err(err(
                    address,
                    format!("param export {index} exceeds the {MAX_PARAM_INDEX} limit"),
                ));
            }
            ExternRef::param(index)
        }
    };

    let mut srcs = [RegHandle(0); 4];
    for (k, chan) in [Chan::X, Chan::Y, Chan::Z, Chan::W].into_iter().enumerate() {
        let gpr = GprRef::new(export.gpr, chan);
        srcs[k] = gprs
            .get(&gpr)
            .copied()
            .ok_or_else(|| err(address, format!("export of uninitialized GPR {gpr}")))?;
    }

    let mut b = fb.block().map_err(|e| build_err(address, e))?;
    b.push_export(&srcs, target)
        .map_err(|e| build_err(address, e))?;
    Ok(())
}
