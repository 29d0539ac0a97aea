use kestrel_gpu_shader::ir::builder::FunctionBuilder;
use kestrel_gpu_shader::ir::DataType;
use kestrel_gpu_shader::regalloc::{typed, RegisterSet};
use kestrel_gpu_shader::ucode::{
    AluInst, AluOp, AluSrc, CfInstruction, Chan, Endian, ExportInst, ExportTarget, ExternRef,
    FetchInst, GprRef, ShaderProgram, ShaderStage,
};
use kestrel_gpu_shader::wgsl::{generate_wgsl, WgslOptions};
use kestrel_gpu_shader::{translate_ucode_to_wgsl, translate_ucode_to_wgsl_with_options};
use pretty_assertions::assert_eq;

fn cf_bytes(records: &[CfInstruction]) -> Vec<u8> {
    records.iter().flat_map(|r| r.to_le_bytes()).collect()
}

fn validate(wgsl: &str) {
    let module = naga::front::wgsl::parse_str(wgsl).expect("wgsl parse");
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .expect("wgsl validate");
}

fn mov_zero(gpr: u8, chan: Chan) -> AluInst {
    AluInst {
        op: AluOp::Mov,
        dst: GprRef::new(gpr, chan),
        a: AluSrc::LiteralF32(0.0),
        b: AluSrc::LiteralF32(0.0),
    }
}

/// r1.x = c0.x + 1.0, r1.yzw = 0, export position r1.
fn uniform_plus_one_program(alu: &mut Vec<AluInst>, exports: &mut Vec<ExportInst>) -> Vec<u8> {
    alu.extend([
        AluInst {
            op: AluOp::Add,
            dst: GprRef::new(1, Chan::X),
            a: AluSrc::Uniform {
                slot: 0,
                chan: Chan::X,
            },
            b: AluSrc::LiteralF32(1.0),
        },
        mov_zero(1, Chan::Y),
        mov_zero(1, Chan::Z),
        mov_zero(1, Chan::W),
    ]);
    exports.push(ExportInst {
        target: ExportTarget::Position,
        gpr: 1,
    });
    cf_bytes(&[
        CfInstruction::exec(0, 4),
        CfInstruction::emit(0, 1).with_end_of_program(),
    ])
}

#[test]
fn uniform_plus_one_round_trip_inlines_single_use_values() {
    let mut alu = Vec::new();
    let mut exports = Vec::new();
    let cf = uniform_plus_one_program(&mut alu, &mut exports);
    let program = ShaderProgram {
        stage: ShaderStage::Vertex,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &exports,
    };

    let out = translate_ucode_to_wgsl(&program).unwrap();
    validate(&out.wgsl);

    assert_eq!(out.entry_point, "vs_main");
    assert!(out.wgsl.contains("@vertex"), "{}", out.wgsl);
    // Both the uniform import and the sum have a read count of 1: no temporaries, one export
    // statement carrying the inlined expression plus three literal zeros.
    assert!(
        out.wgsl
            .contains("out.pos = vec4<f32>((constants.c[0].x + 1.0), 0.0, 0.0, 0.0);"),
        "{}",
        out.wgsl
    );
    assert!(!out.wgsl.contains("var f"), "{}", out.wgsl);
}

#[test]
fn emission_is_deterministic_across_fresh_compilations() {
    let mut alu = Vec::new();
    let mut exports = Vec::new();
    let cf = uniform_plus_one_program(&mut alu, &mut exports);
    let program = ShaderProgram {
        stage: ShaderStage::Vertex,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &exports,
    };

    let first = translate_ucode_to_wgsl(&program).unwrap();
    let second = translate_ucode_to_wgsl(&program).unwrap();
    assert_eq!(first.wgsl, second.wgsl);
}

#[test]
fn multi_use_values_materialize_exactly_one_local() {
    let alu = vec![
        AluInst {
            op: AluOp::Add,
            dst: GprRef::new(1, Chan::X),
            a: AluSrc::Uniform {
                slot: 0,
                chan: Chan::X,
            },
            b: AluSrc::LiteralF32(1.0),
        },
        AluInst {
            op: AluOp::Mul,
            dst: GprRef::new(2, Chan::X),
            a: AluSrc::Gpr(GprRef::new(1, Chan::X)),
            b: AluSrc::Gpr(GprRef::new(1, Chan::X)),
        },
        mov_zero(2, Chan::Y),
        mov_zero(2, Chan::Z),
        mov_zero(2, Chan::W),
    ];
    let exports = vec![ExportInst {
        target: ExportTarget::Position,
        gpr: 2,
    }];
    let cf = cf_bytes(&[
        CfInstruction::exec(0, 5),
        CfInstruction::emit(0, 1).with_end_of_program(),
    ]);
    let program = ShaderProgram {
        stage: ShaderStage::Vertex,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &exports,
    };

    let out = translate_ucode_to_wgsl(&program).unwrap();
    validate(&out.wgsl);

    // The sum is read twice, so it gets a named local; the square is read once and inlines.
    assert!(
        out.wgsl.contains("var f5: f32 = (constants.c[0].x + 1.0);"),
        "{}",
        out.wgsl
    );
    assert!(
        out.wgsl.contains("out.pos = vec4<f32>((f5 * f5), 0.0, 0.0, 0.0);"),
        "{}",
        out.wgsl
    );
}

#[test]
fn inline_length_threshold_forces_locals() {
    let mut alu = Vec::new();
    let mut exports = Vec::new();
    let cf = uniform_plus_one_program(&mut alu, &mut exports);
    let program = ShaderProgram {
        stage: ShaderStage::Vertex,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &exports,
    };

    let out = translate_ucode_to_wgsl_with_options(
        &program,
        WgslOptions {
            max_inline_expr_len: 0,
        },
    )
    .unwrap();
    validate(&out.wgsl);

    assert!(
        out.wgsl.contains("var f4: f32 = constants.c[0].x;"),
        "{}",
        out.wgsl
    );
    assert!(
        out.wgsl.contains("out.pos = vec4<f32>(f5, f6, f7, f8);"),
        "{}",
        out.wgsl
    );
}

#[test]
fn big_endian_fetch_swaps_are_never_inlined() {
    let fetch = vec![FetchInst {
        dst_gpr: 1,
        attr: 0,
        first_chan: Chan::X,
        chan_count: 4,
        endian: Endian::Big,
    }];
    let exports = vec![ExportInst {
        target: ExportTarget::Position,
        gpr: 1,
    }];
    let cf = cf_bytes(&[
        CfInstruction::fetch(0, 1),
        CfInstruction::emit(0, 1).with_end_of_program(),
    ]);
    let program = ShaderProgram {
        stage: ShaderStage::Vertex,
        cf_bytes: &cf,
        alu: &[],
        fetch: &fetch,
        exports: &exports,
    };

    let out = translate_ucode_to_wgsl(&program).unwrap();
    validate(&out.wgsl);

    assert!(out.wgsl.contains("@location(0) v0: vec4<f32>"), "{}", out.wgsl);
    // Each byte swap lands in a named u32 local, and only the cheap reinterpret is inlined into
    // the export.
    assert!(out.wgsl.contains("var i4: u32 ="), "{}", out.wgsl);
    assert!(out.wgsl.contains("<< 24u"), "{}", out.wgsl);
    assert!(
        out.wgsl.contains(
            "out.pos = vec4<f32>(bitcast<f32>(i4), bitcast<f32>(i5), bitcast<f32>(i6), bitcast<f32>(i7));"
        ),
        "{}",
        out.wgsl
    );
}

#[test]
fn pixel_programs_emit_a_fragment_entry_point() {
    let alu = vec![
        AluInst {
            op: AluOp::Add,
            dst: GprRef::new(1, Chan::X),
            a: AluSrc::Uniform {
                slot: 3,
                chan: Chan::W,
            },
            b: AluSrc::LiteralF32(1.0),
        },
        mov_zero(1, Chan::Y),
        mov_zero(1, Chan::Z),
        mov_zero(1, Chan::W),
    ];
    let exports = vec![ExportInst {
        target: ExportTarget::Param(0),
        gpr: 1,
    }];
    let cf = cf_bytes(&[
        CfInstruction::exec(0, 4),
        CfInstruction::emit(0, 1).with_end_of_program(),
    ]);
    let program = ShaderProgram {
        stage: ShaderStage::Pixel,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &exports,
    };

    let out = translate_ucode_to_wgsl(&program).unwrap();
    validate(&out.wgsl);

    assert_eq!(out.entry_point, "fs_main");
    assert!(out.wgsl.contains("@fragment"), "{}", out.wgsl);
    assert!(out.wgsl.contains("@location(0) o0: vec4<f32>"), "{}", out.wgsl);
    assert!(
        out.wgsl
            .contains("out.o0 = vec4<f32>((constants.c[3].w + 1.0), 0.0, 0.0, 0.0);"),
        "{}",
        out.wgsl
    );
}

#[test]
fn position_export_in_a_pixel_program_fails() {
    let exports = vec![ExportInst {
        target: ExportTarget::Position,
        gpr: 0,
    }];
    let cf = cf_bytes(&[CfInstruction::emit(0, 1).with_end_of_program()]);
    let program = ShaderProgram {
        stage: ShaderStage::Pixel,
        cf_bytes: &cf,
        alu: &[],
        fetch: &[],
        exports: &exports,
    };

    let err = translate_ucode_to_wgsl(&program).unwrap_err();
    assert!(err.to_string().contains("position export"), "{err}");
}

#[test]
fn multi_node_programs_fail_until_branch_linking_exists() {
    let alu = vec![mov_zero(1, Chan::X)];
    let cf = cf_bytes(&[
        CfInstruction::exec(0, 1),
        CfInstruction::jump(2, 0),
        CfInstruction::exec_end(0, 1),
    ]);
    let program = ShaderProgram {
        stage: ShaderStage::Pixel,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &[],
    };

    let err = translate_ucode_to_wgsl(&program).unwrap_err();
    assert!(err.to_string().contains("is not implemented"), "{err}");
}

#[test]
fn unimplemented_alu_opcode_fails_naming_it() {
    let alu = vec![AluInst {
        op: AluOp::Rsq,
        dst: GprRef::new(0, Chan::X),
        a: AluSrc::LiteralF32(4.0),
        b: AluSrc::LiteralF32(0.0),
    }];
    let cf = cf_bytes(&[CfInstruction::exec_end(0, 1)]);
    let program = ShaderProgram {
        stage: ShaderStage::Pixel,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &[],
    };

    let err = translate_ucode_to_wgsl(&program).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("rsq"), "{message}");
    assert!(message.contains("0x09"), "{message}");
}

#[test]
fn reading_an_uninitialized_gpr_fails() {
    let alu = vec![AluInst {
        op: AluOp::Add,
        dst: GprRef::new(0, Chan::X),
        a: AluSrc::Gpr(GprRef::new(3, Chan::X)),
        b: AluSrc::LiteralF32(1.0),
    }];
    let cf = cf_bytes(&[CfInstruction::exec_end(0, 1)]);
    let program = ShaderProgram {
        stage: ShaderStage::Pixel,
        cf_bytes: &cf,
        alu: &alu,
        fetch: &[],
        exports: &[],
    };

    let err = translate_ucode_to_wgsl(&program).unwrap_err();
    assert!(err.to_string().contains("uninitialized GPR r3.x"), "{err}");
}

#[test]
fn position_export_requires_exactly_four_operands() {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("entry").unwrap();
    fb.mark_entry().unwrap();
    {
        let mut b = fb.block().unwrap();
        let k = b.const_f32(0.0).unwrap();
        let x = b.reg(DataType::F32).unwrap();
        b.mov(x, k).unwrap();
        b.push_export(&[x], ExternRef::position()).unwrap();
    }
    fb.end_block().unwrap();
    let mut func = fb.finish().unwrap();
    typed::allocate(&mut func, &RegisterSet::unlimited()).unwrap();

    let err = generate_wgsl(&func, ShaderStage::Vertex).unwrap_err();
    assert!(err.message.contains("exactly 4"), "{err}");
}

#[test]
fn emission_requires_an_allocated_function() {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("entry").unwrap();
    fb.mark_entry().unwrap();
    fb.end_block().unwrap();
    let func = fb.finish().unwrap();

    let err = generate_wgsl(&func, ShaderStage::Vertex).unwrap_err();
    assert!(err.message.contains("register allocation"), "{err}");
}

#[test]
fn multi_block_emission_is_an_explicit_unsupported_path() {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("b0").unwrap();
    fb.mark_entry().unwrap();
    fb.branch_taken("b1").unwrap();
    fb.end_block().unwrap();
    fb.begin_block("b1").unwrap();
    fb.mark_exit().unwrap();
    fb.end_block().unwrap();
    let mut func = fb.finish().unwrap();
    typed::allocate(&mut func, &RegisterSet::unlimited()).unwrap();

    let err = generate_wgsl(&func, ShaderStage::Vertex).unwrap_err();
    assert!(err.message.contains("branch reconstruction"), "{err}");
}
