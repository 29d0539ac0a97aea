use kestrel_gpu_shader::ir::builder::FunctionBuilder;
use kestrel_gpu_shader::ir::{DataType, Function, RegHandle};
use kestrel_gpu_shader::regalloc::{ranges, typed, AllocError, RegisterSet};
use kestrel_gpu_shader::ucode::ExternRef;

/// entry: a = 1.0; b = 2.0; c = a + b
fn chain_function() -> (Function, [RegHandle; 3]) {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("entry").unwrap();
    fb.mark_entry().unwrap();
    fb.mark_exit().unwrap();
    let mut b = fb.block().unwrap();
    let k0 = b.const_f32(1.0).unwrap();
    let k1 = b.const_f32(2.0).unwrap();
    let ra = b.reg(DataType::F32).unwrap();
    let rb = b.reg(DataType::F32).unwrap();
    let rc = b.reg(DataType::F32).unwrap();
    b.mov(ra, k0).unwrap();
    b.mov(rb, k1).unwrap();
    b.add(rc, ra, rb).unwrap();
    fb.end_block().unwrap();
    (fb.finish().unwrap(), [ra, rb, rc])
}

/// b0 defines and exports a value under `local(7)`; b1 imports and consumes it.
fn linked_function() -> (Function, RegHandle, RegHandle) {
    let mut fb = FunctionBuilder::new();

    fb.begin_block("b0").unwrap();
    fb.mark_entry().unwrap();
    let (x, _) = {
        let mut b = fb.block().unwrap();
        let k = b.const_f32(1.0).unwrap();
        let x = b.reg(DataType::F32).unwrap();
        b.mov(x, k).unwrap();
        b.export_value(x, ExternRef::local(7)).unwrap();
        (x, k)
    };
    fb.branch_taken("b1").unwrap();
    fb.end_block().unwrap();

    fb.begin_block("b1").unwrap();
    fb.mark_exit().unwrap();
    let y = {
        let mut b = fb.block().unwrap();
        let y = b.reg(DataType::F32).unwrap();
        b.import_value(y, ExternRef::local(7)).unwrap();
        let z = b.reg(DataType::F32).unwrap();
        b.add(z, y, y).unwrap();
        y
    };
    fb.end_block().unwrap();

    (fb.finish().unwrap(), x, y)
}

#[test]
fn overlapping_ranges_never_share_a_physical_register() {
    let (mut func, [ra, rb, rc]) = chain_function();
    ranges::allocate(&mut func, &RegisterSet::fixed(4, 4, 4)).unwrap();

    let block = &func.blocks[0];
    let pa = block.reg_info(ra).unwrap().phys.unwrap();
    let pb = block.reg_info(rb).unwrap().phys.unwrap();
    let pc = block.reg_info(rc).unwrap().phys.unwrap();
    assert_ne!(pa, pb);
    assert_ne!(pa, pc);
    assert_ne!(pb, pc);
}

#[test]
fn register_file_exhaustion_is_the_spill_path() {
    let (mut func, _) = chain_function();
    let err = ranges::allocate(&mut func, &RegisterSet::fixed(2, 2, 2)).unwrap_err();
    assert!(
        matches!(err, AllocError::SpillNotImplemented { .. }),
        "{err}"
    );
}

#[test]
fn ranges_allocation_requires_a_finite_register_file() {
    let (mut func, _) = chain_function();
    let err = ranges::allocate(&mut func, &RegisterSet::unlimited()).unwrap_err();
    assert!(matches!(err, AllocError::UnboundedRegisterFile(_)), "{err}");
}

#[test]
fn imported_value_prefers_the_exporting_range_register() {
    let (mut func, x, y) = linked_function();
    ranges::allocate(&mut func, &RegisterSet::fixed(4, 4, 4)).unwrap();

    let px = func.blocks[0].reg_info(x).unwrap().phys.unwrap();
    let py = func.blocks[1].reg_info(y).unwrap().phys.unwrap();
    assert_eq!(px, py, "the import should continue the exporter's register");
}

#[test]
fn allocation_discards_import_export_metadata() {
    let (mut func, _, _) = linked_function();
    ranges::allocate(&mut func, &RegisterSet::fixed(4, 4, 4)).unwrap();

    for block in &func.blocks {
        assert!(block.imports.is_empty());
        assert!(block.exports.is_empty());
    }
}

#[test]
fn import_without_matching_export_fails_the_link_phase() {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("entry").unwrap();
    fb.mark_entry().unwrap();
    {
        let mut b = fb.block().unwrap();
        let y = b.reg(DataType::F32).unwrap();
        b.import_value(y, ExternRef::local(9)).unwrap();
    }
    fb.end_block().unwrap();
    let mut func = fb.finish().unwrap();

    let err = ranges::allocate(&mut func, &RegisterSet::fixed(4, 4, 4)).unwrap_err();
    assert!(matches!(err, AllocError::UnlinkedImport { .. }), "{err}");
}

#[test]
fn export_not_consumed_by_a_successor_fails_the_link_phase() {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("b0").unwrap();
    fb.mark_entry().unwrap();
    {
        let mut b = fb.block().unwrap();
        let k = b.const_f32(0.0).unwrap();
        let x = b.reg(DataType::F32).unwrap();
        b.mov(x, k).unwrap();
        b.export_value(x, ExternRef::local(1)).unwrap();
    }
    fb.branch_taken("b1").unwrap();
    fb.end_block().unwrap();
    fb.begin_block("b1").unwrap();
    fb.mark_exit().unwrap();
    fb.end_block().unwrap();
    let mut func = fb.finish().unwrap();

    let err = ranges::allocate(&mut func, &RegisterSet::fixed(4, 4, 4)).unwrap_err();
    assert!(matches!(err, AllocError::UnconsumedExport { .. }), "{err}");
}

#[test]
fn writing_a_register_with_an_open_range_is_rejected() {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("entry").unwrap();
    fb.mark_entry().unwrap();
    {
        let mut b = fb.block().unwrap();
        let k = b.const_f32(0.0).unwrap();
        let x = b.reg(DataType::F32).unwrap();
        b.mov(x, k).unwrap();
        b.mov(x, k).unwrap();
    }
    fb.end_block().unwrap();
    let mut func = fb.finish().unwrap();

    let err = ranges::allocate(&mut func, &RegisterSet::fixed(4, 4, 4)).unwrap_err();
    assert!(
        matches!(err, AllocError::RedefinedRegister { instr: 1, .. }),
        "{err}"
    );
}

#[test]
fn allocation_refuses_to_run_twice() {
    let (mut func, _) = chain_function();
    typed::allocate(&mut func, &RegisterSet::unlimited()).unwrap();

    assert!(matches!(
        typed::allocate(&mut func, &RegisterSet::unlimited()),
        Err(AllocError::AlreadyAllocated)
    ));
    assert!(matches!(
        ranges::allocate(&mut func, &RegisterSet::fixed(4, 4, 4)),
        Err(AllocError::AlreadyAllocated)
    ));
}

#[test]
fn typed_allocation_hands_out_one_counter_per_class() {
    let mut fb = FunctionBuilder::new();
    fb.begin_block("entry").unwrap();
    fb.mark_entry().unwrap();
    let handles = {
        let mut b = fb.block().unwrap();
        [
            b.reg(DataType::F32).unwrap(),
            b.reg(DataType::I32).unwrap(),
            b.reg(DataType::F32).unwrap(),
            b.reg(DataType::Bool).unwrap(),
            b.reg(DataType::U32).unwrap(),
        ]
    };
    fb.end_block().unwrap();
    let mut func = fb.finish().unwrap();

    typed::allocate(&mut func, &RegisterSet::unlimited()).unwrap();

    let names: Vec<String> = handles
        .iter()
        .map(|&h| func.blocks[0].reg_info(h).unwrap().phys.unwrap().to_string())
        .collect();
    // u32 and i32 share the integer family counter.
    assert_eq!(names, ["f0", "i0", "f1", "b0", "i1"]);
}

#[test]
fn typed_allocation_requires_an_unlimited_register_file() {
    let (mut func, _) = chain_function();
    let err = typed::allocate(&mut func, &RegisterSet::fixed(8, 8, 8)).unwrap_err();
    assert!(matches!(err, AllocError::FixedRegisterFile(_)), "{err}");
}
