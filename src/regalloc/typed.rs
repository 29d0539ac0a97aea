//! Typed register allocation for targets without register pressure.
//!
//! When the target's "registers" are unlimited named locals grouped only by type (generated
//! structured source), allocation degenerates to handing out the next unused name per data-type
//! family. No liveness, no conflicts, no spilling. The no-pressure precondition is checked: a
//! class with a finite register file would silently produce colliding names under this strategy.

use tracing::debug;

use crate::ir::{Function, PhysReg, RegClass};
use crate::regalloc::{AllocError, RegisterSet};

/// Assigns every unassigned virtual register a fresh per-class counter value.
pub fn allocate(func: &mut Function, regs: &RegisterSet) -> Result<(), AllocError> {
    if func.is_allocated() {
        return Err(AllocError::AlreadyAllocated);
    }

    let mut counters = [0u32; 3];
    let counter_of = |class: RegClass| -> usize {
        match class {
            RegClass::Int => 0,
            RegClass::Float => 1,
            RegClass::Bool => 2,
        }
    };

    for block in &mut func.blocks {
        for info in &mut block.regs {
            if info.phys.is_some() {
                continue;
            }
            let class = info.ty.class();
            if regs.limit(class).is_some() {
                return Err(AllocError::FixedRegisterFile(class.name()));
            }
            let slot = &mut counters[counter_of(class)];
            if *slot > u16::MAX as u32 {
                return Err(AllocError::NameSpaceExhausted(class.name()));
            }
            info.phys = Some(PhysReg {
                class,
                index: *slot as u16,
            });
            *slot += 1;
        }
    }

    func.mark_allocated();
    debug!(
        ints = counters[0],
        floats = counters[1],
        bools = counters[2],
        "typed allocation done"
    );
    Ok(())
}
