//! Liveness-range register allocation.
//!
//! Per block: one range per import (the value arrives before the first instruction, marked with
//! the -1 sentinel), a fresh range per register write, end-index extension on every read, and a
//! one-past-the-end extension for exported values. Ranges live in a per-block arena and refer to
//! each other by index, so dropping a block's allocator state drops every range and link with it.
//!
//! Cross-block: each exported range links to the matching import range in every successor, and a
//! chosen physical register is propagated along those links as a preference (best effort, not
//! guaranteed coalescing). Unmatched names fail the link phase; silently dropping a cross-block
//! value would miscompile the shader.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::ir::{BasicBlock, Function, PhysReg, RegClass, RegHandle};
use crate::regalloc::{AllocError, RegisterSet};
use crate::ucode::ExternRef;

/// Where a range's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSource {
    /// Defined by an instruction in this block.
    Def,
    /// Imported from a predecessor block under this name.
    Import(ExternRef),
    /// Continuation of an earlier range in the same block. Reserved for block splitting; nothing
    /// constructs this yet.
    Continued,
}

/// One virtual register's lifetime within one block.
///
/// `start`/`end` are inclusive instruction indices; -1 marks "before the first instruction"
/// (import arrival) and `instrs.len()` marks the export position one past the last instruction.
#[derive(Debug, Clone)]
pub struct LiveRange {
    pub reg: RegHandle,
    pub class: RegClass,
    pub start: i32,
    pub end: i32,
    pub source: RangeSource,
    /// Ranges in the same block this range overlaps, by index into the block's arena.
    pub overlaps: Vec<u32>,
    /// Import ranges in successor blocks fed by this range, as (block index, range index).
    pub links: Vec<(usize, u32)>,
    /// Physical register index within `class`, once assigned.
    pub phys: Option<u16>,
    /// Register propagated from a linked predecessor range, tried first during assignment.
    pub preferred: Option<u16>,
}

/// Allocator state for one block: the range arena plus name-keyed views of it.
#[derive(Debug, Default)]
pub struct BlockRanges {
    pub ranges: Vec<LiveRange>,
    /// Exported ranges keyed by external name, in export-list order.
    pub exports: Vec<(ExternRef, u32)>,
    /// Import ranges keyed by external name, in import-list order.
    pub imports: Vec<(ExternRef, u32)>,
}

/// Runs liveness-range allocation over every block of `func`.
///
/// Every class the function uses must be finite in `regs`; exhausting a class is the explicit
/// spill path, which is not implemented.
pub fn allocate(func: &mut Function, regs: &RegisterSet) -> Result<(), AllocError> {
    if func.is_allocated() {
        return Err(AllocError::AlreadyAllocated);
    }

    let mut state = Vec::with_capacity(func.blocks.len());
    for (block_idx, block) in func.blocks.iter().enumerate() {
        state.push(build_block_ranges(block, block_idx as u32)?);
    }

    link_blocks(func, &mut state)?;
    assign(func, regs, &mut state)?;
    rewrite(func);

    func.mark_allocated();
    debug!(blocks = func.blocks.len(), "liveness-range allocation done");
    Ok(())
}

/// Scans one block and builds its range arena.
fn build_block_ranges(block: &BasicBlock, block_idx: u32) -> Result<BlockRanges, AllocError> {
    let mut out = BlockRanges::default();
    // Open range per live register handle.
    let mut open: HashMap<u16, u32> = HashMap::new();

    for &(reg, name) in &block.imports {
        let class = block.reg_info(reg)?.ty.class();
        let id = out.ranges.len() as u32;
        out.ranges.push(LiveRange {
            reg,
            class,
            start: -1,
            end: -1,
            source: RangeSource::Import(name),
            overlaps: Vec::new(),
            links: Vec::new(),
            phys: None,
            preferred: None,
        });
        if open.insert(reg.0, id).is_some() {
            return Err(AllocError::RedefinedRegister {
                block: block_idx,
                reg: reg.0,
                instr: 0,
            });
        }
        out.imports.push((name, id));
    }

    for (i, instr) in block.instrs.iter().enumerate() {
        for &read in instr.reads().as_slice() {
            if read.is_constant() {
                continue;
            }
            let id = *open.get(&read.0).ok_or(AllocError::UndefinedRegister {
                block: block_idx,
                reg: read.0,
                instr: i,
            })?;
            out.ranges[id as usize].end = i as i32;
        }
        for &write in instr.writes().as_slice() {
            if open.contains_key(&write.0) {
                // A second write to a live register would need either range splitting or a
                // redefinition model; under this allocator it marks generator breakage.
                return Err(AllocError::RedefinedRegister {
                    block: block_idx,
                    reg: write.0,
                    instr: i,
                });
            }
            let class = block.reg_info(write)?.ty.class();
            let id = out.ranges.len() as u32;
            out.ranges.push(LiveRange {
                reg: write,
                class,
                start: i as i32,
                end: i as i32,
                source: RangeSource::Def,
                overlaps: Vec::new(),
                links: Vec::new(),
                phys: None,
                preferred: None,
            });
            open.insert(write.0, id);
        }
    }

    // Exported values stay live one virtual position past the last instruction.
    let past_end = block.instrs.len() as i32;
    for &(reg, name) in &block.exports {
        let id = *open.get(&reg.0).ok_or_else(|| AllocError::ExportUndefined {
            block: block_idx,
            name: name.to_string(),
        })?;
        out.ranges[id as usize].end = past_end;
        out.exports.push((name, id));
    }

    // Pairwise overlap marking; both directions so assignment can look in either.
    for a in 0..out.ranges.len() {
        for b in a + 1..out.ranges.len() {
            let (ra, rb) = (&out.ranges[a], &out.ranges[b]);
            if ra.start <= rb.end && rb.start <= ra.end {
                out.ranges[a].overlaps.push(b as u32);
                out.ranges[b].overlaps.push(a as u32);
            }
        }
    }

    trace!(
        block = block_idx,
        ranges = out.ranges.len(),
        "built liveness ranges"
    );
    Ok(out)
}

/// Attaches each exported range to the matching import range of every successor, and checks that
/// the linking is total in both directions.
fn link_blocks(func: &Function, state: &mut [BlockRanges]) -> Result<(), AllocError> {
    let mut linked: Vec<Vec<bool>> = state
        .iter()
        .map(|s| vec![false; s.ranges.len()])
        .collect();

    for (block_idx, block) in func.blocks.iter().enumerate() {
        let successors: Vec<usize> = block
            .taken
            .iter()
            .chain(block.not_taken.iter())
            .map(|id| id.index())
            .collect();

        for export_idx in 0..state[block_idx].exports.len() {
            let (name, range_id) = state[block_idx].exports[export_idx];
            for &succ in &successors {
                let import = state[succ]
                    .imports
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|&(_, id)| id);
                match import {
                    Some(import_id) => {
                        state[block_idx].ranges[range_id as usize]
                            .links
                            .push((succ, import_id));
                        linked[succ][import_id as usize] = true;
                    }
                    None => {
                        return Err(AllocError::UnconsumedExport {
                            block: block_idx as u32,
                            succ: succ as u32,
                            name: name.to_string(),
                        });
                    }
                }
            }
        }
    }

    for (block_idx, s) in state.iter().enumerate() {
        for &(name, range_id) in &s.imports {
            if !linked[block_idx][range_id as usize] {
                return Err(AllocError::UnlinkedImport {
                    block: block_idx as u32,
                    name: name.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Assigns a physical register to every range, smallest start index first within each block.
fn assign(
    func: &mut Function,
    regs: &RegisterSet,
    state: &mut [BlockRanges],
) -> Result<(), AllocError> {
    for block_idx in 0..state.len() {
        // Sorted multiset keyed by start index; the range id tiebreak keeps assignment order
        // deterministic.
        let order: BTreeSet<(i32, u32)> = state[block_idx]
            .ranges
            .iter()
            .enumerate()
            .map(|(id, r)| (r.start, id as u32))
            .collect();

        for &(_, id) in &order {
            let (class, reg, preferred) = {
                let r = &state[block_idx].ranges[id as usize];
                (r.class, r.reg, r.preferred)
            };
            let limit = regs
                .limit(class)
                .ok_or(AllocError::UnboundedRegisterFile(class.name()))?;

            // Registers pinned by overlapping ranges that were already assigned.
            let mut pinned: Vec<u16> = Vec::new();
            for &other in &state[block_idx].ranges[id as usize].overlaps {
                let other = &state[block_idx].ranges[other as usize];
                if other.class == class {
                    if let Some(p) = other.phys {
                        pinned.push(p);
                    }
                }
            }

            let candidate = preferred
                .filter(|p| *p < limit && !pinned.contains(p))
                .or_else(|| (0..limit).find(|p| !pinned.contains(p)));
            let phys = candidate.ok_or(AllocError::SpillNotImplemented {
                block: block_idx as u32,
                reg: reg.0,
                class: class.name(),
            })?;

            state[block_idx].ranges[id as usize].phys = Some(phys);
            trace!(
                block = block_idx,
                reg = reg.0,
                phys,
                class = class.name(),
                "assigned range"
            );

            // Propagate along cross-block links so the importing side tries the same register.
            let links = state[block_idx].ranges[id as usize].links.clone();
            for (succ, import_id) in links {
                state[succ].ranges[import_id as usize].preferred = Some(phys);
            }

            let block = func.block_mut(crate::ir::BlockId(block_idx as u32))?;
            block.reg_info_mut(reg)?.phys = Some(PhysReg { class, index: phys });
        }
    }
    Ok(())
}

/// Discards metadata the allocated function no longer needs: the import/export lists were
/// consumed by the link phase (values now flow through shared physical registers), and the
/// tables shrink to their final footprint.
fn rewrite(func: &mut Function) {
    for block in &mut func.blocks {
        block.imports.clear();
        block.imports.shrink_to_fit();
        block.exports.clear();
        block.exports.shrink_to_fit();
        block.regs.shrink_to_fit();
        block.consts.shrink_to_fit();
        block.instrs.shrink_to_fit();
    }
}
