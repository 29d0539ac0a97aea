//! Control-flow stream partitioning.
//!
//! Walks the decoded control-flow records of one shader program and cuts them into nodes: maximal
//! straight-line runs with no internal branch. Clause records (ALU, fetch, emit) can never branch
//! and always merge into the active node; a default-layout record merges only when it is an
//! unconditional, non-branching continuation. Parsing stops at the first record flagged
//! end-of-program.

use tracing::debug;

use crate::limits::MAX_CLAUSE_INSTRUCTIONS;
use crate::ucode::{CfInstruction, CfKind, CfOpcode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfError {
    /// Record index within the control-flow stream.
    pub address: usize,
    pub message: String,
}

impl std::fmt::Display for CfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "control-flow parse error at record {}: {}",
            self.address, self.message
        )
    }
}

impl std::error::Error for CfError {}

fn err(address: usize, message: impl Into<String>) -> CfError {
    CfError {
        address,
        message: message.into(),
    }
}

/// One straight-line node of the program: records `[start, end)` of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfNode {
    pub start: u32,
    /// Exclusive end record index.
    pub end: u32,
    /// Address execution falls through to when this node was cut at a branch.
    pub fallthrough: Option<u32>,
    /// True when this node contains the end-of-program record.
    pub end_of_program: bool,
}

/// Partitions a control-flow record stream into nodes.
///
/// The returned list is non-empty for any non-empty input, its first node starts at record 0, and
/// node ranges are contiguous and non-overlapping. Control-flow features the translator does not
/// support yet (conditions, call/return, loops) fail here rather than being silently merged:
/// dropping a branch would produce a shader that renders incorrectly with no diagnostic.
pub fn parse_control_flow(records: &[CfInstruction]) -> Result<Vec<CfNode>, CfError> {
    if records.is_empty() {
        return Err(err(0, "empty control-flow stream"));
    }

    let mut nodes = Vec::new();
    let mut active_start = 0u32;

    for (i, inst) in records.iter().enumerate() {
        let op = inst.opcode();
        match op.kind() {
            // Clause records cannot branch; they always merge. They are still scanned for the
            // end-of-program flag below.
            CfKind::Alu => {
                let view = inst.alu_view();
                if view.clause_count() as usize > MAX_CLAUSE_INSTRUCTIONS {
                    return Err(err(
                        i,
                        format!(
                            "ALU clause count {} exceeds the {} instruction limit",
                            view.clause_count(),
                            MAX_CLAUSE_INSTRUCTIONS
                        ),
                    ));
                }
            }
            CfKind::Transfer => {
                let view = inst.transfer_view();
                if view.clause_count() as usize > MAX_CLAUSE_INSTRUCTIONS {
                    return Err(err(
                        i,
                        format!(
                            "transfer clause count {} exceeds the {} instruction limit",
                            view.clause_count(),
                            MAX_CLAUSE_INSTRUCTIONS
                        ),
                    ));
                }
            }
            CfKind::Default => match op {
                // An unconditional, non-branching continuation merges.
                CfOpcode::Nop => {}
                CfOpcode::Jump | CfOpcode::LoopStart | CfOpcode::LoopEnd => {
                    if op == CfOpcode::Jump {
                        let view = inst.default_view();
                        if view.condition() != 0 {
                            return Err(err(
                                i,
                                format!(
                                    "conditional jump (condition {}) is not implemented",
                                    view.condition()
                                ),
                            ));
                        }
                    }
                    // The branch record terminates the active node and starts the next one.
                    if (i as u32) > active_start {
                        nodes.push(CfNode {
                            start: active_start,
                            end: i as u32,
                            fallthrough: Some(i as u32),
                            end_of_program: false,
                        });
                        active_start = i as u32;
                    }
                }
                CfOpcode::CondExec => {
                    return Err(err(i, "conditional execution mode is not implemented"));
                }
                CfOpcode::Call | CfOpcode::Return => {
                    let view = inst.default_view();
                    return Err(err(
                        i,
                        format!(
                            "{} control flow (count {}) is not implemented",
                            op.name(),
                            view.count()
                        ),
                    ));
                }
                CfOpcode::Unknown(raw) => {
                    return Err(err(
                        i,
                        format!("unsupported control-flow opcode {raw:#04x}"),
                    ));
                }
                CfOpcode::Exec | CfOpcode::ExecEnd | CfOpcode::Fetch | CfOpcode::Emit => {
                    unreachable!("clause opcodes classify as Alu/Transfer")
                }
            },
        }

        if inst.end_of_program() {
            nodes.push(CfNode {
                start: active_start,
                end: i as u32 + 1,
                fallthrough: None,
                end_of_program: true,
            });
            debug!(
                records = records.len(),
                nodes = nodes.len(),
                "partitioned control-flow stream"
            );
            return Ok(nodes);
        }
    }

    Err(err(
        records.len() - 1,
        "control-flow stream ends without an end-of-program record",
    ))
}
