//! Register allocation.
//!
//! Two strategies share one target descriptor ([`RegisterSet`]):
//!
//! - [`ranges`]: general liveness-range allocation for targets with a finite register file.
//!   Supports multi-block functions via import/export-linked ranges and overlap-based conflict
//!   detection.
//! - [`typed`]: degenerate per-type-family counters for targets whose "registers" are unlimited
//!   named locals (generated structured source). Only valid when the target declares no register
//!   pressure; the precondition is checked, not assumed.
//!
//! Both strategies mutate register-table entries in place and refuse to run twice on one
//! function.

use thiserror::Error;

use crate::ir::{IrError, RegClass};

pub mod ranges;
pub mod typed;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("function has already been register-allocated")]
    AlreadyAllocated,
    #[error("register v{reg} in block {block} is redefined at instruction {instr} while its range is still open")]
    RedefinedRegister { block: u32, reg: u16, instr: usize },
    #[error("register v{reg} read at instruction {instr} in block {block} has no open range")]
    UndefinedRegister { block: u32, reg: u16, instr: usize },
    #[error("export `{name}` in block {block} does not name a live register")]
    ExportUndefined { block: u32, name: String },
    #[error("import `{name}` in block {block} has no matching export in any predecessor")]
    UnlinkedImport { block: u32, name: String },
    #[error("export `{name}` from block {block} is not consumed by successor block {succ}")]
    UnconsumedExport { block: u32, succ: u32, name: String },
    #[error(
        "no free {class} register for v{reg} in block {block}: spilling is not implemented"
    )]
    SpillNotImplemented {
        block: u32,
        reg: u16,
        class: &'static str,
    },
    #[error("liveness-range allocation requires a finite {0} register file")]
    UnboundedRegisterFile(&'static str),
    #[error("typed allocation requires an unlimited {0} register file")]
    FixedRegisterFile(&'static str),
    #[error("typed allocator ran out of {0} register names")]
    NameSpaceExhausted(&'static str),
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Target register-file description: how many physical registers exist per class.
///
/// `None` for a class means the target has no register pressure there (unlimited named locals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    int: Option<u16>,
    float: Option<u16>,
    bool_: Option<u16>,
}

impl RegisterSet {
    /// A target with a fixed register file per class.
    pub fn fixed(int: u16, float: u16, bool_: u16) -> Self {
        Self {
            int: Some(int),
            float: Some(float),
            bool_: Some(bool_),
        }
    }

    /// A target with unlimited named locals in every class.
    pub fn unlimited() -> Self {
        Self {
            int: None,
            float: None,
            bool_: None,
        }
    }

    /// Register count for `class`, or `None` when the class is unlimited.
    pub fn limit(&self, class: RegClass) -> Option<u16> {
        match class {
            RegClass::Int => self.int,
            RegClass::Float => self.float,
            RegClass::Bool => self.bool_,
        }
    }
}
