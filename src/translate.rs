//! Top-level translation pipeline.
//!
//! One call takes a shader program from raw control-flow records to WGSL text: partition the
//! stream, generate IR, allocate registers, emit source. Each stage's failure is local to this
//! program; the caller decides what to render instead.

use thiserror::Error;
use tracing::debug;

use crate::cfg::{self, CfError};
use crate::codegen::{self, CodegenError};
use crate::ir::Function;
use crate::regalloc::{typed, AllocError, RegisterSet};
use crate::ucode::{ShaderProgram, ShaderStage, UcodeError};
use crate::wgsl::{self, WgslError, WgslOptions};

/// Successful shader translation result.
#[derive(Debug, Clone)]
pub struct TranslatedShader {
    pub stage: ShaderStage,
    pub wgsl: String,
    pub entry_point: &'static str,
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Ucode(#[from] UcodeError),
    #[error(transparent)]
    Cf(#[from] CfError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Wgsl(#[from] WgslError),
}

/// Builds the IR [`Function`] for a program, stopping before register allocation.
///
/// Ownership of the function transfers to the caller, which may run either allocation strategy
/// on it and emit, or inspect it directly.
pub fn build_function(program: &ShaderProgram<'_>) -> Result<Function, TranslateError> {
    let records = program.cf_records()?;
    let nodes = cfg::parse_control_flow(&records)?;
    let func = codegen::generate(program, &records, &nodes)?;
    Ok(func)
}

/// Translates one shader program to WGSL.
pub fn translate_ucode_to_wgsl(
    program: &ShaderProgram<'_>,
) -> Result<TranslatedShader, TranslateError> {
    translate_ucode_to_wgsl_with_options(program, WgslOptions::default())
}

pub fn translate_ucode_to_wgsl_with_options(
    program: &ShaderProgram<'_>,
    options: WgslOptions,
) -> Result<TranslatedShader, TranslateError> {
    let mut func = build_function(program)?;

    // WGSL locals have no register pressure, so the typed strategy applies.
    typed::allocate(&mut func, &RegisterSet::unlimited())?;

    let out = wgsl::generate_wgsl_with_options(&func, program.stage, options)?;
    debug!(
        stage = ?program.stage,
        wgsl_bytes = out.wgsl.len(),
        "translated shader program"
    );

    Ok(TranslatedShader {
        stage: program.stage,
        wgsl: out.wgsl,
        entry_point: out.entry_point,
    })
}
