//! Shader transcompiler for the Kestrel console GPU.
//!
//! Takes the guest GPU's native shader microcode (a control-flow record stream plus decoded
//! ALU/fetch/export clauses), rebuilds it as a typed IR, runs register allocation, and emits WGSL
//! for the graphics backend. Translation is synchronous and self-contained: one program in, one
//! function or one text buffer out, with no shared mutable state between compilations.

pub mod cfg;
pub mod codegen;
pub mod ir;
mod limits;
pub mod regalloc;
pub mod translate;
pub mod ucode;
pub mod wgsl;

pub use translate::{
    build_function, translate_ucode_to_wgsl, translate_ucode_to_wgsl_with_options,
    TranslateError, TranslatedShader,
};
pub use ucode::{ShaderProgram, ShaderStage};
