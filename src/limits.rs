//! Centralized limits for guest shader microcode parsing.
//!
//! Kestrel treats guest-provided microcode as untrusted input. These limits bound memory usage and
//! prevent pathological programs from triggering large allocations or runaway handle growth during
//! translation.

/// Maximum accepted control-flow stream length in bytes.
///
/// Real programs are a few KiB of control-flow records; this is far above anything a legitimate
/// guest emits while still keeping the per-record `Vec` allocations bounded.
pub(crate) const MAX_CF_STREAM_BYTES: usize = 256 * 1024; // 256 KiB

/// Size of one control-flow record in bytes.
pub(crate) const CF_RECORD_BYTES: usize = 8;

/// Maximum clause instruction count referenced by a single control-flow record.
///
/// Clause counts come straight out of guest-controlled fields; capping them keeps a hostile
/// record from claiming an absurd slice of the clause tables. Real clauses top out in the low
/// tens of instructions.
pub(crate) const MAX_CLAUSE_INSTRUCTIONS: usize = 128;

/// Half of the 16-bit register handle space. Handles below this index the block's register table;
/// handles at or above it index the constant table. Allocating past either half is a hard error,
/// never a wrap into the other half.
pub(crate) const BLOCK_HANDLE_SPLIT: u16 = 0x8000;

/// Maximum uniform register slot an import may reference.
///
/// The executor binds the uniform constants as a fixed `array<vec4<f32>, 256>`, so anything past
/// this would index out of the bound buffer.
pub(crate) const MAX_UNIFORM_SLOT: u16 = 255;

/// Maximum vertex attribute index an import may reference (WebGPU guarantees 16 vertex inputs).
pub(crate) const MAX_ATTRIBUTE_INDEX: u16 = 15;

/// Maximum generic output (param) index an export may reference (WebGPU guarantees 16 inter-stage
/// locations, one of which the position builtin does not consume).
pub(crate) const MAX_PARAM_INDEX: u16 = 15;

/// Default expression length, in bytes of generated text, below which the emitter will consider
/// inlining a single-use expression instead of materializing a named local.
pub(crate) const DEFAULT_MAX_INLINE_EXPR_LEN: usize = 64;
