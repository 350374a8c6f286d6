//! The translation pipeline above the machine layer.
//!
//! A translation request grows a [`cfg::Trace`] of decoded blocks rooted at
//! the requested entry PC, following direct control flow. The mangler then
//! rewrites control-flow instructions and far memory operands into forms the
//! code cache can host; the fragment builder cuts blocks into single-entry
//! fragments grouped into stack-discipline partitions; the register
//! scheduler assigns virtual registers to GPRs and spill slots; the flag
//! pass wraps flag-killing zones with save/restore sequences; and the
//! emitter lays the fragments out and commits bytes.

#![deny(missing_docs)]

pub mod assemble;
pub mod cfg;
