//! x86-64 instruction model, decoder and encoder for Granary.
//!
//! This crate is the machine layer of the translator. It defines a typed
//! representation of one x86-64 instruction with explicit and implicit
//! operands, decodes machine bytes into that representation, and encodes it
//! back out. Everything above this layer (trace building, mangling, register
//! scheduling) manipulates the types defined here and never raw bytes.
//!
//! The decoder and encoder cover the integer subset of the ISA that a binary
//! translator actually rewrites; bytes outside that subset decode to a
//! recoverable error that ends the current block.

#![deny(missing_docs)]

pub mod builder;
mod decode;
mod encode;
mod flags;
mod inst;
mod operand;
mod reg;
mod tables;

pub use crate::builder::*;
pub use crate::decode::{decode_next, DecodeError};
pub use crate::encode::{
    encode, staged_len, CodeSink, CountingSink, EncodeError, LabelResolver, VecSink,
};
pub use crate::flags::{FlagEffects, Rflags};
pub use crate::inst::{Category, Cc, Instruction, Label, Opcode, OpcodeForm, Prefixes};
pub use crate::operand::{Imm, MemExpr, Operand, OperandAction, OperandKind, Scale, Segment};
pub use crate::reg::{Gpr, GprSet, VirtualRegister, VrKind, NUM_GPRS};
pub use crate::tables::OpcodeTables;

/// A program counter in the original, un-translated binary.
pub type AppPc = u64;

/// A program counter inside the managed code cache.
pub type CachePc = u64;

/// Width of a general-purpose register, in bytes.
pub const GPR_WIDTH_BYTES: u8 = 8;

/// Width of an address, in bits.
pub const ADDRESS_WIDTH_BITS: u16 = 64;

/// Maximum number of operands on a well-formed instruction.
///
/// Implicit-operand-heavy forms (`PUSHAD` territory) may exceed this; 11 is
/// the hard bound enforced in debug builds.
pub const MAX_NUM_OPERANDS: usize = 8;

/// Hard debug-build bound on operand count.
pub const MAX_NUM_OPERANDS_DEBUG: usize = 11;

/// Longest legal x86-64 instruction, in bytes.
pub const MAX_INSTRUCTION_BYTES: usize = 15;
