//! Granary: a dynamic binary translator for x86-64.
//!
//! Granary transparently intercepts native code at basic-block granularity,
//! decodes it into a typed representation, lets an attached client mutate
//! that representation, and emits equivalent code into a managed cache that
//! the processor executes in place of the original. Control transfers still
//! appear to reach their native targets, and register and memory state at
//! application-visible boundaries is unchanged.
//!
//! The public surface is small: [`translate`] (and
//! [`translate_indirect`]) turn an application PC into a cache PC against a
//! long-lived [`Context`]; the command plane ([`CommandPlane`]) drives
//! `init`/`attach`/`detach`/`exit` from newline-terminated command lines;
//! and [`Options`] carries the `--name[=value]` option syntax those
//! commands use.

#![deny(missing_docs)]

mod command;
mod context;
mod memory;
mod options;
mod translate;

pub use command::{parse_command, Command, CommandPlane};
pub use context::{Context, InstrumentFn};
pub use granary_cache::{BlockMeta, StackMeta, StackValidity};
pub use memory::NativeMemory;
pub use options::Options;
pub use translate::{translate, translate_indirect, translate_with_meta, TranslateError};

pub use granary_x64::{AppPc, CachePc};
