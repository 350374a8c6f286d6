//! The translation entry points.
//!
//! A request arrives as an application PC plus meta-data. The index is
//! consulted first; on a miss the trace builder grows a graph of decoded
//! blocks rooted at that PC, the assembly passes rewrite and schedule it,
//! and the encoder commits bytes into a fresh cache region. The region is
//! protected executable-read-only *before* the block meta-data is inserted
//! into the index, so a record observed through the index always names
//! executable bytes.

use granary_cache::{
    BlockMeta, CacheError, CacheMeta, StackMeta, StackValidity, UnificationStatus,
};
use granary_codegen::assemble;
use granary_codegen::cfg::{self, CacheProbe};
use granary_x64::{AppPc, CachePc, EncodeError};

use crate::context::Context;
use crate::memory::NativeMemory;

/// Why a translation request failed.
///
/// Decode failures are not errors: they truncate the current block. What
/// remains are internal invariant violations surfaced by the encoder and
/// resource failures from the code cache.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// The encoder hit an unresolved displacement or an unschedulable
    /// operand; an internal invariant was violated.
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
    /// The code cache could not map or protect memory.
    #[error("code cache failure: {0}")]
    Cache(#[from] CacheError),
}

/// Translate the code at `pc`, reusing an existing translation when the
/// index has a compatible one. Returns a cache PC whose execution is
/// equivalent to executing from `pc` natively.
pub fn translate(
    ctx: &Context,
    pc: AppPc,
    stack_validity: StackValidity,
) -> Result<CachePc, TranslateError> {
    let mut meta = ctx.manager.lock().unwrap().allocate_for(pc);
    meta.get_mut::<StackMeta>().validity = stack_validity;
    translate_with_meta(ctx, meta)
}

/// Translate an entry reached through an indirect control transfer.
///
/// Nothing is known about the stack at an indirect target, so the request
/// carries the unknown validity.
pub fn translate_indirect(ctx: &Context, meta: BlockMeta) -> Result<CachePc, TranslateError> {
    translate_with_meta(ctx, meta)
}

/// Translate with caller-built meta-data.
pub fn translate_with_meta(ctx: &Context, meta: BlockMeta) -> Result<CachePc, TranslateError> {
    let response = ctx.index.request(&meta);
    match response.status {
        UnificationStatus::Accept | UnificationStatus::Adapt => {
            // On accept this is the exact translation. On adapt the entry
            // is compatible under weaker assumptions; re-keying against it
            // means adopting its cache PC and letting the fresh record
            // drop.
            let found = unsafe { &*response.meta.expect("match carries a record") };
            let cache_pc = found.get::<CacheMeta>().start_pc;
            debug_assert!(cache_pc != 0, "indexed record with no committed code");
            log::trace!(
                "request for {:#x} hit the index at {cache_pc:#x}",
                meta.app_pc()
            );
            Ok(cache_pc)
        }
        UnificationStatus::Reject => compile_and_index(ctx, meta),
    }
}

struct IndexProbe<'a> {
    ctx: &'a Context,
    validity: StackValidity,
}

impl CacheProbe for IndexProbe<'_> {
    fn probe(&self, pc: AppPc) -> Option<CachePc> {
        let mut probe = self.ctx.manager.lock().unwrap().allocate_for(pc);
        probe.get_mut::<StackMeta>().validity = self.validity;
        let response = self.ctx.index.request(&probe);
        if response.status != UnificationStatus::Accept {
            return None;
        }
        let found = unsafe { &*response.meta? };
        Some(found.get::<CacheMeta>().start_pc)
    }
}

fn cfg_validity(validity: StackValidity) -> cfg::StackValidity {
    match validity {
        StackValidity::Valid => cfg::StackValidity::Valid,
        StackValidity::Unknown => cfg::StackValidity::Unknown,
    }
}

/// The miss path: materialise, instrument, assemble, commit, index.
fn compile_and_index(ctx: &Context, mut meta: BlockMeta) -> Result<CachePc, TranslateError> {
    let pc = meta.app_pc();
    let validity = meta.get::<StackMeta>().validity;
    log::debug!("translating {pc:#x}");

    let probe = IndexProbe { ctx, validity };
    let mut trace = cfg::materialise(&NativeMemory, &probe, pc, cfg_validity(validity));

    if let Some(instrument) = &ctx.instrument {
        instrument(&mut trace);
    }

    let compiled = assemble::assemble(&mut trace);
    let size = compiled.staged_size()?;
    let region = ctx.cache.reserve(size)?;
    let emitted = compiled.commit(region.base())?;
    let base = region.commit(&emitted.bytes)?;

    // Record every block of the trace so later requests dedupe against any
    // of them, not just the entry.
    let entry_pc = base + emitted.block_offsets[&trace.entry] as u64;
    for block in trace.blocks() {
        let Some(offset) = emitted.block_offsets.get(&block.id) else {
            continue;
        };
        let block_cache_pc = base + *offset as u64;
        if block.id == trace.entry {
            meta.get_mut::<CacheMeta>().start_pc = block_cache_pc;
            continue;
        }
        let mut block_meta = ctx.manager.lock().unwrap().allocate_for(block.start_pc);
        block_meta.get_mut::<StackMeta>().validity = validity;
        block_meta.get_mut::<CacheMeta>().start_pc = block_cache_pc;
        ctx.index.insert(block_meta);
    }
    ctx.index.insert(meta);

    log::debug!(
        "translated {pc:#x} -> {entry_pc:#x} ({} block(s), {size} byte(s))",
        trace.num_blocks()
    );
    Ok(entry_pc)
}
