//! Fragment layout and byte emission.
//!
//! Emission is two-phase, like the instruction encoder underneath it. The
//! staged pass walks the fragments in layout order, measures every
//! instruction and binds every label (fragment entries, block entries,
//! branch targets and pinned cells) to its offset. The commit pass re-walks
//! the same layout and writes bytes, resolving branch displacements through
//! the label map; any displacement still unresolved here is an internal
//! invariant violation surfaced as an error.
//!
//! A terminal jump to the fragment that immediately follows in layout order
//! is elided. Pinned native-address cells land 8-aligned after the code.

use hashbrown::HashMap;

use granary_x64::{
    builder, encode, staged_len, CachePc, EncodeError, Instruction, Label, LabelResolver,
    OperandKind, VecSink,
};

use crate::cfg::{BlockId, Stmt, Successor};

use super::fragment::{FragId, FragmentGraph};

/// Labels bound to cache PCs.
#[derive(Debug, Default)]
pub struct LabelMap {
    map: HashMap<u32, CachePc>,
}

impl LabelMap {
    fn bind(&mut self, label: Label, pc: CachePc) {
        let prev = self.map.insert(label.0, pc);
        debug_assert!(prev.is_none(), "label .L{} bound twice", label.0);
    }
}

impl LabelResolver for LabelMap {
    fn label_pc(&self, label: Label) -> Option<CachePc> {
        self.map.get(&label.0).copied()
    }
}

/// The bytes of one committed trace.
#[derive(Debug)]
pub struct EmittedTrace {
    /// The code, followed by the 8-aligned pinned cells.
    pub bytes: Vec<u8>,
    /// Offset of each block's entry point within `bytes`.
    pub block_offsets: HashMap<BlockId, usize>,
}

/// Encoded size of the graph, independent of where it will land.
pub fn staged_size(graph: &FragmentGraph) -> Result<usize, EncodeError> {
    let mut labels = LabelMap::default();
    Ok(walk(graph, 0, None, &mut labels)?.1)
}

/// Lay out and commit the fragment graph at cache PC `base`.
pub fn emit(graph: &FragmentGraph, base: CachePc) -> Result<EmittedTrace, EncodeError> {
    // Staged: assign every label an offset.
    let mut labels = LabelMap::default();
    let staged = walk(graph, base, None, &mut labels)?;

    // Commit: all displacements resolve against the now-complete map.
    let mut sink = VecSink::default();
    let committed = walk(graph, base, Some(&mut sink), &mut labels)?;
    debug_assert_eq!(staged.1, committed.1, "staged and committed sizes differ");

    Ok(EmittedTrace {
        bytes: sink.bytes,
        block_offsets: committed.0,
    })
}

/// One pass over the layout. With a sink this is the commit pass (labels
/// must already be bound); without one it is the staged pass and `labels`
/// is populated.
fn walk(
    graph: &FragmentGraph,
    base: CachePc,
    mut sink: Option<&mut VecSink>,
    labels: &mut LabelMap,
) -> Result<(HashMap<BlockId, usize>, usize), EncodeError> {
    let staging = sink.is_none();
    let mut offset = 0usize;
    let mut block_offsets = HashMap::new();

    // Block entry labels bind at each block's (possibly zone-wrapped) entry
    // fragment.
    let mut entry_labels: HashMap<u32, Label> = HashMap::new();
    for (block, frag) in &graph.block_entry {
        entry_labels.insert(frag.0, graph.block_label[block]);
    }

    let mut emit_instr = |instr: &Instruction,
                          offset: &mut usize,
                          sink: &mut Option<&mut VecSink>,
                          labels: &LabelMap|
     -> Result<(), EncodeError> {
        match sink {
            Some(sink) => {
                let before = sink.bytes.len();
                encode(instr, *sink, base + *offset as u64, labels)?;
                *offset += sink.bytes.len() - before;
            }
            None => *offset += staged_len(instr)?,
        }
        Ok(())
    };

    let ids = graph.ids();
    for (pos, id) in ids.iter().enumerate() {
        let frag = graph.frag(*id);
        if staging {
            labels.bind(frag.entry_label, base + offset as u64);
            if let Some(block_label) = entry_labels.get(&id.0) {
                labels.bind(*block_label, base + offset as u64);
            }
        }
        if let Some(block_label) = entry_labels.get(&id.0) {
            // Record the block offset in both passes; they must agree.
            for (block, label) in &graph.block_label {
                if label == block_label {
                    block_offsets.insert(*block, offset);
                }
            }
        }

        for stmt in &frag.stmts {
            match stmt {
                Stmt::Label(label) => {
                    if staging {
                        labels.bind(*label, base + offset as u64);
                    }
                }
                Stmt::Annot(_) => {}
                Stmt::Instr(instr) | Stmt::Branch(instr, _) => {
                    emit_instr(instr, &mut offset, &mut sink, labels)?;
                }
                Stmt::Cfi(instr, succ) => {
                    let next = ids.get(pos + 1).copied();
                    if let Some(resolved) = resolve_cfi(graph, instr, *succ, next) {
                        emit_instr(&resolved, &mut offset, &mut sink, labels)?;
                    }
                }
            }
        }

        // Fall-through edges that do not land on the next fragment in
        // layout order need an explicit jump.
        if let Some(target) = frag.fall_through {
            if ids.get(pos + 1) != Some(&target) {
                let jmp = builder::jmp_label(graph.frag(target).entry_label);
                emit_instr(&jmp, &mut offset, &mut sink, labels)?;
            }
        }
    }

    // Pinned native-address cells, 8-aligned after the code.
    if !graph.native_addrs.is_empty() {
        while offset % 8 != 0 {
            if let Some(sink) = sink.as_mut() {
                sink.bytes.push(0xCC);
            }
            offset += 1;
        }
        for cell in &graph.native_addrs {
            if staging {
                labels.bind(cell.label, base + offset as u64);
            }
            if let Some(sink) = sink.as_mut() {
                sink.bytes.extend_from_slice(&cell.value.to_le_bytes());
            }
            offset += 8;
        }
    }

    Ok((block_offsets, offset))
}

/// Rewrite a control-flow instruction's target for emission, or elide it
/// when it is a jump to the next fragment in layout order.
fn resolve_cfi(
    graph: &FragmentGraph,
    instr: &Instruction,
    succ: Successor,
    next_in_layout: Option<FragId>,
) -> Option<Instruction> {
    let has_branch_operand = matches!(
        instr.ops.first().map(|op| &op.kind),
        Some(OperandKind::BranchPc(_)) | Some(OperandKind::BranchLabel(_))
    );

    match succ {
        Successor::Decoded(block) => {
            let entry_frag = graph.block_entry[&block];
            if instr.is_unconditional_jump()
                && has_branch_operand
                && next_in_layout == Some(entry_frag)
            {
                // The target begins right here; no jump needed.
                return None;
            }
            let mut resolved = instr.clone();
            if has_branch_operand {
                resolved.set_branch_target_label(graph.block_label[&block]);
                widen_rel8(&mut resolved);
            }
            Some(resolved)
        }
        Successor::Cached(pc) | Successor::Native(pc) => {
            let mut resolved = instr.clone();
            if has_branch_operand {
                resolved.set_branch_target_pc(pc);
                widen_rel8(&mut resolved);
            }
            Some(resolved)
        }
        Successor::Indirect | Successor::Return { .. } => Some(instr.clone()),
        Successor::Direct(_) => unreachable!("direct successor at emission time"),
    }
}

/// A decoded 8-bit branch displacement rarely reaches its relocated target
/// once blocks are laid out in the cache; relax it to the 32-bit form.
fn widen_rel8(instr: &mut Instruction) {
    if matches!(instr.form, granary_x64::OpcodeForm::Rel8) {
        instr.form = granary_x64::OpcodeForm::Rel32;
    }
}
