//! Growing a trace of decoded blocks from an entry PC.

use std::collections::VecDeque;

use hashbrown::HashMap;

use granary_x64::{builder, decode_next, AppPc, CachePc, Category, DecodeError, Label};

use super::block::{BlockId, DecodedBlock, StackValidity, Stmt, Successor};

/// Upper bound on blocks materialised into one trace. Direct successors
/// beyond the budget degrade to native transfers, which is always sound.
pub const MAX_TRACE_BLOCKS: usize = 64;

/// Reads application code bytes.
///
/// Returns how many bytes starting at `pc` were copied into `buf`; zero
/// means the address is unreadable. Short reads model the end of readable
/// memory and surface as decode truncation.
pub trait CodeReader {
    /// Copy up to `buf.len()` bytes from `pc`.
    fn read(&self, pc: AppPc, buf: &mut [u8]) -> usize;
}

/// Reader over an in-memory byte region, used by tests and by translation
/// requests that already resolved their mapping.
pub struct SliceReader<'a> {
    /// PC of the first byte of `bytes`.
    pub base: AppPc,
    /// The readable bytes.
    pub bytes: &'a [u8],
}

impl CodeReader for SliceReader<'_> {
    fn read(&self, pc: AppPc, buf: &mut [u8]) -> usize {
        let Some(offset) = pc.checked_sub(self.base) else {
            return 0;
        };
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return 0;
        }
        let n = (self.bytes.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&self.bytes[offset..offset + n]);
        n
    }
}

/// Consulted before decoding a direct successor: a hit means the target is
/// already compiled and the edge can link straight into the cache.
pub trait CacheProbe {
    /// The cache PC of an existing translation of `pc`, if any.
    fn probe(&self, pc: AppPc) -> Option<CachePc>;
}

/// Probe that never hits.
impl CacheProbe for () {
    fn probe(&self, _pc: AppPc) -> Option<CachePc> {
        None
    }
}

/// A graph of decoded blocks rooted at an entry block. The trace owns its
/// blocks; everything else refers to them by [`BlockId`].
#[derive(Debug)]
pub struct Trace {
    blocks: Vec<DecodedBlock>,
    /// The entry block.
    pub entry: BlockId,
    /// Blocks added by the most recent materialisation round.
    pub new_blocks: Vec<BlockId>,
    next_label: u32,
}

impl Trace {
    fn empty() -> Self {
        Trace {
            blocks: Vec::new(),
            entry: BlockId(0),
            new_blocks: Vec::new(),
            next_label: 0,
        }
    }

    /// Allocate a fresh label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn add_block(&mut self, pc: AppPc, stack_validity: StackValidity) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let entry_label = self.new_label();
        self.blocks
            .push(DecodedBlock::new(id, pc, entry_label, stack_validity));
        self.new_blocks.push(id);
        id
    }

    /// Shared access to a block.
    pub fn block(&self, id: BlockId) -> &DecodedBlock {
        &self.blocks[id.0 as usize]
    }

    /// Mutable access to a block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut DecodedBlock {
        &mut self.blocks[id.0 as usize]
    }

    /// All blocks, in materialisation order.
    pub fn blocks(&self) -> impl Iterator<Item = &DecodedBlock> {
        self.blocks.iter()
    }

    /// Mutable iteration over all blocks.
    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut DecodedBlock> {
        self.blocks.iter_mut()
    }

    /// Number of blocks in the trace.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Decode a trace rooted at `entry_pc`, following direct control flow
/// breadth-first until every direct successor is either decoded, found in
/// the cache through `probe`, or degraded to a native transfer by the block
/// budget.
pub fn materialise(
    reader: &impl CodeReader,
    probe: &impl CacheProbe,
    entry_pc: AppPc,
    stack_validity: StackValidity,
) -> Trace {
    let mut trace = Trace::empty();
    let mut by_pc: HashMap<AppPc, BlockId> = HashMap::new();
    let mut queue: VecDeque<AppPc> = VecDeque::new();

    let entry = trace.add_block(entry_pc, stack_validity);
    trace.entry = entry;
    by_pc.insert(entry_pc, entry);
    decode_block(reader, &mut trace, entry);
    enqueue_direct_targets(&trace, entry, &by_pc, probe, &mut queue);

    while let Some(pc) = queue.pop_front() {
        if by_pc.contains_key(&pc) {
            continue;
        }
        if trace.num_blocks() >= MAX_TRACE_BLOCKS {
            break;
        }
        // An unreadable target stays a native transfer; only the entry block
        // insists on decoding (and truncates cleanly if it cannot).
        let mut probe_byte = [0u8; 1];
        if reader.read(pc, &mut probe_byte) == 0 {
            continue;
        }
        // Everything past the entry runs on whatever discipline the entry
        // established; stack-switch detection happens per instruction in the
        // fragment builder.
        let id = trace.add_block(pc, stack_validity);
        by_pc.insert(pc, id);
        decode_block(reader, &mut trace, id);
        enqueue_direct_targets(&trace, id, &by_pc, probe, &mut queue);
    }

    // Resolution pass: no `Direct` successor survives to encoding.
    for block in trace.blocks.iter_mut() {
        for stmt in &mut block.stmts {
            if let Stmt::Cfi(_, succ) = stmt {
                if let Successor::Direct(pc) = *succ {
                    *succ = match by_pc.get(&pc) {
                        Some(id) => Successor::Decoded(*id),
                        None => match probe.probe(pc) {
                            Some(cache_pc) => Successor::Cached(cache_pc),
                            None => Successor::Native(pc),
                        },
                    };
                }
            }
        }
    }

    log::debug!(
        "materialised {} block(s) from {entry_pc:#x}",
        trace.num_blocks()
    );
    trace
}

fn enqueue_direct_targets(
    trace: &Trace,
    id: BlockId,
    by_pc: &HashMap<AppPc, BlockId>,
    probe: &impl CacheProbe,
    queue: &mut VecDeque<AppPc>,
) {
    for succ in trace.block(id).successors() {
        if let Successor::Direct(pc) = succ {
            if !by_pc.contains_key(&pc) && probe.probe(pc).is_none() {
                queue.push_back(pc);
            }
        }
    }
}

/// Decode instructions into `block` until a control-flow instruction ends
/// it. Decode failures truncate the block with a synthesised transfer to
/// native code at the failing PC.
fn decode_block(reader: &impl CodeReader, trace: &mut Trace, id: BlockId) {
    let mut pc = trace.block(id).start_pc;
    let mut stmts = Vec::new();

    loop {
        let mut window = [0u8; granary_x64::MAX_INSTRUCTION_BYTES];
        let n = reader.read(pc, &mut window);
        let decoded = if n == 0 {
            Err(DecodeError::Truncated { pc })
        } else {
            decode_next(&window[..n], pc)
        };

        let (instr, next_pc) = match decoded {
            Ok(ok) => ok,
            Err(err) => {
                // Hard wall: end the block cleanly before the failing
                // instruction and hand control back to native code.
                log::debug!("truncating {id} at {pc:#x}: {err}");
                stmts.push(Stmt::Cfi(builder::jmp_rel(pc), Successor::Native(pc)));
                break;
            }
        };

        match instr.category() {
            Category::Other => {
                stmts.push(Stmt::Instr(instr));
                pc = next_pc;
            }
            Category::CondJump => {
                let target = instr
                    .branch_target_pc()
                    .expect("conditional jump with no direct target");
                stmts.push(Stmt::Cfi(instr, Successor::Direct(target)));
                // A synthesised fall-through jump so the block ends in
                // exactly one unconditional transfer.
                stmts.push(Stmt::Cfi(
                    builder::jmp_rel(next_pc),
                    Successor::Direct(next_pc),
                ));
                break;
            }
            Category::Call => {
                let succ = match instr.branch_target_pc() {
                    Some(target) => Successor::Direct(target),
                    None => Successor::Indirect,
                };
                stmts.push(Stmt::Cfi(instr, succ));
                stmts.push(Stmt::Cfi(
                    builder::jmp_rel(next_pc),
                    Successor::Direct(next_pc),
                ));
                break;
            }
            Category::UncondJump => {
                let succ = match instr.branch_target_pc() {
                    Some(target) => Successor::Direct(target),
                    None => Successor::Indirect,
                };
                stmts.push(Stmt::Cfi(instr, succ));
                break;
            }
            Category::Return => {
                stmts.push(Stmt::Cfi(instr, Successor::Return { specialized: false }));
                break;
            }
            Category::Syscall => {
                // The kernel returns to the next instruction; keep
                // translating from there.
                stmts.push(Stmt::Instr(instr));
                stmts.push(Stmt::Cfi(
                    builder::jmp_rel(next_pc),
                    Successor::Direct(next_pc),
                ));
                break;
            }
            Category::Interrupt => {
                // Control never falls past a trap generator; anything after
                // it stays native.
                stmts.push(Stmt::Instr(instr));
                stmts.push(Stmt::Cfi(
                    builder::jmp_rel(next_pc),
                    Successor::Native(next_pc),
                ));
                break;
            }
        }
    }

    trace.block_mut(id).stmts = stmts;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(base: AppPc, bytes: &[u8]) -> SliceReader<'_> {
        SliceReader { base, bytes }
    }

    #[test]
    fn straight_line_block_ends_at_ret() {
        // mov rax, rbx; ret
        let bytes = [0x48, 0x89, 0xD8, 0xC3];
        let trace = materialise(&reader(0x1000, &bytes), &(), 0x1000, StackValidity::Valid);
        assert_eq!(trace.num_blocks(), 1);
        let block = trace.block(trace.entry);
        assert_eq!(block.stmts.len(), 2);
        assert!(matches!(
            block.stmts[1],
            Stmt::Cfi(_, Successor::Return { specialized: false })
        ));
    }

    #[test]
    fn conditional_jump_grows_both_edges() {
        // 0x1000: jz +2 (-> 0x1004); xor eax, eax;  0x1004: ret
        let bytes = [0x74, 0x02, 0x31, 0xC0, 0xC3];
        let trace = materialise(&reader(0x1000, &bytes), &(), 0x1000, StackValidity::Valid);
        // Entry, taken target, fall-through.
        assert_eq!(trace.num_blocks(), 3);
        let entry = trace.block(trace.entry);
        let succs: Vec<_> = entry.successors().collect();
        assert_eq!(succs.len(), 2);
        assert!(matches!(succs[0], Successor::Decoded(_)));
        assert!(matches!(succs[1], Successor::Decoded(_)));
        // Every block ends in an unconditional transfer.
        for block in trace.blocks() {
            assert!(matches!(block.stmts.last(), Some(Stmt::Cfi(..))));
        }
    }

    #[test]
    fn unreadable_target_degrades_to_native() {
        // jmp 0x9000 with nothing readable there.
        let bytes = [0xE9, 0xFB, 0x7F, 0x00, 0x00]; // jmp +0x7ffb -> 0x9000
        let trace = materialise(&reader(0x1000, &bytes), &(), 0x1000, StackValidity::Valid);
        assert_eq!(trace.num_blocks(), 1);
        let succs: Vec<_> = trace.block(trace.entry).successors().collect();
        assert_eq!(succs, vec![Successor::Native(0x9000)]);
    }

    #[test]
    fn cache_probe_short_circuits_decoding() {
        struct Hit;
        impl CacheProbe for Hit {
            fn probe(&self, pc: AppPc) -> Option<CachePc> {
                (pc == 0x2000).then_some(0x7000)
            }
        }
        // jmp 0x2000
        let bytes = [0xE9, 0xFB, 0x0F, 0x00, 0x00];
        let trace = materialise(&reader(0x1000, &bytes), &Hit, 0x1000, StackValidity::Valid);
        assert_eq!(trace.num_blocks(), 1);
        let succs: Vec<_> = trace.block(trace.entry).successors().collect();
        assert_eq!(succs, vec![Successor::Cached(0x7000)]);
    }

    #[test]
    fn virtual_registers_are_block_salted() {
        let bytes = [0xC3];
        let mut trace = materialise(&reader(0x1000, &bytes), &(), 0x1000, StackValidity::Valid);
        let entry = trace.entry;
        let a = trace.block_mut(entry).alloc_virtual_register(8);
        let b = trace.block_mut(entry).alloc_virtual_register(8);
        assert_ne!(a.number(), b.number());
    }
}
