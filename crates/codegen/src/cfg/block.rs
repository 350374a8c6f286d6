//! One decoded basic block.

use core::fmt;

use granary_x64::{AppPc, CachePc, Instruction, Label, VirtualRegister};

/// An opaque reference to a block in its owning [`super::Trace`].
///
/// Blocks form a cyclic graph (a loop's back edge points at an earlier
/// block), so control-flow instructions carry ids into the trace's arena
/// rather than owning references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// Whether the stack pointer points at a valid application stack on entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackValidity {
    /// The stack pointer is known to reference a real stack.
    Valid,
    /// Nothing is known; the block may run on a switched stack.
    Unknown,
}

/// Where a control-flow instruction leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Successor {
    /// A block decoded into this trace.
    Decoded(BlockId),
    /// An unresolved direct target; materialised (or degraded to `Native`)
    /// before encoding.
    Direct(AppPc),
    /// The target lives in a register or memory cell.
    Indirect,
    /// A function return; `specialized` returns have their target routed
    /// through meta-data and are rewritten by the mangler.
    Return {
        /// Is the return target specialised via meta-data?
        specialized: bool,
    },
    /// Control leaves the cache for native code at this PC.
    Native(AppPc),
    /// The target is already compiled at this cache PC.
    Cached(CachePc),
}

/// Bookkeeping markers threaded through instruction lists.
///
/// Annotations never encode to bytes; they carry state between the fragment
/// builder, the register scheduler and the emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Annotation {
    /// A general-purpose register is saved to its scheduler-chosen slot here.
    SaveReg(VirtualRegister),
    /// The mirror restore point of [`Annotation::SaveReg`].
    RestoreReg(VirtualRegister),
    /// A virtual register live out of the predecessor dies on this edge;
    /// placed in compensation fragments so liveness invariants stay uniform.
    NodeKill(VirtualRegister),
    /// Upper bound of the partition-local scheduler's reverse walk.
    PartitionLocalBegin,
    /// Upper bound of the fragment-local scheduler's reverse walk.
    FragLocalBegin,
    /// A pure copy into this virtual register was elided; liveness analyses
    /// still see the definition through this marker.
    ElidedCopy(VirtualRegister),
    /// Start of a zone whose flags must be saved.
    FlagZoneEnter,
    /// End of a flag zone.
    FlagZoneExit,
}

/// One element of a block's (and later a fragment's) instruction list.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// A straight-line native instruction, decoded or synthesised.
    Instr(Instruction),
    /// A label; branch targets and pinned-cell references resolve here.
    Label(Label),
    /// A branch to a label in the same block.
    Branch(Instruction, Label),
    /// A control-flow instruction and the block it leads to.
    Cfi(Instruction, Successor),
    /// A scheduler/emitter marker; encodes to nothing.
    Annot(Annotation),
}

impl Stmt {
    /// The native instruction carried by this statement, if any.
    pub fn instr(&self) -> Option<&Instruction> {
        match self {
            Stmt::Instr(i) | Stmt::Branch(i, _) | Stmt::Cfi(i, _) => Some(i),
            _ => None,
        }
    }

    /// Mutable access to the carried native instruction.
    pub fn instr_mut(&mut self) -> Option<&mut Instruction> {
        match self {
            Stmt::Instr(i) | Stmt::Branch(i, _) | Stmt::Cfi(i, _) => Some(i),
            _ => None,
        }
    }
}

/// A pinned 8-byte cell holding a native address, emitted into the cache
/// region alongside the code that references it.
#[derive(Clone, Copy, Debug)]
pub struct NativeAddress {
    /// Label bound to the cell at layout time.
    pub label: Label,
    /// The native address stored in the cell.
    pub value: AppPc,
}

/// A basic block decoded from application code, not yet committed.
#[derive(Debug)]
pub struct DecodedBlock {
    /// This block's id within its trace.
    pub id: BlockId,
    /// Native start PC.
    pub start_pc: AppPc,
    /// Compiled start PC, filled in after encoding.
    pub cache_pc: Option<CachePc>,
    /// Label bound to the block's first emitted byte.
    pub entry_label: Label,
    /// The instruction list. Owned by the block until the fragment builder
    /// takes it.
    pub stmts: Vec<Stmt>,
    /// Pinned native-address cells created by the mangler.
    pub native_addrs: Vec<NativeAddress>,
    /// Stack validity on entry.
    pub stack_validity: StackValidity,
    next_vr: u16,
}

impl DecodedBlock {
    pub(crate) fn new(
        id: BlockId,
        start_pc: AppPc,
        entry_label: Label,
        stack_validity: StackValidity,
    ) -> Self {
        DecodedBlock {
            id,
            start_pc,
            cache_pc: None,
            entry_label,
            stmts: Vec::new(),
            native_addrs: Vec::new(),
            stack_validity,
            next_vr: 0,
        }
    }

    /// Allocate a fresh virtual register for use within this block.
    ///
    /// Numbers are salted with the block id so that registers from different
    /// blocks never collide in the scheduler's node table.
    pub fn alloc_virtual_register(&mut self, bytes: u8) -> VirtualRegister {
        let num = (self.id.0 as u16) << 8 | self.next_vr;
        assert!(self.next_vr < 0xFF, "virtual register overflow in {}", self.id);
        self.next_vr += 1;
        VirtualRegister::virt(num, bytes)
    }

    /// The block's successors, in CFI order (taken edge before fall-through).
    pub fn successors(&self) -> impl Iterator<Item = Successor> + '_ {
        self.stmts.iter().filter_map(|stmt| match stmt {
            Stmt::Cfi(_, succ) => Some(*succ),
            _ => None,
        })
    }
}
