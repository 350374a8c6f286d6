//! Cutting decoded blocks into single-entry fragments and colouring them
//! into stack-discipline partitions.

use core::fmt;

use hashbrown::{HashMap, HashSet};

use granary_x64::{GprSet, Label, Rflags, VirtualRegister};

use crate::cfg::{Annotation, BlockId, NativeAddress, Stmt, Trace};

/// An opaque reference to a fragment in its [`FragmentGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragId(pub u32);

impl fmt::Display for FragId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frag{}", self.0)
    }
}

/// What a fragment is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragKind {
    /// Ordinary application or instrumentation code.
    Code,
    /// Synthesised on an edge to kill virtual registers whose liveness
    /// narrows; contains only annotations.
    Compensation,
    /// Holds the flag save sequence of a zone.
    FlagEntry,
    /// Holds the flag restore sequence of a zone.
    FlagExit,
}

/// Spill bookkeeping for one fragment.
#[derive(Clone, Copy, Debug, Default)]
pub struct Spill {
    /// Bitmap of slots used by cross-fragment registers in this fragment.
    pub used_slots: u32,
    /// Total slot count (partition slots plus local slots).
    pub num_slots: u16,
    /// Slots owned by the partition; local allocation starts above these.
    pub num_partition_slots: u16,
}

/// A maximal single-entry run of statements.
#[derive(Debug)]
pub struct Fragment {
    /// This fragment's id.
    pub id: FragId,
    /// The block the statements came from.
    pub block: BlockId,
    /// Role of the fragment.
    pub kind: FragKind,
    /// Label bound to the fragment's first emitted byte.
    pub entry_label: Label,
    /// The statements, in forward order.
    pub stmts: Vec<Stmt>,
    /// Where control continues when the terminal statement does not take
    /// its branch (or has none).
    pub fall_through: Option<FragId>,
    /// Target of the terminal conditional branch, if any.
    pub branch: Option<FragId>,
    /// Partition colour: positive on a valid stack, negative on an unknown
    /// one, zero only transiently during colouring.
    pub partition: i32,
    /// The first instruction replaces the stack pointer without reading it.
    pub switches_stack: bool,
    /// Any instruction reads the stack pointer.
    pub reads_sp: bool,
    /// Any instruction writes the stack pointer.
    pub writes_sp: bool,
    /// Spill bookkeeping.
    pub spill: Spill,
    /// Index of the flag zone this fragment belongs to, if any.
    pub flag_zone: Option<usize>,
    /// Virtual registers live on entry (numbers, width-normalised).
    pub entry_vr_live: HashSet<u16>,
    /// Virtual registers live on exit.
    pub exit_vr_live: HashSet<u16>,
    /// GPRs live on entry.
    pub entry_gpr_live: GprSet,
    /// GPRs live on exit.
    pub exit_gpr_live: GprSet,
    /// Flags live on entry.
    pub entry_flags_live: Rflags,
    /// Flags live on exit.
    pub exit_flags_live: Rflags,
}

impl Fragment {
    pub(crate) fn new(id: FragId, block: BlockId, entry_label: Label) -> Self {
        Fragment {
            id,
            block,
            kind: FragKind::Code,
            entry_label,
            stmts: Vec::new(),
            fall_through: None,
            branch: None,
            partition: 0,
            switches_stack: false,
            reads_sp: false,
            writes_sp: false,
            spill: Spill::default(),
            flag_zone: None,
            entry_vr_live: HashSet::new(),
            exit_vr_live: HashSet::new(),
            entry_gpr_live: GprSet::empty(),
            exit_gpr_live: GprSet::empty(),
            entry_flags_live: Rflags::empty(),
            exit_flags_live: Rflags::empty(),
        }
    }

    /// Successor fragments, taken edge first.
    pub fn successors(&self) -> impl Iterator<Item = FragId> + '_ {
        self.branch.into_iter().chain(self.fall_through)
    }
}

/// Per-partition scheduling state.
#[derive(Debug, Default)]
pub struct PartitionInfo {
    /// High-water mark of slots allocated across the partition.
    pub num_slots: u16,
}

/// The fragment graph of one trace, in layout (emission) order.
#[derive(Debug)]
pub struct FragmentGraph {
    /// All fragments, indexed by [`FragId`].
    pub frags: Vec<Fragment>,
    /// The entry fragment.
    pub entry: FragId,
    /// Entry fragment of each block.
    pub block_entry: HashMap<BlockId, FragId>,
    /// Entry label of each block (resolved by the emitter).
    pub block_label: HashMap<BlockId, Label>,
    /// Pinned native-address cells collected from all blocks.
    pub native_addrs: Vec<NativeAddress>,
    /// Per-partition state, keyed by colour.
    pub partitions: HashMap<i32, PartitionInfo>,
    /// Flag zones; fragments point in via `flag_zone`.
    pub zones: Vec<super::flags::FlagZone>,
    next_label: u32,
}

impl FragmentGraph {
    /// Shared access to a fragment.
    pub fn frag(&self, id: FragId) -> &Fragment {
        &self.frags[id.0 as usize]
    }

    /// Mutable access to a fragment.
    pub fn frag_mut(&mut self, id: FragId) -> &mut Fragment {
        &mut self.frags[id.0 as usize]
    }

    /// Allocate a fresh label (the label space continues the trace's).
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Ids of all fragments in layout order.
    pub fn ids(&self) -> Vec<FragId> {
        (0..self.frags.len() as u32).map(FragId).collect()
    }

    /// Ids of the fragments of partition `colour`, in layout order.
    pub fn partition_frags(&self, colour: i32) -> Vec<FragId> {
        self.frags
            .iter()
            .filter(|f| f.partition == colour)
            .map(|f| f.id)
            .collect()
    }

    fn add(&mut self, block: BlockId) -> FragId {
        let id = FragId(self.frags.len() as u32);
        let label = self.new_label();
        self.frags.push(Fragment::new(id, block, label));
        id
    }

    /// Build the fragment graph from a mangled trace, consuming the blocks'
    /// statement lists.
    pub fn build(trace: &mut Trace) -> FragmentGraph {
        let mut graph = FragmentGraph {
            frags: Vec::new(),
            entry: FragId(0),
            block_entry: HashMap::new(),
            block_label: HashMap::new(),
            native_addrs: Vec::new(),
            partitions: HashMap::new(),
            zones: Vec::new(),
            // Labels allocated so far belong to the trace; continue after a
            // generous margin so fragment labels never collide.
            next_label: 1 << 20,
        };

        let mut label_frag: HashMap<Label, FragId> = HashMap::new();
        // (frag, label) pairs needing branch-edge resolution.
        let mut pending_branches: Vec<(FragId, Label)> = Vec::new();

        let ids: Vec<BlockId> = trace.blocks().map(|b| b.id).collect();
        for bid in ids {
            let block = trace.block_mut(bid);
            let stmts = std::mem::take(&mut block.stmts);
            let block_label = block.entry_label;
            graph.native_addrs.append(&mut block.native_addrs);
            graph.block_label.insert(bid, block_label);

            let mut cur = graph.add(bid);
            graph.block_entry.insert(bid, cur);

            let mut finish =
                |graph: &mut FragmentGraph, cur: FragId, link: bool| -> FragId {
                    let next = graph.add(bid);
                    if link {
                        graph.frag_mut(cur).fall_through = Some(next);
                    }
                    next
                };

            for stmt in stmts {
                match stmt {
                    Stmt::Label(label) => {
                        // A label is a join point; it must start its own
                        // fragment to keep fragments single-entry.
                        let next = finish(&mut graph, cur, true);
                        label_frag.insert(label, next);
                        graph.frag_mut(next).stmts.push(Stmt::Label(label));
                        cur = next;
                    }
                    Stmt::Branch(instr, target) => {
                        let conditional = instr.is_conditional_jump();
                        graph.frag_mut(cur).stmts.push(Stmt::Branch(instr, target));
                        pending_branches.push((cur, target));
                        cur = finish(&mut graph, cur, conditional);
                    }
                    Stmt::Cfi(instr, succ) => {
                        // Conditional transfers fall through; so do calls,
                        // whose callees return to the statement after them.
                        let falls_through =
                            instr.is_conditional_jump() || instr.is_function_call();
                        graph.frag_mut(cur).stmts.push(Stmt::Cfi(instr, succ));
                        cur = finish(&mut graph, cur, falls_through);
                    }
                    Stmt::Annot(a @ (Annotation::FlagZoneEnter | Annotation::FlagZoneExit)) => {
                        let next = finish(&mut graph, cur, true);
                        graph.frag_mut(next).stmts.push(Stmt::Annot(a));
                        cur = next;
                    }
                    Stmt::Instr(instr) => {
                        let writes = instr.writes_stack_pointer();
                        let reads = instr.reads_stack_pointer();
                        if writes && !reads {
                            // A strict stack switch starts a new partition.
                            let next = finish(&mut graph, cur, true);
                            let frag = graph.frag_mut(next);
                            frag.switches_stack = true;
                            frag.writes_sp = true;
                            frag.stmts.push(Stmt::Instr(instr));
                            cur = next;
                        } else {
                            let frag = graph.frag_mut(cur);
                            frag.reads_sp |= reads;
                            frag.writes_sp |= writes;
                            frag.stmts.push(Stmt::Instr(instr));
                        }
                    }
                    Stmt::Annot(a) => graph.frag_mut(cur).stmts.push(Stmt::Annot(a)),
                }
            }
        }

        // Resolve local branch edges now every label has a home.
        for (frag, label) in pending_branches {
            let target = *label_frag
                .get(&label)
                .unwrap_or_else(|| panic!("branch to unbound label .L{}", label.0));
            graph.frag_mut(frag).branch = Some(target);
        }

        // Cross-block fall-through: a fragment ending in a conditional CFI
        // continues in the same block; the Decoded edge itself is resolved
        // through `block_entry` during analysis and emission.
        graph.entry = graph.block_entry[&trace.entry];
        graph.drop_empty_tails();
        graph.colour_partitions(trace);
        graph
    }

    /// Block cutting leaves an empty fragment after each block's terminal
    /// CFI; unlink them.
    fn drop_empty_tails(&mut self) {
        let empties: HashSet<u32> = self
            .frags
            .iter()
            .filter(|f| f.stmts.is_empty() && f.fall_through.is_none() && f.branch.is_none())
            .map(|f| f.id.0)
            .collect();
        for frag in &mut self.frags {
            if let Some(ft) = frag.fall_through {
                if empties.contains(&ft.0) {
                    frag.fall_through = None;
                }
            }
        }
    }

    /// Colour fragments into partitions: positive on a valid stack,
    /// negative on an unknown or switched one. Crossing into a
    /// stack-switching fragment opens a fresh negative colour.
    fn colour_partitions(&mut self, trace: &Trace) {
        use crate::cfg::StackValidity;

        let entry_colour: i32 = match trace.block(trace.entry).stack_validity {
            StackValidity::Valid => 1,
            StackValidity::Unknown => -1,
        };
        let mut next_magnitude = entry_colour.abs() + 1;

        let mut work = vec![(self.entry, entry_colour)];
        while let Some((id, colour)) = work.pop() {
            let frag = self.frag(id);
            if frag.partition != 0 {
                continue;
            }
            let colour = if frag.switches_stack {
                let c = -next_magnitude;
                next_magnitude += 1;
                c
            } else {
                colour
            };
            self.frag_mut(id).partition = colour;
            self.partitions.entry(colour).or_default();

            let frag = self.frag(id);
            let mut succs: Vec<FragId> = frag.successors().collect();
            // Decoded CFI edges connect across blocks.
            for stmt in &frag.stmts {
                if let Stmt::Cfi(_, crate::cfg::Successor::Decoded(b)) = stmt {
                    succs.push(self.block_entry[b]);
                }
            }
            for succ in succs {
                work.push((succ, colour));
            }
        }

        // Unreached fragments (dead labels) still need a colour.
        for frag in &mut self.frags {
            if frag.partition == 0 {
                frag.partition = entry_colour;
            }
        }
    }

    /// Insert a compensation fragment on every edge where the set of live
    /// virtual registers narrows, so that a register live out of a fragment
    /// is live into every same-partition successor.
    pub fn insert_compensation(&mut self) {
        let ids = self.ids();
        for id in ids {
            for (is_branch, succ) in [
                (true, self.frag(id).branch),
                (false, self.frag(id).fall_through),
            ] {
                let Some(succ) = succ else { continue };
                if self.frag(id).partition != self.frag(succ).partition {
                    continue;
                }
                let dying: Vec<u16> = self
                    .frag(id)
                    .exit_vr_live
                    .difference(&self.frag(succ).entry_vr_live)
                    .copied()
                    .collect();
                if dying.is_empty() {
                    continue;
                }

                let comp = self.add(self.frag(id).block);
                let pred = self.frag(id);
                let (partition, exit_live) =
                    (pred.partition, pred.exit_vr_live.clone());
                {
                    let frag = self.frag_mut(comp);
                    frag.kind = FragKind::Compensation;
                    frag.partition = partition;
                    frag.fall_through = Some(succ);
                    frag.entry_vr_live = exit_live;
                    for vr in &dying {
                        frag.stmts.push(Stmt::Annot(Annotation::NodeKill(
                            VirtualRegister::virt(*vr, granary_x64::GPR_WIDTH_BYTES),
                        )));
                    }
                }
                let succ_entry = self.frag(succ).entry_vr_live.clone();
                self.frag_mut(comp).exit_vr_live = succ_entry;
                if is_branch {
                    self.frag_mut(id).branch = Some(comp);
                    // The branch statement must now target the compensation
                    // fragment's label.
                    let comp_label = self.frag(comp).entry_label;
                    if let Some(Stmt::Branch(instr, target)) =
                        self.frag_mut(id).stmts.last_mut()
                    {
                        instr.set_branch_target_label(comp_label);
                        *target = comp_label;
                    }
                } else {
                    self.frag_mut(id).fall_through = Some(comp);
                }
                log::trace!(
                    "compensation fragment {comp} on {id} edge: kills {dying:?}"
                );
            }
        }
    }
}
