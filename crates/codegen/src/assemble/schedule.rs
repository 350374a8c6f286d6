//! Assigning virtual registers to GPRs and spill slots.
//!
//! Scheduling is a bottom-to-top process: fragments are walked in reverse
//! instruction order, so decisions describe what later instructions already
//! assume. It runs as two strictly sequential passes.
//!
//! The *partition-local* pass handles registers that are live across
//! fragment boundaries. Each such register gets a preferred GPR (the least
//! statically used GPR in the partition not already preferred by another
//! register) and a spill slot that interferes with no simultaneously-live
//! register in the partition. Within each fragment the pass maintains a
//! location map and repairs it with swap sequences whenever a native
//! instruction touches the GPR currently holding the register.
//!
//! The *fragment-local* pass schedules the remaining registers one fragment
//! at a time, with slot sharing: when a register's last use has been
//! processed (first, in reverse order) its slot becomes reusable by another
//! non-interfering register. Pure copies into fragment-local registers are
//! elided and replaced by a marker annotation.
//!
//! The partition pass writes its outputs (slot assignments, injected
//! spills, operand rewrites) before the fragment pass reads anything; the
//! fragment pass never revisits a register the partition pass scheduled.

use hashbrown::HashMap;

use granary_x64::{
    builder, Gpr, GprSet, Instruction, Opcode, OpcodeForm, Operand, OperandAction, OperandKind,
    VirtualRegister, GPR_WIDTH_BYTES, NUM_GPRS,
};

use crate::cfg::{Annotation, Stmt};

use super::fragment::{FragId, FragKind, FragmentGraph};

/// Upper bound on spill slots per partition.
pub const MAX_NUM_SPILL_SLOTS: u16 = 32;

/// Tracks which register webs have been scheduled.
///
/// Every web gets an even id; the low bit is set once a pass has assigned
/// the register a home.
#[derive(Debug, Default)]
pub struct NodeTable {
    ids: HashMap<u16, u32>,
    next: u32,
}

impl NodeTable {
    fn id_of(&mut self, vr: u16) -> u32 {
        let next = &mut self.next;
        *self.ids.entry(vr).or_insert_with(|| {
            let id = *next << 1;
            *next += 1;
            id
        })
    }

    fn is_scheduled(&self, vr: u16) -> bool {
        self.ids.get(&vr).is_some_and(|id| id & 1 == 1)
    }

    fn mark_scheduled(&mut self, vr: u16) {
        let id = self.id_of(vr);
        self.ids.insert(vr, id | 1);
    }
}

/// Where a register's value currently lives, from the perspective of the
/// reverse walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LocKind {
    /// In the named GPR.
    Gpr,
    /// In the spill slot.
    Slot,
    /// In the slot, but the slot's value is needed by both the GPR's native
    /// contents and a register (slot sharing).
    LiveSlot,
}

#[derive(Clone, Copy, Debug)]
struct Loc {
    loc: VirtualRegister,
    kind: LocKind,
}

impl Loc {
    fn gpr(g: Gpr) -> Loc {
        Loc {
            loc: VirtualRegister::native(g),
            kind: LocKind::Gpr,
        }
    }
}

// Move and exchange helpers between GPRs and slots. Slots appear as
// register operands here; the encoder lowers them to save-area accesses.

fn save_gpr_to_slot(gpr: VirtualRegister, slot: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::RmR, 64);
    instr.push_op(Operand::explicit(
        OperandKind::Reg(slot),
        OperandAction::Write,
        64,
    ));
    instr.push_op(Operand::explicit(
        OperandKind::Reg(gpr.widened(8)),
        OperandAction::Read,
        64,
    ));
    instr
}

fn restore_gpr_from_slot(gpr: VirtualRegister, slot: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::RRm, 64);
    instr.push_op(Operand::explicit(
        OperandKind::Reg(gpr.widened(8)),
        OperandAction::Write,
        64,
    ));
    instr.push_op(Operand::explicit(
        OperandKind::Reg(slot),
        OperandAction::Read,
        64,
    ));
    instr
}

fn swap_gpr_with_gpr(a: VirtualRegister, b: VirtualRegister) -> Instruction {
    builder::xchg_reg_reg(a.widened(8), b.widened(8))
}

fn swap_gpr_with_slot(gpr: VirtualRegister, slot: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Xchg, OpcodeForm::RmR, 64);
    instr.push_op(Operand::explicit(
        OperandKind::Reg(slot),
        OperandAction::ReadWrite,
        64,
    ));
    instr.push_op(Operand::explicit(
        OperandKind::Reg(gpr.widened(8)),
        OperandAction::ReadWrite,
        64,
    ));
    instr
}

/// GPRs named by an instruction (as operands or address components).
fn gprs_of(instr: &Instruction) -> GprSet {
    let mut set = GprSet::empty();
    instr.visit_regs(|reg, _| {
        if reg.is_general_purpose() {
            set.insert(reg.gpr());
        }
    });
    set
}

/// Registers an instruction may never be rewritten to use.
fn restricted_gprs() -> GprSet {
    let mut set = GprSet::empty();
    set.insert(Gpr::Rsp);
    set
}

/// Static use counts of each GPR across a set of fragments.
fn count_gpr_uses(graph: &FragmentGraph, frags: &[FragId]) -> [u32; NUM_GPRS] {
    let mut counts = [0u32; NUM_GPRS];
    for id in frags {
        for stmt in &graph.frag(*id).stmts {
            if let Some(instr) = stmt.instr() {
                instr.visit_regs(|reg, _| {
                    if reg.is_general_purpose() {
                        counts[reg.number() as usize] += 1;
                    }
                });
            }
        }
    }
    counts
}

/// The least-used GPR outside `avoid`, preferring `prefer` when allowed.
fn get_gpr(counts: &[u32; NUM_GPRS], avoid: GprSet, prefer: Option<Gpr>) -> Gpr {
    if let Some(p) = prefer {
        if !avoid.contains(p) {
            return p;
        }
    }
    let mut best: Option<Gpr> = None;
    for g in Gpr::ALL {
        if avoid.contains(g) || restricted_gprs().contains(g) {
            continue;
        }
        if best.map_or(true, |b| counts[g.enc() as usize] < counts[b.enc() as usize]) {
            best = Some(g);
        }
    }
    best.expect("no schedulable GPR available")
}

/// Does `instr` use or define the virtual register numbered `vr`?
fn find_def_use(instr: &Instruction, vr: u16) -> (bool, bool) {
    let mut used = false;
    let mut defined = false;
    for op in &instr.ops {
        match &op.kind {
            OperandKind::Reg(r) if r.is_virtual() && r.number() == vr => {
                used |= op.action.may_read();
                defined |= op.action.always_writes();
            }
            OperandKind::Mem(m) | OperandKind::EffectiveAddress(m) => {
                if m.regs().any(|r| r.is_virtual() && r.number() == vr) {
                    used = true;
                }
            }
            _ => {}
        }
    }
    (used, defined)
}

/// Rewrite every occurrence of virtual register `vr` in `instr` to `gpr`.
fn replace_vr(instr: &mut Instruction, vr: u16, gpr: Gpr) {
    for op in &mut instr.ops {
        if op.is_sticky {
            continue;
        }
        match &mut op.kind {
            OperandKind::Reg(r) if r.is_virtual() && r.number() == vr => {
                *r = VirtualRegister::native_with_width(gpr, r.byte_width());
            }
            OperandKind::Mem(m) | OperandKind::EffectiveAddress(m) => {
                for r in m.regs_mut() {
                    if r.is_virtual() && r.number() == vr {
                        *r = VirtualRegister::native_with_width(gpr, GPR_WIDTH_BYTES);
                    }
                }
            }
            _ => {}
        }
    }
}

/// When the GPR currently holding the register is touched natively, move
/// the register to an alternative GPR and repair the native value through
/// the slot:
///
/// ```text
///     native use of r1
///     xchg r2, r1          (register value to r1's old home)
///     xchg r2, [slot]      (native r1 value to the slot, r2 back)
/// ```
#[allow(clippy::too_many_arguments)]
fn home_used_reg(
    stmts: &mut Vec<Stmt>,
    i: usize,
    vr_loc: &mut Loc,
    gpr_loc: &mut [Loc; NUM_GPRS],
    used: GprSet,
    avoid: GprSet,
    counts: &[u32; NUM_GPRS],
    pgpr: Option<Gpr>,
    slot: VirtualRegister,
) {
    if vr_loc.kind != LocKind::Gpr || !used.contains(vr_loc.loc.gpr()) {
        return;
    }
    let agpr = get_gpr(counts, avoid, pgpr);
    let old = vr_loc.loc;
    assert!(agpr != old.gpr(), "swap target collides with home");
    stmts.insert(
        i + 1,
        Stmt::Instr(swap_gpr_with_gpr(old, VirtualRegister::native(agpr))),
    );
    stmts.insert(
        i + 2,
        Stmt::Instr(swap_gpr_with_slot(VirtualRegister::native(agpr), slot)),
    );
    gpr_loc[old.gpr().enc() as usize] = Loc::gpr(old.gpr());
    gpr_loc[agpr.enc() as usize] = Loc {
        loc: slot,
        kind: LocKind::Slot,
    };
    vr_loc.loc = VirtualRegister::native(agpr);
}

/// Mark the bounds the two reverse walks stop at. The partition marker sits
/// first so partition-entry homing code lands ahead of fragment-local
/// spills.
fn add_begin_annotations(graph: &mut FragmentGraph) {
    for id in graph.ids() {
        let frag = graph.frag_mut(id);
        let at = frag
            .stmts
            .iter()
            .position(|s| !matches!(s, Stmt::Label(_)))
            .unwrap_or(frag.stmts.len());
        frag.stmts
            .insert(at, Stmt::Annot(Annotation::FragLocalBegin));
        frag.stmts
            .insert(at, Stmt::Annot(Annotation::PartitionLocalBegin));
    }
}

/// Schedule every register in the graph.
pub fn schedule(graph: &mut FragmentGraph) {
    let mut nodes = NodeTable::default();
    add_begin_annotations(graph);
    schedule_partition_local(graph, &mut nodes);
    update_partition_slot_counts(graph);
    schedule_fragment_local(graph, &mut nodes);
}

// ---------------------------------------------------------------------------
// Partition-local scheduling.

fn schedule_partition_local(graph: &mut FragmentGraph, nodes: &mut NodeTable) {
    let mut colours: Vec<i32> = graph.partitions.keys().copied().collect();
    colours.sort_unstable();

    for colour in colours {
        let frag_ids = graph.partition_frags(colour);
        let mut preferred_taken = restricted_gprs();

        loop {
            // An unscheduled register that crosses a fragment boundary.
            let vr = frag_ids.iter().find_map(|id| {
                let frag = graph.frag(*id);
                frag.exit_vr_live
                    .iter()
                    .chain(frag.entry_vr_live.iter())
                    .find(|vr| !nodes.is_scheduled(**vr))
                    .copied()
            });
            let Some(vr) = vr else { break };
            nodes.mark_scheduled(vr);

            let counts = count_gpr_uses(graph, &frag_ids);
            let pgpr = pick_preferred_gpr(&counts, &mut preferred_taken);
            let slot = find_slot_for_vr(graph, &frag_ids, vr, colour);
            log::debug!(
                "partition {colour}: vr {vr} -> pgpr {pgpr:?}, slot {slot}"
            );

            for id in &frag_ids {
                schedule_vr_in_frag(graph, *id, vr, pgpr, slot, &counts);
            }
        }
    }
}

/// The preferred GPR for the next register: fewest static uses among GPRs
/// not yet preferred by another register. `None` once all are taken, in
/// which case the register lives in its slot between fragments.
fn pick_preferred_gpr(counts: &[u32; NUM_GPRS], taken: &mut GprSet) -> Option<Gpr> {
    let mut best: Option<Gpr> = None;
    for g in Gpr::ALL {
        if taken.contains(g) {
            continue;
        }
        if best.map_or(true, |b| counts[g.enc() as usize] < counts[b.enc() as usize]) {
            best = Some(g);
        }
    }
    if let Some(g) = best {
        taken.insert(g);
    }
    best
}

/// A slot that does not interfere with any other register simultaneously
/// live in this partition: the union of used-slot maps over the fragments
/// where the register is live, lowest clear bit.
fn find_slot_for_vr(graph: &mut FragmentGraph, frags: &[FragId], vr: u16, colour: i32) -> u16 {
    let mut used: u32 = 0;
    for id in frags {
        let frag = graph.frag(*id);
        if frag.entry_vr_live.contains(&vr) || frag.exit_vr_live.contains(&vr) {
            used |= frag.spill.used_slots;
        }
    }
    let slot = (0..MAX_NUM_SPILL_SLOTS)
        .find(|i| used & (1 << i) == 0)
        .expect("spill slots exhausted");
    let part = graph.partitions.get_mut(&colour).expect("unknown partition");
    part.num_slots = part.num_slots.max(slot + 1);
    slot
}

/// One register, one fragment: restore the cross-fragment invariants while
/// rewriting every use to a concrete GPR.
fn schedule_vr_in_frag(
    graph: &mut FragmentGraph,
    id: FragId,
    vr: u16,
    pgpr: Option<Gpr>,
    slot_num: u16,
    counts: &[u32; NUM_GPRS],
) {
    let slot = VirtualRegister::slot(slot_num);
    let live_entry = graph.frag(id).entry_vr_live.contains(&vr);
    let live_exit = graph.frag(id).exit_vr_live.contains(&vr);
    if !live_entry && !live_exit {
        return;
    }
    graph.frag_mut(id).spill.used_slots |= 1 << slot_num;

    let mut stmts = std::mem::take(&mut graph.frag_mut(id).stmts);

    let mut gpr_loc: [Loc; NUM_GPRS] = core::array::from_fn(|i| Loc::gpr(Gpr::from_enc(i as u8)));
    let mut vr_loc = Loc {
        loc: slot,
        kind: LocKind::Slot,
    };
    if live_exit {
        match pgpr {
            Some(p) => {
                vr_loc = Loc {
                    loc: VirtualRegister::native(p),
                    kind: LocKind::Gpr,
                };
                gpr_loc[p.enc() as usize] = Loc {
                    loc: slot,
                    kind: LocKind::Slot,
                };
            }
            None => vr_loc.kind = LocKind::LiveSlot,
        }
    }

    let mut begin = 0usize;
    let mut i = stmts.len();
    while i > 0 {
        i -= 1;

        match &stmts[i] {
            Stmt::Annot(Annotation::PartitionLocalBegin) => {
                begin = i;
                break;
            }
            Stmt::Annot(Annotation::NodeKill(k)) if k.number() == vr => {
                // The register dies on this edge: the value arrives from the
                // predecessor but nothing below consumes it, so it cannot
                // already be homed to a GPR. Treat the kill as a use so the
                // entry-boundary homing below still fires.
                assert!(
                    vr_loc.kind != LocKind::Gpr,
                    "killed register still homed to a GPR"
                );
                let agpr = get_gpr(counts, restricted_gprs(), pgpr);
                let fill = if vr_loc.kind == LocKind::Slot {
                    restore_gpr_from_slot(VirtualRegister::native(agpr), slot)
                } else {
                    swap_gpr_with_slot(VirtualRegister::native(agpr), slot)
                };
                stmts.insert(i + 1, Stmt::Instr(fill));
                gpr_loc[agpr.enc() as usize] = Loc {
                    loc: slot,
                    kind: LocKind::Slot,
                };
                vr_loc = Loc {
                    loc: VirtualRegister::native(agpr),
                    kind: LocKind::Gpr,
                };
            }
            Stmt::Annot(Annotation::SaveReg(r)) | Stmt::Annot(Annotation::RestoreReg(r)) => {
                let mut used = GprSet::empty();
                if r.is_general_purpose() {
                    used.insert(r.gpr());
                }
                home_used_reg(
                    &mut stmts, i, &mut vr_loc, &mut gpr_loc, used, used, counts, pgpr, slot,
                );
            }
            Stmt::Annot(_) | Stmt::Label(_) => {}
            Stmt::Instr(instr) | Stmt::Branch(instr, _) | Stmt::Cfi(instr, _) => {
                let used = gprs_of(instr);
                let (is_used, is_defined) = find_def_use(instr, vr);
                let mut avoid = used;
                avoid.union(restricted_gprs());
                home_used_reg(
                    &mut stmts, i, &mut vr_loc, &mut gpr_loc, used, avoid, counts, pgpr, slot,
                );
                if !is_used && !is_defined {
                    continue;
                }

                // Fill: the value must be in a GPR for this instruction.
                if matches!(vr_loc.kind, LocKind::Slot | LocKind::LiveSlot) {
                    let agpr = get_gpr(counts, avoid, pgpr);
                    let fill = if vr_loc.kind == LocKind::Slot {
                        restore_gpr_from_slot(VirtualRegister::native(agpr), slot)
                    } else {
                        swap_gpr_with_slot(VirtualRegister::native(agpr), slot)
                    };
                    stmts.insert(i + 1, Stmt::Instr(fill));
                    gpr_loc[agpr.enc() as usize] = Loc {
                        loc: slot,
                        kind: LocKind::Slot,
                    };
                    vr_loc = Loc {
                        loc: VirtualRegister::native(agpr),
                        kind: LocKind::Gpr,
                    };
                }

                if let Some(instr) = stmts[i].instr_mut() {
                    replace_vr(instr, vr, vr_loc.loc.gpr());
                }

                // Spill: later instructions assume the value sits in the
                // slot once its definition has been seen.
                if is_defined {
                    assert!(vr_loc.kind == LocKind::Gpr);
                    assert!(!live_entry, "definition of a register live on entry");
                    let home = vr_loc.loc;
                    stmts.insert(i, Stmt::Instr(save_gpr_to_slot(home, slot)));
                    gpr_loc[home.gpr().enc() as usize] = Loc::gpr(home.gpr());
                    vr_loc = Loc {
                        loc: slot,
                        kind: LocKind::Slot,
                    };
                }
            }
        }
    }

    // Fragment entry boundary: between fragments the register lives in its
    // preferred GPR, or in its slot.
    if live_entry {
        assert!(vr_loc.kind != LocKind::Slot, "missing compensation fragment");
        match pgpr {
            Some(p) => {
                if vr_loc.loc.gpr() != p {
                    let preg = VirtualRegister::native(p);
                    stmts.insert(begin, Stmt::Instr(swap_gpr_with_gpr(vr_loc.loc, preg)));
                    stmts.insert(begin + 1, Stmt::Instr(swap_gpr_with_slot(preg, slot)));
                }
            }
            None => {
                if vr_loc.kind != LocKind::LiveSlot {
                    stmts.insert(begin, Stmt::Instr(swap_gpr_with_slot(vr_loc.loc, slot)));
                }
            }
        }
    } else {
        // First definition lives in this fragment; inject the initial
        // spill of the GPR the register displaced.
        if vr_loc.kind == LocKind::Gpr {
            stmts.insert(begin, Stmt::Instr(save_gpr_to_slot(vr_loc.loc, slot)));
        }
    }

    graph.frag_mut(id).stmts = stmts;
}

fn update_partition_slot_counts(graph: &mut FragmentGraph) {
    let ids = graph.ids();
    for id in ids {
        let colour = graph.frag(id).partition;
        let num = graph.partitions[&colour].num_slots;
        let frag = graph.frag_mut(id);
        frag.spill.num_partition_slots = num;
        frag.spill.num_slots = num;
    }
}

// ---------------------------------------------------------------------------
// Fragment-local scheduling.

struct FragScheduler {
    gpr_loc: [Loc; NUM_GPRS],
    /// Who currently occupies each GPR (the GPR itself, or a register).
    inverse: [Option<u16>; NUM_GPRS],
    vr_loc: HashMap<u16, Loc>,
    save_restore_slots: HashMap<u8, VirtualRegister>,
    slot_taken: u32,
    counts: [u32; NUM_GPRS],
    num_partition_slots: u16,
    num_slots: u16,
}

impl FragScheduler {
    fn new(graph: &FragmentGraph, id: FragId) -> FragScheduler {
        let frag = graph.frag(id);
        FragScheduler {
            gpr_loc: core::array::from_fn(|i| Loc::gpr(Gpr::from_enc(i as u8))),
            inverse: [None; NUM_GPRS],
            vr_loc: HashMap::new(),
            save_restore_slots: HashMap::new(),
            slot_taken: 0,
            counts: count_gpr_uses(graph, &[id]),
            num_partition_slots: frag.spill.num_partition_slots,
            num_slots: frag.spill.num_slots,
        }
    }

    fn alloc_slot(&mut self) -> VirtualRegister {
        let local = (0..MAX_NUM_SPILL_SLOTS)
            .find(|i| self.slot_taken & (1 << i) == 0)
            .expect("local spill slots exhausted");
        self.slot_taken |= 1 << local;
        let slot_id = self.num_partition_slots + local;
        self.num_slots = self.num_slots.max(slot_id + 1);
        VirtualRegister::slot(slot_id)
    }

    /// A free GPR (currently holding its own native value) outside `avoid`.
    fn get_gpr(&self, avoid: GprSet) -> Gpr {
        let mut best: Option<Gpr> = None;
        for g in Gpr::ALL {
            if avoid.contains(g) || restricted_gprs().contains(g) {
                continue;
            }
            let loc = &self.gpr_loc[g.enc() as usize];
            if !(loc.kind == LocKind::Gpr && loc.loc.is_native()) {
                continue;
            }
            if best.map_or(true, |b| self.counts[g.enc() as usize] < self.counts[b.enc() as usize]) {
                best = Some(g);
            }
        }
        best.expect("no free GPR for fragment-local scheduling")
    }

    /// A GPR whose slot can be shared (its native value is already assumed
    /// spilled, and no one holds it).
    fn shared_gpr(&self, avoid: GprSet) -> Option<Gpr> {
        Gpr::ALL.into_iter().find(|g| {
            self.gpr_loc[g.enc() as usize].kind == LocKind::LiveSlot && !avoid.contains(*g)
        })
    }
}

fn schedule_fragment_local(graph: &mut FragmentGraph, nodes: &NodeTable) {
    for id in graph.ids() {
        if matches!(graph.frag(id).kind, FragKind::Compensation) {
            continue;
        }
        schedule_frag(graph, id, nodes);
    }
}

fn schedule_frag(graph: &mut FragmentGraph, id: FragId, nodes: &NodeTable) {
    let mut sched = FragScheduler::new(graph, id);
    let mut stmts = std::mem::take(&mut graph.frag_mut(id).stmts);

    let mut begin = 0usize;
    let mut i = stmts.len();
    while i > 0 {
        i -= 1;
        match &stmts[i] {
            Stmt::Annot(Annotation::FragLocalBegin) => {
                begin = i;
                break;
            }
            Stmt::Annot(Annotation::SaveReg(r)) => {
                let gpr = r.gpr();
                // The save point pairs with a restore already processed;
                // leave the GPR spilled-but-shareable above this point.
                let slot = sched
                    .save_restore_slots
                    .remove(&gpr.enc())
                    .expect("save point without a matching restore");
                sched.gpr_loc[gpr.enc() as usize] = Loc {
                    loc: slot,
                    kind: LocKind::LiveSlot,
                };
                sched.inverse[gpr.enc() as usize] = None;
            }
            Stmt::Annot(Annotation::RestoreReg(r)) => {
                let gpr = r.gpr();
                let mut used = GprSet::empty();
                used.insert(gpr);
                home_used_gprs(&mut sched, &mut stmts, i, used, used);
                let slot = sched.alloc_slot();
                sched.save_restore_slots.insert(gpr.enc(), slot);
                stmts.insert(
                    i + 1,
                    Stmt::Instr(restore_gpr_from_slot(VirtualRegister::native(gpr), slot)),
                );
            }
            Stmt::Annot(_) | Stmt::Label(_) => {}
            Stmt::Instr(_) | Stmt::Branch(..) | Stmt::Cfi(..) => {
                if try_elide_copy(&mut sched, &mut stmts, i, nodes) {
                    continue;
                }
                let instr = stmts[i].instr().expect("statement carries an instruction");
                let used = gprs_of(instr);
                let mut avoid = used;
                avoid.union(restricted_gprs());
                home_used_gprs(&mut sched, &mut stmts, i, used, avoid);

                // Uses first (including the register side of definitions),
                // then definitions release homes for slot sharing.
                let vrs = virtual_regs_of(stmts[i].instr().unwrap());
                for vr in &vrs {
                    if nodes.is_scheduled(*vr) {
                        continue;
                    }
                    schedule_local_use(&mut sched, &mut stmts, i, *vr, used);
                }
                for vr in vrs {
                    if nodes.is_scheduled(vr) {
                        continue;
                    }
                    let (_, defined) = find_def_use(stmts[i].instr().unwrap(), vr);
                    if defined {
                        schedule_local_def(&mut sched, vr);
                    }
                }
            }
        }
    }

    // Registers assumed spilled by later instructions with nobody doing the
    // spilling yet: inject the original saves at the fragment head.
    for g in Gpr::ALL {
        let loc = sched.gpr_loc[g.enc() as usize];
        if loc.kind == LocKind::Gpr {
            continue;
        }
        assert!(loc.loc.is_virtual_slot());
        stmts.insert(
            begin,
            Stmt::Instr(save_gpr_to_slot(VirtualRegister::native(g), loc.loc)),
        );
    }

    let frag = graph.frag_mut(id);
    frag.stmts = stmts;
    frag.spill.num_slots = sched.num_slots;
    let colour = frag.partition;
    let part = graph.partitions.get_mut(&colour).expect("unknown partition");
    part.num_slots = part.num_slots.max(sched.num_slots);
}

/// Virtual registers named by an instruction.
fn virtual_regs_of(instr: &Instruction) -> Vec<u16> {
    let mut vrs = Vec::new();
    instr.visit_regs(|reg, _| {
        if reg.is_virtual() && !vrs.contains(&reg.number()) {
            vrs.push(reg.number());
        }
    });
    vrs
}

/// Bring every GPR in `used` home for the instruction at `i`.
fn home_used_gprs(
    sched: &mut FragScheduler,
    stmts: &mut Vec<Stmt>,
    i: usize,
    used: GprSet,
    avoid: GprSet,
) {
    for gpr in used.iter() {
        let idx = gpr.enc() as usize;
        let loc = sched.gpr_loc[idx];
        match loc.kind {
            LocKind::Gpr => {
                debug_assert!(loc.loc.is_native());
            }
            // The GPR was left in its slot for sharing; this instruction
            // needs its native value, so the save the restore assumed must
            // happen right after the use.
            LocKind::LiveSlot => {
                stmts.insert(
                    i + 1,
                    Stmt::Instr(save_gpr_to_slot(VirtualRegister::native(gpr), loc.loc)),
                );
                sched.gpr_loc[idx] = Loc::gpr(gpr);
                sched.inverse[idx] = None;
            }
            // A register occupies this GPR and stays live; swap it to an
            // alternative GPR and park the native value in the slot.
            LocKind::Slot => {
                let vr = sched.inverse[idx].expect("occupied GPR with no inverse mapping");
                let agpr = sched.get_gpr(avoid);
                let slot = loc.loc;
                assert!(agpr != gpr);
                stmts.insert(
                    i + 1,
                    Stmt::Instr(swap_gpr_with_gpr(
                        VirtualRegister::native(agpr),
                        VirtualRegister::native(gpr),
                    )),
                );
                stmts.insert(
                    i + 2,
                    Stmt::Instr(swap_gpr_with_slot(VirtualRegister::native(agpr), slot)),
                );
                sched.vr_loc.insert(
                    vr,
                    Loc {
                        loc: VirtualRegister::native(agpr),
                        kind: LocKind::Gpr,
                    },
                );
                sched.gpr_loc[idx] = Loc::gpr(gpr);
                sched.gpr_loc[agpr.enc() as usize] = Loc {
                    loc: slot,
                    kind: LocKind::Slot,
                };
                sched.inverse[idx] = None;
                sched.inverse[agpr.enc() as usize] = Some(vr);
            }
        }
    }
}

/// Home one fragment-local register for the instruction at `i` and rewrite
/// its uses.
fn schedule_local_use(
    sched: &mut FragScheduler,
    stmts: &mut Vec<Stmt>,
    i: usize,
    vr: u16,
    used: GprSet,
) {
    if !sched.vr_loc.contains_key(&vr) {
        // First sighting (in reverse order): the register's last use. Try
        // to share the slot of a GPR already assumed spilled; otherwise take
        // a fresh slot and arrange the fill.
        let (agpr, slot) = match sched.shared_gpr(used) {
            Some(g) => {
                let slot = sched.gpr_loc[g.enc() as usize].loc;
                assert!(slot.is_virtual_slot());
                (g, slot)
            }
            None => {
                let g = sched.get_gpr(used);
                let slot = sched.alloc_slot();
                stmts.insert(
                    i + 1,
                    Stmt::Instr(restore_gpr_from_slot(VirtualRegister::native(g), slot)),
                );
                (g, slot)
            }
        };
        sched.gpr_loc[agpr.enc() as usize] = Loc {
            loc: slot,
            kind: LocKind::Slot,
        };
        sched.vr_loc.insert(
            vr,
            Loc {
                loc: VirtualRegister::native(agpr),
                kind: LocKind::Gpr,
            },
        );
        sched.inverse[agpr.enc() as usize] = Some(vr);
    }

    let home = sched.vr_loc[&vr];
    assert!(home.kind == LocKind::Gpr);
    if let Some(instr) = stmts[i].instr_mut() {
        replace_vr(instr, vr, home.loc.gpr());
    }
}

/// The definition of a fragment-local register: its home is released, and
/// the displaced GPR's slot becomes shareable instead of eagerly saved.
fn schedule_local_def(sched: &mut FragScheduler, vr: u16) {
    let home = sched.vr_loc.remove(&vr).expect("definition of an unseen register");
    assert!(home.kind == LocKind::Gpr);
    let gpr = home.loc.gpr();
    let idx = gpr.enc() as usize;
    assert!(sched.gpr_loc[idx].kind == LocKind::Slot);
    assert!(sched.gpr_loc[idx].loc.is_virtual_slot());
    assert_eq!(sched.inverse[idx], Some(vr));
    sched.gpr_loc[idx].kind = LocKind::LiveSlot;
    sched.inverse[idx] = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_carry_the_scheduled_bit() {
        let mut nodes = NodeTable::default();
        let id = nodes.id_of(7);
        assert_eq!(id & 1, 0, "fresh nodes are unscheduled");
        assert!(!nodes.is_scheduled(7));
        nodes.mark_scheduled(7);
        assert!(nodes.is_scheduled(7));
        // Identity is stable across the transition.
        assert_eq!(nodes.id_of(7) & !1, id);
        assert!(!nodes.is_scheduled(8));
    }

    /// A native use of the GPR homing a cross-fragment register injects the
    /// swap pair: the register moves to an alternative GPR and the native
    /// value is repaired through the slot.
    #[test]
    fn native_use_of_home_injects_swap_pair() {
        let rcx = VirtualRegister::native(Gpr::Rcx);
        let slot = VirtualRegister::slot(0);

        // A native instruction touching RCX, with the register homed there.
        let mut stmts = vec![Stmt::Instr(builder::mov_reg_reg(
            rcx,
            VirtualRegister::native(Gpr::Rdi),
        ))];
        let mut vr_loc = Loc {
            loc: rcx,
            kind: LocKind::Gpr,
        };
        let mut gpr_loc: [Loc; NUM_GPRS] =
            core::array::from_fn(|i| Loc::gpr(Gpr::from_enc(i as u8)));
        gpr_loc[Gpr::Rcx.enc() as usize] = Loc {
            loc: slot,
            kind: LocKind::Slot,
        };

        let counts = [0u32; NUM_GPRS];
        let mut used = GprSet::empty();
        used.insert(Gpr::Rcx);
        used.insert(Gpr::Rdi);
        let mut avoid = used;
        avoid.union(restricted_gprs());

        home_used_reg(
            &mut stmts,
            0,
            &mut vr_loc,
            &mut gpr_loc,
            used,
            avoid,
            &counts,
            Some(Gpr::Rcx),
            slot,
        );

        // mov rcx, rdi; xchg rcx, agpr; xchg agpr, [slot]
        assert_eq!(stmts.len(), 3);
        let xchg1 = stmts[1].instr().unwrap();
        assert_eq!(xchg1.opcode, Opcode::Xchg);
        assert_eq!(xchg1.ops[0].reg().unwrap().gpr(), Gpr::Rcx);
        let agpr = xchg1.ops[1].reg().unwrap();
        assert!(agpr.is_native());
        assert_ne!(agpr.gpr(), Gpr::Rcx);
        assert_ne!(agpr.gpr(), Gpr::Rdi);
        assert_ne!(agpr.gpr(), Gpr::Rsp);

        let xchg2 = stmts[2].instr().unwrap();
        assert_eq!(xchg2.opcode, Opcode::Xchg);
        assert!(xchg2.ops[0].reg().unwrap().is_virtual_slot());
        assert_eq!(xchg2.ops[1].reg().unwrap().gpr(), agpr.gpr());

        // The register's new home is the alternative GPR, whose native
        // value is assumed to live in the slot above this point.
        assert_eq!(vr_loc.loc.gpr(), agpr.gpr());
        assert_eq!(vr_loc.kind, LocKind::Gpr);
        assert_eq!(
            gpr_loc[Gpr::Rcx.enc() as usize].kind,
            LocKind::Gpr,
            "rcx is native again above the swap"
        );
        assert_eq!(gpr_loc[agpr.gpr().enc() as usize].kind, LocKind::Slot);
    }

    /// Slots assigned to simultaneously-live registers never collide.
    #[test]
    fn local_slot_allocation_respects_partition_slots() {
        let mut sched = FragScheduler {
            gpr_loc: core::array::from_fn(|i| Loc::gpr(Gpr::from_enc(i as u8))),
            inverse: [None; NUM_GPRS],
            vr_loc: HashMap::new(),
            save_restore_slots: HashMap::new(),
            slot_taken: 0,
            counts: [0; NUM_GPRS],
            num_partition_slots: 3,
            num_slots: 3,
        };
        let a = sched.alloc_slot();
        let b = sched.alloc_slot();
        assert_eq!(a.number(), 3, "local slots start above partition slots");
        assert_eq!(b.number(), 4);
        assert_eq!(sched.num_slots, 5);
    }
}

/// Remove a pure copy whose destination is an unscheduled fragment-local
/// register, leaving a marker so liveness still sees the definition.
fn try_elide_copy(
    sched: &mut FragScheduler,
    stmts: &mut Vec<Stmt>,
    i: usize,
    nodes: &NodeTable,
) -> bool {
    let Stmt::Instr(instr) = &stmts[i] else {
        return false;
    };
    let Some((dst, _src)) = instr.copied_reg() else {
        return false;
    };
    if !dst.is_virtual() || nodes.is_scheduled(dst.number()) {
        return false;
    }
    // A destination already homed to a GPR is needed below; keep the copy.
    if sched.vr_loc.contains_key(&dst.number()) {
        return false;
    }
    log::trace!("eliding copy into vr {}", dst.number());
    stmts[i] = Stmt::Annot(Annotation::ElidedCopy(dst));
    true
}
