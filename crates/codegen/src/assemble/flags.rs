//! Flag save/restore zones.
//!
//! Instrumentation is free to add flag-killing instructions; the
//! application must never observe the difference. A *flag zone* wraps the
//! fragments whose synthesised instructions kill flags with a save sequence
//! at the zone entry and the mirror restore at the zone exit — but only for
//! flags that are both killed inside the zone and live after it.
//!
//! The sequences are the classic LAHF/SAHF pair. LAHF covers SF/ZF/AF/PF/CF;
//! OF is recovered by `SETO AL` on the way in and `ADD AL, 0x7F` on the way
//! out. The scratch register killed by the sequence is RAX; when RAX is
//! live across the zone it is parked in a holding register first (a virtual
//! register here, so the scheduler finds it a home).

use granary_x64::{builder, Gpr, GprSet, Instruction, Rflags, VirtualRegister};

use crate::cfg::{Annotation, BlockId, Stmt};

use super::fragment::{FragKind, FragmentGraph};

/// One save/restore region.
#[derive(Clone, Debug)]
pub struct FlagZone {
    /// Flags killed by synthesised instructions inside the zone.
    pub killed: Rflags,
    /// Flags live on exit from the zone.
    pub live: Rflags,
    /// The register the save/restore sequence itself clobbers. Always RAX.
    pub flag_kill_reg: VirtualRegister,
    /// Where RAX is parked while the zone runs, when it is live across.
    pub flag_save_reg: VirtualRegister,
    /// GPRs live across the zone.
    pub live_regs: GprSet,
}

/// The architectural register killed by the flag save/restore sequences.
pub fn flag_kill_reg() -> VirtualRegister {
    VirtualRegister::native(Gpr::Rax)
}

/// Build the save sequence for `zone`. Empty when no killed flag is live.
pub fn inject_save_flags(zone: &FlagZone) -> Vec<Instruction> {
    let flags = zone.killed.intersection(zone.live);
    let mut out = Vec::new();
    if flags.is_empty() {
        return out;
    }
    assert!(
        !zone.killed.contains(Rflags::DF),
        "the direction flag may not be killed inside a flag zone"
    );
    if zone.live_regs.contains(zone.flag_kill_reg.gpr()) {
        out.push(builder::mov_reg_reg(zone.flag_save_reg, zone.flag_kill_reg));
    }
    out.push(builder::lahf());
    // LAHF misses OF; recover it through AL whenever the zone can kill it.
    if zone.killed.contains(Rflags::OF) {
        out.push(builder::seto(VirtualRegister::native_with_width(Gpr::Rax, 1)));
    }
    out
}

/// Build the restore sequence for `zone`; the exact mirror of the save.
pub fn inject_restore_flags(zone: &FlagZone) -> Vec<Instruction> {
    let flags = zone.killed.intersection(zone.live);
    let mut out = Vec::new();
    if flags.is_empty() {
        return out;
    }
    assert!(
        !zone.killed.contains(Rflags::DF),
        "the direction flag may not be killed inside a flag zone"
    );
    if zone.killed.contains(Rflags::OF) {
        out.push(builder::add_r8_i8(
            VirtualRegister::native_with_width(Gpr::Rax, 1),
            0x7F,
        ));
    }
    out.push(builder::sahf());
    if zone.live_regs.contains(zone.flag_kill_reg.gpr()) {
        out.push(builder::mov_reg_reg(zone.flag_kill_reg, zone.flag_save_reg));
    }
    out
}

/// Flags killed by the synthesised (non-application) instructions of a
/// fragment. Application instructions kill their own flags natively and
/// need no preservation.
fn instrumentation_kills(graph: &FragmentGraph, id: super::fragment::FragId) -> Rflags {
    let mut killed = Rflags::empty();
    for stmt in &graph.frag(id).stmts {
        if let Some(instr) = stmt.instr() {
            if !instr.is_app() {
                killed = killed.union(instr.flag_effects().written);
            }
        }
    }
    killed
}

/// Wrap every fragment whose instrumentation kills live flags in a zone: a
/// `FlagEntry` fragment with the save sequence ahead of it, and the mirror
/// restore either in a `FlagExit` fragment on the fall-through or — when
/// the zone fragment ends in a control transfer — inline, just ahead of the
/// transfer.
pub fn build_zones(
    graph: &mut FragmentGraph,
    alloc_vr: &mut impl FnMut(BlockId) -> VirtualRegister,
) {
    let ids = graph.ids();
    for id in ids {
        if !matches!(graph.frag(id).kind, FragKind::Code) {
            continue;
        }
        let killed = instrumentation_kills(graph, id);
        if killed.is_empty() {
            continue;
        }
        let live = graph.frag(id).exit_flags_live;
        if killed.intersection(live).is_empty() {
            continue;
        }

        let block = graph.frag(id).block;
        let zone = FlagZone {
            killed,
            live,
            flag_kill_reg: flag_kill_reg(),
            flag_save_reg: alloc_vr(block),
            live_regs: graph.frag(id).entry_gpr_live,
        };
        let zone_idx = graph.zones.len();
        graph.zones.push(zone.clone());
        graph.frag_mut(id).flag_zone = Some(zone_idx);

        let rax_held = zone.live_regs.contains(Gpr::Rax);
        let save_num = zone.flag_save_reg.number();

        // The save point: its own fragment, spliced onto every edge into
        // the zone so it dominates the kills.
        let entry = add_zone_frag(graph, block, FragKind::FlagEntry, zone_idx);
        graph
            .frag_mut(entry)
            .stmts
            .push(Stmt::Annot(Annotation::FlagZoneEnter));
        for instr in inject_save_flags(&zone) {
            graph.frag_mut(entry).stmts.push(Stmt::Instr(instr));
        }
        redirect_edges(graph, id, entry);
        graph.frag_mut(entry).fall_through = Some(id);

        // The restore point must post-dominate the kills: ahead of a
        // terminal transfer, or on the fall-through edge otherwise.
        let restore = inject_restore_flags(&zone);
        let ends_in_transfer = matches!(
            graph.frag(id).stmts.last(),
            Some(Stmt::Cfi(..)) | Some(Stmt::Branch(..))
        );
        if ends_in_transfer {
            let at = graph.frag(id).stmts.len() - 1;
            let frag = graph.frag_mut(id);
            frag.stmts.insert(at, Stmt::Annot(Annotation::FlagZoneExit));
            for (k, instr) in restore.into_iter().enumerate() {
                frag.stmts.insert(at + k, Stmt::Instr(instr));
            }
        } else {
            let exit = add_zone_frag(graph, block, FragKind::FlagExit, zone_idx);
            for instr in restore {
                graph.frag_mut(exit).stmts.push(Stmt::Instr(instr));
            }
            graph
                .frag_mut(exit)
                .stmts
                .push(Stmt::Annot(Annotation::FlagZoneExit));
            let old_ft = graph.frag(id).fall_through;
            graph.frag_mut(exit).fall_through = old_ft;
            graph.frag_mut(id).fall_through = Some(exit);

            let exit_live = graph.frag(id).exit_vr_live.clone();
            let exit_gpr = graph.frag(id).exit_gpr_live;
            let colour = graph.frag(id).partition;
            let x = graph.frag_mut(exit);
            x.partition = colour;
            x.entry_vr_live = exit_live.clone();
            x.exit_vr_live = exit_live;
            x.entry_gpr_live = exit_gpr;
            x.exit_gpr_live = exit_gpr;
            if rax_held {
                x.entry_vr_live.insert(save_num);
            }
        }

        // The entry fragment mirrors the zone boundary's liveness, and the
        // holding register is live from the save to the restore.
        let entry_live = graph.frag(id).entry_vr_live.clone();
        let entry_gpr = graph.frag(id).entry_gpr_live;
        let colour = graph.frag(id).partition;
        {
            let e = graph.frag_mut(entry);
            e.partition = colour;
            e.entry_vr_live = entry_live.clone();
            e.exit_vr_live = entry_live;
            e.entry_gpr_live = entry_gpr;
            e.exit_gpr_live = entry_gpr;
        }
        if rax_held {
            graph.frag_mut(entry).exit_vr_live.insert(save_num);
            graph.frag_mut(id).entry_vr_live.insert(save_num);
            if !ends_in_transfer {
                graph.frag_mut(id).exit_vr_live.insert(save_num);
            }
        }

        log::debug!(
            "flag zone {zone_idx} around {id}: killed {killed:?}, live {live:?}"
        );
    }
}

fn add_zone_frag(
    graph: &mut FragmentGraph,
    block: BlockId,
    kind: FragKind,
    zone: usize,
) -> super::fragment::FragId {
    let id = {
        let id = super::fragment::FragId(graph.frags.len() as u32);
        let label = graph.new_label();
        graph
            .frags
            .push(super::fragment::Fragment::new(id, block, label));
        id
    };
    let frag = graph.frag_mut(id);
    frag.kind = kind;
    frag.flag_zone = Some(zone);
    id
}

/// Point every edge that targeted `old` at `new` instead, including block
/// entry points, so a transfer into the block cannot bypass the zone.
fn redirect_edges(
    graph: &mut FragmentGraph,
    old: super::fragment::FragId,
    new: super::fragment::FragId,
) {
    let new_label = graph.frag(new).entry_label;
    let ids = graph.ids();
    for id in ids {
        if id == new {
            continue;
        }
        let frag = graph.frag_mut(id);
        if frag.fall_through == Some(old) {
            frag.fall_through = Some(new);
        }
        if frag.branch == Some(old) {
            frag.branch = Some(new);
            if let Some(Stmt::Branch(instr, target)) = frag.stmts.last_mut() {
                instr.set_branch_target_label(new_label);
                *target = new_label;
            }
        }
    }
    for entry in graph.block_entry.values_mut() {
        if *entry == old {
            *entry = new;
        }
    }
    if graph.entry == old {
        graph.entry = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_x64::Opcode;

    fn zone(killed: Rflags, live: Rflags, rax_live: bool) -> FlagZone {
        let mut live_regs = GprSet::empty();
        if rax_live {
            live_regs.insert(Gpr::Rax);
        }
        FlagZone {
            killed,
            live,
            flag_kill_reg: flag_kill_reg(),
            flag_save_reg: VirtualRegister::native(Gpr::R14),
            live_regs,
        }
    }

    #[test]
    fn save_and_restore_mirror_each_other() {
        // Kill mask {CF, OF} with CF live on entry: the full sequence.
        let z = zone(Rflags::CF | Rflags::OF, Rflags::CF, true);
        let save = inject_save_flags(&z);
        let ops: Vec<Opcode> = save.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![Opcode::Mov, Opcode::Lahf, Opcode::Setcc(granary_x64::Cc::O)]
        );
        // mov r14, rax
        assert_eq!(save[0].ops[0].reg().unwrap().gpr(), Gpr::R14);
        assert_eq!(save[0].ops[1].reg().unwrap().gpr(), Gpr::Rax);

        let restore = inject_restore_flags(&z);
        let ops: Vec<Opcode> = restore.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::Add, Opcode::Sahf, Opcode::Mov]);
        // add al, 0x7f
        assert_eq!(restore[0].ops[0].reg().unwrap().gpr(), Gpr::Rax);
        assert_eq!(restore[0].ops[0].reg().unwrap().byte_width(), 1);
        // mov rax, r14
        assert_eq!(restore[2].ops[0].reg().unwrap().gpr(), Gpr::Rax);
        assert_eq!(restore[2].ops[1].reg().unwrap().gpr(), Gpr::R14);
    }

    #[test]
    fn dead_flags_need_no_sequence() {
        let z = zone(Rflags::CF | Rflags::ZF, Rflags::OF, true);
        assert!(inject_save_flags(&z).is_empty());
        assert!(inject_restore_flags(&z).is_empty());
    }

    #[test]
    fn of_outside_mask_skips_the_seto_pair() {
        let z = zone(Rflags::CF, Rflags::CF, false);
        let save = inject_save_flags(&z);
        let ops: Vec<Opcode> = save.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::Lahf]);
        let restore = inject_restore_flags(&z);
        let ops: Vec<Opcode> = restore.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::Sahf]);
    }

    #[test]
    #[should_panic(expected = "direction flag")]
    fn killing_df_is_a_hard_error() {
        let z = zone(Rflags::DF | Rflags::CF, Rflags::CF, false);
        inject_save_flags(&z);
    }
}
