//! Backward liveness over the fragment graph: virtual registers, GPRs and
//! architectural flags.

use hashbrown::HashSet;

use granary_x64::{GprSet, Instruction, Rflags};

use crate::cfg::{Annotation, Stmt, Successor};

use super::fragment::{FragId, FragmentGraph};

/// Per-fragment gen/kill summary.
struct Summary {
    vr_use: HashSet<u16>,
    vr_def: HashSet<u16>,
    gpr_use: GprSet,
    gpr_def: GprSet,
    flags_read: Rflags,
    flags_written: Rflags,
}

fn instr_regs(instr: &Instruction, mut f: impl FnMut(bool, bool, granary_x64::VirtualRegister)) {
    instr.visit_regs(|reg, action| {
        f(action.may_read(), action.always_writes(), reg);
    });
}

fn summarise(graph: &FragmentGraph, id: FragId) -> Summary {
    let mut s = Summary {
        vr_use: HashSet::new(),
        vr_def: HashSet::new(),
        gpr_use: GprSet::empty(),
        gpr_def: GprSet::empty(),
        flags_read: Rflags::empty(),
        flags_written: Rflags::empty(),
    };

    // Backward within the fragment: a use before any kill is upward-exposed.
    for stmt in graph.frag(id).stmts.iter().rev() {
        match stmt {
            Stmt::Annot(Annotation::NodeKill(vr)) => {
                // A kill marker reads the register so slot assignment still
                // sees the value arriving from the predecessor.
                s.vr_use.insert(vr.number());
            }
            Stmt::Annot(Annotation::ElidedCopy(vr)) => {
                s.vr_def.insert(vr.number());
                s.vr_use.remove(&vr.number());
            }
            Stmt::Annot(_) | Stmt::Label(_) => {}
            Stmt::Instr(instr) | Stmt::Branch(instr, _) | Stmt::Cfi(instr, _) => {
                instr_regs(instr, |reads, writes, reg| {
                    if reg.is_virtual() {
                        if writes && !reads {
                            s.vr_def.insert(reg.number());
                            s.vr_use.remove(&reg.number());
                        } else if reads {
                            s.vr_use.insert(reg.number());
                        }
                    } else if reg.is_general_purpose() {
                        let gpr = reg.gpr();
                        if writes && !reads {
                            s.gpr_def.insert(gpr);
                            s.gpr_use.remove(gpr);
                        } else if reads {
                            s.gpr_use.insert(gpr);
                        }
                    }
                });
                let fx = instr.flag_effects();
                s.flags_written = s.flags_written.union(fx.written);
                s.flags_read = s.flags_read.difference(fx.written).union(fx.read);
            }
        }
    }
    s
}

/// Successor fragments for dataflow purposes: local edges plus the entry
/// fragments of decoded successor blocks. `None` marks an exit from the
/// trace.
fn flow_successors(graph: &FragmentGraph, id: FragId) -> (Vec<FragId>, bool) {
    let frag = graph.frag(id);
    let mut succs: Vec<FragId> = frag.successors().collect();
    let mut exits = false;
    for stmt in &frag.stmts {
        if let Stmt::Cfi(_, succ) = stmt {
            match succ {
                Successor::Decoded(b) => succs.push(graph.block_entry[b]),
                Successor::Direct(_) => unreachable!("direct successor at analysis time"),
                _ => exits = true,
            }
        }
    }
    (succs, exits)
}

/// Compute entry/exit live sets for every fragment, to a fixpoint.
///
/// At trace exits every GPR and every flag is conservatively live; no
/// virtual register is (they never escape the trace).
pub fn analyse(graph: &mut FragmentGraph) {
    let ids = graph.ids();
    let summaries: Vec<Summary> = ids.iter().map(|id| summarise(graph, *id)).collect();

    let mut changed = true;
    while changed {
        changed = false;
        for id in ids.iter().rev() {
            let idx = id.0 as usize;
            let (succs, exits) = flow_successors(graph, *id);

            let mut vr_out: HashSet<u16> = HashSet::new();
            let mut gpr_out = GprSet::empty();
            let mut flags_out = Rflags::empty();
            if exits || succs.is_empty() {
                gpr_out = GprSet::all();
                flags_out = Rflags::all();
            }
            for succ in succs {
                let s = graph.frag(succ);
                vr_out.extend(s.entry_vr_live.iter().copied());
                gpr_out.union(s.entry_gpr_live);
                flags_out = flags_out.union(s.entry_flags_live);
            }

            let s = &summaries[idx];
            let mut vr_in: HashSet<u16> = vr_out.difference(&s.vr_def).copied().collect();
            vr_in.extend(s.vr_use.iter().copied());
            let mut gpr_in = gpr_out.difference(s.gpr_def);
            gpr_in.union(s.gpr_use);
            let flags_in = flags_out.difference(s.flags_written).union(s.flags_read);

            let frag = graph.frag_mut(*id);
            if vr_in != frag.entry_vr_live
                || vr_out != frag.exit_vr_live
                || gpr_in != frag.entry_gpr_live
                || gpr_out != frag.exit_gpr_live
                || flags_in != frag.entry_flags_live
                || flags_out != frag.exit_flags_live
            {
                frag.entry_vr_live = vr_in;
                frag.exit_vr_live = vr_out;
                frag.entry_gpr_live = gpr_in;
                frag.exit_gpr_live = gpr_out;
                frag.entry_flags_live = flags_in;
                frag.exit_flags_live = flags_out;
                changed = true;
            }
        }
    }
}
