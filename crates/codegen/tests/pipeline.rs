//! End-to-end assembly of small traces, and the cross-fragment scheduling
//! and compensation invariants on synthetic graphs.

use granary_codegen::assemble::{self, fragment::FragKind};
use granary_codegen::cfg::{materialise, Annotation, SliceReader, StackValidity, Stmt, Trace};
use granary_x64::{builder, Cc, Gpr, Opcode, VirtualRegister};

fn trace_of(base: u64, bytes: &[u8]) -> Trace {
    let _ = env_logger::builder().is_test(true).try_init();
    let reader = SliceReader { base, bytes };
    materialise(&reader, &(), base, StackValidity::Valid)
}

/// No virtual register may survive to emission.
fn assert_fully_scheduled(compiled: &assemble::Compiled) {
    for frag in &compiled.graph.frags {
        for stmt in &frag.stmts {
            if let Some(instr) = stmt.instr() {
                instr.visit_regs(|reg, _| {
                    assert!(
                        !reg.is_virtual(),
                        "unscheduled virtual register in {instr}"
                    );
                });
            }
        }
    }
}

#[test]
fn straight_line_trace_commits_verbatim() {
    // mov rax, rbx; ret -- nothing for the pipeline to rewrite.
    let mut trace = trace_of(0x1000, &[0x48, 0x89, 0xD8, 0xC3]);
    let compiled = assemble::assemble(&mut trace);
    let emitted = compiled.commit(0x10_0000).expect("commits");
    assert_eq!(emitted.bytes, vec![0x48, 0x89, 0xD8, 0xC3]);
    assert_eq!(emitted.block_offsets[&trace.entry], 0);
}

#[test]
fn staged_size_matches_committed_size() {
    let mut trace = trace_of(0x1000, &[0x74, 0x02, 0x31, 0xC0, 0xC3]);
    let compiled = assemble::assemble(&mut trace);
    let size = compiled.staged_size().expect("sizes");
    let emitted = compiled.commit(0x20_0000).expect("commits");
    assert_eq!(emitted.bytes.len(), size);
}

#[test]
fn conditional_trace_layout_resolves_all_branches() {
    // jz +2; xor eax, eax; ret / ret -- three blocks, two edges.
    let mut trace = trace_of(0x1000, &[0x74, 0x02, 0x31, 0xC0, 0xC3]);
    let compiled = assemble::assemble(&mut trace);
    let emitted = compiled.commit(0x20_0000).expect("commits");
    assert_eq!(emitted.block_offsets.len(), 3);
    // The entry block's conditional branch must target the taken block's
    // offset: decode the first instruction and follow its displacement.
    let (jcc, next) = granary_x64::decode_next(&emitted.bytes, 0x20_0000).unwrap();
    assert!(matches!(jcc.opcode, Opcode::Jcc(Cc::Z)));
    assert!(next > 0x20_0000);
    let target = jcc.branch_target_pc().unwrap() - 0x20_0000;
    assert!(
        emitted
            .block_offsets
            .values()
            .any(|off| *off as u64 == target),
        "taken edge lands on a block entry (target {target:#x}, offsets {:?})",
        emitted.block_offsets
    );
}

#[test]
fn far_branch_goes_through_pinned_cell() {
    // A conditional branch at a high PC whose taken target is unreadable:
    // the taken edge leaves the cache through a pinned cell.
    let base = 0x2_0000_1000u64;
    let mut trace = trace_of(base, &[0x74, 0x05, 0xC3]);
    let compiled = assemble::assemble(&mut trace);
    let emitted = compiled.commit(0x30_0000).expect("commits");
    // The pinned cell sits 8-aligned at the end holding the native target.
    let cell_value = u64::from_le_bytes(
        emitted.bytes[emitted.bytes.len() - 8..].try_into().unwrap(),
    );
    assert_eq!(cell_value, base + 2 + 5);
    // And a UD2 discourages prefetch past the indirect jump.
    assert!(emitted
        .bytes
        .windows(2)
        .any(|w| w == [0x0F, 0x0B]));
}

/// Build a block whose statements define a virtual register, branch over
/// its only use, and return; compensation must kill the register on the
/// branch edge and scheduling must leave no virtual register behind.
#[test]
fn compensation_restores_liveness_invariants() {
    let mut trace = trace_of(0x1000, &[0xC3]);
    let entry = trace.entry;
    let skip = trace.new_label();
    let v0 = trace.block_mut(entry).alloc_virtual_register(8);
    let ret = match trace.block_mut(entry).stmts.pop() {
        Some(stmt @ Stmt::Cfi(..)) => stmt,
        other => panic!("expected terminal return, got {other:?}"),
    };
    let stmts = vec![
        Stmt::Instr(builder::mov_reg_imm64(v0, 0x1234)),
        Stmt::Branch(builder::jcc_label(Cc::Z, skip), skip),
        Stmt::Instr(builder::mov_reg_reg(
            VirtualRegister::native(Gpr::Rbx),
            v0,
        )),
        Stmt::Label(skip),
        ret,
    ];
    trace.block_mut(entry).stmts = stmts;

    let compiled = assemble::assemble(&mut trace);
    let graph = &compiled.graph;

    // A compensation fragment with the kill marker exists.
    let comp = graph
        .frags
        .iter()
        .find(|f| matches!(f.kind, FragKind::Compensation))
        .expect("compensation fragment inserted");
    assert!(comp.stmts.iter().any(|s| matches!(
        s,
        Stmt::Annot(Annotation::NodeKill(vr)) if vr.number() == v0.number()
    )));

    // Within a partition, whatever is live out of a fragment is live into
    // its successors.
    for frag in &graph.frags {
        for succ in frag.successors() {
            let succ = graph.frag(succ);
            if succ.partition != frag.partition {
                continue;
            }
            for vr in &succ.entry_vr_live {
                assert!(
                    frag.exit_vr_live.contains(vr),
                    "vr {vr} live into {} but not out of {}",
                    succ.id,
                    frag.id
                );
            }
        }
    }

    assert_fully_scheduled(&compiled);
    compiled.commit(0x40_0000).expect("commits");
}

/// A register live across two fragments gets a slot that its fragments all
/// record, and scheduling rewrites every one of its uses.
#[test]
fn cross_fragment_register_gets_slot_and_preferred_gpr() {
    let mut trace = trace_of(0x1000, &[0xC3]);
    let entry = trace.entry;
    let skip = trace.new_label();
    let v0 = trace.block_mut(entry).alloc_virtual_register(8);
    let ret = trace.block_mut(entry).stmts.pop().unwrap();
    // def v0 / branch joins both paths at .skip / native use of every GPR's
    // favourite (rax) / use v0.
    let stmts = vec![
        Stmt::Instr(builder::mov_reg_imm64(v0, 0x5a5a)),
        Stmt::Branch(builder::jcc_label(Cc::Z, skip), skip),
        Stmt::Label(skip),
        Stmt::Instr(builder::mov_reg_reg(
            VirtualRegister::native(Gpr::Rcx),
            VirtualRegister::native(Gpr::Rax),
        )),
        Stmt::Instr(builder::mov_reg_reg(
            VirtualRegister::native(Gpr::Rbx),
            v0,
        )),
        ret,
    ];
    trace.block_mut(entry).stmts = stmts;

    let compiled = assemble::assemble(&mut trace);
    assert_fully_scheduled(&compiled);

    // v0 crossed a fragment boundary, so some fragment carries spill
    // bookkeeping for it.
    assert!(
        compiled
            .graph
            .frags
            .iter()
            .any(|f| f.spill.used_slots != 0),
        "cross-fragment register was assigned a slot"
    );
    compiled.commit(0x50_0000).expect("commits");
}

/// Instrumentation that kills live flags gets a save/restore zone.
#[test]
fn flag_killing_instrumentation_is_wrapped() {
    let mut trace = trace_of(0x1000, &[0xC3]);
    let entry = trace.entry;
    let ret = trace.block_mut(entry).stmts.pop().unwrap();
    // A synthesised ADD kills the status flags ahead of the return, where
    // every flag is conservatively live.
    let scratch = VirtualRegister::native_with_width(Gpr::Rbx, 1);
    trace.block_mut(entry).stmts = vec![
        Stmt::Instr(builder::add_r8_i8(scratch, 1)),
        ret,
    ];

    let compiled = assemble::assemble(&mut trace);
    let graph = &compiled.graph;
    assert_eq!(graph.zones.len(), 1);
    assert!(graph
        .frags
        .iter()
        .any(|f| matches!(f.kind, FragKind::FlagEntry)));

    // LAHF in the save path, SAHF on the restore path before the return.
    let all_ops: Vec<Opcode> = graph
        .frags
        .iter()
        .flat_map(|f| f.stmts.iter())
        .filter_map(|s| s.instr().map(|i| i.opcode))
        .collect();
    assert!(all_ops.contains(&Opcode::Lahf));
    assert!(all_ops.contains(&Opcode::Sahf));

    assert_fully_scheduled(&compiled);
    compiled.commit(0x60_0000).expect("commits");
}
