//! Rewriting decoded instructions into cache-hostable forms.
//!
//! Runs once per block, after materialisation and before fragment
//! formation. Three families of rewrites:
//!
//! - *Far direct branches.* A direct transfer whose target cannot be
//!   reached by a sign-extended 32-bit displacement becomes an indirect
//!   jump through a pinned native-address cell, with a `UD2` after the
//!   indirect jump to stop the processor prefetching past it. Conditional
//!   branches jump around the indirect form with the reversed condition,
//!   and the LOOP family is rebuilt on a three-instruction scaffold since
//!   it only has an 8-bit displacement.
//! - *Indirect control flow.* Specialised returns pop their target into a
//!   virtual register and become register jumps. Indirect calls materialise
//!   the post-call return address from a label, push it, and become
//!   register jumps; memory targets are loaded into a virtual register
//!   first.
//! - *Far absolute memory operands.* An absolute pointer that does not fit
//!   a 32-bit displacement, in the default data segment, is loaded with
//!   `MOV vreg, imm64` and the operand becomes `[vreg]`.
//!
//! Sticky operands and non-default segments are never rewritten.

use granary_x64::{
    builder, AppPc, Instruction, MemExpr, Opcode, Operand, OperandAction, OperandKind,
    VirtualRegister, GPR_WIDTH_BYTES,
};

use crate::cfg::{BlockId, NativeAddress, Stmt, Successor, Trace};

/// Does a direct transfer to `pc` need to go through a pinned cell?
///
/// The code cache lives in the low 2 GiB, so anything expressible as a
/// sign-extended 32-bit immediate is reachable rel32.
pub fn needs_relativizing(pc: AppPc) -> bool {
    i32::try_from(pc as i64).is_err()
}

/// Mangle every block of the trace.
pub fn mangle_trace(trace: &mut Trace) {
    let ids: Vec<BlockId> = trace.blocks().map(|b| b.id).collect();
    for id in ids {
        mangle_block(trace, id);
    }
}

struct Mangler {
    out: Vec<Stmt>,
}

impl Mangler {
    fn push(&mut self, stmt: Stmt) {
        self.out.push(stmt);
    }

    fn push_instr(&mut self, instr: Instruction) {
        self.out.push(Stmt::Instr(instr));
    }
}

fn mangle_block(trace: &mut Trace, id: BlockId) {
    let stmts = std::mem::take(&mut trace.block_mut(id).stmts);
    let mut m = Mangler { out: Vec::new() };

    for stmt in stmts {
        match stmt {
            Stmt::Instr(instr) => {
                let instr = relativize_mem_ops(trace, id, &mut m, instr);
                m.push_instr(instr);
            }
            Stmt::Cfi(instr, succ) => match succ {
                Successor::Decoded(_) => mangle_direct_cfi(trace, id, &mut m, instr, succ, None),
                Successor::Cached(pc) => {
                    mangle_direct_cfi(trace, id, &mut m, instr, succ, Some(pc))
                }
                Successor::Native(pc) => {
                    mangle_direct_cfi(trace, id, &mut m, instr, succ, Some(pc))
                }
                Successor::Indirect | Successor::Return { .. } => {
                    mangle_indirect_cfi(trace, id, &mut m, instr, succ);
                }
                Successor::Direct(_) => {
                    unreachable!("direct successor survived materialisation")
                }
            },
            other => m.push(other),
        }
    }

    trace.block_mut(id).stmts = m.out;
}

/// Allocate a pinned cell holding `target` and return a memory operand that
/// dereferences it.
fn pinned_cell(trace: &mut Trace, id: BlockId, target: AppPc) -> MemExpr {
    let label = trace.new_label();
    trace
        .block_mut(id)
        .native_addrs
        .push(NativeAddress {
            label,
            value: target,
        });
    MemExpr::Pinned { label }
}

/// Relativize one direct control-flow instruction.
fn mangle_direct_cfi(
    trace: &mut Trace,
    id: BlockId,
    m: &mut Mangler,
    instr: Instruction,
    succ: Successor,
    target: Option<AppPc>,
) {
    let far = target.is_some_and(needs_relativizing);

    if matches!(
        instr.opcode,
        Opcode::Loop | Opcode::Loope | Opcode::Loopne | Opcode::Jrcxz
    ) {
        // The LOOP family only encodes rel8, so it is always rebuilt:
        //     jmp .try
        // .do:
        //     jmp <target>            (or jmp [cell]; ud2 when far)
        // .try:
        //     loop .do
        relativize_loop(trace, id, m, instr, succ, target, far);
        return;
    }

    if !far {
        m.push(Stmt::Cfi(instr, succ));
        return;
    }
    let target = target.expect("far transfer with no target");

    match instr.opcode {
        Opcode::Call => {
            let cell = pinned_cell(trace, id, target);
            let mut call = builder::call_mem(cell);
            call.is_sticky = true;
            m.push(Stmt::Cfi(call, succ));
        }
        Opcode::Jmp => {
            let cell = pinned_cell(trace, id, target);
            let mut jmp = builder::jmp_mem(cell);
            jmp.is_sticky = true;
            m.push(Stmt::Cfi(jmp, succ));
            m.push_instr(builder::ud2());
        }
        Opcode::Jcc(cc) => {
            // Reverse the condition and hop over the indirect jump:
            //     jncc .skip
            //     jmp [cell]
            //     ud2
            // .skip:
            let skip = trace.new_label();
            let cell = pinned_cell(trace, id, target);
            m.push(Stmt::Branch(builder::jcc_label(cc.reversed(), skip), skip));
            let mut jmp = builder::jmp_mem(cell);
            jmp.is_sticky = true;
            m.push(Stmt::Cfi(jmp, succ));
            m.push_instr(builder::ud2());
            m.push(Stmt::Label(skip));
        }
        _ => unreachable!("unexpected far direct CFI: {instr}"),
    }
}

fn relativize_loop(
    trace: &mut Trace,
    id: BlockId,
    m: &mut Mangler,
    mut instr: Instruction,
    succ: Successor,
    target: Option<AppPc>,
    far: bool,
) {
    let do_loop = trace.new_label();
    let try_loop = trace.new_label();

    m.push(Stmt::Branch(builder::jmp_label(try_loop), try_loop));
    m.push(Stmt::Label(do_loop));

    if far {
        let cell = pinned_cell(trace, id, target.expect("far loop with no target"));
        let mut jmp = builder::jmp_mem(cell);
        jmp.is_sticky = true;
        m.push(Stmt::Cfi(jmp, succ));
        m.push_instr(builder::ud2());
    } else {
        let mut jmp = builder::jmp_rel(target.unwrap_or(0));
        if target.is_none() {
            // Decoded successor: the emitter resolves the block label.
            jmp.ops[0].kind = OperandKind::BranchPc(0);
        }
        m.push(Stmt::Cfi(jmp, succ));
    }

    m.push(Stmt::Label(try_loop));
    instr.set_branch_target_label(do_loop);
    m.push(Stmt::Branch(instr, do_loop));
}

/// Mangle a specialised return or an indirect call/jump so the target lives
/// in a register.
fn mangle_indirect_cfi(
    trace: &mut Trace,
    id: BlockId,
    m: &mut Mangler,
    mut instr: Instruction,
    succ: Successor,
) {
    if instr.is_function_return() {
        let Successor::Return { specialized: true } = succ else {
            // Unspecialised returns execute natively.
            m.push(Stmt::Cfi(instr, succ));
            return;
        };
        let shift = instr.stack_pointer_shift();
        let target = trace.block_mut(id).alloc_virtual_register(GPR_WIDTH_BYTES);
        if shift == i32::from(GPR_WIDTH_BYTES) {
            m.push_instr(builder::pop_reg(target));
        } else {
            let rsp = VirtualRegister::native(granary_x64::Gpr::Rsp);
            m.push_instr(builder::mov_reg_mem(target, MemExpr::base(rsp)));
            m.push_instr(builder::lea(rsp, MemExpr::base_disp(rsp, shift)));
        }
        m.push(Stmt::Cfi(builder::jmp_reg(target), succ));
        return;
    }

    if instr.is_function_call() {
        // Materialise the post-call return address so the application sees
        // the same stack it would natively, then transfer with a plain
        // register jump.
        let ret_label = trace.new_label();
        let decoded_pc = instr.decoded_pc;
        let ret_reg = trace.block_mut(id).alloc_virtual_register(GPR_WIDTH_BYTES);
        m.push_instr(builder::lea(ret_reg, MemExpr::Pinned { label: ret_label }));
        let mut push = builder::push_reg(ret_reg);
        // The push is application-visible state manipulation; keep the
        // call's PC so stack analysis treats it as app code.
        push.decoded_pc = decoded_pc;
        m.push_instr(push);

        let target_reg = match instr.ops.first().map(|op| op.kind) {
            Some(OperandKind::Mem(mem)) => {
                let reg = trace.block_mut(id).alloc_virtual_register(GPR_WIDTH_BYTES);
                m.push_instr(builder::mov_reg_mem(reg, mem));
                reg
            }
            Some(OperandKind::Reg(reg)) => reg,
            _ => unreachable!("indirect call without register or memory target"),
        };
        m.push(Stmt::Cfi(builder::jmp_reg(target_reg), succ));
        m.push(Stmt::Label(ret_label));
        return;
    }

    if instr.is_unconditional_jump() {
        if let Some(OperandKind::Mem(mem)) = instr.ops.first().map(|op| op.kind) {
            if !instr.is_sticky && !instr.ops[0].is_sticky {
                let reg = trace.block_mut(id).alloc_virtual_register(GPR_WIDTH_BYTES);
                m.push_instr(builder::mov_reg_mem(reg, mem));
                let replaced = instr.replace_operand(
                    0,
                    Operand::explicit(OperandKind::Reg(reg), OperandAction::Read, 64),
                );
                assert!(replaced, "indirect jump target was not replaceable");
            }
        }
        m.push(Stmt::Cfi(instr, succ));
        return;
    }

    // System call / interrupt return forms pass through untouched.
    m.push(Stmt::Cfi(instr, succ));
}

/// Rewrite far absolute memory operands of one instruction, emitting the
/// address materialisation ahead of it.
fn relativize_mem_ops(
    trace: &mut Trace,
    id: BlockId,
    m: &mut Mangler,
    mut instr: Instruction,
) -> Instruction {
    if instr.is_sticky {
        return instr;
    }
    for i in 0..instr.ops.len() {
        let op = instr.ops[i];
        if !op.is_explicit || op.is_sticky {
            continue;
        }
        let OperandKind::Mem(MemExpr::Absolute { addr, segment }) = op.kind else {
            continue;
        };
        // Non-default segments keep their segment semantics untouched.
        if !segment.is_default_data() || !needs_relativizing(addr) {
            continue;
        }
        let addr_reg = trace.block_mut(id).alloc_virtual_register(GPR_WIDTH_BYTES);
        m.push_instr(builder::mov_reg_imm64(addr_reg, addr));
        let replaced = instr.replace_operand(
            i,
            Operand {
                kind: OperandKind::Mem(MemExpr::base(addr_reg)),
                ..op
            },
        );
        assert!(replaced, "far memory operand was not replaceable");
    }
    instr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{materialise, SliceReader, StackValidity};
    use granary_x64::{Cc, OpcodeForm};

    fn trace_of(base: AppPc, bytes: &[u8]) -> Trace {
        let reader = SliceReader { base, bytes };
        materialise(&reader, &(), base, StackValidity::Valid)
    }

    fn entry_stmts(trace: &Trace) -> &[Stmt] {
        &trace.block(trace.entry).stmts
    }

    #[test]
    fn far_conditional_becomes_reversed_hop() {
        // jz with a target beyond the 32-bit range: jz . +5 at a high base.
        let base = 0x2_0000_1000u64;
        let bytes = [0x74, 0x05, 0xC3]; // jz +5; ret
        let mut trace = trace_of(base, &bytes);
        mangle_trace(&mut trace);

        let stmts = entry_stmts(&trace);
        // jnz .skip; jmp [cell]; ud2; .skip:
        assert!(
            matches!(&stmts[0], Stmt::Branch(i, _) if i.opcode == Opcode::Jcc(Cc::Nz)),
            "negated condition hops over the indirect jump"
        );
        match &stmts[1] {
            Stmt::Cfi(i, _) => {
                assert_eq!(i.opcode, Opcode::Jmp);
                assert_eq!(i.form, OpcodeForm::Rm);
                assert!(i.is_sticky);
                assert!(matches!(
                    i.ops[0].kind,
                    OperandKind::Mem(MemExpr::Pinned { .. })
                ));
            }
            other => panic!("expected indirect jump, got {other:?}"),
        }
        assert!(matches!(&stmts[2], Stmt::Instr(i) if i.opcode == Opcode::Ud2));
        assert!(matches!(&stmts[3], Stmt::Label(_)));
        // The pinned cell holds the native target.
        let cell = &trace.block(trace.entry).native_addrs[0];
        assert_eq!(cell.value, base + 2 + 5);
    }

    #[test]
    fn near_conditional_is_untouched() {
        let bytes = [0x74, 0x02, 0x31, 0xC0, 0xC3];
        let mut trace = trace_of(0x1000, &bytes);
        mangle_trace(&mut trace);
        let stmts = entry_stmts(&trace);
        assert!(matches!(&stmts[0], Stmt::Cfi(i, Successor::Decoded(_)) if matches!(i.opcode, Opcode::Jcc(_))));
    }

    #[test]
    fn loop_builds_scaffold() {
        // loop -4 (back to itself-ish); the scaffold shape is what matters.
        let bytes = [0xE2, 0xFE, 0xC3]; // loop -2 -> 0x1000
        let mut trace = trace_of(0x1000, &bytes);
        mangle_trace(&mut trace);
        let stmts = entry_stmts(&trace);
        // jmp .try; .do: jmp <target>; .try: loop .do
        assert!(matches!(&stmts[0], Stmt::Branch(i, _) if i.opcode == Opcode::Jmp));
        assert!(matches!(&stmts[1], Stmt::Label(_)));
        assert!(matches!(&stmts[2], Stmt::Cfi(i, _) if i.opcode == Opcode::Jmp));
        assert!(matches!(&stmts[3], Stmt::Label(_)));
        assert!(matches!(&stmts[4], Stmt::Branch(i, _) if i.opcode == Opcode::Loop));
    }

    #[test]
    fn specialized_return_pops_into_register_jump() {
        let bytes = [0xC3];
        let mut trace = trace_of(0x1000, &bytes);
        // Specialise the return before mangling.
        let entry = trace.entry;
        if let Some(Stmt::Cfi(_, succ)) = trace.block_mut(entry).stmts.last_mut() {
            *succ = Successor::Return { specialized: true };
        }
        mangle_trace(&mut trace);
        let stmts = entry_stmts(&trace);
        assert!(matches!(&stmts[0], Stmt::Instr(i) if i.opcode == Opcode::Pop));
        match &stmts[1] {
            Stmt::Cfi(i, Successor::Return { specialized: true }) => {
                assert_eq!(i.opcode, Opcode::Jmp);
                assert!(i.ops[0].reg().unwrap().is_virtual());
            }
            other => panic!("expected register jump, got {other:?}"),
        }
    }

    #[test]
    fn indirect_call_materialises_return_address() {
        let bytes = [0xFF, 0xD0]; // call rax
        let mut trace = trace_of(0x1000, &bytes);
        mangle_trace(&mut trace);
        let stmts = entry_stmts(&trace);
        // lea vr, [ret]; push vr; jmp rax; .ret: ...
        assert!(matches!(&stmts[0], Stmt::Instr(i) if i.opcode == Opcode::Lea));
        match &stmts[1] {
            Stmt::Instr(i) => {
                assert_eq!(i.opcode, Opcode::Push);
                assert!(i.is_app(), "the push is application state manipulation");
            }
            other => panic!("expected push, got {other:?}"),
        }
        assert!(
            matches!(&stmts[2], Stmt::Cfi(i, Successor::Indirect) if i.opcode == Opcode::Jmp)
        );
        assert!(matches!(&stmts[3], Stmt::Label(_)));
    }

    #[test]
    fn far_absolute_memory_operand_is_materialised() {
        // mov rax, [rip+disp] decodes to an absolute address beyond 32 bits
        // when based high.
        let base = 0x1_0000_0000u64;
        let bytes = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, 0xC3];
        let mut trace = trace_of(base, &bytes);
        mangle_trace(&mut trace);
        let stmts = entry_stmts(&trace);
        // mov vr, imm64; mov rax, [vr]; ret
        match &stmts[0] {
            Stmt::Instr(i) => {
                assert_eq!(i.opcode, Opcode::Mov);
                assert_eq!(i.form, OpcodeForm::OpcodeRegImm64);
                assert!(i.ops[0].reg().unwrap().is_virtual());
            }
            other => panic!("expected address materialisation, got {other:?}"),
        }
        match &stmts[1] {
            Stmt::Instr(i) => match i.ops[1].kind {
                OperandKind::Mem(MemExpr::Compound { base, .. }) => {
                    assert!(base.unwrap().is_virtual());
                }
                other => panic!("expected [vreg], got {other:?}"),
            },
            other => panic!("expected rewritten load, got {other:?}"),
        }
    }

    #[test]
    fn segmented_operands_are_left_alone() {
        // mov rax, gs:[0x28] stays untouched even though the pipeline could
        // rewrite an absolute operand.
        let bytes = [0x65, 0x48, 0x8B, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00, 0xC3];
        let mut trace = trace_of(0x1000, &bytes);
        mangle_trace(&mut trace);
        let stmts = entry_stmts(&trace);
        assert!(matches!(&stmts[0], Stmt::Instr(i) if i.opcode == Opcode::Mov
            && matches!(i.ops[1].kind, OperandKind::Mem(MemExpr::Compound { .. }))));
    }
}
