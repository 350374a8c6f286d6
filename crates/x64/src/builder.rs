//! Builders for the well-known instruction forms the pipeline synthesises.
//!
//! Every builder produces a complete instruction: explicit operands from its
//! arguments, implicit operands appended from the opcode template. Built
//! instructions carry no decoded PC, marking them as synthesised.

use crate::inst::{Cc, Instruction, Label, Opcode, OpcodeForm};
use crate::operand::{Imm, MemExpr, Operand, OperandAction, OperandKind};
use crate::reg::VirtualRegister;
use crate::tables::OpcodeTables;
use crate::{AppPc, ADDRESS_WIDTH_BITS};

fn finish(mut instr: Instruction) -> Instruction {
    for op in OpcodeTables::get().implicit_ops(instr.opcode) {
        instr.push_op(*op);
    }
    instr
}

fn reg_op(reg: VirtualRegister, action: OperandAction) -> Operand {
    Operand::explicit(OperandKind::Reg(reg), action, reg.bit_width())
}

fn mem_op(mem: MemExpr, action: OperandAction, width: u16) -> Operand {
    Operand::explicit(OperandKind::Mem(mem), action, width)
}

/// `MOV reg, [mem]`.
pub fn mov_reg_mem(reg: VirtualRegister, mem: MemExpr) -> Instruction {
    let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::RRm, reg.bit_width());
    instr.push_op(reg_op(reg, OperandAction::Write));
    instr.push_op(mem_op(mem, OperandAction::Read, reg.bit_width()));
    finish(instr)
}

/// `MOV [mem], reg`.
pub fn mov_mem_reg(mem: MemExpr, reg: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::RmR, reg.bit_width());
    instr.push_op(mem_op(mem, OperandAction::Write, reg.bit_width()));
    instr.push_op(reg_op(reg, OperandAction::Read));
    finish(instr)
}

/// `MOV dst, src` between registers.
pub fn mov_reg_reg(dst: VirtualRegister, src: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::RmR, dst.bit_width());
    instr.push_op(reg_op(dst, OperandAction::Write));
    instr.push_op(reg_op(src, OperandAction::Read));
    finish(instr)
}

/// `MOV reg, imm64`.
pub fn mov_reg_imm64(reg: VirtualRegister, value: u64) -> Instruction {
    let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::OpcodeRegImm64, 64);
    instr.push_op(reg_op(reg.widened(8), OperandAction::Write));
    instr.push_op(Operand::explicit(
        OperandKind::Imm(Imm::unsigned(value)),
        OperandAction::Read,
        64,
    ));
    finish(instr)
}

/// `XCHG a, b` between registers.
pub fn xchg_reg_reg(a: VirtualRegister, b: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Xchg, OpcodeForm::RmR, a.bit_width());
    instr.push_op(reg_op(a, OperandAction::ReadWrite));
    instr.push_op(reg_op(b, OperandAction::ReadWrite));
    finish(instr)
}

/// `XCHG [mem], reg`.
pub fn xchg_mem_reg(mem: MemExpr, reg: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Xchg, OpcodeForm::RmR, reg.bit_width());
    instr.push_op(mem_op(mem, OperandAction::ReadWrite, reg.bit_width()));
    instr.push_op(reg_op(reg, OperandAction::ReadWrite));
    finish(instr)
}

/// `PUSH reg`.
pub fn push_reg(reg: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Push, OpcodeForm::OpcodeReg, 64);
    instr.push_op(reg_op(reg.widened(8), OperandAction::Read));
    finish(instr)
}

/// `POP reg`.
pub fn pop_reg(reg: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Pop, OpcodeForm::OpcodeReg, 64);
    instr.push_op(reg_op(reg.widened(8), OperandAction::Write));
    finish(instr)
}

/// `LEA reg, [agen]`.
pub fn lea(reg: VirtualRegister, agen: MemExpr) -> Instruction {
    let mut instr = Instruction::new(Opcode::Lea, OpcodeForm::RRm, reg.bit_width());
    instr.push_op(reg_op(reg, OperandAction::Write));
    instr.push_op(Operand::explicit(
        OperandKind::EffectiveAddress(agen),
        OperandAction::Read,
        ADDRESS_WIDTH_BITS,
    ));
    finish(instr)
}

fn branch_pc_op(target: AppPc) -> Operand {
    Operand::explicit(
        OperandKind::BranchPc(target),
        OperandAction::Read,
        ADDRESS_WIDTH_BITS,
    )
}

fn branch_label_op(label: Label) -> Operand {
    Operand::explicit(
        OperandKind::BranchLabel(label),
        OperandAction::Read,
        ADDRESS_WIDTH_BITS,
    )
}

/// `JMP rel32` to an application PC.
pub fn jmp_rel(target: AppPc) -> Instruction {
    let mut instr = Instruction::new(Opcode::Jmp, OpcodeForm::Rel32, 64);
    instr.push_op(branch_pc_op(target));
    finish(instr)
}

/// `JMP rel32` to a label.
pub fn jmp_label(label: Label) -> Instruction {
    let mut instr = Instruction::new(Opcode::Jmp, OpcodeForm::Rel32, 64);
    instr.push_op(branch_label_op(label));
    finish(instr)
}

/// `JMP reg`.
pub fn jmp_reg(reg: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Jmp, OpcodeForm::Rm, 64);
    instr.push_op(reg_op(reg.widened(8), OperandAction::Read));
    finish(instr)
}

/// `JMP [mem]`.
pub fn jmp_mem(mem: MemExpr) -> Instruction {
    let mut instr = Instruction::new(Opcode::Jmp, OpcodeForm::Rm, 64);
    instr.push_op(mem_op(mem, OperandAction::Read, 64));
    finish(instr)
}

/// `CALL rel32` to an application PC.
pub fn call_rel(target: AppPc) -> Instruction {
    let mut instr = Instruction::new(Opcode::Call, OpcodeForm::Rel32, 64);
    instr.push_op(branch_pc_op(target));
    finish(instr)
}

/// `CALL reg`.
pub fn call_reg(reg: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Call, OpcodeForm::Rm, 64);
    instr.push_op(reg_op(reg.widened(8), OperandAction::Read));
    finish(instr)
}

/// `CALL [mem]`.
pub fn call_mem(mem: MemExpr) -> Instruction {
    let mut instr = Instruction::new(Opcode::Call, OpcodeForm::Rm, 64);
    instr.push_op(mem_op(mem, OperandAction::Read, 64));
    finish(instr)
}

/// `Jcc rel32` to an application PC.
pub fn jcc_rel(cc: Cc, target: AppPc) -> Instruction {
    let mut instr = Instruction::new(Opcode::Jcc(cc), OpcodeForm::Rel32, 64);
    instr.push_op(branch_pc_op(target));
    finish(instr)
}

/// `Jcc rel32` to a label.
pub fn jcc_label(cc: Cc, label: Label) -> Instruction {
    let mut instr = Instruction::new(Opcode::Jcc(cc), OpcodeForm::Rel32, 64);
    instr.push_op(branch_label_op(label));
    finish(instr)
}

/// `LOOP rel8` to a label. LOOP has no rel32 encoding.
pub fn loop_label(label: Label) -> Instruction {
    let mut instr = Instruction::new(Opcode::Loop, OpcodeForm::Rel8, 64);
    instr.push_op(branch_label_op(label));
    finish(instr)
}

/// `UD2`.
pub fn ud2() -> Instruction {
    finish(Instruction::new(Opcode::Ud2, OpcodeForm::None, 64))
}

/// `LAHF`.
pub fn lahf() -> Instruction {
    finish(Instruction::new(Opcode::Lahf, OpcodeForm::None, 8))
}

/// `SAHF`.
pub fn sahf() -> Instruction {
    finish(Instruction::new(Opcode::Sahf, OpcodeForm::None, 8))
}

/// `SETO reg8`.
pub fn seto(reg: VirtualRegister) -> Instruction {
    let mut instr = Instruction::new(Opcode::Setcc(Cc::O), OpcodeForm::Rm, 8);
    instr.push_op(reg_op(reg.widened(1), OperandAction::Write));
    finish(instr)
}

/// `ADD reg8, imm8`.
pub fn add_r8_i8(reg: VirtualRegister, value: i8) -> Instruction {
    let mut instr = Instruction::new(Opcode::Add, OpcodeForm::RmImm8, 8);
    instr.push_op(reg_op(reg.widened(1), OperandAction::ReadWrite));
    instr.push_op(Operand::explicit(
        OperandKind::Imm(Imm::signed(i64::from(value))),
        OperandAction::Read,
        8,
    ));
    finish(instr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::Gpr;

    #[test]
    fn builders_are_synthesised() {
        let instr = jmp_rel(0x1000);
        assert!(instr.decoded_pc.is_none());
        assert_eq!(instr.decoded_len, 0);
        assert_eq!(instr.branch_target_pc(), Some(0x1000));
    }

    #[test]
    fn push_carries_implicit_rsp() {
        let instr = push_reg(VirtualRegister::native(Gpr::Rbx));
        assert_eq!(instr.num_explicit_operands(), 1);
        let rsp = instr.ops.iter().find(|op| !op.is_explicit).unwrap();
        assert!(rsp.reg().unwrap().is_stack_pointer());
        assert!(rsp.is_sticky);
        assert!(instr.reads_stack_pointer());
        assert!(instr.writes_stack_pointer());
        assert_eq!(instr.stack_pointer_shift(), -8);
    }

    #[test]
    fn replace_respects_sticky() {
        let mut instr = push_reg(VirtualRegister::native(Gpr::Rbx));
        let new_op = Operand::explicit(
            OperandKind::Reg(VirtualRegister::virt(0, 8)),
            OperandAction::Read,
            64,
        );
        // Explicit operand: replaceable.
        assert!(instr.replace_operand(0, new_op));
        // Implicit RSP operand: sticky.
        assert!(!instr.replace_operand(1, new_op));
        // Sticky instruction: nothing is replaceable.
        instr.is_sticky = true;
        assert!(!instr.replace_operand(0, new_op));
    }
}
