//! One-shot, process-wide opcode tables.
//!
//! The decoder-initialisation pass walks the opcode table exactly once and
//! derives three tables: the control-flow category of each opcode class, the
//! flag effects of each class (with conditional writes widened into reads),
//! and the implicit-operand template appended to every decoded or built
//! instruction of that class. After initialisation the tables are reachable
//! only through a shared reference, which freezes them for the process
//! lifetime.

use std::sync::OnceLock;

use crate::flags::{FlagEffects, Rflags};
use crate::inst::{Category, Cc, Opcode};
use crate::operand::{Operand, OperandAction, OperandKind};
use crate::reg::{Gpr, VirtualRegister};

/// The three per-opcode tables, built once.
pub struct OpcodeTables {
    categories: Vec<Category>,
    flags: Vec<FlagEffects>,
    implicit: Vec<Vec<Operand>>,
}

static TABLES: OnceLock<OpcodeTables> = OnceLock::new();

impl OpcodeTables {
    /// The process-wide tables, built on first use.
    pub fn get() -> &'static OpcodeTables {
        TABLES.get_or_init(OpcodeTables::build)
    }

    /// Category of `opcode`.
    #[inline]
    pub fn category(&self, opcode: Opcode) -> Category {
        self.categories[opcode.table_index()]
    }

    /// Flag effects of `opcode`, may-writes already widened.
    #[inline]
    pub fn flag_effects(&self, opcode: Opcode) -> FlagEffects {
        self.flags[opcode.table_index()]
    }

    /// The implicit operands appended to every instruction of `opcode`.
    #[inline]
    pub fn implicit_ops(&self, opcode: Opcode) -> &[Operand] {
        &self.implicit[opcode.table_index()]
    }

    fn build() -> OpcodeTables {
        let mut categories = vec![Category::Other; Opcode::TABLE_SIZE];
        let mut flags = vec![FlagEffects::NONE; Opcode::TABLE_SIZE];
        let mut implicit = vec![Vec::new(); Opcode::TABLE_SIZE];

        Opcode::walk(|op| {
            let idx = op.table_index();
            categories[idx] = category_of(op);
            flags[idx] = flag_effects_of(op);
            implicit[idx] = implicit_ops_of(op);
        });

        log::debug!("opcode tables initialised ({} classes)", Opcode::TABLE_SIZE);
        OpcodeTables {
            categories,
            flags,
            implicit,
        }
    }
}

fn category_of(op: Opcode) -> Category {
    match op {
        Opcode::Call => Category::Call,
        Opcode::Ret => Category::Return,
        Opcode::Jmp => Category::UncondJump,
        Opcode::Jcc(_) | Opcode::Loop | Opcode::Loope | Opcode::Loopne | Opcode::Jrcxz => {
            Category::CondJump
        }
        Opcode::Ud2 | Opcode::Int3 => Category::Interrupt,
        Opcode::Syscall => Category::Syscall,
        _ => Category::Other,
    }
}

/// Flags read by condition `cc`.
fn cc_reads(cc: Cc) -> Rflags {
    match cc {
        Cc::O | Cc::No => Rflags::OF,
        Cc::B | Cc::Nb => Rflags::CF,
        Cc::Z | Cc::Nz => Rflags::ZF,
        Cc::Be | Cc::Nbe => Rflags::CF | Rflags::ZF,
        Cc::S | Cc::Ns => Rflags::SF,
        Cc::P | Cc::Np => Rflags::PF,
        Cc::L | Cc::Nl => Rflags::SF | Rflags::OF,
        Cc::Le | Cc::Nle => Rflags::ZF | Rflags::SF | Rflags::OF,
    }
}

fn flag_effects_of(op: Opcode) -> FlagEffects {
    match op {
        Opcode::Add | Opcode::Sub | Opcode::Cmp | Opcode::Neg => {
            FlagEffects::writes(Rflags::STATUS)
        }
        Opcode::Adc | Opcode::Sbb => FlagEffects::new(Rflags::CF, Rflags::STATUS),
        Opcode::Or | Opcode::And | Opcode::Xor | Opcode::Test => {
            FlagEffects::writes(Rflags::STATUS)
        }
        Opcode::Inc | Opcode::Dec => {
            FlagEffects::writes(Rflags::STATUS.difference(Rflags::CF))
        }
        // A shift by a count of zero leaves the flags untouched, so the
        // write is conditional and widens into a read.
        Opcode::Shl | Opcode::Shr | Opcode::Sar => {
            FlagEffects::writes(Rflags::STATUS).with_may_write()
        }
        Opcode::Jcc(cc) | Opcode::Setcc(cc) => FlagEffects::reads(cc_reads(cc)),
        Opcode::Loope | Opcode::Loopne => FlagEffects::reads(Rflags::ZF),
        Opcode::Lahf => FlagEffects::reads(Rflags::LAHF),
        Opcode::Sahf => FlagEffects::writes(Rflags::LAHF),
        _ => FlagEffects::NONE,
    }
}

fn implicit_reg(gpr: Gpr, action: OperandAction, width_bits: u16) -> Operand {
    Operand::implicit(
        OperandKind::Reg(VirtualRegister::native_with_width(gpr, (width_bits / 8) as u8)),
        action,
        width_bits,
    )
}

fn implicit_ops_of(op: Opcode) -> Vec<Operand> {
    match op {
        Opcode::Push | Opcode::Pop | Opcode::Call | Opcode::Ret => {
            vec![implicit_reg(Gpr::Rsp, OperandAction::ReadWrite, 64)]
        }
        Opcode::Loop | Opcode::Loope | Opcode::Loopne => {
            vec![implicit_reg(Gpr::Rcx, OperandAction::ReadWrite, 64)]
        }
        Opcode::Jrcxz => vec![implicit_reg(Gpr::Rcx, OperandAction::Read, 64)],
        // LAHF defines AH; modelled as a read-write of RAX so the low byte
        // stays live through the flag save sequence.
        Opcode::Lahf => vec![implicit_reg(Gpr::Rax, OperandAction::ReadWrite, 8)],
        Opcode::Sahf => vec![implicit_reg(Gpr::Rax, OperandAction::Read, 8)],
        Opcode::Syscall => vec![
            implicit_reg(Gpr::Rax, OperandAction::ReadWrite, 64),
            implicit_reg(Gpr::Rcx, OperandAction::Write, 64),
            implicit_reg(Gpr::R11, OperandAction::Write, 64),
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        let t = OpcodeTables::get();
        assert_eq!(t.category(Opcode::Mov), Category::Other);
        assert_eq!(t.category(Opcode::Call), Category::Call);
        assert_eq!(t.category(Opcode::Jcc(Cc::Z)), Category::CondJump);
        assert_eq!(t.category(Opcode::Jrcxz), Category::CondJump);
        assert_eq!(t.category(Opcode::Ud2), Category::Interrupt);
    }

    #[test]
    fn shift_may_write_is_widened() {
        let fx = OpcodeTables::get().flag_effects(Opcode::Shl);
        assert!(fx.read.contains(Rflags::CF));
        assert!(fx.written.contains(Rflags::CF));
    }

    #[test]
    fn implicit_templates_are_sticky() {
        let t = OpcodeTables::get();
        let push = t.implicit_ops(Opcode::Push);
        assert_eq!(push.len(), 1);
        assert!(push[0].is_sticky);
        assert!(!push[0].is_explicit);
        assert!(push[0].reg().unwrap().is_stack_pointer());
        assert!(t.implicit_ops(Opcode::Mov).is_empty());
    }

    #[test]
    fn jcc_reads_no_writes() {
        let fx = OpcodeTables::get().flag_effects(Opcode::Jcc(Cc::Z));
        assert_eq!(fx.read, Rflags::ZF);
        assert!(fx.written.is_empty());
    }
}
