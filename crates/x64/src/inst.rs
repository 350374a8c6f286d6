//! The typed instruction representation.

use core::fmt;

use smallvec::SmallVec;

use crate::flags::FlagEffects;
use crate::operand::{Operand, OperandAction, OperandKind, Segment};
use crate::reg::VirtualRegister;
use crate::tables::OpcodeTables;
use crate::AppPc;

/// A condition code, in hardware encoding order.
///
/// Negating a condition toggles the low bit of its encoding; the mangler
/// relies on this when it rewrites a far conditional branch into a
/// reversed-condition branch around an indirect jump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
#[repr(u8)]
pub enum Cc {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Nb = 0x3,
    Z = 0x4,
    Nz = 0x5,
    Be = 0x6,
    Nbe = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Nl = 0xD,
    Le = 0xE,
    Nle = 0xF,
}

impl Cc {
    /// All sixteen condition codes, in encoding order.
    pub const ALL: [Cc; 16] = [
        Cc::O,
        Cc::No,
        Cc::B,
        Cc::Nb,
        Cc::Z,
        Cc::Nz,
        Cc::Be,
        Cc::Nbe,
        Cc::S,
        Cc::Ns,
        Cc::P,
        Cc::Np,
        Cc::L,
        Cc::Nl,
        Cc::Le,
        Cc::Nle,
    ];

    /// Hardware encoding (the low nibble of the Jcc/SETcc opcode).
    #[inline]
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// Recover a condition code from its hardware encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not 0..=15.
    #[inline]
    pub fn from_enc(enc: u8) -> Cc {
        Self::ALL[usize::from(enc)]
    }

    /// The negated condition.
    #[inline]
    pub fn reversed(self) -> Cc {
        Cc::from_enc(self.enc() ^ 1)
    }
}

/// Opcode class of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    Mov,
    Lea,
    Xchg,
    Push,
    Pop,
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Shl,
    Shr,
    Sar,
    Jmp,
    Call,
    Ret,
    /// Conditional jump on `Cc`.
    Jcc(Cc),
    /// Byte set on `Cc`.
    Setcc(Cc),
    Loop,
    Loope,
    Loopne,
    Jrcxz,
    Lahf,
    Sahf,
    Ud2,
    Nop,
    Int3,
    Syscall,
}

impl Opcode {
    /// Walk every opcode class, including every conditional variant.
    ///
    /// This is the table the one-shot initialisation pass iterates to build
    /// the category, flag and implicit-operand tables.
    pub fn walk(mut f: impl FnMut(Opcode)) {
        use Opcode::*;
        for op in [
            Mov, Lea, Xchg, Push, Pop, Add, Or, Adc, Sbb, And, Sub, Xor, Cmp, Test, Inc, Dec,
            Neg, Not, Shl, Shr, Sar, Jmp, Call, Ret, Loop, Loope, Loopne, Jrcxz, Lahf, Sahf,
            Ud2, Nop, Int3, Syscall,
        ] {
            f(op);
        }
        for cc in Cc::ALL {
            f(Jcc(cc));
            f(Setcc(cc));
        }
    }

    /// A dense index for table lookups.
    pub(crate) fn table_index(self) -> usize {
        use Opcode::*;
        match self {
            Mov => 0,
            Lea => 1,
            Xchg => 2,
            Push => 3,
            Pop => 4,
            Add => 5,
            Or => 6,
            Adc => 7,
            Sbb => 8,
            And => 9,
            Sub => 10,
            Xor => 11,
            Cmp => 12,
            Test => 13,
            Inc => 14,
            Dec => 15,
            Neg => 16,
            Not => 17,
            Shl => 18,
            Shr => 19,
            Sar => 20,
            Jmp => 21,
            Call => 22,
            Ret => 23,
            Loop => 24,
            Loope => 25,
            Loopne => 26,
            Jrcxz => 27,
            Lahf => 28,
            Sahf => 29,
            Ud2 => 30,
            Nop => 31,
            Int3 => 32,
            Syscall => 33,
            Jcc(cc) => 34 + usize::from(cc.enc()),
            Setcc(cc) => 50 + usize::from(cc.enc()),
        }
    }

    /// Number of distinct table indices.
    pub(crate) const TABLE_SIZE: usize = 66;
}

/// Broad control-flow classification of an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    /// Function call.
    Call,
    /// Function return.
    Return,
    /// Unconditional jump.
    UncondJump,
    /// Conditional jump (including LOOP and JRCXZ).
    CondJump,
    /// Trap or interrupt generator.
    Interrupt,
    /// System call.
    Syscall,
    /// Anything else.
    Other,
}

/// The encoding shape the decoder selected (or a builder pinned).
///
/// Pinning the form makes the decoded encoding the canonical one, so that
/// re-encoding a decoded instruction reproduces its bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpcodeForm {
    /// No ModRM; opcode bytes only.
    None,
    /// ModRM with the `reg` field as source (`op r/m, r`).
    RmR,
    /// ModRM with the `reg` field as destination (`op r, r/m`).
    RRm,
    /// ModRM r/m destination with a full-width immediate.
    RmImm,
    /// ModRM r/m destination with a sign-extended 8-bit immediate.
    RmImm8,
    /// ModRM r/m as the only register/memory operand.
    Rm,
    /// Register encoded in the opcode's low three bits.
    OpcodeReg,
    /// Register in the opcode's low bits plus a 64-bit immediate.
    OpcodeRegImm64,
    /// Register in the opcode's low bits plus an immediate of operand width.
    OpcodeRegImm,
    /// Accumulator with an immediate (`op al/eax/rax, imm`).
    AccImm,
    /// 8-bit relative branch displacement.
    Rel8,
    /// 32-bit relative branch displacement.
    Rel32,
    /// An immediate-only form (PUSH imm8/imm32, RET imm16).
    Imm8,
    /// See [`OpcodeForm::Imm8`].
    Imm16,
    /// See [`OpcodeForm::Imm8`].
    Imm32,
}

/// Legacy prefixes carried on a decoded instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prefixes {
    /// `LOCK`.
    pub lock: bool,
    /// `REP`/`REPE` (kept so PAUSE round-trips).
    pub rep: bool,
    /// `REPNE`.
    pub repne: bool,
    /// Segment override.
    pub segment: Segment,
}

/// A reference to a label instruction, resolved at encode time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// One x86-64 instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Opcode class.
    pub opcode: Opcode,
    /// Encoding shape, pinned by the decoder or a builder.
    pub form: OpcodeForm,
    /// Effective operand width in bits (8, 16, 32 or 64).
    pub effective_width: u16,
    /// Where the instruction was decoded from; `None` for synthesised
    /// instructions.
    pub decoded_pc: Option<AppPc>,
    /// Decoded byte length; zero for synthesised instructions.
    pub decoded_len: u8,
    /// Operands, explicit first, implicit appended from the opcode template.
    pub ops: SmallVec<[Operand; 4]>,
    /// Legacy prefixes.
    pub prefixes: Prefixes,
    /// A sticky instruction may not have its operands rewritten at all;
    /// the mangler marks its own replacement CFIs this way.
    pub is_sticky: bool,
}

impl Instruction {
    /// A blank instruction of the given class and shape.
    pub fn new(opcode: Opcode, form: OpcodeForm, effective_width: u16) -> Self {
        Instruction {
            opcode,
            form,
            effective_width,
            decoded_pc: None,
            decoded_len: 0,
            ops: SmallVec::new(),
            prefixes: Prefixes::default(),
            is_sticky: false,
        }
    }

    /// Append an operand.
    pub fn push_op(&mut self, op: Operand) {
        self.ops.push(op);
        debug_assert!(
            self.ops.len() <= crate::MAX_NUM_OPERANDS_DEBUG,
            "operand overflow on {:?}",
            self.opcode
        );
    }

    /// Control-flow category, from the one-shot tables.
    pub fn category(&self) -> Category {
        OpcodeTables::get().category(self.opcode)
    }

    /// Flag effects, from the one-shot tables.
    pub fn flag_effects(&self) -> FlagEffects {
        OpcodeTables::get().flag_effects(self.opcode)
    }

    /// Is this a control-flow instruction (it must end its block)?
    pub fn is_cfi(&self) -> bool {
        !matches!(self.category(), Category::Other)
    }

    /// Conditional jump, including the LOOP family and JRCXZ.
    pub fn is_conditional_jump(&self) -> bool {
        matches!(self.category(), Category::CondJump)
    }

    /// Unconditional direct or indirect jump.
    pub fn is_unconditional_jump(&self) -> bool {
        matches!(self.category(), Category::UncondJump)
    }

    /// Function call.
    pub fn is_function_call(&self) -> bool {
        matches!(self.category(), Category::Call)
    }

    /// Function return.
    pub fn is_function_return(&self) -> bool {
        matches!(self.category(), Category::Return)
    }

    /// Does the first operand make the transfer target indirect?
    pub fn has_indirect_target(&self) -> bool {
        if self.is_function_return() {
            return true;
        }
        if !matches!(
            self.category(),
            Category::Call | Category::UncondJump | Category::CondJump
        ) {
            return false;
        }
        matches!(
            self.ops.first().map(|op| &op.kind),
            Some(OperandKind::Reg(_)) | Some(OperandKind::Mem(_))
        )
    }

    /// The direct branch target, if the first operand is a resolved PC.
    pub fn branch_target_pc(&self) -> Option<AppPc> {
        match self.ops.first().map(|op| op.kind) {
            Some(OperandKind::BranchPc(pc)) => Some(pc),
            _ => None,
        }
    }

    /// Point the first (branch) operand at `pc`.
    pub fn set_branch_target_pc(&mut self, pc: AppPc) {
        debug_assert!(matches!(
            self.ops.first().map(|op| &op.kind),
            Some(OperandKind::BranchPc(_)) | Some(OperandKind::BranchLabel(_))
        ));
        self.ops[0].kind = OperandKind::BranchPc(pc);
    }

    /// Point the first (branch) operand at a label.
    pub fn set_branch_target_label(&mut self, label: Label) {
        debug_assert!(matches!(
            self.ops.first().map(|op| &op.kind),
            Some(OperandKind::BranchPc(_)) | Some(OperandKind::BranchLabel(_))
        ));
        self.ops[0].kind = OperandKind::BranchLabel(label);
    }

    /// Does any operand read the stack pointer (including as an address
    /// base)?
    pub fn reads_stack_pointer(&self) -> bool {
        self.visit_regs_any(|reg, action| reg.is_stack_pointer() && action.may_read())
    }

    /// Does any operand write the stack pointer?
    pub fn writes_stack_pointer(&self) -> bool {
        self.ops.iter().any(|op| {
            matches!(op.kind, OperandKind::Reg(r) if r.is_stack_pointer()) && op.action.may_write()
        })
    }

    /// Net stack-pointer shift performed by this instruction, in bytes.
    pub fn stack_pointer_shift(&self) -> i32 {
        let word = i32::from(crate::GPR_WIDTH_BYTES);
        match self.opcode {
            Opcode::Push => -word,
            Opcode::Pop => word,
            Opcode::Call => -word,
            Opcode::Ret => {
                let extra = match self.ops.first().map(|op| op.kind) {
                    Some(OperandKind::Imm(imm)) => imm.value as i32,
                    _ => 0,
                };
                word + extra
            }
            _ => 0,
        }
    }

    /// Is this a no-op?
    pub fn is_noop(&self) -> bool {
        matches!(self.opcode, Opcode::Nop)
    }

    /// Does this instruction perform an atomic read-modify-write?
    pub fn is_atomic(&self) -> bool {
        self.prefixes.lock
            || (matches!(self.opcode, Opcode::Xchg) && self.ops.iter().any(Operand::is_mem))
    }

    /// Was this instruction decoded from application bytes?
    pub fn is_app(&self) -> bool {
        self.decoded_pc.is_some()
    }

    /// Number of explicit operands.
    pub fn num_explicit_operands(&self) -> usize {
        self.ops.iter().filter(|op| op.is_explicit).count()
    }

    /// Replace operand `idx` if and only if it is explicit and not sticky.
    ///
    /// Returns `false`, leaving the instruction unchanged, otherwise.
    pub fn replace_operand(&mut self, idx: usize, op: Operand) -> bool {
        if self.is_sticky {
            return false;
        }
        match self.ops.get_mut(idx) {
            Some(slot) if slot.is_explicit && !slot.is_sticky => {
                *slot = op;
                true
            }
            _ => false,
        }
    }

    /// Visit every register this instruction touches with the action it is
    /// subject to. Address-computation registers are visited as reads.
    pub fn visit_regs(&self, mut f: impl FnMut(VirtualRegister, OperandAction)) {
        for op in &self.ops {
            match &op.kind {
                OperandKind::Reg(r) => f(*r, op.action),
                OperandKind::Mem(m) | OperandKind::EffectiveAddress(m) => {
                    for r in m.regs() {
                        f(r, OperandAction::Read);
                    }
                }
                _ => {}
            }
        }
    }

    fn visit_regs_any(&self, mut pred: impl FnMut(VirtualRegister, OperandAction) -> bool) -> bool {
        let mut hit = false;
        self.visit_regs(|reg, action| hit |= pred(reg, action));
        hit
    }

    /// Is this instruction a plain register-to-register copy?
    ///
    /// The fragment-local scheduler elides such copies when the destination
    /// is one of its own temporaries.
    pub fn copied_reg(&self) -> Option<(VirtualRegister, VirtualRegister)> {
        if !matches!(self.opcode, Opcode::Mov) {
            return None;
        }
        match (self.ops.first(), self.ops.get(1)) {
            (Some(dst), Some(src)) => match (dst.kind, src.kind) {
                (OperandKind::Reg(d), OperandKind::Reg(s)) if dst.action.always_writes() => {
                    Some((d, s))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.opcode)?;
        for (i, op) in self.ops.iter().filter(|op| op.is_explicit).enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_reversal_is_an_involution() {
        for cc in Cc::ALL {
            assert_ne!(cc.reversed(), cc);
            assert_eq!(cc.reversed().reversed(), cc);
        }
        assert_eq!(Cc::Z.reversed(), Cc::Nz);
        assert_eq!(Cc::Le.reversed(), Cc::Nle);
    }

    #[test]
    fn opcode_walk_covers_table() {
        let mut seen = vec![false; Opcode::TABLE_SIZE];
        Opcode::walk(|op| {
            let idx = op.table_index();
            assert!(!seen[idx], "duplicate table index for {op:?}");
            seen[idx] = true;
        });
        assert!(seen.iter().all(|s| *s));
    }
}
