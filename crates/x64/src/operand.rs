//! Instruction operands.

use core::fmt;

use crate::inst::Label;
use crate::reg::VirtualRegister;
use crate::AppPc;

/// How an instruction treats one of its operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandAction {
    /// Read only.
    Read,
    /// Written only.
    Write,
    /// Read, then written.
    ReadWrite,
    /// Read only if a condition holds (CMOV-style sources).
    CondRead,
    /// Written only if a condition holds.
    CondWrite,
    /// Always read, conditionally written.
    ReadCondWrite,
}

impl OperandAction {
    /// Does this action ever read the operand?
    #[inline]
    pub fn may_read(self) -> bool {
        !matches!(self, OperandAction::Write | OperandAction::CondWrite)
    }

    /// Does this action ever write the operand?
    #[inline]
    pub fn may_write(self) -> bool {
        !matches!(self, OperandAction::Read | OperandAction::CondRead)
    }

    /// Does this action always write the operand (a kill)?
    #[inline]
    pub fn always_writes(self) -> bool {
        matches!(self, OperandAction::Write | OperandAction::ReadWrite)
    }
}

/// The scaling factor of a compound memory operand's index register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scale {
    /// x1.
    #[default]
    One,
    /// x2.
    Two,
    /// x4.
    Four,
    /// x8.
    Eight,
}

impl Scale {
    /// Hardware encoding of the scale (the two `ss` bits of a SIB byte).
    #[inline]
    pub fn enc(self) -> u8 {
        match self {
            Scale::One => 0b00,
            Scale::Two => 0b01,
            Scale::Four => 0b10,
            Scale::Eight => 0b11,
        }
    }

    /// Recover a scale from its hardware encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not 0..=3.
    #[inline]
    pub fn from_enc(enc: u8) -> Scale {
        match enc {
            0b00 => Scale::One,
            0b01 => Scale::Two,
            0b10 => Scale::Four,
            0b11 => Scale::Eight,
            _ => panic!("invalid scale encoding: {enc}"),
        }
    }

    /// The multiplier this scale applies.
    #[inline]
    pub fn multiplier(self) -> u8 {
        1 << self.enc()
    }
}

/// Segment selection on a memory operand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Segment {
    /// No segment prefix; the default segment applies.
    #[default]
    None,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

impl Segment {
    /// Is this the default data segment (no prefix or an explicit DS)?
    ///
    /// Mangling may only rewrite operands in the default segment; anything
    /// else keeps its segment semantics untouched.
    #[inline]
    pub fn is_default_data(self) -> bool {
        matches!(self, Segment::None | Segment::Ds)
    }

    /// The prefix byte for this segment, if one must be emitted.
    #[inline]
    pub fn prefix_byte(self) -> Option<u8> {
        match self {
            Segment::None => None,
            Segment::Cs => Some(0x2E),
            Segment::Ss => Some(0x36),
            Segment::Ds => Some(0x3E),
            Segment::Es => Some(0x26),
            Segment::Fs => Some(0x64),
            Segment::Gs => Some(0x65),
        }
    }
}

/// The address computation of a memory operand or effective address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemExpr {
    /// An absolute pointer, optionally through a non-default segment.
    Absolute {
        /// The pointer value.
        addr: u64,
        /// Segment override, if any.
        segment: Segment,
    },
    /// `base + index * scale + disp`.
    Compound {
        /// Base register, if present.
        base: Option<VirtualRegister>,
        /// Index register, if present. Never RSP.
        index: Option<VirtualRegister>,
        /// Index scaling.
        scale: Scale,
        /// Signed 32-bit displacement.
        disp: i32,
        /// Segment override, if any.
        segment: Segment,
    },
    /// A pinned 8-byte cell emitted into the same cache region as the code,
    /// addressed RIP-relative and resolved against its label at commit time.
    Pinned {
        /// The label bound to the cell.
        label: Label,
    },
}

impl MemExpr {
    /// A `[base]` expression.
    pub fn base(base: VirtualRegister) -> Self {
        MemExpr::Compound {
            base: Some(base),
            index: None,
            scale: Scale::One,
            disp: 0,
            segment: Segment::None,
        }
    }

    /// A `[base + disp]` expression.
    pub fn base_disp(base: VirtualRegister, disp: i32) -> Self {
        MemExpr::Compound {
            base: Some(base),
            index: None,
            scale: Scale::One,
            disp,
            segment: Segment::None,
        }
    }

    /// An absolute pointer in the default segment.
    pub fn absolute(addr: u64) -> Self {
        MemExpr::Absolute {
            addr,
            segment: Segment::None,
        }
    }

    /// The segment this expression addresses through.
    pub fn segment(&self) -> Segment {
        match self {
            MemExpr::Absolute { segment, .. } | MemExpr::Compound { segment, .. } => *segment,
            MemExpr::Pinned { .. } => Segment::None,
        }
    }

    /// Registers named by this expression.
    pub fn regs(&self) -> impl Iterator<Item = VirtualRegister> {
        let (base, index) = match self {
            MemExpr::Compound { base, index, .. } => (*base, *index),
            _ => (None, None),
        };
        base.into_iter().chain(index)
    }

    /// Mutable references to the registers named by this expression.
    pub fn regs_mut(&mut self) -> impl Iterator<Item = &mut VirtualRegister> {
        let (base, index) = match self {
            MemExpr::Compound { base, index, .. } => (base.as_mut(), index.as_mut()),
            _ => (None, None),
        };
        base.into_iter().chain(index)
    }
}

/// An immediate value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Imm {
    /// The value, sign-extended to 64 bits when `signed`.
    pub value: i64,
    /// Whether the encoding sign-extends.
    pub signed: bool,
}

impl Imm {
    /// A signed immediate.
    pub fn signed(value: i64) -> Self {
        Imm {
            value,
            signed: true,
        }
    }

    /// An unsigned immediate.
    pub fn unsigned(value: u64) -> Self {
        Imm {
            value: value as i64,
            signed: false,
        }
    }
}

/// The payload of an operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// A register operand.
    Reg(VirtualRegister),
    /// An immediate.
    Imm(Imm),
    /// A memory dereference.
    Mem(MemExpr),
    /// A branch displacement resolved against an application PC.
    BranchPc(AppPc),
    /// A branch displacement resolved against a label instruction.
    BranchLabel(Label),
    /// A compound address used as a value, not a dereference (LEA source).
    EffectiveAddress(MemExpr),
}

/// One operand of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operand {
    /// The payload.
    pub kind: OperandKind,
    /// Read/write behaviour.
    pub action: OperandAction,
    /// Width in bits of the data this operand names.
    pub width: u16,
    /// Explicit operands come from instruction bytes; implicit ones from the
    /// opcode's template.
    pub is_explicit: bool,
    /// Sticky operands may not be replaced by mangling or scheduling.
    pub is_sticky: bool,
}

impl Operand {
    /// An explicit, replaceable operand.
    pub fn explicit(kind: OperandKind, action: OperandAction, width: u16) -> Self {
        Operand {
            kind,
            action,
            width,
            is_explicit: true,
            is_sticky: false,
        }
    }

    /// An implicit, sticky operand from an opcode template.
    pub fn implicit(kind: OperandKind, action: OperandAction, width: u16) -> Self {
        Operand {
            kind,
            action,
            width,
            is_explicit: false,
            is_sticky: true,
        }
    }

    /// Mark this operand sticky, preventing later rewrites.
    pub fn sticky(mut self) -> Self {
        self.is_sticky = true;
        self
    }

    /// Is this a register operand?
    #[inline]
    pub fn is_reg(&self) -> bool {
        matches!(self.kind, OperandKind::Reg(_))
    }

    /// Is this a memory dereference?
    #[inline]
    pub fn is_mem(&self) -> bool {
        matches!(self.kind, OperandKind::Mem(_))
    }

    /// The register payload, if this is a register operand.
    #[inline]
    pub fn reg(&self) -> Option<VirtualRegister> {
        match self.kind {
            OperandKind::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// All registers this operand reads as part of address computation or as
    /// its payload, with the action applying only to a `Reg` payload;
    /// address registers are always reads.
    pub fn regs(&self) -> impl Iterator<Item = VirtualRegister> + '_ {
        let (reg, mem): (Option<VirtualRegister>, Option<&MemExpr>) = match &self.kind {
            OperandKind::Reg(r) => (Some(*r), None),
            OperandKind::Mem(m) | OperandKind::EffectiveAddress(m) => (None, Some(m)),
            _ => (None, None),
        };
        reg.into_iter().chain(mem.into_iter().flat_map(|m| m.regs()))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            OperandKind::Reg(r) => write!(f, "{r}"),
            OperandKind::Imm(imm) => write!(f, "${:#x}", imm.value),
            OperandKind::Mem(m) => write!(f, "{m:?}"),
            OperandKind::BranchPc(pc) => write!(f, "{pc:#x}"),
            OperandKind::BranchLabel(l) => write!(f, ".L{}", l.0),
            OperandKind::EffectiveAddress(m) => write!(f, "&{m:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::Gpr;

    #[test]
    fn action_predicates() {
        assert!(OperandAction::Read.may_read());
        assert!(!OperandAction::Read.may_write());
        assert!(OperandAction::ReadCondWrite.may_read());
        assert!(OperandAction::ReadCondWrite.may_write());
        assert!(!OperandAction::ReadCondWrite.always_writes());
        assert!(OperandAction::ReadWrite.always_writes());
    }

    #[test]
    fn mem_expr_regs() {
        let expr = MemExpr::Compound {
            base: Some(VirtualRegister::native(Gpr::Rax)),
            index: Some(VirtualRegister::native(Gpr::Rcx)),
            scale: Scale::Four,
            disp: -8,
            segment: Segment::None,
        };
        let regs: Vec<_> = expr.regs().collect();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].gpr(), Gpr::Rax);
        assert_eq!(regs[1].gpr(), Gpr::Rcx);
        assert!(MemExpr::absolute(0x1000).regs().next().is_none());
    }

    #[test]
    fn segment_defaults() {
        assert!(Segment::None.is_default_data());
        assert!(Segment::Ds.is_default_data());
        assert!(!Segment::Gs.is_default_data());
        assert_eq!(Segment::Gs.prefix_byte(), Some(0x65));
        assert_eq!(Segment::None.prefix_byte(), None);
    }
}
