//! General-purpose registers and the virtual register union.

use core::fmt;

/// The sixteen x86-64 integer registers, in hardware encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Number of general-purpose registers.
pub const NUM_GPRS: usize = 16;

impl Gpr {
    /// All sixteen registers, in encoding order.
    pub const ALL: [Gpr; NUM_GPRS] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Hardware encoding (0..=15). The low three bits go in ModRM/SIB; the
    /// fourth bit goes in the REX prefix.
    #[inline]
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// Recover a register from its hardware encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not a valid encoding (0..=15).
    #[inline]
    pub fn from_enc(enc: u8) -> Gpr {
        Self::ALL[usize::from(enc)]
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(name)
    }
}

/// Which kind of storage a `VirtualRegister` names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VrKind {
    /// An architectural GPR used natively by application code.
    ArchGpr,
    /// An architectural GPR used symbolically by the scheduler.
    ArchVirtual,
    /// A numbered temporary created by mangling or instrumentation.
    Virtual,
    /// A numbered spill slot in a partition-owned save area.
    Slot,
}

/// A register as seen by the translation pipeline.
///
/// This is a small tagged union: either an architectural GPR (used natively
/// or symbolically), a numbered virtual register awaiting scheduling, or a
/// spill slot. Widening changes the observed byte width without changing the
/// register's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualRegister {
    kind: VrKind,
    width: u8,
    num: u16,
}

impl VirtualRegister {
    /// A native architectural register at full width.
    #[inline]
    pub fn native(gpr: Gpr) -> Self {
        Self::native_with_width(gpr, crate::GPR_WIDTH_BYTES)
    }

    /// A native architectural register at a chosen byte width.
    #[inline]
    pub fn native_with_width(gpr: Gpr, width: u8) -> Self {
        VirtualRegister {
            kind: VrKind::ArchGpr,
            width,
            num: u16::from(gpr.enc()),
        }
    }

    /// An architectural register used symbolically by the scheduler.
    #[inline]
    pub fn arch_virtual(gpr: Gpr) -> Self {
        VirtualRegister {
            kind: VrKind::ArchVirtual,
            width: crate::GPR_WIDTH_BYTES,
            num: u16::from(gpr.enc()),
        }
    }

    /// The `num`th virtual register, at a chosen byte width.
    #[inline]
    pub fn virt(num: u16, width: u8) -> Self {
        VirtualRegister {
            kind: VrKind::Virtual,
            width,
            num,
        }
    }

    /// The `num`th spill slot.
    #[inline]
    pub fn slot(num: u16) -> Self {
        VirtualRegister {
            kind: VrKind::Slot,
            width: crate::GPR_WIDTH_BYTES,
            num,
        }
    }

    /// Which kind of storage this register names.
    #[inline]
    pub fn kind(self) -> VrKind {
        self.kind
    }

    /// The register's number within its kind.
    #[inline]
    pub fn number(self) -> u16 {
        self.num
    }

    /// Observed width in bytes.
    #[inline]
    pub fn byte_width(self) -> u8 {
        self.width
    }

    /// Observed width in bits.
    #[inline]
    pub fn bit_width(self) -> u16 {
        u16::from(self.width) * 8
    }

    /// Change the observed width without changing identity.
    #[inline]
    pub fn widen(&mut self, bytes: u8) {
        self.width = bytes;
    }

    /// Same register at a different observed width.
    #[inline]
    pub fn widened(mut self, bytes: u8) -> Self {
        self.widen(bytes);
        self
    }

    /// Is this an architectural register (native or symbolic)?
    #[inline]
    pub fn is_native(self) -> bool {
        matches!(self.kind, VrKind::ArchGpr | VrKind::ArchVirtual)
    }

    /// Is this a general-purpose register?
    #[inline]
    pub fn is_general_purpose(self) -> bool {
        self.is_native()
    }

    /// Is this a numbered virtual register?
    #[inline]
    pub fn is_virtual(self) -> bool {
        self.kind == VrKind::Virtual
    }

    /// Is this a spill slot?
    #[inline]
    pub fn is_virtual_slot(self) -> bool {
        self.kind == VrKind::Slot
    }

    /// Is this the stack pointer?
    #[inline]
    pub fn is_stack_pointer(self) -> bool {
        self.is_native() && self.num == u16::from(Gpr::Rsp.enc())
    }

    /// The architectural register named here.
    ///
    /// # Panics
    ///
    /// Panics if this is not an architectural register.
    #[inline]
    pub fn gpr(self) -> Gpr {
        assert!(self.is_native(), "not an architectural register: {self:?}");
        Gpr::from_enc(self.num as u8)
    }

    /// Two registers are the same storage if they agree on kind and number,
    /// regardless of observed width.
    #[inline]
    pub fn same_storage(self, other: VirtualRegister) -> bool {
        self.kind == other.kind && self.num == other.num
    }
}

impl From<Gpr> for VirtualRegister {
    fn from(gpr: Gpr) -> Self {
        VirtualRegister::native(gpr)
    }
}

impl fmt::Debug for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            VrKind::ArchGpr => write!(f, "{}/{}", Gpr::from_enc(self.num as u8), self.width),
            VrKind::ArchVirtual => write!(f, "%{}", Gpr::from_enc(self.num as u8)),
            VrKind::Virtual => write!(f, "%v{}/{}", self.num, self.width),
            VrKind::Slot => write!(f, "[slot {}]", self.num),
        }
    }
}

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Set of general-purpose registers as a bit vector.
///
/// While scheduling registers we need to keep track of which GPRs are in use
/// by an instruction, live across a boundary, or banned from selection. All
/// of those are small sets over sixteen registers, so one word suffices.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct GprSet {
    bits: u16,
}

impl GprSet {
    /// The empty set.
    #[inline]
    pub fn empty() -> Self {
        GprSet { bits: 0 }
    }

    /// The set of all sixteen registers.
    #[inline]
    pub fn all() -> Self {
        GprSet { bits: !0 }
    }

    /// Insert `gpr`.
    #[inline]
    pub fn insert(&mut self, gpr: Gpr) {
        self.bits |= 1 << gpr.enc();
    }

    /// Remove `gpr`.
    #[inline]
    pub fn remove(&mut self, gpr: Gpr) {
        self.bits &= !(1 << gpr.enc());
    }

    /// Does the set contain `gpr`?
    #[inline]
    pub fn contains(self, gpr: Gpr) -> bool {
        self.bits & (1 << gpr.enc()) != 0
    }

    /// Is the set empty?
    #[inline]
    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Number of registers in the set.
    #[inline]
    pub fn len(self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Union with `other`, in place.
    #[inline]
    pub fn union(&mut self, other: GprSet) {
        self.bits |= other.bits;
    }

    /// Intersection with `other`.
    #[inline]
    pub fn intersect(self, other: GprSet) -> GprSet {
        GprSet {
            bits: self.bits & other.bits,
        }
    }

    /// Set difference `self - other`.
    #[inline]
    pub fn difference(self, other: GprSet) -> GprSet {
        GprSet {
            bits: self.bits & !other.bits,
        }
    }

    /// Is `self` a superset of `other`?
    #[inline]
    pub fn is_superset(self, other: GprSet) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Iterate over the members, in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        Gpr::ALL.into_iter().filter(move |g| self.contains(*g))
    }
}

impl FromIterator<Gpr> for GprSet {
    fn from_iter<T: IntoIterator<Item = Gpr>>(iter: T) -> Self {
        let mut set = GprSet::empty();
        for gpr in iter {
            set.insert(gpr);
        }
        set
    }
}

impl fmt::Debug for GprSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for gpr in self.iter() {
            write!(f, " {gpr}")?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_preserves_identity() {
        let mut vr = VirtualRegister::virt(3, 8);
        let before = vr;
        vr.widen(4);
        assert_eq!(vr.byte_width(), 4);
        assert!(vr.same_storage(before));
        assert_ne!(vr, before);
    }

    #[test]
    fn stack_pointer_predicate() {
        assert!(VirtualRegister::native(Gpr::Rsp).is_stack_pointer());
        assert!(!VirtualRegister::native(Gpr::Rbp).is_stack_pointer());
        assert!(!VirtualRegister::virt(4, 8).is_stack_pointer());
    }

    #[test]
    fn gpr_set_ops() {
        let mut set = GprSet::empty();
        set.insert(Gpr::Rax);
        set.insert(Gpr::R13);
        assert!(set.contains(Gpr::Rax));
        assert!(!set.contains(Gpr::Rcx));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Gpr::Rax, Gpr::R13]);

        let mut other = GprSet::empty();
        other.insert(Gpr::Rax);
        assert!(set.is_superset(other));
        other.insert(Gpr::Rdx);
        assert!(!set.is_superset(other));

        set.union(other);
        assert!(set.contains(Gpr::Rdx));
        assert_eq!(set.difference(other).iter().collect::<Vec<_>>(), vec![Gpr::R13]);
    }
}
