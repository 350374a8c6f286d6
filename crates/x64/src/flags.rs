//! Architectural flag sets and per-instruction flag effects.

use bitflags::bitflags;

bitflags! {
    /// The RFLAGS bits the translator tracks.
    ///
    /// Only the bits an instruction can meaningfully read or kill are
    /// represented; the reserved bits of the hardware register are not.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Rflags: u16 {
        /// Carry.
        const CF = 1 << 0;
        /// Parity.
        const PF = 1 << 2;
        /// Adjust (auxiliary carry).
        const AF = 1 << 4;
        /// Zero.
        const ZF = 1 << 6;
        /// Sign.
        const SF = 1 << 7;
        /// Trap (single-step).
        const TF = 1 << 8;
        /// Interrupt enable.
        const IF = 1 << 9;
        /// Direction.
        const DF = 1 << 10;
        /// Overflow.
        const OF = 1 << 11;
    }
}

impl Rflags {
    /// The arithmetic status flags: CF, PF, AF, ZF, SF, OF.
    pub const STATUS: Rflags = Rflags::CF
        .union(Rflags::PF)
        .union(Rflags::AF)
        .union(Rflags::ZF)
        .union(Rflags::SF)
        .union(Rflags::OF);

    /// The five flags covered by `LAHF`/`SAHF`: SF, ZF, AF, PF, CF.
    pub const LAHF: Rflags = Rflags::SF
        .union(Rflags::ZF)
        .union(Rflags::AF)
        .union(Rflags::PF)
        .union(Rflags::CF);
}

/// The flags an instruction reads and writes.
///
/// Built once per opcode class when the static tables are initialised. A
/// conditional ("may-write") flag write is widened into a read at table
/// build time, so a consumer never needs to reason about conditional kills.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlagEffects {
    /// Flags whose values the instruction consumes.
    pub read: Rflags,
    /// Flags the instruction overwrites (including undefined results).
    pub written: Rflags,
}

impl FlagEffects {
    /// No flag interaction at all.
    pub const NONE: FlagEffects = FlagEffects {
        read: Rflags::empty(),
        written: Rflags::empty(),
    };

    /// Reads `read`, writes `written`.
    pub const fn new(read: Rflags, written: Rflags) -> Self {
        FlagEffects { read, written }
    }

    /// Writes `written`, reads nothing.
    pub const fn writes(written: Rflags) -> Self {
        FlagEffects {
            read: Rflags::empty(),
            written,
        }
    }

    /// Reads `read`, writes nothing.
    pub const fn reads(read: Rflags) -> Self {
        FlagEffects {
            read,
            written: Rflags::empty(),
        }
    }

    /// Widen a conditional write into a read of the same flags.
    ///
    /// Used when an instruction only sometimes updates its flags (shift by a
    /// possibly-zero count); downstream liveness must then treat the old
    /// values as consumed.
    pub const fn with_may_write(self) -> Self {
        FlagEffects {
            read: self.read.union(self.written),
            written: self.written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn may_write_widens_into_read() {
        let fx = FlagEffects::writes(Rflags::CF.union(Rflags::ZF)).with_may_write();
        assert_eq!(fx.read, Rflags::CF | Rflags::ZF);
        assert_eq!(fx.written, Rflags::CF | Rflags::ZF);
    }

    #[test]
    fn lahf_mask_matches_sahf_layout() {
        assert_eq!(
            Rflags::LAHF,
            Rflags::SF | Rflags::ZF | Rflags::AF | Rflags::PF | Rflags::CF
        );
        assert!(!Rflags::LAHF.contains(Rflags::OF));
        assert!(!Rflags::LAHF.contains(Rflags::DF));
    }
}
