//! Typed instructions to machine bytes.
//!
//! Encoding is two-phase. The *staged* phase computes the exact byte size of
//! an instruction without writing anything, so the fragment layout pass can
//! assign cache PCs. The *commit* phase writes bytes into the cache region,
//! resolving branch displacements against the cache PCs assigned to target
//! labels and blocks. An unresolved displacement at commit time is an
//! internal invariant violation, reported as an error the caller treats as
//! fatal.
//!
//! Spill-slot registers are lowered here: a slot operand becomes a
//! GS-relative absolute memory access into the per-thread save area, which
//! the host environment reserves.

use crate::inst::{Instruction, Label, Opcode, OpcodeForm};
use crate::operand::{Imm, MemExpr, Operand, OperandKind, Segment};
use crate::reg::{Gpr, VirtualRegister};
use crate::CachePc;

/// Why an instruction failed to encode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A branch operand still points at an unassigned label or block.
    #[error("unresolved branch displacement at commit time")]
    UnresolvedBranch,
    /// A displacement or absolute address does not fit its encoding.
    #[error("displacement out of range for the selected encoding")]
    DisplacementOverflow,
    /// An operand still names an unscheduled virtual register.
    #[error("virtual register survived to encode time")]
    UnscheduledRegister,
    /// The opcode/form pair has no encoding.
    #[error("no encoding for this opcode/form combination")]
    BadForm,
}

/// Destination of encoded bytes.
pub trait CodeSink {
    /// Append one byte.
    fn put1(&mut self, byte: u8);
    /// Bytes written so far.
    fn offset(&self) -> usize;

    /// Append a little-endian 16-bit value.
    fn put2(&mut self, value: u16) {
        self.put1(value as u8);
        self.put1((value >> 8) as u8);
    }

    /// Append a little-endian 32-bit value.
    fn put4(&mut self, value: u32) {
        self.put2(value as u16);
        self.put2((value >> 16) as u16);
    }

    /// Append a little-endian 64-bit value.
    fn put8(&mut self, value: u64) {
        self.put4(value as u32);
        self.put4((value >> 32) as u32);
    }
}

/// Sink that accumulates bytes in memory.
#[derive(Default)]
pub struct VecSink {
    /// The bytes emitted so far.
    pub bytes: Vec<u8>,
}

impl CodeSink for VecSink {
    fn put1(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn offset(&self) -> usize {
        self.bytes.len()
    }
}

/// Sink that only measures.
#[derive(Default)]
pub struct CountingSink {
    len: usize,
}

impl CountingSink {
    /// Bytes that would have been written.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing would have been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl CodeSink for CountingSink {
    fn put1(&mut self, _byte: u8) {
        self.len += 1;
    }

    fn offset(&self) -> usize {
        self.len
    }
}

/// Resolves label references to cache PCs at commit time.
pub trait LabelResolver {
    /// The cache PC assigned to `label`, if any.
    fn label_pc(&self, label: Label) -> Option<CachePc>;
}

/// The empty resolver; every label is unresolved.
impl LabelResolver for () {
    fn label_pc(&self, _label: Label) -> Option<CachePc> {
        None
    }
}

/// Compute the encoded size of `instr` without writing bytes.
pub fn staged_len(instr: &Instruction) -> Result<usize, EncodeError> {
    let mut sink = CountingSink::default();
    emit(instr, &mut sink, None, &())?;
    Ok(sink.len())
}

/// Write `instr` into `sink`, assuming the instruction starts at cache PC
/// `pc`. Branch displacements resolve against `labels` and against absolute
/// branch-target PCs.
pub fn encode(
    instr: &Instruction,
    sink: &mut impl CodeSink,
    pc: CachePc,
    labels: &impl LabelResolver,
) -> Result<(), EncodeError> {
    emit(instr, sink, Some(pc), labels)
}

/// Per-thread spill-slot save area: `gs:[slot * 8]`.
fn slot_mem(slot: u16) -> MemExpr {
    MemExpr::Absolute {
        addr: u64::from(slot) * u64::from(crate::GPR_WIDTH_BYTES),
        segment: Segment::Gs,
    }
}

#[derive(Clone, Copy, Default)]
struct RexPlan {
    w: bool,
    r: u8,
    x: u8,
    b: u8,
    force: bool,
}

impl RexPlan {
    fn emit(self, sink: &mut impl CodeSink) {
        let rex = 0x40
            | (u8::from(self.w) << 3)
            | (((self.r >> 3) & 1) << 2)
            | (((self.x >> 3) & 1) << 1)
            | ((self.b >> 3) & 1);
        if rex != 0x40 || self.force {
            sink.put1(rex);
        }
    }

    /// The REX byte must be present to reach SPL/BPL/SIL/DIL instead of the
    /// legacy high-byte registers.
    fn force_if_8bit(&mut self, width: u16, enc: u8) {
        if width == 8 && (4..=7).contains(&enc) {
            self.force = true;
        }
    }
}

#[derive(Clone, Copy)]
enum Disp {
    None,
    D8(i8),
    D32(i32),
    /// RIP-relative displacement to a labelled cell, resolved at commit.
    Rip(Label),
}

impl Disp {
    fn m0d(self) -> u8 {
        match self {
            Disp::None => 0b00,
            Disp::D8(_) => 0b01,
            Disp::D32(_) => 0b10,
            // RIP-relative uses mod=00 with rm=101.
            Disp::Rip(_) => 0b00,
        }
    }

    fn of(disp: i32, force: bool) -> Disp {
        if disp == 0 && !force {
            Disp::None
        } else if let Ok(d8) = i8::try_from(disp) {
            Disp::D8(d8)
        } else {
            Disp::D32(disp)
        }
    }
}

struct RmPlan {
    modrm_mod: u8,
    modrm_rm: u8,
    sib: Option<u8>,
    disp: Disp,
    x: u8,
    b: u8,
}

fn encode_modrm(m0d: u8, reg: u8, rm: u8) -> u8 {
    debug_assert!(m0d < 4 && reg < 8 && rm < 8);
    (m0d << 6) | (reg << 3) | rm
}

fn encode_sib(scale: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale < 4 && index < 8 && base < 8);
    (scale << 6) | (index << 3) | base
}

fn native_enc(reg: VirtualRegister) -> Result<u8, EncodeError> {
    if reg.is_native() {
        Ok(reg.number() as u8)
    } else {
        Err(EncodeError::UnscheduledRegister)
    }
}

fn plan_mem(mem: &MemExpr) -> Result<RmPlan, EncodeError> {
    match mem {
        MemExpr::Pinned { label } => Ok(RmPlan {
            modrm_mod: 0b00,
            modrm_rm: 0b101,
            sib: None,
            disp: Disp::Rip(*label),
            x: 0,
            b: 0,
        }),
        MemExpr::Absolute { addr, .. } => {
            // Absolute addressing through [disp32]: ModRM rm=100 with a SIB
            // byte naming no base and no index. Far pointers must have been
            // relativised by the mangler before reaching the encoder.
            let disp = i32::try_from(*addr as i64).map_err(|_| EncodeError::DisplacementOverflow)?;
            Ok(RmPlan {
                modrm_mod: 0b00,
                modrm_rm: 0b100,
                sib: Some(encode_sib(0, 0b100, 0b101)),
                disp: Disp::D32(disp),
                x: 0,
                b: 0,
            })
        }
        MemExpr::Compound {
            base,
            index,
            scale,
            disp,
            ..
        } => {
            let index_enc = match index {
                Some(r) => {
                    let enc = native_enc(*r)?;
                    assert!(enc != Gpr::Rsp.enc(), "rsp cannot be an index register");
                    Some(enc)
                }
                None => None,
            };
            match (base, index_enc) {
                (Some(base), None) => {
                    let base_enc = native_enc(*base)?;
                    if base_enc & 7 == Gpr::Rsp.enc() {
                        // rsp/r12 base requires a SIB byte.
                        let d = Disp::of(*disp, false);
                        Ok(RmPlan {
                            modrm_mod: d.m0d(),
                            modrm_rm: 0b100,
                            sib: Some(encode_sib(0, 0b100, 0b100)),
                            disp: d,
                            x: 0,
                            b: base_enc,
                        })
                    } else {
                        // rbp/r13 base cannot use the no-displacement form.
                        let force = base_enc & 7 == Gpr::Rbp.enc();
                        let d = Disp::of(*disp, force);
                        Ok(RmPlan {
                            modrm_mod: d.m0d(),
                            modrm_rm: base_enc & 7,
                            sib: None,
                            disp: d,
                            x: 0,
                            b: base_enc,
                        })
                    }
                }
                (Some(base), Some(index_enc)) => {
                    let base_enc = native_enc(*base)?;
                    let force = base_enc & 7 == Gpr::Rbp.enc();
                    let d = Disp::of(*disp, force);
                    Ok(RmPlan {
                        modrm_mod: d.m0d(),
                        modrm_rm: 0b100,
                        sib: Some(encode_sib(scale.enc(), index_enc & 7, base_enc & 7)),
                        disp: d,
                        x: index_enc,
                        b: base_enc,
                    })
                }
                (None, index_enc) => {
                    // No base: SIB with base=101 and a mandatory disp32.
                    let (index_bits, x) = match index_enc {
                        Some(enc) => (enc & 7, enc),
                        None => (0b100, 0),
                    };
                    Ok(RmPlan {
                        modrm_mod: 0b00,
                        modrm_rm: 0b100,
                        sib: Some(encode_sib(scale.enc(), index_bits, 0b101)),
                        disp: Disp::D32(*disp),
                        x,
                        b: 0,
                    })
                }
            }
        }
    }
}

enum RmTarget<'a> {
    Reg(u8),
    Mem(&'a MemExpr),
}

fn rm_target(op: &Operand) -> Result<RmTarget<'_>, EncodeError> {
    match &op.kind {
        OperandKind::Reg(r) => {
            if r.is_virtual_slot() {
                // Lowered by the caller before planning.
                Err(EncodeError::BadForm)
            } else {
                Ok(RmTarget::Reg(native_enc(*r)?))
            }
        }
        OperandKind::Mem(m) | OperandKind::EffectiveAddress(m) => Ok(RmTarget::Mem(m)),
        _ => Err(EncodeError::BadForm),
    }
}

fn plan_rm(target: &RmTarget) -> Result<RmPlan, EncodeError> {
    match target {
        RmTarget::Reg(enc) => Ok(RmPlan {
            modrm_mod: 0b11,
            modrm_rm: enc & 7,
            sib: None,
            disp: Disp::None,
            x: 0,
            b: *enc,
        }),
        RmTarget::Mem(mem) => plan_mem(mem),
    }
}

/// Opcode byte(s) for an opcode/form/width triple: optional `0F` escape, the
/// primary byte, and the ModRM `reg` extension for group opcodes.
fn opcode_bytes(
    opcode: Opcode,
    form: OpcodeForm,
    width: u16,
) -> Result<(bool, u8, u8), EncodeError> {
    use Opcode::*;
    use OpcodeForm::*;

    let alu_index = |op: Opcode| -> Option<u8> {
        Option::Some(match op {
            Add => 0,
            Or => 1,
            Adc => 2,
            Sbb => 3,
            And => 4,
            Sub => 5,
            Xor => 6,
            Cmp => 7,
            _ => return Option::None,
        })
    };

    let wide = width > 8;
    Ok(match (opcode, form) {
        (Mov, RmR) => (false, if wide { 0x89 } else { 0x88 }, 0),
        (Mov, RRm) => (false, if wide { 0x8B } else { 0x8A }, 0),
        (Mov, RmImm) => (false, 0xC7, 0),
        (Mov, RmImm8) => (false, 0xC6, 0),
        (Mov, OpcodeRegImm64) => (false, 0xB8, 0),
        (Mov, OpcodeRegImm) => (false, if wide { 0xB8 } else { 0xB0 }, 0),
        (Lea, RRm) => (false, 0x8D, 0),
        (Xchg, RmR) => (false, if wide { 0x87 } else { 0x86 }, 0),
        (Test, RmR) => (false, if wide { 0x85 } else { 0x84 }, 0),
        (Test, AccImm) => (false, if wide { 0xA9 } else { 0xA8 }, 0),
        (Test, RmImm) | (Test, RmImm8) => (false, if wide { 0xF7 } else { 0xF6 }, 0),
        (Push, OpcodeReg) => (false, 0x50, 0),
        (Push, Rm) => (false, 0xFF, 6),
        (Push, Imm8) => (false, 0x6A, 0),
        (Push, Imm32) => (false, 0x68, 0),
        (Pop, OpcodeReg) => (false, 0x58, 0),
        (Pop, Rm) => (false, 0x8F, 0),
        (Inc, Rm) => (false, if wide { 0xFF } else { 0xFE }, 0),
        (Dec, Rm) => (false, if wide { 0xFF } else { 0xFE }, 1),
        (Not, Rm) => (false, if wide { 0xF7 } else { 0xF6 }, 2),
        (Neg, Rm) => (false, if wide { 0xF7 } else { 0xF6 }, 3),
        (Shl, RmImm8) => (false, if wide { 0xC1 } else { 0xC0 }, 4),
        (Shr, RmImm8) => (false, if wide { 0xC1 } else { 0xC0 }, 5),
        (Sar, RmImm8) => (false, if wide { 0xC1 } else { 0xC0 }, 7),
        (Shl, Rm) => (false, if wide { 0xD3 } else { 0xD2 }, 4),
        (Shr, Rm) => (false, if wide { 0xD3 } else { 0xD2 }, 5),
        (Sar, Rm) => (false, if wide { 0xD3 } else { 0xD2 }, 7),
        (Jmp, Rel8) => (false, 0xEB, 0),
        (Jmp, Rel32) => (false, 0xE9, 0),
        (Jmp, Rm) => (false, 0xFF, 4),
        (Call, Rel32) => (false, 0xE8, 0),
        (Call, Rm) => (false, 0xFF, 2),
        (Ret, None) => (false, 0xC3, 0),
        (Ret, Imm16) => (false, 0xC2, 0),
        (Jcc(cc), Rel8) => (false, 0x70 | cc.enc(), 0),
        (Jcc(cc), Rel32) => (true, 0x80 | cc.enc(), 0),
        (Setcc(cc), Rm) => (true, 0x90 | cc.enc(), 0),
        (Loopne, Rel8) => (false, 0xE0, 0),
        (Loope, Rel8) => (false, 0xE1, 0),
        (Loop, Rel8) => (false, 0xE2, 0),
        (Jrcxz, Rel8) => (false, 0xE3, 0),
        (Lahf, None) => (false, 0x9F, 0),
        (Sahf, None) => (false, 0x9E, 0),
        (Ud2, None) => (true, 0x0B, 0),
        (Nop, None) => (false, 0x90, 0),
        (Nop, Rm) => (true, 0x1F, 0),
        (Int3, None) => (false, 0xCC, 0),
        (Syscall, None) => (true, 0x05, 0),
        _ => {
            if alu_index(opcode).is_some() {
                let idx = alu_index(opcode).unwrap();
                match form {
                    RmR => (false, (idx << 3) | u8::from(wide), 0),
                    RRm => (false, (idx << 3) | 2 | u8::from(wide), 0),
                    AccImm => (false, (idx << 3) | 4 | u8::from(wide), 0),
                    RmImm => (false, 0x81, idx),
                    RmImm8 => (false, if wide { 0x83 } else { 0x80 }, idx),
                    _ => return Err(EncodeError::BadForm),
                }
            } else {
                return Err(EncodeError::BadForm);
            }
        }
    })
}

/// Opcodes that default to 64-bit operation in long mode and must not carry
/// REX.W.
fn defaults_to_64(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Push
            | Opcode::Pop
            | Opcode::Call
            | Opcode::Ret
            | Opcode::Jmp
            | Opcode::Jcc(_)
            | Opcode::Loop
            | Opcode::Loope
            | Opcode::Loopne
            | Opcode::Jrcxz
    )
}

fn imm_bits(imm: Imm, bits: u16, sink: &mut impl CodeSink) {
    match bits {
        8 => sink.put1(imm.value as u8),
        16 => sink.put2(imm.value as u16),
        32 => sink.put4(imm.value as u32),
        _ => sink.put8(imm.value as u64),
    }
}

fn explicit_imm(instr: &Instruction) -> Result<Imm, EncodeError> {
    instr
        .ops
        .iter()
        .find_map(|op| match op.kind {
            OperandKind::Imm(imm) if op.is_explicit => Some(imm),
            _ => Option::None,
        })
        .ok_or(EncodeError::BadForm)
}

/// Write a planned displacement. RIP-relative displacements are nominally
/// relative to the end of the instruction; `bytes_at_end` compensates for any
/// immediate bytes that follow the displacement field.
fn emit_disp(
    disp: Disp,
    sink: &mut impl CodeSink,
    start: usize,
    pc: Option<CachePc>,
    labels: &impl LabelResolver,
    bytes_at_end: usize,
) -> Result<(), EncodeError> {
    match disp {
        Disp::None => {}
        Disp::D8(d) => sink.put1(d as u8),
        Disp::D32(d) => sink.put4(d as u32),
        Disp::Rip(label) => match pc {
            Option::None => sink.put4(0),
            Some(pc) => {
                let target = labels.label_pc(label).ok_or(EncodeError::UnresolvedBranch)?;
                let len = (sink.offset() - start) + 4 + bytes_at_end;
                let next = pc.wrapping_add(len as u64);
                let d = i32::try_from(target.wrapping_sub(next) as i64)
                    .map_err(|_| EncodeError::DisplacementOverflow)?;
                sink.put4(d as u32);
            }
        },
    }
    Ok(())
}

fn emit(
    instr: &Instruction,
    sink: &mut impl CodeSink,
    pc: Option<CachePc>,
    labels: &impl LabelResolver,
) -> Result<(), EncodeError> {
    // Lower spill-slot operands into the GS save area before any prefix
    // decisions are made.
    let lowered;
    let instr = if instr
        .ops
        .iter()
        .any(|op| matches!(op.kind, OperandKind::Reg(r) if r.is_virtual_slot()))
    {
        let mut copy = instr.clone();
        for op in &mut copy.ops {
            if let OperandKind::Reg(r) = op.kind {
                if r.is_virtual_slot() {
                    op.kind = OperandKind::Mem(slot_mem(r.number()));
                }
            }
        }
        lowered = copy;
        &lowered
    } else {
        instr
    };

    let start = sink.offset();
    let width = instr.effective_width;

    // The segment prefix comes from the decoded prefix set, or from the
    // segment a builder recorded on a memory expression.
    let segment = if instr.prefixes.segment != Segment::None {
        instr.prefixes.segment
    } else {
        instr
            .ops
            .iter()
            .find_map(|op| match &op.kind {
                OperandKind::Mem(m) | OperandKind::EffectiveAddress(m) => match m.segment() {
                    Segment::None => Option::None,
                    seg => Some(seg),
                },
                _ => Option::None,
            })
            .unwrap_or(Segment::None)
    };

    // Legacy prefixes.
    if instr.prefixes.lock {
        sink.put1(0xF0);
    }
    if instr.prefixes.repne {
        sink.put1(0xF2);
    }
    if instr.prefixes.rep {
        sink.put1(0xF3);
    }
    if let Some(seg) = segment.prefix_byte() {
        sink.put1(seg);
    }
    if width == 16 {
        sink.put1(0x66);
    }

    let (escape, opcode_byte, ext) = opcode_bytes(instr.opcode, instr.form, width)?;
    let mut rex = RexPlan {
        w: width == 64 && !defaults_to_64(instr.opcode),
        ..RexPlan::default()
    };

    match instr.form {
        OpcodeForm::None => {
            rex.emit(sink);
            if escape {
                sink.put1(0x0F);
            }
            sink.put1(opcode_byte);
        }

        OpcodeForm::RmR | OpcodeForm::RRm => {
            let (rm_op, reg_op) = if matches!(instr.form, OpcodeForm::RmR) {
                (&instr.ops[0], &instr.ops[1])
            } else {
                (&instr.ops[1], &instr.ops[0])
            };
            let reg_enc = native_enc(reg_op.reg().ok_or(EncodeError::BadForm)?)?;
            let target = rm_target(rm_op)?;
            let plan = plan_rm(&target)?;
            rex.r = reg_enc;
            rex.x = plan.x;
            rex.b = plan.b;
            rex.force_if_8bit(width, reg_enc);
            if let RmTarget::Reg(enc) = target {
                rex.force_if_8bit(width, enc);
            }
            rex.emit(sink);
            if escape {
                sink.put1(0x0F);
            }
            sink.put1(opcode_byte);
            sink.put1(encode_modrm(plan.modrm_mod, reg_enc & 7, plan.modrm_rm));
            if let Some(sib) = plan.sib {
                sink.put1(sib);
            }
            emit_disp(plan.disp, sink, start, pc, labels, 0)?;
        }

        OpcodeForm::Rm | OpcodeForm::RmImm | OpcodeForm::RmImm8 => {
            let rm_op = &instr.ops[0];
            let target = rm_target(rm_op)?;
            let plan = plan_rm(&target)?;
            rex.x = plan.x;
            rex.b = plan.b;
            if let RmTarget::Reg(enc) = target {
                rex.force_if_8bit(width, enc);
            }
            rex.emit(sink);
            if escape {
                sink.put1(0x0F);
            }
            sink.put1(opcode_byte);
            sink.put1(encode_modrm(plan.modrm_mod, ext, plan.modrm_rm));
            if let Some(sib) = plan.sib {
                sink.put1(sib);
            }
            let bytes_at_end = match instr.form {
                OpcodeForm::RmImm => width.min(32) / 8,
                OpcodeForm::RmImm8 => 1,
                _ => 0,
            };
            emit_disp(plan.disp, sink, start, pc, labels, bytes_at_end as usize)?;
            match instr.form {
                OpcodeForm::RmImm => {
                    imm_bits(explicit_imm(instr)?, width.min(32), sink);
                }
                OpcodeForm::RmImm8 => {
                    imm_bits(explicit_imm(instr)?, 8, sink);
                }
                _ => {}
            }
        }

        OpcodeForm::OpcodeReg | OpcodeForm::OpcodeRegImm | OpcodeForm::OpcodeRegImm64 => {
            let reg_enc = native_enc(instr.ops[0].reg().ok_or(EncodeError::BadForm)?)?;
            rex.b = reg_enc;
            rex.force_if_8bit(width, reg_enc);
            if matches!(instr.form, OpcodeForm::OpcodeRegImm64) {
                rex.w = true;
            }
            rex.emit(sink);
            if escape {
                sink.put1(0x0F);
            }
            sink.put1(opcode_byte | (reg_enc & 7));
            match instr.form {
                OpcodeForm::OpcodeRegImm => {
                    imm_bits(explicit_imm(instr)?, width, sink);
                }
                OpcodeForm::OpcodeRegImm64 => {
                    imm_bits(explicit_imm(instr)?, 64, sink);
                }
                _ => {}
            }
        }

        OpcodeForm::AccImm => {
            rex.emit(sink);
            if escape {
                sink.put1(0x0F);
            }
            sink.put1(opcode_byte);
            imm_bits(explicit_imm(instr)?, width.min(32), sink);
        }

        OpcodeForm::Imm8 | OpcodeForm::Imm16 | OpcodeForm::Imm32 => {
            rex.emit(sink);
            if escape {
                sink.put1(0x0F);
            }
            sink.put1(opcode_byte);
            let bits = match instr.form {
                OpcodeForm::Imm8 => 8,
                OpcodeForm::Imm16 => 16,
                _ => 32,
            };
            imm_bits(explicit_imm(instr)?, bits, sink);
        }

        OpcodeForm::Rel8 | OpcodeForm::Rel32 => {
            rex.emit(sink);
            if escape {
                sink.put1(0x0F);
            }
            sink.put1(opcode_byte);
            let rel_size = if matches!(instr.form, OpcodeForm::Rel8) {
                1
            } else {
                4
            };
            let len = (sink.offset() - start) + rel_size;

            let target: Option<CachePc> = match instr.ops.first().map(|op| op.kind) {
                Some(OperandKind::BranchPc(target)) => Some(target),
                Some(OperandKind::BranchLabel(label)) => labels.label_pc(label),
                _ => return Err(EncodeError::BadForm),
            };

            match pc {
                Option::None => {
                    // Staged: sizes only, displacement left blank.
                    if rel_size == 1 {
                        sink.put1(0);
                    } else {
                        sink.put4(0);
                    }
                }
                Some(pc) => {
                    let target = target.ok_or(EncodeError::UnresolvedBranch)?;
                    let next = pc.wrapping_add(len as u64);
                    let disp = target.wrapping_sub(next) as i64;
                    if rel_size == 1 {
                        let disp =
                            i8::try_from(disp).map_err(|_| EncodeError::DisplacementOverflow)?;
                        sink.put1(disp as u8);
                    } else {
                        let disp =
                            i32::try_from(disp).map_err(|_| EncodeError::DisplacementOverflow)?;
                        sink.put4(disp as u32);
                    }
                }
            }
        }
    }

    debug_assert!(sink.offset() - start <= crate::MAX_INSTRUCTION_BYTES);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder;
    use crate::decode::decode_next;
    use crate::operand::OperandAction;
    use crate::reg::Gpr;

    fn roundtrip(bytes: &[u8]) {
        let (instr, next) = decode_next(bytes, 0x1000).expect("decodes");
        assert_eq!(next - 0x1000, bytes.len() as u64, "consumed length");
        let mut sink = VecSink::default();
        encode(&instr, &mut sink, 0x1000, &()).expect("encodes");
        assert_eq!(sink.bytes, bytes, "canonical re-encode of {instr}");
    }

    #[test]
    fn decode_encode_roundtrip() {
        // A corpus of common integer instructions; every sequence must
        // re-encode to itself.
        let corpus: &[&[u8]] = &[
            &[0x48, 0x89, 0xD8],                               // mov rax, rbx
            &[0x89, 0xD8],                                     // mov eax, ebx
            &[0x48, 0x8B, 0x04, 0x24],                         // mov rax, [rsp]
            &[0x48, 0x8B, 0x45, 0x08],                         // mov rax, [rbp+8]
            &[0x48, 0x89, 0x44, 0x24, 0x10],                   // mov [rsp+0x10], rax
            &[0x4C, 0x8B, 0x6C, 0xC8, 0x78],                   // mov r13, [rax+rcx*8+0x78]
            &[0x48, 0x8D, 0x04, 0x1E],                         // lea rax, [rsi+rbx]
            &[0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11], // mov rax, imm64
            &[0x55],                                           // push rbp
            &[0x41, 0x57],                                     // push r15
            &[0x5D],                                           // pop rbp
            &[0x48, 0x83, 0xC0, 0x7F],                         // add rax, 0x7f
            &[0x48, 0x81, 0xC4, 0x00, 0x01, 0x00, 0x00],       // add rsp, 0x100
            &[0x48, 0x01, 0xD8],                               // add rax, rbx
            &[0x48, 0x29, 0xC8],                               // sub rax, rcx
            &[0x48, 0x31, 0xC0],                               // xor rax, rax
            &[0x48, 0x85, 0xC0],                               // test rax, rax
            &[0x48, 0x39, 0xD9],                               // cmp rcx, rbx
            &[0x48, 0x87, 0xD8],                               // xchg rax, rbx
            &[0x48, 0xFF, 0xC0],                               // inc rax
            &[0x48, 0xF7, 0xD8],                               // neg rax
            &[0x48, 0xC1, 0xE0, 0x04],                         // shl rax, 4
            &[0x74, 0x05],                                     // jz +5
            &[0x0F, 0x84, 0x00, 0x01, 0x00, 0x00],             // jz rel32
            &[0xEB, 0xFE],                                     // jmp self
            &[0xE9, 0x00, 0x02, 0x00, 0x00],                   // jmp rel32
            &[0xE8, 0x10, 0x00, 0x00, 0x00],                   // call rel32
            &[0xFF, 0xE0],                                     // jmp rax
            &[0xFF, 0xD0],                                     // call rax
            &[0xFF, 0x20],                                     // jmp [rax]
            &[0xC3],                                           // ret
            &[0xC2, 0x08, 0x00],                               // ret 8
            &[0xE2, 0xFC],                                     // loop -4
            &[0xE3, 0x10],                                     // jrcxz +0x10
            &[0x0F, 0x0B],                                     // ud2
            &[0x9F],                                           // lahf
            &[0x9E],                                           // sahf
            &[0x0F, 0x90, 0xC0],                               // seto al
            &[0x80, 0xC0, 0x7F],                               // add al, 0x7f
            &[0x90],                                           // nop
            &[0xCC],                                           // int3
            &[0x0F, 0x05],                                     // syscall
            &[0x65, 0x48, 0x8B, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00], // mov rax, gs:[0x28]
        ];
        for bytes in corpus {
            roundtrip(bytes);
        }
    }

    #[test]
    fn mov_rax_rbx_shape() {
        // 48 89 D8 decodes to a two-operand register MOV with no flag
        // effects and a three-byte length.
        let (instr, next) = decode_next(&[0x48, 0x89, 0xD8], 0x4000).unwrap();
        assert_eq!(next, 0x4003);
        assert_eq!(instr.decoded_len, 3);
        assert_eq!(instr.category(), crate::Category::Other);
        assert!(instr.flag_effects().read.is_empty());
        assert!(instr.flag_effects().written.is_empty());
        assert_eq!(instr.ops.len(), 2);
        assert_eq!(instr.ops[0].reg().unwrap().gpr(), Gpr::Rax);
        assert_eq!(instr.ops[0].action, OperandAction::Write);
        assert!(instr.ops[0].is_explicit);
        assert_eq!(instr.ops[1].reg().unwrap().gpr(), Gpr::Rbx);
        assert_eq!(instr.ops[1].action, OperandAction::Read);
        assert_eq!(instr.ops[0].width, 64);
        assert_eq!(instr.ops[1].width, 64);
    }

    #[test]
    fn jz_short_shape() {
        // 74 05 is a conditional jump reading only ZF, targeting pc+2+5.
        let (instr, next) = decode_next(&[0x74, 0x05], 0x2000).unwrap();
        assert_eq!(next, 0x2002);
        assert_eq!(instr.category(), crate::Category::CondJump);
        assert_eq!(instr.flag_effects().read, crate::Rflags::ZF);
        assert!(instr.flag_effects().written.is_empty());
        assert_eq!(instr.branch_target_pc(), Some(0x2007));
    }

    #[test]
    fn truncated_and_invalid() {
        assert!(matches!(
            decode_next(&[0x48], 0x100),
            Err(DecodeError::Truncated { pc: 0x100 })
        ));
        assert!(matches!(
            decode_next(&[0x0F, 0xFF, 0x00], 0x100),
            Err(DecodeError::InvalidOpcode { .. })
        ));
        // High-byte register forms are rejected, not misdecoded.
        assert!(matches!(
            decode_next(&[0x88, 0xE0], 0x100), // mov al, ah
            Err(DecodeError::InvalidOpcode { .. })
        ));
    }

    use crate::decode::DecodeError;

    #[test]
    fn staged_matches_commit() {
        let instrs = vec![
            builder::mov_reg_reg(
                VirtualRegister::native(Gpr::Rcx),
                VirtualRegister::native(Gpr::R9),
            ),
            builder::push_reg(VirtualRegister::native(Gpr::R12)),
            builder::jmp_rel(0x10),
            builder::lea(
                VirtualRegister::native(Gpr::Rax),
                MemExpr::base_disp(VirtualRegister::native(Gpr::Rsp), 8),
            ),
            builder::ud2(),
            builder::mov_reg_imm64(VirtualRegister::native(Gpr::R11), 0x1122_3344_5566_7788),
        ];
        for instr in &instrs {
            let mut sink = VecSink::default();
            encode(instr, &mut sink, 0, &()).unwrap();
            assert_eq!(staged_len(instr).unwrap(), sink.bytes.len(), "{instr}");
        }
    }

    #[test]
    fn slot_operands_lower_to_gs() {
        // A register-to-slot save becomes a GS-relative store.
        let save = builder::mov_mem_reg(slot_mem(2), VirtualRegister::native(Gpr::Rbx));
        let mut direct = VecSink::default();
        encode(&save, &mut direct, 0, &()).unwrap();

        let mut via_slot_reg = VecSink::default();
        let mut instr = builder::mov_reg_reg(
            VirtualRegister::native(Gpr::Rbx), // placeholder dst, replaced below
            VirtualRegister::native(Gpr::Rbx),
        );
        instr.ops[0].kind = OperandKind::Reg(VirtualRegister::slot(2));
        encode(&instr, &mut via_slot_reg, 0, &()).unwrap();
        assert_eq!(via_slot_reg.bytes, direct.bytes);
        assert_eq!(via_slot_reg.bytes[0], 0x65, "gs prefix");
    }

    #[test]
    fn unresolved_label_is_fatal_at_commit() {
        let instr = builder::jmp_label(Label(7));
        assert!(staged_len(&instr).is_ok());
        let mut sink = VecSink::default();
        assert_eq!(
            encode(&instr, &mut sink, 0, &()),
            Err(EncodeError::UnresolvedBranch)
        );
    }
}
