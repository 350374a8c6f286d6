//! Machine bytes to typed instructions.
//!
//! The decoder understands the integer subset of the 64-bit ISA that the
//! translation pipeline rewrites: data moves, stack operations, the ALU
//! groups, shifts, tests, every conditional jump, direct and indirect
//! JMP/CALL/RET, the LOOP family, SETcc, LAHF/SAHF, UD2, NOP (including the
//! multi-byte `0F 1F` form), INT3 and SYSCALL. Anything else — including the
//! legacy high-byte register forms (AH..BH without REX) and 32-bit address
//! overrides — decodes to `DecodeError::InvalidOpcode`, which callers treat
//! as a hard wall that ends the current block.

use crate::inst::{Cc, Instruction, Opcode, OpcodeForm, Prefixes};
use crate::operand::{Imm, MemExpr, Operand, OperandAction, OperandKind, Scale, Segment};
use crate::reg::{Gpr, VirtualRegister};
use crate::tables::OpcodeTables;
use crate::{AppPc, MAX_INSTRUCTION_BYTES};

/// Why a byte sequence failed to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes at `pc` are not an instruction this decoder recognises.
    #[error("unrecognised instruction bytes at {pc:#x} (opcode {opcode:#04x})")]
    InvalidOpcode {
        /// Start of the failing instruction.
        pc: AppPc,
        /// The primary opcode byte.
        opcode: u8,
    },
    /// The byte window ended in the middle of an instruction.
    #[error("instruction at {pc:#x} truncated by the end of readable memory")]
    Truncated {
        /// Start of the failing instruction.
        pc: AppPc,
    },
}

#[derive(Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    pc: AppPc,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::Truncated { pc: self.pc })?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from(self.u8()?) | (u16::from(self.u8()?) << 8))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from(self.u16()?) | (u32::from(self.u16()?) << 16))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from(self.u32()?) | (u64::from(self.u32()?) << 32))
    }
}

/// The register-or-memory half of a ModRM byte.
enum Rm {
    Reg(u8),
    Mem(MemExpr),
}

/// A decoded ModRM (+ optional SIB/displacement) sequence.
struct ModRm {
    reg_field: u8,
    rm: Rm,
    /// Set when the memory operand is RIP-relative; the displacement must be
    /// rebased against the end of the instruction once its length is known.
    rip_disp: Option<i32>,
}

fn gpr_reg(enc: u8, width_bits: u16) -> VirtualRegister {
    VirtualRegister::native_with_width(Gpr::from_enc(enc), (width_bits / 8) as u8)
}

fn decode_modrm(cur: &mut Cursor, rex: Rex, segment: Segment) -> Result<ModRm, DecodeError> {
    let modrm = cur.u8()?;
    let m0d = modrm >> 6;
    let reg_field = ((modrm >> 3) & 7) | (u8::from(rex.r) << 3);
    let rm_low = modrm & 7;

    if m0d == 0b11 {
        return Ok(ModRm {
            reg_field,
            rm: Rm::Reg(rm_low | (u8::from(rex.b) << 3)),
            rip_disp: None,
        });
    }

    // RIP-relative: mod=00, rm=101, no SIB.
    if m0d == 0b00 && rm_low == 0b101 {
        let disp = cur.i32()?;
        return Ok(ModRm {
            reg_field,
            rm: Rm::Mem(MemExpr::Absolute {
                addr: disp as i64 as u64,
                segment,
            }),
            rip_disp: Some(disp),
        });
    }

    let (base_enc, index) = if rm_low == 0b100 {
        let sib = cur.u8()?;
        let scale = Scale::from_enc(sib >> 6);
        let index_enc = ((sib >> 3) & 7) | (u8::from(rex.x) << 3);
        let base_enc = (sib & 7) | (u8::from(rex.b) << 3);
        // An index encoding of RSP means "no index".
        let index = if index_enc == Gpr::Rsp.enc() {
            None
        } else {
            Some((gpr_reg(index_enc, 64), scale))
        };
        // SIB base of rbp/r13 with mod=00 means disp32-only.
        if m0d == 0b00 && (sib & 7) == 0b101 {
            let disp = cur.i32()?;
            let (index_reg, scale) = match index {
                Some((r, s)) => (Some(r), s),
                None => (None, Scale::One),
            };
            return Ok(ModRm {
                reg_field,
                rm: Rm::Mem(MemExpr::Compound {
                    base: None,
                    index: index_reg,
                    scale,
                    disp,
                    segment,
                }),
                rip_disp: None,
            });
        }
        (base_enc, index)
    } else {
        (rm_low | (u8::from(rex.b) << 3), None)
    };

    let disp = match m0d {
        0b00 => 0,
        0b01 => i32::from(cur.i8()?),
        0b10 => cur.i32()?,
        _ => unreachable!(),
    };

    let (index_reg, scale) = match index {
        Some((r, s)) => (Some(r), s),
        None => (None, Scale::One),
    };
    Ok(ModRm {
        reg_field,
        rm: Rm::Mem(MemExpr::Compound {
            base: Some(gpr_reg(base_enc, 64)),
            index: index_reg,
            scale,
            disp,
            segment,
        }),
        rip_disp: None,
    })
}

/// Legacy 8-bit register encodings 4..=7 without a REX prefix name the
/// high-byte registers, which this model does not represent.
fn check_byte_reg(enc: u8, has_rex: bool, pc: AppPc, opcode: u8) -> Result<(), DecodeError> {
    if !has_rex && (4..=7).contains(&enc) {
        Err(DecodeError::InvalidOpcode { pc, opcode })
    } else {
        Ok(())
    }
}

struct DecodeState<'a> {
    cur: Cursor<'a>,
    pc: AppPc,
    rex: Rex,
    has_rex: bool,
    prefixes: Prefixes,
    opsize16: bool,
    opcode_byte: u8,
    /// Set when a ModRM decode produced a RIP-relative operand; the parked
    /// displacement is rebased once the instruction length is known.
    rip_rel: bool,
}

impl DecodeState<'_> {
    fn width(&self) -> u16 {
        if self.rex.w {
            64
        } else if self.opsize16 {
            16
        } else {
            32
        }
    }

    fn invalid(&self) -> DecodeError {
        DecodeError::InvalidOpcode {
            pc: self.pc,
            opcode: self.opcode_byte,
        }
    }

    fn imm_of_width(&mut self, width: u16) -> Result<Imm, DecodeError> {
        Ok(match width {
            8 => Imm::signed(i64::from(self.cur.i8()?)),
            16 => Imm::signed(i64::from(self.cur.u16()? as i16)),
            _ => Imm::signed(i64::from(self.cur.i32()?)),
        })
    }

    fn rm_operand(&mut self, rm: Rm, action: OperandAction, width: u16) -> Result<Operand, DecodeError> {
        Ok(match rm {
            Rm::Reg(enc) => {
                if width == 8 {
                    check_byte_reg(enc, self.has_rex, self.pc, self.opcode_byte)?;
                }
                Operand::explicit(OperandKind::Reg(gpr_reg(enc, width)), action, width)
            }
            Rm::Mem(mem) => Operand::explicit(OperandKind::Mem(mem), action, width),
        })
    }

    fn reg_operand(&mut self, enc: u8, action: OperandAction, width: u16) -> Result<Operand, DecodeError> {
        if width == 8 {
            check_byte_reg(enc, self.has_rex, self.pc, self.opcode_byte)?;
        }
        Ok(Operand::explicit(
            OperandKind::Reg(gpr_reg(enc, width)),
            action,
            width,
        ))
    }
}

const GROUP1_ALU: [Opcode; 8] = [
    Opcode::Add,
    Opcode::Or,
    Opcode::Adc,
    Opcode::Sbb,
    Opcode::And,
    Opcode::Sub,
    Opcode::Xor,
    Opcode::Cmp,
];

fn alu_dst_action(op: Opcode) -> OperandAction {
    match op {
        Opcode::Cmp | Opcode::Test => OperandAction::Read,
        _ => OperandAction::ReadWrite,
    }
}

/// Decode one instruction at `pc` from `bytes` (the readable window starting
/// at `pc`) and return it along with the PC of the next instruction.
pub fn decode_next(bytes: &[u8], pc: AppPc) -> Result<(Instruction, AppPc), DecodeError> {
    let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_BYTES)];
    let mut st = DecodeState {
        cur: Cursor {
            bytes: window,
            pos: 0,
            pc,
        },
        pc,
        rex: Rex::default(),
        has_rex: false,
        prefixes: Prefixes::default(),
        opsize16: false,
        opcode_byte: 0,
        rip_rel: false,
    };

    // Legacy prefixes, in any order.
    let mut byte;
    loop {
        byte = st.cur.u8()?;
        match byte {
            0xF0 => st.prefixes.lock = true,
            0xF3 => st.prefixes.rep = true,
            0xF2 => st.prefixes.repne = true,
            0x66 => st.opsize16 = true,
            0x2E => st.prefixes.segment = Segment::Cs,
            0x36 => st.prefixes.segment = Segment::Ss,
            0x3E => st.prefixes.segment = Segment::Ds,
            0x26 => st.prefixes.segment = Segment::Es,
            0x64 => st.prefixes.segment = Segment::Fs,
            0x65 => st.prefixes.segment = Segment::Gs,
            // 32-bit address override: unsupported.
            0x67 => {
                return Err(DecodeError::InvalidOpcode { pc, opcode: byte });
            }
            _ => break,
        }
    }

    // REX must immediately precede the opcode.
    if (0x40..=0x4F).contains(&byte) {
        st.has_rex = true;
        st.rex = Rex {
            w: byte & 8 != 0,
            r: byte & 4 != 0,
            x: byte & 2 != 0,
            b: byte & 1 != 0,
        };
        byte = st.cur.u8()?;
    }
    st.opcode_byte = byte;

    let mut instr = decode_opcode(&mut st, byte)?;

    instr.prefixes = st.prefixes;
    instr.decoded_pc = Some(pc);
    instr.decoded_len = st.cur.pos as u8;
    let next_pc = pc + st.cur.pos as u64;

    // Append the implicit-operand template for this opcode class.
    for op in OpcodeTables::get().implicit_ops(instr.opcode) {
        instr.push_op(*op);
    }

    Ok((instr, next_pc))
}

fn decode_opcode(st: &mut DecodeState, byte: u8) -> Result<Instruction, DecodeError> {
    let mut instr = match byte {
        // The eight ALU groups share an opcode layout: the class lives in
        // bits 3..=5, the form in the low three bits.
        0x00..=0x3D if (byte & 7) <= 5 => {
            let alu = GROUP1_ALU[usize::from((byte >> 3) & 7)];
            let low = byte & 7;
            let width = if low == 0 || low == 2 || low == 4 {
                8
            } else {
                st.width()
            };
            let mut instr = Instruction::new(
                alu,
                match low {
                    0 | 1 => OpcodeForm::RmR,
                    2 | 3 => OpcodeForm::RRm,
                    _ => OpcodeForm::AccImm,
                },
                width,
            );
            match low {
                0 | 1 => {
                    let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
                    st.rip_rel |= m.rip_disp.is_some();
                    let rm = st.rm_operand(m.rm, alu_dst_action(alu), width)?;
                    let reg = st.reg_operand(m.reg_field, OperandAction::Read, width)?;
                    instr.push_op(rm);
                    instr.push_op(reg);
                }
                2 | 3 => {
                    let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
                    st.rip_rel |= m.rip_disp.is_some();
                    let reg = st.reg_operand(m.reg_field, alu_dst_action(alu), width)?;
                    let rm = st.rm_operand(m.rm, OperandAction::Read, width)?;
                    instr.push_op(reg);
                    instr.push_op(rm);
                }
                _ => {
                    let acc = st.reg_operand(Gpr::Rax.enc(), alu_dst_action(alu), width)?;
                    let imm = st.imm_of_width(width.min(32))?;
                    instr.push_op(acc);
                    instr.push_op(Operand::explicit(
                        OperandKind::Imm(imm),
                        OperandAction::Read,
                        width.min(32),
                    ));
                }
            }
            instr
        }

        0x50..=0x57 | 0x58..=0x5F => {
            let is_push = byte < 0x58;
            let enc = (byte & 7) | (u8::from(st.rex.b) << 3);
            let opcode = if is_push { Opcode::Push } else { Opcode::Pop };
            let mut instr = Instruction::new(opcode, OpcodeForm::OpcodeReg, 64);
            let action = if is_push {
                OperandAction::Read
            } else {
                OperandAction::Write
            };
            instr.push_op(st.reg_operand(enc, action, 64)?);
            instr
        }

        0x68 | 0x6A => {
            let (form, width) = if byte == 0x68 {
                (OpcodeForm::Imm32, 32)
            } else {
                (OpcodeForm::Imm8, 8)
            };
            let imm = st.imm_of_width(width)?;
            let mut instr = Instruction::new(Opcode::Push, form, 64);
            instr.push_op(Operand::explicit(
                OperandKind::Imm(imm),
                OperandAction::Read,
                width,
            ));
            instr
        }

        0x70..=0x7F => {
            let cc = Cc::from_enc(byte & 0xF);
            let disp = i64::from(st.cur.i8()?);
            branch_instr(Opcode::Jcc(cc), OpcodeForm::Rel8, st, disp)
        }

        0x80 | 0x81 | 0x83 => {
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            let alu = GROUP1_ALU[usize::from(m.reg_field & 7)];
            let (width, form, imm_width) = match byte {
                0x80 => (8, OpcodeForm::RmImm8, 8),
                0x81 => (st.width(), OpcodeForm::RmImm, st.width().min(32)),
                _ => (st.width(), OpcodeForm::RmImm8, 8),
            };
            let mut instr = Instruction::new(alu, form, width);
            st.rip_rel |= m.rip_disp.is_some();
            let rm = st.rm_operand(m.rm, alu_dst_action(alu), width)?;
            let imm = st.imm_of_width(imm_width)?;
            instr.push_op(rm);
            instr.push_op(Operand::explicit(
                OperandKind::Imm(imm),
                OperandAction::Read,
                imm_width,
            ));
            instr
        }

        0x84 | 0x85 | 0x86 | 0x87 => {
            let (opcode, action) = if byte <= 0x85 {
                (Opcode::Test, OperandAction::Read)
            } else {
                (Opcode::Xchg, OperandAction::ReadWrite)
            };
            let width = if byte & 1 == 0 { 8 } else { st.width() };
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            let mut instr = Instruction::new(opcode, OpcodeForm::RmR, width);
            st.rip_rel |= m.rip_disp.is_some();
            let rm = st.rm_operand(m.rm, action, width)?;
            let reg = st.reg_operand(m.reg_field, action, width)?;
            instr.push_op(rm);
            instr.push_op(reg);
            instr
        }

        0x88..=0x8B => {
            let width = if byte & 1 == 0 { 8 } else { st.width() };
            let to_reg = byte >= 0x8A;
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            let form = if to_reg { OpcodeForm::RRm } else { OpcodeForm::RmR };
            let mut instr = Instruction::new(Opcode::Mov, form, width);
            st.rip_rel |= m.rip_disp.is_some();
            if to_reg {
                let reg = st.reg_operand(m.reg_field, OperandAction::Write, width)?;
                let rm = st.rm_operand(m.rm, OperandAction::Read, width)?;
                instr.push_op(reg);
                instr.push_op(rm);
            } else {
                let rm = st.rm_operand(m.rm, OperandAction::Write, width)?;
                let reg = st.reg_operand(m.reg_field, OperandAction::Read, width)?;
                instr.push_op(rm);
                instr.push_op(reg);
            }
            instr
        }

        0x8D => {
            let width = st.width();
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            let mem = match m.rm {
                Rm::Mem(mem) => mem,
                Rm::Reg(_) => return Err(st.invalid()),
            };
            let mut instr = Instruction::new(Opcode::Lea, OpcodeForm::RRm, width);
            if m.rip_disp.is_some() {
                st.rip_rel = true;
            }
            instr.push_op(st.reg_operand(m.reg_field, OperandAction::Write, width)?);
            instr.push_op(Operand::explicit(
                OperandKind::EffectiveAddress(mem),
                OperandAction::Read,
                crate::ADDRESS_WIDTH_BITS,
            ));
            instr
        }

        0x8F => {
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            if m.reg_field & 7 != 0 {
                return Err(st.invalid());
            }
            let mut instr = Instruction::new(Opcode::Pop, OpcodeForm::Rm, 64);
            st.rip_rel |= m.rip_disp.is_some();
            let rm = st.rm_operand(m.rm, OperandAction::Write, 64)?;
            instr.push_op(rm);
            instr
        }

        0x90 => Instruction::new(Opcode::Nop, OpcodeForm::None, st.width()),

        0x9E => Instruction::new(Opcode::Sahf, OpcodeForm::None, 8),
        0x9F => Instruction::new(Opcode::Lahf, OpcodeForm::None, 8),

        0xA8 | 0xA9 => {
            let width = if byte == 0xA8 { 8 } else { st.width() };
            let mut instr = Instruction::new(Opcode::Test, OpcodeForm::AccImm, width);
            let acc = st.reg_operand(Gpr::Rax.enc(), OperandAction::Read, width)?;
            let imm = st.imm_of_width(width.min(32))?;
            instr.push_op(acc);
            instr.push_op(Operand::explicit(
                OperandKind::Imm(imm),
                OperandAction::Read,
                width.min(32),
            ));
            instr
        }

        0xB0..=0xB7 => {
            let enc = (byte & 7) | (u8::from(st.rex.b) << 3);
            let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::OpcodeRegImm, 8);
            instr.push_op(st.reg_operand(enc, OperandAction::Write, 8)?);
            let imm = st.imm_of_width(8)?;
            instr.push_op(Operand::explicit(
                OperandKind::Imm(imm),
                OperandAction::Read,
                8,
            ));
            instr
        }

        0xB8..=0xBF => {
            let enc = (byte & 7) | (u8::from(st.rex.b) << 3);
            if st.rex.w {
                let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::OpcodeRegImm64, 64);
                instr.push_op(st.reg_operand(enc, OperandAction::Write, 64)?);
                let value = st.cur.u64()?;
                instr.push_op(Operand::explicit(
                    OperandKind::Imm(Imm::unsigned(value)),
                    OperandAction::Read,
                    64,
                ));
                instr
            } else {
                let width = st.width();
                let mut instr = Instruction::new(Opcode::Mov, OpcodeForm::OpcodeRegImm, width);
                instr.push_op(st.reg_operand(enc, OperandAction::Write, width)?);
                let imm = st.imm_of_width(width)?;
                instr.push_op(Operand::explicit(
                    OperandKind::Imm(imm),
                    OperandAction::Read,
                    width,
                ));
                instr
            }
        }

        0xC0 | 0xC1 => {
            let width = if byte == 0xC0 { 8 } else { st.width() };
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            let opcode = match m.reg_field & 7 {
                4 => Opcode::Shl,
                5 => Opcode::Shr,
                7 => Opcode::Sar,
                _ => return Err(st.invalid()),
            };
            let mut instr = Instruction::new(opcode, OpcodeForm::RmImm8, width);
            st.rip_rel |= m.rip_disp.is_some();
            let rm = st.rm_operand(m.rm, OperandAction::ReadWrite, width)?;
            let imm = st.imm_of_width(8)?;
            instr.push_op(rm);
            instr.push_op(Operand::explicit(
                OperandKind::Imm(imm),
                OperandAction::Read,
                8,
            ));
            instr
        }

        0xC2 => {
            let imm = st.imm_of_width(16)?;
            let mut instr = Instruction::new(Opcode::Ret, OpcodeForm::Imm16, 64);
            instr.push_op(Operand::explicit(
                OperandKind::Imm(imm),
                OperandAction::Read,
                16,
            ));
            instr
        }
        0xC3 => Instruction::new(Opcode::Ret, OpcodeForm::None, 64),

        0xC6 | 0xC7 => {
            let width = if byte == 0xC6 { 8 } else { st.width() };
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            if m.reg_field & 7 != 0 {
                return Err(st.invalid());
            }
            let imm_width = width.min(32);
            let form = if width == 8 {
                OpcodeForm::RmImm8
            } else {
                OpcodeForm::RmImm
            };
            let mut instr = Instruction::new(Opcode::Mov, form, width);
            st.rip_rel |= m.rip_disp.is_some();
            let rm = st.rm_operand(m.rm, OperandAction::Write, width)?;
            let imm = st.imm_of_width(imm_width)?;
            instr.push_op(rm);
            instr.push_op(Operand::explicit(
                OperandKind::Imm(imm),
                OperandAction::Read,
                imm_width,
            ));
            instr
        }

        0xCC => Instruction::new(Opcode::Int3, OpcodeForm::None, 64),

        0xD3 => {
            let width = st.width();
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            let opcode = match m.reg_field & 7 {
                4 => Opcode::Shl,
                5 => Opcode::Shr,
                7 => Opcode::Sar,
                _ => return Err(st.invalid()),
            };
            let mut instr = Instruction::new(opcode, OpcodeForm::Rm, width);
            st.rip_rel |= m.rip_disp.is_some();
            let rm = st.rm_operand(m.rm, OperandAction::ReadWrite, width)?;
            instr.push_op(rm);
            // Shift count in CL: an implicit operand of this form only.
            instr.push_op(Operand::implicit(
                OperandKind::Reg(VirtualRegister::native_with_width(Gpr::Rcx, 1)),
                OperandAction::Read,
                8,
            ));
            instr
        }

        0xE0..=0xE3 => {
            let opcode = match byte {
                0xE0 => Opcode::Loopne,
                0xE1 => Opcode::Loope,
                0xE2 => Opcode::Loop,
                _ => Opcode::Jrcxz,
            };
            let disp = i64::from(st.cur.i8()?);
            branch_instr(opcode, OpcodeForm::Rel8, st, disp)
        }

        0xE8 => {
            let disp = i64::from(st.cur.i32()?);
            branch_instr(Opcode::Call, OpcodeForm::Rel32, st, disp)
        }
        0xE9 => {
            let disp = i64::from(st.cur.i32()?);
            branch_instr(Opcode::Jmp, OpcodeForm::Rel32, st, disp)
        }
        0xEB => {
            let disp = i64::from(st.cur.i8()?);
            branch_instr(Opcode::Jmp, OpcodeForm::Rel8, st, disp)
        }

        0xF6 | 0xF7 => {
            let width = if byte == 0xF6 { 8 } else { st.width() };
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            match m.reg_field & 7 {
                0 => {
                    let imm_width = width.min(32);
                    let form = if width == 8 {
                        OpcodeForm::RmImm8
                    } else {
                        OpcodeForm::RmImm
                    };
                    let mut instr = Instruction::new(Opcode::Test, form, width);
                    st.rip_rel |= m.rip_disp.is_some();
                    let rm = st.rm_operand(m.rm, OperandAction::Read, width)?;
                    let imm = st.imm_of_width(imm_width)?;
                    instr.push_op(rm);
                    instr.push_op(Operand::explicit(
                        OperandKind::Imm(imm),
                        OperandAction::Read,
                        imm_width,
                    ));
                    instr
                }
                2 | 3 => {
                    let opcode = if m.reg_field & 7 == 2 {
                        Opcode::Not
                    } else {
                        Opcode::Neg
                    };
                    let mut instr = Instruction::new(opcode, OpcodeForm::Rm, width);
                    st.rip_rel |= m.rip_disp.is_some();
                    let rm = st.rm_operand(m.rm, OperandAction::ReadWrite, width)?;
                    instr.push_op(rm);
                    instr
                }
                _ => return Err(st.invalid()),
            }
        }

        0xFE | 0xFF => {
            let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
            let ext = m.reg_field & 7;
            if byte == 0xFE {
                let opcode = match ext {
                    0 => Opcode::Inc,
                    1 => Opcode::Dec,
                    _ => return Err(st.invalid()),
                };
                let mut instr = Instruction::new(opcode, OpcodeForm::Rm, 8);
                st.rip_rel |= m.rip_disp.is_some();
                let rm = st.rm_operand(m.rm, OperandAction::ReadWrite, 8)?;
                instr.push_op(rm);
                instr
            } else {
                match ext {
                    0 | 1 => {
                        let opcode = if ext == 0 { Opcode::Inc } else { Opcode::Dec };
                        let width = st.width();
                        let mut instr = Instruction::new(opcode, OpcodeForm::Rm, width);
                        st.rip_rel |= m.rip_disp.is_some();
                        let rm = st.rm_operand(m.rm, OperandAction::ReadWrite, width)?;
                        instr.push_op(rm);
                        instr
                    }
                    2 | 4 | 6 => {
                        let opcode = match ext {
                            2 => Opcode::Call,
                            4 => Opcode::Jmp,
                            _ => Opcode::Push,
                        };
                        let mut instr = Instruction::new(opcode, OpcodeForm::Rm, 64);
                        st.rip_rel |= m.rip_disp.is_some();
                        let rm = st.rm_operand(m.rm, OperandAction::Read, 64)?;
                        instr.push_op(rm);
                        instr
                    }
                    _ => return Err(st.invalid()),
                }
            }
        }

        0x0F => {
            let second = st.cur.u8()?;
            st.opcode_byte = second;
            match second {
                0x05 => Instruction::new(Opcode::Syscall, OpcodeForm::None, 64),
                0x0B => Instruction::new(Opcode::Ud2, OpcodeForm::None, 64),
                0x1F => {
                    let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
                    let mut instr = Instruction::new(Opcode::Nop, OpcodeForm::Rm, st.width());
                    st.rip_rel |= m.rip_disp.is_some();
                    let rm = st.rm_operand(m.rm, OperandAction::Read, st.width())?;
                    instr.push_op(rm);
                    instr
                }
                0x80..=0x8F => {
                    let cc = Cc::from_enc(second & 0xF);
                    let disp = i64::from(st.cur.i32()?);
                    branch_instr(Opcode::Jcc(cc), OpcodeForm::Rel32, st, disp)
                }
                0x90..=0x9F => {
                    let cc = Cc::from_enc(second & 0xF);
                    let m = decode_modrm(&mut st.cur, st.rex, st.prefixes.segment)?;
                    let mut instr = Instruction::new(Opcode::Setcc(cc), OpcodeForm::Rm, 8);
                    st.rip_rel |= m.rip_disp.is_some();
                    let rm = st.rm_operand(m.rm, OperandAction::Write, 8)?;
                    instr.push_op(rm);
                    instr
                }
                _ => return Err(st.invalid()),
            }
        }

        _ => return Err(st.invalid()),
    };

    // Branch targets and RIP-relative displacements are relative to the end
    // of the instruction, which was unknown while operands were still being
    // pulled off the cursor; rebase the parked displacements now.
    let next_pc = st.pc + st.cur.pos as u64;
    if matches!(instr.form, OpcodeForm::Rel8 | OpcodeForm::Rel32) {
        if let Some(OperandKind::BranchPc(disp)) = instr.ops.first().map(|op| op.kind) {
            instr.ops[0].kind = OperandKind::BranchPc(next_pc.wrapping_add(disp));
        }
    }
    if st.rip_rel {
        for op in &mut instr.ops {
            match &mut op.kind {
                OperandKind::Mem(MemExpr::Absolute { addr, .. })
                | OperandKind::EffectiveAddress(MemExpr::Absolute { addr, .. }) => {
                    *addr = next_pc.wrapping_add(*addr);
                }
                _ => {}
            }
        }
    }

    Ok(instr)
}

fn branch_instr(opcode: Opcode, form: OpcodeForm, st: &mut DecodeState, disp: i64) -> Instruction {
    let mut instr = Instruction::new(opcode, form, 64);
    // Parked as a raw displacement; rebased once the length is known.
    instr.push_op(Operand::explicit(
        OperandKind::BranchPc(disp as u64),
        OperandAction::Read,
        crate::ADDRESS_WIDTH_BITS,
    ));
    instr.effective_width = if st.opsize16 { 16 } else { 64 };
    instr
}
