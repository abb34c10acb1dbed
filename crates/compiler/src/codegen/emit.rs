//! x86-64 instruction encoding
//!
//! Direct byte emission, no external assembler. Encoders append to a
//! [`CodeBuf`]; operand encoding (REX, ModR/M, SIB, displacement,
//! immediate) is computed from operand kinds. REX prefixes are emitted
//! branchlessly: the prefix byte is always built, and the copy skips it
//! when no extension bit is set.
//!
//! Forward branches go through a fixup list: the jump emits a placeholder
//! rel32, records its site, and label binding patches the displacement.

use crate::strings::StrId;
use std::collections::HashMap;

/// General-purpose registers, encoded 0-15. R8..R15 need REX.B/REX.R.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

impl Gpr {
    pub fn low_bits(self) -> u8 {
        self as u8 & 0x07
    }

    pub fn is_extended(self) -> bool {
        self as u8 >= 8
    }
}

/// XMM registers 0-15; 8-15 need REX prefixes just like the GPRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

impl Xmm {
    pub fn low_bits(self) -> u8 {
        self.0 & 0x07
    }

    pub fn is_extended(self) -> bool {
        self.0 >= 8
    }
}

/// Operand width in bytes. Spills and reloads must use the value's full
/// width: a 4-byte value stored with an 8-byte move would clobber the
/// neighboring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W1,
    W2,
    W4,
    W8,
}

impl Width {
    pub fn bytes(self) -> u64 {
        match self {
            Width::W1 => 1,
            Width::W2 => 2,
            Width::W4 => 4,
            Width::W8 => 8,
        }
    }

    pub fn from_size(size: u64) -> Width {
        match size {
            1 => Width::W1,
            2 => Width::W2,
            4 => Width::W4,
            _ => Width::W8,
        }
    }
}

/// Branch-target placeholder awaiting label resolution.
#[derive(Debug, Clone)]
pub struct Fixup {
    /// Offset of the rel32 field in the buffer.
    pub site: usize,
    pub target: u32,
}

/// Relocation kinds the backend produces; the object writers map them to
/// `R_X86_64_*` / `IMAGE_REL_AMD64_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// PC-relative 32-bit (RIP-relative loads).
    Pc32,
    /// PC-relative call through PLT.
    Plt32,
    Abs64,
    Abs32,
}

#[derive(Debug, Clone)]
pub struct Reloc {
    pub offset: u64,
    pub symbol: StrId,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Byte buffer plus fixups, labels and relocations for one function.
#[derive(Debug, Default)]
pub struct CodeBuf {
    pub bytes: Vec<u8>,
    fixups: Vec<Fixup>,
    labels: HashMap<u32, usize>,
    pub relocs: Vec<Reloc>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn push(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn push32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn push64(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Bind a label here and patch every pending fixup aimed at it.
    pub fn bind_label(&mut self, label: u32) {
        let here = self.bytes.len();
        self.labels.insert(label, here);
        let sites: Vec<usize> = self
            .fixups
            .iter()
            .filter(|f| f.target == label)
            .map(|f| f.site)
            .collect();
        for site in sites {
            let rel = (here as i64 - (site as i64 + 4)) as i32;
            self.bytes[site..site + 4].copy_from_slice(&rel.to_le_bytes());
        }
        self.fixups.retain(|f| f.target != label);
    }

    fn branch_site(&mut self, label: u32) {
        if let Some(&target) = self.labels.get(&label) {
            let rel = (target as i64 - (self.bytes.len() as i64 + 4)) as i32;
            self.push32(rel);
        } else {
            let site = self.bytes.len();
            self.push32(0);
            self.fixups.push(Fixup {
                site,
                target: label,
            });
        }
    }

    pub fn unresolved_fixups(&self) -> usize {
        self.fixups.len()
    }

    /// Finished code and relocations; fixups must all be resolved.
    pub fn into_parts(self) -> (Vec<u8>, Vec<Reloc>) {
        (self.bytes, self.relocs)
    }

    // --------------------------------------------------------
    // REX and ModR/M plumbing
    // --------------------------------------------------------

    /// Emit a REX prefix if any bit is needed; `w` forces 64-bit operands.
    /// Branchless in the original's sense: the byte is always computed and
    /// conditionally skipped.
    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let byte = 0x40u8 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8);
        if byte != 0x40 {
            self.push(byte);
        }
    }

    fn rex_for_width(&mut self, width: Width, r_ext: bool, b_ext: bool) {
        // 16-bit needs the operand-size override, not REX.
        if width == Width::W2 {
            self.push(0x66);
        }
        self.rex(width == Width::W8, r_ext, false, b_ext);
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.push((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// `[base + disp]` addressing with the right disp width; RSP needs a
    /// SIB byte, RBP needs an explicit disp8 even at zero.
    fn mem_operand(&mut self, reg_field: u8, base: Gpr, disp: i32) {
        let needs_sib = base.low_bits() == 4;
        if disp == 0 && base.low_bits() != 5 {
            self.modrm(0b00, reg_field, base.low_bits());
            if needs_sib {
                self.push(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.modrm(0b01, reg_field, base.low_bits());
            if needs_sib {
                self.push(0x24);
            }
            self.push(disp as u8);
        } else {
            self.modrm(0b10, reg_field, base.low_bits());
            if needs_sib {
                self.push(0x24);
            }
            self.push32(disp);
        }
    }

    // --------------------------------------------------------
    // Stack ops (ported shape: branchless REX.B emission)
    // --------------------------------------------------------

    /// PUSH r64.
    pub fn push_reg(&mut self, reg: Gpr) {
        let opcodes = [0x41u8, 0x50 + reg.low_bits()];
        let start = if reg.is_extended() { 0 } else { 1 };
        self.bytes.extend_from_slice(&opcodes[start..]);
    }

    /// POP r64.
    pub fn pop_reg(&mut self, reg: Gpr) {
        let opcodes = [0x41u8, 0x58 + reg.low_bits()];
        let start = if reg.is_extended() { 0 } else { 1 };
        self.bytes.extend_from_slice(&opcodes[start..]);
    }

    /// CALL r64 (FF /2).
    pub fn call_reg(&mut self, reg: Gpr) {
        if reg.is_extended() {
            self.push(0x41);
        }
        self.push(0xFF);
        self.modrm(0b11, 2, reg.low_bits());
    }

    /// CALL rel32 against an external symbol; emits a relocation.
    pub fn call_symbol(&mut self, symbol: StrId, kind: RelocKind) {
        self.push(0xE8);
        self.relocs.push(Reloc {
            offset: self.bytes.len() as u64,
            symbol,
            kind,
            addend: -4,
        });
        self.push32(0);
    }

    pub fn ret(&mut self) {
        self.push(0xC3);
    }

    // --------------------------------------------------------
    // Moves
    // --------------------------------------------------------

    /// MOV r64, imm64 (or the imm32 forms for narrower widths).
    pub fn mov_reg_imm(&mut self, reg: Gpr, value: i64, width: Width) {
        match width {
            Width::W8 => {
                if let Ok(v32) = i32::try_from(value) {
                    // Sign-extended imm32 form: REX.W C7 /0.
                    self.rex(true, false, false, reg.is_extended());
                    self.push(0xC7);
                    self.modrm(0b11, 0, reg.low_bits());
                    self.push32(v32);
                } else {
                    self.rex(true, false, false, reg.is_extended());
                    self.push(0xB8 + reg.low_bits());
                    self.push64(value);
                }
            }
            _ => {
                self.rex(false, false, false, reg.is_extended());
                self.push(0xB8 + reg.low_bits());
                self.push32(value as i32);
            }
        }
    }

    /// MOV dst, src (register to register).
    pub fn mov_reg_reg(&mut self, dst: Gpr, src: Gpr, width: Width) {
        self.rex_for_width(width, src.is_extended(), dst.is_extended());
        self.push(if width == Width::W1 { 0x88 } else { 0x89 });
        self.modrm(0b11, src.low_bits(), dst.low_bits());
    }

    /// MOV reg, [base+disp] with the value's exact width (width-exact
    /// reloads keep neighboring spill slots intact).
    pub fn load(&mut self, dst: Gpr, base: Gpr, disp: i32, width: Width) {
        match width {
            Width::W1 => {
                // MOVZX r32, r/m8
                self.rex(false, dst.is_extended(), false, base.is_extended());
                self.push(0x0F);
                self.push(0xB6);
                self.mem_operand(dst.low_bits(), base, disp);
            }
            Width::W2 => {
                self.rex(false, dst.is_extended(), false, base.is_extended());
                self.push(0x0F);
                self.push(0xB7);
                self.mem_operand(dst.low_bits(), base, disp);
            }
            Width::W4 => {
                self.rex(false, dst.is_extended(), false, base.is_extended());
                self.push(0x8B);
                self.mem_operand(dst.low_bits(), base, disp);
            }
            Width::W8 => {
                self.rex(true, dst.is_extended(), false, base.is_extended());
                self.push(0x8B);
                self.mem_operand(dst.low_bits(), base, disp);
            }
        }
    }

    /// MOV [base+disp], src with the value's exact width.
    pub fn store(&mut self, base: Gpr, disp: i32, src: Gpr, width: Width) {
        match width {
            Width::W1 => {
                self.rex(false, src.is_extended(), false, base.is_extended());
                self.push(0x88);
                self.mem_operand(src.low_bits(), base, disp);
            }
            Width::W2 => {
                self.push(0x66);
                self.rex(false, src.is_extended(), false, base.is_extended());
                self.push(0x89);
                self.mem_operand(src.low_bits(), base, disp);
            }
            Width::W4 => {
                self.rex(false, src.is_extended(), false, base.is_extended());
                self.push(0x89);
                self.mem_operand(src.low_bits(), base, disp);
            }
            Width::W8 => {
                self.rex(true, src.is_extended(), false, base.is_extended());
                self.push(0x89);
                self.mem_operand(src.low_bits(), base, disp);
            }
        }
    }

    /// LEA dst, [base+disp].
    pub fn lea(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(true, dst.is_extended(), false, base.is_extended());
        self.push(0x8D);
        self.mem_operand(dst.low_bits(), base, disp);
    }

    /// LEA dst, [RIP+disp32] for globals; emits a PC-relative relocation.
    pub fn lea_rip_symbol(&mut self, dst: Gpr, symbol: StrId) {
        self.rex(true, dst.is_extended(), false, false);
        self.push(0x8D);
        self.modrm(0b00, dst.low_bits(), 0b101);
        self.relocs.push(Reloc {
            offset: self.bytes.len() as u64,
            symbol,
            kind: RelocKind::Pc32,
            addend: -4,
        });
        self.push32(0);
    }

    // --------------------------------------------------------
    // ALU
    // --------------------------------------------------------

    fn alu_reg_reg(&mut self, opcode: u8, dst: Gpr, src: Gpr, width: Width) {
        self.rex_for_width(width, src.is_extended(), dst.is_extended());
        self.push(opcode);
        self.modrm(0b11, src.low_bits(), dst.low_bits());
    }

    pub fn add_reg_reg(&mut self, dst: Gpr, src: Gpr, width: Width) {
        self.alu_reg_reg(0x01, dst, src, width);
    }

    pub fn sub_reg_reg(&mut self, dst: Gpr, src: Gpr, width: Width) {
        self.alu_reg_reg(0x29, dst, src, width);
    }

    pub fn and_reg_reg(&mut self, dst: Gpr, src: Gpr, width: Width) {
        self.alu_reg_reg(0x21, dst, src, width);
    }

    pub fn or_reg_reg(&mut self, dst: Gpr, src: Gpr, width: Width) {
        self.alu_reg_reg(0x09, dst, src, width);
    }

    pub fn xor_reg_reg(&mut self, dst: Gpr, src: Gpr, width: Width) {
        self.alu_reg_reg(0x31, dst, src, width);
    }

    pub fn cmp_reg_reg(&mut self, a: Gpr, b: Gpr, width: Width) {
        self.alu_reg_reg(0x39, a, b, width);
    }

    /// IMUL dst, src (0F AF /r).
    pub fn imul_reg_reg(&mut self, dst: Gpr, src: Gpr, width: Width) {
        self.rex_for_width(width, dst.is_extended(), src.is_extended());
        self.push(0x0F);
        self.push(0xAF);
        self.modrm(0b11, dst.low_bits(), src.low_bits());
    }

    /// CQO then IDIV r (signed) or XOR rdx + DIV r (unsigned). Dividend in
    /// RAX, quotient in RAX, remainder in RDX.
    pub fn div_rax_by(&mut self, divisor: Gpr, signed: bool, width: Width) {
        if signed {
            // CWD/CDQ/CQO
            if width == Width::W8 {
                self.rex(true, false, false, false);
            }
            self.push(0x99);
            self.rex_for_width(width, false, divisor.is_extended());
            self.push(0xF7);
            self.modrm(0b11, 7, divisor.low_bits());
        } else {
            self.xor_reg_reg(Gpr::Rdx, Gpr::Rdx, Width::W8);
            self.rex_for_width(width, false, divisor.is_extended());
            self.push(0xF7);
            self.modrm(0b11, 6, divisor.low_bits());
        }
    }

    /// Shift RAX-class register by CL: SHL/SHR/SAR (D3 /4, /5, /7).
    pub fn shift_by_cl(&mut self, dst: Gpr, arithmetic_right: bool, left: bool, width: Width) {
        self.rex_for_width(width, false, dst.is_extended());
        self.push(0xD3);
        let ext = if left {
            4
        } else if arithmetic_right {
            7
        } else {
            5
        };
        self.modrm(0b11, ext, dst.low_bits());
    }

    /// NEG r (F7 /3).
    pub fn neg_reg(&mut self, reg: Gpr, width: Width) {
        self.rex_for_width(width, false, reg.is_extended());
        self.push(0xF7);
        self.modrm(0b11, 3, reg.low_bits());
    }

    /// SETcc dst-low then MOVZX to 32-bit.
    pub fn setcc(&mut self, cc: Cond, dst: Gpr) {
        // SETcc r/m8
        self.rex(false, false, false, dst.is_extended());
        self.push(0x0F);
        self.push(0x90 + cc as u8);
        self.modrm(0b11, 0, dst.low_bits());
        // MOVZX r32, r/m8
        self.rex(false, dst.is_extended(), false, dst.is_extended());
        self.push(0x0F);
        self.push(0xB6);
        self.modrm(0b11, dst.low_bits(), dst.low_bits());
    }

    /// TEST a, a (for truthiness branches).
    pub fn test_reg_reg(&mut self, a: Gpr, b: Gpr, width: Width) {
        self.rex_for_width(width, b.is_extended(), a.is_extended());
        self.push(0x85);
        self.modrm(0b11, b.low_bits(), a.low_bits());
    }

    /// ADD/SUB RSP, imm32 for frame setup.
    pub fn add_rsp_imm(&mut self, value: i32) {
        self.rex(true, false, false, false);
        self.push(0x81);
        self.modrm(0b11, 0, Gpr::Rsp.low_bits());
        self.push32(value);
    }

    pub fn sub_rsp_imm(&mut self, value: i32) {
        self.rex(true, false, false, false);
        self.push(0x81);
        self.modrm(0b11, 5, Gpr::Rsp.low_bits());
        self.push32(value);
    }

    /// MOV AL, imm8 (variadic XMM count for System V).
    pub fn mov_al_imm(&mut self, value: u8) {
        self.push(0xB0);
        self.push(value);
    }

    // --------------------------------------------------------
    // Branches
    // --------------------------------------------------------

    pub fn jmp_label(&mut self, label: u32) {
        self.push(0xE9);
        self.branch_site(label);
    }

    pub fn jcc_label(&mut self, cc: Cond, label: u32) {
        self.push(0x0F);
        self.push(0x80 + cc as u8);
        self.branch_site(label);
    }

    // --------------------------------------------------------
    // SSE scalar float
    // --------------------------------------------------------

    fn sse_prefix(&mut self, double: bool) {
        self.push(if double { 0xF2 } else { 0xF3 });
    }

    fn sse_rex(&mut self, r: Xmm, b_ext: bool) {
        self.rex(false, r.is_extended(), false, b_ext);
    }

    /// MOVSS/MOVSD xmm, [base+disp].
    pub fn movs_load(&mut self, dst: Xmm, base: Gpr, disp: i32, double: bool) {
        self.sse_prefix(double);
        self.sse_rex(dst, base.is_extended());
        self.push(0x0F);
        self.push(0x10);
        self.mem_operand(dst.low_bits(), base, disp);
    }

    /// MOVSS/MOVSD [base+disp], xmm.
    pub fn movs_store(&mut self, base: Gpr, disp: i32, src: Xmm, double: bool) {
        self.sse_prefix(double);
        self.sse_rex(src, base.is_extended());
        self.push(0x0F);
        self.push(0x11);
        self.mem_operand(src.low_bits(), base, disp);
    }

    fn sse_op(&mut self, opcode: u8, dst: Xmm, src: Xmm, double: bool) {
        self.sse_prefix(double);
        self.rex(false, dst.is_extended(), false, src.is_extended());
        self.push(0x0F);
        self.push(opcode);
        self.modrm(0b11, dst.low_bits(), src.low_bits());
    }

    pub fn adds(&mut self, dst: Xmm, src: Xmm, double: bool) {
        self.sse_op(0x58, dst, src, double);
    }

    pub fn subs(&mut self, dst: Xmm, src: Xmm, double: bool) {
        self.sse_op(0x5C, dst, src, double);
    }

    pub fn muls(&mut self, dst: Xmm, src: Xmm, double: bool) {
        self.sse_op(0x59, dst, src, double);
    }

    pub fn divs(&mut self, dst: Xmm, src: Xmm, double: bool) {
        self.sse_op(0x5E, dst, src, double);
    }

    /// UCOMISS/UCOMISD for float compares (66 prefix selects double).
    pub fn ucomis(&mut self, a: Xmm, b: Xmm, double: bool) {
        if double {
            self.push(0x66);
        }
        self.rex(false, a.is_extended(), false, b.is_extended());
        self.push(0x0F);
        self.push(0x2E);
        self.modrm(0b11, a.low_bits(), b.low_bits());
    }

    /// CVTSI2SS/SD xmm, r64.
    pub fn cvt_int_to_float(&mut self, dst: Xmm, src: Gpr, double: bool) {
        self.sse_prefix(double);
        self.rex(true, dst.is_extended(), false, src.is_extended());
        self.push(0x0F);
        self.push(0x2A);
        self.modrm(0b11, dst.low_bits(), src.low_bits());
    }

    /// CVTTSS/SD2SI r64, xmm (truncating).
    pub fn cvt_float_to_int(&mut self, dst: Gpr, src: Xmm, double: bool) {
        self.sse_prefix(double);
        self.rex(true, dst.is_extended(), false, src.is_extended());
        self.push(0x0F);
        self.push(0x2C);
        self.modrm(0b11, dst.low_bits(), src.low_bits());
    }

    /// CVTSS2SD / CVTSD2SS.
    pub fn cvt_float_width(&mut self, dst: Xmm, src: Xmm, to_double: bool) {
        self.sse_prefix(!to_double);
        self.rex(false, dst.is_extended(), false, src.is_extended());
        self.push(0x0F);
        self.push(0x5A);
        self.modrm(0b11, dst.low_bits(), src.low_bits());
    }

    /// Sign- or zero-extend a narrower integer in place.
    pub fn extend_reg(&mut self, reg: Gpr, from: Width, signed: bool) {
        match (from, signed) {
            (Width::W4, true) => {
                // MOVSXD r64, r/m32
                self.rex(true, reg.is_extended(), false, reg.is_extended());
                self.push(0x63);
                self.modrm(0b11, reg.low_bits(), reg.low_bits());
            }
            (Width::W4, false) => {
                // MOV r32, r32 zero-extends.
                self.mov_reg_reg(reg, reg, Width::W4);
            }
            (Width::W1, s) | (Width::W2, s) => {
                let op = match (from, s) {
                    (Width::W1, true) => 0xBEu8,
                    (Width::W1, false) => 0xB6,
                    (Width::W2, true) => 0xBF,
                    _ => 0xB7,
                };
                self.rex(true, reg.is_extended(), false, reg.is_extended());
                self.push(0x0F);
                self.push(op);
                self.modrm(0b11, reg.low_bits(), reg.low_bits());
            }
            (Width::W8, _) => {}
        }
    }
}

/// Condition codes as encoded in Jcc/SETcc opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_encoding_matches_reference() {
        // push rbp = 55; push r12 = 41 54; pop rbp = 5D; pop r12 = 41 5C.
        let mut b = CodeBuf::new();
        b.push_reg(Gpr::Rbp);
        b.push_reg(Gpr::R12);
        b.pop_reg(Gpr::Rbp);
        b.pop_reg(Gpr::R12);
        assert_eq!(b.bytes, vec![0x55, 0x41, 0x54, 0x5D, 0x41, 0x5C]);
    }

    #[test]
    fn test_call_reg_encoding() {
        // call rax = FF D0; call r8 = 41 FF D0.
        let mut b = CodeBuf::new();
        b.call_reg(Gpr::Rax);
        b.call_reg(Gpr::R8);
        assert_eq!(b.bytes, vec![0xFF, 0xD0, 0x41, 0xFF, 0xD0]);
    }

    #[test]
    fn test_mov_imm32_form() {
        // mov rax, 42 → REX.W C7 C0 2A 00 00 00
        let mut b = CodeBuf::new();
        b.mov_reg_imm(Gpr::Rax, 42, Width::W8);
        assert_eq!(b.bytes, vec![0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm64_form() {
        // mov rax, 0x1_0000_0000 → REX.W B8 imm64.
        let mut b = CodeBuf::new();
        b.mov_reg_imm(Gpr::Rax, 0x1_0000_0000, Width::W8);
        assert_eq!(b.bytes[0], 0x48);
        assert_eq!(b.bytes[1], 0xB8);
        assert_eq!(b.bytes.len(), 10);
    }

    #[test]
    fn test_add_reg_reg_64() {
        // add rax, rcx = 48 01 C8
        let mut b = CodeBuf::new();
        b.add_reg_reg(Gpr::Rax, Gpr::Rcx, Width::W8);
        assert_eq!(b.bytes, vec![0x48, 0x01, 0xC8]);
    }

    #[test]
    fn test_add_reg_reg_32_skips_rex() {
        // add eax, ecx = 01 C8 (no REX when no extension and not 64-bit).
        let mut b = CodeBuf::new();
        b.add_reg_reg(Gpr::Rax, Gpr::Rcx, Width::W4);
        assert_eq!(b.bytes, vec![0x01, 0xC8]);
    }

    #[test]
    fn test_extended_reg_forces_rex() {
        // add r8, rax = 49 01 C0
        let mut b = CodeBuf::new();
        b.add_reg_reg(Gpr::R8, Gpr::Rax, Width::W8);
        assert_eq!(b.bytes, vec![0x49, 0x01, 0xC0]);
    }

    #[test]
    fn test_load_store_width_exact() {
        let mut b = CodeBuf::new();
        // 32-bit store: mov [rbp-8], eax = 89 45 F8
        b.store(Gpr::Rbp, -8, Gpr::Rax, Width::W4);
        assert_eq!(b.bytes, vec![0x89, 0x45, 0xF8]);
        // 64-bit store uses REX.W: 48 89 45 F8
        let mut b = CodeBuf::new();
        b.store(Gpr::Rbp, -8, Gpr::Rax, Width::W8);
        assert_eq!(b.bytes, vec![0x48, 0x89, 0x45, 0xF8]);
    }

    #[test]
    fn test_rsp_addressing_gets_sib() {
        // mov rax, [rsp+16] needs SIB: 48 8B 44 24 10.
        let mut b = CodeBuf::new();
        b.load(Gpr::Rax, Gpr::Rsp, 16, Width::W8);
        assert_eq!(b.bytes, vec![0x48, 0x8B, 0x44, 0x24, 0x10]);
    }

    #[test]
    fn test_forward_branch_fixup_patched_on_bind() {
        let mut b = CodeBuf::new();
        b.jmp_label(1);
        assert_eq!(b.unresolved_fixups(), 1);
        b.mov_reg_imm(Gpr::Rax, 1, Width::W8);
        b.bind_label(1);
        assert_eq!(b.unresolved_fixups(), 0);
        // Displacement = bytes between end of the jmp and the label: the
        // 7-byte mov sits in between.
        let rel = i32::from_le_bytes(b.bytes[1..5].try_into().unwrap());
        assert_eq!(rel, 7);
    }

    #[test]
    fn test_backward_branch_immediate() {
        let mut b = CodeBuf::new();
        b.bind_label(7);
        b.mov_reg_imm(Gpr::Rax, 1, Width::W8);
        b.jmp_label(7);
        assert_eq!(b.unresolved_fixups(), 0);
        let rel = i32::from_le_bytes(b.bytes[b.bytes.len() - 4..].try_into().unwrap());
        assert_eq!(rel, -(b.bytes.len() as i32));
    }

    #[test]
    fn test_call_symbol_emits_reloc() {
        let mut strings = crate::strings::StringTable::new();
        let sym = strings.intern("memcpy");
        let mut b = CodeBuf::new();
        b.call_symbol(sym, RelocKind::Plt32);
        assert_eq!(b.bytes[0], 0xE8);
        assert_eq!(b.relocs.len(), 1);
        assert_eq!(b.relocs[0].offset, 1);
        assert_eq!(b.relocs[0].kind, RelocKind::Plt32);
        assert_eq!(b.relocs[0].addend, -4);
    }

    #[test]
    fn test_sse_add_double() {
        // addsd xmm0, xmm1 = F2 0F 58 C1
        let mut b = CodeBuf::new();
        b.adds(Xmm(0), Xmm(1), true);
        assert_eq!(b.bytes, vec![0xF2, 0x0F, 0x58, 0xC1]);
    }

    #[test]
    fn test_xmm8_needs_rex() {
        // addsd xmm8, xmm1 = F2 44 0F 58 C1
        let mut b = CodeBuf::new();
        b.adds(Xmm(8), Xmm(1), true);
        assert_eq!(b.bytes, vec![0xF2, 0x44, 0x0F, 0x58, 0xC1]);
    }
}
