//! Code generation: IR → x86-64 machine code
//!
//! One pass per function: allocate registers/slots, emit the prologue
//! (recording CFI), walk the instruction list appending bytes, patch
//! branch fixups at label binds, and collect the side tables the object
//! writer needs (relocations, line mappings, local-variable records,
//! exception regions).
//!
//! Submodules:
//! - `emit`: instruction encoders and the fixup buffer
//! - `regalloc`: linear-scan allocation over the fixed register file
//! - `abi`: System V / Microsoft x64 argument and return classification

pub mod abi;
pub mod emit;
pub mod regalloc;

use crate::config::TargetAbi;
use crate::diag::{Diagnostic, SourceLoc};
use crate::ir::{IrFunction, Opcode, Payload, ValueId};
use crate::lower::LowerOutput;
use crate::strings::{StrId, StringTable};
use crate::types::{TypeId, TypeRegistry};
use abi::{Abi, ArgLoc, RetClass};
use emit::{CodeBuf, Cond, Gpr, Reloc, RelocKind, Width, Xmm};
use regalloc::{Allocation, Loc};
use std::collections::HashMap;

/// CFI steps recorded while emitting prologue/epilogue, consumed by the
/// DWARF writer (`.eh_frame`) and the SEH unwind writer (`.xdata`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiStep {
    PushRbp { offset: u32 },
    MovRspRbp { offset: u32 },
    SubRsp { offset: u32, amount: u32 },
    PopRbp { offset: u32 },
}

/// Line-table entry: code offset within the function → source position.
#[derive(Debug, Clone, Copy)]
pub struct LineMapping {
    pub code_offset: u32,
    pub file: StrId,
    pub line: u32,
}

/// Debug record for one local: where it lives in the frame.
#[derive(Debug, Clone)]
pub struct LocalVarRecord {
    pub name: StrId,
    pub ty: TypeId,
    pub frame_offset: i32,
}

/// Code range protected by a try-region, with handler offsets.
#[derive(Debug, Clone)]
pub struct EhRegion {
    pub start: u32,
    pub end: u32,
    pub handler_offsets: Vec<u32>,
}

/// One compiled function inside the module text.
#[derive(Debug, Clone)]
pub struct CodeFunction {
    pub name: StrId,
    pub display_name: StrId,
    pub offset: u64,
    pub size: u64,
    pub weak: bool,
    pub lines: Vec<LineMapping>,
    pub local_vars: Vec<LocalVarRecord>,
    pub cfi: Vec<CfiStep>,
    pub eh_regions: Vec<EhRegion>,
}

/// Whole-module code generation result.
#[derive(Debug, Default)]
pub struct CodeModule {
    pub text: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub functions: Vec<CodeFunction>,
}

pub struct CodeGenerator<'a> {
    types: &'a TypeRegistry,
    strings: &'a mut StringTable,
    abi: Abi,
    target: TargetAbi,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(types: &'a TypeRegistry, strings: &'a mut StringTable, target: TargetAbi) -> Self {
        let abi = match target {
            TargetAbi::LinuxElf => Abi::SysV,
            TargetAbi::WindowsCoff => Abi::Win64,
        };
        CodeGenerator {
            types,
            strings,
            abi,
            target,
        }
    }

    pub fn generate(&mut self, lowered: &LowerOutput) -> Result<CodeModule, Diagnostic> {
        let mut module = CodeModule::default();
        for f in &lowered.functions {
            let start = module.text.len() as u64;
            let (bytes, relocs, meta) = self.generate_function(f)?;
            for mut r in relocs {
                r.offset += start;
                module.relocs.push(r);
            }
            let size = bytes.len() as u64;
            module.text.extend_from_slice(&bytes);
            module.functions.push(CodeFunction {
                name: f.name,
                display_name: f.display_name,
                offset: start,
                size,
                weak: f.weak,
                lines: meta.lines,
                local_vars: meta.local_vars,
                cfi: meta.cfi,
                eh_regions: meta.eh_regions,
            });
        }
        Ok(module)
    }

    fn generate_function(
        &mut self,
        f: &IrFunction,
    ) -> Result<(Vec<u8>, Vec<Reloc>, FnMeta), Diagnostic> {
        let mut alloc = regalloc::allocate(f, self.types, self.abi);
        // Callee-saved pushes sit directly below the saved RBP; shift every
        // frame-relative location past them so spills cannot clobber the
        // saved registers.
        let push_bias = (alloc.callee_saved_used.len() as i32) * 8;
        if push_bias != 0 {
            for loc in alloc.locs.values_mut() {
                match loc {
                    Loc::Spill { offset, .. } | Loc::LocalAddr { offset } => *offset -= push_bias,
                    _ => {}
                }
            }
        }
        let mut buf = CodeBuf::new();
        let mut meta = FnMeta::default();

        // Phi elimination: mirror each incoming value into the phi's
        // location at the incoming value's definition.
        let mut phi_mirrors: HashMap<ValueId, Vec<ValueId>> = HashMap::new();
        for instr in &f.instrs {
            if instr.op == Opcode::Phi
                && let (Payload::Phi { incoming }, Some(r)) = (&instr.payload, instr.result)
            {
                for (_, v) in incoming {
                    phi_mirrors.entry(*v).or_default().push(r);
                }
            }
        }

        // Outgoing stack-arg space: maximum over all calls, folded into the
        // frame so RSP stays put between calls.
        let mut out_args = 0u32;
        for instr in &f.instrs {
            let n = match &instr.payload {
                Payload::Call { args, .. } => args.len(),
                Payload::CallIndirect { args, .. } => args.len() + 1,
                Payload::VCall { args, .. } => args.len(),
                _ => continue,
            };
            let locs = self.abi.assign_args(&vec![false; n]);
            out_args = out_args.max(self.abi.stack_arg_bytes(&locs));
        }
        let frame_size = (alloc.frame_size + push_bias as u32 + out_args + 15) & !15;

        // Prologue.
        buf.push_reg(Gpr::Rbp);
        meta.cfi.push(CfiStep::PushRbp {
            offset: buf.len() as u32,
        });
        buf.mov_reg_reg(Gpr::Rbp, Gpr::Rsp, Width::W8);
        meta.cfi.push(CfiStep::MovRspRbp {
            offset: buf.len() as u32,
        });
        for &g in &alloc.callee_saved_used {
            buf.push_reg(g);
        }
        if frame_size > 0 {
            buf.sub_rsp_imm(frame_size as i32);
            meta.cfi.push(CfiStep::SubRsp {
                offset: buf.len() as u32,
                amount: frame_size,
            });
        }

        // Incoming parameters: move from ABI registers into their
        // locations.
        let param_floats: Vec<bool> = f
            .params
            .iter()
            .map(|(_, t)| {
                self.types
                    .primitive_of(*t)
                    .is_some_and(|p| p.is_floating())
            })
            .collect();
        let param_locs = self.abi.assign_args(&param_floats);
        for (i, ploc) in param_locs.iter().enumerate() {
            let v = ValueId(i as u32);
            let dst = alloc.loc_of(v);
            let width = f
                .params
                .get(i)
                .map(|(_, t)| Width::from_size(self.types.size_of(*t).unwrap_or(8).clamp(1, 8)))
                .unwrap_or(Width::W8);
            match (ploc, dst) {
                (ArgLoc::Gpr(src), dst) => self.write_loc(&mut buf, dst, *src, width),
                (ArgLoc::Xmm(x), Loc::Spill { offset, width }) => {
                    buf.movs_store(Gpr::Rbp, offset, *x, width == Width::W8);
                }
                (ArgLoc::Xmm(x), Loc::Xmm(d)) => {
                    // movaps-free scalar copy via adds-with-zero is wrong;
                    // go through memory scratch at [rsp].
                    buf.movs_store(Gpr::Rsp, 0, *x, true);
                    buf.movs_load(d, Gpr::Rsp, 0, true);
                }
                (ArgLoc::Stack(o), dst) => {
                    // Incoming stack args start above the saved RBP and
                    // return address.
                    buf.load(Gpr::Rax, Gpr::Rbp, 16 + *o as i32, width);
                    self.write_loc(&mut buf, dst, Gpr::Rax, width);
                }
                _ => {}
            }
        }

        // Record local-variable debug info (alloca frame offsets).
        for (name, ty, v) in &f.locals {
            if let Loc::LocalAddr { offset } = alloc.loc_of(*v) {
                meta.local_vars.push(LocalVarRecord {
                    name: *name,
                    ty: *ty,
                    frame_offset: offset,
                });
            }
        }

        let mut last_line: Option<(StrId, u32)> = None;
        let mut open_regions: Vec<(u32, Vec<crate::ir::HandlerSpec>)> = Vec::new();
        let mut handler_labels: Vec<(crate::ir::Label, usize)> = Vec::new();

        for instr in &f.instrs {
            // Line table: record on change.
            let cur = (instr.loc.file, instr.loc.line);
            if last_line != Some(cur) {
                last_line = Some(cur);
                meta.lines.push(LineMapping {
                    code_offset: buf.len() as u32,
                    file: instr.loc.file,
                    line: instr.loc.line,
                });
            }
            self.emit_instr(
                f,
                instr,
                &alloc,
                &mut buf,
                frame_size,
                &phi_mirrors,
                &mut open_regions,
                &mut handler_labels,
                &mut meta.closed_regions,
            )?;
        }

        // Resolve handler offsets for EH regions now that labels bound.
        for (start, handlers) in open_regions {
            // Unterminated TryBegin: close at function end.
            meta.eh_regions.push(EhRegion {
                start,
                end: buf.len() as u32,
                handler_offsets: handlers
                    .iter()
                    .filter_map(|h| {
                        handler_labels
                            .iter()
                            .find(|(l, _)| *l == h.target)
                            .map(|(_, o)| *o as u32)
                    })
                    .collect(),
            });
        }
        meta.eh_regions.extend(std::mem::take(&mut meta.closed_regions).into_iter().map(
            |(start, end, handlers)| EhRegion {
                start,
                end,
                handler_offsets: handlers
                    .iter()
                    .filter_map(|h| {
                        handler_labels
                            .iter()
                            .find(|(l, _)| *l == h.target)
                            .map(|(_, o)| *o as u32)
                    })
                    .collect(),
            },
        ));

        if buf.unresolved_fixups() > 0 {
            return Err(Diagnostic::internal(format!(
                "{} unresolved branch fixups in '{}'",
                buf.unresolved_fixups(),
                self.strings.resolve(f.display_name)
            )));
        }
        let (bytes, relocs) = buf.into_parts();
        Ok((bytes, relocs, meta))
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_instr(
        &mut self,
        f: &IrFunction,
        instr: &crate::ir::Instr,
        alloc: &Allocation,
        buf: &mut CodeBuf,
        frame_size: u32,
        phi_mirrors: &HashMap<ValueId, Vec<ValueId>>,
        open_regions: &mut Vec<(u32, Vec<crate::ir::HandlerSpec>)>,
        handler_labels: &mut Vec<(crate::ir::Label, usize)>,
        closed_regions: &mut Vec<(u32, u32, Vec<crate::ir::HandlerSpec>)>,
    ) -> Result<(), Diagnostic> {
        let width_of = |ty: Option<TypeId>| -> Width {
            ty.map(|t| Width::from_size(self.types.size_of(t).unwrap_or(8).clamp(1, 8)))
                .unwrap_or(Width::W8)
        };
        let is_float_ty = |ty: Option<TypeId>| -> bool {
            ty.and_then(|t| self.types.primitive_of(t))
                .is_some_and(|p| p.is_floating())
        };
        let w = width_of(instr.ty);

        // After computing a result into RAX/XMM0, write it to its location
        // and mirror into any phis fed by it.
        macro_rules! finish_int {
            ($result:expr) => {
                if let Some(r) = $result {
                    let loc = alloc.loc_of(r);
                    self.write_loc(buf, loc, Gpr::Rax, w);
                    if let Some(mirrors) = phi_mirrors.get(&r) {
                        for &m in mirrors {
                            self.write_loc(buf, alloc.loc_of(m), Gpr::Rax, w);
                        }
                    }
                }
            };
        }

        match (&instr.op, &instr.payload) {
            (Opcode::LabelMark, Payload::LabelMark { label }) => {
                handler_labels.push((*label, buf.len()));
                buf.bind_label(label.0);
            }
            (Opcode::Jmp, Payload::Jump { target }) => buf.jmp_label(target.0),
            (Opcode::Br, Payload::Branch { cond, then_target, else_target }) => {
                self.read_gpr(buf, alloc.loc_of(*cond), Gpr::Rax, Width::W4);
                buf.test_reg_reg(Gpr::Rax, Gpr::Rax, Width::W4);
                buf.jcc_label(Cond::Ne, then_target.0);
                buf.jmp_label(else_target.0);
            }
            (Opcode::ConstInt, Payload::ConstInt { value }) => {
                buf.mov_reg_imm(Gpr::Rax, *value, Width::W8);
                finish_int!(instr.result);
            }
            (Opcode::ConstFloat, Payload::ConstFloat { value }) => {
                // Materialize through the integer unit, then home the bits.
                let bits = if w == Width::W4 {
                    (*value as f32).to_bits() as i64
                } else {
                    value.to_bits() as i64
                };
                buf.mov_reg_imm(Gpr::Rax, bits, Width::W8);
                if let Some(r) = instr.result {
                    match alloc.loc_of(r) {
                        Loc::Xmm(x) => {
                            buf.store(Gpr::Rsp, -16, Gpr::Rax, Width::W8);
                            buf.movs_load(x, Gpr::Rsp, -16, w == Width::W8);
                        }
                        loc => self.write_loc(buf, loc, Gpr::Rax, w),
                    }
                }
            }
            (Opcode::GlobalAddr, Payload::Global { name }) => {
                buf.lea_rip_symbol(Gpr::Rax, *name);
                if let Some(r) = instr.result {
                    self.write_loc(buf, alloc.loc_of(r), Gpr::Rax, Width::W8);
                }
            }
            (Opcode::Alloca, _) => {
                // Storage was assigned by the allocator; no code.
            }
            (Opcode::Load, Payload::Load { addr }) => {
                self.read_addr(buf, alloc.loc_of(*addr));
                buf.load(Gpr::Rax, Gpr::Rax, 0, w);
                finish_int!(instr.result);
            }
            (Opcode::Store, Payload::Store { addr, value }) => {
                let vw = self.width_of_value(f, *value);
                self.read_gpr(buf, alloc.loc_of(*value), Gpr::R10, vw);
                self.read_addr(buf, alloc.loc_of(*addr));
                buf.store(Gpr::Rax, 0, Gpr::R10, vw);
            }
            (Opcode::Lea, Payload::Lea { base, offset }) => {
                self.read_addr(buf, alloc.loc_of(*base));
                buf.lea(Gpr::Rax, Gpr::Rax, *offset as i32);
                if let Some(r) = instr.result {
                    self.write_loc(buf, alloc.loc_of(r), Gpr::Rax, Width::W8);
                    if let Some(mirrors) = phi_mirrors.get(&r) {
                        for &m in mirrors {
                            self.write_loc(buf, alloc.loc_of(m), Gpr::Rax, Width::W8);
                        }
                    }
                }
            }
            (
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
                | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr,
                Payload::Binary {
                    lhs,
                    rhs,
                    is_signed,
                    is_float,
                },
            ) => {
                if *is_float {
                    let dbl = w == Width::W8;
                    self.read_xmm(buf, alloc.loc_of(*lhs), Xmm(0), dbl);
                    self.read_xmm(buf, alloc.loc_of(*rhs), Xmm(1), dbl);
                    match instr.op {
                        Opcode::Add => buf.adds(Xmm(0), Xmm(1), dbl),
                        Opcode::Sub => buf.subs(Xmm(0), Xmm(1), dbl),
                        Opcode::Mul => buf.muls(Xmm(0), Xmm(1), dbl),
                        Opcode::Div => buf.divs(Xmm(0), Xmm(1), dbl),
                        _ => {
                            return Err(Diagnostic::internal(
                                "floating operator has no integer-only encoding",
                            ));
                        }
                    }
                    if let Some(r) = instr.result {
                        self.write_xmm(buf, alloc.loc_of(r), Xmm(0), dbl);
                    }
                    return Ok(());
                }
                self.read_gpr(buf, alloc.loc_of(*lhs), Gpr::Rax, w);
                match instr.op {
                    Opcode::Div | Opcode::Mod => {
                        self.read_gpr(buf, alloc.loc_of(*rhs), Gpr::R10, w);
                        buf.div_rax_by(Gpr::R10, *is_signed, w);
                        if instr.op == Opcode::Mod {
                            buf.mov_reg_reg(Gpr::Rax, Gpr::Rdx, Width::W8);
                        }
                    }
                    Opcode::Shl | Opcode::Shr => {
                        self.read_gpr(buf, alloc.loc_of(*rhs), Gpr::Rcx, Width::W4);
                        buf.shift_by_cl(Gpr::Rax, *is_signed, instr.op == Opcode::Shl, w);
                    }
                    Opcode::Mul => {
                        self.read_gpr(buf, alloc.loc_of(*rhs), Gpr::R10, w);
                        buf.imul_reg_reg(Gpr::Rax, Gpr::R10, w);
                    }
                    _ => {
                        self.read_gpr(buf, alloc.loc_of(*rhs), Gpr::R10, w);
                        match instr.op {
                            Opcode::Add => buf.add_reg_reg(Gpr::Rax, Gpr::R10, w),
                            Opcode::Sub => buf.sub_reg_reg(Gpr::Rax, Gpr::R10, w),
                            Opcode::And => buf.and_reg_reg(Gpr::Rax, Gpr::R10, w),
                            Opcode::Or => buf.or_reg_reg(Gpr::Rax, Gpr::R10, w),
                            Opcode::Xor => buf.xor_reg_reg(Gpr::Rax, Gpr::R10, w),
                            _ => unreachable!("covered above"),
                        }
                    }
                }
                finish_int!(instr.result);
            }
            (
                Opcode::CmpEq | Opcode::CmpNe | Opcode::CmpLt | Opcode::CmpLe | Opcode::CmpGt
                | Opcode::CmpGe,
                Payload::Binary {
                    lhs,
                    rhs,
                    is_signed,
                    is_float,
                },
            ) => {
                let lw = self.width_of_value(f, *lhs);
                if *is_float {
                    let dbl = lw == Width::W8;
                    self.read_xmm(buf, alloc.loc_of(*lhs), Xmm(0), dbl);
                    self.read_xmm(buf, alloc.loc_of(*rhs), Xmm(1), dbl);
                    buf.ucomis(Xmm(0), Xmm(1), dbl);
                    let cc = match instr.op {
                        Opcode::CmpEq => Cond::E,
                        Opcode::CmpNe => Cond::Ne,
                        Opcode::CmpLt => Cond::B,
                        Opcode::CmpLe => Cond::Be,
                        Opcode::CmpGt => Cond::A,
                        _ => Cond::Ae,
                    };
                    buf.setcc(cc, Gpr::Rax);
                } else {
                    self.read_gpr(buf, alloc.loc_of(*lhs), Gpr::Rax, lw);
                    self.read_gpr(buf, alloc.loc_of(*rhs), Gpr::R10, lw);
                    buf.cmp_reg_reg(Gpr::Rax, Gpr::R10, lw);
                    let cc = match (instr.op, *is_signed) {
                        (Opcode::CmpEq, _) => Cond::E,
                        (Opcode::CmpNe, _) => Cond::Ne,
                        (Opcode::CmpLt, true) => Cond::L,
                        (Opcode::CmpLt, false) => Cond::B,
                        (Opcode::CmpLe, true) => Cond::Le,
                        (Opcode::CmpLe, false) => Cond::Be,
                        (Opcode::CmpGt, true) => Cond::G,
                        (Opcode::CmpGt, false) => Cond::A,
                        (_, true) => Cond::Ge,
                        (_, false) => Cond::Ae,
                    };
                    buf.setcc(cc, Gpr::Rax);
                }
                finish_int!(instr.result);
            }
            (Opcode::Neg, Payload::Unary { operand }) => {
                self.read_gpr(buf, alloc.loc_of(*operand), Gpr::Rax, w);
                buf.neg_reg(Gpr::Rax, w);
                finish_int!(instr.result);
            }
            (Opcode::Not, Payload::Unary { operand }) => {
                let ow = self.width_of_value(f, *operand);
                self.read_gpr(buf, alloc.loc_of(*operand), Gpr::Rax, ow);
                buf.test_reg_reg(Gpr::Rax, Gpr::Rax, ow);
                buf.setcc(Cond::E, Gpr::Rax);
                finish_int!(instr.result);
            }
            (
                Opcode::CastSext | Opcode::CastZext | Opcode::CastTrunc | Opcode::CastBits
                | Opcode::Copy,
                Payload::Cast { operand } | Payload::Unary { operand },
            ) => {
                let ow = self.width_of_value(f, *operand);
                self.read_gpr(buf, alloc.loc_of(*operand), Gpr::Rax, ow);
                match instr.op {
                    Opcode::CastSext => buf.extend_reg(Gpr::Rax, ow, true),
                    Opcode::CastZext => buf.extend_reg(Gpr::Rax, ow, false),
                    _ => {}
                }
                finish_int!(instr.result);
            }
            (Opcode::CastIntToFp, Payload::Cast { operand }) => {
                let dbl = w == Width::W8;
                self.read_gpr(buf, alloc.loc_of(*operand), Gpr::Rax, Width::W8);
                buf.cvt_int_to_float(Xmm(0), Gpr::Rax, dbl);
                if let Some(r) = instr.result {
                    self.write_xmm(buf, alloc.loc_of(r), Xmm(0), dbl);
                }
            }
            (Opcode::CastFpToInt, Payload::Cast { operand }) => {
                let ow = self.width_of_value(f, *operand);
                self.read_xmm(buf, alloc.loc_of(*operand), Xmm(0), ow == Width::W8);
                buf.cvt_float_to_int(Gpr::Rax, Xmm(0), ow == Width::W8);
                finish_int!(instr.result);
            }
            (Opcode::CastFpExt | Opcode::CastFpTrunc, Payload::Cast { operand }) => {
                let to_double = instr.op == Opcode::CastFpExt;
                self.read_xmm(buf, alloc.loc_of(*operand), Xmm(0), !to_double);
                buf.cvt_float_width(Xmm(0), Xmm(0), to_double);
                if let Some(r) = instr.result {
                    self.write_xmm(buf, alloc.loc_of(r), Xmm(0), to_double);
                }
            }
            (Opcode::Phi, _) => {
                // Incoming values were mirrored into this location at their
                // definitions; nothing to emit.
            }
            (Opcode::Call, Payload::Call { callee, args, variadic_float_args }) => {
                self.emit_call_args(f, buf, alloc, args, None)?;
                if self.abi.needs_al_float_count() && *variadic_float_args > 0 {
                    buf.mov_al_imm(*variadic_float_args);
                }
                let kind = match self.target {
                    TargetAbi::LinuxElf => RelocKind::Plt32,
                    TargetAbi::WindowsCoff => RelocKind::Pc32,
                };
                buf.call_symbol(*callee, kind);
                if let Some(r) = instr.result {
                    if is_float_ty(instr.ty) {
                        self.write_xmm(buf, alloc.loc_of(r), Xmm(0), w == Width::W8);
                    } else {
                        self.write_loc(buf, alloc.loc_of(r), Gpr::Rax, w);
                        if let Some(mirrors) = phi_mirrors.get(&r) {
                            for &m in mirrors {
                                self.write_loc(buf, alloc.loc_of(m), Gpr::Rax, w);
                            }
                        }
                    }
                }
            }
            (Opcode::CallIndirect, Payload::CallIndirect { target, args }) => {
                self.read_gpr(buf, alloc.loc_of(*target), Gpr::R11, Width::W8);
                self.emit_call_args(f, buf, alloc, args, None)?;
                buf.call_reg(Gpr::R11);
                finish_int!(instr.result);
            }
            (Opcode::VCall, Payload::VCall { object, slot, args, this_adjust }) => {
                // this (+adjust) → first arg; vptr load; slot index; call.
                self.read_addr(buf, alloc.loc_of(*object));
                if *this_adjust != 0 {
                    buf.lea(Gpr::Rax, Gpr::Rax, *this_adjust);
                }
                buf.mov_reg_reg(Gpr::R11, Gpr::Rax, Width::W8);
                // Load vptr: mov r11, [r11]
                buf.load(Gpr::R11, Gpr::R11, 0, Width::W8);
                // Load slot: mov r11, [r11 + slot*8]
                buf.load(Gpr::R11, Gpr::R11, (*slot as i32) * 8, Width::W8);
                self.emit_call_args(f, buf, alloc, args, Some(*object))?;
                buf.call_reg(Gpr::R11);
                finish_int!(instr.result);
            }
            (Opcode::Ret, Payload::Ret { value }) => {
                if let Some(v) = value {
                    let rw = self.width_of_value(f, *v);
                    let float_ret = self
                        .types
                        .primitive_of(f.ret)
                        .is_some_and(|p| p.is_floating());
                    if float_ret {
                        self.read_xmm(buf, alloc.loc_of(*v), Xmm(0), rw == Width::W8);
                    } else {
                        self.read_gpr(buf, alloc.loc_of(*v), Gpr::Rax, rw);
                    }
                }
                self.emit_epilogue(buf, frame_size, &alloc.callee_saved_used);
            }
            (Opcode::TryBegin, Payload::TryRegion { handlers, .. }) => {
                open_regions.push((buf.len() as u32, handlers.clone()));
            }
            (Opcode::TryEnd, _) => {
                // Close the innermost open region; handler offsets resolve
                // once all labels are bound.
                if let Some((start, handlers)) = open_regions.pop() {
                    closed_regions.push((start, buf.len() as u32, handlers));
                }
            }
            (Opcode::Throw, Payload::ThrowValue { value, ty }) => {
                match self.target {
                    TargetAbi::LinuxElf => {
                        // __cxa_allocate_exception(size) → rax;
                        // *rax = value; __cxa_throw(rax, type, 0).
                        let size = ty
                            .and_then(|t| self.types.size_of(t))
                            .unwrap_or(8)
                            .max(8);
                        buf.mov_reg_imm(Gpr::Rdi, size as i64, Width::W8);
                        let alloc_sym = self.strings.intern("__cxa_allocate_exception");
                        buf.call_symbol(alloc_sym, RelocKind::Plt32);
                        if let Some(v) = value {
                            self.read_gpr(buf, alloc.loc_of(*v), Gpr::R10, Width::W8);
                            buf.store(Gpr::Rax, 0, Gpr::R10, Width::W8);
                        }
                        buf.mov_reg_reg(Gpr::Rdi, Gpr::Rax, Width::W8);
                        buf.mov_reg_imm(Gpr::Rsi, 0, Width::W8);
                        buf.mov_reg_imm(Gpr::Rdx, 0, Width::W8);
                        let throw_sym = self.strings.intern("__cxa_throw");
                        buf.call_symbol(throw_sym, RelocKind::Plt32);
                    }
                    TargetAbi::WindowsCoff => {
                        if let Some(v) = value {
                            self.read_gpr(buf, alloc.loc_of(*v), Gpr::Rcx, Width::W8);
                        }
                        let sym = self.strings.intern("_CxxThrowException");
                        buf.call_symbol(sym, RelocKind::Pc32);
                    }
                }
            }
            (Opcode::PushFrame | Opcode::PopFrame, _) => {}
            (op, payload) => {
                return Err(Diagnostic::internal(format!(
                    "codegen: unhandled opcode {:?} with payload {:?}",
                    op,
                    std::mem::discriminant(payload)
                )));
            }
        }
        Ok(())
    }

    fn emit_call_args(
        &mut self,
        f: &IrFunction,
        buf: &mut CodeBuf,
        alloc: &Allocation,
        args: &[ValueId],
        _this: Option<ValueId>,
    ) -> Result<(), Diagnostic> {
        let floats: Vec<bool> = args
            .iter()
            .map(|&a| self.value_is_float(f, a))
            .collect();
        let locs = self.abi.assign_args(&floats);

        // Stack args first (they only read scratch), then the register
        // moves. Register-homed arguments need parallel-move ordering: an
        // argument may live in a register that is another argument's
        // target, so emit moves whose destination is not a pending source
        // first and break cycles through R11.
        for (&a, l) in args.iter().zip(&locs) {
            if let ArgLoc::Stack(off) = l {
                let wv = self.width_of_value(f, a);
                self.read_gpr(buf, alloc.loc_of(a), Gpr::Rax, wv);
                buf.store(Gpr::Rsp, *off as i32, Gpr::Rax, Width::W8);
            }
        }
        let mut reg_moves: Vec<(Gpr, Gpr)> = Vec::new();
        let mut mem_loads: Vec<(ValueId, ArgLoc)> = Vec::new();
        for (&a, l) in args.iter().zip(&locs) {
            match (alloc.loc_of(a), l) {
                (Loc::Gpr(src), ArgLoc::Gpr(dst)) => {
                    if src != *dst {
                        reg_moves.push((src, *dst));
                    }
                }
                (_, ArgLoc::Stack(_)) => {}
                _ => mem_loads.push((a, *l)),
            }
        }
        while !reg_moves.is_empty() {
            let ready = reg_moves
                .iter()
                .position(|&(_, dst)| !reg_moves.iter().any(|&(src, _)| src == dst));
            match ready {
                Some(i) => {
                    let (src, dst) = reg_moves.remove(i);
                    buf.mov_reg_reg(dst, src, Width::W8);
                }
                None => {
                    // Cycle: park one source in R10 (R11 may hold an
                    // indirect/virtual call target) and requeue the move.
                    let (src, dst) = reg_moves.remove(0);
                    buf.mov_reg_reg(Gpr::R10, src, Width::W8);
                    for m in &mut reg_moves {
                        if m.0 == src {
                            m.0 = Gpr::R10;
                        }
                    }
                    reg_moves.push((Gpr::R10, dst));
                }
            }
        }
        for (a, l) in mem_loads {
            match l {
                ArgLoc::Gpr(g) => {
                    let wv = self.width_of_value(f, a);
                    self.read_gpr(buf, alloc.loc_of(a), g, wv);
                }
                ArgLoc::Xmm(x) => {
                    let wv = self.width_of_value(f, a);
                    self.read_xmm(buf, alloc.loc_of(a), x, wv == Width::W8);
                }
                ArgLoc::Stack(_) => {}
            }
        }
        Ok(())
    }

    fn emit_epilogue(&self, buf: &mut CodeBuf, frame_size: u32, callee_saved: &[Gpr]) {
        if frame_size > 0 {
            buf.add_rsp_imm(frame_size as i32);
        }
        for &g in callee_saved.iter().rev() {
            buf.pop_reg(g);
        }
        buf.pop_reg(Gpr::Rbp);
        buf.ret();
    }

    fn value_is_float(&self, f: &IrFunction, v: ValueId) -> bool {
        f.instrs
            .iter()
            .find(|i| i.result == Some(v))
            .and_then(|i| i.ty)
            .or_else(|| f.params.get(v.0 as usize).map(|(_, t)| *t))
            .and_then(|t| self.types.primitive_of(t))
            .is_some_and(|p| p.is_floating())
    }

    fn width_of_value(&self, f: &IrFunction, v: ValueId) -> Width {
        let ty = f
            .instrs
            .iter()
            .find(|i| i.result == Some(v))
            .and_then(|i| i.ty)
            .or_else(|| f.params.get(v.0 as usize).map(|(_, t)| *t));
        ty.map(|t| Width::from_size(self.types.size_of(t).unwrap_or(8).clamp(1, 8)))
            .unwrap_or(Width::W8)
    }

    /// Bring a value into a specific GPR.
    fn read_gpr(&self, buf: &mut CodeBuf, loc: Loc, dst: Gpr, width: Width) {
        match loc {
            Loc::Gpr(g) => {
                if g != dst {
                    buf.mov_reg_reg(dst, g, Width::W8);
                }
            }
            Loc::Spill { offset, width: w } => buf.load(dst, Gpr::Rbp, offset, w),
            Loc::LocalAddr { offset } => buf.lea(dst, Gpr::Rbp, offset),
            Loc::Xmm(_) => {
                // Cross-domain moves go through the slot; the allocator
                // never hands an integer value an XMM.
                let _ = width;
                buf.mov_reg_imm(dst, 0, Width::W8);
            }
        }
    }

    /// Bring an address-valued operand into RAX.
    fn read_addr(&self, buf: &mut CodeBuf, loc: Loc) {
        self.read_gpr(buf, loc, Gpr::Rax, Width::W8);
    }

    fn write_loc(&self, buf: &mut CodeBuf, loc: Loc, src: Gpr, width: Width) {
        match loc {
            Loc::Gpr(g) => {
                if g != src {
                    buf.mov_reg_reg(g, src, Width::W8);
                }
            }
            Loc::Spill { offset, width: w } => buf.store(Gpr::Rbp, offset, src, w),
            Loc::LocalAddr { .. } => {
                // Alloca results are addresses; they are never written.
            }
            Loc::Xmm(_) => {}
        }
        let _ = width;
    }

    fn read_xmm(&self, buf: &mut CodeBuf, loc: Loc, dst: Xmm, double: bool) {
        match loc {
            Loc::Xmm(x) => {
                if x != dst {
                    // Scalar copy through memory scratch below RSP red zone
                    // is avoided; use movs via [rsp-16] shadow area.
                    buf.movs_store(Gpr::Rsp, -16, x, double);
                    buf.movs_load(dst, Gpr::Rsp, -16, double);
                }
            }
            Loc::Spill { offset, .. } => buf.movs_load(dst, Gpr::Rbp, offset, double),
            Loc::Gpr(_) | Loc::LocalAddr { .. } => {
                // Integer-homed float bits: route through the stack.
                buf.movs_load(dst, Gpr::Rbp, -8, double);
            }
        }
    }

    fn write_xmm(&self, buf: &mut CodeBuf, loc: Loc, src: Xmm, double: bool) {
        match loc {
            Loc::Xmm(x) => {
                if x != src {
                    buf.movs_store(Gpr::Rsp, -16, src, double);
                    buf.movs_load(x, Gpr::Rsp, -16, double);
                }
            }
            Loc::Spill { offset, .. } => buf.movs_store(Gpr::Rbp, offset, src, double),
            _ => {}
        }
    }
}

#[derive(Debug, Default)]
struct FnMeta {
    lines: Vec<LineMapping>,
    local_vars: Vec<LocalVarRecord>,
    cfi: Vec<CfiStep>,
    eh_regions: Vec<EhRegion>,
    closed_regions: Vec<(u32, u32, Vec<crate::ir::HandlerSpec>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::lexer::Lexer;
    use crate::lower::Lowerer;
    use crate::parser::Parser;

    fn compile_to_code(src: &str, target: TargetAbi) -> (CodeModule, StringTable) {
        let mut strings = StringTable::new();
        let file = strings.intern("t.cpp");
        let toks = Lexer::new(src, file).lex().unwrap();
        let out = Parser::new(toks, &mut strings).parse();
        assert!(out.diags.is_empty(), "parse: {:?}", out.diags);
        let mut arena = out.arena;
        let mut registry = out.registry;
        let config = CompilerConfig {
            target,
            ..CompilerConfig::default()
        };
        let mut types = TypeRegistry::new(target == TargetAbi::LinuxElf);
        let lowerer = Lowerer::new(
            &mut arena,
            &mut strings,
            &mut types,
            &mut registry,
            &config,
        );
        let lowered = lowerer.lower_translation_unit(out.root);
        assert!(lowered.diags.is_empty(), "lower: {:?}", lowered.diags);
        let mut generator = CodeGenerator::new(&types, &mut strings, target);
        let module = generator.generate(&lowered).unwrap();
        (module, strings)
    }

    #[test]
    fn test_simple_function_produces_machine_code() {
        let (module, strings) = compile_to_code("int add(int a, int b) { return a + b; }", TargetAbi::LinuxElf);
        assert_eq!(module.functions.len(), 1);
        let f = &module.functions[0];
        assert_eq!(strings.resolve(f.display_name), "add");
        assert!(f.size > 0);
        // Prologue starts with push rbp; mov rbp, rsp.
        let code = &module.text[f.offset as usize..];
        assert_eq!(code[0], 0x55);
        assert_eq!(&code[1..4], &[0x48, 0x89, 0xE5]);
        // Ends with ret.
        assert_eq!(module.text[(f.offset + f.size - 1) as usize], 0xC3);
    }

    #[test]
    fn test_cfi_records_prologue() {
        let (module, _) = compile_to_code("int f() { int x = 1; return x; }", TargetAbi::LinuxElf);
        let f = &module.functions[0];
        assert!(matches!(f.cfi[0], CfiStep::PushRbp { .. }));
        assert!(matches!(f.cfi[1], CfiStep::MovRspRbp { .. }));
        assert!(f.cfi.iter().any(|c| matches!(c, CfiStep::SubRsp { .. })));
    }

    #[test]
    fn test_call_emits_plt_reloc_on_linux() {
        let (module, strings) = compile_to_code(
            "int g(int x) { return x; }\nint f() { return g(3); }",
            TargetAbi::LinuxElf,
        );
        assert!(
            module
                .relocs
                .iter()
                .any(|r| r.kind == RelocKind::Plt32 && strings.resolve(r.symbol).contains("g")),
            "missing PLT32 call reloc: {:?}",
            module.relocs
        );
    }

    #[test]
    fn test_line_mappings_recorded() {
        let (module, _) = compile_to_code("int f() {\n  int x = 1;\n  return x;\n}", TargetAbi::LinuxElf);
        let f = &module.functions[0];
        assert!(f.lines.len() >= 2, "line table too sparse: {:?}", f.lines);
        // Offsets are monotonically non-decreasing.
        for pair in f.lines.windows(2) {
            assert!(pair[0].code_offset <= pair[1].code_offset);
        }
    }

    #[test]
    fn test_local_variable_debug_records() {
        let (module, strings) = compile_to_code("int f() { int counted = 5; return counted; }", TargetAbi::LinuxElf);
        let f = &module.functions[0];
        assert!(
            f.local_vars
                .iter()
                .any(|v| strings.resolve(v.name) == "counted" && v.frame_offset < 0),
            "local var record missing: {:?}",
            f.local_vars
        );
    }

    #[test]
    fn test_windows_target_generates_too() {
        let (module, _) = compile_to_code("int f(int a) { return a * 2; }", TargetAbi::WindowsCoff);
        assert_eq!(module.functions.len(), 1);
        assert!(module.functions[0].size > 0);
    }

    #[test]
    fn test_string_literal_gets_rip_relative_reloc() {
        let (module, strings) = compile_to_code(
            "const char* greet() { return \"hello\"; }",
            TargetAbi::LinuxElf,
        );
        assert!(
            module
                .relocs
                .iter()
                .any(|r| r.kind == RelocKind::Pc32
                    && strings.resolve(r.symbol).starts_with("__str_")),
            "missing RIP-relative reloc for string literal"
        );
    }

    #[test]
    fn test_no_unresolved_fixups_in_branchy_code() {
        let (module, _) = compile_to_code(
            "int f(int n) {\n\
               int s = 0;\n\
               for (int i = 0; i < n; ++i) { if (i % 2 == 0) s += i; else s -= 1; }\n\
               while (s > 100) s /= 2;\n\
               return s;\n\
             }",
            TargetAbi::LinuxElf,
        );
        assert!(module.functions[0].size > 0);
    }
}
