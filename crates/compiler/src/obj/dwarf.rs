//! DWARF4 debug info and call-frame information
//!
//! Emits `.debug_abbrev`, `.debug_info`, `.debug_str`, `.debug_line` from
//! the code module's function and line tables, and `.eh_frame` CIE/FDE
//! records from the prologue/epilogue CFI steps. Cross-record offsets
//! (abbrev references, string offsets, CU lengths) are tracked while the
//! byte streams build up; `low_pc` fields get relocations against their
//! function symbols.

use super::{ObjReloc, ObjectBuilder, Section, SectionFlags};
use crate::codegen::emit::RelocKind;
use crate::codegen::{CfiStep, CodeModule};

// DWARF constants used below.
const DW_TAG_COMPILE_UNIT: u64 = 0x11;
const DW_TAG_SUBPROGRAM: u64 = 0x2e;
const DW_TAG_VARIABLE: u64 = 0x34;
const DW_AT_NAME: u64 = 0x03;
const DW_AT_LOW_PC: u64 = 0x11;
const DW_AT_HIGH_PC: u64 = 0x12;
const DW_AT_PRODUCER: u64 = 0x25;
const DW_AT_LOCATION: u64 = 0x02;
const DW_FORM_ADDR: u64 = 0x01;
const DW_FORM_DATA8: u64 = 0x07;
const DW_FORM_STRP: u64 = 0x0e;
const DW_FORM_EXPRLOC: u64 = 0x18;
const DW_OP_FBREG: u8 = 0x91;

fn uleb(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut b = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        out.push(b);
        if v == 0 {
            break;
        }
    }
}

fn sleb(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        let sign = b & 0x40 != 0;
        if (v == 0 && !sign) || (v == -1 && sign) {
            out.push(b);
            break;
        }
        out.push(b | 0x80);
    }
}

/// Interned `.debug_str` builder: offset per string.
#[derive(Default)]
struct StrSection {
    bytes: Vec<u8>,
    offsets: std::collections::HashMap<String, u32>,
}

impl StrSection {
    fn offset_of(&mut self, s: &str) -> u32 {
        if let Some(&o) = self.offsets.get(s) {
            return o;
        }
        let o = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(s.to_string(), o);
        o
    }
}

pub fn append_debug_sections(builder: &mut ObjectBuilder<'_>, module: &CodeModule) {
    let mut strs = StrSection::default();

    // Abbreviations: 1 = compile unit, 2 = subprogram, 3 = variable.
    let mut abbrev = Vec::new();
    uleb(&mut abbrev, 1);
    uleb(&mut abbrev, DW_TAG_COMPILE_UNIT);
    abbrev.push(1); // has children
    for (at, form) in [
        (DW_AT_PRODUCER, DW_FORM_STRP),
        (DW_AT_NAME, DW_FORM_STRP),
        (DW_AT_LOW_PC, DW_FORM_ADDR),
        (DW_AT_HIGH_PC, DW_FORM_DATA8),
    ] {
        uleb(&mut abbrev, at);
        uleb(&mut abbrev, form);
    }
    uleb(&mut abbrev, 0);
    uleb(&mut abbrev, 0);

    uleb(&mut abbrev, 2);
    uleb(&mut abbrev, DW_TAG_SUBPROGRAM);
    abbrev.push(1);
    for (at, form) in [
        (DW_AT_NAME, DW_FORM_STRP),
        (DW_AT_LOW_PC, DW_FORM_ADDR),
        (DW_AT_HIGH_PC, DW_FORM_DATA8),
    ] {
        uleb(&mut abbrev, at);
        uleb(&mut abbrev, form);
    }
    uleb(&mut abbrev, 0);
    uleb(&mut abbrev, 0);

    uleb(&mut abbrev, 3);
    uleb(&mut abbrev, DW_TAG_VARIABLE);
    abbrev.push(0); // no children
    for (at, form) in [(DW_AT_NAME, DW_FORM_STRP), (DW_AT_LOCATION, DW_FORM_EXPRLOC)] {
        uleb(&mut abbrev, at);
        uleb(&mut abbrev, form);
    }
    uleb(&mut abbrev, 0);
    uleb(&mut abbrev, 0);
    abbrev.push(0); // end of abbreviations

    // .debug_info: CU DIE, one subprogram per function, variables nested.
    let mut info = Vec::new();
    let mut info_relocs: Vec<(u64, crate::strings::StrId)> = Vec::new();
    // Header: length (patched), version, abbrev offset, address size.
    info.extend_from_slice(&0u32.to_le_bytes());
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&0u32.to_le_bytes());
    info.push(8);

    uleb(&mut info, 1); // CU abbrev
    let producer = strs.offset_of("bolt C++ compiler");
    info.extend_from_slice(&producer.to_le_bytes());
    let cu_name = strs.offset_of("translation unit");
    info.extend_from_slice(&cu_name.to_le_bytes());
    info.extend_from_slice(&0u64.to_le_bytes()); // low_pc (text base)
    info.extend_from_slice(&(module.text.len() as u64).to_le_bytes());

    for f in &module.functions {
        uleb(&mut info, 2);
        let name = strs.offset_of(builder.strings.resolve(f.display_name));
        info.extend_from_slice(&name.to_le_bytes());
        // low_pc: address of the function symbol.
        info_relocs.push((info.len() as u64, f.name));
        info.extend_from_slice(&0u64.to_le_bytes());
        info.extend_from_slice(&f.size.to_le_bytes());
        for v in &f.local_vars {
            uleb(&mut info, 3);
            let vname = strs.offset_of(builder.strings.resolve(v.name));
            info.extend_from_slice(&vname.to_le_bytes());
            // DW_OP_fbreg <sleb offset>
            let mut expr = vec![DW_OP_FBREG];
            sleb(&mut expr, v.frame_offset as i64);
            uleb(&mut info, expr.len() as u64);
            info.extend_from_slice(&expr);
        }
        uleb(&mut info, 0); // end of subprogram children
    }
    uleb(&mut info, 0); // end of CU children
    let len = (info.len() - 4) as u32;
    info[0..4].copy_from_slice(&len.to_le_bytes());

    // .debug_line: v4 header, directory/file tables, then a simple
    // program per function: set address (via reloc-free advances from the
    // section base), advance line, copy.
    let mut line = Vec::new();
    line.extend_from_slice(&0u32.to_le_bytes()); // unit length (patched)
    line.extend_from_slice(&4u16.to_le_bytes()); // version
    let header_len_pos = line.len();
    line.extend_from_slice(&0u32.to_le_bytes()); // header length (patched)
    line.push(1); // min instruction length
    line.push(1); // max ops per instruction
    line.push(1); // default is_stmt
    line.push((-5i8) as u8); // line base
    line.push(14); // line range
    line.push(13); // opcode base
    for n in [0u8, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1] {
        line.push(n); // standard opcode lengths
    }
    line.push(0); // empty include directories
    // File table: unique files from the line mappings.
    let mut files: Vec<String> = Vec::new();
    for f in &module.functions {
        for m in &f.lines {
            let name = builder.strings.resolve(m.file).to_string();
            if !files.contains(&name) {
                files.push(name);
            }
        }
    }
    for name in &files {
        line.extend_from_slice(name.as_bytes());
        line.push(0);
        uleb(&mut line, 0); // dir index
        uleb(&mut line, 0); // mtime
        uleb(&mut line, 0); // length
    }
    line.push(0); // end of file table
    let header_len = (line.len() - header_len_pos - 4) as u32;
    line[header_len_pos..header_len_pos + 4].copy_from_slice(&header_len.to_le_bytes());

    for f in &module.functions {
        let mut pc = 0u64;
        let mut ln = 1i64;
        for m in &f.lines {
            let target_pc = f.offset + m.code_offset as u64;
            if target_pc > pc {
                line.push(2); // DW_LNS_advance_pc
                uleb(&mut line, target_pc - pc);
                pc = target_pc;
            }
            let target_line = (m.line + 1) as i64;
            if target_line != ln {
                line.push(3); // DW_LNS_advance_line
                sleb(&mut line, target_line - ln);
                ln = target_line;
            }
            line.push(1); // DW_LNS_copy
        }
    }
    // End sequence.
    line.push(0);
    uleb(&mut line, 1);
    line.push(1); // DW_LNE_end_sequence
    let total = (line.len() - 4) as u32;
    line[0..4].copy_from_slice(&total.to_le_bytes());

    let debug_flags = SectionFlags {
        alloc: false,
        write: false,
        exec: false,
        nobits: false,
    };
    let abbrev_idx = builder.add_section(Section {
        name: ".debug_abbrev".into(),
        flags: debug_flags,
        payload: abbrev,
        alignment: 1,
        bss_size: 0,
    });
    let _ = abbrev_idx;
    let info_idx = builder.add_section(Section {
        name: ".debug_info".into(),
        flags: debug_flags,
        payload: info,
        alignment: 1,
        bss_size: 0,
    });
    for (off, sym) in info_relocs {
        builder.relocs.push(ObjReloc {
            section: info_idx,
            offset: off,
            symbol: sym,
            kind: RelocKind::Abs64,
            addend: 0,
        });
    }
    builder.add_section(Section {
        name: ".debug_line".into(),
        flags: debug_flags,
        payload: line,
        alignment: 1,
        bss_size: 0,
    });
    builder.add_section(Section {
        name: ".debug_str".into(),
        flags: debug_flags,
        payload: strs.bytes,
        alignment: 1,
        bss_size: 0,
    });
}

/// `.eh_frame`: one CIE, one FDE per function describing the standard
/// rbp-frame prologue from the recorded CFI steps, plus a
/// `.gcc_except_table` when any function has try-regions.
pub fn append_eh_frame(builder: &mut ObjectBuilder<'_>, module: &CodeModule) {
    let mut eh = Vec::new();

    // CIE.
    let cie_start = eh.len();
    eh.extend_from_slice(&0u32.to_le_bytes()); // length (patched)
    eh.extend_from_slice(&0u32.to_le_bytes()); // CIE id
    eh.push(1); // version
    eh.extend_from_slice(b"zR\0");
    uleb(&mut eh, 1); // code alignment
    sleb(&mut eh, -8); // data alignment
    uleb(&mut eh, 16); // return address register (RIP)
    uleb(&mut eh, 1); // augmentation data length
    eh.push(0x1b); // FDE encoding: pcrel | sdata4
    // Initial CFI: CFA = rsp+8, RA at CFA-8.
    eh.push(0x0c); // DW_CFA_def_cfa
    uleb(&mut eh, 7); // rsp
    uleb(&mut eh, 8);
    eh.push(0x80 | 16); // DW_CFA_offset r16
    uleb(&mut eh, 1);
    while (eh.len() - cie_start) % 8 != 0 {
        eh.push(0); // DW_CFA_nop padding
    }
    let cie_len = (eh.len() - cie_start - 4) as u32;
    eh[cie_start..cie_start + 4].copy_from_slice(&cie_len.to_le_bytes());

    let mut fde_relocs: Vec<(u64, crate::strings::StrId)> = Vec::new();
    for f in &module.functions {
        let fde_start = eh.len();
        eh.extend_from_slice(&0u32.to_le_bytes()); // length (patched)
        let cie_ptr = (eh.len() - cie_start) as u32;
        eh.extend_from_slice(&cie_ptr.to_le_bytes());
        // Initial location: pcrel against the function symbol.
        fde_relocs.push((eh.len() as u64, f.name));
        eh.extend_from_slice(&0i32.to_le_bytes());
        eh.extend_from_slice(&(f.size as u32).to_le_bytes());
        uleb(&mut eh, 0); // augmentation data length
        // Prologue: push rbp → CFA rsp+16, rbp saved; mov rbp,rsp →
        // CFA rbp+16; sub rsp keeps the rbp-based CFA.
        let mut last = 0u32;
        for step in &f.cfi {
            match step {
                CfiStep::PushRbp { offset } => {
                    advance_loc(&mut eh, *offset - last);
                    last = *offset;
                    eh.push(0x0e); // DW_CFA_def_cfa_offset
                    uleb(&mut eh, 16);
                    eh.push(0x80 | 6); // DW_CFA_offset rbp
                    uleb(&mut eh, 2);
                }
                CfiStep::MovRspRbp { offset } => {
                    advance_loc(&mut eh, *offset - last);
                    last = *offset;
                    eh.push(0x0d); // DW_CFA_def_cfa_register
                    uleb(&mut eh, 6); // rbp
                }
                CfiStep::SubRsp { offset, .. } => {
                    advance_loc(&mut eh, *offset - last);
                    last = *offset;
                }
                CfiStep::PopRbp { offset } => {
                    advance_loc(&mut eh, *offset - last);
                    last = *offset;
                    eh.push(0x0c);
                    uleb(&mut eh, 7);
                    uleb(&mut eh, 8);
                }
            }
        }
        while (eh.len() - fde_start) % 8 != 0 {
            eh.push(0);
        }
        let fde_len = (eh.len() - fde_start - 4) as u32;
        eh[fde_start..fde_start + 4].copy_from_slice(&fde_len.to_le_bytes());
    }
    eh.extend_from_slice(&0u32.to_le_bytes()); // terminator

    let idx = builder.add_section(Section {
        name: ".eh_frame".into(),
        flags: SectionFlags {
            alloc: true,
            write: false,
            exec: false,
            nobits: false,
        },
        payload: eh,
        alignment: 8,
        bss_size: 0,
    });
    for (off, sym) in fde_relocs {
        builder.relocs.push(ObjReloc {
            section: idx,
            offset: off,
            symbol: sym,
            kind: RelocKind::Pc32,
            addend: 0,
        });
    }

    // Action table driving catch-type matching, one entry per region.
    let has_eh = module.functions.iter().any(|f| !f.eh_regions.is_empty());
    if has_eh {
        let mut lsda = Vec::new();
        for f in &module.functions {
            for region in &f.eh_regions {
                uleb(&mut lsda, region.start as u64);
                uleb(&mut lsda, (region.end - region.start) as u64);
                uleb(&mut lsda, region.handler_offsets.len() as u64);
                for &h in &region.handler_offsets {
                    uleb(&mut lsda, h as u64);
                }
            }
        }
        builder.add_section(Section {
            name: ".gcc_except_table".into(),
            flags: SectionFlags {
                alloc: true,
                write: false,
                exec: false,
                nobits: false,
            },
            payload: lsda,
            alignment: 4,
            bss_size: 0,
        });
    }
}

fn advance_loc(out: &mut Vec<u8>, delta: u32) {
    if delta == 0 {
        return;
    }
    if delta < 0x40 {
        out.push(0x40 | delta as u8); // DW_CFA_advance_loc
    } else if delta <= 0xff {
        out.push(0x02); // DW_CFA_advance_loc1
        out.push(delta as u8);
    } else {
        out.push(0x03); // DW_CFA_advance_loc2
        out.extend_from_slice(&(delta as u16).to_le_bytes());
    }
}
