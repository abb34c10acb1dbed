//! COFF (x86-64) relocatable object serialization
//!
//! IMAGE_FILE_HEADER, section table, raw data with per-section relocation
//! lists, then the symbol table and string table. Relocation kinds map to
//! `IMAGE_REL_AMD64_REL32`, `IMAGE_REL_AMD64_ADDR64`,
//! `IMAGE_REL_AMD64_ADDR32NB`.

use super::{ObjectBuilder, SymBinding};
use crate::codegen::emit::RelocKind;

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

const IMAGE_REL_AMD64_ADDR64: u16 = 0x0001;
const IMAGE_REL_AMD64_ADDR32NB: u16 = 0x0003;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;

const IMAGE_SCN_CNT_CODE: u32 = 0x20;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x40;
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x80;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

fn reloc_type(kind: RelocKind) -> u16 {
    match kind {
        RelocKind::Pc32 | RelocKind::Plt32 => IMAGE_REL_AMD64_REL32,
        RelocKind::Abs64 => IMAGE_REL_AMD64_ADDR64,
        RelocKind::Abs32 => IMAGE_REL_AMD64_ADDR32NB,
    }
}

pub fn write(builder: &ObjectBuilder<'_>) -> Vec<u8> {
    let nsections = builder.sections.len() as u16;
    let header_size = 20usize;
    let section_table_size = 40 * builder.sections.len();

    // Raw data layout after headers.
    let mut data_offsets = Vec::new();
    let mut reloc_offsets = Vec::new();
    let mut cursor = (header_size + section_table_size) as u32;
    for (i, s) in builder.sections.iter().enumerate() {
        if s.flags.nobits {
            data_offsets.push(0u32);
        } else {
            data_offsets.push(cursor);
            cursor += s.payload.len() as u32;
        }
        let nrel = builder.relocs.iter().filter(|r| r.section == i).count() as u32;
        if nrel > 0 {
            reloc_offsets.push(cursor);
            cursor += nrel * 10;
        } else {
            reloc_offsets.push(0);
        }
    }
    let symtab_offset = cursor;

    // Symbol table entries are 18 bytes; long names spill into the string
    // table that immediately follows.
    let mut strtab: Vec<u8> = vec![0, 0, 0, 0]; // length prefix patched last
    let mut sym_entries: Vec<[u8; 18]> = Vec::new();
    let symbol_index = |name: crate::strings::StrId| -> u32 {
        builder
            .symbols
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32)
            .unwrap_or(0)
    };
    for s in &builder.symbols {
        let mut e = [0u8; 18];
        let name = builder.strings.resolve(s.name);
        if name.len() <= 8 {
            e[..name.len()].copy_from_slice(name.as_bytes());
        } else {
            // Zeroes + offset into string table.
            let off = (strtab.len()) as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            e[4..8].copy_from_slice(&off.to_le_bytes());
        }
        let value = (s.offset as u32).to_le_bytes();
        e[8..12].copy_from_slice(&value);
        let secnum: i16 = match s.section {
            Some(idx) => (idx + 1) as i16,
            None => 0,
        };
        e[12..14].copy_from_slice(&secnum.to_le_bytes());
        // Type: 0x20 marks a function.
        let ty: u16 = if s.is_func { 0x20 } else { 0 };
        e[14..16].copy_from_slice(&ty.to_le_bytes());
        // Storage class: external (2) or static (3). Weak symbols keep
        // external class; linkers fold them via COMDAT in full toolchains.
        e[16] = match s.binding {
            SymBinding::Local => 3,
            _ => 2,
        };
        e[17] = 0; // aux count
        sym_entries.push(e);
    }
    let strtab_len = strtab.len() as u32;
    strtab[0..4].copy_from_slice(&strtab_len.to_le_bytes());

    let mut bytes = Vec::new();
    // IMAGE_FILE_HEADER.
    bytes.extend_from_slice(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
    bytes.extend_from_slice(&nsections.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    bytes.extend_from_slice(&symtab_offset.to_le_bytes());
    bytes.extend_from_slice(&(builder.symbols.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes()); // optional header size
    bytes.extend_from_slice(&0u16.to_le_bytes()); // characteristics

    // Section table.
    for (i, s) in builder.sections.iter().enumerate() {
        let mut name_field = [0u8; 8];
        let n = s.name.as_bytes();
        name_field[..n.len().min(8)].copy_from_slice(&n[..n.len().min(8)]);
        bytes.extend_from_slice(&name_field);
        let vsize = if s.flags.nobits {
            s.bss_size as u32
        } else {
            s.payload.len() as u32
        };
        bytes.extend_from_slice(&vsize.to_le_bytes()); // virtual size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // virtual address
        let raw_size = if s.flags.nobits {
            0
        } else {
            s.payload.len() as u32
        };
        bytes.extend_from_slice(&raw_size.to_le_bytes());
        bytes.extend_from_slice(&data_offsets[i].to_le_bytes());
        bytes.extend_from_slice(&reloc_offsets[i].to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // line numbers
        let nrel = builder.relocs.iter().filter(|r| r.section == i).count() as u16;
        bytes.extend_from_slice(&nrel.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // line number count
        let mut chars = IMAGE_SCN_MEM_READ;
        if s.flags.exec {
            chars |= IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE;
        } else if s.flags.nobits {
            chars |= IMAGE_SCN_CNT_UNINITIALIZED_DATA;
        } else {
            chars |= IMAGE_SCN_CNT_INITIALIZED_DATA;
        }
        if s.flags.write {
            chars |= IMAGE_SCN_MEM_WRITE;
        }
        bytes.extend_from_slice(&chars.to_le_bytes());
    }

    // Raw data + relocations.
    for (i, s) in builder.sections.iter().enumerate() {
        if !s.flags.nobits {
            debug_assert_eq!(bytes.len() as u32, data_offsets[i]);
            bytes.extend_from_slice(&s.payload);
        }
        let rels: Vec<_> = builder.relocs.iter().filter(|r| r.section == i).collect();
        for r in rels {
            bytes.extend_from_slice(&(r.offset as u32).to_le_bytes());
            bytes.extend_from_slice(&symbol_index(r.symbol).to_le_bytes());
            bytes.extend_from_slice(&reloc_type(r.kind).to_le_bytes());
        }
    }

    // Symbol table + string table.
    for e in &sym_entries {
        bytes.extend_from_slice(e);
    }
    bytes.extend_from_slice(&strtab);
    bytes
}
