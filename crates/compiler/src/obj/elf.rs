//! ELF64 relocatable object serialization
//!
//! Layout: ELF header, section payloads, `.symtab`, `.strtab`,
//! `.rela.<sec>` tables, `.shstrtab`, then the section header table.
//! Relocation kinds map to `R_X86_64_PC32`, `R_X86_64_PLT32`,
//! `R_X86_64_64`, `R_X86_64_32`.

use super::{ObjReloc, ObjectBuilder, SymBinding, align_up};
use crate::codegen::emit::RelocKind;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_32: u32 = 10;

fn r_type(kind: RelocKind) -> u32 {
    match kind {
        RelocKind::Pc32 => R_X86_64_PC32,
        RelocKind::Plt32 => R_X86_64_PLT32,
        RelocKind::Abs64 => R_X86_64_64,
        RelocKind::Abs32 => R_X86_64_32,
    }
}

struct OutSection {
    name: String,
    sh_type: u32,
    flags: u64,
    payload: Vec<u8>,
    size_override: Option<u64>,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

pub fn write(builder: &ObjectBuilder<'_>) -> Vec<u8> {
    // String table for symbols.
    let mut strtab: Vec<u8> = vec![0];
    let mut sym_name_off = Vec::new();
    for s in &builder.symbols {
        sym_name_off.push(strtab.len() as u32);
        strtab.extend_from_slice(builder.strings.resolve(s.name).as_bytes());
        strtab.push(0);
    }

    // Symbol table: null, locals first, then globals/weak (ELF requires
    // locals before non-locals; sh_info = index of first non-local).
    let mut order: Vec<usize> = (0..builder.symbols.len()).collect();
    order.sort_by_key(|&i| builder.symbols[i].binding != SymBinding::Local);
    let first_nonlocal = 1 + order
        .iter()
        .take_while(|&&i| builder.symbols[i].binding == SymBinding::Local)
        .count() as u32;
    // symbol index (in final table) per original index
    let mut final_index = vec![0u32; builder.symbols.len()];
    for (pos, &orig) in order.iter().enumerate() {
        final_index[orig] = (pos + 1) as u32;
    }

    let mut symtab: Vec<u8> = vec![0; 24]; // null symbol
    for &orig in &order {
        let s = &builder.symbols[orig];
        let bind: u8 = match s.binding {
            SymBinding::Local => 0,
            SymBinding::Global => 1,
            SymBinding::Weak => 2,
        };
        let typ: u8 = if s.section.is_none() {
            0
        } else if s.is_func {
            2 // STT_FUNC
        } else {
            1 // STT_OBJECT
        };
        let shndx: u16 = match s.section {
            // +1 for the null section header.
            Some(sec) => (sec + 1) as u16,
            None => 0, // SHN_UNDEF
        };
        symtab.extend_from_slice(&sym_name_off[orig].to_le_bytes());
        symtab.push((bind << 4) | typ);
        symtab.push(0); // st_other / visibility default
        symtab.extend_from_slice(&shndx.to_le_bytes());
        symtab.extend_from_slice(&s.offset.to_le_bytes());
        symtab.extend_from_slice(&s.size.to_le_bytes());
    }

    // Build the output section list: model sections, then symtab/strtab,
    // then one .rela per section with relocations.
    let mut out: Vec<OutSection> = Vec::new();
    for s in &builder.sections {
        let mut flags = 0u64;
        if s.flags.alloc {
            flags |= SHF_ALLOC;
        }
        if s.flags.write {
            flags |= SHF_WRITE;
        }
        if s.flags.exec {
            flags |= SHF_EXECINSTR;
        }
        out.push(OutSection {
            name: s.name.clone(),
            sh_type: if s.flags.nobits { SHT_NOBITS } else { SHT_PROGBITS },
            flags,
            payload: s.payload.clone(),
            size_override: if s.flags.nobits { Some(s.bss_size) } else { None },
            link: 0,
            info: 0,
            align: s.alignment,
            entsize: 0,
        });
    }

    let symtab_index = out.len() as u32 + 1; // +1 for null header
    out.push(OutSection {
        name: ".symtab".into(),
        sh_type: SHT_SYMTAB,
        flags: 0,
        payload: symtab,
        size_override: None,
        link: symtab_index + 1, // .strtab follows
        info: first_nonlocal,
        align: 8,
        entsize: 24,
    });
    out.push(OutSection {
        name: ".strtab".into(),
        sh_type: SHT_STRTAB,
        flags: 0,
        payload: strtab,
        size_override: None,
        link: 0,
        info: 0,
        align: 1,
        entsize: 0,
    });

    // Relocation sections.
    let symbol_index = |name: crate::strings::StrId| -> u32 {
        builder
            .symbols
            .iter()
            .position(|s| s.name == name)
            .map(|i| final_index[i])
            .unwrap_or(0)
    };
    for (sec_i, sec) in builder.sections.iter().enumerate() {
        let rels: Vec<&ObjReloc> = builder
            .relocs
            .iter()
            .filter(|r| r.section == sec_i)
            .collect();
        if rels.is_empty() {
            continue;
        }
        let mut payload = Vec::with_capacity(rels.len() * 24);
        for r in rels {
            payload.extend_from_slice(&r.offset.to_le_bytes());
            let info = ((symbol_index(r.symbol) as u64) << 32) | r_type(r.kind) as u64;
            payload.extend_from_slice(&info.to_le_bytes());
            payload.extend_from_slice(&r.addend.to_le_bytes());
        }
        out.push(OutSection {
            name: format!(".rela{}", sec.name),
            sh_type: SHT_RELA,
            flags: 0,
            payload,
            size_override: None,
            link: symtab_index,
            info: (sec_i + 1) as u32,
            align: 8,
            entsize: 24,
        });
    }

    // Section-header string table.
    let mut shstrtab: Vec<u8> = vec![0];
    let mut name_offs = Vec::new();
    for s in &out {
        name_offs.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(s.name.as_bytes());
        shstrtab.push(0);
    }
    let shstr_name_off = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");
    out.push(OutSection {
        name: ".shstrtab".into(),
        sh_type: SHT_STRTAB,
        flags: 0,
        payload: shstrtab,
        size_override: None,
        link: 0,
        info: 0,
        align: 1,
        entsize: 0,
    });
    name_offs.push(shstr_name_off);

    // Lay out payloads after the ELF header.
    let ehsize = 64u64;
    let mut offset = ehsize;
    let mut file_offsets = Vec::new();
    for s in &out {
        offset = align_up(offset, s.align.max(1));
        file_offsets.push(offset);
        if s.sh_type != SHT_NOBITS {
            offset += s.payload.len() as u64;
        }
    }
    let shoff = align_up(offset, 8);
    let shnum = (out.len() + 1) as u16;
    let shstrndx = out.len() as u16; // last section

    let mut bytes = Vec::with_capacity(shoff as usize + (shnum as usize) * 64);
    // ELF header.
    bytes.extend_from_slice(b"\x7fELF");
    bytes.push(2); // ELFCLASS64
    bytes.push(1); // ELFDATA2LSB
    bytes.push(1); // EV_CURRENT
    bytes.extend_from_slice(&[0; 9]);
    bytes.extend_from_slice(&1u16.to_le_bytes()); // ET_REL
    bytes.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    bytes.extend_from_slice(&1u32.to_le_bytes()); // version
    bytes.extend_from_slice(&0u64.to_le_bytes()); // entry
    bytes.extend_from_slice(&0u64.to_le_bytes()); // phoff
    bytes.extend_from_slice(&shoff.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
    bytes.extend_from_slice(&64u16.to_le_bytes()); // ehsize
    bytes.extend_from_slice(&0u16.to_le_bytes()); // phentsize
    bytes.extend_from_slice(&0u16.to_le_bytes()); // phnum
    bytes.extend_from_slice(&64u16.to_le_bytes()); // shentsize
    bytes.extend_from_slice(&shnum.to_le_bytes());
    bytes.extend_from_slice(&shstrndx.to_le_bytes());

    // Payloads.
    for (s, &off) in out.iter().zip(&file_offsets) {
        while (bytes.len() as u64) < off {
            bytes.push(0);
        }
        if s.sh_type != SHT_NOBITS {
            bytes.extend_from_slice(&s.payload);
        }
    }
    while (bytes.len() as u64) < shoff {
        bytes.push(0);
    }

    // Section header table: null header first.
    bytes.extend_from_slice(&[0u8; 64]);
    for (i, s) in out.iter().enumerate() {
        let size = s
            .size_override
            .unwrap_or(s.payload.len() as u64);
        bytes.extend_from_slice(&name_offs[i].to_le_bytes());
        bytes.extend_from_slice(&s.sh_type.to_le_bytes());
        bytes.extend_from_slice(&s.flags.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes()); // addr
        bytes.extend_from_slice(&file_offsets[i].to_le_bytes());
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&s.link.to_le_bytes());
        bytes.extend_from_slice(&s.info.to_le_bytes());
        bytes.extend_from_slice(&s.align.to_le_bytes());
        bytes.extend_from_slice(&s.entsize.to_le_bytes());
    }
    bytes
}
