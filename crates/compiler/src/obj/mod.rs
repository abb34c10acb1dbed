//! Object-file model and writers
//!
//! The target-independent model is sections, relocations and a symbol
//! table; [`ObjectBuilder`] populates it from the code module and the
//! lowered side tables (globals, vtables, RTTI), and the `elf` / `coff`
//! writers serialize the container. Debug info is structured records
//! (DWARF DIEs or CodeView symbol records) serialized with cross-record
//! offsets tracked by the emitters in `dwarf` / `codeview`.

pub mod codeview;
pub mod coff;
pub mod dwarf;
pub mod elf;

use crate::codegen::CodeModule;
use crate::codegen::emit::RelocKind;
use crate::config::TargetAbi;
use crate::lower::LowerOutput;
use crate::strings::{StrId, StringTable};

/// Section flags, target-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionFlags {
    pub alloc: bool,
    pub write: bool,
    pub exec: bool,
    /// No file payload (.bss).
    pub nobits: bool,
}

#[derive(Debug)]
pub struct Section {
    pub name: String,
    pub flags: SectionFlags,
    pub payload: Vec<u8>,
    pub alignment: u64,
    /// Virtual size for nobits sections.
    pub bss_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymBinding {
    Local,
    Global,
    Weak,
}

#[derive(Debug, Clone)]
pub struct SymbolDef {
    pub name: StrId,
    /// Index into the builder's section list; `None` for undefined
    /// (external) symbols.
    pub section: Option<usize>,
    pub offset: u64,
    pub size: u64,
    pub is_func: bool,
    pub binding: SymBinding,
}

#[derive(Debug, Clone)]
pub struct ObjReloc {
    pub section: usize,
    pub offset: u64,
    pub symbol: StrId,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Collects sections, symbols and relocations from the compiled module.
pub struct ObjectBuilder<'a> {
    pub strings: &'a StringTable,
    pub sections: Vec<Section>,
    pub symbols: Vec<SymbolDef>,
    pub relocs: Vec<ObjReloc>,
    pub text_index: usize,
    pub data_index: usize,
    pub rodata_index: usize,
    pub bss_index: usize,
}

impl<'a> ObjectBuilder<'a> {
    pub fn build(
        module: &CodeModule,
        lowered: &LowerOutput,
        strings: &'a mut StringTable,
        target: TargetAbi,
        debug_info: bool,
    ) -> ObjectBuilder<'a> {
        let (text_name, rodata_name) = match target {
            TargetAbi::LinuxElf => (".text", ".rodata"),
            TargetAbi::WindowsCoff => (".text$mn", ".rdata"),
        };
        let mut sections = vec![
            Section {
                name: text_name.to_string(),
                flags: SectionFlags {
                    alloc: true,
                    write: false,
                    exec: true,
                    nobits: false,
                },
                payload: module.text.clone(),
                alignment: 16,
                bss_size: 0,
            },
            Section {
                name: ".data".to_string(),
                flags: SectionFlags {
                    alloc: true,
                    write: true,
                    exec: false,
                    nobits: false,
                },
                payload: Vec::new(),
                alignment: 8,
                bss_size: 0,
            },
            Section {
                name: rodata_name.to_string(),
                flags: SectionFlags {
                    alloc: true,
                    write: false,
                    exec: false,
                    nobits: false,
                },
                payload: Vec::new(),
                alignment: 8,
                bss_size: 0,
            },
            Section {
                name: ".bss".to_string(),
                flags: SectionFlags {
                    alloc: true,
                    write: true,
                    exec: false,
                    nobits: true,
                },
                payload: Vec::new(),
                alignment: 8,
                bss_size: 0,
            },
        ];
        let (text_index, data_index, rodata_index, bss_index) = (0, 1, 2, 3);

        let mut symbols = Vec::new();
        let mut relocs = Vec::new();

        // Function symbols.
        for f in &module.functions {
            symbols.push(SymbolDef {
                name: f.name,
                section: Some(text_index),
                offset: f.offset,
                size: f.size,
                is_func: true,
                binding: if f.weak {
                    SymBinding::Weak
                } else {
                    SymBinding::Global
                },
            });
        }

        // Globals: initialized data / read-only strings / zero-filled bss.
        for g in &lowered.globals {
            let name = strings.resolve(g.name).to_string();
            let is_str = name.starts_with("__str_");
            if is_str {
                let sec = &mut sections[rodata_index];
                let off = align_up(sec.payload.len() as u64, g.align.max(1));
                sec.payload.resize(off as usize, 0);
                sec.payload.extend_from_slice(&g.init);
                symbols.push(SymbolDef {
                    name: g.name,
                    section: Some(rodata_index),
                    offset: off,
                    size: g.size,
                    is_func: false,
                    binding: SymBinding::Local,
                });
            } else if g.init.iter().all(|&b| b == 0) {
                let sec = &mut sections[bss_index];
                let off = align_up(sec.bss_size, g.align.max(1));
                sec.bss_size = off + g.size;
                symbols.push(SymbolDef {
                    name: g.name,
                    section: Some(bss_index),
                    offset: off,
                    size: g.size,
                    is_func: false,
                    binding: if g.weak {
                        SymBinding::Weak
                    } else {
                        SymBinding::Global
                    },
                });
            } else {
                let sec = &mut sections[data_index];
                let off = align_up(sec.payload.len() as u64, g.align.max(1));
                sec.payload.resize(off as usize, 0);
                sec.payload.extend_from_slice(&g.init);
                symbols.push(SymbolDef {
                    name: g.name,
                    section: Some(data_index),
                    offset: off,
                    size: g.size,
                    is_func: false,
                    binding: if g.weak {
                        SymBinding::Weak
                    } else {
                        SymBinding::Global
                    },
                });
            }
        }

        // Vtables: one pointer per slot, absolute relocations to methods.
        for vt in &lowered.vtables {
            let sec = &mut sections[rodata_index];
            let off = align_up(sec.payload.len() as u64, 8);
            sec.payload.resize(off as usize, 0);
            for (i, &slot) in vt.slots.iter().enumerate() {
                relocs.push(ObjReloc {
                    section: rodata_index,
                    offset: off + (i as u64) * 8,
                    symbol: slot,
                    kind: RelocKind::Abs64,
                    addend: 0,
                });
                sec.payload.extend_from_slice(&0u64.to_le_bytes());
            }
            symbols.push(SymbolDef {
                name: vt.symbol,
                section: Some(rodata_index),
                offset: off,
                size: (vt.slots.len() as u64) * 8,
                is_func: false,
                binding: SymBinding::Weak,
            });
        }

        // RTTI records: {name-hash u64, num-bases u64, base-ptrs...}.
        for r in &lowered.rtti {
            let sec = &mut sections[rodata_index];
            let off = align_up(sec.payload.len() as u64, 8);
            sec.payload.resize(off as usize, 0);
            sec.payload.extend_from_slice(&r.name_hash.to_le_bytes());
            sec.payload
                .extend_from_slice(&(r.base_symbols.len() as u64).to_le_bytes());
            for (i, &b) in r.base_symbols.iter().enumerate() {
                relocs.push(ObjReloc {
                    section: rodata_index,
                    offset: off + 16 + (i as u64) * 8,
                    symbol: b,
                    kind: RelocKind::Abs64,
                    addend: 0,
                });
                sec.payload.extend_from_slice(&0u64.to_le_bytes());
            }
            symbols.push(SymbolDef {
                name: r.symbol,
                section: Some(rodata_index),
                offset: off,
                size: 16 + (r.base_symbols.len() as u64) * 8,
                is_func: false,
                binding: SymBinding::Weak,
            });
        }

        // Code relocations target .text.
        for r in &module.relocs {
            relocs.push(ObjReloc {
                section: text_index,
                offset: r.offset,
                symbol: r.symbol,
                kind: r.kind,
                addend: r.addend,
            });
        }

        // Undefined symbols: every reloc target not defined here (runtime
        // helpers, memcpy, the personality routine).
        for r in &relocs {
            if !symbols.iter().any(|s| s.name == r.symbol) {
                symbols.push(SymbolDef {
                    name: r.symbol,
                    section: None,
                    offset: 0,
                    size: 0,
                    is_func: true,
                    binding: SymBinding::Global,
                });
            }
        }
        // De-duplicate undefined entries.
        let mut seen = std::collections::HashSet::new();
        symbols.retain(|s| seen.insert((s.name, s.section.is_none())));

        let mut builder = ObjectBuilder {
            strings,
            sections,
            symbols,
            relocs,
            text_index,
            data_index,
            rodata_index,
            bss_index,
        };

        if debug_info {
            match target {
                TargetAbi::LinuxElf => dwarf::append_debug_sections(&mut builder, module),
                TargetAbi::WindowsCoff => codeview::append_debug_sections(&mut builder, module),
            }
        }
        match target {
            TargetAbi::LinuxElf => dwarf::append_eh_frame(&mut builder, module),
            TargetAbi::WindowsCoff => codeview::append_unwind_sections(&mut builder, module),
        }

        builder
    }

    pub fn add_section(&mut self, section: Section) -> usize {
        self.sections.push(section);
        self.sections.len() - 1
    }

    /// Serialize the container for the selected target.
    pub fn write(&self, target: TargetAbi) -> Vec<u8> {
        match target {
            TargetAbi::LinuxElf => elf::write(self),
            TargetAbi::WindowsCoff => coff::write(self),
        }
    }
}

pub(crate) fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    v.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::lexer::Lexer;
    use crate::lower::Lowerer;
    use crate::parser::Parser;
    use crate::types::TypeRegistry;

    pub(super) fn build_object(src: &str, target: TargetAbi) -> Vec<u8> {
        let mut strings = StringTable::new();
        let file = strings.intern("t.cpp");
        let toks = Lexer::new(src, file).lex().unwrap();
        let out = Parser::new(toks, &mut strings).parse();
        assert!(out.diags.is_empty(), "parse: {:?}", out.diags);
        let mut arena = out.arena;
        let mut registry = out.registry;
        let config = CompilerConfig {
            target,
            debug_info: true,
            ..CompilerConfig::default()
        };
        let mut types = TypeRegistry::new(target == TargetAbi::LinuxElf);
        let lowered = Lowerer::new(
            &mut arena,
            &mut strings,
            &mut types,
            &mut registry,
            &config,
        )
        .lower_translation_unit(out.root);
        assert!(lowered.diags.is_empty(), "lower: {:?}", lowered.diags);
        let mut generator = crate::codegen::CodeGenerator::new(&types, &mut strings, target);
        let module = generator.generate(&lowered).unwrap();
        let builder = ObjectBuilder::build(&module, &lowered, &mut strings, target, true);
        builder.write(target)
    }

    #[test]
    fn test_elf_magic_and_type() {
        let bytes = build_object("int main() { return 0; }", TargetAbi::LinuxElf);
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], 2); // ELFCLASS64
        assert_eq!(bytes[5], 1); // little-endian
        // e_type == ET_REL
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 1);
        // e_machine == EM_X86_64
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 62);
    }

    #[test]
    fn test_coff_machine() {
        let bytes = build_object("int main() { return 0; }", TargetAbi::WindowsCoff);
        // IMAGE_FILE_MACHINE_AMD64
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 0x8664);
        let nsections = u16::from_le_bytes([bytes[2], bytes[3]]);
        assert!(nsections >= 4);
    }

    #[test]
    fn test_vtable_and_rtti_in_object() {
        let bytes = build_object(
            "struct Base { virtual int get() { return 1; } virtual ~Base() {} };\n\
             int main() { return 0; }",
            TargetAbi::LinuxElf,
        );
        // The vtable symbol name appears in the string table bytes.
        let hay = String::from_utf8_lossy(&bytes);
        assert!(hay.contains("__vt_Base"), "vtable symbol missing");
        assert!(hay.contains("__rtti_Base"), "rtti symbol missing");
    }

    #[test]
    fn test_external_runtime_symbols_are_undefined() {
        let bytes = build_object(
            "int f() { int* p = new int; delete p; return 0; }",
            TargetAbi::LinuxElf,
        );
        let hay = String::from_utf8_lossy(&bytes);
        assert!(hay.contains("_Znwm"), "operator new symbol missing");
        assert!(hay.contains("_ZdlPv"), "operator delete symbol missing");
    }

    #[test]
    fn test_debug_sections_present_when_requested() {
        let bytes = build_object("int main() { int x = 1; return x; }", TargetAbi::LinuxElf);
        let hay = String::from_utf8_lossy(&bytes);
        assert!(hay.contains(".debug_info"));
        assert!(hay.contains(".debug_line"));
        assert!(hay.contains(".debug_abbrev"));
        assert!(hay.contains(".eh_frame"));
    }

    #[test]
    fn test_codeview_sections_on_windows() {
        let bytes = build_object("int main() { return 0; }", TargetAbi::WindowsCoff);
        let hay = String::from_utf8_lossy(&bytes);
        assert!(hay.contains(".debug$S"));
        assert!(hay.contains(".debug$T"));
        assert!(hay.contains(".pdata"));
        assert!(hay.contains(".xdata"));
    }
}
