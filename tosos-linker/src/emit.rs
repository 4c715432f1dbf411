//! Image emission: the native TOSELF loader format, and a PE image for
//! environments (UEFI) that need a PE-loadable binary instead.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::LinkerError;
use crate::model::{RelocationType, SectionKind};
use crate::resolve::LinkedImage;

pub const TOSELF_MAGIC: [u8; 7] = *b"TOSELF\0";

const HEADER_SIZE: u64 = 256;
const TRAMPOLINE_SIZE: u64 = 256;
const TRAMPOLINE_OFFSET: u64 = HEADER_SIZE;
const PAYLOAD_BASE: u64 = HEADER_SIZE + TRAMPOLINE_SIZE;

const OFF_JMP_OPCODE: usize = 0;
const OFF_JMP_DISPLACEMENT: usize = 1;
const OFF_MAGIC: usize = 5;
const OFF_TOTAL_SIZE: usize = 16;
const OFF_HEADER_VIRTUAL_ADDRESS: usize = 24;
const OFF_HEADER_PHYSICAL_ADDRESS: usize = 32;
const OFF_PROGRAM_OFFSET: usize = 40;
const OFF_PROGRAM_SIZE: usize = 48;
const OFF_PROGRAM_VIRTUAL_ADDRESS: usize = 56;
const OFF_STACK_SIZE: usize = 64;
const OFF_HEAP_SIZE: usize = 72;
const OFF_GOT_OFFSET: usize = 80;
const OFF_GOT_SIZE: usize = 88;
const OFF_GOT_VIRTUAL_ADDRESS: usize = 96;
const OFF_RELOCATION_TABLE_OFFSET: usize = 104;
const OFF_RELOCATION_TABLE_SIZE: usize = 112;
const OFF_METADATA_OFFSET: usize = 120;
const OFF_METADATA_SIZE: usize = 128;
const OFF_SYMBOL_TABLE_OFFSET: usize = 136;
const OFF_SYMBOL_TABLE_SIZE: usize = 144;
const OFF_ENTRY_VIRTUAL_ADDRESS: usize = 152;
const OFF_PAGE_TABLE_CONTEXT_ADDRESS: usize = 224;

/// Bit-exact TOSELF image header: a one-instruction jump trampoline at
/// offset 0 forwarding into the real trampoline code at offset 256, followed
/// by the fields a loader needs to map every image region without parsing
/// anything else.
pub struct TosElfHeader {
    pub total_size: u64,
    pub header_virtual_address: u64,
    pub header_physical_address: u64,
    pub program_offset: u64,
    pub program_size: u64,
    pub program_virtual_address: u64,
    pub stack_size: u64,
    pub heap_size: u64,
    pub got_offset: u64,
    pub got_size: u64,
    pub got_virtual_address: u64,
    pub relocation_table_offset: u64,
    pub relocation_table_size: u64,
    pub metadata_offset: u64,
    pub metadata_size: u64,
    pub symbol_table_offset: u64,
    pub symbol_table_size: u64,
    pub entry_virtual_address: u64,
    pub page_table_context_address: u64,
}

impl TosElfHeader {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];

        out[OFF_JMP_OPCODE] = 0xE9;
        let displacement = TRAMPOLINE_OFFSET as i64 - (OFF_JMP_DISPLACEMENT as i64 + 4);
        out[OFF_JMP_DISPLACEMENT..OFF_JMP_DISPLACEMENT + 4].copy_from_slice(&(displacement as i32).to_le_bytes());
        out[OFF_MAGIC..OFF_MAGIC + 7].copy_from_slice(&TOSELF_MAGIC);

        let mut put = |offset: usize, value: u64| out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        put(OFF_TOTAL_SIZE, self.total_size);
        put(OFF_HEADER_VIRTUAL_ADDRESS, self.header_virtual_address);
        put(OFF_HEADER_PHYSICAL_ADDRESS, self.header_physical_address);
        put(OFF_PROGRAM_OFFSET, self.program_offset);
        put(OFF_PROGRAM_SIZE, self.program_size);
        put(OFF_PROGRAM_VIRTUAL_ADDRESS, self.program_virtual_address);
        put(OFF_STACK_SIZE, self.stack_size);
        put(OFF_HEAP_SIZE, self.heap_size);
        put(OFF_GOT_OFFSET, self.got_offset);
        put(OFF_GOT_SIZE, self.got_size);
        put(OFF_GOT_VIRTUAL_ADDRESS, self.got_virtual_address);
        put(OFF_RELOCATION_TABLE_OFFSET, self.relocation_table_offset);
        put(OFF_RELOCATION_TABLE_SIZE, self.relocation_table_size);
        put(OFF_METADATA_OFFSET, self.metadata_offset);
        put(OFF_METADATA_SIZE, self.metadata_size);
        put(OFF_SYMBOL_TABLE_OFFSET, self.symbol_table_offset);
        put(OFF_SYMBOL_TABLE_SIZE, self.symbol_table_size);
        put(OFF_ENTRY_VIRTUAL_ADDRESS, self.entry_virtual_address);
        put(OFF_PAGE_TABLE_CONTEXT_ADDRESS, self.page_table_context_address);

        out
    }
}

fn section_bytes_by_kind(image: &LinkedImage, sections: &BTreeMap<String, Vec<Vec<u8>>>, kind: SectionKind) -> Vec<u8> {
    let mut out = Vec::new();
    for module in &image.modules {
        let bytes_for_module = match sections.get(&module.name) {
            Some(b) => b,
            None => continue,
        };
        for (idx, section) in module.sections.iter().enumerate() {
            if section.kind != kind {
                continue;
            }
            if kind == SectionKind::Bss {
                out.resize(out.len() + section.size, 0);
            } else {
                out.extend_from_slice(&bytes_for_module[idx]);
            }
        }
    }
    out
}

fn encode_got(image: &LinkedImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(image.got.len() * 8);
    for entry in &image.got {
        out.extend_from_slice(&entry.address.to_le_bytes());
    }
    out
}

fn reloc_kind_tag(kind: RelocationType) -> u8 {
    match kind {
        RelocationType::R_X86_64_8 => 0,
        RelocationType::R_X86_64_16 => 1,
        RelocationType::R_X86_64_32 => 2,
        RelocationType::R_X86_64_32S => 3,
        RelocationType::R_X86_64_64 => 4,
        RelocationType::PC16 => 5,
        RelocationType::PC32 => 6,
        RelocationType::PC64 => 7,
        RelocationType::GOT64 => 8,
        RelocationType::GOTOFF64 => 9,
        RelocationType::GOTPC64 => 10,
        RelocationType::PLTOFF64 => 11,
    }
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// `.relocation_table`: one record per applied relocation, identifying the
/// owning module/section by name so a loader (or a future re-linker) can
/// re-derive the patch without re-running closure resolution.
fn encode_relocation_table(image: &LinkedImage) -> Vec<u8> {
    let mut out = Vec::new();
    for module in &image.modules {
        for reloc in &module.relocations {
            encode_string(&mut out, &module.name);
            out.extend_from_slice(&(reloc.section as u32).to_le_bytes());
            out.extend_from_slice(&reloc.offset.to_le_bytes());
            encode_string(&mut out, &reloc.symbol);
            out.push(reloc_kind_tag(reloc.kind));
            out.extend_from_slice(&reloc.addend.to_le_bytes());
        }
    }
    out
}

/// `.metadata`: per-module base address and per-kind byte counts, enough
/// for a loader to know how each module's sections map back onto the image.
fn encode_metadata(image: &LinkedImage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(image.modules.len() as u32).to_le_bytes());
    for module in &image.modules {
        encode_string(&mut out, &module.name);
        let base = *image.module_base.get(&module.name).unwrap_or(&0);
        out.extend_from_slice(&base.to_le_bytes());
        out.extend_from_slice(&(module.sections.len() as u32).to_le_bytes());
    }
    out
}

/// `.symbol_table`: every globally visible symbol and its bound address.
fn encode_symbol_table(image: &LinkedImage) -> Vec<u8> {
    let mut out = Vec::new();
    let mut globals: Vec<(&String, &u64)> = image.symbol_address.iter().filter(|(name, _)| !name.contains("::")).collect();
    globals.sort_by(|a, b| a.0.cmp(b.0));
    out.extend_from_slice(&(globals.len() as u32).to_le_bytes());
    for (name, address) in globals {
        encode_string(&mut out, name);
        out.extend_from_slice(&address.to_le_bytes());
    }
    out
}

/// Emits a TOSELF image: `ProgramHeader | trampoline | .text | .rodata |
/// .data | .bss | .got | .relocation_table | .metadata | .symbol_table`.
/// `entry_symbol` must resolve to an address inside the `.text` region for
/// the header's jump trampoline to make sense; `page_table_context_address`
/// is opaque to this crate and just carried through the header.
pub fn emit_toself(
    image: &LinkedImage,
    sections: &BTreeMap<String, Vec<Vec<u8>>>,
    entry_symbol: &str,
    stack_size: u64,
    heap_size: u64,
    page_table_context_address: u64,
) -> Result<Vec<u8>, LinkerError> {
    let entry_point = *image.symbol_address.get(entry_symbol).ok_or(LinkerError::ResolverUnresolved)?;

    let text = section_bytes_by_kind(image, sections, SectionKind::Text);
    let rodata = section_bytes_by_kind(image, sections, SectionKind::Rodata);
    let data = section_bytes_by_kind(image, sections, SectionKind::Data);
    let bss = section_bytes_by_kind(image, sections, SectionKind::Bss);
    let program_virtual_address = image.modules.first().and_then(|m| image.module_base.get(&m.name)).copied().unwrap_or(0);

    let got = encode_got(image);
    let relocation_table = encode_relocation_table(image);
    let metadata = encode_metadata(image);
    let symbol_table = encode_symbol_table(image);

    let mut program = Vec::with_capacity(text.len() + rodata.len() + data.len() + bss.len());
    program.extend_from_slice(&text);
    program.extend_from_slice(&rodata);
    program.extend_from_slice(&data);
    program.extend_from_slice(&bss);

    let program_offset = PAYLOAD_BASE;
    let got_offset = program_offset + program.len() as u64;
    let relocation_table_offset = got_offset + got.len() as u64;
    let metadata_offset = relocation_table_offset + relocation_table.len() as u64;
    let symbol_table_offset = metadata_offset + metadata.len() as u64;
    let total_size = symbol_table_offset + symbol_table.len() as u64;

    let header = TosElfHeader {
        total_size,
        header_virtual_address: program_virtual_address,
        header_physical_address: program_virtual_address,
        program_offset,
        program_size: program.len() as u64,
        program_virtual_address,
        stack_size,
        heap_size,
        got_offset,
        got_size: got.len() as u64,
        got_virtual_address: image.got_address(),
        relocation_table_offset,
        relocation_table_size: relocation_table.len() as u64,
        metadata_offset,
        metadata_size: metadata.len() as u64,
        symbol_table_offset,
        symbol_table_size: symbol_table.len() as u64,
        entry_virtual_address: entry_point,
        page_table_context_address,
    };

    let mut out = Vec::with_capacity(total_size as usize);
    out.extend_from_slice(&header.encode());
    out.resize(TRAMPOLINE_OFFSET as usize + TRAMPOLINE_SIZE as usize, 0x90); // nop-filled trampoline placeholder
    out.extend_from_slice(&program);
    out.extend_from_slice(&got);
    out.extend_from_slice(&relocation_table);
    out.extend_from_slice(&metadata);
    out.extend_from_slice(&symbol_table);

    Ok(out)
}

const PE_DOS_STUB_SIZE: usize = 0x80;
const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;
const IMAGE_SUBSYSTEM_EFI_APPLICATION: u16 = 10;
const IMAGE_SECTION_HEADER_SIZE: usize = 40;
const IMAGE_REL_BASED_DIR64: u16 = 10;
const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;

fn align_up_u32(v: u32, align: u32) -> u32 {
    (v + align - 1) / align * align
}

struct PeSection {
    name: [u8; 8],
    data: Vec<u8>,
    characteristics: u32,
    virtual_size: u32,
}

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

fn section_name(name: &str) -> [u8; 8] {
    let mut out = [0u8; 8];
    let bytes = name.as_bytes();
    let len = bytes.len().min(8);
    out[0..len].copy_from_slice(&bytes[0..len]);
    out
}

fn build_base_relocations(rvas: &[u32]) -> Vec<u8> {
    let mut by_page: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for &rva in rvas {
        by_page.entry(rva & !0xfff).or_default().push(rva & 0xfff);
    }

    let mut out = Vec::new();
    for (page, offsets) in by_page {
        let mut entries: Vec<u16> = offsets.iter().map(|&o| (IMAGE_REL_BASED_DIR64 << 12) | (o as u16 & 0xfff)).collect();
        if entries.len() % 2 == 1 {
            entries.push(IMAGE_REL_BASED_ABSOLUTE << 12);
        }
        let block_size = 8 + entries.len() * 2;
        out.extend_from_slice(&page.to_le_bytes());
        out.extend_from_slice(&(block_size as u32).to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&entry.to_le_bytes());
        }
    }
    out
}

/// Emits a PE32+ image with one section per non-relocation linker section
/// kind present in the image, plus a standard-format `.reloc` section
/// covering every absolute (non-PC-relative) fixup applied.
pub fn emit_pe(
    image: &LinkedImage,
    sections: &BTreeMap<String, Vec<Vec<u8>>>,
    entry_symbol: &str,
    image_base: u64,
) -> Result<Vec<u8>, LinkerError> {
    let entry_point = *image.symbol_address.get(entry_symbol).ok_or(LinkerError::ResolverUnresolved)?;

    let text = section_bytes_by_kind(image, sections, SectionKind::Text);
    let rodata = section_bytes_by_kind(image, sections, SectionKind::Rodata);
    let data = section_bytes_by_kind(image, sections, SectionKind::Data);
    let bss_size = image
        .modules
        .iter()
        .flat_map(|m| m.sections.iter())
        .filter(|s| s.kind == SectionKind::Bss)
        .map(|s| s.size)
        .sum::<usize>();
    let got = encode_got(image);

    let mut pe_sections = Vec::new();
    if !text.is_empty() {
        pe_sections.push(PeSection {
            name: section_name(".text"),
            virtual_size: text.len() as u32,
            data: text,
            characteristics: IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        });
    }
    if !rodata.is_empty() {
        pe_sections.push(PeSection {
            name: section_name(".rodata"),
            virtual_size: rodata.len() as u32,
            data: rodata,
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        });
    }
    if !data.is_empty() {
        pe_sections.push(PeSection {
            name: section_name(".data"),
            virtual_size: data.len() as u32,
            data,
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        });
    }
    if bss_size > 0 {
        pe_sections.push(PeSection {
            name: section_name(".bss"),
            virtual_size: bss_size as u32,
            data: Vec::new(),
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        });
    }
    if !got.is_empty() {
        pe_sections.push(PeSection {
            name: section_name(".got"),
            virtual_size: got.len() as u32,
            data: got,
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        });
    }

    // Lay out RVAs for each section first so the .reloc section (computed
    // against those RVAs) can be appended last.
    let headers_size = align_up_u32(
        (PE_DOS_STUB_SIZE + 4 + 20 + 112 + (pe_sections.len() + 1) * IMAGE_SECTION_HEADER_SIZE) as u32,
        FILE_ALIGNMENT,
    );
    let mut rva_cursor = align_up_u32(headers_size, SECTION_ALIGNMENT);
    let mut file_cursor = headers_size;
    let mut layout = Vec::new();
    for section in &pe_sections {
        let rva = rva_cursor;
        let raw_size = align_up_u32(section.data.len() as u32, FILE_ALIGNMENT);
        layout.push((rva, file_cursor, raw_size));
        rva_cursor = align_up_u32(rva + section.virtual_size.max(1), SECTION_ALIGNMENT);
        file_cursor += raw_size;
    }

    let text_rva = pe_sections.iter().position(|s| s.name == section_name(".text")).map(|i| layout[i].0);
    let image_text_base = image.modules.first().and_then(|m| image.module_base.get(&m.name)).copied().unwrap_or(image_base);

    // Absolute 64-bit fixups (any relocation kind that bakes in an
    // absolute address rather than a PC-relative one) need a base
    // relocation entry so a loader relocating the image off `image_base`
    // can fix them up.
    let mut absolute_rvas = Vec::new();
    for module in &image.modules {
        let module_base = *image.module_base.get(&module.name).unwrap_or(&0);
        for reloc in &module.relocations {
            if matches!(
                reloc.kind,
                RelocationType::R_X86_64_64 | RelocationType::R_X86_64_32 | RelocationType::R_X86_64_32S | RelocationType::GOT64
            ) {
                let section_base = *image.section_address.get(&(module.name.clone(), reloc.section)).unwrap_or(&module_base);
                let addr = section_base + reloc.offset;
                if let Some(text_rva) = text_rva {
                    let rva = text_rva + (addr - image_text_base) as u32;
                    absolute_rvas.push(rva);
                }
            }
        }
    }
    let reloc_data = build_base_relocations(&absolute_rvas);
    let reloc_rva = rva_cursor;
    let reloc_raw_size = align_up_u32(reloc_data.len() as u32, FILE_ALIGNMENT);
    let reloc_file_offset = file_cursor;

    let mut out = vec![0u8; PE_DOS_STUB_SIZE];
    out[0] = b'M';
    out[1] = b'Z';
    out[0x3c..0x40].copy_from_slice(&(PE_DOS_STUB_SIZE as u32).to_le_bytes());

    out.extend_from_slice(&PE_SIGNATURE);
    out.extend_from_slice(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
    out.extend_from_slice(&((pe_sections.len() + 1) as u16).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    out.extend_from_slice(&0u32.to_le_bytes()); // symbol table pointer
    out.extend_from_slice(&0u32.to_le_bytes()); // symbol count
    out.extend_from_slice(&112u16.to_le_bytes()); // optional header size
    out.extend_from_slice(&0x22u16.to_le_bytes()); // characteristics: executable, large-address-aware

    out.extend_from_slice(&IMAGE_NT_OPTIONAL_HDR64_MAGIC.to_le_bytes());
    out.push(0); // major linker version
    out.push(1); // minor linker version
    let code_size: u32 = layout.iter().zip(&pe_sections).filter(|(_, s)| s.characteristics & IMAGE_SCN_CNT_CODE != 0).map(|(l, _)| l.2).sum();
    out.extend_from_slice(&code_size.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // size of initialized data
    out.extend_from_slice(&0u32.to_le_bytes()); // size of uninitialized data
    out.extend_from_slice(&((entry_point - image_base) as u32).to_le_bytes());
    out.extend_from_slice(&text_rva.unwrap_or(0).to_le_bytes()); // base of code
    out.extend_from_slice(&image_base.to_le_bytes());
    out.extend_from_slice(&SECTION_ALIGNMENT.to_le_bytes());
    out.extend_from_slice(&FILE_ALIGNMENT.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // size of image/headers, patched below
    out.extend_from_slice(&IMAGE_SUBSYSTEM_EFI_APPLICATION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // dll characteristics
    out.extend_from_slice(&[0u8; 32]); // stack/heap reserve+commit, unused for EFI apps

    let header_end = out.len() as u32;
    out.resize(headers_size as usize, 0);

    for (i, (section, (rva, offset, raw_size))) in pe_sections.iter().zip(&layout).enumerate() {
        let base = header_end as usize + i * IMAGE_SECTION_HEADER_SIZE;
        write_section_header(&mut out, base, &section.name, section.virtual_size, *rva, *raw_size, *offset, section.characteristics);
    }
    let reloc_base = header_end as usize + pe_sections.len() * IMAGE_SECTION_HEADER_SIZE;
    write_section_header(
        &mut out,
        reloc_base,
        &section_name(".reloc"),
        reloc_data.len() as u32,
        reloc_rva,
        reloc_raw_size,
        reloc_file_offset,
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_DISCARDABLE | IMAGE_SCN_MEM_READ,
    );

    for (section, (_, offset, raw_size)) in pe_sections.iter().zip(&layout) {
        out.resize((*offset) as usize, 0);
        out.extend_from_slice(&section.data);
        out.resize((*offset + *raw_size) as usize, 0);
    }
    out.resize(reloc_file_offset as usize, 0);
    out.extend_from_slice(&reloc_data);
    out.resize((reloc_file_offset + reloc_raw_size) as usize, 0);

    Ok(out)
}

fn write_section_header(out: &mut Vec<u8>, base: usize, name: &[u8; 8], virtual_size: u32, rva: u32, raw_size: u32, file_offset: u32, characteristics: u32) {
    out[base..base + 8].copy_from_slice(name);
    out[base + 8..base + 12].copy_from_slice(&virtual_size.to_le_bytes());
    out[base + 12..base + 16].copy_from_slice(&rva.to_le_bytes());
    out[base + 16..base + 20].copy_from_slice(&raw_size.to_le_bytes());
    out[base + 20..base + 24].copy_from_slice(&file_offset.to_le_bytes());
    out[base + 24..base + 36].copy_from_slice(&[0u8; 12]); // relocations/linenumbers pointers+counts, unused
    out[base + 36..base + 40].copy_from_slice(&characteristics.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Module, RelocationType as Reloc, Section, SectionKind, Symbol, SymbolBinding};
    use crate::resolve::{apply_relocations, link};

    fn entry_module() -> Module {
        Module {
            name: "init".into(),
            sections: vec![Section { name: ".text".into(), kind: SectionKind::Text, data: vec![0x90; 16], size: 0, align: 16 }],
            symbols: vec![Symbol { name: "_start".into(), binding: SymbolBinding::Global, section: 0, offset: 0 }],
            relocations: vec![],
        }
    }

    #[test]
    fn emits_toself_with_bit_exact_header_fields() {
        let module = entry_module();
        let mut image = link(vec![module], 0x20_0000).unwrap();
        let sections = apply_relocations(&mut image).unwrap();
        let bytes = emit_toself(&image, &sections, "_start", 0x4000, 0x4000, 0x30_0000).unwrap();

        assert_eq!(bytes[OFF_JMP_OPCODE], 0xE9);
        assert_eq!(&bytes[OFF_MAGIC..OFF_MAGIC + 7], &TOSELF_MAGIC);
        let total_size = u64::from_le_bytes(bytes[OFF_TOTAL_SIZE..OFF_TOTAL_SIZE + 8].try_into().unwrap());
        assert_eq!(total_size, bytes.len() as u64);
        let entry_va = u64::from_le_bytes(bytes[OFF_ENTRY_VIRTUAL_ADDRESS..OFF_ENTRY_VIRTUAL_ADDRESS + 8].try_into().unwrap());
        assert_eq!(entry_va, 0x20_0000);
        let page_ctx = u64::from_le_bytes(bytes[OFF_PAGE_TABLE_CONTEXT_ADDRESS..OFF_PAGE_TABLE_CONTEXT_ADDRESS + 8].try_into().unwrap());
        assert_eq!(page_ctx, 0x30_0000);
        assert!(bytes.len() as u64 >= PAYLOAD_BASE);
    }

    #[test]
    fn toself_trampoline_jump_lands_on_trampoline_offset() {
        let module = entry_module();
        let mut image = link(vec![module], 0x20_0000).unwrap();
        let sections = apply_relocations(&mut image).unwrap();
        let bytes = emit_toself(&image, &sections, "_start", 0x1000, 0x1000, 0).unwrap();

        let displacement = i32::from_le_bytes(bytes[OFF_JMP_DISPLACEMENT..OFF_JMP_DISPLACEMENT + 4].try_into().unwrap());
        let next_instruction = (OFF_JMP_DISPLACEMENT + 4) as i64;
        assert_eq!(next_instruction + displacement as i64, TRAMPOLINE_OFFSET as i64);
    }

    #[test]
    fn emits_pe_with_ms_dos_stub_and_section_table() {
        let module = entry_module();
        let mut image = link(vec![module], 0x20_0000).unwrap();
        let sections = apply_relocations(&mut image).unwrap();
        let bytes = emit_pe(&image, &sections, "_start", 0x20_0000).unwrap();

        assert_eq!(&bytes[0..2], b"MZ");
        let pe_offset = u32::from_le_bytes(bytes[0x3c..0x40].try_into().unwrap()) as usize;
        assert_eq!(&bytes[pe_offset..pe_offset + 4], &PE_SIGNATURE);
        let section_count = u16::from_le_bytes(bytes[pe_offset + 6..pe_offset + 8].try_into().unwrap());
        assert!(section_count >= 2); // at least .text and .reloc
    }

    #[test]
    fn rejects_unresolved_entry_symbol() {
        let module = entry_module();
        let mut image = link(vec![module], 0x1000).unwrap();
        let sections = apply_relocations(&mut image).unwrap();
        assert_eq!(emit_toself(&image, &sections, "missing", 0, 0, 0), Err(LinkerError::ResolverUnresolved));
    }
}
