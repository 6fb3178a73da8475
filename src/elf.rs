use crate::{*, error::*, os::*, util::*};
use std::{collections::HashMap, fs::File, io::Read, mem, str, sync::OnceLock};
use memmap2::Mmap;

// Just enough ELF to handle GPU code objects: program headers for the load footprint,
// section headers for the symbol tables and the DWARF sections.

pub struct ElfSection {
    pub idx: usize,
    pub name: String,

    pub section_type: u32,
    pub flags: u64,

    pub address: usize,
    pub offset: usize,
    pub size: usize,

    pub link: u32,
    pub entry_size: usize,

    pub name_offset_in_strtab: u32,

    // If flags has SHF_COMPRESSED.
    pub compression_header: Option<libc::Elf64_Chdr>,
    decompressed_data: OnceLock<Vec<u8>>,
}

pub struct ElfSegment {
    pub idx: usize,
    pub segment_type: u32,
    pub flags: u32,
    pub offset: usize,
    pub address: usize,
    pub size_in_file: usize,
    pub size_in_memory: usize,
}

pub struct ElfFile {
    pub name: String, // just for logging

    pub segments: Vec<ElfSegment>,
    pub sections: Vec<ElfSection>,
    pub section_by_name: HashMap<String, usize>,

    mmapped: Mmap,
    data: &'static [u8],
}

impl ElfSection {
    pub fn size_in_file(&self) -> usize {
        if self.section_type == SHT_NOBITS {
            0
        } else {
            self.size
        }
    }
}

impl ElfFile {
    pub fn data(&self) -> &[u8] {
        self.data as _
    }

    pub fn str_from_strtab(&self, section_offset: usize, offset: usize) -> Result<&str> {
        let start = section_offset.saturating_add(offset);
        if start >= self.data.len() {
            return err!(MalformedExecutable, "string table offset out of bounds in {}", self.name);
        }
        let data = &self.data[start..];
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(str::from_utf8(&data[..len])?)
    }

    // The returned reference points either into the mmap or into the section's
    // lazily decompressed data.
    pub fn section_data(&self, idx: usize) -> &[u8] {
        let section = &self.sections[idx];
        if let Some(header) = &section.compression_header {
            return &section.decompressed_data.get_or_init(|| {
                let compressed = &self.data[section.offset..section.offset + section.size_in_file()];
                let compressed = &compressed[mem::size_of::<libc::Elf64_Chdr>().min(compressed.len())..];
                if header.ch_type != ELFCOMPRESS_ZLIB {
                    log_warning!("ELF compression {} not supported in {}", header.ch_type, self.name);
                    return Vec::new();
                }
                let mut decompressed = vec![0u8; header.ch_size as usize];
                let mut decoder = flate2::read::ZlibDecoder::new(compressed);
                match decoder.read_exact(&mut decompressed) {
                    Ok(()) => decompressed,
                    Err(e) => {
                        log_warning!("could not decompress section {} in {}: {}", section.name, self.name, e);
                        Vec::new()
                    }
                }
            })[..];
        }
        &self.data[section.offset..section.offset + section.size_in_file()]
    }

    pub fn from_file(name: String, file: &File, file_len: usize) -> Result<Self> {
        if file_len < mem::size_of::<libc::Elf64_Ehdr>() {
            return err!(MalformedExecutable, "{} is too short to be an ELF file ({} bytes)", name, file_len);
        }
        let mmapped = unsafe {Mmap::map(file)}.map_err(|e| Error::from(e))?;
        // The mmap outlives every use of `data`: both live in this struct, and no borrow
        // escapes with 'static lifetime through the public interface.
        let data: &'static [u8] = unsafe {mem::transmute(&mmapped[..file_len.min(mmapped.len())])};

        let (header, _) = unsafe {memcpy_struct::<libc::Elf64_Ehdr>(data, "Elf64_Ehdr")}?;

        if &header.e_ident[..4] != &[0x7f, 0x45, 0x4c, 0x46] { return err!(MalformedExecutable, "invalid ELF magic bytes: {}", hexdump(&header.e_ident[..4], 100)); }
        if header.e_ident[4] != 2 { return err!(MalformedExecutable, "not a 64-bit ELF: EI_CLASS = {}", header.e_ident[4]); }
        if header.e_ident[5] != 1 { return err!(MalformedExecutable, "not a little-endian ELF: EI_DATA = {}", header.e_ident[5]); }
        if header.e_ident[6] != 1 { return err!(MalformedExecutable, "invalid EI_VERSION: {}", header.e_ident[6]); }
        // (No e_machine check: code objects use the GPU vendor's machine numbers.)

        if header.e_phnum > 0 && (header.e_phentsize as usize) < mem::size_of::<libc::Elf64_Phdr>() { return err!(MalformedExecutable, "ELF e_phentsize too small in {}", name); }
        if header.e_shnum > 0 && (header.e_shentsize as usize) < mem::size_of::<libc::Elf64_Shdr>() { return err!(MalformedExecutable, "ELF e_shentsize too small in {}", name); }
        if (header.e_phnum as usize).saturating_mul(header.e_phentsize as usize).saturating_add(header.e_phoff as usize) > data.len() { return err!(MalformedExecutable, "ELF program header out of bounds in {}", name); }
        if (header.e_shnum as usize).saturating_mul(header.e_shentsize as usize).saturating_add(header.e_shoff as usize) > data.len() { return err!(MalformedExecutable, "ELF section header out of bounds in {}", name); }

        let mut segments: Vec<ElfSegment> = Vec::new();
        for idx in 0..header.e_phnum as usize {
            let (segment, _) = unsafe {memcpy_struct::<libc::Elf64_Phdr>(&data[header.e_phoff as usize + idx * header.e_phentsize as usize..], "Elf64_Phdr")}?;

            let mut offset = segment.p_offset as usize;
            let mut size_in_file = segment.p_filesz as usize;
            if offset.saturating_add(size_in_file) > data.len() {
                log_warning!("ELF segment {} out of bounds in {} (offset: {}, size in file: {}, file size: {})", idx, name, offset, size_in_file, data.len());
                offset = offset.min(data.len());
                size_in_file = size_in_file.min(data.len() - offset);
            }

            segments.push(ElfSegment {idx, segment_type: segment.p_type, flags: segment.p_flags, offset, address: segment.p_vaddr as usize, size_in_file, size_in_memory: segment.p_memsz as usize});
        }

        let mut sections: Vec<ElfSection> = Vec::new();
        for idx in 0..header.e_shnum as usize {
            let (section, _) = unsafe {memcpy_struct::<libc::Elf64_Shdr>(&data[header.e_shoff as usize + idx * header.e_shentsize as usize..], "Elf64_Shdr")}?;
            sections.push(ElfSection {
                idx, name: String::new(), name_offset_in_strtab: section.sh_name, section_type: section.sh_type, flags: section.sh_flags,
                address: section.sh_addr as usize, offset: section.sh_offset as usize, size: section.sh_size as usize, link: section.sh_link,
                entry_size: section.sh_entsize as usize, compression_header: None, decompressed_data: OnceLock::new()});
        }

        let mut elf = ElfFile {name, mmapped, data, segments, sections, section_by_name: HashMap::new()};

        if (header.e_shstrndx as usize) >= elf.sections.len() && header.e_shnum > 0 {
            return err!(MalformedExecutable, "ELF e_shstrndx out of bounds in {}", elf.name);
        }

        for idx in 0..elf.sections.len() {
            let name = elf.str_from_strtab(elf.sections[header.e_shstrndx as usize].offset, elf.sections[idx].name_offset_in_strtab as usize).unwrap_or("").to_string();
            elf.sections[idx].name = name.clone();

            let s = &mut elf.sections[idx];
            if s.offset.saturating_add(s.size_in_file()) > elf.data.len() {
                log_warning!("ELF section {} (type 0x{:x}, flags 0x{:x}) out of bounds in {}: {} + {} > {}", name, s.section_type, s.flags, elf.name, s.offset, s.size_in_file(), elf.data.len());
                // Clamp the range to make sure we won't read the mmap out of bounds.
                s.offset = s.offset.min(elf.data.len());
                s.size = s.size.min(elf.data.len() - s.offset);
            }

            if s.flags & SHF_COMPRESSED != 0 {
                let compressed = &elf.data[s.offset..s.offset+s.size_in_file()];
                s.compression_header = Some(unsafe {memcpy_struct(compressed, "Elf64_Chdr")}?.0);
            }

            elf.section_by_name.insert(s.name.clone(), idx);
        }

        Ok(elf)
    }
}
