// ELF constants that are not in the libc rust crate.

pub const SHT_PROGBITS: u32 = 0x1;
pub const SHT_SYMTAB: u32 = 0x2;
pub const SHT_DYNSYM: u32 = 0xb;
pub const SHT_NOBITS: u32 = 0x8;

pub const SHF_COMPRESSED: u64 = 1 << 11;

pub const STT_FUNC: u8 = 2;

pub const SHN_UNDEF: u16 = 0;

pub const PT_LOAD: u32 = 1;

pub const ELFCOMPRESS_ZLIB: u32 = 1;
