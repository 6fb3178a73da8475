use crate::{*, dbgapi::*, elf::*, error::*, os::*, uri::*, util::*};
use std::{collections::{BTreeMap, HashMap, btree_map::Entry}, fmt::Write as fmtWrite, fs::File, io::{BufRead, BufReader, Read, Seek, SeekFrom, Write}, mem, sync::{Arc, Mutex, OnceLock}};

type Slice = gimli::EndianSlice<'static, gimli::LittleEndian>;

const CONTEXT_BYTE_SIZE: u64 = 24;

// One GPU code object known to the runtime: a load address, the URI the bytes can be
// fetched from, and (once opened) an anonymous backing file with the parsed ELF plus the
// lazily built symbol/line/range maps.
pub struct CodeObject {
    pub code_object_id: CodeObjectId,
    pub load_address: u64,
    // Largest segment_vaddr + segment_memsz across PT_LOAD segments. 0 until opened.
    pub mem_size: u64,
    pub uri: String,

    backing: Option<File>,
    elf: Option<ElfFile>,

    // Populated at most once each; keys are load-address-relocated.
    symbol_map: Option<BTreeMap<u64, (String, u64)>>,       // address -> (mangled name, size)
    line_map: Option<BTreeMap<u64, (String, u64)>>,         // address -> (source path, 1-based line)
    range_map: Option<BTreeMap<u64, u64>>,                  // range start -> range end
}

pub struct SymbolInfo {
    pub name: String, // demangled
    pub value: u64,
    pub size: u64,
}

impl CodeObject {
    pub fn new(api: &dyn DebugApi, code_object_id: CodeObjectId) -> CodeObject {
        let mut r = CodeObject {code_object_id, load_address: 0, mem_size: 0, uri: String::new(), backing: None, elf: None, symbol_map: None, line_map: None, range_map: None};
        match api.code_object_load_address(code_object_id) {
            Ok(a) => r.load_address = a,
            Err(_) => {
                log_warning!("could not get the code object's load address");
                return r;
            }
        }
        match api.code_object_uri(code_object_id) {
            Ok(u) => r.uri = u,
            Err(_) => log_warning!("could not get the code object's URI"),
        }
        r
    }

    pub fn is_open(&self) -> bool {
        self.elf.is_some()
    }

    // Materialize the code object into an anonymous file and compute its load footprint.
    // Any failure here is a warning, not fatal: the report just won't have disassembly
    // for this code object.
    pub fn open(&mut self, api: &dyn DebugApi) {
        if self.is_open() {
            return;
        }

        let parsed = match parse_uri(&self.uri) {
            Ok(p) => p,
            Err(e) => {
                log_warning!("invalid uri `{}' ({})", self.uri, e);
                return;
            }
        };

        let buffer: Vec<u8>;
        match &parsed.protocol[..] {
            "file" => {
                let mut file = match File::open(&parsed.path) {
                    Ok(f) => f,
                    Err(_) => {
                        log_warning!("could not open `{}'", parsed.path);
                        return;
                    }
                };
                let file_len = match file.metadata() {
                    Ok(m) => m.len(),
                    Err(_) => {
                        log_warning!("could not stat `{}'", parsed.path);
                        return;
                    }
                };
                let mut size = parsed.size;
                if size == 0 {
                    if file_len < parsed.offset {
                        log_warning!("invalid uri `{}' (file size < offset)", self.uri);
                        return;
                    }
                    size = file_len - parsed.offset;
                }
                let mut buf = vec![0u8; size as usize];
                let read = file.seek(SeekFrom::Start(parsed.offset)).and_then(|_| file.read_exact(&mut buf));
                if let Err(e) = read {
                    log_warning!("could not read `{}': {}", parsed.path, e);
                    return;
                }
                buffer = buf;
            }
            "memory" => {
                if parsed.offset == 0 || parsed.size == 0 {
                    log_warning!("invalid uri `{}' (offset and size must be != 0)", self.uri);
                    return;
                }
                let process = dbg_check!(api.code_object_process(self.code_object_id), "code_object_process");
                let mut buf = vec![0u8; parsed.size as usize];
                if api.read_global_memory(process, parsed.offset, &mut buf).is_err() {
                    log_warning!("could not read memory at 0x{:x}", parsed.offset);
                    return;
                }
                buffer = buf;
            }
            other => {
                log_warning!("\"{}\" protocol not supported", other);
                return;
            }
        }

        let fd = match create_anonymous_file(&self.uri) {
            Ok(fd) => fd,
            Err(e) => {
                log_warning!("could not create a temporary file for code object: {}", e);
                return;
            }
        };
        let mut file = File::from(fd);
        if file.write_all(&buffer).is_err() || file.seek(SeekFrom::Start(0)).is_err() {
            log_warning!("could not write to the temporary file");
            return;
        }

        let elf = match ElfFile::from_file(self.uri.clone(), &file, buffer.len()) {
            Ok(e) => e,
            Err(e) => {
                log_warning!("could not parse code object `{}': {}", self.uri, e);
                return;
            }
        };

        // The size of the code object as loaded in memory is the distance of the end of
        // the highest segment from the load address.
        for segment in &elf.segments {
            if segment.segment_type == PT_LOAD {
                self.mem_size = self.mem_size.max((segment.address + segment.size_in_memory) as u64);
            }
        }

        self.backing = Some(file);
        self.elf = Some(elf);
    }

    fn load_symbol_map(&mut self) {
        if self.symbol_map.is_some() {
            return;
        }
        assert!(self.is_open(), "code object is not opened");

        let mut map: BTreeMap<u64, (String, u64)> = BTreeMap::new();
        let elf = self.elf.as_ref().unwrap();
        for idx in 0..elf.sections.len() {
            let section = &elf.sections[idx];
            if section.section_type != SHT_SYMTAB && section.section_type != SHT_DYNSYM {
                continue;
            }
            let strtab_offset = match elf.sections.get(section.link as usize) {
                Some(s) => s.offset,
                None => continue,
            };
            let data = elf.section_data(idx);
            let sym_size = mem::size_of::<libc::Elf64_Sym>();
            for j in 0..data.len() / sym_size {
                let (sym, _) = match unsafe {memcpy_struct::<libc::Elf64_Sym>(&data[j * sym_size..], "Elf64_Sym")} {
                    Ok(t) => t,
                    Err(_) => break,
                };
                if sym.st_info & 0xf != STT_FUNC || sym.st_shndx == SHN_UNDEF {
                    continue;
                }
                let name = match elf.str_from_strtab(strtab_offset, sym.st_name as usize) {
                    Ok(n) => n.to_string(),
                    Err(_) => continue,
                };
                match map.entry(self.load_address + sym.st_value) {
                    Entry::Vacant(e) => {
                        e.insert((name, sym.st_size));
                    }
                    // A symbol covering a larger address range replaces the narrower one.
                    Entry::Occupied(mut e) => {
                        if sym.st_size > e.get().1 {
                            e.insert((name, sym.st_size));
                        }
                    }
                }
            }
        }
        self.symbol_map = Some(map);
    }

    // Address ranges (low/high pc or DW_AT_ranges) of every CU, and every line-table row
    // with a nonzero line number, both relocated by the load address.
    fn load_debug_info(&mut self) {
        if self.line_map.is_some() && self.range_map.is_some() {
            return;
        }
        assert!(self.is_open(), "code object is not opened");

        let mut line_map: BTreeMap<u64, (String, u64)> = BTreeMap::new();
        let mut range_map: BTreeMap<u64, u64> = BTreeMap::new();

        if let Err(e) = self.harvest_debug_info(&mut line_map, &mut range_map) {
            log_verbose!("no debug info for `{}': {}", self.uri, e);
        }

        self.line_map = Some(line_map);
        self.range_map = Some(range_map);
    }

    fn harvest_debug_info(&self, line_map: &mut BTreeMap<u64, (String, u64)>, range_map: &mut BTreeMap<u64, u64>) -> Result<()> {
        let elf = self.elf.as_ref().unwrap();
        let load_address = self.load_address;

        let load_section = |id: gimli::SectionId| -> Result<Slice> {
            Ok(match elf.section_by_name.get(id.name()) {
                // The section data lives as long as the ElfFile; the Dwarf object built
                // from it is dropped before this function returns.
                Some(&idx) => gimli::EndianSlice::new(unsafe {mem::transmute::<&[u8], &'static [u8]>(elf.section_data(idx))}, gimli::LittleEndian),
                None => gimli::EndianSlice::new(&[], gimli::LittleEndian),
            })
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = match dwarf.unit(header) {
                Ok(u) => u,
                Err(_) => continue,
            };

            if let Ok(mut ranges) = dwarf.unit_ranges(&unit) {
                while let Ok(Some(range)) = ranges.next() {
                    range_map.insert(load_address + range.begin, load_address + range.end);
                }
            }

            let program = match unit.line_program.clone() {
                Some(p) => p,
                None => continue,
            };
            let comp_dir = match &unit.comp_dir {
                Some(d) => d.to_string_lossy().into_owned(),
                None => String::new(),
            };

            let mut rows = program.rows();
            while let Ok(Some((header, row))) = rows.next_row() {
                if row.end_sequence() {
                    continue;
                }
                let line = match row.line() {
                    Some(l) => l.get(),
                    None => continue,
                };
                let file = match row.file(header) {
                    Some(f) => f,
                    None => continue,
                };
                let path = match render_file_path(&dwarf, &unit, header, file, &comp_dir) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                line_map.insert(load_address + row.address(), (path, line));
            }
        }
        Ok(())
    }

    // Predecessor lookup: the symbol whose [value, value+size) covers `address`.
    pub fn find_symbol(&mut self, address: u64) -> Option<SymbolInfo> {
        self.load_symbol_map();
        self.lookup_symbol(address)
    }

    fn lookup_symbol(&self, address: u64) -> Option<SymbolInfo> {
        let map = self.symbol_map.as_ref()?;
        let (&value, entry) = map.range(..=address).next_back()?;
        if address < value + entry.1 {
            Some(SymbolInfo {name: demangle_name(&entry.0), value, size: entry.1})
        } else {
            None
        }
    }

    // Annotated disassembly around `pc`: instructions interleaved with source lines,
    // clamped to the CU range covering pc.
    pub fn disassemble(&mut self, api: &dyn DebugApi, architecture: ArchitectureId, pc: u64) {
        let process = dbg_check!(api.code_object_process(self.code_object_id), "code_object_process");
        let largest_instruction_size = dbg_check!(api.largest_instruction_size(architecture), "largest_instruction_size");

        self.load_debug_info();
        self.load_symbol_map();

        // Find a line-table address that precedes pc by context_byte_size bytes. If there
        // is no line info, start from pc itself: the instructions are of variable size,
        // so any earlier address may not be a valid instruction boundary.
        let mut start_pc = pc;
        {
            let line_map = self.line_map.as_ref().unwrap();
            for (&addr, _) in line_map.range(..=pc).rev() {
                start_pc = addr;
                if pc - addr >= CONTEXT_BYTE_SIZE {
                    break;
                }
            }
        }
        let mut end_pc = pc + CONTEXT_BYTE_SIZE;

        // If pc is inside a known CU range, clamp [start_pc, end_pc] into it.
        if let Some((&low_pc, &high_pc)) = self.range_map.as_ref().unwrap().range(..=pc).next_back() {
            if pc < high_pc {
                start_pc = start_pc.max(low_pc);
                end_pc = end_pc.min(high_pc);
            }
        }

        let symbol = self.lookup_symbol(pc);

        out!("\nDisassembly");
        if let Some(symbol) = &symbol {
            out!(" for function {}", symbol.name);
        }
        outln!(":");
        outln!("    code object: {}", self.uri);
        outln!("    loaded at: [0x{:x}-0x{:x}]", self.load_address, self.load_address + self.mem_size);

        // Remember the original start_pc so the first iteration below still prints the
        // source block it belongs to.
        let saved_start_pc = start_pc;

        // start_pc comes from the line table, so it is a valid instruction address. Walk
        // forward by real instruction sizes until pc is at most context_byte_size away.
        while pc - start_pc > CONTEXT_BYTE_SIZE {
            let mut buffer = vec![0u8; largest_instruction_size];
            let n = match api.read_global_memory(process, start_pc, &mut buffer) {
                Ok(n) => n,
                Err(_) => break,
            };
            let size = match api.disassemble_instruction(architecture, start_pc, &buffer[..n], None) {
                Ok((_, size)) => size as u64,
                Err(_) => break,
            };
            match pc.checked_sub(start_pc + size) {
                Some(d) if d >= CONTEXT_BYTE_SIZE => start_pc += size,
                _ => break,
            }
        }

        let mut prev_file_name = String::new();
        let mut prev_line_number: u64 = 0;
        let mut addr = start_pc;

        while addr < end_pc {
            let lookup_addr = if addr == start_pc {saved_start_pc} else {addr};
            let entry = self.line_map.as_ref().unwrap().get(&lookup_addr).cloned();
            if let Some((file_name, line_number)) = entry {
                if file_name != prev_file_name || line_number != prev_line_number {
                    outln!();
                }
                if file_name != prev_file_name {
                    outln!("{}:", file_name);
                }
                if file_name != prev_file_name || line_number != prev_line_number {
                    // Besides the source line for `addr`, print the preceding lines that
                    // have no instructions of their own, so the source view stays dense.
                    // A line in the gap that belongs to some other address aborts the
                    // filling; the search is bounded by the previous printed line.
                    let mut first_line = line_number;
                    let last_line = line_number;
                    if file_name == prev_file_name && line_number > prev_line_number {
                        let line_map = self.line_map.as_ref().unwrap();
                        let mut l = line_number;
                        while l - 1 > prev_line_number {
                            l -= 1;
                            if line_map.values().any(|(f, n)| *n == l && f == &file_name) {
                                l = line_number;
                                break;
                            }
                        }
                        first_line = l;
                    }
                    for line in first_line..=last_line {
                        out!("{:<8}", line);
                        match source_lines(&file_name) {
                            None => out!("{}: No such file or directory.", file_name),
                            Some(lines) => {
                                if line >= 1 && line as usize <= lines.len() {
                                    out!("{}", lines[line as usize - 1]);
                                }
                            }
                        }
                        outln!();
                    }
                }
                prev_file_name = file_name;
                prev_line_number = line_number;

                // start_pc landed in the middle of this line block; show that
                // instructions were skipped.
                if addr == start_pc && start_pc != saved_start_pc {
                    outln!("    ...");
                }
            }

            let mut buffer = vec![0u8; largest_instruction_size];
            let n = match api.read_global_memory(process, addr, &mut buffer) {
                Ok(n) => n,
                Err(_) => {
                    outln!("Cannot access memory at address 0x{:x}", addr);
                    break;
                }
            };

            let mut symbolizer = |address: u64| -> String {
                let mut text = format!("0x{:x}", address);
                if let Some(symbol) = self.lookup_symbol(address) {
                    let _ = write!(text, " <{}+{}>", symbol.name, address - symbol.value);
                }
                text
            };
            let (instruction, size) = dbg_check!(api.disassemble_instruction(architecture, addr, &buffer[..n], Some(&mut symbolizer)), "disassemble_instruction");

            out!("{}", if addr == pc {" => "} else {"    "});
            out!("0x{:x}", addr);
            if let Some(symbol) = &symbol {
                if addr >= symbol.value {
                    out!(" <+{}>", addr - symbol.value);
                } else {
                    out!(" <-{}>", symbol.value - addr);
                }
            }
            outln!(":    {}", instruction);

            addr += size as u64;
        }

        // The address after the last printed instruction does not start a new line block:
        // show that the previous source line has more instructions than were printed.
        if !self.line_map.as_ref().unwrap().contains_key(&addr) {
            outln!("    ...");
        }

        out!("\nEnd of disassembly.\n");
    }

    // Persist the exact backing bytes as <directory>/<uri with [:/#?&=] -> _>.
    pub fn save(&self, directory: &str) -> bool {
        assert!(self.is_open(), "code object is not opened");
        let name: String = self.uri.chars().map(|c| if ":/#?&=".contains(c) {'_'} else {c}).collect();
        let path = format!("{}/{}", directory, name);
        let mut file = match File::create(&path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        if file.write_all(self.elf.as_ref().unwrap().data()).is_err() {
            return false;
        }
        if file.flush().is_err() {
            return false;
        }
        file.sync_all().is_ok()
    }
}

fn render_file_path(dwarf: &gimli::Dwarf<Slice>, unit: &gimli::Unit<Slice>, header: &gimli::LineProgramHeader<Slice>, file: &gimli::FileEntry<Slice>, comp_dir: &str) -> Result<String> {
    let mut path = String::from(comp_dir);
    if file.directory_index() != 0 {
        if let Some(dir) = file.directory(header) {
            let dir = dwarf.attr_string(unit, dir)?;
            let dir = dir.to_string_lossy();
            if dir.starts_with('/') {
                path = dir.into_owned();
            } else {
                if !path.is_empty() && !path.ends_with('/') {
                    path.push('/');
                }
                path.push_str(&dir);
            }
        }
    }
    let name = dwarf.attr_string(unit, file.path_name())?;
    let name = name.to_string_lossy();
    if name.starts_with('/') {
        path = name.into_owned();
    } else {
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(&name);
    }
    Ok(path)
}

pub fn demangle_name(name: &str) -> String {
    if name.starts_with("_R") {
        return rustc_demangle::demangle(name).to_string();
    }
    if name.starts_with("_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(name.as_bytes()) {
            if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::new()) {
                return demangled;
            }
        }
    }
    name.to_string()
}

// Process-wide memoized source files, used to interleave source text into disassembly.
// Append-only: entries are never removed or mutated after insertion.
fn source_file_cache() -> &'static Mutex<HashMap<String, Arc<Vec<String>>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<Vec<String>>>>> = OnceLock::new();
    CACHE.get_or_init(Default::default)
}

pub fn source_lines(path: &str) -> Option<Arc<Vec<String>>> {
    let mut cache = source_file_cache().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(lines) = cache.get(path) {
        return Some(lines.clone());
    }
    let file = File::open(path).ok()?;
    let lines: Vec<String> = BufReader::new(file).lines().map(|l| l.unwrap_or_default()).collect();
    let lines = Arc::new(lines);
    cache.insert(path.to_string(), lines.clone());
    Some(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::*;
    use std::io::Write as ioWrite;

    fn unopened(uri: &str) -> CodeObject {
        CodeObject {code_object_id: CodeObjectId(0), load_address: 0, mem_size: 0, uri: uri.to_string(), backing: None, elf: None, symbol_map: None, line_map: None, range_map: None}
    }

    fn with_maps(load_address: u64, symbols: &[(&str, u64, u64)], lines: &[(u64, &str, u64)], ranges: &[(u64, u64)]) -> CodeObject {
        let mut co = unopened("memory://test#offset=0x1000&size=0x1000");
        co.load_address = load_address;
        co.mem_size = 0x10000;
        co.symbol_map = Some(symbols.iter().map(|&(name, value, size)| (value, (name.to_string(), size))).collect());
        co.line_map = Some(lines.iter().map(|&(addr, file, line)| (addr, (file.to_string(), line))).collect());
        co.range_map = Some(ranges.iter().cloned().collect());
        co
    }

    #[test]
    fn symbol_map_collision_keeps_larger() {
        let elf_bytes = build_test_elf(&[("f", 0x100, 16), ("g", 0x100, 64)]);
        let fd = create_anonymous_file("symtab-test").unwrap();
        let mut file = File::from(fd);
        file.write_all(&elf_bytes).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let elf = ElfFile::from_file("symtab-test".to_string(), &file, elf_bytes.len()).unwrap();

        let mut co = unopened("file:///t");
        co.load_address = 0x7000_0000;
        co.backing = Some(file);
        co.elf = Some(elf);

        let symbol = co.find_symbol(0x7000_0000 + 0x100 + 20).unwrap();
        assert_eq!(symbol.name, "g");
        assert_eq!(symbol.size, 64);
        assert!(co.find_symbol(0x7000_0000 + 0x100 + 70).is_none());
    }

    #[test]
    fn find_symbol_predecessor_rule() {
        let base = 0x8000_0000u64;
        let mut co = with_maps(base, &[("A", base, 16), ("B", base + 32, 8)], &[], &[]);
        assert_eq!(co.find_symbol(base + 15).unwrap().name, "A");
        assert!(co.find_symbol(base + 20).is_none());
        assert_eq!(co.find_symbol(base + 32).unwrap().name, "B");
        assert!(co.find_symbol(base + 40).is_none());
    }

    #[test]
    fn disassembly_anchors_on_instruction_boundary() {
        let _serial = output_test_lock();
        let api = SimApi::new();
        {
            let mut state = api.state.lock().unwrap();
            state.memory.insert(0x1000, vec![0u8; 0x1000]);
            state.instruction_size = 4;
        }
        let pc = 0x1100u64;
        let mut co = with_maps(0, &[], &[(pc - 100, "/nonexistent/a.hip", 1), (pc - 8, "/nonexistent/a.hip", 2)], &[]);
        let captured = capture_output();
        co.disassemble(&api, ArchitectureId(1), pc);
        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();

        // Backward walk reaches pc-100, then forward stepping in 4-byte instructions
        // re-anchors within context_byte_size of pc.
        assert!(text.contains(&format!("    0x{:x}", pc - 24)), "{}", text);
        assert!(!text.contains(&format!("0x{:x}:", pc - 100)), "{}", text);
        assert!(text.contains(&format!(" => 0x{:x}", pc)), "{}", text);
        assert!(text.contains("End of disassembly."), "{}", text);
    }

    #[test]
    fn source_line_filling() {
        let _serial = output_test_lock();
        let dir = std::env::temp_dir();
        let src_path = dir.join(format!("gpu-debug-agent-fill-{}.hip", std::process::id()));
        {
            let mut f = File::create(&src_path).unwrap();
            for i in 1..=20 {
                writeln!(f, "line {} text", i).unwrap();
            }
        }
        let src = src_path.to_str().unwrap().to_string();

        let api = SimApi::new();
        {
            let mut state = api.state.lock().unwrap();
            state.memory.insert(0x1000, vec![0u8; 0x1000]);
            state.instruction_size = 4;
        }

        // Lines 11..13 have no addresses of their own: they are printed as context.
        let mut co = with_maps(0, &[], &[(0x1000, &src, 10), (0x1004, &src, 14)], &[]);
        let captured = capture_output();
        co.disassemble(&api, ArchitectureId(1), 0x1004);
        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();
        for line in [10, 11, 12, 13, 14] {
            assert!(text.contains(&format!("line {} text", line)), "missing line {}: {}", line, text);
        }

        // Line 12 belongs to another address (outside the printed window): the gap is
        // not filled.
        let mut co = with_maps(0, &[], &[(0x1000, &src, 10), (0x1004, &src, 14), (0x1080, &src, 12)], &[]);
        let captured = capture_output();
        co.disassemble(&api, ArchitectureId(1), 0x1004);
        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();
        assert!(text.contains("line 10 text"), "{}", text);
        assert!(text.contains("line 14 text"), "{}", text);
        for line in [11, 12, 13] {
            assert!(!text.contains(&format!("line {} text", line)), "unexpected line {}: {}", line, text);
        }

        let _ = std::fs::remove_file(&src_path);
    }

    #[test]
    fn memory_uri_requires_offset_and_size() {
        let api = SimApi::new();
        let mut co = unopened("memory://x#offset=0&size=0");
        co.open(&api);
        assert!(!co.is_open());

        let mut co = unopened("memory://x#offset=0x5000&size=0");
        co.open(&api);
        assert!(!co.is_open());
    }

    #[test]
    fn open_from_process_memory() {
        let api = SimApi::new();
        let elf_bytes = build_test_elf(&[("kernel", 0x40, 32)]);
        let len = elf_bytes.len();
        api.state.lock().unwrap().memory.insert(0x5000, elf_bytes);

        let mut co = unopened(&format!("memory://7#offset=0x5000&size={}", len));
        co.load_address = 0x9000_0000;
        co.open(&api);
        assert!(co.is_open());
        assert_eq!(co.mem_size, 0x1000); // PT_LOAD footprint of the test ELF
        let symbol = co.find_symbol(0x9000_0000 + 0x40).unwrap();
        assert_eq!(symbol.name, "kernel");
    }

    #[test]
    fn open_from_file_and_save() {
        let api = SimApi::new();
        let dir = std::env::temp_dir();
        let obj_path = dir.join(format!("gpu-debug-agent-co-{}.hsaco", std::process::id()));
        let elf_bytes = build_test_elf(&[("f", 0x10, 8)]);
        std::fs::write(&obj_path, &elf_bytes).unwrap();

        let uri = format!("file://{}", obj_path.display());
        let mut co = unopened(&uri);
        co.open(&api);
        assert!(co.is_open());

        let save_dir = dir.to_str().unwrap();
        assert!(co.save(save_dir));
        let saved_name: String = uri.chars().map(|c| if ":/#?&=".contains(c) {'_'} else {c}).collect();
        let saved = dir.join(&saved_name);
        assert_eq!(std::fs::read(&saved).unwrap(), elf_bytes);

        let _ = std::fs::remove_file(&obj_path);
        let _ = std::fs::remove_file(&saved);
    }

    #[test]
    fn file_offset_past_end_rejected() {
        let api = SimApi::new();
        let dir = std::env::temp_dir();
        let obj_path = dir.join(format!("gpu-debug-agent-short-{}.bin", std::process::id()));
        std::fs::write(&obj_path, b"tiny").unwrap();

        let mut co = unopened(&format!("file://{}#offset=0x100", obj_path.display()));
        co.open(&api);
        assert!(!co.is_open());
        let _ = std::fs::remove_file(&obj_path);
    }

    #[test]
    fn demangling() {
        assert_eq!(demangle_name("_Z3addii"), "add(int, int)");
        assert_eq!(demangle_name("plain_kernel"), "plain_kernel");
    }
}
