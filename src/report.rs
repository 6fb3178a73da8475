use crate::{*, code_object::*, dbgapi::*, error::*, settings, waves};
use std::{collections::{BTreeMap, HashSet}, fmt::Write as fmtWrite, sync::{Mutex, TryLockError}};

// Snapshot every stopped wave: header, registers, local memory, disassembly around pc.
// Not thread-safe and not re-entrant: a second report requested while one is being
// written is dropped. Returns whether this call produced the report.
pub fn print_wavefronts(api: &dyn DebugApi, process: ProcessId, all_wavefronts: bool) -> bool {
    static LOCK: Mutex<()> = Mutex::new(());
    let _guard = match LOCK.try_lock() {
        Ok(g) => g,
        Err(TryLockError::Poisoned(e)) => e.into_inner(),
        Err(TryLockError::WouldBlock) => {
            log_warning!("a wavefront report is already in progress, dropping this request");
            return false;
        }
    };

    let mut code_object_map: BTreeMap<u64, CodeObject> = BTreeMap::new();
    for id in dbg_check!(api.code_object_list(process), "process_code_object_list") {
        let mut code_object = CodeObject::new(api, id);
        code_object.open(api);
        if !code_object.is_open() {
            log_warning!("could not open code_object_{}", id.0);
            continue;
        }
        if let Some(dir) = &settings::global().save_code_objects {
            if !code_object.save(dir) {
                log_warning!("could not save code object to {}", dir);
            }
        }
        code_object_map.insert(code_object.load_address, code_object);
    }

    if all_wavefronts {
        waves::stop_all_wavefronts(api, process);
    }

    for (i, wave_id) in dbg_check!(api.wave_list(process), "process_wave_list").into_iter().enumerate() {
        let state = dbg_check!(api.wave_state(wave_id), "wave_get_info");
        if state != WaveState::Stop {
            continue;
        }

        let stop_reason = dbg_check!(api.wave_stop_reason(wave_id), "wave_get_info");
        let pc = dbg_check!(api.wave_pc(wave_id), "wave_get_info");

        // The only expected failure is NOT_AVAILABLE, when the hardware registers
        // carrying the dispatch pointer weren't initialized at wave creation.
        let kernel_entry = match api.wave_dispatch(wave_id) {
            Ok(dispatch) => Some(dbg_check!(api.dispatch_kernel_entry(dispatch), "dispatch_get_info")),
            Err(Status::NotAvailable) => None,
            Err(status) => fatal!("wave_get_info failed (rc={})", status),
        };

        // Find the code object that contains this pc.
        let code_object_key = code_object_map.range(..=pc).next_back()
            .filter(|&(&load_address, ref code_object)| pc - load_address <= code_object.mem_size)
            .map(|(&load_address, _)| load_address);

        if i != 0 {
            outln!();
        }
        outln!("--------------------------------------------------------");

        out!("wave_{}: pc=0x{:x} (kernel_code_entry=", wave_id.0, pc);
        match kernel_entry {
            Some(kernel_entry) => {
                out!("0x{:x}", kernel_entry);
                if let Some(key) = code_object_key {
                    if let Some(symbol) = code_object_map.get_mut(&key).unwrap().find_symbol(kernel_entry) {
                        out!(" <{}>", symbol.name);
                    }
                }
            }
            None => out!("not available"),
        }
        if stop_reason != StopReason::NONE {
            outln!(") (stopped, reason: {})", waves::stop_reason_string(stop_reason));
        } else {
            outln!(") (running)");
        }

        print_registers(api, wave_id);
        print_local_memory(api, wave_id);

        if let Some(key) = code_object_key {
            let architecture = dbg_check!(api.wave_architecture(wave_id), "wave_get_info");
            code_object_map.get_mut(&key).unwrap().disassemble(api, architecture, pc);
        }
    }
    true
}

// Register dump, grouped by register class; the "general" class goes last. A register
// belonging to several classes is printed only under the first one.
pub fn print_registers(api: &dyn DebugApi, wave_id: WaveId) {
    let architecture = dbg_check!(api.wave_architecture(wave_id), "wave_get_info");
    let classes = dbg_check!(api.register_class_list(architecture), "architecture_register_class_list");
    let register_ids = dbg_check!(api.wave_register_list(wave_id), "wave_register_list");

    let named_classes: Vec<(RegisterClassId, String)> = classes.into_iter()
        .map(|c| (c, dbg_check!(api.register_class_name(c), "register_class_get_info"))).collect();
    let (general, rest): (Vec<_>, Vec<_>) = named_classes.into_iter().partition(|(_, name)| name == "general");

    let mut printed_registers: HashSet<RegisterId> = HashSet::new();

    for (class_id, class_name) in rest.into_iter().chain(general.into_iter()) {
        out!("\n{} registers:", class_name);

        let mut last_register_size = 0usize;
        let mut column = 0usize;
        for &register_id in &register_ids {
            // Skip registers already printed as part of another register class.
            if printed_registers.contains(&register_id) {
                continue;
            }
            if !dbg_check!(api.register_is_in_class(class_id, register_id), "register_is_in_register_class") {
                continue;
            }

            let register_name = dbg_check!(api.register_name(register_id), "register_get_info");
            let register_type = dbg_check!(api.register_type(register_id), "register_get_info");
            let register_size = dbg_check!(api.register_size(register_id), "register_get_info");

            let mut buffer = vec![0u8; register_size];
            dbg_check!(api.read_register(wave_id, register_id, &mut buffer), "read_register");

            // Registers of equal size pack 16/size per line; registers larger than a u64
            // get a line of their own.
            let needs_line_break = register_size == 0 || register_size > 8 || register_size != last_register_size || {
                let c = column;
                column += 1;
                c % (16 / register_size) == 0
            };
            if needs_line_break {
                outln!();
                column = 1;
            }
            last_register_size = register_size;

            out!("{:>16}{}", format!("{}: ", register_name), register_value_string(&register_type, &buffer));
            printed_registers.insert(register_id);
        }
        outln!();
    }
}

// Vector-typed registers ("uint32_t[4]") are printed element by element, recursively,
// with indices. Everything else is big-endian hex.
pub fn register_value_string(register_type: &str, value: &[u8]) -> String {
    if let Some(pos) = register_type.rfind('[') {
        let element_type = &register_type[..pos];
        let digits: String = register_type[pos+1..].chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(element_count) = digits.parse::<usize>() {
            if element_count != 0 && value.len() % element_count == 0 {
                let element_size = value.len() / element_count;
                let mut r = String::new();
                for i in 0..element_count {
                    if i != 0 {
                        r.push(' ');
                    }
                    let _ = write!(r, "[{}] ", i);
                    r.push_str(&register_value_string(element_type, &value[element_size * i..element_size * (i + 1)]));
                }
                return r;
            }
        }
    }
    hex_string(value)
}

// Most significant byte leftmost, regardless of host endianness.
fn hex_string(value: &[u8]) -> String {
    let mut r = String::with_capacity(2 * value.len());
    for &b in value.iter().rev() {
        let _ = write!(r, "{:02x}", b);
    }
    r
}

// The wave's local address space (DWARF address space 3), dumped in 1024-word chunks
// until a read comes back short or fails, 8 words per line.
pub fn print_local_memory(api: &dyn DebugApi, wave_id: WaveId) {
    let process = dbg_check!(api.wave_process(wave_id), "wave_get_info");
    let architecture = dbg_check!(api.wave_architecture(wave_id), "wave_get_info");
    let local_address_space = dbg_check!(api.dwarf_address_space(architecture, DWARF_ADDRESS_SPACE_LOCAL), "dwarf_address_space_to_address_space");

    let mut base_address: u64 = 0;
    loop {
        let mut buffer = vec![0u8; 1024 * 4];
        let requested_size = buffer.len();
        let size = match api.read_wave_memory(process, wave_id, local_address_space, base_address, &mut buffer) {
            Ok(n) => n,
            Err(_) => break,
        };
        assert!(size % 4 == 0);
        buffer.truncate(size);

        if base_address == 0 {
            out!("\nLocal memory content:");
        }

        let mut column = 0usize;
        for (i, word) in buffer.chunks_exact(4).enumerate() {
            if column % 8 == 0 {
                out!("\n    0x{:04x}:", base_address + i as u64 * 4);
                column = 0;
            }
            out!(" {:08x}", u32::from_le_bytes(word.try_into().unwrap()));
            column += 1;
        }

        base_address += size as u64;
        if size != requested_size {
            break;
        }
    }
    if base_address != 0 {
        outln!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::*;
    use std::{sync::mpsc, thread};

    #[test]
    fn register_values() {
        assert_eq!(register_value_string("uint32_t", &[0x78, 0x56, 0x34, 0x12]), "12345678");
        assert_eq!(register_value_string("uint64_t", &[0, 0, 0, 0, 0xef, 0xbe, 0xad, 0xde]), "deadbeef00000000");
        assert_eq!(register_value_string("uint32_t[2]", &[1, 0, 0, 0, 2, 0, 0, 0]), "[0] 00000001 [1] 00000002");
        assert_eq!(register_value_string("int[2][2]", &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0]),
                   "[0] [0] 00000001 [1] 00000002 [1] [0] 00000003 [1] 00000004");
        // Malformed counts degrade to plain hex.
        assert_eq!(register_value_string("int[0]", &[0xab]), "ab");
    }

    #[test]
    fn concurrent_report_is_dropped() {
        let _serial = output_test_lock();
        let _captured = capture_output();

        let api = std::sync::Arc::new(SimApi::new());
        let (unblock_tx, unblock_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(1, SimWave::stopped(0x1000, StopReason::TRAP));
            state.block_code_object_list = Some(unblock_rx);
            state.code_object_list_entered = Some(entered_tx);
        }

        let api2 = api.clone();
        let first = thread::spawn(move || print_wavefronts(&*api2, ProcessId(1), false));

        // Wait until the first report is inside the lock, then race it.
        entered_rx.recv().unwrap();
        assert!(!print_wavefronts(&*api, ProcessId(1), false));

        unblock_tx.send(()).unwrap();
        assert!(first.join().unwrap());
    }

    #[test]
    fn full_report_smoke() {
        let _serial = output_test_lock();

        let api = SimApi::new();
        let elf_bytes = build_test_elf(&[("_Z6kernelv", 0x40, 0x80)]);
        let elf_len = elf_bytes.len();
        {
            let mut state = api.state.lock().unwrap();
            state.memory.insert(0x5000, elf_bytes);
            // The loaded image: executable bytes at the load address.
            state.memory.insert(0x9000_0000, vec![0u8; 0x1000]);
            state.code_objects.push(SimCodeObject {
                uri: format!("memory://1#offset=0x5000&size={}", elf_len),
                load_address: 0x9000_0000,
            });
            state.registers = vec![
                SimRegister {name: "s0".to_string(), ty: "uint32_t".to_string(), class: "scalar".to_string(), value: vec![1, 0, 0, 0]},
                SimRegister {name: "s1".to_string(), ty: "uint32_t".to_string(), class: "scalar".to_string(), value: vec![2, 0, 0, 0]},
                SimRegister {name: "v0".to_string(), ty: "uint32_t[2]".to_string(), class: "vector".to_string(), value: vec![3, 0, 0, 0, 4, 0, 0, 0]},
                SimRegister {name: "pc".to_string(), ty: "uint64_t".to_string(), class: "general".to_string(), value: vec![0x60, 0, 0, 0x90, 0, 0, 0, 0]},
            ];
            let mut wave = SimWave::stopped(0x9000_0060, StopReason::MEMORY_VIOLATION);
            wave.kernel_entry = Some(0x9000_0040);
            wave.local_memory = (0u32..16).flat_map(|w| w.to_le_bytes()).collect();
            state.waves.insert(7, wave);
        }

        let captured = capture_output();
        assert!(print_wavefronts(&api, ProcessId(1), false));
        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();

        assert!(text.contains("wave_7: pc=0x90000060"), "{}", text);
        assert!(text.contains("kernel_code_entry=0x90000040 <kernel()>"), "{}", text);
        assert!(text.contains("stopped, reason: MEMORY_VIOLATION"), "{}", text);
        assert!(text.contains("scalar registers:"), "{}", text);
        assert!(text.contains("s0: 00000001"), "{}", text);
        assert!(text.contains("v0: [0] 00000003 [1] 00000004"), "{}", text);
        // "general" is printed after the other classes.
        assert!(text.rfind("general registers:").unwrap() > text.rfind("vector registers:").unwrap(), "{}", text);
        assert!(text.contains("Local memory content:"), "{}", text);
        assert!(text.contains("    0x0000:"), "{}", text);
        assert!(text.contains("Disassembly for function kernel()"), "{}", text);
        assert!(text.contains(" => 0x90000060"), "{}", text);
        assert!(text.contains("End of disassembly."), "{}", text);
    }
}
