use crate::{*, dbgapi::*, util::*};
use std::{collections::{BTreeMap, VecDeque}, io, io::Write, mem, os::fd::{AsRawFd, RawFd}, slice, sync::{Arc, Mutex, MutexGuard, mpsc}};

// A small simulated GPU process behind the DebugApi trait. The notifier is a real
// nonblocking pipe so the worker's epoll loop runs unmodified; everything else is a
// Mutex<SimState> plus a call journal the tests assert on.

pub enum SimEvent {
    WaveStop(WaveId),
    WaveCommandTerminated(WaveId),
    CodeObjectListUpdated,
    Runtime(RuntimeState),
    QueueError,
    BreakpointResume,
}

pub struct SimWave {
    pub state: WaveState,
    pub stop_reason: StopReason,
    pub pc: u64,
    pub kernel_entry: Option<u64>,
    pub local_memory: Vec<u8>,
    // The wave dies instead of stopping when asked to stop.
    pub terminate_on_stop: bool,
}

impl SimWave {
    pub fn running(pc: u64) -> SimWave {
        SimWave {state: WaveState::Run, stop_reason: StopReason::NONE, pc, kernel_entry: None, local_memory: Vec::new(), terminate_on_stop: false}
    }

    pub fn stopped(pc: u64, stop_reason: StopReason) -> SimWave {
        SimWave {state: WaveState::Stop, stop_reason, pc, kernel_entry: None, local_memory: Vec::new(), terminate_on_stop: false}
    }
}

pub struct SimRegister {
    pub name: String,
    pub ty: String,
    pub class: String,
    pub value: Vec<u8>,
}

pub struct SimCodeObject {
    pub uri: String,
    pub load_address: u64,
}

pub struct SimState {
    pub waves: BTreeMap<u64, SimWave>,
    pub events: VecDeque<(EventId, SimEvent)>,
    // Events handed out by next_pending_event but not yet event_processed.
    delivered: Vec<(EventId, SimEvent)>,
    next_event_id: u64,
    // Global memory regions: start address -> bytes.
    pub memory: BTreeMap<u64, Vec<u8>>,
    pub code_objects: Vec<SimCodeObject>,
    pub register_classes: Vec<String>,
    pub registers: Vec<SimRegister>,
    pub instruction_size: usize,
    pub memory_precision_not_supported: bool,
    pub rbrk_breakpoint: Option<BreakpointId>,

    // What the agent did to us, in order.
    pub calls: Vec<String>,
    pub stop_requested: Vec<u64>,
    pub resumed: Vec<(u64, Exceptions)>,
    pub report_breakpoint_hits: usize,

    // When set, the next code_object_list call blocks until the sender is dropped or
    // signaled. Used to hold a report open while another thread races it.
    pub block_code_object_list: Option<mpsc::Receiver<()>>,
    // Signaled right before code_object_list blocks, so the test knows the report is in
    // progress.
    pub code_object_list_entered: Option<mpsc::Sender<()>>,
}

pub struct SimApi {
    pub state: Mutex<SimState>,
    notifier: Pipe,
}

impl SimApi {
    pub fn new() -> SimApi {
        SimApi {
            state: Mutex::new(SimState {
                waves: BTreeMap::new(),
                events: VecDeque::new(),
                delivered: Vec::new(),
                next_event_id: 1,
                memory: BTreeMap::new(),
                code_objects: Vec::new(),
                register_classes: vec!["general".to_string(), "scalar".to_string(), "vector".to_string()],
                registers: Vec::new(),
                instruction_size: 4,
                memory_precision_not_supported: false,
                rbrk_breakpoint: None,
                calls: Vec::new(),
                stop_requested: Vec::new(),
                resumed: Vec::new(),
                report_breakpoint_hits: 0,
                block_code_object_list: None,
                code_object_list_entered: None,
            }),
            notifier: create_pipe().unwrap(),
        }
    }

    // Queue an event and poke the notifier, like a GPU fault would.
    pub fn push_event(&self, event: SimEvent) {
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_event_id;
            state.next_event_id += 1;
            state.events.push_back((EventId(id), event));
        }
        unsafe {
            libc::write(self.notifier.write.as_raw_fd(), b"e".as_ptr() as *const libc::c_void, 1);
        }
    }

    fn lock(&self) -> MutexGuard<SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DebugApi for SimApi {
    fn initialize(&self) -> DbgResult<()> {
        self.lock().calls.push("initialize".to_string());
        Ok(())
    }

    fn finalize(&self) -> DbgResult<()> {
        self.lock().calls.push("finalize".to_string());
        Ok(())
    }

    fn attach(&self) -> DbgResult<ProcessId> {
        let mut state = self.lock();
        state.calls.push("attach".to_string());
        // Attaching plants the breakpoint at the runtime's notification address and
        // reports the runtime-loaded event.
        state.rbrk_breakpoint = Some(BreakpointId(1));
        let id = state.next_event_id;
        state.next_event_id += 1;
        state.events.push_front((EventId(id), SimEvent::Runtime(RuntimeState::LoadedSuccess)));
        Ok(ProcessId(1))
    }

    fn detach(&self, _process: ProcessId) -> DbgResult<()> {
        self.lock().calls.push("detach".to_string());
        Ok(())
    }

    fn notifier(&self, _process: ProcessId) -> DbgResult<RawFd> {
        Ok(self.notifier.read.as_raw_fd())
    }

    fn set_progress(&self, _process: ProcessId, progress: Progress) -> DbgResult<()> {
        self.lock().calls.push(format!("set_progress({:?})", progress));
        Ok(())
    }

    fn set_wave_creation(&self, _process: ProcessId, mode: WaveCreation) -> DbgResult<()> {
        self.lock().calls.push(format!("set_wave_creation({:?})", mode));
        Ok(())
    }

    fn set_memory_precision(&self, _process: ProcessId, precision: MemoryPrecision) -> DbgResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("set_memory_precision({:?})", precision));
        if state.memory_precision_not_supported {
            return Err(Status::NotSupported);
        }
        Ok(())
    }

    fn next_pending_event(&self, _process: ProcessId) -> DbgResult<Option<(EventId, EventKind)>> {
        let mut state = self.lock();
        match state.events.pop_front() {
            None => Ok(None),
            Some((id, event)) => {
                let kind = match &event {
                    SimEvent::WaveStop(_) => EventKind::WaveStop,
                    SimEvent::WaveCommandTerminated(_) => EventKind::WaveCommandTerminated,
                    SimEvent::CodeObjectListUpdated => EventKind::CodeObjectListUpdated,
                    SimEvent::Runtime(_) => EventKind::Runtime,
                    SimEvent::QueueError => EventKind::QueueError,
                    SimEvent::BreakpointResume => EventKind::BreakpointResume,
                };
                state.delivered.push((id, event));
                Ok(Some((id, kind)))
            }
        }
    }

    fn event_processed(&self, event: EventId) -> DbgResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("event_processed({})", event.0));
        state.delivered.retain(|(id, _)| *id != event);
        Ok(())
    }

    fn event_wave(&self, event: EventId) -> DbgResult<WaveId> {
        let state = self.lock();
        for (id, e) in &state.delivered {
            if *id != event {
                continue;
            }
            match e {
                SimEvent::WaveStop(wave) | SimEvent::WaveCommandTerminated(wave) => return Ok(*wave),
                _ => break,
            }
        }
        Err(Status::Error(-1))
    }

    fn event_runtime_state(&self, event: EventId) -> DbgResult<RuntimeState> {
        let state = self.lock();
        for (id, e) in &state.delivered {
            if *id != event {
                continue;
            }
            if let SimEvent::Runtime(runtime_state) = e {
                return Ok(*runtime_state);
            }
            break;
        }
        Err(Status::Error(-1))
    }

    fn wave_list(&self, _process: ProcessId) -> DbgResult<Vec<WaveId>> {
        Ok(self.lock().waves.keys().map(|&id| WaveId(id)).collect())
    }

    fn wave_state(&self, wave: WaveId) -> DbgResult<WaveState> {
        self.lock().waves.get(&wave.0).map(|w| w.state).ok_or(Status::InvalidWaveId)
    }

    fn wave_stop_reason(&self, wave: WaveId) -> DbgResult<StopReason> {
        self.lock().waves.get(&wave.0).map(|w| w.stop_reason).ok_or(Status::InvalidWaveId)
    }

    fn wave_pc(&self, wave: WaveId) -> DbgResult<u64> {
        self.lock().waves.get(&wave.0).map(|w| w.pc).ok_or(Status::InvalidWaveId)
    }

    fn wave_process(&self, _wave: WaveId) -> DbgResult<ProcessId> {
        Ok(ProcessId(1))
    }

    fn wave_architecture(&self, _wave: WaveId) -> DbgResult<ArchitectureId> {
        Ok(ArchitectureId(1))
    }

    fn wave_dispatch(&self, wave: WaveId) -> DbgResult<DispatchId> {
        let state = self.lock();
        let w = state.waves.get(&wave.0).ok_or(Status::InvalidWaveId)?;
        if w.kernel_entry.is_some() {
            Ok(DispatchId(wave.0))
        } else {
            Err(Status::NotAvailable)
        }
    }

    fn dispatch_kernel_entry(&self, dispatch: DispatchId) -> DbgResult<u64> {
        let state = self.lock();
        state.waves.get(&dispatch.0).and_then(|w| w.kernel_entry).ok_or(Status::NotAvailable)
    }

    fn wave_stop(&self, wave: WaveId) -> DbgResult<()> {
        let mut state = self.lock();
        if !state.waves.contains_key(&wave.0) {
            return Err(Status::InvalidWaveId);
        }
        state.stop_requested.push(wave.0);
        let id = state.next_event_id;
        state.next_event_id += 1;
        if state.waves.get(&wave.0).unwrap().terminate_on_stop {
            state.waves.remove(&wave.0);
            state.events.push_back((EventId(id), SimEvent::WaveCommandTerminated(wave)));
        } else {
            let w = state.waves.get_mut(&wave.0).unwrap();
            w.state = WaveState::Stop;
            state.events.push_back((EventId(id), SimEvent::WaveStop(wave)));
        }
        Ok(())
    }

    fn wave_resume(&self, wave: WaveId, _mode: ResumeMode, exceptions: Exceptions) -> DbgResult<()> {
        let mut state = self.lock();
        let w = match state.waves.get_mut(&wave.0) {
            Some(w) => w,
            None => return Err(Status::InvalidWaveId),
        };
        w.state = WaveState::Run;
        w.stop_reason = StopReason::NONE;
        state.resumed.push((wave.0, exceptions));
        state.calls.push(format!("wave_resume({}, 0x{:x})", wave.0, exceptions.bits()));
        Ok(())
    }

    fn code_object_list(&self, _process: ProcessId) -> DbgResult<Vec<CodeObjectId>> {
        let (entered, rx) = {
            let mut state = self.lock();
            (state.code_object_list_entered.take(), state.block_code_object_list.take())
        };
        if let Some(entered) = entered {
            let _ = entered.send(());
        }
        if let Some(rx) = rx {
            let _ = rx.recv();
        }
        Ok((0..self.lock().code_objects.len() as u64).map(CodeObjectId).collect())
    }

    fn code_object_load_address(&self, id: CodeObjectId) -> DbgResult<u64> {
        self.lock().code_objects.get(id.0 as usize).map(|c| c.load_address).ok_or(Status::Error(-1))
    }

    fn code_object_uri(&self, id: CodeObjectId) -> DbgResult<String> {
        self.lock().code_objects.get(id.0 as usize).map(|c| c.uri.clone()).ok_or(Status::Error(-1))
    }

    fn code_object_process(&self, _id: CodeObjectId) -> DbgResult<ProcessId> {
        Ok(ProcessId(1))
    }

    fn register_class_list(&self, _arch: ArchitectureId) -> DbgResult<Vec<RegisterClassId>> {
        Ok((0..self.lock().register_classes.len() as u64).map(RegisterClassId).collect())
    }

    fn register_class_name(&self, class: RegisterClassId) -> DbgResult<String> {
        self.lock().register_classes.get(class.0 as usize).cloned().ok_or(Status::Error(-1))
    }

    fn wave_register_list(&self, _wave: WaveId) -> DbgResult<Vec<RegisterId>> {
        Ok((0..self.lock().registers.len() as u64).map(RegisterId).collect())
    }

    fn register_is_in_class(&self, class: RegisterClassId, reg: RegisterId) -> DbgResult<bool> {
        let state = self.lock();
        let class_name = state.register_classes.get(class.0 as usize).ok_or(Status::Error(-1))?;
        let reg = state.registers.get(reg.0 as usize).ok_or(Status::Error(-1))?;
        Ok(&reg.class == class_name)
    }

    fn register_name(&self, reg: RegisterId) -> DbgResult<String> {
        self.lock().registers.get(reg.0 as usize).map(|r| r.name.clone()).ok_or(Status::Error(-1))
    }

    fn register_type(&self, reg: RegisterId) -> DbgResult<String> {
        self.lock().registers.get(reg.0 as usize).map(|r| r.ty.clone()).ok_or(Status::Error(-1))
    }

    fn register_size(&self, reg: RegisterId) -> DbgResult<usize> {
        self.lock().registers.get(reg.0 as usize).map(|r| r.value.len()).ok_or(Status::Error(-1))
    }

    fn read_register(&self, _wave: WaveId, reg: RegisterId, buf: &mut [u8]) -> DbgResult<()> {
        let state = self.lock();
        let reg = state.registers.get(reg.0 as usize).ok_or(Status::Error(-1))?;
        if buf.len() != reg.value.len() {
            return Err(Status::Error(-1));
        }
        buf.copy_from_slice(&reg.value);
        Ok(())
    }

    fn dwarf_address_space(&self, _arch: ArchitectureId, dwarf_space: u64) -> DbgResult<AddressSpaceId> {
        Ok(AddressSpaceId(dwarf_space))
    }

    fn read_global_memory(&self, _process: ProcessId, addr: u64, buf: &mut [u8]) -> DbgResult<usize> {
        let state = self.lock();
        let (&start, bytes) = state.memory.range(..=addr).next_back().ok_or(Status::MemoryAccess)?;
        let end = start + bytes.len() as u64;
        if addr >= end {
            return Err(Status::MemoryAccess);
        }
        let n = (buf.len() as u64).min(end - addr) as usize;
        let offset = (addr - start) as usize;
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn read_wave_memory(&self, _process: ProcessId, wave: WaveId, _space: AddressSpaceId, addr: u64, buf: &mut [u8]) -> DbgResult<usize> {
        let state = self.lock();
        let w = state.waves.get(&wave.0).ok_or(Status::InvalidWaveId)?;
        if addr >= w.local_memory.len() as u64 {
            return Err(Status::MemoryAccess);
        }
        let n = buf.len().min(w.local_memory.len() - addr as usize);
        buf[..n].copy_from_slice(&w.local_memory[addr as usize..addr as usize + n]);
        Ok(n)
    }

    fn largest_instruction_size(&self, _arch: ArchitectureId) -> DbgResult<usize> {
        Ok(8)
    }

    fn disassemble_instruction(&self, _arch: ArchitectureId, _addr: u64, bytes: &[u8],
                               _symbolizer: Option<&mut dyn FnMut(u64) -> String>) -> DbgResult<(String, usize)> {
        let size = self.lock().instruction_size;
        if bytes.len() < size {
            return Err(Status::Error(-1));
        }
        Ok(("s_nop".to_string(), size))
    }

    fn rbrk_breakpoint(&self) -> Option<BreakpointId> {
        self.lock().rbrk_breakpoint
    }

    fn report_breakpoint_hit(&self, _breakpoint: BreakpointId) -> DbgResult<BreakpointAction> {
        let mut state = self.lock();
        state.report_breakpoint_hits += 1;
        state.calls.push("report_breakpoint_hit".to_string());
        Ok(BreakpointAction::Resume)
    }
}

// Tests that replace the process-wide output sink serialize on this.
pub fn output_test_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn capture_output() -> Arc<Mutex<Vec<u8>>> {
    let buf = Arc::new(Mutex::new(Vec::new()));
    crate::log::set_output(Box::new(CaptureSink(buf.clone())), 2);
    buf
}

fn bytes_of<T: Copy>(t: &T) -> &[u8] {
    unsafe {slice::from_raw_parts(t as *const T as *const u8, mem::size_of::<T>())}
}

// A minimal relocatable-looking code object: one PT_LOAD segment (vaddr 0, memsz 0x1000)
// and a .symtab with the given (name, value, size) function symbols.
pub fn build_test_elf(symbols: &[(&str, u64, u64)]) -> Vec<u8> {
    let ehdr_size = mem::size_of::<libc::Elf64_Ehdr>();
    let phdr_size = mem::size_of::<libc::Elf64_Phdr>();
    let shdr_size = mem::size_of::<libc::Elf64_Shdr>();
    let sym_size = mem::size_of::<libc::Elf64_Sym>();

    let mut strtab: Vec<u8> = vec![0];
    let mut name_offsets: Vec<u32> = Vec::new();
    for &(name, _, _) in symbols {
        name_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let shstrtab: &[u8] = b"\0.symtab\0.strtab\0.shstrtab\0";

    let symtab_offset = ehdr_size + phdr_size;
    let symtab_size = (1 + symbols.len()) * sym_size;
    let strtab_offset = symtab_offset + symtab_size;
    let shstrtab_offset = strtab_offset + strtab.len();
    let shoff = shstrtab_offset + shstrtab.len();

    let mut ehdr: libc::Elf64_Ehdr = unsafe {mem::zeroed()};
    ehdr.e_ident[..8].copy_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    ehdr.e_type = 3; // ET_DYN
    ehdr.e_machine = 0xe0; // EM_AMDGPU
    ehdr.e_version = 1;
    ehdr.e_phoff = ehdr_size as u64;
    ehdr.e_shoff = shoff as u64;
    ehdr.e_ehsize = ehdr_size as u16;
    ehdr.e_phentsize = phdr_size as u16;
    ehdr.e_phnum = 1;
    ehdr.e_shentsize = shdr_size as u16;
    ehdr.e_shnum = 4;
    ehdr.e_shstrndx = 3;

    let mut phdr: libc::Elf64_Phdr = unsafe {mem::zeroed()};
    phdr.p_type = 1; // PT_LOAD
    phdr.p_flags = 5; // R+X
    phdr.p_vaddr = 0;
    phdr.p_memsz = 0x1000;
    phdr.p_align = 0x1000;

    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(bytes_of(&ehdr));
    out.extend_from_slice(bytes_of(&phdr));

    let null_sym: libc::Elf64_Sym = unsafe {mem::zeroed()};
    out.extend_from_slice(bytes_of(&null_sym));
    for (i, &(_, value, size)) in symbols.iter().enumerate() {
        let mut sym: libc::Elf64_Sym = unsafe {mem::zeroed()};
        sym.st_name = name_offsets[i];
        sym.st_info = 0x12; // GLOBAL | FUNC
        sym.st_shndx = 1;
        sym.st_value = value;
        sym.st_size = size;
        out.extend_from_slice(bytes_of(&sym));
    }

    out.extend_from_slice(&strtab);
    out.extend_from_slice(shstrtab);

    let null_shdr: libc::Elf64_Shdr = unsafe {mem::zeroed()};
    out.extend_from_slice(bytes_of(&null_shdr));

    let mut symtab_shdr: libc::Elf64_Shdr = unsafe {mem::zeroed()};
    symtab_shdr.sh_name = 1;
    symtab_shdr.sh_type = 2; // SHT_SYMTAB
    symtab_shdr.sh_offset = symtab_offset as u64;
    symtab_shdr.sh_size = symtab_size as u64;
    symtab_shdr.sh_link = 2;
    symtab_shdr.sh_entsize = sym_size as u64;
    out.extend_from_slice(bytes_of(&symtab_shdr));

    let mut strtab_shdr: libc::Elf64_Shdr = unsafe {mem::zeroed()};
    strtab_shdr.sh_name = 9;
    strtab_shdr.sh_type = 3; // SHT_STRTAB
    strtab_shdr.sh_offset = strtab_offset as u64;
    strtab_shdr.sh_size = strtab.len() as u64;
    out.extend_from_slice(bytes_of(&strtab_shdr));

    let mut shstrtab_shdr: libc::Elf64_Shdr = unsafe {mem::zeroed()};
    shstrtab_shdr.sh_name = 17;
    shstrtab_shdr.sh_type = 3; // SHT_STRTAB
    shstrtab_shdr.sh_offset = shstrtab_offset as u64;
    shstrtab_shdr.sh_size = shstrtab.len() as u64;
    out.extend_from_slice(bytes_of(&shstrtab_shdr));

    assert_eq!(out.len(), shoff + 4 * shdr_size);
    out
}
