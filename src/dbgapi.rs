use bitflags::*;
use std::{fmt, os::fd::RawFd};

// The slice of the debugger API this agent consumes, modeled as plain handle types plus
// the DebugApi trait. The production implementation (ffi.rs, `agent` feature) forwards to
// the amd-dbgapi shared library; unit tests drive the same code against a simulated GPU
// process (sim.rs). Everything downstream of the worker thread only sees this trait.

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ProcessId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct WaveId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EventId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CodeObjectId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DispatchId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ArchitectureId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RegisterId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RegisterClassId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BreakpointId(pub u64);
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AddressSpaceId(pub u64);

// DWARF address space number of a wave's local memory.
pub const DWARF_ADDRESS_SPACE_LOCAL: u64 = 0x3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    WaveStop,
    WaveCommandTerminated,
    CodeObjectListUpdated,
    Runtime,
    QueueError,
    BreakpointResume,
    Unknown(i32),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaveState {
    Run,
    Stop,
    SingleStep,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RuntimeState {
    LoadedSuccess,
    Unloaded,
    LoadedErrorRestriction,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Progress {
    Normal,
    NoForward,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaveCreation {
    Normal,
    Stop,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResumeMode {
    Normal,
    SingleStep,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryPrecision {
    None,
    Precise,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakpointAction {
    Resume,
    Halt,
}

bitflags! {
    pub struct StopReason: u32 {
        const NONE = 0;
        const BREAKPOINT = 1 << 0;
        const WATCHPOINT = 1 << 1;
        const SINGLE_STEP = 1 << 2;
        const FP_INPUT_DENORMAL = 1 << 3;
        const FP_DIVIDE_BY_0 = 1 << 4;
        const FP_OVERFLOW = 1 << 5;
        const FP_UNDERFLOW = 1 << 6;
        const FP_INEXACT = 1 << 7;
        const FP_INVALID_OPERATION = 1 << 8;
        const INT_DIVIDE_BY_0 = 1 << 9;
        const DEBUG_TRAP = 1 << 10;
        const ASSERT_TRAP = 1 << 11;
        const TRAP = 1 << 12;
        const MEMORY_VIOLATION = 1 << 13;
        const ADDRESS_ERROR = 1 << 14;
        const ILLEGAL_INSTRUCTION = 1 << 15;
        const ECC_ERROR = 1 << 16;
        const FATAL_HALT = 1 << 17;
    }
}

bitflags! {
    pub struct Exceptions: u32 {
        const NONE = 0;
        const WAVE_ABORT = 1 << 0;
        const WAVE_TRAP = 1 << 1;
        const WAVE_MATH_ERROR = 1 << 2;
        const WAVE_ILLEGAL_INSTRUCTION = 1 << 3;
        const WAVE_MEMORY_VIOLATION = 1 << 4;
        const WAVE_ADDRESS_ERROR = 1 << 5;
    }
}

// The tolerated failure codes get their own variants; everything else stays a raw status
// code and is treated as fatal by the callers (through dbg_check!).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    InvalidWaveId,
    NotAvailable,
    NotSupported,
    MemoryAccess,
    Error(i32),
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::InvalidWaveId => -17,
            Status::NotAvailable => -4,
            Status::NotSupported => -5,
            Status::MemoryAccess => -21,
            Status::Error(code) => code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

pub type DbgResult<T> = std::result::Result<T, Status>;

// Unwraps a debugger-API result or aborts the process with the status code.
#[macro_export]
macro_rules! dbg_check {
    ($e:expr, $what:expr) => (
        match $e {
            Ok(v) => v,
            Err(status) => $crate::fatal!("{} failed (rc={})", $what, status),
        }
    );
}

pub trait DebugApi: Send + Sync {
    fn initialize(&self) -> DbgResult<()>;
    fn finalize(&self) -> DbgResult<()>;
    fn attach(&self) -> DbgResult<ProcessId>;
    fn detach(&self, process: ProcessId) -> DbgResult<()>;

    // File descriptor signaled when new events are ready. Nonblocking; owned by the API.
    fn notifier(&self, process: ProcessId) -> DbgResult<RawFd>;

    fn set_progress(&self, process: ProcessId, progress: Progress) -> DbgResult<()>;
    fn set_wave_creation(&self, process: ProcessId, mode: WaveCreation) -> DbgResult<()>;
    fn set_memory_precision(&self, process: ProcessId, precision: MemoryPrecision) -> DbgResult<()>;

    fn next_pending_event(&self, process: ProcessId) -> DbgResult<Option<(EventId, EventKind)>>;
    fn event_processed(&self, event: EventId) -> DbgResult<()>;
    fn event_wave(&self, event: EventId) -> DbgResult<WaveId>;
    fn event_runtime_state(&self, event: EventId) -> DbgResult<RuntimeState>;

    fn wave_list(&self, process: ProcessId) -> DbgResult<Vec<WaveId>>;
    fn wave_state(&self, wave: WaveId) -> DbgResult<WaveState>;
    fn wave_stop_reason(&self, wave: WaveId) -> DbgResult<StopReason>;
    fn wave_pc(&self, wave: WaveId) -> DbgResult<u64>;
    fn wave_process(&self, wave: WaveId) -> DbgResult<ProcessId>;
    fn wave_architecture(&self, wave: WaveId) -> DbgResult<ArchitectureId>;
    fn wave_dispatch(&self, wave: WaveId) -> DbgResult<DispatchId>;
    fn dispatch_kernel_entry(&self, dispatch: DispatchId) -> DbgResult<u64>;
    fn wave_stop(&self, wave: WaveId) -> DbgResult<()>;
    fn wave_resume(&self, wave: WaveId, mode: ResumeMode, exceptions: Exceptions) -> DbgResult<()>;

    fn code_object_list(&self, process: ProcessId) -> DbgResult<Vec<CodeObjectId>>;
    fn code_object_load_address(&self, id: CodeObjectId) -> DbgResult<u64>;
    fn code_object_uri(&self, id: CodeObjectId) -> DbgResult<String>;
    fn code_object_process(&self, id: CodeObjectId) -> DbgResult<ProcessId>;

    fn register_class_list(&self, arch: ArchitectureId) -> DbgResult<Vec<RegisterClassId>>;
    fn register_class_name(&self, class: RegisterClassId) -> DbgResult<String>;
    fn wave_register_list(&self, wave: WaveId) -> DbgResult<Vec<RegisterId>>;
    fn register_is_in_class(&self, class: RegisterClassId, reg: RegisterId) -> DbgResult<bool>;
    fn register_name(&self, reg: RegisterId) -> DbgResult<String>;
    fn register_type(&self, reg: RegisterId) -> DbgResult<String>;
    fn register_size(&self, reg: RegisterId) -> DbgResult<usize>;
    fn read_register(&self, wave: WaveId, reg: RegisterId, buf: &mut [u8]) -> DbgResult<()>;

    fn dwarf_address_space(&self, arch: ArchitectureId, dwarf_space: u64) -> DbgResult<AddressSpaceId>;

    // Reads of the debuggee's global memory (no wave context). May return fewer bytes
    // than requested.
    fn read_global_memory(&self, process: ProcessId, addr: u64, buf: &mut [u8]) -> DbgResult<usize>;
    // Reads of a wave's view of an address space (e.g. local memory).
    fn read_wave_memory(&self, process: ProcessId, wave: WaveId, space: AddressSpaceId, addr: u64, buf: &mut [u8]) -> DbgResult<usize>;

    fn largest_instruction_size(&self, arch: ArchitectureId) -> DbgResult<usize>;
    // Decodes one instruction, returning its text and byte size. The symbolizer renders
    // addresses appearing in operands.
    fn disassemble_instruction(&self, arch: ArchitectureId, addr: u64, bytes: &[u8],
                               symbolizer: Option<&mut dyn FnMut(u64) -> String>) -> DbgResult<(String, usize)>;

    // The breakpoint the API asked us to plant at the runtime's code-object notification
    // address, if currently installed.
    fn rbrk_breakpoint(&self) -> Option<BreakpointId>;
    fn report_breakpoint_hit(&self, breakpoint: BreakpointId) -> DbgResult<BreakpointAction>;
}
