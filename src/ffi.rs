#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use crate::{*, dbgapi::*};
use libc::{c_char, c_void, size_t};
use std::{ffi::CStr, io, mem, ptr, slice, os::fd::RawFd, sync::atomic::{AtomicI32, AtomicU64, Ordering}};

// Bindings to the amd-dbgapi shared library, plus the callback vtable it consumes.
// Constants are transcribed from amd-dbgapi.h. Only built with the `agent` feature, so
// the core and its tests don't need a ROCm install.

pub type amd_dbgapi_status_t = i32;

pub const AMD_DBGAPI_STATUS_SUCCESS: amd_dbgapi_status_t = 0;
pub const AMD_DBGAPI_STATUS_ERROR: amd_dbgapi_status_t = -1;
pub const AMD_DBGAPI_STATUS_FATAL: amd_dbgapi_status_t = -2;
pub const AMD_DBGAPI_STATUS_ERROR_NOT_AVAILABLE: amd_dbgapi_status_t = -4;
pub const AMD_DBGAPI_STATUS_ERROR_NOT_SUPPORTED: amd_dbgapi_status_t = -5;
pub const AMD_DBGAPI_STATUS_ERROR_INVALID_ARGUMENT: amd_dbgapi_status_t = -6;
pub const AMD_DBGAPI_STATUS_ERROR_INVALID_ARGUMENT_COMPATIBILITY: amd_dbgapi_status_t = -7;
pub const AMD_DBGAPI_STATUS_ERROR_INVALID_WAVE_ID: amd_dbgapi_status_t = -17;
pub const AMD_DBGAPI_STATUS_ERROR_MEMORY_ACCESS: amd_dbgapi_status_t = -21;

fn status_result(status: amd_dbgapi_status_t) -> DbgResult<()> {
    match status {
        AMD_DBGAPI_STATUS_SUCCESS => Ok(()),
        AMD_DBGAPI_STATUS_ERROR_INVALID_WAVE_ID => Err(Status::InvalidWaveId),
        AMD_DBGAPI_STATUS_ERROR_NOT_AVAILABLE => Err(Status::NotAvailable),
        AMD_DBGAPI_STATUS_ERROR_NOT_SUPPORTED => Err(Status::NotSupported),
        AMD_DBGAPI_STATUS_ERROR_MEMORY_ACCESS => Err(Status::MemoryAccess),
        code => Err(Status::Error(code)),
    }
}

// Event kinds.
pub const AMD_DBGAPI_EVENT_KIND_NONE: i32 = 0;
pub const AMD_DBGAPI_EVENT_KIND_WAVE_STOP: i32 = 1;
pub const AMD_DBGAPI_EVENT_KIND_WAVE_COMMAND_TERMINATED: i32 = 2;
pub const AMD_DBGAPI_EVENT_KIND_CODE_OBJECT_LIST_UPDATED: i32 = 3;
pub const AMD_DBGAPI_EVENT_KIND_BREAKPOINT_RESUME: i32 = 4;
pub const AMD_DBGAPI_EVENT_KIND_RUNTIME: i32 = 5;
pub const AMD_DBGAPI_EVENT_KIND_QUEUE_ERROR: i32 = 6;

// Runtime states.
pub const AMD_DBGAPI_RUNTIME_STATE_LOADED_SUCCESS: i32 = 1;
pub const AMD_DBGAPI_RUNTIME_STATE_UNLOADED: i32 = 2;
pub const AMD_DBGAPI_RUNTIME_STATE_LOADED_ERROR_RESTRICTION: i32 = 3;

// Wave states.
pub const AMD_DBGAPI_WAVE_STATE_RUN: i32 = 1;
pub const AMD_DBGAPI_WAVE_STATE_SINGLE_STEP: i32 = 2;
pub const AMD_DBGAPI_WAVE_STATE_STOP: i32 = 3;

// Progress / wave creation / resume / memory precision.
pub const AMD_DBGAPI_PROGRESS_NORMAL: i32 = 0;
pub const AMD_DBGAPI_PROGRESS_NO_FORWARD: i32 = 1;
pub const AMD_DBGAPI_WAVE_CREATION_NORMAL: i32 = 0;
pub const AMD_DBGAPI_WAVE_CREATION_STOP: i32 = 1;
pub const AMD_DBGAPI_RESUME_MODE_NORMAL: i32 = 0;
pub const AMD_DBGAPI_RESUME_MODE_SINGLE_STEP: i32 = 1;
pub const AMD_DBGAPI_MEMORY_PRECISION_NONE: i32 = 0;
pub const AMD_DBGAPI_MEMORY_PRECISION_PRECISE: i32 = 1;

// Info queries.
pub const AMD_DBGAPI_PROCESS_INFO_NOTIFIER: i32 = 1;
pub const AMD_DBGAPI_EVENT_INFO_KIND: i32 = 1;
pub const AMD_DBGAPI_EVENT_INFO_WAVE: i32 = 2;
pub const AMD_DBGAPI_EVENT_INFO_RUNTIME_STATE: i32 = 4;
pub const AMD_DBGAPI_WAVE_INFO_STATE: i32 = 1;
pub const AMD_DBGAPI_WAVE_INFO_STOP_REASON: i32 = 2;
pub const AMD_DBGAPI_WAVE_INFO_DISPATCH: i32 = 3;
pub const AMD_DBGAPI_WAVE_INFO_PROCESS: i32 = 5;
pub const AMD_DBGAPI_WAVE_INFO_ARCHITECTURE: i32 = 6;
pub const AMD_DBGAPI_WAVE_INFO_PC: i32 = 7;
pub const AMD_DBGAPI_DISPATCH_INFO_KERNEL_CODE_ENTRY_ADDRESS: i32 = 11;
pub const AMD_DBGAPI_CODE_OBJECT_INFO_PROCESS: i32 = 1;
pub const AMD_DBGAPI_CODE_OBJECT_INFO_URI_NAME: i32 = 2;
pub const AMD_DBGAPI_CODE_OBJECT_INFO_LOAD_ADDRESS: i32 = 3;
pub const AMD_DBGAPI_ARCHITECTURE_INFO_LARGEST_INSTRUCTION_SIZE: i32 = 3;
pub const AMD_DBGAPI_REGISTER_CLASS_INFO_NAME: i32 = 2;
pub const AMD_DBGAPI_REGISTER_INFO_NAME: i32 = 2;
pub const AMD_DBGAPI_REGISTER_INFO_TYPE: i32 = 4;
pub const AMD_DBGAPI_REGISTER_INFO_SIZE: i32 = 5;
pub const AMD_DBGAPI_REGISTER_CLASS_STATE_NOT_MEMBER: i32 = 0;
pub const AMD_DBGAPI_REGISTER_CLASS_STATE_MEMBER: i32 = 1;

pub const AMD_DBGAPI_CLIENT_PROCESS_INFO_OS_PID: i32 = 1;
pub const AMD_DBGAPI_CLIENT_PROCESS_INFO_CORE_STATE: i32 = 2;

pub const AMD_DBGAPI_WAVE_NONE: WaveId = WaveId(0);
pub const AMD_DBGAPI_LANE_NONE: u64 = u64::MAX;
pub const AMD_DBGAPI_ADDRESS_SPACE_GLOBAL: AddressSpaceId = AddressSpaceId(1);

// The r_debug-style struct the GPU runtime exports; r_brk is the address it calls when
// the code-object list changes.
#[repr(C)]
pub struct amdgpu_r_debug {
    pub r_version: i32,
    pub r_map: usize,
    pub r_brk: u64,
    pub r_state: i32,
    pub r_ldbase: u64,
}

#[repr(C)]
pub struct amd_dbgapi_callbacks_t {
    pub allocate_memory: Option<unsafe extern "C" fn(byte_size: size_t) -> *mut c_void>,
    pub deallocate_memory: Option<unsafe extern "C" fn(data: *mut c_void)>,
    pub client_process_get_info: Option<unsafe extern "C" fn(client_process_id: *mut c_void, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t>,
    pub insert_breakpoint: Option<unsafe extern "C" fn(client_process_id: *mut c_void, address: u64, breakpoint_id: BreakpointId) -> amd_dbgapi_status_t>,
    pub remove_breakpoint: Option<unsafe extern "C" fn(client_process_id: *mut c_void, breakpoint_id: BreakpointId) -> amd_dbgapi_status_t>,
    pub xfer_global_memory: Option<unsafe extern "C" fn(client_process_id: *mut c_void, global_address: u64, value_size: *mut size_t, read_buffer: *mut c_void, write_buffer: *const c_void) -> amd_dbgapi_status_t>,
    pub log_message: Option<unsafe extern "C" fn(level: i32, message: *const c_char)>,
}

#[link(name = "amd-dbgapi")]
extern "C" {
    static _amdgpu_r_debug: amdgpu_r_debug;

    fn amd_dbgapi_initialize(callbacks: *const amd_dbgapi_callbacks_t) -> amd_dbgapi_status_t;
    fn amd_dbgapi_finalize() -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_attach(client_process_id: *mut c_void, process_id: *mut ProcessId) -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_detach(process_id: ProcessId) -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_get_info(process_id: ProcessId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_next_pending_event(process_id: ProcessId, event_id: *mut EventId, kind: *mut i32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_event_get_info(event_id: EventId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_event_processed(event_id: EventId) -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_set_progress(process_id: ProcessId, progress: i32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_set_wave_creation(process_id: ProcessId, creation: i32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_set_memory_precision(process_id: ProcessId, precision: i32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_wave_list(process_id: ProcessId, count: *mut size_t, waves: *mut *mut WaveId, changed: *mut i32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_wave_get_info(wave_id: WaveId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_wave_stop(wave_id: WaveId) -> amd_dbgapi_status_t;
    fn amd_dbgapi_wave_resume(wave_id: WaveId, resume_mode: i32, exceptions: u32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_dispatch_get_info(dispatch_id: DispatchId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_process_code_object_list(process_id: ProcessId, count: *mut size_t, code_objects: *mut *mut CodeObjectId, changed: *mut i32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_code_object_get_info(code_object_id: CodeObjectId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_architecture_get_info(architecture_id: ArchitectureId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_architecture_register_class_list(architecture_id: ArchitectureId, count: *mut size_t, classes: *mut *mut RegisterClassId) -> amd_dbgapi_status_t;
    fn amd_dbgapi_architecture_register_class_get_info(class_id: RegisterClassId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_wave_register_list(wave_id: WaveId, count: *mut size_t, registers: *mut *mut RegisterId) -> amd_dbgapi_status_t;
    fn amd_dbgapi_register_get_info(register_id: RegisterId, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_register_is_in_register_class(class_id: RegisterClassId, register_id: RegisterId, state: *mut i32) -> amd_dbgapi_status_t;
    fn amd_dbgapi_read_register(wave_id: WaveId, register_id: RegisterId, offset: size_t, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_dwarf_address_space_to_address_space(architecture_id: ArchitectureId, dwarf_address_space: u64, address_space_id: *mut AddressSpaceId) -> amd_dbgapi_status_t;
    fn amd_dbgapi_read_memory(process_id: ProcessId, wave_id: WaveId, lane_id: u64, address_space_id: AddressSpaceId, address: u64, value_size: *mut size_t, value: *mut c_void) -> amd_dbgapi_status_t;
    fn amd_dbgapi_disassemble_instruction(architecture_id: ArchitectureId, address: u64, size: *mut size_t, memory: *const c_void, instruction_text: *mut *mut c_char, symbolizer_id: usize, symbolizer: Option<unsafe extern "C" fn(symbolizer_id: usize, address: u64, symbol_text: *mut *mut c_char) -> amd_dbgapi_status_t>) -> amd_dbgapi_status_t;
    fn amd_dbgapi_report_breakpoint_hit(breakpoint_id: BreakpointId, client_thread_id: usize, action: *mut i32) -> amd_dbgapi_status_t;
}

// The API's memory-transfer back end: pread/pwrite on /proc/self/mem, opened at attach.
static SELF_MEM_FD: AtomicI32 = AtomicI32::new(-1);

// The breakpoint the API planted at the runtime's notification address. Dedicated slot;
// installed and cleared atomically from the insert/remove callbacks.
const RBRK_BREAKPOINT_NONE: u64 = u64::MAX;
static RBRK_BREAKPOINT: AtomicU64 = AtomicU64::new(RBRK_BREAKPOINT_NONE);

unsafe extern "C" fn callback_allocate_memory(byte_size: size_t) -> *mut c_void {
    libc::malloc(byte_size)
}

unsafe extern "C" fn callback_deallocate_memory(data: *mut c_void) {
    libc::free(data);
}

unsafe extern "C" fn callback_client_process_get_info(client_process_id: *mut c_void, query: i32, value_size: size_t, value: *mut c_void) -> amd_dbgapi_status_t {
    if value.is_null() {
        return AMD_DBGAPI_STATUS_ERROR_INVALID_ARGUMENT;
    }
    match query {
        AMD_DBGAPI_CLIENT_PROCESS_INFO_OS_PID => {
            if value_size != mem::size_of::<libc::pid_t>() {
                return AMD_DBGAPI_STATUS_ERROR_INVALID_ARGUMENT_COMPATIBILITY;
            }
            *(value as *mut libc::pid_t) = libc::getpid();
            AMD_DBGAPI_STATUS_SUCCESS
        }
        AMD_DBGAPI_CLIENT_PROCESS_INFO_CORE_STATE => AMD_DBGAPI_STATUS_ERROR_NOT_AVAILABLE,
        _ => AMD_DBGAPI_STATUS_ERROR_INVALID_ARGUMENT,
    }
}

unsafe extern "C" fn callback_insert_breakpoint(_client_process_id: *mut c_void, address: u64, breakpoint_id: BreakpointId) -> amd_dbgapi_status_t {
    if address == _amdgpu_r_debug.r_brk {
        RBRK_BREAKPOINT.store(breakpoint_id.0, Ordering::Relaxed);
        return AMD_DBGAPI_STATUS_SUCCESS;
    }
    AMD_DBGAPI_STATUS_ERROR
}

unsafe extern "C" fn callback_remove_breakpoint(_client_process_id: *mut c_void, breakpoint_id: BreakpointId) -> amd_dbgapi_status_t {
    if RBRK_BREAKPOINT.compare_exchange(breakpoint_id.0, RBRK_BREAKPOINT_NONE, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
        return AMD_DBGAPI_STATUS_SUCCESS;
    }
    AMD_DBGAPI_STATUS_ERROR
}

unsafe extern "C" fn callback_xfer_global_memory(client_process_id: *mut c_void, global_address: u64, value_size: *mut size_t, read_buffer: *mut c_void, write_buffer: *const c_void) -> amd_dbgapi_status_t {
    if read_buffer.is_null() == write_buffer.is_null() {
        return AMD_DBGAPI_STATUS_ERROR_INVALID_ARGUMENT_COMPATIBILITY;
    }
    if client_process_id.is_null() {
        return AMD_DBGAPI_STATUS_ERROR_INVALID_ARGUMENT;
    }
    let fd = (*(client_process_id as *const AtomicI32)).load(Ordering::Relaxed);
    if fd < 0 {
        return AMD_DBGAPI_STATUS_ERROR;
    }
    let nbytes = if write_buffer.is_null() {
        libc::pread(fd, read_buffer, *value_size, global_address as libc::off_t)
    } else {
        libc::pwrite(fd, write_buffer, *value_size, global_address as libc::off_t)
    };
    if nbytes == -1 {
        return AMD_DBGAPI_STATUS_ERROR_MEMORY_ACCESS;
    }
    *value_size = nbytes as size_t;
    AMD_DBGAPI_STATUS_SUCCESS
}

unsafe extern "C" fn callback_log_message(_level: i32, message: *const c_char) {
    if !message.is_null() {
        outln!("rocm-dbgapi: {}", CStr::from_ptr(message).to_string_lossy());
    }
}

static DBGAPI_CALLBACKS: amd_dbgapi_callbacks_t = amd_dbgapi_callbacks_t {
    allocate_memory: Some(callback_allocate_memory),
    deallocate_memory: Some(callback_deallocate_memory),
    client_process_get_info: Some(callback_client_process_get_info),
    insert_breakpoint: Some(callback_insert_breakpoint),
    remove_breakpoint: Some(callback_remove_breakpoint),
    xfer_global_memory: Some(callback_xfer_global_memory),
    log_message: Some(callback_log_message),
};

unsafe fn get_info<T: Copy>(f: impl FnOnce(size_t, *mut c_void) -> amd_dbgapi_status_t) -> DbgResult<T> {
    let mut value: T = mem::zeroed();
    status_result(f(mem::size_of::<T>(), &mut value as *mut T as *mut c_void))?;
    Ok(value)
}

// String-valued queries return malloc'd char* that we own.
unsafe fn get_info_string(f: impl FnOnce(size_t, *mut c_void) -> amd_dbgapi_status_t) -> DbgResult<String> {
    let text: *mut c_char = get_info(f)?;
    if text.is_null() {
        return Err(Status::Error(AMD_DBGAPI_STATUS_ERROR));
    }
    let s = CStr::from_ptr(text).to_string_lossy().into_owned();
    libc::free(text as *mut c_void);
    Ok(s)
}

unsafe fn take_list<T: Copy>(count: size_t, list: *mut T) -> Vec<T> {
    if list.is_null() {
        return Vec::new();
    }
    let v = slice::from_raw_parts(list, count).to_vec();
    libc::free(list as *mut c_void);
    v
}

unsafe extern "C" fn symbolizer_trampoline(symbolizer_id: usize, address: u64, symbol_text: *mut *mut c_char) -> amd_dbgapi_status_t {
    let callback = &mut *(symbolizer_id as *mut &mut dyn FnMut(u64) -> String);
    let text = callback(address);
    // Freed by the API through the deallocate callback.
    let buf = libc::malloc(text.len() + 1) as *mut c_char;
    if buf.is_null() {
        return AMD_DBGAPI_STATUS_ERROR;
    }
    ptr::copy_nonoverlapping(text.as_ptr(), buf as *mut u8, text.len());
    *buf.add(text.len()) = 0;
    *symbol_text = buf;
    AMD_DBGAPI_STATUS_SUCCESS
}

// The production DebugApi: forwards every call to amd-dbgapi.
pub struct DbgApiFfi;

impl DebugApi for DbgApiFfi {
    fn initialize(&self) -> DbgResult<()> {
        unsafe {status_result(amd_dbgapi_initialize(&DBGAPI_CALLBACKS))}
    }

    fn finalize(&self) -> DbgResult<()> {
        unsafe {status_result(amd_dbgapi_finalize())}
    }

    fn attach(&self) -> DbgResult<ProcessId> {
        unsafe {
            let fd = libc::open(b"/proc/self/mem\0".as_ptr() as *const c_char, libc::O_RDWR | libc::O_CLOEXEC);
            if fd == -1 {
                fatal!("failed to open /proc/self/mem: {}", io::Error::last_os_error());
            }
            SELF_MEM_FD.store(fd, Ordering::Relaxed);
            let mut process = ProcessId(0);
            status_result(amd_dbgapi_process_attach(&SELF_MEM_FD as *const AtomicI32 as *mut c_void, &mut process))?;
            Ok(process)
        }
    }

    fn detach(&self, process: ProcessId) -> DbgResult<()> {
        unsafe {
            status_result(amd_dbgapi_process_detach(process))?;
            let fd = SELF_MEM_FD.swap(-1, Ordering::Relaxed);
            if fd >= 0 {
                libc::close(fd);
            }
            Ok(())
        }
    }

    fn notifier(&self, process: ProcessId) -> DbgResult<RawFd> {
        unsafe {get_info::<RawFd>(|size, value| amd_dbgapi_process_get_info(process, AMD_DBGAPI_PROCESS_INFO_NOTIFIER, size, value))}
    }

    fn set_progress(&self, process: ProcessId, progress: Progress) -> DbgResult<()> {
        let progress = match progress {
            Progress::Normal => AMD_DBGAPI_PROGRESS_NORMAL,
            Progress::NoForward => AMD_DBGAPI_PROGRESS_NO_FORWARD,
        };
        unsafe {status_result(amd_dbgapi_process_set_progress(process, progress))}
    }

    fn set_wave_creation(&self, process: ProcessId, mode: WaveCreation) -> DbgResult<()> {
        let mode = match mode {
            WaveCreation::Normal => AMD_DBGAPI_WAVE_CREATION_NORMAL,
            WaveCreation::Stop => AMD_DBGAPI_WAVE_CREATION_STOP,
        };
        unsafe {status_result(amd_dbgapi_process_set_wave_creation(process, mode))}
    }

    fn set_memory_precision(&self, process: ProcessId, precision: MemoryPrecision) -> DbgResult<()> {
        let precision = match precision {
            MemoryPrecision::None => AMD_DBGAPI_MEMORY_PRECISION_NONE,
            MemoryPrecision::Precise => AMD_DBGAPI_MEMORY_PRECISION_PRECISE,
        };
        unsafe {status_result(amd_dbgapi_set_memory_precision(process, precision))}
    }

    fn next_pending_event(&self, process: ProcessId) -> DbgResult<Option<(EventId, EventKind)>> {
        unsafe {
            let mut event = EventId(0);
            let mut kind = AMD_DBGAPI_EVENT_KIND_NONE;
            status_result(amd_dbgapi_process_next_pending_event(process, &mut event, &mut kind))?;
            if kind == AMD_DBGAPI_EVENT_KIND_NONE {
                return Ok(None);
            }
            let kind = match kind {
                AMD_DBGAPI_EVENT_KIND_WAVE_STOP => EventKind::WaveStop,
                AMD_DBGAPI_EVENT_KIND_WAVE_COMMAND_TERMINATED => EventKind::WaveCommandTerminated,
                AMD_DBGAPI_EVENT_KIND_CODE_OBJECT_LIST_UPDATED => EventKind::CodeObjectListUpdated,
                AMD_DBGAPI_EVENT_KIND_BREAKPOINT_RESUME => EventKind::BreakpointResume,
                AMD_DBGAPI_EVENT_KIND_RUNTIME => EventKind::Runtime,
                AMD_DBGAPI_EVENT_KIND_QUEUE_ERROR => EventKind::QueueError,
                other => EventKind::Unknown(other),
            };
            Ok(Some((event, kind)))
        }
    }

    fn event_processed(&self, event: EventId) -> DbgResult<()> {
        unsafe {status_result(amd_dbgapi_event_processed(event))}
    }

    fn event_wave(&self, event: EventId) -> DbgResult<WaveId> {
        unsafe {get_info::<WaveId>(|size, value| amd_dbgapi_event_get_info(event, AMD_DBGAPI_EVENT_INFO_WAVE, size, value))}
    }

    fn event_runtime_state(&self, event: EventId) -> DbgResult<RuntimeState> {
        let state = unsafe {get_info::<i32>(|size, value| amd_dbgapi_event_get_info(event, AMD_DBGAPI_EVENT_INFO_RUNTIME_STATE, size, value))}?;
        match state {
            AMD_DBGAPI_RUNTIME_STATE_LOADED_SUCCESS => Ok(RuntimeState::LoadedSuccess),
            AMD_DBGAPI_RUNTIME_STATE_UNLOADED => Ok(RuntimeState::Unloaded),
            AMD_DBGAPI_RUNTIME_STATE_LOADED_ERROR_RESTRICTION => Ok(RuntimeState::LoadedErrorRestriction),
            other => Err(Status::Error(other)),
        }
    }

    fn wave_list(&self, process: ProcessId) -> DbgResult<Vec<WaveId>> {
        unsafe {
            let mut count: size_t = 0;
            let mut waves: *mut WaveId = ptr::null_mut();
            status_result(amd_dbgapi_process_wave_list(process, &mut count, &mut waves, ptr::null_mut()))?;
            Ok(take_list(count, waves))
        }
    }

    fn wave_state(&self, wave: WaveId) -> DbgResult<WaveState> {
        let state = unsafe {get_info::<i32>(|size, value| amd_dbgapi_wave_get_info(wave, AMD_DBGAPI_WAVE_INFO_STATE, size, value))}?;
        match state {
            AMD_DBGAPI_WAVE_STATE_RUN => Ok(WaveState::Run),
            AMD_DBGAPI_WAVE_STATE_SINGLE_STEP => Ok(WaveState::SingleStep),
            AMD_DBGAPI_WAVE_STATE_STOP => Ok(WaveState::Stop),
            other => Err(Status::Error(other)),
        }
    }

    fn wave_stop_reason(&self, wave: WaveId) -> DbgResult<StopReason> {
        let bits = unsafe {get_info::<u32>(|size, value| amd_dbgapi_wave_get_info(wave, AMD_DBGAPI_WAVE_INFO_STOP_REASON, size, value))}?;
        Ok(StopReason::from_bits_truncate(bits))
    }

    fn wave_pc(&self, wave: WaveId) -> DbgResult<u64> {
        unsafe {get_info::<u64>(|size, value| amd_dbgapi_wave_get_info(wave, AMD_DBGAPI_WAVE_INFO_PC, size, value))}
    }

    fn wave_process(&self, wave: WaveId) -> DbgResult<ProcessId> {
        unsafe {get_info::<ProcessId>(|size, value| amd_dbgapi_wave_get_info(wave, AMD_DBGAPI_WAVE_INFO_PROCESS, size, value))}
    }

    fn wave_architecture(&self, wave: WaveId) -> DbgResult<ArchitectureId> {
        unsafe {get_info::<ArchitectureId>(|size, value| amd_dbgapi_wave_get_info(wave, AMD_DBGAPI_WAVE_INFO_ARCHITECTURE, size, value))}
    }

    fn wave_dispatch(&self, wave: WaveId) -> DbgResult<DispatchId> {
        unsafe {get_info::<DispatchId>(|size, value| amd_dbgapi_wave_get_info(wave, AMD_DBGAPI_WAVE_INFO_DISPATCH, size, value))}
    }

    fn dispatch_kernel_entry(&self, dispatch: DispatchId) -> DbgResult<u64> {
        unsafe {get_info::<u64>(|size, value| amd_dbgapi_dispatch_get_info(dispatch, AMD_DBGAPI_DISPATCH_INFO_KERNEL_CODE_ENTRY_ADDRESS, size, value))}
    }

    fn wave_stop(&self, wave: WaveId) -> DbgResult<()> {
        unsafe {status_result(amd_dbgapi_wave_stop(wave))}
    }

    fn wave_resume(&self, wave: WaveId, mode: ResumeMode, exceptions: Exceptions) -> DbgResult<()> {
        let mode = match mode {
            ResumeMode::Normal => AMD_DBGAPI_RESUME_MODE_NORMAL,
            ResumeMode::SingleStep => AMD_DBGAPI_RESUME_MODE_SINGLE_STEP,
        };
        unsafe {status_result(amd_dbgapi_wave_resume(wave, mode, exceptions.bits()))}
    }

    fn code_object_list(&self, process: ProcessId) -> DbgResult<Vec<CodeObjectId>> {
        unsafe {
            let mut count: size_t = 0;
            let mut code_objects: *mut CodeObjectId = ptr::null_mut();
            status_result(amd_dbgapi_process_code_object_list(process, &mut count, &mut code_objects, ptr::null_mut()))?;
            Ok(take_list(count, code_objects))
        }
    }

    fn code_object_load_address(&self, id: CodeObjectId) -> DbgResult<u64> {
        unsafe {get_info::<u64>(|size, value| amd_dbgapi_code_object_get_info(id, AMD_DBGAPI_CODE_OBJECT_INFO_LOAD_ADDRESS, size, value))}
    }

    fn code_object_uri(&self, id: CodeObjectId) -> DbgResult<String> {
        unsafe {get_info_string(|size, value| amd_dbgapi_code_object_get_info(id, AMD_DBGAPI_CODE_OBJECT_INFO_URI_NAME, size, value))}
    }

    fn code_object_process(&self, id: CodeObjectId) -> DbgResult<ProcessId> {
        unsafe {get_info::<ProcessId>(|size, value| amd_dbgapi_code_object_get_info(id, AMD_DBGAPI_CODE_OBJECT_INFO_PROCESS, size, value))}
    }

    fn register_class_list(&self, arch: ArchitectureId) -> DbgResult<Vec<RegisterClassId>> {
        unsafe {
            let mut count: size_t = 0;
            let mut classes: *mut RegisterClassId = ptr::null_mut();
            status_result(amd_dbgapi_architecture_register_class_list(arch, &mut count, &mut classes))?;
            Ok(take_list(count, classes))
        }
    }

    fn register_class_name(&self, class: RegisterClassId) -> DbgResult<String> {
        unsafe {get_info_string(|size, value| amd_dbgapi_architecture_register_class_get_info(class, AMD_DBGAPI_REGISTER_CLASS_INFO_NAME, size, value))}
    }

    fn wave_register_list(&self, wave: WaveId) -> DbgResult<Vec<RegisterId>> {
        unsafe {
            let mut count: size_t = 0;
            let mut registers: *mut RegisterId = ptr::null_mut();
            status_result(amd_dbgapi_wave_register_list(wave, &mut count, &mut registers))?;
            Ok(take_list(count, registers))
        }
    }

    fn register_is_in_class(&self, class: RegisterClassId, reg: RegisterId) -> DbgResult<bool> {
        unsafe {
            let mut state = AMD_DBGAPI_REGISTER_CLASS_STATE_NOT_MEMBER;
            status_result(amd_dbgapi_register_is_in_register_class(class, reg, &mut state))?;
            Ok(state == AMD_DBGAPI_REGISTER_CLASS_STATE_MEMBER)
        }
    }

    fn register_name(&self, reg: RegisterId) -> DbgResult<String> {
        unsafe {get_info_string(|size, value| amd_dbgapi_register_get_info(reg, AMD_DBGAPI_REGISTER_INFO_NAME, size, value))}
    }

    fn register_type(&self, reg: RegisterId) -> DbgResult<String> {
        unsafe {get_info_string(|size, value| amd_dbgapi_register_get_info(reg, AMD_DBGAPI_REGISTER_INFO_TYPE, size, value))}
    }

    fn register_size(&self, reg: RegisterId) -> DbgResult<usize> {
        let size = unsafe {get_info::<size_t>(|size, value| amd_dbgapi_register_get_info(reg, AMD_DBGAPI_REGISTER_INFO_SIZE, size, value))}?;
        Ok(size as usize)
    }

    fn read_register(&self, wave: WaveId, reg: RegisterId, buf: &mut [u8]) -> DbgResult<()> {
        unsafe {status_result(amd_dbgapi_read_register(wave, reg, 0, buf.len(), buf.as_mut_ptr() as *mut c_void))}
    }

    fn dwarf_address_space(&self, arch: ArchitectureId, dwarf_space: u64) -> DbgResult<AddressSpaceId> {
        unsafe {
            let mut space = AddressSpaceId(0);
            status_result(amd_dbgapi_dwarf_address_space_to_address_space(arch, dwarf_space, &mut space))?;
            Ok(space)
        }
    }

    fn read_global_memory(&self, process: ProcessId, addr: u64, buf: &mut [u8]) -> DbgResult<usize> {
        unsafe {
            let mut size = buf.len() as size_t;
            status_result(amd_dbgapi_read_memory(process, AMD_DBGAPI_WAVE_NONE, AMD_DBGAPI_LANE_NONE, AMD_DBGAPI_ADDRESS_SPACE_GLOBAL, addr, &mut size, buf.as_mut_ptr() as *mut c_void))?;
            Ok(size as usize)
        }
    }

    fn read_wave_memory(&self, process: ProcessId, wave: WaveId, space: AddressSpaceId, addr: u64, buf: &mut [u8]) -> DbgResult<usize> {
        unsafe {
            let mut size = buf.len() as size_t;
            status_result(amd_dbgapi_read_memory(process, wave, 0, space, addr, &mut size, buf.as_mut_ptr() as *mut c_void))?;
            Ok(size as usize)
        }
    }

    fn largest_instruction_size(&self, arch: ArchitectureId) -> DbgResult<usize> {
        let size = unsafe {get_info::<u64>(|size, value| amd_dbgapi_architecture_get_info(arch, AMD_DBGAPI_ARCHITECTURE_INFO_LARGEST_INSTRUCTION_SIZE, size, value))}?;
        Ok(size as usize)
    }

    fn disassemble_instruction(&self, arch: ArchitectureId, addr: u64, bytes: &[u8],
                               symbolizer: Option<&mut dyn FnMut(u64) -> String>) -> DbgResult<(String, usize)> {
        unsafe {
            let mut size = bytes.len() as size_t;
            let mut text: *mut c_char = ptr::null_mut();
            let status = match symbolizer {
                None => amd_dbgapi_disassemble_instruction(arch, addr, &mut size, bytes.as_ptr() as *const c_void, &mut text, 0, None),
                Some(callback) => {
                    let mut callback: &mut dyn FnMut(u64) -> String = callback;
                    amd_dbgapi_disassemble_instruction(arch, addr, &mut size, bytes.as_ptr() as *const c_void, &mut text,
                                                       &mut callback as *mut &mut dyn FnMut(u64) -> String as usize,
                                                       Some(symbolizer_trampoline))
                }
            };
            status_result(status)?;
            let instruction = if text.is_null() {
                String::new()
            } else {
                let s = CStr::from_ptr(text).to_string_lossy().into_owned();
                libc::free(text as *mut c_void);
                s
            };
            Ok((instruction, size as usize))
        }
    }

    fn rbrk_breakpoint(&self) -> Option<BreakpointId> {
        match RBRK_BREAKPOINT.load(Ordering::Relaxed) {
            RBRK_BREAKPOINT_NONE => None,
            id => Some(BreakpointId(id)),
        }
    }

    fn report_breakpoint_hit(&self, breakpoint: BreakpointId) -> DbgResult<BreakpointAction> {
        unsafe {
            let mut action: i32 = 0;
            status_result(amd_dbgapi_report_breakpoint_hit(breakpoint, 0, &mut action))?;
            Ok(if action == 0 {BreakpointAction::Resume} else {BreakpointAction::Halt})
        }
    }
}
