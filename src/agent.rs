use crate::{*, dbgapi::*, error::*, ffi::DbgApiFfi, log::*, settings::*, worker};
use libc::{c_char, c_void};
use std::{env, ffi::CStr, fs::File, mem, os::fd::AsRawFd, process, ptr, sync::{Arc, atomic::{AtomicUsize, Ordering}}};

// The loadable-tool surface: OnLoad/OnUnload entry points the GPU runtime resolves, the
// two intercept shims patched into its dispatch table, the SIGQUIT handler, and the
// at-exit hook. Only built with the `agent` feature.

pub const MIN_TABLE_MAJOR_VERSION: u32 = 1;

pub type hsa_status_t = i32;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct hsa_executable_t {
    pub handle: u64,
}

pub type ExecutableFreezeFn = unsafe extern "C" fn(executable: hsa_executable_t, options: *const c_char) -> hsa_status_t;
pub type ExecutableDestroyFn = unsafe extern "C" fn(executable: hsa_executable_t) -> hsa_status_t;

#[repr(C)]
pub struct ApiTableVersion {
    pub major_id: u32,
    pub minor_id: u32,
    pub step_id: u32,
    pub reserved: u32,
}

// Abridged view of the runtime's dispatch tables: only the entries this agent reads or
// patches are declared. The full layouts come from the runtime's api trace headers and
// must match the runtime the agent is loaded into.
#[repr(C)]
pub struct CoreApiTable {
    pub version: ApiTableVersion,
    pub hsa_executable_freeze_fn: Option<ExecutableFreezeFn>,
    pub hsa_executable_destroy_fn: Option<ExecutableDestroyFn>,
}

#[repr(C)]
pub struct HsaApiTable {
    pub version: ApiTableVersion,
    pub core: *mut CoreApiTable,
    pub amd_ext: *mut c_void,
    pub finalizer_ext: *mut c_void,
    pub image_ext: *mut c_void,
}

// The runtime's own entry points, saved before patching the table.
static ORIGINAL_EXECUTABLE_FREEZE: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_EXECUTABLE_DESTROY: AtomicUsize = AtomicUsize::new(0);

// Forward to the original first: the code-object list must reflect the runtime's
// post-call state before the rescan.
unsafe extern "C" fn executable_freeze_shim(executable: hsa_executable_t, options: *const c_char) -> hsa_status_t {
    let original: ExecutableFreezeFn = mem::transmute(ORIGINAL_EXECUTABLE_FREEZE.load(Ordering::Relaxed));
    let status = original(executable, options);
    worker::worker_thread().update_code_object_list();
    status
}

unsafe extern "C" fn executable_destroy_shim(executable: hsa_executable_t) -> hsa_status_t {
    let original: ExecutableDestroyFn = mem::transmute(ORIGINAL_EXECUTABLE_DESTROY.load(Ordering::Relaxed));
    let status = original(executable);
    worker::worker_thread().update_code_object_list();
    status
}

// Async-signal-safe: two bare write(2) calls, no locks, no allocation.
extern "C" fn sigquit_handler(_signal: i32, _info: *mut libc::siginfo_t, _context: *mut c_void) {
    unsafe {
        libc::write(crate::log::output_fd(), b"\n".as_ptr() as *const c_void, 1);
        let fd = worker::COMMAND_PIPE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            libc::write(fd, b"p".as_ptr() as *const c_void, 1);
        }
    }
}

fn install_sigquit_handler() {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = sigquit_handler as usize;
        action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigaction(libc::SIGQUIT, &action, ptr::null_mut());
    }
}

extern "C" {
    fn atexit(callback: extern "C" fn()) -> i32;
}

// At exit only stop the worker. The controller storage is never destroyed: intercept
// shims can still fire during process teardown and must find it alive.
extern "C" fn agent_at_exit() {
    worker::worker_thread().stop();
}

#[no_mangle]
pub unsafe extern "C" fn OnLoad(table: *mut HsaApiTable, _runtime_version: u64,
                                failed_tool_count: u64, failed_tool_names: *const *const c_char) -> bool {
    set_log_level(LogLevel::Warning);

    // The runtime tells us which tools failed to load; if we are among them, stay out.
    if !failed_tool_names.is_null() {
        for i in 0..failed_tool_count as usize {
            let name = *failed_tool_names.add(i);
            if !name.is_null() && CStr::from_ptr(name).to_string_lossy().contains("gpu-debug-agent") {
                return false;
            }
        }
    }
    if table.is_null() || (*table).version.major_id < MIN_TABLE_MAJOR_VERSION {
        return false;
    }

    let args: Vec<String> = match env::var("ROCM_DEBUG_AGENT_OPTIONS") {
        Ok(value) => value.split_whitespace().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    };
    let settings = match Settings::parse(&args) {
        Ok(s) => s,
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("error: {}", e);
            }
            print_usage();
            process::abort();
        }
    };

    set_log_level(settings.log_level);
    if let Some(path) = &settings.output {
        match File::create(path) {
            Ok(file) => {
                let fd = file.as_raw_fd();
                set_output(Box::new(file), fd);
            }
            Err(_) => {
                eprintln!("could not open `{}'", path);
                process::abort();
            }
        }
    }
    crate::settings::set_global(settings.clone());

    worker::worker_thread().start(Arc::new(DbgApiFfi), settings.all_wavefronts, settings.precise_memory);
    atexit(agent_at_exit);

    if !settings.disable_linux_signals {
        install_sigquit_handler();
    }

    let core = (*table).core;
    let original_freeze = match (*core).hsa_executable_freeze_fn {
        Some(f) => f,
        None => return false,
    };
    let original_destroy = match (*core).hsa_executable_destroy_fn {
        Some(f) => f,
        None => return false,
    };
    ORIGINAL_EXECUTABLE_FREEZE.store(original_freeze as usize, Ordering::Relaxed);
    ORIGINAL_EXECUTABLE_DESTROY.store(original_destroy as usize, Ordering::Relaxed);
    (*core).hsa_executable_freeze_fn = Some(executable_freeze_shim);
    (*core).hsa_executable_destroy_fn = Some(executable_destroy_shim);

    true
}

#[no_mangle]
pub extern "C" fn OnUnload() {
    worker::worker_thread().stop();
}
