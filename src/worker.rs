use crate::{*, dbgapi::*, error::*, events, report, util::*};
use std::{io, mem, os::fd::{AsRawFd, OwnedFd, RawFd}, sync::{Arc, Mutex, MutexGuard, mpsc, atomic::{AtomicBool, AtomicI32, Ordering}}, thread::{self, JoinHandle}};

// Write end of the live worker's command pipe, mirrored for the SIGQUIT handler (which
// may touch no mutex). -1 while no worker is running.
pub static COMMAND_PIPE_FD: AtomicI32 = AtomicI32::new(-1);

// One-outstanding handshake for the synchronous code-object-list update: the requesting
// thread stores a one-shot sender, publishes it with a release store on the guard, pokes
// the command pipe, and blocks; the worker observes the guard with acquire (which makes
// the sender visible), reports the breakpoint hit, and signals completion. Callers are
// serialized by the controller mutex.
struct RbrkSync {
    guard: AtomicBool,
    promise: Mutex<Option<mpsc::Sender<()>>>,
}

static RBRK_SYNC: RbrkSync = RbrkSync {guard: AtomicBool::new(false), promise: Mutex::new(None)};

#[cfg(test)]
pub fn rbrk_sync_idle() -> bool {
    !RBRK_SYNC.guard.load(Ordering::Acquire) && RBRK_SYNC.promise.lock().unwrap_or_else(|e| e.into_inner()).is_none()
}

// The worker thread owning the debugger-API attachment. All debugger-API calls after
// attach happen on this thread; everybody else communicates through single-byte commands
// on the pipe ('p' = print now, 'b' = report a breakpoint hit at the runtime's
// notification address, 'q' = exit).
pub struct DebugAgentWorker {
    worker_thread: Option<JoinHandle<()>>,
    write_pipe: OwnedFd,
}

impl DebugAgentWorker {
    pub fn new(api: Arc<dyn DebugApi>, all_wavefronts: bool, precise_memory: bool) -> DebugAgentWorker {
        let pipe = match create_pipe() {
            Ok(p) => p,
            Err(e) => fatal!("failed to create pipe: {}", e),
        };
        let read_pipe = pipe.read;
        let worker_thread = match thread::Builder::new().name("gpu-debug-agent".to_string())
            .spawn(move || dbgapi_worker(read_pipe, api, all_wavefronts, precise_memory)) {
            Ok(t) => t,
            Err(e) => fatal!("failed to create the worker thread: {}", e),
        };
        COMMAND_PIPE_FD.store(pipe.write.as_raw_fd(), Ordering::Relaxed);
        DebugAgentWorker {worker_thread: Some(worker_thread), write_pipe: pipe.write}
    }

    fn send_command(&self, command: u8) {
        let buf = [command];
        let written = unsafe {libc::write(self.write_pipe.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1)};
        if written == -1 {
            fatal!("failed to notify the debug agent worker: {}", io::Error::last_os_error());
        }
        assert!(written == 1);
    }

    // Fire-and-forget request for a full report.
    pub fn query_print_waves(&self) {
        self.send_command(b'p');
    }

    // Synchronous: returns only after the worker has reported the breakpoint hit, i.e.
    // after the debugger API has rescanned the runtime's code-object list.
    pub fn update_code_object_list(&self) {
        assert!(!RBRK_SYNC.guard.load(Ordering::Acquire));

        let (sender, receiver) = mpsc::channel();
        {
            let mut promise = RBRK_SYNC.promise.lock().unwrap_or_else(|e| e.into_inner());
            assert!(promise.is_none());
            *promise = Some(sender);
        }
        RBRK_SYNC.guard.store(true, Ordering::Release);

        self.send_command(b'b');
        let _ = receiver.recv();

        *RBRK_SYNC.promise.lock().unwrap_or_else(|e| e.into_inner()) = None;
        RBRK_SYNC.guard.store(false, Ordering::Release);
    }
}

impl Drop for DebugAgentWorker {
    fn drop(&mut self) {
        COMMAND_PIPE_FD.store(-1, Ordering::Relaxed);
        self.send_command(b'q');
        if let Some(thread) = self.worker_thread.take() {
            let _ = thread.join();
        }
    }
}

fn dbgapi_worker(listen_fd: OwnedFd, api: Arc<dyn DebugApi>, all_wavefronts: bool, precise_memory: bool) {
    let api: &dyn DebugApi = &*api;

    dbg_check!(api.initialize(), "initialize");
    let process = dbg_check!(api.attach(), "process_attach");

    // The runtime was activated just before tools were loaded, so a runtime-loaded event
    // must already be waiting.
    let (event_id, event_kind) = match dbg_check!(api.next_pending_event(process), "process_next_pending_event") {
        Some(t) => t,
        None => fatal!("expected a runtime event after attach"),
    };
    if event_kind != EventKind::Runtime {
        fatal!("unexpected event kind {:?}", event_kind);
    }
    match dbg_check!(api.event_runtime_state(event_id), "event_get_info") {
        RuntimeState::LoadedSuccess => (),
        RuntimeState::Unloaded => fatal!("invalid runtime state"),
        RuntimeState::LoadedErrorRestriction => fatal!("unable to enable GPU debugging due to a restriction error"),
    }
    dbg_check!(api.event_processed(event_id), "event_processed");

    let notifier = dbg_check!(api.notifier(process), "process_get_info");

    let epoll = match Epoll::new() {
        Ok(e) => e,
        Err(e) => fatal!("unable to create epoll instance: {}", e),
    };
    if let Err(e) = epoll.add(listen_fd.as_raw_fd(), libc::EPOLLIN, listen_fd.as_raw_fd() as u64) {
        fatal!("unable to add the command pipe to the epoll instance: {}", e);
    }
    if let Err(e) = epoll.add(notifier, libc::EPOLLIN, notifier as u64) {
        fatal!("unable to add the dbgapi notifier to the epoll instance: {}", e);
    }

    if precise_memory {
        match api.set_memory_precision(process, MemoryPrecision::Precise) {
            Ok(()) => (),
            Err(Status::NotSupported) => log_warning!("precise memory not supported for all the agents of this process"),
            Err(status) => fatal!("set_memory_precision failed (rc={})", status),
        }
    }

    let mut continue_event_loop = true;
    while continue_event_loop {
        let mut epoll_events: [libc::epoll_event; 2] = unsafe {mem::zeroed()};
        let n = match epoll.wait(&mut epoll_events) {
            Ok(n) => n,
            Err(e) => fatal!("epoll_wait failed: {}", e),
        };

        for event in &epoll_events[..n] {
            let fd = event.u64 as RawFd;
            if fd == listen_fd.as_raw_fd() {
                match read_command(fd) {
                    Some(b'p') => {
                        report::print_wavefronts(api, process, true);
                    }
                    Some(b'q') => {
                        // Time to exit the event loop and detach.
                        continue_event_loop = false;
                    }
                    Some(b'b') => {
                        // The acquire load pairs with the requester's release store:
                        // observing the guard makes the stored promise visible too.
                        let promise_available = RBRK_SYNC.guard.load(Ordering::Acquire);
                        assert!(promise_available);

                        let breakpoint = match api.rbrk_breakpoint() {
                            Some(b) => b,
                            None => fatal!("no breakpoint is set at the runtime's notification address"),
                        };
                        dbg_check!(api.report_breakpoint_hit(breakpoint), "report_breakpoint_hit");

                        let promise = RBRK_SYNC.promise.lock().unwrap_or_else(|e| e.into_inner());
                        assert!(promise.is_some());
                        let _ = promise.as_ref().unwrap().send(());
                    }
                    _ => (),
                }
            } else if fd == notifier {
                drain_notifier(fd);
                events::process_events(api, process, all_wavefronts);
            } else {
                fatal!("unknown file descriptor {}", fd);
            }
        }
    }

    dbg_check!(api.detach(process), "process_detach");
    dbg_check!(api.finalize(), "finalize");
}

fn read_command(fd: RawFd) -> Option<u8> {
    let mut buf = 0u8;
    loop {
        let r = unsafe {libc::read(fd, &mut buf as *mut u8 as *mut libc::c_void, 1)};
        if r == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return if r == 1 {Some(buf)} else {None};
    }
}

// The notifier is nonblocking; absorb everything that accumulated.
fn drain_notifier(fd: RawFd) {
    loop {
        let mut buf = 0u8;
        let r = unsafe {libc::read(fd, &mut buf as *mut u8 as *mut libc::c_void, 1)};
        if r == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if r != 1 {
            return;
        }
    }
}

// The controller: a process-wide singleton guarded by a mutex and accessed through a
// scoped handle. The storage is a static and is deliberately never destroyed, because
// intercept shims can fire during process teardown; the at-exit hook only stops the
// worker.
static WORKER: Mutex<Option<DebugAgentWorker>> = Mutex::new(None);

pub struct WorkerThreadAccess {
    worker: MutexGuard<'static, Option<DebugAgentWorker>>,
}

pub fn worker_thread() -> WorkerThreadAccess {
    WorkerThreadAccess {worker: WORKER.lock().unwrap_or_else(|e| e.into_inner())}
}

impl WorkerThreadAccess {
    // Start the worker thread, if not already started.
    pub fn start(&mut self, api: Arc<dyn DebugApi>, all_wavefronts: bool, precise_memory: bool) {
        if self.worker.is_none() {
            *self.worker = Some(DebugAgentWorker::new(api, all_wavefronts, precise_memory));
        }
    }

    // Terminate the worker thread.
    pub fn stop(&mut self) {
        *self.worker = None;
    }

    pub fn update_code_object_list(&self) {
        if let Some(worker) = self.worker.as_ref() {
            worker.update_code_object_list();
        }
    }

    pub fn query_print_waves(&self) {
        if let Some(worker) = self.worker.as_ref() {
            worker.query_print_waves();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::*;
    use std::time::{Duration, Instant};

    fn wait_for<F: FnMut() -> bool>(mut condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for the worker");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn synchronous_code_object_list_update() {
        let _serial = output_test_lock();
        let _captured = capture_output();

        let api = Arc::new(SimApi::new());
        let worker = DebugAgentWorker::new(api.clone(), false, false);

        worker.update_code_object_list();
        assert_eq!(api.state.lock().unwrap().report_breakpoint_hits, 1);
        assert!(rbrk_sync_idle());

        worker.update_code_object_list();
        assert_eq!(api.state.lock().unwrap().report_breakpoint_hits, 2);
        assert!(rbrk_sync_idle());

        drop(worker);
        let state = api.state.lock().unwrap();
        assert!(state.calls.contains(&"detach".to_string()), "{:?}", state.calls);
        assert!(state.calls.contains(&"finalize".to_string()), "{:?}", state.calls);
    }

    #[test]
    fn fault_event_drives_a_report() {
        let _serial = output_test_lock();
        let captured = capture_output();

        let api = Arc::new(SimApi::new());
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(11, SimWave::stopped(0x4000, StopReason::ILLEGAL_INSTRUCTION));
        }
        let worker = DebugAgentWorker::new(api.clone(), false, false);

        api.push_event(SimEvent::WaveStop(WaveId(11)));
        wait_for(|| api.state.lock().unwrap().calls.iter().any(|c| c == "set_progress(Normal)"));

        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();
        assert!(text.contains("wave_11: pc=0x4000"), "{}", text);
        assert_eq!(api.state.lock().unwrap().resumed, vec![(11, Exceptions::WAVE_ILLEGAL_INSTRUCTION)]);

        drop(worker);
    }

    #[test]
    fn print_command_forces_a_full_stop_report() {
        let _serial = output_test_lock();
        let captured = capture_output();

        let api = Arc::new(SimApi::new());
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(21, SimWave::running(0x8000));
        }
        let worker = DebugAgentWorker::new(api.clone(), false, false);

        worker.query_print_waves();
        wait_for(|| !api.state.lock().unwrap().stop_requested.is_empty());
        wait_for(|| {
            String::from_utf8_lossy(&captured.lock().unwrap()).contains("wave_21:")
        });

        drop(worker);
    }

    #[test]
    fn precise_memory_not_supported_is_a_warning() {
        let _serial = output_test_lock();
        let captured = capture_output();

        let api = Arc::new(SimApi::new());
        api.state.lock().unwrap().memory_precision_not_supported = true;
        let worker = DebugAgentWorker::new(api.clone(), false, true);

        wait_for(|| api.state.lock().unwrap().calls.iter().any(|c| c.starts_with("set_memory_precision")));
        drop(worker);

        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();
        assert!(text.contains("precise memory not supported"), "{}", text);
    }
}
