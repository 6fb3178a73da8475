use crate::{*, dbgapi::*, report, waves};

// Invoked when the notifier is readable: drain and classify every pending event. If any
// of them calls for action, freeze the process (no forward progress, new waves created
// stopped), emit the report if one is needed, then resume every stopped wave with the
// exception set mapped from its stop reason so the runtime sees the failure. Both modes
// are restored before returning.
pub fn process_events(api: &dyn DebugApi, process: ProcessId, all_wavefronts: bool) {
    let mut need_print_waves = false;
    let mut wave_need_resume = false;

    while let Some((event_id, kind)) = dbg_check!(api.next_pending_event(process), "process_next_pending_event") {
        match kind {
            EventKind::WaveStop => {
                // A debug trap is not a failure; the wave is just silently resumed below.
                let wave_id = dbg_check!(api.event_wave(event_id), "event_get_info");
                let stop_reason = dbg_check!(api.wave_stop_reason(wave_id), "wave_get_info");
                if stop_reason == StopReason::DEBUG_TRAP {
                    wave_need_resume = true;
                } else {
                    need_print_waves = true;
                }
            }
            EventKind::QueueError => {
                need_print_waves = true;
            }
            EventKind::Runtime | EventKind::CodeObjectListUpdated | EventKind::BreakpointResume => {
                // Ignore.
            }
            _ => {
                log_warning!("unexpected event kind {:?}", kind);
            }
        }
        // A wave cannot be resumed until its stop event is processed, so drain all
        // events first and resume the waves afterwards.
        dbg_check!(api.event_processed(event_id), "event_processed");
    }

    if !need_print_waves && !wave_need_resume {
        return;
    }

    dbg_check!(api.set_progress(process, Progress::NoForward), "process_set_progress");
    dbg_check!(api.set_wave_creation(process, WaveCreation::Stop), "process_set_wave_creation");

    if need_print_waves {
        report::print_wavefronts(api, process, all_wavefronts);
    }

    // Resume execution of the stopped waves. This lets each exception be delivered to
    // the runtime, which can act on it if required.
    for wave_id in dbg_check!(api.wave_list(process), "process_wave_list") {
        let state = match api.wave_state(wave_id) {
            // The wave died; ignore it.
            Err(Status::InvalidWaveId) => continue,
            r => dbg_check!(r, "wave_get_info"),
        };
        if state != WaveState::Stop {
            continue;
        }
        let stop_reason = match api.wave_stop_reason(wave_id) {
            Err(Status::InvalidWaveId) => continue,
            r => dbg_check!(r, "wave_get_info"),
        };
        match api.wave_resume(wave_id, ResumeMode::Normal, waves::resume_exceptions(stop_reason)) {
            Err(Status::InvalidWaveId) => continue,
            r => dbg_check!(r, "wave_resume"),
        }
    }

    dbg_check!(api.set_wave_creation(process, WaveCreation::Normal), "process_set_wave_creation");
    dbg_check!(api.set_progress(process, Progress::Normal), "process_set_progress");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::*;

    #[test]
    fn debug_trap_is_resumed_silently() {
        let _serial = output_test_lock();
        let api = SimApi::new();
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(1, SimWave::stopped(0x1000, StopReason::DEBUG_TRAP));
        }
        api.push_event(SimEvent::WaveStop(WaveId(1)));

        let captured = capture_output();
        process_events(&api, ProcessId(1), false);
        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();

        assert!(!text.contains("wave_1:"), "unexpected report: {}", text);
        let state = api.state.lock().unwrap();
        assert_eq!(state.resumed, vec![(1, Exceptions::NONE)]);
        // Modes were overridden and restored in order.
        let calls = state.calls.join(";");
        assert!(calls.contains("set_progress(NoForward)"), "{}", calls);
        assert!(calls.ends_with("set_wave_creation(Normal);set_progress(Normal)"), "{}", calls);
    }

    #[test]
    fn fault_produces_report_and_exception_mask() {
        let _serial = output_test_lock();
        let api = SimApi::new();
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(2, SimWave::stopped(0x2000, StopReason::MEMORY_VIOLATION));
        }
        api.push_event(SimEvent::WaveStop(WaveId(2)));

        let captured = capture_output();
        process_events(&api, ProcessId(1), false);
        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();

        assert!(text.contains("wave_2: pc=0x2000"), "{}", text);
        assert!(text.contains("stopped, reason: MEMORY_VIOLATION"), "{}", text);
        let state = api.state.lock().unwrap();
        assert_eq!(state.resumed, vec![(2, Exceptions::WAVE_MEMORY_VIOLATION)]);
    }

    #[test]
    fn queue_error_triggers_report() {
        let _serial = output_test_lock();
        let api = SimApi::new();
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(3, SimWave::stopped(0x3000, StopReason::NONE));
        }
        api.push_event(SimEvent::QueueError);

        let captured = capture_output();
        process_events(&api, ProcessId(1), false);
        let text = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();
        assert!(text.contains("wave_3:"), "{}", text);
    }

    #[test]
    fn no_events_means_no_action() {
        let api = SimApi::new();
        process_events(&api, ProcessId(1), false);
        let state = api.state.lock().unwrap();
        assert!(!state.calls.iter().any(|c| c.starts_with("set_progress")), "{:?}", state.calls);
    }
}
