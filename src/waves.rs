use crate::{*, dbgapi::*};
use std::collections::HashSet;

// Force every live wave to the STOP state. Convergence loop: drain stop/termination
// events, then request a stop from every wave that is neither stopped nor already asked;
// repeat until no request is outstanding. Each live wave eventually transitions and an
// event is delivered for each transition, so this terminates.
// Returns the set of waves that ended up stopped.
pub fn stop_all_wavefronts(api: &dyn DebugApi, process: ProcessId) -> HashSet<WaveId> {
    let mut already_stopped: HashSet<WaveId> = HashSet::new();
    let mut waiting_to_stop: HashSet<WaveId> = HashSet::new();

    log_info!("stopping all wavefronts");
    let mut iter = 0usize;
    loop {
        log_info!("iteration {}:", iter);
        iter += 1;

        while let Some((event_id, kind)) = dbg_check!(api.next_pending_event(process), "process_next_pending_event") {
            match kind {
                EventKind::WaveStop => {
                    let wave_id = dbg_check!(api.event_wave(event_id), "event_get_info");
                    waiting_to_stop.remove(&wave_id);
                    already_stopped.insert(wave_id);
                    log_info!("wave_{} is stopped", wave_id.0);
                }
                EventKind::WaveCommandTerminated => {
                    let wave_id = dbg_check!(api.event_wave(event_id), "event_get_info");
                    waiting_to_stop.remove(&wave_id);
                    log_info!("wave_{} terminated while stopping", wave_id.0);
                }
                _ => (),
            }
            dbg_check!(api.event_processed(event_id), "event_processed");
        }

        // Stop all waves that are still running.
        for wave_id in dbg_check!(api.wave_list(process), "process_wave_list") {
            if already_stopped.contains(&wave_id) {
                continue;
            }
            if waiting_to_stop.contains(&wave_id) {
                log_info!("wave_{} is still stopping", wave_id.0);
                continue;
            }

            let state = match api.wave_state(wave_id) {
                // The wave could have terminated since it was reported in the last wave
                // list. Skip it.
                Err(Status::InvalidWaveId) => continue,
                r => dbg_check!(r, "wave_get_info"),
            };

            if state == WaveState::Stop {
                already_stopped.insert(wave_id);
                log_info!("wave_{} is already stopped", wave_id.0);
                continue;
            }
            if state == WaveState::SingleStep {
                // The wave will stop and report an event once the instruction execution
                // is complete.
                log_info!("wave_{} is single-stepping", wave_id.0);
                continue;
            }

            match api.wave_stop(wave_id) {
                Err(Status::InvalidWaveId) => continue,
                r => dbg_check!(r, "wave_stop"),
            }
            log_info!("wave_{} is running, sent stop request", wave_id.0);
            waiting_to_stop.insert(wave_id);
        }

        if waiting_to_stop.is_empty() {
            break;
        }
    }

    log_info!("all wavefronts are stopped");
    already_stopped
}

// One exception bit per stop-reason bit on resume, so the runtime sees the failure.
pub fn resume_exceptions(stop_reason: StopReason) -> Exceptions {
    let mut exceptions = Exceptions::NONE;
    let mut bits = stop_reason.bits();
    while bits != 0 {
        // Consume one bit from the stop reason.
        let one_bit = bits & bits.wrapping_neg();
        bits ^= one_bit;

        let reason = StopReason::from_bits_truncate(one_bit);
        exceptions |= if reason.intersects(StopReason::BREAKPOINT | StopReason::WATCHPOINT | StopReason::ASSERT_TRAP | StopReason::TRAP) {
            Exceptions::WAVE_TRAP
        } else if reason.intersects(StopReason::FP_INPUT_DENORMAL | StopReason::FP_DIVIDE_BY_0 | StopReason::FP_OVERFLOW
                                    | StopReason::FP_UNDERFLOW | StopReason::FP_INEXACT | StopReason::FP_INVALID_OPERATION
                                    | StopReason::INT_DIVIDE_BY_0) {
            Exceptions::WAVE_MATH_ERROR
        } else if reason.intersects(StopReason::MEMORY_VIOLATION) {
            Exceptions::WAVE_MEMORY_VIOLATION
        } else if reason.intersects(StopReason::ADDRESS_ERROR) {
            Exceptions::WAVE_ADDRESS_ERROR
        } else if reason.intersects(StopReason::ILLEGAL_INSTRUCTION) {
            Exceptions::WAVE_ILLEGAL_INSTRUCTION
        } else if reason.intersects(StopReason::ECC_ERROR | StopReason::FATAL_HALT) {
            Exceptions::WAVE_ABORT
        } else {
            // DEBUG_TRAP and SINGLE_STEP don't need to be propagated.
            Exceptions::NONE
        };
    }
    exceptions
}

pub fn stop_reason_string(stop_reason: StopReason) -> String {
    const NAMES: &[(StopReason, &str)] = &[
        (StopReason::BREAKPOINT, "BREAKPOINT"),
        (StopReason::WATCHPOINT, "WATCHPOINT"),
        (StopReason::SINGLE_STEP, "SINGLE_STEP"),
        (StopReason::FP_INPUT_DENORMAL, "FP_INPUT_DENORMAL"),
        (StopReason::FP_DIVIDE_BY_0, "FP_DIVIDE_BY_0"),
        (StopReason::FP_OVERFLOW, "FP_OVERFLOW"),
        (StopReason::FP_UNDERFLOW, "FP_UNDERFLOW"),
        (StopReason::FP_INEXACT, "FP_INEXACT"),
        (StopReason::FP_INVALID_OPERATION, "FP_INVALID_OPERATION"),
        (StopReason::INT_DIVIDE_BY_0, "INT_DIVIDE_BY_0"),
        (StopReason::DEBUG_TRAP, "DEBUG_TRAP"),
        (StopReason::ASSERT_TRAP, "ASSERT_TRAP"),
        (StopReason::TRAP, "TRAP"),
        (StopReason::MEMORY_VIOLATION, "MEMORY_VIOLATION"),
        (StopReason::ADDRESS_ERROR, "ADDRESS_ERROR"),
        (StopReason::ILLEGAL_INSTRUCTION, "ILLEGAL_INSTRUCTION"),
        (StopReason::ECC_ERROR, "ECC_ERROR"),
        (StopReason::FATAL_HALT, "FATAL_HALT"),
    ];
    if stop_reason == StopReason::NONE {
        return "NONE".to_string();
    }
    let mut r = String::new();
    for &(bit, name) in NAMES {
        if stop_reason.contains(bit) {
            if !r.is_empty() {
                r.push('|');
            }
            r.push_str(name);
        }
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::*;

    #[test]
    fn exception_mask_mapping() {
        assert_eq!(resume_exceptions(StopReason::FP_OVERFLOW | StopReason::MEMORY_VIOLATION | StopReason::DEBUG_TRAP),
                   Exceptions::WAVE_MATH_ERROR | Exceptions::WAVE_MEMORY_VIOLATION);
        assert_eq!(resume_exceptions(StopReason::NONE), Exceptions::NONE);
        assert_eq!(resume_exceptions(StopReason::DEBUG_TRAP), Exceptions::NONE);
        assert_eq!(resume_exceptions(StopReason::SINGLE_STEP), Exceptions::NONE);
        assert_eq!(resume_exceptions(StopReason::BREAKPOINT | StopReason::TRAP), Exceptions::WAVE_TRAP);
        assert_eq!(resume_exceptions(StopReason::ECC_ERROR), Exceptions::WAVE_ABORT);
        assert_eq!(resume_exceptions(StopReason::FATAL_HALT | StopReason::ILLEGAL_INSTRUCTION),
                   Exceptions::WAVE_ABORT | Exceptions::WAVE_ILLEGAL_INSTRUCTION);
        assert_eq!(resume_exceptions(StopReason::ADDRESS_ERROR), Exceptions::WAVE_ADDRESS_ERROR);
    }

    #[test]
    fn stop_all_converges() {
        let api = SimApi::new();
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(1, SimWave::running(0x1000));
            state.waves.insert(2, SimWave {state: WaveState::SingleStep, ..SimWave::running(0x2000)});
            state.waves.insert(3, SimWave::stopped(0x3000, StopReason::DEBUG_TRAP));
        }
        let stopped = stop_all_wavefronts(&api, ProcessId(1));

        assert!(stopped.contains(&WaveId(1)));
        assert!(stopped.contains(&WaveId(3)));
        // The single-stepping wave is left alone: no stop request, not counted stopped.
        assert!(!stopped.contains(&WaveId(2)));
        let state = api.state.lock().unwrap();
        assert_eq!(state.stop_requested, vec![1]);
    }

    #[test]
    fn stop_all_tolerates_wave_death() {
        let api = SimApi::new();
        {
            let mut state = api.state.lock().unwrap();
            state.waves.insert(5, SimWave {terminate_on_stop: true, ..SimWave::running(0x1000)});
            state.waves.insert(6, SimWave::running(0x2000));
        }
        let stopped = stop_all_wavefronts(&api, ProcessId(1));
        assert!(stopped.contains(&WaveId(6)));
        assert!(!stopped.contains(&WaveId(5)));
    }

    #[test]
    fn stop_reason_strings() {
        assert_eq!(stop_reason_string(StopReason::NONE), "NONE");
        assert_eq!(stop_reason_string(StopReason::MEMORY_VIOLATION), "MEMORY_VIOLATION");
        assert_eq!(stop_reason_string(StopReason::BREAKPOINT | StopReason::TRAP), "BREAKPOINT|TRAP");
    }
}
