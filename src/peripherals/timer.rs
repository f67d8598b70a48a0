// 10ms interrupt timer and 10ms busy-wait delay (§4.3.3).
//
// Grounded on iosim.c's `tmr_out`/`dly_out` (`SIGALRM`-driven `timer`
// flag raising `INT_INT`), re-expressed as an atomically updated flag
// per Design Notes ("signal-driven mutation -> atomically updated
// flags observed at instruction boundaries") instead of a bare global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static TICK_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_alarm(_sig: libc::c_int) {
    TICK_PENDING.store(true, Ordering::SeqCst);
}

const INTERVAL_US: i64 = 10_000; // 10ms

pub struct Timer {
    enabled: bool,
}

impl Timer {
    pub fn new() -> Timer {
        Timer { enabled: false }
    }

    /// `OUT 27, v`: `v != 0` arms the periodic `SIGALRM`, `v == 0`
    /// disarms it.
    pub fn set_enabled(&mut self, v: u8) {
        let want = v != 0;
        if want == self.enabled {
            return;
        }
        if want {
            self.install_handler();
            self.arm_itimer();
        } else {
            self.disarm_itimer();
        }
        self.enabled = want;
    }

    pub fn enabled(&self) -> u8 {
        self.enabled as u8
    }

    /// Checks and clears the pending-tick flag set by the signal
    /// handler; called at each instruction boundary by the run loop.
    pub fn take_tick(&self) -> bool {
        TICK_PENDING.swap(false, Ordering::SeqCst)
    }

    fn install_handler(&self) {
        let action = SigAction::new(
            SigHandler::Handler(on_alarm),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: replaces the process-wide SIGALRM disposition with a
        // handler that only stores to an atomic, the minimal
        // signal-safe operation Design Notes calls for.
        unsafe {
            let _ = sigaction(Signal::SIGALRM, &action);
        }
    }

    fn arm_itimer(&self) {
        let interval = libc::timeval {
            tv_sec: 0,
            tv_usec: INTERVAL_US,
        };
        let it = libc::itimerval {
            it_interval: interval,
            it_value: interval,
        };
        // SAFETY: `it` is a plain value struct, `setitimer` only
        // reads it and previous-value output is not requested.
        unsafe {
            libc::setitimer(libc::ITIMER_REAL, &it, std::ptr::null_mut());
        }
    }

    fn disarm_itimer(&self) {
        let zero = libc::timeval { tv_sec: 0, tv_usec: 0 };
        let it = libc::itimerval {
            it_interval: zero,
            it_value: zero,
        };
        unsafe {
            libc::setitimer(libc::ITIMER_REAL, &it, std::ptr::null_mut());
        }
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}

/// `OUT 28, _`: a synchronous 10ms sleep, no CPU work happens during it.
pub fn busy_delay() {
    std::thread::sleep(Duration::from_millis(10));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let timer = Timer::new();
        assert_eq!(timer.enabled(), 0);
        assert!(!timer.take_tick());
    }

    #[test]
    fn enabling_twice_is_a_no_op_on_state() {
        let mut timer = Timer::new();
        timer.set_enabled(1);
        assert_eq!(timer.enabled(), 1);
        timer.set_enabled(1);
        assert_eq!(timer.enabled(), 1);
        timer.set_enabled(0);
        assert_eq!(timer.enabled(), 0);
    }
}
