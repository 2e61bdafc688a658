//! Blocking and fire-and-forget waits on top of the HPET event queue.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::hpet;

/// A reusable one-shot timer.
///
/// `wait` spins until the HPET event fires; `non_blocking_wait` arms the
/// timer and lets the caller poll `was_fired` (the AHCI port-up wait does
/// this with a 100 ms timeout). The timer must stay alive until the event
/// fires or is disabled, since the event handler dereferences it.
pub struct Timer {
    fired: AtomicBool,
    running: AtomicBool,
    event_id: AtomicUsize,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            running: AtomicBool::new(false),
            event_id: AtomicUsize::new(0),
        }
    }

    /// Block for `milliseconds`. No-op when the timer is already armed.
    pub fn wait(&self, milliseconds: u64) {
        if self.running.swap(true, Ordering::Acquire) {
            return;
        }
        self.fired.store(false, Ordering::Release);

        let id = hpet::create_timed_event(milliseconds, Self::event_handler, self.as_data());
        self.event_id.store(id, Ordering::Release);

        while !self.fired.load(Ordering::Acquire) {
            spin_loop();
        }

        self.fired.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    /// Arm the timer without blocking; poll with [`was_fired`].
    pub fn non_blocking_wait(&self, milliseconds: u64) {
        if self.running.swap(true, Ordering::Acquire) {
            return;
        }
        self.fired.store(false, Ordering::Release);

        let id = hpet::create_timed_event(milliseconds, Self::event_handler, self.as_data());
        self.event_id.store(id, Ordering::Release);
    }

    /// Cancel an armed non-blocking wait.
    pub fn disable_non_blocking_wait(&self) {
        self.running.store(false, Ordering::Release);
        self.fired.store(false, Ordering::Release);
        hpet::remove_timed_event(self.event_id.load(Ordering::Acquire));
    }

    pub fn was_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn as_data(&self) -> usize {
        self as *const Timer as usize
    }

    fn event_handler(data: usize) {
        // The registration contract keeps the timer alive while armed.
        let timer = unsafe { &*(data as *const Timer) };
        if !timer.running.load(Ordering::Acquire) {
            return;
        }
        timer.fired.store(true, Ordering::Release);
        timer.running.store(false, Ordering::Release);
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // These tests drive the global HPET singleton, so they share one lock.
    static GLOBAL_HPET: Mutex<()> = Mutex::new(());

    fn install_hpet() -> std::boxed::Box<[u64; 512]> {
        let mut registers = std::boxed::Box::new([0u64; 512]);
        hpet::install_for_tests(registers.as_mut_ptr() as *mut u8);
        registers
    }

    #[test]
    fn blocking_wait_returns_once_the_event_fires() {
        let _guard = GLOBAL_HPET.lock().unwrap_or_else(|e| e.into_inner());
        let _registers = install_hpet();

        static TIMER: Timer = Timer::new();
        let ticker = std::thread::spawn(|| {
            for _ in 0..50 {
                std::thread::sleep(std::time::Duration::from_millis(1));
                hpet::tick_for_tests();
            }
        });

        TIMER.wait(5);
        assert!(!TIMER.was_fired());
        ticker.join().unwrap();
    }

    #[test]
    fn non_blocking_wait_fires_and_can_be_disabled() {
        let _guard = GLOBAL_HPET.lock().unwrap_or_else(|e| e.into_inner());
        let _registers = install_hpet();

        static TIMER: Timer = Timer::new();
        TIMER.non_blocking_wait(3);
        assert!(!TIMER.was_fired());
        for _ in 0..3 {
            hpet::tick_for_tests();
        }
        assert!(TIMER.was_fired());
        TIMER.disable_non_blocking_wait();
        assert!(!TIMER.was_fired());

        // A disabled timer can be re-armed and cancelled before expiry.
        TIMER.non_blocking_wait(10);
        hpet::tick_for_tests();
        TIMER.disable_non_blocking_wait();
        for _ in 0..20 {
            hpet::tick_for_tests();
        }
        assert!(!TIMER.was_fired());
    }
}
