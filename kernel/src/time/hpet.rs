//! HPET-backed timed-event queue.
//!
//! One HPET timer runs in one-shot mode, re-armed for one millisecond on
//! every expiry. Each expiry advances a tick counter; queued events hold
//! deadlines in ticks relative to the last firing batch, ordered ascending.
//! A periodic-capable timer is identified and logged for later use but is
//! not armed.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::acpi::{self, GenericAddress, SdtHeader};
use crate::apic;
use crate::memory::address_space;
use crate::memory::vm_object::VmObject;
use crate::memory::PAGE_SIZE;
use crate::spinlock::SpinLock;

/// Completion callback carrying only its registration data.
pub type EventHandler = fn(usize);

const FEMTOSECONDS_PER_MILLISECOND: u64 = 1_000_000_000_000;

// Register block offsets.
const REG_GENERAL_CAPABILITIES: u64 = 0x000;
const REG_GENERAL_CONFIGURATION: u64 = 0x010;
const REG_GENERAL_INTERRUPT_STATUS: u64 = 0x020;
const REG_MAIN_COUNTER_VALUE: u64 = 0x0F0;
const REG_TIMERS_BASE: u64 = 0x100;
const TIMER_STRIDE: u64 = 0x20;
const TIMER_COMPARATOR: u64 = 0x08;

// General configuration bits.
const CONFIG_ENABLE: u64 = 1 << 0;
const CONFIG_LEGACY_REPLACEMENT: u64 = 1 << 1;

// Per-timer configuration bits.
const TIMER_INTERRUPT_ENABLE: u64 = 1 << 2;
const TIMER_PERIODIC_CAPABLE: u64 = 1 << 4;
const TIMER_FSB_CAPABLE: u64 = 1 << 15;

/// HPET description table: the SDT header followed by these fields.
#[repr(C, packed)]
#[allow(dead_code)]
struct HpetTable {
    header: SdtHeader,
    event_timer_block_id: u32,
    base_address: GenericAddress,
    hpet_number: u8,
    main_counter_minimum_periodic: u16,
    page_protection: u8,
}

struct TimedEvent {
    deadline_ticks: u64,
    handler: EventHandler,
    handler_data: usize,
    id: usize,
}

pub struct Hpet {
    registers: *mut u8,
    clock_period_fs: u32,
    one_shot_timer: u8,
    one_shot_routing: u8,
    queue: Vec<TimedEvent>,
    current_tick_count: u64,
    next_id: usize,
    _window: Option<Arc<VmObject>>,
}

unsafe impl Send for Hpet {}

impl Hpet {
    fn read(&self, offset: u64) -> u64 {
        unsafe { core::ptr::read_volatile(self.registers.add(offset as usize) as *const u64) }
    }

    fn write(&mut self, offset: u64, value: u64) {
        unsafe { core::ptr::write_volatile(self.registers.add(offset as usize) as *mut u64, value) }
    }

    fn timer_offset(timer: u8) -> u64 {
        REG_TIMERS_BASE + timer as u64 * TIMER_STRIDE
    }

    /// Queue `handler` to fire `milliseconds` from now. Returns the event
    /// id, or 0 for a zero-length request.
    pub fn create_timed_event(
        &mut self,
        milliseconds: u64,
        handler: EventHandler,
        handler_data: usize,
    ) -> usize {
        if milliseconds == 0 {
            return 0;
        }

        // Rebase everything onto "now" so all deadlines share one epoch.
        let elapsed = self.current_tick_count;
        for event in self.queue.iter_mut() {
            event.deadline_ticks = event.deadline_ticks.saturating_sub(elapsed);
        }
        self.current_tick_count = 0;

        let id = self.next_id;
        self.next_id += 1;

        let position = self
            .queue
            .iter()
            .position(|event| event.deadline_ticks >= milliseconds)
            .unwrap_or(self.queue.len());
        self.queue.insert(
            position,
            TimedEvent {
                deadline_ticks: milliseconds,
                handler,
                handler_data,
                id,
            },
        );
        id
    }

    /// Cancel a queued event; unknown ids are a silent no-op.
    pub fn remove_timed_event(&mut self, id: usize) {
        if let Some(position) = self.queue.iter().position(|event| event.id == id) {
            self.queue.remove(position);
        }
    }

    /// One-shot expiry: advance the epoch, fire every event whose deadline
    /// has been reached, and re-arm for the next millisecond.
    pub fn handle_tick(&mut self) {
        if self.queue.is_empty() {
            self.current_tick_count = 0;
            self.setup_one_shot_millisecond();
            return;
        }

        self.current_tick_count += 1;

        if self.current_tick_count >= self.queue[0].deadline_ticks {
            let elapsed = self.current_tick_count;
            for event in self.queue.iter_mut() {
                event.deadline_ticks = event.deadline_ticks.saturating_sub(elapsed);
            }

            while let Some(event) = self.queue.first() {
                if event.deadline_ticks != 0 {
                    break;
                }
                let event = self.queue.remove(0);
                (event.handler)(event.handler_data);
            }

            self.current_tick_count = 0;
        }

        self.setup_one_shot_millisecond();
    }

    /// Program the one-shot timer to fire one millisecond from the current
    /// main counter value. The counter is stopped around the comparator
    /// update so the deadline cannot race it.
    fn setup_one_shot_millisecond(&mut self) {
        let config = self.read(REG_GENERAL_CONFIGURATION);
        self.write(REG_GENERAL_CONFIGURATION, config & !CONFIG_ENABLE);

        let ticks = FEMTOSECONDS_PER_MILLISECOND / self.clock_period_fs as u64;
        let deadline = self.read(REG_MAIN_COUNTER_VALUE) + ticks;
        let timer = Self::timer_offset(self.one_shot_timer);
        self.write(
            timer,
            ((self.one_shot_routing as u64 & 0x1F) << 9) | TIMER_INTERRUPT_ENABLE,
        );
        self.write(timer + TIMER_COMPARATOR, deadline);
        self.write(REG_GENERAL_INTERRUPT_STATUS, u64::MAX);

        let config = self.read(REG_GENERAL_CONFIGURATION);
        self.write(REG_GENERAL_CONFIGURATION, config | CONFIG_ENABLE);
    }

    #[cfg(test)]
    fn for_tests(registers: *mut u8) -> Self {
        Hpet {
            registers,
            clock_period_fs: 1_000_000_000,
            one_shot_timer: 0,
            one_shot_routing: 16,
            queue: Vec::new(),
            current_tick_count: 0,
            next_id: 1,
            _window: None,
        }
    }
}

static HPET: SpinLock<Option<Hpet>> = SpinLock::new(None);

fn hpet_interrupt_handler(_data: usize, _vector: u8) {
    let mut hpet = HPET.lock();
    if let Some(hpet) = hpet.as_mut() {
        hpet.handle_tick();
    }
}

/// Locate the HPET, map its registers, pick timers, route the one-shot
/// timer through the IOAPIC and start the millisecond re-arm cycle.
/// Every failure here is fatal: the kernel has no other time source.
pub fn init() {
    let table = acpi::table_by_signature(b"HPET")
        .unwrap_or_else(|| panic!("[hpet] HPET table not found"));
    let table = unsafe { &*(table as *const SdtHeader as *const HpetTable) };
    let base_address = { table.base_address.address };
    log::info!("[hpet] register block at {:#x}", base_address);

    let window = Arc::new(VmObject::mmio(base_address, PAGE_SIZE));
    let mapped = address_space::kernel_map_object(window.clone())
        .unwrap_or_else(|| panic!("[hpet] could not map HPET registers"));

    let mut hpet = Hpet {
        registers: mapped as *mut u8,
        clock_period_fs: 0,
        one_shot_timer: 0xFF,
        one_shot_routing: 0xFF,
        queue: Vec::new(),
        current_tick_count: 0,
        next_id: 1,
        _window: Some(window),
    };

    let capabilities = hpet.read(REG_GENERAL_CAPABILITIES);
    hpet.clock_period_fs = (capabilities >> 32) as u32;
    let timer_count = (((capabilities >> 8) & 0x1F) + 1) as u8;
    log::info!(
        "[hpet] {} timers, clock period {:#x} fs",
        timer_count,
        hpet.clock_period_fs
    );

    // First periodic-capable timer is noted for future use; the first timer
    // left over becomes the one-shot workhorse.
    let mut periodic_timer = 0xFFu8;
    for timer in 0..timer_count {
        let capabilities = hpet.read(Hpet::timer_offset(timer));
        let periodic = capabilities & TIMER_PERIODIC_CAPABLE != 0;
        log::info!(
            "[hpet]   - timer {}: routing {:#x}, periodic {}, fsb {}",
            timer,
            capabilities >> 32,
            periodic,
            capabilities & TIMER_FSB_CAPABLE != 0
        );
        if periodic_timer == 0xFF && periodic {
            periodic_timer = timer;
        } else if hpet.one_shot_timer == 0xFF {
            hpet.one_shot_timer = timer;
        }
    }

    if periodic_timer == 0xFF {
        panic!("[hpet] no timer supports periodic mode");
    }
    log::info!("[hpet] timer {} reserved for periodic mode", periodic_timer);
    if hpet.one_shot_timer == 0xFF {
        panic!("[hpet] no timer available for one-shot mode");
    }
    log::info!("[hpet] timer {} drives one-shot events", hpet.one_shot_timer);

    // Legacy-replacement routing would hijack the IOAPIC pins we are about
    // to program.
    let config = hpet.read(REG_GENERAL_CONFIGURATION);
    hpet.write(REG_GENERAL_CONFIGURATION, config & !CONFIG_LEGACY_REPLACEMENT);

    // Route the one-shot timer at the first IOAPIC pin its routing
    // capability mask allows.
    let routing_mask = (hpet.read(Hpet::timer_offset(hpet.one_shot_timer)) >> 32) as u32;
    let mut routed = false;
    for pin in 0..32u8 {
        if routing_mask & (1 << pin) != 0
            && apic::try_register_ioapic_entry(pin, hpet_interrupt_handler, 0)
        {
            hpet.one_shot_routing = pin;
            routed = true;
            break;
        }
    }
    if !routed {
        panic!("[hpet] no IOAPIC pin available for the one-shot timer");
    }

    *HPET.lock() = Some(hpet);
    HPET.lock()
        .as_mut()
        .expect("hpet just installed")
        .setup_one_shot_millisecond();
    log::info!("[hpet] one-shot millisecond timer armed");
}

/// Queue a one-shot event through the global driver.
pub fn create_timed_event(milliseconds: u64, handler: EventHandler, handler_data: usize) -> usize {
    HPET.lock()
        .as_mut()
        .expect("HPET not initialized")
        .create_timed_event(milliseconds, handler, handler_data)
}

/// Cancel a queued event.
pub fn remove_timed_event(id: usize) {
    HPET.lock()
        .as_mut()
        .expect("HPET not initialized")
        .remove_timed_event(id);
}

#[cfg(test)]
pub(crate) fn install_for_tests(registers: *mut u8) {
    *HPET.lock() = Some(Hpet::for_tests(registers));
}

#[cfg(test)]
pub(crate) fn tick_for_tests() {
    hpet_interrupt_handler(0, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The log and clock are shared statics, so queue tests take this lock.
    static QUEUE_TESTS: Mutex<()> = Mutex::new(());
    static FIRE_LOG: Mutex<std::vec::Vec<(usize, u64)>> = Mutex::new(std::vec::Vec::new());
    static TICK_NOW: Mutex<u64> = Mutex::new(0);

    fn logging_handler(data: usize) {
        let now = *TICK_NOW.lock().unwrap();
        FIRE_LOG.lock().unwrap().push((data, now));
    }

    fn fake_registers() -> std::boxed::Box<[u64; 512]> {
        std::boxed::Box::new([0u64; 512])
    }

    fn run_ticks(hpet: &mut Hpet, count: u64) {
        for _ in 0..count {
            *TICK_NOW.lock().unwrap() += 1;
            hpet.handle_tick();
        }
    }

    fn fresh() -> (std::sync::MutexGuard<'static, ()>, std::boxed::Box<[u64; 512]>, Hpet) {
        let guard = QUEUE_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        FIRE_LOG.lock().unwrap().clear();
        *TICK_NOW.lock().unwrap() = 0;
        let mut registers = fake_registers();
        let hpet = Hpet::for_tests(registers.as_mut_ptr() as *mut u8);
        (guard, registers, hpet)
    }

    #[test]
    fn scenario_fire_order_follows_deadlines() {
        let (_guard, _registers, mut hpet) = fresh();

        assert_ne!(hpet.create_timed_event(100, logging_handler, 1), 0);
        assert_ne!(hpet.create_timed_event(50, logging_handler, 2), 0);
        assert_ne!(hpet.create_timed_event(75, logging_handler, 3), 0);

        run_ticks(&mut hpet, 100);

        let log = FIRE_LOG.lock().unwrap();
        assert_eq!(*log, std::vec![(2, 50), (3, 75), (1, 100)]);
    }

    #[test]
    fn zero_milliseconds_is_rejected() {
        let (_guard, _registers, mut hpet) = fresh();
        assert_eq!(hpet.create_timed_event(0, logging_handler, 9), 0);
        run_ticks(&mut hpet, 5);
        assert!(FIRE_LOG.lock().unwrap().is_empty());
    }

    #[test]
    fn late_insert_is_relative_to_now() {
        let (_guard, _registers, mut hpet) = fresh();

        hpet.create_timed_event(30, logging_handler, 1);
        run_ticks(&mut hpet, 10);
        // Queued mid-flight: fires 15 ticks from now, i.e. at absolute 25.
        hpet.create_timed_event(15, logging_handler, 2);
        run_ticks(&mut hpet, 30);

        let log = FIRE_LOG.lock().unwrap();
        assert_eq!(*log, std::vec![(2, 25), (1, 30)]);
    }

    #[test]
    fn removed_events_never_fire() {
        let (_guard, _registers, mut hpet) = fresh();

        let keep = hpet.create_timed_event(10, logging_handler, 1);
        let cancel = hpet.create_timed_event(5, logging_handler, 2);
        assert_ne!(keep, cancel);
        hpet.remove_timed_event(cancel);
        hpet.remove_timed_event(9999); // unknown id: no-op

        run_ticks(&mut hpet, 20);
        let log = FIRE_LOG.lock().unwrap();
        assert_eq!(*log, std::vec![(1, 10)]);
    }

    #[test]
    fn simultaneous_deadlines_fire_in_one_batch() {
        let (_guard, _registers, mut hpet) = fresh();

        hpet.create_timed_event(20, logging_handler, 1);
        hpet.create_timed_event(20, logging_handler, 2);
        hpet.create_timed_event(21, logging_handler, 3);

        run_ticks(&mut hpet, 21);
        let log = FIRE_LOG.lock().unwrap();
        assert_eq!(*log, std::vec![(1, 20), (2, 20), (3, 21)]);
    }

    #[test]
    fn rearm_writes_comparator_one_millisecond_ahead() {
        let (_guard, registers, mut hpet) = fresh();

        // Main counter at 5000; a 1 GHz-period clock gives 1000 ticks/ms.
        unsafe {
            let base = registers.as_ptr() as *mut u8;
            core::ptr::write_volatile(
                base.add(REG_MAIN_COUNTER_VALUE as usize) as *mut u64,
                5000,
            );
        }
        hpet.handle_tick();

        let timer_config = unsafe {
            core::ptr::read_volatile(
                (registers.as_ptr() as *const u8).add(Hpet::timer_offset(0) as usize)
                    as *const u64,
            )
        };
        let comparator = unsafe {
            core::ptr::read_volatile(
                (registers.as_ptr() as *const u8)
                    .add((Hpet::timer_offset(0) + TIMER_COMPARATOR) as usize)
                    as *const u64,
            )
        };
        assert_eq!(timer_config, (16 << 9) | TIMER_INTERRUPT_ENABLE);
        assert_eq!(comparator, 6000);
    }
}
