//! Kernel logger: the `log` facade fanned out to the serial port and, once
//! the graphics console exists, to the framebuffer.

use core::sync::atomic::{AtomicBool, Ordering};
use log::{LevelFilter, Metadata, Record};

static LOGGER: KernelLogger = KernelLogger;
static FRAMEBUFFER_ATTACHED: AtomicBool = AtomicBool::new(false);

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!("[{:5}] {}", record.level(), record.args());
        if FRAMEBUFFER_ATTACHED.load(Ordering::Acquire) {
            crate::framebuffer::write_fmt(format_args!(
                "[{:5}] {}\n",
                record.level(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Serial must already be initialized.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(LevelFilter::Debug);
}

/// Mirror subsequent log output to the framebuffer console as well.
pub fn attach_framebuffer() {
    FRAMEBUFFER_ATTACHED.store(true, Ordering::Release);
}
