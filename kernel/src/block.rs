//! Block device abstraction.
//!
//! Storage drivers register devices here; consumers submit asynchronous
//! requests whose completion arrives through the registered handler once
//! the underlying DMA finishes.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::memory::vm_object::VmObject;
use crate::spinlock::SpinLock;
use crate::time::hpet::EventHandler;

/// Callback-style sector access over some storage medium. Buffers are VM
/// objects so the driver can hand their frames straight to the hardware.
pub trait BlockDevice: Send + Sync {
    /// Whether the device accepts writes.
    fn writable(&self) -> bool;

    /// Total number of addressable sectors.
    fn sector_count(&self) -> u64;

    /// Queue a read of `count` sectors starting at `sector` into `buffer`.
    /// Returns false when the request could not be submitted; otherwise
    /// `handler(handler_data)` runs on completion.
    fn read(
        &self,
        sector: u64,
        count: u16,
        buffer: &Arc<VmObject>,
        handler: EventHandler,
        handler_data: usize,
    ) -> bool;

    /// Queue a write. Devices that are not writable return false.
    fn write(
        &self,
        sector: u64,
        count: u16,
        buffer: &Arc<VmObject>,
        handler: EventHandler,
        handler_data: usize,
    ) -> bool;
}

static DEVICES: SpinLock<Vec<&'static dyn BlockDevice>> = SpinLock::new(Vec::new());

/// Add a device to the system-wide registry.
pub fn register(device: &'static dyn BlockDevice) {
    DEVICES.lock().push(device);
}

/// Snapshot of all registered devices.
pub fn devices() -> Vec<&'static dyn BlockDevice> {
    DEVICES.lock().clone()
}
