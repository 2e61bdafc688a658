//! AHCI (SATA) host bus adapter driver.
//!
//! Each controller maps its ABAR, resets the HBA, takes an MSI vector and
//! brings up every implemented port: received-FIS area, command list and
//! one command table per slot all live in uncacheable DMA pages. Reads are
//! DMA commands assembled into a free command slot; completion arrives via
//! MSI and is demultiplexed against the per-port command-issue register.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::block::{self, BlockDevice};
use crate::drivers::pci::{self, PciDevice};
use crate::interrupts;
use crate::memory::address_space;
use crate::memory::vm_object::VmObject;
use crate::memory::{KERNEL_PID, PAGE_SIZE};
use crate::spinlock::SpinLock;
use crate::time::hpet::EventHandler;
use crate::time::Timer;

// Generic host control registers (byte offsets from the ABAR).
const HBA_CAP: u64 = 0x00;
const HBA_GHC: u64 = 0x04;
const HBA_IS: u64 = 0x08;
const HBA_PI: u64 = 0x0C;
const HBA_VS: u64 = 0x10;
const HBA_CAP2: u64 = 0x24;
const HBA_BOHC: u64 = 0x28;

const GHC_RESET: u32 = 1 << 0;
const GHC_INTERRUPT_ENABLE: u32 = 1 << 1;
const GHC_AHCI_ENABLE: u32 = 1 << 31;

const CAP2_BIOS_HANDOFF: u32 = 1 << 0;
const BOHC_BIOS_OWNERSHIP: u32 = 1 << 0;
const BOHC_OS_OWNERSHIP: u32 = 1 << 1;

// Port register block: 0x80 bytes each, starting at 0x100.
const PORT_REGISTERS_BASE: u64 = 0x100;
const PORT_REGISTERS_SIZE: u64 = 0x80;

const PORT_CLB: u64 = 0x00;
const PORT_CLBU: u64 = 0x04;
const PORT_FB: u64 = 0x08;
const PORT_FBU: u64 = 0x0C;
const PORT_IS: u64 = 0x10;
const PORT_IE: u64 = 0x14;
const PORT_CMD: u64 = 0x18;
const PORT_SIG: u64 = 0x24;
const PORT_SSTS: u64 = 0x28;
const PORT_SCTL: u64 = 0x2C;
const PORT_SERR: u64 = 0x30;
const PORT_CI: u64 = 0x38;

const PORT_CMD_START: u32 = 1 << 0;
const PORT_CMD_FIS_RECEIVE_ENABLE: u32 = 1 << 4;

const SSTS_DET_MASK: u32 = 0x0F;
const SSTS_DET_ESTABLISHED: u32 = 3;

/// Only plain SATA drives are driven; ATAPI and multipliers are skipped.
const SIGNATURE_SATA: u32 = 0x0000_0101;

const ATA_COMMAND_IDENTIFY: u8 = 0xEC;
const ATA_COMMAND_READ_DMA_EXT: u8 = 0x25;

const FIS_TYPE_REGISTER_H2D: u8 = 0x27;
const FIS_FLAG_COMMAND: u8 = 1 << 7;

const COMMAND_HEADER_WRITE: u16 = 1 << 6;
const PRDT_INTERRUPT_ON_COMPLETION: u32 = 1 << 31;

/// One command-list slot header (32 bytes, 32 per port).
#[repr(C)]
struct CommandHeader {
    /// [4:0] command FIS length in dwords, [6] write.
    flags: u16,
    prdt_length: u16,
    /// Bytes transferred, written back by the HBA.
    byte_count: u32,
    command_table_base: u32,
    command_table_base_upper: u32,
    _reserved: [u32; 4],
}

/// Scatter-gather entry: one page per entry, byte count is stored minus
/// one, bit 31 requests an interrupt on completion.
#[repr(C)]
struct PrdtEntry {
    data_base: u32,
    data_base_upper: u32,
    _reserved: u32,
    byte_count: u32,
}

/// Register host-to-device FIS (20 bytes of payload).
#[repr(C)]
struct CommandFis {
    fis_type: u8,
    /// [3:0] port multiplier, [7] command (vs control).
    flags: u8,
    command: u8,
    feature_low: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    device: u8,
    lba3: u8,
    lba4: u8,
    lba5: u8,
    feature_high: u8,
    count_low: u8,
    count_high: u8,
    icc: u8,
    control: u8,
    _reserved: [u8; 4],
}

/// Command table: command FIS, ATAPI command area, then the PRDT. One
/// uncacheable page holds one table; 128 entries fit with room to spare.
#[repr(C)]
struct CommandTable {
    command_fis: [u8; 64],
    atapi_command: [u8; 16],
    _reserved: [u8; 48],
    prdt: [PrdtEntry; 128],
}

#[allow(dead_code)]
struct Request {
    sector: u64,
    count: u16,
    write: bool,
    handler: Option<EventHandler>,
    handler_data: usize,
    /// Keeps the data object's frames alive until completion.
    buffer: Option<Arc<VmObject>>,
}

impl Request {
    const fn empty() -> Self {
        Request {
            sector: 0,
            count: 0,
            write: false,
            handler: None,
            handler_data: 0,
            buffer: None,
        }
    }
}

#[allow(dead_code)]
struct Port {
    number: u8,
    command_list: *mut CommandHeader,
    command_tables: Vec<*mut CommandTable>,
    identify_data: Option<*const u16>,
    identified: bool,
    commands_in_use: u32,
    current_requests: [Request; 32],
    sector_size: usize,
    sector_count: u64,
    _received_fis_object: Arc<VmObject>,
    _command_list_object: Arc<VmObject>,
    _command_table_objects: Vec<Arc<VmObject>>,
    identify_object: Option<Arc<VmObject>>,
}

unsafe impl Send for Port {}

pub struct AhciController {
    abar: u64,
    port_count: u8,
    command_slots: u8,
    ports: [SpinLock<Option<Port>>; 32],
    _abar_window: Option<Arc<VmObject>>,
}

unsafe impl Send for AhciController {}
unsafe impl Sync for AhciController {}

/// `(ports, command slots, 64-bit addressing, staggered spin-up)` from CAP.
fn decode_capabilities(capabilities: u32) -> (u8, u8, bool, bool) {
    (
        ((capabilities & 0x1F) + 1) as u8,
        (((capabilities >> 8) & 0x1F) + 1) as u8,
        capabilities & (1 << 31) != 0,
        capabilities & (1 << 27) != 0,
    )
}

fn ahci_interrupt_handler(data: usize, _vector: u8) {
    let controller = unsafe { &*(data as *const AhciController) };
    controller.handle_interrupt();
}

impl AhciController {
    /// Bring up one controller found on the PCI bus. Returns the leaked,
    /// process-lifetime controller, or the reason it was left uninitialized.
    pub fn initialize(device: PciDevice<'static>) -> Result<&'static AhciController, &'static str> {
        device.enable_bus_mastering();
        device.disable_intx();

        let abar_physical = (device.bar_value(5) & !0x1FFF) as u64;
        if abar_physical == 0 {
            return Err("BAR5 is not programmed");
        }
        let window = Arc::new(VmObject::mmio(abar_physical, 2 * PAGE_SIZE));
        let mapped = address_space::kernel_map_object(window.clone())
            .unwrap_or_else(|| panic!("[ahci] could not map ABAR"));

        let mut controller = Box::new(AhciController {
            abar: mapped,
            port_count: 0,
            command_slots: 0,
            ports: [const { SpinLock::new(None) }; 32],
            _abar_window: Some(window),
        });

        // Take ownership from the firmware before touching anything else.
        if controller.hba_read(HBA_CAP2) & CAP2_BIOS_HANDOFF != 0 {
            log::info!("[ahci]   - BIOS/OS handoff...");
            let bohc = controller.hba_read(HBA_BOHC);
            controller.hba_write(HBA_BOHC, bohc | BOHC_OS_OWNERSHIP);
            while controller.hba_read(HBA_BOHC) & BOHC_BIOS_OWNERSHIP != 0 {
                core::hint::spin_loop();
            }
            log::info!("[ahci]   - BIOS/OS handoff complete");
        }

        let capabilities = controller.hba_read(HBA_CAP);
        let (port_count, command_slots, supports_64bit, staggered) =
            decode_capabilities(capabilities);
        controller.port_count = port_count;
        controller.command_slots = command_slots;
        log::info!(
            "[ahci]   - version {:#x}: {} ports, {} slots, 64-bit {}, staggered {}",
            controller.hba_read(HBA_VS),
            port_count,
            command_slots,
            supports_64bit,
            staggered
        );
        if !supports_64bit {
            return Err("controller lacks 64-bit addressing");
        }
        if staggered {
            return Err("staggered spin-up is not supported");
        }

        controller.hba_write(HBA_GHC, GHC_RESET);
        while controller.hba_read(HBA_GHC) & GHC_RESET != 0 {
            core::hint::spin_loop();
        }
        log::info!("[ahci]   - controller reset");

        // The interrupt handler holds a pointer to the controller, so pin
        // it for the rest of the kernel's lifetime before registering.
        let controller: &'static AhciController = Box::leak(controller);
        let vector =
            interrupts::reserve_msi_vector(ahci_interrupt_handler, controller as *const _ as usize);
        if vector == 0 {
            return Err("no interrupt vector available");
        }
        device.enable_msi(vector);

        let ghc = controller.hba_read(HBA_GHC);
        controller.hba_write(HBA_GHC, ghc | GHC_AHCI_ENABLE | GHC_INTERRUPT_ENABLE);

        let implemented = controller.hba_read(HBA_PI);
        for port in 0..controller.port_count {
            if implemented & (1 << port) == 0 {
                continue;
            }
            log::info!("[ahci]   - port {} implemented, setting up", port);
            if controller.setup_port_memory(port) && !controller.reset_and_start_port(port) {
                *controller.ports[port as usize].lock() = None;
            }
        }

        controller.identify_devices();
        Ok(controller)
    }

    fn hba_read(&self, offset: u64) -> u32 {
        unsafe { core::ptr::read_volatile((self.abar + offset) as *const u32) }
    }

    fn hba_write(&self, offset: u64, value: u32) {
        unsafe { core::ptr::write_volatile((self.abar + offset) as *mut u32, value) }
    }

    fn port_read(&self, port: u8, offset: u64) -> u32 {
        self.hba_read(PORT_REGISTERS_BASE + port as u64 * PORT_REGISTERS_SIZE + offset)
    }

    fn port_write(&self, port: u8, offset: u64, value: u32) {
        self.hba_write(
            PORT_REGISTERS_BASE + port as u64 * PORT_REGISTERS_SIZE + offset,
            value,
        );
    }

    /// Allocate and map the port's DMA memory (received FIS, command list,
    /// one command table per slot), prefill the command headers and point
    /// the port registers at the new structures.
    fn setup_port_memory(&self, number: u8) -> bool {
        let received_fis_object = Arc::new(VmObject::uncacheable_page(false));
        let Some(received_fis) = address_space::kernel_map_object(received_fis_object.clone())
        else {
            log::warn!("[ahci]   - no address space for the received FIS page");
            return false;
        };
        unsafe { core::ptr::write_bytes(received_fis as *mut u8, 0, PAGE_SIZE) };

        let command_list_object = Arc::new(VmObject::uncacheable_page(false));
        let Some(command_list) = address_space::kernel_map_object(command_list_object.clone())
        else {
            log::warn!("[ahci]   - no address space for the command list page");
            return false;
        };
        unsafe { core::ptr::write_bytes(command_list as *mut u8, 0, PAGE_SIZE) };

        let mut command_table_objects = Vec::new();
        let mut command_tables = Vec::new();
        for _ in 0..self.command_slots {
            let object = Arc::new(VmObject::uncacheable_page(false));
            let Some(mapped) = address_space::kernel_map_object(object.clone()) else {
                log::warn!("[ahci]   - no address space for a command table page");
                return false;
            };
            unsafe { core::ptr::write_bytes(mapped as *mut u8, 0, PAGE_SIZE) };
            command_table_objects.push(object);
            command_tables.push(mapped as *mut CommandTable);
        }

        let headers = command_list as *mut CommandHeader;
        for slot in 0..self.command_slots as usize {
            let table_physical = command_table_objects[slot].physical_address();
            unsafe {
                (*headers.add(slot)).prdt_length = 128;
                (*headers.add(slot)).command_table_base = table_physical as u32;
                (*headers.add(slot)).command_table_base_upper = (table_physical >> 32) as u32;
            }
        }

        let command_list_physical = command_list_object.physical_address();
        self.port_write(number, PORT_CLB, command_list_physical as u32);
        self.port_write(number, PORT_CLBU, (command_list_physical >> 32) as u32);
        let received_fis_physical = received_fis_object.physical_address();
        self.port_write(number, PORT_FB, received_fis_physical as u32);
        self.port_write(number, PORT_FBU, (received_fis_physical >> 32) as u32);

        // Slots past the controller's limit must never be allocatable.
        let mut unusable_slots = 0u32;
        for slot in self.command_slots as usize..32 {
            unusable_slots |= 1 << slot;
        }

        *self.ports[number as usize].lock() = Some(Port {
            number,
            command_list: headers,
            command_tables,
            identify_data: None,
            identified: false,
            commands_in_use: unusable_slots,
            current_requests: [const { Request::empty() }; 32],
            sector_size: 512,
            sector_count: 0,
            _received_fis_object: received_fis_object,
            _command_list_object: command_list_object,
            _command_table_objects: command_table_objects,
            identify_object: None,
        });
        true
    }

    /// COMRESET the link, wait for device detection, check the signature
    /// and start command processing. Returns false when no usable SATA
    /// device answers on this port.
    fn reset_and_start_port(&self, number: u8) -> bool {
        let timer = Timer::new();

        let command = self.port_read(number, PORT_CMD);
        self.port_write(number, PORT_CMD, command | PORT_CMD_FIS_RECEIVE_ENABLE);

        // Drive DET to issue COMRESET; it must stay asserted for >= 1 ms.
        let control = self.port_read(number, PORT_SCTL);
        self.port_write(number, PORT_SCTL, control | 1);
        timer.wait(2);
        let control = self.port_read(number, PORT_SCTL);
        self.port_write(number, PORT_SCTL, control & !1);

        // Up to 100 ms for the link to come back.
        timer.non_blocking_wait(100);
        while self.port_read(number, PORT_SSTS) & SSTS_DET_MASK != SSTS_DET_ESTABLISHED
            && !timer.was_fired()
        {
            core::hint::spin_loop();
        }
        if self.port_read(number, PORT_SSTS) & SSTS_DET_MASK != SSTS_DET_ESTABLISHED {
            log::info!("[ahci]   - port {}: no device detected", number);
            timer.disable_non_blocking_wait();
            return false;
        }
        timer.disable_non_blocking_wait();
        log::info!("[ahci]   - port {}: link established", number);

        // COMRESET leaves errors latched; clear before trusting status.
        self.port_write(number, PORT_SERR, 0xFFFF_FFFF);

        let signature = self.port_read(number, PORT_SIG);
        if signature != SIGNATURE_SATA {
            log::info!(
                "[ahci]   - port {}: unsupported device signature {:#x}",
                number,
                signature
            );
            return false;
        }

        self.port_write(number, PORT_IS, 0xFFFF_FFFF);
        self.port_write(number, PORT_IE, 0xFFFF_FFFF);
        let command = self.port_read(number, PORT_CMD);
        self.port_write(number, PORT_CMD, command | PORT_CMD_START);
        true
    }

    /// Issue IDENTIFY DEVICE on every live port. Completion is implicit:
    /// no per-request handler is installed; the MSI path recognizes the
    /// first interrupt of an unidentified port as the identify answer.
    fn identify_devices(&'static self) {
        for number in 0..self.port_count {
            let buffer = {
                let mut slot = self.ports[number as usize].lock();
                let Some(port) = slot.as_mut() else { continue };

                let buffer = Arc::new(VmObject::memory_backed(
                    PAGE_SIZE,
                    true,
                    false,
                    false,
                    true,
                    KERNEL_PID,
                ));
                let Some(mapped) = address_space::kernel_map_object(buffer.clone()) else {
                    panic!("[ahci] could not map identify buffer");
                };
                port.identify_object = Some(buffer.clone());
                port.identify_data = Some(mapped as *const u16);
                buffer
            };

            log::info!("[ahci]   - identifying port {}", number);
            self.issue_command(number, ATA_COMMAND_IDENTIFY, 1, 0, false, false, &buffer, None, 0);
        }
    }

    /// Assemble a command into a free slot and ring the doorbell. Returns
    /// false when no slot is free (queueing is future work) or the
    /// transfer exceeds the 128-entry PRDT window.
    #[allow(clippy::too_many_arguments)]
    pub fn issue_command(
        &self,
        number: u8,
        command: u8,
        sectors: u16,
        lba: u64,
        media_access: bool,
        write: bool,
        data: &Arc<VmObject>,
        handler: Option<EventHandler>,
        handler_data: usize,
    ) -> bool {
        let mut slot_guard = self.ports[number as usize].lock();
        let Some(port) = slot_guard.as_mut() else {
            return false;
        };

        if port.commands_in_use == u32::MAX {
            return false;
        }

        let bytes = sectors as usize * port.sector_size;
        if bytes > 128 * PAGE_SIZE {
            return false;
        }
        let prdt_length = bytes.div_ceil(PAGE_SIZE);
        if prdt_length > data.pages().len() {
            return false;
        }

        let slot = (!port.commands_in_use).trailing_zeros() as usize;

        unsafe {
            let header = port.command_list.add(slot);
            let mut flags = (core::mem::size_of::<CommandFis>() / 4) as u16;
            if write {
                flags |= COMMAND_HEADER_WRITE;
            }
            (*header).flags = flags;
            (*header).prdt_length = prdt_length as u16;

            let table = port.command_tables[slot];
            let fis = (*table).command_fis.as_mut_ptr() as *mut CommandFis;
            *fis = CommandFis {
                fis_type: FIS_TYPE_REGISTER_H2D,
                flags: FIS_FLAG_COMMAND,
                command,
                feature_low: 0,
                lba0: if media_access { lba as u8 } else { 0 },
                lba1: if media_access { (lba >> 8) as u8 } else { 0 },
                lba2: if media_access { (lba >> 16) as u8 } else { 0 },
                // Media commands use 48-bit LBA addressing.
                device: if media_access { 1 << 6 } else { 0 },
                lba3: if media_access { (lba >> 24) as u8 } else { 0 },
                lba4: if media_access { (lba >> 32) as u8 } else { 0 },
                lba5: if media_access { (lba >> 40) as u8 } else { 0 },
                feature_high: 0,
                count_low: if media_access { sectors as u8 } else { 0 },
                count_high: if media_access { (sectors >> 8) as u8 } else { 0 },
                icc: 0,
                control: 0,
                _reserved: [0; 4],
            };

            for (i, page) in data.pages().iter().take(prdt_length).enumerate() {
                (*table).prdt[i] = PrdtEntry {
                    data_base: *page as u32,
                    data_base_upper: (*page >> 32) as u32,
                    _reserved: 0,
                    byte_count: (PAGE_SIZE as u32 - 1) | PRDT_INTERRUPT_ON_COMPLETION,
                };
            }
        }

        port.current_requests[slot] = Request {
            sector: lba,
            count: sectors,
            write,
            handler,
            handler_data,
            buffer: Some(data.clone()),
        };
        port.commands_in_use |= 1 << slot;

        // The device must observe the descriptors before the doorbell.
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        self.port_write(number, PORT_CI, 1 << slot);
        log::debug!(
            "[ahci] command {:#x} issued to port {} slot {}",
            command,
            number,
            slot
        );
        true
    }

    /// MSI completion path: for every port flagged in the global interrupt
    /// status, either latch the identify answer or retire the command
    /// slots whose issue bits have cleared.
    pub fn handle_interrupt(&self) {
        let status = self.hba_read(HBA_IS);

        for number in 0..self.port_count {
            if status & (1 << number) == 0 {
                continue;
            }

            let mut completed: Vec<(EventHandler, usize)> = Vec::new();
            {
                let mut slot_guard = self.ports[number as usize].lock();
                let Some(port) = slot_guard.as_mut() else {
                    continue;
                };

                if !port.identified {
                    if let Some(identify) = port.identify_data {
                        let sector_count = unsafe {
                            (core::ptr::read_volatile(identify.add(100)) as u64)
                                | ((core::ptr::read_volatile(identify.add(101)) as u64) << 16)
                                | ((core::ptr::read_volatile(identify.add(102)) as u64) << 32)
                                | ((core::ptr::read_volatile(identify.add(103)) as u64) << 48)
                        };
                        port.sector_count = sector_count;
                        port.identified = true;
                        log::info!(
                            "[ahci] port {}: identified, {} sectors",
                            number,
                            sector_count
                        );
                    }
                } else {
                    let issued = self.port_read(number, PORT_CI);
                    for slot in 0..32 {
                        let bit = 1u32 << slot;
                        if port.commands_in_use & bit != 0 && issued & bit == 0 {
                            port.commands_in_use &= !bit;
                            let request =
                                core::mem::replace(&mut port.current_requests[slot], Request::empty());
                            if let Some(handler) = request.handler {
                                completed.push((handler, request.handler_data));
                            }
                        }
                    }
                }

                self.port_write(number, PORT_IS, 0xFFFF_FFFF);
            }

            // Handlers run outside the port lock so they may issue again.
            for (handler, data) in completed {
                handler(data);
            }
        }

        self.hba_write(HBA_IS, 0xFFFF_FFFF);
    }

    /// Sector count of an identified port; unidentified ports report zero.
    pub fn sector_count(&self, number: u8) -> u64 {
        let slot = self.ports[number as usize].lock();
        match slot.as_ref() {
            Some(port) if port.identified => port.sector_count,
            _ => 0,
        }
    }

    /// Queue a DMA read of `sectors` starting at `sector` into `buffer`.
    pub fn read_sectors(
        &self,
        number: u8,
        sector: u64,
        sectors: u16,
        buffer: &Arc<VmObject>,
        handler: EventHandler,
        handler_data: usize,
    ) -> bool {
        self.issue_command(
            number,
            ATA_COMMAND_READ_DMA_EXT,
            sectors,
            sector,
            true,
            false,
            buffer,
            Some(handler),
            handler_data,
        )
    }

    fn port_live(&self, number: u8) -> bool {
        self.ports[number as usize].lock().is_some()
    }
}

/// Read-only block device over one AHCI port.
pub struct AhciBlockDevice {
    controller: &'static AhciController,
    port: u8,
}

impl BlockDevice for AhciBlockDevice {
    fn writable(&self) -> bool {
        false
    }

    fn sector_count(&self) -> u64 {
        self.controller.sector_count(self.port)
    }

    fn read(
        &self,
        sector: u64,
        count: u16,
        buffer: &Arc<VmObject>,
        handler: EventHandler,
        handler_data: usize,
    ) -> bool {
        self.controller
            .read_sectors(self.port, sector, count, buffer, handler, handler_data)
    }

    fn write(
        &self,
        _sector: u64,
        _count: u16,
        _buffer: &Arc<VmObject>,
        _handler: EventHandler,
        _handler_data: usize,
    ) -> bool {
        false
    }
}

static CONTROLLERS: SpinLock<Vec<&'static AhciController>> = SpinLock::new(Vec::new());

/// Find every AHCI-class PCI function and bring it up. Controllers without
/// MSI support are skipped; per-controller failures only lose that
/// controller.
pub fn init() {
    let candidates = pci::devices_by_class(0x01, 0x06, 0x01);
    if candidates.is_empty() {
        log::info!("[ahci] no AHCI controllers found");
        return;
    }
    log::info!("[ahci] {} controller(s) found", candidates.len());

    for (index, device) in candidates.into_iter().enumerate() {
        if !device.supports_msi() {
            log::warn!("[ahci] controller {} has no MSI support, skipping", index);
            continue;
        }

        log::info!("[ahci] initializing controller {}", index);
        match AhciController::initialize(device) {
            Ok(controller) => {
                CONTROLLERS.lock().push(controller);
                for port in 0..32 {
                    if controller.port_live(port) {
                        block::register(Box::leak(Box::new(AhciBlockDevice { controller, port })));
                    }
                }
            }
            Err(reason) => {
                log::warn!("[ahci] controller {} left uninitialized: {}", index, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake ABAR: 0x100 bytes of host control plus 32 port blocks.
    struct FakeHba {
        backing: std::vec::Vec<u32>,
    }

    impl FakeHba {
        fn new() -> Self {
            FakeHba {
                backing: std::vec![0u32; (PORT_REGISTERS_BASE as usize + 32 * 0x80) / 4],
            }
        }

        fn base(&self) -> u64 {
            self.backing.as_ptr() as u64
        }

        fn read(&self, offset: u64) -> u32 {
            self.backing[offset as usize / 4]
        }

        fn write(&mut self, offset: u64, value: u32) {
            self.backing[offset as usize / 4] = value;
        }

        fn port_offset(port: u8, register: u64) -> u64 {
            PORT_REGISTERS_BASE + port as u64 * PORT_REGISTERS_SIZE + register
        }
    }

    fn test_controller(hba: &FakeHba) -> AhciController {
        AhciController {
            abar: hba.base(),
            port_count: 2,
            command_slots: 4,
            ports: [const { SpinLock::new(None) }; 32],
            _abar_window: None,
        }
    }

    fn install_identify_buffer(controller: &AhciController, port: u8) -> (Arc<VmObject>, *mut u16) {
        let buffer = Arc::new(VmObject::memory_backed(
            PAGE_SIZE,
            true,
            false,
            false,
            true,
            KERNEL_PID,
        ));
        let mapped = (buffer.physical_address() + testing::global_offset()) as *mut u16;
        let mut slot = controller.ports[port as usize].lock();
        let state = slot.as_mut().expect("port not set up");
        state.identify_object = Some(buffer.clone());
        state.identify_data = Some(mapped);
        (buffer, mapped)
    }

    static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);

    fn completion_handler(data: usize) {
        COMPLETIONS.fetch_add(data, Ordering::SeqCst);
    }

    #[test]
    fn capability_decoding() {
        let (ports, slots, supports_64bit, staggered) = decode_capabilities(0x8000_1F1F);
        assert_eq!(ports, 32);
        assert_eq!(slots, 32);
        assert!(supports_64bit);
        assert!(!staggered);

        let (ports, slots, supports_64bit, staggered) = decode_capabilities(0x0800_0300);
        assert_eq!(ports, 1);
        assert_eq!(slots, 4);
        assert!(!supports_64bit);
        assert!(staggered);
    }

    #[test]
    fn dma_structures_match_the_hardware_layout() {
        assert_eq!(core::mem::size_of::<CommandHeader>(), 32);
        assert_eq!(core::mem::size_of::<PrdtEntry>(), 16);
        assert_eq!(core::mem::size_of::<CommandFis>(), 20);
        assert_eq!(core::mem::offset_of!(CommandTable, prdt), 128);
        assert!(core::mem::size_of::<CommandTable>() <= PAGE_SIZE);
    }

    #[test]
    fn port_setup_programs_base_registers_and_seeds_slots() {
        let _guard = testing::lock_global_phys();
        let hba = FakeHba::new();
        let controller = test_controller(&hba);

        assert!(controller.setup_port_memory(0));

        let slot = controller.ports[0].lock();
        let port = slot.as_ref().expect("port missing");
        // Slots 4..32 are pre-marked busy, 0..4 free.
        assert_eq!(port.commands_in_use, !0xF);
        assert_eq!(port.sector_size, 512);

        let clb = hba.read(FakeHba::port_offset(0, PORT_CLB)) as u64
            | ((hba.read(FakeHba::port_offset(0, PORT_CLBU)) as u64) << 32);
        assert_eq!(clb, port._command_list_object.physical_address());
        let fb = hba.read(FakeHba::port_offset(0, PORT_FB)) as u64
            | ((hba.read(FakeHba::port_offset(0, PORT_FBU)) as u64) << 32);
        assert_eq!(fb, port._received_fis_object.physical_address());

        // Command headers point at their tables with the full PRDT window.
        for i in 0..4 {
            let header = unsafe { &*port.command_list.add(i) };
            assert_eq!(header.prdt_length, 128);
            let table = header.command_table_base as u64
                | ((header.command_table_base_upper as u64) << 32);
            assert_eq!(table, port._command_table_objects[i].physical_address());
        }
    }

    #[test]
    fn scenario_identify_reports_sector_count() {
        let _guard = testing::lock_global_phys();
        let mut hba = FakeHba::new();
        let controller = test_controller(&hba);
        assert!(controller.setup_port_memory(0));
        let (buffer, identify) = install_identify_buffer(&controller, 0);

        assert!(controller.issue_command(0, ATA_COMMAND_IDENTIFY, 1, 0, false, false, &buffer, None, 0));

        // The doorbell rang for slot 0 and the FIS asks for IDENTIFY.
        assert_eq!(hba.read(FakeHba::port_offset(0, PORT_CI)), 1);
        {
            let slot = controller.ports[0].lock();
            let port = slot.as_ref().unwrap();
            let fis = unsafe { &*(port.command_tables[0] as *const CommandTable) };
            assert_eq!(fis.command_fis[0], FIS_TYPE_REGISTER_H2D);
            assert_eq!(fis.command_fis[1], FIS_FLAG_COMMAND);
            assert_eq!(fis.command_fis[2], ATA_COMMAND_IDENTIFY);
            // Non-media command: LBA and counts stay zero.
            assert_eq!(fis.command_fis[7], 0);
            assert_eq!(fis.command_fis[12], 0);
        }

        // Simulated device: fill identify words 100..103, complete the
        // command, raise the port interrupt.
        let sectors: u64 = 0x0000_0001_2345_6789;
        unsafe {
            for i in 0..4 {
                core::ptr::write_volatile(
                    identify.add(100 + i),
                    (sectors >> (16 * i)) as u16,
                );
            }
        }
        hba.write(FakeHba::port_offset(0, PORT_CI), 0);
        hba.write(HBA_IS, 1);
        controller.handle_interrupt();

        assert_eq!(controller.sector_count(0), sectors);
        // The identify pass does not retire command slots.
        assert_eq!(controller.ports[0].lock().as_ref().unwrap().commands_in_use, !0xF | 1);
    }

    #[test]
    fn completion_fires_each_handler_exactly_once() {
        let _guard = testing::lock_global_phys();
        let mut hba = FakeHba::new();
        let controller = test_controller(&hba);
        assert!(controller.setup_port_memory(1));

        // Mark the port identified so the MSI path treats interrupts as
        // command completions.
        {
            let mut slot = controller.ports[1].lock();
            let port = slot.as_mut().unwrap();
            port.identified = true;
            port.sector_count = 1000;
            port.commands_in_use = !0xF;
        }

        let buffer = Arc::new(VmObject::memory_backed(
            2 * PAGE_SIZE,
            true,
            true,
            false,
            true,
            KERNEL_PID,
        ));

        COMPLETIONS.store(0, Ordering::SeqCst);
        for _ in 0..4 {
            assert!(controller.read_sectors(1, 16, 16, &buffer, completion_handler, 1));
        }
        // All four slots taken: the next request is refused.
        assert!(!controller.read_sectors(1, 16, 16, &buffer, completion_handler, 1));

        // Oversized transfers are refused up front.
        assert!(!controller.issue_command(
            1,
            ATA_COMMAND_READ_DMA_EXT,
            1025,
            0,
            true,
            false,
            &buffer,
            Some(completion_handler),
            1
        ));

        // The read FIS encodes the 48-bit LBA and sector count.
        {
            let slot = controller.ports[1].lock();
            let port = slot.as_ref().unwrap();
            let fis = unsafe { &*(port.command_tables[0] as *const CommandTable) };
            assert_eq!(fis.command_fis[2], ATA_COMMAND_READ_DMA_EXT);
            assert_eq!(fis.command_fis[4], 16);
            assert_eq!(fis.command_fis[7], 1 << 6);
            assert_eq!(fis.command_fis[12], 16);
            // Two PRDT entries, one page each, interrupt on completion.
            let entry = &fis.prdt[1];
            assert_eq!(entry.byte_count, (PAGE_SIZE as u32 - 1) | PRDT_INTERRUPT_ON_COMPLETION);
            assert_eq!(
                entry.data_base as u64 | ((entry.data_base_upper as u64) << 32),
                buffer.pages()[1]
            );
        }

        // Slots 1 and 3 complete; 0 and 2 stay in flight.
        hba.write(FakeHba::port_offset(1, PORT_CI), 0b0101);
        hba.write(HBA_IS, 1 << 1);
        controller.handle_interrupt();
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 2);
        {
            let slot = controller.ports[1].lock();
            let port = slot.as_ref().unwrap();
            assert_eq!(port.commands_in_use, !0xF | 0b0101);
            // High slots never become allocatable.
            assert_eq!(port.commands_in_use & !0xF, !0xF);
        }

        // A second interrupt with nothing newly completed fires nothing.
        hba.write(HBA_IS, 1 << 1);
        controller.handle_interrupt();
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 2);

        // The remaining two retire once their issue bits clear.
        hba.write(FakeHba::port_offset(1, PORT_CI), 0);
        hba.write(HBA_IS, 1 << 1);
        controller.handle_interrupt();
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 4);
        assert_eq!(
            controller.ports[1].lock().as_ref().unwrap().commands_in_use,
            !0xF
        );
    }
}
