//! ACPI table registry.
//!
//! Walks the XSDT (or a legacy RSDT with 32-bit entry pointers), validates
//! every table with the ACPI modular-sum checksum and indexes the survivors
//! by signature. Table *interpretation* lives with the consumers; this
//! module only hands out validated headers.

use alloc::vec::Vec;
use conquer_once::spin::OnceCell;

use crate::cpu::PAGING_BASE;

/// Header shared by every ACPI system description table.
#[repr(C)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

pub const SDT_HEADER_SIZE: usize = core::mem::size_of::<SdtHeader>();

/// ACPI generic address structure (unaligned u64, hence packed).
#[repr(C, packed)]
pub struct GenericAddress {
    pub address_space_id: u8,
    pub register_bit_width: u8,
    pub register_bit_offset: u8,
    pub reserved: u8,
    pub address: u64,
}

static TABLES: OnceCell<Vec<u64>> = OnceCell::uninit();

/// ACPI 8-bit modular sum over the whole table must be zero.
fn validate(table: *const SdtHeader) -> bool {
    unsafe {
        let length = (*table).length as usize;
        let bytes = core::slice::from_raw_parts(table as *const u8, length);
        bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
    }
}

/// Walk the root table at `root` (already virtually addressable), rebasing
/// each entry pointer by `phys_offset`. Returns the virtual addresses of
/// every table that passes validation.
fn walk_root(root: *const SdtHeader, phys_offset: u64) -> Vec<u64> {
    let mut tables = Vec::new();

    // An XSDT carries 64-bit entries; an RSDT ('R') 32-bit ones.
    let entry_size = unsafe {
        if (*root).signature[0] == b'X' {
            8
        } else {
            4
        }
    };
    let entry_count = (unsafe { (*root).length } as usize - SDT_HEADER_SIZE) / entry_size;
    let entries = unsafe { (root as *const u8).add(SDT_HEADER_SIZE) };

    for i in 0..entry_count {
        let table_phys = unsafe {
            if entry_size == 8 {
                (entries as *const u64).add(i).read_unaligned()
            } else {
                (entries as *const u32).add(i).read_unaligned() as u64
            }
        };
        let table = (table_phys + phys_offset) as *const SdtHeader;

        if !validate(table) {
            let signature = unsafe { (*table).signature };
            log::warn!(
                "[acpi] table {} failed checksum, skipping",
                core::str::from_utf8(&signature).unwrap_or("????")
            );
            continue;
        }

        let signature = unsafe { (*table).signature };
        log::info!(
            "[acpi]   - {} at {:#x}",
            core::str::from_utf8(&signature).unwrap_or("????"),
            table as u64
        );
        tables.push(table as u64);
    }

    tables
}

/// Locate and index the firmware tables. XSDT absence or corruption is
/// fatal: every later subsystem depends on the registry.
pub fn init() {
    let root_ptr = crate::boot::info().acpi_ptr;
    if root_ptr == PAGING_BASE {
        panic!("[acpi] boot protocol did not provide an ACPI root table");
    }

    let root = root_ptr as *const SdtHeader;
    if !validate(root) {
        panic!("[acpi] root table failed checksum validation");
    }

    let signature = unsafe { (*root).signature };
    log::info!(
        "[acpi] root table {} valid, walking entries...",
        core::str::from_utf8(&signature).unwrap_or("????")
    );

    let tables = walk_root(root, PAGING_BASE);
    if tables.is_empty() {
        log::warn!("[acpi] no valid tables found");
    }
    TABLES.init_once(|| tables);
}

/// Validated table with the given signature, if the firmware provides one.
pub fn table_by_signature(signature: &[u8; 4]) -> Option<&'static SdtHeader> {
    let tables = TABLES.try_get().expect("ACPI not initialized");
    for &table in tables.iter() {
        let header = unsafe { &*(table as *const SdtHeader) };
        if &header.signature == signature {
            return Some(header);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix_checksum(table: &mut [u8]) {
        table[9] = 0;
        let sum = table.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        table[9] = 0u8.wrapping_sub(sum);
    }

    fn make_table(signature: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let length = SDT_HEADER_SIZE + payload.len();
        let mut bytes = std::vec![0u8; length];
        bytes[0..4].copy_from_slice(signature);
        bytes[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        bytes[SDT_HEADER_SIZE..].copy_from_slice(payload);
        fix_checksum(&mut bytes);
        bytes
    }

    #[test]
    fn validates_modular_sum() {
        let table = make_table(b"APIC", &[1, 2, 3, 4]);
        assert!(validate(table.as_ptr() as *const SdtHeader));

        let mut corrupted = table.clone();
        corrupted[SDT_HEADER_SIZE] ^= 0xFF;
        assert!(!validate(corrupted.as_ptr() as *const SdtHeader));
    }

    #[test]
    fn xsdt_walk_skips_invalid_tables() {
        let good = make_table(b"HPET", &[0; 20]);
        let mut bad = make_table(b"MCFG", &[0; 20]);
        bad[10] ^= 0x55; // break the OEM id without fixing the checksum

        // Entries hold fake physical addresses; offset 0 keeps them virtual.
        let mut pointers = std::vec::Vec::new();
        pointers.extend_from_slice(&(good.as_ptr() as u64).to_le_bytes());
        pointers.extend_from_slice(&(bad.as_ptr() as u64).to_le_bytes());
        let xsdt = make_table(b"XSDT", &pointers);

        let tables = walk_root(xsdt.as_ptr() as *const SdtHeader, 0);
        assert_eq!(tables, std::vec![good.as_ptr() as u64]);
    }

    #[test]
    fn rsdt_walk_uses_32_bit_entries() {
        // 32-bit pointers only work when the table sits in low memory, so
        // route through an offset: entry = table_address - offset.
        let good = make_table(b"APIC", &[0; 8]);
        let address = good.as_ptr() as u64;
        let offset = address - 0x1000;
        let mut pointers = std::vec::Vec::new();
        pointers.extend_from_slice(&0x1000u32.to_le_bytes());
        let rsdt = make_table(b"RSDT", &pointers);

        let tables = walk_root(rsdt.as_ptr() as *const SdtHeader, offset);
        assert_eq!(tables, std::vec![address]);
    }
}
