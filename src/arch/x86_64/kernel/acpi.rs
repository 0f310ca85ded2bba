//! Minimal ACPI support: find the RSDP, walk the RSDT/XSDT and parse the
//! MADT for the Local APIC IDs of all enabled processors.

#![allow(dead_code)]

use core::{mem, ptr, slice, str};

use alloc::vec::Vec;

use hermit_sync::OnceCell;
use x86_64::PhysAddr;

use crate::arch::x86_64::mm::paging;
use crate::arch::x86_64::mm::paging::{BasePageSize, PageSize, PageTableEntryFlags};
use crate::config::MAX_CPUS;
use crate::env;
use crate::errors::KernelError;

/// The lower bound of the legacy BIOS range where the RSDP can be located.
const RSDP_SEARCH_ADDRESS_LOW: u64 = 0xE_0000;
/// The upper bound of the legacy BIOS range where the RSDP can be located.
const RSDP_SEARCH_ADDRESS_HIGH: u64 = 0xF_FFFF;
/// Length in bytes of the structure over which the basic (ACPI 1.0) checksum is calculated.
const RSDP_CHECKSUM_LENGTH: usize = 20;
/// Length in bytes of the structure over which the extended (ACPI 2.0+) checksum is calculated.
const RSDP_XCHECKSUM_LENGTH: usize = 36;

/// MADT record type of a Processor Local APIC entry.
const MADT_PROCESSOR_LOCAL_APIC: u8 = 0;
/// The "enabled" bit in the flags of a Processor Local APIC entry.
const CPU_FLAG_ENABLED: u32 = 1 << 0;

/// Local APIC IDs of all enabled processors, in MADT order.
static LOCAL_APIC_IDS: OnceCell<Vec<u8>> = OnceCell::new();
/// Physical address of the Local APIC MMIO window announced by the MADT.
static LOCAL_APIC_ADDRESS: OnceCell<PhysAddr> = OnceCell::new();

/// The "Root System Description Pointer" structure providing pointers to all other ACPI tables.
#[repr(C, packed)]
struct AcpiRsdp {
	signature: [u8; 8],
	checksum: u8,
	oem_id: [u8; 6],
	revision: u8,
	rsdt_physical_address: u32,
	length: u32,
	xsdt_physical_address: u64,
	extended_checksum: u8,
	reserved: [u8; 3],
}

impl AcpiRsdp {
	fn oem_id(&self) -> &str {
		str::from_utf8(&self.oem_id).unwrap_or("")
	}
}

/// The header of (almost) every ACPI table.
#[repr(C, packed)]
struct AcpiSdtHeader {
	signature: [u8; 4],
	length: u32,
	revision: u8,
	checksum: u8,
	oem_id: [u8; 6],
	oem_table_id: [u8; 8],
	oem_revision: u32,
	creator_id: u32,
	creator_revision: u32,
}

/// Verifies the checksum of an ACPI structure: the wrapping sum over all
/// covered bytes must be zero.
fn verify_checksum(bytes: &[u8]) -> Result<(), KernelError> {
	let checksum = bytes.iter().fold(0u8, |acc, x| acc.wrapping_add(*x));
	if checksum == 0 {
		Ok(())
	} else {
		Err(KernelError::AcpiChecksum)
	}
}

/// Identity-maps all pages touched by `[address, address + length)`.
fn map_physical(address: u64, length: usize) -> Result<(), KernelError> {
	let mut flags = PageTableEntryFlags::empty();
	flags.normal().read_only().execute_disable();

	let mut page = address & !(BasePageSize::SIZE - 1);
	while page < address + length as u64 {
		paging::identity_map_if_unmapped(PhysAddr::new(page), flags)?;
		page += BasePageSize::SIZE;
	}
	Ok(())
}

/// Maps an ACPI table and returns its bytes, scoped by the length field of
/// its header. The checksum is *not* verified here.
fn table_bytes(address: u64) -> Result<&'static [u8], KernelError> {
	// Make at least the header addressable, even when it crosses a page boundary.
	map_physical(address, mem::size_of::<AcpiSdtHeader>())?;

	let header = unsafe { &*(address as *const AcpiSdtHeader) };
	let length = header.length as usize;
	if length < mem::size_of::<AcpiSdtHeader>() || length > 0x10_0000 {
		return Err(KernelError::AcpiChecksum);
	}

	map_physical(address, length)?;
	Ok(unsafe { slice::from_raw_parts(address as *const u8, length) })
}

/// Looks for a valid RSDP signature in `window` and returns its offset.
/// `window` must start 16-byte aligned, as the candidates are scanned on
/// 16-byte boundaries.
fn find_rsdp(window: &[u8]) -> Option<usize> {
	for offset in (0..window.len().saturating_sub(RSDP_CHECKSUM_LENGTH)).step_by(16) {
		let candidate = &window[offset..];
		if candidate[..8] != *b"RSD PTR " {
			continue;
		}
		if verify_checksum(&candidate[..RSDP_CHECKSUM_LENGTH]).is_err() {
			continue;
		}

		// ACPI 2.0+ tables additionally carry an extended checksum.
		let revision = candidate[15];
		if revision >= 2
			&& (candidate.len() < RSDP_XCHECKSUM_LENGTH
				|| verify_checksum(&candidate[..RSDP_XCHECKSUM_LENGTH]).is_err())
		{
			continue;
		}

		return Some(offset);
	}

	None
}

/// Detects the RSDP, preferring the copy handed over by the loader and
/// falling back to scanning the legacy BIOS area.
fn detect_rsdp() -> Result<&'static AcpiRsdp, KernelError> {
	if let Some(address) = env::boot_info().rsdp_address {
		map_physical(address, mem::size_of::<AcpiRsdp>())?;
		let bytes = unsafe {
			slice::from_raw_parts(address as *const u8, mem::size_of::<AcpiRsdp>())
		};
		if bytes[..8] == *b"RSD PTR " {
			verify_checksum(&bytes[..RSDP_CHECKSUM_LENGTH])?;
			return Ok(unsafe { &*(address as *const AcpiRsdp) });
		}
	}

	let window_len = (RSDP_SEARCH_ADDRESS_HIGH - RSDP_SEARCH_ADDRESS_LOW) as usize;
	map_physical(RSDP_SEARCH_ADDRESS_LOW, window_len)?;
	let window =
		unsafe { slice::from_raw_parts(RSDP_SEARCH_ADDRESS_LOW as *const u8, window_len) };

	let offset = find_rsdp(window).ok_or(KernelError::AcpiMissing)?;
	Ok(unsafe { &*(window.as_ptr().add(offset) as *const AcpiRsdp) })
}

/// Walks the payload of the MADT: the `{local_apic_address, flags}` header
/// followed by `{type, length}` records. Returns the MMIO base and the
/// APIC IDs of all enabled processors, capped at `MAX_CPUS`.
fn parse_madt(table: &[u8]) -> Result<(u32, Vec<u8>), KernelError> {
	let payload = &table[mem::size_of::<AcpiSdtHeader>()..];
	if payload.len() < 8 {
		return Err(KernelError::AcpiMissing);
	}

	let local_apic_address = u32::from_le_bytes(payload[0..4].try_into().unwrap());
	let mut apic_ids = Vec::new();

	let mut offset = 8;
	while offset + 2 <= payload.len() {
		let entry_type = payload[offset];
		let length = payload[offset + 1] as usize;
		if length < 2 || offset + length > payload.len() {
			break;
		}

		if entry_type == MADT_PROCESSOR_LOCAL_APIC && length >= 8 {
			let apic_id = payload[offset + 3];
			let flags =
				u32::from_le_bytes(payload[offset + 4..offset + 8].try_into().unwrap());

			if flags & CPU_FLAG_ENABLED != 0 && apic_ids.len() < MAX_CPUS {
				apic_ids.push(apic_id);
			}
		}

		offset += length;
	}

	Ok((local_apic_address, apic_ids))
}

/// Locates the MADT and extracts the processor topology from it.
///
/// Failing checksums and missing tables are fatal; this function does not
/// touch the memory subsystem state beyond identity-mapping table pages.
pub fn init() -> Result<(), KernelError> {
	let rsdp = detect_rsdp()?;
	info!(
		"Found ACPI revision {} RSDP at {:p} with OEM ID \"{}\"",
		rsdp.revision,
		ptr::from_ref(rsdp),
		rsdp.oem_id()
	);

	// Depending on the revision, either the XSDT (64-bit entry pointers) or
	// the RSDT (32-bit entry pointers) is walked.
	let use_xsdt = rsdp.revision >= 2 && rsdp.xsdt_physical_address != 0;
	let rsdt_physical_address = if use_xsdt {
		rsdp.xsdt_physical_address
	} else {
		u64::from(rsdp.rsdt_physical_address)
	};

	let rsdt = table_bytes(rsdt_physical_address)?;
	verify_checksum(rsdt)?;

	let entry_size = if use_xsdt {
		mem::size_of::<u64>()
	} else {
		mem::size_of::<u32>()
	};
	let entries = &rsdt[mem::size_of::<AcpiSdtHeader>()..];

	for entry in entries.chunks_exact(entry_size) {
		let table_physical_address = if use_xsdt {
			u64::from_le_bytes(entry.try_into().unwrap())
		} else {
			u64::from(u32::from_le_bytes(entry.try_into().unwrap()))
		};
		if table_physical_address == 0 {
			continue;
		}

		let table = table_bytes(table_physical_address)?;
		debug!(
			"Found ACPI table: {}",
			str::from_utf8(&table[..4]).unwrap_or("????")
		);

		if table[..4] == *b"APIC" {
			// The "Multiple APIC Description Table" (MADT) aka "APIC Table".
			verify_checksum(table)?;

			let (local_apic_address, apic_ids) = parse_madt(table)?;
			info!(
				"MADT at {:#x}: Local APIC at {:#x}, {} enabled CPUs",
				table_physical_address,
				local_apic_address,
				apic_ids.len()
			);

			if apic_ids.is_empty() {
				return Err(KernelError::AcpiMissing);
			}
			LOCAL_APIC_ADDRESS
				.set(PhysAddr::new(u64::from(local_apic_address)))
				.ok();
			LOCAL_APIC_IDS.set(apic_ids).ok();
			return Ok(());
		}
	}

	Err(KernelError::AcpiMissing)
}

/// Local APIC IDs of all enabled CPUs, in the order the MADT lists them.
pub fn local_apic_ids() -> &'static [u8] {
	LOCAL_APIC_IDS
		.get()
		.expect("ACPI queried before init")
		.as_slice()
}

/// Physical address of the xAPIC MMIO window announced by the MADT.
pub fn madt_local_apic_base() -> PhysAddr {
	*LOCAL_APIC_ADDRESS.get().expect("ACPI queried before init")
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Builds an MADT with the given records and a valid checksum.
	fn build_madt(records: &[&[u8]]) -> Vec<u8> {
		let mut table = Vec::new();
		table.extend_from_slice(b"APIC");
		table.extend_from_slice(&0u32.to_le_bytes()); // length, patched below
		table.push(3); // revision
		table.push(0); // checksum, patched below
		table.extend_from_slice(b"EMBER ");
		table.extend_from_slice(b"EMBERTBL");
		table.extend_from_slice(&1u32.to_le_bytes());
		table.extend_from_slice(&1u32.to_le_bytes());
		table.extend_from_slice(&1u32.to_le_bytes());
		assert_eq!(table.len(), mem::size_of::<AcpiSdtHeader>());

		table.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
		table.extend_from_slice(&1u32.to_le_bytes());
		for record in records {
			table.extend_from_slice(record);
		}

		let length = table.len() as u32;
		table[4..8].copy_from_slice(&length.to_le_bytes());
		let sum = table.iter().fold(0u8, |acc, x| acc.wrapping_add(*x));
		table[9] = sum.wrapping_neg();
		table
	}

	fn lapic_record(apic_id: u8, enabled: bool) -> Vec<u8> {
		let mut record = vec![MADT_PROCESSOR_LOCAL_APIC, 8, apic_id];
		record.push(apic_id);
		record.extend_from_slice(&u32::to_le_bytes(enabled as u32));
		record
	}

	#[test]
	fn checksum_accepts_and_rejects() {
		let table = build_madt(&[]);
		assert!(verify_checksum(&table).is_ok());

		let mut mutated = table.clone();
		mutated[20] ^= 0x5A;
		assert_eq!(
			verify_checksum(&mutated).unwrap_err(),
			KernelError::AcpiChecksum
		);
	}

	#[test]
	fn madt_collects_enabled_cpus_in_order() {
		let ioapic = [1u8, 12, 0, 0, 0, 0, 0xC0, 0xFE, 0, 0, 0, 0];
		let table = build_madt(&[
			&lapic_record(0, true),
			&ioapic,
			&lapic_record(1, true),
			&lapic_record(2, false),
			&lapic_record(3, true),
		]);

		let (base, ids) = parse_madt(&table).unwrap();
		assert_eq!(base, 0xFEE0_0000);
		assert_eq!(ids, &[0, 1, 3]);
	}

	#[test]
	fn madt_caps_at_max_cpus() {
		let records: Vec<Vec<u8>> = (0..MAX_CPUS as u8 + 4)
			.map(|id| lapic_record(id, true))
			.collect();
		let refs: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();
		let table = build_madt(&refs);

		let (_, ids) = parse_madt(&table).unwrap();
		assert_eq!(ids.len(), MAX_CPUS);
	}

	#[test]
	fn truncated_records_do_not_overrun() {
		let mut table = build_madt(&[&lapic_record(0, true)]);
		// Claim a record that extends past the table end.
		table.push(MADT_PROCESSOR_LOCAL_APIC);
		table.push(32);
		let (_, ids) = parse_madt(&table).unwrap();
		assert_eq!(ids, &[0]);
	}

	#[test]
	fn rsdp_scan_finds_valid_candidate_only() {
		let mut window = vec![0u8; 4096];

		// A candidate with a broken checksum at offset 0.
		window[0..8].copy_from_slice(b"RSD PTR ");
		window[8] = 0x11;

		// A valid revision-0 candidate at offset 64.
		window[64..72].copy_from_slice(b"RSD PTR ");
		window[79] = 0; // revision
		let sum: u8 = window[64..64 + RSDP_CHECKSUM_LENGTH]
			.iter()
			.fold(0u8, |acc, x| acc.wrapping_add(*x));
		window[72] = sum.wrapping_neg(); // checksum field

		assert_eq!(find_rsdp(&window), Some(64));
	}

	#[test]
	fn rsdp_scan_rejects_everything_else() {
		let window = vec![0xABu8; 4096];
		assert_eq!(find_rsdp(&window), None);
	}
}
