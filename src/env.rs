//! Access to the boot information handed over by the loader.
//!
//! The loader passes the physical address of a Multiboot2-style blob:
//! a `{total_size, reserved}` header followed by 8-byte-aligned tags of the
//! shape `{type, size, payload}`, terminated by a tag of type 0. The kernel
//! consumes the memory map (type 6) and, when present, a copy of the ACPI
//! RSDP (types 14 and 15).

use core::{ptr, slice};

use align_address::Align;
use hermit_sync::OnceCell;

use crate::config::MAX_MEMORY_MAP_ENTRIES;
use crate::errors::KernelError;

const TAG_TYPE_END: u32 = 0;
const TAG_TYPE_MEMORY_MAP: u32 = 6;
const TAG_TYPE_ACPI_OLD_RSDP: u32 = 14;
const TAG_TYPE_ACPI_NEW_RSDP: u32 = 15;

/// Classification of a record in the loader's memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
	Available,
	Reserved,
	AcpiReclaimable,
	AcpiNvs,
	BadRam,
}

impl From<u32> for MemoryKind {
	fn from(value: u32) -> Self {
		match value {
			1 => MemoryKind::Available,
			3 => MemoryKind::AcpiReclaimable,
			4 => MemoryKind::AcpiNvs,
			5 => MemoryKind::BadRam,
			// Unknown kinds must never be handed to the frame allocator.
			_ => MemoryKind::Reserved,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
	pub base: u64,
	pub length: u64,
	pub kind: MemoryKind,
}

impl MemoryRegion {
	const EMPTY: MemoryRegion = MemoryRegion {
		base: 0,
		length: 0,
		kind: MemoryKind::Reserved,
	};
}

/// Everything the kernel keeps from the loader hand-over.
#[derive(Debug)]
pub struct BootInfo {
	regions: [MemoryRegion; MAX_MEMORY_MAP_ENTRIES],
	region_count: usize,
	pub rsdp_address: Option<u64>,
	pub boot_info_start: u64,
	pub boot_info_end: u64,
	pub kernel_start: u64,
	pub kernel_end: u64,
}

impl BootInfo {
	pub fn memory_map(&self) -> &[MemoryRegion] {
		&self.regions[..self.region_count]
	}
}

static BOOT_INFO: OnceCell<BootInfo> = OnceCell::new();

pub fn boot_info() -> &'static BootInfo {
	BOOT_INFO
		.get()
		.expect("boot information queried before env::init")
}

/// Parses the boot information blob at the given physical address.
///
/// The low physical memory holding the blob is reachable through the
/// identity mapping prepared by the loader.
pub fn init(boot_info_address: u64) -> Result<(), KernelError> {
	if boot_info_address == 0 || boot_info_address % 8 != 0 {
		return Err(KernelError::BootInfoMalformed);
	}

	let total_size = unsafe { ptr::read(boot_info_address as *const u32) } as usize;
	if !(16..=1024 * 1024).contains(&total_size) {
		return Err(KernelError::BootInfoMalformed);
	}

	let blob = unsafe { slice::from_raw_parts(boot_info_address as *const u8, total_size) };
	let mut info = parse_boot_blob(blob, boot_info_address)?;

	let (kernel_start, kernel_end) = kernel_image_range();
	info.kernel_start = kernel_start;
	info.kernel_end = kernel_end;

	info!(
		"Boot info at {:#x} ({} bytes), {} memory map records",
		boot_info_address,
		total_size,
		info.region_count
	);
	for region in info.memory_map() {
		debug!(
			"Memory map: [{:#012x} - {:#012x}] {:?}",
			region.base,
			region.base + region.length,
			region.kind
		);
	}

	BOOT_INFO
		.set(info)
		.map_err(|_| KernelError::BootInfoMalformed)
}

/// Walks the tag list of the blob. Pure over the byte slice so that it can
/// be exercised with synthetic blobs.
fn parse_boot_blob(blob: &[u8], base_address: u64) -> Result<BootInfo, KernelError> {
	let mut info = BootInfo {
		regions: [MemoryRegion::EMPTY; MAX_MEMORY_MAP_ENTRIES],
		region_count: 0,
		rsdp_address: None,
		boot_info_start: base_address,
		boot_info_end: base_address + blob.len() as u64,
		kernel_start: 0,
		kernel_end: 0,
	};
	let mut found_memory_map = false;

	// The first tag sits right behind the {total_size, reserved} header.
	let mut offset = 8;
	while offset + 8 <= blob.len() {
		let tag_type = read_u32(blob, offset).ok_or(KernelError::BootInfoMalformed)?;
		let tag_size = read_u32(blob, offset + 4).ok_or(KernelError::BootInfoMalformed)? as usize;
		if tag_type == TAG_TYPE_END {
			break;
		}
		if tag_size < 8 || offset + tag_size > blob.len() {
			return Err(KernelError::BootInfoMalformed);
		}

		match tag_type {
			TAG_TYPE_MEMORY_MAP => {
				parse_memory_map(&blob[offset + 8..offset + tag_size], &mut info)?;
				found_memory_map = true;
			}
			TAG_TYPE_ACPI_OLD_RSDP | TAG_TYPE_ACPI_NEW_RSDP => {
				// The payload is a verbatim copy of the RSDP structure.
				info.rsdp_address = Some(base_address + offset as u64 + 8);
			}
			_ => {
				// All other tags are of no interest to the bring-up core.
			}
		}

		offset += tag_size.align_up(8usize);
	}

	if found_memory_map && info.region_count > 0 {
		Ok(info)
	} else {
		Err(KernelError::BootInfoMalformed)
	}
}

fn parse_memory_map(payload: &[u8], info: &mut BootInfo) -> Result<(), KernelError> {
	if payload.len() < 8 {
		return Err(KernelError::BootInfoMalformed);
	}
	let entry_size = read_u32(payload, 0).ok_or(KernelError::BootInfoMalformed)? as usize;
	if entry_size < 24 {
		return Err(KernelError::BootInfoMalformed);
	}

	let mut offset = 8;
	while offset + entry_size <= payload.len() {
		if info.region_count == MAX_MEMORY_MAP_ENTRIES {
			break;
		}

		let base = read_u64(payload, offset).ok_or(KernelError::BootInfoMalformed)?;
		let length = read_u64(payload, offset + 8).ok_or(KernelError::BootInfoMalformed)?;
		let kind = read_u32(payload, offset + 16).ok_or(KernelError::BootInfoMalformed)?;

		if length > 0 {
			info.regions[info.region_count] = MemoryRegion {
				base,
				length,
				kind: MemoryKind::from(kind),
			};
			info.region_count += 1;
		}

		offset += entry_size;
	}

	Ok(())
}

fn read_u32(buffer: &[u8], offset: usize) -> Option<u32> {
	let bytes = buffer.get(offset..offset + 4)?;
	Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buffer: &[u8], offset: usize) -> Option<u64> {
	let bytes = buffer.get(offset..offset + 8)?;
	Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}

#[cfg(target_os = "none")]
extern "C" {
	static __kernel_start: u8;
	static __kernel_end: u8;
}

/// Bounds of the kernel image as placed by the loader.
#[cfg(target_os = "none")]
fn kernel_image_range() -> (u64, u64) {
	unsafe {
		(
			ptr::addr_of!(__kernel_start) as u64,
			ptr::addr_of!(__kernel_end) as u64,
		)
	}
}

#[cfg(not(target_os = "none"))]
fn kernel_image_range() -> (u64, u64) {
	(0x10_0000, 0x40_0000)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn push_u32(blob: &mut Vec<u8>, value: u32) {
		blob.extend_from_slice(&value.to_le_bytes());
	}

	fn push_u64(blob: &mut Vec<u8>, value: u64) {
		blob.extend_from_slice(&value.to_le_bytes());
	}

	fn build_blob(regions: &[(u64, u64, u32)]) -> Vec<u8> {
		let mut blob = Vec::new();
		push_u32(&mut blob, 0); // total_size, patched below
		push_u32(&mut blob, 0); // reserved

		// Memory map tag.
		let tag_size = 16 + regions.len() * 24;
		push_u32(&mut blob, 6);
		push_u32(&mut blob, tag_size as u32);
		push_u32(&mut blob, 24); // entry_size
		push_u32(&mut blob, 0); // entry_version
		for &(base, length, kind) in regions {
			push_u64(&mut blob, base);
			push_u64(&mut blob, length);
			push_u32(&mut blob, kind);
			push_u32(&mut blob, 0);
		}
		while blob.len() % 8 != 0 {
			blob.push(0);
		}

		// End tag.
		push_u32(&mut blob, 0);
		push_u32(&mut blob, 8);

		let total = blob.len() as u32;
		blob[0..4].copy_from_slice(&total.to_le_bytes());
		blob
	}

	#[test]
	fn parses_memory_map() {
		let blob = build_blob(&[
			(0x0, 0x9F000, 1),
			(0x100000, 0x3F00000, 1),
			(0xF0000, 0x10000, 2),
		]);
		let info = parse_boot_blob(&blob, 0x1_0000).unwrap();

		assert_eq!(info.memory_map().len(), 3);
		assert_eq!(info.memory_map()[1].base, 0x100000);
		assert_eq!(info.memory_map()[1].length, 0x3F00000);
		assert_eq!(info.memory_map()[1].kind, MemoryKind::Available);
		assert_eq!(info.memory_map()[2].kind, MemoryKind::Reserved);
		assert_eq!(info.boot_info_end - info.boot_info_start, blob.len() as u64);
	}

	#[test]
	fn missing_memory_map_is_malformed() {
		let mut blob = Vec::new();
		push_u32(&mut blob, 16);
		push_u32(&mut blob, 0);
		push_u32(&mut blob, 0);
		push_u32(&mut blob, 8);

		assert_eq!(
			parse_boot_blob(&blob, 0x1_0000).unwrap_err(),
			KernelError::BootInfoMalformed
		);
	}

	#[test]
	fn unknown_kinds_are_reserved() {
		let blob = build_blob(&[(0x100000, 0x1000, 7)]);
		let info = parse_boot_blob(&blob, 0).unwrap();
		assert_eq!(info.memory_map()[0].kind, MemoryKind::Reserved);
	}

	#[test]
	fn rsdp_tag_is_picked_up() {
		let mut blob = build_blob(&[(0x100000, 0x1000, 1)]);
		// Strip the end tag, append an ACPI tag and a fresh end tag.
		blob.truncate(blob.len() - 8);
		let rsdp_tag_offset = blob.len();
		push_u32(&mut blob, 15);
		push_u32(&mut blob, 8 + 36);
		blob.extend_from_slice(&[0u8; 36]);
		while blob.len() % 8 != 0 {
			blob.push(0);
		}
		push_u32(&mut blob, 0);
		push_u32(&mut blob, 8);
		let total = blob.len() as u32;
		blob[0..4].copy_from_slice(&total.to_le_bytes());

		let info = parse_boot_blob(&blob, 0x8000).unwrap();
		assert_eq!(
			info.rsdp_address,
			Some(0x8000 + rsdp_tag_offset as u64 + 8)
		);
	}
}
