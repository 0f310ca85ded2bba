//! Virtual memory management on top of 4-level paging.
//!
//! The last PML4 entry points back at the PML4 itself (recursive self-map),
//! so every page table of the current address space is reachable through an
//! ordinary virtual address and walks never need temporary mappings. The
//! recursive entry is installed once by [`init`] and never changes.

#![allow(dead_code)]

use core::ptr;

use x86_64::instructions::tlb;
use x86_64::registers::control::Cr3;
use x86_64::{PhysAddr, VirtAddr};

use crate::arch::x86_64::kernel::processor;
use crate::arch::x86_64::mm::physicalmem;
use crate::errors::KernelError;

/// Number of offset bits of a 4 KiB page.
const PAGE_BITS: u64 = 12;

/// Number of bits of the index into each table (PML4, PDPT, PD, PT).
const PAGE_MAP_BITS: u64 = 9;

/// A mask where PAGE_MAP_BITS are set to calculate a table index.
const PAGE_MAP_MASK: u64 = 0x1FF;

/// The PML4 slot holding the recursive self-reference.
pub const RECURSIVE_INDEX: u64 = 511;

/// Sign-extension bits of every address formed through the recursive slot.
const RECURSIVE_BASE: u64 = 0xFFFF_0000_0000_0000;

/// Mask of the physical address stored in a page table entry.
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
	/// Possible flags for an entry in either table (PML4, PDPT, PD, PT)
	///
	/// See Intel Vol. 3A, Tables 4-14 through 4-19
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PageTableEntryFlags: u64 {
		/// Set if this entry is valid and points to a page or table.
		const PRESENT = 1 << 0;

		/// Set if memory referenced by this entry shall be writable.
		const WRITABLE = 1 << 1;

		/// Set if memory referenced by this entry shall be accessible from user-mode (Ring 3).
		const USER_ACCESSIBLE = 1 << 2;

		/// Set if Write-Through caching shall be enabled for memory referenced by this entry.
		/// Otherwise, Write-Back caching is used.
		const WRITE_THROUGH = 1 << 3;

		/// Set if caching shall be disabled for memory referenced by this entry.
		const CACHE_DISABLE = 1 << 4;

		/// Set if software has accessed this entry (for memory access or address translation).
		const ACCESSED = 1 << 5;

		/// Only for page entries: Set if software has written to the memory referenced by this entry.
		const DIRTY = 1 << 6;

		/// Only for page entries in PDPT or PD: Set if this entry references a 1 GiB or 2 MiB page.
		const HUGE_PAGE = 1 << 7;

		/// Only for page entries: Set if this address translation is global for all tasks and does not need to
		/// be flushed from the TLB when CR3 is reset.
		const GLOBAL = 1 << 8;

		/// Set if code execution shall be disabled for memory referenced by this entry.
		const EXECUTE_DISABLE = 1 << 63;
	}
}

impl PageTableEntryFlags {
	pub fn device(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::CACHE_DISABLE);
		self
	}

	pub fn normal(&mut self) -> &mut Self {
		self.remove(PageTableEntryFlags::CACHE_DISABLE);
		self
	}

	pub fn read_only(&mut self) -> &mut Self {
		self.remove(PageTableEntryFlags::WRITABLE);
		self
	}

	pub fn writable(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::WRITABLE);
		self
	}

	pub fn execute_disable(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::EXECUTE_DISABLE);
		self
	}
}

/// An entry in either table (PML4, PDPT, PD, PT)
#[derive(Clone, Copy)]
pub struct PageTableEntry {
	/// Physical memory address this entry refers, combined with flags from PageTableEntryFlags.
	physical_address_and_flags: u64,
}

impl PageTableEntry {
	/// Return the stored physical address.
	pub fn address(self) -> PhysAddr {
		PhysAddr::new(self.physical_address_and_flags & ADDRESS_MASK)
	}

	pub fn flags(self) -> PageTableEntryFlags {
		PageTableEntryFlags::from_bits_truncate(self.physical_address_and_flags & !ADDRESS_MASK)
	}

	/// Returns whether this entry is valid (present).
	pub fn is_present(self) -> bool {
		self.physical_address_and_flags & PageTableEntryFlags::PRESENT.bits() != 0
	}

	/// Returns `true` if the entry references a huge (2 MiB or 1 GiB) page.
	pub fn is_huge(self) -> bool {
		self.physical_address_and_flags & PageTableEntryFlags::HUGE_PAGE.bits() != 0
	}

	/// Mark this as a valid (present) entry and set address translation and flags.
	///
	/// # Arguments
	///
	/// * `physical_address` - The physical memory address this entry shall translate to
	/// * `flags` - Flags from PageTableEntryFlags (note that the PRESENT and ACCESSED flags are set automatically)
	pub fn set(&mut self, physical_address: PhysAddr, flags: PageTableEntryFlags) {
		assert_eq!(
			physical_address.as_u64() % BasePageSize::SIZE,
			0,
			"Physical address is not on a 4 KiB page boundary (physical_address = {physical_address:p})"
		);
		assert_eq!(
			physical_address.as_u64() >> processor::get_physical_address_bits(),
			0,
			"Physical address exceeds CPU's physical address width (physical_address = {physical_address:p})"
		);

		let mut flags_to_set = flags;
		flags_to_set.insert(PageTableEntryFlags::PRESENT);
		flags_to_set.insert(PageTableEntryFlags::ACCESSED);
		self.physical_address_and_flags = physical_address.as_u64() | flags_to_set.bits();
	}

	pub fn clear(&mut self) {
		self.physical_address_and_flags = 0;
	}
}

/// A generic interface to support both page sizes encountered during walks.
pub trait PageSize: Copy {
	/// The page size in bytes.
	const SIZE: u64;
}

/// A 4 KiB page mapped in the PT.
#[derive(Clone, Copy)]
pub enum BasePageSize {}
impl PageSize for BasePageSize {
	const SIZE: u64 = 4096;
}

/// A 2 MiB page mapped in the PD.
#[derive(Clone, Copy)]
pub enum LargePageSize {}
impl PageSize for LargePageSize {
	const SIZE: u64 = 2 * 1024 * 1024;
}

/// A 1 GiB page mapped in the PDPT.
#[derive(Clone, Copy)]
pub enum HugePageSize {}
impl PageSize for HugePageSize {
	const SIZE: u64 = 1024 * 1024 * 1024;
}

/// Representation of any page table (PML4, PDPT, PD, PT) in memory.
#[repr(C, align(4096))]
pub struct PageTable {
	/// Each page table has 512 entries (can be calculated using PAGE_MAP_BITS).
	pub entries: [PageTableEntry; 1 << PAGE_MAP_BITS],
}

/// Decomposes a canonical virtual address into its four table indices.
const fn table_indices(address: u64) -> (u64, u64, u64, u64) {
	(
		(address >> (PAGE_BITS + 3 * PAGE_MAP_BITS)) & PAGE_MAP_MASK,
		(address >> (PAGE_BITS + 2 * PAGE_MAP_BITS)) & PAGE_MAP_MASK,
		(address >> (PAGE_BITS + PAGE_MAP_BITS)) & PAGE_MAP_MASK,
		(address >> PAGE_BITS) & PAGE_MAP_MASK,
	)
}

/// Virtual address of the PML4 through the recursive slot: all four indices
/// select the recursive entry.
const fn pml4_address() -> u64 {
	RECURSIVE_BASE
		| (RECURSIVE_INDEX << 39)
		| (RECURSIVE_INDEX << 30)
		| (RECURSIVE_INDEX << 21)
		| (RECURSIVE_INDEX << 12)
}

/// Virtual address of the PDPT serving `PML4[pml4_index]`.
const fn pdpt_address(pml4_index: u64) -> u64 {
	RECURSIVE_BASE
		| (RECURSIVE_INDEX << 39)
		| (RECURSIVE_INDEX << 30)
		| (RECURSIVE_INDEX << 21)
		| (pml4_index << 12)
}

/// Virtual address of the PD serving `PDPT[pdpt_index]` below `PML4[pml4_index]`.
const fn pd_address(pml4_index: u64, pdpt_index: u64) -> u64 {
	RECURSIVE_BASE
		| (RECURSIVE_INDEX << 39)
		| (RECURSIVE_INDEX << 30)
		| (pml4_index << 21)
		| (pdpt_index << 12)
}

/// Virtual address of the PT mapping the given 2 MiB slot.
const fn pt_address(pml4_index: u64, pdpt_index: u64, pd_index: u64) -> u64 {
	RECURSIVE_BASE
		| (RECURSIVE_INDEX << 39)
		| (pml4_index << 30)
		| (pdpt_index << 21)
		| (pd_index << 12)
}

/// Turns a recursive alias address into a table reference.
///
/// # Safety
///
/// The alias must resolve, i.e. all parent entries on the path must be
/// present. Callers check presence level by level while walking down.
unsafe fn table<'a>(alias_address: u64) -> &'a mut PageTable {
	unsafe { &mut *(alias_address as *mut PageTable) }
}

/// Installs the recursive self-map and reloads CR3.
///
/// The one-time write goes through the loader's identity mapping of the
/// PML4 frame; every later page table access uses the recursive alias.
pub fn init() {
	let (frame, cr3_flags) = Cr3::read();
	let pml4_physical_address = frame.start_address();

	let pml4 = unsafe { &mut *(pml4_physical_address.as_u64() as *mut PageTable) };
	let mut flags = PageTableEntryFlags::empty();
	flags.writable();
	pml4.entries[RECURSIVE_INDEX as usize].set(pml4_physical_address, flags);

	// Reload CR3 to drop every stale translation in one go.
	unsafe {
		Cr3::write(frame, cr3_flags);
	}

	debug!(
		"Recursive page table alias installed, PML4 at {:p}",
		pml4_physical_address
	);
}

/// Checks that PML4[511], read through the recursive alias, still points at
/// the PML4 frame with Present|Writable flags.
#[cfg(target_os = "none")]
pub fn recursive_self_map_is_intact() -> bool {
	let (frame, _) = Cr3::read();
	let entry = unsafe { table(pml4_address()) }.entries[RECURSIVE_INDEX as usize];

	entry.address() == frame.start_address()
		&& entry
			.flags()
			.contains(PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE)
}

/// Makes sure `entry` points at a zeroed subtable, allocating a frame on
/// demand. The fresh table can only be zeroed through the recursive alias
/// *after* the parent entry has been installed, which is why the entry is
/// published first and the new table wiped right behind it.
fn ensure_subtable(entry: &mut PageTableEntry, subtable_address: u64) -> Result<(), KernelError> {
	assert!(
		!entry.is_huge(),
		"Trying to walk below a huge mapping at alias {subtable_address:#x}"
	);

	if !entry.is_present() {
		let frame = physicalmem::allocate()?;
		let mut flags = PageTableEntryFlags::empty();
		flags.writable();
		entry.set(frame, flags);

		// The alias address may still have a stale (non-present) translation cached.
		tlb::flush(VirtAddr::new(subtable_address));
		unsafe {
			ptr::write_bytes(subtable_address as *mut u8, 0, BasePageSize::SIZE as usize);
		}
	}

	Ok(())
}

/// Maps a single 4 KiB page. Missing intermediate tables are allocated from
/// the frame allocator; the affected page is flushed from this CPU's TLB.
pub fn map_page(page: VirtAddr, frame: PhysAddr, flags: PageTableEntryFlags) -> Result<(), KernelError> {
	let (pml4_index, pdpt_index, pd_index, pt_index) = table_indices(page.as_u64());
	assert_ne!(
		pml4_index, RECURSIVE_INDEX,
		"The recursive slot must never be remapped"
	);

	let pml4 = unsafe { table(pml4_address()) };
	ensure_subtable(
		&mut pml4.entries[pml4_index as usize],
		pdpt_address(pml4_index),
	)?;

	let pdpt = unsafe { table(pdpt_address(pml4_index)) };
	ensure_subtable(
		&mut pdpt.entries[pdpt_index as usize],
		pd_address(pml4_index, pdpt_index),
	)?;

	let pd = unsafe { table(pd_address(pml4_index, pdpt_index)) };
	ensure_subtable(
		&mut pd.entries[pd_index as usize],
		pt_address(pml4_index, pdpt_index, pd_index),
	)?;

	let pt = unsafe { table(pt_address(pml4_index, pdpt_index, pd_index)) };
	pt.entries[pt_index as usize].set(frame, flags);
	tlb::flush(page);

	Ok(())
}

/// Removes the 4 KiB mapping of the given page if one exists.
/// Intermediate tables are never reclaimed by the bring-up core.
pub fn unmap_page(page: VirtAddr) {
	let (pml4_index, pdpt_index, pd_index, pt_index) = table_indices(page.as_u64());

	let pml4 = unsafe { table(pml4_address()) };
	if !pml4.entries[pml4_index as usize].is_present() {
		return;
	}
	let pdpt = unsafe { table(pdpt_address(pml4_index)) };
	if !pdpt.entries[pdpt_index as usize].is_present() {
		return;
	}
	let pd = unsafe { table(pd_address(pml4_index, pdpt_index)) };
	let pd_entry = pd.entries[pd_index as usize];
	if !pd_entry.is_present() || pd_entry.is_huge() {
		return;
	}

	let pt = unsafe { table(pt_address(pml4_index, pdpt_index, pd_index)) };
	pt.entries[pt_index as usize].clear();
	tlb::flush(page);
}

/// Translate a virtual memory address to a physical one through the
/// recursive alias, honoring huge mappings on the way down.
pub fn virt_to_phys(address: VirtAddr) -> Option<PhysAddr> {
	let (pml4_index, pdpt_index, pd_index, pt_index) = table_indices(address.as_u64());

	let pml4 = unsafe { table(pml4_address()) };
	if !pml4.entries[pml4_index as usize].is_present() {
		return None;
	}

	let pdpt = unsafe { table(pdpt_address(pml4_index)) };
	let pdpt_entry = pdpt.entries[pdpt_index as usize];
	if !pdpt_entry.is_present() {
		return None;
	}
	if pdpt_entry.is_huge() {
		let offset = address.as_u64() & (HugePageSize::SIZE - 1);
		return Some(pdpt_entry.address() + offset);
	}

	let pd = unsafe { table(pd_address(pml4_index, pdpt_index)) };
	let pd_entry = pd.entries[pd_index as usize];
	if !pd_entry.is_present() {
		return None;
	}
	if pd_entry.is_huge() {
		let offset = address.as_u64() & (LargePageSize::SIZE - 1);
		return Some(pd_entry.address() + offset);
	}

	let pt = unsafe { table(pt_address(pml4_index, pdpt_index, pd_index)) };
	let pt_entry = pt.entries[pt_index as usize];
	if !pt_entry.is_present() {
		return None;
	}

	let offset = address.as_u64() & (BasePageSize::SIZE - 1);
	Some(pt_entry.address() + offset)
}

/// Maps one page at its own physical address.
pub fn identity_map(frame: PhysAddr, flags: PageTableEntryFlags) -> Result<(), KernelError> {
	map_page(VirtAddr::new(frame.as_u64()), frame, flags)
}

/// Identity-maps one page unless the address already translates, e.g.
/// because the loader covers it with one of its own (possibly huge) pages.
pub fn identity_map_if_unmapped(
	frame: PhysAddr,
	flags: PageTableEntryFlags,
) -> Result<(), KernelError> {
	if virt_to_phys(VirtAddr::new(frame.as_u64())).is_none() {
		identity_map(frame, flags)
	} else {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recursive_alias_addresses() {
		assert_eq!(pml4_address(), 0xFFFF_FFFF_FFFF_F000);
		assert_eq!(pdpt_address(0), 0xFFFF_FFFF_FFE0_0000);
		assert_eq!(pd_address(0, 0), 0xFFFF_FFFF_C000_0000);
		assert_eq!(pt_address(0, 0, 0), 0xFFFF_FF80_0000_0000);

		// The alias of the PDPT of slot i advances one page per slot.
		assert_eq!(pdpt_address(1) - pdpt_address(0), 4096);
		// The PML4 itself is the PDPT alias of the recursive slot.
		assert_eq!(pdpt_address(RECURSIVE_INDEX), pml4_address());
	}

	#[test]
	fn index_decomposition() {
		assert_eq!(table_indices(0), (0, 0, 0, 0));
		assert_eq!(table_indices(0xFFFF_FFFF_FFFF_F000), (511, 511, 511, 511));

		// 0x8000 lives in the second slot of the first PT.
		assert_eq!(table_indices(0x8000), (0, 0, 0, 8));

		let address = (3 << 39) | (7 << 30) | (1 << 21) | (9 << 12);
		assert_eq!(table_indices(address), (3, 7, 1, 9));
	}

	#[test]
	fn alias_matches_decomposition() {
		// Walking the alias of a table and decomposing it again yields the
		// recursive index at the top level.
		let (pml4_index, ..) = table_indices(pml4_address());
		assert_eq!(pml4_index, RECURSIVE_INDEX);

		let (top, second, ..) = table_indices(pd_address(3, 5));
		assert_eq!(top, RECURSIVE_INDEX);
		assert_eq!(second, RECURSIVE_INDEX);
	}

	#[test]
	fn entry_roundtrip() {
		let mut entry = PageTableEntry {
			physical_address_and_flags: 0,
		};
		let mut flags = PageTableEntryFlags::empty();
		flags.writable().execute_disable();

		entry.set(PhysAddr::new(0x23_4000), flags);
		assert!(entry.is_present());
		assert!(!entry.is_huge());
		assert_eq!(entry.address(), PhysAddr::new(0x23_4000));
		assert!(entry.flags().contains(
			PageTableEntryFlags::PRESENT
				| PageTableEntryFlags::WRITABLE
				| PageTableEntryFlags::ACCESSED
				| PageTableEntryFlags::EXECUTE_DISABLE
		));

		entry.clear();
		assert!(!entry.is_present());
	}

	#[test]
	#[should_panic]
	fn unaligned_addresses_are_rejected() {
		let mut entry = PageTableEntry {
			physical_address_and_flags: 0,
		};
		entry.set(PhysAddr::new(0x1234), PageTableEntryFlags::empty());
	}
}
