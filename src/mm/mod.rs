pub mod allocator;

use align_address::Align;
use x86_64::{PhysAddr, VirtAddr};

use crate::arch::x86_64::mm::paging;
use crate::arch::x86_64::mm::paging::{BasePageSize, PageSize, PageTableEntryFlags};
use crate::arch::x86_64::mm::physicalmem;
use crate::config::KERNEL_HEAP_SIZE;
use crate::errors::KernelError;

/// Brings up the whole memory subsystem: the physical frame bitmap, the
/// recursive page-table alias, and the kernel heap window placed right
/// behind the bitmap.
pub fn init() -> Result<(), KernelError> {
	physicalmem::init()?;
	paging::init();

	let (_, bitmap_end) = physicalmem::bitmap_range();
	let heap_start = bitmap_end.align_up(BasePageSize::SIZE);
	let managed_end = physicalmem::total_pages() as u64 * BasePageSize::SIZE;
	if heap_start + KERNEL_HEAP_SIZE as u64 > managed_end {
		return Err(KernelError::OutOfMemory);
	}

	physicalmem::mark_region_used(PhysAddr::new(heap_start), KERNEL_HEAP_SIZE);

	// Back the window by an identity mapping. Pages the loader has already
	// identity-mapped (possibly through huge pages) are left untouched.
	let mut flags = PageTableEntryFlags::empty();
	flags.normal().writable().execute_disable();
	let mut address = heap_start;
	while address < heap_start + KERNEL_HEAP_SIZE as u64 {
		if paging::virt_to_phys(VirtAddr::new(address)).is_none() {
			paging::map_page(VirtAddr::new(address), PhysAddr::new(address), flags)?;
		}
		address += BasePageSize::SIZE;
	}

	allocator::init(VirtAddr::new(heap_start), KERNEL_HEAP_SIZE);
	Ok(())
}

pub fn print_information() {
	physicalmem::print_information();
	allocator::print_information();
}
