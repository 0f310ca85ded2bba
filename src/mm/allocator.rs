//! The kernel heap: a bump allocator over a fixed virtual window.
//!
//! Allocations are rounded up to 16-byte alignment; freeing is a no-op.
//! That is sufficient for the bring-up core, whose allocations live for the
//! kernel's lifetime, and keeps the allocator trivially correct. A proper
//! allocator replaces this once the core grows real workloads.

#![allow(dead_code)]

use core::alloc::{GlobalAlloc, Layout};

use hermit_sync::SpinMutex;
use x86_64::VirtAddr;

/// Minimum alignment handed out by the heap.
const HEAP_ALIGNMENT: usize = 16;

#[derive(Debug)]
struct BumpAllocator {
	start: usize,
	end: usize,
	next: usize,
}

impl BumpAllocator {
	const fn empty() -> Self {
		Self {
			start: 0,
			end: 0,
			next: 0,
		}
	}

	fn init(&mut self, start: usize, size: usize) {
		self.start = start;
		self.end = start + size;
		self.next = start;
	}

	fn allocate(&mut self, size: usize, align: usize) -> Option<usize> {
		if size == 0 || self.end == 0 {
			return None;
		}

		let align = align.max(HEAP_ALIGNMENT);
		let address = self.next.next_multiple_of(align);
		let new_next = address.checked_add(size)?;
		if new_next > self.end {
			return None;
		}

		self.next = new_next;
		Some(address)
	}

	fn used(&self) -> usize {
		self.next - self.start
	}

	fn size(&self) -> usize {
		self.end - self.start
	}
}

static KERNEL_HEAP: SpinMutex<BumpAllocator> = SpinMutex::new(BumpAllocator::empty());

/// Hands the heap its backing window. The window must already be mapped.
pub fn init(start: VirtAddr, size: usize) {
	KERNEL_HEAP.lock().init(start.as_u64() as usize, size);
	info!(
		"Kernel heap: {} KiB window at {:p}",
		size >> 10,
		start.as_u64() as *const u8
	);
}

/// Allocates `size` bytes with 16-byte alignment.
/// Returns `None` when the window is exhausted.
pub fn kmalloc(size: usize) -> Option<VirtAddr> {
	KERNEL_HEAP
		.lock()
		.allocate(size, HEAP_ALIGNMENT)
		.map(|address| VirtAddr::new(address as u64))
}

/// Releasing heap memory is not supported by the bump allocator.
pub fn kfree(_address: VirtAddr) {}

pub fn print_information() {
	let heap = KERNEL_HEAP.lock();
	info!(
		"Kernel heap: {} of {} bytes in use",
		heap.used(),
		heap.size()
	);
}

/// Adapter that makes the bump heap available to `alloc`.
pub struct LockedHeap;

unsafe impl GlobalAlloc for LockedHeap {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		KERNEL_HEAP
			.lock()
			.allocate(layout.size(), layout.align())
			.map_or(core::ptr::null_mut(), |address| address as *mut u8)
	}

	unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
		// Documented limitation: the bump allocator never frees.
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn bump_over(window: usize) -> BumpAllocator {
		let mut bump = BumpAllocator::empty();
		bump.init(0x100_0000, window);
		bump
	}

	#[test]
	fn allocations_are_aligned_and_disjoint() {
		let mut bump = bump_over(4096);

		let first = bump.allocate(10, 1).unwrap();
		let second = bump.allocate(10, 1).unwrap();
		assert_eq!(first % HEAP_ALIGNMENT, 0);
		assert_eq!(second % HEAP_ALIGNMENT, 0);
		assert!(second >= first + 10);
	}

	#[test]
	fn large_alignments_are_honored() {
		let mut bump = bump_over(4096);

		bump.allocate(1, 1).unwrap();
		let aligned = bump.allocate(64, 256).unwrap();
		assert_eq!(aligned % 256, 0);
	}

	#[test]
	fn window_exhaustion_returns_none() {
		let mut bump = bump_over(64);

		assert!(bump.allocate(48, 1).is_some());
		assert!(bump.allocate(48, 1).is_none());
		// A smaller request can still succeed afterwards.
		assert!(bump.allocate(16, 1).is_some());
	}

	#[test]
	fn zero_sized_and_uninitialized_requests_fail() {
		let mut bump = bump_over(64);
		assert!(bump.allocate(0, 1).is_none());

		let mut empty = BumpAllocator::empty();
		assert!(empty.allocate(16, 1).is_none());
	}
}
