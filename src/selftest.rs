//! The verification harness that runs on every CPU after bring-up.
//!
//! All results appear as single `[selftest]` lines on the console so a
//! host-side script can check them with plain regular expressions. The
//! phases are fenced by the sense-reversing barrier; within a phase, every
//! counter is owned exclusively by its CPU.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use hermit_sync::SpinMutex;

use crate::arch::x86_64::kernel::{interrupts, processor, smp};
use crate::arch::x86_64::mm::physicalmem;
use crate::config::MAX_CPUS;
use crate::synch::barrier::Barrier;

/// Every CPU counts its own counter up to this value.
const COUNTER_TARGET: u64 = 1_000_000;

/// Phase-one target of the barrier test.
const BARRIER_PHASE_TARGET: u64 = 500_000;

/// The distributed sum covers `1..=SUM_UPPER_BOUND`.
const SUM_UPPER_BOUND: u64 = 10_000_000;
const EXPECTED_TOTAL: u64 = 50_000_005_000_000;

static COUNTERS: [AtomicU64; MAX_CPUS] = {
	const COUNTER: AtomicU64 = AtomicU64::new(0);
	[COUNTER; MAX_CPUS]
};

static SHARED_TOTAL: SpinMutex<u64> = SpinMutex::new(0);
static BARRIER: Barrier = Barrier::new();

/// Number of CPUs taking part in the harness, fixed by the BSP before it
/// releases the start flag. CPUs coming online later skip the harness.
static PARTICIPANTS: AtomicUsize = AtomicUsize::new(0);
static STARTED: AtomicBool = AtomicBool::new(false);

/// Drives the harness on the boot processor and prints the verdicts.
pub fn run_boot_processor() {
	let participants = smp::online_cpus() as usize;
	PARTICIPANTS.store(participants, Ordering::SeqCst);
	STARTED.store(true, Ordering::SeqCst);

	println!("[selftest] starting on {participants} CPUs");
	run_tests(0, participants);
	report(participants);
}

/// Steady state of an application processor: take part in the harness once
/// it starts, then halt. Timer interrupts keep arriving either way.
pub fn application_processor_loop(core_id: usize) -> ! {
	while !STARTED.load(Ordering::SeqCst) {
		spin_loop();
	}

	if core_id < PARTICIPANTS.load(Ordering::SeqCst) {
		run_tests(core_id, PARTICIPANTS.load(Ordering::SeqCst));
	}

	loop {
		processor::halt();
	}
}

fn run_tests(core_id: usize, participants: usize) {
	let mut sense = false;
	BARRIER.wait(participants, &mut sense);

	// Parallel counter test: each CPU owns one counter.
	for _ in 0..COUNTER_TARGET {
		COUNTERS[core_id].fetch_add(1, Ordering::SeqCst);
	}
	BARRIER.wait(participants, &mut sense);
	if core_id == 0 {
		let ok = (0..participants)
			.all(|cpu| COUNTERS[cpu].load(Ordering::SeqCst) == COUNTER_TARGET);
		println!(
			"[selftest] parallel counters: {}",
			if ok { "ok" } else { "FAILED" }
		);
		for counter in COUNTERS.iter().take(participants) {
			counter.store(0, Ordering::SeqCst);
		}
	}
	BARRIER.wait(participants, &mut sense);

	// Distributed sum over disjoint chunks, merged under a spinlock.
	let (from, to) = chunk_bounds(core_id, participants, SUM_UPPER_BOUND);
	let local_sum = sum_range(from, to);
	*SHARED_TOTAL.lock() += local_sum;
	BARRIER.wait(participants, &mut sense);
	if core_id == 0 {
		let total = *SHARED_TOTAL.lock();
		println!(
			"[selftest] distributed sum 1..={SUM_UPPER_BOUND}: {} (expected {EXPECTED_TOTAL}): {}",
			total,
			if total == EXPECTED_TOTAL { "ok" } else { "FAILED" }
		);
	}
	BARRIER.wait(participants, &mut sense);

	// Barrier test: two counting phases around a synchronization point.
	for _ in 0..BARRIER_PHASE_TARGET {
		COUNTERS[core_id].fetch_add(1, Ordering::SeqCst);
	}
	BARRIER.wait(participants, &mut sense);
	if core_id == 0 {
		// Nobody may have entered phase two yet.
		let ok = (0..participants)
			.all(|cpu| COUNTERS[cpu].load(Ordering::SeqCst) == BARRIER_PHASE_TARGET);
		println!(
			"[selftest] barrier phase one: {}",
			if ok { "ok" } else { "FAILED" }
		);
	}
	BARRIER.wait(participants, &mut sense);
	for _ in BARRIER_PHASE_TARGET..COUNTER_TARGET {
		COUNTERS[core_id].fetch_add(1, Ordering::SeqCst);
	}
	BARRIER.wait(participants, &mut sense);
	if core_id == 0 {
		let ok = (0..participants)
			.all(|cpu| COUNTERS[cpu].load(Ordering::SeqCst) == COUNTER_TARGET);
		println!(
			"[selftest] barrier phase two: {}",
			if ok { "ok" } else { "FAILED" }
		);
	}
}

/// BSP-only checks that need no other CPU's cooperation.
fn report(participants: usize) {
	#[cfg(target_os = "none")]
	println!(
		"[selftest] recursive self-map: {}",
		if crate::arch::x86_64::mm::paging::recursive_self_map_is_intact() {
			"ok"
		} else {
			"FAILED"
		}
	);

	// Allocator laws: a freed frame restores the allocator state, and the
	// per-frame accounting always adds up.
	let used_before = physicalmem::used_pages();
	if let Ok(frame) = physicalmem::allocate() {
		physicalmem::deallocate(frame);
	}
	let conserved = physicalmem::used_pages() == used_before
		&& physicalmem::used_pages() + physicalmem::free_pages() == physicalmem::total_pages();
	println!(
		"[selftest] pmm conservation: {}",
		if conserved { "ok" } else { "FAILED" }
	);

	// Mapping law: a mapped page translates to its frame until unmapped.
	#[cfg(target_os = "none")]
	{
		use x86_64::VirtAddr;

		use crate::arch::x86_64::mm::paging;
		use crate::arch::x86_64::mm::paging::PageTableEntryFlags;

		// An otherwise unused slot high in the kernel half.
		let page = VirtAddr::new(0xFFFF_9000_0000_0000);
		let verdict = match physicalmem::allocate() {
			Ok(frame) => {
				let mut flags = PageTableEntryFlags::empty();
				flags.normal().writable().execute_disable();

				let mut ok = paging::map_page(page, frame, flags).is_ok();
				ok &= paging::virt_to_phys(page) == Some(frame);
				paging::unmap_page(page);
				ok &= paging::virt_to_phys(page).is_none();

				physicalmem::deallocate(frame);
				ok
			}
			Err(_) => false,
		};
		println!(
			"[selftest] vmm map/translate/unmap: {}",
			if verdict { "ok" } else { "FAILED" }
		);
	}

	// A breakpoint must report and resume behind the `int3`.
	let exceptions_before = interrupts::exception_count();
	unsafe {
		core::arch::asm!("int3");
	}
	println!(
		"[selftest] breakpoint: {}",
		if interrupts::exception_count() > exceptions_before {
			"ok"
		} else {
			"FAILED"
		}
	);

	// Timer progress: the global tick count must strictly increase while
	// the BSP waits.
	let calls_before = interrupts::global_timer_calls();
	processor::mdelay(2000);
	let calls_after = interrupts::global_timer_calls();
	println!(
		"[selftest] timer progress: {} -> {} calls: {}",
		calls_before,
		calls_after,
		if calls_after > calls_before {
			"ok"
		} else {
			"FAILED"
		}
	);

	for cpu in 0..participants {
		println!(
			"[selftest] core {} timer ticks: {}",
			cpu,
			interrupts::timer_ticks(cpu)
		);
	}

	println!("[selftest] done");
}

/// Splits `1..=upper` into `participants` contiguous chunks; the last chunk
/// takes the remainder.
fn chunk_bounds(core_id: usize, participants: usize, upper: u64) -> (u64, u64) {
	let chunk = upper / participants as u64;
	let from = core_id as u64 * chunk + 1;
	let to = if core_id == participants - 1 {
		upper
	} else {
		(core_id as u64 + 1) * chunk
	};
	(from, to)
}

fn sum_range(from: u64, to: u64) -> u64 {
	(from..=to).sum()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chunks_partition_the_range() {
		for participants in 1..=7 {
			let mut next_expected = 1;
			let mut total = 0u64;

			for cpu in 0..participants {
				let (from, to) = chunk_bounds(cpu, participants, SUM_UPPER_BOUND);
				assert_eq!(from, next_expected);
				assert!(to >= from);
				next_expected = to + 1;
				total += sum_range(from, to);
			}

			assert_eq!(next_expected, SUM_UPPER_BOUND + 1);
			assert_eq!(total, EXPECTED_TOTAL);
		}
	}

	#[test]
	fn expected_total_matches_gauss() {
		assert_eq!(
			SUM_UPPER_BOUND * (SUM_UPPER_BOUND + 1) / 2,
			EXPECTED_TOTAL
		);
	}

	#[test]
	fn small_ranges_sum_correctly() {
		assert_eq!(sum_range(1, 10), 55);
		assert_eq!(sum_range(5, 5), 5);
	}
}
