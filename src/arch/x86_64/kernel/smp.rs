//! Symmetric multiprocessing: the CPU table and the INIT-SIPI-SIPI
//! bring-up of all application processors.
//!
//! Bring-up is strictly serialized. For each AP the BSP patches the shared
//! stack slot of the trampoline, flushes the caches, runs the INIT and
//! STARTUP sequence and then waits for the AP to show up in [`CPU_ONLINE`]
//! before it touches the patch slots again. Between the first INIT and the
//! end of the last AP's startup pause no console output happens; everything
//! worth reporting is collected in shared memory and printed afterwards.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use x86_64::registers::control::Cr3;
use x86_64::PhysAddr;

use crate::arch::x86_64::kernel::smp_boot_code::smp_boot_code;
use crate::arch::x86_64::kernel::{acpi, apic, gdt, interrupts, processor};
use crate::arch::x86_64::mm::paging;
use crate::arch::x86_64::mm::paging::PageTableEntryFlags;
use crate::config::{AP_STACK_SIZE, MAX_CPUS, TIMER_FREQUENCY_HZ, TIMER_INTERRUPT_NUMBER};
use crate::errors::KernelError;
use crate::mm::allocator;

/// Physical and virtual load address of the trampoline.
///
/// While the boot processor is already in long mode, application processors
/// start in 16-bit real mode and need an address reachable by the CS:IP
/// addressing scheme of a STARTUP IPI: page-aligned and below 1 MiB.
pub const SMP_BOOT_CODE_ADDRESS: u64 = 0x8000;

/// The three 64-bit patch slots at the end of the trampoline.
const SMP_BOOT_CODE_SLOT_PAGE_TABLE: usize = 24;
const SMP_BOOT_CODE_SLOT_STACK: usize = 16;
const SMP_BOOT_CODE_SLOT_ENTRY: usize = 8;

/// Milliseconds the BSP waits for a single AP to increment [`CPU_ONLINE`].
const AP_STARTUP_TIMEOUT_MS: u64 = 1000;

/// Milliseconds the BSP waits for the whole system to settle before it
/// reports stragglers.
const ONLINE_POLL_DEADLINE_MS: u64 = 2000;

/// Count of CPUs that reached `ap_entry` (plus the BSP). The pre-increment
/// value doubles as the logical index of the incrementing CPU.
pub static CPU_ONLINE: AtomicU32 = AtomicU32::new(0);

/// Local APIC ID per logical CPU index, BSP at index 0.
/// Written only by the BSP before any STARTUP IPI is sent.
static CPU_APIC_IDS: [AtomicU8; MAX_CPUS] = {
	const ID: AtomicU8 = AtomicU8::new(0);
	[ID; MAX_CPUS]
};

static CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Set by each CPU after it finished its local initialization.
/// Transitions 0 -> 1 exactly once per CPU.
static CPU_ONLINE_FLAGS: [AtomicBool; MAX_CPUS] = {
	const OFFLINE: AtomicBool = AtomicBool::new(false);
	[OFFLINE; MAX_CPUS]
};

/// Builds the CPU table from the MADT enumeration, moving the BSP to
/// index 0. Duplicate APIC IDs are dropped with a complaint.
pub fn init_cpu_table() -> Result<(), KernelError> {
	let boot_apic_id = apic::current_apic_id() as u8;
	let mut count = 0;

	let mut add = |apic_id: u8| {
		for index in 0..count {
			if CPU_APIC_IDS[index].load(Ordering::Relaxed) == apic_id {
				error!("Duplicate Local APIC ID {apic_id} in the MADT, ignoring");
				return;
			}
		}
		if count < MAX_CPUS {
			CPU_APIC_IDS[count].store(apic_id, Ordering::Relaxed);
			count += 1;
		}
	};

	add(boot_apic_id);
	for &apic_id in acpi::local_apic_ids() {
		if apic_id != boot_apic_id {
			add(apic_id);
		}
	}

	CPU_COUNT.store(count, Ordering::SeqCst);
	info!("CPU table: {count} logical CPUs, BSP APIC ID {boot_apic_id}");
	for index in 0..count {
		info!(
			"Core {}: APIC ID {}",
			index,
			CPU_APIC_IDS[index].load(Ordering::Relaxed)
		);
	}
	Ok(())
}

/// Number of logical CPUs known to the kernel.
pub fn cpu_count() -> usize {
	CPU_COUNT.load(Ordering::SeqCst)
}

pub fn cpu_apic_id(index: usize) -> u8 {
	CPU_APIC_IDS[index].load(Ordering::Relaxed)
}

/// Number of CPUs that started running kernel code so far.
pub fn online_cpus() -> u32 {
	CPU_ONLINE.load(Ordering::SeqCst)
}

pub fn cpu_is_online(index: usize) -> bool {
	CPU_ONLINE_FLAGS[index].load(Ordering::SeqCst)
}

/// Logical index of the executing CPU, determined by looking up the APIC ID
/// in the CPU table. Before the APIC driver is up, this is the BSP.
pub fn current_cpu_index() -> usize {
	if !apic::is_initialized() {
		return 0;
	}

	let apic_id = apic::current_apic_id() as u8;
	for index in 0..cpu_count().min(MAX_CPUS) {
		if CPU_APIC_IDS[index].load(Ordering::Relaxed) == apic_id {
			return index;
		}
	}
	0
}

/// Claims index 0 for the boot processor.
pub fn mark_boot_processor_online() {
	let index = CPU_ONLINE.fetch_add(1, Ordering::SeqCst);
	assert_eq!(index, 0, "boot processor is not the first CPU online");
	CPU_ONLINE_FLAGS[0].store(true, Ordering::SeqCst);
}

fn patch_slot(offset_from_end: usize, value: u64) {
	let address = SMP_BOOT_CODE_ADDRESS + smp_boot_code().len() as u64 - offset_from_end as u64;
	unsafe {
		ptr::write_volatile(address as *mut u64, value);
	}
}

/// Copies the trampoline to its landing page and patches the page-table
/// root and the 64-bit entry point. The per-AP stack slot is patched later,
/// once per AP.
fn setup_smp_boot_code() -> Result<(), KernelError> {
	let code = smp_boot_code();
	assert!(
		code.len() <= 4096,
		"SMP boot code does not fit its landing page"
	);

	let mut flags = PageTableEntryFlags::empty();
	flags.normal().writable();
	paging::identity_map_if_unmapped(PhysAddr::new(SMP_BOOT_CODE_ADDRESS), flags)?;

	unsafe {
		ptr::copy_nonoverlapping(
			code.as_ptr(),
			SMP_BOOT_CODE_ADDRESS as *mut u8,
			code.len(),
		);
	}

	let (frame, _) = Cr3::read();
	let page_table_root = frame.start_address().as_u64();
	// The trampoline loads CR3 while still in 32-bit protected mode.
	assert!(
		page_table_root < u64::from(u32::MAX),
		"page-table root above 4 GiB cannot be handed to real-mode startup code"
	);

	patch_slot(SMP_BOOT_CODE_SLOT_PAGE_TABLE, page_table_root);
	patch_slot(SMP_BOOT_CODE_SLOT_ENTRY, ap_entry as usize as u64);
	processor::wbinvd();

	debug!(
		"SMP boot code ({} bytes) copied to {:#x}",
		code.len(),
		SMP_BOOT_CODE_ADDRESS
	);
	Ok(())
}

/// Wakes all application processors, one at a time.
///
/// This follows the INIT-SIPI-SIPI protocol: a level-triggered INIT assert,
/// 10 ms pause, INIT de-assert, then two STARTUP IPIs with the trampoline
/// page number as vector, 200 us apart.
pub fn boot_application_processors() -> Result<(), KernelError> {
	if cpu_count() <= 1 {
		return Ok(());
	}

	setup_smp_boot_code()?;
	info!("Starting {} application processors", cpu_count() - 1);

	// No console output below this line until all SIPI sequences are done:
	// the UART and the APIC interact destructively on some emulated
	// platforms while a STARTUP is in flight.
	for cpu in 1..cpu_count() {
		let apic_id = cpu_apic_id(cpu);

		let stack = allocator::kmalloc(AP_STACK_SIZE).ok_or(KernelError::OutOfMemory)?;
		patch_slot(
			SMP_BOOT_CODE_SLOT_STACK,
			stack.as_u64() + AP_STACK_SIZE as u64,
		);
		processor::wbinvd();

		let online_before = online_cpus();

		apic::send_ipi(
			apic_id,
			apic::APIC_ICR_LEVEL_TRIGGERED
				| apic::APIC_ICR_LEVEL_ASSERT
				| apic::APIC_ICR_DELIVERY_MODE_INIT,
		);
		processor::mdelay(10);

		apic::send_ipi(
			apic_id,
			apic::APIC_ICR_LEVEL_TRIGGERED | apic::APIC_ICR_DELIVERY_MODE_INIT,
		);

		let startup = apic::APIC_ICR_DELIVERY_MODE_STARTUP | (SMP_BOOT_CODE_ADDRESS >> 12);
		apic::send_ipi(apic_id, startup);
		processor::udelay(200);
		apic::send_ipi(apic_id, startup);
		processor::udelay(200);

		// Serialized bring-up: the single stack patch slot must not be
		// reused before this AP has taken its stack.
		let mut waited_ms = 0;
		while online_cpus() == online_before && waited_ms < AP_STARTUP_TIMEOUT_MS {
			processor::mdelay(1);
			waited_ms += 1;
		}
	}

	Ok(())
}

/// Polls the online flags against a fixed deadline. Stragglers are reported
/// as warnings, never as fatal errors.
pub fn wait_for_all_cpus_online() {
	let mut waited_ms = 0;
	while (online_cpus() as usize) < cpu_count() && waited_ms < ONLINE_POLL_DEADLINE_MS {
		processor::mdelay(1);
		waited_ms += 1;
	}

	for cpu in 0..cpu_count() {
		if !cpu_is_online(cpu) {
			warn!("{}", KernelError::ApNotOnline { cpu });
		}
	}

	let timeouts = apic::ipi_delivery_timeouts();
	if timeouts > 0 {
		warn!("{} ({} polls hit the cap)", KernelError::IpiDeliveryTimeout, timeouts);
	}

	info!("{} of {} CPUs online", online_cpus(), cpu_count());
}

/// First Rust code an application processor runs, entered from the
/// trampoline in long mode with a private stack.
pub extern "C" fn ap_entry() -> ! {
	// The pre-increment value is this CPU's logical index.
	let index = CPU_ONLINE.fetch_add(1, Ordering::SeqCst) as usize;
	assert!(index < MAX_CPUS);

	gdt::load();
	interrupts::load_idt();
	apic::init_application_processor();
	apic::start_periodic_timer(
		TIMER_INTERRUPT_NUMBER,
		apic::APIC_TIMER_DIVIDE_BY_16,
		apic::timer_initial_count_for_hz(TIMER_FREQUENCY_HZ),
	);

	CPU_ONLINE_FLAGS[index].store(true, Ordering::SeqCst);
	interrupts::enable();

	crate::application_processor_main(index)
}
