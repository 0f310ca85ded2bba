//! Ember: a minimal x86-64 multiprocessor bring-up kernel.
//!
//! The core brings every enabled processor of the machine from the MADT
//! enumeration through the INIT-SIPI-SIPI protocol into long-mode kernel
//! code, with a shared IDT, per-CPU APIC timers and a small physical and
//! virtual memory layer underneath. A verification harness exercises the
//! parallel substrate and reports on the serial console.

#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

#[macro_use]
mod macros;

mod arch;
mod config;
mod console;
mod env;
mod errors;
mod logging;
mod mm;
#[cfg(target_os = "none")]
mod runtime_glue;
mod selftest;
mod synch;

use crate::arch::x86_64::kernel::processor;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::allocator::LockedHeap = mm::allocator::LockedHeap;

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments<'_>) {
	use core::fmt::Write;

	console::CONSOLE.lock().write_fmt(args).unwrap();
}

/// Entry point of the kernel on the boot processor, called by `_start`
/// with the physical address of the loader's boot information blob.
pub(crate) fn boot_processor_main(boot_info_address: u64) -> ! {
	arch::kernel::message_output_init();
	unsafe {
		logging::init();
	}

	info!("Welcome to Ember {}", env!("CARGO_PKG_VERSION"));

	if let Err(error) = arch::kernel::boot_processor_init(boot_info_address) {
		error!("Fatal initialization error: {error}");
		processor::halt_forever();
	}

	if let Err(error) = arch::kernel::boot_application_processors() {
		error!("Fatal error while starting application processors: {error}");
		processor::halt_forever();
	}

	arch::kernel::start_cpu_timer();
	arch::x86_64::kernel::interrupts::enable();

	selftest::run_boot_processor();

	info!("System halted");
	loop {
		processor::halt();
	}
}

/// Entry point of the kernel on an application processor, reached from the
/// trampoline with interrupts already enabled.
pub(crate) fn application_processor_main(core_id: usize) -> ! {
	selftest::application_processor_loop(core_id)
}
