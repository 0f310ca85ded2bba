//! Driver for the Local APIC of every CPU.
//!
//! The driver supports both access modes: classic xAPIC through the MMIO
//! window at 0xFEE00000 and x2APIC through the MSR block at 0x800. Every
//! register access funnels through [`local_apic_read`]/[`local_apic_write`],
//! which branch on the mode selected once at boot.

#![allow(dead_code)]

use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hermit_sync::OnceCell;
use x86_64::registers::model_specific::Msr;
use x86_64::PhysAddr;

use crate::arch::x86_64::kernel::{pic, processor};
use crate::arch::x86_64::mm::paging;
use crate::arch::x86_64::mm::paging::PageTableEntryFlags;
use crate::config::SPURIOUS_INTERRUPT_NUMBER;
use crate::errors::KernelError;

// Register offsets in xAPIC MMIO layout.
const APIC_ID_REGISTER: u32 = 0x020;
const APIC_EOI_REGISTER: u32 = 0x0B0;
const APIC_SVR_REGISTER: u32 = 0x0F0;
const APIC_ICR_REGISTER: u32 = 0x300;
const APIC_ICR_HIGH_REGISTER: u32 = 0x310;
const APIC_LVT_TIMER_REGISTER: u32 = 0x320;
const APIC_TIMER_INITIAL_COUNT_REGISTER: u32 = 0x380;
const APIC_TIMER_CURRENT_COUNT_REGISTER: u32 = 0x390;
const APIC_TIMER_DIVIDE_CONFIG_REGISTER: u32 = 0x3E0;

const APIC_SVR_ENABLE: u64 = 1 << 8;
const APIC_ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;
pub const APIC_ICR_DELIVERY_MODE_INIT: u64 = 0x500;
pub const APIC_ICR_DELIVERY_MODE_STARTUP: u64 = 0x600;
pub const APIC_ICR_LEVEL_ASSERT: u64 = 1 << 14;
pub const APIC_ICR_LEVEL_TRIGGERED: u64 = 1 << 15;
const APIC_LVT_MASK: u64 = 1 << 16;
const APIC_LVT_TIMER_PERIODIC: u64 = 1 << 17;

/// Divide configuration value for "divide by 16".
pub const APIC_TIMER_DIVIDE_BY_16: u32 = 0b0011;

const IA32_APIC_BASE: u32 = 0x1B;
const IA32_APIC_BASE_XAPIC_ENABLE: u64 = 1 << 11;
const IA32_APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;

/// First MSR of the x2APIC register block.
const X2APIC_MSR_BASE: u32 = 0x800;

/// Upper bound of `pause` iterations while waiting for ICR delivery.
const ICR_DELIVERY_POLL_LIMIT: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicMode {
	XApic,
	X2Apic,
}

static APIC_MODE: OnceCell<ApicMode> = OnceCell::new();

/// Base of the xAPIC MMIO window, identity-mapped. Unused in x2APIC mode.
static LOCAL_APIC_ADDRESS: AtomicU64 = AtomicU64::new(0);

/// Count of ICR delivery polls that hit the iteration cap. The SIPI
/// sequence must not produce console output, so timeouts are only counted
/// here and reported by the BSP after bring-up.
static IPI_DELIVERY_TIMEOUTS: AtomicUsize = AtomicUsize::new(0);

/// APIC timer ticks per microsecond, measured once on the BSP.
static CALIBRATED_TICKS_PER_US: AtomicU64 = AtomicU64::new(0);

fn mode() -> ApicMode {
	*APIC_MODE.get().expect("APIC driver used before init")
}

pub fn is_initialized() -> bool {
	APIC_MODE.get().is_some()
}

/// Translates an xAPIC register offset into its x2APIC MSR.
const fn msr_for_offset(register: u32) -> u32 {
	X2APIC_MSR_BASE + (register >> 4)
}

fn xapic_register_address(register: u32) -> u64 {
	LOCAL_APIC_ADDRESS.load(Ordering::Relaxed) + u64::from(register)
}

pub fn local_apic_read(register: u32) -> u32 {
	match mode() {
		ApicMode::X2Apic => unsafe { Msr::new(msr_for_offset(register)).read() as u32 },
		ApicMode::XApic => unsafe {
			ptr::read_volatile(xapic_register_address(register) as *const u32)
		},
	}
}

pub fn local_apic_write(register: u32, value: u64) {
	match mode() {
		ApicMode::X2Apic => unsafe {
			// A single MSR write, even for the 64-bit ICR. No delivery
			// status exists in x2APIC mode (cf. Intel Vol. 3A, 10.12.9).
			Msr::new(msr_for_offset(register)).write(value);
		},
		ApicMode::XApic => {
			if register == APIC_ICR_REGISTER {
				// xAPIC splits the ICR into two 32-bit registers. The
				// destination moves from bits 32+ into bits 24-31 of ICR2.
				let destination = ((value >> 8) & 0xFF00_0000) as u32;
				unsafe {
					ptr::write_volatile(
						xapic_register_address(APIC_ICR_HIGH_REGISTER) as *mut u32,
						destination,
					);
				}
			}

			let register_pointer = xapic_register_address(register) as *mut u32;
			unsafe {
				ptr::write_volatile(register_pointer, value as u32);
			}

			if register == APIC_ICR_REGISTER {
				// Wait for the CPU to clear the Delivery Status bit, with a
				// bounded spin. A stale pending bit is picked up by the
				// next poll, so giving up is safe.
				let mut delivered = false;
				for _ in 0..ICR_DELIVERY_POLL_LIMIT {
					if unsafe { ptr::read_volatile(register_pointer) }
						& APIC_ICR_DELIVERY_STATUS_PENDING
						== 0
					{
						delivered = true;
						break;
					}
					spin_loop();
				}
				if !delivered {
					IPI_DELIVERY_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
				}
			}
		}
	}
}

/// Composes and issues an IPI. In xAPIC mode the write blocks until the
/// delivery status drains or the poll cap fires.
pub fn send_ipi(destination: u8, flags: u64) {
	local_apic_write(APIC_ICR_REGISTER, (u64::from(destination) << 32) | flags);
}

#[inline]
pub fn eoi() {
	local_apic_write(APIC_EOI_REGISTER, 0);
}

/// APIC ID of the executing CPU.
pub fn current_apic_id() -> u32 {
	match mode() {
		// In xAPIC mode the ID sits in the top byte of the register.
		ApicMode::XApic => local_apic_read(APIC_ID_REGISTER) >> 24,
		ApicMode::X2Apic => local_apic_read(APIC_ID_REGISTER),
	}
}

/// Runs the mode-appropriate enable sequence on the executing CPU:
/// xAPIC global enable first, then x2APIC on top where supported.
fn enable_local_apic() {
	let mut apic_base = unsafe { Msr::new(IA32_APIC_BASE).read() };

	apic_base |= IA32_APIC_BASE_XAPIC_ENABLE;
	unsafe {
		Msr::new(IA32_APIC_BASE).write(apic_base);
	}

	if processor::supports_x2apic() {
		apic_base |= IA32_APIC_BASE_X2APIC_ENABLE;
		unsafe {
			Msr::new(IA32_APIC_BASE).write(apic_base);
		}
	}
}

/// Initializes the Local APIC of the boot processor and selects the access
/// mode for the whole system.
pub fn init() -> Result<(), KernelError> {
	// The legacy PICs must never deliver anything; spurious interrupts
	// included.
	pic::mask_all();

	let apic_base = unsafe { Msr::new(IA32_APIC_BASE).read() };

	if processor::supports_x2apic() {
		APIC_MODE.set(ApicMode::X2Apic).ok();
	} else {
		// Architecturally 0xFEE00000, but derived from IA32_APIC_BASE.
		let mmio_base = apic_base & 0x000F_FFFF_F000;

		// Map the window before any AP is woken: the mapping is part of the
		// shared page tables, so application processors can run their
		// timers off the same window.
		let mut flags = PageTableEntryFlags::empty();
		flags.device().writable().execute_disable();
		paging::identity_map_if_unmapped(PhysAddr::new(mmio_base), flags)?;

		LOCAL_APIC_ADDRESS.store(mmio_base, Ordering::Relaxed);
		APIC_MODE.set(ApicMode::XApic).ok();
	}

	enable_local_apic();

	// Software-enable the APIC and announce the spurious vector.
	local_apic_write(
		APIC_SVR_REGISTER,
		APIC_SVR_ENABLE | u64::from(SPURIOUS_INTERRUPT_NUMBER),
	);

	// Keep the timer quiet until it is explicitly started.
	local_apic_write(APIC_LVT_TIMER_REGISTER, APIC_LVT_MASK);

	calibrate_timer();

	info!(
		"Local APIC enabled in {} mode, BSP APIC ID {}",
		match mode() {
			ApicMode::XApic => "xAPIC",
			ApicMode::X2Apic => "x2APIC",
		},
		current_apic_id()
	);
	Ok(())
}

/// Re-runs the enable sequence on an application processor. The mode and
/// the MMIO mapping are shared with the BSP.
pub fn init_application_processor() {
	enable_local_apic();
	local_apic_write(
		APIC_SVR_REGISTER,
		APIC_SVR_ENABLE | u64::from(SPURIOUS_INTERRUPT_NUMBER),
	);
	local_apic_write(APIC_LVT_TIMER_REGISTER, APIC_LVT_MASK);
}

/// Measures how many APIC timer ticks (divide by 16) elapse per
/// microsecond by letting the counter run over a TSC-timed window.
fn calibrate_timer() {
	let calibration_us = 10_000;

	local_apic_write(
		APIC_TIMER_DIVIDE_CONFIG_REGISTER,
		u64::from(APIC_TIMER_DIVIDE_BY_16),
	);
	local_apic_write(APIC_TIMER_INITIAL_COUNT_REGISTER, u64::from(u32::MAX));

	processor::udelay(calibration_us);

	let elapsed = u64::from(u32::MAX - local_apic_read(APIC_TIMER_CURRENT_COUNT_REGISTER));
	let ticks_per_us = (elapsed / calibration_us).max(1);
	CALIBRATED_TICKS_PER_US.store(ticks_per_us, Ordering::Relaxed);

	// Stop the counter again.
	local_apic_write(APIC_LVT_TIMER_REGISTER, APIC_LVT_MASK);
	local_apic_write(APIC_TIMER_INITIAL_COUNT_REGISTER, 0);

	debug!("Calibrated APIC timer: {} ticks per microsecond", ticks_per_us);
}

/// Initial-count value for a periodic timer of the given frequency,
/// based on the calibration of the BSP.
pub fn timer_initial_count_for_hz(hz: u64) -> u32 {
	let ticks_per_us = CALIBRATED_TICKS_PER_US.load(Ordering::Relaxed).max(1);
	let period_us = 1_000_000 / hz.max(1);
	(ticks_per_us * period_us).min(u64::from(u32::MAX)) as u32
}

/// Starts the per-CPU timer in periodic mode. Writing the initial count
/// starts the countdown.
pub fn start_periodic_timer(vector: u8, divide: u32, initial_count: u32) {
	local_apic_write(APIC_TIMER_DIVIDE_CONFIG_REGISTER, u64::from(divide));
	local_apic_write(
		APIC_LVT_TIMER_REGISTER,
		APIC_LVT_TIMER_PERIODIC | u64::from(vector),
	);
	local_apic_write(APIC_TIMER_INITIAL_COUNT_REGISTER, u64::from(initial_count));
}

/// Masks or unmasks the timer LVT without touching mode or vector.
pub fn set_timer_masked(masked: bool) {
	let mut lvt = u64::from(local_apic_read(APIC_LVT_TIMER_REGISTER));
	if masked {
		lvt |= APIC_LVT_MASK;
	} else {
		lvt &= !APIC_LVT_MASK;
	}
	local_apic_write(APIC_LVT_TIMER_REGISTER, lvt);
}

/// Number of ICR delivery polls that ran into the iteration cap so far.
pub fn ipi_delivery_timeouts() -> usize {
	IPI_DELIVERY_TIMEOUTS.load(Ordering::Relaxed)
}

pub fn print_information() {
	match mode() {
		ApicMode::XApic => info!(
			"APIC in use: xAPIC at {:#x}",
			LOCAL_APIC_ADDRESS.load(Ordering::Relaxed)
		),
		ApicMode::X2Apic => info!("APIC in use: x2APIC"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn offsets_map_to_documented_msrs() {
		assert_eq!(msr_for_offset(APIC_ID_REGISTER), 0x802);
		assert_eq!(msr_for_offset(APIC_EOI_REGISTER), 0x80B);
		assert_eq!(msr_for_offset(APIC_SVR_REGISTER), 0x80F);
		assert_eq!(msr_for_offset(APIC_ICR_REGISTER), 0x830);
		assert_eq!(msr_for_offset(APIC_LVT_TIMER_REGISTER), 0x832);
		assert_eq!(msr_for_offset(APIC_TIMER_INITIAL_COUNT_REGISTER), 0x838);
		assert_eq!(msr_for_offset(APIC_TIMER_CURRENT_COUNT_REGISTER), 0x839);
		assert_eq!(msr_for_offset(APIC_TIMER_DIVIDE_CONFIG_REGISTER), 0x83E);
	}

	#[test]
	fn icr_destination_conversion() {
		// The 64-bit ICR value carries the destination in bits 32+; the
		// xAPIC path moves it into bits 24-31 of ICR2.
		let value = (5u64 << 32) | APIC_ICR_DELIVERY_MODE_STARTUP | 0x08;
		let destination = ((value >> 8) & 0xFF00_0000) as u32;
		assert_eq!(destination, 5 << 24);
		assert_eq!(value as u32, 0x608);
	}

	#[test]
	fn periodic_timer_period_fits_in_counter() {
		CALIBRATED_TICKS_PER_US.store(1000, Ordering::Relaxed);
		// 10 Hz at 1000 ticks/us -> 100,000,000 ticks.
		assert_eq!(timer_initial_count_for_hz(10), 100_000_000);

		// Absurd calibrations saturate instead of overflowing.
		CALIBRATED_TICKS_PER_US.store(u64::from(u32::MAX), Ordering::Relaxed);
		assert_eq!(timer_initial_count_for_hz(1), u32::MAX);
		CALIBRATED_TICKS_PER_US.store(0, Ordering::Relaxed);
	}
}
