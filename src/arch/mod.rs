#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::kernel;

/// Logical index of the CPU executing this code.
/// Falls back to 0 while the APIC driver is not up yet.
pub fn core_id() -> usize {
	kernel::smp::current_cpu_index()
}
