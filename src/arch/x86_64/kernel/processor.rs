//! CPU feature detection, TSC-based timekeeping and low-level helpers.

use core::arch::x86_64::_rdtsc;
use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

use hermit_sync::SpinMutex;
use raw_cpuid::CpuId;

static SUPPORTS_X2APIC: AtomicBool = AtomicBool::new(false);
static PHYSICAL_ADDRESS_BITS: AtomicU8 = AtomicU8::new(0);

/// Cached TSC frequency for the busy-wait delays.
static FREQUENCY_MHZ: AtomicU16 = AtomicU16::new(0);
static CPU_FREQUENCY: SpinMutex<CpuFrequency> = SpinMutex::new(CpuFrequency::new());

#[derive(Clone, Copy)]
enum CpuFrequencySource {
	Invalid,
	CpuId,
	CpuIdTscInfo,
	HypervisorTscInfo,
	CpuIdBrandString,
	Visionary,
}

impl fmt::Display for CpuFrequencySource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CpuFrequencySource::CpuId => write!(f, "CpuId"),
			CpuFrequencySource::CpuIdTscInfo => write!(f, "CpuId Tsc Info"),
			CpuFrequencySource::HypervisorTscInfo => write!(f, "Tsc Info from Hypervisor"),
			CpuFrequencySource::CpuIdBrandString => write!(f, "CpuId Brand String"),
			CpuFrequencySource::Visionary => write!(f, "Visionary"),
			CpuFrequencySource::Invalid => {
				panic!("Attempted to print an invalid CPU Frequency Source")
			}
		}
	}
}

struct CpuFrequency {
	mhz: u16,
	source: CpuFrequencySource,
}

impl CpuFrequency {
	const fn new() -> Self {
		Self {
			mhz: 0,
			source: CpuFrequencySource::Invalid,
		}
	}

	fn set_detected_cpu_frequency(
		&mut self,
		mhz: u16,
		source: CpuFrequencySource,
	) -> Result<(), ()> {
		// A frequency of zero would mean a division by zero later on.
		if mhz > 0 {
			self.mhz = mhz;
			self.source = source;
			Ok(())
		} else {
			Err(())
		}
	}

	fn detect_from_cpuid(&mut self, cpuid: &CpuId<raw_cpuid::CpuIdReaderNative>) -> Result<(), ()> {
		let frequency_info = cpuid.get_processor_frequency_info().ok_or(())?;
		let mhz = frequency_info.processor_base_frequency();
		self.set_detected_cpu_frequency(mhz, CpuFrequencySource::CpuId)
	}

	fn detect_from_cpuid_tsc_info(&mut self, cpuid: &CpuId<raw_cpuid::CpuIdReaderNative>) -> Result<(), ()> {
		let tsc_info = cpuid.get_tsc_info().ok_or(())?;
		let freq = tsc_info.tsc_frequency().ok_or(())?;
		let mhz = (freq / 1_000_000) as u16;
		self.set_detected_cpu_frequency(mhz, CpuFrequencySource::CpuIdTscInfo)
	}

	fn detect_from_cpuid_hypervisor_info(&mut self, cpuid: &CpuId<raw_cpuid::CpuIdReaderNative>) -> Result<(), ()> {
		let hypervisor_info = cpuid.get_hypervisor_info().ok_or(())?;
		let khz = hypervisor_info.tsc_frequency().ok_or(())?;
		let mhz = (u64::from(khz) / 1000)
			.try_into()
			.map_err(|_| ())?;
		self.set_detected_cpu_frequency(mhz, CpuFrequencySource::HypervisorTscInfo)
	}

	fn detect_from_cpuid_brand_string(&mut self, cpuid: &CpuId<raw_cpuid::CpuIdReaderNative>) -> Result<(), ()> {
		let processor_brand = cpuid.get_processor_brand_string().ok_or(())?;
		let mhz = mhz_from_brand_string(processor_brand.as_str()).ok_or(())?;
		self.set_detected_cpu_frequency(mhz, CpuFrequencySource::CpuIdBrandString)
	}

	fn detect(&mut self) {
		let cpuid = CpuId::new();
		self.detect_from_cpuid(&cpuid)
			.or_else(|_| self.detect_from_cpuid_tsc_info(&cpuid))
			.or_else(|_| self.detect_from_cpuid_hypervisor_info(&cpuid))
			.or_else(|_| self.detect_from_cpuid_brand_string(&cpuid))
			.or_else(|_| {
				warn!("Could not determine the processor frequency, guessing 2 GHz");
				self.set_detected_cpu_frequency(2000, CpuFrequencySource::Visionary)
			})
			.unwrap();
	}
}

impl fmt::Display for CpuFrequency {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} MHz (from {})", self.mhz, self.source)
	}
}

/// Extracts the frequency in MHz from brand strings such as
/// `Intel(R) Core(TM) i7-4770 CPU @ 3.40GHz`.
fn mhz_from_brand_string(brand_string: &str) -> Option<u16> {
	let ghz_find = brand_string.find("GHz")?;
	if ghz_find < 4 {
		return None;
	}

	let index = ghz_find - 4;
	let thousand = brand_string.chars().nth(index)?.to_digit(10)?;
	let decimal_char = brand_string.chars().nth(index + 1)?;
	let hundred = brand_string.chars().nth(index + 2)?.to_digit(10)?;
	let ten = brand_string.chars().nth(index + 3)?.to_digit(10)?;

	if decimal_char != '.' {
		return None;
	}
	Some((thousand * 1000 + hundred * 100 + ten * 10) as u16)
}

pub fn detect_features() {
	let cpuid = CpuId::new();

	if let Some(feature_info) = cpuid.get_feature_info() {
		SUPPORTS_X2APIC.store(feature_info.has_x2apic(), Ordering::Relaxed);
	}

	let bits = cpuid
		.get_processor_capacity_feature_info()
		.map(|info| info.physical_address_bits())
		.unwrap_or(36);
	PHYSICAL_ADDRESS_BITS.store(bits, Ordering::Relaxed);
}

pub fn detect_frequency() {
	let mut frequency = CPU_FREQUENCY.lock();
	frequency.detect();
	FREQUENCY_MHZ.store(frequency.mhz, Ordering::Relaxed);
}

#[inline]
pub fn supports_x2apic() -> bool {
	SUPPORTS_X2APIC.load(Ordering::Relaxed)
}

pub fn get_physical_address_bits() -> u8 {
	let bits = PHYSICAL_ADDRESS_BITS.load(Ordering::Relaxed);
	if bits != 0 {
		return bits;
	}

	// Tolerate early callers, e.g. page-table code running before detect_features.
	detect_features();
	PHYSICAL_ADDRESS_BITS.load(Ordering::Relaxed)
}

/// TSC frequency in MHz, i.e. timestamp ticks per microsecond.
#[inline]
pub fn get_frequency() -> u16 {
	FREQUENCY_MHZ.load(Ordering::Relaxed)
}

#[inline]
pub fn get_timestamp() -> u64 {
	unsafe { _rdtsc() }
}

/// Approximate busy-wait. Only the ordering and the minimum duration of the
/// delay matter to the callers, not its accuracy.
pub fn udelay(usecs: u64) {
	let end = get_timestamp() + u64::from(get_frequency()) * usecs;
	while get_timestamp() < end {
		spin_loop();
	}
}

pub fn mdelay(msecs: u64) {
	udelay(msecs * 1000);
}

#[inline]
pub fn halt() {
	x86_64::instructions::hlt();
}

/// Stops the current CPU for good. Interrupts are disabled first, so not
/// even the APIC timer wakes it up again.
pub fn halt_forever() -> ! {
	x86_64::instructions::interrupts::disable();
	loop {
		halt();
	}
}

/// Writes all modified cache lines back to memory and invalidates the
/// caches. Required to make trampoline patches visible to a CPU that
/// fetches through cold real-mode caches.
#[inline]
pub fn wbinvd() {
	unsafe {
		core::arch::asm!("wbinvd", options(nostack, preserves_flags));
	}
}

pub fn print_information() {
	let frequency = CPU_FREQUENCY.lock();
	let cpuid = CpuId::new();

	info!("CPU frequency: {}", *frequency);
	if let Some(brand) = cpuid.get_processor_brand_string() {
		info!("CPU brand: {}", brand.as_str());
	}
	info!(
		"x2APIC support: {}",
		if supports_x2apic() { "yes" } else { "no" }
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn brand_string_with_frequency() {
		assert_eq!(
			mhz_from_brand_string("Intel(R) Core(TM) i7-4770 CPU @ 3.40GHz"),
			Some(3400)
		);
		assert_eq!(
			mhz_from_brand_string("Intel(R) Xeon(R) CPU E5-2650 v3 @ 2.30GHz"),
			Some(2300)
		);
	}

	#[test]
	fn brand_string_without_frequency() {
		assert_eq!(mhz_from_brand_string("QEMU Virtual CPU version 2.5+"), None);
		assert_eq!(mhz_from_brand_string("GHz"), None);
		assert_eq!(mhz_from_brand_string(""), None);
	}

	#[test]
	fn malformed_frequency_is_rejected() {
		assert_eq!(mhz_from_brand_string("Fast CPU @ 3x40GHz"), None);
	}
}
