pub mod acpi;
pub mod apic;
pub mod gdt;
pub mod interrupts;
pub mod pic;
pub mod processor;
pub mod serial;
pub mod smp;
pub mod smp_boot_code;
#[cfg(target_os = "none")]
mod start;

use hermit_sync::InterruptSpinMutex;

use self::serial::SerialPort;
use crate::config::{
	SERIAL_PORT_BASE, TIMER_FREQUENCY_HZ, TIMER_INTERRUPT_NUMBER,
};
use crate::errors::KernelError;

/// Serial port to print kernel messages
pub(crate) static COM1: InterruptSpinMutex<Option<SerialPort>> = InterruptSpinMutex::new(None);

/// Earliest initialization function called by the boot processor.
pub fn message_output_init() {
	let serial_port = unsafe { SerialPort::new(SERIAL_PORT_BASE) };
	*COM1.lock() = Some(serial_port);
}

pub fn output_message_buf(buf: &[u8]) {
	if let Some(serial) = COM1.lock().as_mut() {
		serial.send(buf);
	}
}

/// Initialization of the boot processor after the console is usable:
/// memory, descriptor tables, processor features, ACPI topology and the
/// Local APIC, in that order.
pub fn boot_processor_init(boot_info_address: u64) -> Result<(), KernelError> {
	crate::env::init(boot_info_address)?;
	processor::detect_features();
	crate::mm::init()?;

	gdt::init();
	gdt::load();
	interrupts::install();
	interrupts::load_idt();

	processor::detect_frequency();
	processor::print_information();

	acpi::init()?;
	apic::init()?;
	smp::init_cpu_table()?;
	smp::mark_boot_processor_online();

	crate::mm::print_information();
	Ok(())
}

/// Boots all application processors and waits for them with a fixed
/// deadline. Short counts degrade to warnings.
pub fn boot_application_processors() -> Result<(), KernelError> {
	smp::boot_application_processors()?;
	smp::wait_for_all_cpus_online();
	apic::print_information();
	Ok(())
}

/// Starts the periodic timer of the executing CPU at the configured
/// frequency.
pub fn start_cpu_timer() {
	apic::start_periodic_timer(
		TIMER_INTERRUPT_NUMBER,
		apic::APIC_TIMER_DIVIDE_BY_16,
		apic::timer_initial_count_for_hz(TIMER_FREQUENCY_HZ),
	);
}
