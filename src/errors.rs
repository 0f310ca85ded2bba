use thiserror::Error;

/// All error conditions the bring-up core can report.
///
/// The first four kinds are fatal while the kernel initializes itself and
/// halt the boot processor with a message. IPI and AP failures are isolated
/// to the affected processor and never stop the remaining CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
	#[error("boot information is missing or malformed")]
	BootInfoMalformed,
	#[error("no ACPI RSDP or MADT present")]
	AcpiMissing,
	#[error("ACPI table checksum mismatch")]
	AcpiChecksum,
	#[error("out of physical memory")]
	OutOfMemory,
	#[error("IPI delivery status did not clear")]
	IpiDeliveryTimeout,
	#[error("cpu {cpu} did not come online before the deadline")]
	ApNotOnline { cpu: usize },
}
