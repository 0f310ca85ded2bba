/// Maximum number of logical CPUs managed by the kernel.
/// MADT entries beyond this limit are ignored.
pub const MAX_CPUS: usize = 16;

/// Stack size of every application processor.
pub const AP_STACK_SIZE: usize = 8192;

/// Stack size of the boot processor until it enters the idle loop.
pub const BOOT_STACK_SIZE: usize = 32 * 1024;

/// Size of the kernel heap window placed right behind the frame bitmap.
pub const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound of physical memory managed by the frame allocator.
pub const MAX_PHYSICAL_MEMORY: usize = 64 * 1024 * 1024;

/// Maximum number of records kept from the boot loader's memory map.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 32;

/// I/O port base of the COM1 UART.
pub const SERIAL_PORT_BASE: u16 = 0x3F8;

/// Interrupt vector driven by the Local APIC timer on every CPU.
pub const TIMER_INTERRUPT_NUMBER: u8 = 32;

/// Interrupt vector announced in the Spurious Vector Register.
pub const SPURIOUS_INTERRUPT_NUMBER: u8 = 255;

/// Target frequency of the periodic APIC timer.
pub const TIMER_FREQUENCY_HZ: u64 = 10;
