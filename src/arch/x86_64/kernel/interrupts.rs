//! The shared Interrupt Descriptor Table and all interrupt entry points.
//!
//! One statically allocated 256-entry table serves every CPU; each CPU
//! executes `lidt` on it once via [`load_idt`]. Vectors 0-31 carry
//! dedicated exception handlers, vector 32 is the APIC timer, vector 255
//! the spurious vector, and everything else falls into a generic handler
//! that just returns.

use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::InterruptSpinMutex;
use x86_64::registers::control::Cr2;
use x86_64::set_general_handler;
use x86_64::structures::idt::{InterruptDescriptorTable, PageFaultErrorCode};

use crate::arch::x86_64::kernel::{apic, processor, smp};
use crate::config::{MAX_CPUS, SPURIOUS_INTERRUPT_NUMBER, TIMER_INTERRUPT_NUMBER};

pub use x86_64::instructions::interrupts::{disable, enable};
pub use x86_64::structures::idt::InterruptStackFrame as ExceptionStackFrame;

static IDT: InterruptSpinMutex<InterruptDescriptorTable> =
	InterruptSpinMutex::new(InterruptDescriptorTable::new());

/// Timer interrupts taken per CPU, indexed by the logical CPU index.
static TIMER_TICKS: [AtomicU64; MAX_CPUS] = {
	const TICKS: AtomicU64 = AtomicU64::new(0);
	[TICKS; MAX_CPUS]
};

/// Timer interrupts taken across all CPUs.
static GLOBAL_TIMER_CALLS: AtomicU64 = AtomicU64::new(0);

/// CPU exceptions taken across all CPUs, breakpoints included.
static EXCEPTION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Points the current CPU's IDTR at the shared table.
pub fn load_idt() {
	unsafe {
		IDT.lock().load_unsafe();
	}
}

/// Fills the shared IDT. Called once on the boot processor, before any CPU
/// loads the table.
pub fn install() {
	let mut guard = IDT.lock();
	let idt = &mut *guard;

	set_general_handler!(idt, abort, 0..32);
	set_general_handler!(idt, unhandled, 33..255);

	idt.divide_error.set_handler_fn(divide_error_exception);
	idt.debug.set_handler_fn(debug_exception);
	idt.non_maskable_interrupt.set_handler_fn(nmi_exception);
	idt.breakpoint.set_handler_fn(breakpoint_exception);
	idt.overflow.set_handler_fn(overflow_exception);
	idt.bound_range_exceeded
		.set_handler_fn(bound_range_exceeded_exception);
	idt.invalid_opcode.set_handler_fn(invalid_opcode_exception);
	idt.device_not_available
		.set_handler_fn(device_not_available_exception);
	idt.double_fault.set_handler_fn(double_fault_exception);
	idt.invalid_tss.set_handler_fn(invalid_tss_exception);
	idt.segment_not_present
		.set_handler_fn(segment_not_present_exception);
	idt.stack_segment_fault
		.set_handler_fn(stack_segment_fault_exception);
	idt.general_protection_fault
		.set_handler_fn(general_protection_exception);
	idt.page_fault.set_handler_fn(page_fault_handler);
	idt.x87_floating_point
		.set_handler_fn(floating_point_exception);
	idt.alignment_check.set_handler_fn(alignment_check_exception);
	idt.machine_check.set_handler_fn(machine_check_exception);
	idt.simd_floating_point
		.set_handler_fn(simd_floating_point_exception);
	idt.virtualization.set_handler_fn(virtualization_exception);

	idt[TIMER_INTERRUPT_NUMBER].set_handler_fn(timer_interrupt);
	idt[SPURIOUS_INTERRUPT_NUMBER].set_handler_fn(spurious_interrupt);
}

/// Ticks taken by the given CPU since its timer was started.
pub fn timer_ticks(core_id: usize) -> u64 {
	TIMER_TICKS[core_id].load(Ordering::SeqCst)
}

pub fn global_timer_calls() -> u64 {
	GLOBAL_TIMER_CALLS.load(Ordering::SeqCst)
}

pub fn exception_count() -> u64 {
	EXCEPTION_COUNT.load(Ordering::SeqCst)
}

extern "x86-interrupt" fn timer_interrupt(_stack_frame: ExceptionStackFrame) {
	let core_id = smp::current_cpu_index();
	if core_id < MAX_CPUS {
		TIMER_TICKS[core_id].fetch_add(1, Ordering::SeqCst);
	}
	GLOBAL_TIMER_CALLS.fetch_add(1, Ordering::SeqCst);
	apic::eoi();
}

extern "x86-interrupt" fn spurious_interrupt(_stack_frame: ExceptionStackFrame) {
	// A spurious interrupt must not be acknowledged with an EOI.
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Catch-all for vectors without a dedicated handler: the entry returns
/// right away, leaving nothing but a log line.
fn unhandled(_stack_frame: ExceptionStackFrame, index: u8, _error_code: Option<u64>) {
	warn!("Received unhandled interrupt {index}");
	apic::eoi();
}

/// Catch-all for exception vectors that slip through without a dedicated
/// handler below. Anything landing here is fatal for this CPU.
fn abort(stack_frame: ExceptionStackFrame, index: u8, error_code: Option<u64>) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!(
		"Unexpected exception {} (error code {:?}) at {:p}",
		index, error_code, stack_frame.instruction_pointer
	);
	processor::halt_forever();
}

extern "x86-interrupt" fn divide_error_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!(
		"Divide Error (#DE) Exception at {:p}",
		stack_frame.instruction_pointer
	);
	processor::halt_forever();
}

extern "x86-interrupt" fn debug_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Debug (#DB) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn nmi_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Non-Maskable Interrupt (NMI) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

/// Breakpoints are the one exception the kernel survives: report and
/// continue behind the `int3`.
extern "x86-interrupt" fn breakpoint_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	info!(
		"Breakpoint (#BP) Exception at {:p}, continuing",
		stack_frame.instruction_pointer
	);
}

extern "x86-interrupt" fn overflow_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Overflow (#OF) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn bound_range_exceeded_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("BOUND Range Exceeded (#BR) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn invalid_opcode_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Invalid Opcode (#UD) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn device_not_available_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Device Not Available (#NM) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn double_fault_exception(
	stack_frame: ExceptionStackFrame,
	error_code: u64,
) -> ! {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!(
		"Double Fault (#DF) Exception: {:#?}, error {:#X}",
		stack_frame, error_code
	);
	processor::halt_forever()
}

extern "x86-interrupt" fn invalid_tss_exception(stack_frame: ExceptionStackFrame, _code: u64) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Invalid TSS (#TS) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn segment_not_present_exception(
	stack_frame: ExceptionStackFrame,
	_code: u64,
) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Segment Not Present (#NP) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn stack_segment_fault_exception(
	stack_frame: ExceptionStackFrame,
	error_code: u64,
) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!(
		"Stack Segment Fault (#SS) Exception: {:#?}, error {:#X}",
		stack_frame, error_code
	);
	processor::halt_forever();
}

extern "x86-interrupt" fn general_protection_exception(
	stack_frame: ExceptionStackFrame,
	error_code: u64,
) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!(
		"General Protection (#GP) Exception: {:#?}, error {:#X}",
		stack_frame, error_code
	);
	processor::halt_forever();
}

extern "x86-interrupt" fn page_fault_handler(
	stack_frame: ExceptionStackFrame,
	error_code: PageFaultErrorCode,
) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Page Fault (#PF) Exception!");
	error!("page_fault_linear_address = {:?}", Cr2::read());
	error!("error_code = {error_code:?}");
	error!("stack_frame = {stack_frame:#?}");
	processor::halt_forever();
}

extern "x86-interrupt" fn floating_point_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Floating-Point Error (#MF) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn alignment_check_exception(
	stack_frame: ExceptionStackFrame,
	_code: u64,
) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Alignment Check (#AC) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn machine_check_exception(stack_frame: ExceptionStackFrame) -> ! {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Machine Check (#MC) Exception: {:#?}", stack_frame);
	processor::halt_forever()
}

extern "x86-interrupt" fn simd_floating_point_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("SIMD Floating-Point (#XM) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}

extern "x86-interrupt" fn virtualization_exception(stack_frame: ExceptionStackFrame) {
	EXCEPTION_COUNT.fetch_add(1, Ordering::SeqCst);
	error!("Virtualization (#VE) Exception: {:#?}", stack_frame);
	processor::halt_forever();
}
