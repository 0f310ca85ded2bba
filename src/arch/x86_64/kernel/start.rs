//! Entry point of the boot processor.
//!
//! The loader jumps here in long mode with the physical address of the
//! boot information blob in `rdi`. The stub only establishes a kernel
//! stack and forwards that argument to the Rust side.

use core::arch::global_asm;

use crate::config::BOOT_STACK_SIZE;

#[repr(align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);

#[no_mangle]
static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

global_asm!(
	".section .text._start",
	".global _start",
	"_start:",
	"	cli",
	"	cld",
	"	lea rsp, [rip + {stack}]",
	"	add rsp, {stack_size}",
	"	xor rbp, rbp",
	"	call {pre_init}",
	stack = sym BOOT_STACK,
	stack_size = const BOOT_STACK_SIZE,
	pre_init = sym pre_init,
);

#[no_mangle]
extern "C" fn pre_init(boot_info_address: u64) -> ! {
	crate::boot_processor_main(boot_info_address)
}
