//! The two legacy 8259 PICs are only ever disabled: all interrupt routing
//! of the core goes through the Local APICs.

use x86_64::instructions::port::Port;

const PIC1_DATA_PORT: u16 = 0x21;
const PIC2_DATA_PORT: u16 = 0xA1;

/// Masks every line on both PICs so that no legacy IRQ can reach a CPU.
pub fn mask_all() {
	unsafe {
		Port::<u8>::new(PIC1_DATA_PORT).write(0xFF);
		Port::<u8>::new(PIC2_DATA_PORT).write(0xFF);
	}
}
