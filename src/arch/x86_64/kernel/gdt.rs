//! A flat kernel GDT shared by all CPUs.
//!
//! Application processors leave the trampoline on a throwaway GDT in low
//! memory, so every CPU switches to this table before it loads the IDT.
//! That also guarantees that the code selector captured in the interrupt
//! gates is valid on every CPU.

use hermit_sync::OnceCell;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

struct Selectors {
	code: SegmentSelector,
	data: SegmentSelector,
}

static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::new();

pub fn init() {
	let mut gdt = GlobalDescriptorTable::new();
	let code = gdt.append(Descriptor::kernel_code_segment());
	let data = gdt.append(Descriptor::kernel_data_segment());

	if GDT.set((gdt, Selectors { code, data })).is_err() {
		panic!("GDT initialized twice");
	}
}

/// Activates the kernel GDT on the current CPU and reloads all segment
/// registers accordingly.
pub fn load() {
	let (gdt, selectors) = GDT.get().expect("GDT loaded before init");

	gdt.load();
	unsafe {
		CS::set_reg(selectors.code);
		SS::set_reg(selectors.data);
		DS::set_reg(selectors.data);
		ES::set_reg(selectors.data);
	}
}
