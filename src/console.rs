use core::fmt;

use hermit_sync::InterruptSpinMutex;

pub struct Console(());

/// A collection of methods that are required to format
/// a message to the kernel's console.
impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		if !s.is_empty() {
			crate::arch::kernel::output_message_buf(s.as_bytes());
		}
		Ok(())
	}
}

pub static CONSOLE: InterruptSpinMutex<Console> = InterruptSpinMutex::new(Console(()));
