use uart_16550::SerialPort as Uart;

/// The COM1 UART, polled byte by byte. `init` programs 38400 baud, 8N1 and
/// enables the FIFOs.
pub struct SerialPort {
	inner: Uart,
}

impl SerialPort {
	pub unsafe fn new(base: u16) -> Self {
		let mut serial = unsafe { Uart::new(base) };
		serial.init();
		Self { inner: serial }
	}

	pub fn send(&mut self, buf: &[u8]) {
		for &data in buf {
			self.inner.send(data);
		}
	}
}
