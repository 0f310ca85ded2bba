use log::{set_logger, set_max_level, LevelFilter, Metadata, Record};

/// Forwards kernel messages to the console.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {
		// The console is unbuffered, nothing to flush.
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			println!("[{}][{}] {}", crate::arch::core_id(), record.level(), record.args());
		}
	}
}

pub unsafe fn init() {
	set_logger(&LOGGER).expect("Can't initialize logger");
	// Determines LevelFilter at compile time
	let log_level: Option<&'static str> = option_env!("EMBER_LOG");
	let max_level: LevelFilter = match log_level {
		Some("error") => LevelFilter::Error,
		Some("debug") => LevelFilter::Debug,
		Some("off") => LevelFilter::Off,
		Some("trace") => LevelFilter::Trace,
		Some("warn") => LevelFilter::Warn,
		Some("info") => LevelFilter::Info,
		_ => LevelFilter::Info,
	};
	set_max_level(max_level);
}
