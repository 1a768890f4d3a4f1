use std::env;
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use anstyle::AnsiColor;
use log::{Level, LevelFilter, Metadata, Record};

/// Simple level-colored logger writing single-line records to stderr.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;
static STARTED: OnceLock<Instant> = OnceLock::new();

impl log::Log for StderrLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let style = match record.level() {
			Level::Error => AnsiColor::Red.on_default().bold(),
			Level::Warn => AnsiColor::Yellow.on_default(),
			Level::Info => AnsiColor::Green.on_default(),
			Level::Debug => AnsiColor::Blue.on_default(),
			Level::Trace => AnsiColor::Magenta.on_default(),
		};

		let uptime = STARTED.get_or_init(Instant::now).elapsed();
		let mut stderr = std::io::stderr().lock();
		writeln!(
			stderr,
			"[{:>5}.{:03}] {}{:<5}{:#} {}",
			uptime.as_secs(),
			uptime.subsec_millis(),
			style,
			record.level(),
			style,
			record.args()
		)
		.ok();
	}

	fn flush(&self) {}
}

/// Installs the logger. The level filter comes from the `XOE_LOG` environment
/// variable and defaults to `info`.
pub fn init() {
	STARTED.get_or_init(Instant::now);

	let filter = env::var("XOE_LOG")
		.ok()
		.as_deref()
		.map(|level| match level.to_ascii_lowercase().as_str() {
			"off" => LevelFilter::Off,
			"error" => LevelFilter::Error,
			"warn" => LevelFilter::Warn,
			"debug" => LevelFilter::Debug,
			"trace" => LevelFilter::Trace,
			_ => LevelFilter::Info,
		})
		.unwrap_or(LevelFilter::Info);

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(filter);
	}
}
