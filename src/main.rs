use std::process::ExitCode;

fn main() -> ExitCode {
	xoe::logging::init();

	let argv: Vec<String> = std::env::args().collect();
	let code = xoe::fsm::run(argv);
	ExitCode::from(code as u8)
}
