
use assert_cmd::Command;
use assert_cmd::assert::Assert;


pub const BIN_NAME: &'static str = "gctf-runner";


pub fn cmd() -> Command {
	match Command::cargo_bin(BIN_NAME) {
		Ok(cmd) => cmd,
		Err(e) => panic!("Failed to find binary: {}", e)
	}
}


pub trait AssertExt {
	fn print_stdout(self) -> Self;
	fn print_stderr(self) -> Self;
}

impl AssertExt for Assert {

	fn print_stdout(self) -> Self {
		println!("STDOUT:\n{}", String::from_utf8_lossy(self.get_output().stdout.as_slice()));
		self
	}

	fn print_stderr(self) -> Self {
		println!("STDERR:\n{}", String::from_utf8_lossy(self.get_output().stderr.as_slice()));
		self
	}
}
