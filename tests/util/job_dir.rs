
use std::fs;
use std::path::{Path, PathBuf};

use assert_fs::TempDir;


/// A temporary folder holding a job file, its input images, and the outputs of a run.
pub struct JobDir {
	dir: TempDir
}

impl JobDir {

	pub fn new() -> JobDir {
		Self {
			dir: TempDir::new()
				.expect("Failed to make temp folder")
		}
	}

	pub fn path(&self) -> &Path {
		self.dir.path()
	}

	pub fn file(&self, path: impl AsRef<Path>) -> JobFile {
		JobFile {
			_dir: self,
			path: self.dir.path().join(path.as_ref())
		}
	}

	pub fn file_job(&self) -> JobFile {
		self.file("job.toml")
	}

	pub fn mkdir(&self, path: impl AsRef<Path>) -> PathBuf {
		let path = self.dir.path().join(path.as_ref());
		fs::create_dir_all(&path)
			.expect(&format!("Failed to make dir: {}", path.to_string_lossy()));
		path
	}

	pub fn print(&self) {
		let path = self.dir.path();
		println!("Job Folder: {}", path.to_string_lossy());
		print_dir(path, 1);
	}
}

impl AsRef<Path> for JobDir {
	fn as_ref(&self) -> &Path {
		self.dir.path()
	}
}


fn print_dir(path: &Path, depth: usize) {
	let dir = fs::read_dir(path)
		.expect(&format!("Failed to read dir: {}", path.to_string_lossy()));
	for entry in dir {
		match entry {
			Ok(entry) => {
				println!("{}{}", "\t".repeat(depth), entry.file_name().to_string_lossy());
				if entry.path().is_dir() {
					print_dir(&entry.path(), depth + 1);
				}
			}
			Err(e) => println!("{}Error: {}", "\t".repeat(depth), e)
		}
	}
}


pub struct JobFile<'d> {
	_dir: &'d JobDir,
	path: PathBuf
}

impl<'d> JobFile<'d> {

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn write(&self, txt: impl AsRef<str>) {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)
				.expect(&format!("Failed to make dir: {}", parent.to_string_lossy()));
		}
		fs::write(self.path(), txt.as_ref())
			.expect(&format!("Failed to write file: {}", self.path().to_string_lossy()));
	}

	pub fn exists(&self) -> bool {
		self.path.exists()
	}

	pub fn read(&self) -> String {
		fs::read_to_string(self.path())
			.expect(&format!("Failed to read file: {}", self.path().to_string_lossy()))
	}
}
