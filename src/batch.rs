
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

use crate::command::GctfCommand;
use crate::convert::ImageConverter;
use crate::tool::ToolEnvironment;


/// What can go wrong while running one batch.
/// The variants are separated so orchestrators can decide skip-vs-abort per cause
/// instead of string-matching error text.
#[derive(Debug, Error)]
pub enum BatchError {

	#[error("failed to prepare batch folder: {}", .path.to_string_lossy())]
	WorkingDir {
		path: PathBuf,
		#[source]
		source: io::Error
	},

	#[error("input image not found: {}", .path.to_string_lossy())]
	InputNotFound {
		path: PathBuf
	},

	#[error("failed to convert input image: {}", .path.to_string_lossy())]
	Convert {
		path: PathBuf,
		#[source]
		source: anyhow::Error
	},

	#[error("{tool} failed on {glob}")]
	Subprocess {
		tool: String,
		glob: String,
		exit: Option<i32>,
		#[source]
		source: Option<io::Error>
	},

	#[error("expected output not found: {}", .path.to_string_lossy())]
	MissingArtifact {
		path: PathBuf
	},

	#[error("failed to move output {} to {}", .from.to_string_lossy(), .to.to_string_lossy())]
	Relocate {
		from: PathBuf,
		to: PathBuf,
		#[source]
		source: io::Error
	}
}


/// A group of input images estimated by a single tool invocation,
/// staged in a private working folder.
pub struct Batch {
	pub working_dir: PathBuf,
	pub images: Vec<BatchImage>
}

/// One image in a batch: where it came from, and the converted
/// copy inside the batch folder that the tool will actually read.
pub struct BatchImage {
	pub source: PathBuf,
	pub base: String,
	pub converted: PathBuf
}

impl Batch {

	pub fn new(working_dir: impl Into<PathBuf>, sources: impl IntoIterator<Item = PathBuf>) -> Result<Self,BatchError> {

		let working_dir = working_dir.into();
		fs::create_dir_all(&working_dir)
			.map_err(|e| BatchError::WorkingDir {
				path: working_dir.clone(),
				source: e
			})?;

		let images = sources.into_iter()
			.map(|source| {
				let base = image_base(&source);
				BatchImage {
					converted: working_dir.join(format!("{}.mrc", base)),
					base,
					source
				}
			})
			.collect();

		Ok(Self {
			working_dir,
			images
		})
	}

	/// the pattern handed to the tool as its input argument, unexpanded:
	/// the tool fans out over matches itself
	pub fn glob(&self) -> String {
		format!("{}/*.mrc", self.working_dir.to_string_lossy())
	}
}


pub fn image_base(path: &Path) -> String {
	path.file_stem()
		.map(|stem| stem.to_string_lossy().into_owned())
		.unwrap_or_default()
}


/// Stage 1: convert every input into the batch folder.
pub fn convert_inputs(batch: &Batch, converter: &dyn ImageConverter, down_factor: f64) -> Result<(),BatchError> {

	for image in &batch.images {

		if !image.source.is_file() {
			return Err(BatchError::InputNotFound {
				path: image.source.clone()
			});
		}

		let result = if down_factor != 1.0 {
			converter.scale_fourier(&image.source, &image.converted, down_factor)
		} else {
			converter.convert(&image.source, &image.converted)
		};
		result.map_err(|e| BatchError::Convert {
			path: image.source.clone(),
			source: e
		})?;

		debug!("Converted input image: {}", image.converted.to_string_lossy());
	}

	Ok(())
}


/// Stage 2: run the tool once over the whole batch.
pub fn invoke_tool(env: &ToolEnvironment, cmd: &GctfCommand, gpu: &str, batch: &Batch) -> Result<(),BatchError> {

	let glob = batch.glob();
	let args = cmd.args(gpu);
	let program = cmd.program();

	info!("Running: {} {} {}", program.to_string_lossy(), args, glob);

	let mut command = match &env.activation {
		Some(activation) => {
			// the activation string is an opaque shell prelude, so the whole
			// invocation goes through a shell, with the glob quoted to keep
			// the shell from expanding it
			let mut command = Command::new("sh");
			command
				.arg("-c")
				.arg(format!("{} && exec {} {} '{}'", activation, program.to_string_lossy(), args, glob));
			command
		}
		None => {
			let mut command = Command::new(program);
			command
				.args(args.split_whitespace())
				.arg(&glob);
			command
		}
	};

	if let Some(cuda_lib) = &env.cuda_lib {
		let lib_path = match std::env::var("LD_LIBRARY_PATH") {
			Ok(existing) if !existing.is_empty() =>
				format!("{}:{}", cuda_lib.to_string_lossy(), existing),
			_ => cuda_lib.to_string_lossy().into_owned()
		};
		command.env("LD_LIBRARY_PATH", lib_path);
	}

	let status = command.status()
		.map_err(|e| BatchError::Subprocess {
			tool: env.executable.clone(),
			glob: glob.clone(),
			exit: None,
			source: Some(e)
		})?;

	if !status.success() {
		return Err(BatchError::Subprocess {
			tool: env.executable.clone(),
			glob,
			exit: status.code(),
			source: None
		});
	}

	Ok(())
}


/// One artifact the tool left in the batch folder, and where it should end up.
pub struct ArtifactMove {
	pub from: PathBuf,
	pub to: PathBuf
}

/// Stage 3: drop the converted inputs and move the tool's outputs to their homes.
pub fn relocate_outputs(batch: &Batch, moves: &[ArtifactMove]) -> Result<(),BatchError> {

	// the converted images served their purpose once the tool has run
	for image in &batch.images {
		let _ = fs::remove_file(&image.converted);
	}

	for m in moves {

		if !m.from.is_file() {
			return Err(BatchError::MissingArtifact {
				path: m.from.clone()
			});
		}

		if let Some(parent) = m.to.parent() {
			fs::create_dir_all(parent)
				.map_err(|e| BatchError::WorkingDir {
					path: parent.to_path_buf(),
					source: e
				})?;
		}

		fs::rename(&m.from, &m.to)
			.map_err(|e| BatchError::Relocate {
				from: m.from.clone(),
				to: m.to.clone(),
				source: e
			})?;
	}

	Ok(())
}


/// Stage 4: remove the batch folder.
/// Only called after a successful run, failed batches keep their folder around
/// so there's something left to look at.
pub fn cleanup(batch: &Batch) {
	let _ = fs::remove_dir_all(&batch.working_dir);
}


/// Runs all four stages in order.
pub fn run(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	cmd: &GctfCommand,
	gpu: &str,
	down_factor: f64,
	batch: &Batch,
	moves: &[ArtifactMove]
) -> Result<(),BatchError> {

	convert_inputs(batch, converter, down_factor)?;
	invoke_tool(env, cmd, gpu, batch)?;
	relocate_outputs(batch, moves)?;
	cleanup(batch);

	Ok(())
}
