
pub mod micrographs;
pub mod refine;
pub mod tilt_series;

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use display_error_chain::ErrorChainExt;
use tracing::error;

use crate::batch::BatchError;
use crate::command::{CtfOverrides, CtfParams};
use crate::ctf::CtfRecord;
use crate::tool::ToolEnvironment;


/// One micrograph named by a job file.
#[derive(Debug, Clone)]
pub struct MicrographInput {

	pub path: PathBuf,

	/// particle picks for this micrograph, only used by local refinement
	pub coordinates: Option<PathBuf>
}


/// One tilt series named by a job file.
#[derive(Debug, Clone)]
pub struct TiltSeriesInput {

	pub id: String,

	/// the tilt images, one file each, in acquisition order
	pub images: Vec<PathBuf>,

	/// nominal stage angles, parallel to `images`
	pub angles: Option<Vec<f64>>
}


/// Whole-image estimation result for one input image.
#[derive(Debug, Clone)]
pub struct MicrographCtf {
	pub base: String,
	pub source: PathBuf,
	pub record: CtfRecord,
	pub psd: PathBuf,
	pub log: PathBuf
}


/// The output folder layout shared by every protocol:
/// `extra/` collects the results worth keeping, `tmp/` is per-batch scratch space.
pub struct OutputLayout {
	root: PathBuf
}

impl OutputLayout {

	pub fn create(root: impl Into<PathBuf>) -> Result<Self> {

		let layout = Self {
			root: root.into()
		};

		for dir in [layout.extra_dir(), layout.tmp_dir()] {
			fs::create_dir_all(&dir)
				.context(format!("Failed to create output folder: {}", dir.to_string_lossy()))?;
		}

		Ok(layout)
	}

	pub fn extra_dir(&self) -> PathBuf {
		self.root.join("extra")
	}

	pub fn tmp_dir(&self) -> PathBuf {
		self.root.join("tmp")
	}

	pub fn extra(&self, name: impl AsRef<str>) -> PathBuf {
		self.extra_dir().join(name.as_ref())
	}

	pub fn tmp(&self, name: impl AsRef<str>) -> PathBuf {
		self.tmp_dir().join(name.as_ref())
	}

	/// the power spectrum image, for screening
	pub fn psd_path(&self, base: &str) -> PathBuf {
		self.extra(format!("{}_ctf.mrc", base))
	}

	/// the tool log holding the estimated values
	pub fn ctf_log_path(&self, base: &str) -> PathBuf {
		self.extra(format!("{}_ctf.log", base))
	}

	/// raw tool log parked in scratch space, the tilt series protocol keeps them here
	pub fn tmp_log_path(&self, base: &str) -> PathBuf {
		self.tmp(format!("{}_gctf.log", base))
	}

	/// the EPA fit profile
	pub fn epa_log_path(&self, base: &str) -> PathBuf {
		self.extra(format!("{}_ctf_EPA.log", base))
	}

	/// per-particle defocus table from local refinement
	pub fn local_star_path(&self, base: &str) -> PathBuf {
		self.extra(format!("{}_local.star", base))
	}
}


/// Overrides shared by every protocol run: when inputs are downscaled, the
/// physical detector step has to scale along with the pixel size.
pub(crate) fn scan_overrides(params: &CtfParams) -> CtfOverrides {
	if params.down_factor != 1.0 {
		CtfOverrides {
			scanned_pixel_size: Some(params.scanned_pixel_size*params.down_factor),
			..CtfOverrides::none()
		}
	} else {
		CtfOverrides::none()
	}
}


/// A failed batch degrades the run but never aborts it: log it and move on.
pub(crate) fn log_batch_error(env: &ToolEnvironment, err: &BatchError) {
	match err {
		BatchError::Subprocess { glob, .. } => {
			// keep the log line operators grep for
			error!("ERROR: {} has failed on {}", env.executable, glob);
		}
		other => {
			error!("Skipping batch: {}", other.chain());
		}
	}
}
