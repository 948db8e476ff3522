
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::bail;


/// The Gctf releases this runner knows how to drive.
/// Each release changed the flag surface, so the set is closed on purpose:
/// an unknown version string is an error, never a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ToolVersion {
	V050,
	V106,
	V118
}

impl ToolVersion {

	/// the smoothing and phase-refinement flags only exist from 1.06 on
	pub fn has_refinement_flags(&self) -> bool {
		match self {
			ToolVersion::V050 => false,
			ToolVersion::V106 | ToolVersion::V118 => true
		}
	}

	/// 1.18 dropped per-particle local refinement entirely
	pub fn supports_local_refinement(&self) -> bool {
		match self {
			ToolVersion::V050 | ToolVersion::V106 => true,
			ToolVersion::V118 => false
		}
	}
}

impl FromStr for ToolVersion {

	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self,Self::Err> {
		match s {
			"0.50" => Ok(ToolVersion::V050),
			"1.06" => Ok(ToolVersion::V106),
			"1.18" => Ok(ToolVersion::V118),
			_ => bail!("Unrecognized Gctf version: {} (expected one of 0.50, 1.06, 1.18)", s)
		}
	}
}

impl fmt::Display for ToolVersion {

	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ToolVersion::V050 => "0.50",
			ToolVersion::V106 => "1.06",
			ToolVersion::V118 => "1.18"
		};
		write!(f, "{}", s)
	}
}


/// Where and how to find the Gctf installation.
#[derive(Debug, Clone)]
pub struct ToolEnvironment {

	/// installation folder, the executable lives in `bin/` underneath it
	pub home: PathBuf,

	/// executable filename, Gctf builds are named for their CUDA variant
	pub executable: String,

	pub version: ToolVersion,

	/// optional shell prelude to run before the tool, eg a module load or conda activate
	pub activation: Option<String>,

	/// optional folder to prepend to LD_LIBRARY_PATH, for CUDA runtimes outside the default loader path
	pub cuda_lib: Option<PathBuf>
}

impl ToolEnvironment {

	pub fn program(&self) -> PathBuf {
		self.home.join("bin").join(&self.executable)
	}
}
