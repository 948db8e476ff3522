
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::warn;


// markers in the Gctf log output
const FINAL_VALUES: &'static str = "Final Values";
const RESOLUTION_LIMIT: &'static str = "Resolution limit estimated by EPA";

// Gctf colors the resolution line on some terminals
static ANSI_ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new("\x1b[^m]*m")
		.expect("failed to compile ANSI escape pattern")
});


/// One micrograph's estimated CTF, as reported by the Gctf log.
/// Defocus values and the resolution limit are in Angstroms, angles in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct CtfRecord {
	pub defocus_u: f64,
	pub defocus_v: f64,
	pub defocus_angle: f64,
	pub correlation: f64,
	pub phase_shift: Option<f64>,
	pub resolution: f64
}

impl CtfRecord {

	/// Placeholder for a micrograph whose log never appeared.
	/// The values are deliberately impossible so downstream screening can find them.
	pub fn failed() -> Self {
		Self {
			defocus_u: -999.0,
			defocus_v: -1.0,
			defocus_angle: -999.0,
			correlation: -999.0,
			phase_shift: None,
			resolution: -999.0
		}
	}

	pub fn is_failed(&self) -> bool {
		self.defocus_u == -999.0 && self.correlation == -999.0
	}

	pub fn min_defocus(&self) -> f64 {
		f64::min(self.defocus_u, self.defocus_v)
	}

	pub fn max_defocus(&self) -> f64 {
		f64::max(self.defocus_u, self.defocus_v)
	}
}


/// Reads the estimated CTF out of a Gctf log file.
///
/// A missing log means the tool failed on that micrograph, which degrades the
/// result but shouldn't abort a whole run, so it maps to `CtfRecord::failed()`.
/// A log that exists but has garbage where numbers should be is a real error.
pub fn parse_log(path: impl AsRef<Path>) -> Result<CtfRecord> {

	let path = path.as_ref();

	if !path.exists() {
		warn!("Missing Gctf log file: {}", path.to_string_lossy());
		return Ok(CtfRecord::failed());
	}

	let text = fs::read_to_string(path)
		.context(format!("Failed to read Gctf log file: {}", path.to_string_lossy()))?;

	let mut record = CtfRecord {
		defocus_u: 0.0,
		defocus_v: 0.0,
		defocus_angle: 0.0,
		correlation: 0.0,
		phase_shift: None,
		resolution: 0.0
	};

	for line in text.lines() {

		if line.contains(FINAL_VALUES) {

			// the line comes in two dialects, depending on whether phase shift was fit:
			//   defU defV angle cc Final Values
			//   defU defV angle phase cc Final Values
			let tokens = line.split_whitespace()
				.collect::<Vec<_>>();
			if tokens.len() < 5 {
				bail!("Unrecognized Final Values line in {}: {}", path.to_string_lossy(), line);
			}

			record.defocus_u = parse_num(tokens[0], path)?;
			record.defocus_v = parse_num(tokens[1], path)?;
			record.defocus_angle = parse_num(tokens[2], path)?;

			if tokens[4] == "Final" {
				record.correlation = parse_num(tokens[3], path)?;
			} else {
				record.correlation = parse_num(tokens[4], path)?;
				let phase_shift = parse_num(tokens[3], path)?;
				// Gctf prints 0.00 when phase shift wasn't actually estimated
				if phase_shift != 0.0 {
					record.phase_shift = Some(phase_shift);
				}
			}

		} else if line.contains(RESOLUTION_LIMIT) {

			// the resolution is the last token, after stripping any terminal colors
			let line = ANSI_ESCAPES.replace_all(line, "");
			let token = line.split_whitespace()
				.last()
				.context(format!("Empty resolution line in {}", path.to_string_lossy()))?;
			record.resolution = parse_num(token, path)?;

			// nothing interesting comes after the resolution line
			break;
		}
	}

	Ok(record)
}


fn parse_num(token: &str, path: &Path) -> Result<f64> {
	token.parse::<f64>()
		.context(format!("Unparseable number {:?} in Gctf log file: {}", token, path.to_string_lossy()))
}


/// Looks for the power spectrum image the tool wrote next to a log file.
/// Gctf names these a few different ways across versions, and logs imported
/// from CTFFIND relabelings show up too, so try all the known conventions.
pub fn find_psd_file(log_path: &Path) -> Option<PathBuf> {

	let folder = log_path.parent()?;
	let base = log_path.file_stem()?
		.to_string_lossy()
		.into_owned();

	const SUFFIXES: [&str; 5] = ["_psd.mrc", ".mrc", "_ctf.mrcs", ".mrcs", ".ctf"];

	for suffix in SUFFIXES {
		let prefixes = [
			base.clone(),
			base.replace("_ctffind3", ""),
			base.replace("_gctf", "")
		];
		for prefix in prefixes {
			let candidate = folder.join(format!("{}{}", prefix, suffix));
			if candidate.is_file() {
				return Some(candidate);
			}
		}
	}

	None
}
