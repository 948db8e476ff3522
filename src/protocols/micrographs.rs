
use std::ops::Deref;

use anyhow::{bail, Result};
use display_error_chain::ErrorChainExt;
use tracing::{error, info, warn};

use crate::batch::{self, ArtifactMove, Batch, BatchError};
use crate::command::{CtfOverrides, CtfParams, GctfCommand};
use crate::config::JobParams;
use crate::convert::ImageConverter;
use crate::ctf;
use crate::star;
use crate::tool::ToolEnvironment;

use super::{log_batch_error, scan_overrides, MicrographCtf, MicrographInput, OutputLayout};


/// summary table of every estimate, written under extra/
pub const CTF_STAR: &'static str = "micrographs_ctf.star";


/// Estimates the CTF of every micrograph, batch by batch.
///
/// Failed batches are logged and skipped, and their micrographs surface as
/// `CtfRecord::failed()` placeholders in the output. Only a run where nothing
/// at all could be estimated is an error.
pub fn run(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	params: &CtfParams,
	job: &JobParams,
	micrographs: &[MicrographInput],
	layout: &OutputLayout
) -> Result<Vec<MicrographCtf>> {

	if micrographs.is_empty() {
		bail!("No micrographs to estimate");
	}

	info!(
		"Estimating CTF for {} micrographs, in batches of {}",
		micrographs.len(), job.batch_size
	);

	// one command serves every batch, only the gpu id changes per invocation
	let cmd = GctfCommand::estimate(env, params, &scan_overrides(params));

	for (i, group) in micrographs.chunks(job.batch_size).enumerate() {
		let gpu = job.gpus[i % job.gpus.len()].to_string();
		let first_id = i*job.batch_size + 1;
		if let Err(e) = run_batch(env, converter, &cmd, &gpu, params, group, first_id, layout) {
			log_batch_error(env, &e);
		}
	}

	collect(params, micrographs, layout)
}


fn batch_dir_name(first_id: usize, count: usize) -> String {
	if count == 1 {
		format!("mic_{:06}", first_id)
	} else {
		format!("mic_{:06}-{:06}", first_id, first_id + count - 1)
	}
}


fn run_batch(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	cmd: &GctfCommand,
	gpu: &str,
	params: &CtfParams,
	group: &[MicrographInput],
	first_id: usize,
	layout: &OutputLayout
) -> Result<(),BatchError> {

	let batch = Batch::new(
		layout.tmp(batch_dir_name(first_id, group.len())),
		group.iter().map(|m| m.path.clone())
	)?;

	let mut moves = Vec::with_capacity(batch.images.len()*3);
	for image in &batch.images {
		moves.push(ArtifactMove {
			from: batch.working_dir.join(format!("{}{}", image.base, params.psd_ext())),
			to: layout.psd_path(&image.base)
		});
		moves.push(ArtifactMove {
			from: batch.working_dir.join(format!("{}_gctf.log", image.base)),
			to: layout.ctf_log_path(&image.base)
		});
		if params.epa.enabled {
			moves.push(ArtifactMove {
				from: batch.working_dir.join(format!("{}_EPA.log", image.base)),
				to: layout.epa_log_path(&image.base)
			});
		}
	}

	batch::run(env, converter, cmd, gpu, params.down_factor, &batch, &moves)
}


fn collect(
	params: &CtfParams,
	micrographs: &[MicrographInput],
	layout: &OutputLayout
) -> Result<Vec<MicrographCtf>> {

	let mut results = Vec::with_capacity(micrographs.len());
	let mut usable = 0;

	for mic in micrographs {

		let base = batch::image_base(&mic.path);
		let log = layout.ctf_log_path(&base);

		match ctf::parse_log(&log) {
			Ok(record) => {
				if record.is_failed() {
					warn!("No CTF estimate for micrograph: {}", base);
				} else {
					usable += 1;
				}
				results.push(MicrographCtf {
					psd: layout.psd_path(&base),
					log,
					base,
					source: mic.path.clone(),
					record
				});
			}
			Err(e) => {
				// a garbled log taints just that one micrograph
				error!("{}", e.deref().chain());
			}
		}
	}

	if usable == 0 {
		bail!("No usable CTF estimate came out of {} micrographs", micrographs.len());
	}

	let rows = results.iter()
		.map(|r| (r.base.clone(), r.record.clone()))
		.collect::<Vec<_>>();
	star::write_ctf_star(layout.extra(CTF_STAR), &rows)?;

	info!("Estimated CTF for {} of {} micrographs", usable, micrographs.len());

	Ok(results)
}


/// Settings for redoing one micrograph, picked interactively from a previous fit:
/// the defocus values bound the new search, and the ring frequencies picked on
/// the power spectrum bound the resolution band.
#[derive(Debug, Clone)]
pub struct RecalcHints {
	pub defocus_u: f64,
	pub defocus_v: f64,
	/// digital frequency of the outermost low-resolution ring, in 1/pixels
	pub low_freq: f64,
	/// digital frequency of the innermost high-resolution ring, in 1/pixels
	pub high_freq: f64
}


/// Re-estimates a single micrograph with search bounds derived from `hints`.
/// Unlike the batched run, any failure here is an error: the caller asked for
/// this specific image.
pub fn recalculate(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	params: &CtfParams,
	job: &JobParams,
	mic: &MicrographInput,
	hints: &RecalcHints,
	layout: &OutputLayout
) -> Result<MicrographCtf> {

	if hints.low_freq <= 0.0 || hints.high_freq <= 0.0 {
		bail!("Ring frequencies must be positive, got {} and {}", hints.low_freq, hints.high_freq);
	}

	let base = batch::image_base(&mic.path);
	info!("Recalculating CTF for micrograph: {}", base);

	// turn the picked rings back into resolutions
	let sampling = params.effective_pixel_size();
	let extra = CtfOverrides {
		scanned_pixel_size: scan_overrides(params).scanned_pixel_size,
		low_res: Some(sampling/hints.low_freq),
		high_res: Some(sampling/hints.high_freq),
		min_defocus: Some(f64::min(hints.defocus_u, hints.defocus_v)),
		max_defocus: Some(f64::max(hints.defocus_u, hints.defocus_v)),
		step_defocus: Some(500.0)
	};
	let cmd = GctfCommand::estimate(env, params, &extra);

	let gpu = job.gpus[0].to_string();
	run_batch(env, converter, &cmd, &gpu, params, std::slice::from_ref(mic), 1, layout)?;

	let log = layout.ctf_log_path(&base);
	let record = ctf::parse_log(&log)?;
	if record.is_failed() {
		bail!("Recalculation produced no estimate for: {}", base);
	}

	Ok(MicrographCtf {
		psd: layout.psd_path(&base),
		log,
		base,
		source: mic.path.clone(),
		record
	})
}
