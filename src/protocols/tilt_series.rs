
use std::ops::Deref;
use std::path::PathBuf;

use anyhow::{bail, Result};
use display_error_chain::ErrorChainExt;
use tracing::{error, info, warn};

use crate::batch::{self, ArtifactMove, Batch, BatchError};
use crate::command::{CtfParams, GctfCommand};
use crate::config::JobParams;
use crate::convert::ImageConverter;
use crate::ctf::{self, CtfRecord};
use crate::star;
use crate::tool::ToolEnvironment;

use super::{log_batch_error, scan_overrides, OutputLayout, TiltSeriesInput};


/// Estimation result for one tilt image.
#[derive(Debug, Clone)]
pub struct TiltCtf {
	pub base: String,
	/// 1-based position in the series
	pub index: u32,
	pub angle: Option<f64>,
	pub record: CtfRecord,
	pub psd: PathBuf
}


/// Estimation results for a whole series, in tilt order.
#[derive(Debug, Clone)]
pub struct TiltSeriesCtf {
	pub id: String,
	pub tilts: Vec<TiltCtf>
}

impl TiltSeriesCtf {

	/// per-series summary table, written under extra/
	pub fn star_name(id: &str) -> String {
		format!("{}_ctf.star", id)
	}
}


/// Estimates the CTF of every image of every tilt series.
/// Each series runs as one batch, images of the same series share a GPU.
pub fn run(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	params: &CtfParams,
	job: &JobParams,
	series: &[TiltSeriesInput],
	layout: &OutputLayout
) -> Result<Vec<TiltSeriesCtf>> {

	if series.is_empty() {
		bail!("No tilt series to estimate");
	}

	let tilt_count = series.iter()
		.map(|ts| ts.images.len())
		.sum::<usize>();
	info!("Estimating CTF for {} tilt series, {} images total", series.len(), tilt_count);

	let cmd = GctfCommand::estimate(env, params, &scan_overrides(params));

	for (i, ts) in series.iter().enumerate() {
		let gpu = job.gpus[i % job.gpus.len()].to_string();
		if let Err(e) = run_series(env, converter, &cmd, &gpu, params, ts, layout) {
			log_batch_error(env, &e);
		}
	}

	collect(series, layout)
}


fn run_series(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	cmd: &GctfCommand,
	gpu: &str,
	params: &CtfParams,
	ts: &TiltSeriesInput,
	layout: &OutputLayout
) -> Result<(),BatchError> {

	let batch = Batch::new(layout.tmp(&ts.id), ts.images.iter().cloned())?;

	// unlike the micrograph protocol, the raw tool logs stay in scratch space:
	// per-tilt values get folded into the series star file instead
	let mut moves = Vec::with_capacity(batch.images.len()*3);
	for image in &batch.images {
		moves.push(ArtifactMove {
			from: batch.working_dir.join(format!("{}{}", image.base, params.psd_ext())),
			to: layout.psd_path(&image.base)
		});
		moves.push(ArtifactMove {
			from: batch.working_dir.join(format!("{}_gctf.log", image.base)),
			to: layout.tmp_log_path(&image.base)
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


fn collect(series: &[TiltSeriesInput], layout: &OutputLayout) -> Result<Vec<TiltSeriesCtf>> {

	let mut results = Vec::with_capacity(series.len());
	let mut usable = 0;

	for ts in series {

		let mut tilts = Vec::with_capacity(ts.images.len());
		for (i, image) in ts.images.iter().enumerate() {

			let base = batch::image_base(image);
			let record = match ctf::parse_log(layout.tmp_log_path(&base)) {
				Ok(record) => record,
				Err(e) => {
					// a garbled log taints just that one tilt
					error!("{}", e.deref().chain());
					continue;
				}
			};
			if record.is_failed() {
				warn!("No CTF estimate for tilt image: {}", base);
			} else {
				usable += 1;
			}

			tilts.push(TiltCtf {
				psd: layout.psd_path(&base),
				base,
				index: (i + 1) as u32,
				angle: ts.angles.as_ref().map(|a| a[i]),
				record
			});
		}

		let rows = tilts.iter()
			.map(|t| (t.base.clone(), t.record.clone()))
			.collect::<Vec<_>>();
		star::write_ctf_star(layout.extra(TiltSeriesCtf::star_name(&ts.id)), &rows)?;

		results.push(TiltSeriesCtf {
			id: ts.id.clone(),
			tilts
		});
	}

	if usable == 0 {
		bail!("No usable CTF estimate came out of {} tilt series", series.len());
	}

	info!("Estimated CTF for {} tilt images across {} series", usable, series.len());

	Ok(results)
}
