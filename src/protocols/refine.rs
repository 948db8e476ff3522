
use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use display_error_chain::ErrorChainExt;
use tracing::{error, info, warn};

use crate::batch::{self, ArtifactMove, Batch, BatchError};
use crate::command::{CtfParams, GctfCommand, LocalParams, SeedParams, COORDS_SUFFIX};
use crate::config::{JobParams, RefineOptions};
use crate::convert::ImageConverter;
use crate::ctf::{self, CtfRecord};
use crate::star::{self, Coordinate, CoordinatesWriter, LocalCtf};
use crate::tool::ToolEnvironment;

use super::{log_batch_error, scan_overrides, MicrographInput, OutputLayout};


/// summary table of every refined particle, written under extra/
pub const PARTICLES_STAR: &'static str = "particles_ctf.star";


/// One micrograph and the particles picked on it.
#[derive(Debug, Clone)]
pub struct ParticleSet {
	pub source: PathBuf,
	pub base: String,
	pub particles: Vec<Coordinate>
}

impl ParticleSet {

	pub fn load(mic: &MicrographInput) -> Result<Self> {

		let coords = mic.coordinates.as_ref()
			.with_context(|| format!("Micrograph has no coordinates file: {}", mic.path.to_string_lossy()))?;

		let particles = star::read_coordinates(coords)?;

		Ok(Self {
			base: batch::image_base(&mic.path),
			source: mic.path.clone(),
			particles
		})
	}
}


/// Per-particle refinement results for one micrograph.
#[derive(Debug, Clone)]
pub struct RefinedSet {
	pub base: String,
	pub source: PathBuf,
	pub star: PathBuf,
	pub rows: Vec<LocalCtf>
}


/// Refines the CTF per particle, one micrograph per tool invocation.
///
/// Coordinates are written next to each converted micrograph first, then the
/// tool picks them up through its box suffix convention. Micrographs whose
/// refinement fails are logged and dropped from the output.
pub fn run(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	params: &CtfParams,
	job: &JobParams,
	local: &LocalParams,
	options: &RefineOptions,
	seeds: Option<&HashMap<String,CtfRecord>>,
	sets: &[ParticleSet],
	layout: &OutputLayout
) -> Result<Vec<RefinedSet>> {

	if !env.version.supports_local_refinement() {
		bail!("Gctf {} dropped per-particle local refinement, use 1.06 instead", env.version);
	}
	if sets.is_empty() {
		bail!("No micrographs to refine");
	}

	let particle_count = sets.iter()
		.map(|set| set.particles.len())
		.sum::<usize>();
	info!("Refining local CTF for {} particles on {} micrographs", particle_count, sets.len());

	let scale = match options.particle_pixel_size {
		Some(pps) => pps/params.effective_pixel_size(),
		None => 1.0
	};
	write_coordinates(sets, scale, options.apply_shifts, layout)?;

	// every micrograph runs on its own, the seed values differ per image
	for (i, set) in sets.iter().enumerate() {

		if set.particles.is_empty() {
			continue;
		}

		let seed = match (options.use_input_ctf, seeds) {
			(true, Some(seeds)) => match seeds.get(&set.base) {
				Some(record) => Some(SeedParams {
					defocus_u: record.defocus_u,
					defocus_v: record.defocus_v,
					defocus_angle: record.defocus_angle,
					defocus_u_error: options.defocus_u_error,
					defocus_v_error: options.defocus_v_error,
					angle_error: options.angle_error,
					bfactor_error: options.bfactor_error
				}),
				None => {
					warn!("No previous CTF for micrograph {}, refining unseeded", set.base);
					None
				}
			},
			_ => None
		};
		let cmd = GctfCommand::refine(env, params, &scan_overrides(params), local, seed.as_ref());

		let gpu = job.gpus[i % job.gpus.len()].to_string();
		if let Err(e) = run_one(env, converter, &cmd, &gpu, params, set, layout) {
			log_batch_error(env, &e);
		}
	}

	collect(sets, layout)
}


fn coords_path(layout: &OutputLayout, base: &str) -> PathBuf {
	layout.tmp(base).join(format!("{}{}", base, COORDS_SUFFIX))
}


fn write_coordinates(sets: &[ParticleSet], scale: f64, apply_shifts: bool, layout: &OutputLayout) -> Result<()> {

	let do_scale = (scale - 1.0).abs() > 1e-5;
	if do_scale {
		info!("Scaling coordinates by a factor of {:.2}", scale);
	}

	// one file per micrograph, each closed before the next one opens
	let mut writer: Option<CoordinatesWriter> = None;
	for set in sets {

		if set.particles.is_empty() {
			warn!("Micrograph {} has no particles, skipping", set.base);
			continue;
		}

		if let Some(writer) = writer.take() {
			writer.close()?;
		}
		let mut current = CoordinatesWriter::open(coords_path(layout, &set.base))?;

		for p in &set.particles {
			let mut x = p.x;
			let mut y = p.y;
			if apply_shifts {
				// shifts are subtracted as whole pixels
				x -= p.shift_x.trunc();
				y -= p.shift_y.trunc();
			}
			if do_scale {
				x *= scale;
				y *= scale;
			}
			current.write_coord(x as i64, y as i64)?;
		}

		writer = Some(current);
	}
	if let Some(writer) = writer.take() {
		writer.close()?;
	}

	Ok(())
}


fn run_one(
	env: &ToolEnvironment,
	converter: &dyn ImageConverter,
	cmd: &GctfCommand,
	gpu: &str,
	params: &CtfParams,
	set: &ParticleSet,
	layout: &OutputLayout
) -> Result<(),BatchError> {

	// the batch folder is the same one the coordinates were written into,
	// the tool expects them next to the converted image
	let batch = Batch::new(layout.tmp(&set.base), vec![set.source.clone()])?;

	let base = &set.base;
	let mut moves = vec![
		ArtifactMove {
			// local refinement always writes its power spectrum as <base>.ctf
			from: batch.working_dir.join(format!("{}.ctf", base)),
			to: layout.psd_path(base)
		},
		ArtifactMove {
			from: batch.working_dir.join(format!("{}_gctf.log", base)),
			to: layout.ctf_log_path(base)
		},
		ArtifactMove {
			from: batch.working_dir.join(format!("{}_local.star", base)),
			to: layout.local_star_path(base)
		}
	];
	if params.epa.enabled {
		moves.push(ArtifactMove {
			from: batch.working_dir.join(format!("{}_EPA.log", base)),
			to: layout.epa_log_path(base)
		});
	}

	batch::run(env, converter, cmd, gpu, params.down_factor, &batch, &moves)
}


fn collect(sets: &[ParticleSet], layout: &OutputLayout) -> Result<Vec<RefinedSet>> {

	let mut results = Vec::with_capacity(sets.len());
	let mut refined = 0;

	for set in sets {

		let star_path = layout.local_star_path(&set.base);
		if !star_path.is_file() {
			info!("Ignoring particles from micrograph {}: no local CTF was estimated", set.base);
			continue;
		}

		let rows = match star::read_local_ctf(&star_path) {
			Ok(rows) => rows,
			Err(e) => {
				error!("{}", e.deref().chain());
				continue;
			}
		};
		if rows.len() != set.particles.len() {
			warn!(
				"Micrograph {} has {} particles but {} refined rows",
				set.base, set.particles.len(), rows.len()
			);
		}

		refined += rows.len();
		results.push(RefinedSet {
			base: set.base.clone(),
			source: set.source.clone(),
			star: star_path,
			rows
		});
	}

	if results.is_empty() {
		bail!("No particles were refined across {} micrographs", sets.len());
	}

	let rows = results.iter()
		.flat_map(|set| set.rows.iter().map(|r| (set.base.clone(), r.clone())))
		.collect::<Vec<_>>();
	star::write_local_ctf_star(layout.extra(PARTICLES_STAR), &rows)?;

	info!("Refined local CTF for {} particles across {} micrographs", refined, results.len());

	Ok(results)
}


/// Loads previously estimated whole-micrograph CTFs to seed the refinement,
/// accepting both raw tool logs and logs relocated by an earlier run.
pub fn load_seeds(dir: &Path, sets: &[ParticleSet]) -> Result<HashMap<String,CtfRecord>> {

	let mut seeds = HashMap::new();

	for set in sets {

		let candidates = [
			dir.join(format!("{}_gctf.log", set.base)),
			dir.join(format!("{}_ctf.log", set.base))
		];
		let Some(log) = candidates.iter().find(|p| p.is_file()) else {
			warn!("No previous CTF log for micrograph {} in: {}", set.base, dir.to_string_lossy());
			continue;
		};

		let record = ctf::parse_log(log)?;
		if record.is_failed() {
			continue;
		}
		seeds.insert(set.base.clone(), record);
	}

	Ok(seeds)
}
