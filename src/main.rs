
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use gumdrop::Options;
use tracing::info;

use gctf_runner::batch;
use gctf_runner::config::JobConfig;
use gctf_runner::convert::MrcConverter;
use gctf_runner::ctf;
use gctf_runner::logging::{self, ResultExt};
use gctf_runner::protocols::{micrographs, refine, tilt_series, OutputLayout};
use gctf_runner::protocols::micrographs::RecalcHints;
use gctf_runner::protocols::refine::ParticleSet;
use gctf_runner::star;


#[derive(Options)]
struct Args {

	/// print help message
	#[options()]
	help: bool,

	/// settings for log output
	#[options(default = "gctf_runner=info")]
	log: String,

	#[options(command)]
	cmd: Option<Command>
}


#[derive(Options)]
enum Command {

	/// estimate whole-image CTF for a set of micrographs
	Estimate(ArgsJob),

	/// refine per-particle local CTF
	Refine(ArgsJob),

	/// estimate per-tilt CTF for tilt series
	TiltSeries(ArgsJob),

	/// redo one micrograph with operator-picked bounds
	Recalculate(ArgsRecalculate),

	/// collect CTF records from an earlier run's logs
	Import(ArgsJob)
}


#[derive(Options)]
struct ArgsJob {

	/// print help message
	#[options()]
	help: bool,

	/// path to the job file
	#[options(free, required, parse(try_from_str))]
	job: PathBuf
}


#[derive(Options)]
struct ArgsRecalculate {

	/// print help message
	#[options()]
	help: bool,

	/// path to the job file
	#[options(free, required, parse(try_from_str))]
	job: PathBuf,

	/// micrograph to redo, by path or base name, must be listed in the job file
	#[options(required)]
	micrograph: String,

	/// first defocus bound, in Angstroms
	#[options(required)]
	defocus_u: f64,

	/// second defocus bound, in Angstroms
	#[options(required)]
	defocus_v: f64,

	/// digital frequency of the low-resolution ring, in 1/pixels
	#[options(required)]
	low_freq: f64,

	/// digital frequency of the high-resolution ring, in 1/pixels
	#[options(required)]
	high_freq: f64
}


fn main() -> ExitCode {

	// parse arguments
	let args = Args::parse_args_default_or_exit();

	// init logging
	let Ok(_) = logging::init(&args.log)
		.log_err()
		else { return ExitCode::FAILURE; };

	// handle the commands
	let result = match args.cmd {
		Some(Command::Estimate(args)) => estimate(args),
		Some(Command::Refine(args)) => refine_particles(args),
		Some(Command::TiltSeries(args)) => estimate_tilt_series(args),
		Some(Command::Recalculate(args)) => recalculate(args),
		Some(Command::Import(args)) => import(args),
		None => {
			println!("No command given");
			return ExitCode::FAILURE;
		}
	};

	let Ok(_) = result
		.log_err()
		else { return ExitCode::FAILURE; };

	ExitCode::SUCCESS
}


fn estimate(args: ArgsJob) -> Result<()> {

	let config = JobConfig::read(&args.job)?;
	let layout = OutputLayout::create(&config.job.output_dir)?;

	micrographs::run(
		&config.env,
		&MrcConverter,
		&config.params,
		&config.job,
		&config.micrographs,
		&layout
	)?;

	Ok(())
}


fn refine_particles(args: ArgsJob) -> Result<()> {

	let config = JobConfig::read(&args.job)?;
	let layout = OutputLayout::create(&config.job.output_dir)?;

	let sets = config.micrographs.iter()
		.map(ParticleSet::load)
		.collect::<Result<Vec<_>>>()?;

	let seeds = match config.refine.use_input_ctf {
		true => {
			let dir = config.import_logs.as_ref()
				.context("local.use_input_ctf needs an [import] section naming the previous run's logs")?;
			Some(refine::load_seeds(dir, &sets)?)
		}
		false => None
	};

	refine::run(
		&config.env,
		&MrcConverter,
		&config.params,
		&config.job,
		&config.local,
		&config.refine,
		seeds.as_ref(),
		&sets,
		&layout
	)?;

	Ok(())
}


fn estimate_tilt_series(args: ArgsJob) -> Result<()> {

	let config = JobConfig::read(&args.job)?;
	let layout = OutputLayout::create(&config.job.output_dir)?;

	tilt_series::run(
		&config.env,
		&MrcConverter,
		&config.params,
		&config.job,
		&config.tilt_series,
		&layout
	)?;

	Ok(())
}


fn recalculate(args: ArgsRecalculate) -> Result<()> {

	let config = JobConfig::read(&args.job)?;
	let layout = OutputLayout::create(&config.job.output_dir)?;

	// accept either the full path or just the base name
	let mic = config.micrographs.iter()
		.find(|m| {
			m.path == Path::new(&args.micrograph)
				|| batch::image_base(&m.path) == args.micrograph
		})
		.with_context(|| format!("Micrograph {} is not listed in the job file", args.micrograph))?;

	let hints = RecalcHints {
		defocus_u: args.defocus_u,
		defocus_v: args.defocus_v,
		low_freq: args.low_freq,
		high_freq: args.high_freq
	};

	let result = micrographs::recalculate(
		&config.env,
		&MrcConverter,
		&config.params,
		&config.job,
		mic,
		&hints,
		&layout
	)?;

	info!(
		"Recalculated CTF for {}: defocus {:.2} x {:.2} A at {:.2} deg",
		result.base,
		result.record.defocus_u,
		result.record.defocus_v,
		result.record.defocus_angle
	);

	Ok(())
}


fn import(args: ArgsJob) -> Result<()> {

	let config = JobConfig::read(&args.job)?;
	let layout = OutputLayout::create(&config.job.output_dir)?;

	let dir = config.import_logs.as_ref()
		.context("Importing needs an [import] section naming the logs folder")?;

	let mut rows = Vec::with_capacity(config.micrographs.len());
	let mut found = 0;
	for mic in &config.micrographs {

		let base = batch::image_base(&mic.path);
		let log = dir.join(format!("{}_gctf.log", base));
		let record = ctf::parse_log(&log)?;

		if !record.is_failed() {
			found += 1;
			if let Some(psd) = ctf::find_psd_file(&log) {
				info!("Found power spectrum for {}: {}", base, psd.to_string_lossy());
			}
		}
		rows.push((base, record));
	}

	if found == 0 {
		bail!("No importable CTF records in: {}", dir.to_string_lossy());
	}

	star::write_ctf_star(layout.extra(micrographs::CTF_STAR), &rows)?;
	info!("Imported {} of {} CTF records", found, rows.len());

	Ok(())
}
