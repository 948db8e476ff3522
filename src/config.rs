
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use toml::Table;

use crate::command::{CtfParams, EpaParams, HighResParams, LocalAverageType, LocalParams, PhaseShiftParams, PhaseShiftTarget};
use crate::protocols::{MicrographInput, TiltSeriesInput};
use crate::tool::{ToolEnvironment, ToolVersion};


// the stock CUDA 8 build, by far the most common install
pub const DEFAULT_EXECUTABLE: &'static str = "Gctf-v1.06_sm_20_cu8.0_x86_64";


/// The contents of a job file, one self-contained description of a run.
///
/// Inputs and acquisition metadata are explicit, estimation settings all
/// have workable defaults, eg:
/// ```toml
/// [job]
/// output_dir = "runs/ctf"
///
/// [tool]
/// home = "/opt/gctf-1.06"
///
/// [scope]
/// pixel_size = 1.34
///
/// [[micrographs]]
/// path = "mics/mic_0001.mrc"
/// ```
#[derive(Debug)]
pub struct JobConfig {
	pub job: JobParams,
	pub env: ToolEnvironment,
	pub params: CtfParams,
	pub local: LocalParams,
	pub refine: RefineOptions,
	pub micrographs: Vec<MicrographInput>,
	pub tilt_series: Vec<TiltSeriesInput>,
	pub import_logs: Option<PathBuf>
}

#[derive(Debug)]
pub struct JobParams {
	pub output_dir: PathBuf,
	pub gpus: Vec<u32>,
	pub workers: u32,
	pub batch_size: usize
}

/// Settings that only matter to per-particle refinement.
#[derive(Debug)]
pub struct RefineOptions {

	/// subtract alignment shifts from coordinates before handing them to the tool
	pub apply_shifts: bool,

	/// pixel size the particles were picked at, when it differs from the micrographs
	pub particle_pixel_size: Option<f64>,

	/// seed the refinement from previously estimated whole-micrograph CTFs
	pub use_input_ctf: bool,

	pub defocus_u_error: f64,
	pub defocus_v_error: f64,
	pub angle_error: f64,
	pub bfactor_error: f64
}

impl JobConfig {

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();
		let toml = fs::read_to_string(path)
			.with_context(|| format!("Failed to read job file at: {}", path.to_string_lossy()))?
			.parse::<Table>()
			.with_context(|| format!("Failed to parse job file at: {}", path.to_string_lossy()))?;

		let job = read_job(&toml)?;
		let env = read_tool(&toml)?;
		let params = read_params(&toml)?;
		let local = read_local(&toml)?;
		let refine = read_refine(&toml)?;
		let micrographs = read_micrographs(&toml)?;
		let tilt_series = read_tilt_series(&toml)?;
		let import_logs = match section(&toml, "import")? {
			Some(import) => path_val(import, "import", "logs")?,
			None => None
		};

		let config = Self {
			job,
			env,
			params,
			local,
			refine,
			micrographs,
			tilt_series,
			import_logs
		};
		config.validate()?;

		Ok(config)
	}

	fn validate(&self) -> Result<()> {

		if self.job.gpus.is_empty() {
			bail!("job.gpus can't be empty, name at least one GPU id");
		}

		// a single worker can't drive more than one GPU
		if (self.job.workers as usize) < self.job.gpus.len() {
			bail!(
				"Fewer workers ({}) than GPUs ({}): each GPU needs its own worker",
				self.job.workers, self.job.gpus.len()
			);
		}

		if self.job.batch_size < 1 {
			bail!("job.batch_size must be at least 1");
		}

		if self.params.pixel_size <= 0.0 {
			bail!("scope.pixel_size must be positive, got {}", self.params.pixel_size);
		}

		if self.params.down_factor < 1.0 {
			bail!("ctf.down_factor must be at least 1, got {}", self.params.down_factor);
		}

		if let Some(phase) = &self.params.phase_shift {
			if !(1 ..= 3).contains(&phase.refine_type) {
				bail!("ctf.phase_shift.refine_type must be 1, 2, or 3, got {}", phase.refine_type);
			}
		}

		Ok(())
	}
}


fn read_job(toml: &Table) -> Result<JobParams> {

	let job = section(toml, "job")?
		.context("Missing [job] section from job file")?;

	let output_dir = path_val(job, "job", "output_dir")?
		.context("Missing job.output_dir")?;

	let gpus = match job.get("gpus") {
		Some(v) => {
			let arr = v.as_array()
				.context("job.gpus is not an array")?;
			arr.iter()
				.map(|v| {
					let id = v.as_integer()
						.context("job.gpus entries must be integers")?;
					u32::try_from(id)
						.context(format!("Invalid GPU id: {}", id))
				})
				.collect::<Result<Vec<_>>>()?
		}
		None => vec![0]
	};

	let workers = match u32_val(job, "job", "workers")? {
		Some(w) => w,
		None => gpus.len() as u32
	};

	let batch_size = match u32_val(job, "job", "batch_size")? {
		Some(b) => b as usize,
		None => 1
	};

	Ok(JobParams {
		output_dir,
		gpus,
		workers,
		batch_size
	})
}


fn read_tool(toml: &Table) -> Result<ToolEnvironment> {

	let tool = section(toml, "tool")?
		.context("Missing [tool] section from job file")?;

	let home = path_val(tool, "tool", "home")?
		.context("Missing tool.home")?;

	let executable = str_val(tool, "tool", "executable")?
		.unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string());

	let version = match str_val(tool, "tool", "version")? {
		Some(v) => v.parse::<ToolVersion>()?,
		None => ToolVersion::V106
	};

	Ok(ToolEnvironment {
		home,
		executable,
		version,
		activation: str_val(tool, "tool", "activation")?,
		cuda_lib: path_val(tool, "tool", "cuda_lib")?
	})
}


fn read_params(toml: &Table) -> Result<CtfParams> {

	let scope = section(toml, "scope")?
		.context("Missing [scope] section from job file")?;

	let pixel_size = f64_val(scope, "scope", "pixel_size")?
		.context("Missing scope.pixel_size")?;
	let voltage = u32_val(scope, "scope", "voltage")?
		.unwrap_or(300);
	let spherical_aberration = f64_val(scope, "scope", "spherical_aberration")?
		.unwrap_or(2.7);
	let amplitude_contrast = f64_val(scope, "scope", "amplitude_contrast")?
		.unwrap_or(0.1);
	let scanned_pixel_size = f64_val(scope, "scope", "scanned_pixel_size")?
		.unwrap_or(14.0);

	let empty = Table::new();
	let ctf = section(toml, "ctf")?
		.unwrap_or(&empty);

	let epa = EpaParams {
		enabled: bool_val(ctf, "ctf", "do_epa")?.unwrap_or(true),
		oversampling: u32_val(ctf, "ctf", "epa_oversampling")?.unwrap_or(4),
		overlap: f64_val(ctf, "ctf", "overlap")?.unwrap_or(0.5),
		convolution_size: u32_val(ctf, "ctf", "convolution_size")?.unwrap_or(85),
		smoothing_res: u32_val(ctf, "ctf", "smoothing_res")?.unwrap_or(1000)
	};

	let phase_shift = match section(ctf, "phase_shift")? {
		Some(phase) => Some(PhaseShiftParams {
			low: f64_val(phase, "ctf.phase_shift", "low")?.unwrap_or(0.0),
			high: f64_val(phase, "ctf.phase_shift", "high")?.unwrap_or(180.0),
			step: f64_val(phase, "ctf.phase_shift", "step")?.unwrap_or(10.0),
			target: match str_val(phase, "ctf.phase_shift", "target")?.as_deref() {
				Some("ccc") | None => PhaseShiftTarget::CrossCorrelation,
				Some("resolution") => PhaseShiftTarget::ResolutionLimit,
				Some(other) => bail!("Unrecognized phase shift target: {} (expected ccc or resolution)", other)
			},
			cosearch_refine: bool_val(phase, "ctf.phase_shift", "cosearch_refine")?.unwrap_or(false),
			refine_type: u32_val(phase, "ctf.phase_shift", "refine_type")?.unwrap_or(1)
		}),
		None => None
	};

	let high_res_refine = match section(ctf, "high_res")? {
		Some(high_res) => Some(HighResParams {
			low: f64_val(high_res, "ctf.high_res", "low")?.unwrap_or(15.0),
			high: f64_val(high_res, "ctf.high_res", "high")?.unwrap_or(4.0),
			bfactor: i64_val(high_res, "ctf.high_res", "bfactor")?.unwrap_or(50)
		}),
		None => None
	};

	Ok(CtfParams {
		pixel_size,
		down_factor: f64_val(ctf, "ctf", "down_factor")?.unwrap_or(1.0),
		voltage,
		spherical_aberration,
		amplitude_contrast,
		scanned_pixel_size,
		window_size: u32_val(ctf, "ctf", "window_size")?.unwrap_or(1024),
		low_res: f64_val(ctf, "ctf", "low_res")?.unwrap_or(50.0),
		high_res: f64_val(ctf, "ctf", "high_res")?.unwrap_or(4.0),
		min_defocus: f64_val(ctf, "ctf", "min_defocus")?.unwrap_or(5000.0),
		max_defocus: f64_val(ctf, "ctf", "max_defocus")?.unwrap_or(90000.0),
		step_defocus: f64_val(ctf, "ctf", "step_defocus")?.unwrap_or(500.0),
		astigmatism: f64_val(ctf, "ctf", "astigmatism")?.unwrap_or(1000.0),
		bfactor: i64_val(ctf, "ctf", "bfactor")?.unwrap_or(150),
		plot_res_ring: bool_val(ctf, "ctf", "plot_res_ring")?.unwrap_or(true),
		do_validation: bool_val(ctf, "ctf", "do_validation")?.unwrap_or(false),
		epa,
		high_res_refine,
		phase_shift
	})
}


fn read_local(toml: &Table) -> Result<LocalParams> {

	let empty = Table::new();
	let local = section(toml, "local")?
		.unwrap_or(&empty);

	Ok(LocalParams {
		res_low: i64_val(local, "local", "res_low")?.unwrap_or(15),
		res_high: i64_val(local, "local", "res_high")?.unwrap_or(5),
		radius: i64_val(local, "local", "radius")?.unwrap_or(1024),
		ave_type: match str_val(local, "local", "ave_type")?.as_deref() {
			Some("equal") => LocalAverageType::EqualWeights,
			Some("distance") => LocalAverageType::Distance,
			Some("both") | None => LocalAverageType::DistanceAndFrequency,
			Some(other) => bail!("Unrecognized local average type: {} (expected equal, distance, or both)", other)
		},
		box_size: i64_val(local, "local", "box_size")?.unwrap_or(512),
		overlap: f64_val(local, "local", "overlap")?.unwrap_or(0.5),
		refine_astigmatism: bool_val(local, "local", "refine_astigmatism")?.unwrap_or(false)
	})
}


fn read_refine(toml: &Table) -> Result<RefineOptions> {

	let empty = Table::new();
	let local = section(toml, "local")?
		.unwrap_or(&empty);

	Ok(RefineOptions {
		apply_shifts: bool_val(local, "local", "apply_shifts")?.unwrap_or(false),
		particle_pixel_size: f64_val(local, "local", "particle_pixel_size")?,
		use_input_ctf: bool_val(local, "local", "use_input_ctf")?.unwrap_or(false),
		defocus_u_error: f64_val(local, "local", "defocus_u_error")?.unwrap_or(500.0),
		defocus_v_error: f64_val(local, "local", "defocus_v_error")?.unwrap_or(500.0),
		angle_error: f64_val(local, "local", "angle_error")?.unwrap_or(15.0),
		bfactor_error: f64_val(local, "local", "bfactor_error")?.unwrap_or(50.0)
	})
}


fn read_micrographs(toml: &Table) -> Result<Vec<MicrographInput>> {

	let Some(value) = toml.get("micrographs") else {
		return Ok(Vec::new());
	};
	let entries = value.as_array()
		.context("[[micrographs]] is not an array of tables")?;

	let mut micrographs = Vec::with_capacity(entries.len());
	for (i, entry) in entries.iter().enumerate() {
		let entry = entry.as_table()
			.context(format!("micrographs[{}] is not a table", i))?;
		let path = path_val(entry, "micrographs", "path")?
			.context(format!("Missing path in micrographs[{}]", i))?;
		micrographs.push(MicrographInput {
			path,
			coordinates: path_val(entry, "micrographs", "coordinates")?
		});
	}

	Ok(micrographs)
}


fn read_tilt_series(toml: &Table) -> Result<Vec<TiltSeriesInput>> {

	let Some(value) = toml.get("tilt_series") else {
		return Ok(Vec::new());
	};
	let entries = value.as_array()
		.context("[[tilt_series]] is not an array of tables")?;

	let mut all = Vec::with_capacity(entries.len());
	for (i, entry) in entries.iter().enumerate() {

		let entry = entry.as_table()
			.context(format!("tilt_series[{}] is not a table", i))?;

		let id = str_val(entry, "tilt_series", "id")?
			.context(format!("Missing id in tilt_series[{}]", i))?;

		let images = entry.get("images")
			.context(format!("Missing images in tilt_series[{}]", i))?
			.as_array()
			.context(format!("tilt_series[{}].images is not an array", i))?
			.iter()
			.map(|v| {
				v.as_str()
					.map(PathBuf::from)
					.context(format!("tilt_series[{}].images entries must be strings", i))
			})
			.collect::<Result<Vec<_>>>()?;
		if images.is_empty() {
			bail!("tilt_series[{}].images can't be empty", i);
		}

		let angles = match entry.get("angles") {
			Some(v) => {
				let angles = v.as_array()
					.context(format!("tilt_series[{}].angles is not an array", i))?
					.iter()
					.map(|v| {
						as_f64(v)
							.context(format!("tilt_series[{}].angles entries must be numbers", i))
					})
					.collect::<Result<Vec<_>>>()?;
				if angles.len() != images.len() {
					bail!(
						"tilt_series[{}] has {} angles for {} images",
						i, angles.len(), images.len()
					);
				}
				Some(angles)
			}
			None => None
		};

		all.push(TiltSeriesInput {
			id,
			images,
			angles
		});
	}

	Ok(all)
}


fn section<'a>(table: &'a Table, name: &str) -> Result<Option<&'a Table>> {
	match table.get(name) {
		Some(v) => v.as_table()
			.context(format!("[{}] is not a table", name))
			.map(Some),
		None => Ok(None)
	}
}


fn as_f64(value: &toml::Value) -> Option<f64> {
	// integers are fine where floats are expected
	value.as_float()
		.or_else(|| value.as_integer().map(|i| i as f64))
}


fn str_val(table: &Table, section: &str, key: &str) -> Result<Option<String>> {
	match table.get(key) {
		Some(v) => v.as_str()
			.map(|s| Some(s.to_string()))
			.context(format!("{}.{} is not a string", section, key)),
		None => Ok(None)
	}
}


fn path_val(table: &Table, section: &str, key: &str) -> Result<Option<PathBuf>> {
	Ok(str_val(table, section, key)?
		.map(PathBuf::from))
}


fn f64_val(table: &Table, section: &str, key: &str) -> Result<Option<f64>> {
	match table.get(key) {
		Some(v) => as_f64(v)
			.map(Some)
			.context(format!("{}.{} is not a number", section, key)),
		None => Ok(None)
	}
}


fn i64_val(table: &Table, section: &str, key: &str) -> Result<Option<i64>> {
	match table.get(key) {
		Some(v) => v.as_integer()
			.map(Some)
			.context(format!("{}.{} is not an integer", section, key)),
		None => Ok(None)
	}
}


fn u32_val(table: &Table, section: &str, key: &str) -> Result<Option<u32>> {
	match i64_val(table, section, key)? {
		Some(v) => u32::try_from(v)
			.map(Some)
			.context(format!("{}.{} is out of range: {}", section, key, v)),
		None => Ok(None)
	}
}


fn bool_val(table: &Table, section: &str, key: &str) -> Result<Option<bool>> {
	match table.get(key) {
		Some(v) => v.as_bool()
			.map(Some)
			.context(format!("{}.{} is not a boolean", section, key)),
		None => Ok(None)
	}
}


#[cfg(test)]
mod test {

	use std::fs;

	use galvanic_assert::{assert_that, matchers::*};
	use indoc::indoc;

	use super::*;


	fn read(text: &str) -> Result<JobConfig> {
		let dir = assert_fs::TempDir::new().unwrap();
		let path = dir.path().join("job.toml");
		fs::write(&path, text).unwrap();
		JobConfig::read(&path)
	}


	#[test]
	fn minimal_config_gets_defaults() {

		let config = read(indoc! { r#"
			[job]
			output_dir = "runs/ctf"

			[tool]
			home = "/opt/gctf-1.06"

			[scope]
			pixel_size = 1.34

			[[micrographs]]
			path = "mics/mic_0001.mrc"
		"# }).unwrap();

		assert_that!(&config.job.gpus, eq(vec![0u32]));
		assert_that!(&config.job.workers, eq(1));
		assert_that!(&config.job.batch_size, eq(1));

		assert_that!(&config.env.executable, eq(DEFAULT_EXECUTABLE.to_string()));
		assert_that!(&config.env.version, eq(ToolVersion::V106));
		assert_that!(&config.env.activation, eq(None));

		assert_that!(&config.params.pixel_size, eq(1.34));
		assert_that!(&config.params.voltage, eq(300));
		assert_that!(&config.params.window_size, eq(1024));
		assert_that!(&config.params.low_res, eq(50.0));
		assert_that!(&config.params.high_res, eq(4.0));
		assert_that!(&config.params.min_defocus, eq(5000.0));
		assert_that!(&config.params.max_defocus, eq(90000.0));
		assert_that!(&config.params.astigmatism, eq(1000.0));
		assert_that!(&config.params.bfactor, eq(150));
		assert_that!(&config.params.epa.enabled, eq(true));
		assert_that!(&config.params.epa.convolution_size, eq(85));
		assert_that!(&config.params.phase_shift.is_none(), eq(true));
		assert_that!(&config.params.high_res_refine.is_none(), eq(true));

		assert_that!(&config.local.radius, eq(1024));
		assert_that!(&config.local.ave_type, eq(LocalAverageType::DistanceAndFrequency));
		assert_that!(&config.refine.apply_shifts, eq(false));
		assert_that!(&config.refine.defocus_u_error, eq(500.0));

		assert_that!(&config.micrographs.len(), eq(1));
		assert_that!(&config.micrographs[0].coordinates, eq(None));
		assert_that!(&config.tilt_series.is_empty(), eq(true));
		assert_that!(&config.import_logs, eq(None));
	}

	#[test]
	fn full_config_reads_every_section() {

		let config = read(indoc! { r#"
			[job]
			output_dir = "runs/ctf"
			gpus = [0, 1]
			workers = 4
			batch_size = 16

			[tool]
			home = "/opt/gctf-1.18"
			executable = "Gctf_v1.18_sm30-75_cu10.1"
			version = "1.18"
			activation = "module load gctf/1.18"
			cuda_lib = "/usr/local/cuda/lib64"

			[scope]
			pixel_size = 0.66
			voltage = 200
			spherical_aberration = 1.4
			amplitude_contrast = 0.07
			scanned_pixel_size = 5.0

			[ctf]
			down_factor = 2.0
			window_size = 512
			low_res = 30
			high_res = 3.5
			bfactor = 100
			do_epa = false

			[ctf.phase_shift]
			high = 120.0
			target = "resolution"
			refine_type = 2

			[ctf.high_res]
			low = 12.0

			[local]
			res_high = 4
			ave_type = "equal"
			apply_shifts = true
			particle_pixel_size = 1.32
			use_input_ctf = true

			[[micrographs]]
			path = "mics/mic_0001.mrc"
			coordinates = "picks/mic_0001.star"

			[[tilt_series]]
			id = "TS_01"
			images = ["ts/TS_01_000.mrc", "ts/TS_01_001.mrc"]
			angles = [-3.0, 3.0]

			[import]
			logs = "previous/extra"
		"# }).unwrap();

		assert_that!(&config.job.gpus, eq(vec![0u32, 1]));
		assert_that!(&config.job.batch_size, eq(16));

		assert_that!(&config.env.version, eq(ToolVersion::V118));
		assert_that!(&config.env.activation, eq(Some("module load gctf/1.18".to_string())));
		assert_that!(&config.env.cuda_lib, eq(Some(PathBuf::from("/usr/local/cuda/lib64"))));

		// integers coerce where floats are expected
		assert_that!(&config.params.low_res, eq(30.0));
		assert_that!(&config.params.down_factor, eq(2.0));
		assert_that!(&config.params.epa.enabled, eq(false));

		let phase = config.params.phase_shift.as_ref().unwrap();
		assert_that!(&phase.low, eq(0.0));
		assert_that!(&phase.high, eq(120.0));
		assert_that!(&phase.target, eq(PhaseShiftTarget::ResolutionLimit));
		assert_that!(&phase.refine_type, eq(2));

		let high_res = config.params.high_res_refine.as_ref().unwrap();
		assert_that!(&high_res.low, eq(12.0));
		assert_that!(&high_res.bfactor, eq(50));

		assert_that!(&config.local.res_high, eq(4));
		assert_that!(&config.local.ave_type, eq(LocalAverageType::EqualWeights));
		assert_that!(&config.refine.apply_shifts, eq(true));
		assert_that!(&config.refine.particle_pixel_size, eq(Some(1.32)));
		assert_that!(&config.refine.use_input_ctf, eq(true));

		assert_that!(
			&config.micrographs[0].coordinates,
			eq(Some(PathBuf::from("picks/mic_0001.star")))
		);

		assert_that!(&config.tilt_series.len(), eq(1));
		assert_that!(&config.tilt_series[0].id, eq("TS_01".to_string()));
		assert_that!(&config.tilt_series[0].images.len(), eq(2));
		assert_that!(&config.tilt_series[0].angles, eq(Some(vec![-3.0, 3.0])));

		assert_that!(&config.import_logs, eq(Some(PathBuf::from("previous/extra"))));
	}

	#[test]
	fn each_gpu_needs_a_worker() {

		let result = read(indoc! { r#"
			[job]
			output_dir = "runs/ctf"
			gpus = [0, 1, 2]
			workers = 2

			[tool]
			home = "/opt/gctf-1.06"

			[scope]
			pixel_size = 1.34
		"# });

		let err = format!("{:#}", result.unwrap_err());
		assert_that!(&err.contains("GPU"), eq(true));
	}

	#[test]
	fn unknown_version_is_rejected() {

		let result = read(indoc! { r#"
			[job]
			output_dir = "runs/ctf"

			[tool]
			home = "/opt/gctf"
			version = "2.0"

			[scope]
			pixel_size = 1.34
		"# });

		assert_that!(&result.is_err(), eq(true));
	}

	#[test]
	fn missing_scope_is_rejected() {

		let result = read(indoc! { r#"
			[job]
			output_dir = "runs/ctf"

			[tool]
			home = "/opt/gctf"
		"# });

		let err = format!("{:#}", result.unwrap_err());
		assert_that!(&err.contains("scope"), eq(true));
	}

	#[test]
	fn mismatched_tilt_angles_are_rejected() {

		let result = read(indoc! { r#"
			[job]
			output_dir = "runs/ctf"

			[tool]
			home = "/opt/gctf"

			[scope]
			pixel_size = 1.34

			[[tilt_series]]
			id = "TS_01"
			images = ["a.mrc", "b.mrc"]
			angles = [-3.0]
		"# });

		assert_that!(&result.is_err(), eq(true));
	}
}
