
use std::path::{Path, PathBuf};

use crate::tool::{ToolEnvironment, ToolVersion};


// Gctf rejects low-resolution bounds beyond 50 A, so larger requests get clamped
const MAX_LOW_RES: f64 = 50.0;

// coordinate files sit next to the converted micrograph, named <base>_coords.star
pub const COORDS_SUFFIX: &'static str = "_coords.star";


/// Acquisition and search parameters for one CTF estimation run.
/// Resolutions, defocus bounds, and astigmatism are in Angstroms, except
/// `scanned_pixel_size` which is the physical detector step in microns.
#[derive(Debug, Clone, PartialEq)]
pub struct CtfParams {

	/// pixel size of the raw micrographs, before any downscale
	pub pixel_size: f64,

	/// Fourier crop factor applied to inputs before estimation, 1 for none
	pub down_factor: f64,

	/// acceleration voltage, in kV
	pub voltage: u32,

	/// spherical aberration, in mm
	pub spherical_aberration: f64,

	pub amplitude_contrast: f64,
	pub scanned_pixel_size: f64,
	pub window_size: u32,
	pub low_res: f64,
	pub high_res: f64,
	pub min_defocus: f64,
	pub max_defocus: f64,
	pub step_defocus: f64,
	pub astigmatism: f64,
	pub bfactor: i64,
	pub plot_res_ring: bool,
	pub do_validation: bool,
	pub epa: EpaParams,
	pub high_res_refine: Option<HighResParams>,
	pub phase_shift: Option<PhaseShiftParams>
}

impl CtfParams {

	/// the pixel size the tool actually sees, after any downscale
	pub fn effective_pixel_size(&self) -> f64 {
		self.pixel_size * self.down_factor
	}

	/// extension of the power spectrum diagnostic the tool writes during estimation
	pub fn psd_ext(&self) -> &'static str {
		if self.epa.enabled {
			".epa"
		} else {
			".pow"
		}
	}
}


/// Equiphase averaging settings.
/// The overlap and smoothing values are serialized even when EPA itself is off,
/// since the tool uses them for its plain rotational average too.
#[derive(Debug, Clone, PartialEq)]
pub struct EpaParams {
	pub enabled: bool,
	pub oversampling: u32,
	pub overlap: f64,
	pub convolution_size: u32,
	pub smoothing_res: u32
}


/// Second refinement pass restricted to a high-resolution shell.
#[derive(Debug, Clone, PartialEq)]
pub struct HighResParams {
	pub low: f64,
	pub high: f64,
	pub bfactor: i64
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseShiftTarget {
	CrossCorrelation,
	ResolutionLimit
}

impl PhaseShiftTarget {

	fn flag_value(&self) -> i64 {
		match self {
			PhaseShiftTarget::CrossCorrelation => 1,
			PhaseShiftTarget::ResolutionLimit => 2
		}
	}
}


/// Phase shift search settings, for data collected with a phase plate.
/// Angles are in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseShiftParams {
	pub low: f64,
	pub high: f64,
	pub step: f64,
	pub target: PhaseShiftTarget,
	/// refine defocus and phase shift together, only honored from 1.06 on
	pub cosearch_refine: bool,
	/// 2d refinement type, 1 to 3, only honored from 1.06 on
	pub refine_type: u32
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAverageType {
	EqualWeights,
	Distance,
	DistanceAndFrequency
}

impl LocalAverageType {

	fn flag_value(&self) -> i64 {
		match self {
			LocalAverageType::EqualWeights => 0,
			LocalAverageType::Distance => 1,
			LocalAverageType::DistanceAndFrequency => 2
		}
	}
}


/// Per-particle local refinement settings.
/// Radii and box sizes are in pixels, resolutions in Angstroms.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalParams {
	pub res_low: i64,
	pub res_high: i64,
	pub radius: i64,
	pub ave_type: LocalAverageType,
	pub box_size: i64,
	pub overlap: f64,
	pub refine_astigmatism: bool
}


/// Seeds a local refinement from a previously estimated CTF,
/// with error margins telling the tool how far to wander from it.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedParams {
	pub defocus_u: f64,
	pub defocus_v: f64,
	pub defocus_angle: f64,
	pub defocus_u_error: f64,
	pub defocus_v_error: f64,
	pub angle_error: f64,
	pub bfactor_error: f64
}


/// Per-run parameter overrides, for recalculation and downscale bookkeeping.
/// Anything left as `None` falls through to the base parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CtfOverrides {
	pub scanned_pixel_size: Option<f64>,
	pub low_res: Option<f64>,
	pub high_res: Option<f64>,
	pub min_defocus: Option<f64>,
	pub max_defocus: Option<f64>,
	pub step_defocus: Option<f64>
}

impl CtfOverrides {

	pub fn none() -> Self {
		Self::default()
	}

	fn apply(&self, params: &CtfParams) -> CtfParams {
		let mut params = params.clone();
		if let Some(v) = self.scanned_pixel_size {
			params.scanned_pixel_size = v;
		}
		if let Some(v) = self.low_res {
			params.low_res = v;
		}
		if let Some(v) = self.high_res {
			params.high_res = v;
		}
		if let Some(v) = self.min_defocus {
			params.min_defocus = v;
		}
		if let Some(v) = self.max_defocus {
			params.max_defocus = v;
		}
		if let Some(v) = self.step_defocus {
			params.step_defocus = v;
		}
		params
	}
}


/// One serialized command-line value.
/// The float variants pin the decimal places so the emitted argument string
/// is deterministic and diffable across runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
	Int(i64),
	Float(f64),
	Float3(f64),
	Text(&'static str),
	/// left open at build time, substituted per invocation
	GpuId
}

impl ArgValue {

	fn format(&self, gpu: &str) -> String {
		match self {
			ArgValue::Int(v) => format!("{}", v),
			ArgValue::Float(v) => format!("{:.6}", v),
			ArgValue::Float3(v) => format!("{:.3}", v),
			ArgValue::Text(v) => v.to_string(),
			ArgValue::GpuId => gpu.to_string()
		}
	}
}


fn flag_bool(b: bool) -> ArgValue {
	ArgValue::Int(if b { 1 } else { 0 })
}


/// The Gctf invocation for one run: the program path plus an ordered flag list,
/// with the GPU id left open so the same command serves every batch.
#[derive(Debug, Clone)]
pub struct GctfCommand {
	program: PathBuf,
	flags: Vec<(&'static str, ArgValue)>
}

impl GctfCommand {

	/// Builds the command for whole-micrograph estimation.
	pub fn estimate(env: &ToolEnvironment, params: &CtfParams, extra: &CtfOverrides) -> Self {

		let params = extra.apply(params);

		let mut cmd = Self::new(env);
		cmd.push_base(&params);
		cmd.push_smoothing(&params, env.version);
		cmd.push_phase_shift(&params, env.version);
		cmd.push_tail(&params);
		cmd
	}

	/// Builds the command for per-particle local refinement.
	/// The caller is responsible for checking `ToolVersion::supports_local_refinement` first.
	pub fn refine(
		env: &ToolEnvironment,
		params: &CtfParams,
		extra: &CtfOverrides,
		local: &LocalParams,
		seed: Option<&SeedParams>
	) -> Self {

		let params = extra.apply(params);

		let mut cmd = Self::new(env);
		cmd.push_base(&params);
		cmd.push_local(local);
		if let Some(seed) = seed {
			cmd.push_seed(seed, &params);
		}
		cmd.push_smoothing(&params, env.version);
		cmd.push_phase_shift(&params, env.version);
		cmd.push_tail(&params);
		cmd
	}

	fn new(env: &ToolEnvironment) -> Self {
		Self {
			program: env.program(),
			flags: Vec::new()
		}
	}

	fn push(&mut self, flag: &'static str, value: ArgValue) {
		self.flags.push((flag, value));
	}

	fn push_base(&mut self, params: &CtfParams) {

		let apix = params.effective_pixel_size();

		self.push("apix", ArgValue::Float(apix));
		self.push("kV", ArgValue::Int(params.voltage as i64));
		self.push("cs", ArgValue::Float(params.spherical_aberration));
		self.push("ac", ArgValue::Float(params.amplitude_contrast));
		self.push("dstep", ArgValue::Float(params.scanned_pixel_size));
		self.push("defL", ArgValue::Float(params.min_defocus));
		self.push("defH", ArgValue::Float(params.max_defocus));
		self.push("defS", ArgValue::Float(params.step_defocus));
		self.push("astm", ArgValue::Float(params.astigmatism));
		self.push("resL", ArgValue::Float(f64::min(params.low_res, MAX_LOW_RES)));
		self.push("resH", ArgValue::Float(params.high_res));
		self.push("do_EPA", flag_bool(params.epa.enabled));
		self.push("boxsize", ArgValue::Int(params.window_size as i64));
		self.push("plot_res_ring", flag_bool(params.plot_res_ring));
		self.push("gid", ArgValue::GpuId);
		self.push("bfac", ArgValue::Int(params.bfactor));
		// the tool wants the B-factor resolution bound at twice the pixel size
		self.push("B_resH", ArgValue::Float(apix * 2.0));
		self.push("overlap", ArgValue::Float(params.epa.overlap));
		self.push("convsize", ArgValue::Int(params.epa.convolution_size as i64));
		self.push("do_Hres_ref", flag_bool(params.high_res_refine.is_some()));
	}

	fn push_local(&mut self, local: &LocalParams) {
		self.push("do_local_refine", ArgValue::Int(1));
		self.push("boxsuffix", ArgValue::Text(COORDS_SUFFIX));
		self.push("local_radius", ArgValue::Int(local.radius));
		self.push("local_avetype", ArgValue::Int(local.ave_type.flag_value()));
		self.push("local_boxsize", ArgValue::Int(local.box_size));
		self.push("local_overlap", ArgValue::Float(local.overlap));
		self.push("local_resL", ArgValue::Int(local.res_low));
		self.push("local_resH", ArgValue::Int(local.res_high));
		self.push("refine_local_astm", flag_bool(local.refine_astigmatism));
	}

	fn push_seed(&mut self, seed: &SeedParams, params: &CtfParams) {
		self.push("refine_input_ctf", ArgValue::Int(1));
		self.push("defU_init", ArgValue::Float(seed.defocus_u));
		self.push("defV_init", ArgValue::Float(seed.defocus_v));
		self.push("defA_init", ArgValue::Float(seed.defocus_angle));
		self.push("B_init", ArgValue::Int(params.bfactor));
		self.push("defU_err", ArgValue::Float(seed.defocus_u_error));
		self.push("defV_err", ArgValue::Float(seed.defocus_v_error));
		self.push("defA_err", ArgValue::Float(seed.angle_error));
		self.push("B_err", ArgValue::Float(seed.bfactor_error));
	}

	fn push_smoothing(&mut self, params: &CtfParams, version: ToolVersion) {
		if version.has_refinement_flags() {
			self.push("smooth_resL", ArgValue::Int(params.epa.smoothing_res as i64));
		}
		self.push("EPA_oversmp", ArgValue::Int(params.epa.oversampling as i64));
	}

	fn push_phase_shift(&mut self, params: &CtfParams, version: ToolVersion) {
		let Some(phase) = &params.phase_shift else {
			return;
		};
		self.push("phase_shift_L", ArgValue::Float(phase.low));
		self.push("phase_shift_H", ArgValue::Float(phase.high));
		self.push("phase_shift_S", ArgValue::Float(phase.step));
		self.push("phase_shift_T", ArgValue::Int(phase.target.flag_value()));
		if version.has_refinement_flags() {
			self.push("cosearch_refine_ps", flag_bool(phase.cosearch_refine));
			self.push("refine_2d_T", ArgValue::Int(phase.refine_type as i64));
		}
	}

	fn push_tail(&mut self, params: &CtfParams) {
		if let Some(high_res) = &params.high_res_refine {
			self.push("Href_resL", ArgValue::Float3(high_res.low));
			self.push("Href_resH", ArgValue::Float3(high_res.high));
			self.push("Href_bfac", ArgValue::Int(high_res.bfactor));
		}
		// suppress the star output, the logs are the interface
		self.push("ctfstar", ArgValue::Text("NONE"));
		self.push("do_validation", flag_bool(params.do_validation));
	}

	pub fn program(&self) -> &Path {
		&self.program
	}

	/// Serializes the flag list, filling in the GPU id for this invocation.
	pub fn args(&self, gpu: &str) -> String {
		self.flags.iter()
			.map(|(flag, value)| format!("--{} {}", flag, value.format(gpu)))
			.collect::<Vec<_>>()
			.join(" ")
	}
}
