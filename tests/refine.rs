
mod util;


use std::path::Path;

use assert_cmd::assert::Assert;
use galvanic_assert::{assert_that, matchers::*};
use indoc::{formatdoc, indoc};
use predicates::prelude::*;

use gctf_runner::mrc::Mrc;

use crate::util::cmd::{cmd, AssertExt};
use crate::util::fake_tool;
use crate::util::job_dir::JobDir;


fn cmd_refine(job_dir: impl AsRef<Path>) -> Assert {
	cmd()
		.current_dir(job_dir)
		.args(["refine", "job.toml"])
		.assert()
		.print_stderr()
		.print_stdout()
}


fn write_inputs(dir: &JobDir) {

	let mics = dir.mkdir("mics");
	Mrc::new(8, 8, 1)
		.save(mics.join("mic_0001.mrc"))
		.unwrap();

	dir.file("picks/mic_0001.star").write(indoc! { "
		data_
		loop_
		_rlnCoordinateX #1
		_rlnCoordinateY #2
		512 213
		1024 4096
		100 200
	" });
}


#[test]
fn three_particles_get_local_ctf() {

	let job_dir = JobDir::new();
	write_inputs(&job_dir);

	let tool = fake_tool::install(&job_dir);
	job_dir.file_job().write(formatdoc! { r#"
		[job]
		output_dir = "out"

		{tool}

		[scope]
		pixel_size = 1.34

		[[micrographs]]
		path = "mics/mic_0001.mrc"
		coordinates = "picks/mic_0001.star"
	"# });

	let cmd = cmd_refine(&job_dir);
	job_dir.print();
	cmd.success();

	let invocations = fake_tool::invocations(&job_dir);
	assert_that!(&invocations.contains("--do_local_refine 1"), eq(true));
	assert_that!(&invocations.contains("--boxsuffix _coords.star"), eq(true));

	// the per-micrograph table lands in extra/, with one row per particle
	let local = job_dir.file("out/extra/mic_0001_local.star").read();
	assert_that!(&local.contains("512 213 2600.00"), eq(true));
	assert_that!(&local.lines().filter(|l| !l.is_empty() && !l.starts_with('_') && !l.starts_with("data") && !l.starts_with("loop")).count(), eq(3));

	let particles = job_dir.file("out/extra/particles_ctf.star").read();
	assert_that!(
		&particles.contains("mic_0001 512.000000 213.000000 2600.000000 2500.000000 50.000000 0.090000"),
		eq(true)
	);
	assert_that!(&particles.lines().filter(|l| l.starts_with("mic_0001")).count(), eq(3));

	assert_that!(&job_dir.file("out/extra/mic_0001_ctf.mrc").exists(), eq(true));
	assert_that!(&job_dir.file("out/extra/mic_0001_ctf.log").exists(), eq(true));

	// coordinates and the converted image go down with the batch folder
	assert_that!(&job_dir.file("out/tmp/mic_0001").exists(), eq(false));
}


#[test]
fn seeds_come_from_previous_logs() {

	let job_dir = JobDir::new();
	write_inputs(&job_dir);

	let tool = fake_tool::install(&job_dir);
	job_dir.file("previous/mic_0001_gctf.log").write(indoc! { "
		   2541.81    2487.72    52.47   0.10179  Final Values
		Resolution limit estimated by EPA:   4.52
	" });

	job_dir.file_job().write(formatdoc! { r#"
		[job]
		output_dir = "out"

		{tool}

		[scope]
		pixel_size = 1.34

		[local]
		use_input_ctf = true

		[[micrographs]]
		path = "mics/mic_0001.mrc"
		coordinates = "picks/mic_0001.star"

		[import]
		logs = "previous"
	"# });

	let cmd = cmd_refine(&job_dir);
	job_dir.print();
	cmd.success();

	let invocations = fake_tool::invocations(&job_dir);
	assert_that!(&invocations.contains("--refine_input_ctf 1"), eq(true));
	assert_that!(&invocations.contains("--defU_init 2541.810000"), eq(true));
	assert_that!(&invocations.contains("--defV_init 2487.720000"), eq(true));
}


#[test]
fn v118_dropped_local_refinement() {

	let job_dir = JobDir::new();
	write_inputs(&job_dir);

	let tool = fake_tool::install(&job_dir)
		.replace("version = \"1.06\"", "version = \"1.18\"");
	job_dir.file_job().write(formatdoc! { r#"
		[job]
		output_dir = "out"

		{tool}

		[scope]
		pixel_size = 1.34

		[[micrographs]]
		path = "mics/mic_0001.mrc"
		coordinates = "picks/mic_0001.star"
	"# });

	cmd_refine(&job_dir)
		.failure()
		.stdout(predicate::str::contains("local refinement"));
}


#[test]
fn coordinates_are_required() {

	let job_dir = JobDir::new();
	write_inputs(&job_dir);

	let tool = fake_tool::install(&job_dir);
	job_dir.file_job().write(formatdoc! { r#"
		[job]
		output_dir = "out"

		{tool}

		[scope]
		pixel_size = 1.34

		[[micrographs]]
		path = "mics/mic_0001.mrc"
	"# });

	cmd_refine(&job_dir)
		.failure()
		.stdout(predicate::str::contains("no coordinates file"));
}
