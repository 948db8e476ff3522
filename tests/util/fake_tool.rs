
use std::fs;
use std::os::unix::fs::PermissionsExt;

use super::job_dir::JobDir;


pub const EXECUTABLE: &'static str = "Gctf-fake";


/// A stand-in for the real tool: expands the glob it was handed and writes the
/// same artifacts Gctf would for every match. Every invocation is also appended
/// to `tool/invocations.log` so tests can check which flags were passed.
const SCRIPT: &'static str = r#"#!/bin/sh

echo "$*" >> "$(dirname "$0")/../invocations.log"

ext=".pow"
case "$*" in *"--do_EPA 1"*) ext=".epa";; esac

local_refine=""
case "$*" in *"--do_local_refine 1"*) local_refine="yes"; ext=".ctf";; esac

phase=""
case "$*" in *"--phase_shift_L"*) phase="yes";; esac

for arg; do glob="$arg"; done

for f in $glob; do
	[ -e "$f" ] || exit 2
	base="${f%.mrc}"
	{
		echo "Processing $f"
		if [ -n "$phase" ]; then
			echo "   2541.81    2487.72    52.47    45.00   0.10179  Final Values"
		else
			echo "   2541.81    2487.72    52.47   0.10179  Final Values"
		fi
		printf 'Resolution limit estimated by EPA: \033[1;31m  4.52\033[0m\n'
	} > "${base}_gctf.log"
	echo "EPA profile" > "${base}_EPA.log"
	echo "PSD" > "${base}${ext}"
	if [ -n "$local_refine" ]; then
		coords="${base}_coords.star"
		{
			echo "data_"
			echo "loop_"
			echo "_rlnCoordinateX #1"
			echo "_rlnCoordinateY #2"
			echo "_rlnDefocusU #3"
			echo "_rlnDefocusV #4"
			echo "_rlnDefocusAngle #5"
			echo "_rlnCtfFigureOfMerit #6"
			if [ -e "$coords" ]; then
				grep -E '^-?[0-9]' "$coords" | while read -r x y; do
					echo "$x $y 2600.00 2500.00 50.00 0.09000"
				done
			fi
		} > "${base}_local.star"
	fi
done
"#;


/// Installs the fake tool under `tool/` in the job folder and returns
/// the toml lines pointing a job file at it.
pub fn install(dir: &JobDir) -> String {
	install_script(dir, SCRIPT)
}

/// Same layout, but the tool always fails.
pub fn install_failing(dir: &JobDir) -> String {
	install_script(dir, "#!/bin/sh\nexit 1\n")
}

fn install_script(dir: &JobDir, script: &str) -> String {

	let bin = dir.mkdir("tool/bin");
	let exe = bin.join(EXECUTABLE);
	fs::write(&exe, script)
		.expect(&format!("Failed to write fake tool: {}", exe.to_string_lossy()));
	fs::set_permissions(&exe, fs::Permissions::from_mode(0o755))
		.expect("Failed to mark fake tool executable");

	// tool.home has to be absolute, the runner resolves inputs against the job folder instead
	format!(
		"[tool]\nhome = \"{}\"\nexecutable = \"{}\"\nversion = \"1.06\"",
		dir.path().join("tool").to_string_lossy(),
		EXECUTABLE
	)
}


/// All flags passed to the fake tool, one line per invocation.
pub fn invocations(dir: &JobDir) -> String {
	dir.file("tool/invocations.log").read()
}
