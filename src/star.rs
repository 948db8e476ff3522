
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::ctf::CtfRecord;


// header Gctf expects on --boxsuffix coordinate files
const COORDS_HEADER: &'static str = "\ndata_\n\nloop_\n_rlnCoordinateX #1\n_rlnCoordinateY #2\n";


/// Streams particle coordinates into the star file Gctf reads for local refinement.
/// The header layout is fixed: Gctf matches columns by position, not by label.
pub struct CoordinatesWriter {
	path: PathBuf,
	writer: BufWriter<File>
}

impl CoordinatesWriter {

	/// Creates the file (and any missing parent folders) and writes the header.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.context(format!("Failed to create coordinates folder: {}", parent.to_string_lossy()))?;
		}

		let file = File::create(path)
			.context(format!("Failed to create coordinates file: {}", path.to_string_lossy()))?;
		let mut writer = BufWriter::new(file);

		writer.write_all(COORDS_HEADER.as_bytes())
			.context(format!("Failed to write coordinates header: {}", path.to_string_lossy()))?;

		Ok(Self {
			path: path.to_path_buf(),
			writer
		})
	}

	pub fn write_coord(&mut self, x: i64, y: i64) -> Result<()> {
		writeln!(self.writer, "{} {}", x, y)
			.context(format!("Failed to write coordinate to: {}", self.path.to_string_lossy()))
	}

	/// Flushes buffered rows to disk.
	/// Call this before handing the file to the tool, dropping alone won't report write errors.
	pub fn close(mut self) -> Result<()> {
		self.writer.flush()
			.context(format!("Failed to flush coordinates file: {}", self.path.to_string_lossy()))
	}
}


/// One particle position, with any alignment shift that should be subtracted
/// before the coordinate is handed to the tool.
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate {
	pub x: f64,
	pub y: f64,
	pub shift_x: f64,
	pub shift_y: f64
}


/// Per-particle CTF as read back from a Gctf `_local.star` file.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCtf {
	pub x: f64,
	pub y: f64,
	pub defocus_u: f64,
	pub defocus_v: f64,
	pub defocus_angle: f64,
	pub figure_of_merit: Option<f64>,
	pub phase_shift: Option<f64>
}


/// A single-block star table: ordered labels plus whitespace-separated rows.
/// This is only as much of the star format as Gctf files actually use.
pub struct StarTable {
	labels: Vec<String>,
	rows: Vec<Vec<String>>
}

impl StarTable {

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let text = fs::read_to_string(path)
			.context(format!("Failed to read star file: {}", path.to_string_lossy()))?;
		Self::parse(&text)
			.context(format!("Failed to parse star file: {}", path.to_string_lossy()))
	}

	fn parse(text: &str) -> Result<Self> {

		let mut labels = Vec::<String>::new();
		let mut rows = Vec::<Vec<String>>::new();

		for line in text.lines() {

			let line = line.trim();
			if line.is_empty() || line == "loop_" || line.starts_with("data_") {
				continue;
			}

			if let Some(label) = line.split_whitespace().next().filter(|t| t.starts_with('_')) {
				if !rows.is_empty() {
					bail!("Label {} appeared after data rows", label);
				}
				labels.push(label.to_string());
				continue;
			}

			let row = line.split_whitespace()
				.map(|t| t.to_string())
				.collect::<Vec<_>>();
			if row.len() < labels.len() {
				bail!("Data row has {} values but the table has {} columns: {}", row.len(), labels.len(), line);
			}
			rows.push(row);
		}

		Ok(Self {
			labels,
			rows
		})
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	fn col(&self, label: &str) -> Option<usize> {
		self.labels.iter()
			.position(|l| l == label)
	}

	fn f64_at(&self, row: usize, col: usize) -> Result<f64> {
		let token = &self.rows[row][col];
		token.parse::<f64>()
			.context(format!("Unparseable number {:?} in star column {}", token, self.labels[col]))
	}

	fn f64_all(&self, label: &str) -> Result<Vec<f64>> {
		let col = self.col(label)
			.context(format!("Star table has no {} column", label))?;
		(0 .. self.rows.len())
			.map(|row| self.f64_at(row, col))
			.collect()
	}

	fn f64_all_opt(&self, label: &str) -> Result<Option<Vec<f64>>> {
		match self.col(label) {
			Some(col) =>
				(0 .. self.rows.len())
					.map(|row| self.f64_at(row, col))
					.collect::<Result<Vec<_>>>()
					.map(Some),
			None => Ok(None)
		}
	}
}


/// Reads particle picks, with alignment shifts when the file carries them.
pub fn read_coordinates(path: impl AsRef<Path>) -> Result<Vec<Coordinate>> {

	let table = StarTable::read(path)?;

	let x = table.f64_all("_rlnCoordinateX")?;
	let y = table.f64_all("_rlnCoordinateY")?;
	let shift_x = table.f64_all_opt("_rlnOriginX")?;
	let shift_y = table.f64_all_opt("_rlnOriginY")?;

	Ok((0 .. table.len())
		.map(|i| Coordinate {
			x: x[i],
			y: y[i],
			shift_x: shift_x.as_ref().map(|v| v[i]).unwrap_or(0.0),
			shift_y: shift_y.as_ref().map(|v| v[i]).unwrap_or(0.0)
		})
		.collect())
}


/// Reads the per-particle defocus rows Gctf writes after local refinement.
pub fn read_local_ctf(path: impl AsRef<Path>) -> Result<Vec<LocalCtf>> {

	let table = StarTable::read(path)?;

	let x = table.f64_all("_rlnCoordinateX")?;
	let y = table.f64_all("_rlnCoordinateY")?;
	let defocus_u = table.f64_all("_rlnDefocusU")?;
	let defocus_v = table.f64_all("_rlnDefocusV")?;
	let defocus_angle = table.f64_all("_rlnDefocusAngle")?;
	let figure_of_merit = table.f64_all_opt("_rlnCtfFigureOfMerit")?;
	let phase_shift = table.f64_all_opt("_rlnPhaseShift")?;

	Ok((0 .. table.len())
		.map(|i| LocalCtf {
			x: x[i],
			y: y[i],
			defocus_u: defocus_u[i],
			defocus_v: defocus_v[i],
			defocus_angle: defocus_angle[i],
			figure_of_merit: figure_of_merit.as_ref().map(|v| v[i]),
			phase_shift: phase_shift.as_ref().map(|v| v[i])
		})
		.collect())
}


/// Writes the summary table of whole-image CTF estimates, one row per image.
pub fn write_ctf_star(path: impl AsRef<Path>, rows: &[(String, CtfRecord)]) -> Result<()> {

	let path = path.as_ref();
	let file = File::create(path)
		.context(format!("Failed to create star file: {}", path.to_string_lossy()))?;
	let mut writer = BufWriter::new(file);

	let write = |writer: &mut BufWriter<File>| -> std::io::Result<()> {
		writeln!(writer, "\ndata_\n\nloop_")?;
		writeln!(writer, "_rlnMicrographName #1")?;
		writeln!(writer, "_rlnDefocusU #2")?;
		writeln!(writer, "_rlnDefocusV #3")?;
		writeln!(writer, "_rlnDefocusAngle #4")?;
		writeln!(writer, "_rlnCtfFigureOfMerit #5")?;
		writeln!(writer, "_rlnPhaseShift #6")?;
		writeln!(writer, "_rlnCtfMaxResolution #7")?;
		for (name, record) in rows {
			writeln!(
				writer,
				"{} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
				name,
				record.defocus_u,
				record.defocus_v,
				record.defocus_angle,
				record.correlation,
				record.phase_shift.unwrap_or(0.0),
				record.resolution
			)?;
		}
		writer.flush()
	};

	write(&mut writer)
		.context(format!("Failed to write star file: {}", path.to_string_lossy()))?;

	Ok(())
}


/// Writes the summary table of per-particle CTF refinements.
pub fn write_local_ctf_star(path: impl AsRef<Path>, rows: &[(String, LocalCtf)]) -> Result<()> {

	let path = path.as_ref();
	let file = File::create(path)
		.context(format!("Failed to create star file: {}", path.to_string_lossy()))?;
	let mut writer = BufWriter::new(file);

	let write = |writer: &mut BufWriter<File>| -> std::io::Result<()> {
		writeln!(writer, "\ndata_\n\nloop_")?;
		writeln!(writer, "_rlnMicrographName #1")?;
		writeln!(writer, "_rlnCoordinateX #2")?;
		writeln!(writer, "_rlnCoordinateY #3")?;
		writeln!(writer, "_rlnDefocusU #4")?;
		writeln!(writer, "_rlnDefocusV #5")?;
		writeln!(writer, "_rlnDefocusAngle #6")?;
		writeln!(writer, "_rlnCtfFigureOfMerit #7")?;
		for (name, local) in rows {
			writeln!(
				writer,
				"{} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
				name,
				local.x,
				local.y,
				local.defocus_u,
				local.defocus_v,
				local.defocus_angle,
				local.figure_of_merit.unwrap_or(0.0)
			)?;
		}
		writer.flush()
	};

	write(&mut writer)
		.context(format!("Failed to write star file: {}", path.to_string_lossy()))?;

	Ok(())
}
