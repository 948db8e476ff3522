
// MRC file (from the Medical Research Council, in the UK)
// https://en.wikipedia.org/wiki/MRC_(file_format)

// format specification:
// https://www.ccpem.ac.uk/mrc_format/mrc2014.php

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};


/// A single-precision image stack in memory, with nz = 1 for plain micrographs.
/// Gctf only reads single-precision input, so every source pixel type widens to f32 on read.
pub struct Mrc {
	nx: u32,
	ny: u32,
	nz: u32,
	voxels: Vec<f32>
}

impl Mrc {

	pub fn new(nx: u32, ny: u32, nz: u32) -> Self {
		Self {
			nx,
			ny,
			nz,
			voxels: vec![0f32; (nx as usize)*(ny as usize)*(nz as usize)]
		}
	}

	pub fn from_voxels(nx: u32, ny: u32, nz: u32, voxels: Vec<f32>) -> Result<Self> {
		let expected = (nx as usize)*(ny as usize)*(nz as usize);
		if voxels.len() != expected {
			bail!("Voxel buffer has {} values, but {}x{}x{} needs {}", voxels.len(), nx, ny, nz, expected);
		}
		Ok(Self {
			nx,
			ny,
			nz,
			voxels
		})
	}

	pub fn nx(&self) -> u32 {
		self.nx
	}

	pub fn ny(&self) -> u32 {
		self.ny
	}

	pub fn nz(&self) -> u32 {
		self.nz
	}

	pub fn voxels(&self) -> &[f32] {
		&self.voxels
	}

	fn index(&self, x: u32, y: u32, z: u32) -> usize {
		let x = x as usize;
		let y = y as usize;
		let z = z as usize;
		let nx = self.nx as usize;
		let ny = self.ny as usize;
		return z*nx*ny + y*nx + x;
	}

	pub fn get(&self, x: u32, y: u32, z: u32) -> f32 {
		self.voxels[self.index(x, y, z)]
	}

	pub fn set(&mut self, x: u32, y: u32, z: u32, val: f32) {
		let i = self.index(x, y, z);
		self.voxels[i] = val;
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();

		let file = File::open(path)
			.context(format!("Failed to open file for reading: {}", path.to_string_lossy()))?;
		let mut reader = BufReader::new(file);

		// the header is 256 (4-byte) words, or 1024 bytes total

		// read the dimensions (words 1-3) and the pixel mode (word 4)
		let nx = reader.read_u32::<LE>()?;
		let ny = reader.read_u32::<LE>()?;
		let nz = reader.read_u32::<LE>()?;
		let mode = reader.read_u32::<LE>()?;

		let count = (nx as u64)*(ny as u64)*(nz as u64);
		if count == 0 || count > (1 << 31) {
			bail!("Unreasonable MRC dimensions {}x{}x{} in: {}", nx, ny, nz, path.to_string_lossy());
		}

		// we're at word 5 now: skip to the extra header size at word 24
		reader.seek_relative(4*(24 - 5))?;
		let nsymbt = reader.read_u32::<LE>()?;

		// we're at word 25 now: skip the rest of the header, plus any extra header space
		// NOTE: no byte-order normalization here, only Little-Endian files are supported
		reader.seek_relative(4*(257 - 25) + nsymbt as i64)?;

		// read the voxels: z(y(x)) order
		let mut voxels = vec![0f32; count as usize];
		let read_err = format!("Failed to read voxels from: {}", path.to_string_lossy());
		match mode {
			0 => {
				// 8 bit signed int
				for v in &mut voxels {
					*v = reader.read_i8().context(read_err.clone())? as f32;
				}
			}
			1 => {
				// 16 bit signed int
				for v in &mut voxels {
					*v = reader.read_i16::<LE>().context(read_err.clone())? as f32;
				}
			}
			2 => {
				// 32 bit float
				reader.read_f32_into::<LE>(&mut voxels)
					.context(read_err)?;
			}
			6 => {
				// 16 bit unsigned int
				for v in &mut voxels {
					*v = reader.read_u16::<LE>().context(read_err.clone())? as f32;
				}
			}
			_ => bail!("Unsupported MRC mode {} in: {}", mode, path.to_string_lossy())
		}

		Ok(Self {
			nx,
			ny,
			nz,
			voxels
		})
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {

		let path = path.as_ref();

		let mut file = File::create(&path)
			.context(format!("Failed to open file for writing: {}", path.to_string_lossy()))?;
		let mut writer = BufWriter::new(&mut file);

		// write the dimensions (words 1-3)
		writer.write_u32::<LE>(self.nx)?;
		writer.write_u32::<LE>(self.ny)?;
		writer.write_u32::<LE>(self.nz)?;

		// use mode 2: 32 bit float, the only input mode Gctf accepts
		writer.write_u32::<LE>(2)?;

		// we're at word 5 now: skip to word 24
		writer.write(&[0u8; 4*(24 - 5)])?;

		// we're not using any extra header space, so zero out nsymbt
		writer.write_u32::<LE>(0)?;

		// we're at word 25 now: skip to word 54
		writer.write(&[0u8; 4*(54 - 25)])?;

		// write the machine stamp: signal little-endianess (note 11)
		writer.write(&[0x44, 0x44, 0x00, 0x00])?;

		// we're at word 55 now: skip to the end of the header (word 257)
		writer.write(&[0u8; 4*(257 - 55)])?;

		// write the voxels: z(y(x)) order
		for v in &self.voxels {
			writer.write_f32::<LE>(*v)?;
		}

		// write buffers should be flushed before dropping
		writer.flush()?;

		Ok(())
	}
}
