
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use tracing::debug;

use crate::mrc::Mrc;


/// Turns input micrographs into the single-precision MRC files Gctf reads.
/// Implementations own all raster I/O, the protocols only name source and
/// destination paths and an optional downscale factor.
pub trait ImageConverter {

	/// convert without resampling
	fn convert(&self, src: &Path, dst: &Path) -> Result<()>;

	/// convert and downscale by cropping high frequencies in Fourier space
	fn scale_fourier(&self, src: &Path, dst: &Path, factor: f64) -> Result<()>;
}


/// The default converter: MRC-family files are read natively,
/// anything else goes through the raster decoders and gets flattened to grayscale.
pub struct MrcConverter;

impl MrcConverter {

	fn read_any(&self, src: &Path) -> Result<Mrc> {

		if is_mrc_family(src) {
			return Mrc::read(src);
		}

		// raster formats land here, png and tif mostly
		let img = image::open(src)
			.context(format!("Failed to decode image: {}", src.to_string_lossy()))?
			.to_luma32f();
		let (w, h) = img.dimensions();
		Mrc::from_voxels(w, h, 1, img.into_raw())
	}
}

impl ImageConverter for MrcConverter {

	fn convert(&self, src: &Path, dst: &Path) -> Result<()> {

		// plain mrc files can be linked instead of rewritten
		if has_ext(src, "mrc") {
			if dst.exists() {
				fs::remove_file(dst)
					.context(format!("Failed to replace converted image: {}", dst.to_string_lossy()))?;
			}
			return match fs::hard_link(src, dst) {
				Ok(()) => Ok(()),
				Err(_) => {
					// hard links fail across filesystems, fall back to a copy
					fs::copy(src, dst)
						.context(format!("Failed to copy image to: {}", dst.to_string_lossy()))?;
					Ok(())
				}
			};
		}

		let img = self.read_any(src)?;
		img.save(dst)
	}

	fn scale_fourier(&self, src: &Path, dst: &Path, factor: f64) -> Result<()> {

		let img = self.read_any(src)?;
		let scaled = fourier_crop(&img, factor)
			.context(format!("Failed to downscale image: {}", src.to_string_lossy()))?;

		debug!(
			"Downscaled {} by {}: {}x{} -> {}x{}",
			src.to_string_lossy(), factor,
			img.nx(), img.ny(),
			scaled.nx(), scaled.ny()
		);

		scaled.save(dst)
	}
}


fn has_ext(path: &Path, ext: &str) -> bool {
	path.extension()
		.map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
		.unwrap_or(false)
}


fn is_mrc_family(path: &Path) -> bool {
	["mrc", "mrcs", "st", "rec", "ali"].iter()
		.any(|ext| has_ext(path, ext))
}


/// Downscales a 2-D image by keeping only its lowest spatial frequencies.
/// Unlike real-space binning, this keeps the power spectrum of the surviving
/// band untouched, which is what a downstream CTF fit needs.
fn fourier_crop(img: &Mrc, factor: f64) -> Result<Mrc> {

	if img.nz() != 1 {
		bail!("Fourier downscale expects a single 2-D image, got {} sections", img.nz());
	}
	if factor < 1.0 {
		bail!("Downscale factor must be at least 1, got {}", factor);
	}

	let w = img.nx() as usize;
	let h = img.ny() as usize;
	let new_w = usize::min(usize::max(1, (w as f64/factor).round() as usize), w);
	let new_h = usize::min(usize::max(1, (h as f64/factor).round() as usize), h);

	let mut planner = FftPlanner::<f32>::new();

	// forward transform, rows then columns
	let mut spectrum = img.voxels().iter()
		.map(|&v| Complex::new(v, 0.0))
		.collect::<Vec<_>>();
	let row_fft = planner.plan_fft_forward(w);
	for y in 0 .. h {
		row_fft.process(&mut spectrum[y*w .. (y + 1)*w]);
	}
	let col_fft = planner.plan_fft_forward(h);
	let mut col = vec![Complex::new(0f32, 0f32); h];
	for x in 0 .. w {
		for y in 0 .. h {
			col[y] = spectrum[y*w + x];
		}
		col_fft.process(&mut col);
		for y in 0 .. h {
			spectrum[y*w + x] = col[y];
		}
	}

	// crop: in the unshifted layout the low frequencies sit at both ends of each axis
	let keep = |i: usize, n_new: usize, n_old: usize| -> usize {
		if i < (n_new + 1)/2 {
			i
		} else {
			n_old - (n_new - i)
		}
	};
	let mut cropped = vec![Complex::new(0f32, 0f32); new_w*new_h];
	for y in 0 .. new_h {
		let sy = keep(y, new_h, h);
		for x in 0 .. new_w {
			let sx = keep(x, new_w, w);
			cropped[y*new_w + x] = spectrum[sy*w + sx];
		}
	}

	// inverse transform back to real space
	let row_ifft = planner.plan_fft_inverse(new_w);
	for y in 0 .. new_h {
		row_ifft.process(&mut cropped[y*new_w .. (y + 1)*new_w]);
	}
	let col_ifft = planner.plan_fft_inverse(new_h);
	let mut col = vec![Complex::new(0f32, 0f32); new_h];
	for x in 0 .. new_w {
		for y in 0 .. new_h {
			col[y] = cropped[y*new_w + x];
		}
		col_ifft.process(&mut col);
		for y in 0 .. new_h {
			cropped[y*new_w + x] = col[y];
		}
	}

	// the transforms are unnormalized: dividing by the original sample count
	// keeps the image mean unchanged through the crop
	let norm = 1.0/((w*h) as f32);
	let voxels = cropped.iter()
		.map(|c| c.re*norm)
		.collect::<Vec<_>>();

	Mrc::from_voxels(new_w as u32, new_h as u32, 1, voxels)
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};
	use image::{ImageBuffer, Luma};

	use super::*;


	fn close(a: f32, b: f32) -> bool {
		(a - b).abs() < 1e-3
	}


	#[test]
	fn crop_preserves_constant_image() {

		let mrc = Mrc::from_voxels(8, 8, 1, vec![3.0f32; 64]).unwrap();
		let scaled = fourier_crop(&mrc, 2.0).unwrap();

		assert_that!(&scaled.nx(), eq(4));
		assert_that!(&scaled.ny(), eq(4));
		for &v in scaled.voxels() {
			assert_that!(&close(v, 3.0), eq(true));
		}
	}

	#[test]
	fn crop_rounds_fractional_factors() {

		let mrc = Mrc::new(9, 6, 1);
		let scaled = fourier_crop(&mrc, 1.5).unwrap();

		assert_that!(&scaled.nx(), eq(6));
		assert_that!(&scaled.ny(), eq(4));
	}

	#[test]
	fn crop_keeps_low_frequency_signal() {

		// one full cosine period across the image survives a factor 2 crop,
		// with its amplitude intact
		let w = 16u32;
		let h = 16u32;
		let mut mrc = Mrc::new(w, h, 1);
		for y in 0 .. h {
			for x in 0 .. w {
				let phase = 2.0*std::f32::consts::PI*(x as f32)/(w as f32);
				mrc.set(x, y, 0, phase.cos());
			}
		}

		let scaled = fourier_crop(&mrc, 2.0).unwrap();
		for y in 0 .. scaled.ny() {
			for x in 0 .. scaled.nx() {
				let phase = 2.0*std::f32::consts::PI*(x as f32)/(scaled.nx() as f32);
				assert_that!(&close(scaled.get(x, y, 0), phase.cos()), eq(true));
			}
		}
	}

	#[test]
	fn crop_rejects_stacks_and_upscales() {
		assert_that!(&fourier_crop(&Mrc::new(4, 4, 2), 2.0).is_err(), eq(true));
		assert_that!(&fourier_crop(&Mrc::new(4, 4, 1), 0.5).is_err(), eq(true));
	}

	#[test]
	fn mrc_sources_get_linked() {

		let dir = assert_fs::TempDir::new().unwrap();
		let src = dir.path().join("mic_0001.mrc");
		let dst = dir.path().join("batch").join("mic_0001.mrc");
		std::fs::create_dir_all(dst.parent().unwrap()).unwrap();

		let mut mrc = Mrc::new(4, 4, 1);
		mrc.set(2, 2, 0, 42.0);
		mrc.save(&src).unwrap();

		MrcConverter.convert(&src, &dst).unwrap();

		let copy = Mrc::read(&dst).unwrap();
		assert_that!(&copy.get(2, 2, 0), eq(42.0));

		// converting again replaces the earlier output
		MrcConverter.convert(&src, &dst).unwrap();
		assert_that!(&dst.is_file(), eq(true));
	}

	#[test]
	fn raster_sources_get_rewritten() {

		let dir = assert_fs::TempDir::new().unwrap();
		let src = dir.path().join("mic_0001.png");
		let dst = dir.path().join("mic_0001.mrc");

		let img = ImageBuffer::<Luma<u8>, Vec<u8>>::from_fn(4, 2, |x, y| {
			if x == 0 && y == 0 {
				Luma([255u8])
			} else {
				Luma([0u8])
			}
		});
		img.save(&src).unwrap();

		MrcConverter.convert(&src, &dst).unwrap();

		let mrc = Mrc::read(&dst).unwrap();
		assert_that!(&mrc.nx(), eq(4));
		assert_that!(&mrc.ny(), eq(2));
		assert_that!(&close(mrc.get(0, 0, 0), 1.0), eq(true));
		assert_that!(&close(mrc.get(1, 0, 0), 0.0), eq(true));
	}

	#[test]
	fn fourier_scaling_through_the_converter() {

		let dir = assert_fs::TempDir::new().unwrap();
		let src = dir.path().join("mic_0001.mrc");
		let dst = dir.path().join("mic_0001_small.mrc");

		Mrc::from_voxels(8, 8, 1, vec![7.0f32; 64]).unwrap()
			.save(&src).unwrap();

		MrcConverter.scale_fourier(&src, &dst, 2.0).unwrap();

		let scaled = Mrc::read(&dst).unwrap();
		assert_that!(&scaled.nx(), eq(4));
		assert_that!(&close(scaled.get(1, 1, 0), 7.0), eq(true));
	}
}
