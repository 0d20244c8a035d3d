use anyhow::{ensure, Context, Result};
use opencv::core;
use opencv::imgcodecs;
use opencv::prelude::*;
use std::path::Path;

use crate::compat;

/// sRGB electro-optical transfer function: encoded value to linear light.
pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

/// Inverse transfer function applied before quantizing output pixels.
pub fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

fn srgb_decode_inplace(img: &mut Mat) -> Result<()> {
    ensure!(img.is_continuous(), "decoded image must be continuous");
    match img.channels() {
        1 => {
            for v in img.data_typed_mut::<f32>()? {
                *v = srgb_to_linear(*v);
            }
        }
        3 => {
            for px in img.data_typed_mut::<core::Vec3f>()? {
                for k in 0..3 {
                    px[k] = srgb_to_linear(px[k]);
                }
            }
        }
        n => anyhow::bail!("unsupported channel count {}", n),
    }
    Ok(())
}

fn srgb_encode_inplace(img: &mut Mat) -> Result<()> {
    ensure!(img.is_continuous(), "output image must be continuous");
    match img.channels() {
        1 => {
            for v in img.data_typed_mut::<f32>()? {
                *v = linear_to_srgb(*v);
            }
        }
        3 => {
            for px in img.data_typed_mut::<core::Vec3f>()? {
                for k in 0..3 {
                    px[k] = linear_to_srgb(px[k]);
                }
            }
        }
        n => anyhow::bail!("unsupported channel count {}", n),
    }
    Ok(())
}

/// Decode an image file into a linear-light `CV_32FC3` (BGR) matrix with
/// values nominally in [0, 1].
pub fn load_image(path: &Path) -> Result<Mat> {
    let file = path
        .to_str()
        .with_context(|| format!("non-UTF-8 path {:?}", path))?;
    let img = imgcodecs::imread(file, imgcodecs::IMREAD_COLOR | imgcodecs::IMREAD_ANYDEPTH)?;
    ensure!(!img.empty(), "failed to decode {}", path.display());

    let scale = match img.depth() {
        core::CV_8U => 1.0 / 255.0,
        core::CV_16U => 1.0 / 65535.0,
        core::CV_32F => 1.0,
        d => anyhow::bail!("{}: unsupported pixel depth {}", path.display(), d),
    };
    let mut float_img = Mat::default();
    img.convert_to(&mut float_img, core::CV_32F, scale, 0.0)?;
    srgb_decode_inplace(&mut float_img)?;
    log::debug!(
        "loaded {} ({}x{}, {} channels)",
        path.display(),
        float_img.cols(),
        float_img.rows(),
        float_img.channels()
    );
    Ok(float_img)
}

/// Decoder with reusable scratch buffers for the colour frame and its gray
/// conversion. NOT thread safe; construct one per worker.
#[derive(Default)]
pub struct GrayReader {
    color: Mat,
    gray: Mat,
}

impl GrayReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `path` into the internal colour buffer and refresh the gray one.
    pub fn read(&mut self, path: &Path) -> Result<()> {
        self.color = load_image(path)?;
        compat::cvt_color(&self.color, &mut self.gray, opencv::imgproc::COLOR_BGR2GRAY)?;
        Ok(())
    }

    /// Linear-light BGR frame from the last `read`.
    pub fn color(&self) -> &Mat {
        &self.color
    }

    /// Single-channel float view of the last `read`.
    pub fn gray(&self) -> &Mat {
        &self.gray
    }
}

/// Write a float image (gray or BGR) as 16-bit PNG/TIFF: min-max normalize
/// over all channels, re-apply the sRGB transfer curve, quantize.
pub fn write_image(path: &Path, img: &Mat) -> Result<()> {
    ensure!(!img.empty(), "refusing to write an empty image");
    let file = path
        .to_str()
        .with_context(|| format!("non-UTF-8 path {:?}", path))?;

    let mut channels = core::Vector::<Mat>::new();
    core::split(img, &mut channels)?;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for ch in channels.iter() {
        let mut lo = 0.0;
        let mut hi = 0.0;
        core::min_max_loc(
            &ch,
            Some(&mut lo),
            Some(&mut hi),
            None,
            None,
            &core::no_array(),
        )?;
        min = min.min(lo);
        max = max.max(hi);
    }

    let mut normalized = Mat::default();
    if max > min {
        let alpha = 1.0 / (max - min);
        img.convert_to(&mut normalized, core::CV_32F, alpha, -min * alpha)?;
    } else {
        img.convert_to(&mut normalized, core::CV_32F, 0.0, 0.0)?;
    }
    srgb_encode_inplace(&mut normalized)?;

    let mut out16 = Mat::default();
    normalized.convert_to(&mut out16, core::CV_16U, 65535.0, 0.0)?;
    let ok = imgcodecs::imwrite(file, &out16, &core::Vector::new())?;
    ensure!(ok, "failed to write {}", path.display());
    log::info!("wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_transfer_round_trip() {
        for i in 0..=100 {
            let v = i as f32 / 100.0;
            let rt = linear_to_srgb(srgb_to_linear(v));
            assert!((rt - v).abs() < 1e-5, "round trip failed at {}", v);
        }
    }

    #[test]
    fn srgb_linear_segment_is_continuous() {
        let below = srgb_to_linear(0.04044);
        let above = srgb_to_linear(0.04046);
        assert!((above - below).abs() < 1e-5);
    }

    #[test]
    fn decode_inplace_converts_both_layouts() -> Result<()> {
        let mut gray =
            Mat::new_rows_cols_with_default(2, 2, core::CV_32F, core::Scalar::all(0.5))?;
        srgb_decode_inplace(&mut gray)?;
        let v = *gray.at_2d::<f32>(0, 0)?;
        assert!((v - srgb_to_linear(0.5)).abs() < 1e-7);

        let mut color =
            Mat::new_rows_cols_with_default(2, 2, core::CV_32FC3, core::Scalar::all(0.25))?;
        srgb_decode_inplace(&mut color)?;
        let px = *color.at_2d::<core::Vec3f>(1, 1)?;
        assert!((px[2] - srgb_to_linear(0.25)).abs() < 1e-7);
        Ok(())
    }
}
