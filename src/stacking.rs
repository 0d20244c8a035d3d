use anyhow::{ensure, Result};
use opencv::core::{self, Rect, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::compat;
use crate::context::InputImage;
use crate::image_io;

/// Average the globally aligned frames into a colour reference image over the
/// full reference rectangle. Each frame contributes to the pixels it covers
/// after applying its global shift; coverage is tracked per pixel and the sum
/// divided by it, so partially covered borders stay unbiased. Frames are
/// weighted by the inverse of their intensity multiplier to keep unevenly
/// exposed frames from tilting the reference.
pub fn mean_image(images: &[InputImage], imagesize: Size) -> Result<Mat> {
    ensure!(!images.is_empty(), "no input frames");
    let ref_rect = Rect::new(0, 0, imagesize.width, imagesize.height);

    struct Acc {
        sum: Mat,
        count: Mat,
    }

    let chunk = images.len().div_ceil(rayon::current_num_threads()).max(1);
    let progress = AtomicUsize::new(0);
    let chunks: Vec<Acc> = images
        .par_chunks(chunk)
        .map(|frames| -> Result<Acc> {
            let mut sum = Mat::new_rows_cols_with_default(
                imagesize.height,
                imagesize.width,
                core::CV_32FC3,
                Scalar::all(0.0),
            )?;
            let mut count = Mat::new_rows_cols_with_default(
                imagesize.height,
                imagesize.width,
                core::CV_32F,
                Scalar::all(0.0),
            )?;
            let ones = Mat::new_rows_cols_with_default(
                imagesize.height,
                imagesize.width,
                core::CV_32F,
                Scalar::all(1.0),
            )?;
            for image in frames {
                let img = image_io::load_image(&image.filename)?;
                ensure!(
                    img.size()? == imagesize,
                    "{}: frame size differs from the first frame",
                    image.filename.display()
                );
                let gs = image.global_shift;
                let overlap = ref_rect & (Rect::new(0, 0, img.cols(), img.rows()) - gs);
                if overlap.empty() {
                    log::warn!(
                        "{}: no overlap with the reference rectangle",
                        image.filename.display()
                    );
                    continue;
                }
                let weight = if image.global_multiplier.abs() > 1e-6 {
                    1.0 / image.global_multiplier as f64
                } else {
                    1.0
                };
                let src = Mat::roi(&img, overlap + gs)?;
                let mut scaled = Mat::default();
                src.convert_to(&mut scaled, core::CV_32F, weight, 0.0)?;
                {
                    let mut dst = Mat::roi_mut(&mut sum, overlap)?;
                    imgproc::accumulate(&scaled, &mut dst, &core::no_array())?;
                }
                {
                    let ones_roi = Mat::roi(&ones, overlap)?;
                    let mut dst = Mat::roi_mut(&mut count, overlap)?;
                    imgproc::accumulate(&ones_roi, &mut dst, &core::no_array())?;
                }
                let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("averaged frame {}/{}", done, images.len());
            }
            Ok(Acc { sum, count })
        })
        .collect::<Result<_>>()?;

    let mut total: Option<Acc> = None;
    for acc in chunks {
        match &mut total {
            Some(t) => {
                imgproc::accumulate(&acc.sum, &mut t.sum, &core::no_array())?;
                imgproc::accumulate(&acc.count, &mut t.count, &core::no_array())?;
            }
            None => total = Some(acc),
        }
    }
    let total = total.expect("at least one chunk");
    divide_channels_by_mask(&total.sum, &total.count, 1.0)
}

/// Per-channel division of an accumulated colour image by a single-channel
/// weight mask, with `dst = scale * sum / mask`. Pixels whose weight is
/// (numerically) zero never received data and come out black.
pub fn divide_channels_by_mask(sum: &Mat, mask: &Mat, scale: f64) -> Result<Mat> {
    ensure!(
        sum.channels() == 3 && mask.channels() == 1,
        "expected a colour sum and a single-channel mask"
    );
    const EPS: f64 = 1e-6;

    let mut mask3 = Mat::default();
    compat::cvt_color(mask, &mut mask3, imgproc::COLOR_GRAY2BGR)?;
    let mut safe = Mat::default();
    core::max(&mask3, &Scalar::all(EPS), &mut safe)?;
    let mut out = Mat::default();
    core::divide2(sum, &safe, &mut out, scale, -1)?;

    let mut uncovered = Mat::default();
    core::compare(mask, &Scalar::all(EPS), &mut uncovered, core::CMP_LT)?;
    out.set_to(&Scalar::all(0.0), &uncovered)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Point;

    #[test]
    fn divide_rescales_partial_coverage() -> Result<()> {
        let mut sum =
            Mat::new_rows_cols_with_default(2, 3, core::CV_32FC3, Scalar::all(6.0))?;
        *sum.at_2d_mut::<core::Vec3f>(0, 0)? = core::Vec3f::from([3.0, 3.0, 3.0]);
        *sum.at_2d_mut::<core::Vec3f>(1, 2)? = core::Vec3f::from([0.0, 0.0, 0.0]);

        let mut mask = Mat::new_rows_cols_with_default(2, 3, core::CV_32F, Scalar::all(2.0))?;
        *mask.at_2d_mut::<f32>(0, 0)? = 1.0;
        *mask.at_2d_mut::<f32>(1, 2)? = 0.0;

        // scale = frame count: fully covered pixels keep the plain sum.
        let out = divide_channels_by_mask(&sum, &mask, 2.0)?;
        assert_eq!(*out.at_2d::<core::Vec3f>(0, 1)?, core::Vec3f::from([6.0; 3]));
        // Half-covered pixels are rescaled to full weight.
        assert_eq!(*out.at_2d::<core::Vec3f>(0, 0)?, core::Vec3f::from([6.0; 3]));
        // Uncovered pixels are black, not NaN.
        assert_eq!(*out.at_2d::<core::Vec3f>(1, 2)?, core::Vec3f::from([0.0; 3]));
        Ok(())
    }

    #[test]
    fn mean_of_shifted_constant_frames_is_flat() -> Result<()> {
        let dir = std::env::temp_dir().join("luckystacker_test_mean");
        std::fs::create_dir_all(&dir)?;
        let img8 =
            Mat::new_rows_cols_with_default(16, 16, core::CV_8UC3, Scalar::all(128.0))?;
        let path_a = dir.join("a.png");
        let path_b = dir.join("b.png");
        opencv::imgcodecs::imwrite(path_a.to_str().unwrap(), &img8, &core::Vector::new())?;
        opencv::imgcodecs::imwrite(path_b.to_str().unwrap(), &img8, &core::Vector::new())?;

        let expected = *image_io::load_image(&path_a)?.at_2d::<core::Vec3f>(4, 4)?;

        let mut frames = vec![InputImage::new(&path_a), InputImage::new(&path_b)];
        frames[1].global_shift = Point::new(3, -2);

        let mean = mean_image(&frames, Size::new(16, 16))?;
        assert_eq!(mean.size()?, Size::new(16, 16));
        // Both the doubly and the singly covered pixels equal the constant.
        for &(r, c) in &[(4, 4), (0, 0), (15, 15), (1, 14)] {
            let got = *mean.at_2d::<core::Vec3f>(r, c)?;
            for k in 0..3 {
                assert!(
                    (got[k] - expected[k]).abs() < 1e-5,
                    "pixel ({}, {}) channel {}: {} vs {}",
                    r,
                    c,
                    k,
                    got[k],
                    expected[k]
                );
            }
        }
        Ok(())
    }
}
