use anyhow::{ensure, Result};
use opencv::core::{self, Point, Rect, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cooked::CookedXcor;
use crate::image_io::GrayReader;

/// Whole-frame translation estimator against a fixed reference.
///
/// The reference is zero-padded by `maxmove` on every side; the SSD surface
/// over all translations up to `maxmove` is
/// `match = Q - cor^2 / imgsq` with `Q = sum of padded-reference^2 under the
/// window`, `cor` the reference/frame correlation and `imgsq` the frame
/// energy under the reference support mask.
///
/// The two per-frame surfaces reuse spectra cooked once at construction: with
/// `T` one of the padded reference `R'` or its support mask `A`, and the
/// frame `I` zero-embedded at offset `2m` into a canvas `J` of `R'`'s size,
///   xcor(J, T)[y, x] = sum_{v,u} J[y+v, x+u] T[v,u]
///                    = sum_{s,t} T[s,t] I[s-(2m-y), t-(2m-x)],
/// which is the matchTemplate(T, I) surface at lag `(2m-y, 2m-x)`: the
/// wanted surface read back to front. One flip of the `(2m+1)^2` output
/// recovers it.
///
/// Holds mutable scratch; NOT thread safe, one instance per worker.
pub struct GlobalRegistrator {
    ref_size: Size,
    maxmove: i32,
    origin_shift: Point,
    q: Mat,
    cooked_ref: CookedXcor,
    cooked_area: CookedXcor,
    canvas: Mat,
    canvas_sq: Mat,
    raw: Mat,
    cor: Mat,
    imgsq: Mat,
    imgsq_safe: Mat,
    corsq: Mat,
    ratio: Mat,
    surface: Mat,
}

impl GlobalRegistrator {
    pub fn new(reference: &Mat, maxmove: i32) -> Result<Self> {
        ensure!(
            reference.channels() == 1 && reference.depth() == core::CV_32F,
            "global registration needs a single-channel float reference"
        );
        ensure!(maxmove >= 1, "maxmove must be at least 1");
        let ref_size = reference.size()?;
        let m = maxmove;
        let padded = Size::new(ref_size.width + 2 * m, ref_size.height + 2 * m);
        let support = Rect::new(m, m, ref_size.width, ref_size.height);

        let mut ref_with_border = Mat::new_rows_cols_with_default(
            padded.height,
            padded.width,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        {
            let mut roi = Mat::roi_mut(&mut ref_with_border, support)?;
            reference.copy_to(&mut roi)?;
        }
        let mut area = Mat::new_rows_cols_with_default(
            padded.height,
            padded.width,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        {
            let mut roi = Mat::roi_mut(&mut area, support)?;
            roi.set_to(&Scalar::all(1.0), &core::no_array())?;
        }

        let mut ref_sq = Mat::default();
        core::multiply(&ref_with_border, &ref_with_border, &mut ref_sq, 1.0, -1)?;
        let search_mask = Mat::new_rows_cols_with_default(
            ref_size.height,
            ref_size.width,
            core::CV_32F,
            Scalar::all(1.0),
        )?;
        let mut q = Mat::default();
        imgproc::match_template(
            &ref_sq,
            &search_mask,
            &mut q,
            imgproc::TM_CCORR,
            &core::no_array(),
        )?;

        let corr_size = Size::new(2 * m + 1, 2 * m + 1);
        Ok(Self {
            ref_size,
            maxmove: m,
            origin_shift: Point::new(m, m),
            q,
            cooked_ref: CookedXcor::new(&ref_with_border, corr_size)?,
            cooked_area: CookedXcor::new(&area, corr_size)?,
            canvas: Mat::new_rows_cols_with_default(
                padded.height,
                padded.width,
                core::CV_32F,
                Scalar::all(0.0),
            )?,
            canvas_sq: Mat::default(),
            raw: Mat::default(),
            cor: Mat::default(),
            imgsq: Mat::default(),
            imgsq_safe: Mat::default(),
            corsq: Mat::default(),
            ratio: Mat::default(),
            surface: Mat::default(),
        })
    }

    /// Integer shift mapping reference coordinates into `img`, plus the
    /// intensity multiplier minimizing the L2 residual at that shift.
    pub fn find_shift(&mut self, img: &Mat) -> Result<(Point, f32)> {
        ensure!(
            img.size()? == self.ref_size && img.channels() == 1,
            "frame size does not match the registration reference"
        );
        let m2 = 2 * self.maxmove;
        self.canvas.set_to(&Scalar::all(0.0), &core::no_array())?;
        {
            let mut roi = Mat::roi_mut(
                &mut self.canvas,
                Rect::new(m2, m2, self.ref_size.width, self.ref_size.height),
            )?;
            img.copy_to(&mut roi)?;
        }

        self.cooked_ref.xcor(&self.canvas, &mut self.raw)?;
        core::flip(&self.raw, &mut self.cor, -1)?;

        core::multiply(&self.canvas, &self.canvas, &mut self.canvas_sq, 1.0, -1)?;
        self.cooked_area.xcor(&self.canvas_sq, &mut self.raw)?;
        core::flip(&self.raw, &mut self.imgsq, -1)?;

        core::multiply(&self.cor, &self.cor, &mut self.corsq, 1.0, -1)?;
        core::max(&self.imgsq, &Scalar::all(1e-12), &mut self.imgsq_safe)?;
        core::divide2(&self.corsq, &self.imgsq_safe, &mut self.ratio, 1.0, -1)?;
        core::subtract(&self.q, &self.ratio, &mut self.surface, &core::no_array(), -1)?;

        let mut minpoint = Point::default();
        core::min_max_loc(
            &self.surface,
            None,
            None,
            Some(&mut minpoint),
            None,
            &core::no_array(),
        )?;

        let qv = *self.q.at_2d::<f32>(minpoint.y, minpoint.x)?;
        let cv = *self.cor.at_2d::<f32>(minpoint.y, minpoint.x)?;
        let multiplier = if qv > 0.0 { cv / qv } else { 1.0 };
        Ok((self.origin_shift - minpoint, multiplier))
    }
}

/// Parallel pre-registration of all frames against `refimg`. Results come
/// back in input order; workers own their registrator and reader.
pub fn get_global_shifts(
    files: &[PathBuf],
    refimg: &Mat,
    maxmove: i32,
) -> Result<Vec<(Point, f32)>> {
    let chunk = files.len().div_ceil(rayon::current_num_threads()).max(1);
    let progress = AtomicUsize::new(0);
    let chunks: Vec<Vec<(Point, f32)>> = files
        .par_chunks(chunk)
        .map(|paths| -> Result<Vec<(Point, f32)>> {
            let mut reader = GrayReader::new();
            let mut registrator = GlobalRegistrator::new(refimg, maxmove)?;
            let mut out = Vec::with_capacity(paths.len());
            for path in paths {
                reader.read(path)?;
                out.push(registrator.find_shift(reader.gray())?);
                let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("pre-registered {}/{}", done, files.len());
            }
            Ok(out)
        })
        .collect::<Result<_>>()?;
    Ok(chunks.into_iter().flatten().collect())
}

/// Intersection of the reference rectangle over all globally shifted frames,
/// clipped to the reference rectangle itself. `None` when the frames share no
/// common area.
pub fn common_rectangle(shifts: &[Point], size: Size) -> Option<Rect> {
    let mut common = Rect::new(0, 0, size.width, size.height);
    for shift in shifts {
        common = common & Rect::new(-shift.x, -shift.y, size.width, size.height);
        if common.empty() {
            return None;
        }
    }
    Some(common)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_reference() -> Result<Mat> {
        let mut img =
            Mat::new_rows_cols_with_default(40, 40, core::CV_32F, Scalar::all(0.1))?;
        // A few asymmetric bright blobs so the SSD surface has a single
        // unambiguous minimum.
        for (r, c, v) in [(12, 9, 2.0f32), (20, 26, 3.0), (30, 15, 1.5), (8, 31, 2.5)] {
            *img.at_2d_mut::<f32>(r, c)? = v;
            *img.at_2d_mut::<f32>(r + 1, c)? = v * 0.5;
            *img.at_2d_mut::<f32>(r, c + 1)? = v * 0.25;
        }
        Ok(img)
    }

    fn shifted(reference: &Mat, t: Point) -> Result<Mat> {
        let mut out = Mat::new_rows_cols_with_default(
            reference.rows(),
            reference.cols(),
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        for y in 0..out.rows() {
            for x in 0..out.cols() {
                let (sy, sx) = (y + t.y, x + t.x);
                if sy >= 0 && sx >= 0 && sy < reference.rows() && sx < reference.cols() {
                    *out.at_2d_mut::<f32>(y, x)? = *reference.at_2d::<f32>(sy, sx)?;
                }
            }
        }
        Ok(out)
    }

    #[test]
    fn find_shift_is_translation_invariant() -> Result<()> {
        let reference = test_reference()?;
        let mut registrator = GlobalRegistrator::new(&reference, 6)?;
        for t in [
            Point::new(0, 0),
            Point::new(3, -2),
            Point::new(-5, 4),
            Point::new(6, 6),
        ] {
            let frame = shifted(&reference, t)?;
            let (shift, _) = registrator.find_shift(&frame)?;
            assert_eq!(shift, Point::new(-t.x, -t.y), "for translation {:?}", t);
        }
        Ok(())
    }

    #[test]
    fn multiplier_tracks_intensity_scaling() -> Result<()> {
        let reference = test_reference()?;
        let mut frame = Mat::default();
        reference.convert_to(&mut frame, core::CV_32F, 2.0, 0.0)?;
        let mut registrator = GlobalRegistrator::new(&reference, 4)?;
        let (shift, multiplier) = registrator.find_shift(&frame)?;
        assert_eq!(shift, Point::new(0, 0));
        assert!((multiplier - 2.0).abs() < 1e-3, "multiplier = {}", multiplier);
        Ok(())
    }

    #[test]
    fn common_rectangle_intersects_shifted_frames() {
        let size = Size::new(10, 10);
        let common =
            common_rectangle(&[Point::new(0, 0), Point::new(3, -2)], size).unwrap();
        assert_eq!(common, Rect::new(0, 2, 7, 8));

        assert!(common_rectangle(&[Point::new(0, 0), Point::new(10, 0)], size).is_none());
    }

    #[test]
    fn identical_frames_share_the_full_rectangle() {
        let size = Size::new(12, 8);
        let common = common_rectangle(&[Point::new(0, 0); 5], size).unwrap();
        assert_eq!(common, Rect::new(0, 0, 12, 8));
    }
}
