use anyhow::{ensure, Result};
use opencv::core::{self, Rect, Scalar, Size};
use opencv::prelude::*;

/// Blockwise FFT cross-correlation with a precomputed template spectrum.
///
/// The template DFT is computed once at construction; `xcor` then correlates
/// it against arbitrarily sized images by tiling the output, running a
/// forward DFT, a conjugate spectrum multiply and an inverse DFT per tile.
/// Adapted from OpenCV's internal `crossCorr`, restricted to CV_32F data.
pub struct CookedXcor {
    corr_size: Size,
    templ_size: Size,
    templ_channels: i32,
    block_size: Size,
    dft_size: Size,
    /// Per-channel CCS-packed template spectra, stacked vertically.
    dft_templ: Mat,
}

impl CookedXcor {
    pub fn new(templ: &Mat, corr_size: Size) -> Result<Self> {
        const BLOCK_SCALE: f64 = 4.5;
        const MIN_BLOCK_SIZE: i32 = 256;

        ensure!(
            templ.depth() == core::CV_32F,
            "cooked templates require CV_32F data"
        );
        ensure!(
            corr_size.width > 0 && corr_size.height > 0,
            "empty correlation output requested"
        );
        let tcn = templ.channels();
        let templ_size = templ.size()?;

        let mut block_size = Size::new(
            ((templ_size.width as f64 * BLOCK_SCALE).round() as i32)
                .max(MIN_BLOCK_SIZE - templ_size.width + 1)
                .min(corr_size.width),
            ((templ_size.height as f64 * BLOCK_SCALE).round() as i32)
                .max(MIN_BLOCK_SIZE - templ_size.height + 1)
                .min(corr_size.height),
        );

        let dft_size = Size::new(
            core::get_optimal_dft_size(block_size.width + templ_size.width - 1)?.max(2),
            core::get_optimal_dft_size(block_size.height + templ_size.height - 1)?,
        );
        ensure!(
            dft_size.width > 0 && dft_size.height > 0,
            "the input arrays are too big"
        );

        // The optimal DFT length may exceed the requested one; grow the block
        // to fill it, it comes for free.
        block_size.width = (dft_size.width - templ_size.width + 1).min(corr_size.width);
        block_size.height = (dft_size.height - templ_size.height + 1).min(corr_size.height);

        let mut dft_templ = Mat::new_rows_cols_with_default(
            dft_size.height * tcn,
            dft_size.width,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        for k in 0..tcn {
            let yofs = k * dft_size.height;
            {
                let mut dst1 = Mat::roi_mut(
                    &mut dft_templ,
                    Rect::new(0, yofs, templ_size.width, templ_size.height),
                )?;
                if tcn > 1 {
                    core::extract_channel(templ, &mut dst1, k)?;
                } else {
                    templ.copy_to(&mut dst1)?;
                }
            }
            let band_rect = Rect::new(0, yofs, dft_size.width, dft_size.height);
            let src = Mat::roi(&dft_templ, band_rect)?.try_clone()?;
            let mut dst = Mat::roi_mut(&mut dft_templ, band_rect)?;
            core::dft(&src, &mut dst, 0, templ_size.height)?;
        }

        Ok(Self {
            corr_size,
            templ_size,
            templ_channels: tcn,
            block_size,
            dft_size,
            dft_templ,
        })
    }

    /// Linear cross-correlation of the cooked template against `img`:
    /// `corr[y,x] = sum_{v,u} img[y+v, x+u] * templ[v,u]`, pixels outside
    /// `img` taken as zero. Multi-channel images accumulate over channels.
    pub fn xcor(&self, img: &impl core::MatTraitConst, corr: &mut Mat) -> Result<()> {
        ensure!(img.depth() == core::CV_32F, "query image must be CV_32F");
        let cn = img.channels();
        ensure!(
            cn == self.templ_channels,
            "query channel count {} does not match template's {}",
            cn,
            self.templ_channels
        );
        ensure!(
            self.corr_size.height <= img.rows() + self.templ_size.height - 1
                && self.corr_size.width <= img.cols() + self.templ_size.width - 1,
            "correlation output larger than the full correlation support"
        );

        if corr.size()? != self.corr_size || corr.typ() != core::CV_32F {
            *corr = Mat::new_rows_cols_with_default(
                self.corr_size.height,
                self.corr_size.width,
                core::CV_32F,
                Scalar::all(0.0),
            )?;
        }

        let tiles_x = (self.corr_size.width + self.block_size.width - 1) / self.block_size.width;
        let tiles_y = (self.corr_size.height + self.block_size.height - 1) / self.block_size.height;

        let mut dft_img = Mat::new_rows_cols_with_default(
            self.dft_size.height,
            self.dft_size.width,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        let mut plane = Mat::default();
        let mut spectrum = Mat::default();

        for i in 0..tiles_x * tiles_y {
            let x = (i % tiles_x) * self.block_size.width;
            let y = (i / tiles_x) * self.block_size.height;
            let bsz = Size::new(
                self.block_size.width.min(self.corr_size.width - x),
                self.block_size.height.min(self.corr_size.height - y),
            );
            let dsz = Size::new(
                bsz.width + self.templ_size.width - 1,
                bsz.height + self.templ_size.height - 1,
            );
            let x2 = img.cols().min(x + dsz.width);
            let y2 = img.rows().min(y + dsz.height);

            for k in 0..cn {
                dft_img.set_to(&Scalar::all(0.0), &core::no_array())?;
                if x2 > x && y2 > y {
                    let src0 = Mat::roi(img, Rect::new(x, y, x2 - x, y2 - y))?;
                    let mut dst1 =
                        Mat::roi_mut(&mut dft_img, Rect::new(0, 0, x2 - x, y2 - y))?;
                    if cn > 1 {
                        core::extract_channel(&src0, &mut plane, k)?;
                        plane.copy_to(&mut dst1)?;
                    } else {
                        src0.copy_to(&mut dst1)?;
                    }
                }
                let src = dft_img.clone();
                core::dft(&src, &mut dft_img, 0, dsz.height)?;

                let yofs = if self.templ_channels > 1 {
                    k * self.dft_size.height
                } else {
                    0
                };
                let templ_band = Mat::roi(
                    &self.dft_templ,
                    Rect::new(0, yofs, self.dft_size.width, self.dft_size.height),
                )?;
                core::mul_spectrums(&dft_img, &templ_band, &mut spectrum, 0, true)?;
                core::dft(
                    &spectrum,
                    &mut dft_img,
                    core::DFT_INVERSE + core::DFT_SCALE,
                    bsz.height,
                )?;

                let src_block = Mat::roi(&dft_img, Rect::new(0, 0, bsz.width, bsz.height))?;
                let mut cdst = Mat::roi_mut(corr, Rect::new(x, y, bsz.width, bsz.height))?;
                if k == 0 {
                    src_block.copy_to(&mut cdst)?;
                } else {
                    let prev = cdst.try_clone()?;
                    core::add(&src_block, &prev, &mut cdst, &core::no_array(), -1)?;
                }
            }
        }
        Ok(())
    }
}

/// A template cooked for matching inside a fixed-size search window. The
/// correlation surface has one cell per admissible template position.
pub struct CookedTemplate {
    templ_type: i32,
    cxc: CookedXcor,
}

impl CookedTemplate {
    pub fn new(templ: &Mat, search_size: Size) -> Result<Self> {
        ensure!(
            templ.cols() <= search_size.width && templ.rows() <= search_size.height,
            "template does not fit inside the search window"
        );
        let corr_size = Size::new(
            search_size.width - templ.cols() + 1,
            search_size.height - templ.rows() + 1,
        );
        Ok(Self {
            templ_type: templ.typ(),
            cxc: CookedXcor::new(templ, corr_size)?,
        })
    }

    pub fn match_into(&self, img: &impl core::MatTraitConst, result: &mut Mat) -> Result<()> {
        ensure!(
            img.typ() == self.templ_type,
            "query type does not match the cooked template"
        );
        self.cxc.xcor(img, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_pattern(img: &mut Mat, seed: i32) -> Result<()> {
        for r in 0..img.rows() {
            for c in 0..img.cols() {
                *img.at_2d_mut::<f32>(r, c)? =
                    (((r * 13 + c * 7 + seed) % 17) as f32 - 8.0) * 0.125;
            }
        }
        Ok(())
    }

    fn direct_xcor(img: &Mat, templ: &Mat, corr_size: Size) -> Result<Mat> {
        let mut out = Mat::new_rows_cols_with_default(
            corr_size.height,
            corr_size.width,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        for y in 0..corr_size.height {
            for x in 0..corr_size.width {
                let mut acc = 0.0f64;
                for v in 0..templ.rows() {
                    for u in 0..templ.cols() {
                        let (iy, ix) = (y + v, x + u);
                        if iy < img.rows() && ix < img.cols() {
                            acc += (*img.at_2d::<f32>(iy, ix)? as f64)
                                * (*templ.at_2d::<f32>(v, u)? as f64);
                        }
                    }
                }
                *out.at_2d_mut::<f32>(y, x)? = acc as f32;
            }
        }
        Ok(out)
    }

    fn assert_close(a: &Mat, b: &Mat, tol: f32) -> Result<()> {
        assert_eq!(a.size()?, b.size()?);
        for r in 0..a.rows() {
            for c in 0..a.cols() {
                let (va, vb) = (*a.at_2d::<f32>(r, c)?, *b.at_2d::<f32>(r, c)?);
                assert!(
                    (va - vb).abs() < tol,
                    "mismatch at ({}, {}): {} vs {}",
                    r,
                    c,
                    va,
                    vb
                );
            }
        }
        Ok(())
    }

    #[test]
    fn matches_direct_correlation() -> Result<()> {
        let mut templ =
            Mat::new_rows_cols_with_default(5, 4, core::CV_32F, Scalar::all(0.0))?;
        let mut img =
            Mat::new_rows_cols_with_default(20, 18, core::CV_32F, Scalar::all(0.0))?;
        fill_pattern(&mut templ, 3)?;
        fill_pattern(&mut img, 11)?;

        let corr_size = Size::new(18 - 4 + 1, 20 - 5 + 1);
        let cooked = CookedXcor::new(&templ, corr_size)?;
        let mut corr = Mat::default();
        cooked.xcor(&img, &mut corr)?;

        let expect = direct_xcor(&img, &templ, corr_size)?;
        assert_close(&corr, &expect, 1e-3)
    }

    #[test]
    fn tiled_output_matches_direct_correlation() -> Result<()> {
        // Output wider than one block forces the multi-tile path.
        let mut templ =
            Mat::new_rows_cols_with_default(4, 4, core::CV_32F, Scalar::all(0.0))?;
        let mut img =
            Mat::new_rows_cols_with_default(24, 300, core::CV_32F, Scalar::all(0.0))?;
        fill_pattern(&mut templ, 5)?;
        fill_pattern(&mut img, 1)?;

        let corr_size = Size::new(297, 21);
        let cooked = CookedXcor::new(&templ, corr_size)?;
        let mut corr = Mat::default();
        cooked.xcor(&img, &mut corr)?;

        let expect = direct_xcor(&img, &templ, corr_size)?;
        assert_close(&corr, &expect, 1e-3)
    }

    #[test]
    fn multi_channel_query_accumulates_over_channels() -> Result<()> {
        let mut t0 = Mat::new_rows_cols_with_default(5, 4, core::CV_32F, Scalar::all(0.0))?;
        let mut t1 = t0.clone();
        let mut i0 = Mat::new_rows_cols_with_default(20, 18, core::CV_32F, Scalar::all(0.0))?;
        let mut i1 = i0.clone();
        fill_pattern(&mut t0, 2)?;
        fill_pattern(&mut t1, 7)?;
        fill_pattern(&mut i0, 4)?;
        fill_pattern(&mut i1, 13)?;

        let mut templ = Mat::default();
        let mut img = Mat::default();
        let mut planes = core::Vector::<Mat>::new();
        planes.push(t0.clone());
        planes.push(t1.clone());
        core::merge(&planes, &mut templ)?;
        planes.clear();
        planes.push(i0.clone());
        planes.push(i1.clone());
        core::merge(&planes, &mut img)?;

        let corr_size = Size::new(15, 16);
        let cooked = CookedXcor::new(&templ, corr_size)?;
        let mut corr = Mat::default();
        cooked.xcor(&img, &mut corr)?;

        let e0 = direct_xcor(&i0, &t0, corr_size)?;
        let e1 = direct_xcor(&i1, &t1, corr_size)?;
        let mut expect = Mat::default();
        core::add(&e0, &e1, &mut expect, &core::no_array(), -1)?;
        assert_close(&corr, &expect, 1e-3)
    }

    #[test]
    fn search_window_surface_peaks_at_embedded_template() -> Result<()> {
        let mut templ =
            Mat::new_rows_cols_with_default(6, 6, core::CV_32F, Scalar::all(0.0))?;
        fill_pattern(&mut templ, 9)?;
        // Embed the template at (4, 3) inside a larger window of zeros.
        let mut window =
            Mat::new_rows_cols_with_default(16, 16, core::CV_32F, Scalar::all(0.0))?;
        {
            let mut roi = Mat::roi_mut(&mut window, Rect::new(3, 4, 6, 6))?;
            templ.copy_to(&mut roi)?;
        }

        let cooked = CookedTemplate::new(&templ, Size::new(16, 16))?;
        let mut corr = Mat::default();
        cooked.match_into(&window, &mut corr)?;
        assert_eq!(corr.size()?, Size::new(11, 11));

        let mut max_loc = core::Point::default();
        core::min_max_loc(
            &corr,
            None,
            None,
            None,
            Some(&mut max_loc),
            &core::no_array(),
        )?;
        assert_eq!(max_loc, core::Point::new(3, 4));
        Ok(())
    }
}
