use anyhow::{ensure, Result};
use opencv::core::{self, Point, Rect, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::patch::PatchCollection;

/// Lattice coordinate of reference coordinate `c` at supersampling `s`: the
/// output pixel whose centre maps to `c` (rounded down for even `s`).
fn lattice_coord(c: i32, s: i32) -> i32 {
    ((2 * c + 1) * s - 1) / 2
}

/// Warps frames by a Gaussian-RBF interpolation of per-patch shifts.
///
/// All heavy precomputation happens at construction: the inverted coefficient
/// matrix, the separable Gaussian kernel, and the base coordinate fields of
/// the (super-sampled) output lattice. `warp` is `&self` and safe to share
/// across workers.
pub struct RbfWarper {
    input_size: Size,
    /// Patch centres in output-lattice coordinates.
    centers: Vec<Point>,
    /// Bounding rectangle of centres and output, lattice coordinates.
    bases_rect: Rect,
    /// Output rectangle relative to `bases_rect`.
    out_in_bases: Rect,
    kinv: Mat,
    kernel: Mat,
    xbase: Mat,
    ybase: Mat,
    mask_ones: Mat,
}

impl RbfWarper {
    pub fn new(
        patches: &PatchCollection,
        input_size: Size,
        output_rect: Rect,
        sigma: f32,
        supersampling: i32,
    ) -> Result<Self> {
        ensure!(supersampling >= 1, "supersampling must be at least 1");
        ensure!(sigma > 0.0, "sigma must be positive");
        let s = supersampling;
        let out_size = Size::new(output_rect.width * s, output_rect.height * s);
        ensure!(
            out_size.width > 0 && out_size.height > 0,
            "empty warp output rectangle"
        );

        let out_lattice = Rect::new(
            output_rect.x * s,
            output_rect.y * s,
            out_size.width,
            out_size.height,
        );
        let centers: Vec<Point> = patches
            .iter()
            .map(|p| {
                let c = p.center();
                Point::new(lattice_coord(c.x, s), lattice_coord(c.y, s))
            })
            .collect();
        let mut bases_rect = out_lattice;
        for c in &centers {
            bases_rect = bases_rect | Rect::new(c.x, c.y, 1, 1);
        }
        let out_in_bases = out_lattice - bases_rect.tl();

        let sigma_s = sigma * s as f32;
        let half_width = (5.0 * sigma_s).ceil() as i32;
        let mut kernel = Mat::new_rows_cols_with_default(
            1,
            2 * half_width + 1,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        for k in -half_width..=half_width {
            *kernel.at_2d_mut::<f32>(0, k + half_width)? =
                (-0.5 * (k * k) as f32 / (sigma_s * sigma_s)).exp();
        }

        let n = centers.len() as i32;
        let mut kinv = Mat::default();
        if n > 0 {
            let mut coeffs =
                Mat::new_rows_cols_with_default(n, n, core::CV_32F, Scalar::all(0.0))?;
            for i in 0..n as usize {
                *coeffs.at_2d_mut::<f32>(i as i32, i as i32)? = 1.0;
                for j in i + 1..n as usize {
                    let dx = (centers[i].x - centers[j].x) as f32;
                    let dy = (centers[i].y - centers[j].y) as f32;
                    let v = (-0.5 * (dx * dx + dy * dy) / (sigma_s * sigma_s)).exp();
                    *coeffs.at_2d_mut::<f32>(i as i32, j as i32)? = v;
                    *coeffs.at_2d_mut::<f32>(j as i32, i as i32)? = v;
                }
            }
            let ok = core::invert(&coeffs, &mut kinv, core::DECOMP_CHOLESKY)?;
            if ok == 0.0 {
                log::warn!("RBF coefficient matrix is singular, falling back to SVD inverse");
                core::invert(&coeffs, &mut kinv, core::DECOMP_SVD)?;
            }
        }

        // Reference coordinate sampled by the centre of each output pixel.
        let mut xbase = Mat::new_rows_cols_with_default(
            out_size.height,
            out_size.width,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        let mut ybase = xbase.clone();
        for v in 0..out_size.height {
            let yc = (2 * v - s + 1) as f32 / (2 * s) as f32 + output_rect.y as f32;
            for u in 0..out_size.width {
                let xc = (2 * u - s + 1) as f32 / (2 * s) as f32 + output_rect.x as f32;
                *xbase.at_2d_mut::<f32>(v, u)? = xc;
                *ybase.at_2d_mut::<f32>(v, u)? = yc;
            }
        }

        Ok(Self {
            input_size,
            centers,
            bases_rect,
            out_in_bases,
            kinv,
            kernel,
            xbase,
            ybase,
            mask_ones: Mat::new_rows_cols_with_default(
                input_size.height,
                input_size.width,
                core::CV_32F,
                Scalar::all(1.0),
            )?,
        })
    }

    /// Dense sampling-coordinate fields (input-image space) for a frame with
    /// the given per-patch shifts and global shift.
    fn build_maps(&self, global_shift: Point, shifts: &Mat) -> Result<(Mat, Mat)> {
        let mut xmap = Mat::default();
        let mut ymap = Mat::default();
        if shifts.empty() || self.centers.is_empty() {
            core::add(
                &self.xbase,
                &Scalar::all(global_shift.x as f64),
                &mut xmap,
                &core::no_array(),
                -1,
            )?;
            core::add(
                &self.ybase,
                &Scalar::all(global_shift.y as f64),
                &mut ymap,
                &core::no_array(),
                -1,
            )?;
            return Ok((xmap, ymap));
        }

        ensure!(
            shifts.rows() == self.centers.len() as i32
                && shifts.cols() == 2
                && shifts.typ() == core::CV_32F,
            "shift matrix must be {}x2 CV_32F",
            self.centers.len()
        );
        let mut weights = Mat::default();
        core::gemm(
            &self.kinv,
            shifts,
            1.0,
            &Mat::default(),
            0.0,
            &mut weights,
            0,
        )?;

        // Scatter the weights as single-pixel impulses at the patch centres,
        // then synthesize the dense field with the separable Gaussian.
        let mut xp = Mat::new_rows_cols_with_default(
            self.bases_rect.height,
            self.bases_rect.width,
            core::CV_32F,
            Scalar::all(0.0),
        )?;
        let mut yp = xp.clone();
        for (i, c) in self.centers.iter().enumerate() {
            let p = *c - self.bases_rect.tl();
            *xp.at_2d_mut::<f32>(p.y, p.x)? += *weights.at_2d::<f32>(i as i32, 0)?;
            *yp.at_2d_mut::<f32>(p.y, p.x)? += *weights.at_2d::<f32>(i as i32, 1)?;
        }

        let mut xfield = Mat::default();
        let mut yfield = Mat::default();
        imgproc::sep_filter_2d(
            &xp,
            &mut xfield,
            core::CV_32F,
            &self.kernel,
            &self.kernel,
            Point::new(-1, -1),
            0.0,
            core::BORDER_CONSTANT,
        )?;
        imgproc::sep_filter_2d(
            &yp,
            &mut yfield,
            core::CV_32F,
            &self.kernel,
            &self.kernel,
            Point::new(-1, -1),
            0.0,
            core::BORDER_CONSTANT,
        )?;

        let xcrop = Mat::roi(&xfield, self.out_in_bases)?;
        let ycrop = Mat::roi(&yfield, self.out_in_bases)?;
        core::add_weighted(
            &xcrop,
            1.0,
            &self.xbase,
            1.0,
            global_shift.x as f64,
            &mut xmap,
            -1,
        )?;
        core::add_weighted(
            &ycrop,
            1.0,
            &self.ybase,
            1.0,
            global_shift.y as f64,
            &mut ymap,
            -1,
        )?;
        Ok((xmap, ymap))
    }

    /// Warp a frame and the constant-1 normalization mask through the
    /// interpolated displacement field. Pixels sampled outside the frame
    /// come back as zero in both.
    pub fn warp(&self, image: &Mat, global_shift: Point, shifts: &Mat) -> Result<(Mat, Mat)> {
        ensure!(
            image.size()? == self.input_size,
            "frame size does not match the warper"
        );
        let (xmap, ymap) = self.build_maps(global_shift, shifts)?;
        let mut warped = Mat::default();
        imgproc::remap(
            image,
            &mut warped,
            &xmap,
            &ymap,
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            Scalar::all(0.0),
        )?;
        let mut warped_mask = Mat::default();
        imgproc::remap(
            &self.mask_ones,
            &mut warped_mask,
            &xmap,
            &ymap,
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            Scalar::all(0.0),
        )?;
        Ok((warped, warped_mask))
    }
}
