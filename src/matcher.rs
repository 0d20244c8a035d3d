use anyhow::{ensure, Result};
use opencv::core::{self, Point, Point2f, Rect, Scalar};
use opencv::prelude::*;

use crate::patch::ImagePatch;

/// Builds SSD match surfaces for patches against a query image. Holds scratch
/// buffers that are reused across calls; NOT thread safe; each worker owns
/// its own instance.
#[derive(Default)]
pub struct PatchMatcher {
    roi_sq: Mat,
    areasq: Mat,
    cor: Mat,
    sqterm: Mat,
    norm: Mat,
    norm_safe: Mat,
    valid_mask: Mat,
    tmp: Mat,
    unnorm: Mat,
    surface: Mat,
}

impl PatchMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// SSD surface of `patch` against the single-channel canvas `img`.
    ///
    /// `canvas_origin` is the reference coordinate of the canvas pixel (0,0);
    /// the patch search area must lie inside the canvas. `valid` (reference
    /// coordinates) marks the pixels actually backed by frame data; the canvas
    /// is zero outside it. When the search area is only partially covered the
    /// surface is divided by the per-offset overlap count so values stay
    /// comparable across positions.
    pub fn match_patch(
        &mut self,
        img: &Mat,
        canvas_origin: Point,
        valid: Rect,
        patch: &ImagePatch,
        multiplier: f32,
    ) -> Result<&Mat> {
        let search = patch.search_area();
        let local = search - canvas_origin;
        ensure!(
            local.x >= 0
                && local.y >= 0
                && local.x + local.width <= img.cols()
                && local.y + local.height <= img.rows(),
            "patch search area escapes the padded frame canvas"
        );
        let roi = Mat::roi(img, local)?;

        core::multiply(&roi, &roi, &mut self.roi_sq, 1.0, -1)?;
        patch.cooked_mask.match_into(&self.roi_sq, &mut self.areasq)?;
        patch.cooked_tmpl.match_into(&roi, &mut self.cor)?;

        let mu = multiplier as f64;
        if patch.position.search_area_within(valid) {
            core::add_weighted(
                &self.areasq,
                1.0,
                &self.cor,
                -2.0 * mu,
                mu * mu * patch.sqsum,
                &mut self.surface,
                -1,
            )?;
        } else {
            // Per-offset validity: ones over the covered part of the search
            // area, zeros elsewhere.
            let vsize = search.size();
            if self.valid_mask.size()? != vsize || self.valid_mask.typ() != core::CV_32F {
                self.valid_mask = Mat::new_rows_cols_with_default(
                    vsize.height,
                    vsize.width,
                    core::CV_32F,
                    Scalar::all(0.0),
                )?;
            } else {
                self.valid_mask.set_to(&Scalar::all(0.0), &core::no_array())?;
            }
            let overlap = (search & valid) - search.tl();
            if !overlap.empty() {
                let mut ones = Mat::roi_mut(&mut self.valid_mask, overlap)?;
                ones.set_to(&Scalar::all(1.0), &core::no_array())?;
            }

            patch.cooked_sq.match_into(&self.valid_mask, &mut self.sqterm)?;
            patch.cooked_mask.match_into(&self.valid_mask, &mut self.norm)?;

            core::add_weighted(&self.areasq, 1.0, &self.cor, -2.0 * mu, 0.0, &mut self.tmp, -1)?;
            core::add_weighted(&self.tmp, 1.0, &self.sqterm, mu * mu, 0.0, &mut self.unnorm, -1)?;
            // Offsets with no valid pixel at all would divide by zero; their
            // unnormalized value is zero anyway.
            core::max(&self.norm, &Scalar::all(1.0), &mut self.norm_safe)?;
            core::divide2(&self.unnorm, &self.norm_safe, &mut self.surface, 1.0, -1)?;
        }
        Ok(&self.surface)
    }
}

/// Least-squares 2-D quadratic fit on the 3x3 neighbourhood of an integer
/// surface minimum: stationary point and Hessian eigen-structure.
pub struct QuadraticFit {
    x0y0: Point2f,
    eigenvalues: [f32; 2],
    eigenvectors: [[f32; 2]; 2],
}

impl QuadraticFit {
    /// `point` must be at least one pixel away from every border of `data`.
    pub fn new(data: &Mat, point: Point) -> Result<Self> {
        ensure!(
            point.x >= 1
                && point.y >= 1
                && point.x + 1 < data.cols()
                && point.y + 1 < data.rows(),
            "quadratic fit point must be strictly interior"
        );

        // Design matrix of 1, x, y, x^2, xy, y^2 over the 3x3 neighbourhood.
        let mut fitx = Mat::new_rows_cols_with_default(9, 6, core::CV_32F, Scalar::all(0.0))?;
        let mut row = 0;
        for y in -1..=1i32 {
            for x in -1..=1i32 {
                let (xf, yf) = (x as f32, y as f32);
                for (col, v) in [1.0, xf, yf, xf * xf, xf * yf, yf * yf].iter().enumerate() {
                    *fitx.at_2d_mut::<f32>(row, col as i32)? = *v;
                }
                row += 1;
            }
        }

        let neighbourhood =
            Mat::roi(data, Rect::new(point.x - 1, point.y - 1, 3, 3))?.try_clone()?;
        let as_vector = neighbourhood.reshape(0, 9)?;
        let mut coeffs = Mat::default();
        core::solve(&fitx, &as_vector, &mut coeffs, core::DECOMP_SVD)?;
        let a = |i: i32| -> Result<f32> { Ok(*coeffs.at_2d::<f32>(i, 0)?) };
        let (a1, a2, a3, a4, a5) = (a(1)?, a(2)?, a(3)?, a(4)?, a(5)?);

        // Half-Hessian of the fitted quadratic. Its smaller eigenvalue is the
        // worst-case change in surface value one pixel away from the minimum,
        // which is exactly what the quality filter thresholds against.
        let curvature = Mat::from_slice_2d(&[[a3, 0.5 * a4], [0.5 * a4, a5]])?;
        let rhs = Mat::from_slice_2d(&[[-0.5 * a1], [-0.5 * a2]])?;
        let mut x0y0 = Mat::default();
        core::solve(&curvature, &rhs, &mut x0y0, core::DECOMP_SVD)?;

        let mut evals = Mat::default();
        let mut evecs = Mat::default();
        core::eigen(&curvature, &mut evals, &mut evecs)?;

        Ok(Self {
            x0y0: Point2f::new(*x0y0.at_2d::<f32>(0, 0)?, *x0y0.at_2d::<f32>(1, 0)?),
            eigenvalues: [*evals.at_2d::<f32>(0, 0)?, *evals.at_2d::<f32>(1, 0)?],
            eigenvectors: [
                [*evecs.at_2d::<f32>(0, 0)?, *evecs.at_2d::<f32>(0, 1)?],
                [*evecs.at_2d::<f32>(1, 0)?, *evecs.at_2d::<f32>(1, 1)?],
            ],
        })
    }

    /// Stationary point of the fitted quadratic, relative to the fit centre.
    pub fn minimum(&self) -> Point2f {
        self.x0y0
    }

    #[allow(dead_code)]
    pub fn larger_eig(&self) -> f32 {
        self.eigenvalues[0]
    }

    pub fn smaller_eig(&self) -> f32 {
        self.eigenvalues[1]
    }

    pub fn larger_eig_vec(&self) -> Point2f {
        Point2f::new(self.eigenvectors[0][0], self.eigenvectors[0][1])
    }

    #[allow(dead_code)]
    pub fn smaller_eig_vec(&self) -> Point2f {
        Point2f::new(self.eigenvectors[1][0], self.eigenvectors[1][1])
    }
}
