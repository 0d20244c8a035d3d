use anyhow::{ensure, Result};
use opencv::core::{self, Point, Point2f, Rect, Scalar};
use opencv::prelude::*;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context::InputImage;
use crate::image_io::GrayReader;
use crate::matcher::{PatchMatcher, QuadraticFit};
use crate::patch::{ImagePatch, ImagePatchPosition, PatchCollection};
use crate::rbf::RbfWarper;
use crate::sumtable::ImageSumLookup;

/// Lay registration patches on a hexagonal grid inside `patch_creation_area`
/// (reference coordinates). Every candidate keeps a `maxmove + 1` margin to
/// the area borders so its search area, including the 1 px rejection zone,
/// stays inside.
pub fn select_points_hex(
    refimg: &Mat,
    boxsize: i32,
    maxmove: i32,
    patch_creation_area: Rect,
) -> Result<PatchCollection> {
    ensure!(boxsize >= 2, "boxsize must be at least 2");
    ensure!(maxmove >= 1, "maxmove must be at least 1");
    let mut patches = PatchCollection::new(patch_creation_area);

    let maxmb = maxmove + 1;
    let xydiff = boxsize / 2;
    let yspacing = (xydiff as f64 * 0.75f64.sqrt()).ceil() as i32;
    let xshift = xydiff / 2;
    let origin = patch_creation_area.tl();

    let mut period = 0;
    let mut y = maxmb;
    while y <= patch_creation_area.height - boxsize - maxmb {
        let mut x = maxmb + if period % 2 == 1 { xshift } else { 0 };
        while x <= patch_creation_area.width - boxsize - maxmb {
            let search = Rect::new(
                origin.x + x - maxmb,
                origin.y + y - maxmb,
                boxsize + 2 * maxmb,
                boxsize + 2 * maxmb,
            );
            patches.push(ImagePatch::new(
                refimg,
                ImagePatchPosition::new(origin.x + x, origin.y + y, search),
                boxsize,
            )?);
            x += xydiff;
        }
        y += yspacing;
        period += 1;
    }
    Ok(patches)
}

/// Keep only patches whose self-match surface has a unique, sufficiently
/// deep minimum.
///
/// Each patch is matched against its own search area on the reference image;
/// the smaller eigenvalue of the quadratic fit around the central point is
/// the worst-case one-pixel fall-off from the minimum. A trustworthy surface
/// has exactly one cell below that value: the minimum itself.
pub fn filter_patches_by_quality(
    patches: PatchCollection,
    refimg: &Mat,
) -> Result<PatchCollection> {
    const EIG_MULT: f32 = 1.0;

    let total = patches.len();
    let mut accepted = PatchCollection::new(patches.patch_creation_area);
    let ref_rect = Rect::new(0, 0, refimg.cols(), refimg.rows());
    let mut matcher = PatchMatcher::new();
    let mut below = Mat::default();

    for patch in patches.patches {
        let surface = matcher.match_patch(refimg, Point::new(0, 0), ref_rect, &patch, 1.0)?;
        let center = Point::new(patch.match_shift_x(), patch.match_shift_y());
        let fit = QuadraticFit::new(surface, center)?;
        let low_eig = fit.smaller_eig();
        // Sub-epsilon (or negative) curvature carries no information.
        if low_eig < f32::EPSILON {
            continue;
        }
        core::compare(
            surface,
            &Scalar::all((low_eig * EIG_MULT) as f64),
            &mut below,
            core::CMP_LT,
        )?;
        if core::count_non_zero(&below)? == 1 {
            accepted.push(patch);
        }
    }
    log::info!("{}/{} candidate patches accepted", accepted.len(), total);
    Ok(accepted)
}

/// Per-patch displacements of a frame relative to the reference.
///
/// `img` is the zero-padded frame canvas covering every relevant search area,
/// `canvas_origin` its reference coordinate, `valid` the rectangle backed by
/// actual frame pixels. Returns a `#patches x 2` CV_32F matrix; patches whose
/// match is rejected keep a zero shift (the RBF interpolation smooths over
/// locally bad points).
pub fn find_shifts(
    img: &Mat,
    canvas_origin: Point,
    valid: Rect,
    patches: &PatchCollection,
    multiplier: f32,
    matcher: &mut PatchMatcher,
) -> Result<Mat> {
    if patches.is_empty() {
        return Ok(Mat::default());
    }
    let mut shifts = Mat::new_rows_cols_with_default(
        patches.len() as i32,
        2,
        core::CV_32F,
        Scalar::all(0.0),
    )?;
    for (i, patch) in patches.iter().enumerate() {
        if !patch.position.search_area_overlaps(valid) {
            continue;
        }
        let surface = matcher.match_patch(img, canvas_origin, valid, patch, multiplier)?;
        let mut coarse = Point::default();
        core::min_max_loc(
            surface,
            None,
            None,
            Some(&mut coarse),
            None,
            &core::no_array(),
        )?;
        // A minimum in the outer 1 px border usually means the true
        // displacement exceeds maxmove; the match is not to be trusted.
        if coarse.x == 0
            || coarse.y == 0
            || coarse.x == surface.cols() - 1
            || coarse.y == surface.rows() - 1
        {
            continue;
        }
        let fit = QuadraticFit::new(surface, coarse)?;
        let mut sub = fit.minimum();
        if sub.x.abs() > 0.5 || sub.y.abs() > 0.5 {
            // Poor fit. Project out the weakly constrained direction and see
            // if that helps; give up on this patch otherwise.
            let e = fit.larger_eig_vec();
            let along = sub.x * e.x + sub.y * e.y;
            sub = Point2f::new(along * e.x, along * e.y);
            if sub.x.abs() > 0.5 || sub.y.abs() > 0.5 {
                continue;
            }
        }
        // Re-centre: the surface coordinate of the patch's own position is
        // (match_shift_x, match_shift_y).
        *shifts.at_2d_mut::<f32>(i as i32, 0)? =
            coarse.x as f32 + sub.x - patch.match_shift_x() as f32;
        *shifts.at_2d_mut::<f32>(i as i32, 1)? =
            coarse.y as f32 + sub.y - patch.match_shift_y() as f32;
    }
    Ok(shifts)
}

/// Output of the fused dedistort/stack loop.
pub struct LuckyResult {
    /// One `#patches x 2` matrix per frame, in input order (dedistort only).
    pub shifts: Option<Vec<Mat>>,
    /// Accumulated warped frames (stack only).
    pub image_sum: Option<Mat>,
    /// Accumulated warped normalization masks (stack only).
    pub mask_sum: Option<Mat>,
}

/// Fused "find shifts" and "warp-accumulate" frame loop.
///
/// Finding shifts and stacking are separate operations in principle, but both
/// need the decoded frame, so they share one parallel loop. Frames are split
/// into contiguous chunks, one per worker; every worker owns its reader,
/// matcher and accumulators, and the per-chunk results are reduced in chunk
/// order so the output is bit-stable for a fixed thread count.
pub fn run_fused_loop(
    images: &[InputImage],
    refimg: &Mat,
    patches: &PatchCollection,
    warper: Option<&RbfWarper>,
    prior_shifts: Option<&[Mat]>,
    compute_shifts: bool,
) -> Result<LuckyResult> {
    ensure!(!images.is_empty(), "no input frames");
    let ref_rect = Rect::new(0, 0, refimg.cols(), refimg.rows());

    let mut refimg_sq = Mat::default();
    core::multiply(refimg, refimg, &mut refimg_sq, 1.0, -1)?;
    let refsq_lookup = ImageSumLookup::new(&refimg_sq)?;

    struct ChunkResult {
        shifts: Vec<Mat>,
        image_sum: Option<Mat>,
        mask_sum: Option<Mat>,
    }

    let chunk = images.len().div_ceil(rayon::current_num_threads()).max(1);
    let progress = AtomicUsize::new(0);

    let chunks: Vec<ChunkResult> = images
        .par_chunks(chunk)
        .enumerate()
        .map(|(chunk_idx, frames)| -> Result<ChunkResult> {
            let mut reader = GrayReader::new();
            let mut matcher = PatchMatcher::new();
            let mut out = ChunkResult {
                shifts: Vec::with_capacity(if compute_shifts { frames.len() } else { 0 }),
                image_sum: None,
                mask_sum: None,
            };
            for (k, image) in frames.iter().enumerate() {
                let frame_idx = chunk_idx * chunk + k;
                reader.read(&image.filename)?;
                let gs = image.global_shift;

                let shift_mat = if compute_shifts {
                    let gray = reader.gray();
                    // Frame rectangle in its own and in reference coordinates.
                    let img_rect = Rect::new(0, 0, gray.cols(), gray.rows());
                    let img_rect_ref = img_rect - gs;
                    let overlap_ref = ref_rect & img_rect_ref;

                    let multiplier = if overlap_ref.empty() {
                        1.0
                    } else {
                        let overlap_img = overlap_ref + gs;
                        let img_roi = Mat::roi(gray, overlap_img)?;
                        let ref_roi = Mat::roi(refimg, overlap_ref)?;
                        let mut dot = Mat::default();
                        core::multiply(&img_roi, &ref_roi, &mut dot, 1.0, -1)?;
                        let num = core::sum_elems(&dot)?[0];
                        let denom = refsq_lookup.lookup(overlap_ref);
                        if denom > 0.0 {
                            (num / denom) as f32
                        } else {
                            1.0
                        }
                    };

                    // Zero-padded canvas covering every search area this
                    // frame can serve, tracking where real pixels are.
                    let total = patches.search_area_for_image(img_rect_ref);
                    let valid = img_rect_ref & total;
                    let mut canvas = Mat::new_rows_cols_with_default(
                        total.height,
                        total.width,
                        core::CV_32F,
                        Scalar::all(0.0),
                    )?;
                    if !valid.empty() {
                        let src = Mat::roi(gray, valid + gs)?;
                        let mut dst = Mat::roi_mut(&mut canvas, valid - total.tl())?;
                        src.copy_to(&mut dst)?;
                    }
                    find_shifts(&canvas, total.tl(), valid, patches, multiplier, &mut matcher)?
                } else if let Some(prior) = prior_shifts {
                    prior[frame_idx].clone()
                } else {
                    Mat::default()
                };

                if let Some(warper) = warper {
                    let (warped, warped_mask) = warper.warp(reader.color(), gs, &shift_mat)?;
                    match (&mut out.image_sum, &mut out.mask_sum) {
                        (Some(isum), Some(msum)) => {
                            opencv::imgproc::accumulate(&warped, isum, &core::no_array())?;
                            opencv::imgproc::accumulate(&warped_mask, msum, &core::no_array())?;
                        }
                        _ => {
                            let mut isum = Mat::default();
                            warped.convert_to(&mut isum, core::CV_32F, 1.0, 0.0)?;
                            let mut msum = Mat::default();
                            warped_mask.convert_to(&mut msum, core::CV_32F, 1.0, 0.0)?;
                            out.image_sum = Some(isum);
                            out.mask_sum = Some(msum);
                        }
                    }
                }
                if compute_shifts {
                    out.shifts.push(shift_mat);
                }
                let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("processed frame {}/{}", done, images.len());
            }
            Ok(out)
        })
        .collect::<Result<_>>()?;

    // Fixed-order reduction keeps float summation deterministic.
    let mut result = LuckyResult {
        shifts: compute_shifts.then(Vec::new),
        image_sum: None,
        mask_sum: None,
    };
    for chunk_result in chunks {
        if let Some(all) = &mut result.shifts {
            all.extend(chunk_result.shifts);
        }
        if let Some(local) = chunk_result.image_sum {
            match &mut result.image_sum {
                Some(total) => opencv::imgproc::accumulate(&local, total, &core::no_array())?,
                None => result.image_sum = Some(local),
            }
        }
        if let Some(local) = chunk_result.mask_sum {
            match &mut result.mask_sum {
                Some(total) => opencv::imgproc::accumulate(&local, total, &core::no_array())?,
                None => result.mask_sum = Some(local),
            }
        }
    }
    Ok(result)
}
