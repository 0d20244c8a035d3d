use anyhow::{Context as _, ensure, Result};
use opencv::core::{Point, Rect, Size};
use opencv::imgproc;
use opencv::prelude::*;
use std::path::PathBuf;

use crate::alignment;
use crate::compat;
use crate::config::{PreregMode, RegistrationParams};
use crate::context::{InputImage, RegistrationContext};
use crate::image_io::{self, GrayReader};
use crate::lucky;
use crate::patch::PatchCollection;
use crate::rbf::RbfWarper;
use crate::stacking;
use crate::state;

/// Run the requested stages over the context, recomputing whatever a needed
/// stage finds invalid: `prereg -> refimg -> patches -> lucky/stack`.
pub fn run(params: &RegistrationParams) -> Result<()> {
    let mut context = match &params.read_state {
        Some(path) => state::load(path)?,
        None => RegistrationContext::new(),
    };
    if context.images().is_none() {
        context.set_images(params.files.iter().map(InputImage::new).collect());
    }
    let frame_count = context.images().map_or(0, |i| i.len());
    ensure!(frame_count > 0, "no input frames available");
    log::info!("{} input frames", frame_count);

    if params.boxsize_override {
        if let Some(boxsize) = context.boxsize() {
            if boxsize != params.boxsize {
                log::info!(
                    "boxsize {} from the command line conflicts with {} from the state file; \
                     regenerating patches",
                    params.boxsize,
                    boxsize
                );
                context.clear_patches_etc();
            }
        }
    }
    context.enforce_invariants();

    if params.stage_prereg {
        run_prereg(params, &mut context)?;
    }

    // The colour mean is kept around only for --only-refimg output.
    let mut reference_color = None;
    let want_downstream = params.stage_patches || params.stage_dedistort || params.stage_stack;
    context.enforce_invariants();
    if params.stage_refimg || (want_downstream && context.refimg().is_none()) {
        run_refimg(&mut context, &mut reference_color)?;
    }

    context.enforce_invariants();
    check_patch_compatibility(params, &mut context);
    if params.stage_patches || (params.stage_dedistort && context.patches().is_none()) {
        run_patches(params, &mut context)?;
    }

    context.enforce_invariants();
    if params.stage_dedistort || params.stage_stack {
        run_lucky(params, &mut context, frame_count)?;
    }

    if params.only_refimg {
        let color = reference_color.context("reference image was not rebuilt in this run")?;
        let output = params.output.as_ref().expect("validated by the parameter layer");
        let cropped = match (params.crop, context.common_rectangle()) {
            (true, Some(common)) => Mat::roi(&color, common)?.try_clone()?,
            _ => color,
        };
        image_io::write_image(output, &cropped)?;
    }

    if let Some(path) = &params.save_state {
        state::save(&context, path)?;
    }
    Ok(())
}

fn run_prereg(params: &RegistrationParams, context: &mut RegistrationContext) -> Result<()> {
    let files: Vec<PathBuf> = context
        .images()
        .expect("images checked by run")
        .iter()
        .map(|i| i.filename.clone())
        .collect();
    let ref_path = match &params.prereg {
        PreregMode::ExplicitImage(path) => path.clone(),
        PreregMode::FirstImage => files[0].clone(),
        PreregMode::MiddleImage => files[files.len() / 2].clone(),
        PreregMode::None => unreachable!("stage_prereg implies a reference selection"),
    };
    log::info!("pre-registering against {}", ref_path.display());

    let mut reader = GrayReader::new();
    reader.read(&ref_path)?;
    let reference = reader.gray().clone();
    let size = reference.size()?;
    let maxmove = if params.prereg_maxmove > 0 {
        params.prereg_maxmove
    } else {
        (size.width.min(size.height) / 2).max(1)
    };

    let results = alignment::get_global_shifts(&files, &reference, maxmove)?;
    let shifts: Vec<Point> = results.iter().map(|(shift, _)| *shift).collect();
    for (image, (shift, multiplier)) in context
        .images_mut()
        .expect("images checked by run")
        .iter_mut()
        .zip(&results)
    {
        image.global_shift = *shift;
        image.global_multiplier = *multiplier;
    }
    context.set_imagesize(size);
    match alignment::common_rectangle(&shifts, size) {
        Some(common) => context.set_common_rectangle(common),
        None => {
            log::info!("globally shifted frames share no common area");
            context.invalidate_common_rectangle();
        }
    }
    // Fresh global shifts stale everything derived from the old alignment.
    context.clear_refimg_etc();
    Ok(())
}

fn ensure_imagesize(context: &mut RegistrationContext) -> Result<Size> {
    if let Some(size) = context.imagesize() {
        return Ok(size);
    }
    let first = context
        .images()
        .and_then(|i| i.first())
        .context("no input frames available")?
        .filename
        .clone();
    let size = image_io::load_image(&first)?.size()?;
    context.set_imagesize(size);
    Ok(size)
}

fn run_refimg(
    context: &mut RegistrationContext,
    reference_color: &mut Option<Mat>,
) -> Result<()> {
    log::info!("creating the averaged reference image");
    let imagesize = ensure_imagesize(context)?;
    let mean = stacking::mean_image(context.images().expect("images checked by run"), imagesize)?;
    let mut gray = Mat::default();
    compat::cvt_color(&mean, &mut gray, imgproc::COLOR_BGR2GRAY)?;
    context.clear_patches_etc();
    context.set_refimg(gray);
    *reference_color = Some(mean);
    Ok(())
}

/// Region patches are generated in: the common rectangle when cropping is on
/// and available, the full reference rectangle otherwise.
fn creation_area(params: &RegistrationParams, context: &RegistrationContext) -> Option<Rect> {
    let refrect = context.refimg_rectangle()?;
    if params.crop {
        if let Some(common) = context.common_rectangle() {
            return Some(common);
        }
    }
    Some(refrect)
}

fn check_patch_compatibility(params: &RegistrationParams, context: &mut RegistrationContext) {
    let planned = creation_area(params, context);
    let existing = context.patches().map(|p| p.patch_creation_area);
    if let (Some(was), Some(area)) = (existing, planned) {
        if was != area {
            log::info!(
                "patches were created in {:?} but {:?} is requested; regenerating",
                was,
                area
            );
            context.clear_patches_etc();
        }
    }
}

fn run_patches(params: &RegistrationParams, context: &mut RegistrationContext) -> Result<()> {
    log::info!(
        "creating registration patches (boxsize {}, maxmove {})",
        params.boxsize,
        params.maxmove
    );
    let refimg = context
        .refimg()
        .context("patch generation requires a reference image")?;
    let area = creation_area(params, context).expect("refimg just checked");
    let candidates = lucky::select_points_hex(refimg, params.boxsize, params.maxmove, area)?;
    let accepted = lucky::filter_patches_by_quality(candidates, refimg)?;

    context.clear_shifts_etc();
    context.set_boxsize(params.boxsize);
    context.set_patches(accepted);
    Ok(())
}

fn run_lucky(
    params: &RegistrationParams,
    context: &mut RegistrationContext,
    frame_count: usize,
) -> Result<()> {
    let imagesize = ensure_imagesize(context)?;
    let refimg = context
        .refimg()
        .context("dedistortion requires a reference image")?;
    let ref_rect = Rect::new(0, 0, refimg.cols(), refimg.rows());
    let output_rect = match (params.crop, context.common_rectangle()) {
        (true, Some(common)) => common,
        _ => ref_rect,
    };

    // Stacking from a state file may legitimately run without patches; the
    // warper then reduces to the global shifts.
    let empty_patches = PatchCollection::new(output_rect);
    let patches = context.patches().unwrap_or(&empty_patches);
    let boxsize = context.boxsize().unwrap_or(params.boxsize);

    let warper = if params.stage_stack {
        log::info!(
            "stacking into {:?} at supersampling {}",
            output_rect,
            params.supersampling
        );
        Some(RbfWarper::new(
            patches,
            imagesize,
            output_rect,
            boxsize as f32 / 4.0,
            params.supersampling,
        )?)
    } else {
        None
    };

    let compute_shifts = params.stage_dedistort;
    if compute_shifts {
        log::info!("computing lucky-imaging shifts for {} patches", patches.len());
    }
    let prior_shifts = if compute_shifts { None } else { context.shifts() };

    let result = lucky::run_fused_loop(
        context.images().expect("images checked by run"),
        refimg,
        patches,
        warper.as_ref(),
        prior_shifts,
        compute_shifts,
    )?;

    if let Some(shifts) = result.shifts {
        context.set_shifts(shifts);
    }
    if params.stage_stack {
        let sum = result.image_sum.context("stacking produced no frames")?;
        let mask = result.mask_sum.context("stacking produced no frames")?;
        let stacked = stacking::divide_channels_by_mask(&sum, &mask, frame_count as f64)?;
        let output = params.output.as_ref().expect("validated by the parameter layer");
        image_io::write_image(output, &stacked)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use opencv::core::{self, Scalar};
    use std::path::Path;

    /// Asymmetric blob scene; `t` translates the content (ref -> frame is
    /// then exactly `+t`, i.e. the expected global shift).
    fn write_frame(path: &Path, t: Point) -> Result<()> {
        let mut img =
            Mat::new_rows_cols_with_default(96, 96, core::CV_8UC3, Scalar::all(30.0))?;
        for &(x, y, v) in &[
            (30, 25, 220.0f64),
            (55, 60, 180.0),
            (40, 70, 240.0),
            (70, 35, 200.0),
        ] {
            for dy in 0..3 {
                for dx in 0..3 {
                    let (px, py) = (x + t.x + dx, y + t.y + dy);
                    if (0..96).contains(&px) && (0..96).contains(&py) {
                        *img.at_2d_mut::<core::Vec3b>(py, px)? =
                            core::Vec3b::from([v as u8, (v * 0.8) as u8, (v * 0.6) as u8]);
                    }
                }
            }
        }
        opencv::imgcodecs::imwrite(path.to_str().unwrap(), &img, &core::Vector::new())?;
        Ok(())
    }

    fn base_params(files: Vec<std::path::PathBuf>) -> RegistrationParams {
        RegistrationParams {
            files,
            prereg: PreregMode::FirstImage,
            prereg_maxmove: 16,
            stage_prereg: true,
            stage_refimg: true,
            stage_patches: true,
            stage_dedistort: true,
            stage_stack: false,
            only_refimg: false,
            crop: true,
            boxsize: 16,
            boxsize_override: false,
            maxmove: 8,
            supersampling: 1,
            read_state: None,
            save_state: None,
            output: None,
        }
    }

    #[test]
    fn identical_frames_register_with_zero_shifts() -> Result<()> {
        let dir = std::env::temp_dir().join("luckystacker_test_pipeline_identical");
        std::fs::create_dir_all(&dir)?;
        let mut files = Vec::new();
        for i in 0..4 {
            let path = dir.join(format!("frame_{}.png", i));
            write_frame(&path, Point::new(0, 0))?;
            files.push(path);
        }
        let state_path = dir.join("state.yml");
        let mut params = base_params(files);
        params.save_state = Some(state_path.clone());

        run(&params)?;

        let context = state::load(&state_path)?;
        assert_eq!(context.imagesize(), Some(Size::new(96, 96)));
        assert_eq!(context.common_rectangle(), Some(Rect::new(0, 0, 96, 96)));
        for image in context.images().unwrap() {
            assert_eq!(image.global_shift, Point::new(0, 0));
            assert!((image.global_multiplier - 1.0).abs() < 1e-3);
        }
        let patches = context.patches().unwrap();
        let shifts = context.shifts().unwrap();
        assert_eq!(shifts.len(), 4);
        for frame_shifts in shifts {
            assert_eq!(frame_shifts.rows(), patches.len() as i32);
            for r in 0..frame_shifts.rows() {
                for c in 0..frame_shifts.cols() {
                    assert!(
                        frame_shifts.at_2d::<f32>(r, c)?.abs() <= 0.5,
                        "identical frames produced a non-zero lucky shift"
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn translated_frames_resume_from_state_identically() -> Result<()> {
        let dir = std::env::temp_dir().join("luckystacker_test_pipeline_resume");
        std::fs::create_dir_all(&dir)?;
        let translations = [Point::new(0, 0), Point::new(3, -2), Point::new(-4, 5)];
        let mut files = Vec::new();
        for (i, t) in translations.iter().enumerate() {
            let path = dir.join(format!("frame_{}.png", i));
            write_frame(&path, *t)?;
            files.push(path);
        }

        let state_path = dir.join("state.yml");
        let out_full = dir.join("full.png");
        let mut params = base_params(files);
        params.stage_stack = true;
        params.save_state = Some(state_path.clone());
        params.output = Some(out_full.clone());
        run(&params)?;

        let context = state::load(&state_path)?;
        let images = context.images().unwrap();
        for (image, t) in images.iter().zip(&translations) {
            assert_eq!(image.global_shift, *t, "for {}", image.filename.display());
        }
        // Intersection of the frame rectangle over all shifts.
        assert_eq!(context.common_rectangle(), Some(Rect::new(4, 2, 89, 89)));

        // Re-running only the later stages from the saved state must
        // reproduce the stacked output byte for byte.
        let out_resumed = dir.join("resumed.png");
        let mut resumed = base_params(Vec::new());
        resumed.prereg = PreregMode::None;
        resumed.stage_prereg = false;
        resumed.stage_refimg = false;
        resumed.stage_patches = false;
        resumed.stage_stack = true;
        resumed.read_state = Some(state_path);
        resumed.output = Some(out_resumed.clone());
        run(&resumed)?;

        let full_bytes = std::fs::read(&out_full)?;
        let resumed_bytes = std::fs::read(&out_resumed)?;
        assert_eq!(full_bytes, resumed_bytes);
        Ok(())
    }
}

