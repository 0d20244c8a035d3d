use opencv::core::{Point, Rect, Size};
use opencv::prelude::*;
use std::path::PathBuf;

use crate::patch::PatchCollection;

/// One input frame together with its whole-frame registration results.
/// `global_shift` maps reference coordinates into this frame (add it to go
/// reference -> frame); `global_multiplier` is the intensity scale that
/// minimizes the L2 residual against the reference.
#[derive(Debug, Clone)]
pub struct InputImage {
    pub filename: PathBuf,
    pub global_shift: Point,
    pub global_multiplier: f32,
}

impl InputImage {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            global_shift: Point::new(0, 0),
            global_multiplier: 1.0,
        }
    }
}

/// Bundle of pipeline intermediates, each independently present or invalid.
/// The driver is the single writer; parallel workers only borrow the
/// immutable pieces. Invalidation cascades run top-down: a new reference
/// image invalidates the patches, new patches invalidate the shifts.
#[derive(Default)]
pub struct RegistrationContext {
    imagesize: Option<Size>,
    boxsize: Option<i32>,
    images: Option<Vec<InputImage>>,
    common_rectangle: Option<Rect>,
    refimg: Option<Mat>,
    patches: Option<PatchCollection>,
    shifts: Option<Vec<Mat>>,
}

impl RegistrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn imagesize(&self) -> Option<Size> {
        self.imagesize
    }

    pub fn set_imagesize(&mut self, size: Size) {
        self.imagesize = Some(size);
    }

    pub fn boxsize(&self) -> Option<i32> {
        self.boxsize
    }

    pub fn set_boxsize(&mut self, boxsize: i32) {
        self.boxsize = Some(boxsize);
    }

    pub fn images(&self) -> Option<&[InputImage]> {
        self.images.as_deref()
    }

    pub fn images_mut(&mut self) -> Option<&mut Vec<InputImage>> {
        self.images.as_mut()
    }

    pub fn set_images(&mut self, images: Vec<InputImage>) {
        self.images = Some(images);
    }

    pub fn common_rectangle(&self) -> Option<Rect> {
        self.common_rectangle
    }

    pub fn set_common_rectangle(&mut self, rect: Rect) {
        self.common_rectangle = Some(rect);
    }

    pub fn invalidate_common_rectangle(&mut self) {
        self.common_rectangle = None;
    }

    pub fn refimg(&self) -> Option<&Mat> {
        self.refimg.as_ref()
    }

    /// Rectangle of the reference image, the coordinate system everything
    /// else lives in.
    pub fn refimg_rectangle(&self) -> Option<Rect> {
        self.refimg
            .as_ref()
            .map(|img| Rect::new(0, 0, img.cols(), img.rows()))
    }

    pub fn set_refimg(&mut self, refimg: Mat) {
        self.refimg = Some(refimg);
    }

    pub fn patches(&self) -> Option<&PatchCollection> {
        self.patches.as_ref()
    }

    pub fn set_patches(&mut self, patches: PatchCollection) {
        self.patches = Some(patches);
    }

    pub fn shifts(&self) -> Option<&[Mat]> {
        self.shifts.as_deref()
    }

    pub fn set_shifts(&mut self, shifts: Vec<Mat>) {
        self.shifts = Some(shifts);
    }

    pub fn clear_shifts_etc(&mut self) {
        self.shifts = None;
    }

    pub fn clear_patches_etc(&mut self) {
        self.boxsize = None;
        self.patches = None;
        self.clear_shifts_etc();
    }

    pub fn clear_refimg_etc(&mut self) {
        self.refimg = None;
        self.clear_patches_etc();
    }

    /// Re-establish the cross-field invariants, invalidating (with a
    /// diagnostic) whatever no longer holds together. Called after a state
    /// load and before each pipeline stage; an inconsistent field is an
    /// expected condition, not an error; the stage recomputes it.
    pub fn enforce_invariants(&mut self) {
        if let (Some(common), Some(size)) = (self.common_rectangle, self.imagesize) {
            let frame = Rect::new(0, 0, size.width, size.height);
            if (common & frame) != common {
                log::info!("common rectangle escapes the image bounds, discarding it");
                self.common_rectangle = None;
            }
        }
        if self.common_rectangle.is_some() && self.imagesize.is_none() {
            log::info!("common rectangle without an image size, discarding it");
            self.common_rectangle = None;
        }

        let refimg_mismatch = match (&self.refimg, self.imagesize) {
            (Some(refimg), Some(size)) => {
                refimg.cols() != size.width || refimg.rows() != size.height
            }
            _ => false,
        };
        if refimg_mismatch {
            log::info!("reference image size disagrees with the frame size, discarding it");
            self.clear_refimg_etc();
        }

        if let Some(patches) = &self.patches {
            let fits = match (self.refimg_rectangle(), self.boxsize) {
                (Some(rect), Some(_)) => patches
                    .patches
                    .first()
                    .map_or(true, |p| p.position.search_area_within(rect)),
                _ => false,
            };
            if !fits {
                log::info!("patches no longer consistent with the reference image, discarding them");
                let boxsize = self.boxsize;
                self.patches = None;
                self.clear_shifts_etc();
                // Only the patches were at fault; a standalone boxsize stays.
                self.boxsize = boxsize;
            }
        }

        if let Some(shifts) = &self.shifts {
            let consistent = self
                .patches
                .as_ref()
                .map_or(false, |p| shifts.iter().all(|s| s.rows() == p.len() as i32));
            if !consistent {
                log::info!("shift matrices do not match the patch collection, discarding them");
                self.clear_shifts_etc();
            }
        }
        if let (Some(shifts), Some(images)) = (&self.shifts, &self.images) {
            if shifts.len() != images.len() {
                log::info!("shift count does not match the frame count, discarding the shifts");
                self.clear_shifts_etc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{ImagePatch, ImagePatchPosition};
    use anyhow::Result;
    use opencv::core::{self, Scalar};

    fn context_with_patches() -> Result<RegistrationContext> {
        let mut refimg =
            Mat::new_rows_cols_with_default(64, 64, core::CV_32F, Scalar::all(0.0))?;
        for r in 0..64 {
            for c in 0..64 {
                *refimg.at_2d_mut::<f32>(r, c)? = ((r + c) % 5) as f32;
            }
        }
        let mut patches = PatchCollection::new(Rect::new(0, 0, 64, 64));
        patches.push(ImagePatch::new(
            &refimg,
            ImagePatchPosition::new(20, 20, Rect::new(15, 15, 18, 18)),
            8,
        )?);
        let mut ctx = RegistrationContext::new();
        ctx.set_imagesize(Size::new(64, 64));
        ctx.set_boxsize(8);
        ctx.set_refimg(refimg);
        ctx.set_patches(patches);
        ctx.set_shifts(vec![Mat::new_rows_cols_with_default(
            1,
            2,
            core::CV_32F,
            Scalar::all(0.0),
        )?]);
        Ok(ctx)
    }

    #[test]
    fn clearing_refimg_cascades_to_patches_and_shifts() -> Result<()> {
        let mut ctx = context_with_patches()?;
        ctx.clear_refimg_etc();
        assert!(ctx.refimg().is_none());
        assert!(ctx.boxsize().is_none());
        assert!(ctx.patches().is_none());
        assert!(ctx.shifts().is_none());
        Ok(())
    }

    #[test]
    fn clearing_patches_keeps_refimg() -> Result<()> {
        let mut ctx = context_with_patches()?;
        ctx.clear_patches_etc();
        assert!(ctx.refimg().is_some());
        assert!(ctx.patches().is_none());
        assert!(ctx.shifts().is_none());
        Ok(())
    }

    #[test]
    fn invariants_drop_shifts_with_wrong_row_count() -> Result<()> {
        let mut ctx = context_with_patches()?;
        ctx.set_shifts(vec![Mat::new_rows_cols_with_default(
            3,
            2,
            core::CV_32F,
            Scalar::all(0.0),
        )?]);
        ctx.enforce_invariants();
        assert!(ctx.shifts().is_none());
        assert!(ctx.patches().is_some());
        Ok(())
    }

    #[test]
    fn invariants_drop_patches_without_refimg() -> Result<()> {
        let mut ctx = context_with_patches()?;
        ctx.refimg = None;
        ctx.enforce_invariants();
        assert!(ctx.patches().is_none());
        assert!(ctx.shifts().is_none());
        Ok(())
    }

    #[test]
    fn invariants_clip_common_rectangle() -> Result<()> {
        let mut ctx = context_with_patches()?;
        ctx.set_common_rectangle(Rect::new(10, 10, 80, 80));
        ctx.enforce_invariants();
        assert!(ctx.common_rectangle().is_none());

        ctx.set_common_rectangle(Rect::new(4, 4, 20, 20));
        ctx.enforce_invariants();
        assert_eq!(ctx.common_rectangle(), Some(Rect::new(4, 4, 20, 20)));
        Ok(())
    }
}
