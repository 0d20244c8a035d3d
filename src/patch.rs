use anyhow::{ensure, Result};
use opencv::core::{self, Point, Rect, Scalar};
use opencv::prelude::*;

use crate::cooked::CookedTemplate;

/// Location of a registration patch in reference-image coordinates, plus the
/// rectangle of positions its match is allowed to land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePatchPosition {
    pub x: i32,
    pub y: i32,
    pub search_area: Rect,
}

impl ImagePatchPosition {
    pub fn new(x: i32, y: i32, search_area: Rect) -> Self {
        Self { x, y, search_area }
    }

    pub fn search_area_within(&self, rect: Rect) -> bool {
        rect.contains(self.search_area.tl())
            && rect.contains(self.search_area.br() - Point::new(1, 1))
    }

    pub fn search_area_overlaps(&self, rect: Rect) -> bool {
        !(self.search_area & rect).empty()
    }
}

/// A reference patch with its pixels and the cooked templates reused for
/// every match against it: the patch itself, a same-shape all-ones mask and
/// the squared patch (the latter two feed the partial-overlap SSD terms).
pub struct ImagePatch {
    pub position: ImagePatchPosition,
    pub image: Mat,
    pub sqsum: f64,
    pub cooked_tmpl: CookedTemplate,
    pub cooked_mask: CookedTemplate,
    pub cooked_sq: CookedTemplate,
}

impl ImagePatch {
    pub fn new(refimg: &Mat, position: ImagePatchPosition, boxsize: i32) -> Result<Self> {
        let patch_rect = Rect::new(position.x, position.y, boxsize, boxsize);
        ensure!(
            !(patch_rect & position.search_area).empty()
                && (patch_rect & position.search_area) == patch_rect,
            "patch rectangle must lie inside its search area"
        );
        let image = Mat::roi(refimg, patch_rect)?.try_clone()?;

        let mut squared = Mat::default();
        core::multiply(&image, &image, &mut squared, 1.0, -1)?;
        let sqsum = core::sum_elems(&squared)?[0];

        let mask = Mat::new_rows_cols_with_default(
            boxsize,
            boxsize,
            core::CV_32F,
            Scalar::all(1.0),
        )?;
        let search_size = position.search_area.size();
        Ok(Self {
            position,
            cooked_tmpl: CookedTemplate::new(&image, search_size)?,
            cooked_mask: CookedTemplate::new(&mask, search_size)?,
            cooked_sq: CookedTemplate::new(&squared, search_size)?,
            image,
            sqsum,
        })
    }

    pub fn x(&self) -> i32 {
        self.position.x
    }

    pub fn y(&self) -> i32 {
        self.position.y
    }

    pub fn search_area(&self) -> Rect {
        self.position.search_area
    }

    /// Surface coordinate at which the patch matches its own location.
    pub fn match_shift_x(&self) -> i32 {
        self.position.x - self.position.search_area.x
    }

    pub fn match_shift_y(&self) -> i32 {
        self.position.y - self.position.search_area.y
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.position.x + self.image.cols() / 2,
            self.position.y + self.image.rows() / 2,
        )
    }
}

/// Ordered set of accepted patches. `patch_creation_area` records the region
/// of the reference image the grid was generated in; it is the compatibility
/// key when patches are reloaded from a state file.
pub struct PatchCollection {
    pub patches: Vec<ImagePatch>,
    pub patch_creation_area: Rect,
}

impl PatchCollection {
    pub fn new(patch_creation_area: Rect) -> Self {
        Self {
            patches: Vec::new(),
            patch_creation_area,
        }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ImagePatch> {
        self.patches.iter()
    }

    pub fn push(&mut self, patch: ImagePatch) {
        self.patches.push(patch);
    }

    /// Smallest rectangle covering `image_rect` and every search area that
    /// overlaps it; the fused loop pads each frame to this extent.
    pub fn search_area_for_image(&self, image_rect: Rect) -> Rect {
        let mut total = image_rect;
        for patch in &self.patches {
            if patch.position.search_area_overlaps(image_rect) {
                total = total | patch.position.search_area;
            }
        }
        total
    }

    pub fn positions(&self) -> Vec<ImagePatchPosition> {
        self.patches.iter().map(|p| p.position).collect()
    }
}
