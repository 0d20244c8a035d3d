//! YAML state store for the registration context.
//!
//! The on-disk document is a typed tree keyed by field name; a field is valid
//! exactly when its key is present and well-formed. Loading is tolerant per
//! field: a missing or malformed entry leaves the corresponding context slot
//! invalid with a warning instead of aborting, and the cross-field invariants
//! are re-established afterwards.

use anyhow::{Context as _, Result};
use opencv::core::{self, Point, Rect, Scalar, Size};
use opencv::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::context::{InputImage, RegistrationContext};
use crate::patch::{ImagePatch, ImagePatchPosition, PatchCollection};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PointRepr {
    x: i32,
    y: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SizeRepr {
    width: i32,
    height: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RectRepr {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

impl From<Rect> for RectRepr {
    fn from(r: Rect) -> Self {
        Self {
            x: r.x,
            y: r.y,
            width: r.width,
            height: r.height,
        }
    }
}

impl From<RectRepr> for Rect {
    fn from(r: RectRepr) -> Self {
        Rect::new(r.x, r.y, r.width, r.height)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageRepr {
    filename: String,
    global_shift: PointRepr,
    global_multiplier: f32,
}

#[derive(Serialize, Deserialize)]
struct MatrixRepr {
    rows: i32,
    cols: i32,
    dtype: String,
    data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchRepr {
    x: i32,
    y: i32,
    search_area: RectRepr,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    imagesize: Option<SizeRepr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    boxsize: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<ImageRepr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    common_rectangle: Option<RectRepr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refimg: Option<MatrixRepr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patches: Option<Vec<PatchRepr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch_creation_area: Option<RectRepr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shifts: Option<Vec<MatrixRepr>>,
}

fn mat_to_repr(mat: &Mat) -> Result<MatrixRepr> {
    anyhow::ensure!(
        mat.channels() == 1 && mat.depth() == core::CV_32F,
        "only single-channel float matrices are serialized"
    );
    let mut data = Vec::with_capacity((mat.rows() * mat.cols()) as usize);
    for r in 0..mat.rows() {
        for c in 0..mat.cols() {
            data.push(*mat.at_2d::<f32>(r, c)?);
        }
    }
    Ok(MatrixRepr {
        rows: mat.rows(),
        cols: mat.cols(),
        dtype: "f32".to_string(),
        data,
    })
}

fn repr_to_mat(repr: &MatrixRepr) -> Result<Mat> {
    anyhow::ensure!(repr.dtype == "f32", "unsupported matrix dtype {}", repr.dtype);
    anyhow::ensure!(
        repr.rows >= 0
            && repr.cols >= 0
            && repr.data.len() == (repr.rows as usize) * (repr.cols as usize),
        "matrix data length does not match its dimensions"
    );
    let mut mat = Mat::new_rows_cols_with_default(
        repr.rows,
        repr.cols,
        core::CV_32F,
        Scalar::all(0.0),
    )?;
    for r in 0..repr.rows {
        for c in 0..repr.cols {
            *mat.at_2d_mut::<f32>(r, c)? = repr.data[(r * repr.cols + c) as usize];
        }
    }
    Ok(mat)
}

/// Serialize the valid fields of `context` to `path`.
pub fn save(context: &RegistrationContext, path: &Path) -> Result<()> {
    let doc = StateDoc {
        imagesize: context.imagesize().map(|s| SizeRepr {
            width: s.width,
            height: s.height,
        }),
        boxsize: context.boxsize(),
        images: context.images().map(|images| {
            images
                .iter()
                .map(|i| ImageRepr {
                    filename: i.filename.to_string_lossy().into_owned(),
                    global_shift: PointRepr {
                        x: i.global_shift.x,
                        y: i.global_shift.y,
                    },
                    global_multiplier: i.global_multiplier,
                })
                .collect()
        }),
        common_rectangle: context.common_rectangle().map(RectRepr::from),
        refimg: context.refimg().map(mat_to_repr).transpose()?,
        patches: context.patches().map(|patches| {
            patches
                .positions()
                .iter()
                .map(|p| PatchRepr {
                    x: p.x,
                    y: p.y,
                    search_area: p.search_area.into(),
                })
                .collect()
        }),
        patch_creation_area: context
            .patches()
            .map(|patches| patches.patch_creation_area.into()),
        shifts: context
            .shifts()
            .map(|shifts| shifts.iter().map(mat_to_repr).collect::<Result<_>>())
            .transpose()?,
    };

    let yaml = serde_yaml::to_string(&doc)?;
    std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
    log::info!("state saved to {}", path.display());
    Ok(())
}

fn take_field<T: DeserializeOwned>(doc: &serde_yaml::Value, key: &str) -> Option<T> {
    let value = doc.get(key)?;
    if value.is_null() {
        return None;
    }
    match serde_yaml::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("state field '{}' is malformed and stays invalid: {}", key, e);
            None
        }
    }
}

/// Load a context from `path`. Unreadable files are fatal; individual bad
/// fields are not.
pub fn load(path: &Path) -> Result<RegistrationContext> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut context = RegistrationContext::new();
    if let Some(size) = take_field::<SizeRepr>(&doc, "imagesize") {
        context.set_imagesize(Size::new(size.width, size.height));
    }
    if let Some(boxsize) = take_field::<i32>(&doc, "boxsize") {
        context.set_boxsize(boxsize);
    }
    if let Some(images) = take_field::<Vec<ImageRepr>>(&doc, "images") {
        context.set_images(
            images
                .into_iter()
                .map(|i| {
                    let mut image = InputImage::new(i.filename);
                    image.global_shift = Point::new(i.global_shift.x, i.global_shift.y);
                    image.global_multiplier = i.global_multiplier;
                    image
                })
                .collect(),
        );
    }
    if let Some(rect) = take_field::<RectRepr>(&doc, "commonRectangle") {
        context.set_common_rectangle(rect.into());
    }
    if let Some(repr) = take_field::<MatrixRepr>(&doc, "refimg") {
        match repr_to_mat(&repr) {
            Ok(mat) => context.set_refimg(mat),
            Err(e) => log::warn!("state field 'refimg' is malformed and stays invalid: {}", e),
        }
    }

    // Patch pixels and cooked templates are not stored; they are rebuilt from
    // the reference image, which must itself have loaded.
    let positions = take_field::<Vec<PatchRepr>>(&doc, "patches");
    let creation_area = take_field::<RectRepr>(&doc, "patchCreationArea");
    if let (Some(positions), Some(creation_area)) = (positions, creation_area) {
        match (context.refimg(), context.boxsize()) {
            (Some(refimg), Some(boxsize)) => {
                let rebuilt: Result<Vec<ImagePatch>> = positions
                    .iter()
                    .map(|p| {
                        ImagePatch::new(
                            refimg,
                            ImagePatchPosition::new(p.x, p.y, p.search_area.into()),
                            boxsize,
                        )
                    })
                    .collect();
                match rebuilt {
                    Ok(rebuilt) => {
                        let mut collection = PatchCollection::new(creation_area.into());
                        collection.patches = rebuilt;
                        context.set_patches(collection);
                    }
                    Err(e) => {
                        log::warn!("state field 'patches' is malformed and stays invalid: {}", e)
                    }
                }
            }
            _ => log::warn!("state has patches but no reference image / boxsize to rebuild them"),
        }
    }

    if let Some(reprs) = take_field::<Vec<MatrixRepr>>(&doc, "shifts") {
        match reprs.iter().map(repr_to_mat).collect::<Result<Vec<_>>>() {
            Ok(shifts) => context.set_shifts(shifts),
            Err(e) => log::warn!("state field 'shifts' is malformed and stays invalid: {}", e),
        }
    }

    context.enforce_invariants();
    log::info!("state loaded from {}", path.display());
    Ok(context)
}
