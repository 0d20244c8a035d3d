//! OpenCV compatibility wrappers for cross-version support.
//!
//! OpenCV 4.11+ added an `AlgorithmHint` parameter to `cvt_color` and friends;
//! older installations (e.g. Ubuntu 24.04's OpenCV 4.6) don't have it, and the
//! opencv Rust crate generates different signatures depending on which headers
//! are installed. The `_def` variants use OpenCV's default parameter values and
//! exist across all supported versions.

use opencv::core::ToInputArray;
use opencv::core::ToOutputArray;
use opencv::{imgproc, Result};

/// Wrapper for `imgproc::cvt_color` that works across OpenCV versions.
/// Uses `cvt_color_def` which applies default values for `dst_cn` and
/// `AlgorithmHint` (if applicable).
pub fn cvt_color(
    src: &impl ToInputArray,
    dst: &mut impl ToOutputArray,
    code: i32,
) -> Result<()> {
    imgproc::cvt_color_def(src, dst, code)
}
