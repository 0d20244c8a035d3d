use anyhow::{ensure, Result};
use opencv::core::Rect;
use opencv::prelude::*;

/// Summed-area table over a single-channel float image, giving O(1) sums of
/// arbitrary rectangles. Built once (for the squared reference image) and
/// shared read-only between workers.
pub struct ImageSumLookup {
    /// (rows + 1) x (cols + 1) table, borders zero.
    table: Vec<f64>,
    stride: usize,
    rows: i32,
    cols: i32,
}

impl ImageSumLookup {
    pub fn new(img: &Mat) -> Result<Self> {
        ensure!(
            img.channels() == 1 && img.depth() == opencv::core::CV_32F,
            "summed-area table requires a single-channel float image"
        );
        let rows = img.rows();
        let cols = img.cols();
        let stride = cols as usize + 1;
        let mut table = vec![0.0f64; (rows as usize + 1) * stride];
        for r in 0..rows as usize {
            for c in 0..cols as usize {
                let v = *img.at_2d::<f32>(r as i32, c as i32)? as f64;
                table[(r + 1) * stride + c + 1] =
                    table[(r + 1) * stride + c] + table[r * stride + c + 1]
                        - table[r * stride + c]
                        + v;
            }
        }
        Ok(Self {
            table,
            stride,
            rows,
            cols,
        })
    }

    /// Sum of the image over `rect`, which must lie within the image bounds.
    pub fn lookup(&self, rect: Rect) -> f64 {
        debug_assert!(rect.x >= 0 && rect.y >= 0);
        debug_assert!(rect.x + rect.width <= self.cols && rect.y + rect.height <= self.rows);
        let (x, y) = (rect.x as usize, rect.y as usize);
        let (w, h) = (rect.width as usize, rect.height as usize);
        self.table[(y + h) * self.stride + x + w] + self.table[y * self.stride + x]
            - self.table[y * self.stride + x + w]
            - self.table[(y + h) * self.stride + x]
    }
}
