// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
};
use imageproc::rect::Rect;
use ndarray::Array2;

use crate::error::{OpenSetError, Result};
use crate::visualizer::Color;

/// Canvas side length in pixels.
pub const CANVAS_SIZE: u32 = 800;

const MARGIN: f32 = 40.0;
const SWATCH: u32 = 12;

fn bounds(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if lo > hi {
        (-1.0, 1.0)
    } else if (hi - lo).abs() < f32::EPSILON {
        (lo - 1.0, hi + 1.0)
    } else {
        (lo, hi)
    }
}

/// Draw `features` (N, 2) as points colored by label on a white canvas.
///
/// Both axes are scaled independently to fill the canvas. The lines `x = 0` and
/// `y = 0` are drawn when they fall inside the data range. A legend of color
/// swatches, one per class from top to bottom, sits in the upper-right corner.
///
/// # Errors
///
/// Returns an error if `features` is not two-dimensional per row or the label
/// count differs from the row count.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
pub fn render_scatter(features: &Array2<f32>, labels: &[usize], num_classes: usize) -> Result<RgbImage> {
    if features.ncols() != 2 {
        return Err(OpenSetError::ImageError(format!(
            "scatter plots need 2-D features, got {}",
            features.ncols()
        )));
    }
    if features.nrows() != labels.len() {
        return Err(OpenSetError::ImageError(format!(
            "{} features but {} labels",
            features.nrows(),
            labels.len()
        )));
    }

    let size = CANVAS_SIZE as f32;
    let mut img = RgbImage::from_pixel(CANVAS_SIZE, CANVAS_SIZE, Color::WHITE.to_rgb());
    let (x_lo, x_hi) = bounds(features.column(0).iter().copied());
    let (y_lo, y_hi) = bounds(features.column(1).iter().copied());
    let span = size - 2.0 * MARGIN;
    let to_px = |x: f32, y: f32| {
        (
            MARGIN + (x - x_lo) / (x_hi - x_lo) * span,
            size - MARGIN - (y - y_lo) / (y_hi - y_lo) * span,
        )
    };

    let axis = Color::GREY.to_rgb();
    if x_lo <= 0.0 && x_hi >= 0.0 {
        let (px, _) = to_px(0.0, y_lo);
        draw_line_segment_mut(&mut img, (px, MARGIN), (px, size - MARGIN), axis);
    }
    if y_lo <= 0.0 && y_hi >= 0.0 {
        let (_, py) = to_px(x_lo, 0.0);
        draw_line_segment_mut(&mut img, (MARGIN, py), (size - MARGIN, py), axis);
    }

    for (row, &label) in features.rows().into_iter().zip(labels) {
        if label >= num_classes || !row[0].is_finite() || !row[1].is_finite() {
            continue;
        }
        let (px, py) = to_px(row[0], row[1]);
        draw_filled_circle_mut(
            &mut img,
            (px.round() as i32, py.round() as i32),
            1,
            Color::from_index(label).to_rgb(),
        );
    }

    let legend_x = (CANVAS_SIZE - SWATCH - 10) as i32;
    for class in 0..num_classes {
        let y = 10 + (class as i32) * (SWATCH as i32 + 4);
        let rect = Rect::at(legend_x, y).of_size(SWATCH, SWATCH);
        draw_filled_rect_mut(&mut img, rect, Color::from_index(class).to_rgb());
        draw_hollow_rect_mut(&mut img, rect, Color::BLACK.to_rgb());
    }

    Ok(img)
}

/// Render and save a feature plot to `save_dir/prefix/epoch_{epoch + 1}.png`.
///
/// `epoch` is zero-based.
///
/// # Errors
///
/// Returns an error if rendering fails or the file cannot be written.
pub fn plot_features(
    features: &Array2<f32>,
    labels: &[usize],
    num_classes: usize,
    epoch: usize,
    prefix: &str,
    save_dir: &Path,
) -> Result<PathBuf> {
    let img = render_scatter(features, labels, num_classes)?;
    let dir = save_dir.join(prefix);
    fs::create_dir_all(&dir).map_err(|e| {
        OpenSetError::IoError(format!("Failed to create {}: {e}", dir.display()))
    })?;
    let path = dir.join(format!("epoch_{}.png", epoch + 1));
    img.save(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_render_colors_points() {
        let features = array![[-1.0, -1.0], [1.0, 1.0]];
        let img = render_scatter(&features, &[0, 1], 2).unwrap();
        assert_eq!(img.dimensions(), (CANVAS_SIZE, CANVAS_SIZE));

        // (-1, -1) maps to the bottom-left corner of the plot area
        let bottom_left = img.get_pixel(MARGIN as u32, CANVAS_SIZE - MARGIN as u32);
        assert_eq!(*bottom_left, Color::from_index(0).to_rgb());
        let top_right = img.get_pixel(CANVAS_SIZE - MARGIN as u32, MARGIN as u32);
        assert_eq!(*top_right, Color::from_index(1).to_rgb());
    }

    #[test]
    fn test_render_rejects_bad_shapes() {
        assert!(render_scatter(&array![[1.0, 2.0, 3.0]], &[0], 1).is_err());
        assert!(render_scatter(&array![[1.0, 2.0]], &[0, 1], 2).is_err());
    }

    #[test]
    fn test_render_handles_degenerate_input() {
        let img = render_scatter(&Array2::zeros((0, 2)), &[], 7).unwrap();
        assert_eq!(img.dimensions(), (CANVAS_SIZE, CANVAS_SIZE));
        let same = array![[0.5, 0.5], [0.5, 0.5]];
        assert!(render_scatter(&same, &[0, 0], 1).is_ok());
    }

    #[test]
    fn test_plot_features_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = plot_features(&array![[0.0, 1.0]], &[3], 7, 0, "train", dir.path()).unwrap();
        assert_eq!(path, dir.path().join("train").join("epoch_1.png"));
        assert!(path.exists());
    }
}
