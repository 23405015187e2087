// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use image::Rgb;

/// Color type for visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub u8, pub u8, pub u8);

impl Color {
    /// White color.
    pub const WHITE: Color = Color(255, 255, 255);
    /// Black color.
    pub const BLACK: Color = Color(0, 0, 0);
    /// Light grey used for axes.
    pub const GREY: Color = Color(200, 200, 200);

    /// Create a new color from RGB values.
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self(r, g, b)
    }

    /// Get a color from the class palette by index.
    pub fn from_index(index: usize) -> Self {
        let color = CLASS_COLORS[index % CLASS_COLORS.len()];
        Self(color[0], color[1], color[2])
    }

    /// Convert to an `image` pixel.
    pub fn to_rgb(self) -> Rgb<u8> {
        Rgb([self.0, self.1, self.2])
    }
}

/// One color per digit class (the familiar ten-color categorical cycle).
pub const CLASS_COLORS: [[u8; 3]; 10] = [
    [31, 119, 180],  // #1f77b4
    [255, 127, 14],  // #ff7f0e
    [44, 160, 44],   // #2ca02c
    [214, 39, 40],   // #d62728
    [148, 103, 189], // #9467bd
    [140, 86, 75],   // #8c564b
    [227, 119, 194], // #e377c2
    [127, 127, 127], // #7f7f7f
    [188, 189, 34],  // #bcbd22
    [23, 190, 207],  // #17becf
];
