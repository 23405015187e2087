// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Visualization tools for learned feature embeddings.

/// Color definitions and palettes.
pub mod color;

/// 2-D feature scatter plots.
pub mod scatter;

pub use color::Color;
pub use scatter::{plot_features, render_scatter};
