//! Terminal geometry.

use serde::{Deserialize, Serialize};

/// Dimensions of a pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl Dimensions {
    /// Create new dimensions.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Build dimensions from an LXD-style `width`/`height` pair.
    ///
    /// Missing or zero values fall back to `fallback`.
    pub fn from_width_height(width: Option<u16>, height: Option<u16>, fallback: Self) -> Self {
        Self {
            rows: height.filter(|h| *h > 0).unwrap_or(fallback.rows),
            cols: width.filter(|w| *w > 0).unwrap_or(fallback.cols),
        }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dimensions() {
        let dims = Dimensions::default();
        assert_eq!(dims.rows, 24);
        assert_eq!(dims.cols, 80);
    }

    #[test]
    fn test_from_width_height() {
        let fallback = Dimensions::new(30, 100);
        assert_eq!(
            Dimensions::from_width_height(Some(120), Some(40), fallback),
            Dimensions::new(40, 120)
        );
        assert_eq!(
            Dimensions::from_width_height(None, Some(0), fallback),
            fallback
        );
    }
}
