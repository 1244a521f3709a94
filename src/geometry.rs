//! Geometric value types
//!
//! Small data carriers shared by the scaling policies and the
//! placement coordinate math.

/// Anchor point of a scaling operation.
///
/// Both components are factors of the image size, so they are expected
/// to be elements of [0, 1]. (0.5, 0.5) centers the crop window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Default for Point {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

/// Distance from a pane origin in terminal cell units.
///
/// Used as the view offset when the layer runs inside a tmux pane that
/// does not start at the terminal origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Distance {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

impl Distance {
    pub const fn new(top: i32, left: i32, bottom: i32, right: i32) -> Self {
        Self {
            top,
            left,
            bottom,
            right,
        }
    }

    /// True when the pane starts at the terminal origin.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_distance_is_zero() {
        assert!(Distance::default().is_zero());
        assert!(!Distance::new(1, 0, 0, 0).is_zero());
    }
}
