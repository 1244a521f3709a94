//! Image scaling policies
//!
//! Pure functions mapping (image, anchor, bounds) to a final resolution
//! and a transformed pixel buffer. A requested dimension of 0 means
//! "unconstrained in that axis, use the intrinsic size".

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::geometry::Point;

/// Resampling filter used by every resizing policy.
const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// Selects how an image is fitted into its target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scaler {
    /// Crop out the target box around the anchor, never resampling.
    Crop,
    /// Stretch freely to the target box, ignoring the aspect ratio.
    Distort,
    /// Scale down (never up) so the result fits within the box.
    #[default]
    Contain,
    /// Cover the whole box keeping the aspect ratio, stretching if needed,
    /// then crop the overflow around the anchor.
    ForcedCover,
    /// Like forced cover, but the image is never upscaled.
    Cover,
}

impl Scaler {
    pub fn name(self) -> &'static str {
        match self {
            Scaler::Crop => "crop",
            Scaler::Distort => "distort",
            Scaler::Contain => "contain",
            Scaler::ForcedCover => "forced_cover",
            Scaler::Cover => "cover",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "crop" => Some(Scaler::Crop),
            "distort" => Some(Scaler::Distort),
            "contain" => Some(Scaler::Contain),
            "forced_cover" => Some(Scaler::ForcedCover),
            "cover" => Some(Scaler::Cover),
            _ => None,
        }
    }

    /// Final resolution of the scaled image for the given bounds.
    ///
    /// `max_width`/`max_height` of 0 fall back to the intrinsic size.
    pub fn calculate_resolution(
        self,
        image_width: u32,
        image_height: u32,
        max_width: u32,
        max_height: u32,
    ) -> (u32, u32) {
        match self {
            Scaler::Crop | Scaler::Cover => min_size_resolution(
                image_width,
                image_height,
                max_width,
                max_height,
            ),
            Scaler::Distort | Scaler::ForcedCover => (
                non_zero_or(max_width, image_width),
                non_zero_or(max_height, image_height),
            ),
            Scaler::Contain => {
                contain_resolution(image_width, image_height, max_width, max_height)
            }
        }
    }

    /// Transforms the image according to this policy.
    ///
    /// The anchor shifts the crop window for the cropping policies; it is
    /// ignored by the purely resizing ones.
    pub fn scale(
        self,
        image: &RgbImage,
        anchor: Point,
        max_width: u32,
        max_height: u32,
    ) -> RgbImage {
        let (width, height) =
            self.calculate_resolution(image.width(), image.height(), max_width, max_height);

        match self {
            Scaler::Crop => {
                let offset_x = anchor_offset(anchor.x, width, image.width());
                let offset_y = anchor_offset(anchor.y, height, image.height());
                imageops::crop_imm(image, offset_x, offset_y, width, height).to_image()
            }
            Scaler::Distort | Scaler::Contain => {
                if (width, height) == (image.width(), image.height()) {
                    image.clone()
                } else {
                    imageops::resize(image, width, height, RESIZE_FILTER)
                }
            }
            Scaler::ForcedCover | Scaler::Cover => {
                cover_scale(image, anchor, width, height)
            }
        }
    }
}

/// Offset of the crop window so that it contains the anchor-weighted
/// position and still lies inside the source bounds.
pub fn anchor_offset(position: f32, target_size: u32, image_size: u32) -> u32 {
    let center = f64::from(position) * f64::from(image_size) - f64::from(target_size) / 2.0;
    let max = f64::from(image_size.saturating_sub(target_size));
    center.clamp(0.0, max) as u32
}

fn non_zero_or(value: u32, fallback: u32) -> u32 {
    if value != 0 {
        value
    } else {
        fallback
    }
}

fn min_size_resolution(
    image_width: u32,
    image_height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    (
        non_zero_or(max_width, image_width).min(image_width),
        non_zero_or(max_height, image_height).min(image_height),
    )
}

fn contain_resolution(
    image_width: u32,
    image_height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    // Integer truncation can make a single pass shrink its own output by
    // one more pixel; iterating to the fixed point keeps the resolution
    // stable when it is fed back in as the bounds.
    let mut bounds = (max_width, max_height);
    loop {
        let next = contain_pass(image_width, image_height, bounds.0, bounds.1);
        if next == bounds {
            return next;
        }
        bounds = next;
    }
}

fn contain_pass(
    image_width: u32,
    image_height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    let mut width = f64::from(image_width);
    let mut height = f64::from(image_height);

    if max_width != 0 && f64::from(max_width) < width {
        height = height * f64::from(max_width) / width;
        width = f64::from(max_width);
    }
    if max_height != 0 && f64::from(max_height) < height {
        width = width * f64::from(max_height) / height;
        height = f64::from(max_height);
    }

    ((width as u32).max(1), (height as u32).max(1))
}

/// Resize so the image covers the target box completely (the larger of
/// the width-driven and height-driven scale factors wins), then crop the
/// overflow around the anchor.
fn cover_scale(image: &RgbImage, anchor: Point, width: u32, height: u32) -> RgbImage {
    let image_width = f64::from(image.width());
    let image_height = f64::from(image.height());

    let (scaled_width, scaled_height) =
        if f64::from(width) / image_width > f64::from(height) / image_height {
            (
                width,
                ((image_height * f64::from(width) / image_width) as u32).max(1),
            )
        } else {
            (
                ((image_width * f64::from(height) / image_height) as u32).max(1),
                height,
            )
        };

    let resized = if (scaled_width, scaled_height) == (image.width(), image.height()) {
        image.clone()
    } else {
        imageops::resize(image, scaled_width, scaled_height, RESIZE_FILTER)
    };

    let offset_x = anchor_offset(anchor.x, width, scaled_width);
    let offset_y = anchor_offset(anchor.y, height, scaled_height);
    imageops::crop_imm(&resized, offset_x, offset_y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Scaler; 5] = [
        Scaler::Crop,
        Scaler::Distort,
        Scaler::Contain,
        Scaler::ForcedCover,
        Scaler::Cover,
    ];

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 0])
        })
    }

    #[test]
    fn names_round_trip() {
        for scaler in ALL {
            assert_eq!(Scaler::parse(scaler.name()), Some(scaler));
        }
        assert_eq!(Scaler::parse("stretch"), None);
    }

    #[test]
    fn resolution_is_idempotent() {
        for scaler in ALL {
            for (bw, bh) in [(0, 0), (40, 0), (0, 25), (40, 25), (500, 500), (17, 93)] {
                let (w, h) = scaler.calculate_resolution(120, 80, bw, bh);
                assert_eq!(
                    scaler.calculate_resolution(120, 80, w, h),
                    (w, h),
                    "{} with bounds {}x{}",
                    scaler.name(),
                    bw,
                    bh
                );
            }
        }
    }

    #[test]
    fn zero_bound_means_intrinsic() {
        assert_eq!(Scaler::Distort.calculate_resolution(120, 80, 0, 0), (120, 80));
        assert_eq!(Scaler::Contain.calculate_resolution(120, 80, 0, 40), (60, 40));
        assert_eq!(Scaler::Crop.calculate_resolution(120, 80, 30, 0), (30, 80));
    }

    #[test]
    fn contain_never_upscales() {
        let (w, h) = Scaler::Contain.calculate_resolution(120, 80, 500, 500);
        assert_eq!((w, h), (120, 80));

        let (w, h) = Scaler::Contain.calculate_resolution(120, 80, 60, 60);
        assert!(w <= 60 && h <= 60);
        // Aspect ratio is preserved for the constrained fit.
        assert_eq!((w, h), (60, 40));
    }

    #[test]
    fn anchor_offset_stays_inside_source() {
        for target in [1, 10, 50, 100] {
            for i in 0..=20 {
                let anchor = i as f32 / 20.0;
                let offset = anchor_offset(anchor, target, 100);
                assert!(offset + target.min(100) <= 100, "anchor {}", anchor);
            }
        }
    }

    #[test]
    fn crop_takes_window_at_anchor() {
        let image = gradient(100, 50);
        let cropped = Scaler::Crop.scale(&image, Point::new(0.0, 0.0), 30, 20);
        assert_eq!((cropped.width(), cropped.height()), (30, 20));
        // Anchor at the origin keeps the top-left corner.
        assert_eq!(cropped.get_pixel(0, 0), image.get_pixel(0, 0));

        let cropped = Scaler::Crop.scale(&image, Point::new(1.0, 1.0), 30, 20);
        assert_eq!(cropped.get_pixel(29, 19), image.get_pixel(99, 49));
    }

    #[test]
    fn crop_larger_than_source_keeps_source() {
        let image = gradient(20, 10);
        let cropped = Scaler::Crop.scale(&image, Point::new(0.5, 0.5), 100, 100);
        assert_eq!((cropped.width(), cropped.height()), (20, 10));
    }

    #[test]
    fn distort_hits_bounds_exactly() {
        let image = gradient(100, 50);
        let scaled = Scaler::Distort.scale(&image, Point::default(), 30, 40);
        assert_eq!((scaled.width(), scaled.height()), (30, 40));
    }

    #[test]
    fn forced_cover_fills_box() {
        let image = gradient(100, 50);
        // Wider box than the image ratio: the height-overflow is cropped.
        let scaled = Scaler::ForcedCover.scale(&image, Point::new(0.5, 0.5), 80, 60);
        assert_eq!((scaled.width(), scaled.height()), (80, 60));
        // A box larger than the image upscales.
        let scaled = Scaler::ForcedCover.scale(&image, Point::new(0.5, 0.5), 200, 200);
        assert_eq!((scaled.width(), scaled.height()), (200, 200));
    }

    #[test]
    fn cover_does_not_upscale() {
        let image = gradient(100, 50);
        let scaled = Scaler::Cover.scale(&image, Point::new(0.5, 0.5), 200, 200);
        // Bounds are clamped to the intrinsic size first.
        assert_eq!((scaled.width(), scaled.height()), (100, 50));
    }
}
