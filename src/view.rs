//! Placement model
//!
//! A `View` is the process-wide set of named image placements plus the
//! pane offset; every overlay window renders the same view against its
//! own terminal metrics. Each placement caches its most recent transforms
//! keyed by the terminal context identity, so redraws that do not change
//! geometry skip the expensive rescale.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use hashlink::{LinkedHashMap, LruCache};
use image::RgbImage;

use crate::geometry::{Distance, Point};
use crate::loading::ImageHolder;
use crate::scaling::Scaler;
use crate::term::TerminalWindowInfo;

/// Transforms kept per placement. Advisory only; eviction costs a
/// rescale, never correctness.
const TRANSFORM_CACHE_CAPACITY: usize = 8;

/// Identity of one cached transform: the terminal context (window plus
/// metric version) and the resolved scaling options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TransformKey {
    window_id: u32,
    context_version: u64,
    scaler: Scaler,
    anchor_bits: (u32, u32),
    width: u32,
    height: u32,
}

/// The decoded image is shared with the loader only while the load is in
/// flight; afterwards the placement keeps its own handle.
pub enum ImageSource {
    Loading(Arc<ImageHolder>),
    Ready(Arc<RgbImage>),
}

/// Result of resolving a placement against one terminal context.
pub struct ResolvedPlacement {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub image: Arc<RgbImage>,
}

/// A named, positioned, scaled image instance.
pub struct Placement {
    /// Position in terminal cell units, relative to the pane origin.
    pub x: i32,
    pub y: i32,
    /// Target box in cell units; 0 means the intrinsic image size.
    pub width: u32,
    pub height: u32,
    pub anchor: Point,
    pub scaler: Scaler,
    pub path: PathBuf,
    pub last_modified: Option<SystemTime>,
    source: ImageSource,
    cache: LruCache<TransformKey, Arc<RgbImage>>,
}

impl Placement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        anchor: Point,
        scaler: Scaler,
        path: PathBuf,
        last_modified: Option<SystemTime>,
        source: ImageSource,
    ) -> Self {
        Self {
            x,
            y,
            width,
            height,
            anchor,
            scaler,
            path,
            last_modified,
            source,
            cache: LruCache::new(TRANSFORM_CACHE_CAPACITY),
        }
    }

    /// The decoded image, waiting for the loader if necessary.
    pub fn image(&mut self) -> Arc<RgbImage> {
        match &self.source {
            ImageSource::Ready(image) => Arc::clone(image),
            ImageSource::Loading(holder) => {
                let image = holder.wait();
                self.source = ImageSource::Ready(Arc::clone(&image));
                image
            }
        }
    }

    /// The image if it finished loading, without blocking.
    pub fn image_if_ready(&self) -> Option<Arc<RgbImage>> {
        match &self.source {
            ImageSource::Ready(image) => Some(Arc::clone(image)),
            ImageSource::Loading(holder) => holder.try_get(),
        }
    }

    /// Absolute pixel rectangle and transformed buffer of this placement
    /// for the given pane offset and terminal metrics.
    pub fn resolve(
        &mut self,
        offset: Distance,
        term_info: &TerminalWindowInfo,
    ) -> ResolvedPlacement {
        let image = self.image();

        let x = (self.x + offset.left) * term_info.font_width as i32 + term_info.padding as i32;
        let y = (self.y + offset.top) * term_info.font_height as i32 + term_info.padding as i32;
        // Cell counts come straight off the wire and may be huge.
        let max_width = self.width.saturating_mul(term_info.font_width);
        let max_height = self.height.saturating_mul(term_info.font_height);

        let (width, height) =
            self.scaler
                .calculate_resolution(image.width(), image.height(), max_width, max_height);

        let key = TransformKey {
            window_id: term_info.window_id,
            context_version: term_info.version(),
            scaler: self.scaler,
            anchor_bits: (self.anchor.x.to_bits(), self.anchor.y.to_bits()),
            width,
            height,
        };

        let transformed = match self.cache.get(&key) {
            Some(cached) => Arc::clone(cached),
            None => {
                let scaled = Arc::new(self.scaler.scale(&image, self.anchor, max_width, max_height));
                self.cache.insert(key, Arc::clone(&scaled));
                scaled
            }
        };

        ResolvedPlacement {
            x,
            y,
            width,
            height,
            image: transformed,
        }
    }
}

/// Pane offset plus the insertion-ordered placement map. One per
/// process, shared by all overlay windows.
pub struct View {
    pub offset: Distance,
    pub media: LinkedHashMap<String, Placement>,
}

impl View {
    pub fn new(offset: Distance) -> Self {
        Self {
            offset,
            media: LinkedHashMap::new(),
        }
    }
}

impl Default for View {
    fn default() -> Self {
        Self::new(Distance::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(window_id: u32, font_width: u32, font_height: u32) -> TerminalWindowInfo {
        TerminalWindowInfo::with_metrics(window_id, font_width, font_height, 2)
    }

    fn test_placement(width_cells: u32, height_cells: u32) -> Placement {
        let image = Arc::new(RgbImage::from_pixel(64, 32, image::Rgb([1, 2, 3])));
        Placement::new(
            3,
            1,
            width_cells,
            height_cells,
            Point::new(0.5, 0.5),
            Scaler::Contain,
            PathBuf::from("/tmp/test.png"),
            None,
            ImageSource::Ready(image),
        )
    }

    #[test]
    fn resolve_maps_cells_to_pixels() {
        let info = test_info(9, 8, 16);
        let mut placement = test_placement(0, 0);
        let resolved = placement.resolve(Distance::default(), &info);

        // (3 cells * 8 px) + 2 px padding, (1 cell * 16 px) + 2 px padding.
        assert_eq!((resolved.x, resolved.y), (26, 18));
        // Unconstrained box keeps the intrinsic size.
        assert_eq!((resolved.width, resolved.height), (64, 32));
    }

    #[test]
    fn resolve_honors_pane_offset() {
        let info = test_info(9, 8, 16);
        let mut placement = test_placement(0, 0);
        let offset = Distance::new(2, 4, 0, 0);
        let resolved = placement.resolve(offset, &info);
        assert_eq!((resolved.x, resolved.y), ((3 + 4) * 8 + 2, (1 + 2) * 16 + 2));
    }

    #[test]
    fn transform_is_cached_per_context_version() {
        let mut info = test_info(9, 8, 16);
        let mut placement = test_placement(4, 1);

        let first = placement.resolve(Distance::default(), &info);
        let second = placement.resolve(Distance::default(), &info);
        // Same context, same options: the cached buffer is reused.
        assert!(Arc::ptr_eq(&first.image, &second.image));

        // A metric recalculation invalidates the cached transform even if
        // the resolved size happens to match.
        info.bump_version();
        let third = placement.resolve(Distance::default(), &info);
        assert!(!Arc::ptr_eq(&first.image, &third.image));
    }

    #[test]
    fn oversized_target_boxes_saturate() {
        let info = test_info(9, 8, 16);
        let mut placement = test_placement(u32::MAX, u32::MAX);
        let resolved = placement.resolve(Distance::default(), &info);
        // Contain never upscales, so the intrinsic size survives.
        assert_eq!((resolved.width, resolved.height), (64, 32));
    }

    #[test]
    fn negative_positions_stay_signed() {
        let info = test_info(9, 8, 16);
        let mut placement = test_placement(0, 0);
        placement.x = -2;
        placement.y = -1;
        let resolved = placement.resolve(Distance::default(), &info);
        assert_eq!((resolved.x, resolved.y), (-16 + 2, -16 + 2));
    }
}
