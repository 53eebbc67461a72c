use serde::{Deserialize, Serialize};

/// A polygon vertex as reported by the recognition service.
///
/// Values may fall outside the image (negative or past the right/bottom edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
}

impl Coordinate {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle bound to the image it was derived from.
///
/// Invariant: `left + width <= image width` and `top + height <= image height`
/// for the image passed to the constructor that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingRect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Reduce a polygon to the rectangle covering it, clamped to a
    /// `image_width` x `image_height` image.
    ///
    /// `left`/`top` are the minimum x/y (clamped to `0..=dim`), and the
    /// extent reaches the maximum x/y, cut at the image edge. A single point
    /// yields a 0x0 rectangle; an empty polygon yields the zero rectangle.
    pub fn from_points(points: &[Coordinate], image_width: u32, image_height: u32) -> Self {
        let Some(first) = points.first() else {
            return Self::default();
        };

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }

        let (left, width) = clamp_span(min_x, max_x, image_width);
        let (top, height) = clamp_span(min_y, max_y, image_height);
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Bounding rectangle of a set of integer pixel positions (inclusive),
    /// as used for contour borders. Empty input yields `None`.
    pub fn enclosing<I>(pixels: I) -> Option<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut iter = pixels.into_iter();
        let (x0, y0) = iter.next()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (x0, y0, x0, y0);
        for (x, y) in iter {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Some(Self {
            left: min_x,
            top: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Map a rectangle found on an image scaled by `scale` back to the
    /// unscaled image, rounding each edge and clamping to its bounds.
    pub fn unscale(&self, scale: f64, image_width: u32, image_height: u32) -> Self {
        if scale <= 0.0 {
            return Self::default();
        }
        let round = |v: u32| (v as f64 / scale).round().max(0.0) as u64;

        let left = round(self.left).min(image_width as u64) as u32;
        let top = round(self.top).min(image_height as u64) as u32;
        let width = round(self.width).min((image_width - left) as u64) as u32;
        let height = round(self.height).min((image_height - top) as u64) as u32;
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// Clamp `[min, max]` to `[0, limit]`, returning `(start, length)`.
fn clamp_span(min: i32, max: i32, limit: u32) -> (u32, u32) {
    let limit = limit as i64;
    let start = (min as i64).clamp(0, limit);
    let end = (max as i64).clamp(start, limit);
    (start as u32, (end - start) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(list: &[(i32, i32)]) -> Vec<Coordinate> {
        list.iter().map(|&(x, y)| Coordinate::new(x, y)).collect()
    }

    #[test]
    fn rectangle_inside_frame() {
        let rect = BoundingRect::from_points(&pts(&[(5, 5), (50, 5), (50, 40), (5, 40)]), 100, 100);
        assert_eq!(rect, BoundingRect::new(5, 5, 45, 35));
    }

    #[test]
    fn clamps_to_frame_bounds() {
        let rect = BoundingRect::from_points(&pts(&[(90, 90), (95, 95), (-10, -10)]), 100, 100);
        assert_eq!(rect.left, 0);
        assert_eq!(rect.top, 0);
        assert!(rect.left + rect.width <= 100);
        assert!(rect.top + rect.height <= 100);
        assert_eq!(rect, BoundingRect::new(0, 0, 95, 95));
    }

    #[test]
    fn points_past_far_edge_are_cut() {
        let rect = BoundingRect::from_points(&pts(&[(60, 70), (130, 150)]), 100, 100);
        assert_eq!(rect, BoundingRect::new(60, 70, 40, 30));
    }

    #[test]
    fn single_point_is_degenerate() {
        let rect = BoundingRect::from_points(&pts(&[(12, 34)]), 100, 100);
        assert_eq!(rect, BoundingRect::new(12, 34, 0, 0));
        assert!(rect.is_empty());
    }

    #[test]
    fn polygon_entirely_outside() {
        let rect = BoundingRect::from_points(&pts(&[(-20, -5), (-3, -1)]), 100, 100);
        assert_eq!(rect, BoundingRect::new(0, 0, 0, 0));

        let rect = BoundingRect::from_points(&pts(&[(150, 20), (170, 40)]), 100, 100);
        assert_eq!(rect, BoundingRect::new(100, 20, 0, 20));
    }

    #[test]
    fn enclosing_is_inclusive() {
        let rect = BoundingRect::enclosing([(3, 4), (7, 4), (7, 9)]).unwrap();
        assert_eq!(rect, BoundingRect::new(3, 4, 5, 6));
        assert!(BoundingRect::enclosing(std::iter::empty()).is_none());
    }

    #[test]
    fn unscale_rounds_and_clamps() {
        // found on a 640-wide image scaled from 1280 (scale 0.5)
        let rect = BoundingRect::new(101, 50, 300, 400).unscale(0.5, 1280, 720);
        assert_eq!(rect, BoundingRect::new(202, 100, 600, 620));
    }
}
