use std::path::Path;

use image::Rgb;
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use platewatch_common::config::{ConfigError, MaskFilterConfig};
use platewatch_common::frame::Frame;
use platewatch_common::geometry::Coordinate;
use tracing::warn;

use super::{DebugSnapshot, FilterError};

const FILL: Rgb<u8> = Rgb([0, 0, 0]);

/// Paints configured polygons black, hiding timestamps, road signs and other
/// text that would otherwise reach the recognition service.
pub struct MaskFilter {
    name: String,
    polygons: Vec<Vec<Point<i32>>>,
    debug: Option<DebugSnapshot>,
}

impl MaskFilter {
    pub fn new(config: &MaskFilterConfig, data_path: &Path) -> Result<Self, ConfigError> {
        let polygons = config
            .polygons()?
            .into_iter()
            .filter_map(|shape| {
                let polygon = to_polygon(&shape);
                if polygon.is_none() {
                    warn!(filter = %config.name, ?shape, "ignoring degenerate mask shape");
                }
                polygon
            })
            .collect();

        Ok(Self {
            name: config.name.clone(),
            polygons,
            debug: config.debug.then(|| DebugSnapshot::new(data_path, &config.name)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, frame: &mut Frame) -> Result<(), FilterError> {
        if frame.is_empty() || self.polygons.is_empty() {
            return Ok(());
        }

        let mut image = frame.image().clone();
        for polygon in &self.polygons {
            draw_polygon_mut(&mut image, polygon, FILL);
        }
        frame.replace_image(image)?;

        if let Some(debug) = &self.debug {
            debug.save(frame);
        }
        Ok(())
    }
}

/// Polygons are implicitly closed; a repeated closing vertex is dropped.
/// Fewer than three distinct vertices cannot be filled.
fn to_polygon(shape: &[Coordinate]) -> Option<Vec<Point<i32>>> {
    let mut points: Vec<Point<i32>> = shape.iter().map(|c| Point::new(c.x, c.y)).collect();
    points.dedup();
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    (points.len() >= 3).then_some(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn config(shapes: &[&str]) -> MaskFilterConfig {
        MaskFilterConfig {
            name: "mask".into(),
            shapes: shapes.iter().map(|s| s.to_string()).collect(),
            debug: false,
        }
    }

    fn white(width: u32, height: u32) -> Frame {
        Frame::from_image(RgbImage::from_pixel(width, height, Rgb([255, 255, 255]))).unwrap()
    }

    #[test]
    fn masked_area_turns_black() {
        let dir = tempfile::tempdir().unwrap();
        let filter = MaskFilter::new(&config(&["0,0,20,0,20,10,0,10"]), dir.path()).unwrap();

        let mut frame = white(40, 30);
        filter.apply(&mut frame).unwrap();

        assert_eq!(frame.image().get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(frame.image().get_pixel(30, 20), &Rgb([255, 255, 255]));
        // The JPEG was re-encoded from the masked pixels.
        let decoded = Frame::from_jpeg(frame.jpeg().clone()).unwrap();
        assert!(decoded.image().get_pixel(5, 5)[0] < 40);
    }

    #[test]
    fn shapes_outside_the_frame_are_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let filter = MaskFilter::new(&config(&["-10,-10,500,-10,500,5,-10,5"]), dir.path()).unwrap();

        let mut frame = white(20, 20);
        filter.apply(&mut frame).unwrap();
        assert_eq!(frame.image().get_pixel(19, 0), &Rgb([0, 0, 0]));
        assert_eq!(frame.image().get_pixel(10, 15), &Rgb([255, 255, 255]));
    }

    #[test]
    fn empty_frame_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let filter = MaskFilter::new(&config(&["0,0,5,0,5,5"]), dir.path()).unwrap();
        let mut frame = Frame::default();
        filter.apply(&mut frame).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn closing_vertex_is_dropped() {
        let shape = [
            Coordinate::new(0, 0),
            Coordinate::new(5, 0),
            Coordinate::new(5, 5),
            Coordinate::new(0, 0),
        ];
        let polygon = to_polygon(&shape).unwrap();
        assert_eq!(polygon.len(), 3);

        let degenerate = [Coordinate::new(1, 1), Coordinate::new(2, 2), Coordinate::new(1, 1)];
        assert!(to_polygon(&degenerate).is_none());
    }
}
