use std::path::Path;

use image::RgbImage;
use platewatch_common::config::MotionFilterConfig;
use platewatch_common::frame::Frame;
use platewatch_common::geometry::BoundingRect;
use tracing::{debug, error, warn};

use super::vision;
use super::{DebugSnapshot, FilterError};
use crate::queue::OrderedFrameQueue;

/// Width both frames are scaled to before comparison.
pub const PROCESSING_WIDTH: u32 = 640;
/// Equivalent of a 15x15 Gaussian kernel with automatically derived sigma:
/// `0.3 * ((15 - 1) * 0.5 - 1) + 0.8`.
pub const BLUR_SIGMA: f32 = 2.6;
/// Absolute grey-level difference above which a pixel counts as changed.
pub const DIFF_THRESHOLD: u8 = 25;
/// Half-size of the 5x5 square used to merge nearby fragments.
pub const DILATE_RADIUS: u8 = 2;

/// Frame-difference motion heuristic.
///
/// Algorithm:
/// 1. Area-average both frames down (or up) to `processing_width`, keeping
///    the current frame's aspect ratio
/// 2. Convert to grayscale
/// 3. Gaussian blur
/// 4. Absolute difference
/// 5. Binary threshold
/// 6. One dilation pass with a square element
/// 7. Bounding rectangle of every outer and hole contour border
///
/// The largest rectangle by area is the motion region. Sorting is stable, so
/// rectangles of equal area keep contour discovery order (raster order of the
/// border's first pixel) and the earliest one wins.
#[derive(Debug, Clone, Copy)]
pub struct MotionDetector {
    pub processing_width: u32,
    pub blur_sigma: f32,
    pub threshold: u8,
    pub dilate_radius: u8,
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self {
            processing_width: PROCESSING_WIDTH,
            blur_sigma: BLUR_SIGMA,
            threshold: DIFF_THRESHOLD,
            dilate_radius: DILATE_RADIUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MotionOutcome {
    /// Nothing to compare against.
    NoPrior,
    /// The frames are alike.
    Still,
    Motion {
        /// Largest region, in processing coordinates.
        region: BoundingRect,
        /// Processing width divided by the current frame's width.
        scale: f64,
        /// How many candidate regions were found.
        regions: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("cannot compare an empty image")]
    EmptyImage,
    #[error("motion worker failed: {0}")]
    Worker(String),
}

impl MotionDetector {
    pub fn detect(&self, prior: &RgbImage, current: &RgbImage) -> Result<MotionOutcome, MotionError> {
        if current.width() == 0 || current.height() == 0 || prior.width() == 0 || prior.height() == 0 {
            return Err(MotionError::EmptyImage);
        }

        let scale = self.processing_width as f64 / current.width() as f64;
        let width = self.processing_width;
        let height = ((current.height() as f64 * scale).round() as u32).max(1);

        let now = self.prepare(current, width, height);
        let before = self.prepare(prior, width, height);

        let diff = vision::abs_diff(&before, &now);
        let mask = vision::binarize(&diff, self.threshold);
        let mask = vision::dilate_square(&mask, self.dilate_radius);

        let mut rects = vision::contour_bounds(&mask);
        if rects.is_empty() {
            return Ok(MotionOutcome::Still);
        }
        rects.sort_by(|a, b| b.area().cmp(&a.area()));

        Ok(MotionOutcome::Motion {
            region: rects[0],
            scale,
            regions: rects.len(),
        })
    }

    fn prepare(&self, image: &RgbImage, width: u32, height: u32) -> image::GrayImage {
        let resized = vision::resize_area(image, width, height);
        let gray = vision::grayscale(&resized);
        vision::gaussian_blur(&gray, self.blur_sigma)
    }
}

/// Drops frames that do not differ from the frame admitted before them.
///
/// Frames pass through an [`OrderedFrameQueue`], so each one is compared to
/// its true predecessor even when several are in flight. The first frame a
/// filter sees has no predecessor and is dropped.
pub struct MotionFilter {
    name: String,
    detector: MotionDetector,
    crop_to_roi: bool,
    debug: Option<DebugSnapshot>,
    queue: OrderedFrameQueue<Frame>,
}

impl MotionFilter {
    pub fn new(config: &MotionFilterConfig, data_path: &Path) -> Self {
        Self::with_detector(config, data_path, MotionDetector::default())
    }

    pub fn with_detector(config: &MotionFilterConfig, data_path: &Path, detector: MotionDetector) -> Self {
        Self {
            name: config.name.clone(),
            detector,
            crop_to_roi: config.crop_to_roi,
            debug: config.debug.then(|| DebugSnapshot::new(data_path, &config.name)),
            queue: OrderedFrameQueue::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn apply(&self, frame: &mut Frame) -> Result<(), FilterError> {
        if frame.is_empty() {
            return Ok(());
        }

        let detector = self.detector;
        let (current, outcome) = self
            .queue
            .enqueue(std::mem::take(frame), |prior, current| async move {
                let Some(prior) = prior else {
                    return (current, Ok(MotionOutcome::NoPrior));
                };
                if prior.is_empty() {
                    return (current, Ok(MotionOutcome::NoPrior));
                }
                // Pixel work runs off the async workers while this job
                // still holds the queue.
                tokio::task::spawn_blocking(move || {
                    let outcome = detector.detect(prior.image(), current.image());
                    (current, outcome)
                })
                .await
                .unwrap_or_else(|e| (Frame::default(), Err(MotionError::Worker(e.to_string()))))
            })
            .await;
        *frame = current;

        match outcome {
            Ok(MotionOutcome::NoPrior) => {
                debug!(filter = %self.name, "no prior frame, dropping");
                frame.clear();
            }
            Ok(MotionOutcome::Still) => {
                debug!(filter = %self.name, "no motion");
                frame.clear();
            }
            Ok(MotionOutcome::Motion {
                region,
                scale,
                regions,
            }) => {
                debug!(
                    filter = %self.name,
                    regions,
                    left = region.left,
                    top = region.top,
                    width = region.width,
                    height = region.height,
                    "motion detected"
                );
                if self.crop_to_roi {
                    let roi = region.unscale(scale, frame.width(), frame.height());
                    if let Err(e) = frame.crop(roi) {
                        warn!(filter = %self.name, error = %e, "could not crop to motion region, keeping full frame");
                    }
                }
            }
            Err(e) => {
                error!(filter = %self.name, error = %e, "motion detection failed, dropping frame");
                frame.clear();
            }
        }

        if let Some(debug) = &self.debug {
            if !frame.is_empty() {
                debug.save(frame);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn black(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([0, 0, 0]))
    }

    fn with_square(width: u32, height: u32, left: u32, top: u32, size: u32) -> RgbImage {
        let mut img = black(width, height);
        for y in top..top + size {
            for x in left..left + size {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        img
    }

    fn config(crop_to_roi: bool) -> MotionFilterConfig {
        MotionFilterConfig {
            name: "motion".into(),
            debug: false,
            crop_to_roi,
        }
    }

    #[test]
    fn identical_frames_are_still() {
        let img = with_square(320, 240, 40, 40, 30);
        let outcome = MotionDetector::default().detect(&img, &img).unwrap();
        assert_eq!(outcome, MotionOutcome::Still);
    }

    #[test]
    fn square_is_found_where_it_appeared() {
        let before = black(320, 240);
        let after = with_square(320, 240, 100, 60, 40);

        let outcome = MotionDetector::default().detect(&before, &after).unwrap();
        let MotionOutcome::Motion { region, scale, .. } = outcome else {
            panic!("expected motion, got {outcome:?}");
        };
        assert_eq!(scale, 2.0);

        // The square spans 200..280 x 120..200 at processing size; blur and
        // dilation widen it a little but it must stay centred there.
        let back = region.unscale(scale, 320, 240);
        assert!(back.left <= 100 && back.left >= 85, "{back:?}");
        assert!(back.top <= 60 && back.top >= 45, "{back:?}");
        assert!(back.left + back.width >= 140 && back.left + back.width <= 155, "{back:?}");
        assert!(back.top + back.height >= 100 && back.top + back.height <= 115, "{back:?}");
    }

    #[test]
    fn largest_region_wins() {
        let before = black(640, 480);
        let mut after = with_square(640, 480, 20, 20, 20);
        for y in 200..300 {
            for x in 300..420 {
                after.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let MotionOutcome::Motion { region, regions, .. } =
            MotionDetector::default().detect(&before, &after).unwrap()
        else {
            panic!("expected motion");
        };
        assert!(regions >= 2);
        assert!(region.left > 250 && region.top > 150, "{region:?}");
    }

    #[test]
    fn empty_images_are_an_error() {
        let err = MotionDetector::default().detect(&black(0, 0), &black(10, 10));
        assert!(matches!(err, Err(MotionError::EmptyImage)));
    }

    #[tokio::test]
    async fn filter_passes_only_changed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let filter = MotionFilter::new(&config(false), dir.path());

        let still = Frame::from_image(black(160, 120)).unwrap();
        let moved = Frame::from_image(with_square(160, 120, 60, 40, 30)).unwrap();

        let mut first = still.clone();
        filter.apply(&mut first).await.unwrap();
        assert!(first.is_empty(), "first frame has no prior");

        let mut second = moved.clone();
        filter.apply(&mut second).await.unwrap();
        assert!(!second.is_empty(), "changed frame passes");
        assert_eq!(second.jpeg(), moved.jpeg(), "passing frame is untouched");

        let mut third = moved.clone();
        filter.apply(&mut third).await.unwrap();
        assert!(third.is_empty(), "repeat of the prior frame is dropped");
    }

    #[tokio::test]
    async fn empty_frame_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let filter = MotionFilter::new(&config(false), dir.path());

        let mut empty = Frame::default();
        filter.apply(&mut empty).await.unwrap();

        // The empty frame must not have become the prior.
        let mut first = Frame::from_image(black(64, 48)).unwrap();
        filter.apply(&mut first).await.unwrap();
        let mut second = Frame::from_image(with_square(64, 48, 10, 10, 20)).unwrap();
        filter.apply(&mut second).await.unwrap();
        assert!(!second.is_empty());
    }

    #[tokio::test]
    async fn crop_to_roi_shrinks_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let filter = MotionFilter::new(&config(true), dir.path());

        let mut first = Frame::from_image(black(320, 240)).unwrap();
        filter.apply(&mut first).await.unwrap();
        let mut second = Frame::from_image(with_square(320, 240, 100, 60, 40)).unwrap();
        filter.apply(&mut second).await.unwrap();

        assert!(!second.is_empty());
        assert!(second.width() < 80 && second.width() >= 40, "width {}", second.width());
        assert!(second.height() < 80 && second.height() >= 40, "height {}", second.height());
    }

    #[tokio::test]
    async fn debug_snapshot_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = MotionFilterConfig {
            name: "gate".into(),
            debug: true,
            crop_to_roi: false,
        };
        let filter = MotionFilter::new(&config, dir.path());

        let mut first = Frame::from_image(black(64, 48)).unwrap();
        filter.apply(&mut first).await.unwrap();
        let mut second = Frame::from_image(with_square(64, 48, 10, 10, 20)).unwrap();
        filter.apply(&mut second).await.unwrap();

        // The snapshot is written in the background.
        let path = dir.path().join("debug").join("gate.jpg");
        let written = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match tokio::fs::read(&path).await {
                    Ok(bytes) if bytes.len() == second.jpeg().len() => break bytes,
                    _ => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&written[..], &second.jpeg()[..]);
    }
}
