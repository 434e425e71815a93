//! MotionDetector - frame-pair comparator for motion-triggered capture
//!
//! ## Algorithm
//!
//! 1. Grayscale and Gaussian-blur both frames
//! 2. Absolute difference, binary threshold
//! 3. Dilate to merge fragments
//! 4. Outer contours; contours under `min_area` are noise
//! 5. Motion when the summed area exceeds `threshold`
//!
//! Stateless and CPU bound; callers run it on a blocking thread.

use crate::config_store::MotionConfig;
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::point::Point;
use imageproc::rect::Rect;

const MARK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Debug, Clone)]
pub struct MotionDetectorConfig {
    pub threshold: f64,
    pub min_area: f64,
    pub blur_sigma: f32,
    pub pixel_threshold: u8,
    pub dilate_radius: u8,
}

impl Default for MotionDetectorConfig {
    fn default() -> Self {
        Self::from(&MotionConfig::default())
    }
}

impl From<&MotionConfig> for MotionDetectorConfig {
    fn from(c: &MotionConfig) -> Self {
        Self {
            threshold: c.threshold,
            min_area: c.min_area,
            blur_sigma: c.blur_sigma,
            pixel_threshold: c.pixel_threshold,
            dilate_radius: c.dilate_radius,
        }
    }
}

/// One contour that counted towards the total
#[derive(Debug, Clone, PartialEq)]
pub struct MotionRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub area: f64,
}

#[derive(Debug, Clone)]
pub struct MotionResult {
    pub motion: bool,
    /// Summed area of the contours above `min_area`
    pub area: f64,
    pub regions: Vec<MotionRegion>,
    /// Current frame with the counted regions outlined
    pub annotated: RgbImage,
}

#[derive(Debug, Clone, Default)]
pub struct MotionDetector {
    config: MotionDetectorConfig,
}

impl MotionDetector {
    pub fn new(config: MotionDetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MotionDetectorConfig {
        &self.config
    }

    pub fn detect(&self, current: &RgbImage, previous: &RgbImage) -> MotionResult {
        if current.dimensions() != previous.dimensions() {
            tracing::warn!(
                current = ?current.dimensions(),
                previous = ?previous.dimensions(),
                "Frame size changed, skipping motion comparison"
            );
            return MotionResult {
                motion: false,
                area: 0.0,
                regions: Vec::new(),
                annotated: current.clone(),
            };
        }

        let a = self.prepare(current);
        let b = self.prepare(previous);
        let cutoff = self.config.pixel_threshold;

        let mask = GrayImage::from_fn(a.width(), a.height(), |x, y| {
            let diff = a.get_pixel(x, y).0[0].abs_diff(b.get_pixel(x, y).0[0]);
            if diff > cutoff {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let mask = if self.config.dilate_radius > 0 {
            imageproc::morphology::dilate(&mask, Norm::LInf, self.config.dilate_radius)
        } else {
            mask
        };

        let mut regions = Vec::new();
        for contour in find_contours::<i32>(&mask) {
            if contour.parent.is_some() || contour.border_type != BorderType::Outer {
                continue;
            }
            let area = polygon_area(&contour.points);
            if area < self.config.min_area {
                continue;
            }
            if let Some(region) = bounding_region(&contour.points, area) {
                regions.push(region);
            }
        }

        let area: f64 = regions.iter().map(|r| r.area).sum();
        let motion = area > self.config.threshold;

        let mut annotated = current.clone();
        for r in &regions {
            draw_hollow_rect_mut(
                &mut annotated,
                Rect::at(r.x as i32, r.y as i32).of_size(r.width.max(1), r.height.max(1)),
                MARK_COLOR,
            );
        }

        if motion {
            tracing::debug!(
                area,
                regions = regions.len(),
                threshold = self.config.threshold,
                "Motion detected"
            );
        } else if !regions.is_empty() {
            tracing::trace!(area, regions = regions.len(), "Motion below threshold");
        }

        MotionResult {
            motion,
            area,
            regions,
            annotated,
        }
    }

    fn prepare(&self, image: &RgbImage) -> GrayImage {
        let gray = image::imageops::grayscale(image);
        if self.config.blur_sigma > 0.0 {
            imageproc::filter::gaussian_blur_f32(&gray, self.config.blur_sigma)
        } else {
            gray
        }
    }
}

/// Shoelace area of a closed contour
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    twice.abs() as f64 / 2.0
}

fn bounding_region(points: &[Point<i32>], area: f64) -> Option<MotionRegion> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    Some(MotionRegion {
        x: min_x.max(0) as u32,
        y: min_y.max(0) as u32,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
        area,
    })
}
