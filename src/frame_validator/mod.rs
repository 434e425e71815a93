//! FrameValidator - cheap per-frame corruption and quality checks
//!
//! ## Responsibilities
//!
//! - Dominant-color ratio test (solid/garbage frames from codec desync)
//! - Green-band test (H.264 desync paints large bright-green areas), only
//!   for network streams
//! - Laplacian-variance sharpness and minimum size (quality, not corruption)
//!
//! Checks sample every `stride`-th pixel so they stay cheap enough to run on
//! every frame read from a network source.

use crate::config_store::SourceKind;
use image::RgbImage;

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Frame is corrupt when one quantized color covers more than this share
    pub dominant_ratio: f64,
    /// Frame is corrupt when bright green covers more than this share
    pub green_ratio: f64,
    pub sample_stride: u32,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            dominant_ratio: 0.95,
            green_ratio: 0.10,
            sample_stride: 4,
            min_width: 64,
            min_height: 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Corruption {
    Empty,
    DominantColor { ratio: f64 },
    GreenBand { ratio: f64 },
}

impl std::fmt::Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Corruption::Empty => write!(f, "empty frame"),
            Corruption::DominantColor { ratio } => {
                write!(f, "dominant color covers {:.0}%", ratio * 100.0)
            }
            Corruption::GreenBand { ratio } => write!(f, "green band covers {:.0}%", ratio * 100.0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameValidator {
    config: ValidatorConfig,
}

impl FrameValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// `Some` when the frame should be discarded and re-read. Runs every
    /// check, including the green band.
    pub fn check_corruption(&self, image: &RgbImage) -> Option<Corruption> {
        self.scan(image, true)
    }

    /// Corruption checks that apply to frames from a `kind` source
    pub fn check_corruption_for(&self, image: &RgbImage, kind: SourceKind) -> Option<Corruption> {
        self.scan(image, kind == SourceKind::Ip)
    }

    fn scan(&self, image: &RgbImage, green_band: bool) -> Option<Corruption> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Some(Corruption::Empty);
        }

        let stride = self.config.sample_stride.max(1);
        let mut bins = [0u32; 512];
        let mut green = 0u32;
        let mut samples = 0u32;

        for y in (0..h).step_by(stride as usize) {
            for x in (0..w).step_by(stride as usize) {
                let [r, g, b] = image.get_pixel(x, y).0;
                let bin = ((r >> 5) as usize) << 6 | ((g >> 5) as usize) << 3 | (b >> 5) as usize;
                bins[bin] += 1;
                if is_bright_green(r, g, b) {
                    green += 1;
                }
                samples += 1;
            }
        }

        let samples = samples as f64;
        let dominant = bins.iter().copied().max().unwrap_or(0) as f64 / samples;
        if dominant > self.config.dominant_ratio {
            return Some(Corruption::DominantColor { ratio: dominant });
        }

        let green = green as f64 / samples;
        if green_band && green > self.config.green_ratio {
            return Some(Corruption::GreenBand { ratio: green });
        }
        None
    }

    pub fn is_corrupt(&self, image: &RgbImage) -> bool {
        self.check_corruption(image).is_some()
    }

    /// Variance of the 4-neighbour Laplacian over the luma plane
    pub fn sharpness(&self, image: &RgbImage) -> f64 {
        let gray = image::imageops::grayscale(image);
        let (w, h) = gray.dimensions();
        if w < 3 || h < 3 {
            return 0.0;
        }

        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut n = 0u64;
        let px = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f64;

        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1)
                    - 4.0 * px(x, y);
                sum += lap;
                sum_sq += lap * lap;
                n += 1;
            }
        }

        let mean = sum / n as f64;
        sum_sq / n as f64 - mean * mean
    }

    /// Corruption plus quality verdict for a frame from a `kind` source
    pub fn assess(&self, image: &RgbImage, kind: SourceKind, min_sharpness: f64) -> FrameQuality {
        let (w, h) = image.dimensions();
        let sharpness = self.sharpness(image);
        FrameQuality {
            corruption: self.check_corruption_for(image, kind),
            sharpness,
            blurry: sharpness < min_sharpness,
            too_small: w < self.config.min_width || h < self.config.min_height,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameQuality {
    pub corruption: Option<Corruption>,
    pub sharpness: f64,
    pub blurry: bool,
    pub too_small: bool,
}

impl FrameQuality {
    pub fn is_acceptable(&self) -> bool {
        self.corruption.is_none() && !self.blurry && !self.too_small
    }
}

/// HSV band H 80..160 deg, S and V >= 100/255
fn is_bright_green(r: u8, g: u8, b: u8) -> bool {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    if max < 100 || max != g {
        return false;
    }
    let delta = (max - min) as f32;
    if delta * 255.0 < 100.0 * max as f32 {
        return false;
    }
    let hue = 60.0 * ((b as f32 - r as f32) / delta) + 120.0;
    (80.0..=160.0).contains(&hue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn textured(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                ((x * 7 + y * 3) % 256) as u8,
                ((x * 13 + y * 5) % 128) as u8,
                ((x * 3 + y * 11) % 256) as u8,
            ])
        })
    }

    #[test]
    fn test_textured_frame_is_clean() {
        let validator = FrameValidator::default();
        assert!(validator.check_corruption(&textured(160, 120)).is_none());
    }

    #[test]
    fn test_solid_frame_is_corrupt() {
        let validator = FrameValidator::default();
        let solid = RgbImage::from_pixel(160, 120, Rgb([128, 128, 128]));
        assert!(matches!(
            validator.check_corruption(&solid),
            Some(Corruption::DominantColor { .. })
        ));
    }

    fn with_green_band(mut img: RgbImage) -> RgbImage {
        for y in 0..30 {
            for x in 0..img.width() {
                img.put_pixel(x, y, Rgb([0, 200 + (x % 50) as u8, (y % 40) as u8]));
            }
        }
        img
    }

    #[test]
    fn test_green_band_is_corrupt() {
        let validator = FrameValidator::default();
        let img = with_green_band(textured(160, 120));
        assert!(matches!(
            validator.check_corruption(&img),
            Some(Corruption::GreenBand { .. })
        ));
        assert!(matches!(
            validator.check_corruption_for(&img, SourceKind::Ip),
            Some(Corruption::GreenBand { .. })
        ));
    }

    #[test]
    fn test_green_band_only_checked_for_ip() {
        let validator = FrameValidator::default();
        let img = with_green_band(textured(160, 120));
        assert!(validator.check_corruption_for(&img, SourceKind::Usb).is_none());
        assert!(validator.check_corruption_for(&img, SourceKind::Video).is_none());
        assert!(validator.assess(&img, SourceKind::Usb, 0.0).is_acceptable());

        // dominant-color check still applies to every kind
        let solid = RgbImage::from_pixel(160, 120, Rgb([0, 220, 0]));
        assert!(validator.check_corruption_for(&solid, SourceKind::Usb).is_some());
    }

    #[test]
    fn test_bright_green_band() {
        assert!(is_bright_green(0, 255, 0));
        assert!(is_bright_green(40, 200, 90));
        assert!(!is_bright_green(200, 200, 200));
        assert!(!is_bright_green(0, 60, 0));
        assert!(!is_bright_green(0, 200, 255));
    }

    #[test]
    fn test_sharpness_orders_textures() {
        let validator = FrameValidator::default();
        let flat = RgbImage::from_pixel(64, 64, Rgb([90, 90, 90]));
        let checker = RgbImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        assert_eq!(validator.sharpness(&flat), 0.0);
        assert!(validator.sharpness(&checker) > 1000.0);

        let quality = validator.assess(&flat, SourceKind::Usb, 100.0);
        assert!(quality.blurry);
        assert!(!quality.is_acceptable());
    }
}
