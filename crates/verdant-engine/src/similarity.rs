//! Pixel similarity between a working image and a generated candidate.
//!
//! Both comparators are pure and deterministic: images are resampled to a
//! shared working size, then scored by mean absolute RGB difference mapped
//! onto `[0, 1]` where 1 means identical.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use verdant_contracts::edits::VerificationMode;
use verdant_contracts::regions::{EllipseRegion, PreserveRect};
use verdant_contracts::settings::ChainSettings;

use crate::mask::PixelEllipse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparator {
    /// Width both images are resampled to before an outside-region pass.
    pub comparison_width: u32,
    /// Side of the square tile a preserve rectangle is resampled to.
    pub preserve_tile: u32,
}

impl Default for Comparator {
    fn default() -> Self {
        Self {
            comparison_width: 400,
            preserve_tile: 100,
        }
    }
}

impl Comparator {
    pub fn from_settings(settings: &ChainSettings) -> Self {
        Self {
            comparison_width: settings.comparison_width.max(1),
            preserve_tile: settings.preserve_tile.max(1),
        }
    }

    /// Scores how much of the picture outside `region` survived.
    ///
    /// Only pixels strictly outside the ellipse count. When nothing lies
    /// outside, the score is 1.0; mismatched buffers score 0.0.
    pub fn compare_outside_region(
        &self,
        original: &DynamicImage,
        candidate: &DynamicImage,
        region: &EllipseRegion,
    ) -> f64 {
        let (width, height) = (original.width(), original.height());
        if width == 0 || height == 0 || candidate.width() == 0 || candidate.height() == 0 {
            return 0.0;
        }
        let target_width = self.comparison_width;
        let target_height = ((f64::from(height) * f64::from(target_width) / f64::from(width))
            .round() as u32)
            .max(1);
        let left = resample(original, target_width, target_height);
        let right = resample(candidate, target_width, target_height);
        if left.as_raw().len() != right.as_raw().len() {
            return 0.0;
        }

        let ellipse = PixelEllipse::from_region(region, target_width, target_height);
        let mut total = 0u64;
        let mut compared = 0u64;
        for (x, y, pixel) in left.enumerate_pixels() {
            if ellipse.contains(f64::from(x), f64::from(y)) {
                continue;
            }
            let other = right.get_pixel(x, y);
            total += channel_distance(&pixel.0, &other.0);
            compared += 1;
        }
        if compared == 0 {
            return 1.0;
        }
        unit_score(total, compared * 3)
    }

    /// Scores how well the pixels inside `rect` survived.
    ///
    /// The rectangle is cut from each image at that image's own resolution,
    /// so candidates returned at a different size still compare fairly.
    pub fn compare_preserve_region(
        &self,
        original: &DynamicImage,
        candidate: &DynamicImage,
        rect: &PreserveRect,
    ) -> f64 {
        let tile = self.preserve_tile;
        let (Some(left), Some(right)) = (
            extract_tile(original, rect, tile),
            extract_tile(candidate, rect, tile),
        ) else {
            return 0.0;
        };
        if left.as_raw().len() != right.as_raw().len() {
            return 0.0;
        }
        let total: u64 = left
            .pixels()
            .zip(right.pixels())
            .map(|(a, b)| channel_distance(&a.0, &b.0))
            .sum();
        unit_score(total, u64::from(tile) * u64::from(tile) * 3)
    }

    /// Dispatches on the edit's verification mode.
    ///
    /// Preserve mode without a rectangle scores 0.0; edits are validated
    /// before they reach this point, so that only happens on misuse.
    pub fn score(
        &self,
        mode: VerificationMode,
        original: &DynamicImage,
        candidate: &DynamicImage,
        region: &EllipseRegion,
        preserve: Option<&PreserveRect>,
    ) -> f64 {
        match mode {
            VerificationMode::OutsideRegion => {
                self.compare_outside_region(original, candidate, region)
            }
            VerificationMode::PreserveRegion => match preserve {
                Some(rect) => self.compare_preserve_region(original, candidate, rect),
                None => 0.0,
            },
        }
    }
}

fn resample(image: &DynamicImage, width: u32, height: u32) -> RgbImage {
    if image.width() == width && image.height() == height {
        return image.to_rgb8();
    }
    image.resize_exact(width, height, FilterType::Triangle).to_rgb8()
}

fn extract_tile(image: &DynamicImage, rect: &PreserveRect, tile: u32) -> Option<RgbImage> {
    let (width, height) = (image.width(), image.height());
    let to_px = |fraction: f64, span: u32| -> u32 {
        (fraction * f64::from(span))
            .round()
            .clamp(0.0, f64::from(span)) as u32
    };
    let x = to_px(rect.x, width);
    let y = to_px(rect.y, height);
    let w = to_px(rect.w, width).min(width.saturating_sub(x));
    let h = to_px(rect.h, height).min(height.saturating_sub(y));
    if w == 0 || h == 0 {
        return None;
    }
    let cropped = image.crop_imm(x, y, w, h);
    Some(cropped.resize_exact(tile, tile, FilterType::Triangle).to_rgb8())
}

fn channel_distance(a: &[u8; 3], b: &[u8; 3]) -> u64 {
    a.iter()
        .zip(b.iter())
        .map(|(left, right)| u64::from(left.abs_diff(*right)))
        .sum()
}

fn unit_score(total: u64, samples: u64) -> f64 {
    if samples == 0 {
        return 1.0;
    }
    let mean = total as f64 / samples as f64;
    (1.0 - mean / 255.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};
    use verdant_contracts::edits::VerificationMode;
    use verdant_contracts::regions::{EllipseRegion, PreserveRect};

    use super::Comparator;

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
    }

    fn noisy(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            let seed = x.wrapping_mul(31) ^ y.wrapping_mul(17);
            Rgb([(seed % 251) as u8, (seed % 127) as u8, (seed % 61) as u8])
        }))
    }

    /// Copies `source`, repainting every pixel inside the ellipse.
    fn repaint_inside(source: &DynamicImage, region: &EllipseRegion, value: u8) -> DynamicImage {
        let mut rgb = source.to_rgb8();
        let (width, height) = rgb.dimensions();
        let ellipse = crate::mask::PixelEllipse::from_region(region, width, height);
        for (x, y, pixel) in rgb.enumerate_pixels_mut() {
            if ellipse.contains(f64::from(x), f64::from(y)) {
                *pixel = Rgb([value, value, value]);
            }
        }
        DynamicImage::ImageRgb8(rgb)
    }

    #[test]
    fn identical_images_score_one() {
        let comparator = Comparator::default();
        let image = noisy(640, 480);
        let region = EllipseRegion::new(0.3, 0.6, 0.1, 0.15);
        assert_eq!(comparator.compare_outside_region(&image, &image, &region), 1.0);
        let rect = PreserveRect::new(0.2, 0.7, 0.2, 0.1);
        assert_eq!(comparator.compare_preserve_region(&image, &image, &rect), 1.0);
    }

    #[test]
    fn black_versus_white_scores_zero() {
        let comparator = Comparator::default();
        let black = solid(400, 300, 0);
        let white = solid(400, 300, 255);
        let region = EllipseRegion::new(0.5, 0.5, 0.1, 0.1);
        assert_eq!(comparator.compare_outside_region(&black, &white, &region), 0.0);
    }

    #[test]
    fn uniform_shift_maps_linearly() {
        let comparator = Comparator::default();
        let base = solid(400, 200, 128);
        let shifted = solid(400, 200, 153);
        let region = EllipseRegion::new(0.5, 0.5, 0.1, 0.1);
        let score = comparator.compare_outside_region(&base, &shifted, &region);
        assert!((score - (1.0 - 25.0 / 255.0)).abs() < 1e-9);
    }

    #[test]
    fn changes_inside_region_are_ignored() {
        let comparator = Comparator::default();
        let image = solid(400, 300, 90);
        let region = EllipseRegion::new(0.4, 0.5, 0.15, 0.2);
        let edited = repaint_inside(&image, &region, 250);
        assert_eq!(comparator.compare_outside_region(&image, &edited, &region), 1.0);
    }

    #[test]
    fn region_covering_everything_scores_one() {
        let comparator = Comparator::default();
        let region = EllipseRegion::new(0.5, 0.5, 2.0, 2.0);
        let black = solid(400, 300, 0);
        let white = solid(400, 300, 255);
        assert_eq!(comparator.compare_outside_region(&black, &white, &region), 1.0);
    }

    #[test]
    fn candidate_at_other_resolution_is_resampled() {
        let comparator = Comparator::default();
        let region = EllipseRegion::new(0.5, 0.5, 0.1, 0.1);
        let score = comparator.compare_outside_region(
            &solid(1200, 900, 40),
            &solid(800, 600, 40),
            &region,
        );
        assert_eq!(score, 1.0);
    }

    #[test]
    fn preserve_region_only_looks_inside_rectangle() {
        let comparator = Comparator::default();
        let original = solid(300, 300, 200);
        let mut changed = original.to_rgb8();
        for (x, _, pixel) in changed.enumerate_pixels_mut() {
            if x < 150 {
                *pixel = Rgb([0, 0, 0]);
            }
        }
        let changed = DynamicImage::ImageRgb8(changed);
        let untouched = PreserveRect::new(0.6, 0.1, 0.3, 0.3);
        let touched = PreserveRect::new(0.1, 0.1, 0.2, 0.2);

        assert_eq!(comparator.compare_preserve_region(&original, &changed, &untouched), 1.0);
        assert!(comparator.compare_preserve_region(&original, &changed, &touched) < 0.5);
    }

    #[test]
    fn degenerate_preserve_rect_scores_zero() {
        let comparator = Comparator::default();
        let image = solid(100, 100, 10);
        let rect = PreserveRect::new(1.0, 1.0, 0.2, 0.2);
        assert_eq!(comparator.compare_preserve_region(&image, &image, &rect), 0.0);
    }

    #[test]
    fn score_dispatches_on_mode() {
        let comparator = Comparator::default();
        let image = noisy(200, 100);
        let region = EllipseRegion::new(0.5, 0.5, 0.1, 0.1);
        let rect = PreserveRect::new(0.1, 0.1, 0.2, 0.2);
        assert_eq!(
            comparator.score(VerificationMode::PreserveRegion, &image, &image, &region, Some(&rect)),
            1.0
        );
        assert_eq!(
            comparator.score(VerificationMode::PreserveRegion, &image, &image, &region, None),
            0.0
        );
        assert_eq!(
            comparator.score(VerificationMode::OutsideRegion, &image, &image, &region, None),
            1.0
        );
    }
}
