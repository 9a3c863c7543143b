//! Masks drawn from fractional regions.
//!
//! The generation service reads a translucent marker painted over the full
//! resolution photograph; inpainting-style services take the binary form.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use verdant_contracts::edits::MarkerColor;
use verdant_contracts::regions::EllipseRegion;

/// An ellipse in absolute pixel units for one image size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelEllipse {
    pub cx: f64,
    pub cy: f64,
    pub rx: f64,
    pub ry: f64,
}

impl PixelEllipse {
    /// x quantities scale with `width`, y quantities with `height`.
    pub fn from_region(region: &EllipseRegion, width: u32, height: u32) -> Self {
        let width = f64::from(width);
        let height = f64::from(height);
        Self {
            cx: region.cx * width,
            cy: region.cy * height,
            rx: region.rx * width,
            ry: region.ry * height,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        if self.rx <= 0.0 || self.ry <= 0.0 {
            return false;
        }
        let dx = (x - self.cx) / self.rx;
        let dy = (y - self.cy) / self.ry;
        dx * dx + dy * dy <= 1.0
    }

    /// Inclusive-exclusive pixel bounds clipped to the image.
    fn bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clip = |value: f64, max: u32| -> u32 { value.max(0.0).min(f64::from(max)) as u32 };
        (
            clip((self.cx - self.rx).floor(), width),
            clip((self.cy - self.ry).floor(), height),
            clip((self.cx + self.rx).ceil() + 1.0, width),
            clip((self.cy + self.ry).ceil() + 1.0, height),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerStyle {
    pub rgb: [u8; 3],
    pub alpha: f32,
}

impl MarkerStyle {
    pub fn new(color: MarkerColor, alpha: f32) -> Self {
        Self {
            rgb: color.rgb(),
            alpha: alpha.clamp(0.0, 1.0),
        }
    }
}

impl Default for MarkerStyle {
    fn default() -> Self {
        Self::new(MarkerColor::Red, 0.5)
    }
}

/// Paints the marker over a copy of `source`.
pub fn build_overlay(source: &DynamicImage, region: &EllipseRegion, style: MarkerStyle) -> RgbImage {
    let mut canvas = source.to_rgb8();
    let (width, height) = canvas.dimensions();
    let ellipse = PixelEllipse::from_region(region, width, height);
    let (x0, y0, x1, y1) = ellipse.bounds(width, height);
    let alpha = style.alpha;

    for y in y0..y1 {
        for x in x0..x1 {
            if !ellipse.contains(f64::from(x), f64::from(y)) {
                continue;
            }
            let pixel = canvas.get_pixel_mut(x, y);
            let Rgb(channels) = *pixel;
            let mut blended = [0u8; 3];
            for (idx, channel) in channels.iter().enumerate() {
                let under = f32::from(*channel);
                let over = f32::from(style.rgb[idx]);
                blended[idx] = (over * alpha + under * (1.0 - alpha)).round() as u8;
            }
            *pixel = Rgb(blended);
        }
    }
    canvas
}

/// White ellipse on black: white marks the pixels to regenerate.
pub fn build_binary_mask(width: u32, height: u32, region: &EllipseRegion) -> GrayImage {
    let ellipse = PixelEllipse::from_region(region, width, height);
    let mut mask = GrayImage::new(width, height);
    let (x0, y0, x1, y1) = ellipse.bounds(width, height);
    for y in y0..y1 {
        for x in x0..x1 {
            if ellipse.contains(f64::from(x), f64::from(y)) {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    mask
}
