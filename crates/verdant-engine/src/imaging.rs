use std::io::Cursor;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("failed to decode image bytes")
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("png encode failed")?;
    Ok(bytes)
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode_image(&DynamicImage::ImageRgb8(rgb))
        .context("jpeg encode failed")?;
    Ok(bytes)
}

/// Bounds an accepted candidate before it becomes the next step's input.
///
/// Wider images are scaled down to `max_width` (never up) and everything is
/// re-encoded as JPEG. Identical input always yields identical output.
pub fn prepare_next_input(bytes: &[u8], max_width: u32, quality: u8) -> Result<Vec<u8>> {
    let image = decode_image(bytes)?;
    let (width, height) = (image.width(), image.height());
    let bounded = if width > max_width && max_width > 0 {
        let scaled_height =
            ((f64::from(height) * f64::from(max_width) / f64::from(width)).round() as u32).max(1);
        image.resize_exact(max_width, scaled_height, FilterType::Lanczos3)
    } else {
        image
    };
    encode_jpeg(&bounded, quality)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Gif) => "image/gif",
        _ => "image/png",
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        "jpg"
    } else if lowered.contains("webp") {
        "webp"
    } else if lowered.contains("gif") {
        "gif"
    } else {
        "png"
    }
}

pub fn data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

pub fn decode_data_url(url: &str) -> Result<(Vec<u8>, Option<String>)> {
    let rest = url
        .strip_prefix("data:")
        .context("not a data URL")?;
    let (header, payload) = rest.split_once(',').context("data URL has no payload")?;
    let mime = header
        .split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .context("data URL base64 decode failed")?;
    Ok((bytes, mime))
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::{
        data_url, decode_data_url, decode_image, encode_png, prepare_next_input, sha256_hex,
        sniff_mime,
    };

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn prepare_next_input_caps_width_and_keeps_aspect() -> anyhow::Result<()> {
        let png = encode_png(&gradient(600, 300))?;
        let prepared = prepare_next_input(&png, 400, 95)?;
        assert_eq!(sniff_mime(&prepared), "image/jpeg");
        let decoded = decode_image(&prepared)?;
        assert_eq!((decoded.width(), decoded.height()), (400, 200));
        Ok(())
    }

    #[test]
    fn prepare_next_input_never_enlarges() -> anyhow::Result<()> {
        let png = encode_png(&gradient(120, 80))?;
        let decoded = decode_image(&prepare_next_input(&png, 2400, 95)?)?;
        assert_eq!((decoded.width(), decoded.height()), (120, 80));
        Ok(())
    }

    #[test]
    fn prepare_next_input_is_deterministic() -> anyhow::Result<()> {
        let png = encode_png(&gradient(300, 200))?;
        let first = prepare_next_input(&png, 256, 95)?;
        let second = prepare_next_input(&png, 256, 95)?;
        assert_eq!(sha256_hex(&first), sha256_hex(&second));
        Ok(())
    }

    #[test]
    fn data_url_round_trips_bytes_and_mime() -> anyhow::Result<()> {
        let url = data_url(b"abc", "image/jpeg");
        let (bytes, mime) = decode_data_url(&url)?;
        assert_eq!(bytes, b"abc");
        assert_eq!(mime.as_deref(), Some("image/jpeg"));
        assert!(decode_data_url("https://example.com/a.png").is_err());
        Ok(())
    }
}
