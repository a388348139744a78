use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, Rgba, RgbaImage};

/// Supported output formats, selected by the request path extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Jpeg,
    Png,
    Webp,
    Avif,
}

impl Format {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Format::Jpeg),
            "png" => Some(Format::Png),
            "webp" => Some(Format::Webp),
            "avif" => Some(Format::Avif),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Jpeg => "image/jpeg",
            Format::Png => "image/png",
            Format::Webp => "image/webp",
            Format::Avif => "image/avif",
        }
    }
}

/// One resize request as handed to the encoder. Width or height of zero
/// means "proportional"; both zero transcodes without resizing.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub jpg_quality: u8,
    pub webp_quality: u8,
    pub avif_quality: u8,
    pub avif_speed: u8,
    pub png_compression: u8,
    pub ensure_opaque: bool,
}

/// Decodes, scales and re-encodes image payloads. Requested dimensions
/// strictly larger than the source are satisfied by compositing the original
/// onto a larger canvas instead of upscaling pixel data.
#[derive(Debug, Default)]
pub struct Processor {
    encodes: AtomicU64,
}

impl Processor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of encode invocations since startup. Feeds metrics and lets
    /// tests observe single-flight behaviour.
    pub fn encode_count(&self) -> u64 {
        self.encodes.load(Ordering::Relaxed)
    }

    pub fn encode(&self, source: &[u8], opts: &EncodeOptions) -> Result<Vec<u8>> {
        if source.is_empty() {
            bail!("source payload is empty");
        }
        self.encodes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_encode();

        let img = image::load_from_memory(source).context("decode source image")?;
        let (src_w, src_h) = img.dimensions();

        let scaled = match (opts.width, opts.height) {
            (w, h) if w > 0 && h > 0 => {
                if w > src_w && h > src_h {
                    return compose_canvas(&img, w, h, opts);
                }
                img.resize_to_fill(w, h, FilterType::Lanczos3)
            }
            (w, 0) if w > 0 => {
                if w > src_w {
                    let scale = src_h as f64 / src_w as f64;
                    let h = ((w as f64 * scale).round() as u32).max(src_h);
                    return compose_canvas(&img, w, h, opts);
                }
                let h = proportional(src_h, w, src_w);
                img.resize_exact(w, h, FilterType::Lanczos3)
            }
            (0, h) if h > 0 => {
                if h > src_h {
                    let scale = src_w as f64 / src_h as f64;
                    let w = ((h as f64 * scale).round() as u32).max(src_w);
                    return compose_canvas(&img, w, h, opts);
                }
                let w = proportional(src_w, h, src_h);
                img.resize_exact(w, h, FilterType::Lanczos3)
            }
            _ => img,
        };

        encode_image(scaled, opts)
    }
}

fn proportional(side: u32, scaled_other: u32, src_other: u32) -> u32 {
    ((side as f64 * scaled_other as f64 / src_other as f64).round() as u32).max(1)
}

/// Centers the original on a canvas of the requested size. The canvas is
/// transparent unless the output must be opaque (JPEG, or a JPEG-sourced
/// request), in which case it is white.
fn compose_canvas(img: &DynamicImage, width: u32, height: u32, opts: &EncodeOptions) -> Result<Vec<u8>> {
    let background = if opts.ensure_opaque || opts.format == Format::Jpeg {
        Rgba([255, 255, 255, 255])
    } else {
        Rgba([0, 0, 0, 0])
    };
    let mut canvas = RgbaImage::from_pixel(width, height, background);
    let (content_w, content_h) = img.dimensions();
    let left = i64::from(width.saturating_sub(content_w) / 2);
    let top = i64::from(height.saturating_sub(content_h) / 2);
    imageops::overlay(&mut canvas, &img.to_rgba8(), left, top);
    encode_image(DynamicImage::ImageRgba8(canvas), opts)
}

fn encode_image(img: DynamicImage, opts: &EncodeOptions) -> Result<Vec<u8>> {
    let img = if opts.ensure_opaque && opts.format != Format::Jpeg {
        DynamicImage::ImageRgba8(flatten_onto_white(&img))
    } else {
        img
    };
    let mut out = Vec::new();
    match opts.format {
        Format::Jpeg => {
            // JPEG carries no alpha channel; flatten unconditionally.
            let rgb = DynamicImage::ImageRgba8(flatten_onto_white(&img)).to_rgb8();
            let quality = opts.jpg_quality.clamp(1, 100);
            let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), quality);
            encoder
                .write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ExtendedColorType::Rgb8,
                )
                .context("encode JPEG output")?;
        }
        Format::Png => {
            let rgba = img.to_rgba8();
            let encoder = PngEncoder::new_with_quality(
                Cursor::new(&mut out),
                png_compression(opts.png_compression),
                PngFilter::Adaptive,
            );
            encoder
                .write_image(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .context("encode PNG output")?;
        }
        Format::Webp => {
            let rgba = img.to_rgba8();
            let encoded = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
                .encode(f32::from(opts.webp_quality.min(100)));
            out = encoded.to_vec();
        }
        Format::Avif => {
            let rgba = img.to_rgba8();
            let encoder = AvifEncoder::new_with_speed_quality(
                Cursor::new(&mut out),
                opts.avif_speed.min(8),
                opts.avif_quality.min(100),
            );
            encoder
                .write_image(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .context("encode AVIF output")?;
        }
    }
    Ok(out)
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn flatten_onto_white(img: &DynamicImage) -> RgbaImage {
    let mut rgba = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let alpha = u16::from(pixel[3]);
        for channel in 0..3 {
            let value = u16::from(pixel[channel]);
            pixel[channel] = ((value * alpha + 255 * (255 - alpha)) / 255) as u8;
        }
        pixel[3] = 255;
    }
    rgba
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn opts(width: u32, height: u32, format: Format) -> EncodeOptions {
        EncodeOptions {
            width,
            height,
            format,
            jpg_quality: 80,
            webp_quality: 75,
            avif_quality: 75,
            avif_speed: 8,
            png_compression: 6,
            ensure_opaque: false,
        }
    }

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 37) as u8, (y * 53) as u8, 128])
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn rejects_empty_source() {
        let processor = Processor::new();
        assert!(processor.encode(&[], &opts(10, 10, Format::Png)).is_err());
    }

    #[test]
    fn rejects_undecodable_source() {
        let processor = Processor::new();
        assert!(
            processor
                .encode(b"not an image", &opts(10, 10, Format::Png))
                .is_err()
        );
    }

    #[test]
    fn downscales_with_center_crop_when_both_sides_given() {
        let processor = Processor::new();
        let out = processor
            .encode(&sample_png(40, 20), &opts(10, 10, Format::Png))
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (10, 10));
    }

    #[test]
    fn single_axis_resize_keeps_proportions() {
        let processor = Processor::new();
        let out = processor
            .encode(&sample_png(40, 20), &opts(20, 0, Format::Png))
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (20, 10));
    }

    #[test]
    fn upscale_composites_instead_of_stretching() {
        let processor = Processor::new();
        let out = processor
            .encode(&sample_png(4, 4), &opts(10, 10, Format::Png))
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (10, 10));
        // Corners are canvas padding and stay transparent for PNG output.
        let rgba = decoded.to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0)[3], 0);
        assert_eq!(rgba.get_pixel(9, 9)[3], 0);
        // The original pixels sit centered and opaque.
        assert_eq!(rgba.get_pixel(5, 5)[3], 255);
    }

    #[test]
    fn jpeg_upscale_pads_with_opaque_white() {
        let processor = Processor::new();
        let out = processor
            .encode(&sample_png(4, 4), &opts(10, 10, Format::Jpeg))
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (10, 10));
        let rgba = decoded.to_rgba8();
        let corner = rgba.get_pixel(0, 0);
        assert_eq!(corner[3], 255);
        assert!(corner[0] > 200 && corner[1] > 200 && corner[2] > 200);
    }

    #[test]
    fn single_axis_upscale_clamps_other_side_at_source() {
        // 40x20 source, height 30 requested: proportional width would be 60,
        // and the height exceeds the source, so a 60x30 canvas is produced.
        let processor = Processor::new();
        let out = processor
            .encode(&sample_png(40, 20), &opts(0, 30, Format::Png))
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (60, 30));
    }

    #[test]
    fn transcodes_between_formats() {
        let processor = Processor::new();
        let source = sample_png(8, 8);
        for format in [Format::Jpeg, Format::Webp, Format::Png] {
            let out = processor.encode(&source, &opts(8, 8, format)).unwrap();
            assert!(!out.is_empty());
        }
        assert_eq!(processor.encode_count(), 3);
    }

    #[test]
    fn webp_output_has_riff_header() {
        let processor = Processor::new();
        let out = processor
            .encode(&sample_png(8, 8), &opts(4, 4, Format::Webp))
            .unwrap();
        assert_eq!(&out[0..4], b"RIFF");
        assert_eq!(&out[8..12], b"WEBP");
    }
}
