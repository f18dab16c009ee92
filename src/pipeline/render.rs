//! Raw frame to JPEG.
//!
//! Fixed step order: decode, center crop, resize, rotate, flip horizontal,
//! flip vertical, encode. Crop and resize each change the size the later
//! steps see. Passthrough JPEG sources skip every step.

use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use tracing::{debug, error};

use crate::capture::{FrameLayout, PixelFormat, RawFrame, SourceDescriptor};
use crate::error::RenderError;

/// Render `frame` as described by `descriptor`, logging failures.
///
/// With `skip_transforms` only decode and encode run.
pub fn render(
    frame: &RawFrame,
    descriptor: &SourceDescriptor,
    quality: u8,
    skip_transforms: bool,
) -> Option<Bytes> {
    match try_render(frame, descriptor, quality, skip_transforms) {
        Ok(jpeg) => Some(jpeg),
        Err(e) => {
            error!("Cannot render frame {} from {}: {}", frame.sequence, descriptor.uri, e);
            None
        }
    }
}

/// Attribute `frame` to its camera within `layout`, then render it.
pub fn render_from_layout(
    frame: &RawFrame,
    layout: &FrameLayout,
    quality: u8,
    skip_transforms: bool,
) -> Option<Bytes> {
    match try_render_from_layout(frame, layout, quality, skip_transforms) {
        Ok(jpeg) => Some(jpeg),
        Err(e) => {
            error!("Dropping frame {}: {}", frame.sequence, e);
            None
        }
    }
}

pub fn try_render_from_layout(
    frame: &RawFrame,
    layout: &FrameLayout,
    quality: u8,
    skip_transforms: bool,
) -> Result<Bytes, RenderError> {
    let descriptor = layout.attribute(frame.data.len())?;
    try_render(frame, descriptor, quality, skip_transforms)
}

pub fn try_render(
    frame: &RawFrame,
    descriptor: &SourceDescriptor,
    quality: u8,
    skip_transforms: bool,
) -> Result<Bytes, RenderError> {
    if descriptor.format == PixelFormat::Jpeg {
        return Ok(frame.data.clone());
    }

    let start = Instant::now();
    let mut image = decode(frame, descriptor)?;

    if !skip_transforms {
        image = transform(image, descriptor);
    }

    let mut jpeg = Vec::with_capacity(frame.data.len() / 8);
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, quality))?;

    metrics::histogram!("render_time_us").record(start.elapsed().as_micros() as f64);
    Ok(Bytes::from(jpeg))
}

fn decode(frame: &RawFrame, descriptor: &SourceDescriptor) -> Result<DynamicImage, RenderError> {
    let (width, height) = descriptor.size();
    let size_error = || RenderError::BufferSize {
        len: frame.data.len(),
        width,
        height,
        format: descriptor.format.image_mode(),
    };

    if descriptor.frame_len() != Some(frame.data.len()) {
        return Err(size_error());
    }

    let pixels = frame.data.to_vec();
    let image = match descriptor.format {
        PixelFormat::Rgb24 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        PixelFormat::Y8 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        PixelFormat::Jpeg => None,
    };
    image.ok_or_else(size_error)
}

fn transform(mut image: DynamicImage, descriptor: &SourceDescriptor) -> DynamicImage {
    let t = &descriptor.transform;

    let (crop_w, crop_h) = t.crop;
    if crop_w > 0 && crop_h > 0 {
        let crop_w = crop_w.min(image.width());
        let crop_h = crop_h.min(image.height());
        let x = (image.width() - crop_w) / 2;
        let y = (image.height() - crop_h) / 2;
        image = image.crop_imm(x, y, crop_w, crop_h);
    }

    let (resize_w, resize_h) = t.resize;
    if resize_w > 0 && resize_h > 0 {
        image = image.resize_exact(resize_w, resize_h, FilterType::Triangle);
    }

    // Degrees are counter-clockwise
    image = match t.rotate {
        0 => image,
        90 => image.rotate270(),
        180 => image.rotate180(),
        270 => image.rotate90(),
        other => {
            debug!("Ignoring rotation of {} degrees for {}", other, descriptor.uri);
            image
        }
    };

    if t.flip_horizontal {
        image = image.fliph();
    }
    if t.flip_vertical {
        image = image.flipv();
    }
    image
}
