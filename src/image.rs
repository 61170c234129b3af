//! Uploaded image decoding.
//!
//! Gemini takes images inline as base64 with a MIME type. JPEG, PNG and WebP
//! are checked by decoding them and then sent unchanged; other raster formats
//! are decoded and re-encoded as PNG. HEIC/HEIF cannot be decoded here and are
//! recognised by their container brand only.

use std::io::Cursor;

use ::image::{DynamicImage, GenericImageView, ImageFormat};
use anyhow::{bail, Context, Result};
use base64::Engine;
use tracing::debug;

/// An image ready to be sent as an inline part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: &'static str,
    pub data: Vec<u8>,
}

impl InlineImage {
    pub fn base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

/// Decode an uploaded image into something Gemini accepts inline.
pub fn decode(data: Vec<u8>) -> Result<InlineImage> {
    if data.is_empty() {
        bail!("image is empty");
    }

    if let Some(mime_type) = heif_mime_type(&data) {
        return Ok(InlineImage { mime_type, data });
    }

    let format = ::image::guess_format(&data).context("unrecognised image format")?;
    let decoded = ::image::load_from_memory_with_format(&data, format)
        .with_context(|| format!("corrupt {:?} image ({} bytes)", format, data.len()))?;

    if let Some(mime_type) = inline_mime_type(format) {
        return Ok(InlineImage { mime_type, data });
    }

    debug!(
        "Re-encoding {:?} image ({}x{}) as PNG",
        format,
        decoded.width(),
        decoded.height()
    );
    let mut png = Vec::new();
    DynamicImage::ImageRgba8(decoded.to_rgba8())
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("Failed to re-encode image as PNG")?;

    Ok(InlineImage {
        mime_type: "image/png",
        data: png,
    })
}

/// Formats the provider takes as they are.
fn inline_mime_type(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Png => Some("image/png"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

/// ISO base media file: [size:4]["ftyp"][major brand:4]
fn heif_mime_type(data: &[u8]) -> Option<&'static str> {
    if data.len() <= 12 || &data[4..8] != b"ftyp" {
        return None;
    }
    match &data[8..12] {
        b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" => Some("image/heic"),
        b"mif1" | b"msf1" | b"heif" => Some("image/heif"),
        _ => None,
    }
}
