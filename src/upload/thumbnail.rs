//! Thumbnail derivation for the thumbnail tier

use std::io::Cursor;

use image::DynamicImage;

use crate::error::{Result, UploadError};

/// Longest edge of a generated thumbnail, in pixels
pub const THUMBNAIL_MAX_DIMENSION: u32 = 256;

/// Decode `image_bytes` and re-encode a downscaled JPEG.
///
/// CPU bound; call from `spawn_blocking`.
pub fn render_thumbnail(image_bytes: &[u8], max_dimension: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| UploadError::NotUploadable(format!("not a decodable image: {}", e)))?;

    // JPEG has no alpha channel
    let thumb = DynamicImage::ImageRgb8(img.thumbnail(max_dimension, max_dimension).to_rgb8());

    let mut output = Vec::new();
    thumb
        .write_to(&mut Cursor::new(&mut output), image::ImageFormat::Jpeg)
        .map_err(|e| UploadError::Unknown(format!("Failed to encode thumbnail: {}", e)))?;

    Ok(output)
}

/// Async wrapper around [`render_thumbnail`]
pub async fn generate_thumbnail(image_bytes: Vec<u8>, max_dimension: u32) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || render_thumbnail(&image_bytes, max_dimension))
        .await
        .map_err(|e| UploadError::Unknown(format!("Thumbnail task failed: {}", e)))?
}

#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut output = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)
        .unwrap();
    output
}
