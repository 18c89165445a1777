//! Image loading for the correction pipeline.
//!
//! The pipeline operates on interleaved f32 RGB in the [0, 1] range; this
//! module decodes source files into that domain exactly once per item.

use std::path::Path;

use crate::models::Stage;
use std::collections::BTreeMap;

/// Decoded image in the pipeline's numeric domain: interleaved RGB f32,
/// values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuf {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl ImageBuf {
    /// Number of pixels (width * height).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Map from pipeline stage to its corrected output image.
pub type StageImages = BTreeMap<Stage, ImageBuf>;

/// Load and decode an image file into the pipeline domain.
///
/// Any decode failure is reported as a message naming the file; callers
/// turn it into a per-item failure rather than propagating it.
pub fn load_image(path: &Path) -> Result<ImageBuf, String> {
    let decoded = image::open(path)
        .map_err(|e| format!("Failed to load image {}: {e}", path.display()))?;

    let rgb = decoded.into_rgb32f();
    let (width, height) = (rgb.width(), rgb.height());
    let data = rgb.into_raw();

    if data.is_empty() {
        return Err(format!("Image {} decoded to zero pixels", path.display()));
    }

    Ok(ImageBuf {
        width,
        height,
        data,
    })
}

/// Encode a pipeline-domain image back to an 8-bit file; the format is
/// chosen from the path's extension.
pub fn save_image(buf: &ImageBuf, path: &Path) -> Result<(), String> {
    let bytes: Vec<u8> = buf
        .data
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let rgb = image::RgbImage::from_raw(buf.width, buf.height, bytes)
        .ok_or_else(|| format!("Image buffer inconsistent with {}x{}", buf.width, buf.height))?;
    rgb.save(path)
        .map_err(|e| format!("Failed to save image {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_names_the_path() {
        let err = load_image(Path::new("/nonexistent/input.png")).unwrap_err();
        assert!(err.contains("/nonexistent/input.png"));
    }

    #[test]
    fn test_pixel_count() {
        let buf = ImageBuf {
            width: 4,
            height: 3,
            data: vec![0.0; 36],
        };
        assert_eq!(buf.pixel_count(), 12);
    }
}
