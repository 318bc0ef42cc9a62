//! Image header probing.

use image::ImageReader;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Dimensions and format read from an image header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProbe {
    pub width: u32,
    pub height: u32,
    /// Upper-case format name, e.g. `PNG`.
    pub format: String,
}

/// Read dimensions and format without decoding pixel data.
///
/// Any failure (unreadable file, unknown format, corrupt header) yields `None`.
pub fn probe_image(path: &Path) -> Option<ImageProbe> {
    let reader = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => reader,
        Err(e) => {
            debug!("Cannot open {} for probing: {}", path.display(), e);
            return None;
        }
    };
    let format = reader.format()?;

    match reader.into_dimensions() {
        Ok((width, height)) => Some(ImageProbe {
            width,
            height,
            format: format!("{:?}", format).to_uppercase(),
        }),
        Err(e) => {
            debug!("Cannot read header of {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_probe_png() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pixel.png");
        image::RgbImage::new(3, 2).save(&path).unwrap();

        let probe = probe_image(&path).unwrap();
        assert_eq!((probe.width, probe.height), (3, 2));
        assert_eq!(probe.format, "PNG");
    }

    #[test]
    fn test_probe_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fake.png");
        std::fs::write(&path, b"definitely not an image").unwrap();

        assert_eq!(probe_image(&path), None);
        assert_eq!(probe_image(&temp.path().join("missing.png")), None);
    }
}
