use anyhow::{Context, Result};
use image::RgbaImage;
use std::fmt;
use std::path::Path;

/// Gaussian sigma used for `blur` without an explicit amount
pub const DEFAULT_BLUR_SIGMA: f32 = 12.0;

/// What replaces the background pixels
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundSource {
    /// Static image referenced by path or `file://` URL
    Image(String),
    /// Blurred copy of the camera frame
    Blur { sigma: f32 },
}

impl BackgroundSource {
    /// Parse a UI selection string
    ///
    /// `blur` and `blur:<sigma>` select blur, anything else is an image
    /// reference. Empty selections yield `None`.
    pub fn from_selection(selection: &str) -> Option<Self> {
        let selection = selection.trim();
        if selection.is_empty() {
            return None;
        }

        if selection.eq_ignore_ascii_case("blur") {
            return Some(BackgroundSource::Blur {
                sigma: DEFAULT_BLUR_SIGMA,
            });
        }

        if let Some(amount) = selection.strip_prefix("blur:") {
            let sigma = amount
                .trim()
                .parse::<f32>()
                .ok()
                .filter(|s| s.is_finite() && *s > 0.0)
                .unwrap_or(DEFAULT_BLUR_SIGMA);
            return Some(BackgroundSource::Blur { sigma });
        }

        Some(BackgroundSource::Image(selection.to_string()))
    }
}

impl fmt::Display for BackgroundSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackgroundSource::Image(reference) => write!(f, "{reference}"),
            BackgroundSource::Blur { sigma } => write!(f, "blur:{sigma}"),
        }
    }
}

/// A background ready to be handed to the compositor
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedBackground {
    Image { source: String, image: RgbaImage },
    Blur { sigma: f32 },
}

impl LoadedBackground {
    pub fn source(&self) -> BackgroundSource {
        match self {
            LoadedBackground::Image { source, .. } => BackgroundSource::Image(source.clone()),
            LoadedBackground::Blur { sigma } => BackgroundSource::Blur { sigma: *sigma },
        }
    }
}

/// Decodes background image references
pub trait BackgroundLoader {
    fn load_image(&self, reference: &str) -> Result<RgbaImage>;

    /// Resolve a selection into something the compositor can draw
    fn load(&self, source: &BackgroundSource) -> Result<LoadedBackground> {
        match source {
            BackgroundSource::Image(reference) => Ok(LoadedBackground::Image {
                source: reference.clone(),
                image: self.load_image(reference)?,
            }),
            BackgroundSource::Blur { sigma } => Ok(LoadedBackground::Blur { sigma: *sigma }),
        }
    }
}

/// Loads images from the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FsBackgroundLoader;

impl BackgroundLoader for FsBackgroundLoader {
    fn load_image(&self, reference: &str) -> Result<RgbaImage> {
        let path = Path::new(reference.strip_prefix("file://").unwrap_or(reference));
        let image = image::open(path)
            .with_context(|| format!("Failed to decode background image {}", path.display()))?;
        tracing::debug!(
            "Loaded background {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(image.into_rgba8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_selection_parsing() {
        assert_eq!(BackgroundSource::from_selection("  "), None);
        assert_eq!(
            BackgroundSource::from_selection("blur"),
            Some(BackgroundSource::Blur {
                sigma: DEFAULT_BLUR_SIGMA
            })
        );
        assert_eq!(
            BackgroundSource::from_selection("blur:4.5"),
            Some(BackgroundSource::Blur { sigma: 4.5 })
        );
        assert_eq!(
            BackgroundSource::from_selection("blur:-1"),
            Some(BackgroundSource::Blur {
                sigma: DEFAULT_BLUR_SIGMA
            })
        );
        assert_eq!(
            BackgroundSource::from_selection("images/beach.jpg"),
            Some(BackgroundSource::Image("images/beach.jpg".into()))
        );
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.png");
        RgbaImage::from_pixel(3, 2, Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let reference = format!("file://{}", path.display());
        let loaded = FsBackgroundLoader
            .load(&BackgroundSource::Image(reference.clone()))
            .unwrap();
        match loaded {
            LoadedBackground::Image { source, image } => {
                assert_eq!(source, reference);
                assert_eq!(image.dimensions(), (3, 2));
                assert_eq!(image.get_pixel(1, 1), &Rgba([10, 20, 30, 255]));
            }
            other => panic!("expected image background, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.png");
        assert!(FsBackgroundLoader
            .load_image(&missing.display().to_string())
            .is_err());
    }
}
