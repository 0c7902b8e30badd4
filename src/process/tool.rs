//! Picture tool trait and the in-process implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::ProcessError;

/// What identification learns about a picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureInfo {
    pub width: u32,
    pub height: u32,
    /// Upper-case format name, e.g. `PNG` or `JPEG`.
    pub format: String,
}

/// Identify pictures and render their thumbnails.
///
/// Stored pictures carry no file extension, so implementations must sniff
/// the format from content.
pub trait PictureTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn identify(&self, path: &Path) -> Result<PictureInfo, ProcessError>;

    /// Write a JPEG thumbnail of `src` whose longest side is at most
    /// `max_side` pixels to `dest`.
    fn thumbnail(&self, src: &Path, dest: &Path, max_side: u32) -> Result<(), ProcessError>;
}

/// Sibling of `dest` to render into before the final rename.
pub(crate) fn temporary_sibling(dest: &Path) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{}.tmp", std::process::id(), n));
    dest.with_file_name(name)
}

/// Render through a temporary sibling so `dest` only ever holds a complete
/// thumbnail.
pub(crate) fn write_atomically<F>(dest: &Path, render: F) -> Result<(), ProcessError>
where
    F: FnOnce(&Path) -> Result<(), ProcessError>,
{
    let tmp = temporary_sibling(dest);
    if let Err(e) = render(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&tmp, dest) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Pure Rust tool backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTool;

impl BuiltinTool {
    pub fn new() -> Self {
        Self
    }
}

fn load_image(path: &Path) -> Result<DynamicImage, ProcessError> {
    Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?)
}

fn format_name(format: ImageFormat) -> String {
    format!("{:?}", format).to_uppercase()
}

impl PictureTool for BuiltinTool {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn identify(&self, path: &Path) -> Result<PictureInfo, ProcessError> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader
            .format()
            .ok_or_else(|| ProcessError::Parse(format!("unknown format: {}", path.display())))?;
        let (width, height) = reader.into_dimensions()?;

        Ok(PictureInfo {
            width,
            height,
            format: format_name(format),
        })
    }

    fn thumbnail(&self, src: &Path, dest: &Path, max_side: u32) -> Result<(), ProcessError> {
        let img = load_image(src)?;
        let thumbnail = img.thumbnail(max_side, max_side).to_rgb8();

        write_atomically(dest, |tmp| {
            thumbnail.save_with_format(tmp, ImageFormat::Jpeg)?;
            Ok(())
        })
    }
}
