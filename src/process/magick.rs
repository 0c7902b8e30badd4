//! ImageMagick command-line tool.

use std::path::Path;
use std::process::{Command, Output};

use super::tool::{write_atomically, PictureInfo, PictureTool};
use crate::error::ProcessError;

/// Shells out to `identify` and `convert`, which must be on `PATH`.
#[derive(Debug, Clone)]
pub struct MagickTool {
    identify: String,
    convert: String,
}

impl Default for MagickTool {
    fn default() -> Self {
        Self {
            identify: "identify".to_string(),
            convert: "convert".to_string(),
        }
    }
}

impl MagickTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit program paths instead of the `PATH` lookup.
    pub fn with_programs(identify: impl Into<String>, convert: impl Into<String>) -> Self {
        Self {
            identify: identify.into(),
            convert: convert.into(),
        }
    }
}

fn run(program: &str, command: &mut Command) -> Result<Output, ProcessError> {
    let output = command.output().map_err(|source| ProcessError::Spawn {
        tool: program.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(ProcessError::Failed {
            tool: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

impl PictureTool for MagickTool {
    fn name(&self) -> &'static str {
        "magick"
    }

    fn identify(&self, path: &Path) -> Result<PictureInfo, ProcessError> {
        let output = run(
            &self.identify,
            Command::new(&self.identify).arg("-verbose").arg(path),
        )?;
        parse_identify_verbose(&String::from_utf8_lossy(&output.stdout))
    }

    fn thumbnail(&self, src: &Path, dest: &Path, max_side: u32) -> Result<(), ProcessError> {
        // Only the first frame of animations
        let mut input = src.as_os_str().to_os_string();
        input.push("[0]");
        let size = format!("{max_side}x{max_side}>");

        write_atomically(dest, |tmp| {
            let mut output = std::ffi::OsString::from("jpg:");
            output.push(tmp);
            run(
                &self.convert,
                Command::new(&self.convert)
                    .arg(&input)
                    .args(["-auto-orient", "-thumbnail", size.as_str()])
                    .arg(&output),
            )?;
            Ok(())
        })
    }
}

/// Extract dimensions and format from `identify -verbose` output. Only the
/// first image of a multi-frame file is considered.
pub fn parse_identify_verbose(output: &str) -> Result<PictureInfo, ProcessError> {
    let mut geometry = None;
    let mut format = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Geometry" if geometry.is_none() => geometry = Some(parse_geometry(value)?),
            "Format" if format.is_none() => {
                format = value.split_whitespace().next().map(str::to_uppercase);
            }
            _ => {}
        }
        if geometry.is_some() && format.is_some() {
            break;
        }
    }

    let (width, height) =
        geometry.ok_or_else(|| ProcessError::Parse("missing Geometry line".to_string()))?;
    let format = format.ok_or_else(|| ProcessError::Parse("missing Format line".to_string()))?;

    Ok(PictureInfo {
        width,
        height,
        format,
    })
}

/// `640x480+0+0` to `(640, 480)`.
fn parse_geometry(value: &str) -> Result<(u32, u32), ProcessError> {
    let size = value.split('+').next().unwrap_or(value);
    let malformed = || ProcessError::Parse(format!("malformed geometry {value:?}"));

    let (w, h) = size.split_once('x').ok_or_else(malformed)?;
    let width = w.trim().parse::<u32>().map_err(|_| malformed())?;
    let height = h.trim().parse::<u32>().map_err(|_| malformed())?;
    if width == 0 || height == 0 {
        return Err(malformed());
    }
    Ok((width, height))
}
