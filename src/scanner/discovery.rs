use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every non-directory entry below `directory`, depth first, siblings sorted
/// by file name. Symbolic links are reported, not followed.
///
/// `max_depth` counts the directory's own entries as depth 1.
pub fn discover_files(
    directory: &Path,
    max_depth: Option<usize>,
) -> Result<Vec<PathBuf>, walkdir::Error> {
    let mut walker = WalkDir::new(directory)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}
