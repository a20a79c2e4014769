// src/system/fsutil.rs

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// How an existing destination file is treated during a recursive copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Overwrite,
    SkipExisting,
}

/// Copies a file or directory tree.
pub fn copy_recursive(from: &Path, to: &Path, mode: CopyMode) -> Result<()> {
    if !from.is_dir() {
        if mode == CopyMode::SkipExisting && to.exists() {
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
        return Ok(());
    }

    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::Io {
            message: e.to_string(),
            trace: Box::new(std::backtrace::Backtrace::capture()),
        })?;

        let rel = entry
            .path()
            .strip_prefix(from)
            .unwrap_or_else(|_| entry.path());
        let dest = to.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if mode == CopyMode::SkipExisting && dest.exists() {
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_trees_and_respects_skip_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "one").unwrap();
        fs::write(src.join("nested/b.txt"), "two").unwrap();

        let dst = dir.path().join("dst");
        copy_recursive(&src, &dst, CopyMode::Overwrite).unwrap();
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt")).unwrap(), "two");

        fs::write(src.join("a.txt"), "changed").unwrap();
        copy_recursive(&src, &dst, CopyMode::SkipExisting).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "one");

        copy_recursive(&src, &dst, CopyMode::Overwrite).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "changed");
    }

    #[test]
    fn copies_single_files_creating_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("one.bin");
        fs::write(&src, "data").unwrap();

        let dst = dir.path().join("deep/nested/one.bin");
        copy_recursive(&src, &dst, CopyMode::Overwrite).unwrap();
        assert_eq!(fs::read_to_string(dst).unwrap(), "data");
    }
}
