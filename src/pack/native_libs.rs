//! Staging of compressed native-library archives.
//!
//! Archives may carry native libraries as `libs.xzs` or `libs.zstd` blobs
//! anywhere in the tree. The optimizer needs them readable, so each blob is
//! decompressed into a scratch directory beside it. The scratch directories
//! must never leak into the repacked archive; [`StagedLibs`] removes them on
//! cleanup and again on drop as a failure backstop.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::core::config::{RunContext, EXTRACTED_LIBS_DIR};
use crate::pack::xz;

enum Payload {
    Xz,
    Zstd,
}

/// Handle over the staged scratch directories.
#[derive(Debug)]
pub struct StagedLibs {
    dirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

/// Finds every native-library blob under `root` and decompresses each into
/// `__extracted_libs__/lib_<n>.so` beside it, in path order. An empty
/// `libs.zstd` is a placeholder and is skipped.
pub fn stage(root: &Path, ctx: &mut RunContext) -> Result<StagedLibs> {
    let mut candidates = vec![];
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str() {
            Some("libs.xzs") => candidates.push((entry.into_path(), Payload::Xz)),
            Some("libs.zstd") => {
                let path = entry.into_path();
                if fs::metadata(&path)?.len() > 0 {
                    candidates.push((path, Payload::Zstd));
                }
            }
            _ => {}
        }
    }

    let mut staged = StagedLibs {
        dirs: vec![],
        files: vec![],
    };
    for (index, (path, payload)) in candidates.into_iter().enumerate() {
        let scratch = path
            .parent()
            .with_context(|| format!("`{}` has no parent directory", path.display()))?
            .join(EXTRACTED_LIBS_DIR);
        if !staged.dirs.contains(&scratch) {
            fs::create_dir_all(&scratch)
                .with_context(|| format!("Creating `{}`", scratch.display()))?;
            staged.dirs.push(scratch.clone());
        }
        let dest = scratch.join(format!("lib_{index}.so"));
        match payload {
            Payload::Xz => xz::decompress(&path, &dest, ctx)
                .with_context(|| format!("Staging `{}`", path.display()))?,
            Payload::Zstd => {
                let mut input =
                    File::open(&path).with_context(|| format!("Opening `{}`", path.display()))?;
                let mut output = File::create(&dest)
                    .with_context(|| format!("Creating `{}`", dest.display()))?;
                zstd::stream::copy_decode(&mut input, &mut output)
                    .with_context(|| format!("Staging `{}`", path.display()))?;
            }
        }
        log::debug!(
            "Staged native libraries `{}` as `{}`",
            path.display(),
            dest.display()
        );
        staged.files.push(dest);
    }
    Ok(staged)
}

impl StagedLibs {
    /// Rebuilds a handle over scratch directories staged by an earlier
    /// process, so they can still be cleaned up before repacking.
    pub fn adopt(dirs: Vec<PathBuf>) -> Self {
        Self { dirs, files: vec![] }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Disarms the drop cleanup and hands the scratch directories to the
    /// caller, who becomes responsible for removing them.
    pub fn into_scratch_dirs(mut self) -> Vec<PathBuf> {
        self.files.clear();
        std::mem::take(&mut self.dirs)
    }

    /// Removes every scratch directory. Must run before repacking.
    pub fn cleanup(&mut self) -> Result<()> {
        self.files.clear();
        for dir in self.dirs.drain(..) {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Removing staged libraries at `{}`", dir.display()))?;
        }
        Ok(())
    }
}

impl Drop for StagedLibs {
    fn drop(&mut self) {
        for dir in self.dirs.drain(..) {
            if let Err(err) = fs::remove_dir_all(&dir) {
                log::warn!(
                    "Leaking staged native libraries at `{}`: {err}",
                    dir.display()
                );
            }
        }
    }
}
