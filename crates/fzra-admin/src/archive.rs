//! Directory → zip packing for endpoints that only take a single file.
//!
//! The archive lives in a private scratch directory and is deleted when the
//! [`TempArchive`] is dropped or [`TempArchive::remove`]d.

use fzra_core::{FzError, FzResult};
use log::{debug, info, warn};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const SCRATCH_PREFIX: &str = "fztmp";

/// A zipped directory on disk.
#[derive(Debug)]
pub struct TempArchive {
    scratch: tempfile::TempDir,
    path: PathBuf,
    name: String,
    len: u64,
}

impl TempArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<directory name>.zip`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete the archive now, logging rather than failing.
    pub fn remove(self) {
        let shown = self.path.display().to_string();
        match self.scratch.close() {
            Ok(()) => debug!("removed temp archive {}", shown),
            Err(e) => warn!("could not remove temp archive {}: {}", shown, e),
        }
    }
}

/// Upload name for `dir` once zipped.
pub fn archive_name(dir: &Path) -> String {
    format!("{}.zip", base_name(dir))
}

fn base_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "archive".to_string())
}

/// Zip `dir` recursively into a fresh scratch directory under `scratch_root`.
///
/// Entries are rooted at the directory's own name, so `photos/a.jpg` unpacks
/// into `photos/`.
pub async fn zip_dir(dir: &Path, scratch_root: &Path) -> FzResult<TempArchive> {
    let dir = dir.to_path_buf();
    let scratch_root = scratch_root.to_path_buf();
    tokio::task::spawn_blocking(move || zip_dir_blocking(&dir, &scratch_root))
        .await
        .map_err(|e| FzError::io(format!("zip: worker failed: {}", e)))?
}

fn zip_dir_blocking(dir: &Path, scratch_root: &Path) -> FzResult<TempArchive> {
    let root = base_name(dir);
    let name = format!("{}.zip", root);
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(scratch_root)
        .map_err(|e| io_err(scratch_root, e))?;
    let path = scratch.path().join(&name);
    info!("zipping {} into {}", dir.display(), path.display());

    let file = File::create(&path).map_err(|e| io_err(&path, e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| FzError::io(format!("zip: {}: {}", dir.display(), e)))?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let entry_name = Path::new(&root)
            .join(rel)
            .to_string_lossy()
            .replace('\\', "/");
        let kind = entry.file_type();
        if kind.is_dir() {
            writer
                .add_directory(format!("{}/", entry_name), options)
                .map_err(zip_err)?;
        } else if kind.is_file() {
            let mut source = File::open(entry.path()).map_err(|e| io_err(entry.path(), e))?;
            writer.start_file(entry_name, options).map_err(zip_err)?;
            io::copy(&mut source, &mut writer).map_err(|e| io_err(entry.path(), e))?;
        } else {
            debug!("zip: skipping {}", entry.path().display());
        }
    }
    writer.finish().map_err(zip_err)?;

    let len = std::fs::metadata(&path).map_err(|e| io_err(&path, e))?.len();
    Ok(TempArchive {
        scratch,
        path,
        name,
        len,
    })
}

fn io_err(path: &Path, e: io::Error) -> FzError {
    FzError::io(format!("zip: {}: {}", path.display(), e))
}

fn zip_err(e: zip::result::ZipError) -> FzError {
    FzError::io(format!("zip: {}", e))
}
