//! Two-way folder sync between a local directory and FileZen folders.
//!
//! Files in the remote download folder that are missing under
//! `<local>/Download` are fetched; files in `<local>/Upload` that the upload
//! folder accepts are sent with a generated comment; a directory there goes
//! up as `<name>.zip`.  Existing local files are never overwritten and remote
//! name collisions are never replaced.  A failed transfer is followed by a
//! best-effort reload and the pass moves on.

use crate::archive::{archive_name, zip_dir};
use crate::comment::file_comment;
use fzra_core::{FzError, FzResult, Session, TransferRequest};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

const DOWNLOAD_DIR: &str = "Download";
const UPLOAD_DIR: &str = "Upload";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub local_folder: PathBuf,
    /// `Project/Folder` to pull from; empty skips the download pass.
    pub down_folder: String,
    /// `Project/Folder` to push to; empty skips the upload pass.
    pub up_folder: String,
    pub notify_to: String,
    pub notify_events: String,
}

impl SyncConfig {
    pub fn from_json_file(path: &Path) -> FzResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FzError::io(format!("read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// What one sync run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: Vec<String>,
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
    /// Local copies whose size differs from the server's.
    pub size_mismatch: Vec<String>,
    /// Upload candidates that could not be stat'ed or packed.
    pub skipped: Vec<String>,
    /// Recovery reloads that themselves failed.
    pub reload_failures: usize,
}

pub async fn sync_folder(session: &mut Session, cfg: &SyncConfig) -> FzResult<SyncReport> {
    if cfg.down_folder.is_empty() && cfg.up_folder.is_empty() {
        return Err(FzError::invalid("sync: no FileZen folder to sync"));
    }
    if cfg.local_folder.as_os_str().is_empty() {
        return Err(FzError::invalid("sync: no local folder"));
    }
    let down_dir = cfg.local_folder.join(DOWNLOAD_DIR);
    let up_dir = cfg.local_folder.join(UPLOAD_DIR);
    for dir in [&down_dir, &up_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| FzError::io(format!("sync: {}: {}", dir.display(), e)))?;
    }

    info!("sync start: {}", cfg.local_folder.display());
    let mut report = SyncReport::default();
    if !cfg.down_folder.is_empty() {
        pull(session, &cfg.down_folder, &down_dir, &mut report).await?;
    }
    if !cfg.up_folder.is_empty() {
        push(session, cfg, &up_dir, &mut report).await?;
    }
    info!(
        "sync done: {} down, {} up, {} failed",
        report.downloaded.len(),
        report.uploaded.len(),
        report.failed.len()
    );
    Ok(report)
}

async fn pull(
    session: &mut Session,
    folder: &str,
    down_dir: &Path,
    report: &mut SyncReport,
) -> FzResult<()> {
    let files = session
        .find_folder(folder)
        .ok_or_else(|| FzError::invalid(format!("sync: download folder not found: {}", folder)))?
        .files
        .clone();

    for f in files.iter().filter(|f| !f.key.is_empty()) {
        let local = down_dir.join(&f.name);
        if let Ok(meta) = tokio::fs::metadata(&local).await {
            if Some(meta.len()) != f.size_bytes() {
                warn!("size mismatch for {}", f.name);
                report.size_mismatch.push(f.name.clone());
            }
            continue;
        }
        let started = Instant::now();
        match session.download(&f.key, &local).await {
            Ok(outcome) => {
                info!("downloaded {} ({})", f.name, speed(outcome.bytes, started));
                report.downloaded.push(f.name.clone());
            }
            Err(e) => {
                warn!("download of {} failed: {}", f.name, e);
                report.failed.push(f.name.clone());
                recover(session, report).await;
            }
        }
    }
    Ok(())
}

async fn push(
    session: &mut Session,
    cfg: &SyncConfig,
    up_dir: &Path,
    report: &mut SyncReport,
) -> FzResult<()> {
    let folder = &cfg.up_folder;
    if session.find_folder(folder).is_none() {
        return Err(FzError::invalid(format!("sync: upload folder not found: {}", folder)));
    }
    if !session.can_upload(folder, "") {
        return Err(FzError::invalid(format!("sync: no write permission on {}", folder)));
    }

    let mut entries = tokio::fs::read_dir(up_dir)
        .await
        .map_err(|e| FzError::io(format!("sync: {}: {}", up_dir.display(), e)))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();

    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() || m.is_dir() => m,
            Ok(_) => {
                report.skipped.push(name);
                continue;
            }
            Err(e) => {
                warn!("upload skipped, cannot stat {}: {}", path.display(), e);
                report.skipped.push(name);
                continue;
            }
        };
        let upload_name = if meta.is_dir() {
            archive_name(&path)
        } else {
            name
        };
        if !session.can_upload(folder, &upload_name) {
            continue;
        }
        let Some(folder_id) = session.find_folder(folder).map(|f| f.id.clone()) else {
            break;
        };

        let archive = if meta.is_dir() {
            match zip_dir(&path, &cfg.local_folder).await {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("upload skipped, cannot zip {}: {}", path.display(), e);
                    report.skipped.push(upload_name);
                    continue;
                }
            }
        } else {
            None
        };
        let (source, size) = match &archive {
            Some(a) => (a.path().to_path_buf(), a.len()),
            None => (path.clone(), meta.len()),
        };

        let req = TransferRequest::new(&source, &folder_id)
            .with_display_name(&upload_name)
            .with_comment(&file_comment(&source).await)
            .with_notify(&cfg.notify_to, &cfg.notify_events);
        let started = Instant::now();
        match session.upload(&req).await {
            Ok(_) => {
                info!("uploaded {} ({})", upload_name, speed(size, started));
                report.uploaded.push(upload_name);
            }
            Err(e) => {
                warn!("upload of {} failed: {}", upload_name, e);
                report.failed.push(upload_name);
                recover(session, report).await;
            }
        }
        if let Some(archive) = archive {
            archive.remove();
        }
    }
    Ok(())
}

/// Refresh after a failed transfer; a failure here only gets logged.
async fn recover(session: &mut Session, report: &mut SyncReport) {
    if let Err(e) = session.reload().await {
        warn!("reload after failed transfer also failed: {}", e);
        report.reload_failures += 1;
    }
}

fn speed(bytes: u64, started: Instant) -> String {
    let secs = started.elapsed().as_secs_f64();
    if secs <= 0.0 {
        return "-".to_string();
    }
    format!("{:.3}KiB/s", bytes as f64 / (1024.0 * secs))
}
