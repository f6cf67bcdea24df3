//! Cached project → folder → file snapshot and the lookups run against it.
//!
//! The snapshot is whatever the last login/reload returned.  Nothing here
//! touches the network; callers decide when the cache is too stale to trust.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access flag that allows uploading into a folder.
pub const WRITE_ACCESS: &str = "write";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryTree {
    pub projects: Vec<ProjectNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectNode {
    pub name: String,
    pub folders: Vec<FolderNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderNode {
    pub id: String,
    pub name: String,
    /// Comma-separated access flags, e.g. `read,write`.
    pub access: String,
    /// Download limit as sent by the server.
    pub limit: String,
    pub files: Vec<FileNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Opaque download / delete handle.
    pub key: String,
    pub name: String,
    pub owner: String,
    /// Decimal byte count, as sent.
    pub size: String,
    /// Epoch seconds, as sent.
    pub timestamp: String,
    pub drm: bool,
    pub previewable: bool,
}

impl FolderNode {
    pub fn is_writable(&self) -> bool {
        self.access.contains(WRITE_ACCESS)
    }

    pub fn file(&self, name: &str) -> Option<&FileNode> {
        self.files.iter().find(|f| f.name == name)
    }
}

impl FileNode {
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.trim().parse().ok()
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        let secs: i64 = self.timestamp.trim().parse().ok()?;
        DateTime::from_timestamp(secs, 0)
    }
}

/// Split `"Project/Folder"` on the first `/`.
///
/// A path without a separator is a folder with an empty project name.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((project, folder)) => (project, folder),
        None => ("", path),
    }
}

impl DirectoryTree {
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Every folder addressed by `path`, in server order.
    fn folders_at<'a: 'p, 'p>(
        &'a self,
        path: &'p str,
    ) -> impl Iterator<Item = &'a FolderNode> + 'p {
        let (project, folder) = split_path(path);
        self.projects
            .iter()
            .filter(move |p| p.name == project)
            .flat_map(|p| p.folders.iter())
            .filter(move |d| d.name == folder)
    }

    /// First folder addressed by `path`; `None` stands for "not found".
    pub fn find_folder(&self, path: &str) -> Option<&FolderNode> {
        self.folders_at(path).next()
    }

    /// Key of `name` inside `project`/`folder`.
    pub fn find_file(&self, project: &str, folder: &str, name: &str) -> Option<&str> {
        self.projects
            .iter()
            .filter(|p| p.name == project)
            .flat_map(|p| p.folders.iter())
            .filter(|d| d.name == folder)
            .find_map(|d| d.file(name))
            .map(|f| f.key.as_str())
    }

    /// Advisory upload check: a same-named file anywhere under `path` vetoes,
    /// otherwise at least one matching folder must grant write access.
    pub fn can_upload(&self, path: &str, name: &str) -> bool {
        let mut writable = false;
        for folder in self.folders_at(path) {
            if folder.file(name).is_some() {
                return false;
            }
            writable |= folder.is_writable();
        }
        writable
    }

    pub fn folder_count(&self) -> usize {
        self.projects.iter().map(|p| p.folders.len()).sum()
    }
}
