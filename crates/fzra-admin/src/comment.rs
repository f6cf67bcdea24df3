//! Default upload comment: where a file came from, how big it is and its digest.

use log::debug;
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_BUF: usize = 64 * 1024;

/// Describe `path` as
///
/// ```text
/// OrgPath: /data/q3.zip
/// Size: 1048576
/// SHA1: 3f786850e387...
/// ```
///
/// An unreadable path gives an empty string. A file that can be stat'ed but
/// not read stops after the `Size` line.
pub async fn file_comment(path: &Path) -> String {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) => {
            debug!("no comment for {}: {}", path.display(), e);
            return String::new();
        }
    };

    let mut out = format!("OrgPath: {}\nSize: {}\n", path.display(), meta.len());
    match sha1_file(path).await {
        Ok(digest) => out.push_str(&format!("SHA1: {}\n", digest)),
        Err(e) => debug!("digest of {} skipped: {}", path.display(), e),
    }
    out
}

async fn sha1_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
