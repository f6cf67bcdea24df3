use crate::error::{FzError, FzResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default client identification header value.
pub const DEFAULT_USER_AGENT: &str = "FileZenRA";

/// Single-shot / chunked threshold and chunk ceiling (50 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Secondary delivery payload cap (200 MiB).
pub const DEFAULT_DELIVERY_SIZE_LIMIT: u64 = 200 * 1024 * 1024;

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Connection settings for one FileZen server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FzConfig {
    /// Server base URL, e.g. `https://filezen.example.com`.
    pub url: String,
    /// Value sent as `User-Agent`.  Default: `FileZenRA`.
    pub user_agent: String,
    /// Per-request timeout in seconds, 0 disables it.  Default: 300.
    pub timeout_secs: u64,
    /// Skip server certificate validation.
    pub accept_invalid_certs: bool,
    /// Extra trust anchor (PEM).
    pub ca_cert_pem: Option<String>,
    /// Client certificate followed by its decrypted private key (PEM).
    #[serde(skip_serializing)]
    pub client_identity_pem: Option<String>,
    /// Files up to this size go in one request; larger ones are split into chunks of this size.
    pub chunk_size: u64,
    /// Largest payload accepted for secondary delivery.
    pub delivery_size_limit: u64,
}

impl Default for FzConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user_agent: DEFAULT_USER_AGENT.into(),
            timeout_secs: 300,
            accept_invalid_certs: false,
            ca_cert_pem: None,
            client_identity_pem: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            delivery_size_limit: DEFAULT_DELIVERY_SIZE_LIMIT,
        }
    }
}

impl FzConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Load settings from a JSON document on disk.
    pub fn from_json_file(path: &Path) -> FzResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FzError::io(format!("read {}: {}", path.display(), e)))?;
        let mut cfg: FzConfig = serde_json::from_str(&text)?;
        cfg.url = cfg.url.trim_end_matches('/').to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> FzResult<()> {
        if self.url.is_empty() {
            return Err(FzError::config("server URL is not set"));
        }
        let parsed = url::Url::parse(&self.url)?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(FzError::config(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }
        if self.chunk_size == 0 {
            return Err(FzError::config("chunk_size must be positive"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transfers
// ═══════════════════════════════════════════════════════════════════════

/// One upload call's input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferRequest {
    pub local_path: PathBuf,
    /// Destination folder identifier (`FolderNode::id`).
    pub folder_id: String,
    /// Name the server shows for the file.
    pub display_name: String,
    pub comment: String,
    /// `ALL`, empty, or a recipient list.
    pub notify_to: String,
    /// Any of `DOWNLOAD`, `ALTER`, `DELETE`.
    pub notify_events: String,
}

impl TransferRequest {
    pub fn new(local_path: impl Into<PathBuf>, folder_id: &str) -> Self {
        let local_path = local_path.into();
        let display_name = base_name(&local_path);
        Self {
            local_path,
            folder_id: folder_id.to_string(),
            display_name,
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = name.to_string();
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    pub fn with_notify(mut self, to: &str, events: &str) -> Self {
        self.notify_to = to.to_string();
        self.notify_events = events.to_string();
        self
    }

    /// Local base name, sent as the original filename.
    pub fn file_name(&self) -> String {
        base_name(&self.local_path)
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reported after every request of an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub file_name: String,
    pub total_bytes: u64,
    pub bytes_sent: u64,
    /// 1-based index of the request just completed.
    pub chunk: u64,
    pub chunks: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_sent as f64 / self.total_bytes as f64) * 100.0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Server metadata
// ═══════════════════════════════════════════════════════════════════════

/// Informational fields carried by envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub system_mail_addr: Option<String>,
    pub user_mail_addr: Option<String>,
    pub version: Option<String>,
}

impl ServerInfo {
    /// Keep known values when a later envelope omits them.
    pub fn merge(&mut self, newer: &ServerInfo) {
        if newer.system_mail_addr.is_some() {
            self.system_mail_addr = newer.system_mail_addr.clone();
        }
        if newer.user_mail_addr.is_some() {
            self.user_mail_addr = newer.user_mail_addr.clone();
        }
        if newer.version.is_some() {
            self.version = newer.version.clone();
        }
    }
}
