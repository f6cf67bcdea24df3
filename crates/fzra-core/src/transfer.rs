//! Uploads (single-shot or chunked + commit), downloads and deletes.
//!
//! Every call here takes the current `SessionToken` explicitly and returns
//! the envelope it got back; rotating the token is the caller's job (see
//! `Session`).  Chunk requests and raw download bodies carry no envelope and
//! therefore never rotate anything.

use crate::envelope::{read_envelope, Envelope};
use crate::error::{FzError, FzResult};
use crate::session::{require_token, SessionToken};
use crate::transport::{file_part, write_body_to_file, FormFields, FzTransport, CGI_PATH};
use crate::types::{TransferRequest, UploadProgress};
use log::{debug, info};
use rand::Rng;
use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Upper bound (exclusive) of the shared transfer token.
const TRANSFER_TOKEN_MAX: u32 = 999_999_999;

// ═══════════════════════════════════════════════════════════════════════
//  Notification field encoding
// ═══════════════════════════════════════════════════════════════════════

/// `mail_send` form value derived from the notify-to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailSend {
    /// Empty list.
    Nobody,
    /// List contains `ALL`.
    All,
    /// Any other non-empty list.
    Selected,
}

impl MailSend {
    pub fn parse(value: &str) -> Self {
        if value.contains("ALL") {
            MailSend::All
        } else if value.is_empty() {
            MailSend::Nobody
        } else {
            MailSend::Selected
        }
    }

    pub fn as_field(self) -> &'static str {
        match self {
            MailSend::Nobody => "0",
            MailSend::All => "1",
            MailSend::Selected => "2",
        }
    }

    pub fn from_field(v: &str) -> Option<Self> {
        match v {
            "0" => Some(MailSend::Nobody),
            "1" => Some(MailSend::All),
            "2" => Some(MailSend::Selected),
            _ => None,
        }
    }
}

/// Which file events trigger a notification mail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEvents {
    pub download: bool,
    pub alter: bool,
    pub delete: bool,
}

impl NotifyEvents {
    pub fn parse(value: &str) -> Self {
        Self {
            download: value.contains("DOWNLOAD"),
            alter: value.contains("ALTER"),
            delete: value.contains("DELETE"),
        }
    }

    fn write_fields(self, fields: &mut FormFields) {
        fields
            .set("notify_download", bit(self.download))
            .set("notify_alter", bit(self.alter))
            .set("notify_delete", bit(self.delete));
    }
}

fn bit(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

/// Metadata fields shared by the single-shot request and the commit.
fn upload_metadata(req: &TransferRequest, fields: &mut FormFields) {
    fields
        .set("ST_current_folder", req.folder_id.as_str())
        .set("reg_filename", req.display_name.as_str())
        .set("description", req.comment.as_str())
        .set("key", "")
        .set("mail_send", MailSend::parse(&req.notify_to).as_field());
    NotifyEvents::parse(&req.notify_events).write_fields(fields);
    fields.set("new_alert", "1");
}

// ═══════════════════════════════════════════════════════════════════════
//  Strategy & chunk plan
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStrategy {
    SingleShot,
    Chunked,
}

impl UploadStrategy {
    pub fn select(size: u64, chunk_size: u64) -> Self {
        if size <= chunk_size {
            UploadStrategy::SingleShot
        } else {
            UploadStrategy::Chunked
        }
    }
}

/// One chunk's place in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// 1-based.
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

/// Layout of one chunked upload.  Lives only for the call that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Shared by every chunk and the commit; never reused.
    pub transfer_token: String,
    pub chunk_size: u64,
    pub total_size: u64,
    pub chunks: u64,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let token = rand::thread_rng().gen_range(0..TRANSFER_TOKEN_MAX);
        Self::with_token(&token.to_string(), total_size, chunk_size)
    }

    pub fn with_token(token: &str, total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            transfer_token: token.to_string(),
            chunk_size,
            total_size,
            chunks: total_size.div_ceil(chunk_size),
        }
    }

    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.chunks).map(move |i| {
            let offset = i * self.chunk_size;
            ChunkRange {
                index: i + 1,
                offset,
                len: self.chunk_size.min(self.total_size - offset),
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Outcomes
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub strategy: UploadStrategy,
    /// Requests that carried file bytes.
    pub data_requests: u64,
    /// Set for chunked uploads.
    pub transfer_token: Option<String>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub bytes: u64,
}

/// Upload progression.  `Committed` and `Failed` are terminal.
#[derive(Debug)]
enum UploadState {
    Selecting,
    SingleShot,
    Chunking(ChunkPlan),
    Committing(ChunkPlan),
    Committed(UploadOutcome),
    Failed(FzError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════

/// Transfer operations over a borrowed transport.
pub struct Transfers<'a> {
    transport: &'a FzTransport,
    chunk_size: u64,
}

impl<'a> Transfers<'a> {
    pub fn new(transport: &'a FzTransport, chunk_size: u64) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
        }
    }

    // ─── Upload ─────────────────────────────────────────────────────

    /// Upload `req.local_path`, picking the strategy by size.
    ///
    /// A failure at any step fails the whole call; chunks already sent
    /// are orphaned under a token nobody will commit.
    pub async fn upload(
        &self,
        token: &SessionToken,
        req: &TransferRequest,
        mut on_progress: impl FnMut(&UploadProgress),
    ) -> FzResult<UploadOutcome> {
        require_token(token)?;
        let meta = tokio::fs::metadata(&req.local_path)
            .await
            .map_err(|e| FzError::io(format!("{}: {}", req.local_path.display(), e)))?;
        if !meta.is_file() {
            return Err(FzError::invalid(format!(
                "{} is not a regular file",
                req.local_path.display()
            )));
        }
        let size = meta.len();
        let file_name = req.file_name();

        let mut state = UploadState::Selecting;
        loop {
            debug!("upload {}: {:?}", file_name, StateName(&state));
            state = match state {
                UploadState::Selecting => match UploadStrategy::select(size, self.chunk_size) {
                    UploadStrategy::SingleShot => UploadState::SingleShot,
                    UploadStrategy::Chunked => {
                        UploadState::Chunking(ChunkPlan::new(size, self.chunk_size))
                    }
                },
                UploadState::SingleShot => match self.send_single_shot(token, req).await {
                    Ok(envelope) => {
                        on_progress(&UploadProgress {
                            file_name: file_name.clone(),
                            total_bytes: size,
                            bytes_sent: size,
                            chunk: 1,
                            chunks: 1,
                        });
                        UploadState::Committed(UploadOutcome {
                            strategy: UploadStrategy::SingleShot,
                            data_requests: 1,
                            transfer_token: None,
                            envelope,
                        })
                    }
                    Err(e) => UploadState::Failed(e),
                },
                UploadState::Chunking(plan) => {
                    match self.send_chunks(token, req, &plan, &mut on_progress).await {
                        Ok(()) => UploadState::Committing(plan),
                        Err(e) => UploadState::Failed(e),
                    }
                }
                UploadState::Committing(plan) => match self.commit(token, req, &plan).await {
                    Ok(envelope) => UploadState::Committed(UploadOutcome {
                        strategy: UploadStrategy::Chunked,
                        data_requests: plan.chunks,
                        transfer_token: Some(plan.transfer_token),
                        envelope,
                    }),
                    Err(e) => UploadState::Failed(e),
                },
                UploadState::Committed(outcome) => {
                    info!(
                        "uploaded {} ({} bytes, {:?}, {} data request(s))",
                        file_name, size, outcome.strategy, outcome.data_requests
                    );
                    return Ok(outcome);
                }
                UploadState::Failed(e) => return Err(e),
            };
        }
    }

    async fn send_single_shot(
        &self,
        token: &SessionToken,
        req: &TransferRequest,
    ) -> FzResult<Envelope> {
        let data = tokio::fs::read(&req.local_path)
            .await
            .map_err(|e| FzError::io(format!("{}: {}", req.local_path.display(), e)))?;

        let mut fields = FormFields::new()
            .with("action", "Mainmenu_upload")
            .with("sub_action", "do_upload")
            .with("respmode", "xml")
            .with("valid_key", token.valid_key());
        upload_metadata(req, &mut fields);

        let form = Form::new().part("filename", file_part(data, &req.file_name())?);
        let resp = self
            .transport
            .post_multipart(CGI_PATH, Some(token), fields.into_multipart(form))
            .await?;
        read_envelope(resp).await?.ensure_ok()
    }

    async fn send_chunks(
        &self,
        token: &SessionToken,
        req: &TransferRequest,
        plan: &ChunkPlan,
        on_progress: &mut impl FnMut(&UploadProgress),
    ) -> FzResult<()> {
        let mut file = tokio::fs::File::open(&req.local_path)
            .await
            .map_err(|e| FzError::io(format!("{}: {}", req.local_path.display(), e)))?;
        let part_name = format!("{}{}.tmp", plan.transfer_token, req.folder_id);
        let upload_key = format!("{}{}", token.session_id(), req.folder_id);

        for range in plan.ranges() {
            let mut buf = vec![0u8; range.len as usize];
            file.read_exact(&mut buf).await.map_err(|e| {
                FzError::io(format!(
                    "{}: reading chunk {}/{}: {}",
                    req.local_path.display(),
                    range.index,
                    plan.chunks,
                    e
                ))
            })?;

            let fields = FormFields::new()
                .with("fr", plan.transfer_token.as_str())
                .with("valid_key", token.valid_key())
                .with("action", "Mainmenu_upload")
                .with("sub_action", "plupload")
                .with("ukey", upload_key.as_str())
                .with("mode", "PRJ")
                .with("chunk", range.index.to_string())
                .with("chunks", plan.chunks.to_string());
            let form = Form::new().part("file", file_part(buf, &part_name)?);

            let resp = self
                .transport
                .post_multipart(CGI_PATH, Some(token), fields.into_multipart(form))
                .await
                .map_err(|e| e.context(&format!("chunk {}/{}", range.index, plan.chunks)))?;
            resp.bytes().await?;

            debug!("chunk {}/{} sent ({} bytes)", range.index, plan.chunks, range.len);
            on_progress(&UploadProgress {
                file_name: req.file_name(),
                total_bytes: plan.total_size,
                bytes_sent: range.offset + range.len,
                chunk: range.index,
                chunks: plan.chunks,
            });
        }
        Ok(())
    }

    async fn commit(
        &self,
        token: &SessionToken,
        req: &TransferRequest,
        plan: &ChunkPlan,
    ) -> FzResult<Envelope> {
        let mut fields = FormFields::new()
            .with("respmode", "xml")
            .with("action", "Mainmenu_upload")
            .with("sub_action", "do_upload")
            .with("valid_key", token.valid_key())
            .with("filename", req.file_name());
        upload_metadata(req, &mut fields);
        fields.set("fr", plan.transfer_token.as_str());

        let resp = self.transport.post_form(CGI_PATH, Some(token), &fields).await?;
        read_envelope(resp)
            .await?
            .ensure_ok()
            .map_err(|e| e.context("commit"))
    }

    // ─── Download ───────────────────────────────────────────────────

    /// Fetch the file behind `key` into `dest`.
    ///
    /// A response without a declared length is an envelope (typically an
    /// expired or deleted key) and `dest` is never created for it.
    pub async fn download(
        &self,
        token: &SessionToken,
        key: &str,
        dest: &Path,
    ) -> FzResult<DownloadOutcome> {
        require_token(token)?;
        let fields = FormFields::new()
            .with("respmode", "xml")
            .with("action", "Mainmenu_file")
            .with("sub_action", "download")
            .with("key", key)
            .with("valid_key", token.valid_key());
        let resp = self.transport.post_form(CGI_PATH, Some(token), &fields).await?;

        match resp.content_length() {
            None => {
                let env = read_envelope(resp).await?.ensure_ok()?;
                let mut err =
                    FzError::protocol("download answered with a success envelope instead of a file");
                err.valid_key = env.valid_key;
                Err(err)
            }
            Some(len) => {
                debug!("downloading {} ({} bytes) to {}", key, len, dest.display());
                let bytes = write_body_to_file(resp, dest).await?;
                if bytes != len {
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(FzError::transport(format!(
                        "download truncated: {} of {} bytes",
                        bytes, len
                    )));
                }
                Ok(DownloadOutcome { bytes })
            }
        }
    }

    // ─── Delete ─────────────────────────────────────────────────────

    pub async fn delete(&self, token: &SessionToken, key: &str) -> FzResult<Envelope> {
        require_token(token)?;
        let fields = FormFields::new()
            .with("respmode", "xml")
            .with("action", "Mainmenu_file")
            .with("sub_action", "delete_file")
            .with("key", key)
            .with("valid_key", token.valid_key());
        let resp = self.transport.post_form(CGI_PATH, Some(token), &fields).await?;
        read_envelope(resp).await?.ensure_ok()
    }
}

/// State label for logs, without dumping envelopes or errors.
struct StateName<'s>(&'s UploadState);

impl std::fmt::Debug for StateName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            UploadState::Selecting => write!(f, "Selecting"),
            UploadState::SingleShot => write!(f, "SingleShot"),
            UploadState::Chunking(p) => write!(f, "Chunking({} chunks)", p.chunks),
            UploadState::Committing(_) => write!(f, "Committing"),
            UploadState::Committed(_) => write!(f, "Committed"),
            UploadState::Failed(_) => write!(f, "Failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
