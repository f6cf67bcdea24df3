// ──────────────────────────────────────────────────────────────────────────────
// fzra-core · envelope
// ──────────────────────────────────────────────────────────────────────────────
// Decoder for the XML status document returned by `respmode=xml` requests:
//  • `Lastop/Res` discriminator, "OK" is the only success value
//  • optional project → folder → file snapshot
//  • rotated anti-forgery token (`ValidKey`) and server metadata
// Raw-body answers (downloads, CSV) never come through here.
// ──────────────────────────────────────────────────────────────────────────────

use crate::error::{FzError, FzResult};
use crate::transport::SESSION_COOKIE;
use crate::tree::{DirectoryTree, FileNode, FolderNode, ProjectNode};
use crate::types::ServerInfo;
use log::debug;
use reqwest::Response;
use serde::Deserialize;

/// The discriminator value that means success.
pub const SUCCESS_SENTINEL: &str = "OK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeStatus {
    Ok,
    /// Server's failure message, verbatim (may be empty).
    Failed(String),
}

impl EnvelopeStatus {
    /// Exact, case-sensitive match; padded values are failures.
    fn from_res(res: Option<String>) -> Self {
        match res {
            Some(res) if res == SUCCESS_SENTINEL => Self::Ok,
            Some(res) => Self::Failed(res),
            None => Self::Failed(String::new()),
        }
    }
}

/// A decoded status envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    pub tree: Option<DirectoryTree>,
    pub valid_key: Option<String>,
    /// `SessionID` cookie set on the response carrying this envelope.
    pub session_id: Option<String>,
    pub server: ServerInfo,
}

impl Envelope {
    pub fn parse(xml: &str) -> FzResult<Self> {
        let body = xml.trim_start_matches('\u{feff}').trim_start();
        if !body.starts_with('<') {
            return Err(FzError::parse("response body is not an XML envelope"));
        }
        let raw: RawEnvelope = quick_xml::de::from_str(body)?;

        let status = EnvelopeStatus::from_res(raw.lastop.and_then(|l| l.res));

        Ok(Self {
            status,
            tree: raw.project_list.map(RawProjectList::into_tree),
            valid_key: non_empty(raw.valid_key),
            session_id: None,
            server: ServerInfo {
                system_mail_addr: non_empty(raw.system_mail_addr),
                user_mail_addr: non_empty(raw.user_mail_addr),
                version: non_empty(raw.version),
            },
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == EnvelopeStatus::Ok
    }

    /// Turn a failure discriminator into an `Envelope` error.
    pub fn ensure_ok(self) -> FzResult<Self> {
        match self.status {
            EnvelopeStatus::Ok => Ok(self),
            EnvelopeStatus::Failed(ref msg) => Err(FzError::envelope(msg, self.valid_key.clone())),
        }
    }
}

/// Read a response body as an envelope, keeping any `SessionID` cookie it set.
///
/// The discriminator is not checked; call [`Envelope::ensure_ok`].
pub async fn read_envelope(resp: Response) -> FzResult<Envelope> {
    let session_id = resp
        .cookies()
        .find(|c| c.name() == SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());
    let text = resp.text().await?;
    let mut env = Envelope::parse(&text).map_err(|e| {
        debug!("undecodable envelope ({} bytes)", text.len());
        e
    })?;
    env.session_id = session_id;
    Ok(env)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// ── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "Lastop", default)]
    lastop: Option<RawLastop>,
    #[serde(rename = "ProjectList", default)]
    project_list: Option<RawProjectList>,
    #[serde(rename = "SystemMailAddr", default)]
    system_mail_addr: Option<String>,
    #[serde(rename = "UserMailAddr", default)]
    user_mail_addr: Option<String>,
    #[serde(rename = "ValidKey", default)]
    valid_key: Option<String>,
    #[serde(rename = "Version", default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLastop {
    #[serde(rename = "Res", default)]
    res: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProjectList {
    #[serde(rename = "Project", default)]
    projects: Vec<RawProject>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    #[serde(rename = "@Name", default)]
    name: String,
    #[serde(rename = "Folder", default)]
    folders: Vec<RawFolder>,
}

#[derive(Debug, Deserialize)]
struct RawFolder {
    #[serde(rename = "@Name", default)]
    name: String,
    #[serde(rename = "@Access", default)]
    access: String,
    #[serde(rename = "@Id", default)]
    id: String,
    #[serde(rename = "@Limit", default)]
    limit: String,
    #[serde(rename = "File", default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "@DrmFlag", default)]
    drm_flag: String,
    #[serde(rename = "@Key", default)]
    key: String,
    #[serde(rename = "@Name", default)]
    name: String,
    #[serde(rename = "@Owner", default)]
    owner: String,
    #[serde(rename = "@PdfFlag", default)]
    pdf_flag: String,
    #[serde(rename = "@Size", default)]
    size: String,
    #[serde(rename = "@TimeStamp", default)]
    timestamp: String,
}

impl RawProjectList {
    fn into_tree(self) -> DirectoryTree {
        DirectoryTree {
            projects: self
                .projects
                .into_iter()
                .map(|p| ProjectNode {
                    name: p.name,
                    folders: p
                        .folders
                        .into_iter()
                        .map(|d| FolderNode {
                            id: d.id,
                            name: d.name,
                            access: d.access,
                            limit: d.limit,
                            files: d
                                .files
                                .into_iter()
                                .map(|f| FileNode {
                                    key: f.key,
                                    name: f.name,
                                    owner: f.owner,
                                    size: f.size,
                                    timestamp: f.timestamp,
                                    drm: flag(&f.drm_flag),
                                    previewable: flag(&f.pdf_flag),
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

fn flag(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "on")
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
