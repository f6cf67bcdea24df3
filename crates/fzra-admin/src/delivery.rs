//! Secondary delivery: a one-off, expiring, recipient-addressed file send
//! through the mail-delivery endpoint.
//!
//! Requests can be built directly or read from a small `key: value`
//! description file (see [`DeliveryRequest::from_conf_str`]).

use crate::archive::{zip_dir, TempArchive};
use chrono::{Datelike, NaiveDate};
use fzra_core::envelope::{read_envelope, Envelope};
use fzra_core::transport::{file_part, FormFields};
use fzra_core::{FzError, FzResult, Session};
use log::{debug, info};
use regex::Regex;
use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Submission endpoint, relative to the base URL.
pub const DELIVERY_PATH: &str = "/mb/cgi-bin/index.cgi/job/api_send/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

/// Parse `Name <user@host>` or a bare `user@host` (which doubles as the name).
pub fn parse_recipient(s: &str) -> Option<Recipient> {
    let named = Regex::new(r"\s*([^<]+)\s*<\s*([^ >@]+@[^ >@]+)\s*>").ok()?;
    if let Some(caps) = named.captures(s) {
        return Some(Recipient {
            name: caps[1].trim().to_string(),
            email: caps[2].to_string(),
        });
    }
    let bare = Regex::new(r"([^ @]+@[^ @]+)").ok()?;
    bare.captures(s).map(|caps| Recipient {
        name: caps[1].to_string(),
        email: caps[1].to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub subject: String,
    pub recipients: Vec<Recipient>,
    /// Sender address shown to recipients.
    pub from: String,
    pub file: PathBuf,
    /// First day the download is available.
    pub start: NaiveDate,
    /// Availability window in days.
    pub days: u32,
    pub download_limit: u32,
    /// Empty for no password.
    pub password: String,
    pub comment: String,
    pub notify_download: bool,
}

impl DeliveryRequest {
    /// Read a description file.
    ///
    /// ```text
    /// subject: Quarterly figures
    /// mailto: Bob <bob@example.com>
    /// mailto: carol@example.com
    /// from: alice@example.com
    /// file: /data/q3.zip
    /// start: 2026/10/01
    /// days: 7
    /// limit: 3
    /// notify: true
    /// comment: everything from here on is the message body
    /// second line of the body
    /// ```
    pub fn from_conf_str(text: &str) -> FzResult<Self> {
        let mut subject = String::new();
        let mut mailto: Vec<String> = Vec::new();
        let mut from = String::new();
        let mut file = String::new();
        let mut start = String::new();
        let mut days = String::new();
        let mut limit = String::new();
        let mut password = String::new();
        let mut notify = false;
        let mut comment: Option<String> = None;

        for line in text.lines() {
            if let Some(ref mut body) = comment {
                body.push_str(line);
                body.push('\n');
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().to_lowercase().as_str() {
                "comment" => comment = Some(format!("{}\n", value)),
                "mailto" => mailto.push(value),
                "subject" => subject = value,
                "from" => from = value,
                "file" => file = value,
                "start" => start = value,
                "days" => days = value,
                "limit" => limit = value,
                "password" => password = value,
                "notify" => notify = value == "true",
                other => debug!("ignoring delivery key {:?}", other),
            }
        }

        if from.is_empty() {
            return Err(FzError::invalid("delivery: no from address"));
        }
        let recipients: Vec<Recipient> = mailto
            .iter()
            .flat_map(|m| m.split(','))
            .filter_map(parse_recipient)
            .filter(|r| !r.name.is_empty())
            .collect();
        if recipients.is_empty() {
            return Err(FzError::invalid("delivery: no valid mailto recipient"));
        }
        if file.is_empty() {
            return Err(FzError::invalid("delivery: no file"));
        }
        let start = NaiveDate::parse_from_str(&start, "%Y/%m/%d")
            .map_err(|_| FzError::invalid(format!("delivery: invalid start date {:?}", start)))?;
        let days = days
            .parse()
            .map_err(|_| FzError::invalid(format!("delivery: invalid days {:?}", days)))?;
        let download_limit = limit
            .parse()
            .map_err(|_| FzError::invalid(format!("delivery: invalid limit {:?}", limit)))?;

        Ok(Self {
            subject,
            recipients,
            from,
            file: PathBuf::from(file),
            start,
            days,
            download_limit,
            password,
            comment: comment.unwrap_or_default(),
            notify_download: notify,
        })
    }

    pub fn from_conf_file(path: &Path) -> FzResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FzError::io(format!("{}: {}", path.display(), e)))?;
        Self::from_conf_str(&text)
    }

    fn fields(&self, valid_key: &str) -> FormFields {
        let mut f = FormFields::new()
            .with("subject", self.subject.as_str())
            .with("comment", self.comment.as_str())
            .with("exp_term_start_year", self.start.year().to_string())
            .with("exp_term_start_month", self.start.month().to_string())
            .with("exp_term_start_day", self.start.day().to_string())
            .with("exp_term_start_hour", "00")
            .with("exp_term_start_minute", "00")
            .with("exp_term_type", "by_dur")
            .with("exp_term_duration", self.days.to_string())
            .with("download_times", self.download_limit.to_string())
            .with("recipients-max-id", self.recipients.len().to_string());
        for (i, r) in self.recipients.iter().enumerate() {
            f.set(&format!("recipient-name-{}", i + 1), r.name.as_str());
            f.set(&format!("recipient-email-{}", i + 1), r.email.as_str());
        }
        f.set("from_addr", "user")
            .set("from_addr_val", self.from.as_str())
            .set("lang", "ambi")
            .set("password", self.password.as_str())
            .set("password_retype", self.password.as_str());
        for extra in ["file2", "file3", "file4", "file5"] {
            f.set(extra, "");
        }
        f.set("respmode", "xml")
            .set("valid_key", valid_key)
            .set("key", "")
            .set("notify_download", if self.notify_download { "1" } else { "0" })
            .set("new_alert", "1");
        f
    }
}

/// Delivery operations for one session.
pub struct MailDelivery<'a> {
    session: &'a mut Session,
}

impl<'a> MailDelivery<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    /// Send `req`.  A directory is zipped first and sent as `<name>.zip`;
    /// payloads over the configured cap are rejected before anything goes
    /// on the wire.
    pub async fn send(&mut self, req: &DeliveryRequest) -> FzResult<Envelope> {
        let meta = tokio::fs::metadata(&req.file)
            .await
            .map_err(|e| FzError::io(format!("delivery: {}: {}", req.file.display(), e)))?;
        let archive = if meta.is_dir() {
            Some(zip_dir(&req.file, &std::env::temp_dir()).await?)
        } else {
            None
        };
        let result = self.send_payload(req, archive.as_ref(), meta.len()).await;
        if let Some(archive) = archive {
            archive.remove();
        }
        result
    }

    async fn send_payload(
        &mut self,
        req: &DeliveryRequest,
        archive: Option<&TempArchive>,
        file_len: u64,
    ) -> FzResult<Envelope> {
        let (path, name, len) = match archive {
            Some(a) => (a.path(), a.name().to_string(), a.len()),
            None => (
                req.file.as_path(),
                req.file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                file_len,
            ),
        };
        let cap = self.session.config().delivery_size_limit;
        if len > cap {
            return Err(FzError::invalid(format!(
                "delivery: {} is {} bytes, over the {} byte limit",
                name, len, cap
            )));
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| FzError::io(format!("delivery: {}: {}", path.display(), e)))?;
        info!(
            "delivering {} ({} bytes) to {} recipient(s)",
            name,
            data.len(),
            req.recipients.len()
        );

        let result = async {
            let form = Form::new().part("file1", file_part(data, &name)?);
            let form = req
                .fields(self.session.token().valid_key())
                .into_multipart(form);
            let resp = self
                .session
                .transport()
                .post_multipart(DELIVERY_PATH, Some(self.session.token()), form)
                .await?;
            read_envelope(resp).await?.ensure_ok()
        }
        .await;
        self.session.absorb("delivery", result, true)
    }
}
