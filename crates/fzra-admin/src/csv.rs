// ──────────────────────────────────────────────────────────────────────────────
// fzra-admin · csv
// ──────────────────────────────────────────────────────────────────────────────
// Administrative CSV export / import:
//  • main endpoint: named form fields + `respmode=csv`, body streamed to disk;
//    imports are multipart and answer with an envelope
//  • mail-delivery endpoint: GET exports and multipart imports that signal
//    failure through a redirect or an HTML page, not an envelope
// Raw CSV answers carry no envelope, so they never rotate the token.
// ──────────────────────────────────────────────────────────────────────────────

use chrono::{Local, Months, NaiveDate};
use fzra_core::envelope::{read_envelope, Envelope};
use fzra_core::transport::{file_part, write_body_to_file, FormFields, CGI_PATH};
use fzra_core::{FzError, FzResult, Session};
use log::{debug, info, warn};
use reqwest::header;
use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Mail-delivery CGI root.
pub const MB_CGI_PATH: &str = "/mb/cgi-bin/index.cgi";

/// Mail-delivery history export endpoint.
pub const MB_HISTORY_PATH: &str = "/mb/cgi-bin/index.cgi/admin/history/";

/// Body text of the address-book import page when the file is malformed.
const MB_INVALID_ADDRBOOK: &str = "アドレス帳ファイルが正しくありません";

/// Body text of the address-book import page when the uid is unknown.
const MB_INVALID_UID: &str = "ユーザーIDの指定が正しくありません。";

const ACCEPT_LANGUAGE: (&str, &str) = ("Accept-Language", "ja,en");

// ═══════════════════════════════════════════════════════════════════════
//  Modes
// ═══════════════════════════════════════════════════════════════════════

fn unknown_mode(kind: &str, mode: &str) -> FzError {
    FzError::invalid(format!("unknown {} mode: {}", kind, mode))
}

/// What an admin export pulls from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminExport {
    /// Transfer history within a date range.
    FzLog,
    /// Mail-delivery history within a date range.
    MbLog,
    FzUser,
    FzUserCheck,
    FzUserPerm,
    FzProject,
    FzFolder,
}

impl FromStr for AdminExport {
    type Err = FzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "fzlog" => AdminExport::FzLog,
            "mblog" => AdminExport::MbLog,
            "fzuser" => AdminExport::FzUser,
            "fzuser_check" => AdminExport::FzUserCheck,
            "fzuser_perm" => AdminExport::FzUserPerm,
            "fzprj" => AdminExport::FzProject,
            "fzfolder" => AdminExport::FzFolder,
            other => return Err(unknown_mode("admin export", other)),
        })
    }
}

/// Inclusive date range for the history exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// `YYYY/MM/DD` strings; a missing or malformed start falls back to one
    /// month ago and a missing or malformed end to today.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Self {
        let today = Local::now().date_naive();
        let parse = |s: Option<&str>| s.and_then(|v| NaiveDate::parse_from_str(v, "%Y/%m/%d").ok());
        Self {
            start: parse(start).unwrap_or_else(|| {
                today
                    .checked_sub_months(Months::new(1))
                    .unwrap_or(today)
            }),
            end: parse(end).unwrap_or(today),
        }
    }
}

impl AdminExport {
    /// Form fields for this export.
    pub fn fields(self, range: DateRange) -> FormFields {
        let (s, e) = (range.start, range.end);
        let mut f = FormFields::new();
        match self {
            AdminExport::FzLog => {
                f.set("action", "History")
                    .set("sub_action", "do_export")
                    .set("start_year_selected", s.format("%Y").to_string())
                    .set("start_month_selected", s.format("%m").to_string())
                    .set("start_day_selected", s.format("%d").to_string())
                    .set("end_year_selected", e.format("%Y").to_string())
                    .set("end_month_selected", e.format("%m").to_string())
                    .set("end_day_selected", e.format("%d").to_string())
                    .set("folder_selected", "")
                    .set("search_text", "");
            }
            AdminExport::MbLog => {
                f.set("tm_type", "mtime")
                    .set("tm_s_y", s.format("%Y").to_string())
                    .set("tm_s_c", s.format("%m").to_string())
                    .set("tm_s_d", s.format("%d").to_string())
                    .set("tm_s_h", "00")
                    .set("tm_s_m", "00")
                    .set("tm_e_y", e.format("%Y").to_string())
                    .set("tm_e_c", e.format("%m").to_string())
                    .set("tm_e_d", e.format("%d").to_string())
                    .set("tm_e_h", "23")
                    .set("tm_e_m", "59")
                    .set("subj", "")
                    .set("ps", "");
                for ac in [
                    "ac_new",
                    "ac_accepted",
                    "ac_declined",
                    "ac_canceled",
                    "ac_download",
                    "ac_upload",
                    "ac_delete",
                ] {
                    f.set(ac, "1");
                }
                f.set("limit", "20000")
                    .set("csv", "csv")
                    .set("deleted_user", "0");
            }
            AdminExport::FzUser => {
                f.set("action", "User_export")
                    .set("sub_action", "do_export")
                    .set("passwd_mode", "enc");
            }
            AdminExport::FzUserCheck => {
                f.set("action", "User_export")
                    .set("sub_action", "do_export_uid")
                    .set("uid_export_mode", "check");
            }
            AdminExport::FzUserPerm => {
                f.set("action", "User_perm_export").set("sub_action", "do_export");
            }
            AdminExport::FzProject => {
                f.set("action", "Project_export").set("sub_action", "do_export");
            }
            AdminExport::FzFolder => {
                f.set("action", "Group_export").set("sub_action", "do_export");
            }
        }
        f
    }
}

/// What an admin import pushes to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminImport {
    FzUser,
    FzUserPerm,
    FzProject,
    FzFolder,
}

impl FromStr for AdminImport {
    type Err = FzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "fzuser" => AdminImport::FzUser,
            "fzuser_perm" => AdminImport::FzUserPerm,
            "fzprj" => AdminImport::FzProject,
            "fzfolder" => AdminImport::FzFolder,
            other => return Err(unknown_mode("admin import", other)),
        })
    }
}

impl AdminImport {
    pub fn fields(self) -> FormFields {
        let action = match self {
            AdminImport::FzUser => "User_import",
            AdminImport::FzUserPerm => "User_perm_import",
            AdminImport::FzProject => "Project_import",
            AdminImport::FzFolder => "Group_import",
        };
        let mut f = FormFields::new()
            .with("action", action)
            .with("sub_action", "do_upload");
        if self == AdminImport::FzUser {
            f.set("passwd_mode", "enc");
        }
        f
    }

    /// Multipart field that carries the CSV.
    pub fn file_key(self) -> &'static str {
        match self {
            AdminImport::FzUserPerm => "filename_user_perm",
            _ => "filename",
        }
    }
}

/// Mail-delivery exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MbExport {
    Authority,
    Global,
    AddressBook,
    /// Another user's address book (needs a uid).
    AdminAddressBook,
}

impl FromStr for MbExport {
    type Err = FzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "authority" => MbExport::Authority,
            "global" => MbExport::Global,
            "addrbook" => MbExport::AddressBook,
            "admin_addrbook" => MbExport::AdminAddressBook,
            other => return Err(unknown_mode("mail-delivery export", other)),
        })
    }
}

impl MbExport {
    /// Path below [`MB_CGI_PATH`].
    pub fn path(self, uid: &str) -> String {
        match self {
            MbExport::Authority => "/admin/approve/export/authority".to_string(),
            MbExport::Global => "/admin/approve/export/global/".to_string(),
            MbExport::AddressBook => "/job/addrbook/?action=export".to_string(),
            MbExport::AdminAddressBook => {
                format!("/admin/addrbook/?action=export&uid={}", uid)
            }
        }
    }
}

/// Mail-delivery imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MbImport {
    Authority,
    Global,
    AddressBook,
    AdminAddressBook,
    /// Like `AdminAddressBook`, but replaces instead of merging.
    AdminAddressBookReplace,
}

impl FromStr for MbImport {
    type Err = FzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "authority" => MbImport::Authority,
            "global" => MbImport::Global,
            "addrbook" => MbImport::AddressBook,
            "admin_addrbook" => MbImport::AdminAddressBook,
            "admin_addrbook_replace" => MbImport::AdminAddressBookReplace,
            other => return Err(unknown_mode("mail-delivery import", other)),
        })
    }
}

impl MbImport {
    pub fn path(self) -> &'static str {
        match self {
            MbImport::Authority => "/admin/approve/import/authority",
            MbImport::Global => "/admin/approve/import/global/",
            MbImport::AddressBook => "/job/addrbook/?action=import",
            MbImport::AdminAddressBook | MbImport::AdminAddressBookReplace => {
                "/admin/addrbook/?action=import"
            }
        }
    }

    pub fn file_key(self) -> &'static str {
        match self {
            MbImport::Authority | MbImport::Global => "file",
            _ => "addrbook_file",
        }
    }

    pub fn replace(self) -> bool {
        self == MbImport::AdminAddressBookReplace
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Operations
// ═══════════════════════════════════════════════════════════════════════

/// CSV operations for one session.
pub struct AdminCsv<'a> {
    session: &'a mut Session,
}

impl<'a> AdminCsv<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    // ─── Main endpoint ──────────────────────────────────────────────

    /// POST `fields` with `respmode=csv` and stream the answer to `dest`.
    pub async fn export_csv(&mut self, fields: FormFields, dest: &Path) -> FzResult<u64> {
        self.post_csv(CGI_PATH, fields, dest, "export").await
    }

    /// Upload `file` under `file_key` along with `fields`; answers with an envelope.
    pub async fn import_csv(
        &mut self,
        fields: FormFields,
        file: &Path,
        file_key: &str,
    ) -> FzResult<Envelope> {
        let result = async {
            let (data, name) = read_local(file).await?;
            let mut fields = fields;
            fields
                .set("respmode", "xml")
                .set("valid_key", self.session.token().valid_key());
            let form = fields.into_multipart(Form::new().part(file_key.to_string(), file_part(data, &name)?));
            let resp = self
                .session
                .transport()
                .post_multipart(CGI_PATH, Some(self.session.token()), form)
                .await?;
            read_envelope(resp).await?.ensure_ok()
        }
        .await;
        self.session.absorb("import", result, true)
    }

    pub async fn admin_export(
        &mut self,
        mode: AdminExport,
        range: DateRange,
        dest: &Path,
    ) -> FzResult<u64> {
        info!("admin export {:?} -> {}", mode, dest.display());
        let fields = mode.fields(range);
        match mode {
            AdminExport::MbLog => self.mb_log_export(fields, dest).await,
            _ => self.export_csv(fields, dest).await,
        }
    }

    pub async fn admin_import(&mut self, mode: AdminImport, file: &Path) -> FzResult<Envelope> {
        info!("admin import {:?} <- {}", mode, file.display());
        self.import_csv(mode.fields(), file, mode.file_key()).await
    }

    // ─── Mail-delivery endpoint ─────────────────────────────────────

    pub async fn mb_log_export(&mut self, fields: FormFields, dest: &Path) -> FzResult<u64> {
        self.post_csv(MB_HISTORY_PATH, fields, dest, "history export").await
    }

    /// GET `{MB_CGI_PATH}{path}` and stream the answer to `dest`.
    pub async fn mb_export_csv(&mut self, path: &str, dest: &Path) -> FzResult<u64> {
        let url_path = format!("{}{}", MB_CGI_PATH, path);
        let result = async {
            let resp = self
                .session
                .transport()
                .get(&url_path, Some(self.session.token()), &[ACCEPT_LANGUAGE])
                .await?;
            write_body_to_file(resp, dest).await
        }
        .await;
        result.map_err(|e| e.context("mail-delivery export"))
    }

    /// Multipart import whose failures show up as a redirect back to the
    /// import form or as a known sentence in the HTML answer.
    pub async fn mb_import_csv(
        &mut self,
        path: &str,
        uid: &str,
        file: &Path,
        file_key: &str,
        replace: bool,
    ) -> FzResult<()> {
        let url_path = format!("{}{}", MB_CGI_PATH, path);
        let result = async {
            let (data, name) = read_local(file).await?;
            let mut fields = FormFields::new().with("action", "import");
            if !uid.is_empty() {
                fields.set("uid", uid);
            }
            if replace {
                fields.set("replace", "yes");
            }
            let form = fields.into_multipart(Form::new().part(file_key.to_string(), file_part(data, &name)?));
            let resp = self
                .session
                .transport()
                .post_multipart_no_redirect(
                    &url_path,
                    Some(self.session.token()),
                    form,
                    &[ACCEPT_LANGUAGE],
                )
                .await?;

            let location = resp
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = resp.text().await?;
            check_mb_import_answer(&location, &body)
        }
        .await;
        result.map_err(|e| e.context("mail-delivery import"))
    }

    pub async fn mb_admin_export(&mut self, mode: MbExport, uid: &str, dest: &Path) -> FzResult<u64> {
        info!("mail-delivery export {:?} -> {}", mode, dest.display());
        self.mb_export_csv(&mode.path(uid), dest).await
    }

    pub async fn mb_admin_import(&mut self, mode: MbImport, uid: &str, file: &Path) -> FzResult<()> {
        info!("mail-delivery import {:?} <- {}", mode, file.display());
        self.mb_import_csv(mode.path(), uid, file, mode.file_key(), mode.replace())
            .await
    }

    // ─── Helpers ────────────────────────────────────────────────────

    async fn post_csv(
        &mut self,
        path: &str,
        mut fields: FormFields,
        dest: &Path,
        op: &str,
    ) -> FzResult<u64> {
        fields
            .set("respmode", "csv")
            .set("valid_key", self.session.token().valid_key());
        let result = async {
            let resp = self
                .session
                .transport()
                .post_form(path, Some(self.session.token()), &fields)
                .await?;
            write_body_to_file(resp, dest).await
        }
        .await;
        match result {
            Ok(n) => {
                debug!("{}: {} bytes written to {}", op, n, dest.display());
                Ok(n)
            }
            Err(e) => Err(e.context(op)),
        }
    }
}

/// Fallback failure detection for the mail-delivery import, run after the
/// transport status check.
pub fn check_mb_import_answer(location: &str, body: &str) -> FzResult<()> {
    if location.contains("/import") {
        warn!("import redirected back to {}", location);
        return Err(FzError::protocol(format!("redirected to {}", location)));
    }
    if body.contains(MB_INVALID_ADDRBOOK) {
        return Err(FzError::protocol("invalid address book format"));
    }
    if body.contains(MB_INVALID_UID) {
        return Err(FzError::protocol("invalid uid"));
    }
    Ok(())
}

async fn read_local(file: &Path) -> FzResult<(Vec<u8>, String)> {
    let data = tokio::fs::read(file)
        .await
        .map_err(|e| FzError::io(format!("{}: {}", file.display(), e)))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((data, name))
}
