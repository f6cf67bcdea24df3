//! In-process FileZen stand-in covering the administrative surfaces:
//! the main CGI (login, tree, download, single-shot upload, CSV modes) and
//! the mail-delivery CGI (delivery, history export, address-book import).

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, Method, Response, StatusCode};
use fzra_core::FzConfig;
use std::sync::{Arc, Mutex};

pub const SESSION_ID: &str = "sess-admin";
pub const USER: &str = "admin";
pub const PASSWORD: &str = "root-pw";

pub const USERS_CSV: &str = "uid,name,mail\nalice,Alice,alice@example.com\nbob,Bob,bob@example.com\n";
pub const HISTORY_CSV: &str = "date,subject,from\n2026/10/01,Q3,alice@example.com\n";
pub const AUTHORITY_CSV: &str = "uid,approver\nalice,bob\n";

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: String,
    pub multipart: bool,
    pub fields: Vec<(String, String)>,
    /// `(field, file name, contents)` of the uploaded part.
    pub file: Option<(String, String, Vec<u8>)>,
    pub cookie: Option<String>,
    pub accept_language: Option<String>,
}

impl Recorded {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is(&self, action: &str, sub_action: &str) -> bool {
        self.field("action") == Some(action) && self.field("sub_action") == Some(sub_action)
    }
}

#[derive(Debug, Clone)]
struct MockFolder {
    project: String,
    name: String,
    id: String,
    access: String,
    files: Vec<(String, String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MockState {
    requests: Vec<Recorded>,
    issued: Vec<String>,
    folders: Vec<MockFolder>,
    next_file: u32,
    fail_reloads: bool,
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockServer {
    pub url: String,
    state: Shared,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    /// Server with `Exchange/Inbox` (read-only, id 201) and `Exchange/Outbox` (writable, id 202).
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));
        {
            let mut st = state.lock().unwrap();
            for (name, id, access) in [("Inbox", "201", "read"), ("Outbox", "202", "read,write")] {
                st.folders.push(MockFolder {
                    project: "Exchange".into(),
                    name: name.into(),
                    id: id.into(),
                    access: access.into(),
                    files: Vec::new(),
                });
            }
        }

        let app = axum::Router::new()
            .fallback(handle)
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            url: format!("http://127.0.0.1:{}", port),
            state,
            shutdown: Some(tx),
        }
    }

    pub fn config(&self) -> FzConfig {
        FzConfig {
            timeout_secs: 10,
            ..FzConfig::new(&self.url)
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn last_request(&self) -> Recorded {
        self.state.lock().unwrap().requests.last().cloned().unwrap()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn current_key(&self) -> Option<String> {
        self.state.lock().unwrap().issued.last().cloned()
    }

    pub fn add_file(&self, folder_id: &str, name: &str, data: &[u8]) -> String {
        let mut st = self.state.lock().unwrap();
        st.next_file += 1;
        let key = format!("file-{}", st.next_file);
        let folder = st.folders.iter_mut().find(|f| f.id == folder_id).unwrap();
        folder.files.push((key.clone(), name.to_string(), data.to_vec()));
        key
    }

    /// Delete behind the client's back; later downloads answer 404.
    pub fn remove_file(&self, key: &str) {
        let mut st = self.state.lock().unwrap();
        for folder in st.folders.iter_mut() {
            folder.files.retain(|(k, _, _)| k != key);
        }
    }

    /// Refuse every tree refresh without rotating the key.
    pub fn fail_reloads(&self) {
        self.state.lock().unwrap().fail_reloads = true;
    }

    pub fn file_data(&self, folder_id: &str, name: &str) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.folders
            .iter()
            .filter(|f| f.id == folder_id)
            .flat_map(|f| f.files.iter())
            .find(|(_, n, _)| n == name)
            .map(|(_, _, d)| d.clone())
    }

    pub fn file_names(&self, folder_id: &str) -> Vec<String> {
        let st = self.state.lock().unwrap();
        st.folders
            .iter()
            .filter(|f| f.id == folder_id)
            .flat_map(|f| f.files.iter().map(|(_, n, _)| n.clone()))
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

// ── Request intake ───────────────────────────────────────────────────────────

async fn handle(State(state): State<Shared>, req: Request) -> Response<Body> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    // Header reads end here; no borrow of `req` may live across an await.
    let (cookie, accept_language, multipart) = {
        let headers = req.headers();
        let header_str = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let multipart = header_str(header::CONTENT_TYPE)
            .map(|ct| ct.starts_with("multipart/form-data"))
            .unwrap_or(false);
        (
            header_str(header::COOKIE),
            header_str(header::ACCEPT_LANGUAGE),
            multipart,
        )
    };

    let mut fields = Vec::new();
    let mut file = None;
    if multipart {
        let mut mp = Multipart::from_request(req, &()).await.unwrap();
        while let Some(field) = mp.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(String::from) {
                Some(file_name) => {
                    let bytes = field.bytes().await.unwrap();
                    file = Some((name, file_name, bytes.to_vec()));
                }
                None => fields.push((name, field.text().await.unwrap())),
            }
        }
    } else if method == Method::POST.as_str() {
        let body = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
        fields = url::form_urlencoded::parse(&body).into_owned().collect();
    }

    let rec = Recorded {
        method,
        path,
        query,
        multipart,
        fields,
        file,
        cookie,
        accept_language,
    };
    let mut st = state.lock().unwrap();
    st.requests.push(rec.clone());
    st.dispatch(&rec)
}

// ── Behaviour ────────────────────────────────────────────────────────────────

impl MockState {
    fn rotate(&mut self) -> String {
        let key = format!("vk-{}", self.issued.len() + 1);
        self.issued.push(key.clone());
        key
    }

    fn key_is_current(&self, rec: &Recorded) -> bool {
        rec.field("valid_key").is_some() && rec.field("valid_key") == self.issued.last().map(String::as_str)
    }

    fn tree_xml(&self) -> String {
        let mut out = String::from("<ProjectList><Project Name=\"Exchange\">");
        for d in &self.folders {
            out.push_str(&format!(
                "<Folder Name=\"{}\" Access=\"{}\" Id=\"{}\" Limit=\"0\">",
                d.name, d.access, d.id
            ));
            for (key, name, data) in &d.files {
                out.push_str(&format!(
                    "<File DrmFlag=\"0\" Key=\"{}\" Name=\"{}\" Owner=\"{}\" PdfFlag=\"0\" Size=\"{}\" TimeStamp=\"1700000000\"/>",
                    key, name, USER, data.len()
                ));
            }
            out.push_str("</Folder>");
        }
        out.push_str("</Project></ProjectList>");
        out
    }

    fn dispatch(&mut self, rec: &Recorded) -> Response<Body> {
        if rec.path == "/cgi-bin/index.cgi" && rec.is("Login", "auth") {
            if rec.field("user_id") == Some(USER) && rec.field("password") == Some(PASSWORD) {
                let key = self.rotate();
                return Response::builder()
                    .header(header::SET_COOKIE, format!("SessionID={}; Path=/", SESSION_ID))
                    .body(Body::from(envelope("OK", Some(&self.tree_xml()), Some(&key))))
                    .unwrap();
            }
            return xml_response(envelope("ログインできません", None, None));
        }
        if rec.cookie.as_deref() != Some(&format!("SessionID={}", SESSION_ID)) {
            return xml_response(envelope("セッションが無効です", None, None));
        }

        match rec.path.as_str() {
            "/cgi-bin/index.cgi" => self.main_cgi(rec),
            "/mb/cgi-bin/index.cgi/job/api_send/" => self.delivery(rec),
            "/mb/cgi-bin/index.cgi/admin/history/" => csv_response(HISTORY_CSV),
            "/mb/cgi-bin/index.cgi/admin/approve/export/authority" => csv_response(AUTHORITY_CSV),
            "/mb/cgi-bin/index.cgi/admin/approve/import/global/" => html_response("<html>imported</html>"),
            "/mb/cgi-bin/index.cgi/job/addrbook/" | "/mb/cgi-bin/index.cgi/admin/addrbook/" => {
                self.addrbook_import(rec)
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("not found"))
                .unwrap(),
        }
    }

    fn main_cgi(&mut self, rec: &Recorded) -> Response<Body> {
        if rec.is("Logout", "show") {
            return xml_response(envelope("OK", None, None));
        }
        if !self.key_is_current(rec) {
            return xml_response(envelope("不正なアクセスです", None, None));
        }

        if rec.field("respmode") == Some("csv") {
            return csv_response(USERS_CSV);
        }
        if rec.is("Mainmenu_file", "show") {
            if self.fail_reloads {
                return xml_response(envelope("システムエラー", None, None));
            }
            let key = self.rotate();
            return xml_response(envelope("OK", Some(&self.tree_xml()), Some(&key)));
        }
        if rec.is("Mainmenu_file", "download") {
            let wanted = rec.field("key").unwrap_or_default();
            let found = self
                .folders
                .iter()
                .flat_map(|f| f.files.iter())
                .find(|(k, _, _)| k == wanted)
                .map(|(_, _, d)| d.clone());
            if let Some(body) = found {
                return Response::builder()
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_LENGTH, body.len())
                    .body(Body::from(body))
                    .unwrap();
            }
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("gone"))
                .unwrap();
        }
        if rec.is("Mainmenu_upload", "do_upload") {
            let key = self.rotate();
            let folder_id = rec.field("ST_current_folder").unwrap_or_default();
            let name = rec.field("reg_filename").unwrap_or_default().to_string();
            let data = rec.file.as_ref().map(|(_, _, d)| d.clone()).unwrap_or_default();
            self.next_file += 1;
            let file_key = format!("file-{}", self.next_file);
            return match self.folders.iter_mut().find(|f| f.id == folder_id) {
                Some(folder) if folder.access.contains("write") => {
                    folder.files.push((file_key, name, data));
                    xml_response(envelope("OK", None, Some(&key)))
                }
                _ => xml_response(envelope("アップロードできません", None, Some(&key))),
            };
        }
        if rec.multipart && rec.field("sub_action") == Some("do_upload") {
            let key = self.rotate();
            let broken = rec
                .file
                .as_ref()
                .map(|(_, _, d)| d.starts_with(b"broken"))
                .unwrap_or(true);
            let res = if broken { "CSVファイルの形式が正しくありません" } else { "OK" };
            return xml_response(envelope(res, None, Some(&key)));
        }

        xml_response(envelope("unknown action", None, None))
    }

    fn delivery(&mut self, rec: &Recorded) -> Response<Body> {
        if !self.key_is_current(rec) {
            return xml_response(envelope("不正なアクセスです", None, None));
        }
        let key = self.rotate();
        let res = if rec.file.is_some() { "OK" } else { "ファイルがありません" };
        xml_response(envelope(res, None, Some(&key)))
    }

    fn addrbook_import(&mut self, rec: &Recorded) -> Response<Body> {
        let contents = rec.file.as_ref().map(|(_, _, d)| d.clone()).unwrap_or_default();
        if contents.starts_with(b"garbage") {
            return html_response("<p>アドレス帳ファイルが正しくありません</p>");
        }
        if rec.field("uid") == Some("ghost") {
            return redirect(&format!("{}import", rec.path));
        }
        redirect(&rec.path)
    }
}

pub fn envelope(res: &str, tree: Option<&str>, key: Option<&str>) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><FileZen><Lastop><Res>{}</Res></Lastop>{}{}</FileZen>",
        res,
        tree.unwrap_or_default(),
        key.map(|k| format!("<ValidKey>{}</ValidKey>", k)).unwrap_or_default()
    )
}

fn xml_response(xml: String) -> Response<Body> {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from(xml))
        .unwrap()
}

fn csv_response(csv: &'static str) -> Response<Body> {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/csv")
        .body(Body::from(csv))
        .unwrap()
}

fn html_response(html: &'static str) -> Response<Body> {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(html))
        .unwrap()
}

fn redirect(location: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap()
}
