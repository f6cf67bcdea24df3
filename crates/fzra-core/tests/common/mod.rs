//! In-process FileZen stand-in for integration tests.
//!
//! Speaks the `/cgi-bin/index.cgi` dialect: rotating `ValidKey`s that reject
//! stale values, a `SessionID` cookie, plupload-style chunks keyed by `fr`,
//! and downloads that answer either a sized body or an unsized envelope.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, Response, StatusCode};
use fzra_core::FzConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const SESSION_ID: &str = "sess-0001";
pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

#[derive(Debug, Clone)]
pub struct RecordedFile {
    pub field: String,
    pub file_name: String,
    pub len: usize,
}

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub multipart: bool,
    pub fields: Vec<(String, String)>,
    pub file: Option<RecordedFile>,
    pub cookie: Option<String>,
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
struct StoredFile {
    key: String,
    name: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct MockFolder {
    project: String,
    name: String,
    id: String,
    access: String,
    files: Vec<StoredFile>,
}

#[derive(Debug, Default)]
pub struct MockState {
    requests: Vec<Recorded>,
    issued: Vec<String>,
    folders: Vec<MockFolder>,
    chunks: HashMap<String, Vec<(u64, Vec<u8>)>>,
    next_file: u32,
    fail_chunk: Option<u64>,
    fail_commit: bool,
    envelope_downloads: Vec<String>,
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockServer {
    pub url: String,
    state: Shared,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    /// Server with `ProjectA/FolderB` (writable, id 101) and `ProjectA/Archive` (read-only, id 102).
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));
        {
            let mut st = state.lock().unwrap();
            st.folders.push(MockFolder {
                project: "ProjectA".into(),
                name: "FolderB".into(),
                id: "101".into(),
                access: "read,write".into(),
                files: Vec::new(),
            });
            st.folders.push(MockFolder {
                project: "ProjectA".into(),
                name: "Archive".into(),
                id: "102".into(),
                access: "read".into(),
                files: Vec::new(),
            });
        }

        let app = axum::Router::new()
            .route("/cgi-bin/index.cgi", axum::routing::post(cgi))
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

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// Every `ValidKey` handed out so far, oldest first.
    pub fn issued_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().issued.clone()
    }

    pub fn current_key(&self) -> Option<String> {
        self.state.lock().unwrap().issued.last().cloned()
    }

    /// Place a file directly, returning its key.
    pub fn add_file(&self, folder_id: &str, name: &str, data: &[u8]) -> String {
        let mut st = self.state.lock().unwrap();
        st.store(folder_id, name, data.to_vec())
            .unwrap_or_else(|msg| panic!("add_file: {}", msg))
    }

    /// Delete behind the client's back.
    pub fn remove_file(&self, key: &str) {
        self.state.lock().unwrap().remove(key);
    }

    pub fn file_data(&self, folder_id: &str, name: &str) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.folders
            .iter()
            .filter(|f| f.id == folder_id)
            .flat_map(|f| f.files.iter())
            .find(|f| f.name == name)
            .map(|f| f.data.clone())
    }

    /// Answer HTTP 500 to the chunk with this index.
    pub fn fail_chunk(&self, index: u64) {
        self.state.lock().unwrap().fail_chunk = Some(index);
    }

    /// Reject every chunked-upload commit, still rotating the key.
    pub fn fail_commit(&self) {
        self.state.lock().unwrap().fail_commit = true;
    }

    /// Answer a download of `key` with an unsized success envelope.
    pub fn download_as_envelope(&self, key: &str) {
        self.state
            .lock()
            .unwrap()
            .envelope_downloads
            .push(key.to_string());
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

async fn cgi(State(state): State<Shared>, req: Request) -> Response<Body> {
    let cookie = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let mut fields = Vec::new();
    let mut file = None;
    let mut data = Vec::new();
    if multipart {
        let mut mp = Multipart::from_request(req, &()).await.unwrap();
        while let Some(field) = mp.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(String::from) {
                Some(file_name) => {
                    let bytes = field.bytes().await.unwrap();
                    file = Some(RecordedFile {
                        field: name,
                        file_name,
                        len: bytes.len(),
                    });
                    data = bytes.to_vec();
                }
                None => fields.push((name, field.text().await.unwrap())),
            }
        }
    } else {
        let body = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
        fields = url::form_urlencoded::parse(&body).into_owned().collect();
    }

    let rec = Recorded {
        multipart,
        fields,
        file,
        cookie,
    };
    let mut st = state.lock().unwrap();
    st.requests.push(rec.clone());
    st.dispatch(&rec, data)
}

// ── Behaviour ────────────────────────────────────────────────────────────────

impl MockState {
    fn rotate(&mut self) -> String {
        let key = format!("vk-{}", self.issued.len() + 1);
        self.issued.push(key.clone());
        key
    }

    fn store(&mut self, folder_id: &str, name: &str, data: Vec<u8>) -> Result<String, String> {
        self.next_file += 1;
        let key = format!("file-{}", self.next_file);
        let folder = self
            .folders
            .iter_mut()
            .find(|f| f.id == folder_id)
            .ok_or("no such folder")?;
        if !folder.access.contains("write") {
            return Err("このフォルダにはアップロードできません".into());
        }
        if folder.files.iter().any(|f| f.name == name) {
            return Err("同名のファイルが既に存在します".into());
        }
        folder.files.push(StoredFile {
            key: key.clone(),
            name: name.to_string(),
            data,
        });
        Ok(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        for folder in self.folders.iter_mut() {
            if let Some(pos) = folder.files.iter().position(|f| f.key == key) {
                folder.files.remove(pos);
                return true;
            }
        }
        false
    }

    fn find(&self, key: &str) -> Option<&StoredFile> {
        self.folders
            .iter()
            .flat_map(|f| f.files.iter())
            .find(|f| f.key == key)
    }

    fn tree_xml(&self) -> String {
        let mut out = String::from("<ProjectList>");
        let mut projects: Vec<&str> = Vec::new();
        for f in &self.folders {
            if !projects.contains(&f.project.as_str()) {
                projects.push(&f.project);
            }
        }
        for p in projects {
            out.push_str(&format!("<Project Name=\"{}\">", p));
            for d in self.folders.iter().filter(|d| d.project == p) {
                out.push_str(&format!(
                    "<Folder Name=\"{}\" Access=\"{}\" Id=\"{}\" Limit=\"0\">",
                    d.name, d.access, d.id
                ));
                for f in &d.files {
                    out.push_str(&format!(
                        "<File DrmFlag=\"0\" Key=\"{}\" Name=\"{}\" Owner=\"{}\" PdfFlag=\"0\" Size=\"{}\" TimeStamp=\"1700000000\"/>",
                        f.key, f.name, USER, f.data.len()
                    ));
                }
                out.push_str("</Folder>");
            }
            out.push_str("</Project>");
        }
        out.push_str("</ProjectList>");
        out
    }

    fn dispatch(&mut self, rec: &Recorded, data: Vec<u8>) -> Response<Body> {
        if rec.is("Login", "auth") {
            if rec.field("user_id") == Some(USER) && rec.field("password") == Some(PASSWORD) {
                let key = self.rotate();
                let xml = envelope("OK", Some(&self.tree_xml()), Some(&key));
                return Response::builder()
                    .header(header::SET_COOKIE, format!("SessionID={}; Path=/", SESSION_ID))
                    .body(Body::from(xml))
                    .unwrap();
            }
            return xml_response(envelope("ユーザーIDまたはパスワードが正しくありません", None, None));
        }

        if rec.cookie.as_deref() != Some(&format!("SessionID={}", SESSION_ID)) {
            return xml_response(envelope("セッションが無効です", None, None));
        }
        if rec.is("Logout", "show") {
            return xml_response(envelope("OK", None, None));
        }
        if rec.field("valid_key").is_none() || rec.field("valid_key") != self.issued.last().map(String::as_str) {
            return xml_response(envelope("不正なアクセスです", None, None));
        }

        if rec.is("Mainmenu_file", "show") {
            let key = self.rotate();
            return xml_response(envelope("OK", Some(&self.tree_xml()), Some(&key)));
        }

        if rec.is("Mainmenu_file", "delete_file") {
            let removed = self.remove(rec.field("key").unwrap_or_default());
            let key = self.rotate();
            let res = if removed { "OK" } else { "ファイルが見つかりません" };
            return xml_response(envelope(res, None, Some(&key)));
        }

        if rec.is("Mainmenu_file", "download") {
            let wanted = rec.field("key").unwrap_or_default();
            if self.envelope_downloads.iter().any(|k| k == wanted) {
                let key = self.rotate();
                return unsized_xml(envelope("OK", None, Some(&key)));
            }
            if let Some(f) = self.find(rec.field("key").unwrap_or_default()) {
                let body = f.data.clone();
                return Response::builder()
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_LENGTH, body.len())
                    .body(Body::from(body))
                    .unwrap();
            }
            let key = self.rotate();
            return unsized_xml(envelope("ファイルが見つかりません", None, Some(&key)));
        }

        if rec.is("Mainmenu_upload", "plupload") {
            let index: u64 = rec.field("chunk").and_then(|c| c.parse().ok()).unwrap_or(0);
            if self.fail_chunk == Some(index) {
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("chunk store failed"))
                    .unwrap();
            }
            let fr = rec.field("fr").unwrap_or_default().to_string();
            self.chunks.entry(fr).or_default().push((index, data));
            return Response::builder()
                .body(Body::from(r#"{"jsonrpc":"2.0","result":null}"#))
                .unwrap();
        }

        if rec.is("Mainmenu_upload", "do_upload") {
            let folder_id = rec.field("ST_current_folder").unwrap_or_default().to_string();
            let name = match rec.field("reg_filename") {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => rec.field("filename").unwrap_or_default().to_string(),
            };
            let payload = if rec.multipart {
                Ok(data)
            } else if self.fail_commit {
                Err("ファイルの結合に失敗しました".to_string())
            } else {
                match self.chunks.remove(rec.field("fr").unwrap_or_default()) {
                    Some(mut parts) => {
                        parts.sort_by_key(|(i, _)| *i);
                        Ok(parts.into_iter().flat_map(|(_, d)| d).collect())
                    }
                    None => Err("アップロードデータがありません".to_string()),
                }
            };
            let result = payload.and_then(|d| self.store(&folder_id, &name, d));
            let key = self.rotate();
            return match result {
                Ok(_) => xml_response(envelope("OK", None, Some(&key))),
                Err(msg) => xml_response(envelope(&msg, None, Some(&key))),
            };
        }

        xml_response(envelope("unknown action", None, None))
    }
}

pub fn envelope(res: &str, tree: Option<&str>, key: Option<&str>) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><FileZen><Lastop><Res>{}</Res></Lastop>{}<SystemMailAddr>noreply@fz.test</SystemMailAddr><UserMailAddr>alice@example.com</UserMailAddr>{}<Version>4.2.0</Version></FileZen>",
        res,
        tree.unwrap_or_default(),
        key.map(|k| format!("<ValidKey>{}</ValidKey>", k)).unwrap_or_default()
    )
}

/// Streamed body, so no `Content-Length` reaches the client.
fn unsized_xml(xml: String) -> Response<Body> {
    let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from(xml))]);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn xml_response(xml: String) -> Response<Body> {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from(xml))
        .unwrap()
}
