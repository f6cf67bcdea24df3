// ──────────────────────────────────────────────────────────────────────────────
// fzra-core · transport
// ──────────────────────────────────────────────────────────────────────────────
// HTTP plumbing shared by every FileZen operation:
//  • fixed `User-Agent`, explicit `SessionID` cookie per request
//  • optional extra CA, client identity and relaxed certificate checks
//  • per-request timeout (each chunk gets its own budget)
//  • ordered form fields, multipart assembly, streaming a body to disk
// ──────────────────────────────────────────────────────────────────────────────

use crate::error::{FzError, FzResult};
use crate::session::SessionToken;
use crate::types::FzConfig;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{header, redirect, Client, RequestBuilder, Response};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Cookie carrying the session identity.
pub const SESSION_COOKIE: &str = "SessionID";

/// Main CGI endpoint, relative to the base URL.
pub const CGI_PATH: &str = "/cgi-bin/index.cgi";

/// Ordered `name=value` pairs; setting an existing name replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFields(Vec<(String, String)>);

impl FormFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
        self
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn extend<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> &mut Self {
        for (n, v) in pairs {
            self.set(n, v);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    /// Append every field as a text part.
    pub fn into_multipart(self, mut form: Form) -> Form {
        for (n, v) in self.0 {
            form = form.text(n, v);
        }
        form
    }
}

/// Wrap bytes as a named file part.
pub fn file_part(data: Vec<u8>, file_name: &str) -> FzResult<Part> {
    Ok(Part::bytes(data)
        .file_name(file_name.to_string())
        .mime_str("application/octet-stream")?)
}

/// Low-level FileZen HTTP client.
#[derive(Debug, Clone)]
pub struct FzTransport {
    http: Client,
    /// Same settings, but 3xx answers are returned instead of followed.
    http_no_redirect: Client,
    base_url: String,
}

impl FzTransport {
    // ── Constructors ─────────────────────────────────────────────────────

    pub fn new(config: &FzConfig) -> FzResult<Self> {
        config.validate()?;
        Ok(Self {
            http: Self::build_client(config, redirect::Policy::default())?,
            http_no_redirect: Self::build_client(config, redirect::Policy::none())?,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn build_client(config: &FzConfig, policy: redirect::Policy) -> FzResult<Client> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(policy);

        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        if config.accept_invalid_certs {
            warn!("TLS certificate validation disabled for {}", config.url);
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ref pem) = config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| FzError::config(format!("CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(ref pem) = config.client_identity_pem {
            let identity = reqwest::Identity::from_pem(pem.as_bytes())
                .map_err(|e| FzError::config(format!("client certificate: {}", e)))?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| FzError::config(format!("HTTP client: {}", e)))
    }

    // ── URL builders ─────────────────────────────────────────────────────

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn cgi_url(&self) -> String {
        self.url(CGI_PATH)
    }

    // ── Requests ─────────────────────────────────────────────────────────

    fn with_session(req: RequestBuilder, token: Option<&SessionToken>) -> RequestBuilder {
        match token {
            Some(t) => req.header(
                header::COOKIE,
                format!("{}={}", SESSION_COOKIE, t.session_id()),
            ),
            None => req,
        }
    }

    async fn send(req: RequestBuilder, allow_redirect_status: bool) -> FzResult<Response> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() || (allow_redirect_status && status.is_redirection()) {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(FzError::from_status(status.as_u16(), &body))
    }

    /// Form-encoded POST.
    pub async fn post_form(
        &self,
        path: &str,
        token: Option<&SessionToken>,
        fields: &FormFields,
    ) -> FzResult<Response> {
        let url = self.url(path);
        debug!("POST {} (form, {} fields)", url, fields.pairs().len());
        let req = self.http.post(&url).form(fields.pairs());
        Self::send(Self::with_session(req, token), false).await
    }

    /// Multipart POST.  The form owns its buffers, so nothing is shared between calls.
    pub async fn post_multipart(
        &self,
        path: &str,
        token: Option<&SessionToken>,
        form: Form,
    ) -> FzResult<Response> {
        let url = self.url(path);
        debug!("POST {} (multipart)", url);
        let req = self.http.post(&url).multipart(form);
        Self::send(Self::with_session(req, token), false).await
    }

    /// Multipart POST that hands 3xx answers back to the caller.
    pub async fn post_multipart_no_redirect(
        &self,
        path: &str,
        token: Option<&SessionToken>,
        form: Form,
        headers: &[(&str, &str)],
    ) -> FzResult<Response> {
        let url = self.url(path);
        debug!("POST {} (multipart, redirects not followed)", url);
        let mut req = self.http_no_redirect.post(&url).multipart(form);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        Self::send(Self::with_session(req, token), true).await
    }

    pub async fn get(
        &self,
        path: &str,
        token: Option<&SessionToken>,
        headers: &[(&str, &str)],
    ) -> FzResult<Response> {
        let url = self.url(path);
        debug!("GET {}", url);
        let mut req = self.http.get(&url);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        Self::send(Self::with_session(req, token), false).await
    }
}

/// Stream a response body to `dest`.  A partial file is removed on failure.
pub async fn write_body_to_file(mut resp: Response, dest: &Path) -> FzResult<u64> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| FzError::io(format!("create {}: {}", dest.display(), e)))?;

    let mut written: u64 = 0;
    let result = async {
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<(), FzError>(())
    }
    .await;

    if let Err(e) = result {
        drop(file);
        if let Err(rm) = tokio::fs::remove_file(dest).await {
            warn!("could not remove partial file {}: {}", dest.display(), rm);
        }
        return Err(e);
    }
    debug!("wrote {} bytes to {}", written, dest.display());
    Ok(written)
}
