//! Authenticated session: login/logout/reload, the rotating anti-forgery
//! token and the cached directory tree.
//!
//! `SessionToken` is an immutable value.  Engine-level calls take it by
//! reference and hand back an envelope; `Session` threads the rotated token
//! into the next call so stale tokens are never sent twice.

use crate::envelope::{read_envelope, Envelope, EnvelopeStatus};
use crate::error::{FzError, FzResult};
use crate::transfer::{DownloadOutcome, Transfers, UploadOutcome};
use crate::transport::{FormFields, FzTransport, CGI_PATH};
use crate::tree::{DirectoryTree, FolderNode};
use crate::types::{FzConfig, ServerInfo, TransferRequest, UploadProgress};
use log::{debug, info, warn};
use std::path::Path;

// ═══════════════════════════════════════════════════════════════════════
//  Token
// ═══════════════════════════════════════════════════════════════════════

/// Session cookie value plus the current anti-forgery token.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    session_id: String,
    valid_key: String,
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("session_id", &mask(&self.session_id))
            .field("valid_key", &mask(&self.valid_key))
            .finish()
    }
}

impl SessionToken {
    pub fn new(session_id: &str, valid_key: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            valid_key: valid_key.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn valid_key(&self) -> &str {
        &self.valid_key
    }

    pub fn is_usable(&self) -> bool {
        !self.session_id.is_empty() && !self.valid_key.is_empty()
    }

    /// Token to use after `env`.  Absent values keep the current ones.
    pub fn rotated(&self, env: &Envelope) -> SessionToken {
        SessionToken {
            session_id: env
                .session_id
                .clone()
                .unwrap_or_else(|| self.session_id.clone()),
            valid_key: env
                .valid_key
                .clone()
                .unwrap_or_else(|| self.valid_key.clone()),
        }
    }

    /// Token to use after a failed call whose envelope still carried a new key.
    pub fn rotated_after(&self, err: &FzError) -> SessionToken {
        match err.valid_key {
            Some(ref key) => SessionToken::new(&self.session_id, key),
            None => self.clone(),
        }
    }

    pub fn masked(&self) -> String {
        mask(&self.valid_key)
    }
}

fn mask(v: &str) -> String {
    match v.get(..4) {
        Some(head) if v.len() > 4 => format!("{}****", head),
        _ => "****".to_string(),
    }
}

/// Fail early when a token is missing either half.
pub fn require_token(token: &SessionToken) -> FzResult<()> {
    if token.is_usable() {
        Ok(())
    } else {
        Err(FzError::state("no authenticated session (missing SessionID or valid_key)"))
    }
}

// ── Engine-level calls ───────────────────────────────────────────────────────

/// Post credentials.  No cookie is sent; the session id comes back as one.
pub async fn login(
    transport: &FzTransport,
    user_id: &str,
    password: &str,
) -> FzResult<(SessionToken, Envelope)> {
    let fields = FormFields::new()
        .with("respmode", "xml")
        .with("action", "Login")
        .with("sub_action", "auth")
        .with("user_id", user_id)
        .with("password", password);

    let resp = transport.post_form(CGI_PATH, None, &fields).await?;
    let env = read_envelope(resp).await?;
    if let EnvelopeStatus::Failed(ref msg) = env.status {
        let mut err = FzError::auth(if msg.is_empty() {
            "login refused".to_string()
        } else {
            format!("login refused: {}", msg)
        });
        err.server_message = Some(msg.clone());
        return Err(err);
    }

    let session_id = env
        .session_id
        .clone()
        .ok_or_else(|| FzError::state("login succeeded but no SessionID cookie was set"))?;
    let valid_key = env
        .valid_key
        .clone()
        .ok_or_else(|| FzError::state("login succeeded but no ValidKey was returned"))?;
    Ok((SessionToken::new(&session_id, &valid_key), env))
}

/// Fetch the full tree snapshot under `token`.
pub async fn reload(transport: &FzTransport, token: &SessionToken) -> FzResult<Envelope> {
    require_token(token)?;
    let fields = FormFields::new()
        .with("respmode", "xml")
        .with("action", "Mainmenu_file")
        .with("sub_action", "show")
        .with("valid_key", token.valid_key());
    let resp = transport.post_form(CGI_PATH, Some(token), &fields).await?;
    read_envelope(resp).await?.ensure_ok()
}

pub async fn logout(transport: &FzTransport, token: &SessionToken) -> FzResult<()> {
    let fields = FormFields::new()
        .with("respmode", "xml")
        .with("action", "Logout")
        .with("sub_action", "show");
    let resp = transport.post_form(CGI_PATH, Some(token), &fields).await?;
    match read_envelope(resp).await.and_then(Envelope::ensure_ok) {
        Ok(_) => debug!("logout acknowledged"),
        Err(e) => debug!("logout not acknowledged: {}", e),
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

/// One logged-in user against one server.
///
/// Every call takes `&mut self`: one operation in flight per session.
#[derive(Debug)]
pub struct Session {
    transport: FzTransport,
    config: FzConfig,
    user_id: String,
    token: SessionToken,
    tree: DirectoryTree,
    server: ServerInfo,
    tree_stale: bool,
    needs_reload: bool,
}

impl Session {
    // ── Lifecycle ────────────────────────────────────────────────────────

    pub async fn login(config: FzConfig, user_id: &str, password: &str) -> FzResult<Self> {
        let transport = FzTransport::new(&config)?;
        info!("FileZen login as {} at {}", user_id, transport.base_url());

        let (token, env) = login(&transport, user_id, password)
            .await
            .map_err(|e| e.context("login"))?;
        debug!("session established, token {}", token.masked());

        Ok(Self {
            transport,
            config,
            user_id: user_id.to_string(),
            token,
            tree_stale: env.tree.is_none(),
            tree: env.tree.unwrap_or_default(),
            server: env.server,
            needs_reload: false,
        })
    }

    /// Best-effort; only transport failures are reported.
    pub async fn logout(self) -> FzResult<()> {
        info!("FileZen logout for {}", self.user_id);
        logout(&self.transport, &self.token)
            .await
            .map_err(|e| e.context("logout"))
    }

    /// Re-fetch the tree and rotate the token.
    pub async fn reload(&mut self) -> FzResult<()> {
        let result = reload(&self.transport, &self.token).await;
        let env = self.absorb("reload", result, false)?;
        if env.tree.is_none() {
            warn!("reload answered without a project list");
        }
        self.needs_reload = false;
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn transport(&self) -> &FzTransport {
        &self.transport
    }

    pub fn config(&self) -> &FzConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    /// A mutating or failed call happened since the tree was fetched.
    pub fn is_tree_stale(&self) -> bool {
        self.tree_stale
    }

    /// A call failed; the server may have moved on without us.
    pub fn needs_reload(&self) -> bool {
        self.needs_reload
    }

    // ── State threading ──────────────────────────────────────────────────

    /// Fold an envelope-returning call's result into the session.
    ///
    /// On success the token rotates and a carried tree replaces the cache.
    /// On failure a token carried by the failed envelope is still adopted,
    /// the tree is marked stale and the error gains `op` as context.
    pub fn absorb(
        &mut self,
        op: &str,
        result: FzResult<Envelope>,
        mutating: bool,
    ) -> FzResult<Envelope> {
        match result {
            Ok(env) => {
                self.apply_envelope(&env);
                if mutating {
                    self.tree_stale = true;
                }
                Ok(env)
            }
            Err(e) => Err(self.record_failure(op, e)),
        }
    }

    fn apply_envelope(&mut self, env: &Envelope) {
        let next = self.token.rotated(env);
        if next != self.token {
            debug!("token rotated {} -> {}", self.token.masked(), next.masked());
        }
        self.token = next;
        self.server.merge(&env.server);
        if let Some(ref tree) = env.tree {
            self.tree = tree.clone();
            self.tree_stale = false;
        }
    }

    fn record_failure(&mut self, op: &str, err: FzError) -> FzError {
        self.token = self.token.rotated_after(&err);
        self.tree_stale = true;
        self.needs_reload = true;
        warn!("{} failed: {}", op, err);
        err.context(op)
    }

    // ── Tree queries ─────────────────────────────────────────────────────

    pub fn find_folder(&self, path: &str) -> Option<&FolderNode> {
        self.tree.find_folder(path)
    }

    pub fn find_file(&self, project: &str, folder: &str, name: &str) -> Option<&str> {
        self.tree.find_file(project, folder, name)
    }

    pub fn can_upload(&self, path: &str, name: &str) -> bool {
        if self.tree_stale {
            debug!("can_upload consulted a stale tree");
        }
        self.tree.can_upload(path, name)
    }

    // ── Transfers ────────────────────────────────────────────────────────

    fn transfers(&self) -> Transfers<'_> {
        Transfers::new(&self.transport, self.config.chunk_size)
    }

    pub async fn upload(&mut self, req: &TransferRequest) -> FzResult<UploadOutcome> {
        self.upload_with_progress(req, |_| {}).await
    }

    pub async fn upload_with_progress(
        &mut self,
        req: &TransferRequest,
        on_progress: impl FnMut(&UploadProgress),
    ) -> FzResult<UploadOutcome> {
        let result = self.transfers().upload(&self.token, req, on_progress).await;
        match result {
            Ok(outcome) => {
                self.apply_envelope(&outcome.envelope);
                self.tree_stale = true;
                Ok(outcome)
            }
            Err(e) => Err(self.record_failure("upload", e)),
        }
    }

    /// Save the file behind `key` to `dest`.
    pub async fn download(&mut self, key: &str, dest: &Path) -> FzResult<DownloadOutcome> {
        let result = self.transfers().download(&self.token, key, dest).await;
        result.map_err(|e| self.record_failure("download", e))
    }

    pub async fn delete_file(&mut self, key: &str) -> FzResult<()> {
        let result = self.transfers().delete(&self.token, key).await;
        self.absorb("delete", result, true).map(|_| ())
    }
}
