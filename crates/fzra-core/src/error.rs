//! Error types for the FileZen protocol engine.
//!
//! All public API surfaces in this workspace return `FzResult<T>`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Convenience alias.
pub type FzResult<T> = Result<T, FzError>;

/// Failure categories surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FzErrorKind {
    /// Login refused by the server.
    Auth,
    /// Connection, TLS, timeout or non-success HTTP status.
    Transport,
    /// Envelope discriminator was not the success sentinel.
    Envelope,
    /// Operation attempted without a session cookie or anti-forgery token.
    State,
    /// Response shape did not match what the endpoint should return.
    ProtocolMismatch,
    /// Local file-system failure.
    Io,
    /// Undecodable envelope or configuration document.
    Parse,
    /// Caller supplied an unusable request (unknown mode, size cap, bad input).
    InvalidRequest,
    /// Base URL or TLS material could not be used.
    Config,
}

impl fmt::Display for FzErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Structured error returned by every public function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FzError {
    pub kind: FzErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    /// The envelope's failure string, verbatim.
    pub server_message: Option<String>,
    /// Anti-forgery token carried by a failed envelope, if the server rotated it anyway.
    pub valid_key: Option<String>,
}

impl fmt::Display for FzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(status) = self.status {
            write!(f, " (HTTP {})", status)?;
        }
        Ok(())
    }
}

impl std::error::Error for FzError {}

impl FzError {
    pub fn new(kind: FzErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            status: None,
            server_message: None,
            valid_key: None,
        }
    }

    /// Shortcut: login refused.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::Auth, msg)
    }

    /// Shortcut: network failure.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::Transport, msg)
    }

    /// Shortcut: missing session state.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::State, msg)
    }

    /// Shortcut: unexpected response shape.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::ProtocolMismatch, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::Io, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::Parse, msg)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::InvalidRequest, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(FzErrorKind::Config, msg)
    }

    /// Envelope failure carrying the server's message and any rotated token.
    pub fn envelope(server_message: &str, valid_key: Option<String>) -> Self {
        let mut err = Self::new(
            FzErrorKind::Envelope,
            if server_message.is_empty() {
                "server returned an empty status".to_string()
            } else {
                server_message.to_string()
            },
        );
        err.server_message = Some(server_message.to_string());
        err.valid_key = valid_key;
        err
    }

    /// Non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        let mut err = Self::transport(if snippet.trim().is_empty() {
            format!("server answered HTTP {}", status)
        } else {
            format!("server answered HTTP {}: {}", status, snippet.trim())
        });
        err.status = Some(status);
        err
    }

    /// Prefix the message with the operation that failed.
    pub fn context(mut self, op: &str) -> Self {
        self.message = format!("{}: {}", op, self.message);
        self
    }

    pub fn is_envelope(&self) -> bool {
        self.kind == FzErrorKind::Envelope
    }
}

impl From<reqwest::Error> for FzError {
    fn from(err: reqwest::Error) -> Self {
        let mut out = if err.is_timeout() {
            Self::transport(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            Self::transport(format!("Connection failed: {}", err))
        } else if err.is_builder() {
            Self::config(format!("Request could not be built: {}", err))
        } else {
            Self::transport(format!("HTTP error: {}", err))
        };
        out.status = err.status().map(|s| s.as_u16());
        out
    }
}

impl From<std::io::Error> for FzError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<quick_xml::DeError> for FzError {
    fn from(err: quick_xml::DeError) -> Self {
        Self::parse(format!("Envelope XML error: {}", err))
    }
}

impl From<serde_json::Error> for FzError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(format!("JSON error: {}", err))
    }
}

impl From<url::ParseError> for FzError {
    fn from(err: url::ParseError) -> Self {
        Self::config(format!("URL parse error: {}", err))
    }
}

impl From<FzError> for String {
    fn from(err: FzError) -> Self {
        err.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
