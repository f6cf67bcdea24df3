//! # fzra-core
//!
//! Client protocol engine for FileZen document-exchange servers.
//!
//! - **transport** — HTTP client with the fixed `User-Agent`, `SessionID` cookie,
//!   optional client identity and per-request timeout
//! - **envelope** — `respmode=xml` status document decoder
//! - **session** — login / logout / reload and anti-forgery token rotation
//! - **tree** — cached project → folder → file snapshot and upload eligibility
//! - **transfer** — single-shot vs. chunked upload, commit, download, delete
//!
//! ```no_run
//! # async fn demo() -> fzra_core::error::FzResult<()> {
//! use fzra_core::{FzConfig, Session, TransferRequest};
//!
//! let mut session = Session::login(FzConfig::new("https://fz.example.com"), "alice", "secret").await?;
//! if let Some(folder) = session.find_folder("ProjectA/FolderB").cloned() {
//!     if session.can_upload("ProjectA/FolderB", "report.pdf") {
//!         session.upload(&TransferRequest::new("report.pdf", &folder.id)).await?;
//!         session.reload().await?;
//!     }
//! }
//! session.logout().await
//! # }
//! ```

pub mod envelope;
pub mod error;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod tree;
pub mod types;

pub use envelope::{Envelope, EnvelopeStatus};
pub use error::{FzError, FzErrorKind, FzResult};
pub use session::{Session, SessionToken};
pub use transfer::{
    ChunkPlan, DownloadOutcome, MailSend, NotifyEvents, Transfers, UploadOutcome, UploadStrategy,
};
pub use transport::{FormFields, FzTransport};
pub use tree::{DirectoryTree, FileNode, FolderNode, ProjectNode};
pub use types::{FzConfig, ServerInfo, TransferRequest, UploadProgress};
