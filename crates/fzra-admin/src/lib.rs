//! # fzra-admin
//!
//! Operator-facing FileZen features built on a [`fzra_core::Session`]:
//!
//! - **delivery** — one-off expiring sends through the mail-delivery endpoint
//! - **csv** — administrative CSV export / import on both endpoint families
//! - **comment** — default upload comment (origin path, size, SHA-1)
//! - **sync** — download-then-upload pass over a local folder pair
//! - **archive** — zips directories for the delivery and sync uploads

pub mod archive;
pub mod comment;
pub mod csv;
pub mod delivery;
pub mod sync;

pub use archive::{archive_name, zip_dir, TempArchive};
pub use comment::file_comment;
pub use csv::{AdminCsv, AdminExport, AdminImport, DateRange, MbExport, MbImport};
pub use delivery::{parse_recipient, DeliveryRequest, MailDelivery, Recipient};
pub use sync::{sync_folder, SyncConfig, SyncReport};
