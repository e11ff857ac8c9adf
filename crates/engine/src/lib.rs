//! The Export Task Engine: models, Retry Policy, Parallel Chunk Downloader,
//! Adaptive Concurrency Controller, Download Worker Pool, Scanner, Task
//! Manager, and Integrity Verifier.
//!
//! This crate never talks to Telegram or the filesystem layout on its own
//! terms — it depends only on the [`mtproto::MtProtoClient`],
//! [`tdl::ExternalDownloader`], [`persistence::TaskStore`], and
//! [`notify::TaskObserver`] trait boundaries, which `crates/storage` and
//! `crates/platform` implement concretely.

pub mod adaptive;
pub mod cancel;
pub mod chunked;
pub mod error;
pub mod fsperm;
pub mod model;
pub mod mtproto;
pub mod notify;
pub mod persistence;
pub mod retry;
pub mod scanner;
pub mod task_manager;
pub mod tdl;
pub mod verifier;
pub mod worker_pool;

pub use error::{EngineError, ErrorKind};
pub use model::{DownloadItem, DownloadStatus, Task, TaskStatus};
pub use task_manager::EngineState;
