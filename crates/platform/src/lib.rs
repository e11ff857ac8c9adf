//! Platform adapters: everything the engine needs from the host operating
//! system but refuses to know about directly — directory layout and
//! permissions, configuration loading, and the out-of-process `tdl`
//! downloader.

pub mod config;
pub mod layout;
pub mod process_downloader;

pub use config::{ConfigError, EngineConfig};
pub use process_downloader::ProcessExternalDownloader;
