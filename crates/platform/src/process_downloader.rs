//! Concrete [`ExternalDownloader`] (spec §4.5.1): shells out to a `tdl`
//! binary for one batched request per flushed bucket. The core treats
//! stdout/stderr as diagnostic only — success/failure of the batch is the
//! process exit status, and per-item verification always happens disk-side
//! in `verifier.rs`.

use std::process::Stdio;

use async_trait::async_trait;
use engine::error::{EngineError, ErrorKind};
use engine::tdl::{DownloadOutcome, DownloadRequest, ExternalDownloader};
use tokio::process::Command;

/// Invokes the external `tdl` binary located at `binary_path`.
pub struct ProcessExternalDownloader {
    binary_path: String,
}

impl ProcessExternalDownloader {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self { binary_path: binary_path.into() }
    }
}

#[async_trait]
impl ExternalDownloader for ProcessExternalDownloader {
    async fn run(&self, request: DownloadRequest) -> Result<DownloadOutcome, EngineError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("download")
            .arg("-d")
            .arg(&request.output_dir)
            .arg("-t")
            .arg(request.threads.to_string())
            .arg("--connections")
            .arg(request.connections_per_file.to_string());

        if let Some(proxy) = &request.proxy {
            cmd.arg("--proxy").arg(proxy);
        }
        for url in &request.urls {
            cmd.arg("-u").arg(url);
        }

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::classified(ErrorKind::Unknown, format!("failed to spawn {}: {e}", self.binary_path)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(DownloadOutcome {
            success: output.status.success(),
            combined_output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn missing_binary_reports_a_classified_error_not_a_panic() {
        let downloader = ProcessExternalDownloader::new("tg-export-definitely-not-a-real-binary");
        let request = DownloadRequest {
            urls: vec!["u1".to_string()],
            output_dir: PathBuf::from("/tmp"),
            threads: 2,
            connections_per_file: 1,
            proxy: None,
        };
        let err = downloader.run(request).await.unwrap_err();
        assert_eq!(err.kind(), Some(&ErrorKind::Unknown));
    }
}
