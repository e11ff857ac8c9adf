//! Export directory layout (spec §6 "Export directory layout"): the engine
//! only ever joins `export_root`/`temp_dir` with a relative path it already
//! computed; this module is responsible for making those directories exist
//! with permissions wide enough that a worker running as a different user
//! (e.g. inside a container) can still write into them.

use std::path::{Path, PathBuf};

/// The one sub-directory per [`engine::model::MediaType`] the scanner's
/// `build_file_name` path prefixes assume exist (spec §6 layout table).
const MEDIA_SUBDIRECTORIES: &[&str] = &[
    "photos",
    "video_files",
    "voice_messages",
    "round_video_messages",
    "audio_files",
    "files",
    "stickers",
    "gifs",
];

/// Creates `export_root` and `temp_dir`, plus every media sub-directory
/// under `export_root`, granting `0o777` recursively on Unix so the
/// directories remain writable regardless of which user account runs the
/// worker pool (spec §6).
pub async fn prepare_export_layout(export_root: &Path, temp_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(export_root).await?;
    tokio::fs::create_dir_all(temp_dir).await?;
    for sub in MEDIA_SUBDIRECTORIES {
        tokio::fs::create_dir_all(export_root.join(sub)).await?;
    }
    set_world_writable(export_root).await?;
    set_world_writable(temp_dir).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_world_writable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)))
        .await
        .expect("blocking permission set panicked")
}

#[cfg(not(unix))]
async fn set_world_writable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Resolves the directory the engine persists its task registry and export
/// trees under, honouring `TG_EXPORT_HOME` before falling back to the
/// platform data directory (spec §6).
pub fn data_dir() -> PathBuf {
    if let Ok(custom) = std::env::var("TG_EXPORT_HOME") {
        return PathBuf::from(custom);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tg-export")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_export_layout_creates_media_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let export_root = dir.path().join("export");
        let temp_dir = dir.path().join("temp");
        prepare_export_layout(&export_root, &temp_dir).await.unwrap();

        for sub in MEDIA_SUBDIRECTORIES {
            assert!(export_root.join(sub).is_dir(), "missing {sub}");
        }
        assert!(temp_dir.is_dir());
    }

    #[test]
    fn data_dir_honours_override_env_var() {
        std::env::set_var("TG_EXPORT_HOME", "/tmp/tg-export-override");
        assert_eq!(data_dir(), PathBuf::from("/tmp/tg-export-override"));
        std::env::remove_var("TG_EXPORT_HOME");
    }
}
