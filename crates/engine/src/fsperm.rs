//! Recursive world-writable directory creation for paths created on the
//! live download path (spec §6 "File and directory mode on creation").
//!
//! `crates/platform`'s `layout::prepare_export_layout` does the same thing
//! for the top-level export/temp roots, but `engine` can't depend on
//! `platform` (the dependency runs the other way), so the task manager and
//! worker pool use this instead for the directories they create themselves.

use std::path::Path;

/// Creates `path` (and any missing ancestors) and grants `0o777` on Unix.
/// A chmod failure is logged, not propagated — the directory still exists
/// and is usable by the process that created it.
pub async fn create_world_writable_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    if let Err(e) = set_world_writable(path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to set world-writable permissions");
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_nested_directory_and_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        create_world_writable_dir(&target).await.unwrap();
        assert!(target.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o777);
        }
    }
}
