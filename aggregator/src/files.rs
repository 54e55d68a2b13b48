//! OPML file persistence (§6.3). Grounded on `application/opml/opml.py`'s
//! storage-key layout; the teacher has no local-filesystem storage layer,
//! so this follows the path shape literally as given in the surface spec
//! rather than adapting an existing module.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn sanitize_component(s: &str) -> String {
    s.chars().filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.').collect()
}

pub fn import_key(user_id: Uuid, name: &str, import_id: Uuid) -> String {
    format!("users/{user_id}/imports/{}-{import_id}.opml", sanitize_component(name))
}

pub fn export_key(user_id: Uuid, generated_name: &str) -> String {
    format!("users/{user_id}/exports/{}", sanitize_component(generated_name))
}

pub async fn write(storage_root: &str, key: &str, contents: &str) -> Result<()> {
    let path = Path::new(storage_root).join(key);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.context("failed to create storage directory")?;
    }
    tokio::fs::write(&path, contents).await.context("failed to write file")?;
    Ok(())
}

pub async fn read(storage_root: &str, key: &str) -> Result<Vec<u8>> {
    let path = Path::new(storage_root).join(key);
    tokio::fs::read(&path).await.context("failed to read file")
}

pub async fn mtime(storage_root: &str, key: &str) -> Result<std::time::SystemTime> {
    let path = Path::new(storage_root).join(key);
    let meta = tokio::fs::metadata(&path).await.context("failed to stat file")?;
    meta.modified().context("filesystem does not report mtime")
}

/// Rejects path traversal in a user-supplied filename (§6.1: "no `/` `\`").
pub fn validate_download_filename(filename: &str) -> Result<()> {
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        anyhow::bail!("invalid filename");
    }
    Ok(())
}

pub fn resolved_path(storage_root: &str, key: &str) -> PathBuf {
    Path::new(storage_root).join(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_key_matches_layout() {
        let uid = Uuid::new_v4();
        let iid = Uuid::new_v4();
        let key = import_key(uid, "feeds", iid);
        assert_eq!(key, format!("users/{uid}/imports/feeds-{iid}.opml"));
    }

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_component("../../etc/passwd"), "....etcpasswd");
    }

    #[test]
    fn validate_download_filename_rejects_traversal() {
        assert!(validate_download_filename("../secret").is_err());
        assert!(validate_download_filename("ok-name.opml").is_ok());
    }
}
