//! Tenant-scoped file storage for downloaded attachments and history snapshots.
//!
//! Layout: `<root>/<tenant id>/<message id><ext>` for attachments and
//! `<root>/<tenant id>/history-<n>.json` for history-sync payloads, where `n`
//! comes from one counter shared by every tenant in the process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::protocol::{Attachment, MediaKind};

/// Writes attachments and history snapshots under a shared root.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    history_seq: Arc<AtomicU64>,
}

impl MediaStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            history_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one tenant's files.
    pub fn tenant_dir(&self, tenant_id: i64) -> PathBuf {
        self.root.join(tenant_id.to_string())
    }

    /// Path an attachment for `message_id` will be written to.
    pub fn attachment_path(
        &self,
        tenant_id: i64,
        message_id: &str,
        attachment: &Attachment,
    ) -> PathBuf {
        let name = format!(
            "{}{}",
            sanitize_filename(message_id),
            extension_for(attachment)
        );
        self.tenant_dir(tenant_id).join(name)
    }

    /// Write downloaded attachment bytes and return the file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub async fn save_attachment(
        &self,
        tenant_id: i64,
        message_id: &str,
        attachment: &Attachment,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let path = self.attachment_path(tenant_id, message_id, attachment);
        write_file(&path, bytes).await?;
        debug!(tenant_id, path = %path.display(), "attachment saved");
        Ok(path)
    }

    /// Write a history-sync payload as indented JSON and return the file path.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save_history(
        &self,
        tenant_id: i64,
        data: &serde_json::Value,
    ) -> anyhow::Result<PathBuf> {
        let n = self
            .history_seq
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        let path = self.tenant_dir(tenant_id).join(format!("history-{n}.json"));
        let json = serde_json::to_vec_pretty(data).context("failed to serialize history sync")?;
        write_file(&path, &json).await?;
        debug!(tenant_id, path = %path.display(), "history sync saved");
        Ok(path)
    }
}

/// Mode of a tenant directory on unix.
pub const TENANT_DIR_MODE: u32 = 0o751;

/// Mode of attachment and history files on unix.
pub const TENANT_FILE_MODE: u32 = 0o600;

async fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create tenant directory: {}", parent.display()))?;
        restrict(parent, TENANT_DIR_MODE).await?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("failed to write file at {}", path.display()))?;
    restrict(path, TENANT_FILE_MODE).await
}

// Other tenants' media shares the root, so files are owner-only.
#[cfg(unix)]
async fn restrict(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn restrict(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

/// File extension (with leading dot) for an attachment.
///
/// Derived from the declared MIME type. Documents with an unknown type fall
/// back to the extension of their original file name. Empty when nothing fits.
pub fn extension_for(attachment: &Attachment) -> String {
    if let Some(ext) = extension_for_mime(&attachment.mimetype) {
        return format!(".{ext}");
    }
    if attachment.kind == MediaKind::Document {
        let from_name = attachment
            .file_name
            .as_deref()
            .and_then(|n| Path::new(n).extension())
            .map(|e| e.to_string_lossy().into_owned());
        if let Some(ext) = from_name.filter(|e| !e.is_empty()) {
            return format!(".{}", sanitize_filename(&ext));
        }
    }
    String::new()
}

/// Known MIME type → extension mapping. Parameters (`; codecs=...`) are ignored.
pub fn extension_for_mime(mimetype: &str) -> Option<&'static str> {
    let essence = mimetype
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let ext = match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "audio/ogg" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "audio/aac" => "aac",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/json" => "json",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/vnd.ms-powerpoint" => "ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",
        "text/plain" => "txt",
        "text/csv" => "csv",
        _ => return None,
    };
    Some(ext)
}

/// Replace path separators and strip leading dots so a name stays inside its directory.
pub fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\'], "_")
        .trim_start_matches('.')
        .to_owned()
}
