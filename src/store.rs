// --- Media store (filesystem) ---------------------------------------------
//
// A flat directory of image files. The filename *is* the image ID.
//
// All functions here are synchronous std::fs calls; the HTTP layer runs them
// through spawn_blocking so they never stall the tokio workers.

use std::path::{Path, PathBuf};

use anyhow::Context;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    dir: PathBuf,
    archive_dir: PathBuf,
}

impl MediaStore {
    pub fn new(dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the media directory if it does not exist yet.
    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create media dir {}", self.dir.display()))
    }

    /// List the IDs of every servable image, sorted.
    ///
    /// Filesystem errors are returned, never reported as an empty store: an
    /// unreadable directory must not look like "no images".
    pub fn list_ids(&self) -> anyhow::Result<Vec<String>> {
        let rd = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read_dir({})", self.dir.display()))?;

        let mut out = Vec::new();
        for ent in rd {
            let ent = ent.context("failed to read media dir entry")?;
            let p = ent.path();
            if !p.is_file() {
                continue;
            }
            // Non-UTF8 names cannot round-trip through a URL or JSON body.
            let Some(name) = ent.file_name().to_str().map(str::to_string) else {
                tracing::warn!("skipping non-UTF8 filename in {}", self.dir.display());
                continue;
            };
            // Hidden files include in-flight uploads.
            if name.starts_with('.') {
                continue;
            }
            out.push(name);
        }
        out.sort();
        Ok(out)
    }

    /// Store an uploaded image and return its generated ID.
    ///
    /// IDs are `<unix millis><.ext>`, keeping the uploaded file's extension. If
    /// that name is already taken the upload gets a uuid suffix instead.
    pub fn save(&self, original_name: Option<&str>, bytes: &[u8]) -> anyhow::Result<String> {
        let ext = upload_extension(original_name);
        let stamp = unix_millis();

        // Write under a hidden name first so listings never see a partial file.
        let tmp = self.dir.join(format!(".upload-{}", Uuid::new_v4().simple()));
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;

        let claimed = self.claim(&tmp, format!("{stamp}{ext}")).and_then(|taken| match taken {
            Some(id) => Ok(Some(id)),
            None => self.claim(&tmp, format!("{stamp}-{}{ext}", Uuid::new_v4().simple())),
        });
        let _ = std::fs::remove_file(&tmp);

        claimed?.ok_or_else(|| anyhow::anyhow!("no free name for upload in {}", self.dir.display()))
    }

    /// Publish `tmp` under `id`. hard_link() fails instead of replacing an
    /// existing file, so two concurrent uploads can never end up on one name.
    /// Returns `None` when the name is already taken.
    fn claim(&self, tmp: &Path, id: String) -> anyhow::Result<Option<String>> {
        let dest = self.dir.join(&id);
        match std::fs::hard_link(tmp, &dest) {
            Ok(()) => Ok(Some(id)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(anyhow::anyhow!("failed to publish upload as {}: {e}", dest.display())),
        }
    }

    /// Move an image out of the media directory into the archive directory.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let src = self.dir.join(id);
        if !src.is_file() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        std::fs::create_dir_all(&self.archive_dir)
            .with_context(|| format!("failed to create archive dir {}", self.archive_dir.display()))?;

        let mut dest = self.archive_dir.join(id);
        if dest.exists() {
            dest = self.archive_dir.join(format!("{}-{id}", unix_millis()));
        }

        // rename() fails across filesystems (EXDEV); fall back to copy + delete.
        if std::fs::rename(&src, &dest).is_err() {
            std::fs::copy(&src, &dest)
                .with_context(|| format!("failed to copy {} to {}", src.display(), dest.display()))?;
            std::fs::remove_file(&src)
                .with_context(|| format!("failed to remove {}", src.display()))?;
        }
        Ok(())
    }
}

/// IDs are bare filenames: no separators, no parent refs, nothing hidden.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\', '\0'])
}

fn upload_extension(original_name: Option<&str>) -> String {
    let ext = original_name
        .map(Path::new)
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return String::new();
    }
    format!(".{}", ext.to_ascii_lowercase())
}

fn unix_millis() -> i128 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}
