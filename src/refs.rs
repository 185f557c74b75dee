//! Reference-image library.
//!
//! A flat directory of identity-consistency input images that can be
//! attached to generation requests. Names are validated against path
//! traversal on every lookup, and stored files get generated,
//! unpredictable names so an uploader cannot choose where bytes land.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::GenError;

/// Extensions accepted into the library.
const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Per-file size ceiling for stored reference images.
pub const MAX_REF_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// One stored reference image, as listed to the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RefEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified_ms: u64,
}

#[derive(Default)]
struct LoadCache {
    dir_modified_ms: u64,
    images: Vec<Vec<u8>>,
}

/// Directory-backed reference image store.
///
/// `load_all` results are cached against the directory mtime so repeated
/// request assembly does not re-read every file from disk.
pub struct RefLibrary {
    root: PathBuf,
    cache: Mutex<LoadCache>,
}

impl RefLibrary {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, GenError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            cache: Mutex::new(LoadCache::default()),
        })
    }

    /// List stored references, newest first.
    pub async fn list(&self) -> Result<Vec<RefEntry>, GenError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !has_allowed_extension(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            entries.push(RefEntry {
                name,
                size_bytes: meta.len(),
                modified_ms: to_unix_ms(meta.modified().ok()),
            });
        }
        entries.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms));
        Ok(entries)
    }

    /// Load up to `max` reference images for request assembly, in stable
    /// name order. Oversized or unreadable files are skipped with a
    /// warning rather than failing the whole request.
    pub async fn load_all(&self, max: usize) -> Result<Vec<Vec<u8>>, GenError> {
        let dir_modified_ms = to_unix_ms(
            tokio::fs::metadata(&self.root)
                .await
                .and_then(|m| m.modified())
                .ok(),
        );

        let mut cache = self.cache.lock().await;
        if dir_modified_ms != 0 && cache.dir_modified_ms == dir_modified_ms {
            log::debug!("serving {} reference images from cache", cache.images.len());
            return Ok(cache.images.iter().take(max).cloned().collect());
        }

        let root = self.root.clone();
        let images = tokio::task::spawn_blocking(move || load_dir_sync(&root))
            .await
            .map_err(|e| GenError::Cache(std::io::Error::other(e)))?;

        cache.dir_modified_ms = dir_modified_ms;
        cache.images = images;
        if !cache.images.is_empty() {
            log::info!("loaded {} reference images", cache.images.len());
        }
        Ok(cache.images.iter().take(max).cloned().collect())
    }

    /// Read one reference image for serving. The name is validated
    /// against traversal before touching the filesystem.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, GenError> {
        validate_name(name)?;
        Ok(tokio::fs::read(self.root.join(name)).await?)
    }

    /// Store uploaded bytes under a generated, unpredictable name derived
    /// from the original file's extension. Returns the stored name.
    pub async fn save(&self, original_name: &str, bytes: Vec<u8>) -> Result<String, GenError> {
        validate_name(original_name)?;
        if bytes.len() as u64 > MAX_REF_FILE_BYTES {
            return Err(GenError::PayloadTooLarge {
                limit_bytes: MAX_REF_FILE_BYTES,
            });
        }
        let ext = extension_of(original_name).unwrap_or("png");
        let name = format!(
            "ref_{}_{}.{ext}",
            to_unix_ms(Some(SystemTime::now())),
            Uuid::new_v4().simple()
        );
        tokio::fs::write(self.root.join(&name), bytes).await?;
        self.invalidate_cache().await;
        Ok(name)
    }

    /// Delete a stored reference image. Idempotent: returns whether the
    /// file existed.
    pub async fn delete(&self, name: &str) -> Result<bool, GenError> {
        validate_name(name)?;
        match tokio::fs::remove_file(self.root.join(name)).await {
            Ok(()) => {
                self.invalidate_cache().await;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn invalidate_cache(&self) {
        let mut cache = self.cache.lock().await;
        cache.dir_modified_ms = 0;
        cache.images.clear();
    }
}

fn load_dir_sync(root: &std::path::Path) -> Vec<Vec<u8>> {
    let Ok(dir) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = dir
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| has_allowed_extension(n))
        .collect();
    names.sort();

    let mut images = Vec::new();
    for name in names {
        let path = root.join(&name);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > MAX_REF_FILE_BYTES => {
                log::warn!("skipping oversized reference image {name}");
                continue;
            }
            Err(e) => {
                log::warn!("skipping unreadable reference image {name}: {e}");
                continue;
            }
            Ok(_) => {}
        }
        match std::fs::read(&path) {
            Ok(bytes) => images.push(bytes),
            Err(e) => log::warn!("failed to read reference image {name}: {e}"),
        }
    }
    images
}

/// Reject names containing path separators or parent references, and
/// require an allowed image extension.
fn validate_name(name: &str) -> Result<(), GenError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(GenError::InvalidRequest {
            message: format!("invalid reference image name: {name:?}"),
        });
    }
    if !has_allowed_extension(name) {
        return Err(GenError::InvalidRequest {
            message: format!("unsupported reference image type: {name:?}"),
        });
    }
    Ok(())
}

fn extension_of(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}

fn has_allowed_extension(name: &str) -> bool {
    extension_of(name)
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn to_unix_ms(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
