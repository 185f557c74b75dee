//! Artifact cache: durable storage for generated media plus metadata.

pub mod store;

use serde::{Deserialize, Serialize};

use crate::providers::{MediaKind, ProviderId};

pub use store::ArtifactStore;

/// One stored media file plus its metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Unguessable identifier, the external handle for all operations.
    pub id: String,
    /// Hex SHA-256 of the media bytes, used for dedup.
    pub content_hash: String,
    pub size_bytes: u64,
    /// Milliseconds since the Unix epoch. Strictly monotonic per store so
    /// eviction ordering has no ties.
    pub created_at: u64,
    pub favorite: bool,
    pub kind: MediaKind,
    pub provider: ProviderId,
    pub model: String,
    pub prompt: String,
    /// File extension of the backing media file, without the dot.
    pub ext: String,
}

impl Artifact {
    /// File name of the backing media file.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, self.ext)
    }
}

/// Storage ceilings. Zero means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheLimits {
    pub max_bytes: u64,
    pub max_count: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: 500 * 1024 * 1024,
            max_count: 100,
        }
    }
}

impl CacheLimits {
    pub fn unlimited() -> Self {
        Self {
            max_bytes: 0,
            max_count: 0,
        }
    }
}

/// Filter and pagination for artifact listings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ListFilter {
    pub favorite: Option<bool>,
    pub kind: Option<MediaKind>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Aggregate counters for one store.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub count: u64,
    pub total_bytes: u64,
    pub favorites: u64,
}

/// Pick a file extension from leading magic bytes.
pub fn sniff_extension(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if data.starts_with(b"\xff\xd8\xff") {
        "jpg"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "gif"
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        "webp"
    } else if data.len() >= 12 && &data[4..8] == b"ftyp" {
        "mp4"
    } else if data.starts_with(b"\x1a\x45\xdf\xa3") {
        "webm"
    } else {
        "bin"
    }
}
