//! Concurrency-safe artifact store with dedup and bounded eviction.
//!
//! All metadata lives in one JSON index document next to a directory of
//! media files named by their artifact id. Mutations take the store's
//! single async lock, apply every change in memory, then persist the index
//! once per logical operation via a tmp-file rename. Media bytes are
//! always written before the index entry commits, so a crash can only
//! leave unreferenced orphan files, never dangling index entries; orphans
//! are swept by [`ArtifactStore::run_maintenance`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::GenError;
use crate::providers::{MediaKind, ProviderId};

use super::{sniff_extension, Artifact, CacheLimits, CacheStats, ListFilter};

const INDEX_FILE: &str = "index.json";
const MEDIA_DIR: &str = "media";

/// On-disk shape of the metadata index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexDocument {
    artifacts: Vec<Artifact>,
}

/// In-memory index state, guarded by the store lock.
#[derive(Debug, Default)]
struct IndexState {
    by_id: HashMap<String, Artifact>,
    /// content hash -> artifact id, maintained incrementally for O(1) dedup.
    by_hash: HashMap<String, String>,
    /// Last issued creation timestamp, for strict monotonicity.
    last_created_ms: u64,
}

impl IndexState {
    fn total_bytes(&self) -> u64 {
        self.by_id.values().map(|a| a.size_bytes).sum()
    }

    fn insert(&mut self, artifact: Artifact) {
        self.by_hash
            .insert(artifact.content_hash.clone(), artifact.id.clone());
        self.last_created_ms = self.last_created_ms.max(artifact.created_at);
        self.by_id.insert(artifact.id.clone(), artifact);
    }

    fn remove(&mut self, id: &str) -> Option<Artifact> {
        let artifact = self.by_id.remove(id)?;
        // Only drop the hash mapping if it still points at this artifact.
        if self.by_hash.get(&artifact.content_hash) == Some(&artifact.id) {
            self.by_hash.remove(&artifact.content_hash);
        }
        Some(artifact)
    }
}

/// Artifact cache and metadata store rooted at one directory.
pub struct ArtifactStore {
    root: PathBuf,
    limits: CacheLimits,
    state: Mutex<IndexState>,
}

impl ArtifactStore {
    /// Open (or create) a store at `root`, loading any existing index.
    pub async fn open(root: impl Into<PathBuf>, limits: CacheLimits) -> Result<Self, GenError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(MEDIA_DIR)).await?;

        let mut state = IndexState::default();
        let index_path = root.join(INDEX_FILE);
        match tokio::fs::read(&index_path).await {
            Ok(bytes) => {
                let doc: IndexDocument = serde_json::from_slice(&bytes).map_err(|e| {
                    GenError::Cache(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("corrupt index at {}: {e}", index_path.display()),
                    ))
                })?;
                for artifact in doc.artifacts {
                    state.insert(artifact);
                }
                log::info!(
                    "loaded artifact index: {} entries, {} bytes",
                    state.by_id.len(),
                    state.total_bytes()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GenError::Cache(e)),
        }

        Ok(Self {
            root,
            limits,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    fn media_dir(&self) -> PathBuf {
        self.root.join(MEDIA_DIR)
    }

    /// Absolute path of an artifact's media file.
    pub fn media_path(&self, artifact: &Artifact) -> PathBuf {
        self.media_dir().join(artifact.file_name())
    }

    /// Store media bytes, returning the new artifact or, when the content
    /// hash already exists, the pre-existing one. Eviction runs in the
    /// same batched index write when limits are exceeded.
    pub async fn store(
        &self,
        bytes: Vec<u8>,
        kind: MediaKind,
        provider: ProviderId,
        model: &str,
        prompt: &str,
    ) -> Result<Artifact, GenError> {
        let size_bytes = bytes.len() as u64;
        // Hashing is CPU work, keep it off the async threads.
        let (bytes, content_hash) = tokio::task::spawn_blocking(move || {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let hash = hex::encode(hasher.finalize());
            (bytes, hash)
        })
        .await
        .map_err(|e| {
            GenError::Cache(std::io::Error::other(format!("hashing task failed: {e}")))
        })?;

        let mut state = self.state.lock().await;

        if let Some(existing_id) = state.by_hash.get(&content_hash) {
            if let Some(existing) = state.by_id.get(existing_id) {
                log::debug!("dedup hit: {content_hash} already stored as {existing_id}");
                return Ok(existing.clone());
            }
        }

        let artifact = Artifact {
            id: Uuid::new_v4().to_string(),
            content_hash,
            size_bytes,
            created_at: now_ms().max(state.last_created_ms + 1),
            favorite: false,
            kind,
            provider,
            model: model.to_string(),
            prompt: prompt.to_string(),
            ext: sniff_extension(&bytes).to_string(),
        };

        // Bytes land on disk before the index entry exists.
        let path = self.media_path(&artifact);
        tokio::fs::write(&path, &bytes).await?;

        state.insert(artifact.clone());
        let evicted = self.plan_eviction(&mut state, Some(artifact.id.as_str()));
        self.persist_index(&state).await?;
        drop(state);

        for victim in evicted {
            if let Err(e) = tokio::fs::remove_file(self.media_dir().join(victim.file_name())).await
            {
                log::warn!("failed to remove evicted media {}: {e}", victim.id);
            } else {
                log::info!("evicted artifact {} ({} bytes)", victim.id, victim.size_bytes);
            }
        }

        Ok(artifact)
    }

    /// Remove oldest non-favorited entries from the in-memory index until
    /// limits are satisfied or only protected entries remain. The artifact
    /// named by `exempt` is never selected, so an insertion cannot evict
    /// itself and hand back a handle to already-deleted bytes. Returns the
    /// victims; their files are deleted after the index commit.
    fn plan_eviction(&self, state: &mut IndexState, exempt: Option<&str>) -> Vec<Artifact> {
        let over_count = |s: &IndexState| {
            self.limits.max_count > 0 && s.by_id.len() as u64 > self.limits.max_count
        };
        let over_bytes =
            |s: &IndexState| self.limits.max_bytes > 0 && s.total_bytes() > self.limits.max_bytes;

        if !over_count(state) && !over_bytes(state) {
            return Vec::new();
        }

        let mut candidates: Vec<Artifact> = state
            .by_id
            .values()
            .filter(|a| !a.favorite && Some(a.id.as_str()) != exempt)
            .cloned()
            .collect();
        candidates.sort_by_key(|a| a.created_at);

        let mut evicted = Vec::new();
        let mut total = state.total_bytes();
        let mut count = state.by_id.len() as u64;
        for victim in candidates {
            let still_over_count = self.limits.max_count > 0 && count > self.limits.max_count;
            let still_over_bytes = self.limits.max_bytes > 0 && total > self.limits.max_bytes;
            if !still_over_count && !still_over_bytes {
                break;
            }
            total -= victim.size_bytes;
            count -= 1;
            state.remove(&victim.id);
            evicted.push(victim);
        }

        if (self.limits.max_count > 0 && count > self.limits.max_count)
            || (self.limits.max_bytes > 0 && total > self.limits.max_bytes)
        {
            // Favorites and the triggering insertion are never auto-evicted,
            // even if limits stay exceeded.
            log::warn!(
                "cache limits exceeded but remaining artifacts are protected \
                 ({count} items, {total} bytes)"
            );
        }
        evicted
    }

    /// List artifacts newest-first, applying filter and pagination.
    pub async fn list(&self, filter: ListFilter) -> Vec<Artifact> {
        let state = self.state.lock().await;
        let mut artifacts: Vec<Artifact> = state
            .by_id
            .values()
            .filter(|a| filter.favorite.map_or(true, |f| a.favorite == f))
            .filter(|a| filter.kind.map_or(true, |k| a.kind == k))
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset.min(artifacts.len());
        let mut page = artifacts.split_off(offset);
        std::mem::swap(&mut artifacts, &mut page);
        if let Some(limit) = filter.limit {
            artifacts.truncate(limit);
        }
        artifacts
    }

    pub async fn get(&self, id: &str) -> Option<Artifact> {
        self.state.lock().await.by_id.get(id).cloned()
    }

    /// Read an artifact's media bytes. `None` when the id is unknown.
    pub async fn read_bytes(&self, id: &str) -> Result<Option<Vec<u8>>, GenError> {
        let Some(artifact) = self.get(id).await else {
            return Ok(None);
        };
        Ok(Some(tokio::fs::read(self.media_path(&artifact)).await?))
    }

    /// Flip an artifact's favorite flag. `None` when the id is unknown.
    pub async fn toggle_favorite(&self, id: &str) -> Result<Option<Artifact>, GenError> {
        let mut state = self.state.lock().await;
        let Some(artifact) = state.by_id.get_mut(id) else {
            return Ok(None);
        };
        artifact.favorite = !artifact.favorite;
        let updated = artifact.clone();
        self.persist_index(&state).await?;
        Ok(Some(updated))
    }

    /// Delete an artifact and its bytes. Deleting an unknown id is a no-op
    /// success, so duplicate requests from the admin surface are harmless.
    pub async fn delete(&self, id: &str) -> Result<bool, GenError> {
        let mut state = self.state.lock().await;
        let Some(artifact) = state.remove(id) else {
            return Ok(false);
        };
        self.persist_index(&state).await?;
        drop(state);

        match tokio::fs::remove_file(self.media_dir().join(artifact.file_name())).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GenError::Cache(e)),
        }
        Ok(true)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            count: state.by_id.len() as u64,
            total_bytes: state.total_bytes(),
            favorites: state.by_id.values().filter(|a| a.favorite).count() as u64,
        }
    }

    /// Maintenance pass: sweep orphan media files (bytes with no index
    /// entry, left by a crash between write and commit) and re-apply
    /// limits. Returns the number of files removed.
    pub async fn run_maintenance(&self) -> Result<usize, GenError> {
        let mut removed = 0usize;

        let mut state = self.state.lock().await;
        let evicted = self.plan_eviction(&mut state, None);
        if !evicted.is_empty() {
            self.persist_index(&state).await?;
        }
        let known: Vec<String> = state.by_id.values().map(Artifact::file_name).collect();
        drop(state);

        for victim in evicted {
            if tokio::fs::remove_file(self.media_dir().join(victim.file_name()))
                .await
                .is_ok()
            {
                removed += 1;
            }
        }

        let mut entries = tokio::fs::read_dir(self.media_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !known.iter().any(|k| *k == name) {
                log::info!("removing orphan media file {name}");
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    /// Write the index atomically: serialize, write to a tmp file, rename.
    async fn persist_index(&self, state: &IndexState) -> Result<(), GenError> {
        let mut artifacts: Vec<Artifact> = state.by_id.values().cloned().collect();
        artifacts.sort_by_key(|a| a.created_at);
        let doc = IndexDocument { artifacts };
        let json = serde_json::to_vec_pretty(&doc).map_err(|e| {
            GenError::Cache(std::io::Error::other(format!("index serialization: {e}")))
        })?;

        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
