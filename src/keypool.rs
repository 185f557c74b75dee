//! Rotating credential pool, one rotation cursor per provider.
//!
//! Keys can be added and removed at runtime; the cursor is re-clamped on
//! every access so a concurrent removal can never leave it dangling past
//! the end of the sequence. An empty pool fails closed with
//! `NoCredentialAvailable`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::error::GenError;
use crate::providers::ProviderId;

/// One API secret issued by the pool.
///
/// The secret is copied out of the pool at issue time, so removing the key
/// afterwards cannot invalidate an in-flight request.
#[derive(Clone)]
pub struct Credential {
    provider: ProviderId,
    secret: String,
}

impl Credential {
    pub fn new(provider: ProviderId, secret: impl Into<String>) -> Self {
        Self {
            provider,
            secret: secret.into(),
        }
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

// Keeps the secret out of logs and panic messages.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    keys: Vec<String>,
    cursor: usize,
}

/// Lock-guarded rotating key pool shared by every call site.
#[derive(Default)]
pub struct KeyPool {
    inner: Mutex<HashMap<ProviderId, PoolState>>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a provider's pool, dropping empty/whitespace keys.
    pub fn seed(&self, provider: ProviderId, keys: &[String]) {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        let state = inner.entry(provider).or_default();
        for key in keys {
            let key = key.trim();
            if !key.is_empty() && !state.keys.iter().any(|k| k == key) {
                state.keys.push(key.to_string());
            }
        }
    }

    /// Issue the credential at the cursor and advance, round-robin.
    pub fn next(&self, provider: ProviderId) -> Result<Credential, GenError> {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        let state = inner.entry(provider).or_default();
        if state.keys.is_empty() {
            return Err(GenError::NoCredentialAvailable { provider });
        }
        // Re-clamp before indexing: the pool may have shrunk since the
        // cursor last advanced.
        state.cursor %= state.keys.len();
        let secret = state.keys[state.cursor].clone();
        state.cursor = (state.cursor + 1) % state.keys.len();
        Ok(Credential { provider, secret })
    }

    /// Add a key at runtime. Duplicates are ignored.
    pub fn add(&self, provider: ProviderId, key: &str) {
        self.seed(provider, &[key.to_string()]);
    }

    /// Remove a key at runtime. Returns whether it was present.
    ///
    /// The cursor is clamped into `[0, len)` afterwards; an emptied pool
    /// leaves subsequent `next` calls in the fail-closed state.
    pub fn remove(&self, provider: ProviderId, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        let Some(state) = inner.get_mut(&provider) else {
            return false;
        };
        let before = state.keys.len();
        state.keys.retain(|k| k != key);
        if state.keys.is_empty() {
            state.cursor = 0;
        } else if state.cursor >= state.keys.len() {
            state.cursor = 0;
        }
        state.keys.len() != before
    }

    /// Number of keys currently held for a provider.
    pub fn len(&self, provider: ProviderId) -> usize {
        let inner = self.inner.lock().expect("key pool lock poisoned");
        inner.get(&provider).map_or(0, |s| s.keys.len())
    }

    pub fn is_empty(&self, provider: ProviderId) -> bool {
        self.len(provider) == 0
    }
}
