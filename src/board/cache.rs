//! Injected query cache.
//!
//! Reads are fetch-all-then-cache under a typed [`QueryKey`]. Writes never
//! patch cached data; they invalidate matching keys so the next read goes
//! back to the source of truth. Each key runs the state machine
//! `Idle -> Fetching -> {Ready | Error}`, keeping the last good data visible
//! while a refetch is in progress or after it fails.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::models::EntityTag;
use crate::errors::{DashboardError, DashboardResult};

/// Cache key: entity tag, owning principal, optional parent row and the
/// manual refresh token in force when the key was built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryKey {
    pub tag: EntityTag,
    pub scope: String,
    pub parent: Option<i64>,
    pub refresh: u64,
}

impl QueryKey {
    pub fn new(tag: EntityTag, scope: impl Into<String>) -> Self {
        Self {
            tag,
            scope: scope.into(),
            parent: None,
            refresh: 0,
        }
    }

    pub fn with_parent(mut self, parent: i64) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_refresh(mut self, refresh: u64) -> Self {
        self.refresh = refresh;
        self
    }
}

/// Selects the keys an invalidation applies to. `parent: None` matches every
/// parent of the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPattern {
    pub tag: EntityTag,
    pub parent: Option<i64>,
}

impl KeyPattern {
    pub fn tag(tag: EntityTag) -> Self {
        Self { tag, parent: None }
    }

    pub fn child(tag: EntityTag, parent: i64) -> Self {
        Self {
            tag,
            parent: Some(parent),
        }
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        key.tag == self.tag && self.parent.is_none_or(|p| key.parent == Some(p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Idle,
    Fetching,
    Ready,
    Error,
}

/// Observable status of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryStatus {
    pub state: QueryState,
    pub stale: bool,
    pub has_data: bool,
    pub error: Option<String>,
}

type CachedValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    state: QueryState,
    data: Option<CachedValue>,
    error: Option<String>,
    stale: bool,
    /// Bumped on every invalidation; a fetch that started under an older
    /// generation stores its result but leaves the entry stale.
    generation: u64,
}

impl Entry {
    fn idle() -> Self {
        Self {
            state: QueryState::Idle,
            data: None,
            error: None,
            stale: true,
            generation: 0,
        }
    }
}

#[derive(Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, Entry>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DashboardResult<std::sync::MutexGuard<'_, HashMap<QueryKey, Entry>>> {
        self.entries
            .lock()
            .map_err(|e| DashboardError::Other(anyhow::anyhow!("Query cache lock poisoned: {}", e)))
    }

    /// Return fresh cached data for `key`, or run `fetcher` and cache its
    /// result. A failed fetch leaves the previous data in place.
    pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> DashboardResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DashboardResult<T>>,
    {
        let started_generation = {
            let mut entries = self.lock()?;
            let entry = entries.entry(key.clone()).or_insert_with(Entry::idle);
            if entry.state == QueryState::Ready
                && !entry.stale
                && let Some(value) = entry.data.as_ref().and_then(|d| d.downcast_ref::<T>())
            {
                return Ok(value.clone());
            }
            entry.state = QueryState::Fetching;
            entry.generation
        };

        tracing::debug!(tag = %key.tag, scope = %key.scope, parent = ?key.parent, "fetching query");
        let result = fetcher().await;

        let mut entries = self.lock()?;
        let entry = entries.entry(key.clone()).or_insert_with(Entry::idle);
        match result {
            Ok(value) => {
                entry.state = QueryState::Ready;
                entry.data = Some(Arc::new(value.clone()));
                entry.error = None;
                entry.stale = entry.generation != started_generation;
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(tag = %key.tag, error = %e, "query fetch failed");
                entry.state = QueryState::Error;
                entry.error = Some(e.to_string());
                entry.stale = true;
                Err(e)
            }
        }
    }

    /// Last-known data for `key`, fresh or not.
    pub fn peek<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .and_then(|e| e.data.as_ref())
            .and_then(|d| d.downcast_ref::<T>())
            .cloned()
    }

    pub fn status(&self, key: &QueryKey) -> QueryStatus {
        let idle = QueryStatus {
            state: QueryState::Idle,
            stale: true,
            has_data: false,
            error: None,
        };
        let Ok(entries) = self.entries.lock() else {
            return idle;
        };
        match entries.get(key) {
            Some(e) => QueryStatus {
                state: e.state,
                stale: e.stale,
                has_data: e.data.is_some(),
                error: e.error.clone(),
            },
            None => idle,
        }
    }

    /// Mark every key of `scope` matching any pattern stale. Returns how many
    /// keys were hit.
    pub fn invalidate(&self, scope: &str, patterns: &[KeyPattern]) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let mut hit = 0;
        for (key, entry) in entries.iter_mut() {
            if key.scope == scope && patterns.iter().any(|p| p.matches(key)) {
                entry.stale = true;
                entry.generation += 1;
                hit += 1;
            }
        }
        if hit > 0 {
            tracing::debug!(scope, keys = hit, "invalidated queries");
        }
        hit
    }

    /// Mark matching keys stale for every principal.
    pub fn invalidate_all_scopes(&self, patterns: &[KeyPattern]) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let mut hit = 0;
        for (key, entry) in entries.iter_mut() {
            if patterns.iter().any(|p| p.matches(key)) {
                entry.stale = true;
                entry.generation += 1;
                hit += 1;
            }
        }
        hit
    }

    /// Drop everything cached for a principal (logout).
    pub fn clear_scope(&self, scope: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|key, _| key.scope != scope);
        }
    }

    /// Drop superseded refresh tokens for a tag once a newer one is in use.
    pub fn evict_older_refresh(&self, scope: &str, tag: EntityTag, current: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|key, _| !(key.scope == scope && key.tag == tag && key.refresh < current));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
