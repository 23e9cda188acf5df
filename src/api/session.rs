// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-destination state: one reused client plus the lock serialising its
/// use.
struct SessionEntry {
    client: reqwest::Client,
    lock: Arc<AsyncMutex<()>>,
    in_use: AtomicBool,
}

/// Hands out one HTTP client per destination key and serialises concurrent
/// use of the same key.
///
/// `get` blocks while another holder of the same key is mid-request, which
/// bounds parallelism to one in-flight request per destination. Clients are
/// created lazily and live until process teardown. The map shard lock is
/// released before the per-entry lock is awaited, so contention on one
/// destination never stalls the others.
pub struct HttpSessionProvider {
    entries: DashMap<String, Arc<SessionEntry>>,
}

static PROVIDER: Lazy<HttpSessionProvider> = Lazy::new(|| HttpSessionProvider {
    entries: DashMap::new(),
});

/// Exclusive use of one destination's client; dropping it unblocks the next
/// waiter for the same key.
pub struct SessionHandle {
    entry: Arc<SessionEntry>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionHandle {
    pub fn client(&self) -> &reqwest::Client {
        &self.entry.client
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.entry.in_use.store(false, Ordering::SeqCst);
    }
}

impl HttpSessionProvider {
    /// The process-wide provider instance.
    pub fn global() -> &'static HttpSessionProvider {
        &PROVIDER
    }

    fn entry(&self, key: &str) -> Result<Arc<SessionEntry>> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.value().clone());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("cannot create HTTP client")?;
        let entry = Arc::new(SessionEntry {
            client,
            lock: Arc::new(AsyncMutex::new(())),
            in_use: AtomicBool::new(false),
        });
        // the first racing insert wins; use whatever ends up in the map
        Ok(self
            .entries
            .entry(key.to_string())
            .or_insert(entry)
            .value()
            .clone())
    }

    /// Acquires the client for `key`, waiting for any current holder to
    /// return it first.
    pub async fn get(&self, key: &str) -> Result<SessionHandle> {
        let entry = self.entry(key)?;
        let guard = Arc::clone(&entry.lock).lock_owned().await;
        entry.in_use.store(true, Ordering::SeqCst);
        Ok(SessionHandle {
            entry,
            _guard: guard,
        })
    }

    /// Whether some caller currently holds the client for `key`.
    pub fn in_use(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.in_use.load(Ordering::SeqCst))
    }
}
