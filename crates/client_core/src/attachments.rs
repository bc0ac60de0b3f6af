//! Process-wide cache of fetched attachment bytes.
//!
//! Entries are keyed by (account, conversation, message). Concurrent callers
//! for a key share one in-flight fetch. Entries expire after a fixed TTL,
//! either at access time or by the periodic sweep, and their handles are
//! released. Failures are never cached.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use shared::domain::{AttachmentKey, AttachmentRef};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    api::{ConsoleApi, FetchedAttachment},
    config::{floor_period, SyncSettings},
    error::AttachmentFetchError,
};

const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
}

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let essence = mime_type.trim().to_ascii_lowercase();
        if essence.starts_with("image/") {
            Self::Image
        } else if essence.starts_with("video/") {
            Self::Video
        } else if essence.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Document
        }
    }

    /// Kind implied by a message-carried hint: the declared mime type, else
    /// a guess from the file name.
    pub fn from_hint(hint: &AttachmentRef) -> Option<Self> {
        if let Some(mime_type) = hint.mime_type.as_deref().filter(|m| !m.is_empty()) {
            return Some(Self::from_mime(mime_type));
        }
        let file_name = hint.file_name.as_deref()?;
        mime_guess::from_path(file_name)
            .first()
            .map(|mime| Self::from_mime(mime.essence_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(u64);

#[derive(Debug)]
pub struct AttachmentResource {
    pub handle: ResourceHandle,
    pub mime_type: String,
    pub kind: AttachmentKind,
    pub size_bytes: usize,
}

#[derive(Debug, Clone)]
pub enum AttachmentState {
    Loading,
    Ready(Arc<AttachmentResource>),
    Error(AttachmentFetchError),
}

#[derive(Debug, Clone)]
pub struct AttachmentStatus {
    pub state: AttachmentState,
    pub kind: Option<AttachmentKind>,
}

pub type FetchResult = Result<Arc<AttachmentResource>, AttachmentFetchError>;
type PendingFetch = Shared<BoxFuture<'static, FetchResult>>;

#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, key: &AttachmentKey) -> anyhow::Result<FetchedAttachment>;
}

/// Fetches attachment bytes through the console API.
pub struct ApiAttachmentFetcher {
    api: Arc<dyn ConsoleApi>,
}

impl ApiAttachmentFetcher {
    pub fn new(api: Arc<dyn ConsoleApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl AttachmentFetcher for ApiAttachmentFetcher {
    async fn fetch(&self, key: &AttachmentKey) -> anyhow::Result<FetchedAttachment> {
        self.api.fetch_attachment(key).await
    }
}

struct CacheEntry {
    resource: Arc<AttachmentResource>,
    fetched_at: Instant,
}

enum Slot {
    Ready(CacheEntry),
    Loading(PendingFetch),
}

enum Lookup {
    Hit(Arc<AttachmentResource>),
    InFlight(PendingFetch),
    Miss,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<AttachmentKey, Slot>,
    failures: HashMap<AttachmentKey, AttachmentFetchError>,
    blobs: HashMap<ResourceHandle, Bytes>,
    next_handle: u64,
    closed: bool,
}

impl CacheState {
    fn release(&mut self, handle: ResourceHandle) {
        self.blobs.remove(&handle);
    }

    fn store(&mut self, key: AttachmentKey, fetched: FetchedAttachment) -> Arc<AttachmentResource> {
        self.next_handle += 1;
        let handle = ResourceHandle(self.next_handle);
        let mime_type = fetched
            .mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string());
        let resource = Arc::new(AttachmentResource {
            handle,
            kind: AttachmentKind::from_mime(&mime_type),
            mime_type,
            size_bytes: fetched.bytes.len(),
        });
        self.blobs.insert(handle, fetched.bytes);
        self.slots.insert(
            key,
            Slot::Ready(CacheEntry {
                resource: Arc::clone(&resource),
                fetched_at: Instant::now(),
            }),
        );
        resource
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AttachmentCache {
    fetcher: Arc<dyn AttachmentFetcher>,
    ttl: Duration,
    state: Arc<Mutex<CacheState>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AttachmentCache {
    /// Creates the cache and starts its sweep timer. Pair with `shutdown`.
    pub fn start(
        fetcher: Arc<dyn AttachmentFetcher>,
        ttl: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let sweep_interval = floor_period("attachment sweep interval", sweep_interval);
        let ttl = floor_period("attachment ttl", ttl);
        let cache = Arc::new(Self {
            fetcher,
            ttl,
            state: Arc::new(Mutex::new(CacheState::default())),
            sweeper: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&cache);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!(evicted, "attachment sweep released expired entries");
                }
            }
        });
        *cache.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
        cache
    }

    pub fn from_settings(fetcher: Arc<dyn AttachmentFetcher>, settings: &SyncSettings) -> Arc<Self> {
        Self::start(
            fetcher,
            settings.attachment_ttl,
            settings.attachment_sweep_interval,
        )
    }

    /// Returns the cached resource or joins/starts the single fetch for `key`.
    pub async fn request(&self, key: &AttachmentKey) -> FetchResult {
        let pending = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(AttachmentFetchError {
                    key: key.clone(),
                    reason: "attachment cache is shut down".into(),
                });
            }
            match self.lookup_locked(&mut state, key) {
                Lookup::Hit(resource) => return Ok(resource),
                Lookup::InFlight(pending) => pending,
                Lookup::Miss => self.start_fetch_locked(&mut state, key),
            }
        };
        pending.await
    }

    /// Non-blocking status for the rendering layer. Starts a fetch when
    /// nothing is cached; a remembered failure is reported until the caller
    /// retries through `request`.
    pub fn resolve(&self, key: &AttachmentKey, hint: Option<&AttachmentRef>) -> AttachmentStatus {
        let hinted_kind = hint.and_then(AttachmentKind::from_hint);
        if key.message_id.is_provisional() {
            return AttachmentStatus {
                state: AttachmentState::Loading,
                kind: hinted_kind,
            };
        }

        let mut state = lock(&self.state);
        if state.closed {
            return AttachmentStatus {
                state: AttachmentState::Error(AttachmentFetchError {
                    key: key.clone(),
                    reason: "attachment cache is shut down".into(),
                }),
                kind: hinted_kind,
            };
        }
        match self.lookup_locked(&mut state, key) {
            Lookup::Hit(resource) => AttachmentStatus {
                kind: Some(resource.kind),
                state: AttachmentState::Ready(resource),
            },
            Lookup::InFlight(_) => AttachmentStatus {
                state: AttachmentState::Loading,
                kind: hinted_kind,
            },
            Lookup::Miss => match state.failures.get(key).cloned() {
                Some(error) => AttachmentStatus {
                    state: AttachmentState::Error(error),
                    kind: hinted_kind,
                },
                None => {
                    drop(self.start_fetch_locked(&mut state, key));
                    AttachmentStatus {
                        state: AttachmentState::Loading,
                        kind: hinted_kind,
                    }
                }
            },
        }
    }

    /// Bytes behind a handle, or `None` once the handle has been released.
    pub fn read(&self, handle: ResourceHandle) -> Option<Bytes> {
        lock(&self.state).blobs.get(&handle).cloned()
    }

    pub fn live_handles(&self) -> usize {
        lock(&self.state).blobs.len()
    }

    pub fn cached_entries(&self) -> usize {
        lock(&self.state)
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Evicts every entry older than the TTL. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let expired: Vec<(AttachmentKey, ResourceHandle)> = state
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(entry) if now.duration_since(entry.fetched_at) >= self.ttl => {
                    Some((key.clone(), entry.resource.handle))
                }
                _ => None,
            })
            .collect();
        for (key, handle) in &expired {
            state.slots.remove(key);
            state.release(*handle);
        }
        expired.len()
    }

    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the sweep timer and releases every handle. Fetches still in
    /// flight complete for their waiters but are not stored.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        let mut state = lock(&self.state);
        state.closed = true;
        state.slots.clear();
        state.failures.clear();
        state.blobs.clear();
        info!("attachment cache shut down");
    }

    fn lookup_locked(&self, state: &mut CacheState, key: &AttachmentKey) -> Lookup {
        let expired_handle = match state.slots.get(key) {
            None => return Lookup::Miss,
            Some(Slot::Loading(pending)) => return Lookup::InFlight(pending.clone()),
            Some(Slot::Ready(entry)) => {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Lookup::Hit(Arc::clone(&entry.resource));
                }
                entry.resource.handle
            }
        };
        debug!(%key, "attachment entry expired at access");
        state.slots.remove(key);
        state.release(expired_handle);
        Lookup::Miss
    }

    fn start_fetch_locked(&self, state: &mut CacheState, key: &AttachmentKey) -> PendingFetch {
        state.failures.remove(key);

        let fetcher = Arc::clone(&self.fetcher);
        let shared_state = Arc::clone(&self.state);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let result = fetcher.fetch(&task_key).await;
            let mut state = lock(&shared_state);
            if state.closed {
                return Err(AttachmentFetchError {
                    key: task_key,
                    reason: "attachment cache is shut down".into(),
                });
            }
            match result {
                Ok(fetched) => Ok(state.store(task_key, fetched)),
                Err(err) => {
                    warn!(key = %task_key, "attachment fetch failed: {err:#}");
                    state.slots.remove(&task_key);
                    let error = AttachmentFetchError {
                        key: task_key.clone(),
                        reason: format!("{err:#}"),
                    };
                    state.failures.insert(task_key, error.clone());
                    Err(error)
                }
            }
        });

        let join_key = key.clone();
        let pending = async move {
            task.await.unwrap_or_else(|join_err| {
                Err(AttachmentFetchError {
                    key: join_key,
                    reason: format!("attachment fetch task failed: {join_err}"),
                })
            })
        }
        .boxed()
        .shared();
        state
            .slots
            .insert(key.clone(), Slot::Loading(pending.clone()));
        pending
    }
}

impl Drop for AttachmentCache {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/attachments_tests.rs"]
mod tests;
