//! The session context manager: lifecycle, resource registration, fan-out.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use confab_audio::AudioChunk;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::coalesce::{CoalescerConfig, FragmentSender, TextCoalescer};
use crate::{
    AudioConsumer, ProjectId, ResourceKey, Result, SessionError, SessionId, TranscriptId, UserId,
};

/// A payload-free poke: "consider analyzing this session's project now."
/// Workers re-read durable transcripts, so nothing else needs to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AIJob {
    pub session_id: SessionId,
    pub project_id: ProjectId,
}

/// Immutable per-session facts, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct SessionData {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

type StoreKey = (SessionId, &'static str);
type StoredValue = Arc<dyn Any + Send + Sync>;

struct SessionScope {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    store: HashMap<StoreKey, StoredValue>,
    store_keys: HashMap<SessionId, Vec<StoreKey>>,
    /// Wake channels for `get_or_wait`; created lazily under the lock,
    /// awaited outside it.
    wakers: HashMap<StoreKey, watch::Sender<bool>>,
    session_data: HashMap<SessionId, SessionData>,
    active: HashSet<SessionId>,
    scopes: HashMap<SessionId, SessionScope>,
    coalescers: HashMap<SessionId, FragmentSender>,
    /// Sessions whose audio pipeline is currently live.
    audio_active: HashSet<SessionId>,
    /// Teardown waits on these while an audio finalizer is in flight.
    audio_drained: HashMap<SessionId, watch::Sender<bool>>,
}

/// Process-wide owner of live session state.
///
/// One instance per process, created at startup and handed to request
/// handlers by reference. A single async mutex guards the maps; nothing
/// `await`s while holding it except the lock acquisition itself.
pub struct SessionManager {
    /// Self-handle for minting [`SessionContext`]s from `&self` methods.
    me: Weak<SessionManager>,
    inner: Mutex<Inner>,
    consumers: Vec<Arc<dyn AudioConsumer>>,
    job_tx: mpsc::Sender<AIJob>,
    coalescer_config: CoalescerConfig,
}

impl SessionManager {
    pub fn new(
        consumers: Vec<Arc<dyn AudioConsumer>>,
        job_tx: mpsc::Sender<AIJob>,
        coalescer_config: CoalescerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(Inner::default()),
            consumers,
            job_tx,
            coalescer_config,
        })
    }

    fn handle(&self) -> Arc<SessionManager> {
        self.me.upgrade().expect("session manager dropped while in use")
    }

    /// Open a session: allocate an id, publish it as active, and start the
    /// coalescer loop inside the session's task scope.
    pub async fn new_session(
        &self,
        user_id: UserId,
        project_id: ProjectId,
    ) -> SessionContext {
        let session_id = SessionId::generate();
        let coalescer = TextCoalescer::new(self.coalescer_config);
        let fragments = coalescer.sender();

        let tracker = TaskTracker::new();
        {
            let mut inner = self.inner.lock().await;
            inner.session_data.insert(
                session_id,
                SessionData {
                    project_id,
                    user_id,
                    created_at: Utc::now(),
                },
            );
            inner.scopes.insert(
                session_id,
                SessionScope {
                    tracker: tracker.clone(),
                    cancel: CancellationToken::new(),
                },
            );
            inner.coalescers.insert(session_id, fragments);
            inner.active.insert(session_id);
        }

        let job_tx = self.job_tx.clone();
        tracker.spawn(coalescer.run(move |transcript_id: TranscriptId| {
            let job_tx = job_tx.clone();
            async move {
                tracing::debug!(
                    session_id = %session_id,
                    transcript_id = %transcript_id,
                    "coalescer flush, submitting analysis job"
                );
                job_tx
                    .send(AIJob {
                        session_id,
                        project_id,
                    })
                    .await
                    .map_err(|_| SessionError::AnalysisQueueClosed)
            }
        }));

        tracing::info!(session_id = %session_id, project_id = %project_id, "session opened");

        SessionContext {
            manager: self.handle(),
            session_id,
        }
    }

    /// Re-create a context handle for a known session id.
    pub fn context(&self, session_id: SessionId) -> SessionContext {
        SessionContext {
            manager: self.handle(),
            session_id,
        }
    }

    pub async fn is_active(&self, session_id: SessionId) -> bool {
        self.inner.lock().await.active.contains(&session_id)
    }

    pub async fn active_session_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn session_data(&self, session_id: SessionId) -> Result<SessionData> {
        let inner = self.inner.lock().await;
        inner
            .session_data
            .get(&session_id)
            .copied()
            .ok_or(SessionError::NotActive(session_id))
    }

    /// Bind `value` under `key`. Fails if the session is not active or the
    /// key is already bound; on success wakes tasks blocked in
    /// [`Self::get_or_wait`].
    pub async fn register<T: Send + Sync + 'static>(
        &self,
        session_id: SessionId,
        key: ResourceKey<T>,
        value: T,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.active.contains(&session_id) {
            return Err(SessionError::NotActive(session_id));
        }
        let store_key = (session_id, key.name());
        if inner.store.contains_key(&store_key) {
            return Err(SessionError::AlreadyRegistered {
                session_id,
                key: key.name(),
            });
        }

        inner.store.insert(store_key, Arc::new(value));
        inner
            .store_keys
            .entry(session_id)
            .or_default()
            .push(store_key);
        if let Some(waker) = inner.wakers.get(&store_key) {
            let _ = waker.send(true);
        }
        Ok(())
    }

    /// Look up a bound value. `Ok(None)` means "not (yet) registered".
    pub async fn get<T: Send + Sync + 'static>(
        &self,
        session_id: SessionId,
        key: ResourceKey<T>,
    ) -> Result<Option<Arc<T>>> {
        let inner = self.inner.lock().await;
        if !inner.active.contains(&session_id) {
            return Err(SessionError::NotActive(session_id));
        }
        match inner.store.get(&(session_id, key.name())) {
            None => Ok(None),
            Some(value) => downcast(value.clone(), key.name()).map(Some),
        }
    }

    /// Like [`Self::get`], but blocks until the value is registered.
    /// Fails instead of hanging when the session is torn down.
    pub async fn get_or_wait<T: Send + Sync + 'static>(
        &self,
        session_id: SessionId,
        key: ResourceKey<T>,
    ) -> Result<Arc<T>> {
        let store_key = (session_id, key.name());
        let mut rx = {
            let mut inner = self.inner.lock().await;
            if !inner.active.contains(&session_id) {
                return Err(SessionError::NotActive(session_id));
            }
            if let Some(value) = inner.store.get(&store_key) {
                return downcast(value.clone(), key.name());
            }
            inner
                .wakers
                .entry(store_key)
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };

        loop {
            {
                let inner = self.inner.lock().await;
                if let Some(value) = inner.store.get(&store_key) {
                    return downcast(value.clone(), key.name());
                }
                if !inner.active.contains(&session_id) {
                    return Err(SessionError::TornDown(session_id));
                }
            }
            if rx.changed().await.is_err() {
                // Waker dropped without a value: the session is gone.
                let inner = self.inner.lock().await;
                return match inner.store.get(&store_key) {
                    Some(value) => downcast(value.clone(), key.name()),
                    None => Err(SessionError::TornDown(session_id)),
                };
            }
        }
    }

    /// Deliver a chunk to every consumer in registration order.
    ///
    /// Delivery is serialized per session; a failing consumer loses this
    /// chunk but stays registered for the next one.
    pub async fn ingest_audio(&self, session_id: SessionId, chunk: &AudioChunk) -> Result<()> {
        if !self.is_active(session_id).await {
            return Err(SessionError::NotActive(session_id));
        }
        let ctx = self.context(session_id);
        for consumer in &self.consumers {
            if let Err(error) = consumer.on_chunk(&ctx, chunk).await {
                tracing::error!(
                    session_id = %session_id,
                    consumer = consumer.name(),
                    error = %error,
                    "audio consumer failed; chunk skipped for this consumer"
                );
            }
        }
        Ok(())
    }

    /// Run every consumer's finalizer. Errors are logged; all finalizers run.
    pub async fn finalize_consumers(&self, session_id: SessionId) {
        let ctx = self.context(session_id);
        for consumer in &self.consumers {
            if let Err(error) = consumer.on_finalize(&ctx).await {
                tracing::error!(
                    session_id = %session_id,
                    consumer = consumer.name(),
                    error = %error,
                    "audio consumer finalizer failed"
                );
            }
        }
    }

    /// Forward a finalized transcript fragment to the session's coalescer.
    pub async fn accept_transcript(
        &self,
        session_id: SessionId,
        text: String,
        transcript_id: TranscriptId,
    ) -> Result<()> {
        let sender = {
            let inner = self.inner.lock().await;
            inner
                .coalescers
                .get(&session_id)
                .cloned()
                .ok_or(SessionError::NotActive(session_id))?
        };
        sender
            .send((text, transcript_id))
            .await
            .map_err(|_| SessionError::NotActive(session_id))
    }

    /// Mark the session's audio pipeline live. Teardown will wait for the
    /// matching [`Self::clear_audio_active`] before removing resources.
    pub async fn set_audio_active(&self, session_id: SessionId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.active.contains(&session_id) {
            return Err(SessionError::NotActive(session_id));
        }
        inner.audio_active.insert(session_id);
        Ok(())
    }

    /// Audio pipeline finished (finalizers included); release teardown.
    pub async fn clear_audio_active(&self, session_id: SessionId) {
        let mut inner = self.inner.lock().await;
        inner.audio_active.remove(&session_id);
        if let Some(drained) = inner.audio_drained.get(&session_id) {
            let _ = drained.send(true);
        }
    }

    /// Session task scope handle for spawning and cancellation.
    pub async fn scope(&self, session_id: SessionId) -> Result<(TaskTracker, CancellationToken)> {
        let inner = self.inner.lock().await;
        inner
            .scopes
            .get(&session_id)
            .map(|scope| (scope.tracker.clone(), scope.cancel.clone()))
            .ok_or(SessionError::NotActive(session_id))
    }

    /// Tear the session down: wait for a closing audio stream, drop every
    /// registered resource (failing blocked waiters), cancel the task scope
    /// and wait for all session tasks to finish.
    pub async fn teardown(&self, session_id: SessionId) -> Result<()> {
        // Phase 1: if the audio pipeline is mid-close, wait for its
        // finalizers before dropping the resources they still need.
        let drain_rx = {
            let mut inner = self.inner.lock().await;
            if !inner.active.contains(&session_id) {
                return Err(SessionError::NotActive(session_id));
            }
            if inner.audio_active.contains(&session_id) {
                Some(
                    inner
                        .audio_drained
                        .entry(session_id)
                        .or_insert_with(|| watch::channel(false).0)
                        .subscribe(),
                )
            } else {
                None
            }
        };
        if let Some(mut rx) = drain_rx {
            // Err means the sender was dropped, which also implies drained.
            let _ = rx.changed().await;
        }

        // Phase 2: remove everything under the lock, waking waiters so they
        // observe the teardown instead of hanging.
        let scope = {
            let mut inner = self.inner.lock().await;
            for store_key in inner.store_keys.remove(&session_id).unwrap_or_default() {
                inner.store.remove(&store_key);
            }
            inner.wakers.retain(|(owner, _), waker| {
                if *owner == session_id {
                    let _ = waker.send(true);
                    false
                } else {
                    true
                }
            });
            inner.session_data.remove(&session_id);
            inner.active.remove(&session_id);
            inner.audio_active.remove(&session_id);
            inner.audio_drained.remove(&session_id);
            // Dropping the fragment sender lets the coalescer emit its
            // final flush and exit.
            inner.coalescers.remove(&session_id);
            inner.scopes.remove(&session_id)
        };

        // Phase 3: cancel and await every task in the session scope.
        if let Some(scope) = scope {
            scope.cancel.cancel();
            scope.tracker.close();
            scope.tracker.wait().await;
        }

        tracing::info!(session_id = %session_id, "session torn down");
        Ok(())
    }
}

fn downcast<T: Send + Sync + 'static>(value: StoredValue, key: &'static str) -> Result<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| SessionError::TypeMismatch { key })
}

/// A cheap per-session handle; everything forwards to the manager.
#[derive(Clone)]
pub struct SessionContext {
    manager: Arc<SessionManager>,
    session_id: SessionId,
}

impl SessionContext {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn is_active(&self) -> bool {
        self.manager.is_active(self.session_id).await
    }

    pub async fn data(&self) -> Result<SessionData> {
        self.manager.session_data(self.session_id).await
    }

    pub async fn register<T: Send + Sync + 'static>(
        &self,
        key: ResourceKey<T>,
        value: T,
    ) -> Result<()> {
        self.manager.register(self.session_id, key, value).await
    }

    pub async fn get<T: Send + Sync + 'static>(
        &self,
        key: ResourceKey<T>,
    ) -> Result<Option<Arc<T>>> {
        self.manager.get(self.session_id, key).await
    }

    pub async fn get_or_wait<T: Send + Sync + 'static>(
        &self,
        key: ResourceKey<T>,
    ) -> Result<Arc<T>> {
        self.manager.get_or_wait(self.session_id, key).await
    }

    pub async fn ingest_audio(&self, chunk: &AudioChunk) -> Result<()> {
        self.manager.ingest_audio(self.session_id, chunk).await
    }

    pub async fn finalize_consumers(&self) {
        self.manager.finalize_consumers(self.session_id).await
    }

    pub async fn accept_transcript(&self, text: String, transcript_id: TranscriptId) -> Result<()> {
        self.manager
            .accept_transcript(self.session_id, text, transcript_id)
            .await
    }

    pub async fn set_audio_active(&self) -> Result<()> {
        self.manager.set_audio_active(self.session_id).await
    }

    pub async fn clear_audio_active(&self) {
        self.manager.clear_audio_active(self.session_id).await
    }

    /// Spawn a task inside the session scope; teardown waits for it.
    pub async fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tracker, _) = self.manager.scope(self.session_id).await?;
        tracker.spawn(future);
        Ok(())
    }

    /// Token cancelled at teardown; session tasks should select on it.
    pub async fn cancellation_token(&self) -> Result<CancellationToken> {
        let (_, cancel) = self.manager.scope(self.session_id).await?;
        Ok(cancel)
    }

    pub async fn teardown(&self) -> Result<()> {
        self.manager.teardown(self.session_id).await
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .finish()
    }
}
