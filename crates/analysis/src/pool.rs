//! Bounded worker pool consuming analysis jobs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use confab_session::keys::OUTBOUND_SOCKET;
use confab_session::{AIJob, SessionId, SessionManager};
use confab_signal::WireMessage;
use confab_storage::ProjectStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{Analyzer, Result};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 5,
        }
    }
}

/// At-most-one-analysis-per-session bookkeeping. `try_begin` is
/// non-blocking on purpose: a loser means another worker already covers
/// the session, so the job is dropped and the coalescer will poke again.
#[derive(Default)]
struct InFlight {
    sessions: Mutex<HashSet<SessionId>>,
}

impl InFlight {
    fn try_begin(owner: &Arc<Self>, session_id: SessionId) -> Option<InFlightGuard> {
        let inserted = owner
            .sessions
            .lock()
            .expect("in-flight mutex poisoned")
            .insert(session_id);
        inserted.then(|| InFlightGuard {
            owner: Arc::clone(owner),
            session_id,
        })
    }
}

struct InFlightGuard {
    owner: Arc<InFlight>,
    session_id: SessionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner
            .sessions
            .lock()
            .expect("in-flight mutex poisoned")
            .remove(&self.session_id);
    }
}

/// Runs long analyzer calls off the session scheduler with bounded total
/// concurrency. Started once at boot.
pub struct WorkerPool {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `config.workers` workers over the shared job queue. The
    /// matching sender lives in the session manager's coalescer handlers;
    /// create both ends with `tokio::sync::mpsc::channel(config.queue_capacity)`.
    pub fn start(
        config: PoolConfig,
        job_rx: mpsc::Receiver<AIJob>,
        analyzer: Arc<dyn Analyzer>,
        manager: Arc<SessionManager>,
        store: Arc<dyn ProjectStore>,
    ) -> Self {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let shared_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let in_flight = Arc::new(InFlight::default());

        for worker in 0..config.workers {
            tracker.spawn(worker_loop(
                worker,
                Arc::clone(&shared_rx),
                Arc::clone(&in_flight),
                Arc::clone(&analyzer),
                Arc::clone(&manager),
                Arc::clone(&store),
                cancel.clone(),
            ));
        }
        tracker.close();

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            analyzer = analyzer.name(),
            "analysis worker pool started"
        );
        Self { tracker, cancel }
    }

    /// Drain queued jobs, then stop every worker and wait for them.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
        tracing::info!("analysis worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    shared_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AIJob>>>,
    in_flight: Arc<InFlight>,
    analyzer: Arc<dyn Analyzer>,
    manager: Arc<SessionManager>,
    store: Arc<dyn ProjectStore>,
    cancel: CancellationToken,
) {
    loop {
        // Pending work first so `stop` drains the queue before exiting.
        let job = {
            let mut rx = shared_rx.lock().await;
            match rx.try_recv() {
                Ok(job) => Some(job),
                Err(_) => None,
            }
        };
        let job = match job {
            Some(job) => job,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = async { shared_rx.lock().await.recv().await } => match job {
                        Some(job) => job,
                        None => break,
                    },
                }
            }
        };

        let Some(_guard) = InFlight::try_begin(&in_flight, job.session_id) else {
            tracing::debug!(
                worker,
                session_id = %job.session_id,
                "analysis already in flight for session, dropping job"
            );
            continue;
        };

        if let Err(error) = process_job(&job, &analyzer, &manager, &store).await {
            // Best-effort: the job is lost, the worker lives on.
            tracing::error!(
                worker,
                session_id = %job.session_id,
                project_id = %job.project_id,
                %error,
                "analysis job failed"
            );
        }
    }
}

async fn process_job(
    job: &AIJob,
    analyzer: &Arc<dyn Analyzer>,
    manager: &Arc<SessionManager>,
    store: &Arc<dyn ProjectStore>,
) -> Result<()> {
    let transcripts = {
        let store = Arc::clone(store);
        let project_id = job.project_id;
        tokio::task::spawn_blocking(move || store.transcripts_for_project(project_id)).await??
    };
    if transcripts.is_empty() {
        return Ok(());
    }
    let transcript_text = transcripts
        .iter()
        .map(|row| row.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let suggestions = analyzer.analyze(job.project_id, &transcript_text).await?;

    // The session may have ended mid-analysis; suggestions still persist,
    // the push is best-effort.
    let socket = match manager.get(job.session_id, OUTBOUND_SOCKET).await {
        Ok(socket) => socket,
        Err(_) => None,
    };

    for suggestion in suggestions {
        {
            let store = Arc::clone(store);
            let project_id = job.project_id;
            let text = suggestion.question_text.clone();
            let span = suggestion.grounding_span.clone();
            tokio::task::spawn_blocking(move || {
                store.append_analysis(project_id, &text, span.as_deref())
            })
            .await??;
        }
        if let Some(socket) = &socket {
            if let Err(error) = socket
                .send(WireMessage::ai_result(suggestion.question_text.clone()))
                .await
            {
                tracing::warn!(
                    session_id = %job.session_id,
                    %error,
                    "could not push ai_result to session socket"
                );
            }
        }
    }
    Ok(())
}
