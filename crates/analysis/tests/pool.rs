//! Worker pool invariants: de-duplication, isolation, drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use confab_analysis::{
    AIResult, AnalysisError, Analyzer, PoolConfig, ScriptedAnalyzer, Suggestion, WorkerPool,
};
use confab_session::keys::OUTBOUND_SOCKET;
use confab_session::{
    AIJob, CoalescerConfig, ProjectId, SessionContext, SessionManager, SessionId, UserId,
};
use confab_signal::{Envelope, MessageTransport, OutboundSocket, SignalError, WireMessage};
use confab_storage::{Database, ProjectStore};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<String>>,
}

impl MockTransport {
    fn ai_results(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|text| match Envelope::decode(text).unwrap().message {
                WireMessage::AiResult { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn send_text(&self, text: String) -> Result<(), SignalError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn receive_text(&self) -> Result<Option<String>, SignalError> {
        Ok(None)
    }

    async fn close(&self) -> Result<(), SignalError> {
        Ok(())
    }
}

struct Fixture {
    manager: Arc<SessionManager>,
    store: Arc<dyn ProjectStore>,
    job_tx: mpsc::Sender<AIJob>,
    job_rx: Option<mpsc::Receiver<AIJob>>,
    ctx: SessionContext,
    transport: Arc<MockTransport>,
    project: ProjectId,
}

async fn fixture() -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let user = UserId::generate();
    db.upsert_user(user, "Pool Test", "oidc|pool").unwrap();
    let project = db.create_project("Interview", user).unwrap();
    db.append_transcript(user, SessionId::generate(), project, "we shipped the rewrite")
        .unwrap();

    let (job_tx, job_rx) = mpsc::channel(8);
    let manager = SessionManager::new(
        Vec::new(),
        job_tx.clone(),
        CoalescerConfig {
            word_threshold: 1_000,
            window: Duration::from_secs(3600),
        },
    );
    let ctx = manager.new_session(user, project).await;
    let transport = Arc::new(MockTransport::default());
    ctx.register(OUTBOUND_SOCKET, OutboundSocket::start(transport.clone()))
        .await
        .unwrap();

    Fixture {
        manager,
        store: db,
        job_tx,
        job_rx: Some(job_rx),
        ctx,
        transport,
        project,
    }
}

struct LatchAnalyzer {
    entered: Arc<AtomicUsize>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl Analyzer for LatchAnalyzer {
    fn name(&self) -> &'static str {
        "latch"
    }

    async fn analyze(&self, _project: ProjectId, _transcript: &str) -> Result<AIResult, AnalysisError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![Suggestion {
            question_text: "What changed after the rewrite?".to_string(),
            grounding_span: Some("we shipped the rewrite".to_string()),
        }])
    }
}

#[tokio::test]
async fn test_same_session_jobs_deduplicate_to_one_analysis() {
    let mut fx = fixture().await;
    let (gate_tx, gate_rx) = watch::channel(false);
    let entered = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));
    let analyzer = Arc::new(LatchAnalyzer {
        entered: entered.clone(),
        concurrent: Arc::new(AtomicUsize::new(0)),
        max_concurrent: max_concurrent.clone(),
        gate: gate_rx,
    });

    let pool = WorkerPool::start(
        PoolConfig::default(),
        fx.job_rx.take().unwrap(),
        analyzer,
        fx.manager.clone(),
        fx.store.clone(),
    );

    let job = AIJob {
        session_id: fx.ctx.session_id(),
        project_id: fx.project,
    };
    for _ in 0..5 {
        fx.job_tx.send(job).await.unwrap();
    }

    // Workers race the queue; only one may enter the analyzer, the other
    // four jobs hit the in-flight check and drop.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 1);

    gate_tx.send(true).unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    assert_eq!(fx.transport.ai_results().len(), 1);

    // The in-flight slot was released: a fresh poke analyzes again.
    fx.job_tx.send(job).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 2);

    pool.stop().await;
}

struct FlakyAnalyzer {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Analyzer for FlakyAnalyzer {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn analyze(&self, _project: ProjectId, _transcript: &str) -> Result<AIResult, AnalysisError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(AnalysisError::Analyzer("model overloaded".to_string()));
        }
        Ok(vec![Suggestion {
            question_text: "Second attempt question".to_string(),
            grounding_span: None,
        }])
    }
}

#[tokio::test]
async fn test_analyzer_failure_does_not_kill_workers() {
    let mut fx = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::start(
        PoolConfig {
            workers: 1,
            queue_capacity: 5,
        },
        fx.job_rx.take().unwrap(),
        Arc::new(FlakyAnalyzer {
            calls: calls.clone(),
        }),
        fx.manager.clone(),
        fx.store.clone(),
    );

    let job = AIJob {
        session_id: fx.ctx.session_id(),
        project_id: fx.project,
    };

    fx.job_tx.send(job).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(fx.transport.ai_results().is_empty());

    // The worker survived the failed job and serves the next one.
    fx.job_tx.send(job).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.transport.ai_results(), vec!["Second attempt question"]);

    pool.stop().await;
}

#[tokio::test]
async fn test_stop_drains_queued_jobs() {
    let mut fx = fixture().await;
    let pool = WorkerPool::start(
        PoolConfig {
            workers: 2,
            queue_capacity: 5,
        },
        fx.job_rx.take().unwrap(),
        Arc::new(ScriptedAnalyzer::default()),
        fx.manager.clone(),
        fx.store.clone(),
    );

    // Two distinct sessions, so de-duplication does not apply.
    let other = fx
        .manager
        .new_session(UserId::generate(), fx.project)
        .await;
    let transport = Arc::new(MockTransport::default());
    other
        .register(OUTBOUND_SOCKET, OutboundSocket::start(transport.clone()))
        .await
        .unwrap();

    fx.job_tx
        .send(AIJob {
            session_id: fx.ctx.session_id(),
            project_id: fx.project,
        })
        .await
        .unwrap();
    fx.job_tx
        .send(AIJob {
            session_id: other.session_id(),
            project_id: fx.project,
        })
        .await
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    timeout(Duration::from_secs(2), pool.stop())
        .await
        .expect("stop must settle");

    // Both jobs ran: one suggestion row each.
    let rows = fx.store.analyses_for_project(fx.project).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(fx.transport.ai_results().len(), 1);
    assert_eq!(transport.ai_results().len(), 1);
}
