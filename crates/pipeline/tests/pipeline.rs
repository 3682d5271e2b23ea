//! End-to-end pipeline tests with scripted sources and consumers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use confab_audio::{AudioChunk, DecodedFrame};
use confab_pipeline::{
    run_track, PipelineConfig, RecordingConsumer, TrackSource, TranscriberConsumer,
};
use confab_session::keys::OUTBOUND_SOCKET;
use confab_session::{
    AudioConsumer, CoalescerConfig, ConsumerError, ProjectId, SessionContext, SessionManager,
    UserId,
};
use confab_signal::{Envelope, MessageTransport, OutboundSocket, SignalError, WireMessage};
use confab_storage::{Database, ProjectStore};
use confab_stt::{FinalSegment, RecognizerFactory, SttError, StreamingRecognizer};
use tokio::sync::mpsc;

struct VecSource {
    frames: std::vec::IntoIter<DecodedFrame>,
}

impl VecSource {
    fn new(frames: Vec<DecodedFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

#[async_trait]
impl TrackSource for VecSource {
    async fn next_frame(&mut self) -> confab_audio::Result<Option<DecodedFrame>> {
        Ok(self.frames.next())
    }
}

enum Event {
    Chunk(AudioChunk),
    Finalize,
}

#[derive(Clone)]
struct ScriptedConsumer {
    events: Arc<Mutex<Vec<Event>>>,
}

impl ScriptedConsumer {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl AudioConsumer for ScriptedConsumer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn on_chunk(
        &self,
        _ctx: &SessionContext,
        chunk: &AudioChunk,
    ) -> Result<(), ConsumerError> {
        self.events.lock().unwrap().push(Event::Chunk(chunk.clone()));
        Ok(())
    }

    async fn on_finalize(&self, _ctx: &SessionContext) -> Result<(), ConsumerError> {
        self.events.lock().unwrap().push(Event::Finalize);
        Ok(())
    }
}

fn manager_with(
    consumers: Vec<Arc<dyn AudioConsumer>>,
) -> Arc<SessionManager> {
    let (job_tx, _job_rx) = mpsc::channel(8);
    // Receiver is dropped; coalescer flushes fail, which the loop absorbs.
    SessionManager::new(
        consumers,
        job_tx,
        CoalescerConfig {
            word_threshold: 1_000,
            window: Duration::from_secs(3600),
        },
    )
}

async fn open_session(manager: &Arc<SessionManager>) -> SessionContext {
    manager
        .new_session(UserId::generate(), ProjectId::generate())
        .await
}

fn mono_frame(value: i16, samples: usize, rate: u32) -> DecodedFrame {
    DecodedFrame::mono(vec![value; samples], rate)
}

#[tokio::test]
async fn test_buffer_flushes_at_frame_threshold() {
    let consumer = ScriptedConsumer::new();
    let manager = manager_with(vec![Arc::new(consumer.clone())]);
    let ctx = open_session(&manager).await;

    let frames: Vec<DecodedFrame> = (0..250)
        .map(|i| mono_frame(i as i16, 16, 48000))
        .collect();
    run_track(ctx.clone(), VecSource::new(frames), PipelineConfig::new(48000)).await;

    let events = consumer.events.lock().unwrap();
    let chunk_sizes: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            Event::Chunk(chunk) => Some(chunk.frames.len()),
            Event::Finalize => None,
        })
        .collect();
    assert_eq!(chunk_sizes, vec![100, 100, 50]);

    // Finalize arrives exactly once, after the last chunk.
    assert!(matches!(events.last(), Some(Event::Finalize)));
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::Finalize)).count(),
        1
    );

    // Chunk payloads preserve frame order end to end.
    let all_samples: Vec<i16> = events
        .iter()
        .filter_map(|e| match e {
            Event::Chunk(chunk) => Some(chunk.concat()),
            Event::Finalize => None,
        })
        .flatten()
        .collect();
    let expected: Vec<i16> = (0..250).flat_map(|i| vec![i as i16; 16]).collect();
    assert_eq!(all_samples, expected);

    ctx.teardown().await.unwrap();
}

#[tokio::test]
async fn test_stereo_input_normalizes_to_mono_at_target_rate() {
    let consumer = ScriptedConsumer::new();
    let manager = manager_with(vec![Arc::new(consumer.clone())]);
    let ctx = open_session(&manager).await;

    // Interleaved stereo at half the target rate.
    let frames: Vec<DecodedFrame> = (0..20)
        .map(|_| DecodedFrame {
            samples: vec![1000; 960],
            channels: 2,
            sample_rate: 24000,
            interleaved: true,
        })
        .collect();
    run_track(ctx.clone(), VecSource::new(frames), PipelineConfig::new(48000)).await;

    let events = consumer.events.lock().unwrap();
    let mut total = 0usize;
    for event in events.iter() {
        if let Event::Chunk(chunk) = event {
            assert_eq!(chunk.sample_rate_hz, 48000);
            assert_eq!(chunk.channels, 1);
            total += chunk.sample_count();
        }
    }
    // 20 frames × 480 mono samples upsampled ×2, within a resampler
    // chunk of tolerance.
    let expected = 20 * 480 * 2;
    assert!(
        (total as i64 - expected as i64).unsigned_abs() < 1024,
        "got {total}, expected ~{expected}"
    );

    ctx.teardown().await.unwrap();
}

#[tokio::test]
async fn test_recording_consumer_writes_valid_wav() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(vec![Arc::new(RecordingConsumer::new(dir.path(), 16000))]);
    let ctx = open_session(&manager).await;

    let frames: Vec<DecodedFrame> = (1..=5i16)
        .map(|i| mono_frame(i * 100, 320, 16000))
        .collect();
    run_track(ctx.clone(), VecSource::new(frames), PipelineConfig::new(16000)).await;

    let path = dir
        .path()
        .join(format!("recording-{}.wav", ctx.session_id()));
    let mut reader = hound::WavReader::open(&path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    let expected: Vec<i16> = (1..=5i16).flat_map(|i| vec![i * 100; 320]).collect();
    assert_eq!(samples, expected);

    ctx.teardown().await.unwrap();
}

// --- Transcriber consumer with a scripted recognizer -----------------------

struct EchoRecognizer {
    counter: AtomicUsize,
    events: Mutex<Option<mpsc::Sender<FinalSegment>>>,
}

#[async_trait]
impl StreamingRecognizer for EchoRecognizer {
    async fn accept_pcm(&self, _samples: &[i16]) -> Result<(), SttError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let sender = self.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender
                .send(FinalSegment {
                    text: format!("segment {n}"),
                    speaker: None,
                })
                .await;
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<(), SttError> {
        let sender = self.events.lock().unwrap().take();
        if let Some(sender) = sender {
            let _ = sender
                .send(FinalSegment {
                    text: "closing words".to_string(),
                    speaker: None,
                })
                .await;
        }
        Ok(())
    }
}

struct EchoFactory;

#[async_trait]
impl RecognizerFactory for EchoFactory {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn create(
        &self,
        _sample_rate: u32,
    ) -> Result<(Arc<dyn StreamingRecognizer>, mpsc::Receiver<FinalSegment>), SttError> {
        let (tx, rx) = mpsc::channel(16);
        Ok((
            Arc::new(EchoRecognizer {
                counter: AtomicUsize::new(0),
                events: Mutex::new(Some(tx)),
            }),
            rx,
        ))
    }
}

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<String>>,
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

#[tokio::test]
async fn test_transcriber_accept_path_notifies_and_persists() {
    let db: Arc<dyn ProjectStore> = Arc::new(Database::open_in_memory().unwrap());
    let user = UserId::generate();
    db.upsert_user(user, "Test User", "oidc|test").unwrap();
    let project = db.create_project("Interview", user).unwrap();

    let manager = manager_with(vec![Arc::new(TranscriberConsumer::new(
        Arc::new(EchoFactory),
        Arc::clone(&db),
    ))]);
    let ctx = manager.new_session(user, project).await;

    let transport = Arc::new(MockTransport::default());
    ctx.register(OUTBOUND_SOCKET, OutboundSocket::start(transport.clone()))
        .await
        .unwrap();

    // Three single-frame chunks, then stream end.
    let frames: Vec<DecodedFrame> = (0..3).map(|_| mono_frame(7, 480, 48000)).collect();
    run_track(ctx.clone(), VecSource::new(frames), {
        let mut config = PipelineConfig::new(48000);
        config.flush_frames = 1;
        config
    })
    .await;

    // All finalized segments (3 chunks + the closing flush) are persisted
    // in order.
    let rows = db.transcripts_for_project(project).unwrap();
    let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["segment 0", "segment 1", "segment 2", "closing words"]
    );
    assert!(rows.iter().all(|r| r.session_id == ctx.session_id()));

    // And each one went out as a transcription message, same order.
    let socket = ctx.get(OUTBOUND_SOCKET).await.unwrap().unwrap();
    socket.close().await;
    let sent = transport.sent.lock().unwrap();
    let wire_texts: Vec<String> = sent
        .iter()
        .map(|text| match Envelope::decode(text).unwrap().message {
            WireMessage::Transcription { text, .. } => text,
            other => panic!("unexpected message {other:?}"),
        })
        .collect();
    assert_eq!(
        wire_texts,
        vec!["segment 0", "segment 1", "segment 2", "closing words"]
    );

    ctx.teardown().await.unwrap();
}
