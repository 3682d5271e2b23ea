//! On-host recognition with a Vosk/Kaldi model.
//!
//! Model load and decoding are blocking; both run on the blocking pool so
//! the session scheduler never stalls behind the acoustic model.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use vosk::{DecodingState, Model, Recognizer};

use crate::{
    FinalSegment, RecognizerFactory, Result, SttError, StreamingRecognizer,
    SEGMENT_CHANNEL_CAPACITY,
};

struct RecognizerState {
    // Kept so the model outlives every recognizer call.
    _model: Model,
    recognizer: Recognizer,
}

pub struct VoskFactory {
    model_path: PathBuf,
}

impl VoskFactory {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }
}

#[async_trait]
impl RecognizerFactory for VoskFactory {
    fn name(&self) -> &'static str {
        "vosk"
    }

    async fn create(
        &self,
        sample_rate: u32,
    ) -> Result<(Arc<dyn StreamingRecognizer>, mpsc::Receiver<FinalSegment>)> {
        let path = self.model_path.to_string_lossy().into_owned();
        let state = tokio::task::spawn_blocking(move || -> Result<RecognizerState> {
            let model = Model::new(path.clone()).ok_or(SttError::ModelLoad(path))?;
            let mut recognizer = Recognizer::new(&model, sample_rate as f32).ok_or_else(|| {
                SttError::Recognizer(format!("recognizer rejected sample rate {sample_rate}"))
            })?;
            recognizer.set_words(true);
            recognizer.set_partial_words(true);
            Ok(RecognizerState {
                _model: model,
                recognizer,
            })
        })
        .await
        .map_err(|e| SttError::Recognizer(e.to_string()))??;

        tracing::info!(sample_rate, "vosk recognizer ready");

        let (events, segments) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        let recognizer = Arc::new(LocalRecognizer {
            state: Arc::new(Mutex::new(state)),
            events: Mutex::new(Some(events)),
        });
        Ok((recognizer, segments))
    }
}

struct LocalRecognizer {
    state: Arc<Mutex<RecognizerState>>,
    events: Mutex<Option<mpsc::Sender<FinalSegment>>>,
}

impl LocalRecognizer {
    fn event_sender(&self) -> Option<mpsc::Sender<FinalSegment>> {
        self.events
            .lock()
            .expect("recognizer events mutex poisoned")
            .clone()
    }

    async fn emit(&self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        if let Some(sender) = self.event_sender() {
            let _ = sender
                .send(FinalSegment {
                    text,
                    speaker: None,
                })
                .await;
        }
    }
}

#[async_trait]
impl StreamingRecognizer for LocalRecognizer {
    async fn accept_pcm(&self, samples: &[i16]) -> Result<()> {
        let state = Arc::clone(&self.state);
        let samples = samples.to_vec();
        let finalized = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let mut state = state.lock().expect("recognizer state mutex poisoned");
            match state.recognizer.accept_waveform(&samples) {
                Ok(DecodingState::Finalized) => Ok(state
                    .recognizer
                    .result()
                    .single()
                    .map(|result| result.text.to_string())),
                Ok(_) => Ok(None),
                Err(error) => Err(SttError::Recognizer(format!("{error:?}"))),
            }
        })
        .await
        .map_err(|e| SttError::Recognizer(e.to_string()))??;

        if let Some(text) = finalized {
            self.emit(text).await;
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let trailing = tokio::task::spawn_blocking(move || {
            let mut state = state.lock().expect("recognizer state mutex poisoned");
            state
                .recognizer
                .final_result()
                .single()
                .map(|result| result.text.to_string())
        })
        .await
        .map_err(|e| SttError::Recognizer(e.to_string()))?;

        if let Some(text) = trailing {
            self.emit(text).await;
        }
        // Closing the channel ends the session's drain task.
        self.events
            .lock()
            .expect("recognizer events mutex poisoned")
            .take();
        Ok(())
    }
}
