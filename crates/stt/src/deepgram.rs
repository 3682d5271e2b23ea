//! Cloud recognition over Deepgram's live-streaming WebSocket API, with
//! speaker diarization.
//!
//! Provider results arrive on the socket's read half; a reader task feeds
//! the finalized ones into the segment channel, so nothing provider-side
//! ever touches session state directly.
//! Reference: https://developers.deepgram.com/docs/live-streaming-audio

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::{
    FinalSegment, RecognizerFactory, Result, SttError, StreamingRecognizer,
    SEGMENT_CHANNEL_CAPACITY,
};

const STREAMING_URL: &str = "wss://api.deepgram.com/v1/listen";

type WsSink =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    pub api_key: String,
    pub model: String,
    pub language: Option<String>,
}

impl DeepgramConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "nova-2-meeting".to_string(),
            language: None,
        }
    }
}

fn build_stream_url(config: &DeepgramConfig, sample_rate: u32) -> String {
    let mut url = format!(
        "{STREAMING_URL}?model={}&diarize=true&punctuate=true&interim_results=false",
        config.model
    );
    if let Some(language) = &config.language {
        url.push_str(&format!("&language={language}"));
    }
    url.push_str(&format!(
        "&encoding=linear16&sample_rate={sample_rate}&channels=1"
    ));
    url
}

pub struct DeepgramFactory {
    config: DeepgramConfig,
}

impl DeepgramFactory {
    pub fn new(config: DeepgramConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RecognizerFactory for DeepgramFactory {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    async fn create(
        &self,
        sample_rate: u32,
    ) -> Result<(Arc<dyn StreamingRecognizer>, mpsc::Receiver<FinalSegment>)> {
        let url = build_stream_url(&self.config, sample_rate);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(SttError::WebSocket)?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| SttError::Provider(format!("invalid api key header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (stream, _response) = connect_async(request).await?;
        tracing::info!(sample_rate, model = %self.config.model, "deepgram stream open");

        let (writer, mut reader) = stream.split();
        let (events, segments) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);

        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(segment) = parse_live_event(text.as_ref()) {
                            if events.send(segment).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(%error, "deepgram stream read failed");
                        break;
                    }
                }
            }
            // Dropping `events` here closes the segment channel.
        });

        let recognizer = Arc::new(DeepgramRecognizer {
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader_task)),
        });
        Ok((recognizer, segments))
    }
}

struct DeepgramRecognizer {
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl StreamingRecognizer for DeepgramRecognizer {
    async fn accept_pcm(&self, samples: &[i16]) -> Result<()> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| SttError::Provider("stream already closed".to_string()))?;
        sink.send(Message::binary(bytes)).await?;
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        if let Some(mut sink) = self.writer.lock().await.take() {
            // Ask the provider to flush pending finals before we close.
            if let Err(error) = sink.send(Message::text(r#"{"type":"CloseStream"}"#)).await {
                tracing::debug!(%error, "deepgram close-stream send failed");
            }
            if let Err(error) = sink.close().await {
                tracing::debug!(%error, "deepgram sink close failed");
            }
        }
        if let Some(reader) = self.reader.lock().await.take() {
            if let Err(error) = reader.await {
                tracing::warn!(%error, "deepgram reader task failed");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LiveEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    is_final: bool,
    channel: Option<LiveChannel>,
}

#[derive(Debug, Deserialize)]
struct LiveChannel {
    #[serde(default)]
    alternatives: Vec<LiveAlternative>,
}

#[derive(Debug, Deserialize)]
struct LiveAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    words: Vec<LiveWord>,
}

#[derive(Debug, Deserialize)]
struct LiveWord {
    speaker: Option<u32>,
}

/// Extract a finalized segment from one provider event, if it carries one.
fn parse_live_event(text: &str) -> Option<FinalSegment> {
    let event: LiveEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(error) => {
            tracing::debug!(%error, "unparseable deepgram event");
            return None;
        }
    };

    if event.kind.as_deref() != Some("Results") || !event.is_final {
        return None;
    }
    let alternative = event.channel?.alternatives.into_iter().next()?;
    if alternative.transcript.trim().is_empty() {
        return None;
    }

    let speaker = alternative
        .words
        .first()
        .and_then(|word| word.speaker)
        .map(|speaker| speaker.to_string());
    Some(FinalSegment {
        text: alternative.transcript,
        speaker,
    })
}
