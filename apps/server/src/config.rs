//! Environment-driven server configuration.

use std::path::PathBuf;

use anyhow::{bail, Context};

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub cors_allow_origins: Vec<String>,

    pub target_sample_rate: u32,
    pub audio_recordings_dir: PathBuf,
    pub database_path: PathBuf,

    pub process_transcript_every_secs: u64,
    pub process_transcript_every_word_count: usize,

    /// Local model path; selects the Vosk backend when set.
    pub vosk_model_path: Option<PathBuf>,
    /// Cloud credential; selects the Deepgram backend when no local model.
    pub deepgram_api_key: Option<String>,

    pub analyzer_api_url: Option<String>,
    pub analyzer_api_key: Option<String>,
    pub analyzer_model: String,

    pub ai_worker_count: usize,
    pub ai_job_queue_capacity: usize,

    pub ticket_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let cors_allow_origins = split_origins(&required("CORS_ALLOW_ORIGINS")?);
        if cors_allow_origins.is_empty() {
            bail!("CORS_ALLOW_ORIGINS must list at least one origin");
        }

        Ok(Self {
            server_host: optional("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port: parsed("SERVER_PORT", 3000)?,
            cors_allow_origins,
            target_sample_rate: parsed("TARGET_SAMPLE_RATE", 48_000)?,
            audio_recordings_dir: optional("AUDIO_RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("audio_recordings")),
            database_path: optional("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("confab.sqlite3")),
            process_transcript_every_secs: parsed("PROCESS_TRANSCRIPT_EVERY_SECS", 60)?,
            process_transcript_every_word_count: parsed(
                "PROCESS_TRANSCRIPT_EVERY_WORD_COUNT",
                100,
            )?,
            vosk_model_path: optional("VOSK_MODEL_PATH").map(PathBuf::from),
            deepgram_api_key: optional("DEEPGRAM_API_KEY"),
            analyzer_api_url: optional("ANALYZER_API_URL"),
            analyzer_api_key: optional("ANALYZER_API_KEY"),
            analyzer_model: optional("ANALYZER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            ai_worker_count: parsed("AI_WORKER_COUNT", 4)?,
            ai_job_queue_capacity: parsed("AI_JOB_QUEUE_CAPACITY", 5)?,
            ticket_ttl_secs: parsed("TICKET_TTL_SECS", 300)?,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> anyhow::Result<String> {
    optional(key).with_context(|| format!("missing required environment variable: {key}"))
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw}")),
    }
}

/// Accepts `a,b,c`, optionally wrapped in brackets, with stray whitespace.
fn split_origins(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}
