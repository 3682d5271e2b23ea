//! SQLite persistence for projects, transcripts, and AI analyses.

use chrono::{DateTime, TimeZone, Utc};
use confab_session::{AnalysisId, ProjectId, SessionId, TranscriptId, UserId};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("invalid stored id: {0}")]
    InvalidId(#[from] uuid::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct Project {
    pub project_id: ProjectId,
    pub name: String,
    pub creator_user_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TranscriptRow {
    pub transcript_id: TranscriptId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AnalysisRow {
    pub analysis_id: AnalysisId,
    pub project_id: ProjectId,
    pub text: String,
    pub span: Option<String>,
}

/// Storage contract the ingestion core depends on. The accept path appends
/// transcripts; the worker pool re-reads them in creation order and files
/// its suggestions.
pub trait ProjectStore: Send + Sync {
    /// Insert or refresh a user row keyed by its auth subject. Returns the
    /// canonical user id (the existing one on subject conflict).
    fn upsert_user(&self, user_id: UserId, full_name: &str, subject: &str) -> Result<UserId>;

    fn create_project(&self, name: &str, creator: UserId) -> Result<ProjectId>;

    fn get_project(&self, project_id: ProjectId) -> Result<Project>;

    /// Append a finalized transcript fragment, returning its new id.
    fn append_transcript(
        &self,
        user_id: UserId,
        session_id: SessionId,
        project_id: ProjectId,
        text: &str,
    ) -> Result<TranscriptId>;

    /// All fragments for a project, ordered by creation time.
    fn transcripts_for_project(&self, project_id: ProjectId) -> Result<Vec<TranscriptRow>>;

    fn append_analysis(
        &self,
        project_id: ProjectId,
        text: &str,
        span: Option<&str>,
    ) -> Result<AnalysisId>;

    /// Suggestions for a project, oldest first, excluding dismissed ones.
    fn analyses_for_project(&self, project_id: ProjectId) -> Result<Vec<AnalysisRow>>;

    fn dismiss_analysis(&self, analysis_id: AnalysisId, user_id: UserId) -> Result<()>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                full_name TEXT NOT NULL,
                oidc_id TEXT NOT NULL UNIQUE,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projects (
                project_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                creator_user_id TEXT NOT NULL REFERENCES users(user_id),
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transcripts (
                transcript_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                session_id TEXT NOT NULL,
                project_id TEXT NOT NULL REFERENCES projects(project_id),
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_analyses (
                analysis_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(project_id),
                text TEXT NOT NULL,
                span TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dismissed_ai_analyses (
                dismissed_analysis_id TEXT PRIMARY KEY,
                analysis_id TEXT NOT NULL REFERENCES ai_analyses(analysis_id),
                user_id TEXT NOT NULL REFERENCES users(user_id),
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transcripts_project
                ON transcripts(project_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_analyses_project
                ON ai_analyses(project_id, created_at);
            "#,
        )?;
        Ok(())
    }
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl ProjectStore for Database {
    fn upsert_user(&self, user_id: UserId, full_name: &str, subject: &str) -> Result<UserId> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO users (user_id, full_name, oidc_id, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(oidc_id) DO UPDATE SET full_name = excluded.full_name,
                                                updated_at = excluded.updated_at",
            (
                user_id.to_string(),
                full_name,
                subject,
                Utc::now().timestamp_millis(),
            ),
        )?;
        let canonical: String = conn.query_row(
            "SELECT user_id FROM users WHERE oidc_id = ?1",
            [subject],
            |row| row.get(0),
        )?;
        Ok(canonical.parse()?)
    }

    fn create_project(&self, name: &str, creator: UserId) -> Result<ProjectId> {
        let project_id = ProjectId::generate();
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO projects (project_id, name, creator_user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            (
                project_id.to_string(),
                name,
                creator.to_string(),
                Utc::now().timestamp_millis(),
            ),
        )?;
        Ok(project_id)
    }

    fn get_project(&self, project_id: ProjectId) -> Result<Project> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let row = conn
            .query_row(
                "SELECT project_id, name, creator_user_id, created_at
                 FROM projects WHERE project_id = ?1",
                [project_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::NotFound(format!("project {project_id}"))
                }
                other => StorageError::DatabaseError(other),
            })?;

        Ok(Project {
            project_id: row.0.parse()?,
            name: row.1,
            creator_user_id: row.2.parse()?,
            created_at: timestamp(row.3),
        })
    }

    fn append_transcript(
        &self,
        user_id: UserId,
        session_id: SessionId,
        project_id: ProjectId,
        text: &str,
    ) -> Result<TranscriptId> {
        let transcript_id = TranscriptId::generate();
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO transcripts (transcript_id, user_id, session_id, project_id, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                transcript_id.to_string(),
                user_id.to_string(),
                session_id.to_string(),
                project_id.to_string(),
                text,
                Utc::now().timestamp_millis(),
            ),
        )?;
        Ok(transcript_id)
    }

    fn transcripts_for_project(&self, project_id: ProjectId) -> Result<Vec<TranscriptRow>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT transcript_id, user_id, session_id, project_id, text, created_at
             FROM transcripts WHERE project_id = ?1
             ORDER BY created_at, transcript_id",
        )?;
        let rows = stmt.query_map([project_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut transcripts = Vec::new();
        for row in rows {
            let (transcript_id, user_id, session_id, project_id, text, created_at) = row?;
            transcripts.push(TranscriptRow {
                transcript_id: transcript_id.parse()?,
                user_id: user_id.parse()?,
                session_id: session_id.parse()?,
                project_id: project_id.parse()?,
                text,
                created_at: timestamp(created_at),
            });
        }
        Ok(transcripts)
    }

    fn append_analysis(
        &self,
        project_id: ProjectId,
        text: &str,
        span: Option<&str>,
    ) -> Result<AnalysisId> {
        let analysis_id = AnalysisId::generate();
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO ai_analyses (analysis_id, project_id, text, span, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                analysis_id.to_string(),
                project_id.to_string(),
                text,
                span,
                Utc::now().timestamp_millis(),
            ),
        )?;
        Ok(analysis_id)
    }

    fn analyses_for_project(&self, project_id: ProjectId) -> Result<Vec<AnalysisRow>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT a.analysis_id, a.project_id, a.text, a.span
             FROM ai_analyses a
             WHERE a.project_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM dismissed_ai_analyses d
                   WHERE d.analysis_id = a.analysis_id
               )
             ORDER BY a.created_at, a.analysis_id",
        )?;
        let rows = stmt.query_map([project_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut analyses = Vec::new();
        for row in rows {
            let (analysis_id, project_id, text, span) = row?;
            analyses.push(AnalysisRow {
                analysis_id: analysis_id.parse()?,
                project_id: project_id.parse()?,
                text,
                span,
            });
        }
        Ok(analyses)
    }

    fn dismiss_analysis(&self, analysis_id: AnalysisId, user_id: UserId) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM ai_analyses WHERE analysis_id = ?1)",
            [analysis_id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StorageError::NotFound(format!("analysis {analysis_id}")));
        }
        conn.execute(
            "INSERT INTO dismissed_ai_analyses (dismissed_analysis_id, analysis_id, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            (
                AnalysisId::generate().to_string(),
                analysis_id.to_string(),
                user_id.to_string(),
                Utc::now().timestamp_millis(),
            ),
        )?;
        Ok(())
    }
}
