use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who started a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadSource {
    /// Created by a person chatting through the UI.
    User,
    /// Created by the scheduler for an autonomous run.
    Wake,
}

impl std::fmt::Display for ThreadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadSource::User => write!(f, "user"),
            ThreadSource::Wake => write!(f, "wake"),
        }
    }
}

impl std::str::FromStr for ThreadSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(ThreadSource::User),
            "wake" => Ok(ThreadSource::Wake),
            other => Err(format!("unknown thread source: {other}")),
        }
    }
}

/// One conversation. Soft-deleted threads never surface from the store.
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: i64,
    /// Set at most twice: once by the title handler after the first
    /// exchange, thereafter only by explicit user action.
    pub title: Option<String>,
    pub source: ThreadSource,
    /// Back-link to the job run that produced a wake thread.
    pub job_run_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Token accounting reported by the LM for one assistant reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// The structured message document, the source of truth for message
/// content. The row's `role` column mirrors `role` here and exists only for
/// indexing and filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDoc {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl MessageDoc {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }
}

/// A persisted message. Within a thread, messages are totally ordered by id.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub thread_id: i64,
    pub role: Role,
    /// Model that produced an assistant reply; null otherwise.
    pub model: Option<String>,
    pub doc: MessageDoc,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Agent,
    User,
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySource::Agent => write!(f, "agent"),
            MemorySource::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for MemorySource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "agent" => Ok(MemorySource::Agent),
            "user" => Ok(MemorySource::User),
            other => Err(format!("unknown memory source: {other}")),
        }
    }
}

/// One remembered fact. The embedding lives in the companion vector table
/// and is kept consistent with `content` by every mutation.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub content: String,
    pub source: MemorySource,
    pub thread_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A memory entry scored against a query vector.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    #[serde(flatten)]
    pub entry: MemoryEntry,
    /// Cosine similarity in `[0, 1]` for unit-ish embedding vectors.
    pub similarity: f32,
}

/// A scheduled job. Exactly one of `prompt` / (`skill_name` + `skill_config`)
/// is the payload.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    /// Present iff the job recurs.
    pub cron: Option<String>,
    pub prompt: Option<String>,
    pub skill_name: Option<String>,
    pub skill_config: Option<serde_json::Value>,
    pub enabled: bool,
    pub max_retries: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_prompt_job(&self) -> bool {
        self.prompt.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.cron.is_some()
    }
}

/// Fields for inserting a job. Validation happens in the job service; the
/// store only enforces the payload-kind check constraint.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub cron: Option<String>,
    pub prompt: Option<String>,
    pub skill_name: Option<String>,
    pub skill_config: Option<serde_json::Value>,
    pub enabled: bool,
    pub max_retries: u32,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution slot of a job. `(job_id, scheduled_for)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub job_id: i64,
    /// The nominal fire instant this run represents.
    pub scheduled_for: DateTime<Utc>,
    /// Lease expiry while running; retry backoff gate while pending.
    pub locked_until: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub retry_count: u32,
    /// Thread produced by a prompt run.
    pub thread_id: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_doc_roundtrips_through_json() {
        let doc = MessageDoc::new(Role::Assistant, "hi").with_usage(Some(Usage {
            input_tokens: 10,
            output_tokens: 4,
            total_tokens: 14,
        }));
        let json = serde_json::to_string(&doc).unwrap();
        let back: MessageDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn message_doc_omits_absent_usage() {
        let doc = MessageDoc::new(Role::User, "hello");
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("usage"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in ["pending", "running", "completed", "failed"] {
            let status: RunStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("nope".parse::<RunStatus>().is_err());
    }

    #[test]
    fn role_strings_roundtrip() {
        for s in ["system", "user", "assistant", "tool"] {
            let role: Role = s.parse().unwrap();
            assert_eq!(role.to_string(), s);
        }
    }
}
