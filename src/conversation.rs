/// Conversation memory
///
/// Each user has one `UserSession` behind its own mutex. A turn holds that
/// mutex for its whole read-modify-write, so overlapping messages from the
/// same user are serialized while different users never wait on each other.
/// Sessions are persisted as JSON, one file per user, in the memory directory.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tokio::sync::{Mutex, RwLock};

use crate::llm::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Synthetic turn standing in for older, summarized turns
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: u64,
    pub turns: Vec<ConversationTurn>,
    /// Standalone query waiting for the user to pick a fallback
    #[serde(default)]
    pub pending_query: Option<String>,
}

impl UserSession {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn push_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.turns.push(ConversationTurn::new(Role::User, user));
        self.turns.push(ConversationTurn::new(Role::Assistant, assistant));
    }

    /// History as chat messages for the language model
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| match turn.role {
                Role::User => ChatMessage::user(turn.content.clone()),
                Role::Assistant => ChatMessage::assistant(turn.content.clone()),
                Role::Summary => ChatMessage::system(format!(
                    "Summary of the earlier conversation:\n{}",
                    turn.content
                )),
            })
            .collect()
    }

    /// Replace the first `count` turns with a single summary turn
    ///
    /// The summary takes the place (and timestamp) of the turns it replaces;
    /// later turns keep their order.
    pub fn summarize_prefix(&mut self, count: usize, summary: impl Into<String>) {
        let count = count.min(self.turns.len());
        if count == 0 {
            return;
        }
        let at = self.turns[count - 1].at;
        let summary_turn = ConversationTurn {
            role: Role::Summary,
            content: summary.into(),
            at,
        };
        self.turns.splice(0..count, std::iter::once(summary_turn));
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.pending_query = None;
    }
}

/// Plain-text transcript used inside prompts
pub fn format_transcript(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Summary => "Summary",
            };
            format!("{}: {}", speaker, turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decides when a session's history is long enough to be summarized
pub struct HistoryBudget {
    bpe: CoreBPE,
    token_limit: usize,
    keep_recent: usize,
}

impl HistoryBudget {
    pub fn new(token_limit: usize, keep_recent: usize) -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base().context("Failed to load cl100k tokenizer")?,
            token_limit,
            keep_recent,
        })
    }

    pub fn count_tokens(&self, turns: &[ConversationTurn]) -> usize {
        turns
            .iter()
            .map(|turn| self.bpe.encode_with_special_tokens(&turn.content).len())
            .sum()
    }

    /// Number of leading turns to collapse, if the history is over budget
    ///
    /// At least two turns must be collapsible, otherwise summarizing would
    /// not shrink anything.
    pub fn turns_to_summarize(&self, session: &UserSession) -> Option<usize> {
        if self.count_tokens(&session.turns) <= self.token_limit {
            return None;
        }
        let count = session.turns.len().saturating_sub(self.keep_recent);
        (count >= 2).then_some(count)
    }
}

/// Manages conversation sessions for every user
pub struct ConversationManager {
    sessions: RwLock<HashMap<u64, Arc<Mutex<UserSession>>>>,
    memory_dir: PathBuf,
}

impl ConversationManager {
    pub fn new(memory_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            memory_dir: memory_dir.into(),
        }
    }

    fn session_path(&self, user_id: u64) -> PathBuf {
        self.memory_dir.join(format!("{}.json", user_id))
    }

    /// The user's session, loaded from disk on first use
    pub async fn session(&self, user_id: u64) -> Arc<Mutex<UserSession>> {
        if let Some(session) = self.sessions.read().await.get(&user_id) {
            return session.clone();
        }

        let loaded = load_session(&self.session_path(user_id), user_id).await;
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone()
    }

    /// Write a session to the memory directory
    pub async fn persist(&self, session: &UserSession) -> anyhow::Result<()> {
        let path = self.session_path(session.user_id);
        let bytes = serde_json::to_vec_pretty(session).context("Failed to serialize session")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Drop the cached session unless a turn is still holding it
    ///
    /// Only call this once the session has been persisted; the next
    /// `session` call reloads it from disk.
    pub async fn release(&self, user_id: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&user_id) {
            if Arc::strong_count(session) == 1 {
                sessions.remove(&user_id);
            }
        }
    }

    /// Forget a user's history, in memory and on disk
    pub async fn clear(&self, user_id: u64) -> anyhow::Result<()> {
        let session = self.session(user_id).await;
        let mut session = session.lock().await;
        session.clear();

        match tokio::fs::remove_file(self.session_path(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove stored history"),
        }
    }
}

async fn load_session(path: &Path, user_id: u64) -> UserSession {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<UserSession>(&bytes) {
            Ok(session) if session.user_id == user_id => session,
            Ok(_) => {
                log::warn!("Ignoring {}: belongs to another user", path.display());
                UserSession::new(user_id)
            }
            Err(e) => {
                log::warn!("Ignoring unreadable history {}: {}", path.display(), e);
                UserSession::new(user_id)
            }
        },
        Err(_) => UserSession::new(user_id),
    }
}
