//! Response generation on top of a [`TextProvider`].
//!
//! The generator owns chat sessions. Under [`SessionPolicy::PerUser`] each user
//! id maps to one session behind an async mutex, and the mutex is held for the
//! whole upstream exchange, so two requests for the same user never interleave
//! their turns. Under [`SessionPolicy::Stateless`] every call starts empty.
//!
//! The session map is bounded. Sessions idle longer than the configured TTL are
//! swept on every acquire, and past `max_sessions` the least recently used idle
//! session is evicted.

use crate::config::{ChatConfig, SessionPolicy};
use crate::models::{ChatSession, ChatTurn};
use crate::services::providers::{
    GenerationParams, ProviderError, ProviderStream, StreamChunk, TextProvider,
};
use dashmap::DashMap;
use futures::{stream, Stream, StreamExt};
use service_core::error::AppError;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Failure classes surfaced to the request handler.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Network failure or timeout reaching the upstream service.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The upstream service answered with an error.
    #[error("execution failure: {0}")]
    Execution(String),

    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl From<ProviderError> for GenerationError {
    fn from(err: ProviderError) -> Self {
        let detail = err.to_string();
        match err {
            ProviderError::NetworkError(_) | ProviderError::Timeout(_) => {
                GenerationError::Connection(detail)
            }
            ProviderError::ApiError(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::RateLimited
            | ProviderError::ContentFiltered => GenerationError::Execution(detail),
            ProviderError::NotConfigured(_) | ProviderError::EmptyResponse => {
                GenerationError::Unknown(detail)
            }
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Connection(detail) => AppError::UpstreamConnection(detail),
            GenerationError::Execution(detail) => AppError::UpstreamExecution(detail),
            GenerationError::Unknown(detail) => AppError::UpstreamUnknown(detail),
        }
    }
}

/// Re-chunked text, one item per slice.
pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Text forwarded from the upstream stream as it arrives.
pub type LiveTextStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Split `text` into consecutive slices of at most `chunk_size` characters.
///
/// A `chunk_size` of zero is treated as one. Joining the slices gives back `text`.
pub fn partition(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let characters: Vec<char> = text.chars().collect();
    characters
        .chunks(chunk_size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Either a throwaway session or exclusive access to a user's shared one.
enum SessionGuard {
    Fresh(ChatSession),
    Shared(OwnedMutexGuard<ChatSession>),
}

impl Deref for SessionGuard {
    type Target = ChatSession;

    fn deref(&self) -> &ChatSession {
        match self {
            SessionGuard::Fresh(session) => session,
            SessionGuard::Shared(guard) => guard,
        }
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut ChatSession {
        match self {
            SessionGuard::Fresh(session) => session,
            SessionGuard::Shared(guard) => guard,
        }
    }
}

impl SessionGuard {
    fn record(&mut self, prompt: &str, reply: &str, max_turns: usize) {
        if let SessionGuard::Shared(session) = self {
            session.record_exchange(prompt, reply, max_turns);
        }
    }
}

/// A user's session plus when it was last handed out.
struct SessionSlot {
    session: Arc<Mutex<ChatSession>>,
    last_used: Instant,
}

impl SessionSlot {
    /// Someone besides the map holds the session: an exchange is running or waiting.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.session) > 1
    }
}

const DEFAULT_MAX_SESSIONS: usize = 10_000;
const DEFAULT_SESSION_IDLE_TTL: Duration = Duration::from_secs(3600);

pub struct ResponseGenerator {
    provider: Arc<dyn TextProvider>,
    params: GenerationParams,
    policy: SessionPolicy,
    max_history_turns: usize,
    max_sessions: usize,
    session_idle_ttl: Duration,
    chunk_delay: Duration,
    sessions: DashMap<String, SessionSlot>,
}

impl ResponseGenerator {
    /// Stateless generator with no delay between re-chunked slices.
    pub fn new(provider: Arc<dyn TextProvider>, params: GenerationParams) -> Self {
        Self {
            provider,
            params,
            policy: SessionPolicy::Stateless,
            max_history_turns: 20,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_idle_ttl: DEFAULT_SESSION_IDLE_TTL,
            chunk_delay: Duration::ZERO,
            sessions: DashMap::new(),
        }
    }

    pub fn from_config(provider: Arc<dyn TextProvider>, config: &ChatConfig) -> Self {
        let generation = &config.generation;
        let params = GenerationParams {
            temperature: Some(generation.temperature),
            top_p: Some(generation.top_p),
            top_k: Some(generation.top_k),
            max_tokens: Some(generation.max_output_tokens),
            response_mime_type: Some("text/plain".to_string()),
            system_instruction: Some(generation.system_instruction.clone())
                .filter(|s| !s.trim().is_empty()),
        };

        Self::new(provider, params)
            .with_sessions(config.sessions.policy, config.sessions.max_history_turns)
            .with_session_limits(config.sessions.max_sessions, config.sessions.idle_ttl())
            .with_chunk_delay(config.streaming.chunk_delay())
    }

    pub fn with_sessions(mut self, policy: SessionPolicy, max_history_turns: usize) -> Self {
        self.policy = policy;
        self.max_history_turns = max_history_turns;
        self
    }

    /// Bound the session map by count and idle time. A `max_sessions` of zero is treated as one.
    pub fn with_session_limits(mut self, max_sessions: usize, idle_ttl: Duration) -> Self {
        self.max_sessions = max_sessions.max(1);
        self.session_idle_ttl = idle_ttl;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn provider(&self) -> &Arc<dyn TextProvider> {
        &self.provider
    }

    async fn acquire(&self, user_id: &str) -> SessionGuard {
        match self.policy {
            SessionPolicy::Stateless => SessionGuard::Fresh(ChatSession::new(user_id)),
            SessionPolicy::PerUser => {
                let session = {
                    let mut slot = self.sessions.entry(user_id.to_string()).or_insert_with(|| {
                        tracing::debug!(user_id = %user_id, "Creating chat session");
                        SessionSlot {
                            session: Arc::new(Mutex::new(ChatSession::new(user_id))),
                            last_used: Instant::now(),
                        }
                    });
                    slot.last_used = Instant::now();
                    slot.session.clone()
                };
                // The entry guard is released above; sweeping takes shard locks.
                self.evict_sessions(user_id);
                SessionGuard::Shared(session.lock_owned().await)
            }
        }
    }

    /// Drop idle-expired sessions, then least recently used ones past the cap.
    /// Sessions in use and `keep` are never evicted.
    fn evict_sessions(&self, keep: &str) {
        let now = Instant::now();
        let ttl = self.session_idle_ttl;
        let before = self.sessions.len();

        self.sessions.retain(|key, slot| {
            key == keep || slot.in_use() || now.duration_since(slot.last_used) < ttl
        });

        while self.sessions.len() > self.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .filter(|entry| entry.key() != keep && !entry.value().in_use())
                .min_by_key(|entry| entry.value().last_used)
                .map(|entry| entry.key().clone());

            match oldest {
                Some(key) => {
                    self.sessions.remove(&key);
                }
                None => break,
            }
        }

        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.sessions.len(), "Evicted chat sessions");
        }
    }

    /// Generate a complete reply to `prompt`.
    pub async fn generate(&self, user_id: &str, prompt: &str) -> Result<String, GenerationError> {
        let mut session = self.acquire(user_id).await;

        let response = self
            .provider
            .generate(&session.history, prompt, &self.params)
            .await?;

        session.record(prompt, &response.text, self.max_history_turns);

        tracing::info!(
            user_id = %user_id,
            session_id = %session.session_id,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            finish_reason = ?response.finish_reason,
            "Generated response"
        );

        Ok(response.text)
    }

    /// Generate the full reply with one upstream call, then hand it out in
    /// `chunk_size`-character slices with the configured delay between them.
    pub async fn generate_streaming(
        &self,
        user_id: &str,
        prompt: &str,
        chunk_size: usize,
    ) -> Result<TextStream, GenerationError> {
        let text = self.generate(user_id, prompt).await?;
        let delay = self.chunk_delay;

        let chunks = stream::iter(partition(&text, chunk_size).into_iter().enumerate()).then(
            move |(index, chunk)| async move {
                if index > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunk
            },
        );

        Ok(Box::pin(chunks))
    }

    /// Forward the upstream stream chunk by chunk.
    ///
    /// Under the per-user policy the session stays locked until the stream is
    /// exhausted or dropped, and the exchange is recorded only if the stream
    /// completes without error.
    pub async fn generate_native_stream(
        &self,
        user_id: &str,
        prompt: &str,
    ) -> Result<LiveTextStream, GenerationError> {
        let session = self.acquire(user_id).await;
        let upstream = self
            .provider
            .generate_stream(&session.history, prompt, &self.params)
            .await?;

        let state = NativeStream {
            upstream,
            session: Some(session),
            prompt: prompt.to_string(),
            reply: String::new(),
            max_history_turns: self.max_history_turns,
        };

        Ok(Box::pin(stream::unfold(state, NativeStream::next_item)))
    }

    /// Drop a user's conversation history.
    pub fn clear_session(&self, user_id: &str) -> bool {
        self.sessions.remove(user_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Copy of a user's history, waiting for any in-flight exchange to finish.
    pub async fn session_history(&self, user_id: &str) -> Option<Vec<ChatTurn>> {
        let session = self
            .sessions
            .get(user_id)
            .map(|entry| entry.value().session.clone())?;
        let guard = session.lock().await;
        Some(guard.history.clone())
    }
}

struct NativeStream {
    upstream: ProviderStream,
    /// `None` once the stream has ended.
    session: Option<SessionGuard>,
    prompt: String,
    reply: String,
    max_history_turns: usize,
}

impl NativeStream {
    async fn next_item(mut self) -> Option<(Result<String, GenerationError>, Self)> {
        let Some(session) = self.session.as_mut() else {
            return None;
        };

        loop {
            match self.upstream.next().await {
                Some(Ok(StreamChunk::Text(text))) => {
                    self.reply.push_str(&text);
                    return Some((Ok(text), self));
                }
                Some(Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason,
                })) => {
                    tracing::info!(
                        session_id = %session.session_id,
                        input_tokens,
                        output_tokens,
                        finish_reason = ?finish_reason,
                        "Upstream stream completed"
                    );
                }
                Some(Err(e)) => {
                    self.session = None;
                    return Some((Err(GenerationError::from(e)), self));
                }
                None => {
                    if !self.reply.is_empty() {
                        session.record(&self.prompt, &self.reply, self.max_history_turns);
                    }
                    return None;
                }
            }
        }
    }
}
