//! In-memory chat session carried between calls for one user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a turn, using the upstream API's role names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Conversation history for one user. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub user_id: String,
    pub history: Vec<ChatTurn>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a completed prompt/reply exchange, keeping at most `max_turns` turns.
    ///
    /// Trimming removes whole exchanges so the history always starts with a user turn.
    pub fn record_exchange(&mut self, prompt: &str, reply: &str, max_turns: usize) {
        self.history.push(ChatTurn::new(Role::User, prompt));
        self.history.push(ChatTurn::new(Role::Model, reply));

        let limit = max_turns - max_turns % 2;
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    pub fn turn_count(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_exchange() {
        let mut session = ChatSession::new("u1");
        session.record_exchange("hello", "hi there", 20);

        assert_eq!(session.turn_count(), 2);
        assert_eq!(session.history[0].role, Role::User);
        assert_eq!(session.history[0].content, "hello");
        assert_eq!(session.history[1].role, Role::Model);
        assert_eq!(session.history[1].content, "hi there");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut session = ChatSession::new("u1");
        for i in 0..10 {
            session.record_exchange(&format!("q{}", i), &format!("a{}", i), 4);
        }

        assert_eq!(session.turn_count(), 4);
        assert_eq!(session.history[0].content, "q8");
        assert_eq!(session.history[0].role, Role::User);
        assert_eq!(session.history[3].content, "a9");
    }

    #[test]
    fn test_odd_limit_keeps_whole_exchanges() {
        let mut session = ChatSession::new("u1");
        for i in 0..3 {
            session.record_exchange(&format!("q{}", i), &format!("a{}", i), 5);
        }

        assert_eq!(session.turn_count(), 4);
        assert_eq!(session.history[0].role, Role::User);
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let mut session = ChatSession::new("u1");
        session.record_exchange("q", "a", 0);
        assert_eq!(session.turn_count(), 0);
    }
}
