//! Per-document session records.
//!
//! One record per canonical document URL, owned exclusively by the worker. The
//! store hands out clones; mutations go through explicit methods so
//! `updated_at` stays accurate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::AmaError;
use crate::protocol::ChatMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub url: String,
    pub text: String,
    pub chat_history: Vec<ChatMessage>,
    pub is_rag: bool,
    pub ui_state: String,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            text: String::new(),
            chat_history: Vec::new(),
            is_rag: false,
            ui_state: String::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<Session> {
        self.sessions.read().await.get(url).cloned()
    }

    /// Load the session for `url`, creating an empty one on first sight.
    pub async fn get_or_create(&self, url: &str) -> Session {
        self.sessions
            .write()
            .await
            .entry(url.to_string())
            .or_insert_with(|| Session::new(url))
            .clone()
    }

    /// Write a full session record back, stamping `updated_at`.
    pub async fn save(&self, mut session: Session) {
        session.updated_at = Utc::now();
        self.sessions
            .write()
            .await
            .insert(session.url.clone(), session);
    }

    /// Append one entry to a stored session's history.
    pub async fn append_message(&self, url: &str, message: ChatMessage) -> Result<(), AmaError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(url)
            .ok_or_else(|| AmaError::Validation(format!("no session for {}", url)))?;
        session.chat_history.push(message);
        session.updated_at = Utc::now();
        Ok(())
    }

    pub async fn set_ui_state(&self, url: &str, ui_state: impl Into<String>) -> Result<(), AmaError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(url)
            .ok_or_else(|| AmaError::Validation(format!("no session for {}", url)))?;
        session.ui_state = ui_state.into();
        session.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = SessionStore::new();
        assert!(store.get("u").await.is_none());
        let first = store.get_or_create("u").await;
        assert_eq!(first.url, "u");

        let mut edited = first.clone();
        edited.text = "hello".to_string();
        store.save(edited).await;

        let again = store.get_or_create("u").await;
        assert_eq!(again.text, "hello");
    }

    #[tokio::test]
    async fn append_message_requires_existing_session() {
        let store = SessionStore::new();
        let err = store
            .append_message("nope", ChatMessage::user("q"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");

        store.get_or_create("u").await;
        store.append_message("u", ChatMessage::user("q")).await.unwrap();
        store
            .append_message("u", ChatMessage::assistant("a"))
            .await
            .unwrap();
        let session = store.get("u").await.unwrap();
        assert_eq!(session.chat_history.len(), 2);
        assert_eq!(session.chat_history[0].role, "user");
        assert_eq!(session.chat_history[1].role, "assistant");
    }

    #[tokio::test]
    async fn save_stamps_updated_at() {
        let store = SessionStore::new();
        let session = store.get_or_create("u").await;
        let before = session.updated_at;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.save(session).await;
        let after = store.get("u").await.unwrap().updated_at;
        assert!(after > before);
    }
}
