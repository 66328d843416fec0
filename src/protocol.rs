//! Typed message protocol between the isolated execution contexts.
//!
//! Every message that crosses a context boundary is an [`Envelope`] carrying an
//! explicit sender and addressee plus the document it concerns. The payload is a
//! closed tagged union: unknown `type` tags and envelopes lacking a `to` field fail
//! deserialization at the boundary instead of being silently processed.

use serde::{Deserialize, Serialize};

use crate::errors::AmaError;

/// The three execution contexts that exchange envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentId {
    /// The UI context displaying a document's chat
    Sidebar,
    /// The message router between contexts
    Router,
    /// The worker context owning stores and model access
    Worker,
}

/// One entry of a document's chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Closed vocabulary of message payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Payload {
    /// UI asks the worker to (re)process the addressed document
    StartProcessing,
    /// UI submits a question about the addressed document
    AskQuestion { question: String },
    /// UI aborts the in-flight generation for the addressed document
    TerminateChat,
    /// The tab showing the addressed document came to the foreground
    TabActivated,
    /// The tab showing the addressed document left the foreground or closed
    TabDeactivated,
    /// Human-readable progress for the UI status line
    StatusUpdate { message: String },
    /// Processing finished; the UI should render the stored history
    InitChat {
        history: Vec<ChatMessage>,
        ui_state: String,
    },
    /// One streamed answer delta
    AmaChunk { chunk: String },
    /// The in-flight generation finished normally
    AmaComplete,
    /// Terminal notification after a buffered response was flushed in one piece
    AmaCompleteBuffered,
    /// The in-flight generation was cancelled
    AmaTerminated,
    /// An operation failed; the UI returns to a re-askable state
    Error { message: String },
}

/// A routed message. `url` is the document identity the message concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    pub from: ComponentId,
    pub to: ComponentId,
    pub url: String,
}

impl Envelope {
    pub fn new(
        from: ComponentId,
        to: ComponentId,
        url: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            payload,
            from,
            to,
            url: url.into(),
        }
    }

    /// Status update from the worker to the UI.
    pub fn status(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ComponentId::Worker,
            ComponentId::Sidebar,
            url,
            Payload::StatusUpdate {
                message: message.into(),
            },
        )
    }

    /// Error notification from the worker to the UI.
    pub fn error(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ComponentId::Worker,
            ComponentId::Sidebar,
            url,
            Payload::Error {
                message: message.into(),
            },
        )
    }

    /// Validate and decode an envelope arriving from another context.
    ///
    /// Any missing field (notably `to`) or unknown `type` tag is a validation
    /// error, not a silently-dropped message.
    pub fn parse(raw: &str) -> Result<Self, AmaError> {
        serde_json::from_str(raw).map_err(|e| AmaError::Validation(format!("bad envelope: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_kebab_case_tags() {
        let env = Envelope::new(
            ComponentId::Sidebar,
            ComponentId::Worker,
            "https://example.com/paper.pdf",
            Payload::AskQuestion {
                question: "what is this about?".to_string(),
            },
        );
        let raw = serde_json::to_string(&env).unwrap();
        assert!(raw.contains("\"type\":\"ask-question\""));
        assert!(raw.contains("\"from\":\"sidebar\""));
        assert!(raw.contains("\"to\":\"worker\""));

        let back = Envelope::parse(&raw).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn unit_payloads_serialize_without_data() {
        let env = Envelope::new(
            ComponentId::Worker,
            ComponentId::Sidebar,
            "u",
            Payload::AmaComplete,
        );
        let raw = serde_json::to_string(&env).unwrap();
        assert!(raw.contains("\"type\":\"ama-complete\""));
        let back = Envelope::parse(&raw).unwrap();
        assert_eq!(back.payload, Payload::AmaComplete);
    }

    #[test]
    fn envelope_without_addressee_is_rejected() {
        let raw = r#"{"type":"ama-chunk","data":{"chunk":"hi"},"from":"worker","url":"u"}"#;
        let err = Envelope::parse(raw).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let raw = r#"{"type":"reboot-universe","from":"sidebar","to":"worker","url":"u"}"#;
        assert!(Envelope::parse(raw).is_err());
    }
}
