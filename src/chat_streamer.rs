//! Streaming question answering over a stored session.
//!
//! Picks the conversation mode by document size: small documents ride along in
//! the prompt with the full chat history (direct mode), large ones go through
//! retrieval and get a single-turn prompt built from the matched chunks only.
//! Deltas are emitted as they arrive and checked against a cancel token. The
//! user question is persisted as soon as it is accepted; the assistant reply
//! joins it only when the stream finishes normally, so a cancelled or failed
//! run never leaves partial assistant text behind.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::errors::AmaError;
use crate::model::GenerativeModel;
use crate::protocol::{ChatMessage, Payload};
use crate::rag_pipeline::RagPipeline;
use crate::session_store::SessionStore;

/// Documents longer than this (in characters) use retrieval instead of
/// carrying the full text in the prompt.
pub const DIRECT_CONTEXT_LIMIT: usize = 32_000;

pub fn wants_rag(text: &str) -> bool {
    text.chars().count() > DIRECT_CONTEXT_LIMIT
}

/// How a generation run ended, cancellation being a normal outcome.
#[derive(Debug)]
pub enum StreamOutcome {
    Completed { response: String },
    Cancelled,
}

pub struct ChatStreamer {
    model: Arc<dyn GenerativeModel>,
    sessions: Arc<SessionStore>,
}

impl ChatStreamer {
    pub fn new(model: Arc<dyn GenerativeModel>, sessions: Arc<SessionStore>) -> Self {
        Self { model, sessions }
    }

    /// Answer `question` about the document at `url`, emitting payloads
    /// (status lines and answer deltas) as they are produced.
    ///
    /// `rag` must be provided for documents in retrieval mode.
    pub async fn answer(
        &self,
        url: &str,
        question: &str,
        rag: Option<Arc<RagPipeline>>,
        mut cancel: watch::Receiver<bool>,
        mut emit: impl FnMut(Payload),
    ) -> Result<StreamOutcome, AmaError> {
        let session = self
            .sessions
            .get(url)
            .await
            .ok_or_else(|| AmaError::Validation("Session not found.".to_string()))?;

        // The question enters history before anything can fail, so every
        // non-completed outcome leaves it behind for a clean re-ask. The
        // `session` snapshot above predates the append; direct-mode prompts
        // built from it never carry the pending question.
        self.sessions
            .append_message(url, ChatMessage::user(question))
            .await?;

        let (initial_prompts, input) = if wants_rag(&session.text) {
            let rag = rag.ok_or_else(|| {
                AmaError::Validation(format!("no retrieval pipeline for {}", url))
            })?;
            emit(Payload::StatusUpdate {
                message: "Thinking...".to_string(),
            });
            let context = rag.retrieve(question).await?;
            debug!(url, context_len = context.len(), "retrieved context");
            (
                vec![ChatMessage::user(format!(
                    "You are a helpful assistant. Answer based *only* on the provided text. Here is the text: {}\n\nMy question is: {}",
                    context, question
                ))],
                format!(
                    "Based on the following text, answer the question: \"{}\"\n\n---\n\n{}",
                    question, context
                ),
            )
        } else {
            let mut prompts = vec![ChatMessage::user(format!(
                "You are a helpful assistant. Answer based *only* on the provided text. Here is the text: {}\n\nMy question is: {}",
                session.text, question
            ))];
            // Earlier turns ride along; legacy "model" entries become "assistant".
            prompts.extend(session.chat_history.iter().map(|m| ChatMessage {
                role: if m.role == "model" {
                    "assistant".to_string()
                } else {
                    m.role.clone()
                },
                content: m.content.clone(),
            }));
            (prompts, question.to_string())
        };

        let mut model_session = self.model.create_session(initial_prompts).await?;
        let mut stream = model_session.stream_complete(&input).await?;

        let mut full_response = String::new();
        loop {
            tokio::select! {
                _ = cancelled(&mut cancel) => {
                    info!(url, "generation cancelled");
                    return Ok(StreamOutcome::Cancelled);
                }
                delta = stream.next() => match delta {
                    Some(Ok(chunk)) => {
                        emit(Payload::AmaChunk { chunk: chunk.clone() });
                        full_response.push_str(&chunk);
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
        }

        self.sessions
            .append_message(url, ChatMessage::assistant(full_response.clone()))
            .await?;

        Ok(StreamOutcome::Completed {
            response: full_response,
        })
    }
}

/// Resolves once the token is tripped; never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    loop {
        match rx.changed().await {
            Ok(()) => {
                if *rx.borrow() {
                    return;
                }
            }
            Err(_) => futures::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;

    use crate::model::{DeltaStream, GenerativeSession};
    use crate::session_store::Session;
    use crate::vector_store::VectorStore;

    /// Records the prompts it was created with and replays scripted deltas.
    struct ScriptedModel {
        deltas: Vec<String>,
        error_after: Option<String>,
        hang_after: bool,
        seen_prompts: Mutex<Vec<Vec<ChatMessage>>>,
        seen_inputs: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedModel {
        fn completing(deltas: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                deltas: deltas.iter().map(|d| d.to_string()).collect(),
                error_after: None,
                hang_after: false,
                seen_prompts: Mutex::new(Vec::new()),
                seen_inputs: Arc::new(Mutex::new(Vec::new())),
            })
        }

        fn hanging(deltas: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                deltas: deltas.iter().map(|d| d.to_string()).collect(),
                error_after: None,
                hang_after: true,
                seen_prompts: Mutex::new(Vec::new()),
                seen_inputs: Arc::new(Mutex::new(Vec::new())),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                deltas: Vec::new(),
                error_after: Some(message.to_string()),
                hang_after: false,
                seen_prompts: Mutex::new(Vec::new()),
                seen_inputs: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }

    struct ScriptedSession {
        deltas: Vec<String>,
        error_after: Option<String>,
        hang_after: bool,
        seen_inputs: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GenerativeSession for ScriptedSession {
        async fn stream_complete(&mut self, input: &str) -> Result<DeltaStream, AmaError> {
            self.seen_inputs.lock().unwrap().push(input.to_string());
            let mut items: Vec<Result<String, AmaError>> =
                self.deltas.iter().cloned().map(Ok).collect();
            if let Some(message) = &self.error_after {
                items.push(Err(AmaError::ModelUnavailable(message.clone())));
            }
            let scripted = stream::iter(items);
            Ok(if self.hang_after {
                scripted.chain(stream::pending()).boxed()
            } else {
                scripted.boxed()
            })
        }
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        async fn create_session(
            &self,
            initial_prompts: Vec<ChatMessage>,
        ) -> Result<Box<dyn GenerativeSession>, AmaError> {
            self.seen_prompts.lock().unwrap().push(initial_prompts);
            Ok(Box::new(ScriptedSession {
                deltas: self.deltas.clone(),
                error_after: self.error_after.clone(),
                hang_after: self.hang_after,
                seen_inputs: Arc::clone(&self.seen_inputs),
            }))
        }
    }

    async fn store_with(url: &str, text: &str, history: Vec<ChatMessage>) -> Arc<SessionStore> {
        let sessions = Arc::new(SessionStore::new());
        let mut session = Session::new(url);
        session.text = text.to_string();
        session.is_rag = wants_rag(text);
        session.chat_history = history;
        sessions.save(session).await;
        sessions
    }

    fn idle_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test body.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn direct_mode_streams_and_persists_the_exchange() {
        let url = "https://example.com/small";
        let sessions = store_with(
            url,
            "short document text",
            vec![
                ChatMessage {
                    role: "model".to_string(),
                    content: "legacy answer".to_string(),
                },
            ],
        )
        .await;
        let model = ScriptedModel::completing(&["Hel", "lo"]);
        let streamer = ChatStreamer::new(model.clone(), sessions.clone());

        let mut emitted = Vec::new();
        let outcome = streamer
            .answer(url, "what is this?", None, idle_cancel(), |p| {
                emitted.push(p)
            })
            .await
            .unwrap();

        match outcome {
            StreamOutcome::Completed { response } => assert_eq!(response, "Hello"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            emitted,
            vec![
                Payload::AmaChunk {
                    chunk: "Hel".to_string()
                },
                Payload::AmaChunk {
                    chunk: "lo".to_string()
                },
            ]
        );

        let prompts = model.seen_prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0][0].content.contains("short document text"));
        assert!(prompts[0][0].content.contains("what is this?"));
        // Legacy role normalized; pending question not in the seed prompts.
        assert_eq!(prompts[0][1].role, "assistant");
        assert_eq!(prompts[0].len(), 2);
        assert_eq!(model.seen_inputs.lock().unwrap()[0], "what is this?");

        let history = sessions.get(url).await.unwrap().chat_history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, "what is this?");
        assert_eq!(history[2].content, "Hello");
    }

    #[tokio::test]
    async fn large_documents_use_retrieval_prompts() {
        let url = "https://example.com/large";
        let big_text = "dogs fetch sticks outside. ".repeat(2000);
        assert!(wants_rag(&big_text));
        let sessions = store_with(url, &big_text, Vec::new()).await;

        struct OneHotEmbedder;
        #[async_trait]
        impl crate::model::Embedder for OneHotEmbedder {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, AmaError> {
                Ok(vec![1.0, 0.0])
            }
        }
        let store = VectorStore::new();
        let rag = Arc::new(
            RagPipeline::new(url, Arc::new(OneHotEmbedder), &store).unwrap(),
        );
        rag.init(&big_text, |_| {}).await.unwrap();

        let model = ScriptedModel::completing(&["ok"]);
        let streamer = ChatStreamer::new(model.clone(), sessions);

        let mut emitted = Vec::new();
        streamer
            .answer(url, "why sticks?", Some(rag), idle_cancel(), |p| {
                emitted.push(p)
            })
            .await
            .unwrap();

        assert_eq!(
            emitted[0],
            Payload::StatusUpdate {
                message: "Thinking...".to_string()
            }
        );
        let prompts = model.seen_prompts.lock().unwrap();
        // Single-turn: retrieved chunks, not the whole document, no history.
        assert_eq!(prompts[0].len(), 1);
        assert!(prompts[0][0].content.len() < big_text.len());
        assert!(prompts[0][0].content.contains("dogs fetch sticks"));
        let inputs = model.seen_inputs.lock().unwrap();
        assert!(inputs[0].starts_with("Based on the following text, answer the question: \"why sticks?\""));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_leaves_history_untouched() {
        let url = "https://example.com/cancel";
        let sessions = store_with(url, "tiny", Vec::new()).await;
        let model = ScriptedModel::hanging(&["first"]);
        let streamer = Arc::new(ChatStreamer::new(model, sessions.clone()));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = tokio::spawn({
            let streamer = Arc::clone(&streamer);
            async move {
                streamer
                    .answer(url, "q", None, cancel_rx, move |p| {
                        let _ = chunk_tx.send(p);
                    })
                    .await
            }
        });

        // Wait until the stream is live, then trip the token.
        let first = chunk_rx.recv().await.unwrap();
        assert!(matches!(first, Payload::AmaChunk { .. }));
        cancel_tx.send(true).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, StreamOutcome::Cancelled));
        // The question survives; no assistant entry does.
        let history = sessions.get(url).await.unwrap().chat_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test]
    async fn retrieval_failure_keeps_the_question() {
        let url = "https://example.com/rag-down";
        let big_text = "words all the way down. ".repeat(2000);
        let sessions = store_with(url, &big_text, Vec::new()).await;

        struct DownEmbedder;
        #[async_trait]
        impl crate::model::Embedder for DownEmbedder {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, AmaError> {
                Err(AmaError::ModelUnavailable("embedder offline".to_string()))
            }
        }
        let store = VectorStore::new();
        let rag = Arc::new(RagPipeline::new(url, Arc::new(DownEmbedder), &store).unwrap());

        let model = ScriptedModel::completing(&["never reached"]);
        let streamer = ChatStreamer::new(model, sessions.clone());
        let err = streamer
            .answer(url, "still there?", Some(rag), idle_cancel(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "MODEL_UNAVAILABLE");

        // Same history shape as any other failure: the question, nothing else.
        let history = sessions.get(url).await.unwrap().chat_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "still there?");
    }

    #[tokio::test]
    async fn model_failure_surfaces_and_persists_nothing() {
        let url = "https://example.com/fail";
        let sessions = store_with(url, "tiny", Vec::new()).await;
        let model = ScriptedModel::failing("weights not downloaded");
        let streamer = ChatStreamer::new(model, sessions.clone());

        let err = streamer
            .answer(url, "q", None, idle_cancel(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "MODEL_UNAVAILABLE");
        let history = sessions.get(url).await.unwrap().chat_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test]
    async fn unknown_session_is_a_validation_error() {
        let sessions = Arc::new(SessionStore::new());
        let model = ScriptedModel::completing(&[]);
        let streamer = ChatStreamer::new(model, sessions);
        let err = streamer
            .answer("https://nope", "q", None, idle_cancel(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");
    }
}
