//! The worker context: exclusive owner of session records, vector collections
//! and model access.
//!
//! Runs as a single actor over an mpsc mailbox. Document processing happens
//! inline (it is the only thing the document needs at that point); question
//! answering is spawned per request so `terminate-chat` is handled promptly
//! while a generation streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat_streamer::{wants_rag, ChatStreamer, StreamOutcome};
use crate::errors::AmaError;
use crate::model::{DocumentFetcher, Embedder, GenerativeModel, TextExtractor};
use crate::protocol::{ComponentId, Envelope, Payload};
use crate::rag_pipeline::RagPipeline;
use crate::session_store::SessionStore;
use crate::vector_store::VectorStore;

/// External collaborators the worker drives.
#[derive(Clone)]
pub struct WorkerDeps {
    pub embedder: Arc<dyn Embedder>,
    pub model: Arc<dyn GenerativeModel>,
    pub fetcher: Arc<dyn DocumentFetcher>,
    pub extractor: Arc<dyn TextExtractor>,
}

struct PendingGeneration {
    generation_id: Uuid,
    cancel: watch::Sender<bool>,
}

pub struct WorkerActor {
    deps: WorkerDeps,
    sessions: Arc<SessionStore>,
    vectors: Arc<VectorStore>,
    pipelines: HashMap<String, Arc<RagPipeline>>,
    pending: Arc<Mutex<HashMap<String, PendingGeneration>>>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl WorkerActor {
    /// Spawn the worker task. Envelopes sent on the returned sender are the
    /// worker's mailbox; everything it produces goes out on `outbound`.
    pub fn spawn(
        deps: WorkerDeps,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> mpsc::UnboundedSender<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = WorkerActor {
            deps,
            sessions: Arc::new(SessionStore::new()),
            vectors: Arc::new(VectorStore::new()),
            pipelines: HashMap::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound,
        };
        tokio::spawn(actor.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        info!("worker started");
        while let Some(envelope) = rx.recv().await {
            self.handle(envelope).await;
        }
        info!("worker mailbox closed, shutting down");
    }

    async fn handle(&mut self, envelope: Envelope) {
        let url = envelope.url.clone();
        match envelope.payload {
            Payload::StartProcessing => {
                if let Err(e) = self.process_document(&url).await {
                    error!(url = %url, code = e.error_code(), "processing failed: {}", e);
                    self.send(Envelope::error(&url, e.to_string()));
                }
            }
            Payload::AskQuestion { question } => self.ask(url, question).await,
            Payload::TerminateChat => {
                let pending = self.pending.lock().ok();
                match pending.as_ref().and_then(|p| p.get(&url)) {
                    Some(generation) => {
                        info!(url = %url, id = %generation.generation_id, "terminating generation");
                        let _ = generation.cancel.send(true);
                    }
                    None => debug!(url = %url, "terminate-chat with nothing in flight"),
                }
            }
            Payload::TabActivated => debug!(url = %url, "tab activated"),
            Payload::TabDeactivated => debug!(url = %url, "tab deactivated"),
            other => warn!(url = %url, payload = ?other, "unexpected payload for worker"),
        }
    }

    /// Load (or fetch and extract) the document, pick the conversation mode,
    /// index it when needed, and tell the UI it can chat.
    async fn process_document(&mut self, url: &str) -> Result<(), AmaError> {
        let mut session = self.sessions.get_or_create(url).await;

        if session.text.is_empty() {
            session.ui_state = "Processing document...".to_string();
            self.sessions.save(session.clone()).await;
            self.status(url, "Processing document...");

            let bytes = self.deps.fetcher.fetch(url).await?;
            if bytes.is_empty() {
                return Err(AmaError::Validation("Fetched document is empty.".to_string()));
            }
            session.text = self.deps.extractor.extract(&bytes).await?;
        } else {
            // Extracted text survives reprocessing; only the mode and the
            // index are refreshed.
            debug!(url, "reusing extracted text");
        }

        session.is_rag = wants_rag(&session.text);
        session.ui_state = "Ready to chat.".to_string();
        self.sessions.save(session.clone()).await;

        if session.is_rag {
            self.status(url, "Initializing RAG pipeline...");
            let rag = self.pipeline_for(url)?;
            let outbound = self.outbound.clone();
            let progress_url = url.to_string();
            rag.init(&session.text, |message| {
                let _ = outbound.send(Envelope::status(&progress_url, message));
            })
            .await?;
        }

        self.status(url, "Ready to chat.");
        self.send(Envelope::new(
            ComponentId::Worker,
            ComponentId::Sidebar,
            url,
            Payload::InitChat {
                history: session.chat_history,
                ui_state: session.ui_state,
            },
        ));
        Ok(())
    }

    /// Cancel whatever is in flight for this document and stream the answer
    /// in its own task so the mailbox stays responsive.
    async fn ask(&mut self, url: String, question: String) {
        let rag = match self.sessions.get(&url).await {
            Some(session) if session.is_rag => match self.pipeline_for(&url) {
                Ok(rag) => Some(rag),
                Err(e) => {
                    self.send(Envelope::error(&url, e.to_string()));
                    return;
                }
            },
            _ => None,
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let generation_id = Uuid::new_v4();
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.insert(
                url.clone(),
                PendingGeneration {
                    generation_id,
                    cancel: cancel_tx,
                },
            ) {
                info!(url = %url, id = %previous.generation_id, "superseding in-flight generation");
                let _ = previous.cancel.send(true);
            }
        }

        let streamer = ChatStreamer::new(Arc::clone(&self.deps.model), Arc::clone(&self.sessions));
        let outbound = self.outbound.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let emit_url = url.clone();
            let emit_outbound = outbound.clone();
            let result = streamer
                .answer(&url, &question, rag, cancel_rx, move |payload| {
                    let _ = emit_outbound.send(Envelope::new(
                        ComponentId::Worker,
                        ComponentId::Sidebar,
                        &emit_url,
                        payload,
                    ));
                })
                .await;

            let terminal = match result {
                Ok(StreamOutcome::Completed { .. }) => Payload::AmaComplete,
                Ok(StreamOutcome::Cancelled) => Payload::AmaTerminated,
                Err(e) => {
                    error!(url = %url, code = e.error_code(), "generation failed: {}", e);
                    Payload::Error {
                        message: format!("AI Error: {}", e),
                    }
                }
            };
            let _ = outbound.send(Envelope::new(
                ComponentId::Worker,
                ComponentId::Sidebar,
                &url,
                terminal,
            ));

            // Only clear our own entry; a newer ask may have replaced it.
            if let Ok(mut pending) = pending.lock() {
                if pending
                    .get(&url)
                    .map(|g| g.generation_id == generation_id)
                    .unwrap_or(false)
                {
                    pending.remove(&url);
                }
            }
        });
    }

    fn pipeline_for(&mut self, url: &str) -> Result<Arc<RagPipeline>, AmaError> {
        if let Some(existing) = self.pipelines.get(url) {
            return Ok(Arc::clone(existing));
        }
        let rag = Arc::new(RagPipeline::new(
            url,
            Arc::clone(&self.deps.embedder),
            &self.vectors,
        )?);
        self.pipelines.insert(url.to_string(), Arc::clone(&rag));
        Ok(rag)
    }

    fn status(&self, url: &str, message: &str) {
        self.send(Envelope::status(url, message));
    }

    fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            warn!("outbound channel closed, dropping envelope");
        }
    }
}
