//! The routing context: the only component that talks to every other one.
//!
//! Owns the tab -> document map and the per-document output buffers. Envelopes
//! are forwarded verbatim to the addressed side; answer deltas and status
//! lines for a document whose UI is backgrounded or disconnected accumulate in
//! that document's buffer and drain in one piece on reactivation. The worker
//! context is created lazily, exactly once, on the first envelope that needs
//! it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use crate::errors::AmaError;
use crate::protocol::{ComponentId, Envelope, Payload};
use crate::worker::{WorkerActor, WorkerDeps};

#[derive(Debug, Clone)]
struct TabState {
    url: String,
    foreground: bool,
}

/// Output held for a document while its UI is away.
#[derive(Debug, Default)]
struct DocumentBuffer {
    text: String,
    last_status: Option<String>,
    /// How the buffered generation ended, replayed on flush so the UI is
    /// never left waiting after a completion, cancellation or failure.
    terminal: Option<Payload>,
}

pub struct Router {
    deps: WorkerDeps,
    worker: OnceCell<mpsc::UnboundedSender<Envelope>>,
    ui: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    tabs: Mutex<HashMap<u64, TabState>>,
    buffers: Mutex<HashMap<String, DocumentBuffer>>,
}

impl Router {
    pub fn new(deps: WorkerDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            worker: OnceCell::new(),
            ui: Mutex::new(None),
            tabs: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the UI context. Buffers of already-foreground documents drain
    /// immediately so a reconnecting UI catches up.
    pub fn connect_ui(self: &Arc<Self>) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut ui) = self.ui.lock() {
            *ui = Some(tx);
        }
        let foreground_urls: Vec<String> = match self.tabs.lock() {
            Ok(tabs) => tabs
                .values()
                .filter(|t| t.foreground)
                .map(|t| t.url.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        for url in foreground_urls {
            self.flush_buffer(&url);
        }
        rx
    }

    pub fn disconnect_ui(&self) {
        if let Ok(mut ui) = self.ui.lock() {
            *ui = None;
        }
    }

    /// Decode an envelope arriving over the UI boundary and route it.
    pub async fn handle_ui_message(self: &Arc<Self>, raw: &str) -> Result<(), AmaError> {
        let envelope = Envelope::parse(raw)?;
        self.route(envelope).await;
        Ok(())
    }

    /// A tab came to the foreground showing `url`.
    pub async fn tab_activated(self: &Arc<Self>, tab_id: u64, url: &str) {
        let previous = {
            let mut tabs = match self.tabs.lock() {
                Ok(tabs) => tabs,
                Err(_) => return,
            };
            for tab in tabs.values_mut() {
                tab.foreground = false;
            }
            tabs.insert(
                tab_id,
                TabState {
                    url: url.to_string(),
                    foreground: true,
                },
            )
        };

        let changed_document = previous.as_ref().map(|p| p.url != url).unwrap_or(true);
        if let Some(previous) = previous {
            if previous.url != url {
                self.route(Envelope::new(
                    ComponentId::Router,
                    ComponentId::Worker,
                    previous.url,
                    Payload::TabDeactivated,
                ))
                .await;
            }
        }

        self.route(Envelope::new(
            ComponentId::Router,
            ComponentId::Worker,
            url,
            Payload::TabActivated,
        ))
        .await;
        if changed_document {
            self.route(Envelope::new(
                ComponentId::Router,
                ComponentId::Worker,
                url,
                Payload::StartProcessing,
            ))
            .await;
        }

        self.flush_buffer(url);
    }

    /// The tab left the foreground; its document keeps streaming into the buffer.
    pub async fn tab_deactivated(self: &Arc<Self>, tab_id: u64) {
        let url = match self.tabs.lock() {
            Ok(mut tabs) => match tabs.get_mut(&tab_id) {
                Some(tab) => {
                    tab.foreground = false;
                    tab.url.clone()
                }
                None => return,
            },
            Err(_) => return,
        };
        self.route(Envelope::new(
            ComponentId::Router,
            ComponentId::Worker,
            url,
            Payload::TabDeactivated,
        ))
        .await;
    }

    /// The tab is gone. The persisted session survives for the next visit.
    pub async fn tab_closed(self: &Arc<Self>, tab_id: u64) {
        let url = match self.tabs.lock() {
            Ok(mut tabs) => match tabs.remove(&tab_id) {
                Some(tab) => tab.url,
                None => return,
            },
            Err(_) => return,
        };
        self.route(Envelope::new(
            ComponentId::Router,
            ComponentId::Worker,
            url,
            Payload::TabDeactivated,
        ))
        .await;
    }

    pub async fn route(self: &Arc<Self>, envelope: Envelope) {
        if envelope.to == ComponentId::Worker {
            self.ensure_worker().await;
        }
        self.dispatch(envelope);
    }

    /// Deliver to an already-running context. The worker's outbound pump goes
    /// through here directly, so routing never awaits itself.
    fn dispatch(&self, envelope: Envelope) {
        match envelope.to {
            ComponentId::Worker => match self.worker.get() {
                Some(worker) => {
                    if worker.send(envelope).is_err() {
                        warn!("worker mailbox closed, dropping envelope");
                    }
                }
                None => warn!(url = %envelope.url, "worker not running, dropping envelope"),
            },
            ComponentId::Sidebar => self.deliver_to_sidebar(envelope),
            ComponentId::Router => {
                warn!(url = %envelope.url, "envelope addressed to the router itself, dropping")
            }
        }
    }

    /// Worker creation is single-flight: concurrent first uses await the same
    /// initialization and share one worker.
    async fn ensure_worker(self: &Arc<Self>) {
        self.worker
            .get_or_init(|| async {
                info!("starting worker context");
                let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
                let mailbox = WorkerActor::spawn(self.deps.clone(), outbound_tx);
                let router = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(envelope) = outbound_rx.recv().await {
                        router.dispatch(envelope);
                    }
                    debug!("worker outbound pump finished");
                });
                mailbox
            })
            .await;
    }

    fn deliver_to_sidebar(&self, envelope: Envelope) {
        let mut buffers = match self.buffers.lock() {
            Ok(buffers) => buffers,
            Err(_) => return,
        };

        if self.is_foreground(&envelope.url) && self.send_to_ui(envelope.clone()) {
            return;
        }

        match envelope.payload {
            Payload::AmaChunk { chunk } => {
                buffers
                    .entry(envelope.url)
                    .or_default()
                    .text
                    .push_str(&chunk);
            }
            Payload::StatusUpdate { message } => {
                buffers.entry(envelope.url).or_default().last_status = Some(message);
            }
            Payload::AmaComplete => {
                buffers.entry(envelope.url).or_default().terminal =
                    Some(Payload::AmaCompleteBuffered);
            }
            Payload::AmaTerminated => {
                buffers.entry(envelope.url).or_default().terminal = Some(Payload::AmaTerminated);
            }
            terminal @ Payload::Error { .. } => {
                buffers.entry(envelope.url).or_default().terminal = Some(terminal);
            }
            other => {
                debug!(url = %envelope.url, payload = ?other, "UI away, dropping payload");
            }
        }
    }

    /// Drain the document's buffer in one piece: the accumulated text as a
    /// single delta, the latest status, then the terminal marker. The buffer
    /// is only discarded once every message reached the UI, so a flush against
    /// a disconnected channel keeps the output for the next attempt.
    fn flush_buffer(&self, url: &str) {
        let mut buffers = match self.buffers.lock() {
            Ok(buffers) => buffers,
            Err(_) => return,
        };
        let buffer = match buffers.get(url) {
            Some(buffer) => buffer,
            None => return,
        };

        let mut delivered = true;
        if !buffer.text.is_empty() {
            delivered &= self.send_to_ui(Envelope::new(
                ComponentId::Router,
                ComponentId::Sidebar,
                url,
                Payload::AmaChunk {
                    chunk: buffer.text.clone(),
                },
            ));
        }
        if let Some(message) = buffer.last_status.clone() {
            delivered &= self.send_to_ui(Envelope::new(
                ComponentId::Router,
                ComponentId::Sidebar,
                url,
                Payload::StatusUpdate { message },
            ));
        }
        if let Some(terminal) = buffer.terminal.clone() {
            delivered &= self.send_to_ui(Envelope::new(
                ComponentId::Router,
                ComponentId::Sidebar,
                url,
                terminal,
            ));
        }

        if delivered {
            buffers.remove(url);
        }
    }

    fn is_foreground(&self, url: &str) -> bool {
        match self.tabs.lock() {
            Ok(tabs) => tabs.values().any(|t| t.foreground && t.url == url),
            Err(_) => false,
        }
    }

    fn send_to_ui(&self, envelope: Envelope) -> bool {
        let ui = match self.ui.lock() {
            Ok(ui) => ui,
            Err(_) => return false,
        };
        match ui.as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fakes::test_deps;

    #[tokio::test]
    async fn deltas_for_a_background_document_are_buffered() {
        let router = Router::new(test_deps());
        let mut ui = router.connect_ui();

        // No foreground tab shows this document, so the delta is held back.
        router
            .route(Envelope::new(
                ComponentId::Worker,
                ComponentId::Sidebar,
                "https://a",
                Payload::AmaChunk {
                    chunk: "hidden".to_string(),
                },
            ))
            .await;
        assert!(ui.try_recv().is_err(), "background delta must not reach the UI");
    }

    #[tokio::test]
    async fn envelopes_to_the_router_are_dropped() {
        let router = Router::new(test_deps());
        router
            .route(Envelope::new(
                ComponentId::Sidebar,
                ComponentId::Router,
                "https://a",
                Payload::TerminateChat,
            ))
            .await;
        // Nothing to assert beyond "does not panic or loop".
    }
}
