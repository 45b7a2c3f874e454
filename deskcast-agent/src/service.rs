//! Agent service core logic.
//!
//! Accepts one viewer at a time. Each viewer gets its own capture
//! pipeline whose payloads and metrics are forwarded over the
//! connection, while the viewer's display selection and keyframe
//! requests are fed back into the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use deskcast_core::capture::{create_backend, create_display_source};
use deskcast_core::transport::ViewerConnection;
use deskcast_core::{
    CapturePipeline, DeskcastError, DisplayInfo, DisplayRegistry, DisplaySource, Message,
    PipelineHandle, Result,
};

use crate::config::AgentConfig;

// ── AgentService ─────────────────────────────────────────────────

/// The top-level agent service.
pub struct AgentService {
    config: AgentConfig,
    source: Arc<dyn DisplaySource>,
    displays: Arc<DisplayRegistry>,
    /// Bumped whenever the display list changes.
    display_generation: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl AgentService {
    /// Create the service and select the configured display.
    pub fn new(config: AgentConfig) -> Self {
        let source = create_display_source(config.capture.backend);
        let displays = Arc::new(DisplayRegistry::new(Arc::clone(&source)));
        if let Some(name) = &config.capture.display {
            if let Err(e) = displays.select(name) {
                warn!("configured display unavailable: {e}; using primary");
            }
        }
        let (display_generation, _) = watch::channel(0);
        Self {
            config,
            source,
            displays,
            display_generation,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the service when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn displays(&self) -> &Arc<DisplayRegistry> {
        &self.displays
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.network.listen_addr).await?;
        info!("deskcast agent listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve viewers from an already bound listener until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let poller = tokio::spawn(poll_displays(
            Arc::clone(&self.source),
            Arc::clone(&self.displays),
            self.display_generation.clone(),
            self.config.display_poll_interval(),
            self.cancel.child_token(),
        ));

        loop {
            let accept = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = listener.accept() => result,
            };
            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            info!("viewer connected from {peer}");
            match self.serve_viewer(stream).await {
                Ok(()) => info!("session with {peer} ended"),
                Err(e) => warn!("session with {peer} failed: {e}"),
            }
        }

        self.cancel.cancel();
        let _ = poller.await;
        info!("deskcast agent stopped");
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn serve_viewer(&self, stream: TcpStream) -> Result<()> {
        let pipeline_config = self.config.to_pipeline_config();
        let backend = create_backend(self.config.capture.backend, &pipeline_config.capture)?;
        let (pipeline, mut frames) =
            CapturePipeline::new(pipeline_config, backend, Arc::clone(&self.displays))?;
        let handle = pipeline.handle();
        let mut metrics = handle.subscribe_metrics();
        let mut display_changes = self.display_generation.subscribe();

        let session = self.cancel.child_token();
        let capture = pipeline.start(session.clone());

        let (tx, mut rx) = ViewerConnection::new(stream).into_split();
        let send = |message: Message| {
            let tx = tx.clone();
            async move { tx.send(message).await.map_err(|_| DeskcastError::ChannelClosed) }
        };

        let result: Result<()> = async {
            send(Message::Displays(handle.displays())).await?;
            loop {
                tokio::select! {
                    _ = session.cancelled() => return Ok(()),
                    frame = frames.recv() => match frame {
                        Some(region) => send(Message::Region(region)).await?,
                        None => return Ok(()),
                    },
                    snapshot = metrics.recv() => match snapshot {
                        Ok(snapshot) => send(Message::Metrics(snapshot)).await?,
                        Err(broadcast::error::RecvError::Lagged(n)) => debug!("skipped {n} metrics snapshots"),
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    },
                    changed = display_changes.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        send(Message::Displays(handle.displays())).await?;
                    }
                    message = rx.recv() => match message {
                        Some(message) => handle_viewer_message(&handle, message),
                        None => {
                            info!("viewer disconnected");
                            return Ok(());
                        }
                    },
                }
            }
        }
        .await;

        session.cancel();
        match capture.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("capture pipeline error: {e}"),
            Err(e) => error!("capture task failed: {e}"),
        }
        result
    }
}

fn handle_viewer_message(handle: &PipelineHandle, message: Message) {
    match message {
        Message::SelectDisplay(name) => {
            if let Err(e) = handle.select_display(&name) {
                warn!("viewer selected an unknown display: {e}");
            }
        }
        Message::RequestKeyframe => handle.request_keyframe(),
        other => debug!(kind = %other.kind(), "ignoring viewer message"),
    }
}

/// Re-read the display list periodically and treat any difference as a
/// display-settings change.
async fn poll_displays(
    source: Arc<dyn DisplaySource>,
    displays: Arc<DisplayRegistry>,
    generation: watch::Sender<u64>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current: Vec<DisplayInfo> = match source.enumerate() {
            Ok(current) => current,
            Err(e) => {
                debug!("display poll failed: {e}");
                continue;
            }
        };
        if current != displays.displays() {
            displays.handle_display_settings_changed();
            generation.send_modify(|g| *g += 1);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
