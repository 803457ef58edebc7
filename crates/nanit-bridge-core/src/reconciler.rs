//! Stream Reconciler.
//!
//! Keeps each camera's "streaming active" flag honest against what the local
//! ingest server actually receives. Publish events mark activity, unpublish
//! events clear the flag, and a periodic sweep resets any camera that has
//! been flagged active but silent for longer than the stale window.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::StreamController;
use crate::config::Timings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    Publish(String),
    Unpublish(String),
}

/// Camera id from an ingest path such as `/live/<camera>` or
/// `rtmp://host:1935/live/<camera>`.
pub fn camera_from_path(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once("/live/")?;
    let camera = rest.split(['/', '?']).next()?;
    (!camera.is_empty()).then_some(camera)
}

/// Handed to the ingest server integration; reports publish/unpublish by path.
#[derive(Debug, Clone)]
pub struct IngestNotifier {
    events: mpsc::UnboundedSender<IngestEvent>,
}

impl IngestNotifier {
    pub fn on_publish(&self, path: &str) {
        self.notify(path, IngestEvent::Publish);
    }

    pub fn on_unpublish(&self, path: &str) {
        self.notify(path, IngestEvent::Unpublish);
    }

    fn notify(&self, path: &str, event: fn(String) -> IngestEvent) {
        let Some(camera) = camera_from_path(path) else {
            warn!(path, "Ignoring ingest event for unrecognised path");
            return;
        };
        if self.events.send(event(camera.to_string())).is_err() {
            debug!(path, "Reconciler stopped, dropping ingest event");
        }
    }
}

pub struct StreamReconciler {
    controller: StreamController,
    stale_window: Duration,
    sweep_interval: Duration,
}

impl StreamReconciler {
    pub fn new(controller: StreamController, timings: &Timings) -> Self {
        Self {
            controller,
            stale_window: timings.stale_stream_window(),
            sweep_interval: timings.sweep_interval(),
        }
    }

    pub async fn handle_event(&self, event: IngestEvent) {
        match event {
            IngestEvent::Publish(camera) => {
                info!(camera = %camera, "Stream published");
                self.controller.record_activity(&camera, Instant::now()).await;
            }
            IngestEvent::Unpublish(camera) => {
                info!(camera = %camera, "Stream unpublished");
                self.controller.record_stream_ended(&camera).await;
            }
        }
    }

    /// Reset every stream silent for longer than the stale window
    pub async fn sweep(&self) -> Vec<String> {
        let stalled = self
            .controller
            .sweep_stalled(Instant::now(), self.stale_window)
            .await;
        if !stalled.is_empty() {
            info!(cameras = ?stalled, "Reset stalled streams");
        }
        stalled
    }

    /// Run the reconciler on its own task.
    pub fn spawn(self) -> ReconcilerHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(events_rx, shutdown_rx));
        ReconcilerHandle {
            notifier: IngestNotifier { events: events_tx },
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<IngestEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        let mut events_open = true;
        debug!(
            sweep_secs = self.sweep_interval.as_secs(),
            stale_secs = self.stale_window.as_secs(),
            "Stream reconciler started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => events_open = false,
                },
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        debug!("Stream reconciler stopped");
    }
}

pub struct ReconcilerHandle {
    notifier: IngestNotifier,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn notifier(&self) -> IngestNotifier {
        self.notifier.clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}
