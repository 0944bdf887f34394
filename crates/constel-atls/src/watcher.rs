use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Something that refreshes itself when a watched file changes.
pub trait Updater: Send + Sync {
    fn update(&self) -> Result<()>;
}

/// What a file-system event means for the watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Update,
    /// The file was removed; the watch must be re-established.
    Rewatch,
    Ignore,
}

pub fn classify(kind: &EventKind) -> WatchAction {
    match kind {
        EventKind::Create(_) => WatchAction::Update,
        EventKind::Modify(
            ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Name(_) | ModifyKind::Any,
        ) => WatchAction::Update,
        EventKind::Remove(_) => WatchAction::Rewatch,
        _ => WatchAction::Ignore,
    }
}

/// Re-runs an [`Updater`] whenever the measurements file changes.
pub struct MeasurementWatcher {
    path: PathBuf,
    updater: Arc<dyn Updater>,
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl MeasurementWatcher {
    pub fn new(path: impl Into<PathBuf>, updater: Arc<dyn Updater>) -> Result<Self> {
        let path = path.into();
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .with_context(|| "Failed to create file watcher")?;
        watch_path(&mut watcher, &path)?;
        Ok(Self {
            path,
            updater,
            watcher,
            events,
        })
    }

    /// Process events until shutdown or the first watcher error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(path = %self.path.display(), "Watching measurements");
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            error!(error = %e, "File watcher failed");
                            return Err(e).with_context(|| {
                                format!("Watching {} failed", self.path.display())
                            });
                        }
                    };
                    self.handle(&event);
                }
                _ = shutdown.changed() => {
                    debug!("Measurement watcher shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn handle(&mut self, event: &Event) {
        match classify(&event.kind) {
            WatchAction::Update => {
                if let Err(e) = self.updater.update() {
                    warn!(error = %e, "Failed to update after file change");
                }
            }
            WatchAction::Rewatch => {
                if let Err(e) = watch_path(&mut self.watcher, &self.path) {
                    warn!(error = %e, "Failed to re-establish watch");
                }
            }
            WatchAction::Ignore => {}
        }
    }
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path) -> Result<()> {
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", path.display()))
}
