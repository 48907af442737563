//! Filesystem watcher adapter - turns OS notifications into change events
//!
//! The notify callback does no work of its own: it forwards each raw
//! result into an unbounded channel drained by one dispatcher task per
//! session. The dispatcher translates notify's event kinds into the
//! mirror's change events and pushes them to every worker of the session,
//! blocking on full queues like any other producer. A single dispatcher
//! keeps the enqueue order deterministic per worker.

use crate::paths;
use crate::registry::SessionRegistry;
use crate::scanner;
use crate::types::{ChangeEvent, MirrorError};
use crate::worker::TargetWorker;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Live subscription on one session's source tree.
pub struct SourceWatcher {
    watcher: RecommendedWatcher,
    dispatch_task: Option<JoinHandle<()>>,
}

impl SourceWatcher {
    /// Subscribe to recursive change notifications on `source` and start
    /// the dispatcher task.
    ///
    /// The dispatcher holds only a weak registry reference and looks the
    /// session up by source path on every event.
    pub fn arm(
        source: PathBuf,
        registry: Weak<SessionRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, MirrorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            // Keep the OS notification thread unblocked.
            let _ = tx.send(result);
        })?;
        watcher.watch(&source, RecursiveMode::Recursive)?;

        let dispatch_task = tokio::spawn(dispatch_loop(source, registry, cancel, rx));
        Ok(Self { watcher, dispatch_task: Some(dispatch_task) })
    }

    /// Stop watching and wait for the dispatcher to finish.
    pub async fn dispose(self) {
        // Dropping the notify watcher stops OS events and closes the
        // channel, which ends the dispatcher loop.
        drop(self.watcher);
        if let Some(task) = self.dispatch_task {
            if let Err(err) = task.await {
                tracing::error!("watch dispatcher failed: {err}");
            }
        }
    }
}

async fn dispatch_loop(
    source: PathBuf,
    registry: Weak<SessionRegistry>,
    cancel: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(result) => result,
                None => break,
            },
        };

        match result {
            Err(err) => warn!("watch stream error on {}: {err}", source.display()),
            Ok(event) => {
                let Some(registry) = registry.upgrade() else { break };
                if handle_event(&registry, &source, event, &cancel).await.is_break() {
                    break;
                }
            }
        }
    }
}

async fn handle_event(
    registry: &Arc<SessionRegistry>,
    source: &Path,
    event: Event,
    cancel: &CancellationToken,
) -> ControlFlow<()> {
    // A vanished source root ends the whole session. The stop runs on its
    // own task so it can dispose this dispatcher after the loop exits.
    if matches!(fs::try_exists(source).await, Ok(false)) {
        info!("source {} no longer exists; stopping session", source.display());
        let registry = Arc::clone(registry);
        let source = source.to_path_buf();
        tokio::spawn(async move {
            registry.stop_session(&source).await;
        });
        return ControlFlow::Break(());
    }

    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => {
            for path in &event.paths {
                upsert(registry, source, path).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            renamed(registry, source, &event.paths[0], &event.paths[1], cancel).await;
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                removed(registry, source, path).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                upsert(registry, source, path).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Unpaired rename halves: resolve by what is live on disk now.
            for path in &event.paths {
                if fs::symlink_metadata(path).await.is_ok() {
                    upsert(registry, source, path).await;
                } else {
                    removed(registry, source, path).await;
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                removed(registry, source, path).await;
            }
        }
        // Access notifications carry no tree changes.
        _ => {}
    }
    ControlFlow::Continue(())
}

/// Mirror whatever now lives at `full_path`, by its on-disk kind.
async fn upsert(registry: &Arc<SessionRegistry>, source: &Path, full_path: &Path) {
    let Some(rel) = relative_to(source, full_path) else { return };
    let Ok(metadata) = fs::symlink_metadata(full_path).await else {
        // Already gone again; a delete notification will follow.
        return;
    };

    let workers = registry.workers_for(source).await;
    if metadata.file_type().is_symlink() {
        let Ok(link) = fs::read_link(full_path).await else { return };
        let is_dir_link = fs::metadata(full_path).await.map(|m| m.is_dir()).unwrap_or(false);
        for worker in &workers {
            let link_target =
                paths::rewrite_link_target(&link, worker.source_root(), worker.target_root());
            push(worker, ChangeEvent::CreateSymlink {
                rel: rel.clone(),
                link_target,
                is_dir_link,
            })
            .await;
        }
    } else if metadata.is_dir() {
        for worker in &workers {
            push(worker, ChangeEvent::EnsureDir { rel: rel.clone() }).await;
        }
    } else {
        for worker in &workers {
            push(worker, ChangeEvent::CopyFile {
                rel: rel.clone(),
                source: full_path.to_path_buf(),
            })
            .await;
        }
    }
}

/// The entry's former kind is unknown, so both delete flavors go out; the
/// apply side's unified removal makes the pair idempotent.
async fn removed(registry: &Arc<SessionRegistry>, source: &Path, full_path: &Path) {
    let Some(rel) = relative_to(source, full_path) else { return };
    let workers = registry.workers_for(source).await;
    for worker in &workers {
        push(worker, ChangeEvent::DeleteFile { rel: rel.clone() }).await;
        push(worker, ChangeEvent::DeleteDir { rel: rel.clone() }).await;
    }
}

async fn renamed(
    registry: &Arc<SessionRegistry>,
    source: &Path,
    old_full: &Path,
    new_full: &Path,
    cancel: &CancellationToken,
) {
    let (Some(old_rel), Some(new_rel)) =
        (relative_to(source, old_full), relative_to(source, new_full))
    else {
        return;
    };

    let workers = registry.workers_for(source).await;
    for worker in &workers {
        push(worker, ChangeEvent::DeleteFile { rel: old_rel.clone() }).await;
        push(worker, ChangeEvent::DeleteDir { rel: old_rel.clone() }).await;
    }

    let Ok(metadata) = fs::symlink_metadata(new_full).await else { return };
    if metadata.file_type().is_symlink() {
        let Ok(link) = fs::read_link(new_full).await else { return };
        let is_dir_link = fs::metadata(new_full).await.map(|m| m.is_dir()).unwrap_or(false);
        for worker in &workers {
            let link_target =
                paths::rewrite_link_target(&link, worker.source_root(), worker.target_root());
            push(worker, ChangeEvent::CreateSymlink {
                rel: new_rel.clone(),
                link_target,
                is_dir_link,
            })
            .await;
        }
    } else if metadata.is_dir() {
        for worker in &workers {
            push(worker, ChangeEvent::EnsureDir { rel: new_rel.clone() }).await;
            // Children moved in with the rename never get their own
            // notifications; rescan the subtree to pick them up.
            if let Err(err) = scanner::scan_subtree(source, new_full, worker, cancel).await {
                debug!("subtree rescan of {} ended early: {err}", new_full.display());
            }
        }
    } else {
        for worker in &workers {
            push(worker, ChangeEvent::CopyFile {
                rel: new_rel.clone(),
                source: new_full.to_path_buf(),
            })
            .await;
        }
    }
}

/// Relative path of `full_path` under `root`, or `None` when it escapes
/// the root or is the root itself.
fn relative_to(root: &Path, full_path: &Path) -> Option<PathBuf> {
    let rel = paths::clean(full_path).strip_prefix(root).ok()?.to_path_buf();
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel)
}

/// Push with the same backpressure as any producer; a closed queue only
/// means the worker ended mid-flight.
async fn push(worker: &Arc<TargetWorker>, event: ChangeEvent) {
    if let Err(err) = worker.push(event).await {
        debug!("dropping event for {}: {err}", worker.target_root().display());
    }
}
