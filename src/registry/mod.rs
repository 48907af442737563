//! Session registry - lifecycle of sources, targets, workers, and watchers
//!
//! All session state lives behind one async mutex. The lock is held only
//! to mutate the maps and to snapshot references; scans, copies, watcher
//! disposal, and worker draining all run with the lock released.

use crate::config::Limits;
use crate::paths;
use crate::restore;
use crate::scanner;
use crate::types::MirrorError;
use crate::watcher::SourceWatcher;
use crate::worker::TargetWorker;
use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One live source with its mirroring machinery.
struct Session {
    workers: HashMap<PathBuf, Arc<TargetWorker>>,
    watcher: Option<SourceWatcher>,
    pending_scans: usize,
    /// Latch so exactly one scan-completion path builds the watcher.
    arming: bool,
    /// Incarnation stamp; scan completions from a session that was
    /// stopped and re-created must not touch its successor.
    epoch: u64,
    cancel: CancellationToken,
    started_at: DateTime<Local>,
}

impl Session {
    fn new(epoch: u64) -> Self {
        Self {
            workers: HashMap::new(),
            watcher: None,
            pending_scans: 0,
            arming: false,
            epoch,
            cancel: CancellationToken::new(),
            started_at: Local::now(),
        }
    }
}

/// Snapshot of one session for `list` output.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub source: PathBuf,
    pub targets: Vec<PathBuf>,
    pub watching: bool,
    pub started_at: DateTime<Local>,
}

/// Process-wide registry of mirroring sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<PathBuf, Session>>,
    limits: Limits,
    next_epoch: AtomicU64,
    /// Handle for background tasks and watchers; they hold it weakly and
    /// look sessions up by source path, so nothing keeps the registry
    /// alive but the owner.
    weak_self: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(limits: Limits) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
            next_epoch: AtomicU64::new(0),
            weak_self: weak.clone(),
        })
    }

    /// Register `targets` as mirrors of `source`.
    ///
    /// The whole call is rejected when the source is not a directory or
    /// when any target is the source or inside it. Individual targets
    /// that are not empty directories (and cannot be created) are logged
    /// and skipped; the rest proceed. Each accepted target gets a worker
    /// and an initial scan; the watcher arms once every scan of the
    /// session has completed. Returns the number of targets accepted.
    pub async fn add(&self, source: &Path, targets: &[PathBuf]) -> Result<usize, MirrorError> {
        let source = paths::normalize(source)?;
        match fs::metadata(&source).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => return Err(MirrorError::SourceNotADirectory { path: source }),
        }

        let mut requested = Vec::new();
        let mut seen = HashSet::new();
        for target in targets {
            let target = paths::normalize(target)?;
            if paths::is_subpath(&target, &source) {
                return Err(MirrorError::TargetInsideSource { target, source_path: source });
            }
            if seen.insert(target.clone()) {
                requested.push(target);
            }
        }

        let bound: HashSet<PathBuf> = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&source)
                .map(|session| session.workers.keys().cloned().collect())
                .unwrap_or_default()
        };

        let mut accepted = Vec::new();
        for target in requested {
            if bound.contains(&target) {
                info!("target {} already mirrors {}", target.display(), source.display());
                continue;
            }
            match ensure_empty_dir(&target).await {
                Ok(()) => accepted.push(target),
                Err(err) => warn!("skipping target {}: {err}", target.display()),
            }
        }
        if accepted.is_empty() {
            return Ok(0);
        }

        let mut scans = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(source.clone()).or_insert_with(|| {
                info!("new session for {}", source.display());
                Session::new(self.next_epoch.fetch_add(1, Ordering::Relaxed))
            });
            for target in &accepted {
                if session.workers.contains_key(target) {
                    continue;
                }
                let worker = Arc::new(TargetWorker::new(
                    source.clone(),
                    target.clone(),
                    self.limits,
                ));
                session.workers.insert(target.clone(), Arc::clone(&worker));
                session.pending_scans += 1;
                scans.push((target.clone(), worker, session.epoch, session.cancel.clone()));
            }
        }

        let count = scans.len();
        for (target, worker, epoch, cancel) in scans {
            let registry = self.weak_self.clone();
            let source = source.clone();
            tokio::spawn(async move {
                let result = scanner::scan(&source, &worker, &cancel).await;
                if let Some(registry) = registry.upgrade() {
                    registry.finish_scan(&source, &target, &worker, epoch, result).await;
                }
            });
        }
        Ok(count)
    }

    /// Completion callback of one target's initial scan.
    async fn finish_scan(
        &self,
        source: &Path,
        target: &Path,
        worker: &Arc<TargetWorker>,
        epoch: u64,
        result: Result<(), MirrorError>,
    ) {
        let mut failed_worker = None;
        let mut collapsed: Option<Session> = None;
        let mut arm = false;
        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(source) else {
                // Session ended while the scan ran; nothing left to update.
                return;
            };
            if session.epoch != epoch {
                // A successor session took this source over.
                return;
            }
            session.pending_scans = session.pending_scans.saturating_sub(1);

            if let Err(err) = result {
                match err {
                    MirrorError::Cancelled | MirrorError::QueueClosed => {
                        // Normal fallout of `end`/`stop` racing the scan.
                        info!("initial scan for {} stopped early", target.display());
                    }
                    err => error!(
                        "initial scan of {} for {} failed: {err}",
                        source.display(),
                        target.display()
                    ),
                }
                // Only unbind the exact worker this scan was feeding; the
                // target may have been ended and re-added meanwhile.
                if session
                    .workers
                    .get(target)
                    .is_some_and(|current| Arc::ptr_eq(current, worker))
                {
                    failed_worker = session.workers.remove(target);
                }
            }

            if session.workers.is_empty() && session.pending_scans == 0 {
                collapsed = sessions.remove(source);
            } else if session.pending_scans == 0
                && session.watcher.is_none()
                && !session.arming
            {
                session.arming = true;
                arm = true;
            }
        }

        if let Some(worker) = failed_worker {
            worker.stop().await;
        }
        if let Some(session) = collapsed {
            info!("session for {} is empty; removing it", source.display());
            dispose_session(session).await;
        }
        if arm {
            self.arm_watcher(source).await;
        }
    }

    /// Build the watcher outside the lock, then install it if the session
    /// still wants one.
    async fn arm_watcher(&self, source: &Path) {
        let cancel = {
            let sessions = self.sessions.lock().await;
            match sessions.get(source) {
                Some(session) => session.cancel.clone(),
                None => return,
            }
        };

        let armed = SourceWatcher::arm(source.to_path_buf(), self.weak_self.clone(), cancel);
        let leftover = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(source) {
                Some(session) => {
                    session.arming = false;
                    match armed {
                        Ok(watcher) => {
                            session.watcher = Some(watcher);
                            info!("watching {}", source.display());
                            None
                        }
                        Err(err) => {
                            error!("cannot watch {}: {err}", source.display());
                            None
                        }
                    }
                }
                // Session vanished while the watcher was being built.
                None => armed.ok(),
            }
        };
        if let Some(watcher) = leftover {
            watcher.dispose().await;
        }
    }

    /// Unbind `targets` from `source`, draining their queues.
    ///
    /// Removing the last target removes the session and its watcher.
    /// Returns the number of targets actually removed.
    pub async fn end(&self, source: &Path, targets: &[PathBuf]) -> Result<usize, MirrorError> {
        let source = paths::normalize(source)?;
        let mut requested = Vec::new();
        for target in targets {
            requested.push(paths::normalize(target)?);
        }

        let mut removed = Vec::new();
        let mut collapsed = None;
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(&source)
                .ok_or_else(|| MirrorError::SessionNotFound { path: source.clone() })?;
            for target in requested {
                match session.workers.remove(&target) {
                    Some(worker) => removed.push(worker),
                    None => warn!(
                        "{} is not a target of {}",
                        target.display(),
                        source.display()
                    ),
                }
            }
            if session.workers.is_empty() {
                collapsed = sessions.remove(&source);
            }
        }

        if let Some(session) = collapsed {
            info!("last target removed; session for {} ends", source.display());
            dispose_session(session).await;
        }
        for worker in &removed {
            worker.stop().await;
        }
        Ok(removed.len())
    }

    /// Stop the session for `source`, then rebuild the source from
    /// `target` (reverse mirror with orphan deletion).
    pub async fn restore(&self, source: &Path, target: &Path) -> Result<(), MirrorError> {
        let source = paths::normalize(source)?;
        let target = paths::normalize(target)?;

        self.stop_session(&source).await;
        restore::restore(&source, &target, self.limits, &CancellationToken::new()).await
    }

    /// Tear down one session completely; quietly a no-op when none exists.
    pub async fn stop_session(&self, source: &Path) {
        let session = self.sessions.lock().await.remove(source);
        if let Some(session) = session {
            info!("stopping session for {}", source.display());
            dispose_session(session).await;
        }
    }

    /// Snapshot of all sessions, sorted by source path.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(source, session)| {
                    let mut targets: Vec<PathBuf> = session.workers.keys().cloned().collect();
                    targets.sort();
                    SessionInfo {
                        source: source.clone(),
                        targets,
                        watching: session.watcher.is_some(),
                        started_at: session.started_at,
                    }
                })
                .collect()
        };
        infos.sort_by(|a, b| a.source.cmp(&b.source));
        infos
    }

    /// Stop every session and wait for all of them to drain.
    pub async fn stop_all(&self) {
        let drained: Vec<(PathBuf, Session)> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().collect()
        };
        for (source, session) in drained {
            info!("stopping session for {}", source.display());
            dispose_session(session).await;
        }
    }

    /// Snapshot of the workers mirroring `source`; used by the watcher
    /// dispatcher to broadcast outside the lock.
    pub(crate) async fn workers_for(&self, source: &Path) -> Vec<Arc<TargetWorker>> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(source)
            .map(|session| session.workers.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Cancel in-flight scans, stop the watcher, then drain every worker.
///
/// The order matters: the watcher goes first so no new events arrive
/// while the workers finish their queues.
async fn dispose_session(session: Session) {
    session.cancel.cancel();
    if let Some(watcher) = session.watcher {
        watcher.dispose().await;
    }
    for worker in session.workers.into_values() {
        worker.stop().await;
    }
}

/// A target must be an empty directory; missing ones are created.
async fn ensure_empty_dir(path: &Path) -> Result<(), MirrorError> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {
            let mut entries = fs::read_dir(path).await?;
            if entries.next_entry().await?.is_some() {
                return Err(MirrorError::TargetNotEmpty { path: path.to_path_buf() });
            }
            Ok(())
        }
        Ok(_) => Err(MirrorError::TargetUnavailable {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(path).await?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
