//! Target worker - owns one target tree and applies queued change events
//!
//! Each worker is a bounded multi-producer / single-consumer pipeline:
//! producers (initial scan, watcher dispatcher) block on `push` when the
//! queue is full, and the single apply task drains events strictly in
//! enqueue order. Closing the queue is the only termination signal; the
//! apply task finishes whatever is already queued before exiting.

mod apply;

use crate::config::Limits;
use crate::types::{ChangeEvent, MirrorError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use apply::ApplyContext;

/// Consumer of one target's event queue.
pub struct TargetWorker {
    source_root: PathBuf,
    target_root: PathBuf,
    tx: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
}

impl TargetWorker {
    /// Create the worker and start its apply task.
    ///
    /// The queue opens for writes immediately; events are applied to
    /// `target_root` in the order they are pushed.
    pub fn new(source_root: PathBuf, target_root: PathBuf, limits: Limits) -> Self {
        let (tx, rx) = mpsc::channel(limits.queue_capacity.max(1));
        let context = ApplyContext {
            target_root: target_root.clone(),
            copy_limiter: Arc::new(Semaphore::new(limits.copy_permits.max(1))),
            copy_buffer_bytes: limits.copy_buffer_bytes,
        };
        let apply_task = tokio::spawn(apply::run(context, rx));

        Self {
            source_root,
            target_root,
            tx: Mutex::new(Some(tx)),
            apply_task: Mutex::new(Some(apply_task)),
        }
    }

    /// Source tree this worker mirrors from.
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Target tree this worker owns.
    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    /// Enqueue one event, waiting while the queue is full.
    ///
    /// Fails only once the queue has been closed by `complete`/`stop`.
    pub async fn push(&self, event: ChangeEvent) -> Result<(), MirrorError> {
        let sender = match self.tx.lock().await.as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(MirrorError::QueueClosed),
        };
        sender.send(event).await.map_err(|_| MirrorError::QueueClosed)
    }

    /// Close the queue for writes. Queued events still get applied.
    pub async fn complete(&self) {
        self.tx.lock().await.take();
    }

    /// Close the queue and wait until every queued event has been applied.
    pub async fn stop(&self) {
        self.complete().await;
        let task = self.apply_task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!("apply task for {} failed: {err}", self.target_root.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn worker_for(source: &Path, target: &Path) -> TargetWorker {
        TargetWorker::new(source.to_path_buf(), target.to_path_buf(), Limits::default())
    }

    #[tokio::test]
    async fn test_apply_ensure_dir_and_copy() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");
        tokio::fs::write(src.path().join("a.txt"), b"hello")
            .await
            .expect("write source file");

        let worker = worker_for(src.path(), dst.path());
        worker
            .push(ChangeEvent::EnsureDir { rel: PathBuf::from("sub") })
            .await
            .expect("push ensure dir");
        worker
            .push(ChangeEvent::CopyFile {
                rel: PathBuf::from("sub/a.txt"),
                source: src.path().join("a.txt"),
            })
            .await
            .expect("push copy");
        worker.stop().await;

        assert!(dst.path().join("sub").is_dir());
        assert_eq!(
            std::fs::read(dst.path().join("sub/a.txt")).expect("read mirrored file"),
            b"hello"
        );
    }

    #[tokio::test]
    async fn test_copy_preserves_mtime() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");
        let source_file = src.path().join("stamp.txt");
        tokio::fs::write(&source_file, b"stamped").await.expect("write source file");

        let past = filetime::FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(&source_file, past).expect("set source mtime");

        let worker = worker_for(src.path(), dst.path());
        worker
            .push(ChangeEvent::CopyFile {
                rel: PathBuf::from("stamp.txt"),
                source: source_file.clone(),
            })
            .await
            .expect("push copy");
        worker.stop().await;

        let mirrored = std::fs::metadata(dst.path().join("stamp.txt")).expect("mirrored meta");
        assert_eq!(
            filetime::FileTime::from_last_modification_time(&mirrored),
            past
        );
    }

    #[tokio::test]
    async fn test_delete_events_are_idempotent() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");
        tokio::fs::create_dir(dst.path().join("dir")).await.expect("create dir");
        tokio::fs::write(dst.path().join("f.txt"), b"x").await.expect("write file");

        let worker = worker_for(src.path(), dst.path());
        // Deletion kind is unknown to the watcher, so both arrive for each
        // path; the second of each pair hits a missing entry.
        for _ in 0..2 {
            worker
                .push(ChangeEvent::DeleteFile { rel: PathBuf::from("f.txt") })
                .await
                .expect("push delete file");
            worker
                .push(ChangeEvent::DeleteDir { rel: PathBuf::from("f.txt") })
                .await
                .expect("push delete dir");
            worker
                .push(ChangeEvent::DeleteFile { rel: PathBuf::from("dir") })
                .await
                .expect("push delete file");
            worker
                .push(ChangeEvent::DeleteDir { rel: PathBuf::from("dir") })
                .await
                .expect("push delete dir");
        }
        worker.stop().await;

        assert!(!dst.path().join("f.txt").exists());
        assert!(!dst.path().join("dir").exists());
    }

    #[tokio::test]
    async fn test_type_transition_file_to_directory() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");
        tokio::fs::write(dst.path().join("entry"), b"was a file")
            .await
            .expect("write occupant");

        let worker = worker_for(src.path(), dst.path());
        worker
            .push(ChangeEvent::EnsureDir { rel: PathBuf::from("entry") })
            .await
            .expect("push ensure dir");
        worker.stop().await;

        assert!(dst.path().join("entry").is_dir());
    }

    #[tokio::test]
    async fn test_type_transition_directory_to_file() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");
        tokio::fs::write(src.path().join("entry"), b"now a file")
            .await
            .expect("write source file");
        tokio::fs::create_dir_all(dst.path().join("entry/nested"))
            .await
            .expect("create occupant dir");

        let worker = worker_for(src.path(), dst.path());
        worker
            .push(ChangeEvent::CopyFile {
                rel: PathBuf::from("entry"),
                source: src.path().join("entry"),
            })
            .await
            .expect("push copy");
        worker.stop().await;

        assert_eq!(
            std::fs::read(dst.path().join("entry")).expect("read replaced entry"),
            b"now a file"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_symlink_replaces_existing_entry() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");
        tokio::fs::write(dst.path().join("link"), b"occupant")
            .await
            .expect("write occupant");

        let worker = worker_for(src.path(), dst.path());
        worker
            .push(ChangeEvent::CreateSymlink {
                rel: PathBuf::from("link"),
                link_target: PathBuf::from("../elsewhere"),
                is_dir_link: false,
            })
            .await
            .expect("push symlink");
        worker.stop().await;

        let read = std::fs::read_link(dst.path().join("link")).expect("read link");
        assert_eq!(read, PathBuf::from("../elsewhere"));
    }

    #[tokio::test]
    async fn test_push_after_stop_fails() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");

        let worker = worker_for(src.path(), dst.path());
        worker.stop().await;

        let result = worker
            .push(ChangeEvent::EnsureDir { rel: PathBuf::from("late") })
            .await;
        assert!(matches!(result, Err(MirrorError::QueueClosed)));
        assert!(!dst.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_apply_error_does_not_stop_the_loop() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");

        let worker = worker_for(src.path(), dst.path());
        // Copy from a source that does not exist, then a valid event.
        worker
            .push(ChangeEvent::CopyFile {
                rel: PathBuf::from("broken.txt"),
                source: src.path().join("missing.txt"),
            })
            .await
            .expect("push failing copy");
        worker
            .push(ChangeEvent::EnsureDir { rel: PathBuf::from("after") })
            .await
            .expect("push ensure dir");
        worker.stop().await;

        assert!(!dst.path().join("broken.txt").exists());
        assert!(dst.path().join("after").is_dir(), "loop must survive apply errors");
    }

    #[tokio::test]
    async fn test_replaying_a_prefix_then_full_stream_is_idempotent() {
        let src = TempDir::new().expect("create src tempdir");
        let dst = TempDir::new().expect("create dst tempdir");
        tokio::fs::write(src.path().join("a.txt"), b"alpha").await.expect("write a");
        tokio::fs::write(src.path().join("b.txt"), b"beta").await.expect("write b");

        let stream = vec![
            ChangeEvent::EnsureDir { rel: PathBuf::from("d") },
            ChangeEvent::CopyFile {
                rel: PathBuf::from("d/a.txt"),
                source: src.path().join("a.txt"),
            },
            ChangeEvent::DeleteFile { rel: PathBuf::from("d/a.txt") },
            ChangeEvent::CopyFile {
                rel: PathBuf::from("b.txt"),
                source: src.path().join("b.txt"),
            },
        ];

        let worker = worker_for(src.path(), dst.path());
        // Prefix first, then the full stream again.
        for event in stream.iter().take(2).cloned() {
            worker.push(event).await.expect("push prefix event");
        }
        for event in stream.iter().cloned() {
            worker.push(event).await.expect("push stream event");
        }
        worker.stop().await;

        assert!(dst.path().join("d").is_dir());
        assert!(!dst.path().join("d/a.txt").exists());
        assert_eq!(std::fs::read(dst.path().join("b.txt")).expect("read b"), b"beta");
    }
}
